use std::future::Future;

use tracing::{debug, warn};

use crate::transport::{Transport, TransportResult};

/// Runs a transport call whose failure must not affect the flow. Benign
/// failures are dropped at debug level; anything else is logged at warn.
pub async fn best_effort<T, F>(what: &str, fut: F) -> Option<T>
where
    F: Future<Output = TransportResult<T>>,
{
    match fut.await {
        Ok(value) => Some(value),
        Err(e) if e.is_benign() => {
            debug!("{} skipped: {}", what, e);
            None
        }
        Err(e) => {
            warn!("{} failed: {}", what, e);
            None
        }
    }
}

/// How a button press is acknowledged.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum Ack {
    #[default]
    Silent,
    Text(String),
    Alert(String),
}

impl Ack {
    pub fn text(text: impl Into<String>) -> Self {
        Ack::Text(text.into())
    }

    pub fn alert(text: impl Into<String>) -> Self {
        Ack::Alert(text.into())
    }
}

/// Answers the callback query; errors are best-effort.
pub async fn acknowledge(transport: &dyn Transport, callback_id: &str, ack: Ack) {
    let (text, alert) = match &ack {
        Ack::Silent => (None, false),
        Ack::Text(t) => (Some(t.as_str()), false),
        Ack::Alert(t) => (Some(t.as_str()), true),
    };
    best_effort("answer callback", transport.answer_callback(callback_id, text, alert)).await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::TransportError;
    use crate::transport::recording::RecordingTransport;

    #[tokio::test]
    async fn best_effort_swallows_every_failure() {
        let gone: Option<()> = best_effort("delete", async { Err(TransportError::Gone) }).await;
        assert!(gone.is_none());
        let net: Option<()> =
            best_effort("send", async { Err(TransportError::Network("timeout".into())) }).await;
        assert!(net.is_none());
        assert_eq!(best_effort("send", async { Ok(5) }).await, Some(5));
    }

    #[tokio::test]
    async fn alert_ack_sets_flag() {
        let t = RecordingTransport::new();
        acknowledge(&t, "cb1", Ack::alert("nope")).await;
        acknowledge(&t, "cb2", Ack::Silent).await;
        let answers = t.answers();
        assert_eq!(answers.len(), 2);
        assert!(answers[0].alert);
        assert_eq!(answers[0].text.as_deref(), Some("nope"));
        assert_eq!(answers[1].text, None);
    }
}
