//! Keeps one live "screen" message per user and edits it in place.

use anyhow::{Result, anyhow};
use tracing::{debug, warn};

use vpnshop_db::Store;
use vpnshop_db::models::session::{FlowState, PayloadPatch};
use vpnshop_db::models::user::User;

use crate::transport::{Screen, Transport, TransportError};

/// Where the screen lives and how to remember a new one.
#[derive(Debug, Clone, Copy)]
pub struct Target {
    pub tg_id: i64,
    pub chat_id: i64,
    /// State to keep while persisting a changed message id.
    pub state: FlowState,
    pub stored_id: Option<i32>,
    /// Message the triggering button was pressed on, if any.
    pub origin_id: Option<i32>,
}

impl Target {
    fn candidates(&self) -> Vec<i32> {
        let mut ids = Vec::with_capacity(2);
        if let Some(id) = self.stored_id {
            ids.push(id);
        }
        if let Some(id) = self.origin_id {
            if !ids.contains(&id) {
                ids.push(id);
            }
        }
        ids
    }
}

/// Shows `screen` as the user's single screen and returns its message id.
///
/// Candidates are edited in order; `NotModified` counts as success. When no
/// candidate can be edited a new message is sent. Only the send failing is an
/// error.
pub async fn render(
    store: &dyn Store,
    transport: &dyn Transport,
    target: Target,
    screen: &Screen,
) -> Result<i32> {
    for id in target.candidates() {
        match transport.edit_message(target.chat_id, id, screen).await {
            Ok(()) | Err(TransportError::NotModified) => {
                remember(store, &target, id).await;
                return Ok(id);
            }
            Err(e) => {
                debug!(tg_id = target.tg_id, message_id = id, "screen edit failed: {}", e);
            }
        }
    }

    let id = transport
        .send_message(target.chat_id, screen)
        .await
        .map_err(|e| anyhow!("failed to send screen to {}: {}", target.chat_id, e))?;
    remember(store, &target, id).await;
    Ok(id)
}

async fn remember(store: &dyn Store, target: &Target, id: i32) {
    if target.stored_id == Some(id) {
        return;
    }
    if let Err(e) = store
        .set_state_payload(target.tg_id, target.state, PayloadPatch::screen(id))
        .await
    {
        warn!(tg_id = target.tg_id, "failed to persist screen id {}: {:#}", id, e);
    }
}

/// Renders onto another user's screen, e.g. a customer notified of an admin
/// decision. Only the stored id is tried.
pub async fn render_for_user(
    store: &dyn Store,
    transport: &dyn Transport,
    user: &User,
    screen: &Screen,
) -> Result<i32> {
    let (state, stored_id) = match store.load_user_with_session(user.tg_id).await? {
        Some(account) => (account.session.state, account.session.payload.ui.screen_message_id),
        None => (FlowState::Menu, None),
    };
    render(
        store,
        transport,
        Target {
            tg_id: user.tg_id,
            chat_id: user.chat_id,
            state,
            stored_id,
            origin_id: None,
        },
        screen,
    )
    .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::recording::RecordingTransport;
    use vpnshop_db::MemoryStore;
    use vpnshop_db::models::user::Contact;

    async fn seeded() -> (MemoryStore, RecordingTransport) {
        let store = MemoryStore::new();
        store
            .upsert_user(
                &Contact {
                    tg_id: 1,
                    chat_id: 1,
                    username: None,
                },
                None,
            )
            .await
            .unwrap();
        (store, RecordingTransport::new())
    }

    async fn stored_id(store: &MemoryStore) -> Option<i32> {
        store
            .load_user_with_session(1)
            .await
            .unwrap()
            .unwrap()
            .session
            .payload
            .ui
            .screen_message_id
    }

    fn target(stored_id: Option<i32>, origin_id: Option<i32>) -> Target {
        Target {
            tg_id: 1,
            chat_id: 1,
            state: FlowState::Menu,
            stored_id,
            origin_id,
        }
    }

    #[tokio::test]
    async fn rendering_twice_keeps_one_message() {
        let (store, t) = seeded().await;
        let screen = Screen::text("menu");

        let first = render(&store, &t, target(None, None), &screen).await.unwrap();
        let second = render(&store, &t, target(stored_id(&store).await, None), &screen)
            .await
            .unwrap();

        assert_eq!(first, second);
        assert_eq!(t.live_messages(1).len(), 1);
        assert_eq!(stored_id(&store).await, Some(first));
    }

    #[tokio::test]
    async fn falls_back_to_origin_then_send() {
        let (store, t) = seeded().await;
        let origin = t.send_message(1, &Screen::text("old")).await.unwrap();

        let id = render(&store, &t, target(Some(9999), Some(origin)), &Screen::text("new"))
            .await
            .unwrap();
        assert_eq!(id, origin);
        assert_eq!(stored_id(&store).await, Some(origin));

        t.forget(1, origin);
        let fresh = render(&store, &t, target(Some(origin), Some(origin)), &Screen::text("x"))
            .await
            .unwrap();
        assert_ne!(fresh, origin);
        assert_eq!(stored_id(&store).await, Some(fresh));
    }

    #[tokio::test]
    async fn persisting_screen_keeps_state() {
        let (store, t) = seeded().await;
        store
            .set_state_cleared(1, FlowState::SupportWait)
            .await
            .unwrap();
        let mut tgt = target(None, None);
        tgt.state = FlowState::SupportWait;
        render(&store, &t, tgt, &Screen::text("write")).await.unwrap();

        let account = store.load_user_with_session(1).await.unwrap().unwrap();
        assert_eq!(account.session.state, FlowState::SupportWait);
    }

    #[tokio::test]
    async fn send_failure_is_an_error() {
        let (store, t) = seeded().await;
        t.fail_sends(1);
        assert!(render(&store, &t, target(None, None), &Screen::text("x")).await.is_err());
    }
}
