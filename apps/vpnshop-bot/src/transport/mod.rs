//! Messaging surface the flows talk to. The production implementation wraps
//! teloxide; tests use [`recording::RecordingTransport`].

use async_trait::async_trait;

pub mod recording;
pub mod telegram;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ParseMode {
    #[default]
    Plain,
    Html,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Button {
    Callback { text: String, data: String },
    Url { text: String, url: String },
}

impl Button {
    pub fn callback(text: impl Into<String>, data: impl ToString) -> Self {
        Button::Callback {
            text: text.into(),
            data: data.to_string(),
        }
    }

    pub fn url(text: impl Into<String>, url: impl Into<String>) -> Self {
        Button::Url {
            text: text.into(),
            url: url.into(),
        }
    }

    pub fn text(&self) -> &str {
        match self {
            Button::Callback { text, .. } | Button::Url { text, .. } => text,
        }
    }

    pub fn data(&self) -> Option<&str> {
        match self {
            Button::Callback { data, .. } => Some(data),
            Button::Url { .. } => None,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Keyboard {
    pub rows: Vec<Vec<Button>>,
}

impl Keyboard {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn row(mut self, row: Vec<Button>) -> Self {
        if !row.is_empty() {
            self.rows.push(row);
        }
        self
    }

    pub fn button(self, button: Button) -> Self {
        self.row(vec![button])
    }

    /// Every callback payload on the keyboard, in layout order.
    pub fn callbacks(&self) -> Vec<&str> {
        self.rows
            .iter()
            .flatten()
            .filter_map(Button::data)
            .collect()
    }
}

/// One rendered view: what the user sees as their screen message.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Screen {
    pub text: String,
    pub keyboard: Option<Keyboard>,
    pub parse_mode: ParseMode,
    pub disable_preview: bool,
}

impl Screen {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            ..Self::default()
        }
    }

    pub fn html(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            parse_mode: ParseMode::Html,
            ..Self::default()
        }
    }

    pub fn keyboard(mut self, keyboard: Keyboard) -> Self {
        self.keyboard = Some(keyboard);
        self
    }

    pub fn no_preview(mut self) -> Self {
        self.disable_preview = true;
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileKind {
    Photo,
    Document,
}

/// A file already stored by the messaging platform, re-sent by id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutgoingFile {
    pub file_id: String,
    pub kind: FileKind,
    pub caption: Option<String>,
    pub keyboard: Option<Keyboard>,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransportError {
    #[error("message is not modified")]
    NotModified,
    #[error("message is gone")]
    Gone,
    #[error("request rejected: {0}")]
    Rejected(String),
    #[error("network failure: {0}")]
    Network(String),
}

impl TransportError {
    /// Failures that carry no information for the user or the operator.
    pub fn is_benign(&self) -> bool {
        matches!(self, TransportError::NotModified | TransportError::Gone)
    }
}

pub type TransportResult<T> = Result<T, TransportError>;

#[async_trait]
pub trait Transport: Send + Sync {
    async fn send_message(&self, chat_id: i64, screen: &Screen) -> TransportResult<i32>;
    async fn edit_message(&self, chat_id: i64, message_id: i32, screen: &Screen) -> TransportResult<()>;
    async fn delete_message(&self, chat_id: i64, message_id: i32) -> TransportResult<()>;
    async fn send_file(&self, chat_id: i64, file: &OutgoingFile) -> TransportResult<i32>;
    async fn download_file(&self, file_id: &str) -> TransportResult<Vec<u8>>;
    async fn answer_callback(&self, callback_id: &str, text: Option<&str>, alert: bool) -> TransportResult<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keyboard_skips_empty_rows_and_lists_callbacks() {
        let kb = Keyboard::new()
            .row(vec![Button::callback("A", "a:1"), Button::url("Site", "https://x.example")])
            .row(vec![])
            .button(Button::callback("B", "b"));
        assert_eq!(kb.rows.len(), 2);
        assert_eq!(kb.callbacks(), vec!["a:1", "b"]);
    }

    #[test]
    fn benign_errors() {
        assert!(TransportError::NotModified.is_benign());
        assert!(TransportError::Gone.is_benign());
        assert!(!TransportError::Network("reset".into()).is_benign());
    }
}
