//! In-process transport that keeps every message in memory. Edits follow the
//! Bot API rules: editing an unknown message fails with `Gone`, editing to
//! identical content fails with `NotModified`.

use std::collections::{BTreeMap, HashMap};
use std::sync::Mutex;
use std::sync::atomic::{AtomicI32, Ordering};

use async_trait::async_trait;

use super::{OutgoingFile, Screen, Transport, TransportError, TransportResult};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Answer {
    pub callback_id: String,
    pub text: Option<String>,
    pub alert: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Delivery {
    Sent { chat_id: i64, message_id: i32, screen: Screen },
    Edited { chat_id: i64, message_id: i32, screen: Screen },
    Deleted { chat_id: i64, message_id: i32 },
    File { chat_id: i64, message_id: i32, file: OutgoingFile },
}

impl Delivery {
    pub fn chat_id(&self) -> i64 {
        match self {
            Delivery::Sent { chat_id, .. }
            | Delivery::Edited { chat_id, .. }
            | Delivery::Deleted { chat_id, .. }
            | Delivery::File { chat_id, .. } => *chat_id,
        }
    }
}

#[derive(Default)]
struct Inner {
    live: BTreeMap<(i64, i32), Screen>,
    log: Vec<Delivery>,
    answers: Vec<Answer>,
    files: HashMap<String, Vec<u8>>,
    send_failures: u32,
}

pub struct RecordingTransport {
    inner: Mutex<Inner>,
    next_id: AtomicI32,
}

impl Default for RecordingTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl RecordingTransport {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
            next_id: AtomicI32::new(100),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Registers a downloadable file.
    pub fn add_file(&self, file_id: &str, bytes: Vec<u8>) {
        self.lock().files.insert(file_id.to_string(), bytes);
    }

    /// Simulates the user deleting a message from their chat.
    pub fn forget(&self, chat_id: i64, message_id: i32) {
        self.lock().live.remove(&(chat_id, message_id));
    }

    /// The next `count` sends fail with a network error.
    pub fn fail_sends(&self, count: u32) {
        self.lock().send_failures = count;
    }

    pub fn live_messages(&self, chat_id: i64) -> Vec<(i32, Screen)> {
        self.lock()
            .live
            .iter()
            .filter(|((chat, _), _)| *chat == chat_id)
            .map(|((_, id), screen)| (*id, screen.clone()))
            .collect()
    }

    pub fn message(&self, chat_id: i64, message_id: i32) -> Option<Screen> {
        self.lock().live.get(&(chat_id, message_id)).cloned()
    }

    /// Last screen sent or edited into `chat_id`.
    pub fn last_screen(&self, chat_id: i64) -> Option<Screen> {
        self.lock().log.iter().rev().find_map(|d| match d {
            Delivery::Sent { chat_id: c, screen, .. } | Delivery::Edited { chat_id: c, screen, .. }
                if *c == chat_id =>
            {
                Some(screen.clone())
            }
            _ => None,
        })
    }

    pub fn deliveries(&self, chat_id: i64) -> Vec<Delivery> {
        self.lock()
            .log
            .iter()
            .filter(|d| d.chat_id() == chat_id)
            .cloned()
            .collect()
    }

    pub fn sends(&self, chat_id: i64) -> usize {
        self.deliveries(chat_id)
            .iter()
            .filter(|d| matches!(d, Delivery::Sent { .. }))
            .count()
    }

    pub fn answers(&self) -> Vec<Answer> {
        self.lock().answers.clone()
    }

    pub fn answers_for(&self, callback_id: &str) -> Vec<Answer> {
        self.lock()
            .answers
            .iter()
            .filter(|a| a.callback_id == callback_id)
            .cloned()
            .collect()
    }
}

#[async_trait]
impl Transport for RecordingTransport {
    async fn send_message(&self, chat_id: i64, screen: &Screen) -> TransportResult<i32> {
        let mut inner = self.lock();
        if inner.send_failures > 0 {
            inner.send_failures -= 1;
            return Err(TransportError::Network("connection reset".to_string()));
        }
        let message_id = self.next_id.fetch_add(1, Ordering::SeqCst);
        inner.live.insert((chat_id, message_id), screen.clone());
        inner.log.push(Delivery::Sent {
            chat_id,
            message_id,
            screen: screen.clone(),
        });
        Ok(message_id)
    }

    async fn edit_message(&self, chat_id: i64, message_id: i32, screen: &Screen) -> TransportResult<()> {
        let mut inner = self.lock();
        match inner.live.get_mut(&(chat_id, message_id)) {
            None => Err(TransportError::Gone),
            Some(current) if current == screen => Err(TransportError::NotModified),
            Some(current) => {
                *current = screen.clone();
                inner.log.push(Delivery::Edited {
                    chat_id,
                    message_id,
                    screen: screen.clone(),
                });
                Ok(())
            }
        }
    }

    async fn delete_message(&self, chat_id: i64, message_id: i32) -> TransportResult<()> {
        let mut inner = self.lock();
        if inner.live.remove(&(chat_id, message_id)).is_none() {
            return Err(TransportError::Gone);
        }
        inner.log.push(Delivery::Deleted { chat_id, message_id });
        Ok(())
    }

    async fn send_file(&self, chat_id: i64, file: &OutgoingFile) -> TransportResult<i32> {
        let mut inner = self.lock();
        let message_id = self.next_id.fetch_add(1, Ordering::SeqCst);
        inner.log.push(Delivery::File {
            chat_id,
            message_id,
            file: file.clone(),
        });
        Ok(message_id)
    }

    async fn download_file(&self, file_id: &str) -> TransportResult<Vec<u8>> {
        self.lock()
            .files
            .get(file_id)
            .cloned()
            .ok_or_else(|| TransportError::Rejected(format!("file {} not found", file_id)))
    }

    async fn answer_callback(&self, callback_id: &str, text: Option<&str>, alert: bool) -> TransportResult<()> {
        self.lock().answers.push(Answer {
            callback_id: callback_id.to_string(),
            text: text.map(str::to_string),
            alert,
        });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn edit_rules_follow_the_bot_api() {
        let t = RecordingTransport::new();
        let screen = Screen::text("hello");
        let id = t.send_message(1, &screen).await.unwrap();

        assert_eq!(t.edit_message(1, id, &screen).await, Err(TransportError::NotModified));
        assert_eq!(t.edit_message(1, id + 50, &screen).await, Err(TransportError::Gone));
        assert!(t.edit_message(1, id, &Screen::text("bye")).await.is_ok());
        assert_eq!(t.message(1, id), Some(Screen::text("bye")));

        t.forget(1, id);
        assert_eq!(t.edit_message(1, id, &screen).await, Err(TransportError::Gone));
    }

    #[tokio::test]
    async fn injected_send_failure_is_consumed() {
        let t = RecordingTransport::new();
        t.fail_sends(1);
        assert!(t.send_message(1, &Screen::text("a")).await.is_err());
        assert!(t.send_message(1, &Screen::text("a")).await.is_ok());
        assert_eq!(t.sends(1), 1);
    }
}
