use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventCategory {
    UserActions,
    Payments,
    AdminActions,
    Support,
    System,
}

impl EventCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventCategory::UserActions => "user_actions",
            EventCategory::Payments => "payments",
            EventCategory::AdminActions => "admin_actions",
            EventCategory::Support => "support",
            EventCategory::System => "system",
        }
    }
}

/// Row of the `logs` table. Written inside the same transaction as the
/// effect it describes when one exists.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub category: EventCategory,
    pub level: String,
    pub tg_id: Option<i64>,
    pub user_id: Option<i64>,
    pub action: String,
    pub message: Option<String>,
    pub context: Value,
}

impl Event {
    pub fn info(category: EventCategory, action: &str) -> Self {
        Self {
            category,
            level: "info".to_string(),
            tg_id: None,
            user_id: None,
            action: action.to_string(),
            message: None,
            context: Value::Object(Default::default()),
        }
    }

    pub fn actor(mut self, tg_id: i64, user_id: i64) -> Self {
        self.tg_id = Some(tg_id);
        self.user_id = Some(user_id);
        self
    }

    pub fn message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }

    pub fn context(mut self, context: Value) -> Self {
        self.context = context;
        self
    }
}
