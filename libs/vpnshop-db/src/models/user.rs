use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::session::Session;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    #[default]
    User,
    Admin,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::User => "user",
            Role::Admin => "admin",
        }
    }

    pub fn from_db(raw: &str) -> Self {
        if raw.eq_ignore_ascii_case("admin") {
            Role::Admin
        } else {
            Role::User
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct User {
    pub id: i64,
    pub tg_id: i64,
    pub chat_id: i64,
    pub username: Option<String>,
    pub role: Role,
    pub is_blocked: bool,
    pub referral_code: Option<String>,
    pub referrer_id: Option<i64>,
    pub created_at: DateTime<Utc>,
    pub last_seen_at: DateTime<Utc>,
}

impl User {
    pub fn is_admin(&self) -> bool {
        self.role == Role::Admin
    }

    pub fn display_name(&self) -> String {
        match &self.username {
            Some(name) => format!("@{}", name),
            None => format!("id{}", self.tg_id),
        }
    }
}

/// Identity data delivered with every inbound update.
#[derive(Debug, Clone)]
pub struct Contact {
    pub tg_id: i64,
    pub chat_id: i64,
    pub username: Option<String>,
}

/// How a `/start ref...` deep link names the inviting user.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReferrerRef {
    UserId(i64),
    Code(String),
}

impl ReferrerRef {
    /// Parses the `/start` argument: `refREF12`, `ref12` or `refCODE`.
    pub fn parse_start_arg(arg: &str) -> Option<Self> {
        let token = arg.trim().strip_prefix("ref")?;
        if token.is_empty() {
            return None;
        }
        let upper = token.to_ascii_uppercase();
        if let Some(rest) = upper.strip_prefix("REF") {
            if let Ok(id) = rest.parse::<i64>() {
                return Some(ReferrerRef::UserId(id));
            }
        }
        if let Ok(id) = token.parse::<i64>() {
            return Some(ReferrerRef::UserId(id));
        }
        Some(ReferrerRef::Code(token.to_string()))
    }
}

/// A user joined with their session row.
#[derive(Debug, Clone)]
pub struct Account {
    pub user: User,
    pub session: Session,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserSettings {
    pub user_id: i64,
    pub notifications_enabled: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn start_arg_variants() {
        assert_eq!(
            ReferrerRef::parse_start_arg("refREF42"),
            Some(ReferrerRef::UserId(42))
        );
        assert_eq!(ReferrerRef::parse_start_arg("ref42"), Some(ReferrerRef::UserId(42)));
        assert_eq!(
            ReferrerRef::parse_start_arg("refPARTNER"),
            Some(ReferrerRef::Code("PARTNER".to_string()))
        );
        assert_eq!(ReferrerRef::parse_start_arg("promo"), None);
        assert_eq!(ReferrerRef::parse_start_arg("ref"), None);
    }
}
