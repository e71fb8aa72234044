use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct PromoCode {
    pub code: String,
    pub bonus_minor: i64,
    pub active: bool,
    pub max_uses: Option<i32>,
    pub used_count: i32,
    pub expires_at: Option<DateTime<Utc>>,
}

impl PromoCode {
    pub fn is_exhausted(&self) -> bool {
        matches!(self.max_uses, Some(max) if self.used_count >= max)
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        matches!(self.expires_at, Some(at) if at <= now)
    }

    /// Codes are matched case-insensitively and stored upper-case.
    pub fn normalize(raw: &str) -> String {
        raw.trim().to_ascii_uppercase()
    }
}
