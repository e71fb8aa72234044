use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Plan {
    pub id: i64,
    pub code: String,
    pub title: String,
    pub duration_days: i32,
    pub price_minor: i64,
    pub currency: String,
    pub enabled: bool,
}

impl Plan {
    /// Free plans and `trial*` codes grant the one-per-user trial.
    pub fn is_trial(&self) -> bool {
        self.price_minor == 0 || self.code.to_ascii_lowercase().starts_with("trial")
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Server {
    pub id: i64,
    pub name: String,
    pub country: Option<String>,
    pub capacity: Option<i32>,
    pub active_keys: i64,
}

impl Server {
    /// Load shown next to the server name: percent of capacity, or the raw
    /// key count when no capacity is configured.
    pub fn load_label(&self) -> String {
        match self.capacity {
            Some(cap) if cap > 0 => {
                let pct = ((self.active_keys as f64 / cap as f64) * 100.0).round() as i64;
                format!("[{}%]", pct.max(0))
            }
            _ => format!("[{}]", self.active_keys),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Profile {
    pub id: i64,
    pub user_id: i64,
    pub protocol: String,
    pub server_id: i64,
    pub server_name: Option<String>,
    pub status: String,
    pub source: String,
    pub config_uri: Option<String>,
    pub created_at: DateTime<Utc>,
    pub access_until: Option<DateTime<Utc>>,
}

impl Profile {
    pub fn is_trial(&self) -> bool {
        self.source == ProfileSource::Trial.as_str()
    }

    pub fn key_name(&self) -> String {
        let server = self
            .server_name
            .clone()
            .unwrap_or_else(|| self.server_id.to_string());
        format!("{}_{}", self.protocol, server)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProfileSource {
    Trial,
    Paid,
}

impl ProfileSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProfileSource::Trial => "trial",
            ProfileSource::Paid => "paid",
        }
    }
}

/// Synthetic config reference for a stub profile; the real provisioning
/// backend is not part of this system.
pub fn stub_config_uri(protocol: &str, source: ProfileSource, user_id: i64, server_id: i64) -> String {
    format!("{}://{}-{}@server-{}", protocol, source.as_str(), user_id, server_id)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn plan(code: &str, price: i64) -> Plan {
        Plan {
            id: 1,
            code: code.to_string(),
            title: "t".to_string(),
            duration_days: 30,
            price_minor: price,
            currency: "RUB".to_string(),
            enabled: true,
        }
    }

    #[test]
    fn trial_detection() {
        assert!(plan("trial_3d", 100).is_trial());
        assert!(plan("month", 0).is_trial());
        assert!(!plan("month", 15000).is_trial());
    }

    #[test]
    fn load_label_uses_capacity_when_known() {
        let mut s = Server {
            id: 7,
            name: "nl-1".to_string(),
            country: None,
            capacity: Some(200),
            active_keys: 50,
        };
        assert_eq!(s.load_label(), "[25%]");
        s.capacity = None;
        assert_eq!(s.load_label(), "[50]");
    }
}
