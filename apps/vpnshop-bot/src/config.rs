use serde::{Deserialize, Serialize};
use std::fs;
use std::time::Duration;

use vpnshop_db::models::referral::BonusPolicy;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("{0} is not set")]
    Missing(&'static str),
    #[error("{key} has an invalid value: {value}")]
    Invalid { key: &'static str, value: String },
    #[error("failed to parse {path}: {source}")]
    File {
        path: String,
        #[source]
        source: toml::de::Error,
    },
}

/// Process-wide settings, loaded once at startup. Money values are whole
/// currency units here; the accessors hand out minor units.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BotConfig {
    pub bot_token: String,
    pub database_url: String,
    #[serde(default = "default_max_connections")]
    pub db_max_connections: u32,
    #[serde(default)]
    pub admin_tg_ids: Vec<i64>,
    #[serde(default = "default_currency")]
    pub currency: String,
    #[serde(default = "default_protocols")]
    pub protocols: Vec<String>,
    #[serde(default = "default_topup_amounts")]
    pub topup_amounts: Vec<i64>,
    /// `{amount}` and `{code}` are substituted.
    #[serde(default)]
    pub transfer_link_template: Option<String>,
    #[serde(default = "default_referral_percent")]
    pub referral_percent: i64,
    #[serde(default = "default_referral_delay_days")]
    pub referral_delay_days: i64,
    #[serde(default = "default_referral_min_withdraw")]
    pub referral_min_withdraw: i64,
    #[serde(default = "default_support_cap")]
    pub support_open_ticket_cap: i64,
    #[serde(default = "default_sweep_interval")]
    pub sweep_interval_secs: u64,
    #[serde(default = "default_history_limit")]
    pub payment_history_limit: i64,
}

fn default_max_connections() -> u32 {
    20
}
fn default_currency() -> String {
    "RUB".to_string()
}
fn default_protocols() -> Vec<String> {
    ["vless", "shadowsocks", "wireguard", "outline"]
        .iter()
        .map(|p| p.to_string())
        .collect()
}
fn default_topup_amounts() -> Vec<i64> {
    vec![500, 1000, 2000, 5000]
}
fn default_referral_percent() -> i64 {
    10
}
fn default_referral_delay_days() -> i64 {
    7
}
fn default_referral_min_withdraw() -> i64 {
    500
}
fn default_support_cap() -> i64 {
    5
}
fn default_sweep_interval() -> u64 {
    3600
}
fn default_history_limit() -> i64 {
    10
}

impl Default for BotConfig {
    fn default() -> Self {
        Self {
            bot_token: String::new(),
            database_url: String::new(),
            db_max_connections: default_max_connections(),
            admin_tg_ids: Vec::new(),
            currency: default_currency(),
            protocols: default_protocols(),
            topup_amounts: default_topup_amounts(),
            transfer_link_template: None,
            referral_percent: default_referral_percent(),
            referral_delay_days: default_referral_delay_days(),
            referral_min_withdraw: default_referral_min_withdraw(),
            support_open_ticket_cap: default_support_cap(),
            sweep_interval_secs: default_sweep_interval(),
            payment_history_limit: default_history_limit(),
        }
    }
}

impl BotConfig {
    pub fn load() -> Result<Self, ConfigError> {
        let config_paths = ["/etc/vpnshop/bot.toml", "./bot.toml"];

        for path in config_paths {
            if let Ok(contents) = fs::read_to_string(path) {
                tracing::info!("Loading config from {}", path);
                return Self::from_toml(path, &contents);
            }
        }

        tracing::info!("Loading config from environment");
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_toml(path: &str, contents: &str) -> Result<Self, ConfigError> {
        toml::from_str(contents).map_err(|source| ConfigError::File {
            path: path.to_string(),
            source,
        })
    }

    /// Builds the config from `KEY=value` pairs; `lookup` is `std::env::var`
    /// in production.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let required = |key: &'static str| {
            lookup(key)
                .filter(|v| !v.trim().is_empty())
                .ok_or(ConfigError::Missing(key))
        };

        let mut config = Self {
            bot_token: required("BOT_TOKEN")?,
            database_url: required("DATABASE_URL")?,
            ..Self::default()
        };

        if let Some(raw) = lookup("DB_MAX_CONNECTIONS") {
            config.db_max_connections = parse_number("DB_MAX_CONNECTIONS", &raw)?;
        }
        if let Some(raw) = lookup("ADMIN_TG_IDS") {
            config.admin_tg_ids = parse_list("ADMIN_TG_IDS", &raw)?;
        }
        if let Some(raw) = lookup("CURRENCY").filter(|v| !v.trim().is_empty()) {
            config.currency = raw.trim().to_uppercase();
        }
        if let Some(raw) = lookup("PROTOCOLS") {
            let protocols: Vec<String> = raw
                .split(',')
                .map(|p| p.trim().to_lowercase())
                .filter(|p| !p.is_empty())
                .collect();
            if !protocols.is_empty() {
                config.protocols = protocols;
            }
        }
        if let Some(raw) = lookup("TOPUP_AMOUNTS") {
            config.topup_amounts = parse_list("TOPUP_AMOUNTS", &raw)?;
        }
        config.transfer_link_template = lookup("TRANSFER_LINK_TEMPLATE").filter(|v| !v.trim().is_empty());
        if let Some(raw) = lookup("REFERRAL_PERCENT") {
            config.referral_percent = parse_number("REFERRAL_PERCENT", &raw)?;
        }
        if let Some(raw) = lookup("REFERRAL_DELAY_DAYS") {
            config.referral_delay_days = parse_number("REFERRAL_DELAY_DAYS", &raw)?;
        }
        if let Some(raw) = lookup("REFERRAL_MIN_WITHDRAW") {
            config.referral_min_withdraw = parse_number("REFERRAL_MIN_WITHDRAW", &raw)?;
        }
        if let Some(raw) = lookup("SUPPORT_OPEN_TICKET_CAP") {
            config.support_open_ticket_cap = parse_number("SUPPORT_OPEN_TICKET_CAP", &raw)?;
        }
        if let Some(raw) = lookup("SWEEP_INTERVAL_SECS") {
            config.sweep_interval_secs = parse_number("SWEEP_INTERVAL_SECS", &raw)?;
        }
        if let Some(raw) = lookup("PAYMENT_HISTORY_LIMIT") {
            config.payment_history_limit = parse_number("PAYMENT_HISTORY_LIMIT", &raw)?;
        }

        Ok(config)
    }

    pub fn is_admin_tg(&self, tg_id: i64) -> bool {
        self.admin_tg_ids.contains(&tg_id)
    }

    pub fn topup_amounts_minor(&self) -> Vec<i64> {
        self.topup_amounts.iter().map(|a| a * 100).collect()
    }

    pub fn min_withdraw_minor(&self) -> i64 {
        self.referral_min_withdraw * 100
    }

    pub fn bonus_policy(&self) -> BonusPolicy {
        BonusPolicy {
            percent: self.referral_percent,
            delay_days: self.referral_delay_days,
        }
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs.max(1))
    }

    pub fn supports_protocol(&self, protocol: &str) -> bool {
        self.protocols.iter().any(|p| p == protocol)
    }

    pub fn transfer_link(&self, amount_minor: i64, code: &str) -> Option<String> {
        let template = self.transfer_link_template.as_ref()?;
        let amount = format!("{}", amount_minor / 100);
        Some(
            template
                .replace("{amount}", &urlencoding::encode(&amount))
                .replace("{code}", &urlencoding::encode(code)),
        )
    }
}

fn parse_number<T: std::str::FromStr>(key: &'static str, raw: &str) -> Result<T, ConfigError> {
    raw.trim().parse().map_err(|_| ConfigError::Invalid {
        key,
        value: raw.to_string(),
    })
}

fn parse_list<T: std::str::FromStr>(key: &'static str, raw: &str) -> Result<Vec<T>, ConfigError> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|s| parse_number(key, s))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn env_requires_token_and_database() {
        let err = BotConfig::from_lookup(lookup(&[("DATABASE_URL", "postgres://x")])).unwrap_err();
        assert!(matches!(err, ConfigError::Missing("BOT_TOKEN")));
    }

    #[test]
    fn env_parses_lists_and_numbers() {
        let config = BotConfig::from_lookup(lookup(&[
            ("BOT_TOKEN", "t"),
            ("DATABASE_URL", "postgres://x"),
            ("ADMIN_TG_IDS", "10, 20"),
            ("TOPUP_AMOUNTS", "300,700"),
            ("REFERRAL_MIN_WITHDRAW", "250"),
            ("CURRENCY", "usd"),
        ]))
        .unwrap();
        assert_eq!(config.admin_tg_ids, vec![10, 20]);
        assert_eq!(config.topup_amounts_minor(), vec![30_000, 70_000]);
        assert_eq!(config.min_withdraw_minor(), 25_000);
        assert_eq!(config.currency, "USD");
        assert_eq!(config.support_open_ticket_cap, 5);
        assert!(config.is_admin_tg(20));
    }

    #[test]
    fn invalid_number_is_reported_with_key() {
        let err = BotConfig::from_lookup(lookup(&[
            ("BOT_TOKEN", "t"),
            ("DATABASE_URL", "postgres://x"),
            ("REFERRAL_PERCENT", "ten"),
        ]))
        .unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { key: "REFERRAL_PERCENT", .. }));
    }

    #[test]
    fn toml_fills_defaults() {
        let config = BotConfig::from_toml(
            "bot.toml",
            "bot_token = \"t\"\ndatabase_url = \"postgres://x\"\nadmin_tg_ids = [1]\n",
        )
        .unwrap();
        assert_eq!(config.admin_tg_ids, vec![1]);
        assert_eq!(config.referral_percent, 10);
        assert_eq!(config.protocols.len(), 4);
    }

    #[test]
    fn transfer_link_substitutes_placeholders() {
        let config = BotConfig {
            transfer_link_template: Some("https://pay.example/t?sum={amount}&c={code}".to_string()),
            ..BotConfig::default()
        };
        assert_eq!(
            config.transfer_link(50_000, "PAY 1").as_deref(),
            Some("https://pay.example/t?sum=500&c=PAY%201")
        );
        assert!(BotConfig::default().transfer_link(100, "x").is_none());
    }
}
