use std::sync::Arc;

use vpnshop_db::Store;
use vpnshop_db::models::user::User;

use crate::config::BotConfig;
use crate::transport::Transport;

#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn Store>,
    pub transport: Arc<dyn Transport>,
    pub config: Arc<BotConfig>,
    pub bot_username: String,
}

impl AppState {
    pub fn new(
        store: Arc<dyn Store>,
        transport: Arc<dyn Transport>,
        config: BotConfig,
        bot_username: impl Into<String>,
    ) -> Self {
        Self {
            store,
            transport,
            config: Arc::new(config),
            bot_username: bot_username.into(),
        }
    }

    pub fn is_admin(&self, user: &User) -> bool {
        user.is_admin() || self.config.is_admin_tg(user.tg_id)
    }

    pub fn referral_link(&self, user: &User) -> String {
        let code = user
            .referral_code
            .clone()
            .unwrap_or_else(|| format!("REF{}", user.id));
        format!("https://t.me/{}?start=ref{}", self.bot_username, code)
    }
}
