use std::sync::Arc;

use anyhow::Context;
use dotenvy::dotenv;
use teloxide::prelude::*;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use vpnshop_bot::bot::run_bot;
use vpnshop_bot::config::BotConfig;
use vpnshop_bot::state::AppState;
use vpnshop_bot::sweep::ReferralSweep;
use vpnshop_bot::transport::telegram::TeloxideTransport;
use vpnshop_db::PgStore;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenv().ok();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "vpnshop_bot=info,vpnshop_db=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = BotConfig::load()?;
    tracing::info!("VPN shop bot starting...");
    tracing::info!("Currency: {}", config.currency);
    tracing::info!("Admins configured: {}", config.admin_tg_ids.len());

    let pool = vpnshop_db::db::connect(&config.database_url, config.db_max_connections).await?;
    let store = Arc::new(PgStore::new(pool));

    let bot = Bot::new(config.bot_token.clone());
    let me = bot.get_me().await.context("Bot failed to connect to Telegram")?;
    let username = me.username.clone().unwrap_or_else(|| "unknown".to_string());
    tracing::info!("Bot connected as: @{}", username);

    let (shutdown_tx, _) = tokio::sync::broadcast::channel(1);
    let sweep = ReferralSweep::new(store.clone(), config.sweep_interval()).spawn(shutdown_tx.subscribe());

    let transport = Arc::new(TeloxideTransport::new(bot.clone()));
    let state = AppState::new(store, transport, config, username);

    let signal_tx = shutdown_tx.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("Ctrl-C received");
            let _ = signal_tx.send(());
        }
    });

    run_bot(bot, shutdown_tx.subscribe(), state).await;
    let _ = shutdown_tx.send(());
    if let Err(e) = sweep.await {
        tracing::warn!("referral sweep task ended abnormally: {}", e);
    }
    Ok(())
}
