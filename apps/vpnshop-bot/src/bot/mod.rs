use teloxide::{dptree, prelude::*, types::Update};
use tracing::{error, info};

use crate::state::AppState;

pub mod handlers;
pub mod keyboards;
pub mod utils;

/// Runs the update dispatcher until it exits or `shutdown_signal` fires.
pub async fn run_bot(
    bot: Bot,
    mut shutdown_signal: tokio::sync::broadcast::Receiver<()>,
    state: AppState,
) {
    info!(bot = %state.bot_username, "starting dispatcher");

    std::panic::set_hook(Box::new(|info| {
        error!("bot panic: {}", info);
    }));

    let messages = Update::filter_message().endpoint(handlers::command::message_handler);
    let callbacks = Update::filter_callback_query().endpoint(handlers::callback::callback_handler);

    let mut dispatcher = Dispatcher::builder(bot, dptree::entry().branch(messages).branch(callbacks))
        .dependencies(dptree::deps![state])
        .default_handler(|upd: std::sync::Arc<Update>| async move {
            tracing::debug!("unhandled update: {:?}", upd.kind);
        })
        .build();

    tokio::select! {
        _ = dispatcher.dispatch() => {
            info!("dispatcher exited");
        }
        _ = shutdown_signal.recv() => {
            info!("shutdown signal received, stopping dispatcher");
        }
    }
}
