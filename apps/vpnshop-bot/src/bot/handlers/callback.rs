use teloxide::prelude::*;
use teloxide::types::CallbackQuery;
use tracing::debug;

use crate::flow::{self, Inbound};
use crate::state::AppState;

/// Button presses. The flow engine answers the query on every path.
pub async fn callback_handler(q: CallbackQuery, state: AppState) -> Result<(), teloxide::RequestError> {
    let (chat_id, message_id) = match &q.message {
        Some(msg) => (msg.chat().id.0, Some(msg.id().0)),
        None => (q.from.id.0 as i64, None),
    };
    let actor = super::actor(&q.from, chat_id);
    let data = q.data.clone().unwrap_or_default();
    debug!(tg_id = actor.tg_id, data = %data, "callback received");

    flow::handle(
        &state,
        &actor,
        Inbound::Callback {
            id: q.id.0.clone(),
            data,
            message_id,
        },
    )
    .await;
    Ok(())
}
