pub mod callback;
pub mod command;

use teloxide::types::User;

use crate::flow::Actor;

/// Identity of the Telegram user behind an update.
pub(crate) fn actor(user: &User, chat_id: i64) -> Actor {
    Actor {
        tg_id: user.id.0 as i64,
        chat_id,
        username: user.username.clone(),
    }
}
