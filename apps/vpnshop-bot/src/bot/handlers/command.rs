use teloxide::prelude::*;
use tracing::debug;

use crate::flow::{self, Inbound, Media};
use crate::state::AppState;
use crate::transport::FileKind;

/// Splits `/start ref42` into its argument; `None` for other text.
fn start_arg(text: &str) -> Option<Option<String>> {
    let rest = text.strip_prefix("/start")?;
    if !(rest.is_empty() || rest.starts_with(' ') || rest.starts_with('@')) {
        return None;
    }
    let arg = rest
        .split_whitespace()
        .find(|part| !part.starts_with('@'))
        .map(str::to_string);
    Some(arg)
}

/// Maps a message onto the flow input it represents.
fn inbound(msg: &Message) -> Option<Inbound> {
    if let Some(text) = msg.text() {
        return Some(match start_arg(text.trim()) {
            Some(arg) => Inbound::Start { arg },
            None => Inbound::Text(text.to_string()),
        });
    }
    if let Some(photo) = msg.photo().and_then(|sizes| sizes.iter().max_by_key(|p| p.width * p.height)) {
        return Some(Inbound::Media(Media {
            file_id: photo.file.id.0.clone(),
            file_name: None,
            mime_type: Some("image/jpeg".to_string()),
            file_size: Some(photo.file.size as i64),
            kind: FileKind::Photo,
        }));
    }
    if let Some(doc) = msg.document() {
        return Some(Inbound::Media(Media {
            file_id: doc.file.id.0.clone(),
            file_name: doc.file_name.clone(),
            mime_type: doc.mime_type.as_ref().map(|m| m.to_string()),
            file_size: Some(doc.file.size as i64),
            kind: FileKind::Document,
        }));
    }
    None
}

pub async fn message_handler(msg: Message, state: AppState) -> Result<(), teloxide::RequestError> {
    let Some(user) = msg.from.as_ref() else {
        return Ok(());
    };
    let actor = super::actor(user, msg.chat.id.0);
    let Some(input) = inbound(&msg) else {
        debug!(tg_id = actor.tg_id, "ignoring unsupported message");
        return Ok(());
    };
    flow::handle(&state, &actor, input).await;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn start_arguments() {
        assert_eq!(start_arg("/start"), Some(None));
        assert_eq!(start_arg("/start ref42"), Some(Some("ref42".to_string())));
        assert_eq!(start_arg("/start@vpn_bot refABC"), Some(Some("refABC".to_string())));
        assert_eq!(start_arg("/started"), None);
        assert_eq!(start_arg("hello"), None);
    }
}
