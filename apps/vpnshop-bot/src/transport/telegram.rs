use async_trait::async_trait;
use reqwest::Url;
use teloxide::net::Download;
use teloxide::prelude::*;
use teloxide::types::{
    CallbackQueryId, FileId, InlineKeyboardButton, InlineKeyboardMarkup, InputFile,
    LinkPreviewOptions, MessageId, ParseMode as TgParseMode,
};
use teloxide::{ApiError, DownloadError, RequestError};
use tracing::{debug, warn};

use super::{
    Button, FileKind, Keyboard, OutgoingFile, ParseMode, Screen, Transport, TransportError,
    TransportResult,
};

/// [`Transport`] over the Telegram Bot API.
#[derive(Clone)]
pub struct TeloxideTransport {
    bot: Bot,
}

impl TeloxideTransport {
    pub fn new(bot: Bot) -> Self {
        Self { bot }
    }
}

fn classify(err: RequestError) -> TransportError {
    match err {
        RequestError::Api(api) => match api {
            ApiError::MessageNotModified => TransportError::NotModified,
            ApiError::MessageToEditNotFound
            | ApiError::MessageToDeleteNotFound
            | ApiError::MessageCantBeEdited
            | ApiError::MessageCantBeDeleted
            | ApiError::MessageIdInvalid => TransportError::Gone,
            other => {
                let text = other.to_string();
                if text.contains("message is not modified") {
                    TransportError::NotModified
                } else {
                    TransportError::Rejected(text)
                }
            }
        },
        RequestError::Network(e) => TransportError::Network(e.to_string()),
        RequestError::Io(e) => TransportError::Network(e.to_string()),
        other => TransportError::Rejected(other.to_string()),
    }
}

fn classify_download(err: DownloadError) -> TransportError {
    match err {
        DownloadError::Network(e) => TransportError::Network(e.to_string()),
        DownloadError::Io(e) => TransportError::Network(e.to_string()),
    }
}

fn markup(keyboard: &Keyboard) -> InlineKeyboardMarkup {
    let rows: Vec<Vec<InlineKeyboardButton>> = keyboard
        .rows
        .iter()
        .map(|row| {
            row.iter()
                .filter_map(|button| match button {
                    Button::Callback { text, data } => {
                        Some(InlineKeyboardButton::callback(text.clone(), data.clone()))
                    }
                    Button::Url { text, url } => match Url::parse(url) {
                        Ok(parsed) => Some(InlineKeyboardButton::url(text.clone(), parsed)),
                        Err(e) => {
                            warn!("Dropping button with invalid url {}: {}", url, e);
                            None
                        }
                    },
                })
                .collect()
        })
        .filter(|row: &Vec<InlineKeyboardButton>| !row.is_empty())
        .collect();
    InlineKeyboardMarkup::new(rows)
}

fn no_preview() -> LinkPreviewOptions {
    LinkPreviewOptions {
        is_disabled: true,
        url: None,
        prefer_small_media: false,
        prefer_large_media: false,
        show_above_text: false,
    }
}

#[async_trait]
impl Transport for TeloxideTransport {
    async fn send_message(&self, chat_id: i64, screen: &Screen) -> TransportResult<i32> {
        let mut req = self.bot.send_message(ChatId(chat_id), screen.text.clone());
        if screen.parse_mode == ParseMode::Html {
            req = req.parse_mode(TgParseMode::Html);
        }
        if screen.disable_preview {
            req = req.link_preview_options(no_preview());
        }
        if let Some(keyboard) = &screen.keyboard {
            req = req.reply_markup(markup(keyboard));
        }
        let msg = req.await.map_err(classify)?;
        Ok(msg.id.0)
    }

    async fn edit_message(&self, chat_id: i64, message_id: i32, screen: &Screen) -> TransportResult<()> {
        let mut req = self
            .bot
            .edit_message_text(ChatId(chat_id), MessageId(message_id), screen.text.clone());
        if screen.parse_mode == ParseMode::Html {
            req = req.parse_mode(TgParseMode::Html);
        }
        if screen.disable_preview {
            req = req.link_preview_options(no_preview());
        }
        if let Some(keyboard) = &screen.keyboard {
            req = req.reply_markup(markup(keyboard));
        }
        req.await.map_err(classify)?;
        Ok(())
    }

    async fn delete_message(&self, chat_id: i64, message_id: i32) -> TransportResult<()> {
        self.bot
            .delete_message(ChatId(chat_id), MessageId(message_id))
            .await
            .map_err(classify)?;
        Ok(())
    }

    async fn send_file(&self, chat_id: i64, file: &OutgoingFile) -> TransportResult<i32> {
        let input = InputFile::file_id(FileId(file.file_id.clone()));
        let msg = match file.kind {
            FileKind::Photo => {
                let mut req = self.bot.send_photo(ChatId(chat_id), input);
                if let Some(caption) = &file.caption {
                    req = req.caption(caption.clone()).parse_mode(TgParseMode::Html);
                }
                if let Some(keyboard) = &file.keyboard {
                    req = req.reply_markup(markup(keyboard));
                }
                req.await
            }
            FileKind::Document => {
                let mut req = self.bot.send_document(ChatId(chat_id), input);
                if let Some(caption) = &file.caption {
                    req = req.caption(caption.clone()).parse_mode(TgParseMode::Html);
                }
                if let Some(keyboard) = &file.keyboard {
                    req = req.reply_markup(markup(keyboard));
                }
                req.await
            }
        };
        Ok(msg.map_err(classify)?.id.0)
    }

    async fn download_file(&self, file_id: &str) -> TransportResult<Vec<u8>> {
        let file = self
            .bot
            .get_file(FileId(file_id.to_string()))
            .await
            .map_err(classify)?;

        let mut buf = Vec::new();
        self.bot
            .download_file(&file.path, &mut buf)
            .await
            .map_err(classify_download)?;

        debug!(file_id = %file_id, size = buf.len(), "downloaded file from Telegram");
        Ok(buf)
    }

    async fn answer_callback(&self, callback_id: &str, text: Option<&str>, alert: bool) -> TransportResult<()> {
        let mut req = self
            .bot
            .answer_callback_query(CallbackQueryId(callback_id.to_string()));
        if let Some(text) = text {
            req = req.text(text.to_string()).show_alert(alert);
        }
        req.await.map_err(classify)?;
        Ok(())
    }
}
