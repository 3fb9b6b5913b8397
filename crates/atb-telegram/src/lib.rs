//! Telegram adapter (teloxide).
//!
//! This crate implements the `atb-core` MessagingPort over the Telegram Bot
//! API and routes updates to the core services.

use async_trait::async_trait;

use teloxide::{
    prelude::*,
    types::{InlineKeyboardButton, InlineKeyboardMarkup, InputFile, ParseMode},
};

use tokio::time::sleep;

pub mod handlers;
pub mod router;

use atb_core::{
    domain::{ChatId, MessageId, MessageRef},
    errors::Error,
    messaging::{
        port::MessagingPort,
        types::{ButtonAction, ChatAction, InlineKeyboard, PhotoSource},
    },
    Result,
};

#[derive(Clone)]
pub struct TelegramMessenger {
    bot: Bot,
}

/// Convert the core keyboard into Telegram markup. Buttons whose URL does not
/// parse are dropped.
pub fn to_markup(keyboard: &InlineKeyboard) -> InlineKeyboardMarkup {
    let rows: Vec<Vec<InlineKeyboardButton>> = keyboard
        .rows
        .iter()
        .map(|row| {
            row.iter()
                .filter_map(|b| match &b.action {
                    ButtonAction::Callback(data) => {
                        Some(InlineKeyboardButton::callback(b.label.clone(), data.clone()))
                    }
                    ButtonAction::Url(url) => reqwest::Url::parse(url)
                        .ok()
                        .map(|u| InlineKeyboardButton::url(b.label.clone(), u)),
                    ButtonAction::SwitchInline(query) => Some(
                        InlineKeyboardButton::switch_inline_query(b.label.clone(), query.clone()),
                    ),
                })
                .collect::<Vec<_>>()
        })
        .filter(|row| !row.is_empty())
        .collect();
    InlineKeyboardMarkup::new(rows)
}

impl TelegramMessenger {
    pub fn new(bot: Bot) -> Self {
        Self { bot }
    }

    pub fn bot(&self) -> Bot {
        self.bot.clone()
    }

    fn tg_chat(chat_id: ChatId) -> teloxide::types::ChatId {
        teloxide::types::ChatId(chat_id.0)
    }

    fn tg_msg_id(message_id: MessageId) -> teloxide::types::MessageId {
        teloxide::types::MessageId(message_id.0)
    }

    fn map_err(e: teloxide::RequestError) -> Error {
        Error::External(format!("telegram error: {e}"))
    }

    fn msg_ref(chat_id: ChatId, msg: &Message) -> MessageRef {
        MessageRef {
            chat_id,
            message_id: MessageId(msg.id.0),
        }
    }

    async fn with_retry<T, Fut>(&self, mut op: impl FnMut() -> Fut) -> Result<T>
    where
        Fut: std::future::IntoFuture<Output = std::result::Result<T, teloxide::RequestError>>,
        Fut::IntoFuture: Send,
    {
        const MAX_RETRIES: usize = 1;
        let mut attempts = 0usize;
        loop {
            match op().await {
                Ok(v) => return Ok(v),
                Err(e) => match e {
                    teloxide::RequestError::RetryAfter(d) if attempts < MAX_RETRIES => {
                        attempts += 1;
                        sleep(d).await;
                        continue;
                    }
                    other => return Err(Self::map_err(other)),
                },
            }
        }
    }
}

#[async_trait]
impl MessagingPort for TelegramMessenger {
    async fn send_html(&self, chat_id: ChatId, html: &str) -> Result<MessageRef> {
        let msg = self
            .with_retry(|| {
                self.bot
                    .send_message(Self::tg_chat(chat_id), html.to_string())
                    .parse_mode(ParseMode::Html)
                    .disable_web_page_preview(true)
            })
            .await?;
        Ok(Self::msg_ref(chat_id, &msg))
    }

    async fn send_html_with_keyboard(
        &self,
        chat_id: ChatId,
        html: &str,
        keyboard: InlineKeyboard,
    ) -> Result<MessageRef> {
        let markup = to_markup(&keyboard);
        let msg = self
            .with_retry(|| {
                self.bot
                    .send_message(Self::tg_chat(chat_id), html.to_string())
                    .parse_mode(ParseMode::Html)
                    .disable_web_page_preview(true)
                    .reply_markup(markup.clone())
            })
            .await?;
        Ok(Self::msg_ref(chat_id, &msg))
    }

    async fn edit_html(&self, msg: MessageRef, html: &str) -> Result<()> {
        self.with_retry(|| {
            self.bot
                .edit_message_text(
                    Self::tg_chat(msg.chat_id),
                    Self::tg_msg_id(msg.message_id),
                    html.to_string(),
                )
                .parse_mode(ParseMode::Html)
                .disable_web_page_preview(true)
        })
        .await?;
        Ok(())
    }

    async fn clear_keyboard(&self, msg: MessageRef) -> Result<()> {
        self.with_retry(|| {
            self.bot.edit_message_reply_markup(
                Self::tg_chat(msg.chat_id),
                Self::tg_msg_id(msg.message_id),
            )
        })
        .await?;
        Ok(())
    }

    async fn delete_message(&self, msg: MessageRef) -> Result<()> {
        self.with_retry(|| {
            self.bot
                .delete_message(Self::tg_chat(msg.chat_id), Self::tg_msg_id(msg.message_id))
        })
        .await?;
        Ok(())
    }

    async fn send_chat_action(&self, chat_id: ChatId, action: ChatAction) -> Result<()> {
        let tg_action = match action {
            ChatAction::Typing => teloxide::types::ChatAction::Typing,
            ChatAction::UploadPhoto => teloxide::types::ChatAction::UploadPhoto,
            ChatAction::RecordVoice => teloxide::types::ChatAction::RecordVoice,
            ChatAction::UploadVoice => teloxide::types::ChatAction::UploadVoice,
        };
        self.with_retry(|| self.bot.send_chat_action(Self::tg_chat(chat_id), tg_action))
            .await?;
        Ok(())
    }

    async fn send_photo(
        &self,
        chat_id: ChatId,
        photo: PhotoSource,
        caption_html: Option<&str>,
        keyboard: Option<InlineKeyboard>,
    ) -> Result<MessageRef> {
        let file = match photo {
            PhotoSource::Url(url) => InputFile::url(
                reqwest::Url::parse(&url)
                    .map_err(|e| Error::InvalidInput(format!("bad photo url {url}: {e}")))?,
            ),
            PhotoSource::Bytes(bytes) => InputFile::memory(bytes).file_name("image.png"),
        };
        let markup = keyboard.as_ref().map(to_markup);

        let msg = self
            .with_retry(|| {
                let mut req = self.bot.send_photo(Self::tg_chat(chat_id), file.clone());
                if let Some(caption) = caption_html {
                    req = req.caption(caption.to_string()).parse_mode(ParseMode::Html);
                }
                if let Some(markup) = &markup {
                    req = req.reply_markup(markup.clone());
                }
                req
            })
            .await?;
        Ok(Self::msg_ref(chat_id, &msg))
    }

    async fn send_voice(&self, chat_id: ChatId, ogg: Vec<u8>) -> Result<MessageRef> {
        let file = InputFile::memory(ogg).file_name(format!("{}.ogg", uuid::Uuid::new_v4()));
        let msg = self
            .with_retry(|| self.bot.send_voice(Self::tg_chat(chat_id), file.clone()))
            .await?;
        Ok(Self::msg_ref(chat_id, &msg))
    }

    async fn answer_callback_query(
        &self,
        callback_id: &str,
        text: Option<&str>,
        show_alert: bool,
    ) -> Result<()> {
        self.with_retry(|| {
            let mut req = self.bot.answer_callback_query(callback_id.to_string());
            if let Some(t) = text {
                req = req.text(t.to_string()).show_alert(show_alert);
            }
            req
        })
        .await?;
        Ok(())
    }
}
