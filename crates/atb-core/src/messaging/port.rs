use async_trait::async_trait;

use crate::{
    domain::{ChatId, MessageRef},
    messaging::types::{ChatAction, InlineKeyboard, PhotoSource},
    Result,
};

/// Outbound messenger port used by the services.
///
/// All text arguments are Telegram-flavoured HTML.
#[async_trait]
pub trait MessagingPort: Send + Sync {
    async fn send_html(&self, chat_id: ChatId, html: &str) -> Result<MessageRef>;

    async fn send_html_with_keyboard(
        &self,
        chat_id: ChatId,
        html: &str,
        keyboard: InlineKeyboard,
    ) -> Result<MessageRef>;

    async fn edit_html(&self, msg: MessageRef, html: &str) -> Result<()>;

    /// Drop the inline keyboard under a message, keeping its text.
    async fn clear_keyboard(&self, msg: MessageRef) -> Result<()>;

    async fn delete_message(&self, msg: MessageRef) -> Result<()>;

    async fn send_chat_action(&self, chat_id: ChatId, action: ChatAction) -> Result<()>;

    async fn send_photo(
        &self,
        chat_id: ChatId,
        photo: PhotoSource,
        caption_html: Option<&str>,
        keyboard: Option<InlineKeyboard>,
    ) -> Result<MessageRef>;

    async fn send_voice(&self, chat_id: ChatId, ogg: Vec<u8>) -> Result<MessageRef>;

    async fn answer_callback_query(
        &self,
        callback_id: &str,
        text: Option<&str>,
        show_alert: bool,
    ) -> Result<()>;
}
