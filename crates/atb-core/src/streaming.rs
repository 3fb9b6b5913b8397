//! Live rendering of one assistant reply into a Telegram message.
//!
//! - the "please wait" placeholder becomes the streamed message
//! - edits are throttled and skipped when nothing changed
//! - the final text replaces the draft, split into several messages when long

use std::time::Instant;

use crate::{
    config::Config,
    domain::{ChatId, MessageRef},
    formatting::{escape_html, markdown_to_html, split_text, truncate_with_ellipsis},
    messaging::port::MessagingPort,
    Result,
};

#[derive(Clone, Debug)]
pub struct StreamingReply {
    pub chat_id: ChatId,
    placeholder: Option<MessageRef>,
    message: Option<MessageRef>,
    buffer: String,
    last_edit: Option<Instant>,
    last_content: String,
}

impl StreamingReply {
    pub fn new(chat_id: ChatId, placeholder: Option<MessageRef>) -> Self {
        Self {
            chat_id,
            placeholder,
            message: None,
            buffer: String::new(),
            last_edit: None,
            last_content: String::new(),
        }
    }

    /// Text streamed so far for the current message.
    pub fn draft(&self) -> &str {
        &self.buffer
    }

    pub async fn push_delta(
        &mut self,
        cfg: &Config,
        api: &dyn MessagingPort,
        delta: &str,
    ) -> Result<()> {
        self.push_delta_at(cfg, api, delta, Instant::now()).await
    }

    pub async fn push_delta_at(
        &mut self,
        cfg: &Config,
        api: &dyn MessagingPort,
        delta: &str,
        now: Instant,
    ) -> Result<()> {
        self.buffer.push_str(delta);

        // Drafts are shown escaped; half-written markdown does not convert cleanly.
        let display = escape_html(&truncate_with_ellipsis(&self.buffer, cfg.telegram_safe_limit));

        let Some(msg) = self.message else {
            let msg = match self.placeholder.take() {
                Some(placeholder) => {
                    api.edit_html(placeholder, &display).await?;
                    placeholder
                }
                None => api.send_html(self.chat_id, &display).await?,
            };
            self.message = Some(msg);
            self.last_content = display;
            self.last_edit = Some(now);
            return Ok(());
        };

        if let Some(last) = self.last_edit {
            if now.duration_since(last) <= cfg.streaming_throttle {
                return Ok(());
            }
        }
        if self.last_content == display {
            return Ok(());
        }

        if let Err(e) = api.edit_html(msg, &display).await {
            tracing::debug!(error = %e, "streaming edit failed");
        }
        self.last_content = display;
        self.last_edit = Some(now);
        Ok(())
    }

    /// Replace the draft with the final rendering of `text`. The next delta
    /// starts a new message.
    pub async fn finish(&mut self, cfg: &Config, api: &dyn MessagingPort, text: &str) -> Result<()> {
        let message = self.message.take().or_else(|| self.placeholder.take());
        self.buffer.clear();
        self.last_edit = None;
        self.last_content.clear();

        if text.trim().is_empty() {
            if let Some(msg) = message {
                let _ = api.delete_message(msg).await;
            }
            return Ok(());
        }

        let html = markdown_to_html(text);
        if let Some(msg) = message {
            if html.len() <= cfg.telegram_message_limit {
                return api.edit_html(msg, &html).await;
            }
            let _ = api.delete_message(msg).await;
        }

        // Convert per chunk so each message stays well-formed HTML.
        for chunk in split_text(text, cfg.telegram_safe_limit) {
            api.send_html(self.chat_id, &markdown_to_html(chunk.trim_end()))
                .await?;
        }
        Ok(())
    }

    /// Remove the placeholder if no text ever used it.
    pub async fn discard_placeholder(&mut self, api: &dyn MessagingPort) {
        if let Some(placeholder) = self.placeholder.take() {
            let _ = api.delete_message(placeholder).await;
        }
    }
}
