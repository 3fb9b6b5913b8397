use std::{collections::HashMap, sync::Arc, time::Duration};

use async_trait::async_trait;
use tokio::sync::Mutex;
use tokio::time::{sleep_until, Instant};

use crate::{
    domain::{ChatId, MessageRef},
    messaging::{
        port::MessagingPort,
        types::{ChatAction, InlineKeyboard, PhotoSource},
    },
    Result,
};

#[derive(Clone, Copy, Debug)]
pub struct ThrottleConfig {
    /// Minimum spacing between any two outbound calls.
    pub global_min_interval: Duration,
    /// Minimum spacing between calls that target the same chat.
    pub per_chat_min_interval: Duration,
}

impl Default for ThrottleConfig {
    fn default() -> Self {
        Self {
            global_min_interval: Duration::from_millis(40),
            per_chat_min_interval: Duration::from_millis(1050),
        }
    }
}

/// Hands out evenly spaced time slots.
#[derive(Debug)]
struct SlotClock {
    interval: Duration,
    next_free: Instant,
}

impl SlotClock {
    fn new(interval: Duration) -> Self {
        Self {
            interval,
            next_free: Instant::now(),
        }
    }

    fn claim(&mut self) -> Instant {
        let slot = self.next_free.max(Instant::now());
        self.next_free = slot + self.interval;
        slot
    }
}

/// MessagingPort decorator that spaces out outbound calls to stay under
/// Telegram flood limits while a reply is being streamed.
pub struct ThrottledMessenger {
    inner: Arc<dyn MessagingPort>,
    cfg: ThrottleConfig,
    global: Mutex<SlotClock>,
    chats: Mutex<HashMap<ChatId, SlotClock>>,
}

impl ThrottledMessenger {
    pub fn new(inner: Arc<dyn MessagingPort>, cfg: ThrottleConfig) -> Self {
        Self {
            inner,
            cfg,
            global: Mutex::new(SlotClock::new(cfg.global_min_interval)),
            chats: Mutex::new(HashMap::new()),
        }
    }

    async fn wait_for_chat(&self, chat_id: ChatId) {
        let global_slot = self.global.lock().await.claim();
        let chat_slot = {
            let mut chats = self.chats.lock().await;
            chats
                .entry(chat_id)
                .or_insert_with(|| SlotClock::new(self.cfg.per_chat_min_interval))
                .claim()
        };
        sleep_until(global_slot.max(chat_slot)).await;
    }

    async fn wait_global(&self) {
        let slot = self.global.lock().await.claim();
        sleep_until(slot).await;
    }
}

#[async_trait]
impl MessagingPort for ThrottledMessenger {
    async fn send_html(&self, chat_id: ChatId, html: &str) -> Result<MessageRef> {
        self.wait_for_chat(chat_id).await;
        self.inner.send_html(chat_id, html).await
    }

    async fn send_html_with_keyboard(
        &self,
        chat_id: ChatId,
        html: &str,
        keyboard: InlineKeyboard,
    ) -> Result<MessageRef> {
        self.wait_for_chat(chat_id).await;
        self.inner
            .send_html_with_keyboard(chat_id, html, keyboard)
            .await
    }

    async fn edit_html(&self, msg: MessageRef, html: &str) -> Result<()> {
        self.wait_for_chat(msg.chat_id).await;
        self.inner.edit_html(msg, html).await
    }

    async fn clear_keyboard(&self, msg: MessageRef) -> Result<()> {
        self.wait_for_chat(msg.chat_id).await;
        self.inner.clear_keyboard(msg).await
    }

    async fn delete_message(&self, msg: MessageRef) -> Result<()> {
        self.wait_for_chat(msg.chat_id).await;
        self.inner.delete_message(msg).await
    }

    async fn send_chat_action(&self, chat_id: ChatId, action: ChatAction) -> Result<()> {
        // Chat actions are cosmetic; they only take a global slot.
        self.wait_global().await;
        self.inner.send_chat_action(chat_id, action).await
    }

    async fn send_photo(
        &self,
        chat_id: ChatId,
        photo: PhotoSource,
        caption_html: Option<&str>,
        keyboard: Option<InlineKeyboard>,
    ) -> Result<MessageRef> {
        self.wait_for_chat(chat_id).await;
        self.inner
            .send_photo(chat_id, photo, caption_html, keyboard)
            .await
    }

    async fn send_voice(&self, chat_id: ChatId, ogg: Vec<u8>) -> Result<MessageRef> {
        self.wait_for_chat(chat_id).await;
        self.inner.send_voice(chat_id, ogg).await
    }

    async fn answer_callback_query(
        &self,
        callback_id: &str,
        text: Option<&str>,
        show_alert: bool,
    ) -> Result<()> {
        // No chat id here.
        self.wait_global().await;
        self.inner
            .answer_callback_query(callback_id, text, show_alert)
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::FakeMessenger;

    #[tokio::test]
    async fn same_chat_calls_are_spaced() {
        let fake = Arc::new(FakeMessenger::new());
        let throttled = ThrottledMessenger::new(
            fake.clone(),
            ThrottleConfig {
                global_min_interval: Duration::from_millis(1),
                per_chat_min_interval: Duration::from_millis(60),
            },
        );

        let start = std::time::Instant::now();
        throttled.send_html(ChatId(1), "a").await.unwrap();
        throttled.send_html(ChatId(1), "b").await.unwrap();
        throttled.send_html(ChatId(1), "c").await.unwrap();
        assert!(start.elapsed() >= Duration::from_millis(110));
        assert_eq!(fake.sent_texts(), vec!["a", "b", "c"]);
    }

    #[tokio::test]
    async fn different_chats_do_not_wait_on_each_other() {
        let fake = Arc::new(FakeMessenger::new());
        let throttled = ThrottledMessenger::new(
            fake.clone(),
            ThrottleConfig {
                global_min_interval: Duration::from_millis(1),
                per_chat_min_interval: Duration::from_secs(5),
            },
        );

        let start = std::time::Instant::now();
        throttled.send_html(ChatId(1), "a").await.unwrap();
        throttled.send_html(ChatId(2), "b").await.unwrap();
        assert!(start.elapsed() < Duration::from_secs(1));
    }
}
