use std::{collections::HashMap, future::Future, sync::Arc};

use teloxide::{dispatching::Dispatcher, dptree, prelude::*, types::BotCommand};

use tokio::{
    sync::{Mutex, OwnedMutexGuard},
    task::JoinHandle,
};

use atb_core::messaging::throttled::{ThrottleConfig, ThrottledMessenger};
use atb_core::{
    assistant::{api::AssistantsApi, service::AssistantService},
    chat::ChatService,
    config::Config,
    messaging::port::MessagingPort,
    security::RateLimiter,
    store::Store,
    utils::AuditLogger,
    wallet::WalletService,
};

use crate::handlers;
use crate::TelegramMessenger;

#[derive(Clone)]
pub struct AppState {
    pub cfg: Arc<Config>,
    pub store: Arc<Store>,
    pub api: Arc<dyn AssistantsApi>,
    pub assistants: Arc<AssistantService>,
    pub chat: Arc<ChatService>,
    pub wallet: Arc<WalletService>,
    pub messenger: Arc<dyn MessagingPort>,
    pub rate_limiter: Arc<Mutex<RateLimiter>>,
    pub chat_locks: Arc<ChatLocks>,
    pub audit: Arc<AuditLogger>,
}

/// Core services the binary wires together before polling starts.
pub struct Services {
    pub store: Arc<Store>,
    pub api: Arc<dyn AssistantsApi>,
    pub assistants: Arc<AssistantService>,
    pub chat: Arc<ChatService>,
    pub wallet: Arc<WalletService>,
}

/// Serializes chat turns per chat so replies never interleave.
#[derive(Default)]
pub struct ChatLocks {
    inner: Mutex<HashMap<i64, Arc<Mutex<()>>>>,
}

impl ChatLocks {
    pub async fn lock_chat(&self, chat_id: i64) -> OwnedMutexGuard<()> {
        let lock = {
            let mut map = self.inner.lock().await;
            map.entry(chat_id)
                .or_insert_with(|| Arc::new(Mutex::new(())))
                .clone()
        };
        lock.lock_owned().await
    }

    /// Run a chat turn in its own task, after earlier turns of the same chat.
    ///
    /// The dispatcher handles one update per chat at a time, so awaiting a
    /// streaming reply inline would hold `/stop` until the reply is done.
    pub fn spawn_turn<F>(self: &Arc<Self>, chat_id: i64, turn: F) -> JoinHandle<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let locks = Arc::clone(self);
        tokio::spawn(async move {
            let _guard = locks.lock_chat(chat_id).await;
            turn.await;
        })
    }
}

fn bot_commands() -> Vec<BotCommand> {
    vec![
        BotCommand::new("start", "Show help"),
        BotCommand::new("chat", "Talk to an assistant"),
        BotCommand::new("assistants", "Manage your assistants"),
        BotCommand::new("new", "Create an assistant: Name | instructions"),
        BotCommand::new("leave", "Leave the current conversation"),
        BotCommand::new("stop", "Stop the reply being generated"),
        BotCommand::new("voice", "Toggle voice replies"),
        BotCommand::new("voices", "Pick the reply voice"),
        BotCommand::new("wallet", "Balance and top-ups"),
    ]
}

pub async fn run_polling(cfg: Arc<Config>, services: Services) -> anyhow::Result<()> {
    let bot = Bot::new(cfg.bot_token.clone());

    match bot.get_me().await {
        Ok(me) => tracing::info!(username = %me.username(), version = %cfg.bot_version, "bot started"),
        Err(e) => tracing::warn!(error = %e, "get_me failed"),
    }
    tracing::info!(
        allowed_users = cfg.allowed_users.len(),
        admins = cfg.admins.len(),
        payments = services.wallet.payments_enabled(),
        "configuration loaded"
    );

    if let Err(e) = bot.set_my_commands(bot_commands()).await {
        tracing::warn!(error = %e, "set_my_commands failed");
    }

    // Streaming replies edit messages often; throttle before Telegram does.
    let raw_messenger: Arc<dyn MessagingPort> = Arc::new(TelegramMessenger::new(bot.clone()));
    let messenger: Arc<dyn MessagingPort> = Arc::new(ThrottledMessenger::new(
        raw_messenger,
        ThrottleConfig::default(),
    ));

    let state = Arc::new(AppState {
        cfg: cfg.clone(),
        store: services.store,
        api: services.api,
        assistants: services.assistants,
        chat: services.chat,
        wallet: services.wallet,
        messenger,
        rate_limiter: Arc::new(Mutex::new(RateLimiter::new(
            cfg.rate_limit_enabled,
            cfg.rate_limit_requests,
            cfg.rate_limit_window,
        ))),
        chat_locks: Arc::new(ChatLocks::default()),
        audit: Arc::new(AuditLogger::new(
            cfg.audit_log_path.clone(),
            cfg.audit_log_json,
        )),
    });

    let handler = dptree::entry()
        .branch(Update::filter_callback_query().endpoint(handlers::handle_callback))
        .branch(Update::filter_inline_query().endpoint(handlers::handle_inline_query))
        .branch(Update::filter_message().endpoint(handlers::handle_message));

    Dispatcher::builder(bot, handler)
        .dependencies(dptree::deps![state])
        .enable_ctrlc_handler()
        .build()
        .dispatch()
        .await;

    tracing::info!("bot stopped");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn chat_lock_is_per_chat() {
        let locks = ChatLocks::default();
        let _a = locks.lock_chat(1).await;

        // Another chat is not blocked.
        let other = tokio::time::timeout(Duration::from_millis(50), locks.lock_chat(2)).await;
        assert!(other.is_ok());

        // The same chat waits.
        let same = tokio::time::timeout(Duration::from_millis(50), locks.lock_chat(1)).await;
        assert!(same.is_err());
    }

    #[tokio::test]
    async fn pending_turn_does_not_block_the_caller() {
        use tokio::sync::{mpsc, oneshot};

        let locks = Arc::new(ChatLocks::default());
        let (release, released) = oneshot::channel::<()>();
        let (log_tx, mut log) = mpsc::unbounded_channel();

        let first_log = log_tx.clone();
        let first = locks.spawn_turn(42, async move {
            let _ = first_log.send("first started");
            let _ = released.await;
            let _ = first_log.send("first done");
        });
        assert_eq!(log.recv().await, Some("first started"));

        // The caller is free while the turn is pending, e.g. to handle /stop.
        let second_log = log_tx.clone();
        let second = locks.spawn_turn(42, async move {
            let _ = second_log.send("second started");
        });
        let other_chat_log = log_tx.clone();
        locks
            .spawn_turn(7, async move {
                let _ = other_chat_log.send("other chat");
            })
            .await
            .unwrap();
        assert_eq!(log.recv().await, Some("other chat"));
        assert!(log.try_recv().is_err());

        release.send(()).unwrap();
        first.await.unwrap();
        second.await.unwrap();
        assert_eq!(log.recv().await, Some("first done"));
        assert_eq!(log.recv().await, Some("second started"));
    }

    #[test]
    fn commands_are_lowercase() {
        for c in bot_commands() {
            assert_eq!(c.command, c.command.to_lowercase());
        }
    }
}
