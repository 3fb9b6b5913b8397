//! Telegram update handlers.
//!
//! Each handler is a small adapter that:
//! - validates auth + rate limits
//! - calls into the `atb-core` services
//! - renders the outcome with the views in `views`

use std::sync::Arc;

use teloxide::{
    prelude::*,
    types::{CallbackQuery, InlineQuery, Message},
};

use atb_core::{
    domain::{ChatId, UserId},
    errors::Error,
    formatting::capitalize,
    security::is_authorized,
    utils::AuditEvent,
};

use crate::router::AppState;

mod broadcast;
mod callback;
mod commands;
mod inline;
mod text;
pub mod views;
mod voice;

/// Who sent an update, in core terms.
#[derive(Clone, Debug)]
pub(crate) struct Caller {
    pub user: UserId,
    pub chat: ChatId,
    pub first_name: String,
    pub username: String,
}

impl Caller {
    pub fn new(user: &teloxide::types::User, chat: ChatId) -> Self {
        Self {
            user: UserId(user.id.0 as i64),
            chat,
            first_name: user.first_name.clone(),
            username: user
                .username
                .clone()
                .unwrap_or_else(|| "unknown".to_string()),
        }
    }
}

/// Text shown to the user for a failed operation.
pub(crate) fn user_error(err: &Error) -> String {
    match err {
        Error::InsufficientBalance => {
            "🚫 You are out of tokens. Top up your balance in /wallet.".to_string()
        }
        Error::NoActiveConversation => {
            "💬 You are not in a conversation. Use /chat to start one.".to_string()
        }
        Error::Busy => {
            "⏳ Still answering your previous message. Use /stop to cancel it.".to_string()
        }
        Error::Forbidden(_) => "🚫 You don't have access to that.".to_string(),
        Error::NotFound(_) => "🚫 It no longer exists.".to_string(),
        Error::InvalidInput(msg) => format!("⚠️ {}", capitalize(msg)),
        _ => "❌ Something went wrong. Please try again.".to_string(),
    }
}

/// Send the user-facing error and record it in the audit log.
pub(crate) async fn report_error(state: &AppState, caller: &Caller, err: &Error, context: &str) {
    tracing::warn!(user_id = caller.user.0, context, error = %err, "request failed");
    if let Err(e) = state.audit.write(AuditEvent::error(
        caller.user.0,
        &caller.username,
        &err.to_string(),
        Some(context),
    )) {
        tracing::warn!(error = %e, "failed to write audit event");
    }
    let _ = state
        .messenger
        .send_html(caller.chat, &user_error(err))
        .await;
}

/// Consume one rate-limit token; tells the user when they are over the limit.
pub(crate) async fn check_rate_limit(state: &AppState, caller: &Caller) -> bool {
    let verdict = state.rate_limiter.lock().await.check(caller.user);
    let Err(retry_after) = verdict else {
        return true;
    };
    let retry = retry_after.as_secs_f64();
    if let Err(e) = state
        .audit
        .write(AuditEvent::rate_limit(caller.user.0, &caller.username, retry))
    {
        tracing::warn!(error = %e, "failed to write audit event");
    }
    let _ = state
        .messenger
        .send_html(
            caller.chat,
            &format!("⏳ Rate limited. Please wait {retry:.1} seconds."),
        )
        .await;
    false
}

pub async fn handle_callback(
    bot: Bot,
    q: CallbackQuery,
    state: Arc<AppState>,
) -> ResponseResult<()> {
    callback::handle_callback(bot, q, state).await
}

pub async fn handle_inline_query(
    bot: Bot,
    q: InlineQuery,
    state: Arc<AppState>,
) -> ResponseResult<()> {
    inline::handle_inline_query(bot, q, state).await
}

pub async fn handle_message(bot: Bot, msg: Message, state: Arc<AppState>) -> ResponseResult<()> {
    let chat_id = msg.chat.id.0;
    let Some(user) = msg.from() else {
        return Ok(());
    };

    if !is_authorized(
        Some(UserId(user.id.0 as i64)),
        &state.cfg.allowed_users,
    ) {
        let caller = Caller::new(user, ChatId(chat_id));
        let _ = state
            .audit
            .write(AuditEvent::auth(caller.user.0, &caller.username, false));
        let _ = bot
            .send_message(
                msg.chat.id,
                "Unauthorized. Contact the bot owner for access.",
            )
            .await;
        return Ok(());
    }

    if let Some(text) = msg.text() {
        if text.starts_with('/') {
            return commands::handle_command(bot, msg, state).await;
        }

        let locks = state.chat_locks.clone();
        locks.spawn_turn(chat_id, async move {
            let _ = text::handle_text(bot, msg, state).await;
        });
        return Ok(());
    }

    if msg.voice().is_some() {
        let locks = state.chat_locks.clone();
        locks.spawn_turn(chat_id, async move {
            let _ = voice::handle_voice(bot, msg, state).await;
        });
        return Ok(());
    }

    let _ = bot
        .send_message(
            msg.chat.id,
            "I can read text and voice messages. See /help.",
        )
        .await;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn domain_errors_have_friendly_text() {
        assert!(user_error(&Error::InsufficientBalance).contains("/wallet"));
        assert!(user_error(&Error::NoActiveConversation).contains("/chat"));
        assert_eq!(
            user_error(&Error::InvalidInput("assistant name is empty".to_string())),
            "⚠️ Assistant name is empty"
        );
        assert_eq!(
            user_error(&Error::External("http 500".to_string())),
            "❌ Something went wrong. Please try again."
        );
    }
}
