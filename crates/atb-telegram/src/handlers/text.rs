use std::sync::Arc;

use teloxide::prelude::*;

use atb_core::{domain::ChatId, utils::AuditEvent};

use crate::router::AppState;

use super::{check_rate_limit, report_error, Caller};

pub async fn handle_text(_bot: Bot, msg: Message, state: Arc<AppState>) -> ResponseResult<()> {
    let Some(user) = msg.from() else {
        return Ok(());
    };
    let Some(text) = msg.text().map(|s| s.trim().to_string()) else {
        return Ok(());
    };
    if text.is_empty() {
        return Ok(());
    }

    let caller = Caller::new(user, ChatId(msg.chat.id.0));
    if !check_rate_limit(&state, &caller).await {
        return Ok(());
    }

    run_chat(&state, &caller, "TEXT", &text).await;
    Ok(())
}

/// Forward `text` to the caller's active conversation and audit the exchange.
pub(crate) async fn run_chat(state: &AppState, caller: &Caller, kind: &str, text: &str) {
    if let Err(e) = state
        .assistants
        .ensure_user_and_personal_assistant(caller.user, &caller.first_name)
        .await
    {
        report_error(state, caller, &e, "ensure user").await;
        return;
    }

    match state
        .chat
        .send(caller.user, caller.chat, text, state.messenger.as_ref())
        .await
    {
        Ok(turn) => {
            if let Err(e) = state.audit.write(AuditEvent::message(
                caller.user.0,
                &caller.username,
                kind,
                text,
                Some(&turn.text),
            )) {
                tracing::warn!(error = %e, "failed to write audit event");
            }
        }
        Err(e) => report_error(state, caller, &e, "chat").await,
    }
}
