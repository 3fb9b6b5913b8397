use std::sync::Arc;

use teloxide::prelude::*;

use atb_core::{domain::ChatId, errors::Error, formatting::escape_html, Result};

use crate::router::AppState;

use super::{broadcast, report_error, views, Caller};

fn parse_command(text: &str) -> (String, String) {
    // Telegram may send `/cmd@botname arg1 ...`
    let mut parts = text.trim().splitn(2, char::is_whitespace);
    let first = parts.next().unwrap_or("").trim();
    let rest = parts.next().unwrap_or("").trim().to_string();

    let cmd = first
        .trim_start_matches('/')
        .split('@')
        .next()
        .unwrap_or("")
        .to_lowercase();

    (cmd, rest)
}

/// `Name | instructions`
fn parse_new_assistant(args: &str) -> Option<(&str, &str)> {
    let (name, instructions) = args.split_once('|')?;
    let (name, instructions) = (name.trim(), instructions.trim());
    if name.is_empty() || instructions.is_empty() {
        return None;
    }
    Some((name, instructions))
}

pub async fn handle_command(bot: Bot, msg: Message, state: Arc<AppState>) -> ResponseResult<()> {
    let Some(user) = msg.from() else {
        return Ok(());
    };
    let Some(text) = msg.text() else {
        return Ok(());
    };
    let caller = Caller::new(user, ChatId(msg.chat.id.0));
    let (cmd, args) = parse_command(text);

    let result = match cmd.as_str() {
        "start" | "help" => cmd_help(&state, &caller).await,
        "chat" => cmd_chat(&state, &caller).await,
        "assistants" => cmd_assistants(&state, &caller).await,
        "new" => cmd_new(&state, &caller, &args).await,
        "leave" => cmd_leave(&state, &caller).await,
        "stop" => cmd_stop(&state, &caller).await,
        "voice" => cmd_voice(&state, &caller).await,
        "voices" => cmd_voices(&state, &caller, &args).await,
        "wallet" => cmd_wallet(&state, &caller).await,
        "broadcast" => broadcast::handle_broadcast(&bot, &msg, &state, &caller).await,
        _ => state
            .messenger
            .send_html(caller.chat, "Unknown command. See /help.")
            .await
            .map(|_| ()),
    };

    if let Err(e) = result {
        report_error(&state, &caller, &e, &format!("/{cmd}")).await;
    }
    Ok(())
}

async fn cmd_help(state: &AppState, caller: &Caller) -> Result<()> {
    state
        .assistants
        .ensure_user_and_personal_assistant(caller.user, &caller.first_name)
        .await?;
    state
        .messenger
        .send_html(caller.chat, &views::help(&state.cfg.bot_version))
        .await?;
    Ok(())
}

async fn cmd_chat(state: &AppState, caller: &Caller) -> Result<()> {
    state
        .assistants
        .ensure_user_and_personal_assistant(caller.user, &caller.first_name)
        .await?;
    let page = state.chat.conversations(caller.user, 1)?;
    let (html, kb) = views::conversations_list(&page);
    state
        .messenger
        .send_html_with_keyboard(caller.chat, &html, kb)
        .await?;
    Ok(())
}

async fn cmd_assistants(state: &AppState, caller: &Caller) -> Result<()> {
    state
        .assistants
        .ensure_user_and_personal_assistant(caller.user, &caller.first_name)
        .await?;
    let page = state.assistants.list(caller.user, 1)?;
    let (html, kb) = views::assistants_list(&page);
    state
        .messenger
        .send_html_with_keyboard(caller.chat, &html, kb)
        .await?;
    Ok(())
}

async fn cmd_new(state: &AppState, caller: &Caller, args: &str) -> Result<()> {
    let Some((name, instructions)) = parse_new_assistant(args) else {
        state
            .messenger
            .send_html(
                caller.chat,
                "Usage: <code>/new Name | instructions</code>\n\nExample: <code>/new Chef | You suggest recipes from what is in my fridge.</code>",
            )
            .await?;
        return Ok(());
    };

    state
        .assistants
        .ensure_user_and_personal_assistant(caller.user, &caller.first_name)
        .await?;
    let assistant = state
        .assistants
        .create_assistant(caller.user, name, instructions)
        .await?;
    let details = state.assistants.details(caller.user, &assistant.id)?;
    let (html, kb) = views::assistant_details(&details);
    state
        .messenger
        .send_html(
            caller.chat,
            &format!("✅ Assistant <b>{}</b> created.", escape_html(&assistant.name)),
        )
        .await?;
    state
        .messenger
        .send_html_with_keyboard(caller.chat, &html, kb)
        .await?;
    Ok(())
}

async fn cmd_leave(state: &AppState, caller: &Caller) -> Result<()> {
    let text = match state.chat.leave(caller.user)? {
        Some(a) => format!(
            "🚪 You left the conversation with <b>{}</b>.",
            escape_html(&a.name)
        ),
        None => "You are not in a conversation.".to_string(),
    };
    state.messenger.send_html(caller.chat, &text).await?;
    Ok(())
}

async fn cmd_stop(state: &AppState, caller: &Caller) -> Result<()> {
    let text = if state.chat.stop(caller.user) {
        "⏹ Stopping the current reply."
    } else {
        "Nothing to stop."
    };
    state.messenger.send_html(caller.chat, text).await?;
    Ok(())
}

async fn cmd_voice(state: &AppState, caller: &Caller) -> Result<()> {
    let user = state
        .assistants
        .ensure_user_and_personal_assistant(caller.user, &caller.first_name)
        .await?;
    let enabled = !user.voice_response;
    state.store.set_voice_response(caller.user, enabled)?;
    let text = if enabled {
        format!(
            "🔊 Voice replies are on (voice: <b>{}</b>).",
            escape_html(&user.voice)
        )
    } else {
        "🔇 Voice replies are off.".to_string()
    };
    state.messenger.send_html(caller.chat, &text).await?;
    Ok(())
}

async fn cmd_voices(state: &AppState, caller: &Caller, args: &str) -> Result<()> {
    let user = state
        .assistants
        .ensure_user_and_personal_assistant(caller.user, &caller.first_name)
        .await?;
    let choice = args.trim().to_lowercase();
    if choice.is_empty() {
        state
            .messenger
            .send_html(
                caller.chat,
                &format!(
                    "🗣 Current voice: <b>{}</b>\nAvailable: {}\n\nUsage: <code>/voices name</code>",
                    escape_html(&user.voice),
                    views::VOICES.join(", ")
                ),
            )
            .await?;
        return Ok(());
    }
    if !views::VOICES.contains(&choice.as_str()) {
        return Err(Error::InvalidInput(format!(
            "unknown voice {choice}. Available: {}",
            views::VOICES.join(", ")
        )));
    }
    state.store.set_voice(caller.user, &choice)?;
    state
        .messenger
        .send_html(caller.chat, &format!("🗣 Voice set to <b>{choice}</b>."))
        .await?;
    Ok(())
}

async fn cmd_wallet(state: &AppState, caller: &Caller) -> Result<()> {
    state
        .assistants
        .ensure_user_and_personal_assistant(caller.user, &caller.first_name)
        .await?;
    let account = state.wallet.account(caller.user)?;
    let (html, kb) = views::wallet(&account, state.wallet.payments_enabled());
    state
        .messenger
        .send_html_with_keyboard(caller.chat, &html, kb)
        .await?;
    Ok(())
}
