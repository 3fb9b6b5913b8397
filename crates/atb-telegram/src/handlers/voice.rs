use std::{
    path::PathBuf,
    sync::atomic::{AtomicUsize, Ordering},
    sync::Arc,
};

use teloxide::{net::Download, prelude::*};

use atb_core::{
    domain::ChatId,
    errors::Error,
    formatting::{escape_html, truncate_with_ellipsis},
};

use crate::router::AppState;

use super::{check_rate_limit, report_error, text::run_chat, Caller};

static VOICE_COUNTER: AtomicUsize = AtomicUsize::new(1);

async fn download_voice(
    bot: &Bot,
    state: &AppState,
    voice: &teloxide::types::Voice,
) -> anyhow::Result<PathBuf> {
    let file = bot.get_file(voice.file.id.clone()).await?;

    let ts = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis();
    let n = VOICE_COUNTER.fetch_add(1, Ordering::SeqCst);
    let path = state.cfg.temp_dir.join(format!("voice_{ts}_{n}.ogg"));

    let mut dst = tokio::fs::File::create(&path).await?;
    bot.download_file(&file.path, &mut dst).await?;
    Ok(path)
}

pub async fn handle_voice(bot: Bot, msg: Message, state: Arc<AppState>) -> ResponseResult<()> {
    let Some(user) = msg.from() else {
        return Ok(());
    };
    let Some(voice) = msg.voice() else {
        return Ok(());
    };
    let caller = Caller::new(user, ChatId(msg.chat.id.0));

    match state.chat.has_active_conversation(caller.user) {
        Ok(true) => {}
        Ok(false) => {
            report_error(
                &state,
                &caller,
                &Error::NoActiveConversation,
                "voice",
            )
            .await;
            return Ok(());
        }
        Err(e) => {
            report_error(&state, &caller, &e, "voice").await;
            return Ok(());
        }
    }

    if !check_rate_limit(&state, &caller).await {
        return Ok(());
    }

    let status = state
        .messenger
        .send_html(caller.chat, "🎤 Transcribing...")
        .await
        .ok();

    let voice_path = match download_voice(&bot, &state, voice).await {
        Ok(p) => p,
        Err(e) => {
            tracing::warn!(user_id = caller.user.0, error = %e, "voice download failed");
            let _ = state
                .messenger
                .send_html(
                    caller.chat,
                    &format!(
                        "❌ Failed to download voice: {}",
                        escape_html(&truncate_with_ellipsis(&e.to_string(), 200))
                    ),
                )
                .await;
            return Ok(());
        }
    };

    let transcript = state.api.transcribe(&voice_path).await;
    let _ = tokio::fs::remove_file(&voice_path).await;

    let transcript = match transcript {
        Ok(t) => t,
        Err(e) => {
            tracing::warn!(user_id = caller.user.0, error = %e, "transcription failed");
            match status {
                Some(st) => {
                    let _ = state.messenger.edit_html(st, "❌ Transcription failed.").await;
                }
                None => {
                    let _ = state
                        .messenger
                        .send_html(caller.chat, "❌ Transcription failed.")
                        .await;
                }
            }
            return Ok(());
        }
    };

    if let Some(st) = status {
        let preview = escape_html(&truncate_with_ellipsis(&transcript, 300));
        let _ = state
            .messenger
            .edit_html(st, &format!("🎤 <i>\"{preview}\"</i>"))
            .await;
    }

    run_chat(&state, &caller, "VOICE", &transcript).await;
    Ok(())
}
