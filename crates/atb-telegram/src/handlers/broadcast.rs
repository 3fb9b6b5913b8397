use std::{future::Future, time::Duration};

use teloxide::prelude::*;

use atb_core::{
    domain::UserId,
    errors::Error,
    security::is_admin,
    Result,
};

use crate::router::AppState;

use super::Caller;

/// Gap between two deliveries, under Telegram's global send limit.
const SPACING: Duration = Duration::from_millis(250);
const RETRY_DELAY: Duration = Duration::from_secs(2);

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct BroadcastReport {
    pub sent: usize,
    pub failed: usize,
}

/// Deliver to every target in order, retrying each failure once.
pub async fn broadcast<F, Fut, E>(
    targets: &[UserId],
    spacing: Duration,
    retry_delay: Duration,
    mut send: F,
) -> BroadcastReport
where
    F: FnMut(UserId) -> Fut,
    Fut: Future<Output = std::result::Result<(), E>>,
    E: std::fmt::Display,
{
    let mut report = BroadcastReport::default();
    for (i, &target) in targets.iter().enumerate() {
        if i > 0 {
            tokio::time::sleep(spacing).await;
        }
        let delivered = match send(target).await {
            Ok(()) => true,
            Err(first) => {
                tracing::debug!(user_id = target.0, error = %first, "broadcast retry");
                tokio::time::sleep(retry_delay).await;
                match send(target).await {
                    Ok(()) => true,
                    Err(e) => {
                        tracing::warn!(user_id = target.0, error = %e, "broadcast delivery failed");
                        false
                    }
                }
            }
        };
        if delivered {
            report.sent += 1;
        } else {
            report.failed += 1;
        }
    }
    report
}

/// `/broadcast` as a reply: copy the replied-to message to every user.
pub(crate) async fn handle_broadcast(
    bot: &Bot,
    msg: &Message,
    state: &AppState,
    caller: &Caller,
) -> Result<()> {
    if !is_admin(caller.user, &state.cfg.admins) {
        return Err(Error::Forbidden("broadcast".to_string()));
    }
    let Some(source) = msg.reply_to_message() else {
        state
            .messenger
            .send_html(
                caller.chat,
                "Reply to the message you want to broadcast with /broadcast.",
            )
            .await?;
        return Ok(());
    };

    let targets = state.store.all_user_ids()?;
    state
        .messenger
        .send_html(
            caller.chat,
            &format!("📣 Broadcasting to {} users...", targets.len()),
        )
        .await?;
    tracing::info!(admin_id = caller.user.0, targets = targets.len(), "broadcast started");

    let from_chat = source.chat.id;
    let message_id = source.id;
    let report = broadcast(&targets, SPACING, RETRY_DELAY, |user| async move {
        bot.copy_message(teloxide::types::ChatId(user.0), from_chat, message_id)
            .await
            .map(|_| ())
    })
    .await;

    tracing::info!(sent = report.sent, failed = report.failed, "broadcast finished");
    state
        .messenger
        .send_html(
            caller.chat,
            &format!(
                "📣 Broadcast finished: {} delivered, {} failed.",
                report.sent, report.failed
            ),
        )
        .await?;
    Ok(())
}
