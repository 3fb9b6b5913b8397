use std::sync::Arc;

use teloxide::{prelude::*, types::ParseMode};

use atb_core::{
    assistant::service::{DeleteOutcome, GuestOutcome},
    domain::{ChatId, MessageId, MessageRef, UserId},
    formatting::{escape_html, thumbnail_url},
    messaging::types::PhotoSource,
    security::is_authorized,
    utils::AuditEvent,
    wallet::InvoiceCheck,
    Result,
};

use crate::router::AppState;

use super::{user_error, views, Caller};

/// Decoded callback data. Ids never contain dots.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum CallbackAction {
    AssistantList(u32),
    Assistant(String),
    AssistantChat(String),
    AssistantCode(String),
    AssistantDelete(String),
    AssistantBack,
    ConversationList(u32),
    ConversationNew,
    ConversationNewList(u32),
    ConversationNewWith(String),
    Conversation(String),
    ConversationContinue(String),
    ConversationDelete(String),
    ConversationHistory(String),
    ConversationBack,
    ChatLeave,
    WalletTopup,
    WalletPlan(usize),
    WalletCheck(i64),
    WalletBack,
    Guest(String),
}

pub fn parse_callback(data: &str) -> Option<CallbackAction> {
    use CallbackAction::*;

    let parts: Vec<&str> = data.split('.').collect();
    let action = match parts.as_slice() {
        ["asst", "list", p] => AssistantList(p.parse().ok()?),
        ["asst", "back"] => AssistantBack,
        ["asst", id] => Assistant(id.to_string()),
        ["asst", id, "chat"] => AssistantChat(id.to_string()),
        ["asst", id, "code"] => AssistantCode(id.to_string()),
        ["asst", id, "del"] => AssistantDelete(id.to_string()),

        ["conv", "list", p] => ConversationList(p.parse().ok()?),
        ["conv", "new"] => ConversationNew,
        ["conv", "new", "list", p] => ConversationNewList(p.parse().ok()?),
        ["conv", "new", id] => ConversationNewWith(id.to_string()),
        ["conv", "back"] => ConversationBack,
        ["conv", id] => Conversation(id.to_string()),
        ["conv", id, "cont"] => ConversationContinue(id.to_string()),
        ["conv", id, "del"] => ConversationDelete(id.to_string()),
        ["conv", id, "hist"] => ConversationHistory(id.to_string()),

        ["chat", "leave"] => ChatLeave,

        ["wallet", "topup"] => WalletTopup,
        ["wallet", "topup", "plan", i] => WalletPlan(i.parse().ok()?),
        ["wallet", "check", id] => WalletCheck(id.parse().ok()?),
        ["wallet", "back"] => WalletBack,

        ["guest", id] => Guest(id.to_string()),
        _ => return None,
    };
    match &action {
        Assistant(id) | AssistantChat(id) | AssistantCode(id) | AssistantDelete(id)
        | ConversationNewWith(id) | Conversation(id) | ConversationContinue(id)
        | ConversationDelete(id) | ConversationHistory(id) | Guest(id)
            if id.is_empty() =>
        {
            None
        }
        _ => Some(action),
    }
}

struct CallbackCtx {
    bot: Bot,
    state: Arc<AppState>,
    cb_id: String,
    caller: Caller,
    message: Option<MessageRef>,
    inline_message_id: Option<String>,
}

impl CallbackCtx {
    async fn answer(&self, text: Option<&str>, alert: bool) {
        let _ = self
            .state
            .messenger
            .answer_callback_query(&self.cb_id, text, alert)
            .await;
    }

    /// Drop the keyboard of the message the button was on.
    async fn retire(&self) {
        if let Some(m) = self.message {
            let _ = self.state.messenger.clear_keyboard(m).await;
        }
    }

    async fn remove(&self) {
        if let Some(m) = self.message {
            let _ = self.state.messenger.delete_message(m).await;
        }
    }

    async fn show(&self, (html, keyboard): views::View) -> Result<()> {
        self.state
            .messenger
            .send_html_with_keyboard(self.caller.chat, &html, keyboard)
            .await?;
        Ok(())
    }

    fn user(&self) -> UserId {
        self.caller.user
    }
}

pub async fn handle_callback(
    bot: Bot,
    q: CallbackQuery,
    state: Arc<AppState>,
) -> ResponseResult<()> {
    let data = q.data.clone().unwrap_or_default();
    let message = q.message.as_ref().map(|m| MessageRef {
        chat_id: ChatId(m.chat.id.0),
        message_id: MessageId(m.id.0),
    });
    let chat = message
        .map(|m| m.chat_id)
        .unwrap_or_else(|| ChatId(q.from.id.0 as i64));

    let ctx = CallbackCtx {
        bot,
        caller: Caller::new(&q.from, chat),
        state,
        cb_id: q.id.clone(),
        message,
        inline_message_id: q.inline_message_id.clone(),
    };

    if !is_authorized(Some(ctx.user()), &ctx.state.cfg.allowed_users) {
        ctx.answer(Some("Unauthorized"), false).await;
        return Ok(());
    }

    let Some(action) = parse_callback(&data) else {
        ctx.answer(None, false).await;
        return Ok(());
    };

    if let Err(e) = run_action(&ctx, action).await {
        tracing::warn!(user_id = ctx.user().0, data = %data, error = %e, "callback failed");
        if let Err(audit_err) = ctx.state.audit.write(AuditEvent::error(
            ctx.user().0,
            &ctx.caller.username,
            &e.to_string(),
            Some("callback"),
        )) {
            tracing::warn!(error = %audit_err, "failed to write audit event");
        }
        ctx.answer(Some(&user_error(&e)), true).await;
    }
    Ok(())
}

async fn run_action(ctx: &CallbackCtx, action: CallbackAction) -> Result<()> {
    use CallbackAction::*;

    let state = &ctx.state;
    let user = ctx.user();

    match action {
        AssistantList(page) => {
            let page = state.assistants.list(user, page.max(1))?;
            ctx.answer(None, false).await;
            ctx.remove().await;
            ctx.show(views::assistants_list(&page)).await
        }
        AssistantBack => {
            let page = state.assistants.list(user, 1)?;
            ctx.answer(Some("🤖 Assistants"), false).await;
            ctx.retire().await;
            ctx.show(views::assistants_list(&page)).await
        }
        Assistant(id) => {
            let details = state.assistants.details(user, &id)?;
            let (caption, keyboard) = views::assistant_details(&details);
            ctx.answer(Some(&format!("🤖 {}", details.assistant.name)), false)
                .await;
            ctx.retire().await;
            state
                .messenger
                .send_photo(
                    ctx.caller.chat,
                    PhotoSource::Url(thumbnail_url(&details.assistant.name)),
                    Some(&caption),
                    Some(keyboard),
                )
                .await?;
            Ok(())
        }
        AssistantChat(id) | ConversationNewWith(id) => {
            let (_, assistant) = state.chat.start_conversation(user, &id).await?;
            ctx.answer(Some(&format!("💬 Chatting with {}", assistant.name)), false)
                .await;
            ctx.retire().await;
            ctx.show(views::chatting(&assistant.name)).await
        }
        AssistantCode(id) => {
            let toggle = state.assistants.toggle_code_interpreter(user, &id).await?;
            let text = if toggle.enabled {
                format!("🧮 Code interpreter enabled for {}.", toggle.name)
            } else {
                format!("🧮 Code interpreter disabled for {}.", toggle.name)
            };
            ctx.answer(Some(&text), true).await;
            Ok(())
        }
        AssistantDelete(id) => {
            let text = match state.assistants.delete_assistant(user, &id).await? {
                DeleteOutcome::LeftLibrary(a) => format!("🚪 {} removed from your library.", a.name),
                DeleteOutcome::Deleted(a) => format!("🗑 {} deleted.", a.name),
            };
            ctx.answer(Some(&text), true).await;
            ctx.retire().await;
            let page = state.assistants.list(user, 1)?;
            ctx.show(views::assistants_list(&page)).await
        }

        ConversationList(page) => {
            let page = state.chat.conversations(user, page.max(1))?;
            ctx.answer(
                Some(&format!("Page {} of {}", page.page, page.pages.max(1))),
                false,
            )
            .await;
            ctx.remove().await;
            ctx.show(views::conversations_list(&page)).await
        }
        ConversationBack => {
            let page = state.chat.conversations(user, 1)?;
            ctx.answer(Some("💬 Conversations"), false).await;
            ctx.retire().await;
            ctx.show(views::conversations_list(&page)).await
        }
        ConversationNew => {
            state
                .assistants
                .ensure_user_and_personal_assistant(user, &ctx.caller.first_name)
                .await?;
            let page = state.assistants.list(user, 1)?;
            ctx.answer(None, false).await;
            ctx.retire().await;
            ctx.show(views::choose_assistant(&page)).await
        }
        ConversationNewList(page) => {
            let page = state.assistants.list(user, page.max(1))?;
            ctx.answer(None, false).await;
            ctx.remove().await;
            ctx.show(views::choose_assistant(&page)).await
        }
        Conversation(id) => {
            let summary = state.chat.conversation(user, &id)?;
            ctx.answer(Some(&format!("💬 {}", summary.label())), false)
                .await;
            ctx.retire().await;
            ctx.show(views::conversation_details(&summary)).await
        }
        ConversationContinue(id) => {
            let (_, assistant) = state.chat.continue_conversation(user, &id)?;
            ctx.answer(Some(&format!("💬 Chatting with {}", assistant.name)), false)
                .await;
            ctx.retire().await;
            ctx.show(views::chatting(&assistant.name)).await
        }
        ConversationDelete(id) => {
            state.chat.delete_conversation(user, &id)?;
            ctx.answer(Some("🗑 Conversation deleted."), false).await;
            ctx.retire().await;
            let page = state.chat.conversations(user, 1)?;
            ctx.show(views::conversations_list(&page)).await
        }
        ConversationHistory(id) => {
            let chunks = state.chat.history(user, &id, &ctx.caller.first_name)?;
            ctx.answer(None, false).await;
            if chunks.is_empty() {
                state
                    .messenger
                    .send_html(ctx.caller.chat, "📭 No messages yet.")
                    .await?;
            }
            for chunk in chunks {
                state.messenger.send_html(ctx.caller.chat, &chunk).await?;
            }
            Ok(())
        }

        ChatLeave => {
            let text = match state.chat.leave(user)? {
                Some(a) => format!("🚪 You left the conversation with <b>{}</b>.", escape_html(&a.name)),
                None => "You are not in a conversation.".to_string(),
            };
            ctx.answer(None, false).await;
            ctx.retire().await;
            state.messenger.send_html(ctx.caller.chat, &text).await?;
            Ok(())
        }

        WalletTopup => {
            if !state.wallet.payments_enabled() {
                ctx.answer(Some("Payments are not available right now."), true)
                    .await;
                return Ok(());
            }
            ctx.answer(None, false).await;
            ctx.retire().await;
            ctx.show(views::plans(state.wallet.plans())).await
        }
        WalletPlan(index) => {
            let invoice = state.wallet.create_topup(user, index).await?;
            ctx.answer(Some("🧾 Invoice created"), false).await;
            ctx.retire().await;
            ctx.show(views::invoice(&invoice)).await
        }
        WalletCheck(invoice_id) => {
            match state.wallet.check_invoice(user, invoice_id).await? {
                InvoiceCheck::Paid { credited, balance } => {
                    if let Err(e) = state.audit.write(AuditEvent::payment(
                        user.0,
                        &ctx.caller.username,
                        invoice_id,
                        credited,
                    )) {
                        tracing::warn!(error = %e, "failed to write audit event");
                    }
                    ctx.answer(
                        Some(&format!(
                            "✅ {credited} tokens added. Balance: {balance} tokens."
                        )),
                        true,
                    )
                    .await;
                    ctx.retire().await;
                }
                InvoiceCheck::AlreadyCredited => {
                    ctx.answer(Some("This invoice was already credited."), true)
                        .await;
                    ctx.retire().await;
                }
                InvoiceCheck::Pending => {
                    ctx.answer(Some("⏳ Payment not received yet."), true).await;
                }
                InvoiceCheck::Expired => {
                    ctx.answer(Some("⌛ This invoice has expired."), true).await;
                    ctx.retire().await;
                }
            }
            Ok(())
        }
        WalletBack => {
            let account = state.wallet.account(user)?;
            ctx.answer(None, false).await;
            ctx.remove().await;
            ctx.show(views::wallet(&account, state.wallet.payments_enabled()))
                .await
        }

        Guest(id) => {
            state
                .assistants
                .ensure_user_and_personal_assistant(user, &ctx.caller.first_name)
                .await?;
            match state.assistants.add_guest(user, &id)? {
                GuestOutcome::Deleted => {
                    ctx.answer(Some("🚫 This assistant has been deleted."), true)
                        .await;
                }
                GuestOutcome::AlreadyInLibrary(a) => {
                    ctx.answer(
                        Some(&format!("🚫 You already have {} in your library.", a.name)),
                        true,
                    )
                    .await;
                }
                GuestOutcome::Added(a) => {
                    ctx.answer(Some(&format!("✅ {} added to library.", a.name)), false)
                        .await;
                    mark_guest_added(ctx, &views::guest_added(&a)).await;
                }
            }
            Ok(())
        }
    }
}

/// Replace the shared card with a confirmation. Shared cards usually live in
/// other chats, so they are addressed by inline message id.
async fn mark_guest_added(ctx: &CallbackCtx, html: &str) {
    if let Some(inline_id) = &ctx.inline_message_id {
        let _ = ctx
            .bot
            .edit_message_text_inline(inline_id.clone(), html.to_string())
            .parse_mode(ParseMode::Html)
            .await;
    } else if let Some(m) = ctx.message {
        let _ = ctx.state.messenger.edit_html(m, html).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use CallbackAction::*;

    #[test]
    fn parses_every_menu_action() {
        let cases = [
            ("asst.list.2", AssistantList(2)),
            ("asst.back", AssistantBack),
            ("asst.a1", Assistant("a1".to_string())),
            ("asst.a1.chat", AssistantChat("a1".to_string())),
            ("asst.a1.code", AssistantCode("a1".to_string())),
            ("asst.a1.del", AssistantDelete("a1".to_string())),
            ("conv.list.3", ConversationList(3)),
            ("conv.new", ConversationNew),
            ("conv.new.list.2", ConversationNewList(2)),
            ("conv.new.a1", ConversationNewWith("a1".to_string())),
            ("conv.back", ConversationBack),
            ("conv.c1", Conversation("c1".to_string())),
            ("conv.c1.cont", ConversationContinue("c1".to_string())),
            ("conv.c1.del", ConversationDelete("c1".to_string())),
            ("conv.c1.hist", ConversationHistory("c1".to_string())),
            ("chat.leave", ChatLeave),
            ("wallet.topup", WalletTopup),
            ("wallet.topup.plan.1", WalletPlan(1)),
            ("wallet.check.77", WalletCheck(77)),
            ("wallet.back", WalletBack),
            ("guest.a1", Guest("a1".to_string())),
        ];
        for (data, expected) in cases {
            assert_eq!(parse_callback(data), Some(expected), "{data}");
        }
    }

    #[test]
    fn rejects_malformed_data() {
        for data in [
            "",
            "asst",
            "asst.list.x",
            "asst.",
            "asst.a1.rename",
            "wallet.check.abc",
            "wallet.topup.plan.-1",
            "askuser:1:2",
            "guest.",
        ] {
            assert_eq!(parse_callback(data), None, "{data}");
        }
    }
}
