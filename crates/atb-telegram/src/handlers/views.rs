//! Message bodies and keyboards for every menu the bot shows.

use atb_core::{
    assistant::service::AssistantDetails,
    chat::ConversationSummary,
    formatting::escape_html,
    messaging::types::{InlineButton, InlineKeyboard},
    store::{Assistant, Invoice, Page, User},
    wallet::Plan,
};

pub const VOICES: [&str; 6] = ["alloy", "echo", "fable", "onyx", "nova", "shimmer"];

pub type View = (String, InlineKeyboard);

pub fn help(version: &str) -> String {
    format!(
        "💁 <b>Help</b>\n\n\
/start or /help - ℹ️ Show this message\n\
/chat - 💬 Talk to an assistant\n\
/assistants - 🤖 Manage your assistants\n\
/new Name | instructions - ➕ Create an assistant\n\
/leave - 🚪 Leave the current conversation\n\
/stop - ⏹ Stop the reply being generated\n\
/voice - 🔊 Toggle voice replies\n\
/voices name - 🗣 Pick the reply voice\n\
/wallet - 💰 Balance and top-ups\n\n\
v{}",
        escape_html(version)
    )
}

fn pager(prefix: &str, page: u32, pages: u32) -> Vec<InlineButton> {
    vec![
        InlineButton::text(format!("⬅️ {}", page.saturating_sub(1)), format!("{prefix}.{}", page.saturating_sub(1)))
            .hide_if(page <= 1),
        InlineButton::text(format!("{} ➡️", page + 1), format!("{prefix}.{}", page + 1))
            .hide_if(page >= pages),
    ]
}

pub fn assistants_list(page: &Page<Assistant>) -> View {
    let kb = InlineKeyboard::new()
        .rows(
            page.items
                .iter()
                .map(|a| vec![InlineButton::text(format!("🤖 {}", a.name), format!("asst.{}", a.id))]),
        )
        .row(pager("asst.list", page.page, page.pages));
    (
        "🤖 <b>Assistants</b>\n\nPick an assistant to see its details.\nCreate a new one with <code>/new Name | instructions</code>."
            .to_string(),
        kb,
    )
}

pub fn assistant_details(d: &AssistantDetails) -> View {
    let a = &d.assistant;
    let instructions = a.instructions.as_deref().unwrap_or("No instructions");
    let mut caption = format!(
        "🤖 <b>{}</b>\n\n☝️ <b>Instructions:</b>\n<i>{}</i>",
        escape_html(&a.name),
        escape_html(instructions)
    );
    if d.can_manage() && d.guest_count > 0 {
        caption.push_str(&format!("\n\n👥 Shared with {} users.", d.guest_count));
    }

    let kb = InlineKeyboard::new()
        .text("💬 New conversation", format!("asst.{}.chat", a.id), false)
        .text("🧮 Code interpreter", format!("asst.{}.code", a.id), !d.can_manage())
        .switch_inline("📤 Share", a.name.clone(), !d.can_manage())
        .text(
            if d.is_guest { "🚪 Remove from library" } else { "🗑 Delete" },
            format!("asst.{}.del", a.id),
            d.is_personal,
        )
        .text("⬅️ Back to assistants", "asst.back", false);
    (caption, kb)
}

pub fn conversations_list(page: &Page<ConversationSummary>) -> View {
    let kb = InlineKeyboard::new()
        .text("➕ New conversation", "conv.new", false)
        .rows(page.items.iter().map(|c| {
            vec![InlineButton::text(
                format!("💬 {}", c.label()),
                format!("conv.{}", c.conversation.id),
            )]
        }))
        .row(pager("conv.list", page.page, page.pages));
    let body = if page.items.is_empty() && page.page <= 1 {
        "💬 <b>Conversations</b>\n\nYou have no conversations yet. Start a new one!".to_string()
    } else {
        format!(
            "💬 <b>Conversations</b> (page {} of {})\n\nPick a conversation or start a new one.",
            page.page,
            page.pages.max(1)
        )
    };
    (body, kb)
}

pub fn choose_assistant(page: &Page<Assistant>) -> View {
    let kb = InlineKeyboard::new()
        .rows(page.items.iter().map(|a| {
            vec![InlineButton::text(
                format!("🤖 {}", a.name),
                format!("conv.new.{}", a.id),
            )]
        }))
        .row(pager("conv.new.list", page.page, page.pages))
        .text("⬅️ Back to conversations", "conv.back", false);
    (
        "🤖 <b>Choose an assistant</b> for the new conversation.".to_string(),
        kb,
    )
}

pub fn conversation_details(c: &ConversationSummary) -> View {
    let id = &c.conversation.id;
    let kb = InlineKeyboard::new()
        .row(vec![
            InlineButton::text("▶️ Continue", format!("conv.{id}.cont")),
            InlineButton::text("📜 History", format!("conv.{id}.hist")),
        ])
        .text("🗑 Delete", format!("conv.{id}.del"), false)
        .text("⬅️ Back to conversations", "conv.back", false);
    (
        format!(
            "💬 <b>{}</b>\n🤖 {}",
            escape_html(c.conversation.title.as_deref().unwrap_or("Untitled")),
            escape_html(&c.assistant_name)
        ),
        kb,
    )
}

pub fn chatting(assistant_name: &str) -> View {
    (
        format!(
            "💬 You are now chatting with <b>{}</b>.\nSend a text or voice message. Use /stop to interrupt a reply.",
            escape_html(assistant_name)
        ),
        InlineKeyboard::new().text("🚪 Leave conversation", "chat.leave", false),
    )
}

pub fn wallet(user: &User, payments_enabled: bool) -> View {
    (
        format!(
            "💰 <b>{}'s wallet</b>\n\nBalance: <b>{} tokens</b>",
            escape_html(&user.first_name),
            user.balance
        ),
        InlineKeyboard::new().text("➕ Top up", "wallet.topup", !payments_enabled),
    )
}

pub fn plans(plans: &[Plan]) -> View {
    let kb = InlineKeyboard::new()
        .rows(plans.iter().enumerate().map(|(i, plan)| {
            vec![InlineButton::text(
                format!("{} tokens - ${}", plan.tokens, plan.price),
                format!("wallet.topup.plan.{i}"),
            )]
        }))
        .text("⬅️ Back", "wallet.back", false);
    ("💎 <b>Top up</b>\n\nChoose a plan:".to_string(), kb)
}

pub fn invoice(invoice: &Invoice) -> View {
    (
        format!(
            "🧾 <b>Invoice #{}</b>\n\n{} tokens for <b>{} {}</b>.\nPay with the button below, then press <i>I paid</i>.",
            invoice.invoice_id,
            invoice.tokens,
            escape_html(&invoice.amount),
            escape_html(&invoice.asset)
        ),
        InlineKeyboard::new()
            .url("💳 Pay", invoice.pay_url.clone(), invoice.pay_url.is_empty())
            .text("✅ I paid", format!("wallet.check.{}", invoice.invoice_id), false)
            .text("⬅️ Back", "wallet.back", false),
    )
}

/// Message posted by the inline share article.
pub fn shared_assistant(a: &Assistant) -> String {
    format!(
        "Here, try out this new assistant I created!\n🤖 <b>Name:</b> <code>{}</code>\n☝️ <b>Instructions:</b>\n<pre>{}</pre>",
        escape_html(&a.name),
        escape_html(a.instructions.as_deref().unwrap_or("No instructions"))
    )
}

pub fn guest_added(a: &Assistant) -> String {
    format!(
        "✅ Assistant added to library successfully.\n🤖 <b>Name:</b> <code>{}</code>\n☝️ <b>Instructions:</b>\n<pre>{}</pre>",
        escape_html(&a.name),
        escape_html(a.instructions.as_deref().unwrap_or("No instructions"))
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use atb_core::{
        domain::UserId,
        messaging::types::ButtonAction,
        store::{Conversation, InvoiceStatus},
        wallet::PLANS,
    };

    fn assistant(id: &str, name: &str) -> Assistant {
        Assistant {
            id: id.to_string(),
            owner_id: UserId(1),
            name: name.to_string(),
            instructions: Some("Be <brief>".to_string()),
            serverside_id: format!("asst_{id}"),
            created_at: 0,
        }
    }

    fn labels(kb: &InlineKeyboard) -> Vec<Vec<String>> {
        kb.rows
            .iter()
            .map(|r| r.iter().map(|b| b.label.clone()).collect())
            .collect()
    }

    #[test]
    fn assistant_list_pages() {
        let page = Page {
            items: vec![assistant("a", "Bob")],
            page: 2,
            pages: 3,
        };
        let (_, kb) = assistants_list(&page);
        assert_eq!(
            labels(&kb),
            vec![vec!["🤖 Bob".to_string()], vec!["⬅️ 1".to_string(), "3 ➡️".to_string()]]
        );
        assert_eq!(
            kb.rows[1][1].action,
            ButtonAction::Callback("asst.list.3".to_string())
        );

        let first = Page {
            items: vec![],
            page: 1,
            pages: 1,
        };
        assert!(assistants_list(&first).1.is_empty());
    }

    #[test]
    fn guest_and_personal_cards_hide_owner_actions() {
        let guest = AssistantDetails {
            assistant: assistant("a", "Bob"),
            is_guest: true,
            is_personal: false,
            guest_count: 4,
        };
        let (caption, kb) = assistant_details(&guest);
        assert!(caption.contains("Be &lt;brief&gt;"));
        assert!(!caption.contains("Shared with"));
        assert_eq!(
            labels(&kb),
            vec![
                vec!["💬 New conversation".to_string()],
                vec!["🚪 Remove from library".to_string()],
                vec!["⬅️ Back to assistants".to_string()],
            ]
        );

        let personal = AssistantDetails {
            assistant: assistant("p", "Personal assistant"),
            is_guest: false,
            is_personal: true,
            guest_count: 0,
        };
        let (_, kb) = assistant_details(&personal);
        assert_eq!(kb.rows.len(), 2);

        let owned = AssistantDetails {
            is_guest: false,
            ..guest
        };
        let (caption, kb) = assistant_details(&owned);
        assert!(caption.contains("Shared with 4 users."));
        assert_eq!(kb.rows.len(), 5);
        assert_eq!(
            kb.rows[2][0].action,
            ButtonAction::SwitchInline("Bob".to_string())
        );
    }

    #[test]
    fn conversation_rows_use_titles() {
        let summary = ConversationSummary {
            conversation: Conversation {
                id: "c1".to_string(),
                user_id: UserId(1),
                assistant_id: "a".to_string(),
                thread_id: "thread_1".to_string(),
                title: None,
                created_at: 0,
            },
            assistant_name: "Bob".to_string(),
        };
        let page = Page {
            items: vec![summary.clone()],
            page: 1,
            pages: 1,
        };
        let (body, kb) = conversations_list(&page);
        assert!(body.contains("page 1 of 1"));
        assert_eq!(kb.rows[1][0].label, "💬 Bob");

        let (body, kb) = conversation_details(&summary);
        assert!(body.contains("Untitled"));
        assert_eq!(
            kb.rows[0][1].action,
            ButtonAction::Callback("conv.c1.hist".to_string())
        );
    }

    #[test]
    fn plan_and_invoice_buttons() {
        let (_, kb) = plans(&PLANS);
        assert_eq!(kb.rows[0][0].label, "10000 tokens - $3.99");
        assert_eq!(
            kb.rows[2][0].action,
            ButtonAction::Callback("wallet.topup.plan.2".to_string())
        );

        let inv = Invoice {
            invoice_id: 9,
            user_id: UserId(1),
            plan_index: 0,
            tokens: 10_000,
            amount: "3.99".to_string(),
            asset: "USDT".to_string(),
            pay_url: "https://t.me/CryptoBot?start=IV9".to_string(),
            status: InvoiceStatus::Active,
            created_at: 0,
        };
        let (body, kb) = invoice(&inv);
        assert!(body.contains("3.99 USDT"));
        assert_eq!(
            kb.rows[1][0].action,
            ButtonAction::Callback("wallet.check.9".to_string())
        );
    }
}
