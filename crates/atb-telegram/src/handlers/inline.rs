use std::sync::Arc;

use teloxide::{
    prelude::*,
    types::{
        InlineQueryResult, InlineQueryResultArticle, InputMessageContent,
        InputMessageContentText, ParseMode,
    },
};

use atb_core::{
    domain::UserId,
    formatting::{thumbnail_url, truncate_with_ellipsis},
    messaging::types::InlineKeyboard,
    security::is_authorized,
    store::Assistant,
};

use crate::{router::AppState, to_markup};

use super::views;

/// One shareable card per assistant; pressing its button adds the assistant
/// to the presser's library.
pub fn share_articles(assistants: &[Assistant]) -> Vec<InlineQueryResult> {
    assistants
        .iter()
        .map(|a| {
            let content = InputMessageContent::Text(
                InputMessageContentText::new(views::shared_assistant(a))
                    .parse_mode(ParseMode::Html),
            );
            let keyboard = InlineKeyboard::new().text(
                format!("⬇️ Add {} to assistants", a.name),
                format!("guest.{}", a.id),
                false,
            );
            let mut article =
                InlineQueryResultArticle::new(a.id.clone(), format!("🤖 {}", a.name), content)
                    .description(format!(
                        "☝️ {}",
                        truncate_with_ellipsis(
                            a.instructions.as_deref().unwrap_or("No instructions"),
                            120
                        )
                    ))
                    .reply_markup(to_markup(&keyboard));
            if let Ok(url) = reqwest::Url::parse(&thumbnail_url(&a.name)) {
                article = article.thumb_url(url);
            }
            InlineQueryResult::Article(article)
        })
        .collect()
}

pub async fn handle_inline_query(
    bot: Bot,
    q: InlineQuery,
    state: Arc<AppState>,
) -> ResponseResult<()> {
    let user = UserId(q.from.id.0 as i64);
    let results = if is_authorized(Some(user), &state.cfg.allowed_users) {
        match state.assistants.share_candidates(user, q.query.trim()) {
            Ok(found) => share_articles(&found),
            Err(e) => {
                tracing::warn!(user_id = user.0, error = %e, "inline query failed");
                Vec::new()
            }
        }
    } else {
        Vec::new()
    };

    if let Err(e) = bot
        .answer_inline_query(q.id, results)
        .is_personal(true)
        .cache_time(0)
        .await
    {
        tracing::warn!(user_id = user.0, error = %e, "answer inline query failed");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use teloxide::types::InlineKeyboardButtonKind;

    #[test]
    fn article_carries_guest_button() {
        let a = Assistant {
            id: "a1".to_string(),
            owner_id: UserId(1),
            name: "Chef".to_string(),
            instructions: Some("Suggest recipes".to_string()),
            serverside_id: "asst_1".to_string(),
            created_at: 0,
        };
        let results = share_articles(&[a]);
        assert_eq!(results.len(), 1);

        let InlineQueryResult::Article(article) = &results[0] else {
            panic!("expected article");
        };
        assert_eq!(article.id, "a1");
        assert_eq!(article.title, "🤖 Chef");
        assert_eq!(article.description.as_deref(), Some("☝️ Suggest recipes"));
        assert!(article.thumb_url.is_some());

        let markup = article.reply_markup.as_ref().unwrap();
        let button = &markup.inline_keyboard[0][0];
        assert_eq!(button.text, "⬇️ Add Chef to assistants");
        assert_eq!(
            button.kind,
            InlineKeyboardButtonKind::CallbackData("guest.a1".to_string())
        );
    }
}
