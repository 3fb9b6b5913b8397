//! Conversations with assistants: starting, leaving, sending a message through
//! a streamed run, charging tokens and replaying history.

use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
};

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::{
    assistant::{
        api::AssistantsApi,
        events::{AssistantEventHandler, EventDispatcher, ImagePayload, ObserveSummary},
        tools::ToolRegistry,
        types::{FunctionToolCall, MessageText, StepToolCall, ToolOutput},
    },
    config::Config,
    domain::{ChatId, UserId},
    errors::Error,
    formatting::{escape_html, truncate_with_ellipsis},
    messaging::{
        port::MessagingPort,
        types::{ChatAction, PhotoSource},
    },
    store::{Assistant, Conversation, Page, Role, Store},
    streaming::StreamingReply,
    Result,
};

/// Longest title kept from the naming model.
pub const MAX_TITLE_CHARS: usize = 24;
/// History is replayed in chunks of this many characters.
pub const HISTORY_CHUNK_CHARS: usize = 3895;

const WAIT_HTML: &str = "<i>Please wait...</i>";
const TOOL_INPUT_PREVIEW: usize = 300;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ConversationSummary {
    pub conversation: Conversation,
    pub assistant_name: String,
}

impl ConversationSummary {
    /// Button label: the title, or the assistant name while untitled.
    pub fn label(&self) -> &str {
        self.conversation
            .title
            .as_deref()
            .unwrap_or(&self.assistant_name)
    }
}

/// Outcome of one message sent to an assistant.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ChatTurn {
    pub text: String,
    pub tokens: i64,
    pub completed: bool,
    pub cancelled: bool,
    pub new_title: Option<String>,
}

pub struct ChatService {
    cfg: Arc<Config>,
    store: Arc<Store>,
    api: Arc<dyn AssistantsApi>,
    tools: Arc<ToolRegistry>,
    running: Mutex<HashMap<UserId, CancellationToken>>,
}

impl ChatService {
    pub fn new(
        cfg: Arc<Config>,
        store: Arc<Store>,
        api: Arc<dyn AssistantsApi>,
        tools: Arc<ToolRegistry>,
    ) -> Self {
        Self {
            cfg,
            store,
            api,
            tools,
            running: Mutex::new(HashMap::new()),
        }
    }

    // ---------- conversations ----------

    /// Open a fresh thread with the assistant and make it the active
    /// conversation.
    pub async fn start_conversation(
        &self,
        user: UserId,
        assistant_id: &str,
    ) -> Result<(Conversation, Assistant)> {
        let assistant = self
            .store
            .get_assistant(assistant_id)?
            .ok_or_else(|| Error::NotFound(format!("assistant {assistant_id}")))?;
        if assistant.owner_id != user && !self.store.is_guest(user, assistant_id)? {
            return Err(Error::Forbidden(format!("assistant {assistant_id}")));
        }

        let thread_id = self.api.create_thread().await?;
        let conversation = self
            .store
            .create_conversation(user, &assistant.id, &thread_id)?;
        self.store
            .set_active_conversation(user, Some(&conversation.id))?;
        tracing::info!(user_id = user.0, conversation_id = %conversation.id, "conversation started");
        Ok((conversation, assistant))
    }

    /// Make an existing conversation active again.
    pub fn continue_conversation(
        &self,
        user: UserId,
        conversation_id: &str,
    ) -> Result<(Conversation, Assistant)> {
        let (conversation, assistant) = self.owned_conversation(user, conversation_id)?;
        self.store
            .set_active_conversation(user, Some(&conversation.id))?;
        Ok((conversation, assistant))
    }

    /// Clear the active conversation; returns the assistant that was active.
    pub fn leave(&self, user: UserId) -> Result<Option<Assistant>> {
        let Some(active) = self.active_conversation_id(user)? else {
            return Ok(None);
        };
        self.store.set_active_conversation(user, None)?;
        let assistant = match self.store.get_conversation(&active)? {
            Some(c) => self.store.get_assistant(&c.assistant_id)?,
            None => None,
        };
        Ok(assistant)
    }

    pub fn conversations(&self, user: UserId, page: u32) -> Result<Page<ConversationSummary>> {
        let mut items = Vec::new();
        for conversation in self.store.list_conversations(user, page)? {
            let assistant_name = self
                .store
                .get_assistant(&conversation.assistant_id)?
                .map(|a| a.name)
                .unwrap_or_default();
            items.push(ConversationSummary {
                conversation,
                assistant_name,
            });
        }
        let count = self.store.count_conversations(user)?;
        Ok(Page::new(items, page, count))
    }

    pub fn conversation(&self, user: UserId, conversation_id: &str) -> Result<ConversationSummary> {
        let (conversation, assistant) = self.owned_conversation(user, conversation_id)?;
        Ok(ConversationSummary {
            conversation,
            assistant_name: assistant.name,
        })
    }

    pub fn delete_conversation(&self, user: UserId, conversation_id: &str) -> Result<()> {
        self.owned_conversation(user, conversation_id)?;
        self.store.delete_conversation(conversation_id)?;
        Ok(())
    }

    /// Stored messages rendered as HTML chunks, oldest first.
    pub fn history(
        &self,
        user: UserId,
        conversation_id: &str,
        first_name: &str,
    ) -> Result<Vec<String>> {
        let (_, assistant) = self.owned_conversation(user, conversation_id)?;
        let mut out = Vec::new();
        for message in self.store.list_messages(conversation_id)? {
            let author = match message.role {
                Role::Assistant => format!("🤖 {}", assistant.name),
                Role::User => format!("👤 {first_name}"),
            };
            for chunk in chunk_chars(&message.content, HISTORY_CHUNK_CHARS) {
                out.push(format!(
                    "<b>{}</b>\n\n{}\n💸 <b>{} tokens</b>",
                    escape_html(&author),
                    escape_html(&chunk),
                    message.tokens
                ));
            }
        }
        Ok(out)
    }

    fn owned_conversation(
        &self,
        user: UserId,
        conversation_id: &str,
    ) -> Result<(Conversation, Assistant)> {
        let conversation = self
            .store
            .get_conversation(conversation_id)?
            .ok_or_else(|| Error::NotFound(format!("conversation {conversation_id}")))?;
        if conversation.user_id != user {
            return Err(Error::Forbidden(format!("conversation {conversation_id}")));
        }
        let assistant = self
            .store
            .get_assistant(&conversation.assistant_id)?
            .ok_or_else(|| Error::NotFound(format!("assistant {}", conversation.assistant_id)))?;
        Ok((conversation, assistant))
    }

    fn active_conversation_id(&self, user: UserId) -> Result<Option<String>> {
        Ok(self
            .store
            .get_user(user)?
            .and_then(|u| u.active_conversation_id))
    }

    pub fn has_active_conversation(&self, user: UserId) -> Result<bool> {
        Ok(self.active_conversation_id(user)?.is_some())
    }

    // ---------- runs ----------

    /// Cancel the user's in-flight reply. Returns false when nothing runs.
    pub fn stop(&self, user: UserId) -> bool {
        let token = self
            .running
            .lock()
            .ok()
            .and_then(|running| running.get(&user).cloned());
        match token {
            Some(token) => {
                token.cancel();
                true
            }
            None => false,
        }
    }

    pub fn is_running(&self, user: UserId) -> bool {
        self.running
            .lock()
            .map(|running| running.contains_key(&user))
            .unwrap_or(false)
    }

    /// Send `text` to the active conversation and render the reply into `chat`.
    pub async fn send(
        &self,
        user: UserId,
        chat: ChatId,
        text: &str,
        messenger: &dyn MessagingPort,
    ) -> Result<ChatTurn> {
        let account = self
            .store
            .get_user(user)?
            .ok_or_else(|| Error::NotFound(format!("user {}", user.0)))?;
        let conversation_id = account
            .active_conversation_id
            .clone()
            .ok_or(Error::NoActiveConversation)?;
        if account.balance <= 0 {
            return Err(Error::InsufficientBalance);
        }
        let (conversation, assistant) = self.owned_conversation(user, &conversation_id)?;

        let token = self.begin_run(user)?;
        let result = self
            .run_turn(&conversation, &assistant, chat, text, messenger, token)
            .await;
        self.end_run(user);
        let summary = result?;

        let mut turn = ChatTurn {
            text: summary.text.clone(),
            tokens: summary.usage.as_ref().map_or(0, |u| u.total_tokens),
            completed: summary.completed,
            cancelled: summary.cancelled,
            new_title: None,
        };

        if turn.tokens > 0 {
            let balance = self.store.adjust_balance(user, -turn.tokens)?;
            tracing::info!(user_id = user.0, tokens = turn.tokens, balance, "run charged");
        }

        if turn.cancelled {
            messenger.send_html(chat, "⏹ <i>Stopped.</i>").await?;
            return Ok(turn);
        }
        if !turn.completed {
            return Ok(turn);
        }

        let usage = summary.usage.unwrap_or_default();
        self.store
            .append_message(&conversation.id, Role::User, text, usage.prompt_tokens)?;
        if !turn.text.is_empty() {
            self.store.append_message(
                &conversation.id,
                Role::Assistant,
                &turn.text,
                usage.completion_tokens,
            )?;
        }
        messenger
            .send_html(chat, &format!("💸 <b>{} tokens</b>", turn.tokens))
            .await?;

        if conversation.title.is_none() && !turn.text.is_empty() {
            turn.new_title = self
                .name_conversation(&conversation, chat, text, &turn.text, messenger)
                .await;
        }
        if account.voice_response && !turn.text.is_empty() {
            self.speak(chat, &account.voice, &turn.text, turn.tokens, messenger)
                .await;
        }
        Ok(turn)
    }

    fn begin_run(&self, user: UserId) -> Result<CancellationToken> {
        let mut running = self
            .running
            .lock()
            .map_err(|_| Error::External("run registry poisoned".to_string()))?;
        if running.contains_key(&user) {
            return Err(Error::Busy);
        }
        let token = CancellationToken::new();
        running.insert(user, token.clone());
        Ok(token)
    }

    fn end_run(&self, user: UserId) {
        if let Ok(mut running) = self.running.lock() {
            running.remove(&user);
        }
    }

    async fn run_turn(
        &self,
        conversation: &Conversation,
        assistant: &Assistant,
        chat: ChatId,
        text: &str,
        messenger: &dyn MessagingPort,
        token: CancellationToken,
    ) -> Result<ObserveSummary> {
        let placeholder = messenger.send_html(chat, WAIT_HTML).await?;
        let _ = messenger.send_chat_action(chat, ChatAction::Typing).await;

        let stream = async {
            self.api
                .add_user_message(&conversation.thread_id, text)
                .await?;
            self.api
                .stream_run(&conversation.thread_id, &assistant.serverside_id)
                .await
        }
        .await;
        let stream = match stream {
            Ok(stream) => stream,
            Err(e) => {
                let _ = messenger.delete_message(placeholder).await;
                return Err(e);
            }
        };

        let deadline = {
            let token = token.clone();
            let timeout = self.cfg.query_timeout;
            tokio::spawn(async move {
                tokio::time::sleep(timeout).await;
                token.cancel();
            })
        };

        let mut renderer = ChatRenderer {
            cfg: &self.cfg,
            messenger,
            tools: &self.tools,
            chat,
            reply: StreamingReply::new(chat, Some(placeholder)),
        };
        let summary = EventDispatcher::new(self.api.as_ref())
            .with_cancel(token)
            .observe(stream, &mut renderer)
            .await;
        deadline.abort();
        renderer.reply.discard_placeholder(messenger).await;

        tracing::info!(
            conversation_id = %conversation.id,
            run_id = summary.run_id.as_deref().unwrap_or("-"),
            completed = summary.completed,
            failed = summary.failed,
            cancelled = summary.cancelled,
            "run finished"
        );
        Ok(summary)
    }

    async fn name_conversation(
        &self,
        conversation: &Conversation,
        chat: ChatId,
        user_text: &str,
        reply: &str,
        messenger: &dyn MessagingPort,
    ) -> Option<String> {
        let candidates = match self.api.suggest_titles(user_text, reply).await {
            Ok(candidates) => candidates,
            Err(e) => {
                tracing::warn!(error = %e, "title suggestion failed");
                return None;
            }
        };
        let title = pick_title(&candidates)?;
        if let Err(e) = self.store.set_title(&conversation.id, &title) {
            tracing::warn!(error = %e, "storing title failed");
            return None;
        }
        let _ = messenger
            .send_html(
                chat,
                &format!("✨ Renamed conversation to <b>{}</b>", escape_html(&title)),
            )
            .await;
        Some(title)
    }

    async fn speak(
        &self,
        chat: ChatId,
        voice: &str,
        text: &str,
        tokens: i64,
        messenger: &dyn MessagingPort,
    ) {
        let _ = messenger.send_chat_action(chat, ChatAction::RecordVoice).await;
        let input = format!("{text}\nThis prompt cost you {tokens} tokens.");
        match self.api.speech(&input, voice).await {
            Ok(audio) if !audio.is_empty() => {
                let _ = messenger.send_chat_action(chat, ChatAction::UploadVoice).await;
                if let Err(e) = messenger.send_voice(chat, audio).await {
                    tracing::warn!(error = %e, "sending voice reply failed");
                }
            }
            Ok(_) => {
                let _ = messenger
                    .send_html(chat, "Failed to encode response audio.")
                    .await;
            }
            Err(e) => {
                tracing::warn!(error = %e, "speech synthesis failed");
                let _ = messenger
                    .send_html(chat, "Failed to encode response audio.")
                    .await;
            }
        }
    }
}

/// First non-empty candidate that fits in a title.
pub fn pick_title(candidates: &[String]) -> Option<String> {
    candidates
        .iter()
        .map(|t| t.trim().trim_matches('"').trim())
        .find(|t| !t.is_empty() && t.chars().count() <= MAX_TITLE_CHARS)
        .map(str::to_string)
}

fn chunk_chars(s: &str, max_chars: usize) -> Vec<String> {
    if s.is_empty() {
        return vec![String::new()];
    }
    let chars: Vec<char> = s.chars().collect();
    chars
        .chunks(max_chars.max(1))
        .map(|c| c.iter().collect())
        .collect()
}

/// Renders run events into the chat.
struct ChatRenderer<'a> {
    cfg: &'a Config,
    messenger: &'a dyn MessagingPort,
    tools: &'a ToolRegistry,
    chat: ChatId,
    reply: StreamingReply,
}

#[async_trait]
impl AssistantEventHandler for ChatRenderer<'_> {
    async fn text_delta(&mut self, delta: &str) -> Result<()> {
        self.reply.push_delta(self.cfg, self.messenger, delta).await
    }

    async fn text_done(&mut self, text: &MessageText) -> Result<()> {
        self.reply.finish(self.cfg, self.messenger, &text.value).await
    }

    async fn image_done(&mut self, image: ImagePayload) -> Result<()> {
        let _ = self
            .messenger
            .send_chat_action(self.chat, ChatAction::UploadPhoto)
            .await;
        let photo = match image {
            ImagePayload::Bytes(bytes) => PhotoSource::Bytes(bytes),
            ImagePayload::Url(url) => PhotoSource::Url(url),
        };
        self.messenger
            .send_photo(self.chat, photo, None, None)
            .await?;
        Ok(())
    }

    async fn tool_calls_done(&mut self, calls: &[StepToolCall]) -> Result<()> {
        let lines: Vec<String> = calls.iter().filter_map(tool_status_line).collect();
        if !lines.is_empty() {
            self.messenger
                .send_html(self.chat, &lines.join("\n"))
                .await?;
        }
        Ok(())
    }

    async fn tool_calls_action(&mut self, calls: &[FunctionToolCall]) -> Result<Vec<ToolOutput>> {
        Ok(self.tools.run_all(calls).await)
    }

    async fn error(&mut self, code: Option<&str>, message: &str) -> Result<()> {
        let html = match code {
            Some(code) => format!("❌ {} (<code>{}</code>)", escape_html(message), escape_html(code)),
            None => format!("❌ {}", escape_html(message)),
        };
        self.messenger.send_html(self.chat, &html).await?;
        Ok(())
    }
}

fn tool_status_line(call: &StepToolCall) -> Option<String> {
    match call {
        StepToolCall::CodeInterpreter {
            code_interpreter, ..
        } => Some(format!(
            "🧮 <b>Code interpreter</b>\n<pre>{}</pre>",
            escape_html(&truncate_with_ellipsis(
                code_interpreter.input.trim(),
                TOOL_INPUT_PREVIEW
            ))
        )),
        StepToolCall::FileSearch { .. } => Some("🔎 <i>Searched files</i>".to_string()),
        StepToolCall::Function { function, .. } => Some(format!(
            "🔧 <code>{}</code>",
            escape_html(&function.name)
        )),
        StepToolCall::Unknown => None,
    }
}
