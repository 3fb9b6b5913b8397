//! In-memory fakes for the ports, shared by the unit tests of this crate.

use std::{
    collections::{HashMap, VecDeque},
    path::Path,
    sync::Mutex,
};

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::mpsc;

use crate::{
    assistant::{
        api::{AssistantsApi, EventStream},
        events::AssistantStreamEvent,
        types::{
            AssistantTool, CodeInterpreterResources, FileSearchResources, NewAssistant,
            RemoteAssistant, ToolOutput, ToolResources, VectorStoreFile,
        },
    },
    domain::{ChatId, MessageId, MessageRef},
    errors::Error,
    messaging::{
        port::MessagingPort,
        types::{ChatAction, InlineKeyboard, PhotoSource},
    },
    wallet::{PaymentsApi, RemoteInvoice},
    Result,
};

/// Build a closed stream from `(event name, data)` pairs.
pub fn events_from_json(events: Vec<(&str, Value)>) -> EventStream {
    let (tx, rx) = mpsc::channel(events.len().max(1));
    for (name, data) in events {
        let parsed = AssistantStreamEvent::from_sse(name, &data.to_string());
        // Capacity covers every event, so this never waits.
        let _ = tx.try_send(parsed);
    }
    rx
}

// ============== Messenger ==============

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SentMessage {
    pub msg: MessageRef,
    pub html: String,
    pub keyboard: Option<InlineKeyboard>,
}

#[derive(Default)]
pub struct FakeMessenger {
    next_id: Mutex<i32>,
    sends: Mutex<Vec<SentMessage>>,
    edits: Mutex<Vec<(MessageRef, String)>>,
    cleared: Mutex<Vec<MessageRef>>,
    deletes: Mutex<Vec<MessageRef>>,
    actions: Mutex<Vec<ChatAction>>,
    photos: Mutex<Vec<(PhotoSource, Option<String>, Option<InlineKeyboard>)>>,
    voices: Mutex<Vec<Vec<u8>>>,
    callback_answers: Mutex<Vec<(String, Option<String>, bool)>>,
}

impl FakeMessenger {
    pub fn new() -> Self {
        Self {
            next_id: Mutex::new(1),
            ..Default::default()
        }
    }

    fn alloc(&self, chat_id: ChatId) -> MessageRef {
        let mut guard = self.next_id.lock().unwrap();
        let id = *guard;
        *guard += 1;
        MessageRef {
            chat_id,
            message_id: MessageId(id),
        }
    }

    pub fn sent(&self) -> Vec<SentMessage> {
        self.sends.lock().unwrap().clone()
    }

    pub fn sent_texts(&self) -> Vec<String> {
        self.sends.lock().unwrap().iter().map(|s| s.html.clone()).collect()
    }

    pub fn edits(&self) -> Vec<(MessageRef, String)> {
        self.edits.lock().unwrap().clone()
    }

    pub fn cleared(&self) -> Vec<MessageRef> {
        self.cleared.lock().unwrap().clone()
    }

    pub fn deletes(&self) -> Vec<MessageRef> {
        self.deletes.lock().unwrap().clone()
    }

    pub fn actions(&self) -> Vec<ChatAction> {
        self.actions.lock().unwrap().clone()
    }

    pub fn photos(&self) -> Vec<(PhotoSource, Option<String>, Option<InlineKeyboard>)> {
        self.photos.lock().unwrap().clone()
    }

    pub fn voices(&self) -> Vec<Vec<u8>> {
        self.voices.lock().unwrap().clone()
    }

    pub fn callback_answers(&self) -> Vec<(String, Option<String>, bool)> {
        self.callback_answers.lock().unwrap().clone()
    }
}

#[async_trait]
impl MessagingPort for FakeMessenger {
    async fn send_html(&self, chat_id: ChatId, html: &str) -> Result<MessageRef> {
        let msg = self.alloc(chat_id);
        self.sends.lock().unwrap().push(SentMessage {
            msg,
            html: html.to_string(),
            keyboard: None,
        });
        Ok(msg)
    }

    async fn send_html_with_keyboard(
        &self,
        chat_id: ChatId,
        html: &str,
        keyboard: InlineKeyboard,
    ) -> Result<MessageRef> {
        let msg = self.alloc(chat_id);
        self.sends.lock().unwrap().push(SentMessage {
            msg,
            html: html.to_string(),
            keyboard: Some(keyboard),
        });
        Ok(msg)
    }

    async fn edit_html(&self, msg: MessageRef, html: &str) -> Result<()> {
        self.edits.lock().unwrap().push((msg, html.to_string()));
        Ok(())
    }

    async fn clear_keyboard(&self, msg: MessageRef) -> Result<()> {
        self.cleared.lock().unwrap().push(msg);
        Ok(())
    }

    async fn delete_message(&self, msg: MessageRef) -> Result<()> {
        self.deletes.lock().unwrap().push(msg);
        Ok(())
    }

    async fn send_chat_action(&self, _chat_id: ChatId, action: ChatAction) -> Result<()> {
        self.actions.lock().unwrap().push(action);
        Ok(())
    }

    async fn send_photo(
        &self,
        chat_id: ChatId,
        photo: PhotoSource,
        caption_html: Option<&str>,
        keyboard: Option<InlineKeyboard>,
    ) -> Result<MessageRef> {
        self.photos
            .lock()
            .unwrap()
            .push((photo, caption_html.map(str::to_string), keyboard));
        Ok(self.alloc(chat_id))
    }

    async fn send_voice(&self, chat_id: ChatId, ogg: Vec<u8>) -> Result<MessageRef> {
        self.voices.lock().unwrap().push(ogg);
        Ok(self.alloc(chat_id))
    }

    async fn answer_callback_query(
        &self,
        callback_id: &str,
        text: Option<&str>,
        show_alert: bool,
    ) -> Result<()> {
        self.callback_answers.lock().unwrap().push((
            callback_id.to_string(),
            text.map(str::to_string),
            show_alert,
        ));
        Ok(())
    }
}

// ============== Assistants API ==============

#[derive(Default)]
pub struct FakeAssistantsApi {
    next_id: Mutex<u32>,
    assistants: Mutex<HashMap<String, RemoteAssistant>>,
    created: Mutex<Vec<NewAssistant>>,
    deleted_assistants: Mutex<Vec<String>>,
    deleted_files: Mutex<Vec<String>>,
    deleted_vector_stores: Mutex<Vec<String>>,
    vector_store_files: Mutex<HashMap<String, Vec<String>>>,
    files: Mutex<HashMap<String, Vec<u8>>>,
    user_messages: Mutex<Vec<(String, String)>>,
    streams: Mutex<VecDeque<(Vec<(String, Value)>, bool)>>,
    held_open: Mutex<Vec<mpsc::Sender<Result<AssistantStreamEvent>>>>,
    submitted: Mutex<Vec<(String, Vec<ToolOutput>)>>,
    cancelled: Mutex<Vec<(String, String)>>,
    titles: Mutex<Vec<String>>,
    spoken: Mutex<Vec<(String, String)>>,
    fail_deletes: Mutex<bool>,
}

impl FakeAssistantsApi {
    pub fn new() -> Self {
        Self::default()
    }

    fn next(&self, prefix: &str) -> String {
        let mut guard = self.next_id.lock().unwrap();
        *guard += 1;
        format!("{prefix}_{}", *guard)
    }

    /// Queue the events returned by the next `stream_run` or
    /// `submit_tool_outputs_stream`.
    pub fn push_stream(&self, events: Vec<(&str, Value)>) {
        self.queue_stream(events, false);
    }

    /// Like `push_stream`, but the stream never ends on its own.
    pub fn push_open_stream(&self, events: Vec<(&str, Value)>) {
        self.queue_stream(events, true);
    }

    fn queue_stream(&self, events: Vec<(&str, Value)>, open: bool) {
        let events = events
            .into_iter()
            .map(|(name, data)| (name.to_string(), data))
            .collect();
        self.streams.lock().unwrap().push_back((events, open));
    }

    pub fn put_file(&self, file_id: &str, bytes: Vec<u8>) {
        self.files.lock().unwrap().insert(file_id.to_string(), bytes);
    }

    /// Attach code-interpreter files and a vector store to a remote assistant.
    pub fn attach_resources(&self, assistant_id: &str, file_ids: &[&str], store: (&str, &[&str])) {
        let mut assistants = self.assistants.lock().unwrap();
        if let Some(a) = assistants.get_mut(assistant_id) {
            a.tool_resources = Some(ToolResources {
                code_interpreter: Some(CodeInterpreterResources {
                    file_ids: file_ids.iter().map(|s| s.to_string()).collect(),
                }),
                file_search: Some(FileSearchResources {
                    vector_store_ids: vec![store.0.to_string()],
                }),
            });
        }
        self.vector_store_files.lock().unwrap().insert(
            store.0.to_string(),
            store.1.iter().map(|s| s.to_string()).collect(),
        );
    }

    /// Make `retrieve_assistant` fail for this id while deletes still succeed.
    pub fn forget_remote(&self, assistant_id: &str) {
        self.assistants.lock().unwrap().remove(assistant_id);
    }

    pub fn set_titles(&self, titles: &[&str]) {
        *self.titles.lock().unwrap() = titles.iter().map(|s| s.to_string()).collect();
    }

    pub fn fail_deletes(&self) {
        *self.fail_deletes.lock().unwrap() = true;
    }

    pub fn created(&self) -> Vec<NewAssistant> {
        self.created.lock().unwrap().clone()
    }

    pub fn remote(&self, assistant_id: &str) -> Option<RemoteAssistant> {
        self.assistants.lock().unwrap().get(assistant_id).cloned()
    }

    pub fn deleted_assistants(&self) -> Vec<String> {
        self.deleted_assistants.lock().unwrap().clone()
    }

    pub fn deleted_files(&self) -> Vec<String> {
        self.deleted_files.lock().unwrap().clone()
    }

    pub fn deleted_vector_stores(&self) -> Vec<String> {
        self.deleted_vector_stores.lock().unwrap().clone()
    }

    pub fn user_messages(&self) -> Vec<(String, String)> {
        self.user_messages.lock().unwrap().clone()
    }

    pub fn submitted_outputs(&self) -> Vec<(String, Vec<ToolOutput>)> {
        self.submitted.lock().unwrap().clone()
    }

    pub fn cancelled_runs(&self) -> Vec<(String, String)> {
        self.cancelled.lock().unwrap().clone()
    }

    pub fn spoken(&self) -> Vec<(String, String)> {
        self.spoken.lock().unwrap().clone()
    }

    fn next_stream(&self) -> EventStream {
        let (events, open) = self.streams.lock().unwrap().pop_front().unwrap_or_default();
        let (tx, rx) = mpsc::channel(events.len().max(1));
        for (name, data) in &events {
            let _ = tx.try_send(AssistantStreamEvent::from_sse(name, &data.to_string()));
        }
        if open {
            self.held_open.lock().unwrap().push(tx);
        }
        rx
    }

    fn check_delete(&self, what: &str) -> Result<()> {
        if *self.fail_deletes.lock().unwrap() {
            return Err(Error::External(format!("cannot delete {what}")));
        }
        Ok(())
    }
}

#[async_trait]
impl AssistantsApi for FakeAssistantsApi {
    async fn create_assistant(&self, req: &NewAssistant) -> Result<RemoteAssistant> {
        let remote = RemoteAssistant {
            id: self.next("asst"),
            name: Some(req.name.clone()),
            instructions: Some(req.instructions.clone()),
            model: req.model.clone(),
            tools: req.tools.clone(),
            tool_resources: None,
        };
        self.created.lock().unwrap().push(req.clone());
        self.assistants
            .lock()
            .unwrap()
            .insert(remote.id.clone(), remote.clone());
        Ok(remote)
    }

    async fn retrieve_assistant(&self, assistant_id: &str) -> Result<RemoteAssistant> {
        self.remote(assistant_id)
            .ok_or_else(|| Error::NotFound(format!("assistant {assistant_id}")))
    }

    async fn update_assistant_tools(
        &self,
        assistant_id: &str,
        tools: &[AssistantTool],
    ) -> Result<RemoteAssistant> {
        let mut assistants = self.assistants.lock().unwrap();
        let a = assistants
            .get_mut(assistant_id)
            .ok_or_else(|| Error::NotFound(format!("assistant {assistant_id}")))?;
        a.tools = tools.to_vec();
        Ok(a.clone())
    }

    async fn delete_assistant(&self, assistant_id: &str) -> Result<()> {
        self.check_delete(assistant_id)?;
        self.assistants.lock().unwrap().remove(assistant_id);
        self.deleted_assistants
            .lock()
            .unwrap()
            .push(assistant_id.to_string());
        Ok(())
    }

    async fn list_vector_store_files(&self, vector_store_id: &str) -> Result<Vec<VectorStoreFile>> {
        Ok(self
            .vector_store_files
            .lock()
            .unwrap()
            .get(vector_store_id)
            .map(|ids| ids.iter().map(|id| VectorStoreFile { id: id.clone() }).collect())
            .unwrap_or_default())
    }

    async fn delete_vector_store(&self, vector_store_id: &str) -> Result<()> {
        self.check_delete(vector_store_id)?;
        self.deleted_vector_stores
            .lock()
            .unwrap()
            .push(vector_store_id.to_string());
        Ok(())
    }

    async fn delete_file(&self, file_id: &str) -> Result<()> {
        self.check_delete(file_id)?;
        self.deleted_files.lock().unwrap().push(file_id.to_string());
        Ok(())
    }

    async fn file_content(&self, file_id: &str) -> Result<Vec<u8>> {
        self.files
            .lock()
            .unwrap()
            .get(file_id)
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("file {file_id}")))
    }

    async fn create_thread(&self) -> Result<String> {
        Ok(self.next("thread"))
    }

    async fn add_user_message(&self, thread_id: &str, text: &str) -> Result<()> {
        self.user_messages
            .lock()
            .unwrap()
            .push((thread_id.to_string(), text.to_string()));
        Ok(())
    }

    async fn stream_run(&self, _thread_id: &str, _assistant_id: &str) -> Result<EventStream> {
        Ok(self.next_stream())
    }

    async fn submit_tool_outputs_stream(
        &self,
        _thread_id: &str,
        run_id: &str,
        outputs: Vec<ToolOutput>,
    ) -> Result<EventStream> {
        self.submitted
            .lock()
            .unwrap()
            .push((run_id.to_string(), outputs));
        Ok(self.next_stream())
    }

    async fn cancel_run(&self, thread_id: &str, run_id: &str) -> Result<()> {
        self.cancelled
            .lock()
            .unwrap()
            .push((thread_id.to_string(), run_id.to_string()));
        Ok(())
    }

    async fn suggest_titles(&self, _user_text: &str, _reply: &str) -> Result<Vec<String>> {
        Ok(self.titles.lock().unwrap().clone())
    }

    async fn transcribe(&self, _audio_path: &Path) -> Result<String> {
        Ok("transcribed text".to_string())
    }

    async fn speech(&self, text: &str, voice: &str) -> Result<Vec<u8>> {
        self.spoken
            .lock()
            .unwrap()
            .push((text.to_string(), voice.to_string()));
        Ok(b"OggS".to_vec())
    }
}

// ============== Payments ==============

#[derive(Default)]
pub struct FakePayments {
    next_id: Mutex<i64>,
    invoices: Mutex<HashMap<i64, RemoteInvoice>>,
    payloads: Mutex<Vec<String>>,
}

impl FakePayments {
    pub fn new() -> Self {
        Self {
            next_id: Mutex::new(100),
            ..Default::default()
        }
    }

    pub fn set_status(&self, invoice_id: i64, status: &str) {
        if let Some(inv) = self.invoices.lock().unwrap().get_mut(&invoice_id) {
            inv.status = status.to_string();
        }
    }

    pub fn payloads(&self) -> Vec<String> {
        self.payloads.lock().unwrap().clone()
    }
}

#[async_trait]
impl PaymentsApi for FakePayments {
    async fn create_invoice(
        &self,
        asset: &str,
        amount: &str,
        _description: &str,
        payload: &str,
    ) -> Result<RemoteInvoice> {
        let invoice_id = {
            let mut guard = self.next_id.lock().unwrap();
            *guard += 1;
            *guard
        };
        let invoice = RemoteInvoice {
            invoice_id,
            status: "active".to_string(),
            pay_url: format!("https://t.me/CryptoTestnetBot?start=IV{invoice_id}"),
            amount: amount.to_string(),
            asset: asset.to_string(),
        };
        self.payloads.lock().unwrap().push(payload.to_string());
        self.invoices
            .lock()
            .unwrap()
            .insert(invoice_id, invoice.clone());
        Ok(invoice)
    }

    async fn get_invoice(&self, invoice_id: i64) -> Result<Option<RemoteInvoice>> {
        Ok(self.invoices.lock().unwrap().get(&invoice_id).cloned())
    }
}
