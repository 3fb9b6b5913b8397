use std::path::Path;

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::{
    assistant::{
        events::AssistantStreamEvent,
        types::{AssistantTool, NewAssistant, RemoteAssistant, ToolOutput, VectorStoreFile},
    },
    Result,
};

/// Events of one run stream, in server order. The sender side closes when the
/// HTTP stream ends.
pub type EventStream = mpsc::Receiver<Result<AssistantStreamEvent>>;

/// Port over the hosted assistants API (assistants, threads, runs, files, audio).
#[async_trait]
pub trait AssistantsApi: Send + Sync {
    async fn create_assistant(&self, req: &NewAssistant) -> Result<RemoteAssistant>;
    async fn retrieve_assistant(&self, assistant_id: &str) -> Result<RemoteAssistant>;
    async fn update_assistant_tools(
        &self,
        assistant_id: &str,
        tools: &[AssistantTool],
    ) -> Result<RemoteAssistant>;
    async fn delete_assistant(&self, assistant_id: &str) -> Result<()>;

    async fn list_vector_store_files(&self, vector_store_id: &str) -> Result<Vec<VectorStoreFile>>;
    async fn delete_vector_store(&self, vector_store_id: &str) -> Result<()>;
    async fn delete_file(&self, file_id: &str) -> Result<()>;
    async fn file_content(&self, file_id: &str) -> Result<Vec<u8>>;

    /// Returns the new thread id.
    async fn create_thread(&self) -> Result<String>;
    async fn add_user_message(&self, thread_id: &str, text: &str) -> Result<()>;
    async fn stream_run(&self, thread_id: &str, assistant_id: &str) -> Result<EventStream>;
    async fn submit_tool_outputs_stream(
        &self,
        thread_id: &str,
        run_id: &str,
        outputs: Vec<ToolOutput>,
    ) -> Result<EventStream>;
    async fn cancel_run(&self, thread_id: &str, run_id: &str) -> Result<()>;

    /// Candidate conversation titles for the first exchange.
    async fn suggest_titles(&self, user_text: &str, reply: &str) -> Result<Vec<String>>;
    async fn transcribe(&self, audio_path: &Path) -> Result<String>;
    /// Text-to-speech; returns OGG/Opus bytes.
    async fn speech(&self, text: &str, voice: &str) -> Result<Vec<u8>>;
}
