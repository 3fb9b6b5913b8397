//! OpenAI adapter: Assistants v2, audio and chat completions.
//!
//! Run streams are read chunk by chunk and forwarded to the core as
//! `AssistantStreamEvent`s over an mpsc channel.

mod sse;

use std::{path::Path, time::Duration};

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde_json::{json, Value};
use tokio::sync::mpsc;

use atb_core::{
    assistant::{
        api::{AssistantsApi, EventStream},
        events::AssistantStreamEvent,
        types::{AssistantTool, NewAssistant, RemoteAssistant, ToolOutput, VectorStoreFile},
    },
    config::Config,
    errors::Error,
    Result,
};

pub use sse::{SseDecoder, SseFrame};

const REQUEST_TIMEOUT: Duration = Duration::from_secs(60);
const STREAM_CHANNEL_CAPACITY: usize = 64;

pub const NAMING_PROMPT: &str = "You are a conversation naming assistant. You are given a conversation between a user and an AI assistant. Your job is to come up with a title for this conversation that is at most 24 characters. Name this conversation.";

#[derive(Clone, Debug)]
pub struct OpenAiClient {
    api_key: String,
    base_url: String,
    title_model: String,
    http: reqwest::Client,
}

impl OpenAiClient {
    pub fn new(cfg: &Config) -> Result<Self> {
        // No global timeout: run streams stay open for the whole reply.
        let http = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .build()
            .map_err(|e| Error::External(format!("openai client build error: {e}")))?;
        Ok(Self {
            api_key: cfg.openai_api_key.clone(),
            base_url: cfg.openai_base_url.clone(),
            title_model: cfg.title_model.clone(),
            http,
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.base_url, path.trim_start_matches('/'))
    }

    fn request(&self, method: reqwest::Method, path: &str) -> reqwest::RequestBuilder {
        self.http
            .request(method, self.url(path))
            .bearer_auth(&self.api_key)
            .header("OpenAI-Beta", "assistants=v2")
    }

    async fn send(&self, req: reqwest::RequestBuilder, what: &str) -> Result<reqwest::Response> {
        let resp = req
            .send()
            .await
            .map_err(|e| Error::External(format!("openai request error: {e}")))?;
        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            return Err(Error::External(format!(
                "openai {what} failed: {status} {}",
                body.chars().take(200).collect::<String>()
            )));
        }
        Ok(resp)
    }

    async fn json<T: DeserializeOwned>(
        &self,
        req: reqwest::RequestBuilder,
        what: &str,
    ) -> Result<T> {
        self.send(req.timeout(REQUEST_TIMEOUT), what)
            .await?
            .json()
            .await
            .map_err(|e| Error::External(format!("openai json error ({what}): {e}")))
    }

    async fn bytes(&self, req: reqwest::RequestBuilder, what: &str) -> Result<Vec<u8>> {
        Ok(self
            .send(req.timeout(REQUEST_TIMEOUT), what)
            .await?
            .bytes()
            .await
            .map_err(|e| Error::External(format!("openai body error ({what}): {e}")))?
            .to_vec())
    }

    async fn open_stream(&self, req: reqwest::RequestBuilder, what: &str) -> Result<EventStream> {
        let resp = self.send(req.header("Accept", "text/event-stream"), what).await?;
        let (tx, rx) = mpsc::channel(STREAM_CHANNEL_CAPACITY);
        tokio::spawn(pump_events(resp, tx));
        Ok(rx)
    }
}

/// Forward SSE frames as events until `done`, the end of the body or a
/// dropped receiver. Malformed payloads are skipped.
async fn pump_events(
    mut resp: reqwest::Response,
    tx: mpsc::Sender<Result<AssistantStreamEvent>>,
) {
    let mut decoder = SseDecoder::new();
    loop {
        let chunk = match resp.chunk().await {
            Ok(Some(chunk)) => chunk,
            Ok(None) => return,
            Err(e) => {
                let _ = tx
                    .send(Err(Error::External(format!("openai stream error: {e}"))))
                    .await;
                return;
            }
        };

        let frames = match decoder.push(&chunk) {
            Ok(frames) => frames,
            Err(e) => {
                let _ = tx.send(Err(e)).await;
                return;
            }
        };

        for frame in frames {
            let event = match AssistantStreamEvent::from_sse(&frame.event, &frame.data) {
                Ok(event) => event,
                Err(e) => {
                    tracing::warn!(event = %frame.event, error = %e, "skipping stream event");
                    continue;
                }
            };
            let done = matches!(event, AssistantStreamEvent::Done);
            if tx.send(Ok(event)).await.is_err() || done {
                return;
            }
        }
    }
}

#[derive(serde::Deserialize)]
struct IdOnly {
    id: String,
}

#[derive(serde::Deserialize)]
struct ListPage<T> {
    data: Vec<T>,
    #[serde(default)]
    has_more: bool,
}

/// Message contents of every returned choice.
fn completion_texts(body: &Value) -> Vec<String> {
    body.get("choices")
        .and_then(Value::as_array)
        .map(|choices| {
            choices
                .iter()
                .filter_map(|c| c.pointer("/message/content")?.as_str())
                .map(|s| s.trim().trim_matches('"').to_string())
                .collect()
        })
        .unwrap_or_default()
}

fn title_request(model: &str, user_text: &str, reply: &str) -> Value {
    json!({
        "model": model,
        "max_tokens": 24,
        "n": 3,
        "messages": [
            {"role": "system", "content": NAMING_PROMPT},
            {"role": "user", "content": user_text},
            {"role": "assistant", "content": reply},
        ],
    })
}

#[async_trait]
impl AssistantsApi for OpenAiClient {
    async fn create_assistant(&self, req: &NewAssistant) -> Result<RemoteAssistant> {
        self.json(
            self.request(reqwest::Method::POST, "assistants").json(req),
            "create assistant",
        )
        .await
    }

    async fn retrieve_assistant(&self, assistant_id: &str) -> Result<RemoteAssistant> {
        self.json(
            self.request(reqwest::Method::GET, &format!("assistants/{assistant_id}")),
            "retrieve assistant",
        )
        .await
    }

    async fn update_assistant_tools(
        &self,
        assistant_id: &str,
        tools: &[AssistantTool],
    ) -> Result<RemoteAssistant> {
        self.json(
            self.request(reqwest::Method::POST, &format!("assistants/{assistant_id}"))
                .json(&json!({ "tools": tools })),
            "update assistant",
        )
        .await
    }

    async fn delete_assistant(&self, assistant_id: &str) -> Result<()> {
        let _: Value = self
            .json(
                self.request(reqwest::Method::DELETE, &format!("assistants/{assistant_id}")),
                "delete assistant",
            )
            .await?;
        Ok(())
    }

    async fn list_vector_store_files(&self, vector_store_id: &str) -> Result<Vec<VectorStoreFile>> {
        let mut files: Vec<VectorStoreFile> = Vec::new();
        loop {
            let mut req = self
                .request(
                    reqwest::Method::GET,
                    &format!("vector_stores/{vector_store_id}/files"),
                )
                .query(&[("limit", "100")]);
            if let Some(last) = files.last() {
                req = req.query(&[("after", last.id.as_str())]);
            }
            let page: ListPage<VectorStoreFile> = self.json(req, "list vector store files").await?;
            let more = page.has_more && !page.data.is_empty();
            files.extend(page.data);
            if !more {
                return Ok(files);
            }
        }
    }

    async fn delete_vector_store(&self, vector_store_id: &str) -> Result<()> {
        let _: Value = self
            .json(
                self.request(
                    reqwest::Method::DELETE,
                    &format!("vector_stores/{vector_store_id}"),
                ),
                "delete vector store",
            )
            .await?;
        Ok(())
    }

    async fn delete_file(&self, file_id: &str) -> Result<()> {
        let _: Value = self
            .json(
                self.request(reqwest::Method::DELETE, &format!("files/{file_id}")),
                "delete file",
            )
            .await?;
        Ok(())
    }

    async fn file_content(&self, file_id: &str) -> Result<Vec<u8>> {
        self.bytes(
            self.request(reqwest::Method::GET, &format!("files/{file_id}/content")),
            "file content",
        )
        .await
    }

    async fn create_thread(&self) -> Result<String> {
        let thread: IdOnly = self
            .json(
                self.request(reqwest::Method::POST, "threads").json(&json!({})),
                "create thread",
            )
            .await?;
        Ok(thread.id)
    }

    async fn add_user_message(&self, thread_id: &str, text: &str) -> Result<()> {
        let _: IdOnly = self
            .json(
                self.request(reqwest::Method::POST, &format!("threads/{thread_id}/messages"))
                    .json(&json!({ "role": "user", "content": text })),
                "add message",
            )
            .await?;
        Ok(())
    }

    async fn stream_run(&self, thread_id: &str, assistant_id: &str) -> Result<EventStream> {
        tracing::debug!(thread_id, assistant_id, "starting run stream");
        self.open_stream(
            self.request(reqwest::Method::POST, &format!("threads/{thread_id}/runs"))
                .json(&json!({ "assistant_id": assistant_id, "stream": true })),
            "create run",
        )
        .await
    }

    async fn submit_tool_outputs_stream(
        &self,
        thread_id: &str,
        run_id: &str,
        outputs: Vec<ToolOutput>,
    ) -> Result<EventStream> {
        tracing::debug!(thread_id, run_id, outputs = outputs.len(), "submitting tool outputs");
        self.open_stream(
            self.request(
                reqwest::Method::POST,
                &format!("threads/{thread_id}/runs/{run_id}/submit_tool_outputs"),
            )
            .json(&json!({ "tool_outputs": outputs, "stream": true })),
            "submit tool outputs",
        )
        .await
    }

    async fn cancel_run(&self, thread_id: &str, run_id: &str) -> Result<()> {
        let _: Value = self
            .json(
                self.request(
                    reqwest::Method::POST,
                    &format!("threads/{thread_id}/runs/{run_id}/cancel"),
                ),
                "cancel run",
            )
            .await?;
        Ok(())
    }

    async fn suggest_titles(&self, user_text: &str, reply: &str) -> Result<Vec<String>> {
        let body: Value = self
            .json(
                self.request(reqwest::Method::POST, "chat/completions")
                    .json(&title_request(&self.title_model, user_text, reply)),
                "title completion",
            )
            .await?;
        Ok(completion_texts(&body))
    }

    async fn transcribe(&self, audio_path: &Path) -> Result<String> {
        let bytes = tokio::fs::read(audio_path).await.map_err(Error::Io)?;

        let file_name = audio_path
            .file_name()
            .and_then(|s| s.to_str())
            .unwrap_or("audio.ogg")
            .to_string();

        let form = reqwest::multipart::Form::new()
            .text("model", "whisper-1")
            .part(
                "file",
                reqwest::multipart::Part::bytes(bytes)
                    .file_name(file_name)
                    .mime_str("audio/ogg")
                    .map_err(|e| Error::External(format!("openai multipart error: {e}")))?,
            );

        let v: Value = self
            .json(
                self.request(reqwest::Method::POST, "audio/transcriptions")
                    .multipart(form),
                "transcription",
            )
            .await?;

        let text = v
            .get("text")
            .and_then(|t| t.as_str())
            .unwrap_or("")
            .trim()
            .to_string();
        if text.is_empty() {
            return Err(Error::External(
                "openai transcription returned empty text".to_string(),
            ));
        }
        Ok(text)
    }

    async fn speech(&self, text: &str, voice: &str) -> Result<Vec<u8>> {
        self.bytes(
            self.request(reqwest::Method::POST, "audio/speech").json(&json!({
                "model": "tts-1",
                "input": text,
                "voice": voice,
                "response_format": "opus",
            })),
            "speech",
        )
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn urls_join_base_and_path() {
        let cfg = Config {
            openai_base_url: "https://api.example.test/v1".to_string(),
            ..Config::for_tests()
        };
        let client = OpenAiClient::new(&cfg).unwrap();
        assert_eq!(
            client.url("/threads/t_1/runs"),
            "https://api.example.test/v1/threads/t_1/runs"
        );
    }

    #[test]
    fn title_request_asks_for_three_short_candidates() {
        let body = title_request("gpt-3.5-turbo", "What is Rust?", "A language.");
        assert_eq!(body["n"], 3);
        assert_eq!(body["max_tokens"], 24);
        assert_eq!(body["messages"][0]["content"], NAMING_PROMPT);
        assert_eq!(body["messages"][2]["role"], "assistant");
    }

    #[test]
    fn completion_texts_skip_empty_choices() {
        let body = json!({
            "choices": [
                {"message": {"content": "\"Rust basics\""}},
                {"message": {"content": null}},
                {"message": {"content": " Systems talk "}}
            ]
        });
        assert_eq!(completion_texts(&body), vec!["Rust basics", "Systems talk"]);
        assert!(completion_texts(&json!({})).is_empty());
    }
}
