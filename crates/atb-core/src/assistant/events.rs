//! Assistant run stream: event model, handler callbacks and the dispatcher
//! that drives one run (including tool-output round trips) to completion.

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use tokio_util::sync::CancellationToken;

use crate::{
    assistant::{
        api::{AssistantsApi, EventStream},
        types::{
            ApiError, FunctionToolCall, MessageContent, MessageDelta, MessageText, Run, RunStep,
            StepDetails, StepToolCall, ThreadMessage, ToolOutput, Usage,
        },
    },
    errors::Error,
    Result,
};

/// One server-sent event of a run stream.
#[derive(Clone, Debug, PartialEq)]
pub enum AssistantStreamEvent {
    RunCreated(Run),
    RunRequiresAction(Run),
    MessageDelta(MessageDelta),
    MessageCompleted(ThreadMessage),
    RunStepCompleted(RunStep),
    RunCompleted(Run),
    RunFailed(Run),
    Error(ApiError),
    Done,
    /// Any event the bot does not react to.
    Other { event: String },
}

impl AssistantStreamEvent {
    /// Build an event from the SSE `event:` name and its `data:` payload.
    pub fn from_sse(event: &str, data: &str) -> Result<Self> {
        if event == "done" || data.trim() == "[DONE]" {
            return Ok(Self::Done);
        }
        Ok(match event {
            "thread.run.created" => Self::RunCreated(payload(event, data)?),
            "thread.run.requires_action" => Self::RunRequiresAction(payload(event, data)?),
            "thread.message.delta" => Self::MessageDelta(payload(event, data)?),
            "thread.message.completed" => Self::MessageCompleted(payload(event, data)?),
            "thread.run.step.completed" => Self::RunStepCompleted(payload(event, data)?),
            "thread.run.completed" => Self::RunCompleted(payload(event, data)?),
            "thread.run.failed" => Self::RunFailed(payload(event, data)?),
            "error" => {
                let v: serde_json::Value = serde_json::from_str(data)?;
                // Some gateways wrap the body in {"error": {...}}.
                let body = match v.get("error") {
                    Some(inner) if inner.is_object() => inner.clone(),
                    _ => v,
                };
                Self::Error(serde_json::from_value(body)?)
            }
            other => Self::Other {
                event: other.to_string(),
            },
        })
    }
}

fn payload<T: DeserializeOwned>(event: &str, data: &str) -> Result<T> {
    serde_json::from_str(data)
        .map_err(|e| Error::External(format!("malformed {event} payload: {e}")))
}

/// Finished image produced by a run.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ImagePayload {
    /// Downloaded `image_file` content.
    Bytes(Vec<u8>),
    Url(String),
}

/// Callbacks invoked while a run is observed. Implement only what you need;
/// every method defaults to doing nothing.
#[async_trait]
pub trait AssistantEventHandler: Send {
    async fn text_delta(&mut self, _delta: &str) -> Result<()> {
        Ok(())
    }

    async fn text_done(&mut self, _text: &MessageText) -> Result<()> {
        Ok(())
    }

    async fn image_done(&mut self, _image: ImagePayload) -> Result<()> {
        Ok(())
    }

    async fn tool_calls_done(&mut self, _calls: &[StepToolCall]) -> Result<()> {
        Ok(())
    }

    /// Outputs for the function calls a run is waiting on. Returning no
    /// outputs still resumes the run.
    async fn tool_calls_action(&mut self, _calls: &[FunctionToolCall]) -> Result<Vec<ToolOutput>> {
        Ok(Vec::new())
    }

    async fn run_completed(
        &mut self,
        _run_id: &str,
        _thread_id: &str,
        _usage: Option<&Usage>,
    ) -> Result<()> {
        Ok(())
    }

    async fn error(&mut self, _code: Option<&str>, _message: &str) -> Result<()> {
        Ok(())
    }
}

/// What happened during an observed run.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ObserveSummary {
    pub run_id: Option<String>,
    pub thread_id: Option<String>,
    pub usage: Option<Usage>,
    pub completed: bool,
    pub failed: bool,
    pub cancelled: bool,
    /// Completed message texts, joined by blank lines.
    pub text: String,
}

impl ObserveSummary {
    fn track(&mut self, run: &Run) {
        self.run_id = Some(run.id.clone());
        self.thread_id = Some(run.thread_id.clone());
        if run.usage.is_some() {
            self.usage = run.usage.clone();
        }
    }

    fn push_text(&mut self, text: &str) {
        if !self.text.is_empty() {
            self.text.push_str("\n\n");
        }
        self.text.push_str(text);
    }
}

/// Routes stream events to an [`AssistantEventHandler`].
pub struct EventDispatcher<'a> {
    api: &'a dyn AssistantsApi,
    cancel: CancellationToken,
}

impl<'a> EventDispatcher<'a> {
    pub fn new(api: &'a dyn AssistantsApi) -> Self {
        Self {
            api,
            cancel: CancellationToken::new(),
        }
    }

    /// Stop observing (and cancel the remote run) once `token` fires.
    pub fn with_cancel(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    /// Consume `stream` and every follow-up stream opened by submitting tool
    /// outputs. A failing event is logged and skipped.
    pub async fn observe(
        &self,
        stream: EventStream,
        handler: &mut dyn AssistantEventHandler,
    ) -> ObserveSummary {
        let mut summary = ObserveSummary::default();
        let mut current = stream;

        loop {
            let mut follow_up: Option<EventStream> = None;

            loop {
                let next = tokio::select! {
                    biased;
                    _ = self.cancel.cancelled() => {
                        summary.cancelled = true;
                        self.cancel_remote(&summary).await;
                        return summary;
                    }
                    next = current.recv() => next,
                };

                let event = match next {
                    None => break,
                    Some(Ok(AssistantStreamEvent::Done)) => break,
                    Some(Ok(event)) => event,
                    Some(Err(e)) => {
                        tracing::warn!(error = %e, "assistant stream failed");
                        summary.failed = true;
                        if let Err(e) = handler.error(None, &e.to_string()).await {
                            tracing::warn!(error = %e, "error callback failed");
                        }
                        break;
                    }
                };

                match self.dispatch(event, handler, &mut summary).await {
                    Ok(Some(stream)) => follow_up = Some(stream),
                    Ok(None) => {}
                    Err(e) => tracing::warn!(error = %e, "assistant event handling failed"),
                }
            }

            match follow_up {
                Some(stream) => current = stream,
                None => return summary,
            }
        }
    }

    async fn dispatch(
        &self,
        event: AssistantStreamEvent,
        handler: &mut dyn AssistantEventHandler,
        summary: &mut ObserveSummary,
    ) -> Result<Option<EventStream>> {
        match event {
            AssistantStreamEvent::RunCreated(run) => summary.track(&run),
            AssistantStreamEvent::RunRequiresAction(run) => {
                summary.track(&run);
                return Ok(self.resolve_required_action(&run, handler).await);
            }
            AssistantStreamEvent::MessageDelta(delta) => {
                let text = delta.text();
                if !text.is_empty() {
                    handler.text_delta(&text).await?;
                }
            }
            AssistantStreamEvent::MessageCompleted(message) => {
                for part in message.content {
                    match part {
                        MessageContent::Text { text } => {
                            summary.push_text(&text.value);
                            handler.text_done(&text).await?;
                        }
                        MessageContent::ImageFile { image_file } => {
                            let bytes = self.api.file_content(&image_file.file_id).await?;
                            handler.image_done(ImagePayload::Bytes(bytes)).await?;
                        }
                        MessageContent::ImageUrl { image_url } => {
                            handler.image_done(ImagePayload::Url(image_url.url)).await?;
                        }
                        MessageContent::Unsupported => {}
                    }
                }
            }
            AssistantStreamEvent::RunStepCompleted(step) => {
                if let StepDetails::ToolCalls { tool_calls } = &step.step_details {
                    handler.tool_calls_done(tool_calls).await?;
                }
            }
            AssistantStreamEvent::RunCompleted(run) => {
                summary.track(&run);
                summary.completed = true;
                handler
                    .run_completed(&run.id, &run.thread_id, run.usage.as_ref())
                    .await?;
            }
            AssistantStreamEvent::RunFailed(run) => {
                summary.track(&run);
                summary.failed = true;
                let last = run.last_error.unwrap_or_default();
                handler
                    .error(
                        last.code.as_deref(),
                        last.message.as_deref().unwrap_or("No message"),
                    )
                    .await?;
            }
            AssistantStreamEvent::Error(err) => {
                summary.failed = true;
                handler.error(err.code.as_deref(), &err.message).await?;
            }
            AssistantStreamEvent::Done | AssistantStreamEvent::Other { .. } => {}
        }
        Ok(None)
    }

    /// Collect outputs for the pending calls and submit them together.
    async fn resolve_required_action(
        &self,
        run: &Run,
        handler: &mut dyn AssistantEventHandler,
    ) -> Option<EventStream> {
        let outputs = match handler.tool_calls_action(run.pending_tool_calls()).await {
            Ok(outputs) => outputs,
            Err(e) => {
                tracing::warn!(run_id = %run.id, error = %e, "tool calls failed");
                return None;
            }
        };

        match self
            .api
            .submit_tool_outputs_stream(&run.thread_id, &run.id, outputs)
            .await
        {
            Ok(stream) => Some(stream),
            Err(e) => {
                tracing::warn!(run_id = %run.id, error = %e, "submitting tool outputs failed");
                None
            }
        }
    }

    async fn cancel_remote(&self, summary: &ObserveSummary) {
        let (Some(thread_id), Some(run_id)) = (&summary.thread_id, &summary.run_id) else {
            return;
        };
        if let Err(e) = self.api.cancel_run(thread_id, run_id).await {
            tracing::warn!(%run_id, error = %e, "cancelling run failed");
        }
    }
}
