//! Assistants v2 payloads, limited to the fields the bot reads.

use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize)]
pub struct Usage {
    #[serde(default)]
    pub prompt_tokens: i64,
    #[serde(default)]
    pub completion_tokens: i64,
    #[serde(default)]
    pub total_tokens: i64,
}

// ============== Assistants ==============

#[derive(Clone, Debug, PartialEq, Deserialize, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AssistantTool {
    CodeInterpreter,
    FileSearch {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        file_search: Option<serde_json::Value>,
    },
    Function {
        function: serde_json::Value,
    },
}

impl AssistantTool {
    pub fn is_code_interpreter(&self) -> bool {
        matches!(self, AssistantTool::CodeInterpreter)
    }
}

#[derive(Clone, Debug, Default, PartialEq, Deserialize)]
pub struct ToolResources {
    #[serde(default)]
    pub code_interpreter: Option<CodeInterpreterResources>,
    #[serde(default)]
    pub file_search: Option<FileSearchResources>,
}

#[derive(Clone, Debug, Default, PartialEq, Deserialize)]
pub struct CodeInterpreterResources {
    #[serde(default)]
    pub file_ids: Vec<String>,
}

#[derive(Clone, Debug, Default, PartialEq, Deserialize)]
pub struct FileSearchResources {
    #[serde(default)]
    pub vector_store_ids: Vec<String>,
}

#[derive(Clone, Debug, PartialEq, Deserialize)]
pub struct RemoteAssistant {
    pub id: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub instructions: Option<String>,
    #[serde(default)]
    pub model: String,
    #[serde(default)]
    pub tools: Vec<AssistantTool>,
    #[serde(default)]
    pub tool_resources: Option<ToolResources>,
}

impl RemoteAssistant {
    pub fn code_interpreter_file_ids(&self) -> &[String] {
        self.tool_resources
            .as_ref()
            .and_then(|r| r.code_interpreter.as_ref())
            .map(|c| c.file_ids.as_slice())
            .unwrap_or_default()
    }

    pub fn vector_store_ids(&self) -> &[String] {
        self.tool_resources
            .as_ref()
            .and_then(|r| r.file_search.as_ref())
            .map(|f| f.vector_store_ids.as_slice())
            .unwrap_or_default()
    }
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct NewAssistant {
    pub model: String,
    pub name: String,
    pub instructions: String,
    pub temperature: f32,
    pub tools: Vec<AssistantTool>,
}

#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
pub struct VectorStoreFile {
    pub id: String,
}

// ============== Runs ==============

#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize)]
pub struct RunError {
    #[serde(default)]
    pub code: Option<String>,
    #[serde(default)]
    pub message: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
pub struct Run {
    pub id: String,
    pub thread_id: String,
    #[serde(default)]
    pub status: String,
    #[serde(default)]
    pub required_action: Option<RequiredAction>,
    #[serde(default)]
    pub last_error: Option<RunError>,
    #[serde(default)]
    pub usage: Option<Usage>,
}

impl Run {
    pub fn pending_tool_calls(&self) -> &[FunctionToolCall] {
        self.required_action
            .as_ref()
            .and_then(|a| a.submit_tool_outputs.as_ref())
            .map(|s| s.tool_calls.as_slice())
            .unwrap_or_default()
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
pub struct RequiredAction {
    #[serde(default)]
    pub submit_tool_outputs: Option<SubmitToolOutputs>,
}

#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
pub struct SubmitToolOutputs {
    #[serde(default)]
    pub tool_calls: Vec<FunctionToolCall>,
}

#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
pub struct FunctionToolCall {
    pub id: String,
    pub function: FunctionCall,
}

#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
pub struct FunctionCall {
    pub name: String,
    #[serde(default)]
    pub arguments: String,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct ToolOutput {
    pub tool_call_id: String,
    pub output: String,
}

// ============== Messages ==============

#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
pub struct ThreadMessage {
    pub id: String,
    #[serde(default)]
    pub thread_id: String,
    #[serde(default)]
    pub content: Vec<MessageContent>,
}

#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum MessageContent {
    Text { text: MessageText },
    ImageFile { image_file: ImageFile },
    ImageUrl { image_url: ImageUrl },
    #[serde(other)]
    Unsupported,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize)]
pub struct MessageText {
    pub value: String,
    #[serde(default)]
    pub annotations: Vec<serde_json::Value>,
}

#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
pub struct ImageFile {
    pub file_id: String,
}

#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
pub struct ImageUrl {
    pub url: String,
}

#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
pub struct MessageDelta {
    pub id: String,
    pub delta: MessageDeltaBody,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize)]
pub struct MessageDeltaBody {
    #[serde(default)]
    pub content: Vec<DeltaContent>,
}

#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
pub struct DeltaContent {
    #[serde(default)]
    pub index: usize,
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub text: Option<DeltaText>,
}

#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
pub struct DeltaText {
    #[serde(default)]
    pub value: Option<String>,
}

impl MessageDelta {
    /// Concatenated text fragments carried by this delta.
    pub fn text(&self) -> String {
        self.delta
            .content
            .iter()
            .filter_map(|c| c.text.as_ref()?.value.as_deref())
            .collect()
    }
}

// ============== Run steps ==============

#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
pub struct RunStep {
    pub id: String,
    #[serde(default)]
    pub run_id: String,
    #[serde(default)]
    pub thread_id: String,
    pub step_details: StepDetails,
}

#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StepDetails {
    MessageCreation,
    ToolCalls {
        #[serde(default)]
        tool_calls: Vec<StepToolCall>,
    },
    #[serde(other)]
    Unknown,
}

#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StepToolCall {
    CodeInterpreter {
        id: String,
        code_interpreter: CodeInterpreterCall,
    },
    FileSearch {
        id: String,
    },
    Function {
        id: String,
        function: StepFunction,
    },
    #[serde(other)]
    Unknown,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize)]
pub struct CodeInterpreterCall {
    #[serde(default)]
    pub input: String,
}

#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
pub struct StepFunction {
    pub name: String,
    #[serde(default)]
    pub arguments: String,
    #[serde(default)]
    pub output: Option<String>,
}

/// Body of the `error` stream event.
#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize)]
pub struct ApiError {
    #[serde(default)]
    pub code: Option<String>,
    #[serde(default)]
    pub message: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn assistant_tools_keep_unknown_fields_of_functions() {
        let raw = json!({
            "id": "asst_1",
            "name": "Bob",
            "model": "gpt-4o",
            "tools": [
                {"type": "code_interpreter"},
                {"type": "function", "function": {"name": "get_current_time", "parameters": {}}}
            ],
            "tool_resources": {"code_interpreter": {"file_ids": ["file_a"]}}
        });
        let a: RemoteAssistant = serde_json::from_value(raw).unwrap();
        assert!(a.tools[0].is_code_interpreter());
        assert_eq!(a.code_interpreter_file_ids(), ["file_a".to_string()]);
        assert!(a.vector_store_ids().is_empty());

        let back = serde_json::to_value(&a.tools).unwrap();
        assert_eq!(back[1]["function"]["name"], "get_current_time");
        assert_eq!(back[0], json!({"type": "code_interpreter"}));
    }

    #[test]
    fn unknown_content_and_steps_do_not_fail() {
        let msg: ThreadMessage = serde_json::from_value(json!({
            "id": "msg_1",
            "thread_id": "t",
            "content": [{"type": "refusal", "refusal": "no"}, {"type": "text", "text": {"value": "hi", "annotations": []}}]
        }))
        .unwrap();
        assert_eq!(msg.content[0], MessageContent::Unsupported);

        let step: RunStep = serde_json::from_value(json!({
            "id": "step_1",
            "step_details": {"type": "message_creation", "message_creation": {"message_id": "m"}}
        }))
        .unwrap();
        assert_eq!(step.step_details, StepDetails::MessageCreation);
    }

    #[test]
    fn delta_text_concatenates_fragments() {
        let d: MessageDelta = serde_json::from_value(json!({
            "id": "msg_1",
            "delta": {"content": [
                {"index": 0, "type": "text", "text": {"value": "Hel"}},
                {"index": 0, "type": "text", "text": {"value": "lo"}}
            ]}
        }))
        .unwrap();
        assert_eq!(d.text(), "Hello");
    }
}
