use serde::{Deserialize, Serialize};

/// Function-calling capability descriptor, serialized verbatim into the
/// assistant's tool list.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ToolDef {
    pub name: String,
    pub description: String,
    pub parameters: serde_json::Value,
}

/// Remote assistant the runs are executed by.
#[derive(Debug, Clone)]
pub struct AssistantProfile {
    pub name: String,
    pub description: String,
    pub model: String,
    /// Default instructions; a run may override them
    pub instructions: Option<String>,
    pub tools: Vec<ToolDef>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum RunState {
    Queued,
    InProgress,
    RequiresAction,
    Cancelling,
    Completed,
    Failed,
    Cancelled,
    Expired,
    Incomplete,
}

impl RunState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Completed | Self::Failed | Self::Cancelled | Self::Expired | Self::Incomplete
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::InProgress => "in_progress",
            Self::RequiresAction => "requires_action",
            Self::Cancelling => "cancelling",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
            Self::Expired => "expired",
            Self::Incomplete => "incomplete",
        }
    }
}

impl std::fmt::Display for RunState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Run {
    pub id: String,
    pub status: RunState,
    #[serde(default)]
    pub required_action: Option<RequiredAction>,
    #[serde(default)]
    pub last_error: Option<RunFailure>,
    #[serde(default)]
    pub usage: Option<RunUsage>,
}

impl Run {
    /// Tool calls the backend is waiting on. Empty unless `requires_action`.
    pub fn pending_tool_calls(&self) -> &[ToolCall] {
        self.required_action
            .as_ref()
            .and_then(|a| a.submit_tool_outputs.as_ref())
            .map(|s| s.tool_calls.as_slice())
            .unwrap_or(&[])
    }

    pub fn failure_code(&self) -> &str {
        self.last_error
            .as_ref()
            .map(|e| e.code.as_str())
            .unwrap_or("unknown_error")
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequiredAction {
    #[serde(rename = "type", default)]
    pub kind: String,
    #[serde(default)]
    pub submit_tool_outputs: Option<SubmitToolOutputs>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubmitToolOutputs {
    #[serde(default)]
    pub tool_calls: Vec<ToolCall>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ToolCall {
    pub id: String,
    #[serde(rename = "type", default = "default_call_type")]
    pub call_type: String,
    pub function: FunctionCall,
}

fn default_call_type() -> String {
    "function".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FunctionCall {
    pub name: String,
    /// Raw JSON text exactly as the backend produced it
    #[serde(default)]
    pub arguments: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunFailure {
    pub code: String,
    #[serde(default)]
    pub message: String,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct RunUsage {
    #[serde(default)]
    pub prompt_tokens: u32,
    #[serde(default)]
    pub completion_tokens: u32,
    #[serde(default)]
    pub total_tokens: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ToolOutput {
    pub tool_call_id: String,
    pub output: String,
}

/// A message stored in a backend session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackendMessage {
    pub id: String,
    #[serde(default)]
    pub role: String,
    #[serde(default)]
    pub content: Vec<MessagePart>,
    #[serde(default)]
    pub attachments: Vec<MessageAttachment>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum MessagePart {
    Text {
        text: TextContent,
    },
    ImageFile {
        image_file: ImageFileRef,
    },
    #[serde(other)]
    Unsupported,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TextContent {
    pub value: String,
    #[serde(default)]
    pub annotations: Vec<Annotation>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Annotation {
    #[serde(rename = "type", default)]
    pub kind: String,
    /// Marker text as it appears inside `TextContent::value`
    #[serde(default)]
    pub text: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ImageFileRef {
    pub file_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MessageAttachment {
    pub file_id: String,
    #[serde(default)]
    pub tools: Vec<AttachmentTool>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AttachmentTool {
    #[serde(rename = "type")]
    pub kind: String,
}

impl MessageAttachment {
    /// A file made available to code interpreter and file search.
    pub fn searchable(file_id: impl Into<String>) -> Self {
        Self {
            file_id: file_id.into(),
            tools: vec![
                AttachmentTool {
                    kind: "code_interpreter".into(),
                },
                AttachmentTool {
                    kind: "file_search".into(),
                },
            ],
        }
    }

    /// A file made available to code interpreter only.
    pub fn code_interpreter(file_id: impl Into<String>) -> Self {
        Self {
            file_id: file_id.into(),
            tools: vec![AttachmentTool {
                kind: "code_interpreter".into(),
            }],
        }
    }
}

/// Content of a user turn submitted to a session.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentInput {
    Text { text: String },
    ImageFile { image_file: ImageFileRef },
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct NewMessage {
    pub role: String,
    pub content: Vec<ContentInput>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub attachments: Vec<MessageAttachment>,
}

impl NewMessage {
    pub fn user(text: impl Into<String>) -> Self {
        Self {
            role: "user".into(),
            content: vec![ContentInput::Text { text: text.into() }],
            attachments: vec![],
        }
    }

    pub fn with_image(mut self, file_id: impl Into<String>) -> Self {
        self.content.push(ContentInput::ImageFile {
            image_file: ImageFileRef {
                file_id: file_id.into(),
                detail: Some("high".into()),
            },
        });
        self
    }

    pub fn with_attachment(mut self, file_id: impl Into<String>) -> Self {
        self.attachments.push(MessageAttachment::searchable(file_id));
        self
    }

    pub fn with_code_file(mut self, file_id: impl Into<String>) -> Self {
        self.attachments
            .push(MessageAttachment::code_interpreter(file_id));
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FilePurpose {
    Assistants,
    Vision,
}

impl FilePurpose {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Assistants => "assistants",
            Self::Vision => "vision",
        }
    }
}

/// A backend-held file fetched to memory.
#[derive(Debug, Clone)]
pub struct RemoteFile {
    pub id: String,
    pub filename: String,
    pub bytes: Vec<u8>,
}

#[derive(Debug, Clone)]
pub struct GeneratedImage {
    pub url: String,
    pub revised_prompt: Option<String>,
}
