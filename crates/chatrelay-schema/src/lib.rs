use std::fmt;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Stable id of a single or group chat. Every turn belongs to one.
#[derive(Debug, Clone, Hash, Eq, PartialEq, Ord, PartialOrd, Serialize, Deserialize)]
pub struct ConversationId(pub String);

impl ConversationId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ConversationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ConversationId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct SenderIdentity {
    /// Transport-level account handle (used for admin checks and templates)
    pub handle: String,
    /// Human readable nickname
    pub display_name: String,
}

impl SenderIdentity {
    pub fn new(handle: impl Into<String>, display_name: impl Into<String>) -> Self {
        Self {
            handle: handle.into(),
            display_name: display_name.into(),
        }
    }
}

/// Kind of a message the user quoted alongside their text.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum QuotedKind {
    Text,
    Link,
    Image,
    File,
    Audio,
    Video,
    /// The transport failed to recover the quoted content
    Error,
    Unsupported,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QuotedContext {
    pub kind: QuotedKind,
    /// Literal text for text/link kinds, a local file path otherwise
    pub content: String,
}

impl QuotedContext {
    pub fn new(kind: QuotedKind, content: impl Into<String>) -> Self {
        Self {
            kind,
            content: content.into(),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum AttachmentKind {
    /// Sent to the backend as an inline vision input
    Image,
    /// Sent to the backend as a file for code interpreter / file search
    Document,
    /// Sent to the backend as a file for code interpreter only
    Video,
}

/// A file on local disk that must be made visible to the backend.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct LocalAttachment {
    pub kind: AttachmentKind,
    pub path: PathBuf,
}

impl LocalAttachment {
    pub fn image(path: impl Into<PathBuf>) -> Self {
        Self {
            kind: AttachmentKind::Image,
            path: path.into(),
        }
    }

    pub fn document(path: impl Into<PathBuf>) -> Self {
        Self {
            kind: AttachmentKind::Document,
            path: path.into(),
        }
    }

    pub fn video(path: impl Into<PathBuf>) -> Self {
        Self {
            kind: AttachmentKind::Video,
            path: path.into(),
        }
    }

    pub fn file_name(&self) -> String {
        self.path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| self.path.display().to_string())
    }
}

/// One inbound event as normalized by a transport.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InboundEvent {
    pub trace_id: Uuid,
    pub conversation_id: ConversationId,
    pub sender: SenderIdentity,
    pub text: String,
    pub at: DateTime<Utc>,
    #[serde(default)]
    pub is_group: bool,
    #[serde(default)]
    pub from_self: bool,
    #[serde(default)]
    pub is_mention: bool,
    #[serde(default)]
    pub quoted: Option<QuotedContext>,
    #[serde(default)]
    pub attachments: Vec<LocalAttachment>,
    /// Local audio file of a voice message; `text` is empty for these
    #[serde(default)]
    pub voice: Option<PathBuf>,
}

impl InboundEvent {
    pub fn text(
        conversation_id: impl Into<String>,
        sender: SenderIdentity,
        text: impl Into<String>,
    ) -> Self {
        Self {
            trace_id: Uuid::new_v4(),
            conversation_id: ConversationId::new(conversation_id),
            sender,
            text: text.into(),
            at: Utc::now(),
            is_group: false,
            from_self: false,
            is_mention: false,
            quoted: None,
            attachments: vec![],
            voice: None,
        }
    }

    pub fn voice(
        conversation_id: impl Into<String>,
        sender: SenderIdentity,
        audio: impl Into<PathBuf>,
    ) -> Self {
        Self {
            voice: Some(audio.into()),
            ..Self::text(conversation_id, sender, "")
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum FragmentKind {
    Text,
    Image,
    File,
    Audio,
    Link,
    Error,
}

impl fmt::Display for FragmentKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            FragmentKind::Text => "text",
            FragmentKind::Image => "image",
            FragmentKind::File => "file",
            FragmentKind::Audio => "audio",
            FragmentKind::Link => "link",
            FragmentKind::Error => "error",
        };
        f.write_str(name)
    }
}

/// One unit of output forwarded to the transport.
///
/// `payload` is literal text for text/link/error fragments and a local file
/// path for image/file/audio fragments.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct OutputFragment {
    pub kind: FragmentKind,
    pub payload: String,
}

impl OutputFragment {
    pub fn new(kind: FragmentKind, payload: impl Into<String>) -> Self {
        Self {
            kind,
            payload: payload.into(),
        }
    }

    pub fn text(payload: impl Into<String>) -> Self {
        Self::new(FragmentKind::Text, payload)
    }

    pub fn error(payload: impl Into<String>) -> Self {
        Self::new(FragmentKind::Error, payload)
    }

    pub fn image(path: impl Into<PathBuf>) -> Self {
        Self::new(FragmentKind::Image, path.into().display().to_string())
    }

    pub fn file(path: impl Into<PathBuf>) -> Self {
        Self::new(FragmentKind::File, path.into().display().to_string())
    }

    pub fn audio(path: impl Into<PathBuf>) -> Self {
        Self::new(FragmentKind::Audio, path.into().display().to_string())
    }

    pub fn is_media(&self) -> bool {
        matches!(
            self.kind,
            FragmentKind::Image | FragmentKind::File | FragmentKind::Audio
        )
    }
}

/// Where a fragment goes: the conversation plus an optional handle to mention.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ReplyTarget {
    pub conversation_id: ConversationId,
    #[serde(default)]
    pub mention: Option<String>,
}

impl ReplyTarget {
    pub fn new(conversation_id: ConversationId) -> Self {
        Self {
            conversation_id,
            mention: None,
        }
    }

    pub fn with_mention(mut self, handle: impl Into<String>) -> Self {
        self.mention = Some(handle.into());
        self
    }

    /// Group messages from other people get an @mention of the sender.
    pub fn for_inbound(event: &InboundEvent) -> Self {
        let target = Self::new(event.conversation_id.clone());
        if event.is_group && !event.from_self {
            target.with_mention(event.sender.handle.clone())
        } else {
            target
        }
    }
}

/// Transport delivery result. `0` is success, anything else a transport failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeliveryStatus(pub i32);

impl DeliveryStatus {
    pub const DELIVERED: DeliveryStatus = DeliveryStatus(0);

    pub fn is_delivered(&self) -> bool {
        self.0 == 0
    }
}
