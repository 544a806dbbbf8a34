use std::path::Path;

use async_trait::async_trait;

mod error;
mod openai;
mod types;

pub use error::{BackendError, ErrorKind};
pub use openai::{OpenAiAssistants, OpenAiSettings};
pub use types::*;

pub type Result<T> = std::result::Result<T, BackendError>;

/// Remote assistant service that owns sessions, messages and runs.
///
/// Sessions are opaque server-side containers; every id returned here is
/// only meaningful to the same backend.
#[async_trait]
pub trait AssistantBackend: Send + Sync {
    /// Find the assistant by name, creating it when absent, and bring its
    /// description, instructions, model and tools up to date.
    async fn ensure_assistant(&self, profile: &AssistantProfile) -> Result<String>;

    async fn create_session(&self) -> Result<String>;

    async fn delete_session(&self, session_id: &str) -> Result<()>;

    async fn upload_file(&self, path: &Path, purpose: FilePurpose) -> Result<String>;

    /// Append a message; returns the new message id.
    async fn create_message(&self, session_id: &str, message: &NewMessage) -> Result<String>;

    async fn create_run(
        &self,
        session_id: &str,
        assistant_id: &str,
        instructions: Option<&str>,
    ) -> Result<Run>;

    async fn retrieve_run(&self, session_id: &str, run_id: &str) -> Result<Run>;

    async fn submit_tool_outputs(
        &self,
        session_id: &str,
        run_id: &str,
        outputs: &[ToolOutput],
    ) -> Result<Run>;

    async fn cancel_run(&self, session_id: &str, run_id: &str) -> Result<Run>;

    /// All messages strictly after `after`, oldest first.
    async fn list_messages_after(
        &self,
        session_id: &str,
        after: Option<&str>,
    ) -> Result<Vec<BackendMessage>>;

    async fn download_file(&self, file_id: &str) -> Result<RemoteFile>;
}

/// Media endpoints used by the built-in tools.
#[async_trait]
pub trait MediaBackend: Send + Sync {
    async fn generate_image(&self, prompt: &str, quality: &str) -> Result<GeneratedImage>;

    async fn synthesize_speech(&self, text: &str) -> Result<Vec<u8>>;

    async fn transcribe(&self, path: &Path) -> Result<String>;

    /// Plain GET through the same client (proxy included).
    async fn fetch_bytes(&self, url: &str) -> Result<Vec<u8>>;
}
