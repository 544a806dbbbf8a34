//! Drives one backend run from submission to a terminal state.
//!
//! The backend has no event stream, so the driver polls with backoff,
//! services `requires_action` by dispatching tool calls, and drains new
//! backend messages into output fragments as it goes. A run left in
//! `requires_action` locks its session, so every exit path goes through
//! [`CancelGuard`].

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use chatrelay_provider::{
    AssistantBackend, AssistantProfile, BackendError, BackendMessage, FilePurpose, MessagePart,
    NewMessage, Run, RunState, ToolOutput,
};
use chatrelay_schema::{AttachmentKind, ConversationId, LocalAttachment, OutputFragment};
use tokio::sync::{Mutex, OnceCell};
use tokio::time::Instant;

use crate::emitter::FragmentSink;
use crate::error::RunError;
use crate::scratch::ScratchDir;
use crate::tool::{ToolContext, ToolRegistry};

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PollPolicy {
    pub initial: Duration,
    pub max: Duration,
    pub factor: f64,
    /// Wall-clock budget for one run; `None` polls forever
    pub deadline: Option<Duration>,
}

impl Default for PollPolicy {
    fn default() -> Self {
        Self {
            initial: Duration::from_millis(100),
            max: Duration::from_millis(2000),
            factor: 1.5,
            deadline: Some(Duration::from_secs(600)),
        }
    }
}

impl PollPolicy {
    pub fn next_delay(&self, current: Duration) -> Duration {
        let factor = if self.factor.is_finite() && self.factor >= 1.0 {
            self.factor
        } else {
            1.0
        };
        current.mul_f64(factor).min(self.max)
    }
}

#[derive(Debug, Clone)]
struct CachedUpload {
    file_id: String,
    len: u64,
    modified: Option<SystemTime>,
}

/// Uploads keyed by canonical path and purpose; a change in length or
/// modification time forces a fresh upload.
#[derive(Default)]
pub struct UploadCache {
    entries: Mutex<HashMap<(PathBuf, FilePurpose), CachedUpload>>,
}

impl UploadCache {
    pub async fn resolve(
        &self,
        backend: &dyn AssistantBackend,
        path: &Path,
        purpose: FilePurpose,
    ) -> Result<String, RunError> {
        let upload_err = |source: BackendError| RunError::Upload {
            path: path.to_path_buf(),
            source,
        };
        let canonical = tokio::fs::canonicalize(path)
            .await
            .map_err(|e| upload_err(BackendError::Io(e)))?;
        let meta = tokio::fs::metadata(&canonical)
            .await
            .map_err(|e| upload_err(BackendError::Io(e)))?;
        let modified = meta.modified().ok();
        let key = (canonical, purpose);

        let mut entries = self.entries.lock().await;
        if let Some(hit) = entries.get(&key) {
            if hit.len == meta.len() && hit.modified == modified {
                tracing::debug!(path = %path.display(), file_id = %hit.file_id, "upload cache hit");
                return Ok(hit.file_id.clone());
            }
        }

        let file_id = backend
            .upload_file(&key.0, purpose)
            .await
            .map_err(upload_err)?;
        entries.insert(
            key,
            CachedUpload {
                file_id: file_id.clone(),
                len: meta.len(),
                modified,
            },
        );
        Ok(file_id)
    }

    pub async fn len(&self) -> usize {
        self.entries.lock().await.len()
    }
}

/// Backend-held files downloaded into scratch, keyed by remote file id.
pub struct DownloadCache {
    scratch: ScratchDir,
    entries: Mutex<HashMap<String, PathBuf>>,
}

impl DownloadCache {
    pub fn new(scratch: ScratchDir) -> Self {
        Self {
            scratch,
            entries: Mutex::new(HashMap::new()),
        }
    }

    pub async fn fetch(
        &self,
        backend: &dyn AssistantBackend,
        file_id: &str,
        fallback_ext: &str,
    ) -> Result<PathBuf, RunError> {
        let mut entries = self.entries.lock().await;
        if let Some(path) = entries.get(file_id) {
            if tokio::fs::try_exists(path).await.unwrap_or(false) {
                return Ok(path.clone());
            }
        }

        let file = backend
            .download_file(file_id)
            .await
            .map_err(|source| RunError::Download {
                file_id: file_id.to_string(),
                source,
            })?;
        let base_name = Path::new(&file.filename)
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_default();
        let name = if base_name.is_empty() {
            format!("{file_id}.{fallback_ext}")
        } else {
            format!("{file_id}_{base_name}")
        };
        let path = self.scratch.write(&name, &file.bytes).await?;
        tracing::debug!(%file_id, path = %path.display(), "backend file downloaded");
        entries.insert(file_id.to_string(), path.clone());
        Ok(path)
    }
}

/// A started run plus the drain cursor (id of the last message already
/// turned into fragments).
#[derive(Debug, Clone)]
pub struct RunHandle {
    pub session_id: String,
    pub run: Run,
    pub cursor: Option<String>,
}

/// Cancels an abandoned run.
///
/// Disarmed when the run reaches a terminal state. `release` runs the cancel
/// at most once; a guard dropped while armed (future dropped, panic) spawns a
/// best-effort cancel on the current runtime.
pub struct CancelGuard {
    backend: Arc<dyn AssistantBackend>,
    session_id: String,
    run_id: String,
    last_state: RunState,
    done: bool,
}

impl CancelGuard {
    pub fn new(backend: Arc<dyn AssistantBackend>, handle: &RunHandle) -> Self {
        Self {
            backend,
            session_id: handle.session_id.clone(),
            run_id: handle.run.id.clone(),
            last_state: handle.run.status,
            done: false,
        }
    }

    pub fn observe(&mut self, state: RunState) {
        self.last_state = state;
    }

    pub fn last_state(&self) -> RunState {
        self.last_state
    }

    /// Leave the run alone.
    pub fn disarm(mut self) {
        self.done = true;
    }

    /// Cancel if the run is left waiting on tool outputs, or, when
    /// `any_live_state` is set, in any state other than terminal/cancelling.
    pub async fn release(mut self, any_live_state: bool) {
        self.done = true;
        let state = self.last_state;
        let abandoned = state == RunState::RequiresAction
            || (any_live_state && !state.is_terminal() && state != RunState::Cancelling);
        if !abandoned {
            return;
        }

        tracing::warn!(
            session_id = %self.session_id,
            run_id = %self.run_id,
            status = %state,
            "cancelling abandoned run"
        );
        if let Err(e) = self.backend.cancel_run(&self.session_id, &self.run_id).await {
            tracing::error!(
                session_id = %self.session_id,
                run_id = %self.run_id,
                error = %e,
                "run cancel failed"
            );
        }
    }
}

impl Drop for CancelGuard {
    fn drop(&mut self) {
        if self.done || self.last_state.is_terminal() || self.last_state == RunState::Cancelling {
            return;
        }
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            tracing::error!(run_id = %self.run_id, "run abandoned outside a runtime, cannot cancel");
            return;
        };
        let backend = self.backend.clone();
        let session_id = std::mem::take(&mut self.session_id);
        let run_id = std::mem::take(&mut self.run_id);
        tracing::warn!(%session_id, %run_id, "run dropped mid-flight, cancelling");
        runtime.spawn(async move {
            if let Err(e) = backend.cancel_run(&session_id, &run_id).await {
                tracing::error!(%session_id, %run_id, error = %e, "run cancel failed");
            }
        });
    }
}

pub struct RunDriver {
    backend: Arc<dyn AssistantBackend>,
    tools: Arc<ToolRegistry>,
    profile: AssistantProfile,
    poll: PollPolicy,
    uploads: UploadCache,
    downloads: DownloadCache,
    assistant_id: OnceCell<String>,
}

impl RunDriver {
    /// `profile.tools` is replaced by the registry's descriptors.
    pub fn new(
        backend: Arc<dyn AssistantBackend>,
        tools: Arc<ToolRegistry>,
        mut profile: AssistantProfile,
        scratch: ScratchDir,
    ) -> Self {
        profile.tools = tools.definitions();
        Self {
            backend,
            tools,
            profile,
            poll: PollPolicy::default(),
            uploads: UploadCache::default(),
            downloads: DownloadCache::new(scratch),
            assistant_id: OnceCell::new(),
        }
    }

    pub fn with_poll_policy(mut self, poll: PollPolicy) -> Self {
        self.poll = poll;
        self
    }

    pub fn tools(&self) -> &ToolRegistry {
        &self.tools
    }

    pub fn model(&self) -> &str {
        &self.profile.model
    }

    /// Provisioned once per process.
    pub async fn assistant_id(&self) -> Result<String, RunError> {
        let id = self
            .assistant_id
            .get_or_try_init(|| async { self.backend.ensure_assistant(&self.profile).await })
            .await?;
        Ok(id.clone())
    }

    pub async fn start_run(
        &self,
        session_id: &str,
        content: &str,
        attachments: &[LocalAttachment],
        instructions: Option<&str>,
    ) -> Result<RunHandle, RunError> {
        let assistant_id = self.assistant_id().await?;

        let mut message = NewMessage::user(content);
        for attachment in attachments {
            let purpose = match attachment.kind {
                AttachmentKind::Image => FilePurpose::Vision,
                AttachmentKind::Document | AttachmentKind::Video => FilePurpose::Assistants,
            };
            let file_id = self
                .uploads
                .resolve(self.backend.as_ref(), &attachment.path, purpose)
                .await?;
            message = match attachment.kind {
                AttachmentKind::Image => message.with_image(file_id),
                AttachmentKind::Document => message.with_attachment(file_id),
                // file search rejects video files
                AttachmentKind::Video => message.with_code_file(file_id),
            };
        }

        let message_id = self.backend.create_message(session_id, &message).await?;
        let run = self
            .backend
            .create_run(session_id, &assistant_id, instructions)
            .await?;
        let names: Vec<String> = attachments.iter().map(|a| a.file_name()).collect();
        tracing::info!(
            %session_id,
            run_id = %run.id,
            attachments = ?names,
            "run started"
        );

        Ok(RunHandle {
            session_id: session_id.to_string(),
            run,
            cursor: Some(message_id),
        })
    }

    /// Poll the run to a terminal state, forwarding fragments to `sink`.
    ///
    /// A backend-declared failure is reported as an error fragment and
    /// returned as `Ok`; `Err` means the driver itself gave up, after the
    /// abandoned run has been cancelled.
    pub async fn drive(
        &self,
        handle: &mut RunHandle,
        conversation_id: &ConversationId,
        sink: &dyn FragmentSink,
    ) -> Result<RunState, RunError> {
        let mut guard = CancelGuard::new(self.backend.clone(), handle);
        match self.poll_until_terminal(handle, conversation_id, sink, &mut guard).await {
            Ok(run) => {
                guard.disarm();
                self.finish(handle, run, sink).await
            }
            Err(err) => {
                let deadline = matches!(err, RunError::DeadlineExceeded { .. });
                guard.release(deadline).await;
                Err(err)
            }
        }
    }

    async fn poll_until_terminal(
        &self,
        handle: &mut RunHandle,
        conversation_id: &ConversationId,
        sink: &dyn FragmentSink,
        guard: &mut CancelGuard,
    ) -> Result<Run, RunError> {
        let started = Instant::now();
        let mut delay = self.poll.initial;
        let mut run = handle.run.clone();

        loop {
            guard.observe(run.status);
            if run.status.is_terminal() {
                return Ok(run);
            }
            if let Some(deadline) = self.poll.deadline {
                let elapsed = started.elapsed();
                if elapsed >= deadline {
                    return Err(RunError::DeadlineExceeded { elapsed });
                }
            }

            let calls = run.pending_tool_calls();
            if run.status == RunState::RequiresAction && !calls.is_empty() {
                self.drain(handle, sink).await?;

                let ctx = ToolContext::new(conversation_id, sink);
                let mut outputs = Vec::with_capacity(calls.len());
                for call in calls {
                    let output = self
                        .tools
                        .dispatch(&call.function.name, &call.function.arguments, &ctx)
                        .await;
                    outputs.push(ToolOutput {
                        tool_call_id: call.id.clone(),
                        output,
                    });
                }

                tracing::debug!(run_id = %run.id, count = outputs.len(), "submitting tool outputs");
                run = self
                    .backend
                    .submit_tool_outputs(&handle.session_id, &run.id, &outputs)
                    .await?;
                delay = self.poll.initial;
                continue;
            }

            tokio::time::sleep(delay).await;
            delay = self.poll.next_delay(delay);
            run = self.backend.retrieve_run(&handle.session_id, &run.id).await?;
        }
    }

    async fn finish(
        &self,
        handle: &mut RunHandle,
        run: Run,
        sink: &dyn FragmentSink,
    ) -> Result<RunState, RunError> {
        self.drain(handle, sink).await?;

        let usage = run.usage.unwrap_or_default();
        tracing::info!(
            session_id = %handle.session_id,
            run_id = %run.id,
            status = %run.status,
            prompt_tokens = usage.prompt_tokens,
            completion_tokens = usage.completion_tokens,
            total_tokens = usage.total_tokens,
            "run finished"
        );

        match run.status {
            RunState::Completed => {}
            RunState::Failed => {
                let code = run.failure_code();
                sink.emit(OutputFragment::error(format!("API run failed: {code}")))
                    .await;
            }
            other => {
                sink.emit(OutputFragment::error(format!("API run ended: {other}")))
                    .await;
            }
        }
        let status = run.status;
        handle.run = run;
        Ok(status)
    }

    /// Emit every backend message after the cursor, advancing it message by
    /// message. Returns the number of fragments emitted.
    pub async fn drain(
        &self,
        handle: &mut RunHandle,
        sink: &dyn FragmentSink,
    ) -> Result<usize, RunError> {
        let messages = self
            .backend
            .list_messages_after(&handle.session_id, handle.cursor.as_deref())
            .await?;

        let mut emitted = 0;
        for message in messages {
            if message.role != "user" {
                for fragment in self.fragments_for(&message).await? {
                    sink.emit(fragment).await;
                    emitted += 1;
                }
            }
            handle.cursor = Some(message.id);
        }
        Ok(emitted)
    }

    async fn fragments_for(&self, message: &BackendMessage) -> Result<Vec<OutputFragment>, RunError> {
        let mut fragments = Vec::new();
        for part in &message.content {
            match part {
                MessagePart::Text { text } => {
                    let mut value = text.value.clone();
                    for annotation in &text.annotations {
                        if !annotation.text.is_empty() {
                            value = value.replace(&annotation.text, "");
                        }
                    }
                    let value = value.replace("\n\n", "\n");
                    if !value.trim().is_empty() {
                        fragments.push(OutputFragment::text(value));
                    }
                }
                MessagePart::ImageFile { image_file } => {
                    let path = self
                        .downloads
                        .fetch(self.backend.as_ref(), &image_file.file_id, "png")
                        .await?;
                    fragments.push(OutputFragment::image(path));
                }
                MessagePart::Unsupported => {
                    tracing::debug!(message_id = %message.id, "skipping unsupported message part");
                }
            }
        }
        for attachment in &message.attachments {
            let path = self
                .downloads
                .fetch(self.backend.as_ref(), &attachment.file_id, "bin")
                .await?;
            fragments.push(OutputFragment::file(path));
        }
        Ok(fragments)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_grows_and_caps() {
        let poll = PollPolicy {
            initial: Duration::from_millis(100),
            max: Duration::from_millis(200),
            factor: 1.5,
            deadline: None,
        };
        let d1 = poll.next_delay(poll.initial);
        assert_eq!(d1, Duration::from_millis(150));
        assert_eq!(poll.next_delay(d1), Duration::from_millis(200));
        assert_eq!(poll.next_delay(Duration::from_millis(200)), Duration::from_millis(200));
    }

    #[test]
    fn nonsensical_factor_keeps_delay_flat() {
        let poll = PollPolicy {
            factor: 0.2,
            ..PollPolicy::default()
        };
        assert_eq!(poll.next_delay(poll.initial), poll.initial);
    }
}
