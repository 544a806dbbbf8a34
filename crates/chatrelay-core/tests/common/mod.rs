#![allow(dead_code)]

use std::collections::{HashMap, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chatrelay_core::*;
use chatrelay_provider::{
    AssistantBackend, AssistantProfile, BackendError, BackendMessage, ErrorKind, FilePurpose,
    FunctionCall, ImageFileRef, MessagePart, NewMessage, RemoteFile, RequiredAction, Run,
    RunFailure, RunState, SubmitToolOutputs, TextContent, ToolCall, ToolOutput,
};
use chatrelay_schema::{DeliveryStatus, OutputFragment, ReplyTarget};

/// One scripted answer to create/retrieve/submit.
#[derive(Debug, Clone)]
pub struct Step {
    pub state: RunState,
    pub calls: Vec<ToolCall>,
    pub reply: Option<String>,
    pub image: Option<String>,
    pub failure: Option<String>,
    pub error: Option<u16>,
}

impl Step {
    pub fn at(state: RunState) -> Self {
        Self {
            state,
            calls: Vec::new(),
            reply: None,
            image: None,
            failure: None,
            error: None,
        }
    }

    pub fn completed(reply: &str) -> Self {
        Self::at(RunState::Completed).with_reply(reply)
    }

    pub fn tool_call(id: &str, name: &str, arguments: &str) -> Self {
        let mut step = Self::at(RunState::RequiresAction);
        step.calls.push(ToolCall {
            id: id.into(),
            call_type: "function".into(),
            function: FunctionCall {
                name: name.into(),
                arguments: arguments.into(),
            },
        });
        step
    }

    pub fn failed(code: &str) -> Self {
        let mut step = Self::at(RunState::Failed);
        step.failure = Some(code.into());
        step
    }

    /// The backend call itself fails with this HTTP status.
    pub fn error(status: u16) -> Self {
        let mut step = Self::at(RunState::InProgress);
        step.error = Some(status);
        step
    }

    pub fn with_reply(mut self, text: &str) -> Self {
        self.reply = Some(text.into());
        self
    }

    pub fn with_image(mut self, file_id: &str) -> Self {
        self.image = Some(file_id.into());
        self
    }
}

fn api_error(status: u16) -> BackendError {
    let kind = match status {
        429 => ErrorKind::RateLimit,
        500..=599 => ErrorKind::ServerError,
        404 => ErrorKind::NotFound,
        _ => ErrorKind::InvalidRequest,
    };
    BackendError::Api {
        status,
        kind,
        message: format!("scripted failure {status}"),
    }
}

#[derive(Default)]
struct State {
    next_id: usize,
    scripts: VecDeque<Vec<Step>>,
    runs: HashMap<String, (String, VecDeque<Step>, RunState)>,
    messages: HashMap<String, Vec<BackendMessage>>,
    fail_create_session: usize,
    fail_uploads: bool,

    sessions_created: Vec<String>,
    sessions_deleted: Vec<String>,
    assistants_ensured: usize,
    uploads: Vec<(PathBuf, FilePurpose)>,
    user_messages: Vec<(String, NewMessage)>,
    run_instructions: Vec<Option<String>>,
    submissions: Vec<Vec<ToolOutput>>,
    cancels: Vec<String>,
    in_flight: HashMap<String, usize>,
    max_in_flight: usize,
}

impl State {
    fn id(&mut self, prefix: &str) -> String {
        self.next_id += 1;
        format!("{prefix}_{}", self.next_id)
    }

    fn push_message(&mut self, session_id: &str, role: &str, content: Vec<MessagePart>) -> String {
        let id = self.id("msg");
        self.messages
            .entry(session_id.to_string())
            .or_default()
            .push(BackendMessage {
                id: id.clone(),
                role: role.into(),
                content,
                attachments: Vec::new(),
            });
        id
    }

    fn advance(&mut self, run_id: &str) -> chatrelay_provider::Result<Run> {
        let Some((session_id, steps, last)) = self.runs.get_mut(run_id) else {
            return Err(api_error(404));
        };
        let session_id = session_id.clone();
        let step = steps.pop_front().unwrap_or_else(|| Step::at(*last));
        if let Some(status) = step.error {
            return Err(api_error(status));
        }
        *last = step.state;

        let mut content = Vec::new();
        if let Some(text) = &step.reply {
            content.push(MessagePart::Text {
                text: TextContent {
                    value: text.clone(),
                    annotations: Vec::new(),
                },
            });
        }
        if let Some(file_id) = &step.image {
            content.push(MessagePart::ImageFile {
                image_file: ImageFileRef {
                    file_id: file_id.clone(),
                    detail: None,
                },
            });
        }
        if !content.is_empty() {
            self.push_message(&session_id, "assistant", content);
        }

        if step.state.is_terminal() {
            if let Some(n) = self.in_flight.get_mut(&session_id) {
                *n = n.saturating_sub(1);
            }
        }

        Ok(Run {
            id: run_id.to_string(),
            status: step.state,
            required_action: (!step.calls.is_empty()).then(|| RequiredAction {
                kind: "submit_tool_outputs".into(),
                submit_tool_outputs: Some(SubmitToolOutputs {
                    tool_calls: step.calls.clone(),
                }),
            }),
            last_error: step.failure.map(|code| RunFailure {
                code,
                message: String::new(),
            }),
            usage: None,
        })
    }
}

/// In-memory assistant backend answering runs from queued scripts.
#[derive(Default)]
pub struct ScriptedBackend {
    state: Mutex<State>,
}

impl ScriptedBackend {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Queue the steps for the next started run. A run without a script
    /// completes immediately; an exhausted script repeats its last state.
    pub fn script(&self, steps: Vec<Step>) {
        self.state.lock().unwrap().scripts.push_back(steps);
    }

    pub fn fail_next_session_creates(&self, count: usize) {
        self.state.lock().unwrap().fail_create_session = count;
    }

    pub fn fail_uploads(&self) {
        self.state.lock().unwrap().fail_uploads = true;
    }

    pub fn sessions_created(&self) -> Vec<String> {
        self.state.lock().unwrap().sessions_created.clone()
    }

    pub fn sessions_deleted(&self) -> Vec<String> {
        self.state.lock().unwrap().sessions_deleted.clone()
    }

    pub fn assistants_ensured(&self) -> usize {
        self.state.lock().unwrap().assistants_ensured
    }

    pub fn uploads(&self) -> Vec<(PathBuf, FilePurpose)> {
        self.state.lock().unwrap().uploads.clone()
    }

    pub fn user_messages(&self) -> Vec<(String, NewMessage)> {
        self.state.lock().unwrap().user_messages.clone()
    }

    pub fn run_instructions(&self) -> Vec<Option<String>> {
        self.state.lock().unwrap().run_instructions.clone()
    }

    pub fn runs_started(&self) -> usize {
        self.state.lock().unwrap().run_instructions.len()
    }

    pub fn submissions(&self) -> Vec<Vec<ToolOutput>> {
        self.state.lock().unwrap().submissions.clone()
    }

    pub fn cancels(&self) -> Vec<String> {
        self.state.lock().unwrap().cancels.clone()
    }

    pub fn max_in_flight(&self) -> usize {
        self.state.lock().unwrap().max_in_flight
    }

    /// Append an assistant message directly, outside any run.
    pub fn push_assistant_text(&self, session_id: &str, text: &str) -> String {
        self.state.lock().unwrap().push_message(
            session_id,
            "assistant",
            vec![MessagePart::Text {
                text: TextContent {
                    value: text.into(),
                    annotations: Vec::new(),
                },
            }],
        )
    }
}

#[async_trait]
impl AssistantBackend for ScriptedBackend {
    async fn ensure_assistant(&self, _profile: &AssistantProfile) -> chatrelay_provider::Result<String> {
        self.state.lock().unwrap().assistants_ensured += 1;
        Ok("asst_scripted".into())
    }

    async fn create_session(&self) -> chatrelay_provider::Result<String> {
        let mut state = self.state.lock().unwrap();
        if state.fail_create_session > 0 {
            state.fail_create_session -= 1;
            return Err(api_error(503));
        }
        let id = state.id("thread");
        state.sessions_created.push(id.clone());
        Ok(id)
    }

    async fn delete_session(&self, session_id: &str) -> chatrelay_provider::Result<()> {
        let mut state = self.state.lock().unwrap();
        state.sessions_deleted.push(session_id.to_string());
        state.messages.remove(session_id);
        Ok(())
    }

    async fn upload_file(&self, path: &Path, purpose: FilePurpose) -> chatrelay_provider::Result<String> {
        let mut state = self.state.lock().unwrap();
        if state.fail_uploads {
            return Err(api_error(400));
        }
        state.uploads.push((path.to_path_buf(), purpose));
        Ok(state.id("file"))
    }

    async fn create_message(
        &self,
        session_id: &str,
        message: &NewMessage,
    ) -> chatrelay_provider::Result<String> {
        let mut state = self.state.lock().unwrap();
        state
            .user_messages
            .push((session_id.to_string(), message.clone()));
        Ok(state.push_message(session_id, "user", Vec::new()))
    }

    async fn create_run(
        &self,
        session_id: &str,
        _assistant_id: &str,
        instructions: Option<&str>,
    ) -> chatrelay_provider::Result<Run> {
        let mut state = self.state.lock().unwrap();
        state.run_instructions.push(instructions.map(str::to_string));
        let script = state
            .scripts
            .pop_front()
            .unwrap_or_else(|| vec![Step::completed("ok")]);
        let run_id = state.id("run");
        state.runs.insert(
            run_id.clone(),
            (session_id.to_string(), script.into(), RunState::Queued),
        );
        let in_flight = state.in_flight.entry(session_id.to_string()).or_default();
        *in_flight += 1;
        let current = *in_flight;
        state.max_in_flight = state.max_in_flight.max(current);
        state.advance(&run_id)
    }

    async fn retrieve_run(&self, _session_id: &str, run_id: &str) -> chatrelay_provider::Result<Run> {
        self.state.lock().unwrap().advance(run_id)
    }

    async fn submit_tool_outputs(
        &self,
        _session_id: &str,
        run_id: &str,
        outputs: &[ToolOutput],
    ) -> chatrelay_provider::Result<Run> {
        let mut state = self.state.lock().unwrap();
        state.submissions.push(outputs.to_vec());
        state.advance(run_id)
    }

    async fn cancel_run(&self, session_id: &str, run_id: &str) -> chatrelay_provider::Result<Run> {
        let mut state = self.state.lock().unwrap();
        state.cancels.push(run_id.to_string());
        if let Some(n) = state.in_flight.get_mut(session_id) {
            *n = n.saturating_sub(1);
        }
        if let Some(entry) = state.runs.get_mut(run_id) {
            entry.1.clear();
            entry.2 = RunState::Cancelled;
        }
        Ok(Run {
            id: run_id.to_string(),
            status: RunState::Cancelling,
            required_action: None,
            last_error: None,
            usage: None,
        })
    }

    async fn list_messages_after(
        &self,
        session_id: &str,
        after: Option<&str>,
    ) -> chatrelay_provider::Result<Vec<BackendMessage>> {
        let state = self.state.lock().unwrap();
        let messages = state.messages.get(session_id).cloned().unwrap_or_default();
        let start = match after {
            Some(cursor) => messages
                .iter()
                .position(|m| m.id == cursor)
                .map(|i| i + 1)
                .unwrap_or(0),
            None => 0,
        };
        Ok(messages[start..].to_vec())
    }

    async fn download_file(&self, file_id: &str) -> chatrelay_provider::Result<RemoteFile> {
        Ok(RemoteFile {
            id: file_id.to_string(),
            filename: "chart.png".into(),
            bytes: b"png-bytes".to_vec(),
        })
    }
}

/// Collects fragments in arrival order.
#[derive(Clone, Default)]
pub struct RecordingSink {
    pub fragments: Arc<Mutex<Vec<OutputFragment>>>,
}

impl RecordingSink {
    pub fn take(&self) -> Vec<OutputFragment> {
        std::mem::take(&mut *self.fragments.lock().unwrap())
    }
}

#[async_trait]
impl FragmentSink for RecordingSink {
    async fn emit(&self, fragment: OutputFragment) -> DeliveryStatus {
        self.fragments.lock().unwrap().push(fragment);
        DeliveryStatus::DELIVERED
    }
}

/// Transport recording (target, fragment) pairs.
#[derive(Clone, Default)]
pub struct RecordingTransport {
    pub sent: Arc<Mutex<Vec<(ReplyTarget, OutputFragment)>>>,
}

impl RecordingTransport {
    pub fn fragments(&self) -> Vec<OutputFragment> {
        self.sent.lock().unwrap().iter().map(|(_, f)| f.clone()).collect()
    }
}

#[async_trait]
impl Transport for RecordingTransport {
    async fn send(&self, target: &ReplyTarget, fragment: &OutputFragment) -> DeliveryStatus {
        self.sent
            .lock()
            .unwrap()
            .push((target.clone(), fragment.clone()));
        DeliveryStatus::DELIVERED
    }
}

pub struct EchoTool;

#[derive(serde::Deserialize)]
pub struct EchoArgs {
    pub text: String,
}

#[async_trait]
impl Tool for EchoTool {
    type Args = EchoArgs;

    fn definition(&self) -> chatrelay_provider::ToolDef {
        chatrelay_provider::ToolDef {
            name: "echo".into(),
            description: "Echo the input".into(),
            parameters: serde_json::json!({
                "type": "object",
                "properties": {"text": {"type": "string"}},
                "required": ["text"]
            }),
        }
    }

    async fn invoke(&self, args: EchoArgs, ctx: &ToolContext<'_>) -> Result<String, ToolError> {
        ctx.emit(OutputFragment::text("echoing...")).await;
        Ok(args.text)
    }
}

pub fn profile() -> AssistantProfile {
    AssistantProfile {
        name: "chatrelay-test".into(),
        description: "test assistant".into(),
        model: "gpt-test".into(),
        instructions: Some("You are a helpful assistant.".into()),
        tools: Vec::new(),
    }
}

pub fn fast_poll() -> PollPolicy {
    PollPolicy {
        initial: std::time::Duration::from_millis(10),
        max: std::time::Duration::from_millis(50),
        factor: 2.0,
        deadline: Some(std::time::Duration::from_secs(5)),
    }
}

pub fn driver(backend: Arc<ScriptedBackend>, scratch: &Path) -> Arc<RunDriver> {
    let mut tools = ToolRegistry::new();
    tools.register(EchoTool);
    Arc::new(
        RunDriver::new(backend, Arc::new(tools), profile(), ScratchDir::new(scratch))
            .with_poll_policy(fast_poll()),
    )
}

pub struct Harness {
    pub backend: Arc<ScriptedBackend>,
    pub transport: RecordingTransport,
    pub orchestrator: TurnOrchestrator,
    pub _scratch: tempfile::TempDir,
}

pub fn harness_with_presets(presets: PresetLibrary) -> Harness {
    let scratch = tempfile::tempdir().unwrap();
    let backend = ScriptedBackend::new();
    let transport = RecordingTransport::default();
    let orchestrator = TurnOrchestrator::new(
        Arc::new(SessionRegistry::new(backend.clone())),
        driver(backend.clone(), scratch.path()),
        Arc::new(presets),
        ReplyEmitter::new(transport.clone()),
    );
    Harness {
        backend,
        transport,
        orchestrator,
        _scratch: scratch,
    }
}

pub fn harness() -> Harness {
    harness_with_presets(PresetLibrary::default())
}
