use std::collections::HashMap;
use std::sync::Arc;

use chatrelay_provider::RunState;
use chatrelay_schema::{
    ConversationId, InboundEvent, LocalAttachment, OutputFragment, QuotedContext, QuotedKind,
    ReplyTarget, SenderIdentity,
};
use tokio::sync::{Mutex, OwnedMutexGuard};

use crate::emitter::{FragmentSink, ReplyEmitter};
use crate::error::{RunError, GENERIC_APOLOGY};
use crate::preset::PresetLibrary;
use crate::run_driver::RunDriver;
use crate::session::SessionRegistry;

pub const UNSUPPORTED_QUOTE: &str = "Sorry, this kind of quoted message is not supported.";
pub const QUOTE_ERROR: &str = "Sorry, the quoted message could not be read.";

/// How a turn ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TurnOutcome {
    /// The run reached this terminal state
    Finished(RunState),
    /// Rejected before contacting the backend
    Rejected,
    /// A local or backend error ended the turn; the user got one fragment
    Failed,
}

/// One request/response cycle against the backend, per inbound turn.
pub struct TurnOrchestrator {
    sessions: Arc<SessionRegistry>,
    driver: Arc<RunDriver>,
    presets: Arc<PresetLibrary>,
    emitter: ReplyEmitter,
    turn_locks: ConversationLocks,
}

impl TurnOrchestrator {
    pub fn new(
        sessions: Arc<SessionRegistry>,
        driver: Arc<RunDriver>,
        presets: Arc<PresetLibrary>,
        emitter: ReplyEmitter,
    ) -> Self {
        Self {
            sessions,
            driver,
            presets,
            emitter,
            turn_locks: ConversationLocks::default(),
        }
    }

    pub fn sessions(&self) -> &Arc<SessionRegistry> {
        &self.sessions
    }

    pub fn presets(&self) -> &Arc<PresetLibrary> {
        &self.presets
    }

    pub fn driver(&self) -> &Arc<RunDriver> {
        &self.driver
    }

    pub fn emitter(&self) -> &ReplyEmitter {
        &self.emitter
    }

    /// Entry point used by the gateway: replies mention the sender in groups.
    pub async fn handle_event(&self, event: &InboundEvent) -> TurnOutcome {
        let sink = self.emitter.sink_for(ReplyTarget::for_inbound(event));
        self.run_turn(
            &event.conversation_id,
            &event.sender,
            &event.text,
            event.quoted.as_ref(),
            &event.attachments,
            &sink,
        )
        .await
    }

    pub async fn handle_turn(
        &self,
        conversation_id: &ConversationId,
        sender: &SenderIdentity,
        raw_text: &str,
        quoted: Option<&QuotedContext>,
        attachments: &[LocalAttachment],
    ) -> TurnOutcome {
        let sink = self
            .emitter
            .sink_for(ReplyTarget::new(conversation_id.clone()));
        self.run_turn(conversation_id, sender, raw_text, quoted, attachments, &sink)
            .await
    }

    async fn run_turn(
        &self,
        conversation_id: &ConversationId,
        sender: &SenderIdentity,
        raw_text: &str,
        quoted: Option<&QuotedContext>,
        attachments: &[LocalAttachment],
        sink: &dyn FragmentSink,
    ) -> TurnOutcome {
        let mut attachments = attachments.to_vec();
        let mut annotation = None;
        if let Some(quoted) = quoted {
            match apply_quote(quoted, &mut attachments) {
                Ok(note) => annotation = note,
                Err(reply) => {
                    tracing::info!(%conversation_id, kind = ?quoted.kind, "quoted content rejected");
                    sink.emit(OutputFragment::error(reply)).await;
                    return TurnOutcome::Rejected;
                }
            }
        }

        let turn = self.turn_locks.acquire(conversation_id).await;
        let result = self
            .drive_turn(conversation_id, sender, raw_text, annotation, &attachments, sink)
            .await;
        self.turn_locks.release(conversation_id, turn).await;
        match result {
            Ok(state) => TurnOutcome::Finished(state),
            Err(err) => {
                tracing::error!(%conversation_id, error = ?err, "turn failed");
                let fragment = match &err {
                    RunError::Backend(e) if e.is_transient() => {
                        OutputFragment::text(err.user_message())
                    }
                    RunError::DeadlineExceeded { .. } => OutputFragment::text(err.user_message()),
                    _ => OutputFragment::error(GENERIC_APOLOGY),
                };
                sink.emit(fragment).await;
                TurnOutcome::Failed
            }
        }
    }

    async fn drive_turn(
        &self,
        conversation_id: &ConversationId,
        sender: &SenderIdentity,
        raw_text: &str,
        annotation: Option<String>,
        attachments: &[LocalAttachment],
        sink: &dyn FragmentSink,
    ) -> Result<RunState, RunError> {
        let session_id = self.sessions.resolve_or_create(conversation_id).await?;

        let assigned = self.sessions.preset_for(conversation_id).await;
        let preset = self.presets.resolve(assigned.as_deref());
        let mut content = preset.render(raw_text, sender);
        if let Some(note) = annotation {
            content.push_str(&note);
        }
        // The assistant's default instructions already are the default preset
        let instructions = assigned
            .as_ref()
            .filter(|_| preset.name != self.presets.default_name())
            .map(|_| preset.system_prompt.as_str())
            .filter(|prompt| !prompt.is_empty());

        let mut handle = self
            .driver
            .start_run(&session_id, &content, attachments, instructions)
            .await?;
        self.driver.drive(&mut handle, conversation_id, sink).await
    }
}

/// One async mutex per conversation, created on first use and dropped
/// again once no turn holds or waits for it.
#[derive(Default)]
pub struct ConversationLocks {
    locks: Mutex<HashMap<ConversationId, Arc<Mutex<()>>>>,
}

impl ConversationLocks {
    pub async fn acquire(&self, conversation_id: &ConversationId) -> OwnedMutexGuard<()> {
        let lock = {
            let mut locks = self.locks.lock().await;
            locks
                .entry(conversation_id.clone())
                .or_insert_with(|| Arc::new(Mutex::new(())))
                .clone()
        };
        lock.lock_owned().await
    }

    /// Unlock and prune the entry when the map holds the only reference.
    /// Waiters clone the `Arc` under the map lock, so a count of one means
    /// nobody else can reach this mutex.
    pub async fn release(&self, conversation_id: &ConversationId, guard: OwnedMutexGuard<()>) {
        drop(guard);
        let mut locks = self.locks.lock().await;
        if locks
            .get(conversation_id)
            .is_some_and(|lock| Arc::strong_count(lock) == 1)
        {
            locks.remove(conversation_id);
        }
    }

    pub async fn len(&self) -> usize {
        self.locks.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.locks.lock().await.is_empty()
    }
}

/// Fold quoted context into the turn: text-like kinds become an annotation
/// appended to the content, media kinds become attachments. `Err` carries the
/// reply for kinds that end the turn.
fn apply_quote(
    quoted: &QuotedContext,
    attachments: &mut Vec<LocalAttachment>,
) -> Result<Option<String>, &'static str> {
    match quoted.kind {
        QuotedKind::Text => Ok(Some(format!("\n(quoted text:\n{})", quoted.content))),
        QuotedKind::Link => Ok(Some(format!("\n(quoted link:\n{})", quoted.content))),
        QuotedKind::Image => {
            attachments.push(LocalAttachment::image(&quoted.content));
            Ok(None)
        }
        QuotedKind::File | QuotedKind::Audio => {
            attachments.push(LocalAttachment::document(&quoted.content));
            Ok(None)
        }
        QuotedKind::Video => {
            attachments.push(LocalAttachment::video(&quoted.content));
            Ok(Some(
                "\n(quoted video attached as a file; use code interpreter to inspect it)".to_string(),
            ))
        }
        QuotedKind::Error => Err(QUOTE_ERROR),
        QuotedKind::Unsupported => Err(UNSUPPORTED_QUOTE),
    }
}
