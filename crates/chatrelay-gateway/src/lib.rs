use std::sync::Arc;

use chatrelay_core::{AdminCommand, AdminConfig, TurnOrchestrator, TurnOutcome};
use chatrelay_provider::MediaBackend;
use chatrelay_schema::{InboundEvent, OutputFragment, ReplyTarget};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

pub mod admin;
pub mod filter;

pub use filter::{strip_mentions, Admission, InboundFilter};

pub const VOICE_ERROR: &str = "Sorry, the voice message could not be transcribed.";

/// What the gateway did with one inbound event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    Ignored,
    Command(AdminCommand),
    Turn(TurnOutcome),
}

pub struct Gateway {
    orchestrator: Arc<TurnOrchestrator>,
    filter: InboundFilter,
    admin: AdminConfig,
    transcriber: Option<Arc<dyn MediaBackend>>,
}

impl Gateway {
    pub fn new(orchestrator: Arc<TurnOrchestrator>, filter: InboundFilter, admin: AdminConfig) -> Self {
        Self {
            orchestrator,
            filter,
            admin,
            transcriber: None,
        }
    }

    /// Enables voice messages; without a transcriber they are ignored.
    pub fn with_transcriber(mut self, transcriber: Arc<dyn MediaBackend>) -> Self {
        self.transcriber = Some(transcriber);
        self
    }

    pub fn orchestrator(&self) -> &Arc<TurnOrchestrator> {
        &self.orchestrator
    }

    pub async fn handle(&self, mut event: InboundEvent) -> Disposition {
        let Some(admission) = self.filter.accept(&event) else {
            tracing::debug!(
                trace_id = %event.trace_id,
                conversation_id = %event.conversation_id,
                "inbound event ignored"
            );
            return Disposition::Ignored;
        };
        let text = match admission {
            Admission::Text(text) => text,
            Admission::Voice(audio) => {
                let Some(transcriber) = &self.transcriber else {
                    tracing::warn!(conversation_id = %event.conversation_id, "voice message ignored: no transcriber");
                    return Disposition::Ignored;
                };
                match transcriber.transcribe(&audio).await {
                    Ok(text) if !text.trim().is_empty() => {
                        tracing::info!(
                            conversation_id = %event.conversation_id,
                            chars = text.chars().count(),
                            "voice message transcribed"
                        );
                        text.trim().to_string()
                    }
                    Ok(_) => return Disposition::Ignored,
                    Err(e) => {
                        tracing::error!(
                            conversation_id = %event.conversation_id,
                            audio = %audio.display(),
                            error = %e,
                            "voice transcription failed"
                        );
                        self.orchestrator
                            .emitter()
                            .send(&ReplyTarget::for_inbound(&event), &OutputFragment::error(VOICE_ERROR))
                            .await;
                        return Disposition::Turn(TurnOutcome::Failed);
                    }
                }
            }
        };

        if self.admin.is_admin(&event.sender.handle) {
            if let Some((command, argument)) = self.admin.match_command(&text) {
                tracing::info!(
                    conversation_id = %event.conversation_id,
                    sender = %event.sender.handle,
                    ?command,
                    "admin command"
                );
                let reply = admin::run_command(
                    &self.orchestrator,
                    &self.admin,
                    self.filter.bot(),
                    &event.conversation_id,
                    command,
                    argument,
                )
                .await;
                self.orchestrator
                    .emitter()
                    .send(&ReplyTarget::for_inbound(&event), &OutputFragment::text(reply))
                    .await;
                return Disposition::Command(command);
            }
        }

        event.text = text;
        Disposition::Turn(self.orchestrator.handle_event(&event).await)
    }
}

/// Handles events one at a time: each turn runs to completion before the
/// next event is read.
pub fn spawn_worker(gateway: Arc<Gateway>, mut rx: mpsc::Receiver<InboundEvent>) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(event) = rx.recv().await {
            let trace_id = event.trace_id;
            let disposition = gateway.handle(event).await;
            tracing::debug!(%trace_id, ?disposition, "inbound event handled");
        }
        tracing::info!("inbound channel closed, worker stopping");
    })
}
