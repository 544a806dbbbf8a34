//! Outbound side: the transport seam and the shared reply emitter.
//!
//! The transport connection is shared by the turn worker and the status
//! monitor, so every write goes through one async mutex.

use std::sync::Arc;

use async_trait::async_trait;
use chatrelay_schema::{DeliveryStatus, OutputFragment, ReplyTarget};
use tokio::sync::Mutex;

/// A messaging transport able to deliver one fragment at a time.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn send(&self, target: &ReplyTarget, fragment: &OutputFragment) -> DeliveryStatus;
}

/// Receives fragments as a run produces them.
#[async_trait]
pub trait FragmentSink: Send + Sync {
    async fn emit(&self, fragment: OutputFragment) -> DeliveryStatus;
}

#[derive(Clone)]
pub struct ReplyEmitter {
    transport: Arc<Mutex<Box<dyn Transport>>>,
}

impl ReplyEmitter {
    pub fn new(transport: impl Transport + 'static) -> Self {
        Self {
            transport: Arc::new(Mutex::new(Box::new(transport))),
        }
    }

    pub async fn send(&self, target: &ReplyTarget, fragment: &OutputFragment) -> DeliveryStatus {
        let status = {
            let transport = self.transport.lock().await;
            transport.send(target, fragment).await
        };
        if !status.is_delivered() {
            tracing::warn!(
                conversation_id = %target.conversation_id,
                kind = %fragment.kind,
                status = status.0,
                "fragment delivery failed"
            );
        }
        status
    }

    /// Sink bound to one reply target, handed to the run driver for a turn.
    pub fn sink_for(&self, target: ReplyTarget) -> TurnSink {
        TurnSink {
            emitter: self.clone(),
            target,
        }
    }
}

pub struct TurnSink {
    emitter: ReplyEmitter,
    target: ReplyTarget,
}

impl TurnSink {
    pub fn target(&self) -> &ReplyTarget {
        &self.target
    }
}

#[async_trait]
impl FragmentSink for TurnSink {
    async fn emit(&self, fragment: OutputFragment) -> DeliveryStatus {
        self.emitter.send(&self.target, &fragment).await
    }
}
