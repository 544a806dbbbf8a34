use std::collections::HashMap;
use std::sync::Arc;

use chatrelay_provider::{AssistantBackend, BackendError};
use chatrelay_schema::ConversationId;
use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::Mutex;

#[derive(Debug, Clone, Serialize)]
pub struct ConversationSession {
    pub conversation_id: ConversationId,
    pub backend_session_id: String,
    pub active_preset_name: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Default)]
struct RegistryState {
    sessions: HashMap<ConversationId, (String, DateTime<Utc>)>,
    /// Kept apart from `sessions` so a preset survives a reset
    presets: HashMap<ConversationId, String>,
}

/// In-memory map from conversation to backend session, created on first use.
pub struct SessionRegistry {
    backend: Arc<dyn AssistantBackend>,
    state: Mutex<RegistryState>,
}

impl SessionRegistry {
    pub fn new(backend: Arc<dyn AssistantBackend>) -> Self {
        Self {
            backend,
            state: Mutex::new(RegistryState::default()),
        }
    }

    /// Seed preset assignments (e.g. from configuration).
    pub fn with_presets(self, presets: HashMap<ConversationId, String>) -> Self {
        Self {
            backend: self.backend,
            state: Mutex::new(RegistryState {
                sessions: HashMap::new(),
                presets,
            }),
        }
    }

    /// The lock is held across the remote call so one conversation never
    /// ends up with two backend sessions.
    pub async fn resolve_or_create(
        &self,
        conversation_id: &ConversationId,
    ) -> Result<String, BackendError> {
        let mut state = self.state.lock().await;
        if let Some((session_id, _)) = state.sessions.get(conversation_id) {
            return Ok(session_id.clone());
        }

        let session_id = self.backend.create_session().await?;
        tracing::info!(%conversation_id, %session_id, "backend session created");
        state
            .sessions
            .insert(conversation_id.clone(), (session_id.clone(), Utc::now()));
        Ok(session_id)
    }

    pub async fn get(&self, conversation_id: &ConversationId) -> Option<ConversationSession> {
        let state = self.state.lock().await;
        state
            .sessions
            .get(conversation_id)
            .map(|(session_id, created_at)| ConversationSession {
                conversation_id: conversation_id.clone(),
                backend_session_id: session_id.clone(),
                active_preset_name: state.presets.get(conversation_id).cloned(),
                created_at: *created_at,
            })
    }

    pub async fn set_preset(&self, conversation_id: &ConversationId, preset: impl Into<String>) {
        let preset = preset.into();
        tracing::info!(%conversation_id, %preset, "preset assigned");
        self.state
            .lock()
            .await
            .presets
            .insert(conversation_id.clone(), preset);
    }

    pub async fn clear_preset(&self, conversation_id: &ConversationId) {
        self.state.lock().await.presets.remove(conversation_id);
    }

    pub async fn preset_for(&self, conversation_id: &ConversationId) -> Option<String> {
        self.state.lock().await.presets.get(conversation_id).cloned()
    }

    /// Forget the mapping and delete the remote session. Returns whether a
    /// session existed. The local mapping is gone even if remote deletion fails.
    pub async fn reset(&self, conversation_id: &ConversationId) -> Result<bool, BackendError> {
        let removed = self.state.lock().await.sessions.remove(conversation_id);
        let Some((session_id, _)) = removed else {
            return Ok(false);
        };

        tracing::info!(%conversation_id, %session_id, "backend session reset");
        if let Err(e) = self.backend.delete_session(&session_id).await {
            tracing::warn!(%conversation_id, %session_id, error = %e, "remote session deletion failed");
            return Err(e);
        }
        Ok(true)
    }

    pub async fn len(&self) -> usize {
        self.state.lock().await.sessions.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}
