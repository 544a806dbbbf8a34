mod common;

use std::collections::HashMap;
use std::sync::Arc;

use chatrelay_core::SessionRegistry;
use chatrelay_schema::ConversationId;
use common::ScriptedBackend;

#[tokio::test]
async fn creates_once_per_conversation() {
    let backend = ScriptedBackend::new();
    let registry = SessionRegistry::new(backend.clone());
    let alice = ConversationId::from("wx_alice");
    let room = ConversationId::from("room@chatroom");

    let first = registry.resolve_or_create(&alice).await.unwrap();
    let again = registry.resolve_or_create(&alice).await.unwrap();
    let other = registry.resolve_or_create(&room).await.unwrap();

    assert_eq!(first, again);
    assert_ne!(first, other);
    assert_eq!(backend.sessions_created().len(), 2);
    assert_eq!(registry.len().await, 2);
}

#[tokio::test]
async fn concurrent_first_turns_share_one_session() {
    let backend = ScriptedBackend::new();
    let registry = Arc::new(SessionRegistry::new(backend.clone()));
    let alice = ConversationId::from("wx_alice");

    let (a, b) = tokio::join!(
        registry.resolve_or_create(&alice),
        registry.resolve_or_create(&alice)
    );
    assert_eq!(a.unwrap(), b.unwrap());
    assert_eq!(backend.sessions_created().len(), 1);
}

#[tokio::test]
async fn failed_creation_is_not_cached() {
    let backend = ScriptedBackend::new();
    backend.fail_next_session_creates(1);
    let registry = SessionRegistry::new(backend.clone());
    let alice = ConversationId::from("wx_alice");

    assert!(registry.resolve_or_create(&alice).await.is_err());
    assert!(registry.get(&alice).await.is_none());
    assert!(registry.is_empty().await);

    let session = registry.resolve_or_create(&alice).await.unwrap();
    assert_eq!(backend.sessions_created(), vec![session]);
}

#[tokio::test]
async fn reset_deletes_remote_and_next_turn_gets_a_new_session() {
    let backend = ScriptedBackend::new();
    let registry = SessionRegistry::new(backend.clone());
    let alice = ConversationId::from("wx_alice");

    let old = registry.resolve_or_create(&alice).await.unwrap();
    assert!(registry.reset(&alice).await.unwrap());
    assert_eq!(backend.sessions_deleted(), vec![old.clone()]);

    let fresh = registry.resolve_or_create(&alice).await.unwrap();
    assert_ne!(old, fresh);
    assert!(!registry.reset(&ConversationId::from("nobody")).await.unwrap());
}

#[tokio::test]
async fn preset_assignment_survives_reset() {
    let backend = ScriptedBackend::new();
    let alice = ConversationId::from("wx_alice");
    let registry = SessionRegistry::new(backend.clone())
        .with_presets(HashMap::from([(alice.clone(), "pirate".to_string())]));

    assert_eq!(registry.preset_for(&alice).await.as_deref(), Some("pirate"));
    registry.resolve_or_create(&alice).await.unwrap();
    registry.reset(&alice).await.unwrap();
    assert_eq!(registry.preset_for(&alice).await.as_deref(), Some("pirate"));

    registry.set_preset(&alice, "coder").await;
    let session = registry.resolve_or_create(&alice).await.unwrap();
    let snapshot = registry.get(&alice).await.unwrap();
    assert_eq!(snapshot.backend_session_id, session);
    assert_eq!(snapshot.active_preset_name.as_deref(), Some("coder"));

    registry.clear_preset(&alice).await;
    assert!(registry.preset_for(&alice).await.is_none());
    // the backend session is untouched by preset changes
    assert_eq!(backend.sessions_deleted().len(), 1);
}
