mod common;

use std::time::Duration;

use chatrelay_core::*;
use chatrelay_provider::{ContentInput, FilePurpose, RunState};
use chatrelay_schema::{ConversationId, FragmentKind, LocalAttachment};
use common::{driver, RecordingSink, ScriptedBackend, Step};

fn conv() -> ConversationId {
    ConversationId::from("wx_alice")
}

#[tokio::test]
async fn first_drain_skips_the_user_echo() {
    let scratch = tempfile::tempdir().unwrap();
    let backend = ScriptedBackend::new();
    backend.script(vec![Step::at(RunState::InProgress), Step::completed("hi there")]);
    let driver = driver(backend.clone(), scratch.path());
    let sink = RecordingSink::default();

    let mut handle = driver.start_run("thread_a", "hello", &[], None).await.unwrap();
    let state = driver.drive(&mut handle, &conv(), &sink).await.unwrap();

    assert_eq!(state, RunState::Completed);
    let fragments = sink.take();
    assert_eq!(fragments.len(), 1);
    assert_eq!(fragments[0].kind, FragmentKind::Text);
    assert_eq!(fragments[0].payload, "hi there");
    assert_eq!(backend.assistants_ensured(), 1);
}

#[tokio::test]
async fn tool_call_is_dispatched_and_submitted_once() {
    let scratch = tempfile::tempdir().unwrap();
    let backend = ScriptedBackend::new();
    backend.script(vec![
        Step::tool_call("call_1", "echo", r#"{"text":"ping"}"#),
        Step::at(RunState::InProgress),
        Step::completed("done"),
    ]);
    let driver = driver(backend.clone(), scratch.path());
    let sink = RecordingSink::default();

    let mut handle = driver.start_run("thread_a", "use echo", &[], None).await.unwrap();
    let state = driver.drive(&mut handle, &conv(), &sink).await.unwrap();

    assert_eq!(state, RunState::Completed);
    let submissions = backend.submissions();
    assert_eq!(submissions.len(), 1);
    assert_eq!(submissions[0].len(), 1);
    assert_eq!(submissions[0][0].tool_call_id, "call_1");
    assert_eq!(submissions[0][0].output, "ping");
    assert!(backend.cancels().is_empty());

    let payloads: Vec<String> = sink.take().into_iter().map(|f| f.payload).collect();
    assert_eq!(payloads, vec!["echoing...", "done"]);
}

#[tokio::test]
async fn unknown_tool_result_is_submitted_and_run_continues() {
    let scratch = tempfile::tempdir().unwrap();
    let backend = ScriptedBackend::new();
    backend.script(vec![
        Step::tool_call("call_x", "does_not_exist", "{}"),
        Step::completed("I could not use that tool"),
    ]);
    let driver = driver(backend.clone(), scratch.path());
    let sink = RecordingSink::default();

    let mut handle = driver.start_run("thread_a", "try it", &[], None).await.unwrap();
    let state = driver.drive(&mut handle, &conv(), &sink).await.unwrap();

    assert_eq!(state, RunState::Completed);
    let output = &backend.submissions()[0][0].output;
    assert!(output.contains("does_not_exist"));
    assert_eq!(output, &unknown_tool_message("does_not_exist"));
}

#[tokio::test]
async fn malformed_arguments_become_tool_output() {
    let scratch = tempfile::tempdir().unwrap();
    let backend = ScriptedBackend::new();
    backend.script(vec![
        Step::tool_call("call_1", "echo", r#"{"txt":"#),
        Step::completed("sorry"),
    ]);
    let driver = driver(backend.clone(), scratch.path());

    let mut handle = driver.start_run("thread_a", "x", &[], None).await.unwrap();
    driver
        .drive(&mut handle, &conv(), &RecordingSink::default())
        .await
        .unwrap();

    let output = &backend.submissions()[0][0].output;
    assert!(output.starts_with("tool failed: malformed arguments for echo"));
}

#[tokio::test]
async fn backend_failure_emits_one_error_and_never_cancels() {
    let scratch = tempfile::tempdir().unwrap();
    let backend = ScriptedBackend::new();
    backend.script(vec![Step::at(RunState::InProgress), Step::failed("server_error")]);
    let driver = driver(backend.clone(), scratch.path());
    let sink = RecordingSink::default();

    let mut handle = driver.start_run("thread_a", "hello", &[], None).await.unwrap();
    let state = driver.drive(&mut handle, &conv(), &sink).await.unwrap();

    assert_eq!(state, RunState::Failed);
    let fragments = sink.take();
    assert_eq!(fragments.len(), 1);
    assert_eq!(fragments[0].kind, FragmentKind::Error);
    assert!(fragments[0].payload.contains("server_error"));
    assert!(backend.cancels().is_empty());
}

#[tokio::test]
async fn expired_run_reports_its_state() {
    let scratch = tempfile::tempdir().unwrap();
    let backend = ScriptedBackend::new();
    backend.script(vec![Step::at(RunState::Expired)]);
    let driver = driver(backend.clone(), scratch.path());
    let sink = RecordingSink::default();

    let mut handle = driver.start_run("thread_a", "hello", &[], None).await.unwrap();
    let state = driver.drive(&mut handle, &conv(), &sink).await.unwrap();

    assert_eq!(state, RunState::Expired);
    let fragments = sink.take();
    assert_eq!(fragments.len(), 1);
    assert!(fragments[0].payload.contains("expired"));
}

#[tokio::test]
async fn error_while_in_requires_action_cancels_exactly_once() {
    let scratch = tempfile::tempdir().unwrap();
    let backend = ScriptedBackend::new();
    // submit_tool_outputs fails after the tool ran
    backend.script(vec![Step::tool_call("call_1", "echo", r#"{"text":"a"}"#), Step::error(400)]);
    let driver = driver(backend.clone(), scratch.path());

    let mut handle = driver.start_run("thread_a", "x", &[], None).await.unwrap();
    let run_id = handle.run.id.clone();
    let err = driver
        .drive(&mut handle, &conv(), &RecordingSink::default())
        .await
        .unwrap_err();

    assert!(matches!(err, RunError::Backend(_)));
    assert_eq!(backend.cancels(), vec![run_id]);
}

#[tokio::test]
async fn poll_error_outside_requires_action_does_not_cancel() {
    let scratch = tempfile::tempdir().unwrap();
    let backend = ScriptedBackend::new();
    backend.script(vec![Step::at(RunState::InProgress), Step::error(500)]);
    let driver = driver(backend.clone(), scratch.path());

    let mut handle = driver.start_run("thread_a", "x", &[], None).await.unwrap();
    let err = driver
        .drive(&mut handle, &conv(), &RecordingSink::default())
        .await
        .unwrap_err();

    assert!(matches!(err, RunError::Backend(ref e) if e.is_transient()));
    assert!(backend.cancels().is_empty());
}

#[tokio::test(start_paused = true)]
async fn deadline_cancels_the_stuck_run() {
    let scratch = tempfile::tempdir().unwrap();
    let backend = ScriptedBackend::new();
    backend.script(vec![Step::at(RunState::InProgress)]);
    let driver = driver(backend.clone(), scratch.path());

    let mut handle = driver.start_run("thread_a", "x", &[], None).await.unwrap();
    let err = driver
        .drive(&mut handle, &conv(), &RecordingSink::default())
        .await
        .unwrap_err();

    match err {
        RunError::DeadlineExceeded { elapsed } => assert!(elapsed >= Duration::from_secs(5)),
        other => panic!("expected deadline, got {other:?}"),
    }
    assert_eq!(backend.cancels().len(), 1);
}

#[tokio::test]
async fn drain_with_unchanged_cursor_yields_nothing_new() {
    let scratch = tempfile::tempdir().unwrap();
    let backend = ScriptedBackend::new();
    backend.script(vec![Step::completed("only once")]);
    let driver = driver(backend.clone(), scratch.path());
    let sink = RecordingSink::default();

    let mut handle = driver.start_run("thread_a", "x", &[], None).await.unwrap();
    driver.drive(&mut handle, &conv(), &sink).await.unwrap();
    assert_eq!(sink.take().len(), 1);

    assert_eq!(driver.drain(&mut handle, &sink).await.unwrap(), 0);
    assert_eq!(driver.drain(&mut handle, &sink).await.unwrap(), 0);
    assert!(sink.take().is_empty());

    backend.push_assistant_text("thread_a", "late\n\nanswer");
    assert_eq!(driver.drain(&mut handle, &sink).await.unwrap(), 1);
    assert_eq!(sink.take()[0].payload, "late\nanswer");
}

#[tokio::test]
async fn generated_images_are_downloaded_into_scratch() {
    let scratch = tempfile::tempdir().unwrap();
    let backend = ScriptedBackend::new();
    backend.script(vec![Step::completed("here is the chart").with_image("file_chart")]);
    let driver = driver(backend.clone(), scratch.path());
    let sink = RecordingSink::default();

    let mut handle = driver.start_run("thread_a", "plot", &[], None).await.unwrap();
    driver.drive(&mut handle, &conv(), &sink).await.unwrap();

    let fragments = sink.take();
    assert_eq!(fragments.len(), 2);
    assert_eq!(fragments[1].kind, FragmentKind::Image);
    let path = std::path::PathBuf::from(&fragments[1].payload);
    assert!(path.starts_with(scratch.path()));
    assert_eq!(std::fs::read(&path).unwrap(), b"png-bytes");
}

#[tokio::test]
async fn attachments_upload_once_per_unchanged_file() {
    let scratch = tempfile::tempdir().unwrap();
    let files = tempfile::tempdir().unwrap();
    let photo = files.path().join("photo.jpg");
    let report = files.path().join("report.pdf");
    std::fs::write(&photo, b"jpg").unwrap();
    std::fs::write(&report, b"pdf").unwrap();

    let backend = ScriptedBackend::new();
    let driver = driver(backend.clone(), scratch.path());
    let attachments = vec![
        LocalAttachment::image(&photo),
        LocalAttachment::document(&report),
    ];

    driver.start_run("thread_a", "look", &attachments, None).await.unwrap();
    driver.start_run("thread_a", "again", &attachments, None).await.unwrap();

    let uploads = backend.uploads();
    assert_eq!(uploads.len(), 2);
    assert_eq!(uploads[0].1, FilePurpose::Vision);
    assert_eq!(uploads[1].1, FilePurpose::Assistants);

    let (_, message) = &backend.user_messages()[0];
    assert!(message
        .content
        .iter()
        .any(|c| matches!(c, ContentInput::ImageFile { .. })));
    assert_eq!(message.attachments.len(), 1);

    std::fs::write(&report, b"pdf, second edition").unwrap();
    driver.start_run("thread_a", "changed", &attachments, None).await.unwrap();
    assert_eq!(backend.uploads().len(), 3);
}

#[tokio::test]
async fn upload_failure_is_reported_with_path() {
    let scratch = tempfile::tempdir().unwrap();
    let files = tempfile::tempdir().unwrap();
    let report = files.path().join("report.pdf");
    std::fs::write(&report, b"pdf").unwrap();

    let backend = ScriptedBackend::new();
    backend.fail_uploads();
    let driver = driver(backend.clone(), scratch.path());

    let err = driver
        .start_run("thread_a", "x", &[LocalAttachment::document(&report)], None)
        .await
        .unwrap_err();
    assert!(matches!(err, RunError::Upload { .. }));
    assert_eq!(backend.runs_started(), 0);
}

#[tokio::test]
async fn instructions_are_forwarded_to_the_run() {
    let scratch = tempfile::tempdir().unwrap();
    let backend = ScriptedBackend::new();
    let driver = driver(backend.clone(), scratch.path());

    driver.start_run("thread_a", "x", &[], Some("Talk like a pirate.")).await.unwrap();
    driver.start_run("thread_a", "y", &[], None).await.unwrap();

    assert_eq!(
        backend.run_instructions(),
        vec![Some("Talk like a pirate.".to_string()), None]
    );
    // provisioned once per process
    assert_eq!(backend.assistants_ensured(), 1);
}
