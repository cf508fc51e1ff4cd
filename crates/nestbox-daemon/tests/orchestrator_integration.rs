#![allow(clippy::unwrap_used)] // Integration tests use unwrap for brevity
#![cfg(unix)]

//! End-to-end turns through the Orchestrator.
//!
//! Agents are small `sh` scripts run by the direct backend, and a recording
//! channel stands in for the chat transport.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use nestbox_core::Config;
use nestbox_core::config::BackendKind;
use nestbox_core::ipc::is_document;
use nestbox_core::protocol::{OUTPUT_END_MARKER, OUTPUT_START_MARKER};
use nestbox_daemon::channel::{Channel, ChannelError, ChannelEvent, ChannelRouter};
use nestbox_daemon::orchestrator::{Orchestrator, OrchestratorState, ShutdownOutcome};
use nestbox_daemon::runner::{ContainerRunner, DirectBackend, RunnerSettings};
use nestbox_daemon::storage::{ContainerConfig, Database, NewMessage, RegisteredGroup};
use tokio::sync::mpsc;

const MAIN_JID: &str = "main@s.whatsapp.net";
const OPS_JID: &str = "ops@g.us";
const IDLE: Duration = Duration::from_secs(15);

#[derive(Default)]
struct Recorder {
    sent: Mutex<Vec<(String, String)>>,
    fail_sends: AtomicBool,
}

impl Recorder {
    fn texts(&self) -> Vec<String> {
        self.sent
            .lock()
            .unwrap()
            .iter()
            .map(|(_, text)| text.clone())
            .collect()
    }
}

#[async_trait]
impl Channel for Recorder {
    fn name(&self) -> &str {
        "recorder"
    }

    async fn connect(&self, _events: mpsc::Sender<ChannelEvent>) -> Result<(), ChannelError> {
        Ok(())
    }

    async fn disconnect(&self) -> Result<(), ChannelError> {
        Ok(())
    }

    async fn send_message(&self, jid: &str, text: &str) -> Result<(), ChannelError> {
        if self.fail_sends.load(Ordering::SeqCst) {
            return Err(ChannelError::Transport("link down".to_string()));
        }
        self.sent
            .lock()
            .unwrap()
            .push((jid.to_string(), text.to_string()));
        Ok(())
    }

    fn is_connected(&self) -> bool {
        true
    }

    fn owns_jid(&self, _jid: &str) -> bool {
        true
    }
}

struct Harness {
    dir: tempfile::TempDir,
    db: Database,
    recorder: Arc<Recorder>,
    orchestrator: Orchestrator,
}

/// Agent that drains its input, prints one block and exits with `code`.
fn replying_agent(reply: &str, code: i32) -> String {
    format!(
        "cat >/dev/null; printf '%s\\n%s\\n%s\\n' '{OUTPUT_START_MARKER}' '{reply}' '{OUTPUT_END_MARKER}'; exit {code}"
    )
}

fn group(folder: &str, jid: &str, requires_trigger: bool) -> RegisteredGroup {
    RegisteredGroup {
        folder: folder.to_string(),
        jid: jid.to_string(),
        name: folder.to_string(),
        trigger_pattern: "@Andy".to_string(),
        requires_trigger,
        container_config: ContainerConfig::default(),
        added_at: 0,
    }
}

async fn harness(script: &str) -> Harness {
    harness_with(script, |_| {}).await
}

async fn harness_with(script: &str, tweak: impl FnOnce(&mut Config)) -> Harness {
    let dir = tempfile::TempDir::new().unwrap();
    let mut config = Config::default();
    config.paths.data_dir = dir.path().to_path_buf();
    config.execution.backend = BackendKind::Direct;
    config.execution.agent_command = vec!["sh".to_string(), "-c".to_string(), script.to_string()];
    config.execution.timeout_secs = 30;
    config.execution.terminate_grace_secs = 1;
    config.retry.base_delay_ms = 0;
    config.timing.shutdown_grace_secs = 10;
    tweak(&mut config);

    let db = Database::open(&config.paths.store_path()).await.unwrap();
    db.upsert_group(&group("main", MAIN_JID, false)).await.unwrap();
    db.upsert_group(&group("ops", OPS_JID, true)).await.unwrap();

    let backend = DirectBackend::new(config.execution.agent_command.clone()).unwrap();
    let runner = ContainerRunner::new(Arc::new(backend), RunnerSettings::from_config(&config));
    let recorder = Arc::new(Recorder::default());
    let router = ChannelRouter::new(vec![Arc::clone(&recorder) as Arc<dyn Channel>]);

    let orchestrator = Orchestrator::new(config, db.clone(), router, runner)
        .await
        .unwrap();
    orchestrator.initialize().await.unwrap();

    Harness {
        dir,
        db,
        recorder,
        orchestrator,
    }
}

async fn say(db: &Database, jid: &str, id: &str, content: &str, timestamp: i64) {
    db.insert_message(&NewMessage {
        id: id.to_string(),
        chat_jid: jid.to_string(),
        sender: "+15550100".to_string(),
        sender_name: "Ann".to_string(),
        content: content.to_string(),
        timestamp,
        is_from_me: false,
        is_bot_message: false,
    })
    .await
    .unwrap();
}

async fn eventually(what: &str, mut condition: impl FnMut() -> bool) {
    for _ in 0..200 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    panic!("timed out waiting for {what}");
}

#[tokio::test]
async fn untriggered_messages_advance_the_cursor_without_running_anything() {
    let h = harness(&replying_agent("unexpected", 0)).await;
    say(&h.db, OPS_JID, "m1", "hello", 1_000).await;
    say(&h.db, OPS_JID, "m2", "anyone around?", 2_000).await;

    assert_eq!(h.orchestrator.poll_once().await.unwrap(), 0);

    let ctx = h.orchestrator.context();
    assert!(!ctx.queue.has_work("ops"));
    assert_eq!(ctx.cursors.get("ops").await, 2_000);
    assert_eq!(h.db.get_cursor("ops").await.unwrap(), Some(2_000));
    assert!(h.recorder.texts().is_empty());
}

#[tokio::test]
async fn triggered_turn_delivers_the_reply_and_keeps_the_cursor() {
    let h = harness(&replying_agent("on it", 0)).await;
    say(&h.db, OPS_JID, "m1", "@Andy status please", 1_000).await;

    assert_eq!(h.orchestrator.poll_once().await.unwrap(), 1);
    assert!(h.orchestrator.wait_idle(IDLE).await);

    assert_eq!(h.recorder.texts(), vec!["on it".to_string()]);
    assert_eq!(h.recorder.sent.lock().unwrap()[0].0, OPS_JID);
    assert_eq!(h.orchestrator.context().cursors.get("ops").await, 1_000);
    assert!(h.dir.path().join("groups").join("ops").is_dir());
}

#[tokio::test]
async fn crash_before_any_output_rolls_the_cursor_back() {
    let h = harness("cat >/dev/null; echo boom >&2; exit 3").await;
    say(&h.db, MAIN_JID, "m1", "do the thing", 1_000).await;

    assert_eq!(h.orchestrator.poll_once().await.unwrap(), 1);
    assert!(h.orchestrator.wait_idle(IDLE).await);

    let ctx = h.orchestrator.context();
    assert_eq!(ctx.cursors.get("main").await, 0);
    assert_eq!(h.db.get_cursor("main").await.unwrap(), Some(0));
    assert_eq!(ctx.retry.attempts("main"), 1);
    assert!(h.recorder.texts().is_empty());
}

#[tokio::test]
async fn crash_after_delivering_output_keeps_the_cursor() {
    let h = harness(&replying_agent("partial answer", 3)).await;
    say(&h.db, MAIN_JID, "m1", "do the thing", 1_000).await;

    h.orchestrator.poll_once().await.unwrap();
    assert!(h.orchestrator.wait_idle(IDLE).await);

    let ctx = h.orchestrator.context();
    assert_eq!(h.recorder.texts(), vec!["partial answer".to_string()]);
    assert_eq!(ctx.cursors.get("main").await, 1_000);
    assert_eq!(ctx.retry.attempts("main"), 0);
}

#[tokio::test]
async fn lost_transport_counts_as_failure_and_rolls_back() {
    let h = harness(&replying_agent("nobody hears this", 0)).await;
    h.recorder.fail_sends.store(true, Ordering::SeqCst);
    say(&h.db, MAIN_JID, "m1", "hello", 1_000).await;

    h.orchestrator.poll_once().await.unwrap();
    assert!(h.orchestrator.wait_idle(IDLE).await);

    assert_eq!(h.orchestrator.context().cursors.get("main").await, 0);
}

#[tokio::test]
async fn recovery_picks_up_messages_left_from_a_previous_run() {
    let h = harness(&replying_agent("caught up", 0)).await;
    say(&h.db, MAIN_JID, "m1", "are you there?", 1_000).await;

    assert_eq!(h.orchestrator.recover().await.unwrap(), 1);
    assert!(h.orchestrator.wait_idle(IDLE).await);
    assert_eq!(h.recorder.texts(), vec!["caught up".to_string()]);
}

#[tokio::test]
async fn follow_up_messages_are_piped_into_the_live_execution() {
    let script = format!(
        "cat >/dev/null; printf '%s\\n%s\\n%s\\n' '{OUTPUT_START_MARKER}' 'first' '{OUTPUT_END_MARKER}'; \
         while [ ! -f \"$NESTBOX_INPUT_DIR/_close\" ]; do sleep 0.1; done"
    );
    let h = harness(&script).await;
    say(&h.db, MAIN_JID, "m1", "start", 1_000).await;

    h.orchestrator.poll_once().await.unwrap();
    let recorder = Arc::clone(&h.recorder);
    eventually("first block", || !recorder.texts().is_empty()).await;

    say(&h.db, MAIN_JID, "m2", "and another thing", 2_000).await;
    assert_eq!(h.orchestrator.poll_once().await.unwrap(), 0);

    let ctx = h.orchestrator.context();
    assert_eq!(ctx.cursors.get("main").await, 2_000);
    let piped: Vec<_> = std::fs::read_dir(ctx.layout.input_dir("main"))
        .unwrap()
        .map(|entry| entry.unwrap().path())
        .filter(|path| is_document(path))
        .collect();
    assert_eq!(piped.len(), 1);
    let body = std::fs::read_to_string(&piped[0]).unwrap();
    assert!(body.contains("and another thing"));

    // Shutdown asks the live execution to close and waits for it.
    let (_signals_tx, mut signals) = mpsc::channel(1);
    let outcome = h.orchestrator.shutdown(&mut signals).await;
    assert_eq!(outcome, ShutdownOutcome::Graceful);
    assert_eq!(h.orchestrator.state(), OrchestratorState::Stopped);
    assert!(ctx.handles.is_empty());
}

/// Agent that prints `reply` and then waits for the close marker.
fn lingering_agent(reply: &str, after_close: &str) -> String {
    format!(
        "cat >/dev/null; printf '%s\\n%s\\n%s\\n' '{OUTPUT_START_MARKER}' '{reply}' '{OUTPUT_END_MARKER}'; \
         while [ ! -f \"$NESTBOX_INPUT_DIR/_close\" ]; do sleep 0.1; done; {after_close}"
    )
}

#[tokio::test]
async fn message_after_the_close_marker_gets_its_own_turn() {
    let h = harness_with(&lingering_agent("noted", "sleep 2"), |config| {
        config.execution.idle_timeout_secs = 1;
    })
    .await;
    say(&h.db, MAIN_JID, "m1", "start", 1_000).await;
    h.orchestrator.poll_once().await.unwrap();

    let ctx = Arc::clone(h.orchestrator.context());
    let layout = ctx.layout.clone();
    eventually("close marker", || layout.has_close_marker("main")).await;
    assert!(!ctx.handles.accepts_continuation("main"));

    // The run is winding down, so this one must not be piped.
    say(&h.db, MAIN_JID, "m2", "one more thing", 2_000).await;
    assert_eq!(h.orchestrator.poll_once().await.unwrap(), 1);
    assert!(h.orchestrator.wait_idle(IDLE).await);

    assert_eq!(h.recorder.texts(), vec!["noted".to_string(), "noted".to_string()]);
    assert_eq!(ctx.cursors.get("main").await, 2_000);
}

#[tokio::test]
async fn unread_follow_ups_move_the_cursor_back_for_a_fresh_turn() {
    let h = harness(&lingering_agent("working", "exit 0")).await;
    say(&h.db, MAIN_JID, "m1", "start", 1_000).await;
    h.orchestrator.poll_once().await.unwrap();
    let recorder = Arc::clone(&h.recorder);
    eventually("first block", || recorder.texts().len() == 1).await;

    say(&h.db, MAIN_JID, "m2", "did you see this?", 2_000).await;
    assert_eq!(h.orchestrator.poll_once().await.unwrap(), 0);

    // The agent leaves without taking the piped message in.
    let ctx = Arc::clone(h.orchestrator.context());
    ctx.layout.write_close_marker("main").unwrap();
    assert!(h.orchestrator.wait_idle(IDLE).await);

    assert_eq!(ctx.cursors.get("main").await, 1_999);
    assert_eq!(h.db.get_cursor("main").await.unwrap(), Some(1_999));
    assert_eq!(ctx.layout.oldest_unread_continuation("main").unwrap(), None);

    assert_eq!(h.orchestrator.poll_once().await.unwrap(), 1);
    eventually("second block", || recorder.texts().len() == 2).await;
    ctx.layout.write_close_marker("main").unwrap();
    assert!(h.orchestrator.wait_idle(IDLE).await);
    assert_eq!(ctx.cursors.get("main").await, 2_000);
}

#[tokio::test]
async fn deadline_without_output_is_a_timeout_and_rolls_back() {
    let h = harness_with("cat >/dev/null; exec sleep 30", |config| {
        config.execution.timeout_secs = 1;
    })
    .await;
    say(&h.db, MAIN_JID, "m1", "take your time", 1_000).await;

    assert_eq!(h.orchestrator.poll_once().await.unwrap(), 1);
    assert!(h.orchestrator.wait_idle(IDLE).await);

    let ctx = h.orchestrator.context();
    assert_eq!(ctx.cursors.get("main").await, 0);
    assert_eq!(h.db.get_cursor("main").await.unwrap(), Some(0));
    assert_eq!(ctx.retry.attempts("main"), 1);
    assert!(h.recorder.texts().is_empty());
}

#[tokio::test]
async fn second_signal_forces_shutdown() {
    let script = format!(
        "cat >/dev/null; printf '%s\\n%s\\n%s\\n' '{OUTPUT_START_MARKER}' 'busy' '{OUTPUT_END_MARKER}'; exec sleep 60"
    );
    let h = harness(&script).await;
    say(&h.db, MAIN_JID, "m1", "long job", 1_000).await;
    h.orchestrator.poll_once().await.unwrap();
    let recorder = Arc::clone(&h.recorder);
    eventually("first block", || !recorder.texts().is_empty()).await;

    let (signals_tx, mut signals) = mpsc::channel(1);
    signals_tx.send(()).await.unwrap();
    let outcome = h.orchestrator.shutdown(&mut signals).await;

    assert_eq!(outcome, ShutdownOutcome::Forced);
    assert_eq!(h.orchestrator.state(), OrchestratorState::Stopped);
}
