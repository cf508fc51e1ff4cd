#![allow(clippy::unwrap_used)] // Integration tests use unwrap for brevity

//! Integration tests for Command Bus authorization.
//!
//! Commands are dropped into group namespaces exactly as an agent would
//! publish them, then a scan applies or quarantines them.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use nestbox_core::ipc::{document_filename, write_atomic};
use nestbox_core::schedule::{ContextMode, ScheduleType};
use nestbox_daemon::channel::ChannelRouter;
use nestbox_daemon::groups::GroupRegistry;
use nestbox_daemon::ipc::{BusSettings, CommandBus, IpcLayout, QuarantineRecord};
use nestbox_daemon::storage::{ContainerConfig, Database, NewTask, RegisteredGroup};

struct Harness {
    _dir: tempfile::TempDir,
    db: Database,
    registry: Arc<GroupRegistry>,
    layout: IpcLayout,
    bus: CommandBus,
}

async fn harness() -> Harness {
    let dir = tempfile::TempDir::new().unwrap();
    let db = Database::open_in_memory().await.unwrap();
    let registry = Arc::new(GroupRegistry::load(db.clone(), "main").await.unwrap());
    registry
        .register(RegisteredGroup {
            folder: "main".to_string(),
            jid: "main@s.whatsapp.net".to_string(),
            name: "Main".to_string(),
            trigger_pattern: "@Andy".to_string(),
            requires_trigger: false,
            container_config: ContainerConfig::default(),
            added_at: 0,
        })
        .await
        .unwrap();

    let layout = IpcLayout::new(dir.path().join("ipc"));
    layout.ensure_group("main").unwrap();
    let bus = CommandBus::new(
        layout.clone(),
        db.clone(),
        Arc::clone(&registry),
        ChannelRouter::default(),
        BusSettings {
            admin_folder: "main".to_string(),
            assistant_name: "Andy".to_string(),
            groups_dir: dir.path().join("groups"),
        },
    );
    Harness {
        _dir: dir,
        db,
        registry,
        layout,
        bus,
    }
}

fn publish(layout: &IpcLayout, folder: &str, json: &str) -> PathBuf {
    let dir = layout.tasks_dir(folder);
    std::fs::create_dir_all(&dir).unwrap();
    write_atomic(&dir, &document_filename(), json.as_bytes()).unwrap()
}

async fn create_task(db: &Database, id: &str, folder: &str) {
    db.create_task(&NewTask {
        id: id.to_string(),
        group_folder: folder.to_string(),
        chat_jid: "x@g.us".to_string(),
        prompt: "report".to_string(),
        schedule_type: ScheduleType::Interval,
        schedule_value: "3600000".to_string(),
        context_mode: ContextMode::Isolated,
        next_run: i64::MAX,
    })
    .await
    .unwrap();
}

fn quarantine_record(layout: &IpcLayout, folder: &str, file: &Path) -> QuarantineRecord {
    let name = file.file_name().unwrap().to_string_lossy().into_owned();
    let meta = layout
        .errors_dir()
        .join(format!("{folder}-{name}.meta.json"));
    serde_json::from_slice(&std::fs::read(meta).unwrap()).unwrap()
}

#[tokio::test]
async fn registered_group_controls_its_own_tasks_but_cannot_impersonate_main() {
    let h = harness().await;

    publish(
        &h.layout,
        "main",
        r#"{"type":"register_group","sourceGroup":"main","name":"Ops","folder":"ops","chat_jid":"x@g.us"}"#,
    );
    let report = h.bus.scan().await.unwrap();
    assert_eq!(report.applied, 1);
    assert!(h.registry.contains("ops").await);
    assert!(h.layout.tasks_dir("ops").is_dir());

    create_task(&h.db, "task-own", "ops").await;
    publish(
        &h.layout,
        "ops",
        r#"{"type":"cancel_task","sourceGroup":"ops","task_id":"task-own"}"#,
    );
    let report = h.bus.scan().await.unwrap();
    assert_eq!(report.applied, 1);
    assert!(h.db.get_task("task-own").await.is_err());

    create_task(&h.db, "task-kept", "ops").await;
    let forged = publish(
        &h.layout,
        "ops",
        r#"{"type":"cancel_task","sourceGroup":"main","task_id":"task-kept"}"#,
    );
    let report = h.bus.scan().await.unwrap();
    assert_eq!(report.quarantined, 1);
    assert_eq!(report.applied, 0);
    assert!(h.db.get_task("task-kept").await.is_ok());
    assert!(!forged.exists());

    let record = quarantine_record(&h.layout, "ops", &forged);
    assert_eq!(record.category, "unauthorized");
    assert_eq!(record.source_group.as_deref(), Some("main"));
    assert_eq!(record.directory, "ops");
}

#[tokio::test]
async fn admin_commands_from_ordinary_groups_are_quarantined() {
    let h = harness().await;
    publish(
        &h.layout,
        "main",
        r#"{"type":"register_group","sourceGroup":"main","name":"Ops","folder":"ops","chat_jid":"x@g.us"}"#,
    );
    h.bus.scan().await.unwrap();

    let register = publish(
        &h.layout,
        "ops",
        r#"{"type":"register_group","sourceGroup":"ops","name":"Evil","folder":"evil","chat_jid":"e@g.us"}"#,
    );
    let refresh = publish(&h.layout, "ops", r#"{"type":"refresh_groups","sourceGroup":"ops"}"#);

    let report = h.bus.scan().await.unwrap();
    assert_eq!(report.quarantined, 2);
    assert!(!h.registry.contains("evil").await);
    assert!(quarantine_record(&h.layout, "ops", &register).reason.contains("register_group"));
    assert!(quarantine_record(&h.layout, "ops", &refresh).reason.contains("refresh_groups"));
}

#[tokio::test]
async fn ordinary_group_cannot_touch_foreign_tasks() {
    let h = harness().await;
    publish(
        &h.layout,
        "main",
        r#"{"type":"register_group","sourceGroup":"main","name":"Ops","folder":"ops","chat_jid":"x@g.us"}"#,
    );
    h.bus.scan().await.unwrap();
    create_task(&h.db, "task-main", "main").await;

    publish(
        &h.layout,
        "ops",
        r#"{"type":"pause_task","sourceGroup":"ops","task_id":"task-main"}"#,
    );
    let report = h.bus.scan().await.unwrap();
    assert_eq!(report.quarantined, 1);
    assert_eq!(h.db.get_task("task-main").await.unwrap().status, "active");

    publish(
        &h.layout,
        "main",
        r#"{"type":"pause_task","sourceGroup":"main","task_id":"task-main"}"#,
    );
    h.bus.scan().await.unwrap();
    assert_eq!(h.db.get_task("task-main").await.unwrap().status, "paused");
}

#[tokio::test]
async fn scheduling_for_another_group_needs_admin() {
    let h = harness().await;
    publish(
        &h.layout,
        "main",
        r#"{"type":"register_group","sourceGroup":"main","name":"Ops","folder":"ops","chat_jid":"x@g.us"}"#,
    );
    h.bus.scan().await.unwrap();

    publish(
        &h.layout,
        "ops",
        r#"{"type":"schedule_task","sourceGroup":"ops","prompt":"p","schedule_type":"interval","schedule_value":"60000","chat_jid":"main@s.whatsapp.net"}"#,
    );
    assert_eq!(h.bus.scan().await.unwrap().quarantined, 1);

    publish(
        &h.layout,
        "main",
        r#"{"type":"schedule_task","sourceGroup":"main","prompt":"p","schedule_type":"interval","schedule_value":"60000","chat_jid":"x@g.us"}"#,
    );
    assert_eq!(h.bus.scan().await.unwrap().applied, 1);

    let tasks = h.db.list_tasks(Some("ops")).await.unwrap();
    assert_eq!(tasks.len(), 1);
    assert_eq!(tasks[0].chat_jid, "x@g.us");
}

#[tokio::test]
async fn commands_are_never_processed_twice() {
    let h = harness().await;
    publish(
        &h.layout,
        "main",
        r#"{"type":"schedule_task","sourceGroup":"main","prompt":"p","schedule_type":"interval","schedule_value":"60000"}"#,
    );
    assert_eq!(h.bus.scan().await.unwrap().applied, 1);
    assert_eq!(h.bus.scan().await.unwrap().total(), 0);
    assert_eq!(h.db.list_tasks(None).await.unwrap().len(), 1);
}
