use std::path::PathBuf;

use chrono::{Duration as ChronoDuration, TimeZone, Utc};
use serde_json::json;
use sqlx::sqlite::SqliteConnectOptions;
use sqlx::{Row, SqlitePool};
use tempfile::TempDir;

use schedule_task_mcp::store::{legacy, StatusPatch, TaskStore};
use schedule_task_mcp::task::{
    HistoryEntry, HistoryStatus, RunStatus, Task, TaskStatus, MAX_HISTORY_ENTRIES,
};
use schedule_task_mcp::trigger::TriggerType;

fn db_path(dir: &TempDir) -> PathBuf {
    dir.path().join("tasks.db")
}

fn sample_task(id: &str) -> Task {
    let created = Utc.with_ymd_and_hms(2025, 6, 1, 0, 0, 0).unwrap();
    Task {
        id: id.to_string(),
        name: Some("sample".to_string()),
        trigger_type: TriggerType::Interval,
        trigger_config: json!({"seconds": 30.0}),
        agent_prompt: None,
        mcp_server: None,
        mcp_tool: None,
        mcp_arguments: None,
        enabled: true,
        status: TaskStatus::Scheduled,
        created_at: created,
        updated_at: created,
        last_run: None,
        last_status: None,
        last_message: None,
        next_run: Some(created + ChronoDuration::seconds(30)),
        history: Vec::new(),
    }
}

#[tokio::test]
async fn upsert_then_get_round_trips() {
    let dir = TempDir::new().unwrap();
    let store = TaskStore::open(&db_path(&dir)).await.unwrap();

    let mut task = sample_task("task-1-aaaaaaa");
    task.agent_prompt = Some("ping".to_string());
    task.mcp_arguments = Some(json!({"key": "value"}));
    task.push_history(HistoryEntry {
        run_at: task.created_at,
        status: HistoryStatus::Success,
        message: Some("ok".to_string()),
    });
    store.upsert(&task).await.unwrap();

    let loaded = store.get(&task.id).await.unwrap().expect("task missing");
    assert_eq!(loaded.id, task.id);
    assert_eq!(loaded.trigger_type, TriggerType::Interval);
    assert_eq!(loaded.trigger_config, task.trigger_config);
    assert_eq!(loaded.agent_prompt.as_deref(), Some("ping"));
    assert_eq!(loaded.mcp_arguments, task.mcp_arguments);
    assert_eq!(loaded.next_run, task.next_run);
    assert_eq!(loaded.history.len(), 1);
    assert_eq!(loaded.history[0].message.as_deref(), Some("ok"));
    // name never survives the store
    assert_eq!(loaded.name, None);
}

#[tokio::test]
async fn upsert_is_idempotent_and_replaces_history() {
    let dir = TempDir::new().unwrap();
    let store = TaskStore::open(&db_path(&dir)).await.unwrap();

    let mut task = sample_task("task-2-bbbbbbb");
    for i in 0..3 {
        task.push_history(HistoryEntry {
            run_at: task.created_at + ChronoDuration::seconds(i),
            status: HistoryStatus::Success,
            message: Some(format!("run {i}")),
        });
    }
    store.upsert(&task).await.unwrap();
    store.upsert(&task).await.unwrap();

    let loaded = store.get(&task.id).await.unwrap().unwrap();
    assert_eq!(loaded.history.len(), 3);
    assert_eq!(loaded.history[0].message.as_deref(), Some("run 2"));

    // replacing with a shorter sequence drops the rest
    task.history.truncate(1);
    store.upsert(&task).await.unwrap();
    let loaded = store.get(&task.id).await.unwrap().unwrap();
    assert_eq!(loaded.history.len(), 1);
}

#[tokio::test]
async fn history_bound_is_enforced_on_write() {
    let dir = TempDir::new().unwrap();
    let store = TaskStore::open(&db_path(&dir)).await.unwrap();

    let mut task = sample_task("task-3-ccccccc");
    for i in 0..20 {
        task.push_history(HistoryEntry {
            run_at: task.created_at + ChronoDuration::seconds(i),
            status: HistoryStatus::Success,
            message: None,
        });
    }
    store.upsert(&task).await.unwrap();
    let loaded = store.get(&task.id).await.unwrap().unwrap();
    assert_eq!(loaded.history.len(), MAX_HISTORY_ENTRIES);
    // newest first
    assert!(loaded
        .history
        .windows(2)
        .all(|pair| pair[0].run_at >= pair[1].run_at));
}

#[tokio::test]
async fn list_orders_by_created_at() {
    let dir = TempDir::new().unwrap();
    let store = TaskStore::open(&db_path(&dir)).await.unwrap();

    let mut newer = sample_task("task-5-eeeeeee");
    newer.created_at = newer.created_at + ChronoDuration::hours(1);
    let older = sample_task("task-4-ddddddd");
    store.upsert(&newer).await.unwrap();
    store.upsert(&older).await.unwrap();

    let tasks = store.list().await.unwrap();
    let ids: Vec<_> = tasks.iter().map(|task| task.id.as_str()).collect();
    assert_eq!(ids, ["task-4-ddddddd", "task-5-eeeeeee"]);
}

#[tokio::test]
async fn delete_cascades_history() {
    let dir = TempDir::new().unwrap();
    let path = db_path(&dir);
    let store = TaskStore::open(&path).await.unwrap();

    let mut task = sample_task("task-6-fffffff");
    task.push_history(HistoryEntry {
        run_at: task.created_at,
        status: HistoryStatus::Error,
        message: Some("boom".to_string()),
    });
    store.upsert(&task).await.unwrap();

    assert!(store.delete(&task.id).await.unwrap());
    assert!(!store.delete(&task.id).await.unwrap());
    store.close().await;

    let pool = SqlitePool::connect_with(SqliteConnectOptions::new().filename(&path))
        .await
        .unwrap();
    let orphans: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM task_history")
        .fetch_one(&pool)
        .await
        .unwrap();
    assert_eq!(orphans, 0);
}

#[tokio::test]
async fn update_status_writes_only_present_fields() {
    let dir = TempDir::new().unwrap();
    let store = TaskStore::open(&db_path(&dir)).await.unwrap();

    let mut task = sample_task("task-7-ggggggg");
    task.last_message = Some("previous".to_string());
    store.upsert(&task).await.unwrap();

    store
        .update_status(
            &task.id,
            StatusPatch {
                last_status: Some(Some(RunStatus::Running)),
                last_run: Some(Some(task.created_at + ChronoDuration::minutes(1))),
                ..Default::default()
            },
        )
        .await
        .unwrap();

    let loaded = store.get(&task.id).await.unwrap().unwrap();
    assert_eq!(loaded.last_status, Some(RunStatus::Running));
    assert_eq!(
        loaded.last_run,
        Some(task.created_at + ChronoDuration::minutes(1))
    );
    // untouched field keeps its value; updated_at moved forward
    assert_eq!(loaded.last_message.as_deref(), Some("previous"));
    assert!(loaded.updated_at > task.updated_at);

    // inner None maps to SQL NULL
    store
        .update_status(
            &task.id,
            StatusPatch {
                last_message: Some(None),
                ..Default::default()
            },
        )
        .await
        .unwrap();
    let loaded = store.get(&task.id).await.unwrap().unwrap();
    assert_eq!(loaded.last_message, None);
}

#[tokio::test]
async fn clear_history_resets_last_run_fields() {
    let dir = TempDir::new().unwrap();
    let store = TaskStore::open(&db_path(&dir)).await.unwrap();

    let mut task = sample_task("task-8-hhhhhhh");
    task.last_run = Some(task.created_at);
    task.last_status = Some(RunStatus::Success);
    task.last_message = Some("done".to_string());
    task.push_history(HistoryEntry {
        run_at: task.created_at,
        status: HistoryStatus::Success,
        message: None,
    });
    store.upsert(&task).await.unwrap();

    store.clear_history(&task.id).await.unwrap();
    let loaded = store.get(&task.id).await.unwrap().unwrap();
    assert!(loaded.history.is_empty());
    assert_eq!(loaded.last_run, None);
    assert_eq!(loaded.last_status, None);
    assert_eq!(loaded.last_message, None);
}

#[tokio::test]
async fn legacy_name_column_is_dropped_on_open() {
    let dir = TempDir::new().unwrap();
    let path = db_path(&dir);

    // fabricate the earlier schema with its name column
    let pool = SqlitePool::connect_with(
        SqliteConnectOptions::new()
            .filename(&path)
            .create_if_missing(true),
    )
    .await
    .unwrap();
    sqlx::query(
        r#"
        CREATE TABLE tasks (
            id TEXT PRIMARY KEY,
            name TEXT,
            trigger_type TEXT NOT NULL,
            trigger_config TEXT NOT NULL,
            mcp_server TEXT,
            mcp_tool TEXT,
            mcp_arguments TEXT,
            agent_prompt TEXT,
            enabled INTEGER NOT NULL DEFAULT 1,
            status TEXT NOT NULL DEFAULT 'scheduled',
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL,
            last_run TEXT,
            last_status TEXT,
            last_message TEXT,
            next_run TEXT
        )
        "#,
    )
    .execute(&pool)
    .await
    .unwrap();
    sqlx::query(
        "INSERT INTO tasks (id, name, trigger_type, trigger_config, enabled, status, \
         created_at, updated_at) VALUES (?, ?, ?, ?, 1, 'scheduled', ?, ?)",
    )
    .bind("task-9-iiiiiii")
    .bind("old name")
    .bind("interval")
    .bind(r#"{"seconds":30.0}"#)
    .bind("2025-06-01T00:00:00+00:00")
    .bind("2025-06-01T00:00:00+00:00")
    .execute(&pool)
    .await
    .unwrap();
    pool.close().await;

    let store = TaskStore::open(&path).await.unwrap();
    let loaded = store
        .get("task-9-iiiiiii")
        .await
        .unwrap()
        .expect("row should survive the rebuild");
    assert_eq!(loaded.trigger_type, TriggerType::Interval);
    store.close().await;

    let pool = SqlitePool::connect_with(SqliteConnectOptions::new().filename(&path))
        .await
        .unwrap();
    let columns = sqlx::query("PRAGMA table_info(tasks)")
        .fetch_all(&pool)
        .await
        .unwrap();
    assert!(columns
        .iter()
        .all(|row| row.get::<String, _>("name") != "name"));
}

#[tokio::test]
async fn legacy_json_file_is_imported_once() {
    let dir = TempDir::new().unwrap();
    let path = db_path(&dir);
    let legacy_path = dir.path().join("tasks.json");

    std::fs::write(
        &legacy_path,
        r#"[
            {
                "id": "task-10-jjjjjjj",
                "name": "from the old world",
                "trigger_type": "interval",
                "trigger_config": {"minutes": 5}
            },
            {"this record": "is broken"}
        ]"#,
    )
    .unwrap();

    let store = TaskStore::open(&path).await.unwrap();
    let imported = legacy::import_legacy(&store, &legacy_path).await.unwrap();
    assert_eq!(imported, 1);

    let loaded = store
        .get("task-10-jjjjjjj")
        .await
        .unwrap()
        .expect("imported task missing");
    assert_eq!(loaded.status, TaskStatus::Scheduled);
    assert!(loaded.history.is_empty());
    assert!(loaded.enabled);

    assert!(!legacy_path.exists());
    assert!(dir.path().join("tasks.json.bak").exists());
}

#[tokio::test]
async fn unparseable_legacy_file_is_left_alone() {
    let dir = TempDir::new().unwrap();
    let store = TaskStore::open(&db_path(&dir)).await.unwrap();
    let legacy_path = dir.path().join("tasks.json");
    std::fs::write(&legacy_path, "not json at all").unwrap();

    let imported = legacy::import_legacy(&store, &legacy_path).await.unwrap();
    assert_eq!(imported, 0);
    assert!(legacy_path.exists());
}
