use super::*;
use time::Duration;
use time::macros::datetime;

async fn make_history() -> RunHistory {
    let pool = SqlitePool::connect("sqlite::memory:").await.unwrap();
    let history = RunHistory::from_pool(pool);
    history.init().await.unwrap();
    history
}

async fn finished_run(
    history: &RunHistory,
    kind: BackupKind,
    remote_root: &str,
    local_root: &str,
    started_at: OffsetDateTime,
    status: RunStatus,
) -> i64 {
    let id = history
        .record_start(kind, remote_root, Path::new(local_root), started_at)
        .await
        .unwrap();
    history
        .record_finish(
            id,
            status,
            RunCounters::default(),
            started_at + Duration::minutes(5),
        )
        .await
        .unwrap();
    id
}

#[tokio::test]
async fn record_start_inserts_running_row() {
    let history = make_history().await;
    let started = datetime!(2025-06-01 10:00:00 UTC);

    let id = history
        .record_start(BackupKind::Full, "/site", Path::new("/backups/a"), started)
        .await
        .unwrap();
    let run = history.get_run(id).await.unwrap().unwrap();

    assert_eq!(run.kind, BackupKind::Full);
    assert_eq!(run.status, RunStatus::Running);
    assert_eq!(run.started_at, started);
    assert_eq!(run.finished_at, None);
    assert_eq!(run.remote_root, "/site");
    assert_eq!(run.local_root, "/backups/a");
    assert_eq!(run.counters, RunCounters::default());
}

#[tokio::test]
async fn record_finish_sets_terminal_status_and_counters() {
    let history = make_history().await;
    let started = datetime!(2025-06-01 10:00:00 UTC);
    let id = history
        .record_start(
            BackupKind::Incremental,
            "/site",
            Path::new("/backups/b"),
            started,
        )
        .await
        .unwrap();
    let counters = RunCounters {
        files: 2,
        directories: 1,
        bytes: 300,
    };

    history
        .record_finish(
            id,
            RunStatus::Failed,
            counters,
            started + Duration::seconds(42),
        )
        .await
        .unwrap();
    let run = history.get_run(id).await.unwrap().unwrap();

    assert_eq!(run.status, RunStatus::Failed);
    assert_eq!(run.finished_at, Some(started + Duration::seconds(42)));
    assert_eq!(run.counters, counters);
}

#[tokio::test]
async fn record_finish_for_unknown_run_is_a_noop() {
    let history = make_history().await;
    history
        .record_finish(
            99,
            RunStatus::Success,
            RunCounters::default(),
            OffsetDateTime::UNIX_EPOCH,
        )
        .await
        .unwrap();
    assert!(history.get_run(99).await.unwrap().is_none());
}

#[tokio::test]
async fn latest_success_queries_filter_by_kind_status_and_root() {
    let history = make_history().await;
    let full = datetime!(2025-06-01 00:00:00 UTC);
    let incremental = datetime!(2025-06-03 00:00:00 UTC);
    let failed_full = datetime!(2025-06-04 00:00:00 UTC);
    let other_root = datetime!(2025-06-05 00:00:00 UTC);

    finished_run(&history, BackupKind::Full, "/site", "/b/1", full, RunStatus::Success).await;
    finished_run(
        &history,
        BackupKind::Incremental,
        "/site",
        "/b/2",
        incremental,
        RunStatus::Success,
    )
    .await;
    finished_run(
        &history,
        BackupKind::Full,
        "/site",
        "/b/3",
        failed_full,
        RunStatus::Failed,
    )
    .await;
    finished_run(
        &history,
        BackupKind::Full,
        "/other",
        "/b/4",
        other_root,
        RunStatus::Success,
    )
    .await;

    let snapshot = history.snapshot("/site").await.unwrap();
    assert_eq!(snapshot.last_full_success, Some(full));
    assert_eq!(snapshot.last_success, Some(incremental));
}

#[tokio::test]
async fn empty_history_has_no_baselines() {
    let history = make_history().await;
    assert_eq!(
        history.snapshot("/site").await.unwrap(),
        HistorySnapshot::default()
    );
    assert!(history.mirror_roots("/site").await.unwrap().is_empty());
}

#[tokio::test]
async fn running_rows_do_not_count_as_success() {
    let history = make_history().await;
    history
        .record_start(
            BackupKind::Full,
            "/site",
            Path::new("/b/1"),
            datetime!(2025-06-01 00:00:00 UTC),
        )
        .await
        .unwrap();

    assert_eq!(history.last_successful_start("/site").await.unwrap(), None);
}

#[tokio::test]
async fn mirror_roots_start_at_latest_successful_full() {
    let history = make_history().await;
    finished_run(
        &history,
        BackupKind::Full,
        "/site",
        "/b/old-full",
        datetime!(2025-05-01 00:00:00 UTC),
        RunStatus::Success,
    )
    .await;
    finished_run(
        &history,
        BackupKind::Full,
        "/site",
        "/b/full",
        datetime!(2025-06-01 00:00:00 UTC),
        RunStatus::Success,
    )
    .await;
    finished_run(
        &history,
        BackupKind::Incremental,
        "/site",
        "/b/inc-failed",
        datetime!(2025-06-02 00:00:00 UTC),
        RunStatus::Failed,
    )
    .await;
    finished_run(
        &history,
        BackupKind::Incremental,
        "/site",
        "/b/inc",
        datetime!(2025-06-03 00:00:00 UTC),
        RunStatus::Success,
    )
    .await;

    let roots = history.mirror_roots("/site").await.unwrap();
    assert_eq!(
        roots,
        vec![PathBuf::from("/b/inc"), PathBuf::from("/b/full")]
    );
}

#[tokio::test]
async fn list_runs_returns_newest_first() {
    let history = make_history().await;
    let first = finished_run(
        &history,
        BackupKind::Full,
        "/site",
        "/b/1",
        datetime!(2025-06-01 00:00:00 UTC),
        RunStatus::Success,
    )
    .await;
    let second = finished_run(
        &history,
        BackupKind::Incremental,
        "/site",
        "/b/2",
        datetime!(2025-06-02 00:00:00 UTC),
        RunStatus::Success,
    )
    .await;

    let runs = history.list_runs("/site", 10).await.unwrap();
    assert_eq!(
        runs.iter().map(|run| run.id).collect::<Vec<_>>(),
        vec![second, first]
    );
    assert_eq!(history.list_runs("/site", 1).await.unwrap().len(), 1);
}

#[tokio::test]
async fn open_creates_database_file() {
    let dir = tempfile::tempdir().unwrap();
    let db_path = dir.path().join("nested/history.db");

    let history = RunHistory::open(&db_path).await.unwrap();
    history
        .record_start(
            BackupKind::Full,
            "/",
            Path::new("/b"),
            OffsetDateTime::UNIX_EPOCH,
        )
        .await
        .unwrap();
    history.close().await;

    assert!(db_path.exists());
}
