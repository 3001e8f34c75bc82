// Integration tests for the inbox worker and the background monitor

mod common;

use common::{TestContext, LEGACY_EXPORT};
use nrg_datasense::db::FileSource;
use nrg_datasense::scheduler::InboxMonitor;
use nrg_datasense::workers::inbox_worker::{FAILED_DIR, PROCESSED_DIR};
use nrg_datasense::workers::InboxWorker;
use std::path::PathBuf;
use std::time::Duration;

fn inbox(ctx: &TestContext) -> PathBuf {
    let dir = ctx.dir.path().join("inbox");
    std::fs::create_dir_all(&dir).unwrap();
    dir
}

#[tokio::test]
async fn test_cycle_ingests_and_sorts_files() {
    let ctx = TestContext::new().await;
    let inbox_dir = inbox(&ctx);
    std::fs::write(inbox_dir.join("good.txt"), LEGACY_EXPORT).unwrap();
    std::fs::write(inbox_dir.join("bad.txt"), "no header here\n").unwrap();
    std::fs::write(inbox_dir.join("notes.md"), "ignored").unwrap();

    let worker = InboxWorker::new(&inbox_dir, 10, ctx.ingest_service.clone());
    let report = worker.run_cycle().await.unwrap();

    assert_eq!(report.discovered, 2);
    assert_eq!(report.ingested, 1);
    assert_eq!(report.failed, 1);
    assert_eq!(report.records_added, 3);

    assert!(inbox_dir.join(PROCESSED_DIR).join("good.txt").exists());
    assert!(inbox_dir.join(FAILED_DIR).join("bad.txt").exists());
    assert!(!inbox_dir.join("good.txt").exists());
    assert!(inbox_dir.join("notes.md").exists());

    let file = ctx.file_repo.find_by_filename("good.txt").await.unwrap().unwrap();
    assert_eq!(file.source, FileSource::LocalClient);
}

#[tokio::test]
async fn test_cycle_respects_batch_size() {
    let ctx = TestContext::new().await;
    let inbox_dir = inbox(&ctx);
    for i in 0..5 {
        std::fs::write(inbox_dir.join(format!("site_{i}.txt")), LEGACY_EXPORT).unwrap();
    }

    let worker = InboxWorker::new(&inbox_dir, 2, ctx.ingest_service.clone());

    let first = worker.run_cycle().await.unwrap();
    assert_eq!(first.discovered, 5);
    assert_eq!(first.ingested, 2);

    let second = worker.run_cycle().await.unwrap();
    assert_eq!(second.discovered, 3);
    assert_eq!(second.ingested, 2);
}

#[tokio::test]
async fn test_empty_inbox_is_not_an_error() {
    let ctx = TestContext::new().await;
    let worker = InboxWorker::new(inbox(&ctx), 10, ctx.ingest_service.clone());

    let report = worker.run_cycle().await.unwrap();
    assert_eq!(report.discovered, 0);
    assert_eq!(report.ingested, 0);
}

#[tokio::test]
async fn test_run_once_updates_status() {
    let ctx = TestContext::new().await;
    let inbox_dir = inbox(&ctx);
    std::fs::write(inbox_dir.join("site.txt"), LEGACY_EXPORT).unwrap();

    let worker = InboxWorker::new(&inbox_dir, 10, ctx.ingest_service.clone());
    let monitor = InboxMonitor::new(worker, Duration::from_secs(60), Duration::from_secs(1));

    let report = monitor.run_once().await.unwrap();
    assert_eq!(report.ingested, 1);

    let status = monitor.status();
    assert!(!status.running);
    assert_eq!(status.cycles_completed, 1);
    assert!(status.last_run_at.is_some());
    assert_eq!(status.last_report.unwrap().records_added, 3);
    assert!(status.last_error.is_none());
}

#[tokio::test]
async fn test_monitor_start_stop_lifecycle() {
    let ctx = TestContext::new().await;
    let inbox_dir = inbox(&ctx);
    std::fs::write(inbox_dir.join("site.txt"), LEGACY_EXPORT).unwrap();

    let worker = InboxWorker::new(&inbox_dir, 10, ctx.ingest_service.clone());
    let monitor = InboxMonitor::new(worker, Duration::from_secs(3600), Duration::from_secs(2));

    assert!(monitor.start());
    assert!(!monitor.start(), "second start must be a no-op");
    assert!(monitor.is_running());

    // The first cycle runs immediately
    let mut waited = Duration::ZERO;
    while monitor.status().cycles_completed == 0 && waited < Duration::from_secs(5) {
        tokio::time::sleep(Duration::from_millis(20)).await;
        waited += Duration::from_millis(20);
    }
    assert_eq!(monitor.status().cycles_completed, 1);
    assert!(inbox_dir.join(PROCESSED_DIR).join("site.txt").exists());

    // Sleeping on a one-hour interval, stop must still return promptly
    let started = std::time::Instant::now();
    assert!(monitor.stop().await);
    assert!(started.elapsed() < Duration::from_secs(2));
    assert!(!monitor.is_running());
    assert!(!monitor.stop().await);

    // And it can be started again
    assert!(monitor.start());
    assert!(monitor.stop().await);
}
