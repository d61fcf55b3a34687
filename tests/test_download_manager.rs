mod common;

use common::{MockTransport, Reply};
use s2pipe::core::RetryPolicy;
use s2pipe::io::{CancelFlag, DownloadManager};
use s2pipe::{DownloadTask, S2Error};
use std::fs;
use std::path::Path;
use std::sync::Arc;

fn task(product: &str, band: &str, dest: &Path) -> DownloadTask {
    DownloadTask::new(product, band, format!("https://dl.test/{}/{}", product, band), dest)
}

fn manager(transport: &Arc<MockTransport>) -> DownloadManager {
    DownloadManager::new(transport.clone(), RetryPolicy::immediate(4))
}

#[test]
fn test_downloads_and_verifies_files() {
    common::init_logging();
    let dir = tempfile::tempdir().unwrap();
    let transport = Arc::new(
        MockTransport::new()
            .on_exact("https://dl.test/p1/B04", vec![Reply::Bytes(b"band four".to_vec())])
            .on_exact("https://dl.test/p1/B08", vec![Reply::Bytes(b"band eight".to_vec())]),
    );

    let b04 = dir.path().join("p1").join("B04.jp2");
    let b08 = dir.path().join("p1").join("B08.jp2");
    let tasks = vec![
        task("p1", "B04", &b04)
            .with_expected_size(9)
            .with_expected_md5(format!("{:x}", md5::compute(b"band four"))),
        task("p1", "B08", &b08).with_expected_size(10),
    ];

    let summary = manager(&transport).download(tasks, 2).unwrap();
    assert_eq!(summary.succeeded, 2);
    assert_eq!(summary.failed, 0);
    assert_eq!(fs::read(&b04).unwrap(), b"band four");
    assert_eq!(fs::read(&b08).unwrap(), b"band eight");
    assert!(!dir.path().join("p1").join("B04.jp2.part").exists());
}

#[test]
fn test_rerun_skips_existing_files() {
    let dir = tempfile::tempdir().unwrap();
    let transport = Arc::new(MockTransport::new());
    let mut tasks = Vec::new();
    for band in ["B02", "B03", "B04"] {
        let dest = dir.path().join(format!("{}.jp2", band));
        fs::write(&dest, b"12345").unwrap();
        tasks.push(task("p1", band, &dest).with_expected_size(5));
    }

    let summary = manager(&transport).download(tasks.clone(), 3).unwrap();
    assert_eq!(summary.skipped, tasks.len());
    assert_eq!(summary.succeeded, 0);
    assert!(transport.calls().is_empty());
}

#[test]
fn test_size_mismatch_triggers_redownload() {
    let dir = tempfile::tempdir().unwrap();
    let dest = dir.path().join("B04.jp2");
    fs::write(&dest, b"trunc").unwrap();
    let transport = Arc::new(MockTransport::new().on_exact("https://dl.test/p1/B04", vec![Reply::Bytes(b"complete".to_vec())]));

    let summary = manager(&transport)
        .download(vec![task("p1", "B04", &dest).with_expected_size(8)], 1)
        .unwrap();
    assert_eq!(summary.succeeded, 1);
    assert_eq!(fs::read(&dest).unwrap(), b"complete");
}

#[test]
fn test_transient_failure_is_retried() {
    let dir = tempfile::tempdir().unwrap();
    let dest = dir.path().join("B04.jp2");
    let transport = Arc::new(MockTransport::new().on_exact(
        "https://dl.test/p1/B04",
        vec![Reply::Status(503), Reply::Bytes(b"ok".to_vec())],
    ));

    let summary = manager(&transport).download(vec![task("p1", "B04", &dest)], 1).unwrap();
    assert_eq!(summary.succeeded, 1);
    assert_eq!(transport.calls().len(), 2);
}

#[test]
fn test_exhausted_retries_are_recorded_and_batch_continues() {
    let dir = tempfile::tempdir().unwrap();
    let transport = Arc::new(
        MockTransport::new()
            .on_exact("https://dl.test/p1/B04", vec![Reply::Status(500)])
            .on_exact("https://dl.test/p1/B08", vec![Reply::Bytes(b"fine".to_vec())]),
    );
    let bad = dir.path().join("B04.jp2");
    let tasks = vec![task("p1", "B04", &bad), task("p1", "B08", &dir.path().join("B08.jp2"))];

    let summary = manager(&transport).download(tasks, 2).unwrap();
    assert_eq!(summary.succeeded, 1);
    assert_eq!(summary.failed, 1);
    assert_eq!(summary.failures[0].band, "B04");
    assert_eq!(transport.calls_matching("/p1/B04"), 4);
    assert!(!bad.exists());
    assert!(!dir.path().join("B04.jp2.part").exists());
}

#[test]
fn test_checksum_mismatch_fails_without_leaving_files() {
    let dir = tempfile::tempdir().unwrap();
    let dest = dir.path().join("B04.jp2");
    let transport = Arc::new(MockTransport::new().on_exact("https://dl.test/p1/B04", vec![Reply::Bytes(b"corrupt".to_vec())]));

    let summary = DownloadManager::new(transport.clone(), RetryPolicy::immediate(2))
        .download(vec![task("p1", "B04", &dest).with_expected_md5("00000000000000000000000000000000")], 1)
        .unwrap();
    assert_eq!(summary.failed, 1);
    assert!(summary.failures[0].cause.contains("checksum"));
    assert_eq!(transport.calls().len(), 2);
    assert!(!dest.exists());
}

#[test]
fn test_duplicate_pairs_collapse() {
    let dir = tempfile::tempdir().unwrap();
    let dest = dir.path().join("B04.jp2");
    let transport = Arc::new(MockTransport::new().on_exact("https://dl.test/p1/B04", vec![Reply::Bytes(b"x".to_vec())]));

    let summary = manager(&transport)
        .download(vec![task("p1", "B04", &dest), task("p1", "B04", &dest)], 2)
        .unwrap();
    assert_eq!(summary.total(), 1);
    assert_eq!(transport.calls().len(), 1);
}

#[test]
fn test_cancelled_batch_starts_nothing() {
    let dir = tempfile::tempdir().unwrap();
    let transport = Arc::new(MockTransport::new());
    let cancel = CancelFlag::new();
    cancel.cancel();

    let tasks = vec![
        task("p1", "B04", &dir.path().join("a.jp2")),
        task("p1", "B08", &dir.path().join("b.jp2")),
    ];
    let summary = manager(&transport).with_cancel_flag(cancel).download(tasks, 2).unwrap();
    assert_eq!(summary.cancelled, 2);
    assert_eq!(summary.succeeded, 0);
    assert!(transport.calls().is_empty());
}

#[test]
fn test_zero_workers_is_a_configuration_error() {
    let transport = Arc::new(MockTransport::new());
    let result = manager(&transport).download(vec![task("p1", "B04", Path::new("/tmp/never"))], 0);
    assert!(matches!(result, Err(S2Error::Configuration(_))));
    assert!(transport.calls().is_empty());
}
