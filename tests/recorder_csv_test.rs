//! CSV persistence behaviour and the auto-recorder partial-failure policy.

use labrig::error::RigError;
use labrig::quantity::Quantity;
use labrig::recorder::{AutoRecorder, AutoRecorderState, CsvSink, Recorder};
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing_test::traced_test;

fn counting_quantity() -> Arc<Quantity> {
    let reads = Arc::new(AtomicUsize::new(0));
    Arc::new(Quantity::from_fn(&[("Count", "")], move || {
        let n = reads.fetch_add(1, Ordering::SeqCst) + 1;
        async move { Ok(vec![n as f64]) }
    }))
}

fn failing_quantity() -> Arc<Quantity> {
    Arc::new(Quantity::from_fn(&[("Dead", "V")], || async {
        anyhow::bail!("device not responding")
    }))
}

fn read_lines(path: &Path) -> Vec<String> {
    std::fs::read_to_string(path)
        .unwrap()
        .lines()
        .map(str::to_string)
        .collect()
}

#[tokio::test]
async fn test_csv_layout_and_row_order() {
    let dir = tempfile::tempdir().unwrap();
    let sink = CsvSink::create(dir.path().join("run"));
    let mut recorder = Recorder::new(vec![counting_quantity()], Box::new(sink))
        .await
        .unwrap();

    for _ in 0..3 {
        recorder.record_line().await.unwrap();
    }
    recorder.stop().await.unwrap();

    let lines = read_lines(&dir.path().join("run.csv"));
    assert_eq!(lines[0], "Time_Elapsed,Count");
    assert_eq!(lines[1], "s,");
    assert_eq!(lines.len(), 5);
    for (i, line) in lines[2..].iter().enumerate() {
        let value = line.split(',').nth(1).unwrap();
        assert_eq!(value, (i + 1).to_string());
    }

    assert!(matches!(
        recorder.record_line().await.unwrap_err(),
        RigError::RecorderClosed
    ));
}

#[tokio::test]
async fn test_metadata_preamble_precedes_headers() {
    let dir = tempfile::tempdir().unwrap();
    let sink = CsvSink::create(dir.path().join("run"))
        .with_metadata(serde_json::json!({ "operator": "jk", "sample": "S-118" }));
    let mut recorder = Recorder::new(vec![counting_quantity()], Box::new(sink))
        .await
        .unwrap();
    recorder.record_line().await.unwrap();
    recorder.stop().await.unwrap();

    let lines = read_lines(&dir.path().join("run.csv"));
    assert!(lines[0].starts_with("# "));
    let header_at = lines.iter().position(|l| l == "Time_Elapsed,Count").unwrap();
    assert!(lines[..header_at].iter().all(|l| l.starts_with("# ")));
    assert_eq!(lines.len(), header_at + 3);
}

#[tokio::test]
async fn test_existing_file_gains_suffix() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("run.csv"), "old data\n").unwrap();

    let sink = CsvSink::create(dir.path().join("run"));
    let mut recorder = Recorder::new(vec![counting_quantity()], Box::new(sink))
        .await
        .unwrap();
    recorder.record_line().await.unwrap();
    recorder.stop().await.unwrap();

    assert_eq!(
        std::fs::read_to_string(dir.path().join("run.csv")).unwrap(),
        "old data\n",
        "original file must be untouched"
    );
    let lines = read_lines(&dir.path().join("run_1.csv"));
    assert_eq!(lines[0], "Time_Elapsed,Count");
}

#[tokio::test]
async fn test_overwrite_replaces_existing_file() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("run.csv"), "old data\n").unwrap();

    let sink = CsvSink::create(dir.path().join("run")).overwrite();
    let mut recorder = Recorder::new(vec![counting_quantity()], Box::new(sink))
        .await
        .unwrap();
    recorder.record_line().await.unwrap();
    recorder.stop().await.unwrap();

    let lines = read_lines(&dir.path().join("run.csv"));
    assert_eq!(lines[0], "Time_Elapsed,Count");
    assert!(!dir.path().join("run_1.csv").exists());
}

#[tokio::test]
async fn test_append_continues_matching_file() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("run");

    let sink = CsvSink::create(path.clone());
    let mut recorder = Recorder::new(vec![counting_quantity()], Box::new(sink))
        .await
        .unwrap();
    recorder.record_line().await.unwrap();
    recorder.record_line().await.unwrap();
    recorder.stop().await.unwrap();

    let sink = CsvSink::create(path).append();
    let mut recorder = Recorder::new(vec![counting_quantity()], Box::new(sink))
        .await
        .unwrap();
    recorder.record_line().await.unwrap();
    recorder.stop().await.unwrap();

    let lines = read_lines(&dir.path().join("run.csv"));
    // One set of headers, three data rows across both recordings.
    assert_eq!(lines.len(), 5);
    assert_eq!(lines[0], "Time_Elapsed,Count");
}

#[tokio::test]
async fn test_append_with_different_columns_starts_fresh() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("run");

    let sink = CsvSink::create(path.clone());
    let mut recorder = Recorder::new(vec![counting_quantity()], Box::new(sink))
        .await
        .unwrap();
    recorder.record_line().await.unwrap();
    recorder.stop().await.unwrap();

    let other = Arc::new(Quantity::from_fn(&[("Pressure", "mbar")], || async {
        Ok(vec![1013.0])
    }));
    let sink = CsvSink::create(path).append();
    let mut recorder = Recorder::new(vec![other], Box::new(sink)).await.unwrap();
    recorder.record_line().await.unwrap();
    recorder.stop().await.unwrap();

    // Original intact, mismatched append landed in a suffixed file.
    assert_eq!(read_lines(&dir.path().join("run.csv")).len(), 3);
    let fresh = read_lines(&dir.path().join("run_1.csv"));
    assert_eq!(fresh[0], "Time_Elapsed,Pressure");
}

#[tokio::test]
#[traced_test]
async fn test_auto_recorder_logs_failed_ticks_and_keeps_running() {
    let dir = tempfile::tempdir().unwrap();
    let sink = CsvSink::create(dir.path().join("dead"));
    let recorder = Recorder::new(vec![failing_quantity()], Box::new(sink))
        .await
        .unwrap();
    let mut auto = AutoRecorder::new("dead-bench", recorder);

    auto.start(Duration::from_millis(50)).unwrap();
    tokio::time::sleep(Duration::from_millis(220)).await;
    assert_eq!(
        auto.state(),
        AutoRecorderState::Running,
        "auto-recorder must survive erroring quantities"
    );
    auto.stop().await.unwrap();

    logs_assert(|lines: &[&str]| {
        let failed_ticks = lines.iter().filter(|l| l.contains("tick failed")).count();
        if failed_ticks >= 3 {
            Ok(())
        } else {
            Err(format!("expected >= 3 failed-tick entries, saw {failed_ticks}"))
        }
    });

    let lines = read_lines(&dir.path().join("dead.csv"));
    assert_eq!(lines.len(), 2, "headers only, zero successful rows");
}
