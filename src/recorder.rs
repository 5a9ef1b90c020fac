//! Recording quantities to persistent row storage.
//!
//! A [`Recorder`] samples a fixed, ordered list of quantities into one
//! [`RecorderRow`] per call and writes it through a [`RowSink`]. The provided
//! sink is [`CsvSink`], which keeps the classic lab-book CSV layout: a name
//! header row, a unit row, then `Time_Elapsed` plus one column per quantity
//! value.
//!
//! An [`AutoRecorder`] runs the same recorder on its own background timer.
//! It is the thing you start before an overnight run: a tick that fails on
//! instrument I/O is logged and the loop keeps going, so a glitching sensor
//! costs you lines, not the whole recording.

use crate::error::{RigError, RigResult};
use crate::quantity::Quantity;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{info, warn};

/// One sampled line: wall-clock stamp, seconds since the recording started,
/// and the values of every configured quantity in list order.
#[derive(Clone, Debug)]
pub struct RecorderRow {
    /// Wall-clock time the sample event started.
    pub timestamp: DateTime<Utc>,
    /// Seconds since the recorder was created.
    pub elapsed_s: f64,
    /// Sampled values, one per configured column.
    pub values: Vec<f64>,
}

/// Column description handed to sinks and plots.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ColumnSpec {
    /// Column name (CSV header).
    pub name: String,
    /// Unit string (second CSV header row).
    pub unit: String,
}

/// Append-only row sink: the persistence collaborator.
#[async_trait]
pub trait RowSink: Send {
    /// Open the destination and write the column headers.
    async fn write_header(&mut self, columns: &[ColumnSpec]) -> RigResult<()>;

    /// Append one row.
    async fn append(&mut self, row: &RecorderRow) -> RigResult<()>;

    /// Push buffered rows to durable storage.
    async fn flush(&mut self) -> RigResult<()>;

    /// Flush and close. Further appends fail.
    async fn close(&mut self) -> RigResult<()>;
}

/// Live-plot collaborator. Offered every written row; a failure here must
/// never fail the record path, so implementations report errors in the
/// return value and the recorder just logs them.
pub trait LivePlot: Send + Sync {
    /// Take one freshly written row. Best effort.
    fn offer(&self, columns: &[ColumnSpec], row: &RecorderRow) -> anyhow::Result<()>;
}

/// CSV file sink with the original lab layout.
///
/// Collision handling: a fresh recording against an existing file gains a
/// `_1`, `_2`… suffix unless `overwrite` is set. With `append` set, an
/// existing file whose header line matches the new column layout is
/// continued in place; a mismatched header falls back to a fresh file.
pub struct CsvSink {
    path: PathBuf,
    append: bool,
    overwrite: bool,
    metadata: Option<serde_json::Value>,
    writer: Option<csv::Writer<File>>,
}

impl CsvSink {
    /// Sink writing `<path>.csv` (extension added if missing).
    pub fn create(path: impl Into<PathBuf>) -> Self {
        let mut path: PathBuf = path.into();
        if path.extension().is_none() {
            path.set_extension("csv");
        }
        Self {
            path,
            append: false,
            overwrite: false,
            metadata: None,
            writer: None,
        }
    }

    /// Continue an existing file when its columns match.
    pub fn append(mut self) -> Self {
        self.append = true;
        self
    }

    /// Replace an existing file instead of suffixing.
    pub fn overwrite(mut self) -> Self {
        self.overwrite = true;
        self
    }

    /// Run metadata written as `# `-prefixed JSON lines ahead of the column
    /// headers on fresh files (operator, sample id, rig configuration).
    /// Ignored when appending to an existing recording.
    pub fn with_metadata(mut self, metadata: serde_json::Value) -> Self {
        self.metadata = Some(metadata);
        self
    }

    /// The path rows are going to (final after `write_header`).
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn header_line(columns: &[ColumnSpec]) -> String {
        columns
            .iter()
            .map(|c| c.name.as_str())
            .collect::<Vec<_>>()
            .join(",")
    }

    fn existing_header(path: &Path) -> RigResult<Option<String>> {
        if !path.is_file() {
            return Ok(None);
        }
        let file = File::open(path)?;
        for line in BufReader::new(file).lines() {
            let line = line?;
            // Metadata preamble lines are not part of the column layout.
            if !line.starts_with("# ") {
                return Ok(Some(line.trim_end().to_string()));
            }
        }
        Ok(Some(String::new()))
    }

    fn suffixed_path(&self) -> PathBuf {
        let stem = self
            .path
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_default();
        let mut n = 1;
        loop {
            let candidate = self.path.with_file_name(format!("{stem}_{n}.csv"));
            if !candidate.is_file() {
                return candidate;
            }
            n += 1;
        }
    }
}

#[async_trait]
impl RowSink for CsvSink {
    async fn write_header(&mut self, columns: &[ColumnSpec]) -> RigResult<()> {
        let header = Self::header_line(columns);

        if self.append {
            match Self::existing_header(&self.path)? {
                Some(existing) if existing == header => {
                    info!(path = %self.path.display(), "appending to existing recording");
                    let file = OpenOptions::new().append(true).open(&self.path)?;
                    self.writer = Some(csv::Writer::from_writer(file));
                    return Ok(());
                }
                Some(_) => {
                    warn!(path = %self.path.display(), "cannot append: columns differ, starting new file");
                }
                None => {
                    warn!(path = %self.path.display(), "cannot append: file not found, starting new file");
                }
            }
        }

        if self.path.is_file() && !self.overwrite {
            let fresh = self.suffixed_path();
            warn!(
                requested = %self.path.display(),
                using = %fresh.display(),
                "file exists, recording under suffixed name"
            );
            self.path = fresh;
        }

        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let mut file = File::create(&self.path)?;
        if let Some(metadata) = &self.metadata {
            let rendered = serde_json::to_string_pretty(metadata)
                .map_err(|e| RigError::Io(std::io::Error::other(e)))?;
            for line in rendered.lines() {
                use std::io::Write as _;
                writeln!(file, "# {line}")?;
            }
        }
        let mut writer = csv::Writer::from_writer(file);
        writer
            .write_record(columns.iter().map(|c| c.name.as_str()))
            .map_err(|e| RigError::Io(std::io::Error::other(e)))?;
        writer
            .write_record(columns.iter().map(|c| c.unit.as_str()))
            .map_err(|e| RigError::Io(std::io::Error::other(e)))?;
        self.writer = Some(writer);
        info!(path = %self.path.display(), columns = %header, "recording to new file");
        Ok(())
    }

    async fn append(&mut self, row: &RecorderRow) -> RigResult<()> {
        let writer = self.writer.as_mut().ok_or(RigError::RecorderClosed)?;
        let mut record = Vec::with_capacity(row.values.len() + 1);
        record.push(format!("{:.3}", row.elapsed_s));
        record.extend(row.values.iter().map(|v| v.to_string()));
        writer
            .write_record(&record)
            .map_err(|e| RigError::Io(std::io::Error::other(e)))?;
        Ok(())
    }

    async fn flush(&mut self) -> RigResult<()> {
        if let Some(writer) = self.writer.as_mut() {
            writer.flush()?;
        }
        Ok(())
    }

    async fn close(&mut self) -> RigResult<()> {
        if let Some(mut writer) = self.writer.take() {
            writer.flush()?;
        }
        Ok(())
    }
}

/// Samples a fixed list of quantities into rows, on demand.
pub struct Recorder {
    quantities: Vec<Arc<Quantity>>,
    columns: Vec<ColumnSpec>,
    sink: Option<Box<dyn RowSink>>,
    plot: Option<Arc<dyn LivePlot>>,
    started: Instant,
}

impl Recorder {
    /// Capture the column layout from `quantities` and open the sink.
    pub async fn new(
        quantities: Vec<Arc<Quantity>>,
        mut sink: Box<dyn RowSink>,
    ) -> RigResult<Self> {
        let mut columns = vec![ColumnSpec {
            name: "Time_Elapsed".to_string(),
            unit: "s".to_string(),
        }];
        for quantity in &quantities {
            for (name, unit) in quantity.names().iter().zip(quantity.units()) {
                columns.push(ColumnSpec {
                    name: name.clone(),
                    unit: unit.clone(),
                });
            }
        }
        sink.write_header(&columns).await?;
        Ok(Self {
            quantities,
            columns,
            sink: Some(sink),
            plot: None,
            started: Instant::now(),
        })
    }

    /// Attach a live-plot collaborator. Best effort only.
    pub fn with_plot(mut self, plot: Arc<dyn LivePlot>) -> Self {
        self.plot = Some(plot);
        self
    }

    /// Column layout, `Time_Elapsed` first.
    pub fn columns(&self) -> &[ColumnSpec] {
        &self.columns
    }

    /// True once [`stop`](Self::stop) has run.
    pub fn is_closed(&self) -> bool {
        self.sink.is_none()
    }

    /// Read every quantity once, in list order, and append one row.
    ///
    /// A failed read fails the whole line — no partial rows — and leaves the
    /// recorder usable for the next call. After `stop` this fails with
    /// [`RigError::RecorderClosed`].
    pub async fn record_line(&mut self) -> RigResult<RecorderRow> {
        if self.sink.is_none() {
            return Err(RigError::RecorderClosed);
        }
        let timestamp = Utc::now();
        let mut values = Vec::new();
        for quantity in &self.quantities {
            values.extend(quantity.read().await?);
        }
        let row = RecorderRow {
            timestamp,
            elapsed_s: self.started.elapsed().as_secs_f64(),
            values,
        };
        let sink = self.sink.as_mut().ok_or(RigError::RecorderClosed)?;
        sink.append(&row).await?;
        sink.flush().await?;
        if let Some(plot) = &self.plot {
            if let Err(e) = plot.offer(&self.columns, &row) {
                warn!(error = %e, "live plot rejected row");
            }
        }
        Ok(row)
    }

    /// Flush and close the sink. Idempotent.
    pub async fn stop(&mut self) -> RigResult<()> {
        if let Some(mut sink) = self.sink.take() {
            sink.close().await?;
            info!("recorder stopped");
        }
        Ok(())
    }
}

/// Lifecycle state of an [`AutoRecorder`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AutoRecorderState {
    /// No tick loop running.
    Stopped,
    /// Background tick loop sampling.
    Running,
}

/// A [`Recorder`] driven by its own background timer.
pub struct AutoRecorder {
    name: String,
    recorder: Option<Recorder>,
    task: Option<(watch::Sender<bool>, JoinHandle<Recorder>)>,
}

impl AutoRecorder {
    /// Wrap a recorder for timed sampling under the given display name.
    pub fn new(name: &str, recorder: Recorder) -> Self {
        Self {
            name: name.to_string(),
            recorder: Some(recorder),
            task: None,
        }
    }

    /// Display name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Current state.
    pub fn state(&self) -> AutoRecorderState {
        if self.task.is_some() {
            AutoRecorderState::Running
        } else {
            AutoRecorderState::Stopped
        }
    }

    /// Start recording a line every `interval` on a background task.
    ///
    /// Missed ticks are skipped, never queued, so a slow sample event drifts
    /// instead of bursting. An I/O failure inside a tick is logged and the
    /// loop continues; the auto-recorder never terminates itself on
    /// instrument errors.
    pub fn start(&mut self, interval: Duration) -> RigResult<()> {
        if self.task.is_some() {
            return Err(RigError::RecorderRunning);
        }
        let mut recorder = self.recorder.take().ok_or(RigError::RecorderClosed)?;
        if recorder.is_closed() {
            self.recorder = Some(recorder);
            return Err(RigError::RecorderClosed);
        }
        let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
        let name = self.name.clone();
        info!(recorder = %name, interval = ?interval, "auto-recorder started");
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = shutdown_rx.changed() => break,
                    _ = ticker.tick() => {
                        match recorder.record_line().await {
                            Ok(_) => {}
                            Err(RigError::RecorderClosed) => break,
                            Err(e) => {
                                warn!(recorder = %name, error = %e, "tick failed, continuing");
                            }
                        }
                    }
                }
            }
            recorder
        });
        self.task = Some((shutdown_tx, handle));
        Ok(())
    }

    /// Stop the tick loop and close the underlying recorder.
    ///
    /// Joins the background task first, so no `record_line` is in flight
    /// when this returns. Idempotent; a second call is a no-op.
    pub async fn stop(&mut self) -> RigResult<()> {
        if let Some((shutdown_tx, handle)) = self.task.take() {
            let _ = shutdown_tx.send(true);
            let recorder = handle.await.map_err(|e| {
                RigError::Configuration(format!("auto-recorder task did not shut down: {e}"))
            })?;
            self.recorder = Some(recorder);
            info!(recorder = %self.name, "auto-recorder stopped");
        }
        if let Some(recorder) = self.recorder.as_mut() {
            recorder.stop().await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex as StdMutex;

    struct MemorySink {
        header: Option<Vec<ColumnSpec>>,
        rows: Arc<StdMutex<Vec<RecorderRow>>>,
        closed: bool,
    }

    impl MemorySink {
        fn new() -> (Self, Arc<StdMutex<Vec<RecorderRow>>>) {
            let rows = Arc::new(StdMutex::new(Vec::new()));
            (
                Self {
                    header: None,
                    rows: rows.clone(),
                    closed: false,
                },
                rows,
            )
        }
    }

    #[async_trait]
    impl RowSink for MemorySink {
        async fn write_header(&mut self, columns: &[ColumnSpec]) -> RigResult<()> {
            self.header = Some(columns.to_vec());
            Ok(())
        }

        async fn append(&mut self, row: &RecorderRow) -> RigResult<()> {
            if self.closed {
                return Err(RigError::RecorderClosed);
            }
            self.rows.lock().unwrap().push(row.clone());
            Ok(())
        }

        async fn flush(&mut self) -> RigResult<()> {
            Ok(())
        }

        async fn close(&mut self) -> RigResult<()> {
            self.closed = true;
            Ok(())
        }
    }

    fn counting_quantity() -> (Arc<Quantity>, Arc<AtomicUsize>) {
        let reads = Arc::new(AtomicUsize::new(0));
        let counted = reads.clone();
        let quantity = Quantity::from_fn(&[("Count", "")], move || {
            let n = counted.fetch_add(1, Ordering::SeqCst) + 1;
            async move { Ok(vec![n as f64]) }
        });
        (Arc::new(quantity), reads)
    }

    fn failing_quantity() -> Arc<Quantity> {
        Arc::new(Quantity::from_fn(&[("Dead", "V")], || async {
            anyhow::bail!("device not responding")
        }))
    }

    #[tokio::test]
    async fn test_record_line_produces_ordered_rows() {
        let (quantity, _) = counting_quantity();
        let (sink, rows) = MemorySink::new();
        let mut recorder = Recorder::new(vec![quantity], Box::new(sink)).await.unwrap();

        for _ in 0..4 {
            recorder.record_line().await.unwrap();
        }
        let rows = rows.lock().unwrap();
        assert_eq!(rows.len(), 4);
        for (i, row) in rows.iter().enumerate() {
            assert_eq!(row.values, vec![(i + 1) as f64]);
        }
    }

    #[tokio::test]
    async fn test_columns_time_elapsed_first() {
        let (quantity, _) = counting_quantity();
        let (sink, _) = MemorySink::new();
        let recorder = Recorder::new(vec![quantity], Box::new(sink)).await.unwrap();
        assert_eq!(recorder.columns()[0].name, "Time_Elapsed");
        assert_eq!(recorder.columns()[0].unit, "s");
        assert_eq!(recorder.columns()[1].name, "Count");
    }

    #[tokio::test]
    async fn test_stop_closes_and_rejects_lines() {
        let (quantity, _) = counting_quantity();
        let (sink, _) = MemorySink::new();
        let mut recorder = Recorder::new(vec![quantity], Box::new(sink)).await.unwrap();

        recorder.record_line().await.unwrap();
        recorder.stop().await.unwrap();
        recorder.stop().await.unwrap(); // idempotent
        assert!(matches!(
            recorder.record_line().await.unwrap_err(),
            RigError::RecorderClosed
        ));
    }

    #[tokio::test]
    async fn test_failed_read_fails_whole_line() {
        let (good, _) = counting_quantity();
        let (sink, rows) = MemorySink::new();
        let mut recorder = Recorder::new(vec![good, failing_quantity()], Box::new(sink))
            .await
            .unwrap();

        assert!(recorder.record_line().await.is_err());
        assert!(rows.lock().unwrap().is_empty(), "no partial rows");
    }

    struct RejectingPlot;

    impl LivePlot for RejectingPlot {
        fn offer(&self, _columns: &[ColumnSpec], _row: &RecorderRow) -> anyhow::Result<()> {
            anyhow::bail!("plot process went away")
        }
    }

    #[tokio::test]
    async fn test_plot_failure_never_fails_record_path() {
        let (quantity, _) = counting_quantity();
        let (sink, rows) = MemorySink::new();
        let mut recorder = Recorder::new(vec![quantity], Box::new(sink))
            .await
            .unwrap()
            .with_plot(Arc::new(RejectingPlot));

        recorder.record_line().await.unwrap();
        assert_eq!(rows.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_auto_recorder_samples_on_interval() {
        let (quantity, _) = counting_quantity();
        let (sink, rows) = MemorySink::new();
        let recorder = Recorder::new(vec![quantity], Box::new(sink)).await.unwrap();
        let mut auto = AutoRecorder::new("bench", recorder);

        assert_eq!(auto.state(), AutoRecorderState::Stopped);
        auto.start(Duration::from_millis(20)).unwrap();
        assert_eq!(auto.state(), AutoRecorderState::Running);
        assert!(matches!(
            auto.start(Duration::from_millis(20)).unwrap_err(),
            RigError::RecorderRunning
        ));

        tokio::time::sleep(Duration::from_millis(110)).await;
        auto.stop().await.unwrap();
        assert_eq!(auto.state(), AutoRecorderState::Stopped);

        let count = rows.lock().unwrap().len();
        assert!((3..=8).contains(&count), "expected ~5 rows, got {count}");

        auto.stop().await.unwrap(); // idempotent
    }

    #[tokio::test]
    async fn test_auto_recorder_survives_erroring_quantity() {
        let (sink, rows) = MemorySink::new();
        let recorder = Recorder::new(vec![failing_quantity()], Box::new(sink))
            .await
            .unwrap();
        let mut auto = AutoRecorder::new("dead-bench", recorder);

        auto.start(Duration::from_millis(50)).unwrap();
        tokio::time::sleep(Duration::from_millis(220)).await;
        assert_eq!(auto.state(), AutoRecorderState::Running, "must not self-terminate");
        auto.stop().await.unwrap();

        assert!(rows.lock().unwrap().is_empty(), "no successful rows expected");
    }
}
