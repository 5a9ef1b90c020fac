//! Console control surface.
//!
//! A [`Console`] owns named sequences and auto-recorders and drives them
//! from text commands, so a REPL (or anything else that produces lines) can
//! start, pause and observe background work while it keeps running. Every
//! failure comes back through the normal error taxonomy as a message; the
//! console never panics on operator input.

use crate::error::{RigError, RigResult};
use crate::recorder::{AutoRecorder, AutoRecorderState};
use crate::sequence::Sequence;
use crate::wait::Confirm;
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::warn;

const HELP: &str = "\
commands:
  status                     states of every sequence and recorder
  seq start <name>           start a sequence
  seq pause <name>           pause at its next checkpoint
  seq resume <name>          clear a pause
  seq stop <name>            request cooperative termination
  seq status <name>          one sequence's state and failure cause
  rec start <name> <secs>    start an auto-recorder on an interval
  rec stop <name>            stop an auto-recorder and close its file
  help                       this text";

/// Named sequences and recorders plus a text command dispatcher.
pub struct Console {
    sequences: BTreeMap<String, Arc<Sequence>>,
    recorders: BTreeMap<String, AutoRecorder>,
}

impl Console {
    /// Empty console.
    pub fn new() -> Self {
        Self {
            sequences: BTreeMap::new(),
            recorders: BTreeMap::new(),
        }
    }

    /// Register a sequence under its own name.
    pub fn add_sequence(&mut self, sequence: Arc<Sequence>) {
        self.sequences.insert(sequence.name().to_string(), sequence);
    }

    /// Register an auto-recorder under its own name.
    pub fn add_recorder(&mut self, recorder: AutoRecorder) {
        self.recorders.insert(recorder.name().to_string(), recorder);
    }

    fn sequence(&self, name: &str) -> RigResult<&Arc<Sequence>> {
        self.sequences
            .get(name)
            .ok_or_else(|| RigError::Configuration(format!("unknown sequence '{name}'")))
    }

    fn recorder_mut(&mut self, name: &str) -> RigResult<&mut AutoRecorder> {
        self.recorders
            .get_mut(name)
            .ok_or_else(|| RigError::Configuration(format!("unknown recorder '{name}'")))
    }

    fn status_all(&self) -> String {
        let mut out = String::new();
        for sequence in self.sequences.values() {
            let _ = writeln!(out, "seq  {}", sequence.status());
        }
        for (name, recorder) in &self.recorders {
            let state = match recorder.state() {
                AutoRecorderState::Running => "running",
                AutoRecorderState::Stopped => "stopped",
            };
            let _ = writeln!(out, "rec  {name}: {state}");
        }
        if out.is_empty() {
            out.push_str("nothing registered");
        }
        out.trim_end().to_string()
    }

    /// Execute one command line and return the reply text.
    pub async fn dispatch(&mut self, line: &str) -> RigResult<String> {
        let parts: Vec<&str> = line.split_whitespace().collect();
        match parts.as_slice() {
            [] => Ok(String::new()),
            ["help"] => Ok(HELP.to_string()),
            ["status"] => Ok(self.status_all()),
            ["seq", "start", name] => {
                self.sequence(name)?.start()?;
                Ok(format!("sequence '{name}' started"))
            }
            ["seq", "pause", name] => {
                self.sequence(name)?.pause()?;
                Ok(format!("sequence '{name}' pausing at next checkpoint"))
            }
            ["seq", "resume", name] => {
                self.sequence(name)?.resume()?;
                Ok(format!("sequence '{name}' resumed"))
            }
            ["seq", "stop", name] => {
                self.sequence(name)?.stop()?;
                Ok(format!("sequence '{name}' stopping at next checkpoint"))
            }
            ["seq", "status", name] => Ok(self.sequence(name)?.status().to_string()),
            ["rec", "start", name, interval] => {
                let seconds: f64 = interval.parse().map_err(|_| {
                    RigError::Configuration(format!("bad interval '{interval}', expected seconds"))
                })?;
                if seconds <= 0.0 {
                    return Err(RigError::Configuration(
                        "interval must be positive".to_string(),
                    ));
                }
                self.recorder_mut(name)?
                    .start(Duration::from_secs_f64(seconds))?;
                Ok(format!("recorder '{name}' sampling every {seconds} s"))
            }
            ["rec", "stop", name] => {
                self.recorder_mut(name)?.stop().await?;
                Ok(format!("recorder '{name}' stopped"))
            }
            _ => Ok(format!("unrecognized command '{line}'; try 'help'")),
        }
    }

    /// Stop every recorder and every live sequence, for a clean exit.
    pub async fn shutdown(&mut self) {
        for (name, recorder) in self.recorders.iter_mut() {
            if let Err(e) = recorder.stop().await {
                warn!(recorder = %name, error = %e, "recorder did not stop cleanly");
            }
        }
        for sequence in self.sequences.values() {
            if sequence.state().is_live() {
                let _ = sequence.stop();
                sequence.join().await;
            }
        }
    }
}

impl Default for Console {
    fn default() -> Self {
        Self::new()
    }
}

/// Terminal implementation of the manual-confirmation collaborator: print
/// the prompt, block the asking task until the operator presses enter.
pub struct StdinConfirm;

#[async_trait]
impl Confirm for StdinConfirm {
    async fn confirm(&self, prompt: &str) -> RigResult<()> {
        println!("{prompt} — press enter to continue");
        let mut line = String::new();
        BufReader::new(tokio::io::stdin())
            .read_line(&mut line)
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::quantity::Quantity;
    use crate::recorder::{CsvSink, Recorder};
    use crate::sequence::SequenceState;

    fn looping_sequence(name: &str) -> Arc<Sequence> {
        Arc::new(Sequence::new(name, |mut ctx| async move {
            loop {
                ctx.checkpoint().await?;
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        }))
    }

    async fn console_with_recorder(dir: &std::path::Path) -> Console {
        let quantity = Arc::new(Quantity::from_fn(&[("Counter", "")], || async {
            Ok(vec![1.0])
        }));
        let sink = CsvSink::create(dir.join("bench_log"));
        let recorder = Recorder::new(vec![quantity], Box::new(sink)).await.unwrap();
        let mut console = Console::new();
        console.add_recorder(AutoRecorder::new("bench", recorder));
        console
    }

    #[tokio::test]
    async fn test_sequence_lifecycle_via_commands() {
        let mut console = Console::new();
        let sequence = looping_sequence("warmup");
        console.add_sequence(sequence.clone());

        console.dispatch("seq start warmup").await.unwrap();
        assert_eq!(sequence.state(), SequenceState::Running);

        console.dispatch("seq pause warmup").await.unwrap();
        assert_eq!(sequence.state(), SequenceState::Paused);

        console.dispatch("seq resume warmup").await.unwrap();
        console.dispatch("seq stop warmup").await.unwrap();
        assert_eq!(sequence.join().await.state, SequenceState::Stopped);

        let reply = console.dispatch("seq status warmup").await.unwrap();
        assert!(reply.contains("stopped"));
    }

    #[tokio::test]
    async fn test_invalid_transition_surfaces_as_error() {
        let mut console = Console::new();
        console.add_sequence(looping_sequence("warmup"));

        let err = console.dispatch("seq resume warmup").await.unwrap_err();
        assert!(matches!(err, RigError::InvalidTransition { .. }));
    }

    #[tokio::test]
    async fn test_unknown_names_are_errors() {
        let mut console = Console::new();
        assert!(console.dispatch("seq start nope").await.is_err());
        assert!(console.dispatch("rec stop nope").await.is_err());
    }

    #[tokio::test]
    async fn test_recorder_lifecycle_via_commands() {
        let dir = tempfile::tempdir().unwrap();
        let mut console = console_with_recorder(dir.path()).await;

        console.dispatch("rec start bench 0.02").await.unwrap();
        tokio::time::sleep(Duration::from_millis(60)).await;
        console.dispatch("rec stop bench").await.unwrap();

        let written = std::fs::read_to_string(dir.path().join("bench_log.csv")).unwrap();
        let lines: Vec<&str> = written.lines().collect();
        assert_eq!(lines[0], "Time_Elapsed,Counter");
        assert!(lines.len() > 2, "expected at least one data row");
    }

    #[tokio::test]
    async fn test_bad_interval_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let mut console = console_with_recorder(dir.path()).await;
        assert!(console.dispatch("rec start bench fast").await.is_err());
        assert!(console.dispatch("rec start bench -1").await.is_err());
    }

    #[tokio::test]
    async fn test_unrecognized_command_is_not_an_error() {
        let mut console = Console::new();
        let reply = console.dispatch("make tea").await.unwrap();
        assert!(reply.contains("unrecognized"));
    }
}
