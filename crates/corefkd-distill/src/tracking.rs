//! Experiment tracking.
//!
//! A run is an append-only jsonlines file at
//! `<root>/<experiment>/<run_id>.jsonl`: one `start` event, any number of
//! `params` and `metrics` events, and one `end` event.  A run dropped without
//! [`TrackingRun::finish`] records itself as failed.

use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Completed,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum RunEvent {
    Start { run_id: String, experiment: String, time: DateTime<Utc> },
    Params { values: serde_json::Value, time: DateTime<Utc> },
    Metrics { step: usize, values: BTreeMap<String, f64>, time: DateTime<Utc> },
    End { status: RunStatus, time: DateTime<Utc> },
}

pub struct TrackingRun {
    run_id: String,
    path: PathBuf,
    writer: BufWriter<File>,
    finished: bool,
}

impl TrackingRun {
    pub fn start(root: &Path, experiment: &str) -> Result<Self> {
        let dir = root.join(experiment);
        fs::create_dir_all(&dir)
            .with_context(|| format!("Cannot create tracking dir {}", dir.display()))?;

        let run_id = Uuid::new_v4().to_string();
        let path = dir.join(format!("{run_id}.jsonl"));
        let file =
            File::create(&path).with_context(|| format!("Cannot create {}", path.display()))?;

        let mut run = Self {
            run_id: run_id.clone(),
            path,
            writer: BufWriter::new(file),
            finished: false,
        };
        run.write(&RunEvent::Start {
            run_id,
            experiment: experiment.to_string(),
            time: Utc::now(),
        })?;
        info!(experiment, run_id = %run.run_id, path = %run.path.display(), "Tracking run started");
        Ok(run)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn log_params<T: Serialize>(&mut self, params: &T) -> Result<()> {
        let values = serde_json::to_value(params)?;
        self.write(&RunEvent::Params { values, time: Utc::now() })
    }

    pub fn log_metrics(&mut self, step: usize, metrics: &[(&str, f64)]) -> Result<()> {
        let values = metrics.iter().map(|(k, v)| (k.to_string(), *v)).collect();
        debug!(step, ?metrics, "Tracking metrics");
        self.write(&RunEvent::Metrics { step, values, time: Utc::now() })
    }

    pub fn finish(mut self, status: RunStatus) -> Result<()> {
        self.finished = true;
        self.write(&RunEvent::End { status, time: Utc::now() })
    }

    fn write(&mut self, event: &RunEvent) -> Result<()> {
        serde_json::to_writer(&mut self.writer, event)?;
        self.writer.write_all(b"\n")?;
        self.writer.flush().with_context(|| format!("Cannot write {}", self.path.display()))
    }
}

impl Drop for TrackingRun {
    fn drop(&mut self) {
        if !self.finished {
            let _ = self.write(&RunEvent::End { status: RunStatus::Failed, time: Utc::now() });
        }
    }
}

/// Read every event of a run file.
pub fn read_events(path: &Path) -> Result<Vec<RunEvent>> {
    let text = fs::read_to_string(path).with_context(|| format!("Cannot read {}", path.display()))?;
    text.lines()
        .filter(|l| !l.trim().is_empty())
        .enumerate()
        .map(|(i, l)| {
            serde_json::from_str(l)
                .with_context(|| format!("Bad event at {}:{}", path.display(), i + 1))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn records_full_run() {
        let tmp = TempDir::new().unwrap();
        let mut run = TrackingRun::start(tmp.path(), "kd").unwrap();
        let path = run.path().to_path_buf();
        assert!(path.starts_with(tmp.path().join("kd")));

        run.log_params(&serde_json::json!({ "alpha": 0.5 })).unwrap();
        run.log_metrics(10, &[("loss", 1.25), ("lr", 1e-5)]).unwrap();
        run.finish(RunStatus::Completed).unwrap();

        let events = read_events(&path).unwrap();
        assert_eq!(events.len(), 4);
        assert!(matches!(events[0], RunEvent::Start { .. }));
        match &events[2] {
            RunEvent::Metrics { step, values, .. } => {
                assert_eq!(*step, 10);
                assert_eq!(values["loss"], 1.25);
            }
            other => panic!("unexpected event {other:?}"),
        }
        assert!(matches!(events[3], RunEvent::End { status: RunStatus::Completed, .. }));
    }

    #[test]
    fn dropped_run_is_marked_failed() {
        let tmp = TempDir::new().unwrap();
        let path = {
            let run = TrackingRun::start(tmp.path(), "kd").unwrap();
            run.path().to_path_buf()
        };
        let events = read_events(&path).unwrap();
        assert!(matches!(events.last(), Some(RunEvent::End { status: RunStatus::Failed, .. })));
    }
}
