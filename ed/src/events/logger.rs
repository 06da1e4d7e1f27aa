//! JSONL event logger
//!
//! A spawned subscriber that appends every bus event to one JSONL file per
//! iteration. Together with the snapshot protocol this gives post-hoc
//! replay: snapshot + logged events reproduce the final iteration state.

use std::io::Write;
use std::path::{Path, PathBuf};

use tokio::task::JoinHandle;
use tracing::{debug, warn};

use super::bus::EventBus;
use super::types::EdisonEvent;

/// File name used for events with no iteration (cost alerts)
const GLOBAL_LOG: &str = "global";

fn log_path(dir: &Path, iteration_id: Option<&str>) -> PathBuf {
    dir.join(format!("{}.jsonl", iteration_id.unwrap_or(GLOBAL_LOG)))
}

fn append_line(path: &Path, line: &str) -> std::io::Result<()> {
    let mut file = std::fs::OpenOptions::new().create(true).append(true).open(path)?;
    writeln!(file, "{line}")
}

/// Spawn the logger; it runs until the bus closes
pub fn spawn_event_logger(bus: &EventBus, dir: impl Into<PathBuf>) -> JoinHandle<()> {
    let dir = dir.into();
    let mut events = bus.subscribe();

    tokio::spawn(async move {
        if let Err(e) = std::fs::create_dir_all(&dir) {
            warn!(dir = %dir.display(), error = %e, "cannot create event log directory, logger disabled");
            return;
        }
        loop {
            match events.recv().await {
                Ok(event) => {
                    let Ok(json) = serde_json::to_string(&event) else {
                        continue;
                    };
                    let path = log_path(&dir, event.iteration_id());
                    if let Err(e) = append_line(&path, &json) {
                        warn!(path = %path.display(), error = %e, "failed to append event log line");
                    }
                }
                Err(tokio::sync::broadcast::error::RecvError::Lagged(missed)) => {
                    warn!(missed, "event logger lagged, some events not persisted");
                }
                Err(tokio::sync::broadcast::error::RecvError::Closed) => {
                    debug!("event bus closed, logger exiting");
                    return;
                }
            }
        }
    })
}

/// Read back the logged events for one iteration, in emission order
pub fn read_iteration_events(dir: &Path, iteration_id: &str) -> eyre::Result<Vec<EdisonEvent>> {
    let path = log_path(dir, Some(iteration_id));
    if !path.exists() {
        return Ok(Vec::new());
    }
    let content = std::fs::read_to_string(&path)?;
    let mut events = Vec::new();
    for line in content.lines() {
        if line.trim().is_empty() {
            continue;
        }
        events.push(serde_json::from_str(line)?);
    }
    Ok(events)
}
