//! SSE frame formatting and per-subscriber streaming
//!
//! The transport binding (HTTP server) lives outside this crate; what Edison
//! owns is the frame text and the subscriber protocol: on subscribe the
//! stream opens with a snapshot event, then relays live events as
//! `data: <json>\n\n` frames with a comment heartbeat every 15 seconds.
//! Reconnection backoff is the client's side of the protocol.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::debug;

use super::bus::EventBus;
use super::types::EdisonEvent;

/// Comment heartbeat frame
pub const HEARTBEAT_FRAME: &str = ": heartbeat\n\n";

/// SSE tuning
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SseConfig {
    pub heartbeat_secs: u64,
}

impl Default for SseConfig {
    fn default() -> Self {
        Self { heartbeat_secs: 15 }
    }
}

/// Render one event as an SSE data frame
pub fn frame(event: &EdisonEvent) -> String {
    match serde_json::to_string(event) {
        Ok(json) => format!("data: {json}\n\n"),
        // Event types are all serializable; this arm is unreachable in
        // practice but keeps the stream alive if that ever changes
        Err(_) => HEARTBEAT_FRAME.to_string(),
    }
}

/// Spawn a subscriber task streaming frames for one iteration
///
/// The first frame is the provided snapshot. Frames for other iterations are
/// filtered out; cost alerts pass through. The task ends when the consumer
/// drops the receiver or the bus closes.
pub fn spawn_sse_stream(
    bus: &EventBus,
    iteration_id: impl Into<String>,
    snapshot: EdisonEvent,
    config: SseConfig,
) -> (mpsc::Receiver<String>, JoinHandle<()>) {
    let iteration_id = iteration_id.into();
    let mut events = bus.subscribe();
    let (tx, rx) = mpsc::channel::<String>(256);
    let heartbeat = Duration::from_secs(config.heartbeat_secs.max(1));

    let handle = tokio::spawn(async move {
        if tx.send(frame(&snapshot)).await.is_err() {
            return;
        }

        let mut ticker = tokio::time::interval(heartbeat);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        ticker.reset();

        loop {
            tokio::select! {
                received = events.recv() => {
                    match received {
                        Ok(event) => {
                            let relevant = match event.iteration_id() {
                                Some(id) => id == iteration_id,
                                // Cost alerts and snapshots fan out to everyone
                                None => true,
                            };
                            if relevant && tx.send(frame(&event)).await.is_err() {
                                debug!(iteration_id, "SSE consumer gone, closing stream");
                                return;
                            }
                        }
                        Err(tokio::sync::broadcast::error::RecvError::Lagged(missed)) => {
                            debug!(iteration_id, missed, "SSE stream lagged; client recovers from persisted state");
                        }
                        Err(tokio::sync::broadcast::error::RecvError::Closed) => {
                            debug!(iteration_id, "event bus closed, ending SSE stream");
                            return;
                        }
                    }
                }
                _ = ticker.tick() => {
                    if tx.send(HEARTBEAT_FRAME.to_string()).await.is_err() {
                        return;
                    }
                }
            }
        }
    });

    (rx, handle)
}
