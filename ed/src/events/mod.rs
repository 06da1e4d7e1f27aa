//! Iteration progress events
//!
//! Pure output: the orchestrator writes to the store and then publishes
//! here; nothing on the bus ever calls back into the orchestrator.

mod bus;
mod logger;
mod sse;
mod types;

pub use bus::{DEFAULT_CHANNEL_CAPACITY, EventBus, IterationEmitter, create_event_bus};
pub use logger::{read_iteration_events, spawn_event_logger};
pub use sse::{HEARTBEAT_FRAME, SseConfig, frame, spawn_sse_stream};
pub use types::EdisonEvent;
