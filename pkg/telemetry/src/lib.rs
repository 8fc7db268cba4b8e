pub mod queue;
pub mod sync;

pub use queue::{AnswerOverrides, TelemetryQueue};
pub use sync::{
    HEARTBEAT_INTERVAL, SYNC_INTERVAL, SyncOutcome, SyncScheduler, SyncTransport, TelemetryBatch,
};
