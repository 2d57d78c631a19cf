//! Liveness tracking for concurrent agent instances sharing one checkout.

mod heartbeat;

pub use heartbeat::{
    HeartbeatOutcome, HeartbeatRecord, HeartbeatRegistry, STALE_AFTER, STATUS_ACTIVE, STATUS_IDLE,
    refresh, refresh_at, resolve_instance_id,
};
