use chrono::{DateTime, Utc};

/// Timestamped engine occurrence published on the flow's broadcast channel
///
/// Delivery is lossy: lagging subscribers miss events, and publishing with
/// no subscribers is a no-op.
#[derive(Debug, Clone)]
pub enum MonitorEvent {
    ExecutionStarted {
        execution: String,
        at: DateTime<Utc>,
    },
    EventEmitted {
        execution: String,
        event: String,
        at: DateTime<Utc>,
    },
    ChunkStarted {
        execution: String,
        chunk: String,
        at: DateTime<Utc>,
    },
    ChunkCompleted {
        execution: String,
        chunk: String,
        at: DateTime<Utc>,
    },
    ChunkFailed {
        execution: String,
        chunk: String,
        error: String,
        at: DateTime<Utc>,
    },
    ResultResolved {
        execution: String,
        at: DateTime<Utc>,
    },
    StreamStopped {
        execution: String,
        at: DateTime<Utc>,
    },
}

impl MonitorEvent {
    pub fn execution(&self) -> &str {
        match self {
            MonitorEvent::ExecutionStarted { execution, .. }
            | MonitorEvent::EventEmitted { execution, .. }
            | MonitorEvent::ChunkStarted { execution, .. }
            | MonitorEvent::ChunkCompleted { execution, .. }
            | MonitorEvent::ChunkFailed { execution, .. }
            | MonitorEvent::ResultResolved { execution, .. }
            | MonitorEvent::StreamStopped { execution, .. } => execution,
        }
    }

    pub fn at(&self) -> DateTime<Utc> {
        match self {
            MonitorEvent::ExecutionStarted { at, .. }
            | MonitorEvent::EventEmitted { at, .. }
            | MonitorEvent::ChunkStarted { at, .. }
            | MonitorEvent::ChunkCompleted { at, .. }
            | MonitorEvent::ChunkFailed { at, .. }
            | MonitorEvent::ResultResolved { at, .. }
            | MonitorEvent::StreamStopped { at, .. } => *at,
        }
    }
}
