use serde::Serialize;

use crate::{core::unix_now_secs, model::ConnectionState};

/// Connection bookkeeping owned by the controller.
#[derive(Debug, Clone)]
pub struct RuntimeState {
    pub connection_state: ConnectionState,
    pub should_run: bool,
    pub last_connected_at: Option<u64>,
    pub last_stream_event_at: Option<u64>,
    pub last_message_at: Option<u64>,
    pub last_message_id: Option<i64>,
    pub last_error: Option<String>,
    pub backoff_seconds: u64,
    pub reconnect_attempts: u64,
}

impl Default for RuntimeState {
    fn default() -> Self {
        Self {
            connection_state: ConnectionState::Inactive,
            should_run: false,
            last_connected_at: None,
            last_stream_event_at: None,
            last_message_at: None,
            last_message_id: None,
            last_error: None,
            backoff_seconds: 0,
            reconnect_attempts: 0,
        }
    }
}

#[derive(Debug, Serialize, Clone, PartialEq)]
pub struct RuntimeDiagnostics {
    pub connection_state: ConnectionState,
    pub should_run: bool,
    pub last_connected_at: Option<u64>,
    pub last_stream_event_at: Option<u64>,
    pub last_message_at: Option<u64>,
    pub last_message_id: Option<i64>,
    pub stale_for_seconds: Option<u64>,
    pub last_error: Option<String>,
    pub backoff_seconds: u64,
    pub reconnect_attempts: u64,
    pub tasks_in_flight: usize,
}

impl RuntimeState {
    pub fn snapshot(&self, tasks_in_flight: usize) -> RuntimeDiagnostics {
        self.snapshot_at(unix_now_secs(), tasks_in_flight)
    }

    pub fn snapshot_at(&self, now: u64, tasks_in_flight: usize) -> RuntimeDiagnostics {
        RuntimeDiagnostics {
            connection_state: self.connection_state,
            should_run: self.should_run,
            last_connected_at: self.last_connected_at,
            last_stream_event_at: self.last_stream_event_at,
            last_message_at: self.last_message_at,
            last_message_id: self.last_message_id,
            stale_for_seconds: self
                .last_stream_event_at
                .map(|last| now.saturating_sub(last)),
            last_error: self.last_error.clone(),
            backoff_seconds: self.backoff_seconds,
            reconnect_attempts: self.reconnect_attempts,
            tasks_in_flight,
        }
    }

    pub fn mark_stream_activity(&mut self, at: u64) {
        self.last_stream_event_at = Some(at);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn staleness_measured_from_last_stream_event() {
        let mut runtime = RuntimeState::default();
        assert_eq!(runtime.snapshot_at(1_000, 0).stale_for_seconds, None);

        runtime.mark_stream_activity(940);
        let diag = runtime.snapshot_at(1_000, 2);
        assert_eq!(diag.stale_for_seconds, Some(60));
        assert_eq!(diag.tasks_in_flight, 2);
        assert_eq!(diag.connection_state, ConnectionState::Inactive);
    }

    #[test]
    fn diagnostics_serialize_for_subscribers() {
        let diag = RuntimeState::default().snapshot_at(0, 0);
        let json = serde_json::to_value(&diag).unwrap();
        assert_eq!(json["connection_state"], "Inactive");
        assert_eq!(json["reconnect_attempts"], 0);
    }
}
