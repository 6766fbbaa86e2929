use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::runtime::LogFrame;

/// A single log line handed to the downstream sink.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogEvent {
    pub event_id: Uuid,
    /// Timestamp in microseconds (UTC)
    pub timestamp: i64,
    pub host: String,
    pub container_id: String,
    pub container_name: String,
    pub stream: String,
    pub message: String,
}

impl LogEvent {
    /// Build an event from a frame. Frames the runtime did not stamp get the
    /// time they were received.
    pub fn from_frame(host: &str, container_id: &str, container_name: &str, frame: LogFrame) -> Self {
        let timestamp = match frame.timestamp_nanos {
            Some(nanos) => nanos.div_euclid(1_000),
            None => chrono::Utc::now().timestamp_micros(),
        };

        Self {
            event_id: Uuid::now_v7(),
            timestamp,
            host: host.to_string(),
            container_id: container_id.to_string(),
            container_name: container_name.trim_start_matches('/').to_string(),
            stream: frame.stream.as_ref().to_string(),
            message: frame.message,
        }
    }
}
