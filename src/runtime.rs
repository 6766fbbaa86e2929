//! What the ingestion engine needs from a container runtime.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::stream::BoxStream;

use crate::checkpoint::Position;

#[derive(Debug, thiserror::Error)]
pub enum RuntimeError {
    #[error("Docker API error: {0}")]
    DockerApi(#[from] bollard::errors::Error),
    #[error("Malformed runtime response: {0}")]
    Malformed(String),
}

/// A running container as reported by a listing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerSummary {
    pub id: String,
    pub names: Vec<String>,
}

/// Current state of a single container.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerInfo {
    pub id: String,
    pub names: Vec<String>,
    pub running: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogStream {
    Stdout,
    Stderr,
    Console,
}

impl AsRef<str> for LogStream {
    fn as_ref(&self) -> &str {
        match self {
            Self::Stdout => "stdout",
            Self::Stderr => "stderr",
            Self::Console => "console",
        }
    }
}

/// One chunk of container output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogFrame {
    /// Timestamp the runtime stamped the frame with, in nanoseconds.
    pub timestamp_nanos: Option<i64>,
    pub stream: LogStream,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LifecycleKind {
    Started,
    Died,
    Destroyed,
    Other(String),
}

impl From<&str> for LifecycleKind {
    fn from(action: &str) -> Self {
        match action {
            "start" => Self::Started,
            "die" => Self::Died,
            "destroy" => Self::Destroyed,
            other => Self::Other(other.to_string()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LifecycleEvent {
    pub container_id: String,
    pub kind: LifecycleKind,
}

#[async_trait]
pub trait ContainerRuntime: Send + Sync + 'static {
    async fn list_running(&self) -> Result<Vec<ContainerSummary>, RuntimeError>;

    /// `Ok(None)` when the container no longer exists.
    async fn inspect(&self, container_id: &str) -> Result<Option<ContainerInfo>, RuntimeError>;

    /// Follow the combined output of a container, starting at the second
    /// containing `since`. Frames already covered by `since` may be
    /// returned again and are filtered by the caller.
    fn logs(
        &self,
        container_id: &str,
        since: &Position,
    ) -> BoxStream<'static, Result<LogFrame, RuntimeError>>;

    /// Subscribe to container lifecycle events, replaying those that
    /// happened after `since`.
    async fn subscribe(
        &self,
        since: DateTime<Utc>,
    ) -> Result<BoxStream<'static, Result<LifecycleEvent, RuntimeError>>, RuntimeError>;
}
