//! Docker implementation of [`ContainerRuntime`] using bollard.

use async_trait::async_trait;
use bollard::container::LogOutput;
use bollard::models::EventMessageTypeEnum;
use bollard::query_parameters::{
    EventsOptions, EventsOptionsBuilder, InspectContainerOptions, InspectContainerOptionsBuilder,
    ListContainersOptions, ListContainersOptionsBuilder, LogsOptions, LogsOptionsBuilder,
};
use bollard::{Docker, API_DEFAULT_VERSION};
use chrono::{DateTime, Utc};
use futures::stream::BoxStream;
use futures_util::StreamExt;

use crate::checkpoint::Position;
use crate::config::RuntimeEndpoint;
use crate::runtime::{
    ContainerInfo, ContainerRuntime, ContainerSummary, LifecycleEvent, LogFrame, LogStream,
    RuntimeError,
};

/// Seconds bollard waits for a response before giving up.
const CONNECT_TIMEOUT: u64 = 120;

#[derive(Debug, Clone)]
pub struct DockerRuntime {
    docker: Docker,
}

impl DockerRuntime {
    pub fn connect(endpoint: &RuntimeEndpoint) -> Result<Self, RuntimeError> {
        let docker = match endpoint {
            RuntimeEndpoint::LocalDefaults => Docker::connect_with_local_defaults()?,
            RuntimeEndpoint::Unix(path) => {
                Docker::connect_with_unix(path, CONNECT_TIMEOUT, API_DEFAULT_VERSION)?
            }
            RuntimeEndpoint::Http(addr) => {
                Docker::connect_with_http(addr, CONNECT_TIMEOUT, API_DEFAULT_VERSION)?
            }
        };
        Ok(Self { docker })
    }

    /// Fails when the daemon cannot be reached.
    pub async fn ping(&self) -> Result<(), RuntimeError> {
        self.docker.ping().await?;
        Ok(())
    }
}

#[async_trait]
impl ContainerRuntime for DockerRuntime {
    async fn list_running(&self) -> Result<Vec<ContainerSummary>, RuntimeError> {
        let options: ListContainersOptions = ListContainersOptionsBuilder::new().all(false).build();

        let containers = self.docker.list_containers(Some(options)).await?;

        containers
            .into_iter()
            .map(|c| {
                let id = c
                    .id
                    .ok_or_else(|| RuntimeError::Malformed("container without id".to_string()))?;
                Ok(ContainerSummary {
                    id,
                    names: c.names.unwrap_or_default(),
                })
            })
            .collect()
    }

    async fn inspect(&self, container_id: &str) -> Result<Option<ContainerInfo>, RuntimeError> {
        let options: InspectContainerOptions = InspectContainerOptionsBuilder::new().build();

        match self
            .docker
            .inspect_container(container_id, Some(options))
            .await
        {
            Ok(info) => Ok(Some(ContainerInfo {
                id: info.id.unwrap_or_else(|| container_id.to_string()),
                names: info.name.into_iter().collect(),
                running: info
                    .state
                    .and_then(|state| state.running)
                    .unwrap_or(false),
            })),
            Err(bollard::errors::Error::DockerResponseServerError {
                status_code: 404, ..
            }) => Ok(None),
            Err(e) => Err(RuntimeError::DockerApi(e)),
        }
    }

    fn logs(
        &self,
        container_id: &str,
        since: &Position,
    ) -> BoxStream<'static, Result<LogFrame, RuntimeError>> {
        let since = i32::try_from(since.since_seconds).unwrap_or(i32::MAX);
        let options: LogsOptions = LogsOptionsBuilder::new()
            .follow(true)
            .stdout(true)
            .stderr(true)
            .timestamps(true)
            .since(since)
            .build();

        self.docker
            .logs(container_id, Some(options))
            .map(|output| output.map(into_frame).map_err(RuntimeError::from))
            .boxed()
    }

    async fn subscribe(
        &self,
        since: DateTime<Utc>,
    ) -> Result<BoxStream<'static, Result<LifecycleEvent, RuntimeError>>, RuntimeError> {
        self.ping().await?;

        let since = since.timestamp().to_string();
        let options: EventsOptions = EventsOptionsBuilder::new().since(&since).build();

        let events = self
            .docker
            .events(Some(options))
            .filter_map(|message| async move {
                let message = match message {
                    Ok(message) => message,
                    Err(e) => return Some(Err(RuntimeError::DockerApi(e))),
                };
                if message.typ != Some(EventMessageTypeEnum::CONTAINER) {
                    return None;
                }
                let action = message.action?;
                let container_id = message.actor.and_then(|actor| actor.id)?;
                Some(Ok(LifecycleEvent {
                    container_id,
                    kind: action.as_str().into(),
                }))
            })
            .boxed();

        Ok(events)
    }
}

fn into_frame(output: LogOutput) -> LogFrame {
    let (stream, raw) = match output {
        LogOutput::StdOut { message } => (LogStream::Stdout, message),
        LogOutput::StdErr { message } => (LogStream::Stderr, message),
        LogOutput::Console { message } => (LogStream::Console, message),
        LogOutput::StdIn { message } => (LogStream::Console, message),
    };
    parse_frame(stream, &String::from_utf8_lossy(&raw))
}

/// Split the `timestamps=true` prefix off a raw log line.
fn parse_frame(stream: LogStream, raw: &str) -> LogFrame {
    let parsed = raw.split_once(' ').and_then(|(ts, rest)| {
        DateTime::parse_from_rfc3339(ts)
            .ok()
            .and_then(|ts| ts.timestamp_nanos_opt())
            .map(|nanos| (nanos, rest))
    });

    let (timestamp_nanos, message) = match parsed {
        Some((nanos, rest)) => (Some(nanos), rest),
        None => (None, raw),
    };

    LogFrame {
        timestamp_nanos,
        stream,
        message: message.trim_end_matches(['\r', '\n']).to_string(),
    }
}
