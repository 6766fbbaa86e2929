//! Container discovery and the lifecycle event listener.
//!
//! Startup happens in two phases that feed the same spawn path. The
//! lifecycle subscription is opened first, replaying events since just
//! before the snapshot, then the running containers are listed. A container
//! that starts in between shows up in both places and the task pool makes
//! sure it is tailed only once.

use std::sync::Arc;

use chrono::Utc;
use futures::stream::BoxStream;
use futures_util::StreamExt;
use tokio::sync::mpsc::Sender;
use tokio_util::sync::CancellationToken;

use crate::checkpoint::CheckpointStore;
use crate::config::Config;
use crate::event::LogEvent;
use crate::filter::NameFilter;
use crate::pool::TaskPool;
use crate::runtime::{ContainerRuntime, LifecycleEvent, LifecycleKind, RuntimeError};
use crate::tail::{short_id, TailTask};

/// How far back the lifecycle subscription replays, to cover clock skew
/// between this host and the runtime.
const SUBSCRIBE_LOOKBACK: chrono::Duration = chrono::Duration::seconds(1);

pub type LifecycleEvents = BoxStream<'static, Result<LifecycleEvent, RuntimeError>>;

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("Failed to subscribe to container events: {0}")]
    Subscribe(RuntimeError),
    #[error("Failed to list running containers: {0}")]
    List(RuntimeError),
    #[error("Container event stream failed: {0}")]
    EventStream(RuntimeError),
    #[error("Container event stream ended")]
    EventStreamClosed,
}

pub struct Engine {
    config: Arc<Config>,
    runtime: Arc<dyn ContainerRuntime>,
    filter: NameFilter,
    store: Arc<CheckpointStore>,
    pool: TaskPool,
    events: Sender<LogEvent>,
}

impl Engine {
    pub fn new(
        config: Arc<Config>,
        runtime: Arc<dyn ContainerRuntime>,
        filter: NameFilter,
        store: Arc<CheckpointStore>,
        events: Sender<LogEvent>,
    ) -> Self {
        Self {
            config,
            runtime,
            filter,
            store,
            pool: TaskPool::new(CancellationToken::new()),
            events,
        }
    }

    #[cfg(test)]
    pub fn is_tailing(&self, container_id: &str) -> bool {
        self.pool.is_active(container_id)
    }

    pub fn tailing_count(&self) -> usize {
        self.pool.active_count()
    }

    /// Subscribe to lifecycle events and tail every eligible running
    /// container. The returned stream is meant for [`Engine::listen`].
    pub async fn start(&self) -> Result<LifecycleEvents, EngineError> {
        let since = Utc::now() - SUBSCRIBE_LOOKBACK;
        let events = self
            .runtime
            .subscribe(since)
            .await
            .map_err(EngineError::Subscribe)?;

        let containers = self
            .runtime
            .list_running()
            .await
            .map_err(EngineError::List)?;

        let mut spawned = 0;
        for container in &containers {
            if !self.filter.is_eligible(&container.names) {
                log::debug!(
                    "Skipping container {} {:?}",
                    short_id(&container.id),
                    container.names
                );
                continue;
            }
            if self.spawn_tail(&container.id, &container.names) {
                spawned += 1;
            }
        }

        log::info!(
            "Found {} running container(s), tailing {}",
            containers.len(),
            spawned
        );
        Ok(events)
    }

    /// Handle lifecycle events until `cancel` fires or the stream breaks.
    pub async fn listen(
        &self,
        mut events: LifecycleEvents,
        cancel: &CancellationToken,
    ) -> Result<(), EngineError> {
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    log::info!("Stopping container event listener");
                    return Ok(());
                }
                event = events.next() => match event {
                    Some(Ok(event)) => self.on_event(event).await,
                    Some(Err(e)) => return Err(EngineError::EventStream(e)),
                    None => return Err(EngineError::EventStreamClosed),
                },
            }
        }
    }

    /// Stop every tail task and wait for them to finish.
    pub async fn shutdown(&self) {
        log::info!("Stopping {} tail task(s)", self.tailing_count());
        self.pool.shutdown().await;
    }

    /// Start, listen until cancelled or failed, then shut down. `on_ready`
    /// runs once the initial snapshot is being tailed.
    pub async fn run(
        &self,
        cancel: CancellationToken,
        on_ready: impl FnOnce(),
    ) -> Result<(), EngineError> {
        let result = match self.start().await {
            Ok(events) => {
                on_ready();
                self.listen(events, &cancel).await
            }
            Err(e) => Err(e),
        };
        self.shutdown().await;
        result
    }

    async fn on_event(&self, event: LifecycleEvent) {
        match event.kind {
            LifecycleKind::Started => self.on_started(&event.container_id).await,
            LifecycleKind::Died | LifecycleKind::Destroyed => log::debug!(
                "Container {} {:?}",
                short_id(&event.container_id),
                event.kind
            ),
            LifecycleKind::Other(action) => log::trace!(
                "Ignoring {} event of {}",
                action,
                short_id(&event.container_id)
            ),
        }
    }

    async fn on_started(&self, container_id: &str) {
        let info = match self.runtime.inspect(container_id).await {
            Ok(Some(info)) => info,
            Ok(None) => {
                log::warn!(
                    "Container {} is gone, ignoring its start event",
                    short_id(container_id)
                );
                return;
            }
            Err(e) => {
                log::warn!(
                    "Failed to inspect started container {}: {}",
                    short_id(container_id),
                    e
                );
                return;
            }
        };

        if !self.filter.is_eligible(&info.names) {
            log::warn!(
                "Ignoring started container {} {:?}: name not eligible",
                short_id(container_id),
                info.names
            );
            return;
        }

        if !self.spawn_tail(&info.id, &info.names) {
            log::debug!("Container {} is already tailed", short_id(container_id));
        }
    }

    fn spawn_tail(&self, container_id: &str, names: &[String]) -> bool {
        let task = TailTask {
            container_id: container_id.to_string(),
            container_name: names
                .first()
                .cloned()
                .unwrap_or_else(|| container_id.to_string()),
            host: self.config.hostname.clone(),
            runtime: Arc::clone(&self.runtime),
            store: Arc::clone(&self.store),
            events: self.events.clone(),
            retry_interval: self.config.retry_interval,
        };

        self.pool
            .spawn_if_absent(container_id, move |lease, cancel| async move {
                task.run(lease, cancel).await;
            })
    }
}
