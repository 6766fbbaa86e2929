//! In-memory [`ContainerRuntime`] used by the tests.

use std::{
    collections::{HashMap, VecDeque},
    sync::{Arc, Mutex},
};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::{
    channel::mpsc::{unbounded, UnboundedSender},
    stream::{self, BoxStream},
    StreamExt,
};

use crate::checkpoint::Position;
use crate::runtime::{
    ContainerInfo, ContainerRuntime, ContainerSummary, LifecycleEvent, LifecycleKind, LogFrame,
    LogStream, RuntimeError,
};

/// 2024-03-01T10:20:00Z
pub const BASE_SECONDS: i64 = 1_709_288_400;

/// A stdout frame stamped `seconds` after a fixed base time.
pub fn frame(seconds: i64, message: &str) -> LogFrame {
    LogFrame {
        timestamp_nanos: Some((BASE_SECONDS + seconds) * 1_000_000_000 + 500),
        stream: LogStream::Stdout,
        message: message.to_string(),
    }
}

/// What happens after a log stream has replayed its lines.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionEnd {
    /// Yield this many lines, then an error.
    FailAfter(usize),
    /// End the stream, container keeps running.
    Close,
    /// Mark the container stopped, then end the stream.
    Stop,
    /// Remove the container, then end the stream.
    Remove,
    /// Keep the stream open forever.
    Hang,
}

#[derive(Debug, Default)]
struct MockContainer {
    info: Option<ContainerInfo>,
    lines: Vec<LogFrame>,
    sessions: VecDeque<SessionEnd>,
    requested_since: Vec<Position>,
    failing_inspects: usize,
}

#[derive(Default)]
struct MockState {
    containers: HashMap<String, MockContainer>,
    subscribers: Vec<UnboundedSender<Result<LifecycleEvent, RuntimeError>>>,
    fail_list: bool,
    fail_subscribe: bool,
    subscribed_since: Vec<DateTime<Utc>>,
    /// Order in which `list_running` and `subscribe` were called.
    call_order: Vec<&'static str>,
    inspect_calls: usize,
}

#[derive(Default)]
pub struct MockRuntime {
    state: Arc<Mutex<MockState>>,
}

impl MockRuntime {
    fn with_container<R>(&self, id: &str, f: impl FnOnce(&mut MockContainer) -> R) -> R {
        let mut state = self.state.lock().unwrap();
        f(state.containers.entry(id.to_string()).or_default())
    }

    pub fn add_container(&self, id: &str, running: bool) {
        self.add_container_named(id, &format!("/{id}"), running);
    }

    pub fn add_container_named(&self, id: &str, name: &str, running: bool) {
        self.with_container(id, |c| {
            c.info = Some(ContainerInfo {
                id: id.to_string(),
                names: vec![name.to_string()],
                running,
            })
        });
    }

    pub fn push_lines(&self, id: &str, lines: Vec<LogFrame>) {
        self.with_container(id, |c| c.lines.extend(lines));
    }

    pub fn push_session(&self, id: &str, end: SessionEnd) {
        self.with_container(id, |c| c.sessions.push_back(end));
    }

    pub fn fail_next_inspects(&self, id: &str, count: usize) {
        self.with_container(id, |c| c.failing_inspects = count);
    }

    pub fn requested_since(&self, id: &str) -> Vec<Position> {
        self.with_container(id, |c| c.requested_since.clone())
    }

    pub fn fail_list(&self) {
        self.state.lock().unwrap().fail_list = true;
    }

    pub fn fail_subscribe(&self) {
        self.state.lock().unwrap().fail_subscribe = true;
    }

    pub fn subscribed_since(&self) -> Vec<DateTime<Utc>> {
        self.state.lock().unwrap().subscribed_since.clone()
    }

    pub fn call_order(&self) -> Vec<&'static str> {
        self.state.lock().unwrap().call_order.clone()
    }

    pub fn inspect_calls(&self) -> usize {
        self.state.lock().unwrap().inspect_calls
    }

    pub fn emit(&self, container_id: &str, kind: LifecycleKind) {
        let event = LifecycleEvent {
            container_id: container_id.to_string(),
            kind,
        };
        let mut state = self.state.lock().unwrap();
        state
            .subscribers
            .retain(|tx| tx.unbounded_send(Ok(event.clone())).is_ok());
    }

    pub fn break_subscription(&self) {
        let mut state = self.state.lock().unwrap();
        for tx in state.subscribers.drain(..) {
            let _ = tx.unbounded_send(Err(RuntimeError::Malformed(
                "event stream reset".to_string(),
            )));
        }
    }

    pub fn end_subscription(&self) {
        self.state.lock().unwrap().subscribers.clear();
    }
}

#[async_trait]
impl ContainerRuntime for MockRuntime {
    async fn list_running(&self) -> Result<Vec<ContainerSummary>, RuntimeError> {
        let mut state = self.state.lock().unwrap();
        state.call_order.push("list");
        if state.fail_list {
            return Err(RuntimeError::Malformed("daemon unavailable".to_string()));
        }
        let mut running: Vec<_> = state
            .containers
            .values()
            .filter_map(|c| c.info.as_ref())
            .filter(|info| info.running)
            .map(|info| ContainerSummary {
                id: info.id.clone(),
                names: info.names.clone(),
            })
            .collect();
        running.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(running)
    }

    async fn inspect(&self, container_id: &str) -> Result<Option<ContainerInfo>, RuntimeError> {
        let mut state = self.state.lock().unwrap();
        state.inspect_calls += 1;
        let Some(container) = state.containers.get_mut(container_id) else {
            return Ok(None);
        };
        if container.failing_inspects > 0 {
            container.failing_inspects -= 1;
            return Err(RuntimeError::Malformed("inspect timed out".to_string()));
        }
        Ok(container.info.clone())
    }

    fn logs(
        &self,
        container_id: &str,
        since: &Position,
    ) -> BoxStream<'static, Result<LogFrame, RuntimeError>> {
        let (lines, end) = self.with_container(container_id, |c| {
            c.requested_since.push(*since);
            let from = since.since_seconds * 1_000_000_000;
            let lines: Vec<LogFrame> = c
                .lines
                .iter()
                .filter(|l| l.timestamp_nanos.is_none_or(|ts| ts >= from))
                .cloned()
                .collect();
            (lines, c.sessions.pop_front().unwrap_or(SessionEnd::Hang))
        });

        let replay = |lines: Vec<LogFrame>| stream::iter(lines.into_iter().map(Ok::<LogFrame, RuntimeError>));

        match end {
            SessionEnd::FailAfter(n) => replay(lines.into_iter().take(n).collect())
                .chain(stream::once(async {
                    Err(RuntimeError::Malformed("connection reset".to_string()))
                }))
                .boxed(),
            SessionEnd::Close => replay(lines).boxed(),
            SessionEnd::Stop | SessionEnd::Remove => {
                let state = Arc::clone(&self.state);
                let id = container_id.to_string();
                replay(lines)
                    .chain(
                        stream::once(async move {
                            let mut state = state.lock().unwrap();
                            if let Some(c) = state.containers.get_mut(&id) {
                                if end == SessionEnd::Remove {
                                    c.info = None;
                                } else if let Some(info) = c.info.as_mut() {
                                    info.running = false;
                                }
                            }
                        })
                        .filter_map(|_| async { None::<Result<LogFrame, RuntimeError>> }),
                    )
                    .boxed()
            }
            SessionEnd::Hang => replay(lines).chain(stream::pending()).boxed(),
        }
    }

    async fn subscribe(
        &self,
        since: DateTime<Utc>,
    ) -> Result<BoxStream<'static, Result<LifecycleEvent, RuntimeError>>, RuntimeError> {
        let mut state = self.state.lock().unwrap();
        state.call_order.push("subscribe");
        if state.fail_subscribe {
            return Err(RuntimeError::Malformed("connection refused".to_string()));
        }
        state.subscribed_since.push(since);
        let (tx, rx) = unbounded();
        state.subscribers.push(tx);
        Ok(rx.boxed())
    }
}
