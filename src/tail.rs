//! Per-container log tailing.
//!
//! A tail task attaches to the output of one container at its stored
//! checkpoint, forwards every new frame to the shared event channel and
//! commits the checkpoint whenever the runtime has no further frame ready.
//! When the stream ends it asks the runtime whether the container is still
//! running: if so it waits `retry_interval` and attaches again, otherwise it
//! exits.

use std::{collections::VecDeque, sync::Arc, time::Duration};

use futures_util::{FutureExt, StreamExt};
use tokio::sync::mpsc::Sender;
use tokio_util::sync::CancellationToken;

use crate::checkpoint::{CheckpointStore, Position};
use crate::event::LogEvent;
use crate::pool::TaskLease;
use crate::runtime::{ContainerRuntime, RuntimeError};

const NANOS_PER_SECOND: i64 = 1_000_000_000;

/// The replay boundary trails the newest frame by this much, so a frame of
/// the other stream stamped slightly earlier is still replayed.
const BOUNDARY_LAG_SECONDS: i64 = 1;

/// Commit at least this often while frames keep arriving back to back.
const MAX_UNCOMMITTED: usize = 256;

/// Why a tail task stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TailExit {
    /// The container stopped or was removed.
    ContainerGone,
    Cancelled,
    /// Nobody is receiving events anymore.
    SinkClosed,
}

enum StreamEnd {
    Failed(RuntimeError),
    Closed,
    SinkClosed,
    Cancelled,
}

/// Read position within one attachment to a log stream.
///
/// The runtime replays everything stamped from `since_seconds` on, in
/// stream order, so the first `frames` frames of an attachment are dropped
/// whatever their timestamps. Every emitted frame at or past the boundary
/// is counted, and the boundary follows the newest frame at a distance of
/// [`BOUNDARY_LAG_SECONDS`].
#[derive(Debug)]
struct Cursor {
    position: Position,
    /// Replayed frames still to drop.
    to_skip: u64,
    /// Stamps of the frames counted in `position.frames`, in stream order.
    counted: VecDeque<i64>,
    newest: i64,
}

impl Cursor {
    fn new(position: Position) -> Self {
        Self {
            position,
            to_skip: position.frames,
            counted: VecDeque::new(),
            newest: position.since_seconds.saturating_mul(NANOS_PER_SECOND),
        }
    }

    fn stamp(&mut self, timestamp_nanos: Option<i64>) -> i64 {
        // Unstamped frames are taken to be as new as the newest one seen
        let ts = timestamp_nanos.unwrap_or(self.newest);
        self.newest = self.newest.max(ts);
        ts
    }

    /// Whether a frame was not emitted by an earlier attachment.
    fn admit(&mut self, timestamp_nanos: Option<i64>) -> bool {
        if self.to_skip == 0 {
            return true;
        }
        let ts = self.stamp(timestamp_nanos);
        self.counted.push_back(ts);
        self.to_skip -= 1;
        false
    }

    /// Account for an emitted frame. Returns whether the position moved.
    fn advance(&mut self, timestamp_nanos: Option<i64>) -> bool {
        let ts = self.stamp(timestamp_nanos);
        let mut moved = false;

        // Frames below the boundary are not replayed by the next attachment
        if ts >= self.position.since_seconds.saturating_mul(NANOS_PER_SECOND) {
            self.counted.push_back(ts);
            self.position.frames += 1;
            moved = true;
        }

        let since = self.newest.div_euclid(NANOS_PER_SECOND) - BOUNDARY_LAG_SECONDS;
        if since > self.position.since_seconds {
            let boundary = since.saturating_mul(NANOS_PER_SECOND);
            self.counted.retain(|&ts| ts >= boundary);
            self.position = Position {
                since_seconds: since,
                frames: self.counted.len() as u64,
            };
            moved = true;
        }
        moved
    }
}

pub struct TailTask {
    pub container_id: String,
    pub container_name: String,
    pub host: String,
    pub runtime: Arc<dyn ContainerRuntime>,
    pub store: Arc<CheckpointStore>,
    pub events: Sender<LogEvent>,
    pub retry_interval: Duration,
}

impl TailTask {
    pub async fn run(self, mut lease: TaskLease, cancel: CancellationToken) -> TailExit {
        log::info!(
            "Tailing container {} ({})",
            self.container_name,
            short_id(&self.container_id)
        );

        let exit = loop {
            match self.stream_once(&cancel).await {
                StreamEnd::Cancelled => break TailExit::Cancelled,
                StreamEnd::SinkClosed => break TailExit::SinkClosed,
                StreamEnd::Failed(e) => {
                    log::warn!("Log stream of {} failed: {}", self.container_name, e)
                }
                StreamEnd::Closed => {
                    log::debug!("Log stream of {} closed", self.container_name)
                }
            }

            let inspected = tokio::select! {
                _ = cancel.cancelled() => break TailExit::Cancelled,
                inspected = self.runtime.inspect(&self.container_id) => inspected,
            };

            match inspected {
                Ok(Some(info)) if info.running => {}
                Ok(_) => {
                    if lease.release() {
                        break TailExit::ContainerGone;
                    }
                    log::info!(
                        "Container {} was started again, reattaching",
                        self.container_name
                    );
                    continue;
                }
                Err(e) => {
                    log::warn!("Failed to inspect container {}: {}", self.container_name, e)
                }
            }

            log::info!(
                "Reattaching to {} in {:?}",
                self.container_name,
                self.retry_interval
            );
            tokio::select! {
                _ = cancel.cancelled() => break TailExit::Cancelled,
                _ = tokio::time::sleep(self.retry_interval) => {}
            }
        };

        match exit {
            TailExit::ContainerGone => {
                log::info!("Container {} is gone, stopped tailing", self.container_name)
            }
            TailExit::Cancelled => log::debug!("Tail of {} cancelled", self.container_name),
            TailExit::SinkClosed => log::warn!(
                "Event channel closed, stopped tailing {}",
                self.container_name
            ),
        }
        exit
    }

    async fn stream_once(&self, cancel: &CancellationToken) -> StreamEnd {
        let checkpoint = self.store.get(&self.container_id);
        if checkpoint.is_beginning() {
            log::debug!("Reading {} from the beginning", self.container_name);
        } else {
            log::debug!(
                "Resuming {} at {:?}",
                self.container_name,
                checkpoint
            );
        }

        let mut cursor = Cursor::new(checkpoint);
        let mut frames = self.runtime.logs(&self.container_id, &checkpoint);
        let mut uncommitted = 0;

        let end = loop {
            let next = match frames.next().now_or_never() {
                Some(next) => next,
                None => {
                    // Nothing buffered, a good moment to commit
                    self.commit(&cursor, &mut uncommitted).await;
                    tokio::select! {
                        _ = cancel.cancelled() => break StreamEnd::Cancelled,
                        next = frames.next() => next,
                    }
                }
            };

            let frame = match next {
                Some(Ok(frame)) => frame,
                Some(Err(e)) => break StreamEnd::Failed(e),
                None => break StreamEnd::Closed,
            };

            let ts = frame.timestamp_nanos;
            if !cursor.admit(ts) {
                continue;
            }

            let event =
                LogEvent::from_frame(&self.host, &self.container_id, &self.container_name, frame);
            let sent = tokio::select! {
                _ = cancel.cancelled() => break StreamEnd::Cancelled,
                sent = self.events.send(event) => sent,
            };
            if sent.is_err() {
                break StreamEnd::SinkClosed;
            }

            if cursor.advance(ts) {
                uncommitted += 1;
            }
            if uncommitted >= MAX_UNCOMMITTED {
                self.commit(&cursor, &mut uncommitted).await;
            }
        };

        self.commit(&cursor, &mut uncommitted).await;
        end
    }

    async fn commit(&self, cursor: &Cursor, uncommitted: &mut usize) {
        if *uncommitted == 0 {
            return;
        }
        *uncommitted = 0;
        if let Err(e) = self.store.set(&self.container_id, cursor.position).await {
            log::warn!(
                "Failed to commit checkpoint for {}: {}",
                self.container_name,
                e
            );
        }
    }
}

pub fn short_id(id: &str) -> &str {
    id.get(..12).unwrap_or(id)
}
