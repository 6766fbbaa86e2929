use log::{error, info};
use tokio::io::{AsyncWrite, AsyncWriteExt, BufWriter};
use tokio::sync::mpsc::Receiver;

use crate::event::LogEvent;

/// Drains the event channel and writes each event as one JSON line.
pub struct JsonLinesSink<W> {
    rx: Receiver<LogEvent>,
    out: BufWriter<W>,
    written: u64,
}

pub type StdoutSink = JsonLinesSink<tokio::io::Stdout>;

impl StdoutSink {
    pub fn stdout(rx: Receiver<LogEvent>) -> Self {
        Self::new(rx, tokio::io::stdout())
    }
}

impl<W: AsyncWrite + Unpin> JsonLinesSink<W> {
    pub fn new(rx: Receiver<LogEvent>, out: W) -> Self {
        Self {
            rx,
            out: BufWriter::new(out),
            written: 0,
        }
    }

    /// Runs until every sender is dropped. Returns the writer.
    pub async fn run(mut self) -> W {
        info!("Output sink started");
        while let Some(event) = self.rx.recv().await {
            if let Err(e) = self.write_event(&event).await {
                error!("Failed to write event {}: {}", event.event_id, e);
                continue;
            }
            self.written += 1;
            // Only flush once the backlog is drained
            if self.rx.is_empty() {
                if let Err(e) = self.out.flush().await {
                    error!("Failed to flush output: {}", e);
                }
            }
        }
        if let Err(e) = self.out.flush().await {
            error!("Failed to flush output: {}", e);
        }
        info!("Output sink stopped after {} event(s)", self.written);
        self.out.into_inner()
    }

    async fn write_event(&mut self, event: &LogEvent) -> std::io::Result<()> {
        let mut line = serde_json::to_vec(event)?;
        line.push(b'\n');
        self.out.write_all(&line).await
    }
}
