//! Batched log shipping
//!
//! Each running job gets one shipper task. Lines arrive on an unbounded
//! channel from the supervisor's reader, are batched, and flushed every
//! few seconds in emission order. When the server is unreachable the
//! backlog is bounded: the oldest batches are dropped and counted.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use trainforge_proto::{LogBatch, LogLine};

use crate::client::ApiClient;

/// Flush cadence
pub const FLUSH_INTERVAL: Duration = Duration::from_secs(3);
/// Flush early once this many lines are buffered
pub const FLUSH_THRESHOLD: usize = 200;
/// Batches retained while the server is unreachable
pub const MAX_BACKLOG: usize = 50;

/// Handle to a per-job shipper task
pub struct LogShipper {
    task: JoinHandle<u64>,
}

impl LogShipper {
    /// Spawn the shipper. It exits after a final flush once every sender
    /// for `lines` is dropped.
    pub fn spawn(
        client: Arc<ApiClient>,
        job_id: String,
        lines: mpsc::UnboundedReceiver<String>,
    ) -> Self {
        let task = tokio::spawn(run(client, job_id, lines));
        Self { task }
    }

    /// Wait for the final flush; returns the number of dropped batches.
    pub async fn finish(self) -> u64 {
        self.task.await.unwrap_or(0)
    }
}

async fn run(
    client: Arc<ApiClient>,
    job_id: String,
    mut lines: mpsc::UnboundedReceiver<String>,
) -> u64 {
    let mut buffer: Vec<LogLine> = Vec::new();
    let mut backlog: VecDeque<LogBatch> = VecDeque::new();
    let mut dropped: u64 = 0;
    let mut interval = tokio::time::interval(FLUSH_INTERVAL);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            line = lines.recv() => match line {
                Some(message) => {
                    buffer.push(LogLine::new(message));
                    if buffer.len() >= FLUSH_THRESHOLD {
                        flush(&client, &job_id, &mut buffer, &mut backlog, &mut dropped).await;
                    }
                }
                None => break,
            },
            _ = interval.tick() => {
                flush(&client, &job_id, &mut buffer, &mut backlog, &mut dropped).await;
            }
        }
    }

    flush(&client, &job_id, &mut buffer, &mut backlog, &mut dropped).await;
    if dropped > 0 {
        warn!(job_id, dropped, "log batches were dropped under sustained failure");
    }
    dropped
}

/// Move the buffer into the backlog, then ship from the front so order is
/// preserved. On failure the remaining backlog is kept, oldest-dropped
/// once it exceeds the bound.
async fn flush(
    client: &ApiClient,
    job_id: &str,
    buffer: &mut Vec<LogLine>,
    backlog: &mut VecDeque<LogBatch>,
    dropped: &mut u64,
) {
    if !buffer.is_empty() {
        backlog.push_back(LogBatch {
            logs: std::mem::take(buffer),
        });
    }

    while let Some(batch) = backlog.front() {
        match client.ship_logs(job_id, batch).await {
            Ok(()) => {
                backlog.pop_front();
            }
            Err(e) => {
                debug!(job_id, "log batch flush failed: {}", e);
                while backlog.len() > MAX_BACKLOG {
                    backlog.pop_front();
                    *dropped += 1;
                }
                break;
            }
        }
    }
}
