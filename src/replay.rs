use std::time::Duration;

use tokio::io::{AsyncBufRead, AsyncBufReadExt};
use tokio::sync::broadcast;
use tokio::time::Instant;
use tracing::{info, warn};

use nexus_broker::Broker;
use nexus_core::events::BrokerEvent;
use nexus_core::messages::Message;

const POLL_INTERVAL: Duration = Duration::from_millis(25);

/// Tally of one replay pass.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ReplayStats {
    pub sent: usize,
    pub rejected: usize,
    pub malformed: usize,
}

/// Feed newline-delimited JSON messages through the broker. Blank lines are
/// skipped; bad lines are logged and counted, never fatal.
pub async fn replay<R>(broker: &Broker, reader: R) -> std::io::Result<ReplayStats>
where
    R: AsyncBufRead + Unpin,
{
    let mut stats = ReplayStats::default();
    let mut lines = reader.lines();
    let mut line_no = 0usize;

    while let Some(line) = lines.next_line().await? {
        line_no += 1;
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let message: Message = match serde_json::from_str(line) {
            Ok(message) => message,
            Err(e) => {
                warn!(line = line_no, error = %e, "skipping malformed message");
                stats.malformed += 1;
                continue;
            }
        };
        match broker.send(message).await {
            Ok(()) => stats.sent += 1,
            Err(e) => {
                warn!(line = line_no, error = %e, kind = e.error_kind(), "message rejected");
                stats.rejected += 1;
            }
        }
    }

    info!(
        sent = stats.sent,
        rejected = stats.rejected,
        malformed = stats.malformed,
        "replay finished"
    );
    Ok(stats)
}

/// Wait until nothing is running or queued, giving pending collection
/// buffers one debounce window to flush first. Returns false on timeout.
pub async fn wait_idle(broker: &Broker, limit: Duration) -> bool {
    let deadline = Instant::now() + limit;
    let settle = broker.config().collect_debounce() + POLL_INTERVAL;
    tokio::time::sleep(settle.min(limit)).await;

    loop {
        let snapshot = broker.snapshot();
        if snapshot.running.is_empty() && snapshot.queue_depths.is_empty() {
            return true;
        }
        if Instant::now() >= deadline {
            warn!(
                running = snapshot.running.len(),
                queued = snapshot.queue_depths.len(),
                "broker still busy at drain deadline"
            );
            return false;
        }
        tokio::time::sleep(POLL_INTERVAL).await;
    }
}

/// Print every broker event to stdout as one JSON line.
pub async fn print_events(mut rx: broadcast::Receiver<BrokerEvent>) {
    loop {
        match rx.recv().await {
            Ok(event) => match serde_json::to_string(&event) {
                Ok(line) => println!("{line}"),
                Err(e) => warn!(error = %e, "failed to encode event"),
            },
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                warn!(skipped, "event printer lagged");
            }
            Err(broadcast::error::RecvError::Closed) => return,
        }
    }
}
