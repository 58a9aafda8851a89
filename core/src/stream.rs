// Live log streaming sessions
//
// The backend has no push primitive available to this tier, so a live tail
// is a poll-and-forward loop: each session polls the query engine on a fixed
// interval and forwards new entries over an mpsc channel that the SSE layer
// drains. The session's high-water mark (`last_poll`) bounds every poll
// window, so an entry is delivered at most once; entries the backend inserts
// retroactively behind the mark are missed, which is an accepted limitation
// of the polling design.

use crate::config::StreamConfig;
use crate::logs::{LogEntry, LogFilter};
use crate::query::QueryEngine;
use chrono::{DateTime, Utc};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tracing::{debug, info, warn};

const SESSION_CHANNEL_CAPACITY: usize = 100;

/// Per-subscriber session state, owned by its poll task only
struct StreamSession {
    script_name: Option<String>,
    /// Latest timestamp already delivered; next poll starts here
    last_poll: DateTime<Utc>,
}

/// Manages one poll loop per connected log subscriber
pub struct LogStreamManager {
    engine: Arc<QueryEngine>,
    config: StreamConfig,
    active: Arc<AtomicUsize>,
}

impl LogStreamManager {
    pub fn new(engine: Arc<QueryEngine>, config: StreamConfig) -> Self {
        Self {
            engine,
            config,
            active: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Number of currently connected subscribers
    pub fn active_sessions(&self) -> usize {
        self.active.load(Ordering::Relaxed)
    }

    /// Open a streaming session.
    ///
    /// `script_name = None` tails every worker. The returned stream yields
    /// entries oldest-first within each poll batch and stays open until the
    /// receiver is dropped, at which point the poll task exits on its next
    /// send attempt and releases the session.
    pub fn open(&self, script_name: Option<String>) -> ReceiverStream<LogEntry> {
        let (tx, rx) = mpsc::channel(SESSION_CHANNEL_CAPACITY);

        let engine = Arc::clone(&self.engine);
        let active = Arc::clone(&self.active);
        let poll_interval = std::time::Duration::from_millis(self.config.poll_interval_ms);
        let poll_limit = self.config.poll_limit;

        let mut session = StreamSession {
            script_name,
            last_poll: Utc::now(),
        };

        active.fetch_add(1, Ordering::Relaxed);
        info!(
            target: "stream",
            script = session.script_name.as_deref().unwrap_or("all"),
            "Log stream session opened"
        );

        tokio::spawn(async move {
            let mut interval = tokio::time::interval(poll_interval);
            // Consume the immediate first tick; the first real poll happens
            // one interval after connect.
            interval.tick().await;

            loop {
                interval.tick().await;

                let until = Utc::now();
                let mut filter = LogFilter::window(session.last_poll, until);
                filter.script_name = session.script_name.clone();
                filter.limit = poll_limit;

                match engine.query(&filter).await {
                    Ok(entries) => {
                        // A live tail appends chronologically, so reverse
                        // the engine's newest-first ordering.
                        let mut gone = false;
                        for entry in entries.into_iter().rev() {
                            if tx.send(entry).await.is_err() {
                                gone = true;
                                break;
                            }
                        }
                        // The window is consumed even when empty; the mark
                        // only ever moves forward.
                        session.last_poll = until;
                        if gone {
                            break;
                        }
                    }
                    Err(e) => {
                        // Skip forwarding, keep the session; silence beats an
                        // error frame for a transient poll failure.
                        warn!(target: "stream", error = %e, "Poll failed, retrying next interval");
                    }
                }

                if tx.is_closed() {
                    break;
                }
            }

            active.fetch_sub(1, Ordering::Relaxed);
            debug!(
                target: "stream",
                script = session.script_name.as_deref().unwrap_or("all"),
                "Log stream session closed"
            );
        });

        ReceiverStream::new(rx)
    }
}
