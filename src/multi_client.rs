//! Redundant APRS-IS connectivity with fan-in deduplication.
//!
//! Several supervised sessions run against the same (rotating) server
//! name; their receive streams merge into one channel, and a sliding
//! window over packet content hashes drops the duplicates the
//! redundancy creates. The first arrival of a packet wins; later copies
//! from slower paths are discarded silently.

use std::collections::HashMap;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, Instrument};

use crate::aprs_client::{AprsClient, AprsClientConfig};
use crate::metrics::IngestHealth;
use crate::outbox::Outbox;
use crate::packet::Packet;

/// How long a packet hash stays in the dedup window. Must exceed the
/// worst-case arrival skew between APRS-IS mirrors; an hour is
/// comfortably conservative.
pub const DEDUP_HISTORY: Duration = Duration::from_secs(60 * 60);

/// Delay between supervisor starts, so concurrent dials against a
/// rotating DNS name are less likely to all land on one server.
const START_STAGGER: Duration = Duration::from_secs(1);

/// Sliding-window duplicate detector keyed by packet content hash.
/// Expired entries are swept on every check.
pub struct DedupWindow {
    window: Duration,
    history: HashMap<String, Instant>,
}

impl DedupWindow {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            history: HashMap::new(),
        }
    }

    /// Records a sighting of `hash` and reports whether it was already
    /// seen inside the window.
    pub fn check(&mut self, hash: &str) -> bool {
        let now = Instant::now();
        self.history
            .retain(|_, seen_at| now.duration_since(*seen_at) <= self.window);
        self.history.insert(hash.to_owned(), now).is_some()
    }

    pub fn len(&self) -> usize {
        self.history.len()
    }

    pub fn is_empty(&self) -> bool {
        self.history.is_empty()
    }
}

/// A set of supervised sessions merged into one deduplicated stream.
pub struct MultiClient {
    clients: Vec<(AprsClient, mpsc::Receiver<Packet>)>,
    health: IngestHealth,
    window: Duration,
}

impl MultiClient {
    /// Builds `channels` identically-configured clients sharing one
    /// outbox and one health signal.
    pub fn new(config: AprsClientConfig, channels: usize, outbox: Outbox) -> Self {
        Self::with_dedup_window(config, channels, outbox, DEDUP_HISTORY)
    }

    pub fn with_dedup_window(
        config: AprsClientConfig,
        channels: usize,
        outbox: Outbox,
        window: Duration,
    ) -> Self {
        let health = IngestHealth::default();
        let clients = (0..channels)
            .map(|_| {
                let (inbound_tx, inbound_rx) = mpsc::channel(1);
                let client = AprsClient::new(
                    config.clone(),
                    inbound_tx,
                    outbox.clone(),
                    health.clone(),
                );
                (client, inbound_rx)
            })
            .collect();
        Self {
            clients,
            health,
            window,
        }
    }

    /// Receive-path liveness across all sessions.
    pub fn health(&self) -> IngestHealth {
        self.health.clone()
    }

    /// Starts every supervisor plus the merge/dedup loop, and returns
    /// the deduplicated upstream receiver. The upstream channel closes
    /// once cancellation has propagated and all supervisors have
    /// terminated.
    pub fn run(self, cancel: CancellationToken) -> mpsc::Receiver<Packet> {
        let (upstream_tx, upstream_rx) = mpsc::channel(1);
        let MultiClient {
            clients,
            health: _,
            window,
        } = self;

        tokio::spawn(
            async move {
                info!("connecting on {} concurrent channels", clients.len());

                let (merge_tx, mut merge_rx) = mpsc::channel::<Packet>(1);
                let mut supervisors: Vec<JoinHandle<()>> = Vec::new();
                for (index, (client, mut inbound_rx)) in clients.into_iter().enumerate() {
                    supervisors.push(tokio::spawn(
                        client
                            .run(cancel.clone())
                            .instrument(tracing::info_span!("session", index)),
                    ));

                    let merge_tx = merge_tx.clone();
                    tokio::spawn(async move {
                        while let Some(packet) = inbound_rx.recv().await {
                            if merge_tx.send(packet).await.is_err() {
                                break;
                            }
                        }
                    });

                    sleep_cancellable(&cancel, START_STAGGER).await;
                }
                drop(merge_tx);

                let mut dedup = DedupWindow::new(window);
                loop {
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        packet = merge_rx.recv() => {
                            let Some(packet) = packet else { break };
                            if dedup.check(&packet.hash()) {
                                debug!("dropped duplicate packet");
                                metrics::counter!("aprs.dedup.dropped").increment(1);
                            } else if upstream_tx.send(packet).await.is_err() {
                                break;
                            }
                        }
                    }
                }

                for supervisor in supervisors {
                    let _ = supervisor.await;
                }
                // upstream_tx drops here; downstream sees end-of-stream.
            }
            .instrument(tracing::info_span!("multi_client")),
        );

        upstream_rx
    }
}

/// Sleep that wakes early on cancellation.
async fn sleep_cancellable(cancel: &CancellationToken, duration: Duration) {
    tokio::select! {
        _ = cancel.cancelled() => {}
        _ = tokio::time::sleep(duration) => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn first_sighting_passes_repeat_drops() {
        let mut dedup = DedupWindow::new(Duration::from_secs(60));
        assert!(!dedup.check("abc"));
        assert!(dedup.check("abc"));
        assert!(!dedup.check("def"));
        assert_eq!(dedup.len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn entries_expire_after_window() {
        let mut dedup = DedupWindow::new(Duration::from_secs(60));
        assert!(!dedup.check("abc"));

        tokio::time::advance(Duration::from_secs(61)).await;

        // The expired entry is evicted, so the packet passes again.
        assert!(!dedup.check("abc"));
        assert_eq!(dedup.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn sweep_only_evicts_stale_entries() {
        let mut dedup = DedupWindow::new(Duration::from_secs(60));
        assert!(!dedup.check("old"));

        tokio::time::advance(Duration::from_secs(40)).await;
        assert!(!dedup.check("new"));

        tokio::time::advance(Duration::from_secs(30)).await;
        // "old" is now 70s stale; "new" is 30s old and still held.
        assert!(!dedup.check("old"));
        assert!(dedup.check("new"));
    }
}
