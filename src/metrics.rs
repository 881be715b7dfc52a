//! Prometheus metrics export and gateway health state.

use std::net::Ipv4Addr;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::Utc;
use metrics_exporter_prometheus::PrometheusBuilder;
use tracing::info;

/// Installs the Prometheus recorder with its built-in scrape endpoint.
///
/// Counters and gauges are pre-registered so they always appear in the
/// exposition output, even before the first event increments them.
pub fn init_metrics(port: u16) -> Result<()> {
    PrometheusBuilder::new()
        .with_http_listener((Ipv4Addr::UNSPECIFIED, port))
        .install()
        .context("failed to install Prometheus recorder")?;
    info!("metrics exporter listening on port {port}");

    metrics::gauge!("aprs.connection.connected").set(0.0);
    metrics::counter!("aprs.packets.received").absolute(0);
    metrics::counter!("aprs.packets.invalid").absolute(0);
    metrics::counter!("aprs.dedup.dropped").absolute(0);
    metrics::counter!("aprs.store.created").absolute(0);
    metrics::counter!("aprs.store.conflicts").absolute(0);
    metrics::counter!("aprs.outbox.attempts").absolute(0);
    metrics::counter!("aprs.outbox.acked").absolute(0);
    metrics::counter!("aprs.outbox.exhausted").absolute(0);
    Ok(())
}

/// Liveness signal for the receive path, shared by every session.
///
/// The gateway is healthy as long as at least one session has produced
/// a server line recently; which session does not matter.
#[derive(Clone, Default)]
pub struct IngestHealth {
    // Unix milliseconds of the most recent line; 0 means never.
    last_line_ms: Arc<AtomicI64>,
}

impl IngestHealth {
    pub fn mark_line(&self) {
        self.last_line_ms
            .store(Utc::now().timestamp_millis(), Ordering::Relaxed);
    }

    /// Time since any session last heard from a server, or `None` if no
    /// line has ever been received.
    pub fn last_line_age(&self) -> Option<Duration> {
        let at = self.last_line_ms.load(Ordering::Relaxed);
        if at == 0 {
            return None;
        }
        let age_ms = Utc::now().timestamp_millis().saturating_sub(at);
        Some(Duration::from_millis(age_ms.max(0) as u64))
    }

    pub fn healthy(&self, horizon: Duration) -> bool {
        self.last_line_age()
            .map(|age| age <= horizon)
            .unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn health_starts_unhealthy() {
        let health = IngestHealth::default();
        assert_eq!(health.last_line_age(), None);
        assert!(!health.healthy(Duration::from_secs(120)));
    }

    #[test]
    fn health_tracks_recent_lines() {
        let health = IngestHealth::default();
        health.mark_line();
        assert!(health.healthy(Duration::from_secs(120)));
        assert!(health.last_line_age().unwrap() < Duration::from_secs(5));
    }
}
