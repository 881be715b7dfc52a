//! One APRS-IS session and its reconnect supervisor.
//!
//! A session owns a single TCP connection: it authenticates, exchanges
//! keepalives, filters the inbound line stream down to packets the
//! gateway should handle, routes acknowledgements to the outbox, and
//! drains the shared outbound queue onto the wire. Any I/O failure is
//! fatal to the session; the supervisor loop in [`AprsClient::run`]
//! reconnects with exponential backoff.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use chrono::Utc;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, Mutex};
use tokio::time::{timeout, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::metrics::IngestHealth;
use crate::outbox::{Outbox, OutboundFrame};
use crate::packet::{Address, Packet};

/// Client identification sent on the auth line.
pub const CLIENT_NAME: &str = env!("CARGO_PKG_NAME");
pub const CLIENT_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Growth factor applied to the reconnect delay after each failure.
pub const RECONNECT_EXP: f64 = 1.4;

/// Configuration for a single APRS-IS session.
#[derive(Debug, Clone)]
pub struct AprsClientConfig {
    /// APRS-IS server hostname.
    pub server: String,
    /// APRS-IS server port.
    pub port: u16,
    /// Callsign this gateway authenticates and filters as.
    pub callsign: String,
    /// Server-side filter expression.
    pub filter: String,
    /// Cadence of client keepalive comments.
    pub keep_alive_interval: Duration,
    /// Dial timeout, and how long the server may stay silent before the
    /// connection is declared dead.
    pub connection_timeout: Duration,
    /// Reconnect backoff floor (also the post-traffic reset value).
    pub reconnect_delay_min: Duration,
    /// Reconnect backoff ceiling.
    pub reconnect_delay_max: Duration,
}

impl Default for AprsClientConfig {
    fn default() -> Self {
        Self {
            server: "noam.aprs2.net".to_string(),
            port: 14580,
            callsign: "N0CALL".to_string(),
            filter: String::new(),
            keep_alive_interval: Duration::from_secs(30),
            connection_timeout: Duration::from_secs(120),
            reconnect_delay_min: Duration::from_millis(500),
            reconnect_delay_max: Duration::from_secs(30),
        }
    }
}

/// Builder pattern for session configurations.
pub struct AprsClientConfigBuilder {
    config: AprsClientConfig,
}

impl AprsClientConfigBuilder {
    pub fn new() -> Self {
        Self {
            config: AprsClientConfig::default(),
        }
    }

    pub fn server<S: Into<String>>(mut self, server: S) -> Self {
        self.config.server = server.into();
        self
    }

    pub fn port(mut self, port: u16) -> Self {
        self.config.port = port;
        self
    }

    pub fn callsign<S: Into<String>>(mut self, callsign: S) -> Self {
        self.config.callsign = callsign.into();
        self
    }

    pub fn filter<S: Into<String>>(mut self, filter: S) -> Self {
        self.config.filter = filter.into();
        self
    }

    pub fn keep_alive_interval(mut self, interval: Duration) -> Self {
        self.config.keep_alive_interval = interval;
        self
    }

    pub fn connection_timeout(mut self, timeout: Duration) -> Self {
        self.config.connection_timeout = timeout;
        self
    }

    pub fn reconnect_delays(mut self, min: Duration, max: Duration) -> Self {
        self.config.reconnect_delay_min = min;
        self.config.reconnect_delay_max = max;
        self
    }

    pub fn build(self) -> AprsClientConfig {
        self.config
    }
}

impl Default for AprsClientConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// One supervised APRS-IS connection.
pub struct AprsClient {
    config: AprsClientConfig,
    inbound_tx: mpsc::Sender<Packet>,
    outbox: Outbox,
    health: IngestHealth,
    reconnect_delay: Duration,
}

impl AprsClient {
    pub fn new(
        config: AprsClientConfig,
        inbound_tx: mpsc::Sender<Packet>,
        outbox: Outbox,
        health: IngestHealth,
    ) -> Self {
        let reconnect_delay = config.reconnect_delay_min;
        Self {
            config,
            inbound_tx,
            outbox,
            health,
            reconnect_delay,
        }
    }

    /// Supervisor loop: run connections until cancelled, backing off
    /// exponentially between failures. The backoff resets to the floor
    /// whenever a connection produces a line, so only links that never
    /// handshake keep escalating.
    pub async fn run(mut self, cancel: CancellationToken) {
        while !cancel.is_cancelled() {
            match self.one_connection(&cancel).await {
                Ok(()) => {
                    info!("disconnected from server");
                    break;
                }
                Err(e) => {
                    error!("disconnected from server: {e:#}");
                }
            }

            info!("reconnecting after delay of {:?}", self.reconnect_delay);
            sleep_cancellable(&cancel, self.reconnect_delay).await;
            self.reconnect_delay = next_reconnect_delay(
                self.reconnect_delay,
                self.config.reconnect_delay_max,
            );
        }
    }

    /// One TCP connection from dial to fatal error (or cancellation,
    /// which returns `Ok`).
    async fn one_connection(&mut self, cancel: &CancellationToken) -> Result<()> {
        let addr = format!("{}:{}", self.config.server, self.config.port);
        info!("connecting to {addr}");
        let stream = timeout(self.config.connection_timeout, TcpStream::connect(&addr))
            .await
            .map_err(|_| anyhow!("dial {addr} timed out"))?
            .with_context(|| format!("dial {addr}"))?;
        let remote = stream
            .peer_addr()
            .map(|a| a.to_string())
            .unwrap_or_else(|_| addr.clone());

        let (reader, mut writer) = stream.into_split();
        let mut lines = BufReader::new(reader).lines();

        // The auth line is written exactly once per TCP connection.
        let auth = build_auth_line(&self.config)?;
        writer.write_all(auth.as_bytes()).await.context("auth write")?;
        writer.flush().await.context("auth flush")?;
        info!(%remote, "connection established");
        metrics::gauge!("aprs.connection.connected").increment(1.0);
        let result = self.connection_loop(cancel, &mut lines, &mut writer).await;
        metrics::gauge!("aprs.connection.connected").decrement(1.0);
        result
    }

    /// Event loop over the five things a live connection can observe:
    /// cancellation, the keepalive transmit tick, the receive-silence
    /// deadline, an inbound line, and an outbound frame.
    async fn connection_loop(
        &mut self,
        cancel: &CancellationToken,
        lines: &mut tokio::io::Lines<SessionReader>,
        writer: &mut OwnedWriteHalf,
    ) -> Result<()> {
        let outbound = self.outbox.outbound();
        let mut keepalive_tx = tokio::time::interval(self.config.keep_alive_interval);
        keepalive_tx.tick().await; // First tick completes immediately.
        let keepalive_rx = tokio::time::sleep(self.config.connection_timeout);
        tokio::pin!(keepalive_rx);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    return Ok(());
                }

                _ = keepalive_tx.tick() => {
                    let line = format!(
                        "# {} keepalive {}\n",
                        CLIENT_NAME,
                        Utc::now().to_rfc3339()
                    );
                    writer
                        .write_all(line.as_bytes())
                        .await
                        .context("keepalive transmit failed")?;
                }

                _ = &mut keepalive_rx => {
                    bail!("timed out waiting for keepalive from server");
                }

                line = lines.next_line() => {
                    let line = line
                        .context("receive error")?
                        .ok_or_else(|| anyhow!("connection closed by server"))?;
                    keepalive_rx
                        .as_mut()
                        .reset(Instant::now() + self.config.connection_timeout);
                    // Any traffic proves the link works; restart the
                    // backoff schedule from the floor.
                    self.reconnect_delay = self.config.reconnect_delay_min;
                    self.health.mark_line();
                    self.handle_line(line.trim()).await?;
                }

                frame = next_outbound(&outbound) => {
                    let Some(frame) = frame else {
                        // Outbox gone; shutdown is in progress.
                        return Ok(());
                    };
                    self.transmit(writer, frame).await?;
                }
            }
        }
    }

    /// Classifies one inbound line and either discards it, routes an
    /// ACK to the outbox, or publishes the packet.
    async fn handle_line(&self, line: &str) -> Result<()> {
        if line.is_empty() {
            return Ok(());
        }
        if line.starts_with('#') {
            debug!("server comment: {line}");
            return Ok(());
        }

        let packet: Packet = match line.parse() {
            Ok(packet) => packet,
            Err(e) => {
                warn!("ignored invalid packet: {line:?}: {e}");
                metrics::counter!("aprs.packets.invalid").increment(1);
                return Ok(());
            }
        };
        debug!("RECEIVE: {}", packet.raw);

        // Running several sessions against the same filter means we may
        // pick up our own transmissions.
        if packet.source.to_string() == self.config.callsign {
            debug!("ignored our own packet");
            return Ok(());
        }
        if let Some(to) = &packet.addressee {
            if to.to_string() != self.config.callsign {
                debug!("message to {to} is not intended for us, dropped");
                return Ok(());
            }
        }

        if packet.is_ack() {
            match packet.ack_number() {
                Some(number) => {
                    debug!("ack packet for message #{number}");
                    self.outbox.ack(number).await;
                }
                None => warn!("failed to extract ack number: {:?}", packet.raw),
            }
            return Ok(());
        }

        metrics::counter!("aprs.packets.received").increment(1);
        if self.inbound_tx.send(packet).await.is_err() {
            bail!("inbound consumer gone");
        }
        Ok(())
    }

    async fn transmit(&self, writer: &mut OwnedWriteHalf, frame: OutboundFrame) -> Result<()> {
        let line = format!(
            "{}>APRS,WIDE::{} : {}{{{}\n",
            self.config.callsign,
            frame.addressee.message_addressee_field(),
            frame.text,
            frame.id
        );
        debug!("SEND: {}", line.trim_end());
        writer
            .write_all(line.as_bytes())
            .await
            .context("packet write")?;
        Ok(())
    }
}

/// Draws the next outbound frame from the queue all sessions share.
/// Whichever session is idle first takes the message.
async fn next_outbound(
    outbound: &Arc<Mutex<mpsc::Receiver<OutboundFrame>>>,
) -> Option<OutboundFrame> {
    outbound.lock().await.recv().await
}

/// `user <CALL> pass <SECRET> vers <NAME> <VERSION> filter <FILTER>`
fn build_auth_line(config: &AprsClientConfig) -> Result<String> {
    let call: Address = config
        .callsign
        .parse()
        .with_context(|| format!("invalid callsign {:?}", config.callsign))?;
    Ok(format!(
        "user {} pass {} vers {} {} filter {}\n",
        config.callsign,
        call.passcode(),
        CLIENT_NAME,
        CLIENT_VERSION,
        config.filter
    ))
}

/// Escalates the reconnect delay, saturating at `max`.
fn next_reconnect_delay(current: Duration, max: Duration) -> Duration {
    let next = current.mul_f64(RECONNECT_EXP);
    if next > max { max } else { next }
}

/// Sleep that wakes early on cancellation.
async fn sleep_cancellable(cancel: &CancellationToken, duration: Duration) {
    tokio::select! {
        _ = cancel.cancelled() => {}
        _ = tokio::time::sleep(duration) => {}
    }
}

/// Line-framed reader over the receive half of the socket.
type SessionReader = BufReader<OwnedReadHalf>;
