//! Reliable delivery of outbound APRS messages.
//!
//! The outbox assigns monotonic message IDs, retransmits on a timer
//! until the peer acknowledges, and retires messages after a bounded
//! number of attempts. All mutable state lives in a single worker task;
//! callers interact through channels, so no locking is visible at the
//! API surface. Sessions drain the shared outbound receiver: whichever
//! connection is idle first carries the next frame, which is also why a
//! retry is never pinned to the connection that previously failed.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio::time::{sleep, sleep_until, Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn, Instrument};

use crate::packet::Address;

/// How long between retransmissions of an unacknowledged message.
pub const ATTEMPT_INTERVAL: Duration = Duration::from_secs(30);
/// Transmissions per message before giving up.
pub const MAX_ATTEMPTS: u32 = 5;
/// The ID counter restarts at 1 after this long without a send.
pub const ID_RESET_INTERVAL: Duration = Duration::from_secs(48 * 60 * 60);

const EMPTY_CHECK_INTERVAL: Duration = Duration::from_secs(60);

/// One transmission, ready for a session to put on the wire.
#[derive(Debug, Clone, PartialEq)]
pub struct OutboundFrame {
    pub id: u32,
    pub addressee: Address,
    pub text: String,
}

/// Final disposition of a sent message, delivered through the
/// completion signal exactly once: either the peer acknowledged
/// (`received` true) or the attempt limit was reached.
#[derive(Debug, Clone)]
pub struct MessageReceipt {
    pub id: u32,
    pub addressee: Address,
    pub text: String,
    pub sent_at: DateTime<Utc>,
    pub last_sent_at: DateTime<Utc>,
    pub received: bool,
    pub received_at: Option<DateTime<Utc>>,
    pub attempts: u32,
}

/// Caller's side of the completion signal.
pub struct MessageHandle {
    done: oneshot::Receiver<MessageReceipt>,
}

impl MessageHandle {
    /// Waits for the message to be acknowledged or retired. Returns
    /// `None` when the outbox shut down first; in-flight messages are
    /// abandoned on cancellation rather than reported as failed.
    pub async fn wait(self) -> Option<MessageReceipt> {
        self.done.await.ok()
    }
}

struct SendRequest {
    addressee: Address,
    text: String,
    done: oneshot::Sender<MessageReceipt>,
}

struct PendingMessage {
    id: u32,
    addressee: Address,
    text: String,
    sent_at: DateTime<Utc>,
    last_sent_at: DateTime<Utc>,
    next_attempt_at: Instant,
    attempts: u32,
    done: Option<oneshot::Sender<MessageReceipt>>,
}

impl PendingMessage {
    fn receipt(&self, received: bool) -> MessageReceipt {
        MessageReceipt {
            id: self.id,
            addressee: self.addressee.clone(),
            text: self.text.clone(),
            sent_at: self.sent_at,
            last_sent_at: self.last_sent_at,
            received,
            received_at: received.then(Utc::now),
            attempts: self.attempts,
        }
    }
}

/// Handle to the outbox worker. Cheap to clone; every session holds one
/// for ACK delivery plus the shared outbound receiver.
#[derive(Clone)]
pub struct Outbox {
    send_tx: mpsc::Sender<SendRequest>,
    ack_tx: mpsc::Sender<u32>,
    outbound_rx: Arc<Mutex<mpsc::Receiver<OutboundFrame>>>,
}

impl Outbox {
    /// Spawns the worker task and returns the handle.
    pub fn spawn(cancel: CancellationToken) -> Self {
        let (send_tx, send_rx) = mpsc::channel(1);
        let (ack_tx, ack_rx) = mpsc::channel(16);
        let (outbound_tx, outbound_rx) = mpsc::channel(1);

        let worker = Worker {
            pending: HashMap::new(),
            id_gen: 1,
            outbound_tx,
        };
        tokio::spawn(
            worker
                .run(cancel, send_rx, ack_rx)
                .instrument(tracing::info_span!("outbox")),
        );

        Self {
            send_tx,
            ack_tx,
            outbound_rx: Arc::new(Mutex::new(outbound_rx)),
        }
    }

    /// Submits a message for delivery. Blocks until the worker accepts
    /// the submission; the returned handle resolves when the message
    /// reaches a terminal state.
    pub async fn send(&self, addressee: Address, text: String) -> MessageHandle {
        let (done_tx, done_rx) = oneshot::channel();
        let _ = self
            .send_tx
            .send(SendRequest {
                addressee,
                text,
                done: done_tx,
            })
            .await;
        MessageHandle { done: done_rx }
    }

    /// Reports an acknowledgement received from the wire. Unknown IDs
    /// are dropped by the worker; the message was most likely already
    /// acknowledged through another session.
    pub async fn ack(&self, id: u32) {
        let _ = self.ack_tx.send(id).await;
    }

    /// The shared outbound frame receiver sessions compete on.
    pub fn outbound(&self) -> Arc<Mutex<mpsc::Receiver<OutboundFrame>>> {
        self.outbound_rx.clone()
    }
}

struct Worker {
    pending: HashMap<u32, PendingMessage>,
    id_gen: u32,
    outbound_tx: mpsc::Sender<OutboundFrame>,
}

impl Worker {
    async fn run(
        mut self,
        cancel: CancellationToken,
        mut send_rx: mpsc::Receiver<SendRequest>,
        mut ack_rx: mpsc::Receiver<u32>,
    ) {
        let mut id_reset_at = Instant::now() + ID_RESET_INTERVAL;
        loop {
            let next_check = self.next_check();
            tokio::select! {
                _ = cancel.cancelled() => return,

                Some(request) = send_rx.recv() => {
                    id_reset_at = Instant::now() + ID_RESET_INTERVAL;
                    let id = self.id_gen;
                    self.id_gen += 1;
                    let now = Utc::now();
                    self.pending.insert(id, PendingMessage {
                        id,
                        addressee: request.addressee,
                        text: request.text,
                        sent_at: now,
                        last_sent_at: now,
                        next_attempt_at: Instant::now(),
                        attempts: 0,
                        done: Some(request.done),
                    });
                    self.attempt_message(id, &cancel).await;
                }

                Some(id) = ack_rx.recv() => {
                    let Some(mut message) = self.pending.remove(&id) else {
                        // Already retired, or a stale ID from before the
                        // last counter reset.
                        continue;
                    };
                    info!("acknowledged message #{id}");
                    metrics::counter!("aprs.outbox.acked").increment(1);
                    let receipt = message.receipt(true);
                    if let Some(done) = message.done.take() {
                        let _ = done.send(receipt);
                    }
                }

                _ = sleep(next_check) => {
                    let now = Instant::now();
                    let due: Vec<u32> = self
                        .pending
                        .values()
                        .filter(|message| message.next_attempt_at <= now)
                        .map(|message| message.id)
                        .collect();
                    for id in due {
                        self.attempt_message(id, &cancel).await;
                    }
                }

                _ = sleep_until(id_reset_at) => {
                    self.id_gen = 1;
                    // The deadline is one-shot: an elapsed instant
                    // resolves on every poll, so re-arm it here too,
                    // not only on send.
                    id_reset_at = Instant::now() + ID_RESET_INTERVAL;
                }
            }
        }
    }

    /// Transmits (or retires) one pending message. The push onto the
    /// outbound channel blocks while no session is ready to take it;
    /// the message stays owned here and the next timer fire re-attempts
    /// it.
    async fn attempt_message(&mut self, id: u32, cancel: &CancellationToken) {
        let Some(message) = self.pending.get_mut(&id) else {
            return;
        };
        message.last_sent_at = Utc::now();
        message.next_attempt_at = Instant::now() + ATTEMPT_INTERVAL;

        if message.attempts >= MAX_ATTEMPTS {
            let mut message = self.pending.remove(&id).expect("present above");
            warn!("exceeded retry count for message #{id}, discarding");
            metrics::counter!("aprs.outbox.exhausted").increment(1);
            let receipt = message.receipt(false);
            if let Some(done) = message.done.take() {
                let _ = done.send(receipt);
            }
            return;
        }

        message.attempts += 1;
        info!("sending message #{id} (attempt {})", message.attempts);
        metrics::counter!("aprs.outbox.attempts").increment(1);
        let frame = OutboundFrame {
            id,
            addressee: message.addressee.clone(),
            text: message.text.clone(),
        };
        tokio::select! {
            _ = cancel.cancelled() => {}
            _ = self.outbound_tx.send(frame) => {}
        }
    }

    /// Delay until the earliest pending retransmission, or a coarse
    /// idle interval when nothing is in flight.
    fn next_check(&self) -> Duration {
        self.pending
            .values()
            .map(|message| message.next_attempt_at)
            .min()
            .map(|at| at.saturating_duration_since(Instant::now()) + Duration::from_millis(1))
            .unwrap_or(EMPTY_CHECK_INTERVAL)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::Address;

    fn addressee() -> Address {
        "KI7QIV-7".parse().unwrap()
    }

    #[tokio::test(start_paused = true)]
    async fn acked_message_completes_on_first_attempt() {
        let cancel = CancellationToken::new();
        let outbox = Outbox::spawn(cancel.clone());
        let outbound = outbox.outbound();

        let handle = outbox.send(addressee(), "RX 3:04 PM".to_owned()).await;
        let frame = outbound.lock().await.recv().await.unwrap();
        assert_eq!(frame.id, 1);
        assert_eq!(frame.addressee, addressee());
        assert_eq!(frame.text, "RX 3:04 PM");

        outbox.ack(1).await;
        let receipt = handle.wait().await.unwrap();
        assert!(receipt.received);
        assert_eq!(receipt.attempts, 1);
        assert!(receipt.received_at.is_some());
        cancel.cancel();
    }

    #[tokio::test(start_paused = true)]
    async fn unacked_message_retries_then_exhausts() {
        let cancel = CancellationToken::new();
        let outbox = Outbox::spawn(cancel.clone());
        let outbound = outbox.outbound();

        let handle = outbox.send(addressee(), "hello".to_owned()).await;

        // Exactly MAX_ATTEMPTS transmissions reach the wire.
        for _ in 0..MAX_ATTEMPTS {
            let frame = outbound.lock().await.recv().await.unwrap();
            assert_eq!(frame.id, 1);
        }

        let receipt = handle.wait().await.unwrap();
        assert!(!receipt.received);
        assert_eq!(receipt.attempts, MAX_ATTEMPTS);
        assert!(receipt.received_at.is_none());

        // Nothing further is transmitted after exhaustion.
        tokio::time::advance(ATTEMPT_INTERVAL * 3).await;
        assert!(outbound.lock().await.try_recv().is_err());
        cancel.cancel();
    }

    #[tokio::test(start_paused = true)]
    async fn ids_are_assigned_in_order() {
        let cancel = CancellationToken::new();
        let outbox = Outbox::spawn(cancel.clone());
        let outbound = outbox.outbound();

        let first = outbox.send(addressee(), "one".to_owned()).await;
        let second = outbox.send(addressee(), "two".to_owned()).await;

        let mut seen = Vec::new();
        for _ in 0..2 {
            seen.push(outbound.lock().await.recv().await.unwrap());
        }
        seen.sort_by_key(|frame| frame.id);
        assert_eq!(seen[0].id, 1);
        assert_eq!(seen[0].text, "one");
        assert_eq!(seen[1].id, 2);
        assert_eq!(seen[1].text, "two");

        outbox.ack(1).await;
        outbox.ack(2).await;
        assert!(first.wait().await.unwrap().received);
        assert!(second.wait().await.unwrap().received);
        cancel.cancel();
    }

    #[tokio::test(start_paused = true)]
    async fn unknown_ack_is_dropped() {
        let cancel = CancellationToken::new();
        let outbox = Outbox::spawn(cancel.clone());
        let outbound = outbox.outbound();

        let handle = outbox.send(addressee(), "hi".to_owned()).await;
        let _ = outbound.lock().await.recv().await.unwrap();

        // A bogus ACK must not complete the pending message.
        outbox.ack(99).await;
        outbox.ack(1).await;
        let receipt = handle.wait().await.unwrap();
        assert!(receipt.received);
        assert_eq!(receipt.id, 1);
        cancel.cancel();
    }

    #[tokio::test(start_paused = true)]
    async fn id_counter_resets_after_quiet_period() {
        let cancel = CancellationToken::new();
        let outbox = Outbox::spawn(cancel.clone());
        let outbound = outbox.outbound();

        let handle = outbox.send(addressee(), "first".to_owned()).await;
        let _ = outbound.lock().await.recv().await.unwrap();
        outbox.ack(1).await;
        assert!(handle.wait().await.unwrap().received);

        // Sleeping (rather than jumping the clock) lets the worker
        // observe the quiet-period deadline before the next send.
        tokio::time::sleep(ID_RESET_INTERVAL + Duration::from_secs(1)).await;

        let handle = outbox.send(addressee(), "second".to_owned()).await;
        let frame = outbound.lock().await.recv().await.unwrap();
        assert_eq!(frame.id, 1);
        outbox.ack(1).await;
        assert!(handle.wait().await.unwrap().received);
        cancel.cancel();
    }

    #[tokio::test(start_paused = true)]
    async fn worker_survives_consecutive_quiet_periods() {
        let cancel = CancellationToken::new();
        let outbox = Outbox::spawn(cancel.clone());
        let outbound = outbox.outbound();

        // Two full quiet periods with no send: the reset deadline fires
        // twice and must re-arm itself each time, or the worker would
        // spin on the elapsed deadline and never idle again.
        tokio::time::sleep(ID_RESET_INTERVAL * 2 + Duration::from_secs(10)).await;

        // The worker still answers promptly.
        let handle = outbox.send(addressee(), "still alive".to_owned()).await;
        let frame = outbound.lock().await.recv().await.unwrap();
        assert_eq!(frame.id, 1);
        outbox.ack(1).await;
        let receipt = handle.wait().await.unwrap();
        assert!(receipt.received);
        assert_eq!(receipt.attempts, 1);
        cancel.cancel();
    }

    #[tokio::test(start_paused = true)]
    async fn cancellation_abandons_waiters() {
        let cancel = CancellationToken::new();
        let outbox = Outbox::spawn(cancel.clone());
        let outbound = outbox.outbound();

        let handle = outbox.send(addressee(), "doomed".to_owned()).await;
        let _ = outbound.lock().await.recv().await.unwrap();

        cancel.cancel();
        assert!(handle.wait().await.is_none());
    }
}
