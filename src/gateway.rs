//! Wiring between the deduplicated receive stream, the document store,
//! and the outbox: persist every unique packet, optionally send a
//! reply, and patch the stored record once the reply is acknowledged or
//! given up on.

use std::sync::Arc;

use chrono::Local;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn, Instrument};

use crate::outbox::Outbox;
use crate::packet::Packet;
use crate::store::{DocumentStore, PacketDocument, ReplyPatch, StoreError};

pub struct Gateway {
    store: Arc<dyn DocumentStore>,
    outbox: Outbox,
    /// Replies go out over amateur radio frequencies; this stays false
    /// unless a licensed operator turned it on deliberately.
    respond: bool,
}

impl Gateway {
    pub fn new(store: Arc<dyn DocumentStore>, outbox: Outbox, respond: bool) -> Self {
        Self {
            store,
            outbox,
            respond,
        }
    }

    /// Drains the deduplicated packet stream until cancellation or
    /// end-of-stream.
    pub async fn run(self, cancel: CancellationToken, mut packets: mpsc::Receiver<Packet>) {
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                packet = packets.recv() => {
                    let Some(packet) = packet else { break };
                    self.handle_packet(packet).await;
                }
            }
        }
    }

    async fn handle_packet(&self, packet: Packet) {
        info!("MESSAGE: {}", packet.message);
        if let Some((latitude, longitude)) = packet.position {
            info!("POSITION: {latitude:.4},{longitude:.4}");
        }

        let id = format!("aprs:{}", packet.hash());
        let doc = PacketDocument::from_packet(&packet);
        match self.store.create(&id, &doc).await {
            Ok(()) => {
                metrics::counter!("aprs.store.created").increment(1);
            }
            Err(StoreError::Conflict(_)) => {
                // Another gateway instance reported this packet first;
                // it owns the record and any reply.
                warn!("packet {id} already reported by another instance");
                metrics::counter!("aprs.store.conflicts").increment(1);
                return;
            }
            Err(e) => {
                warn!("failed to report packet {id}: {e:#}");
                return;
            }
        }

        if !self.respond {
            return;
        }

        let text = format!("RX {}", Local::now().format("%-I:%M %p"));
        info!("REPLY: {text}");
        let handle = self.outbox.send(packet.source.clone(), text).await;

        let store = self.store.clone();
        tokio::spawn(
            async move {
                // Resolves on acknowledgement or retry exhaustion; a
                // shutdown before either leaves the record as created.
                let Some(receipt) = handle.wait().await else {
                    return;
                };
                info!(
                    "message #{} done (received={}, attempts={})",
                    receipt.id, receipt.received, receipt.attempts
                );
                let patch = ReplyPatch::from(&receipt);
                if let Err(e) = store.update(&id, &patch).await {
                    error!("failed to report message completion: {e:#}");
                }
            }
            .instrument(tracing::info_span!("reply_waiter")),
        );
    }
}
