//! APRS-IS gateway library.
//!
//! Maintains a redundant set of APRS-IS sessions for one callsign,
//! deduplicates the merged receive stream, persists unique packets to a
//! document store, and can reply to senders with reliable
//! retransmission and acknowledgement tracking.

pub mod aprs_client;
pub mod config;
pub mod gateway;
pub mod metrics;
pub mod multi_client;
pub mod outbox;
pub mod packet;
pub mod store;

pub use aprs_client::{AprsClient, AprsClientConfig, AprsClientConfigBuilder};
pub use gateway::Gateway;
pub use multi_client::MultiClient;
pub use outbox::{MessageReceipt, Outbox};
pub use packet::{Address, Packet};
pub use store::{DocumentStore, HttpDocumentStore, MemoryStore};
