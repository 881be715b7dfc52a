//! Persistence of received packets to an external document store.
//!
//! The store is a simple idempotent document sink: `create` with
//! first-writer-wins semantics (several gateway instances may race to
//! report the same packet) and `update` for patching reply metadata
//! onto an existing record. Documents are keyed by the packet content
//! hash, so the dedup guarantee extends across instances.

use std::collections::HashMap;
use std::env;
use std::path::Path;
use std::sync::Mutex;

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

use crate::outbox::MessageReceipt;
use crate::packet::Packet;

#[derive(Error, Debug)]
pub enum StoreError {
    /// The document already exists; another writer got there first.
    #[error("document {0} already exists")]
    Conflict(String),
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Document written for each unique received packet.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PacketDocument {
    pub hostname: String,
    pub received_at: DateTime<Utc>,

    pub raw: String,
    pub src: String,
    pub dst: String,
    pub path: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message_to: Option<String>,
    pub has_position: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub latitude: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub longitude: Option<f64>,
}

impl PacketDocument {
    pub fn from_packet(packet: &Packet) -> Self {
        Self {
            hostname: hostname(),
            received_at: Utc::now(),
            raw: packet.raw.clone(),
            src: packet.source.to_string(),
            dst: packet.destination.to_string(),
            path: packet.path.join(","),
            message: packet.message.clone(),
            message_to: packet.addressee.as_ref().map(|a| a.to_string()),
            has_position: packet.position.is_some(),
            latitude: packet.position.map(|(lat, _)| lat),
            longitude: packet.position.map(|(_, lon)| lon),
        }
    }
}

/// Partial update recording the outcome of a reply message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReplyPatch {
    pub reply_message: String,
    pub reply_sent_at: DateTime<Utc>,
    pub reply_last_sent_at: DateTime<Utc>,
    pub reply_received: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reply_received_at: Option<DateTime<Utc>>,
    pub reply_id: u32,
    pub reply_attempts: u32,
}

impl From<&MessageReceipt> for ReplyPatch {
    fn from(receipt: &MessageReceipt) -> Self {
        Self {
            reply_message: receipt.text.clone(),
            reply_sent_at: receipt.sent_at,
            reply_last_sent_at: receipt.last_sent_at,
            reply_received: receipt.received,
            reply_received_at: receipt.received_at,
            reply_id: receipt.id,
            reply_attempts: receipt.attempts,
        }
    }
}

#[async_trait]
pub trait DocumentStore: Send + Sync {
    /// Creates a document. Idempotent across writers: the first create
    /// for an ID wins and later ones fail with [`StoreError::Conflict`].
    async fn create(&self, id: &str, doc: &PacketDocument) -> Result<(), StoreError>;

    /// Applies a partial update to an existing document.
    async fn update(&self, id: &str, patch: &ReplyPatch) -> Result<(), StoreError>;
}

#[derive(Debug, Deserialize)]
struct StoreCredentials {
    url: String,
    token: String,
}

/// Document store client speaking plain HTTP: `PUT` to create (the
/// server answers 409 when the document exists), `PATCH` to update.
pub struct HttpDocumentStore {
    base_url: String,
    token: String,
    client: reqwest::Client,
}

impl HttpDocumentStore {
    /// Reads the credentials file (`{"url": ..., "token": ...}`).
    pub fn from_credentials_file(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("read credentials file {}", path.display()))?;
        let credentials: StoreCredentials = serde_json::from_str(&contents)
            .with_context(|| format!("parse credentials file {}", path.display()))?;
        Ok(Self {
            base_url: credentials.url.trim_end_matches('/').to_owned(),
            token: credentials.token,
            client: reqwest::Client::new(),
        })
    }

    /// Startup reachability check; failure here aborts the process.
    pub async fn ping(&self) -> Result<()> {
        let response = self
            .client
            .get(&self.base_url)
            .bearer_auth(&self.token)
            .send()
            .await
            .with_context(|| format!("document store unreachable at {}", self.base_url))?;
        if response.status().is_server_error() {
            return Err(anyhow!(
                "document store at {} answered {}",
                self.base_url,
                response.status()
            ));
        }
        Ok(())
    }

    fn document_url(&self, id: &str) -> String {
        format!("{}/{}", self.base_url, id)
    }
}

#[async_trait]
impl DocumentStore for HttpDocumentStore {
    async fn create(&self, id: &str, doc: &PacketDocument) -> Result<(), StoreError> {
        let response = self
            .client
            .put(self.document_url(id))
            .bearer_auth(&self.token)
            .json(doc)
            .send()
            .await
            .with_context(|| format!("create document {id}"))?;
        if response.status() == StatusCode::CONFLICT {
            return Err(StoreError::Conflict(id.to_owned()));
        }
        response
            .error_for_status()
            .with_context(|| format!("create document {id}"))?;
        debug!("created document {id}");
        Ok(())
    }

    async fn update(&self, id: &str, patch: &ReplyPatch) -> Result<(), StoreError> {
        let response = self
            .client
            .patch(self.document_url(id))
            .bearer_auth(&self.token)
            .json(patch)
            .send()
            .await
            .with_context(|| format!("update document {id}"))?;
        response
            .error_for_status()
            .with_context(|| format!("update document {id}"))?;
        debug!("updated document {id}");
        Ok(())
    }
}

/// In-memory store with the same first-writer-wins contract. Backs the
/// integration tests; also handy for running the gateway without any
/// external service.
#[derive(Default)]
pub struct MemoryStore {
    documents: Mutex<HashMap<String, serde_json::Value>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, id: &str) -> Option<serde_json::Value> {
        self.documents.lock().unwrap().get(id).cloned()
    }

    pub fn len(&self) -> usize {
        self.documents.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.documents.lock().unwrap().is_empty()
    }
}

#[async_trait]
impl DocumentStore for MemoryStore {
    async fn create(&self, id: &str, doc: &PacketDocument) -> Result<(), StoreError> {
        let mut documents = self.documents.lock().unwrap();
        if documents.contains_key(id) {
            return Err(StoreError::Conflict(id.to_owned()));
        }
        let value = serde_json::to_value(doc).map_err(anyhow::Error::from)?;
        documents.insert(id.to_owned(), value);
        Ok(())
    }

    async fn update(&self, id: &str, patch: &ReplyPatch) -> Result<(), StoreError> {
        let mut documents = self.documents.lock().unwrap();
        let doc = documents
            .get_mut(id)
            .ok_or_else(|| anyhow!("document {id} not found"))?;
        let patch = serde_json::to_value(patch).map_err(anyhow::Error::from)?;
        if let (Some(doc), Some(patch)) = (doc.as_object_mut(), patch.as_object()) {
            for (key, value) in patch {
                doc.insert(key.clone(), value.clone());
            }
        }
        Ok(())
    }
}

/// Best-effort local hostname, recorded so competing instances can be
/// told apart in the store.
fn hostname() -> String {
    env::var("HOSTNAME").unwrap_or_else(|_| {
        std::process::Command::new("hostname")
            .output()
            .ok()
            .and_then(|output| String::from_utf8(output.stdout).ok())
            .map(|name| name.trim().to_owned())
            .filter(|name| !name.is_empty())
            .unwrap_or_else(|| "unknown".to_owned())
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::Packet;

    fn sample_packet() -> Packet {
        "KI7QIV-7>APRS,TCPIP*:=4730.00N/12215.00W-Test{1"
            .parse()
            .unwrap()
    }

    #[tokio::test]
    async fn memory_store_create_is_first_writer_wins() {
        let store = MemoryStore::new();
        let doc = PacketDocument::from_packet(&sample_packet());

        store.create("aprs:abc", &doc).await.unwrap();
        let err = store.create("aprs:abc", &doc).await.unwrap_err();
        assert!(matches!(err, StoreError::Conflict(_)));
        assert_eq!(store.len(), 1);
    }

    #[tokio::test]
    async fn memory_store_update_merges_patch() {
        let store = MemoryStore::new();
        let doc = PacketDocument::from_packet(&sample_packet());
        store.create("aprs:abc", &doc).await.unwrap();

        let patch = ReplyPatch {
            reply_message: "RX 3:04 PM".to_owned(),
            reply_sent_at: Utc::now(),
            reply_last_sent_at: Utc::now(),
            reply_received: true,
            reply_received_at: Some(Utc::now()),
            reply_id: 1,
            reply_attempts: 1,
        };
        store.update("aprs:abc", &patch).await.unwrap();

        let merged = store.get("aprs:abc").unwrap();
        assert_eq!(merged["reply_received"], serde_json::json!(true));
        assert_eq!(merged["reply_id"], serde_json::json!(1));
        // The original fields survive the patch.
        assert_eq!(merged["src"], serde_json::json!("KI7QIV-7"));
    }

    #[tokio::test]
    async fn memory_store_update_requires_existing_document() {
        let store = MemoryStore::new();
        let patch = ReplyPatch {
            reply_message: String::new(),
            reply_sent_at: Utc::now(),
            reply_last_sent_at: Utc::now(),
            reply_received: false,
            reply_received_at: None,
            reply_id: 1,
            reply_attempts: 5,
        };
        assert!(store.update("aprs:missing", &patch).await.is_err());
    }

    #[test]
    fn document_captures_packet_fields() {
        let doc = PacketDocument::from_packet(&sample_packet());
        assert_eq!(doc.src, "KI7QIV-7");
        assert_eq!(doc.dst, "APRS");
        assert_eq!(doc.path, "TCPIP*");
        assert_eq!(doc.message, "Test");
        assert!(doc.has_position);
        assert!((doc.latitude.unwrap() - 47.5).abs() < 1e-9);
        assert!((doc.longitude.unwrap() - (-122.25)).abs() < 1e-9);
        assert_eq!(doc.message_to, None);
    }
}
