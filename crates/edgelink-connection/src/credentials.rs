//! Tunnel credentials and the per-connection credential store
//!
//! Credentials are loaded once from the JSON file the provisioning flow
//! wrote and never mutated. The store keeps the mutable per-slot state the
//! edge hands back on each successful registration: the reconnect token
//! and the event/conn digests, plus the connected latch.

use edgelink_proto::{ConnectionDetails, TunnelAuth};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::Mutex;
use thiserror::Error;
use uuid::Uuid;

/// Credential loading errors
#[derive(Debug, Error)]
pub enum CredentialsError {
    #[error("Cannot read credentials file: {0}")]
    Io(#[from] std::io::Error),

    #[error("Malformed credentials file: {0}")]
    Parse(#[from] serde_json::Error),
}

/// Immutable tunnel credentials, as persisted by provisioning.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Credentials {
    #[serde(rename = "AccountTag")]
    pub account_tag: String,
    #[serde(rename = "TunnelSecret", with = "base64_bytes")]
    pub tunnel_secret: Vec<u8>,
    #[serde(rename = "TunnelID")]
    pub tunnel_id: Uuid,
    #[serde(rename = "TunnelName")]
    pub tunnel_name: String,
}

impl Credentials {
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, CredentialsError> {
        let raw = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&raw)?)
    }

    pub fn auth(&self) -> TunnelAuth {
        TunnelAuth {
            account_tag: self.account_tag.clone(),
            tunnel_secret: self.tunnel_secret.clone(),
        }
    }
}

mod base64_bytes {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(data: &[u8], serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&STANDARD.encode(data))
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Vec<u8>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let encoded = String::deserialize(deserializer)?;
        STANDARD
            .decode(encoded)
            .map_err(serde::de::Error::custom)
    }
}

#[derive(Debug, Default, Clone)]
struct SlotCredentials {
    reconnect_token: Option<Vec<u8>>,
    event_digest: Option<Vec<u8>>,
    conn_digest: Option<Vec<u8>>,
    connected: bool,
}

/// Mutable per-slot registration state. One writer per slot (its
/// supervisor task); any number of readers.
pub struct CredentialStore {
    slots: Vec<Mutex<SlotCredentials>>,
}

impl CredentialStore {
    pub fn new(ha_connections: usize) -> Self {
        Self {
            slots: (0..ha_connections)
                .map(|_| Mutex::new(SlotCredentials::default()))
                .collect(),
        }
    }

    pub fn slot_count(&self) -> usize {
        self.slots.len()
    }

    /// Cache the server-issued token and digests from a successful
    /// registration and latch the slot connected.
    pub fn store_registration(&self, index: u8, details: &ConnectionDetails) {
        if let Some(slot) = self.slots.get(index as usize) {
            let mut slot = slot.lock().unwrap();
            slot.reconnect_token = Some(details.reconnect_token.clone());
            slot.event_digest = Some(details.event_digest.clone());
            slot.conn_digest = Some(details.conn_digest.clone());
            slot.connected = true;
        }
    }

    pub fn set_disconnected(&self, index: u8) {
        if let Some(slot) = self.slots.get(index as usize) {
            slot.lock().unwrap().connected = false;
        }
    }

    pub fn is_connected(&self, index: u8) -> bool {
        self.slots
            .get(index as usize)
            .map(|slot| slot.lock().unwrap().connected)
            .unwrap_or(false)
    }

    pub fn connected_count(&self) -> usize {
        self.slots
            .iter()
            .filter(|slot| slot.lock().unwrap().connected)
            .count()
    }

    pub fn reconnect_token(&self, index: u8) -> Option<Vec<u8>> {
        self.slots
            .get(index as usize)
            .and_then(|slot| slot.lock().unwrap().reconnect_token.clone())
    }

    pub fn event_digest(&self, index: u8) -> Option<Vec<u8>> {
        self.slots
            .get(index as usize)
            .and_then(|slot| slot.lock().unwrap().event_digest.clone())
    }

    pub fn conn_digest(&self, index: u8) -> Option<Vec<u8>> {
        self.slots
            .get(index as usize)
            .and_then(|slot| slot.lock().unwrap().conn_digest.clone())
    }
}
