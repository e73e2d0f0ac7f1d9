//! Control-stream RPC messages
//!
//! The RPC transport exchanges length-delimited `RpcMessage` envelopes over
//! a single muxed stream. Method payloads are bincode-serialized structs
//! defined here; responses are routed back by correlation ID.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// RPC method names. These are stable wire identifiers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RpcName {
    Register,
    Reconnect,
    Unregister,
    Authenticate,
    ServerInfo,
}

impl RpcName {
    pub fn method(&self) -> &'static str {
        match self {
            RpcName::Register => "RegisterConnection",
            RpcName::Reconnect => "ReconnectConnection",
            RpcName::Unregister => "UnregisterConnection",
            RpcName::Authenticate => "Authenticate",
            RpcName::ServerInfo => "GetServerInfo",
        }
    }

    /// Short label used for observer counters and log fields.
    pub fn label(&self) -> &'static str {
        match self {
            RpcName::Register => "register",
            RpcName::Reconnect => "reconnect",
            RpcName::Unregister => "unregister",
            RpcName::Authenticate => "authenticate",
            RpcName::ServerInfo => "server_info",
        }
    }
}

/// RPC envelope exchanged on the control stream
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum RpcMessage {
    /// Request expecting a response correlated by `id`
    Request {
        id: u64,
        method: String,
        body: Vec<u8>,
    },
    /// One-way request; no response will be sent
    Notify { method: String, body: Vec<u8> },
    /// Successful response to the request with the same `id`
    Response { id: u64, body: Vec<u8> },
    /// Failed response to the request with the same `id`
    Fault { id: u64, fault: RpcFault },
}

/// Server-reported RPC failures. The supervisor classifies these into its
/// retry policy.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum RpcFault {
    /// Another connection already holds this HA slot
    DuplicateConnection,
    /// Registration rejected for good: bad credentials, quota exhausted
    Permanent { reason: String },
    /// Transient server-side failure; safe to retry
    Transient { reason: String },
    /// The peer does not recognize the method
    UnknownMethod { method: String },
}

/// Account-scoped authentication material sent at registration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TunnelAuth {
    pub account_tag: String,
    pub tunnel_secret: Vec<u8>,
}

/// Client software identity reported to the edge
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ClientInfo {
    pub client_id: String,
    pub version: String,
    pub arch: String,
    pub features: Vec<String>,
}

/// Per-connection registration options
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ConnectionOptions {
    pub client: ClientInfo,
    pub replace_existing: bool,
    pub num_previous_attempts: u8,
}

/// `RegisterConnection` request body
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RegisterConnectionRequest {
    pub auth: TunnelAuth,
    pub tunnel_id: Uuid,
    pub conn_index: u8,
    pub options: ConnectionOptions,
}

/// `ReconnectConnection` request body
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ReconnectConnectionRequest {
    pub token: Vec<u8>,
    pub event_digest: Vec<u8>,
    pub conn_digest: Vec<u8>,
    pub hostname: String,
    pub options: ConnectionOptions,
}

/// Successful registration or reconnection outcome. The digests and the
/// reconnect token are opaque server-issued nonces, refreshed on every
/// successful registration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ConnectionDetails {
    pub uuid: Uuid,
    pub location: String,
    pub reconnect_token: Vec<u8>,
    pub event_digest: Vec<u8>,
    pub conn_digest: Vec<u8>,
}

/// `Authenticate` request body (legacy named-cert tunnels)
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AuthenticateRequest {
    pub auth: TunnelAuth,
    pub hostname: String,
    pub options: ConnectionOptions,
}

/// `Authenticate` outcome
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum AuthOutcome {
    Success { jwt: Vec<u8> },
    PermanentFailure { reason: String },
    RetryableFailure { reason: String, retry_after_secs: u64 },
}

/// `GetServerInfo` response body
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ServerInfo {
    pub location_name: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn options() -> ConnectionOptions {
        ConnectionOptions {
            client: ClientInfo {
                client_id: "host-1".to_string(),
                version: "0.1.0".to_string(),
                arch: "x86_64".to_string(),
                features: vec!["ha".to_string()],
            },
            replace_existing: false,
            num_previous_attempts: 0,
        }
    }

    #[test]
    fn test_envelope_serialization() {
        let msg = RpcMessage::Request {
            id: 7,
            method: RpcName::Register.method().to_string(),
            body: vec![1, 2, 3],
        };
        let raw = bincode::serialize(&msg).unwrap();
        let back: RpcMessage = bincode::deserialize(&raw).unwrap();
        assert_eq!(back, msg);
    }

    #[test]
    fn test_register_request_roundtrip() {
        let req = RegisterConnectionRequest {
            auth: TunnelAuth {
                account_tag: "acct".to_string(),
                tunnel_secret: vec![0xde, 0xad],
            },
            tunnel_id: Uuid::new_v4(),
            conn_index: 2,
            options: options(),
        };
        let raw = bincode::serialize(&req).unwrap();
        let back: RegisterConnectionRequest = bincode::deserialize(&raw).unwrap();
        assert_eq!(back, req);
    }

    #[test]
    fn test_fault_roundtrip() {
        let fault = RpcFault::Transient {
            reason: "edge overloaded".to_string(),
        };
        let raw = bincode::serialize(&fault).unwrap();
        let back: RpcFault = bincode::deserialize(&raw).unwrap();
        assert_eq!(back, fault);
    }

    #[test]
    fn test_rpc_names_have_no_padding() {
        for name in [
            RpcName::Register,
            RpcName::Reconnect,
            RpcName::Unregister,
            RpcName::Authenticate,
            RpcName::ServerInfo,
        ] {
            assert_eq!(name.label(), name.label().trim());
            assert_eq!(name.method(), name.method().trim());
        }
    }
}
