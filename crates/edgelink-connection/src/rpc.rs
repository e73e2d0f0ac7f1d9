//! RPC transport over a muxed stream
//!
//! Length-delimited request/response exchange on the first stream of each
//! edge connection. Requests carry a correlation ID; a demux task routes
//! responses back to their callers, so calls pipeline freely. Closing the
//! transport closes the stream and fails every pending call with a
//! cancellation error.

use dashmap::DashMap;
use edgelink_mux::{MuxedStream, StreamError};
use edgelink_proto::{
    AuthOutcome, AuthenticateRequest, CodecError, ConnectionDetails, ConnectionOptions,
    ReconnectConnectionRequest, RegisterConnectionRequest, RpcCodec, RpcFault, RpcMessage,
    RpcName, ServerInfo, TunnelAuth,
};
use bytes::BytesMut;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};
use uuid::Uuid;

/// RPC transport errors
#[derive(Debug, Error)]
pub enum RpcError {
    #[error("Codec error: {0}")]
    Codec(#[from] CodecError),

    #[error("Stream error: {0}")]
    Stream(#[from] StreamError),

    /// The transport closed before a response arrived. Terminal; not
    /// logged as an error during shutdown.
    #[error("call cancelled")]
    Cancelled,

    #[error("Server fault: {0:?}")]
    Fault(RpcFault),

    #[error("Malformed response body for {0}")]
    UnexpectedResponse(&'static str),
}

type PendingCalls = Arc<DashMap<u64, oneshot::Sender<Result<Vec<u8>, RpcError>>>>;

/// Raw request/response messaging over one muxed stream.
pub struct RpcTransport {
    stream: Arc<MuxedStream>,
    pending: PendingCalls,
    next_id: AtomicU64,
    demux: JoinHandle<()>,
}

impl RpcTransport {
    pub fn new(stream: Arc<MuxedStream>) -> Self {
        let pending: PendingCalls = Arc::new(DashMap::new());
        let demux = tokio::spawn(demux_loop(stream.clone(), pending.clone()));
        Self {
            stream,
            pending,
            next_id: AtomicU64::new(1),
            demux,
        }
    }

    /// Issue a request and wait for the correlated response.
    pub async fn call(&self, method: &str, body: Vec<u8>) -> Result<Vec<u8>, RpcError> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        self.pending.insert(id, tx);

        let encoded = RpcCodec::encode(&RpcMessage::Request {
            id,
            method: method.to_string(),
            body,
        })?;
        if let Err(err) = self.stream.write(&encoded) {
            self.pending.remove(&id);
            return Err(err.into());
        }
        trace!(id, method, "rpc call issued");

        rx.await.map_err(|_| RpcError::Cancelled)?
    }

    /// Fire-and-forget request.
    pub fn notify(&self, method: &str, body: Vec<u8>) -> Result<(), RpcError> {
        let encoded = RpcCodec::encode(&RpcMessage::Notify {
            method: method.to_string(),
            body,
        })?;
        self.stream.write(&encoded)?;
        Ok(())
    }

    /// Close the underlying stream and abort pending calls.
    pub fn close(&self) {
        self.stream.close();
    }
}

impl Drop for RpcTransport {
    fn drop(&mut self) {
        self.stream.close();
        self.demux.abort();
    }
}

async fn demux_loop(stream: Arc<MuxedStream>, pending: PendingCalls) {
    let mut buf = BytesMut::new();
    let mut chunk = [0u8; 4096];
    loop {
        match stream.read(&mut chunk).await {
            Ok(n) => {
                buf.extend_from_slice(&chunk[..n]);
                loop {
                    match RpcCodec::decode(&mut buf) {
                        Ok(Some(message)) => route_message(&pending, message),
                        Ok(None) => break,
                        Err(err) => {
                            warn!(error = %err, "rpc stream desynced, closing");
                            stream.close();
                            fail_pending(&pending);
                            return;
                        }
                    }
                }
            }
            Err(_) => {
                debug!("rpc stream closed, aborting pending calls");
                fail_pending(&pending);
                return;
            }
        }
    }
}

fn route_message(pending: &PendingCalls, message: RpcMessage) {
    match message {
        RpcMessage::Response { id, body } => {
            if let Some((_, tx)) = pending.remove(&id) {
                let _ = tx.send(Ok(body));
            } else {
                trace!(id, "response for unknown call");
            }
        }
        RpcMessage::Fault { id, fault } => {
            if let Some((_, tx)) = pending.remove(&id) {
                let _ = tx.send(Err(RpcError::Fault(fault)));
            }
        }
        RpcMessage::Request { method, .. } | RpcMessage::Notify { method, .. } => {
            // The daemon side only issues calls.
            trace!(method, "ignoring inbound rpc request");
        }
    }
}

fn fail_pending(pending: &PendingCalls) {
    let ids: Vec<u64> = pending.iter().map(|entry| *entry.key()).collect();
    for id in ids {
        if let Some((_, tx)) = pending.remove(&id) {
            let _ = tx.send(Err(RpcError::Cancelled));
        }
    }
}

/// Registration failures classified for the supervisor's retry policy.
#[derive(Debug, Error)]
pub enum RegistrationError {
    /// Another process holds this HA slot
    #[error("another connection holds this slot")]
    DuplicateConnection,

    /// Credentials invalid or quota exhausted; fatal for the supervisor
    #[error("permanent registration failure: {reason}")]
    Permanent { reason: String },

    /// Network or server overload; retried with backoff
    #[error("transient registration failure: {reason}")]
    Transient { reason: String },

    #[error("rpc failure: {0}")]
    Rpc(RpcError),
}

impl From<RpcError> for RegistrationError {
    fn from(err: RpcError) -> Self {
        match err {
            RpcError::Fault(RpcFault::DuplicateConnection) => {
                RegistrationError::DuplicateConnection
            }
            RpcError::Fault(RpcFault::Permanent { reason }) => {
                RegistrationError::Permanent { reason }
            }
            RpcError::Fault(RpcFault::Transient { reason }) => {
                RegistrationError::Transient { reason }
            }
            other => RegistrationError::Rpc(other),
        }
    }
}

/// Typed registration RPCs over an [`RpcTransport`].
pub struct RegistrationClient {
    rpc: RpcTransport,
}

impl RegistrationClient {
    pub fn new(stream: Arc<MuxedStream>) -> Self {
        Self {
            rpc: RpcTransport::new(stream),
        }
    }

    pub async fn register_connection(
        &self,
        auth: TunnelAuth,
        tunnel_id: Uuid,
        conn_index: u8,
        options: ConnectionOptions,
    ) -> Result<ConnectionDetails, RegistrationError> {
        let body = serialize(&RegisterConnectionRequest {
            auth,
            tunnel_id,
            conn_index,
            options,
        })?;
        let response = self.rpc.call(RpcName::Register.method(), body).await?;
        deserialize(&response, "RegisterConnection")
    }

    pub async fn reconnect_connection(
        &self,
        token: Vec<u8>,
        event_digest: Vec<u8>,
        conn_digest: Vec<u8>,
        hostname: String,
        options: ConnectionOptions,
    ) -> Result<ConnectionDetails, RegistrationError> {
        let body = serialize(&ReconnectConnectionRequest {
            token,
            event_digest,
            conn_digest,
            hostname,
            options,
        })?;
        let response = self.rpc.call(RpcName::Reconnect.method(), body).await?;
        deserialize(&response, "ReconnectConnection")
    }

    pub async fn unregister_connection(&self) -> Result<(), RegistrationError> {
        self.rpc
            .call(RpcName::Unregister.method(), Vec::new())
            .await?;
        Ok(())
    }

    pub async fn get_server_info(&self) -> Result<ServerInfo, RegistrationError> {
        let response = self
            .rpc
            .call(RpcName::ServerInfo.method(), Vec::new())
            .await?;
        deserialize(&response, "GetServerInfo")
    }

    pub async fn authenticate(
        &self,
        auth: TunnelAuth,
        hostname: String,
        options: ConnectionOptions,
    ) -> Result<AuthOutcome, RegistrationError> {
        let body = serialize(&AuthenticateRequest {
            auth,
            hostname,
            options,
        })?;
        let response = self.rpc.call(RpcName::Authenticate.method(), body).await?;
        deserialize(&response, "Authenticate")
    }

    pub fn close(&self) {
        self.rpc.close();
    }
}

fn serialize<T: serde::Serialize>(value: &T) -> Result<Vec<u8>, RegistrationError> {
    bincode::serialize(value)
        .map_err(|err| RegistrationError::Rpc(RpcError::Codec(CodecError::Serialization(err))))
}

fn deserialize<T: serde::de::DeserializeOwned>(
    raw: &[u8],
    method: &'static str,
) -> Result<T, RegistrationError> {
    bincode::deserialize(raw)
        .map_err(|_| RegistrationError::Rpc(RpcError::UnexpectedResponse(method)))
}
