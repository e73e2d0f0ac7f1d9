//! Edgelink connection layer
//!
//! Maintains N parallel long-lived connections from the daemon to the edge
//! fabric. Each slot dials with TLS, wraps the transport in a muxer, runs
//! registration over the first stream's RPC transport, serves user streams,
//! and reconnects with jittered backoff when the connection drops. The
//! observer sinks events and counters from every slot.

pub mod backoff;
pub mod connector;
pub mod credentials;
pub mod observer;
pub mod rpc;
pub mod supervisor;

pub use backoff::{Backoff, BackoffConfig};
pub use connector::{ConnectError, EdgeConnector, EdgeTlsConfig, TlsEdgeConnector};
pub use credentials::{Credentials, CredentialsError, CredentialStore};
pub use observer::{ConnectionEvent, Observer, TunnelMetrics};
pub use rpc::{RegistrationClient, RegistrationError, RpcError, RpcTransport};
pub use supervisor::{StreamHandler, Supervisor, SupervisorConfig, SupervisorError};
