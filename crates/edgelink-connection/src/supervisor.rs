//! Connection supervisor: N HA slots with registration and reconnection
//!
//! Each slot runs an infinite dial-register-serve loop: connect to the
//! edge, wrap the transport in a muxer, register (or reconnect with the
//! cached token) over the control stream, then serve user streams until
//! the muxer dies. Failures classify into slot-local retry with backoff,
//! slot abandonment (duplicate connection without replacement), or
//! supervisor-wide termination (permanent registration failures).

use crate::backoff::Backoff;
use crate::connector::EdgeConnector;
use crate::credentials::{CredentialStore, Credentials};
use crate::observer::{Observer, TunnelMetrics};
use crate::rpc::{RegistrationClient, RegistrationError};
use crate::BackoffConfig;
use async_trait::async_trait;
use edgelink_mux::{MuxedStream, Muxer, MuxerConfig};
use edgelink_proto::{ClientInfo, ConnectionOptions, Header, RpcName};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Supervisor configuration (recognized options)
#[derive(Debug, Clone)]
pub struct SupervisorConfig {
    /// Number of parallel edge connections
    pub ha_connections: usize,
    /// Shutdown deadline for graceful unregisters
    pub grace_period: Duration,
    /// Steal an HA slot held by another connection. Applies on every
    /// attempt, the first included.
    pub replace_existing: bool,
    pub backoff: BackoffConfig,
    /// Origin hostname reported on reconnects
    pub hostname: String,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            ha_connections: 4,
            grace_period: Duration::from_secs(30),
            replace_existing: false,
            backoff: BackoffConfig::default(),
            hostname: local_hostname(),
        }
    }
}

fn local_hostname() -> String {
    hostname::get()
        .ok()
        .and_then(|name| name.into_string().ok())
        .unwrap_or_else(|| "unknown".to_string())
}

/// Supervisor-terminal errors
#[derive(Debug, thiserror::Error)]
pub enum SupervisorError {
    #[error("permanent registration failure: {reason}")]
    Permanent { reason: String },
}

/// Seam to the origin proxy: every accepted user stream is handed off
/// here. The adapter that speaks HTTP/TCP to origin services lives
/// outside this crate.
#[async_trait]
pub trait StreamHandler: Send + Sync + 'static {
    async fn handle_stream(&self, stream: Arc<MuxedStream>);
}

enum SlotOutcome {
    /// Shutdown was requested while serving
    Shutdown,
    /// The muxer terminated; redial
    ConnectionLost,
}

enum SlotError {
    /// Another connection holds the slot
    Duplicate,
    /// Terminate the whole supervisor
    Permanent(String),
    /// Retry this slot with backoff
    Transient(String),
}

struct SlotShared<C: EdgeConnector> {
    config: SupervisorConfig,
    credentials: Arc<Credentials>,
    store: Arc<CredentialStore>,
    connector: Arc<C>,
    observer: Arc<Observer>,
    handler: Arc<dyn StreamHandler>,
}

impl<C: EdgeConnector> SlotShared<C> {
    fn options(&self, num_previous_attempts: u8) -> ConnectionOptions {
        ConnectionOptions {
            client: ClientInfo {
                client_id: local_hostname(),
                version: env!("CARGO_PKG_VERSION").to_string(),
                arch: std::env::consts::ARCH.to_string(),
                features: vec!["ha".to_string()],
            },
            replace_existing: self.config.replace_existing,
            num_previous_attempts,
        }
    }
}

/// Runs the HA connection slots.
pub struct Supervisor<C: EdgeConnector> {
    shared: Arc<SlotShared<C>>,
}

impl<C: EdgeConnector> Supervisor<C> {
    pub fn new(
        config: SupervisorConfig,
        credentials: Credentials,
        connector: Arc<C>,
        observer: Arc<Observer>,
        handler: Arc<dyn StreamHandler>,
    ) -> Self {
        let store = Arc::new(CredentialStore::new(config.ha_connections));
        Self {
            shared: Arc::new(SlotShared {
                config,
                credentials: Arc::new(credentials),
                store,
                connector,
                observer,
                handler,
            }),
        }
    }

    pub fn credential_store(&self) -> &Arc<CredentialStore> {
        &self.shared.store
    }

    pub fn observer(&self) -> &Arc<Observer> {
        &self.shared.observer
    }

    /// Run every slot until `shutdown` flips true or a permanent
    /// registration failure terminates the supervisor. On shutdown, slots
    /// unregister within the grace period before closing.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) -> Result<(), SupervisorError> {
        let (stop_tx, stop_rx) = watch::channel(false);
        let (fatal_tx, mut fatal_rx) = mpsc::channel::<String>(self.shared.config.ha_connections.max(1));

        let relay = {
            let stop_tx = stop_tx.clone();
            tokio::spawn(async move {
                loop {
                    if *shutdown.borrow() {
                        let _ = stop_tx.send(true);
                        return;
                    }
                    if shutdown.changed().await.is_err() {
                        let _ = stop_tx.send(true);
                        return;
                    }
                }
            })
        };

        let handles: Vec<JoinHandle<()>> = (0..self.shared.config.ha_connections)
            .map(|index| {
                let shared = self.shared.clone();
                let stop = stop_rx.clone();
                let fatal = fatal_tx.clone();
                tokio::spawn(slot_loop(shared, index as u8, stop, fatal))
            })
            .collect();
        drop(fatal_tx);

        let joiner = async {
            for handle in handles {
                let _ = handle.await;
            }
        };
        tokio::pin!(joiner);

        let fatal = tokio::select! {
            reason = fatal_rx.recv() => reason,
            _ = &mut joiner => None,
        };

        let result = match fatal.or_else(|| fatal_rx.try_recv().ok()) {
            Some(reason) => {
                warn!(reason = %reason, "permanent failure, stopping all connections");
                let _ = stop_tx.send(true);
                joiner.await;
                Err(SupervisorError::Permanent { reason })
            }
            None => Ok(()),
        };
        relay.abort();
        result
    }
}

async fn slot_loop<C: EdgeConnector>(
    shared: Arc<SlotShared<C>>,
    index: u8,
    mut stop: watch::Receiver<bool>,
    fatal_tx: mpsc::Sender<String>,
) {
    let mut backoff = Backoff::new(shared.config.backoff.clone());
    let mut attempts: u8 = 0;

    loop {
        if *stop.borrow() {
            return;
        }
        match connect_and_serve(&shared, index, attempts, &mut stop).await {
            Ok(SlotOutcome::Shutdown) => return,
            Ok(SlotOutcome::ConnectionLost) => {
                shared.observer.reconnecting(index);
                backoff.reset();
                if !backoff.wait(&mut stop).await {
                    return;
                }
            }
            Err(SlotError::Duplicate) => {
                if !shared.config.replace_existing {
                    warn!(
                        conn_index = index,
                        "slot is held by another connection, abandoning"
                    );
                    return;
                }
                debug!(conn_index = index, "slot duplicated, retrying with replacement");
                if !backoff.wait(&mut stop).await {
                    return;
                }
            }
            Err(SlotError::Permanent(reason)) => {
                let _ = fatal_tx.send(reason).await;
                return;
            }
            Err(SlotError::Transient(reason)) => {
                debug!(conn_index = index, reason = %reason, "connection attempt failed");
                if !backoff.wait(&mut stop).await {
                    return;
                }
            }
        }
        attempts = attempts.saturating_add(1);
    }
}

fn control_headers() -> Vec<Header> {
    vec![Header::new("edgelink-stream", "control")]
}

async fn connect_and_serve<C: EdgeConnector>(
    shared: &Arc<SlotShared<C>>,
    index: u8,
    attempts: u8,
    stop: &mut watch::Receiver<bool>,
) -> Result<SlotOutcome, SlotError> {
    shared.observer.registering(index);

    let io = shared
        .connector
        .connect()
        .await
        .map_err(|err| SlotError::Transient(err.to_string()))?;
    let muxer = Muxer::start(
        io,
        MuxerConfig {
            name: format!("edge-conn-{index}"),
            is_client: true,
            ..Default::default()
        },
    );

    let control = match muxer.open_stream(control_headers()) {
        Ok(stream) => stream,
        Err(err) => {
            muxer.shutdown();
            let _ = muxer.join().await;
            return Err(SlotError::Transient(err.to_string()));
        }
    };
    let client = RegistrationClient::new(control);

    let options = shared.options(attempts);
    let store = &shared.store;
    let (name, result) = match (
        store.reconnect_token(index),
        store.event_digest(index),
        store.conn_digest(index),
    ) {
        (Some(token), Some(event_digest), Some(conn_digest)) => (
            RpcName::Reconnect,
            client
                .reconnect_connection(
                    token,
                    event_digest,
                    conn_digest,
                    shared.config.hostname.clone(),
                    options,
                )
                .await,
        ),
        _ => (
            RpcName::Register,
            client
                .register_connection(
                    shared.credentials.auth(),
                    shared.credentials.tunnel_id,
                    index,
                    options,
                )
                .await,
        ),
    };

    match result {
        Ok(details) => {
            shared.observer.metrics().inc_reg_success(name);
            shared.store.store_registration(index, &details);
            shared
                .observer
                .metrics()
                .set_tunnel_id(index, details.uuid.to_string());
            shared.observer.registered(index, &details.location);
        }
        Err(err) => {
            let classified = classify(err, name, shared.observer.metrics());
            client.close();
            muxer.shutdown();
            let _ = muxer.join().await;
            return Err(classified);
        }
    }

    if let Ok(info) = client.get_server_info().await {
        debug!(conn_index = index, location = %info.location_name, "edge server info");
    }

    let outcome = loop {
        tokio::select! {
            _ = stop.changed() => break SlotOutcome::Shutdown,
            maybe_stream = muxer.accept_stream() => match maybe_stream {
                Some(stream) => {
                    let handler = shared.handler.clone();
                    tokio::spawn(async move {
                        handler.handle_stream(stream).await;
                    });
                }
                None => break SlotOutcome::ConnectionLost,
            },
        }
    };

    if matches!(outcome, SlotOutcome::Shutdown) {
        match tokio::time::timeout(shared.config.grace_period, client.unregister_connection())
            .await
        {
            Ok(Ok(())) => info!(conn_index = index, "connection unregistered"),
            Ok(Err(err)) => debug!(conn_index = index, error = %err, "unregister failed"),
            Err(_) => debug!(conn_index = index, "unregister timed out"),
        }
    }

    client.close();
    shared.store.set_disconnected(index);
    shared.observer.disconnected(index);
    muxer.shutdown();
    let _ = muxer.join().await;
    Ok(outcome)
}

fn classify(err: RegistrationError, name: RpcName, metrics: &TunnelMetrics) -> SlotError {
    match err {
        RegistrationError::DuplicateConnection => {
            metrics.inc_reg_fail("duplicate", name);
            SlotError::Duplicate
        }
        RegistrationError::Permanent { reason } => {
            metrics.inc_reg_fail("permanent", name);
            SlotError::Permanent(reason)
        }
        RegistrationError::Transient { reason } => {
            metrics.inc_reg_fail("transient", name);
            SlotError::Transient(reason)
        }
        RegistrationError::Rpc(err) => {
            metrics.inc_reg_fail("transient", name);
            SlotError::Transient(err.to_string())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::observer::Observer;
    use edgelink_proto::RpcFault;

    #[test]
    fn test_config_defaults() {
        let config = SupervisorConfig::default();
        assert_eq!(config.ha_connections, 4);
        assert_eq!(config.grace_period, Duration::from_secs(30));
        assert!(!config.replace_existing);
    }

    #[test]
    fn test_classification_counts_reasons() {
        let observer = Observer::new();
        let metrics = observer.metrics();

        assert!(matches!(
            classify(
                RegistrationError::DuplicateConnection,
                RpcName::Register,
                metrics
            ),
            SlotError::Duplicate
        ));
        assert!(matches!(
            classify(
                RegistrationError::Permanent {
                    reason: "bad credentials".to_string()
                },
                RpcName::Register,
                metrics
            ),
            SlotError::Permanent(_)
        ));
        assert!(matches!(
            classify(
                RegistrationError::Rpc(crate::rpc::RpcError::Fault(RpcFault::UnknownMethod {
                    method: "x".to_string()
                })),
                RpcName::Reconnect,
                metrics
            ),
            SlotError::Transient(_)
        ));

        assert_eq!(metrics.reg_fail_count("duplicate", RpcName::Register), 1);
        assert_eq!(metrics.reg_fail_count("permanent", RpcName::Register), 1);
        assert_eq!(metrics.reg_fail_count("transient", RpcName::Reconnect), 1);
    }
}
