//! Supervisor tests against an in-memory edge speaking the wire protocol

use async_trait::async_trait;
use bytes::BytesMut;
use edgelink_connection::{
    BackoffConfig, ConnectError, ConnectionEvent, Credentials, EdgeConnector, Observer,
    StreamHandler, Supervisor, SupervisorConfig, SupervisorError,
};
use edgelink_mux::{MuxedStream, Muxer, MuxerConfig};
use edgelink_proto::{
    ConnectionDetails, RpcCodec, RpcFault, RpcMessage, RpcName, ServerInfo,
};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::watch;
use uuid::Uuid;

#[derive(Clone, Copy, PartialEq)]
enum EdgeBehavior {
    Accept,
    Duplicate,
    Permanent,
}

struct TestEdge {
    behavior: EdgeBehavior,
    /// RPC methods seen across all sessions, in arrival order
    methods: Mutex<Vec<String>>,
    /// Drop the next session right after answering its registration
    drop_next: AtomicBool,
}

impl TestEdge {
    fn new(behavior: EdgeBehavior) -> Arc<Self> {
        Arc::new(Self {
            behavior,
            methods: Mutex::new(Vec::new()),
            drop_next: AtomicBool::new(false),
        })
    }

    fn methods(&self) -> Vec<String> {
        self.methods.lock().unwrap().clone()
    }

    fn reply_for(&self, method: &str, id: u64) -> RpcMessage {
        let is_registration = method == RpcName::Register.method()
            || method == RpcName::Reconnect.method();
        if is_registration {
            return match self.behavior {
                EdgeBehavior::Duplicate => RpcMessage::Fault {
                    id,
                    fault: RpcFault::DuplicateConnection,
                },
                EdgeBehavior::Permanent => RpcMessage::Fault {
                    id,
                    fault: RpcFault::Permanent {
                        reason: "invalid credentials".to_string(),
                    },
                },
                EdgeBehavior::Accept => RpcMessage::Response {
                    id,
                    body: bincode::serialize(&ConnectionDetails {
                        uuid: Uuid::new_v4(),
                        location: "AMS".to_string(),
                        reconnect_token: b"token".to_vec(),
                        event_digest: b"event".to_vec(),
                        conn_digest: b"conn".to_vec(),
                    })
                    .unwrap(),
                },
            };
        }
        if method == RpcName::ServerInfo.method() {
            return RpcMessage::Response {
                id,
                body: bincode::serialize(&ServerInfo {
                    location_name: "AMS".to_string(),
                })
                .unwrap(),
            };
        }
        // UnregisterConnection and anything else: empty success
        RpcMessage::Response { id, body: Vec::new() }
    }
}

async fn edge_session(edge: Arc<TestEdge>, io: tokio::io::DuplexStream) {
    let muxer = Muxer::start(
        io,
        MuxerConfig {
            name: "edge".to_string(),
            is_client: false,
            ..Default::default()
        },
    );
    let Some(control) = muxer.accept_stream().await else {
        return;
    };
    let _ = control.recv_headers().await;

    let mut buf = BytesMut::new();
    let mut chunk = [0u8; 4096];
    'session: loop {
        match control.read(&mut chunk).await {
            Ok(n) => {
                buf.extend_from_slice(&chunk[..n]);
                while let Ok(Some(message)) = RpcCodec::decode(&mut buf) {
                    if let RpcMessage::Request { id, method, .. } = message {
                        edge.methods.lock().unwrap().push(method.clone());
                        let is_registration = method == RpcName::Register.method()
                            || method == RpcName::Reconnect.method();
                        let reply = edge.reply_for(&method, id);
                        let encoded = RpcCodec::encode(&reply).unwrap();
                        let _ = control.write(&encoded);
                        if is_registration && edge.drop_next.swap(false, Ordering::AcqRel) {
                            // Give the reply a moment to flush, then die.
                            tokio::time::sleep(Duration::from_millis(20)).await;
                            break 'session;
                        }
                    }
                }
            }
            Err(_) => break,
        }
    }
    muxer.shutdown();
    let _ = muxer.join().await;
}

struct TestConnector {
    edge: Arc<TestEdge>,
}

#[async_trait]
impl EdgeConnector for TestConnector {
    type Io = tokio::io::DuplexStream;

    async fn connect(&self) -> Result<Self::Io, ConnectError> {
        let (client_io, server_io) = tokio::io::duplex(256 * 1024);
        tokio::spawn(edge_session(self.edge.clone(), server_io));
        Ok(client_io)
    }
}

struct NoopHandler;

#[async_trait]
impl StreamHandler for NoopHandler {
    async fn handle_stream(&self, stream: Arc<MuxedStream>) {
        stream.close();
    }
}

fn credentials() -> Credentials {
    Credentials {
        account_tag: "acct".to_string(),
        tunnel_secret: vec![1, 2, 3, 4],
        tunnel_id: Uuid::new_v4(),
        tunnel_name: "test-tunnel".to_string(),
    }
}

fn test_config(ha_connections: usize) -> SupervisorConfig {
    SupervisorConfig {
        ha_connections,
        grace_period: Duration::from_secs(2),
        replace_existing: false,
        backoff: BackoffConfig {
            initial: Duration::from_millis(10),
            max: Duration::from_millis(50),
            multiplier: 2.0,
            jitter: 0.0,
        },
        hostname: "origin.test".to_string(),
    }
}

fn supervisor(
    edge: &Arc<TestEdge>,
    config: SupervisorConfig,
) -> Arc<Supervisor<TestConnector>> {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
    Arc::new(Supervisor::new(
        config,
        credentials(),
        Arc::new(TestConnector { edge: edge.clone() }),
        Arc::new(Observer::new()),
        Arc::new(NoopHandler),
    ))
}

async fn wait_for_registered(
    rx: &mut tokio::sync::broadcast::Receiver<ConnectionEvent>,
    count: usize,
) {
    let mut seen = 0;
    while seen < count {
        match tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("timed out waiting for registration")
            .expect("observer channel closed")
        {
            ConnectionEvent::Registered { location, .. } => {
                assert_eq!(location, "AMS");
                seen += 1;
            }
            _ => {}
        }
    }
}

#[tokio::test]
async fn duplicate_connection_abandons_slot_without_replacement() {
    let edge = TestEdge::new(EdgeBehavior::Duplicate);
    let supervisor = supervisor(&edge, test_config(1));
    let (_shutdown_tx, shutdown_rx) = watch::channel(false);

    // The slot observes the duplicate, abandons, and the supervisor drains.
    tokio::time::timeout(Duration::from_secs(5), supervisor.run(shutdown_rx))
        .await
        .expect("supervisor hung on abandoned slot")
        .expect("duplicate is not supervisor-fatal");

    let metrics = supervisor.observer().metrics();
    assert_eq!(metrics.reg_fail_count("duplicate", RpcName::Register), 1);
    assert_eq!(metrics.reg_success_count(RpcName::Register), 0);
    assert!(!supervisor.credential_store().is_connected(0));
    // Exactly one attempt: no retries on an abandoned slot.
    assert_eq!(edge.methods(), vec![RpcName::Register.method().to_string()]);
}

#[tokio::test]
async fn registers_all_slots_and_unregisters_on_shutdown() {
    let edge = TestEdge::new(EdgeBehavior::Accept);
    let supervisor = supervisor(&edge, test_config(2));
    let mut events = supervisor.observer().subscribe();
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let runner = {
        let supervisor = supervisor.clone();
        tokio::spawn(async move { supervisor.run(shutdown_rx).await })
    };

    wait_for_registered(&mut events, 2).await;
    assert_eq!(supervisor.credential_store().connected_count(), 2);
    assert_eq!(
        supervisor
            .observer()
            .metrics()
            .reg_success_count(RpcName::Register),
        2
    );
    assert_eq!(supervisor.observer().metrics().ha_tunnels().len(), 2);

    shutdown_tx.send(true).unwrap();
    tokio::time::timeout(Duration::from_secs(5), runner)
        .await
        .expect("supervisor hung on shutdown")
        .unwrap()
        .unwrap();

    assert_eq!(supervisor.credential_store().connected_count(), 0);
    let unregisters = edge
        .methods()
        .iter()
        .filter(|method| *method == RpcName::Unregister.method())
        .count();
    assert_eq!(unregisters, 2);
}

#[tokio::test]
async fn permanent_failure_terminates_supervisor() {
    let edge = TestEdge::new(EdgeBehavior::Permanent);
    let supervisor = supervisor(&edge, test_config(2));
    let (_shutdown_tx, shutdown_rx) = watch::channel(false);

    let err = tokio::time::timeout(Duration::from_secs(5), supervisor.run(shutdown_rx))
        .await
        .expect("supervisor hung on permanent failure")
        .unwrap_err();
    let SupervisorError::Permanent { reason } = err;
    assert_eq!(reason, "invalid credentials");
}

#[tokio::test]
async fn reconnects_with_cached_token_after_connection_loss() {
    let edge = TestEdge::new(EdgeBehavior::Accept);
    edge.drop_next.store(true, Ordering::Release);

    let supervisor = supervisor(&edge, test_config(1));
    let mut events = supervisor.observer().subscribe();
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let runner = {
        let supervisor = supervisor.clone();
        tokio::spawn(async move { supervisor.run(shutdown_rx).await })
    };

    // First registration, connection drop, then re-registration.
    wait_for_registered(&mut events, 2).await;

    let methods = edge.methods();
    assert!(methods.contains(&RpcName::Register.method().to_string()));
    assert!(
        methods.contains(&RpcName::Reconnect.method().to_string()),
        "expected a reconnect with the cached token, saw {methods:?}"
    );
    assert!(supervisor.credential_store().reconnect_token(0).is_some());

    shutdown_tx.send(true).unwrap();
    tokio::time::timeout(Duration::from_secs(5), runner)
        .await
        .expect("supervisor hung on shutdown")
        .unwrap()
        .unwrap();
}
