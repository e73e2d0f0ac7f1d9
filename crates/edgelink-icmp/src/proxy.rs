//! ICMP proxy: per-flow socket ownership and reply fan-in
//!
//! Each echo request from the edge resolves, through the funnel tracker, to
//! a flow owning one unprivileged datagram ICMP socket. The kernel assigns
//! the socket a port; outbound echoes are rewritten to that port as their
//! echo ID, so the kernel steers matching replies back to the same socket.
//! A listener task per flow rewrites replies to the client's original echo
//! ID and hands them to the client's datagram responder.

use crate::funnel::{Funnel, FunnelKey, FunnelTracker};
use crate::packet::{encode_echo_request, parse_message, EchoPacket, IcmpEcho, IcmpMessage};
use crate::{IcmpError, MTU};
use async_trait::async_trait;
use socket2::{Domain, Protocol, Socket, Type};
use std::net::{IpAddr, SocketAddr, SocketAddrV6};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::net::UdpSocket;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::debug;

/// Path the kernel exposes the unprivileged-ping group range under.
/// IPv4 and IPv6 share it.
const PING_GROUP_RANGE: &str = "/proc/sys/net/ipv4/ping_group_range";

/// Seam to the client's datagram session. The proxy forwards rewritten
/// replies through it and replaces a flow's socket when the responder is
/// no longer live (the client moved or reconnected).
#[async_trait]
pub trait FlowResponder: Send + Sync {
    fn is_live(&self) -> bool;

    async fn return_reply(&self, packet: EchoPacket) -> Result<(), IcmpError>;
}

/// One ICMP echo flow: the owned socket plus the echo-ID rewrite pair.
pub struct IcmpEchoFlow {
    socket: UdpSocket,
    responder: Arc<dyn FlowResponder>,
    src: IpAddr,
    assigned_id: u16,
    original_id: u16,
    v6: bool,
    last_activity: Mutex<Instant>,
    closed: AtomicBool,
    shutdown: Notify,
}

impl IcmpEchoFlow {
    /// Wrap an already-bound socket. The kernel-assigned local port becomes
    /// the on-the-wire echo ID for this flow.
    pub fn new(
        socket: UdpSocket,
        responder: Arc<dyn FlowResponder>,
        src: IpAddr,
        original_id: u16,
    ) -> Result<Self, IcmpError> {
        let local = socket.local_addr()?;
        Ok(Self {
            assigned_id: local.port(),
            v6: local.is_ipv6(),
            socket,
            responder,
            src,
            original_id,
            last_activity: Mutex::new(Instant::now()),
            closed: AtomicBool::new(false),
            shutdown: Notify::new(),
        })
    }

    pub fn assigned_id(&self) -> u16 {
        self.assigned_id
    }

    pub fn original_id(&self) -> u16 {
        self.original_id
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    pub fn responder_live(&self) -> bool {
        self.responder.is_live()
    }

    pub fn last_activity(&self) -> Instant {
        *self.last_activity.lock().unwrap()
    }

    pub fn equal(&self, other: &IcmpEchoFlow) -> bool {
        self.src == other.src
            && self.assigned_id == other.assigned_id
            && self.original_id == other.original_id
    }

    pub(crate) fn touch(&self) {
        *self.last_activity.lock().unwrap() = Instant::now();
    }

    /// Send the client's echo request to the destination with the echo ID
    /// rewritten to this flow's socket port.
    pub async fn send_to_dst(&self, dst: IpAddr, echo: &IcmpEcho) -> Result<(), IcmpError> {
        if self.is_closed() {
            return Err(IcmpError::FlowClosed);
        }
        let rewritten = IcmpEcho {
            id: self.assigned_id,
            seq: echo.seq,
            payload: echo.payload.clone(),
        };
        let datagram = encode_echo_request(&rewritten, self.v6);
        self.socket
            .send_to(&datagram, SocketAddr::new(dst, 0))
            .await?;
        self.touch();
        Ok(())
    }

    /// Parse one datagram from the socket and forward an echo reply to the
    /// client with the original echo ID restored. Errors here are
    /// retryable: the listener logs and keeps reading.
    pub async fn handle_reply(&self, datagram: &[u8], from: IpAddr) -> Result<(), IcmpError> {
        let message = parse_message(datagram, self.v6)?;
        let echo = match message {
            IcmpMessage::EchoReply(echo) => echo,
            other => {
                debug!(from = %from, message = ?other, "dropping non-echo-reply datagram");
                return Err(IcmpError::Malformed("expected ICMP echo reply"));
            }
        };

        let packet = EchoPacket {
            src: from,
            dst: self.src,
            echo: IcmpEcho {
                id: self.original_id,
                seq: echo.seq,
                payload: echo.payload,
            },
            is_reply: true,
        };
        self.responder.return_reply(packet).await?;
        self.touch();
        Ok(())
    }

    /// Signal teardown. Idempotent; the socket is released when the flow
    /// drops and the listener has observed the signal.
    pub fn close(&self) -> Result<(), IcmpError> {
        if !self.closed.swap(true, Ordering::AcqRel) {
            self.shutdown.notify_waiters();
        }
        Ok(())
    }

    pub(crate) async fn wait_closed(&self) {
        loop {
            let notified = self.shutdown.notified();
            if self.is_closed() {
                return;
            }
            notified.await;
        }
    }

    async fn recv_from(&self, buf: &mut [u8]) -> Result<(usize, SocketAddr), IcmpError> {
        Ok(self.socket.recv_from(buf).await?)
    }
}

/// The ICMP proxy. Construction pre-flights the platform; a failure means
/// ICMP stays disabled while the rest of the daemon runs.
pub struct IcmpProxy {
    tracker: Arc<FunnelTracker>,
    listen_ip: IpAddr,
    ipv6_zone: Option<String>,
    idle_timeout: Duration,
}

impl IcmpProxy {
    pub fn new(
        listen_ip: IpAddr,
        ipv6_zone: Option<String>,
        idle_timeout: Duration,
    ) -> Result<Self, IcmpError> {
        test_permission(listen_ip, ipv6_zone.as_deref())?;
        Ok(Self {
            tracker: Arc::new(FunnelTracker::new()),
            listen_ip,
            ipv6_zone,
            idle_timeout,
        })
    }

    pub fn tracker(&self) -> &Arc<FunnelTracker> {
        &self.tracker
    }

    /// Proxy one echo request from the edge: find or open the flow's
    /// socket, spawn its response listener on first use, and send the
    /// rewritten echo to the destination.
    pub async fn request(
        &self,
        packet: &EchoPacket,
        responder: Arc<dyn FlowResponder>,
    ) -> Result<(), IcmpError> {
        if packet.is_reply {
            return Err(IcmpError::Malformed("expected ICMP echo request"));
        }
        if packet.dst.is_ipv6() != self.listen_ip.is_ipv6() {
            return Err(IcmpError::Malformed("address family mismatch"));
        }

        let key = FunnelKey {
            src: packet.src,
            dst: packet.dst,
            echo_id: packet.echo.id,
        };
        let should_replace = |funnel: &Funnel| {
            let Funnel::IcmpEcho(flow) = funnel;
            // A dead responder means the client went away; a stale socket
            // must not keep absorbing its traffic.
            !flow.responder_live()
        };

        let listen_ip = self.listen_ip;
        let zone = self.ipv6_zone.clone();
        let flow_responder = responder.clone();
        let src = packet.src;
        let original_id = packet.echo.id;
        let make_new = move || -> Result<Funnel, IcmpError> {
            let socket = open_icmp_socket(listen_ip, zone.as_deref())?;
            let flow = IcmpEchoFlow::new(socket, flow_responder, src, original_id)?;
            debug!(
                port = flow.assigned_id(),
                original_echo_id = original_id,
                "opened ICMP socket"
            );
            Ok(Funnel::IcmpEcho(flow))
        };

        let (funnel, is_new) = self.tracker.get_or_register(key, should_replace, make_new)?;
        if is_new {
            debug!(key = %key, "new ICMP flow");
            spawn_response_listener(self.tracker.clone(), key, funnel.clone());
        }

        let Funnel::IcmpEcho(flow) = &*funnel;
        flow.send_to_dst(packet.dst, &packet.echo).await
    }

    /// Run idle eviction until the returned handle is aborted.
    pub fn spawn_cleanup(&self) -> JoinHandle<()> {
        self.tracker.schedule_cleanup(self.idle_timeout)
    }
}

fn spawn_response_listener(
    tracker: Arc<FunnelTracker>,
    key: FunnelKey,
    funnel: Arc<Funnel>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let Funnel::IcmpEcho(flow) = &*funnel;
        let mut buf = [0u8; MTU];
        loop {
            tokio::select! {
                _ = flow.wait_closed() => break,
                result = flow.recv_from(&mut buf) => match result {
                    Err(err) => {
                        // Socket gone: not retryable, tear the flow down.
                        debug!(key = %key, error = %err, "ICMP listener socket error");
                        break;
                    }
                    Ok((n, from)) => {
                        if let Err(err) = flow.handle_reply(&buf[..n], from.ip()).await {
                            debug!(key = %key, error = %err, "skipping ICMP datagram");
                        }
                    }
                },
            }
        }
        tracker.unregister(&key, &funnel);
    })
}

/// Pre-flight the platform before claiming ICMP readiness: the process GID
/// must fall in the unprivileged-ping group range, and a probe socket must
/// open.
fn test_permission(listen_ip: IpAddr, zone: Option<&str>) -> Result<(), IcmpError> {
    if cfg!(target_os = "linux") && listen_ip.is_ipv4() {
        check_ping_group_range()?;
    }
    let probe = open_dgram_socket(listen_ip, zone)?;
    drop(probe);
    Ok(())
}

fn check_ping_group_range() -> Result<(), IcmpError> {
    let content = std::fs::read_to_string(PING_GROUP_RANGE)
        .map_err(|err| IcmpError::PermissionDenied(format!("cannot read {PING_GROUP_RANGE}: {err}")))?;
    let mut bounds = content
        .split_whitespace()
        .filter_map(|field| field.parse::<u32>().ok());
    let (Some(group_min), Some(group_max)) = (bounds.next(), bounds.next()) else {
        return Err(IcmpError::PermissionDenied(format!(
            "no group range found in {PING_GROUP_RANGE}"
        )));
    };

    let gid = process_gid()?;
    if gid < group_min || gid > group_max {
        return Err(IcmpError::PermissionDenied(format!(
            "group ID {gid} is outside ping_group_range {group_min}..{group_max}"
        )));
    }
    Ok(())
}

fn process_gid() -> Result<u32, IcmpError> {
    let status = std::fs::read_to_string("/proc/self/status")
        .map_err(|err| IcmpError::PermissionDenied(format!("cannot read process status: {err}")))?;
    status
        .lines()
        .find_map(|line| line.strip_prefix("Gid:"))
        .and_then(|rest| rest.split_whitespace().next())
        .and_then(|gid| gid.parse::<u32>().ok())
        .ok_or_else(|| IcmpError::PermissionDenied("cannot determine process GID".to_string()))
}

fn open_dgram_socket(listen_ip: IpAddr, zone: Option<&str>) -> Result<Socket, IcmpError> {
    let (domain, protocol) = if listen_ip.is_ipv6() {
        (Domain::IPV6, Protocol::ICMPV6)
    } else {
        (Domain::IPV4, Protocol::ICMPV4)
    };
    let socket = Socket::new(domain, Type::DGRAM, Some(protocol))
        .map_err(|err| IcmpError::PermissionDenied(err.to_string()))?;

    let bind_addr = match (listen_ip, zone) {
        (IpAddr::V6(v6), Some(zone)) => {
            let scope_id = zone
                .parse::<u32>()
                .map_err(|_| IcmpError::InvalidZone(zone.to_string()))?;
            SocketAddr::V6(SocketAddrV6::new(v6, 0, 0, scope_id))
        }
        _ => SocketAddr::new(listen_ip, 0),
    };
    socket.bind(&bind_addr.into())?;
    socket.set_nonblocking(true)?;
    Ok(socket)
}

fn open_icmp_socket(listen_ip: IpAddr, zone: Option<&str>) -> Result<UdpSocket, IcmpError> {
    let socket = open_dgram_socket(listen_ip, zone)?;
    let std_socket: std::net::UdpSocket = socket.into();
    Ok(UdpSocket::from_std(std_socket)?)
}
