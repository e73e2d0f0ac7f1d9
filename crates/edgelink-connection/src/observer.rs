//! Observer: connection events and counters
//!
//! A passive sink. Slots report lifecycle events and registration outcomes
//! here; the enclosing daemon subscribes for its dashboard or exporter.
//! No business logic lives in this module.

use edgelink_proto::RpcName;
use std::collections::HashMap;
use std::sync::Mutex;
use tokio::sync::broadcast;
use tracing::{info, warn};

/// Lifecycle events for one HA connection slot
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionEvent {
    Registering { index: u8 },
    Registered { index: u8, location: String },
    Disconnected { index: u8 },
    Reconnecting { index: u8 },
}

/// Registration counters and the HA tunnel-ID map.
#[derive(Default)]
pub struct TunnelMetrics {
    reg_success: Mutex<HashMap<&'static str, u64>>,
    reg_fail: Mutex<HashMap<(String, &'static str), u64>>,
    tunnels_ha: Mutex<HashMap<u8, String>>,
}

impl TunnelMetrics {
    pub fn inc_reg_success(&self, name: RpcName) {
        *self
            .reg_success
            .lock()
            .unwrap()
            .entry(name.label())
            .or_insert(0) += 1;
    }

    pub fn inc_reg_fail(&self, reason: &str, name: RpcName) {
        *self
            .reg_fail
            .lock()
            .unwrap()
            .entry((reason.to_string(), name.label()))
            .or_insert(0) += 1;
    }

    pub fn set_tunnel_id(&self, index: u8, tunnel_id: String) {
        self.tunnels_ha.lock().unwrap().insert(index, tunnel_id);
    }

    pub fn reg_success_count(&self, name: RpcName) -> u64 {
        self.reg_success
            .lock()
            .unwrap()
            .get(name.label())
            .copied()
            .unwrap_or(0)
    }

    pub fn reg_fail_count(&self, reason: &str, name: RpcName) -> u64 {
        self.reg_fail
            .lock()
            .unwrap()
            .get(&(reason.to_string(), name.label()))
            .copied()
            .unwrap_or(0)
    }

    pub fn ha_tunnels(&self) -> HashMap<u8, String> {
        self.tunnels_ha.lock().unwrap().clone()
    }
}

/// Event fan-out plus metrics. Cheap to share across slots.
pub struct Observer {
    events: broadcast::Sender<ConnectionEvent>,
    metrics: TunnelMetrics,
}

impl Observer {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(64);
        Self {
            events,
            metrics: TunnelMetrics::default(),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ConnectionEvent> {
        self.events.subscribe()
    }

    pub fn metrics(&self) -> &TunnelMetrics {
        &self.metrics
    }

    pub fn registering(&self, index: u8) {
        info!(conn_index = index, "registering tunnel connection");
        self.send(ConnectionEvent::Registering { index });
    }

    pub fn registered(&self, index: u8, location: &str) {
        info!(conn_index = index, location, "connection registered");
        self.send(ConnectionEvent::Registered {
            index,
            location: location.to_string(),
        });
    }

    pub fn disconnected(&self, index: u8) {
        info!(conn_index = index, "connection disconnected");
        self.send(ConnectionEvent::Disconnected { index });
    }

    pub fn reconnecting(&self, index: u8) {
        warn!(conn_index = index, "connection lost, reconnecting");
        self.send(ConnectionEvent::Reconnecting { index });
    }

    fn send(&self, event: ConnectionEvent) {
        // No subscribers is fine; events are advisory.
        let _ = self.events.send(event);
    }
}

impl Default for Observer {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_events_fan_out() {
        let observer = Observer::new();
        let mut rx = observer.subscribe();

        observer.registering(0);
        observer.registered(0, "AMS");
        observer.disconnected(0);

        assert_eq!(rx.recv().await.unwrap(), ConnectionEvent::Registering { index: 0 });
        assert_eq!(
            rx.recv().await.unwrap(),
            ConnectionEvent::Registered {
                index: 0,
                location: "AMS".to_string()
            }
        );
        assert_eq!(rx.recv().await.unwrap(), ConnectionEvent::Disconnected { index: 0 });
    }

    #[test]
    fn test_counters() {
        let metrics = TunnelMetrics::default();
        metrics.inc_reg_success(RpcName::Register);
        metrics.inc_reg_success(RpcName::Register);
        metrics.inc_reg_fail("duplicate", RpcName::Register);

        assert_eq!(metrics.reg_success_count(RpcName::Register), 2);
        assert_eq!(metrics.reg_fail_count("duplicate", RpcName::Register), 1);
        assert_eq!(metrics.reg_fail_count("duplicate", RpcName::Reconnect), 0);
    }

    #[test]
    fn test_ha_tunnel_map() {
        let metrics = TunnelMetrics::default();
        metrics.set_tunnel_id(0, "uuid-a".to_string());
        metrics.set_tunnel_id(1, "uuid-b".to_string());
        metrics.set_tunnel_id(0, "uuid-c".to_string());

        let map = metrics.ha_tunnels();
        assert_eq!(map.len(), 2);
        assert_eq!(map[&0], "uuid-c");
    }

    #[test]
    fn test_events_without_subscribers_do_not_panic() {
        let observer = Observer::new();
        observer.reconnecting(3);
    }
}
