//! Funnel tracker: keyed registry of per-flow socket owners
//!
//! A funnel owns the kernel socket and rewrite state for one client-visible
//! flow. The tracker guarantees at most one funnel per key: replacement
//! closes the old funnel before the new one becomes observable, and
//! unregistration only removes the exact funnel it is given, so a listener
//! racing a replacement cannot evict its successor. Lookups are O(1) under
//! a single mutex; funnel construction and close both run outside it.

use crate::proxy::IcmpEchoFlow;
use crate::IcmpError;
use std::collections::HashMap;
use std::fmt;
use std::net::IpAddr;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Flow identity: source, destination, and the client's original echo ID.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FunnelKey {
    pub src: IpAddr,
    pub dst: IpAddr,
    pub echo_id: u16,
}

impl fmt::Display for FunnelKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{}", self.src, self.dst, self.echo_id)
    }
}

/// The closed set of funnel variants. ICMP echo is the only flow kind
/// today; UDP flows would slot in as a second variant.
pub enum Funnel {
    IcmpEcho(IcmpEchoFlow),
}

impl Funnel {
    /// Release the owned socket and stop the response listener. Idempotent;
    /// the underlying teardown runs at most once.
    pub fn close(&self) -> Result<(), IcmpError> {
        match self {
            Funnel::IcmpEcho(flow) => flow.close(),
        }
    }

    /// Wall-clock instant of the last send or receive on this flow.
    pub fn last_activity(&self) -> Instant {
        match self {
            Funnel::IcmpEcho(flow) => flow.last_activity(),
        }
    }

    /// Value equality across funnels of the same kind.
    pub fn equal(&self, other: &Funnel) -> bool {
        match (self, other) {
            (Funnel::IcmpEcho(a), Funnel::IcmpEcho(b)) => a.equal(b),
        }
    }
}

/// Thread-safe funnel registry with idle eviction.
pub struct FunnelTracker {
    funnels: Mutex<HashMap<FunnelKey, Arc<Funnel>>>,
}

impl FunnelTracker {
    pub fn new() -> Self {
        Self {
            funnels: Mutex::new(HashMap::new()),
        }
    }

    /// Find the funnel for `key`, or build one with `make_new`.
    ///
    /// If a funnel exists and `should_replace` approves it, the old funnel
    /// is closed (best effort) before the replacement is inserted. Returns
    /// the resident funnel and whether it was newly built; `make_new`
    /// failures bubble out with the map unchanged.
    pub fn get_or_register<R, M>(
        &self,
        key: FunnelKey,
        should_replace: R,
        make_new: M,
    ) -> Result<(Arc<Funnel>, bool), IcmpError>
    where
        R: Fn(&Funnel) -> bool,
        M: FnOnce() -> Result<Funnel, IcmpError>,
    {
        let displaced = {
            let mut funnels = self.funnels.lock().unwrap();
            match funnels.get(&key).cloned() {
                Some(existing) if !should_replace(&existing) => {
                    return Ok((existing, false));
                }
                Some(_) => funnels.remove(&key),
                None => None,
            }
        };
        if let Some(old) = displaced {
            debug!(key = %key, "replacing stale funnel");
            if let Err(err) = old.close() {
                warn!(key = %key, error = %err, "failed to close replaced funnel");
            }
        }

        let new = Arc::new(make_new()?);

        let mut funnels = self.funnels.lock().unwrap();
        match funnels.get(&key).cloned() {
            // A racer registered while we were building; keep the policy
            // consistent and apply the predicate to the occupant too.
            Some(occupant) if !should_replace(&occupant) => {
                drop(funnels);
                let _ = new.close();
                Ok((occupant, false))
            }
            _ => {
                let old = funnels.insert(key, new.clone());
                drop(funnels);
                if let Some(old) = old {
                    let _ = old.close();
                }
                Ok((new, true))
            }
        }
    }

    /// Remove `key` only if it still maps to this exact funnel, so a
    /// late unregister cannot evict a replacement. Returns whether an
    /// entry was removed.
    pub fn unregister(&self, key: &FunnelKey, funnel: &Arc<Funnel>) -> bool {
        let mut funnels = self.funnels.lock().unwrap();
        let is_current = funnels
            .get(key)
            .map(|current| Arc::ptr_eq(current, funnel))
            .unwrap_or(false);
        if is_current {
            funnels.remove(key);
            debug!(key = %key, "funnel unregistered");
        }
        is_current
    }

    pub fn len(&self) -> usize {
        self.funnels.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Evict and close funnels idle for longer than `idle_timeout`, checked
    /// once per interval. Runs until the returned handle is aborted.
    pub fn schedule_cleanup(self: &Arc<Self>, idle_timeout: Duration) -> JoinHandle<()> {
        let tracker = self.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(idle_timeout);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                interval.tick().await;
                tracker.evict_idle(idle_timeout);
            }
        })
    }

    fn evict_idle(&self, idle_timeout: Duration) {
        let deadline = Instant::now() - idle_timeout;
        let victims: Vec<(FunnelKey, Arc<Funnel>)> = {
            let mut funnels = self.funnels.lock().unwrap();
            let keys: Vec<FunnelKey> = funnels
                .iter()
                .filter(|(_, funnel)| funnel.last_activity() < deadline)
                .map(|(key, _)| *key)
                .collect();
            keys.into_iter()
                .filter_map(|key| funnels.remove(&key).map(|funnel| (key, funnel)))
                .collect()
        };
        for (key, funnel) in victims {
            debug!(key = %key, "evicting idle funnel");
            if let Err(err) = funnel.close() {
                warn!(key = %key, error = %err, "failed to close idle funnel");
            }
        }
    }
}

impl Default for FunnelTracker {
    fn default() -> Self {
        Self::new()
    }
}
