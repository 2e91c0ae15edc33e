/*!
The daemon's view of a bundle.

The wire-model bundle from `aloft-bp` is wrapped with everything the
forwarding engine tracks per bundle: the forwarding log, custody state, and
the active custody timers. All of it sits behind one per-bundle lock.

The daemon's pending table holds the only strong references
([`BundleRef`]); timers and links carry the [`BundleId`] and resolve it
through the table, so a deleted bundle cannot be resurrected by a late
timer.
*/

use crate::fwd_log::ForwardingLog;
use crate::timers::TimerHandle;
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard};

/// Daemon-assigned bundle identity, unique for the life of the process
/// and the canonical cross-subsystem handle.
pub type BundleId = u64;

pub type BundleRef = Arc<Bundle>;

/// Mutable per-bundle engine state, guarded by the bundle lock.
#[derive(Default)]
pub struct BundleState {
    /// The parsed bundle.
    pub bundle: aloft_bp::bundle::Bundle,
    /// History of forwarding decisions.
    pub fwdlog: ForwardingLog,
    /// This node currently holds custody.
    pub local_custody: bool,
    /// Custody is held on behalf of a BIBE encapsulation.
    pub bibe_custody: bool,
    /// One active custody timer per in-flight link.
    pub custody_timers: Vec<TimerHandle>,
    /// Timer posting `BundleExpired` at end of lifetime.
    pub expiration_timer: Option<TimerHandle>,
    /// Payload bytes reserved against the payload store.
    pub payload_reservation: u64,
}

pub struct Bundle {
    id: BundleId,
    state: Mutex<BundleState>,
}

impl Bundle {
    pub fn new(id: BundleId, bundle: aloft_bp::bundle::Bundle) -> BundleRef {
        Arc::new(Self {
            id,
            state: Mutex::new(BundleState {
                bundle,
                ..Default::default()
            }),
        })
    }

    pub fn id(&self) -> BundleId {
        self.id
    }

    /// Acquires the bundle lock.
    pub fn lock(&self) -> MutexGuard<'_, BundleState> {
        self.state.lock().expect("lock poisoned")
    }

    /// Destination EID, snapshotted under the lock.
    pub fn dest(&self) -> aloft_bp::eid::EndpointId {
        self.lock().bundle.dest.clone()
    }

    /// Previous-hop EID, snapshotted under the lock.
    pub fn prevhop(&self) -> aloft_bp::eid::EndpointId {
        self.lock().bundle.prevhop.clone()
    }

    pub fn custody_requested(&self) -> bool {
        self.lock().bundle.flags.custody_requested
    }

    /// Whether the bundle's lifetime has elapsed, judged against the DTN
    /// epoch clock. A bundle carrying an age uses the age instead of the
    /// creation timestamp.
    pub fn expired(&self) -> bool {
        let state = self.lock();
        if let Some(age_ms) = state.bundle.age {
            return age_ms / 1000 >= state.bundle.lifetime;
        }
        let now = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0)
            .saturating_sub(aloft_bp::creation_timestamp::DTN_EPOCH_OFFSET);
        now >= state.bundle.timestamp.seconds.saturating_add(state.bundle.lifetime)
    }
}

impl core::fmt::Debug for Bundle {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Bundle").field("id", &self.id).finish()
    }
}

/// The daemon's pending-bundle table.
///
/// Iteration hands out a snapshot of ids rather than holding the map lock
/// across per-bundle work, so a `route_bundle` call that takes many other
/// locks never runs under it.
#[derive(Default)]
pub struct PendingBundles {
    map: Mutex<BTreeMap<BundleId, BundleRef>>,
}

impl PendingBundles {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, bundle: BundleRef) {
        self.map
            .lock()
            .expect("lock poisoned")
            .insert(bundle.id(), bundle);
    }

    pub fn find(&self, id: BundleId) -> Option<BundleRef> {
        self.map.lock().expect("lock poisoned").get(&id).cloned()
    }

    pub fn remove(&self, id: BundleId) -> Option<BundleRef> {
        self.map.lock().expect("lock poisoned").remove(&id)
    }

    pub fn len(&self) -> usize {
        self.map.lock().expect("lock poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.lock().expect("lock poisoned").is_empty()
    }

    /// Ids of every pending bundle at this instant.
    pub fn ids(&self) -> Vec<BundleId> {
        self.map.lock().expect("lock poisoned").keys().copied().collect()
    }
}
