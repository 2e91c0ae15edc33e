/*!
The aggregate custody signal queue.

Custody dispositions for BIBE transfers accumulate here per custodian EID
until the daemon drains them into an aggregate custody signal bundle.
Generation of the signal bundle itself is the admin layer's job; this is
the hand-off point.
*/

use aloft_bp::admin::CustodyDisposition;
use aloft_bp::eid::EndpointId;
use std::collections::HashMap;
use std::sync::Mutex;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AcsEntry {
    pub transmission_id: u64,
    pub succeeded: bool,
    pub reason: CustodyDisposition,
}

#[derive(Default)]
pub struct AcsQueue {
    pending: Mutex<HashMap<EndpointId, Vec<AcsEntry>>>,
}

impl AcsQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queues a custody disposition for the given custodian.
    pub fn push(&self, custodian: &EndpointId, entry: AcsEntry) {
        self.pending
            .lock()
            .expect("lock poisoned")
            .entry(custodian.clone())
            .or_default()
            .push(entry);
    }

    /// Takes every pending entry for the custodian.
    pub fn drain(&self, custodian: &EndpointId) -> Vec<AcsEntry> {
        self.pending
            .lock()
            .expect("lock poisoned")
            .remove(custodian)
            .unwrap_or_default()
    }

    /// Custodians with pending entries.
    pub fn custodians(&self) -> Vec<EndpointId> {
        self.pending
            .lock()
            .expect("lock poisoned")
            .keys()
            .cloned()
            .collect()
    }

    pub fn pending_count(&self, custodian: &EndpointId) -> usize {
        self.pending
            .lock()
            .expect("lock poisoned")
            .get(custodian)
            .map(Vec::len)
            .unwrap_or(0)
    }
}
