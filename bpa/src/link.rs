/*!
The link abstraction the forwarding engine routes onto.

A [`Link`] is the engine's view of a convergence-layer adapter: a stable
name, the remote node's EID, availability state, and two bundle-id queues:
`queue` for bundles handed to the link but not yet passed to the CL, and
`inflight` for bundles the CL has accepted but not confirmed. The CL itself
lives outside this crate and drives the state transitions by posting
events.
*/

use crate::bundle::BundleId;
use std::collections::VecDeque;
use std::sync::Mutex;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    /// The link cannot currently be opened.
    Unavailable,
    /// The link could be opened on demand.
    Available,
    /// An open is in progress.
    Opening,
    /// The link is open and can carry bundles.
    Open,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkType {
    /// Expected to be connected at all times.
    AlwaysOn,
    /// Opened when traffic arrives for it.
    OnDemand,
    /// Comes and goes outside our control.
    Opportunistic,
    /// Up during scheduled contact windows.
    Scheduled,
}

/// Tuning knobs for a link.
#[derive(Debug, Clone, Copy)]
pub struct LinkParams {
    /// Hint for how long the link may stay down before queued bundles
    /// should be rerouted, in seconds.
    pub potential_downtime: u32,
    /// Queue low-water mark: `queue_has_space` is false at or above this
    /// depth.
    pub queue_limit: usize,
}

impl Default for LinkParams {
    fn default() -> Self {
        Self {
            potential_downtime: 30,
            queue_limit: 1024,
        }
    }
}

#[derive(Debug)]
struct LinkInner {
    remote_eid: aloft_bp::eid::EndpointId,
    state: LinkState,
    queue: VecDeque<BundleId>,
    inflight: VecDeque<BundleId>,
}

#[derive(Debug)]
pub struct Link {
    name: String,
    link_type: LinkType,
    params: LinkParams,
    inner: Mutex<LinkInner>,
}

impl Link {
    pub fn new(
        name: &str,
        remote_eid: aloft_bp::eid::EndpointId,
        link_type: LinkType,
        params: LinkParams,
    ) -> Self {
        Self {
            name: name.to_string(),
            link_type,
            params,
            inner: Mutex::new(LinkInner {
                remote_eid,
                state: LinkState::Unavailable,
                queue: VecDeque::new(),
                inflight: VecDeque::new(),
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn link_type(&self) -> LinkType {
        self.link_type
    }

    pub fn params(&self) -> &LinkParams {
        &self.params
    }

    pub fn remote_eid(&self) -> aloft_bp::eid::EndpointId {
        self.inner.lock().expect("lock poisoned").remote_eid.clone()
    }

    pub fn set_remote_eid(&self, eid: aloft_bp::eid::EndpointId) {
        self.inner.lock().expect("lock poisoned").remote_eid = eid;
    }

    pub fn state(&self) -> LinkState {
        self.inner.lock().expect("lock poisoned").state
    }

    pub fn set_state(&self, state: LinkState) {
        self.inner.lock().expect("lock poisoned").state = state;
    }

    pub fn is_open(&self) -> bool {
        self.state() == LinkState::Open
    }

    pub fn is_opening(&self) -> bool {
        self.state() == LinkState::Opening
    }

    pub fn is_available(&self) -> bool {
        self.state() == LinkState::Available
    }

    /// Whether the pending queue is below its low-water mark.
    pub fn queue_has_space(&self) -> bool {
        self.inner.lock().expect("lock poisoned").queue.len() < self.params.queue_limit
    }

    pub fn queue_len(&self) -> usize {
        self.inner.lock().expect("lock poisoned").queue.len()
    }

    /// Snapshot of the pending queue.
    pub fn queued_bundles(&self) -> Vec<BundleId> {
        self.inner.lock().expect("lock poisoned").queue.iter().copied().collect()
    }

    /// Snapshot of the in-flight set.
    pub fn inflight_bundles(&self) -> Vec<BundleId> {
        self.inner.lock().expect("lock poisoned").inflight.iter().copied().collect()
    }

    pub fn enqueue(&self, id: BundleId) {
        self.inner.lock().expect("lock poisoned").queue.push_back(id);
    }

    /// Moves a bundle from the pending queue to the in-flight set,
    /// e.g. when the CL takes it. Returns whether it was queued.
    pub fn start_transmit(&self, id: BundleId) -> bool {
        let mut inner = self.inner.lock().expect("lock poisoned");
        if let Some(at) = inner.queue.iter().position(|q| *q == id) {
            inner.queue.remove(at);
            inner.inflight.push_back(id);
            true
        } else {
            false
        }
    }

    /// Removes a bundle from both queues. Returns whether it was present.
    pub fn remove(&self, id: BundleId) -> bool {
        let mut inner = self.inner.lock().expect("lock poisoned");
        let mut removed = false;
        if let Some(at) = inner.queue.iter().position(|q| *q == id) {
            inner.queue.remove(at);
            removed = true;
        }
        if let Some(at) = inner.inflight.iter().position(|q| *q == id) {
            inner.inflight.remove(at);
            removed = true;
        }
        removed
    }

    pub fn is_queued(&self, id: BundleId) -> bool {
        let inner = self.inner.lock().expect("lock poisoned");
        inner.queue.contains(&id) || inner.inflight.contains(&id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn queue_discipline() {
        let link = Link::new(
            "l1",
            "dtn://peer.dtn".parse().unwrap(),
            LinkType::OnDemand,
            LinkParams {
                potential_downtime: 5,
                queue_limit: 2,
            },
        );

        assert!(link.queue_has_space());
        link.enqueue(1);
        link.enqueue(2);
        assert!(!link.queue_has_space());

        assert!(link.start_transmit(1));
        assert!(link.queue_has_space());
        assert_eq!(link.inflight_bundles(), vec![1]);

        assert!(link.remove(1));
        assert!(link.remove(2));
        assert!(!link.remove(2));
        assert!(!link.is_queued(1));
    }
}
