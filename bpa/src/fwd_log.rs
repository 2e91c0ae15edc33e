/*!
The per-bundle forwarding log.

Every routing decision leaves a [`ForwardingInfo`] entry: which link or
registration, what action, and the state the attempt is in. Routers consult
the log to avoid re-sending to a next hop that already has the bundle, and
the custody machinery keys its timers off `Queued`/`Transmitted` entries.

States and actions are bit flags so count queries can take masks like
`TRANSMITTED | DELIVERED`.

The log itself is plain data; callers access it through the owning
bundle's lock.
*/

use crate::custody::CustodyTimerSpec;
use crate::link::Link;
use aloft_bp::eid::EndpointId;

/// State of one forwarding attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ForwardingState {
    /// No entry; the return value for "nothing logged".
    None,
    /// Currently queued on the link or being sent.
    Queued,
    /// Successfully transmitted.
    Transmitted,
    /// Transmission failed.
    TransmitFailed,
    /// Transmission cancelled.
    Cancelled,
    /// Custody transfer timed out after transmission.
    CustodyTimeout,
    /// Pending delivery to a local registration.
    PendingDelivery,
    /// Delivered to a local registration.
    Delivered,
    /// Transmission suppressed.
    Suppressed,
    /// Where the bundle came from.
    Received,
}

impl ForwardingState {
    /// Inverse of [`ForwardingState::mask`] for single-state masks.
    pub fn from_mask(mask: u32) -> Option<Self> {
        match mask {
            0 => Some(ForwardingState::None),
            m if m == 1 << 0 => Some(ForwardingState::Queued),
            m if m == 1 << 1 => Some(ForwardingState::Transmitted),
            m if m == 1 << 2 => Some(ForwardingState::TransmitFailed),
            m if m == 1 << 3 => Some(ForwardingState::Cancelled),
            m if m == 1 << 4 => Some(ForwardingState::CustodyTimeout),
            m if m == 1 << 5 => Some(ForwardingState::PendingDelivery),
            m if m == 1 << 6 => Some(ForwardingState::Delivered),
            m if m == 1 << 7 => Some(ForwardingState::Suppressed),
            m if m == 1 << 10 => Some(ForwardingState::Received),
            _ => None,
        }
    }

    pub fn mask(self) -> u32 {
        match self {
            ForwardingState::None => 0,
            ForwardingState::Queued => 1 << 0,
            ForwardingState::Transmitted => 1 << 1,
            ForwardingState::TransmitFailed => 1 << 2,
            ForwardingState::Cancelled => 1 << 3,
            ForwardingState::CustodyTimeout => 1 << 4,
            ForwardingState::PendingDelivery => 1 << 5,
            ForwardingState::Delivered => 1 << 6,
            ForwardingState::Suppressed => 1 << 7,
            ForwardingState::Received => 1 << 10,
        }
    }
}

/// Matches every state in a mask query.
pub const ANY_STATE: u32 = 0xffff_ffff;

/// The forwarding action of an entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ForwardAction {
    /// Forward the bundle to only this next hop.
    Forward,
    /// Forward a copy of the bundle.
    Copy,
}

impl ForwardAction {
    pub fn mask(self) -> u32 {
        match self {
            ForwardAction::Forward => 1 << 0,
            ForwardAction::Copy => 1 << 1,
        }
    }

    /// Inverse of [`ForwardAction::mask`] for single-action masks.
    pub fn from_mask(mask: u32) -> Option<Self> {
        match mask {
            m if m == 1 << 0 => Some(ForwardAction::Forward),
            m if m == 1 << 1 => Some(ForwardAction::Copy),
            _ => None,
        }
    }
}

/// Matches every action in a mask query.
pub const ANY_ACTION: u32 = 0xffff_ffff;

/// The EID recorded on entries that apply to every next hop (e.g. a
/// suppress-all marker).
pub fn wildcard_eid() -> EndpointId {
    EndpointId::new("*", "*")
}

/// One forwarding-log entry.
#[derive(Debug, Clone)]
pub struct ForwardingInfo {
    pub state: ForwardingState,
    pub action: ForwardAction,
    /// Name of the link, or `registration-<id>` / `eid-<uri>` for
    /// non-link entries.
    pub link_name: String,
    /// Registration id for delivery entries.
    pub regid: Option<u32>,
    /// EID of the next hop node or registration endpoint.
    pub remote_eid: EndpointId,
    /// Wall-clock time of the last state change.
    pub timestamp: time::OffsetDateTime,
    /// The custody timer parameters the routing decision carried.
    pub custody_spec: CustodyTimerSpec,
}

impl ForwardingInfo {
    fn set_state(&mut self, state: ForwardingState) {
        self.state = state;
        self.timestamp = time::OffsetDateTime::now_utc();
    }
}

/// The ordered history of forwarding decisions for one bundle.
#[derive(Debug, Default, Clone)]
pub struct ForwardingLog {
    entries: Vec<ForwardingInfo>,
}

impl ForwardingLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn entries(&self) -> &[ForwardingInfo] {
        &self.entries
    }

    /// Appends a reconstructed entry, e.g. during store recovery.
    pub fn push_entry(&mut self, entry: ForwardingInfo) {
        self.entries.push(entry);
    }

    pub fn add_entry_for_link(
        &mut self,
        link: &Link,
        action: ForwardAction,
        state: ForwardingState,
        custody_spec: CustodyTimerSpec,
    ) {
        self.entries.push(ForwardingInfo {
            state,
            action,
            link_name: link.name().to_string(),
            regid: None,
            remote_eid: link.remote_eid(),
            timestamp: time::OffsetDateTime::now_utc(),
            custody_spec,
        });
    }

    pub fn add_entry_for_registration(
        &mut self,
        regid: u32,
        endpoint: &EndpointId,
        action: ForwardAction,
        state: ForwardingState,
    ) {
        self.entries.push(ForwardingInfo {
            state,
            action,
            link_name: format!("registration-{regid}"),
            regid: Some(regid),
            remote_eid: endpoint.clone(),
            timestamp: time::OffsetDateTime::now_utc(),
            custody_spec: CustodyTimerSpec::default(),
        });
    }

    pub fn add_entry_for_eid(
        &mut self,
        eid: &EndpointId,
        action: ForwardAction,
        state: ForwardingState,
    ) {
        self.entries.push(ForwardingInfo {
            state,
            action,
            link_name: format!("eid-{eid}"),
            regid: None,
            remote_eid: eid.clone(),
            timestamp: time::OffsetDateTime::now_utc(),
            custody_spec: CustodyTimerSpec::default(),
        });
    }

    /// The most recent entry for the link, scanning backwards.
    ///
    /// An entry only matches while the link still leads to the same
    /// remote EID the entry recorded; a stale remote means no match.
    pub fn get_latest_entry_for_link(&self, link: &Link) -> Option<&ForwardingInfo> {
        let remote = link.remote_eid();
        for entry in self.entries.iter().rev() {
            if entry.link_name == link.name() {
                if !entry.remote_eid.is_null() && entry.remote_eid != remote {
                    return None;
                }
                return Some(entry);
            }
        }
        None
    }

    /// The state of the most recent entry for the link.
    pub fn get_latest_state_for_link(&self, link: &Link) -> ForwardingState {
        self.get_latest_entry_for_link(link)
            .map(|e| e.state)
            .unwrap_or(ForwardingState::None)
    }

    /// The most recent entry for a registration id.
    pub fn get_latest_entry_for_registration(&self, regid: u32) -> Option<&ForwardingInfo> {
        self.entries
            .iter()
            .rev()
            .find(|entry| entry.regid == Some(regid))
    }

    /// The most recent entry in the given state.
    pub fn get_latest_entry_in_state(&self, state: ForwardingState) -> Option<&ForwardingInfo> {
        self.entries.iter().rev().find(|entry| entry.state == state)
    }

    /// Rewrites the most recent matching link entry's state, bumping its
    /// timestamp. Returns whether an entry was found.
    pub fn update_for_link(&mut self, link: &Link, state: ForwardingState) -> bool {
        let remote = link.remote_eid();
        for entry in self.entries.iter_mut().rev() {
            if entry.link_name == link.name() {
                if !entry.remote_eid.is_null() && entry.remote_eid != remote {
                    return false;
                }
                entry.set_state(state);
                return true;
            }
        }
        false
    }

    /// Rewrites the most recent matching registration entry's state.
    pub fn update_for_registration(&mut self, regid: u32, state: ForwardingState) -> bool {
        for entry in self.entries.iter_mut().rev() {
            if entry.regid == Some(regid) {
                entry.set_state(state);
                return true;
            }
        }
        false
    }

    /// Rewrites every entry in `old_state` to `new_state`.
    pub fn update_all(&mut self, old_state: ForwardingState, new_state: ForwardingState) {
        for entry in self.entries.iter_mut() {
            if entry.state == old_state {
                entry.set_state(new_state);
            }
        }
    }

    /// Counts entries whose state and action both fall within the masks.
    pub fn get_count(&self, states: u32, actions: u32) -> usize {
        self.entries
            .iter()
            .filter(|e| e.state.mask() & states != 0 && e.action.mask() & actions != 0)
            .count()
    }

    /// As [`ForwardingLog::get_count`], restricted to entries for the
    /// given remote EID; an entry recorded against the wildcard EID
    /// matches any query.
    pub fn get_count_for_eid(&self, eid: &EndpointId, states: u32, actions: u32) -> usize {
        let wild = wildcard_eid();
        self.entries
            .iter()
            .filter(|e| e.remote_eid == wild || e.remote_eid == *eid)
            .filter(|e| e.state.mask() & states != 0 && e.action.mask() & actions != 0)
            .count()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::link::{LinkParams, LinkType};

    fn link(name: &str, remote: &str) -> Link {
        Link::new(
            name,
            remote.parse().unwrap(),
            LinkType::OnDemand,
            LinkParams::default(),
        )
    }

    #[test]
    fn latest_entry_scans_backwards() {
        let l1 = link("l1", "dtn://peer1.dtn");
        let l2 = link("l2", "dtn://peer2.dtn");
        let mut log = ForwardingLog::new();
        log.add_entry_for_link(
            &l1,
            ForwardAction::Forward,
            ForwardingState::Queued,
            CustodyTimerSpec::default(),
        );
        log.add_entry_for_link(
            &l2,
            ForwardAction::Forward,
            ForwardingState::Queued,
            CustodyTimerSpec::default(),
        );
        log.add_entry_for_link(
            &l1,
            ForwardAction::Forward,
            ForwardingState::Transmitted,
            CustodyTimerSpec::default(),
        );

        assert_eq!(
            log.get_latest_state_for_link(&l1),
            ForwardingState::Transmitted
        );
        assert_eq!(log.get_latest_state_for_link(&l2), ForwardingState::Queued);
    }

    #[test]
    fn stale_remote_eid_does_not_match() {
        let before = link("l1", "dtn://peer1.dtn");
        let mut log = ForwardingLog::new();
        log.add_entry_for_link(
            &before,
            ForwardAction::Forward,
            ForwardingState::Transmitted,
            CustodyTimerSpec::default(),
        );

        let renamed = link("l1", "dtn://other.dtn");
        assert!(log.get_latest_entry_for_link(&renamed).is_none());
        assert!(!log.update_for_link(&renamed, ForwardingState::Cancelled));
    }

    #[test]
    fn update_all_rewrites_every_match() {
        let l1 = link("l1", "dtn://peer1.dtn");
        let l2 = link("l2", "dtn://peer2.dtn");
        let mut log = ForwardingLog::new();
        for l in [&l1, &l2] {
            log.add_entry_for_link(
                l,
                ForwardAction::Forward,
                ForwardingState::Queued,
                CustodyTimerSpec::default(),
            );
        }
        log.add_entry_for_registration(7, &"dtn://local/app".parse().unwrap(), ForwardAction::Copy, ForwardingState::PendingDelivery);

        log.update_all(ForwardingState::Queued, ForwardingState::Cancelled);
        assert_eq!(log.get_count(ForwardingState::Queued.mask(), ANY_ACTION), 0);
        assert_eq!(
            log.get_count(ForwardingState::Cancelled.mask(), ANY_ACTION),
            2
        );
        assert_eq!(
            log.get_count(ForwardingState::PendingDelivery.mask(), ANY_ACTION),
            1
        );
    }

    #[test]
    fn count_masks_combine() {
        let l1 = link("l1", "dtn://peer1.dtn");
        let mut log = ForwardingLog::new();
        log.add_entry_for_link(
            &l1,
            ForwardAction::Forward,
            ForwardingState::Transmitted,
            CustodyTimerSpec::default(),
        );
        log.add_entry_for_registration(1, &"dtn://local/app".parse().unwrap(), ForwardAction::Copy, ForwardingState::Delivered);

        let mask = ForwardingState::Transmitted.mask() | ForwardingState::Delivered.mask();
        assert_eq!(log.get_count(mask, ANY_ACTION), 2);
        assert_eq!(log.get_count(mask, ForwardAction::Copy.mask()), 1);
    }

    #[test]
    fn wildcard_eid_matches_any_query() {
        let mut log = ForwardingLog::new();
        log.add_entry_for_eid(
            &wildcard_eid(),
            ForwardAction::Forward,
            ForwardingState::Suppressed,
        );
        assert_eq!(
            log.get_count_for_eid(
                &"dtn://anything.dtn/x".parse().unwrap(),
                ForwardingState::Suppressed.mask(),
                ANY_ACTION
            ),
            1
        );
    }
}
