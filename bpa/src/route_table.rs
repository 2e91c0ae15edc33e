/*!
The route table.

An ordered list of entries behind a single lock. Lookup follows route-to
entries recursively up to a configured depth; a chain deeper than the cap
is reported as a loop and contributes nothing, so a cyclic configuration
degrades to a logged warning rather than unbounded recursion.
*/

use crate::link::Link;
use crate::route::{NextHop, RouteEntry};
use aloft_bp::eid::{EidPattern, EndpointId};
use std::sync::{Arc, Mutex};
use tracing::{debug, warn};

/// What a lookup is trying to match: a concrete destination EID, or,
/// while resolving a route-to chain, another pattern.
enum Target<'a> {
    Eid(&'a EndpointId),
    Pattern(&'a EidPattern),
}

impl Target<'_> {
    fn matched_by(&self, dest_pattern: &EidPattern) -> bool {
        match self {
            Target::Eid(eid) => dest_pattern.matches(eid),
            // A pattern target matches on equality, or as an EID when it
            // names exactly one endpoint.
            Target::Pattern(EidPattern::Exact(eid)) => dest_pattern.matches(eid),
            Target::Pattern(pattern) => dest_pattern == *pattern,
        }
    }
}

#[derive(Default)]
pub struct RouteTable {
    entries: Mutex<Vec<Arc<RouteEntry>>>,
}

impl RouteTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_entry(&self, entry: Arc<RouteEntry>) {
        self.entries.lock().expect("lock poisoned").push(entry);
    }

    /// Removes the entry matching both the destination pattern and the
    /// next-hop link. Returns whether one was found.
    pub fn del_entry(&self, dest: &EidPattern, next_hop: &Arc<Link>) -> bool {
        let mut entries = self.entries.lock().expect("lock poisoned");
        if let Some(at) = entries.iter().position(|e| {
            e.dest_pattern == *dest
                && e.link().map(|l| Arc::ptr_eq(l, next_hop)).unwrap_or(false)
        }) {
            entries.remove(at);
            true
        } else {
            false
        }
    }

    /// Removes every entry whose destination pattern equals `dest`.
    pub fn del_entries(&self, dest: &EidPattern) -> usize {
        self.del_matching_entries(|e| e.dest_pattern == *dest)
    }

    /// Removes every entry whose next hop is the given link.
    pub fn del_entries_for_nexthop(&self, next_hop: &Arc<Link>) -> usize {
        self.del_matching_entries(|e| {
            e.link().map(|l| Arc::ptr_eq(l, next_hop)).unwrap_or(false)
        })
    }

    /// Removes every entry the predicate selects, returning the count.
    pub fn del_matching_entries<F>(&self, predicate: F) -> usize
    where
        F: Fn(&RouteEntry) -> bool,
    {
        let mut entries = self.entries.lock().expect("lock poisoned");
        let before = entries.len();
        entries.retain(|e| !predicate(e));
        before - entries.len()
    }

    pub fn clear(&self) {
        self.entries.lock().expect("lock poisoned").clear();
    }

    pub fn len(&self) -> usize {
        self.entries.lock().expect("lock poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().expect("lock poisoned").is_empty()
    }

    /// Collects the entries whose destination pattern matches `eid`,
    /// resolving route-to entries recursively. When `next_hop` is given,
    /// only entries on that link are taken. Duplicates reached by more
    /// than one chain are reported once.
    pub fn get_matching(
        &self,
        eid: &EndpointId,
        next_hop: Option<&Arc<Link>>,
        max_route_to_chain: u32,
    ) -> Vec<Arc<RouteEntry>> {
        // The whole recursion runs under the table lock.
        let entries = self.entries.lock().expect("lock poisoned");
        let mut matches = Vec::new();
        let mut looped = false;
        Self::get_matching_helper(
            &entries,
            &Target::Eid(eid),
            next_hop,
            &mut matches,
            &mut looped,
            0,
            max_route_to_chain,
        );
        if looped {
            warn!("route destination {eid} caused route table lookup loop");
        }
        matches
    }

    fn get_matching_helper(
        entries: &[Arc<RouteEntry>],
        target: &Target,
        next_hop: Option<&Arc<Link>>,
        matches: &mut Vec<Arc<RouteEntry>>,
        looped: &mut bool,
        level: u32,
        max_route_to_chain: u32,
    ) -> usize {
        let mut count = 0;
        for entry in entries {
            if !target.matched_by(&entry.dest_pattern) {
                continue;
            }

            match &entry.next_hop {
                NextHop::RouteTo(route_to) => {
                    if level >= max_route_to_chain {
                        *looped = true;
                        continue;
                    }
                    count += Self::get_matching_helper(
                        entries,
                        &Target::Pattern(route_to),
                        next_hop,
                        matches,
                        looped,
                        level + 1,
                        max_route_to_chain,
                    );
                }
                NextHop::Link(link) => {
                    if let Some(next_hop) = next_hop {
                        if !Arc::ptr_eq(link, next_hop) {
                            continue;
                        }
                    }
                    if matches.iter().any(|m| Arc::ptr_eq(m, entry)) {
                        debug!("entry for {} already matched, ignoring", entry.dest_pattern);
                        continue;
                    }
                    matches.push(entry.clone());
                    count += 1;
                }
            }
        }
        count
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::link::{LinkParams, LinkType};

    fn link(name: &str, remote: &str) -> Arc<Link> {
        Arc::new(Link::new(
            name,
            remote.parse().unwrap(),
            LinkType::OnDemand,
            LinkParams::default(),
        ))
    }

    fn pattern(s: &str) -> EidPattern {
        s.parse().unwrap()
    }

    fn eid(s: &str) -> EndpointId {
        s.parse().unwrap()
    }

    #[test]
    fn direct_match() {
        let table = RouteTable::new();
        let l1 = link("l1", "dtn://peer1.dtn");
        table.add_entry(Arc::new(RouteEntry::to_link(
            pattern("dtn://dest.dtn/*"),
            l1.clone(),
        )));
        table.add_entry(Arc::new(RouteEntry::to_link(
            pattern("dtn://other.dtn/*"),
            link("l2", "dtn://peer2.dtn"),
        )));

        let matches = table.get_matching(&eid("dtn://dest.dtn/test"), None, 10);
        assert_eq!(matches.len(), 1);
        assert_eq!(matches[0].next_hop_str(), "l1");
    }

    #[test]
    fn next_hop_filter() {
        let table = RouteTable::new();
        let l1 = link("l1", "dtn://peer1.dtn");
        let l2 = link("l2", "dtn://peer2.dtn");
        table.add_entry(Arc::new(RouteEntry::to_link(pattern("*:*"), l1.clone())));
        table.add_entry(Arc::new(RouteEntry::to_link(pattern("*:*"), l2.clone())));

        let matches = table.get_matching(&eid("dtn://x.dtn/y"), Some(&l2), 10);
        assert_eq!(matches.len(), 1);
        assert_eq!(matches[0].next_hop_str(), "l2");
    }

    #[test]
    fn route_to_resolves_recursively() {
        let table = RouteTable::new();
        let l1 = link("l1", "dtn://relay.dtn");
        table.add_entry(Arc::new(RouteEntry::to_route(
            pattern("dtn://far.dtn/*"),
            pattern("dtn://relay.dtn/ingest"),
        )));
        table.add_entry(Arc::new(RouteEntry::to_link(
            pattern("dtn://relay.dtn/*"),
            l1.clone(),
        )));

        let matches = table.get_matching(&eid("dtn://far.dtn/app"), None, 10);
        assert_eq!(matches.len(), 1);
        assert_eq!(matches[0].next_hop_str(), "l1");
    }

    #[test]
    fn route_to_loop_terminates() {
        let table = RouteTable::new();
        table.add_entry(Arc::new(RouteEntry::to_route(
            pattern("dtn://a.dtn/x"),
            pattern("dtn://b.dtn/x"),
        )));
        table.add_entry(Arc::new(RouteEntry::to_route(
            pattern("dtn://b.dtn/x"),
            pattern("dtn://a.dtn/x"),
        )));

        let matches = table.get_matching(&eid("dtn://a.dtn/x"), None, 10);
        assert!(matches.is_empty());
    }

    #[test]
    fn duplicates_reported_once() {
        let table = RouteTable::new();
        let l1 = link("l1", "dtn://peer1.dtn");
        let entry = Arc::new(RouteEntry::to_link(pattern("dtn://d.dtn/*"), l1.clone()));
        table.add_entry(entry.clone());
        // Two chains reach the same terminal entry.
        table.add_entry(Arc::new(RouteEntry::to_route(
            pattern("dtn://d.dtn/*"),
            pattern("dtn://d.dtn/svc"),
        )));

        let matches = table.get_matching(&eid("dtn://d.dtn/svc"), None, 10);
        assert_eq!(matches.len(), 1);
    }

    #[test]
    fn deletion_variants() {
        let table = RouteTable::new();
        let l1 = link("l1", "dtn://peer1.dtn");
        let l2 = link("l2", "dtn://peer2.dtn");
        table.add_entry(Arc::new(RouteEntry::to_link(
            pattern("dtn://a.dtn/*"),
            l1.clone(),
        )));
        table.add_entry(Arc::new(RouteEntry::to_link(
            pattern("dtn://a.dtn/*"),
            l2.clone(),
        )));
        table.add_entry(Arc::new(RouteEntry::to_link(
            pattern("dtn://b.dtn/*"),
            l2.clone(),
        )));

        assert!(table.del_entry(&pattern("dtn://a.dtn/*"), &l1));
        assert!(!table.del_entry(&pattern("dtn://a.dtn/*"), &l1));
        assert_eq!(table.del_entries_for_nexthop(&l2), 2);
        assert!(table.is_empty());
    }
}
