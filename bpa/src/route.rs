/*!
Route table entries.

An entry matches bundles by destination (and optionally source) pattern
and names either a next-hop link or a further pattern to resolve
recursively. The custody timer parameters ride along so different routes
can carry different retransmission behavior.
*/

use crate::custody::CustodyTimerSpec;
use crate::fwd_log::ForwardAction;
use crate::link::Link;
use aloft_bp::eid::EidPattern;
use std::sync::Arc;

/// The next hop of a route entry: a concrete link, or a pattern to look
/// up recursively.
#[derive(Debug, Clone)]
pub enum NextHop {
    Link(Arc<Link>),
    RouteTo(EidPattern),
}

#[derive(Debug, Clone)]
pub struct RouteEntry {
    /// Matches the bundle destination.
    pub dest_pattern: EidPattern,
    /// Matches the bundle source; defaults to the wildcard.
    pub source_pattern: EidPattern,
    pub next_hop: NextHop,
    /// Higher priority routes are tried first.
    pub priority: u32,
    pub action: ForwardAction,
    pub custody_spec: CustodyTimerSpec,
}

impl RouteEntry {
    /// An entry forwarding matching bundles onto `link`.
    pub fn to_link(dest_pattern: EidPattern, link: Arc<Link>) -> Self {
        Self {
            dest_pattern,
            source_pattern: EidPattern::any(),
            next_hop: NextHop::Link(link),
            priority: 0,
            action: ForwardAction::Forward,
            custody_spec: CustodyTimerSpec::default(),
        }
    }

    /// An entry redirecting matching bundles to another lookup.
    pub fn to_route(dest_pattern: EidPattern, route_to: EidPattern) -> Self {
        Self {
            dest_pattern,
            source_pattern: EidPattern::any(),
            next_hop: NextHop::RouteTo(route_to),
            priority: 0,
            action: ForwardAction::Forward,
            custody_spec: CustodyTimerSpec::default(),
        }
    }

    pub fn with_priority(mut self, priority: u32) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_action(mut self, action: ForwardAction) -> Self {
        self.action = action;
        self
    }

    pub fn with_custody_spec(mut self, spec: CustodyTimerSpec) -> Self {
        self.custody_spec = spec;
        self
    }

    pub fn link(&self) -> Option<&Arc<Link>> {
        match &self.next_hop {
            NextHop::Link(link) => Some(link),
            NextHop::RouteTo(_) => None,
        }
    }

    /// Display form of the next hop, for logs.
    pub fn next_hop_str(&self) -> String {
        match &self.next_hop {
            NextHop::Link(link) => link.name().to_string(),
            NextHop::RouteTo(pattern) => format!("route-to:{pattern}"),
        }
    }
}
