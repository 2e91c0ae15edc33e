/*!
The table-based router.

Reacts to daemon events, maintains the route table, and decides which
links a bundle goes out on. Retransmission behavior lives here too: a link
going down with queued bundles arms a reroute timer, and custody timeouts
and cancelled sends feed back into [`TableBasedRouter::route_bundle`].
*/

use crate::{
    actions::BundleActions,
    bundle::{BundleRef, PendingBundles},
    config::Config,
    events::Event,
    fwd_log::{self, ForwardAction, ForwardingState},
    link::{Link, LinkState, LinkType},
    route::RouteEntry,
    route_table::RouteTable,
    timers::{TimerHandle, TimerService},
};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{debug, info, warn};

pub struct TableBasedRouter {
    config: Arc<Config>,
    table: Arc<RouteTable>,
    actions: Arc<dyn BundleActions>,
    timers: Arc<TimerService>,
    pending: Arc<PendingBundles>,
    reroute_timers: Mutex<HashMap<String, TimerHandle>>,
}

impl TableBasedRouter {
    pub fn new(
        config: Arc<Config>,
        table: Arc<RouteTable>,
        actions: Arc<dyn BundleActions>,
        timers: Arc<TimerService>,
        pending: Arc<PendingBundles>,
    ) -> Arc<Self> {
        Arc::new(Self {
            config,
            table,
            actions,
            timers,
            pending,
            reroute_timers: Mutex::new(HashMap::new()),
        })
    }

    pub fn route_table(&self) -> &Arc<RouteTable> {
        &self.table
    }

    pub fn add_route(&self, entry: Arc<RouteEntry>) {
        info!(
            "adding route {} => {} priority {}",
            entry.dest_pattern,
            entry.next_hop_str(),
            entry.priority
        );
        self.table.add_entry(entry);
        self.reroute_all_bundles();
    }

    pub fn del_route(&self, dest: &aloft_bp::eid::EidPattern) {
        let removed = self.table.del_entries(dest);
        info!("removed {removed} route(s) for {dest}");
    }

    pub fn handle_event(self: &Arc<Self>, event: &Event) {
        match event {
            Event::BundleReceived { bundle, .. } => self.handle_bundle_received(bundle),
            Event::BundleTransmitted {
                bundle, success, ..
            } => {
                if !*success {
                    self.route_bundle(bundle);
                }
            }
            Event::BundleSendCancelled { bundle, .. } => {
                if !bundle.expired() {
                    self.route_bundle(bundle);
                }
            }
            Event::ContactUp(link) => self.handle_contact_up(link),
            Event::ContactDown(link) => self.handle_contact_down(link),
            Event::LinkCreated(link) => self.handle_contact_up(link),
            Event::LinkDeleted(link) => self.handle_link_deleted(link),
            Event::LinkAvailable(_) => {}
            Event::CustodyTimeout { bundle_id, .. } => {
                // The daemon has already recorded the timeout in the
                // forwarding log; trying again may match the previous
                // link or any other route.
                if let Some(bundle) = self.pending.find(*bundle_id) {
                    self.route_bundle(&bundle);
                }
            }
            Event::RouteAdd(entry) => self.add_route(entry.clone()),
            Event::RouteDel(dest) => self.del_route(dest),
            Event::BundleDelivered { .. }
            | Event::BundleExpired { .. }
            | Event::BundleTryDelete { .. }
            | Event::RegistrationAdded(_)
            | Event::RegistrationRemoved(_)
            | Event::RegistrationExpired(_) => {}
        }
    }

    fn handle_bundle_received(&self, bundle: &BundleRef) {
        // A bundle delivered to a local registration with a singleton
        // destination has nowhere else to go.
        let (delivered, singleton) = {
            let state = bundle.lock();
            (
                state.fwdlog.get_count(
                    ForwardingState::PendingDelivery.mask() | ForwardingState::Delivered.mask(),
                    fwd_log::ANY_ACTION,
                ) > 0,
                state.bundle.flags.singleton_dest,
            )
        };
        if delivered && singleton {
            return;
        }
        self.route_bundle(bundle);
    }

    /// Queues the bundle on every matching link, highest priority first.
    /// Returns the number of links it was queued on.
    pub fn route_bundle(&self, bundle: &BundleRef) -> usize {
        let suppressed = bundle.lock().fwdlog.get_count_for_eid(
            &fwd_log::wildcard_eid(),
            ForwardingState::Suppressed.mask(),
            fwd_log::ANY_ACTION,
        ) > 0;
        if suppressed {
            info!(
                "route_bundle: ignoring bundle {} since forwarding is suppressed",
                bundle.id()
            );
            return 0;
        }

        let dest = bundle.dest();
        let mut matches = self
            .table
            .get_matching(&dest, None, self.config.max_route_to_chain);

        // Priority only; ties keep table order.
        matches.sort_by(|a, b| b.priority.cmp(&a.priority));

        let mut count = 0;
        for route in matches {
            if !self.should_fwd(bundle, &route) {
                continue;
            }
            let Some(link) = route.link() else {
                continue;
            };

            // Open an available link that traffic now wants.
            if link.is_available() && !link.is_open() && !link.is_opening() {
                debug!("opening link {} for bundle {}", link.name(), bundle.id());
                self.actions.open_link(link);
            }

            if !link.is_open() {
                continue;
            }
            if !link.queue_has_space() {
                debug!(
                    "route_bundle: no space in queue for link {}",
                    link.name()
                );
                continue;
            }

            count += 1;
            self.actions
                .queue_bundle(bundle, link, route.action, &route.custody_spec);
            metrics::counter!("aloft_bundles_routed").increment(1);

            if self.config.static_router_prefer_always_on
                && link.link_type() == LinkType::AlwaysOn
            {
                break;
            }
        }

        debug!("route_bundle: bundle {} queued on {count} links", bundle.id());
        count
    }

    /// Whether a route candidate should carry the bundle.
    fn should_fwd(&self, bundle: &BundleRef, route: &RouteEntry) -> bool {
        let Some(link) = route.link() else {
            return false;
        };

        // Loop avoidance: never send back to the node it arrived from.
        let prevhop = bundle.prevhop();
        let remote = link.remote_eid();
        if !prevhop.is_null() && prevhop == remote {
            debug!(
                "should_fwd bundle {}: skip {} since bundle arrived from the same node",
                bundle.id(),
                link.name()
            );
            return false;
        }

        let state = bundle.lock();
        match state.fwdlog.get_latest_state_for_link(link) {
            ForwardingState::Queued
            | ForwardingState::Transmitted
            | ForwardingState::Delivered => return false,
            _ => {}
        }

        // A forward (non-copy) action only goes out once at a time.
        if route.action == ForwardAction::Forward
            && state.fwdlog.get_count(
                ForwardingState::Queued.mask() | ForwardingState::Transmitted.mask(),
                ForwardAction::Forward.mask(),
            ) > 0
        {
            return false;
        }
        true
    }

    fn handle_contact_up(self: &Arc<Self>, link: &Arc<Link>) {
        self.add_nexthop_route(link);

        // A link that bounced back up no longer needs its reroute timer.
        if let Some(timer) = self
            .reroute_timers
            .lock()
            .expect("lock poisoned")
            .remove(link.name())
        {
            timer.cancel();
        }

        // Pending bundles that were waiting for a forwarding opportunity
        // get another chance now.
        self.reroute_all_bundles();
    }

    /// Adds a route for every service at the link's remote node, unless
    /// an equivalent entry already exists.
    fn add_nexthop_route(&self, link: &Arc<Link>) {
        let remote = link.remote_eid();
        if !self.config.add_nexthop_routes || remote.is_null() {
            return;
        }
        let pattern = aloft_bp::eid::EidPattern::node_wildcard(&remote);
        if !self
            .table
            .get_matching(&remote, Some(link), self.config.max_route_to_chain)
            .is_empty()
        {
            return;
        }
        self.add_route(Arc::new(RouteEntry::to_link(pattern, link.clone())));
    }

    fn handle_contact_down(self: &Arc<Self>, link: &Arc<Link>) {
        // Queued bundles wait out the downtime hint, then get cancelled
        // and rerouted in case the link takes too long to come back.
        let num_queued = link.queue_len();
        if num_queued == 0 {
            return;
        }

        let mut timers = self.reroute_timers.lock().expect("lock poisoned");
        if timers.contains_key(link.name()) {
            return;
        }

        let downtime = link.params().potential_downtime;
        debug!(
            "link {} went down with {num_queued} bundles queued, scheduling reroute timer in {downtime} seconds",
            link.name()
        );
        let weak = Arc::downgrade(self);
        let timer_link = link.clone();
        let handle = self
            .timers
            .schedule(Duration::from_secs(downtime as u64), move || {
                if let Some(router) = weak.upgrade() {
                    router.reroute_bundles(&timer_link);
                }
            });
        timers.insert(link.name().to_string(), handle);
    }

    /// Reroute timer body: cancel everything still queued on the link so
    /// the `BundleSendCancelled` handler can route it elsewhere.
    fn reroute_bundles(&self, link: &Arc<Link>) {
        self.reroute_timers
            .lock()
            .expect("lock poisoned")
            .remove(link.name());

        if link.state() != LinkState::Unavailable {
            warn!(
                "reroute timer fired but link {} is not unavailable",
                link.name()
            );
            return;
        }

        let mut ids = link.queued_bundles();
        // A restart can leave in-flight bundles behind; reroute those too.
        ids.extend(link.inflight_bundles());
        debug!(
            "reroute timer fired, cancelling {} bundles on link {}",
            ids.len(),
            link.name()
        );
        for id in ids {
            if let Some(bundle) = self.pending.find(id) {
                self.actions.cancel_bundle(&bundle, link);
            }
        }
    }

    fn handle_link_deleted(&self, link: &Arc<Link>) {
        self.table.del_entries_for_nexthop(link);
        if let Some(timer) = self
            .reroute_timers
            .lock()
            .expect("lock poisoned")
            .remove(link.name())
        {
            timer.cancel();
        }
    }

    /// A bundle may go once no custody is held and at least one attempt
    /// reached a next hop or a local registration.
    pub fn can_delete_bundle(&self, bundle: &BundleRef) -> bool {
        let state = bundle.lock();
        if state.local_custody || state.bibe_custody {
            return false;
        }
        state.fwdlog.get_count(
            ForwardingState::Transmitted.mask() | ForwardingState::Delivered.mask(),
            fwd_log::ANY_ACTION,
        ) > 0
    }

    /// Re-runs routing for every pending bundle. The pending-map lock is
    /// only held to snapshot ids, never across `route_bundle`.
    pub fn reroute_all_bundles(&self) {
        let ids = self.pending.ids();
        debug!("reroute_all_bundles: {} bundles pending", ids.len());
        for id in ids {
            if let Some(bundle) = self.pending.find(id) {
                self.route_bundle(&bundle);
            }
        }
    }
}
