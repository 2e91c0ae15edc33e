use crate::{
    bundle::BundleRef,
    config::Config,
    custody::CustodyTimerSpec,
    daemon::{Daemon, Registration, RegistrationSink},
    events::{Event, EventSource},
    fwd_log::{self, ForwardAction, ForwardingState},
    link::{Link, LinkParams, LinkState, LinkType},
    route::RouteEntry,
    storage::MemStore,
};
use aloft_bp::bundle::{Bundle as WireBundle, Payload, Version};
use aloft_bp::eid::{EidPattern, EndpointId};
use std::sync::Arc;
use std::time::Duration;

fn eid(s: &str) -> EndpointId {
    s.parse().unwrap()
}

fn pattern(s: &str) -> EidPattern {
    s.parse().unwrap()
}

fn test_daemon() -> Arc<Daemon> {
    let config = Config {
        local_eid: eid("dtn://local.dtn"),
        ..Default::default()
    };
    Daemon::new(config, Arc::new(MemStore::new()))
}

fn open_link(daemon: &Arc<Daemon>, name: &str, remote: &str, link_type: LinkType) -> Arc<Link> {
    let link = Arc::new(Link::new(
        name,
        eid(remote),
        link_type,
        LinkParams {
            potential_downtime: 0,
            queue_limit: 16,
        },
    ));
    link.set_state(LinkState::Open);
    daemon.add_link(link.clone());
    daemon.process_queued_events();
    link
}

fn wire_bundle(dest: &str, lifetime: u64) -> WireBundle {
    let mut bundle = WireBundle::new(Version::V6);
    bundle.source = eid("dtn://source.dtn/app");
    bundle.dest = eid(dest);
    bundle.timestamp = aloft_bp::creation_timestamp::CreationTimestamp::now(1);
    bundle.lifetime = lifetime;
    bundle.payload = Payload::Memory(b"engine test payload".to_vec());
    bundle
}

fn admit(daemon: &Arc<Daemon>, bundle: WireBundle) -> BundleRef {
    let bundle = daemon
        .admit_bundle(bundle, EventSource::Peer, None)
        .expect("payload reservation failed");
    daemon.process_queued_events();
    bundle
}

#[test]
fn routes_onto_open_link() {
    let daemon = test_daemon();
    let link = open_link(&daemon, "l1", "dtn://peer.dtn", LinkType::OnDemand);
    daemon
        .router()
        .add_route(Arc::new(RouteEntry::to_link(pattern("dtn://dest.dtn/*"), link.clone())));

    let bundle = admit(&daemon, wire_bundle("dtn://dest.dtn/app", 3600));

    assert!(link.is_queued(bundle.id()));
    assert_eq!(
        bundle.lock().fwdlog.get_latest_state_for_link(&link),
        ForwardingState::Queued
    );

    // Second routing round must not double-queue.
    assert_eq!(daemon.router().route_bundle(&bundle), 0);
}

#[test]
fn transmit_success_updates_log_and_schedules_custody_timer() {
    let daemon = test_daemon();
    let link = open_link(&daemon, "l1", "dtn://peer.dtn", LinkType::OnDemand);
    daemon.router().add_route(Arc::new(
        RouteEntry::to_link(pattern("*:*"), link.clone()).with_custody_spec(CustodyTimerSpec {
            min: 3600,
            lifetime_pct: 25,
            max: 0,
        }),
    ));

    let mut wire = wire_bundle("dtn://dest.dtn/app", 3600);
    wire.flags.custody_requested = true;
    let bundle = admit(&daemon, wire);
    assert!(bundle.lock().local_custody);

    link.start_transmit(bundle.id());
    daemon.post(Event::BundleTransmitted {
        bundle: bundle.clone(),
        link: link.clone(),
        success: true,
    });
    daemon.process_queued_events();

    {
        let state = bundle.lock();
        assert_eq!(
            state.fwdlog.get_latest_state_for_link(&link),
            ForwardingState::Transmitted
        );
        assert_eq!(state.custody_timers.len(), 1);
    }
    // Custody still held, so the bundle stays pending.
    assert!(daemon.pending().find(bundle.id()).is_some());

    // A positive custody signal releases custody and lets it go.
    daemon.custody_signal_received(&bundle, true);
    assert!(daemon.pending().find(bundle.id()).is_none());
}

#[test]
fn custody_timeout_triggers_rerouting() {
    let daemon = test_daemon();
    let link = open_link(&daemon, "l1", "dtn://peer.dtn", LinkType::OnDemand);
    // Zero bounds: the timer fires immediately.
    daemon.router().add_route(Arc::new(
        RouteEntry::to_link(pattern("*:*"), link.clone()).with_custody_spec(CustodyTimerSpec {
            min: 0,
            lifetime_pct: 0,
            max: 0,
        }),
    ));

    let mut wire = wire_bundle("dtn://dest.dtn/app", 3600);
    wire.flags.custody_requested = true;
    let bundle = admit(&daemon, wire);

    link.start_transmit(bundle.id());
    daemon.post(Event::BundleTransmitted {
        bundle: bundle.clone(),
        link: link.clone(),
        success: true,
    });
    daemon.process_queued_events();

    // Let the custody timer fire and process the timeout event.
    std::thread::sleep(Duration::from_millis(100));
    daemon.process_queued_events();

    let state = bundle.lock();
    let entries = state.fwdlog.entries();
    assert!(entries
        .iter()
        .any(|e| e.state == ForwardingState::CustodyTimeout));
    // The router queued it again after the timeout.
    assert_eq!(
        state.fwdlog.get_latest_state_for_link(&link),
        ForwardingState::Queued
    );
}

#[test]
fn link_down_reroutes_queued_bundles() {
    let daemon = test_daemon();
    let link = open_link(&daemon, "l1", "dtn://peer.dtn", LinkType::OnDemand);
    let backup = open_link(&daemon, "l2", "dtn://backup.dtn", LinkType::OnDemand);
    daemon.router().add_route(Arc::new(
        RouteEntry::to_link(pattern("dtn://dest.dtn/*"), link.clone()).with_priority(10),
    ));
    daemon.router().add_route(Arc::new(
        RouteEntry::to_link(pattern("dtn://dest.dtn/*"), backup.clone()).with_priority(1),
    ));

    let bundle = admit(&daemon, wire_bundle("dtn://dest.dtn/app", 3600));
    assert!(link.is_queued(bundle.id()));
    assert!(!backup.is_queued(bundle.id()));

    // The link drops with the bundle still queued; potential_downtime is
    // zero so the reroute timer fires straight away.
    daemon.post(Event::ContactDown(link.clone()));
    daemon.process_queued_events();
    std::thread::sleep(Duration::from_millis(100));
    daemon.process_queued_events();

    assert!(!link.is_queued(bundle.id()));
    assert!(backup.is_queued(bundle.id()));
    let state = bundle.lock();
    assert_eq!(
        state.fwdlog.get_latest_state_for_link(&backup),
        ForwardingState::Queued
    );
}

#[test]
fn contact_up_retries_pending_bundles() {
    let daemon = test_daemon();
    let link = open_link(&daemon, "l1", "dtn://peer.dtn", LinkType::OnDemand);
    link.set_state(LinkState::Unavailable);
    daemon
        .router()
        .add_route(Arc::new(RouteEntry::to_link(pattern("*:*"), link.clone())));

    // No usable link yet: the bundle stays pending, unqueued.
    let bundle = admit(&daemon, wire_bundle("dtn://dest.dtn/app", 3600));
    assert!(!link.is_queued(bundle.id()));
    assert!(daemon.pending().find(bundle.id()).is_some());

    daemon.post(Event::ContactUp(link.clone()));
    daemon.process_queued_events();
    assert!(link.is_queued(bundle.id()));
}

#[test]
fn prefer_always_on_stops_after_first_match() {
    let daemon = test_daemon();
    let primary = open_link(&daemon, "primary", "dtn://p.dtn", LinkType::AlwaysOn);
    let secondary = open_link(&daemon, "secondary", "dtn://s.dtn", LinkType::OnDemand);
    daemon.router().add_route(Arc::new(
        RouteEntry::to_link(pattern("dtn://dest.dtn/*"), primary.clone())
            .with_priority(10)
            .with_action(ForwardAction::Copy),
    ));
    daemon.router().add_route(Arc::new(
        RouteEntry::to_link(pattern("dtn://dest.dtn/*"), secondary.clone())
            .with_priority(5)
            .with_action(ForwardAction::Copy),
    ));

    let bundle = admit(&daemon, wire_bundle("dtn://dest.dtn/app", 3600));
    assert!(primary.is_queued(bundle.id()));
    assert!(!secondary.is_queued(bundle.id()));
}

#[test]
fn copy_action_fans_out_without_always_on() {
    let daemon = test_daemon();
    let l1 = open_link(&daemon, "l1", "dtn://p1.dtn", LinkType::OnDemand);
    let l2 = open_link(&daemon, "l2", "dtn://p2.dtn", LinkType::OnDemand);
    daemon.router().add_route(Arc::new(
        RouteEntry::to_link(pattern("dtn://dest.dtn/*"), l1.clone())
            .with_action(ForwardAction::Copy),
    ));
    daemon.router().add_route(Arc::new(
        RouteEntry::to_link(pattern("dtn://dest.dtn/*"), l2.clone())
            .with_action(ForwardAction::Copy),
    ));

    let bundle = admit(&daemon, wire_bundle("dtn://dest.dtn/app", 3600));
    assert!(l1.is_queued(bundle.id()));
    assert!(l2.is_queued(bundle.id()));
}

#[test]
fn suppressed_bundles_are_not_routed() {
    let daemon = test_daemon();
    let link = open_link(&daemon, "l1", "dtn://peer.dtn", LinkType::OnDemand);
    daemon
        .router()
        .add_route(Arc::new(RouteEntry::to_link(pattern("*:*"), link.clone())));

    let wire = wire_bundle("dtn://dest.dtn/app", 3600);
    let bundle = daemon
        .admit_bundle(wire, EventSource::Peer, None)
        .unwrap();
    bundle.lock().fwdlog.add_entry_for_eid(
        &fwd_log::wildcard_eid(),
        ForwardAction::Forward,
        ForwardingState::Suppressed,
    );
    daemon.process_queued_events();

    assert!(!link.is_queued(bundle.id()));
    assert_eq!(daemon.router().route_bundle(&bundle), 0);
}

#[test]
fn loop_avoidance_skips_previous_hop() {
    let daemon = test_daemon();
    let link = open_link(&daemon, "l1", "dtn://peer.dtn", LinkType::OnDemand);
    daemon
        .router()
        .add_route(Arc::new(RouteEntry::to_link(pattern("*:*"), link.clone())));

    let mut wire = wire_bundle("dtn://dest.dtn/app", 3600);
    wire.prevhop = eid("dtn://peer.dtn");
    let bundle = admit(&daemon, wire);

    assert!(!link.is_queued(bundle.id()));
}

#[test]
fn delivery_and_deletion_lifecycle() {
    struct CountingSink(std::sync::atomic::AtomicUsize);
    impl RegistrationSink for CountingSink {
        fn deliver(&self, _bundle: &BundleRef, _regid: u32) {
            self.0.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        }
    }

    let daemon = test_daemon();
    let sink = Arc::new(CountingSink(std::sync::atomic::AtomicUsize::new(0)));
    daemon.add_registration(Registration {
        id: 7,
        endpoint: pattern("dtn://local.dtn/app"),
        sink: Some(sink.clone()),
    });
    daemon.process_queued_events();

    let bundle = admit(&daemon, wire_bundle("dtn://local.dtn/app", 3600));
    assert_eq!(sink.0.load(std::sync::atomic::Ordering::SeqCst), 1);
    assert_eq!(
        bundle
            .lock()
            .fwdlog
            .get_latest_entry_for_registration(7)
            .map(|e| e.state),
        Some(ForwardingState::PendingDelivery)
    );
    // Undelivered: cannot be deleted yet.
    assert!(daemon.pending().find(bundle.id()).is_some());

    daemon.post(Event::BundleDelivered {
        bundle: bundle.clone(),
        regid: 7,
    });
    daemon.process_queued_events();

    // Delivered with no custody held: gone.
    assert!(daemon.pending().find(bundle.id()).is_none());
}

#[test]
fn expired_bundle_is_dropped_on_arrival() {
    let daemon = test_daemon();
    let link = open_link(&daemon, "l1", "dtn://peer.dtn", LinkType::OnDemand);
    daemon
        .router()
        .add_route(Arc::new(RouteEntry::to_link(pattern("*:*"), link.clone())));

    let mut wire = wire_bundle("dtn://dest.dtn/app", 10);
    wire.timestamp = aloft_bp::creation_timestamp::CreationTimestamp::new(0, 1);
    let bundle = daemon
        .admit_bundle(wire, EventSource::Peer, None)
        .unwrap();
    daemon.process_queued_events();

    assert!(daemon.pending().find(bundle.id()).is_none());
    assert!(!link.is_queued(bundle.id()));
}

#[test]
fn payload_quota_rejects_oversized_bundles() {
    let config = Config {
        local_eid: eid("dtn://local.dtn"),
        payload_quota: 8,
        ..Default::default()
    };
    let daemon = Daemon::new(config, Arc::new(MemStore::new()));

    assert!(daemon
        .admit_bundle(wire_bundle("dtn://dest.dtn/app", 3600), EventSource::Peer, None)
        .is_err());
}

fn emit_wire(bundle: &WireBundle) -> Vec<u8> {
    use aloft_bp::processor::{ProcessorRegistry, XmitContext};
    use aloft_bp::protocol::{self, XmitOptions};

    let registry = ProcessorRegistry::new();
    let local = eid("dtn://sender.dtn");
    let ctx = XmitContext {
        local_eid: &local,
        link: None,
    };
    let mut xmit =
        protocol::prepare_blocks(&registry, bundle, &ctx, XmitOptions::default()).unwrap();
    let total = protocol::generate_blocks(&registry, bundle, &mut xmit, &ctx).unwrap();
    let mut wire = vec![0u8; total];
    protocol::produce(bundle, &xmit, &mut wire, 0).unwrap();
    wire
}

#[test]
fn receive_wire_bundle_end_to_end() {
    let daemon = test_daemon();
    let link = open_link(&daemon, "l1", "dtn://peer.dtn", LinkType::OnDemand);
    daemon
        .router()
        .add_route(Arc::new(RouteEntry::to_link(pattern("dtn://dest.dtn/*"), link.clone())));

    let mut wire_src = wire_bundle("dtn://dest.dtn/app", 3600);
    wire_src.timestamp = aloft_bp::creation_timestamp::CreationTimestamp::now(3);
    let wire = emit_wire(&wire_src);

    let bundle = daemon
        .receive_bundle_data(&wire, Some(link.clone()))
        .expect("reception failed");
    daemon.process_queued_events();

    assert!(link.is_queued(bundle.id()));
    // The reception left a Received entry naming the incoming link.
    assert!(bundle
        .lock()
        .fwdlog
        .entries()
        .iter()
        .any(|e| e.state == ForwardingState::Received && e.link_name == "l1"));
}

#[test]
fn unintelligible_bundle_rejected_with_deletion_report() {
    use crate::daemon::ReceiveError;

    let config = Config {
        local_eid: eid("dtn://local.dtn"),
        status_rpts_enabled: true,
        ..Default::default()
    };
    let daemon = Daemon::new(config, Arc::new(MemStore::new()));

    let mut subject = wire_bundle("dtn://dest.dtn/app", 3600);
    subject.timestamp = aloft_bp::creation_timestamp::CreationTimestamp::now(4);
    subject.replyto = eid("dtn://sender.dtn/reports");
    subject.flags.deletion_receipt = true;
    let mut wire = emit_wire(&subject);

    // Splice in an unknown block demanding bundle discard, ahead of the
    // payload block (type 1, 1-byte flags, 1-byte length, 19-byte body).
    let payload_block_at = wire.len() - (3 + 19);
    let mut block = vec![0xEEu8];
    block.extend_from_slice(&aloft_bp::sdnv::encode(aloft_bp::block::flags::DISCARD_BUNDLE_ONERROR));
    block.extend_from_slice(&aloft_bp::sdnv::encode(1));
    block.push(0xAB);
    wire.splice(payload_block_at..payload_block_at, block);

    let result = daemon.receive_bundle_data(&wire, None);
    assert!(matches!(result, Err(ReceiveError::Rejected(_))));

    // A deletion status report was generated for the reply-to endpoint.
    assert_eq!(daemon.pending().len(), 1);
    let report = daemon
        .pending()
        .ids()
        .first()
        .and_then(|id| daemon.pending().find(*id))
        .unwrap();
    let state = report.lock();
    assert!(state.bundle.flags.is_admin);
    assert_eq!(state.bundle.dest, eid("dtn://sender.dtn/reports"));
}

#[test]
fn persistent_fwd_logs_write_through() {
    let store = Arc::new(MemStore::new());
    let config = Config {
        local_eid: eid("dtn://local.dtn"),
        persistent_fwd_logs: true,
        ..Default::default()
    };
    let daemon = Daemon::new(config, store.clone());
    let link = open_link(&daemon, "l1", "dtn://peer.dtn", LinkType::OnDemand);
    daemon
        .router()
        .add_route(Arc::new(RouteEntry::to_link(pattern("*:*"), link.clone())));

    let bundle = admit(&daemon, wire_bundle("dtn://dest.dtn/app", 3600));

    use crate::storage::{DurableStore, StoreKey};
    let record = store.get(&StoreKey::Bundle(bundle.id())).unwrap();
    let parsed = crate::daemon::metadata::deserialize(&record).unwrap();
    assert_eq!(parsed.id, bundle.id());
    assert_eq!(parsed.dest, eid("dtn://dest.dtn/app"));
    assert_eq!(parsed.fwdlog.entries().len(), 1);
    assert_eq!(
        parsed.fwdlog.entries()[0].state,
        ForwardingState::Queued
    );
}
