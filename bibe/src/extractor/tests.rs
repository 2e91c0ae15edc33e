use super::*;
use crate::pdu::{encapsulate, EncapsulationParams};
use aloft_bp::bundle::{Bundle as WireBundle, Payload};
use aloft_bp::creation_timestamp::CreationTimestamp;
use aloft_bp::eid::EndpointId;
use aloft_bp::processor::XmitContext;
use aloft_bp::protocol::XmitOptions;
use aloft_bpa::config::Config;
use aloft_bpa::daemon::Registration;
use aloft_bpa::storage::MemStore;

fn eid(s: &str) -> EndpointId {
    s.parse().unwrap()
}

/// Emits the wire bytes of a simple BPv6 bundle.
fn inner_bundle_wire() -> Vec<u8> {
    inner_bundle_wire_with_payload(b"test payload".to_vec())
}

fn inner_bundle_wire_with_payload(payload: Vec<u8>) -> Vec<u8> {
    let mut bundle = WireBundle::new(aloft_bp::bundle::Version::V6);
    bundle.source = eid("dtn://source.dtn/test");
    bundle.dest = eid("dtn://dest.dtn/test");
    bundle.timestamp = CreationTimestamp::new(10101010, 44556677);
    // Long enough that the fixed creation timestamp stays unexpired on
    // the DTN epoch clock.
    bundle.lifetime = 4_000_000_000;
    bundle.payload = Payload::Memory(payload);

    let registry = ProcessorRegistry::new();
    let local = eid("dtn://source.dtn");
    let ctx = XmitContext {
        local_eid: &local,
        link: None,
    };
    let mut xmit =
        protocol::prepare_blocks(&registry, &bundle, &ctx, XmitOptions::default()).unwrap();
    let total = protocol::generate_blocks(&registry, &bundle, &mut xmit, &ctx).unwrap();
    let mut wire = vec![0u8; total];
    let (written, complete) = protocol::produce(&bundle, &xmit, &mut wire, 0).unwrap();
    assert!(complete);
    assert_eq!(written, total);
    wire
}

fn outer_bundle(payload: Vec<u8>) -> WireBundle {
    let mut outer = WireBundle::new(aloft_bp::bundle::Version::V6);
    outer.source = eid("dtn://remote.dtn/bibe");
    outer.dest = eid("dtn://local.dtn/bibe");
    outer.flags.is_admin = true;
    outer.timestamp = CreationTimestamp::now(9);
    outer.lifetime = 3600;
    outer.payload = Payload::Memory(payload);
    outer
}

struct Fixture {
    daemon: Arc<Daemon>,
    extractor: Arc<BibeExtractor>,
}

const BIBE_REGID: u32 = 9;

impl Fixture {
    fn new() -> Self {
        Self::with_block_size(super::BLOCK_SIZE)
    }

    fn with_block_size(block_size: usize) -> Self {
        let config = Config {
            local_eid: eid("dtn://local.dtn"),
            ..Default::default()
        };
        let daemon = Daemon::new(config, Arc::new(MemStore::new()));
        let extractor = BibeExtractor::with_block_size(
            daemon.clone(),
            Arc::new(ProcessorRegistry::new()),
            block_size,
        );
        daemon.add_registration(Registration {
            id: BIBE_REGID,
            endpoint: "dtn://local.dtn/bibe".parse().unwrap(),
            sink: Some(extractor.clone()),
        });
        daemon.process_queued_events();
        Self { daemon, extractor }
    }

    /// Admits the outer bundle and turns the crank until the extractor
    /// and daemon queues drain.
    fn run(&self, outer: WireBundle) -> BundleRef {
        let outer = self
            .daemon
            .admit_bundle(outer, EventSource::Peer, None)
            .unwrap();
        self.daemon.process_queued_events();
        self.extractor.process_queued_events();
        self.daemon.process_queued_events();
        outer
    }
}

#[test]
fn custody_round_trip() {
    let fixture = Fixture::new();
    let inner_wire = inner_bundle_wire();
    let payload = encapsulate(
        &inner_wire,
        &EncapsulationParams {
            transmission_id: 42,
            retransmit_time: 0,
            bpv6_compatibility: true,
        },
    );
    let outer = fixture.run(outer_bundle(payload));

    // The inner bundle re-entered the pipeline as a fresh reception.
    let pending = fixture.daemon.pending();
    assert_eq!(pending.len(), 1);
    let inner = pending.ids().first().and_then(|id| pending.find(*id)).unwrap();
    {
        let state = inner.lock();
        assert_eq!(state.bundle.dest, eid("dtn://dest.dtn/test"));
        assert_eq!(state.bundle.source, eid("dtn://source.dtn/test"));
        assert_eq!(
            state.bundle.timestamp,
            CreationTimestamp::new(10101010, 44556677)
        );
        let mut payload = vec![0u8; state.bundle.payload.len() as usize];
        state.bundle.payload.read_into(0, &mut payload).unwrap();
        assert_eq!(payload, b"test payload");
    }

    // The outer bundle's delivery entry is closed out...
    assert_eq!(
        outer
            .lock()
            .fwdlog
            .get_latest_entry_for_registration(BIBE_REGID)
            .map(|e| e.state),
        Some(ForwardingState::Delivered)
    );
    // ...its payload reduced to the sentinel byte, and it is gone from
    // the pending table.
    assert_eq!(outer.lock().bundle.payload.len(), 1);
    assert!(fixture.daemon.pending().find(outer.id()).is_none());

    // The custody acknowledgement is queued for the sender.
    let acs = fixture
        .daemon
        .acs_queue()
        .drain(&eid("dtn://remote.dtn/bibe"));
    assert_eq!(
        acs,
        vec![AcsEntry {
            transmission_id: 42,
            succeeded: true,
            reason: CustodyDisposition::Accepted,
        }]
    );
}

#[test]
fn chunk_boundaries_do_not_matter() {
    // A 16-byte block size forces the consume loop across many chunk
    // boundaries: block preambles, the primary block, and the inner
    // payload all get split mid-field.
    let fixture = Fixture::with_block_size(16);
    let inner_payload: Vec<u8> = (0..1000u32).map(|i| (i % 251) as u8).collect();
    let inner_wire = inner_bundle_wire_with_payload(inner_payload.clone());
    assert!(inner_wire.len() > 16 * 4);

    let payload = encapsulate(
        &inner_wire,
        &EncapsulationParams {
            transmission_id: 1,
            retransmit_time: 0,
            bpv6_compatibility: true,
        },
    );
    fixture.run(outer_bundle(payload));

    // The inner bundle survives intact, payload byte for byte.
    assert_eq!(fixture.daemon.pending().len(), 1);
    let pending = fixture.daemon.pending();
    let inner = pending.ids().first().and_then(|id| pending.find(*id)).unwrap();
    let state = inner.lock();
    assert_eq!(state.bundle.dest, eid("dtn://dest.dtn/test"));
    let mut got = vec![0u8; state.bundle.payload.len() as usize];
    state.bundle.payload.read_into(0, &mut got).unwrap();
    assert_eq!(got, inner_payload);

    drop(state);
    let acs = fixture
        .daemon
        .acs_queue()
        .drain(&eid("dtn://remote.dtn/bibe"));
    assert_eq!(acs.len(), 1);
    assert!(acs[0].succeeded);
}

#[test]
fn wrong_admin_nibble_is_rejected() {
    let fixture = Fixture::new();
    let mut payload = encapsulate(
        &inner_bundle_wire(),
        &EncapsulationParams {
            transmission_id: 42,
            retransmit_time: 0,
            bpv6_compatibility: true,
        },
    );
    payload[0] = 0x10; // status report nibble, not BIBE
    let outer = fixture.run(outer_bundle(payload));

    // Nothing admitted, no acknowledgement (the transmission id was
    // never reached), and the outer bundle is still marked delivered.
    assert!(fixture.daemon.pending().is_empty());
    assert_eq!(
        fixture
            .daemon
            .acs_queue()
            .pending_count(&eid("dtn://remote.dtn/bibe")),
        0
    );
    assert_eq!(
        outer
            .lock()
            .fwdlog
            .get_latest_entry_for_registration(BIBE_REGID)
            .map(|e| e.state),
        Some(ForwardingState::Delivered)
    );
}

#[test]
fn length_mismatch_queues_negative_disposition() {
    let fixture = Fixture::new();
    let mut payload = encapsulate(
        &inner_bundle_wire(),
        &EncapsulationParams {
            transmission_id: 42,
            retransmit_time: 0,
            bpv6_compatibility: true,
        },
    );
    payload.push(0x00); // trailing garbage the declared length doesn't cover
    fixture.run(outer_bundle(payload));

    assert!(fixture.daemon.pending().is_empty());
    let acs = fixture
        .daemon
        .acs_queue()
        .drain(&eid("dtn://remote.dtn/bibe"));
    assert_eq!(
        acs,
        vec![AcsEntry {
            transmission_id: 42,
            succeeded: false,
            reason: CustodyDisposition::BlockUnintelligible,
        }]
    );
}

#[test]
fn corrupt_inner_bundle_is_rejected() {
    let fixture = Fixture::new();
    let mut inner_wire = inner_bundle_wire();
    // Clobber the version byte so the consumer refuses it outright.
    inner_wire[0] = 0x42;
    let payload = encapsulate(
        &inner_wire,
        &EncapsulationParams {
            transmission_id: 7,
            retransmit_time: 0,
            bpv6_compatibility: true,
        },
    );
    fixture.run(outer_bundle(payload));

    assert!(fixture.daemon.pending().is_empty());
    let acs = fixture
        .daemon
        .acs_queue()
        .drain(&eid("dtn://remote.dtn/bibe"));
    assert_eq!(acs.len(), 1);
    assert!(!acs[0].succeeded);
}

#[test]
fn v7_record_without_compatibility_byte() {
    let fixture = Fixture::new();
    let payload = encapsulate(
        &inner_bundle_wire(),
        &EncapsulationParams {
            transmission_id: 3,
            retransmit_time: 0,
            bpv6_compatibility: false,
        },
    );
    // An outer BPv7 bundle carries the bare admin record.
    let mut outer = outer_bundle(payload);
    outer.version = aloft_bp::bundle::Version::V7;
    fixture.run(outer);

    assert_eq!(fixture.daemon.pending().len(), 1);
    let acs = fixture
        .daemon
        .acs_queue()
        .drain(&eid("dtn://remote.dtn/bibe"));
    assert!(acs[0].succeeded);
}
