/*!
The bundle daemon.

Owns the pending-bundle table, the link and registration registries, and
the event loop thread that every other component posts into. The daemon is
the only writer of bundle lifecycle state: it accepts custody, records
transmission outcomes in forwarding logs, schedules custody timers, and
decides when a bundle can finally be deleted (with the router's consent).
*/

use crate::{
    acs::AcsQueue,
    actions::BundleActions,
    bundle::{Bundle, BundleId, BundleRef, BundleState, PendingBundles},
    config::Config,
    custody::CustodyTimerSpec,
    events::{Event, EventSource},
    fwd_log::{self, ForwardAction, ForwardingState},
    link::{Link, LinkState},
    payload_store::PayloadStore,
    route_table::RouteTable,
    router::TableBasedRouter,
    storage::{DurableStore, PutFlags, StoreKey},
    timers::TimerService,
};
use aloft_bp::admin::ReasonCode;
use aloft_bp::bundle::{HopInfo, Payload, Version};
use aloft_bp::creation_timestamp::CreationTimestamp;
use aloft_bp::eid::{EidPattern, EndpointId};
use aloft_bp::processor::{ProcessorRegistry, XmitContext};
use aloft_bp::protocol::{self, XmitOptions};
use aloft_bp::status_report::StatusReport;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// Store type codes for the three record namespaces.
const STORE_TYPE_BUNDLE: u32 = 1;
const STORE_TYPE_LINK: u32 = 2;
const STORE_TYPE_REGISTRATION: u32 = 3;

/// Receives bundles delivered to a local registration.
pub trait RegistrationSink: Send + Sync {
    fn deliver(&self, bundle: &BundleRef, regid: u32);
}

pub struct Registration {
    pub id: u32,
    pub endpoint: EidPattern,
    pub sink: Option<Arc<dyn RegistrationSink>>,
}

/// The daemon's implementation of the router action surface.
pub struct DaemonActions {
    config: Arc<Config>,
    event_tx: flume::Sender<Event>,
    store: Arc<dyn DurableStore>,
}

impl BundleActions for DaemonActions {
    fn open_link(&self, link: &Arc<Link>) {
        // The convergence layer completes the open and posts ContactUp.
        if link.is_available() {
            link.set_state(LinkState::Opening);
        }
    }

    fn queue_bundle(
        &self,
        bundle: &BundleRef,
        link: &Arc<Link>,
        action: ForwardAction,
        custody_spec: &CustodyTimerSpec,
    ) {
        debug!("queueing bundle {} on link {}", bundle.id(), link.name());
        bundle
            .lock()
            .fwdlog
            .add_entry_for_link(link, action, ForwardingState::Queued, *custody_spec);
        link.enqueue(bundle.id());
        if self.config.persistent_fwd_logs {
            self.store_update(bundle);
        }
    }

    fn cancel_bundle(&self, bundle: &BundleRef, link: &Arc<Link>) {
        link.remove(bundle.id());
        let _ = self.event_tx.send(Event::BundleSendCancelled {
            bundle: bundle.clone(),
            link: link.clone(),
        });
    }

    fn store_update(&self, bundle: &BundleRef) {
        let record = {
            let state = bundle.lock();
            metadata::serialize(bundle.id(), &state)
        };
        if let Err(e) = self.store.put(
            StoreKey::Bundle(bundle.id()),
            STORE_TYPE_BUNDLE,
            &record,
            PutFlags::Upsert,
        ) {
            error!("durable store update failed for bundle {}: {e}", bundle.id());
        }
    }
}

/// Why a wire-format reception was refused.
#[derive(Debug, thiserror::Error)]
pub enum ReceiveError {
    #[error("incomplete bundle: {0} bytes consumed")]
    Incomplete(usize),

    #[error("bundle rejected: {0:?}")]
    Rejected(ReasonCode),

    #[error(transparent)]
    Protocol(#[from] aloft_bp::Error),

    #[error(transparent)]
    Quota(#[from] crate::payload_store::QuotaExceeded),
}

pub struct Daemon {
    config: Arc<Config>,
    registry: Arc<ProcessorRegistry>,
    pending: Arc<PendingBundles>,
    links: Mutex<HashMap<String, Arc<Link>>>,
    registrations: Mutex<HashMap<u32, Registration>>,
    store: Arc<dyn DurableStore>,
    payload_store: Arc<PayloadStore>,
    acs: Arc<AcsQueue>,
    timers: Arc<TimerService>,
    router: Arc<TableBasedRouter>,
    actions: Arc<DaemonActions>,
    event_tx: flume::Sender<Event>,
    event_rx: flume::Receiver<Event>,
    next_bundle_id: AtomicU64,
    should_stop: AtomicBool,
    worker: Mutex<Option<std::thread::JoinHandle<()>>>,
}

impl Daemon {
    pub fn new(config: Config, store: Arc<dyn DurableStore>) -> Arc<Self> {
        let config = Arc::new(config);
        // The daemon posts follow-up events to itself while handling one;
        // its own queue must never exert backpressure on its own thread.
        let (event_tx, event_rx) = flume::unbounded();
        let pending = Arc::new(PendingBundles::new());
        let timers = Arc::new(TimerService::new());
        let payload_store = Arc::new(PayloadStore::new(config.payload_quota));

        let actions = Arc::new(DaemonActions {
            config: config.clone(),
            event_tx: event_tx.clone(),
            store: store.clone(),
        });

        let router = TableBasedRouter::new(
            config.clone(),
            Arc::new(RouteTable::new()),
            actions.clone(),
            timers.clone(),
            pending.clone(),
        );

        Arc::new(Self {
            config,
            registry: Arc::new(ProcessorRegistry::new()),
            pending,
            links: Mutex::new(HashMap::new()),
            registrations: Mutex::new(HashMap::new()),
            store,
            payload_store,
            acs: Arc::new(AcsQueue::new()),
            timers,
            router,
            actions,
            event_tx,
            event_rx,
            next_bundle_id: AtomicU64::new(1),
            should_stop: AtomicBool::new(false),
            worker: Mutex::new(None),
        })
    }

    pub fn config(&self) -> &Arc<Config> {
        &self.config
    }

    pub fn registry(&self) -> &Arc<ProcessorRegistry> {
        &self.registry
    }

    pub fn router(&self) -> &Arc<TableBasedRouter> {
        &self.router
    }

    pub fn actions(&self) -> Arc<dyn BundleActions> {
        self.actions.clone()
    }

    pub fn pending(&self) -> &Arc<PendingBundles> {
        &self.pending
    }

    pub fn payload_store(&self) -> &Arc<PayloadStore> {
        &self.payload_store
    }

    pub fn acs_queue(&self) -> &Arc<AcsQueue> {
        &self.acs
    }

    pub fn timers(&self) -> &Arc<TimerService> {
        &self.timers
    }

    /// Posts an event onto the daemon queue.
    pub fn post(&self, event: Event) {
        if self.event_tx.send(event).is_err() {
            warn!("event posted after daemon shutdown");
        }
    }

    /// Starts the event loop thread.
    pub fn start(self: &Arc<Self>) {
        let daemon = self.clone();
        let handle = std::thread::Builder::new()
            .name("bundle-daemon".to_string())
            .spawn(move || daemon.run())
            .expect("failed to spawn daemon thread");
        *self.worker.lock().expect("lock poisoned") = Some(handle);
    }

    /// Stops the event loop and the timer thread.
    pub fn shutdown(&self) {
        self.should_stop.store(true, Ordering::SeqCst);
        if let Some(handle) = self.worker.lock().expect("lock poisoned").take() {
            let _ = handle.join();
        }
        self.timers.shutdown();
    }

    /// Processes queued events until the queue drains. Useful for
    /// single-threaded embeddings and deterministic tests; the event loop
    /// thread does the same thing with a poll timeout.
    pub fn process_queued_events(self: &Arc<Self>) {
        while let Ok(event) = self.event_rx.try_recv() {
            self.handle_event(event);
        }
    }

    fn run(self: Arc<Self>) {
        // Poll with a short timeout so shutdown stays responsive.
        while !self.should_stop.load(Ordering::SeqCst) {
            match self.event_rx.recv_timeout(Duration::from_millis(100)) {
                Ok(event) => self.handle_event(event),
                Err(flume::RecvTimeoutError::Timeout) => {}
                Err(flume::RecvTimeoutError::Disconnected) => break,
            }
        }
        debug!("daemon event loop complete");
    }

    // Link registry -------------------------------------------------------

    pub fn add_link(&self, link: Arc<Link>) {
        self.links
            .lock()
            .expect("lock poisoned")
            .insert(link.name().to_string(), link.clone());

        // Link names must survive restarts so forwarding-log entries
        // keep meaning something.
        let record = aloft_cbor::encode::emit(&(
            link.name(),
            link.remote_eid().uri(),
            link.params().potential_downtime,
        ));
        if let Err(e) = self.store.put(
            StoreKey::Link(link.name().to_string()),
            STORE_TYPE_LINK,
            &record,
            PutFlags::Upsert,
        ) {
            error!("durable store update failed for link {}: {e}", link.name());
        }

        self.post(Event::LinkCreated(link));
    }

    pub fn find_link(&self, name: &str) -> Option<Arc<Link>> {
        self.links.lock().expect("lock poisoned").get(name).cloned()
    }

    pub fn delete_link(&self, name: &str) {
        if let Some(link) = self.links.lock().expect("lock poisoned").remove(name) {
            let _ = self.store.del(&StoreKey::Link(name.to_string()));
            self.post(Event::LinkDeleted(link));
        }
    }

    // Registration registry -----------------------------------------------

    pub fn add_registration(&self, registration: Registration) {
        let id = registration.id;
        let record =
            aloft_cbor::encode::emit(&(id as u64, registration.endpoint.to_string()));
        self.registrations
            .lock()
            .expect("lock poisoned")
            .insert(id, registration);

        if let Err(e) = self.store.put(
            StoreKey::Registration(id),
            STORE_TYPE_REGISTRATION,
            &record,
            PutFlags::Upsert,
        ) {
            error!("durable store update failed for registration {id}: {e}");
        }

        self.post(Event::RegistrationAdded(id));
    }

    pub fn remove_registration(&self, id: u32) {
        if self
            .registrations
            .lock()
            .expect("lock poisoned")
            .remove(&id)
            .is_some()
        {
            let _ = self.store.del(&StoreKey::Registration(id));
            self.post(Event::RegistrationRemoved(id));
        }
    }

    pub fn registration_endpoint(&self, id: u32) -> Option<EidPattern> {
        self.registrations
            .lock()
            .expect("lock poisoned")
            .get(&id)
            .map(|r| r.endpoint.clone())
    }

    // Bundle intake --------------------------------------------------------

    /// Admits a parsed bundle into the engine: reserves payload space,
    /// assigns an id, inserts it into the pending table, and posts
    /// `BundleReceived`. Reservation failure rejects the bundle.
    pub fn admit_bundle(
        &self,
        bundle: aloft_bp::bundle::Bundle,
        source: EventSource,
        link: Option<Arc<Link>>,
    ) -> Result<BundleRef, crate::payload_store::QuotaExceeded> {
        let reservation = bundle.payload.len();
        self.payload_store.reserve(reservation)?;

        let id = self.next_bundle_id.fetch_add(1, Ordering::SeqCst);
        let bundle_ref = Bundle::new(id, bundle);
        bundle_ref.lock().payload_reservation = reservation;

        if let Some(link) = &link {
            let mut state = bundle_ref.lock();
            state.fwdlog.add_entry_for_link(
                link,
                ForwardAction::Forward,
                ForwardingState::Received,
                CustodyTimerSpec::default(),
            );
        }

        self.pending.insert(bundle_ref.clone());
        self.schedule_expiration(&bundle_ref);
        metrics::counter!("aloft_bundles_received").increment(1);
        self.post(Event::BundleReceived {
            bundle: bundle_ref.clone(),
            source,
            link,
        });
        Ok(bundle_ref)
    }

    /// Parses, validates, and admits a complete wire-format bundle, as a
    /// convergence layer delivers it. Protocol errors reject the bundle
    /// at this boundary; a rejection may emit a status report when the
    /// sender asked for one and reports are enabled.
    pub fn receive_bundle_data(
        self: &Arc<Self>,
        data: &[u8],
        link: Option<Arc<Link>>,
    ) -> Result<BundleRef, ReceiveError> {
        let mut bundle = aloft_bp::bundle::Bundle::default();
        let (consumed, complete) = protocol::consume(&self.registry, &mut bundle, data)?;
        if !complete {
            return Err(ReceiveError::Incomplete(consumed));
        }

        match protocol::validate(&self.registry, &bundle) {
            Ok(reception_reason) => {
                if let Some(reason) = reception_reason {
                    self.send_reception_report(&bundle, reason);
                }
            }
            Err(deletion_reason) => {
                self.send_deletion_report(&bundle, deletion_reason);
                return Err(ReceiveError::Rejected(deletion_reason));
            }
        }

        if !self.config.age_inbound_processing {
            bundle.age = None;
        }

        Ok(self.admit_bundle(bundle, EventSource::Peer, link)?)
    }

    /// Builds a locally sourced bundle ready for admission, applying the
    /// age-block and hop-limit policy.
    pub fn source_bundle(&self, dest: EndpointId, lifetime: u64, payload: Vec<u8>) -> aloft_bp::bundle::Bundle {
        let mut bundle = aloft_bp::bundle::Bundle::new(Version::V6);
        bundle.source = self.config.local_eid.clone();
        bundle.dest = dest;
        bundle.lifetime = lifetime;
        bundle.payload = Payload::Memory(payload);
        bundle.timestamp = if self.config.use_age_block && self.config.age_zero_creation_ts_time {
            // Age-tracked bundles do not rely on a synchronized clock.
            CreationTimestamp::new(0, 0)
        } else {
            CreationTimestamp::now(0)
        };
        if self.config.use_age_block {
            bundle.age = Some(0);
        }
        if self.config.default_hop_limit > 0 {
            bundle.hop_info = Some(HopInfo {
                limit: self.config.default_hop_limit as u64,
                count: 0,
            });
        }
        bundle
    }

    /// Forms the outbound block list for a transmission on a link.
    pub fn prepare_transmission(
        &self,
        bundle: &BundleRef,
        link: &Arc<Link>,
    ) -> Result<aloft_bp::block::BlockInfoVec, aloft_bp::Error> {
        let state = bundle.lock();
        let ctx = XmitContext {
            local_eid: &self.config.local_eid,
            link: Some(link.name()),
        };
        let options = XmitOptions {
            include_previous_hop: true,
            include_age: self.config.age_outbound_enabled && state.bundle.age.is_some(),
        };
        let mut xmit = protocol::prepare_blocks(&self.registry, &state.bundle, &ctx, options)?;
        protocol::generate_blocks(&self.registry, &state.bundle, &mut xmit, &ctx)?;
        Ok(xmit)
    }

    fn dtn_now() -> u64 {
        std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0)
            .saturating_sub(aloft_bp::creation_timestamp::DTN_EPOCH_OFFSET)
    }

    fn send_reception_report(&self, bundle: &aloft_bp::bundle::Bundle, reason: ReasonCode) {
        if !self.config.status_rpts_enabled || !bundle.flags.receive_receipt {
            return;
        }
        let report = StatusReport {
            received: Some(Self::dtn_now()),
            reason,
            fragment: bundle.fragment,
            subject_timestamp: bundle.timestamp,
            subject_source: bundle.source.clone(),
            ..Default::default()
        };
        self.send_status_report(&bundle.replyto, report);
    }

    fn send_deletion_report(&self, bundle: &aloft_bp::bundle::Bundle, reason: ReasonCode) {
        if !self.config.status_rpts_enabled || !bundle.flags.deletion_receipt {
            return;
        }
        let report = StatusReport {
            deleted: Some(Self::dtn_now()),
            reason,
            fragment: bundle.fragment,
            subject_timestamp: bundle.timestamp,
            subject_source: bundle.source.clone(),
            ..Default::default()
        };
        self.send_status_report(&bundle.replyto, report);
    }

    /// Admits a status-report bundle addressed to `report_to`.
    fn send_status_report(&self, report_to: &EndpointId, report: StatusReport) {
        if report_to.is_null() {
            return;
        }
        let mut bundle = aloft_bp::bundle::Bundle::new(Version::V6);
        bundle.source = self.config.local_eid.clone();
        bundle.dest = report_to.clone();
        bundle.flags.is_admin = true;
        bundle.timestamp = CreationTimestamp::now(0);
        bundle.lifetime = 3600;
        bundle.payload = Payload::Memory(report.to_v6_payload());

        let reservation = bundle.payload.len();
        if self.payload_store.reserve(reservation).is_err() {
            warn!("dropping status report, payload store full");
            return;
        }
        let id = self.next_bundle_id.fetch_add(1, Ordering::SeqCst);
        let bundle_ref = Bundle::new(id, bundle);
        bundle_ref.lock().payload_reservation = reservation;
        self.pending.insert(bundle_ref.clone());
        self.schedule_expiration(&bundle_ref);
        self.post(Event::BundleReceived {
            bundle: bundle_ref,
            source: EventSource::Admin,
            link: None,
        });
    }

    /// Arms the lifetime expiration timer for a newly admitted bundle.
    fn schedule_expiration(&self, bundle: &BundleRef) {
        let remaining = {
            let state = bundle.lock();
            let now = std::time::SystemTime::now()
                .duration_since(std::time::UNIX_EPOCH)
                .map(|d| d.as_secs())
                .unwrap_or(0)
                .saturating_sub(aloft_bp::creation_timestamp::DTN_EPOCH_OFFSET);
            let deadline = state.bundle.timestamp.seconds.saturating_add(state.bundle.lifetime);
            match state.bundle.age {
                Some(age_ms) => state.bundle.lifetime.saturating_sub(age_ms / 1000),
                None => deadline.saturating_sub(now),
            }
        };

        let event_tx = self.event_tx.clone();
        let weak = Arc::downgrade(bundle);
        let handle = self
            .timers
            .schedule(Duration::from_secs(remaining), move || {
                if let Some(bundle) = weak.upgrade() {
                    let _ = event_tx.send(Event::BundleExpired { bundle });
                }
            });
        bundle.lock().expiration_timer = Some(handle);
    }

    // Event handling -------------------------------------------------------

    pub fn handle_event(self: &Arc<Self>, event: Event) {
        match &event {
            Event::BundleReceived { bundle, .. } => {
                if bundle.expired() {
                    debug!("bundle {} expired on arrival", bundle.id());
                    self.delete_bundle(bundle, Some(ReasonCode::LifetimeExpired));
                    return;
                }
                self.accept_custody(bundle);
                self.deliver_locally(bundle);
            }
            Event::BundleTransmitted {
                bundle,
                link,
                success,
            } => {
                link.remove(bundle.id());
                if *success {
                    let custody = {
                        let mut state = bundle.lock();
                        state
                            .fwdlog
                            .update_for_link(link, ForwardingState::Transmitted);
                        state.bundle.flags.custody_requested && state.local_custody
                    };
                    if custody {
                        self.schedule_custody_timer(bundle, link);
                    }
                    if self.config.persistent_fwd_logs {
                        self.actions.store_update(bundle);
                    }
                } else {
                    bundle
                        .lock()
                        .fwdlog
                        .update_for_link(link, ForwardingState::TransmitFailed);
                }
            }
            Event::BundleSendCancelled { bundle, link } => {
                link.remove(bundle.id());
                bundle
                    .lock()
                    .fwdlog
                    .update_for_link(link, ForwardingState::Cancelled);
            }
            Event::BundleDelivered { bundle, regid } => {
                bundle
                    .lock()
                    .fwdlog
                    .update_for_registration(*regid, ForwardingState::Delivered);
            }
            Event::CustodyTimeout { bundle_id, link } => {
                // Record the timeout before the router sees the event, so
                // the new routing round observes the terminal state.
                if let Some(bundle) = self.pending.find(*bundle_id) {
                    bundle
                        .lock()
                        .fwdlog
                        .update_for_link(link, ForwardingState::CustodyTimeout);
                }
            }
            Event::BundleExpired { bundle } => {
                self.delete_bundle(bundle, Some(ReasonCode::LifetimeExpired));
                return;
            }
            Event::BundleTryDelete { bundle } => {
                self.try_delete_bundle(bundle);
                return;
            }
            Event::ContactUp(link) => link.set_state(LinkState::Open),
            Event::ContactDown(link) => link.set_state(LinkState::Unavailable),
            Event::LinkAvailable(link) => link.set_state(LinkState::Available),
            Event::LinkCreated(_)
            | Event::LinkDeleted(_)
            | Event::RouteAdd(_)
            | Event::RouteDel(_)
            | Event::RegistrationAdded(_)
            | Event::RegistrationRemoved(_)
            | Event::RegistrationExpired(_) => {}
        }

        self.router.handle_event(&event);

        // Delivery and transmission outcomes may leave the bundle with
        // nothing more to do.
        match &event {
            Event::BundleTransmitted {
                bundle,
                success: true,
                ..
            }
            | Event::BundleDelivered { bundle, .. } => {
                self.try_delete_bundle(bundle);
            }
            _ => {}
        }
    }

    /// Takes custody of a custody-requesting bundle.
    fn accept_custody(&self, bundle: &BundleRef) {
        let mut state = bundle.lock();
        if state.bundle.flags.custody_requested && !state.local_custody {
            state.local_custody = true;
            state.bundle.custodian = self.config.local_eid.clone();
            debug!("accepted custody of bundle {}", bundle.id());
        }
    }

    /// Hands the bundle to every registration whose endpoint matches the
    /// destination, leaving a pending-delivery entry in the log.
    fn deliver_locally(&self, bundle: &BundleRef) {
        let dest = bundle.dest();
        let sinks: Vec<(u32, EidPattern, Option<Arc<dyn RegistrationSink>>)> = {
            let regs = self.registrations.lock().expect("lock poisoned");
            regs.values()
                .filter(|r| r.endpoint.matches(&dest))
                .map(|r| (r.id, r.endpoint.clone(), r.sink.clone()))
                .collect()
        };

        for (regid, endpoint, sink) in sinks {
            let endpoint_eid = match &endpoint {
                EidPattern::Exact(eid) => eid.clone(),
                _ => dest.clone(),
            };
            bundle.lock().fwdlog.add_entry_for_registration(
                regid,
                &endpoint_eid,
                ForwardAction::Copy,
                ForwardingState::PendingDelivery,
            );
            if let Some(sink) = sink {
                sink.deliver(bundle, regid);
            }
        }
    }

    /// Schedules a custody retransmission timer for an in-flight
    /// transmission, using the custody spec recorded with the
    /// forwarding-log entry.
    fn schedule_custody_timer(&self, bundle: &BundleRef, link: &Arc<Link>) {
        let (spec, lifetime) = {
            let state = bundle.lock();
            let spec = state
                .fwdlog
                .get_latest_entry_for_link(link)
                .map(|e| e.custody_spec)
                .unwrap_or(self.config.custody_timer);
            (spec, state.bundle.lifetime)
        };

        let delay = spec.calculate_timeout(lifetime);
        debug!(
            "scheduling custody timer for bundle {} on link {} in {delay:?}",
            bundle.id(),
            link.name()
        );
        let event_tx = self.event_tx.clone();
        let bundle_id = bundle.id();
        let timer_link = link.clone();
        let handle = self.timers.schedule(delay, move || {
            let _ = event_tx.send(Event::CustodyTimeout {
                bundle_id,
                link: timer_link,
            });
        });
        bundle.lock().custody_timers.push(handle);
    }

    /// Handles a (positive or negative) custody signal for the bundle:
    /// cancels the retransmission timers and, on success, releases local
    /// custody.
    pub fn custody_signal_received(self: &Arc<Self>, bundle: &BundleRef, succeeded: bool) {
        {
            let mut state = bundle.lock();
            for timer in state.custody_timers.drain(..) {
                timer.cancel();
            }
            if succeeded {
                state.local_custody = false;
            }
        }
        if succeeded {
            self.try_delete_bundle(bundle);
        }
    }

    /// Deletes the bundle if nothing is owed: no custody, no pending
    /// deliveries, and the router agrees.
    pub fn try_delete_bundle(&self, bundle: &BundleRef) -> bool {
        {
            let state = bundle.lock();
            if state.local_custody || state.bibe_custody {
                return false;
            }
            if state.fwdlog.get_count(
                ForwardingState::PendingDelivery.mask(),
                fwd_log::ANY_ACTION,
            ) > 0
            {
                return false;
            }
        }
        if !self.router.can_delete_bundle(bundle) {
            return false;
        }
        self.delete_bundle(bundle, None);
        true
    }

    fn delete_bundle(&self, bundle: &BundleRef, reason: Option<ReasonCode>) {
        let reservation = {
            let mut state = bundle.lock();
            for timer in state.custody_timers.drain(..) {
                timer.cancel();
            }
            if let Some(timer) = state.expiration_timer.take() {
                timer.cancel();
            }
            std::mem::take(&mut state.payload_reservation)
        };
        self.payload_store.release(reservation);
        self.pending.remove(bundle.id());
        let _ = self.store.del(&StoreKey::Bundle(bundle.id()));

        match reason {
            Some(reason) => {
                info!("deleted bundle {}: {reason:?}", bundle.id());
                let subject = {
                    let state = bundle.lock();
                    let mut subject = aloft_bp::bundle::Bundle::new(state.bundle.version);
                    subject.flags = state.bundle.flags.clone();
                    subject.replyto = state.bundle.replyto.clone();
                    subject.source = state.bundle.source.clone();
                    subject.timestamp = state.bundle.timestamp;
                    subject.fragment = state.bundle.fragment;
                    subject
                };
                self.send_deletion_report(&subject, reason);
            }
            None => debug!("deleted bundle {}", bundle.id()),
        }
    }

    /// Adjusts payload accounting when a BIBE extraction hands the outer
    /// bundle's reservation to the inner bundle (the outer keeps a single
    /// sentinel byte).
    pub fn transfer_payload_reservation(
        &self,
        outer: &BundleRef,
        inner_len: u64,
    ) -> Result<(), crate::payload_store::QuotaExceeded> {
        self.payload_store.reserve(inner_len)?;
        let released = {
            let mut state = outer.lock();
            let released = state.payload_reservation.saturating_sub(1);
            state.payload_reservation = 1;
            let _ = state.bundle.payload.truncate(1);
            released
        };
        self.payload_store.release(released);
        Ok(())
    }
}

/// CBOR serialization of the bundle metadata record kept in the durable
/// store: identity, primary fields, custody bits, and the forwarding log.
pub mod metadata {
    use super::*;
    use crate::fwd_log::{ForwardingInfo, ForwardingLog};
    use aloft_bp::eid::EndpointId;
    use aloft_bp::error::CaptureFieldErr;
    use aloft_cbor::decode::{self, Value};

    pub fn serialize(id: BundleId, state: &BundleState) -> Vec<u8> {
        aloft_cbor::encode::emit_array(Some(8), |a| {
            a.emit(&id);
            a.emit(&state.bundle.source.uri());
            a.emit(&state.bundle.dest.uri());
            a.emit(&(
                state.bundle.timestamp.seconds,
                state.bundle.timestamp.sequence,
            ));
            a.emit(&state.bundle.lifetime);
            a.emit(&state.local_custody);
            a.emit(&state.bibe_custody);
            a.emit_array(Some(state.fwdlog.entries().len()), |entries| {
                for entry in state.fwdlog.entries() {
                    entries.emit_array(Some(7), |e| {
                        e.emit(entry.link_name.as_str());
                        e.emit(&entry.state.mask());
                        e.emit(&entry.action.mask());
                        e.emit(&entry.regid.map(|r| r as u64));
                        e.emit(&entry.remote_eid.uri());
                        e.emit(&(entry.timestamp.unix_timestamp().max(0) as u64));
                        e.emit(&(
                            entry.custody_spec.min,
                            entry.custody_spec.lifetime_pct,
                            entry.custody_spec.max,
                        ));
                    });
                }
            });
        })
    }

    /// The metadata fields recovered from a stored record.
    #[derive(Debug)]
    pub struct Record {
        pub id: BundleId,
        pub source: EndpointId,
        pub dest: EndpointId,
        pub timestamp: (u64, u64),
        pub lifetime: u64,
        pub local_custody: bool,
        pub bibe_custody: bool,
        pub fwdlog: ForwardingLog,
    }

    fn parse_entry(e: &mut decode::Array) -> Result<ForwardingInfo, aloft_bp::Error> {
        let link_name: String = e.parse().map_field_err("entry link name")?;
        let state_mask: u32 = e.parse().map_field_err("entry state")?;
        let action_mask: u32 = e.parse().map_field_err("entry action")?;
        let regid = e.parse_value(|value, _| match value {
            Value::Null => Ok(None),
            Value::UnsignedInteger(v) => Ok(Some(u32::try_from(v).map_field_err("entry regid")?)),
            value => Err(aloft_bp::Error::InvalidField {
                field: "entry regid",
                source: format!("unexpected {}", value.type_name()).into(),
            }),
        })?;
        let remote_eid: String = e.parse().map_field_err("entry remote eid")?;
        let unix_ts: u64 = e.parse().map_field_err("entry timestamp")?;
        let spec = e.parse_value(|value, _| match value {
            Value::Array(s) => {
                let min: u32 = s.parse().map_field_err("custody min")?;
                let lifetime_pct: u32 = s.parse().map_field_err("custody pct")?;
                let max: u32 = s.parse().map_field_err("custody max")?;
                Ok(CustodyTimerSpec {
                    min,
                    lifetime_pct,
                    max,
                })
            }
            value => Err(aloft_bp::Error::InvalidField {
                field: "custody spec",
                source: format!("unexpected {}", value.type_name()).into(),
            }),
        })?;

        Ok(ForwardingInfo {
            state: ForwardingState::from_mask(state_mask).ok_or_else(|| {
                aloft_bp::Error::InvalidField {
                    field: "entry state",
                    source: format!("unknown state mask {state_mask}").into(),
                }
            })?,
            action: ForwardAction::from_mask(action_mask).ok_or_else(|| {
                aloft_bp::Error::InvalidField {
                    field: "entry action",
                    source: format!("unknown action mask {action_mask}").into(),
                }
            })?,
            link_name,
            regid,
            remote_eid: remote_eid.parse().map_field_err("entry remote eid")?,
            timestamp: time::OffsetDateTime::from_unix_timestamp(unix_ts as i64)
                .map_field_err("entry timestamp")?,
            custody_spec: spec,
        })
    }

    pub fn deserialize(data: &[u8]) -> Result<Record, aloft_bp::Error> {
        aloft_cbor::decode::parse_array(data, |a, _| {
            let id: u64 = a.parse().map_field_err("bundle id")?;
            let source: String = a.parse().map_field_err("source")?;
            let dest: String = a.parse().map_field_err("destination")?;
            let timestamp = a.parse_value(|value, _| match value {
                Value::Array(ts) => {
                    let seconds: u64 = ts.parse().map_field_err("timestamp seconds")?;
                    let sequence: u64 = ts.parse().map_field_err("timestamp sequence")?;
                    Ok((seconds, sequence))
                }
                value => Err(aloft_bp::Error::InvalidField {
                    field: "timestamp",
                    source: format!("unexpected {}", value.type_name()).into(),
                }),
            })?;
            let lifetime: u64 = a.parse().map_field_err("lifetime")?;
            let local_custody: bool = a.parse().map_field_err("local custody")?;
            let bibe_custody: bool = a.parse().map_field_err("bibe custody")?;
            let fwdlog = a.parse_value(|value, _| match value {
                Value::Array(entries) => {
                    let mut log = ForwardingLog::new();
                    while !entries.at_end().map_field_err("forwarding log")? {
                        let entry = entries.parse_value(|value, _| match value {
                            Value::Array(e) => parse_entry(e),
                            value => Err(aloft_bp::Error::InvalidField {
                                field: "forwarding log entry",
                                source: format!("unexpected {}", value.type_name()).into(),
                            }),
                        })?;
                        log.push_entry(entry);
                    }
                    Ok(log)
                }
                value => Err(aloft_bp::Error::InvalidField {
                    field: "forwarding log",
                    source: format!("unexpected {}", value.type_name()).into(),
                }),
            })?;

            Ok(Record {
                id,
                source: source.parse().map_field_err("source")?,
                dest: dest.parse().map_field_err("destination")?,
                timestamp,
                lifetime,
                local_custody,
                bibe_custody,
                fwdlog,
            })
        })
        .map(|(record, _)| record)
    }
}
