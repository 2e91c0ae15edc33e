/*!
The BIBE custody extractor.

Runs as a single consumer on a bounded event queue. Each event names an
outer bundle delivered to the BIBE registration; the extractor decodes the
admin-record header from a small payload prefix, then streams the
encapsulated bundle out of the payload in bounded chunks through the
bundle-protocol consumer. A valid inner bundle re-enters the receive
pipeline as if it had arrived from the outer bundle's incoming link.

Whatever the outcome, the outer transfer's custody disposition is queued
for aggregate custody signalling when the sender asked for one
(`transmission_id > 0`), and the outer bundle is marked delivered.
*/

use crate::Error;
use aloft_bp::admin::{AdminRecordType, CustodyDisposition};
use aloft_bp::bundle::Version;
use aloft_bp::processor::ProcessorRegistry;
use aloft_bp::protocol;
use aloft_bpa::acs::AcsEntry;
use aloft_bpa::bundle::BundleRef;
use aloft_bpa::daemon::{Daemon, RegistrationSink};
use aloft_bpa::events::{Event, EventSource};
use aloft_bpa::fwd_log::ForwardingState;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{debug, error};

/// Upper bound on the admin-record overhead ahead of the encapsulated
/// bundle: one BPv6 compatibility byte, two array headers, the record
/// type, two 9-byte integers, and a 9-byte byte-string header.
const ADMIN_HEADER_MAX_LEN: usize = 31;

/// Default chunk size for streaming the inner bundle out of the outer
/// payload.
const BLOCK_SIZE: usize = 4 * 1024 * 1024;

/// One unit of extractor work: an outer bundle and the registration it
/// was delivered through.
pub struct BibeEvent {
    pub bundle: BundleRef,
    pub regid: u32,
}

pub struct BibeExtractor {
    daemon: Arc<Daemon>,
    registry: Arc<ProcessorRegistry>,
    block_size: usize,
    event_tx: flume::Sender<BibeEvent>,
    event_rx: flume::Receiver<BibeEvent>,
    should_stop: AtomicBool,
    worker: Mutex<Option<std::thread::JoinHandle<()>>>,
}

impl BibeExtractor {
    pub fn new(daemon: Arc<Daemon>, registry: Arc<ProcessorRegistry>) -> Arc<Self> {
        Self::with_block_size(daemon, registry, BLOCK_SIZE)
    }

    /// As [`BibeExtractor::new`], with an explicit payload streaming
    /// chunk size. Small sizes let tests drive the consume loop across
    /// chunk boundaries without multi-megabyte fixtures.
    pub fn with_block_size(
        daemon: Arc<Daemon>,
        registry: Arc<ProcessorRegistry>,
        block_size: usize,
    ) -> Arc<Self> {
        let depth = daemon.config().event_queue_depth;
        let (event_tx, event_rx) = flume::bounded(depth);
        Arc::new(Self {
            daemon,
            registry,
            block_size: block_size.max(1),
            event_tx,
            event_rx,
            should_stop: AtomicBool::new(false),
            worker: Mutex::new(None),
        })
    }

    /// Queues an outer bundle for extraction.
    pub fn post(&self, bundle: BundleRef, regid: u32) {
        if self.event_tx.send(BibeEvent { bundle, regid }).is_err() {
            error!("BIBE event posted after extractor shutdown");
        }
    }

    /// Starts the extractor thread.
    pub fn start(self: &Arc<Self>) {
        let extractor = self.clone();
        let handle = std::thread::Builder::new()
            .name("bibe-extractor".to_string())
            .spawn(move || extractor.run())
            .expect("failed to spawn extractor thread");
        *self.worker.lock().expect("lock poisoned") = Some(handle);
    }

    pub fn shutdown(&self) {
        self.should_stop.store(true, Ordering::SeqCst);
        if let Some(handle) = self.worker.lock().expect("lock poisoned").take() {
            let _ = handle.join();
        }
    }

    fn run(self: Arc<Self>) {
        // Poll with a short timeout so shutdown stays responsive.
        while !self.should_stop.load(Ordering::SeqCst) {
            match self.event_rx.recv_timeout(Duration::from_millis(100)) {
                Ok(event) => self.process_event(event),
                Err(flume::RecvTimeoutError::Timeout) => {}
                Err(flume::RecvTimeoutError::Disconnected) => break,
            }
        }
        debug!("BIBE extractor complete");
    }

    /// Drains queued events on the caller's thread. Deterministic
    /// alternative to [`BibeExtractor::start`] for tests and
    /// single-threaded embeddings.
    pub fn process_queued_events(&self) {
        while let Ok(event) = self.event_rx.try_recv() {
            self.process_event(event);
        }
    }

    fn process_event(&self, event: BibeEvent) {
        let version = event.bundle.lock().bundle.version;
        match self.extract_bundle(&event.bundle) {
            Ok(()) => {
                event
                    .bundle
                    .lock()
                    .fwdlog
                    .update_for_registration(event.regid, ForwardingState::Delivered);
                match version {
                    Version::V6 => metrics::counter!("aloft_bibe6_extractions").increment(1),
                    _ => metrics::counter!("aloft_bibe7_extractions").increment(1),
                }
            }
            Err(e) => {
                error!(
                    "malformed bundle-in-bundle encapsulation in bundle {}: {e}",
                    event.bundle.id()
                );
                match version {
                    Version::V6 => {
                        metrics::counter!("aloft_bibe6_extraction_errors").increment(1)
                    }
                    _ => metrics::counter!("aloft_bibe7_extraction_errors").increment(1),
                }
            }
        }

        self.daemon.post(Event::BundleDelivered {
            bundle: event.bundle.clone(),
            regid: event.regid,
        });
    }

    /// Decodes the PDU header and streams the inner bundle out.
    fn extract_bundle(&self, outer: &BundleRef) -> Result<(), Error> {
        let (payload_len, is_v6) = {
            let state = outer.lock();
            (state.bundle.payload.len(), state.bundle.version == Version::V6)
        };

        let mut header = [0u8; ADMIN_HEADER_MAX_LEN];
        let header_len = {
            let want = (payload_len as usize).min(ADMIN_HEADER_MAX_LEN);
            let state = outer.lock();
            state.bundle.payload.read_into(0, &mut header[..want])?
        };
        let mut header = &header[..header_len];
        let mut bytes_consumed: u64 = 0;

        if is_v6 {
            // The RFC 5050 compatibility byte carries the record type in
            // its high nibble.
            match header.first() {
                Some(b) if (*b >> 4) as u64 == AdminRecordType::BundleInBundle.code() => {}
                _ => return self.reject(outer, 0, Error::BadAdminNibble),
            }
            header = &header[1..];
            bytes_consumed += 1;
        }

        // Admin record: a two-element array whose first element is the
        // record type, then the three-element BIBE array. The fixed
        // shapes are checked byte-wise because only a prefix of the
        // payload is resident.
        let (transmission_id, retransmit_time, inner_len, pdu_header_len) =
            match Self::decode_pdu_header(header) {
                Ok(fields) => fields,
                Err(e) => return self.reject(outer, 0, e),
            };
        let _ = retransmit_time;
        bytes_consumed += pdu_header_len as u64;

        if payload_len != bytes_consumed + inner_len {
            return self.reject(
                outer,
                transmission_id,
                Error::LengthMismatch {
                    expected: inner_len,
                    found: payload_len.saturating_sub(bytes_consumed),
                },
            );
        }

        match self.consume_inner(outer, bytes_consumed, inner_len) {
            Ok(inner) => self.accept(outer, transmission_id, inner),
            Err(e) => self.reject(outer, transmission_id, e),
        }
    }

    fn decode_pdu_header(header: &[u8]) -> Result<(u64, u64, u64, usize), Error> {
        let mut offset = 0;
        match header.first() {
            Some(0x82) => offset += 1,
            _ => return Err(Error::BadPdu("admin record must be a 2-element array")),
        }

        let (record_type, n) = aloft_cbor::decode::parse::<u64>(&header[offset..])?;
        if record_type != AdminRecordType::BundleInBundle.code() {
            return Err(Error::BadPdu("admin record type is not BIBE"));
        }
        offset += n;

        match header.get(offset) {
            Some(0x83) => offset += 1,
            _ => return Err(Error::BadPdu("BIBE PDU must be a 3-element array")),
        }

        let (transmission_id, n) = aloft_cbor::decode::parse::<u64>(&header[offset..])?;
        offset += n;
        let (retransmit_time, n) = aloft_cbor::decode::parse::<u64>(&header[offset..])?;
        offset += n;

        let (inner_len, n) = aloft_cbor::decode::parse_bytes_header(&header[offset..])?;
        offset += n;

        Ok((transmission_id, retransmit_time, inner_len, offset))
    }

    /// Feeds the encapsulated bundle to the bundle-protocol consumer in
    /// bounded chunks.
    fn consume_inner(
        &self,
        outer: &BundleRef,
        mut offset: u64,
        inner_len: u64,
    ) -> Result<aloft_bp::bundle::Bundle, Error> {
        let mut inner = aloft_bp::bundle::Bundle::default();
        let mut remaining = inner_len;
        let mut carry: Vec<u8> = Vec::new();
        let mut complete = false;

        while remaining > 0 {
            let chunk_size = (remaining as usize).min(self.block_size);
            let start = carry.len();
            carry.resize(start + chunk_size, 0);
            let read = {
                let state = outer.lock();
                state.bundle.payload.read_into(offset, &mut carry[start..])?
            };
            if read != chunk_size {
                return Err(Error::Framing);
            }
            offset += read as u64;
            remaining -= read as u64;

            let (consumed, done) = protocol::consume(&self.registry, &mut inner, &carry)?;
            complete = done;
            carry.drain(..consumed);

            if remaining == 0 {
                if !complete || !carry.is_empty() {
                    // Either the consumer wants more than was declared,
                    // or it finished early with bytes left over.
                    return Err(Error::Framing);
                }
            } else if complete {
                return Err(Error::Framing);
            }
        }

        if !complete {
            return Err(Error::Framing);
        }

        if protocol::validate(&self.registry, &inner).is_err() {
            return Err(Error::InnerInvalid);
        }
        Ok(inner)
    }

    /// Success path: move the payload reservation over to the inner
    /// bundle, re-inject it, and acknowledge the transfer.
    fn accept(
        &self,
        outer: &BundleRef,
        transmission_id: u64,
        mut inner: aloft_bp::bundle::Bundle,
    ) -> Result<(), Error> {
        self.daemon
            .transfer_payload_reservation(outer, inner.payload.len())?;

        // The inner bundle arrived from wherever the outer one did.
        let link = outer
            .lock()
            .fwdlog
            .get_latest_entry_in_state(ForwardingState::Received)
            .map(|e| e.link_name.clone())
            .and_then(|name| self.daemon.find_link(&name));
        inner.prevhop = outer.prevhop();

        if let Err(e) = self.daemon.admit_bundle(inner, EventSource::Peer, link) {
            return self.reject(outer, transmission_id, e.into());
        }

        self.handle_custody_transfer(outer, transmission_id, CustodyDisposition::Accepted);
        Ok(())
    }

    fn reject(&self, outer: &BundleRef, transmission_id: u64, e: Error) -> Result<(), Error> {
        self.handle_custody_transfer(
            outer,
            transmission_id,
            CustodyDisposition::BlockUnintelligible,
        );
        Err(e)
    }

    /// Queues the custody disposition for the outer bundle's source when
    /// the sender asked for acknowledgement.
    fn handle_custody_transfer(
        &self,
        outer: &BundleRef,
        transmission_id: u64,
        reason: CustodyDisposition,
    ) {
        if transmission_id == 0 {
            return;
        }
        let source = outer.lock().bundle.source.clone();
        self.daemon.acs_queue().push(
            &source,
            AcsEntry {
                transmission_id,
                succeeded: reason.is_success(),
                reason,
            },
        );
    }
}

impl RegistrationSink for BibeExtractor {
    fn deliver(&self, bundle: &BundleRef, regid: u32) {
        self.post(bundle.clone(), regid);
    }
}

#[cfg(test)]
mod tests;
