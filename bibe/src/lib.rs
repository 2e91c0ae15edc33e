/*!
Bundle-in-Bundle Encapsulation.

A BIBE bundle is an administrative bundle whose payload is a CBOR protocol
data unit carrying another, complete bundle:

```text
[3, [transmission-id, retransmit-time, bstr(inner bundle)]]
```

with a leading admin-record nibble byte on the BPv6 variant. The
[`extractor::BibeExtractor`] unwraps the inner bundle in bounded chunks
(the encapsulated bundle may be far larger than any buffer this crate
allocates) and re-injects it into the daemon as a fresh reception. Custody
dispositions for the outer transfer are queued for aggregate custody
signalling.
*/

pub mod extractor;

mod pdu;

pub use extractor::BibeExtractor;
pub use pdu::{encapsulate, EncapsulationParams};

use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    /// The BPv6 leading byte does not carry the BIBE admin record type.
    #[error("BPv6 variant has incorrect admin record type")]
    BadAdminNibble,

    /// The payload's CBOR framing is not the expected fixed-shape arrays.
    #[error("malformed BIBE protocol data unit: {0}")]
    BadPdu(&'static str),

    /// The payload length disagrees with the declared inner-bundle length.
    #[error("payload length mismatch: {expected} declared, {found} present")]
    LengthMismatch { expected: u64, found: u64 },

    /// The inner bundle completed before all declared bytes were fed, or
    /// never completed.
    #[error("encapsulated bundle framing error")]
    Framing,

    /// The inner bundle failed block validation.
    #[error("encapsulated bundle rejected as unintelligible")]
    InnerInvalid,

    /// No payload space for the inner bundle.
    #[error(transparent)]
    Quota(#[from] aloft_bpa::payload_store::QuotaExceeded),

    /// Reading the outer payload failed.
    #[error("payload read error: {0}")]
    PayloadRead(#[from] std::io::Error),

    /// A CBOR-level decode error in the PDU header.
    #[error(transparent)]
    Cbor(#[from] aloft_cbor::decode::Error),

    /// A wire-format error in the encapsulated bundle.
    #[error(transparent)]
    Inner(#[from] aloft_bp::Error),
}
