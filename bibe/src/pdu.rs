/*!
BIBE protocol data unit framing.

Encapsulation produces the admin-record payload bytes for an outer bundle;
the header decode half lives in the extractor, which must work from a
bounded prefix of the payload.
*/

use aloft_bp::admin::AdminRecordType;
use aloft_cbor::encode::{self, Bytes};

/// Parameters for wrapping a bundle.
#[derive(Debug, Clone, Copy, Default)]
pub struct EncapsulationParams {
    /// Non-zero when the sender expects a custody acknowledgement.
    pub transmission_id: u64,
    /// Seconds after which the sender will retransmit unacknowledged
    /// transfers; zero when custody is not requested.
    pub retransmit_time: u64,
    /// Prefix the record with the BPv6 admin-record type byte.
    pub bpv6_compatibility: bool,
}

/// Builds the admin-record payload carrying `inner` verbatim.
pub fn encapsulate(inner: &[u8], params: &EncapsulationParams) -> Vec<u8> {
    let mut payload = Vec::new();
    if params.bpv6_compatibility {
        // RFC 5050 admin records put the type in the high nibble of the
        // first payload byte.
        payload.push((AdminRecordType::BundleInBundle.code() as u8) << 4);
    }

    let mut encoder = encode::Encoder::new();
    encoder.emit_array(Some(2), |a| {
        a.emit(&AdminRecordType::BundleInBundle.code());
        a.emit_array(Some(3), |b| {
            b.emit(&params.transmission_id);
            b.emit(&params.retransmit_time);
            b.emit(&Bytes(inner));
        });
    });
    payload.extend_from_slice(&encoder.build());
    payload
}

#[cfg(test)]
mod tests {
    use super::*;
    use hex_literal::hex;

    #[test]
    fn known_framing() {
        let payload = encapsulate(
            &hex!("deadbeef"),
            &EncapsulationParams {
                transmission_id: 42,
                retransmit_time: 0,
                bpv6_compatibility: false,
            },
        );
        // [3, [42, 0, h'deadbeef']]
        assert_eq!(payload, hex!("820383182a0044deadbeef"));
    }

    #[test]
    fn bpv6_prefix_byte() {
        let payload = encapsulate(
            b"x",
            &EncapsulationParams {
                transmission_id: 0,
                retransmit_time: 0,
                bpv6_compatibility: true,
            },
        );
        assert_eq!(payload[0], 0x30);
        assert_eq!(payload[1], 0x82);
    }
}
