/*!
Bundle status reports (RFC 5050 section 6.1.1).

A status report is an administrative record echoing the identification of
the subject bundle plus timestamps for whichever events are being
reported. Only generation is implemented; inbound status reports are an
application concern.
*/

use crate::{
    admin::{AdminRecordType, ReasonCode},
    bundle::FragmentInfo,
    creation_timestamp::CreationTimestamp,
    eid::EndpointId,
    sdnv,
};

const ADMIN_IS_FRAGMENT: u8 = 0x01;

const STATUS_RECEIVED: u8 = 1 << 0;
const STATUS_CUSTODY_ACCEPTED: u8 = 1 << 1;
const STATUS_FORWARDED: u8 = 1 << 2;
const STATUS_DELIVERED: u8 = 1 << 3;
const STATUS_DELETED: u8 = 1 << 4;

/// A status report under construction. Each `Some` timestamp (seconds on
/// the DTN epoch clock) sets the corresponding status flag.
#[derive(Debug, Default, Clone)]
pub struct StatusReport {
    pub received: Option<u64>,
    pub custody_accepted: Option<u64>,
    pub forwarded: Option<u64>,
    pub delivered: Option<u64>,
    pub deleted: Option<u64>,
    pub reason: ReasonCode,
    /// Fragment fields of the subject bundle, when it is a fragment.
    pub fragment: Option<FragmentInfo>,
    pub subject_timestamp: CreationTimestamp,
    pub subject_source: EndpointId,
}

impl StatusReport {
    fn status_flags(&self) -> u8 {
        let mut flags = 0;
        if self.received.is_some() {
            flags |= STATUS_RECEIVED;
        }
        if self.custody_accepted.is_some() {
            flags |= STATUS_CUSTODY_ACCEPTED;
        }
        if self.forwarded.is_some() {
            flags |= STATUS_FORWARDED;
        }
        if self.delivered.is_some() {
            flags |= STATUS_DELIVERED;
        }
        if self.deleted.is_some() {
            flags |= STATUS_DELETED;
        }
        flags
    }

    /// Encodes the BPv6 admin-record payload.
    pub fn to_v6_payload(&self) -> Vec<u8> {
        let mut out = Vec::new();
        let mut type_byte = (AdminRecordType::StatusReport.code() as u8) << 4;
        if self.fragment.is_some() {
            type_byte |= ADMIN_IS_FRAGMENT;
        }
        out.push(type_byte);
        out.push(self.status_flags());
        out.push(self.reason.code() as u8);

        if let Some(fragment) = &self.fragment {
            out.extend_from_slice(&sdnv::encode(fragment.offset));
            out.extend_from_slice(&sdnv::encode(fragment.total_adu_length));
        }

        // Each flagged event carries a DTN time: seconds plus nanoseconds.
        for ts in [
            self.received,
            self.custody_accepted,
            self.forwarded,
            self.delivered,
            self.deleted,
        ]
        .into_iter()
        .flatten()
        {
            out.extend_from_slice(&sdnv::encode(ts));
            out.extend_from_slice(&sdnv::encode(0));
        }

        out.extend_from_slice(&sdnv::encode(self.subject_timestamp.seconds));
        out.extend_from_slice(&sdnv::encode(self.subject_timestamp.sequence));

        let source = self.subject_source.uri();
        out.extend_from_slice(&sdnv::encode(source.len() as u64));
        out.extend_from_slice(source.as_bytes());
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn deletion_report_layout() {
        let report = StatusReport {
            deleted: Some(1000),
            reason: ReasonCode::LifetimeExpired,
            subject_timestamp: CreationTimestamp::new(99, 7),
            subject_source: "dtn://src.dtn/app".parse().unwrap(),
            ..Default::default()
        };
        let payload = report.to_v6_payload();

        assert_eq!(payload[0], 0x10);
        assert_eq!(payload[1], STATUS_DELETED);
        assert_eq!(payload[2], 1);
        // deleted time (1000, 0), then creation ts (99, 7)
        let mut offset = 3;
        let (secs, n) = sdnv::decode(&payload[offset..]).unwrap();
        assert_eq!(secs, 1000);
        offset += n;
        let (nanos, n) = sdnv::decode(&payload[offset..]).unwrap();
        assert_eq!(nanos, 0);
        offset += n;
        let (ts, n) = sdnv::decode(&payload[offset..]).unwrap();
        assert_eq!(ts, 99);
        offset += n;
        let (seq, n) = sdnv::decode(&payload[offset..]).unwrap();
        assert_eq!(seq, 7);
        offset += n;
        let (len, n) = sdnv::decode(&payload[offset..]).unwrap();
        offset += n;
        assert_eq!(
            &payload[offset..offset + len as usize],
            b"dtn://src.dtn/app"
        );
    }

    #[test]
    fn fragment_fields_present_when_fragment() {
        let report = StatusReport {
            received: Some(5),
            fragment: Some(FragmentInfo {
                offset: 10,
                total_adu_length: 100,
            }),
            subject_source: "dtn://src.dtn/app".parse().unwrap(),
            ..Default::default()
        };
        let payload = report.to_v6_payload();
        assert_eq!(payload[0], 0x11);
        assert_eq!(payload[1], STATUS_RECEIVED);
        let (frag_offset, _) = sdnv::decode(&payload[3..]).unwrap();
        assert_eq!(frag_offset, 10);
    }
}
