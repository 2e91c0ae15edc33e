/*!
Administrative record identification and the status-report reason codes.
*/

use crate::bundle::{Bundle, Version};

/// Administrative record type codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdminRecordType {
    StatusReport,
    CustodySignal,
    /// Bundle-in-Bundle Encapsulation (BPv7 assignment; carried on BPv6 as
    /// a compatibility extension).
    BundleInBundle,
    AggregateCustodySignal,
}

impl AdminRecordType {
    pub fn code(&self) -> u64 {
        match self {
            AdminRecordType::StatusReport => 1,
            AdminRecordType::CustodySignal => 2,
            AdminRecordType::BundleInBundle => 3,
            AdminRecordType::AggregateCustodySignal => 4,
        }
    }

    pub fn from_code(code: u64) -> Option<Self> {
        match code {
            1 => Some(AdminRecordType::StatusReport),
            2 => Some(AdminRecordType::CustodySignal),
            3 => Some(AdminRecordType::BundleInBundle),
            4 => Some(AdminRecordType::AggregateCustodySignal),
            _ => None,
        }
    }
}

/// Bundle status report reason codes (RFC 5050 section 6.1.1).
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub enum ReasonCode {
    #[default]
    NoAdditionalInfo,
    LifetimeExpired,
    ForwardedOverUnidirectionalLink,
    TransmissionCancelled,
    DepletedStorage,
    EndpointIdUnintelligible,
    NoRouteToDestination,
    NoTimelyContact,
    BlockUnintelligible,
    SecurityFailed,
}

impl ReasonCode {
    pub fn code(&self) -> u64 {
        match self {
            ReasonCode::NoAdditionalInfo => 0,
            ReasonCode::LifetimeExpired => 1,
            ReasonCode::ForwardedOverUnidirectionalLink => 2,
            ReasonCode::TransmissionCancelled => 3,
            ReasonCode::DepletedStorage => 4,
            ReasonCode::EndpointIdUnintelligible => 5,
            ReasonCode::NoRouteToDestination => 6,
            ReasonCode::NoTimelyContact => 7,
            ReasonCode::BlockUnintelligible => 8,
            ReasonCode::SecurityFailed => 9,
        }
    }
}

/// Custody transfer disposition codes used by BIBE custody signalling.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CustodyDisposition {
    Accepted,
    RedundantReception,
    DepletedStorage,
    EndpointIdUnintelligible,
    NoRouteToDestination,
    NoTimelyContact,
    BlockUnintelligible,
}

impl CustodyDisposition {
    pub fn code(&self) -> u64 {
        match self {
            CustodyDisposition::Accepted => 0,
            CustodyDisposition::RedundantReception => 3,
            CustodyDisposition::DepletedStorage => 4,
            CustodyDisposition::EndpointIdUnintelligible => 5,
            CustodyDisposition::NoRouteToDestination => 6,
            CustodyDisposition::NoTimelyContact => 7,
            CustodyDisposition::BlockUnintelligible => 8,
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, CustodyDisposition::Accepted)
    }
}

/// Determines the administrative record type of an admin bundle from the
/// leading bytes of its payload.
///
/// Returns `None` if the bundle is not flagged administrative or the
/// payload prefix does not parse.
pub fn admin_record_type(bundle: &Bundle) -> Option<AdminRecordType> {
    if !bundle.is_admin() {
        return None;
    }

    let mut prefix = [0u8; 16];
    let n = bundle.payload.read_into(0, &mut prefix).ok()?;
    let prefix = &prefix[..n];

    match bundle.version {
        // The record type is the high nibble of the first payload byte.
        Version::V6 => AdminRecordType::from_code((prefix.first()? >> 4) as u64),
        // The payload is a two-element CBOR array whose first element is
        // the record type. Only the prefix is resident here, so the array
        // header and type code are decoded without touching the body.
        Version::V7 => {
            let (first, rest) = prefix.split_first()?;
            if *first != 0x82 {
                return None;
            }
            aloft_cbor::decode::parse::<u64>(rest)
                .ok()
                .and_then(|(code, _)| AdminRecordType::from_code(code))
        }
        Version::Unknown => None,
    }
}
