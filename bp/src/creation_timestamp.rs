/*!
Bundle creation timestamps.

A creation timestamp is the pair of seconds since the DTN epoch
(2000-01-01T00:00:00Z) and a sequence number disambiguating bundles created
within the same second. Together with the source EID and fragment fields it
uniquely identifies a bundle.
*/

use std::time::{SystemTime, UNIX_EPOCH};

/// Seconds between the Unix epoch and the DTN epoch.
pub const DTN_EPOCH_OFFSET: u64 = 946_684_800;

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CreationTimestamp {
    /// Seconds since the DTN epoch.
    pub seconds: u64,
    /// Sequence number within the second.
    pub sequence: u64,
}

impl CreationTimestamp {
    pub fn new(seconds: u64, sequence: u64) -> Self {
        Self { seconds, sequence }
    }

    /// A timestamp for the current wall-clock second with the given
    /// sequence number.
    pub fn now(sequence: u64) -> Self {
        let seconds = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs().saturating_sub(DTN_EPOCH_OFFSET))
            .unwrap_or(0);
        Self { seconds, sequence }
    }
}

impl core::fmt::Display for CreationTimestamp {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "{}.{}", self.seconds, self.sequence)
    }
}
