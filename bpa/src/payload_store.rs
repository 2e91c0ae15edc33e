/*!
Payload space accounting.

Payload bytes live in a bounded storage area; space is reserved before a
bundle's payload is written and released when the bundle is deleted.
Reservation failure is a hard failure: the bundle is rejected rather than
partially stored.
*/

use std::sync::Mutex;
use thiserror::Error;
use tracing::debug;

#[derive(Error, Debug, PartialEq, Eq)]
#[error("payload store quota exceeded: {requested} requested, {available} available")]
pub struct QuotaExceeded {
    pub requested: u64,
    pub available: u64,
}

pub struct PayloadStore {
    quota: u64,
    used: Mutex<u64>,
}

impl PayloadStore {
    pub fn new(quota: u64) -> Self {
        Self {
            quota,
            used: Mutex::new(0),
        }
    }

    /// Reserves `len` bytes of payload space.
    pub fn reserve(&self, len: u64) -> Result<(), QuotaExceeded> {
        let mut used = self.used.lock().expect("lock poisoned");
        let available = self.quota - *used;
        if len > available {
            return Err(QuotaExceeded {
                requested: len,
                available,
            });
        }
        *used += len;
        debug!("reserved {len} payload bytes, {} in use", *used);
        Ok(())
    }

    /// Releases a previous reservation.
    pub fn release(&self, len: u64) {
        let mut used = self.used.lock().expect("lock poisoned");
        *used = used.saturating_sub(len);
    }

    pub fn used(&self) -> u64 {
        *self.used.lock().expect("lock poisoned")
    }

    pub fn quota(&self) -> u64 {
        self.quota
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reserve_and_release() {
        let store = PayloadStore::new(100);
        store.reserve(60).unwrap();
        assert_eq!(
            store.reserve(50),
            Err(QuotaExceeded {
                requested: 50,
                available: 40
            })
        );
        store.release(30);
        store.reserve(50).unwrap();
        assert_eq!(store.used(), 80);
        store.release(1000);
        assert_eq!(store.used(), 0);
    }
}
