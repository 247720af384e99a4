use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::thread;
use std::time::Duration;

use parking_lot::Mutex;
use rustc_hash::FxHashMap;

use crate::concept::meta;
use crate::error::{CairnError, Result};
use crate::id::{IdAuthority, IdBlock};

/// In-memory [`IdAuthority`] handing out consecutive fixed-size blocks per
/// (partition, namespace). The default backend for in-process servers; also
/// the workhorse of the pool tests, with injectable latency, failures and a
/// hard cap to provoke the pool's error paths.
pub struct CountingAuthority {
    block_size: u64,
    first_id: u64,
    cap: Option<u64>,
    delay: Option<Duration>,
    interruptible: bool,
    fail_budget: AtomicU32,
    calls: AtomicU64,
    next_start: Mutex<FxHashMap<(u32, u32), u64>>,
}

impl CountingAuthority {
    pub fn new(block_size: u64) -> Self {
        Self {
            block_size: block_size.max(1),
            first_id: meta::MAX_RESERVED + 1,
            cap: None,
            delay: None,
            interruptible: false,
            fail_budget: AtomicU32::new(0),
            calls: AtomicU64::new(0),
            next_start: Mutex::new(FxHashMap::default()),
        }
    }

    /// Exclusive upper limit per pair; allocation past it reports exhaustion.
    pub fn with_cap(mut self, cap: u64) -> Self {
        self.cap = Some(cap);
        self
    }

    /// Injected latency per fetch.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn with_interruption_support(mut self, interruptible: bool) -> Self {
        self.interruptible = interruptible;
        self
    }

    /// Makes the next `n` fetches fail with a backend error.
    pub fn fail_next(&self, n: u32) {
        self.fail_budget.store(n, Ordering::SeqCst);
    }

    /// Number of fetches issued so far.
    pub fn calls(&self) -> u64 {
        self.calls.load(Ordering::SeqCst)
    }
}

impl IdAuthority for CountingAuthority {
    fn get_id_block(&self, partition: u32, namespace: u32, _timeout: Duration) -> Result<IdBlock> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some(delay) = self.delay {
            thread::sleep(delay);
        }
        if self
            .fail_budget
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            return Err(CairnError::PoolBackend("injected backend failure".into()));
        }

        let mut next_start = self.next_start.lock();
        let start = *next_start
            .entry((partition, namespace))
            .or_insert(self.first_id);
        let len = match self.cap {
            Some(cap) if start >= cap => {
                return Err(CairnError::PoolExhausted {
                    partition,
                    namespace,
                })
            }
            Some(cap) => self.block_size.min(cap - start),
            None => self.block_size,
        };
        next_start.insert((partition, namespace), start + len);
        Ok(IdBlock::new(start, len))
    }

    fn supports_interruption(&self) -> bool {
        self.interruptible
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn blocks_are_consecutive_per_pair() {
        let authority = CountingAuthority::new(100);
        let a = authority
            .get_id_block(0, 0, Duration::from_secs(1))
            .expect("first block");
        let b = authority
            .get_id_block(0, 0, Duration::from_secs(1))
            .expect("second block");
        assert_eq!(b.start(), a.start() + a.num_ids());

        let other = authority
            .get_id_block(1, 0, Duration::from_secs(1))
            .expect("other partition");
        assert_eq!(other.start(), a.start());
    }

    #[test]
    fn cap_truncates_then_exhausts() {
        let authority = CountingAuthority::new(100).with_cap(meta::MAX_RESERVED + 1 + 150);
        let a = authority
            .get_id_block(0, 0, Duration::from_secs(1))
            .expect("full block");
        assert_eq!(a.num_ids(), 100);
        let b = authority
            .get_id_block(0, 0, Duration::from_secs(1))
            .expect("truncated block");
        assert_eq!(b.num_ids(), 50);
        let err = authority
            .get_id_block(0, 0, Duration::from_secs(1))
            .unwrap_err();
        assert!(matches!(err, CairnError::PoolExhausted { .. }));
    }

    #[test]
    fn injected_failures_are_consumed() {
        let authority = CountingAuthority::new(10);
        authority.fail_next(1);
        assert!(authority
            .get_id_block(0, 0, Duration::from_secs(1))
            .is_err());
        assert!(authority.get_id_block(0, 0, Duration::from_secs(1)).is_ok());
    }
}
