use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, ThreadId};

use lru::LruCache;
use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use tracing::{debug, info};

use crate::concept::{ConceptId, ValueKey};
use crate::error::{CairnError, Result};
use crate::server::keyspace::KeyspaceHandle;
use crate::server::transaction::{Transaction, TxInner, TxMode};

pub(crate) struct SessionInner {
    pub(crate) keyspace: Arc<KeyspaceHandle>,
    /// At most one open transaction per thread.
    pub(crate) open_tx: Mutex<FxHashMap<ThreadId, Arc<TxInner>>>,
    /// Attribute-by-value cache shared by this session's transactions.
    /// Cleared on every commit from this session; entries are verified on
    /// read, so staleness from other sessions' commits only under-reports.
    pub(crate) attribute_cache: Mutex<LruCache<ValueKey, Vec<ConceptId>>>,
    pub(crate) closed: AtomicBool,
}

impl SessionInner {
    pub(crate) fn note_commit(&self) {
        self.attribute_cache.lock().clear();
    }
}

/// Keyspace-scoped handle minting transactions. Clone-free: share the
/// session by reference across threads; each thread opens its own
/// transaction.
pub struct Session {
    pub(crate) inner: Arc<SessionInner>,
}

impl Session {
    pub(crate) fn new(keyspace: Arc<KeyspaceHandle>) -> Self {
        let capacity = NonZeroUsize::new(keyspace.config().attribute_cache_capacity.max(1))
            .unwrap_or(NonZeroUsize::MIN);
        debug!(keyspace = keyspace.name(), "opened session");
        Self {
            inner: Arc::new(SessionInner {
                keyspace,
                open_tx: Mutex::new(FxHashMap::default()),
                attribute_cache: Mutex::new(LruCache::new(capacity)),
                closed: AtomicBool::new(false),
            }),
        }
    }

    pub fn keyspace(&self) -> &str {
        self.inner.keyspace.name()
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }

    /// Starts building a transaction on the calling thread.
    pub fn transaction(&self) -> TransactionBuilder<'_> {
        TransactionBuilder { session: self }
    }

    fn open(&self, mode: TxMode) -> Result<Transaction> {
        if self.is_closed() {
            return Err(CairnError::SessionClosed {
                keyspace: self.keyspace().to_string(),
            });
        }
        let thread_id = thread::current().id();
        let mut open_tx = self.inner.open_tx.lock();
        if let Some(existing) = open_tx.get(&thread_id) {
            if !existing.is_closed() {
                return Err(CairnError::ConcurrentTransactionOnThread {
                    keyspace: self.keyspace().to_string(),
                });
            }
        }
        let inner = Transaction::new(
            Arc::clone(&self.inner.keyspace),
            Arc::downgrade(&self.inner),
            mode,
        );
        open_tx.insert(thread_id, Arc::clone(&inner));
        debug!(
            keyspace = self.keyspace(),
            mode = ?mode,
            "opened transaction"
        );
        Ok(Transaction { inner })
    }

    /// Closes the session and every transaction it still has open.
    /// Idempotent; subsequent `transaction()` calls fail with
    /// `SessionClosed`.
    pub fn close(&self) {
        if self.inner.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        let drained: Vec<Arc<TxInner>> = self.inner.open_tx.lock().drain().map(|(_, tx)| tx).collect();
        let outstanding = drained.len();
        for tx in drained {
            tx.force_close();
        }
        self.inner.attribute_cache.lock().clear();
        info!(
            keyspace = self.keyspace(),
            outstanding, "closed session"
        );
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.close();
    }
}

/// Mode selector returned by [`Session::transaction`].
pub struct TransactionBuilder<'a> {
    session: &'a Session,
}

impl TransactionBuilder<'_> {
    pub fn read(self) -> Result<Transaction> {
        self.session.open(TxMode::Read)
    }

    pub fn write(self) -> Result<Transaction> {
        self.session.open(TxMode::Write)
    }
}
