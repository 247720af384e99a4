//! Server, session and transaction machinery: keyspace multiplexing, the
//! per-thread transaction lifecycle, commit validation and query execution.

mod executor;
mod inference;
mod keyspace;
mod session;
mod transaction;
mod validator;

pub use executor::QueryResult;
pub use keyspace::KeyspaceHandle;
pub use session::{Session, TransactionBuilder};
pub use transaction::{Transaction, TxMode};

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use tracing::info;

use crate::config::Config;
use crate::error::{CairnError, Result};
use crate::id::{CountingAuthority, IdAuthority};
use crate::server::session::SessionInner;

/// Owns the id authority and the keyspace registry; mints sessions by
/// keyspace name and closes everything on shutdown.
pub struct Server {
    config: Config,
    authority: Arc<dyn IdAuthority>,
    keyspaces: Mutex<FxHashMap<String, Arc<KeyspaceHandle>>>,
    sessions: Mutex<Vec<Weak<SessionInner>>>,
    next_partition: AtomicU32,
    closed: AtomicBool,
}

impl Server {
    /// A server backed by the in-memory counting authority.
    pub fn new(config: Config) -> Self {
        let block_size = config.id_block_size;
        Self::with_authority(config, Arc::new(CountingAuthority::new(block_size)))
    }

    pub fn with_authority(config: Config, authority: Arc<dyn IdAuthority>) -> Self {
        Self {
            config,
            authority,
            keyspaces: Mutex::new(FxHashMap::default()),
            sessions: Mutex::new(Vec::new()),
            next_partition: AtomicU32::new(0),
            closed: AtomicBool::new(false),
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Opens a session on the named keyspace, creating the keyspace on
    /// first use. Sessions of one keyspace share its store and id pool.
    pub fn session(&self, keyspace: &str) -> Result<Session> {
        if self.closed.load(Ordering::Acquire) {
            return Err(CairnError::ServerClosed);
        }
        let handle = {
            let mut keyspaces = self.keyspaces.lock();
            match keyspaces.get(keyspace) {
                Some(handle) => Arc::clone(handle),
                None => {
                    let partition = self.next_partition.fetch_add(1, Ordering::SeqCst);
                    let handle = KeyspaceHandle::open(
                        keyspace,
                        partition,
                        self.config.clone(),
                        Arc::clone(&self.authority),
                    )?;
                    keyspaces.insert(keyspace.to_string(), Arc::clone(&handle));
                    info!(keyspace, partition, "created keyspace");
                    handle
                }
            }
        };
        let session = Session::new(handle);
        self.sessions.lock().push(Arc::downgrade(&session.inner));
        Ok(session)
    }

    /// Closes every live session, then every keyspace's id pool.
    /// Idempotent.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        let sessions: Vec<Weak<SessionInner>> = std::mem::take(&mut *self.sessions.lock());
        for weak in sessions {
            if let Some(inner) = weak.upgrade() {
                // Close via a transient handle so the drain logic lives in
                // one place.
                let session = Session { inner };
                session.close();
            }
        }
        let keyspaces: Vec<Arc<KeyspaceHandle>> =
            self.keyspaces.lock().values().cloned().collect();
        for keyspace in keyspaces {
            keyspace.close();
        }
        info!("server closed");
    }
}

impl Drop for Server {
    fn drop(&mut self) {
        self.close();
    }
}
