use std::sync::Arc;

use parking_lot::RwLock;
use tracing::debug;

use crate::concept::ConceptId;
use crate::config::Config;
use crate::error::Result;
use crate::graph::KeyspaceGraph;
use crate::id::{BlockPool, IdAuthority};

/// Shared per-keyspace state: the committed graph and the keyspace's id
/// pool. Sessions (from any number of clients) share one handle.
pub struct KeyspaceHandle {
    name: String,
    config: Config,
    graph: RwLock<KeyspaceGraph>,
    pool: BlockPool,
}

impl KeyspaceHandle {
    /// Opens a keyspace: bootstraps the meta schema and starts the id pool
    /// on the given partition.
    pub fn open(
        name: &str,
        partition: u32,
        config: Config,
        authority: Arc<dyn IdAuthority>,
    ) -> Result<Arc<Self>> {
        let pool = BlockPool::new(
            authority,
            partition,
            0,
            config.id_upper_bound,
            config.id_renew_timeout,
            config.id_renew_buffer_percentage,
        )?;
        debug!(keyspace = name, partition, "opened keyspace");
        Ok(Arc::new(Self {
            name: name.to_string(),
            config,
            graph: RwLock::new(KeyspaceGraph::bootstrap(name)),
            pool,
        }))
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn graph(&self) -> &RwLock<KeyspaceGraph> {
        &self.graph
    }

    /// Allocates a fresh concept id from the keyspace's pool.
    pub fn next_id(&self) -> Result<ConceptId> {
        self.pool.next_id()
    }

    /// Shuts down the id pool. Called by the server on close.
    pub fn close(&self) {
        self.pool.close();
    }
}
