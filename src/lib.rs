//! cairn: a transactional knowledge-graph engine.
//!
//! A [`Server`] multiplexes keyspaces and mints [`Session`]s; sessions mint
//! thread-bound [`Transaction`]s that stage mutations against the shared
//! keyspace graph, validated at commit against the global schema rules.
//! Concept ids come from a per-keyspace [`id::BlockPool`] that prefetches
//! blocks from an [`id::IdAuthority`] on a background worker.

pub mod concept;
pub mod config;
pub mod error;
pub mod graph;
pub mod id;
pub mod query;
pub mod server;

pub use crate::concept::{ConceptId, DataType, Value};
pub use crate::config::Config;
pub use crate::error::{CairnError, Result};
pub use crate::query::ConceptMap;
pub use crate::server::{QueryResult, Server, Session, Transaction, TxMode};
