//! Concept data model: schema nodes, instance things, castings, shards, and
//! the scalar values attributes carry.
//!
//! Schema and instance concepts live in arenas keyed by [`ConceptId`]; nodes
//! reference each other by id rather than by owning pointers, so the cyclic
//! Type / Role / RelationType structure stays representable and ids remain
//! stable across schema edits.

mod schema;
mod thing;
mod value;

pub use schema::{RuleBody, SchemaKind, SchemaNode};
pub use thing::{Casting, OwnershipKind, Shard, ThingNode, ThingVariant};
pub use value::{DataType, Value, ValueKey};

/// Stable identifier of a schema or instance concept within one keyspace.
pub type ConceptId = u64;

/// Identifier of a shard. Shards draw from the same ID space as concepts.
pub type ShardId = u64;

/// Reserved ids for the meta schema concepts every keyspace is seeded with.
pub mod meta {
    use super::ConceptId;

    pub const THING: ConceptId = 1;
    pub const ENTITY: ConceptId = 2;
    pub const RELATION: ConceptId = 3;
    pub const ATTRIBUTE: ConceptId = 4;
    pub const ROLE: ConceptId = 5;
    pub const RULE: ConceptId = 6;

    /// Highest reserved id; authorities must allocate above this.
    pub const MAX_RESERVED: ConceptId = 15;

    pub fn is_meta(id: ConceptId) -> bool {
        id <= MAX_RESERVED
    }
}
