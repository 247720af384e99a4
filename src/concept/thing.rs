use std::collections::BTreeMap;

use smallvec::SmallVec;

use crate::concept::{ConceptId, ShardId, Value};

/// One role-player edge of a relation: the (role, player) pair; the owning
/// relation is the casting's container.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Casting {
    pub role: ConceptId,
    pub player: ConceptId,
}

/// Provenance of an attribute ownership edge. Inferred ownerships are never
/// persisted by commit.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OwnershipKind {
    Asserted,
    Inferred,
}

/// Instance-graph variant of a thing.
#[derive(Clone, Debug)]
pub enum ThingVariant {
    Entity,
    Attribute(Value),
    /// Castings of a relation. Most relations are binary.
    Relation(SmallVec<[Casting; 4]>),
}

/// One node of the instance graph.
#[derive(Clone, Debug)]
pub struct ThingNode {
    pub id: ConceptId,
    /// Direct type; a pointer into the schema arena.
    pub type_: ConceptId,
    pub variant: ThingVariant,
    /// Attribute instances this thing owns, with edge provenance.
    pub owned: BTreeMap<ConceptId, OwnershipKind>,
    /// Shard the instance was attached to at creation.
    pub shard: ShardId,
    /// True while the thing exists only by virtue of rule inference.
    pub inferred: bool,
}

impl ThingNode {
    pub fn new(id: ConceptId, type_: ConceptId, variant: ThingVariant, shard: ShardId) -> Self {
        Self {
            id,
            type_,
            variant,
            owned: BTreeMap::new(),
            shard,
            inferred: false,
        }
    }

    pub fn castings(&self) -> &[Casting] {
        match &self.variant {
            ThingVariant::Relation(castings) => castings,
            _ => &[],
        }
    }

    pub fn value(&self) -> Option<&Value> {
        match &self.variant {
            ThingVariant::Attribute(v) => Some(v),
            _ => None,
        }
    }

    pub fn is_relation(&self) -> bool {
        matches!(self.variant, ThingVariant::Relation(_))
    }
}

/// Append-only bucket owning a subset of a type's instances. Membership is
/// frozen once a newer shard is opened for the type.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Shard {
    pub id: ShardId,
    pub members: Vec<ConceptId>,
}

impl Shard {
    pub fn new(id: ShardId) -> Self {
        Self {
            id,
            members: Vec::new(),
        }
    }

    pub fn len(&self) -> u64 {
        self.members.len() as u64
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }
}
