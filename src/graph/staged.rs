use rustc_hash::{FxHashMap, FxHashSet};

use crate::concept::{ConceptId, SchemaNode, ThingNode};
use crate::graph::KeyspaceGraph;

/// How a staged thing came to exist in this transaction.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Provenance {
    /// Created by a user mutation.
    Inserted,
    /// Derived by rule inference during query execution.
    Inferred,
}

/// One transaction's private delta over the committed graph.
///
/// Modifying a committed concept copies it in here first (copy-on-write);
/// lookups through [`super::GraphView`] consult the delta before the
/// committed arena. `mutated` tracks user-level mutations only; staged
/// inference does not make a read transaction dirty.
#[derive(Default)]
pub struct Staged {
    pub schema: FxHashMap<ConceptId, SchemaNode>,
    pub labels: FxHashMap<String, ConceptId>,
    pub things: FxHashMap<ConceptId, ThingNode>,
    /// Committed things deleted this transaction.
    pub deleted: FxHashSet<ConceptId>,
    pub provenance: FxHashMap<ConceptId, Provenance>,
    /// Pre-existing concepts referenced by user mutations; seeds the
    /// inferred-concept persistence closure.
    pub user_touched: FxHashSet<ConceptId>,
    pub mutated: bool,
}

impl Staged {
    pub fn is_empty(&self) -> bool {
        self.schema.is_empty()
            && self.labels.is_empty()
            && self.things.is_empty()
            && self.deleted.is_empty()
    }

    /// Mutable handle on a schema node, copying it out of the committed
    /// arena on first touch.
    pub fn schema_mut(
        &mut self,
        committed: &KeyspaceGraph,
        id: ConceptId,
    ) -> Option<&mut SchemaNode> {
        if !self.schema.contains_key(&id) {
            let node = committed.schema(id)?.clone();
            self.schema.insert(id, node);
        }
        self.schema.get_mut(&id)
    }

    /// Mutable handle on a thing, copying it out of the committed arena on
    /// first touch. Deleted things are gone.
    pub fn thing_mut(&mut self, committed: &KeyspaceGraph, id: ConceptId) -> Option<&mut ThingNode> {
        if self.deleted.contains(&id) {
            return None;
        }
        if !self.things.contains_key(&id) {
            let node = committed.thing(id)?.clone();
            self.things.insert(id, node);
        }
        self.things.get_mut(&id)
    }
}
