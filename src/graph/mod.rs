//! Committed keyspace state and the staged overlay transactions write into.
//!
//! [`KeyspaceGraph`] is the durable arena shared by every session of a
//! keyspace; [`Staged`] is one transaction's private delta over it;
//! [`GraphView`] merges the two for reads, the validator, and the matcher.

mod staged;
mod view;

pub use staged::{Provenance, Staged};
pub use view::GraphView;

use rustc_hash::{FxHashMap, FxHashSet};
use std::collections::BTreeSet;
use tracing::debug;

use crate::concept::{
    meta, ConceptId, OwnershipKind, SchemaKind, SchemaNode, ThingNode, ValueKey,
};

/// Arena of committed schema and instance concepts for one keyspace, plus
/// the secondary indexes reads go through. Guarded by the keyspace's
/// `RwLock`; commits hold the write half, everything else the read half.
pub struct KeyspaceGraph {
    name: String,
    schema: FxHashMap<ConceptId, SchemaNode>,
    labels: FxHashMap<String, ConceptId>,
    things: FxHashMap<ConceptId, ThingNode>,
    instances_by_type: FxHashMap<ConceptId, BTreeSet<ConceptId>>,
    attributes_by_value: FxHashMap<ValueKey, BTreeSet<ConceptId>>,
    owners_of: FxHashMap<ConceptId, BTreeSet<ConceptId>>,
    /// player -> (relation, role) adjacency.
    castings_by_player: FxHashMap<ConceptId, Vec<(ConceptId, ConceptId)>>,
    commit_generation: u64,
}

impl KeyspaceGraph {
    /// Creates an empty keyspace seeded with the meta schema concepts.
    pub fn bootstrap(name: impl Into<String>) -> Self {
        let mut graph = Self {
            name: name.into(),
            schema: FxHashMap::default(),
            labels: FxHashMap::default(),
            things: FxHashMap::default(),
            instances_by_type: FxHashMap::default(),
            attributes_by_value: FxHashMap::default(),
            owners_of: FxHashMap::default(),
            castings_by_player: FxHashMap::default(),
            commit_generation: 0,
        };
        let metas = [
            (meta::THING, "thing", SchemaKind::Thing, None),
            (meta::ENTITY, "entity", SchemaKind::Entity, Some(meta::THING)),
            (
                meta::RELATION,
                "relation",
                SchemaKind::Relation,
                Some(meta::THING),
            ),
            (
                meta::ATTRIBUTE,
                "attribute",
                SchemaKind::Attribute,
                Some(meta::THING),
            ),
            (meta::ROLE, "role", SchemaKind::Role, Some(meta::THING)),
            (meta::RULE, "rule", SchemaKind::Rule, Some(meta::THING)),
        ];
        for (id, label, kind, sup) in metas {
            let mut node = SchemaNode::new(id, label, kind, sup);
            node.is_abstract = true;
            graph.labels.insert(node.label.clone(), id);
            graph.schema.insert(id, node);
        }
        graph
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Monotonic commit counter; bumped on every applied commit. Sessions
    /// use it to invalidate value caches.
    pub fn generation(&self) -> u64 {
        self.commit_generation
    }

    pub fn schema(&self, id: ConceptId) -> Option<&SchemaNode> {
        self.schema.get(&id)
    }

    pub fn label_id(&self, label: &str) -> Option<ConceptId> {
        self.labels.get(label).copied()
    }

    pub fn thing(&self, id: ConceptId) -> Option<&ThingNode> {
        self.things.get(&id)
    }

    pub fn schema_nodes(&self) -> impl Iterator<Item = &SchemaNode> {
        self.schema.values()
    }

    pub fn things(&self) -> impl Iterator<Item = &ThingNode> {
        self.things.values()
    }

    pub fn instances_by_type(&self, type_id: ConceptId) -> Option<&BTreeSet<ConceptId>> {
        self.instances_by_type.get(&type_id)
    }

    pub fn attributes_by_value(&self, key: &ValueKey) -> Option<&BTreeSet<ConceptId>> {
        self.attributes_by_value.get(key)
    }

    pub fn owners_of(&self, attribute: ConceptId) -> Option<&BTreeSet<ConceptId>> {
        self.owners_of.get(&attribute)
    }

    pub fn castings_by_player(&self, player: ConceptId) -> &[(ConceptId, ConceptId)] {
        self.castings_by_player
            .get(&player)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    /// Applies a validated staged delta. `persist` holds every staged thing
    /// id cleared for persistence; staged things outside it (inference-only
    /// derivations nothing user-inserted depends on) are dropped, as are all
    /// inferred ownership edges.
    pub fn apply(&mut self, staged: Staged, persist: &FxHashSet<ConceptId>) {
        let Staged {
            schema,
            labels,
            things,
            deleted,
            ..
        } = staged;

        for (id, node) in schema {
            self.labels.insert(node.label.clone(), id);
            self.schema.insert(id, node);
        }
        self.labels.extend(labels);

        for id in &deleted {
            if let Some(thing) = self.things.remove(id) {
                if let Some(type_node) = self.schema.get_mut(&thing.type_) {
                    for shard in &mut type_node.shards {
                        shard.members.retain(|m| m != id);
                    }
                }
            }
        }

        let mut skipped: FxHashSet<ConceptId> = FxHashSet::default();
        for (id, thing) in &things {
            if thing.inferred && !persist.contains(id) {
                skipped.insert(*id);
            }
        }
        for (id, mut thing) in things {
            if skipped.contains(&id) {
                continue;
            }
            thing.inferred = false;
            thing
                .owned
                .retain(|attr, kind| *kind == OwnershipKind::Asserted && !skipped.contains(attr));
            self.things.insert(id, thing);
        }

        // Unpersisted inferred instances must leave no trace in shards or
        // dangling references.
        if !skipped.is_empty() {
            for node in self.schema.values_mut() {
                for shard in &mut node.shards {
                    shard.members.retain(|m| !skipped.contains(m));
                }
            }
        }

        self.rebuild_indexes();
        self.commit_generation += 1;
        debug!(
            keyspace = %self.name,
            generation = self.commit_generation,
            "applied commit"
        );
    }

    fn rebuild_indexes(&mut self) {
        self.instances_by_type.clear();
        self.attributes_by_value.clear();
        self.owners_of.clear();
        self.castings_by_player.clear();
        for thing in self.things.values() {
            self.instances_by_type
                .entry(thing.type_)
                .or_default()
                .insert(thing.id);
            if let Some(value) = thing.value() {
                self.attributes_by_value
                    .entry(value.key())
                    .or_default()
                    .insert(thing.id);
            }
            for attr in thing.owned.keys() {
                self.owners_of.entry(*attr).or_default().insert(thing.id);
            }
            for casting in thing.castings() {
                self.castings_by_player
                    .entry(casting.player)
                    .or_default()
                    .push((thing.id, casting.role));
            }
        }
    }
}
