use std::collections::BTreeSet;

use rustc_hash::FxHashSet;

use crate::concept::{ConceptId, SchemaKind, SchemaNode, ThingNode, ValueKey};
use crate::graph::{KeyspaceGraph, Staged};

/// Read view merging a transaction's staged delta over the committed graph.
/// All schema walks (sup chains, subtree enumeration, transitive relates)
/// and instance scans used by the matcher and the validator live here.
pub struct GraphView<'a> {
    committed: &'a KeyspaceGraph,
    staged: &'a Staged,
}

impl<'a> GraphView<'a> {
    pub fn new(committed: &'a KeyspaceGraph, staged: &'a Staged) -> Self {
        Self { committed, staged }
    }

    pub fn schema(&self, id: ConceptId) -> Option<&SchemaNode> {
        self.staged
            .schema
            .get(&id)
            .or_else(|| self.committed.schema(id))
    }

    pub fn schema_by_label(&self, label: &str) -> Option<&SchemaNode> {
        if let Some(id) = self.staged.labels.get(label) {
            return self.schema(*id);
        }
        self.committed.label_id(label).and_then(|id| self.schema(id))
    }

    pub fn thing(&self, id: ConceptId) -> Option<&ThingNode> {
        if self.staged.deleted.contains(&id) {
            return None;
        }
        self.staged
            .things
            .get(&id)
            .or_else(|| self.committed.thing(id))
    }

    pub fn schema_nodes(&self) -> impl Iterator<Item = &SchemaNode> {
        self.staged.schema.values().chain(
            self.committed
                .schema_nodes()
                .filter(|n| !self.staged.schema.contains_key(&n.id)),
        )
    }

    pub fn things(&self) -> impl Iterator<Item = &ThingNode> {
        self.staged.things.values().chain(
            self.committed
                .things()
                .filter(|t| !self.staged.things.contains_key(&t.id))
                .filter(|t| !self.staged.deleted.contains(&t.id)),
        )
    }

    /// Supertype chain from `id` to the root, inclusive of `id`.
    pub fn sups(&self, id: ConceptId) -> Vec<ConceptId> {
        let mut chain = Vec::new();
        let mut seen = FxHashSet::default();
        let mut cursor = Some(id);
        while let Some(current) = cursor {
            if !seen.insert(current) {
                break;
            }
            let Some(node) = self.schema(current) else {
                break;
            };
            chain.push(current);
            cursor = node.sup;
        }
        chain
    }

    /// `id` plus every direct and transitive subtype.
    pub fn subs(&self, id: ConceptId) -> Vec<ConceptId> {
        let mut result = vec![id];
        let mut frontier = vec![id];
        while let Some(parent) = frontier.pop() {
            for node in self.schema_nodes() {
                if node.sup == Some(parent) && !result.contains(&node.id) {
                    result.push(node.id);
                    frontier.push(node.id);
                }
            }
        }
        result
    }

    /// Roles a relation type relates, directly or via its supertype chain.
    pub fn relates_transitive(&self, relation_type: ConceptId) -> BTreeSet<ConceptId> {
        let mut roles = BTreeSet::new();
        for sup in self.sups(relation_type) {
            if let Some(node) = self.schema(sup) {
                roles.extend(node.relates.iter().copied());
            }
        }
        roles
    }

    /// Instances whose direct type is `type_id`, or any subtype when
    /// `include_subs` is set. Sorted by id.
    pub fn instances_of(&self, type_id: ConceptId, include_subs: bool) -> Vec<ConceptId> {
        let types: Vec<ConceptId> = if include_subs {
            self.subs(type_id)
        } else {
            vec![type_id]
        };
        let mut out = BTreeSet::new();
        for t in &types {
            if let Some(ids) = self.committed.instances_by_type(*t) {
                out.extend(
                    ids.iter()
                        .copied()
                        .filter(|id| !self.staged.deleted.contains(id)),
                );
            }
        }
        for thing in self.staged.things.values() {
            if types.contains(&thing.type_) {
                out.insert(thing.id);
            }
        }
        out.into_iter().collect()
    }

    /// Attribute instances carrying exactly this value, across all
    /// attribute types. Sorted by id.
    pub fn attributes_by_value(&self, key: &ValueKey) -> Vec<ConceptId> {
        let mut out = BTreeSet::new();
        if let Some(ids) = self.committed.attributes_by_value(key) {
            out.extend(
                ids.iter()
                    .copied()
                    .filter(|id| !self.staged.deleted.contains(id))
                    // A staged override may exist; its value cannot change,
                    // but resolve through the view for consistency.
                    .filter(|id| self.thing(*id).is_some()),
            );
        }
        for thing in self.staged.things.values() {
            if thing.value().map(|v| v.key() == *key).unwrap_or(false) {
                out.insert(thing.id);
            }
        }
        out.into_iter().collect()
    }

    /// Things owning the given attribute instance. Sorted by id.
    pub fn owners_of(&self, attribute: ConceptId) -> Vec<ConceptId> {
        let mut out = BTreeSet::new();
        if let Some(ids) = self.committed.owners_of(attribute) {
            for id in ids {
                if self.staged.deleted.contains(id) || self.staged.things.contains_key(id) {
                    continue;
                }
                out.insert(*id);
            }
        }
        for thing in self.staged.things.values() {
            if thing.owned.contains_key(&attribute) {
                out.insert(thing.id);
            }
        }
        out.into_iter().collect()
    }

    /// Relations containing a casting of `player`, optionally restricted to
    /// one role. Sorted by id.
    pub fn relations_with(&self, player: ConceptId, role: Option<ConceptId>) -> Vec<ConceptId> {
        let mut out = BTreeSet::new();
        for (relation, casting_role) in self.committed.castings_by_player(player) {
            if self.staged.deleted.contains(relation) || self.staged.things.contains_key(relation) {
                continue;
            }
            if role.map(|r| r == *casting_role).unwrap_or(true) {
                out.insert(*relation);
            }
        }
        for thing in self.staged.things.values() {
            for casting in thing.castings() {
                if casting.player == player && role.map(|r| r == casting.role).unwrap_or(true) {
                    out.insert(thing.id);
                }
            }
        }
        out.into_iter().collect()
    }

    /// Every rule concept in view.
    pub fn rules(&self) -> Vec<ConceptId> {
        let mut out: Vec<ConceptId> = self
            .schema_nodes()
            .filter(|n| n.kind == SchemaKind::Rule && n.rule.is_some())
            .map(|n| n.id)
            .collect();
        out.sort_unstable();
        out
    }
}
