use std::sync::{Arc, Weak};
use std::thread::{self, ThreadId};

use parking_lot::Mutex;
use rustc_hash::FxHashSet;
use tracing::{debug, info, warn};

use crate::concept::{
    meta, ConceptId, DataType, OwnershipKind, SchemaKind, SchemaNode, Shard, ShardId, ThingNode,
    ThingVariant, Value,
};
use crate::error::{CairnError, Result};
use crate::graph::{GraphView, KeyspaceGraph, Provenance, Staged};
use crate::query::Pattern;
use crate::server::keyspace::KeyspaceHandle;
use crate::server::session::SessionInner;
use crate::server::validator;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TxMode {
    Read,
    Write,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum TxState {
    Open,
    Committing,
    Closed,
}

pub(crate) struct TxInner {
    pub(crate) keyspace: Arc<KeyspaceHandle>,
    pub(crate) session: Weak<SessionInner>,
    pub(crate) mode: TxMode,
    pub(crate) owner: ThreadId,
    pub(crate) state: Mutex<TxState>,
    pub(crate) staged: Mutex<Staged>,
}

impl TxInner {
    fn closed_err(&self) -> CairnError {
        CairnError::TransactionClosed {
            keyspace: self.keyspace.name().to_string(),
        }
    }

    /// Rejects use after close and use from any thread other than the
    /// opener; the two are indistinguishable by design.
    pub(crate) fn guard(&self) -> Result<()> {
        if thread::current().id() != self.owner {
            return Err(self.closed_err());
        }
        if *self.state.lock() != TxState::Open {
            return Err(self.closed_err());
        }
        Ok(())
    }

    pub(crate) fn is_closed(&self) -> bool {
        *self.state.lock() == TxState::Closed
    }

    /// Closes the transaction, discarding staged mutations. Used both by
    /// `Transaction::close` and by `Session::close` draining its
    /// transactions.
    pub(crate) fn force_close(self: &Arc<Self>) {
        {
            let mut state = self.state.lock();
            if *state == TxState::Closed {
                return;
            }
            *state = TxState::Closed;
        }
        *self.staged.lock() = Staged::default();
        self.unregister();
        debug!(keyspace = self.keyspace.name(), "transaction closed");
    }

    fn unregister(self: &Arc<Self>) {
        if let Some(session) = self.session.upgrade() {
            let mut open = session.open_tx.lock();
            if let Some(current) = open.get(&self.owner) {
                if Arc::ptr_eq(current, self) {
                    open.remove(&self.owner);
                }
            }
        }
    }
}

/// A short-lived read/write view of a keyspace, bound to the thread that
/// opened it. Dropping an open transaction rolls it back.
pub struct Transaction {
    pub(crate) inner: Arc<TxInner>,
}

impl std::fmt::Debug for Transaction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Transaction")
            .field("keyspace", &self.inner.keyspace.name())
            .field("mode", &self.inner.mode)
            .finish()
    }
}

impl Transaction {
    pub(crate) fn new(
        keyspace: Arc<KeyspaceHandle>,
        session: Weak<SessionInner>,
        mode: TxMode,
    ) -> Arc<TxInner> {
        Arc::new(TxInner {
            keyspace,
            session,
            mode,
            owner: thread::current().id(),
            state: Mutex::new(TxState::Open),
            staged: Mutex::new(Staged::default()),
        })
    }

    pub fn keyspace(&self) -> &str {
        self.inner.keyspace.name()
    }

    pub fn mode(&self) -> TxMode {
        self.inner.mode
    }

    pub fn is_closed(&self) -> bool {
        self.inner.is_closed()
    }

    pub fn sharding_threshold(&self) -> u64 {
        self.inner.keyspace.config().sharding_threshold
    }

    /// Fails with `ReadOnly` when the transaction cannot accept mutations.
    pub fn check_mutation_allowed(&self) -> Result<()> {
        self.inner.guard()?;
        if self.inner.mode == TxMode::Read {
            return Err(CairnError::ReadOnly {
                keyspace: self.keyspace().to_string(),
            });
        }
        Ok(())
    }

    // ---- schema lookups -------------------------------------------------

    fn lookup_kind(&self, label: &str, kind: SchemaKind) -> Result<Option<ConceptId>> {
        self.inner.guard()?;
        let graph = self.inner.keyspace.graph().read();
        let staged = self.inner.staged.lock();
        let view = GraphView::new(&graph, &staged);
        Ok(view
            .schema_by_label(label)
            .filter(|n| n.kind == kind && !meta::is_meta(n.id))
            .map(|n| n.id))
    }

    pub fn get_entity_type(&self, label: &str) -> Result<Option<ConceptId>> {
        self.lookup_kind(label, SchemaKind::Entity)
    }

    pub fn get_relation_type(&self, label: &str) -> Result<Option<ConceptId>> {
        self.lookup_kind(label, SchemaKind::Relation)
    }

    pub fn get_attribute_type(&self, label: &str) -> Result<Option<ConceptId>> {
        self.lookup_kind(label, SchemaKind::Attribute)
    }

    pub fn get_role(&self, label: &str) -> Result<Option<ConceptId>> {
        self.lookup_kind(label, SchemaKind::Role)
    }

    pub fn get_rule(&self, label: &str) -> Result<Option<ConceptId>> {
        self.lookup_kind(label, SchemaKind::Rule)
    }

    /// Any schema concept by label, meta concepts included.
    pub fn get_schema_concept(&self, label: &str) -> Result<Option<ConceptId>> {
        self.inner.guard()?;
        let graph = self.inner.keyspace.graph().read();
        let staged = self.inner.staged.lock();
        let view = GraphView::new(&graph, &staged);
        Ok(view.schema_by_label(label).map(|n| n.id))
    }

    pub fn concept_label(&self, id: ConceptId) -> Result<Option<String>> {
        self.inner.guard()?;
        let graph = self.inner.keyspace.graph().read();
        let staged = self.inner.staged.lock();
        let view = GraphView::new(&graph, &staged);
        Ok(view.schema(id).map(|n| n.label.clone()))
    }

    /// Supertype chain of a schema concept, itself included, ending at the
    /// `thing` meta concept.
    pub fn sups(&self, id: ConceptId) -> Result<Vec<ConceptId>> {
        self.inner.guard()?;
        let graph = self.inner.keyspace.graph().read();
        let staged = self.inner.staged.lock();
        let view = GraphView::new(&graph, &staged);
        Ok(view.sups(id))
    }

    /// A schema concept plus all of its transitive subtypes.
    pub fn subs(&self, id: ConceptId) -> Result<Vec<ConceptId>> {
        self.inner.guard()?;
        let graph = self.inner.keyspace.graph().read();
        let staged = self.inner.staged.lock();
        let view = GraphView::new(&graph, &staged);
        Ok(view.subs(id))
    }

    /// The direct type of an instance.
    pub fn thing_type(&self, id: ConceptId) -> Result<Option<ConceptId>> {
        self.inner.guard()?;
        let graph = self.inner.keyspace.graph().read();
        let staged = self.inner.staged.lock();
        let view = GraphView::new(&graph, &staged);
        Ok(view.thing(id).map(|t| t.type_))
    }

    pub fn attribute_value(&self, id: ConceptId) -> Result<Option<Value>> {
        self.inner.guard()?;
        let graph = self.inner.keyspace.graph().read();
        let staged = self.inner.staged.lock();
        let view = GraphView::new(&graph, &staged);
        Ok(view.thing(id).and_then(|t| t.value().cloned()))
    }

    // ---- schema mutation ------------------------------------------------

    pub fn put_entity_type(&self, label: &str) -> Result<ConceptId> {
        self.put_schema(label, SchemaKind::Entity, meta::ENTITY, None, None)
    }

    pub fn put_relation_type(&self, label: &str) -> Result<ConceptId> {
        self.put_schema(label, SchemaKind::Relation, meta::RELATION, None, None)
    }

    pub fn put_attribute_type(&self, label: &str, datatype: DataType) -> Result<ConceptId> {
        self.put_schema(
            label,
            SchemaKind::Attribute,
            meta::ATTRIBUTE,
            Some(datatype),
            None,
        )
    }

    pub fn put_role(&self, label: &str) -> Result<ConceptId> {
        self.put_schema(label, SchemaKind::Role, meta::ROLE, None, None)
    }

    pub fn put_rule(&self, label: &str, when: Pattern, then: Pattern) -> Result<ConceptId> {
        self.put_schema(
            label,
            SchemaKind::Rule,
            meta::RULE,
            None,
            Some(crate::concept::RuleBody::new(when, then)),
        )
    }

    fn put_schema(
        &self,
        label: &str,
        kind: SchemaKind,
        sup: ConceptId,
        datatype: Option<DataType>,
        rule: Option<crate::concept::RuleBody>,
    ) -> Result<ConceptId> {
        self.inner.guard()?;
        let graph = self.inner.keyspace.graph().read();
        let mut staged = self.inner.staged.lock();
        {
            let view = GraphView::new(&graph, &staged);
            if let Some(node) = view.schema_by_label(label) {
                if meta::is_meta(node.id) || node.kind != kind {
                    return Err(CairnError::InvalidArgument(format!(
                        "label '{label}' is already used by a {}",
                        node.kind.name()
                    )));
                }
                return Ok(node.id);
            }
        }
        let id = self.inner.keyspace.next_id()?;
        let mut node = SchemaNode::new(id, label, kind, Some(sup));
        node.datatype = datatype;
        node.rule = rule;
        if kind.is_thing_type() {
            let shard_id = self.inner.keyspace.next_id()?;
            node.shards.push(Shard::new(shard_id));
        }
        staged.labels.insert(label.to_string(), id);
        staged.schema.insert(id, node);
        staged.mutated = true;
        debug!(keyspace = self.keyspace(), label, kind = kind.name(), id, "put schema concept");
        Ok(id)
    }

    /// Re-parents `child` under `sup`. Both must share a kind; cycles are
    /// rejected.
    pub fn sup(&self, child: ConceptId, sup: ConceptId) -> Result<()> {
        self.inner.guard()?;
        let graph = self.inner.keyspace.graph().read();
        let mut staged = self.inner.staged.lock();
        {
            let view = GraphView::new(&graph, &staged);
            let child_node = view
                .schema(child)
                .ok_or_else(|| CairnError::InvalidArgument("unknown subtype concept".into()))?;
            let sup_node = view
                .schema(sup)
                .ok_or_else(|| CairnError::InvalidArgument("unknown supertype concept".into()))?;
            if child_node.kind != sup_node.kind {
                return Err(CairnError::InvalidArgument(format!(
                    "cannot make '{}' a subtype of '{}': kinds differ",
                    child_node.label, sup_node.label
                )));
            }
            if view.sups(sup).contains(&child) {
                return Err(CairnError::InvalidArgument(format!(
                    "cannot make '{}' a subtype of '{}': cycle",
                    child_node.label, sup_node.label
                )));
            }
        }
        let node = staged
            .schema_mut(&graph, child)
            .ok_or_else(|| CairnError::InvalidArgument("unknown subtype concept".into()))?;
        node.sup = Some(sup);
        staged.mutated = true;
        Ok(())
    }

    pub fn plays(&self, type_id: ConceptId, role: ConceptId, required: bool) -> Result<()> {
        self.schema_edge(type_id, role, SchemaKind::Role, move |node, role| {
            node.plays.insert(role, required);
        })
    }

    pub fn relates(&self, relation_type: ConceptId, role: ConceptId) -> Result<()> {
        self.inner.guard()?;
        let graph = self.inner.keyspace.graph().read();
        let staged = self.inner.staged.lock();
        let kind = GraphView::new(&graph, &staged)
            .schema(relation_type)
            .map(|n| n.kind);
        drop(staged);
        drop(graph);
        if kind != Some(SchemaKind::Relation) {
            return Err(CairnError::InvalidArgument(
                "relates requires a relation type".into(),
            ));
        }
        self.schema_edge(relation_type, role, SchemaKind::Role, |node, role| {
            node.relates.insert(role);
        })
    }

    pub fn has(&self, type_id: ConceptId, attribute_type: ConceptId) -> Result<()> {
        self.schema_edge(type_id, attribute_type, SchemaKind::Attribute, |node, attr| {
            node.owns.insert(attr);
        })
    }

    /// Declares a key: the attribute type is owned, required, and unique
    /// across the owner type's instances.
    pub fn key(&self, type_id: ConceptId, attribute_type: ConceptId) -> Result<()> {
        self.schema_edge(type_id, attribute_type, SchemaKind::Attribute, |node, attr| {
            node.owns.insert(attr);
            node.keys.insert(attr);
        })
    }

    fn schema_edge(
        &self,
        type_id: ConceptId,
        target: ConceptId,
        target_kind: SchemaKind,
        apply: impl FnOnce(&mut SchemaNode, ConceptId),
    ) -> Result<()> {
        self.inner.guard()?;
        let graph = self.inner.keyspace.graph().read();
        let mut staged = self.inner.staged.lock();
        {
            let view = GraphView::new(&graph, &staged);
            let target_node = view
                .schema(target)
                .ok_or_else(|| CairnError::InvalidArgument("unknown schema concept".into()))?;
            if target_node.kind != target_kind {
                return Err(CairnError::InvalidArgument(format!(
                    "expected a {}, found a {}",
                    target_kind.name(),
                    target_node.kind.name()
                )));
            }
        }
        let node = staged
            .schema_mut(&graph, type_id)
            .ok_or_else(|| CairnError::InvalidArgument("unknown schema concept".into()))?;
        apply(node, target);
        staged.mutated = true;
        Ok(())
    }

    pub fn set_abstract(&self, type_id: ConceptId, is_abstract: bool) -> Result<()> {
        self.inner.guard()?;
        let graph = self.inner.keyspace.graph().read();
        let mut staged = self.inner.staged.lock();
        let node = staged
            .schema_mut(&graph, type_id)
            .ok_or_else(|| CairnError::InvalidArgument("unknown schema concept".into()))?;
        node.is_abstract = is_abstract;
        staged.mutated = true;
        Ok(())
    }

    // ---- sharding -------------------------------------------------------

    /// Opens a fresh current-shard for the type; later instance creations
    /// attach to it.
    pub fn shard(&self, type_id: ConceptId) -> Result<ShardId> {
        self.inner.guard()?;
        let shard_id = self.inner.keyspace.next_id()?;
        let graph = self.inner.keyspace.graph().read();
        let mut staged = self.inner.staged.lock();
        let node = staged
            .schema_mut(&graph, type_id)
            .ok_or_else(|| CairnError::InvalidArgument("unknown schema concept".into()))?;
        if !node.kind.is_thing_type() {
            return Err(CairnError::InvalidArgument(
                "only thing types are sharded".into(),
            ));
        }
        node.shards.push(Shard::new(shard_id));
        staged.mutated = true;
        debug!(keyspace = self.keyspace(), type_id, shard_id, "opened shard");
        Ok(shard_id)
    }

    pub fn shard_count(&self, type_id: ConceptId) -> Result<u64> {
        Ok(self.shards(type_id)?.len() as u64)
    }

    /// The type's shards, oldest first. The last is the current shard.
    pub fn shards(&self, type_id: ConceptId) -> Result<Vec<Shard>> {
        self.inner.guard()?;
        let graph = self.inner.keyspace.graph().read();
        let staged = self.inner.staged.lock();
        let view = GraphView::new(&graph, &staged);
        let node = view
            .schema(type_id)
            .ok_or_else(|| CairnError::InvalidArgument("unknown schema concept".into()))?;
        Ok(node.shards.clone())
    }

    pub fn current_shard(&self, type_id: ConceptId) -> Result<ShardId> {
        self.shards(type_id)?
            .last()
            .map(|s| s.id)
            .ok_or_else(|| CairnError::InvalidArgument("type has no shards".into()))
    }

    // ---- instance mutation ----------------------------------------------

    pub fn create_entity(&self, type_id: ConceptId) -> Result<ConceptId> {
        self.create_thing(type_id, SchemaKind::Entity, ThingVariant::Entity, false)
    }

    pub fn create_relation(&self, type_id: ConceptId) -> Result<ConceptId> {
        self.create_thing(
            type_id,
            SchemaKind::Relation,
            ThingVariant::Relation(Default::default()),
            false,
        )
    }

    /// Create-or-fetch: attribute instances are unique per (type, value).
    pub fn create_attribute(&self, type_id: ConceptId, value: Value) -> Result<ConceptId> {
        self.create_attribute_inner(type_id, value, false)
    }

    pub(crate) fn create_attribute_inner(
        &self,
        type_id: ConceptId,
        value: Value,
        inferred: bool,
    ) -> Result<ConceptId> {
        {
            self.inner.guard()?;
            let graph = self.inner.keyspace.graph().read();
            let staged = self.inner.staged.lock();
            let view = GraphView::new(&graph, &staged);
            let node = view
                .schema(type_id)
                .filter(|n| n.kind == SchemaKind::Attribute)
                .ok_or_else(|| {
                    CairnError::InvalidArgument("unknown attribute type".into())
                })?;
            let declared = view
                .sups(type_id)
                .into_iter()
                .find_map(|s| view.schema(s).and_then(|n| n.datatype));
            match declared {
                Some(dt) if dt == value.datatype() => {}
                Some(dt) => {
                    return Err(CairnError::InvalidArgument(format!(
                        "attribute type '{}' holds {} values, got {}",
                        node.label,
                        dt.name(),
                        value.datatype().name()
                    )))
                }
                None => {
                    return Err(CairnError::InvalidArgument(format!(
                        "attribute type '{}' declares no datatype",
                        node.label
                    )))
                }
            }
            if let Some(existing) = view
                .attributes_by_value(&value.key())
                .into_iter()
                .find(|id| view.thing(*id).map(|t| t.type_ == type_id).unwrap_or(false))
            {
                return Ok(existing);
            }
        }
        self.create_thing(
            type_id,
            SchemaKind::Attribute,
            ThingVariant::Attribute(value),
            inferred,
        )
    }

    pub(crate) fn create_thing(
        &self,
        type_id: ConceptId,
        kind: SchemaKind,
        variant: ThingVariant,
        inferred: bool,
    ) -> Result<ConceptId> {
        self.inner.guard()?;
        let graph = self.inner.keyspace.graph().read();
        let mut staged = self.inner.staged.lock();
        {
            let view = GraphView::new(&graph, &staged);
            let node = view
                .schema(type_id)
                .ok_or_else(|| CairnError::InvalidArgument("unknown schema concept".into()))?;
            if node.kind != kind || meta::is_meta(type_id) {
                return Err(CairnError::InvalidArgument(format!(
                    "cannot create a {} instance of '{}'",
                    kind.name(),
                    node.label
                )));
            }
            if node.is_abstract {
                return Err(CairnError::InvalidArgument(format!(
                    "type '{}' is abstract",
                    node.label
                )));
            }
        }
        let id = self.inner.keyspace.next_id()?;
        let threshold = self.inner.keyspace.config().sharding_threshold;
        let shard_id = {
            let node = staged
                .schema_mut(&graph, type_id)
                .ok_or_else(|| CairnError::InvalidArgument("unknown schema concept".into()))?;
            let rollover = node
                .current_shard()
                .map(|s| s.len() >= threshold)
                .unwrap_or(true);
            if rollover {
                let shard_id = self.inner.keyspace.next_id()?;
                node.shards.push(Shard::new(shard_id));
                debug!(
                    keyspace = self.keyspace(),
                    type_id, shard_id, "sharding threshold crossed; opened shard"
                );
            }
            let shard = node
                .current_shard_mut()
                .ok_or_else(|| CairnError::InvalidArgument("type has no shards".into()))?;
            shard.members.push(id);
            shard.id
        };
        let mut thing = ThingNode::new(id, type_id, variant, shard_id);
        thing.inferred = inferred;
        staged.things.insert(id, thing);
        staged.provenance.insert(
            id,
            if inferred {
                Provenance::Inferred
            } else {
                Provenance::Inserted
            },
        );
        if !inferred {
            staged.mutated = true;
        }
        Ok(id)
    }

    pub fn add_casting(&self, relation: ConceptId, role: ConceptId, player: ConceptId) -> Result<()> {
        self.add_casting_inner(relation, role, player, false)
    }

    pub(crate) fn add_casting_inner(
        &self,
        relation: ConceptId,
        role: ConceptId,
        player: ConceptId,
        inferred: bool,
    ) -> Result<()> {
        self.inner.guard()?;
        let graph = self.inner.keyspace.graph().read();
        let mut staged = self.inner.staged.lock();
        {
            let view = GraphView::new(&graph, &staged);
            if view
                .schema(role)
                .map(|n| n.kind != SchemaKind::Role)
                .unwrap_or(true)
            {
                return Err(CairnError::InvalidArgument("unknown role".into()));
            }
            if view.thing(player).is_none() {
                return Err(CairnError::InvalidArgument("unknown role player".into()));
            }
        }
        let node = staged
            .thing_mut(&graph, relation)
            .ok_or_else(|| CairnError::InvalidArgument("unknown relation".into()))?;
        match &mut node.variant {
            ThingVariant::Relation(castings) => {
                let casting = crate::concept::Casting { role, player };
                if !castings.contains(&casting) {
                    castings.push(casting);
                }
            }
            _ => {
                return Err(CairnError::InvalidArgument(
                    "castings can only be added to relations".into(),
                ))
            }
        }
        if !inferred {
            staged.mutated = true;
            staged.user_touched.insert(relation);
            staged.user_touched.insert(player);
        }
        Ok(())
    }

    pub fn put_ownership(&self, owner: ConceptId, attribute: ConceptId) -> Result<()> {
        self.put_ownership_inner(owner, attribute, OwnershipKind::Asserted)
    }

    pub(crate) fn put_ownership_inner(
        &self,
        owner: ConceptId,
        attribute: ConceptId,
        kind: OwnershipKind,
    ) -> Result<()> {
        self.inner.guard()?;
        let graph = self.inner.keyspace.graph().read();
        let mut staged = self.inner.staged.lock();
        {
            let view = GraphView::new(&graph, &staged);
            let attr = view
                .thing(attribute)
                .ok_or_else(|| CairnError::InvalidArgument("unknown attribute instance".into()))?;
            if attr.value().is_none() {
                return Err(CairnError::InvalidArgument(
                    "ownership target is not an attribute".into(),
                ));
            }
        }
        let node = staged
            .thing_mut(&graph, owner)
            .ok_or_else(|| CairnError::InvalidArgument("unknown owner instance".into()))?;
        // An asserted edge upgrades an inferred one, never the reverse.
        match node.owned.get(&attribute) {
            Some(OwnershipKind::Asserted) => {}
            _ => {
                node.owned.insert(attribute, kind);
            }
        }
        if kind == OwnershipKind::Asserted {
            staged.mutated = true;
            staged.user_touched.insert(owner);
            staged.user_touched.insert(attribute);
        }
        Ok(())
    }

    /// Deletes an instance, detaching its castings and ownerships.
    pub fn delete_thing(&self, id: ConceptId) -> Result<()> {
        self.inner.guard()?;
        let graph = self.inner.keyspace.graph().read();
        let mut staged = self.inner.staged.lock();
        let (type_id, referencing_relations, owners) = {
            let view = GraphView::new(&graph, &staged);
            let Some(thing) = view.thing(id) else {
                return Ok(());
            };
            (
                thing.type_,
                view.relations_with(id, None),
                view.owners_of(id),
            )
        };
        for relation in referencing_relations {
            if relation == id {
                continue;
            }
            if let Some(node) = staged.thing_mut(&graph, relation) {
                if let ThingVariant::Relation(castings) = &mut node.variant {
                    castings.retain(|c| c.player != id);
                }
            }
        }
        for owner in owners {
            if let Some(node) = staged.thing_mut(&graph, owner) {
                node.owned.remove(&id);
            }
        }
        if staged.things.remove(&id).is_some() {
            staged.provenance.remove(&id);
            if let Some(node) = staged.schema_mut(&graph, type_id) {
                for shard in &mut node.shards {
                    shard.members.retain(|m| *m != id);
                }
            }
        } else {
            staged.deleted.insert(id);
        }
        staged.mutated = true;
        debug!(keyspace = self.keyspace(), id, "deleted instance");
        Ok(())
    }

    // ---- reads ----------------------------------------------------------

    /// All attribute instances carrying this value, across attribute types.
    /// Goes through the session's value cache; entries are verified against
    /// the committed graph, so stale hits can only under-report other
    /// sessions' recent commits (the documented read-committed compromise).
    pub fn get_attributes_by_value(&self, value: &Value) -> Result<Vec<ConceptId>> {
        self.inner.guard()?;
        let session = self.inner.session.upgrade().ok_or_else(|| self.inner.closed_err())?;
        let graph = self.inner.keyspace.graph().read();
        let staged = self.inner.staged.lock();
        let view = GraphView::new(&graph, &staged);
        let key = value.key();

        let cached = session.attribute_cache.lock().get(&key).cloned();
        let committed: Vec<ConceptId> = match cached {
            Some(ids) => ids
                .into_iter()
                .filter(|id| {
                    graph
                        .thing(*id)
                        .and_then(|t| t.value())
                        .map(|v| v.key() == key)
                        .unwrap_or(false)
                })
                .collect(),
            None => {
                let ids: Vec<ConceptId> = graph
                    .attributes_by_value(&key)
                    .map(|set| set.iter().copied().collect())
                    .unwrap_or_default();
                session.attribute_cache.lock().put(key.clone(), ids.clone());
                ids
            }
        };

        let mut out: std::collections::BTreeSet<ConceptId> = committed
            .into_iter()
            .filter(|id| view.thing(*id).is_some())
            .collect();
        for thing in staged.things.values() {
            if thing.value().map(|v| v.key() == key).unwrap_or(false) {
                out.insert(thing.id);
            }
        }
        Ok(out.into_iter().collect())
    }

    // ---- lifecycle ------------------------------------------------------

    /// Validates and persists staged mutations, then closes the
    /// transaction. A commit on an already-closed transaction is a no-op,
    /// as is committing a transaction with nothing staged.
    pub fn commit(&self) -> Result<()> {
        if thread::current().id() != self.inner.owner {
            return Err(self.inner.closed_err());
        }
        {
            let mut state = self.inner.state.lock();
            match *state {
                TxState::Closed => return Ok(()),
                TxState::Committing => return Ok(()),
                TxState::Open => *state = TxState::Committing,
            }
        }
        let result = self.commit_inner();
        {
            let mut state = self.inner.state.lock();
            *state = TxState::Closed;
        }
        *self.inner.staged.lock() = Staged::default();
        self.inner.unregister();
        result
    }

    fn commit_inner(&self) -> Result<()> {
        let mut staged_guard = self.inner.staged.lock();
        if self.inner.mode == TxMode::Read && staged_guard.mutated {
            warn!(keyspace = self.keyspace(), "rejecting commit of dirty read transaction");
            return Err(CairnError::ReadOnlyCommit {
                keyspace: self.keyspace().to_string(),
            });
        }
        if !staged_guard.mutated {
            // Nothing user-staged; inference residue (if any) is discarded.
            return Ok(());
        }
        let mut staged = std::mem::take(&mut *staged_guard);
        drop(staged_guard);

        let mut graph = self.inner.keyspace.graph().write();
        let persist = persistence_closure(&graph, &staged);
        let errors = validator::validate(&graph, &mut staged, &persist);
        if !errors.is_empty() {
            warn!(
                keyspace = self.keyspace(),
                errors = errors.len(),
                "commit validation failed"
            );
            return Err(CairnError::ValidationFailed(errors));
        }
        let staged_things = staged.things.len();
        let staged_schema = staged.schema.len();
        graph.apply(staged, &persist);
        let generation = graph.generation();
        drop(graph);

        if let Some(session) = self.inner.session.upgrade() {
            session.note_commit();
        }
        info!(
            keyspace = self.keyspace(),
            generation,
            staged_schema,
            staged_things,
            "transaction committed"
        );
        Ok(())
    }

    /// Closes the transaction, discarding staged mutations. Idempotent.
    pub fn close(&self) {
        self.inner.force_close();
    }
}

impl Drop for Transaction {
    fn drop(&mut self) {
        if !self.inner.is_closed() {
            debug!(
                keyspace = self.keyspace(),
                "transaction dropped while open; rolling back"
            );
            self.inner.force_close();
        }
    }
}

/// Computes the set of staged things cleared for persistence: everything
/// user-inserted or user-referenced, closed transitively over casting
/// role-players and asserted ownerships. Inference-only things outside the
/// closure are dropped at apply time.
fn persistence_closure(graph: &KeyspaceGraph, staged: &Staged) -> FxHashSet<ConceptId> {
    let mut marked: FxHashSet<ConceptId> = staged.user_touched.clone();
    for (id, provenance) in &staged.provenance {
        if *provenance == Provenance::Inserted {
            marked.insert(*id);
        }
    }
    let mut worklist: Vec<ConceptId> = marked.iter().copied().collect();
    while let Some(id) = worklist.pop() {
        let thing = staged.things.get(&id).or_else(|| graph.thing(id));
        let Some(thing) = thing else { continue };
        for casting in thing.castings() {
            if marked.insert(casting.player) {
                worklist.push(casting.player);
            }
        }
        for (attr, kind) in &thing.owned {
            if *kind == OwnershipKind::Asserted && marked.insert(*attr) {
                worklist.push(*attr);
            }
        }
    }
    marked
}
