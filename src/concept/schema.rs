use std::collections::{BTreeMap, BTreeSet};

use crate::concept::{ConceptId, DataType, Shard};
use crate::query::Pattern;

/// Variant of a schema concept. Meta concepts carry the kind they root:
/// the `entity` meta node has kind `Entity`, and so on; the root `thing`
/// node is the only `Thing`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SchemaKind {
    Thing,
    Entity,
    Relation,
    Attribute,
    Role,
    Rule,
}

impl SchemaKind {
    pub fn name(self) -> &'static str {
        match self {
            SchemaKind::Thing => "thing",
            SchemaKind::Entity => "entity",
            SchemaKind::Relation => "relation",
            SchemaKind::Attribute => "attribute",
            SchemaKind::Role => "role",
            SchemaKind::Rule => "rule",
        }
    }

    /// True for kinds whose instances are things (entity, relation,
    /// attribute). Roles and rules have no instances.
    pub fn is_thing_type(self) -> bool {
        matches!(
            self,
            SchemaKind::Entity | SchemaKind::Relation | SchemaKind::Attribute
        )
    }
}

/// Body of an inference rule. The hypothesis and conclusion sets are empty
/// until commit validation populates them; they then feed the rule
/// dependency graph used for the stratifiability check.
#[derive(Clone, Debug)]
pub struct RuleBody {
    pub when: Pattern,
    pub then: Pattern,
    pub positive_hypothesis: BTreeSet<ConceptId>,
    pub negative_hypothesis: BTreeSet<ConceptId>,
    pub conclusion: BTreeSet<ConceptId>,
}

impl RuleBody {
    pub fn new(when: Pattern, then: Pattern) -> Self {
        Self {
            when,
            then,
            positive_hypothesis: BTreeSet::new(),
            negative_hypothesis: BTreeSet::new(),
            conclusion: BTreeSet::new(),
        }
    }
}

/// One node of the schema graph. Edges (`sup`, `plays`, `relates`, `owns`,
/// `keys`) are ids into the same arena.
#[derive(Clone, Debug)]
pub struct SchemaNode {
    pub id: ConceptId,
    pub label: String,
    pub kind: SchemaKind,
    /// Direct supertype. `None` only for the root `thing` meta concept.
    pub sup: Option<ConceptId>,
    pub is_abstract: bool,
    /// Declared datatype; attribute types only.
    pub datatype: Option<DataType>,
    /// Role id -> whether playing it is required of every instance.
    pub plays: BTreeMap<ConceptId, bool>,
    /// Roles this relation type directly relates.
    pub relates: BTreeSet<ConceptId>,
    /// Attribute types instances of this type may own.
    pub owns: BTreeSet<ConceptId>,
    /// Attribute types instances of this type must own uniquely.
    pub keys: BTreeSet<ConceptId>,
    /// Rule body; rule concepts only.
    pub rule: Option<RuleBody>,
    /// Append-only shard list; the last entry is the current shard.
    pub shards: Vec<Shard>,
}

impl SchemaNode {
    pub fn new(id: ConceptId, label: impl Into<String>, kind: SchemaKind, sup: Option<ConceptId>) -> Self {
        Self {
            id,
            label: label.into(),
            kind,
            sup,
            is_abstract: false,
            datatype: None,
            plays: BTreeMap::new(),
            relates: BTreeSet::new(),
            owns: BTreeSet::new(),
            keys: BTreeSet::new(),
            rule: None,
            shards: Vec::new(),
        }
    }

    /// The shard new instances currently attach to. Thing types always carry
    /// at least one shard from creation.
    pub fn current_shard(&self) -> Option<&Shard> {
        self.shards.last()
    }

    pub fn current_shard_mut(&mut self) -> Option<&mut Shard> {
        self.shards.last_mut()
    }
}
