//! Query execution against a transaction: `define`, `insert` (with an
//! optional `match` prefix), `get`, `delete` and `count`.

use std::collections::BTreeSet;

use tracing::debug;

use crate::concept::{ConceptId, SchemaKind};
use crate::error::{CairnError, Result};
use crate::graph::GraphView;
use crate::query::{
    match_pattern_seeded, AggregateMethod, Bindings, ConceptMap, Constraint, Definable, HasValue,
    Pattern, Query, Statement, Var,
};
use crate::server::transaction::Transaction;

/// Result of [`Transaction::execute`]: concept maps for `get`/`insert`,
/// a number for aggregates. `count()` works uniformly on both.
#[derive(Debug)]
pub enum QueryResult {
    Maps(Vec<ConceptMap>),
    Count(u64),
}

impl QueryResult {
    pub fn maps(self) -> Vec<ConceptMap> {
        match self {
            QueryResult::Maps(maps) => maps,
            QueryResult::Count(_) => Vec::new(),
        }
    }

    pub fn count(&self) -> u64 {
        match self {
            QueryResult::Maps(maps) => maps.len() as u64,
            QueryResult::Count(count) => *count,
        }
    }
}

impl Transaction {
    /// Parses and runs a query with inference enabled.
    pub fn execute(&self, query: &str) -> Result<QueryResult> {
        self.execute_with_inference(query, true)
    }

    /// Parses and runs a query. `infer` controls whether registered rules
    /// are applied while matching (`get`, aggregates, and the `match` part
    /// of an insert).
    pub fn execute_with_inference(&self, query: &str, infer: bool) -> Result<QueryResult> {
        self.inner.guard()?;
        let query = crate::query::parse_query(query)?;
        debug!(keyspace = self.keyspace(), infer, "executing query");
        match query {
            Query::Define(definables) => {
                self.exec_define(definables)?;
                Ok(QueryResult::Maps(Vec::new()))
            }
            Query::Insert { prefix, statements } => self
                .exec_insert(prefix, statements, infer)
                .map(QueryResult::Maps),
            Query::Get { pattern, vars } => {
                self.exec_get(&pattern, &vars, infer).map(QueryResult::Maps)
            }
            Query::Delete { pattern, vars } => {
                self.exec_delete(&pattern, &vars, infer)?;
                Ok(QueryResult::Maps(Vec::new()))
            }
            Query::Aggregate {
                pattern,
                vars,
                method: AggregateMethod::Count,
            } => {
                let maps = self.exec_get(&pattern, &vars, infer)?;
                Ok(QueryResult::Count(maps.len() as u64))
            }
        }
    }

    pub(crate) fn match_with(&self, pattern: &Pattern, seed: &Bindings) -> Result<Vec<Bindings>> {
        let graph = self.inner.keyspace.graph().read();
        let staged = self.inner.staged.lock();
        let view = GraphView::new(&graph, &staged);
        match_pattern_seeded(&view, pattern, seed)
    }

    // ---- define ---------------------------------------------------------

    fn exec_define(&self, definables: Vec<Definable>) -> Result<()> {
        for def in definables {
            let type_id = self.define_concept(&def)?;
            for role in &def.plays {
                let role_id = self.ensure_role(role)?;
                self.plays(type_id, role_id, false)?;
            }
            for role in &def.relates {
                let role_id = self.ensure_role(role)?;
                self.relates(type_id, role_id)?;
            }
            for attr in &def.has {
                let attr_id = self.get_attribute_type(attr)?.ok_or_else(|| {
                    CairnError::InvalidArgument(format!("undefined attribute type '{attr}'"))
                })?;
                self.has(type_id, attr_id)?;
            }
            for attr in &def.keys {
                let attr_id = self.get_attribute_type(attr)?.ok_or_else(|| {
                    CairnError::InvalidArgument(format!("undefined attribute type '{attr}'"))
                })?;
                self.key(type_id, attr_id)?;
            }
            if def.is_abstract {
                self.set_abstract(type_id, true)?;
            }
        }
        Ok(())
    }

    fn define_concept(&self, def: &Definable) -> Result<ConceptId> {
        match def.sup.as_str() {
            "entity" => self.put_entity_type(&def.label),
            "relation" => self.put_relation_type(&def.label),
            "attribute" => {
                let datatype = def.datatype.ok_or_else(|| {
                    CairnError::InvalidArgument(format!(
                        "attribute type '{}' needs a datatype",
                        def.label
                    ))
                })?;
                self.put_attribute_type(&def.label, datatype)
            }
            "role" => self.put_role(&def.label),
            "rule" => {
                let (when, then) = match (&def.when, &def.then) {
                    (Some(when), Some(then)) => (when.clone(), then.clone()),
                    _ => {
                        return Err(CairnError::InvalidArgument(format!(
                            "rule '{}' needs both a when and a then",
                            def.label
                        )))
                    }
                };
                self.put_rule(&def.label, when, then)
            }
            user_sup => {
                let sup_id = self.get_schema_concept(user_sup)?.ok_or_else(|| {
                    CairnError::InvalidArgument(format!("undefined supertype '{user_sup}'"))
                })?;
                let sup_kind = self.schema_kind(sup_id)?;
                let child = match sup_kind {
                    SchemaKind::Entity => self.put_entity_type(&def.label)?,
                    SchemaKind::Relation => self.put_relation_type(&def.label)?,
                    SchemaKind::Attribute => {
                        let datatype = match def.datatype {
                            Some(dt) => dt,
                            None => self.inherited_datatype(sup_id)?.ok_or_else(|| {
                                CairnError::InvalidArgument(format!(
                                    "attribute type '{}' needs a datatype",
                                    def.label
                                ))
                            })?,
                        };
                        self.put_attribute_type(&def.label, datatype)?
                    }
                    SchemaKind::Role => self.put_role(&def.label)?,
                    other => {
                        return Err(CairnError::InvalidArgument(format!(
                            "cannot subtype a {}",
                            other.name()
                        )))
                    }
                };
                self.sup(child, sup_id)?;
                Ok(child)
            }
        }
    }

    fn ensure_role(&self, label: &str) -> Result<ConceptId> {
        match self.get_role(label)? {
            Some(id) => Ok(id),
            None => self.put_role(label),
        }
    }

    fn schema_kind(&self, id: ConceptId) -> Result<SchemaKind> {
        let graph = self.inner.keyspace.graph().read();
        let staged = self.inner.staged.lock();
        let view = GraphView::new(&graph, &staged);
        view.schema(id)
            .map(|n| n.kind)
            .ok_or_else(|| CairnError::InvalidArgument("unknown schema concept".into()))
    }

    fn inherited_datatype(&self, id: ConceptId) -> Result<Option<crate::concept::DataType>> {
        let graph = self.inner.keyspace.graph().read();
        let staged = self.inner.staged.lock();
        let view = GraphView::new(&graph, &staged);
        Ok(view
            .sups(id)
            .into_iter()
            .find_map(|s| view.schema(s).and_then(|n| n.datatype)))
    }

    // ---- insert ---------------------------------------------------------

    fn exec_insert(
        &self,
        prefix: Option<Pattern>,
        statements: Vec<Statement>,
        infer: bool,
    ) -> Result<Vec<ConceptMap>> {
        let seeds = match &prefix {
            Some(pattern) => {
                if infer {
                    self.run_inference()?;
                }
                self.match_with(pattern, &Bindings::default())?
            }
            None => vec![Bindings::default()],
        };
        let mut out = Vec::new();
        for seed in seeds {
            let mut binding = seed;
            let mut remaining: Vec<&Statement> = statements.iter().collect();
            // Statements may reference variables bound by later ones (a
            // relation's players, a `has` of a bound attribute); defer
            // until their inputs exist.
            while !remaining.is_empty() {
                let mut deferred = Vec::new();
                let mut progressed = false;
                for statement in remaining {
                    if statement_ready(statement, &binding) {
                        self.insert_statement(statement, &mut binding)?;
                        progressed = true;
                    } else {
                        deferred.push(statement);
                    }
                }
                if !progressed {
                    return Err(CairnError::InvalidArgument(
                        "insert statements reference unbound variables".into(),
                    ));
                }
                remaining = deferred;
            }
            out.push(ConceptMap::new(binding.into_map()));
        }
        Ok(out)
    }

    fn insert_statement(&self, statement: &Statement, binding: &mut Bindings) -> Result<()> {
        let id_constraint = statement.constraints.iter().find_map(|c| match c {
            Constraint::Id(id) => Some(*id),
            _ => None,
        });
        let subject = match (binding.get(&statement.var), id_constraint) {
            (Some(id), _) => id,
            (None, Some(id)) => id,
            (None, None) => self.create_subject(statement)?,
        };
        binding.bind(statement.var.clone(), subject);

        for constraint in &statement.constraints {
            match constraint {
                Constraint::Rel(players) => {
                    for rp in players {
                        let role_label = rp.role.as_ref().ok_or_else(|| {
                            CairnError::InvalidArgument(
                                "insert requires explicit roles in relation tuples".into(),
                            )
                        })?;
                        let role_id = self.get_role(role_label)?.ok_or_else(|| {
                            CairnError::InvalidArgument(format!("undefined role '{role_label}'"))
                        })?;
                        let player = binding.get(&rp.player).ok_or_else(|| {
                            CairnError::InvalidArgument(format!(
                                "unbound role player '${}'",
                                rp.player
                            ))
                        })?;
                        self.add_casting(subject, role_id, player)?;
                    }
                }
                Constraint::Has {
                    attribute_type,
                    value,
                } => {
                    let attr_type = self.get_attribute_type(attribute_type)?.ok_or_else(|| {
                        CairnError::InvalidArgument(format!(
                            "undefined attribute type '{attribute_type}'"
                        ))
                    })?;
                    self.check_ownership_declared(subject, attr_type, attribute_type)?;
                    let attr = match value {
                        HasValue::Literal(v) => self.create_attribute(attr_type, v.clone())?,
                        HasValue::Var(var) => binding.get(var).ok_or_else(|| {
                            CairnError::InvalidArgument(format!("unbound variable '${var}'"))
                        })?,
                    };
                    self.put_ownership(subject, attr)?;
                }
                _ => {}
            }
        }
        Ok(())
    }

    fn create_subject(&self, statement: &Statement) -> Result<ConceptId> {
        let type_label = statement.isa().ok_or_else(|| {
            CairnError::InvalidArgument(format!(
                "insert statement for '${}' needs 'isa' or a bound variable",
                statement.var
            ))
        })?;
        let type_id = self.get_schema_concept(type_label)?.ok_or_else(|| {
            CairnError::InvalidArgument(format!("undefined type '{type_label}'"))
        })?;
        match self.schema_kind(type_id)? {
            SchemaKind::Entity => self.create_entity(type_id),
            SchemaKind::Relation => self.create_relation(type_id),
            SchemaKind::Attribute => {
                let value = statement
                    .constraints
                    .iter()
                    .find_map(|c| match c {
                        Constraint::Value(v) => Some(v.clone()),
                        _ => None,
                    })
                    .ok_or_else(|| {
                        CairnError::InvalidArgument(format!(
                            "inserting attribute '${}' needs a value",
                            statement.var
                        ))
                    })?;
                self.create_attribute(type_id, value)
            }
            other => Err(CairnError::InvalidArgument(format!(
                "cannot insert an instance of a {}",
                other.name()
            ))),
        }
    }

    /// The owner's type chain must declare ownership of the attribute type
    /// (or one of its supertypes). Enforced for direct inserts and for
    /// rule-inferred ownership alike.
    pub(crate) fn check_ownership_declared(
        &self,
        owner: ConceptId,
        attr_type: ConceptId,
        attr_label: &str,
    ) -> Result<()> {
        let graph = self.inner.keyspace.graph().read();
        let staged = self.inner.staged.lock();
        let view = GraphView::new(&graph, &staged);
        let Some(owner_thing) = view.thing(owner) else {
            return Err(CairnError::InvalidArgument("unknown owner instance".into()));
        };
        let attr_sups = view.sups(attr_type);
        let declared = view.sups(owner_thing.type_).into_iter().any(|level| {
            view.schema(level)
                .map(|n| attr_sups.iter().any(|a| n.owns.contains(a)))
                .unwrap_or(false)
        });
        if declared {
            Ok(())
        } else {
            Err(CairnError::InvalidArgument(format!(
                "type '{}' does not declare ownership of '{attr_label}'",
                view.schema(owner_thing.type_)
                    .map(|n| n.label.clone())
                    .unwrap_or_default()
            )))
        }
    }

    // ---- get / delete / aggregate ---------------------------------------

    fn exec_get(&self, pattern: &Pattern, vars: &[Var], infer: bool) -> Result<Vec<ConceptMap>> {
        if infer {
            self.run_inference()?;
        }
        let answers = self.match_with(pattern, &Bindings::default())?;
        let project: Vec<Var> = if vars.is_empty() {
            pattern_vars(pattern)
        } else {
            vars.to_vec()
        };
        let mut maps: BTreeSet<ConceptMap> = BTreeSet::new();
        for answer in answers {
            let mut selected = std::collections::BTreeMap::new();
            for var in &project {
                if let Some(id) = answer.get(var) {
                    selected.insert(var.clone(), id);
                }
            }
            if !selected.is_empty() {
                maps.insert(ConceptMap::new(selected));
            }
        }
        Ok(maps.into_iter().collect())
    }

    fn exec_delete(&self, pattern: &Pattern, vars: &[Var], infer: bool) -> Result<()> {
        if infer {
            self.run_inference()?;
        }
        let answers = self.match_with(pattern, &Bindings::default())?;
        let project: Vec<Var> = if vars.is_empty() {
            pattern_vars(pattern)
        } else {
            vars.to_vec()
        };
        let mut doomed: BTreeSet<ConceptId> = BTreeSet::new();
        for answer in &answers {
            for var in &project {
                if let Some(id) = answer.get(var) {
                    doomed.insert(id);
                }
            }
        }
        for id in doomed {
            self.delete_thing(id)?;
        }
        Ok(())
    }
}

/// Named (non-synthetic) variables appearing anywhere in a pattern.
fn pattern_vars(pattern: &Pattern) -> Vec<Var> {
    let mut vars: BTreeSet<Var> = BTreeSet::new();
    for (statement, _) in pattern.statements() {
        if !statement.var.starts_with("_anon") {
            vars.insert(statement.var.clone());
        }
        for constraint in &statement.constraints {
            match constraint {
                Constraint::Has {
                    value: HasValue::Var(v),
                    ..
                } => {
                    vars.insert(v.clone());
                }
                Constraint::Rel(players) => {
                    for rp in players {
                        vars.insert(rp.player.clone());
                    }
                }
                _ => {}
            }
        }
    }
    vars.into_iter().collect()
}

fn statement_ready(statement: &Statement, binding: &Bindings) -> bool {
    for constraint in &statement.constraints {
        match constraint {
            Constraint::Rel(players) => {
                if players.iter().any(|rp| binding.get(&rp.player).is_none()) {
                    return false;
                }
            }
            Constraint::Has {
                value: HasValue::Var(v),
                ..
            } => {
                if binding.get(v).is_none() {
                    return false;
                }
            }
            _ => {}
        }
    }
    binding.get(&statement.var).is_some()
        || statement.isa().is_some()
        || statement
            .constraints
            .iter()
            .any(|c| matches!(c, Constraint::Id(_)))
}
