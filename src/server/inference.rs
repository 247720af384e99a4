//! Forward application of registered rules to a fixpoint.
//!
//! Derived concepts are staged with inferred provenance: visible to this
//! transaction's queries, dropped at commit unless the persistence closure
//! pulls them in. Heads are grounded (literal values or variables bound by
//! the body), so the existence checks below make the fixpoint finite.

use smallvec::SmallVec;
use tracing::debug;

use crate::concept::{Casting, ConceptId, OwnershipKind, SchemaKind, ThingVariant};
use crate::error::{CairnError, Result};
use crate::graph::GraphView;
use crate::query::{Bindings, Constraint, HasValue, Pattern};
use crate::server::transaction::Transaction;

impl Transaction {
    /// Applies every registered rule until no new fact is derived.
    pub(crate) fn run_inference(&self) -> Result<()> {
        let rules: Vec<(String, Pattern, Pattern)> = {
            let graph = self.inner.keyspace.graph().read();
            let staged = self.inner.staged.lock();
            let view = GraphView::new(&graph, &staged);
            view.rules()
                .into_iter()
                .filter_map(|id| {
                    view.schema(id).and_then(|n| {
                        n.rule
                            .as_ref()
                            .map(|r| (n.label.clone(), r.when.clone(), r.then.clone()))
                    })
                })
                .collect()
        };
        if rules.is_empty() {
            return Ok(());
        }
        loop {
            let mut derived = 0usize;
            for (label, when, then) in &rules {
                let answers = self.match_with(when, &Bindings::default())?;
                for binding in answers {
                    if self.apply_rule_head(then, &binding)? {
                        derived += 1;
                    }
                }
                if derived > 0 {
                    debug!(
                        keyspace = self.keyspace(),
                        rule = label,
                        derived,
                        "rule derived new facts"
                    );
                }
            }
            if derived == 0 {
                return Ok(());
            }
        }
    }

    /// Instantiates a rule head under one body binding. Returns whether
    /// anything new was staged.
    fn apply_rule_head(&self, then: &Pattern, binding: &Bindings) -> Result<bool> {
        let mut created = false;
        for (statement, _) in then.statements() {
            for constraint in &statement.constraints {
                match constraint {
                    Constraint::Has {
                        attribute_type,
                        value,
                    } => {
                        let owner = binding.get(&statement.var).ok_or_else(|| {
                            CairnError::InvalidArgument(format!(
                                "rule head variable '${}' is not bound by the body",
                                statement.var
                            ))
                        })?;
                        // Inferred ownership is held to the same schema
                        // conformance as a direct insert: the owner's type
                        // chain must declare the attribute type.
                        let attr = match value {
                            HasValue::Literal(v) => {
                                let type_id =
                                    self.get_attribute_type(attribute_type)?.ok_or_else(|| {
                                        CairnError::InvalidArgument(format!(
                                            "undefined attribute type '{attribute_type}'"
                                        ))
                                    })?;
                                self.check_ownership_declared(owner, type_id, attribute_type)?;
                                self.create_attribute_inner(type_id, v.clone(), true)?
                            }
                            HasValue::Var(var) => {
                                let attr = binding.get(var).ok_or_else(|| {
                                    CairnError::InvalidArgument(format!(
                                        "rule head variable '${var}' is not bound by the body"
                                    ))
                                })?;
                                let attr_type = self.thing_type(attr)?.ok_or_else(|| {
                                    CairnError::InvalidArgument(format!(
                                        "rule head variable '${var}' is not an attribute instance"
                                    ))
                                })?;
                                self.check_ownership_declared(owner, attr_type, attribute_type)?;
                                attr
                            }
                        };
                        if !self.has_ownership(owner, attr)? {
                            self.put_ownership_inner(owner, attr, OwnershipKind::Inferred)?;
                            created = true;
                        }
                    }
                    Constraint::Rel(players) => {
                        let type_label = statement.isa().ok_or_else(|| {
                            CairnError::InvalidArgument(
                                "rule head relation needs an 'isa' type".into(),
                            )
                        })?;
                        let type_id = self.get_relation_type(type_label)?.ok_or_else(|| {
                            CairnError::InvalidArgument(format!(
                                "undefined relation type '{type_label}'"
                            ))
                        })?;
                        let mut castings: Vec<Casting> = Vec::with_capacity(players.len());
                        for rp in players {
                            let role_label = rp.role.as_ref().ok_or_else(|| {
                                CairnError::InvalidArgument(
                                    "rule head relation tuples need explicit roles".into(),
                                )
                            })?;
                            let role = self.get_role(role_label)?.ok_or_else(|| {
                                CairnError::InvalidArgument(format!(
                                    "undefined role '{role_label}'"
                                ))
                            })?;
                            let player = binding.get(&rp.player).ok_or_else(|| {
                                CairnError::InvalidArgument(format!(
                                    "rule head variable '${}' is not bound by the body",
                                    rp.player
                                ))
                            })?;
                            castings.push(Casting { role, player });
                        }
                        if !self.relation_exists(type_id, &castings)? {
                            let relation = self.create_thing(
                                type_id,
                                SchemaKind::Relation,
                                ThingVariant::Relation(SmallVec::new()),
                                true,
                            )?;
                            for casting in &castings {
                                self.add_casting_inner(
                                    relation,
                                    casting.role,
                                    casting.player,
                                    true,
                                )?;
                            }
                            created = true;
                        }
                    }
                    _ => {}
                }
            }
        }
        Ok(created)
    }

    fn has_ownership(&self, owner: ConceptId, attribute: ConceptId) -> Result<bool> {
        let graph = self.inner.keyspace.graph().read();
        let staged = self.inner.staged.lock();
        let view = GraphView::new(&graph, &staged);
        Ok(view
            .thing(owner)
            .map(|t| t.owned.contains_key(&attribute))
            .unwrap_or(false))
    }

    /// Whether a relation of this type with exactly these castings exists.
    fn relation_exists(&self, type_id: ConceptId, castings: &[Casting]) -> Result<bool> {
        let graph = self.inner.keyspace.graph().read();
        let staged = self.inner.staged.lock();
        let view = GraphView::new(&graph, &staged);
        let mut wanted: Vec<Casting> = castings.to_vec();
        wanted.sort_by_key(|c| (c.role, c.player));
        for id in view.instances_of(type_id, false) {
            if let Some(thing) = view.thing(id) {
                let mut existing: Vec<Casting> = thing.castings().to_vec();
                existing.sort_by_key(|c| (c.role, c.player));
                if existing == wanted {
                    return Ok(true);
                }
            }
        }
        Ok(false)
    }
}
