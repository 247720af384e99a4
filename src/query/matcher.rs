//! Conjunctive pattern matching over a [`GraphView`]. Backtracking over
//! statements with per-candidate constraint checks; negations filter the
//! answer set, disjunctions union per-branch answers. Scale-sensitive
//! matching is the query planner's job upstream; the engine only needs
//! correctness here.

use std::collections::BTreeMap;
use std::collections::BTreeSet;

use crate::concept::{ConceptId, ThingNode};
use crate::error::Result;
use crate::graph::GraphView;
use crate::query::{Constraint, HasValue, Pattern, Statement, Var};

/// Partial or complete variable assignment.
#[derive(Clone, Debug, Default, PartialEq, Eq, PartialOrd, Ord)]
pub struct Bindings {
    map: BTreeMap<Var, ConceptId>,
}

impl Bindings {
    pub fn get(&self, var: &str) -> Option<ConceptId> {
        self.map.get(var).copied()
    }

    pub fn bind(&mut self, var: impl Into<Var>, id: ConceptId) {
        self.map.insert(var.into(), id);
    }

    pub fn into_map(self) -> BTreeMap<Var, ConceptId> {
        self.map
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, ConceptId)> {
        self.map.iter().map(|(v, id)| (v.as_str(), *id))
    }
}

/// Matches a pattern with no pre-bound variables.
pub fn match_pattern(view: &GraphView<'_>, pattern: &Pattern) -> Result<Vec<Bindings>> {
    match_pattern_seeded(view, pattern, &Bindings::default())
}

/// Matches a pattern with `seed` variables already bound (negation bodies,
/// match-insert, rule application).
pub fn match_pattern_seeded(
    view: &GraphView<'_>,
    pattern: &Pattern,
    seed: &Bindings,
) -> Result<Vec<Bindings>> {
    let mut statements = Vec::new();
    let mut negations = Vec::new();
    let mut disjunctions = Vec::new();
    flatten(pattern, &mut statements, &mut negations, &mut disjunctions);

    // Binding-capable statements first; pure filters once their vars exist.
    statements.sort_by_key(|s| if is_filter_only(s) { 1 } else { 0 });

    let mut answers = vec![seed.clone()];
    for statement in &statements {
        let mut next = Vec::new();
        for binding in &answers {
            next.extend(extend_with_statement(view, statement, binding)?);
        }
        answers = next;
        if answers.is_empty() {
            return Ok(Vec::new());
        }
    }

    for branches in &disjunctions {
        let mut next = BTreeSet::new();
        for binding in &answers {
            for branch in branches.iter() {
                next.extend(match_pattern_seeded(view, branch, binding)?);
            }
        }
        answers = next.into_iter().collect();
        if answers.is_empty() {
            return Ok(Vec::new());
        }
    }

    for negated in &negations {
        let mut kept = Vec::new();
        for binding in answers {
            if match_pattern_seeded(view, negated, &binding)?.is_empty() {
                kept.push(binding);
            }
        }
        answers = kept;
    }

    let dedup: BTreeSet<Bindings> = answers.into_iter().collect();
    Ok(dedup.into_iter().collect())
}

fn flatten<'p>(
    pattern: &'p Pattern,
    statements: &mut Vec<&'p Statement>,
    negations: &mut Vec<&'p Pattern>,
    disjunctions: &mut Vec<&'p Vec<Pattern>>,
) {
    match pattern {
        Pattern::Statement(s) => statements.push(s),
        Pattern::Conjunction(inner) => {
            for p in inner {
                flatten(p, statements, negations, disjunctions);
            }
        }
        Pattern::Negation(inner) => negations.push(inner),
        Pattern::Disjunction(branches) => disjunctions.push(branches),
    }
}

fn is_filter_only(statement: &Statement) -> bool {
    statement
        .constraints
        .iter()
        .all(|c| matches!(c, Constraint::Cmp { .. } | Constraint::NeqVar(_)))
}

fn extend_with_statement(
    view: &GraphView<'_>,
    statement: &Statement,
    binding: &Bindings,
) -> Result<Vec<Bindings>> {
    let mut out = Vec::new();
    for candidate in candidates(view, statement, binding) {
        let Some(thing) = view.thing(candidate) else {
            continue;
        };
        let mut partial = {
            let mut b = binding.clone();
            b.bind(statement.var.clone(), candidate);
            vec![b]
        };
        for constraint in &statement.constraints {
            let mut next = Vec::new();
            for b in partial {
                next.extend(check_constraint(view, thing, constraint, b)?);
            }
            partial = next;
            if partial.is_empty() {
                break;
            }
        }
        out.extend(partial);
    }
    Ok(out)
}

/// Candidate concepts for a statement's subject variable.
fn candidates(view: &GraphView<'_>, statement: &Statement, binding: &Bindings) -> Vec<ConceptId> {
    if let Some(id) = binding.get(&statement.var) {
        return vec![id];
    }
    for constraint in &statement.constraints {
        match constraint {
            Constraint::Id(id) => {
                return if view.thing(*id).is_some() {
                    vec![*id]
                } else {
                    Vec::new()
                }
            }
            Constraint::Isa(label) => {
                return match view.schema_by_label(label) {
                    Some(node) => view.instances_of(node.id, true),
                    None => Vec::new(),
                }
            }
            Constraint::Value(value) => return view.attributes_by_value(&value.key()),
            _ => {}
        }
    }
    // A relation tuple without `isa` ranges over every relation; `has`
    // ranges over candidate owners; bare filters range over attributes.
    for constraint in &statement.constraints {
        match constraint {
            Constraint::Rel(_) => {
                return view
                    .things()
                    .filter(|t| t.is_relation())
                    .map(|t| t.id)
                    .collect()
            }
            Constraint::Has {
                attribute_type,
                value,
            } => return owners_by_attribute(view, attribute_type, value, binding),
            _ => {}
        }
    }
    view.things()
        .filter(|t| t.value().is_some())
        .map(|t| t.id)
        .collect()
}

fn owners_by_attribute(
    view: &GraphView<'_>,
    attribute_type: &str,
    value: &HasValue,
    binding: &Bindings,
) -> Vec<ConceptId> {
    let Some(type_node) = view.schema_by_label(attribute_type) else {
        return Vec::new();
    };
    let attr_types = view.subs(type_node.id);
    let mut owners = BTreeSet::new();
    let attrs: Vec<ConceptId> = match value {
        HasValue::Var(v) => match binding.get(v) {
            Some(id) => vec![id],
            None => {
                let mut ids = Vec::new();
                for t in &attr_types {
                    ids.extend(view.instances_of(*t, false));
                }
                ids
            }
        },
        HasValue::Literal(value) => view
            .attributes_by_value(&value.key())
            .into_iter()
            .filter(|id| {
                view.thing(*id)
                    .map(|t| attr_types.contains(&t.type_))
                    .unwrap_or(false)
            })
            .collect(),
    };
    for attr in attrs {
        owners.extend(view.owners_of(attr));
    }
    owners.into_iter().collect()
}

fn check_constraint(
    view: &GraphView<'_>,
    thing: &ThingNode,
    constraint: &Constraint,
    binding: Bindings,
) -> Result<Vec<Bindings>> {
    match constraint {
        Constraint::Id(id) => Ok(if thing.id == *id {
            vec![binding]
        } else {
            Vec::new()
        }),
        Constraint::Isa(label) => {
            let matches = view
                .schema_by_label(label)
                .map(|node| view.sups(thing.type_).contains(&node.id))
                .unwrap_or(false);
            Ok(if matches { vec![binding] } else { Vec::new() })
        }
        Constraint::Value(value) => {
            let matches = thing
                .value()
                .map(|v| v.key() == value.key())
                .unwrap_or(false);
            Ok(if matches { vec![binding] } else { Vec::new() })
        }
        Constraint::Cmp { op, value } => {
            let matches = thing
                .value()
                .and_then(|v| v.partial_cmp_value(value))
                .map(|ordering| op.eval(ordering))
                .unwrap_or(false);
            Ok(if matches { vec![binding] } else { Vec::new() })
        }
        Constraint::NeqVar(other) => {
            let matches = binding.get(other).map(|id| id != thing.id).unwrap_or(false);
            Ok(if matches { vec![binding] } else { Vec::new() })
        }
        Constraint::Has {
            attribute_type,
            value,
        } => {
            let Some(type_node) = view.schema_by_label(attribute_type) else {
                return Ok(Vec::new());
            };
            let attr_types = view.subs(type_node.id);
            let mut out = Vec::new();
            for (attr_id, _) in &thing.owned {
                let Some(attr) = view.thing(*attr_id) else {
                    continue;
                };
                if !attr_types.contains(&attr.type_) {
                    continue;
                }
                match value {
                    HasValue::Literal(v) => {
                        if attr.value().map(|av| av.key() == v.key()).unwrap_or(false) {
                            out.push(binding.clone());
                        }
                    }
                    HasValue::Var(var) => match binding.get(var) {
                        Some(bound) => {
                            if bound == *attr_id {
                                out.push(binding.clone());
                            }
                        }
                        None => {
                            let mut b = binding.clone();
                            b.bind(var.clone(), *attr_id);
                            out.push(b);
                        }
                    },
                }
            }
            Ok(out)
        }
        Constraint::Rel(players) => {
            let castings = thing.castings();
            if castings.is_empty() {
                return Ok(Vec::new());
            }
            let mut out = Vec::new();
            assign_players(view, players, 0, castings, &mut vec![false; castings.len()], binding, &mut out);
            Ok(out)
        }
    }
}

/// Injectively assigns tuple entries to castings, honoring role labels
/// (a named role matches castings of that role or any of its subtypes).
fn assign_players(
    view: &GraphView<'_>,
    players: &[crate::query::RolePlayer],
    index: usize,
    castings: &[crate::concept::Casting],
    used: &mut Vec<bool>,
    binding: Bindings,
    out: &mut Vec<Bindings>,
) {
    if index == players.len() {
        out.push(binding);
        return;
    }
    let entry = &players[index];
    let role_id = entry
        .role
        .as_ref()
        .and_then(|label| view.schema_by_label(label).map(|n| n.id));
    if entry.role.is_some() && role_id.is_none() {
        return;
    }
    for (i, casting) in castings.iter().enumerate() {
        if used[i] {
            continue;
        }
        if let Some(role_id) = role_id {
            if !view.sups(casting.role).contains(&role_id) {
                continue;
            }
        }
        match binding.get(&entry.player) {
            Some(bound) if bound != casting.player => continue,
            _ => {}
        }
        let mut next = binding.clone();
        next.bind(entry.player.clone(), casting.player);
        used[i] = true;
        assign_players(view, players, index + 1, castings, used, next, out);
        used[i] = false;
    }
}
