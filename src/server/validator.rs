//! Commit-time validation of the global schema and instance invariants.
//!
//! The validator is a pure pass over the merged (staged ∪ committed) view.
//! Checks run in a fixed order and aggregate: a failing commit reports every
//! diagnostic found, not the first. Rule validation additionally populates
//! each staged rule's hypothesis and conclusion sets, which the final
//! stratifiability check consumes.

use std::collections::BTreeSet;

use rustc_hash::{FxHashMap, FxHashSet};

use crate::concept::{ConceptId, OwnershipKind, SchemaKind, ThingNode};
use crate::graph::{GraphView, KeyspaceGraph, Staged};
use crate::query::{Constraint, Pattern};

pub(crate) fn validate(
    committed: &KeyspaceGraph,
    staged: &mut Staged,
    persist: &FxHashSet<ConceptId>,
) -> Vec<String> {
    let (rule_errors, rule_updates) = validate_rules(committed, staged);
    for (id, positive, negative, conclusion) in rule_updates {
        if let Some(rule) = staged.schema.get_mut(&id).and_then(|n| n.rule.as_mut()) {
            rule.positive_hypothesis = positive;
            rule.negative_hypothesis = negative;
            rule.conclusion = conclusion;
        }
    }

    let view = GraphView::new(committed, staged);
    let mut errors = Vec::new();
    check_roles_are_related(&view, &mut errors);
    check_minimum_roles(&view, &mut errors);
    check_relation_type_hierarchy(&view, &mut errors);
    check_castings(&view, persist, &mut errors);
    check_required_roles_and_keys(&view, persist, &mut errors);
    check_key_uniqueness(&view, persist, &mut errors);
    check_relations_nonempty(&view, persist, &mut errors);
    errors.extend(rule_errors);
    check_stratifiability(&view, &mut errors);
    errors
}

fn sorted_schema_ids(view: &GraphView<'_>) -> Vec<ConceptId> {
    let mut ids: Vec<ConceptId> = view.schema_nodes().map(|n| n.id).collect();
    ids.sort_unstable();
    ids
}

fn sorted_thing_ids(view: &GraphView<'_>) -> Vec<ConceptId> {
    let mut ids: Vec<ConceptId> = view.things().map(|t| t.id).collect();
    ids.sort_unstable();
    ids
}

/// Things that will survive the commit: everything already committed plus
/// staged things cleared by the persistence closure.
fn is_persistent(persist: &FxHashSet<ConceptId>, thing: &ThingNode) -> bool {
    !thing.inferred || persist.contains(&thing.id)
}

fn label_of(view: &GraphView<'_>, id: ConceptId) -> String {
    view.schema(id)
        .map(|n| n.label.clone())
        .unwrap_or_else(|| format!("#{id}"))
}

/// (1) Every non-abstract role is related by at least one relation type.
fn check_roles_are_related(view: &GraphView<'_>, errors: &mut Vec<String>) {
    for id in sorted_schema_ids(view) {
        let Some(node) = view.schema(id) else { continue };
        if node.kind != SchemaKind::Role || crate::concept::meta::is_meta(id) || node.is_abstract {
            continue;
        }
        let related = view
            .schema_nodes()
            .any(|n| n.kind == SchemaKind::Relation && n.relates.contains(&id));
        if !related {
            errors.push(format!(
                "role '{}' is not related to any relation type",
                node.label
            ));
        }
    }
}

/// (2) Every non-abstract relation type relates at least one role,
/// directly or by inheritance.
fn check_minimum_roles(view: &GraphView<'_>, errors: &mut Vec<String>) {
    for id in sorted_schema_ids(view) {
        let Some(node) = view.schema(id) else { continue };
        if node.kind != SchemaKind::Relation
            || crate::concept::meta::is_meta(id)
            || node.is_abstract
        {
            continue;
        }
        if view.relates_transitive(id).is_empty() {
            errors.push(format!(
                "relation type '{}' does not relate any role",
                node.label
            ));
        }
    }
}

/// (3) Downward cover between a relation type's roles and its non-abstract
/// super's roles.
fn check_relation_type_hierarchy(view: &GraphView<'_>, errors: &mut Vec<String>) {
    for id in sorted_schema_ids(view) {
        let Some(node) = view.schema(id) else { continue };
        if node.kind != SchemaKind::Relation
            || crate::concept::meta::is_meta(id)
            || node.is_abstract
        {
            continue;
        }
        let Some(sup_id) = node.sup else { continue };
        if crate::concept::meta::is_meta(sup_id) {
            continue;
        }
        let Some(sup_node) = view.schema(sup_id) else {
            continue;
        };
        if sup_node.is_abstract {
            continue;
        }

        let super_roles: BTreeSet<ConceptId> = view
            .sups(sup_id)
            .into_iter()
            .filter_map(|s| view.schema(s))
            .flat_map(|n| n.relates.iter().copied())
            .collect();
        for role in &node.relates {
            let covered = view.sups(*role).iter().any(|r| super_roles.contains(r));
            if !covered {
                errors.push(format!(
                    "role '{}' of relation type '{}' has no super role among the roles of '{}'",
                    label_of(view, *role),
                    node.label,
                    sup_node.label
                ));
            }
        }
        for super_role in &sup_node.relates {
            let covered = view
                .subs(*super_role)
                .iter()
                .any(|r| node.relates.contains(r));
            if !covered {
                errors.push(format!(
                    "role '{}' of relation type '{}' has no sub role among the roles of '{}'",
                    label_of(view, *super_role),
                    sup_node.label,
                    node.label
                ));
            }
        }
    }
}

/// (4) Every casting's player is allowed to play the role, and the role is
/// related by the relation's type.
fn check_castings(view: &GraphView<'_>, persist: &FxHashSet<ConceptId>, errors: &mut Vec<String>) {
    for id in sorted_thing_ids(view) {
        let Some(relation) = view.thing(id) else { continue };
        if !relation.is_relation() || !is_persistent(persist, relation) {
            continue;
        }
        let related = view.relates_transitive(relation.type_);
        for casting in relation.castings() {
            if !related.contains(&casting.role) {
                errors.push(format!(
                    "relation {} of type '{}' has a casting of role '{}' which its type does not relate",
                    relation.id,
                    label_of(view, relation.type_),
                    label_of(view, casting.role)
                ));
            }
            let Some(player) = view.thing(casting.player) else {
                continue;
            };
            let mut satisfies_plays = false;
            for level in view.sups(player.type_) {
                let Some(level_node) = view.schema(level) else {
                    continue;
                };
                if let Some(required) = level_node.plays.get(&casting.role) {
                    satisfies_plays = true;
                    if *required {
                        let owning = persistent_relations_with(
                            view,
                            persist,
                            casting.player,
                            casting.role,
                        );
                        if owning != 1 {
                            errors.push(format!(
                                "instance {} of type '{}' must play role '{}' in exactly one relation but plays it in {}",
                                player.id,
                                label_of(view, player.type_),
                                label_of(view, casting.role),
                                owning
                            ));
                        }
                    }
                }
            }
            if !satisfies_plays {
                errors.push(format!(
                    "instance {} of type '{}' is not allowed to play role '{}'",
                    player.id,
                    label_of(view, player.type_),
                    label_of(view, casting.role)
                ));
            }
        }
    }
}

fn persistent_relations_with(
    view: &GraphView<'_>,
    persist: &FxHashSet<ConceptId>,
    player: ConceptId,
    role: ConceptId,
) -> usize {
    view.relations_with(player, Some(role))
        .into_iter()
        .filter(|id| {
            view.thing(*id)
                .map(|t| is_persistent(persist, t))
                .unwrap_or(false)
        })
        .count()
}

/// (5) Every instance plays each required role of its type chain in
/// exactly one relation, and owns exactly one attribute per declared key.
fn check_required_roles_and_keys(
    view: &GraphView<'_>,
    persist: &FxHashSet<ConceptId>,
    errors: &mut Vec<String>,
) {
    for id in sorted_thing_ids(view) {
        let Some(thing) = view.thing(id) else { continue };
        if !is_persistent(persist, thing) {
            continue;
        }
        for level in view.sups(thing.type_) {
            let Some(level_node) = view.schema(level) else {
                continue;
            };
            for (role, required) in &level_node.plays {
                if !required {
                    continue;
                }
                let owning = persistent_relations_with(view, persist, thing.id, *role);
                if owning != 1 {
                    errors.push(format!(
                        "instance {} of type '{}' must play role '{}' in exactly one relation but plays it in {}",
                        thing.id,
                        label_of(view, thing.type_),
                        label_of(view, *role),
                        owning
                    ));
                }
            }
            for key_type in &level_node.keys {
                let key_subs = view.subs(*key_type);
                let owned = thing
                    .owned
                    .iter()
                    .filter(|(_, kind)| **kind == OwnershipKind::Asserted)
                    .filter_map(|(attr, _)| view.thing(*attr))
                    .filter(|attr| is_persistent(persist, attr))
                    .filter(|attr| key_subs.contains(&attr.type_))
                    .count();
                if owned != 1 {
                    errors.push(format!(
                        "instance {} of type '{}' must have exactly one key attribute of type '{}' but has {}",
                        thing.id,
                        label_of(view, thing.type_),
                        label_of(view, *key_type),
                        owned
                    ));
                }
            }
        }
    }
}

/// (6) No key attribute value is owned by two distinct instances of the
/// key's owner type (or its subtypes). Owners are grouped by value, so two
/// attribute instances carrying the same value cannot smuggle a duplicate
/// key past the check.
fn check_key_uniqueness(
    view: &GraphView<'_>,
    persist: &FxHashSet<ConceptId>,
    errors: &mut Vec<String>,
) {
    for owner_type in sorted_schema_ids(view) {
        let Some(node) = view.schema(owner_type) else { continue };
        if node.keys.is_empty() {
            continue;
        }
        let owner_subs = view.subs(owner_type);
        for key_type in &node.keys {
            let key_subs = view.subs(*key_type);
            let mut attrs: Vec<ConceptId> = Vec::new();
            for t in &key_subs {
                attrs.extend(view.instances_of(*t, false));
            }
            attrs.sort_unstable();

            let mut owners_by_value: FxHashMap<crate::concept::ValueKey, (String, BTreeSet<ConceptId>)> =
                FxHashMap::default();
            for attr_id in attrs {
                let Some(attr) = view.thing(attr_id) else {
                    continue;
                };
                if !is_persistent(persist, attr) {
                    continue;
                }
                let Some(value) = attr.value() else { continue };
                let owners = view
                    .owners_of(attr_id)
                    .into_iter()
                    .filter_map(|o| view.thing(o))
                    .filter(|o| is_persistent(persist, o))
                    .filter(|o| o.owned.get(&attr_id) == Some(&OwnershipKind::Asserted))
                    .filter(|o| owner_subs.contains(&o.type_));
                let entry = owners_by_value
                    .entry(value.key())
                    .or_insert_with(|| (value.to_string(), BTreeSet::new()));
                entry.1.extend(owners.map(|o| o.id));
            }
            let mut values: Vec<_> = owners_by_value.into_values().collect();
            values.sort_by(|a, b| a.0.cmp(&b.0));
            for (value, owners) in values {
                if owners.len() > 1 {
                    errors.push(format!(
                        "key value {} of attribute type '{}' is owned by {} instances of type '{}'",
                        value,
                        label_of(view, *key_type),
                        owners.len(),
                        node.label
                    ));
                }
            }
        }
    }
}

/// (7) Every relation has at least one casting.
fn check_relations_nonempty(
    view: &GraphView<'_>,
    persist: &FxHashSet<ConceptId>,
    errors: &mut Vec<String>,
) {
    for id in sorted_thing_ids(view) {
        let Some(thing) = view.thing(id) else { continue };
        if !thing.is_relation() || !is_persistent(persist, thing) {
            continue;
        }
        if thing.castings().is_empty() {
            errors.push(format!(
                "relation {} of type '{}' has no role players",
                thing.id,
                label_of(view, thing.type_)
            ));
        }
    }
}

type RuleSets = (
    ConceptId,
    BTreeSet<ConceptId>,
    BTreeSet<ConceptId>,
    BTreeSet<ConceptId>,
);

/// (8) Rule well-formedness for rules staged this transaction: bodies and
/// heads are conjunctions, the head is a single atom, every referenced
/// label resolves ontologically. Also computes the hypothesis and
/// conclusion sets fed into the stratifiability check.
fn validate_rules(committed: &KeyspaceGraph, staged: &Staged) -> (Vec<String>, Vec<RuleSets>) {
    let view = GraphView::new(committed, staged);
    let mut errors = Vec::new();
    let mut updates = Vec::new();

    let mut staged_rules: Vec<ConceptId> = staged
        .schema
        .values()
        .filter(|n| n.kind == SchemaKind::Rule && n.rule.is_some())
        .map(|n| n.id)
        .collect();
    staged_rules.sort_unstable();

    for id in staged_rules {
        let Some(rule_node) = view.schema(id) else { continue };
        let Some(rule) = rule_node.rule.as_ref() else { continue };
        let label = &rule_node.label;

        if rule.when.contains_disjunction() {
            errors.push(format!("rule '{label}' has a disjunction in its body"));
        }
        if rule.then.contains_disjunction() {
            errors.push(format!("rule '{label}' has a disjunction in its head"));
        }
        if rule.then.contains_negation() {
            errors.push(format!("rule '{label}' has a negation in its head"));
        }
        if rule.then.atom_count() != 1 {
            errors.push(format!(
                "rule '{label}' head must contain exactly one atom"
            ));
        }

        let mut positive = BTreeSet::new();
        let mut negative = BTreeSet::new();
        let mut conclusion = BTreeSet::new();
        check_rule_side(&view, label, &rule.when, "body", &mut errors, |type_id, negated| {
            if negated {
                negative.insert(type_id);
            } else {
                positive.insert(type_id);
            }
        });
        check_rule_side(&view, label, &rule.then, "head", &mut errors, |type_id, _| {
            conclusion.insert(type_id);
        });
        updates.push((id, positive, negative, conclusion));
    }
    (errors, updates)
}

fn check_rule_side(
    view: &GraphView<'_>,
    rule_label: &str,
    pattern: &Pattern,
    side: &str,
    errors: &mut Vec<String>,
    mut record: impl FnMut(ConceptId, bool),
) {
    for (statement, negated) in pattern.statements() {
        for constraint in &statement.constraints {
            match constraint {
                Constraint::Isa(label) => match view.schema_by_label(label) {
                    Some(node) if node.kind.is_thing_type() => record(node.id, negated),
                    Some(node) => errors.push(format!(
                        "rule '{rule_label}' {side} treats '{}' (a {}) as a thing type",
                        label,
                        node.kind.name()
                    )),
                    None => errors.push(format!(
                        "rule '{rule_label}' {side} refers to type '{label}' which does not exist"
                    )),
                },
                Constraint::Has { attribute_type, .. } => match view.schema_by_label(attribute_type)
                {
                    Some(node) if node.kind == SchemaKind::Attribute => record(node.id, negated),
                    Some(_) => errors.push(format!(
                        "rule '{rule_label}' {side} uses '{attribute_type}' which is not an attribute type"
                    )),
                    None => errors.push(format!(
                        "rule '{rule_label}' {side} refers to type '{attribute_type}' which does not exist"
                    )),
                },
                Constraint::Rel(players) => {
                    for rp in players {
                        if let Some(role_label) = &rp.role {
                            match view.schema_by_label(role_label) {
                                Some(node) if node.kind == SchemaKind::Role => {}
                                Some(_) => errors.push(format!(
                                    "rule '{rule_label}' {side} uses '{role_label}' which is not a role"
                                )),
                                None => errors.push(format!(
                                    "rule '{rule_label}' {side} refers to role '{role_label}' which does not exist"
                                )),
                            }
                        }
                    }
                }
                _ => {}
            }
        }
    }
}

/// (9) The rule dependency graph admits a stratification: no strongly
/// connected component contains a negative edge.
fn check_stratifiability(view: &GraphView<'_>, errors: &mut Vec<String>) {
    let mut edges: Vec<(ConceptId, ConceptId, bool)> = Vec::new();
    for rule_id in view.rules() {
        let Some(rule) = view.schema(rule_id).and_then(|n| n.rule.as_ref()) else {
            continue;
        };
        for conclusion in &rule.conclusion {
            for hypothesis in rule.positive_hypothesis.iter().chain(rule.conclusion.iter()) {
                if hypothesis != conclusion {
                    edges.push((*hypothesis, *conclusion, false));
                }
            }
            for hypothesis in &rule.negative_hypothesis {
                edges.push((*hypothesis, *conclusion, true));
            }
        }
    }
    if edges.is_empty() {
        return;
    }

    let sccs = strongly_connected_components(&edges);
    let mut component_of: FxHashMap<ConceptId, usize> = FxHashMap::default();
    for (index, component) in sccs.iter().enumerate() {
        for node in component {
            component_of.insert(*node, index);
        }
    }
    let mut offending: BTreeSet<String> = BTreeSet::new();
    for (from, to, negative) in &edges {
        if !negative {
            continue;
        }
        if component_of.get(from) == component_of.get(to) {
            offending.insert(label_of(view, *from));
            offending.insert(label_of(view, *to));
        }
    }
    if !offending.is_empty() {
        let types: Vec<String> = offending.into_iter().collect();
        errors.push(format!(
            "rules are not stratifiable: negation closes a cycle through types [{}]",
            types.join(", ")
        ));
    }
}

/// Tarjan's algorithm over the rule dependency edges.
fn strongly_connected_components(edges: &[(ConceptId, ConceptId, bool)]) -> Vec<Vec<ConceptId>> {
    let mut adjacency: FxHashMap<ConceptId, Vec<ConceptId>> = FxHashMap::default();
    let mut nodes: BTreeSet<ConceptId> = BTreeSet::new();
    for (from, to, _) in edges {
        adjacency.entry(*from).or_default().push(*to);
        nodes.insert(*from);
        nodes.insert(*to);
    }

    struct State {
        index: u32,
        indices: FxHashMap<ConceptId, u32>,
        lowlinks: FxHashMap<ConceptId, u32>,
        on_stack: FxHashSet<ConceptId>,
        stack: Vec<ConceptId>,
        components: Vec<Vec<ConceptId>>,
    }

    fn strongconnect(
        node: ConceptId,
        adjacency: &FxHashMap<ConceptId, Vec<ConceptId>>,
        state: &mut State,
    ) {
        state.indices.insert(node, state.index);
        state.lowlinks.insert(node, state.index);
        state.index += 1;
        state.stack.push(node);
        state.on_stack.insert(node);

        for next in adjacency.get(&node).map(Vec::as_slice).unwrap_or(&[]) {
            if !state.indices.contains_key(next) {
                strongconnect(*next, adjacency, state);
                let low = state.lowlinks[&node].min(state.lowlinks[next]);
                state.lowlinks.insert(node, low);
            } else if state.on_stack.contains(next) {
                let low = state.lowlinks[&node].min(state.indices[next]);
                state.lowlinks.insert(node, low);
            }
        }

        if state.lowlinks[&node] == state.indices[&node] {
            let mut component = Vec::new();
            while let Some(top) = state.stack.pop() {
                state.on_stack.remove(&top);
                component.push(top);
                if top == node {
                    break;
                }
            }
            state.components.push(component);
        }
    }

    let mut state = State {
        index: 0,
        indices: FxHashMap::default(),
        lowlinks: FxHashMap::default(),
        on_stack: FxHashSet::default(),
        stack: Vec::new(),
        components: Vec::new(),
    };
    for node in nodes {
        if !state.indices.contains_key(&node) {
            strongconnect(node, &adjacency, &mut state);
        }
    }
    state.components
}
