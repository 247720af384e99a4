use crate::concept::{ConceptId, Value};

/// Variable name without its `$` sigil.
pub type Var = String;

/// Comparator in a value constraint such as `$s > 0.0`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CmpOp {
    Gt,
    Gte,
    Lt,
    Lte,
    Eq,
    Neq,
}

impl CmpOp {
    pub fn eval(self, ordering: std::cmp::Ordering) -> bool {
        use std::cmp::Ordering::*;
        match self {
            CmpOp::Gt => ordering == Greater,
            CmpOp::Gte => ordering != Less,
            CmpOp::Lt => ordering == Less,
            CmpOp::Lte => ordering != Greater,
            CmpOp::Eq => ordering == Equal,
            CmpOp::Neq => ordering != Equal,
        }
    }
}

/// Right-hand side of a `has` constraint: a literal or another variable.
#[derive(Clone, Debug, PartialEq)]
pub enum HasValue {
    Var(Var),
    Literal(Value),
}

/// One `(role: $player)` entry of a relation tuple. The role is optional;
/// an unnamed entry matches any role.
#[derive(Clone, Debug, PartialEq)]
pub struct RolePlayer {
    pub role: Option<String>,
    pub player: Var,
}

/// One constraint attached to a statement variable.
#[derive(Clone, Debug, PartialEq)]
pub enum Constraint {
    /// `$x isa person`
    Isa(String),
    /// `$x id 42`
    Id(ConceptId),
    /// `$x has name 'Ganesh'` / `$x has score $s`
    Has {
        attribute_type: String,
        value: HasValue,
    },
    /// `$a 'inferred'`, value equality on an attribute variable.
    Value(Value),
    /// `$s > 0.0`
    Cmp { op: CmpOp, value: Value },
    /// `$q != $p`
    NeqVar(Var),
    /// `$r (friend: $x, friend: $y)`
    Rel(Vec<RolePlayer>),
}

/// A statement: one variable and its constraints.
#[derive(Clone, Debug, PartialEq)]
pub struct Statement {
    pub var: Var,
    pub constraints: Vec<Constraint>,
}

impl Statement {
    pub fn rel(&self) -> Option<&[RolePlayer]> {
        self.constraints.iter().find_map(|c| match c {
            Constraint::Rel(players) => Some(players.as_slice()),
            _ => None,
        })
    }

    pub fn isa(&self) -> Option<&str> {
        self.constraints.iter().find_map(|c| match c {
            Constraint::Isa(label) => Some(label.as_str()),
            _ => None,
        })
    }
}

/// A pattern tree. `when`/`then` rule bodies and `match` clauses share this
/// representation.
#[derive(Clone, Debug, PartialEq)]
pub enum Pattern {
    Conjunction(Vec<Pattern>),
    Statement(Statement),
    Negation(Box<Pattern>),
    Disjunction(Vec<Pattern>),
}

impl Pattern {
    pub fn contains_disjunction(&self) -> bool {
        match self {
            Pattern::Disjunction(_) => true,
            Pattern::Conjunction(inner) => inner.iter().any(Pattern::contains_disjunction),
            Pattern::Negation(inner) => inner.contains_disjunction(),
            Pattern::Statement(_) => false,
        }
    }

    pub fn contains_negation(&self) -> bool {
        match self {
            Pattern::Negation(_) => true,
            Pattern::Conjunction(inner) => inner.iter().any(Pattern::contains_negation),
            Pattern::Disjunction(inner) => inner.iter().any(Pattern::contains_negation),
            Pattern::Statement(_) => false,
        }
    }

    /// Statements at any depth, with whether each sits under a negation.
    pub fn statements(&self) -> Vec<(&Statement, bool)> {
        let mut out = Vec::new();
        self.collect_statements(false, &mut out);
        out
    }

    fn collect_statements<'a>(&'a self, negated: bool, out: &mut Vec<(&'a Statement, bool)>) {
        match self {
            Pattern::Statement(s) => out.push((s, negated)),
            Pattern::Conjunction(inner) | Pattern::Disjunction(inner) => {
                for p in inner {
                    p.collect_statements(negated, out);
                }
            }
            Pattern::Negation(inner) => inner.collect_statements(true, out),
        }
    }

    /// Number of head atoms: statements carrying a `has` or relation
    /// constraint. Rule heads must have exactly one.
    pub fn atom_count(&self) -> usize {
        self.statements()
            .iter()
            .filter(|(s, _)| {
                s.constraints
                    .iter()
                    .any(|c| matches!(c, Constraint::Has { .. } | Constraint::Rel(_)))
            })
            .count()
    }
}
