use crate::concept::DataType;
use crate::query::{Pattern, Statement, Var};

/// One schema declaration inside a `define`.
#[derive(Clone, Debug, PartialEq, Default)]
pub struct Definable {
    pub label: String,
    /// Parent label: a meta label (`entity`, `relation`, `attribute`,
    /// `rule`) or a user type.
    pub sup: String,
    pub datatype: Option<DataType>,
    pub plays: Vec<String>,
    pub relates: Vec<String>,
    pub has: Vec<String>,
    pub keys: Vec<String>,
    pub is_abstract: bool,
    pub when: Option<Pattern>,
    pub then: Option<Pattern>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AggregateMethod {
    Count,
}

/// Executable query.
#[derive(Clone, Debug, PartialEq)]
pub enum Query {
    Define(Vec<Definable>),
    Insert {
        prefix: Option<Pattern>,
        statements: Vec<Statement>,
    },
    Get {
        pattern: Pattern,
        /// Projection; empty means every named variable.
        vars: Vec<Var>,
    },
    Delete {
        pattern: Pattern,
        vars: Vec<Var>,
    },
    Aggregate {
        pattern: Pattern,
        vars: Vec<Var>,
        method: AggregateMethod,
    },
}
