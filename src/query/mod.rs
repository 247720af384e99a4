//! Query surface: the AST the engine executes, a minimal text parser for
//! it, and the conjunctive pattern matcher shared by queries and rule
//! evaluation.

mod answer;
mod ast;
mod matcher;
mod parser;
mod pattern;

pub use answer::ConceptMap;
pub use ast::{AggregateMethod, Definable, Query};
pub use matcher::{match_pattern, match_pattern_seeded, Bindings};
pub use parser::parse_query;
pub use pattern::{CmpOp, Constraint, HasValue, Pattern, RolePlayer, Statement, Var};
