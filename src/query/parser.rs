//! Hand-rolled tokenizer and recursive-descent parser for the query
//! surface: `define`, `insert`, `match ... get/delete/insert`, and the
//! aggregate tail `count`.

use crate::concept::{DataType, Value};
use crate::error::{CairnError, Result};
use crate::query::{
    AggregateMethod, CmpOp, Constraint, Definable, HasValue, Pattern, Query, RolePlayer,
    Statement, Var,
};

#[derive(Clone, Debug, PartialEq)]
enum Tok {
    Ident(String),
    Var(String),
    Str(String),
    Long(i64),
    Double(f64),
    Semi,
    Comma,
    Colon,
    LParen,
    RParen,
    LBrace,
    RBrace,
    Gt,
    Gte,
    Lt,
    Lte,
    EqEq,
    Neq,
}

fn err(offset: usize, message: impl Into<String>) -> CairnError {
    CairnError::Parse {
        offset,
        message: message.into(),
    }
}

fn tokenize(input: &str) -> Result<Vec<(Tok, usize)>> {
    let bytes = input.as_bytes();
    let mut toks = Vec::new();
    let mut i = 0;
    while i < bytes.len() {
        let c = bytes[i] as char;
        match c {
            ' ' | '\t' | '\r' | '\n' => i += 1,
            ';' => {
                toks.push((Tok::Semi, i));
                i += 1;
            }
            ',' => {
                toks.push((Tok::Comma, i));
                i += 1;
            }
            ':' => {
                toks.push((Tok::Colon, i));
                i += 1;
            }
            '(' => {
                toks.push((Tok::LParen, i));
                i += 1;
            }
            ')' => {
                toks.push((Tok::RParen, i));
                i += 1;
            }
            '{' => {
                toks.push((Tok::LBrace, i));
                i += 1;
            }
            '}' => {
                toks.push((Tok::RBrace, i));
                i += 1;
            }
            '>' => {
                if bytes.get(i + 1) == Some(&b'=') {
                    toks.push((Tok::Gte, i));
                    i += 2;
                } else {
                    toks.push((Tok::Gt, i));
                    i += 1;
                }
            }
            '<' => {
                if bytes.get(i + 1) == Some(&b'=') {
                    toks.push((Tok::Lte, i));
                    i += 2;
                } else {
                    toks.push((Tok::Lt, i));
                    i += 1;
                }
            }
            '=' => {
                if bytes.get(i + 1) == Some(&b'=') {
                    toks.push((Tok::EqEq, i));
                    i += 2;
                } else {
                    return Err(err(i, "expected '=='"));
                }
            }
            '!' => {
                if bytes.get(i + 1) == Some(&b'=') {
                    toks.push((Tok::Neq, i));
                    i += 2;
                } else {
                    return Err(err(i, "expected '!='"));
                }
            }
            '\'' | '"' => {
                let quote = c;
                let start = i;
                i += 1;
                let from = i;
                while i < bytes.len() && bytes[i] as char != quote {
                    i += 1;
                }
                if i >= bytes.len() {
                    return Err(err(start, "unterminated string literal"));
                }
                toks.push((Tok::Str(input[from..i].to_string()), start));
                i += 1;
            }
            '$' => {
                let start = i;
                i += 1;
                let from = i;
                while i < bytes.len() && is_ident_char(bytes[i] as char) {
                    i += 1;
                }
                if from == i {
                    return Err(err(start, "empty variable name"));
                }
                toks.push((Tok::Var(input[from..i].to_string()), start));
            }
            c if c.is_ascii_digit() => {
                let start = i;
                while i < bytes.len() && (bytes[i] as char).is_ascii_digit() {
                    i += 1;
                }
                let mut is_double = false;
                if bytes.get(i) == Some(&b'.')
                    && bytes
                        .get(i + 1)
                        .map(|b| (*b as char).is_ascii_digit())
                        .unwrap_or(false)
                {
                    is_double = true;
                    i += 1;
                    while i < bytes.len() && (bytes[i] as char).is_ascii_digit() {
                        i += 1;
                    }
                }
                let text = &input[start..i];
                if is_double {
                    let v: f64 = text
                        .parse()
                        .map_err(|_| err(start, format!("invalid number '{text}'")))?;
                    toks.push((Tok::Double(v), start));
                } else {
                    let v: i64 = text
                        .parse()
                        .map_err(|_| err(start, format!("invalid number '{text}'")))?;
                    toks.push((Tok::Long(v), start));
                }
            }
            c if is_ident_start(c) => {
                let start = i;
                while i < bytes.len() && is_ident_char(bytes[i] as char) {
                    i += 1;
                }
                toks.push((Tok::Ident(input[start..i].to_string()), start));
            }
            other => return Err(err(i, format!("unexpected character '{other}'"))),
        }
    }
    Ok(toks)
}

fn is_ident_start(c: char) -> bool {
    c.is_ascii_alphabetic() || c == '_' || c == '@'
}

fn is_ident_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || c == '_' || c == '-' || c == '@'
}

struct Parser {
    toks: Vec<(Tok, usize)>,
    pos: usize,
    anon: usize,
    input_len: usize,
}

/// Parses one query string.
pub fn parse_query(input: &str) -> Result<Query> {
    let toks = tokenize(input)?;
    let mut parser = Parser {
        toks,
        pos: 0,
        anon: 0,
        input_len: input.len(),
    };
    let query = parser.query()?;
    if !parser.at_end() {
        return Err(err(parser.offset(), "trailing input after query"));
    }
    Ok(query)
}

impl Parser {
    fn at_end(&self) -> bool {
        self.pos >= self.toks.len()
    }

    fn offset(&self) -> usize {
        self.toks
            .get(self.pos)
            .map(|(_, o)| *o)
            .unwrap_or(self.input_len)
    }

    fn peek(&self) -> Option<&Tok> {
        self.toks.get(self.pos).map(|(t, _)| t)
    }

    fn next(&mut self) -> Result<Tok> {
        let tok = self
            .toks
            .get(self.pos)
            .map(|(t, _)| t.clone())
            .ok_or_else(|| err(self.input_len, "unexpected end of input"))?;
        self.pos += 1;
        Ok(tok)
    }

    fn eat(&mut self, tok: &Tok) -> bool {
        if self.peek() == Some(tok) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn expect(&mut self, tok: Tok, what: &str) -> Result<()> {
        let offset = self.offset();
        if self.eat(&tok) {
            Ok(())
        } else {
            Err(err(offset, format!("expected {what}")))
        }
    }

    fn peek_keyword(&self, kw: &str) -> bool {
        matches!(self.peek(), Some(Tok::Ident(s)) if s == kw)
    }

    fn eat_keyword(&mut self, kw: &str) -> bool {
        if self.peek_keyword(kw) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn expect_ident(&mut self, what: &str) -> Result<String> {
        let offset = self.offset();
        match self.next()? {
            Tok::Ident(s) => Ok(s),
            _ => Err(err(offset, format!("expected {what}"))),
        }
    }

    fn fresh_anon(&mut self) -> Var {
        let var = format!("_anon{}", self.anon);
        self.anon += 1;
        var
    }

    fn query(&mut self) -> Result<Query> {
        let offset = self.offset();
        if self.eat_keyword("define") {
            return self.define_tail();
        }
        if self.eat_keyword("insert") {
            let statements = self.statements_until_end()?;
            return Ok(Query::Insert {
                prefix: None,
                statements,
            });
        }
        if self.eat_keyword("match") {
            return self.match_tail();
        }
        Err(err(offset, "expected 'define', 'insert' or 'match'"))
    }

    fn define_tail(&mut self) -> Result<Query> {
        let mut definables = Vec::new();
        while !self.at_end() {
            definables.push(self.definable()?);
        }
        if definables.is_empty() {
            return Err(err(self.offset(), "empty define"));
        }
        Ok(Query::Define(definables))
    }

    fn definable(&mut self) -> Result<Definable> {
        let label = self.expect_ident("a type label")?;
        let offset = self.offset();
        if !self.eat_keyword("sub") {
            return Err(err(offset, "expected 'sub'"));
        }
        let sup = self.expect_ident("a supertype label")?;
        let mut definable = Definable {
            label,
            sup,
            ..Definable::default()
        };
        while self.eat(&Tok::Comma) {
            let offset = self.offset();
            if self.eat_keyword("plays") {
                definable.plays.push(self.expect_ident("a role label")?);
            } else if self.eat_keyword("relates") {
                definable.relates.push(self.expect_ident("a role label")?);
            } else if self.eat_keyword("has") {
                definable
                    .has
                    .push(self.expect_ident("an attribute type label")?);
            } else if self.eat_keyword("key") {
                definable
                    .keys
                    .push(self.expect_ident("an attribute type label")?);
            } else if self.eat_keyword("abstract") {
                definable.is_abstract = true;
            } else if self.eat_keyword("datatype") {
                let name = self.expect_ident("a datatype")?;
                definable.datatype = Some(match name.as_str() {
                    "string" => DataType::String,
                    "long" => DataType::Long,
                    "double" => DataType::Double,
                    "boolean" => DataType::Boolean,
                    other => return Err(err(offset, format!("unknown datatype '{other}'"))),
                });
            } else if self.eat_keyword("when") {
                definable.when = Some(self.block()?);
            } else if self.eat_keyword("then") {
                definable.then = Some(self.block()?);
            } else {
                return Err(err(offset, "expected a type property"));
            }
        }
        self.expect(Tok::Semi, "';' after definition")?;
        Ok(definable)
    }

    fn match_tail(&mut self) -> Result<Query> {
        let pattern = self.patterns_until(&["get", "delete", "insert"])?;
        let offset = self.offset();
        if self.eat_keyword("get") {
            let vars = self.var_list()?;
            self.expect(Tok::Semi, "';' after get")?;
            if self.eat_keyword("count") {
                self.expect(Tok::Semi, "';' after count")?;
                return Ok(Query::Aggregate {
                    pattern,
                    vars,
                    method: AggregateMethod::Count,
                });
            }
            return Ok(Query::Get { pattern, vars });
        }
        if self.eat_keyword("delete") {
            let vars = self.var_list()?;
            self.expect(Tok::Semi, "';' after delete")?;
            return Ok(Query::Delete { pattern, vars });
        }
        if self.eat_keyword("insert") {
            let statements = self.statements_until_end()?;
            return Ok(Query::Insert {
                prefix: Some(pattern),
                statements,
            });
        }
        Err(err(offset, "expected 'get', 'delete' or 'insert'"))
    }

    fn var_list(&mut self) -> Result<Vec<Var>> {
        let mut vars = Vec::new();
        loop {
            match self.peek() {
                Some(Tok::Var(v)) => {
                    vars.push(v.clone());
                    self.pos += 1;
                    if !self.eat(&Tok::Comma) {
                        break;
                    }
                }
                _ => break,
            }
        }
        Ok(vars)
    }

    /// Parses `;`-terminated patterns until one of the stop keywords or the
    /// end of input.
    fn patterns_until(&mut self, stops: &[&str]) -> Result<Pattern> {
        let mut items = Vec::new();
        loop {
            if self.at_end() || stops.iter().any(|kw| self.peek_keyword(kw)) {
                break;
            }
            items.push(self.pattern_item()?);
        }
        if items.is_empty() {
            return Err(err(self.offset(), "expected at least one pattern"));
        }
        Ok(Pattern::Conjunction(items))
    }

    fn pattern_item(&mut self) -> Result<Pattern> {
        if self.eat_keyword("not") {
            let inner = self.block()?;
            self.expect(Tok::Semi, "';' after negation")?;
            return Ok(Pattern::Negation(Box::new(inner)));
        }
        if self.eat_keyword("or") {
            let mut branches = vec![self.block()?];
            while self.peek() == Some(&Tok::LBrace) {
                branches.push(self.block()?);
            }
            self.expect(Tok::Semi, "';' after disjunction")?;
            return Ok(Pattern::Disjunction(branches));
        }
        let statement = self.statement()?;
        self.expect(Tok::Semi, "';' after statement")?;
        Ok(Pattern::Statement(statement))
    }

    /// `{ pattern* }`
    fn block(&mut self) -> Result<Pattern> {
        self.expect(Tok::LBrace, "'{'")?;
        let mut items = Vec::new();
        while !self.eat(&Tok::RBrace) {
            if self.at_end() {
                return Err(err(self.input_len, "unterminated pattern block"));
            }
            items.push(self.pattern_item()?);
        }
        Ok(Pattern::Conjunction(items))
    }

    fn statements_until_end(&mut self) -> Result<Vec<Statement>> {
        let mut statements = Vec::new();
        while !self.at_end() {
            statements.push(self.statement()?);
            self.expect(Tok::Semi, "';' after statement")?;
        }
        if statements.is_empty() {
            return Err(err(self.offset(), "expected at least one statement"));
        }
        Ok(statements)
    }

    fn statement(&mut self) -> Result<Statement> {
        let offset = self.offset();
        let var = match self.peek() {
            Some(Tok::Var(v)) => {
                let v = v.clone();
                self.pos += 1;
                v
            }
            Some(Tok::LParen) => self.fresh_anon(),
            _ => return Err(err(offset, "expected a variable or relation tuple")),
        };
        let mut constraints = vec![self.constraint()?];
        // A relation tuple may be followed directly by its `isa`, with no
        // comma: `$r (friend: $x, friend: $y) isa friendship`.
        if matches!(constraints.last(), Some(Constraint::Rel(_))) && self.peek_keyword("isa") {
            constraints.push(self.constraint()?);
        }
        while self.eat(&Tok::Comma) {
            constraints.push(self.constraint()?);
        }
        Ok(Statement { var, constraints })
    }

    fn constraint(&mut self) -> Result<Constraint> {
        let offset = self.offset();
        if self.eat_keyword("isa") {
            return Ok(Constraint::Isa(self.expect_ident("a type label")?));
        }
        if self.eat_keyword("id") {
            return match self.next()? {
                Tok::Long(v) if v >= 0 => Ok(Constraint::Id(v as u64)),
                _ => Err(err(offset, "expected a concept id")),
            };
        }
        if self.eat_keyword("has") {
            let attribute_type = self.expect_ident("an attribute type label")?;
            let value = match self.peek() {
                Some(Tok::Var(v)) => {
                    let v = v.clone();
                    self.pos += 1;
                    HasValue::Var(v)
                }
                _ => HasValue::Literal(self.value()?),
            };
            return Ok(Constraint::Has {
                attribute_type,
                value,
            });
        }
        if self.peek() == Some(&Tok::LParen) {
            self.pos += 1;
            let mut players = Vec::new();
            loop {
                players.push(self.role_player()?);
                if !self.eat(&Tok::Comma) {
                    break;
                }
            }
            self.expect(Tok::RParen, "')'")?;
            return Ok(Constraint::Rel(players));
        }
        let cmp = match self.peek() {
            Some(Tok::Gt) => Some(CmpOp::Gt),
            Some(Tok::Gte) => Some(CmpOp::Gte),
            Some(Tok::Lt) => Some(CmpOp::Lt),
            Some(Tok::Lte) => Some(CmpOp::Lte),
            Some(Tok::EqEq) => Some(CmpOp::Eq),
            Some(Tok::Neq) => Some(CmpOp::Neq),
            _ => None,
        };
        if let Some(op) = cmp {
            self.pos += 1;
            if let Some(Tok::Var(v)) = self.peek() {
                let v = v.clone();
                self.pos += 1;
                return match op {
                    CmpOp::Neq => Ok(Constraint::NeqVar(v)),
                    _ => Err(err(offset, "only '!=' is supported between variables")),
                };
            }
            let value = self.value()?;
            return Ok(Constraint::Cmp { op, value });
        }
        // Bare literal: value equality on an attribute variable.
        if matches!(
            self.peek(),
            Some(Tok::Str(_) | Tok::Long(_) | Tok::Double(_))
        ) {
            return Ok(Constraint::Value(self.value()?));
        }
        Err(err(offset, "expected a constraint"))
    }

    fn role_player(&mut self) -> Result<RolePlayer> {
        let offset = self.offset();
        match self.next()? {
            Tok::Ident(role) => {
                self.expect(Tok::Colon, "':' after role label")?;
                match self.next()? {
                    Tok::Var(player) => Ok(RolePlayer {
                        role: Some(role),
                        player,
                    }),
                    _ => Err(err(offset, "expected a player variable")),
                }
            }
            Tok::Var(player) => Ok(RolePlayer { role: None, player }),
            _ => Err(err(offset, "expected a role player")),
        }
    }

    fn value(&mut self) -> Result<Value> {
        let offset = self.offset();
        match self.next()? {
            Tok::Str(s) => Ok(Value::String(s)),
            Tok::Long(v) => Ok(Value::Long(v)),
            Tok::Double(v) => Ok(Value::Double(v)),
            Tok::Ident(s) if s == "true" => Ok(Value::Boolean(true)),
            Tok::Ident(s) if s == "false" => Ok(Value::Boolean(false)),
            _ => Err(err(offset, "expected a value literal")),
        }
    }
}
