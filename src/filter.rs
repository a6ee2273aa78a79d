//! Event filtering: predicate trees and predicate-gated handler lists
//!
//! Predicates are built either with the combinators on `Predicate` or from a
//! compact textual expression:
//! - `pid=1234` process id equals
//! - `event=10|26|42` event id is any of the listed ids
//! - `Payload~started` case-insensitive contains on a string field
//! - `Payload~=Started.` case-sensitive contains
//! - `QueryName=/^.*\.example\.com$/` regex match on a string field
//! - `*` match everything
//!
//! Clauses are separated by `,` and AND-ed; a leading `!` negates a clause.
//! The field name ends at the first `~` or `=`, so `Path~=/tmp/` is a
//! case-sensitive contains on `Path`. A comma inside a needle or a regex is
//! written `\,` (e.g. `Payload=/a{1\,3}/`).

use crate::error::{Result, TraceError};
use crate::record::EventRecord;
use regex::Regex;
use std::fmt;
use std::ops::Not;
use std::sync::Arc;

/// Callback invoked synchronously for each delivered event
pub type EventHandler = Arc<dyn Fn(&EventRecord) + Send + Sync>;

/// Leaf condition of a predicate tree
#[derive(Debug, Clone)]
pub enum Condition {
    /// Always true
    Any,
    ProcessIdEquals(u32),
    EventIdEquals(u16),
    /// Substring test on a string-typed field; false when the field is
    /// absent or not a string
    Contains {
        field: String,
        needle: String,
        case_sensitive: bool,
    },
    /// Regex test on a string-typed field
    Matches { field: String, pattern: Regex },
}

impl Condition {
    fn evaluate(&self, record: &EventRecord) -> bool {
        match self {
            Condition::Any => true,
            Condition::ProcessIdEquals(pid) => record.process_id == *pid,
            Condition::EventIdEquals(id) => record.id == *id,
            Condition::Contains {
                field,
                needle,
                case_sensitive,
            } => match record.get_string(field) {
                Some(value) if *case_sensitive => value.contains(needle.as_str()),
                Some(value) => value.to_lowercase().contains(&needle.to_lowercase()),
                None => false,
            },
            Condition::Matches { field, pattern } => record
                .get_string(field)
                .is_some_and(|value| pattern.is_match(&value)),
        }
    }
}

/// Immutable boolean expression over one event record
#[derive(Debug, Clone)]
pub enum Predicate {
    Leaf(Condition),
    And(Box<Predicate>, Box<Predicate>),
    Or(Box<Predicate>, Box<Predicate>),
    Not(Box<Predicate>),
}

impl Predicate {
    pub fn any() -> Self {
        Predicate::Leaf(Condition::Any)
    }

    pub fn process_id_equals(pid: u32) -> Self {
        Predicate::Leaf(Condition::ProcessIdEquals(pid))
    }

    pub fn event_id_equals(id: u16) -> Self {
        Predicate::Leaf(Condition::EventIdEquals(id))
    }

    /// OR of `event_id_equals` over the given ids, nested to the right
    ///
    /// Returns `None` for an empty id list.
    pub fn event_id_in(ids: &[u16]) -> Option<Self> {
        let (last, rest) = ids.split_last()?;
        let tail = Predicate::event_id_equals(*last);
        Some(
            rest.iter()
                .rev()
                .fold(tail, |acc, id| Predicate::event_id_equals(*id).or(acc)),
        )
    }

    pub fn string_contains(field: &str, needle: &str, case_sensitive: bool) -> Self {
        Predicate::Leaf(Condition::Contains {
            field: field.to_string(),
            needle: needle.to_string(),
            case_sensitive,
        })
    }

    pub fn field_matches(field: &str, pattern: Regex) -> Self {
        Predicate::Leaf(Condition::Matches {
            field: field.to_string(),
            pattern,
        })
    }

    pub fn and(self, other: Predicate) -> Self {
        Predicate::And(Box::new(self), Box::new(other))
    }

    pub fn or(self, other: Predicate) -> Self {
        Predicate::Or(Box::new(self), Box::new(other))
    }

    pub fn negate(inner: Predicate) -> Self {
        Predicate::Not(Box::new(inner))
    }

    /// Evaluate against one record, short-circuiting left to right
    pub fn evaluate(&self, record: &EventRecord) -> bool {
        match self {
            Predicate::Leaf(condition) => condition.evaluate(record),
            Predicate::And(left, right) => left.evaluate(record) && right.evaluate(record),
            Predicate::Or(left, right) => left.evaluate(record) || right.evaluate(record),
            Predicate::Not(inner) => !inner.evaluate(record),
        }
    }

    /// Parse a filter expression (see module docs)
    pub fn from_expr(expr: &str) -> Result<Self> {
        let expr = expr.trim();
        if expr.is_empty() {
            return Err(TraceError::InvalidArgument(
                "Empty filter expression".to_string(),
            ));
        }

        let mut clauses = split_clauses(expr).into_iter();
        let first = parse_clause(clauses.next().unwrap_or_default().trim())?;
        clauses.try_fold(first, |acc, clause| -> Result<Predicate> {
            Ok(acc.and(parse_clause(clause.trim())?))
        })
    }
}

impl Not for Predicate {
    type Output = Predicate;

    fn not(self) -> Self::Output {
        Predicate::negate(self)
    }
}

impl fmt::Display for Predicate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Predicate::Leaf(Condition::Any) => f.write_str("*"),
            Predicate::Leaf(Condition::ProcessIdEquals(pid)) => write!(f, "pid={}", pid),
            Predicate::Leaf(Condition::EventIdEquals(id)) => write!(f, "event={}", id),
            Predicate::Leaf(Condition::Contains {
                field,
                needle,
                case_sensitive,
            }) => {
                let op = if *case_sensitive { "~=" } else { "~" };
                write!(f, "{}{}{}", field, op, needle.replace(',', "\\,"))
            }
            Predicate::Leaf(Condition::Matches { field, pattern }) => {
                write!(f, "{}=/{}/", field, pattern.as_str().replace(',', "\\,"))
            }
            Predicate::And(l, r) => write!(f, "({} && {})", l, r),
            Predicate::Or(l, r) => write!(f, "({} || {})", l, r),
            Predicate::Not(inner) => write!(f, "!{}", inner),
        }
    }
}

fn parse_clause(clause: &str) -> Result<Predicate> {
    if let Some(rest) = clause.strip_prefix('!') {
        return Ok(Predicate::negate(parse_clause(rest.trim())?));
    }

    if clause == "*" {
        return Ok(Predicate::any());
    }

    if let Some(pid) = clause.strip_prefix("pid=") {
        let pid = pid
            .trim()
            .parse::<u32>()
            .map_err(|_| invalid(clause, "process id must be an unsigned integer"))?;
        return Ok(Predicate::process_id_equals(pid));
    }

    if let Some(ids) = clause.strip_prefix("event=") {
        let ids = ids
            .split('|')
            .map(|id| id.trim().parse::<u16>())
            .collect::<std::result::Result<Vec<_>, _>>()
            .map_err(|_| invalid(clause, "event ids must be integers in 0..=65535"))?;
        return Predicate::event_id_in(&ids).ok_or_else(|| invalid(clause, "no event ids"));
    }

    let Some(at) = clause.find(['~', '=']) else {
        return Err(invalid(
            clause,
            "expected pid=N, event=N[|N..], FIELD~TEXT, FIELD~=TEXT, FIELD=/REGEX/ or *",
        ));
    };
    let (field, rest) = clause.split_at(at);
    let field = field_name(field, clause)?;

    if let Some(needle) = rest.strip_prefix("~=") {
        return Ok(Predicate::string_contains(field, needle, true));
    }
    if let Some(needle) = rest.strip_prefix('~') {
        return Ok(Predicate::string_contains(field, needle, false));
    }
    if let Some(pattern) = rest.strip_prefix("=/") {
        let pattern = pattern
            .strip_suffix('/')
            .ok_or_else(|| invalid(clause, "regex must be terminated with '/'"))?;
        let re = Regex::new(pattern).map_err(|e| invalid(clause, &e.to_string()))?;
        return Ok(Predicate::field_matches(field, re));
    }

    Err(invalid(clause, "field equality is only supported as FIELD=/REGEX/"))
}

/// Split on `,` except where escaped as `\,`
fn split_clauses(expr: &str) -> Vec<String> {
    let mut clauses = Vec::new();
    let mut current = String::new();
    let mut chars = expr.chars().peekable();
    while let Some(c) = chars.next() {
        match c {
            '\\' if chars.peek() == Some(&',') => {
                chars.next();
                current.push(',');
            }
            ',' => clauses.push(std::mem::take(&mut current)),
            _ => current.push(c),
        }
    }
    clauses.push(current);
    clauses
}

fn field_name<'a>(field: &'a str, clause: &str) -> Result<&'a str> {
    let field = field.trim();
    if field.is_empty() {
        Err(invalid(clause, "missing field name"))
    } else {
        Ok(field)
    }
}

fn invalid(clause: &str, reason: &str) -> TraceError {
    TraceError::InvalidArgument(format!("Invalid filter clause '{}': {}", clause, reason))
}

/// A predicate plus the ordered handlers it gates
#[derive(Clone)]
pub struct EventFilter {
    predicate: Predicate,
    handlers: Vec<EventHandler>,
}

impl EventFilter {
    pub fn new(predicate: Predicate) -> Self {
        Self {
            predicate,
            handlers: Vec::new(),
        }
    }

    pub fn with_handler(mut self, handler: EventHandler) -> Self {
        self.handlers.push(handler);
        self
    }

    pub fn add_handler(&mut self, handler: EventHandler) {
        self.handlers.push(handler);
    }

    pub fn predicate(&self) -> &Predicate {
        &self.predicate
    }

    pub fn handlers(&self) -> &[EventHandler] {
        &self.handlers
    }

    pub fn has_handlers(&self) -> bool {
        !self.handlers.is_empty()
    }

    /// Whether the predicate admits this record
    pub fn admits(&self, record: &EventRecord) -> bool {
        self.predicate.evaluate(record)
    }
}

impl fmt::Debug for EventFilter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventFilter")
            .field("predicate", &self.predicate.to_string())
            .field("handlers", &self.handlers.len())
            .finish()
    }
}
