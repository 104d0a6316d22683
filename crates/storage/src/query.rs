//! Query predicate AST and evaluation.
//!
//! Predicates are a tagged-variant tree over dotted JSON field paths,
//! evaluated against parsed document bodies. The store contract takes the
//! AST by reference; callers build it with the combinator methods below.

use serde_json::Value;

/// A filter over document bodies.
#[derive(Debug, Clone, PartialEq)]
pub enum Predicate {
    /// Field equals the given value.
    Eq(String, Value),
    /// Field differs from the given value (missing fields match).
    Ne(String, Value),
    Lt(String, Value),
    Le(String, Value),
    Gt(String, Value),
    Ge(String, Value),
    /// Field is present (at any value, including null).
    Exists(String),
    And(Vec<Predicate>),
    Or(Vec<Predicate>),
    Not(Box<Predicate>),
}

impl Predicate {
    pub fn eq(field: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::Eq(field.into(), value.into())
    }

    pub fn ne(field: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::Ne(field.into(), value.into())
    }

    pub fn lt(field: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::Lt(field.into(), value.into())
    }

    pub fn le(field: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::Le(field.into(), value.into())
    }

    pub fn gt(field: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::Gt(field.into(), value.into())
    }

    pub fn ge(field: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::Ge(field.into(), value.into())
    }

    pub fn exists(field: impl Into<String>) -> Self {
        Self::Exists(field.into())
    }

    pub fn and(self, other: Predicate) -> Self {
        match self {
            Self::And(mut ps) => {
                ps.push(other);
                Self::And(ps)
            }
            p => Self::And(vec![p, other]),
        }
    }

    pub fn or(self, other: Predicate) -> Self {
        match self {
            Self::Or(mut ps) => {
                ps.push(other);
                Self::Or(ps)
            }
            p => Self::Or(vec![p, other]),
        }
    }

    #[allow(clippy::should_implement_trait)]
    pub fn not(self) -> Self {
        Self::Not(Box::new(self))
    }

    /// Evaluate against a parsed body.
    pub fn matches(&self, body: &Value) -> bool {
        match self {
            Self::Eq(f, v) => lookup(body, f) == Some(v),
            Self::Ne(f, v) => lookup(body, f) != Some(v),
            Self::Lt(f, v) => cmp_field(body, f, v).is_some_and(|o| o.is_lt()),
            Self::Le(f, v) => cmp_field(body, f, v).is_some_and(|o| o.is_le()),
            Self::Gt(f, v) => cmp_field(body, f, v).is_some_and(|o| o.is_gt()),
            Self::Ge(f, v) => cmp_field(body, f, v).is_some_and(|o| o.is_ge()),
            Self::Exists(f) => lookup(body, f).is_some(),
            Self::And(ps) => ps.iter().all(|p| p.matches(body)),
            Self::Or(ps) => ps.iter().any(|p| p.matches(body)),
            Self::Not(p) => !p.matches(body),
        }
    }
}

/// Resolve a dotted path (`"address.city"`) inside a JSON object tree.
pub fn lookup<'a>(root: &'a Value, path: &str) -> Option<&'a Value> {
    let mut cur = root;
    for seg in path.split('.') {
        cur = cur.as_object()?.get(seg)?;
    }
    Some(cur)
}

/// Compare a body field against a literal. `None` when the field is
/// missing or the two values are not of a comparable kind.
fn cmp_field(body: &Value, field: &str, rhs: &Value) -> Option<std::cmp::Ordering> {
    compare_values(lookup(body, field)?, rhs)
}

/// Partial order over JSON scalars: numbers compare as f64, strings and
/// booleans compare natively. Mixed kinds are incomparable.
pub fn compare_values(a: &Value, b: &Value) -> Option<std::cmp::Ordering> {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => x.as_f64()?.partial_cmp(&y.as_f64()?),
        (Value::String(x), Value::String(y)) => Some(x.cmp(y)),
        (Value::Bool(x), Value::Bool(y)) => Some(x.cmp(y)),
        _ => None,
    }
}

/// A full query: predicate plus paging and ordering.
#[derive(Debug, Clone, Default)]
pub struct Query {
    pub predicate: Option<Predicate>,
    pub skip: Option<usize>,
    pub take: Option<usize>,
    /// Dotted path into the body to order by.
    pub order_by: Option<String>,
    pub ascending: bool,
}

impl Query {
    pub fn all() -> Self {
        Self {
            ascending: true,
            ..Self::default()
        }
    }

    pub fn filter(predicate: Predicate) -> Self {
        Self {
            predicate: Some(predicate),
            ascending: true,
            ..Self::default()
        }
    }

    pub fn skip(mut self, n: usize) -> Self {
        self.skip = Some(n);
        self
    }

    pub fn take(mut self, n: usize) -> Self {
        self.take = Some(n);
        self
    }

    pub fn order_by(mut self, field: impl Into<String>, ascending: bool) -> Self {
        self.order_by = Some(field.into());
        self.ascending = ascending;
        self
    }
}
