//! Filter predicates.
//!
//! A predicate is a `(field, operator, operand)` triple. Predicates are plain
//! data until a query validates them against its model, so they can be built
//! with the free functions or with the [`col`] proxy interchangeably:
//!
//! ```
//! use ydborm_query::{col, gt};
//!
//! assert_eq!(gt("age", 18), col("age").gt(18));
//! ```

use std::fmt;
use ydborm_core::Value;

/// Comparison operators.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operator {
    Eq,
    Ne,
    Gt,
    Ge,
    Lt,
    Le,
    In,
    Like,
    Between,
}

impl Operator {
    pub const fn as_sql(self) -> &'static str {
        match self {
            Operator::Eq => "=",
            Operator::Ne => "!=",
            Operator::Gt => ">",
            Operator::Ge => ">=",
            Operator::Lt => "<",
            Operator::Le => "<=",
            Operator::In => "IN",
            Operator::Like => "LIKE",
            Operator::Between => "BETWEEN",
        }
    }
}

impl fmt::Display for Operator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_sql())
    }
}

/// Right-hand side of a predicate.
#[derive(Debug, Clone, PartialEq)]
pub enum Operand {
    Single(Value),
    /// `IN` list, bound as one list parameter
    List(Vec<Value>),
    /// `BETWEEN` bounds, inclusive
    Range(Value, Value),
}

impl Operand {
    /// Whether any part of the operand is `Null`.
    pub fn contains_null(&self) -> bool {
        match self {
            Operand::Single(v) => v.is_null(),
            Operand::List(items) => items.iter().any(Value::is_null),
            Operand::Range(lo, hi) => lo.is_null() || hi.is_null(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Predicate {
    pub field: String,
    pub op: Operator,
    pub operand: Operand,
}

impl Predicate {
    pub fn new(field: impl Into<String>, op: Operator, operand: Operand) -> Self {
        Self {
            field: field.into(),
            op,
            operand,
        }
    }
}

pub fn eq(field: &str, value: impl Into<Value>) -> Predicate {
    Predicate::new(field, Operator::Eq, Operand::Single(value.into()))
}

pub fn ne(field: &str, value: impl Into<Value>) -> Predicate {
    Predicate::new(field, Operator::Ne, Operand::Single(value.into()))
}

pub fn gt(field: &str, value: impl Into<Value>) -> Predicate {
    Predicate::new(field, Operator::Gt, Operand::Single(value.into()))
}

pub fn ge(field: &str, value: impl Into<Value>) -> Predicate {
    Predicate::new(field, Operator::Ge, Operand::Single(value.into()))
}

pub fn lt(field: &str, value: impl Into<Value>) -> Predicate {
    Predicate::new(field, Operator::Lt, Operand::Single(value.into()))
}

pub fn le(field: &str, value: impl Into<Value>) -> Predicate {
    Predicate::new(field, Operator::Le, Operand::Single(value.into()))
}

/// Membership test. The whole list binds to a single parameter.
pub fn in_<I, V>(field: &str, values: I) -> Predicate
where
    I: IntoIterator<Item = V>,
    V: Into<Value>,
{
    Predicate::new(
        field,
        Operator::In,
        Operand::List(values.into_iter().map(Into::into).collect()),
    )
}

/// SQL `LIKE` pattern match (`%` and `_` wildcards). Text columns only.
pub fn like(field: &str, pattern: impl Into<String>) -> Predicate {
    Predicate::new(
        field,
        Operator::Like,
        Operand::Single(Value::Text(pattern.into())),
    )
}

pub fn between(field: &str, low: impl Into<Value>, high: impl Into<Value>) -> Predicate {
    Predicate::new(
        field,
        Operator::Between,
        Operand::Range(low.into(), high.into()),
    )
}

/// Column proxy producing the same predicates as the free functions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Column {
    name: String,
}

pub fn col(name: &str) -> Column {
    Column {
        name: name.to_string(),
    }
}

impl Column {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn eq(&self, value: impl Into<Value>) -> Predicate {
        eq(&self.name, value)
    }

    pub fn ne(&self, value: impl Into<Value>) -> Predicate {
        ne(&self.name, value)
    }

    pub fn gt(&self, value: impl Into<Value>) -> Predicate {
        gt(&self.name, value)
    }

    pub fn ge(&self, value: impl Into<Value>) -> Predicate {
        ge(&self.name, value)
    }

    pub fn lt(&self, value: impl Into<Value>) -> Predicate {
        lt(&self.name, value)
    }

    pub fn le(&self, value: impl Into<Value>) -> Predicate {
        le(&self.name, value)
    }

    pub fn in_<I, V>(&self, values: I) -> Predicate
    where
        I: IntoIterator<Item = V>,
        V: Into<Value>,
    {
        in_(&self.name, values)
    }

    pub fn like(&self, pattern: impl Into<String>) -> Predicate {
        like(&self.name, pattern)
    }

    pub fn between(&self, low: impl Into<Value>, high: impl Into<Value>) -> Predicate {
        between(&self.name, low, high)
    }
}
