//! Statement compilation.
//!
//! Turns validated query state into statement text plus bound values, and
//! derives the [`StatementShape`] that keys the prepared statement cache.
//!
//! Every value is bound as a `$pN` parameter declared in a `DECLARE` header,
//! so literal values never reach the statement text:
//!
//! ```text
//! DECLARE $p1 AS Uint8;
//! DECLARE $p2 AS Uint64;
//! SELECT `id`, `name`, `age` FROM `users` WHERE `age` > $p1 ORDER BY `id` ASC LIMIT $p2;
//! ```

use crate::predicate::{Operand, Operator, Predicate};
use regex::Regex;
use std::fmt::Write as _;
use std::sync::OnceLock;
use ydborm_core::{Error, FieldInfo, Model, ModelDescriptor, Result, Row, Value};

/// Table-level metadata the compiler needs, from a typed model or a registry
/// descriptor.
#[derive(Debug, Clone, Copy)]
pub struct TableRef {
    pub model: &'static str,
    pub table: &'static str,
    pub fields: &'static [FieldInfo],
    pub primary_key: &'static [&'static str],
}

impl TableRef {
    pub fn of<M: Model>() -> Self {
        Self {
            model: M::MODEL_NAME,
            table: M::TABLE_NAME,
            fields: M::fields(),
            primary_key: M::PRIMARY_KEY,
        }
    }

    pub fn field(&self, name: &str) -> Option<&'static FieldInfo> {
        self.fields.iter().find(|f| f.name == name)
    }

    pub fn column_names(&self) -> Vec<&'static str> {
        self.fields.iter().map(|f| f.name).collect()
    }
}

impl From<&ModelDescriptor> for TableRef {
    fn from(descriptor: &ModelDescriptor) -> Self {
        Self {
            model: descriptor.name,
            table: descriptor.table,
            fields: descriptor.fields,
            primary_key: descriptor.primary_key,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    Asc,
    Desc,
}

impl Direction {
    pub const fn as_sql(self) -> &'static str {
        match self {
            Direction::Asc => "ASC",
            Direction::Desc => "DESC",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct OrderBy {
    pub field: &'static str,
    pub direction: Direction,
}

/// A predicate checked against its column, with operands coerced to the
/// column type.
#[derive(Debug, Clone)]
pub struct BoundPredicate {
    pub field: &'static FieldInfo,
    pub op: Operator,
    pub operand: Operand,
}

impl BoundPredicate {
    /// Validate `predicate` against `table`.
    #[allow(clippy::result_large_err)]
    pub fn bind(table: &TableRef, predicate: Predicate) -> Result<Self> {
        let Predicate { field, op, operand } = predicate;
        let info = table
            .field(&field)
            .ok_or_else(|| Error::compilation(table.model, Some(field.as_str()), "unknown field"))?;
        if operand.contains_null() {
            return Err(Error::compilation(
                table.model,
                Some(field.as_str()),
                "NULL is not a valid predicate operand",
            ));
        }
        let coerce = |value: Value| {
            info.column_type
                .coerce(value)
                .map_err(|msg| Error::compilation(table.model, Some(info.name), msg))
        };
        let operand = match (op, operand) {
            (Operator::Like, Operand::Single(pattern)) => {
                if !info.column_type.is_text() {
                    return Err(Error::compilation(
                        table.model,
                        Some(info.name),
                        "LIKE requires a text column",
                    ));
                }
                Operand::Single(coerce(pattern)?)
            }
            (Operator::In, Operand::List(items)) => Operand::List(
                items
                    .into_iter()
                    .map(coerce)
                    .collect::<Result<Vec<_>>>()?,
            ),
            (Operator::Between, Operand::Range(lo, hi)) => Operand::Range(coerce(lo)?, coerce(hi)?),
            (
                Operator::Eq | Operator::Ne | Operator::Gt | Operator::Ge | Operator::Lt | Operator::Le,
                Operand::Single(value),
            ) => Operand::Single(coerce(value)?),
            (op, _) => {
                return Err(Error::compilation(
                    table.model,
                    Some(info.name),
                    format!("operand shape does not fit operator {}", op),
                ));
            }
        };
        Ok(Self {
            field: info,
            op,
            operand,
        })
    }
}

fn order_spec_regex() -> Option<&'static Regex> {
    static RE: OnceLock<Option<Regex>> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?i)^\s*([a-z_][a-z0-9_]*)(?:\s+(asc|desc))?\s*$").ok())
        .as_ref()
}

/// Parse `"field"` or `"field ASC|DESC"` against `table`.
#[allow(clippy::result_large_err)]
pub fn parse_order_spec(table: &TableRef, spec: &str) -> Result<OrderBy> {
    let caps = order_spec_regex()
        .and_then(|re| re.captures(spec))
        .ok_or_else(|| Error::compilation(table.model, Some(spec), "malformed ordering spec"))?;
    let name = caps.get(1).map_or("", |m| m.as_str());
    let info = table
        .field(name)
        .ok_or_else(|| Error::compilation(table.model, Some(name), "unknown field"))?;
    let direction = match caps.get(2) {
        Some(d) if d.as_str().eq_ignore_ascii_case("desc") => Direction::Desc,
        _ => Direction::Asc,
    };
    Ok(OrderBy {
        field: info.name,
        direction,
    })
}

/// Validated SELECT state shared by typed queries and relationship loads.
#[derive(Debug, Clone)]
pub struct SelectSpec {
    pub table: TableRef,
    /// `None` selects every model column
    pub projection: Option<Vec<&'static str>>,
    pub predicates: Vec<BoundPredicate>,
    pub order: Vec<OrderBy>,
    pub limit: Option<u64>,
    pub offset: Option<u64>,
    pub distinct: bool,
}

impl SelectSpec {
    pub fn new(table: TableRef) -> Self {
        Self {
            table,
            projection: None,
            predicates: Vec::new(),
            order: Vec::new(),
            limit: None,
            offset: None,
            distinct: false,
        }
    }

    /// Selected columns, in output order.
    pub fn columns(&self) -> Vec<&'static str> {
        self.projection
            .clone()
            .unwrap_or_else(|| self.table.column_names())
    }

    /// Whether the selected columns cover the whole model.
    pub fn selects_all_columns(&self) -> bool {
        match &self.projection {
            None => true,
            Some(cols) => self.table.fields.iter().all(|f| cols.contains(&f.name)),
        }
    }

    /// Human-readable predicate shape, e.g. `id = ? AND age > ?`.
    pub fn predicate_shape(&self) -> String {
        if self.predicates.is_empty() {
            return "<no predicates>".to_string();
        }
        self.predicates
            .iter()
            .map(|p| match p.op {
                Operator::Between => format!("{} BETWEEN ? AND ?", p.field.name),
                op => format!("{} {} ?", p.field.name, op),
            })
            .collect::<Vec<_>>()
            .join(" AND ")
    }
}

/// The statement category recorded in a shape.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StatementKind {
    Select,
    Count,
    Insert,
    Upsert,
    Delete,
}

/// Structural cache key. Literal values are never part of it.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct StatementShape {
    pub kind: StatementKind,
    pub table: &'static str,
    pub columns: Vec<&'static str>,
    pub predicates: Vec<(&'static str, Operator)>,
    pub order: Vec<OrderBy>,
    pub distinct: bool,
    pub has_limit: bool,
    pub has_offset: bool,
}

/// Statement text, its shape and the values to bind.
#[derive(Debug, Clone, PartialEq)]
pub struct CompiledStatement {
    pub shape: StatementShape,
    pub text: String,
    pub params: Vec<Value>,
}

/// Accumulates `DECLARE` lines and bound values.
struct Params {
    header: String,
    values: Vec<Value>,
}

impl Params {
    fn new() -> Self {
        Self {
            header: String::new(),
            values: Vec::new(),
        }
    }

    fn bind(&mut self, declared: &str, value: Value) -> String {
        self.values.push(value);
        let name = format!("$p{}", self.values.len());
        let _ = writeln!(self.header, "DECLARE {} AS {};", name, declared);
        name
    }

    fn finish(self, body: &str) -> (String, Vec<Value>) {
        (format!("{}{};", self.header, body), self.values)
    }
}

fn quote(ident: &str) -> String {
    format!("`{}`", ident)
}

fn column_list(columns: &[&str]) -> String {
    columns
        .iter()
        .map(|c| quote(c))
        .collect::<Vec<_>>()
        .join(", ")
}

fn render_where(spec: &SelectSpec, params: &mut Params) -> String {
    let mut clauses = Vec::with_capacity(spec.predicates.len());
    for p in &spec.predicates {
        let column = quote(p.field.name);
        let ty = p.field.column_type.yql_name();
        let clause = match &p.operand {
            Operand::Single(v) => {
                let name = params.bind(&ty, v.clone());
                format!("{} {} {}", column, p.op, name)
            }
            Operand::List(items) => {
                let name = params.bind(&format!("List<{}>", ty), Value::List(items.clone()));
                format!("{} IN {}", column, name)
            }
            Operand::Range(lo, hi) => {
                let lo = params.bind(&ty, lo.clone());
                let hi = params.bind(&ty, hi.clone());
                format!("{} BETWEEN {} AND {}", column, lo, hi)
            }
        };
        clauses.push(clause);
    }
    if clauses.is_empty() {
        String::new()
    } else {
        format!(" WHERE {}", clauses.join(" AND "))
    }
}

/// Compile a SELECT.
pub fn compile_select(spec: &SelectSpec) -> CompiledStatement {
    let mut params = Params::new();
    let columns = spec.columns();
    let mut body = format!(
        "SELECT {}{} FROM {}",
        if spec.distinct { "DISTINCT " } else { "" },
        column_list(&columns),
        quote(spec.table.table)
    );
    body.push_str(&render_where(spec, &mut params));
    if !spec.order.is_empty() {
        let order = spec
            .order
            .iter()
            .map(|o| format!("{} {}", quote(o.field), o.direction.as_sql()))
            .collect::<Vec<_>>()
            .join(", ");
        let _ = write!(body, " ORDER BY {}", order);
    }
    if let Some(limit) = spec.limit {
        let name = params.bind("Uint64", Value::Uint64(limit));
        let _ = write!(body, " LIMIT {}", name);
    }
    if let Some(offset) = spec.offset {
        let name = params.bind("Uint64", Value::Uint64(offset));
        let _ = write!(body, " OFFSET {}", name);
    }
    let (text, params) = params.finish(&body);
    CompiledStatement {
        shape: StatementShape {
            kind: StatementKind::Select,
            table: spec.table.table,
            columns,
            predicates: spec
                .predicates
                .iter()
                .map(|p| (p.field.name, p.op))
                .collect(),
            order: spec.order.clone(),
            distinct: spec.distinct,
            has_limit: spec.limit.is_some(),
            has_offset: spec.offset.is_some(),
        },
        text,
        params,
    }
}

/// Compile `SELECT COUNT(*) AS count`. Ordering, limit and offset are
/// dropped; a distinct query counts over a `SELECT DISTINCT` subquery.
pub fn compile_count(spec: &SelectSpec) -> CompiledStatement {
    let mut params = Params::new();
    let filter = render_where(spec, &mut params);
    let columns = if spec.distinct {
        spec.columns()
    } else {
        Vec::new()
    };
    let body = if spec.distinct {
        format!(
            "SELECT COUNT(*) AS count FROM (SELECT DISTINCT {} FROM {}{})",
            column_list(&columns),
            quote(spec.table.table),
            filter
        )
    } else {
        format!(
            "SELECT COUNT(*) AS count FROM {}{}",
            quote(spec.table.table),
            filter
        )
    };
    let (text, params) = params.finish(&body);
    CompiledStatement {
        shape: StatementShape {
            kind: StatementKind::Count,
            table: spec.table.table,
            columns,
            predicates: spec
                .predicates
                .iter()
                .map(|p| (p.field.name, p.op))
                .collect(),
            order: Vec::new(),
            distinct: spec.distinct,
            has_limit: false,
            has_offset: false,
        },
        text,
        params,
    }
}

/// Compile an `INSERT INTO` (or `UPSERT INTO`) of one row.
///
/// Defaults fill non-nullable `Null` columns and values are coerced to the
/// column types.
#[allow(clippy::result_large_err)]
pub fn compile_write(table: &TableRef, row: &Row, upsert: bool) -> Result<CompiledStatement> {
    let values = ydborm_core::write_values(table.model, table.fields, row)?;
    let mut params = Params::new();
    let mut columns = Vec::with_capacity(values.len());
    let mut placeholders = Vec::with_capacity(values.len());
    for (name, value) in values {
        let declared = table
            .field(name)
            .map(FieldInfo::declared_type)
            .unwrap_or_default();
        placeholders.push(params.bind(&declared, value));
        columns.push(name);
    }
    let kind = if upsert {
        StatementKind::Upsert
    } else {
        StatementKind::Insert
    };
    let body = format!(
        "{} INTO {} ({}) VALUES ({})",
        if upsert { "UPSERT" } else { "INSERT" },
        quote(table.table),
        column_list(&columns),
        placeholders.join(", ")
    );
    let (text, params) = params.finish(&body);
    Ok(CompiledStatement {
        shape: StatementShape {
            kind,
            table: table.table,
            columns,
            predicates: Vec::new(),
            order: Vec::new(),
            distinct: false,
            has_limit: false,
            has_offset: false,
        },
        text,
        params,
    })
}

/// Compile a `DELETE FROM .. WHERE <pk> = ..`.
#[allow(clippy::result_large_err)]
pub fn compile_delete(table: &TableRef, key: Vec<Value>) -> Result<CompiledStatement> {
    let key = ydborm_core::normalize_key(table.model, table.fields, table.primary_key, key)?;
    let mut spec = SelectSpec::new(*table);
    for (column, value) in table.primary_key.iter().zip(key) {
        spec.predicates.push(BoundPredicate::bind(
            table,
            Predicate::new(*column, Operator::Eq, Operand::Single(value)),
        )?);
    }
    let mut params = Params::new();
    let filter = render_where(&spec, &mut params);
    let body = format!("DELETE FROM {}{}", quote(table.table), filter);
    let (text, params) = params.finish(&body);
    Ok(CompiledStatement {
        shape: StatementShape {
            kind: StatementKind::Delete,
            table: table.table,
            columns: Vec::new(),
            predicates: spec
                .predicates
                .iter()
                .map(|p| (p.field.name, p.op))
                .collect(),
            order: Vec::new(),
            distinct: false,
            has_limit: false,
            has_offset: false,
        },
        text,
        params,
    })
}
