//! Parsing and evaluation of the statement dialect the query compiler emits.
//!
//! Only the forms produced by `ydborm-query` are understood:
//!
//! ```text
//! DECLARE $p1 AS Int64;
//! SELECT [DISTINCT ]`a`, `b` FROM `t` [WHERE ..] [ORDER BY ..] [LIMIT $pN] [OFFSET $pN];
//! SELECT COUNT(*) AS count FROM `t` [WHERE ..];
//! SELECT COUNT(*) AS count FROM (SELECT DISTINCT `a` FROM `t` [WHERE ..]);
//! INSERT INTO `t` (`a`, `b`) VALUES ($p1, $p2);
//! UPSERT INTO `t` (`a`, `b`) VALUES ($p1, $p2);
//! DELETE FROM `t` WHERE `id` = $p1;
//! ```
//!
//! Values never appear in the text, so a parsed statement holds parameter
//! indexes that are resolved against the bound values at execution time.

#![allow(clippy::result_large_err)]

use regex::Regex;
use std::cmp::Ordering;
use std::collections::HashSet;
use std::sync::OnceLock;
use ydborm_core::{Error, QueryError, QueryErrorKind, Result, Value};

/// Comparison operator of a single-value condition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum CompareOp {
    Eq,
    Ne,
    Gt,
    Ge,
    Lt,
    Le,
    Like,
}

impl CompareOp {
    fn parse(op: &str) -> Option<Self> {
        match op {
            "=" => Some(Self::Eq),
            "!=" => Some(Self::Ne),
            ">" => Some(Self::Gt),
            ">=" => Some(Self::Ge),
            "<" => Some(Self::Lt),
            "<=" => Some(Self::Le),
            "LIKE" => Some(Self::Like),
            _ => None,
        }
    }
}

/// One conjunct of a `WHERE` clause. Parameter fields are zero-based indexes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Condition {
    Compare {
        column: String,
        op: CompareOp,
        param: usize,
    },
    In {
        column: String,
        param: usize,
    },
    Between {
        column: String,
        low: usize,
        high: usize,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct OrderKey {
    pub column: String,
    pub descending: bool,
}

/// A parsed statement.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Statement {
    Select {
        table: String,
        columns: Vec<String>,
        distinct: bool,
        filter: Vec<Condition>,
        order: Vec<OrderKey>,
        limit: Option<usize>,
        offset: Option<usize>,
    },
    Count {
        table: String,
        /// Columns of the `SELECT DISTINCT` subquery, if any
        distinct_columns: Option<Vec<String>>,
        filter: Vec<Condition>,
    },
    Insert {
        table: String,
        columns: Vec<String>,
        params: Vec<usize>,
        upsert: bool,
    },
    Delete {
        table: String,
        filter: Vec<Condition>,
    },
}

impl Statement {
    pub(crate) fn table(&self) -> &str {
        match self {
            Statement::Select { table, .. }
            | Statement::Count { table, .. }
            | Statement::Insert { table, .. }
            | Statement::Delete { table, .. } => table,
        }
    }

    pub(crate) fn is_write(&self) -> bool {
        matches!(self, Statement::Insert { .. } | Statement::Delete { .. })
    }
}

/// Statement text split into its declared parameters and body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct ParsedText {
    /// Declared type of each `$pN`, in order
    pub declared: Vec<String>,
    pub statement: Statement,
}

pub(crate) fn syntax_error(text: &str, message: impl Into<String>) -> Error {
    Error::Query(QueryError {
        kind: QueryErrorKind::Syntax,
        sql: Some(text.to_string()),
        message: message.into(),
        source: None,
    })
}

fn compiled(cell: &'static OnceLock<Option<Regex>>, pattern: &str) -> Option<&'static Regex> {
    cell.get_or_init(|| Regex::new(pattern).ok()).as_ref()
}

fn declare_regex() -> Option<&'static Regex> {
    static RE: OnceLock<Option<Regex>> = OnceLock::new();
    compiled(&RE, r"^DECLARE \$p(\d+) AS (.+);$")
}

fn select_regex() -> Option<&'static Regex> {
    static RE: OnceLock<Option<Regex>> = OnceLock::new();
    compiled(
        &RE,
        r"^SELECT (?P<distinct>DISTINCT )?(?P<cols>.+?) FROM `(?P<table>[^`]+)`(?: WHERE (?P<filter>.+?))?(?: ORDER BY (?P<order>.+?))?(?: LIMIT \$p(?P<limit>\d+))?(?: OFFSET \$p(?P<offset>\d+))?;$",
    )
}

fn count_regex() -> Option<&'static Regex> {
    static RE: OnceLock<Option<Regex>> = OnceLock::new();
    compiled(
        &RE,
        r"^SELECT COUNT\(\*\) AS count FROM `(?P<table>[^`]+)`(?: WHERE (?P<filter>.+))?;$",
    )
}

fn count_distinct_regex() -> Option<&'static Regex> {
    static RE: OnceLock<Option<Regex>> = OnceLock::new();
    compiled(
        &RE,
        r"^SELECT COUNT\(\*\) AS count FROM \(SELECT DISTINCT (?P<cols>.+?) FROM `(?P<table>[^`]+)`(?: WHERE (?P<filter>.+))?\);$",
    )
}

fn insert_regex() -> Option<&'static Regex> {
    static RE: OnceLock<Option<Regex>> = OnceLock::new();
    compiled(
        &RE,
        r"^(?P<verb>INSERT|UPSERT) INTO `(?P<table>[^`]+)` \((?P<cols>[^)]*)\) VALUES \((?P<vals>[^)]*)\);$",
    )
}

fn delete_regex() -> Option<&'static Regex> {
    static RE: OnceLock<Option<Regex>> = OnceLock::new();
    compiled(
        &RE,
        r"^DELETE FROM `(?P<table>[^`]+)`(?: WHERE (?P<filter>.+))?;$",
    )
}

fn condition_regex() -> Option<&'static Regex> {
    static RE: OnceLock<Option<Regex>> = OnceLock::new();
    compiled(
        &RE,
        r"^`(?P<col>[^`]+)` (?:(?P<op>!=|>=|<=|=|>|<|LIKE) \$p(?P<param>\d+)|IN \$p(?P<list>\d+)|BETWEEN \$p(?P<low>\d+) AND \$p(?P<high>\d+))",
    )
}

fn regex_or_err(re: Option<&'static Regex>, text: &str) -> Result<&'static Regex> {
    re.ok_or_else(|| syntax_error(text, "statement grammar failed to compile"))
}

/// `$pN` is one-based in the text.
fn param_index(text: &str, digits: &str, declared: usize) -> Result<usize> {
    let n: usize = digits
        .parse()
        .map_err(|_| syntax_error(text, format!("bad parameter ${}", digits)))?;
    if n == 0 || n > declared {
        return Err(syntax_error(
            text,
            format!("parameter $p{} is not declared", n),
        ));
    }
    Ok(n - 1)
}

fn identifier_list(text: &str, list: &str) -> Result<Vec<String>> {
    list.split(", ")
        .map(|item| {
            item.strip_prefix('`')
                .and_then(|s| s.strip_suffix('`'))
                .map(str::to_string)
                .ok_or_else(|| syntax_error(text, format!("expected quoted identifier, got {}", item)))
        })
        .collect()
}

fn parse_filter(text: &str, filter: Option<&str>, declared: usize) -> Result<Vec<Condition>> {
    let Some(mut rest) = filter else {
        return Ok(Vec::new());
    };
    let re = regex_or_err(condition_regex(), text)?;
    let mut conditions = Vec::new();
    loop {
        let caps = re
            .captures(rest)
            .ok_or_else(|| syntax_error(text, format!("cannot parse condition: {}", rest)))?;
        let column = caps["col"].to_string();
        let condition = if let Some(op) = caps.name("op") {
            let op = CompareOp::parse(op.as_str())
                .ok_or_else(|| syntax_error(text, format!("unknown operator {}", op.as_str())))?;
            Condition::Compare {
                column,
                op,
                param: param_index(text, &caps["param"], declared)?,
            }
        } else if let Some(list) = caps.name("list") {
            Condition::In {
                column,
                param: param_index(text, list.as_str(), declared)?,
            }
        } else {
            Condition::Between {
                column,
                low: param_index(text, &caps["low"], declared)?,
                high: param_index(text, &caps["high"], declared)?,
            }
        };
        conditions.push(condition);

        let consumed = caps.get(0).map_or(0, |m| m.end());
        rest = &rest[consumed..];
        if rest.is_empty() {
            return Ok(conditions);
        }
        rest = rest
            .strip_prefix(" AND ")
            .ok_or_else(|| syntax_error(text, format!("unexpected text in WHERE: {}", rest)))?;
    }
}

fn parse_order(text: &str, order: Option<&str>) -> Result<Vec<OrderKey>> {
    let Some(order) = order else {
        return Ok(Vec::new());
    };
    order
        .split(", ")
        .map(|item| {
            let (column, direction) = item
                .rsplit_once(' ')
                .ok_or_else(|| syntax_error(text, format!("bad ORDER BY item {}", item)))?;
            let column = identifier_list(text, column)?
                .pop()
                .ok_or_else(|| syntax_error(text, "empty ORDER BY item"))?;
            let descending = match direction {
                "ASC" => false,
                "DESC" => true,
                other => {
                    return Err(syntax_error(
                        text,
                        format!("unknown sort direction {}", other),
                    ));
                }
            };
            Ok(OrderKey { column, descending })
        })
        .collect()
}

/// Parse statement text into its declarations and statement.
pub(crate) fn parse(text: &str) -> Result<ParsedText> {
    let declare = regex_or_err(declare_regex(), text)?;
    let mut declared = Vec::new();
    let mut body = None;
    for line in text.lines().map(str::trim).filter(|l| !l.is_empty()) {
        if let Some(caps) = declare.captures(line) {
            if body.is_some() {
                return Err(syntax_error(text, "DECLARE after statement body"));
            }
            if caps[1] != (declared.len() + 1).to_string() {
                return Err(syntax_error(text, "parameters must be declared in order"));
            }
            declared.push(caps[2].to_string());
        } else if body.is_none() {
            body = Some(line);
        } else {
            return Err(syntax_error(text, "only one statement per text"));
        }
    }
    let body = body.ok_or_else(|| syntax_error(text, "empty statement"))?;
    let statement = parse_body(text, body, declared.len())?;
    Ok(ParsedText {
        declared,
        statement,
    })
}

fn parse_body(text: &str, body: &str, declared: usize) -> Result<Statement> {
    if let Some(caps) = regex_or_err(count_distinct_regex(), text)?.captures(body) {
        return Ok(Statement::Count {
            table: caps["table"].to_string(),
            distinct_columns: Some(identifier_list(text, &caps["cols"])?),
            filter: parse_filter(text, caps.name("filter").map(|m| m.as_str()), declared)?,
        });
    }
    if let Some(caps) = regex_or_err(count_regex(), text)?.captures(body) {
        return Ok(Statement::Count {
            table: caps["table"].to_string(),
            distinct_columns: None,
            filter: parse_filter(text, caps.name("filter").map(|m| m.as_str()), declared)?,
        });
    }
    if let Some(caps) = regex_or_err(select_regex(), text)?.captures(body) {
        return Ok(Statement::Select {
            table: caps["table"].to_string(),
            columns: identifier_list(text, &caps["cols"])?,
            distinct: caps.name("distinct").is_some(),
            filter: parse_filter(text, caps.name("filter").map(|m| m.as_str()), declared)?,
            order: parse_order(text, caps.name("order").map(|m| m.as_str()))?,
            limit: caps
                .name("limit")
                .map(|m| param_index(text, m.as_str(), declared))
                .transpose()?,
            offset: caps
                .name("offset")
                .map(|m| param_index(text, m.as_str(), declared))
                .transpose()?,
        });
    }
    if let Some(caps) = regex_or_err(insert_regex(), text)?.captures(body) {
        let columns = identifier_list(text, &caps["cols"])?;
        let params = caps["vals"]
            .split(", ")
            .map(|p| {
                p.strip_prefix("$p")
                    .ok_or_else(|| syntax_error(text, format!("expected parameter, got {}", p)))
                    .and_then(|digits| param_index(text, digits, declared))
            })
            .collect::<Result<Vec<_>>>()?;
        if params.len() != columns.len() {
            return Err(syntax_error(text, "column and value counts differ"));
        }
        return Ok(Statement::Insert {
            table: caps["table"].to_string(),
            columns,
            params,
            upsert: &caps["verb"] == "UPSERT",
        });
    }
    if let Some(caps) = regex_or_err(delete_regex(), text)?.captures(body) {
        return Ok(Statement::Delete {
            table: caps["table"].to_string(),
            filter: parse_filter(text, caps.name("filter").map(|m| m.as_str()), declared)?,
        });
    }
    Err(syntax_error(text, format!("unsupported statement: {}", body)))
}

// ── Evaluation ────────────────────────────────────────────────────────────

/// Translate a LIKE pattern (`%`, `_`) into an anchored regex.
fn like_regex(pattern: &str) -> Option<Regex> {
    let mut re = String::with_capacity(pattern.len() + 8);
    re.push('^');
    for ch in pattern.chars() {
        match ch {
            '%' => re.push_str(".*"),
            '_' => re.push('.'),
            other => re.push_str(&regex::escape(&other.to_string())),
        }
    }
    re.push('$');
    Regex::new(&re).ok()
}

/// Column lookup for one stored row.
pub(crate) trait RowAccess {
    fn column(&self, name: &str) -> Option<&Value>;
}

fn missing_column(column: &str) -> Error {
    Error::Query(QueryError {
        kind: QueryErrorKind::NotFound,
        sql: None,
        message: format!("unknown column {}", column),
        source: None,
    })
}

fn bound<'a>(params: &'a [Value], index: usize) -> Result<&'a Value> {
    params.get(index).ok_or_else(|| {
        Error::Query(QueryError {
            kind: QueryErrorKind::Database,
            sql: None,
            message: format!("parameter $p{} is not bound", index + 1),
            source: None,
        })
    })
}

/// Whether `row` satisfies every condition. NULL never matches.
pub(crate) fn matches(
    row: &impl RowAccess,
    filter: &[Condition],
    params: &[Value],
) -> Result<bool> {
    for condition in filter {
        let hit = match condition {
            Condition::Compare { column, op, param } => {
                let value = row.column(column).ok_or_else(|| missing_column(column))?;
                let operand = bound(params, *param)?;
                compare(value, *op, operand)
            }
            Condition::In { column, param } => {
                let value = row.column(column).ok_or_else(|| missing_column(column))?;
                let items = bound(params, *param)?.as_list().unwrap_or(&[]);
                !value.is_null() && items.iter().any(|item| value.loosely_equals(item))
            }
            Condition::Between { column, low, high } => {
                let value = row.column(column).ok_or_else(|| missing_column(column))?;
                let low = bound(params, *low)?;
                let high = bound(params, *high)?;
                matches!(
                    value.compare(low),
                    Some(Ordering::Greater | Ordering::Equal)
                ) && matches!(value.compare(high), Some(Ordering::Less | Ordering::Equal))
            }
        };
        if !hit {
            return Ok(false);
        }
    }
    Ok(true)
}

fn compare(value: &Value, op: CompareOp, operand: &Value) -> bool {
    if value.is_null() || operand.is_null() {
        return false;
    }
    match op {
        CompareOp::Eq => value.loosely_equals(operand),
        CompareOp::Ne => !value.loosely_equals(operand),
        CompareOp::Gt => value.compare(operand) == Some(Ordering::Greater),
        CompareOp::Ge => matches!(
            value.compare(operand),
            Some(Ordering::Greater | Ordering::Equal)
        ),
        CompareOp::Lt => value.compare(operand) == Some(Ordering::Less),
        CompareOp::Le => matches!(
            value.compare(operand),
            Some(Ordering::Less | Ordering::Equal)
        ),
        CompareOp::Like => match (value.as_str(), operand.as_str()) {
            (Some(text), Some(pattern)) => {
                like_regex(pattern).is_some_and(|re| re.is_match(text))
            }
            _ => false,
        },
    }
}

/// Total order used by `ORDER BY`: NULL sorts first, incomparable values
/// keep their relative order.
pub(crate) fn order_values(a: &Value, b: &Value) -> Ordering {
    match (a.is_null(), b.is_null()) {
        (true, true) => Ordering::Equal,
        (true, false) => Ordering::Less,
        (false, true) => Ordering::Greater,
        (false, false) => a.compare(b).unwrap_or(Ordering::Equal),
    }
}

/// Drop repeated projected rows, keeping the first occurrence.
pub(crate) fn dedup_rows(rows: Vec<Vec<Value>>) -> Vec<Vec<Value>> {
    let mut seen = HashSet::new();
    rows.into_iter()
        .filter(|row| seen.insert(row.clone()))
        .collect()
}

/// Read a `Uint64` limit or offset parameter.
pub(crate) fn bound_count(params: &[Value], index: usize) -> Result<usize> {
    let value = bound(params, index)?;
    value
        .as_i128()
        .and_then(|n| usize::try_from(n).ok())
        .ok_or_else(|| {
            Error::Query(QueryError {
                kind: QueryErrorKind::Database,
                sql: None,
                message: format!("expected a row count, got {}", value),
                source: None,
            })
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    struct MapRow(HashMap<&'static str, Value>);

    impl RowAccess for MapRow {
        fn column(&self, name: &str) -> Option<&Value> {
            self.0.get(name)
        }
    }

    fn row(id: i64, name: &str) -> MapRow {
        MapRow(HashMap::from([
            ("id", Value::Int64(id)),
            ("name", Value::Text(name.to_string())),
        ]))
    }

    #[test]
    fn test_parse_select() {
        let parsed = parse(
            "DECLARE $p1 AS Utf8;\nDECLARE $p2 AS Uint64;\n\
             SELECT DISTINCT `id`, `name` FROM `users` WHERE `name` LIKE $p1 \
             ORDER BY `id` DESC, `name` ASC LIMIT $p2;",
        )
        .unwrap();
        assert_eq!(parsed.declared, vec!["Utf8", "Uint64"]);
        match parsed.statement {
            Statement::Select {
                table,
                columns,
                distinct,
                filter,
                order,
                limit,
                offset,
            } => {
                assert_eq!(table, "users");
                assert_eq!(columns, vec!["id", "name"]);
                assert!(distinct);
                assert_eq!(
                    filter,
                    vec![Condition::Compare {
                        column: "name".to_string(),
                        op: CompareOp::Like,
                        param: 0
                    }]
                );
                assert_eq!(order.len(), 2);
                assert!(order[0].descending);
                assert_eq!(limit, Some(1));
                assert_eq!(offset, None);
            }
            other => panic!("expected select, got {other:?}"),
        }
    }

    #[test]
    fn test_parse_where_with_between_and_in() {
        let parsed = parse(
            "DECLARE $p1 AS Int64;\nDECLARE $p2 AS Int64;\nDECLARE $p3 AS List<Utf8>;\n\
             SELECT `id` FROM `users` WHERE `id` BETWEEN $p1 AND $p2 AND `name` IN $p3;",
        )
        .unwrap();
        let Statement::Select { filter, .. } = parsed.statement else {
            panic!("expected select");
        };
        assert_eq!(
            filter,
            vec![
                Condition::Between {
                    column: "id".to_string(),
                    low: 0,
                    high: 1
                },
                Condition::In {
                    column: "name".to_string(),
                    param: 2
                },
            ]
        );
    }

    #[test]
    fn test_parse_count_and_writes() {
        let count = parse("SELECT COUNT(*) AS count FROM (SELECT DISTINCT `name` FROM `users`);")
            .unwrap();
        assert!(matches!(
            count.statement,
            Statement::Count { distinct_columns: Some(ref cols), .. } if cols == &vec!["name".to_string()]
        ));

        let upsert = parse(
            "DECLARE $p1 AS Int64;\nDECLARE $p2 AS Optional<Utf8>;\n\
             UPSERT INTO `users` (`id`, `name`) VALUES ($p1, $p2);",
        )
        .unwrap();
        assert!(matches!(upsert.statement, Statement::Insert { upsert: true, .. }));

        let delete = parse("DECLARE $p1 AS Int64;\nDELETE FROM `users` WHERE `id` = $p1;").unwrap();
        assert!(delete.statement.is_write());
        assert_eq!(delete.statement.table(), "users");
    }

    #[test]
    fn test_parse_rejects_undeclared_and_unknown() {
        assert!(parse("SELECT `id` FROM `users` WHERE `id` = $p1;").is_err());
        assert!(parse("DROP TABLE `users`;").is_err());
        assert!(parse("").is_err());
    }

    #[test]
    fn test_not_equal_is_bang_equals() {
        let parsed = parse("DECLARE $p1 AS Int64;\nSELECT `id` FROM `users` WHERE `id` != $p1;").unwrap();
        let Statement::Select { filter, .. } = parsed.statement else {
            panic!("expected select");
        };
        assert_eq!(
            filter,
            vec![Condition::Compare {
                column: "id".to_string(),
                op: CompareOp::Ne,
                param: 0
            }]
        );

        let err = parse("DECLARE $p1 AS Int64;\nSELECT `id` FROM `users` WHERE `id` <> $p1;").unwrap_err();
        assert!(err.to_string().contains("cannot parse condition"));
    }

    #[test]
    fn test_conditions_and_null() {
        let params = vec![
            Value::Int32(2),
            Value::Text("b%".to_string()),
            Value::List(vec![Value::Int64(1), Value::Int64(3)]),
        ];
        let gt = vec![Condition::Compare {
            column: "id".to_string(),
            op: CompareOp::Ge,
            param: 0,
        }];
        assert!(matches(&row(2, "x"), &gt, &params).unwrap());
        assert!(!matches(&row(1, "x"), &gt, &params).unwrap());

        let like = vec![Condition::Compare {
            column: "name".to_string(),
            op: CompareOp::Like,
            param: 1,
        }];
        assert!(matches(&row(1, "bob"), &like, &params).unwrap());
        assert!(!matches(&row(1, "abby"), &like, &params).unwrap());

        let within = vec![Condition::In {
            column: "id".to_string(),
            param: 2,
        }];
        assert!(matches(&row(3, "x"), &within, &params).unwrap());

        let mut null_row = row(1, "x");
        null_row.0.insert("id", Value::Null);
        let ne = vec![Condition::Compare {
            column: "id".to_string(),
            op: CompareOp::Ne,
            param: 0,
        }];
        assert!(!matches(&null_row, &ne, &params).unwrap());

        let unknown = vec![Condition::Compare {
            column: "age".to_string(),
            op: CompareOp::Eq,
            param: 0,
        }];
        assert!(matches(&row(1, "x"), &unknown, &params).is_err());
    }

    #[test]
    fn test_like_escapes_regex_metacharacters() {
        let re = like_regex("a.c%").unwrap();
        assert!(re.is_match("a.cdef"));
        assert!(!re.is_match("abcdef"));
    }
}
