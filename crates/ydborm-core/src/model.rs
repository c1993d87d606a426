//! Model trait for mapping record types to tables.
//!
//! A model is a plain Rust struct plus an `impl Model` describing its table,
//! columns and relationships. Implementations are usually generated, but a
//! hand-written one is a few lines:
//!
//! ```
//! use ydborm_core::{ColumnType, FieldInfo, Model, Result, Row, Value};
//!
//! #[derive(Debug, Clone)]
//! struct Tag {
//!     id: i64,
//!     label: String,
//! }
//!
//! impl Model for Tag {
//!     const MODEL_NAME: &'static str = "Tag";
//!     const TABLE_NAME: &'static str = "tags";
//!     const PRIMARY_KEY: &'static [&'static str] = &["id"];
//!
//!     fn fields() -> &'static [FieldInfo] {
//!         static FIELDS: &[FieldInfo] = &[
//!             FieldInfo::new("id", ColumnType::Int64).primary_key(true),
//!             FieldInfo::new("label", ColumnType::Utf8),
//!         ];
//!         FIELDS
//!     }
//!
//!     fn to_row(&self) -> Vec<(&'static str, Value)> {
//!         vec![("id", self.id.into()), ("label", self.label.clone().into())]
//!     }
//!
//!     fn from_row(row: &Row) -> Result<Self> {
//!         Ok(Self {
//!             id: row.get_named("id")?,
//!             label: row.get_named("label")?,
//!         })
//!     }
//!
//!     fn primary_key_value(&self) -> Vec<Value> {
//!         vec![self.id.into()]
//!     }
//! }
//!
//! assert_eq!(Tag::field_info("label").map(|f| f.nullable), Some(false));
//! ```

use crate::Result;
use crate::error::Error;
use crate::field::FieldInfo;
use crate::relationship::RelationshipInfo;
use crate::row::Row;
use crate::value::Value;

/// Trait for types that map to a database table.
pub trait Model: Sized + Clone + Send + Sync + 'static {
    /// Registry name, used by relationship declarations to refer to this model.
    const MODEL_NAME: &'static str;

    const TABLE_NAME: &'static str;

    /// Primary key column name(s), in key order.
    const PRIMARY_KEY: &'static [&'static str];

    /// Relationship declarations. Targets are resolved by name at first use.
    const RELATIONSHIPS: &'static [RelationshipInfo] = &[];

    /// Column metadata, in table order.
    fn fields() -> &'static [FieldInfo];

    /// Column values of this instance.
    fn to_row(&self) -> Vec<(&'static str, Value)>;

    /// Decode an instance from a row. Columns are looked up by name.
    #[allow(clippy::result_large_err)]
    fn from_row(row: &Row) -> Result<Self>;

    /// Primary key value(s), ordered like `PRIMARY_KEY`.
    fn primary_key_value(&self) -> Vec<Value>;

    fn field_info(name: &str) -> Option<&'static FieldInfo> {
        Self::fields().iter().find(|f| f.name == name)
    }

    fn relationship_info(name: &str) -> Option<&'static RelationshipInfo> {
        Self::RELATIONSHIPS.iter().find(|r| r.name == name)
    }

    fn column_names() -> Vec<&'static str> {
        Self::fields().iter().map(|f| f.name).collect()
    }
}

/// Coerce primary key values to the exact types of their key columns.
///
/// Identity-map keys are built from the result, so an `i32` literal and the
/// stored `Int64` value address the same row.
#[allow(clippy::result_large_err)]
pub fn normalize_key(
    model: &'static str,
    fields: &[FieldInfo],
    key_columns: &[&'static str],
    values: Vec<Value>,
) -> Result<Vec<Value>> {
    if values.len() != key_columns.len() {
        return Err(Error::compilation(
            model,
            None,
            format!(
                "primary key has {} column(s), got {} value(s)",
                key_columns.len(),
                values.len()
            ),
        ));
    }
    key_columns
        .iter()
        .zip(values)
        .map(|(column, value)| {
            if value.is_null() {
                return Err(Error::compilation(
                    model,
                    Some(*column),
                    "primary key value is NULL",
                ));
            }
            let field = fields.iter().find(|f| f.name == *column).ok_or_else(|| {
                Error::compilation(model, Some(*column), "primary key column is not a field")
            })?;
            field
                .column_type
                .coerce(value)
                .map_err(|msg| Error::compilation(model, Some(*column), msg))
        })
        .collect()
}

/// Values to write for an insert or upsert, in field order.
///
/// Missing columns count as `Null`, defaults fill non-nullable `Null`s and
/// every value is coerced to its column type.
#[allow(clippy::result_large_err)]
pub fn write_values(
    model: &'static str,
    fields: &'static [FieldInfo],
    row: &Row,
) -> Result<Vec<(&'static str, Value)>> {
    fields
        .iter()
        .map(|field| {
            let value = row.get_by_name(field.name).cloned().unwrap_or(Value::Null);
            field
                .prepare_value(value)
                .map(|v| (field.name, v))
                .map_err(|msg| Error::compilation(model, Some(field.name), msg))
        })
        .collect()
}

/// Row view of a model instance.
pub fn model_row<M: Model>(model: &M) -> Row {
    Row::from_pairs(model.to_row())
}
