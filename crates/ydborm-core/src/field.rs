//! Column descriptors.

use crate::types::ColumnType;
use crate::value::Value;

/// Metadata about one model column.
///
/// Built with const methods so models can declare their columns in a
/// `static` slice:
///
/// ```
/// use ydborm_core::{ColumnType, FieldInfo};
///
/// static FIELDS: &[FieldInfo] = &[
///     FieldInfo::new("id", ColumnType::Int64).primary_key(true),
///     FieldInfo::new("email", ColumnType::Utf8).nullable(true),
/// ];
/// assert!(FIELDS[0].primary_key);
/// ```
#[derive(Debug, Clone, Copy)]
pub struct FieldInfo {
    /// Column name
    pub name: &'static str,
    /// Semantic type, fixed for the life of the model
    pub column_type: ColumnType,
    pub nullable: bool,
    pub primary_key: bool,
    /// Produces a value for a `Null` non-nullable column on insert/upsert
    pub default: Option<fn() -> Value>,
}

impl FieldInfo {
    pub const fn new(name: &'static str, column_type: ColumnType) -> Self {
        Self {
            name,
            column_type,
            nullable: false,
            primary_key: false,
            default: None,
        }
    }

    pub const fn nullable(mut self, value: bool) -> Self {
        self.nullable = value;
        self
    }

    pub const fn primary_key(mut self, value: bool) -> Self {
        self.primary_key = value;
        self
    }

    pub const fn default_with(mut self, f: fn() -> Value) -> Self {
        self.default = Some(f);
        self
    }

    /// Declared parameter type for this column.
    pub fn declared_type(&self) -> String {
        self.column_type.declared(self.nullable)
    }

    /// Coerce a value for storage in this column.
    ///
    /// Fills `Null` from the default function when the column is not
    /// nullable, then rejects any remaining `Null`.
    pub fn prepare_value(&self, value: Value) -> Result<Value, String> {
        let value = match (value.is_null(), self.nullable, self.default) {
            (true, false, Some(default)) => default(),
            _ => value,
        };
        if value.is_null() && !self.nullable {
            return Err(format!("column '{}' is not nullable", self.name));
        }
        self.column_type.coerce(value)
    }
}
