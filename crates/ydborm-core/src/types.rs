//! Column types and value coercion.

use crate::value::Value;

/// Semantic column types understood by the statement compiler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ColumnType {
    Int8,
    Int16,
    Int32,
    Int64,
    Uint8,
    Uint16,
    Uint32,
    Uint64,
    Utf8,
    Bool,
    Decimal { precision: u8, scale: u8 },
    /// Microseconds since the Unix epoch
    Timestamp,
}

impl ColumnType {
    /// The type name used in `DECLARE` headers.
    pub fn yql_name(&self) -> String {
        match self {
            ColumnType::Int8 => "Int8".to_string(),
            ColumnType::Int16 => "Int16".to_string(),
            ColumnType::Int32 => "Int32".to_string(),
            ColumnType::Int64 => "Int64".to_string(),
            ColumnType::Uint8 => "Uint8".to_string(),
            ColumnType::Uint16 => "Uint16".to_string(),
            ColumnType::Uint32 => "Uint32".to_string(),
            ColumnType::Uint64 => "Uint64".to_string(),
            ColumnType::Utf8 => "Utf8".to_string(),
            ColumnType::Bool => "Bool".to_string(),
            ColumnType::Decimal { precision, scale } => {
                format!("Decimal({},{})", precision, scale)
            }
            ColumnType::Timestamp => "Timestamp".to_string(),
        }
    }

    /// Declared parameter type, wrapped in `Optional<..>` for nullable columns.
    pub fn declared(&self, nullable: bool) -> String {
        if nullable {
            format!("Optional<{}>", self.yql_name())
        } else {
            self.yql_name()
        }
    }

    pub const fn is_integer(&self) -> bool {
        matches!(
            self,
            ColumnType::Int8
                | ColumnType::Int16
                | ColumnType::Int32
                | ColumnType::Int64
                | ColumnType::Uint8
                | ColumnType::Uint16
                | ColumnType::Uint32
                | ColumnType::Uint64
        )
    }

    pub const fn is_text(&self) -> bool {
        matches!(self, ColumnType::Utf8)
    }

    /// Coerce a value to exactly this column type.
    ///
    /// Integers are narrowed to the column width and must fit. `Null` passes
    /// through untouched; nullability is checked by the caller. The error is a
    /// human-readable reason.
    pub fn coerce(&self, value: Value) -> Result<Value, String> {
        if value.is_null() {
            return Ok(Value::Null);
        }
        if self.is_integer() {
            let Some(wide) = value.as_i128() else {
                return Err(format!(
                    "expected {}, found {}",
                    self.yql_name(),
                    value.type_name()
                ));
            };
            let out_of_range = || format!("value {} out of range for {}", wide, self.yql_name());
            return match self {
                ColumnType::Int8 => i8::try_from(wide).map(Value::Int8).map_err(|_| out_of_range()),
                ColumnType::Int16 => i16::try_from(wide)
                    .map(Value::Int16)
                    .map_err(|_| out_of_range()),
                ColumnType::Int32 => i32::try_from(wide)
                    .map(Value::Int32)
                    .map_err(|_| out_of_range()),
                ColumnType::Int64 => i64::try_from(wide)
                    .map(Value::Int64)
                    .map_err(|_| out_of_range()),
                ColumnType::Uint8 => u8::try_from(wide)
                    .map(Value::Uint8)
                    .map_err(|_| out_of_range()),
                ColumnType::Uint16 => u16::try_from(wide)
                    .map(Value::Uint16)
                    .map_err(|_| out_of_range()),
                ColumnType::Uint32 => u32::try_from(wide)
                    .map(Value::Uint32)
                    .map_err(|_| out_of_range()),
                _ => u64::try_from(wide)
                    .map(Value::Uint64)
                    .map_err(|_| out_of_range()),
            };
        }
        match (self, value) {
            (ColumnType::Utf8, v @ Value::Text(_)) => Ok(v),
            (ColumnType::Bool, v @ Value::Bool(_)) => Ok(v),
            (ColumnType::Timestamp, v @ Value::Timestamp(_)) => Ok(v),
            (ColumnType::Timestamp, v) if v.is_integer() => v
                .as_i64()
                .map(Value::Timestamp)
                .ok_or_else(|| "timestamp out of range".to_string()),
            (ColumnType::Decimal { .. }, Value::Decimal(s) | Value::Text(s)) => {
                if s.parse::<f64>().is_ok() {
                    Ok(Value::Decimal(s))
                } else {
                    Err(format!("'{}' is not a decimal number", s))
                }
            }
            (ColumnType::Decimal { .. }, v) if v.is_integer() => Ok(Value::Decimal(v.to_string())),
            (ty, v) => Err(format!(
                "expected {}, found {}",
                ty.yql_name(),
                v.type_name()
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_yql_names() {
        assert_eq!(ColumnType::Uint64.yql_name(), "Uint64");
        assert_eq!(
            ColumnType::Decimal {
                precision: 22,
                scale: 9
            }
            .yql_name(),
            "Decimal(22,9)"
        );
        assert_eq!(ColumnType::Utf8.declared(true), "Optional<Utf8>");
        assert_eq!(ColumnType::Int64.declared(false), "Int64");
    }

    #[test]
    fn test_integer_coercion_narrows_to_width() {
        assert_eq!(
            ColumnType::Uint8.coerce(Value::Int64(18)),
            Ok(Value::Uint8(18))
        );
        assert_eq!(
            ColumnType::Int64.coerce(Value::Int32(-3)),
            Ok(Value::Int64(-3))
        );
        assert!(ColumnType::Uint8.coerce(Value::Int64(256)).is_err());
        assert!(ColumnType::Uint32.coerce(Value::Int64(-1)).is_err());
        assert!(ColumnType::Int16.coerce(Value::Text("1".into())).is_err());
    }

    #[test]
    fn test_other_coercions() {
        assert_eq!(ColumnType::Utf8.coerce(Value::Null), Ok(Value::Null));
        assert!(ColumnType::Utf8.coerce(Value::Bool(true)).is_err());
        assert_eq!(
            ColumnType::Timestamp.coerce(Value::Int64(10)),
            Ok(Value::Timestamp(10))
        );
        let dec = ColumnType::Decimal {
            precision: 22,
            scale: 9,
        };
        assert_eq!(
            dec.coerce(Value::Text("1.50".into())),
            Ok(Value::Decimal("1.50".into()))
        );
        assert!(dec.coerce(Value::Text("abc".into())).is_err());
    }
}
