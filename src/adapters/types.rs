//! Row shaping for the sqlx-backed adapters.
//!
//! Converts driver rows into the normalized column-name → JSON value maps.
//! Type conversion uses a two-phase approach: [`TypeCategory`] classifies the
//! column's reported type, then a dialect-specific decoder extracts the
//! value. Date and timestamp columns are deliberately rendered back to their
//! textual form so values survive the JSON boundary unchanged.

use base64::{engine::general_purpose::STANDARD, Engine as _};
use serde_json::Value as JsonValue;
use sqlx::mysql::{MySqlRow, MySqlTypeInfo, MySqlValueRef};
use sqlx::postgres::{PgRow, PgTypeInfo, PgValueRef};
use sqlx::sqlite::SqliteRow;
use sqlx::{Column, Decode, Row as _, Type, TypeInfo};

use crate::models::query::{Field, Row};

/// Which sqlx dialect a row came from. Only affects corner cases of type
/// classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SqlFamily {
    Postgres,
    MySql,
    Sqlite,
}

/// Logical category for database column types.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TypeCategory {
    Integer,
    Float,
    Decimal,
    Boolean,
    Text,
    Binary,
    Json,
    Uuid,
    DateTime,
    Unknown,
}

/// Classify a reported type name into a logical category.
pub fn categorize_type(type_name: &str, family: SqlFamily) -> TypeCategory {
    let lower = type_name.to_lowercase();

    if lower.contains("decimal") || lower.contains("numeric") {
        // SQLite's NUMERIC affinity is a float
        if family == SqlFamily::Sqlite && lower == "numeric" {
            return TypeCategory::Float;
        }
        return TypeCategory::Decimal;
    }

    if lower.contains("timestamp")
        || lower.contains("datetime")
        || lower == "date"
        || lower == "time"
        || lower == "timetz"
    {
        return TypeCategory::DateTime;
    }

    if lower.contains("int") || lower.contains("serial") || lower.contains("tiny") {
        return TypeCategory::Integer;
    }

    if lower == "bool" || lower == "boolean" {
        return TypeCategory::Boolean;
    }

    if lower.contains("float")
        || lower.contains("double")
        || lower == "real"
        || lower == "float4"
        || lower == "float8"
    {
        return TypeCategory::Float;
    }

    if lower == "json" || lower == "jsonb" {
        return TypeCategory::Json;
    }

    if lower == "uuid" {
        return TypeCategory::Uuid;
    }

    if lower.contains("blob") || lower.contains("binary") || lower == "bytea" {
        return TypeCategory::Binary;
    }

    if lower.contains("char") || lower.contains("text") {
        return TypeCategory::Text;
    }

    TypeCategory::Unknown
}

/// Wrapper for raw DECIMAL/NUMERIC values as strings, preserving the exact
/// database representation.
#[derive(Debug)]
pub struct RawDecimal(pub String);

impl Type<sqlx::MySql> for RawDecimal {
    fn type_info() -> MySqlTypeInfo {
        <String as Type<sqlx::MySql>>::type_info()
    }

    fn compatible(ty: &MySqlTypeInfo) -> bool {
        let name = ty.name().to_lowercase();
        name.contains("decimal") || name.contains("numeric")
    }
}

impl<'r> Decode<'r, sqlx::MySql> for RawDecimal {
    fn decode(value: MySqlValueRef<'r>) -> Result<Self, sqlx::error::BoxDynError> {
        let s = <&str as Decode<sqlx::MySql>>::decode(value)?;
        Ok(RawDecimal(s.to_string()))
    }
}

impl Type<sqlx::Postgres> for RawDecimal {
    fn type_info() -> PgTypeInfo {
        <String as Type<sqlx::Postgres>>::type_info()
    }

    fn compatible(ty: &PgTypeInfo) -> bool {
        let name = ty.name().to_lowercase();
        name.contains("numeric") || name.contains("decimal")
    }
}

impl<'r> Decode<'r, sqlx::Postgres> for RawDecimal {
    fn decode(value: PgValueRef<'r>) -> Result<Self, sqlx::error::BoxDynError> {
        let s = <&str as Decode<sqlx::Postgres>>::decode(value)?;
        Ok(RawDecimal(s.to_string()))
    }
}

/// Encode binary column data for the JSON boundary.
pub fn encode_binary_value(bytes: &[u8]) -> JsonValue {
    JsonValue::String(STANDARD.encode(bytes))
}

/// Conversion from a driver row to the normalized row map.
pub trait RowToJson {
    fn to_row_map(&self) -> Row;
    fn result_fields(&self) -> Vec<Field>;
}

impl RowToJson for PgRow {
    fn to_row_map(&self) -> Row {
        self.columns()
            .iter()
            .enumerate()
            .map(|(idx, col)| {
                let category = categorize_type(col.type_info().name(), SqlFamily::Postgres);
                let value = postgres::decode_column(self, idx, category);
                (col.name().to_string(), value)
            })
            .collect()
    }

    fn result_fields(&self) -> Vec<Field> {
        self.columns().iter().map(|c| Field::new(c.name())).collect()
    }
}

impl RowToJson for MySqlRow {
    fn to_row_map(&self) -> Row {
        self.columns()
            .iter()
            .enumerate()
            .map(|(idx, col)| {
                let category = categorize_type(col.type_info().name(), SqlFamily::MySql);
                let value = mysql::decode_column(self, idx, category);
                (col.name().to_string(), value)
            })
            .collect()
    }

    fn result_fields(&self) -> Vec<Field> {
        self.columns().iter().map(|c| Field::new(c.name())).collect()
    }
}

impl RowToJson for SqliteRow {
    fn to_row_map(&self) -> Row {
        self.columns()
            .iter()
            .enumerate()
            .map(|(idx, col)| {
                let category = categorize_type(col.type_info().name(), SqlFamily::Sqlite);
                let value = sqlite::decode_column(self, idx, category);
                (col.name().to_string(), value)
            })
            .collect()
    }

    fn result_fields(&self) -> Vec<Field> {
        self.columns().iter().map(|c| Field::new(c.name())).collect()
    }
}

mod postgres {
    use super::*;
    use chrono::{DateTime, FixedOffset, NaiveDate, NaiveDateTime, NaiveTime};

    pub fn decode_column(row: &PgRow, idx: usize, category: TypeCategory) -> JsonValue {
        match category {
            TypeCategory::Decimal => match row.try_get::<Option<RawDecimal>, _>(idx) {
                Ok(Some(v)) => JsonValue::String(v.0),
                _ => JsonValue::Null,
            },
            TypeCategory::Integer => decode_integer(row, idx),
            TypeCategory::Boolean => row
                .try_get::<Option<bool>, _>(idx)
                .ok()
                .flatten()
                .map(JsonValue::Bool)
                .unwrap_or(JsonValue::Null),
            TypeCategory::Float => decode_float(row, idx),
            TypeCategory::Binary => row
                .try_get::<Option<Vec<u8>>, _>(idx)
                .ok()
                .flatten()
                .map(|v| encode_binary_value(&v))
                .unwrap_or(JsonValue::Null),
            TypeCategory::Json => row
                .try_get::<Option<serde_json::Value>, _>(idx)
                .ok()
                .flatten()
                .unwrap_or(JsonValue::Null),
            TypeCategory::Uuid => row
                .try_get::<Option<uuid::Uuid>, _>(idx)
                .ok()
                .flatten()
                .map(|u| JsonValue::String(u.to_string()))
                .unwrap_or(JsonValue::Null),
            TypeCategory::DateTime => decode_temporal(row, idx),
            _ => row
                .try_get::<Option<String>, _>(idx)
                .ok()
                .flatten()
                .map(JsonValue::String)
                .unwrap_or(JsonValue::Null),
        }
    }

    fn decode_integer(row: &PgRow, idx: usize) -> JsonValue {
        if let Ok(None) = row.try_get::<Option<i64>, _>(idx) {
            return JsonValue::Null;
        }
        if let Ok(Some(v)) = row.try_get::<Option<i16>, _>(idx) {
            return JsonValue::Number(v.into());
        }
        if let Ok(Some(v)) = row.try_get::<Option<i32>, _>(idx) {
            return JsonValue::Number(v.into());
        }
        if let Ok(Some(v)) = row.try_get::<Option<i64>, _>(idx) {
            return JsonValue::Number(v.into());
        }
        JsonValue::Null
    }

    fn decode_float(row: &PgRow, idx: usize) -> JsonValue {
        if let Ok(Some(v)) = row.try_get::<Option<f64>, _>(idx) {
            return serde_json::Number::from_f64(v)
                .map(JsonValue::Number)
                .unwrap_or_else(|| JsonValue::String(v.to_string()));
        }
        if let Ok(Some(v)) = row.try_get::<Option<f32>, _>(idx) {
            return serde_json::Number::from_f64(v as f64)
                .map(JsonValue::Number)
                .unwrap_or_else(|| JsonValue::String(v.to_string()));
        }
        JsonValue::Null
    }

    /// DATE/TIMESTAMP/TIMESTAMPTZ come back in their textual form rather
    /// than driver-native temporal values.
    fn decode_temporal(row: &PgRow, idx: usize) -> JsonValue {
        if let Ok(Some(v)) = row.try_get::<Option<NaiveDate>, _>(idx) {
            return JsonValue::String(v.format("%Y-%m-%d").to_string());
        }
        if let Ok(Some(v)) = row.try_get::<Option<NaiveDateTime>, _>(idx) {
            return JsonValue::String(v.format("%Y-%m-%d %H:%M:%S%.f").to_string());
        }
        if let Ok(Some(v)) = row.try_get::<Option<DateTime<FixedOffset>>, _>(idx) {
            return JsonValue::String(v.format("%Y-%m-%d %H:%M:%S%.f%:z").to_string());
        }
        if let Ok(Some(v)) = row.try_get::<Option<NaiveTime>, _>(idx) {
            return JsonValue::String(v.format("%H:%M:%S%.f").to_string());
        }
        // Simple-protocol results arrive as text already.
        row.try_get::<Option<String>, _>(idx)
            .ok()
            .flatten()
            .map(JsonValue::String)
            .unwrap_or(JsonValue::Null)
    }
}

mod mysql {
    use super::*;
    use chrono::{NaiveDate, NaiveDateTime, NaiveTime};

    pub fn decode_column(row: &MySqlRow, idx: usize, category: TypeCategory) -> JsonValue {
        match category {
            TypeCategory::Decimal => match row.try_get::<Option<RawDecimal>, _>(idx) {
                Ok(Some(v)) => JsonValue::String(v.0),
                _ => JsonValue::Null,
            },
            TypeCategory::Integer => decode_integer(row, idx),
            TypeCategory::Boolean => row
                .try_get::<Option<bool>, _>(idx)
                .ok()
                .flatten()
                .map(JsonValue::Bool)
                .unwrap_or(JsonValue::Null),
            TypeCategory::Float => decode_float(row, idx),
            TypeCategory::Binary => decode_binary(row, idx),
            TypeCategory::Json => row
                .try_get::<Option<serde_json::Value>, _>(idx)
                .ok()
                .flatten()
                .unwrap_or(JsonValue::Null),
            TypeCategory::DateTime => decode_temporal(row, idx),
            _ => decode_text(row, idx),
        }
    }

    fn decode_integer(row: &MySqlRow, idx: usize) -> JsonValue {
        if let Ok(None) = row.try_get::<Option<i64>, _>(idx) {
            return JsonValue::Null;
        }
        if let Ok(Some(v)) = row.try_get::<Option<i8>, _>(idx) {
            return JsonValue::Number(v.into());
        }
        if let Ok(Some(v)) = row.try_get::<Option<i16>, _>(idx) {
            return JsonValue::Number(v.into());
        }
        if let Ok(Some(v)) = row.try_get::<Option<i32>, _>(idx) {
            return JsonValue::Number(v.into());
        }
        if let Ok(Some(v)) = row.try_get::<Option<i64>, _>(idx) {
            return JsonValue::Number(v.into());
        }
        if let Ok(Some(v)) = row.try_get::<Option<u64>, _>(idx) {
            return JsonValue::Number(v.into());
        }
        JsonValue::Null
    }

    fn decode_float(row: &MySqlRow, idx: usize) -> JsonValue {
        if let Ok(Some(v)) = row.try_get::<Option<f64>, _>(idx) {
            return serde_json::Number::from_f64(v)
                .map(JsonValue::Number)
                .unwrap_or_else(|| JsonValue::String(v.to_string()));
        }
        if let Ok(Some(v)) = row.try_get::<Option<f32>, _>(idx) {
            return serde_json::Number::from_f64(v as f64)
                .map(JsonValue::Number)
                .unwrap_or_else(|| JsonValue::String(v.to_string()));
        }
        JsonValue::Null
    }

    fn decode_binary(row: &MySqlRow, idx: usize) -> JsonValue {
        row.try_get::<Option<Vec<u8>>, _>(idx)
            .ok()
            .flatten()
            .map(|v| encode_binary_value(&v))
            .unwrap_or(JsonValue::Null)
    }

    fn decode_temporal(row: &MySqlRow, idx: usize) -> JsonValue {
        if let Ok(Some(v)) = row.try_get::<Option<NaiveDate>, _>(idx) {
            return JsonValue::String(v.format("%Y-%m-%d").to_string());
        }
        if let Ok(Some(v)) = row.try_get::<Option<NaiveDateTime>, _>(idx) {
            return JsonValue::String(v.format("%Y-%m-%d %H:%M:%S%.f").to_string());
        }
        if let Ok(Some(v)) = row.try_get::<Option<NaiveTime>, _>(idx) {
            return JsonValue::String(v.format("%H:%M:%S%.f").to_string());
        }
        decode_text(row, idx)
    }

    /// MySQL may report VARBINARY for text depending on charset config.
    fn decode_text(row: &MySqlRow, idx: usize) -> JsonValue {
        if let Ok(Some(v)) = row.try_get::<Option<String>, _>(idx) {
            return JsonValue::String(v);
        }
        if let Ok(Some(bytes)) = row.try_get::<Option<Vec<u8>>, _>(idx) {
            if let Ok(s) = String::from_utf8(bytes) {
                return JsonValue::String(s);
            }
        }
        JsonValue::Null
    }
}

mod sqlite {
    use super::*;

    pub fn decode_column(row: &SqliteRow, idx: usize, category: TypeCategory) -> JsonValue {
        match category {
            TypeCategory::Integer => {
                if let Ok(Some(v)) = row.try_get::<Option<i64>, _>(idx) {
                    return JsonValue::Number(v.into());
                }
                JsonValue::Null
            }
            TypeCategory::Boolean => row
                .try_get::<Option<bool>, _>(idx)
                .ok()
                .flatten()
                .map(JsonValue::Bool)
                .unwrap_or(JsonValue::Null),
            TypeCategory::Float | TypeCategory::Decimal => {
                if let Ok(Some(v)) = row.try_get::<Option<f64>, _>(idx) {
                    return serde_json::Number::from_f64(v)
                        .map(JsonValue::Number)
                        .unwrap_or_else(|| JsonValue::String(v.to_string()));
                }
                JsonValue::Null
            }
            TypeCategory::Binary => row
                .try_get::<Option<Vec<u8>>, _>(idx)
                .ok()
                .flatten()
                .map(|v| encode_binary_value(&v))
                .unwrap_or(JsonValue::Null),
            _ => decode_dynamic(row, idx),
        }
    }

    /// SQLite columns are dynamically typed; untyped expressions need the
    /// full ladder.
    fn decode_dynamic(row: &SqliteRow, idx: usize) -> JsonValue {
        if let Ok(Some(v)) = row.try_get::<Option<String>, _>(idx) {
            return JsonValue::String(v);
        }
        if let Ok(Some(v)) = row.try_get::<Option<i64>, _>(idx) {
            return JsonValue::Number(v.into());
        }
        if let Ok(Some(v)) = row.try_get::<Option<f64>, _>(idx) {
            return serde_json::Number::from_f64(v)
                .map(JsonValue::Number)
                .unwrap_or(JsonValue::Null);
        }
        if let Ok(Some(v)) = row.try_get::<Option<Vec<u8>>, _>(idx) {
            return encode_binary_value(&v);
        }
        JsonValue::Null
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_categorize_integer() {
        assert_eq!(
            categorize_type("INT", SqlFamily::MySql),
            TypeCategory::Integer
        );
        assert_eq!(
            categorize_type("BIGINT", SqlFamily::Postgres),
            TypeCategory::Integer
        );
        assert_eq!(
            categorize_type("SERIAL", SqlFamily::Postgres),
            TypeCategory::Integer
        );
    }

    #[test]
    fn test_categorize_decimal() {
        assert_eq!(
            categorize_type("DECIMAL", SqlFamily::MySql),
            TypeCategory::Decimal
        );
        assert_eq!(
            categorize_type("NUMERIC", SqlFamily::Postgres),
            TypeCategory::Decimal
        );
        // SQLite NUMERIC affinity is a float
        assert_eq!(
            categorize_type("numeric", SqlFamily::Sqlite),
            TypeCategory::Float
        );
    }

    #[test]
    fn test_categorize_temporal() {
        assert_eq!(
            categorize_type("DATE", SqlFamily::Postgres),
            TypeCategory::DateTime
        );
        assert_eq!(
            categorize_type("TIMESTAMPTZ", SqlFamily::Postgres),
            TypeCategory::DateTime
        );
        assert_eq!(
            categorize_type("DATETIME", SqlFamily::MySql),
            TypeCategory::DateTime
        );
    }

    #[test]
    fn test_categorize_misc() {
        assert_eq!(
            categorize_type("jsonb", SqlFamily::Postgres),
            TypeCategory::Json
        );
        assert_eq!(
            categorize_type("uuid", SqlFamily::Postgres),
            TypeCategory::Uuid
        );
        assert_eq!(
            categorize_type("BYTEA", SqlFamily::Postgres),
            TypeCategory::Binary
        );
        assert_eq!(
            categorize_type("VARCHAR", SqlFamily::MySql),
            TypeCategory::Text
        );
        assert_eq!(
            categorize_type("geometry", SqlFamily::Postgres),
            TypeCategory::Unknown
        );
    }

    #[test]
    fn test_encode_binary_value() {
        assert_eq!(
            encode_binary_value(b"hello world"),
            JsonValue::String("aGVsbG8gd29ybGQ=".to_string())
        );
        assert_eq!(encode_binary_value(&[]), JsonValue::String(String::new()));
    }
}
