//! The data type registry: a closed set of column types with literal
//! deduction, parsing, serialization, and a total widening order.
//!
//! Producers deliver every value as a text literal. The registry deduces the
//! narrowest type that can represent a literal, and `max_data_type` widens
//! pairwise so a whole batch ends up with, per column, the widest type any
//! observed literal requires. Widening capacity orders the scalar family as
//!
//! ```text
//! boolean < smallint < integer < bigint < real < double precision
//!         < numeric < timestamp < text
//! ```
//!
//! Arrays form a parallel family ordered the same way among themselves.

use std::fmt;
use std::str::FromStr;

use bigdecimal::BigDecimal;
use chrono::{DateTime, NaiveDateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{StorageError, StorageResult};

/// A column data type known to the storage layer.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DataType {
    /// Boolean flag
    Boolean,
    /// 16-bit integer
    SmallInt,
    /// 32-bit integer
    Integer,
    /// 64-bit integer
    BigInt,
    /// 32-bit float
    Real,
    /// 64-bit float
    DoublePrecision,
    /// Arbitrary-precision decimal
    Numeric,
    /// Timestamp with time zone
    Timestamp,
    /// Variable-length text
    Text,
    /// Array of 16-bit integers
    SmallIntArray,
    /// Array of 32-bit integers
    IntegerArray,
    /// Array of 64-bit integers
    BigIntArray,
    /// Array of 32-bit floats
    RealArray,
    /// Array of 64-bit floats
    DoublePrecisionArray,
    /// Array of arbitrary-precision decimals
    NumericArray,
    /// Array of timestamps
    TimestampArray,
    /// Array of text values
    TextArray,
}

/// All registry types, scalars narrowest-first, then arrays narrowest-first.
pub const ALL_TYPES: &[DataType] = &[
    DataType::Boolean,
    DataType::SmallInt,
    DataType::Integer,
    DataType::BigInt,
    DataType::Real,
    DataType::DoublePrecision,
    DataType::Numeric,
    DataType::Timestamp,
    DataType::Text,
    DataType::SmallIntArray,
    DataType::IntegerArray,
    DataType::BigIntArray,
    DataType::RealArray,
    DataType::DoublePrecisionArray,
    DataType::NumericArray,
    DataType::TimestampArray,
    DataType::TextArray,
];

/// Configuration for literal parsing.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParserConfig {
    /// Literal that denotes NULL. The empty string by default; an empty
    /// string is still a valid value for text columns.
    pub null_value: String,
}

impl Default for ParserConfig {
    fn default() -> Self {
        ParserConfig {
            null_value: String::new(),
        }
    }
}

/// A typed in-memory value, the result of parsing a literal.
#[derive(Clone, Debug, PartialEq)]
pub enum Value {
    /// NULL
    Null,
    /// Boolean value
    Boolean(bool),
    /// 16-bit integer value
    SmallInt(i16),
    /// 32-bit integer value
    Integer(i32),
    /// 64-bit integer value
    BigInt(i64),
    /// 32-bit float value
    Real(f32),
    /// 64-bit float value
    Double(f64),
    /// Arbitrary-precision decimal value
    Numeric(BigDecimal),
    /// Timestamp value
    Timestamp(DateTime<Utc>),
    /// Text value
    Text(String),
    /// Array value
    Array(Vec<Value>),
}

impl DataType {
    fn rank(self) -> u8 {
        match self.element_type() {
            DataType::Boolean => 0,
            DataType::SmallInt => 1,
            DataType::Integer => 2,
            DataType::BigInt => 3,
            DataType::Real => 4,
            DataType::DoublePrecision => 5,
            DataType::Numeric => 6,
            DataType::Timestamp => 7,
            DataType::Text => 8,
            _ => unreachable!("element_type returns scalars"),
        }
    }

    /// Whether this is an array type.
    pub fn is_array(self) -> bool {
        matches!(
            self,
            DataType::SmallIntArray
                | DataType::IntegerArray
                | DataType::BigIntArray
                | DataType::RealArray
                | DataType::DoublePrecisionArray
                | DataType::NumericArray
                | DataType::TimestampArray
                | DataType::TextArray
        )
    }

    /// The element type of an array type; scalars return themselves.
    pub fn element_type(self) -> DataType {
        match self {
            DataType::SmallIntArray => DataType::SmallInt,
            DataType::IntegerArray => DataType::Integer,
            DataType::BigIntArray => DataType::BigInt,
            DataType::RealArray => DataType::Real,
            DataType::DoublePrecisionArray => DataType::DoublePrecision,
            DataType::NumericArray => DataType::Numeric,
            DataType::TimestampArray => DataType::Timestamp,
            DataType::TextArray => DataType::Text,
            scalar => scalar,
        }
    }

    /// The array type with the given element type. Boolean has no array
    /// counterpart and floors at smallint[].
    pub fn array_of(element: DataType) -> DataType {
        match element.element_type() {
            DataType::Boolean | DataType::SmallInt => DataType::SmallIntArray,
            DataType::Integer => DataType::IntegerArray,
            DataType::BigInt => DataType::BigIntArray,
            DataType::Real => DataType::RealArray,
            DataType::DoublePrecision => DataType::DoublePrecisionArray,
            DataType::Numeric => DataType::NumericArray,
            DataType::Timestamp => DataType::TimestampArray,
            DataType::Text => DataType::TextArray,
            _ => unreachable!("element_type returns scalars"),
        }
    }

    /// The SQL rendering of this type.
    pub fn sql_type(self) -> &'static str {
        match self {
            DataType::Boolean => "boolean",
            DataType::SmallInt => "smallint",
            DataType::Integer => "integer",
            DataType::BigInt => "bigint",
            DataType::Real => "real",
            DataType::DoublePrecision => "double precision",
            DataType::Numeric => "numeric",
            DataType::Timestamp => "timestamp with time zone",
            DataType::Text => "text",
            DataType::SmallIntArray => "smallint[]",
            DataType::IntegerArray => "integer[]",
            DataType::BigIntArray => "bigint[]",
            DataType::RealArray => "real[]",
            DataType::DoublePrecisionArray => "double precision[]",
            DataType::NumericArray => "numeric[]",
            DataType::TimestampArray => "timestamp with time zone[]",
            DataType::TextArray => "text[]",
        }
    }

    /// Map a PostgreSQL type name (`udt_name` from `information_schema`) back
    /// to a registry type.
    pub fn from_pg_name(name: &str) -> Option<DataType> {
        let dt = match name {
            "bool" | "boolean" => DataType::Boolean,
            "int2" | "smallint" => DataType::SmallInt,
            "int4" | "integer" => DataType::Integer,
            "int8" | "bigint" => DataType::BigInt,
            "float4" | "real" => DataType::Real,
            "float8" | "double precision" => DataType::DoublePrecision,
            "numeric" => DataType::Numeric,
            "timestamptz" | "timestamp" => DataType::Timestamp,
            "text" | "varchar" => DataType::Text,
            "_int2" => DataType::SmallIntArray,
            "_int4" => DataType::IntegerArray,
            "_int8" => DataType::BigIntArray,
            "_float4" => DataType::RealArray,
            "_float8" => DataType::DoublePrecisionArray,
            "_numeric" => DataType::NumericArray,
            "_timestamptz" | "_timestamp" => DataType::TimestampArray,
            "_text" | "_varchar" => DataType::TextArray,
            _ => return None,
        };
        Some(dt)
    }

    /// Whether a literal belongs to this type.
    pub fn matches(self, literal: &str) -> bool {
        let literal = literal.trim();
        match self {
            // Only the word forms deduce as boolean; "1"/"0" must stay
            // counters.
            DataType::Boolean => matches!(literal, "true" | "false" | "t" | "f"),
            DataType::SmallInt => literal.parse::<i16>().is_ok(),
            DataType::Integer => literal.parse::<i32>().is_ok(),
            DataType::BigInt => literal.parse::<i64>().is_ok(),
            DataType::Real => float_fits::<f32>(literal),
            DataType::DoublePrecision => float_fits::<f64>(literal),
            DataType::Numeric => BigDecimal::from_str(literal).is_ok(),
            DataType::Timestamp => parse_timestamp(literal).is_some(),
            DataType::Text => true,
            _ => {
                self.is_array()
                    && split_array_literal(literal).is_some_and(|elements| {
                        elements
                            .iter()
                            .all(|e| e.is_empty() || self.element_type().matches(e))
                    })
            }
        }
    }

    /// Deduce the narrowest type that can represent a literal.
    ///
    /// The empty string denotes NULL for every non-text type and deduces to
    /// smallint, the narrowest column default.
    pub fn deduce(literal: &str) -> DataType {
        let trimmed = literal.trim();
        if trimmed.is_empty() {
            return DataType::SmallInt;
        }
        if let Some(elements) = split_array_literal(trimmed) {
            let element = elements
                .iter()
                .filter(|e| !e.is_empty())
                .map(|e| DataType::deduce(e))
                .fold(None, |acc: Option<DataType>, dt| {
                    Some(acc.map_or(dt, |a| max_data_type(a, dt)))
                })
                .unwrap_or(DataType::SmallInt);
            return DataType::array_of(element);
        }
        for dt in ALL_TYPES.iter().copied().filter(|dt| !dt.is_array()) {
            if dt.matches(trimmed) {
                return dt;
            }
        }
        DataType::Text
    }

    /// Parse a literal as this type.
    ///
    /// Parsers are total along the widening chain: any literal a narrower
    /// type accepts is also accepted by every wider type, so a column
    /// deduced from mixed literals can parse all of them. Boolean words
    /// become 0/1 for the numeric types; plain numbers are Unix epoch
    /// seconds for timestamps.
    pub fn parse(self, config: &ParserConfig, literal: &str) -> StorageResult<Value> {
        // The configured null marker is NULL for every type; the implicit
        // empty-string marker is exempt for text, where "" is a real value.
        if literal == config.null_value
            && !(self == DataType::Text && config.null_value.is_empty())
        {
            return Ok(Value::Null);
        }
        let fail = || StorageError::ParseValue {
            literal: literal.to_string(),
            data_type: self.sql_type().to_string(),
        };
        let trimmed = literal.trim();
        if trimmed.is_empty() && self != DataType::Text {
            return Ok(Value::Null);
        }
        match self {
            DataType::Boolean => match trimmed {
                "true" | "t" | "1" => Ok(Value::Boolean(true)),
                "false" | "f" | "0" => Ok(Value::Boolean(false)),
                _ => Err(fail()),
            },
            DataType::SmallInt => int_literal::<i16>(trimmed).map(Value::SmallInt).ok_or_else(fail),
            DataType::Integer => int_literal::<i32>(trimmed).map(Value::Integer).ok_or_else(fail),
            DataType::BigInt => int_literal::<i64>(trimmed).map(Value::BigInt).ok_or_else(fail),
            DataType::Real => float_literal(trimmed)
                .map(|v| Value::Real(v as f32))
                .ok_or_else(fail),
            DataType::DoublePrecision => {
                float_literal(trimmed).map(Value::Double).ok_or_else(fail)
            }
            // Arbitrary-precision literals never route through float parsing.
            DataType::Numeric => numeric_literal(trimmed).map(Value::Numeric).ok_or_else(fail),
            DataType::Timestamp => timestamp_literal(trimmed)
                .map(Value::Timestamp)
                .ok_or_else(fail),
            DataType::Text => Ok(Value::Text(literal.to_string())),
            _ => {
                let elements = split_array_literal(trimmed).ok_or_else(fail)?;
                let element_type = self.element_type();
                let values = elements
                    .iter()
                    .map(|e| element_type.parse(config, e))
                    .collect::<StorageResult<Vec<_>>>()?;
                Ok(Value::Array(values))
            }
        }
    }

    /// Serialize a value of this type for the line-oriented bulk transfer
    /// encoding. NULL renders as `\N`; transport-level escaping of text
    /// payloads is the transfer protocol's concern.
    pub fn serialize(self, value: &Value) -> String {
        serialize_value(value)
    }
}

impl fmt::Display for DataType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.sql_type())
    }
}

/// The wider of two types: the operand ranked higher in the widening order.
/// Commutative and idempotent. An array operand against a scalar operand
/// widens to the array of the wider element type.
pub fn max_data_type(a: DataType, b: DataType) -> DataType {
    let element = if a.rank() >= b.rank() {
        a.element_type()
    } else {
        b.element_type()
    };
    if a.is_array() || b.is_array() {
        DataType::array_of(element)
    } else {
        element
    }
}

/// Deduce, per column, the widest type needed to represent every literal
/// observed in that column across all rows. Must run before any DDL
/// comparison. Empty literals are NULL and do not contribute; a column with
/// no non-empty literal defaults to smallint.
pub fn deduce_data_types<'a, I>(column_count: usize, rows: I) -> Vec<DataType>
where
    I: IntoIterator<Item = &'a [String]>,
{
    let mut deduced: Vec<Option<DataType>> = vec![None; column_count];
    for row in rows {
        for (slot, literal) in deduced.iter_mut().zip(row.iter()) {
            if literal.trim().is_empty() {
                continue;
            }
            let dt = DataType::deduce(literal);
            *slot = Some(slot.map_or(dt, |current| max_data_type(current, dt)));
        }
    }
    deduced
        .into_iter()
        .map(|slot| slot.unwrap_or(DataType::SmallInt))
        .collect()
}

fn serialize_value(value: &Value) -> String {
    match value {
        Value::Null => "\\N".to_string(),
        Value::Boolean(true) => "t".to_string(),
        Value::Boolean(false) => "f".to_string(),
        Value::SmallInt(v) => v.to_string(),
        Value::Integer(v) => v.to_string(),
        Value::BigInt(v) => v.to_string(),
        Value::Real(v) => v.to_string(),
        Value::Double(v) => v.to_string(),
        Value::Numeric(v) => v.to_string(),
        Value::Timestamp(ts) => ts.format("%Y-%m-%d %H:%M:%S%.6f+00").to_string(),
        Value::Text(s) => s.clone(),
        Value::Array(elements) => {
            let rendered: Vec<String> = elements
                .iter()
                .map(|e| match e {
                    Value::Null => "NULL".to_string(),
                    Value::Text(s) => format!("\"{}\"", s.replace('\\', "\\\\").replace('"', "\\\"")),
                    other => serialize_value(other),
                })
                .collect();
            format!("{{{}}}", rendered.join(","))
        }
    }
}

/// Whether a literal parses as a float of type `F` without losing precision.
/// Literals with more significant digits than `F` can carry fall through to
/// the wider float or to numeric.
fn float_fits<F>(literal: &str) -> bool
where
    F: FromStr + fmt::Display,
{
    let Ok(parsed) = literal.parse::<F>() else {
        return false;
    };
    let (Ok(exact), Ok(round_trip)) = (
        BigDecimal::from_str(literal),
        BigDecimal::from_str(&parsed.to_string()),
    ) else {
        return false;
    };
    exact == round_trip
}

fn boolean_literal(literal: &str) -> Option<bool> {
    match literal {
        "true" | "t" => Some(true),
        "false" | "f" => Some(false),
        _ => None,
    }
}

fn int_literal<T>(literal: &str) -> Option<T>
where
    T: FromStr + From<bool>,
{
    literal
        .parse()
        .ok()
        .or_else(|| boolean_literal(literal).map(T::from))
}

fn float_literal(literal: &str) -> Option<f64> {
    literal
        .parse()
        .ok()
        .or_else(|| boolean_literal(literal).map(|b| if b { 1.0 } else { 0.0 }))
}

fn numeric_literal(literal: &str) -> Option<BigDecimal> {
    BigDecimal::from_str(literal)
        .ok()
        .or_else(|| boolean_literal(literal).map(|b| BigDecimal::from(i32::from(b))))
}

fn timestamp_literal(literal: &str) -> Option<DateTime<Utc>> {
    parse_timestamp(literal).or_else(|| {
        // A plain number widened into a timestamp column is Unix epoch
        // seconds.
        let seconds = literal.parse::<f64>().ok()?;
        DateTime::from_timestamp_micros((seconds * 1_000_000.0) as i64)
    })
}

fn parse_timestamp(literal: &str) -> Option<DateTime<Utc>> {
    if let Ok(ts) = DateTime::parse_from_rfc3339(literal) {
        return Some(ts.with_timezone(&Utc));
    }
    for format in ["%Y-%m-%d %H:%M:%S%.f", "%Y-%m-%d %H:%M:%S"] {
        if let Ok(naive) = NaiveDateTime::parse_from_str(literal, format) {
            return Some(Utc.from_utc_datetime(&naive));
        }
    }
    None
}

fn split_array_literal(literal: &str) -> Option<Vec<String>> {
    let inner = literal.strip_prefix('{')?.strip_suffix('}')?;
    if inner.trim().is_empty() {
        return Some(Vec::new());
    }
    Some(inner.split(',').map(|e| e.trim().to_string()).collect())
}
