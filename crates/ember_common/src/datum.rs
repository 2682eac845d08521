use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::ExecutionError;
use crate::types::DataType;

/// A single scalar value.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Datum {
    Null,
    Boolean(bool),
    Int32(i32),
    Int64(i64),
    Float64(f64),
    Text(String),
    Bytea(Vec<u8>),
}

impl Datum {
    pub fn data_type(&self) -> Option<DataType> {
        match self {
            Datum::Null => None,
            Datum::Boolean(_) => Some(DataType::Boolean),
            Datum::Int32(_) => Some(DataType::Int32),
            Datum::Int64(_) => Some(DataType::Int64),
            Datum::Float64(_) => Some(DataType::Float64),
            Datum::Text(_) => Some(DataType::Text),
            Datum::Bytea(_) => Some(DataType::Bytea),
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Datum::Null)
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Datum::Int32(v) => Some(*v as i64),
            Datum::Int64(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Datum::Int32(v) => Some(*v as f64),
            Datum::Int64(v) => Some(*v as f64),
            Datum::Float64(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Datum::Text(s) => Some(s.as_str()),
            _ => None,
        }
    }

    /// SQL equality: NULL compares unequal to everything, numerics compare
    /// across widths.
    pub fn sql_eq(&self, other: &Datum) -> bool {
        match (self, other) {
            (Datum::Null, _) | (_, Datum::Null) => false,
            (Datum::Float64(_), _) | (_, Datum::Float64(_)) => {
                match (self.as_f64(), other.as_f64()) {
                    (Some(a), Some(b)) => a == b,
                    _ => false,
                }
            }
            (a, b) if a.as_i64().is_some() && b.as_i64().is_some() => a.as_i64() == b.as_i64(),
            _ => self == other,
        }
    }

    /// Encode to PG text format.
    pub fn to_pg_text(&self) -> Option<String> {
        match self {
            Datum::Null => None,
            Datum::Boolean(b) => Some(if *b { "t".into() } else { "f".into() }),
            Datum::Int32(v) => Some(v.to_string()),
            Datum::Int64(v) => Some(v.to_string()),
            Datum::Float64(v) => Some(format_float8(*v)),
            Datum::Text(s) => Some(s.clone()),
            Datum::Bytea(bytes) => {
                let mut out = String::with_capacity(2 + bytes.len() * 2);
                out.push_str("\\x");
                for b in bytes {
                    out.push_str(&format!("{b:02x}"));
                }
                Some(out)
            }
        }
    }

    /// Encode to PG binary (send) format.
    pub fn to_pg_binary(&self) -> Option<Vec<u8>> {
        match self {
            Datum::Null => None,
            Datum::Boolean(b) => Some(vec![u8::from(*b)]),
            Datum::Int32(v) => Some(v.to_be_bytes().to_vec()),
            Datum::Int64(v) => Some(v.to_be_bytes().to_vec()),
            Datum::Float64(v) => Some(v.to_be_bytes().to_vec()),
            Datum::Text(s) => Some(s.as_bytes().to_vec()),
            Datum::Bytea(b) => Some(b.clone()),
        }
    }

    /// Run the type's text input function.
    pub fn from_pg_text(data_type: DataType, text: &str) -> Result<Datum, ExecutionError> {
        let invalid = || ExecutionError::InvalidTextRepresentation {
            type_name: data_type.to_string(),
            value: text.to_string(),
        };
        let trimmed = text.trim();
        match data_type {
            DataType::Boolean => match trimmed.to_ascii_lowercase().as_str() {
                "t" | "true" | "y" | "yes" | "on" | "1" => Ok(Datum::Boolean(true)),
                "f" | "false" | "n" | "no" | "off" | "0" => Ok(Datum::Boolean(false)),
                _ => Err(invalid()),
            },
            DataType::Int32 => {
                let wide: i64 = trimmed.parse().map_err(|_| invalid())?;
                i32::try_from(wide)
                    .map(Datum::Int32)
                    .map_err(|_| ExecutionError::NumericOutOfRange {
                        type_name: data_type.to_string(),
                        value: text.to_string(),
                    })
            }
            DataType::Int64 => {
                let wide: i128 = trimmed.parse().map_err(|_| invalid())?;
                i64::try_from(wide)
                    .map(Datum::Int64)
                    .map_err(|_| ExecutionError::NumericOutOfRange {
                        type_name: data_type.to_string(),
                        value: text.to_string(),
                    })
            }
            DataType::Float64 => match trimmed.to_ascii_lowercase().as_str() {
                "nan" => Ok(Datum::Float64(f64::NAN)),
                "infinity" | "+infinity" | "inf" => Ok(Datum::Float64(f64::INFINITY)),
                "-infinity" | "-inf" => Ok(Datum::Float64(f64::NEG_INFINITY)),
                _ => trimmed.parse().map(Datum::Float64).map_err(|_| invalid()),
            },
            DataType::Text => Ok(Datum::Text(text.to_string())),
            DataType::Bytea => {
                if let Some(hex) = text.strip_prefix("\\x") {
                    decode_hex(hex).map(Datum::Bytea).ok_or_else(invalid)
                } else {
                    Ok(Datum::Bytea(text.as_bytes().to_vec()))
                }
            }
        }
    }

    /// Run the type's binary receive function. The whole buffer must be
    /// consumed; `param_index` is 1-based and only used for the error.
    pub fn from_pg_binary(
        data_type: DataType,
        bytes: &[u8],
        param_index: usize,
    ) -> Result<Datum, ExecutionError> {
        let bad = || ExecutionError::InvalidBinaryFormat(param_index);
        match data_type {
            DataType::Boolean => match bytes {
                [b] => Ok(Datum::Boolean(*b != 0)),
                _ => Err(bad()),
            },
            DataType::Int32 => {
                let arr: [u8; 4] = bytes.try_into().map_err(|_| bad())?;
                Ok(Datum::Int32(i32::from_be_bytes(arr)))
            }
            DataType::Int64 => {
                let arr: [u8; 8] = bytes.try_into().map_err(|_| bad())?;
                Ok(Datum::Int64(i64::from_be_bytes(arr)))
            }
            DataType::Float64 => {
                let arr: [u8; 8] = bytes.try_into().map_err(|_| bad())?;
                Ok(Datum::Float64(f64::from_be_bytes(arr)))
            }
            DataType::Text => std::str::from_utf8(bytes)
                .map(|s| Datum::Text(s.to_string()))
                .map_err(|_| ExecutionError::InvalidEncoding),
            DataType::Bytea => Ok(Datum::Bytea(bytes.to_vec())),
        }
    }

    /// Assignment-style coercion to a column type. NULL stays NULL.
    pub fn coerce_to(&self, target: DataType) -> Result<Datum, ExecutionError> {
        if self.data_type() == Some(target) || self.is_null() {
            return Ok(self.clone());
        }
        let out_of_range = || ExecutionError::NumericOutOfRange {
            type_name: target.to_string(),
            value: self.to_string(),
        };
        match (self, target) {
            (Datum::Int32(v), DataType::Int64) => Ok(Datum::Int64(*v as i64)),
            (Datum::Int64(v), DataType::Int32) => {
                i32::try_from(*v).map(Datum::Int32).map_err(|_| out_of_range())
            }
            (Datum::Int32(v), DataType::Float64) => Ok(Datum::Float64(*v as f64)),
            (Datum::Int64(v), DataType::Float64) => Ok(Datum::Float64(*v as f64)),
            (Datum::Text(s), _) => Datum::from_pg_text(target, s),
            (_, DataType::Text) => Ok(Datum::Text(self.to_string())),
            _ => Err(ExecutionError::TypeError(format!(
                "cannot convert {} to {}",
                self.data_type().map(|t| t.to_string()).unwrap_or_default(),
                target
            ))),
        }
    }
}

fn format_float8(v: f64) -> String {
    if v.is_nan() {
        "NaN".into()
    } else if v.is_infinite() {
        if v > 0.0 { "Infinity".into() } else { "-Infinity".into() }
    } else {
        v.to_string()
    }
}

fn decode_hex(hex: &str) -> Option<Vec<u8>> {
    if hex.len() % 2 != 0 {
        return None;
    }
    (0..hex.len())
        .step_by(2)
        .map(|i| hex.get(i..i + 2).and_then(|pair| u8::from_str_radix(pair, 16).ok()))
        .collect()
}

impl fmt::Display for Datum {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.to_pg_text() {
            Some(text) => f.write_str(&text),
            None => f.write_str("NULL"),
        }
    }
}

impl PartialEq for Datum {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Datum::Null, Datum::Null) => true,
            (Datum::Boolean(a), Datum::Boolean(b)) => a == b,
            (Datum::Int32(a), Datum::Int32(b)) => a == b,
            (Datum::Int64(a), Datum::Int64(b)) => a == b,
            (Datum::Float64(a), Datum::Float64(b)) => a.to_bits() == b.to_bits(),
            (Datum::Text(a), Datum::Text(b)) => a == b,
            (Datum::Bytea(a), Datum::Bytea(b)) => a == b,
            _ => false,
        }
    }
}

/// A row is an ordered list of datums.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OwnedRow {
    pub values: Vec<Datum>,
}

impl OwnedRow {
    pub fn new(values: Vec<Datum>) -> Self {
        Self { values }
    }

    pub fn get(&self, idx: usize) -> Option<&Datum> {
        self.values.get(idx)
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

impl fmt::Display for OwnedRow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "(")?;
        for (i, v) in self.values.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{}", v)?;
        }
        write!(f, ")")
    }
}
