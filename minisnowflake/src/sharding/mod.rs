//! Row batches, typed values and shard files.
//!
//! A [`Batch`] is the unit of data everywhere in the system: the content of a
//! shard file on disk, a partial result returned by a worker, and the final
//! query result. Cells are [`Value`]s typed by the column's [`DataType`].

use std::cmp::Ordering;
use std::fmt;
use std::fs::{create_dir_all, rename, File};
use std::hash::{Hash, Hasher};
use std::io::{BufReader, BufWriter};
use std::path::Path;
use std::str::FromStr;

use chrono::NaiveDateTime;
use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use thiserror::Error;

pub mod csv;

#[derive(Debug, Error)]
pub enum Error {
    #[error("unknown type \"{0}\"")]
    UnknownType(String),

    #[error("can't decode {0} as {1}")]
    Decode(String, DataType),

    #[error("value of type {0} where {1} was expected")]
    TypeMismatch(DataType, &'static str),

    #[error("batch schemas don't match: {0}")]
    SchemaMismatch(String),

    #[error("null value in NOT NULL column \"{0}\"")]
    NullViolation(String),

    #[error("{0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Json(#[from] serde_json::Error),

    #[error("csv: {0}")]
    Csv(String),
}

/// Normalized column type. Every alias accepted by the dialect maps
/// onto one of these.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DataType {
    TinyInt,
    SmallInt,
    Integer,
    BigInt,
    BigNum,
    UTinyInt,
    USmallInt,
    UInteger,
    UBigInt,
    Float,
    Double,
    Decimal,
    Boolean,
    Varchar,
    Uuid,
    Bit,
    Blob,
    Date,
    Time,
    Timestamp,
    Interval,
}

/// How a type is represented at runtime.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorageClass {
    Integer,
    Real,
    Boolean,
    Text,
    Timestamp,
}

impl DataType {
    pub fn storage_class(&self) -> StorageClass {
        use DataType::*;

        match self {
            TinyInt | SmallInt | Integer | BigInt | UTinyInt | USmallInt | UInteger | UBigInt => {
                StorageClass::Integer
            }
            Float | Double | Decimal | BigNum => StorageClass::Real,
            Boolean => StorageClass::Boolean,
            Varchar | Uuid | Bit | Blob | Date | Time | Interval => StorageClass::Text,
            Timestamp => StorageClass::Timestamp,
        }
    }

    /// Result type of SUM over a column of this type.
    pub fn sum_type(&self) -> DataType {
        match self.storage_class() {
            StorageClass::Integer => DataType::BigInt,
            _ => DataType::Double,
        }
    }

    pub fn as_str(&self) -> &'static str {
        use DataType::*;

        match self {
            TinyInt => "TINYINT",
            SmallInt => "SMALLINT",
            Integer => "INTEGER",
            BigInt => "BIGINT",
            BigNum => "BIGNUM",
            UTinyInt => "UTINYINT",
            USmallInt => "USMALLINT",
            UInteger => "UINTEGER",
            UBigInt => "UBIGINT",
            Float => "FLOAT",
            Double => "DOUBLE",
            Decimal => "DECIMAL",
            Boolean => "BOOLEAN",
            Varchar => "VARCHAR",
            Uuid => "UUID",
            Bit => "BIT",
            Blob => "BLOB",
            Date => "DATE",
            Time => "TIME",
            Timestamp => "TIMESTAMP",
            Interval => "INTERVAL",
        }
    }
}

impl fmt::Display for DataType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for DataType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        use DataType::*;

        let name = s.to_ascii_uppercase();
        Ok(match name.as_str() {
            "TINYINT" => TinyInt,
            "SMALLINT" => SmallInt,
            "INT" | "INTEGER" => Integer,
            "BIGINT" | "HUGEINT" => BigInt,
            "BIGNUM" => BigNum,
            "UTINYINT" => UTinyInt,
            "USMALLINT" => USmallInt,
            "UINTEGER" => UInteger,
            "UBIGINT" | "UHUGEINT" => UBigInt,
            "FLOAT" | "REAL" => Float,
            "DOUBLE" => Double,
            "DECIMAL" | "NUMERIC" => Decimal,
            "BOOLEAN" | "BOOL" => Boolean,
            "VARCHAR" | "TEXT" | "STRING" | "CHAR" => Varchar,
            "UUID" => Uuid,
            "BIT" => Bit,
            "BLOB" | "BYTEA" | "VARBINARY" => Blob,
            "DATE" => Date,
            "TIME" => Time,
            "TIMESTAMP" | "TIMESTAMPTZ" => Timestamp,
            "INTERVAL" => Interval,
            _ => return Err(Error::UnknownType(s.to_string())),
        })
    }
}

impl Serialize for DataType {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for DataType {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(D::Error::custom)
    }
}

/// A runtime value.
#[derive(Debug, Clone)]
pub enum Value {
    Null,
    Bigint(i64),
    Double(f64),
    Boolean(bool),
    Text(String),
    Timestamp(NaiveDateTime),
}

impl Value {
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    /// SQL comparison. NULL compared to anything, or values of
    /// incompatible types, yield no ordering.
    pub fn compare(&self, other: &Value) -> Option<Ordering> {
        use Value::*;

        match (self, other) {
            (Null, _) | (_, Null) => None,
            (Bigint(a), Bigint(b)) => Some(a.cmp(b)),
            (Double(a), Double(b)) => a.partial_cmp(b),
            (Bigint(a), Double(b)) => (*a as f64).partial_cmp(b),
            (Double(a), Bigint(b)) => a.partial_cmp(&(*b as f64)),
            (Boolean(a), Boolean(b)) => Some(a.cmp(b)),
            (Text(a), Text(b)) => Some(a.cmp(b)),
            (Timestamp(a), Timestamp(b)) => Some(a.cmp(b)),
            _ => None,
        }
    }

    /// Numeric addition used by SUM and COUNT accumulation.
    pub fn add(&self, other: &Value) -> Result<Value, Error> {
        use Value::*;

        Ok(match (self, other) {
            (Null, _) => other.clone(),
            (_, Null) => self.clone(),
            (Bigint(a), Bigint(b)) => Bigint(a + b),
            (Double(a), Double(b)) => Double(a + b),
            (Bigint(a), Double(b)) => Double(*a as f64 + b),
            (Double(a), Bigint(b)) => Double(a + *b as f64),
            (other, _) => return Err(Error::TypeMismatch(other.data_type(), "number")),
        })
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Bigint(v) => Some(*v as f64),
            Value::Double(v) => Some(*v),
            _ => None,
        }
    }

    fn data_type(&self) -> DataType {
        match self {
            Value::Null => DataType::Varchar,
            Value::Bigint(_) => DataType::BigInt,
            Value::Double(_) => DataType::Double,
            Value::Boolean(_) => DataType::Boolean,
            Value::Text(_) => DataType::Varchar,
            Value::Timestamp(_) => DataType::Timestamp,
        }
    }

    /// Decode a JSON cell given the column type.
    pub fn from_json(cell: &serde_json::Value, data_type: &DataType) -> Result<Value, Error> {
        if cell.is_null() {
            return Ok(Value::Null);
        }

        let fail = || Error::Decode(cell.to_string(), *data_type);

        Ok(match data_type.storage_class() {
            StorageClass::Integer => Value::Bigint(cell.as_i64().ok_or_else(fail)?),
            StorageClass::Real => Value::Double(cell.as_f64().ok_or_else(fail)?),
            StorageClass::Boolean => Value::Boolean(cell.as_bool().ok_or_else(fail)?),
            StorageClass::Text => Value::Text(cell.as_str().ok_or_else(fail)?.to_string()),
            StorageClass::Timestamp => {
                let text = cell.as_str().ok_or_else(fail)?;
                Value::Timestamp(parse_timestamp(text).ok_or_else(fail)?)
            }
        })
    }

    /// Parse a text field (CSV) given the column type. Empty fields are NULL.
    pub fn from_text(field: &str, data_type: &DataType) -> Result<Value, Error> {
        if field.is_empty() {
            return Ok(Value::Null);
        }

        let fail = || Error::Decode(field.to_string(), *data_type);

        Ok(match data_type.storage_class() {
            StorageClass::Integer => Value::Bigint(field.parse().map_err(|_| fail())?),
            StorageClass::Real => Value::Double(field.parse().map_err(|_| fail())?),
            StorageClass::Boolean => match field.to_ascii_lowercase().as_str() {
                "true" | "t" | "1" => Value::Boolean(true),
                "false" | "f" | "0" => Value::Boolean(false),
                _ => return Err(fail()),
            },
            StorageClass::Text => Value::Text(field.to_string()),
            StorageClass::Timestamp => Value::Timestamp(parse_timestamp(field).ok_or_else(fail)?),
        })
    }
}

fn parse_timestamp(text: &str) -> Option<NaiveDateTime> {
    text.parse()
        .ok()
        .or_else(|| NaiveDateTime::parse_from_str(text, "%Y-%m-%d %H:%M:%S%.f").ok())
}

impl Serialize for Value {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            Value::Null => serializer.serialize_unit(),
            Value::Bigint(v) => serializer.serialize_i64(*v),
            Value::Double(v) => serializer.serialize_f64(*v),
            Value::Boolean(v) => serializer.serialize_bool(*v),
            Value::Text(v) => serializer.serialize_str(v),
            Value::Timestamp(v) => {
                serializer.serialize_str(&v.format("%Y-%m-%dT%H:%M:%S%.6f").to_string())
            }
        }
    }
}

// Grouping keys hash doubles by bit pattern so Eq and Hash agree.
impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        use Value::*;

        match (self, other) {
            (Null, Null) => true,
            (Bigint(a), Bigint(b)) => a == b,
            (Double(a), Double(b)) => a.to_bits() == b.to_bits(),
            (Boolean(a), Boolean(b)) => a == b,
            (Text(a), Text(b)) => a == b,
            (Timestamp(a), Timestamp(b)) => a == b,
            _ => false,
        }
    }
}

impl Eq for Value {}

impl Hash for Value {
    fn hash<H: Hasher>(&self, state: &mut H) {
        match self {
            Value::Null => 0u8.hash(state),
            Value::Bigint(v) => {
                1u8.hash(state);
                v.hash(state);
            }
            Value::Double(v) => {
                2u8.hash(state);
                v.to_bits().hash(state);
            }
            Value::Boolean(v) => {
                3u8.hash(state);
                v.hash(state);
            }
            Value::Text(v) => {
                4u8.hash(state);
                v.hash(state);
            }
            Value::Timestamp(v) => {
                5u8.hash(state);
                v.hash(state);
            }
        }
    }
}

/// Table column.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Column {
    pub name: String,
    pub data_type: DataType,
    #[serde(default)]
    pub not_null: bool,
}

/// Ordered set of columns with unique names.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Schema {
    pub columns: Vec<Column>,
}

impl Schema {
    pub fn new(columns: Vec<Column>) -> Self {
        Self { columns }
    }

    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|c| c.name == name)
    }

    pub fn column(&self, name: &str) -> Option<&Column> {
        self.columns.iter().find(|c| c.name == name)
    }

    pub fn names(&self) -> Vec<String> {
        self.columns.iter().map(|c| c.name.clone()).collect()
    }

    pub fn types(&self) -> Vec<DataType> {
        self.columns.iter().map(|c| c.data_type).collect()
    }
}

/// In-memory row batch: a partial result, a shard's content, or a
/// final query result.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Batch {
    pub columns: Vec<String>,
    pub types: Vec<DataType>,
    pub rows: Vec<Vec<Value>>,
}

impl Batch {
    pub fn new(columns: Vec<String>, types: Vec<DataType>) -> Self {
        Self {
            columns,
            types,
            rows: vec![],
        }
    }

    pub fn row_count(&self) -> usize {
        self.rows.len()
    }

    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|c| c == name)
    }

    /// Same column names and types, in the same order.
    pub fn schema_matches(&self, other: &Batch) -> bool {
        self.columns == other.columns && self.types == other.types
    }

    /// Concatenate batches, preserving input order. All batches must share
    /// the schema of the first one.
    pub fn concat(batches: Vec<Batch>) -> Result<Batch, Error> {
        let mut batches = batches.into_iter();
        let mut result = match batches.next() {
            Some(first) => first,
            None => return Ok(Batch::new(vec![], vec![])),
        };

        for batch in batches {
            if !result.schema_matches(&batch) {
                return Err(Error::SchemaMismatch(format!(
                    "{:?} vs {:?}",
                    result.columns, batch.columns
                )));
            }
            result.rows.extend(batch.rows);
        }

        Ok(result)
    }
}

// Cells arrive as untyped JSON scalars; the embedded types drive decoding.
impl<'de> Deserialize<'de> for Batch {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        #[derive(Deserialize)]
        struct Raw {
            columns: Vec<String>,
            types: Vec<DataType>,
            rows: Vec<Vec<serde_json::Value>>,
        }

        let raw = Raw::deserialize(deserializer)?;
        let mut rows = Vec::with_capacity(raw.rows.len());

        for raw_row in raw.rows {
            if raw_row.len() != raw.types.len() {
                return Err(D::Error::custom(format!(
                    "row has {} cells, schema has {} columns",
                    raw_row.len(),
                    raw.types.len()
                )));
            }
            let mut row = Vec::with_capacity(raw_row.len());
            for (cell, data_type) in raw_row.iter().zip(raw.types.iter()) {
                row.push(Value::from_json(cell, data_type).map_err(D::Error::custom)?);
            }
            rows.push(row);
        }

        Ok(Batch {
            columns: raw.columns,
            types: raw.types,
            rows,
        })
    }
}

/// Write a shard file atomically: write a temp file next to the target,
/// then rename it into place.
pub fn write_shard(path: &Path, batch: &Batch) -> Result<(), Error> {
    if let Some(parent) = path.parent() {
        create_dir_all(parent)?;
    }

    let tmp = path.with_extension("tmp");
    let file = File::create(&tmp)?;
    serde_json::to_writer(BufWriter::new(file), batch)?;
    rename(&tmp, path)?;

    Ok(())
}

/// Read a shard file.
pub fn read_shard(path: &Path) -> Result<Batch, Error> {
    let file = File::open(path)?;
    Ok(serde_json::from_reader(BufReader::new(file))?)
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_type_aliases_normalize() {
        assert_eq!("int".parse::<DataType>().unwrap(), DataType::Integer);
        assert_eq!("HUGEINT".parse::<DataType>().unwrap(), DataType::BigInt);
        assert_eq!("text".parse::<DataType>().unwrap(), DataType::Varchar);
        assert_eq!("real".parse::<DataType>().unwrap(), DataType::Float);
        assert_eq!("numeric".parse::<DataType>().unwrap(), DataType::Decimal);
        assert_eq!(
            "timestamptz".parse::<DataType>().unwrap(),
            DataType::Timestamp
        );
        assert!("point".parse::<DataType>().is_err());
    }

    #[test]
    fn test_compare_null_and_mixed() {
        assert!(Value::Null.compare(&Value::Bigint(1)).is_none());
        assert!(Value::Bigint(1).compare(&Value::Null).is_none());
        assert_eq!(
            Value::Bigint(2).compare(&Value::Double(1.5)),
            Some(Ordering::Greater)
        );
        assert!(Value::Text("a".into()).compare(&Value::Bigint(1)).is_none());
    }

    #[test]
    fn test_add_promotes_to_double() {
        let sum = Value::Bigint(2).add(&Value::Double(0.5)).unwrap();
        assert_eq!(sum, Value::Double(2.5));
        let sum = Value::Null.add(&Value::Bigint(3)).unwrap();
        assert_eq!(sum, Value::Bigint(3));
    }

    #[test]
    fn test_batch_json_round_trip() {
        let batch = Batch {
            columns: vec!["id".into(), "value".into(), "name".into()],
            types: vec![DataType::Integer, DataType::Double, DataType::Varchar],
            rows: vec![
                vec![Value::Bigint(1), Value::Double(1.5), Value::Text("a".into())],
                vec![Value::Bigint(2), Value::Null, Value::Null],
            ],
        };

        let json = serde_json::to_string(&batch).unwrap();
        let decoded: Batch = serde_json::from_str(&json).unwrap();
        assert_eq!(batch, decoded);
    }

    #[test]
    fn test_shard_file_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("shard_0.json");

        let batch = Batch {
            columns: vec!["ts".into()],
            types: vec![DataType::Timestamp],
            rows: vec![vec![Value::Timestamp(
                parse_timestamp("2024-05-01 10:30:00").unwrap(),
            )]],
        };

        write_shard(&path, &batch).unwrap();
        assert_eq!(read_shard(&path).unwrap(), batch);
        assert!(!path.with_extension("tmp").exists());
    }

    #[test]
    fn test_concat_rejects_schema_mismatch() {
        let a = Batch::new(vec!["x".into()], vec![DataType::Integer]);
        let b = Batch::new(vec!["y".into()], vec![DataType::Integer]);
        assert!(Batch::concat(vec![a, b]).is_err());
    }
}
