// Licensed to the Apache Software Foundation (ASF) under one
// or more contributor license agreements.  See the NOTICE file
// distributed with this work for additional information
// regarding copyright ownership.  The ASF licenses this file
// to you under the Apache License, Version 2.0 (the
// "License"); you may not use this file except in compliance
// with the License.  You may obtain a copy of the License at
//
//   http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing,
// software distributed under the License is distributed on an
// "AS IS" BASIS, WITHOUT WARRANTIES OR CONDITIONS OF ANY
// KIND, either express or implied.  See the License for the
// specific language governing permissions and limitations
// under the License.
//! Checkpoint document codec.
//!
//! Responsibilities:
//! - Maps Arrow columns to a self-describing key/value document and back.
//! - Writes documents atomically (`.tmp` then rename) in JSON or, with the
//!   `cbor-checkpoint` feature, CBOR.
//!
//! Key exported interfaces:
//! - Types: `SuspendTableDocument`, `PartitionDocument`, `ColumnDoc`,
//!   `LogicalTypeTag`.
//! - Functions: `read_document`, `write_document`.

use std::collections::BTreeMap;
use std::io::Write;
use std::path::Path;
use std::sync::Arc;

use arrow::array::{
    Array, ArrayRef, BooleanArray, Date32Array, Float32Array, Float64Array, Int8Array, Int16Array,
    Int32Array, Int64Array, StringArray, UInt8Array, UInt16Array, UInt32Array, UInt64Array,
};
use arrow::datatypes::DataType;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

/// Integer type tags stored in checkpoint documents, drawn from the engine's
/// logical-type enumeration.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LogicalTypeTag {
    Boolean = 1,
    Int8 = 2,
    Int16 = 3,
    Int32 = 4,
    Int64 = 5,
    UInt8 = 6,
    UInt16 = 7,
    UInt32 = 8,
    UInt64 = 9,
    Float32 = 10,
    Float64 = 11,
    Date32 = 12,
    Utf8 = 13,
}

impl LogicalTypeTag {
    pub fn from_i32(value: i32) -> Result<Self, String> {
        Ok(match value {
            1 => Self::Boolean,
            2 => Self::Int8,
            3 => Self::Int16,
            4 => Self::Int32,
            5 => Self::Int64,
            6 => Self::UInt8,
            7 => Self::UInt16,
            8 => Self::UInt32,
            9 => Self::UInt64,
            10 => Self::Float32,
            11 => Self::Float64,
            12 => Self::Date32,
            13 => Self::Utf8,
            other => return Err(format!("unknown checkpoint type tag: {other}")),
        })
    }

    pub fn from_arrow(data_type: &DataType) -> Result<Self, String> {
        Ok(match data_type {
            DataType::Boolean => Self::Boolean,
            DataType::Int8 => Self::Int8,
            DataType::Int16 => Self::Int16,
            DataType::Int32 => Self::Int32,
            DataType::Int64 => Self::Int64,
            DataType::UInt8 => Self::UInt8,
            DataType::UInt16 => Self::UInt16,
            DataType::UInt32 => Self::UInt32,
            DataType::UInt64 => Self::UInt64,
            DataType::Float32 => Self::Float32,
            DataType::Float64 => Self::Float64,
            DataType::Date32 => Self::Date32,
            DataType::Utf8 => Self::Utf8,
            other => return Err(format!("unsupported checkpoint column type: {other}")),
        })
    }

    pub fn to_arrow(self) -> DataType {
        match self {
            Self::Boolean => DataType::Boolean,
            Self::Int8 => DataType::Int8,
            Self::Int16 => DataType::Int16,
            Self::Int32 => DataType::Int32,
            Self::Int64 => DataType::Int64,
            Self::UInt8 => DataType::UInt8,
            Self::UInt16 => DataType::UInt16,
            Self::UInt32 => DataType::UInt32,
            Self::UInt64 => DataType::UInt64,
            Self::Float32 => DataType::Float32,
            Self::Float64 => DataType::Float64,
            Self::Date32 => DataType::Date32,
            Self::Utf8 => DataType::Utf8,
        }
    }
}

/// One serialized column: a type tag and the typed value list.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ColumnDoc {
    #[serde(rename = "type")]
    pub type_tag: i32,
    pub data: ColumnValues,
}

/// Value payload of a serialized column. The variant is the transport shape;
/// the type tag decides the Arrow type it decodes into.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ColumnValues {
    Bool(Vec<Option<bool>>),
    Int(Vec<Option<i64>>),
    Float(Vec<Option<f64>>),
    Text(Vec<Option<String>>),
}

impl ColumnValues {
    pub fn len(&self) -> usize {
        match self {
            Self::Bool(v) => v.len(),
            Self::Int(v) => v.len(),
            Self::Float(v) => v.len(),
            Self::Text(v) => v.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn is_all_null(&self) -> bool {
        match self {
            Self::Bool(v) => v.iter().all(Option::is_none),
            Self::Int(v) => v.iter().all(Option::is_none),
            Self::Float(v) => v.iter().all(Option::is_none),
            Self::Text(v) => v.iter().all(Option::is_none),
        }
    }
}

/// Document written by in-memory suspension: the whole build table as one
/// column group per build column and per join-key column.
#[derive(Debug, Serialize, Deserialize)]
pub struct SuspendTableDocument {
    pub pipeline_complete: Vec<u64>,
    pub column_size: usize,
    pub build_size: usize,
    #[serde(flatten)]
    pub columns: BTreeMap<String, ColumnDoc>,
}

/// Document written per partition file by external suspension.
#[derive(Debug, Serialize, Deserialize)]
pub struct PartitionDocument {
    pub pipeline_ids: Vec<u64>,
    pub build_size: usize,
    #[serde(flatten)]
    pub columns: BTreeMap<String, ColumnDoc>,
}

pub fn join_key_column_name(index: usize) -> String {
    format!("join_key_{index}")
}

pub fn build_chunk_column_name(index: usize) -> String {
    format!("build_chunk_{index}")
}

/// Serialize an Arrow column into its document form.
pub fn column_doc_from_array(array: &ArrayRef) -> Result<ColumnDoc, String> {
    let tag = LogicalTypeTag::from_arrow(array.data_type())?;
    let data = match tag {
        LogicalTypeTag::Boolean => {
            let array = downcast::<BooleanArray>(array, "Boolean")?;
            ColumnValues::Bool(array.iter().collect())
        }
        LogicalTypeTag::Int8 => int_values(downcast::<Int8Array>(array, "Int8")?.iter()),
        LogicalTypeTag::Int16 => int_values(downcast::<Int16Array>(array, "Int16")?.iter()),
        LogicalTypeTag::Int32 => int_values(downcast::<Int32Array>(array, "Int32")?.iter()),
        LogicalTypeTag::Int64 => {
            ColumnValues::Int(downcast::<Int64Array>(array, "Int64")?.iter().collect())
        }
        LogicalTypeTag::UInt8 => int_values(downcast::<UInt8Array>(array, "UInt8")?.iter()),
        LogicalTypeTag::UInt16 => int_values(downcast::<UInt16Array>(array, "UInt16")?.iter()),
        LogicalTypeTag::UInt32 => int_values(downcast::<UInt32Array>(array, "UInt32")?.iter()),
        LogicalTypeTag::UInt64 => {
            let array = downcast::<UInt64Array>(array, "UInt64")?;
            let mut values = Vec::with_capacity(array.len());
            for value in array.iter() {
                let value = match value {
                    Some(v) => Some(
                        i64::try_from(v)
                            .map_err(|_| format!("uint64 value {v} overflows checkpoint range"))?,
                    ),
                    None => None,
                };
                values.push(value);
            }
            ColumnValues::Int(values)
        }
        LogicalTypeTag::Float32 => {
            let array = downcast::<Float32Array>(array, "Float32")?;
            ColumnValues::Float(array.iter().map(|v| v.map(f64::from)).collect())
        }
        LogicalTypeTag::Float64 => {
            ColumnValues::Float(downcast::<Float64Array>(array, "Float64")?.iter().collect())
        }
        LogicalTypeTag::Date32 => int_values(downcast::<Date32Array>(array, "Date32")?.iter()),
        LogicalTypeTag::Utf8 => {
            let array = downcast::<StringArray>(array, "Utf8")?;
            ColumnValues::Text(array.iter().map(|v| v.map(str::to_string)).collect())
        }
    };
    Ok(ColumnDoc {
        type_tag: tag as i32,
        data,
    })
}

/// Rebuild the Arrow column a document column describes.
pub fn array_from_column_doc(doc: &ColumnDoc) -> Result<ArrayRef, String> {
    let tag = LogicalTypeTag::from_i32(doc.type_tag)?;
    let array: ArrayRef = match tag {
        LogicalTypeTag::Boolean => {
            let values = expect_bools(&doc.data)?;
            Arc::new(BooleanArray::from(values))
        }
        LogicalTypeTag::Int8 => Arc::new(Int8Array::from(narrow_ints::<i8>(&doc.data, "int8")?)),
        LogicalTypeTag::Int16 => {
            Arc::new(Int16Array::from(narrow_ints::<i16>(&doc.data, "int16")?))
        }
        LogicalTypeTag::Int32 => {
            Arc::new(Int32Array::from(narrow_ints::<i32>(&doc.data, "int32")?))
        }
        LogicalTypeTag::Int64 => Arc::new(Int64Array::from(expect_ints(&doc.data)?)),
        LogicalTypeTag::UInt8 => Arc::new(UInt8Array::from(narrow_ints::<u8>(&doc.data, "uint8")?)),
        LogicalTypeTag::UInt16 => {
            Arc::new(UInt16Array::from(narrow_ints::<u16>(&doc.data, "uint16")?))
        }
        LogicalTypeTag::UInt32 => {
            Arc::new(UInt32Array::from(narrow_ints::<u32>(&doc.data, "uint32")?))
        }
        LogicalTypeTag::UInt64 => {
            Arc::new(UInt64Array::from(narrow_ints::<u64>(&doc.data, "uint64")?))
        }
        LogicalTypeTag::Float32 => {
            let values = expect_floats(&doc.data)?;
            Arc::new(Float32Array::from(
                values
                    .into_iter()
                    .map(|v| v.map(|f| f as f32))
                    .collect::<Vec<_>>(),
            ))
        }
        LogicalTypeTag::Float64 => Arc::new(Float64Array::from(expect_floats(&doc.data)?)),
        LogicalTypeTag::Date32 => {
            Arc::new(Date32Array::from(narrow_ints::<i32>(&doc.data, "date32")?))
        }
        LogicalTypeTag::Utf8 => Arc::new(StringArray::from(expect_texts(&doc.data)?)),
    };
    Ok(array)
}

fn downcast<'a, T: 'static>(array: &'a ArrayRef, expected: &str) -> Result<&'a T, String> {
    array
        .as_any()
        .downcast_ref::<T>()
        .ok_or_else(|| format!("checkpoint column is not a {expected} array"))
}

fn int_values<T: Into<i64>>(iter: impl Iterator<Item = Option<T>>) -> ColumnValues {
    ColumnValues::Int(iter.map(|v| v.map(Into::into)).collect())
}

fn expect_ints(values: &ColumnValues) -> Result<Vec<Option<i64>>, String> {
    match values {
        ColumnValues::Int(v) => Ok(v.clone()),
        other if other.is_all_null() => Ok(vec![None; other.len()]),
        _ => Err("checkpoint column data is not an integer list".to_string()),
    }
}

fn narrow_ints<T: TryFrom<i64>>(
    values: &ColumnValues,
    label: &str,
) -> Result<Vec<Option<T>>, String> {
    expect_ints(values)?
        .into_iter()
        .map(|v| match v {
            Some(v) => T::try_from(v)
                .map(Some)
                .map_err(|_| format!("checkpoint value {v} out of {label} range")),
            None => Ok(None),
        })
        .collect()
}

fn expect_floats(values: &ColumnValues) -> Result<Vec<Option<f64>>, String> {
    match values {
        ColumnValues::Float(v) => Ok(v.clone()),
        // A float column whose values happen to be integral may decode as
        // integers depending on the transport.
        ColumnValues::Int(v) => Ok(v.iter().map(|v| v.map(|i| i as f64)).collect()),
        other if other.is_all_null() => Ok(vec![None; other.len()]),
        _ => Err("checkpoint column data is not a float list".to_string()),
    }
}

fn expect_texts(values: &ColumnValues) -> Result<Vec<Option<String>>, String> {
    match values {
        ColumnValues::Text(v) => Ok(v.clone()),
        other if other.is_all_null() => Ok(vec![None; other.len()]),
        _ => Err("checkpoint column data is not a string list".to_string()),
    }
}

fn expect_bools(values: &ColumnValues) -> Result<Vec<Option<bool>>, String> {
    match values {
        ColumnValues::Bool(v) => Ok(v.clone()),
        other if other.is_all_null() => Ok(vec![None; other.len()]),
        _ => Err("checkpoint column data is not a bool list".to_string()),
    }
}

#[cfg(feature = "cbor-checkpoint")]
fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>, String> {
    let mut buffer = Vec::new();
    ciborium::ser::into_writer(value, &mut buffer)
        .map_err(|e| format!("encode checkpoint document as cbor: {e}"))?;
    Ok(buffer)
}

#[cfg(feature = "cbor-checkpoint")]
fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, String> {
    ciborium::de::from_reader(bytes).map_err(|e| format!("decode checkpoint document as cbor: {e}"))
}

#[cfg(not(feature = "cbor-checkpoint"))]
fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>, String> {
    serde_json::to_vec(value).map_err(|e| format!("encode checkpoint document as json: {e}"))
}

#[cfg(not(feature = "cbor-checkpoint"))]
fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, String> {
    serde_json::from_slice(bytes).map_err(|e| format!("decode checkpoint document as json: {e}"))
}

/// Write a document to `<path>.tmp` and rename into place. A failed write
/// leaves no renamed file, so partially written checkpoints are never picked
/// up by resume.
pub fn write_document<T: Serialize>(path: &Path, document: &T) -> Result<(), String> {
    let bytes = encode(document)?;
    let tmp_path = tmp_path_for(path);
    let write_result = (|| -> std::io::Result<()> {
        let mut file = std::fs::File::create(&tmp_path)?;
        file.write_all(&bytes)?;
        file.flush()?;
        Ok(())
    })();
    if let Err(e) = write_result {
        let _ = std::fs::remove_file(&tmp_path);
        return Err(format!(
            "write checkpoint document {}: {e}",
            tmp_path.display()
        ));
    }
    std::fs::rename(&tmp_path, path).map_err(|e| {
        let _ = std::fs::remove_file(&tmp_path);
        format!("rename checkpoint document into {}: {e}", path.display())
    })
}

pub fn read_document<T: DeserializeOwned>(path: &Path) -> Result<T, String> {
    let bytes = std::fs::read(path)
        .map_err(|e| format!("read checkpoint document {}: {e}", path.display()))?;
    decode(&bytes)
}

fn tmp_path_for(path: &Path) -> std::path::PathBuf {
    let mut name = path.as_os_str().to_os_string();
    name.push(".tmp");
    std::path::PathBuf::from(name)
}

#[cfg(test)]
mod tests {
    use super::*;
    use arrow::array::{Int32Array, StringArray};

    #[test]
    fn column_roundtrip_int32() {
        let array: ArrayRef = Arc::new(Int32Array::from(vec![Some(1), None, Some(-7)]));
        let doc = column_doc_from_array(&array).unwrap();
        assert_eq!(doc.type_tag, LogicalTypeTag::Int32 as i32);
        let restored = array_from_column_doc(&doc).unwrap();
        assert_eq!(restored.as_ref(), array.as_ref());
    }

    #[test]
    fn column_roundtrip_utf8_with_nulls() {
        let array: ArrayRef = Arc::new(StringArray::from(vec![Some("a"), None, Some("b")]));
        let doc = column_doc_from_array(&array).unwrap();
        let restored = array_from_column_doc(&doc).unwrap();
        assert_eq!(restored.as_ref(), array.as_ref());
    }

    #[test]
    fn all_null_column_decodes_by_type_tag() {
        let doc = ColumnDoc {
            type_tag: LogicalTypeTag::Int64 as i32,
            data: ColumnValues::Bool(vec![None, None]),
        };
        let restored = array_from_column_doc(&doc).unwrap();
        assert_eq!(restored.data_type(), &DataType::Int64);
        assert_eq!(restored.null_count(), 2);
    }

    #[test]
    fn document_write_is_atomic() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.ratchet");
        let mut columns = BTreeMap::new();
        columns.insert(
            join_key_column_name(0),
            ColumnDoc {
                type_tag: LogicalTypeTag::Int32 as i32,
                data: ColumnValues::Int(vec![Some(1), Some(2)]),
            },
        );
        let doc = SuspendTableDocument {
            pipeline_complete: vec![3],
            column_size: 0,
            build_size: 2,
            columns,
        };
        write_document(&path, &doc).unwrap();
        assert!(path.is_file());
        assert!(!tmp_path_for(&path).exists());

        let restored: SuspendTableDocument = read_document(&path).unwrap();
        assert_eq!(restored.pipeline_complete, vec![3]);
        assert_eq!(restored.build_size, 2);
        assert!(restored.columns.contains_key("join_key_0"));
    }
}
