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
use arrow::array::{
    Array, ArrayRef, BooleanArray, Date32Array, Float32Array, Float64Array, Int8Array, Int16Array,
    Int32Array, Int64Array, StringArray, UInt8Array, UInt16Array, UInt32Array, UInt64Array,
};
use arrow::datatypes::DataType;

/// Fixed seed so build and probe sides agree across processes; partition
/// routing relies on hashes being stable over a suspend/resume boundary.
pub(crate) const JOIN_HASH_SEED: u64 = 0x243f_6a88_85a3_08d3;

pub(crate) fn combine_hash(acc: u64, value_hash: u64) -> u64 {
    acc ^ value_hash
        .wrapping_add(0x9e3779b97f4a7c15)
        .wrapping_add(acc << 6)
        .wrapping_add(acc >> 2)
}

pub(crate) fn hash_u64_with_seed(seed: u64, value: u64) -> u64 {
    mix_u64(seed ^ value)
}

pub(crate) fn hash_bytes_with_seed(seed: u64, bytes: &[u8]) -> u64 {
    let mut hash = seed ^ 0xcbf29ce484222325;
    for byte in bytes {
        hash ^= *byte as u64;
        hash = hash.wrapping_mul(0x100000001b3);
    }
    hash
}

pub(crate) fn hash_null_with_seed(seed: u64) -> u64 {
    hash_u64_with_seed(seed, 0x9e3779b97f4a7c15)
}

pub(crate) fn canonical_f64_bits(value: f64) -> u64 {
    if value.is_nan() {
        f64::NAN.to_bits()
    } else {
        value.to_bits()
    }
}

pub(crate) fn canonical_f32_bits(value: f32) -> u32 {
    if value.is_nan() {
        f32::NAN.to_bits()
    } else {
        value.to_bits()
    }
}

fn mix_u64(mut value: u64) -> u64 {
    value = value.wrapping_add(0x9e3779b97f4a7c15);
    value = (value ^ (value >> 30)).wrapping_mul(0xbf58476d1ce4e5b9);
    value = (value ^ (value >> 27)).wrapping_mul(0x94d049bb133111eb);
    value ^ (value >> 31)
}

macro_rules! hash_primitive {
    ($array:expr, $ty:ty, $num_rows:expr, $to_u64:expr) => {{
        let array = $array
            .as_any()
            .downcast_ref::<$ty>()
            .ok_or_else(|| "join key array downcast mismatch".to_string())?;
        let mut out = Vec::with_capacity($num_rows);
        for row in 0..$num_rows {
            if array.is_null(row) {
                out.push(hash_null_with_seed(JOIN_HASH_SEED));
            } else {
                #[allow(clippy::redundant_closure_call)]
                out.push(hash_u64_with_seed(JOIN_HASH_SEED, ($to_u64)(array.value(row))));
            }
        }
        out
    }};
}

/// Per-row hash of one key column.
fn hash_array(array: &ArrayRef, num_rows: usize) -> Result<Vec<u64>, String> {
    let hashes = match array.data_type() {
        DataType::Boolean => {
            let array = array
                .as_any()
                .downcast_ref::<BooleanArray>()
                .ok_or_else(|| "join key array downcast mismatch".to_string())?;
            let mut out = Vec::with_capacity(num_rows);
            for row in 0..num_rows {
                if array.is_null(row) {
                    out.push(hash_null_with_seed(JOIN_HASH_SEED));
                } else {
                    out.push(hash_u64_with_seed(JOIN_HASH_SEED, array.value(row) as u64));
                }
            }
            out
        }
        DataType::Int8 => hash_primitive!(array, Int8Array, num_rows, |v: i8| v as i64 as u64),
        DataType::Int16 => hash_primitive!(array, Int16Array, num_rows, |v: i16| v as i64 as u64),
        DataType::Int32 => hash_primitive!(array, Int32Array, num_rows, |v: i32| v as i64 as u64),
        DataType::Int64 => hash_primitive!(array, Int64Array, num_rows, |v: i64| v as u64),
        DataType::UInt8 => hash_primitive!(array, UInt8Array, num_rows, |v: u8| v as u64),
        DataType::UInt16 => hash_primitive!(array, UInt16Array, num_rows, |v: u16| v as u64),
        DataType::UInt32 => hash_primitive!(array, UInt32Array, num_rows, |v: u32| v as u64),
        DataType::UInt64 => hash_primitive!(array, UInt64Array, num_rows, |v: u64| v),
        DataType::Float32 => hash_primitive!(array, Float32Array, num_rows, |v: f32| {
            canonical_f32_bits(v) as u64
        }),
        DataType::Float64 => hash_primitive!(array, Float64Array, num_rows, |v: f64| {
            canonical_f64_bits(v)
        }),
        DataType::Date32 => hash_primitive!(array, Date32Array, num_rows, |v: i32| v as i64 as u64),
        DataType::Utf8 => {
            let array = array
                .as_any()
                .downcast_ref::<StringArray>()
                .ok_or_else(|| "join key array downcast mismatch".to_string())?;
            let mut out = Vec::with_capacity(num_rows);
            for row in 0..num_rows {
                if array.is_null(row) {
                    out.push(hash_null_with_seed(JOIN_HASH_SEED));
                } else {
                    out.push(hash_bytes_with_seed(JOIN_HASH_SEED, array.value(row).as_bytes()));
                }
            }
            out
        }
        other => return Err(format!("unsupported join key type: {other}")),
    };
    Ok(hashes)
}

/// Combined hash over the hashed (equality) key columns.
pub(crate) fn hash_key_columns(
    arrays: &[ArrayRef],
    equality_mask: &[bool],
    num_rows: usize,
) -> Result<Vec<u64>, String> {
    let mut combined: Option<Vec<u64>> = None;
    for (col, array) in arrays.iter().enumerate() {
        if !equality_mask.get(col).copied().unwrap_or(false) {
            continue;
        }
        let column_hashes = hash_array(array, num_rows)?;
        combined = Some(match combined {
            None => column_hashes,
            Some(mut acc) => {
                for (slot, hash) in acc.iter_mut().zip(column_hashes) {
                    *slot = combine_hash(*slot, hash);
                }
                acc
            }
        });
    }
    combined.ok_or_else(|| "hash join requires at least one equality key".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn equal_keys_hash_equal_across_types_of_call() {
        let a: ArrayRef = Arc::new(Int32Array::from(vec![1, 2, 3, 1]));
        let b: ArrayRef = Arc::new(Int32Array::from(vec![1, 5, 3, 9]));
        let ha = hash_key_columns(&[a], &[true], 4).unwrap();
        let hb = hash_key_columns(&[b], &[true], 4).unwrap();
        assert_eq!(ha[0], hb[0]);
        assert_eq!(ha[2], hb[2]);
        assert_ne!(ha[1], hb[1]);
        assert_eq!(ha[0], ha[3]);
    }

    #[test]
    fn null_keys_hash_consistently() {
        let a: ArrayRef = Arc::new(Int32Array::from(vec![None, Some(2)]));
        let hashes = hash_key_columns(&[a], &[true], 2).unwrap();
        assert_eq!(hashes[0], hash_null_with_seed(JOIN_HASH_SEED));
    }

    #[test]
    fn inequality_columns_do_not_contribute() {
        let key: ArrayRef = Arc::new(Int32Array::from(vec![7, 8]));
        let extra_a: ArrayRef = Arc::new(Int64Array::from(vec![1, 2]));
        let extra_b: ArrayRef = Arc::new(Int64Array::from(vec![100, 200]));
        let ha = hash_key_columns(&[key.clone(), extra_a], &[true, false], 2).unwrap();
        let hb = hash_key_columns(&[key, extra_b], &[true, false], 2).unwrap();
        assert_eq!(ha, hb);
    }
}
