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
//! Perfect-hash fast path.
//!
//! Responsibilities:
//! - Builds dense, directly addressed build vectors keyed by `key - min` when
//!   the planner proves a small integer key range.
//! - Probes without a pointer table; dense full-range probes alias the input
//!   without copying.
//!
//! Key exported interfaces:
//! - Types: `PerfectHashTable`.
//! - Functions: `can_do_perfect_hash_join`, `build_perfect_hash_table`,
//!   `probe_perfect_hash_table`.

use std::sync::Arc;

use arrow::array::{
    Array, ArrayRef, Date32Array, Int8Array, Int16Array, Int32Array, Int64Array, RecordBatch,
    UInt8Array, UInt16Array, UInt32Array, UInt64Array, new_null_array,
};
use arrow::compute::kernels::interleave::interleave;
use arrow::compute::take;
use arrow::datatypes::DataType;

use super::join_error::JoinError;
use super::join_hash_table::JoinHashTable;
use super::join_spec::{HashJoinSpec, JoinType, PerfectJoinStats};
use crate::flintrocks_logging::debug;

/// Dense direct-addressed build table covering `[build_min, build_max]`.
pub(crate) struct PerfectHashTable {
    build_min: i64,
    build_size: usize,
    bitmap: Vec<bool>,
    is_dense: bool,
    key_columns: Vec<ArrayRef>,
    build_columns: Vec<ArrayRef>,
}

impl PerfectHashTable {
    pub(crate) fn build_size(&self) -> usize {
        self.build_size
    }

    pub(crate) fn is_dense(&self) -> bool {
        self.is_dense
    }

    pub(crate) fn key_columns(&self) -> &[ArrayRef] {
        &self.key_columns
    }

    pub(crate) fn build_columns(&self) -> &[ArrayRef] {
        &self.build_columns
    }

    /// Occupied slot indices in ascending key order.
    pub(crate) fn filled_indices(&self) -> Vec<u32> {
        self.bitmap
            .iter()
            .enumerate()
            .filter(|(_, &set)| set)
            .map(|(idx, _)| idx as u32)
            .collect()
    }
}

/// The planner only emits small-range statistics for single-key inner
/// equi-joins; anything else falls back to the hashed path.
pub(crate) fn can_do_perfect_hash_join(spec: &HashJoinSpec) -> bool {
    let Some(stats) = spec.perfect_join_stats.as_ref() else {
        return false;
    };
    stats.is_build_small
        && stats.build_max >= stats.build_min
        && spec.join_type == JoinType::Inner
        && spec.conditions.len() == 1
        && is_integer_type(spec.key_type(0))
}

fn is_integer_type(data_type: &DataType) -> bool {
    matches!(
        data_type,
        DataType::Int8
            | DataType::Int16
            | DataType::Int32
            | DataType::Int64
            | DataType::UInt8
            | DataType::UInt16
            | DataType::UInt32
            | DataType::UInt64
            | DataType::Date32
    )
}

/// Scan the finalized build rows into dense vectors. Returns `None` when the
/// scan disproves the perfect layout (duplicate or out-of-range key), which
/// the caller recovers from by building the pointer table instead.
pub(crate) fn build_perfect_hash_table(
    ht: &JoinHashTable,
    stats: &PerfectJoinStats,
) -> Result<Option<PerfectHashTable>, JoinError> {
    let build_size = match usize::try_from(stats.build_range()).ok().and_then(|r| r.checked_add(1)) {
        Some(size) => size,
        None => return Ok(None),
    };
    let mut bitmap = vec![false; build_size];
    let mut slots: Vec<Option<(usize, usize)>> = vec![None; build_size];
    let mut unique_keys = 0usize;

    for (block_idx, block) in ht.blocks().iter().enumerate() {
        let batch = block
            .batch()
            .map_err(|e| JoinError::internal("FINALIZE", e))?;
        let Some(keys) = int_column_values(batch.column(0)) else {
            debug!("perfect join fallback: non-integer build key column");
            return Ok(None);
        };
        for (row, key) in keys.into_iter().enumerate() {
            let Some(key) = key else {
                // NULL keys never reach the table; a stored NULL means the
                // layout assumption broke.
                return Ok(None);
            };
            if key < stats.build_min || key > stats.build_max {
                debug!(
                    "perfect join fallback: key {} outside [{}, {}]",
                    key, stats.build_min, stats.build_max
                );
                return Ok(None);
            }
            let idx = (key - stats.build_min) as usize;
            if bitmap[idx] {
                debug!("perfect join fallback: duplicate build key {key}");
                return Ok(None);
            }
            bitmap[idx] = true;
            slots[idx] = Some((block_idx, row));
            unique_keys += 1;
        }
    }

    let is_dense = unique_keys == build_size && !ht.has_null_key();

    // Gather every stored column into its dense vector; unoccupied slots
    // point at a one-row null source.
    let spec = ht.spec();
    let key_count = spec.key_count();
    let column_count = key_count + spec.payload_columns().len();
    let mut dense_columns: Vec<ArrayRef> = Vec::with_capacity(column_count);
    for col in 0..column_count {
        let data_type = spec.stored_row_schema().field(col).data_type().clone();
        let null_source = new_null_array(&data_type, 1);
        let mut sources: Vec<&dyn Array> = Vec::with_capacity(ht.blocks().len() + 1);
        for block in ht.blocks() {
            let batch = block
                .batch()
                .map_err(|e| JoinError::internal("FINALIZE", e))?;
            sources.push(batch.column(col).as_ref());
        }
        sources.push(null_source.as_ref());
        let null_index = ht.blocks().len();
        let indices: Vec<(usize, usize)> = slots
            .iter()
            .map(|slot| slot.unwrap_or((null_index, 0)))
            .collect();
        let dense = interleave(&sources, &indices)
            .map_err(|e| JoinError::internal("FINALIZE", format!("gather dense column: {e}")))?;
        dense_columns.push(dense);
    }
    let build_columns = dense_columns.split_off(key_count);

    Ok(Some(PerfectHashTable {
        build_min: stats.build_min,
        build_size,
        bitmap,
        is_dense,
        key_columns: dense_columns,
        build_columns,
    }))
}

/// Probe the dense table with one chunk. NULL and out-of-range probe keys are
/// skipped; when the build is dense and every probe key hits, the probe
/// columns of the output alias the input.
pub(crate) fn probe_perfect_hash_table(
    table: &PerfectHashTable,
    spec: &HashJoinSpec,
    input: &crate::exec::chunk::Chunk,
) -> Result<RecordBatch, JoinError> {
    let key_column = input
        .column(spec.conditions[0].probe_column)
        .ok_or_else(|| JoinError::internal("PROBE", "probe key column out of bounds"))?;
    let keys = int_column_values(key_column).ok_or_else(|| {
        JoinError::Unsupported("perfect join probe key is not an integer column".to_string())
    })?;

    let mut probe_sel: Vec<u32> = Vec::with_capacity(keys.len());
    let mut build_sel: Vec<u32> = Vec::with_capacity(keys.len());
    for (row, key) in keys.iter().enumerate() {
        let Some(key) = key else {
            continue;
        };
        let Some(idx) = key
            .checked_sub(table.build_min)
            .and_then(|idx| usize::try_from(idx).ok())
            .filter(|&idx| idx < table.build_size)
        else {
            continue;
        };
        if table.bitmap[idx] {
            probe_sel.push(row as u32);
            build_sel.push(idx as u32);
        }
    }

    let full_cover = probe_sel.len() == input.len();
    let mut columns: Vec<ArrayRef> = Vec::new();
    if table.is_dense && full_cover {
        // Dense fast path: reference the probe columns as-is.
        columns.extend(input.columns().iter().cloned());
    } else {
        let indices = UInt32Array::from(probe_sel);
        for col in input.columns() {
            let taken = take(col.as_ref(), &indices, None)
                .map_err(|e| JoinError::internal("PROBE", format!("gather probe rows: {e}")))?;
            columns.push(taken);
        }
    }
    let build_indices = UInt32Array::from(build_sel);
    for dense in table.build_columns() {
        let taken = take(dense.as_ref(), &build_indices, None)
            .map_err(|e| JoinError::internal("PROBE", format!("gather build rows: {e}")))?;
        columns.push(taken);
    }
    RecordBatch::try_new(spec.output_schema(), columns)
        .map_err(|e| JoinError::internal("PROBE", format!("assemble perfect join output: {e}")))
}

/// Read an integer-family column as i64 values. Returns `None` for
/// non-integer columns or u64 values beyond the i64 range.
fn int_column_values(array: &ArrayRef) -> Option<Vec<Option<i64>>> {
    macro_rules! read {
        ($ty:ty) => {{
            let array = array.as_any().downcast_ref::<$ty>()?;
            Some(array.iter().map(|v| v.map(|v| v as i64)).collect())
        }};
    }
    match array.data_type() {
        DataType::Int8 => read!(Int8Array),
        DataType::Int16 => read!(Int16Array),
        DataType::Int32 => read!(Int32Array),
        DataType::Int64 => read!(Int64Array),
        DataType::UInt8 => read!(UInt8Array),
        DataType::UInt16 => read!(UInt16Array),
        DataType::UInt32 => read!(UInt32Array),
        DataType::Date32 => read!(Date32Array),
        DataType::UInt64 => {
            let array = array.as_any().downcast_ref::<UInt64Array>()?;
            let mut out = Vec::with_capacity(array.len());
            for value in array.iter() {
                match value {
                    Some(v) => out.push(Some(i64::try_from(v).ok()?)),
                    None => out.push(None),
                }
            }
            Some(out)
        }
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exec::chunk::Chunk;
    use crate::exec::operators::hashjoin::join_spec::{Comparator, JoinCondition};
    use arrow::array::{Int64Array, StringArray};
    use arrow::datatypes::{Field, Schema};

    fn spec(stats: PerfectJoinStats) -> Arc<HashJoinSpec> {
        Arc::new(HashJoinSpec {
            join_type: JoinType::Inner,
            conditions: vec![JoinCondition {
                probe_column: 0,
                build_column: 0,
                comparator: Comparator::Eq,
            }],
            right_projection_map: vec![1],
            probe_schema: Arc::new(Schema::new(vec![
                Field::new("k", DataType::Int32, true),
                Field::new("tag", DataType::Utf8, true),
            ])),
            build_schema: Arc::new(Schema::new(vec![
                Field::new("k", DataType::Int32, true),
                Field::new("amount", DataType::Int64, true),
            ])),
            perfect_join_stats: Some(stats),
            can_go_external: false,
            pipeline_id: 0,
            estimated_probe_count: 0,
        })
    }

    fn build_table(spec: &Arc<HashJoinSpec>, keys: Vec<i32>, amounts: Vec<i64>) -> JoinHashTable {
        let mut ht = JoinHashTable::new(Arc::clone(spec));
        let key_schema = Arc::new(Schema::new(vec![Field::new("k", DataType::Int32, true)]));
        let payload_schema = Arc::new(Schema::new(vec![Field::new(
            "amount",
            DataType::Int64,
            true,
        )]));
        let key_batch = RecordBatch::try_new(
            key_schema,
            vec![Arc::new(Int32Array::from(keys)) as ArrayRef],
        )
        .unwrap();
        let payload_batch = RecordBatch::try_new(
            payload_schema,
            vec![Arc::new(Int64Array::from(amounts)) as ArrayRef],
        )
        .unwrap();
        ht.build(&key_batch, &payload_batch).unwrap();
        ht
    }

    fn probe_input(keys: Vec<Option<i32>>) -> Chunk {
        let tags: Vec<Option<String>> = keys.iter().map(|k| k.map(|k| format!("t{k}"))).collect();
        let schema = Arc::new(Schema::new(vec![
            Field::new("k", DataType::Int32, true),
            Field::new("tag", DataType::Utf8, true),
        ]));
        Chunk::new(
            RecordBatch::try_new(
                schema,
                vec![
                    Arc::new(Int32Array::from(keys)) as ArrayRef,
                    Arc::new(StringArray::from(tags)) as ArrayRef,
                ],
            )
            .unwrap(),
        )
    }

    #[test]
    fn dense_build_probes_without_copy() {
        let stats = PerfectJoinStats {
            build_min: 1,
            build_max: 3,
            is_build_small: true,
        };
        let spec = spec(stats);
        assert!(can_do_perfect_hash_join(&spec));
        let ht = build_table(&spec, vec![1, 2, 3], vec![10, 20, 30]);
        let table = build_perfect_hash_table(&ht, &stats).unwrap().unwrap();
        assert!(table.is_dense());
        assert_eq!(table.build_size(), 3);

        let input = probe_input(vec![Some(1), Some(2), Some(3)]);
        let output = probe_perfect_hash_table(&table, &spec, &input).unwrap();
        assert_eq!(output.num_rows(), 3);
        // probe columns alias the input
        assert!(Arc::ptr_eq(output.column(0), input.column(0).unwrap()));
        assert!(Arc::ptr_eq(output.column(1), input.column(1).unwrap()));
        let amounts = output
            .column(2)
            .as_any()
            .downcast_ref::<Int64Array>()
            .unwrap();
        assert_eq!(amounts.values(), &[10, 20, 30]);
    }

    #[test]
    fn duplicate_key_abandons_perfect_build() {
        let stats = PerfectJoinStats {
            build_min: 1,
            build_max: 2,
            is_build_small: true,
        };
        let spec = spec(stats);
        let ht = build_table(&spec, vec![1, 1, 2], vec![10, 11, 20]);
        assert!(build_perfect_hash_table(&ht, &stats).unwrap().is_none());
    }

    #[test]
    fn out_of_range_key_abandons_perfect_build() {
        let stats = PerfectJoinStats {
            build_min: 1,
            build_max: 2,
            is_build_small: true,
        };
        let spec = spec(stats);
        let ht = build_table(&spec, vec![1, 9], vec![10, 90]);
        assert!(build_perfect_hash_table(&ht, &stats).unwrap().is_none());
    }

    #[test]
    fn sparse_build_slices_probe_output() {
        // keys 1 and 4 in range [1, 4]: occupied slots 0 and 3
        let stats = PerfectJoinStats {
            build_min: 1,
            build_max: 4,
            is_build_small: true,
        };
        let spec = spec(stats);
        let ht = build_table(&spec, vec![1, 4], vec![10, 40]);
        let table = build_perfect_hash_table(&ht, &stats).unwrap().unwrap();
        assert!(!table.is_dense());
        assert_eq!(table.filled_indices(), vec![0, 3]);

        let input = probe_input(vec![Some(1), Some(2), None, Some(4), Some(9)]);
        let output = probe_perfect_hash_table(&table, &spec, &input).unwrap();
        assert_eq!(output.num_rows(), 2);
        let amounts = output
            .column(2)
            .as_any()
            .downcast_ref::<Int64Array>()
            .unwrap();
        assert_eq!(amounts.values(), &[10, 40]);
    }

    #[test]
    fn non_integer_key_disables_perfect_path() {
        let stats = PerfectJoinStats {
            build_min: 0,
            build_max: 1,
            is_build_small: true,
        };
        let mut spec = (*spec(stats)).clone();
        spec.build_schema = Arc::new(Schema::new(vec![
            Field::new("k", DataType::Utf8, true),
            Field::new("amount", DataType::Int64, true),
        ]));
        spec.probe_schema = Arc::new(Schema::new(vec![
            Field::new("k", DataType::Utf8, true),
            Field::new("tag", DataType::Utf8, true),
        ]));
        assert!(!can_do_perfect_hash_join(&spec));
    }
}
