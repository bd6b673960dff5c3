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
//! Join hash table and chain-walking scan structure.
//!
//! Responsibilities:
//! - Stores build rows in indexed row blocks, hashes their key columns, and
//!   chains them into an atomic pointer table for probing.
//! - Radix-partitions rows for the out-of-core path and scans unmatched rows
//!   for right-preserving joins.
//!
//! Key exported interfaces:
//! - Types: `JoinHashTable`, `ScanStructure`, `FullOuterScanState`.

use std::mem;
use std::sync::Arc;
use std::sync::atomic::Ordering;

use arrow::array::{Array, ArrayRef, BooleanArray, RecordBatch, UInt32Array, new_null_array};
use arrow::compute::kernels::cmp;
use arrow::compute::kernels::interleave::interleave;
use arrow::compute::{
    and, and_kleene, filter_record_batch, is_not_null, prep_null_mask_filter, take,
    take_record_batch,
};

use super::hash::hash_key_columns;
use super::join_error::JoinError;
use super::join_spec::{Comparator, HashJoinSpec, JoinType};
use super::row_block::{NULL_ROW_REF, RowBlock, pack_row_ref, unpack_row_ref};
use crate::exec::chunk::{CHUNK_CAPACITY, Chunk};
use crate::runtime::mem_tracker::MemTracker;

/// Upper bound on radix partitions for the external path (2^7 = 128).
const MAX_RADIX_BITS: u32 = 7;

#[derive(Debug, Default)]
struct PartitionSlot {
    blocks: Vec<RowBlock>,
    count: usize,
}

/// Per-local-table output of the partition phase, drained into the global
/// table under its write lock.
pub(crate) struct PartitionedRows {
    parts: Vec<Vec<RowBlock>>,
    has_null_key: bool,
}

/// Shared scan cursor for the unmatched-row scan of right-preserving joins.
#[derive(Debug, Default)]
pub(crate) struct FullOuterScanState {
    pub next_block: usize,
    pub scanned: usize,
    pub total: usize,
}

impl FullOuterScanState {
    pub(crate) fn reset(&mut self, total: usize) {
        self.next_block = 0;
        self.scanned = 0;
        self.total = total;
    }
}

/// Hash table over build rows: an append-only block collection plus an
/// atomic bucket array threading chains through per-row next slots.
pub(crate) struct JoinHashTable {
    spec: Arc<HashJoinSpec>,
    row_schema: arrow::datatypes::SchemaRef,
    equality_mask: Vec<bool>,
    blocks: Vec<RowBlock>,
    count: usize,
    has_null_key: bool,
    pointer_table: Vec<std::sync::atomic::AtomicU64>,
    table_bits: u32,
    radix_bits: u32,
    partitions: Vec<PartitionSlot>,
    next_partition: usize,
    finalized: bool,
    mem_tracker: Option<Arc<MemTracker>>,
    accounted_bytes: i64,
}

impl JoinHashTable {
    pub(crate) fn new(spec: Arc<HashJoinSpec>) -> Self {
        let row_schema = spec.stored_row_schema();
        let equality_mask = spec.equality_mask();
        Self {
            spec,
            row_schema,
            equality_mask,
            blocks: Vec::new(),
            count: 0,
            has_null_key: false,
            pointer_table: Vec::new(),
            table_bits: 0,
            radix_bits: 0,
            partitions: Vec::new(),
            next_partition: 0,
            finalized: false,
            mem_tracker: None,
            accounted_bytes: 0,
        }
    }

    pub(crate) fn spec(&self) -> &Arc<HashJoinSpec> {
        &self.spec
    }

    pub(crate) fn count(&self) -> usize {
        self.count
    }

    pub(crate) fn has_null_key(&self) -> bool {
        self.has_null_key
    }

    pub(crate) fn set_finalized(&mut self, finalized: bool) {
        self.finalized = finalized;
    }

    pub(crate) fn blocks(&self) -> &[RowBlock] {
        &self.blocks
    }

    pub(crate) fn row_schema(&self) -> &arrow::datatypes::SchemaRef {
        &self.row_schema
    }

    /// Row data of one block, reloading it if evicted. Used by checkpoint
    /// serialization, which must read swizzled sink-side blocks.
    pub(crate) fn block_batch(&mut self, index: usize) -> Result<RecordBatch, JoinError> {
        let block = self
            .blocks
            .get_mut(index)
            .ok_or_else(|| JoinError::internal("SINK", format!("block {index} out of bounds")))?;
        block.unswizzle().map_err(JoinError::Serialization)?;
        Ok(block
            .batch()
            .map_err(|e| JoinError::internal("SINK", e))?
            .clone())
    }

    pub(crate) fn block_count(&self) -> usize {
        self.blocks.len()
    }

    pub(crate) fn radix_bits(&self) -> u32 {
        self.radix_bits
    }

    pub(crate) fn partition_count(&self) -> usize {
        self.partitions.len().max(1 << self.radix_bits)
    }

    /// Partition loaded by the most recent `prepare_external_finalize`.
    pub(crate) fn current_partition(&self) -> Option<usize> {
        self.next_partition.checked_sub(1)
    }

    pub(crate) fn set_mem_tracker(&mut self, tracker: Arc<MemTracker>) {
        if let Some(current) = self.mem_tracker.as_ref() {
            if Arc::ptr_eq(current, &tracker) {
                return;
            }
            current.release(self.accounted_bytes);
        }
        let bytes = self.tracked_bytes();
        tracker.consume(bytes);
        self.mem_tracker = Some(tracker);
        self.accounted_bytes = bytes;
    }

    /// Append one chunk of build rows. Keys are the condition columns in
    /// condition order; rows whose equality key is NULL are excluded from the
    /// table and remembered in `has_null_key`.
    pub(crate) fn build(&mut self, keys: &RecordBatch, payload: &RecordBatch) -> Result<(), JoinError> {
        let num_rows = keys.num_rows();
        if payload.num_rows() != num_rows {
            return Err(JoinError::internal(
                "SINK",
                format!(
                    "key/payload cardinality mismatch: {num_rows} vs {}",
                    payload.num_rows()
                ),
            ));
        }
        if num_rows == 0 {
            return Ok(());
        }

        let mut valid: Option<BooleanArray> = None;
        for (col, cond) in self.spec.conditions.iter().enumerate() {
            if cond.comparator != Comparator::Eq {
                continue;
            }
            let key_array = keys.column(col);
            if key_array.null_count() == 0 {
                continue;
            }
            let not_null = is_not_null(key_array.as_ref())
                .map_err(|e| JoinError::internal("SINK", format!("null mask: {e}")))?;
            valid = Some(match valid {
                None => not_null,
                Some(acc) => and(&acc, &not_null)
                    .map_err(|e| JoinError::internal("SINK", format!("null mask: {e}")))?,
            });
        }

        let (keys, payload) = match valid {
            Some(valid) if valid.false_count() > 0 => {
                self.has_null_key = true;
                let keys = filter_record_batch(keys, &valid)
                    .map_err(|e| JoinError::internal("SINK", format!("filter null keys: {e}")))?;
                let payload = filter_record_batch(payload, &valid)
                    .map_err(|e| JoinError::internal("SINK", format!("filter null keys: {e}")))?;
                (keys, payload)
            }
            _ => (keys.clone(), payload.clone()),
        };

        let kept = keys.num_rows();
        if kept == 0 {
            return Ok(());
        }

        let hashes = hash_key_columns(keys.columns(), &self.equality_mask, kept)
            .map_err(JoinError::Unsupported)?;

        let mut columns = keys.columns().to_vec();
        columns.extend(payload.columns().iter().cloned());
        let stored = RecordBatch::try_new(self.row_schema.clone(), columns)
            .map_err(|e| JoinError::internal("SINK", format!("assemble stored rows: {e}")))?;

        let mut offset = 0;
        while offset < kept {
            let len = CHUNK_CAPACITY.min(kept - offset);
            self.blocks.push(RowBlock::from_batch(
                stored.slice(offset, len),
                hashes[offset..offset + len].to_vec(),
            ));
            offset += len;
        }
        self.count += kept;
        self.refresh_accounting();
        Ok(())
    }

    /// Aggregate logical size of row storage; drives sink memory pressure.
    pub(crate) fn size_in_bytes(&self) -> usize {
        let block_bytes: usize = self.blocks.iter().map(RowBlock::size_in_bytes).sum();
        let partition_bytes: usize = self
            .partitions
            .iter()
            .flat_map(|slot| slot.blocks.iter())
            .map(RowBlock::size_in_bytes)
            .sum();
        block_bytes + partition_bytes + self.pointer_table.len() * mem::size_of::<u64>()
    }

    /// Swizzle every block so the buffer layer may evict them. Idempotent.
    pub(crate) fn swizzle_blocks(&mut self) -> Result<(), JoinError> {
        for block in &mut self.blocks {
            block.swizzle().map_err(JoinError::Serialization)?;
        }
        self.refresh_accounting();
        Ok(())
    }

    /// Move `other`'s blocks into this table. Caller holds the sink lock.
    pub(crate) fn merge(&mut self, mut other: JoinHashTable) {
        self.blocks.append(&mut other.blocks);
        self.count += other.count;
        self.has_null_key |= other.has_null_key;
        self.refresh_accounting();
    }

    /// Empty the table; used when resume replaces sink-built state.
    pub(crate) fn reset(&mut self) {
        self.blocks.clear();
        self.partitions.clear();
        self.pointer_table = Vec::new();
        self.count = 0;
        self.has_null_key = false;
        self.table_bits = 0;
        self.radix_bits = 0;
        self.next_partition = 0;
        self.finalized = false;
        self.refresh_accounting();
    }

    /// Pick the radix partition count for the external path: the smallest
    /// power of two whose expected per-partition payload fits the per-worker
    /// share of the table budget.
    pub(crate) fn compute_partition_sizes(
        &mut self,
        local_tables: &[JoinHashTable],
        max_ht_size: usize,
        worker_count: usize,
    ) {
        let total_bytes: usize = local_tables.iter().map(JoinHashTable::size_in_bytes).sum();
        let budget = (max_ht_size / worker_count.max(1)).max(1);
        let mut bits = 1u32;
        while bits < MAX_RADIX_BITS && (total_bytes >> bits) > budget {
            bits += 1;
        }
        self.radix_bits = bits;
        self.partitions = (0..(1usize << bits)).map(|_| PartitionSlot::default()).collect();
        self.next_partition = 0;
    }

    /// Route every row of this (local) table to its radix partition. Runs on
    /// the partitioning worker without any shared lock; the result is drained
    /// into the global table via `absorb_partitioned`.
    pub(crate) fn partition_rows(mut self, radix_bits: u32) -> Result<PartitionedRows, JoinError> {
        let partition_count = 1usize << radix_bits;
        let mask = (partition_count - 1) as u64;
        let mut parts: Vec<Vec<RowBlock>> = (0..partition_count).map(|_| Vec::new()).collect();

        for block in &mut self.blocks {
            block.unswizzle().map_err(JoinError::Serialization)?;
        }
        for block in &self.blocks {
            let batch = block
                .batch()
                .map_err(|e| JoinError::internal("PARTITION", e))?;
            let mut indices: Vec<Vec<u32>> = (0..partition_count).map(|_| Vec::new()).collect();
            for (row, hash) in block.hashes().iter().enumerate() {
                indices[(hash & mask) as usize].push(row as u32);
            }
            for (partition, rows) in indices.into_iter().enumerate() {
                if rows.is_empty() {
                    continue;
                }
                let take_indices = UInt32Array::from(rows.clone());
                let taken = take_record_batch(batch, &take_indices).map_err(|e| {
                    JoinError::internal_at("PARTITION", partition, format!("gather rows: {e}"))
                })?;
                let hashes = rows
                    .iter()
                    .map(|&row| block.hashes()[row as usize])
                    .collect::<Vec<_>>();
                parts[partition].push(RowBlock::from_batch(taken, hashes));
            }
        }
        Ok(PartitionedRows {
            parts,
            has_null_key: self.has_null_key,
        })
    }

    /// Append partitioned rows produced by one worker. Caller holds the
    /// global table's write lock.
    pub(crate) fn absorb_partitioned(&mut self, rows: PartitionedRows) -> Result<(), JoinError> {
        if rows.parts.len() != self.partitions.len() {
            return Err(JoinError::internal(
                "PARTITION",
                format!(
                    "partition count mismatch: {} vs {}",
                    rows.parts.len(),
                    self.partitions.len()
                ),
            ));
        }
        for (slot, blocks) in self.partitions.iter_mut().zip(rows.parts) {
            for block in blocks {
                slot.count += block.len();
                slot.blocks.push(block);
            }
        }
        self.has_null_key |= rows.has_null_key;
        self.refresh_accounting();
        Ok(())
    }

    /// Swap the next pending partition into the active block collection.
    /// Returns false when no partitions remain.
    pub(crate) fn prepare_external_finalize(&mut self) -> bool {
        if self.next_partition >= self.partitions.len() {
            return false;
        }
        let slot = mem::take(&mut self.partitions[self.next_partition]);
        self.blocks = slot.blocks;
        self.count = slot.count;
        self.pointer_table = Vec::new();
        self.table_bits = 0;
        self.finalized = false;
        self.next_partition += 1;
        self.refresh_accounting();
        true
    }

    /// Allocate the bucket array at twice the row count (occupancy <= 50%),
    /// reload evicted blocks, and clear every chain slot.
    pub(crate) fn initialize_pointer_table(&mut self) -> Result<(), JoinError> {
        for block in &mut self.blocks {
            block.unswizzle().map_err(JoinError::Serialization)?;
        }
        for block in &self.blocks {
            block.reset_chains();
        }
        let size = (self.count * 2).max(2).next_power_of_two();
        let mut table = Vec::new();
        table
            .try_reserve_exact(size)
            .map_err(|e| JoinError::Allocation(format!("pointer table of {size} buckets: {e}")))?;
        table.extend((0..size).map(|_| std::sync::atomic::AtomicU64::new(NULL_ROW_REF)));
        self.pointer_table = table;
        self.table_bits = size.trailing_zeros();
        self.refresh_accounting();
        Ok(())
    }

    /// Buckets draw on the upper hash bits; radix partitioning consumes the
    /// lower bits, and the two must stay independent.
    fn bucket_index(&self, hash: u64) -> usize {
        (hash >> (64 - self.table_bits)) as usize
    }

    /// Chain every row in the block range onto its bucket. With `parallel`,
    /// heads are claimed by compare-and-swap; the next-slot write is ordered
    /// before the head publication by the release exchange.
    pub(crate) fn finalize_range(
        &self,
        block_start: usize,
        block_end: usize,
        parallel: bool,
    ) -> Result<(), JoinError> {
        if self.pointer_table.is_empty() {
            return Err(JoinError::internal(
                "BUILD",
                "pointer table not initialized before finalize",
            ));
        }
        let block_end = block_end.min(self.blocks.len());
        for block_idx in block_start..block_end {
            let block = &self.blocks[block_idx];
            for row in 0..block.len() {
                let row_ref = pack_row_ref(block_idx, row);
                let bucket = &self.pointer_table[self.bucket_index(block.hashes()[row])];
                if parallel {
                    let mut head = bucket.load(Ordering::Relaxed);
                    loop {
                        block.next_slot(row).store(head, Ordering::Relaxed);
                        match bucket.compare_exchange_weak(
                            head,
                            row_ref,
                            Ordering::Release,
                            Ordering::Relaxed,
                        ) {
                            Ok(_) => break,
                            Err(current) => head = current,
                        }
                    }
                } else {
                    let head = bucket.load(Ordering::Relaxed);
                    block.next_slot(row).store(head, Ordering::Relaxed);
                    bucket.store(row_ref, Ordering::Relaxed);
                }
            }
        }
        Ok(())
    }

    /// Start a probe over one chunk. `precomputed_hashes` comes from the
    /// probe spill replay; fresh probes hash here.
    pub(crate) fn probe(
        &self,
        keys: RecordBatch,
        probe: Chunk,
        precomputed_hashes: Option<Vec<u64>>,
    ) -> Result<ScanStructure, JoinError> {
        if !self.finalized {
            return Err(JoinError::internal(
                "PROBE",
                "hash table probed before finalization",
            ));
        }
        let num_rows = keys.num_rows();
        let hashes = match precomputed_hashes {
            Some(hashes) => hashes,
            None => hash_key_columns(keys.columns(), &self.equality_mask, num_rows)
                .map_err(JoinError::Unsupported)?,
        };
        let chains = if self.pointer_table.is_empty() {
            vec![NULL_ROW_REF; num_rows]
        } else {
            hashes
                .iter()
                .map(|&hash| self.pointer_table[self.bucket_index(hash)].load(Ordering::Acquire))
                .collect()
        };
        Ok(ScanStructure {
            keys,
            probe,
            chains,
            matched_any: vec![false; num_rows],
            tail_emitted: false,
        })
    }

    fn next_of(&self, block: usize, row: usize) -> u64 {
        self.blocks[block].next_slot(row).load(Ordering::Relaxed)
    }

    /// Claim blocks for the unmatched-row scan, collecting row refs whose
    /// matched bit is unset. Caller holds the source lock for the claim and
    /// adds the returned row total to `scanned` once the rows are emitted.
    pub(crate) fn scan_full_outer(
        &self,
        state: &mut FullOuterScanState,
        max_rows: usize,
    ) -> (Vec<(usize, usize)>, usize) {
        let mut refs = Vec::new();
        let mut claimed = 0;
        while state.next_block < self.blocks.len() && claimed < max_rows {
            let block_idx = state.next_block;
            state.next_block += 1;
            let block = &self.blocks[block_idx];
            claimed += block.len();
            for row in 0..block.len() {
                if !block.matched_slot(row).load(Ordering::Relaxed) {
                    refs.push((block_idx, row));
                }
            }
        }
        (refs, claimed)
    }

    /// Emit NULL-extended probe columns alongside the given unmatched build
    /// rows.
    pub(crate) fn gather_full_outer(
        &self,
        refs: &[(usize, usize)],
    ) -> Result<Option<RecordBatch>, JoinError> {
        if refs.is_empty() {
            return Ok(None);
        }
        let output_schema = self.spec.output_schema();
        let probe_width = self.spec.probe_schema.fields().len();
        let mut columns: Vec<ArrayRef> = Vec::with_capacity(output_schema.fields().len());
        for field in self.spec.probe_schema.fields() {
            columns.push(new_null_array(field.data_type(), refs.len()));
        }
        let payload_columns = self.gather_stored_columns(
            self.spec.key_count(),
            self.row_schema.fields().len(),
            refs,
        )?;
        columns.extend(payload_columns);
        debug_assert_eq!(columns.len(), probe_width + self.row_schema.fields().len() - self.spec.key_count());
        let batch = RecordBatch::try_new(output_schema, columns)
            .map_err(|e| JoinError::internal("SCAN_HT", format!("assemble outer rows: {e}")))?;
        Ok(Some(batch))
    }

    /// Gather a range of stored row columns at the given refs.
    fn gather_stored_columns(
        &self,
        col_start: usize,
        col_end: usize,
        refs: &[(usize, usize)],
    ) -> Result<Vec<ArrayRef>, JoinError> {
        let mut out = Vec::with_capacity(col_end - col_start);
        for col in col_start..col_end {
            let mut sources: Vec<&dyn Array> = Vec::with_capacity(self.blocks.len());
            for block in &self.blocks {
                let batch = block
                    .batch()
                    .map_err(|e| JoinError::internal("PROBE", e))?;
                sources.push(batch.column(col).as_ref());
            }
            let gathered = interleave(&sources, refs)
                .map_err(|e| JoinError::internal("PROBE", format!("gather build rows: {e}")))?;
            out.push(gathered);
        }
        Ok(out)
    }

    fn tracked_bytes(&self) -> i64 {
        i64::try_from(self.size_in_bytes()).unwrap_or(i64::MAX)
    }

    fn refresh_accounting(&mut self) {
        let Some(tracker) = self.mem_tracker.as_ref() else {
            return;
        };
        let bytes = self.tracked_bytes();
        let delta = bytes - self.accounted_bytes;
        if delta > 0 {
            tracker.consume(delta);
        } else if delta < 0 {
            tracker.release(-delta);
        }
        self.accounted_bytes = bytes;
    }
}

impl Drop for JoinHashTable {
    fn drop(&mut self) {
        if let Some(tracker) = self.mem_tracker.as_ref() {
            tracker.release(self.accounted_bytes);
        }
    }
}

/// Streaming iterator over the match chains of one probe chunk.
///
/// Each `next` call walks every live chain one candidate forward, verifies
/// all join conditions vector-at-a-time, and emits at most one chunk of
/// matched output. When the chains are exhausted, the join-type specific
/// tail (outer padding, semi/anti selection, mark column) is emitted once.
pub(crate) struct ScanStructure {
    keys: RecordBatch,
    probe: Chunk,
    chains: Vec<u64>,
    matched_any: Vec<bool>,
    tail_emitted: bool,
}

impl ScanStructure {
    pub(crate) fn next(&mut self, ht: &JoinHashTable) -> Result<Option<RecordBatch>, JoinError> {
        let spec = Arc::clone(ht.spec());
        loop {
            let mut sel: Vec<u32> = Vec::new();
            let mut refs: Vec<(usize, usize)> = Vec::new();
            for (row, &chain) in self.chains.iter().enumerate() {
                if chain != NULL_ROW_REF {
                    sel.push(row as u32);
                    refs.push(unpack_row_ref(chain));
                }
            }
            if sel.is_empty() {
                if self.tail_emitted {
                    return Ok(None);
                }
                self.tail_emitted = true;
                return self.emit_tail(ht, &spec);
            }

            let match_mask = self.evaluate_conditions(ht, &spec, &sel, &refs)?;

            let mut matched_sel: Vec<u32> = Vec::new();
            let mut matched_refs: Vec<(usize, usize)> = Vec::new();
            for (idx, &probe_row) in sel.iter().enumerate() {
                let row = probe_row as usize;
                let is_match = match_mask.value(idx);
                let (block, block_row) = refs[idx];
                if is_match {
                    self.matched_any[row] = true;
                    if spec.join_type.is_right_outer() {
                        ht.blocks()[block].matched_slot(block_row).store(true, Ordering::Relaxed);
                    }
                    matched_sel.push(probe_row);
                    matched_refs.push((block, block_row));
                }
                // Advance the chain; SINGLE keeps only the first match.
                if is_match && spec.join_type == JoinType::Single {
                    self.chains[row] = NULL_ROW_REF;
                } else {
                    self.chains[row] = ht.next_of(block, block_row);
                }
            }

            let emits_pairs = !matches!(
                spec.join_type,
                JoinType::Semi | JoinType::Anti | JoinType::Mark
            );
            if emits_pairs && !matched_sel.is_empty() {
                let batch = self.emit_pairs(ht, &spec, &matched_sel, &matched_refs)?;
                return Ok(Some(batch));
            }
        }
    }

    /// Compare the probe keys of the selected rows against their current
    /// chain candidates under every join condition.
    fn evaluate_conditions(
        &self,
        ht: &JoinHashTable,
        spec: &HashJoinSpec,
        sel: &[u32],
        refs: &[(usize, usize)],
    ) -> Result<BooleanArray, JoinError> {
        let indices = UInt32Array::from(sel.to_vec());
        let build_keys = ht.gather_stored_columns(0, spec.key_count(), refs)?;
        let mut mask: Option<BooleanArray> = None;
        for (col, cond) in spec.conditions.iter().enumerate() {
            let probe_values = take(self.keys.column(col).as_ref(), &indices, None)
                .map_err(|e| JoinError::internal("PROBE", format!("gather probe keys: {e}")))?;
            let result = compare(cond.comparator, probe_values.as_ref(), build_keys[col].as_ref())?;
            mask = Some(match mask {
                None => result,
                Some(acc) => and_kleene(&acc, &result)
                    .map_err(|e| JoinError::internal("PROBE", format!("combine masks: {e}")))?,
            });
        }
        let mask = mask.ok_or_else(|| JoinError::internal("PROBE", "no join conditions"))?;
        // NULL comparisons never match
        Ok(if mask.null_count() > 0 {
            prep_null_mask_filter(&mask)
        } else {
            mask
        })
    }

    /// Matched probe/build row pairs in probe-row order.
    fn emit_pairs(
        &self,
        ht: &JoinHashTable,
        spec: &HashJoinSpec,
        sel: &[u32],
        refs: &[(usize, usize)],
    ) -> Result<RecordBatch, JoinError> {
        let indices = UInt32Array::from(sel.to_vec());
        let mut columns: Vec<ArrayRef> = Vec::new();
        for col in self.probe.columns() {
            let taken = take(col.as_ref(), &indices, None)
                .map_err(|e| JoinError::internal("PROBE", format!("gather probe rows: {e}")))?;
            columns.push(taken);
        }
        let payload = ht.gather_stored_columns(
            spec.key_count(),
            ht.row_schema.fields().len(),
            refs,
        )?;
        columns.extend(payload);
        RecordBatch::try_new(spec.output_schema(), columns)
            .map_err(|e| JoinError::internal("PROBE", format!("assemble join output: {e}")))
    }

    fn emit_tail(
        &self,
        ht: &JoinHashTable,
        spec: &HashJoinSpec,
    ) -> Result<Option<RecordBatch>, JoinError> {
        match spec.join_type {
            JoinType::Inner | JoinType::Right => Ok(None),
            JoinType::Left | JoinType::Full | JoinType::Single => {
                let unmatched: Vec<u32> = self
                    .matched_any
                    .iter()
                    .enumerate()
                    .filter(|(_, &m)| !m)
                    .map(|(row, _)| row as u32)
                    .collect();
                if unmatched.is_empty() {
                    return Ok(None);
                }
                let indices = UInt32Array::from(unmatched.clone());
                let mut columns: Vec<ArrayRef> = Vec::new();
                for col in self.probe.columns() {
                    let taken = take(col.as_ref(), &indices, None).map_err(|e| {
                        JoinError::internal("PROBE", format!("gather probe rows: {e}"))
                    })?;
                    columns.push(taken);
                }
                for &col in &spec.payload_columns() {
                    let field = spec.build_schema.field(col);
                    columns.push(new_null_array(field.data_type(), unmatched.len()));
                }
                let batch = RecordBatch::try_new(spec.output_schema(), columns).map_err(|e| {
                    JoinError::internal("PROBE", format!("assemble outer output: {e}"))
                })?;
                Ok(Some(batch))
            }
            JoinType::Semi | JoinType::Anti => {
                let want = spec.join_type == JoinType::Semi;
                let rows: Vec<u32> = self
                    .matched_any
                    .iter()
                    .enumerate()
                    .filter(|(_, &m)| m == want)
                    .map(|(row, _)| row as u32)
                    .collect();
                if rows.is_empty() {
                    return Ok(None);
                }
                let indices = UInt32Array::from(rows);
                let mut columns: Vec<ArrayRef> = Vec::new();
                for col in self.probe.columns() {
                    let taken = take(col.as_ref(), &indices, None).map_err(|e| {
                        JoinError::internal("PROBE", format!("gather probe rows: {e}"))
                    })?;
                    columns.push(taken);
                }
                let batch = RecordBatch::try_new(spec.output_schema(), columns).map_err(|e| {
                    JoinError::internal("PROBE", format!("assemble semi/anti output: {e}"))
                })?;
                Ok(Some(batch))
            }
            JoinType::Mark => {
                let mark = self.build_mark_column(ht, spec)?;
                let mut columns: Vec<ArrayRef> = self.probe.columns().to_vec();
                columns.push(mark);
                let batch = RecordBatch::try_new(spec.output_schema(), columns).map_err(|e| {
                    JoinError::internal("PROBE", format!("assemble mark output: {e}"))
                })?;
                Ok(Some(batch))
            }
        }
    }

    /// Mark semantics: matched rows are true; unmatched rows become NULL when
    /// the build side saw a NULL key or the probe key itself is NULL, and
    /// false otherwise.
    fn build_mark_column(
        &self,
        ht: &JoinHashTable,
        spec: &HashJoinSpec,
    ) -> Result<ArrayRef, JoinError> {
        let num_rows = self.probe.len();
        let mut values: Vec<Option<bool>> = Vec::with_capacity(num_rows);
        for row in 0..num_rows {
            if self.matched_any[row] {
                values.push(Some(true));
                continue;
            }
            let probe_key_null = spec
                .conditions
                .iter()
                .enumerate()
                .filter(|(_, cond)| cond.comparator == Comparator::Eq)
                .any(|(col, _)| self.keys.column(col).is_null(row));
            if probe_key_null || ht.has_null_key() {
                values.push(None);
            } else {
                values.push(Some(false));
            }
        }
        Ok(Arc::new(BooleanArray::from(values)) as ArrayRef)
    }
}

fn compare(
    comparator: Comparator,
    left: &dyn Array,
    right: &dyn Array,
) -> Result<BooleanArray, JoinError> {
    let result = match comparator {
        Comparator::Eq => cmp::eq(&left, &right),
        Comparator::NotEq => cmp::neq(&left, &right),
        Comparator::Lt => cmp::lt(&left, &right),
        Comparator::LtEq => cmp::lt_eq(&left, &right),
        Comparator::Gt => cmp::gt(&left, &right),
        Comparator::GtEq => cmp::gt_eq(&left, &right),
    };
    result.map_err(|e| JoinError::internal("PROBE", format!("compare join keys: {e}")))
}
