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
//! Hash-join build sink and finalize orchestration.
//!
//! Responsibilities:
//! - Consumes build-side chunks into per-worker hash tables, swizzling under
//!   memory pressure and flipping the join to its out-of-core path.
//! - The last finishing worker orchestrates finalize: resume from checkpoint
//!   state, cooperative suspension, perfect-path selection, and the parallel
//!   partition and pointer-table construction events.
//!
//! Key exported interfaces:
//! - Types: `HashJoinBuildSinkFactory`.

use std::collections::BTreeMap;
use std::mem::size_of;
use std::sync::Arc;
use std::sync::atomic::AtomicBool;

use arrow::array::RecordBatch;
use arrow::compute::concat_batches;
use arrow::datatypes::Schema;
use arrow::record_batch::RecordBatchOptions;

use super::join_error::JoinError;
use super::join_hash_table::JoinHashTable;
use super::join_spec::HashJoinSpec;
use super::perfect_join::{build_perfect_hash_table, can_do_perfect_hash_join};
use super::shared::{FinalizeTask, HashJoinSharedState, schedule_finalize_tasks};
use crate::checkpoint::codec::{
    ColumnDoc, PartitionDocument, SuspendTableDocument, array_from_column_doc,
    build_chunk_column_name, column_doc_from_array, join_key_column_name, read_document,
    write_document,
};
use crate::checkpoint::list_partition_files;
use crate::common::config;
use crate::exec::chunk::Chunk;
use crate::exec::pipeline::operator::{Operator, ProcessorOperator};
use crate::exec::pipeline::operator_factory::OperatorFactory;
use crate::flintrocks_logging::{debug, error, info};
use crate::runtime::mem_tracker::MemTracker;
use crate::runtime::runtime_state::RuntimeState;

/// Below this build row count the pointer table is built single-threaded.
const PARALLEL_CONSTRUCT_THRESHOLD: usize = 1 << 20;

/// Factory for hash-join build sinks that construct build-side hash tables.
pub struct HashJoinBuildSinkFactory {
    name: String,
    shared: Arc<HashJoinSharedState>,
}

impl HashJoinBuildSinkFactory {
    pub fn new(shared: Arc<HashJoinSharedState>) -> Self {
        let name = format!(
            "HASH_JOIN_BUILD (pipeline={})",
            shared.spec().pipeline_id
        );
        Self { name, shared }
    }
}

impl OperatorFactory for HashJoinBuildSinkFactory {
    fn name(&self) -> &str {
        &self.name
    }

    fn create(&self, _dop: i32, driver_id: i32) -> Box<dyn Operator> {
        debug!(
            "HashJoinBuildSink create: pipeline={} driver_id={} join_type={} conditions={} can_go_external={}",
            self.shared.spec().pipeline_id,
            driver_id,
            self.shared.spec().join_type.as_str(),
            self.shared.spec().conditions.len(),
            self.shared.spec().can_go_external
        );
        Box::new(HashJoinBuildSinkOperator {
            name: self.name.clone(),
            driver_id,
            shared: Arc::clone(&self.shared),
            local_table: None,
            finished: false,
            input_rows: 0,
            input_chunks: 0,
            suspend_flushed_blocks: 0,
            logged_first_input: false,
            mem_tracker: None,
        })
    }

    fn is_sink(&self) -> bool {
        true
    }
}

struct HashJoinBuildSinkOperator {
    name: String,
    driver_id: i32,
    shared: Arc<HashJoinSharedState>,
    local_table: Option<JoinHashTable>,
    finished: bool,
    input_rows: u64,
    input_chunks: u64,
    /// Local blocks already written out by external suspension.
    suspend_flushed_blocks: usize,
    logged_first_input: bool,
    mem_tracker: Option<Arc<MemTracker>>,
}

impl Operator for HashJoinBuildSinkOperator {
    fn name(&self) -> &str {
        &self.name
    }

    fn set_mem_tracker(&mut self, tracker: Arc<MemTracker>) {
        let table = MemTracker::new_child("BuildHashTable", &tracker);
        if let Some(local) = self.local_table.as_mut() {
            local.set_mem_tracker(Arc::clone(&table));
        }
        self.mem_tracker = Some(table);
    }

    fn is_finished(&self) -> bool {
        self.finished
    }

    fn as_processor_mut(&mut self) -> Option<&mut dyn ProcessorOperator> {
        Some(self)
    }

    fn as_processor_ref(&self) -> Option<&dyn ProcessorOperator> {
        Some(self)
    }
}

impl ProcessorOperator for HashJoinBuildSinkOperator {
    fn need_input(&self) -> bool {
        !self.finished
    }

    fn has_output(&self) -> bool {
        false
    }

    fn push_chunk(&mut self, _state: &RuntimeState, chunk: Chunk) -> Result<(), String> {
        if self.finished || chunk.is_empty() {
            return Ok(());
        }
        if !self.logged_first_input {
            self.logged_first_input = true;
            debug!(
                "HashJoinBuildSink first input: pipeline={} driver_id={} rows={}",
                self.shared.spec().pipeline_id,
                self.driver_id,
                chunk.len()
            );
        }
        self.input_rows = self.input_rows.saturating_add(chunk.len() as u64);
        self.input_chunks = self.input_chunks.saturating_add(1);

        let spec = Arc::clone(self.shared.spec());
        let keys = build_key_batch(&spec, &chunk)?;
        let payload = build_payload_batch(&spec, &chunk)?;

        if self.local_table.is_none() {
            let mut table = JoinHashTable::new(Arc::clone(&spec));
            if let Some(tracker) = self.mem_tracker.as_ref() {
                table.set_mem_tracker(Arc::clone(tracker));
            }
            self.local_table = Some(table);
        }
        let local = self.local_table.as_mut().expect("local build table");
        local.build(&keys, &payload).map_err(|e| e.to_string())?;

        // Mid-sink serialization for the external path, gated on the latched
        // snapshot taken after an earlier chunk's swizzle decision.
        self.maybe_external_suspend()?;

        // swizzle if we reach the per-worker memory limit
        if spec.can_go_external {
            let local = self.local_table.as_mut().expect("local build table");
            let approx_pointer_bytes = local.count() * 3 * size_of::<u64>();
            if local.size_in_bytes() + approx_pointer_bytes
                >= self.shared.budget().sink_memory_per_worker
            {
                local.swizzle_blocks().map_err(|e| e.to_string())?;
                self.shared.set_external();
            }
        }
        self.shared.latch_suspend_snapshot();
        Ok(())
    }

    fn pull_chunk(&mut self, _state: &RuntimeState) -> Result<Option<Chunk>, String> {
        Ok(None)
    }

    fn set_finishing(&mut self, state: &RuntimeState) -> Result<(), String> {
        if self.finished {
            return Ok(());
        }
        self.finished = true;
        debug!(
            "HashJoinBuildSink finishing: pipeline={} driver_id={} input_rows={} input_chunks={}",
            self.shared.spec().pipeline_id,
            self.driver_id,
            self.input_rows,
            self.input_chunks
        );

        // Suspension latched mid-sink: persist whatever this worker still
        // holds before it combines.
        if self.shared.checkpoint().suspend_started() && self.shared.suspend_snapshot() {
            self.flush_local_blocks_for_suspend()?;
        }

        let last_worker = {
            let mut sink = self.shared.sink.lock().unwrap_or_else(|e| e.into_inner());
            if let Some(local) = self.local_table.take() {
                sink.local_tables.push(local);
            }
            sink.remaining_workers = sink.remaining_workers.saturating_sub(1);
            sink.remaining_workers == 0
        };
        if last_worker {
            run_finalize(&self.shared, state)?;
        }
        Ok(())
    }
}

impl HashJoinBuildSinkOperator {
    /// External suspension: once the deadline passes on a latched external
    /// snapshot, every block this worker has built (including the chunk just
    /// appended) is serialized as a numbered partition file.
    fn maybe_external_suspend(&mut self) -> Result<(), String> {
        let ctrl = Arc::clone(self.shared.checkpoint());
        if !self.shared.suspend_snapshot() {
            return Ok(());
        }
        if !ctrl.suspend_started() && !ctrl.deadline_reached() {
            return Ok(());
        }
        if ctrl.latch_suspend() {
            ctrl.record_finalized_pipeline(self.shared.spec().pipeline_id);
            info!(
                "external join suspension latched: pipeline={} driver_id={}",
                self.shared.spec().pipeline_id,
                self.driver_id
            );
        }
        self.flush_local_blocks_for_suspend()
    }

    fn flush_local_blocks_for_suspend(&mut self) -> Result<(), String> {
        let Some(local) = self.local_table.as_mut() else {
            return Ok(());
        };
        let ctrl = self.shared.checkpoint();
        let spec = self.shared.spec();
        let pipelines = ctrl.finalized_pipelines();
        for block_idx in self.suspend_flushed_blocks..local.block_count() {
            let batch = local.block_batch(block_idx).map_err(|e| e.to_string())?;
            let document = partition_document_from_rows(spec, &batch, pipelines.clone())?;
            let path = ctrl.next_partition_file()?;
            if let Err(e) = write_document(&path, &document) {
                // The unrenamed temporary never becomes part of the manifest.
                error!("external suspension write failed: {e}");
                return Err(JoinError::Serialization(e).to_string());
            }
        }
        self.suspend_flushed_blocks = local.block_count();
        Ok(())
    }
}

//===------------------------------------------------------------------===//
// Finalize orchestration
//===------------------------------------------------------------------===//

/// Runs on the last sink worker. Heavy phases (partitioning, pointer-table
/// construction) are scheduled as pool tasks; probe drivers wait on the
/// build-ready dependency which the completion hooks set.
fn run_finalize(shared: &Arc<HashJoinSharedState>, state: &RuntimeState) -> Result<(), String> {
    let spec = Arc::clone(shared.spec());
    let ctrl = Arc::clone(shared.checkpoint());
    let cancel = state.cancel_flag();

    if ctrl.resume_requested() && ctrl.resume_covers_pipeline(spec.pipeline_id)? {
        return if ctrl.has_resume_folder() {
            info!("resuming external hash join: pipeline={}", spec.pipeline_id);
            resume_external(shared, cancel)
        } else {
            info!("resuming in-memory hash join: pipeline={}", spec.pipeline_id);
            resume_in_memory(shared, cancel)
        };
    }

    // External suspension already serialized partitions chunk by chunk in the
    // sink; finish the checkpoint instead of finalizing.
    if shared.is_external() && ctrl.suspend_started() {
        ctrl.complete_suspend();
        return Ok(());
    }

    // In-memory suspension happens here, at finalize entry.
    if !shared.is_external() && ctrl.suspend_requested() && ctrl.deadline_reached() {
        ctrl.latch_suspend();
        ctrl.record_finalized_pipeline(spec.pipeline_id);
        suspend_in_memory(shared)?;
        ctrl.complete_suspend();
        return Ok(());
    }

    if shared.is_external() {
        return schedule_external_finalize(shared, cancel);
    }

    merge_local_tables(shared);
    finish_in_memory_build(shared, cancel)
}

fn merge_local_tables(shared: &Arc<HashJoinSharedState>) {
    let locals = {
        let mut sink = shared.sink.lock().unwrap_or_else(|e| e.into_inner());
        std::mem::take(&mut sink.local_tables)
    };
    let mut global = shared
        .global_table
        .write()
        .unwrap_or_else(|e| e.into_inner());
    for local in locals {
        global.merge(local);
    }
}

/// In-memory path after the global table holds all rows: empty-build
/// short-circuit, perfect attempt, or pointer-table construction.
fn finish_in_memory_build(
    shared: &Arc<HashJoinSharedState>,
    cancel: Arc<AtomicBool>,
) -> Result<(), String> {
    let spec = Arc::clone(shared.spec());
    let count = {
        let global = shared.global_table.read().unwrap_or_else(|e| e.into_inner());
        global.count()
    };

    if count == 0 {
        let mut global = shared
            .global_table
            .write()
            .unwrap_or_else(|e| e.into_inner());
        global.set_finalized(true);
        drop(global);
        if spec.join_type.empty_result_if_build_empty() {
            shared.set_no_output();
        }
        shared.set_finalized();
        shared.build_ready().set_ready();
        return Ok(());
    }

    if can_do_perfect_hash_join(&spec) {
        let stats = spec.perfect_join_stats.expect("perfect stats present");
        let built = {
            let global = shared.global_table.read().unwrap_or_else(|e| e.into_inner());
            build_perfect_hash_table(&global, &stats).map_err(|e| e.to_string())?
        };
        if let Some(table) = built {
            debug!(
                "perfect hash join selected: pipeline={} build_size={} dense={}",
                spec.pipeline_id,
                table.build_size(),
                table.is_dense()
            );
            let _ = shared.perfect.set(table);
            // The hashed pointer table is never built on this path.
            let mut global = shared
                .global_table
                .write()
                .unwrap_or_else(|e| e.into_inner());
            global.set_finalized(true);
            drop(global);
            shared.set_finalized();
            shared.build_ready().set_ready();
            return Ok(());
        }
    }

    schedule_pointer_table_build(shared, cancel, move |shared| {
        let mut global = shared
            .global_table
            .write()
            .unwrap_or_else(|e| e.into_inner());
        global.set_finalized(true);
        drop(global);
        shared.set_finalized();
        shared.build_ready().set_ready();
    });
    Ok(())
}

/// Schedule pointer-table construction over the active block collection and
/// run `on_complete` when every range task finished.
fn schedule_pointer_table_build(
    shared: &Arc<HashJoinSharedState>,
    cancel: Arc<AtomicBool>,
    on_complete: impl FnOnce(&Arc<HashJoinSharedState>) + Send + 'static,
) {
    let (block_count, count) = {
        let mut global = shared
            .global_table
            .write()
            .unwrap_or_else(|e| e.into_inner());
        if let Err(e) = global.initialize_pointer_table() {
            drop(global);
            shared.record_finalize_error(e.to_string());
            on_complete(shared);
            return;
        }
        (global.block_count(), global.count())
    };

    let parallel = count >= PARALLEL_CONSTRUCT_THRESHOLD || config::join_verify_parallelism();
    let mut tasks: Vec<FinalizeTask> = Vec::new();
    if !parallel {
        let cancel = Arc::clone(&cancel);
        tasks.push(Box::new(move |shared| {
            finalize_block_range(shared, 0, block_count, false, &cancel)
        }));
    } else {
        let workers = shared.worker_count();
        let blocks_per_thread = block_count.div_ceil(workers).max(1);
        let mut block_idx = 0;
        while block_idx < block_count {
            let start = block_idx;
            let end = (start + blocks_per_thread).min(block_count);
            let cancel = Arc::clone(&cancel);
            tasks.push(Box::new(move |shared| {
                finalize_block_range(shared, start, end, true, &cancel)
            }));
            block_idx = end;
        }
    }
    schedule_finalize_tasks(shared, tasks, on_complete);
}

fn finalize_block_range(
    shared: &Arc<HashJoinSharedState>,
    start: usize,
    end: usize,
    parallel: bool,
    cancel: &AtomicBool,
) -> Result<(), JoinError> {
    let global = shared.global_table.read().unwrap_or_else(|e| e.into_inner());
    for block in start..end {
        if cancel.load(std::sync::atomic::Ordering::Acquire) {
            return Err(JoinError::internal("BUILD", "query cancelled"));
        }
        global.finalize_range(block, block + 1, parallel)?;
    }
    Ok(())
}

/// External path: one partition task per local table, then load the first
/// partition and build its pointer table.
fn schedule_external_finalize(
    shared: &Arc<HashJoinSharedState>,
    cancel: Arc<AtomicBool>,
) -> Result<(), String> {
    let spec = Arc::clone(shared.spec());
    let locals = {
        let mut sink = shared.sink.lock().unwrap_or_else(|e| e.into_inner());
        std::mem::take(&mut sink.local_tables)
    };
    let total_rows: usize = locals.iter().map(JoinHashTable::count).sum();
    let radix_bits = {
        let mut global = shared
            .global_table
            .write()
            .unwrap_or_else(|e| e.into_inner());
        global.compute_partition_sizes(
            &locals,
            shared.budget().max_ht_size,
            shared.worker_count(),
        );
        global.radix_bits()
    };
    debug!(
        "external join partitioning: pipeline={} locals={} rows={} radix_bits={}",
        spec.pipeline_id,
        locals.len(),
        total_rows,
        radix_bits
    );

    let mut tasks: Vec<FinalizeTask> = Vec::with_capacity(locals.len());
    for local in locals {
        tasks.push(Box::new(move |shared| {
            let parts = local.partition_rows(radix_bits)?;
            let mut global = shared
                .global_table
                .write()
                .unwrap_or_else(|e| e.into_inner());
            global.absorb_partitioned(parts)
        }));
    }

    let empty_result =
        total_rows == 0 && spec.join_type.empty_result_if_build_empty();
    schedule_finalize_tasks(shared, tasks, move |shared| {
        let prepared = {
            let mut global = shared
                .global_table
                .write()
                .unwrap_or_else(|e| e.into_inner());
            global.prepare_external_finalize()
        };
        if !prepared {
            shared.record_finalize_error(
                JoinError::internal("FINALIZE", "external join with no partitions").to_string(),
            );
            shared.set_finalized();
            shared.build_ready().set_ready();
            return;
        }
        schedule_pointer_table_build(shared, cancel, move |shared| {
            let mut global = shared
                .global_table
                .write()
                .unwrap_or_else(|e| e.into_inner());
            global.set_finalized(true);
            drop(global);
            if empty_result {
                shared.set_no_output();
            }
            shared.set_finalized();
            shared.build_ready().set_ready();
        });
    });
    Ok(())
}

//===------------------------------------------------------------------===//
// Suspend / resume
//===------------------------------------------------------------------===//

/// In-memory suspension: merge, prefer serializing the dense perfect table,
/// otherwise fall back to the raw merged rows in the same document shape.
fn suspend_in_memory(shared: &Arc<HashJoinSharedState>) -> Result<(), String> {
    let spec = Arc::clone(shared.spec());
    let ctrl = Arc::clone(shared.checkpoint());
    merge_local_tables(shared);

    let global = shared.global_table.read().unwrap_or_else(|e| e.into_inner());
    let rows = 'rows: {
        // Key-only joins have no payload columns to gather the dense table
        // from, so their state is serialized row-wise.
        if can_do_perfect_hash_join(&spec) && !spec.payload_columns().is_empty() {
            let stats = spec.perfect_join_stats.expect("perfect stats present");
            if let Some(table) = build_perfect_hash_table(&global, &stats).map_err(|e| e.to_string())? {
                let filled = arrow::array::UInt32Array::from(table.filled_indices());
                let mut columns = Vec::new();
                for dense in table.key_columns().iter().chain(table.build_columns()) {
                    let compact = arrow::compute::take(dense.as_ref(), &filled, None)
                        .map_err(|e| format!("compact perfect table: {e}"))?;
                    columns.push(compact);
                }
                break 'rows RecordBatch::try_new(global.row_schema().clone(), columns)
                    .map_err(|e| format!("assemble perfect checkpoint rows: {e}"))?;
            }
        }
        let mut batches = Vec::with_capacity(global.blocks().len());
        for block in global.blocks() {
            batches.push(block.batch().map_err(|e| e.to_string())?.clone());
        }
        if batches.is_empty() {
            RecordBatch::new_empty(global.row_schema().clone())
        } else {
            concat_batches(global.row_schema(), &batches)
                .map_err(|e| format!("concat checkpoint rows: {e}"))?
        }
    };

    let mut columns = BTreeMap::new();
    document_columns(&spec, &rows, &mut columns)?;
    let document = SuspendTableDocument {
        pipeline_complete: ctrl.finalized_pipelines(),
        column_size: spec.payload_columns().len(),
        build_size: rows.num_rows(),
        columns,
    };
    info!(
        "in-memory join suspension: pipeline={} build_size={}",
        spec.pipeline_id,
        rows.num_rows()
    );
    if let Err(e) = write_document(ctrl.suspend_file()?, &document) {
        // Exit anyway; the unrenamed temporary marks the checkpoint invalid.
        error!("in-memory suspension write failed: {e}");
    }
    Ok(())
}

/// Rebuild the sink state from a single in-memory checkpoint document, then
/// continue with the regular in-memory finalize.
fn resume_in_memory(
    shared: &Arc<HashJoinSharedState>,
    cancel: Arc<AtomicBool>,
) -> Result<(), String> {
    let spec = Arc::clone(shared.spec());
    let ctrl = Arc::clone(shared.checkpoint());
    let document: SuspendTableDocument = read_document(ctrl.resume_file()?)?;
    if document.column_size != spec.payload_columns().len() {
        return Err(JoinError::Resume(format!(
            "checkpoint has {} build columns, plan expects {}",
            document.column_size,
            spec.payload_columns().len()
        ))
        .to_string());
    }
    let (keys, payload) = batches_from_document(&spec, &document.columns, document.build_size)?;

    // One table built from all column groups, merged once.
    let mut restored = JoinHashTable::new(Arc::clone(&spec));
    restored.build(&keys, &payload).map_err(|e| e.to_string())?;
    {
        let mut global = shared
            .global_table
            .write()
            .unwrap_or_else(|e| e.into_inner());
        global.reset();
        global.merge(restored);
    }
    {
        let mut sink = shared.sink.lock().unwrap_or_else(|e| e.into_inner());
        sink.local_tables.clear();
    }
    finish_in_memory_build(shared, cancel)
}

/// Rebuild one local table per partition file, then run the regular external
/// partition + pointer-table pipeline.
fn resume_external(
    shared: &Arc<HashJoinSharedState>,
    cancel: Arc<AtomicBool>,
) -> Result<(), String> {
    let spec = Arc::clone(shared.spec());
    let ctrl = Arc::clone(shared.checkpoint());
    if !spec.can_go_external {
        return Err(JoinError::Resume(
            "external checkpoint for a join that cannot go external".to_string(),
        )
        .to_string());
    }
    let files = list_partition_files(ctrl.resume_folder()?)?;
    if files.is_empty() {
        return Err(JoinError::Resume(format!(
            "no partition files under {}",
            ctrl.resume_folder()?.display()
        ))
        .to_string());
    }

    let mut locals = Vec::with_capacity(files.len());
    for file in &files {
        let document: PartitionDocument = read_document(file)?;
        let (keys, payload) = batches_from_document(&spec, &document.columns, document.build_size)?;
        let mut local = JoinHashTable::new(Arc::clone(&spec));
        local.build(&keys, &payload).map_err(|e| e.to_string())?;
        locals.push(local);
    }
    info!(
        "external join resume: pipeline={} partition_files={}",
        spec.pipeline_id,
        files.len()
    );
    {
        let mut global = shared
            .global_table
            .write()
            .unwrap_or_else(|e| e.into_inner());
        global.reset();
    }
    {
        let mut sink = shared.sink.lock().unwrap_or_else(|e| e.into_inner());
        sink.local_tables = locals;
    }
    shared.set_external();
    schedule_external_finalize(shared, cancel)
}

//===------------------------------------------------------------------===//
// Chunk and document shaping
//===------------------------------------------------------------------===//

/// Condition columns of a build chunk, in condition order.
fn build_key_batch(spec: &HashJoinSpec, chunk: &Chunk) -> Result<RecordBatch, String> {
    let indices: Vec<usize> = spec.conditions.iter().map(|c| c.build_column).collect();
    chunk
        .batch
        .project(&indices)
        .map_err(|e| format!("project join keys: {e}"))
}

/// Payload columns of a build chunk: projected, whole, or empty for key-only
/// join types.
fn build_payload_batch(spec: &HashJoinSpec, chunk: &Chunk) -> Result<RecordBatch, String> {
    let columns = spec.payload_columns();
    if columns.is_empty() {
        return RecordBatch::try_new_with_options(
            Arc::new(Schema::empty()),
            vec![],
            &RecordBatchOptions::new().with_row_count(Some(chunk.len())),
        )
        .map_err(|e| format!("empty payload chunk: {e}"));
    }
    chunk
        .batch
        .project(&columns)
        .map_err(|e| format!("project build payload: {e}"))
}

/// Serialize stored rows (keys then payload) into document column groups.
fn document_columns(
    spec: &HashJoinSpec,
    rows: &RecordBatch,
    columns: &mut BTreeMap<String, ColumnDoc>,
) -> Result<(), String> {
    let key_count = spec.key_count();
    for key in 0..key_count {
        columns.insert(
            join_key_column_name(key),
            column_doc_from_array(rows.column(key))?,
        );
    }
    for payload in 0..rows.num_columns() - key_count {
        columns.insert(
            build_chunk_column_name(payload),
            column_doc_from_array(rows.column(key_count + payload))?,
        );
    }
    Ok(())
}

fn partition_document_from_rows(
    spec: &HashJoinSpec,
    rows: &RecordBatch,
    pipeline_ids: Vec<u64>,
) -> Result<PartitionDocument, String> {
    let mut columns = BTreeMap::new();
    document_columns(spec, rows, &mut columns)?;
    Ok(PartitionDocument {
        pipeline_ids,
        build_size: rows.num_rows(),
        columns,
    })
}

/// Decode document column groups back into (keys, payload) batches, checking
/// them against the operator plan.
fn batches_from_document(
    spec: &HashJoinSpec,
    columns: &BTreeMap<String, ColumnDoc>,
    build_size: usize,
) -> Result<(RecordBatch, RecordBatch), String> {
    fn resume_column(
        columns: &BTreeMap<String, ColumnDoc>,
        build_size: usize,
        name: String,
        expected: &arrow::datatypes::DataType,
    ) -> Result<arrow::array::ArrayRef, JoinError> {
        let doc = columns
            .get(&name)
            .ok_or_else(|| JoinError::Resume(format!("checkpoint column {name} missing")))?;
        let array = array_from_column_doc(doc).map_err(JoinError::Resume)?;
        if array.data_type() != expected {
            return Err(JoinError::Resume(format!(
                "checkpoint column {name} has type {}, plan expects {expected}",
                array.data_type()
            )));
        }
        if array.len() != build_size {
            return Err(JoinError::Resume(format!(
                "checkpoint column {name} has {} rows, document says {build_size}",
                array.len()
            )));
        }
        Ok(array)
    }

    let mut key_arrays = Vec::with_capacity(spec.key_count());
    for (key, cond) in spec.conditions.iter().enumerate() {
        let expected = spec.build_schema.field(cond.build_column).data_type();
        key_arrays.push(
            resume_column(columns, build_size, join_key_column_name(key), expected)
                .map_err(|e| e.to_string())?,
        );
    }
    let key_schema = spec
        .stored_row_schema()
        .project(&(0..spec.key_count()).collect::<Vec<_>>())
        .map_err(|e| format!("project key schema: {e}"))?;
    let keys = RecordBatch::try_new(Arc::new(key_schema), key_arrays)
        .map_err(|e| format!("assemble resumed keys: {e}"))?;

    let payload_columns = spec.payload_columns();
    let payload = if payload_columns.is_empty() {
        RecordBatch::try_new_with_options(
            Arc::new(Schema::empty()),
            vec![],
            &RecordBatchOptions::new().with_row_count(Some(build_size)),
        )
        .map_err(|e| format!("empty resumed payload: {e}"))?
    } else {
        let mut payload_arrays = Vec::with_capacity(payload_columns.len());
        for (idx, &col) in payload_columns.iter().enumerate() {
            let expected = spec.build_schema.field(col).data_type();
            payload_arrays.push(
                resume_column(columns, build_size, build_chunk_column_name(idx), expected)
                    .map_err(|e| e.to_string())?,
            );
        }
        let payload_schema = spec
            .stored_row_schema()
            .project(
                &(spec.key_count()..spec.key_count() + payload_columns.len()).collect::<Vec<_>>(),
            )
            .map_err(|e| format!("project payload schema: {e}"))?;
        RecordBatch::try_new(Arc::new(payload_schema), payload_arrays)
            .map_err(|e| format!("assemble resumed payload: {e}"))?
    };
    Ok((keys, payload))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exec::operators::hashjoin::join_spec::{
        Comparator, JoinCondition, JoinType,
    };
    use arrow::array::{ArrayRef, Int32Array, Int64Array};
    use arrow::datatypes::{DataType, Field};

    fn spec() -> HashJoinSpec {
        HashJoinSpec {
            join_type: JoinType::Inner,
            conditions: vec![JoinCondition {
                probe_column: 0,
                build_column: 0,
                comparator: Comparator::Eq,
            }],
            right_projection_map: vec![1],
            probe_schema: Arc::new(Schema::new(vec![Field::new("k", DataType::Int32, true)])),
            build_schema: Arc::new(Schema::new(vec![
                Field::new("k", DataType::Int32, true),
                Field::new("amount", DataType::Int64, true),
            ])),
            perfect_join_stats: None,
            can_go_external: true,
            pipeline_id: 1,
            estimated_probe_count: 0,
        }
    }

    fn rows(spec: &HashJoinSpec, keys: Vec<i32>, amounts: Vec<i64>) -> RecordBatch {
        RecordBatch::try_new(
            spec.stored_row_schema(),
            vec![
                Arc::new(Int32Array::from(keys)) as ArrayRef,
                Arc::new(Int64Array::from(amounts)) as ArrayRef,
            ],
        )
        .unwrap()
    }

    #[test]
    fn document_roundtrip_restores_keys_and_payload() {
        let spec = spec();
        let rows = rows(&spec, vec![1, 2, 3], vec![10, 20, 30]);
        let document = partition_document_from_rows(&spec, &rows, vec![1]).unwrap();
        assert_eq!(document.build_size, 3);
        assert!(document.columns.contains_key("join_key_0"));
        assert!(document.columns.contains_key("build_chunk_0"));

        let (keys, payload) = batches_from_document(&spec, &document.columns, 3).unwrap();
        assert_eq!(keys.num_rows(), 3);
        assert_eq!(payload.num_rows(), 3);
        assert_eq!(keys.column(0).as_ref(), rows.column(0).as_ref());
        assert_eq!(payload.column(0).as_ref(), rows.column(1).as_ref());
    }

    #[test]
    fn document_type_mismatch_is_a_resume_failure() {
        let spec = spec();
        let rows = rows(&spec, vec![1], vec![10]);
        let mut document = partition_document_from_rows(&spec, &rows, vec![1]).unwrap();
        let key = document.columns.get_mut("join_key_0").unwrap();
        key.type_tag = crate::checkpoint::codec::LogicalTypeTag::Utf8 as i32;
        key.data = crate::checkpoint::codec::ColumnValues::Text(vec![Some("x".to_string())]);
        let err = batches_from_document(&spec, &document.columns, 1).unwrap_err();
        assert!(err.contains("resume"), "unexpected error: {err}");
    }

    #[test]
    fn missing_document_column_is_a_resume_failure() {
        let spec = spec();
        let columns = BTreeMap::new();
        assert!(batches_from_document(&spec, &columns, 0).is_err());
    }
}
