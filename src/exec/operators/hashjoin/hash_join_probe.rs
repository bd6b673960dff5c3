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
//! Hash-join probe operator and external source stage machine.
//!
//! Responsibilities:
//! - Streams probe chunks against the finalized build: perfect-table
//!   dispatch, in-memory chain probing, or probe-and-spill on the
//!   out-of-core path.
//! - After probe input ends, drives the external BUILD/PROBE/SCAN_HT stage
//!   machine cooperatively with the other probe drivers, and runs the
//!   unmatched-build scan for right-preserving joins.
//!
//! Key exported interfaces:
//! - Types: `HashJoinProbeFactory`.

use std::collections::VecDeque;
use std::sync::Arc;

use arrow::array::{ArrayRef, BooleanArray, RecordBatch, UInt32Array, UInt64Array, new_null_array};
use arrow::compute::{take, take_record_batch};

use super::hash::hash_key_columns;
use super::join_error::JoinError;
use super::join_hash_table::ScanStructure;
use super::join_spec::{HashJoinSpec, JoinType};
use super::perfect_join::probe_perfect_hash_table;
use super::shared::{HashJoinSharedState, SourceStage, SourceSync};
use crate::exec::chunk::{CHUNK_CAPACITY, Chunk};
use crate::exec::pipeline::dependency::DependencyHandle;
use crate::exec::pipeline::operator::{Operator, ProcessorOperator};
use crate::exec::pipeline::operator_factory::OperatorFactory;
use crate::flintrocks_logging::debug;
use crate::runtime::runtime_state::RuntimeState;

/// Factory for hash-join probe operators.
pub struct HashJoinProbeFactory {
    name: String,
    shared: Arc<HashJoinSharedState>,
}

impl HashJoinProbeFactory {
    pub fn new(shared: Arc<HashJoinSharedState>) -> Self {
        let name = format!("HASH_JOIN_PROBE (pipeline={})", shared.spec().pipeline_id);
        Self { name, shared }
    }
}

impl OperatorFactory for HashJoinProbeFactory {
    fn name(&self) -> &str {
        &self.name
    }

    fn create(&self, _dop: i32, driver_id: i32) -> Box<dyn Operator> {
        debug!(
            "HashJoinProbe create: pipeline={} driver_id={} join_type={}",
            self.shared.spec().pipeline_id,
            driver_id,
            self.shared.spec().join_type.as_str()
        );
        Box::new(HashJoinProbeOperator {
            name: self.name.clone(),
            driver_id,
            shared: Arc::clone(&self.shared),
            output: VecDeque::new(),
            input_finished: false,
            finished: false,
            local_stage: SourceStage::Init,
            build_range: None,
            replay_chunk: None,
            replay_scan: None,
            outer_refs: None,
            outer_claimed: 0,
            input_rows: 0,
            output_rows: 0,
        })
    }
}

struct HashJoinProbeOperator {
    name: String,
    driver_id: i32,
    shared: Arc<HashJoinSharedState>,
    output: VecDeque<Chunk>,
    input_finished: bool,
    finished: bool,
    /// The stage this driver last claimed work for.
    local_stage: SourceStage,
    build_range: Option<(usize, usize)>,
    replay_chunk: Option<Chunk>,
    replay_scan: Option<ScanStructure>,
    outer_refs: Option<Vec<(usize, usize)>>,
    outer_claimed: usize,
    input_rows: u64,
    output_rows: u64,
}

impl Operator for HashJoinProbeOperator {
    fn name(&self) -> &str {
        &self.name
    }

    fn is_finished(&self) -> bool {
        self.finished
    }

    fn pending_finish(&self) -> bool {
        self.input_finished && !self.finished
    }

    fn as_processor_mut(&mut self) -> Option<&mut dyn ProcessorOperator> {
        Some(self)
    }

    fn as_processor_ref(&self) -> Option<&dyn ProcessorOperator> {
        Some(self)
    }
}

impl ProcessorOperator for HashJoinProbeOperator {
    fn need_input(&self) -> bool {
        !self.input_finished && !self.finished
    }

    fn has_output(&self) -> bool {
        !self.output.is_empty() || (self.input_finished && !self.finished)
    }

    fn push_chunk(&mut self, _state: &RuntimeState, chunk: Chunk) -> Result<(), String> {
        if self.finished || self.input_finished || chunk.is_empty() {
            return Ok(());
        }
        if !self.shared.is_finalized() {
            return Err(JoinError::internal(
                "PROBE",
                "probe chunk arrived before build finalization",
            )
            .to_string());
        }
        self.shared.check_finalize_error()?;
        if self.shared.is_suspended() || self.shared.no_output_possible() {
            self.finished = true;
            return Ok(());
        }
        self.input_rows = self.input_rows.saturating_add(chunk.len() as u64);

        let shared = Arc::clone(&self.shared);
        let spec = Arc::clone(shared.spec());
        if let Some(perfect) = shared.perfect.get() {
            let batch =
                probe_perfect_hash_table(perfect, &spec, &chunk).map_err(|e| e.to_string())?;
            self.push_output(batch);
            return Ok(());
        }

        if shared.is_external() {
            self.probe_and_spill(&spec, chunk).map_err(|e| e.to_string())
        } else {
            let global = shared.global_table.read().unwrap_or_else(|e| e.into_inner());
            if global.count() == 0 {
                if let Some(batch) = construct_empty_join_result(&spec, &chunk)? {
                    self.push_output(batch);
                }
                return Ok(());
            }
            let keys = probe_key_batch(&spec, &chunk)?;
            let mut scan = global
                .probe(keys, chunk, None)
                .map_err(|e| e.to_string())?;
            while let Some(batch) = scan.next(&global).map_err(|e| e.to_string())? {
                self.push_output(batch);
            }
            Ok(())
        }
    }

    fn pull_chunk(&mut self, _state: &RuntimeState) -> Result<Option<Chunk>, String> {
        if let Some(chunk) = self.output.pop_front() {
            return Ok(Some(chunk));
        }
        if !self.input_finished || self.finished {
            return Ok(None);
        }
        self.shared.check_finalize_error()?;
        if self.shared.is_suspended() || self.shared.no_output_possible() {
            self.finish_with_log();
            return Ok(None);
        }

        if !self.shared.is_external() {
            self.in_memory_outer_pass()?;
            match self.output.pop_front() {
                Some(chunk) => Ok(Some(chunk)),
                None => {
                    self.finish_with_log();
                    Ok(None)
                }
            }
        } else {
            self.drive_external()?;
            match self.output.pop_front() {
                Some(chunk) => Ok(Some(chunk)),
                None => {
                    if self.shared.stage() == SourceStage::Done && self.task_finished() {
                        self.finish_with_log();
                    }
                    Ok(None)
                }
            }
        }
    }

    fn set_finishing(&mut self, _state: &RuntimeState) -> Result<(), String> {
        if !self.input_finished {
            self.input_finished = true;
            debug!(
                "HashJoinProbe input finished: pipeline={} driver_id={} input_rows={}",
                self.shared.spec().pipeline_id,
                self.driver_id,
                self.input_rows
            );
        }
        Ok(())
    }

    fn precondition_dependency(&self) -> Option<DependencyHandle> {
        Some(self.shared.build_ready())
    }
}

impl HashJoinProbeOperator {
    fn push_output(&mut self, batch: RecordBatch) {
        if batch.num_rows() == 0 {
            return;
        }
        self.output_rows = self.output_rows.saturating_add(batch.num_rows() as u64);
        self.output.push_back(Chunk::new(batch));
    }

    fn finish_with_log(&mut self) {
        if !self.finished {
            self.finished = true;
            debug!(
                "HashJoinProbe finished: pipeline={} driver_id={} input_rows={} output_rows={}",
                self.shared.spec().pipeline_id,
                self.driver_id,
                self.input_rows,
                self.output_rows
            );
        }
    }

    /// Out-of-core probe: rows of the loaded partition are probed now, rows
    /// of later partitions are deferred to the spill with their hash.
    fn probe_and_spill(&mut self, spec: &HashJoinSpec, chunk: Chunk) -> Result<(), JoinError> {
        let shared = Arc::clone(&self.shared);
        let global = shared.global_table.read().unwrap_or_else(|e| e.into_inner());
        let keys = probe_key_batch(spec, &chunk).map_err(|e| JoinError::internal("PROBE", e))?;
        let hashes = hash_key_columns(keys.columns(), &spec.equality_mask(), keys.num_rows())
            .map_err(JoinError::Unsupported)?;
        let partition_count = global.partition_count();
        let current = global.current_partition().ok_or_else(|| {
            JoinError::internal("PROBE", "external probe before first partition load")
        })?;
        let mask = (partition_count - 1) as u64;
        let spill = shared.init_probe_spill(partition_count);

        let mut by_partition: Vec<Vec<u32>> = vec![Vec::new(); partition_count];
        for (row, hash) in hashes.iter().enumerate() {
            by_partition[(hash & mask) as usize].push(row as u32);
        }

        for (partition, rows) in by_partition.iter().enumerate() {
            if partition == current || rows.is_empty() {
                continue;
            }
            let indices = UInt32Array::from(rows.clone());
            let mut columns: Vec<ArrayRef> =
                Vec::with_capacity(keys.num_columns() + chunk.columns().len() + 1);
            for col in keys.columns() {
                let taken = take(col.as_ref(), &indices, None).map_err(|e| {
                    JoinError::internal_at("PROBE", partition, format!("gather spill keys: {e}"))
                })?;
                columns.push(taken);
            }
            for col in chunk.columns() {
                let taken = take(col.as_ref(), &indices, None).map_err(|e| {
                    JoinError::internal_at("PROBE", partition, format!("gather spill rows: {e}"))
                })?;
                columns.push(taken);
            }
            let row_hashes: Vec<u64> = rows.iter().map(|&row| hashes[row as usize]).collect();
            columns.push(Arc::new(UInt64Array::from(row_hashes)));
            let batch = RecordBatch::try_new(spill.schema().clone(), columns).map_err(|e| {
                JoinError::internal_at("PROBE", partition, format!("assemble spill chunk: {e}"))
            })?;
            spill.append(partition, Chunk::new(batch))?;
        }

        let rows = &by_partition[current];
        if rows.is_empty() {
            return Ok(());
        }
        let indices = UInt32Array::from(rows.clone());
        let current_keys = take_record_batch(&keys, &indices)
            .map_err(|e| JoinError::internal("PROBE", format!("gather current keys: {e}")))?;
        let current_probe = take_record_batch(&chunk.batch, &indices)
            .map_err(|e| JoinError::internal("PROBE", format!("gather current rows: {e}")))?;
        let current_hashes: Vec<u64> = rows.iter().map(|&row| hashes[row as usize]).collect();
        let mut scan = global.probe(current_keys, Chunk::new(current_probe), Some(current_hashes))?;
        while let Some(batch) = scan.next(&global)? {
            self.push_output(batch);
        }
        Ok(())
    }

    /// One cooperative unmatched-row pass for the in-memory path.
    fn in_memory_outer_pass(&mut self) -> Result<(), String> {
        let shared = Arc::clone(&self.shared);
        if !shared.spec().join_type.is_right_outer() {
            return Ok(());
        }
        loop {
            let (refs, claimed) = {
                let mut src = shared.source.lock().unwrap_or_else(|e| e.into_inner());
                let global = shared.global_table.read().unwrap_or_else(|e| e.into_inner());
                if !src.in_memory_outer_started {
                    src.in_memory_outer_started = true;
                    src.full_outer.reset(global.count());
                }
                let (refs, claimed) = global.scan_full_outer(&mut src.full_outer, CHUNK_CAPACITY);
                src.full_outer.scanned += claimed;
                (refs, claimed)
            };
            if claimed == 0 {
                return Ok(());
            }
            if refs.is_empty() {
                continue;
            }
            let gathered = {
                let global = shared.global_table.read().unwrap_or_else(|e| e.into_inner());
                global.gather_full_outer(&refs).map_err(|e| e.to_string())?
            };
            if let Some(batch) = gathered {
                self.push_output(batch);
            }
        }
    }

    //===--------------------------------------------------------------===//
    // External source stage machine
    //===--------------------------------------------------------------===//

    /// Loop assigning and executing stage work until output is produced or
    /// the stage machine reaches DONE.
    fn drive_external(&mut self) -> Result<(), String> {
        let spec = Arc::clone(self.shared.spec());
        if self.shared.stage() == SourceStage::Init {
            self.initialize_source(&spec).map_err(|e| e.to_string())?;
        }
        loop {
            if !self.task_finished() || self.assign_task().map_err(|e| e.to_string())? {
                self.execute_task(&spec).map_err(|e| e.to_string())?;
            } else {
                self.try_prepare_next_stage(&spec).map_err(|e| e.to_string())?;
                if self.shared.stage() == SourceStage::Done && self.task_finished() {
                    return Ok(());
                }
                std::thread::yield_now();
            }
            if !self.output.is_empty() {
                return Ok(());
            }
        }
    }

    /// Once per operator: freeze the probe spill, size the per-thread block
    /// share, and stage the loaded partition's deferred probe chunks.
    fn initialize_source(&mut self, spec: &HashJoinSpec) -> Result<(), JoinError> {
        let mut src = self.shared.source.lock().unwrap_or_else(|e| e.into_inner());
        if src.initialized {
            return Ok(());
        }
        src.initialized = true;
        let global = self
            .shared
            .global_table
            .read()
            .unwrap_or_else(|e| e.into_inner());
        let spill = self.shared.init_probe_spill(global.partition_count());
        spill.finalize();
        src.build_blocks_per_thread = global
            .block_count()
            .div_ceil(self.shared.worker_count())
            .max(1);
        let current = global.current_partition().ok_or_else(|| {
            JoinError::internal("INIT", "external source before first partition load")
        })?;
        src.probe_chunk_count = spill.prepare_partition(current)?;
        src.probe_chunk_done = 0;
        if spec.join_type.is_right_outer() {
            src.full_outer.reset(global.count());
        }
        debug!(
            "external source init: pipeline={} partitions={} first_probe_chunks={}",
            spec.pipeline_id,
            global.partition_count(),
            src.probe_chunk_count
        );
        drop(global);
        drop(src);
        self.shared.set_stage(SourceStage::Probe);
        Ok(())
    }

    fn task_finished(&self) -> bool {
        match self.local_stage {
            SourceStage::Init | SourceStage::Done => true,
            SourceStage::Build => self.build_range.is_none(),
            SourceStage::Probe => self.replay_scan.is_none() && self.replay_chunk.is_none(),
            SourceStage::ScanHt => self.outer_refs.is_none(),
        }
    }

    /// Claim work for the current global stage under the source lock.
    fn assign_task(&mut self) -> Result<bool, JoinError> {
        let shared = Arc::clone(&self.shared);
        let mut src = shared.source.lock().unwrap_or_else(|e| e.into_inner());
        match shared.stage() {
            SourceStage::Build => {
                if src.build_block_idx < src.build_block_count {
                    let start = src.build_block_idx;
                    let end = (start + src.build_blocks_per_thread).min(src.build_block_count);
                    src.build_block_idx = end;
                    self.build_range = Some((start, end));
                    self.local_stage = SourceStage::Build;
                    return Ok(true);
                }
            }
            SourceStage::Probe => {
                if let Some(spill) = shared.probe_spill() {
                    if let Some(chunk) = spill.assign_chunk() {
                        self.replay_chunk = Some(chunk);
                        self.local_stage = SourceStage::Probe;
                        return Ok(true);
                    }
                }
            }
            SourceStage::ScanHt => {
                let global = shared.global_table.read().unwrap_or_else(|e| e.into_inner());
                let (refs, claimed) = global.scan_full_outer(&mut src.full_outer, CHUNK_CAPACITY);
                if claimed > 0 {
                    self.outer_refs = Some(refs);
                    self.outer_claimed = claimed;
                    self.local_stage = SourceStage::ScanHt;
                    return Ok(true);
                }
            }
            SourceStage::Init | SourceStage::Done => {}
        }
        Ok(false)
    }

    fn execute_task(&mut self, spec: &HashJoinSpec) -> Result<(), JoinError> {
        let shared = Arc::clone(&self.shared);
        match self.local_stage {
            SourceStage::Build => {
                let Some((start, end)) = self.build_range.take() else {
                    return Ok(());
                };
                {
                    let global = shared.global_table.read().unwrap_or_else(|e| e.into_inner());
                    for block in start..end {
                        global.finalize_range(block, block + 1, true)?;
                    }
                }
                let mut src = shared.source.lock().unwrap_or_else(|e| e.into_inner());
                src.build_block_done += end - start;
            }
            SourceStage::Probe => {
                if self.replay_scan.is_none() {
                    let Some(chunk) = self.replay_chunk.take() else {
                        return Ok(());
                    };
                    let (keys, probe, hashes) = split_spill_chunk(spec, &chunk)?;
                    let global = shared.global_table.read().unwrap_or_else(|e| e.into_inner());
                    self.replay_scan = Some(global.probe(keys, probe, Some(hashes))?);
                }
                let step = {
                    let global = shared.global_table.read().unwrap_or_else(|e| e.into_inner());
                    let scan = self.replay_scan.as_mut().expect("replay scan present");
                    scan.next(&global)?
                };
                match step {
                    Some(batch) => self.push_output(batch),
                    None => {
                        self.replay_scan = None;
                        let mut src = shared.source.lock().unwrap_or_else(|e| e.into_inner());
                        src.probe_chunk_done += 1;
                    }
                }
            }
            SourceStage::ScanHt => {
                let Some(refs) = self.outer_refs.take() else {
                    return Ok(());
                };
                let gathered = {
                    let global = shared.global_table.read().unwrap_or_else(|e| e.into_inner());
                    global.gather_full_outer(&refs)?
                };
                if let Some(batch) = gathered {
                    self.push_output(batch);
                }
                let mut src = shared.source.lock().unwrap_or_else(|e| e.into_inner());
                src.full_outer.scanned += self.outer_claimed;
                drop(src);
                self.outer_claimed = 0;
            }
            SourceStage::Init | SourceStage::Done => {
                return Err(JoinError::internal(
                    shared.stage().as_str(),
                    "worker executed a task without claiming one",
                ));
            }
        }
        Ok(())
    }

    /// Stage transition rule, applied under the source lock.
    fn try_prepare_next_stage(&self, spec: &HashJoinSpec) -> Result<(), JoinError> {
        let mut src = self.shared.source.lock().unwrap_or_else(|e| e.into_inner());
        match self.shared.stage() {
            SourceStage::Build => {
                if src.build_block_done == src.build_block_count {
                    {
                        let mut global = self
                            .shared
                            .global_table
                            .write()
                            .unwrap_or_else(|e| e.into_inner());
                        global.set_finalized(true);
                    }
                    prepare_probe(&self.shared, &mut src, spec)?;
                }
            }
            SourceStage::Probe => {
                if src.probe_chunk_done == src.probe_chunk_count {
                    if spec.join_type.is_right_outer() {
                        self.shared.set_stage(SourceStage::ScanHt);
                    } else {
                        prepare_build(&self.shared, &mut src)?;
                    }
                }
            }
            SourceStage::ScanHt => {
                if src.full_outer.scanned == src.full_outer.total {
                    prepare_build(&self.shared, &mut src)?;
                }
            }
            SourceStage::Init | SourceStage::Done => {}
        }
        Ok(())
    }
}

/// Stage the next partition's deferred probe chunks. Caller holds the source
/// lock.
fn prepare_probe(
    shared: &Arc<HashJoinSharedState>,
    src: &mut SourceSync,
    spec: &HashJoinSpec,
) -> Result<(), JoinError> {
    let global = shared.global_table.read().unwrap_or_else(|e| e.into_inner());
    let spill = shared
        .probe_spill()
        .ok_or_else(|| JoinError::internal("PROBE", "probe spill missing in source stage"))?;
    let current = global
        .current_partition()
        .ok_or_else(|| JoinError::internal("PROBE", "no partition loaded for probing"))?;
    src.probe_chunk_count = spill.prepare_partition(current)?;
    src.probe_chunk_done = 0;
    if spec.join_type.is_right_outer() {
        src.full_outer.reset(global.count());
    }
    debug!(
        "external source probe: partition={} chunks={}",
        current, src.probe_chunk_count
    );
    drop(global);
    shared.set_stage(SourceStage::Probe);
    Ok(())
}

/// Load the next partition and set up its pointer-table build, or finish the
/// stage machine when none remain. Caller holds the source lock.
fn prepare_build(
    shared: &Arc<HashJoinSharedState>,
    src: &mut SourceSync,
) -> Result<(), JoinError> {
    let mut global = shared
        .global_table
        .write()
        .unwrap_or_else(|e| e.into_inner());
    if !global.prepare_external_finalize() {
        drop(global);
        shared.set_stage(SourceStage::Done);
        return Ok(());
    }
    global.initialize_pointer_table()?;
    src.build_block_idx = 0;
    src.build_block_count = global.block_count();
    src.build_block_done = 0;
    src.build_blocks_per_thread = global
        .block_count()
        .div_ceil(shared.worker_count())
        .max(1);
    debug!(
        "external source build: partition={:?} blocks={} rows={}",
        global.current_partition(),
        src.build_block_count,
        global.count()
    );
    drop(global);
    shared.set_stage(SourceStage::Build);
    Ok(())
}

/// Probe-side condition columns of a probe chunk, in condition order.
fn probe_key_batch(spec: &HashJoinSpec, chunk: &Chunk) -> Result<RecordBatch, String> {
    let indices: Vec<usize> = spec.conditions.iter().map(|c| c.probe_column).collect();
    chunk
        .batch
        .project(&indices)
        .map_err(|e| format!("project probe keys: {e}"))
}

/// Split a spilled chunk back into (keys, probe payload, hashes).
fn split_spill_chunk(
    spec: &HashJoinSpec,
    chunk: &Chunk,
) -> Result<(RecordBatch, Chunk, Vec<u64>), JoinError> {
    let key_count = spec.key_count();
    let probe_width = spec.probe_schema.fields().len();
    let keys = chunk
        .batch
        .project(&(0..key_count).collect::<Vec<_>>())
        .map_err(|e| JoinError::internal("PROBE", format!("split spill keys: {e}")))?;
    let probe = chunk
        .batch
        .project(&(key_count..key_count + probe_width).collect::<Vec<_>>())
        .map_err(|e| JoinError::internal("PROBE", format!("split spill payload: {e}")))?;
    let hashes = chunk
        .batch
        .column(key_count + probe_width)
        .as_any()
        .downcast_ref::<UInt64Array>()
        .ok_or_else(|| JoinError::internal("PROBE", "spill hash column has wrong type"))?
        .values()
        .to_vec();
    Ok((keys, Chunk::new(probe), hashes))
}

/// Join output for a probe chunk against an empty build side, for the join
/// types that still produce rows.
fn construct_empty_join_result(
    spec: &HashJoinSpec,
    chunk: &Chunk,
) -> Result<Option<RecordBatch>, String> {
    match spec.join_type {
        JoinType::Inner | JoinType::Right | JoinType::Semi => Ok(None),
        JoinType::Left | JoinType::Full | JoinType::Single => {
            let mut columns: Vec<ArrayRef> = chunk.columns().to_vec();
            for &col in &spec.payload_columns() {
                let field = spec.build_schema.field(col);
                columns.push(new_null_array(field.data_type(), chunk.len()));
            }
            let batch = RecordBatch::try_new(spec.output_schema(), columns)
                .map_err(|e| format!("assemble empty-build output: {e}"))?;
            Ok(Some(batch))
        }
        JoinType::Anti => {
            let batch = RecordBatch::try_new(spec.output_schema(), chunk.columns().to_vec())
                .map_err(|e| format!("assemble empty-build output: {e}"))?;
            Ok(Some(batch))
        }
        JoinType::Mark => {
            let mut columns: Vec<ArrayRef> = chunk.columns().to_vec();
            columns.push(Arc::new(BooleanArray::from(vec![
                Some(false);
                chunk.len()
            ])) as ArrayRef);
            let batch = RecordBatch::try_new(spec.output_schema(), columns)
                .map_err(|e| format!("assemble empty-build output: {e}"))?;
            Ok(Some(batch))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exec::operators::hashjoin::join_spec::{Comparator, JoinCondition};
    use arrow::array::{Int32Array, StringArray};
    use arrow::datatypes::{DataType, Field, Schema};

    fn spec(join_type: JoinType) -> HashJoinSpec {
        HashJoinSpec {
            join_type,
            conditions: vec![JoinCondition {
                probe_column: 0,
                build_column: 0,
                comparator: Comparator::Eq,
            }],
            right_projection_map: vec![],
            probe_schema: Arc::new(Schema::new(vec![
                Field::new("k", DataType::Int32, true),
                Field::new("name", DataType::Utf8, true),
            ])),
            build_schema: Arc::new(Schema::new(vec![Field::new("k", DataType::Int32, true)])),
            perfect_join_stats: None,
            can_go_external: false,
            pipeline_id: 9,
            estimated_probe_count: 0,
        }
    }

    fn chunk() -> Chunk {
        let schema = Arc::new(Schema::new(vec![
            Field::new("k", DataType::Int32, true),
            Field::new("name", DataType::Utf8, true),
        ]));
        Chunk::new(
            RecordBatch::try_new(
                schema,
                vec![
                    Arc::new(Int32Array::from(vec![1, 2])) as ArrayRef,
                    Arc::new(StringArray::from(vec!["a", "b"])) as ArrayRef,
                ],
            )
            .unwrap(),
        )
    }

    #[test]
    fn empty_build_left_join_null_extends() {
        let spec = spec(JoinType::Left);
        let batch = construct_empty_join_result(&spec, &chunk()).unwrap().unwrap();
        assert_eq!(batch.num_rows(), 2);
        assert_eq!(batch.column(2).null_count(), 2);
    }

    #[test]
    fn empty_build_mark_join_is_all_false() {
        let spec = spec(JoinType::Mark);
        let batch = construct_empty_join_result(&spec, &chunk()).unwrap().unwrap();
        let marks = batch
            .column(2)
            .as_any()
            .downcast_ref::<BooleanArray>()
            .unwrap();
        assert_eq!(marks.false_count(), 2);
    }

    #[test]
    fn empty_build_inner_join_produces_nothing() {
        let spec = spec(JoinType::Inner);
        assert!(construct_empty_join_result(&spec, &chunk()).unwrap().is_none());
    }
}
