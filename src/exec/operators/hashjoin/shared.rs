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
//! Shared state for one hash-join operator pair.
//!
//! Responsibilities:
//! - Holds the per-worker sink tables, the merged global table, the finalized
//!   build variant, and the external source stage machine counters.
//! - Publishes build readiness to probe drivers through a dependency handle
//!   and runs asynchronous finalize tasks on a worker pool.
//!
//! Key exported interfaces:
//! - Types: `HashJoinSharedState`.

use std::sync::atomic::{AtomicBool, AtomicU8, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, OnceLock, RwLock};

use threadpool::ThreadPool;

use super::join_error::JoinError;
use super::join_hash_table::{FullOuterScanState, JoinHashTable};
use super::join_spec::HashJoinSpec;
use super::perfect_join::PerfectHashTable;
use super::probe_spill::ProbeSpill;
use crate::checkpoint::CheckpointController;
use crate::common::config;
use crate::exec::pipeline::dependency::{Dependency, DependencyHandle};

/// The hash table may not exceed this share of the buffer pool.
const HT_MEMORY_FRACTION: f64 = 0.60;

/// Derived memory budget for the sink and finalize phases.
#[derive(Clone, Copy, Debug)]
pub(crate) struct JoinMemoryBudget {
    pub max_ht_size: usize,
    pub sink_memory_per_worker: usize,
}

impl JoinMemoryBudget {
    pub(crate) fn from_engine_config(worker_count: usize) -> Self {
        Self::with_pool_size(config::buffer_pool_max_bytes(), worker_count)
    }

    pub(crate) fn with_pool_size(buffer_pool_max_bytes: u64, worker_count: usize) -> Self {
        let max_ht_size = (buffer_pool_max_bytes as f64 * HT_MEMORY_FRACTION) as usize;
        Self {
            max_ht_size,
            sink_memory_per_worker: (max_ht_size / worker_count.max(1)).max(1),
        }
    }
}

/// External source pipeline stages.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum SourceStage {
    Init = 0,
    Build = 1,
    Probe = 2,
    ScanHt = 3,
    Done = 4,
}

impl SourceStage {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => Self::Init,
            1 => Self::Build,
            2 => Self::Probe,
            3 => Self::ScanHt,
            _ => Self::Done,
        }
    }

    pub(crate) fn as_str(self) -> &'static str {
        match self {
            Self::Init => "INIT",
            Self::Build => "BUILD",
            Self::Probe => "PROBE",
            Self::ScanHt => "SCAN_HT",
            Self::Done => "DONE",
        }
    }
}

/// Counters guarded by the source lock; stage transitions derive from them.
#[derive(Debug, Default)]
pub(crate) struct SourceSync {
    pub build_block_idx: usize,
    pub build_block_count: usize,
    pub build_block_done: usize,
    pub build_blocks_per_thread: usize,
    pub probe_chunk_count: usize,
    pub probe_chunk_done: usize,
    pub full_outer: FullOuterScanState,
    pub initialized: bool,
    /// Guards the single unmatched-row pass of the in-memory path.
    pub in_memory_outer_started: bool,
}

/// State guarded by the sink lock.
pub(crate) struct SinkShared {
    pub local_tables: Vec<JoinHashTable>,
    pub remaining_workers: usize,
}

/// Shared state connecting the build sink, finalize orchestration, and the
/// probe/source side of one hash join.
pub struct HashJoinSharedState {
    spec: Arc<HashJoinSpec>,
    checkpoint: Arc<CheckpointController>,
    budget: JoinMemoryBudget,
    worker_count: usize,
    pub(crate) sink: Mutex<SinkShared>,
    external: AtomicBool,
    suspend_snapshot: AtomicBool,
    pub(crate) global_table: RwLock<JoinHashTable>,
    pub(crate) perfect: OnceLock<PerfectHashTable>,
    finalized: AtomicBool,
    no_output: AtomicBool,
    build_ready: DependencyHandle,
    probe_spill: OnceLock<Arc<ProbeSpill>>,
    stage: AtomicU8,
    pub(crate) source: Mutex<SourceSync>,
    pool: Mutex<Option<ThreadPool>>,
    finalize_error: Mutex<Option<String>>,
}

impl HashJoinSharedState {
    /// `worker_count` of zero means use the engine-configured parallelism.
    pub fn new(
        spec: HashJoinSpec,
        worker_count: usize,
        checkpoint: Arc<CheckpointController>,
    ) -> Result<Arc<Self>, String> {
        let worker_count = if worker_count == 0 {
            config::worker_count()
        } else {
            worker_count
        };
        let budget = JoinMemoryBudget::from_engine_config(worker_count);
        Self::with_budget(spec, worker_count, checkpoint, budget)
    }

    /// Constructor for hosts that size the join from their own buffer pool
    /// instead of the engine config.
    pub fn with_pool_size(
        spec: HashJoinSpec,
        worker_count: usize,
        checkpoint: Arc<CheckpointController>,
        buffer_pool_max_bytes: u64,
    ) -> Result<Arc<Self>, String> {
        let budget = JoinMemoryBudget::with_pool_size(buffer_pool_max_bytes, worker_count);
        Self::with_budget(spec, worker_count, checkpoint, budget)
    }

    fn with_budget(
        spec: HashJoinSpec,
        worker_count: usize,
        checkpoint: Arc<CheckpointController>,
        budget: JoinMemoryBudget,
    ) -> Result<Arc<Self>, String> {
        spec.validate()?;
        let spec = Arc::new(spec);
        let build_ready = Dependency::new(format!("join_build:{}", spec.pipeline_id));
        let global_table = JoinHashTable::new(Arc::clone(&spec));
        let force_external = spec.can_go_external && config::join_force_external();
        Ok(Arc::new(Self {
            spec,
            checkpoint,
            budget,
            worker_count: worker_count.max(1),
            sink: Mutex::new(SinkShared {
                local_tables: Vec::new(),
                remaining_workers: worker_count.max(1),
            }),
            external: AtomicBool::new(force_external),
            suspend_snapshot: AtomicBool::new(false),
            global_table: RwLock::new(global_table),
            perfect: OnceLock::new(),
            finalized: AtomicBool::new(false),
            no_output: AtomicBool::new(false),
            build_ready,
            probe_spill: OnceLock::new(),
            stage: AtomicU8::new(SourceStage::Init as u8),
            source: Mutex::new(SourceSync::default()),
            pool: Mutex::new(None),
            finalize_error: Mutex::new(None),
        }))
    }

    pub(crate) fn spec(&self) -> &Arc<HashJoinSpec> {
        &self.spec
    }

    pub(crate) fn checkpoint(&self) -> &Arc<CheckpointController> {
        &self.checkpoint
    }

    pub(crate) fn budget(&self) -> JoinMemoryBudget {
        self.budget
    }

    pub(crate) fn worker_count(&self) -> usize {
        self.worker_count
    }

    pub fn is_external(&self) -> bool {
        self.external.load(Ordering::Acquire)
    }

    pub(crate) fn set_external(&self) {
        self.external.store(true, Ordering::Release);
    }

    /// Re-sample the suspension gate. Latched only after the external flip is
    /// visible, so a worker racing the first swizzle cannot suspend against a
    /// half-set external state.
    pub(crate) fn latch_suspend_snapshot(&self) {
        if self.is_external() && self.checkpoint.suspend_requested() {
            self.suspend_snapshot.store(true, Ordering::Release);
        }
    }

    pub(crate) fn suspend_snapshot(&self) -> bool {
        self.suspend_snapshot.load(Ordering::Acquire)
    }

    pub fn is_finalized(&self) -> bool {
        self.finalized.load(Ordering::Acquire)
    }

    pub(crate) fn set_finalized(&self) {
        self.finalized.store(true, Ordering::Release);
    }

    pub fn no_output_possible(&self) -> bool {
        self.no_output.load(Ordering::Acquire)
    }

    pub(crate) fn set_no_output(&self) {
        self.no_output.store(true, Ordering::Release);
    }

    pub fn build_ready(&self) -> DependencyHandle {
        Arc::clone(&self.build_ready)
    }

    pub fn is_suspended(&self) -> bool {
        self.checkpoint.is_suspended()
    }

    pub(crate) fn stage(&self) -> SourceStage {
        SourceStage::from_u8(self.stage.load(Ordering::Acquire))
    }

    pub(crate) fn set_stage(&self, stage: SourceStage) {
        self.stage.store(stage as u8, Ordering::Release);
    }

    pub(crate) fn probe_spill(&self) -> Option<Arc<ProbeSpill>> {
        self.probe_spill.get().map(Arc::clone)
    }

    /// Create the probe spill on first use; partition count mirrors the
    /// build-side radix partitioning.
    pub(crate) fn init_probe_spill(&self, partition_count: usize) -> Arc<ProbeSpill> {
        Arc::clone(self.probe_spill.get_or_init(|| {
            Arc::new(ProbeSpill::new(
                self.spec.probe_spill_schema(),
                partition_count,
            ))
        }))
    }

    pub(crate) fn pool(&self) -> ThreadPool {
        let mut guard = self.pool.lock().unwrap_or_else(|e| e.into_inner());
        guard
            .get_or_insert_with(|| ThreadPool::new(self.worker_count))
            .clone()
    }

    pub(crate) fn record_finalize_error(&self, error: String) {
        let mut guard = self.finalize_error.lock().unwrap_or_else(|e| e.into_inner());
        if guard.is_none() {
            *guard = Some(error);
        }
    }

    pub(crate) fn check_finalize_error(&self) -> Result<(), String> {
        match self
            .finalize_error
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .as_ref()
        {
            Some(error) => Err(error.clone()),
            None => Ok(()),
        }
    }

    /// Upper bound on useful source parallelism.
    pub fn source_max_threads(&self) -> usize {
        let per_thread = crate::exec::chunk::CHUNK_CAPACITY * config::parallel_scan_chunk_count();
        (self.spec.estimated_probe_count / per_thread.max(1)).max(1)
    }
}

pub(crate) type FinalizeTask =
    Box<dyn FnOnce(&Arc<HashJoinSharedState>) -> Result<(), JoinError> + Send>;

/// Run finalize tasks on the shared pool; the last task to finish runs the
/// completion hook. Task errors are recorded on the shared state, and the
/// completion hook still runs so waiting probes get unblocked and observe the
/// error instead of hanging.
pub(crate) fn schedule_finalize_tasks(
    shared: &Arc<HashJoinSharedState>,
    tasks: Vec<FinalizeTask>,
    on_complete: impl FnOnce(&Arc<HashJoinSharedState>) + Send + 'static,
) {
    if tasks.is_empty() {
        on_complete(shared);
        return;
    }
    let remaining = Arc::new(AtomicUsize::new(tasks.len()));
    let completion: Arc<Mutex<Option<Box<dyn FnOnce(&Arc<HashJoinSharedState>) + Send>>>> =
        Arc::new(Mutex::new(Some(Box::new(on_complete))));
    let pool = shared.pool();
    for task in tasks {
        let shared = Arc::clone(shared);
        let remaining = Arc::clone(&remaining);
        let completion = Arc::clone(&completion);
        pool.execute(move || {
            if let Err(error) = task(&shared) {
                shared.record_finalize_error(error.to_string());
            }
            if remaining.fetch_sub(1, Ordering::AcqRel) == 1 {
                let hook = completion.lock().unwrap_or_else(|e| e.into_inner()).take();
                if let Some(hook) = hook {
                    hook(&shared);
                }
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn budget_is_sixty_percent_split_across_workers() {
        let budget = JoinMemoryBudget::with_pool_size(1000, 4);
        assert_eq!(budget.max_ht_size, 600);
        assert_eq!(budget.sink_memory_per_worker, 150);
    }

    #[test]
    fn stage_roundtrips_through_u8() {
        for stage in [
            SourceStage::Init,
            SourceStage::Build,
            SourceStage::Probe,
            SourceStage::ScanHt,
            SourceStage::Done,
        ] {
            assert_eq!(SourceStage::from_u8(stage as u8), stage);
        }
    }
}
