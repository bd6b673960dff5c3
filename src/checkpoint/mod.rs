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
//! Ratchet checkpoint coordination.
//!
//! Responsibilities:
//! - Owns the cooperative suspension deadline, latched suspension state, and
//!   the partition-file counter used by mid-sink serialization.
//! - Resolves resume manifests so finalize can decide whether a pipeline's
//!   build state is restored from disk instead of rebuilt.
//!
//! Key exported interfaces:
//! - Types: `CheckpointController`, `CheckpointOptions`.

pub mod codec;

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, OnceLock};
use std::time::{Duration, Instant};

use crate::flintrocks_logging::info;

use codec::{PartitionDocument, SuspendTableDocument, read_document};

pub const PARTITION_FILE_PREFIX: &str = "part-";
pub const PARTITION_FILE_SUFFIX: &str = ".ratchet";

/// Host-provided checkpoint parameters. Paths are opaque strings from the
/// embedding process; the deadline is milliseconds from query start.
#[derive(Debug, Default, Clone)]
pub struct CheckpointOptions {
    pub suspend_point_ms: Option<u64>,
    pub suspend_file: Option<PathBuf>,
    pub suspend_folder: Option<PathBuf>,
    pub resume_file: Option<PathBuf>,
    pub resume_folder: Option<PathBuf>,
    /// Terminate the process with a zero exit once suspension state has been
    /// written. Embedding tests disable this to observe suspension in-process.
    pub exit_on_suspend: bool,
}

/// Process-wide coordination for cooperative suspend/resume.
///
/// One owner (the query coordinator) constructs the controller; workers borrow
/// it read-only for deadline checks, and the single suspending worker drives
/// serialization through it.
#[derive(Debug)]
pub struct CheckpointController {
    opts: CheckpointOptions,
    start: Instant,
    suspend_started: AtomicBool,
    suspended: AtomicBool,
    partition_counter: AtomicU64,
    finalized_pipelines: Mutex<Vec<u64>>,
    resume_manifest: OnceLock<Result<Vec<u64>, String>>,
}

impl CheckpointController {
    pub fn new(opts: CheckpointOptions) -> Arc<Self> {
        Arc::new(Self {
            opts,
            start: Instant::now(),
            suspend_started: AtomicBool::new(false),
            suspended: AtomicBool::new(false),
            partition_counter: AtomicU64::new(0),
            finalized_pipelines: Mutex::new(Vec::new()),
            resume_manifest: OnceLock::new(),
        })
    }

    /// Controller with suspension and resume both switched off.
    pub fn disabled() -> Arc<Self> {
        Self::new(CheckpointOptions::default())
    }

    pub fn suspend_requested(&self) -> bool {
        self.opts.suspend_point_ms.is_some()
    }

    pub fn resume_requested(&self) -> bool {
        self.opts.resume_file.is_some() || self.opts.resume_folder.is_some()
    }

    /// Which resume variant is configured: a single in-memory state file or a
    /// folder of external partition files.
    pub fn has_resume_file(&self) -> bool {
        self.opts.resume_file.is_some()
    }

    pub fn has_resume_folder(&self) -> bool {
        self.opts.resume_folder.is_some()
    }

    pub fn deadline_reached(&self) -> bool {
        match self.opts.suspend_point_ms {
            Some(ms) => self.start.elapsed() > Duration::from_millis(ms),
            None => false,
        }
    }

    /// Latch the suspension. Returns true for the first caller only.
    pub fn latch_suspend(&self) -> bool {
        !self.suspend_started.swap(true, Ordering::AcqRel)
    }

    pub fn suspend_started(&self) -> bool {
        self.suspend_started.load(Ordering::Acquire)
    }

    /// Whether the query has fully suspended (only observable when
    /// `exit_on_suspend` is off).
    pub fn is_suspended(&self) -> bool {
        self.suspended.load(Ordering::Acquire)
    }

    pub fn record_finalized_pipeline(&self, pipeline_id: u64) {
        let mut pipelines = self
            .finalized_pipelines
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        if !pipelines.contains(&pipeline_id) {
            pipelines.push(pipeline_id);
        }
    }

    pub fn finalized_pipelines(&self) -> Vec<u64> {
        self.finalized_pipelines
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    pub fn suspend_file(&self) -> Result<&Path, String> {
        self.opts
            .suspend_file
            .as_deref()
            .ok_or_else(|| "suspend file path is not configured".to_string())
    }

    pub fn resume_file(&self) -> Result<&Path, String> {
        self.opts
            .resume_file
            .as_deref()
            .ok_or_else(|| "resume file path is not configured".to_string())
    }

    pub fn resume_folder(&self) -> Result<&Path, String> {
        self.opts
            .resume_folder
            .as_deref()
            .ok_or_else(|| "resume folder path is not configured".to_string())
    }

    /// Path of the next numbered partition file under the suspend folder.
    pub fn next_partition_file(&self) -> Result<PathBuf, String> {
        let folder = self
            .opts
            .suspend_folder
            .as_deref()
            .ok_or_else(|| "suspend folder path is not configured".to_string())?;
        let index = self.partition_counter.fetch_add(1, Ordering::AcqRel);
        Ok(folder.join(format!(
            "{PARTITION_FILE_PREFIX}{index}{PARTITION_FILE_SUFFIX}"
        )))
    }

    /// Finish a suspension: either exit the process with a zero status or, in
    /// embedded mode, mark the query suspended so drivers stop feeding it.
    pub fn complete_suspend(&self) {
        info!(
            "checkpoint suspension complete: pipelines={:?} partition_files={}",
            self.finalized_pipelines(),
            self.partition_counter.load(Ordering::Acquire)
        );
        if self.opts.exit_on_suspend {
            std::process::exit(0);
        }
        self.suspended.store(true, Ordering::Release);
    }

    /// Pipeline ids whose build state was persisted by the suspended run.
    pub fn resume_pipelines(&self) -> Result<&[u64], String> {
        let manifest = self.resume_manifest.get_or_init(|| self.load_manifest());
        match manifest {
            Ok(ids) => Ok(ids.as_slice()),
            Err(e) => Err(e.clone()),
        }
    }

    pub fn resume_covers_pipeline(&self, pipeline_id: u64) -> Result<bool, String> {
        if !self.resume_requested() {
            return Ok(false);
        }
        Ok(self.resume_pipelines()?.contains(&pipeline_id))
    }

    fn load_manifest(&self) -> Result<Vec<u64>, String> {
        if let Some(file) = self.opts.resume_file.as_deref() {
            let doc: SuspendTableDocument = read_document(file)?;
            return Ok(doc.pipeline_complete);
        }
        if let Some(folder) = self.opts.resume_folder.as_deref() {
            let files = list_partition_files(folder)?;
            let first = files
                .first()
                .ok_or_else(|| format!("no partition files under {}", folder.display()))?;
            let doc: PartitionDocument = read_document(first)?;
            return Ok(doc.pipeline_ids);
        }
        Ok(Vec::new())
    }
}

/// Enumerate `part-<N>.ratchet` files in ascending partition order.
pub fn list_partition_files(folder: &Path) -> Result<Vec<PathBuf>, String> {
    let entries = std::fs::read_dir(folder)
        .map_err(|e| format!("read resume folder {}: {e}", folder.display()))?;
    let mut files = Vec::new();
    for entry in entries {
        let entry = entry.map_err(|e| format!("read resume folder entry: {e}"))?;
        let name = entry.file_name();
        let Some(name) = name.to_str() else {
            continue;
        };
        let Some(middle) = name
            .strip_prefix(PARTITION_FILE_PREFIX)
            .and_then(|rest| rest.strip_suffix(PARTITION_FILE_SUFFIX))
        else {
            continue;
        };
        let Ok(index) = middle.parse::<u64>() else {
            continue;
        };
        files.push((index, entry.path()));
    }
    files.sort_by_key(|(index, _)| *index);
    Ok(files.into_iter().map(|(_, path)| path).collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn disabled_controller_never_suspends() {
        let ctrl = CheckpointController::disabled();
        assert!(!ctrl.suspend_requested());
        assert!(!ctrl.resume_requested());
        assert!(!ctrl.deadline_reached());
    }

    #[test]
    fn zero_deadline_fires_immediately() {
        let ctrl = CheckpointController::new(CheckpointOptions {
            suspend_point_ms: Some(0),
            ..Default::default()
        });
        std::thread::sleep(Duration::from_millis(2));
        assert!(ctrl.deadline_reached());
        assert!(ctrl.latch_suspend());
        assert!(!ctrl.latch_suspend());
        assert!(ctrl.suspend_started());
    }

    #[test]
    fn partition_files_are_numbered_in_order() {
        let dir = tempfile::tempdir().unwrap();
        let ctrl = CheckpointController::new(CheckpointOptions {
            suspend_point_ms: Some(0),
            suspend_folder: Some(dir.path().to_path_buf()),
            ..Default::default()
        });
        let a = ctrl.next_partition_file().unwrap();
        let b = ctrl.next_partition_file().unwrap();
        assert!(a.ends_with("part-0.ratchet"));
        assert!(b.ends_with("part-1.ratchet"));
    }

    #[test]
    fn list_partition_files_sorts_numerically() {
        let dir = tempfile::tempdir().unwrap();
        for index in [10u64, 2, 0] {
            std::fs::write(dir.path().join(format!("part-{index}.ratchet")), b"x").unwrap();
        }
        std::fs::write(dir.path().join("unrelated.txt"), b"x").unwrap();
        let files = list_partition_files(dir.path()).unwrap();
        let names: Vec<_> = files
            .iter()
            .map(|p| p.file_name().unwrap().to_str().unwrap().to_string())
            .collect();
        assert_eq!(names, ["part-0.ratchet", "part-2.ratchet", "part-10.ratchet"]);
    }
}
