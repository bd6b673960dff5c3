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
//! Per-query runtime state shared by operators.
//!
//! Responsibilities:
//! - Carries the query-scoped memory tracker root and the cooperative
//!   cancellation flag polled by long-running tasks.
//!
//! Key exported interfaces:
//! - Types: `RuntimeState`.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use crate::runtime::mem_tracker::MemTracker;

/// Query-scoped runtime state handed to every operator call.
#[derive(Debug, Default)]
pub struct RuntimeState {
    mem_tracker: Option<Arc<MemTracker>>,
    cancelled: Arc<AtomicBool>,
}

impl RuntimeState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_mem_tracker(tracker: Arc<MemTracker>) -> Self {
        Self {
            mem_tracker: Some(tracker),
            cancelled: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn mem_tracker(&self) -> Option<Arc<MemTracker>> {
        self.mem_tracker.as_ref().map(Arc::clone)
    }

    /// Clonable handle for tasks that outlive the operator call.
    pub fn cancel_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.cancelled)
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::Release);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }
}
