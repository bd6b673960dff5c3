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
//! Pipeline dependency primitives.
//!
//! Responsibilities:
//! - Defines readiness handles used by operators to gate probe execution on
//!   build-side completion.
//! - Used by drivers to block until asynchronous finalize events finish.
//!
//! Key exported interfaces:
//! - Types: `Dependency`, `DependencyHandle`.

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;

use crate::flintrocks_logging::debug;

static NEXT_DEP_ID: AtomicUsize = AtomicUsize::new(1);

/// Reference-counted handle to one pipeline dependency object.
pub type DependencyHandle = Arc<Dependency>;

/// Dependency primitive used to model blocked/unblocked execution conditions.
pub struct Dependency {
    id: usize,
    name: String,
    ready: AtomicBool,
    waiters: Mutex<()>,
    condvar: Condvar,
}

impl fmt::Debug for Dependency {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Dependency")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("ready", &self.is_ready())
            .finish()
    }
}

impl Dependency {
    pub fn new(name: impl Into<String>) -> DependencyHandle {
        Arc::new(Self {
            id: NEXT_DEP_ID.fetch_add(1, Ordering::Relaxed),
            name: name.into(),
            ready: AtomicBool::new(false),
            waiters: Mutex::new(()),
            condvar: Condvar::new(),
        })
    }

    pub fn id(&self) -> usize {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::Acquire)
    }

    pub fn set_ready(&self) {
        let prev = self.ready.swap(true, Ordering::AcqRel);
        if !prev {
            let _guard = self.waiters.lock().unwrap_or_else(|e| e.into_inner());
            self.condvar.notify_all();
            debug!("Dependency ready: dep_id={} name={}", self.id, self.name);
        }
    }

    /// Block until the dependency is ready or the timeout elapses.
    /// Returns whether the dependency became ready.
    pub fn wait_ready(&self, timeout: Duration) -> bool {
        if self.is_ready() {
            return true;
        }
        let mut guard = self.waiters.lock().unwrap_or_else(|e| e.into_inner());
        let deadline = std::time::Instant::now() + timeout;
        while !self.is_ready() {
            let now = std::time::Instant::now();
            if now >= deadline {
                return false;
            }
            let (next, _timeout_res) = self
                .condvar
                .wait_timeout(guard, deadline - now)
                .unwrap_or_else(|e| e.into_inner());
            guard = next;
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ready_wakes_waiter() {
        let dep = Dependency::new("test");
        let waiter = Arc::clone(&dep);
        let handle = std::thread::spawn(move || waiter.wait_ready(Duration::from_secs(5)));
        dep.set_ready();
        assert!(handle.join().unwrap());
        assert!(dep.is_ready());
    }

    #[test]
    fn wait_times_out_when_not_ready() {
        let dep = Dependency::new("never");
        assert!(!dep.wait_ready(Duration::from_millis(10)));
    }
}
