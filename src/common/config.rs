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
use crate::flintrocks_config::config as flintrocks_app_config;

pub(crate) fn worker_count() -> usize {
    let configured = flintrocks_app_config()
        .ok()
        .map(|c| c.runtime.worker_count)
        .unwrap_or(0);
    if configured > 0 {
        return configured;
    }
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
}

pub(crate) fn buffer_pool_max_bytes() -> u64 {
    flintrocks_app_config()
        .ok()
        .map(|c| c.runtime.buffer_pool_max_bytes)
        .unwrap_or(4 * 1024 * 1024 * 1024)
}

pub(crate) fn parallel_scan_chunk_count() -> usize {
    let count = flintrocks_app_config()
        .ok()
        .map(|c| c.runtime.parallel_scan_chunk_count)
        .unwrap_or(120);
    if join_verify_parallelism() { 1 } else { count.max(1) }
}

pub(crate) fn join_force_external() -> bool {
    flintrocks_app_config()
        .ok()
        .map(|c| c.join.force_external)
        .unwrap_or(false)
}

pub(crate) fn join_verify_parallelism() -> bool {
    flintrocks_app_config()
        .ok()
        .map(|c| c.join.verify_parallelism)
        .unwrap_or(false)
}
