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
//! Hash-join operator module exports.
//!
//! Responsibilities:
//! - Registers the build-sink and probe operators and their shared state.
//! - Exposes the plan-time join specification consumed by pipeline graph
//!   construction.

mod hash;
mod hash_join_build_sink;
mod hash_join_probe;
mod join_error;
mod join_hash_table;
mod join_spec;
mod perfect_join;
mod probe_spill;
mod row_block;
pub(crate) mod shared;

pub use hash_join_build_sink::HashJoinBuildSinkFactory;
pub use hash_join_probe::HashJoinProbeFactory;
pub use join_spec::{Comparator, HashJoinSpec, JoinCondition, JoinType, PerfectJoinStats};
pub use shared::HashJoinSharedState;
