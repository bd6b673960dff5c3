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
#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use arrow::array::{
    Array, ArrayRef, BooleanArray, Int32Array, Int64Array, RecordBatch, StringArray, UInt64Array,
};
use arrow::datatypes::{DataType, Field, Schema, SchemaRef};

use flintrocks::exec::chunk::Chunk;
use flintrocks::exec::pipeline::operator::{Operator, ProcessorOperator};
use flintrocks::exec::pipeline::operator_factory::OperatorFactory;
use flintrocks::runtime::runtime_state::RuntimeState;
use flintrocks::{
    Comparator, HashJoinBuildSinkFactory, HashJoinProbeFactory, HashJoinSharedState, HashJoinSpec,
    JoinCondition, JoinType, PerfectJoinStats,
};

pub fn probe_schema() -> SchemaRef {
    Arc::new(Schema::new(vec![
        Field::new("k", DataType::Int32, true),
        Field::new("name", DataType::Utf8, true),
    ]))
}

pub fn build_schema() -> SchemaRef {
    Arc::new(Schema::new(vec![
        Field::new("k", DataType::Int32, true),
        Field::new("v", DataType::Int64, true),
    ]))
}

pub fn join_spec(join_type: JoinType, pipeline_id: u64) -> HashJoinSpec {
    HashJoinSpec {
        join_type,
        conditions: vec![JoinCondition {
            probe_column: 0,
            build_column: 0,
            comparator: Comparator::Eq,
        }],
        right_projection_map: vec![1],
        probe_schema: probe_schema(),
        build_schema: build_schema(),
        perfect_join_stats: None,
        can_go_external: true,
        pipeline_id,
        estimated_probe_count: 1 << 20,
    }
}

pub fn with_perfect_stats(mut spec: HashJoinSpec, min: i64, max: i64) -> HashJoinSpec {
    spec.perfect_join_stats = Some(PerfectJoinStats {
        build_min: min,
        build_max: max,
        is_build_small: true,
    });
    spec
}

pub fn probe_batch(rows: &[(Option<i32>, &str)]) -> RecordBatch {
    let keys: Vec<Option<i32>> = rows.iter().map(|(k, _)| *k).collect();
    let names: Vec<Option<&str>> = rows.iter().map(|(_, n)| Some(*n)).collect();
    RecordBatch::try_new(
        probe_schema(),
        vec![
            Arc::new(Int32Array::from(keys)) as ArrayRef,
            Arc::new(StringArray::from(names)) as ArrayRef,
        ],
    )
    .unwrap()
}

pub fn build_batch(rows: &[(Option<i32>, i64)]) -> RecordBatch {
    let keys: Vec<Option<i32>> = rows.iter().map(|(k, _)| *k).collect();
    let values: Vec<Option<i64>> = rows.iter().map(|(_, v)| Some(*v)).collect();
    RecordBatch::try_new(
        build_schema(),
        vec![
            Arc::new(Int32Array::from(keys)) as ArrayRef,
            Arc::new(Int64Array::from(values)) as ArrayRef,
        ],
    )
    .unwrap()
}

/// Feed the build side through a sink operator, wait for finalize, then
/// stream the probe side and drain every output chunk.
pub fn run_query(
    shared: &Arc<HashJoinSharedState>,
    build_chunks: &[RecordBatch],
    probe_chunks: &[RecordBatch],
) -> Vec<RecordBatch> {
    run_build(shared, build_chunks);
    assert!(
        !shared.is_suspended(),
        "query suspended; use run_build for suspension tests"
    );
    assert!(
        shared.build_ready().wait_ready(Duration::from_secs(10)),
        "build finalize did not complete"
    );
    run_probe(shared, probe_chunks)
}

/// Build side only; used by suspension tests where finalize exits early.
pub fn run_build(shared: &Arc<HashJoinSharedState>, build_chunks: &[RecordBatch]) {
    flintrocks::flintrocks_logging::init();
    let state = RuntimeState::new();
    let factory = HashJoinBuildSinkFactory::new(Arc::clone(shared));
    let mut sink = factory.create(1, 0);
    let sink = sink.as_processor_mut().expect("sink processor");
    for batch in build_chunks {
        sink.push_chunk(&state, Chunk::new(batch.clone())).unwrap();
    }
    sink.set_finishing(&state).unwrap();
}

/// Build side split across several sink workers.
pub fn run_build_workers(shared: &Arc<HashJoinSharedState>, worker_chunks: &[Vec<RecordBatch>]) {
    flintrocks::flintrocks_logging::init();
    let factory = HashJoinBuildSinkFactory::new(Arc::clone(shared));
    let handles: Vec<_> = worker_chunks
        .iter()
        .enumerate()
        .map(|(driver_id, chunks)| {
            let mut sink = factory.create(worker_chunks.len() as i32, driver_id as i32);
            let chunks = chunks.clone();
            std::thread::spawn(move || {
                let state = RuntimeState::new();
                let sink = sink.as_processor_mut().expect("sink processor");
                for batch in &chunks {
                    sink.push_chunk(&state, Chunk::new(batch.clone())).unwrap();
                }
                sink.set_finishing(&state).unwrap();
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }
}

pub fn run_probe(shared: &Arc<HashJoinSharedState>, probe_chunks: &[RecordBatch]) -> Vec<RecordBatch> {
    flintrocks::flintrocks_logging::init();
    let state = RuntimeState::new();
    let factory = HashJoinProbeFactory::new(Arc::clone(shared));
    let mut probe = factory.create(1, 0);
    let probe = probe.as_processor_mut().expect("probe processor");
    let mut out = Vec::new();
    for batch in probe_chunks {
        probe.push_chunk(&state, Chunk::new(batch.clone())).unwrap();
        while let Some(chunk) = probe.pull_chunk(&state).unwrap() {
            out.push(chunk.batch);
        }
    }
    probe.set_finishing(&state).unwrap();
    let mut spins = 0;
    loop {
        match probe.pull_chunk(&state).unwrap() {
            Some(chunk) => out.push(chunk.batch),
            None => {
                if probe.is_finished() {
                    break;
                }
                spins += 1;
                assert!(spins < 100_000, "probe operator failed to finish");
            }
        }
    }
    out
}

/// Render batches as a sorted multiset of string tuples for comparison.
pub fn sorted_rows(batches: &[RecordBatch]) -> Vec<Vec<String>> {
    let mut rows = Vec::new();
    for batch in batches {
        for row in 0..batch.num_rows() {
            let mut rendered = Vec::with_capacity(batch.num_columns());
            for column in batch.columns() {
                rendered.push(render_value(column, row));
            }
            rows.push(rendered);
        }
    }
    rows.sort();
    rows
}

pub fn render_value(array: &ArrayRef, row: usize) -> String {
    if array.is_null(row) {
        return "NULL".to_string();
    }
    match array.data_type() {
        DataType::Int32 => array
            .as_any()
            .downcast_ref::<Int32Array>()
            .unwrap()
            .value(row)
            .to_string(),
        DataType::Int64 => array
            .as_any()
            .downcast_ref::<Int64Array>()
            .unwrap()
            .value(row)
            .to_string(),
        DataType::UInt64 => array
            .as_any()
            .downcast_ref::<UInt64Array>()
            .unwrap()
            .value(row)
            .to_string(),
        DataType::Utf8 => array
            .as_any()
            .downcast_ref::<StringArray>()
            .unwrap()
            .value(row)
            .to_string(),
        DataType::Boolean => array
            .as_any()
            .downcast_ref::<BooleanArray>()
            .unwrap()
            .value(row)
            .to_string(),
        other => panic!("unsupported test column type: {other}"),
    }
}

pub fn row(values: &[&str]) -> Vec<String> {
    values.iter().map(|v| v.to_string()).collect()
}
