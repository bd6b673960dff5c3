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
mod common;

use std::sync::Arc;

use arrow::array::RecordBatch;

use common::*;
use flintrocks::{CheckpointController, HashJoinSharedState, JoinType};

const BIG_POOL: u64 = 1 << 32;
const TINY_POOL: u64 = 50_000;

fn in_memory_shared(
    spec: flintrocks::HashJoinSpec,
) -> Arc<HashJoinSharedState> {
    HashJoinSharedState::with_pool_size(spec, 1, CheckpointController::disabled(), BIG_POOL)
        .unwrap()
}

#[test]
fn inner_join_matches_and_preserves_duplicates() {
    let shared = in_memory_shared(join_spec(JoinType::Inner, 1));
    let build = build_batch(&[(Some(1), 10), (Some(1), 11), (Some(2), 20), (Some(5), 50)]);
    let probe = probe_batch(&[(Some(1), "a"), (Some(2), "b"), (Some(3), "c")]);
    let out = run_query(&shared, &[build], &[probe]);
    assert!(!shared.is_external());
    assert_eq!(
        sorted_rows(&out),
        vec![
            row(&["1", "a", "10"]),
            row(&["1", "a", "11"]),
            row(&["2", "b", "20"]),
        ]
    );
}

#[test]
fn perfect_dense_inner_join_aliases_probe_columns() {
    let spec = with_perfect_stats(join_spec(JoinType::Inner, 2), 1, 3);
    let shared = in_memory_shared(spec);
    let build = build_batch(&[(Some(1), 10), (Some(2), 20), (Some(3), 30)]);
    let probe = probe_batch(&[(Some(1), "a"), (Some(2), "b"), (Some(3), "c")]);
    let out = run_query(&shared, &[build], std::slice::from_ref(&probe));
    assert_eq!(
        sorted_rows(&out),
        vec![
            row(&["1", "a", "10"]),
            row(&["2", "b", "20"]),
            row(&["3", "c", "30"]),
        ]
    );
    // dense fast path: output references the probe chunk without copying
    assert_eq!(out.len(), 1);
    assert!(Arc::ptr_eq(out[0].column(0), probe.column(0)));
    assert!(Arc::ptr_eq(out[0].column(1), probe.column(1)));
}

#[test]
fn perfect_join_with_out_of_range_probe_keys_slices() {
    let spec = with_perfect_stats(join_spec(JoinType::Inner, 3), 1, 3);
    let shared = in_memory_shared(spec);
    let build = build_batch(&[(Some(1), 10), (Some(2), 20), (Some(3), 30)]);
    let probe = probe_batch(&[
        (Some(1), "a"),
        (Some(2), "b"),
        (Some(3), "c"),
        (Some(4), "d"),
        (None, "n"),
    ]);
    let out = run_query(&shared, &[build], &[probe]);
    assert_eq!(
        sorted_rows(&out),
        vec![
            row(&["1", "a", "10"]),
            row(&["2", "b", "20"]),
            row(&["3", "c", "30"]),
        ]
    );
}

#[test]
fn perfect_falls_back_to_hashed_on_duplicate_build_key() {
    let spec = with_perfect_stats(join_spec(JoinType::Inner, 4), 1, 2);
    let shared = in_memory_shared(spec);
    let build = build_batch(&[(Some(1), 10), (Some(1), 11), (Some(2), 20)]);
    let probe = probe_batch(&[(Some(1), "a"), (Some(2), "b")]);
    let out = run_query(&shared, &[build], &[probe]);
    assert_eq!(
        sorted_rows(&out),
        vec![
            row(&["1", "a", "10"]),
            row(&["1", "a", "11"]),
            row(&["2", "b", "20"]),
        ]
    );
}

#[test]
fn left_join_null_extends_unmatched_probe_rows() {
    let shared = in_memory_shared(join_spec(JoinType::Left, 5));
    let build = build_batch(&[(Some(1), 10)]);
    let probe = probe_batch(&[(Some(1), "a"), (Some(7), "g"), (None, "n")]);
    let out = run_query(&shared, &[build], &[probe]);
    assert_eq!(
        sorted_rows(&out),
        vec![
            row(&["1", "a", "10"]),
            row(&["7", "g", "NULL"]),
            row(&["NULL", "n", "NULL"]),
        ]
    );
}

#[test]
fn right_join_emits_unmatched_build_rows_once() {
    let shared = in_memory_shared(join_spec(JoinType::Right, 6));
    let build = build_batch(&[(Some(1), 10), (Some(2), 20), (Some(3), 30)]);
    let probe = probe_batch(&[(Some(2), "b")]);
    let out = run_query(&shared, &[build], &[probe]);
    assert_eq!(
        sorted_rows(&out),
        vec![
            row(&["2", "b", "20"]),
            row(&["NULL", "NULL", "10"]),
            row(&["NULL", "NULL", "30"]),
        ]
    );
}

#[test]
fn full_join_preserves_both_sides() {
    let shared = in_memory_shared(join_spec(JoinType::Full, 7));
    let build = build_batch(&[(Some(1), 10), (Some(2), 20), (Some(3), 30)]);
    let probe = probe_batch(&[(Some(2), "b"), (Some(9), "z")]);
    let out = run_query(&shared, &[build], &[probe]);
    assert_eq!(
        sorted_rows(&out),
        vec![
            row(&["2", "b", "20"]),
            row(&["9", "z", "NULL"]),
            row(&["NULL", "NULL", "10"]),
            row(&["NULL", "NULL", "30"]),
        ]
    );
}

#[test]
fn semi_and_anti_joins_select_probe_rows() {
    let semi = in_memory_shared(join_spec(JoinType::Semi, 8));
    let build = build_batch(&[(Some(2), 20), (Some(3), 30)]);
    let probe = probe_batch(&[
        (Some(1), "a"),
        (Some(2), "b"),
        (Some(3), "c"),
        (Some(4), "d"),
    ]);
    let out = run_query(&semi, &[build.clone()], &[probe.clone()]);
    assert_eq!(
        sorted_rows(&out),
        vec![row(&["2", "b"]), row(&["3", "c"])]
    );

    let anti = in_memory_shared(join_spec(JoinType::Anti, 9));
    let out = run_query(&anti, &[build], &[probe]);
    assert_eq!(
        sorted_rows(&out),
        vec![row(&["1", "a"]), row(&["4", "d"])]
    );
}

#[test]
fn mark_join_is_null_aware() {
    let shared = in_memory_shared(join_spec(JoinType::Mark, 10));
    let build = build_batch(&[(Some(2), 20), (None, 99)]);
    let probe = probe_batch(&[(Some(2), "b"), (Some(5), "e"), (None, "n")]);
    let out = run_query(&shared, &[build], &[probe]);
    assert_eq!(
        sorted_rows(&out),
        vec![
            row(&["2", "b", "true"]),
            row(&["5", "e", "NULL"]),
            row(&["NULL", "n", "NULL"]),
        ]
    );
}

#[test]
fn mark_join_without_nulls_is_two_valued() {
    let shared = in_memory_shared(join_spec(JoinType::Mark, 11));
    let build = build_batch(&[(Some(2), 20)]);
    let probe = probe_batch(&[(Some(2), "b"), (Some(5), "e")]);
    let out = run_query(&shared, &[build], &[probe]);
    assert_eq!(
        sorted_rows(&out),
        vec![row(&["2", "b", "true"]), row(&["5", "e", "false"])]
    );
}

#[test]
fn single_join_emits_exactly_one_match_per_probe_row() {
    let shared = in_memory_shared(join_spec(JoinType::Single, 12));
    let build = build_batch(&[(Some(1), 10), (Some(1), 11)]);
    let probe = probe_batch(&[(Some(1), "a"), (Some(7), "g")]);
    let out = run_query(&shared, &[build], &[probe]);
    let rows = sorted_rows(&out);
    assert_eq!(rows.len(), 2);
    assert!(rows.contains(&row(&["7", "g", "NULL"])));
    let matched = rows.iter().find(|r| r[0] == "1").unwrap();
    assert!(matched[2] == "10" || matched[2] == "11");
}

#[test]
fn empty_build_short_circuits_inner_join() {
    let shared = in_memory_shared(join_spec(JoinType::Inner, 13));
    let probe = probe_batch(&[(Some(1), "a")]);
    let out = run_query(&shared, &[], &[probe]);
    assert!(shared.no_output_possible());
    assert!(out.is_empty());
}

#[test]
fn empty_build_left_join_still_produces_probe_rows() {
    let shared = in_memory_shared(join_spec(JoinType::Left, 14));
    let probe = probe_batch(&[(Some(1), "a"), (Some(2), "b")]);
    let out = run_query(&shared, &[], &[probe]);
    assert_eq!(
        sorted_rows(&out),
        vec![row(&["1", "a", "NULL"]), row(&["2", "b", "NULL"])]
    );
}

fn wide_build_chunks() -> Vec<RecordBatch> {
    let mut chunks = Vec::new();
    for chunk_idx in 0..3 {
        let rows: Vec<(Option<i32>, i64)> = (0..1000)
            .map(|i| {
                let key = chunk_idx * 1000 + i;
                (Some(key), key as i64 * 10)
            })
            .collect();
        chunks.push(build_batch(&rows));
    }
    chunks
}

fn wide_probe_chunks() -> Vec<RecordBatch> {
    let mut chunks = Vec::new();
    for chunk_idx in 0..2 {
        let rows: Vec<(Option<i32>, String)> = (0..500)
            .map(|i| {
                let key = 1500 + chunk_idx * 500 + i;
                (Some(key), format!("p{key}"))
            })
            .collect();
        let borrowed: Vec<(Option<i32>, &str)> =
            rows.iter().map(|(k, n)| (*k, n.as_str())).collect();
        chunks.push(probe_batch(&borrowed));
    }
    chunks
}

#[test]
fn external_join_replays_spilled_probes_partition_by_partition() {
    let spec = join_spec(JoinType::Inner, 15);
    let shared = HashJoinSharedState::with_pool_size(
        spec,
        1,
        CheckpointController::disabled(),
        TINY_POOL,
    )
    .unwrap();
    let out = run_query(&shared, &wide_build_chunks(), &wide_probe_chunks());
    assert!(shared.is_external(), "tiny pool must force the external path");
    let rows: usize = out.iter().map(RecordBatch::num_rows).sum();
    // probe keys 1500..2500 all exist in build keys 0..3000
    assert_eq!(rows, 1000);
}

#[test]
fn external_and_in_memory_paths_agree() {
    let build = wide_build_chunks();
    let probe = wide_probe_chunks();

    let in_memory = in_memory_shared(join_spec(JoinType::Inner, 16));
    let expected = sorted_rows(&run_query(&in_memory, &build, &probe));
    assert!(!in_memory.is_external());

    let external = HashJoinSharedState::with_pool_size(
        join_spec(JoinType::Inner, 17),
        1,
        CheckpointController::disabled(),
        TINY_POOL,
    )
    .unwrap();
    let actual = sorted_rows(&run_query(&external, &build, &probe));
    assert!(external.is_external());

    assert_eq!(actual, expected);
}

#[test]
fn external_left_join_agrees_with_in_memory() {
    let build = wide_build_chunks();
    // keys 2500..3500: the upper half misses the build side
    let rows: Vec<(Option<i32>, String)> = (0..1000)
        .map(|i| (Some(2500 + i), format!("p{}", 2500 + i)))
        .collect();
    let borrowed: Vec<(Option<i32>, &str)> = rows.iter().map(|(k, n)| (*k, n.as_str())).collect();
    let probe = vec![probe_batch(&borrowed)];

    let in_memory = in_memory_shared(join_spec(JoinType::Left, 18));
    let expected = sorted_rows(&run_query(&in_memory, &build, &probe));

    let external = HashJoinSharedState::with_pool_size(
        join_spec(JoinType::Left, 19),
        1,
        CheckpointController::disabled(),
        TINY_POOL,
    )
    .unwrap();
    let actual = sorted_rows(&run_query(&external, &build, &probe));
    assert!(external.is_external());
    assert_eq!(actual, expected);
    assert_eq!(actual.len(), 1000);
}

#[test]
fn external_right_join_scans_unmatched_rows_per_partition() {
    let build = wide_build_chunks();
    let probe = wide_probe_chunks();

    let in_memory = in_memory_shared(join_spec(JoinType::Right, 20));
    let expected = sorted_rows(&run_query(&in_memory, &build, &probe));

    let external = HashJoinSharedState::with_pool_size(
        join_spec(JoinType::Right, 21),
        1,
        CheckpointController::disabled(),
        TINY_POOL,
    )
    .unwrap();
    let actual = sorted_rows(&run_query(&external, &build, &probe));
    assert!(external.is_external());
    // 1000 matches plus 2000 unmatched build rows
    assert_eq!(actual.len(), 3000);
    assert_eq!(actual, expected);
}

#[test]
fn multi_worker_build_merges_every_local_table() {
    let spec = join_spec(JoinType::Inner, 22);
    let shared =
        HashJoinSharedState::with_pool_size(spec, 2, CheckpointController::disabled(), BIG_POOL)
            .unwrap();
    let worker_a = vec![build_batch(&[(Some(1), 10), (Some(2), 20)])];
    let worker_b = vec![build_batch(&[(Some(3), 30)])];
    run_build_workers(&shared, &[worker_a, worker_b]);
    assert!(shared
        .build_ready()
        .wait_ready(std::time::Duration::from_secs(10)));
    let probe = probe_batch(&[(Some(1), "a"), (Some(2), "b"), (Some(3), "c")]);
    let out = run_probe(&shared, &[probe]);
    assert_eq!(
        sorted_rows(&out),
        vec![
            row(&["1", "a", "10"]),
            row(&["2", "b", "20"]),
            row(&["3", "c", "30"]),
        ]
    );
}
