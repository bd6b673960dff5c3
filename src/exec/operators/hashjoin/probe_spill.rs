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
//! Probe-side spill for the out-of-core join.
//!
//! Responsibilities:
//! - Collects probe chunks that target a not-yet-loaded build partition,
//!   keyed by the same radix bits as the build rows, with their precomputed
//!   hash column.
//! - Replays one partition at a time: workers claim whole chunks from the
//!   active partition's consumer.
//!
//! Key exported interfaces:
//! - Types: `ProbeSpill`.

use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};

use arrow::datatypes::SchemaRef;

use super::join_error::JoinError;
use crate::exec::chunk::Chunk;

#[derive(Default)]
struct SpillConsumer {
    chunks: Vec<Chunk>,
    next: usize,
}

/// Partitioned collection of deferred probe chunks.
pub(crate) struct ProbeSpill {
    schema: SchemaRef,
    partitions: Vec<Mutex<Vec<Chunk>>>,
    frozen: AtomicBool,
    consumer: Mutex<SpillConsumer>,
}

impl ProbeSpill {
    pub(crate) fn new(schema: SchemaRef, partition_count: usize) -> Self {
        Self {
            schema,
            partitions: (0..partition_count.max(1))
                .map(|_| Mutex::new(Vec::new()))
                .collect(),
            frozen: AtomicBool::new(false),
            consumer: Mutex::new(SpillConsumer::default()),
        }
    }

    pub(crate) fn schema(&self) -> &SchemaRef {
        &self.schema
    }

    /// Append one deferred chunk to the given partition's pile.
    pub(crate) fn append(&self, partition: usize, chunk: Chunk) -> Result<(), JoinError> {
        if self.frozen.load(Ordering::Acquire) {
            return Err(JoinError::internal_at(
                "PROBE",
                partition,
                "probe spill appended after finalize",
            ));
        }
        let pile = self.partitions.get(partition).ok_or_else(|| {
            JoinError::internal_at("PROBE", partition, "spill partition out of bounds")
        })?;
        pile.lock().unwrap_or_else(|e| e.into_inner()).push(chunk);
        Ok(())
    }

    /// Freeze appends; the source stage machine owns the spill from here on.
    pub(crate) fn finalize(&self) {
        self.frozen.store(true, Ordering::Release);
    }

    pub(crate) fn is_finalized(&self) -> bool {
        self.frozen.load(Ordering::Acquire)
    }

    /// Stage the given partition's chunks for consumption. Returns the chunk
    /// count the probe stage must drain.
    pub(crate) fn prepare_partition(&self, partition: usize) -> Result<usize, JoinError> {
        if !self.is_finalized() {
            return Err(JoinError::internal_at(
                "PROBE",
                partition,
                "probe spill consumed before finalize",
            ));
        }
        let pile = self.partitions.get(partition).ok_or_else(|| {
            JoinError::internal_at("PROBE", partition, "spill partition out of bounds")
        })?;
        let chunks = std::mem::take(&mut *pile.lock().unwrap_or_else(|e| e.into_inner()));
        let count = chunks.len();
        let mut consumer = self.consumer.lock().unwrap_or_else(|e| e.into_inner());
        *consumer = SpillConsumer { chunks, next: 0 };
        Ok(count)
    }

    /// Hand the next staged chunk to a worker, if any remain.
    pub(crate) fn assign_chunk(&self) -> Option<Chunk> {
        let mut consumer = self.consumer.lock().unwrap_or_else(|e| e.into_inner());
        if consumer.next >= consumer.chunks.len() {
            return None;
        }
        let chunk = consumer.chunks[consumer.next].clone();
        consumer.next += 1;
        Some(chunk)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use arrow::array::{ArrayRef, Int32Array, RecordBatch};
    use arrow::datatypes::{DataType, Field, Schema};
    use std::sync::Arc;

    fn chunk(values: Vec<i32>) -> Chunk {
        let schema = Arc::new(Schema::new(vec![Field::new("v", DataType::Int32, false)]));
        Chunk::new(
            RecordBatch::try_new(schema, vec![Arc::new(Int32Array::from(values)) as ArrayRef])
                .unwrap(),
        )
    }

    #[test]
    fn chunks_replay_partition_by_partition() {
        let schema = Arc::new(Schema::new(vec![Field::new("v", DataType::Int32, false)]));
        let spill = ProbeSpill::new(schema, 2);
        spill.append(0, chunk(vec![1])).unwrap();
        spill.append(1, chunk(vec![2])).unwrap();
        spill.append(1, chunk(vec![3])).unwrap();
        spill.finalize();

        assert_eq!(spill.prepare_partition(0).unwrap(), 1);
        assert_eq!(spill.assign_chunk().unwrap().len(), 1);
        assert!(spill.assign_chunk().is_none());

        assert_eq!(spill.prepare_partition(1).unwrap(), 2);
        assert!(spill.assign_chunk().is_some());
        assert!(spill.assign_chunk().is_some());
        assert!(spill.assign_chunk().is_none());
    }

    #[test]
    fn append_after_finalize_is_rejected() {
        let schema = Arc::new(Schema::new(vec![Field::new("v", DataType::Int32, false)]));
        let spill = ProbeSpill::new(schema, 1);
        spill.finalize();
        assert!(spill.append(0, chunk(vec![1])).is_err());
    }
}
