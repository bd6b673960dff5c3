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
//! Build-row block storage.
//!
//! Responsibilities:
//! - Owns one block of build rows: the row columns, per-row hashes, the
//!   chain `next` slots, and the outer-join matched bits.
//! - Swizzles row data into Arrow IPC stream bytes so a block can be evicted
//!   and reloaded; row addressing is (block, row) indices throughout, so
//!   swizzling needs no pointer fixups.

use std::io::Cursor;
use std::mem::size_of;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use arrow::array::RecordBatch;
use arrow::ipc::reader::StreamReader;
use arrow::ipc::writer::StreamWriter;

/// Sentinel chain value: end of bucket chain.
pub(crate) const NULL_ROW_REF: u64 = 0;

/// Encode a (block, row) pair into a nonzero chain word.
pub(crate) fn pack_row_ref(block: usize, row: usize) -> u64 {
    ((block as u64 + 1) << 32) | row as u64
}

pub(crate) fn unpack_row_ref(row_ref: u64) -> (usize, usize) {
    debug_assert_ne!(row_ref, NULL_ROW_REF);
    (((row_ref >> 32) - 1) as usize, (row_ref & 0xffff_ffff) as usize)
}

/// One block of build rows. Either `data` (unswizzled) or `encoded`
/// (swizzled) is present; hashes and chain slots stay resident either way.
#[derive(Debug)]
pub(crate) struct RowBlock {
    data: Option<RecordBatch>,
    encoded: Option<Vec<u8>>,
    hashes: Vec<u64>,
    next: Vec<AtomicU64>,
    matched: Vec<AtomicBool>,
}

impl RowBlock {
    pub(crate) fn from_batch(batch: RecordBatch, hashes: Vec<u64>) -> Self {
        debug_assert_eq!(batch.num_rows(), hashes.len());
        let len = batch.num_rows();
        let next = (0..len).map(|_| AtomicU64::new(NULL_ROW_REF)).collect();
        let matched = (0..len).map(|_| AtomicBool::new(false)).collect();
        Self {
            data: Some(batch),
            encoded: None,
            hashes,
            next,
            matched,
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.hashes.len()
    }

    pub(crate) fn is_swizzled(&self) -> bool {
        self.data.is_none()
    }

    pub(crate) fn batch(&self) -> Result<&RecordBatch, String> {
        self.data
            .as_ref()
            .ok_or_else(|| "row block is swizzled; unswizzle before row access".to_string())
    }

    pub(crate) fn hashes(&self) -> &[u64] {
        &self.hashes
    }

    pub(crate) fn next_slot(&self, row: usize) -> &AtomicU64 {
        &self.next[row]
    }

    pub(crate) fn matched_slot(&self, row: usize) -> &AtomicBool {
        &self.matched[row]
    }

    /// Reset every chain slot; run before pointer-table construction.
    pub(crate) fn reset_chains(&self) {
        for slot in &self.next {
            slot.store(NULL_ROW_REF, Ordering::Relaxed);
        }
    }

    /// Convert row data to its encoded, evictable form. Idempotent.
    pub(crate) fn swizzle(&mut self) -> Result<(), String> {
        if self.encoded.is_some() {
            self.data = None;
            return Ok(());
        }
        let Some(batch) = self.data.take() else {
            return Ok(());
        };
        let bytes = encode_batch(&batch)?;
        self.encoded = Some(bytes);
        Ok(())
    }

    /// Reload row data from its encoded form. Idempotent.
    pub(crate) fn unswizzle(&mut self) -> Result<(), String> {
        if self.data.is_some() {
            return Ok(());
        }
        let Some(bytes) = self.encoded.take() else {
            return Err("row block has neither data nor encoded form".to_string());
        };
        self.data = Some(decode_batch(&bytes)?);
        Ok(())
    }

    pub(crate) fn size_in_bytes(&self) -> usize {
        let data_bytes = self
            .data
            .as_ref()
            .map(|b| b.get_array_memory_size())
            .unwrap_or(0);
        let encoded_bytes = self.encoded.as_ref().map(Vec::len).unwrap_or(0);
        data_bytes
            + encoded_bytes
            + self.hashes.len() * (size_of::<u64>() + size_of::<AtomicU64>() + size_of::<AtomicBool>())
    }
}

pub(crate) fn encode_batch(batch: &RecordBatch) -> Result<Vec<u8>, String> {
    let mut writer = StreamWriter::try_new(Vec::new(), batch.schema().as_ref())
        .map_err(|e| format!("create row block encoder: {e}"))?;
    writer
        .write(batch)
        .map_err(|e| format!("encode row block: {e}"))?;
    writer
        .into_inner()
        .map_err(|e| format!("finish row block encoder: {e}"))
}

pub(crate) fn decode_batch(bytes: &[u8]) -> Result<RecordBatch, String> {
    let reader = StreamReader::try_new(Cursor::new(bytes), None)
        .map_err(|e| format!("open row block decoder: {e}"))?;
    let mut batches = Vec::new();
    for batch in reader {
        batches.push(batch.map_err(|e| format!("decode row block: {e}"))?);
    }
    match batches.len() {
        1 => Ok(batches.remove(0)),
        n => Err(format!("row block decoded into {n} batches, expected 1")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use arrow::array::{ArrayRef, Int32Array, StringArray};
    use arrow::datatypes::{DataType, Field, Schema};
    use std::sync::Arc;

    fn test_batch() -> RecordBatch {
        let schema = Arc::new(Schema::new(vec![
            Field::new("k", DataType::Int32, true),
            Field::new("v", DataType::Utf8, true),
        ]));
        RecordBatch::try_new(
            schema,
            vec![
                Arc::new(Int32Array::from(vec![Some(1), Some(2), None])) as ArrayRef,
                Arc::new(StringArray::from(vec![Some("a"), None, Some("c")])) as ArrayRef,
            ],
        )
        .unwrap()
    }

    #[test]
    fn row_ref_roundtrip_and_null_distinct() {
        let packed = pack_row_ref(0, 0);
        assert_ne!(packed, NULL_ROW_REF);
        assert_eq!(unpack_row_ref(packed), (0, 0));
        assert_eq!(unpack_row_ref(pack_row_ref(7, 1234)), (7, 1234));
    }

    #[test]
    fn swizzle_roundtrip_is_bitwise() {
        let batch = test_batch();
        let mut block = RowBlock::from_batch(batch.clone(), vec![10, 20, 30]);
        block.swizzle().unwrap();
        assert!(block.is_swizzled());
        assert!(block.batch().is_err());
        // hashes remain addressable while rows are evicted
        assert_eq!(block.hashes(), &[10, 20, 30]);

        block.unswizzle().unwrap();
        assert_eq!(block.batch().unwrap(), &batch);
    }

    #[test]
    fn swizzle_is_idempotent() {
        let mut block = RowBlock::from_batch(test_batch(), vec![1, 2, 3]);
        block.swizzle().unwrap();
        block.swizzle().unwrap();
        block.unswizzle().unwrap();
        block.unswizzle().unwrap();
        assert_eq!(block.len(), 3);
    }

    #[test]
    fn chain_slots_reset() {
        let block = RowBlock::from_batch(test_batch(), vec![1, 2, 3]);
        block.next_slot(1).store(pack_row_ref(0, 0), Ordering::Relaxed);
        block.reset_chains();
        assert_eq!(block.next_slot(1).load(Ordering::Relaxed), NULL_ROW_REF);
    }
}
