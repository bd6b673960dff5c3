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
//! Plan-time hash-join specification.
//!
//! Responsibilities:
//! - Describes join type, conditions, projection, and perfect-join statistics
//!   handed to the operator factories by the planner.
//! - Derives the row, probe-spill, and output schemas all operators agree on.
//!
//! Key exported interfaces:
//! - Types: `HashJoinSpec`, `JoinCondition`, `JoinType`, `Comparator`,
//!   `PerfectJoinStats`.

use std::sync::Arc;

use arrow::datatypes::{DataType, Field, FieldRef, Schema, SchemaRef};

/// Name of the boolean column appended by mark joins.
pub const MARK_COLUMN_NAME: &str = "mark";

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum JoinType {
    Inner,
    Left,
    Right,
    Full,
    Semi,
    Anti,
    Mark,
    Single,
}

impl JoinType {
    /// Key-only joins never materialize build payload columns.
    pub fn stores_build_payload(self) -> bool {
        !matches!(self, Self::Semi | Self::Anti | Self::Mark)
    }

    /// Whether an empty build side makes the whole join output empty.
    pub fn empty_result_if_build_empty(self) -> bool {
        matches!(self, Self::Inner | Self::Right | Self::Semi)
    }

    /// Right-preserving joins scan unmatched build rows after probing.
    pub fn is_right_outer(self) -> bool {
        matches!(self, Self::Right | Self::Full)
    }

    /// Probe-preserving joins null-extend unmatched probe rows.
    pub fn is_left_outer(self) -> bool {
        matches!(self, Self::Left | Self::Full | Self::Single)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Inner => "INNER",
            Self::Left => "LEFT",
            Self::Right => "RIGHT",
            Self::Full => "FULL",
            Self::Semi => "SEMI",
            Self::Anti => "ANTI",
            Self::Mark => "MARK",
            Self::Single => "SINGLE",
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Comparator {
    Eq,
    NotEq,
    Lt,
    LtEq,
    Gt,
    GtEq,
}

/// One join condition: a probe-side column, a build-side column, and the
/// comparator between them. `conditions[0]` must be an equality and is the
/// primary hashed key; further equalities are hashed too, and inequalities
/// are applied after the hash match.
#[derive(Clone, Copy, Debug)]
pub struct JoinCondition {
    pub probe_column: usize,
    pub build_column: usize,
    pub comparator: Comparator,
}

/// Planner statistics enabling the perfect-hash fast path.
#[derive(Clone, Copy, Debug)]
pub struct PerfectJoinStats {
    pub build_min: i64,
    pub build_max: i64,
    pub is_build_small: bool,
}

impl PerfectJoinStats {
    pub fn build_range(&self) -> u64 {
        debug_assert!(self.build_max >= self.build_min);
        self.build_max.wrapping_sub(self.build_min) as u64
    }
}

/// Plan-time configuration of one hash-join operator pair.
#[derive(Clone, Debug)]
pub struct HashJoinSpec {
    pub join_type: JoinType,
    pub conditions: Vec<JoinCondition>,
    /// Build-side columns kept as payload. Empty means all build columns.
    pub right_projection_map: Vec<usize>,
    pub probe_schema: SchemaRef,
    pub build_schema: SchemaRef,
    pub perfect_join_stats: Option<PerfectJoinStats>,
    pub can_go_external: bool,
    /// Id of the build pipeline, used by checkpoint manifests.
    pub pipeline_id: u64,
    /// Planner estimate of probe-side cardinality; sizes source parallelism.
    pub estimated_probe_count: usize,
}

impl HashJoinSpec {
    pub fn validate(&self) -> Result<(), String> {
        if self.conditions.is_empty() {
            return Err("hash join requires at least one join condition".to_string());
        }
        if self.conditions[0].comparator != Comparator::Eq {
            return Err("hash join primary condition must be an equality".to_string());
        }
        for (idx, cond) in self.conditions.iter().enumerate() {
            let probe_field = self
                .probe_schema
                .fields()
                .get(cond.probe_column)
                .ok_or_else(|| format!("join condition {idx} probe column out of bounds"))?;
            let build_field = self
                .build_schema
                .fields()
                .get(cond.build_column)
                .ok_or_else(|| format!("join condition {idx} build column out of bounds"))?;
            if probe_field.data_type() != build_field.data_type() {
                return Err(format!(
                    "join condition {idx} type mismatch: probe={} build={}",
                    probe_field.data_type(),
                    build_field.data_type()
                ));
            }
        }
        for &col in &self.right_projection_map {
            if col >= self.build_schema.fields().len() {
                return Err(format!("right projection column {col} out of bounds"));
            }
        }
        Ok(())
    }

    pub fn key_count(&self) -> usize {
        self.conditions.len()
    }

    /// Which condition columns participate in the hash.
    pub(crate) fn equality_mask(&self) -> Vec<bool> {
        self.conditions
            .iter()
            .map(|c| c.comparator == Comparator::Eq)
            .collect()
    }

    pub(crate) fn key_type(&self, condition: usize) -> &DataType {
        self.build_schema
            .field(self.conditions[condition].build_column)
            .data_type()
    }

    /// Build columns stored as payload, in stored order.
    pub(crate) fn payload_columns(&self) -> Vec<usize> {
        if !self.join_type.stores_build_payload() {
            return Vec::new();
        }
        if self.right_projection_map.is_empty() {
            (0..self.build_schema.fields().len()).collect()
        } else {
            self.right_projection_map.clone()
        }
    }

    /// Schema of stored build rows: condition columns first, then payload.
    pub(crate) fn stored_row_schema(&self) -> SchemaRef {
        let mut fields: Vec<FieldRef> = Vec::with_capacity(self.conditions.len());
        for cond in &self.conditions {
            let field = self.build_schema.field(cond.build_column);
            fields.push(Arc::new(nullable(field)));
        }
        for &col in &self.payload_columns() {
            fields.push(Arc::new(nullable(self.build_schema.field(col))));
        }
        Arc::new(Schema::new(fields))
    }

    /// Output schema of the probe operator. Probe columns come first; every
    /// field is nullable because outer variants null-extend either side.
    pub(crate) fn output_schema(&self) -> SchemaRef {
        let mut fields: Vec<FieldRef> = self
            .probe_schema
            .fields()
            .iter()
            .map(|f| Arc::new(nullable(f)) as FieldRef)
            .collect();
        match self.join_type {
            JoinType::Semi | JoinType::Anti => {}
            JoinType::Mark => {
                fields.push(Arc::new(Field::new(MARK_COLUMN_NAME, DataType::Boolean, true)));
            }
            _ => {
                for &col in &self.payload_columns() {
                    fields.push(Arc::new(nullable(self.build_schema.field(col))));
                }
            }
        }
        Arc::new(Schema::new(fields))
    }

    /// Schema of spilled probe chunks: probe-side condition columns, the full
    /// probe payload, and the precomputed hash.
    pub(crate) fn probe_spill_schema(&self) -> SchemaRef {
        let mut fields: Vec<FieldRef> = Vec::new();
        for cond in &self.conditions {
            fields.push(Arc::new(nullable(self.probe_schema.field(cond.probe_column))));
        }
        for field in self.probe_schema.fields() {
            fields.push(Arc::new(nullable(field)));
        }
        fields.push(Arc::new(Field::new("__hash", DataType::UInt64, false)));
        Arc::new(Schema::new(fields))
    }
}

fn nullable(field: &Field) -> Field {
    field.clone().with_nullable(true)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_spec(join_type: JoinType) -> HashJoinSpec {
        HashJoinSpec {
            join_type,
            conditions: vec![JoinCondition {
                probe_column: 0,
                build_column: 0,
                comparator: Comparator::Eq,
            }],
            right_projection_map: vec![],
            probe_schema: Arc::new(Schema::new(vec![
                Field::new("k", DataType::Int32, false),
                Field::new("v", DataType::Utf8, true),
            ])),
            build_schema: Arc::new(Schema::new(vec![
                Field::new("k", DataType::Int32, false),
                Field::new("payload", DataType::Int64, true),
            ])),
            perfect_join_stats: None,
            can_go_external: true,
            pipeline_id: 1,
            estimated_probe_count: 0,
        }
    }

    #[test]
    fn inner_output_has_probe_then_build_columns() {
        let spec = test_spec(JoinType::Inner);
        spec.validate().unwrap();
        let schema = spec.output_schema();
        assert_eq!(schema.fields().len(), 4);
        assert_eq!(schema.field(0).name(), "k");
        assert_eq!(schema.field(3).name(), "payload");
    }

    #[test]
    fn semi_output_is_probe_only_and_mark_appends_flag() {
        let semi = test_spec(JoinType::Semi);
        assert_eq!(semi.output_schema().fields().len(), 2);
        assert!(semi.payload_columns().is_empty());

        let mark = test_spec(JoinType::Mark);
        let schema = mark.output_schema();
        assert_eq!(schema.fields().len(), 3);
        assert_eq!(schema.field(2).name(), MARK_COLUMN_NAME);
    }

    #[test]
    fn non_equality_primary_condition_is_rejected() {
        let mut spec = test_spec(JoinType::Inner);
        spec.conditions[0].comparator = Comparator::Lt;
        assert!(spec.validate().is_err());
    }

    #[test]
    fn spill_schema_ends_with_hash() {
        let spec = test_spec(JoinType::Inner);
        let schema = spec.probe_spill_schema();
        assert_eq!(
            schema.field(schema.fields().len() - 1).data_type(),
            &DataType::UInt64
        );
    }
}
