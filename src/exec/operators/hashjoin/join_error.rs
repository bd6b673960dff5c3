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
use std::fmt;

/// Typed failures surfaced by the hash-join operator. Operator trait seams
/// convert these into the engine's string error contract.
#[derive(Debug, Clone)]
pub(crate) enum JoinError {
    /// Hash-table or pointer-table allocation exceeded limits. Fatal.
    Allocation(String),
    /// Checkpoint write failed. The checkpoint stays invalid because the
    /// temporary file is never renamed into place.
    Serialization(String),
    /// Resume manifest inconsistent with the operator plan. Fatal.
    Resume(String),
    /// Key or payload type the join cannot process.
    Unsupported(String),
    /// Stage-machine violation. Fatal.
    Internal {
        stage: &'static str,
        partition: Option<usize>,
        message: String,
    },
}

impl JoinError {
    pub(crate) fn internal(stage: &'static str, message: impl Into<String>) -> Self {
        Self::Internal {
            stage,
            partition: None,
            message: message.into(),
        }
    }

    pub(crate) fn internal_at(
        stage: &'static str,
        partition: usize,
        message: impl Into<String>,
    ) -> Self {
        Self::Internal {
            stage,
            partition: Some(partition),
            message: message.into(),
        }
    }
}

impl fmt::Display for JoinError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Allocation(msg) => write!(f, "join allocation failure: {msg}"),
            Self::Serialization(msg) => write!(f, "join checkpoint serialization failure: {msg}"),
            Self::Resume(msg) => write!(f, "join resume failure: {msg}"),
            Self::Unsupported(msg) => write!(f, "unsupported join input: {msg}"),
            Self::Internal {
                stage,
                partition: Some(partition),
                message,
            } => write!(
                f,
                "join internal invariant violated at stage={stage} partition={partition}: {message}"
            ),
            Self::Internal {
                stage,
                partition: None,
                message,
            } => write!(f, "join internal invariant violated at stage={stage}: {message}"),
        }
    }
}

impl From<JoinError> for String {
    fn from(err: JoinError) -> Self {
        err.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn internal_error_carries_stage_and_partition() {
        let err = JoinError::internal_at("BUILD", 3, "counter mismatch");
        let text = err.to_string();
        assert!(text.contains("stage=BUILD"));
        assert!(text.contains("partition=3"));
    }
}
