/*
 * Copyright 2025 iceberg-compaction
 *
 * Licensed under the Apache License, Version 2.0 (the "License");
 * you may not use this file except in compliance with the License.
 * You may obtain a copy of the License at
 *
 *     http://www.apache.org/licenses/LICENSE-2.0
 *
 * Unless required by applicable law or agreed to in writing, software
 * distributed under the License is distributed on an "AS IS" BASIS,
 * WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
 * See the License for the specific language governing permissions and
 * limitations under the License.
 */

use thiserror::Error;

#[derive(Error, Debug)]
pub enum OptimizeError {
    /// Unknown table, task, queue or cache key.
    #[error("Not found: {0}")]
    NotFound(String),

    /// Binding to a group or queue that does not exist, or a malformed setting.
    #[error("Invalid configuration: {0}")]
    InvalidConfiguration(String),

    #[error("Storage error: {0}")]
    Storage(#[from] sqlx::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Iceberg error: {0}")]
    Iceberg(#[from] iceberg::Error),

    /// The persisted store is corrupted and needs operator intervention.
    #[error("Fatal consistency error: {0}")]
    FatalConsistency(String),

    /// A required collaborator is missing. Indicates programmer error.
    #[error("Precondition failed: {0}")]
    Precondition(String),

    #[error("Unsupported operation: {0}")]
    Unsupported(String),

    #[error("Queue {queue_id} is full")]
    QueueFull { queue_id: i32 },

    #[error("Execution failed: {0}")]
    Execution(String),
}

impl OptimizeError {
    /// Disk or database failures that a later cycle may not hit again.
    pub fn is_transient(&self) -> bool {
        matches!(self, OptimizeError::Storage(_) | OptimizeError::Io(_))
    }
}

pub type Result<T> = std::result::Result<T, OptimizeError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_classification() {
        let io = OptimizeError::from(std::io::Error::other("disk gone"));
        assert!(io.is_transient());
        assert!(!OptimizeError::NotFound("t".to_owned()).is_transient());
        assert!(!OptimizeError::FatalConsistency("lost runtime".to_owned()).is_transient());
    }

    #[test]
    fn test_error_display() {
        let err = OptimizeError::QueueFull { queue_id: 3 };
        assert_eq!(err.to_string(), "Queue 3 is full");
    }
}
