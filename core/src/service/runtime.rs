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

use serde::{Deserialize, Serialize};

use crate::common::{OptimizeStatus, TableIdentifier, current_time_millis};
use crate::plan::PendingInput;

/// Durable per-table optimizing state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableOptimizeRuntime {
    pub table_identifier: TableIdentifier,
    pub optimize_status: OptimizeStatus,
    pub optimize_status_start_time: i64,
    pub group_name: String,
    pub queue_id: Option<i32>,
    pub current_snapshot_id: Option<i64>,
    pub latest_process_id: Option<i64>,
    pub pending_files: i64,
    pub pending_bytes: i64,
    pub pending_eq_delete_files: i64,
}

impl TableOptimizeRuntime {
    /// Fresh runtime of a table seen for the first time. The status clock
    /// starts at the table's creation time.
    pub fn new(table_identifier: TableIdentifier, group_name: impl Into<String>, create_time: i64) -> Self {
        Self {
            table_identifier,
            optimize_status: OptimizeStatus::Idle,
            optimize_status_start_time: create_time,
            group_name: group_name.into(),
            queue_id: None,
            current_snapshot_id: None,
            latest_process_id: None,
            pending_files: 0,
            pending_bytes: 0,
            pending_eq_delete_files: 0,
        }
    }

    /// Returns whether the status changed.
    pub fn update_status(&mut self, status: OptimizeStatus) -> bool {
        if self.optimize_status == status {
            return false;
        }
        tracing::debug!(
            "table {} optimize status {} -> {}",
            self.table_identifier,
            self.optimize_status,
            status
        );
        self.optimize_status = status;
        self.optimize_status_start_time = current_time_millis();
        true
    }

    pub fn update_pending(&mut self, pending: &PendingInput) {
        self.pending_files = pending.total_file_count() as i64;
        self.pending_bytes = pending.total_file_size() as i64;
        self.pending_eq_delete_files = pending.equality_delete_file_count as i64;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_clock_moves_on_change_only() {
        let mut runtime = TableOptimizeRuntime::new(TableIdentifier::new("c", "d", "t"), "default", 5);
        assert_eq!(runtime.optimize_status_start_time, 5);
        assert!(!runtime.update_status(OptimizeStatus::Idle));
        assert_eq!(runtime.optimize_status_start_time, 5);
        assert!(runtime.update_status(OptimizeStatus::Pending));
        assert!(runtime.optimize_status_start_time > 5);
    }
}
