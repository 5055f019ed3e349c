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

//! Planning: from scanned content files to ordered task descriptors.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::catalog::ContentFile;
use crate::common::{OptimizeType, TableIdentifier};
use crate::config::OptimizingConfig;

pub mod node_task;
pub mod packer;
pub mod partition_planner;
pub mod process_group;

pub use node_task::{DataFileType, NodeTask, SequencedFile, classify_entry};
pub use packer::ListPacker;
pub use partition_planner::PartitionPlanner;
pub use process_group::ProcessGroup;

/// Input files of one task, by role.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TaskFiles {
    pub base_files: Vec<ContentFile>,
    pub insert_files: Vec<ContentFile>,
    pub eq_delete_files: Vec<ContentFile>,
    pub pos_delete_files: Vec<ContentFile>,
}

impl TaskFiles {
    pub fn iter(&self) -> impl Iterator<Item = &ContentFile> {
        self.base_files
            .iter()
            .chain(&self.insert_files)
            .chain(&self.eq_delete_files)
            .chain(&self.pos_delete_files)
    }

    pub fn len(&self) -> usize {
        self.base_files.len()
            + self.insert_files.len()
            + self.eq_delete_files.len()
            + self.pos_delete_files.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Planner output for one partition slice.
#[derive(Debug, Clone, PartialEq)]
pub struct TaskDescriptor {
    pub partition: String,
    pub files: TaskFiles,
    pub from_sequence: Option<i64>,
    pub to_sequence: Option<i64>,
    pub plan_time: i64,
    pub max_execute_time: Option<i64>,
    pub custom_output_location: Option<String>,
}

impl TaskDescriptor {
    pub fn new(
        partition: impl Into<String>,
        files: TaskFiles,
        from_sequence: Option<i64>,
        to_sequence: Option<i64>,
        plan_time: i64,
    ) -> Self {
        Self {
            partition: partition.into(),
            files,
            from_sequence,
            to_sequence,
            plan_time,
            max_execute_time: None,
            custom_output_location: None,
        }
    }

    pub fn with_max_execute_time(mut self, max_execute_time: Option<i64>) -> Self {
        self.max_execute_time = max_execute_time;
        self
    }

    pub fn with_custom_output_location(mut self, location: Option<String>) -> Self {
        self.custom_output_location = location;
        self
    }

    pub fn input_bytes(&self) -> u64 {
        self.files.iter().map(|f| f.file_size_in_bytes).sum()
    }

    pub fn input_file_count(&self) -> usize {
        self.files.len()
    }
}

/// Files that still need rewriting, summed over the planned partitions.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PendingInput {
    pub partition_count: usize,
    pub data_file_count: usize,
    pub data_file_size: u64,
    pub equality_delete_file_count: usize,
    pub position_delete_file_count: usize,
    pub delete_file_size: u64,
}

impl PendingInput {
    pub fn is_empty(&self) -> bool {
        self.data_file_count == 0
            && self.equality_delete_file_count == 0
            && self.position_delete_file_count == 0
    }

    pub fn total_file_count(&self) -> usize {
        self.data_file_count + self.equality_delete_file_count + self.position_delete_file_count
    }

    pub fn total_file_size(&self) -> u64 {
        self.data_file_size + self.delete_file_size
    }
}

/// A finished plan of one table, consumed by
/// [`OptimizingProcessIterator`](crate::optimizing::OptimizingProcessIterator).
pub trait OptimizingPlanner: Send + Sync {
    fn table_identifier(&self) -> &TableIdentifier;

    fn config(&self) -> &OptimizingConfig;

    fn pending_input(&self) -> &PendingInput;

    fn is_necessary(&self) -> bool {
        !self.pending_input().is_empty()
    }

    /// Mints a process id, strictly larger than any previous one.
    fn new_process_id(&self) -> i64;

    fn optimizing_type(&self) -> OptimizeType;

    fn opt_type_by_partition(&self, partition: &str) -> OptimizeType;

    fn target_snapshot_id(&self) -> i64;

    fn target_change_snapshot_id(&self) -> Option<i64> {
        None
    }

    fn plan_tasks(&self) -> Vec<TaskDescriptor>;

    fn plan_partitioned_tasks(&self) -> BTreeMap<String, Vec<TaskDescriptor>>;

    fn from_sequence(&self) -> &BTreeMap<String, i64>;

    fn to_sequence(&self) -> &BTreeMap<String, i64>;
}
