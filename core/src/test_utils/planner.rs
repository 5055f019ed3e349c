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

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicI64, Ordering};

use crate::catalog::{ContentFile, FileContent};
use crate::common::{OptimizeType, TableIdentifier};
use crate::config::OptimizingConfig;
use crate::plan::{OptimizingPlanner, PendingInput, TaskDescriptor, TaskFiles};

/// Planner with a hand-written plan.
pub struct MockPlanner {
    pub table_identifier: TableIdentifier,
    pub config: OptimizingConfig,
    pub pending_input: PendingInput,
    pub optimizing_type: OptimizeType,
    pub partition_types: HashMap<String, OptimizeType>,
    pub target_snapshot_id: i64,
    pub tasks: BTreeMap<String, Vec<TaskDescriptor>>,
    pub from_sequence: BTreeMap<String, i64>,
    pub to_sequence: BTreeMap<String, i64>,
    next_process_id: AtomicI64,
}

impl MockPlanner {
    pub fn new(table_identifier: TableIdentifier) -> Self {
        Self {
            table_identifier,
            config: OptimizingConfig::default(),
            pending_input: PendingInput::default(),
            optimizing_type: OptimizeType::Minor,
            partition_types: HashMap::new(),
            target_snapshot_id: 1,
            tasks: BTreeMap::new(),
            from_sequence: BTreeMap::new(),
            to_sequence: BTreeMap::new(),
            next_process_id: AtomicI64::new(1),
        }
    }

    pub fn with_config(mut self, config: OptimizingConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_eq_delete_count(mut self, count: usize) -> Self {
        self.pending_input.equality_delete_file_count = count;
        self
    }

    pub fn with_first_process_id(self, process_id: i64) -> Self {
        self.next_process_id.store(process_id, Ordering::SeqCst);
        self
    }

    pub fn with_partition_type(mut self, partition: &str, optimize_type: OptimizeType) -> Self {
        self.partition_types
            .insert(partition.to_owned(), optimize_type);
        self
    }

    /// Adds a one-file task of `bytes` bytes to `partition`, extending the
    /// partition's sequence range with `sequence`.
    pub fn with_task(mut self, partition: &str, bytes: u64, sequence: i64, plan_time: i64) -> Self {
        let index = self.tasks.get(partition).map(Vec::len).unwrap_or_default();
        let files = TaskFiles {
            base_files: vec![ContentFile {
                path: format!("{partition}/file-{index}.parquet"),
                content: FileContent::Data,
                partition: partition.to_owned(),
                file_size_in_bytes: bytes,
                record_count: 1,
            }],
            ..Default::default()
        };
        self.tasks
            .entry(partition.to_owned())
            .or_default()
            .push(TaskDescriptor::new(
                partition,
                files,
                Some(sequence),
                Some(sequence),
                plan_time,
            ));

        let from = self.from_sequence.entry(partition.to_owned()).or_insert(sequence);
        *from = (*from).min(sequence);
        let to = self.to_sequence.entry(partition.to_owned()).or_insert(sequence);
        *to = (*to).max(sequence);

        self.pending_input.partition_count = self.tasks.len();
        self.pending_input.data_file_count += 1;
        self.pending_input.data_file_size += bytes;
        self
    }
}

impl OptimizingPlanner for MockPlanner {
    fn table_identifier(&self) -> &TableIdentifier {
        &self.table_identifier
    }

    fn config(&self) -> &OptimizingConfig {
        &self.config
    }

    fn pending_input(&self) -> &PendingInput {
        &self.pending_input
    }

    fn new_process_id(&self) -> i64 {
        self.next_process_id.fetch_add(1, Ordering::SeqCst)
    }

    fn optimizing_type(&self) -> OptimizeType {
        self.optimizing_type
    }

    fn opt_type_by_partition(&self, partition: &str) -> OptimizeType {
        self.partition_types
            .get(partition)
            .copied()
            .unwrap_or(self.optimizing_type)
    }

    fn target_snapshot_id(&self) -> i64 {
        self.target_snapshot_id
    }

    fn plan_tasks(&self) -> Vec<TaskDescriptor> {
        self.tasks.values().flatten().cloned().collect()
    }

    fn plan_partitioned_tasks(&self) -> BTreeMap<String, Vec<TaskDescriptor>> {
        self.tasks.clone()
    }

    fn from_sequence(&self) -> &BTreeMap<String, i64> {
        &self.from_sequence
    }

    fn to_sequence(&self) -> &BTreeMap<String, i64> {
        &self.to_sequence
    }
}
