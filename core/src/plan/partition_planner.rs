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

use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicI64, Ordering};

use futures::TryStreamExt;
use itertools::Itertools;

use super::{
    DataFileType, ListPacker, NodeTask, OptimizingPlanner, PendingInput, SequencedFile,
    TaskDescriptor, classify_entry,
};
use crate::Result;
use crate::cache::{SequenceNumberFetcher, SpillableCacheOptions};
use crate::catalog::{ContentFile, OptimizingTable};
use crate::common::{OptimizeType, TableIdentifier, current_time_millis};
use crate::config::OptimizingConfig;

pub const INVALID_SNAPSHOT_ID: i64 = -1;

struct PartitionPlan {
    optimize_type: OptimizeType,
    tasks: Vec<TaskDescriptor>,
}

/// Plans one table snapshot partition by partition.
///
/// A partition is planned when it has deletes to apply or at least two small
/// files to merge. Its rewrite input is the small files, plus the base files
/// when deletes are present, bin-packed by target size. Every task of the
/// partition carries all of the partition's delete files.
pub struct PartitionPlanner {
    table_identifier: TableIdentifier,
    config: OptimizingConfig,
    target_snapshot_id: i64,
    partitions: BTreeMap<String, PartitionPlan>,
    pending_input: PendingInput,
    from_sequence: BTreeMap<String, i64>,
    to_sequence: BTreeMap<String, i64>,
    last_process_id: AtomicI64,
}

impl PartitionPlanner {
    pub async fn plan(
        table: Arc<dyn OptimizingTable>,
        config: OptimizingConfig,
        last_process_id: i64,
        cache_options: SpillableCacheOptions,
    ) -> Result<Self> {
        let mut planner = Self {
            table_identifier: table.identifier().clone(),
            config,
            target_snapshot_id: INVALID_SNAPSHOT_ID,
            partitions: BTreeMap::new(),
            pending_input: PendingInput::default(),
            from_sequence: BTreeMap::new(),
            to_sequence: BTreeMap::new(),
            last_process_id: AtomicI64::new(last_process_id),
        };
        let Some(snapshot_id) = table.current_snapshot_id() else {
            tracing::debug!("table {} has no snapshot", planner.table_identifier);
            return Ok(planner);
        };
        planner.target_snapshot_id = snapshot_id;

        // One pass over the snapshot: files are grouped here while their
        // sequence numbers go to the spillable index.
        let fetcher = SequenceNumberFetcher::new(table.clone(), snapshot_id, cache_options);
        let planned = async {
            let mut by_partition: BTreeMap<String, Vec<ContentFile>> = BTreeMap::new();
            let entries = table.scan_entries(snapshot_id).inspect_ok(|entry| {
                by_partition
                    .entry(entry.file.partition.clone())
                    .or_default()
                    .push(entry.file.clone());
            });
            fetcher.index(entries).await?;

            for (partition, files) in by_partition {
                let mut sequenced = Vec::with_capacity(files.len());
                for file in files {
                    let sequence_number = fetcher.sequence_number(&file.path).await?;
                    let file_type = classify_entry(&file, &planner.config);
                    sequenced.push((SequencedFile::new(file, sequence_number), file_type));
                }
                planner.plan_partition(partition, sequenced);
            }
            Ok::<(), crate::OptimizeError>(())
        }
        .await;
        fetcher.close().await;
        planned?;
        tracing::info!(
            "planned table {} at snapshot {}: {} partitions, {} files, {} bytes",
            planner.table_identifier,
            snapshot_id,
            planner.pending_input.partition_count,
            planner.pending_input.total_file_count(),
            planner.pending_input.total_file_size()
        );
        Ok(planner)
    }

    fn plan_partition(&mut self, partition: String, files: Vec<(SequencedFile, DataFileType)>) {
        let mut small = vec![];
        let mut base = vec![];
        let mut deletes = vec![];
        for (file, file_type) in files {
            match file_type {
                DataFileType::InsertFile => small.push((file, file_type)),
                DataFileType::BaseFile => base.push((file, file_type)),
                DataFileType::EqDeleteFile
                | DataFileType::IcebergEqDeleteFile
                | DataFileType::PosDeleteFile => deletes.push((file, file_type)),
            }
        }
        if deletes.is_empty() && small.len() < 2 {
            return;
        }

        let rewrites_base = !deletes.is_empty() && !base.is_empty();
        let optimize_type = if deletes.len() > self.config.full_trigger_delete_files {
            OptimizeType::Full
        } else if rewrites_base {
            OptimizeType::Major
        } else {
            OptimizeType::Minor
        };

        let mut rewrite = small;
        if rewrites_base {
            rewrite.extend(base);
        }

        if let Some((min, max)) = rewrite
            .iter()
            .chain(&deletes)
            .map(|(f, _)| f.sequence_number)
            .minmax()
            .into_option()
        {
            self.from_sequence.insert(partition.clone(), min);
            self.to_sequence.insert(partition.clone(), max);
        }

        let pending = &mut self.pending_input;
        pending.partition_count += 1;
        pending.data_file_count += rewrite.len();
        pending.data_file_size += rewrite
            .iter()
            .map(|(f, _)| f.file.file_size_in_bytes)
            .sum::<u64>();
        for (file, file_type) in &deletes {
            if *file_type == DataFileType::PosDeleteFile {
                pending.position_delete_file_count += 1;
            } else {
                pending.equality_delete_file_count += 1;
            }
            pending.delete_file_size += file.file.file_size_in_bytes;
        }

        let mut bins = ListPacker::new(self.config.target_size)
            .pack(rewrite, |(f, _)| f.file.file_size_in_bytes);
        if bins.is_empty() {
            bins.push(vec![]);
        }
        let tasks = bins
            .into_iter()
            .map(|bin| {
                let mut node = NodeTask::new();
                node.partition = Some(partition.clone());
                node.table_identifier = Some(self.table_identifier.clone());
                node.max_execute_time = self.config.max_execute_time;
                node.custom_output_location = self.config.custom_output_location.clone();
                for (file, file_type) in bin.into_iter().chain(deletes.iter().cloned()) {
                    node.add_native_file(file, Some(file_type));
                }
                node.into_descriptor()
            })
            .collect();

        self.partitions.insert(
            partition,
            PartitionPlan {
                optimize_type,
                tasks,
            },
        );
    }
}

impl OptimizingPlanner for PartitionPlanner {
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
        let now = current_time_millis();
        let previous = self
            .last_process_id
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |last| {
                Some(now.max(last + 1))
            })
            .unwrap_or_else(|last| last);
        now.max(previous + 1)
    }

    fn optimizing_type(&self) -> OptimizeType {
        self.partitions
            .values()
            .map(|plan| plan.optimize_type)
            .max()
            .unwrap_or(OptimizeType::Minor)
    }

    fn opt_type_by_partition(&self, partition: &str) -> OptimizeType {
        self.partitions
            .get(partition)
            .map(|plan| plan.optimize_type)
            .unwrap_or(OptimizeType::Minor)
    }

    fn target_snapshot_id(&self) -> i64 {
        self.target_snapshot_id
    }

    fn plan_tasks(&self) -> Vec<TaskDescriptor> {
        self.partitions
            .values()
            .flat_map(|plan| plan.tasks.iter().cloned())
            .collect()
    }

    fn plan_partitioned_tasks(&self) -> BTreeMap<String, Vec<TaskDescriptor>> {
        self.partitions
            .iter()
            .map(|(partition, plan)| (partition.clone(), plan.tasks.clone()))
            .collect()
    }

    fn from_sequence(&self) -> &BTreeMap<String, i64> {
        &self.from_sequence
    }

    fn to_sequence(&self) -> &BTreeMap<String, i64> {
        &self.to_sequence
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::FileContent;
    use crate::config::SELF_OPTIMIZING_FULL_TRIGGER_DELETE_FILES;
    use crate::test_utils::MemoryTable;

    const MB: u64 = 1024 * 1024;

    fn options(dir: &tempfile::TempDir) -> SpillableCacheOptions {
        SpillableCacheOptions {
            base_dir: Some(dir.path().to_path_buf()),
            ..Default::default()
        }
    }

    fn table() -> MemoryTable {
        let table = MemoryTable::new(TableIdentifier::new("c", "db", "t"));
        table.commit_snapshot(
            42,
            vec![
                MemoryTable::entry("p1/small-1", FileContent::Data, "p=1", MB, 1),
                MemoryTable::entry("p1/small-2", FileContent::Data, "p=1", MB, 2),
                MemoryTable::entry("p1/base", FileContent::Data, "p=1", 120 * MB, 1),
                MemoryTable::entry("p1/eq", FileContent::EqualityDeletes, "p=1", MB, 3),
                MemoryTable::entry("p2/base", FileContent::Data, "p=2", 120 * MB, 4),
                MemoryTable::entry("p3/small-1", FileContent::Data, "p=3", MB, 5),
                MemoryTable::entry("p3/small-2", FileContent::Data, "p=3", MB, 6),
            ],
        );
        table
    }

    #[tokio::test]
    async fn test_plan_by_partition() {
        let dir = tempfile::tempdir().unwrap();
        let table = Arc::new(table());
        let config = OptimizingConfig::from_properties(table.properties());
        let planner = PartitionPlanner::plan(table.clone(), config, 0, options(&dir))
            .await
            .unwrap();

        assert_eq!(planner.target_snapshot_id(), 42);
        assert_eq!(table.scan_count(), 1);
        let partitioned = planner.plan_partitioned_tasks();
        assert_eq!(partitioned.keys().collect::<Vec<_>>(), vec!["p=1", "p=3"]);
        assert_eq!(planner.opt_type_by_partition("p=1"), OptimizeType::Major);
        assert_eq!(planner.opt_type_by_partition("p=3"), OptimizeType::Minor);
        assert_eq!(planner.optimizing_type(), OptimizeType::Major);

        let pending = planner.pending_input();
        assert_eq!(pending.partition_count, 2);
        assert_eq!(pending.data_file_count, 5);
        assert_eq!(pending.equality_delete_file_count, 1);

        assert_eq!(planner.from_sequence()["p=1"], 1);
        assert_eq!(planner.to_sequence()["p=1"], 3);
        assert_eq!(planner.from_sequence()["p=3"], 5);

        // 120MB base + 2MB smalls fit one 128MB task, and the delete rides along
        let p1 = &partitioned["p=1"];
        assert_eq!(p1.len(), 1);
        assert_eq!(p1[0].files.eq_delete_files.len(), 1);
        assert_eq!(p1[0].files.base_files.len(), 1);
        assert_eq!(p1[0].files.insert_files.len(), 2);
        assert_eq!(planner.plan_tasks().len(), 2);
    }

    #[tokio::test]
    async fn test_delete_count_over_trigger_is_full() {
        let dir = tempfile::tempdir().unwrap();
        let table = table().with_property(SELF_OPTIMIZING_FULL_TRIGGER_DELETE_FILES, "0");
        let config = OptimizingConfig::from_properties(table.properties());
        let planner = PartitionPlanner::plan(Arc::new(table), config, 0, options(&dir))
            .await
            .unwrap();
        assert_eq!(planner.opt_type_by_partition("p=1"), OptimizeType::Full);
        assert_eq!(planner.optimizing_type(), OptimizeType::Full);
    }

    #[tokio::test]
    async fn test_table_without_snapshot_has_nothing_pending() {
        let dir = tempfile::tempdir().unwrap();
        let table = MemoryTable::new(TableIdentifier::new("c", "db", "empty"));
        let planner = PartitionPlanner::plan(
            Arc::new(table),
            OptimizingConfig::default(),
            0,
            options(&dir),
        )
        .await
        .unwrap();
        assert!(!planner.is_necessary());
        assert_eq!(planner.target_snapshot_id(), INVALID_SNAPSHOT_ID);
        assert!(planner.plan_tasks().is_empty());
    }

    #[tokio::test]
    async fn test_process_ids_increase() {
        let dir = tempfile::tempdir().unwrap();
        let far_future = current_time_millis() + 1_000_000;
        let planner = PartitionPlanner::plan(
            Arc::new(table()),
            OptimizingConfig::default(),
            far_future,
            options(&dir),
        )
        .await
        .unwrap();
        let first = planner.new_process_id();
        let second = planner.new_process_id();
        assert_eq!(first, far_future + 1);
        assert_eq!(second, far_future + 2);
    }
}
