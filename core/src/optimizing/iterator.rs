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

use std::collections::{BTreeMap, VecDeque};
use std::sync::{Arc, LazyLock};

use derive_builder::Builder;

use super::process::{
    DEFAULT_MAX_TASK_RETRIES, ProcessClearHandler, TableOptimizingProcess, TaskOfferHandler,
    TaskRetryHandler,
};
use crate::OptimizeError;
use crate::plan::process_group::{GroupComparator, TaskComparator};
use crate::plan::{OptimizingPlanner, ProcessGroup};

/// Group id of a flat plan. Random so it can never collide with a partition.
static UNGROUPED_ID: LazyLock<String> = LazyLock::new(|| uuid::Uuid::new_v4().to_string());

/// Everything an [`OptimizingProcessIterator`] needs. Built through
/// [`ProcessIteratorConfigBuilder`]; a missing collaborator fails the build
/// with [`OptimizeError::Precondition`].
#[derive(Builder)]
#[builder(pattern = "owned")]
pub struct ProcessIteratorConfig {
    planner: Arc<dyn OptimizingPlanner>,
    clear_handler: ProcessClearHandler,
    retry_handler: TaskRetryHandler,
    task_offer: TaskOfferHandler,
    /// Queue the table is bound to; stamped on every task.
    queue_id: i32,
    #[builder(default = "DEFAULT_MAX_TASK_RETRIES")]
    max_task_retries: u32,
}

impl From<ProcessIteratorConfigBuilderError> for OptimizeError {
    fn from(e: ProcessIteratorConfigBuilderError) -> Self {
        match e {
            ProcessIteratorConfigBuilderError::UninitializedField(field) => {
                OptimizeError::Precondition(format!("{field} is required"))
            }
            ProcessIteratorConfigBuilderError::ValidationError(message) => {
                OptimizeError::Precondition(message)
            }
        }
    }
}

/// Turns a plan into ordered optimizing processes.
///
/// The plan is cut into [`ProcessGroup`]s once, at construction: one group per
/// partition when the pending equality-delete file count is above the table's
/// partitioned threshold, otherwise a single group with every task. Groups
/// and the tasks inside them are sorted by the table's process and task order.
///
/// Each call to `next` mints a process id, builds the process with the retry
/// and clear handlers attached, and offers all of its tasks before returning
/// it. A task the queue rejects is marked failed with the error message.
pub struct OptimizingProcessIterator {
    planner: Arc<dyn OptimizingPlanner>,
    ordered_groups: VecDeque<ProcessGroup>,
    clear_handler: ProcessClearHandler,
    retry_handler: TaskRetryHandler,
    task_offer: TaskOfferHandler,
    queue_id: i32,
    max_task_retries: u32,
}

impl OptimizingProcessIterator {
    pub fn builder() -> ProcessIteratorConfigBuilder {
        ProcessIteratorConfigBuilder::default()
    }

    pub fn new(config: ProcessIteratorConfig) -> Self {
        let planner = config.planner;
        let optimizing_config = planner.config();
        let task_comparator = ProcessGroup::task_comparator(optimizing_config.task_order);
        let group_comparator = ProcessGroup::process_comparator(optimizing_config.process_order);

        let ordered_groups = if planner.pending_input().equality_delete_file_count
            > optimizing_config.partitioned_threshold
        {
            partitioned_groups(planner.as_ref(), group_comparator, task_comparator)
        } else {
            flat_group(planner.as_ref(), task_comparator)
        };

        Self {
            planner,
            ordered_groups,
            clear_handler: config.clear_handler,
            retry_handler: config.retry_handler,
            task_offer: config.task_offer,
            queue_id: config.queue_id,
            max_task_retries: config.max_task_retries,
        }
    }

    /// Remaining groups.
    pub fn size(&self) -> usize {
        self.ordered_groups.len()
    }

    pub fn has_next(&self) -> bool {
        !self.ordered_groups.is_empty()
    }

    pub fn is_partitioned(&self) -> bool {
        self.ordered_groups
            .front()
            .is_some_and(|group| group.id() != UNGROUPED_ID.as_str())
    }
}

impl Iterator for OptimizingProcessIterator {
    type Item = TableOptimizingProcess;

    fn next(&mut self) -> Option<Self::Item> {
        let group = self.ordered_groups.pop_front()?;
        let process_id = self.planner.new_process_id();
        let (group_id, tasks, from_sequence, to_sequence) = group.into_parts();
        let optimize_type = if group_id == *UNGROUPED_ID {
            self.planner.optimizing_type()
        } else {
            self.planner.opt_type_by_partition(&group_id)
        };

        let mut process = TableOptimizingProcess::new(
            process_id,
            self.planner.table_identifier().clone(),
            optimize_type,
            self.queue_id,
            self.planner.target_snapshot_id(),
            self.planner.target_change_snapshot_id(),
            tasks,
            from_sequence,
            to_sequence,
        )
        .with_max_task_retries(self.max_task_retries)
        .handle_task_retry(self.retry_handler.clone())
        .handle_task_clear(self.clear_handler.clone());

        let rejected: Vec<_> = process
            .tasks()
            .filter_map(|item| {
                (self.task_offer)(item)
                    .err()
                    .map(|e| (item.task_id(), e.to_string()))
            })
            .collect();
        for (task_id, reason) in rejected {
            process.fail_task(&task_id, reason);
        }

        tracing::info!(
            "iterate new optimizing process {} belong to {} and the group is {}",
            process.process_id(),
            self.planner.table_identifier(),
            group_id
        );
        Some(process)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        (self.size(), Some(self.size()))
    }
}

impl ExactSizeIterator for OptimizingProcessIterator {}

fn flat_group(
    planner: &dyn OptimizingPlanner,
    task_comparator: TaskComparator,
) -> VecDeque<ProcessGroup> {
    let tasks = planner.plan_tasks();
    if tasks.is_empty() {
        return VecDeque::new();
    }
    VecDeque::from([ProcessGroup::new(
        UNGROUPED_ID.as_str(),
        tasks,
        planner.from_sequence().clone(),
        planner.to_sequence().clone(),
        task_comparator,
    )])
}

fn partitioned_groups(
    planner: &dyn OptimizingPlanner,
    group_comparator: GroupComparator,
    task_comparator: TaskComparator,
) -> VecDeque<ProcessGroup> {
    let scoped = |sequences: &BTreeMap<String, i64>, partition: &str| {
        sequences
            .get_key_value(partition)
            .map(|(k, v)| (k.clone(), *v))
            .into_iter()
            .collect::<BTreeMap<_, _>>()
    };
    let mut groups: Vec<ProcessGroup> = planner
        .plan_partitioned_tasks()
        .into_iter()
        .filter(|(_, tasks)| !tasks.is_empty())
        .map(|(partition, tasks)| {
            let from_sequence = scoped(planner.from_sequence(), &partition);
            let to_sequence = scoped(planner.to_sequence(), &partition);
            ProcessGroup::new(partition, tasks, from_sequence, to_sequence, task_comparator)
        })
        .collect();
    groups.sort_by(group_comparator);
    groups.into()
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use super::*;
    use crate::common::{OptimizeType, TableIdentifier, TaskStatus};
    use crate::config::{
        OptimizingConfig, OrderStrategy, SELF_OPTIMIZING_PROCESS_ORDER,
        SELF_OPTIMIZING_PROCESS_PARTITIONED_THRESHOLD, SELF_OPTIMIZING_TASK_ORDER,
    };
    use crate::optimizing::OptimizeTaskItem;
    use crate::test_utils::MockPlanner;
    use crate::{OptimizeError, Result};

    fn planner(eq_deletes: usize, threshold: usize) -> MockPlanner {
        let properties = [
            (
                SELF_OPTIMIZING_PROCESS_PARTITIONED_THRESHOLD.to_owned(),
                threshold.to_string(),
            ),
            (SELF_OPTIMIZING_TASK_ORDER.to_owned(), "size".to_owned()),
            (SELF_OPTIMIZING_PROCESS_ORDER.to_owned(), "sequence".to_owned()),
        ]
        .into_iter()
        .collect();
        MockPlanner::new(TableIdentifier::new("c", "db", "t"))
            .with_config(OptimizingConfig::from_properties(&properties))
            .with_eq_delete_count(eq_deletes)
            .with_first_process_id(100)
            .with_partition_type("p=2", OptimizeType::Major)
            .with_task("p=1", 10, 5, 0)
            .with_task("p=1", 30, 6, 0)
            .with_task("p=2", 20, 1, 0)
            .with_task("p=3", 50, 9, 0)
    }

    type Offered = Arc<Mutex<Vec<String>>>;

    fn iterator(planner: MockPlanner, reject: Option<&'static str>) -> (OptimizingProcessIterator, Offered) {
        let offered: Offered = Arc::new(Mutex::new(vec![]));
        let sink = offered.clone();
        let config = OptimizingProcessIterator::builder()
            .planner(Arc::new(planner))
            .clear_handler(Arc::new(|_: &TableOptimizingProcess| {}))
            .retry_handler(Arc::new(|_: &OptimizeTaskItem, _: bool| Ok(())))
            .task_offer(Arc::new(move |item: &OptimizeTaskItem| -> Result<()> {
                let path = item.task.files.base_files[0].path.clone();
                if reject.is_some_and(|r| path.starts_with(r)) {
                    return Err(OptimizeError::QueueFull { queue_id: 1 });
                }
                sink.lock().unwrap().push(path);
                Ok(())
            }))
            .queue_id(1)
            .build()
            .unwrap();
        (OptimizingProcessIterator::new(config), offered)
    }

    fn partitions(process: &TableOptimizingProcess) -> Vec<(String, u64)> {
        process
            .tasks()
            .map(|t| (t.task.partition.clone(), t.task.input_bytes()))
            .collect()
    }

    #[test]
    fn test_at_threshold_is_flat() {
        let (mut iter, offered) = iterator(planner(100, 100), None);
        assert_eq!(iter.size(), 1);
        assert!(!iter.is_partitioned());

        let process = iter.next().unwrap();
        assert!(!iter.has_next());
        assert!(iter.next().is_none());
        assert_eq!(process.process_id(), 100);
        assert_eq!(process.optimize_type(), OptimizeType::Minor);
        assert_eq!(
            partitions(&process),
            vec![
                ("p=3".to_owned(), 50),
                ("p=1".to_owned(), 30),
                ("p=2".to_owned(), 20),
                ("p=1".to_owned(), 10)
            ]
        );
        assert_eq!(offered.lock().unwrap().len(), 4);
        assert_eq!(process.from_sequence().len(), 3);
    }

    #[test]
    fn test_above_threshold_is_partitioned() {
        let (iter, offered) = iterator(planner(101, 100), None);
        assert_eq!(iter.size(), 3);
        assert!(iter.is_partitioned());

        let processes: Vec<_> = iter.collect();
        // process order is by sequence: p=2 (1), p=1 (5), p=3 (9)
        let first: Vec<_> = processes
            .iter()
            .map(|p| p.tasks().next().unwrap().task.partition.clone())
            .collect();
        assert_eq!(first, vec!["p=2", "p=1", "p=3"]);
        assert_eq!(
            processes.iter().map(|p| p.process_id()).collect::<Vec<_>>(),
            vec![100, 101, 102]
        );
        assert_eq!(processes[0].optimize_type(), OptimizeType::Major);
        assert_eq!(processes[1].optimize_type(), OptimizeType::Minor);
        assert_eq!(
            partitions(&processes[1]),
            vec![("p=1".to_owned(), 30), ("p=1".to_owned(), 10)]
        );
        assert_eq!(
            processes[1].from_sequence(),
            &BTreeMap::from([("p=1".to_owned(), 5)])
        );
        assert_eq!(offered.lock().unwrap().len(), 4);
    }

    #[test]
    fn test_same_plan_gives_same_order() {
        let run = || {
            let (iter, _) = iterator(planner(101, 100), None);
            iter.map(|p| partitions(&p)).collect::<Vec<_>>()
        };
        assert_eq!(run(), run());
    }

    #[test]
    fn test_rejected_offer_fails_task() {
        let (mut iter, offered) = iterator(planner(0, 100), Some("p=3"));
        let process = iter.next().unwrap();
        assert_eq!(offered.lock().unwrap().len(), 3);
        let failed: Vec<_> = process
            .tasks()
            .filter(|t| t.status() == TaskStatus::Failed)
            .collect();
        assert_eq!(failed.len(), 1);
        assert_eq!(failed[0].task.partition, "p=3");
        assert!(
            failed[0]
                .runtime
                .fail_reason
                .as_deref()
                .unwrap()
                .contains("full")
        );
    }

    #[test]
    fn test_missing_collaborator_is_rejected() {
        let result = OptimizingProcessIterator::builder()
            .planner(Arc::new(planner(0, 100)))
            .retry_handler(Arc::new(|_: &OptimizeTaskItem, _: bool| Ok(())))
            .task_offer(Arc::new(|_: &OptimizeTaskItem| -> Result<()> { Ok(()) }))
            .queue_id(1)
            .build()
            .map_err(OptimizeError::from);
        match result {
            Err(OptimizeError::Precondition(message)) => {
                assert!(message.contains("clear_handler"))
            }
            _ => panic!("expected a precondition failure"),
        }
    }

    #[test]
    fn test_order_strategy_defaults() {
        let config = OptimizingConfig::default();
        assert_eq!(config.task_order, OrderStrategy::Size);
        assert_eq!(config.process_order, OrderStrategy::Sequence);
    }
}
