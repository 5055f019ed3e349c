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

use std::cmp::Ordering;
use std::collections::BTreeMap;

use super::TaskDescriptor;
use crate::config::OrderStrategy;

pub type TaskComparator = fn(&TaskDescriptor, &TaskDescriptor) -> Ordering;
pub type GroupComparator = fn(&ProcessGroup, &ProcessGroup) -> Ordering;

/// Tasks that will run as one optimizing process, already in execution order.
#[derive(Debug, Clone)]
pub struct ProcessGroup {
    id: String,
    tasks: Vec<TaskDescriptor>,
    from_sequence: BTreeMap<String, i64>,
    to_sequence: BTreeMap<String, i64>,
}

impl ProcessGroup {
    /// Sorts `tasks` with `task_comparator`. The sort is stable, so tasks the
    /// comparator cannot tell apart keep their planned position.
    pub fn new(
        id: impl Into<String>,
        mut tasks: Vec<TaskDescriptor>,
        from_sequence: BTreeMap<String, i64>,
        to_sequence: BTreeMap<String, i64>,
        task_comparator: TaskComparator,
    ) -> Self {
        tasks.sort_by(task_comparator);
        Self {
            id: id.into(),
            tasks,
            from_sequence,
            to_sequence,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn tasks(&self) -> &[TaskDescriptor] {
        &self.tasks
    }

    pub fn from_sequence(&self) -> &BTreeMap<String, i64> {
        &self.from_sequence
    }

    pub fn to_sequence(&self) -> &BTreeMap<String, i64> {
        &self.to_sequence
    }

    pub fn into_parts(
        self,
    ) -> (
        String,
        Vec<TaskDescriptor>,
        BTreeMap<String, i64>,
        BTreeMap<String, i64>,
    ) {
        (self.id, self.tasks, self.from_sequence, self.to_sequence)
    }

    pub fn input_bytes(&self) -> u64 {
        self.tasks.iter().map(TaskDescriptor::input_bytes).sum()
    }

    fn min_from_sequence(&self) -> Option<i64> {
        self.from_sequence
            .values()
            .copied()
            .chain(self.tasks.iter().filter_map(|t| t.from_sequence))
            .min()
    }

    fn earliest_plan_time(&self) -> i64 {
        self.tasks
            .iter()
            .map(|t| t.plan_time)
            .min()
            .unwrap_or_default()
    }

    pub fn task_comparator(order: OrderStrategy) -> TaskComparator {
        match order {
            OrderStrategy::Sequence => compare_tasks_by_sequence,
            OrderStrategy::Size => compare_tasks_by_size,
        }
    }

    pub fn process_comparator(order: OrderStrategy) -> GroupComparator {
        match order {
            OrderStrategy::Sequence => compare_groups_by_sequence,
            OrderStrategy::Size => compare_groups_by_size,
        }
    }
}

/// Missing sequences sort after present ones.
fn compare_sequence(a: Option<i64>, b: Option<i64>) -> Ordering {
    match (a, b) {
        (Some(a), Some(b)) => a.cmp(&b),
        (Some(_), None) => Ordering::Less,
        (None, Some(_)) => Ordering::Greater,
        (None, None) => Ordering::Equal,
    }
}

fn task_tie_break(a: &TaskDescriptor, b: &TaskDescriptor) -> Ordering {
    a.plan_time
        .cmp(&b.plan_time)
        .then_with(|| a.partition.cmp(&b.partition))
}

fn compare_tasks_by_sequence(a: &TaskDescriptor, b: &TaskDescriptor) -> Ordering {
    compare_sequence(a.from_sequence, b.from_sequence).then_with(|| task_tie_break(a, b))
}

fn compare_tasks_by_size(a: &TaskDescriptor, b: &TaskDescriptor) -> Ordering {
    b.input_bytes()
        .cmp(&a.input_bytes())
        .then_with(|| task_tie_break(a, b))
}

fn group_tie_break(a: &ProcessGroup, b: &ProcessGroup) -> Ordering {
    a.earliest_plan_time()
        .cmp(&b.earliest_plan_time())
        .then_with(|| a.id.cmp(&b.id))
}

fn compare_groups_by_sequence(a: &ProcessGroup, b: &ProcessGroup) -> Ordering {
    compare_sequence(a.min_from_sequence(), b.min_from_sequence())
        .then_with(|| group_tie_break(a, b))
}

fn compare_groups_by_size(a: &ProcessGroup, b: &ProcessGroup) -> Ordering {
    b.input_bytes()
        .cmp(&a.input_bytes())
        .then_with(|| group_tie_break(a, b))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::{ContentFile, FileContent};
    use crate::plan::TaskFiles;

    fn task(partition: &str, bytes: u64, from: Option<i64>, plan_time: i64) -> TaskDescriptor {
        let files = TaskFiles {
            base_files: vec![ContentFile {
                path: format!("{partition}/{bytes}"),
                content: FileContent::Data,
                partition: partition.to_owned(),
                file_size_in_bytes: bytes,
                record_count: 1,
            }],
            ..Default::default()
        };
        TaskDescriptor::new(partition, files, from, from, plan_time)
    }

    fn order(group: &ProcessGroup) -> Vec<(String, u64)> {
        group
            .tasks()
            .iter()
            .map(|t| (t.partition.clone(), t.input_bytes()))
            .collect()
    }

    #[test]
    fn test_size_order_breaks_ties_by_plan_time_then_partition() {
        let tasks = vec![
            task("b", 10, None, 2),
            task("a", 10, None, 2),
            task("c", 10, None, 1),
            task("d", 50, None, 9),
        ];
        let group = ProcessGroup::new(
            "g",
            tasks,
            BTreeMap::new(),
            BTreeMap::new(),
            ProcessGroup::task_comparator(OrderStrategy::Size),
        );
        assert_eq!(
            order(&group),
            vec![
                ("d".to_owned(), 50),
                ("c".to_owned(), 10),
                ("a".to_owned(), 10),
                ("b".to_owned(), 10)
            ]
        );
    }

    #[test]
    fn test_sequence_order_puts_unsequenced_last() {
        let tasks = vec![
            task("a", 10, None, 0),
            task("b", 10, Some(5), 0),
            task("c", 10, Some(2), 0),
        ];
        let group = ProcessGroup::new(
            "g",
            tasks,
            BTreeMap::new(),
            BTreeMap::new(),
            ProcessGroup::task_comparator(OrderStrategy::Sequence),
        );
        let partitions: Vec<_> = group.tasks().iter().map(|t| t.partition.as_str()).collect();
        assert_eq!(partitions, vec!["c", "b", "a"]);
    }

    #[test]
    fn test_group_ordering() {
        let size = ProcessGroup::task_comparator(OrderStrategy::Size);
        let small_old = ProcessGroup::new(
            "p1",
            vec![task("p1", 10, Some(1), 0)],
            BTreeMap::from([("p1".to_owned(), 1)]),
            BTreeMap::from([("p1".to_owned(), 1)]),
            size,
        );
        let big_new = ProcessGroup::new(
            "p2",
            vec![task("p2", 100, Some(8), 0)],
            BTreeMap::from([("p2".to_owned(), 8)]),
            BTreeMap::from([("p2".to_owned(), 8)]),
            size,
        );

        let by_sequence = ProcessGroup::process_comparator(OrderStrategy::Sequence);
        assert_eq!(by_sequence(&small_old, &big_new), Ordering::Less);
        let by_size = ProcessGroup::process_comparator(OrderStrategy::Size);
        assert_eq!(by_size(&small_old, &big_new), Ordering::Greater);
    }
}
