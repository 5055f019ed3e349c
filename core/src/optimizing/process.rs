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

use super::task::{OptimizeTask, OptimizeTaskItem, OptimizeTaskStat, TaskRuntime};
use crate::catalog::ContentFile;
use crate::common::{
    OptimizeTaskId, OptimizeType, ProcessStatus, TableIdentifier, TaskStatus, current_time_millis,
};
use crate::plan::TaskDescriptor;
use crate::{OptimizeError, Result};

/// Called after a task failed. The flag is `true` when the task was reset to
/// `Pending` and must be offered again, `false` when its retries ran out. An
/// error while re-offering fails the task and the process.
pub type TaskRetryHandler = Arc<dyn Fn(&OptimizeTaskItem, bool) -> Result<()> + Send + Sync>;

/// Called once when a process ends without committing.
pub type ProcessClearHandler = Arc<dyn Fn(&TableOptimizingProcess) + Send + Sync>;

/// Hands a task to the execution queue.
pub type TaskOfferHandler = Arc<dyn Fn(&OptimizeTaskItem) -> Result<()> + Send + Sync>;

pub const DEFAULT_MAX_TASK_RETRIES: u32 = 5;

/// One optimizing run over a table: a batch of tasks that commit together.
///
/// Mutation goes through `&mut self`, so the owner decides the serialization;
/// [`OptimizeService`](crate::service::OptimizeService) keeps one process per
/// table behind that table's lock.
pub struct TableOptimizingProcess {
    process_id: i64,
    table_identifier: TableIdentifier,
    optimize_type: OptimizeType,
    target_snapshot_id: i64,
    target_change_snapshot_id: Option<i64>,
    status: ProcessStatus,
    plan_time: i64,
    end_time: Option<i64>,
    fail_reason: Option<String>,
    tasks: BTreeMap<OptimizeTaskId, OptimizeTaskItem>,
    output_files: BTreeMap<OptimizeTaskId, Vec<ContentFile>>,
    from_sequence: BTreeMap<String, i64>,
    to_sequence: BTreeMap<String, i64>,
    max_task_retries: u32,
    retry_handler: Option<TaskRetryHandler>,
    clear_handler: Option<ProcessClearHandler>,
}

impl TableOptimizingProcess {
    /// Task sequence numbers follow the order of `descriptors`, starting at 1.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        process_id: i64,
        table_identifier: TableIdentifier,
        optimize_type: OptimizeType,
        queue_id: i32,
        target_snapshot_id: i64,
        target_change_snapshot_id: Option<i64>,
        descriptors: Vec<TaskDescriptor>,
        from_sequence: BTreeMap<String, i64>,
        to_sequence: BTreeMap<String, i64>,
    ) -> Self {
        let plan_time = current_time_millis();
        let tasks = descriptors
            .into_iter()
            .enumerate()
            .map(|(position, descriptor)| {
                let task_id = OptimizeTaskId::new(process_id, position as i32 + 1);
                let task = OptimizeTask::from_descriptor(
                    task_id,
                    table_identifier.clone(),
                    queue_id,
                    optimize_type,
                    descriptor,
                    plan_time,
                );
                (
                    task_id,
                    OptimizeTaskItem::new(task, TaskRuntime::new(task_id, plan_time)),
                )
            })
            .collect();

        Self {
            process_id,
            table_identifier,
            optimize_type,
            target_snapshot_id,
            target_change_snapshot_id,
            status: ProcessStatus::Running,
            plan_time,
            end_time: None,
            fail_reason: None,
            tasks,
            output_files: BTreeMap::new(),
            from_sequence,
            to_sequence,
            max_task_retries: DEFAULT_MAX_TASK_RETRIES,
            retry_handler: None,
            clear_handler: None,
        }
    }

    /// Rebuilds a process from persisted task rows after a restart. The
    /// status is judged against `max_task_retries`.
    pub fn restore(
        process_id: i64,
        table_identifier: TableIdentifier,
        optimize_type: OptimizeType,
        target_snapshot_id: i64,
        max_task_retries: u32,
        tasks: Vec<OptimizeTaskItem>,
    ) -> Self {
        let mut process = Self::new(
            process_id,
            table_identifier,
            optimize_type,
            0,
            target_snapshot_id,
            None,
            vec![],
            BTreeMap::new(),
            BTreeMap::new(),
        )
        .with_max_task_retries(max_task_retries);
        process.tasks = tasks
            .into_iter()
            .map(|item| (item.task_id(), item))
            .collect();
        process.refresh_status();
        process
    }

    pub fn handle_task_retry(mut self, handler: TaskRetryHandler) -> Self {
        self.retry_handler = Some(handler);
        self
    }

    pub fn handle_task_clear(mut self, handler: ProcessClearHandler) -> Self {
        self.clear_handler = Some(handler);
        self
    }

    pub fn with_max_task_retries(mut self, max_task_retries: u32) -> Self {
        self.max_task_retries = max_task_retries;
        self
    }

    pub fn process_id(&self) -> i64 {
        self.process_id
    }

    pub fn table_identifier(&self) -> &TableIdentifier {
        &self.table_identifier
    }

    pub fn optimize_type(&self) -> OptimizeType {
        self.optimize_type
    }

    pub fn status(&self) -> ProcessStatus {
        self.status
    }

    pub fn plan_time(&self) -> i64 {
        self.plan_time
    }

    pub fn end_time(&self) -> Option<i64> {
        self.end_time
    }

    pub fn fail_reason(&self) -> Option<&str> {
        self.fail_reason.as_deref()
    }

    pub fn target_snapshot_id(&self) -> i64 {
        self.target_snapshot_id
    }

    pub fn target_change_snapshot_id(&self) -> Option<i64> {
        self.target_change_snapshot_id
    }

    pub fn from_sequence(&self) -> &BTreeMap<String, i64> {
        &self.from_sequence
    }

    pub fn to_sequence(&self) -> &BTreeMap<String, i64> {
        &self.to_sequence
    }

    pub fn tasks(&self) -> impl Iterator<Item = &OptimizeTaskItem> {
        self.tasks.values()
    }

    pub fn task(&self, task_id: &OptimizeTaskId) -> Option<&OptimizeTaskItem> {
        self.tasks.get(task_id)
    }

    /// Files written by the tasks that succeeded so far.
    pub fn output_files(&self) -> impl Iterator<Item = &ContentFile> {
        self.output_files.values().flatten()
    }

    pub fn task_count(&self) -> usize {
        self.tasks.len()
    }

    pub fn input_bytes(&self) -> u64 {
        self.tasks.values().map(|t| t.task.input_bytes()).sum()
    }

    pub fn is_finished(&self) -> bool {
        matches!(self.status, ProcessStatus::Failed | ProcessStatus::Closed)
    }

    /// Marks a task that never reached the queue as failed. The process fails
    /// with it; it is cleared by its owner on the next scheduling tick.
    pub fn fail_task(&mut self, task_id: &OptimizeTaskId, reason: impl Into<String>) {
        let reason = reason.into();
        if let Some(item) = self.tasks.get_mut(task_id) {
            item.on_failed(reason.clone());
        }
        if self.status == ProcessStatus::Running {
            self.status = ProcessStatus::Failed;
            self.fail_reason = Some(format!("task {task_id} failed: {reason}"));
            self.end_time = Some(current_time_millis());
        }
    }

    /// Moves a task that the queue handed to an executor to `Scheduled`, then
    /// `Executing`.
    pub fn mark_task_executing(&mut self, task_id: &OptimizeTaskId) -> Result<()> {
        let item = self.task_mut(task_id)?;
        if item.runtime.status == TaskStatus::Pending {
            item.runtime.transition(TaskStatus::Scheduled)?;
        }
        item.runtime.transition(TaskStatus::Executing)
    }

    /// Applies an execution report. Reports of an older attempt are ignored.
    ///
    /// A failure is retried while the task's retry count is below the limit;
    /// past it the task stays failed, the process fails, and the clear handler
    /// runs. Once every task succeeded the process moves to `Committing`.
    pub fn accept_result(&mut self, stat: &OptimizeTaskStat) -> Result<()> {
        if self.status != ProcessStatus::Running {
            tracing::warn!(
                "process {} of table {} is {}, ignore result of task {}",
                self.process_id,
                self.table_identifier,
                self.status,
                stat.task_id
            );
            return Ok(());
        }
        let max_task_retries = self.max_task_retries;
        let item = self.task_mut(&stat.task_id)?;
        if item.runtime.attempt_id != stat.attempt_id {
            tracing::warn!(
                "ignore result of task {} attempt {}, current attempt is {}",
                stat.task_id,
                stat.attempt_id,
                item.runtime.attempt_id
            );
            return Ok(());
        }

        match stat.status {
            TaskStatus::Success => {
                // Executors may report without a separate ack.
                if item.runtime.status == TaskStatus::Pending {
                    item.runtime.transition(TaskStatus::Scheduled)?;
                }
                if item.runtime.status == TaskStatus::Scheduled {
                    item.runtime.transition(TaskStatus::Executing)?;
                }
                item.runtime.transition(TaskStatus::Success)?;
                self.output_files
                    .insert(stat.task_id, stat.output_files.clone());
                self.refresh_status();
            }
            TaskStatus::Failed => {
                let reason = stat
                    .error_message
                    .clone()
                    .unwrap_or_else(|| "unknown error".to_owned());
                item.runtime.fail(reason.clone())?;
                let will_retry = item.runtime.retry_count < max_task_retries;
                if will_retry {
                    item.runtime.transition(TaskStatus::Pending)?;
                }
                tracing::info!(
                    "task {} of table {} failed at attempt {}, retry: {}",
                    stat.task_id,
                    self.table_identifier,
                    stat.attempt_id,
                    will_retry
                );
                let offered = match (self.retry_handler.clone(), self.tasks.get(&stat.task_id)) {
                    (Some(handler), Some(item)) => handler(item, will_retry),
                    _ => Ok(()),
                };
                if let Err(e) = offered {
                    let reason = format!("failed to offer retry: {e}");
                    if let Some(item) = self.tasks.get_mut(&stat.task_id) {
                        item.on_failed(reason.clone());
                    }
                    self.finish_failed(format!("task {} failed: {}", stat.task_id, reason));
                } else if !will_retry {
                    self.finish_failed(format!("task {} failed: {}", stat.task_id, reason));
                }
            }
            TaskStatus::Canceled => {
                item.runtime.transition(TaskStatus::Canceled)?;
                self.finish_failed(format!("task {} was canceled", stat.task_id));
            }
            other => {
                item.runtime.transition(other)?;
            }
        }
        Ok(())
    }

    /// Records a successful commit of every task output.
    pub fn commit_succeeded(&mut self) -> Result<()> {
        if self.status != ProcessStatus::Committing {
            return Err(OptimizeError::Precondition(format!(
                "process {} is {}, not committing",
                self.process_id, self.status
            )));
        }
        self.status = ProcessStatus::Closed;
        self.end_time = Some(current_time_millis());
        Ok(())
    }

    pub fn commit_failed(&mut self, reason: impl Into<String>) {
        self.finish_failed(reason.into());
    }

    /// Cancels unfinished tasks and closes the process.
    pub fn close(&mut self) {
        if self.is_finished() {
            return;
        }
        for item in self.tasks.values_mut() {
            if !item.runtime.status.is_finished() {
                if let Err(e) = item.runtime.transition(TaskStatus::Canceled) {
                    tracing::warn!("{}", e);
                }
            }
        }
        self.status = ProcessStatus::Closed;
        self.end_time = Some(current_time_millis());
        self.run_clear_handler();
    }

    fn task_mut(&mut self, task_id: &OptimizeTaskId) -> Result<&mut OptimizeTaskItem> {
        let process_id = self.process_id;
        self.tasks.get_mut(task_id).ok_or_else(|| {
            OptimizeError::NotFound(format!("task {task_id} in process {process_id}"))
        })
    }

    fn refresh_status(&mut self) {
        if self.tasks.is_empty() {
            return;
        }
        if self
            .tasks
            .values()
            .all(|t| t.runtime.status == TaskStatus::Success)
        {
            self.status = ProcessStatus::Committing;
        } else if self
            .tasks
            .values()
            .any(|t| t.runtime.status == TaskStatus::Failed && t.runtime.retry_count >= self.max_task_retries)
        {
            self.status = ProcessStatus::Failed;
        }
    }

    fn finish_failed(&mut self, reason: String) {
        tracing::warn!(
            "process {} of table {} failed: {}",
            self.process_id,
            self.table_identifier,
            reason
        );
        self.status = ProcessStatus::Failed;
        self.fail_reason = Some(reason);
        self.end_time = Some(current_time_millis());
        self.run_clear_handler();
    }

    fn run_clear_handler(&self) {
        if let Some(handler) = self.clear_handler.clone() {
            handler(self);
        }
    }
}

impl std::fmt::Debug for TableOptimizingProcess {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TableOptimizingProcess")
            .field("process_id", &self.process_id)
            .field("table_identifier", &self.table_identifier)
            .field("optimize_type", &self.optimize_type)
            .field("status", &self.status)
            .field("tasks", &self.tasks.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use super::*;
    use crate::plan::TaskFiles;

    fn process(task_count: usize) -> TableOptimizingProcess {
        let descriptors = (0..task_count)
            .map(|i| TaskDescriptor::new(format!("p{i}"), TaskFiles::default(), None, None, 0))
            .collect();
        TableOptimizingProcess::new(
            7,
            TableIdentifier::new("c", "d", "t"),
            OptimizeType::Minor,
            1,
            100,
            None,
            descriptors,
            BTreeMap::new(),
            BTreeMap::new(),
        )
    }

    fn report(process: &TableOptimizingProcess, seq: i32, status: TaskStatus) -> OptimizeTaskStat {
        let task_id = OptimizeTaskId::new(7, seq);
        let attempt = process.task(&task_id).unwrap().runtime.attempt_id;
        OptimizeTaskStat::new(process.table_identifier().clone(), task_id, attempt, status)
            .with_error("boom")
    }

    #[test]
    fn test_all_success_moves_to_committing() {
        let mut process = process(2);
        assert_eq!(
            process.tasks().map(|t| t.task_id().task_seq).collect::<Vec<_>>(),
            vec![1, 2]
        );
        process.accept_result(&report(&process, 1, TaskStatus::Success)).unwrap();
        assert_eq!(process.status(), ProcessStatus::Running);
        process.accept_result(&report(&process, 2, TaskStatus::Success)).unwrap();
        assert_eq!(process.status(), ProcessStatus::Committing);
        process.commit_succeeded().unwrap();
        assert_eq!(process.status(), ProcessStatus::Closed);
    }

    #[test]
    fn test_retries_then_fails_and_clears() {
        let retries = Arc::new(Mutex::new(vec![]));
        let cleared = Arc::new(Mutex::new(vec![]));
        let retries_clone = retries.clone();
        let cleared_clone = cleared.clone();
        let mut process = process(1)
            .with_max_task_retries(2)
            .handle_task_retry(Arc::new(move |item: &OptimizeTaskItem, will_retry: bool| {
                retries_clone
                    .lock()
                    .unwrap()
                    .push((item.runtime.attempt_id, will_retry));
                Ok(())
            }))
            .handle_task_clear(Arc::new(move |p: &TableOptimizingProcess| {
                cleared_clone.lock().unwrap().push(p.process_id());
            }));

        for _ in 0..3 {
            process.accept_result(&report(&process, 1, TaskStatus::Failed)).unwrap();
        }
        assert_eq!(
            *retries.lock().unwrap(),
            vec![(1, true), (2, true), (2, false)]
        );
        assert_eq!(process.status(), ProcessStatus::Failed);
        assert_eq!(*cleared.lock().unwrap(), vec![7]);
        let task = process.task(&OptimizeTaskId::new(7, 1)).unwrap();
        assert_eq!(task.runtime.fail_reason.as_deref(), Some("boom"));
    }

    #[test]
    fn test_failed_retry_offer_fails_the_process() {
        let cleared = Arc::new(Mutex::new(vec![]));
        let cleared_clone = cleared.clone();
        let mut process = process(2)
            .handle_task_retry(Arc::new(|_: &OptimizeTaskItem, _: bool| {
                Err(OptimizeError::QueueFull { queue_id: 1 })
            }))
            .handle_task_clear(Arc::new(move |p: &TableOptimizingProcess| {
                cleared_clone.lock().unwrap().push(p.process_id());
            }));

        process.accept_result(&report(&process, 1, TaskStatus::Failed)).unwrap();

        assert_eq!(process.status(), ProcessStatus::Failed);
        assert_eq!(*cleared.lock().unwrap(), vec![7]);
        let task = process.task(&OptimizeTaskId::new(7, 1)).unwrap();
        assert_eq!(task.status(), TaskStatus::Failed);
        assert!(
            task.runtime
                .fail_reason
                .as_deref()
                .unwrap()
                .starts_with("failed to offer retry")
        );
        assert!(process.fail_reason().unwrap().contains("failed to offer retry"));
    }

    #[test]
    fn test_restore_judges_exhaustion_by_configured_retries() {
        let mut failed = process(1);
        failed.accept_result(&report(&failed, 1, TaskStatus::Failed)).unwrap();
        // one retry used, the task is pending again
        let mut exhausted: Vec<_> = failed.tasks().cloned().collect();
        exhausted[0].runtime.fail("boom").unwrap();

        let restored = TableOptimizingProcess::restore(
            7,
            TableIdentifier::new("c", "d", "t"),
            OptimizeType::Minor,
            100,
            1,
            exhausted.clone(),
        );
        assert_eq!(restored.status(), ProcessStatus::Failed);

        let restored = TableOptimizingProcess::restore(
            7,
            TableIdentifier::new("c", "d", "t"),
            OptimizeType::Minor,
            100,
            DEFAULT_MAX_TASK_RETRIES,
            exhausted,
        );
        assert_eq!(restored.status(), ProcessStatus::Running);
    }

    #[test]
    fn test_stale_attempt_and_unknown_task() {
        let mut process = process(1);
        let mut stale = report(&process, 1, TaskStatus::Success);
        stale.attempt_id = 3;
        process.accept_result(&stale).unwrap();
        assert_eq!(process.status(), ProcessStatus::Running);

        let unknown = OptimizeTaskStat::new(
            process.table_identifier().clone(),
            OptimizeTaskId::new(7, 99),
            0,
            TaskStatus::Success,
        );
        assert!(matches!(
            process.accept_result(&unknown),
            Err(OptimizeError::NotFound(_))
        ));
    }

    #[test]
    fn test_close_cancels_unfinished_tasks() {
        let mut process = process(2);
        process.accept_result(&report(&process, 1, TaskStatus::Success)).unwrap();
        process.close();
        assert_eq!(process.status(), ProcessStatus::Closed);
        let statuses: Vec<_> = process.tasks().map(|t| t.status()).collect();
        assert_eq!(statuses, vec![TaskStatus::Success, TaskStatus::Canceled]);
    }
}
