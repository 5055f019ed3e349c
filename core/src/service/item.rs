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

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

use super::runtime::TableOptimizeRuntime;
use crate::Result;
use crate::common::metrics::TableMetricsRecorder;
use crate::common::{OptimizeStatus, ProcessStatus, TableIdentifier, TaskStatus};
use crate::config::OptimizingConfig;
use crate::optimizing::{OptimizeTaskStat, TableOptimizingProcess, TaskRuntime};

/// What applying one execution report changed.
#[derive(Debug, Clone)]
pub struct ResultOutcome {
    pub process_id: i64,
    pub process_status: ProcessStatus,
    /// Runtime of the reported task after the report was applied.
    pub task_runtime: Option<TaskRuntime>,
}

/// All mutable optimizing state of one registered table.
///
/// Lock order is process before runtime: the clear handler of a process
/// touches the runtime while the process lock is held.
pub struct TableOptimizeItem {
    table_identifier: TableIdentifier,
    config: OptimizingConfig,
    runtime: Mutex<TableOptimizeRuntime>,
    process: Mutex<Option<TableOptimizingProcess>>,
    schedule_lock: tokio::sync::Mutex<()>,
    commit_pending: AtomicBool,
    metrics: TableMetricsRecorder,
}

impl TableOptimizeItem {
    pub fn new(
        config: OptimizingConfig,
        runtime: TableOptimizeRuntime,
        metrics: TableMetricsRecorder,
    ) -> Self {
        Self {
            table_identifier: runtime.table_identifier.clone(),
            config,
            runtime: Mutex::new(runtime),
            process: Mutex::new(None),
            schedule_lock: tokio::sync::Mutex::new(()),
            commit_pending: AtomicBool::new(false),
            metrics,
        }
    }

    pub fn table_identifier(&self) -> &TableIdentifier {
        &self.table_identifier
    }

    pub fn config(&self) -> &OptimizingConfig {
        &self.config
    }

    pub fn metrics(&self) -> &TableMetricsRecorder {
        &self.metrics
    }

    /// Snapshot of the runtime.
    pub fn runtime(&self) -> TableOptimizeRuntime {
        self.lock_runtime().clone()
    }

    pub fn update_runtime<R>(&self, f: impl FnOnce(&mut TableOptimizeRuntime) -> R) -> R {
        f(&mut self.lock_runtime())
    }

    pub fn optimize_status(&self) -> OptimizeStatus {
        self.lock_runtime().optimize_status
    }

    pub fn queue_id(&self) -> Option<i32> {
        self.lock_runtime().queue_id
    }

    /// Held for the whole scheduling tick of this table.
    pub async fn lock_schedule(&self) -> tokio::sync::MutexGuard<'_, ()> {
        self.schedule_lock.lock().await
    }

    pub fn has_process(&self) -> bool {
        self.lock_process().is_some()
    }

    pub fn process_status(&self) -> Option<ProcessStatus> {
        self.lock_process().as_ref().map(TableOptimizingProcess::status)
    }

    /// Runs `f` on the current process, if any.
    pub fn with_process<R>(&self, f: impl FnOnce(&mut TableOptimizingProcess) -> R) -> Option<R> {
        self.lock_process().as_mut().map(f)
    }

    /// Installs a freshly built process and moves the table to the matching
    /// optimizing status.
    pub fn set_process(&self, process: TableOptimizingProcess) {
        let status = match process.status() {
            ProcessStatus::Running => OptimizeStatus::optimizing(process.optimize_type()),
            ProcessStatus::Committing => OptimizeStatus::Committing,
            ProcessStatus::Failed | ProcessStatus::Closed => OptimizeStatus::Idle,
        };
        let process_id = process.process_id();
        *self.lock_process() = Some(process);
        self.update_runtime(|runtime| {
            runtime.update_status(status);
            runtime.latest_process_id = Some(process_id);
        });
    }

    /// Takes the process out if it reached `Failed` or `Closed`.
    pub fn take_finished_process(&self) -> Option<TableOptimizingProcess> {
        let mut slot = self.lock_process();
        if slot.as_ref().is_some_and(TableOptimizingProcess::is_finished) {
            slot.take()
        } else {
            None
        }
    }

    /// Whether the table sits in the commit queue.
    pub fn is_commit_pending(&self) -> bool {
        self.commit_pending.load(Ordering::SeqCst)
    }

    pub fn set_commit_pending(&self, pending: bool) {
        self.commit_pending.store(pending, Ordering::SeqCst);
    }

    /// Sets the pending flag and returns its previous value.
    pub fn swap_commit_pending(&self, pending: bool) -> bool {
        self.commit_pending.swap(pending, Ordering::SeqCst)
    }

    /// Takes the process out if it is waiting for commit.
    pub fn take_committing_process(&self) -> Option<TableOptimizingProcess> {
        self.set_commit_pending(false);
        let mut slot = self.lock_process();
        if slot
            .as_ref()
            .is_some_and(|p| p.status() == ProcessStatus::Committing)
        {
            slot.take()
        } else {
            None
        }
    }

    /// Applies an execution report to the current process.
    pub fn accept_result(&self, stat: &OptimizeTaskStat) -> Result<ResultOutcome> {
        let mut slot = self.lock_process();
        let process = slot.as_mut().ok_or_else(|| {
            crate::OptimizeError::NotFound(format!(
                "no optimizing process of table {} for task {}",
                self.table_identifier, stat.task_id
            ))
        })?;
        if process.process_id() != stat.task_id.process_id {
            return Err(crate::OptimizeError::NotFound(format!(
                "task {} of table {} belongs to no running process",
                stat.task_id, self.table_identifier
            )));
        }
        process.accept_result(stat)?;

        let task_runtime = process.task(&stat.task_id).map(|t| t.runtime.clone());
        if task_runtime
            .as_ref()
            .is_some_and(|r| r.status == TaskStatus::Failed)
        {
            self.metrics.record_task_failed();
        }
        let outcome = ResultOutcome {
            process_id: process.process_id(),
            process_status: process.status(),
            task_runtime,
        };
        if outcome.process_status == ProcessStatus::Committing {
            self.update_runtime(|runtime| runtime.update_status(OptimizeStatus::Committing));
        }
        Ok(outcome)
    }

    fn lock_runtime(&self) -> MutexGuard<'_, TableOptimizeRuntime> {
        self.runtime.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_process(&self) -> MutexGuard<'_, Option<TableOptimizingProcess>> {
        self.process.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl std::fmt::Debug for TableOptimizeItem {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TableOptimizeItem")
            .field("table_identifier", &self.table_identifier)
            .field("runtime", &*self.lock_runtime())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;
    use std::sync::Arc;

    use super::*;
    use crate::common::metrics::Metrics;
    use crate::common::{OptimizeTaskId, OptimizeType};
    use crate::plan::{TaskDescriptor, TaskFiles};

    fn item() -> TableOptimizeItem {
        let table = TableIdentifier::new("c", "d", "t");
        TableOptimizeItem::new(
            OptimizingConfig::default(),
            TableOptimizeRuntime::new(table.clone(), "default", 0),
            TableMetricsRecorder::new(Arc::new(Metrics::noop()), &table),
        )
    }

    fn process(item: &TableOptimizeItem, process_id: i64) -> TableOptimizingProcess {
        TableOptimizingProcess::new(
            process_id,
            item.table_identifier().clone(),
            OptimizeType::Major,
            1,
            1,
            None,
            vec![TaskDescriptor::new("p", TaskFiles::default(), None, None, 0)],
            BTreeMap::new(),
            BTreeMap::new(),
        )
    }

    #[test]
    fn test_result_moves_table_to_committing() {
        let item = item();
        item.set_process(process(&item, 3));
        assert_eq!(item.optimize_status(), OptimizeStatus::MajorOptimizing);
        assert_eq!(item.runtime().latest_process_id, Some(3));

        let stat = OptimizeTaskStat::new(
            item.table_identifier().clone(),
            OptimizeTaskId::new(3, 1),
            0,
            TaskStatus::Success,
        );
        let outcome = item.accept_result(&stat).unwrap();
        assert_eq!(outcome.process_status, ProcessStatus::Committing);
        assert_eq!(item.optimize_status(), OptimizeStatus::Committing);
        assert!(item.take_finished_process().is_none());
        assert_eq!(item.take_committing_process().unwrap().process_id(), 3);
        assert!(!item.has_process());
    }

    #[test]
    fn test_result_of_other_process_is_not_found() {
        let item = item();
        let stat = OptimizeTaskStat::new(
            item.table_identifier().clone(),
            OptimizeTaskId::new(4, 1),
            0,
            TaskStatus::Success,
        );
        assert!(item.accept_result(&stat).is_err());
        item.set_process(process(&item, 3));
        assert!(matches!(
            item.accept_result(&stat),
            Err(crate::OptimizeError::NotFound(_))
        ));
    }
}
