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

use std::collections::{BTreeMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use tokio::sync::Mutex;

use super::{OptimizeHistory, OptimizeStore};
use crate::common::{OptimizeTaskId, TableIdentifier};
use crate::optimizing::{OptimizeTask, OptimizeTaskItem, TaskRuntime};
use crate::service::TableOptimizeRuntime;
use crate::{OptimizeError, Result};

/// Operations of [`MemoryOptimizeStore`] that can be made to fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StoreOp {
    SelectTasks,
    InsertTasks,
    DeleteTasks,
    UpsertTableRuntime,
    DeleteTableRuntime,
    DeleteHistory,
}

type TaskKey = (TableIdentifier, OptimizeTaskId);

#[derive(Default)]
struct State {
    tasks: BTreeMap<TaskKey, OptimizeTask>,
    task_runtimes: BTreeMap<TaskKey, TaskRuntime>,
    table_runtimes: BTreeMap<TableIdentifier, TableOptimizeRuntime>,
    history: BTreeMap<i64, OptimizeHistory>,
    next_history_id: i64,
}

/// [`OptimizeStore`] kept in memory, with injectable failures.
#[derive(Default)]
pub struct MemoryOptimizeStore {
    state: Mutex<State>,
    failing: std::sync::Mutex<HashSet<StoreOp>>,
    table_runtime_writes: AtomicUsize,
}

impl MemoryOptimizeStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every later call of `op` fails with a transient I/O error until
    /// [`Self::heal`] is called.
    pub fn fail(&self, op: StoreOp) {
        self.failing
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .insert(op);
    }

    pub fn heal(&self, op: StoreOp) {
        self.failing
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .remove(&op);
    }

    /// Number of successful table runtime upserts.
    pub fn table_runtime_writes(&self) -> usize {
        self.table_runtime_writes.load(Ordering::SeqCst)
    }

    /// Drops the runtime row of a task while keeping the task row.
    pub async fn drop_task_runtime(&self, table: &TableIdentifier, task_id: OptimizeTaskId) {
        self.state
            .lock()
            .await
            .task_runtimes
            .remove(&(table.clone(), task_id));
    }

    fn check(&self, op: StoreOp) -> Result<()> {
        if self
            .failing
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .contains(&op)
        {
            return Err(OptimizeError::Io(std::io::Error::other(format!(
                "injected failure of {op:?}"
            ))));
        }
        Ok(())
    }
}

#[async_trait]
impl OptimizeStore for MemoryOptimizeStore {
    async fn select_all_tasks(&self) -> Result<Vec<OptimizeTask>> {
        self.check(StoreOp::SelectTasks)?;
        Ok(self.state.lock().await.tasks.values().cloned().collect())
    }

    async fn select_all_task_runtimes(&self) -> Result<Vec<(TableIdentifier, TaskRuntime)>> {
        self.check(StoreOp::SelectTasks)?;
        Ok(self
            .state
            .lock()
            .await
            .task_runtimes
            .iter()
            .map(|((table, _), runtime)| (table.clone(), runtime.clone()))
            .collect())
    }

    async fn insert_task_items(&self, items: &[OptimizeTaskItem]) -> Result<()> {
        self.check(StoreOp::InsertTasks)?;
        let mut state = self.state.lock().await;
        let duplicate = items
            .iter()
            .map(|item| (item.table_identifier().clone(), item.task_id()))
            .find(|key| state.tasks.contains_key(key));
        if let Some((table, task_id)) = duplicate {
            return Err(OptimizeError::Precondition(format!(
                "task {task_id} of table {table} already exists"
            )));
        }
        for item in items {
            let key = (item.table_identifier().clone(), item.task_id());
            state.tasks.insert(key.clone(), item.task.clone());
            state.task_runtimes.insert(key, item.runtime.clone());
        }
        Ok(())
    }

    async fn upsert_task_runtime(
        &self,
        table: &TableIdentifier,
        runtime: &TaskRuntime,
    ) -> Result<()> {
        self.state
            .lock()
            .await
            .task_runtimes
            .insert((table.clone(), runtime.task_id), runtime.clone());
        Ok(())
    }

    async fn delete_process_tasks(
        &self,
        table: &TableIdentifier,
        process_id: i64,
    ) -> Result<usize> {
        self.check(StoreOp::DeleteTasks)?;
        let mut state = self.state.lock().await;
        let before = state.tasks.len();
        state
            .tasks
            .retain(|(owner, id), _| id.process_id != process_id || owner != table);
        state
            .task_runtimes
            .retain(|(owner, id), _| id.process_id != process_id || owner != table);
        Ok(before - state.tasks.len())
    }

    async fn delete_table_tasks(&self, table: &TableIdentifier) -> Result<usize> {
        self.check(StoreOp::DeleteTasks)?;
        let mut state = self.state.lock().await;
        let before = state.tasks.len();
        state.tasks.retain(|(owner, _), _| owner != table);
        state.task_runtimes.retain(|(owner, _), _| owner != table);
        Ok(before - state.tasks.len())
    }

    async fn select_table_runtimes(&self) -> Result<Vec<TableOptimizeRuntime>> {
        Ok(self
            .state
            .lock()
            .await
            .table_runtimes
            .values()
            .cloned()
            .collect())
    }

    async fn select_table_runtime(
        &self,
        table: &TableIdentifier,
    ) -> Result<Option<TableOptimizeRuntime>> {
        Ok(self.state.lock().await.table_runtimes.get(table).cloned())
    }

    async fn upsert_table_runtime(&self, runtime: &TableOptimizeRuntime) -> Result<()> {
        self.check(StoreOp::UpsertTableRuntime)?;
        self.state
            .lock()
            .await
            .table_runtimes
            .insert(runtime.table_identifier.clone(), runtime.clone());
        self.table_runtime_writes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn delete_table_runtime(&self, table: &TableIdentifier) -> Result<bool> {
        self.check(StoreOp::DeleteTableRuntime)?;
        Ok(self
            .state
            .lock()
            .await
            .table_runtimes
            .remove(table)
            .is_some())
    }

    async fn insert_history(&self, history: &OptimizeHistory) -> Result<i64> {
        let mut state = self.state.lock().await;
        state.next_history_id += 1;
        let history_id = state.next_history_id;
        let mut history = history.clone();
        history.history_id = history_id;
        state.history.insert(history_id, history);
        Ok(history_id)
    }

    async fn select_history(&self, table: &TableIdentifier) -> Result<Vec<OptimizeHistory>> {
        Ok(self
            .state
            .lock()
            .await
            .history
            .values()
            .filter(|h| &h.table_identifier == table)
            .cloned()
            .collect())
    }

    async fn max_history_id(&self) -> Result<i64> {
        Ok(self
            .state
            .lock()
            .await
            .history
            .keys()
            .next_back()
            .copied()
            .unwrap_or_default())
    }

    async fn delete_history(&self, table: &TableIdentifier) -> Result<usize> {
        self.check(StoreOp::DeleteHistory)?;
        let mut state = self.state.lock().await;
        let before = state.history.len();
        state.history.retain(|_, h| &h.table_identifier != table);
        Ok(before - state.history.len())
    }

    async fn expire_history(&self, table: &TableIdentifier, expire_time: i64) -> Result<usize> {
        self.check(StoreOp::DeleteHistory)?;
        let mut state = self.state.lock().await;
        let before = state.history.len();
        state
            .history
            .retain(|_, h| &h.table_identifier != table || h.commit_time >= expire_time);
        Ok(before - state.history.len())
    }
}
