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

//! Durable rows behind the optimizer: tasks, task runtimes, table runtimes and
//! history.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::Result;
use crate::common::{OptimizeType, TableIdentifier};
use crate::optimizing::{OptimizeTask, OptimizeTaskItem, TaskRuntime};
use crate::service::TableOptimizeRuntime;

pub mod memory;
pub mod sql;

pub use memory::{MemoryOptimizeStore, StoreOp};
pub use sql::SqlOptimizeStore;

/// One committed optimizing process.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OptimizeHistory {
    /// Assigned by the store on insert.
    pub history_id: i64,
    pub table_identifier: TableIdentifier,
    pub process_id: i64,
    pub optimize_type: OptimizeType,
    pub start_time: i64,
    pub end_time: i64,
    pub input_file_count: i64,
    pub input_bytes: i64,
    pub output_file_count: i64,
    pub output_bytes: i64,
    pub commit_time: i64,
}

/// A persisted task row together with the runtime row of the same id.
/// `runtime` is `None` when the runtime row is missing.
#[derive(Debug, Clone)]
pub struct PersistedTask {
    pub task: OptimizeTask,
    pub runtime: Option<TaskRuntime>,
}

#[async_trait]
pub trait OptimizeStore: Send + Sync {
    async fn select_all_tasks(&self) -> Result<Vec<OptimizeTask>>;

    /// Every runtime row with the table it belongs to. Task ids are unique
    /// per table only.
    async fn select_all_task_runtimes(&self) -> Result<Vec<(TableIdentifier, TaskRuntime)>>;

    /// Writes task and runtime rows of `items` atomically.
    async fn insert_task_items(&self, items: &[OptimizeTaskItem]) -> Result<()>;

    async fn upsert_task_runtime(
        &self,
        table: &TableIdentifier,
        runtime: &TaskRuntime,
    ) -> Result<()>;

    /// Deletes task and runtime rows of one process.
    async fn delete_process_tasks(&self, table: &TableIdentifier, process_id: i64)
    -> Result<usize>;

    /// Deletes every task and runtime row of `table`.
    async fn delete_table_tasks(&self, table: &TableIdentifier) -> Result<usize>;

    async fn select_table_runtimes(&self) -> Result<Vec<TableOptimizeRuntime>>;

    async fn select_table_runtime(
        &self,
        table: &TableIdentifier,
    ) -> Result<Option<TableOptimizeRuntime>>;

    async fn upsert_table_runtime(&self, runtime: &TableOptimizeRuntime) -> Result<()>;

    async fn delete_table_runtime(&self, table: &TableIdentifier) -> Result<bool>;

    /// Returns the assigned history id.
    async fn insert_history(&self, history: &OptimizeHistory) -> Result<i64>;

    /// Ordered by history id.
    async fn select_history(&self, table: &TableIdentifier) -> Result<Vec<OptimizeHistory>>;

    /// 0 when there is no history at all.
    async fn max_history_id(&self) -> Result<i64>;

    async fn delete_history(&self, table: &TableIdentifier) -> Result<usize>;

    /// Deletes history of `table` committed before `expire_time`.
    async fn expire_history(&self, table: &TableIdentifier, expire_time: i64) -> Result<usize>;

    /// Pairs every task row with the runtime row of the same table and id.
    async fn load_tasks(&self) -> Result<Vec<PersistedTask>> {
        let mut runtimes: std::collections::HashMap<_, _> = self
            .select_all_task_runtimes()
            .await?
            .into_iter()
            .map(|(table, runtime)| ((table, runtime.task_id), runtime))
            .collect();
        Ok(self
            .select_all_tasks()
            .await?
            .into_iter()
            .map(|task| {
                let runtime = runtimes.remove(&(task.table_identifier.clone(), task.task_id));
                PersistedTask { task, runtime }
            })
            .collect())
    }
}
