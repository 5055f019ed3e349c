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

//! The registry of self-optimizing tables and the pipeline around it.

use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;

use async_trait::async_trait;
use futures::future::BoxFuture;
use futures::{FutureExt, StreamExt, stream};
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{Mutex, RwLock, mpsc};
use tokio::task::JoinHandle;

use crate::cache::SpillableCacheOptions;
use crate::catalog::{CatalogManager, OptimizingTable};
use crate::common::metrics::{Metrics, TableMetricsRecorder};
use crate::common::{
    OptimizeStatus, OptimizeTaskId, ProcessStatus, TableIdentifier, TaskStatus,
    current_time_millis,
};
use crate::config::{OptimizeServiceConfig, OptimizingConfig};
use crate::optimizing::{
    OptimizeTaskItem, OptimizeTaskStat, OptimizingProcessIterator, ProcessClearHandler,
    TableOptimizingProcess, TaskOfferHandler, TaskRetryHandler,
};
use crate::plan::partition_planner::INVALID_SNAPSHOT_ID;
use crate::plan::{OptimizingPlanner, PartitionPlanner};
use crate::queue::OptimizeQueue;
use crate::store::{OptimizeHistory, OptimizeStore, PersistedTask};
use crate::{OptimizeError, Result};

pub mod committer;
pub mod item;
pub mod runtime;

pub use committer::{CommitManager, ProcessCommitter};
pub use item::{ResultOutcome, TableOptimizeItem};
pub use runtime::TableOptimizeRuntime;

/// Builds the planner of one scheduling tick.
#[async_trait]
pub trait PlannerFactory: Send + Sync {
    async fn create_planner(
        &self,
        table: Arc<dyn OptimizingTable>,
        config: OptimizingConfig,
        last_process_id: i64,
    ) -> Result<Arc<dyn OptimizingPlanner>>;
}

/// Plans with [`PartitionPlanner`].
pub struct PartitionPlannerFactory {
    cache_options: SpillableCacheOptions,
}

impl PartitionPlannerFactory {
    pub fn new(cache_options: SpillableCacheOptions) -> Self {
        Self { cache_options }
    }
}

#[async_trait]
impl PlannerFactory for PartitionPlannerFactory {
    async fn create_planner(
        &self,
        table: Arc<dyn OptimizingTable>,
        config: OptimizingConfig,
        last_process_id: i64,
    ) -> Result<Arc<dyn OptimizingPlanner>> {
        let planner =
            PartitionPlanner::plan(table, config, last_process_id, self.cache_options.clone())
                .await?;
        Ok(Arc::new(planner))
    }
}

type TableIndex = Arc<BTreeMap<TableIdentifier, Arc<TableOptimizeItem>>>;

enum TableLoad {
    Registered(Arc<TableOptimizeItem>),
    /// Self-optimizing is turned off in the table properties.
    Disabled,
    /// The optimizer group could not be bound; try again on the next refresh.
    Unbound,
}

/// Registry of self-optimizing tables.
///
/// The index of registered tables is swapped as a whole on every add or
/// remove, so readers always see either the old or the new table set. Until
/// [`Self::init`] finishes, refreshes and scheduling ticks do nothing.
pub struct OptimizeService {
    config: OptimizeServiceConfig,
    catalogs: CatalogManager,
    store: Arc<dyn OptimizeStore>,
    queue: Arc<dyn OptimizeQueue>,
    metrics: Arc<Metrics>,
    planner_factory: Arc<dyn PlannerFactory>,
    commit_manager: Option<CommitManager>,

    tables: RwLock<TableIndex>,
    refresh_lock: Mutex<()>,
    inited: AtomicBool,

    commit_sender: mpsc::Sender<Arc<TableOptimizeItem>>,
    commit_receiver: Mutex<mpsc::Receiver<Arc<TableOptimizeItem>>>,
}

impl OptimizeService {
    pub fn new(
        config: OptimizeServiceConfig,
        catalogs: CatalogManager,
        store: Arc<dyn OptimizeStore>,
        queue: Arc<dyn OptimizeQueue>,
    ) -> Self {
        let (commit_sender, commit_receiver) = mpsc::channel(config.commit_queue_capacity.max(1));
        let planner_factory = Arc::new(PartitionPlannerFactory::new(
            SpillableCacheOptions::from_service_config(&config, "sequence"),
        ));
        Self {
            config,
            catalogs,
            store,
            queue,
            metrics: Arc::new(Metrics::noop()),
            planner_factory,
            commit_manager: None,
            tables: RwLock::new(Arc::new(BTreeMap::new())),
            refresh_lock: Mutex::new(()),
            inited: AtomicBool::new(false),
            commit_sender,
            commit_receiver: Mutex::new(commit_receiver),
        }
    }

    pub fn with_metrics(mut self, metrics: Arc<Metrics>) -> Self {
        self.metrics = metrics;
        self
    }

    pub fn with_planner_factory(mut self, planner_factory: Arc<dyn PlannerFactory>) -> Self {
        self.planner_factory = planner_factory;
        self
    }

    pub fn with_committer(mut self, committer: Arc<dyn ProcessCommitter>) -> Self {
        self.commit_manager = Some(CommitManager::new(
            self.config.commit_retry.clone(),
            committer,
        ));
        self
    }

    pub fn config(&self) -> &OptimizeServiceConfig {
        &self.config
    }

    pub fn metrics(&self) -> &Arc<Metrics> {
        &self.metrics
    }

    pub fn is_initialized(&self) -> bool {
        self.inited.load(Ordering::SeqCst)
    }

    /// Runs [`Self::init`] in the background. A startup failure is logged and
    /// returned through the handle; the service then stays uninitialized.
    pub fn start(self: Arc<Self>) -> JoinHandle<Result<()>> {
        tokio::spawn(async move {
            let result = self.init().await;
            if let Err(e) = &result {
                tracing::error!("optimize service failed to start: {}", e);
            }
            result
        })
    }

    /// Loads persisted state, reconciles it with the catalogs, and resubmits
    /// pending tasks oldest first within each queue.
    ///
    /// A task row without its runtime row aborts startup with
    /// [`OptimizeError::FatalConsistency`].
    pub async fn init(&self) -> Result<()> {
        let _guard = self.refresh_lock.lock().await;
        if self.is_initialized() {
            return Ok(());
        }
        let started = Instant::now();

        let mut tasks_by_table: BTreeMap<TableIdentifier, Vec<OptimizeTaskItem>> =
            BTreeMap::new();
        for PersistedTask { task, runtime } in self.store.load_tasks().await? {
            let runtime = runtime.ok_or_else(|| {
                OptimizeError::FatalConsistency(format!(
                    "task {} of table {} has no runtime row, repair the optimize store before restarting",
                    task.task_id, task.table_identifier
                ))
            })?;
            tasks_by_table
                .entry(task.table_identifier.clone())
                .or_default()
                .push(OptimizeTaskItem::new(task, runtime));
        }
        let runtimes: BTreeMap<TableIdentifier, TableOptimizeRuntime> = self
            .store
            .select_table_runtimes()
            .await?
            .into_iter()
            .map(|runtime| (runtime.table_identifier.clone(), runtime))
            .collect();

        let listed = self.catalogs.list_tables_by_catalog().await;
        let failed_catalogs: HashSet<&str> = listed
            .iter()
            .filter(|(_, tables)| tables.is_none())
            .map(|(name, _)| name.as_str())
            .collect();
        let live: BTreeSet<TableIdentifier> =
            listed.values().flatten().flatten().cloned().collect();

        let loaded: Vec<(TableIdentifier, Result<TableLoad>)> = stream::iter(live.iter().cloned())
            .map(|id| {
                let persisted = runtimes.get(&id).cloned();
                async move {
                    let load = self.load_table_item(&id, persisted).await;
                    (id, load)
                }
            })
            .buffer_unordered(self.config.table_load_parallelism.max(1))
            .collect()
            .await;

        let mut index = BTreeMap::new();
        let mut disabled = HashSet::new();
        for (id, load) in loaded {
            match load {
                Ok(TableLoad::Registered(item)) => {
                    index.insert(id, item);
                }
                Ok(TableLoad::Disabled) => {
                    disabled.insert(id);
                }
                Ok(TableLoad::Unbound) => {}
                Err(e) => tracing::error!("failed to load table {}: {}", id, e),
            }
        }

        let persisted_ids: BTreeSet<&TableIdentifier> =
            runtimes.keys().chain(tasks_by_table.keys()).collect();
        for id in persisted_ids {
            let gone = !live.contains(id) && !failed_catalogs.contains(id.catalog.as_str());
            if gone || disabled.contains(id) {
                tracing::info!("drop persisted optimize state of table {}", id);
                self.clear_table_state(id, false).await;
            }
        }

        let mut pending = vec![];
        for (id, items) in tasks_by_table {
            let Some(item) = index.get(&id) else {
                continue;
            };
            pending.extend(self.restore_process(item, items).await);
        }
        pending.sort_by_key(|task| (task.task.queue_id, task.runtime.pending_time, task.task_id()));
        for task in &pending {
            let Some(item) = index.get(task.table_identifier()) else {
                continue;
            };
            match self.queue.submit_task(task) {
                Ok(()) => item.metrics().record_task_submitted(),
                Err(e) => {
                    item.with_process(|process| process.fail_task(&task.task_id(), e.to_string()));
                }
            }
        }

        let committing: Vec<_> = index
            .values()
            .filter(|item| item.process_status() == Some(ProcessStatus::Committing))
            .cloned()
            .collect();
        *self.tables.write().await = Arc::new(index);
        self.inited.store(true, Ordering::SeqCst);
        for item in committing {
            self.trigger_optimize_commit(item);
        }

        tracing::info!(
            "optimize service initialized with {} tables, resubmitted {} pending tasks in {:?}",
            self.list_cached_tables().await.len(),
            pending.len(),
            started.elapsed()
        );
        Ok(())
    }

    /// Rebuilds the latest process of a table from its task rows and returns
    /// the tasks that still wait in a queue. Rows of older processes are
    /// deleted.
    async fn restore_process(
        &self,
        item: &Arc<TableOptimizeItem>,
        mut tasks: Vec<OptimizeTaskItem>,
    ) -> Vec<OptimizeTaskItem> {
        let Some(process_id) = tasks.iter().map(|t| t.task_id().process_id).max() else {
            return vec![];
        };
        let stale: BTreeSet<i64> = tasks
            .iter()
            .map(|t| t.task_id().process_id)
            .filter(|id| *id != process_id)
            .collect();
        for stale_id in stale {
            if let Err(e) = self
                .store
                .delete_process_tasks(item.table_identifier(), stale_id)
                .await
            {
                tracing::warn!(
                    "failed to delete stale process {} of table {}: {}",
                    stale_id,
                    item.table_identifier(),
                    e
                );
            }
        }
        tasks.retain(|t| t.task_id().process_id == process_id);

        let optimize_type = tasks[0].task.optimize_type;
        let target_snapshot_id = item
            .runtime()
            .current_snapshot_id
            .unwrap_or(INVALID_SNAPSHOT_ID);
        let process = TableOptimizingProcess::restore(
            process_id,
            item.table_identifier().clone(),
            optimize_type,
            target_snapshot_id,
            self.config.max_task_retries,
            tasks,
        )
        .handle_task_retry(self.retry_handler(item))
        .handle_task_clear(self.clear_handler(item));

        let pending = process
            .tasks()
            .filter(|t| t.status() == TaskStatus::Pending)
            .cloned()
            .collect();
        tracing::info!(
            "restored optimizing process {} of table {} in status {}",
            process_id,
            item.table_identifier(),
            process.status()
        );
        item.set_process(process);
        pending
    }

    async fn load_table_item(
        &self,
        id: &TableIdentifier,
        persisted: Option<TableOptimizeRuntime>,
    ) -> Result<TableLoad> {
        let table = self.catalogs.load_table(id).await?;
        let metadata = self.catalogs.build_table_metadata(&table).await?;
        let config = metadata.optimizing_config();
        if !config.enabled {
            tracing::debug!("table {} is not self-optimizing, skip", id);
            return Ok(TableLoad::Disabled);
        }

        let persisted = match persisted {
            Some(runtime) => Some(runtime),
            None => self.store.select_table_runtime(id).await?,
        };
        let queue_id = match self.queue.bind(id, &config.group_name) {
            Ok(queue_id) => queue_id,
            Err(e) => {
                tracing::warn!(
                    "failed to bind table {} to optimizer group {}, retry on next refresh: {}",
                    id,
                    config.group_name,
                    e
                );
                return Ok(TableLoad::Unbound);
            }
        };

        let mut runtime = persisted.clone().unwrap_or_else(|| {
            TableOptimizeRuntime::new(id.clone(), config.group_name.clone(), config.create_time)
        });
        runtime.group_name = config.group_name.clone();
        runtime.queue_id = Some(queue_id);
        if persisted.as_ref() != Some(&runtime) {
            if let Err(e) = self.store.upsert_table_runtime(&runtime).await {
                tracing::warn!("failed to persist runtime of table {}: {}", id, e);
            }
        }

        let item = Arc::new(TableOptimizeItem::new(
            config,
            runtime,
            TableMetricsRecorder::new(self.metrics.clone(), id),
        ));
        item.metrics().record_table_added();
        tracing::info!(
            "table {} registered for self-optimizing on queue {}",
            id,
            queue_id
        );
        Ok(TableLoad::Registered(item))
    }

    /// Lists every catalog, then registers new tables and drops vanished
    /// ones. Tables of a catalog that failed to list are left as they are.
    pub async fn refresh_and_list_tables(&self) -> Result<Vec<TableIdentifier>> {
        if !self.is_initialized() {
            tracing::debug!("optimize service is not initialized, skip refresh");
            return Ok(self.list_cached_tables().await);
        }
        let _guard = self.refresh_lock.lock().await;

        let listed = self.catalogs.list_tables_by_catalog().await;
        let mut live = BTreeSet::new();
        let mut failed_catalogs = HashSet::new();
        for (catalog, tables) in listed {
            match tables {
                Some(tables) => live.extend(tables),
                None => {
                    failed_catalogs.insert(catalog);
                }
            }
        }

        let cached = self.index().await;
        let to_add: Vec<TableIdentifier> = live
            .iter()
            .filter(|id| !cached.contains_key(*id))
            .cloned()
            .collect();
        let to_remove: Vec<TableIdentifier> = cached
            .keys()
            .filter(|id| !live.contains(*id) && !failed_catalogs.contains(&id.catalog))
            .cloned()
            .collect();

        self.add_tables(to_add).await;
        self.remove_tables(to_remove).await;
        Ok(self.list_cached_tables().await)
    }

    /// Registers `tables`. Returns how many were added.
    pub async fn add_new_tables(&self, tables: impl IntoIterator<Item = TableIdentifier>) -> usize {
        if !self.is_initialized() {
            return 0;
        }
        let _guard = self.refresh_lock.lock().await;
        self.add_tables(tables.into_iter().collect()).await
    }

    /// Drops `tables` and their persisted state. Returns how many were
    /// registered.
    pub async fn clear_removed_tables(
        &self,
        tables: impl IntoIterator<Item = TableIdentifier>,
    ) -> usize {
        if !self.is_initialized() {
            return 0;
        }
        let _guard = self.refresh_lock.lock().await;
        self.remove_tables(tables.into_iter().collect()).await
    }

    async fn add_tables(&self, tables: Vec<TableIdentifier>) -> usize {
        if tables.is_empty() {
            return 0;
        }
        let loaded: Vec<Arc<TableOptimizeItem>> = stream::iter(tables)
            .map(|id| async move {
                match self.load_table_item(&id, None).await {
                    Ok(TableLoad::Registered(item)) => Some(item),
                    Ok(TableLoad::Disabled | TableLoad::Unbound) => None,
                    Err(e) => {
                        tracing::error!("failed to add table {}: {}", id, e);
                        None
                    }
                }
            })
            .buffer_unordered(self.config.table_load_parallelism.max(1))
            .filter_map(futures::future::ready)
            .collect()
            .await;
        if loaded.is_empty() {
            return 0;
        }

        let mut tables = self.tables.write().await;
        let mut next = BTreeMap::clone(&tables);
        let mut added = 0;
        for item in loaded {
            if !next.contains_key(item.table_identifier()) {
                next.insert(item.table_identifier().clone(), item);
                added += 1;
            }
        }
        *tables = Arc::new(next);
        added
    }

    async fn remove_tables(&self, tables: Vec<TableIdentifier>) -> usize {
        if tables.is_empty() {
            return 0;
        }
        let removed: Vec<Arc<TableOptimizeItem>> = {
            let mut index = self.tables.write().await;
            let mut next = BTreeMap::clone(&index);
            let removed: Vec<_> = tables.iter().filter_map(|id| next.remove(id)).collect();
            *index = Arc::new(next);
            removed
        };

        for item in &removed {
            item.with_process(TableOptimizingProcess::close);
            let failed = self.clear_table_state(item.table_identifier(), true).await;
            item.metrics().record_table_removed();
            tracing::info!(
                "table {} removed from self-optimizing, {} cleanup steps failed",
                item.table_identifier(),
                failed.len()
            );
        }
        removed.len()
    }

    /// Runs every cleanup step of a table, each on its own. Returns the names
    /// of the steps that failed.
    async fn clear_table_state(
        &self,
        table: &TableIdentifier,
        release_queue: bool,
    ) -> Vec<&'static str> {
        let mut steps: Vec<(&'static str, BoxFuture<'_, Result<()>>)> = vec![];
        if release_queue {
            steps.push(("release queue", async { self.queue.release(table) }.boxed()));
        }
        steps.push((
            "delete tasks",
            async { self.store.delete_table_tasks(table).await.map(|_| ()) }.boxed(),
        ));
        steps.push((
            "delete table runtime",
            async { self.store.delete_table_runtime(table).await.map(|_| ()) }.boxed(),
        ));
        steps.push((
            "delete history",
            async { self.store.delete_history(table).await.map(|_| ()) }.boxed(),
        ));

        let mut failed = vec![];
        for (step, future) in steps {
            if let Err(e) = future.await {
                tracing::warn!("failed to {} of table {}: {}", step, table, e);
                failed.push(step);
            }
        }
        failed
    }

    /// Registered tables in identifier order.
    pub async fn list_cached_tables(&self) -> Vec<TableIdentifier> {
        self.index().await.keys().cloned().collect()
    }

    /// Looks the table up, refreshing once on a miss.
    pub async fn get_table_optimize_item(
        &self,
        table: &TableIdentifier,
    ) -> Result<Arc<TableOptimizeItem>> {
        if let Some(item) = self.index().await.get(table) {
            return Ok(item.clone());
        }
        self.refresh_and_list_tables().await?;
        self.index()
            .await
            .get(table)
            .cloned()
            .ok_or_else(|| OptimizeError::NotFound(format!("table {table} is not self-optimizing")))
    }

    async fn index(&self) -> TableIndex {
        self.tables.read().await.clone()
    }

    /// Routes an execution report to its table.
    pub async fn handle_optimize_result(&self, stat: OptimizeTaskStat) -> Result<()> {
        let item = self
            .index()
            .await
            .get(&stat.table_identifier)
            .cloned()
            .ok_or_else(|| {
                OptimizeError::NotFound(format!(
                    "table {} is not self-optimizing",
                    stat.table_identifier
                ))
            })?;

        let outcome = item.accept_result(&stat)?;
        if let Some(runtime) = &outcome.task_runtime {
            if let Err(e) = self
                .store
                .upsert_task_runtime(item.table_identifier(), runtime)
                .await
            {
                tracing::warn!("failed to persist runtime of task {}: {}", stat.task_id, e);
            }
        }
        match outcome.process_status {
            ProcessStatus::Committing if !item.is_commit_pending() => {
                if !self.trigger_optimize_commit(item.clone()) {
                    tracing::warn!(
                        "process {} of table {} will be offered for commit on the next check",
                        outcome.process_id,
                        item.table_identifier()
                    );
                }
            }
            ProcessStatus::Failed | ProcessStatus::Closed => {
                self.clear_finished_process(&item).await;
            }
            ProcessStatus::Running | ProcessStatus::Committing => {}
        }
        Ok(())
    }

    /// Offers a table to the commit queue without blocking. Returns `false`
    /// when the queue is full.
    ///
    /// The pending flag is raised before the offer, so a committer that takes
    /// the table right away always sees it and clears it.
    pub fn trigger_optimize_commit(&self, item: Arc<TableOptimizeItem>) -> bool {
        let was_pending = item.swap_commit_pending(true);
        match self.commit_sender.try_send(item.clone()) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                item.set_commit_pending(was_pending);
                item.metrics().record_commit_queue_rejected();
                tracing::warn!(
                    "commit queue is full, reject table {}",
                    item.table_identifier()
                );
                false
            }
            Err(TrySendError::Closed(_)) => {
                item.set_commit_pending(was_pending);
                tracing::error!(
                    "commit queue is closed, reject table {}",
                    item.table_identifier()
                );
                false
            }
        }
    }

    /// Acknowledges that an executor picked up a task: the task moves to
    /// `Executing` and its runtime is persisted.
    pub async fn ack_task(&self, table: &TableIdentifier, task_id: OptimizeTaskId) -> Result<()> {
        let item = self.get_table_optimize_item(table).await?;
        let runtime = item
            .with_process(|process| {
                process.mark_task_executing(&task_id).and_then(|()| {
                    process
                        .task(&task_id)
                        .map(|t| t.runtime.clone())
                        .ok_or_else(|| OptimizeError::NotFound(format!("task {task_id}")))
                })
            })
            .ok_or_else(|| {
                OptimizeError::NotFound(format!(
                    "no optimizing process of table {table} for task {task_id}"
                ))
            })??;
        tracing::debug!("task {} of table {} is executing", task_id, table);
        self.store.upsert_task_runtime(table, &runtime).await
    }

    /// Waits for the next table to commit. Tables come out in offer order.
    pub async fn take_table_to_commit(&self) -> Option<Arc<TableOptimizeItem>> {
        self.commit_receiver.lock().await.recv().await
    }

    pub fn commit_queue_len(&self) -> usize {
        self.commit_sender.max_capacity() - self.commit_sender.capacity()
    }

    /// Commits the finished process of `item`, records history, and returns
    /// the table to idle. `Ok(None)` when there is nothing to commit.
    pub async fn commit_table(&self, item: &Arc<TableOptimizeItem>) -> Result<Option<i64>> {
        let Some(commit_manager) = self.commit_manager.as_ref() else {
            item.set_commit_pending(false);
            return Err(OptimizeError::Precondition(
                "no process committer configured".to_owned(),
            ));
        };
        let _schedule = item.lock_schedule().await;
        let Some(mut process) = item.take_committing_process() else {
            tracing::debug!("table {} has nothing to commit", item.table_identifier());
            return Ok(None);
        };

        let started = Instant::now();
        let result = commit_manager.commit(&process).await;
        let table = item.table_identifier();
        match result {
            Ok(snapshot_id) => {
                process.commit_succeeded()?;
                let now = current_time_millis();
                let history = OptimizeHistory {
                    history_id: 0,
                    table_identifier: table.clone(),
                    process_id: process.process_id(),
                    optimize_type: process.optimize_type(),
                    start_time: process.plan_time(),
                    end_time: now,
                    input_file_count: process
                        .tasks()
                        .map(|t| t.task.files.len() as i64)
                        .sum(),
                    input_bytes: process.input_bytes() as i64,
                    output_file_count: process.output_files().count() as i64,
                    output_bytes: process
                        .output_files()
                        .map(|f| f.file_size_in_bytes as i64)
                        .sum(),
                    commit_time: now,
                };
                if let Err(e) = self.store.insert_history(&history).await {
                    tracing::warn!("failed to record history of table {}: {}", table, e);
                }
                self.delete_process_rows(table, process.process_id()).await;
                item.update_runtime(|runtime| {
                    runtime.update_status(OptimizeStatus::Idle);
                    runtime.current_snapshot_id = Some(snapshot_id);
                });
                self.persist_runtime(item).await;
                item.metrics()
                    .record_commit_success(started.elapsed().as_secs_f64() * 1000.0);
                tracing::info!(
                    "committed process {} of table {} as snapshot {}",
                    process.process_id(),
                    table,
                    snapshot_id
                );
                Ok(Some(snapshot_id))
            }
            Err(e) => {
                item.metrics().record_commit_failure();
                process.commit_failed(e.to_string());
                self.delete_process_rows(table, process.process_id()).await;
                self.persist_runtime(item).await;
                Err(e)
            }
        }
    }

    /// Commits tables as they arrive on the commit queue.
    pub fn spawn_committer(self: Arc<Self>) -> JoinHandle<()> {
        tokio::spawn(async move {
            while let Some(item) = self.take_table_to_commit().await {
                if let Err(e) = self.commit_table(&item).await {
                    tracing::error!(
                        "failed to commit table {}: {}",
                        item.table_identifier(),
                        e
                    );
                }
            }
        })
    }

    /// The periodic tick: refreshes the table set, then schedules every
    /// registered table. A failing table is logged and skipped.
    pub async fn check_optimize_check_tasks(&self) -> Result<()> {
        if !self.is_initialized() {
            tracing::debug!("optimize service is not initialized, skip check");
            return Ok(());
        }
        self.refresh_and_list_tables().await?;
        let items: Vec<_> = self.index().await.values().cloned().collect();
        stream::iter(items)
            .for_each_concurrent(self.config.check_parallelism.max(1), |item| async move {
                if let Err(e) = self.check_table(&item).await {
                    tracing::error!("failed to check table {}: {}", item.table_identifier(), e);
                }
            })
            .await;
        Ok(())
    }

    async fn check_table(&self, item: &Arc<TableOptimizeItem>) -> Result<()> {
        self.clear_finished_process(item).await;
        if item.has_process() {
            if item.process_status() == Some(ProcessStatus::Committing) && !item.is_commit_pending()
            {
                self.trigger_optimize_commit(item.clone());
            }
            return Ok(());
        }
        let table = self.catalogs.load_table(item.table_identifier()).await?;
        let last_process_id = item.runtime().latest_process_id.unwrap_or_default();
        let planner = self
            .planner_factory
            .create_planner(table, item.config().clone(), last_process_id)
            .await?;
        self.optimize_table(item.table_identifier(), planner).await?;
        Ok(())
    }

    /// One scheduling tick of one table. Starts a process when the table has
    /// none running and `planner` found work; returns its id.
    pub async fn optimize_table(
        &self,
        table: &TableIdentifier,
        planner: Arc<dyn OptimizingPlanner>,
    ) -> Result<Option<i64>> {
        if !self.is_initialized() {
            return Ok(None);
        }
        let item = self.get_table_optimize_item(table).await?;
        let _schedule = item.lock_schedule().await;
        self.clear_finished_process(&item).await;
        if item.has_process() {
            tracing::debug!("table {} already has a running process", table);
            return Ok(None);
        }

        item.update_runtime(|runtime| {
            runtime.update_pending(planner.pending_input());
            if planner.target_snapshot_id() != INVALID_SNAPSHOT_ID {
                runtime.current_snapshot_id = Some(planner.target_snapshot_id());
            }
        });
        if !planner.is_necessary() {
            if item.update_runtime(|runtime| runtime.update_status(OptimizeStatus::Idle)) {
                self.persist_runtime(&item).await;
            }
            return Ok(None);
        }
        let Some(queue_id) = item.queue_id() else {
            tracing::warn!("table {} is not bound to a queue", table);
            return Ok(None);
        };
        item.update_runtime(|runtime| runtime.update_status(OptimizeStatus::Pending));

        let config = OptimizingProcessIterator::builder()
            .planner(planner)
            .clear_handler(self.clear_handler(&item))
            .retry_handler(self.retry_handler(&item))
            .task_offer(self.task_offer(&item))
            .queue_id(queue_id)
            .max_task_retries(self.config.max_task_retries)
            .build()?;
        let mut processes = OptimizingProcessIterator::new(config);
        let Some(process) = processes.next() else {
            item.update_runtime(|runtime| runtime.update_status(OptimizeStatus::Idle));
            self.persist_runtime(&item).await;
            return Ok(None);
        };

        let process_id = process.process_id();
        let tasks: Vec<OptimizeTaskItem> = process.tasks().cloned().collect();
        if let Err(e) = self.store.insert_task_items(&tasks).await {
            tracing::error!(
                "failed to persist tasks of process {} of table {}: {}",
                process_id,
                table,
                e
            );
        }
        if let Some(reason) = process.fail_reason() {
            tracing::error!(
                "process {} of table {} failed while offering tasks: {}",
                process_id,
                table,
                reason
            );
        }
        item.metrics().record_process_created();
        tracing::info!(
            "table {} started {} optimizing process {} with {} tasks, {} groups left",
            table,
            process.optimize_type(),
            process_id,
            tasks.len(),
            processes.size()
        );
        item.set_process(process);
        self.persist_runtime(&item).await;
        Ok(Some(process_id))
    }

    async fn clear_finished_process(&self, item: &TableOptimizeItem) {
        let Some(process) = item.take_finished_process() else {
            return;
        };
        self.delete_process_rows(item.table_identifier(), process.process_id())
            .await;
        item.update_runtime(|runtime| runtime.update_status(OptimizeStatus::Idle));
        self.persist_runtime(item).await;
    }

    async fn delete_process_rows(&self, table: &TableIdentifier, process_id: i64) {
        if let Err(e) = self.store.delete_process_tasks(table, process_id).await {
            tracing::warn!(
                "failed to delete tasks of process {} of table {}: {}",
                process_id,
                table,
                e
            );
        }
    }

    async fn persist_runtime(&self, item: &TableOptimizeItem) {
        if let Err(e) = self.store.upsert_table_runtime(&item.runtime()).await {
            tracing::warn!(
                "failed to persist runtime of table {}: {}",
                item.table_identifier(),
                e
            );
        }
    }

    fn task_offer(&self, item: &Arc<TableOptimizeItem>) -> TaskOfferHandler {
        let queue = self.queue.clone();
        let metrics = item.metrics().clone();
        Arc::new(move |task: &OptimizeTaskItem| {
            queue.submit_task(task)?;
            metrics.record_task_submitted();
            Ok(())
        })
    }

    fn retry_handler(&self, item: &Arc<TableOptimizeItem>) -> TaskRetryHandler {
        let queue = self.queue.clone();
        let metrics = item.metrics().clone();
        Arc::new(move |task: &OptimizeTaskItem, will_retry: bool| {
            if !will_retry {
                return Ok(());
            }
            queue.submit_task(task)?;
            metrics.record_task_retried();
            Ok(())
        })
    }

    fn clear_handler(&self, item: &Arc<TableOptimizeItem>) -> ProcessClearHandler {
        let item = Arc::downgrade(item);
        Arc::new(move |process: &TableOptimizingProcess| {
            tracing::info!(
                "clear optimizing process {} of table {}: {}",
                process.process_id(),
                process.table_identifier(),
                process.fail_reason().unwrap_or("closed")
            );
            if let Some(item) = item.upgrade() {
                item.update_runtime(|runtime| runtime.update_status(OptimizeStatus::Idle));
            }
        })
    }

    pub async fn get_optimize_history(
        &self,
        table: &TableIdentifier,
    ) -> Result<Vec<OptimizeHistory>> {
        self.store.select_history(table).await
    }

    pub async fn max_optimize_history_id(&self) -> Result<i64> {
        self.store.max_history_id().await
    }

    pub async fn expire_optimize_history(
        &self,
        table: &TableIdentifier,
        expire_time: i64,
    ) -> Result<usize> {
        self.store.expire_history(table, expire_time).await
    }

    /// Expires history older than the configured retention on every
    /// registered table. Failures are logged per table.
    pub async fn expire_history_by_retention(&self) -> usize {
        let expire_time = current_time_millis() - self.config.history_retention_ms;
        let mut expired = 0;
        for table in self.list_cached_tables().await {
            match self.store.expire_history(&table, expire_time).await {
                Ok(count) => expired += count,
                Err(e) => tracing::warn!("failed to expire history of table {}: {}", table, e),
            }
        }
        expired
    }
}
