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


//! Wiring shared by the scenario tests: an in-memory catalog, a store, the
//! group queues and a recording committer around one [`OptimizeService`].

use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use iceberg_optimizer_core::catalog::OptimizingTable;
use iceberg_optimizer_core::config::{CommitRetryConfig, OptimizingConfig};
use iceberg_optimizer_core::plan::OptimizingPlanner;
use iceberg_optimizer_core::service::PlannerFactory;
use iceberg_optimizer_core::store::MemoryOptimizeStore;
use iceberg_optimizer_core::test_utils::{MemoryCatalog, MockPlanner, RecordingCommitter};
use iceberg_optimizer_core::{
    CatalogManager, OptimizeService, OptimizeServiceConfig, OptimizeStore, OptimizeQueueService,
    Result, SqlOptimizeStore, TableIdentifier,
};
use tracing_subscriber::EnvFilter;

pub const CATALOG: &str = "hive";

/// Installs a test-friendly subscriber once; later calls are no-ops.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

pub fn table(name: &str) -> TableIdentifier {
    TableIdentifier::new(CATALOG, "db", name)
}

pub fn test_config() -> OptimizeServiceConfig {
    OptimizeServiceConfig {
        commit_retry: CommitRetryConfig {
            max_retries: 2,
            retry_initial_delay_ms: 1,
            retry_max_delay_ms: 5,
        },
        ..Default::default()
    }
}

/// Plans through a swappable closure so a test can script what each tick
/// finds.
pub struct ScriptedPlannerFactory {
    script: Mutex<Box<dyn Fn(&TableIdentifier, i64) -> MockPlanner + Send>>,
}

impl ScriptedPlannerFactory {
    pub fn new(script: impl Fn(&TableIdentifier, i64) -> MockPlanner + Send + 'static) -> Self {
        Self {
            script: Mutex::new(Box::new(script)),
        }
    }

    pub fn set_script(
        &self,
        script: impl Fn(&TableIdentifier, i64) -> MockPlanner + Send + 'static,
    ) {
        *self.script.lock().unwrap_or_else(PoisonError::into_inner) = Box::new(script);
    }
}

#[async_trait]
impl PlannerFactory for ScriptedPlannerFactory {
    async fn create_planner(
        &self,
        table: Arc<dyn OptimizingTable>,
        config: OptimizingConfig,
        last_process_id: i64,
    ) -> Result<Arc<dyn OptimizingPlanner>> {
        let script = self.script.lock().unwrap_or_else(PoisonError::into_inner);
        let planner = script(table.identifier(), last_process_id).with_config(config);
        Ok(Arc::new(planner))
    }
}

pub struct Scenario {
    pub service: Arc<OptimizeService>,
    pub catalog: Arc<MemoryCatalog>,
    pub store: Arc<dyn OptimizeStore>,
    pub queue: Arc<OptimizeQueueService>,
    pub committer: Arc<RecordingCommitter>,
    pub planners: Arc<ScriptedPlannerFactory>,
}

impl Scenario {
    /// A fresh scenario over a memory store.
    pub fn new(config: OptimizeServiceConfig) -> Self {
        Self::build(
            config,
            Arc::new(MemoryCatalog::new(CATALOG, true)),
            Arc::new(MemoryOptimizeStore::new()),
        )
    }

    /// A fresh scenario over an in-memory SQLite store.
    pub async fn with_sql_store(config: OptimizeServiceConfig) -> Result<Self> {
        let store = SqlOptimizeStore::in_memory().await?;
        Ok(Self::build(
            config,
            Arc::new(MemoryCatalog::new(CATALOG, true)),
            Arc::new(store),
        ))
    }

    pub fn build(
        config: OptimizeServiceConfig,
        catalog: Arc<MemoryCatalog>,
        store: Arc<dyn OptimizeStore>,
    ) -> Self {
        init_tracing();
        let queue = Arc::new(OptimizeQueueService::from_config(&config));
        let committer = Arc::new(RecordingCommitter::new());
        let planners = Arc::new(ScriptedPlannerFactory::new(|table, last_process_id| {
            MockPlanner::new(table.clone()).with_first_process_id(last_process_id + 1)
        }));
        let service = OptimizeService::new(
            config,
            CatalogManager::new().with_catalog(catalog.clone()),
            store.clone(),
            queue.clone(),
        )
        .with_committer(committer.clone())
        .with_planner_factory(planners.clone());
        Self {
            service: Arc::new(service),
            catalog,
            store,
            queue,
            committer,
            planners,
        }
    }

    /// A second service over the same catalog and store, as after a restart.
    /// The queues start empty.
    pub fn restart(&self) -> Self {
        Self::build(
            self.service.config().clone(),
            self.catalog.clone(),
            self.store.clone(),
        )
    }
}

/// Polls `check` until it holds or `timeout` passes.
pub async fn wait_until<F, Fut>(timeout: Duration, mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + timeout;
    while tokio::time::Instant::now() < deadline {
        if check().await {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    check().await
}
