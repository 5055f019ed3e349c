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


//! Scenario tests driving a whole [`OptimizeService`] through its public API.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use iceberg_optimizer_core::common::{OptimizeStatus, OptimizeTaskId, ProcessStatus, TaskStatus};
use iceberg_optimizer_core::config::SELF_OPTIMIZING_ENABLED;
use iceberg_optimizer_core::optimizing::OptimizeTaskStat;
use iceberg_optimizer_core::store::MemoryOptimizeStore;
use iceberg_optimizer_core::test_utils::{MemoryCatalog, MemoryTable, MockPlanner};
use iceberg_optimizer_core::{OptimizeError, OptimizeQueue, OptimizeStore, SqlOptimizeStore};

use crate::test_utils::{CATALOG, Scenario, table, test_config, wait_until};

fn planner(id: &iceberg_optimizer_core::TableIdentifier, tasks: &[(&str, i64)]) -> MockPlanner {
    tasks
        .iter()
        .fold(MockPlanner::new(id.clone()), |planner, (partition, seq)| {
            planner.with_task(partition, 1024, *seq, 100)
        })
}

#[tokio::test]
async fn test_commit_queue_holds_capacity_and_drains_in_order() {
    let scenario = Scenario::new(test_config());
    for i in 0..1001 {
        scenario
            .catalog
            .add_table(MemoryTable::new(table(&format!("t{i:04}"))));
    }
    scenario.service.init().await.unwrap();
    let tables = scenario.service.list_cached_tables().await;
    assert_eq!(tables.len(), 1001);

    for (i, id) in tables.iter().enumerate() {
        let item = scenario.service.get_table_optimize_item(id).await.unwrap();
        assert_eq!(scenario.service.trigger_optimize_commit(item), i < 1000);
    }
    assert_eq!(scenario.service.commit_queue_len(), 1000);

    let mut drained = vec![];
    for _ in 0..1000 {
        let item = scenario.service.take_table_to_commit().await.unwrap();
        drained.push(item.table_identifier().clone());
    }
    assert_eq!(drained, tables[..1000].to_vec());
    assert_eq!(scenario.service.commit_queue_len(), 0);
}

#[tokio::test]
async fn test_refresh_is_idempotent() {
    let catalog = Arc::new(MemoryCatalog::new(CATALOG, true));
    let store = Arc::new(MemoryOptimizeStore::new());
    let scenario = Scenario::build(test_config(), catalog, store.clone());
    scenario.catalog.add_table(MemoryTable::new(table("t1")));
    scenario.catalog.add_table(MemoryTable::new(table("t2")));
    scenario.service.init().await.unwrap();
    let writes = store.table_runtime_writes();

    let first = scenario.service.refresh_and_list_tables().await.unwrap();
    let second = scenario.service.refresh_and_list_tables().await.unwrap();
    assert_eq!(first, vec![table("t1"), table("t2")]);
    assert_eq!(first, second);
    assert_eq!(store.table_runtime_writes(), writes);

    scenario.catalog.add_table(MemoryTable::new(table("t3")));
    let third = scenario.service.refresh_and_list_tables().await.unwrap();
    assert_eq!(third.len(), 3);
    assert_eq!(store.table_runtime_writes(), writes + 1);
}

#[tokio::test]
async fn test_partitioned_threshold_is_exclusive() {
    let scenario = Scenario::new(test_config());
    let (flat, split) = (table("flat"), table("split"));
    scenario.catalog.add_table(MemoryTable::new(flat.clone()));
    scenario.catalog.add_table(MemoryTable::new(split.clone()));
    scenario.service.init().await.unwrap();

    let tasks = [("a", 1), ("a", 2), ("b", 5)];
    let at_threshold = planner(&flat, &tasks).with_eq_delete_count(100);
    let above_threshold = planner(&split, &tasks).with_eq_delete_count(101);
    scenario
        .service
        .optimize_table(&flat, Arc::new(at_threshold))
        .await
        .unwrap();
    scenario
        .service
        .optimize_table(&split, Arc::new(above_threshold))
        .await
        .unwrap();

    let partitions = |id| {
        let service = scenario.service.clone();
        async move {
            let item = service.get_table_optimize_item(&id).await.unwrap();
            item.with_process(|p| {
                p.tasks()
                    .map(|t| t.task.partition.clone())
                    .collect::<BTreeSet<_>>()
            })
            .unwrap()
        }
    };
    assert_eq!(partitions(flat).await.len(), 2);
    assert_eq!(partitions(split).await.len(), 1);
}

#[tokio::test]
async fn test_same_plan_yields_same_task_order() {
    let tasks = [("b", 3), ("a", 1), ("a", 2), ("c", 9)];
    let mut orders = vec![];
    for _ in 0..2 {
        let scenario = Scenario::new(test_config());
        let id = table("t1");
        scenario.catalog.add_table(MemoryTable::new(id.clone()));
        scenario.service.init().await.unwrap();
        scenario
            .service
            .optimize_table(&id, Arc::new(planner(&id, &tasks)))
            .await
            .unwrap();
        let mut order = vec![];
        while scenario.queue.pending_len(1) > 0 {
            let task = scenario.queue.poll_task(1).await.unwrap();
            order.push((task.task.partition.clone(), task.task.from_sequence));
        }
        orders.push(order);
    }
    assert_eq!(orders[0].len(), 4);
    assert_eq!(orders[0], orders[1]);
}

#[tokio::test]
async fn test_restart_resubmits_pending_tasks_oldest_first() {
    let scenario = Scenario::with_sql_store(test_config()).await.unwrap();
    let (t1, t2) = (table("t1"), table("t2"));
    scenario.catalog.add_table(MemoryTable::new(t1.clone()));
    scenario.catalog.add_table(MemoryTable::new(t2.clone()));
    scenario.service.init().await.unwrap();

    scenario
        .service
        .optimize_table(&t2, Arc::new(planner(&t2, &[("p", 1), ("p", 2)])))
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(5)).await;
    scenario
        .service
        .optimize_table(&t1, Arc::new(planner(&t1, &[("p", 1)])))
        .await
        .unwrap();

    let restarted = scenario.restart();
    restarted.service.init().await.unwrap();
    assert_eq!(restarted.queue.pending_len(1), 3);
    let mut polled = vec![];
    for _ in 0..3 {
        let task = restarted.queue.poll_task(1).await.unwrap();
        polled.push((task.table_identifier().clone(), task.task_id()));
    }
    assert_eq!(
        polled,
        vec![
            (t2.clone(), OptimizeTaskId::new(1, 1)),
            (t2.clone(), OptimizeTaskId::new(1, 2)),
            (t1.clone(), OptimizeTaskId::new(1, 1)),
        ]
    );

    // The restored process still owns the table.
    let item = restarted.service.get_table_optimize_item(&t1).await.unwrap();
    assert_eq!(item.process_status(), Some(ProcessStatus::Running));
    assert_eq!(
        restarted
            .service
            .optimize_table(&t1, Arc::new(planner(&t1, &[("p", 3)])))
            .await
            .unwrap(),
        None
    );
}

#[tokio::test]
async fn test_missing_task_runtime_aborts_startup() {
    let store = Arc::new(SqlOptimizeStore::in_memory().await.unwrap());
    let scenario = Scenario::build(
        test_config(),
        Arc::new(MemoryCatalog::new(CATALOG, true)),
        store.clone(),
    );
    let t1 = table("t1");
    scenario.catalog.add_table(MemoryTable::new(t1.clone()));
    scenario.service.init().await.unwrap();
    scenario
        .service
        .optimize_table(&t1, Arc::new(planner(&t1, &[("p", 1)])))
        .await
        .unwrap();

    sqlx::query("DELETE FROM optimize_task_runtime")
        .execute(store.pool())
        .await
        .unwrap();

    let restarted = scenario.restart();
    let result = restarted.service.clone().start().await.unwrap();
    assert!(matches!(result, Err(OptimizeError::FatalConsistency(_))));
    assert!(!restarted.service.is_initialized());
    assert!(
        restarted
            .service
            .refresh_and_list_tables()
            .await
            .unwrap()
            .is_empty()
    );
}

#[tokio::test]
async fn test_disabled_table_state_is_purged_on_restart() {
    let scenario = Scenario::with_sql_store(test_config()).await.unwrap();
    let t1 = table("t1");
    scenario.catalog.add_table(MemoryTable::new(t1.clone()));
    scenario.service.init().await.unwrap();
    scenario
        .service
        .optimize_table(&t1, Arc::new(planner(&t1, &[("p", 1)])))
        .await
        .unwrap();
    assert!(scenario.store.select_table_runtime(&t1).await.unwrap().is_some());

    scenario.catalog.remove_table(&t1);
    scenario
        .catalog
        .add_table(MemoryTable::new(t1.clone()).with_property(SELF_OPTIMIZING_ENABLED, "false"));

    let restarted = scenario.restart();
    restarted.service.init().await.unwrap();
    assert!(restarted.service.list_cached_tables().await.is_empty());
    assert!(restarted.store.select_table_runtime(&t1).await.unwrap().is_none());
    assert!(restarted.store.select_all_tasks().await.unwrap().is_empty());
    assert_eq!(restarted.queue.bound_queue(&t1), None);
}

#[tokio::test]
async fn test_removed_table_releases_queue_and_state() {
    let scenario = Scenario::with_sql_store(test_config()).await.unwrap();
    let (t1, t2) = (table("t1"), table("t2"));
    scenario.catalog.add_table(MemoryTable::new(t1.clone()));
    scenario.catalog.add_table(MemoryTable::new(t2.clone()));
    scenario.service.init().await.unwrap();
    assert_eq!(scenario.queue.bound_queue(&t1), Some(1));

    scenario.catalog.remove_table(&t1);
    let tables = scenario.service.refresh_and_list_tables().await.unwrap();
    assert_eq!(tables, vec![t2.clone()]);
    assert_eq!(scenario.queue.bound_queue(&t1), None);
    assert!(scenario.store.select_table_runtime(&t1).await.unwrap().is_none());

    let err = scenario
        .service
        .handle_optimize_result(OptimizeTaskStat::new(
            t1.clone(),
            OptimizeTaskId::new(1, 1),
            0,
            TaskStatus::Success,
        ))
        .await
        .unwrap_err();
    assert!(matches!(err, OptimizeError::NotFound(_)));
}

#[tokio::test]
async fn test_scheduled_process_is_committed_end_to_end() {
    let scenario = Scenario::with_sql_store(test_config()).await.unwrap();
    let t1 = table("t1");
    scenario.catalog.add_table(MemoryTable::new(t1.clone()));
    scenario.planners.set_script(|id, last_process_id| {
        if last_process_id == 0 {
            planner(id, &[("p", 1), ("p", 2)]).with_first_process_id(last_process_id + 1)
        } else {
            MockPlanner::new(id.clone())
        }
    });
    scenario.committer.fail_times(1, true);
    scenario.service.clone().start().await.unwrap().unwrap();
    let committer_loop = scenario.service.clone().spawn_committer();

    scenario.service.check_optimize_check_tasks().await.unwrap();
    let item = scenario.service.get_table_optimize_item(&t1).await.unwrap();
    assert_eq!(item.runtime().latest_process_id, Some(1));

    for _ in 0..2 {
        let task = scenario.queue.poll_task(1).await.unwrap();
        let stat = OptimizeTaskStat::new(
            t1.clone(),
            task.task_id(),
            task.runtime.attempt_id,
            TaskStatus::Success,
        );
        scenario.service.handle_optimize_result(stat).await.unwrap();
    }

    let service = scenario.service.clone();
    let committed = wait_until(Duration::from_secs(5), || {
        let service = service.clone();
        let t1 = t1.clone();
        async move { service.get_optimize_history(&t1).await.unwrap().len() == 1 }
    })
    .await;
    assert!(committed);
    assert_eq!(scenario.committer.committed(), vec![1]);
    assert_eq!(scenario.committer.attempts(), 2);
    assert_eq!(item.optimize_status(), OptimizeStatus::Idle);
    assert!(scenario.store.select_all_tasks().await.unwrap().is_empty());

    // Nothing left to optimize on the next tick.
    scenario.service.check_optimize_check_tasks().await.unwrap();
    assert!(!item.has_process());
    assert_eq!(item.optimize_status(), OptimizeStatus::Idle);

    committer_loop.abort();
}
