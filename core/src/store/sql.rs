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

use std::str::FromStr;

use async_trait::async_trait;
use sqlx::Row;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions, SqliteRow};

use super::{OptimizeHistory, OptimizeStore};
use crate::catalog::ContentFile;
use crate::common::{OptimizeTaskId, TableIdentifier};
use crate::optimizing::{OptimizeTask, OptimizeTaskItem, TaskRuntime};
use crate::plan::TaskFiles;
use crate::service::TableOptimizeRuntime;
use crate::{OptimizeError, Result};

const SCHEMA: &[&str] = &[
    r#"CREATE TABLE IF NOT EXISTS optimize_task (
        process_id INTEGER NOT NULL,
        task_seq INTEGER NOT NULL,
        catalog_name TEXT NOT NULL,
        db_name TEXT NOT NULL,
        table_name TEXT NOT NULL,
        queue_id INTEGER NOT NULL,
        optimize_type TEXT NOT NULL,
        partition_key TEXT NOT NULL,
        base_files TEXT,
        insert_files TEXT,
        eq_delete_files TEXT,
        pos_delete_files TEXT,
        from_sequence INTEGER,
        to_sequence INTEGER,
        max_execute_time INTEGER,
        custom_output_location TEXT,
        create_time INTEGER NOT NULL,
        PRIMARY KEY (catalog_name, db_name, table_name, process_id, task_seq)
    )"#,
    r#"CREATE TABLE IF NOT EXISTS optimize_task_runtime (
        process_id INTEGER NOT NULL,
        task_seq INTEGER NOT NULL,
        catalog_name TEXT NOT NULL,
        db_name TEXT NOT NULL,
        table_name TEXT NOT NULL,
        status TEXT NOT NULL,
        attempt_id INTEGER NOT NULL,
        retry_count INTEGER NOT NULL,
        pending_time INTEGER NOT NULL,
        execute_time INTEGER,
        end_time INTEGER,
        fail_reason TEXT,
        fail_time INTEGER,
        PRIMARY KEY (catalog_name, db_name, table_name, process_id, task_seq)
    )"#,
    r#"CREATE TABLE IF NOT EXISTS optimize_table_runtime (
        catalog_name TEXT NOT NULL,
        db_name TEXT NOT NULL,
        table_name TEXT NOT NULL,
        optimize_status TEXT NOT NULL,
        optimize_status_start_time INTEGER NOT NULL,
        group_name TEXT NOT NULL,
        queue_id INTEGER,
        current_snapshot_id INTEGER,
        latest_process_id INTEGER,
        pending_files INTEGER NOT NULL DEFAULT 0,
        pending_bytes INTEGER NOT NULL DEFAULT 0,
        pending_eq_delete_files INTEGER NOT NULL DEFAULT 0,
        PRIMARY KEY (catalog_name, db_name, table_name)
    )"#,
    r#"CREATE TABLE IF NOT EXISTS optimize_history (
        history_id INTEGER PRIMARY KEY AUTOINCREMENT,
        catalog_name TEXT NOT NULL,
        db_name TEXT NOT NULL,
        table_name TEXT NOT NULL,
        process_id INTEGER NOT NULL,
        optimize_type TEXT NOT NULL,
        start_time INTEGER NOT NULL,
        end_time INTEGER NOT NULL,
        input_file_count INTEGER NOT NULL,
        input_bytes INTEGER NOT NULL,
        output_file_count INTEGER NOT NULL,
        output_bytes INTEGER NOT NULL,
        commit_time INTEGER NOT NULL
    )"#,
];

const TABLE_FILTER: &str = "catalog_name = ? AND db_name = ? AND table_name = ?";

const TASK_ORDER: &str = "catalog_name, db_name, table_name, process_id, task_seq";

/// [`OptimizeStore`] over a SQLite database.
///
/// The schema is created on connect. File lists are JSON text; a NULL column
/// loads as an empty list.
#[derive(Clone)]
pub struct SqlOptimizeStore {
    pool: SqlitePool,
}

impl SqlOptimizeStore {
    /// Connects to a database url such as `sqlite://optimizer.db`, creating
    /// the file when missing.
    pub async fn connect(url: &str) -> Result<Self> {
        let options = SqliteConnectOptions::from_str(url)?.create_if_missing(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await?;
        Self::with_pool(pool).await
    }

    /// Private in-memory database. A single connection that never idles out
    /// keeps the data alive for the lifetime of the store.
    pub async fn in_memory() -> Result<Self> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")?;
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await?;
        Self::with_pool(pool).await
    }

    pub async fn with_pool(pool: SqlitePool) -> Result<Self> {
        for statement in SCHEMA {
            sqlx::query(statement).execute(&pool).await?;
        }
        Ok(Self { pool })
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }
}

fn encode_files(files: &[ContentFile]) -> Result<String> {
    Ok(serde_json::to_string(files)?)
}

fn decode_files(raw: Option<String>) -> Result<Vec<ContentFile>> {
    match raw {
        None => Ok(vec![]),
        Some(raw) if raw.trim().is_empty() => Ok(vec![]),
        Some(raw) => Ok(serde_json::from_str(&raw)?),
    }
}

fn decode_enum<T: FromStr<Err = OptimizeError>>(raw: String) -> Result<T> {
    raw.parse()
}

fn table_identifier(row: &SqliteRow) -> Result<TableIdentifier> {
    Ok(TableIdentifier::new(
        row.try_get::<String, _>("catalog_name")?,
        row.try_get::<String, _>("db_name")?,
        row.try_get::<String, _>("table_name")?,
    ))
}

fn task_id(row: &SqliteRow) -> Result<OptimizeTaskId> {
    Ok(OptimizeTaskId::new(
        row.try_get("process_id")?,
        row.try_get("task_seq")?,
    ))
}

fn task_from_row(row: &SqliteRow) -> Result<OptimizeTask> {
    Ok(OptimizeTask {
        task_id: task_id(row)?,
        table_identifier: table_identifier(row)?,
        queue_id: row.try_get("queue_id")?,
        optimize_type: decode_enum(row.try_get("optimize_type")?)?,
        partition: row.try_get("partition_key")?,
        files: TaskFiles {
            base_files: decode_files(row.try_get("base_files")?)?,
            insert_files: decode_files(row.try_get("insert_files")?)?,
            eq_delete_files: decode_files(row.try_get("eq_delete_files")?)?,
            pos_delete_files: decode_files(row.try_get("pos_delete_files")?)?,
        },
        from_sequence: row.try_get("from_sequence")?,
        to_sequence: row.try_get("to_sequence")?,
        max_execute_time: row.try_get("max_execute_time")?,
        custom_output_location: row.try_get("custom_output_location")?,
        create_time: row.try_get("create_time")?,
    })
}

fn task_runtime_from_row(row: &SqliteRow) -> Result<TaskRuntime> {
    Ok(TaskRuntime {
        task_id: task_id(row)?,
        status: decode_enum(row.try_get("status")?)?,
        attempt_id: row.try_get("attempt_id")?,
        retry_count: row.try_get::<i64, _>("retry_count")? as u32,
        pending_time: row.try_get("pending_time")?,
        execute_time: row.try_get("execute_time")?,
        end_time: row.try_get("end_time")?,
        fail_reason: row.try_get("fail_reason")?,
        fail_time: row.try_get("fail_time")?,
    })
}

fn table_runtime_from_row(row: &SqliteRow) -> Result<TableOptimizeRuntime> {
    Ok(TableOptimizeRuntime {
        table_identifier: table_identifier(row)?,
        optimize_status: decode_enum(row.try_get("optimize_status")?)?,
        optimize_status_start_time: row.try_get("optimize_status_start_time")?,
        group_name: row.try_get("group_name")?,
        queue_id: row.try_get("queue_id")?,
        current_snapshot_id: row.try_get("current_snapshot_id")?,
        latest_process_id: row.try_get("latest_process_id")?,
        pending_files: row.try_get("pending_files")?,
        pending_bytes: row.try_get("pending_bytes")?,
        pending_eq_delete_files: row.try_get("pending_eq_delete_files")?,
    })
}

fn history_from_row(row: &SqliteRow) -> Result<OptimizeHistory> {
    Ok(OptimizeHistory {
        history_id: row.try_get("history_id")?,
        table_identifier: table_identifier(row)?,
        process_id: row.try_get("process_id")?,
        optimize_type: decode_enum(row.try_get("optimize_type")?)?,
        start_time: row.try_get("start_time")?,
        end_time: row.try_get("end_time")?,
        input_file_count: row.try_get("input_file_count")?,
        input_bytes: row.try_get("input_bytes")?,
        output_file_count: row.try_get("output_file_count")?,
        output_bytes: row.try_get("output_bytes")?,
        commit_time: row.try_get("commit_time")?,
    })
}

const UPSERT_TASK_RUNTIME: &str = r#"
    INSERT INTO optimize_task_runtime (
        process_id, task_seq, catalog_name, db_name, table_name, status, attempt_id,
        retry_count, pending_time, execute_time, end_time, fail_reason, fail_time
    ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
    ON CONFLICT (catalog_name, db_name, table_name, process_id, task_seq) DO UPDATE SET
        status = excluded.status,
        attempt_id = excluded.attempt_id,
        retry_count = excluded.retry_count,
        pending_time = excluded.pending_time,
        execute_time = excluded.execute_time,
        end_time = excluded.end_time,
        fail_reason = excluded.fail_reason,
        fail_time = excluded.fail_time
"#;

fn bind_task_runtime<'q>(
    query: sqlx::query::Query<'q, sqlx::Sqlite, sqlx::sqlite::SqliteArguments<'q>>,
    table: &'q TableIdentifier,
    runtime: &'q TaskRuntime,
) -> sqlx::query::Query<'q, sqlx::Sqlite, sqlx::sqlite::SqliteArguments<'q>> {
    query
        .bind(runtime.task_id.process_id)
        .bind(runtime.task_id.task_seq)
        .bind(table.catalog.as_str())
        .bind(table.database.as_str())
        .bind(table.table.as_str())
        .bind(runtime.status.as_str())
        .bind(runtime.attempt_id)
        .bind(runtime.retry_count as i64)
        .bind(runtime.pending_time)
        .bind(runtime.execute_time)
        .bind(runtime.end_time)
        .bind(runtime.fail_reason.as_deref())
        .bind(runtime.fail_time)
}

#[async_trait]
impl OptimizeStore for SqlOptimizeStore {
    async fn select_all_tasks(&self) -> Result<Vec<OptimizeTask>> {
        let rows = sqlx::query(&format!("SELECT * FROM optimize_task ORDER BY {TASK_ORDER}"))
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(task_from_row).collect()
    }

    async fn select_all_task_runtimes(&self) -> Result<Vec<(TableIdentifier, TaskRuntime)>> {
        let rows = sqlx::query(&format!(
            "SELECT * FROM optimize_task_runtime ORDER BY {TASK_ORDER}"
        ))
        .fetch_all(&self.pool)
        .await?;
        rows.iter()
            .map(|row| -> Result<_> { Ok((table_identifier(row)?, task_runtime_from_row(row)?)) })
            .collect()
    }

    async fn insert_task_items(&self, items: &[OptimizeTaskItem]) -> Result<()> {
        if items.is_empty() {
            return Ok(());
        }
        let mut tx = self.pool.begin().await?;
        for item in items {
            let task = &item.task;
            let table = &task.table_identifier;
            sqlx::query(
                r#"INSERT INTO optimize_task (
                    process_id, task_seq, catalog_name, db_name, table_name, queue_id,
                    optimize_type, partition_key, base_files, insert_files, eq_delete_files,
                    pos_delete_files, from_sequence, to_sequence, max_execute_time,
                    custom_output_location, create_time
                ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)"#,
            )
            .bind(task.task_id.process_id)
            .bind(task.task_id.task_seq)
            .bind(table.catalog.as_str())
            .bind(table.database.as_str())
            .bind(table.table.as_str())
            .bind(task.queue_id)
            .bind(task.optimize_type.as_str())
            .bind(task.partition.as_str())
            .bind(encode_files(&task.files.base_files)?)
            .bind(encode_files(&task.files.insert_files)?)
            .bind(encode_files(&task.files.eq_delete_files)?)
            .bind(encode_files(&task.files.pos_delete_files)?)
            .bind(task.from_sequence)
            .bind(task.to_sequence)
            .bind(task.max_execute_time)
            .bind(task.custom_output_location.as_deref())
            .bind(task.create_time)
            .execute(&mut *tx)
            .await?;

            bind_task_runtime(sqlx::query(UPSERT_TASK_RUNTIME), table, &item.runtime)
                .execute(&mut *tx)
                .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    async fn upsert_task_runtime(
        &self,
        table: &TableIdentifier,
        runtime: &TaskRuntime,
    ) -> Result<()> {
        bind_task_runtime(sqlx::query(UPSERT_TASK_RUNTIME), table, runtime)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn delete_process_tasks(
        &self,
        table: &TableIdentifier,
        process_id: i64,
    ) -> Result<usize> {
        let mut tx = self.pool.begin().await?;
        let mut deleted = 0;
        for statement in [
            format!("DELETE FROM optimize_task WHERE {TABLE_FILTER} AND process_id = ?"),
            format!("DELETE FROM optimize_task_runtime WHERE {TABLE_FILTER} AND process_id = ?"),
        ] {
            let result = sqlx::query(&statement)
                .bind(table.catalog.as_str())
                .bind(table.database.as_str())
                .bind(table.table.as_str())
                .bind(process_id)
                .execute(&mut *tx)
                .await?;
            deleted = deleted.max(result.rows_affected() as usize);
        }
        tx.commit().await?;
        Ok(deleted)
    }

    async fn delete_table_tasks(&self, table: &TableIdentifier) -> Result<usize> {
        let mut tx = self.pool.begin().await?;
        let mut deleted = 0;
        for statement in [
            format!("DELETE FROM optimize_task WHERE {TABLE_FILTER}"),
            format!("DELETE FROM optimize_task_runtime WHERE {TABLE_FILTER}"),
        ] {
            let result = sqlx::query(&statement)
                .bind(table.catalog.as_str())
                .bind(table.database.as_str())
                .bind(table.table.as_str())
                .execute(&mut *tx)
                .await?;
            deleted = deleted.max(result.rows_affected() as usize);
        }
        tx.commit().await?;
        Ok(deleted)
    }

    async fn select_table_runtimes(&self) -> Result<Vec<TableOptimizeRuntime>> {
        let rows = sqlx::query(
            "SELECT * FROM optimize_table_runtime ORDER BY catalog_name, db_name, table_name",
        )
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(table_runtime_from_row).collect()
    }

    async fn select_table_runtime(
        &self,
        table: &TableIdentifier,
    ) -> Result<Option<TableOptimizeRuntime>> {
        let row = sqlx::query(&format!(
            "SELECT * FROM optimize_table_runtime WHERE {TABLE_FILTER}"
        ))
        .bind(table.catalog.as_str())
        .bind(table.database.as_str())
        .bind(table.table.as_str())
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(table_runtime_from_row).transpose()
    }

    async fn upsert_table_runtime(&self, runtime: &TableOptimizeRuntime) -> Result<()> {
        let table = &runtime.table_identifier;
        sqlx::query(
            r#"INSERT INTO optimize_table_runtime (
                catalog_name, db_name, table_name, optimize_status, optimize_status_start_time,
                group_name, queue_id, current_snapshot_id, latest_process_id, pending_files,
                pending_bytes, pending_eq_delete_files
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT (catalog_name, db_name, table_name) DO UPDATE SET
                optimize_status = excluded.optimize_status,
                optimize_status_start_time = excluded.optimize_status_start_time,
                group_name = excluded.group_name,
                queue_id = excluded.queue_id,
                current_snapshot_id = excluded.current_snapshot_id,
                latest_process_id = excluded.latest_process_id,
                pending_files = excluded.pending_files,
                pending_bytes = excluded.pending_bytes,
                pending_eq_delete_files = excluded.pending_eq_delete_files"#,
        )
        .bind(table.catalog.as_str())
        .bind(table.database.as_str())
        .bind(table.table.as_str())
        .bind(runtime.optimize_status.as_str())
        .bind(runtime.optimize_status_start_time)
        .bind(runtime.group_name.as_str())
        .bind(runtime.queue_id)
        .bind(runtime.current_snapshot_id)
        .bind(runtime.latest_process_id)
        .bind(runtime.pending_files)
        .bind(runtime.pending_bytes)
        .bind(runtime.pending_eq_delete_files)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn delete_table_runtime(&self, table: &TableIdentifier) -> Result<bool> {
        let result = sqlx::query(&format!(
            "DELETE FROM optimize_table_runtime WHERE {TABLE_FILTER}"
        ))
        .bind(table.catalog.as_str())
        .bind(table.database.as_str())
        .bind(table.table.as_str())
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn insert_history(&self, history: &OptimizeHistory) -> Result<i64> {
        let table = &history.table_identifier;
        let result = sqlx::query(
            r#"INSERT INTO optimize_history (
                catalog_name, db_name, table_name, process_id, optimize_type, start_time,
                end_time, input_file_count, input_bytes, output_file_count, output_bytes,
                commit_time
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)"#,
        )
        .bind(table.catalog.as_str())
        .bind(table.database.as_str())
        .bind(table.table.as_str())
        .bind(history.process_id)
        .bind(history.optimize_type.as_str())
        .bind(history.start_time)
        .bind(history.end_time)
        .bind(history.input_file_count)
        .bind(history.input_bytes)
        .bind(history.output_file_count)
        .bind(history.output_bytes)
        .bind(history.commit_time)
        .execute(&self.pool)
        .await?;
        Ok(result.last_insert_rowid())
    }

    async fn select_history(&self, table: &TableIdentifier) -> Result<Vec<OptimizeHistory>> {
        let rows = sqlx::query(&format!(
            "SELECT * FROM optimize_history WHERE {TABLE_FILTER} ORDER BY history_id"
        ))
        .bind(table.catalog.as_str())
        .bind(table.database.as_str())
        .bind(table.table.as_str())
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(history_from_row).collect()
    }

    async fn max_history_id(&self) -> Result<i64> {
        let row = sqlx::query("SELECT MAX(history_id) AS max_id FROM optimize_history")
            .fetch_one(&self.pool)
            .await?;
        Ok(row.try_get::<Option<i64>, _>("max_id")?.unwrap_or_default())
    }

    async fn delete_history(&self, table: &TableIdentifier) -> Result<usize> {
        let result = sqlx::query(&format!("DELETE FROM optimize_history WHERE {TABLE_FILTER}"))
            .bind(table.catalog.as_str())
            .bind(table.database.as_str())
            .bind(table.table.as_str())
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() as usize)
    }

    async fn expire_history(&self, table: &TableIdentifier, expire_time: i64) -> Result<usize> {
        let result = sqlx::query(&format!(
            "DELETE FROM optimize_history WHERE {TABLE_FILTER} AND commit_time < ?"
        ))
        .bind(table.catalog.as_str())
        .bind(table.database.as_str())
        .bind(table.table.as_str())
        .bind(expire_time)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() as usize)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::FileContent;
    use crate::common::{OptimizeStatus, OptimizeType, TaskStatus};
    use crate::plan::TaskDescriptor;

    fn table() -> TableIdentifier {
        TableIdentifier::new("iceberg", "sales", "orders")
    }

    fn task_item(process_id: i64, seq: i32) -> OptimizeTaskItem {
        task_item_of(table(), process_id, seq)
    }

    fn task_item_of(table: TableIdentifier, process_id: i64, seq: i32) -> OptimizeTaskItem {
        let task_id = OptimizeTaskId::new(process_id, seq);
        let files = TaskFiles {
            base_files: vec![ContentFile {
                path: format!("s3://bucket/{process_id}-{seq}.parquet"),
                content: FileContent::Data,
                partition: "p=1".to_owned(),
                file_size_in_bytes: 10,
                record_count: 2,
            }],
            ..Default::default()
        };
        let task = OptimizeTask::from_descriptor(
            task_id,
            table,
            1,
            OptimizeType::Major,
            TaskDescriptor::new("p=1", files, Some(3), Some(7), 0)
                .with_max_execute_time(Some(60_000)),
            42,
        );
        OptimizeTaskItem::new(task, TaskRuntime::new(task_id, 100 + seq as i64))
    }

    #[tokio::test]
    async fn test_task_rows_load_back() {
        let store = SqlOptimizeStore::in_memory().await.unwrap();
        let items = vec![task_item(5, 1), task_item(5, 2)];
        store.insert_task_items(&items).await.unwrap();

        let loaded = store.load_tasks().await.unwrap();
        assert_eq!(loaded.len(), 2);
        assert_eq!(loaded[0].task, items[0].task);
        assert_eq!(loaded[1].runtime.as_ref(), Some(&items[1].runtime));

        let mut runtime = items[0].runtime.clone();
        runtime.transition(TaskStatus::Scheduled).unwrap();
        runtime.fail("worker lost").unwrap();
        store.upsert_task_runtime(&table(), &runtime).await.unwrap();
        let runtimes = store.select_all_task_runtimes().await.unwrap();
        assert_eq!(runtimes[0].0, table());
        assert_eq!(runtimes[0].1.status, TaskStatus::Failed);
        assert_eq!(runtimes[0].1.fail_reason.as_deref(), Some("worker lost"));

        assert_eq!(store.delete_process_tasks(&table(), 5).await.unwrap(), 2);
        assert!(store.load_tasks().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_same_process_id_in_two_tables() {
        let store = SqlOptimizeStore::in_memory().await.unwrap();
        let other = TableIdentifier::new("iceberg", "sales", "returns");
        store.insert_task_items(&[task_item(8, 1)]).await.unwrap();
        store
            .insert_task_items(&[task_item_of(other.clone(), 8, 1)])
            .await
            .unwrap();

        let mut runtime = task_item(8, 1).runtime;
        runtime.transition(TaskStatus::Scheduled).unwrap();
        store.upsert_task_runtime(&table(), &runtime).await.unwrap();

        let loaded = store.load_tasks().await.unwrap();
        assert_eq!(loaded.len(), 2);
        for persisted in &loaded {
            let status = persisted.runtime.as_ref().unwrap().status;
            if persisted.task.table_identifier == table() {
                assert_eq!(status, TaskStatus::Scheduled);
            } else {
                assert_eq!(status, TaskStatus::Pending);
            }
        }

        assert_eq!(store.delete_process_tasks(&other, 8).await.unwrap(), 1);
        let loaded = store.load_tasks().await.unwrap();
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].task.table_identifier, table());
        assert!(loaded[0].runtime.is_some());
    }

    #[tokio::test]
    async fn test_null_file_lists_load_as_empty() {
        let store = SqlOptimizeStore::in_memory().await.unwrap();
        store.insert_task_items(&[task_item(9, 1)]).await.unwrap();
        sqlx::query(
            "UPDATE optimize_task SET insert_files = NULL, eq_delete_files = NULL, pos_delete_files = ''",
        )
        .execute(store.pool())
        .await
        .unwrap();

        let tasks = store.select_all_tasks().await.unwrap();
        assert_eq!(tasks[0].files.base_files.len(), 1);
        assert!(tasks[0].files.insert_files.is_empty());
        assert!(tasks[0].files.eq_delete_files.is_empty());
        assert!(tasks[0].files.pos_delete_files.is_empty());
    }

    #[tokio::test]
    async fn test_missing_runtime_row_is_visible() {
        let store = SqlOptimizeStore::in_memory().await.unwrap();
        store.insert_task_items(&[task_item(3, 1)]).await.unwrap();
        sqlx::query("DELETE FROM optimize_task_runtime")
            .execute(store.pool())
            .await
            .unwrap();
        let loaded = store.load_tasks().await.unwrap();
        assert_eq!(loaded.len(), 1);
        assert!(loaded[0].runtime.is_none());
    }

    #[tokio::test]
    async fn test_table_runtime_upsert() {
        let store = SqlOptimizeStore::in_memory().await.unwrap();
        let mut runtime = TableOptimizeRuntime::new(table(), "default", 1);
        runtime.queue_id = Some(1);
        store.upsert_table_runtime(&runtime).await.unwrap();

        runtime.optimize_status = OptimizeStatus::MinorOptimizing;
        runtime.latest_process_id = Some(12);
        store.upsert_table_runtime(&runtime).await.unwrap();

        assert_eq!(store.select_table_runtimes().await.unwrap(), vec![runtime.clone()]);
        assert_eq!(
            store.select_table_runtime(&table()).await.unwrap(),
            Some(runtime)
        );
        assert!(store.delete_table_runtime(&table()).await.unwrap());
        assert!(!store.delete_table_runtime(&table()).await.unwrap());
    }

    #[tokio::test]
    async fn test_history_ids_and_expiry() {
        let store = SqlOptimizeStore::in_memory().await.unwrap();
        assert_eq!(store.max_history_id().await.unwrap(), 0);
        let history = |commit_time| OptimizeHistory {
            history_id: 0,
            table_identifier: table(),
            process_id: 1,
            optimize_type: OptimizeType::Minor,
            start_time: 0,
            end_time: commit_time,
            input_file_count: 4,
            input_bytes: 400,
            output_file_count: 1,
            output_bytes: 380,
            commit_time,
        };
        let first = store.insert_history(&history(10)).await.unwrap();
        let second = store.insert_history(&history(20)).await.unwrap();
        assert!(second > first);
        assert_eq!(store.max_history_id().await.unwrap(), second);

        assert_eq!(store.expire_history(&table(), 15).await.unwrap(), 1);
        let left = store.select_history(&table()).await.unwrap();
        assert_eq!(left.len(), 1);
        assert_eq!(left[0].history_id, second);
        assert_eq!(store.delete_history(&table()).await.unwrap(), 1);
    }
}
