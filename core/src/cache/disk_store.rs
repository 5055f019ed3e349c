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

//! SQLite file used as the overflow area of a [`super::SpillableCache`].

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use backon::{ExponentialBuilder, Retryable};
use futures::stream::BoxStream;
use futures::{StreamExt, TryStreamExt};
use sqlx::Row;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions};
use tempfile::TempDir;
use tokio::sync::RwLock;

use crate::{OptimizeError, Result};

const DB_FILE_NAME: &str = "spill.db";

/// One opened spill database living in its own private temp directory.
///
/// The directory is removed when the last handle is dropped.
pub struct DiskStore {
    pool: SqlitePool,
    dir: TempDir,
}

impl DiskStore {
    async fn open(base_dir: Option<&Path>, prefix: &str) -> Result<Self> {
        let mut builder = tempfile::Builder::new();
        builder.prefix(prefix);
        let dir = match base_dir {
            Some(base_dir) => {
                std::fs::create_dir_all(base_dir)?;
                builder.tempdir_in(base_dir)?
            }
            None => builder.tempdir()?,
        };

        let options = SqliteConnectOptions::new()
            .filename(dir.path().join(DB_FILE_NAME))
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal);
        let pool = SqlitePoolOptions::new()
            .max_connections(4)
            .connect_with(options)
            .await?;
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS spill_entries (k TEXT PRIMARY KEY NOT NULL, v BLOB NOT NULL)",
        )
        .execute(&pool)
        .await?;

        tracing::debug!("opened spill store at {}", dir.path().display());
        Ok(Self { pool, dir })
    }

    pub fn path(&self) -> &Path {
        self.dir.path()
    }

    pub async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let row = sqlx::query("SELECT v FROM spill_entries WHERE k = ?")
            .bind(key)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(|row| row.try_get::<Vec<u8>, _>("v")).transpose()?)
    }

    /// Writes the whole batch in one transaction. A failed attempt rolls back
    /// and the batch is retried as a unit.
    pub async fn put_batch(&self, batch: &[(String, Vec<u8>)]) -> Result<()> {
        if batch.is_empty() {
            return Ok(());
        }
        let write = || async {
            let mut tx = self.pool.begin().await?;
            for (key, value) in batch {
                sqlx::query(
                    "INSERT INTO spill_entries (k, v) VALUES (?, ?) \
                     ON CONFLICT(k) DO UPDATE SET v = excluded.v",
                )
                .bind(key.as_str())
                .bind(value.as_slice())
                .execute(&mut *tx)
                .await?;
            }
            tx.commit().await?;
            Ok::<(), OptimizeError>(())
        };

        let retry_strategy = ExponentialBuilder::default()
            .with_min_delay(Duration::from_millis(10))
            .with_max_delay(Duration::from_millis(500))
            .with_max_times(3);

        write
            .retry(retry_strategy)
            .when(|e: &OptimizeError| e.is_transient())
            .notify(|e: &OptimizeError, dur: Duration| {
                tracing::warn!("spill batch write failed, retry in {:?}: {}", dur, e);
            })
            .await
    }

    pub async fn delete(&self, key: &str) -> Result<bool> {
        let result = sqlx::query("DELETE FROM spill_entries WHERE k = ?")
            .bind(key)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Streams every stored value without loading the table into memory.
    pub fn value_stream(self: Arc<Self>) -> BoxStream<'static, Result<Vec<u8>>> {
        async_stream::try_stream! {
            let mut rows = sqlx::query("SELECT v FROM spill_entries ORDER BY k").fetch(&self.pool);
            while let Some(row) = rows.try_next().await? {
                let value: Vec<u8> = row.try_get("v")?;
                yield value;
            }
        }
        .boxed()
    }

    pub fn size_on_disk(&self) -> u64 {
        std::fs::read_dir(self.dir.path())
            .map(|entries| {
                entries
                    .filter_map(|entry| entry.ok()?.metadata().ok())
                    .map(|metadata| metadata.len())
                    .sum()
            })
            .unwrap_or_default()
    }

    async fn close(&self) {
        self.pool.close().await;
    }
}

/// Opens the spill database on first use and reopens it after [`release`].
///
/// [`release`]: LazyDiskStore::release
pub struct LazyDiskStore {
    base_dir: Option<PathBuf>,
    prefix: String,
    store: RwLock<Option<Arc<DiskStore>>>,
    opened: AtomicUsize,
}

impl LazyDiskStore {
    pub fn new(base_dir: Option<PathBuf>, prefix: impl Into<String>) -> Self {
        Self {
            base_dir,
            prefix: prefix.into(),
            store: RwLock::new(None),
            opened: AtomicUsize::new(0),
        }
    }

    /// Returns the open store, creating it if needed. Concurrent first calls
    /// create exactly one store.
    pub async fn acquire(&self) -> Result<Arc<DiskStore>> {
        if let Some(store) = self.store.read().await.as_ref() {
            return Ok(store.clone());
        }

        let mut guard = self.store.write().await;
        if let Some(store) = guard.as_ref() {
            return Ok(store.clone());
        }
        let store = Arc::new(DiskStore::open(self.base_dir.as_deref(), &self.prefix).await?);
        self.opened.fetch_add(1, Ordering::Relaxed);
        *guard = Some(store.clone());
        Ok(store)
    }

    /// Returns the store only if it is already open.
    pub async fn current(&self) -> Option<Arc<DiskStore>> {
        self.store.read().await.clone()
    }

    /// Closes the store. Its directory goes away once in-flight readers drop
    /// their handles.
    pub async fn release(&self) {
        let store = self.store.write().await.take();
        if let Some(store) = store {
            store.close().await;
            tracing::debug!("released spill store at {}", store.path().display());
        }
    }

    /// Number of stores opened over the lifetime of this handle.
    pub fn open_count(&self) -> usize {
        self.opened.load(Ordering::Relaxed)
    }
}
