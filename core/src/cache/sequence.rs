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

use std::sync::Arc;

use futures::{Stream, StreamExt};
use tokio::sync::Mutex;

use super::size_estimator::FixedSizeEstimator;
use super::spillable::{SpillableCache, SpillableCacheOptions};
use crate::catalog::{ContentFileEntry, OptimizingTable};
use crate::{OptimizeError, Result};

/// Inline i64 plus hash map slot overhead.
const SEQUENCE_ENTRY_BYTES: u64 = 32;

/// Resolves the data sequence number of a file path within one snapshot.
///
/// The alive entries of the snapshot are scanned once, on the first lookup,
/// into a [`SpillableCache`], unless a caller that already streams the
/// snapshot hands its entries over through [`index`](Self::index). Format
/// version 1 tables have no sequence numbers and always resolve to `0`
/// without scanning.
pub struct SequenceNumberFetcher {
    table: Arc<dyn OptimizingTable>,
    snapshot_id: i64,
    options: SpillableCacheOptions,
    cache: Mutex<Option<Arc<SpillableCache<i64>>>>,
}

impl SequenceNumberFetcher {
    pub fn new(
        table: Arc<dyn OptimizingTable>,
        snapshot_id: i64,
        options: SpillableCacheOptions,
    ) -> Self {
        Self {
            table,
            snapshot_id,
            options,
            cache: Mutex::new(None),
        }
    }

    pub fn snapshot_id(&self) -> i64 {
        self.snapshot_id
    }

    pub async fn sequence_number(&self, path: &str) -> Result<i64> {
        if self.table.format_version() == 1 {
            return Ok(0);
        }
        let cache = self.cache().await?;
        cache.get(path).await?.ok_or_else(|| {
            OptimizeError::NotFound(format!(
                "sequence number of {} in table {} snapshot {}",
                path,
                self.table.identifier(),
                self.snapshot_id
            ))
        })
    }

    /// Drops the cached index. The next lookup scans the snapshot again.
    pub async fn close(&self) {
        if let Some(cache) = self.cache.lock().await.take() {
            cache.close().await;
        }
    }

    /// Builds the index from `entries`, replacing any previous one, and
    /// returns the number of entries indexed. Entries are written in batches
    /// of `spill_batch_size`; only their paths and sequence numbers are kept.
    pub async fn index<S>(&self, entries: S) -> Result<usize>
    where
        S: Stream<Item = Result<ContentFileEntry>> + Send,
    {
        let mut guard = self.cache.lock().await;
        if let Some(previous) = guard.take() {
            previous.close().await;
        }
        let (cache, count) = self.build(entries).await?;
        *guard = Some(cache);
        Ok(count)
    }

    async fn cache(&self) -> Result<Arc<SpillableCache<i64>>> {
        let mut guard = self.cache.lock().await;
        if let Some(cache) = guard.as_ref() {
            return Ok(cache.clone());
        }
        let (cache, _) = self.build(self.table.scan_entries(self.snapshot_id)).await?;
        *guard = Some(cache.clone());
        Ok(cache)
    }

    async fn build<S>(&self, entries: S) -> Result<(Arc<SpillableCache<i64>>, usize)>
    where
        S: Stream<Item = Result<ContentFileEntry>> + Send,
    {
        let cache = Arc::new(SpillableCache::with_estimator(
            self.options.clone(),
            Arc::new(FixedSizeEstimator::new(SEQUENCE_ENTRY_BYTES)),
        ));
        let mut count = 0;
        let mut batches = std::pin::pin!(entries.chunks(self.options.spill_batch_size.max(1)));
        while let Some(batch) = batches.next().await {
            let written = match batch
                .into_iter()
                .map(|entry| entry.map(|entry| (entry.file.path, entry.sequence_number)))
                .collect::<Result<Vec<_>>>()
            {
                Ok(batch) => {
                    count += batch.len();
                    cache.put_all(batch).await
                }
                Err(e) => Err(e),
            };
            if let Err(e) = written {
                cache.close().await;
                return Err(e);
            }
        }
        tracing::info!(
            "indexed {} file sequence numbers of table {} snapshot {}",
            count,
            self.table.identifier(),
            self.snapshot_id
        );
        Ok((cache, count))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::FileContent;
    use crate::common::TableIdentifier;
    use crate::test_utils::MemoryTable;

    fn table(format_version: u8) -> Arc<MemoryTable> {
        let table = MemoryTable::new(TableIdentifier::new("c", "db", "t"))
            .with_format_version(format_version);
        table.commit_snapshot(
            10,
            vec![
                MemoryTable::entry("s3://b/f1.parquet", FileContent::Data, "p=1", 100, 3),
                MemoryTable::entry("s3://b/f2.parquet", FileContent::EqualityDeletes, "p=1", 10, 5),
            ],
        );
        Arc::new(table)
    }

    fn options(dir: &tempfile::TempDir) -> SpillableCacheOptions {
        SpillableCacheOptions {
            max_in_memory_bytes: 40,
            spill_batch_size: 10,
            base_dir: Some(dir.path().to_path_buf()),
            name: "seq".to_owned(),
        }
    }

    #[tokio::test]
    async fn test_lookup_scans_once() {
        let dir = tempfile::tempdir().unwrap();
        let table = table(2);
        let fetcher = SequenceNumberFetcher::new(table.clone(), 10, options(&dir));

        assert_eq!(fetcher.sequence_number("s3://b/f1.parquet").await.unwrap(), 3);
        assert_eq!(fetcher.sequence_number("s3://b/f2.parquet").await.unwrap(), 5);
        assert_eq!(table.scan_count(), 1);

        fetcher.close().await;
        assert_eq!(fetcher.sequence_number("s3://b/f1.parquet").await.unwrap(), 3);
        assert_eq!(table.scan_count(), 2);
    }

    #[tokio::test]
    async fn test_index_handed_over_skips_the_scan() {
        let dir = tempfile::tempdir().unwrap();
        let table = table(2);
        let fetcher = SequenceNumberFetcher::new(table.clone(), 10, options(&dir));
        let entries: Vec<Result<ContentFileEntry>> = (0..25)
            .map(|i| {
                Ok(MemoryTable::entry(
                    &format!("s3://b/g{i}.parquet"),
                    FileContent::Data,
                    "p=1",
                    100,
                    i,
                ))
            })
            .collect();

        assert_eq!(fetcher.index(futures::stream::iter(entries)).await.unwrap(), 25);
        assert_eq!(fetcher.sequence_number("s3://b/g17.parquet").await.unwrap(), 17);
        assert_eq!(table.scan_count(), 0);
    }

    #[tokio::test]
    async fn test_failed_scan_leaves_no_index() {
        let dir = tempfile::tempdir().unwrap();
        let table = table(2);
        let fetcher = SequenceNumberFetcher::new(table.clone(), 99, options(&dir));
        let result = fetcher.sequence_number("s3://b/f1.parquet").await;
        assert!(matches!(result, Err(OptimizeError::NotFound(_))));
        // The next lookup scans again.
        assert!(fetcher.sequence_number("s3://b/f1.parquet").await.is_err());
        assert_eq!(table.scan_count(), 2);
    }

    #[tokio::test]
    async fn test_missing_path_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let fetcher = SequenceNumberFetcher::new(table(2), 10, options(&dir));
        let result = fetcher.sequence_number("s3://b/unknown.parquet").await;
        assert!(matches!(result, Err(OptimizeError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_v1_table_has_no_sequence_numbers() {
        let dir = tempfile::tempdir().unwrap();
        let table = table(1);
        let fetcher = SequenceNumberFetcher::new(table.clone(), 10, options(&dir));
        assert_eq!(fetcher.sequence_number("anything").await.unwrap(), 0);
        assert_eq!(table.scan_count(), 0);
    }
}
