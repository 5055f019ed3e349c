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

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, PoisonError, RwLock};

use async_trait::async_trait;
use futures::StreamExt;
use futures::stream::{self, BoxStream};

use crate::catalog::{
    ContentFile, ContentFileEntry, FileContent, MetaService, OptimizingTable, TableCatalog,
    TableMetadata,
};
use crate::common::TableIdentifier;
use crate::{OptimizeError, Result};

/// Table held entirely in memory. Snapshots are committed through `&self`
/// so tests can advance a table already handed to a catalog.
pub struct MemoryTable {
    identifier: TableIdentifier,
    properties: HashMap<String, String>,
    format_version: u8,
    snapshots: RwLock<BTreeMap<i64, Vec<ContentFileEntry>>>,
    current_snapshot_id: RwLock<Option<i64>>,
    scans: AtomicUsize,
}

impl MemoryTable {
    pub fn new(identifier: TableIdentifier) -> Self {
        Self {
            identifier,
            properties: HashMap::new(),
            format_version: 2,
            snapshots: RwLock::new(BTreeMap::new()),
            current_snapshot_id: RwLock::new(None),
            scans: AtomicUsize::new(0),
        }
    }

    pub fn with_property(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.properties.insert(key.into(), value.into());
        self
    }

    pub fn with_format_version(mut self, format_version: u8) -> Self {
        self.format_version = format_version;
        self
    }

    pub fn entry(
        path: &str,
        content: FileContent,
        partition: &str,
        file_size_in_bytes: u64,
        sequence_number: i64,
    ) -> ContentFileEntry {
        ContentFileEntry {
            file: ContentFile {
                path: path.to_owned(),
                content,
                partition: partition.to_owned(),
                file_size_in_bytes,
                record_count: 1,
            },
            sequence_number,
            snapshot_id: 0,
        }
    }

    /// Makes `entries` the alive files of a new current snapshot.
    pub fn commit_snapshot(&self, snapshot_id: i64, entries: Vec<ContentFileEntry>) {
        let entries = entries
            .into_iter()
            .map(|mut entry| {
                entry.snapshot_id = snapshot_id;
                entry
            })
            .collect();
        self.snapshots
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(snapshot_id, entries);
        *self
            .current_snapshot_id
            .write()
            .unwrap_or_else(PoisonError::into_inner) = Some(snapshot_id);
    }

    pub fn scan_count(&self) -> usize {
        self.scans.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl OptimizingTable for MemoryTable {
    fn identifier(&self) -> &TableIdentifier {
        &self.identifier
    }

    fn properties(&self) -> &HashMap<String, String> {
        &self.properties
    }

    fn current_snapshot_id(&self) -> Option<i64> {
        *self
            .current_snapshot_id
            .read()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn format_version(&self) -> u8 {
        self.format_version
    }

    fn scan_entries(&self, snapshot_id: i64) -> BoxStream<'_, Result<ContentFileEntry>> {
        self.scans.fetch_add(1, Ordering::SeqCst);
        let entries = self
            .snapshots
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&snapshot_id)
            .cloned();
        match entries {
            Some(entries) => stream::iter(entries.into_iter().map(Ok)).boxed(),
            None => {
                let err =
                    OptimizeError::NotFound(format!("snapshot {} of {}", snapshot_id, self.identifier));
                stream::once(async move { Err(err) }).boxed()
            }
        }
    }
}

pub struct MemoryCatalog {
    name: String,
    lightweight: bool,
    tables: RwLock<BTreeMap<TableIdentifier, Arc<MemoryTable>>>,
    fail_listing: AtomicBool,
}

impl MemoryCatalog {
    pub fn new(name: impl Into<String>, lightweight: bool) -> Self {
        Self {
            name: name.into(),
            lightweight,
            tables: RwLock::new(BTreeMap::new()),
            fail_listing: AtomicBool::new(false),
        }
    }

    pub fn add_table(&self, table: MemoryTable) -> Arc<MemoryTable> {
        let table = Arc::new(table);
        self.tables
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(table.identifier.clone(), table.clone());
        table
    }

    pub fn remove_table(&self, identifier: &TableIdentifier) -> Option<Arc<MemoryTable>> {
        self.tables
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(identifier)
    }

    pub fn table(&self, identifier: &TableIdentifier) -> Option<Arc<MemoryTable>> {
        self.tables
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(identifier)
            .cloned()
    }

    /// Makes `list_tables` fail until reset.
    pub fn set_fail_listing(&self, fail: bool) {
        self.fail_listing.store(fail, Ordering::SeqCst);
    }
}

#[async_trait]
impl TableCatalog for MemoryCatalog {
    fn name(&self) -> &str {
        &self.name
    }

    fn is_lightweight(&self) -> bool {
        self.lightweight
    }

    async fn list_tables(&self) -> Result<Vec<TableIdentifier>> {
        if self.fail_listing.load(Ordering::SeqCst) {
            return Err(OptimizeError::Execution(format!(
                "catalog {} is unavailable",
                self.name
            )));
        }
        Ok(self
            .tables
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect())
    }

    async fn load_table(&self, table: &TableIdentifier) -> Result<Arc<dyn OptimizingTable>> {
        let loaded = self
            .table(table)
            .ok_or_else(|| OptimizeError::NotFound(format!("table {table}")))?;
        Ok(loaded)
    }
}

#[derive(Default)]
pub struct MemoryMetaService {
    metadata: RwLock<HashMap<TableIdentifier, HashMap<String, String>>>,
}

impl MemoryMetaService {
    pub fn put(&self, table: TableIdentifier, properties: HashMap<String, String>) {
        self.metadata
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(table, properties);
    }
}

#[async_trait]
impl MetaService for MemoryMetaService {
    async fn load_table_metadata(&self, table: &TableIdentifier) -> Result<TableMetadata> {
        let properties = self
            .metadata
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(table)
            .cloned()
            .ok_or_else(|| OptimizeError::NotFound(format!("metadata of table {table}")))?;
        Ok(TableMetadata::new(table.clone(), properties))
    }
}
