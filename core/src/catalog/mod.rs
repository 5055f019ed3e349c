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

//! Table-format collaborator seen by the optimizer.
//!
//! The optimizer never touches manifests directly. It lists tables through a
//! [`TableCatalog`], loads an [`OptimizingTable`] for properties and
//! content-file entries, and, for catalogs whose property model is not the
//! lightweight one, reads table metadata through a [`MetaService`].

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use async_trait::async_trait;
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};

use crate::common::TableIdentifier;
use crate::config::OptimizingConfig;
use crate::{OptimizeError, Result};

pub mod iceberg_catalog;

pub use iceberg_catalog::IcebergTableCatalog;

/// Content type of a file tracked by a snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FileContent {
    Data,
    PositionDeletes,
    EqualityDeletes,
}

/// A data or delete file tracked by a table snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContentFile {
    pub path: String,
    pub content: FileContent,
    pub partition: String,
    pub file_size_in_bytes: u64,
    pub record_count: u64,
}

/// One alive manifest entry: a content file and its data sequence number.
#[derive(Debug, Clone, PartialEq)]
pub struct ContentFileEntry {
    pub file: ContentFile,
    pub sequence_number: i64,
    pub snapshot_id: i64,
}

/// Properties of a table as the optimizer sees them.
#[derive(Debug, Clone, Default)]
pub struct TableMetadata {
    pub table_identifier: Option<TableIdentifier>,
    pub properties: HashMap<String, String>,
}

impl TableMetadata {
    pub fn new(table_identifier: TableIdentifier, properties: HashMap<String, String>) -> Self {
        Self {
            table_identifier: Some(table_identifier),
            properties,
        }
    }

    pub fn optimizing_config(&self) -> OptimizingConfig {
        OptimizingConfig::from_properties(&self.properties)
    }
}

#[async_trait]
pub trait OptimizingTable: Send + Sync {
    fn identifier(&self) -> &TableIdentifier;

    fn properties(&self) -> &HashMap<String, String>;

    fn current_snapshot_id(&self) -> Option<i64>;

    /// Format version 1 tables carry no sequence numbers.
    fn format_version(&self) -> u8;

    /// Streams every alive content-file entry of `snapshot_id`, manifest by
    /// manifest. A missing snapshot surfaces as the first item.
    fn scan_entries(&self, snapshot_id: i64) -> BoxStream<'_, Result<ContentFileEntry>>;
}

#[async_trait]
pub trait TableCatalog: Send + Sync {
    fn name(&self) -> &str;

    /// Whether table metadata is sourced directly from table properties.
    fn is_lightweight(&self) -> bool;

    async fn list_tables(&self) -> Result<Vec<TableIdentifier>>;

    async fn load_table(&self, table: &TableIdentifier) -> Result<Arc<dyn OptimizingTable>>;
}

/// Secondary metadata source for catalogs that are not lightweight.
#[async_trait]
pub trait MetaService: Send + Sync {
    async fn load_table_metadata(&self, table: &TableIdentifier) -> Result<TableMetadata>;
}

/// All catalogs the optimizer serves, keyed by catalog name.
#[derive(Clone, Default)]
pub struct CatalogManager {
    catalogs: BTreeMap<String, Arc<dyn TableCatalog>>,
    meta_service: Option<Arc<dyn MetaService>>,
}

impl CatalogManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_catalog(mut self, catalog: Arc<dyn TableCatalog>) -> Self {
        self.catalogs.insert(catalog.name().to_owned(), catalog);
        self
    }

    pub fn with_meta_service(mut self, meta_service: Arc<dyn MetaService>) -> Self {
        self.meta_service = Some(meta_service);
        self
    }

    pub fn catalog(&self, name: &str) -> Result<&Arc<dyn TableCatalog>> {
        self.catalogs
            .get(name)
            .ok_or_else(|| OptimizeError::NotFound(format!("catalog {name}")))
    }

    /// Lists the tables of every catalog. A catalog that fails to list is
    /// logged and reported as `None`, so callers can tell "no tables" apart
    /// from "unknown".
    pub async fn list_tables_by_catalog(&self) -> BTreeMap<String, Option<Vec<TableIdentifier>>> {
        let mut listed = BTreeMap::new();
        for (name, catalog) in &self.catalogs {
            let tables = match catalog.list_tables().await {
                Ok(tables) => Some(tables),
                Err(e) => {
                    tracing::error!("failed to list tables of catalog {}: {}", name, e);
                    None
                }
            };
            listed.insert(name.clone(), tables);
        }
        listed
    }

    pub async fn load_table(&self, table: &TableIdentifier) -> Result<Arc<dyn OptimizingTable>> {
        self.catalog(&table.catalog)?.load_table(table).await
    }

    /// Reads metadata from the table itself for lightweight catalogs and from
    /// the meta service otherwise.
    pub async fn build_table_metadata(
        &self,
        table: &Arc<dyn OptimizingTable>,
    ) -> Result<TableMetadata> {
        let catalog = self.catalog(&table.identifier().catalog)?;
        if catalog.is_lightweight() {
            return Ok(TableMetadata::new(
                table.identifier().clone(),
                table.properties().clone(),
            ));
        }
        let meta_service = self.meta_service.as_ref().ok_or_else(|| {
            OptimizeError::Precondition(format!(
                "catalog {} requires a meta service",
                catalog.name()
            ))
        })?;
        meta_service.load_table_metadata(table.identifier()).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{MemoryCatalog, MemoryMetaService, MemoryTable};

    #[tokio::test]
    async fn test_metadata_source_follows_catalog_kind() {
        let light_id = TableIdentifier::new("light", "db", "t");
        let heavy_id = TableIdentifier::new("heavy", "db", "t");

        let light = MemoryCatalog::new("light", true);
        light.add_table(MemoryTable::new(light_id.clone()).with_property("k", "from-table"));
        let heavy = MemoryCatalog::new("heavy", false);
        heavy.add_table(MemoryTable::new(heavy_id.clone()).with_property("k", "from-table"));

        let meta = MemoryMetaService::default();
        meta.put(
            heavy_id.clone(),
            HashMap::from([("k".to_owned(), "from-meta".to_owned())]),
        );

        let manager = CatalogManager::new()
            .with_catalog(Arc::new(light))
            .with_catalog(Arc::new(heavy))
            .with_meta_service(Arc::new(meta));

        let table = manager.load_table(&light_id).await.unwrap();
        let metadata = manager.build_table_metadata(&table).await.unwrap();
        assert_eq!(metadata.properties["k"], "from-table");

        let table = manager.load_table(&heavy_id).await.unwrap();
        let metadata = manager.build_table_metadata(&table).await.unwrap();
        assert_eq!(metadata.properties["k"], "from-meta");
    }

    #[tokio::test]
    async fn test_failed_listing_is_reported_per_catalog() {
        let ok = MemoryCatalog::new("ok", true);
        ok.add_table(MemoryTable::new(TableIdentifier::new("ok", "db", "t")));
        let broken = MemoryCatalog::new("broken", true);
        broken.set_fail_listing(true);

        let manager = CatalogManager::new()
            .with_catalog(Arc::new(ok))
            .with_catalog(Arc::new(broken));
        let listed = manager.list_tables_by_catalog().await;
        assert_eq!(listed["ok"].as_ref().map(Vec::len), Some(1));
        assert!(listed["broken"].is_none());
    }

    #[tokio::test]
    async fn test_unknown_catalog_is_not_found() {
        let manager = CatalogManager::new();
        let result = manager
            .load_table(&TableIdentifier::new("missing", "db", "t"))
            .await;
        assert!(matches!(result, Err(OptimizeError::NotFound(_))));
    }
}
