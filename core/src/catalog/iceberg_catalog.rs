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

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use futures::StreamExt;
use futures::stream::BoxStream;
use iceberg::spec::{
    DataContentType, FormatVersion, Literal, PrimitiveLiteral, Struct, TableMetadata,
};
use iceberg::table::Table;
use iceberg::{Catalog, NamespaceIdent, TableIdent};
use itertools::Itertools;

use super::{ContentFile, ContentFileEntry, FileContent, OptimizingTable, TableCatalog};
use crate::common::TableIdentifier;
use crate::{OptimizeError, Result};

/// Adapts an iceberg [`Catalog`] to the optimizer's catalog model.
///
/// Nested namespaces are flattened into the `database` part of the
/// identifier, joined by `.`. Iceberg catalogs keep optimizing properties on
/// the table itself, so they are always lightweight.
pub struct IcebergTableCatalog {
    name: String,
    catalog: Arc<dyn Catalog>,
}

impl IcebergTableCatalog {
    pub fn new(name: impl Into<String>, catalog: Arc<dyn Catalog>) -> Self {
        Self {
            name: name.into(),
            catalog,
        }
    }

    async fn list_namespaces_recursive(&self) -> Result<Vec<NamespaceIdent>> {
        let mut pending = self.catalog.list_namespaces(None).await?;
        let mut namespaces = vec![];
        while let Some(namespace) = pending.pop() {
            let children = self.catalog.list_namespaces(Some(&namespace)).await?;
            pending.extend(children.into_iter().filter(|child| child != &namespace));
            namespaces.push(namespace);
        }
        Ok(namespaces)
    }
}

#[async_trait]
impl TableCatalog for IcebergTableCatalog {
    fn name(&self) -> &str {
        &self.name
    }

    fn is_lightweight(&self) -> bool {
        true
    }

    async fn list_tables(&self) -> Result<Vec<TableIdentifier>> {
        let mut tables = vec![];
        for namespace in self.list_namespaces_recursive().await? {
            for ident in self.catalog.list_tables(&namespace).await? {
                tables.push(table_identifier(&self.name, &ident));
            }
        }
        Ok(tables)
    }

    async fn load_table(&self, table: &TableIdentifier) -> Result<Arc<dyn OptimizingTable>> {
        let ident = table_ident(table)?;
        let loaded = self.catalog.load_table(&ident).await?;
        Ok(Arc::new(IcebergOptimizingTable::new(table.clone(), loaded)))
    }
}

fn table_ident(table: &TableIdentifier) -> Result<TableIdent> {
    let namespace = NamespaceIdent::from_strs(table.database.split('.'))?;
    Ok(TableIdent::new(namespace, table.table.clone()))
}

fn table_identifier(catalog: &str, ident: &TableIdent) -> TableIdentifier {
    TableIdentifier::new(
        catalog,
        ident.namespace().clone().inner().join("."),
        ident.name(),
    )
}

pub struct IcebergOptimizingTable {
    identifier: TableIdentifier,
    properties: HashMap<String, String>,
    table: Table,
}

impl IcebergOptimizingTable {
    pub fn new(identifier: TableIdentifier, table: Table) -> Self {
        let properties = table.metadata().properties().clone();
        Self {
            identifier,
            properties,
            table,
        }
    }
}

#[async_trait]
impl OptimizingTable for IcebergOptimizingTable {
    fn identifier(&self) -> &TableIdentifier {
        &self.identifier
    }

    fn properties(&self) -> &HashMap<String, String> {
        &self.properties
    }

    fn current_snapshot_id(&self) -> Option<i64> {
        self.table.metadata().current_snapshot_id()
    }

    fn format_version(&self) -> u8 {
        if self.table.metadata().format_version() == FormatVersion::V1 {
            1
        } else {
            2
        }
    }

    fn scan_entries(&self, snapshot_id: i64) -> BoxStream<'_, Result<ContentFileEntry>> {
        async_stream::try_stream! {
            let metadata = self.table.metadata();
            let snapshot = metadata.snapshot_by_id(snapshot_id).ok_or_else(|| {
                OptimizeError::NotFound(format!(
                    "snapshot {} of table {}",
                    snapshot_id, self.identifier
                ))
            })?;
            let manifest_list = snapshot
                .load_manifest_list(self.table.file_io(), metadata)
                .await?;

            let mut scanned = 0usize;
            for manifest_file in manifest_list.entries() {
                let field_names = partition_field_names(metadata, manifest_file.partition_spec_id);
                let manifest = manifest_file.load_manifest(self.table.file_io()).await?;
                let (manifest_entries, _) = manifest.into_parts();
                for entry in manifest_entries {
                    if !entry.is_alive() {
                        continue;
                    }
                    let content = match entry.content_type() {
                        DataContentType::Data => FileContent::Data,
                        DataContentType::PositionDeletes => FileContent::PositionDeletes,
                        DataContentType::EqualityDeletes => FileContent::EqualityDeletes,
                    };
                    let data_file = entry.data_file();
                    scanned += 1;
                    yield ContentFileEntry {
                        file: ContentFile {
                            path: entry.file_path().to_owned(),
                            content,
                            partition: partition_key(&field_names, data_file.partition()),
                            file_size_in_bytes: data_file.file_size_in_bytes(),
                            record_count: data_file.record_count(),
                        },
                        sequence_number: entry.sequence_number().unwrap_or_default(),
                        snapshot_id: entry.snapshot_id().unwrap_or(snapshot_id),
                    };
                }
            }
            tracing::debug!(
                "scanned {} alive entries of table {} at snapshot {}",
                scanned,
                self.identifier,
                snapshot_id
            );
        }
        .boxed()
    }
}

fn partition_field_names(metadata: &TableMetadata, spec_id: i32) -> Vec<String> {
    metadata
        .partition_spec_by_id(spec_id)
        .map(|spec| spec.fields().iter().map(|field| field.name.clone()).collect())
        .unwrap_or_default()
}

/// Renders partition values as `name=value` segments joined by `/`, in spec
/// field order. An unpartitioned file renders as the empty string.
fn partition_key(field_names: &[String], partition: &Struct) -> String {
    partition
        .iter()
        .enumerate()
        .map(|(position, value)| {
            let name = field_names
                .get(position)
                .cloned()
                .unwrap_or_else(|| position.to_string());
            let value = value.map_or_else(|| "null".to_owned(), render_literal);
            format!("{name}={value}")
        })
        .join("/")
}

fn render_literal(literal: &Literal) -> String {
    match literal {
        Literal::Primitive(PrimitiveLiteral::Boolean(v)) => v.to_string(),
        Literal::Primitive(PrimitiveLiteral::Int(v)) => v.to_string(),
        Literal::Primitive(PrimitiveLiteral::Long(v)) => v.to_string(),
        Literal::Primitive(PrimitiveLiteral::Float(v)) => v.to_string(),
        Literal::Primitive(PrimitiveLiteral::Double(v)) => v.to_string(),
        Literal::Primitive(PrimitiveLiteral::String(v)) => v.clone(),
        Literal::Primitive(PrimitiveLiteral::Binary(v)) => {
            v.iter().map(|b| format!("{b:02x}")).collect()
        }
        // Decimals and nested values have no plain rendering.
        other => format!("{other:?}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_nested_namespace_round_trips_through_database() {
        let table = TableIdentifier::new("ice", "sales.eu", "orders");
        let ident = table_ident(&table).unwrap();
        assert_eq!(
            ident.namespace(),
            &NamespaceIdent::from_strs(["sales", "eu"]).unwrap()
        );
        assert_eq!(ident.name(), "orders");
        assert_eq!(table_identifier("ice", &ident), table);
    }

    #[test]
    fn test_partition_key_renders_values_by_field() {
        let names = vec!["region".to_owned(), "bucket".to_owned()];
        let partition = Struct::from_iter([
            Some(Literal::Primitive(PrimitiveLiteral::String("eu".to_owned()))),
            Some(Literal::Primitive(PrimitiveLiteral::Int(7))),
        ]);
        assert_eq!(partition_key(&names, &partition), "region=eu/bucket=7");

        let partition = Struct::from_iter([None, Some(Literal::Primitive(PrimitiveLiteral::Long(3)))]);
        assert_eq!(partition_key(&names[..1], &partition), "region=null/1=3");

        assert_eq!(partition_key(&names, &Struct::empty()), "");
    }
}
