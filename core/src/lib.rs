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

pub mod cache;
pub mod catalog;
pub mod common;
pub mod config;
pub mod error;
pub mod optimizing;
pub mod plan;
pub mod queue;
pub mod service;
pub mod store;
pub mod test_utils;

pub use catalog::{CatalogManager, OptimizingTable, TableCatalog};
pub use common::TableIdentifier;
pub use config::{OptimizeServiceConfig, OptimizingConfig};
pub use error::{OptimizeError, Result};
pub use optimizing::{OptimizingProcessIterator, TableOptimizingProcess};
pub use queue::{OptimizeQueue, OptimizeQueueService};
pub use service::{OptimizeService, ProcessCommitter, TableOptimizeItem};
pub use store::{OptimizeStore, SqlOptimizeStore};

// Re-export iceberg related crates
pub use iceberg;
