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

//! Service-wide configuration and per-table optimizing settings.
//!
//! [`OptimizeServiceConfig`] is loaded once at startup (YAML or builder).
//! [`OptimizingConfig`] is resolved from each table's properties; malformed
//! values are logged and replaced by their defaults so a bad property never
//! takes a table out of scheduling.

use std::collections::HashMap;
use std::fmt::{Display, Formatter};
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use derive_builder::Builder;
use serde::Deserialize;

use crate::{OptimizeError, Result};

pub const SELF_OPTIMIZING_ENABLED: &str = "self-optimizing.enabled";
pub const SELF_OPTIMIZING_ENABLED_LEGACY: &str = "optimize.enable";
pub const SELF_OPTIMIZING_ENABLED_DEFAULT: bool = true;

pub const SELF_OPTIMIZING_GROUP: &str = "self-optimizing.group";
pub const SELF_OPTIMIZING_GROUP_LEGACY: &str = "optimize.group";
pub const SELF_OPTIMIZING_GROUP_DEFAULT: &str = "default";

pub const SELF_OPTIMIZING_TASK_ORDER: &str = "self-optimizing.task-order";
pub const SELF_OPTIMIZING_TASK_ORDER_DEFAULT: OrderStrategy = OrderStrategy::Size;

pub const SELF_OPTIMIZING_PROCESS_ORDER: &str = "self-optimizing.process-order";
pub const SELF_OPTIMIZING_PROCESS_ORDER_DEFAULT: OrderStrategy = OrderStrategy::Sequence;

pub const SELF_OPTIMIZING_PROCESS_PARTITIONED_THRESHOLD: &str =
    "self-optimizing.process.partitioned-threshold";
pub const SELF_OPTIMIZING_PROCESS_PARTITIONED_THRESHOLD_DEFAULT: usize = 100;

pub const SELF_OPTIMIZING_TARGET_SIZE: &str = "self-optimizing.target-size";
pub const SELF_OPTIMIZING_TARGET_SIZE_DEFAULT: u64 = 128 * 1024 * 1024;

pub const SELF_OPTIMIZING_MIN_TARGET_SIZE_RATIO: &str = "self-optimizing.min-target-size-ratio";
pub const SELF_OPTIMIZING_MIN_TARGET_SIZE_RATIO_DEFAULT: f64 = 0.75;

pub const SELF_OPTIMIZING_FULL_TRIGGER_DELETE_FILES: &str =
    "self-optimizing.full.trigger.delete-file-count";
pub const SELF_OPTIMIZING_FULL_TRIGGER_DELETE_FILES_DEFAULT: usize = 64;

pub const SELF_OPTIMIZING_EXECUTE_TIMEOUT: &str = "self-optimizing.execute.timeout-ms";

pub const SELF_OPTIMIZING_OUTPUT_LOCATION: &str = "self-optimizing.output-location";

pub const TABLE_CREATE_TIME: &str = "table.create-timestamp";
pub const TABLE_CREATE_TIME_DEFAULT: i64 = 0;

/// Order in which tasks inside a process, or processes of one plan, are run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OrderStrategy {
    /// Oldest data first: ascending from-sequence.
    Sequence,
    /// Largest input first: descending input bytes.
    Size,
}

impl Display for OrderStrategy {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            OrderStrategy::Sequence => f.write_str("sequence"),
            OrderStrategy::Size => f.write_str("size"),
        }
    }
}

impl FromStr for OrderStrategy {
    type Err = OptimizeError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "sequence" | "age" => Ok(OrderStrategy::Sequence),
            "size" | "priority" => Ok(OrderStrategy::Size),
            other => Err(OptimizeError::InvalidConfiguration(format!(
                "unknown order strategy {other}"
            ))),
        }
    }
}

/// Retry policy for committing a finished process through the table format.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CommitRetryConfig {
    pub max_retries: u32,
    pub retry_initial_delay_ms: u64,
    pub retry_max_delay_ms: u64,
}

impl Default for CommitRetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            retry_initial_delay_ms: 1000,
            retry_max_delay_ms: 10_000,
        }
    }
}

impl CommitRetryConfig {
    pub fn retry_initial_delay(&self) -> Duration {
        Duration::from_millis(self.retry_initial_delay_ms)
    }

    pub fn retry_max_delay(&self) -> Duration {
        Duration::from_millis(self.retry_max_delay_ms)
    }
}

#[derive(Builder, Debug, Clone, Deserialize)]
#[builder(setter(into), default)]
#[serde(default)]
pub struct OptimizeServiceConfig {
    /// Capacity of the queue of tables waiting for commit.
    pub commit_queue_capacity: usize,
    /// Concurrent table loads during startup.
    pub table_load_parallelism: usize,
    /// Concurrent per-table scheduling ticks.
    pub check_parallelism: usize,
    /// Failed attempts a task may be re-offered before its process fails.
    pub max_task_retries: u32,
    /// Capacity of each optimizer group's task queue.
    pub task_queue_capacity: usize,
    /// Resident byte budget of each spillable cache.
    pub spill_memory_budget_bytes: u64,
    /// Entries written per disk transaction when spilling.
    pub spill_batch_size: usize,
    /// Directory for spill files. The system temp dir when unset.
    pub spill_base_dir: Option<String>,
    /// Optimizer groups known to the in-process queue.
    pub optimizer_groups: Vec<String>,
    /// Age after which history rows are expired, in milliseconds.
    pub history_retention_ms: i64,
    pub commit_retry: CommitRetryConfig,
}

impl Default for OptimizeServiceConfig {
    fn default() -> Self {
        Self {
            commit_queue_capacity: 1000,
            table_load_parallelism: 5,
            check_parallelism: 5,
            max_task_retries: 5,
            task_queue_capacity: 10_000,
            spill_memory_budget_bytes: 64 * 1024 * 1024,
            spill_batch_size: 1000,
            spill_base_dir: None,
            optimizer_groups: vec![SELF_OPTIMIZING_GROUP_DEFAULT.to_owned()],
            history_retention_ms: 7 * 24 * 60 * 60 * 1000,
            commit_retry: CommitRetryConfig::default(),
        }
    }
}

impl OptimizeServiceConfig {
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        Self::from_yaml(&contents)
    }

    pub fn from_yaml(contents: &str) -> Result<Self> {
        let config: OptimizeServiceConfig = serde_yaml::from_str(contents)
            .map_err(|e| OptimizeError::InvalidConfiguration(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.commit_queue_capacity == 0 {
            return Err(OptimizeError::InvalidConfiguration(
                "commit_queue_capacity must be positive".to_owned(),
            ));
        }
        if self.task_queue_capacity == 0 {
            return Err(OptimizeError::InvalidConfiguration(
                "task_queue_capacity must be positive".to_owned(),
            ));
        }
        if self.spill_batch_size == 0 {
            return Err(OptimizeError::InvalidConfiguration(
                "spill_batch_size must be positive".to_owned(),
            ));
        }
        Ok(())
    }
}

/// Settings of one table, read from its properties.
#[derive(Debug, Clone, PartialEq)]
pub struct OptimizingConfig {
    pub enabled: bool,
    pub group_name: String,
    pub task_order: OrderStrategy,
    pub process_order: OrderStrategy,
    pub partitioned_threshold: usize,
    pub target_size: u64,
    pub min_target_size_ratio: f64,
    pub full_trigger_delete_files: usize,
    pub max_execute_time: Option<i64>,
    pub custom_output_location: Option<String>,
    pub create_time: i64,
}

impl Default for OptimizingConfig {
    fn default() -> Self {
        Self::from_properties(&HashMap::new())
    }
}

impl OptimizingConfig {
    pub fn from_properties(properties: &HashMap<String, String>) -> Self {
        Self {
            enabled: property_with_legacy(
                properties,
                SELF_OPTIMIZING_ENABLED,
                SELF_OPTIMIZING_ENABLED_LEGACY,
                SELF_OPTIMIZING_ENABLED_DEFAULT,
            ),
            group_name: properties
                .get(SELF_OPTIMIZING_GROUP)
                .or_else(|| properties.get(SELF_OPTIMIZING_GROUP_LEGACY))
                .filter(|group| !group.trim().is_empty())
                .cloned()
                .unwrap_or_else(|| SELF_OPTIMIZING_GROUP_DEFAULT.to_owned()),
            task_order: property_or_default(
                properties,
                SELF_OPTIMIZING_TASK_ORDER,
                SELF_OPTIMIZING_TASK_ORDER_DEFAULT,
            ),
            process_order: property_or_default(
                properties,
                SELF_OPTIMIZING_PROCESS_ORDER,
                SELF_OPTIMIZING_PROCESS_ORDER_DEFAULT,
            ),
            partitioned_threshold: property_or_default(
                properties,
                SELF_OPTIMIZING_PROCESS_PARTITIONED_THRESHOLD,
                SELF_OPTIMIZING_PROCESS_PARTITIONED_THRESHOLD_DEFAULT,
            ),
            target_size: property_or_default(
                properties,
                SELF_OPTIMIZING_TARGET_SIZE,
                SELF_OPTIMIZING_TARGET_SIZE_DEFAULT,
            ),
            min_target_size_ratio: property_or_default(
                properties,
                SELF_OPTIMIZING_MIN_TARGET_SIZE_RATIO,
                SELF_OPTIMIZING_MIN_TARGET_SIZE_RATIO_DEFAULT,
            ),
            full_trigger_delete_files: property_or_default(
                properties,
                SELF_OPTIMIZING_FULL_TRIGGER_DELETE_FILES,
                SELF_OPTIMIZING_FULL_TRIGGER_DELETE_FILES_DEFAULT,
            ),
            max_execute_time: optional_property(properties, SELF_OPTIMIZING_EXECUTE_TIMEOUT),
            custom_output_location: properties.get(SELF_OPTIMIZING_OUTPUT_LOCATION).cloned(),
            create_time: property_or_default(
                properties,
                TABLE_CREATE_TIME,
                TABLE_CREATE_TIME_DEFAULT,
            ),
        }
    }

    /// Data files below this size are treated as small (insert) files.
    pub fn small_file_threshold(&self) -> u64 {
        (self.target_size as f64 * self.min_target_size_ratio) as u64
    }
}

fn property_or_default<T>(properties: &HashMap<String, String>, key: &str, default: T) -> T
where
    T: FromStr + Display,
{
    match properties.get(key) {
        None => default,
        Some(raw) => raw.trim().parse().unwrap_or_else(|_| {
            tracing::warn!(
                "invalid value {:?} for table property {}, fall back to {}",
                raw,
                key,
                default
            );
            default
        }),
    }
}

fn optional_property<T: FromStr>(properties: &HashMap<String, String>, key: &str) -> Option<T> {
    let raw = properties.get(key)?;
    match raw.trim().parse() {
        Ok(value) => Some(value),
        Err(_) => {
            tracing::warn!("invalid value {:?} for table property {}, ignored", raw, key);
            None
        }
    }
}

fn property_with_legacy(
    properties: &HashMap<String, String>,
    key: &str,
    legacy_key: &str,
    default: bool,
) -> bool {
    if properties.contains_key(key) {
        property_or_default(properties, key, default)
    } else {
        property_or_default(properties, legacy_key, default)
    }
}
