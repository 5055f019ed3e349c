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

use std::borrow::Cow;
use std::sync::Arc;

use mixtrics::metrics::{BoxedCounterVec, BoxedHistogramVec, BoxedRegistry, Buckets};
use mixtrics::registry::noop::NoopMetricsRegistry;

use crate::common::TableIdentifier;

pub struct Metrics {
    // registry metrics
    pub optimizer_table_added_counter: BoxedCounterVec,
    pub optimizer_table_removed_counter: BoxedCounterVec,

    // task pipeline metrics
    pub optimizer_process_created_counter: BoxedCounterVec,
    pub optimizer_task_submitted_counter: BoxedCounterVec,
    pub optimizer_task_failed_counter: BoxedCounterVec,
    pub optimizer_task_retried_counter: BoxedCounterVec,

    // commit metrics
    pub optimizer_commit_queue_rejected_counter: BoxedCounterVec,
    pub optimizer_commit_counter: BoxedCounterVec,
    pub optimizer_commit_failed_counter: BoxedCounterVec,
    pub optimizer_commit_duration: BoxedHistogramVec,
}

impl Metrics {
    pub fn new(registry: BoxedRegistry) -> Self {
        let optimizer_table_added_counter = registry.register_counter_vec(
            "iceberg_optimizer_table_added_counter".into(),
            "Tables registered for self-optimizing".into(),
            &["catalog_name"],
        );

        let optimizer_table_removed_counter = registry.register_counter_vec(
            "iceberg_optimizer_table_removed_counter".into(),
            "Tables removed from self-optimizing".into(),
            &["catalog_name"],
        );

        let optimizer_process_created_counter = registry.register_counter_vec(
            "iceberg_optimizer_process_created_counter".into(),
            "Optimizing processes created".into(),
            &["catalog_name", "table_ident"],
        );

        let optimizer_task_submitted_counter = registry.register_counter_vec(
            "iceberg_optimizer_task_submitted_counter".into(),
            "Tasks offered to the optimize queue".into(),
            &["catalog_name", "table_ident"],
        );

        let optimizer_task_failed_counter = registry.register_counter_vec(
            "iceberg_optimizer_task_failed_counter".into(),
            "Tasks that ended in failed state".into(),
            &["catalog_name", "table_ident"],
        );

        let optimizer_task_retried_counter = registry.register_counter_vec(
            "iceberg_optimizer_task_retried_counter".into(),
            "Tasks re-offered after a failed attempt".into(),
            &["catalog_name", "table_ident"],
        );

        let optimizer_commit_queue_rejected_counter = registry.register_counter_vec(
            "iceberg_optimizer_commit_queue_rejected_counter".into(),
            "Commit offers rejected because the commit queue was full".into(),
            &["catalog_name", "table_ident"],
        );

        let optimizer_commit_counter = registry.register_counter_vec(
            "iceberg_optimizer_commit_counter".into(),
            "Optimizing processes committed".into(),
            &["catalog_name", "table_ident"],
        );

        let optimizer_commit_failed_counter = registry.register_counter_vec(
            "iceberg_optimizer_commit_failed_counter".into(),
            "Optimizing process commits that failed".into(),
            &["catalog_name", "table_ident"],
        );

        // 10ms 100ms 1s 10s 100s
        let optimizer_commit_duration = registry.register_histogram_vec_with_buckets(
            "iceberg_optimizer_commit_duration".into(),
            "Optimizing process commit duration in milliseconds".into(),
            &["catalog_name", "table_ident"],
            Buckets::exponential(10.0, 10.0, 5),
        );

        Self {
            optimizer_table_added_counter,
            optimizer_table_removed_counter,
            optimizer_process_created_counter,
            optimizer_task_submitted_counter,
            optimizer_task_failed_counter,
            optimizer_task_retried_counter,
            optimizer_commit_queue_rejected_counter,
            optimizer_commit_counter,
            optimizer_commit_failed_counter,
            optimizer_commit_duration,
        }
    }

    /// Metrics that record into a registry which drops everything.
    pub fn noop() -> Self {
        Self::new(Box::new(NoopMetricsRegistry))
    }
}

/// Records metrics labelled with one table.
#[derive(Clone)]
pub struct TableMetricsRecorder {
    metrics: Arc<Metrics>,
    catalog_name: String,
    table_ident: String,
}

impl TableMetricsRecorder {
    pub fn new(metrics: Arc<Metrics>, table_identifier: &TableIdentifier) -> Self {
        Self {
            metrics,
            catalog_name: table_identifier.catalog.clone(),
            table_ident: format!("{}.{}", table_identifier.database, table_identifier.table),
        }
    }

    fn label_vec(&self) -> [Cow<'static, str>; 2] {
        [
            self.catalog_name.clone().into(),
            self.table_ident.clone().into(),
        ]
    }

    fn catalog_label(&self) -> [Cow<'static, str>; 1] {
        [self.catalog_name.clone().into()]
    }

    pub fn record_table_added(&self) {
        self.metrics
            .optimizer_table_added_counter
            .counter(&self.catalog_label())
            .increase(1);
    }

    pub fn record_table_removed(&self) {
        self.metrics
            .optimizer_table_removed_counter
            .counter(&self.catalog_label())
            .increase(1);
    }

    pub fn record_process_created(&self) {
        self.metrics
            .optimizer_process_created_counter
            .counter(&self.label_vec())
            .increase(1);
    }

    pub fn record_task_submitted(&self) {
        self.metrics
            .optimizer_task_submitted_counter
            .counter(&self.label_vec())
            .increase(1);
    }

    pub fn record_task_failed(&self) {
        self.metrics
            .optimizer_task_failed_counter
            .counter(&self.label_vec())
            .increase(1);
    }

    pub fn record_task_retried(&self) {
        self.metrics
            .optimizer_task_retried_counter
            .counter(&self.label_vec())
            .increase(1);
    }

    pub fn record_commit_queue_rejected(&self) {
        self.metrics
            .optimizer_commit_queue_rejected_counter
            .counter(&self.label_vec())
            .increase(1);
    }

    pub fn record_commit_success(&self, duration_ms: f64) {
        let label_vec = self.label_vec();

        self.metrics
            .optimizer_commit_counter
            .counter(&label_vec)
            .increase(1);
        self.metrics
            .optimizer_commit_duration
            .histogram(&label_vec)
            .record(duration_ms);
    }

    pub fn record_commit_failure(&self) {
        self.metrics
            .optimizer_commit_failed_counter
            .counter(&self.label_vec())
            .increase(1);
    }
}
