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
use std::time::Duration;

use async_trait::async_trait;
use backon::{ExponentialBuilder, Retryable};

use crate::config::CommitRetryConfig;
use crate::optimizing::TableOptimizingProcess;
use crate::{OptimizeError, Result};

/// Applies the output of a finished process to the table format.
#[async_trait]
pub trait ProcessCommitter: Send + Sync {
    /// Returns the id of the snapshot the commit produced.
    async fn commit(&self, process: &TableOptimizingProcess) -> Result<i64>;
}

/// Runs a [`ProcessCommitter`] with exponential backoff on transient errors.
pub struct CommitManager {
    config: CommitRetryConfig,
    committer: Arc<dyn ProcessCommitter>,
}

impl CommitManager {
    pub fn new(config: CommitRetryConfig, committer: Arc<dyn ProcessCommitter>) -> Self {
        Self { config, committer }
    }

    pub async fn commit(&self, process: &TableOptimizingProcess) -> Result<i64> {
        let operation = || async { self.committer.commit(process).await };

        let retry_strategy = ExponentialBuilder::default()
            .with_min_delay(self.config.retry_initial_delay())
            .with_max_delay(self.config.retry_max_delay())
            .with_max_times(self.config.max_retries as usize);

        operation
            .retry(retry_strategy)
            .when(|e: &OptimizeError| e.is_transient())
            .notify(|e: &OptimizeError, dur: Duration| {
                tracing::warn!(
                    "commit of process {} of table {} failed, retry in {:?}: {}",
                    process.process_id(),
                    process.table_identifier(),
                    dur,
                    e
                );
            })
            .await
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use super::*;
    use crate::common::{OptimizeType, TableIdentifier};
    use crate::test_utils::RecordingCommitter;

    fn process() -> TableOptimizingProcess {
        TableOptimizingProcess::new(
            1,
            TableIdentifier::new("c", "d", "t"),
            OptimizeType::Minor,
            1,
            10,
            None,
            vec![],
            BTreeMap::new(),
            BTreeMap::new(),
        )
    }

    fn fast_retry() -> CommitRetryConfig {
        CommitRetryConfig {
            max_retries: 3,
            retry_initial_delay_ms: 1,
            retry_max_delay_ms: 2,
        }
    }

    #[tokio::test]
    async fn test_transient_failures_are_retried() {
        let committer = Arc::new(RecordingCommitter::new());
        committer.fail_times(2, true);
        let manager = CommitManager::new(fast_retry(), committer.clone());
        assert_eq!(manager.commit(&process()).await.unwrap(), 11);
        assert_eq!(committer.attempts(), 3);
        assert_eq!(committer.committed(), vec![1]);
    }

    #[tokio::test]
    async fn test_permanent_failure_is_not_retried() {
        let committer = Arc::new(RecordingCommitter::new());
        committer.fail_times(1, false);
        let manager = CommitManager::new(fast_retry(), committer.clone());
        assert!(matches!(
            manager.commit(&process()).await,
            Err(OptimizeError::Execution(_))
        ));
        assert_eq!(committer.attempts(), 1);
    }
}
