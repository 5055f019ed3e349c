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

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Mutex, PoisonError};

use async_trait::async_trait;

use crate::optimizing::TableOptimizingProcess;
use crate::service::ProcessCommitter;
use crate::{OptimizeError, Result};

/// Committer that records committed process ids. Commits produce snapshot
/// `target_snapshot_id + 1`.
#[derive(Default)]
pub struct RecordingCommitter {
    committed: Mutex<Vec<i64>>,
    attempts: AtomicUsize,
    failures_left: AtomicUsize,
    transient: AtomicBool,
}

impl RecordingCommitter {
    pub fn new() -> Self {
        Self::default()
    }

    /// The next `times` attempts fail, with an I/O error when `transient`
    /// and an execution error otherwise.
    pub fn fail_times(&self, times: usize, transient: bool) {
        self.failures_left.store(times, Ordering::SeqCst);
        self.transient.store(transient, Ordering::SeqCst);
    }

    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }

    pub fn committed(&self) -> Vec<i64> {
        self.committed
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

#[async_trait]
impl ProcessCommitter for RecordingCommitter {
    async fn commit(&self, process: &TableOptimizingProcess) -> Result<i64> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        let failing = self
            .failures_left
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| left.checked_sub(1))
            .is_ok();
        if failing {
            return Err(if self.transient.load(Ordering::SeqCst) {
                OptimizeError::Io(std::io::Error::other("commit conflict"))
            } else {
                OptimizeError::Execution("commit rejected".to_owned())
            });
        }
        self.committed
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(process.process_id());
        Ok(process.target_snapshot_id() + 1)
    }
}
