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

//! Execution queues that hand tasks to optimizer workers.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Mutex, PoisonError};

use async_trait::async_trait;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{Mutex as AsyncMutex, mpsc};

use crate::common::TableIdentifier;
use crate::config::OptimizeServiceConfig;
use crate::optimizing::OptimizeTaskItem;
use crate::{OptimizeError, Result};

/// Where tasks go once a process is built.
///
/// `submit_task` is synchronous so it can be called from inside task offer
/// and retry handlers.
#[async_trait]
pub trait OptimizeQueue: Send + Sync {
    /// Binds `table` to the queue of `group_name` and returns its queue id.
    fn bind(&self, table: &TableIdentifier, group_name: &str) -> Result<i32>;

    /// Drops the binding of `table`.
    fn release(&self, table: &TableIdentifier) -> Result<()>;

    /// Enqueues without blocking.
    fn submit_task(&self, item: &OptimizeTaskItem) -> Result<()>;

    /// Waits until a task of `queue_id` is available.
    async fn poll_task(&self, queue_id: i32) -> Result<OptimizeTaskItem>;
}

struct GroupQueue {
    name: String,
    sender: mpsc::Sender<OptimizeTaskItem>,
    receiver: AsyncMutex<mpsc::Receiver<OptimizeTaskItem>>,
}

/// In-process queue with one bounded channel per optimizer group.
///
/// Queue ids are assigned from 1 in the order the groups are configured.
pub struct OptimizeQueueService {
    queues: BTreeMap<i32, GroupQueue>,
    group_ids: HashMap<String, i32>,
    bindings: Mutex<HashMap<TableIdentifier, i32>>,
}

impl OptimizeQueueService {
    pub fn new(groups: impl IntoIterator<Item = impl Into<String>>, capacity: usize) -> Self {
        let mut queues = BTreeMap::new();
        let mut group_ids = HashMap::new();
        for name in groups {
            let name = name.into();
            if group_ids.contains_key(&name) {
                continue;
            }
            let queue_id = queues.len() as i32 + 1;
            let (sender, receiver) = mpsc::channel(capacity.max(1));
            group_ids.insert(name.clone(), queue_id);
            queues.insert(
                queue_id,
                GroupQueue {
                    name,
                    sender,
                    receiver: AsyncMutex::new(receiver),
                },
            );
        }
        Self {
            queues,
            group_ids,
            bindings: Mutex::new(HashMap::new()),
        }
    }

    pub fn from_config(config: &OptimizeServiceConfig) -> Self {
        Self::new(config.optimizer_groups.iter().cloned(), config.task_queue_capacity)
    }

    pub fn queue_id(&self, group_name: &str) -> Option<i32> {
        self.group_ids.get(group_name).copied()
    }

    pub fn group_name(&self, queue_id: i32) -> Option<&str> {
        self.queues.get(&queue_id).map(|q| q.name.as_str())
    }

    pub fn bound_queue(&self, table: &TableIdentifier) -> Option<i32> {
        self.bindings
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(table)
            .copied()
    }

    /// Tasks waiting in `queue_id`.
    pub fn pending_len(&self, queue_id: i32) -> usize {
        self.queues
            .get(&queue_id)
            .map(|q| q.sender.max_capacity() - q.sender.capacity())
            .unwrap_or_default()
    }

    fn queue(&self, queue_id: i32) -> Result<&GroupQueue> {
        self.queues
            .get(&queue_id)
            .ok_or_else(|| OptimizeError::NotFound(format!("optimize queue {queue_id}")))
    }
}

#[async_trait]
impl OptimizeQueue for OptimizeQueueService {
    fn bind(&self, table: &TableIdentifier, group_name: &str) -> Result<i32> {
        let queue_id = self.queue_id(group_name).ok_or_else(|| {
            OptimizeError::InvalidConfiguration(format!(
                "optimizer group {group_name} of table {table} does not exist"
            ))
        })?;
        let previous = self
            .bindings
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(table.clone(), queue_id);
        if previous != Some(queue_id) {
            tracing::info!("bind table {} to optimizer group {}", table, group_name);
        }
        Ok(queue_id)
    }

    fn release(&self, table: &TableIdentifier) -> Result<()> {
        match self
            .bindings
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(table)
        {
            Some(_) => Ok(()),
            None => Err(OptimizeError::NotFound(format!(
                "queue binding of table {table}"
            ))),
        }
    }

    fn submit_task(&self, item: &OptimizeTaskItem) -> Result<()> {
        let queue_id = item.task.queue_id;
        let queue = self.queue(queue_id)?;
        match queue.sender.try_send(item.clone()) {
            Ok(()) => {
                tracing::debug!("task {} submitted to queue {}", item.task_id(), queue_id);
                Ok(())
            }
            Err(TrySendError::Full(_)) => Err(OptimizeError::QueueFull { queue_id }),
            Err(TrySendError::Closed(_)) => Err(OptimizeError::NotFound(format!(
                "optimize queue {queue_id} is closed"
            ))),
        }
    }

    async fn poll_task(&self, queue_id: i32) -> Result<OptimizeTaskItem> {
        let queue = self.queue(queue_id)?;
        let mut receiver = queue.receiver.lock().await;
        receiver.recv().await.ok_or_else(|| {
            OptimizeError::NotFound(format!("optimize queue {queue_id} is closed"))
        })
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::common::{OptimizeTaskId, OptimizeType};
    use crate::optimizing::{OptimizeTask, TaskRuntime};
    use crate::plan::{TaskDescriptor, TaskFiles};

    fn item(queue_id: i32, seq: i32) -> OptimizeTaskItem {
        let task_id = OptimizeTaskId::new(1, seq);
        let task = OptimizeTask::from_descriptor(
            task_id,
            TableIdentifier::new("c", "db", "t"),
            queue_id,
            OptimizeType::Minor,
            TaskDescriptor::new("p", TaskFiles::default(), None, None, 0),
            0,
        );
        OptimizeTaskItem::new(task, TaskRuntime::new(task_id, 0))
    }

    #[test]
    fn test_bind_unknown_group() {
        let queue = OptimizeQueueService::new(["default", "large"], 4);
        let table = TableIdentifier::new("c", "db", "t");
        assert_eq!(queue.bind(&table, "large").unwrap(), 2);
        assert_eq!(queue.bound_queue(&table), Some(2));
        assert!(matches!(
            queue.bind(&table, "missing"),
            Err(OptimizeError::InvalidConfiguration(_))
        ));
        queue.release(&table).unwrap();
        assert!(matches!(
            queue.release(&table),
            Err(OptimizeError::NotFound(_))
        ));
    }

    #[test]
    fn test_submit_reports_full_and_unknown() {
        let queue = OptimizeQueueService::new(["default"], 2);
        queue.submit_task(&item(1, 1)).unwrap();
        queue.submit_task(&item(1, 2)).unwrap();
        assert_eq!(queue.pending_len(1), 2);
        assert!(matches!(
            queue.submit_task(&item(1, 3)),
            Err(OptimizeError::QueueFull { queue_id: 1 })
        ));
        assert!(matches!(
            queue.submit_task(&item(9, 1)),
            Err(OptimizeError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_poll_is_fifo_across_consumers() {
        let queue = Arc::new(OptimizeQueueService::new(["default"], 8));
        for seq in 1..=4 {
            queue.submit_task(&item(1, seq)).unwrap();
        }
        let (a, b) = tokio::join!(queue.poll_task(1), queue.poll_task(1));
        let mut first_two = vec![a.unwrap().task_id().task_seq, b.unwrap().task_id().task_seq];
        first_two.sort();
        assert_eq!(first_two, vec![1, 2]);
        assert_eq!(queue.poll_task(1).await.unwrap().task_id().task_seq, 3);

        let waiter = {
            let queue = queue.clone();
            tokio::spawn(async move {
                let _ = queue.poll_task(1).await.unwrap();
                queue.poll_task(1).await.unwrap().task_id().task_seq
            })
        };
        queue.submit_task(&item(1, 5)).unwrap();
        assert_eq!(waiter.await.unwrap(), 5);
    }
}
