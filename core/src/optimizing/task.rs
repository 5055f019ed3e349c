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

use serde::{Deserialize, Serialize};

use crate::catalog::ContentFile;
use crate::common::{
    OptimizeTaskId, OptimizeType, TableIdentifier, TaskStatus, current_time_millis,
};
use crate::plan::{TaskDescriptor, TaskFiles};
use crate::{OptimizeError, Result};

/// Durable description of one unit of rewrite work.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OptimizeTask {
    pub task_id: OptimizeTaskId,
    pub table_identifier: TableIdentifier,
    pub queue_id: i32,
    pub optimize_type: OptimizeType,
    pub partition: String,
    pub files: TaskFiles,
    pub from_sequence: Option<i64>,
    pub to_sequence: Option<i64>,
    pub max_execute_time: Option<i64>,
    pub custom_output_location: Option<String>,
    pub create_time: i64,
}

impl OptimizeTask {
    pub fn from_descriptor(
        task_id: OptimizeTaskId,
        table_identifier: TableIdentifier,
        queue_id: i32,
        optimize_type: OptimizeType,
        descriptor: TaskDescriptor,
        create_time: i64,
    ) -> Self {
        Self {
            task_id,
            table_identifier,
            queue_id,
            optimize_type,
            partition: descriptor.partition,
            files: descriptor.files,
            from_sequence: descriptor.from_sequence,
            to_sequence: descriptor.to_sequence,
            max_execute_time: descriptor.max_execute_time,
            custom_output_location: descriptor.custom_output_location,
            create_time,
        }
    }

    pub fn input_bytes(&self) -> u64 {
        self.files.iter().map(|f| f.file_size_in_bytes).sum()
    }
}

/// Mutable lifecycle state of a task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskRuntime {
    pub task_id: OptimizeTaskId,
    pub status: TaskStatus,
    pub attempt_id: i32,
    pub retry_count: u32,
    pub pending_time: i64,
    pub execute_time: Option<i64>,
    pub end_time: Option<i64>,
    pub fail_reason: Option<String>,
    pub fail_time: Option<i64>,
}

impl TaskRuntime {
    pub fn new(task_id: OptimizeTaskId, pending_time: i64) -> Self {
        Self {
            task_id,
            status: TaskStatus::Pending,
            attempt_id: 0,
            retry_count: 0,
            pending_time,
            execute_time: None,
            end_time: None,
            fail_reason: None,
            fail_time: None,
        }
    }

    /// Moves to `to`, rejecting moves the lifecycle does not allow.
    ///
    /// `Failed -> Pending` is the retry edge and bumps both the attempt and the
    /// retry count.
    pub fn transition(&mut self, to: TaskStatus) -> Result<()> {
        use TaskStatus::*;

        let allowed = matches!(
            (self.status, to),
            (Pending, Scheduled | Failed | Canceled)
                | (Scheduled, Pending | Executing | Failed | Canceled)
                | (Executing, Success | Failed | Canceled)
                | (Failed, Pending)
        );
        if !allowed {
            return Err(OptimizeError::Precondition(format!(
                "task {} can not move from {} to {}",
                self.task_id, self.status, to
            )));
        }

        let now = current_time_millis();
        match to {
            Pending => {
                if self.status == Failed {
                    self.retry_count += 1;
                    self.attempt_id += 1;
                }
                self.pending_time = now;
                self.execute_time = None;
                self.end_time = None;
            }
            Executing => self.execute_time = Some(now),
            Success | Canceled => self.end_time = Some(now),
            Failed => {
                self.end_time = Some(now);
                self.fail_time = Some(now);
            }
            Scheduled => {}
        }
        self.status = to;
        Ok(())
    }

    pub fn fail(&mut self, reason: impl Into<String>) -> Result<()> {
        self.transition(TaskStatus::Failed)?;
        self.fail_reason = Some(reason.into());
        Ok(())
    }
}

/// A task together with its runtime.
#[derive(Debug, Clone, PartialEq)]
pub struct OptimizeTaskItem {
    pub task: OptimizeTask,
    pub runtime: TaskRuntime,
}

impl OptimizeTaskItem {
    pub fn new(task: OptimizeTask, runtime: TaskRuntime) -> Self {
        Self { task, runtime }
    }

    pub fn task_id(&self) -> OptimizeTaskId {
        self.task.task_id
    }

    pub fn table_identifier(&self) -> &TableIdentifier {
        &self.task.table_identifier
    }

    pub fn status(&self) -> TaskStatus {
        self.runtime.status
    }

    /// Marks the task failed from any unfinished state. Used when a task can
    /// not even be handed to the queue.
    pub fn on_failed(&mut self, reason: impl Into<String>) {
        if self.runtime.status.is_finished() {
            return;
        }
        let reason = reason.into();
        tracing::warn!(
            "task {} of table {} failed: {}",
            self.task.task_id,
            self.task.table_identifier,
            reason
        );
        if let Err(e) = self.runtime.fail(reason) {
            tracing::error!("{}", e);
        }
    }
}

/// Execution report for one task attempt. The executor echoes back the
/// identity and attempt it was handed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OptimizeTaskStat {
    pub table_identifier: TableIdentifier,
    pub task_id: OptimizeTaskId,
    pub attempt_id: i32,
    pub status: TaskStatus,
    pub error_message: Option<String>,
    pub output_files: Vec<ContentFile>,
    pub report_time: i64,
}

impl OptimizeTaskStat {
    pub fn new(
        table_identifier: TableIdentifier,
        task_id: OptimizeTaskId,
        attempt_id: i32,
        status: TaskStatus,
    ) -> Self {
        Self {
            table_identifier,
            task_id,
            attempt_id,
            status,
            error_message: None,
            output_files: vec![],
            report_time: current_time_millis(),
        }
    }

    pub fn with_error(mut self, message: impl Into<String>) -> Self {
        self.error_message = Some(message.into());
        self
    }

    pub fn with_output_files(mut self, files: Vec<ContentFile>) -> Self {
        self.output_files = files;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lifecycle_edges() {
        let mut runtime = TaskRuntime::new(OptimizeTaskId::new(1, 1), 0);
        runtime.transition(TaskStatus::Scheduled).unwrap();
        runtime.transition(TaskStatus::Executing).unwrap();
        assert!(runtime.execute_time.is_some());
        runtime.fail("boom").unwrap();
        assert_eq!(runtime.fail_reason.as_deref(), Some("boom"));

        runtime.transition(TaskStatus::Pending).unwrap();
        assert_eq!(runtime.retry_count, 1);
        assert_eq!(runtime.attempt_id, 1);
        assert!(runtime.end_time.is_none());

        assert!(matches!(
            runtime.transition(TaskStatus::Success),
            Err(OptimizeError::Precondition(_))
        ));
    }

    #[test]
    fn test_on_failed_keeps_finished_tasks() {
        let task_id = OptimizeTaskId::new(1, 1);
        let task = OptimizeTask::from_descriptor(
            task_id,
            TableIdentifier::new("c", "d", "t"),
            1,
            OptimizeType::Minor,
            TaskDescriptor::new("p", TaskFiles::default(), None, None, 0),
            0,
        );
        let mut item = OptimizeTaskItem::new(task, TaskRuntime::new(task_id, 0));
        item.on_failed("queue full");
        assert_eq!(item.status(), TaskStatus::Failed);
        assert_eq!(item.runtime.fail_reason.as_deref(), Some("queue full"));

        item.on_failed("again");
        assert_eq!(item.runtime.fail_reason.as_deref(), Some("queue full"));
    }
}
