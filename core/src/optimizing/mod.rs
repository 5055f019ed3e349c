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

//! Optimizing processes and the tasks they are made of.

pub mod iterator;
pub mod process;
pub mod task;

pub use iterator::{
    OptimizingProcessIterator, ProcessIteratorConfig, ProcessIteratorConfigBuilder,
    ProcessIteratorConfigBuilderError,
};
pub use process::{
    DEFAULT_MAX_TASK_RETRIES, ProcessClearHandler, TableOptimizingProcess, TaskOfferHandler,
    TaskRetryHandler,
};
pub use task::{OptimizeTask, OptimizeTaskItem, OptimizeTaskStat, TaskRuntime};
