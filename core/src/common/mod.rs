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

//! Identifiers and status enums shared by every layer of the optimizer.

use std::fmt::{Display, Formatter};
use std::str::FromStr;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

use crate::{OptimizeError, Result};

pub mod metrics;

/// Catalog + database + table triple.
///
/// Field order drives the derived `Ord`, so iteration over a sorted
/// collection of identifiers is lexical by catalog, then database, then table.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TableIdentifier {
    pub catalog: String,
    pub database: String,
    pub table: String,
}

impl TableIdentifier {
    pub fn new(
        catalog: impl Into<String>,
        database: impl Into<String>,
        table: impl Into<String>,
    ) -> Self {
        Self {
            catalog: catalog.into(),
            database: database.into(),
            table: table.into(),
        }
    }
}

impl Display for TableIdentifier {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{}.{}", self.catalog, self.database, self.table)
    }
}

impl FromStr for TableIdentifier {
    type Err = OptimizeError;

    fn from_str(s: &str) -> Result<Self> {
        let mut parts = s.splitn(3, '.');
        match (parts.next(), parts.next(), parts.next()) {
            (Some(catalog), Some(database), Some(table))
                if !catalog.is_empty() && !database.is_empty() && !table.is_empty() =>
            {
                Ok(Self::new(catalog, database, table))
            }
            _ => Err(OptimizeError::InvalidConfiguration(format!(
                "table identifier must be catalog.database.table, got {s}"
            ))),
        }
    }
}

/// Identifies one task inside one optimizing process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct OptimizeTaskId {
    pub process_id: i64,
    pub task_seq: i32,
}

impl OptimizeTaskId {
    pub fn new(process_id: i64, task_seq: i32) -> Self {
        Self {
            process_id,
            task_seq,
        }
    }
}

impl Display for OptimizeTaskId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}-{}", self.process_id, self.task_seq)
    }
}

macro_rules! string_enum {
    ($name:ident { $($variant:ident => $text:literal),+ $(,)? }) => {
        impl $name {
            pub fn as_str(&self) -> &'static str {
                match self {
                    $($name::$variant => $text,)+
                }
            }
        }

        impl Display for $name {
            fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl FromStr for $name {
            type Err = OptimizeError;

            fn from_str(s: &str) -> Result<Self> {
                match s {
                    $($text => Ok($name::$variant),)+
                    other => Err(OptimizeError::InvalidConfiguration(format!(
                        "unknown {} {other}",
                        stringify!($name)
                    ))),
                }
            }
        }
    };
}

/// Ordered by rewrite scope, `Minor < Major < Full`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum OptimizeType {
    Minor,
    Major,
    Full,
}

string_enum!(OptimizeType {
    Minor => "minor",
    Major => "major",
    Full => "full",
});

/// Table level optimizing state.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum OptimizeStatus {
    #[default]
    Idle,
    Pending,
    MinorOptimizing,
    MajorOptimizing,
    FullOptimizing,
    Committing,
}

string_enum!(OptimizeStatus {
    Idle => "idle",
    Pending => "pending",
    MinorOptimizing => "minor_optimizing",
    MajorOptimizing => "major_optimizing",
    FullOptimizing => "full_optimizing",
    Committing => "committing",
});

impl OptimizeStatus {
    pub fn optimizing(optimize_type: OptimizeType) -> Self {
        match optimize_type {
            OptimizeType::Minor => OptimizeStatus::MinorOptimizing,
            OptimizeType::Major => OptimizeStatus::MajorOptimizing,
            OptimizeType::Full => OptimizeStatus::FullOptimizing,
        }
    }
}

/// Task lifecycle: `Pending -> Scheduled -> Executing -> {Success, Failed, Canceled}`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TaskStatus {
    #[default]
    Pending,
    Scheduled,
    Executing,
    Success,
    Failed,
    Canceled,
}

string_enum!(TaskStatus {
    Pending => "pending",
    Scheduled => "scheduled",
    Executing => "executing",
    Success => "success",
    Failed => "failed",
    Canceled => "canceled",
});

impl TaskStatus {
    pub fn is_finished(&self) -> bool {
        matches!(
            self,
            TaskStatus::Success | TaskStatus::Failed | TaskStatus::Canceled
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessStatus {
    Running,
    Committing,
    Failed,
    Closed,
}

string_enum!(ProcessStatus {
    Running => "running",
    Committing => "committing",
    Failed => "failed",
    Closed => "closed",
});

/// Milliseconds since the unix epoch.
pub fn current_time_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or_default()
}
