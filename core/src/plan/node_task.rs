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

use std::fmt::{Display, Formatter};
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use super::{TaskDescriptor, TaskFiles};
use crate::catalog::{ContentFile, FileContent};
use crate::common::{OptimizeTaskId, TableIdentifier, current_time_millis};
use crate::config::OptimizingConfig;
use crate::{OptimizeError, Result};

/// Role a content file plays in a rewrite.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DataFileType {
    BaseFile,
    InsertFile,
    EqDeleteFile,
    PosDeleteFile,
    IcebergEqDeleteFile,
}

impl DataFileType {
    pub fn code(&self) -> &'static str {
        match self {
            DataFileType::BaseFile => "BASE_FILE",
            DataFileType::InsertFile => "INSERT_FILE",
            DataFileType::EqDeleteFile => "EQ_DELETE_FILE",
            DataFileType::PosDeleteFile => "POS_DELETE_FILE",
            DataFileType::IcebergEqDeleteFile => "ICEBERG_EQ_DELETE_FILE",
        }
    }
}

impl Display for DataFileType {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.code())
    }
}

impl FromStr for DataFileType {
    type Err = OptimizeError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "BASE_FILE" => Ok(DataFileType::BaseFile),
            "INSERT_FILE" => Ok(DataFileType::InsertFile),
            "EQ_DELETE_FILE" => Ok(DataFileType::EqDeleteFile),
            "POS_DELETE_FILE" => Ok(DataFileType::PosDeleteFile),
            "ICEBERG_EQ_DELETE_FILE" => Ok(DataFileType::IcebergEqDeleteFile),
            other => Err(OptimizeError::InvalidConfiguration(format!(
                "unknown data file type {other}"
            ))),
        }
    }
}

/// Parses a role code coming from a task row or an executor report. Unknown
/// codes are logged and yield `None`, which [`NodeTask`] drops.
pub fn parse_file_type(code: &str) -> Option<DataFileType> {
    match code.parse() {
        Ok(file_type) => Some(file_type),
        Err(e) => {
            tracing::warn!("{}, ignore the file", e);
            None
        }
    }
}

/// Role of a scanned native file: data files below the small-file threshold
/// are inserts, the rest are base files.
pub fn classify_entry(file: &ContentFile, config: &OptimizingConfig) -> DataFileType {
    match file.content {
        FileContent::Data if file.file_size_in_bytes < config.small_file_threshold() => {
            DataFileType::InsertFile
        }
        FileContent::Data => DataFileType::BaseFile,
        FileContent::EqualityDeletes => DataFileType::IcebergEqDeleteFile,
        FileContent::PositionDeletes => DataFileType::PosDeleteFile,
    }
}

/// A native table file together with its data sequence number.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SequencedFile {
    pub file: ContentFile,
    pub sequence_number: i64,
}

impl SequencedFile {
    pub fn new(file: ContentFile, sequence_number: i64) -> Self {
        Self {
            file,
            sequence_number,
        }
    }
}

/// Files of one partition, bucketed by role, while a task is being planned.
///
/// Mixed-format files (`ContentFile`) and native files (`SequencedFile`) go
/// into separate buckets. [`data_files`](Self::data_files) and
/// [`files`](Self::files) are rebuilt from the buckets on every call.
#[derive(Debug, Clone, Default)]
pub struct NodeTask {
    base_files: Vec<ContentFile>,
    insert_files: Vec<ContentFile>,
    eq_delete_files: Vec<ContentFile>,
    pos_delete_files: Vec<ContentFile>,
    native_data_files: Vec<SequencedFile>,
    native_small_data_files: Vec<SequencedFile>,
    native_eq_delete_files: Vec<SequencedFile>,
    native_pos_delete_files: Vec<SequencedFile>,

    pub partition: Option<String>,
    pub task_id: Option<OptimizeTaskId>,
    pub table_identifier: Option<TableIdentifier>,
    pub attempt_id: i32,
    pub custom_output_location: Option<String>,
    pub max_execute_time: Option<i64>,
}

impl NodeTask {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_file(&mut self, file: ContentFile, file_type: Option<DataFileType>) {
        let Some(file_type) = file_type else {
            tracing::warn!("file type of {} is missing, not add in node", file.path);
            return;
        };
        match file_type {
            DataFileType::BaseFile => self.base_files.push(file),
            DataFileType::InsertFile => self.insert_files.push(file),
            DataFileType::EqDeleteFile => self.eq_delete_files.push(file),
            DataFileType::PosDeleteFile => self.pos_delete_files.push(file),
            DataFileType::IcebergEqDeleteFile => {
                tracing::warn!(
                    "file type of {} is {}, not add in node",
                    file.path,
                    file_type
                );
            }
        }
    }

    pub fn add_native_file(&mut self, file: SequencedFile, file_type: Option<DataFileType>) {
        let Some(file_type) = file_type else {
            tracing::warn!("file type of {} is missing, not add in node", file.file.path);
            return;
        };
        match file_type {
            DataFileType::BaseFile => self.native_data_files.push(file),
            DataFileType::InsertFile => self.native_small_data_files.push(file),
            DataFileType::EqDeleteFile | DataFileType::IcebergEqDeleteFile => {
                self.native_eq_delete_files.push(file)
            }
            DataFileType::PosDeleteFile => self.native_pos_delete_files.push(file),
        }
    }

    pub fn base_files(&self) -> &[ContentFile] {
        &self.base_files
    }

    pub fn insert_files(&self) -> &[ContentFile] {
        &self.insert_files
    }

    pub fn eq_delete_files(&self) -> &[ContentFile] {
        &self.eq_delete_files
    }

    pub fn pos_delete_files(&self) -> &[ContentFile] {
        &self.pos_delete_files
    }

    pub fn native_data_files(&self) -> &[SequencedFile] {
        &self.native_data_files
    }

    pub fn native_small_data_files(&self) -> &[SequencedFile] {
        &self.native_small_data_files
    }

    pub fn all_native_data_files(&self) -> Vec<&SequencedFile> {
        self.native_data_files
            .iter()
            .chain(&self.native_small_data_files)
            .collect()
    }

    pub fn all_native_delete_files(&self) -> Vec<&SequencedFile> {
        self.native_eq_delete_files
            .iter()
            .chain(&self.native_pos_delete_files)
            .collect()
    }

    /// Base and insert files.
    pub fn data_files(&self) -> Vec<&ContentFile> {
        self.base_files.iter().chain(&self.insert_files).collect()
    }

    /// Every file in every bucket.
    pub fn files(&self) -> Vec<&ContentFile> {
        self.base_files
            .iter()
            .chain(&self.insert_files)
            .chain(&self.eq_delete_files)
            .chain(&self.pos_delete_files)
            .chain(self.native_files().map(|f| &f.file))
            .collect()
    }

    pub fn is_empty(&self) -> bool {
        self.files().is_empty()
    }

    fn native_files(&self) -> impl Iterator<Item = &SequencedFile> {
        self.native_data_files
            .iter()
            .chain(&self.native_small_data_files)
            .chain(&self.native_eq_delete_files)
            .chain(&self.native_pos_delete_files)
    }

    /// Converts the accumulated files into the planner's task unit. Native
    /// data files become base or insert inputs by bucket; the sequence range
    /// spans every native file.
    pub fn into_descriptor(self) -> TaskDescriptor {
        let from_sequence = self.native_files().map(|f| f.sequence_number).min();
        let to_sequence = self.native_files().map(|f| f.sequence_number).max();

        let NodeTask {
            mut base_files,
            mut insert_files,
            mut eq_delete_files,
            mut pos_delete_files,
            native_data_files,
            native_small_data_files,
            native_eq_delete_files,
            native_pos_delete_files,
            partition,
            max_execute_time,
            custom_output_location,
            ..
        } = self;
        base_files.extend(native_data_files.into_iter().map(|f| f.file));
        insert_files.extend(native_small_data_files.into_iter().map(|f| f.file));
        eq_delete_files.extend(native_eq_delete_files.into_iter().map(|f| f.file));
        pos_delete_files.extend(native_pos_delete_files.into_iter().map(|f| f.file));

        TaskDescriptor::new(
            partition.unwrap_or_default(),
            TaskFiles {
                base_files,
                insert_files,
                eq_delete_files,
                pos_delete_files,
            },
            from_sequence,
            to_sequence,
            current_time_millis(),
        )
        .with_max_execute_time(max_execute_time)
        .with_custom_output_location(custom_output_location)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn file(path: &str, content: FileContent) -> ContentFile {
        ContentFile {
            path: path.to_owned(),
            content,
            partition: "p=1".to_owned(),
            file_size_in_bytes: 10,
            record_count: 1,
        }
    }

    fn paths(files: Vec<&ContentFile>) -> Vec<&str> {
        files.into_iter().map(|f| f.path.as_str()).collect()
    }

    #[test]
    fn test_files_is_union_of_buckets() {
        let mut node = NodeTask::new();
        node.add_file(file("base", FileContent::Data), Some(DataFileType::BaseFile));
        node.add_file(file("insert", FileContent::Data), Some(DataFileType::InsertFile));
        node.add_file(
            file("eq", FileContent::EqualityDeletes),
            Some(DataFileType::EqDeleteFile),
        );
        node.add_native_file(
            SequencedFile::new(file("n-pos", FileContent::PositionDeletes), 4),
            Some(DataFileType::PosDeleteFile),
        );

        assert_eq!(paths(node.data_files()), vec!["base", "insert"]);
        assert_eq!(paths(node.files()), vec!["base", "insert", "eq", "n-pos"]);

        // derived views follow later mutations
        node.add_file(
            file("pos", FileContent::PositionDeletes),
            Some(DataFileType::PosDeleteFile),
        );
        assert_eq!(
            paths(node.files()),
            vec!["base", "insert", "eq", "pos", "n-pos"]
        );
    }

    #[test]
    fn test_unknown_or_missing_role_is_dropped() {
        let mut node = NodeTask::new();
        node.add_file(file("a", FileContent::Data), None);
        node.add_file(
            file("b", FileContent::EqualityDeletes),
            Some(DataFileType::IcebergEqDeleteFile),
        );
        node.add_file(file("c", FileContent::Data), parse_file_type("CHANGE_FILE"));
        node.add_native_file(SequencedFile::new(file("d", FileContent::Data), 1), None);
        assert!(node.is_empty());

        node.add_file(file("e", FileContent::Data), parse_file_type("BASE_FILE"));
        assert_eq!(paths(node.files()), vec!["e"]);
    }

    #[test]
    fn test_native_eq_deletes_share_a_bucket() {
        let mut node = NodeTask::new();
        node.add_native_file(
            SequencedFile::new(file("x", FileContent::EqualityDeletes), 1),
            Some(DataFileType::EqDeleteFile),
        );
        node.add_native_file(
            SequencedFile::new(file("y", FileContent::EqualityDeletes), 2),
            Some(DataFileType::IcebergEqDeleteFile),
        );
        assert_eq!(node.all_native_delete_files().len(), 2);
        assert!(node.data_files().is_empty());
    }

    #[test]
    fn test_into_descriptor_spans_sequences() {
        let mut node = NodeTask::new();
        node.partition = Some("p=1".to_owned());
        node.max_execute_time = Some(1000);
        node.add_native_file(
            SequencedFile::new(file("big", FileContent::Data), 7),
            Some(DataFileType::BaseFile),
        );
        node.add_native_file(
            SequencedFile::new(file("small", FileContent::Data), 3),
            Some(DataFileType::InsertFile),
        );
        node.add_native_file(
            SequencedFile::new(file("del", FileContent::EqualityDeletes), 9),
            Some(DataFileType::IcebergEqDeleteFile),
        );

        let descriptor = node.into_descriptor();
        assert_eq!(descriptor.partition, "p=1");
        assert_eq!(descriptor.from_sequence, Some(3));
        assert_eq!(descriptor.to_sequence, Some(9));
        assert_eq!(descriptor.files.base_files[0].path, "big");
        assert_eq!(descriptor.files.insert_files[0].path, "small");
        assert_eq!(descriptor.files.eq_delete_files[0].path, "del");
        assert_eq!(descriptor.input_file_count(), 3);
        assert_eq!(descriptor.input_bytes(), 30);
        assert_eq!(descriptor.max_execute_time, Some(1000));
    }

    #[test]
    fn test_classify_entry_by_size() {
        let config = OptimizingConfig::default();
        let mut data = file("d", FileContent::Data);
        assert_eq!(classify_entry(&data, &config), DataFileType::InsertFile);
        data.file_size_in_bytes = config.target_size;
        assert_eq!(classify_entry(&data, &config), DataFileType::BaseFile);
        assert_eq!(
            classify_entry(&file("e", FileContent::EqualityDeletes), &config),
            DataFileType::IcebergEqDeleteFile
        );
    }
}
