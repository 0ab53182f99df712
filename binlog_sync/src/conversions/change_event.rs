use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::{
    offset::{OffsetParseError, OffsetScheme, ReplicationOffset},
    table::TableName,
};

use super::json_cell::{JsonConverter, JsonValue, JsonValueConversionError};

#[derive(Debug, Error)]
pub enum ChangeEventConversionError {
    #[error("invalid offset token: {0}")]
    InvalidOffset(#[from] OffsetParseError),

    #[error("{operation} event for {table} carries no rows")]
    MissingRows { table: TableName, operation: Operation },

    #[error("update event for {table} has {before} before images for {after} rows")]
    RowCountMismatch {
        table: TableName,
        before: usize,
        after: usize,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Operation {
    #[serde(alias = "write")]
    Insert,
    Update,
    Delete,
}

impl Operation {
    pub fn as_str(&self) -> &'static str {
        match self {
            Operation::Insert => "insert",
            Operation::Update => "update",
            Operation::Delete => "delete",
        }
    }
}

impl std::fmt::Display for Operation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

pub type TableRowRecord = BTreeMap<String, JsonValue>;

/// A row-level change as emitted by the upstream decoder, one per
/// replication event. Rows of a multi-row event share a single offset.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceEvent {
    pub database: String,
    pub table: String,
    pub operation: Operation,
    #[serde(default)]
    pub rows_before: Option<Vec<TableRowRecord>>,
    #[serde(default)]
    pub rows_after: Vec<TableRowRecord>,
    #[serde(alias = "offset")]
    pub offset_token: String,
    #[serde(default = "Utc::now")]
    pub timestamp: DateTime<Utc>,
}

impl SourceEvent {
    pub fn table_name(&self) -> TableName {
        TableName::new(&self.database, &self.table)
    }

    /// Splits the event into one [`ChangeEvent`] per row.
    pub fn into_change_events(
        self,
        scheme: OffsetScheme,
    ) -> Result<(ReplicationOffset, Vec<ChangeEvent>), ChangeEventConversionError> {
        let table = self.table_name();
        let offset = ReplicationOffset::parse(scheme, &self.offset_token)?;
        let operation = self.operation;
        let timestamp = self.timestamp;

        let rows: Vec<(TableRowRecord, Option<TableRowRecord>)> = match operation {
            Operation::Insert => self.rows_after.into_iter().map(|r| (r, None)).collect(),
            Operation::Update => match self.rows_before {
                Some(before) if before.len() != self.rows_after.len() => {
                    return Err(ChangeEventConversionError::RowCountMismatch {
                        table,
                        before: before.len(),
                        after: self.rows_after.len(),
                    });
                }
                Some(before) => self
                    .rows_after
                    .into_iter()
                    .zip(before)
                    .map(|(after, before)| (after, Some(before)))
                    .collect(),
                None => self.rows_after.into_iter().map(|r| (r, None)).collect(),
            },
            Operation::Delete => match self.rows_before {
                Some(before) if !before.is_empty() => {
                    before.into_iter().map(|r| (r, None)).collect()
                }
                _ => self.rows_after.into_iter().map(|r| (r, None)).collect(),
            },
        };

        if rows.is_empty() {
            return Err(ChangeEventConversionError::MissingRows { table, operation });
        }

        let events = rows
            .into_iter()
            .map(|(values, before)| ChangeEvent {
                table: table.clone(),
                operation,
                values,
                before,
                offset: offset.clone(),
                timestamp,
            })
            .collect();

        Ok((offset, events))
    }
}

/// Normalized unit of work handed to sinks. Immutable once built.
#[derive(Debug, Clone, PartialEq)]
pub struct ChangeEvent {
    pub table: TableName,
    pub operation: Operation,
    /// Row image after the change, or the removed row for deletes.
    pub values: TableRowRecord,
    /// Row image before an update, when the upstream supplies one.
    pub before: Option<TableRowRecord>,
    pub offset: ReplicationOffset,
    pub timestamp: DateTime<Utc>,
}

impl ChangeEvent {
    pub fn key_value(
        &self,
        primary_key: &str,
    ) -> Result<Option<String>, JsonValueConversionError> {
        self.values
            .get(primary_key)
            .map(JsonConverter::to_key_part)
            .transpose()
    }
}
