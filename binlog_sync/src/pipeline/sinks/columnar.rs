use std::{
    collections::{BTreeMap, HashMap},
    sync::Arc,
};

use async_trait::async_trait;
use serde::Serialize;
use tracing::debug;

use crate::{
    conversions::change_event::{ChangeEvent, Operation, TableRowRecord},
    table::TableConfig,
};

use super::{Sink, SinkError};

pub const SIGN_CURRENT: i8 = 1;
pub const SIGN_SUPERSEDED: i8 = -1;

/// One appended row. Updates and deletes never mutate earlier rows; they
/// append a `sign = -1` copy of the old image so collapsing engines can
/// cancel it out.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[cfg_attr(feature = "clickhouse", derive(clickhouse::Row))]
pub struct ColumnarRow {
    #[serde(rename = "gtid")]
    pub offset: String,
    pub table: String,
    #[serde(rename = "type")]
    pub operation: String,
    pub value: String,
    pub sign: i8,
}

#[async_trait]
pub trait ColumnarWriter: Send + Sync {
    /// Appends `rows` to `table`, returning the number of rows accepted.
    async fn insert_rows(&self, table: &str, rows: &[ColumnarRow]) -> Result<u64, SinkError>;
}

pub struct ColumnarSink<W> {
    writer: W,
    target_table: String,
    tables: HashMap<String, TableConfig>,
}

impl<W: ColumnarWriter> ColumnarSink<W> {
    pub fn new(
        writer: W,
        target_table: impl Into<String>,
        tables: HashMap<String, TableConfig>,
    ) -> Self {
        ColumnarSink {
            writer,
            target_table: target_table.into(),
            tables,
        }
    }

    pub fn writer(&self) -> &W {
        &self.writer
    }

    fn row(
        &self,
        event: &ChangeEvent,
        image: &TableRowRecord,
        sign: i8,
    ) -> Result<ColumnarRow, SinkError> {
        let status_flag = self
            .tables
            .get(&event.table.name)
            .and_then(|t| t.status_flag.as_deref());

        let value = match status_flag {
            Some(column) => {
                let mut image = image.clone();
                image.insert(column.to_string(), sign.into());
                serde_json::to_string(&image)?
            }
            None => serde_json::to_string(image)?,
        };

        Ok(ColumnarRow {
            offset: event.offset.to_string(),
            table: event.table.name.clone(),
            operation: event.operation.to_string(),
            value,
            sign,
        })
    }

    fn rows_for(&self, event: &ChangeEvent) -> Result<Vec<ColumnarRow>, SinkError> {
        Ok(match event.operation {
            Operation::Insert => vec![self.row(event, &event.values, SIGN_CURRENT)?],
            Operation::Update => {
                let mut rows = Vec::with_capacity(2);
                if let Some(before) = &event.before {
                    rows.push(self.row(event, before, SIGN_SUPERSEDED)?);
                }
                rows.push(self.row(event, &event.values, SIGN_CURRENT)?);
                rows
            }
            Operation::Delete => vec![self.row(event, &event.values, SIGN_SUPERSEDED)?],
        })
    }

    fn target_for(&self, event: &ChangeEvent) -> &str {
        self.tables
            .get(&event.table.name)
            .and_then(|t| t.target.as_deref())
            .unwrap_or(&self.target_table)
    }
}

#[async_trait]
impl<W: ColumnarWriter> Sink for ColumnarSink<W> {
    async fn write(&self, batch: &[Arc<ChangeEvent>]) -> Result<u64, SinkError> {
        let mut groups: BTreeMap<(&str, Operation), Vec<ColumnarRow>> = BTreeMap::new();
        for event in batch {
            let rows = self.rows_for(event)?;
            groups
                .entry((self.target_for(event), event.operation))
                .or_default()
                .extend(rows);
        }

        let mut affected = 0;
        for ((table, operation), rows) in &groups {
            let inserted = self.writer.insert_rows(table, rows).await?;
            if inserted == 0 {
                return Err(SinkError::NoRowsAffected {
                    batch_size: rows.len(),
                });
            }
            debug!(table, %operation, rows = inserted, "appended columnar rows");
            affected += inserted;
        }
        Ok(affected)
    }
}

#[cfg(feature = "clickhouse")]
pub struct ClickhouseWriter {
    client: clickhouse::Client,
}

#[cfg(feature = "clickhouse")]
impl ClickhouseWriter {
    pub fn new(
        url: &str,
        database: Option<&str>,
        user: Option<&str>,
        password: Option<&str>,
    ) -> Self {
        let mut client = clickhouse::Client::default().with_url(url);
        if let Some(database) = database {
            client = client.with_database(database);
        }
        if let Some(user) = user {
            client = client.with_user(user);
        }
        if let Some(password) = password {
            client = client.with_password(password);
        }
        ClickhouseWriter { client }
    }
}

#[cfg(feature = "clickhouse")]
#[async_trait]
impl ColumnarWriter for ClickhouseWriter {
    async fn insert_rows(&self, table: &str, rows: &[ColumnarRow]) -> Result<u64, SinkError> {
        let mut insert = self.client.insert::<ColumnarRow>(table)?;
        for row in rows {
            insert.write(row).await?;
        }
        insert.end().await?;
        Ok(rows.len() as u64)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use chrono::Utc;
    use serde_json::json;

    use crate::{
        offset::{OffsetScheme, ReplicationOffset},
        table::TableName,
    };

    use super::*;

    #[derive(Default)]
    struct RecordingWriter {
        inserts: Mutex<Vec<(String, Vec<ColumnarRow>)>>,
        report_zero: bool,
    }

    #[async_trait]
    impl ColumnarWriter for RecordingWriter {
        async fn insert_rows(&self, table: &str, rows: &[ColumnarRow]) -> Result<u64, SinkError> {
            self.inserts
                .lock()
                .unwrap()
                .push((table.to_string(), rows.to_vec()));
            Ok(if self.report_zero { 0 } else { rows.len() as u64 })
        }
    }

    fn row(id: i64, status: &str) -> TableRowRecord {
        let mut row = TableRowRecord::new();
        row.insert("id".to_string(), json!(id));
        row.insert("status".to_string(), json!(status));
        row
    }

    fn event(operation: Operation, values: TableRowRecord, before: Option<TableRowRecord>) -> Arc<ChangeEvent> {
        Arc::new(ChangeEvent {
            table: TableName::new("shop", "orders"),
            operation,
            values,
            before,
            offset: ReplicationOffset::parse(OffsetScheme::Gtid, "g:7").unwrap(),
            timestamp: Utc::now(),
        })
    }

    #[tokio::test]
    async fn groups_by_table_and_operation() {
        let sink = ColumnarSink::new(RecordingWriter::default(), "binlog", HashMap::new());
        let batch = vec![
            event(Operation::Insert, row(1, "new"), None),
            event(Operation::Update, row(1, "paid"), Some(row(1, "new"))),
            event(Operation::Insert, row(2, "new"), None),
            event(Operation::Delete, row(2, "new"), None),
        ];

        let affected = sink.write(&batch).await.unwrap();
        assert_eq!(affected, 5);

        let inserts = sink.writer().inserts.lock().unwrap().clone();
        assert_eq!(inserts.len(), 3);

        let (table, inserted) = &inserts[0];
        assert_eq!(table, "binlog");
        assert_eq!(inserted.len(), 2);
        assert!(inserted.iter().all(|r| r.operation == "insert" && r.sign == SIGN_CURRENT));

        let updates = &inserts[1].1;
        assert_eq!(updates.len(), 2);
        assert_eq!(updates[0].sign, SIGN_SUPERSEDED);
        assert!(updates[0].value.contains("\"new\""));
        assert_eq!(updates[1].sign, SIGN_CURRENT);
        assert_eq!(updates[1].offset, "g:7");

        let deletes = &inserts[2].1;
        assert_eq!(deletes[0].sign, SIGN_SUPERSEDED);
    }

    #[tokio::test]
    async fn writes_status_flag_into_value() {
        let mut tables = HashMap::new();
        tables.insert(
            "orders".to_string(),
            TableConfig {
                status_flag: Some("_status".to_string()),
                target: Some("orders_cdc".to_string()),
                ..TableConfig::default()
            },
        );
        let sink = ColumnarSink::new(RecordingWriter::default(), "binlog", tables);

        sink.write(&[event(Operation::Delete, row(3, "x"), None)])
            .await
            .unwrap();

        let inserts = sink.writer().inserts.lock().unwrap().clone();
        assert_eq!(inserts[0].0, "orders_cdc");
        let value: serde_json::Value = serde_json::from_str(&inserts[0].1[0].value).unwrap();
        assert_eq!(value["_status"], json!(-1));
    }

    #[tokio::test]
    async fn zero_rows_is_an_error() {
        let writer = RecordingWriter {
            report_zero: true,
            ..RecordingWriter::default()
        };
        let sink = ColumnarSink::new(writer, "binlog", HashMap::new());

        let err = sink
            .write(&[event(Operation::Insert, row(1, "new"), None)])
            .await
            .unwrap_err();
        assert!(matches!(err, SinkError::NoRowsAffected { batch_size: 1 }));
    }
}
