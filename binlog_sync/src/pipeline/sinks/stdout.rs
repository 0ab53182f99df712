use std::sync::Arc;

use async_trait::async_trait;
use tracing::info;

use crate::conversions::change_event::ChangeEvent;

use super::{Sink, SinkError};

pub struct StdoutSink;

#[async_trait]
impl Sink for StdoutSink
where
    Self: Send + Sync,
{
    async fn write(&self, batch: &[Arc<ChangeEvent>]) -> Result<u64, SinkError> {
        for event in batch {
            info!(
                table = %event.table,
                operation = %event.operation,
                offset = %event.offset,
                values = ?event.values,
                "change"
            );
        }
        Ok(batch.len() as u64)
    }
}
