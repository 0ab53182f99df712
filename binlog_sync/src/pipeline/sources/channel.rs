use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::{
    conversions::change_event::{Operation, SourceEvent},
    offset::StartPosition,
};

use super::{
    binlog::{EventSubscriber, RowsEvent},
    CdcStream, Source, SourceError,
};

type Item = Result<SourceEvent, SourceError>;

#[derive(Debug, Default)]
struct ChannelState {
    refuse_connects: usize,
    connects: usize,
    starts: Vec<StartPosition>,
    connected: bool,
}

/// In-process source fed through a [`ChannelSubscriber`]. The stream
/// survives reconnects, so events pushed while disconnected are delivered
/// by the next stream.
pub struct ChannelSource {
    receiver: Arc<tokio::sync::Mutex<mpsc::UnboundedReceiver<Item>>>,
    state: Arc<Mutex<ChannelState>>,
}

/// Producer side of a [`ChannelSource`]. Dropping every subscriber ends the
/// stream.
#[derive(Clone)]
pub struct ChannelSubscriber {
    sender: mpsc::UnboundedSender<Item>,
    state: Arc<Mutex<ChannelState>>,
}

impl ChannelSource {
    pub fn new() -> (ChannelSource, ChannelSubscriber) {
        let (sender, receiver) = mpsc::unbounded_channel();
        let state = Arc::new(Mutex::new(ChannelState::default()));
        (
            ChannelSource {
                receiver: Arc::new(tokio::sync::Mutex::new(receiver)),
                state: state.clone(),
            },
            ChannelSubscriber { sender, state },
        )
    }
}

#[async_trait]
impl Source for ChannelSource {
    async fn connect(&mut self) -> Result<(), SourceError> {
        let mut state = self.state.lock().unwrap();
        state.connects += 1;
        if state.refuse_connects > 0 {
            state.refuse_connects -= 1;
            return Err(SourceError::Connection {
                endpoint: "channel".to_string(),
                source: std::io::ErrorKind::ConnectionRefused.into(),
            });
        }
        state.connected = true;
        Ok(())
    }

    async fn get_cdc_stream(&mut self, start: &StartPosition) -> Result<CdcStream, SourceError> {
        {
            let mut state = self.state.lock().unwrap();
            if !state.connected {
                return Err(SourceError::NotConnected);
            }
            state.connected = false;
            state.starts.push(start.clone());
        }

        let stream = futures::stream::unfold(self.receiver.clone(), |receiver| async move {
            let item = receiver.lock().await.recv().await;
            item.map(|item| (item, receiver))
        });
        Ok(Box::pin(stream))
    }
}

impl ChannelSubscriber {
    pub fn push(&self, event: SourceEvent) {
        let _ = self.sender.send(Ok(event));
    }

    /// Breaks the current stream as a lost connection would.
    pub fn disconnect(&self) {
        let _ = self.sender.send(Err(SourceError::Disconnected(
            std::io::ErrorKind::ConnectionReset.into(),
        )));
    }

    pub fn fail(&self, error: SourceError) {
        let _ = self.sender.send(Err(error));
    }

    /// Makes the next `count` connects fail.
    pub fn refuse_connects(&self, count: usize) {
        self.state.lock().unwrap().refuse_connects = count;
    }

    pub fn connects(&self) -> usize {
        self.state.lock().unwrap().connects
    }

    /// Start positions of every stream opened so far.
    pub fn starts(&self) -> Vec<StartPosition> {
        self.state.lock().unwrap().starts.clone()
    }
}

impl EventSubscriber for ChannelSubscriber {
    fn on_insert(&mut self, event: RowsEvent) {
        self.push(event.into_source_event(Operation::Insert));
    }

    fn on_update(&mut self, event: RowsEvent) {
        self.push(event.into_source_event(Operation::Update));
    }

    fn on_delete(&mut self, event: RowsEvent) {
        self.push(event.into_source_event(Operation::Delete));
    }
}

#[cfg(test)]
mod tests {
    use chrono::Utc;
    use futures::StreamExt;
    use serde_json::json;

    use crate::conversions::change_event::TableRowRecord;

    use super::*;

    fn rows(gtid: &str) -> RowsEvent {
        let mut row = TableRowRecord::new();
        row.insert("id".to_string(), json!(1));
        RowsEvent {
            database: "shop".to_string(),
            table: "orders".to_string(),
            rows_before: None,
            rows_after: vec![row],
            offset_token: gtid.to_string(),
            timestamp: Utc::now(),
        }
    }

    #[tokio::test]
    async fn stream_outlives_reconnects() {
        let (mut source, mut subscriber) = ChannelSource::new();
        subscriber.refuse_connects(1);

        assert!(source.connect().await.unwrap_err().is_transient());
        source.connect().await.unwrap();
        let mut stream = source.get_cdc_stream(&StartPosition::Tail).await.unwrap();

        subscriber.on_insert(rows("g:1"));
        subscriber.disconnect();
        subscriber.on_delete(rows("g:2"));

        assert_eq!(stream.next().await.unwrap().unwrap().offset_token, "g:1");
        assert!(stream.next().await.unwrap().unwrap_err().is_transient());
        drop(stream);

        source.connect().await.unwrap();
        let mut stream = source.get_cdc_stream(&StartPosition::FromStart).await.unwrap();
        let event = stream.next().await.unwrap().unwrap();
        assert_eq!(event.operation, Operation::Delete);

        drop(subscriber);
        assert!(stream.next().await.is_none());
        assert_eq!(
            source.state.lock().unwrap().starts,
            vec![StartPosition::Tail, StartPosition::FromStart]
        );
        assert_eq!(source.state.lock().unwrap().connects, 3);
    }
}
