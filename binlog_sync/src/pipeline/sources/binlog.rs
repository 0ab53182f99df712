use std::{collections::VecDeque, fmt, sync::Arc, time::Duration};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::io::{AsyncRead, AsyncWrite};
use tracing::{debug, info};

use crate::{
    config::SourceConfig,
    conversions::change_event::{Operation, SourceEvent, TableRowRecord},
    offset::StartPosition,
};

use super::{
    transport::{SocketTransport, TcpTransport},
    CdcStream, Source, SourceError,
};

/// Rows touched by one replication event.
#[derive(Debug, Clone, PartialEq)]
pub struct RowsEvent {
    pub database: String,
    pub table: String,
    pub rows_before: Option<Vec<TableRowRecord>>,
    pub rows_after: Vec<TableRowRecord>,
    pub offset_token: String,
    pub timestamp: DateTime<Utc>,
}

impl RowsEvent {
    pub fn into_source_event(self, operation: Operation) -> SourceEvent {
        SourceEvent {
            database: self.database,
            table: self.table,
            operation,
            rows_before: self.rows_before,
            rows_after: self.rows_after,
            offset_token: self.offset_token,
            timestamp: self.timestamp,
        }
    }
}

/// Receives the events a [`ReplicationDecoder`] reconstructs.
pub trait EventSubscriber: Send {
    fn on_insert(&mut self, event: RowsEvent);

    fn on_update(&mut self, event: RowsEvent);

    fn on_delete(&mut self, event: RowsEvent);

    fn on_heartbeat(&mut self, _offset_token: Option<&str>) {}
}

#[derive(Clone, Default, PartialEq, Eq)]
pub struct Credentials {
    pub user: String,
    pub password: Option<String>,
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("user", &self.user)
            .field("password", &self.password.as_ref().map(|_| "***"))
            .finish()
    }
}

/// Everything the upstream needs to know to start streaming to us.
#[derive(Debug, Clone, PartialEq)]
pub struct StreamRequest {
    pub credentials: Credentials,
    pub server_id: u32,
    pub heartbeat_period: Option<Duration>,
    pub included_databases: Vec<String>,
    pub included_tables: Vec<String>,
    pub start: StartPosition,
}

/// Parser of the upstream replication protocol.
#[async_trait]
pub trait ReplicationDecoder<C>: Send + Sync
where
    C: AsyncRead + AsyncWrite + Unpin + Send,
{
    /// Authenticates, registers as a replica and requests the log from
    /// `request.start`.
    async fn handshake(&self, conn: &mut C, request: &StreamRequest) -> Result<(), SourceError>;

    /// Reads the next packet and reports any row events it carries.
    /// Returns `false` once the upstream closed the stream.
    async fn next_packet(
        &self,
        conn: &mut C,
        subscriber: &mut dyn EventSubscriber,
    ) -> Result<bool, SourceError>;
}

#[derive(Debug, Clone, Default)]
pub struct BinlogOptions {
    pub credentials: Credentials,
    pub server_id: u32,
    pub heartbeat_period: Option<Duration>,
    pub included_databases: Vec<String>,
    pub included_tables: Vec<String>,
}

impl BinlogOptions {
    pub fn from_config(config: &SourceConfig) -> Self {
        BinlogOptions {
            credentials: Credentials {
                user: config.user.clone(),
                password: config.password.clone(),
            },
            server_id: config.server_id,
            heartbeat_period: config.heartbeat_period(),
            included_databases: config.included_databases.clone(),
            included_tables: config.included_tables.clone(),
        }
    }
}

/// Collects decoded events until the stream hands them out.
#[derive(Default)]
struct QueueSubscriber {
    events: VecDeque<SourceEvent>,
    heartbeats: u64,
}

impl EventSubscriber for QueueSubscriber {
    fn on_insert(&mut self, event: RowsEvent) {
        self.events.push_back(event.into_source_event(Operation::Insert));
    }

    fn on_update(&mut self, event: RowsEvent) {
        self.events.push_back(event.into_source_event(Operation::Update));
    }

    fn on_delete(&mut self, event: RowsEvent) {
        self.events.push_back(event.into_source_event(Operation::Delete));
    }

    fn on_heartbeat(&mut self, offset_token: Option<&str>) {
        self.heartbeats += 1;
        debug!(offset = ?offset_token, heartbeats = self.heartbeats, "upstream heartbeat");
    }
}

/// Replication source driving a [`ReplicationDecoder`] over a
/// [`SocketTransport`].
pub struct BinlogSource<T: SocketTransport, D> {
    transport: T,
    decoder: Arc<D>,
    options: BinlogOptions,
    connection: Option<T::Connection>,
    streaming: bool,
}

impl<T, D> BinlogSource<T, D>
where
    T: SocketTransport,
    D: ReplicationDecoder<T::Connection> + 'static,
{
    pub fn new(transport: T, decoder: D, options: BinlogOptions) -> Self {
        BinlogSource {
            transport,
            decoder: Arc::new(decoder),
            options,
            connection: None,
            streaming: false,
        }
    }

    fn request(&self, start: &StartPosition) -> StreamRequest {
        StreamRequest {
            credentials: self.options.credentials.clone(),
            server_id: self.options.server_id,
            heartbeat_period: self.options.heartbeat_period,
            included_databases: self.options.included_databases.clone(),
            included_tables: self.options.included_tables.clone(),
            start: start.clone(),
        }
    }
}

impl<D> BinlogSource<TcpTransport, D>
where
    D: ReplicationDecoder<tokio::net::TcpStream> + 'static,
{
    /// Connects to `host:port` from `config`. Each connect is a single
    /// attempt bounded by the connect timeout, the pipeline owns the
    /// reconnect budget.
    pub fn from_config(config: &SourceConfig, decoder: D) -> Self {
        BinlogSource::new(
            TcpTransport::from_config(config),
            decoder,
            BinlogOptions::from_config(config),
        )
    }
}

#[async_trait]
impl<T, D> Source for BinlogSource<T, D>
where
    T: SocketTransport,
    D: ReplicationDecoder<T::Connection> + 'static,
{
    async fn connect(&mut self) -> Result<(), SourceError> {
        self.connection = Some(self.transport.connect().await?);
        self.streaming = false;
        Ok(())
    }

    async fn get_cdc_stream(&mut self, start: &StartPosition) -> Result<CdcStream, SourceError> {
        if self.streaming {
            return Err(SourceError::StreamAlreadyStarted);
        }
        let mut conn = self.connection.take().ok_or(SourceError::NotConnected)?;
        let request = self.request(start);
        self.decoder.handshake(&mut conn, &request).await?;
        self.streaming = true;
        info!(
            endpoint = %self.transport.endpoint(),
            server_id = request.server_id,
            start = %start,
            "started replication stream"
        );

        let decoder = self.decoder.clone();
        let state = (conn, decoder, QueueSubscriber::default(), false);
        let stream = futures::stream::unfold(
            state,
            |(mut conn, decoder, mut queue, mut finished)| async move {
                loop {
                    if let Some(event) = queue.events.pop_front() {
                        return Some((Ok(event), (conn, decoder, queue, finished)));
                    }
                    if finished {
                        return None;
                    }
                    match decoder.next_packet(&mut conn, &mut queue).await {
                        Ok(true) => {}
                        Ok(false) => finished = true,
                        Err(e) => return Some((Err(e), (conn, decoder, queue, true))),
                    }
                }
            },
        );
        Ok(Box::pin(stream))
    }
}
