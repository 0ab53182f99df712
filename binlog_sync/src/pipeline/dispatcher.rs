use std::{
    collections::HashSet,
    sync::{Arc, Mutex},
    time::Duration,
};

use thiserror::Error;
use tokio::sync::{AcquireError, OwnedSemaphorePermit, Semaphore};
use tokio_util::{sync::CancellationToken, task::TaskTracker};
use tracing::{debug, error, info, warn};

use crate::{
    conversions::change_event::{ChangeEvent, SourceEvent},
    offset::OffsetScheme,
    table::{TableFilter, TableName},
};

use super::{
    batching::{BatchConfig, BufferStats, SinkBuffer},
    sinks::{Sink, SinkError},
    stores::{store::StoreHandle, PositionKey, StoreError},
};

#[derive(Debug, Error)]
pub enum DispatcherError {
    #[error("unable to acquire dispatch permit")]
    Semaphore(#[from] AcquireError),

    #[error("sink error: {0}")]
    Sink(#[from] SinkError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchOutcome {
    /// The table is excluded, nothing was done.
    Filtered,
    /// The event could not be turned into rows. It was logged and dropped
    /// without advancing the offset.
    Rejected,
    /// Rows were handed to `destinations` buffers.
    Dispatched { rows: usize, destinations: usize },
}

struct Route {
    buffer: SinkBuffer,
    tables: HashSet<String>,
}

impl Route {
    fn accepts(&self, table: &TableName) -> bool {
        self.tables.is_empty()
            || self.tables.contains(&table.name)
            || self.tables.contains(&table.to_string())
    }
}

/// Fans events out to sink buffers and advances the offset once every
/// buffer an event entered has written it.
///
/// Each admitted event becomes one dispatch unit holding a permit until its
/// offset is persisted, which bounds the events held between the source and
/// the position store. When no permit is left every buffer is asked to
/// flush, so count triggers that can no longer be reached do not stall
/// ingestion.
pub struct Dispatcher {
    routes: Vec<Route>,
    filter: TableFilter,
    store: StoreHandle,
    key: PositionKey,
    scheme: OffsetScheme,
    semaphore: Arc<Semaphore>,
    max_in_flight: usize,
    task_tracker: TaskTracker,
    buffer_tracker: TaskTracker,
    abort: CancellationToken,
    fatal: CancellationToken,
    fatal_error: Arc<Mutex<Option<StoreError>>>,
}

impl Dispatcher {
    pub fn new(
        store: StoreHandle,
        key: PositionKey,
        scheme: OffsetScheme,
        filter: TableFilter,
        max_in_flight: usize,
    ) -> Self {
        let max_in_flight = max_in_flight.max(1);
        Dispatcher {
            routes: Vec::new(),
            filter,
            store,
            key,
            scheme,
            semaphore: Arc::new(Semaphore::new(max_in_flight)),
            max_in_flight,
            task_tracker: TaskTracker::new(),
            buffer_tracker: TaskTracker::new(),
            abort: CancellationToken::new(),
            fatal: CancellationToken::new(),
            fatal_error: Arc::new(Mutex::new(None)),
        }
    }

    /// Starts a buffer in front of `sink`. An empty `tables` set routes
    /// every admitted table to it.
    pub fn add_route(
        &mut self,
        destination: impl Into<Arc<str>>,
        sink: Arc<dyn Sink>,
        batch_config: BatchConfig,
        tables: HashSet<String>,
    ) {
        let buffer = SinkBuffer::spawn(
            destination,
            sink,
            batch_config,
            &self.buffer_tracker,
            self.abort.clone(),
        );
        info!(destination = buffer.destination(), "added sink route");
        self.routes.push(Route { buffer, tables });
    }

    pub async fn dispatch(&self, event: SourceEvent) -> Result<DispatchOutcome, DispatcherError> {
        let table = event.table_name();
        if !self.filter.admits(&table) {
            debug!(%table, "skipping excluded table");
            return Ok(DispatchOutcome::Filtered);
        }

        let token = event.offset_token.clone();
        let operation = event.operation;
        let (offset, events) = match event.into_change_events(self.scheme) {
            Ok(converted) => converted,
            Err(e) => {
                error!(
                    %table,
                    %operation,
                    offset = token,
                    error = %e,
                    "dropping event that cannot be converted"
                );
                return Ok(DispatchOutcome::Rejected);
            }
        };

        let permit = self.acquire().await?;
        let rows = events.len();
        let events: Vec<Arc<ChangeEvent>> = events.into_iter().map(Arc::new).collect();

        let mut tickets = Vec::new();
        for route in self.routes.iter().filter(|r| r.accepts(&table)) {
            tickets.push(route.buffer.enqueue(events.clone())?);
        }
        let destinations = tickets.len();
        if destinations == 0 {
            debug!(%table, %offset, "no sink routed, advancing offset");
        }

        let store = self.store.clone();
        let key = self.key.clone();
        let fatal = self.fatal.clone();
        let fatal_error = self.fatal_error.clone();

        self.task_tracker.spawn(async move {
            for ticket in tickets {
                let destination = ticket.destination().to_string();
                if let Err(e) = ticket.wait().await {
                    error!(
                        %table,
                        %offset,
                        destination,
                        error = %e,
                        "events were not written, offset not advanced"
                    );
                    return;
                }
            }

            match store.report_offset(&key, &offset).await {
                Ok(advanced) => debug!(%table, %offset, advanced, "dispatch unit done"),
                Err(e) if e.is_fatal() => {
                    error!(%key, %offset, error = %e, "unable to persist offset, stopping");
                    fatal_error.lock().unwrap().get_or_insert(e);
                    fatal.cancel();
                }
                Err(e) => error!(%key, %offset, error = %e, "unable to persist offset"),
            }

            drop(permit);
        });

        Ok(DispatchOutcome::Dispatched { rows, destinations })
    }

    async fn acquire(&self) -> Result<OwnedSemaphorePermit, DispatcherError> {
        if let Ok(permit) = self.semaphore.clone().try_acquire_owned() {
            return Ok(permit);
        }
        debug!(
            in_flight = self.in_flight(),
            "dispatch capacity exhausted, flushing buffers"
        );
        for route in &self.routes {
            route.buffer.request_flush();
        }
        Ok(self.semaphore.clone().acquire_owned().await?)
    }

    /// Dispatch units whose offset is not persisted yet.
    pub fn in_flight(&self) -> usize {
        self.max_in_flight - self.semaphore.available_permits()
    }

    /// Cancelled when the position store failed for good.
    pub fn fatal_token(&self) -> CancellationToken {
        self.fatal.clone()
    }

    pub fn take_fatal(&self) -> Option<StoreError> {
        self.fatal_error.lock().unwrap().take()
    }

    pub fn buffer_stats(&self) -> Vec<(String, BufferStats)> {
        self.routes
            .iter()
            .map(|r| (r.buffer.destination().to_string(), r.buffer.stats()))
            .collect()
    }

    /// Flushes every buffer and waits for outstanding units. Whatever is
    /// still pending after `timeout` is abandoned without advancing its
    /// offset. Returns whether everything drained.
    pub async fn shutdown(&self, timeout: Duration) -> bool {
        for route in &self.routes {
            route.buffer.close();
        }
        self.buffer_tracker.close();
        self.task_tracker.close();

        let drained = tokio::time::timeout(timeout, async {
            self.buffer_tracker.wait().await;
            self.task_tracker.wait().await;
        })
        .await
        .is_ok();

        if !drained {
            warn!(
                in_flight = self.in_flight(),
                "drain timed out, abandoning pending events"
            );
            self.abort.cancel();
            self.buffer_tracker.wait().await;
            self.task_tracker.wait().await;
        }
        self.semaphore.close();
        info!(drained, "dispatcher stopped");
        drained
    }
}
