use std::{fmt, sync::Arc, time::Duration};

use backon::{BackoffBuilder, ConstantBuilder};
use futures::StreamExt;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::{
    config::{DispatcherConfig, Settings, SourceConfig},
    offset::{OffsetScheme, StartPosition},
    pipeline::{
        dispatcher::Dispatcher,
        sinks,
        sources::{CdcStream, Source, SourceError},
        stores::{file::FileStore, store::StoreHandle, PositionKey, PositionStore},
        PipelineError,
    },
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineState {
    Idle,
    Connecting,
    Streaming,
    Reconnecting,
    Draining,
    Stopped,
}

impl fmt::Display for PipelineState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            PipelineState::Idle => "idle",
            PipelineState::Connecting => "connecting",
            PipelineState::Streaming => "streaming",
            PipelineState::Reconnecting => "reconnecting",
            PipelineState::Draining => "draining",
            PipelineState::Stopped => "stopped",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone)]
pub struct PipelineOptions {
    pub position_key: PositionKey,
    pub scheme: OffsetScheme,
    pub offset_prefix: Option<String>,
    pub refresh_from_start: bool,
    /// Connection attempts per (re)connect, counting the first.
    pub reconnect_attempts: usize,
    pub reconnect_delay: Duration,
    pub drain_timeout: Duration,
}

impl PipelineOptions {
    pub fn new(position_key: PositionKey) -> Self {
        PipelineOptions {
            position_key,
            scheme: OffsetScheme::default(),
            offset_prefix: None,
            refresh_from_start: false,
            reconnect_attempts: 3,
            reconnect_delay: Duration::from_secs(1),
            drain_timeout: Duration::from_secs(30),
        }
    }

    pub fn from_config(source: &SourceConfig, dispatcher: &DispatcherConfig) -> Self {
        PipelineOptions {
            position_key: source.position_key(),
            scheme: source.offset_scheme,
            offset_prefix: source.offset_prefix().map(str::to_string),
            refresh_from_start: source.refresh_from_start,
            reconnect_attempts: source.reconnect_attempts,
            reconnect_delay: source.reconnect_delay(),
            drain_timeout: dispatcher.drain_timeout(),
        }
    }
}

pub struct DataPipeline<Src: Source> {
    source: Src,
    dispatcher: Dispatcher,
    store_handle: StoreHandle,
    options: PipelineOptions,
    state: watch::Sender<PipelineState>,
    shutdown: CancellationToken,
}

impl<Src: Source> DataPipeline<Src> {
    pub fn new(
        source: Src,
        dispatcher: Dispatcher,
        store_handle: StoreHandle,
        options: PipelineOptions,
    ) -> Self {
        let (state, _) = watch::channel(PipelineState::Idle);
        DataPipeline {
            source,
            dispatcher,
            store_handle,
            options,
            state,
            shutdown: CancellationToken::new(),
        }
    }

    /// Builds the pipeline described by `settings`, keeping positions in a
    /// [`FileStore`] under `store.root`.
    pub async fn from_settings(settings: &Settings, source: Src) -> Result<Self, PipelineError> {
        let store = Arc::new(FileStore::new(settings.store.root.clone()));
        Self::with_store(settings, source, store).await
    }

    pub async fn with_store(
        settings: &Settings,
        source: Src,
        store: Arc<dyn PositionStore>,
    ) -> Result<Self, PipelineError> {
        settings.validate()?;
        let options = PipelineOptions::from_config(&settings.source, &settings.dispatcher);
        let store_handle = StoreHandle::new(store, options.scheme);

        let mut dispatcher = Dispatcher::new(
            store_handle.clone(),
            options.position_key.clone(),
            options.scheme,
            settings.source.table_filter(),
            settings.dispatcher.max_in_flight,
        );
        for sink_config in &settings.sinks {
            let sink = sinks::from_config(sink_config).await?;
            dispatcher.add_route(
                sink_config.key.as_str(),
                sink,
                sink_config.batch_config(),
                sink_config.routed_tables(),
            );
        }

        Ok(DataPipeline::new(source, dispatcher, store_handle, options))
    }

    pub fn state(&self) -> watch::Receiver<PipelineState> {
        self.state.subscribe()
    }

    /// Cancelling the token makes `run` drain and return.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    pub fn in_flight(&self) -> usize {
        self.dispatcher.in_flight()
    }

    pub fn dispatcher(&self) -> &Dispatcher {
        &self.dispatcher
    }

    fn set_state(&self, state: PipelineState) {
        let previous = self.state.send_replace(state);
        if previous != state {
            info!(from = %previous, to = %state, "pipeline state changed");
        }
    }

    pub async fn run(&mut self) -> Result<(), PipelineError> {
        let res = self.main_loop().await;

        if let Err(e) = &res {
            error!(error = %e, "main loop exited with error");
        }

        self.set_state(PipelineState::Draining);
        let drained = self.dispatcher.shutdown(self.options.drain_timeout).await;
        info!(drained, "stopped dispatcher");

        let res = match (res, self.dispatcher.take_fatal()) {
            (Ok(()), Some(e)) => Err(e.into()),
            (res, _) => res,
        };

        self.set_state(PipelineState::Stopped);
        res
    }

    async fn main_loop(&mut self) -> Result<(), PipelineError> {
        let fatal = self.dispatcher.fatal_token();
        let Some(mut stream) = self.connect(PipelineState::Connecting).await? else {
            return Ok(());
        };

        loop {
            let next = tokio::select! {
                biased;
                _ = self.shutdown.cancelled() => {
                    info!("shutdown requested");
                    return Ok(());
                }
                _ = fatal.cancelled() => return self.fatal_error(),
                next = stream.next() => next,
            };

            match next {
                Some(Ok(event)) => {
                    tokio::select! {
                        biased;
                        _ = self.shutdown.cancelled() => {
                            info!("shutdown requested while waiting for dispatch capacity");
                            return Ok(());
                        }
                        _ = fatal.cancelled() => return self.fatal_error(),
                        res = self.dispatcher.dispatch(event) => {
                            res?;
                        }
                    }
                }
                Some(Err(SourceError::InvalidEvent(e))) => {
                    error!(error = %e, "skipping event that cannot be decoded");
                }
                Some(Err(e)) if e.is_transient() => {
                    warn!(error = %e, "replication stream interrupted");
                    drop(stream);
                    stream = match self.connect(PipelineState::Reconnecting).await? {
                        Some(stream) => stream,
                        None => return Ok(()),
                    };
                }
                Some(Err(e)) => return Err(e.into()),
                None => {
                    info!("replication stream ended");
                    return Ok(());
                }
            }
        }
    }

    fn fatal_error(&self) -> Result<(), PipelineError> {
        match self.dispatcher.take_fatal() {
            Some(e) => Err(e.into()),
            None => Ok(()),
        }
    }

    async fn start_position(
        store_handle: &StoreHandle,
        options: &PipelineOptions,
    ) -> Result<StartPosition, PipelineError> {
        let stored = store_handle
            .get_latest_committed(&options.position_key)
            .await?;
        Ok(StartPosition::resolve(
            stored,
            options.offset_prefix.as_deref(),
            options.refresh_from_start,
        )?)
    }

    /// Opens a stream from the last committed offset. `None` means shutdown
    /// was requested while connecting.
    async fn connect(&mut self, state: PipelineState) -> Result<Option<CdcStream>, PipelineError> {
        self.set_state(state);
        let start = Self::start_position(&self.store_handle, &self.options).await?;

        let mut delays = ConstantBuilder::default()
            .with_delay(self.options.reconnect_delay)
            .with_max_times(self.options.reconnect_attempts.saturating_sub(1))
            .build();
        let mut attempts = 0;

        loop {
            attempts += 1;
            let res = match self.source.connect().await {
                Ok(()) => self.source.get_cdc_stream(&start).await,
                Err(e) => Err(e),
            };

            let e: SourceError = match res {
                Ok(stream) => {
                    info!(%start, attempts, "streaming from upstream");
                    self.set_state(PipelineState::Streaming);
                    return Ok(Some(stream));
                }
                Err(e) if e.is_transient() => e,
                Err(e) => return Err(e.into()),
            };

            let Some(delay) = delays.next() else {
                error!(attempts, error = %e, "giving up on upstream");
                return Err(PipelineError::ConnectionExhausted {
                    attempts,
                    source: e,
                });
            };
            warn!(attempts, error = %e, "connect failed, retrying in {delay:?}");

            tokio::select! {
                _ = self.shutdown.cancelled() => return Ok(None),
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }
}
