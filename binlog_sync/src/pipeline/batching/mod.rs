use std::{
    sync::{Arc, Mutex},
    time::Duration,
};

use tokio::{
    sync::{mpsc, oneshot, Notify},
    time::{Instant, MissedTickBehavior},
};
use tokio_util::{sync::CancellationToken, task::TaskTracker};
use tracing::{debug, error, info, warn};

use crate::conversions::change_event::ChangeEvent;

use super::sinks::{Sink, SinkError};

/// Interval at which a failed batch is retried when no time trigger is set.
const RETRY_INTERVAL: Duration = Duration::from_secs(1);

#[derive(Debug, Clone)]
pub struct BatchConfig {
    max_batch_size: usize,
    max_pending: usize,
    tick: Option<Duration>,
}

impl BatchConfig {
    pub fn new(max_batch_size: usize) -> BatchConfig {
        let max_batch_size = max_batch_size.max(1);
        BatchConfig {
            max_batch_size,
            max_pending: max_batch_size.saturating_mul(10),
            tick: None,
        }
    }

    /// Enables the time trigger. A zero duration leaves it disabled.
    pub fn with_tick(mut self, tick: Duration) -> BatchConfig {
        self.tick = (!tick.is_zero()).then_some(tick);
        self
    }

    pub fn with_max_pending(mut self, max_pending: usize) -> BatchConfig {
        self.max_pending = max_pending.max(self.max_batch_size);
        self
    }

    pub fn max_batch_size(&self) -> usize {
        self.max_batch_size
    }

    pub fn max_pending(&self) -> usize {
        self.max_pending
    }

    pub fn tick(&self) -> Option<Duration> {
        self.tick
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct BufferStats {
    pub pending: usize,
    pub flushes: u64,
    pub failed_flushes: u64,
    pub last_flush: Option<Instant>,
}

/// Resolves once every event of one dispatch unit has been written by the
/// destination, or fails if the buffer gave up on them.
#[must_use = "a ticket does nothing unless awaited"]
pub struct FlushTicket {
    destination: Arc<str>,
    ack: oneshot::Receiver<()>,
}

impl FlushTicket {
    pub fn destination(&self) -> &str {
        &self.destination
    }

    pub async fn wait(self) -> Result<(), SinkError> {
        self.ack
            .await
            .map_err(|_| SinkError::Abandoned(self.destination.to_string()))
    }
}

struct Pending {
    events: Vec<Arc<ChangeEvent>>,
    ack: oneshot::Sender<()>,
}

/// Per-destination accumulator in front of a [`Sink`].
///
/// Events are appended in submission order by a single worker task, which
/// flushes the whole buffer when it reaches `max_batch_size` events or when
/// the tick fires. The buffer is only cleared after a successful write; a
/// failed batch stays put and is retried on the next trigger. While a flush
/// is running the worker does not take new events, and once `max_pending`
/// events are held it stops accepting until a flush succeeds.
/// [`SinkBuffer::request_flush`] flushes a partial batch on demand.
pub struct SinkBuffer {
    destination: Arc<str>,
    sender: Mutex<Option<mpsc::UnboundedSender<Pending>>>,
    flush_requested: Arc<Notify>,
    stats: Arc<Mutex<BufferStats>>,
}

impl SinkBuffer {
    /// Starts the buffer worker on `tracker`. `abort` makes the worker give
    /// up on whatever it still holds.
    pub fn spawn(
        destination: impl Into<Arc<str>>,
        sink: Arc<dyn Sink>,
        config: BatchConfig,
        tracker: &TaskTracker,
        abort: CancellationToken,
    ) -> SinkBuffer {
        let destination = destination.into();
        let (sender, receiver) = mpsc::unbounded_channel();
        let stats = Arc::new(Mutex::new(BufferStats::default()));
        let flush_requested = Arc::new(Notify::new());

        let worker = BufferWorker {
            destination: destination.clone(),
            sink,
            config,
            receiver,
            pending: Vec::new(),
            buffered: 0,
            failing: false,
            flush_requested: flush_requested.clone(),
            stats: stats.clone(),
            abort,
        };
        tracker.spawn(worker.run());

        SinkBuffer {
            destination,
            sender: Mutex::new(Some(sender)),
            flush_requested,
            stats,
        }
    }

    pub fn destination(&self) -> &str {
        &self.destination
    }

    /// Queues the events of one dispatch unit. Never waits on the sink.
    pub fn enqueue(&self, events: Vec<Arc<ChangeEvent>>) -> Result<FlushTicket, SinkError> {
        let (ack, rx) = oneshot::channel();
        let guard = self.sender.lock().unwrap();
        let sender = guard
            .as_ref()
            .ok_or_else(|| SinkError::Closed(self.destination.to_string()))?;
        sender
            .send(Pending { events, ack })
            .map_err(|_| SinkError::Closed(self.destination.to_string()))?;
        Ok(FlushTicket {
            destination: self.destination.clone(),
            ack: rx,
        })
    }

    /// Asks the worker to flush whatever it holds once the events queued so
    /// far are buffered, without waiting for a trigger.
    pub fn request_flush(&self) {
        self.flush_requested.notify_one();
    }

    /// Stops accepting events. The worker flushes what it holds, retrying
    /// until the write succeeds or the abort token fires, and exits.
    pub fn close(&self) {
        self.sender.lock().unwrap().take();
    }

    pub fn stats(&self) -> BufferStats {
        *self.stats.lock().unwrap()
    }
}

struct BufferWorker {
    destination: Arc<str>,
    sink: Arc<dyn Sink>,
    config: BatchConfig,
    receiver: mpsc::UnboundedReceiver<Pending>,
    pending: Vec<Pending>,
    buffered: usize,
    failing: bool,
    flush_requested: Arc<Notify>,
    stats: Arc<Mutex<BufferStats>>,
    abort: CancellationToken,
}

impl BufferWorker {
    async fn run(mut self) {
        let period = self.config.tick.unwrap_or(RETRY_INTERVAL);
        let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            let accepting = self.buffered < self.config.max_pending;
            tokio::select! {
                biased;
                _ = self.abort.cancelled() => {
                    warn!(
                        destination = %self.destination,
                        pending = self.buffered,
                        "buffer aborted with unflushed events"
                    );
                    return;
                }
                msg = self.receiver.recv(), if accepting => match msg {
                    Some(pending) => {
                        self.buffered += pending.events.len();
                        self.pending.push(pending);
                        self.update_pending();
                        if self.buffered >= self.config.max_batch_size {
                            let _ = self.flush().await;
                        }
                    }
                    None => break,
                },
                _ = self.flush_requested.notified() => {
                    debug!(
                        destination = %self.destination,
                        pending = self.buffered,
                        "flush requested"
                    );
                    let _ = self.flush().await;
                }
                _ = ticker.tick() => {
                    if self.config.tick.is_some() || self.failing {
                        let _ = self.flush().await;
                    }
                }
            }
        }

        while self.flush().await.is_err() {
            tokio::select! {
                biased;
                _ = self.abort.cancelled() => {
                    warn!(
                        destination = %self.destination,
                        pending = self.buffered,
                        "buffer aborted with unflushed events"
                    );
                    return;
                }
                _ = ticker.tick() => {}
            }
        }
        if let Err(e) = self.sink.flush().await {
            error!(destination = %self.destination, error = %e, "sink flush failed on shutdown");
        }
        info!(destination = %self.destination, "buffer stopped");
    }

    async fn flush(&mut self) -> Result<usize, SinkError> {
        if self.pending.is_empty() {
            return Ok(0);
        }

        let batch: Vec<Arc<ChangeEvent>> = self
            .pending
            .iter()
            .flat_map(|p| p.events.iter().cloned())
            .collect();
        let batch_size = batch.len();

        let result = match self.sink.write(&batch).await {
            Ok(0) => Err(SinkError::NoRowsAffected { batch_size }),
            other => other,
        };

        match result {
            Ok(affected) => {
                for pending in self.pending.drain(..) {
                    let _ = pending.ack.send(());
                }
                self.buffered = 0;
                self.failing = false;
                let mut stats = self.stats.lock().unwrap();
                stats.pending = 0;
                stats.flushes += 1;
                stats.last_flush = Some(Instant::now());
                debug!(
                    destination = %self.destination,
                    batch_size,
                    affected,
                    "flushed batch"
                );
                Ok(batch_size)
            }
            Err(e) => {
                self.failing = true;
                self.stats.lock().unwrap().failed_flushes += 1;
                error!(
                    destination = %self.destination,
                    batch_size,
                    error = %e,
                    "flush failed, batch kept for retry"
                );
                Err(e)
            }
        }
    }

    fn update_pending(&self) {
        self.stats.lock().unwrap().pending = self.buffered;
    }
}
