//! Per-symbol ingestion.
//!
//! Each symbol has a connection slot, an unbounded producer queue and a single
//! consumer task. The consumer monotonizes timestamps, fans ticks out to live
//! subscribers and batches them into the pending-write queue, which is flushed
//! to the store on a size threshold or a timer.

use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicU64, AtomicUsize, Ordering},
        Arc,
    },
};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tokio::{
    sync::{broadcast, mpsc, MutexGuard},
    task::JoinHandle,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::{
    alert::{report, OperatorAlert},
    config::IngestConfig,
    error::{Result, TickHubError},
    models::{parse_timestamp, InitRequest, Quotation, TickRequest},
    storage::QuotationSink,
};

use super::{
    connection::{monotonize, ConnectionEvent, ConnectionState, DeInitSummary, SymbolStatus},
    pending::PendingWrites,
};

struct ConsumerHandle {
    tx: mpsc::UnboundedSender<TickRequest>,
    task: JoinHandle<()>,
}

struct SymbolChannel {
    symbol: String,
    /// Held for the whole of an `Init` or `DeInit`.
    slot: tokio::sync::Mutex<()>,
    last_known: Mutex<Option<Quotation>>,
    ticks: AtomicU64,
    feed: Mutex<Option<ConsumerHandle>>,
}

impl SymbolChannel {
    fn new(symbol: String) -> Self {
        Self {
            symbol,
            slot: tokio::sync::Mutex::new(()),
            last_known: Mutex::new(None),
            ticks: AtomicU64::new(0),
            feed: Mutex::new(None),
        }
    }

    fn state(&self) -> ConnectionState {
        if self.last_known.lock().is_some() {
            ConnectionState::Connected
        } else {
            ConnectionState::Disconnected
        }
    }
}

pub struct IngestionPipeline {
    config: IngestConfig,
    channels: HashMap<String, SymbolChannel>,
    pending: PendingWrites,
    sink: Arc<dyn QuotationSink>,
    alert: Arc<dyn OperatorAlert>,
    live_tx: broadcast::Sender<Quotation>,
    events_tx: broadcast::Sender<ConnectionEvent>,
    /// Keeps batches reaching the store in the order they were drained.
    flush_gate: tokio::sync::Mutex<()>,
    flushed_rows: AtomicUsize,
    flushes: AtomicUsize,
    /// First persistence failure. Once set, ingestion is halted.
    fault: Mutex<Option<String>>,
    faulted: CancellationToken,
    cancel: CancellationToken,
}

impl IngestionPipeline {
    /// Build the pipeline and start its periodic flush timer.
    pub fn spawn(
        config: IngestConfig,
        symbols: &[String],
        sink: Arc<dyn QuotationSink>,
        alert: Arc<dyn OperatorAlert>,
        cancel: CancellationToken,
    ) -> Arc<Self> {
        let (live_tx, _) = broadcast::channel(4096);
        let (events_tx, _) = broadcast::channel(256);

        let channels = symbols
            .iter()
            .map(|s| (s.to_uppercase(), SymbolChannel::new(s.to_uppercase())))
            .collect();

        let pipeline = Arc::new(Self {
            config,
            channels,
            pending: PendingWrites::new(),
            sink,
            alert,
            live_tx,
            events_tx,
            flush_gate: tokio::sync::Mutex::new(()),
            flushed_rows: AtomicUsize::new(0),
            flushes: AtomicUsize::new(0),
            fault: Mutex::new(None),
            faulted: CancellationToken::new(),
            cancel,
        });

        tokio::spawn(pipeline.clone().run_flush_timer());

        info!(
            symbols = pipeline.channels.len(),
            batch_size = pipeline.config.batch_size,
            flush_interval_secs = pipeline.config.flush_interval_secs,
            "📥 Ingestion pipeline started"
        );
        pipeline
    }

    pub fn subscribe_live(&self) -> broadcast::Receiver<Quotation> {
        self.live_tx.subscribe()
    }

    pub fn live_subscribers(&self) -> usize {
        self.live_tx.receiver_count()
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<ConnectionEvent> {
        self.events_tx.subscribe()
    }

    /// Not-yet-persisted quotations, oldest first.
    pub fn buffered(&self) -> Vec<Quotation> {
        self.pending.snapshot()
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    pub fn flushed_rows(&self) -> usize {
        self.flushed_rows.load(Ordering::Relaxed)
    }

    pub fn flushes(&self) -> usize {
        self.flushes.load(Ordering::Relaxed)
    }

    /// Why ingestion halted, if it has.
    pub fn fault_reason(&self) -> Option<String> {
        self.fault.lock().clone()
    }

    pub fn is_faulted(&self) -> bool {
        self.faulted.is_cancelled()
    }

    /// Cancelled when a persistence failure halts ingestion.
    pub fn fault_token(&self) -> CancellationToken {
        self.faulted.clone()
    }

    fn halt(&self, err: &TickHubError) {
        let mut fault = self.fault.lock();
        if fault.is_none() {
            *fault = Some(err.to_string());
            self.faulted.cancel();
            report(self.alert.as_ref(), "flush failed, ingestion halted", err);
            error!(pending = self.pending.len(), "🛑 Pending quotations kept in memory until restart");
        }
    }

    fn ensure_running(&self) -> Result<()> {
        match self.fault.lock().as_ref() {
            Some(reason) => Err(TickHubError::Persistence(format!("ingestion halted: {reason}"))),
            None => Ok(()),
        }
    }

    pub fn connection_state(&self, symbol: &str) -> Result<ConnectionState> {
        Ok(self.channel(symbol)?.state())
    }

    pub fn status(&self) -> Vec<SymbolStatus> {
        let mut out: Vec<SymbolStatus> = self
            .channels
            .values()
            .map(|c| SymbolStatus {
                symbol: c.symbol.clone(),
                state: c.state(),
                ticks: c.ticks.load(Ordering::Relaxed),
                last_known: c.last_known.lock().as_ref().map(Quotation::to_record),
            })
            .collect();
        out.sort_by(|a, b| a.symbol.cmp(&b.symbol));
        out
    }

    fn channel(&self, symbol: &str) -> Result<&SymbolChannel> {
        self.channels
            .get(&symbol.to_uppercase())
            .ok_or_else(|| TickHubError::UnknownSymbol(symbol.to_string()))
    }

    /// Poll the slot until it frees, giving up after the configured retries.
    async fn acquire_slot<'a>(&self, channel: &'a SymbolChannel) -> Result<MutexGuard<'a, ()>> {
        let max_retries = self.config.init_max_retries;
        let mut attempt = 0;
        loop {
            if let Ok(guard) = channel.slot.try_lock() {
                return Ok(guard);
            }
            if attempt >= max_retries {
                return Err(TickHubError::Timeout {
                    symbol: channel.symbol.clone(),
                    attempts: max_retries,
                });
            }
            attempt += 1;
            debug!(symbol = %channel.symbol, attempt, "Connection slot busy, retrying");
            tokio::time::sleep(self.config.init_retry_delay()).await;
        }
    }

    /// Accept a producer for `req.symbol` and start its consumer.
    pub async fn init(self: &Arc<Self>, req: InitRequest) -> Result<()> {
        self.ensure_running()?;
        let channel = self.channel(&req.symbol)?;
        let timestamp = monotonize(parse_timestamp(&req.datetime)?, None)?;
        let _slot = self.acquire_slot(channel).await?;

        let first = Quotation::new(req.id, channel.symbol.clone(), timestamp, req.ask, req.bid);
        {
            let mut last_known = channel.last_known.lock();
            if let Some(existing) = last_known.as_ref() {
                return Err(TickHubError::ConnectionConflict(format!(
                    "{} already has a producer (last tick {})",
                    channel.symbol, existing.timestamp_utc
                )));
            }
            *last_known = Some(first.clone());
        }
        channel.ticks.store(0, Ordering::Relaxed);

        let (tx, rx) = mpsc::unbounded_channel();
        let task = tokio::spawn(self.clone().run_consumer(channel.symbol.clone(), rx, timestamp));
        if let Some(stale) = channel.feed.lock().replace(ConsumerHandle { tx, task }) {
            stale.task.abort();
        }

        info!(symbol = %channel.symbol, origin = %req.origin, first = %timestamp, "🔌 Producer connected");
        let _ = self.events_tx.send(ConnectionEvent::Connected {
            symbol: channel.symbol.clone(),
            origin: req.origin,
            first,
        });
        Ok(())
    }

    /// Queue a raw tick for the symbol's consumer. Never waits.
    pub fn tick(&self, req: TickRequest) -> Result<()> {
        self.ensure_running()?;
        let channel = self.channel(&req.symbol)?;
        let feed = channel.feed.lock();
        let sender = feed
            .as_ref()
            .ok_or_else(|| TickHubError::NotConnected(channel.symbol.clone()))?;
        sender
            .tx
            .send(req)
            .map_err(|_| TickHubError::NotConnected(channel.symbol.clone()))
    }

    /// Stop the symbol's producer: drain its queue, flush, and free the slot.
    pub async fn deinit(&self, symbol: &str, reason: i32) -> Result<DeInitSummary> {
        let channel = self.channel(symbol)?;
        let _slot = channel.slot.lock().await;

        let handle = channel.feed.lock().take();
        let Some(ConsumerHandle { tx, task }) = handle else {
            return Err(TickHubError::NotConnected(channel.symbol.clone()));
        };
        drop(tx);
        let drained = task.await;

        // The slot is released even if the consumer died or the last flush fails
        let flushed = match drained {
            Ok(()) => self.flush().await,
            Err(e) => Err(TickHubError::Persistence(format!(
                "{} consumer stopped abnormally: {e}",
                channel.symbol
            ))),
        };
        *channel.last_known.lock() = None;
        let ticks = channel.ticks.swap(0, Ordering::Relaxed);
        let flushed = flushed?;

        info!(symbol = %channel.symbol, reason, ticks, flushed, "🔌 Producer disconnected");
        let _ = self.events_tx.send(ConnectionEvent::Disconnected {
            symbol: channel.symbol.clone(),
            reason,
            ticks,
        });

        Ok(DeInitSummary {
            symbol: channel.symbol.clone(),
            reason,
            ticks,
            flushed,
        })
    }

    /// Hand everything pending to the store.
    ///
    /// A failed write puts the batch back at the front of the queue and halts
    /// ingestion: `Init` and `Tick` are refused from then on and every later
    /// flush fails, so nothing accepted is discarded.
    pub async fn flush(&self) -> Result<usize> {
        let _gate = self.flush_gate.lock().await;
        self.ensure_running()?;
        let batch = self.pending.drain();
        if batch.is_empty() {
            return Ok(0);
        }

        let expected = batch.len();
        let failure = match self.sink.save_quotations(batch.clone()).await {
            Ok(written) if written == expected => None,
            Ok(written) => Some(TickHubError::Persistence(format!(
                "flush wrote {written} of {expected} quotations"
            ))),
            Err(e) => Some(e),
        };
        if let Some(err) = failure {
            self.pending.requeue_front(batch);
            self.halt(&err);
            return Err(err);
        }
        let written = expected;

        self.flushed_rows.fetch_add(written, Ordering::Relaxed);
        self.flushes.fetch_add(1, Ordering::Relaxed);
        debug!(rows = written, "💾 Flushed pending quotations");
        Ok(written)
    }

    async fn run_consumer(
        self: Arc<Self>,
        symbol: String,
        mut rx: mpsc::UnboundedReceiver<TickRequest>,
        mut last: DateTime<Utc>,
    ) {
        loop {
            tokio::select! {
                raw = rx.recv() => match raw {
                    Some(raw) => self.process_tick(&symbol, raw, &mut last).await,
                    None => break,
                },
                _ = self.cancel.cancelled() => {
                    rx.close();
                    while let Some(raw) = rx.recv().await {
                        self.process_tick(&symbol, raw, &mut last).await;
                    }
                    if let Err(e) = self.flush().await {
                        warn!(symbol = %symbol, error = %e, "Final flush on shutdown failed");
                    }
                    break;
                }
            }
        }
        debug!(symbol = %symbol, "Consumer stopped");
    }

    async fn process_tick(&self, symbol: &str, raw: TickRequest, last: &mut DateTime<Utc>) {
        let parsed = match parse_timestamp(&raw.datetime) {
            Ok(ts) => ts,
            Err(e) => {
                report(self.alert.as_ref(), "dropping tick with bad timestamp", &e);
                return;
            }
        };
        let timestamp = match monotonize(parsed, Some(*last)) {
            Ok(ts) => ts,
            Err(e) => {
                report(self.alert.as_ref(), "dropping tick past the last representable time", &e);
                return;
            }
        };
        *last = timestamp;

        let quotation = Quotation::new(raw.id, symbol, timestamp, raw.ask, raw.bid);
        if let Ok(channel) = self.channel(symbol) {
            channel.ticks.fetch_add(1, Ordering::Relaxed);
            *channel.last_known.lock() = Some(quotation.clone());
        }

        // No live subscribers is fine
        let _ = self.live_tx.send(quotation.clone());

        if self.pending.append(quotation) >= self.config.batch_size && !self.is_faulted() {
            if let Err(e) = self.flush().await {
                error!(symbol = %symbol, error = %e, "Batch flush failed");
            }
        }
    }

    async fn run_flush_timer(self: Arc<Self>) {
        let mut interval = tokio::time::interval(self.config.flush_interval());
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // First tick completes immediately
        interval.tick().await;

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    if self.is_faulted() {
                        continue;
                    }
                    if let Err(e) = self.flush().await {
                        error!(error = %e, "Periodic flush failed");
                    }
                }
                _ = self.cancel.cancelled() => {
                    if let Err(e) = self.flush().await {
                        warn!(error = %e, "Final flush on shutdown failed");
                    }
                    break;
                }
            }
        }
        info!(flushed_rows = self.flushed_rows(), "Flush timer stopped");
    }
}
