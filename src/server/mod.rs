//! DataProvider streaming server
//!
//! Serves historical, buffered and live quotations over a websocket and the
//! per-symbol ingestion calls over HTTP. Binding failures and transport errors
//! are retried with linear backoff; once the retry ceiling is hit the service
//! is marked faulted for the rest of the process lifetime.

pub mod dispatch;
pub mod routes;

use std::{
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
    time::Duration,
};

use serde::Serialize;
use tokio::{net::TcpListener, sync::watch, task::JoinHandle};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::{
    alert::{report, OperatorAlert},
    cache::HourlyQuotationCache,
    config::ServerConfig,
    error::{Result, TickHubError},
    ingest::IngestionPipeline,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ServiceState {
    /// Not yet bound, or rebinding after a transport failure
    Starting,
    Activated,
    /// A dispatch branch hit an internal error
    Unknown,
    /// Restart ceiling exhausted
    Faulted,
}

/// Service activation plus attached-client accounting.
pub struct ServiceStatus {
    state: watch::Sender<ServiceState>,
    clients: AtomicUsize,
}

impl Default for ServiceStatus {
    fn default() -> Self {
        Self::new()
    }
}

impl ServiceStatus {
    pub fn new() -> Self {
        let (state, _) = watch::channel(ServiceState::Starting);
        Self {
            state,
            clients: AtomicUsize::new(0),
        }
    }

    pub fn state(&self) -> ServiceState {
        *self.state.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<ServiceState> {
        self.state.subscribe()
    }

    /// `Unknown` and `Faulted` are terminal; nothing moves the service out of them.
    fn transition(&self, next: ServiceState) {
        self.state.send_if_modified(|current| {
            let terminal = matches!(current, ServiceState::Unknown | ServiceState::Faulted);
            if *current == next || (terminal && next != ServiceState::Faulted) {
                return false;
            }
            *current = next;
            true
        });
    }

    pub fn mark_starting(&self) {
        self.transition(ServiceState::Starting);
    }

    pub fn mark_activated(&self) {
        self.transition(ServiceState::Activated);
    }

    pub fn mark_unknown(&self) {
        self.transition(ServiceState::Unknown);
    }

    pub fn mark_faulted(&self) {
        self.transition(ServiceState::Faulted);
    }

    pub fn accepts_requests(&self) -> bool {
        !matches!(self.state(), ServiceState::Unknown | ServiceState::Faulted)
    }

    pub fn clients(&self) -> usize {
        self.clients.load(Ordering::SeqCst)
    }

    pub fn client_connected(&self) -> bool {
        self.clients() > 0
    }

    /// Mark the service unknown as soon as ingestion halts on a persistence
    /// failure. The watcher exits quietly on shutdown.
    pub fn follow_ingestion(
        self: &Arc<Self>,
        faulted: CancellationToken,
        cancel: CancellationToken,
    ) -> JoinHandle<()> {
        let status = self.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = faulted.cancelled() => {
                    status.mark_unknown();
                    error!("❌ Ingestion halted, DataProvider stops serving");
                }
                _ = cancel.cancelled() => {}
            }
        })
    }

    /// Count a client as attached until the guard drops.
    pub fn attach(self: &Arc<Self>) -> ClientGuard {
        self.clients.fetch_add(1, Ordering::SeqCst);
        ClientGuard {
            status: self.clone(),
        }
    }
}

pub struct ClientGuard {
    status: Arc<ServiceStatus>,
}

impl Drop for ClientGuard {
    fn drop(&mut self) {
        self.status.clients.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Shared handler state
#[derive(Clone)]
pub struct AppState {
    pub cache: Arc<HourlyQuotationCache>,
    pub pipeline: Arc<IngestionPipeline>,
    pub status: Arc<ServiceStatus>,
    pub alert: Arc<dyn OperatorAlert>,
    pub cancel: CancellationToken,
}

/// Attempt `n` waits `unit * n`.
pub fn backoff_delay(unit: Duration, attempt: u32) -> Duration {
    unit.saturating_mul(attempt)
}

pub struct StreamingServer {
    bind_addr: String,
    config: ServerConfig,
    state: AppState,
}

impl StreamingServer {
    pub fn new(bind_addr: impl Into<String>, config: ServerConfig, state: AppState) -> Self {
        Self {
            bind_addr: bind_addr.into(),
            config,
            state,
        }
    }

    pub fn status(&self) -> Arc<ServiceStatus> {
        self.state.status.clone()
    }

    /// Serve until cancelled. Returns `Transport` once the restart ceiling is exhausted.
    pub async fn run(&self) -> Result<()> {
        let cancel = self.state.cancel.clone();
        let mut attempt: u32 = 0;
        let _watcher = AbortOnDrop(
            self.state
                .status
                .follow_ingestion(self.state.pipeline.fault_token(), cancel.clone()),
        );

        loop {
            let err = match self.serve_once().await {
                Ok(()) => {
                    info!("DataProvider stopped");
                    return Ok(());
                }
                Err(e) => e,
            };
            report(self.state.alert.as_ref(), "DataProvider transport failure", &err);
            if cancel.is_cancelled() {
                return Ok(());
            }

            attempt += 1;
            if attempt > self.config.max_retries {
                self.state.status.mark_faulted();
                error!(
                    attempts = attempt - 1,
                    "❌ DataProvider restart ceiling reached, service faulted"
                );
                return Err(TickHubError::Transport(format!(
                    "gave up after {} restarts: {err}",
                    self.config.max_retries
                )));
            }

            self.state.status.mark_starting();
            let delay = backoff_delay(self.config.backoff_unit(), attempt);
            warn!(
                attempt,
                max_retries = self.config.max_retries,
                delay_ms = delay.as_millis() as u64,
                "🔄 Restarting DataProvider"
            );
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = cancel.cancelled() => return Ok(()),
            }
        }
    }

    async fn serve_once(&self) -> Result<()> {
        let listener = TcpListener::bind(&self.bind_addr)
            .await
            .map_err(|e| TickHubError::Transport(format!("bind {}: {e}", self.bind_addr)))?;

        self.state.status.mark_activated();
        info!("🎯 DataProvider listening on {}", self.bind_addr);

        let app = routes::router(self.state.clone());
        let cancel = self.state.cancel.clone();
        axum::serve(listener, app)
            .with_graceful_shutdown(async move { cancel.cancelled().await })
            .await
            .map_err(|e| TickHubError::Transport(e.to_string()))
    }
}

struct AbortOnDrop(JoinHandle<()>);

impl Drop for AbortOnDrop {
    fn drop(&mut self) {
        self.0.abort();
    }
}
