//! Background store worker.
//!
//! Connection hooks must never wait on the datastore for writes, so they hand
//! commands to a bounded queue and return. A single loop drains the queue and
//! runs each command as its own task, with at most `max_inflight` commands
//! touching the store at once. Completed flows are classified here too, on
//! the blocking pool, so body decoding and sniffing never run on a
//! connection.
//!
//! ```text
//! hooks ──try_send──▶ [ bounded queue ] ──▶ worker loop ──spawn──▶ store call
//!   │                                                     (semaphore-bounded)
//!   └── queue full: command dropped, warn!
//! ```

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use sluice_core::{ArchivedExchange, Destination, FlowSnapshot};
use sluice_storage::{ArchiveStore, IgnoreHostStore};
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, oneshot, Semaphore};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Default queue capacity.
pub const DEFAULT_QUEUE_CAPACITY: usize = 1024;

/// Default number of concurrent store operations.
pub const DEFAULT_MAX_INFLIGHT: usize = 16;

/// A write for the worker to perform.
#[derive(Debug, Clone)]
pub enum StoreCommand {
    /// Interception of the destination was established at the given time.
    RecordSeen {
        destination: Destination,
        at: DateTime<Utc>,
    },
    /// Interception of the destination failed; forget its backoff state.
    Reset { destination: Destination },
    /// Classify a completed flow and append it to the archive.
    Archive(Box<FlowSnapshot>),
}

impl StoreCommand {
    fn kind(&self) -> &'static str {
        match self {
            Self::RecordSeen { .. } => "record_seen",
            Self::Reset { .. } => "reset",
            Self::Archive(_) => "archive",
        }
    }
}

/// Worker tuning.
#[derive(Debug, Clone, Copy)]
pub struct WorkerConfig {
    /// Commands buffered before new ones are dropped.
    pub queue_capacity: usize,
    /// Store operations allowed to run at the same time.
    pub max_inflight: usize,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            max_inflight: DEFAULT_MAX_INFLIGHT,
        }
    }
}

/// Cheap, cloneable sender side of the worker queue.
#[derive(Debug, Clone)]
pub struct StoreHandle {
    tx: mpsc::Sender<StoreCommand>,
    dropped: Arc<AtomicU64>,
}

impl StoreHandle {
    pub(crate) fn new(tx: mpsc::Sender<StoreCommand>) -> Self {
        Self {
            tx,
            dropped: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Enqueues a command without waiting.
    ///
    /// Returns false when the command was dropped because the queue is full
    /// or the worker has shut down.
    pub fn submit(&self, command: StoreCommand) -> bool {
        match self.tx.try_send(command) {
            Ok(()) => true,
            Err(TrySendError::Full(command)) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                warn!(
                    command = command.kind(),
                    capacity = self.tx.max_capacity(),
                    "Store queue full, dropping command"
                );
                false
            }
            Err(TrySendError::Closed(command)) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                debug!(
                    command = command.kind(),
                    "Store worker shut down, dropping command"
                );
                false
            }
        }
    }

    /// Enqueues a `record_seen` for the destination.
    pub fn record_seen(&self, destination: Destination, at: DateTime<Utc>) -> bool {
        self.submit(StoreCommand::RecordSeen { destination, at })
    }

    /// Enqueues a `reset` for the destination.
    pub fn reset(&self, destination: Destination) -> bool {
        self.submit(StoreCommand::Reset { destination })
    }

    /// Enqueues a completed flow for classification and archival.
    pub fn archive(&self, flow: FlowSnapshot) -> bool {
        self.submit(StoreCommand::Archive(Box::new(flow)))
    }

    /// Number of commands dropped so far.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Returns true once the worker stopped accepting commands.
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// Stores the worker writes to.
#[derive(Clone)]
pub struct WorkerStores {
    pub ignore_hosts: Arc<dyn IgnoreHostStore>,
    pub archive: Arc<dyn ArchiveStore>,
}

/// Owns the worker loop. Dropping it without calling
/// [`shutdown`](Self::shutdown) lets the loop drain in the background,
/// with nobody waiting for it.
pub struct StoreWorker {
    handle: StoreHandle,
    shutdown_tx: Mutex<Option<oneshot::Sender<()>>>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl StoreWorker {
    /// Spawns the worker loop on the current runtime.
    pub fn start(stores: WorkerStores, config: WorkerConfig) -> Self {
        let (tx, rx) = mpsc::channel(config.queue_capacity.max(1));
        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        let max_inflight = config.max_inflight.max(1);

        let task = tokio::spawn(run(rx, shutdown_rx, stores, max_inflight));

        info!(
            queue_capacity = config.queue_capacity,
            max_inflight, "Store worker started"
        );

        Self {
            handle: StoreHandle::new(tx),
            shutdown_tx: Mutex::new(Some(shutdown_tx)),
            task: Mutex::new(Some(task)),
        }
    }

    /// Returns a sender for the hooks.
    pub fn handle(&self) -> StoreHandle {
        self.handle.clone()
    }

    /// Stops accepting commands, runs everything already queued, and waits
    /// for in-flight operations. Calling it again is a no-op.
    pub async fn shutdown(&self) {
        if let Some(tx) = self.shutdown_tx.lock().take() {
            let _ = tx.send(());
        }

        let task = self.task.lock().take();
        if let Some(task) = task {
            if let Err(e) = task.await {
                error!(error = %e, "Store worker task failed");
            }
            info!(dropped = self.handle.dropped(), "Store worker stopped");
        }
    }

    /// Like [`shutdown`](Self::shutdown), giving up after `timeout`.
    ///
    /// Returns false if the queue did not drain in time.
    pub async fn shutdown_timeout(&self, timeout: Duration) -> bool {
        match tokio::time::timeout(timeout, self.shutdown()).await {
            Ok(()) => true,
            Err(_) => {
                warn!(?timeout, "Store queue did not drain before timeout");
                false
            }
        }
    }
}

async fn run(
    mut rx: mpsc::Receiver<StoreCommand>,
    mut shutdown_rx: oneshot::Receiver<()>,
    stores: WorkerStores,
    max_inflight: usize,
) {
    let permits = Arc::new(Semaphore::new(max_inflight));

    loop {
        tokio::select! {
            command = rx.recv() => match command {
                Some(command) => dispatch(command, &stores, &permits).await,
                None => break,
            },
            _ = &mut shutdown_rx => {
                // Refuse new commands but keep the ones already queued
                rx.close();
                break;
            }
        }
    }

    while let Some(command) = rx.recv().await {
        dispatch(command, &stores, &permits).await;
    }

    // Wait for in-flight operations
    let total = u32::try_from(max_inflight).unwrap_or(u32::MAX);
    if permits.acquire_many(total).await.is_err() {
        warn!("Store worker semaphore closed before drain");
    }
}

async fn dispatch(command: StoreCommand, stores: &WorkerStores, permits: &Arc<Semaphore>) {
    let Ok(permit) = permits.clone().acquire_owned().await else {
        return;
    };
    let stores = stores.clone();

    tokio::spawn(async move {
        execute(command, &stores).await;
        drop(permit);
    });
}

async fn execute(command: StoreCommand, stores: &WorkerStores) {
    match command {
        StoreCommand::RecordSeen { destination, at } => {
            match stores.ignore_hosts.record_seen(destination.as_str(), at).await {
                Ok(()) => debug!(address = %destination, "Recorded established interception"),
                Err(e) => error!(
                    address = %destination,
                    error = %e,
                    "Failed to record established interception"
                ),
            }
        }
        StoreCommand::Reset { destination } => {
            // Swallowed: a missing reset only delays the next probe
            if let Err(e) = stores.ignore_hosts.reset(destination.as_str()).await {
                debug!(address = %destination, error = %e, "Failed to reset ignore host");
            }
        }
        StoreCommand::Archive(flow) => {
            let exchange =
                match tokio::task::spawn_blocking(move || ArchivedExchange::from_flow(&flow)).await
                {
                    Ok(exchange) => exchange,
                    Err(e) => {
                        error!(error = %e, "Failed to classify exchange");
                        return;
                    }
                };

            match stores.archive.append(&exchange).await {
                Ok(id) => debug!(
                    id,
                    host = %exchange.host,
                    status = exchange.status_code,
                    request = %exchange.request_content_type,
                    response = %exchange.response_content_type,
                    "Archived exchange"
                ),
                Err(e) => error!(
                    host = %exchange.host,
                    path = %exchange.path,
                    error = %e,
                    "Failed to archive exchange"
                ),
            }
        }
    }
}
