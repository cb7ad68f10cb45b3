//! Connection Orchestrator
//!
//! Serializes connection attempts across the whole process: BLE radios
//! handle one connection procedure at a time, so requests queue FIFO and a
//! single worker drains them. Duplicate requests for a device already
//! queued or in flight are rejected immediately rather than queued twice.

use std::collections::HashSet;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use tokio::sync::{mpsc, oneshot};
use tokio::time::sleep;
use tracing::{debug, info, warn};

use crate::domain::models::ConnectOutcome;
use crate::error::{BridgeError, ConcurrencyError};

/// What the radio is currently doing. Scanning and connecting are mutually
/// exclusive on every backend this crate targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RadioState {
    Idle,
    Scanning,
    Connecting,
}

/// The actual connect procedure, injected so the queueing discipline can be
/// tested without a radio.
pub type Connector = Arc<
    dyn Fn(String) -> Pin<Box<dyn Future<Output = Result<ConnectOutcome, BridgeError>> + Send>>
        + Send
        + Sync,
>;

struct ConnectRequest {
    device_id: String,
    reply: oneshot::Sender<Result<ConnectOutcome, BridgeError>>,
}

struct OrchestratorShared {
    /// Devices queued or currently connecting.
    pending: StdMutex<HashSet<String>>,
    radio: StdMutex<RadioState>,
}

/// FIFO connection queue with a single drain worker.
#[derive(Clone)]
pub struct ConnectionOrchestrator {
    shared: Arc<OrchestratorShared>,
    queue: mpsc::UnboundedSender<ConnectRequest>,
}

impl ConnectionOrchestrator {
    /// Spawn the worker. `settle_delay` is observed after each successful
    /// connection before the next attempt starts; radios misbehave when a
    /// new procedure begins while the previous link is still settling.
    pub fn new(connector: Connector, settle_delay: Duration) -> Self {
        let shared = Arc::new(OrchestratorShared {
            pending: StdMutex::new(HashSet::new()),
            radio: StdMutex::new(RadioState::Idle),
        });
        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(Self::worker(Arc::clone(&shared), rx, connector, settle_delay));
        Self { shared, queue: tx }
    }

    pub fn radio_state(&self) -> RadioState {
        *self.shared.radio.lock().unwrap()
    }

    pub fn set_radio_state(&self, state: RadioState) {
        *self.shared.radio.lock().unwrap() = state;
    }

    /// Queue a connection and wait for its outcome. Requests are processed
    /// strictly in arrival order, one at a time.
    pub async fn enqueue(&self, device_id: &str) -> Result<ConnectOutcome, BridgeError> {
        {
            let mut pending = self.shared.pending.lock().unwrap();
            if !pending.insert(device_id.to_string()) {
                return Err(ConcurrencyError::ConnectInProgress {
                    device_id: device_id.to_string(),
                }
                .into());
            }
        }

        let (reply_tx, reply_rx) = oneshot::channel();
        let request = ConnectRequest {
            device_id: device_id.to_string(),
            reply: reply_tx,
        };
        if self.queue.send(request).is_err() {
            self.shared.pending.lock().unwrap().remove(device_id);
            return Err(ConcurrencyError::RadioBusy.into());
        }

        debug!(device = device_id, "connection queued");
        match reply_rx.await {
            Ok(outcome) => outcome,
            Err(_) => {
                self.shared.pending.lock().unwrap().remove(device_id);
                Err(ConcurrencyError::RadioBusy.into())
            }
        }
    }

    pub fn is_pending(&self, device_id: &str) -> bool {
        self.shared.pending.lock().unwrap().contains(device_id)
    }

    async fn worker(
        shared: Arc<OrchestratorShared>,
        mut rx: mpsc::UnboundedReceiver<ConnectRequest>,
        connector: Connector,
        settle_delay: Duration,
    ) {
        while let Some(request) = rx.recv().await {
            *shared.radio.lock().unwrap() = RadioState::Connecting;
            info!(device = %request.device_id, "starting queued connection");

            let result = connector(request.device_id.clone()).await;
            let succeeded = result.is_ok();
            if let Err(err) = &result {
                warn!(device = %request.device_id, %err, "queued connection failed");
            }

            shared.pending.lock().unwrap().remove(&request.device_id);
            *shared.radio.lock().unwrap() = RadioState::Idle;
            // Requester may have given up waiting; that's fine.
            let _ = request.reply.send(result);

            if succeeded && !settle_delay.is_zero() {
                sleep(settle_delay).await;
            }
        }
    }
}
