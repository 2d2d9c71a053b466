use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::{mpsc, watch, Mutex as TokioMutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::error::DatabaseError;
use super::resume;
use super::state::{transition, Action, Input, Outcome, State};
use super::verifier::{self, Pass};
use super::DatabaseListener;
use crate::bitfield::SharedBitfield;
use crate::merkle::HashTree;
use crate::metadata::Metadata;
use crate::metainfo::{Info, ViewSignature};
use crate::pieceset::PiecesetDescriptor;
use crate::storage::{Storage, StorageError};

/// What the driver last published.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Status {
    pub(crate) state: State,
    /// Id of the last input the driver finished handling.
    pub(crate) processed: u64,
}

pub(crate) struct Envelope {
    id: u64,
    input: Input,
    /// The pass that sent this input, for verifier reports.
    pass: Option<u64>,
}

struct VerifierHandle {
    pass: u64,
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

/// State guarded by the state-machine lock.
pub(crate) struct Ops {
    pub(crate) state: State,
    verifier: Option<VerifierHandle>,
    /// Number of passes spawned so far.
    passes: u64,
}

/// Everything a database, its driver and its verifier share.
///
/// Lock order is `ops`, then `storage`, then `tree` or `signatures`. The
/// bitfields, `descriptor` and the verified count are independent of all
/// of them and may be touched while holding any.
pub(crate) struct Shared {
    pub(crate) info: Info,
    pub(crate) descriptor: Mutex<PiecesetDescriptor>,
    pub(crate) storage: TokioMutex<Box<dyn Storage>>,
    pub(crate) metadata: Option<Box<dyn Metadata>>,
    pub(crate) listener: Option<Arc<dyn DatabaseListener>>,
    pub(crate) present: SharedBitfield,
    pub(crate) verified: SharedBitfield,
    pub(crate) verified_count: AtomicU64,
    pub(crate) tree: Option<Mutex<HashTree>>,
    pub(crate) signatures: Mutex<BTreeMap<u64, ViewSignature>>,
    pub(crate) ops: TokioMutex<Ops>,
    inputs: mpsc::UnboundedSender<Envelope>,
    next_input: AtomicU64,
}

pub(crate) struct Parts {
    pub(crate) info: Info,
    pub(crate) storage: Box<dyn Storage>,
    pub(crate) metadata: Option<Box<dyn Metadata>>,
    pub(crate) listener: Option<Arc<dyn DatabaseListener>>,
    pub(crate) tree: Option<HashTree>,
    pub(crate) signatures: BTreeMap<u64, ViewSignature>,
}

impl Shared {
    /// Builds the shared core and spawns its driver task.
    pub(crate) fn spawn(parts: Parts) -> (Arc<Self>, watch::Receiver<Status>, JoinHandle<()>) {
        let descriptor = parts.storage.descriptor();
        let pieces = descriptor.number_of_pieces() as usize;
        let (status, status_rx) = watch::channel(Status {
            state: State::Stopped,
            processed: 0,
        });
        let (inputs, inputs_rx) = mpsc::unbounded_channel();

        let shared = Arc::new(Self {
            info: parts.info,
            descriptor: Mutex::new(descriptor),
            storage: TokioMutex::new(parts.storage),
            metadata: parts.metadata,
            listener: parts.listener,
            present: SharedBitfield::new(pieces),
            verified: SharedBitfield::new(pieces),
            verified_count: AtomicU64::new(0),
            tree: parts.tree.map(Mutex::new),
            signatures: Mutex::new(parts.signatures),
            ops: TokioMutex::new(Ops {
                state: State::Stopped,
                verifier: None,
                passes: 0,
            }),
            inputs,
            next_input: AtomicU64::new(0),
        });

        let driver = tokio::spawn(drive(Arc::clone(&shared), inputs_rx, status));
        (shared, status_rx, driver)
    }

    pub(crate) fn descriptor(&self) -> PiecesetDescriptor {
        *self.descriptor.lock()
    }

    /// Queues an input for the driver, returning its id.
    pub(crate) fn submit(&self, input: Input) -> u64 {
        self.enqueue(input, None)
    }

    fn enqueue(&self, input: Input, pass: Option<u64>) -> u64 {
        let id = self.next_input.fetch_add(1, Ordering::SeqCst) + 1;
        if self.inputs.send(Envelope { id, input, pass }).is_err() {
            tracing::debug!(?input, "driver has exited; input dropped");
        }
        id
    }

    pub(crate) fn mark_verified(&self, piece: u32) {
        if self.verified.set(piece as usize) {
            self.verified_count.fetch_add(1, Ordering::SeqCst);
        }
    }

    /// Reports a storage fault: the caller gets the error back and the
    /// database is driven to `Error`.
    pub(crate) fn fault(&self, error: StorageError) -> DatabaseError {
        tracing::warn!(error = %error, "storage fault");
        self.submit(Input::Error);
        DatabaseError::Storage(error)
    }

    async fn apply(self: &Arc<Self>, input: Input, pass: Option<u64>) -> State {
        let mut ops = self.ops.lock().await;
        if let Some(pass) = pass {
            if ops.verifier.as_ref().map(|v| v.pass) != Some(pass) {
                tracing::trace!(pass, ?input, "report from a finished pass dropped");
                return ops.state;
            }
        }
        match transition(ops.state, input) {
            Outcome::Ignore => {
                tracing::trace!(state = %ops.state, ?input, "input ignored");
            }
            Outcome::Invalid => {
                tracing::error!(state = %ops.state, ?input, "input has no transition");
                panic!("piece database received {input:?} in state {}", ops.state);
            }
            Outcome::Move { next, action } => {
                tracing::debug!(from = %ops.state, to = %next, ?input, "state transition");
                ops.state = next;
                self.perform(action, &mut ops).await;
            }
        }
        ops.state
    }

    async fn perform(self: &Arc<Self>, action: Action, ops: &mut Ops) {
        match action {
            Action::SpawnVerifier => {
                ops.passes += 1;
                ops.verifier = Some(self.spawn_verifier(ops.passes));
            }
            Action::CancelVerifier => {
                if let Some(verifier) = &ops.verifier {
                    verifier.cancel.cancel();
                }
            }
            Action::NotifyAvailable => {
                ops.verifier = None;
                tracing::debug!(
                    present = self.present.count(),
                    verified = self.verified_count.load(Ordering::SeqCst),
                    "database available"
                );
                if let Some(listener) = &self.listener {
                    listener.available();
                }
            }
            Action::NotifyStopped => {
                ops.verifier = None;
                if let Some(listener) = &self.listener {
                    listener.stopped();
                }
            }
            Action::EnterError => {
                // Joined before the reset so no piece is marked after it.
                if let Some(verifier) = ops.verifier.take() {
                    verifier.cancel.cancel();
                    join_verifier(verifier).await;
                }
                self.present.clear_all();
                self.verified.clear_all();
                self.verified_count.store(0, Ordering::SeqCst);
                if let Some(listener) = &self.listener {
                    listener.error();
                }
            }
            Action::Shutdown => {
                self.shutdown(ops).await;
            }
        }
    }

    fn spawn_verifier(self: &Arc<Self>, pass: u64) -> VerifierHandle {
        let cancel = CancellationToken::new();
        let token = cancel.clone();
        let shared = Arc::clone(self);
        let task = tokio::spawn(async move {
            let input = match verifier::run(&shared, &token).await {
                Ok(Pass::Complete) => Input::VerificationComplete,
                Ok(Pass::Cancelled) => Input::VerificationCancelled,
                Err(e) => {
                    tracing::warn!(error = %e, "verification failed");
                    Input::Error
                }
            };
            shared.enqueue(input, Some(pass));
        });
        tracing::debug!(pass, "verification pass spawned");
        VerifierHandle { pass, cancel, task }
    }

    async fn shutdown(&self, ops: &mut Ops) {
        if let Some(verifier) = ops.verifier.take() {
            join_verifier(verifier).await;
        }

        let closed = self.storage.lock().await.close().await;
        if let Some(metadata) = &self.metadata {
            match closed {
                Ok(Some(cookie)) if self.verified.snapshot().is_complete() => {
                    if let Err(e) = resume::persist(self, metadata.as_ref(), cookie).await {
                        tracing::warn!(error = %e, "failed to persist resume state");
                    }
                }
                Ok(_) => {
                    tracing::debug!("nothing to persist");
                }
                Err(ref e) => {
                    tracing::warn!(error = %e, "storage close failed; resume state not saved");
                }
            }
            if let Err(e) = metadata.close().await {
                tracing::warn!(error = %e, "failed to close metadata");
            }
        } else if let Err(e) = closed {
            tracing::warn!(error = %e, "storage close failed");
        }

        if let Some(listener) = &self.listener {
            listener.terminated();
        }
    }

    /// Cancels a running pass without waiting for it.
    pub(crate) fn cancel_verifier_now(&self) {
        if let Ok(ops) = self.ops.try_lock() {
            if let Some(verifier) = &ops.verifier {
                verifier.cancel.cancel();
            }
        }
    }
}

async fn join_verifier(verifier: VerifierHandle) {
    if let Err(e) = verifier.task.await {
        tracing::warn!(pass = verifier.pass, error = %e, "verifier task failed");
    }
}

/// The driver owns the status sender, so waiters see the channel close if
/// this task ever dies.
async fn drive(
    shared: Arc<Shared>,
    mut inputs: mpsc::UnboundedReceiver<Envelope>,
    status: watch::Sender<Status>,
) {
    while let Some(Envelope { id, input, pass }) = inputs.recv().await {
        let state = shared.apply(input, pass).await;
        status.send_replace(Status {
            state,
            processed: id,
        });
        if state == State::Terminated {
            break;
        }
    }
    tracing::debug!("database driver exited");
}
