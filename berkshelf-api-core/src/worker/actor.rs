//! Worker actor: one task per source, reached only through [`WorkerHandle`].
//!
//! The task owns its worker instance (and so its HTTP session); nothing is shared between
//! workers. Requests are served concurrently up to [`MAX_IN_FLIGHT`]. A panic while serving
//! a request drops that request's reply, rebuilds the worker from its factory and counts a
//! restart; exceeding the restart policy ends the task with [`UnitCrash`]. On cancellation
//! the actor stops taking requests and finishes the ones already running before it shuts
//! the worker down.

use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::path::PathBuf;
use std::sync::Arc;

use futures::future::BoxFuture;
use futures::stream::FuturesUnordered;
use futures::{FutureExt, StreamExt};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::RestartPolicy;
use crate::contract::Worker;
use crate::error::{
    ArchiveError, ConfigurationError, SourceUnavailableError, UnitCrash, WorkerCallError,
};
use crate::model::{Metadata, RemoteCookbook};
use crate::supervisor::{panic_reason, RestartTracker};
use crate::worker::WorkerFactory;

/// Requests queued per worker before senders wait.
pub const MAILBOX_CAPACITY: usize = 64;

/// Requests one worker serves at the same time.
pub const MAX_IN_FLIGHT: usize = 8;

enum WorkerRequest {
    Cookbooks {
        reply: oneshot::Sender<Result<Vec<RemoteCookbook>, SourceUnavailableError>>,
    },
    Metadata {
        remote: RemoteCookbook,
        reply: oneshot::Sender<Option<Metadata>>,
    },
    Download {
        remote: RemoteCookbook,
        destination: PathBuf,
        reply: oneshot::Sender<Result<(), ArchiveError>>,
    },
}

/// Cloneable address of a running worker actor.
#[derive(Clone)]
pub struct WorkerHandle {
    index: usize,
    name: String,
    priority: i64,
    tx: mpsc::Sender<WorkerRequest>,
}

impl std::fmt::Debug for WorkerHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerHandle")
            .field("index", &self.index)
            .field("name", &self.name)
            .field("priority", &self.priority)
            .finish()
    }
}

impl WorkerHandle {
    /// Registration index; first-registered wins priority ties.
    pub fn index(&self) -> usize {
        self.index
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn priority(&self) -> i64 {
        self.priority
    }

    async fn call<T>(
        &self,
        request: WorkerRequest,
        reply: oneshot::Receiver<T>,
    ) -> Result<T, WorkerCallError> {
        self.tx
            .send(request)
            .await
            .map_err(|_| WorkerCallError::Stopped)?;
        reply.await.map_err(|_| WorkerCallError::Crashed)
    }

    pub async fn cookbooks(&self) -> Result<Vec<RemoteCookbook>, WorkerCallError> {
        let (reply, rx) = oneshot::channel();
        self.call(WorkerRequest::Cookbooks { reply }, rx)
            .await?
            .map_err(WorkerCallError::from)
    }

    /// `None` covers both "no metadata" and "worker could not answer".
    pub async fn metadata(&self, remote: RemoteCookbook) -> Option<Metadata> {
        let (reply, rx) = oneshot::channel();
        match self.call(WorkerRequest::Metadata { remote, reply }, rx).await {
            Ok(metadata) => metadata,
            Err(e) => {
                debug!(worker = %self.name, error = %e, "Metadata request not answered");
                None
            }
        }
    }

    pub async fn download(
        &self,
        remote: RemoteCookbook,
        destination: PathBuf,
    ) -> Result<(), ArchiveError> {
        let (reply, rx) = oneshot::channel();
        self.call(
            WorkerRequest::Download {
                remote,
                destination,
                reply,
            },
            rx,
        )
        .await?
    }
}

/// The actor's run loop, ready to be spawned by whoever owns the task.
pub type WorkerTask = BoxFuture<'static, Result<(), UnitCrash>>;

/// Build the worker once (fail fast) and return its handle together with the actor loop.
pub fn worker_actor(
    index: usize,
    factory: WorkerFactory,
    policy: RestartPolicy,
    cancel: CancellationToken,
) -> Result<(WorkerHandle, WorkerTask), ConfigurationError> {
    let worker = factory()?;
    let (tx, rx) = mpsc::channel(MAILBOX_CAPACITY);
    let handle = WorkerHandle {
        index,
        name: worker.describe(),
        priority: worker.priority(),
        tx,
    };
    info!(worker = %handle.name, priority = handle.priority, "Starting worker");
    Ok((handle, run(worker, factory, rx, policy, cancel).boxed()))
}

/// [`worker_actor`] spawned onto the current runtime.
pub fn spawn_worker(
    index: usize,
    factory: WorkerFactory,
    policy: RestartPolicy,
    cancel: CancellationToken,
) -> Result<(WorkerHandle, JoinHandle<Result<(), UnitCrash>>), ConfigurationError> {
    let (handle, task) = worker_actor(index, factory, policy, cancel)?;
    Ok((handle, tokio::spawn(task)))
}

type Served = Result<(), Box<dyn Any + Send>>;

fn serve(worker: Arc<dyn Worker>, request: WorkerRequest) -> BoxFuture<'static, Served> {
    let work = async move {
        match request {
            WorkerRequest::Cookbooks { reply } => {
                let _ = reply.send(worker.list_cookbooks().await);
            }
            WorkerRequest::Metadata { remote, reply } => {
                let _ = reply.send(worker.metadata(&remote).await);
            }
            WorkerRequest::Download {
                remote,
                destination,
                reply,
            } => {
                let _ = reply.send(worker.download(&remote, &destination).await);
            }
        }
    };
    AssertUnwindSafe(work).catch_unwind().boxed()
}

async fn run(
    mut worker: Arc<dyn Worker>,
    factory: WorkerFactory,
    mut rx: mpsc::Receiver<WorkerRequest>,
    policy: RestartPolicy,
    cancel: CancellationToken,
) -> Result<(), UnitCrash> {
    let mut tracker = RestartTracker::new(policy);
    let mut in_flight: FuturesUnordered<BoxFuture<'static, Served>> = FuturesUnordered::new();
    let name = worker.describe();

    let outcome = loop {
        tokio::select! {
            _ = cancel.cancelled() => break Ok(()),
            Some(served) = in_flight.next(), if !in_flight.is_empty() => {
                let Err(payload) = served else { continue };
                let reason = panic_reason(payload.as_ref());
                if !tracker.record() {
                    error!(worker = %name, reason = %reason, "Worker crashed too often, escalating");
                    break Err(UnitCrash {
                        unit: name.clone(),
                        restarts: tracker.count(),
                        within: policy.window(),
                        reason,
                    });
                }
                error!(worker = %name, reason = %reason, restarts = tracker.count(), "Worker crashed, restarting");
                worker.shutdown().await;
                match factory() {
                    Ok(fresh) => worker = fresh,
                    Err(e) => {
                        break Err(UnitCrash {
                            unit: name.clone(),
                            restarts: tracker.count(),
                            within: policy.window(),
                            reason: format!("failed to rebuild worker: {e}"),
                        });
                    }
                }
            }
            request = rx.recv(), if in_flight.len() < MAX_IN_FLIGHT => {
                match request {
                    Some(request) => in_flight.push(serve(Arc::clone(&worker), request)),
                    None => break Ok(()),
                }
            }
        }
    };

    // Refuse new requests and drop queued ones unserved.
    rx.close();
    while rx.try_recv().is_ok() {}
    drop(rx);
    if outcome.is_ok() {
        if !in_flight.is_empty() {
            info!(worker = %name, pending = in_flight.len(), "Waiting for in-flight requests");
        }
        while let Some(served) = in_flight.next().await {
            if let Err(payload) = served {
                warn!(worker = %name, reason = %panic_reason(payload.as_ref()), "Worker crashed while draining");
            }
        }
    } else {
        // An escalated crash drops whatever the failing worker was still serving.
        drop(in_flight);
    }
    worker.shutdown().await;
    match &outcome {
        Ok(()) => info!(worker = %name, "Worker stopped"),
        Err(crash) => warn!(worker = %name, error = %crash, "Worker terminated"),
    }
    outcome
}
