//! Process lifecycle: supervised units, the supervision group and the crash-only outer loop.
//!
//! A group owns one cache manager, one actor per configured worker, the cache builder and
//! the gateway. Members that fail are restarted in place under a [`RestartPolicy`]; a
//! member that exhausts its policy escalates with [`UnitCrash`], which tears the group
//! down. The [`Supervisor`] then rebuilds the whole group unless shutdown was requested.

use std::any::Any;
use std::collections::VecDeque;
use std::future::Future;
use std::net::SocketAddr;
use std::panic::AssertUnwindSafe;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::FutureExt;
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::archive::ArchiveStore;
use crate::cache_builder::{BuilderSettings, CacheBuilder};
use crate::cache_manager::CacheManager;
use crate::config::{Config, RestartPolicy};
use crate::error::{PersistenceLoadError, SupervisorError, UnitCrash, UnitError};
use crate::gateway::{self, GatewayState};
use crate::persistence;
use crate::worker::{worker_actor, WorkerFactory, WorkerRegistry};

/// Pause before the outer loop rebuilds a crashed group.
pub const DEFAULT_RESTART_DELAY: Duration = Duration::from_secs(1);

/// Restart timestamps of one unit inside a sliding window.
#[derive(Debug)]
pub struct RestartTracker {
    policy: RestartPolicy,
    restarts: VecDeque<Instant>,
}

impl RestartTracker {
    pub fn new(policy: RestartPolicy) -> Self {
        Self {
            policy,
            restarts: VecDeque::new(),
        }
    }

    /// Record a restart. Returns `false` once the policy is exceeded.
    pub fn record(&mut self) -> bool {
        let now = Instant::now();
        let window = self.policy.window();
        while let Some(oldest) = self.restarts.front() {
            if now.duration_since(*oldest) > window {
                self.restarts.pop_front();
            } else {
                break;
            }
        }
        self.restarts.push_back(now);
        self.restarts.len() <= self.policy.max_restarts
    }

    /// Restarts currently inside the window.
    pub fn count(&self) -> usize {
        self.restarts.len()
    }
}

pub(crate) fn panic_reason(payload: &(dyn Any + Send)) -> String {
    payload
        .downcast_ref::<&str>()
        .map(|s| s.to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic".to_string())
}

/// Run a unit, restarting it whenever it fails, panics or returns before `cancel` fires.
///
/// Returns `Ok(())` once cancelled and [`UnitCrash`] when restarts exceed `policy`.
pub async fn supervise<F, Fut>(
    unit: &str,
    policy: RestartPolicy,
    cancel: CancellationToken,
    mut start: F,
) -> Result<(), UnitCrash>
where
    F: FnMut() -> Fut + Send,
    Fut: Future<Output = Result<(), UnitError>> + Send,
{
    let mut tracker = RestartTracker::new(policy);
    loop {
        if cancel.is_cancelled() {
            return Ok(());
        }
        let outcome = AssertUnwindSafe(start()).catch_unwind().await;
        if cancel.is_cancelled() {
            return Ok(());
        }
        let reason = match outcome {
            Ok(Ok(())) => "exited unexpectedly".to_string(),
            Ok(Err(e)) => e.to_string(),
            Err(payload) => panic_reason(payload.as_ref()),
        };
        if !tracker.record() {
            error!(unit, reason = %reason, restarts = tracker.count(), "Unit crashed too often, escalating");
            return Err(UnitCrash {
                unit: unit.to_string(),
                restarts: tracker.count(),
                within: policy.window(),
                reason,
            });
        }
        error!(unit, reason = %reason, restarts = tracker.count(), "Unit crashed, restarting");
    }
}

/// Process-wide shutdown request: a sticky flag plus the root cancellation token.
#[derive(Debug, Clone, Default)]
pub struct Shutdown {
    requested: Arc<AtomicBool>,
    token: CancellationToken,
}

impl Shutdown {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn request(&self) {
        if !self.requested.swap(true, Ordering::AcqRel) {
            info!("Shutdown requested");
        }
        self.token.cancel();
    }

    pub fn is_requested(&self) -> bool {
        self.requested.load(Ordering::Acquire)
    }

    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }

    /// Request shutdown on SIGINT or SIGTERM (ctrl-c where those do not exist).
    pub fn listen_for_signals(&self) -> JoinHandle<()> {
        let shutdown = self.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = shutdown.token.cancelled() => {}
                received = wait_for_signal() => match received {
                    Ok(signal) => {
                        info!(signal, "Received termination signal");
                        shutdown.request();
                    }
                    Err(e) => error!(error = %e, "Failed to install signal handlers"),
                },
            }
        })
    }
}

#[cfg(unix)]
async fn wait_for_signal() -> std::io::Result<&'static str> {
    use tokio::signal::unix::{signal, SignalKind};
    let mut terminate = signal(SignalKind::terminate())?;
    let mut interrupt = signal(SignalKind::interrupt())?;
    tokio::select! {
        _ = terminate.recv() => Ok("SIGTERM"),
        _ = interrupt.recv() => Ok("SIGINT"),
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() -> std::io::Result<&'static str> {
    tokio::signal::ctrl_c().await?;
    Ok("ctrl-c")
}

/// Everything a group needs that does not change between restarts.
#[derive(Debug, Clone)]
pub struct GroupSettings {
    pub builder: BuilderSettings,
    pub restart: RestartPolicy,
    pub archive_dir: PathBuf,
    pub shutdown_timeout: Duration,
}

impl GroupSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            builder: BuilderSettings::from_config(config),
            restart: config.restart,
            archive_dir: config.archive_dir(),
            shutdown_timeout: config.shutdown_timeout(),
        }
    }
}

/// Resolved startup state: worker factories and the bound listener.
pub struct GroupSpec {
    pub settings: GroupSettings,
    pub factories: Vec<WorkerFactory>,
    pub listener: std::net::TcpListener,
    /// Process start, for `/status` uptime.
    pub started_at: std::time::Instant,
}

impl GroupSpec {
    /// Build every worker once and bind the listen address. Failures here are fatal.
    pub fn from_config(config: &Config, registry: &WorkerRegistry) -> Result<Self, SupervisorError> {
        config.validate()?;
        let factories = config
            .registrations()?
            .into_iter()
            .map(|registration| registry.factory(registration))
            .collect::<Result<Vec<_>, _>>()?;
        let addr = config.listen_addr();
        let listener =
            std::net::TcpListener::bind(&addr).map_err(|source| SupervisorError::Bind { addr, source })?;
        Ok(Self {
            settings: GroupSettings::from_config(config),
            factories,
            listener,
            started_at: std::time::Instant::now(),
        })
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    fn tokio_listener(&self) -> std::io::Result<tokio::net::TcpListener> {
        let listener = self.listener.try_clone()?;
        listener.set_nonblocking(true)?;
        tokio::net::TcpListener::from_std(listener)
    }
}

/// Why a group stopped.
#[derive(Debug, Clone)]
pub enum GroupExit {
    /// Every unit stopped after cancellation.
    Cancelled,
    Crashed(UnitCrash),
}

type UnitOutcome = (String, Result<(), UnitCrash>);

/// One running instance of the supervised group.
pub struct SupervisionGroup {
    manager: Arc<CacheManager>,
    units: JoinSet<UnitOutcome>,
    cancel: CancellationToken,
}

impl SupervisionGroup {
    /// Start all members under a child of `parent`.
    pub fn start(spec: &GroupSpec, parent: &CancellationToken) -> Result<Self, SupervisorError> {
        let settings = &spec.settings;
        let cancel = parent.child_token();
        let manager = Arc::new(seed_manager(settings.builder.save_path.as_deref()));
        let mut units = JoinSet::new();

        let mut handles = Vec::with_capacity(spec.factories.len());
        for (index, factory) in spec.factories.iter().enumerate() {
            let (handle, task) =
                worker_actor(index, Arc::clone(factory), settings.restart, cancel.clone())?;
            let unit = handle.name().to_string();
            units.spawn(async move { (unit, task.await) });
            handles.push(handle);
        }

        let builder = Arc::new(CacheBuilder::new(
            Arc::clone(&manager),
            handles.clone(),
            settings.builder.clone(),
        ));
        let builder_cancel = cancel.clone();
        units.spawn(named(
            "cache_builder",
            supervise("cache_builder", settings.restart, cancel.clone(), move || {
                let builder = Arc::clone(&builder);
                let cancel = builder_cancel.clone();
                async move {
                    builder.run(cancel).await;
                    Ok::<(), UnitError>(())
                }
            }),
        ));

        let state = GatewayState {
            manager: Arc::clone(&manager),
            workers: Arc::new(handles),
            archives: ArchiveStore::new(&settings.archive_dir),
            started_at: spec.started_at,
        };
        // Bind failures surface at start; restarts reuse the same socket.
        let first_listener = spec.tokio_listener().map_err(|source| SupervisorError::Bind {
            addr: spec.local_addr().map(|a| a.to_string()).unwrap_or_default(),
            source,
        })?;
        let std_listener = Arc::new(spec.listener.try_clone().map_err(|source| {
            SupervisorError::Bind {
                addr: spec.local_addr().map(|a| a.to_string()).unwrap_or_default(),
                source,
            }
        })?);
        let mut first_listener = Some(first_listener);
        let gateway_cancel = cancel.clone();
        units.spawn(named(
            "gateway",
            supervise("gateway", settings.restart, cancel.clone(), move || {
                let listener = first_listener.take().map(Ok).unwrap_or_else(|| {
                    std_listener.try_clone().and_then(|l| {
                        l.set_nonblocking(true)?;
                        tokio::net::TcpListener::from_std(l)
                    })
                });
                let state = state.clone();
                let cancel = gateway_cancel.clone();
                async move {
                    let listener = listener?;
                    gateway::serve(listener, state, cancel).await?;
                    Ok::<(), UnitError>(())
                }
            }),
        ));

        info!(units = units.len(), "Supervision group started");
        Ok(Self {
            manager,
            units,
            cancel,
        })
    }

    pub fn manager(&self) -> &Arc<CacheManager> {
        &self.manager
    }

    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Wait until a unit escalates or every unit has stopped.
    pub async fn wait(&mut self) -> GroupExit {
        while let Some(joined) = self.units.join_next().await {
            match joined {
                Ok((unit, Ok(()))) => {
                    if !self.cancel.is_cancelled() {
                        return GroupExit::Crashed(UnitCrash {
                            unit,
                            restarts: 0,
                            within: Duration::ZERO,
                            reason: "stopped without cancellation".to_string(),
                        });
                    }
                    debug!(unit = %unit, "Unit stopped");
                }
                Ok((_, Err(crash))) => return GroupExit::Crashed(crash),
                Err(e) if e.is_cancelled() => {}
                Err(e) => {
                    return GroupExit::Crashed(UnitCrash {
                        unit: "unknown".to_string(),
                        restarts: 0,
                        within: Duration::ZERO,
                        reason: e.to_string(),
                    })
                }
            }
        }
        GroupExit::Cancelled
    }

    /// Cancel every member and wait up to `timeout` for them to stop, then abort the rest.
    pub async fn terminate(mut self, timeout: Duration) {
        self.cancel.cancel();
        let drained = tokio::time::timeout(timeout, async {
            while self.units.join_next().await.is_some() {}
        })
        .await;
        if drained.is_err() {
            warn!(timeout = ?timeout, remaining = self.units.len(), "Units did not stop in time, aborting");
            self.units.shutdown().await;
        }
        info!("Supervision group stopped");
    }
}

async fn named<F>(unit: &'static str, run: F) -> UnitOutcome
where
    F: Future<Output = Result<(), UnitCrash>>,
{
    (unit.to_string(), run.await)
}

/// Seed from the save file; a seeded manager still answers "warming" until the first publish.
fn seed_manager(save_path: Option<&std::path::Path>) -> CacheManager {
    let Some(path) = save_path else {
        return CacheManager::new();
    };
    match persistence::load(path) {
        Ok(universe) => CacheManager::seeded(universe),
        Err(PersistenceLoadError::SaveNotFound(_)) => {
            debug!(path = %path.display(), "No saved universe");
            CacheManager::new()
        }
        Err(e) => {
            warn!(error = %e, "Ignoring saved universe");
            CacheManager::new()
        }
    }
}

/// Crash-only outer loop around [`SupervisionGroup`].
pub struct Supervisor {
    spec: GroupSpec,
    shutdown: Shutdown,
    restart_delay: Duration,
}

impl Supervisor {
    pub fn new(spec: GroupSpec, shutdown: Shutdown) -> Self {
        Self {
            spec,
            shutdown,
            restart_delay: DEFAULT_RESTART_DELAY,
        }
    }

    pub fn with_restart_delay(mut self, delay: Duration) -> Self {
        self.restart_delay = delay;
        self
    }

    pub fn shutdown(&self) -> &Shutdown {
        &self.shutdown
    }

    /// Run groups until shutdown is requested.
    pub async fn run(self) -> Result<(), SupervisorError> {
        let root = self.shutdown.token();
        let timeout = self.spec.settings.shutdown_timeout;
        while !self.shutdown.is_requested() {
            let mut group = SupervisionGroup::start(&self.spec, &root)?;
            let exit = tokio::select! {
                exit = group.wait() => exit,
                _ = root.cancelled() => GroupExit::Cancelled,
            };
            group.terminate(timeout).await;

            if self.shutdown.is_requested() {
                break;
            }
            match exit {
                GroupExit::Crashed(crash) => {
                    error!(error = %crash, "Supervision group crashed. Restarting...");
                }
                GroupExit::Cancelled => warn!("Supervision group stopped. Restarting..."),
            }
            tokio::select! {
                _ = root.cancelled() => break,
                _ = tokio::time::sleep(self.restart_delay) => {}
            }
        }
        info!("Supervisor stopped");
        Ok(())
    }
}
