//! Crawl scheduling, merge and publish.
//!
//! Each cycle asks every worker for its cookbooks in parallel, keeps one winner per
//! `(name, version)`, resolves metadata for the winners and publishes the result as one
//! snapshot. The first cycle runs immediately; later cycles follow a fixed interval.

use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use futures::{stream, StreamExt};
use tokio::time::{timeout, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::cache_manager::{CacheManager, Origin, Snapshot};
use crate::config::Config;
use crate::model::{CookbookKey, Metadata, RemoteCookbook, Universe};
use crate::persistence;
use crate::worker::WorkerHandle;

/// Metadata requests in flight across all workers during one cycle.
pub const METADATA_CONCURRENCY: usize = 16;

#[derive(Debug, Clone)]
pub struct BuilderSettings {
    pub build_interval: Duration,
    pub worker_timeout: Duration,
    pub cycle_timeout: Duration,
    /// Where to save each published universe; `None` disables saving.
    pub save_path: Option<PathBuf>,
}

impl BuilderSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            build_interval: config.build_interval(),
            worker_timeout: config.worker_timeout(),
            cycle_timeout: config.cycle_timeout(),
            save_path: config.save_path(),
        }
    }
}

/// What one worker reported in a cycle.
#[derive(Debug, Clone)]
pub struct WorkerReport {
    /// Registration index of the reporting worker.
    pub worker: usize,
    pub cookbooks: Vec<RemoteCookbook>,
}

/// The surviving report for one `(name, version)`.
#[derive(Debug, Clone, PartialEq)]
pub struct Candidate {
    pub worker: usize,
    pub remote: RemoteCookbook,
}

impl Candidate {
    fn rank(&self) -> (i64, usize) {
        (self.remote.priority(), self.worker)
    }
}

/// Keep one report per `(name, version)`: lowest priority wins, then lowest registration index.
///
/// The result does not depend on the order of `reports` and merging a report with
/// itself yields the same winners.
pub fn merge(reports: &[WorkerReport]) -> BTreeMap<CookbookKey, Candidate> {
    let mut winners: BTreeMap<CookbookKey, Candidate> = BTreeMap::new();
    for report in reports {
        for remote in &report.cookbooks {
            let candidate = Candidate {
                worker: report.worker,
                remote: remote.clone(),
            };
            match winners.get_mut(&remote.key()) {
                None => {
                    winners.insert(remote.key(), candidate);
                }
                Some(current) if candidate.rank() < current.rank() => {
                    debug!(cookbook = %remote.key(), loser = current.worker, winner = candidate.worker, "Replacing lower-precedence report");
                    *current = candidate;
                }
                Some(current) => {
                    debug!(cookbook = %remote.key(), loser = candidate.worker, winner = current.worker, "Discarding lower-precedence report");
                }
            }
        }
    }
    winners
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CycleOutcome {
    Published {
        cookbooks: usize,
        failed_workers: usize,
    },
    /// Every worker failed; the served snapshot was left alone.
    Failed,
    /// Listing and merge ran past the cycle timeout; nothing was published.
    TimedOut,
    /// Shutdown began while the cycle was running; nothing was published.
    Abandoned,
}

pub struct CacheBuilder {
    manager: Arc<CacheManager>,
    workers: Vec<WorkerHandle>,
    settings: BuilderSettings,
}

impl CacheBuilder {
    pub fn new(manager: Arc<CacheManager>, workers: Vec<WorkerHandle>, settings: BuilderSettings) -> Self {
        Self {
            manager,
            workers,
            settings,
        }
    }

    pub fn workers(&self) -> &[WorkerHandle] {
        &self.workers
    }

    /// Run cycles until `cancel` fires.
    ///
    /// A running cycle is never interrupted; cancellation is checked between cycles.
    pub async fn run(&self, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(self.settings.build_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        info!(workers = self.workers.len(), interval = ?self.settings.build_interval, "Cache builder started");
        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {}
            }
            match self.build_until(&cancel).await {
                CycleOutcome::Published { cookbooks, failed_workers } => {
                    info!(cookbooks, failed_workers, "Crawl cycle published");
                }
                CycleOutcome::Failed => warn!("Crawl cycle failed: no worker answered"),
                CycleOutcome::TimedOut => warn!(timeout = ?self.settings.cycle_timeout, "Crawl cycle timed out"),
                CycleOutcome::Abandoned => info!("Crawl cycle abandoned for shutdown"),
            }
        }
        info!("Cache builder stopped");
    }

    /// One crawl cycle.
    pub async fn build(&self) -> CycleOutcome {
        self.build_until(&CancellationToken::new()).await
    }

    /// One crawl cycle that publishes only if `cancel` has not fired by the time it is done.
    ///
    /// The cycle timeout bounds the listing fan-out and the merge. Metadata resolution
    /// afterwards is bounded per call by the worker timeout.
    pub async fn build_until(&self, cancel: &CancellationToken) -> CycleOutcome {
        self.manager.begin_cycle();
        let (winners, failed_workers) = match timeout(self.settings.cycle_timeout, self.collect()).await {
            Ok(Some(collected)) => collected,
            Ok(None) => return CycleOutcome::Failed,
            Err(_) => return CycleOutcome::TimedOut,
        };

        let previous = self.manager.current();
        let resolved: Vec<(CookbookKey, Candidate, Metadata)> = stream::iter(winners)
            .map(|(key, candidate)| {
                let previous = Arc::clone(&previous);
                async move {
                    let metadata = self.resolve_metadata(&previous, &candidate).await;
                    (key, candidate, metadata)
                }
            })
            .buffer_unordered(METADATA_CONCURRENCY)
            .collect()
            .await;
        // Workers refuse requests once shutdown starts, so late entries may hold empty metadata.
        if cancel.is_cancelled() {
            return CycleOutcome::Abandoned;
        }

        let mut universe = Universe::new();
        let mut origins = HashMap::with_capacity(resolved.len());
        for (key, candidate, metadata) in resolved {
            universe.insert(&candidate.remote, metadata);
            origins.insert(
                key,
                Origin {
                    worker: candidate.worker,
                    remote: candidate.remote,
                },
            );
        }

        let snapshot = self.manager.publish(universe, origins);
        let cookbooks = snapshot.universe.len();
        self.save(snapshot).await;
        CycleOutcome::Published {
            cookbooks,
            failed_workers,
        }
    }

    /// Ask every worker for its cookbooks and merge the answers.
    ///
    /// `None` when workers are configured and none of them answered.
    async fn collect(&self) -> Option<(BTreeMap<CookbookKey, Candidate>, usize)> {
        let calls = self.workers.iter().map(|worker| async move {
            let result = match timeout(self.settings.worker_timeout, worker.cookbooks()).await {
                Ok(result) => result.map_err(|e| e.to_string()),
                Err(_) => Err(format!("timed out after {:?}", self.settings.worker_timeout)),
            };
            (worker.index(), worker.name(), result)
        });

        let mut reports = Vec::with_capacity(self.workers.len());
        let mut failed_workers = 0;
        for (index, name, result) in join_all(calls).await {
            match result {
                Ok(cookbooks) => {
                    debug!(worker = %name, count = cookbooks.len(), "Worker reported");
                    reports.push(WorkerReport {
                        worker: index,
                        cookbooks,
                    });
                }
                Err(reason) => {
                    warn!(worker = %name, error = %reason, "Worker contributed nothing this cycle");
                    failed_workers += 1;
                }
            }
        }
        if reports.is_empty() && !self.workers.is_empty() {
            return None;
        }
        Some((merge(&reports), failed_workers))
    }

    /// Reuse the served entry when it points at the same artifact, otherwise ask the owner.
    async fn resolve_metadata(&self, previous: &Snapshot, candidate: &Candidate) -> Metadata {
        let remote = &candidate.remote;
        if !remote.is_unversioned() {
            if let Some(entry) = previous.universe.get(remote.name(), remote.version()) {
                if entry.same_location(remote) {
                    return entry.metadata();
                }
            }
        }
        let Some(worker) = self.worker(candidate.worker) else {
            return Metadata::default();
        };
        match timeout(self.settings.worker_timeout, worker.metadata(remote.clone())).await {
            Ok(Some(metadata)) => metadata,
            Ok(None) => {
                debug!(worker = %worker.name(), cookbook = %remote.key(), "No metadata, publishing empty");
                Metadata::default()
            }
            Err(_) => {
                warn!(worker = %worker.name(), cookbook = %remote.key(), "Metadata request timed out");
                Metadata::default()
            }
        }
    }

    fn worker(&self, index: usize) -> Option<&WorkerHandle> {
        self.workers.iter().find(|w| w.index() == index)
    }

    async fn save(&self, snapshot: Arc<Snapshot>) {
        let Some(path) = self.settings.save_path.clone() else {
            return;
        };
        let saved = tokio::task::spawn_blocking(move || persistence::save(&path, &snapshot.universe)).await;
        match saved {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!(error = %e, "Failed to save universe"),
            Err(e) => error!(error = %e, "Save task failed"),
        }
    }
}

