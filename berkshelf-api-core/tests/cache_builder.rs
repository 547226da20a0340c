use std::collections::BTreeMap;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use berkshelf_api_core::cache_builder::{BuilderSettings, CacheBuilder, CycleOutcome};
use berkshelf_api_core::cache_manager::CacheManager;
use berkshelf_api_core::config::RestartPolicy;
use berkshelf_api_core::contract::{MockWorker, Worker};
use berkshelf_api_core::error::{ArchiveError, SourceUnavailableError};
use berkshelf_api_core::model::{LocationType, Metadata, RemoteCookbook, Universe};
use berkshelf_api_core::persistence;
use berkshelf_api_core::worker::{spawn_worker, WorkerFactory, WorkerHandle};
use pretty_assertions::assert_eq;
use tokio_util::sync::CancellationToken;

fn settings() -> BuilderSettings {
    BuilderSettings {
        build_interval: Duration::from_secs(300),
        worker_timeout: Duration::from_secs(5),
        cycle_timeout: Duration::from_secs(30),
        save_path: None,
    }
}

fn remote(name: &str, version: &str, path: &str, priority: i64) -> RemoteCookbook {
    RemoteCookbook::new(name, version, LocationType::Uri, path, priority)
}

fn deps(pairs: &[(&str, &str)]) -> Metadata {
    Metadata {
        dependencies: pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect(),
        platforms: BTreeMap::new(),
    }
}

fn mock(
    name: &'static str,
    priority: i64,
    cookbooks: Vec<RemoteCookbook>,
    metadata: Option<Metadata>,
) -> MockWorker {
    let mut worker = MockWorker::new();
    worker.expect_describe().return_const(name.to_string());
    worker.expect_priority().return_const(priority);
    worker
        .expect_list_cookbooks()
        .returning(move || Ok(cookbooks.clone()));
    worker
        .expect_metadata()
        .returning(move |_| metadata.clone());
    worker.expect_shutdown().returning(|| ());
    worker
}

fn failing(name: &'static str) -> MockWorker {
    let mut worker = MockWorker::new();
    worker.expect_describe().return_const(name.to_string());
    worker.expect_priority().return_const(0i64);
    worker
        .expect_list_cookbooks()
        .returning(|| Err(SourceUnavailableError::Closed));
    worker.expect_shutdown().returning(|| ());
    worker
}

fn spawn<F>(index: usize, make: F) -> WorkerHandle
where
    F: Fn() -> MockWorker + Send + Sync + 'static,
{
    spawn_arc(index, move || Arc::new(make()) as Arc<dyn Worker>)
}

fn spawn_arc<F>(index: usize, make: F) -> WorkerHandle
where
    F: Fn() -> Arc<dyn Worker> + Send + Sync + 'static,
{
    let factory: WorkerFactory = Arc::new(move || Ok(make()));
    let (handle, _task) = spawn_worker(
        index,
        factory,
        RestartPolicy::default(),
        CancellationToken::new(),
    )
    .expect("worker starts");
    handle
}

/// Never answers within any sane timeout.
struct SlowWorker;

#[async_trait]
impl Worker for SlowWorker {
    fn describe(&self) -> String {
        "slow worker".to_string()
    }

    fn priority(&self) -> i64 {
        0
    }

    async fn list_cookbooks(&self) -> Result<Vec<RemoteCookbook>, SourceUnavailableError> {
        tokio::time::sleep(Duration::from_secs(3600)).await;
        Ok(vec![remote("late", "1.0.0", "slow", 0)])
    }

    async fn metadata(&self, _remote: &RemoteCookbook) -> Option<Metadata> {
        None
    }

    async fn download(&self, _remote: &RemoteCookbook, _destination: &Path) -> Result<(), ArchiveError> {
        Ok(())
    }

    async fn shutdown(&self) {}
}

/// Lists at once but takes its time on every metadata request.
struct SlowMetadata;

#[async_trait]
impl Worker for SlowMetadata {
    fn describe(&self) -> String {
        "slow metadata".to_string()
    }

    fn priority(&self) -> i64 {
        0
    }

    async fn list_cookbooks(&self) -> Result<Vec<RemoteCookbook>, SourceUnavailableError> {
        Ok(vec![
            remote("tea", "1.0.0", "https://x/tea", 0),
            remote("milk", "2.0.0", "https://x/milk", 0),
        ])
    }

    async fn metadata(&self, _remote: &RemoteCookbook) -> Option<Metadata> {
        tokio::time::sleep(Duration::from_secs(8)).await;
        Some(deps(&[("water", ">= 1.0")]))
    }

    async fn download(&self, _remote: &RemoteCookbook, _destination: &Path) -> Result<(), ArchiveError> {
        Ok(())
    }

    async fn shutdown(&self) {}
}

#[tokio::test]
async fn tea_scenario_higher_precedence_source_wins() {
    let a = spawn(0, || {
        mock(
            "worker-a",
            1,
            vec![remote("tea", "1.0.0", "https://a/tea", 1)],
            Some(deps(&[])),
        )
    });
    let b = spawn(1, || {
        let mut worker = MockWorker::new();
        worker.expect_describe().return_const("worker-b".to_string());
        worker.expect_priority().return_const(5i64);
        worker
            .expect_list_cookbooks()
            .returning(|| Ok(vec![remote("tea", "1.0.0", "https://b/tea", 5)]));
        // The losing report's metadata is never consulted.
        worker.expect_metadata().never();
        worker.expect_shutdown().returning(|| ());
        worker
    });

    let manager = Arc::new(CacheManager::new());
    let builder = CacheBuilder::new(Arc::clone(&manager), vec![a, b], settings());
    let outcome = builder.build().await;

    assert_eq!(
        outcome,
        CycleOutcome::Published {
            cookbooks: 1,
            failed_workers: 0
        }
    );
    let snapshot = manager.current();
    let entry = snapshot.universe.get("tea", "1.0.0").expect("tea published");
    assert!(entry.dependencies.is_empty());
    assert_eq!(entry.location_path, "https://a/tea");
    assert_eq!(snapshot.origin("tea", "1.0.0").map(|o| o.worker), Some(0));
}

#[tokio::test]
async fn absent_metadata_still_publishes_the_entry() {
    let worker = spawn(0, || {
        mock(
            "worker",
            0,
            vec![remote("bare", "0.1.0", "https://x/bare", 0)],
            None,
        )
    });
    let manager = Arc::new(CacheManager::new());
    let builder = CacheBuilder::new(Arc::clone(&manager), vec![worker], settings());
    builder.build().await;

    let entry = manager
        .current()
        .universe
        .get("bare", "0.1.0")
        .cloned()
        .expect("entry kept");
    assert!(entry.dependencies.is_empty());
    assert!(entry.platforms.is_empty());
}

#[tokio::test(start_paused = true)]
async fn timed_out_worker_does_not_block_the_cycle() {
    let slow = spawn_arc(0, || Arc::new(SlowWorker) as Arc<dyn Worker>);
    let fast = spawn(1, || {
        mock(
            "fast",
            1,
            vec![remote("quick", "1.0.0", "https://fast/quick", 1)],
            Some(deps(&[("other", ">= 1.0")])),
        )
    });

    let manager = Arc::new(CacheManager::new());
    let builder = CacheBuilder::new(Arc::clone(&manager), vec![slow, fast], settings());
    let outcome = builder.build().await;

    assert_eq!(
        outcome,
        CycleOutcome::Published {
            cookbooks: 1,
            failed_workers: 1
        }
    );
    assert!(manager.is_warmed());
    let snapshot = manager.current();
    assert!(snapshot.universe.get("late", "1.0.0").is_none());
    assert_eq!(
        snapshot.universe.get("quick", "1.0.0").unwrap().dependencies["other"],
        ">= 1.0"
    );
}

#[tokio::test(start_paused = true)]
async fn cycle_timeout_bounds_listing_and_merge() {
    let slow = spawn_arc(0, || Arc::new(SlowWorker) as Arc<dyn Worker>);
    let manager = Arc::new(CacheManager::new());
    let mut bounded = settings();
    bounded.worker_timeout = Duration::from_secs(120);
    bounded.cycle_timeout = Duration::from_secs(10);
    let builder = CacheBuilder::new(Arc::clone(&manager), vec![slow], bounded);

    assert_eq!(builder.build().await, CycleOutcome::TimedOut);
    assert!(!manager.is_warmed());
}

#[tokio::test(start_paused = true)]
async fn metadata_resolution_is_not_cut_short_by_the_cycle_timeout() {
    let worker = spawn_arc(0, || Arc::new(SlowMetadata) as Arc<dyn Worker>);
    let manager = Arc::new(CacheManager::new());
    let mut bounded = settings();
    bounded.worker_timeout = Duration::from_secs(20);
    bounded.cycle_timeout = Duration::from_secs(5);
    let builder = CacheBuilder::new(Arc::clone(&manager), vec![worker], bounded);

    assert_eq!(
        builder.build().await,
        CycleOutcome::Published {
            cookbooks: 2,
            failed_workers: 0
        }
    );
    let snapshot = manager.current();
    for (name, version) in [("tea", "1.0.0"), ("milk", "2.0.0")] {
        assert_eq!(
            snapshot.universe.get(name, version).unwrap().dependencies["water"],
            ">= 1.0"
        );
    }
}

#[tokio::test(start_paused = true)]
async fn cancellation_lets_the_running_cycle_finish_without_publishing() {
    let dir = tempfile::tempdir().unwrap();
    let save_path = dir.path().join(persistence::SAVE_FILE);
    let cancel = CancellationToken::new();
    let factory: WorkerFactory = Arc::new(|| Ok(Arc::new(SlowMetadata) as Arc<dyn Worker>));
    let (worker, actor) = spawn_worker(0, factory, RestartPolicy::default(), cancel.clone()).unwrap();

    let manager = Arc::new(CacheManager::new());
    let mut with_save = settings();
    with_save.save_path = Some(save_path.clone());
    let builder = Arc::new(CacheBuilder::new(Arc::clone(&manager), vec![worker], with_save));
    let run = tokio::spawn({
        let builder = Arc::clone(&builder);
        let cancel = cancel.clone();
        async move { builder.run(cancel).await }
    });

    // Listing is done and metadata requests are in flight.
    tokio::time::sleep(Duration::from_secs(1)).await;
    cancel.cancel();
    run.await.unwrap();

    assert!(actor.await.unwrap().is_ok());
    assert!(!manager.is_warmed());
    assert!(!save_path.exists());
}

#[tokio::test]
async fn all_failed_cycle_keeps_warmed_snapshot() {
    let calls = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&calls);
    // First answer succeeds, every later one fails.
    let flaky = spawn(0, move || {
        let counter = Arc::clone(&counter);
        let mut worker = MockWorker::new();
        worker.expect_describe().return_const("flaky".to_string());
        worker.expect_priority().return_const(0i64);
        worker.expect_list_cookbooks().returning(move || {
            if counter.fetch_add(1, Ordering::SeqCst) == 0 {
                Ok(vec![remote("keep", "1.0.0", "https://x/keep", 0)])
            } else {
                Err(SourceUnavailableError::Closed)
            }
        });
        worker.expect_metadata().returning(|_| None);
        worker.expect_shutdown().returning(|| ());
        worker
    });
    let broken = spawn(1, || failing("broken"));

    let manager = Arc::new(CacheManager::new());
    let builder = CacheBuilder::new(Arc::clone(&manager), vec![flaky, broken], settings());

    assert!(matches!(builder.build().await, CycleOutcome::Published { .. }));
    let first = manager.current();

    assert_eq!(builder.build().await, CycleOutcome::Failed);
    assert!(manager.is_warmed());
    assert!(Arc::ptr_eq(&first, &manager.current()));
    assert!(manager.current().universe.get("keep", "1.0.0").is_some());
}

#[tokio::test]
async fn all_failed_first_cycle_stays_unwarmed() {
    let broken = spawn(0, || failing("broken"));
    let manager = Arc::new(CacheManager::new());
    let builder = CacheBuilder::new(Arc::clone(&manager), vec![broken], settings());

    assert_eq!(builder.build().await, CycleOutcome::Failed);
    assert!(!manager.is_warmed());
}

#[tokio::test]
async fn panicking_worker_counts_as_failed_and_is_rebuilt() {
    let builds = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&builds);
    let panicky = spawn(0, move || {
        counter.fetch_add(1, Ordering::SeqCst);
        let mut worker = MockWorker::new();
        worker.expect_describe().return_const("panicky".to_string());
        worker.expect_priority().return_const(0i64);
        worker
            .expect_list_cookbooks()
            .returning(|| panic!("connection actor died"));
        worker.expect_shutdown().returning(|| ());
        worker
    });
    let healthy = spawn(1, || {
        mock("healthy", 1, vec![remote("ok", "1.0.0", "https://h/ok", 1)], None)
    });

    let manager = Arc::new(CacheManager::new());
    let builder = CacheBuilder::new(Arc::clone(&manager), vec![panicky, healthy], settings());
    let outcome = builder.build().await;

    assert_eq!(
        outcome,
        CycleOutcome::Published {
            cookbooks: 1,
            failed_workers: 1
        }
    );
    // Give the actor a moment to rebuild after the crash.
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(builds.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn metadata_is_reused_for_unchanged_locations() {
    let mut saved = Universe::new();
    saved.insert(
        &remote("stable", "1.0.0", "https://x/stable", 0),
        deps(&[("from-save", ">= 1.0")]),
    );
    saved.insert(
        &remote("tip", "0.0.0", "https://x/tip", 0),
        deps(&[("stale", ">= 0.0.0")]),
    );
    saved.insert(
        &remote("moved", "1.0.0", "https://old/moved", 0),
        deps(&[("stale", ">= 0.0.0")]),
    );

    let worker = spawn(0, || {
        let mut worker = MockWorker::new();
        worker.expect_describe().return_const("worker".to_string());
        worker.expect_priority().return_const(0i64);
        worker.expect_list_cookbooks().returning(|| {
            Ok(vec![
                remote("stable", "1.0.0", "https://x/stable", 0),
                remote("tip", "0.0.0", "https://x/tip", 0),
                remote("moved", "1.0.0", "https://new/moved", 0),
            ])
        });
        worker
            .expect_metadata()
            .withf(|r: &RemoteCookbook| r.name() == "stable")
            .never();
        worker
            .expect_metadata()
            .returning(|_| Some(deps(&[("fresh", ">= 2.0")])));
        worker.expect_shutdown().returning(|| ());
        worker
    });

    let manager = Arc::new(CacheManager::seeded(saved));
    let builder = CacheBuilder::new(Arc::clone(&manager), vec![worker], settings());
    builder.build().await;

    let snapshot = manager.current();
    let dependency_names = |name: &str, version: &str| -> Vec<String> {
        snapshot
            .universe
            .get(name, version)
            .map(|e| e.dependencies.keys().cloned().collect())
            .unwrap_or_default()
    };
    assert_eq!(dependency_names("stable", "1.0.0"), vec!["from-save"]);
    assert_eq!(dependency_names("tip", "0.0.0"), vec!["fresh"]);
    assert_eq!(dependency_names("moved", "1.0.0"), vec!["fresh"]);
}

#[tokio::test]
async fn published_universe_is_saved() {
    let dir = tempfile::tempdir().unwrap();
    let save_path = dir.path().join(persistence::SAVE_FILE);
    let worker = spawn(0, || {
        mock(
            "worker",
            0,
            vec![remote("saved", "2.1.0", "https://x/saved", 0)],
            Some(deps(&[("dep", "~> 1.0")])),
        )
    });

    let manager = Arc::new(CacheManager::new());
    let mut with_save = settings();
    with_save.save_path = Some(save_path.clone());
    let builder = CacheBuilder::new(Arc::clone(&manager), vec![worker], with_save);
    builder.build().await;

    let loaded = persistence::load(&save_path).expect("save file written");
    assert_eq!(loaded, manager.current().universe);
}

#[tokio::test]
async fn no_workers_publishes_an_empty_universe() {
    let manager = Arc::new(CacheManager::new());
    let builder = CacheBuilder::new(Arc::clone(&manager), vec![], settings());
    assert_eq!(
        builder.build().await,
        CycleOutcome::Published {
            cookbooks: 0,
            failed_workers: 0
        }
    );
    assert!(manager.is_warmed());
}

#[tokio::test]
async fn run_executes_first_cycle_immediately_and_stops_on_cancel() {
    let worker = spawn(0, || {
        mock("worker", 0, vec![remote("now", "1.0.0", "https://x/now", 0)], None)
    });
    let manager = Arc::new(CacheManager::new());
    let mut rx = manager.subscribe();
    let builder = Arc::new(CacheBuilder::new(
        Arc::clone(&manager),
        vec![worker],
        settings(),
    ));
    let cancel = CancellationToken::new();
    let task = {
        let builder = Arc::clone(&builder);
        let cancel = cancel.clone();
        tokio::spawn(async move { builder.run(cancel).await })
    };

    // The interval is five minutes; the first publish must not wait for it.
    tokio::time::timeout(Duration::from_secs(5), rx.changed())
        .await
        .expect("first cycle ran immediately")
        .unwrap();
    assert!(manager.is_warmed());

    cancel.cancel();
    tokio::time::timeout(Duration::from_secs(5), task)
        .await
        .expect("builder stops on cancel")
        .unwrap();
}
