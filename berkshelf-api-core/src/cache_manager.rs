//! Holds the universe currently being served.
//!
//! Readers take an `Arc<Snapshot>` and keep a consistent view for as long as they hold it;
//! the builder replaces the whole snapshot in one step. State only moves forward:
//! `Cold -> Warming -> Warmed`, and `Warmed` is never left.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::watch;
use tracing::info;

use crate::model::{CookbookKey, RemoteCookbook, Universe};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheState {
    /// Nothing published and no cycle started.
    Cold,
    /// A cycle is running and nothing has been published yet.
    Warming,
    /// At least one cycle has published.
    Warmed,
}

impl CacheState {
    fn from_u8(raw: u8) -> Self {
        match raw {
            0 => CacheState::Cold,
            1 => CacheState::Warming,
            _ => CacheState::Warmed,
        }
    }

    fn as_u8(self) -> u8 {
        match self {
            CacheState::Cold => 0,
            CacheState::Warming => 1,
            CacheState::Warmed => 2,
        }
    }
}

/// Which worker won a `(name, version)` and the record it reported.
#[derive(Debug, Clone, PartialEq)]
pub struct Origin {
    /// Registration index of the owning worker.
    pub worker: usize,
    pub remote: RemoteCookbook,
}

/// One immutable published view.
#[derive(Debug, Clone, Default)]
pub struct Snapshot {
    pub universe: Universe,
    pub origins: HashMap<CookbookKey, Origin>,
    pub warmed: bool,
    pub last_updated: Option<DateTime<Utc>>,
}

impl Snapshot {
    pub fn origin(&self, name: &str, version: &str) -> Option<&Origin> {
        self.origins.get(&CookbookKey::new(name, version))
    }
}

pub struct CacheManager {
    state: AtomicU8,
    current: watch::Sender<Arc<Snapshot>>,
}

impl Default for CacheManager {
    fn default() -> Self {
        Self::new()
    }
}

impl CacheManager {
    /// A cold manager serving an empty universe.
    pub fn new() -> Self {
        Self::with_snapshot(Snapshot::default())
    }

    /// A manager answering from a previously saved universe. Still cold: only a
    /// completed cycle warms the cache.
    pub fn seeded(universe: Universe) -> Self {
        Self::with_snapshot(Snapshot {
            universe,
            ..Snapshot::default()
        })
    }

    fn with_snapshot(snapshot: Snapshot) -> Self {
        let (current, _) = watch::channel(Arc::new(snapshot));
        Self {
            state: AtomicU8::new(CacheState::Cold.as_u8()),
            current,
        }
    }

    pub fn state(&self) -> CacheState {
        CacheState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub fn is_warmed(&self) -> bool {
        self.state() == CacheState::Warmed
    }

    /// Mark a crawl cycle as started. Only moves `Cold` to `Warming`.
    pub fn begin_cycle(&self) {
        let _ = self.state.compare_exchange(
            CacheState::Cold.as_u8(),
            CacheState::Warming.as_u8(),
            Ordering::AcqRel,
            Ordering::Acquire,
        );
    }

    /// The snapshot being served right now.
    pub fn current(&self) -> Arc<Snapshot> {
        self.current.borrow().clone()
    }

    /// Replace the served snapshot and mark the cache warmed.
    pub fn publish(&self, universe: Universe, origins: HashMap<CookbookKey, Origin>) -> Arc<Snapshot> {
        let snapshot = Arc::new(Snapshot {
            universe,
            origins,
            warmed: true,
            last_updated: Some(Utc::now()),
        });
        let count = snapshot.universe.len();
        self.current.send_replace(Arc::clone(&snapshot));
        let previous = self.state.swap(CacheState::Warmed.as_u8(), Ordering::AcqRel);
        if CacheState::from_u8(previous) != CacheState::Warmed {
            info!(cookbooks = count, "Cache warmed");
        }
        snapshot
    }

    /// Notified on every publish.
    pub fn subscribe(&self) -> watch::Receiver<Arc<Snapshot>> {
        self.current.subscribe()
    }
}
