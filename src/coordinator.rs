//! Refresh scheduling across all configured sources.
//!
//! One refresh cycle fans out to every source at once, merges whatever
//! succeeded into the registry and notifies listeners. The next cycle is
//! armed on a timer for the earliest instant any source wants to fetch
//! again. Each scheduling pass stamps a generation counter; a timer only
//! fires its refresh if the generation is unchanged, so a newer refresh
//! silently supersedes any pending timer.

use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use futures::FutureExt;
use futures::future::{BoxFuture, join_all};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::listeners::Listeners;
use crate::registry::StationRegistry;
use crate::source::{DEFAULT_FAILURE_BACKOFF, Refreshed, Source};
use crate::stats::FeedStats;

/// Latest a next cycle is scheduled, whatever the sources report.
pub const DEFAULT_MAX_REFRESH_DELAY: Duration = Duration::from_secs(5 * 60);

/// Minimum spacing between two scheduled cycles.
pub const DEFAULT_MIN_REFRESH_SPACING: Duration = Duration::from_secs(1);

/// Scheduling parameters of the coordinator.
#[derive(Debug, Clone)]
pub struct CoordinatorSettings {
    pub max_refresh_delay: Duration,
    pub min_refresh_spacing: Duration,
    pub failure_backoff: Duration,
}

impl Default for CoordinatorSettings {
    fn default() -> Self {
        Self {
            max_refresh_delay: DEFAULT_MAX_REFRESH_DELAY,
            min_refresh_spacing: DEFAULT_MIN_REFRESH_SPACING,
            failure_backoff: DEFAULT_FAILURE_BACKOFF,
        }
    }
}

/// What a call to [`RefreshCoordinator::refresh_all`] did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefreshOutcome {
    /// A cycle ran and the next one is armed.
    Completed {
        next_refresh_in: Duration,
        failed_sources: usize,
    },

    /// Another cycle was already running; nothing was done.
    Skipped,

    /// The coordinator has been shut down.
    Stopped,
}

/// Clears the refreshing flag however the cycle ends.
struct RefreshGuard<'a>(&'a AtomicBool);

impl Drop for RefreshGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// Owns the refresh loop over all sources.
pub struct RefreshCoordinator {
    sources: Vec<Arc<dyn Source>>,
    registry: Arc<StationRegistry>,
    listeners: Arc<Listeners>,
    stats: Arc<FeedStats>,
    settings: CoordinatorSettings,
    last_failures: Mutex<Vec<Option<String>>>,
    refreshing: AtomicBool,
    alive: AtomicBool,
    generation: AtomicU64,
}

impl RefreshCoordinator {
    pub fn new(
        sources: Vec<Arc<dyn Source>>,
        registry: Arc<StationRegistry>,
        listeners: Arc<Listeners>,
        stats: Arc<FeedStats>,
        settings: CoordinatorSettings,
    ) -> Arc<Self> {
        Arc::new(Self {
            last_failures: Mutex::new(vec![None; sources.len()]),
            sources,
            registry,
            listeners,
            stats,
            settings,
            refreshing: AtomicBool::new(false),
            alive: AtomicBool::new(true),
            generation: AtomicU64::new(0),
        })
    }

    pub fn sources(&self) -> &[Arc<dyn Source>] {
        &self.sources
    }

    pub fn registry(&self) -> &Arc<StationRegistry> {
        &self.registry
    }

    pub fn listeners(&self) -> &Arc<Listeners> {
        &self.listeners
    }

    pub fn is_refreshing(&self) -> bool {
        self.refreshing.load(Ordering::Acquire)
    }

    /// Current scheduling generation; bumped by every cycle and every timer.
    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::SeqCst)
    }

    /// Errors of all failing sources, one per line.
    pub fn error(&self) -> Option<String> {
        let errors: Vec<String> = self
            .sources
            .iter()
            .filter_map(|source| source.error().map(|e| format!("{}: {}", source.name(), e)))
            .collect();

        if errors.is_empty() {
            None
        } else {
            Some(errors.join("\n"))
        }
    }

    /// Run the first cycle in the background; later cycles arm themselves.
    pub fn start(self: &Arc<Self>) -> JoinHandle<RefreshOutcome> {
        info!("Starting refresh of {} sources", self.sources.len());
        tokio::spawn(self.refresh_all(false))
    }

    /// Stop scheduling. Pending timers become stale and listeners are dropped.
    pub fn shutdown(&self) {
        info!("Shutting down refresh coordinator");
        self.alive.store(false, Ordering::SeqCst);
        self.generation.fetch_add(1, Ordering::SeqCst);
        self.listeners.clear();
    }

    /// Refresh every source and merge the results.
    ///
    /// A no-op while another cycle is running. Otherwise listeners are fired
    /// once the cycle finishes, whether or not sources failed.
    pub fn refresh_all(self: &Arc<Self>, force: bool) -> BoxFuture<'static, RefreshOutcome> {
        let coordinator = Arc::clone(self);
        async move { coordinator.run_refresh(force).await }.boxed()
    }

    async fn run_refresh(self: Arc<Self>, force: bool) -> RefreshOutcome {
        if !self.alive.load(Ordering::SeqCst) {
            return RefreshOutcome::Stopped;
        }

        if self
            .refreshing
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            debug!("Refresh already in progress, skipping");
            self.stats.record_skipped();
            return RefreshOutcome::Skipped;
        }

        let (deadline, failed_sources) = {
            let _guard = RefreshGuard(&self.refreshing);
            self.generation.fetch_add(1, Ordering::SeqCst);
            self.run_cycle(force).await
        };
        self.stats.record_cycle();

        let next_refresh_in = self.schedule(deadline);
        info!(
            "Refresh finished: {} stations, {} of {} sources failed, next in {:?}",
            self.registry.len(),
            failed_sources,
            self.sources.len(),
            next_refresh_in
        );

        self.listeners.fire();

        RefreshOutcome::Completed {
            next_refresh_in,
            failed_sources,
        }
    }

    /// One fan-out pass. Returns the earliest next deadline and the number
    /// of failed sources.
    async fn run_cycle(&self, force: bool) -> (Instant, usize) {
        let started = Instant::now();
        debug!("Refreshing {} sources (force: {})", self.sources.len(), force);

        // None marks a source that panicked.
        let results = join_all(self.sources.iter().map(|source| async move {
            match AssertUnwindSafe(source.refresh(force)).catch_unwind().await {
                Ok(result) => Some(result),
                Err(_) => None,
            }
        }))
        .await;

        let mut deadline = started + self.settings.max_refresh_delay;
        let mut failed_sources = 0;

        for (index, (source, result)) in self.sources.iter().zip(results).enumerate() {
            match result {
                Some(Ok(Refreshed {
                    stations,
                    next_refresh,
                })) => {
                    self.registry.merge_stations(&stations);
                    self.note_result(index, None);
                    deadline = deadline.min(next_refresh);
                }
                Some(Err(e)) => {
                    if self.note_result(index, Some(e.to_string())) {
                        warn!("Source \"{}\" failed: {}", source.name(), e);
                    } else {
                        debug!("Source \"{}\" still failing: {}", source.name(), e);
                    }
                    failed_sources += 1;
                    deadline = deadline.min(source.next_refresh());
                }
                None => {
                    error!("Source \"{}\" panicked during refresh", source.name());
                    self.note_result(index, Some("refresh panicked".to_string()));
                    failed_sources += 1;
                    deadline = deadline.min(started + self.settings.failure_backoff);
                }
            }
        }

        (deadline, failed_sources)
    }

    /// Remember the last failure of a source. True if it differs from the
    /// failure seen in the previous cycle.
    fn note_result(&self, index: usize, failure: Option<String>) -> bool {
        let mut failures = self
            .last_failures
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());

        let changed = failures[index] != failure;
        failures[index] = failure;
        changed
    }

    /// Arm the timer for the next cycle and return its delay.
    fn schedule(self: &Arc<Self>, deadline: Instant) -> Duration {
        let delay = deadline
            .saturating_duration_since(Instant::now())
            .max(self.settings.min_refresh_spacing);

        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let coordinator: Weak<Self> = Arc::downgrade(self);

        tokio::spawn(async move {
            tokio::time::sleep(delay).await;

            let Some(coordinator) = coordinator.upgrade() else {
                return;
            };
            if coordinator.generation.load(Ordering::SeqCst) != generation {
                debug!("Dropping stale refresh timer (generation {})", generation);
                return;
            }

            coordinator.refresh_all(false).await;
        });

        delay
    }
}

impl std::fmt::Debug for RefreshCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RefreshCoordinator")
            .field("sources", &self.sources.len())
            .field("refreshing", &self.is_refreshing())
            .field("generation", &self.generation())
            .finish()
    }
}
