//! Data sources: fetch, parse and cache one upstream feed.
//!
//! Every source implements [`Source`]. The live and simulated variants share
//! the same engine, [`FeedSource`], which owns the fetch cadence and the
//! in-flight de-duplication; they only differ in the [`Feed`] that produces
//! the raw text.
//!
//! A source fetches again only once its next-allowed-refresh instant has
//! passed (or when forced). Callers arriving while a fetch is in flight are
//! handed the same pending result, so a source never issues two fetches for
//! the same data at once.

use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{TimeDelta, Utc};
use futures::FutureExt;
use futures::future::{BoxFuture, Shared};
use thiserror::Error;
use tokio::time::Instant;
use tracing::{debug, error, warn};

use crate::parser::parse_feed_with_report;
use crate::station::{Reference, StationRecord};
use crate::stats::FeedStats;

/// Delay before a failed source may fetch again.
pub const DEFAULT_FAILURE_BACKOFF: Duration = Duration::from_secs(60);

/// Errors from fetching a feed.
///
/// Messages only, so one failed fetch can be handed to every waiting caller.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum SourceError {
    #[error("HTTP error: {0}")]
    Http(String),

    #[error("Feed returned status {0}")]
    Status(u16),

    #[error("Request timed out")]
    Timeout,

    #[error("Feed unavailable: {0}")]
    Unavailable(String),
}

impl From<reqwest::Error> for SourceError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            SourceError::Timeout
        } else if let Some(status) = err.status() {
            SourceError::Status(status.as_u16())
        } else {
            SourceError::Http(err.to_string())
        }
    }
}

/// Static description of a source, shown for attribution.
#[derive(Debug, Clone, PartialEq)]
pub struct SourceDescriptor {
    /// Human-readable source name, part of every station identity.
    pub name: String,

    /// Attribution text to display next to the data.
    pub disclaimer: String,

    /// Link to the data provider.
    pub link: String,

    /// How long parsed data is served before fetching again.
    pub interval: Duration,
}

/// Result of a successful refresh.
#[derive(Debug, Clone)]
pub struct Refreshed {
    /// Stations from the most recent parse of the feed.
    pub stations: Arc<Vec<StationRecord>>,

    /// Earliest instant at which the source will fetch again.
    pub next_refresh: Instant,
}

/// A provider of station data.
///
/// Consumers hold sources as `Arc<dyn Source>` and never see the variant.
#[async_trait]
pub trait Source: Send + Sync {
    fn descriptor(&self) -> &SourceDescriptor;

    fn name(&self) -> &str {
        &self.descriptor().name
    }

    fn disclaimer(&self) -> &str {
        &self.descriptor().disclaimer
    }

    fn link(&self) -> &str {
        &self.descriptor().link
    }

    fn interval(&self) -> Duration {
        self.descriptor().interval
    }

    /// Error of the most recent fetch, if it failed.
    fn error(&self) -> Option<String>;

    /// Earliest instant at which the source will fetch again.
    fn next_refresh(&self) -> Instant;

    /// Fetch and parse the feed if due (or forced), otherwise serve the
    /// previous result.
    async fn refresh(&self, force: bool) -> Result<Refreshed, SourceError>;

    /// Browse list of all stations of this source.
    async fn references(&self) -> Vec<Reference>;

    /// Data for one station. Never fails: misses and fetch failures resolve
    /// to a placeholder record carrying the error message.
    async fn station_data(&self, name: Option<&str>, site: Option<&str>) -> StationRecord;
}

/// Producer of raw feed text.
#[async_trait]
pub trait Feed: Send + Sync + 'static {
    async fn fetch(&self) -> Result<String, SourceError>;
}

/// Per-source settings of the shared engine.
#[derive(Debug, Clone)]
pub struct FeedSettings {
    /// Offset the feed's timestamps are ahead of UTC; subtracted after parsing.
    pub utc_offset: TimeDelta,

    /// Delay before fetching again after a failed fetch.
    pub failure_backoff: Duration,
}

impl Default for FeedSettings {
    fn default() -> Self {
        Self {
            utc_offset: TimeDelta::zero(),
            failure_backoff: DEFAULT_FAILURE_BACKOFF,
        }
    }
}

type Loaded = Result<Arc<Vec<StationRecord>>, SourceError>;

type PendingLoad = Shared<BoxFuture<'static, Loaded>>;

struct CacheState {
    next_refresh: Instant,
    error: Option<String>,
    pending: Option<PendingLoad>,
}

struct Inner<F> {
    descriptor: SourceDescriptor,
    settings: FeedSettings,
    feed: F,
    stats: Arc<FeedStats>,
    state: Mutex<CacheState>,
}

impl<F: Feed> Inner<F> {
    fn lock(&self) -> MutexGuard<'_, CacheState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Fetch and parse, turning a panic into an error so the shared load
    /// always settles.
    async fn load_settled(self: Arc<Self>) -> Loaded {
        match AssertUnwindSafe(Arc::clone(&self).fetch_and_parse())
            .catch_unwind()
            .await
        {
            Ok(loaded) => loaded,
            Err(_) => {
                error!("Source \"{}\" panicked while fetching", self.descriptor.name);
                Err(self.fail(SourceError::Unavailable("fetch panicked".to_string())))
            }
        }
    }

    fn fail(&self, e: SourceError) -> SourceError {
        let mut state = self.lock();
        state.error = Some(e.to_string());
        state.next_refresh = Instant::now() + self.settings.failure_backoff;
        e
    }

    async fn fetch_and_parse(self: Arc<Self>) -> Loaded {
        let name = &self.descriptor.name;
        debug!("Fetching feed for source \"{}\" ...", name);

        let started = Instant::now();
        let result = self.feed.fetch().await;
        self.stats
            .record_fetch(name, started.elapsed(), result.is_ok());

        match result {
            Ok(text) => {
                let (stations, report) = parse_feed_with_report(&text);
                self.stats.record_parse(&report);

                let mut state = self.lock();
                state.error = None;
                let refreshed_at = Utc::now();
                let stations: Vec<StationRecord> = stations
                    .into_iter()
                    .map(|mut station| {
                        station.shift_samples(-self.settings.utc_offset);
                        station.refreshed_at = Some(refreshed_at);
                        station.next_refresh = Some(state.next_refresh);
                        station.with_source(name.as_str())
                    })
                    .collect();

                debug!(
                    "Source \"{}\" delivered {} stations",
                    name,
                    stations.len()
                );
                Ok(Arc::new(stations))
            }
            Err(e) => {
                warn!("Fetching source \"{}\" failed: {}", name, e);
                Err(self.fail(e))
            }
        }
    }
}

/// The fetch/parse/cache engine behind every source variant.
pub struct FeedSource<F> {
    inner: Arc<Inner<F>>,
}

impl<F: Feed> FeedSource<F> {
    pub fn with_feed(
        descriptor: SourceDescriptor,
        settings: FeedSettings,
        feed: F,
        stats: Arc<FeedStats>,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                descriptor,
                settings,
                feed,
                stats,
                state: Mutex::new(CacheState {
                    next_refresh: Instant::now(),
                    error: None,
                    pending: None,
                }),
            }),
        }
    }

    /// The feed behind this source.
    pub fn feed(&self) -> &F {
        &self.inner.feed
    }

    /// Current data, fetching first if due.
    async fn load(&self, force: bool) -> Loaded {
        let pending = {
            let mut state = self.inner.lock();
            let now = Instant::now();

            let in_flight = state
                .pending
                .as_ref()
                .filter(|pending| pending.peek().is_none())
                .cloned();

            match (in_flight, state.pending.clone()) {
                (Some(in_flight), _) => in_flight,
                (None, Some(settled)) if !force && now < state.next_refresh => settled,
                _ => {
                    state.next_refresh = now + self.inner.descriptor.interval;
                    let load = Arc::clone(&self.inner).load_settled().boxed().shared();
                    state.pending = Some(load.clone());
                    load
                }
            }
        };

        pending.await
    }

    fn placeholder(&self, name: Option<&str>, site: Option<&str>, error: String) -> StationRecord {
        StationRecord::placeholder(
            name.unwrap_or_default(),
            site.unwrap_or_default(),
            self.inner.descriptor.name.as_str(),
            error,
            self.next_refresh(),
        )
    }
}

/// Find a station by name and site, then by name alone, then by site alone.
pub fn find_station<'a>(
    stations: &'a [StationRecord],
    name: Option<&str>,
    site: Option<&str>,
) -> Option<&'a StationRecord> {
    let by_both = match (name, site) {
        (Some(name), Some(site)) => stations.iter().find(|s| s.name == name && s.site == site),
        _ => None,
    };

    by_both
        .or_else(|| name.and_then(|name| stations.iter().find(|s| s.name == name)))
        .or_else(|| site.and_then(|site| stations.iter().find(|s| s.site == site)))
}

#[async_trait]
impl<F: Feed> Source for FeedSource<F> {
    fn descriptor(&self) -> &SourceDescriptor {
        &self.inner.descriptor
    }

    fn error(&self) -> Option<String> {
        self.inner.lock().error.clone()
    }

    fn next_refresh(&self) -> Instant {
        self.inner.lock().next_refresh
    }

    async fn refresh(&self, force: bool) -> Result<Refreshed, SourceError> {
        let stations = self.load(force).await?;
        Ok(Refreshed {
            stations,
            next_refresh: self.next_refresh(),
        })
    }

    async fn references(&self) -> Vec<Reference> {
        match self.load(false).await {
            Ok(stations) => {
                let mut references: Vec<Reference> =
                    stations.iter().map(StationRecord::to_reference).collect();
                references.sort_by(|a, b| a.key().cmp(&b.key()));
                references
            }
            Err(_) => Vec::new(),
        }
    }

    async fn station_data(&self, name: Option<&str>, site: Option<&str>) -> StationRecord {
        match self.load(false).await {
            Ok(stations) => match find_station(&stations, name, site) {
                Some(station) => station.clone(),
                None => self.placeholder(
                    name,
                    site,
                    format!(
                        "No data for station {}",
                        name.or(site).unwrap_or("(unnamed)")
                    ),
                ),
            },
            Err(e) => self.placeholder(name, site, e.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::sync::Notify;

    const FEED: &str = "\
#ZRXPVERSION2300.100|*|SNAMEStrobl|*|SWATERWolfgangsee|*|
20230615120000 18.4
#ZRXPVERSION2300.100|*|SNAMEGmunden|*|SWATERTraunsee|*|
20230615120000 16.5
";

    /// Feed that counts fetches and optionally waits for a gate.
    struct CountingFeed {
        fetches: AtomicUsize,
        gate: Option<Arc<Notify>>,
        fail: bool,
    }

    impl CountingFeed {
        fn new() -> Self {
            Self {
                fetches: AtomicUsize::new(0),
                gate: None,
                fail: false,
            }
        }
    }

    #[async_trait]
    impl Feed for CountingFeed {
        async fn fetch(&self) -> Result<String, SourceError> {
            self.fetches.fetch_add(1, Ordering::SeqCst);
            if let Some(ref gate) = self.gate {
                gate.notified().await;
            }
            if self.fail {
                return Err(SourceError::Http("connection refused".to_string()));
            }
            Ok(FEED.to_string())
        }
    }

    fn descriptor() -> SourceDescriptor {
        SourceDescriptor {
            name: "Test".to_string(),
            disclaimer: "Test data".to_string(),
            link: "https://example.com".to_string(),
            interval: Duration::from_secs(300),
        }
    }

    fn source(feed: CountingFeed) -> FeedSource<CountingFeed> {
        FeedSource::with_feed(
            descriptor(),
            FeedSettings::default(),
            feed,
            Arc::new(FeedStats::new()),
        )
    }

    #[tokio::test(start_paused = true)]
    async fn test_serves_cached_result_until_due() {
        let source = source(CountingFeed::new());

        let first = source.refresh(false).await.unwrap();
        let second = source.refresh(false).await.unwrap();

        assert_eq!(source.feed().fetches.load(Ordering::SeqCst), 1);
        assert_eq!(first.stations.len(), 2);
        assert!(Arc::ptr_eq(&first.stations, &second.stations));
        assert_eq!(first.next_refresh, second.next_refresh);

        tokio::time::advance(Duration::from_secs(301)).await;
        source.refresh(false).await.unwrap();
        assert_eq!(source.feed().fetches.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_force_fetches_again() {
        let source = source(CountingFeed::new());

        source.refresh(false).await.unwrap();
        source.refresh(true).await.unwrap();

        assert_eq!(source.feed().fetches.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_concurrent_callers_share_in_flight_fetch() {
        let gate = Arc::new(Notify::new());
        let source = Arc::new(source(CountingFeed {
            gate: Some(Arc::clone(&gate)),
            ..CountingFeed::new()
        }));

        let first = tokio::spawn({
            let source = Arc::clone(&source);
            async move { source.refresh(false).await }
        });
        let second = tokio::spawn({
            let source = Arc::clone(&source);
            async move { source.refresh(true).await }
        });

        while source.feed().fetches.load(Ordering::SeqCst) == 0 {
            tokio::task::yield_now().await;
        }
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
        gate.notify_one();

        let first = first.await.unwrap().unwrap();
        let second = second.await.unwrap().unwrap();

        assert_eq!(source.feed().fetches.load(Ordering::SeqCst), 1);
        assert!(Arc::ptr_eq(&first.stations, &second.stations));
    }

    #[tokio::test(start_paused = true)]
    async fn test_failure_sets_error_and_backoff() {
        let source = source(CountingFeed {
            fail: true,
            ..CountingFeed::new()
        });

        let before = Instant::now();
        let result = source.refresh(false).await;

        assert!(matches!(result, Err(SourceError::Http(_))));
        assert_eq!(
            source.error().as_deref(),
            Some("HTTP error: connection refused")
        );
        assert_eq!(source.next_refresh(), before + DEFAULT_FAILURE_BACKOFF);
    }

    #[tokio::test]
    async fn test_station_data_on_failure_is_placeholder() {
        let source = source(CountingFeed {
            fail: true,
            ..CountingFeed::new()
        });

        let station = source.station_data(Some("Strobl"), Some("Wolfgangsee")).await;

        assert_eq!(station.name, "Strobl");
        assert_eq!(station.source, "Test");
        assert!(!station.has_samples());
        assert!(!station.error.unwrap_or_default().is_empty());
    }

    #[tokio::test]
    async fn test_station_data_lookup_fallbacks() {
        let source = source(CountingFeed::new());

        let exact = source.station_data(Some("Gmunden"), Some("Traunsee")).await;
        assert_eq!(exact.name, "Gmunden");
        assert_eq!(exact.source, "Test");
        assert!(exact.error.is_none());

        let by_name = source.station_data(Some("Strobl"), Some("Elsewhere")).await;
        assert_eq!(by_name.site, "Wolfgangsee");

        let by_site = source.station_data(Some("Nowhere"), Some("Traunsee")).await;
        assert_eq!(by_site.name, "Gmunden");

        let missing = source.station_data(Some("Nowhere"), None).await;
        assert!(!missing.has_samples());
        assert_eq!(missing.error.as_deref(), Some("No data for station Nowhere"));
    }

    #[tokio::test]
    async fn test_utc_offset_is_subtracted() {
        let source = FeedSource::with_feed(
            descriptor(),
            FeedSettings {
                utc_offset: TimeDelta::hours(1),
                ..FeedSettings::default()
            },
            CountingFeed::new(),
            Arc::new(FeedStats::new()),
        );

        let station = source.station_data(Some("Strobl"), None).await;
        let sample = station.most_recent_sample().unwrap();
        assert_eq!(sample.timestamp.to_rfc3339(), "2023-06-15T11:00:00+00:00");
    }

    #[tokio::test]
    async fn test_references_are_sorted() {
        let source = source(CountingFeed::new());
        let references = source.references().await;

        let names: Vec<_> = references
            .iter()
            .map(|r| r.station_name.clone().unwrap_or_default())
            .collect();
        assert_eq!(names, vec!["Gmunden", "Strobl"]);
        assert_eq!(references[1].temperature, Some(18.4));
        assert_eq!(references[1].source_name.as_deref(), Some("Test"));
    }

    #[test]
    fn test_find_station_without_hints() {
        let stations = vec![StationRecord::new("Strobl", "Wolfgangsee")];
        assert!(find_station(&stations, None, None).is_none());
        assert!(find_station(&[], Some("Strobl"), None).is_none());
    }

    /// Feed that panics on its first fetch only.
    struct PanicOnceFeed {
        fetches: AtomicUsize,
    }

    #[async_trait]
    impl Feed for PanicOnceFeed {
        async fn fetch(&self) -> Result<String, SourceError> {
            if self.fetches.fetch_add(1, Ordering::SeqCst) == 0 {
                panic!("feed exploded");
            }
            Ok(FEED.to_string())
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_panicking_fetch_settles_as_error() {
        let source = FeedSource::with_feed(
            descriptor(),
            FeedSettings::default(),
            PanicOnceFeed {
                fetches: AtomicUsize::new(0),
            },
            Arc::new(FeedStats::new()),
        );

        let before = Instant::now();
        let result = source.refresh(false).await;
        assert!(matches!(result, Err(SourceError::Unavailable(_))));
        assert_eq!(source.next_refresh(), before + DEFAULT_FAILURE_BACKOFF);

        // Served from cache until the backoff passes, then fetched again.
        assert!(source.refresh(false).await.is_err());
        assert_eq!(source.feed().fetches.load(Ordering::SeqCst), 1);

        tokio::time::advance(DEFAULT_FAILURE_BACKOFF).await;
        let refreshed = source.refresh(false).await.unwrap();
        assert_eq!(refreshed.stations.len(), 2);
        assert_eq!(source.feed().fetches.load(Ordering::SeqCst), 2);
        assert!(source.error().is_none());
    }
}
