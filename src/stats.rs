//! Statistics tracking for feed refreshes.
//!
//! Counters for fetches, parse diagnostics and refresh cycles, plus a
//! latency histogram. All recording goes through `&self` so one collector
//! can be shared by every source and the coordinator.

use hdrhistogram::Histogram;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::RwLock;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use crate::parser::ParseReport;

/// Upper bound of the latency histogram, one hour in milliseconds.
const MAX_TRACKED_LATENCY_MS: u64 = 3_600_000;

/// Thread-safe statistics collector for feed refreshes.
#[derive(Debug)]
pub struct FeedStats {
    /// Refresh cycles run by the coordinator
    pub refresh_cycles: AtomicU64,

    /// Refresh requests ignored because a cycle was already running
    pub skipped_refreshes: AtomicU64,

    /// Feed fetches attempted
    pub fetches: AtomicU64,

    /// Feed fetches that failed
    pub fetch_failures: AtomicU64,

    /// Stations delivered by successful parses
    pub stations_parsed: AtomicU64,

    /// Samples accepted by successful parses
    pub samples_parsed: AtomicU64,

    /// Blocks dropped for lacking a station name
    pub blocks_dropped: AtomicU64,

    /// Sample lines that did not match the expected shape
    pub malformed_lines: AtomicU64,

    /// Well-formed lines with unusable values
    pub rejected_values: AtomicU64,

    /// Fetch latency in milliseconds
    latency_histogram: RwLock<Option<Histogram<u64>>>,

    /// Failed fetches per source
    failures_by_source: RwLock<HashMap<String, u64>>,

    start_time: Instant,
}

impl FeedStats {
    pub fn new() -> Self {
        Self {
            refresh_cycles: AtomicU64::new(0),
            skipped_refreshes: AtomicU64::new(0),
            fetches: AtomicU64::new(0),
            fetch_failures: AtomicU64::new(0),
            stations_parsed: AtomicU64::new(0),
            samples_parsed: AtomicU64::new(0),
            blocks_dropped: AtomicU64::new(0),
            malformed_lines: AtomicU64::new(0),
            rejected_values: AtomicU64::new(0),
            // 1 ms to 1 h, 3 significant figures
            latency_histogram: RwLock::new(
                Histogram::new_with_bounds(1, MAX_TRACKED_LATENCY_MS, 3).ok(),
            ),
            failures_by_source: RwLock::new(HashMap::new()),
            start_time: Instant::now(),
        }
    }

    /// Record one fetch attempt of the named source.
    pub fn record_fetch(&self, source: &str, latency: Duration, ok: bool) {
        self.fetches.fetch_add(1, Ordering::Relaxed);

        let millis = (latency.as_millis() as u64).clamp(1, MAX_TRACKED_LATENCY_MS);
        if let Ok(mut guard) = self.latency_histogram.write()
            && let Some(ref mut hist) = *guard
        {
            let _ = hist.record(millis);
        }

        if !ok {
            self.fetch_failures.fetch_add(1, Ordering::Relaxed);
            if let Ok(mut map) = self.failures_by_source.write() {
                *map.entry(source.to_string()).or_insert(0) += 1;
            }
        }
    }

    /// Record the diagnostics of one feed parse.
    pub fn record_parse(&self, report: &ParseReport) {
        self.stations_parsed
            .fetch_add(report.stations as u64, Ordering::Relaxed);
        self.samples_parsed
            .fetch_add(report.samples as u64, Ordering::Relaxed);
        self.blocks_dropped
            .fetch_add(report.dropped_blocks() as u64, Ordering::Relaxed);
        self.malformed_lines
            .fetch_add(report.malformed_lines() as u64, Ordering::Relaxed);
        self.rejected_values
            .fetch_add(report.rejected_values as u64, Ordering::Relaxed);
    }

    pub fn record_cycle(&self) {
        self.refresh_cycles.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_skipped(&self) {
        self.skipped_refreshes.fetch_add(1, Ordering::Relaxed);
    }

    pub fn elapsed(&self) -> Duration {
        self.start_time.elapsed()
    }

    /// Generate a summary report.
    pub fn summary(&self) -> StatsSummary {
        let latency_percentiles = self.latency_histogram.read().ok().and_then(|guard| {
            guard
                .as_ref()
                .filter(|h| !h.is_empty())
                .map(|h| HistogramPercentiles {
                    p50: h.value_at_quantile(0.50),
                    p90: h.value_at_quantile(0.90),
                    p99: h.value_at_quantile(0.99),
                    min: h.min(),
                    max: h.max(),
                    mean: h.mean(),
                })
        });

        let failures_by_source = self
            .failures_by_source
            .read()
            .map(|m| {
                let mut vec: Vec<_> = m.iter().map(|(k, v)| (k.clone(), *v)).collect();
                vec.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
                vec
            })
            .unwrap_or_default();

        StatsSummary {
            elapsed_secs: self.elapsed().as_secs_f64(),
            refresh_cycles: self.refresh_cycles.load(Ordering::Relaxed),
            skipped_refreshes: self.skipped_refreshes.load(Ordering::Relaxed),
            fetches: self.fetches.load(Ordering::Relaxed),
            fetch_failures: self.fetch_failures.load(Ordering::Relaxed),
            stations_parsed: self.stations_parsed.load(Ordering::Relaxed),
            samples_parsed: self.samples_parsed.load(Ordering::Relaxed),
            blocks_dropped: self.blocks_dropped.load(Ordering::Relaxed),
            malformed_lines: self.malformed_lines.load(Ordering::Relaxed),
            rejected_values: self.rejected_values.load(Ordering::Relaxed),
            latency_percentiles,
            failures_by_source,
        }
    }
}

impl Default for FeedStats {
    fn default() -> Self {
        Self::new()
    }
}

/// Percentile values from a histogram.
#[derive(Debug, Clone, Serialize)]
pub struct HistogramPercentiles {
    pub p50: u64,
    pub p90: u64,
    pub p99: u64,
    pub min: u64,
    pub max: u64,
    pub mean: f64,
}

/// Summary of collected statistics.
#[derive(Debug, Clone, Serialize)]
pub struct StatsSummary {
    pub elapsed_secs: f64,
    pub refresh_cycles: u64,
    pub skipped_refreshes: u64,
    pub fetches: u64,
    pub fetch_failures: u64,
    pub stations_parsed: u64,
    pub samples_parsed: u64,
    pub blocks_dropped: u64,
    pub malformed_lines: u64,
    pub rejected_values: u64,
    pub latency_percentiles: Option<HistogramPercentiles>,
    pub failures_by_source: Vec<(String, u64)>,
}

impl std::fmt::Display for StatsSummary {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "═══════════════════════════════════════════════════════")?;
        writeln!(f, "                 FEED REFRESH STATISTICS")?;
        writeln!(f, "═══════════════════════════════════════════════════════")?;
        writeln!(f)?;
        writeln!(f, "Runtime: {:.1}s", self.elapsed_secs)?;
        writeln!(
            f,
            "Refresh cycles: {} ({} skipped)",
            self.refresh_cycles, self.skipped_refreshes
        )?;
        writeln!(
            f,
            "Fetches: {} ({} failed)",
            self.fetches, self.fetch_failures
        )?;
        writeln!(f, "Stations parsed: {}", self.stations_parsed)?;
        writeln!(f, "Samples parsed: {}", self.samples_parsed)?;
        writeln!(f, "Blocks dropped: {}", self.blocks_dropped)?;
        writeln!(f, "Malformed lines: {}", self.malformed_lines)?;
        writeln!(f, "Rejected values: {}", self.rejected_values)?;
        writeln!(f)?;

        if let Some(ref p) = self.latency_percentiles {
            writeln!(f, "Fetch Latency (ms):")?;
            writeln!(f, "  Min: {}, Max: {}, Mean: {:.1}", p.min, p.max, p.mean)?;
            writeln!(f, "  P50: {}, P90: {}, P99: {}", p.p50, p.p90, p.p99)?;
            writeln!(f)?;
        }

        if !self.failures_by_source.is_empty() {
            writeln!(f, "Failures by Source:")?;
            for (source, count) in &self.failures_by_source {
                writeln!(f, "  {}: {}", source, count)?;
            }
        }

        Ok(())
    }
}
