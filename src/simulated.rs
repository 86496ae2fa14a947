//! Simulated source producing synthetic ZRXP text without network access.
//!
//! The generated feed goes through the same parser as the live export, so
//! everything downstream of the fetch behaves identically.

use std::fmt::Write as _;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, DurationRound, TimeDelta, Utc};

use crate::parser::BLOCK_MARKER;
use crate::source::{Feed, FeedSettings, FeedSource, SourceDescriptor, SourceError};
use crate::stats::FeedStats;

pub const DEFAULT_NAME: &str = "Simulation";

pub const DEFAULT_INTERVAL: Duration = Duration::from_secs(10);

/// Spacing of generated samples.
const SAMPLE_SPACING_MINUTES: i64 = 15;

/// Samples generated per station.
const SAMPLES_PER_STATION: i64 = 12;

/// Simulated stations: number, name, site, base temperature.
const STATIONS: &[(&str, &str, &str, f64)] = &[
    ("5402", "Strobl", "Wolfgangsee", 18.0),
    ("5404", "St. Gilgen", "Wolfgangsee", 18.5),
    ("5610", "Gmunden", "Traunsee", 16.0),
    ("5620", "Ebensee", "Traunsee", 15.5),
    ("5701", "Mondsee", "Mondsee", 20.0),
    ("5810", "Weyregg", "Attersee", 17.0),
];

/// Configuration for a simulated source.
#[derive(Debug, Clone)]
pub struct SimulatedConfig {
    pub name: String,
    pub interval: Duration,

    /// Add a nameless block, a malformed line and an error code value to
    /// every generated feed.
    pub inject_faults: bool,

    pub failure_backoff: Duration,
}

impl Default for SimulatedConfig {
    fn default() -> Self {
        Self {
            name: DEFAULT_NAME.to_string(),
            interval: DEFAULT_INTERVAL,
            inject_faults: false,
            failure_backoff: crate::source::DEFAULT_FAILURE_BACKOFF,
        }
    }
}

/// Generator of synthetic feed text.
pub struct SimulatedFeed {
    inject_faults: bool,
    offline: AtomicBool,
    generated: AtomicU64,
}

impl SimulatedFeed {
    pub fn new(inject_faults: bool) -> Self {
        Self {
            inject_faults,
            offline: AtomicBool::new(false),
            generated: AtomicU64::new(0),
        }
    }

    /// Make subsequent fetches fail as if the endpoint was unreachable.
    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    /// Number of feeds generated so far.
    pub fn generated(&self) -> u64 {
        self.generated.load(Ordering::SeqCst)
    }

    /// Render the feed as it would look at `now`.
    ///
    /// The output depends only on `now` rounded down to the sample spacing.
    pub fn render(&self, now: DateTime<Utc>) -> String {
        let spacing = TimeDelta::minutes(SAMPLE_SPACING_MINUTES);
        let latest = now.duration_trunc(spacing).unwrap_or(now);

        let mut text = String::new();
        for (index, (number, name, site, base)) in STATIONS.iter().enumerate() {
            let _ = write!(
                text,
                "{BLOCK_MARKER}2300.100|*|ZRXPCREATORsimulation|*|\n\
                 #SANR{number}|*|SNAME{name}|*|SWATER{site}|*|CNAMEWT|*|CUNITC|*|\n\
                 #LAYOUT(timestamp,value)|*|\n"
            );

            for step in (0..SAMPLES_PER_STATION).rev() {
                let timestamp = latest - spacing * step as i32;
                let temperature = simulated_temperature(*base, index, timestamp);
                let _ = writeln!(
                    text,
                    "{} {:.1}",
                    timestamp.format("%Y%m%d%H%M%S"),
                    temperature
                );
            }

            if self.inject_faults && index == 0 {
                let _ = writeln!(text, "{} -777", latest.format("%Y%m%d%H%M%S"));
                let _ = writeln!(text, "sensor offline");
            }
        }

        if self.inject_faults {
            let _ = writeln!(
                text,
                "{BLOCK_MARKER}2300.100|*|SANR9999|*|SWATERUnknown|*|\n{} 12.0",
                latest.format("%Y%m%d%H%M%S")
            );
        }

        text
    }
}

/// Smooth daily cycle around the base temperature, offset per station.
fn simulated_temperature(base: f64, index: usize, timestamp: DateTime<Utc>) -> f64 {
    let seconds = timestamp.timestamp() as f64;
    let phase = seconds / 86_400.0 * std::f64::consts::TAU + index as f64;
    let variation = ((timestamp.timestamp() / 900 + index as i64) % 7) as f64 / 20.0;
    base + 1.5 * phase.sin() + variation
}

#[async_trait]
impl Feed for SimulatedFeed {
    async fn fetch(&self) -> Result<String, SourceError> {
        if self.offline.load(Ordering::SeqCst) {
            return Err(SourceError::Unavailable(
                "simulated endpoint is offline".to_string(),
            ));
        }
        self.generated.fetch_add(1, Ordering::SeqCst);
        Ok(self.render(Utc::now()))
    }
}

/// A source backed by generated data.
pub type SimulatedSource = FeedSource<SimulatedFeed>;

impl FeedSource<SimulatedFeed> {
    pub fn simulated(config: SimulatedConfig, stats: Arc<FeedStats>) -> Self {
        let descriptor = SourceDescriptor {
            name: config.name,
            disclaimer: "Simulated data, not actual measurements".to_string(),
            link: String::new(),
            interval: config.interval,
        };
        let settings = FeedSettings {
            utc_offset: TimeDelta::zero(),
            failure_backoff: config.failure_backoff,
        };

        Self::with_feed(
            descriptor,
            settings,
            SimulatedFeed::new(config.inject_faults),
            stats,
        )
    }
}
