//! water-temp - Near-real-time water temperatures from public hydrographic feeds.
//!
//! This crate provides:
//! - A nom-based parser for ZRXP station exports
//! - Live (HTTP) and simulated data sources behind one `Source` trait
//! - A station registry that accumulates samples across refreshes
//! - A refresh coordinator with per-source failure isolation and
//!   generation-guarded timers
//!
//! # Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use water_temp::{
//!     FeedStats, Listeners, RefreshCoordinator, SimulatedConfig, SimulatedSource, Source,
//!     StationRegistry, coordinator::CoordinatorSettings,
//! };
//!
//! # async fn run() {
//! let stats = Arc::new(FeedStats::new());
//! let source: Arc<dyn Source> =
//!     Arc::new(SimulatedSource::simulated(SimulatedConfig::default(), Arc::clone(&stats)));
//! let registry = Arc::new(StationRegistry::new());
//!
//! let coordinator = RefreshCoordinator::new(
//!     vec![source],
//!     Arc::clone(&registry),
//!     Arc::new(Listeners::new()),
//!     stats,
//!     CoordinatorSettings::default(),
//! );
//! coordinator.refresh_all(false).await;
//!
//! if let Some(station) = registry.find_by_name("Strobl") {
//!     println!("{}", station);
//! }
//! # }
//! ```

pub mod config;
pub mod coordinator;
pub mod listeners;
pub mod live;
pub mod parser;
pub mod registry;
pub mod simulated;
pub mod source;
pub mod station;
pub mod stats;
pub mod store;

pub use config::{Config, SourceConfig};
pub use coordinator::{RefreshCoordinator, RefreshOutcome};
pub use listeners::{ListenerId, Listeners};
pub use live::{LiveConfig, LiveSource};
pub use parser::{ParseError, ParseReport, ParseWarning, parse_feed, parse_feed_with_report};
pub use registry::StationRegistry;
pub use simulated::{SimulatedConfig, SimulatedSource};
pub use source::{Source, SourceDescriptor, SourceError};
pub use station::{Reference, SampleRecord, StationKey, StationRecord};
pub use stats::{FeedStats, StatsSummary};
pub use store::{FileStore, KeyValueStore, MemoryStore, StoreError};
