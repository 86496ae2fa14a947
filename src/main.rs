//! water-temp CLI - Follow water temperatures from public hydrographic feeds.

use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tokio::sync::watch;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;
use water_temp::{
    config::{Config, SourceConfig, parse_duration},
    coordinator::{RefreshCoordinator, RefreshOutcome},
    listeners::Listeners,
    live::LiveSource,
    registry::StationRegistry,
    simulated::SimulatedSource,
    source::Source,
    station::Reference,
    stats::FeedStats,
    store::{FileStore, KeyValueStore, MemoryStore, load_reference, save_reference},
};

/// water-temp - Follow water temperatures from public hydrographic feeds
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Station to show (defaults to the last viewed one)
    #[arg(short, long, env = "WATER_TEMP_STATION")]
    station: Option<String>,

    /// Site (water body) of the station
    #[arg(long, env = "WATER_TEMP_SITE")]
    site: Option<String>,

    /// Use simulated data instead of the configured sources
    #[arg(long)]
    simulate: bool,

    /// List all stations and exit
    #[arg(short, long)]
    list: bool,

    /// Refresh once, print the station and exit
    #[arg(long)]
    once: bool,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Print statistics at this interval, e.g. "30s" (0 disables)
    #[arg(long, value_parser = parse_duration)]
    stats_interval: Option<Duration>,

    /// Maximum runtime in seconds (0 = unlimited)
    #[arg(long, default_value_t = 0)]
    max_runtime: u64,

    /// Config file to use instead of the default location
    #[arg(short, long, env = "WATER_TEMP_CONFIG")]
    config: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Initialize logging
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&args.log_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    let mut config = match args.config {
        Some(ref path) => Config::load_from(path)?,
        None => Config::load()?,
    };
    apply_args(&mut config, &args);
    config.validate()?;

    info!("water-temp starting...");
    for source in &config.sources {
        info!("Source: {}", source.name());
    }

    let stats = Arc::new(FeedStats::new());
    let sources = build_sources(&config, &stats)?;
    let registry = Arc::new(StationRegistry::new());
    let listeners = Arc::new(Listeners::new());
    let coordinator = RefreshCoordinator::new(
        sources,
        Arc::clone(&registry),
        Arc::clone(&listeners),
        Arc::clone(&stats),
        config.coordinator_settings(),
    );

    let store: Box<dyn KeyValueStore> = match FileStore::in_data_dir() {
        Some(store) => Box::new(store),
        None => {
            warn!("No data directory available, last station will not be kept");
            Box::new(MemoryStore::new())
        }
    };

    let default_reference = Reference::new(&config.station, &config.site);
    let reference = if args.station.is_some() || args.site.is_some() {
        default_reference
    } else {
        load_reference(store.as_ref(), default_reference)
    };
    info!("Station: {}", reference.key());

    if args.list {
        coordinator.refresh_all(false).await;
        for reference in registry.references() {
            match reference.temperature {
                Some(t) => println!("{:<50} {:>6.1} °C", reference.key(), t),
                None => println!("{:<50} {:>9}", reference.key(), "-"),
            }
        }
        print_attribution(coordinator.sources());
        coordinator.shutdown();
        return Ok(());
    }

    listeners.subscribe({
        let registry = Arc::clone(&registry);
        let reference = reference.clone();
        move || match registry.resolve(&reference) {
            Some(station) => println!("{}", station),
            None => warn!("Station {} not found", reference.key()),
        }
    });

    if args.once {
        let outcome = coordinator.refresh_all(false).await;
        if let RefreshOutcome::Completed { failed_sources, .. } = outcome
            && failed_sources > 0
            && let Some(e) = coordinator.error()
        {
            error!("{}", e);
        }
        print_attribution(coordinator.sources());
        remember(&registry, &reference, store.as_ref());
        coordinator.shutdown();
        return Ok(());
    }

    // Create shutdown signal
    let (shutdown_tx, mut shutdown_rx) = watch::channel(false);

    // Handle Ctrl+C
    let shutdown_tx_clone = shutdown_tx.clone();
    tokio::spawn(async move {
        match signal::ctrl_c().await {
            Ok(()) => info!("Shutdown signal received"),
            Err(e) => error!("Failed to listen for Ctrl+C: {}", e),
        }
        let _ = shutdown_tx_clone.send(true);
    });

    // Optional max runtime
    if args.max_runtime > 0 {
        let shutdown_tx_clone = shutdown_tx.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(args.max_runtime)).await;
            info!("Max runtime reached");
            let _ = shutdown_tx_clone.send(true);
        });
    }

    // Start stats printer
    if !config.stats_interval.is_zero() {
        let stats_clone = Arc::clone(&stats);
        let stats_interval = config.stats_interval;
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(stats_interval);
            interval.tick().await;
            loop {
                interval.tick().await;
                println!("\n{}", stats_clone.summary());
            }
        });
    }

    print_attribution(coordinator.sources());
    let _ = coordinator.start();

    while shutdown_rx.changed().await.is_ok() {
        if *shutdown_rx.borrow() {
            break;
        }
    }

    remember(&registry, &reference, store.as_ref());
    coordinator.shutdown();

    // Print final statistics
    println!("\n\nFINAL STATISTICS");
    println!("{}", stats.summary());

    Ok(())
}

/// Command-line flags override the config file.
fn apply_args(config: &mut Config, args: &Args) {
    if let Some(ref station) = args.station {
        config.station = station.clone();
    }
    if let Some(ref site) = args.site {
        config.site = site.clone();
    }
    if let Some(interval) = args.stats_interval {
        config.stats_interval = interval;
    }
    if args.simulate {
        config.sources = vec![SourceConfig::simulated()];
    }
}

fn build_sources(config: &Config, stats: &Arc<FeedStats>) -> Result<Vec<Arc<dyn Source>>> {
    config
        .sources
        .iter()
        .map(|source| -> Result<Arc<dyn Source>> {
            if let Some(live) = config.live_config(source) {
                let live_source = LiveSource::live(live, Arc::clone(stats))
                    .with_context(|| format!("Failed to create source {}", source.name()))?;
                Ok(Arc::new(live_source))
            } else if let Some(simulated) = config.simulated_config(source) {
                Ok(Arc::new(SimulatedSource::simulated(
                    simulated,
                    Arc::clone(stats),
                )))
            } else {
                anyhow::bail!("Unsupported source {}", source.name())
            }
        })
        .collect()
}

fn print_attribution(sources: &[Arc<dyn Source>]) {
    for source in sources {
        if source.link().is_empty() {
            println!("{}", source.disclaimer());
        } else {
            println!("{} ({})", source.disclaimer(), source.link());
        }
    }
}

/// Store the shown station so the next run starts with it.
fn remember(registry: &StationRegistry, reference: &Reference, store: &dyn KeyValueStore) {
    let reference = registry
        .resolve(reference)
        .map(|station| station.to_reference())
        .unwrap_or_else(|| reference.clone());

    if let Err(e) = save_reference(store, &reference) {
        warn!("Failed to save last station: {}", e);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(extra: &[&str]) -> Args {
        let mut argv = vec!["water-temp"];
        argv.extend_from_slice(extra);
        Args::parse_from(argv)
    }

    #[test]
    fn test_apply_args() {
        let mut config = Config::default();
        apply_args(
            &mut config,
            &args(&["--station", "Gmunden", "--site", "Traunsee", "--simulate", "--stats-interval", "1m"]),
        );

        assert_eq!(config.station, "Gmunden");
        assert_eq!(config.site, "Traunsee");
        assert_eq!(config.stats_interval, Duration::from_secs(60));
        assert_eq!(config.sources, vec![SourceConfig::simulated()]);
    }

    #[test]
    fn test_build_sources() {
        let config = Config {
            sources: vec![SourceConfig::live(), SourceConfig::simulated()],
            ..Config::default()
        };
        let sources = build_sources(&config, &Arc::new(FeedStats::new())).unwrap();

        let names: Vec<_> = sources.iter().map(|s| s.name().to_string()).collect();
        assert_eq!(
            names,
            vec![water_temp::live::DEFAULT_NAME, water_temp::simulated::DEFAULT_NAME]
        );
    }

    #[tokio::test]
    async fn test_remember_saves_resolved_station() {
        let config = Config {
            sources: vec![SourceConfig::simulated()],
            ..Config::default()
        };
        let stats = Arc::new(FeedStats::new());
        let registry = Arc::new(StationRegistry::new());
        let coordinator = RefreshCoordinator::new(
            build_sources(&config, &stats).unwrap(),
            Arc::clone(&registry),
            Arc::new(Listeners::new()),
            stats,
            config.coordinator_settings(),
        );
        coordinator.refresh_all(false).await;
        coordinator.shutdown();

        let store = MemoryStore::new();
        remember(&registry, &Reference::new("Strobl", "Wolfgangsee"), &store);

        let saved = load_reference(&store, Reference::default());
        assert_eq!(saved.source_name.as_deref(), Some(water_temp::simulated::DEFAULT_NAME));
        assert!(saved.temperature.is_some());
    }
}
