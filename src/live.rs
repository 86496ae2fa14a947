//! Live source: HTTP GET against a public ZRXP export.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::TimeDelta;
use reqwest::Client;
use reqwest::header::{HeaderMap, HeaderValue, USER_AGENT};
use tracing::debug;

use crate::source::{Feed, FeedSettings, FeedSource, SourceDescriptor, SourceError};
use crate::stats::FeedStats;

/// Water temperature export of the Upper Austrian hydrographic service.
pub const DEFAULT_URL: &str = "https://data.ooe.gv.at/files/hydro/HDOOE_Export_WT.zrxp";

pub const DEFAULT_NAME: &str = "Hydrographischer Dienst Oberösterreich";

pub const DEFAULT_DISCLAIMER: &str = "Datenquelle: Land Oberösterreich - data.ooe.gv.at";

pub const DEFAULT_LINK: &str = "https://www.land-oberoesterreich.gv.at/142236.htm";

pub const DEFAULT_INTERVAL: Duration = Duration::from_secs(5 * 60);

/// The export reports Central European standard time.
pub const DEFAULT_UTC_OFFSET_HOURS: i64 = 1;

pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

const CLIENT_USER_AGENT: &str = concat!("water-temp/", env!("CARGO_PKG_VERSION"));

/// Configuration for a live source.
#[derive(Debug, Clone)]
pub struct LiveConfig {
    pub name: String,
    pub url: String,
    pub disclaimer: String,
    pub link: String,
    pub interval: Duration,
    pub utc_offset_hours: i64,
    pub request_timeout: Duration,
    pub failure_backoff: Duration,
}

impl Default for LiveConfig {
    fn default() -> Self {
        Self {
            name: DEFAULT_NAME.to_string(),
            url: DEFAULT_URL.to_string(),
            disclaimer: DEFAULT_DISCLAIMER.to_string(),
            link: DEFAULT_LINK.to_string(),
            interval: DEFAULT_INTERVAL,
            utc_offset_hours: DEFAULT_UTC_OFFSET_HOURS,
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            failure_backoff: crate::source::DEFAULT_FAILURE_BACKOFF,
        }
    }
}

impl LiveConfig {
    /// Point the source at another export URL.
    pub fn with_url(mut self, url: impl Into<String>) -> Self {
        self.url = url.into();
        self
    }
}

/// Raw feed text fetched over HTTP.
pub struct HttpFeed {
    client: Client,
    url: String,
}

impl HttpFeed {
    pub fn new(url: impl Into<String>, request_timeout: Duration) -> Result<Self, SourceError> {
        let mut headers = HeaderMap::new();
        headers.insert(USER_AGENT, HeaderValue::from_static(CLIENT_USER_AGENT));

        let client = Client::builder()
            .default_headers(headers)
            .timeout(request_timeout)
            .build()?;

        Ok(Self {
            client,
            url: url.into(),
        })
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

#[async_trait]
impl Feed for HttpFeed {
    async fn fetch(&self) -> Result<String, SourceError> {
        debug!("GET {}", self.url);
        let response = self.client.get(&self.url).send().await?;

        let status = response.status();
        if !status.is_success() {
            return Err(SourceError::Status(status.as_u16()));
        }

        Ok(response.text().await?)
    }
}

/// A source backed by the live HTTP export.
pub type LiveSource = FeedSource<HttpFeed>;

impl FeedSource<HttpFeed> {
    pub fn live(config: LiveConfig, stats: Arc<FeedStats>) -> Result<Self, SourceError> {
        let feed = HttpFeed::new(config.url, config.request_timeout)?;
        let descriptor = SourceDescriptor {
            name: config.name,
            disclaimer: config.disclaimer,
            link: config.link,
            interval: config.interval,
        };
        let settings = FeedSettings {
            utc_offset: TimeDelta::hours(config.utc_offset_hours),
            failure_backoff: config.failure_backoff,
        };

        Ok(Self::with_feed(descriptor, settings, feed, stats))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::Source;

    #[test]
    fn test_default_config() {
        let config = LiveConfig::default();
        assert_eq!(config.url, DEFAULT_URL);
        assert_eq!(config.interval, Duration::from_secs(300));
        assert_eq!(config.utc_offset_hours, 1);
    }

    #[tokio::test]
    async fn test_live_source_descriptor() {
        let source = LiveSource::live(
            LiveConfig::default().with_url("http://127.0.0.1:9/feed.zrxp"),
            Arc::new(FeedStats::new()),
        )
        .unwrap();

        assert_eq!(source.name(), DEFAULT_NAME);
        assert_eq!(source.disclaimer(), DEFAULT_DISCLAIMER);
        assert_eq!(source.link(), DEFAULT_LINK);
        assert_eq!(source.feed().url(), "http://127.0.0.1:9/feed.zrxp");
        assert!(source.error().is_none());
    }

    #[tokio::test]
    async fn test_unreachable_feed_resolves_to_placeholder() {
        let source = LiveSource::live(
            LiveConfig {
                request_timeout: Duration::from_secs(2),
                ..LiveConfig::default().with_url("http://127.0.0.1:9/feed.zrxp")
            },
            Arc::new(FeedStats::new()),
        )
        .unwrap();

        let station = source.station_data(Some("Strobl"), Some("Wolfgangsee")).await;

        assert!(!station.has_samples());
        assert!(station.error.is_some());
        assert!(source.error().is_some());
    }
}
