//! Data structures representing monitoring stations and their samples.
//!
//! A [`StationRecord`] is produced by the feed parser once per refresh and
//! merged into the [`crate::registry::StationRegistry`], where its samples
//! accumulate across refresh cycles.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, SubsecRound, TimeDelta, Utc};
use serde::{Deserialize, Serialize};
use tokio::time::Instant;

/// Lower bound (exclusive) of plausible water temperatures in °C.
pub const MIN_PLAUSIBLE_TEMPERATURE: f64 = -20.0;

/// Upper bound (exclusive) of plausible water temperatures in °C.
pub const MAX_PLAUSIBLE_TEMPERATURE: f64 = 100.0;

/// Returns true if the value is a finite temperature inside the plausible range.
#[inline]
pub fn is_plausible_temperature(temperature: f64) -> bool {
    temperature > MIN_PLAUSIBLE_TEMPERATURE && temperature < MAX_PLAUSIBLE_TEMPERATURE
}

/// A single temperature observation.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SampleRecord {
    /// UTC time of the observation, second precision.
    pub timestamp: DateTime<Utc>,

    /// Water temperature in °C.
    pub temperature: f64,
}

impl SampleRecord {
    pub fn new(timestamp: DateTime<Utc>, temperature: f64) -> Self {
        Self {
            timestamp: timestamp.trunc_subsecs(0),
            temperature,
        }
    }
}

/// Identity of a station: name, site (water body) and owning source.
///
/// Rendered as `name;site;source` so it can be persisted and parsed back.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct StationKey {
    pub name: String,
    pub site: String,
    pub source: String,
}

impl StationKey {
    pub fn new(name: impl Into<String>, site: impl Into<String>, source: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            site: site.into(),
            source: source.into(),
        }
    }
}

impl fmt::Display for StationKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{};{};{}", self.name, self.site, self.source)
    }
}

impl FromStr for StationKey {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut parts = s.splitn(3, ';');
        match (parts.next(), parts.next(), parts.next()) {
            (Some(name), Some(site), Some(source)) => Ok(Self::new(name, site, source)),
            _ => Err(format!("invalid station key: {}", s)),
        }
    }
}

/// A monitoring station with its samples.
///
/// Samples are kept keyed by timestamp, so adding a sample for an existing
/// timestamp replaces its temperature instead of duplicating it.
#[derive(Debug, Clone, PartialEq)]
pub struct StationRecord {
    /// Station number (`SANR`), if the feed provides one.
    pub number: Option<String>,

    /// Station name (`SNAME`).
    pub name: String,

    /// Water body or site (`SWATER`).
    pub site: String,

    /// Name of the source that produced this record.
    pub source: String,

    /// When the owning source produced this record.
    pub refreshed_at: Option<DateTime<Utc>>,

    /// Earliest instant at which the owning source will fetch again.
    pub next_refresh: Option<Instant>,

    /// Failure message, set on placeholder records.
    pub error: Option<String>,

    samples: BTreeMap<DateTime<Utc>, f64>,
}

impl StationRecord {
    /// Create an empty record that is not yet bound to a source.
    pub fn new(name: impl Into<String>, site: impl Into<String>) -> Self {
        Self {
            number: None,
            name: name.into(),
            site: site.into(),
            source: String::new(),
            refreshed_at: None,
            next_refresh: None,
            error: None,
            samples: BTreeMap::new(),
        }
    }

    /// Create a record without samples that carries a failure message.
    pub fn placeholder(
        name: impl Into<String>,
        site: impl Into<String>,
        source: impl Into<String>,
        error: impl Into<String>,
        next_refresh: Instant,
    ) -> Self {
        Self {
            source: source.into(),
            refreshed_at: Some(Utc::now()),
            next_refresh: Some(next_refresh),
            error: Some(error.into()),
            ..Self::new(name, site)
        }
    }

    /// Bind the record to its owning source.
    pub fn with_source(mut self, source: impl Into<String>) -> Self {
        self.source = source.into();
        self
    }

    pub fn with_number(mut self, number: impl Into<String>) -> Self {
        self.number = Some(number.into());
        self
    }

    pub fn key(&self) -> StationKey {
        StationKey::new(&self.name, &self.site, &self.source)
    }

    /// Add samples, replacing the temperature of any existing timestamp.
    pub fn add_samples(&mut self, samples: impl IntoIterator<Item = SampleRecord>) -> &mut Self {
        for sample in samples {
            self.samples
                .insert(sample.timestamp.trunc_subsecs(0), sample.temperature);
        }
        self
    }

    pub fn add_sample(&mut self, sample: SampleRecord) -> &mut Self {
        self.add_samples(std::iter::once(sample))
    }

    /// Merge the samples of another record of the same station into this one.
    pub fn merge_samples(&mut self, other: &StationRecord) {
        for (timestamp, temperature) in &other.samples {
            self.samples.insert(*timestamp, *temperature);
        }
    }

    /// Move every sample by the given offset.
    ///
    /// Used by sources whose feed reports a fixed local offset instead of UTC.
    pub fn shift_samples(&mut self, offset: TimeDelta) {
        if offset == TimeDelta::zero() {
            return;
        }
        self.samples = std::mem::take(&mut self.samples)
            .into_iter()
            .map(|(timestamp, temperature)| (timestamp + offset, temperature))
            .collect();
    }

    /// Samples, most recent first.
    pub fn samples(&self) -> Vec<SampleRecord> {
        self.iter_samples().collect()
    }

    /// Iterate samples, most recent first.
    pub fn iter_samples(&self) -> impl Iterator<Item = SampleRecord> + '_ {
        self.samples
            .iter()
            .rev()
            .map(|(timestamp, temperature)| SampleRecord {
                timestamp: *timestamp,
                temperature: *temperature,
            })
    }

    pub fn sample_count(&self) -> usize {
        self.samples.len()
    }

    pub fn has_samples(&self) -> bool {
        !self.samples.is_empty()
    }

    pub fn most_recent_sample(&self) -> Option<SampleRecord> {
        self.samples
            .last_key_value()
            .map(|(timestamp, temperature)| SampleRecord {
                timestamp: *timestamp,
                temperature: *temperature,
            })
    }

    pub fn most_recent_temperature(&self) -> Option<f64> {
        self.most_recent_sample().map(|s| s.temperature)
    }

    /// Lookup hint for this station, carrying its latest temperature.
    pub fn to_reference(&self) -> Reference {
        Reference {
            station_name: Some(self.name.clone()),
            station_site: Some(self.site.clone()),
            source_name: Some(self.source.clone()),
            temperature: self.most_recent_temperature(),
        }
    }
}

impl fmt::Display for StationRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}, {}", self.name, self.site)?;
        match self.most_recent_sample() {
            Some(sample) => write!(
                f,
                ": {:.1} °C at {}",
                sample.temperature,
                sample.timestamp.format("%Y-%m-%d %H:%M UTC")
            )?,
            None => write!(f, ": no data")?,
        }
        if let Some(ref error) = self.error {
            write!(f, " ({})", error)?;
        }
        Ok(())
    }
}

/// Lookup hint used to select a station, e.g. the last viewed one.
///
/// Not owned by the registry; any field may be missing.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Reference {
    pub station_name: Option<String>,
    pub station_site: Option<String>,
    pub source_name: Option<String>,
    pub temperature: Option<f64>,
}

impl Reference {
    pub fn new(name: impl Into<String>, site: impl Into<String>) -> Self {
        Self {
            station_name: Some(name.into()),
            station_site: Some(site.into()),
            ..Default::default()
        }
    }

    /// Display key, `name;site;source` with missing parts left empty.
    pub fn key(&self) -> String {
        format!(
            "{};{};{}",
            self.station_name.as_deref().unwrap_or_default(),
            self.station_site.as_deref().unwrap_or_default(),
            self.source_name.as_deref().unwrap_or_default()
        )
    }

    /// The full station identity, if every part is known.
    pub fn station_key(&self) -> Option<StationKey> {
        match (&self.station_name, &self.station_site, &self.source_name) {
            (Some(name), Some(site), Some(source)) => Some(StationKey::new(name, site, source)),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(hour: u32, minute: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2023, 6, 15, hour, minute, 0).unwrap()
    }

    #[test]
    fn test_samples_are_most_recent_first() {
        let mut station = StationRecord::new("Strobl", "Wolfgangsee");
        station.add_samples([
            SampleRecord::new(at(10, 0), 17.9),
            SampleRecord::new(at(12, 0), 18.4),
            SampleRecord::new(at(11, 0), 18.1),
        ]);

        let samples = station.samples();
        assert_eq!(samples.len(), 3);
        assert_eq!(samples[0].timestamp, at(12, 0));
        assert_eq!(samples[2].timestamp, at(10, 0));
        assert_eq!(station.most_recent_temperature(), Some(18.4));
    }

    #[test]
    fn test_same_timestamp_overwrites() {
        let mut station = StationRecord::new("Strobl", "Wolfgangsee");
        station.add_sample(SampleRecord::new(at(12, 0), 18.4));
        station.add_sample(SampleRecord::new(at(12, 0), 19.0));

        assert_eq!(station.sample_count(), 1);
        assert_eq!(station.most_recent_temperature(), Some(19.0));
    }

    #[test]
    fn test_subsecond_component_is_dropped() {
        let mut station = StationRecord::new("Strobl", "Wolfgangsee");
        let base = at(12, 0);
        station.add_sample(SampleRecord::new(base + TimeDelta::milliseconds(400), 18.0));
        station.add_sample(SampleRecord::new(base, 18.2));

        assert_eq!(station.sample_count(), 1);
        assert_eq!(station.most_recent_sample().unwrap().timestamp, base);
    }

    #[test]
    fn test_merge_samples() {
        let mut existing = StationRecord::new("Strobl", "Wolfgangsee");
        existing.add_samples([
            SampleRecord::new(at(10, 0), 17.9),
            SampleRecord::new(at(11, 0), 18.1),
        ]);

        let mut incoming = StationRecord::new("Strobl", "Wolfgangsee");
        incoming.add_samples([
            SampleRecord::new(at(11, 0), 18.3),
            SampleRecord::new(at(12, 0), 18.4),
        ]);

        existing.merge_samples(&incoming);

        let samples = existing.samples();
        assert_eq!(samples.len(), 3);
        assert_eq!(samples[1].timestamp, at(11, 0));
        assert_eq!(samples[1].temperature, 18.3);
    }

    #[test]
    fn test_shift_samples() {
        let mut station = StationRecord::new("Strobl", "Wolfgangsee");
        station.add_sample(SampleRecord::new(at(12, 0), 18.4));
        station.shift_samples(TimeDelta::hours(-1));

        assert_eq!(station.most_recent_sample().unwrap().timestamp, at(11, 0));
    }

    #[test]
    fn test_plausible_temperature_bounds() {
        assert!(is_plausible_temperature(18.4));
        assert!(is_plausible_temperature(-19.9));
        assert!(!is_plausible_temperature(-20.0));
        assert!(!is_plausible_temperature(100.0));
        assert!(!is_plausible_temperature(-777.0));
        assert!(!is_plausible_temperature(f64::NAN));
    }

    #[test]
    fn test_station_key_round_trip() {
        let station = StationRecord::new("Strobl", "Wolfgangsee").with_source("Simulation");
        let key = station.key();

        assert_eq!(key.to_string(), "Strobl;Wolfgangsee;Simulation");
        assert_eq!("Strobl;Wolfgangsee;Simulation".parse::<StationKey>(), Ok(key));
        assert!("Strobl".parse::<StationKey>().is_err());
    }

    #[test]
    fn test_reference_from_station() {
        let mut station = StationRecord::new("Strobl", "Wolfgangsee").with_source("Simulation");
        station.add_sample(SampleRecord::new(at(12, 0), 18.4));

        let reference = station.to_reference();
        assert_eq!(reference.key(), "Strobl;Wolfgangsee;Simulation");
        assert_eq!(reference.temperature, Some(18.4));
        assert_eq!(reference.station_key(), Some(station.key()));
    }

    #[test]
    fn test_reference_json_uses_camel_case() {
        let reference = Reference::new("Strobl", "Wolfgangsee");
        let json = serde_json::to_string(&reference).unwrap();

        assert!(json.contains("\"stationName\":\"Strobl\""));
        assert!(json.contains("\"stationSite\":\"Wolfgangsee\""));
        assert_eq!(reference.station_key(), None);
    }

    #[test]
    fn test_display() {
        let mut station = StationRecord::new("Strobl", "Wolfgangsee");
        assert_eq!(station.to_string(), "Strobl, Wolfgangsee: no data");

        station.add_sample(SampleRecord::new(at(12, 0), 18.4));
        assert_eq!(
            station.to_string(),
            "Strobl, Wolfgangsee: 18.4 °C at 2023-06-15 12:00 UTC"
        );
    }
}
