//! Metrics sinks.
//!
//! [`Metrics`] is a small statsd-style interface: counts, gauges and timings,
//! each with a list of `key:value` tags. Emission can fail; callers log the
//! failure and carry on.

use std::collections::HashMap;
use std::sync::RwLock;
use std::time::Duration;

/// Prefixes a metric name with the crate namespace
pub fn prefix(name: &str) -> String {
    format!("nftsync.{name}")
}

#[derive(Debug, thiserror::Error)]
pub enum MetricsError {
    #[error("metrics sink unavailable: {0}")]
    Unavailable(String),

    #[error("invalid metric name '{0}'")]
    InvalidName(String),
}

/// Metrics sink used by managers
pub trait Metrics: Send + Sync {
    fn count(&self, name: &str, value: i64, tags: &[String]) -> Result<(), MetricsError>;
    fn gauge(&self, name: &str, value: f64, tags: &[String]) -> Result<(), MetricsError>;
    fn timing(&self, name: &str, duration: Duration, tags: &[String]) -> Result<(), MetricsError>;
}

/// Discards everything
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopMetrics;

impl Metrics for NoopMetrics {
    fn count(&self, _name: &str, _value: i64, _tags: &[String]) -> Result<(), MetricsError> {
        Ok(())
    }

    fn gauge(&self, _name: &str, _value: f64, _tags: &[String]) -> Result<(), MetricsError> {
        Ok(())
    }

    fn timing(&self, _name: &str, _duration: Duration, _tags: &[String]) -> Result<(), MetricsError> {
        Ok(())
    }
}

/// Metric name plus its sorted tags
type SeriesKey = (String, Vec<String>);

fn series(name: &str, tags: &[String]) -> Result<SeriesKey, MetricsError> {
    if name.is_empty() || name.contains(char::is_whitespace) {
        return Err(MetricsError::InvalidName(name.to_string()));
    }
    let mut tags = tags.to_vec();
    tags.sort_unstable();
    Ok((name.to_string(), tags))
}

fn poisoned<T>(_: T) -> MetricsError {
    MetricsError::Unavailable("registry lock poisoned".to_string())
}

/// In-memory, thread-safe metrics store.
///
/// Series are keyed by name and tag set. Queries match every series of the
/// name whose tags include all the requested tags.
#[derive(Debug, Default)]
pub struct MetricsRegistry {
    counts: RwLock<HashMap<SeriesKey, i64>>,
    gauges: RwLock<HashMap<SeriesKey, f64>>,
    timings: RwLock<HashMap<SeriesKey, Vec<Duration>>>,
}

fn matches(key: &SeriesKey, name: &str, tags: &[&str]) -> bool {
    key.0 == name && tags.iter().all(|t| key.1.iter().any(|k| k == t))
}

impl MetricsRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sum of every matching count series
    pub fn count_total(&self, name: &str, tags: &[&str]) -> i64 {
        self.counts.read().map_or(0, |counts| {
            counts
                .iter()
                .filter(|(k, _)| matches(k, name, tags))
                .map(|(_, v)| *v)
                .sum()
        })
    }

    /// Last value of a matching gauge series
    pub fn gauge_value(&self, name: &str, tags: &[&str]) -> Option<f64> {
        let gauges = self.gauges.read().ok()?;
        gauges
            .iter()
            .find(|(k, _)| matches(k, name, tags))
            .map(|(_, v)| *v)
    }

    /// Number of timings recorded across matching series
    pub fn timing_count(&self, name: &str, tags: &[&str]) -> usize {
        self.timings.read().map_or(0, |timings| {
            timings
                .iter()
                .filter(|(k, _)| matches(k, name, tags))
                .map(|(_, v)| v.len())
                .sum()
        })
    }

    /// Names of every recorded series, sorted and deduplicated
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = Vec::new();
        if let Ok(counts) = self.counts.read() {
            names.extend(counts.keys().map(|k| k.0.clone()));
        }
        if let Ok(gauges) = self.gauges.read() {
            names.extend(gauges.keys().map(|k| k.0.clone()));
        }
        if let Ok(timings) = self.timings.read() {
            names.extend(timings.keys().map(|k| k.0.clone()));
        }
        names.sort_unstable();
        names.dedup();
        names
    }
}

impl Metrics for MetricsRegistry {
    fn count(&self, name: &str, value: i64, tags: &[String]) -> Result<(), MetricsError> {
        let key = series(name, tags)?;
        *self.counts.write().map_err(poisoned)?.entry(key).or_default() += value;
        Ok(())
    }

    fn gauge(&self, name: &str, value: f64, tags: &[String]) -> Result<(), MetricsError> {
        let key = series(name, tags)?;
        self.gauges.write().map_err(poisoned)?.insert(key, value);
        Ok(())
    }

    fn timing(&self, name: &str, duration: Duration, tags: &[String]) -> Result<(), MetricsError> {
        let key = series(name, tags)?;
        self.timings
            .write()
            .map_err(poisoned)?
            .entry(key)
            .or_default()
            .push(duration);
        Ok(())
    }
}
