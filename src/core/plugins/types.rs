//! Data model shared by plugins, the sampler and the delivery queue.

use std::{
    collections::BTreeMap,
    fmt,
    time::{Duration, Instant},
};

use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use super::error::PluginError;

/// Result alias used throughout the plugin interface.
pub type PluginResult<T> = std::result::Result<T, PluginError>;

/// Free-form options handed to `initialize`, taken from a manifest's
/// `[options]` table.
pub type PluginOptions = serde_json::Map<String, serde_json::Value>;

/// Measurement name to value, ordered by name so CSV columns are stable.
pub type Measurements = BTreeMap<String, MeasurementValue>;

/// Reference point for the monotonic part of reading timestamps.
static LOGGER_EPOCH: Lazy<Instant> = Lazy::new(Instant::now);

/// Pins the monotonic epoch. Called once at service start so offsets count
/// from there rather than from the first reading.
pub fn init_epoch() {
    Lazy::force(&LOGGER_EPOCH);
}

/// A single measured value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MeasurementValue {
    Number(f64),
    Text(String),
}

impl From<f64> for MeasurementValue {
    fn from(value: f64) -> Self {
        MeasurementValue::Number(value)
    }
}

impl From<&str> for MeasurementValue {
    fn from(value: &str) -> Self {
        MeasurementValue::Text(value.to_string())
    }
}

impl From<String> for MeasurementValue {
    fn from(value: String) -> Self {
        MeasurementValue::Text(value)
    }
}

impl fmt::Display for MeasurementValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MeasurementValue::Number(n) => write!(f, "{}", n),
            MeasurementValue::Text(s) => f.write_str(s),
        }
    }
}

/// What a plugin hands back from `read_sample`.
#[derive(Debug, Clone, PartialEq)]
pub struct Sample {
    pub values: Measurements,
    pub captured_at: OffsetDateTime,
}

impl Sample {
    /// Creates a sample stamped with the current wall-clock time.
    pub fn new(values: Measurements) -> Self {
        Self {
            values,
            captured_at: OffsetDateTime::now_utc(),
        }
    }

    /// Builds a sample from `(name, value)` pairs.
    pub fn from_pairs<I, K, V>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<MeasurementValue>,
    {
        Self::new(
            pairs
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        )
    }

    /// Rejects samples that carry nothing, unnamed measurements or
    /// non-finite numbers.
    pub fn validate(&self) -> PluginResult<()> {
        if self.values.is_empty() {
            return Err(PluginError::InvalidData("sample has no measurements".into()));
        }
        for (name, value) in &self.values {
            if name.trim().is_empty() {
                return Err(PluginError::InvalidData("measurement without a name".into()));
            }
            if let MeasurementValue::Number(n) = value {
                if !n.is_finite() {
                    return Err(PluginError::InvalidData(format!(
                        "measurement '{}' is not a finite number",
                        name
                    )));
                }
            }
        }
        Ok(())
    }
}

/// An immutable, sequenced reading ready for delivery.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Reading {
    pub plugin: String,
    /// Strictly increasing per plugin, starting at 1.
    pub sequence: u64,
    /// Wall-clock capture time.
    #[serde(with = "time::serde::rfc3339")]
    pub captured_at: OffsetDateTime,
    /// Monotonic offset since the logger started.
    pub monotonic: Duration,
    pub values: Measurements,
}

impl Reading {
    pub fn from_sample(plugin: impl Into<String>, sequence: u64, sample: Sample) -> Self {
        Self {
            plugin: plugin.into(),
            sequence,
            captured_at: sample.captured_at,
            monotonic: LOGGER_EPOCH.elapsed(),
            values: sample.values,
        }
    }
}

/// Operations a plugin can declare support for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Capability {
    ReadSample,
    Shutdown,
    /// Anything this logger does not know about; ignored.
    #[serde(other)]
    Unknown,
}

/// Capabilities every plugin must declare to be accepted.
pub const REQUIRED_CAPABILITIES: [Capability; 2] = [Capability::ReadSample, Capability::Shutdown];

/// Self-description reported by `identify`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PluginIdentity {
    pub name: String,
    pub version: String,
    pub capabilities: Vec<Capability>,
}

impl PluginIdentity {
    /// Identity declaring the full required capability set.
    pub fn new(name: impl Into<String>, version: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            version: version.into(),
            capabilities: REQUIRED_CAPABILITIES.to_vec(),
        }
    }

    pub fn supports(&self, capability: Capability) -> bool {
        self.capabilities.contains(&capability)
    }

    /// Required capabilities missing from this identity.
    pub fn missing_capabilities(&self) -> Vec<Capability> {
        REQUIRED_CAPABILITIES
            .into_iter()
            .filter(|c| !self.supports(*c))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn sample_with_values_is_valid() {
        let sample = Sample::from_pairs([("temperature", 21.5), ("humidity", 40.0)]);
        assert!(sample.validate().is_ok());
    }

    #[test]
    fn empty_sample_is_invalid() {
        let sample = Sample::new(Measurements::new());
        assert!(matches!(sample.validate(), Err(PluginError::InvalidData(_))));
    }

    #[test]
    fn non_finite_numbers_are_invalid() {
        let sample = Sample::from_pairs([("pressure", f64::NAN)]);
        assert!(matches!(sample.validate(), Err(PluginError::InvalidData(_))));
    }

    #[test]
    fn measurement_values_accept_numbers_and_text() {
        let values: Measurements =
            serde_json::from_value(json!({"temperature": 20.25, "wind_direction": "NNW"}))
                .unwrap();

        assert_eq!(values["temperature"], MeasurementValue::Number(20.25));
        assert_eq!(values["wind_direction"], MeasurementValue::Text("NNW".into()));
    }

    #[test]
    fn reading_serializes_rfc3339_timestamp() {
        let mut sample = Sample::from_pairs([("temperature", 18.0)]);
        sample.captured_at = time::macros::datetime!(2025-03-01 12:00:00 UTC);

        let reading = Reading::from_sample("bme280", 42, sample);
        let value = serde_json::to_value(&reading).unwrap();

        assert_eq!(value["plugin"], "bme280");
        assert_eq!(value["sequence"], 42);
        assert_eq!(value["captured_at"], "2025-03-01T12:00:00Z");
        assert_eq!(value["values"]["temperature"], 18.0);
    }

    #[test]
    fn unknown_capabilities_are_tolerated() {
        let identity: PluginIdentity = serde_json::from_value(json!({
            "name": "rain_gauge",
            "version": "1.2.0",
            "capabilities": ["read_sample", "calibrate"],
        }))
        .unwrap();

        assert!(identity.supports(Capability::ReadSample));
        assert_eq!(identity.missing_capabilities(), vec![Capability::Shutdown]);
    }
}
