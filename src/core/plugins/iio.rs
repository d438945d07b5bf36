//! Builtin `iio_environment` plugin.
//!
//! Environmental sensors such as the Bosch BME280/BMP280 are exposed by the
//! Linux Industrial I/O subsystem under `/sys/bus/iio/devices/iio:deviceN`.
//! Each channel is either a processed `*_input` file or a `*_raw` value
//! with a matching `*_scale` (and optional `*_offset`).
//!
//! | channel                    | IIO unit   | reported as            |
//! |----------------------------|------------|------------------------|
//! | `in_temp`                  | m°C        | `temperature` in °C    |
//! | `in_humidityrelative`      | m%RH       | `humidity` in %RH      |
//! | `in_pressure`              | kPa        | `pressure` in hPa      |

use std::path::{Path, PathBuf};

use super::{
    error::PluginError,
    traits::{PluginHandle, SensorPlugin},
    types::{Measurements, PluginIdentity, PluginOptions, PluginResult, Sample},
};
use crate::register_plugin;

const DEFAULT_DEVICE: &str = "/sys/bus/iio/devices/iio:device0";

#[derive(Debug, Clone, Copy, PartialEq)]
struct Channel {
    prefix: &'static str,
    measurement: &'static str,
    /// Multiplier from the IIO unit to the reported unit.
    factor: f64,
}

const CHANNELS: [Channel; 3] = [
    Channel {
        prefix: "in_temp",
        measurement: "temperature",
        factor: 0.001,
    },
    Channel {
        prefix: "in_humidityrelative",
        measurement: "humidity",
        factor: 0.001,
    },
    Channel {
        prefix: "in_pressure",
        measurement: "pressure",
        factor: 10.0,
    },
];

#[derive(Debug, Default)]
pub struct IioEnvironmentPlugin;

#[async_trait::async_trait]
impl SensorPlugin for IioEnvironmentPlugin {
    async fn initialize(&self, options: &PluginOptions) -> PluginResult<Box<dyn PluginHandle>> {
        let device = options
            .get("device")
            .and_then(|v| v.as_str())
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from(DEFAULT_DEVICE));

        let mut channels = Vec::new();
        for channel in CHANNELS {
            if channel_present(&device, channel).await {
                channels.push(channel);
            }
        }

        if channels.is_empty() {
            return Err(PluginError::ReadFailure(format!(
                "no temperature, humidity or pressure channel in {}",
                device.display()
            )));
        }

        let model = tokio::fs::read_to_string(device.join("name"))
            .await
            .map(|s| s.trim().to_string())
            .unwrap_or_default();

        Ok(Box::new(IioEnvironmentHandle {
            device,
            channels,
            model,
        }))
    }
}

pub struct IioEnvironmentHandle {
    device: PathBuf,
    channels: Vec<Channel>,
    model: String,
}

async fn channel_present(device: &Path, channel: Channel) -> bool {
    let input = device.join(format!("{}_input", channel.prefix));
    let raw = device.join(format!("{}_raw", channel.prefix));
    tokio::fs::try_exists(&input).await.unwrap_or(false)
        || tokio::fs::try_exists(&raw).await.unwrap_or(false)
}

async fn read_number(path: &Path) -> PluginResult<Option<f64>> {
    match tokio::fs::read_to_string(path).await {
        Ok(raw) => raw
            .trim()
            .parse::<f64>()
            .map(Some)
            .map_err(|e| PluginError::InvalidData(format!("{}: {}", path.display(), e))),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(PluginError::ReadFailure(format!(
            "{}: {}",
            path.display(),
            e
        ))),
    }
}

/// Value of one channel in its IIO unit.
async fn read_channel(device: &Path, channel: Channel) -> PluginResult<f64> {
    let prefix = channel.prefix;
    if let Some(value) = read_number(&device.join(format!("{prefix}_input"))).await? {
        return Ok(value);
    }

    let raw = read_number(&device.join(format!("{prefix}_raw")))
        .await?
        .ok_or_else(|| {
            PluginError::ReadFailure(format!("{prefix} disappeared from {}", device.display()))
        })?;
    let offset = read_number(&device.join(format!("{prefix}_offset")))
        .await?
        .unwrap_or(0.0);
    let scale = read_number(&device.join(format!("{prefix}_scale")))
        .await?
        .unwrap_or(1.0);
    Ok((raw + offset) * scale)
}

#[async_trait::async_trait]
impl PluginHandle for IioEnvironmentHandle {
    fn identify(&self) -> PluginIdentity {
        let version = if self.model.is_empty() {
            env!("CARGO_PKG_VERSION").to_string()
        } else {
            format!("{} ({})", env!("CARGO_PKG_VERSION"), self.model)
        };
        PluginIdentity::new("iio_environment", version)
    }

    async fn read_sample(&self) -> PluginResult<Sample> {
        let mut values = Measurements::new();
        for channel in &self.channels {
            let value = read_channel(&self.device, *channel).await?;
            values.insert(channel.measurement.to_string(), (value * channel.factor).into());
        }
        Ok(Sample::new(values))
    }

    async fn shutdown(&self) -> PluginResult<()> {
        Ok(())
    }
}

register_plugin!(IioEnvironmentPlugin, "iio_environment");

#[cfg(test)]
mod tests {
    use std::fs;

    use serde_json::json;

    use super::*;
    use crate::core::plugins::types::MeasurementValue;

    fn options(device: &Path) -> PluginOptions {
        let mut options = PluginOptions::new();
        options.insert("device".into(), json!(device.to_str().unwrap()));
        options
    }

    fn number(value: &MeasurementValue) -> f64 {
        match value {
            MeasurementValue::Number(n) => *n,
            other => panic!("expected number, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn bme280_processed_channels() {
        let dir = tempfile::tempdir().unwrap();
        let device = dir.path();
        fs::write(device.join("name"), "bme280\n").unwrap();
        fs::write(device.join("in_temp_input"), "21370\n").unwrap();
        fs::write(device.join("in_humidityrelative_input"), "48213\n").unwrap();
        fs::write(device.join("in_pressure_input"), "101.325\n").unwrap();

        let handle = IioEnvironmentPlugin.initialize(&options(device)).await.unwrap();
        let sample = handle.read_sample().await.unwrap();

        assert!((number(&sample.values["temperature"]) - 21.37).abs() < 1e-9);
        assert!((number(&sample.values["humidity"]) - 48.213).abs() < 1e-9);
        assert!((number(&sample.values["pressure"]) - 1013.25).abs() < 1e-9);
        assert!(handle.identify().version.contains("bme280"));
    }

    #[tokio::test]
    async fn raw_channel_uses_scale_and_offset() {
        let dir = tempfile::tempdir().unwrap();
        let device = dir.path();
        fs::write(device.join("in_temp_raw"), "2000").unwrap();
        fs::write(device.join("in_temp_offset"), "100").unwrap();
        fs::write(device.join("in_temp_scale"), "10").unwrap();

        let handle = IioEnvironmentPlugin.initialize(&options(device)).await.unwrap();
        let sample = handle.read_sample().await.unwrap();

        assert_eq!(sample.values.len(), 1);
        assert!((number(&sample.values["temperature"]) - 21.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn device_without_channels_fails_initialization() {
        let dir = tempfile::tempdir().unwrap();
        let result = IioEnvironmentPlugin.initialize(&options(dir.path())).await;
        assert!(matches!(result, Err(PluginError::ReadFailure(_))));
    }

    #[tokio::test]
    async fn vanished_channel_is_a_read_failure() {
        let dir = tempfile::tempdir().unwrap();
        let device = dir.path();
        fs::write(device.join("in_pressure_input"), "99.1").unwrap();

        let handle = IioEnvironmentPlugin.initialize(&options(device)).await.unwrap();
        fs::remove_file(device.join("in_pressure_input")).unwrap();

        assert!(matches!(
            handle.read_sample().await,
            Err(PluginError::ReadFailure(_))
        ));
    }
}
