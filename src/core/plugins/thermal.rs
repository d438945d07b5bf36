//! Builtin `cpu_thermal` plugin.
//!
//! Reads every `thermal_zone*` under `/sys/class/thermal` (or the directory
//! given by the `root` option). The kernel reports millidegrees Celsius;
//! each zone becomes one measurement `thermal_zoneN` in °C. On a Raspberry
//! Pi in an enclosure this is mostly useful to spot a cooking enclosure
//! before it skews the air temperature sensor.

use std::path::{Path, PathBuf};

use super::{
    error::PluginError,
    traits::{PluginHandle, SensorPlugin},
    types::{Measurements, PluginIdentity, PluginOptions, PluginResult, Sample},
};
use crate::register_plugin;

const DEFAULT_THERMAL_ROOT: &str = "/sys/class/thermal";

#[derive(Debug, Default)]
pub struct CpuThermalPlugin;

#[async_trait::async_trait]
impl SensorPlugin for CpuThermalPlugin {
    async fn initialize(&self, options: &PluginOptions) -> PluginResult<Box<dyn PluginHandle>> {
        let root = options
            .get("root")
            .and_then(|v| v.as_str())
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from(DEFAULT_THERMAL_ROOT));

        let zones = list_zones(&root).await?;
        if zones.is_empty() {
            return Err(PluginError::ReadFailure(format!(
                "no thermal zones under {}",
                root.display()
            )));
        }

        Ok(Box::new(CpuThermalHandle { root }))
    }
}

pub struct CpuThermalHandle {
    root: PathBuf,
}

/// Names of `thermal_zone*` entries, sorted.
async fn list_zones(root: &Path) -> PluginResult<Vec<String>> {
    let mut entries = tokio::fs::read_dir(root)
        .await
        .map_err(|e| PluginError::ReadFailure(format!("cannot read {}: {}", root.display(), e)))?;

    let mut zones = Vec::new();
    while let Ok(Some(entry)) = entries.next_entry().await {
        if let Ok(name) = entry.file_name().into_string() {
            if name.starts_with("thermal_zone") {
                zones.push(name);
            }
        }
    }
    zones.sort();
    Ok(zones)
}

#[async_trait::async_trait]
impl PluginHandle for CpuThermalHandle {
    fn identify(&self) -> PluginIdentity {
        PluginIdentity::new("cpu_thermal", env!("CARGO_PKG_VERSION"))
    }

    async fn read_sample(&self) -> PluginResult<Sample> {
        let mut values = Measurements::new();

        for zone in list_zones(&self.root).await? {
            let path = self.root.join(&zone).join("temp");
            // Zones without a readable temp file are skipped
            let Ok(raw) = tokio::fs::read_to_string(&path).await else {
                continue;
            };
            let millidegrees = raw.trim().parse::<i64>().map_err(|e| {
                PluginError::InvalidData(format!("{}: {}", path.display(), e))
            })?;
            values.insert(zone, (millidegrees as f64 / 1000.0).into());
        }

        if values.is_empty() {
            return Err(PluginError::ReadFailure(format!(
                "no readable thermal zone under {}",
                self.root.display()
            )));
        }
        Ok(Sample::new(values))
    }

    async fn shutdown(&self) -> PluginResult<()> {
        Ok(())
    }
}

register_plugin!(CpuThermalPlugin, "cpu_thermal");

#[cfg(test)]
mod tests {
    use std::fs;

    use serde_json::json;

    use super::*;
    use crate::core::plugins::types::MeasurementValue;

    fn zone(root: &Path, name: &str, temp: Option<&str>) {
        let dir = root.join(name);
        fs::create_dir_all(&dir).unwrap();
        if let Some(temp) = temp {
            fs::write(dir.join("temp"), temp).unwrap();
        }
    }

    fn options(root: &Path) -> PluginOptions {
        let mut options = PluginOptions::new();
        options.insert("root".into(), json!(root.to_str().unwrap()));
        options
    }

    #[tokio::test]
    async fn reads_each_zone_in_celsius() {
        let dir = tempfile::tempdir().unwrap();
        zone(dir.path(), "thermal_zone0", Some("45500\n"));
        zone(dir.path(), "thermal_zone1", Some("38000\n"));
        zone(dir.path(), "cooling_device0", None);

        let handle = CpuThermalPlugin.initialize(&options(dir.path())).await.unwrap();
        let sample = handle.read_sample().await.unwrap();

        assert_eq!(sample.values.len(), 2);
        assert_eq!(sample.values["thermal_zone0"], MeasurementValue::Number(45.5));
        assert_eq!(sample.values["thermal_zone1"], MeasurementValue::Number(38.0));
    }

    #[tokio::test]
    async fn zones_without_temp_are_skipped() {
        let dir = tempfile::tempdir().unwrap();
        zone(dir.path(), "thermal_zone0", Some("50000"));
        zone(dir.path(), "thermal_zone1", None);

        let handle = CpuThermalPlugin.initialize(&options(dir.path())).await.unwrap();
        let sample = handle.read_sample().await.unwrap();

        assert_eq!(sample.values.len(), 1);
    }

    #[tokio::test]
    async fn garbage_temperature_is_invalid_data() {
        let dir = tempfile::tempdir().unwrap();
        zone(dir.path(), "thermal_zone0", Some("hot"));

        let handle = CpuThermalPlugin.initialize(&options(dir.path())).await.unwrap();
        assert!(matches!(
            handle.read_sample().await,
            Err(PluginError::InvalidData(_))
        ));
    }

    #[tokio::test]
    async fn missing_root_fails_initialization() {
        let dir = tempfile::tempdir().unwrap();
        let result = CpuThermalPlugin
            .initialize(&options(&dir.path().join("absent")))
            .await;
        assert!(matches!(result, Err(PluginError::ReadFailure(_))));
    }

    #[tokio::test]
    async fn identity_declares_required_capabilities() {
        let dir = tempfile::tempdir().unwrap();
        zone(dir.path(), "thermal_zone0", Some("40000"));

        let handle = CpuThermalPlugin.initialize(&options(dir.path())).await.unwrap();
        let identity = handle.identify();

        assert_eq!(identity.name, "cpu_thermal");
        assert!(identity.missing_capabilities().is_empty());
    }
}
