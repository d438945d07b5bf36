//! Transport selection: where finished readings are sent.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use validator::{Validate, ValidationErrors};

/// Default number of rows per CSV file. At the default 30 minute period
/// this rolls over once a day.
pub const DEFAULT_ROLLOVER_COUNT: u32 = 48;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum TransportConfig {
    /// Append readings to rolling CSV files.
    Csv(CsvTransportConfig),
    /// Print one JSON line per reading on stdout.
    Stdout,
}

impl Default for TransportConfig {
    fn default() -> Self {
        TransportConfig::Csv(CsvTransportConfig::default())
    }
}

impl Validate for TransportConfig {
    fn validate(&self) -> Result<(), ValidationErrors> {
        match self {
            TransportConfig::Csv(csv) => csv.validate(),
            TransportConfig::Stdout => Ok(()),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct CsvTransportConfig {
    /// Directory the CSV files are created in.
    pub data_dir: PathBuf,

    /// Rows written to one file before a new file is started.
    #[validate(range(min = 1, message = "Rollover count must be at least 1"))]
    pub rollover_count: u32,
}

impl Default for CsvTransportConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("/var/lib/ccs-datalogger"),
            rollover_count: DEFAULT_ROLLOVER_COUNT,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn csv_section_is_tagged_by_kind() {
        let config: TransportConfig = toml::from_str(
            r#"
            kind = "csv"
            data_dir = "/tmp/readings"
            rollover_count = 12
            "#,
        )
        .unwrap();

        match config {
            TransportConfig::Csv(csv) => {
                assert_eq!(csv.data_dir, PathBuf::from("/tmp/readings"));
                assert_eq!(csv.rollover_count, 12);
            }
            other => panic!("unexpected transport: {other:?}"),
        }
    }

    #[test]
    fn zero_rollover_is_rejected() {
        let config = TransportConfig::Csv(CsvTransportConfig {
            rollover_count: 0,
            ..Default::default()
        });
        assert!(config.validate().is_err());
    }
}
