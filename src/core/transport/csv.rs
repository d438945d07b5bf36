//! Rolling CSV files, one series per plugin.
//!
//! Each plugin gets its own file in the data directory:
//!
//! ```text
//! 20250301120000_bme280_000001_ccs_logger.csv
//! Timestamp (UTC),Sequence,humidity,pressure,temperature
//! 2025-03-01 12:00:00,1,48.2,1013.25,21.37
//! ```
//!
//! A new file is started once `rollover_count` rows have been written, or
//! when a reading carries a different set of measurements than the header.
//! Every plugin's file state has its own lock, so a stalled write only
//! holds up that plugin.

use std::{
    collections::HashMap,
    path::{Path, PathBuf},
    sync::{Arc, Mutex, PoisonError},
};

use time::{format_description::FormatItem, macros::format_description};
use tokio::{fs::OpenOptions, io::AsyncWriteExt};
use tracing::{debug, info};

use super::{Transport, TransportError};
use crate::core::plugins::types::Reading;

const FILE_STAMP: &[FormatItem<'static>] =
    format_description!("[year][month][day][hour][minute][second]");
const ROW_STAMP: &[FormatItem<'static>] =
    format_description!("[year]-[month]-[day] [hour]:[minute]:[second]");

/// Header cell of the timestamp column.
pub const TIMESTAMP_HEADER: &str = "Timestamp (UTC)";

#[derive(Debug)]
struct OpenFile {
    path: PathBuf,
    columns: Vec<String>,
    rows: u32,
}

type FileSlot = Arc<tokio::sync::Mutex<Option<OpenFile>>>;

#[derive(Debug)]
pub struct CsvTransport {
    data_dir: PathBuf,
    rollover_count: u32,
    files: Mutex<HashMap<String, FileSlot>>,
}

impl CsvTransport {
    pub fn new(data_dir: PathBuf, rollover_count: u32) -> Self {
        Self {
            data_dir,
            rollover_count: rollover_count.max(1),
            files: Mutex::new(HashMap::new()),
        }
    }

    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    /// File state of `plugin`, created empty on first use.
    fn slot(&self, plugin: &str) -> FileSlot {
        let mut files = self.files.lock().unwrap_or_else(PoisonError::into_inner);
        Arc::clone(files.entry(plugin.to_string()).or_default())
    }

    async fn start_file(&self, reading: &Reading, columns: Vec<String>) -> Result<OpenFile, TransportError> {
        tokio::fs::create_dir_all(&self.data_dir)
            .await
            .map_err(|e| unreachable_io(&self.data_dir, e))?;

        let stamp = reading
            .captured_at
            .to_offset(time::UtcOffset::UTC)
            .format(FILE_STAMP)
            .map_err(|e| TransportError::Rejected(e.to_string()))?;
        let path = self.data_dir.join(format!(
            "{}_{}_{:06}_ccs_logger.csv",
            stamp, reading.plugin, reading.sequence
        ));

        let mut header = vec![TIMESTAMP_HEADER.to_string(), "Sequence".to_string()];
        header.extend(columns.iter().cloned());
        append(&path, &format_row(&header)).await?;

        info!(plugin = %reading.plugin, file = %path.display(), "Started new CSV file");
        Ok(OpenFile {
            path,
            columns,
            rows: 0,
        })
    }
}

#[async_trait::async_trait]
impl Transport for CsvTransport {
    fn name(&self) -> &'static str {
        "csv"
    }

    async fn send(&self, reading: &Reading) -> Result<(), TransportError> {
        let columns: Vec<String> = reading.values.keys().cloned().collect();
        let slot = self.slot(&reading.plugin);
        let mut current = slot.lock().await;

        let needs_new = match current.as_ref() {
            Some(file) => file.rows >= self.rollover_count || file.columns != columns,
            None => true,
        };
        if needs_new {
            *current = Some(self.start_file(reading, columns).await?);
        }

        let Some(file) = current.as_mut() else {
            return Err(TransportError::Unreachable("CSV file state lost".into()));
        };

        let timestamp = reading
            .captured_at
            .to_offset(time::UtcOffset::UTC)
            .format(ROW_STAMP)
            .map_err(|e| TransportError::Rejected(e.to_string()))?;
        let mut row = vec![timestamp, reading.sequence.to_string()];
        row.extend(reading.values.values().map(ToString::to_string));

        append(&file.path, &format_row(&row)).await?;
        file.rows += 1;
        debug!(plugin = %reading.plugin, sequence = reading.sequence, rows = file.rows, "CSV row written");
        Ok(())
    }
}

async fn append(path: &Path, line: &str) -> Result<(), TransportError> {
    let mut file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .await
        .map_err(|e| unreachable_io(path, e))?;
    file.write_all(line.as_bytes())
        .await
        .map_err(|e| unreachable_io(path, e))?;
    file.flush().await.map_err(|e| unreachable_io(path, e))
}

fn unreachable_io(path: &Path, e: std::io::Error) -> TransportError {
    TransportError::Unreachable(format!("{}: {}", path.display(), e))
}

fn format_row(cells: &[String]) -> String {
    let mut line = cells
        .iter()
        .map(|cell| escape(cell))
        .collect::<Vec<_>>()
        .join(",");
    line.push('\n');
    line
}

fn escape(cell: &str) -> String {
    if cell.contains([',', '"', '\n', '\r']) {
        format!("\"{}\"", cell.replace('"', "\"\""))
    } else {
        cell.to_string()
    }
}
