//! Where finished readings go.
//!
//! The delivery queue only knows the [`Transport`] trait. Two
//! implementations ship with the logger: rolling CSV files on local storage
//! and JSON lines on stdout.

use std::sync::Arc;

use thiserror::Error;

use super::plugins::types::Reading;
use crate::config::transport::TransportConfig;

pub mod csv;
pub mod stdout;

#[cfg(test)]
pub(crate) mod memory;

pub use self::{csv::CsvTransport, stdout::StdoutTransport};

/// Why a reading could not be handed to the data station.
///
/// Both variants are retried by the delivery queue and count as one
/// attempt.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum TransportError {
    /// The destination could not be reached (I/O error, timeout).
    #[error("data station unreachable: {0}")]
    Unreachable(String),

    /// The destination answered but refused the reading.
    #[error("reading rejected: {0}")]
    Rejected(String),
}

#[async_trait::async_trait]
pub trait Transport: Send + Sync {
    /// Short name used in logs.
    fn name(&self) -> &'static str;

    /// Sends one reading. Implementations must not reorder readings of the
    /// same plugin; callers never send two readings of one plugin
    /// concurrently.
    async fn send(&self, reading: &Reading) -> Result<(), TransportError>;
}

/// Builds the transport selected in the configuration.
pub fn build(config: &TransportConfig) -> Arc<dyn Transport> {
    match config {
        TransportConfig::Csv(csv) => Arc::new(CsvTransport::new(
            csv.data_dir.clone(),
            csv.rollover_count,
        )),
        TransportConfig::Stdout => Arc::new(StdoutTransport::default()),
    }
}
