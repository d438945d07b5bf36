//! JSON-lines transport for interactive runs and piping into other tools.

use tokio::io::AsyncWriteExt;

use super::{Transport, TransportError};
use crate::core::plugins::types::Reading;

#[derive(Debug, Default)]
pub struct StdoutTransport;

#[async_trait::async_trait]
impl Transport for StdoutTransport {
    fn name(&self) -> &'static str {
        "stdout"
    }

    async fn send(&self, reading: &Reading) -> Result<(), TransportError> {
        let mut line = serde_json::to_string(reading)
            .map_err(|e| TransportError::Rejected(format!("cannot encode reading: {}", e)))?;
        line.push('\n');

        let mut stdout = tokio::io::stdout();
        stdout
            .write_all(line.as_bytes())
            .await
            .map_err(|e| TransportError::Unreachable(e.to_string()))?;
        stdout
            .flush()
            .await
            .map_err(|e| TransportError::Unreachable(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::plugins::types::Sample;

    #[tokio::test]
    async fn readings_are_written() {
        let reading = Reading::from_sample("bme280", 1, Sample::from_pairs([("temperature", 20.5)]));
        assert!(StdoutTransport.send(&reading).await.is_ok());
    }
}
