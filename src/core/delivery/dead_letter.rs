//! Readings that could not be delivered.
//!
//! The store is a bounded ring kept in memory for the health report. When a
//! path is configured every record is also appended to a JSON-lines file by
//! a writer task, and the most recent records are read back from it on
//! startup so the record survives restarts. The file is compacted to the
//! newest `capacity` records on open and whenever it grows past twice that.

use std::{
    collections::VecDeque,
    path::{Path, PathBuf},
    sync::{Mutex, MutexGuard},
};

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use tokio::{
    io::AsyncWriteExt,
    sync::{mpsc, oneshot},
};
use tracing::{debug, info, warn};

use crate::core::plugins::types::Reading;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeadLetterReason {
    /// Every delivery attempt failed.
    Exhausted,
    /// The plugin's delivery queue was full when the reading was produced.
    QueueFull,
    /// The service stopped before the reading could be delivered.
    Shutdown,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeadLetter {
    pub reading: Reading,
    pub reason: DeadLetterReason,
    pub attempts: u32,
    pub last_error: Option<String>,
    #[serde(with = "time::serde::rfc3339")]
    pub recorded_at: OffsetDateTime,
}

impl DeadLetter {
    pub fn new(
        reading: Reading,
        reason: DeadLetterReason,
        attempts: u32,
        last_error: Option<String>,
    ) -> Self {
        Self {
            reading,
            reason,
            attempts,
            last_error,
            recorded_at: OffsetDateTime::now_utc(),
        }
    }
}

#[derive(Debug, Default)]
struct Ring {
    records: VecDeque<DeadLetter>,
    evicted: u64,
    recorded: u64,
}

enum WriterCommand {
    Append(String),
    Flush(oneshot::Sender<()>),
}

/// Bounded, append-only record of undeliverable readings.
#[derive(Debug)]
pub struct DeadLetterStore {
    ring: Mutex<Ring>,
    capacity: usize,
    path: Option<PathBuf>,
    writer: Option<mpsc::UnboundedSender<WriterCommand>>,
}

impl DeadLetterStore {
    /// In-memory store holding at most `capacity` records.
    pub fn new(capacity: usize) -> Self {
        Self {
            ring: Mutex::new(Ring::default()),
            capacity: capacity.max(1),
            path: None,
            writer: None,
        }
    }

    /// Store backed by a JSON-lines file. The newest `capacity` records
    /// already in the file are loaded and the file is rewritten to hold
    /// only those; unparsable lines are skipped. Must be called within a
    /// tokio runtime, which runs the file writer.
    pub async fn open(capacity: usize, path: PathBuf) -> Self {
        let mut store = Self::new(capacity);
        let mut lines = VecDeque::with_capacity(store.capacity);
        let mut file_lines = 0usize;

        match tokio::fs::read_to_string(&path).await {
            Ok(content) => {
                let mut ring = store.lock();
                for (number, line) in content.lines().enumerate() {
                    if line.trim().is_empty() {
                        continue;
                    }
                    file_lines += 1;
                    match serde_json::from_str::<DeadLetter>(line) {
                        Ok(letter) => {
                            Self::push_into(&mut ring, store.capacity, letter);
                            keep_newest(&mut lines, store.capacity, line.to_string());
                        }
                        Err(e) => warn!(
                            file = %path.display(),
                            line = number + 1,
                            "Skipping unreadable dead letter: {}",
                            e
                        ),
                    }
                }
                // Restored records are not counted as evictions of this run.
                ring.evicted = 0;
                if !ring.records.is_empty() {
                    info!(
                        file = %path.display(),
                        count = ring.records.len(),
                        "Restored dead letters"
                    );
                }
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => warn!(file = %path.display(), "Cannot read dead-letter file: {}", e),
        }

        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            if let Err(e) = tokio::fs::create_dir_all(parent).await {
                warn!(file = %path.display(), "Cannot create dead-letter directory: {}", e);
            }
        }
        if file_lines > lines.len() {
            match rewrite(&path, &lines).await {
                Ok(()) => debug!(
                    file = %path.display(),
                    dropped = file_lines - lines.len(),
                    "Compacted dead-letter file"
                ),
                Err(e) => warn!(file = %path.display(), "Cannot compact dead-letter file: {}", e),
            }
        }

        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(run_writer(path.clone(), store.capacity, lines, rx));
        store.path = Some(path);
        store.writer = Some(tx);
        store
    }

    fn lock(&self) -> MutexGuard<'_, Ring> {
        // A panic while holding the lock leaves the ring structurally valid.
        self.ring.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn push_into(ring: &mut Ring, capacity: usize, letter: DeadLetter) {
        if ring.records.len() >= capacity {
            ring.records.pop_front();
            ring.evicted += 1;
        }
        ring.records.push_back(letter);
    }

    /// Appends a record, evicting the oldest one when full. Persisting it
    /// happens in the background.
    pub fn push(&self, letter: DeadLetter) {
        warn!(
            plugin = %letter.reading.plugin,
            sequence = letter.reading.sequence,
            reason = ?letter.reason,
            attempts = letter.attempts,
            last_error = letter.last_error.as_deref().unwrap_or(""),
            "Reading moved to dead-letter store"
        );

        if let (Some(writer), Some(path)) = (&self.writer, &self.path) {
            match serde_json::to_string(&letter) {
                Ok(line) => {
                    if writer.send(WriterCommand::Append(line)).is_err() {
                        warn!(file = %path.display(), "Dead-letter writer has stopped");
                    }
                }
                Err(e) => warn!(file = %path.display(), "Cannot serialize dead letter: {}", e),
            }
        }

        let mut ring = self.lock();
        ring.recorded += 1;
        Self::push_into(&mut ring, self.capacity, letter);
    }

    /// Waits until every record pushed so far has been written to the file.
    /// Returns at once for in-memory stores.
    pub async fn flush(&self) {
        let Some(writer) = &self.writer else {
            return;
        };
        let (ack_tx, ack_rx) = oneshot::channel();
        if writer.send(WriterCommand::Flush(ack_tx)).is_ok() {
            let _ = ack_rx.await;
        }
    }

    /// Records currently held, oldest first.
    pub fn snapshot(&self) -> Vec<DeadLetter> {
        self.lock().records.iter().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.lock().records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Records dropped from memory to make room since this store was opened.
    pub fn evicted(&self) -> u64 {
        self.lock().evicted
    }

    /// Records pushed since this store was opened.
    pub fn recorded(&self) -> u64 {
        self.lock().recorded
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

fn keep_newest(lines: &mut VecDeque<String>, capacity: usize, line: String) {
    if lines.len() >= capacity {
        lines.pop_front();
    }
    lines.push_back(line);
}

/// Appends records to the file until every sender is gone. `lines` mirrors
/// the newest `capacity` records on disk; once the file holds more than
/// twice that it is rewritten from them.
async fn run_writer(
    path: PathBuf,
    capacity: usize,
    mut lines: VecDeque<String>,
    mut rx: mpsc::UnboundedReceiver<WriterCommand>,
) {
    let mut file_lines = lines.len();

    while let Some(command) = rx.recv().await {
        let line = match command {
            WriterCommand::Append(line) => line,
            WriterCommand::Flush(ack) => {
                let _ = ack.send(());
                continue;
            }
        };
        keep_newest(&mut lines, capacity, line);

        if file_lines >= capacity.saturating_mul(2) {
            match rewrite(&path, &lines).await {
                Ok(()) => {
                    debug!(file = %path.display(), records = lines.len(), "Compacted dead-letter file");
                    file_lines = lines.len();
                }
                Err(e) => warn!(file = %path.display(), "Cannot compact dead-letter file: {}", e),
            }
            continue;
        }

        let Some(line) = lines.back() else {
            continue;
        };
        match append_line(&path, line).await {
            Ok(()) => file_lines += 1,
            Err(e) => warn!(file = %path.display(), "Cannot persist dead letter: {}", e),
        }
    }
}

async fn append_line(path: &Path, line: &str) -> std::io::Result<()> {
    let mut file = tokio::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .await?;
    file.write_all(format!("{}\n", line).as_bytes()).await?;
    file.flush().await
}

/// Replaces the file with `lines` through a temporary file and a rename.
async fn rewrite(path: &Path, lines: &VecDeque<String>) -> std::io::Result<()> {
    let mut content = String::new();
    for line in lines {
        content.push_str(line);
        content.push('\n');
    }
    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    let tmp = PathBuf::from(tmp);

    tokio::fs::write(&tmp, content).await?;
    tokio::fs::rename(&tmp, path).await
}

#[cfg(test)]
mod tests {
    use std::{fs, io::Write};

    use super::*;
    use crate::core::plugins::types::Sample;

    fn letter(sequence: u64) -> DeadLetter {
        let reading = Reading::from_sample("bme280", sequence, Sample::from_pairs([("t", 1.0)]));
        DeadLetter::new(
            reading,
            DeadLetterReason::Exhausted,
            10,
            Some("unreachable".into()),
        )
    }

    fn line_count(path: &Path) -> usize {
        fs::read_to_string(path).unwrap().lines().count()
    }

    #[test]
    fn ring_evicts_oldest_and_counts() {
        let store = DeadLetterStore::new(2);
        for seq in 1..=3 {
            store.push(letter(seq));
        }

        let sequences: Vec<_> = store.snapshot().iter().map(|l| l.reading.sequence).collect();
        assert_eq!(sequences, vec![2, 3]);
        assert_eq!(store.evicted(), 1);
        assert_eq!(store.recorded(), 3);
    }

    #[tokio::test]
    async fn records_survive_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state").join("dead_letters.jsonl");

        let store = DeadLetterStore::open(8, path.clone()).await;
        store.push(letter(41));
        store.push(letter(42));
        store.flush().await;
        drop(store);

        let reopened = DeadLetterStore::open(8, path).await;
        let sequences: Vec<_> = reopened.snapshot().iter().map(|l| l.reading.sequence).collect();
        assert_eq!(sequences, vec![41, 42]);
        assert_eq!(reopened.snapshot()[1].last_error.as_deref(), Some("unreachable"));
        assert_eq!(reopened.recorded(), 0);
    }

    #[tokio::test]
    async fn reopen_keeps_newest_and_skips_garbage() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("dead_letters.jsonl");

        let store = DeadLetterStore::open(8, path.clone()).await;
        for seq in 1..=4 {
            store.push(letter(seq));
        }
        store.flush().await;
        drop(store);
        let mut file = fs::OpenOptions::new().append(true).open(&path).unwrap();
        writeln!(file, "{{not json").unwrap();

        let reopened = DeadLetterStore::open(2, path.clone()).await;
        let sequences: Vec<_> = reopened.snapshot().iter().map(|l| l.reading.sequence).collect();
        assert_eq!(sequences, vec![3, 4]);
        assert_eq!(reopened.evicted(), 0);
        // The file is compacted to what was restored.
        assert_eq!(line_count(&path), 2);
    }

    #[tokio::test]
    async fn file_stays_bounded() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("dead_letters.jsonl");

        let store = DeadLetterStore::open(2, path.clone()).await;
        for seq in 1..=1000 {
            store.push(letter(seq));
        }
        store.flush().await;

        assert_eq!(store.len(), 2);
        assert!(line_count(&path) <= 4, "file has {} lines", line_count(&path));
        drop(store);

        let reopened = DeadLetterStore::open(2, path).await;
        let sequences: Vec<_> = reopened.snapshot().iter().map(|l| l.reading.sequence).collect();
        assert_eq!(sequences, vec![999, 1000]);
    }

    #[tokio::test]
    async fn flush_without_file_returns() {
        let store = DeadLetterStore::new(2);
        store.push(letter(1));
        store.flush().await;
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn reason_serializes_snake_case() {
        let json = serde_json::to_value(DeadLetterReason::QueueFull).unwrap();
        assert_eq!(json, "queue_full");
    }
}
