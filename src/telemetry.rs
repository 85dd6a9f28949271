use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use sha2::{Digest, Sha256};

use crate::config::AppConfig;
use crate::errors::AppResult;
use crate::resolver::BatchMeta;

const BUFFER_STEM: &str = "geocache-events";

/// What the resolver reports. Addresses only appear as [`hash_address`]
/// pseudonyms.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum GeocacheEvent {
    ResolverStart {
        version: String,
        providers: Vec<String>,
        recovered: bool,
    },
    BatchResolved(BatchMeta),
    AddressEscalated {
        address_hash: String,
        reason: String,
    },
}

impl GeocacheEvent {
    pub fn escalated(address: &str, reason: &str) -> Self {
        Self::AddressEscalated {
            address_hash: hash_address(address),
            reason: reason.to_string(),
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::ResolverStart { .. } => "resolver_start",
            Self::BatchResolved(_) => "batch_resolved",
            Self::AddressEscalated { .. } => "address_escalated",
        }
    }
}

#[derive(Debug, Serialize)]
struct QueuedEvent {
    at: DateTime<Utc>,
    #[serde(flatten)]
    event: GeocacheEvent,
}

/// JSONL event buffer next to the database. Full files shift to
/// `geocache-events.1.jsonl`, `.2`, ... and the oldest one is dropped.
#[derive(Clone)]
pub struct TelemetryClient {
    enabled: Arc<AtomicBool>,
    queue: Arc<Mutex<Vec<QueuedEvent>>>,
    buffer_path: PathBuf,
    batch_size: usize,
    max_file_bytes: u64,
    max_file_count: usize,
}

impl TelemetryClient {
    pub fn new<P: AsRef<Path>>(data_dir: P, config: &AppConfig) -> AppResult<Self> {
        let data_dir = data_dir.as_ref();
        fs::create_dir_all(data_dir)?;
        let buffer_path = data_dir.join(format!("{BUFFER_STEM}.jsonl"));
        OpenOptions::new()
            .create(true)
            .append(true)
            .open(&buffer_path)?;

        Ok(Self {
            enabled: Arc::new(AtomicBool::new(config.telemetry_enabled_by_default)),
            queue: Arc::new(Mutex::new(Vec::new())),
            buffer_path,
            batch_size: config.telemetry_batch_size.max(1),
            max_file_bytes: config.telemetry_buffer_max_bytes,
            max_file_count: config.telemetry_buffer_max_files.max(1),
        })
    }

    /// Queues the event and writes the queue once it reaches the batch size.
    /// A failed write keeps the queue for the next attempt.
    pub fn record(&self, event: GeocacheEvent) -> AppResult<()> {
        if !self.is_enabled() {
            return Ok(());
        }

        let mut queue = self.queue.lock();
        queue.push(QueuedEvent {
            at: Utc::now(),
            event,
        });
        if queue.len() >= self.batch_size {
            self.write_queued(&mut queue)?;
        }
        Ok(())
    }

    pub fn flush(&self) -> AppResult<()> {
        let mut queue = self.queue.lock();
        self.write_queued(&mut queue)
    }

    pub fn queue_depth(&self) -> usize {
        self.queue.lock().len()
    }

    pub fn buffer_path(&self) -> &Path {
        &self.buffer_path
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Relaxed)
    }

    /// Disabling also discards whatever is still queued.
    pub fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::SeqCst);
        if !enabled {
            self.queue.lock().clear();
        }
    }

    fn write_queued(&self, queue: &mut Vec<QueuedEvent>) -> AppResult<()> {
        if queue.is_empty() {
            return Ok(());
        }

        let mut lines = Vec::new();
        for queued in queue.iter() {
            serde_json::to_writer(&mut lines, queued)?;
            lines.push(b'\n');
        }
        self.rotate_if_needed(lines.len() as u64)?;

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.buffer_path)?;
        file.write_all(&lines)?;
        file.flush()?;
        queue.clear();
        Ok(())
    }

    fn rotate_if_needed(&self, incoming_bytes: u64) -> AppResult<()> {
        let current = fs::metadata(&self.buffer_path)
            .map(|meta| meta.len())
            .unwrap_or(0);
        if current == 0 || current + incoming_bytes <= self.max_file_bytes {
            return Ok(());
        }

        let kept = self.max_file_count - 1;
        if kept == 0 {
            remove_if_present(&self.buffer_path)?;
            return Ok(());
        }
        remove_if_present(&self.rotated_path(kept))?;
        for idx in (1..kept).rev() {
            let from = self.rotated_path(idx);
            if from.exists() {
                fs::rename(&from, self.rotated_path(idx + 1))?;
            }
        }
        fs::rename(&self.buffer_path, self.rotated_path(1))?;
        Ok(())
    }

    fn rotated_path(&self, idx: usize) -> PathBuf {
        self.buffer_path
            .with_file_name(format!("{BUFFER_STEM}.{idx}.jsonl"))
    }
}

fn remove_if_present(path: &Path) -> AppResult<()> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(err) => Err(err.into()),
    }
}

/// Stable pseudonym for an address key.
pub fn hash_address(address: &str) -> String {
    let digest = Sha256::digest(address.as_bytes());
    URL_SAFE_NO_PAD.encode(&digest[..12])
}
