//! Persistent queue of captured divergence snapshots awaiting best-effort
//! upload to the grid. One JSON file per entry; the entry table is mutated
//! only by the uploader, the capturer inserts only.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::RwLock;
use std::sync::atomic::{AtomicBool, Ordering};
use async_trait::async_trait;
use serde::{Serialize, Deserialize};
use crate::config::OutboxConfig;
use crate::emergency::SharedEmergency;

/// Entries attempted per run.
const BATCH_LIMIT: usize = 32;

#[derive(thiserror::Error, Debug)]
pub enum OutboxError {
    #[error("NetworkUnavailable")]
    NetworkUnavailable(),

    #[error("TransientUpload({0})")]
    TransientUpload(u16),

    #[error("PermanentUpload({0})")]
    PermanentUpload(u16),

    #[error("UnknownEntry({0})")]
    UnknownEntry(String),

    #[error("IoError: {0}")]
    IoError(#[from] std::io::Error),

    #[error("JsonError: {0}")]
    JsonError(#[from] serde_json::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum OutboxStatus {
    Pending,
    Uploading,
    Uploaded,
    Failed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OutboxEntry {
    pub snapshot_id: String,
    pub payload: serde_json::Value,
    pub created_at_ms: i64,
    pub upload_attempts: u8,
    pub last_attempt_ms: Option<i64>,
    pub status: OutboxStatus,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct OutboxCounts {
    pub uploaded: usize,
    pub pending: usize,
    pub failed: usize,
}

/// Exponential backoff in minutes after `attempts` failures: 1, 2, 4, 8,
/// then capped at 15.
pub fn backoff_minutes(attempts: u8) -> i64 {
    match attempts {
        0 => 0,
        1 => 1,
        2 => 2,
        3 => 4,
        4 => 8,
        _ => 15,
    }
}

pub struct Outbox {
    dir: PathBuf,
    entries: RwLock<BTreeMap<String, OutboxEntry>>,
    max_attempts: u8,
}

impl Outbox {
    /// Loads every persisted entry. Entries caught mid-upload by a crash are
    /// reset to pending.
    pub fn open(dir: &str, max_attempts: u8) -> Result<Self, OutboxError> {
        let dir = PathBuf::from(dir);
        std::fs::create_dir_all(&dir)?;

        let mut entries = BTreeMap::new();
        for item in std::fs::read_dir(&dir)? {
            let path = item?.path();
            if path.extension().map_or(true, |ext| ext != "json") {
                continue;
            }

            match std::fs::File::open(&path).map_err(OutboxError::from).and_then(|file| {
                Ok(serde_json::from_reader::<_, OutboxEntry>(std::io::BufReader::new(file))?)
            }) {
                Ok(mut entry) => {
                    if entry.status == OutboxStatus::Uploading {
                        entry.status = OutboxStatus::Pending;
                    }
                    entries.insert(entry.snapshot_id.clone(), entry);
                }
                Err(e) => log::warn!("outbox - Skipping unreadable entry {:?} : {:?}", path, e),
            }
        }

        log::info!("outbox - Loaded {} entries from {:?}", entries.len(), dir);

        Ok(Self { dir, entries: RwLock::new(entries), max_attempts })
    }

    pub fn enqueue(&self, snapshot_id: &str, payload: serde_json::Value, now_ms: i64) -> Result<(), OutboxError> {
        let entry = OutboxEntry {
            snapshot_id: snapshot_id.to_string(),
            payload,
            created_at_ms: now_ms,
            upload_attempts: 0,
            last_attempt_ms: None,
            status: OutboxStatus::Pending,
        };

        self.persist(&entry)?;
        self.entries.write().expect("outbox lock").insert(snapshot_id.to_string(), entry);

        Ok(())
    }

    /// Pending entries whose backoff window has elapsed, oldest first.
    pub fn pending(&self, limit: usize, now_ms: i64) -> Vec<OutboxEntry> {
        let entries = self.entries.read().expect("outbox lock");

        let mut pending: Vec<&OutboxEntry> = entries
            .values()
            .filter(|entry| entry.status == OutboxStatus::Pending)
            .filter(|entry| match entry.last_attempt_ms {
                Some(last) => now_ms - last >= backoff_minutes(entry.upload_attempts) * 60_000,
                None => true,
            })
            .collect();
        pending.sort_by_key(|entry| entry.created_at_ms);

        pending.into_iter().take(limit).cloned().collect()
    }

    /// Idempotent: marking an uploaded entry again is a no-op.
    pub fn mark_uploaded(&self, snapshot_id: &str, now_ms: i64) -> Result<(), OutboxError> {
        self.update(snapshot_id, |entry| {
            if entry.status == OutboxStatus::Uploaded {
                return false;
            }
            entry.status = OutboxStatus::Uploaded;
            entry.last_attempt_ms = Some(now_ms);
            true
        })
    }

    pub fn mark_uploading(&self, snapshot_id: &str) -> Result<(), OutboxError> {
        self.update(snapshot_id, |entry| {
            entry.status = OutboxStatus::Uploading;
            true
        })
    }

    /// Bumps the attempt counter; at `max_attempts` the entry fails for good.
    pub fn record_failure(&self, snapshot_id: &str, now_ms: i64) -> Result<(), OutboxError> {
        let max_attempts = self.max_attempts;
        self.update(snapshot_id, |entry| {
            if entry.status == OutboxStatus::Failed {
                return false;
            }
            entry.upload_attempts = entry.upload_attempts.saturating_add(1).min(max_attempts);
            entry.last_attempt_ms = Some(now_ms);
            entry.status = if entry.upload_attempts >= max_attempts {
                OutboxStatus::Failed
            } else {
                OutboxStatus::Pending
            };
            true
        })
    }

    /// 4xx from the server: no retry will ever succeed.
    pub fn mark_failed(&self, snapshot_id: &str, now_ms: i64) -> Result<(), OutboxError> {
        self.update(snapshot_id, |entry| {
            entry.upload_attempts = entry.upload_attempts.saturating_add(1);
            entry.last_attempt_ms = Some(now_ms);
            entry.status = OutboxStatus::Failed;
            true
        })
    }

    pub fn counts(&self) -> OutboxCounts {
        let entries = self.entries.read().expect("outbox lock");
        let mut counts = OutboxCounts::default();

        for entry in entries.values() {
            match entry.status {
                OutboxStatus::Uploaded => counts.uploaded += 1,
                OutboxStatus::Failed => counts.failed += 1,
                OutboxStatus::Pending | OutboxStatus::Uploading => counts.pending += 1,
            }
        }

        counts
    }

    pub fn get(&self, snapshot_id: &str) -> Option<OutboxEntry> {
        self.entries.read().expect("outbox lock").get(snapshot_id).cloned()
    }

    /// Removes uploaded entries older than the retention window.
    pub fn retention_sweep(&self, now_ms: i64, retention_days: i64) -> Result<usize, OutboxError> {
        let cutoff_ms = now_ms - retention_days * 86_400_000;
        let expired: Vec<String> = {
            let entries = self.entries.read().expect("outbox lock");
            entries
                .values()
                .filter(|entry| entry.status == OutboxStatus::Uploaded && entry.created_at_ms < cutoff_ms)
                .map(|entry| entry.snapshot_id.clone())
                .collect()
        };

        for snapshot_id in &expired {
            std::fs::remove_file(self.entry_path(snapshot_id)).unwrap_or_default();
            self.entries.write().expect("outbox lock").remove(snapshot_id);
        }

        Ok(expired.len())
    }

    fn update(&self, snapshot_id: &str, apply: impl FnOnce(&mut OutboxEntry) -> bool) -> Result<(), OutboxError> {
        let updated = {
            let mut entries = self.entries.write().expect("outbox lock");
            let entry = entries
                .get_mut(snapshot_id)
                .ok_or_else(|| OutboxError::UnknownEntry(snapshot_id.to_string()))?;
            apply(entry).then(|| entry.clone())
        };

        if let Some(entry) = updated {
            self.persist(&entry)?;
        }

        Ok(())
    }

    fn persist(&self, entry: &OutboxEntry) -> Result<(), OutboxError> {
        let file = tempfile::NamedTempFile::new_in(&self.dir)?;
        {
            let mut writer = std::io::BufWriter::new(file.as_file());
            serde_json::to_writer(&mut writer, entry)?;
            std::io::Write::flush(&mut writer)?;
        }
        file.persist(self.entry_path(&entry.snapshot_id)).map_err(|e| e.error)?;

        Ok(())
    }

    fn entry_path(&self, snapshot_id: &str) -> PathBuf {
        self.dir.join(format!("{}.json", snapshot_id))
    }
}

/// Where the upload goes. The production transport POSTs the §6.3 envelope;
/// tests swap in a scripted server.
#[async_trait]
pub trait UploadTransport: Send + Sync {
    /// Returns the HTTP status code; transport-level failures map to
    /// `NetworkUnavailable`.
    async fn post(&self, snapshot_id: &str, payload: &serde_json::Value) -> Result<u16, OutboxError>;
}

pub struct HttpTransport {
    client: reqwest::Client,
    endpoint: String,
}

impl HttpTransport {
    pub fn new(endpoint: &str) -> Self {
        Self {
            client: reqwest::Client::builder()
                .timeout(std::time::Duration::from_secs(30))
                .build()
                .expect("reqwest client"),
            endpoint: endpoint.to_string(),
        }
    }
}

#[async_trait]
impl UploadTransport for HttpTransport {
    async fn post(&self, snapshot_id: &str, payload: &serde_json::Value) -> Result<u16, OutboxError> {
        let response = self
            .client
            .post(&self.endpoint)
            .json(payload)
            .send()
            .await
            .map_err(|e| {
                log::debug!("outbox - Network error for `{}` : {}", snapshot_id, e);
                OutboxError::NetworkUnavailable()
            })?;

        Ok(response.status().as_u16())
    }
}

#[derive(Debug, Clone, Copy)]
pub struct SyncConditions {
    pub network_available: bool,
    /// 0..=1
    pub battery_level: f64,
    pub in_emergency: bool,
}

pub struct Uploader {
    outbox: std::sync::Arc<Outbox>,
    transport: Box<dyn UploadTransport>,
    config: OutboxConfig,
    running: AtomicBool,
}

impl Uploader {
    pub fn new(outbox: std::sync::Arc<Outbox>, transport: Box<dyn UploadTransport>, config: OutboxConfig) -> Self {
        Self { outbox, transport, config, running: AtomicBool::new(false) }
    }

    /// One upload batch, guarded by network, battery floor, emergency phase
    /// and a single-flight latch. Response mapping: 2xx uploaded, 4xx
    /// (except 429) failed for good, 5xx/429/network retried later.
    pub async fn run_once(&self, now_ms: i64, conditions: SyncConditions) -> Result<OutboxCounts, OutboxError> {
        if !conditions.network_available {
            return Err(OutboxError::NetworkUnavailable());
        }
        if conditions.battery_level < self.config.min_battery {
            log::debug!("outbox - Battery {:.2} below floor, skipping", conditions.battery_level);
            return Ok(self.outbox.counts());
        }
        if conditions.in_emergency {
            log::debug!("outbox - Emergency active, skipping");
            return Ok(self.outbox.counts());
        }
        if self.running.swap(true, Ordering::SeqCst) {
            return Ok(self.outbox.counts());
        }

        let result = self.upload_batch(now_ms).await;
        self.running.store(false, Ordering::SeqCst);
        result?;

        self.outbox.retention_sweep(now_ms, self.config.retention_days)?;

        Ok(self.outbox.counts())
    }

    async fn upload_batch(&self, now_ms: i64) -> Result<(), OutboxError> {
        for entry in self.outbox.pending(BATCH_LIMIT, now_ms) {
            self.outbox.mark_uploading(&entry.snapshot_id)?;

            match self.transport.post(&entry.snapshot_id, &entry.payload).await {
                Ok(status) if (200..300).contains(&status) => {
                    log::info!("outbox - Uploaded `{}`", entry.snapshot_id);
                    self.outbox.mark_uploaded(&entry.snapshot_id, now_ms)?;
                }
                Ok(status) if status == 429 || status >= 500 => {
                    log::warn!("outbox - Transient failure {} for `{}`", status, entry.snapshot_id);
                    self.outbox.record_failure(&entry.snapshot_id, now_ms)?;
                }
                Ok(status) => {
                    log::error!("outbox - Permanent failure {} for `{}`", status, entry.snapshot_id);
                    self.outbox.mark_failed(&entry.snapshot_id, now_ms)?;
                }
                Err(OutboxError::NetworkUnavailable()) => {
                    // Network dropped mid-batch; count the attempt and stop.
                    self.outbox.record_failure(&entry.snapshot_id, now_ms)?;
                    return Err(OutboxError::NetworkUnavailable());
                }
                Err(e) => return Err(e),
            }
        }

        Ok(())
    }
}

/// Background sync loop at the scheduler floor. Skips while the machine
/// holds the `analytics_upload` task suspended.
pub async fn run_sync_loop(
    uploader: std::sync::Arc<Uploader>,
    emergency: SharedEmergency,
    interval_secs: u64,
    events: tokio::sync::broadcast::Sender<crate::engine::CoreEvent>,
) {
    loop {
        tokio::time::sleep(std::time::Duration::from_secs(interval_secs.max(60))).await;

        let in_emergency = {
            let state = emergency.read().expect("emergency state lock");
            state.phase == crate::emergency::Phase::Emergency
                || state.suspended_task_ids.contains(crate::emergency::TASK_ANALYTICS_UPLOAD)
        };
        let conditions = SyncConditions {
            network_available: true,
            battery_level: 1.0,
            in_emergency,
        };

        match uploader.run_once(chrono::Utc::now().timestamp_millis(), conditions).await {
            Ok(counts) => {
                let _ = events.send(crate::engine::CoreEvent::OutboxProgress {
                    uploaded: counts.uploaded,
                    pending: counts.pending,
                    failed: counts.failed,
                });
            }
            Err(OutboxError::NetworkUnavailable()) => log::debug!("outbox - Network unavailable"),
            Err(e) => log::error!("outbox - Sync error : {:?}", e),
        }
    }
}
