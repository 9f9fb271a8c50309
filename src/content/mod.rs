use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::SqlitePool;
use std::collections::HashSet;
use std::sync::Arc;
use tokio::sync::broadcast;

use crate::audit::{AuditAction, AuditEvent, AuditSink};
use crate::clock::Clock;
use crate::config::ContentConfig;
use crate::db::{
    models::{ContentAsset, ContentKind, SyncRecord, SyncStatus},
    queries_content::{self, NewAsset},
};
use crate::error::{FleetError, FleetResult};
use crate::registry::DeviceRegistry;
use crate::ws::WsEvent;

const MAX_CAS_ATTEMPTS: usize = 8;

#[derive(Debug, Clone, Deserialize)]
pub struct NewContent {
    pub name: String,
    pub kind: ContentKind,
    pub url: String,
    pub checksum: String,
    #[serde(default)]
    pub size_bytes: i64,
    #[serde(default)]
    pub duration_secs: Option<i64>,
}

/// Optional display window; the asset only appears in manifests inside it.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct Schedule {
    pub start: Option<DateTime<Utc>>,
    pub end: Option<DateTime<Utc>>,
}

/// What a device reports about one download
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReportedStatus {
    InProgress,
    Completed,
    Failed,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SyncReport {
    #[serde(alias = "deviceId")]
    pub device_id: String,
    #[serde(alias = "contentId")]
    pub content_id: i64,
    pub status: ReportedStatus,
    #[serde(default)]
    pub progress: Option<i64>,
    #[serde(default, alias = "bytesDownloaded")]
    pub bytes_downloaded: Option<i64>,
    /// Checksum the device computed over the downloaded file
    #[serde(default)]
    pub checksum: Option<String>,
    #[serde(default)]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ManifestEntry {
    pub content_id: i64,
    pub name: String,
    pub kind: ContentKind,
    pub url: String,
    pub checksum: String,
    pub size_bytes: i64,
    pub duration_secs: Option<i64>,
    pub status: SyncStatus,
    pub progress: i64,
}

#[derive(Debug, Clone, Serialize)]
pub struct DeviceSyncSummary {
    pub device_id: String,
    pub total: usize,
    pub downloaded: usize,
    pub pending: usize,
    pub failed: usize,
    pub completion_percent: f64,
    pub records: Vec<SyncRecord>,
}

/// Per-device content assignment and download tracking
pub struct ContentSync {
    pool: SqlitePool,
    registry: Arc<DeviceRegistry>,
    audit: Arc<dyn AuditSink>,
    event_tx: broadcast::Sender<WsEvent>,
    clock: Arc<dyn Clock>,
    config: ContentConfig,
}

impl ContentSync {
    pub fn new(
        pool: SqlitePool,
        registry: Arc<DeviceRegistry>,
        audit: Arc<dyn AuditSink>,
        event_tx: broadcast::Sender<WsEvent>,
        clock: Arc<dyn Clock>,
        config: ContentConfig,
    ) -> Self {
        ContentSync {
            pool,
            registry,
            audit,
            event_tx,
            clock,
            config,
        }
    }

    // ─── Assets ──────────────────────────────────────────────────────────────

    pub async fn register_asset(&self, actor: &str, req: NewContent) -> FleetResult<ContentAsset> {
        let name = req.name.trim();
        if name.is_empty() || name.chars().count() > 200 {
            return Err(FleetError::validation("name must be 1 to 200 characters"));
        }
        if !(req.url.starts_with("http://") || req.url.starts_with("https://")) {
            return Err(FleetError::validation("url must be http(s)"));
        }
        let checksum = req.checksum.trim().to_ascii_lowercase();
        if checksum.is_empty() || !checksum.chars().all(|c| c.is_ascii_hexdigit()) {
            return Err(FleetError::validation("checksum must be a hex digest"));
        }
        if req.size_bytes < 0 {
            return Err(FleetError::validation("size_bytes must not be negative"));
        }
        if let Some(duration) = req.duration_secs {
            if !(1..=86_400).contains(&duration) {
                return Err(FleetError::validation("duration_secs must be between 1 and 86400"));
            }
        }

        let asset = queries_content::insert_asset(
            &self.pool,
            &NewAsset {
                name,
                kind: req.kind,
                url: &req.url,
                checksum: &checksum,
                size_bytes: req.size_bytes,
                duration_secs: req.duration_secs,
            },
            self.clock.now(),
        )
        .await?;

        tracing::info!(content = asset.id, name = %asset.name, "Content registered");
        self.audit.record(AuditEvent {
            actor: actor.to_string(),
            action: AuditAction::ContentRegistered,
            device_id: None,
            detail: serde_json::json!({ "content_id": asset.id, "name": asset.name }),
            at: self.clock.now(),
        });
        Ok(asset)
    }

    pub async fn get_asset(&self, content_id: i64) -> FleetResult<ContentAsset> {
        queries_content::get_asset(&self.pool, content_id)
            .await?
            .ok_or_else(|| FleetError::not_found(format!("content {content_id}")))
    }

    pub async fn list_assets(&self) -> FleetResult<Vec<ContentAsset>> {
        Ok(queries_content::list_assets(&self.pool).await?)
    }

    // ─── Assignment ──────────────────────────────────────────────────────────

    /// One fresh `Pending` record per distinct device. Re-assigning resets an
    /// existing record, including a permanently failed one.
    pub async fn assign(
        &self,
        actor: &str,
        content_id: i64,
        device_ids: &[String],
        schedule: Schedule,
    ) -> FleetResult<Vec<SyncRecord>> {
        self.get_asset(content_id).await?;

        let mut seen = HashSet::new();
        let unique: Vec<&String> = device_ids.iter().filter(|id| seen.insert(id.as_str())).collect();
        if unique.is_empty() {
            return Err(FleetError::validation("device_ids must not be empty"));
        }
        if let (Some(start), Some(end)) = (schedule.start, schedule.end) {
            if end <= start {
                return Err(FleetError::validation("schedule end must be after start"));
            }
        }
        // Validate every target before writing anything
        for id in &unique {
            self.registry.get_active(id).await?;
        }

        let now = self.clock.now();
        let mut records = Vec::with_capacity(unique.len());
        for id in unique {
            let record = SyncRecord {
                device_id: id.clone(),
                content_id,
                status: SyncStatus::Pending,
                progress: 0,
                bytes_downloaded: 0,
                retry_count: 0,
                next_retry_at: None,
                last_error: None,
                schedule_start: schedule.start,
                schedule_end: schedule.end,
                assigned_at: now,
                updated_at: now,
                version: 0,
            };
            queries_content::upsert_sync_record(&self.pool, &record).await?;
            records.push(self.get_record(id, content_id).await?);
        }

        tracing::info!(content = content_id, devices = records.len(), "Content assigned");
        self.audit.record(AuditEvent {
            actor: actor.to_string(),
            action: AuditAction::ContentAssigned,
            device_id: None,
            detail: serde_json::json!({
                "content_id": content_id,
                "device_ids": records.iter().map(|r| r.device_id.as_str()).collect::<Vec<_>>(),
            }),
            at: now,
        });
        Ok(records)
    }

    // ─── Device-facing ───────────────────────────────────────────────────────

    /// Content the device should be downloading now. Due retries are re-queued first.
    pub async fn manifest(&self, device_id: &str) -> FleetResult<Vec<ManifestEntry>> {
        self.registry.get_active(device_id).await?;
        self.requeue_due(Some(device_id)).await?;

        let now = self.clock.now();
        let mut entries = Vec::new();
        for record in queries_content::list_sync_for_device(&self.pool, device_id).await? {
            if !matches!(record.status, SyncStatus::Pending | SyncStatus::InProgress) {
                continue;
            }
            if record.schedule_start.is_some_and(|start| now < start)
                || record.schedule_end.is_some_and(|end| now >= end)
            {
                continue;
            }
            let Some(asset) = queries_content::get_asset(&self.pool, record.content_id).await? else {
                continue;
            };
            entries.push(ManifestEntry {
                content_id: asset.id,
                name: asset.name,
                kind: asset.kind,
                url: asset.url,
                checksum: asset.checksum,
                size_bytes: asset.size_bytes,
                duration_secs: asset.duration_secs,
                status: record.status,
                progress: record.progress,
            });
        }
        Ok(entries)
    }

    /// Apply a device's progress report. Completed records ignore further
    /// reports; a failed record waits for its retry to come due.
    pub async fn report(&self, report: SyncReport) -> FleetResult<SyncRecord> {
        let asset = self.get_asset(report.content_id).await?;
        let now = self.clock.now();
        // Completion is only accepted against the asset's digest
        let reported_sum = report.checksum.as_deref().map(str::trim).filter(|s| !s.is_empty());
        if report.status == ReportedStatus::Completed && reported_sum.is_none() {
            return Err(FleetError::validation(
                "a completed download must report the checksum it computed",
            ));
        }

        for _ in 0..MAX_CAS_ATTEMPTS {
            let current = self.get_record(&report.device_id, report.content_id).await?;
            if matches!(current.status, SyncStatus::Completed | SyncStatus::Failed) {
                return Ok(current);
            }

            let mut next = current.clone();
            next.updated_at = now;
            match report.status {
                ReportedStatus::InProgress => {
                    next.status = SyncStatus::InProgress;
                    next.progress = report.progress.unwrap_or(next.progress).clamp(0, 99);
                    if let Some(bytes) = report.bytes_downloaded {
                        next.bytes_downloaded = bytes.max(0);
                    }
                }
                ReportedStatus::Completed => match reported_sum {
                    Some(sum) if !sum.eq_ignore_ascii_case(&asset.checksum) => {
                        let err = FleetError::IntegrityFailure(format!(
                            "checksum mismatch: expected {}, got {sum}",
                            asset.checksum
                        ));
                        self.fail(&mut next, err.to_string(), now);
                    }
                    _ => {
                        next.status = SyncStatus::Completed;
                        next.progress = 100;
                        next.bytes_downloaded = report.bytes_downloaded.unwrap_or(asset.size_bytes);
                        next.last_error = None;
                    }
                },
                ReportedStatus::Failed => {
                    let reason = report
                        .error
                        .clone()
                        .unwrap_or_else(|| "device reported download failure".to_string());
                    self.fail(&mut next, reason, now);
                }
            }

            if queries_content::save_sync_record(&self.pool, &next).await? {
                next.version += 1;
                self.log_transition(&current, &next);
                self.emit(&next);
                return Ok(next);
            }
            tracing::debug!(device = %report.device_id, content = report.content_id, "Concurrent sync write, retrying");
        }
        Err(FleetError::conflict("sync record is being modified concurrently"))
    }

    /// Schedule an automatic retry, or settle into a permanent failure once the budget is spent.
    fn fail(&self, record: &mut SyncRecord, reason: String, now: DateTime<Utc>) {
        record.status = SyncStatus::Failed;
        record.last_error = Some(reason);
        let attempt = u32::try_from(record.retry_count).unwrap_or(u32::MAX);
        record.next_retry_at = if attempt < self.config.max_retries {
            Some(
                now.checked_add_signed(self.config.backoff(attempt))
                    .unwrap_or(DateTime::<Utc>::MAX_UTC),
            )
        } else {
            None
        };
    }

    /// Move failed records whose backoff has elapsed back to `InProgress`.
    pub async fn requeue_due(&self, device_id: Option<&str>) -> FleetResult<usize> {
        let now = self.clock.now();
        let mut requeued = 0;
        for record in queries_content::list_scheduled_retries(&self.pool, device_id).await? {
            if record.next_retry_at.is_some_and(|due| due > now) {
                continue;
            }
            let mut next = record.clone();
            next.status = SyncStatus::InProgress;
            next.retry_count += 1;
            next.next_retry_at = None;
            next.progress = 0;
            next.bytes_downloaded = 0;
            next.updated_at = now;
            // A lost race means someone else already moved the record on
            if queries_content::save_sync_record(&self.pool, &next).await? {
                tracing::info!(
                    device = %next.device_id,
                    content = next.content_id,
                    retry = next.retry_count,
                    "Content download re-queued"
                );
                self.emit(&next);
                requeued += 1;
            }
        }
        Ok(requeued)
    }

    /// Manual reset of a permanently failed record.
    pub async fn retry(&self, actor: &str, device_id: &str, content_id: i64) -> FleetResult<SyncRecord> {
        let current = self.get_record(device_id, content_id).await?;
        if !current.is_permanently_failed() {
            return Err(FleetError::conflict(
                "only permanently failed downloads can be retried manually",
            ));
        }
        let now = self.clock.now();
        let mut next = current.clone();
        next.status = SyncStatus::Pending;
        next.retry_count = 0;
        next.progress = 0;
        next.bytes_downloaded = 0;
        next.updated_at = now;
        if !queries_content::save_sync_record(&self.pool, &next).await? {
            return Err(FleetError::conflict("sync record changed, try again"));
        }
        next.version += 1;

        self.audit.record(AuditEvent {
            actor: actor.to_string(),
            action: AuditAction::SyncRetried,
            device_id: Some(device_id.to_string()),
            detail: serde_json::json!({ "content_id": content_id, "last_error": current.last_error }),
            at: now,
        });
        self.emit(&next);
        Ok(next)
    }

    // ─── Views ───────────────────────────────────────────────────────────────

    pub async fn device_summary(&self, device_id: &str) -> FleetResult<DeviceSyncSummary> {
        self.registry.get(device_id).await?;
        let records = queries_content::list_sync_for_device(&self.pool, device_id).await?;
        Ok(summarize(device_id, records))
    }

    pub async fn content_status(&self, content_id: i64) -> FleetResult<Vec<SyncRecord>> {
        self.get_asset(content_id).await?;
        Ok(queries_content::list_sync_for_content(&self.pool, content_id).await?)
    }

    async fn get_record(&self, device_id: &str, content_id: i64) -> FleetResult<SyncRecord> {
        queries_content::get_sync_record(&self.pool, device_id, content_id)
            .await?
            .ok_or_else(|| {
                FleetError::not_found(format!("assignment of content {content_id} to device {device_id}"))
            })
    }

    fn log_transition(&self, before: &SyncRecord, after: &SyncRecord) {
        if before.status == after.status {
            return;
        }
        match (after.status, after.next_retry_at) {
            (SyncStatus::Failed, Some(due)) => tracing::warn!(
                device = %after.device_id,
                content = after.content_id,
                retry_at = %due,
                error = after.last_error.as_deref().unwrap_or(""),
                "Content download failed, retry scheduled"
            ),
            (SyncStatus::Failed, None) => tracing::warn!(
                device = %after.device_id,
                content = after.content_id,
                retries = after.retry_count,
                "Content download failed permanently"
            ),
            (status, _) => tracing::info!(
                device = %after.device_id,
                content = after.content_id,
                status = ?status,
                "Content sync status changed"
            ),
        }
    }

    fn emit(&self, record: &SyncRecord) {
        let _ = self.event_tx.send(WsEvent::SyncProgress {
            device_id: record.device_id.clone(),
            content_id: record.content_id,
            status: record.status,
            progress: record.progress,
        });
    }
}

/// Downloaded, still-pending and permanently failed counts. A device with
/// nothing assigned is fully synced.
fn summarize(device_id: &str, records: Vec<SyncRecord>) -> DeviceSyncSummary {
    let total = records.len();
    let downloaded = records.iter().filter(|r| r.status == SyncStatus::Completed).count();
    let failed = records.iter().filter(|r| r.is_permanently_failed()).count();
    let completion_percent = if total == 0 {
        100.0
    } else {
        crate::telemetry::round2(downloaded as f64 * 100.0 / total as f64)
    };
    DeviceSyncSummary {
        device_id: device_id.to_string(),
        total,
        downloaded,
        pending: total - downloaded - failed,
        failed,
        completion_percent,
        records,
    }
}

#[cfg(test)]
mod tests;
