use chrono::Duration;
use serde::{Deserialize, Serialize};
use sqlx::SqlitePool;
use std::sync::Arc;

use crate::clock::Clock;
use crate::db::{
    models::{ResourceSample, TelemetryRow},
    queries_telemetry,
};
use crate::error::FleetResult;

/// Resource usage as self-reported by a device alongside its heartbeat
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SysInfo {
    #[serde(default, alias = "cpu")]
    pub cpu_percent: Option<f64>,
    #[serde(default, alias = "memory")]
    pub memory_percent: Option<f64>,
    #[serde(default, alias = "temperature")]
    pub temperature_c: Option<f64>,
    #[serde(default, alias = "bandwidth")]
    pub bandwidth_mbps: Option<f64>,
}

impl SysInfo {
    pub fn is_empty(&self) -> bool {
        self.cpu_percent.is_none()
            && self.memory_percent.is_none()
            && self.temperature_c.is_none()
            && self.bandwidth_mbps.is_none()
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct DeviceTelemetry {
    pub device_id: String,
    pub commands_sent: i64,
    pub succeeded: i64,
    pub failed: i64,
    pub reliability: Option<f64>,
    pub avg_latency_ms: f64,
    pub samples: Vec<ResourceSample>,
}

/// `succeeded / (succeeded + failed)` rounded to two places; `None` until the
/// first outcome is known.
pub fn reliability_score(succeeded: i64, failed: i64) -> Option<f64> {
    let total = succeeded + failed;
    if total <= 0 {
        return None;
    }
    Some(round2(succeeded as f64 / total as f64))
}

/// Round half away from zero to two decimal places.
pub fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

/// Per-device rolling counters, latency mean and resource samples.
pub struct TelemetryAggregator {
    pool: SqlitePool,
    clock: Arc<dyn Clock>,
    sample_window: u32,
}

impl TelemetryAggregator {
    pub fn new(pool: SqlitePool, clock: Arc<dyn Clock>, sample_window: u32) -> Self {
        TelemetryAggregator {
            pool,
            clock,
            sample_window: sample_window.max(1),
        }
    }

    pub async fn record_sent(&self, device_id: &str) -> FleetResult<()> {
        queries_telemetry::increment_sent(&self.pool, device_id, self.clock.now()).await?;
        Ok(())
    }

    /// Fold one acknowledgement (`latency` set) or timeout (`latency` unset) into the aggregates.
    pub async fn record_outcome(
        &self,
        device_id: &str,
        success: bool,
        latency: Option<Duration>,
    ) -> FleetResult<TelemetryRow> {
        let now = self.clock.now();
        let mut tx = self.pool.begin().await?;
        queries_telemetry::ensure_telemetry_row(&mut *tx, device_id, now).await?;
        let mut row = match queries_telemetry::get_telemetry(&mut *tx, device_id).await? {
            Some(row) => row,
            None => return Err(anyhow::anyhow!("telemetry row vanished for {device_id}").into()),
        };

        if success {
            row.succeeded += 1;
        } else {
            row.failed += 1;
        }
        row.reliability = reliability_score(row.succeeded, row.failed);

        if let Some(latency) = latency {
            let sample = latency.num_milliseconds().max(0) as f64;
            let n = row.latency_samples as f64;
            row.avg_latency_ms = (row.avg_latency_ms * n + sample) / (n + 1.0);
            row.latency_samples += 1;
        }
        row.updated_at = now;

        queries_telemetry::write_outcome(&mut *tx, &row).await?;
        tx.commit().await?;

        tracing::debug!(
            device = %device_id,
            success,
            reliability = ?row.reliability,
            "Telemetry updated"
        );
        Ok(row)
    }

    pub async fn record_sample(&self, device_id: &str, info: &SysInfo) -> FleetResult<()> {
        if info.is_empty() {
            return Ok(());
        }
        let sample = ResourceSample {
            id: 0,
            device_id: device_id.to_string(),
            recorded_at: self.clock.now(),
            cpu_percent: info.cpu_percent,
            memory_percent: info.memory_percent,
            temperature_c: info.temperature_c,
            bandwidth_mbps: info.bandwidth_mbps,
        };
        queries_telemetry::insert_sample(&self.pool, &sample, self.sample_window).await?;
        Ok(())
    }

    pub async fn snapshot(&self, device_id: &str) -> FleetResult<DeviceTelemetry> {
        let row = queries_telemetry::get_telemetry(&self.pool, device_id).await?;
        let samples = queries_telemetry::list_samples(&self.pool, device_id).await?;
        Ok(match row {
            Some(row) => DeviceTelemetry {
                device_id: row.device_id,
                commands_sent: row.commands_sent,
                succeeded: row.succeeded,
                failed: row.failed,
                reliability: row.reliability,
                avg_latency_ms: row.avg_latency_ms,
                samples,
            },
            None => DeviceTelemetry {
                device_id: device_id.to_string(),
                commands_sent: 0,
                succeeded: 0,
                failed: 0,
                reliability: None,
                avg_latency_ms: 0.0,
                samples,
            },
        })
    }
}
