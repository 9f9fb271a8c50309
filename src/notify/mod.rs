use chrono::{DateTime, Utc};
use reqwest::Client;
use serde::Serialize;
use tokio::time::Duration;

/// A device has been disconnected for longer than the operator allows
#[derive(Debug, Clone, Serialize)]
pub struct OfflineAlert {
    pub device_id: String,
    pub name: String,
    pub location: String,
    pub last_heartbeat: Option<DateTime<Utc>>,
    pub offline_for_secs: i64,
}

/// Fire-and-forget operator notifications.
pub trait Notifier: Send + Sync {
    fn device_offline(&self, alert: OfflineAlert);
}

#[derive(Debug, Default)]
pub struct LogNotifier;

impl Notifier for LogNotifier {
    fn device_offline(&self, alert: OfflineAlert) {
        tracing::warn!(
            device = %alert.device_id,
            name = %alert.name,
            offline_for_secs = alert.offline_for_secs,
            "Device persistently offline"
        );
    }
}

/// POSTs each alert as JSON to an operator-supplied URL.
pub struct WebhookNotifier {
    client: Client,
    url: String,
}

impl WebhookNotifier {
    pub fn new(url: String) -> Self {
        WebhookNotifier {
            client: Client::builder()
                .timeout(Duration::from_secs(10))
                .build()
                .unwrap_or_default(),
            url,
        }
    }
}

impl Notifier for WebhookNotifier {
    fn device_offline(&self, alert: OfflineAlert) {
        let client = self.client.clone();
        let url = self.url.clone();
        tokio::spawn(async move {
            let result = client
                .post(&url)
                .json(&serde_json::json!({ "type": "device_offline", "alert": alert }))
                .send()
                .await
                .and_then(|r| r.error_for_status());
            match result {
                Ok(_) => tracing::debug!(device = %alert.device_id, "Offline alert delivered"),
                Err(e) => tracing::warn!(device = %alert.device_id, error = %e, "Offline alert webhook failed"),
            }
        });
    }
}

#[cfg(test)]
pub use memory::MemoryNotifier;
