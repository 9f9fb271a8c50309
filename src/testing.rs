//! Fully wired service graph over an in-memory database and a manual clock.

use chrono::Duration;
use std::sync::Arc;

use crate::audit::MemoryAuditSink;
use crate::auth::TokenAuthorizer;
use crate::clock::ManualClock;
use crate::config::Config;
use crate::db::{self, models::Device};
use crate::notify::MemoryNotifier;
use crate::presence::Heartbeat;
use crate::registry::NewDevice;
use crate::{AppState, Collaborators};

pub struct Harness {
    pub state: Arc<AppState>,
    pub clock: Arc<ManualClock>,
    pub audit: Arc<MemoryAuditSink>,
    pub notifier: Arc<MemoryNotifier>,
}

impl Harness {
    pub async fn new() -> Self {
        Self::with_config(Config::default()).await
    }

    pub async fn with_config(config: Config) -> Self {
        let pool = db::open_in_memory().await.unwrap();
        let clock = Arc::new(ManualClock::new());
        let audit = Arc::new(MemoryAuditSink::default());
        let notifier = Arc::new(MemoryNotifier::default());
        let authorizer = Arc::new(TokenAuthorizer::new(&config.auth));
        let state = AppState::build(
            pool,
            config,
            Collaborators {
                clock: clock.clone(),
                audit: audit.clone(),
                notifier: notifier.clone(),
                authorizer,
            },
        );
        Harness {
            state,
            clock,
            audit,
            notifier,
        }
    }

    pub async fn register(&self, key: &str, mac: &str) -> Device {
        self.state
            .registry
            .register(
                "ops",
                NewDevice {
                    name: format!("Screen {key}"),
                    mac: mac.to_string(),
                    device_key: Some(key.to_string()),
                    address: None,
                    location: Some("Main hall".to_string()),
                    description: None,
                    resolution: None,
                    orientation: None,
                    volume: None,
                    brightness: None,
                    owner_id: None,
                },
            )
            .await
            .unwrap()
    }

    pub async fn heartbeat(&self, key: &str) {
        self.state
            .presence
            .record_heartbeat(Heartbeat {
                device_key: key.to_string(),
                address: Some("10.0.0.20".to_string()),
                version: Some("1.0.0".to_string()),
                sysinfo: None,
            })
            .await
            .unwrap();
    }

    /// Registered and heartbeating.
    pub async fn online_device(&self, key: &str, mac: &str) -> Device {
        let device = self.register(key, mac).await;
        self.heartbeat(key).await;
        self.state.registry.get(&device.id).await.unwrap()
    }

    pub fn advance(&self, by: Duration) {
        self.clock.advance(by);
    }
}
