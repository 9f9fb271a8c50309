use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{interval, Duration, MissedTickBehavior};

use crate::content::ContentSync;
use crate::dispatch::{CommandDispatcher, CommandSweep};
use crate::presence::{PresenceSweep, PresenceTracker};

#[derive(Debug, Clone, Default, Serialize)]
pub struct TickReport {
    pub presence: PresenceSweep,
    pub commands: CommandSweep,
    pub requeued_downloads: usize,
}

/// Periodic reconciliation of stored state: presence staleness, command
/// deadlines and redelivery, due download retries. Each pass recomputes from
/// the database, so a crashed or skipped tick is caught up by the next one.
pub struct Reconciler {
    presence: Arc<PresenceTracker>,
    dispatcher: Arc<CommandDispatcher>,
    content: Arc<ContentSync>,
    running: AtomicBool,
}

impl Reconciler {
    pub fn new(
        presence: Arc<PresenceTracker>,
        dispatcher: Arc<CommandDispatcher>,
        content: Arc<ContentSync>,
    ) -> Self {
        Reconciler {
            presence,
            dispatcher,
            content,
            running: AtomicBool::new(false),
        }
    }

    /// Run one pass. Returns `None` when a pass is already in flight.
    pub async fn tick(&self) -> Option<TickReport> {
        if self
            .running
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            tracing::debug!("Reconciliation already running, skipping tick");
            return None;
        }
        let _guard = RunningGuard(&self.running);

        let mut report = TickReport::default();
        // Each stage fails independently; whatever it missed is retried next tick
        match self.presence.sweep().await {
            Ok(r) => report.presence = r,
            Err(e) => tracing::warn!(error = %e, "Presence sweep failed"),
        }
        match self.dispatcher.sweep().await {
            Ok(r) => report.commands = r,
            Err(e) => tracing::warn!(error = %e, "Command sweep failed"),
        }
        match self.content.requeue_due(None).await {
            Ok(n) => report.requeued_downloads = n,
            Err(e) => tracing::warn!(error = %e, "Download re-queue failed"),
        }

        let changed = report.presence.disconnected
            + report.commands.timed_out
            + report.commands.delivered
            + report.requeued_downloads;
        if changed > 0 {
            tracing::info!(
                disconnected = report.presence.disconnected,
                alerted = report.presence.alerted,
                timed_out = report.commands.timed_out,
                delivered = report.commands.delivered,
                redelivered = report.commands.redelivered,
                requeued = report.requeued_downloads,
                "Reconciliation pass"
            );
        }
        Some(report)
    }

    /// Tick every `period` until `shutdown` flips to `true`.
    pub fn spawn(self: Arc<Self>, period: Duration, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            tracing::info!(period_secs = period.as_secs(), "Reconciler started");
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        self.tick().await;
                    }
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            break;
                        }
                    }
                }
            }
            tracing::info!("Reconciler stopped");
        })
    }
}

struct RunningGuard<'a>(&'a AtomicBool);

impl Drop for RunningGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use chrono::Duration as ChronoDuration;
    use serde_json::Value;

    use crate::db::models::{CommandStatus, DeviceState};
    use crate::dispatch::CommandKind;
    use crate::testing::Harness;

    #[tokio::test]
    async fn tick_reconciles_presence_and_commands() {
        let h = Harness::new().await;
        let device = h.online_device("PI-00000001", "aa:bb:cc:dd:ee:01").await;
        let reboot = CommandKind::from_parts("reboot", Value::Null).unwrap();
        let cmd = h.state.dispatcher.submit("ops", &device.id, reboot).await.unwrap();
        h.state.dispatcher.pending_for(&device.id).await.unwrap();

        h.advance(ChronoDuration::minutes(6));
        let report = h.state.reconciler.tick().await.unwrap();
        assert_eq!(report.presence.disconnected, 1);
        assert_eq!(report.commands.timed_out, 1);

        assert_eq!(
            h.state.registry.get(&device.id).await.unwrap().state,
            DeviceState::Disconnected
        );
        assert_eq!(
            h.state.dispatcher.get(&cmd.id).await.unwrap().status,
            CommandStatus::Failed
        );

        // Nothing left to do
        let report = h.state.reconciler.tick().await.unwrap();
        assert_eq!(report.presence.disconnected + report.commands.timed_out, 0);
    }

    #[tokio::test]
    async fn tick_raises_one_offline_alert() {
        let h = Harness::new().await;
        let device = h.online_device("PI-00000002", "aa:bb:cc:dd:ee:02").await;

        h.advance(ChronoDuration::minutes(16));
        let report = h.state.reconciler.tick().await.unwrap();
        assert_eq!(report.presence.disconnected, 1);
        assert_eq!(report.presence.alerted, 1);
        assert_eq!(h.notifier.device_ids(), vec![device.id.clone()]);

        assert_eq!(h.state.reconciler.tick().await.unwrap().presence.alerted, 0);
        assert_eq!(h.notifier.device_ids(), vec![device.id]);
    }

    #[tokio::test]
    async fn overlapping_tick_is_skipped() {
        let h = Harness::new().await;
        let reconciler = h.state.reconciler.clone();
        reconciler.running.store(true, std::sync::atomic::Ordering::SeqCst);
        assert!(reconciler.tick().await.is_none());

        reconciler.running.store(false, std::sync::atomic::Ordering::SeqCst);
        assert!(reconciler.tick().await.is_some());
        assert!(!reconciler.running.load(std::sync::atomic::Ordering::SeqCst));
    }

    #[tokio::test]
    async fn spawned_loop_stops_on_shutdown() {
        let h = Harness::new().await;
        let (tx, rx) = tokio::sync::watch::channel(false);
        let handle = h
            .state
            .reconciler
            .clone()
            .spawn(tokio::time::Duration::from_millis(10), rx);
        tx.send(true).unwrap();
        tokio::time::timeout(tokio::time::Duration::from_secs(5), handle)
            .await
            .unwrap()
            .unwrap();
    }
}
