pub mod command;
pub mod delivery;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sqlx::SqlitePool;
use std::sync::Arc;
use tokio::sync::broadcast;
use uuid::Uuid;

use crate::audit::{AuditAction, AuditEvent, AuditSink};
use crate::clock::Clock;
use crate::config::CommandConfig;
use crate::db::{
    models::{CommandRow, CommandStatus, DeviceState, FailureReason},
    queries_commands,
};
use crate::error::{FleetError, FleetResult};
use crate::presence::PresenceTracker;
use crate::registry::DeviceRegistry;
use crate::telemetry::TelemetryAggregator;
use crate::ws::WsEvent;

pub use command::{Command, CommandKind};
pub use delivery::{ChannelRegistry, Delivery, PushMessage};

const DEFAULT_HISTORY_LIMIT: i64 = 50;
const MAX_HISTORY_LIMIT: i64 = 500;

/// Outcome a device reports for a command it received
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AckStatus {
    #[serde(alias = "success", alias = "ok")]
    Acknowledged,
    #[serde(alias = "error")]
    Failed,
}

impl AckStatus {
    fn terminal_status(self) -> CommandStatus {
        match self {
            AckStatus::Acknowledged => CommandStatus::Acknowledged,
            AckStatus::Failed => CommandStatus::Failed,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct CancelOutcome {
    pub command: Command,
    /// `false` when the command had already been sent and only a cancel notice went out
    pub cancelled: bool,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct CommandSweep {
    pub timed_out: usize,
    /// `Pending` commands that went out over a channel the submit-time push missed
    pub delivered: usize,
    pub redelivered: usize,
    pub errors: usize,
}

#[derive(Debug, Clone, Copy)]
enum Phase {
    Sent,
    Acknowledged,
    Failed,
}

/// Command lifecycle: creation, delivery over push or pull, acknowledgement,
/// cancellation and the delivery deadline.
pub struct CommandDispatcher {
    pool: SqlitePool,
    registry: Arc<DeviceRegistry>,
    presence: Arc<PresenceTracker>,
    telemetry: Arc<TelemetryAggregator>,
    channels: Arc<ChannelRegistry>,
    audit: Arc<dyn AuditSink>,
    event_tx: broadcast::Sender<WsEvent>,
    clock: Arc<dyn Clock>,
    config: CommandConfig,
}

impl CommandDispatcher {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        pool: SqlitePool,
        registry: Arc<DeviceRegistry>,
        presence: Arc<PresenceTracker>,
        telemetry: Arc<TelemetryAggregator>,
        channels: Arc<ChannelRegistry>,
        audit: Arc<dyn AuditSink>,
        event_tx: broadcast::Sender<WsEvent>,
        clock: Arc<dyn Clock>,
        config: CommandConfig,
    ) -> Self {
        CommandDispatcher {
            pool,
            registry,
            presence,
            telemetry,
            channels,
            audit,
            event_tx,
            clock,
            config,
        }
    }

    /// Queue a command and attempt immediate push delivery. Never waits on the device.
    pub async fn submit(&self, actor: &str, device_id: &str, kind: CommandKind) -> FleetResult<Command> {
        let device = self.registry.get_active(device_id).await?;
        if kind.requires_connection() && !self.presence.is_online(&device) {
            return Err(FleetError::conflict(format!(
                "device {} is offline ({}), {} requires a live connection",
                device.id,
                device.state.as_str(),
                kind.type_name()
            )));
        }

        let now = self.clock.now();
        let row = CommandRow {
            id: Uuid::new_v4().to_string(),
            device_id: device.id.clone(),
            kind: kind.type_name().to_string(),
            payload: kind.params().to_string(),
            status: CommandStatus::Pending,
            response: None,
            failure_reason: None,
            issued_by: Some(actor.to_string()),
            issued_at: now,
            sent_at: None,
            last_delivered_at: None,
            delivery_attempts: 0,
            acknowledged_at: None,
        };
        queries_commands::insert_command(&self.pool, &row).await?;

        let command = Command::from(row);
        tracing::info!(
            command = %command.id,
            device = %device.id,
            kind = command.kind.type_name(),
            "Command queued"
        );
        self.audit.record(AuditEvent {
            actor: actor.to_string(),
            action: AuditAction::CommandIssued,
            device_id: Some(device.id.clone()),
            detail: serde_json::json!({ "command_id": command.id, "command": command.kind }),
            at: now,
        });
        self.emit(&command);

        if self.push(&command).await? == Delivery::Pushed {
            return self.get(&command.id).await;
        }
        Ok(command)
    }

    pub async fn get(&self, command_id: &str) -> FleetResult<Command> {
        Ok(self.get_row(command_id).await?.into())
    }

    /// Most recent commands for a device, newest first.
    pub async fn history(&self, device_id: &str, limit: Option<i64>) -> FleetResult<Vec<Command>> {
        self.registry.get(device_id).await?;
        let limit = limit.unwrap_or(DEFAULT_HISTORY_LIMIT).clamp(1, MAX_HISTORY_LIMIT);
        let rows = queries_commands::list_commands_for_device(&self.pool, device_id, limit).await?;
        Ok(rows.into_iter().map(Command::from).collect())
    }

    /// Pull path: every command the device has not acknowledged yet, oldest
    /// first. Unacknowledged `Sent` commands are handed out again.
    pub async fn pending_for(&self, device_id: &str) -> FleetResult<Vec<Command>> {
        self.registry.get_active(device_id).await?;
        let rows = queries_commands::list_outstanding_for_device(&self.pool, device_id).await?;

        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            let command = Command::from(row);
            self.mark_delivered(&command).await?;
            let current = self.get(&command.id).await?;
            if current.status == CommandStatus::Sent {
                out.push(current);
            }
        }
        Ok(out)
    }

    /// Push every outstanding command, e.g. when a device opens its channel.
    pub async fn flush_outstanding(&self, device_id: &str) -> FleetResult<usize> {
        let rows = queries_commands::list_outstanding_for_device(&self.pool, device_id).await?;
        let mut pushed = 0;
        for row in rows {
            if self.push(&Command::from(row)).await? == Delivery::Pushed {
                pushed += 1;
            }
        }
        Ok(pushed)
    }

    /// Record the device's outcome. Repeating the same outcome is a no-op, so a
    /// device may safely re-send an acknowledgement it is unsure arrived.
    pub async fn acknowledge(
        &self,
        command_id: &str,
        status: AckStatus,
        response: Option<Value>,
    ) -> FleetResult<Command> {
        let row = self.get_row(command_id).await?;
        let target = status.terminal_status();
        let now = self.clock.now();

        match row.status {
            // Acked before the delivery bookkeeping landed: the device evidently has it
            CommandStatus::Pending => {
                if queries_commands::mark_sent(&self.pool, command_id, now).await? {
                    self.on_sent(&Command::from(row.clone())).await;
                }
            }
            CommandStatus::Sent => {}
            current if current == target => return Ok(row.into()),
            current => return Err(already(current)),
        }

        let response_text = response.as_ref().map(Value::to_string);
        let reason = (target == CommandStatus::Failed).then_some(FailureReason::DeviceReported);
        let finished = queries_commands::finish_command(
            &self.pool,
            command_id,
            target,
            response_text.as_deref(),
            reason,
            now,
        )
        .await?;

        if !finished {
            // Lost the race to the timeout sweep or a concurrent acknowledgement
            let current = self.get_row(command_id).await?;
            if current.status == target {
                return Ok(current.into());
            }
            return Err(already(current.status));
        }

        let command = self.get(command_id).await?;
        let latency = command.sent_at.map(|sent| now - sent);
        tracing::info!(
            command = %command.id,
            device = %command.device_id,
            status = command.status.as_str(),
            latency_ms = latency.map(|l| l.num_milliseconds()),
            "Command acknowledged"
        );
        self.record_outcome(&command, target == CommandStatus::Acknowledged, latency)
            .await;
        let phase = match status {
            AckStatus::Acknowledged => Phase::Acknowledged,
            AckStatus::Failed => Phase::Failed,
        };
        self.apply_device_effect(&command, phase).await;
        self.emit(&command);
        Ok(command)
    }

    /// Guaranteed only while `Pending`. Once sent, a cancel notice is pushed if
    /// the device has a channel open, and the command may still complete.
    pub async fn cancel(&self, actor: &str, command_id: &str) -> FleetResult<CancelOutcome> {
        let mut row = self.get_row(command_id).await?;
        let now = self.clock.now();

        if row.status == CommandStatus::Pending {
            if queries_commands::cancel_command(&self.pool, command_id, now).await? {
                let command = self.get(command_id).await?;
                tracing::info!(command = %command_id, device = %command.device_id, "Command cancelled");
                self.audit_cancel(actor, &command, true, now);
                self.emit(&command);
                return Ok(CancelOutcome {
                    command,
                    cancelled: true,
                });
            }
            row = self.get_row(command_id).await?;
        }

        match row.status {
            CommandStatus::Sent => {
                let command = Command::from(row);
                let notice = PushMessage::Cancel {
                    command_id: command.id.clone(),
                };
                let delivery = self
                    .channels
                    .route(&command.device_id)
                    .await
                    .deliver(&command.device_id, notice);
                tracing::info!(
                    command = %command.id,
                    pushed = delivery == Delivery::Pushed,
                    "Cancel requested for a command already sent"
                );
                self.audit_cancel(actor, &command, false, now);
                Ok(CancelOutcome {
                    command,
                    cancelled: false,
                })
            }
            CommandStatus::Cancelled => Ok(CancelOutcome {
                command: row.into(),
                cancelled: true,
            }),
            current => Err(already(current)),
        }
    }

    /// Fail `Sent` commands past the delivery deadline, and `Pending` ones
    /// that need a live device and never reached it in that time. Re-push
    /// those that have waited longer than the redelivery interval, and push
    /// `Pending` commands whose device has a channel open with room in it.
    pub async fn sweep(&self) -> FleetResult<CommandSweep> {
        let now = self.clock.now();
        let deadline = self.config.delivery_timeout();
        let redeliver_after = self.config.redelivery_interval();
        let mut report = CommandSweep::default();

        for row in queries_commands::list_commands_with_status(&self.pool, CommandStatus::Pending).await? {
            let command = Command::from(row.clone());
            if command.kind.requires_connection() && now - row.issued_at >= deadline {
                match self.expire_undelivered(&row.id, now).await {
                    Ok(true) => report.timed_out += 1,
                    Ok(false) => {}
                    Err(e) => {
                        tracing::warn!(command = %row.id, error = %e, "Failed to expire undelivered command");
                        report.errors += 1;
                    }
                }
                continue;
            }
            if !self.channels.is_connected(&row.device_id).await {
                continue;
            }
            match self.push(&command).await {
                Ok(Delivery::Pushed) => report.delivered += 1,
                Ok(Delivery::Deferred) => {}
                Err(e) => {
                    tracing::warn!(command = %row.id, error = %e, "Push of pending command failed");
                    report.errors += 1;
                }
            }
        }

        for row in queries_commands::list_commands_with_status(&self.pool, CommandStatus::Sent).await? {
            let sent_at = row.sent_at.unwrap_or(row.issued_at);
            if now - sent_at >= deadline {
                match self.expire(&row.id, now).await {
                    Ok(true) => report.timed_out += 1,
                    Ok(false) => {}
                    Err(e) => {
                        tracing::warn!(command = %row.id, error = %e, "Failed to expire command");
                        report.errors += 1;
                    }
                }
                continue;
            }

            let last = row.last_delivered_at.unwrap_or(sent_at);
            if now - last >= redeliver_after {
                match self.push(&Command::from(row.clone())).await {
                    Ok(Delivery::Pushed) => report.redelivered += 1,
                    Ok(Delivery::Deferred) => {}
                    Err(e) => {
                        tracing::warn!(command = %row.id, error = %e, "Redelivery failed");
                        report.errors += 1;
                    }
                }
            }
        }
        Ok(report)
    }

    async fn expire(&self, command_id: &str, now: DateTime<Utc>) -> FleetResult<bool> {
        let finished = queries_commands::finish_command(
            &self.pool,
            command_id,
            CommandStatus::Failed,
            None,
            Some(FailureReason::Timeout),
            now,
        )
        .await?;
        if !finished {
            return Ok(false);
        }

        let command = self.get(command_id).await?;
        tracing::warn!(
            command = %command.id,
            device = %command.device_id,
            kind = command.kind.type_name(),
            "Command timed out without acknowledgement"
        );
        self.record_outcome(&command, false, None).await;
        self.apply_device_effect(&command, Phase::Failed).await;
        self.emit(&command);
        Ok(true)
    }

    async fn expire_undelivered(&self, command_id: &str, now: DateTime<Utc>) -> FleetResult<bool> {
        if !queries_commands::expire_undelivered(&self.pool, command_id, now).await? {
            return Ok(false);
        }
        let command = self.get(command_id).await?;
        tracing::warn!(
            command = %command.id,
            device = %command.device_id,
            kind = command.kind.type_name(),
            "Command never reached its device before the deadline"
        );
        self.record_outcome(&command, false, None).await;
        self.emit(&command);
        Ok(true)
    }

    /// Push over the device's channel if one is open. Pull delivery is bookkept
    /// when the device polls instead.
    async fn push(&self, command: &Command) -> FleetResult<Delivery> {
        let route = self.channels.route(&command.device_id).await;
        let message = PushMessage::Command {
            command: command.clone(),
        };
        let delivery = route.deliver(&command.device_id, message);
        if delivery == Delivery::Pushed {
            self.mark_delivered(command).await?;
        }
        Ok(delivery)
    }

    async fn mark_delivered(&self, command: &Command) -> FleetResult<()> {
        let now = self.clock.now();
        match command.status {
            CommandStatus::Pending => {
                if queries_commands::mark_sent(&self.pool, &command.id, now).await? {
                    self.on_sent(command).await;
                }
            }
            CommandStatus::Sent => {
                queries_commands::record_redelivery(&self.pool, &command.id, now).await?;
                tracing::debug!(command = %command.id, "Command redelivered");
            }
            _ => {}
        }
        Ok(())
    }

    async fn on_sent(&self, command: &Command) {
        if let Err(e) = self.telemetry.record_sent(&command.device_id).await {
            tracing::warn!(device = %command.device_id, error = %e, "Failed to count sent command");
        }
        self.apply_device_effect(command, Phase::Sent).await;
        let mut sent = command.clone();
        sent.status = CommandStatus::Sent;
        self.emit(&sent);
    }

    async fn record_outcome(&self, command: &Command, success: bool, latency: Option<chrono::Duration>) {
        if let Err(e) = self
            .telemetry
            .record_outcome(&command.device_id, success, latency)
            .await
        {
            tracing::warn!(device = %command.device_id, error = %e, "Failed to update telemetry");
        }
    }

    /// Transient device states and stored settings that follow from a command.
    /// State moves only while the device is live; an operator-held or offline
    /// state is never overwritten.
    async fn apply_device_effect(&self, command: &Command, phase: Phase) {
        let kind = &command.kind;
        let result = self
            .registry
            .update_with(&command.device_id, |d| {
                let live = d.state.is_live();
                let before = (d.state, d.volume, d.brightness, d.software_version.clone());
                match (phase, kind) {
                    (Phase::Sent, CommandKind::UpdateSoftware(_)) if live => {
                        d.state = DeviceState::Updating;
                    }
                    (Phase::Acknowledged, CommandKind::Play(_)) if live => {
                        d.state = DeviceState::Playing;
                    }
                    (Phase::Acknowledged, CommandKind::Stop | CommandKind::Pause)
                        if d.state == DeviceState::Playing =>
                    {
                        d.state = DeviceState::Connected;
                    }
                    (Phase::Acknowledged, CommandKind::UpdateSoftware(p)) => {
                        d.software_version = Some(p.version.clone());
                        if d.state == DeviceState::Updating {
                            d.state = DeviceState::Connected;
                        }
                    }
                    (Phase::Acknowledged, CommandKind::SetVolume(p)) => d.volume = p.level,
                    (Phase::Acknowledged, CommandKind::SetBrightness(p)) => d.brightness = p.level,
                    (Phase::Failed, CommandKind::UpdateSoftware(_))
                        if d.state == DeviceState::Updating =>
                    {
                        d.state = DeviceState::Connected;
                    }
                    _ => {}
                }
                Ok(before != (d.state, d.volume, d.brightness, d.software_version.clone()))
            })
            .await;

        if let Err(e) = result {
            tracing::warn!(
                device = %command.device_id,
                command = %command.id,
                error = %e,
                "Failed to apply command side effect"
            );
        }
    }

    async fn get_row(&self, command_id: &str) -> FleetResult<CommandRow> {
        queries_commands::get_command(&self.pool, command_id)
            .await?
            .ok_or_else(|| FleetError::not_found(format!("command {command_id}")))
    }

    fn audit_cancel(&self, actor: &str, command: &Command, cancelled: bool, at: DateTime<Utc>) {
        self.audit.record(AuditEvent {
            actor: actor.to_string(),
            action: AuditAction::CommandCancelled,
            device_id: Some(command.device_id.clone()),
            detail: serde_json::json!({ "command_id": command.id, "cancelled": cancelled }),
            at,
        });
    }

    fn emit(&self, command: &Command) {
        let _ = self.event_tx.send(WsEvent::CommandStatusChanged {
            command_id: command.id.clone(),
            device_id: command.device_id.clone(),
            kind: command.kind.type_name().to_string(),
            status: command.status,
        });
    }
}

fn already(status: CommandStatus) -> FleetError {
    FleetError::conflict(format!("command is already {}", status.as_str()))
}
