use chrono::{DateTime, Utc};
use serde::{ser::SerializeStruct, Deserialize, Serialize, Serializer};
use serde_json::Value;

use crate::db::models::{CommandRow, CommandStatus, FailureReason};
use crate::error::{FleetError, FleetResult};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlayParams {
    #[serde(alias = "contentId")]
    pub content_id: i64,
    #[serde(default, alias = "loop")]
    pub loop_playback: bool,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct RebootParams {
    #[serde(default)]
    pub delay_secs: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UpdateParams {
    pub version: String,
    pub url: String,
    #[serde(default)]
    pub checksum: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncParams {
    #[serde(alias = "contentIds")]
    pub content_ids: Vec<i64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TestParams {
    #[serde(default = "default_test_duration")]
    pub duration_secs: u32,
}

fn default_test_duration() -> u32 {
    10
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LevelParams {
    pub level: i64,
}

/// Instruction for a device, one variant per command type with its own
/// parameter shape. Unknown type names are carried as `Custom` so newer
/// device firmware can be driven before the server learns the type.
#[derive(Debug, Clone, PartialEq)]
pub enum CommandKind {
    Play(PlayParams),
    Pause,
    Stop,
    Reboot(RebootParams),
    UpdateSoftware(UpdateParams),
    Sync(SyncParams),
    Reload,
    Test(TestParams),
    SetVolume(LevelParams),
    SetBrightness(LevelParams),
    Custom { name: String, payload: Value },
}

impl CommandKind {
    /// Parse and validate a `(type, params)` pair from the wire or the store.
    pub fn from_parts(type_name: &str, params: Value) -> FleetResult<Self> {
        let name = type_name.trim().to_ascii_lowercase();
        let kind = match name.as_str() {
            "play" => CommandKind::Play(parse(&name, params)?),
            "pause" => CommandKind::Pause,
            "stop" => CommandKind::Stop,
            "reboot" => CommandKind::Reboot(parse_or_default(&name, params)?),
            "update_software" => CommandKind::UpdateSoftware(parse(&name, params)?),
            "sync" => CommandKind::Sync(parse(&name, params)?),
            "reload" => CommandKind::Reload,
            "test" => CommandKind::Test(parse_or(&name, params, TestParams {
                duration_secs: default_test_duration(),
            })?),
            "set_volume" => CommandKind::SetVolume(parse(&name, params)?),
            "set_brightness" => CommandKind::SetBrightness(parse(&name, params)?),
            "" => return Err(FleetError::validation("command type must not be empty")),
            _ => {
                let valid = name.len() <= 64
                    && name
                        .chars()
                        .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-' || c == '.');
                if !valid {
                    return Err(FleetError::validation(format!("invalid command type: {type_name}")));
                }
                CommandKind::Custom {
                    name: name.clone(),
                    payload: params,
                }
            }
        };
        kind.validate()?;
        Ok(kind)
    }

    pub fn type_name(&self) -> &str {
        match self {
            CommandKind::Play(_) => "play",
            CommandKind::Pause => "pause",
            CommandKind::Stop => "stop",
            CommandKind::Reboot(_) => "reboot",
            CommandKind::UpdateSoftware(_) => "update_software",
            CommandKind::Sync(_) => "sync",
            CommandKind::Reload => "reload",
            CommandKind::Test(_) => "test",
            CommandKind::SetVolume(_) => "set_volume",
            CommandKind::SetBrightness(_) => "set_brightness",
            CommandKind::Custom { name, .. } => name.as_str(),
        }
    }

    pub fn params(&self) -> Value {
        let value = match self {
            CommandKind::Play(p) => serde_json::to_value(p),
            CommandKind::Reboot(p) => serde_json::to_value(p),
            CommandKind::UpdateSoftware(p) => serde_json::to_value(p),
            CommandKind::Sync(p) => serde_json::to_value(p),
            CommandKind::Test(p) => serde_json::to_value(p),
            CommandKind::SetVolume(p) | CommandKind::SetBrightness(p) => serde_json::to_value(p),
            CommandKind::Custom { payload, .. } => Ok(payload.clone()),
            CommandKind::Pause | CommandKind::Stop | CommandKind::Reload => Ok(Value::Null),
        };
        value.unwrap_or(Value::Null)
    }

    /// Whether the device must be online at submission. Everything else may
    /// wait in the queue until the device next polls or connects.
    pub fn requires_connection(&self) -> bool {
        !matches!(
            self,
            CommandKind::UpdateSoftware(_) | CommandKind::Sync(_) | CommandKind::Custom { .. }
        )
    }

    fn validate(&self) -> FleetResult<()> {
        match self {
            CommandKind::Play(p) if p.content_id <= 0 => {
                Err(FleetError::validation("play: content_id must be positive"))
            }
            CommandKind::Reboot(p) if p.delay_secs > 3600 => {
                Err(FleetError::validation("reboot: delay_secs must be at most 3600"))
            }
            CommandKind::UpdateSoftware(p) => {
                if p.version.trim().is_empty() {
                    return Err(FleetError::validation("update_software: version must not be empty"));
                }
                if !(p.url.starts_with("http://") || p.url.starts_with("https://")) {
                    return Err(FleetError::validation("update_software: url must be http(s)"));
                }
                Ok(())
            }
            CommandKind::Sync(p) if p.content_ids.is_empty() || p.content_ids.iter().any(|id| *id <= 0) => {
                Err(FleetError::validation("sync: content_ids must be a non-empty list of ids"))
            }
            CommandKind::Test(p) if !(1..=600).contains(&p.duration_secs) => {
                Err(FleetError::validation("test: duration_secs must be between 1 and 600"))
            }
            CommandKind::SetVolume(p) | CommandKind::SetBrightness(p) if !(0..=100).contains(&p.level) => {
                Err(FleetError::validation(format!(
                    "{}: level must be between 0 and 100",
                    self.type_name()
                )))
            }
            _ => Ok(()),
        }
    }
}

impl Serialize for CommandKind {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut s = serializer.serialize_struct("CommandKind", 2)?;
        s.serialize_field("type", self.type_name())?;
        s.serialize_field("params", &self.params())?;
        s.end()
    }
}

fn parse<T: serde::de::DeserializeOwned>(name: &str, params: Value) -> FleetResult<T> {
    serde_json::from_value(params)
        .map_err(|e| FleetError::validation(format!("{name}: invalid params: {e}")))
}

fn parse_or<T: serde::de::DeserializeOwned>(name: &str, params: Value, default: T) -> FleetResult<T> {
    if params.is_null() {
        return Ok(default);
    }
    parse(name, params)
}

fn parse_or_default<T: serde::de::DeserializeOwned + Default>(name: &str, params: Value) -> FleetResult<T> {
    parse_or(name, params, T::default())
}

/// Typed view of a stored command
#[derive(Debug, Clone, Serialize)]
pub struct Command {
    pub id: String,
    pub device_id: String,
    #[serde(flatten)]
    pub kind: CommandKind,
    pub status: CommandStatus,
    pub response: Option<Value>,
    pub failure_reason: Option<FailureReason>,
    pub issued_by: Option<String>,
    pub issued_at: DateTime<Utc>,
    pub sent_at: Option<DateTime<Utc>>,
    pub acknowledged_at: Option<DateTime<Utc>>,
    pub delivery_attempts: i64,
}

impl From<CommandRow> for Command {
    fn from(row: CommandRow) -> Self {
        let params: Value =
            serde_json::from_str(&row.payload).unwrap_or(Value::String(row.payload.clone()));
        // Rows written under older validation rules still load, as opaque commands
        let kind = CommandKind::from_parts(&row.kind, params.clone()).unwrap_or_else(|_| {
            CommandKind::Custom {
                name: row.kind.clone(),
                payload: params,
            }
        });
        let response = row
            .response
            .map(|raw| serde_json::from_str(&raw).unwrap_or(Value::String(raw)));
        Command {
            id: row.id,
            device_id: row.device_id,
            kind,
            status: row.status,
            response,
            failure_reason: row.failure_reason,
            issued_by: row.issued_by,
            issued_at: row.issued_at,
            sent_at: row.sent_at,
            acknowledged_at: row.acknowledged_at,
            delivery_attempts: row.delivery_attempts,
        }
    }
}
