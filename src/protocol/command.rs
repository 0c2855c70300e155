//! Session command wire model
//!
//! Commands travel as one JSON object per message on the command topic:
//! `{type, time, pld, issue_at}`. The `type` discriminator maps onto a
//! closed set of variants; anything else fails decoding with a typed
//! error. Empty `reset`/`halt` payloads serialize as `null`, not `{}`.

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use super::error::ProtocolError;
use super::time::EpochMillis;

/// Wi-Fi credentials pushed to a gear
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WifiCredentials {
    pub ssid: String,
    pub security: String,
    pub password: String,
}

/// Firmware upgrade descriptor
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct OtaUpgrade {
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub version: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub image_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub image_md5: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub data_file_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub data_file_md5: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub components: Option<Vec<OtaComponent>>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OtaComponent {
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub version: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub image_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub image_md5: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub data_file_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub data_file_md5: Option<String>,
}

/// A control command addressed to one gear
#[derive(Debug, Clone, PartialEq)]
pub enum SessionCommand {
    /// Begin or stop expecting downlink audio
    Streaming(bool),
    /// Factory reset, optionally unpairing first
    Reset { unpair: bool },
    SetVolume(i32),
    SetBrightness(i32),
    SetLightMode(String),
    SetWifi(WifiCredentials),
    /// Forget a stored network by SSID
    DeleteWifi(String),
    OtaUpgrade(OtaUpgrade),
    /// Raise or drop a call
    Raise { call: bool },
    Halt {
        sleep: bool,
        shutdown: bool,
        interrupt: bool,
    },
}

impl SessionCommand {
    /// Wire discriminator for this variant
    pub fn kind(&self) -> &'static str {
        match self {
            SessionCommand::Streaming(_) => "streaming",
            SessionCommand::Reset { .. } => "reset",
            SessionCommand::SetVolume(_) => "set_volume",
            SessionCommand::SetBrightness(_) => "set_brightness",
            SessionCommand::SetLightMode(_) => "set_light_mode",
            SessionCommand::SetWifi(_) => "set_wifi",
            SessionCommand::DeleteWifi(_) => "delete_wifi",
            SessionCommand::OtaUpgrade(_) => "ota_upgrade",
            SessionCommand::Raise { .. } => "raise",
            SessionCommand::Halt { .. } => "halt",
        }
    }

    /// Payload value for the envelope's `pld` field
    fn payload(&self) -> Value {
        match self {
            SessionCommand::Streaming(on) => Value::Bool(*on),
            SessionCommand::Reset { unpair: false } => Value::Null,
            SessionCommand::Reset { unpair: true } => json!({ "unpair": true }),
            SessionCommand::SetVolume(v) => json!(v),
            SessionCommand::SetBrightness(v) => json!(v),
            SessionCommand::SetLightMode(mode) => Value::String(mode.clone()),
            SessionCommand::SetWifi(creds) => {
                serde_json::to_value(creds).expect("wifi credentials serialize")
            }
            SessionCommand::DeleteWifi(ssid) => Value::String(ssid.clone()),
            SessionCommand::OtaUpgrade(ota) => {
                serde_json::to_value(ota).expect("ota descriptor serialize")
            }
            SessionCommand::Raise { call } => json!({ "call": call }),
            SessionCommand::Halt {
                sleep,
                shutdown,
                interrupt,
            } => {
                if !sleep && !shutdown && !interrupt {
                    Value::Null
                } else {
                    let mut obj = serde_json::Map::new();
                    if *sleep {
                        obj.insert("sleep".into(), Value::Bool(true));
                    }
                    if *shutdown {
                        obj.insert("shutdown".into(), Value::Bool(true));
                    }
                    if *interrupt {
                        obj.insert("interrupt".into(), Value::Bool(true));
                    }
                    Value::Object(obj)
                }
            }
        }
    }

    /// Decode a variant from its discriminator and payload
    fn decode(kind: &str, pld: Value) -> Result<Self, ProtocolError> {
        #[derive(Deserialize, Default)]
        struct ResetPayload {
            #[serde(default)]
            unpair: bool,
        }
        #[derive(Deserialize, Default)]
        struct HaltPayload {
            #[serde(default)]
            sleep: bool,
            #[serde(default)]
            shutdown: bool,
            #[serde(default)]
            interrupt: bool,
        }
        #[derive(Deserialize)]
        struct RaisePayload {
            call: bool,
        }

        let cmd = match kind {
            "streaming" => SessionCommand::Streaming(serde_json::from_value(pld)?),
            "reset" => {
                let p: ResetPayload = match pld {
                    Value::Null => ResetPayload::default(),
                    other => serde_json::from_value(other)?,
                };
                SessionCommand::Reset { unpair: p.unpair }
            }
            "set_volume" => SessionCommand::SetVolume(serde_json::from_value(pld)?),
            "set_brightness" => SessionCommand::SetBrightness(serde_json::from_value(pld)?),
            "set_light_mode" => SessionCommand::SetLightMode(serde_json::from_value(pld)?),
            "set_wifi" => SessionCommand::SetWifi(serde_json::from_value(pld)?),
            "delete_wifi" => SessionCommand::DeleteWifi(serde_json::from_value(pld)?),
            "ota_upgrade" => SessionCommand::OtaUpgrade(serde_json::from_value(pld)?),
            "raise" => {
                let p: RaisePayload = serde_json::from_value(pld)?;
                SessionCommand::Raise { call: p.call }
            }
            "halt" => {
                let p: HaltPayload = match pld {
                    Value::Null => HaltPayload::default(),
                    other => serde_json::from_value(other)?,
                };
                SessionCommand::Halt {
                    sleep: p.sleep,
                    shutdown: p.shutdown,
                    interrupt: p.interrupt,
                }
            }
            other => return Err(ProtocolError::InvalidCommandType(other.to_string())),
        };
        Ok(cmd)
    }
}

/// Envelope as it appears on the wire
#[derive(Serialize, Deserialize)]
struct RawCommandEvent {
    #[serde(rename = "type")]
    kind: String,
    time: EpochMillis,
    pld: Value,
    issue_at: EpochMillis,
}

/// A command with its creation and transmission timestamps
///
/// `time` is stamped when the command is built; `issue_at` when it leaves
/// the server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(into = "RawCommandEvent", try_from = "RawCommandEvent")]
pub struct SessionCommandEvent {
    pub command: SessionCommand,
    pub time: EpochMillis,
    pub issue_at: EpochMillis,
}

impl SessionCommandEvent {
    /// Wrap a command stamped with the current time
    pub fn now(command: SessionCommand) -> Self {
        Self {
            command,
            time: EpochMillis::now(),
            issue_at: EpochMillis::ZERO,
        }
    }
}

impl From<SessionCommandEvent> for RawCommandEvent {
    fn from(event: SessionCommandEvent) -> Self {
        RawCommandEvent {
            kind: event.command.kind().to_string(),
            time: event.time,
            pld: event.command.payload(),
            issue_at: event.issue_at,
        }
    }
}

impl TryFrom<RawCommandEvent> for SessionCommandEvent {
    type Error = ProtocolError;

    fn try_from(raw: RawCommandEvent) -> Result<Self, Self::Error> {
        Ok(Self {
            command: SessionCommand::decode(&raw.kind, raw.pld)?,
            time: raw.time,
            issue_at: raw.issue_at,
        })
    }
}
