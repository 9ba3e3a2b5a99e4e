//! JSON messages exchanged with the glasses.
//!
//! Every message is an object tagged by `type`. Inbound messages are decoded
//! leniently: missing fields fall back to the same defaults the glasses
//! firmware assumes, unknown `type` values are rejected.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

use crate::types::{ProgressEvent, ProgressStage, ProgressStatus, UpdateComponent};

#[derive(Debug, Error)]
pub enum WireError {
    #[error("malformed message: {0}")]
    Json(#[from] serde_json::Error),
    #[error("message has no type field")]
    MissingType,
    #[error("unsupported message type: {0}")]
    UnknownType(String),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum GlassesMessage {
    OtaProgress(OtaProgressPayload),
    OtaUpdateAvailable(UpdateOffer),
    MtkUpdateComplete {
        #[serde(default = "default_mtk_message")]
        message: String,
        #[serde(default)]
        timestamp: i64,
    },
    SrAdota {
        #[serde(rename = "B")]
        body: BesOtaBody,
    },
    WifiScanResults {
        #[serde(default)]
        networks: Vec<String>,
    },
    VersionInfo(Map<String, Value>),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OtaProgressPayload {
    #[serde(default = "default_stage")]
    pub stage: ProgressStage,
    #[serde(default = "default_status")]
    pub status: ProgressStatus,
    #[serde(default)]
    pub progress: i32,
    #[serde(default)]
    pub bytes_downloaded: u64,
    #[serde(default)]
    pub total_bytes: u64,
    #[serde(default = "default_update")]
    pub current_update: UpdateComponent,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
}

impl OtaProgressPayload {
    pub fn to_event(&self) -> ProgressEvent {
        ProgressEvent {
            component: self.current_update,
            stage: self.stage,
            status: self.status,
            percent: clamp_percent(self.progress),
            error_message: self.error_message.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpdateOffer {
    #[serde(default)]
    pub version_code: i64,
    #[serde(default)]
    pub version_name: String,
    #[serde(default)]
    pub updates: Vec<UpdateComponent>,
    #[serde(default)]
    pub total_size: u64,
}

/// Progress report sent by the Bluetooth chip itself while it flashes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BesOtaBody {
    #[serde(rename = "type", default)]
    pub kind: String,
    #[serde(default)]
    pub progress: i32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

/// Converts raw Bluetooth chip reports into install-stage progress for `bes`.
///
/// Progress is snapped to the nearest 5% and repeated values are dropped so
/// the chip's chatty reporting does not flood the tracker.
#[derive(Debug, Clone, Default)]
pub struct BesProgressNormalizer {
    last_progress: Option<u8>,
}

impl BesProgressNormalizer {
    pub fn normalize(&mut self, body: &BesOtaBody) -> Option<ProgressEvent> {
        let rounded = (((body.progress.clamp(0, 100) + 2) / 5) * 5).min(100) as u8;
        let terminal = matches!(body.kind.as_str(), "success" | "error" | "fail");

        if self.last_progress == Some(rounded) && !terminal {
            return None;
        }
        self.last_progress = Some(rounded);

        let (status, percent, error_message) = match body.kind.as_str() {
            "update" => (ProgressStatus::Progress, rounded, None),
            "success" => {
                self.last_progress = None;
                (ProgressStatus::Finished, 100, None)
            }
            _ if body.progress >= 100 => {
                self.last_progress = None;
                (ProgressStatus::Finished, 100, None)
            }
            "error" | "fail" => {
                self.last_progress = None;
                let message = body
                    .message
                    .clone()
                    .unwrap_or_else(|| "BES update failed".to_string());
                (ProgressStatus::Failed, rounded, Some(message))
            }
            _ => (ProgressStatus::Progress, rounded, None),
        };

        Some(ProgressEvent {
            component: UpdateComponent::Bes,
            stage: ProgressStage::Install,
            status,
            percent,
            error_message,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PhoneCommand {
    OtaStart { timestamp: i64 },
    RequestVersionInfo { timestamp: i64 },
    RequestWifiScan { timestamp: i64 },
    SetWifiCredentials { ssid: String, password: String },
}

impl PhoneCommand {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::OtaStart { .. } => "ota_start",
            Self::RequestVersionInfo { .. } => "request_version_info",
            Self::RequestWifiScan { .. } => "request_wifi_scan",
            Self::SetWifiCredentials { .. } => "set_wifi_credentials",
        }
    }
}

const KNOWN_GLASSES_TYPES: [&str; 5] = [
    "ota_progress",
    "ota_update_available",
    "mtk_update_complete",
    "sr_adota",
    "wifi_scan_results",
];

pub fn decode_glasses_message(raw: &[u8]) -> Result<GlassesMessage, WireError> {
    let mut value: Value = serde_json::from_slice(raw)?;
    let kind = value
        .get("type")
        .and_then(Value::as_str)
        .ok_or(WireError::MissingType)?
        .to_string();

    // The glasses emit several flavours of version report (version_info_1, ...).
    if kind.starts_with("version_info") {
        if let Some(object) = value.as_object_mut() {
            object.insert("type".to_string(), Value::from("version_info"));
        }
    } else if !KNOWN_GLASSES_TYPES.contains(&kind.as_str()) {
        return Err(WireError::UnknownType(kind));
    }

    Ok(serde_json::from_value(value)?)
}

pub fn decode_phone_command(raw: &[u8]) -> Result<PhoneCommand, WireError> {
    Ok(serde_json::from_slice(raw)?)
}

fn clamp_percent(progress: i32) -> u8 {
    progress.clamp(0, 100) as u8
}

fn default_stage() -> ProgressStage {
    ProgressStage::Download
}

fn default_status() -> ProgressStatus {
    ProgressStatus::Progress
}

fn default_update() -> UpdateComponent {
    UpdateComponent::Apk
}

fn default_mtk_message() -> String {
    "MTK firmware updated. Please restart glasses.".to_string()
}
