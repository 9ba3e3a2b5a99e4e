use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UpdateComponent {
    Apk,
    Mtk,
    Bes,
}

impl UpdateComponent {
    /// Order the glasses apply updates in when several are pending.
    pub const UPDATE_ORDER: [UpdateComponent; 3] = [Self::Apk, Self::Mtk, Self::Bes];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Apk => "apk",
            Self::Mtk => "mtk",
            Self::Bes => "bes",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "apk" => Some(Self::Apk),
            "mtk" => Some(Self::Mtk),
            "bes" => Some(Self::Bes),
            _ => None,
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            Self::Apk => "Software",
            Self::Mtk => "System firmware",
            Self::Bes => "Bluetooth firmware",
        }
    }

    /// System firmware streams straight into the installer, so every report is shown as installing.
    pub fn always_installing(self) -> bool {
        matches!(self, Self::Mtk)
    }

    pub fn reports_install_progress(self) -> bool {
        !matches!(self, Self::Apk)
    }

    /// The glasses power-cycle after applying this component.
    pub fn restarts_device(self) -> bool {
        matches!(self, Self::Bes)
    }
}

/// Parses a comma separated list such as `apk,mtk`, skipping unknown and repeated entries.
pub fn parse_sequence(raw: &str) -> Vec<UpdateComponent> {
    let mut sequence = Vec::new();
    for component in raw.split(',').filter_map(UpdateComponent::parse) {
        if !sequence.contains(&component) {
            sequence.push(component);
        }
    }
    sequence
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProgressStage {
    Download,
    Install,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ProgressStatus {
    Started,
    Progress,
    Finished,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProgressEvent {
    pub component: UpdateComponent,
    pub stage: ProgressStage,
    pub status: ProgressStatus,
    pub percent: u8,
    pub error_message: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LinkState {
    Up,
    Down,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Starting,
    Downloading,
    Installing,
    Transitioning,
    Restarting,
    Completed,
    Failed,
    Disconnected,
    WifiDisconnected,
}

impl SessionState {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Starting => "starting",
            Self::Downloading => "downloading",
            Self::Installing => "installing",
            Self::Transitioning => "transitioning",
            Self::Restarting => "restarting",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Disconnected => "disconnected",
            Self::WifiDisconnected => "wifi_disconnected",
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

/// Everything an update screen needs to render one frame.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TrackerStatus {
    pub state: Option<SessionState>,
    pub phase: String,
    pub component: Option<UpdateComponent>,
    pub component_label: Option<&'static str>,
    pub component_number: usize,
    pub component_total: usize,
    pub percent: u8,
    pub indeterminate: bool,
    pub message: String,
    pub error_message: Option<String>,
    pub attempts: u8,
}

impl TrackerStatus {
    /// View shown while no update session is mounted.
    pub fn idle() -> Self {
        Self {
            state: None,
            phase: "Idle".to_string(),
            component: None,
            component_label: None,
            component_number: 0,
            component_total: 0,
            percent: 0,
            indeterminate: false,
            message: "No update in progress".to_string(),
            error_message: None,
            attempts: 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_sequence_skips_unknown_and_duplicates() {
        assert_eq!(
            parse_sequence("apk, MTK,foo,apk,bes"),
            vec![
                UpdateComponent::Apk,
                UpdateComponent::Mtk,
                UpdateComponent::Bes
            ]
        );
        assert!(parse_sequence("").is_empty());
    }

    #[test]
    fn session_state_serializes_snake_case() {
        let raw = serde_json::to_string(&SessionState::WifiDisconnected).unwrap();
        assert_eq!(raw, "\"wifi_disconnected\"");
        assert_eq!(SessionState::WifiDisconnected.as_str(), "wifi_disconnected");
    }
}
