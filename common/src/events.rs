use crate::{
    topics::{
        LINK_OFFLINE, LINK_ONLINE, TOPIC_GLASSES_LINK, TOPIC_GLASSES_WIFI, WIFI_CONNECTED,
        WIFI_DISCONNECTED,
    },
    types::{LinkState, ProgressEvent},
    wire::{BesProgressNormalizer, GlassesMessage, UpdateOffer},
};

/// Everything the hardware bridge can tell an update session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BridgeEvent {
    Progress(ProgressEvent),
    MtkUpdateComplete { message: String },
    UpdatesAvailable(UpdateOffer),
    HardwareLink(LinkState),
    NetworkLink(LinkState),
    WifiScanResults(Vec<String>),
}

/// Turns decoded glasses messages into bridge events.
///
/// Holds the Bluetooth chip normalizer, so one decoder must be kept per
/// glasses connection.
#[derive(Debug, Clone, Default)]
pub struct BridgeDecoder {
    bes: BesProgressNormalizer,
}

impl BridgeDecoder {
    pub fn translate(&mut self, message: GlassesMessage) -> Option<BridgeEvent> {
        match message {
            GlassesMessage::OtaProgress(payload) => Some(BridgeEvent::Progress(payload.to_event())),
            GlassesMessage::OtaUpdateAvailable(offer) => Some(BridgeEvent::UpdatesAvailable(offer)),
            GlassesMessage::MtkUpdateComplete { message, .. } => {
                Some(BridgeEvent::MtkUpdateComplete { message })
            }
            GlassesMessage::SrAdota { body } => self.bes.normalize(&body).map(BridgeEvent::Progress),
            GlassesMessage::WifiScanResults { networks } => {
                Some(BridgeEvent::WifiScanResults(networks))
            }
            GlassesMessage::VersionInfo(_) => None,
        }
    }

    /// Resets per-connection state after the glasses drop off the link.
    pub fn reset(&mut self) {
        self.bes = BesProgressNormalizer::default();
    }
}

/// Maps a retained link status message to a link event.
pub fn link_event(topic: &str, payload: &str) -> Option<BridgeEvent> {
    let value = payload.trim().to_ascii_lowercase();
    match topic {
        TOPIC_GLASSES_LINK => match value.as_str() {
            LINK_ONLINE => Some(BridgeEvent::HardwareLink(LinkState::Up)),
            LINK_OFFLINE => Some(BridgeEvent::HardwareLink(LinkState::Down)),
            _ => None,
        },
        TOPIC_GLASSES_WIFI => match value.as_str() {
            WIFI_CONNECTED => Some(BridgeEvent::NetworkLink(LinkState::Up)),
            WIFI_DISCONNECTED => Some(BridgeEvent::NetworkLink(LinkState::Down)),
            _ => None,
        },
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        types::{ProgressStage, ProgressStatus, UpdateComponent},
        wire::BesOtaBody,
    };

    #[test]
    fn link_payloads_map_to_events() {
        assert_eq!(
            link_event(TOPIC_GLASSES_LINK, "offline"),
            Some(BridgeEvent::HardwareLink(LinkState::Down))
        );
        assert_eq!(
            link_event(TOPIC_GLASSES_WIFI, " Connected "),
            Some(BridgeEvent::NetworkLink(LinkState::Up))
        );
        assert_eq!(link_event(TOPIC_GLASSES_LINK, "maybe"), None);
        assert_eq!(link_event("other/topic", "online"), None);
    }

    #[test]
    fn bes_chip_reports_become_install_progress() {
        let mut decoder = BridgeDecoder::default();
        let event = decoder.translate(GlassesMessage::SrAdota {
            body: BesOtaBody {
                kind: "update".to_string(),
                progress: 48,
                message: None,
            },
        });

        assert_eq!(
            event,
            Some(BridgeEvent::Progress(ProgressEvent {
                component: UpdateComponent::Bes,
                stage: ProgressStage::Install,
                status: ProgressStatus::Progress,
                percent: 50,
                error_message: None,
            }))
        );
    }

    #[test]
    fn reset_forgets_last_bes_progress() {
        let mut decoder = BridgeDecoder::default();
        let report = || GlassesMessage::SrAdota {
            body: BesOtaBody {
                kind: "update".to_string(),
                progress: 20,
                message: None,
            },
        };

        assert!(decoder.translate(report()).is_some());
        assert!(decoder.translate(report()).is_none());
        decoder.reset();
        assert!(decoder.translate(report()).is_some());
    }
}
