pub mod config;
pub mod events;
pub mod topics;
pub mod tracker;
pub mod types;
pub mod wire;

pub use config::{NetworkConfig, RuntimeConfig, TrackerConfig, WifiCredentials};
pub use events::{link_event, BridgeDecoder, BridgeEvent};
pub use topics::*;
pub use tracker::{display_percent, OtaTracker, TimerKind, TrackerAction};
pub use types::{
    parse_sequence, LinkState, ProgressEvent, ProgressStage, ProgressStatus, SessionState,
    TrackerStatus, UpdateComponent,
};
pub use wire::{
    decode_glasses_message, decode_phone_command, GlassesMessage, PhoneCommand, UpdateOffer,
    WireError,
};
