pub const TOPIC_GLASSES_TX: &str = "glasses/ota/tx";
pub const TOPIC_GLASSES_RX: &str = "glasses/ota/rx";

pub const TOPIC_GLASSES_LINK: &str = "glasses/link/status";
pub const TOPIC_GLASSES_WIFI: &str = "glasses/wifi/status";

pub const TOPIC_PHONE_OTA_STATE: &str = "phone/ota/state";

pub const LINK_ONLINE: &str = "online";
pub const LINK_OFFLINE: &str = "offline";
pub const WIFI_CONNECTED: &str = "connected";
pub const WIFI_DISCONNECTED: &str = "disconnected";
