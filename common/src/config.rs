use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct TrackerConfig {
    pub retry_interval_ms: u64,
    pub max_retries: u8,
    pub progress_watchdog_ms: u64,
    pub system_install_watchdog_ms: u64,
    pub transition_watchdog_ms: u64,
    pub restart_watchdog_ms: u64,
    pub percent_step: u8,
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            retry_interval_ms: 5_000,
            max_retries: 3,
            progress_watchdog_ms: 120_000,
            system_install_watchdog_ms: 900_000,
            transition_watchdog_ms: 60_000,
            restart_watchdog_ms: 180_000,
            percent_step: 5,
        }
    }
}

impl TrackerConfig {
    pub fn sanitize(&mut self) {
        self.retry_interval_ms = self.retry_interval_ms.clamp(1_000, 60_000);
        self.max_retries = self.max_retries.clamp(1, 10);
        self.progress_watchdog_ms = self.progress_watchdog_ms.clamp(10_000, 600_000);
        self.system_install_watchdog_ms = self
            .system_install_watchdog_ms
            .clamp(self.progress_watchdog_ms, 3_600_000);
        self.transition_watchdog_ms = self.transition_watchdog_ms.clamp(5_000, 600_000);
        self.restart_watchdog_ms = self.restart_watchdog_ms.clamp(30_000, 900_000);
        self.percent_step = self.percent_step.clamp(1, 25);
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkConfig {
    pub mqtt_host: String,
    pub mqtt_port: u16,
    pub mqtt_user: String,
    pub mqtt_pass: String,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            mqtt_host: "127.0.0.1".to_string(),
            mqtt_port: 1883,
            mqtt_user: String::new(),
            mqtt_pass: String::new(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct WifiCredentials {
    pub ssid: String,
    pub password: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RuntimeConfig {
    pub tracker: TrackerConfig,
    pub network: NetworkConfig,
    #[serde(default)]
    pub wifi: WifiCredentials,
}

impl RuntimeConfig {
    pub fn sanitize(&mut self) {
        self.tracker.sanitize();
        if self.network.mqtt_port == 0 {
            self.network.mqtt_port = 1883;
        }
        self.wifi.ssid = self.wifi.ssid.trim().to_string();
    }
}
