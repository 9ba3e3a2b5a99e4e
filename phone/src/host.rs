use std::{
    collections::HashMap, io::ErrorKind, net::SocketAddr, path::PathBuf, sync::Arc,
    time::Duration,
};

use anyhow::Context;
use axum::{
    extract::{Query, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use chrono::Utc;
use rumqttc::{AsyncClient, Event, Incoming, MqttOptions, QoS};
use serde::{Deserialize, Serialize};
use tokio::{net::TcpListener, sync::Mutex};
use tracing::{debug, info, warn};

use ota_common::{
    decode_glasses_message, link_event, parse_sequence, BridgeDecoder, BridgeEvent,
    GlassesMessage, LinkState, PhoneCommand, RuntimeConfig, TrackerConfig, TrackerStatus,
    UpdateComponent, UpdateOffer, WifiCredentials, TOPIC_GLASSES_LINK, TOPIC_GLASSES_RX,
    TOPIC_GLASSES_TX, TOPIC_GLASSES_WIFI, TOPIC_PHONE_OTA_STATE,
};

use crate::session::{spawn_session, CommandBridge, SessionHandle, SessionMsg};

#[derive(Clone)]
struct AppState {
    session: Arc<Mutex<Option<SessionHandle>>>,
    status: Arc<Mutex<TrackerStatus>>,
    last_offer: Arc<Mutex<Option<UpdateOffer>>>,
    wifi_networks: Arc<Mutex<Vec<String>>>,
    tracker_config: TrackerConfig,
    mqtt: AsyncClient,
    store: AppStore,
}

#[derive(Clone)]
struct AppStore {
    runtime_path: Arc<PathBuf>,
    lock: Arc<Mutex<()>>,
}

/// Sends phone commands to the glasses over the MQTT bridge.
///
/// Uses the non-blocking publish path so the session task never waits on
/// the MQTT client's request queue.
#[derive(Clone)]
struct MqttBridge {
    mqtt: AsyncClient,
}

impl CommandBridge for MqttBridge {
    fn send_command(&self, command: PhoneCommand) -> anyhow::Result<()> {
        let kind = command.kind();
        let body = serde_json::to_vec(&command)?;
        self.mqtt
            .try_publish(TOPIC_GLASSES_RX, QoS::AtLeastOnce, false, body)
            .with_context(|| format!("failed to queue {kind} for the glasses"))
    }
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    error: String,
}

#[derive(Debug, Serialize)]
struct StartResponse {
    updates: Vec<UpdateComponent>,
}

#[derive(Debug, Serialize, PartialEq, Eq)]
struct WifiView {
    ssid: String,
    #[serde(rename = "passwordSet")]
    password_set: bool,
}

#[derive(Debug, Deserialize)]
struct WifiUpdate {
    ssid: String,
    #[serde(default)]
    password: Option<String>,
}

#[derive(Debug, Serialize)]
struct WifiUpdateResponse {
    forwarded: bool,
    wifi: WifiView,
}

#[derive(Debug, Serialize)]
struct WifiNetworksResponse {
    networks: Vec<String>,
}

const MAX_MQTT_PAYLOAD_BYTES: usize = 8 * 1024;

pub async fn run() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let store = AppStore::new();
    let mut runtime = store.load_runtime_config().await.unwrap_or_else(|err| {
        warn!("failed to load runtime config from store: {err:#}");
        RuntimeConfig::default()
    });
    runtime.sanitize();

    let mqtt_host = std::env::var("MQTT_HOST").unwrap_or(runtime.network.mqtt_host.clone());
    let mqtt_port = std::env::var("MQTT_PORT")
        .ok()
        .and_then(|value| value.parse::<u16>().ok())
        .unwrap_or(runtime.network.mqtt_port);

    let mut mqtt_options = MqttOptions::new("ota-phone-rust", mqtt_host, mqtt_port);
    let mqtt_user = std::env::var("MQTT_USER").unwrap_or(runtime.network.mqtt_user.clone());
    let mqtt_pass = std::env::var("MQTT_PASS").unwrap_or(runtime.network.mqtt_pass.clone());
    if !mqtt_user.is_empty() {
        mqtt_options.set_credentials(mqtt_user, mqtt_pass);
    }

    let (mqtt, eventloop) = AsyncClient::new(mqtt_options, 64);

    let app_state = AppState {
        session: Arc::new(Mutex::new(None)),
        status: Arc::new(Mutex::new(TrackerStatus::idle())),
        last_offer: Arc::new(Mutex::new(None)),
        wifi_networks: Arc::new(Mutex::new(Vec::new())),
        tracker_config: runtime.tracker.clone(),
        mqtt,
        store,
    };

    subscribe_topics(&app_state.mqtt).await?;
    spawn_mqtt_loop(app_state.clone(), eventloop);
    spawn_state_publish_loop(app_state.clone());

    let app = Router::new()
        .route("/api/ota/status", get(handle_get_status))
        .route("/api/ota/start", post(handle_start))
        .route("/api/ota/retry", post(handle_retry))
        .route("/api/ota/cancel", post(handle_cancel))
        .route("/api/wifi", get(handle_get_wifi).put(handle_put_wifi))
        .route("/api/wifi/scan", post(handle_wifi_scan))
        .route("/api/wifi/networks", get(handle_get_wifi_networks))
        .with_state(app_state);

    let port = std::env::var("PHONE_HTTP_PORT")
        .ok()
        .and_then(|value| value.parse::<u16>().ok())
        .unwrap_or(8080);
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind phone server at {addr}"))?;

    info!("phone listening on http://{addr}");
    axum::serve(listener, app).await?;
    Ok(())
}

async fn subscribe_topics(mqtt: &AsyncClient) -> anyhow::Result<()> {
    let topics = [TOPIC_GLASSES_TX, TOPIC_GLASSES_LINK, TOPIC_GLASSES_WIFI];

    for topic in topics {
        mqtt.subscribe(topic, QoS::AtLeastOnce).await?;
    }
    Ok(())
}

fn spawn_mqtt_loop(app_state: AppState, mut eventloop: rumqttc::EventLoop) {
    tokio::spawn(async move {
        let mut decoder = BridgeDecoder::default();
        loop {
            match eventloop.poll().await {
                Ok(Event::Incoming(Incoming::Publish(message))) => {
                    if let Err(err) = handle_mqtt_message(
                        &app_state,
                        &mut decoder,
                        &message.topic,
                        message.payload.to_vec(),
                    )
                    .await
                    {
                        warn!("mqtt message handling error: {err:#}");
                    }
                }
                Ok(Event::Incoming(Incoming::ConnAck(_))) => {
                    info!("mqtt connected");
                    let command = PhoneCommand::RequestVersionInfo {
                        timestamp: Utc::now().timestamp_millis(),
                    };
                    let bridge = MqttBridge {
                        mqtt: app_state.mqtt.clone(),
                    };
                    if let Err(err) = bridge.send_command(command) {
                        warn!("version info request failed: {err:#}");
                    }
                }
                Ok(_) => {}
                Err(err) => {
                    warn!("mqtt poll error: {err}");
                    tokio::time::sleep(Duration::from_secs(2)).await;
                }
            }
        }
    });
}

fn spawn_state_publish_loop(app_state: AppState) {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_secs(1));
        let mut last_published: Option<TrackerStatus> = None;
        loop {
            interval.tick().await;

            let status = app_state.status.lock().await.clone();
            if last_published.as_ref() == Some(&status) {
                continue;
            }

            match serde_json::to_vec(&status) {
                Ok(body) => {
                    if let Err(err) = app_state
                        .mqtt
                        .publish(TOPIC_PHONE_OTA_STATE, QoS::AtLeastOnce, true, body)
                        .await
                    {
                        warn!("ota state publish failed: {err}");
                        continue;
                    }
                    last_published = Some(status);
                }
                Err(err) => warn!("ota state serialization failed: {err}"),
            }
        }
    });
}

async fn handle_mqtt_message(
    app_state: &AppState,
    decoder: &mut BridgeDecoder,
    topic: &str,
    payload: Vec<u8>,
) -> anyhow::Result<()> {
    if payload.len() > MAX_MQTT_PAYLOAD_BYTES {
        warn!(
            "dropping oversized MQTT payload on topic {} ({} bytes)",
            topic,
            payload.len()
        );
        return Ok(());
    }

    let event = match topic {
        TOPIC_GLASSES_TX => {
            let message = match decode_glasses_message(&payload) {
                Ok(message) => message,
                Err(err) => {
                    debug!("ignoring glasses message: {err}");
                    return Ok(());
                }
            };
            if let GlassesMessage::VersionInfo(info) = &message {
                info!("glasses version info: {}", serde_json::Value::Object(info.clone()));
            }
            decoder.translate(message)
        }
        TOPIC_GLASSES_LINK | TOPIC_GLASSES_WIFI => {
            let message = String::from_utf8(payload).context("non utf8 mqtt payload")?;
            link_event(topic, &message)
        }
        _ => None,
    };

    let Some(event) = event else {
        return Ok(());
    };

    match &event {
        BridgeEvent::UpdatesAvailable(offer) => {
            info!(
                "glasses offered version {} ({} updates)",
                offer.version_name,
                offer.updates.len()
            );
            *app_state.last_offer.lock().await = Some(offer.clone());
        }
        BridgeEvent::WifiScanResults(networks) => {
            *app_state.wifi_networks.lock().await = networks.clone();
        }
        BridgeEvent::HardwareLink(LinkState::Down) => {
            info!("glasses link down");
            decoder.reset();
        }
        BridgeEvent::HardwareLink(LinkState::Up) => info!("glasses link up"),
        BridgeEvent::NetworkLink(link) => info!("glasses wifi {link:?}"),
        BridgeEvent::Progress(_) | BridgeEvent::MtkUpdateComplete { .. } => {}
    }

    if let Some(session) = app_state.session.lock().await.as_ref() {
        session.send(SessionMsg::Bridge(event));
    }
    Ok(())
}

async fn handle_get_status(State(state): State<AppState>) -> impl IntoResponse {
    let status = state.status.lock().await.clone();
    Json(status)
}

async fn handle_start(
    State(state): State<AppState>,
    Query(params): Query<HashMap<String, String>>,
) -> impl IntoResponse {
    let offer = state.last_offer.lock().await.clone();
    let sequence = match resolve_sequence(params.get("updates").map(String::as_str), offer.as_ref())
    {
        Ok(sequence) => sequence,
        Err(message) => return error_response(StatusCode::BAD_REQUEST, message),
    };

    let mut session = state.session.lock().await;
    if let Some(previous) = session.take() {
        if let Err(err) = previous.dispose().await {
            warn!("previous ota session ended abnormally: {err}");
        }
    }

    let bridge = MqttBridge {
        mqtt: state.mqtt.clone(),
    };
    *session = Some(spawn_session(
        state.tracker_config.clone(),
        sequence.clone(),
        bridge,
        state.status.clone(),
    ));

    (
        StatusCode::ACCEPTED,
        Json(StartResponse { updates: sequence }),
    )
        .into_response()
}

async fn handle_retry(State(state): State<AppState>) -> impl IntoResponse {
    let session = state.session.lock().await;
    let Some(session) = session.as_ref() else {
        return error_response(StatusCode::CONFLICT, "No update session to retry");
    };
    session.send(SessionMsg::Retry);
    StatusCode::ACCEPTED.into_response()
}

async fn handle_cancel(State(state): State<AppState>) -> impl IntoResponse {
    let previous = state.session.lock().await.take();
    if let Some(previous) = previous {
        if let Err(err) = previous.dispose().await {
            warn!("ota session ended abnormally: {err}");
        }
        info!("ota session cancelled");
    }
    *state.status.lock().await = TrackerStatus::idle();

    handle_get_status(State(state)).await.into_response()
}

async fn handle_get_wifi(State(state): State<AppState>) -> impl IntoResponse {
    let runtime = state
        .store
        .load_runtime_config()
        .await
        .unwrap_or_else(|err| {
            warn!("failed to load wifi settings from store: {err:#}");
            RuntimeConfig::default()
        });
    Json(build_wifi_view(&runtime.wifi))
}

async fn handle_put_wifi(
    State(state): State<AppState>,
    Json(update): Json<WifiUpdate>,
) -> impl IntoResponse {
    let ssid = update.ssid.trim();
    if ssid.is_empty() {
        return error_response(StatusCode::BAD_REQUEST, "ssid cannot be empty");
    }

    let mut runtime = state
        .store
        .load_runtime_config()
        .await
        .unwrap_or_else(|err| {
            warn!("failed to load existing runtime config for update: {err:#}");
            RuntimeConfig::default()
        });

    runtime.wifi.ssid = ssid.to_string();
    if let Some(password) = update.password {
        runtime.wifi.password = password;
    }

    if let Err(err) = state.store.save_runtime_config(&runtime).await {
        warn!("failed to persist wifi update: {err:#}");
        return error_response(
            StatusCode::INTERNAL_SERVER_ERROR,
            "Failed to persist wifi settings",
        );
    }

    let forwarded = match send_command(
        &state.mqtt,
        PhoneCommand::SetWifiCredentials {
            ssid: runtime.wifi.ssid.clone(),
            password: runtime.wifi.password.clone(),
        },
    )
    .await
    {
        Ok(()) => true,
        Err(err) => {
            warn!("failed to forward wifi credentials: {err:#}");
            false
        }
    };

    Json(WifiUpdateResponse {
        forwarded,
        wifi: build_wifi_view(&runtime.wifi),
    })
    .into_response()
}

async fn handle_wifi_scan(State(state): State<AppState>) -> impl IntoResponse {
    let command = PhoneCommand::RequestWifiScan {
        timestamp: Utc::now().timestamp_millis(),
    };
    if let Err(err) = send_command(&state.mqtt, command).await {
        warn!("wifi scan request failed: {err:#}");
        return error_response(StatusCode::BAD_GATEWAY, "Failed to reach the glasses");
    }
    StatusCode::ACCEPTED.into_response()
}

async fn handle_get_wifi_networks(State(state): State<AppState>) -> impl IntoResponse {
    let networks = state.wifi_networks.lock().await.clone();
    Json(WifiNetworksResponse { networks })
}

impl AppStore {
    fn new() -> Self {
        let data_dir = std::env::var("OTA_DATA_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("./.ota"));

        Self {
            runtime_path: Arc::new(data_dir.join("runtime.json")),
            lock: Arc::new(Mutex::new(())),
        }
    }

    async fn load_runtime_config(&self) -> anyhow::Result<RuntimeConfig> {
        let _guard = self.lock.lock().await;
        match tokio::fs::read(self.runtime_path.as_ref()).await {
            Ok(raw) => Ok(serde_json::from_slice::<RuntimeConfig>(&raw)?),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(RuntimeConfig::default()),
            Err(err) => Err(err.into()),
        }
    }

    async fn save_runtime_config(&self, runtime: &RuntimeConfig) -> anyhow::Result<()> {
        let _guard = self.lock.lock().await;
        let path = self.runtime_path.as_ref().clone();
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let payload = serde_json::to_vec_pretty(runtime)?;
        tokio::fs::write(path, payload).await?;
        Ok(())
    }
}

async fn send_command(mqtt: &AsyncClient, command: PhoneCommand) -> anyhow::Result<()> {
    let kind = command.kind();
    let body = serde_json::to_vec(&command)?;
    mqtt.publish(TOPIC_GLASSES_RX, QoS::AtLeastOnce, false, body)
        .await
        .with_context(|| format!("failed to publish {kind}"))
}

/// Picks the components to apply: an explicit `updates` list wins over the
/// glasses' last offer.
fn resolve_sequence(
    requested: Option<&str>,
    offer: Option<&UpdateOffer>,
) -> Result<Vec<UpdateComponent>, &'static str> {
    match (requested, offer) {
        (Some(raw), _) => {
            let sequence = parse_sequence(raw);
            if sequence.is_empty() {
                return Err("'updates' names no known components");
            }
            Ok(sequence)
        }
        (None, Some(offer)) => Ok(offer.updates.clone()),
        (None, None) => Err("No update offer from the glasses yet; pass 'updates'"),
    }
}

fn build_wifi_view(wifi: &WifiCredentials) -> WifiView {
    WifiView {
        ssid: wifi.ssid.clone(),
        password_set: !wifi.password.is_empty(),
    }
}

fn error_response(status: StatusCode, message: &str) -> axum::response::Response {
    (
        status,
        Json(ErrorBody {
            error: message.to_string(),
        }),
    )
        .into_response()
}

#[cfg(test)]
mod tests {
    use ota_common::UpdateComponent::{Apk, Bes, Mtk};

    use super::*;

    fn offer(updates: Vec<UpdateComponent>) -> UpdateOffer {
        UpdateOffer {
            version_code: 42,
            version_name: "1.4.2".to_string(),
            updates,
            total_size: 0,
        }
    }

    #[test]
    fn explicit_updates_override_the_offer() {
        let last = offer(vec![Apk, Mtk, Bes]);
        assert_eq!(resolve_sequence(Some("bes,apk"), Some(&last)), Ok(vec![Bes, Apk]));
    }

    #[test]
    fn offer_is_used_without_explicit_updates() {
        let last = offer(vec![Mtk, Bes]);
        assert_eq!(resolve_sequence(None, Some(&last)), Ok(vec![Mtk, Bes]));
    }

    #[test]
    fn unknown_or_missing_updates_are_rejected() {
        assert!(resolve_sequence(Some("firmware"), None).is_err());
        assert!(resolve_sequence(None, None).is_err());
    }

    #[test]
    fn wifi_view_masks_the_password() {
        let view = build_wifi_view(&WifiCredentials {
            ssid: "lab".to_string(),
            password: "hunter2".to_string(),
        });
        assert_eq!(
            view,
            WifiView {
                ssid: "lab".to_string(),
                password_set: true,
            }
        );

        let body = serde_json::to_value(&view).unwrap();
        assert_eq!(body["passwordSet"], true);
        assert!(body.get("password").is_none());
    }
}
