use std::time::Duration;

use anyhow::Context;
use chrono::Utc;
use rumqttc::{AsyncClient, Event, Incoming, LastWill, MqttOptions, QoS};
use serde_json::{Map, Value};
use tokio::{sync::mpsc, task::JoinHandle};
use tracing::{debug, info, warn};

use ota_common::{
    decode_phone_command, parse_sequence, GlassesMessage, PhoneCommand, UpdateComponent,
    UpdateOffer, LINK_OFFLINE, LINK_ONLINE, TOPIC_GLASSES_LINK, TOPIC_GLASSES_RX,
    TOPIC_GLASSES_TX, TOPIC_GLASSES_WIFI, WIFI_CONNECTED,
};

use crate::script::{update_script, Step};

const VERSION_NAME: &str = "2.3.0-sim";
const REBOOT_DURATION: Duration = Duration::from_secs(3);

pub async fn run() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let mqtt_host = std::env::var("MQTT_HOST").unwrap_or_else(|_| "127.0.0.1".to_string());
    let mqtt_port = std::env::var("MQTT_PORT")
        .ok()
        .and_then(|value| value.parse::<u16>().ok())
        .unwrap_or(1883);

    let updates = std::env::var("GLASSES_UPDATES")
        .map(|raw| parse_sequence(&raw))
        .unwrap_or_else(|_| UpdateComponent::UPDATE_ORDER.to_vec());
    let fail_at = std::env::var("GLASSES_FAIL_AT")
        .ok()
        .and_then(|raw| UpdateComponent::parse(raw.trim()));

    let mut mqtt_options = MqttOptions::new("ota-glasses-rust", mqtt_host, mqtt_port);
    mqtt_options.set_last_will(LastWill::new(
        TOPIC_GLASSES_LINK,
        LINK_OFFLINE,
        QoS::AtLeastOnce,
        true,
    ));

    if let Ok(user) = std::env::var("MQTT_USER") {
        let pass = std::env::var("MQTT_PASS").unwrap_or_default();
        mqtt_options.set_credentials(user, pass);
    }

    let (mqtt, mut eventloop) = AsyncClient::new(mqtt_options, 64);
    let (command_tx, mut command_rx) = mpsc::unbounded_channel::<PhoneCommand>();

    mqtt.subscribe(TOPIC_GLASSES_RX, QoS::AtLeastOnce)
        .await
        .context("failed to subscribe to phone commands")?;

    tokio::spawn(async move {
        loop {
            match eventloop.poll().await {
                Ok(Event::Incoming(Incoming::Publish(message))) => {
                    match decode_phone_command(&message.payload) {
                        Ok(command) => {
                            if command_tx.send(command).is_err() {
                                debug!("command loop closed; dropping phone command");
                            }
                        }
                        Err(err) => debug!("ignoring phone message: {err}"),
                    }
                }
                Ok(Event::Incoming(Incoming::ConnAck(_))) => info!("glasses mqtt connected"),
                Ok(_) => {}
                Err(err) => {
                    warn!("glasses mqtt poll error: {err}");
                    tokio::time::sleep(Duration::from_secs(2)).await;
                }
            }
        }
    });

    publish_raw(&mqtt, TOPIC_GLASSES_LINK, true, LINK_ONLINE).await?;
    publish_raw(&mqtt, TOPIC_GLASSES_WIFI, true, WIFI_CONNECTED).await?;
    publish(&mqtt, &offer(&updates)).await?;
    info!(
        "glasses simulator offering [{}]",
        updates
            .iter()
            .map(|component| component.as_str())
            .collect::<Vec<_>>()
            .join(", ")
    );

    let mut running: Option<JoinHandle<()>> = None;
    while let Some(command) = command_rx.recv().await {
        info!("phone command: {}", command.kind());
        match command {
            PhoneCommand::OtaStart { .. } => {
                if running.as_ref().is_some_and(|task| !task.is_finished()) {
                    debug!("update already running; ignoring repeated start");
                    continue;
                }
                let steps = update_script(&updates, fail_at);
                running = Some(tokio::spawn(play(mqtt.clone(), steps)));
            }
            PhoneCommand::RequestVersionInfo { .. } => {
                publish(&mqtt, &version_info(&updates)).await?;
                publish(&mqtt, &offer(&updates)).await?;
            }
            PhoneCommand::RequestWifiScan { .. } => {
                let networks = ["lab-2g", "lab-5g", "guest"]
                    .into_iter()
                    .map(str::to_string)
                    .collect();
                publish(&mqtt, &GlassesMessage::WifiScanResults { networks }).await?;
            }
            PhoneCommand::SetWifiCredentials { ssid, .. } => {
                info!("joining wifi network {ssid}");
                publish_raw(&mqtt, TOPIC_GLASSES_WIFI, true, WIFI_CONNECTED).await?;
            }
        }
    }

    Ok(())
}

async fn play(mqtt: AsyncClient, steps: Vec<Step>) {
    for step in steps {
        let result = match step {
            Step::Send(message) => publish(&mqtt, &message).await,
            Step::Pause(duration) => {
                tokio::time::sleep(duration).await;
                Ok(())
            }
            Step::Reboot => reboot(&mqtt).await,
        };
        if let Err(err) = result {
            warn!("update playback aborted: {err:#}");
            return;
        }
    }
    info!("update playback finished");
}

async fn reboot(mqtt: &AsyncClient) -> anyhow::Result<()> {
    info!("simulating restart");
    publish_raw(mqtt, TOPIC_GLASSES_LINK, true, LINK_OFFLINE).await?;
    tokio::time::sleep(REBOOT_DURATION).await;
    publish_raw(mqtt, TOPIC_GLASSES_LINK, true, LINK_ONLINE).await?;
    publish_raw(mqtt, TOPIC_GLASSES_WIFI, true, WIFI_CONNECTED).await
}

async fn publish(mqtt: &AsyncClient, message: &GlassesMessage) -> anyhow::Result<()> {
    let body = serde_json::to_vec(message)?;
    mqtt.publish(TOPIC_GLASSES_TX, QoS::AtLeastOnce, false, body)
        .await
        .context("failed to publish glasses message")
}

async fn publish_raw(
    mqtt: &AsyncClient,
    topic: &str,
    retain: bool,
    payload: &str,
) -> anyhow::Result<()> {
    mqtt.publish(topic, QoS::AtLeastOnce, retain, payload)
        .await
        .with_context(|| format!("failed to publish {topic}"))
}

fn offer(updates: &[UpdateComponent]) -> GlassesMessage {
    GlassesMessage::OtaUpdateAvailable(UpdateOffer {
        version_code: 230,
        version_name: VERSION_NAME.to_string(),
        updates: updates.to_vec(),
        total_size: 96 * 1024 * 1024,
    })
}

fn version_info(pending: &[UpdateComponent]) -> GlassesMessage {
    let mut info = Map::new();
    info.insert("version_name".to_string(), Value::from(VERSION_NAME));
    info.insert(
        "pending".to_string(),
        Value::from(
            pending
                .iter()
                .map(|component| component.as_str())
                .collect::<Vec<_>>(),
        ),
    );
    info.insert(
        "timestamp".to_string(),
        Value::from(Utc::now().timestamp_millis()),
    );
    GlassesMessage::VersionInfo(info)
}
