mod actuator;
mod config;
mod decision;
mod error;
mod events;
mod irrigation;
mod mqtt;
mod reconciler;
mod sensors;
mod state;
mod web;

use anyhow::Result;
use rumqttc::{AsyncClient, Event, MqttOptions, Packet, QoS};
use std::{env, sync::Arc, time::Duration};
use time::OffsetDateTime;
use tokio::time::sleep;
use tracing::{debug, error, info, warn};
use tracing_subscriber::EnvFilter;

use actuator::HttpActuator;
use mqtt::{extract_node_id, parse_sensor_payload, SENSOR_TOPIC_FILTER};
use reconciler::{Reconciler, ReconcilerConfig};
use state::AppState;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    // ── Env config ──────────────────────────────────────────────────
    let broker = env::var("MQTT_HOST").unwrap_or_else(|_| "127.0.0.1".to_string());
    let port: u16 = env::var("MQTT_PORT")
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(1883);

    // ── Config file (thresholds, durations, device) ─────────────────
    let config_path = env::var("CONFIG_PATH").unwrap_or_else(|_| "config.toml".to_string());
    let cfg = config::load(&config_path)?;
    info!(
        mode = ?cfg.mode,
        zone = %cfg.zone,
        max_duration_min = cfg.irrigation.max_duration_minutes,
        "config loaded"
    );

    // ── Shared state ────────────────────────────────────────────────
    let state = AppState::new(&cfg);

    // DEVICE_URL wins over the config file; either may be absent until the
    // controller registers itself over HTTP.
    let endpoint = env::var("DEVICE_URL").ok().or_else(|| cfg.device.endpoint.clone());
    match endpoint {
        Some(url) => {
            state.registry.register(&url).await?;
        }
        None => warn!("no pump controller endpoint configured, waiting for registration"),
    }

    // ── Reconciler ──────────────────────────────────────────────────
    let actuator = HttpActuator::new(state.registry.clone(), cfg.device.command_timeout())?;
    let reconciler = Reconciler::new(
        Arc::new(actuator),
        state.irrigation.clone(),
        state.sensors.clone(),
        state.health.clone(),
        ReconcilerConfig::from(&cfg.device),
    );
    tokio::spawn(reconciler.run());

    // ── Web server ──────────────────────────────────────────────────
    let web_state = state.clone();
    tokio::spawn(async move {
        if let Err(e) = web::serve(web_state).await {
            error!("web server stopped: {e:#}");
        }
    });

    // ── MQTT ────────────────────────────────────────────────────────
    let mut mqttoptions = MqttOptions::new("pump-hub", broker, port);
    mqttoptions.set_keep_alive(Duration::from_secs(30));

    let (client, mut eventloop) = AsyncClient::new(mqttoptions, 20);
    client.subscribe(SENSOR_TOPIC_FILTER, QoS::AtLeastOnce).await?;
    info!(topic = SENSOR_TOPIC_FILTER, "hub subscribed");

    loop {
        match eventloop.poll().await {
            Ok(Event::Incoming(Packet::Publish(p))) => {
                let Some(node_id) = extract_node_id(&p.topic) else {
                    debug!(topic = %p.topic, "unhandled topic");
                    continue;
                };
                let update = match parse_sensor_payload(&p.payload) {
                    Ok(update) => update,
                    Err(e) => {
                        warn!(node = node_id, "bad telemetry: {e}");
                        continue;
                    }
                };
                match state.ingest(&update, OffsetDateTime::now_utc()).await {
                    Ok(out) => {
                        debug!(
                            node = node_id,
                            moisture = out.snapshot.soil_moisture,
                            should_irrigate = out.recommendation.should_irrigate,
                            "telemetry ingested"
                        );
                        if let Some(session) = out.started {
                            info!(session = %session.id, node = node_id, "automatic irrigation requested");
                        }
                    }
                    Err(e) => warn!(node = node_id, "telemetry rejected: {e}"),
                }
            }
            Ok(Event::Incoming(Packet::ConnAck(_))) => {
                info!("mqtt connected");
                state.set_mqtt_connected(true);
            }
            Ok(Event::Incoming(Packet::Disconnect)) => {
                warn!("mqtt disconnected");
                state.set_mqtt_connected(false);
            }
            Ok(_) => {}
            Err(e) => {
                // The reconciler keeps bounding any running session.
                warn!("mqtt error: {e}. reconnecting...");
                state.set_mqtt_connected(false);
                sleep(Duration::from_secs(2)).await;
            }
        }
    }
}
