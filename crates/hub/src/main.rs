mod config;
mod mqtt;
mod scheduler;
mod state;
mod valve;
mod web;

use anyhow::{anyhow, Result};
use chrono_tz::Tz;
use irrigation_planner::{IrrigationPlanner, Plan};
use rumqttc::{AsyncClient, Event, MqttOptions, Packet, QoS};
use std::{env, path::Path, sync::Arc, time::Duration};
use tokio::sync::{Notify, RwLock};
use tokio::time::sleep;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use config::SettingsManager;
use mqtt::{handle_config_message, is_config_topic, CONFIG_TOPIC};
use state::SystemState;
use valve::ValveBoard;

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
    let web_port: u16 = env::var("WEB_PORT")
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(8080);
    let config_path = env::var("CONFIG_PATH").unwrap_or_else(|_| "irrigation.json".to_string());
    let tz_name = env::var("IRRIGATION_TZ").unwrap_or_else(|_| "UTC".to_string());
    let tz: Tz = tz_name
        .parse()
        .map_err(|e| anyhow!("invalid IRRIGATION_TZ '{tz_name}': {e}"))?;

    // ── Settings + planner ──────────────────────────────────────────
    let settings = SettingsManager::new();
    if Path::new(&config_path).exists() {
        settings.load(&config_path)?;
    } else {
        warn!(path = %config_path, "no irrigation config file, waiting for {CONFIG_TOPIC}");
    }

    let planner = Arc::new(IrrigationPlanner::new(settings, tz));

    // The hook runs under the plan guard; it only wakes the scheduler.
    let wake = Arc::new(Notify::new());
    let hook_wake = Arc::clone(&wake);
    planner
        .register_update_hook(move |plan: &Plan| {
            info!(
                start_events = plan.live_start_events(),
                "irrigation plan updated"
            );
            hook_wake.notify_one();
        })
        .await?;
    planner.on_config_updated().await?;

    // ── Valve board ─────────────────────────────────────────────────
    let channel_pins = valve::parse_channel_pins(&env::var("CHANNEL_PINS").unwrap_or_default())?;
    if channel_pins.is_empty() {
        warn!("CHANNEL_PINS is empty, no channel is wired");
    }
    // Many common relay boards are active-low. If yours is active-high, set false.
    let active_low = env::var("RELAY_ACTIVE_LOW")
        .ok()
        .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
        .unwrap_or(true);

    let mut board = ValveBoard::new(&channel_pins, active_low)?;
    board.all_off();

    // ── Shared state (ephemeral, for the status API) ────────────────
    let shared = Arc::new(RwLock::new(SystemState::new(&channel_pins)));
    shared
        .write()
        .await
        .record_system("hub started".to_string());

    // ── Web server ──────────────────────────────────────────────────
    let web_state = Arc::clone(&shared);
    tokio::spawn(async move {
        if let Err(e) = web::serve(web_state, web_port).await {
            error!("{e:#}");
        }
    });

    // ── MQTT ────────────────────────────────────────────────────────
    let mut mqttoptions = MqttOptions::new("irrigation-hub", broker, port);
    mqttoptions.set_keep_alive(Duration::from_secs(30));
    mqttoptions.set_max_packet_size(64 * 1024, 64 * 1024);

    let (client, mut eventloop) = AsyncClient::new(mqttoptions, 20);
    client.subscribe(CONFIG_TOPIC, QoS::AtLeastOnce).await?;
    info!("hub subscribed to {CONFIG_TOPIC}");

    // ── Scheduler ───────────────────────────────────────────────────
    tokio::spawn(scheduler::run(
        Arc::clone(&planner),
        board,
        Arc::clone(&shared),
        client.clone(),
        Arc::clone(&wake),
        tz,
    ));

    loop {
        match eventloop.poll().await {
            Ok(Event::Incoming(Packet::Publish(p))) => {
                if is_config_topic(&p.topic) {
                    info!(bytes = p.payload.len(), "irrigation config received");
                    handle_config_message(&planner, &shared, &p.payload).await;
                } else {
                    warn!(topic = %p.topic, "unhandled topic");
                }
            }
            Ok(Event::Incoming(Packet::ConnAck(_))) => {
                info!("mqtt connected");
                let mut st = shared.write().await;
                st.mqtt_connected = true;
                st.record_system("mqtt connected".to_string());
            }
            Ok(Event::Incoming(Packet::Disconnect)) => {
                warn!("mqtt disconnected");
                let mut st = shared.write().await;
                st.mqtt_connected = false;
                st.record_system("mqtt disconnected".to_string());
            }
            Ok(_) => {}
            Err(e) => {
                error!("mqtt error: {e}. reconnecting...");
                let mut st = shared.write().await;
                st.mqtt_connected = false;
                st.record_error(format!("mqtt error: {e}"));
                drop(st);

                sleep(Duration::from_secs(2)).await;
            }
        }
    }
}
