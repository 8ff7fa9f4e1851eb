mod sim;

use anyhow::{bail, Result};
use rumqttc::{AsyncClient, Event, EventLoop, MqttOptions, Packet, QoS};
use serde::{Deserialize, Serialize};
use std::{env, time::Duration};
use time::OffsetDateTime;
use tokio::sync::mpsc;
use tokio::time::sleep;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use sim::{FieldReading, FieldSim, Scenario};

// ---------------------------------------------------------------------------
// Wire types
// ---------------------------------------------------------------------------

/// Published to `tele/<device_id>/state`.
#[derive(Debug, Serialize)]
struct StateMsg {
    ts: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    status: Option<&'static str>,
    sensor: FieldReading,
}

/// Received on `cmd/<device_id>`.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CommandMsg {
    device_id: String,
    command: String,
    #[serde(default)]
    params: serde_json::Value,
}

fn now_unix() -> i64 {
    OffsetDateTime::now_utc().unix_timestamp()
}

fn state_topic(device_id: &str) -> String {
    format!("tele/{device_id}/state")
}

fn command_topic(device_id: &str) -> String {
    format!("cmd/{device_id}")
}

/// Split a comma list of device ids, dropping blanks.
fn parse_device_ids(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

// ---------------------------------------------------------------------------
// Entry point
// ---------------------------------------------------------------------------

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    // Env config
    let broker = env::var("MQTT_HOST").unwrap_or_else(|_| "127.0.0.1".to_string());
    let port: u16 = env::var("MQTT_PORT")
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(1883);
    let node_id = env::var("NODE_ID").unwrap_or_else(|_| "node-a".to_string());
    let device_ids = parse_device_ids(&env::var("SENSOR_IDS").unwrap_or_default());
    let sample_every_s: u64 = env::var("SAMPLE_EVERY_S")
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(60);
    let scenario = Scenario::from_str_lossy(&env::var("SIM_SCENARIO").unwrap_or_default());
    let day_period_s: f64 = env::var("SIM_DAY_PERIOD_S")
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(600.0);

    if device_ids.is_empty() {
        bail!("SENSOR_IDS is empty; set it to the hub-assigned sensor device ids");
    }

    let mut sim = FieldSim::new(scenario, device_ids.len(), day_period_s);
    info!(
        node = %node_id,
        devices = sim.device_count(),
        %scenario,
        sample_every_s,
        "simulated node starting"
    );

    let mut mqttoptions = MqttOptions::new(format!("farm-node-{node_id}"), broker, port);
    mqttoptions.set_keep_alive(Duration::from_secs(30));
    let (client, eventloop) = AsyncClient::new(mqttoptions, 10);

    // Device indexes that asked for an immediate reading.
    let (read_tx, mut read_rx) = mpsc::channel::<usize>(16);
    tokio::spawn(run_eventloop(
        eventloop,
        client.clone(),
        device_ids.clone(),
        read_tx,
    ));

    let mut ticker = tokio::time::interval(Duration::from_secs(sample_every_s.max(1)));
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                for index in 0..device_ids.len() {
                    publish_state(&client, &mut sim, &device_ids, index).await;
                }
            }
            Some(index) = read_rx.recv() => {
                publish_state(&client, &mut sim, &device_ids, index).await;
            }
        }
    }
}

async fn publish_state(client: &AsyncClient, sim: &mut FieldSim, device_ids: &[String], index: usize) {
    let device_id = &device_ids[index];
    let ts = now_unix();
    let msg = StateMsg {
        ts,
        status: sim.fault().then_some("error"),
        sensor: sim.sample(index, ts as f64),
    };

    let payload = match serde_json::to_vec(&msg) {
        Ok(p) => p,
        Err(e) => {
            warn!(device = %device_id, "failed to encode state: {e}");
            return;
        }
    };

    match client
        .publish(state_topic(device_id), QoS::AtLeastOnce, false, payload)
        .await
    {
        Ok(()) => info!(
            device = %device_id,
            ts,
            temperature = msg.sensor.temperature,
            soil_moisture = msg.sensor.soil_moisture,
            fault = msg.status.is_some(),
            "published state"
        ),
        Err(e) => warn!(device = %device_id, "publish error: {e}"),
    }
}

/// Queue an immediate reading without waiting. Polling must keep running
/// while the sampler is blocked on a publish, so a full queue drops the
/// request. Returns false once the sampler is gone.
fn request_reading(read_tx: &mpsc::Sender<usize>, index: usize, device_id: &str) -> bool {
    match read_tx.try_send(index) {
        Ok(()) => true,
        Err(mpsc::error::TrySendError::Full(_)) => {
            warn!(device = %device_id, "reading queue full; dropping readSensors");
            true
        }
        Err(mpsc::error::TrySendError::Closed(_)) => false,
    }
}

/// Drive the MQTT connection; forward `readSensors` requests to the sampler.
async fn run_eventloop(
    mut eventloop: EventLoop,
    client: AsyncClient,
    device_ids: Vec<String>,
    read_tx: mpsc::Sender<usize>,
) {
    loop {
        match eventloop.poll().await {
            Ok(Event::Incoming(Packet::ConnAck(_))) => {
                info!("node connected to mqtt");
                for id in &device_ids {
                    if let Err(e) = client.try_subscribe(command_topic(id), QoS::AtLeastOnce) {
                        warn!(device = %id, "subscribe failed: {e}");
                    }
                }
            }
            Ok(Event::Incoming(Packet::Publish(p))) => {
                let cmd = match serde_json::from_slice::<CommandMsg>(&p.payload) {
                    Ok(cmd) => cmd,
                    Err(e) => {
                        warn!(topic = %p.topic, "bad command json: {e}");
                        continue;
                    }
                };
                info!(device = %cmd.device_id, command = %cmd.command, params = %cmd.params, "command received");

                if cmd.command == "readSensors" {
                    if let Some(index) = device_ids.iter().position(|id| *id == cmd.device_id) {
                        if !request_reading(&read_tx, index, &cmd.device_id) {
                            return;
                        }
                    }
                }
            }
            Ok(_) => {}
            Err(e) => {
                warn!("mqtt error: {e}. retrying...");
                sleep(Duration::from_secs(2)).await;
            }
        }
    }
}

// ===========================================================================
// Tests
// ===========================================================================
