mod clock;
mod command;
mod config;
mod device;
mod dispatcher;
mod health;
mod mqtt;
mod registry;
mod state;
mod store;
mod web;

use anyhow::{Context, Result};
use rumqttc::{AsyncClient, Event, EventLoop, MqttOptions, Packet, QoS};
use std::{env, path::Path, sync::Arc, time::Duration};
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use clock::{SharedClock, SystemClock};
use command::{MqttCommandChannel, SharedChannel, SimulatedCommandChannel};
use config::{CommandConfig, StoreConfig};
use dispatcher::Dispatcher;
use health::HealthMonitor;
use mqtt::{extract_telemetry_device_id, handle_telemetry, TELEMETRY_FILTER};
use registry::{DeviceRegistry, SharedRegistry};
use state::{HubState, SharedState};
use store::{MemoryStore, SharedStore, SqliteStore};

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
    let config_path = env::var("CONFIG_PATH").unwrap_or_else(|_| "config.toml".to_string());

    // ── Config file ─────────────────────────────────────────────────
    let mut cfg = if Path::new(&config_path).exists() {
        config::load(&config_path)?
    } else {
        warn!(path = %config_path, "config file not found, using defaults");
        config::Config::default()
    };
    if let Ok(url) = env::var("DB_URL") {
        cfg.store = StoreConfig::Sqlite { url };
    }

    let cancel = CancellationToken::new();

    // ── Store ───────────────────────────────────────────────────────
    let (store, watch): (SharedStore, Option<JoinHandle<()>>) = match &cfg.store {
        StoreConfig::Sqlite { url } => {
            let db = SqliteStore::connect(url)
                .await
                .with_context(|| format!("failed to open device store: {url}"))?;
            db.migrate().await.context("device store migration failed")?;
            // Started before the initial load so no outside write is missed.
            let watch = db
                .watch(cfg.hub.store_poll_interval(), cancel.clone())
                .await
                .context("failed to start device store watch")?;
            info!(url = %url, "using sqlite device store");
            let store: SharedStore = Arc::new(db);
            (store, Some(watch))
        }
        StoreConfig::Memory => {
            info!("using in-memory device store");
            let store: SharedStore = Arc::new(MemoryStore::new());
            (store, None)
        }
    };

    // ── Registry ────────────────────────────────────────────────────
    let clock: SharedClock = Arc::new(SystemClock);
    let registry: SharedRegistry = Arc::new(DeviceRegistry::new(store, clock.clone()));

    // Subscribe before the initial load so no write is missed in between.
    let sync = registry.spawn_sync(cancel.clone());

    let loaded = registry.load().await.context("failed to load devices")?;
    let seeded = config::seed(&cfg, &registry).await?;
    info!(loaded, seeded, "registry ready");

    // ── Shared state (ephemeral, for the API) ───────────────────────
    let shared: SharedState = Arc::new(RwLock::new(HubState::new()));
    shared
        .write()
        .await
        .record_system(format!("hub started ({loaded} loaded, {seeded} seeded)"));

    // ── Command channel + MQTT ──────────────────────────────────────
    let (channel, mqtt): (SharedChannel, Option<(AsyncClient, EventLoop)>) = match cfg.commands {
        CommandConfig::Mqtt => {
            let mut mqttoptions = MqttOptions::new(cfg.hub.mqtt_client_id.clone(), broker, port);
            mqttoptions.set_keep_alive(Duration::from_secs(30));
            let (client, eventloop) = AsyncClient::new(mqttoptions, 20);
            let channel: SharedChannel = Arc::new(MqttCommandChannel::new(
                client.clone(),
                cfg.hub.command_timeout(),
            ));
            (channel, Some((client, eventloop)))
        }
        CommandConfig::Simulated => {
            info!("simulated command channel; telemetry ingest disabled");
            let channel: SharedChannel = Arc::new(SimulatedCommandChannel);
            (channel, None)
        }
    };

    let dispatcher = Dispatcher::new(registry.clone(), channel, clock);

    // ── Background tasks ────────────────────────────────────────────
    let monitor = HealthMonitor::new(registry.clone(), shared.clone(), cfg.hub.health_options());
    let health = tokio::spawn(monitor.run(cancel.clone()));

    let app = web::AppState {
        registry: registry.clone(),
        dispatcher,
        shared: shared.clone(),
    };
    let web_cancel = cancel.clone();
    let web = tokio::spawn(async move {
        if let Err(e) = web::serve(app, web_port, web_cancel.clone()).await {
            error!("http api failed: {e:#}");
            web_cancel.cancel();
        }
    });

    let signal_cancel = cancel.clone();
    tokio::spawn(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("failed to listen for ctrl-c: {e}");
        }
        info!("shutdown requested");
        signal_cancel.cancel();
    });

    // ── MQTT event loop (runs until shutdown) ───────────────────────
    match mqtt {
        Some((client, eventloop)) => {
            run_mqtt(client, eventloop, &registry, &shared, &cancel).await;
        }
        None => cancel.cancelled().await,
    }

    let _ = tokio::join!(sync, health, web);
    if let Some(watch) = watch {
        let _ = watch.await;
    }
    info!("hub stopped");
    Ok(())
}

async fn run_mqtt(
    client: AsyncClient,
    mut eventloop: EventLoop,
    registry: &SharedRegistry,
    shared: &SharedState,
    cancel: &CancellationToken,
) {
    loop {
        let event = tokio::select! {
            _ = cancel.cancelled() => break,
            event = eventloop.poll() => event,
        };

        match event {
            Ok(Event::Incoming(Packet::Publish(p))) => {
                if let Some(device_id) = extract_telemetry_device_id(&p.topic) {
                    handle_telemetry(registry, shared, device_id, &p.payload).await;
                } else {
                    warn!(topic = %p.topic, "unhandled topic");
                }
            }
            Ok(Event::Incoming(Packet::ConnAck(_))) => {
                info!("mqtt connected");
                // Clean sessions drop subscriptions, so renew on every connect.
                if let Err(e) = client.try_subscribe(TELEMETRY_FILTER, QoS::AtLeastOnce) {
                    error!("failed to subscribe to {TELEMETRY_FILTER}: {e}");
                }
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
                warn!("mqtt error: {e}. reconnecting...");
                let mut st = shared.write().await;
                st.mqtt_connected = false;
                st.record_error(format!("mqtt error: {e}"));
                drop(st);

                sleep(Duration::from_secs(2)).await;
            }
        }
    }

    if let Err(e) = client.try_disconnect() {
        warn!("mqtt disconnect failed: {e}");
    }
}
