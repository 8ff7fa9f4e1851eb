//! TOML config file loading, validation, and demo-device seeding.

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::collections::HashSet;
use std::time::Duration;
use tracing::info;

use crate::device::{DevicePayload, DeviceSpec};
use crate::health::HealthOptions;
use crate::registry::SharedRegistry;

pub const DEFAULT_DB_URL: &str = "sqlite:farm-hub.db?mode=rwc";

// ---------------------------------------------------------------------------
// Config file structures
// ---------------------------------------------------------------------------

#[derive(Debug, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub hub: HubSettings,
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub commands: CommandConfig,
    /// Registered at startup when the registry is empty.
    #[serde(default)]
    pub devices: Vec<DeviceSpec>,
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct HubSettings {
    pub health_interval_secs: u64,
    pub offline_timeout_secs: u64,
    pub command_timeout_ms: u64,
    pub mqtt_client_id: String,
    /// How often the sqlite store polls for writes from other processes.
    pub store_poll_ms: u64,
}

impl Default for HubSettings {
    fn default() -> Self {
        Self {
            health_interval_secs: 30,
            offline_timeout_secs: 60,
            command_timeout_ms: 5000,
            mqtt_client_id: "farm-hub".to_string(),
            store_poll_ms: 1000,
        }
    }
}

impl HubSettings {
    pub fn health_options(&self) -> HealthOptions {
        HealthOptions {
            interval: Duration::from_secs(self.health_interval_secs),
            timeout: time::Duration::seconds(self.offline_timeout_secs as i64),
        }
    }

    pub fn command_timeout(&self) -> Duration {
        Duration::from_millis(self.command_timeout_ms)
    }

    pub fn store_poll_interval(&self) -> Duration {
        Duration::from_millis(self.store_poll_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum StoreConfig {
    Sqlite { url: String },
    Memory,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self::Sqlite {
            url: DEFAULT_DB_URL.to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum CommandConfig {
    #[default]
    Mqtt,
    Simulated,
}

// ---------------------------------------------------------------------------
// Validation
// ---------------------------------------------------------------------------

/// Upper bound on `offline_timeout_secs`: one day.
const MAX_TIMEOUT_SECS: u64 = 86_400;

impl Config {
    /// Validate all config entries. Returns `Ok(())` or an error describing
    /// every violation found (not just the first one).
    pub fn validate(&self) -> Result<()> {
        let mut errors: Vec<String> = Vec::new();

        self.validate_hub(&mut errors);
        self.validate_store(&mut errors);
        self.validate_devices(&mut errors);

        if errors.is_empty() {
            Ok(())
        } else {
            bail!(
                "config validation failed ({} error{}):\n  - {}",
                errors.len(),
                if errors.len() == 1 { "" } else { "s" },
                errors.join("\n  - ")
            );
        }
    }

    fn validate_hub(&self, errors: &mut Vec<String>) {
        let h = &self.hub;

        if h.health_interval_secs == 0 {
            errors.push("hub: health_interval_secs must be positive".to_string());
        }
        if h.offline_timeout_secs == 0 {
            errors.push("hub: offline_timeout_secs must be positive".to_string());
        } else if h.offline_timeout_secs > MAX_TIMEOUT_SECS {
            errors.push(format!(
                "hub: offline_timeout_secs {} exceeds {MAX_TIMEOUT_SECS}",
                h.offline_timeout_secs
            ));
        }
        // The timeout must span at least one scan.
        if h.health_interval_secs > 0
            && h.offline_timeout_secs > 0
            && h.offline_timeout_secs < h.health_interval_secs
        {
            errors.push(format!(
                "hub: offline_timeout_secs ({}) is shorter than health_interval_secs ({})",
                h.offline_timeout_secs, h.health_interval_secs
            ));
        }
        if h.command_timeout_ms == 0 {
            errors.push("hub: command_timeout_ms must be positive".to_string());
        }
        if h.store_poll_ms == 0 {
            errors.push("hub: store_poll_ms must be positive".to_string());
        }
        if h.mqtt_client_id.trim().is_empty() {
            errors.push("hub: mqtt_client_id is empty".to_string());
        }
    }

    fn validate_store(&self, errors: &mut Vec<String>) {
        if let StoreConfig::Sqlite { url } = &self.store {
            if !url.starts_with("sqlite:") {
                errors.push(format!("store: url '{url}' must start with 'sqlite:'"));
            }
        }
    }

    fn validate_devices(&self, errors: &mut Vec<String>) {
        let mut seen_names: HashSet<&str> = HashSet::new();

        for (i, d) in self.devices.iter().enumerate() {
            let ctx = || {
                if d.name.trim().is_empty() {
                    format!("devices[{i}]")
                } else {
                    format!("device '{}'", d.name)
                }
            };

            // ── Identity ────────────────────────────────────────
            if d.name.trim().is_empty() {
                errors.push(format!("{}: name is empty", ctx()));
            } else if !seen_names.insert(&d.name) {
                errors.push(format!("{}: duplicate name", ctx()));
            }
            if d.location.trim().is_empty() {
                errors.push(format!("{}: location is empty", ctx()));
            }

            // ── Payload ─────────────────────────────────────────
            match &d.payload {
                DevicePayload::Camera(c) => {
                    if c.stream_url.trim().is_empty() {
                        errors.push(format!("{}: streamUrl is empty", ctx()));
                    }
                }
                DevicePayload::Irrigation(irr) => {
                    if irr.flow_rate < 0.0 {
                        errors.push(format!(
                            "{}: flowRate must not be negative, got {}",
                            ctx(),
                            irr.flow_rate
                        ));
                    }
                    if irr.schedule.enabled && irr.schedule.duration == 0 {
                        errors.push(format!(
                            "{}: schedule is enabled but duration is 0",
                            ctx()
                        ));
                    }
                    for t in &irr.schedule.times {
                        if !is_time_of_day(t) {
                            errors.push(format!(
                                "{}: schedule time '{t}' is not HH:MM",
                                ctx()
                            ));
                        }
                    }
                }
                DevicePayload::Sensor(_) => {}
                DevicePayload::Valve(v) => {
                    if !(0.0..=100.0).contains(&v.open_percentage) {
                        errors.push(format!(
                            "{}: openPercentage {} out of range [0, 100]",
                            ctx(),
                            v.open_percentage
                        ));
                    } else if v.is_open != (v.open_percentage > 0.0) {
                        errors.push(format!(
                            "{}: isOpen {} disagrees with openPercentage {}",
                            ctx(),
                            v.is_open,
                            v.open_percentage
                        ));
                    }
                }
            }
        }
    }
}

/// `HH:MM`, 24-hour clock.
fn is_time_of_day(s: &str) -> bool {
    let Some((h, m)) = s.split_once(':') else {
        return false;
    };
    if h.len() != 2 || m.len() != 2 {
        return false;
    }
    matches!(
        (h.parse::<u8>(), m.parse::<u8>()),
        (Ok(h), Ok(m)) if h < 24 && m < 60
    )
}

// ---------------------------------------------------------------------------
// Load + seed
// ---------------------------------------------------------------------------

/// Read, parse, and validate a TOML config file.
pub fn load(path: &str) -> Result<Config> {
    let contents =
        std::fs::read_to_string(path).with_context(|| format!("failed to read config: {path}"))?;
    parse(&contents).with_context(|| format!("invalid config: {path}"))
}

/// Parse and validate config text.
pub fn parse(contents: &str) -> Result<Config> {
    let config: Config = toml::from_str(contents).context("failed to parse config")?;
    config.validate()?;
    Ok(config)
}

/// Register the configured demo devices if the registry holds none.
/// Returns how many were registered.
pub async fn seed(config: &Config, registry: &SharedRegistry) -> Result<usize> {
    if config.devices.is_empty() || !registry.list().await.is_empty() {
        return Ok(0);
    }

    for spec in &config.devices {
        registry
            .register(spec.clone())
            .await
            .with_context(|| format!("failed to seed device '{}'", spec.name))?;
    }

    info!(devices = config.devices.len(), "demo devices seeded");
    Ok(config.devices.len())
}

// ===========================================================================
// Tests
// ===========================================================================
