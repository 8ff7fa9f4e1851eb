use serde::Serialize;
use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;
use std::time::Instant;
use time::OffsetDateTime;
use tokio::sync::RwLock;

use crate::device::{Device, DeviceId, DeviceKind, DeviceStatus};

/// Maximum number of events retained in the activity log.
const MAX_EVENTS: usize = 200;

// ---------------------------------------------------------------------------
// Public type alias
// ---------------------------------------------------------------------------

pub type SharedState = Arc<RwLock<HubState>>;

// ---------------------------------------------------------------------------
// Core types
// ---------------------------------------------------------------------------

/// Hub-level runtime facts that do not belong to any single device.
pub struct HubState {
    pub started_at: Instant,
    pub mqtt_connected: bool,
    pub events: VecDeque<HubEvent>,
}

#[derive(Debug, Clone, Serialize)]
pub struct HubEvent {
    #[serde(with = "time::serde::rfc3339")]
    pub ts: OffsetDateTime,
    pub kind: EventKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub device_id: Option<DeviceId>,
    pub detail: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum EventKind {
    Registered,
    Command,
    Telemetry,
    Offline,
    Error,
    System,
}

// ---------------------------------------------------------------------------
// JSON response (what the API returns)
// ---------------------------------------------------------------------------

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusResponse {
    pub uptime_secs: u64,
    pub mqtt_connected: bool,
    pub device_count: usize,
    pub by_status: BTreeMap<String, usize>,
    pub by_type: BTreeMap<String, usize>,
    pub events: Vec<HubEvent>,
}

// ---------------------------------------------------------------------------
// Construction & mutation
// ---------------------------------------------------------------------------

impl HubState {
    pub fn new() -> Self {
        Self {
            started_at: Instant::now(),
            mqtt_connected: false,
            events: VecDeque::with_capacity(MAX_EVENTS),
        }
    }

    pub fn record_registered(&mut self, device: &Device) {
        self.push_event(
            EventKind::Registered,
            Some(device.id.clone()),
            format!("{} '{}' at {}", device.kind(), device.name, device.location),
        );
    }

    /// Record a command sent to (or attempted on) a device.
    pub fn record_command(&mut self, id: &DeviceId, command: &str, send_error: Option<&str>) {
        let detail = match send_error {
            Some(e) => format!("{command} applied, delivery failed: {e}"),
            None => format!("{command} sent"),
        };
        self.push_event(EventKind::Command, Some(id.clone()), detail);
    }

    pub fn record_telemetry(&mut self, id: &DeviceId, status: DeviceStatus) {
        self.push_event(
            EventKind::Telemetry,
            Some(id.clone()),
            format!("reported, now {status}"),
        );
    }

    pub fn record_offline(&mut self, id: &DeviceId, silent_secs: i64) {
        self.push_event(
            EventKind::Offline,
            Some(id.clone()),
            format!("no update for {silent_secs}s"),
        );
    }

    pub fn record_error(&mut self, detail: String) {
        self.push_event(EventKind::Error, None, detail);
    }

    pub fn record_system(&mut self, detail: String) {
        self.push_event(EventKind::System, None, detail);
    }

    /// Build the JSON-serialisable status snapshot. Newest events first.
    pub fn to_status(&self, devices: &[Device]) -> StatusResponse {
        let mut by_status = BTreeMap::new();
        let mut by_type = BTreeMap::new();
        for kind in [
            DeviceKind::Camera,
            DeviceKind::Irrigation,
            DeviceKind::Sensor,
            DeviceKind::Valve,
        ] {
            by_type.insert(kind.to_string(), 0);
        }
        for status in [DeviceStatus::Online, DeviceStatus::Offline, DeviceStatus::Error] {
            by_status.insert(status.to_string(), 0);
        }
        for d in devices {
            *by_status.entry(d.status.to_string()).or_insert(0) += 1;
            *by_type.entry(d.kind().to_string()).or_insert(0) += 1;
        }

        StatusResponse {
            uptime_secs: self.started_at.elapsed().as_secs(),
            mqtt_connected: self.mqtt_connected,
            device_count: devices.len(),
            by_status,
            by_type,
            events: self.events.iter().rev().cloned().collect(),
        }
    }

    fn push_event(&mut self, kind: EventKind, device_id: Option<DeviceId>, detail: String) {
        if self.events.len() >= MAX_EVENTS {
            self.events.pop_front();
        }
        self.events.push_back(HubEvent {
            ts: OffsetDateTime::now_utc(),
            kind,
            device_id,
            detail,
        });
    }
}

impl Default for HubState {
    fn default() -> Self {
        Self::new()
    }
}

// ===========================================================================
// Tests
// ===========================================================================
