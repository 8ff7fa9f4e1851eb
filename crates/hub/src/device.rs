//! Device records and their typed payloads.
//!
//! A device's `type` is never stored on its own: it is derived from the
//! payload variant, so a camera record cannot carry irrigation fields. On the
//! wire the record is a flat JSON document with `type` next to a `data`
//! object, which is also the shape the document store persists.

use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;
use time::OffsetDateTime;

// ---------------------------------------------------------------------------
// Identity, kind, status
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DeviceId(String);

impl DeviceId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// `{type}_{unix millis}`, e.g. `valve_1700000000000`.
    pub fn with_millis(kind: DeviceKind, millis: i128) -> Self {
        Self(format!("{kind}_{millis}"))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for DeviceId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

pub fn unix_millis(ts: OffsetDateTime) -> i128 {
    ts.unix_timestamp_nanos() / 1_000_000
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceKind {
    Camera,
    Irrigation,
    Sensor,
    Valve,
}

impl DeviceKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Camera => "camera",
            Self::Irrigation => "irrigation",
            Self::Sensor => "sensor",
            Self::Valve => "valve",
        }
    }
}

impl fmt::Display for DeviceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DeviceKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "camera" => Ok(Self::Camera),
            "irrigation" => Ok(Self::Irrigation),
            "sensor" => Ok(Self::Sensor),
            "valve" => Ok(Self::Valve),
            other => Err(format!("unknown device type '{other}'")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceStatus {
    Online,
    Offline,
    /// Reserved for device-side failure reports.
    Error,
}

impl fmt::Display for DeviceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Online => "online",
            Self::Offline => "offline",
            Self::Error => "error",
        })
    }
}

// ---------------------------------------------------------------------------
// Payloads
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CameraData {
    pub stream_url: String,
    pub resolution: String,
    pub is_recording: bool,
    pub motion_detection: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IrrigationSchedule {
    pub enabled: bool,
    /// Time-of-day strings, `HH:MM`.
    pub times: Vec<String>,
    /// Minutes per run.
    pub duration: u32,
}

impl IrrigationSchedule {
    pub fn merge(&mut self, patch: SchedulePatch) {
        if let Some(enabled) = patch.enabled {
            self.enabled = enabled;
        }
        if let Some(times) = patch.times {
            self.times = times;
        }
        if let Some(duration) = patch.duration {
            self.duration = duration;
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IrrigationData {
    pub is_active: bool,
    /// Litres per minute.
    pub flow_rate: f64,
    /// Litres delivered today.
    pub total_flow: f64,
    pub schedule: IrrigationSchedule,
    #[serde(
        default,
        with = "time::serde::rfc3339::option",
        skip_serializing_if = "Option::is_none"
    )]
    pub last_action: Option<OffsetDateTime>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SensorData {
    pub temperature: f64,
    pub humidity: f64,
    pub soil_moisture: f64,
    pub light_level: f64,
    #[serde(with = "time::serde::rfc3339")]
    pub timestamp: OffsetDateTime,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ValveData {
    pub is_open: bool,
    pub open_percentage: f64,
    #[serde(with = "time::serde::rfc3339")]
    pub last_action: OffsetDateTime,
}

impl ValveData {
    pub fn at(open_percentage: f64, last_action: OffsetDateTime) -> Self {
        let open_percentage = clamp_percentage(open_percentage);
        Self {
            is_open: open_percentage > 0.0,
            open_percentage,
            last_action,
        }
    }
}

/// Clamp to `[0, 100]`. NaN counts as fully closed.
pub fn clamp_percentage(p: f64) -> f64 {
    if p.is_nan() {
        0.0
    } else {
        p.clamp(0.0, 100.0)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum DevicePayload {
    Camera(CameraData),
    Irrigation(IrrigationData),
    Sensor(SensorData),
    Valve(ValveData),
}

impl DevicePayload {
    pub fn kind(&self) -> DeviceKind {
        match self {
            Self::Camera(_) => DeviceKind::Camera,
            Self::Irrigation(_) => DeviceKind::Irrigation,
            Self::Sensor(_) => DeviceKind::Sensor,
            Self::Valve(_) => DeviceKind::Valve,
        }
    }

    /// Re-derive valve state from a clamped `openPercentage`.
    pub fn normalize(&mut self) {
        if let Self::Valve(v) = self {
            *v = ValveData::at(v.open_percentage, v.last_action);
        }
    }

    fn stamp(&mut self, now: OffsetDateTime) {
        match self {
            Self::Sensor(s) => s.timestamp = now,
            Self::Valve(v) => v.last_action = now,
            Self::Camera(_) | Self::Irrigation(_) => {}
        }
    }

    /// Interpret a raw `data` object according to `kind`.
    pub fn from_parts(kind: DeviceKind, data: serde_json::Value) -> serde_json::Result<Self> {
        Ok(match kind {
            DeviceKind::Camera => Self::Camera(serde_json::from_value(data)?),
            DeviceKind::Irrigation => Self::Irrigation(serde_json::from_value(data)?),
            DeviceKind::Sensor => Self::Sensor(serde_json::from_value(data)?),
            DeviceKind::Valve => Self::Valve(serde_json::from_value(data)?),
        })
    }

    /// Shallow merge: fields present in `patch` overwrite, others stay.
    pub fn apply(&mut self, patch: DataPatch) -> Result<(), KindMismatch> {
        match (&mut *self, patch) {
            (Self::Camera(d), DataPatch::Camera(p)) => {
                if let Some(v) = p.stream_url {
                    d.stream_url = v;
                }
                if let Some(v) = p.resolution {
                    d.resolution = v;
                }
                if let Some(v) = p.is_recording {
                    d.is_recording = v;
                }
                if let Some(v) = p.motion_detection {
                    d.motion_detection = v;
                }
            }
            (Self::Irrigation(d), DataPatch::Irrigation(p)) => {
                if let Some(v) = p.is_active {
                    d.is_active = v;
                }
                if let Some(v) = p.flow_rate {
                    d.flow_rate = v;
                }
                if let Some(v) = p.total_flow {
                    d.total_flow = v;
                }
                if let Some(v) = p.schedule {
                    d.schedule = v;
                }
                if let Some(v) = p.last_action {
                    d.last_action = Some(v);
                }
            }
            (Self::Sensor(d), DataPatch::Sensor(p)) => {
                if let Some(v) = p.temperature {
                    d.temperature = v;
                }
                if let Some(v) = p.humidity {
                    d.humidity = v;
                }
                if let Some(v) = p.soil_moisture {
                    d.soil_moisture = v;
                }
                if let Some(v) = p.light_level {
                    d.light_level = v;
                }
                if let Some(v) = p.timestamp {
                    d.timestamp = v;
                }
            }
            (Self::Valve(d), DataPatch::Valve(p)) => {
                if let Some(v) = p.open_percentage {
                    d.open_percentage = clamp_percentage(v);
                    d.is_open = d.open_percentage > 0.0;
                }
                if let Some(v) = p.last_action {
                    d.last_action = v;
                }
            }
            (payload, patch) => {
                return Err(KindMismatch {
                    expected: patch.kind(),
                    actual: payload.kind(),
                })
            }
        }
        Ok(())
    }
}

/// A patch of kind `expected` was applied to a payload of kind `actual`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KindMismatch {
    pub expected: DeviceKind,
    pub actual: DeviceKind,
}

// ---------------------------------------------------------------------------
// Partial updates
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
pub enum DataPatch {
    Camera(CameraPatch),
    Irrigation(IrrigationPatch),
    Sensor(SensorPatch),
    Valve(ValvePatch),
}

impl DataPatch {
    pub fn kind(&self) -> DeviceKind {
        match self {
            Self::Camera(_) => DeviceKind::Camera,
            Self::Irrigation(_) => DeviceKind::Irrigation,
            Self::Sensor(_) => DeviceKind::Sensor,
            Self::Valve(_) => DeviceKind::Valve,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CameraPatch {
    pub stream_url: Option<String>,
    pub resolution: Option<String>,
    pub is_recording: Option<bool>,
    pub motion_detection: Option<bool>,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IrrigationPatch {
    pub is_active: Option<bool>,
    pub flow_rate: Option<f64>,
    pub total_flow: Option<f64>,
    pub schedule: Option<IrrigationSchedule>,
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub last_action: Option<OffsetDateTime>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SchedulePatch {
    pub enabled: Option<bool>,
    pub times: Option<Vec<String>>,
    pub duration: Option<u32>,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SensorPatch {
    pub temperature: Option<f64>,
    pub humidity: Option<f64>,
    pub soil_moisture: Option<f64>,
    pub light_level: Option<f64>,
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub timestamp: Option<OffsetDateTime>,
}

/// `isOpen` is always derived from the percentage, so it is not patchable.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ValvePatch {
    pub open_percentage: Option<f64>,
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub last_action: Option<OffsetDateTime>,
}

// ---------------------------------------------------------------------------
// Records
// ---------------------------------------------------------------------------

/// A device description before registration assigns `id` and `lastUpdate`.
#[derive(Debug, Clone, PartialEq)]
pub struct DeviceSpec {
    pub name: String,
    pub location: String,
    pub payload: DevicePayload,
    /// The submitted data left out its reading or action time.
    missing_time: bool,
}

impl DeviceSpec {
    pub fn new(name: impl Into<String>, location: impl Into<String>, payload: DevicePayload) -> Self {
        Self {
            name: name.into(),
            location: location.into(),
            payload,
            missing_time: false,
        }
    }

    pub fn kind(&self) -> DeviceKind {
        self.payload.kind()
    }

    /// The payload as first stored at `now`: valve state normalized, and a
    /// missing reading or action time filled with `now`.
    pub fn payload_at(&self, now: OffsetDateTime) -> DevicePayload {
        let mut payload = self.payload.clone();
        if self.missing_time {
            payload.stamp(now);
        }
        payload.normalize();
        payload
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Device {
    pub id: DeviceId,
    pub name: String,
    pub location: String,
    pub status: DeviceStatus,
    pub last_update: OffsetDateTime,
    pub payload: DevicePayload,
}

impl Device {
    pub fn kind(&self) -> DeviceKind {
        self.payload.kind()
    }
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct DeviceDocRef<'a> {
    id: &'a DeviceId,
    name: &'a str,
    location: &'a str,
    #[serde(rename = "type")]
    kind: DeviceKind,
    status: DeviceStatus,
    #[serde(with = "time::serde::rfc3339")]
    last_update: OffsetDateTime,
    data: &'a DevicePayload,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct DeviceDoc {
    id: DeviceId,
    name: String,
    location: String,
    #[serde(rename = "type")]
    kind: DeviceKind,
    status: DeviceStatus,
    #[serde(with = "time::serde::rfc3339")]
    last_update: OffsetDateTime,
    data: serde_json::Value,
}

impl Serialize for Device {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        DeviceDocRef {
            id: &self.id,
            name: &self.name,
            location: &self.location,
            kind: self.kind(),
            status: self.status,
            last_update: self.last_update,
            data: &self.payload,
        }
        .serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for Device {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let doc = DeviceDoc::deserialize(deserializer)?;
        let payload = DevicePayload::from_parts(doc.kind, doc.data)
            .map_err(|e| D::Error::custom(format!("invalid {} data: {e}", doc.kind)))?;
        Ok(Self {
            id: doc.id,
            name: doc.name,
            location: doc.location,
            status: doc.status,
            last_update: doc.last_update,
            payload,
        })
    }
}

const UNSET_TIME: &str = "1970-01-01T00:00:00Z";

#[derive(Deserialize)]
struct DeviceSpecDoc {
    name: String,
    location: String,
    #[serde(rename = "type")]
    kind: DeviceKind,
    data: serde_json::Value,
}

impl<'de> Deserialize<'de> for DeviceSpec {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let mut doc = DeviceSpecDoc::deserialize(deserializer)?;

        let time_key = match doc.kind {
            DeviceKind::Sensor => Some("timestamp"),
            DeviceKind::Valve => Some("lastAction"),
            DeviceKind::Camera | DeviceKind::Irrigation => None,
        };
        let mut missing_time = false;
        if let (Some(key), Some(fields)) = (time_key, doc.data.as_object_mut()) {
            if !fields.contains_key(key) {
                // Placeholder; `payload_at` overwrites it at registration.
                fields.insert(key.to_string(), serde_json::Value::from(UNSET_TIME));
                missing_time = true;
            }
        }

        let payload = DevicePayload::from_parts(doc.kind, doc.data)
            .map_err(|e| D::Error::custom(format!("invalid {} data: {e}", doc.kind)))?;
        Ok(Self {
            name: doc.name,
            location: doc.location,
            payload,
            missing_time,
        })
    }
}

// ===========================================================================
// Tests
// ===========================================================================
