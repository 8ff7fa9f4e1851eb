use serde::Deserialize;
use time::OffsetDateTime;
use tracing::{debug, warn};

use crate::device::{DataPatch, Device, DeviceId, DeviceStatus, SensorPatch};
use crate::registry::{RegistryError, SharedRegistry};
use crate::state::SharedState;

/// Subscription filter for device state reports.
pub const TELEMETRY_FILTER: &str = "tele/+/state";

// ---------------------------------------------------------------------------
// MQTT message types
// ---------------------------------------------------------------------------

/// Device state report published to `tele/<device_id>/state`.
#[derive(Debug, Deserialize)]
pub(crate) struct TelemetryMsg {
    /// Unix seconds at the device.
    pub(crate) ts: i64,
    #[serde(default)]
    pub(crate) status: Option<String>,
    #[serde(default)]
    pub(crate) sensor: Option<SensorPatch>,
}

// ---------------------------------------------------------------------------
// Topic / payload helpers
// ---------------------------------------------------------------------------

/// Extract device_id from "tele/<device_id>/state".
pub(crate) fn extract_telemetry_device_id(topic: &str) -> Option<&str> {
    let parts: Vec<&str> = topic.split('/').collect();
    if parts.len() == 3 && parts[0] == "tele" && parts[2] == "state" && !parts[1].is_empty() {
        Some(parts[1])
    } else {
        None
    }
}

/// Map a device-reported status. Devices may only report `error`; `online`
/// is reserved for the dispatcher and `offline` for the health monitor.
pub(crate) fn reported_status(raw: Option<&str>) -> Result<Option<DeviceStatus>, String> {
    match raw.map(|s| s.trim().to_lowercase()) {
        None => Ok(None),
        Some(s) if s == "error" => Ok(Some(DeviceStatus::Error)),
        Some(s) => Err(format!("device may not report status '{s}'")),
    }
}

/// Sensor fields of a report as a patch. A missing reading timestamp is
/// taken from the report's `ts`.
pub(crate) fn sensor_patch(msg: &TelemetryMsg) -> Option<DataPatch> {
    msg.sensor.clone().map(|mut patch| {
        if patch.timestamp.is_none() {
            patch.timestamp = OffsetDateTime::from_unix_timestamp(msg.ts).ok();
        }
        DataPatch::Sensor(patch)
    })
}

/// Apply one report to the registry.
pub(crate) async fn apply_telemetry(
    registry: &SharedRegistry,
    id: &DeviceId,
    msg: &TelemetryMsg,
) -> Result<Device, RegistryError> {
    let status = match reported_status(msg.status.as_deref()) {
        Ok(s) => s,
        Err(e) => {
            warn!(device = %id, "{e}; ignoring status");
            None
        }
    };
    registry.apply_update(id, status, sensor_patch(msg)).await
}

/// Handle one publish on a telemetry topic. Bad payloads and unknown
/// devices are logged and recorded, never fatal.
pub(crate) async fn handle_telemetry(
    registry: &SharedRegistry,
    shared: &SharedState,
    device_id: &str,
    payload: &[u8],
) {
    let id = DeviceId::new(device_id);

    let msg = match serde_json::from_slice::<TelemetryMsg>(payload) {
        Ok(msg) => msg,
        Err(e) => {
            warn!(device = %id, "bad telemetry json: {e}");
            shared
                .write()
                .await
                .record_error(format!("{id}: bad telemetry json: {e}"));
            return;
        }
    };

    match apply_telemetry(registry, &id, &msg).await {
        Ok(device) => {
            debug!(device = %id, ts = msg.ts, status = %device.status, "telemetry applied");
            shared.write().await.record_telemetry(&id, device.status);
        }
        Err(RegistryError::NotFound(_)) => {
            warn!(device = %id, "telemetry from unknown device; skipping");
        }
        Err(e) => {
            warn!(device = %id, "telemetry rejected: {e}");
            shared
                .write()
                .await
                .record_error(format!("{id}: telemetry rejected: {e}"));
        }
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::device::{DevicePayload, DeviceSpec, SensorData, ValveData};
    use crate::registry::DeviceRegistry;
    use crate::state::{EventKind, HubState};
    use crate::store::MemoryStore;
    use std::sync::Arc;
    use time::macros::datetime;
    use tokio::sync::RwLock;

    // -- extract_telemetry_device_id ------------------------------------------

    #[test]
    fn extract_device_id_valid_topic() {
        assert_eq!(
            extract_telemetry_device_id("tele/sensor_1714543200000/state"),
            Some("sensor_1714543200000")
        );
    }

    #[test]
    fn extract_device_id_wrong_prefix() {
        assert_eq!(extract_telemetry_device_id("cmd/sensor_1/state"), None);
    }

    #[test]
    fn extract_device_id_wrong_suffix() {
        assert_eq!(extract_telemetry_device_id("tele/sensor_1/reading"), None);
    }

    #[test]
    fn extract_device_id_too_many_segments() {
        assert_eq!(extract_telemetry_device_id("tele/a/b/state"), None);
    }

    #[test]
    fn extract_device_id_empty_id() {
        assert_eq!(extract_telemetry_device_id("tele//state"), None);
    }

    #[test]
    fn extract_device_id_empty_string() {
        assert_eq!(extract_telemetry_device_id(""), None);
    }

    // -- reported_status ------------------------------------------------------

    #[test]
    fn reported_status_absent() {
        assert_eq!(reported_status(None), Ok(None));
    }

    #[test]
    fn reported_status_error_any_case() {
        assert_eq!(
            reported_status(Some(" Error ")),
            Ok(Some(DeviceStatus::Error))
        );
    }

    #[test]
    fn reported_status_online_rejected() {
        assert!(reported_status(Some("online")).is_err());
    }

    #[test]
    fn reported_status_garbage_rejected() {
        assert!(reported_status(Some("on fire")).is_err());
    }

    // -- TelemetryMsg ---------------------------------------------------------

    #[test]
    fn telemetry_msg_deserialize_sensor_only() {
        let msg: TelemetryMsg = serde_json::from_str(
            r#"{"ts":1714543200,"sensor":{"temperature":21.5,"soilMoisture":40.0}}"#,
        )
        .unwrap();
        assert_eq!(msg.ts, 1714543200);
        assert!(msg.status.is_none());
        let sensor = msg.sensor.unwrap();
        assert_eq!(sensor.temperature, Some(21.5));
        assert_eq!(sensor.soil_moisture, Some(40.0));
        assert_eq!(sensor.humidity, None);
    }

    #[test]
    fn telemetry_msg_missing_ts_fails() {
        assert!(serde_json::from_str::<TelemetryMsg>(r#"{"status":"error"}"#).is_err());
    }

    #[test]
    fn telemetry_msg_extra_fields_ignored() {
        let msg: TelemetryMsg =
            serde_json::from_str(r#"{"ts":1,"rssi":-60,"status":"error"}"#).unwrap();
        assert_eq!(msg.status.as_deref(), Some("error"));
    }

    #[test]
    fn sensor_patch_fills_timestamp_from_ts() {
        let msg: TelemetryMsg =
            serde_json::from_str(r#"{"ts":1714543200,"sensor":{"humidity":70.0}}"#).unwrap();
        match sensor_patch(&msg) {
            Some(DataPatch::Sensor(p)) => {
                assert_eq!(p.timestamp, Some(datetime!(2024-05-01 06:00 UTC)));
            }
            other => panic!("unexpected patch {other:?}"),
        }
    }

    // -- handle_telemetry -----------------------------------------------------

    async fn setup() -> (SharedRegistry, SharedState, DeviceId, DeviceId) {
        let store = Arc::new(MemoryStore::new());
        let clock = ManualClock::new(datetime!(2024-05-01 06:00 UTC));
        let registry = Arc::new(DeviceRegistry::new(store, clock.clone()));
        let sensor = registry
            .register(DeviceSpec::new(
                "North sensor",
                "North plot",
                DevicePayload::Sensor(SensorData {
                    temperature: 28.5,
                    humidity: 65.0,
                    soil_moisture: 45.0,
                    light_level: 80.0,
                    timestamp: datetime!(2024-05-01 06:00 UTC),
                }),
            ))
            .await
            .unwrap();
        clock.advance(time::Duration::milliseconds(1));
        let valve = registry
            .register(DeviceSpec::new(
                "Main valve",
                "Main line",
                DevicePayload::Valve(ValveData::at(0.0, datetime!(2024-05-01 06:00 UTC))),
            ))
            .await
            .unwrap();
        let shared = Arc::new(RwLock::new(HubState::new()));
        (registry, shared, sensor, valve)
    }

    #[tokio::test]
    async fn telemetry_merges_sensor_fields() {
        let (registry, shared, sensor, _) = setup().await;
        handle_telemetry(
            &registry,
            &shared,
            sensor.as_str(),
            br#"{"ts":1714543260,"sensor":{"humidity":70.0}}"#,
        )
        .await;

        let device = registry.get(&sensor).await.unwrap();
        match device.payload {
            DevicePayload::Sensor(s) => {
                assert_eq!(s.temperature, 28.5);
                assert_eq!(s.humidity, 70.0);
            }
            other => panic!("unexpected payload {other:?}"),
        }
        // Reports never bring a device online.
        assert_eq!(device.status, DeviceStatus::Offline);
        assert_eq!(
            shared.read().await.events.back().unwrap().kind,
            EventKind::Telemetry
        );
    }

    #[tokio::test]
    async fn telemetry_error_status_applied() {
        let (registry, shared, _, valve) = setup().await;
        handle_telemetry(&registry, &shared, valve.as_str(), br#"{"ts":1,"status":"error"}"#)
            .await;
        assert_eq!(
            registry.get(&valve).await.unwrap().status,
            DeviceStatus::Error
        );
    }

    #[tokio::test]
    async fn telemetry_sensor_fields_on_valve_rejected() {
        let (registry, shared, _, valve) = setup().await;
        let before = registry.get(&valve).await.unwrap();
        handle_telemetry(
            &registry,
            &shared,
            valve.as_str(),
            br#"{"ts":1,"sensor":{"humidity":70.0}}"#,
        )
        .await;

        assert_eq!(registry.get(&valve).await.unwrap(), before);
        assert_eq!(
            shared.read().await.events.back().unwrap().kind,
            EventKind::Error
        );
    }

    #[tokio::test]
    async fn telemetry_unknown_device_skipped() {
        let (registry, shared, _, _) = setup().await;
        handle_telemetry(&registry, &shared, "sensor_404", br#"{"ts":1}"#).await;
        assert_eq!(registry.list().await.len(), 2);
        assert!(shared.read().await.events.is_empty());
    }

    #[tokio::test]
    async fn telemetry_bad_json_recorded() {
        let (registry, shared, sensor, _) = setup().await;
        handle_telemetry(&registry, &shared, sensor.as_str(), b"not json").await;
        assert_eq!(
            shared.read().await.events.back().unwrap().kind,
            EventKind::Error
        );
    }
}
