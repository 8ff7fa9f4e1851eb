//! Translates high-level device actions into a registry update followed by
//! an outbound command.
//!
//! Order is always: validate kind and mutate the registry (status goes
//! `online`), then send. A failed send is logged and reported in the
//! [`CommandOutcome`] but the registry write stands; the health monitor
//! eventually marks a device that never answers as offline.

use serde::Deserialize;
use serde_json::json;
use tracing::{info, warn};

use crate::clock::SharedClock;
use crate::command::{CommandSendError, DeviceCommand, SharedChannel};
use crate::device::{
    clamp_percentage, CameraPatch, DataPatch, Device, DeviceId, DeviceKind, DevicePayload,
    DeviceStatus, IrrigationPatch, SchedulePatch, SensorData, ValvePatch,
};
use crate::registry::{RegistryError, SharedRegistry};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CameraAction {
    Start,
    Stop,
    Record,
    Snapshot,
}

impl CameraAction {
    pub fn command(self) -> &'static str {
        match self {
            Self::Start => "start",
            Self::Stop => "stop",
            Self::Record => "record",
            Self::Snapshot => "snapshot",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum IrrigationAction {
    Start,
    Stop,
    Schedule(SchedulePatch),
}

impl IrrigationAction {
    pub fn command(&self) -> &'static str {
        match self {
            Self::Start => "start",
            Self::Stop => "stop",
            Self::Schedule(_) => "schedule",
        }
    }
}

/// The device as written to the registry, plus any delivery failure.
#[derive(Debug, Clone)]
pub struct CommandOutcome {
    pub device: Device,
    pub command: &'static str,
    pub send_error: Option<CommandSendError>,
}

#[derive(Debug, Clone)]
pub struct SensorReadout {
    pub data: SensorData,
    pub send_error: Option<CommandSendError>,
}

#[derive(Clone)]
pub struct Dispatcher {
    registry: SharedRegistry,
    channel: SharedChannel,
    clock: SharedClock,
}

impl Dispatcher {
    pub fn new(registry: SharedRegistry, channel: SharedChannel, clock: SharedClock) -> Self {
        Self {
            registry,
            channel,
            clock,
        }
    }

    pub async fn control_camera(
        &self,
        id: &DeviceId,
        action: CameraAction,
    ) -> Result<CommandOutcome, RegistryError> {
        let device = self
            .registry
            .update_with(id, Some(DeviceStatus::Online), |payload| {
                let is_recording = match (action, payload) {
                    (CameraAction::Record, DevicePayload::Camera(c)) => Some(!c.is_recording),
                    (CameraAction::Start | CameraAction::Stop, _) => Some(false),
                    _ => None,
                };
                DataPatch::Camera(CameraPatch {
                    is_recording,
                    ..Default::default()
                })
            })
            .await?;

        let params = match &device.payload {
            DevicePayload::Camera(c) if action == CameraAction::Record => {
                json!({ "recording": c.is_recording })
            }
            _ => json!({}),
        };

        Ok(self.send(device, action.command(), params).await)
    }

    pub async fn control_irrigation(
        &self,
        id: &DeviceId,
        action: IrrigationAction,
    ) -> Result<CommandOutcome, RegistryError> {
        let command = action.command();
        let now = self.clock.now();

        let device = self
            .registry
            .update_with(id, Some(DeviceStatus::Online), |payload| {
                let patch = match action {
                    IrrigationAction::Start => IrrigationPatch {
                        is_active: Some(true),
                        last_action: Some(now),
                        ..Default::default()
                    },
                    IrrigationAction::Stop => IrrigationPatch {
                        is_active: Some(false),
                        last_action: Some(now),
                        ..Default::default()
                    },
                    IrrigationAction::Schedule(schedule) => match payload {
                        DevicePayload::Irrigation(d) => {
                            let mut merged = d.schedule.clone();
                            merged.merge(schedule);
                            IrrigationPatch {
                                schedule: Some(merged),
                                ..Default::default()
                            }
                        }
                        // Rejected by the registry as the wrong kind.
                        _ => IrrigationPatch::default(),
                    },
                };
                DataPatch::Irrigation(patch)
            })
            .await?;

        let params = match &device.payload {
            DevicePayload::Irrigation(d) if command == "schedule" => json!(d.schedule),
            _ => json!({}),
        };

        Ok(self.send(device, command, params).await)
    }

    pub async fn control_valve(
        &self,
        id: &DeviceId,
        open_percentage: f64,
    ) -> Result<CommandOutcome, RegistryError> {
        let percentage = clamp_percentage(open_percentage);
        let patch = DataPatch::Valve(ValvePatch {
            open_percentage: Some(percentage),
            last_action: Some(self.clock.now()),
        });

        let device = self
            .registry
            .apply_update(id, Some(DeviceStatus::Online), Some(patch))
            .await?;

        Ok(self
            .send(device, "setPosition", json!({ "percentage": percentage }))
            .await)
    }

    /// Ask the device for a fresh reading and return the cached one without
    /// waiting for the reply. Status is left as is.
    pub async fn read_sensors(&self, id: &DeviceId) -> Result<SensorReadout, RegistryError> {
        let device = self
            .registry
            .get(id)
            .await
            .ok_or_else(|| RegistryError::NotFound(id.clone()))?;

        let data = match device.payload {
            DevicePayload::Sensor(data) => data,
            other => {
                return Err(RegistryError::WrongDeviceType {
                    id: id.clone(),
                    expected: DeviceKind::Sensor,
                    actual: other.kind(),
                })
            }
        };

        let send_error = self.deliver(id, "readSensors", json!({})).await;
        Ok(SensorReadout { data, send_error })
    }

    async fn send(
        &self,
        device: Device,
        command: &'static str,
        params: serde_json::Value,
    ) -> CommandOutcome {
        let send_error = self.deliver(&device.id, command, params).await;
        CommandOutcome {
            device,
            command,
            send_error,
        }
    }

    async fn deliver(
        &self,
        id: &DeviceId,
        command: &'static str,
        params: serde_json::Value,
    ) -> Option<CommandSendError> {
        let cmd = DeviceCommand {
            device_id: id.clone(),
            command: command.to_string(),
            params,
        };
        match self.channel.send(&cmd).await {
            Ok(()) => {
                info!(device = %id, command, "command sent");
                None
            }
            Err(e) => {
                warn!(device = %id, command, "command delivery failed, keeping local state: {e}");
                Some(e)
            }
        }
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::{Clock, ManualClock};
    use crate::command::RecordingChannel;
    use crate::device::{CameraData, DeviceSpec, IrrigationData, IrrigationSchedule, ValveData};
    use crate::registry::DeviceRegistry;
    use crate::store::MemoryStore;
    use std::sync::Arc;
    use time::macros::datetime;

    struct Harness {
        registry: SharedRegistry,
        channel: Arc<RecordingChannel>,
        clock: Arc<ManualClock>,
        dispatcher: Dispatcher,
    }

    fn harness_with(channel: RecordingChannel) -> Harness {
        let store = Arc::new(MemoryStore::new());
        let clock = ManualClock::new(datetime!(2024-05-01 06:00 UTC));
        let registry = Arc::new(DeviceRegistry::new(store, clock.clone()));
        let channel = Arc::new(channel);
        let dispatcher = Dispatcher::new(registry.clone(), channel.clone(), clock.clone());
        Harness {
            registry,
            channel,
            clock,
            dispatcher,
        }
    }

    fn harness() -> Harness {
        harness_with(RecordingChannel::default())
    }

    impl Harness {
        async fn register(&self, payload: DevicePayload) -> DeviceId {
            self.clock.advance(time::Duration::milliseconds(1));
            self.registry
                .register(DeviceSpec::new(
                    "Test device",
                    "Field",
                    payload,
                ))
                .await
                .unwrap()
        }
    }

    fn valve_payload() -> DevicePayload {
        DevicePayload::Valve(ValveData::at(0.0, datetime!(2024-05-01 06:00 UTC)))
    }

    fn camera_payload(is_recording: bool) -> DevicePayload {
        DevicePayload::Camera(CameraData {
            stream_url: "rtsp://192.168.1.100:554/stream".into(),
            resolution: "1920x1080".into(),
            is_recording,
            motion_detection: true,
        })
    }

    fn irrigation_payload() -> DevicePayload {
        DevicePayload::Irrigation(IrrigationData {
            is_active: false,
            flow_rate: 0.0,
            total_flow: 0.0,
            schedule: IrrigationSchedule {
                enabled: true,
                times: vec!["06:00".into(), "18:00".into()],
                duration: 30,
            },
            last_action: None,
        })
    }

    fn valve_of(device: &Device) -> ValveData {
        match &device.payload {
            DevicePayload::Valve(v) => v.clone(),
            other => panic!("expected valve payload, got {other:?}"),
        }
    }

    // -- valve ----------------------------------------------------------------

    #[tokio::test]
    async fn valve_percentage_is_clamped_and_drives_is_open() {
        let h = harness();
        let id = h.register(valve_payload()).await;

        for (input, expected) in [(150.0, 100.0), (-5.0, 0.0), (42.5, 42.5), (f64::NAN, 0.0)] {
            h.dispatcher.control_valve(&id, input).await.unwrap();
            let valve = valve_of(&h.registry.get(&id).await.unwrap());
            assert_eq!(valve.open_percentage, expected, "input {input}");
            assert_eq!(valve.is_open, expected > 0.0, "input {input}");
        }
    }

    #[tokio::test]
    async fn valve_command_is_idempotent() {
        let h = harness();
        let id = h.register(valve_payload()).await;

        h.dispatcher.control_valve(&id, 50.0).await.unwrap();
        let once = h.registry.get(&id).await.unwrap();
        h.dispatcher.control_valve(&id, 50.0).await.unwrap();
        let twice = h.registry.get(&id).await.unwrap();

        assert_eq!(valve_of(&once), valve_of(&twice));
        assert_eq!(once.status, twice.status);
    }

    #[tokio::test]
    async fn valve_command_goes_online_and_sends_set_position() {
        let h = harness();
        let id = h.register(valve_payload()).await;

        let outcome = h.dispatcher.control_valve(&id, 120.0).await.unwrap();
        assert_eq!(outcome.device.status, DeviceStatus::Online);
        assert!(outcome.send_error.is_none());

        let sent = h.channel.sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].device_id, id);
        assert_eq!(sent[0].command, "setPosition");
        assert_eq!(sent[0].params, json!({ "percentage": 100.0 }));
    }

    // -- camera ---------------------------------------------------------------

    #[tokio::test]
    async fn camera_on_valve_is_rejected_without_mutation() {
        let h = harness();
        let id = h.register(valve_payload()).await;
        let before = h.registry.get(&id).await.unwrap();

        let err = h
            .dispatcher
            .control_camera(&id, CameraAction::Record)
            .await
            .unwrap_err();

        assert!(matches!(
            err,
            RegistryError::WrongDeviceType {
                expected: DeviceKind::Camera,
                actual: DeviceKind::Valve,
                ..
            }
        ));
        assert_eq!(h.registry.get(&id).await.unwrap(), before);
        assert!(h.channel.sent().is_empty());
    }

    #[tokio::test]
    async fn camera_record_toggles_flag() {
        let h = harness();
        let id = h.register(camera_payload(false)).await;

        let outcome = h
            .dispatcher
            .control_camera(&id, CameraAction::Record)
            .await
            .unwrap();
        assert!(matches!(&outcome.device.payload, DevicePayload::Camera(c) if c.is_recording));
        assert_eq!(h.channel.sent()[0].params, json!({ "recording": true }));

        let outcome = h
            .dispatcher
            .control_camera(&id, CameraAction::Record)
            .await
            .unwrap();
        assert!(matches!(&outcome.device.payload, DevicePayload::Camera(c) if !c.is_recording));
    }

    #[tokio::test]
    async fn camera_start_and_stop_clear_recording() {
        let h = harness();
        let id = h.register(camera_payload(true)).await;

        for action in [CameraAction::Start, CameraAction::Stop] {
            let outcome = h.dispatcher.control_camera(&id, action).await.unwrap();
            assert!(
                matches!(&outcome.device.payload, DevicePayload::Camera(c) if !c.is_recording),
                "{action:?}"
            );
        }
    }

    #[tokio::test]
    async fn camera_snapshot_changes_status_only() {
        let h = harness();
        let id = h.register(camera_payload(true)).await;
        let before = h.registry.get(&id).await.unwrap();

        let outcome = h
            .dispatcher
            .control_camera(&id, CameraAction::Snapshot)
            .await
            .unwrap();
        assert_eq!(outcome.device.payload, before.payload);
        assert_eq!(outcome.device.status, DeviceStatus::Online);
        assert_eq!(h.channel.sent()[0].command, "snapshot");
    }

    // -- irrigation -----------------------------------------------------------

    #[tokio::test]
    async fn irrigation_start_activates_and_goes_online() {
        let h = harness();
        let id = h.register(irrigation_payload()).await;

        h.dispatcher
            .control_irrigation(&id, IrrigationAction::Start)
            .await
            .unwrap();

        let device = h.registry.get(&id).await.unwrap();
        assert_eq!(device.status, DeviceStatus::Online);
        match device.payload {
            DevicePayload::Irrigation(d) => {
                assert!(d.is_active);
                assert_eq!(d.last_action, Some(h.clock.now()));
            }
            other => panic!("unexpected payload {other:?}"),
        }
    }

    #[tokio::test]
    async fn irrigation_schedule_merges_fields() {
        let h = harness();
        let id = h.register(irrigation_payload()).await;

        let outcome = h
            .dispatcher
            .control_irrigation(
                &id,
                IrrigationAction::Schedule(SchedulePatch {
                    duration: Some(45),
                    ..Default::default()
                }),
            )
            .await
            .unwrap();

        match &outcome.device.payload {
            DevicePayload::Irrigation(d) => {
                assert_eq!(d.schedule.duration, 45);
                assert_eq!(d.schedule.times, vec!["06:00", "18:00"]);
                assert!(d.schedule.enabled);
                assert!(!d.is_active);
            }
            other => panic!("unexpected payload {other:?}"),
        }
        assert_eq!(h.channel.sent()[0].params["duration"], json!(45));
    }

    // -- sensors --------------------------------------------------------------

    #[tokio::test]
    async fn read_sensors_returns_cached_reading_and_keeps_status() {
        let h = harness();
        let id = h
            .register(DevicePayload::Sensor(SensorData {
                temperature: 28.5,
                humidity: 65.0,
                soil_moisture: 45.0,
                light_level: 80.0,
                timestamp: datetime!(2024-05-01 06:00 UTC),
            }))
            .await;

        let readout = h.dispatcher.read_sensors(&id).await.unwrap();
        assert_eq!(readout.data.temperature, 28.5);
        assert_eq!(
            h.registry.get(&id).await.unwrap().status,
            DeviceStatus::Offline
        );
        assert_eq!(h.channel.sent()[0].command, "readSensors");
    }

    #[tokio::test]
    async fn read_sensors_on_valve_is_wrong_type() {
        let h = harness();
        let id = h.register(valve_payload()).await;
        let err = h.dispatcher.read_sensors(&id).await.unwrap_err();
        assert!(matches!(
            err,
            RegistryError::WrongDeviceType {
                expected: DeviceKind::Sensor,
                ..
            }
        ));
    }

    // -- failures -------------------------------------------------------------

    #[tokio::test]
    async fn unknown_device_is_not_found() {
        let h = harness();
        let err = h
            .dispatcher
            .control_valve(&DeviceId::new("valve_404"), 10.0)
            .await
            .unwrap_err();
        assert!(matches!(err, RegistryError::NotFound(_)));
        assert!(h.channel.sent().is_empty());
    }

    #[tokio::test]
    async fn send_failure_keeps_registry_update() {
        let h = harness_with(RecordingChannel::failing());
        let id = h.register(valve_payload()).await;

        let outcome = h.dispatcher.control_valve(&id, 30.0).await.unwrap();
        assert!(matches!(
            outcome.send_error,
            Some(CommandSendError::Transport(_))
        ));

        let device = h.registry.get(&id).await.unwrap();
        assert_eq!(device.status, DeviceStatus::Online);
        assert_eq!(valve_of(&device).open_percentage, 30.0);
    }
}
