use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use axum::routing::{get, post};
use axum::Router;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::net::SocketAddr;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::device::{Device, DeviceId, DeviceKind, DeviceSpec, SchedulePatch, SensorData};
use crate::dispatcher::{CameraAction, CommandOutcome, Dispatcher, IrrigationAction};
use crate::registry::{RegistryError, SharedRegistry};
use crate::state::SharedState;

#[derive(Clone)]
pub struct AppState {
    pub registry: SharedRegistry,
    pub dispatcher: Dispatcher,
    pub shared: SharedState,
}

// ---------------------------------------------------------------------------
// Routes
// ---------------------------------------------------------------------------

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/api/status", get(api_status))
        .route("/api/devices", get(list_devices).post(register_device))
        .route("/api/devices/{id}", get(get_device))
        .route("/api/devices/{id}/camera", post(control_camera))
        .route("/api/devices/{id}/irrigation", post(control_irrigation))
        .route("/api/devices/{id}/valve", post(control_valve))
        .route("/api/devices/{id}/sensors", get(read_sensors))
        .with_state(state)
}

// ---------------------------------------------------------------------------
// Request / response bodies
// ---------------------------------------------------------------------------

#[derive(Deserialize)]
struct ListParams {
    #[serde(rename = "type")]
    kind: Option<DeviceKind>,
}

#[derive(Deserialize)]
struct CameraRequest {
    action: CameraAction,
}

#[derive(Deserialize)]
#[serde(rename_all = "lowercase")]
enum IrrigationVerb {
    Start,
    Stop,
    Schedule,
}

#[derive(Deserialize)]
struct IrrigationRequest {
    action: IrrigationVerb,
    #[serde(default)]
    schedule: Option<SchedulePatch>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ValveRequest {
    open_percentage: f64,
}

#[derive(Serialize)]
struct CommandResponse {
    device: Device,
    command: &'static str,
    /// Present when the device could not be reached. The update still stands.
    #[serde(skip_serializing_if = "Option::is_none")]
    warning: Option<String>,
}

#[derive(Serialize)]
struct SensorResponse {
    data: SensorData,
    #[serde(skip_serializing_if = "Option::is_none")]
    warning: Option<String>,
}

struct ApiError(RegistryError);

impl From<RegistryError> for ApiError {
    fn from(e: RegistryError) -> Self {
        Self(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            RegistryError::NotFound(_) => StatusCode::NOT_FOUND,
            RegistryError::WrongDeviceType { .. } => StatusCode::CONFLICT,
            RegistryError::Persistence(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        (status, Json(json!({ "error": self.0.to_string() }))).into_response()
    }
}

// ---------------------------------------------------------------------------
// Handlers
// ---------------------------------------------------------------------------

async fn api_status(State(app): State<AppState>) -> impl IntoResponse {
    let devices = app.registry.list().await;
    let st = app.shared.read().await;
    Json(st.to_status(&devices))
}

async fn list_devices(
    State(app): State<AppState>,
    Query(params): Query<ListParams>,
) -> Json<Vec<Device>> {
    let mut devices = match params.kind {
        Some(kind) => app.registry.list_by_type(kind).await,
        None => app.registry.list().await,
    };
    devices.sort_by(|a, b| a.id.cmp(&b.id));
    Json(devices)
}

async fn get_device(
    State(app): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Device>, ApiError> {
    let id = DeviceId::new(id);
    app.registry
        .get(&id)
        .await
        .map(Json)
        .ok_or(ApiError(RegistryError::NotFound(id)))
}

async fn register_device(
    State(app): State<AppState>,
    Json(spec): Json<DeviceSpec>,
) -> Result<(StatusCode, Json<Device>), ApiError> {
    let id = app.registry.register(spec).await?;
    let device = app
        .registry
        .get(&id)
        .await
        .ok_or_else(|| ApiError(RegistryError::NotFound(id)))?;
    app.shared.write().await.record_registered(&device);
    Ok((StatusCode::CREATED, Json(device)))
}

async fn control_camera(
    State(app): State<AppState>,
    Path(id): Path<String>,
    Json(req): Json<CameraRequest>,
) -> Result<Json<CommandResponse>, ApiError> {
    let outcome = app
        .dispatcher
        .control_camera(&DeviceId::new(id), req.action)
        .await?;
    Ok(Json(respond(&app, outcome).await))
}

async fn control_irrigation(
    State(app): State<AppState>,
    Path(id): Path<String>,
    Json(req): Json<IrrigationRequest>,
) -> Result<Json<CommandResponse>, ApiError> {
    let action = match req.action {
        IrrigationVerb::Start => IrrigationAction::Start,
        IrrigationVerb::Stop => IrrigationAction::Stop,
        IrrigationVerb::Schedule => IrrigationAction::Schedule(req.schedule.unwrap_or_default()),
    };
    let outcome = app
        .dispatcher
        .control_irrigation(&DeviceId::new(id), action)
        .await?;
    Ok(Json(respond(&app, outcome).await))
}

async fn control_valve(
    State(app): State<AppState>,
    Path(id): Path<String>,
    Json(req): Json<ValveRequest>,
) -> Result<Json<CommandResponse>, ApiError> {
    let outcome = app
        .dispatcher
        .control_valve(&DeviceId::new(id), req.open_percentage)
        .await?;
    Ok(Json(respond(&app, outcome).await))
}

async fn read_sensors(
    State(app): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<SensorResponse>, ApiError> {
    let id = DeviceId::new(id);
    let readout = app.dispatcher.read_sensors(&id).await?;
    let warning = readout.send_error.map(|e| e.to_string());
    app.shared
        .write()
        .await
        .record_command(&id, "readSensors", warning.as_deref());
    Ok(Json(SensorResponse {
        data: readout.data,
        warning,
    }))
}

async fn respond(app: &AppState, outcome: CommandOutcome) -> CommandResponse {
    let warning = outcome.send_error.map(|e| e.to_string());
    app.shared
        .write()
        .await
        .record_command(&outcome.device.id, outcome.command, warning.as_deref());
    CommandResponse {
        device: outcome.device,
        command: outcome.command,
        warning,
    }
}

// ---------------------------------------------------------------------------
// Server entry-point
// ---------------------------------------------------------------------------

pub async fn serve(state: AppState, port: u16, cancel: CancellationToken) -> anyhow::Result<()> {
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = TcpListener::bind(addr).await?;

    info!("http api listening on http://{addr}");

    axum::serve(listener, router(state))
        .with_graceful_shutdown(cancel.cancelled_owned())
        .await?;

    info!("http api stopped");
    Ok(())
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::command::RecordingChannel;
    use crate::registry::DeviceRegistry;
    use crate::state::HubState;
    use crate::store::MemoryStore;
    use axum::body::Body;
    use axum::http::Request;
    use http_body_util::BodyExt;
    use std::sync::Arc;
    use time::macros::datetime;
    use tokio::sync::RwLock;
    use tower::ServiceExt;

    fn app() -> (Router, Arc<MemoryStore>) {
        let store = Arc::new(MemoryStore::new());
        let clock = ManualClock::new(datetime!(2024-05-01 06:00 UTC));
        let registry = Arc::new(DeviceRegistry::new(store.clone(), clock.clone()));
        let dispatcher = Dispatcher::new(
            registry.clone(),
            Arc::new(RecordingChannel::default()),
            clock,
        );
        let state = AppState {
            registry,
            dispatcher,
            shared: Arc::new(RwLock::new(HubState::new())),
        };
        (router(state), store)
    }

    async fn call(
        app: &Router,
        method: &str,
        uri: &str,
        body: Option<serde_json::Value>,
    ) -> (StatusCode, serde_json::Value) {
        let builder = Request::builder().method(method).uri(uri);
        let request = match body {
            Some(b) => builder
                .header("content-type", "application/json")
                .body(Body::from(b.to_string()))
                .unwrap(),
            None => builder.body(Body::empty()).unwrap(),
        };
        let response = app.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        let value = if bytes.is_empty() {
            serde_json::Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap_or(serde_json::Value::Null)
        };
        (status, value)
    }

    fn valve_body() -> serde_json::Value {
        json!({
            "name": "Main valve",
            "location": "Main line",
            "type": "valve",
            "data": { "isOpen": false, "openPercentage": 0.0 }
        })
    }

    fn sensor_body() -> serde_json::Value {
        json!({
            "name": "North sensor",
            "location": "North plot",
            "type": "sensor",
            "data": {
                "temperature": 28.5,
                "humidity": 65.0,
                "soilMoisture": 45.0,
                "lightLevel": 80.0
            }
        })
    }

    async fn register(app: &Router, body: serde_json::Value) -> String {
        let (status, device) = call(app, "POST", "/api/devices", Some(body)).await;
        assert_eq!(status, StatusCode::CREATED);
        device["id"].as_str().unwrap().to_string()
    }

    // -- registry routes ------------------------------------------------------

    #[tokio::test]
    async fn register_returns_offline_device() {
        let (app, _) = app();
        let (status, device) = call(&app, "POST", "/api/devices", Some(valve_body())).await;
        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(device["type"], "valve");
        assert_eq!(device["status"], "offline");
        assert_eq!(device["id"], "valve_1714543200000");
    }

    #[tokio::test]
    async fn register_normalizes_valve_state() {
        let (app, _) = app();
        let valve = |is_open: bool, open_percentage: f64| {
            json!({
                "name": "Main valve",
                "location": "Main line",
                "type": "valve",
                "data": { "isOpen": is_open, "openPercentage": open_percentage }
            })
        };

        let (status, wide) = call(&app, "POST", "/api/devices", Some(valve(false, 250.0))).await;
        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(wide["data"]["isOpen"], true);
        assert_eq!(wide["data"]["openPercentage"], 100.0);
        assert_eq!(wide["data"]["lastAction"], "2024-05-01T06:00:00Z");

        let (status, shut) = call(&app, "POST", "/api/devices", Some(valve(true, 0.0))).await;
        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(shut["data"]["isOpen"], false);
        assert_eq!(shut["data"]["openPercentage"], 0.0);
    }

    #[tokio::test]
    async fn register_mismatched_data_is_bad_request() {
        let (app, _) = app();
        let body = json!({
            "name": "Broken",
            "location": "Nowhere",
            "type": "camera",
            "data": { "isOpen": true, "openPercentage": 10.0 }
        });
        let (status, _) = call(&app, "POST", "/api/devices", Some(body)).await;
        assert!(status.is_client_error(), "got {status}");
    }

    #[tokio::test]
    async fn list_filters_by_type() {
        let (app, _) = app();
        register(&app, valve_body()).await;
        register(&app, sensor_body()).await;

        let (status, all) = call(&app, "GET", "/api/devices", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(all.as_array().unwrap().len(), 2);

        let (_, sensors) = call(&app, "GET", "/api/devices?type=sensor", None).await;
        let sensors = sensors.as_array().unwrap();
        assert_eq!(sensors.len(), 1);
        assert_eq!(sensors[0]["type"], "sensor");
    }

    #[tokio::test]
    async fn list_unknown_type_is_bad_request() {
        let (app, _) = app();
        let (status, _) = call(&app, "GET", "/api/devices?type=tractor", None).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn get_unknown_device_is_404() {
        let (app, _) = app();
        let (status, body) = call(&app, "GET", "/api/devices/valve_1", None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert!(body["error"].as_str().unwrap().contains("valve_1"));
    }

    #[tokio::test]
    async fn register_store_failure_is_500() {
        let (app, store) = app();
        store.set_fail_writes(true);
        let (status, _) = call(&app, "POST", "/api/devices", Some(valve_body())).await;
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
    }

    // -- command routes -------------------------------------------------------

    #[tokio::test]
    async fn valve_route_clamps_and_goes_online() {
        let (app, _) = app();
        let id = register(&app, valve_body()).await;

        let (status, body) = call(
            &app,
            "POST",
            &format!("/api/devices/{id}/valve"),
            Some(json!({ "openPercentage": 150 })),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["command"], "setPosition");
        assert_eq!(body["device"]["status"], "online");
        assert_eq!(body["device"]["data"]["openPercentage"], 100.0);
        assert_eq!(body["device"]["data"]["isOpen"], true);
        assert!(body.get("warning").is_none());
    }

    #[tokio::test]
    async fn camera_route_on_valve_is_409() {
        let (app, _) = app();
        let id = register(&app, valve_body()).await;
        let (status, _) = call(
            &app,
            "POST",
            &format!("/api/devices/{id}/camera"),
            Some(json!({ "action": "record" })),
        )
        .await;
        assert_eq!(status, StatusCode::CONFLICT);
    }

    #[tokio::test]
    async fn irrigation_route_rejects_unknown_action() {
        let (app, _) = app();
        let (status, _) = call(
            &app,
            "POST",
            "/api/devices/irrigation_1/irrigation",
            Some(json!({ "action": "flood" })),
        )
        .await;
        assert!(status.is_client_error(), "got {status}");
    }

    #[tokio::test]
    async fn sensors_route_returns_cached_reading() {
        let (app, _) = app();
        let id = register(&app, sensor_body()).await;
        let (status, body) = call(&app, "GET", &format!("/api/devices/{id}/sensors"), None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["data"]["temperature"], 28.5);
    }

    // -- status ---------------------------------------------------------------

    #[tokio::test]
    async fn status_reports_counts_and_events() {
        let (app, _) = app();
        let id = register(&app, valve_body()).await;
        call(
            &app,
            "POST",
            &format!("/api/devices/{id}/valve"),
            Some(json!({ "openPercentage": 20 })),
        )
        .await;

        let (status, body) = call(&app, "GET", "/api/status", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["deviceCount"], 1);
        assert_eq!(body["byStatus"]["online"], 1);
        assert_eq!(body["events"][0]["kind"], "command");
        assert_eq!(body["events"][1]["kind"], "registered");
    }
}
