// HTTP Control Surface — spec §6, transport layer.
//
// Thin axum wrapper over `control::ControlSurface`: one route per
// operation, JSON in/out, `MappingError` folded into a status code +
// body the way the teacher's handlers fold `anyhow::Error` into
// `(StatusCode, Json(...))`. The SSE status stream reuses the
// teacher's `config_events` idiom (`State<broadcast::Sender<()>>` +
// `async_stream::stream!` + `Sse::new(...).keep_alive(...)`), fed here
// by `ControlSurface::change_tx` instead of a file-watcher.
//
// No TLS, no basic auth, no static asset serving: this crate has no
// bundled frontend, unlike the teacher's bandwidth dashboard.

use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::{Path as AxumPath, State};
use axum::http::StatusCode;
use axum::response::sse::{Event as SseEvent, KeepAlive, Sse};
use axum::response::{IntoResponse, Json};
use axum::routing::{delete, get, post, put};
use axum::Router;
use futures::stream::Stream;
use serde::Deserialize;
use serde_json::{json, Value};
use tower_http::cors::CorsLayer;

use crate::control::ControlSurface;
use crate::error::{ErrorKind, MappingError};

fn status_for(kind: ErrorKind) -> StatusCode {
    match kind {
        ErrorKind::InvalidInput | ErrorKind::InvalidGeometry => StatusCode::BAD_REQUEST,
        ErrorKind::InsufficientCoverage => StatusCode::UNPROCESSABLE_ENTITY,
        ErrorKind::NotFound => StatusCode::NOT_FOUND,
        ErrorKind::DeviceUnavailable => StatusCode::SERVICE_UNAVAILABLE,
        ErrorKind::Conflict => StatusCode::CONFLICT,
        ErrorKind::Internal => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

fn mapping_err_response(err: MappingError) -> axum::response::Response {
    (
        status_for(err.kind),
        Json(json!({
            "error": err.kind.to_string(),
            "message": err.message,
            "field": err.field,
        })),
    )
        .into_response()
}

fn anyhow_err_response(err: anyhow::Error) -> axum::response::Response {
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(json!({ "error": "internal", "message": err.to_string() })),
    )
        .into_response()
}

fn ok_json(value: Value) -> axum::response::Response {
    (StatusCode::OK, Json(value)).into_response()
}

// ---- calibration ----

async fn get_canonical_mapping(State(cs): State<Arc<ControlSurface>>) -> axum::response::Response {
    ok_json(cs.get_canonical_mapping())
}

#[derive(Deserialize)]
struct LedBound {
    value: u16,
}

async fn set_start_led(
    State(cs): State<Arc<ControlSurface>>,
    Json(body): Json<LedBound>,
) -> axum::response::Response {
    match cs.set_start_led(body.value) {
        Ok(()) => ok_json(cs.get_canonical_mapping()),
        Err(e) => mapping_err_response(e),
    }
}

async fn set_end_led(
    State(cs): State<Arc<ControlSurface>>,
    Json(body): Json<LedBound>,
) -> axum::response::Response {
    match cs.set_end_led(body.value) {
        Ok(()) => ok_json(cs.get_canonical_mapping()),
        Err(e) => mapping_err_response(e),
    }
}

#[derive(Deserialize)]
struct KeyOffsetBody {
    midi_note: u8,
    offset: i32,
}

async fn set_key_offset(
    State(cs): State<Arc<ControlSurface>>,
    Json(body): Json<KeyOffsetBody>,
) -> axum::response::Response {
    match cs.set_key_offset(body.midi_note, body.offset) {
        Ok(()) => ok_json(cs.get_canonical_mapping()),
        Err(e) => mapping_err_response(e),
    }
}

async fn delete_key_offset(
    State(cs): State<Arc<ControlSurface>>,
    AxumPath(midi_note): AxumPath<u8>,
) -> axum::response::Response {
    match cs.delete_key_offset(midi_note) {
        Ok(()) => ok_json(cs.get_canonical_mapping()),
        Err(e) => mapping_err_response(e),
    }
}

#[derive(Deserialize)]
struct AllKeyOffsetsBody {
    offsets: std::collections::BTreeMap<String, i32>,
}

async fn set_all_key_offsets(
    State(cs): State<Arc<ControlSurface>>,
    Json(body): Json<AllKeyOffsetsBody>,
) -> axum::response::Response {
    match cs.set_all_key_offsets(body.offsets) {
        Ok(()) => ok_json(cs.get_canonical_mapping()),
        Err(e) => mapping_err_response(e),
    }
}

async fn reset_calibration(State(cs): State<Arc<ControlSurface>>) -> axum::response::Response {
    match cs.reset_calibration() {
        Ok(()) => ok_json(cs.get_canonical_mapping()),
        Err(e) => mapping_err_response(e),
    }
}

#[derive(Deserialize)]
struct DistributionModeBody {
    mode: String,
}

async fn set_distribution_mode(
    State(cs): State<Arc<ControlSurface>>,
    Json(body): Json<DistributionModeBody>,
) -> axum::response::Response {
    match cs.set_distribution_mode(&body.mode) {
        Ok(()) => ok_json(cs.get_canonical_mapping()),
        Err(e) => mapping_err_response(e),
    }
}

#[derive(Deserialize, Default)]
struct PhysicsParamsBody {
    white_key_width: Option<f32>,
    black_key_width: Option<f32>,
    white_key_gap: Option<f32>,
    led_physical_width: Option<f32>,
    overhang_threshold_mm: Option<f32>,
}

async fn set_physics_parameters(
    State(cs): State<Arc<ControlSurface>>,
    Json(body): Json<PhysicsParamsBody>,
) -> axum::response::Response {
    match cs.set_physics_parameters(
        body.white_key_width,
        body.black_key_width,
        body.white_key_gap,
        body.led_physical_width,
        body.overhang_threshold_mm,
    ) {
        Ok(()) => ok_json(cs.get_canonical_mapping()),
        Err(e) => mapping_err_response(e),
    }
}

// ---- calibration.soldering_joints ----

async fn joints_list(State(cs): State<Arc<ControlSurface>>) -> axum::response::Response {
    ok_json(json!(cs.joints_list()))
}

async fn joints_get(
    State(cs): State<Arc<ControlSurface>>,
    AxumPath(led_index): AxumPath<u16>,
) -> axum::response::Response {
    match cs.joints_get(led_index) {
        Ok(joint) => ok_json(json!(joint)),
        Err(e) => mapping_err_response(e),
    }
}

#[derive(Deserialize)]
struct JointBody {
    width_mm: f64,
    offset_mm: f64,
    description: Option<String>,
}

async fn joints_set(
    State(cs): State<Arc<ControlSurface>>,
    AxumPath(led_index): AxumPath<u16>,
    Json(body): Json<JointBody>,
) -> axum::response::Response {
    match cs.joints_set(led_index, body.width_mm, body.offset_mm, body.description) {
        Ok(()) => ok_json(json!({ "ok": true })),
        Err(e) => mapping_err_response(e),
    }
}

async fn joints_delete(
    State(cs): State<Arc<ControlSurface>>,
    AxumPath(led_index): AxumPath<u16>,
) -> axum::response::Response {
    match cs.joints_delete(led_index) {
        Ok(()) => ok_json(json!({ "ok": true })),
        Err(e) => mapping_err_response(e),
    }
}

#[derive(Deserialize)]
struct JointsBulkBody {
    mode: String,
    joints: std::collections::BTreeMap<String, crate::settings::SolderJointSetting>,
}

async fn joints_bulk_set(
    State(cs): State<Arc<ControlSurface>>,
    Json(body): Json<JointsBulkBody>,
) -> axum::response::Response {
    match cs.joints_bulk_set(&body.mode, body.joints) {
        Ok(()) => ok_json(json!({ "ok": true })),
        Err(e) => mapping_err_response(e),
    }
}

async fn joints_clear_all(State(cs): State<Arc<ControlSurface>>) -> axum::response::Response {
    match cs.joints_clear_all() {
        Ok(()) => ok_json(json!({ "ok": true })),
        Err(e) => mapping_err_response(e),
    }
}

#[derive(Deserialize)]
struct JointsConvertBody {
    value: f64,
    from: String,
    to: String,
}

async fn joints_convert(
    State(cs): State<Arc<ControlSurface>>,
    Json(body): Json<JointsConvertBody>,
) -> axum::response::Response {
    match cs.joints_convert(body.value, &body.from, &body.to) {
        Ok(value) => ok_json(json!({ "value": value })),
        Err(e) => mapping_err_response(e),
    }
}

#[derive(Deserialize)]
struct JointsValidateBody {
    width_mm: f64,
    offset_mm: f64,
}

async fn joints_validate(
    State(cs): State<Arc<ControlSurface>>,
    Json(body): Json<JointsValidateBody>,
) -> axum::response::Response {
    ok_json(json!({ "issues": cs.joints_validate(body.width_mm, body.offset_mm) }))
}

// ---- calibration.led_selection ----

async fn selection_get_all(State(cs): State<Arc<ControlSurface>>) -> axum::response::Response {
    ok_json(json!(cs.selection_get_all()))
}

async fn selection_get(
    State(cs): State<Arc<ControlSurface>>,
    AxumPath(midi_note): AxumPath<u8>,
) -> axum::response::Response {
    match cs.selection_get(midi_note) {
        Some(leds) => ok_json(json!({ "leds": leds })),
        None => (StatusCode::NOT_FOUND, Json(json!({ "error": "not_found" }))).into_response(),
    }
}

#[derive(Deserialize)]
struct SelectionSetBody {
    leds: Vec<u16>,
}

async fn selection_set(
    State(cs): State<Arc<ControlSurface>>,
    AxumPath(midi_note): AxumPath<u8>,
    Json(body): Json<SelectionSetBody>,
) -> axum::response::Response {
    match cs.selection_set(midi_note, body.leds) {
        Ok(()) => ok_json(json!({ "ok": true })),
        Err(e) => mapping_err_response(e),
    }
}

async fn selection_clear(
    State(cs): State<Arc<ControlSurface>>,
    AxumPath(midi_note): AxumPath<u8>,
) -> axum::response::Response {
    match cs.selection_clear(midi_note) {
        Ok(()) => ok_json(json!({ "ok": true })),
        Err(e) => mapping_err_response(e),
    }
}

async fn selection_toggle(
    State(cs): State<Arc<ControlSurface>>,
    AxumPath((midi_note, led_index)): AxumPath<(u8, u16)>,
) -> axum::response::Response {
    match cs.selection_toggle(midi_note, led_index) {
        Ok(()) => ok_json(json!({ "ok": true })),
        Err(e) => mapping_err_response(e),
    }
}

async fn selection_clear_all(State(cs): State<Arc<ControlSurface>>) -> axum::response::Response {
    match cs.selection_clear_all() {
        Ok(()) => ok_json(json!({ "ok": true })),
        Err(e) => mapping_err_response(e),
    }
}

async fn test_led(
    State(cs): State<Arc<ControlSurface>>,
    AxumPath(index): AxumPath<usize>,
) -> axum::response::Response {
    match cs.test_led(index) {
        Ok(()) => ok_json(json!({ "ok": true })),
        Err(e) => anyhow_err_response(e),
    }
}

// ---- playback ----

#[derive(Deserialize)]
struct PlaybackLoadBody {
    path: String,
}

async fn playback_load(
    State(cs): State<Arc<ControlSurface>>,
    Json(body): Json<PlaybackLoadBody>,
) -> axum::response::Response {
    match cs.playback_load(std::path::Path::new(&body.path)) {
        Ok(()) => ok_json(cs.playback_status()),
        Err(e) => anyhow_err_response(e),
    }
}

async fn playback_play(State(cs): State<Arc<ControlSurface>>) -> axum::response::Response {
    cs.playback_play();
    ok_json(cs.playback_status())
}

async fn playback_pause(State(cs): State<Arc<ControlSurface>>) -> axum::response::Response {
    cs.playback_pause();
    ok_json(cs.playback_status())
}

async fn playback_stop(State(cs): State<Arc<ControlSurface>>) -> axum::response::Response {
    cs.playback_stop();
    ok_json(cs.playback_status())
}

#[derive(Deserialize)]
struct SeekBody {
    seconds: f64,
}

async fn playback_seek(
    State(cs): State<Arc<ControlSurface>>,
    Json(body): Json<SeekBody>,
) -> axum::response::Response {
    cs.playback_seek(body.seconds);
    ok_json(cs.playback_status())
}

#[derive(Deserialize)]
struct TempoBody {
    multiplier: f64,
}

async fn playback_set_tempo(
    State(cs): State<Arc<ControlSurface>>,
    Json(body): Json<TempoBody>,
) -> axum::response::Response {
    cs.playback_set_tempo(body.multiplier);
    ok_json(cs.playback_status())
}

#[derive(Deserialize)]
struct VolumeBody {
    volume: f64,
}

async fn playback_set_volume(
    State(cs): State<Arc<ControlSurface>>,
    Json(body): Json<VolumeBody>,
) -> axum::response::Response {
    cs.playback_set_volume(body.volume);
    ok_json(cs.playback_status())
}

#[derive(Deserialize)]
struct LoopBody {
    enabled: bool,
    start: f64,
    end: f64,
}

async fn playback_set_loop(
    State(cs): State<Arc<ControlSurface>>,
    Json(body): Json<LoopBody>,
) -> axum::response::Response {
    cs.playback_set_loop(body.enabled, body.start, body.end);
    ok_json(cs.playback_status())
}

async fn playback_status(State(cs): State<Arc<ControlSurface>>) -> axum::response::Response {
    ok_json(cs.playback_status())
}

// ---- learning ----

async fn learning_get_options(State(cs): State<Arc<ControlSurface>>) -> axum::response::Response {
    ok_json(cs.learning_get_options())
}

#[derive(Deserialize, Default)]
struct LearningOptionsBody {
    left_wait: Option<bool>,
    right_wait: Option<bool>,
    timing_window_ms: Option<u16>,
}

async fn learning_set_options(
    State(cs): State<Arc<ControlSurface>>,
    Json(body): Json<LearningOptionsBody>,
) -> axum::response::Response {
    match cs.learning_set_options(body.left_wait, body.right_wait, body.timing_window_ms) {
        Ok(()) => ok_json(cs.learning_get_options()),
        Err(e) => mapping_err_response(e),
    }
}

// ---- midi_input ----

async fn midi_list_devices(State(cs): State<Arc<ControlSurface>>) -> axum::response::Response {
    match cs.midi_list_devices() {
        Ok(devices) => ok_json(json!({ "devices": devices })),
        Err(e) => anyhow_err_response(e),
    }
}

#[derive(Deserialize, Default)]
struct MidiStartBody {
    device: Option<String>,
}

async fn midi_start(
    State(cs): State<Arc<ControlSurface>>,
    Json(body): Json<MidiStartBody>,
) -> axum::response::Response {
    match cs.midi_start(body.device.as_deref()) {
        Ok(()) => ok_json(cs.midi_status()),
        Err(e) => anyhow_err_response(e),
    }
}

async fn midi_stop(State(cs): State<Arc<ControlSurface>>) -> axum::response::Response {
    cs.midi_stop();
    ok_json(cs.midi_status())
}

#[derive(Deserialize, Default)]
struct MidiRestartBody {
    #[serde(default)]
    reason: String,
}

async fn midi_restart(
    State(cs): State<Arc<ControlSurface>>,
    Json(body): Json<MidiRestartBody>,
) -> axum::response::Response {
    match cs.midi_restart(&body.reason) {
        Ok(()) => ok_json(cs.midi_status()),
        Err(e) => anyhow_err_response(e),
    }
}

async fn midi_status(State(cs): State<Arc<ControlSurface>>) -> axum::response::Response {
    ok_json(cs.midi_status())
}

// ---- status SSE stream ----

async fn status_events(
    State(cs): State<Arc<ControlSurface>>,
) -> Sse<impl Stream<Item = Result<SseEvent, Infallible>>> {
    let mut rx = cs.change_tx.subscribe();
    let stream = async_stream::stream! {
        loop {
            match rx.recv().await {
                Ok(()) => yield Ok(SseEvent::default().event("mapping_changed").data("{}")),
                Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => continue,
                Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
            }
        }
    };
    Sse::new(stream).keep_alive(KeepAlive::new().interval(Duration::from_secs(15)))
}

async fn health() -> axum::response::Response {
    ok_json(json!({ "status": "ok" }))
}

pub fn build_router(control: Arc<ControlSurface>) -> Router {
    Router::new()
        .route("/api/health", get(health))
        .route("/api/status/events", get(status_events))
        .route("/api/calibration/mapping", get(get_canonical_mapping))
        .route("/api/calibration/start_led", put(set_start_led))
        .route("/api/calibration/end_led", put(set_end_led))
        .route("/api/calibration/key_offset", put(set_key_offset))
        .route("/api/calibration/key_offset/:midi_note", delete(delete_key_offset))
        .route("/api/calibration/key_offsets", put(set_all_key_offsets))
        .route("/api/calibration/reset", post(reset_calibration))
        .route("/api/calibration/distribution_mode", put(set_distribution_mode))
        .route("/api/calibration/physics_parameters", put(set_physics_parameters))
        .route("/api/calibration/soldering_joints", get(joints_list).put(joints_bulk_set))
        .route("/api/calibration/soldering_joints/clear", post(joints_clear_all))
        .route("/api/calibration/soldering_joints/convert", post(joints_convert))
        .route("/api/calibration/soldering_joints/validate", post(joints_validate))
        .route(
            "/api/calibration/soldering_joints/:led_index",
            get(joints_get).put(joints_set).delete(joints_delete),
        )
        .route("/api/calibration/led_selection", get(selection_get_all))
        .route("/api/calibration/led_selection/clear", post(selection_clear_all))
        .route(
            "/api/calibration/led_selection/:midi_note",
            get(selection_get).put(selection_set).delete(selection_clear),
        )
        .route(
            "/api/calibration/led_selection/:midi_note/toggle/:led_index",
            post(selection_toggle),
        )
        .route("/api/calibration/test_led/:index", post(test_led))
        .route("/api/playback/load", post(playback_load))
        .route("/api/playback/play", post(playback_play))
        .route("/api/playback/pause", post(playback_pause))
        .route("/api/playback/stop", post(playback_stop))
        .route("/api/playback/seek", post(playback_seek))
        .route("/api/playback/tempo", put(playback_set_tempo))
        .route("/api/playback/volume", put(playback_set_volume))
        .route("/api/playback/loop", put(playback_set_loop))
        .route("/api/playback/status", get(playback_status))
        .route(
            "/api/learning/options",
            get(learning_get_options).put(learning_set_options),
        )
        .route("/api/midi_input/devices", get(midi_list_devices))
        .route("/api/midi_input/start", post(midi_start))
        .route("/api/midi_input/stop", post(midi_stop))
        .route("/api/midi_input/restart", post(midi_restart))
        .route("/api/midi_input/status", get(midi_status))
        .layer(CorsLayer::permissive())
        .with_state(control)
}

/// Binds and serves the control surface on `bind_addr` until the
/// process is asked to shut down. Matches the teacher's
/// `run_http_server` entry point shape, minus the TLS branch.
pub async fn run_http_server(bind_addr: &str, control: Arc<ControlSurface>) -> anyhow::Result<()> {
    let app = build_router(control);
    let listener = tokio::net::TcpListener::bind(bind_addr).await?;
    println!("HTTP control surface listening on {}", bind_addr);
    axum::serve(listener, app).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_codes_map_error_kinds_as_expected() {
        assert_eq!(status_for(ErrorKind::NotFound), StatusCode::NOT_FOUND);
        assert_eq!(status_for(ErrorKind::InvalidInput), StatusCode::BAD_REQUEST);
        assert_eq!(status_for(ErrorKind::Conflict), StatusCode::CONFLICT);
        assert_eq!(
            status_for(ErrorKind::DeviceUnavailable),
            StatusCode::SERVICE_UNAVAILABLE
        );
    }
}
