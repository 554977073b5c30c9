use std::borrow::Cow;
use std::io::Read;
use std::net::{IpAddr, Ipv6Addr};
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::RecvTimeoutError;
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tiny_http::{Header, Method, Response, Server, StatusCode};
use tracing::{debug, error, info, warn};

use crate::clock::Clock;
use crate::playback::{ActivityFlag, PlaybackQueue};
use crate::schedule::manager::{CreateOptions, CreateOutcome, ScheduleError, ScheduleManager};
use crate::schedule::model::{AudioReference, NewSchedule, ScheduleId, ScheduleWithAudio, every, first_trigger_at};
use crate::trigger::timer::TimerScheduler;

const MAX_BODY_BYTES: u64 = 64 * 1024;
const POLL_INTERVAL: Duration = Duration::from_millis(200);

/// Latest schedule list seen on the store's watch stream.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ScheduleSnapshot {
    pub revision: u64,
    pub schedules: Vec<ScheduleWithAudio>,
}

/// Services the HTTP handlers act on.
#[derive(Clone)]
pub struct ApiContext {
    pub manager: Arc<ScheduleManager>,
    pub playback: Arc<PlaybackQueue>,
    pub timer: Arc<TimerScheduler>,
    pub keep_alive: ActivityFlag,
    pub clock: Arc<dyn Clock>,
}

#[derive(Debug, Clone)]
pub struct ApiServerConfig {
    pub bind_addr: String,
    pub port: u16,
}

pub struct ApiServer {
    pub snapshot: Arc<Mutex<ScheduleSnapshot>>,
    stop: Arc<AtomicBool>,
    http_join: Option<JoinHandle<()>>,
    watch_join: Option<JoinHandle<()>>,
}

impl ApiServer {
    pub fn start(config: ApiServerConfig, context: ApiContext) -> Result<Self> {
        let bind = format!("{}:{}", config.bind_addr, config.port);
        let server = Server::http(&bind).map_err(|err| anyhow::anyhow!("failed to start API server on {bind}: {err}"))?;
        let snapshot = Arc::new(Mutex::new(ScheduleSnapshot::default()));
        let stop = Arc::new(AtomicBool::new(false));

        let watch_join = {
            let manager = Arc::clone(&context.manager);
            let snapshot = Arc::clone(&snapshot);
            let stop = Arc::clone(&stop);
            thread::spawn(move || run_watch_loop(&manager, &snapshot, &stop))
        };
        let http_join = {
            let snapshot = Arc::clone(&snapshot);
            let stop = Arc::clone(&stop);
            thread::spawn(move || run_server_loop(server, context, snapshot, stop))
        };
        info!(%bind, "API listening");

        Ok(Self {
            snapshot,
            stop,
            http_join: Some(http_join),
            watch_join: Some(watch_join),
        })
    }
}

impl Drop for ApiServer {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::Relaxed);
        if let Some(join) = self.http_join.take() {
            let _ = join.join();
        }
        if let Some(join) = self.watch_join.take() {
            let _ = join.join();
        }
    }
}

fn lock_snapshot(snapshot: &Mutex<ScheduleSnapshot>) -> MutexGuard<'_, ScheduleSnapshot> {
    snapshot.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn run_watch_loop(manager: &ScheduleManager, snapshot: &Mutex<ScheduleSnapshot>, stop: &AtomicBool) {
    let watch = manager.watch();
    while !stop.load(Ordering::Relaxed) {
        match watch.recv_timeout(POLL_INTERVAL) {
            Ok(schedules) => {
                let schedules = watch.latest().unwrap_or(schedules);
                let mut guard = lock_snapshot(snapshot);
                guard.revision += 1;
                guard.schedules = schedules;
                debug!(revision = guard.revision, count = guard.schedules.len(), "schedule snapshot updated");
            }
            Err(RecvTimeoutError::Timeout) => continue,
            Err(RecvTimeoutError::Disconnected) => break,
        }
    }
}

fn run_server_loop(server: Server, context: ApiContext, snapshot: Arc<Mutex<ScheduleSnapshot>>, stop: Arc<AtomicBool>) {
    while !stop.load(Ordering::Relaxed) {
        match server.recv_timeout(POLL_INTERVAL) {
            Ok(Some(request)) => handle_request(request, &context, &snapshot),
            Ok(None) => continue,
            Err(_) => continue,
        }
    }
}

#[derive(Debug)]
enum ApiReply {
    Json(u16, Value),
    Text(u16, &'static str),
}

fn handle_request(mut request: tiny_http::Request, context: &ApiContext, snapshot: &Mutex<ScheduleSnapshot>) {
    let Some(remote_addr) = request.remote_addr() else {
        let _ = send_text(request, StatusCode(400), "missing remote address");
        return;
    };
    if !is_local_network_ip(remote_addr.ip()) {
        let _ = send_text(request, StatusCode(403), "forbidden: local network only");
        return;
    }

    let mut body = String::new();
    if request
        .as_reader()
        .take(MAX_BODY_BYTES)
        .read_to_string(&mut body)
        .is_err()
    {
        let _ = send_text(request, StatusCode(400), "request body is not valid UTF-8");
        return;
    }

    let method = request.method().clone();
    let url = request.url().to_string();
    debug!(%method, %url, "API request");
    let reply = route(context, snapshot, &method, &url, &body, &request_base_url(&request));
    let sent = match reply {
        ApiReply::Json(status, payload) => send_json(request, StatusCode(status), &payload),
        ApiReply::Text(status, text) => send_text(request, StatusCode(status), text),
    };
    if let Err(err) = sent {
        warn!(error = %format!("{err:#}"), "failed to send API response");
    }
}

fn route(
    context: &ApiContext,
    snapshot: &Mutex<ScheduleSnapshot>,
    method: &Method,
    url: &str,
    body: &str,
    base_url: &str,
) -> ApiReply {
    let (path, query) = split_path_query(url);
    let segments = path.trim_matches('/').split('/').collect::<Vec<_>>();
    let result = match (method, segments.as_slice()) {
        (Method::Get, ["healthz"]) => return ApiReply::Text(200, "ok"),
        (Method::Get, ["v1"]) => Ok(api_index(base_url)),
        (Method::Get, ["v1", "schedules"]) => serde_json::to_value(&*lock_snapshot(snapshot))
            .map(|payload| ApiReply::Json(200, payload))
            .context("serializing schedule snapshot"),
        (Method::Post, ["v1", "schedules"]) => create_schedule(context, body),
        (Method::Delete, ["v1", "schedules"]) => delete_all_schedules(context),
        (Method::Delete, ["v1", "schedules", id]) => delete_schedule(context, id),
        (Method::Post, ["v1", "schedules", id, "cancel"]) => cancel_schedule(context, id),
        (Method::Delete, ["v1", "audio"]) => delete_audio_schedules(context, query),
        (Method::Post, ["v1", "alarms", toggle @ ("enable" | "disable")]) => set_alarms(context, *toggle == "enable"),
        (Method::Post, ["v1", "permissions", "precise-timing"]) => grant_precise_timing(context),
        (Method::Get, ["v1", "playback"]) => Ok(playback_state(context)),
        (Method::Post, ["v1", "playback", "enqueue"]) => enqueue_playback(context, body),
        (Method::Post, ["v1", "playback", "stop"]) => {
            context.playback.stop();
            Ok(ApiReply::Json(200, json!({ "stopped": true })))
        }
        (_, segments) if is_known_route(segments) => return ApiReply::Text(405, "method not allowed"),
        _ => return ApiReply::Text(404, "not found"),
    };
    result.unwrap_or_else(|err| {
        error!(error = %format!("{err:#}"), path, "API request failed");
        ApiReply::Json(500, json!({ "error": "internal", "message": format!("{err:#}") }))
    })
}

fn is_known_route(segments: &[&str]) -> bool {
    matches!(
        segments,
        ["healthz"]
            | ["v1"]
            | ["v1", "schedules"]
            | ["v1", "schedules", _]
            | ["v1", "schedules", _, "cancel"]
            | ["v1", "audio"]
            | ["v1", "alarms", "enable" | "disable"]
            | ["v1", "permissions", "precise-timing"]
            | ["v1", "playback"]
            | ["v1", "playback", "enqueue" | "stop"]
    )
}

fn api_index(base_url: &str) -> ApiReply {
    ApiReply::Json(
        200,
        json!({
            "api_base": base_url,
            "health_url": format!("{base_url}/healthz"),
            "schedules_url": format!("{base_url}/v1/schedules"),
            "alarms_enable_url": format!("{base_url}/v1/alarms/enable"),
            "alarms_disable_url": format!("{base_url}/v1/alarms/disable"),
            "precise_timing_url": format!("{base_url}/v1/permissions/precise-timing"),
            "playback_url": format!("{base_url}/v1/playback"),
        }),
    )
}

#[derive(Debug, Deserialize)]
struct CreateScheduleRequest {
    trigger_time_ms: Option<i64>,
    /// Either the raw interval or `repeat_hours`/`repeat_minutes`.
    repeat_interval_ms: Option<u64>,
    #[serde(default)]
    repeat_hours: u64,
    #[serde(default)]
    repeat_minutes: u64,
    audio_paths: Vec<String>,
    #[serde(default)]
    allow_overlap: bool,
    #[serde(default)]
    replace_existing: bool,
}

#[derive(Debug, Deserialize)]
struct EnqueueRequest {
    paths: Vec<String>,
}

fn bad_request(message: impl Into<String>) -> ApiReply {
    ApiReply::Json(400, json!({ "error": "bad_request", "message": message.into() }))
}

fn create_schedule(context: &ApiContext, body: &str) -> Result<ApiReply> {
    let request = match serde_json::from_str::<CreateScheduleRequest>(body) {
        Ok(request) => request,
        Err(err) => return Ok(bad_request(format!("invalid schedule request: {err}"))),
    };
    let repeat_interval_ms = match request.repeat_interval_ms {
        Some(interval) => interval,
        None => every(request.repeat_hours, request.repeat_minutes).unwrap_or(0),
    };
    let candidate = NewSchedule {
        trigger_time_ms: request
            .trigger_time_ms
            .unwrap_or_else(|| first_trigger_at(context.clock.now_ms())),
        repeat_interval_ms,
    };
    let audio = request
        .audio_paths
        .into_iter()
        .map(AudioReference::from_path)
        .collect::<Vec<_>>();
    let options = CreateOptions {
        allow_overlap: request.allow_overlap,
        replace_existing: request.replace_existing,
    };

    match context.manager.create(candidate, audio, options) {
        Ok(CreateOutcome::Created { schedule, armed }) => {
            Ok(ApiReply::Json(201, json!({ "schedule": schedule, "armed": armed })))
        }
        Ok(CreateOutcome::OverlapConflict { existing }) => {
            Ok(ApiReply::Json(409, json!({ "conflict": "overlap", "existing": existing })))
        }
        Ok(CreateOutcome::ReplaceConflict { existing }) => {
            Ok(ApiReply::Json(409, json!({ "conflict": "replace", "existing": existing })))
        }
        Err(ScheduleError::SchedulingDenied { id, reason }) => Ok(ApiReply::Json(
            403,
            json!({ "error": "scheduling_denied", "id": id, "reason": reason }),
        )),
        Err(ScheduleError::InvalidSchedule(message)) => Ok(bad_request(message)),
        Err(err) => Err(err).context("creating schedule"),
    }
}

fn delete_schedule(context: &ApiContext, raw_id: &str) -> Result<ApiReply> {
    let Ok(id) = raw_id.parse::<u64>().map(ScheduleId) else {
        return Ok(bad_request(format!("invalid schedule id: {raw_id}")));
    };
    let Some(entry) = context.manager.get(id).context("loading schedule")? else {
        return Ok(ApiReply::Json(404, json!({ "error": "not_found", "id": id })));
    };
    if context.playback.is_playing_any(&entry.audio_paths()) {
        info!(%id, "stopping playback of a schedule being deleted");
        context.playback.stop();
    }
    match context.manager.delete_schedule_and_cancel_alarm(id) {
        Ok(()) => Ok(ApiReply::Json(200, json!({ "deleted": id }))),
        Err(ScheduleError::NotFound(id)) => Ok(ApiReply::Json(404, json!({ "error": "not_found", "id": id }))),
        Err(err) => Err(err).context("deleting schedule"),
    }
}

/// Disarms the trigger but keeps the schedule; the next reschedule re-arms it.
fn cancel_schedule(context: &ApiContext, raw_id: &str) -> Result<ApiReply> {
    let Ok(id) = raw_id.parse::<u64>().map(ScheduleId) else {
        return Ok(bad_request(format!("invalid schedule id: {raw_id}")));
    };
    let Some(entry) = context.manager.get(id).context("loading schedule")? else {
        return Ok(ApiReply::Json(404, json!({ "error": "not_found", "id": id })));
    };
    context.manager.cancel(&entry.schedule);
    Ok(ApiReply::Json(200, json!({ "cancelled": id })))
}

/// Removes every schedule that plays the file at `?path=`.
fn delete_audio_schedules(context: &ApiContext, query: &str) -> Result<ApiReply> {
    let Some(raw) = query_param(query, "path").filter(|raw| !raw.is_empty()) else {
        return Ok(bad_request("missing path query parameter"));
    };
    let Ok(path) = decode_query_value(raw) else {
        return Ok(bad_request("path query parameter is not valid UTF-8"));
    };
    if context.playback.is_playing_any(std::slice::from_ref(&path)) {
        context.playback.stop();
    }
    let deleted = context
        .manager
        .delete_schedules_by_file_path(&path)
        .context("deleting schedules by file")?;
    Ok(ApiReply::Json(200, json!({ "path": path, "deleted": deleted })))
}

fn delete_all_schedules(context: &ApiContext) -> Result<ApiReply> {
    context.playback.stop();
    let deleted = context.manager.delete_all().context("deleting all schedules")?;
    Ok(ApiReply::Json(200, json!({ "deleted": deleted })))
}

/// The toggle is persisted before replying; re-arming or cancelling runs on
/// the manager's worker thread and shows up in `GET /v1/schedules`.
fn set_alarms(context: &ApiContext, enabled: bool) -> Result<ApiReply> {
    context
        .manager
        .set_alarms_enabled(enabled)
        .context("saving alarm toggle")?;
    Ok(ApiReply::Json(202, json!({ "alarms_enabled": enabled })))
}

fn grant_precise_timing(context: &ApiContext) -> Result<ApiReply> {
    context.timer.grant_precise_timing();
    let enabled = context.manager.alarms_enabled().context("loading alarm toggle")?;
    let report = if enabled {
        Some(context.manager.reschedule_all().context("rescheduling after grant")?)
    } else {
        None
    };
    Ok(ApiReply::Json(200, json!({ "granted": true, "report": report })))
}

fn playback_state(context: &ApiContext) -> ApiReply {
    let session = context.playback.session();
    ApiReply::Json(
        200,
        json!({
            "current_file": session.current_file(),
            "session": session,
            "keep_alive_active": context.keep_alive.is_active(),
            "keep_alive_acquisitions": context.keep_alive.acquisitions(),
        }),
    )
}

fn enqueue_playback(context: &ApiContext, body: &str) -> Result<ApiReply> {
    let request = match serde_json::from_str::<EnqueueRequest>(body) {
        Ok(request) => request,
        Err(err) => return Ok(bad_request(format!("invalid enqueue request: {err}"))),
    };
    if request.paths.is_empty() {
        return Ok(bad_request("paths must not be empty"));
    }
    let queued = request.paths.len();
    context.playback.enqueue(request.paths);
    Ok(ApiReply::Json(202, json!({ "queued": queued })))
}

fn send_json<T: Serialize>(request: tiny_http::Request, status: StatusCode, body: &T) -> Result<()> {
    let payload = serde_json::to_vec(body)?;
    let content_type = Header::from_str("Content-Type: application/json; charset=utf-8")
        .map_err(|_| anyhow::anyhow!("failed to build content-type header"))?;
    request.respond(
        Response::from_data(payload)
            .with_status_code(status)
            .with_header(content_type),
    )?;
    Ok(())
}

fn send_text(request: tiny_http::Request, status: StatusCode, body: &str) -> Result<()> {
    let content_type = Header::from_str("Content-Type: text/plain; charset=utf-8")
        .map_err(|_| anyhow::anyhow!("failed to build content-type header"))?;
    request.respond(
        Response::from_string(body.to_string())
            .with_status_code(status)
            .with_header(content_type),
    )?;
    Ok(())
}

fn split_path_query(url: &str) -> (&str, &str) {
    match url.split_once('?') {
        Some((path, query)) => (path, query),
        None => (url, ""),
    }
}

fn query_param<'a>(query: &'a str, key: &str) -> Option<&'a str> {
    for pair in query.split('&') {
        if pair.is_empty() {
            continue;
        }
        let (k, v) = match pair.split_once('=') {
            Some((k, v)) => (k, v),
            None => (pair, ""),
        };
        if k == key {
            return Some(v);
        }
    }
    None
}

/// Form-style query value: `+` is a space, `%XX` escapes must decode to UTF-8.
fn decode_query_value(raw: &str) -> Result<String, std::string::FromUtf8Error> {
    urlencoding::decode(&raw.replace('+', " ")).map(Cow::into_owned)
}

fn request_base_url(request: &tiny_http::Request) -> String {
    for header in request.headers() {
        if header.field.equiv("Host") {
            let host = header.value.as_str().trim();
            if !host.is_empty() {
                return format!("http://{host}");
            }
        }
    }
    "http://127.0.0.1:8099".to_string()
}

fn is_local_network_ip(ip: IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => v4.is_loopback() || v4.is_private() || v4.is_link_local(),
        IpAddr::V6(v6) => {
            v6.is_loopback() || v6.is_unique_local() || v6.is_unicast_link_local() || is_ipv4_mapped_local(v6)
        }
    }
}

fn is_ipv4_mapped_local(v6: Ipv6Addr) -> bool {
    match v6.to_ipv4_mapped() {
        Some(v4) => v4.is_loopback() || v4.is_private() || v4.is_link_local(),
        None => false,
    }
}
