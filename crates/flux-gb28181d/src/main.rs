use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    routing::{get, post},
    Json, Router,
};
use clap::Parser;
use flux_gb28181::{
    ptz::PresetOp,
    rtp::RtpPsBinder,
    session::{InviteOptions, InviteOutcome},
    sip::{InboundHandler, UdpSipTransport},
    ConfigLoader, Device, DeviceManager, GbError, MediaHub, SessionManager,
};
use serde::Deserialize;
use serde_json::{json, Value};
use std::{sync::Arc, time::Duration};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser, Debug)]
#[command(author, version, about)]
struct Args {
    #[arg(long, default_value = "./config/gb28181.toml")]
    config: String,

    #[arg(long, default_value = "0.0.0.0:8081")]
    http_bind: String,

    /// 覆盖配置中的日志级别
    #[arg(long)]
    log_level: Option<String>,

    #[arg(long, default_value_t = 1)]
    watchdog_interval_secs: u64,
}

#[derive(Clone)]
struct AppState {
    manager: Arc<SessionManager>,
    hub: Arc<MediaHub>,
}

type ApiError = (StatusCode, Json<Value>);
type ApiResult = std::result::Result<Json<Value>, ApiError>;

#[derive(Debug, Deserialize)]
struct InviteRequest {
    device_id: String,
    channel_id: String,
    /// 回放起止时间（秒），实时流留空
    #[serde(default)]
    start: String,
    #[serde(default)]
    end: String,
    #[serde(default)]
    stream_path: String,
    #[serde(default)]
    dump: String,
}

#[derive(Debug, Deserialize)]
struct StreamRequest {
    stream_path: String,
}

#[derive(Debug, Deserialize)]
struct PlayAtRequest {
    stream_path: String,
    second: u32,
}

#[derive(Debug, Deserialize)]
struct PlayForwardRequest {
    stream_path: String,
    speed: f32,
}

#[derive(Debug, Deserialize)]
struct PtzRequest {
    device_id: String,
    channel_id: String,
    cmd: String,
    #[serde(default = "default_ptz_speed")]
    speed: u8,
}

fn default_ptz_speed() -> u8 {
    0x80
}

#[derive(Debug, Deserialize)]
struct PresetRequest {
    device_id: String,
    channel_id: String,
    /// 0 设置，1 删除，2 调用
    op: u8,
    point: u8,
}

#[derive(Debug, Deserialize)]
struct ChannelQuery {
    device_id: String,
    channel_id: String,
}

#[derive(Debug, Deserialize)]
struct RecordQuery {
    device_id: String,
    channel_id: String,
    start: i64,
    end: i64,
}

fn map_gb_error(err: GbError) -> ApiError {
    let code = err.status_code();
    let status = StatusCode::from_u16(code).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    (status, Json(json!({ "code": code, "error": err.to_string() })))
}

fn code_reply(code: u16) -> Json<Value> {
    Json(json!({ "code": code }))
}

fn init_tracing(level: &str) {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| level.into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();
}

fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(|| async { "OK" }))
        .route("/api/v1/gb28181/devices", get(list_devices))
        .route(
            "/api/v1/gb28181/devices/:device_id/channels",
            get(list_device_channels),
        )
        .route("/api/v1/gb28181/sessions", get(list_sessions))
        .route("/api/v1/gb28181/streams", get(list_streams))
        .route("/api/v1/gb28181/invite", post(invite))
        .route("/api/v1/gb28181/bye", post(bye))
        .route("/api/v1/gb28181/pause", post(pause))
        .route("/api/v1/gb28181/resume", post(resume))
        .route("/api/v1/gb28181/play_at", post(play_at))
        .route("/api/v1/gb28181/play_forward", post(play_forward))
        .route("/api/v1/gb28181/ptz", post(ptz))
        .route("/api/v1/gb28181/preset", post(preset))
        .route("/api/v1/gb28181/presets", get(query_presets))
        .route("/api/v1/gb28181/records", get(query_records))
        .with_state(state)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let config = ConfigLoader::load(&args.config)?;
    init_tracing(args.log_level.as_deref().unwrap_or(&config.log_level));

    tracing::info!(target: "gb28181d", config = %args.config, serial = %config.serial, "starting");

    let sip_bind = format!("{}:{}", config.listen_addr, config.sip_port);
    let transport = UdpSipTransport::bind(&sip_bind, config.request_timeout()).await?;
    tracing::info!(target: "gb28181d", addr = %transport.local_addr()?, "sip listening");

    let hub = Arc::new(MediaHub::new());
    hub.spawn_watchdog(Duration::from_secs(args.watchdog_interval_secs.max(1)));
    let binder = RtpPsBinder::new(config.listen_addr.clone());

    let devices = Arc::new(DeviceManager::new());
    for device in &config.devices {
        let device = devices.register_device(Device::from_config(device, &config.sip_ip, &config.media_ip));
        tracing::info!(
            target: "gb28181d",
            device_id = %device.id,
            addr = %device.net_addr,
            channels = device.channels().len(),
            "device loaded"
        );
    }

    let manager = SessionManager::new(config, devices, transport.clone(), hub.clone(), binder)?;
    manager.watch_stream_events(hub.events());

    let handler: Arc<dyn InboundHandler> = manager.clone();
    tokio::spawn(async move {
        if let Err(e) = transport.run(handler).await {
            tracing::error!(target: "gb28181d", "sip transport stopped: {}", e);
        }
    });

    let started = manager.start_auto_invite();
    tracing::info!(target: "gb28181d", started, "auto invite scheduled");

    let app = router(AppState { manager, hub });

    let addr = args.http_bind;
    tracing::info!(target: "gb28181d", "http listening on {}", addr);

    axum::Server::bind(
        &addr
            .parse()
            .map_err(|e| anyhow::anyhow!("invalid http_bind {}: {}", addr, e))?,
    )
    .serve(app.into_make_service())
    .await?;

    Ok(())
}

async fn list_devices(State(state): State<AppState>) -> ApiResult {
    let devices: Vec<Value> = state
        .manager
        .devices()
        .list_devices()
        .iter()
        .map(|d| {
            json!({
                "device_id": d.id,
                "addr": d.net_addr,
                "transport": d.transport,
                "channels": d.channels().iter().map(|c| c.snapshot()).collect::<Vec<_>>(),
            })
        })
        .collect();

    Ok(Json(json!({ "devices": devices })))
}

async fn list_device_channels(
    State(state): State<AppState>,
    Path(device_id): Path<String>,
) -> ApiResult {
    let device = state
        .manager
        .devices()
        .get_device(&device_id)
        .ok_or_else(|| map_gb_error(GbError::DeviceNotFound(device_id.clone())))?;

    let channels: Vec<_> = device.channels().iter().map(|c| c.snapshot()).collect();
    Ok(Json(json!({ "channels": channels })))
}

async fn list_sessions(State(state): State<AppState>) -> ApiResult {
    Ok(Json(json!({ "sessions": state.manager.list_sessions() })))
}

async fn list_streams(State(state): State<AppState>) -> ApiResult {
    Ok(Json(json!({ "streams": state.hub.list_streams() })))
}

async fn invite(State(state): State<AppState>, Json(req): Json<InviteRequest>) -> ApiResult {
    let mut opt = InviteOptions::live();
    if !req.start.is_empty() || !req.end.is_empty() {
        opt.validate(&req.start, &req.end).map_err(map_gb_error)?;
    }
    opt.stream_path = req.stream_path;
    opt.dump = req.dump;

    let outcome = state
        .manager
        .invite(&req.device_id, &req.channel_id, opt)
        .await
        .map_err(map_gb_error)?;

    let stream_path = match &outcome {
        InviteOutcome::Started { stream_path } => Some(stream_path.clone()),
        InviteOutcome::Busy => None,
    };
    Ok(Json(json!({ "code": outcome.status_code(), "stream_path": stream_path })))
}

async fn bye(State(state): State<AppState>, Json(req): Json<StreamRequest>) -> ApiResult {
    let code = state.manager.bye(&req.stream_path).await.map_err(map_gb_error)?;
    Ok(code_reply(code))
}

async fn pause(State(state): State<AppState>, Json(req): Json<StreamRequest>) -> ApiResult {
    let code = state.manager.pause(&req.stream_path).await.map_err(map_gb_error)?;
    Ok(code_reply(code))
}

async fn resume(State(state): State<AppState>, Json(req): Json<StreamRequest>) -> ApiResult {
    let code = state.manager.resume(&req.stream_path).await.map_err(map_gb_error)?;
    Ok(code_reply(code))
}

async fn play_at(State(state): State<AppState>, Json(req): Json<PlayAtRequest>) -> ApiResult {
    let code = state
        .manager
        .play_at(&req.stream_path, req.second)
        .await
        .map_err(map_gb_error)?;
    Ok(code_reply(code))
}

async fn play_forward(
    State(state): State<AppState>,
    Json(req): Json<PlayForwardRequest>,
) -> ApiResult {
    let code = state
        .manager
        .play_forward(&req.stream_path, req.speed)
        .await
        .map_err(map_gb_error)?;
    Ok(code_reply(code))
}

async fn ptz(State(state): State<AppState>, Json(req): Json<PtzRequest>) -> ApiResult {
    let code = state
        .manager
        .ptz_by_name(&req.device_id, &req.channel_id, &req.cmd, req.speed)
        .await
        .map_err(map_gb_error)?;
    Ok(code_reply(code))
}

async fn preset(State(state): State<AppState>, Json(req): Json<PresetRequest>) -> ApiResult {
    let op = PresetOp::from_code(req.op)
        .ok_or_else(|| map_gb_error(GbError::InvalidArgument(format!("invalid preset op: {}", req.op))))?;
    let code = state
        .manager
        .preset_control(&req.device_id, &req.channel_id, op, req.point)
        .await
        .map_err(map_gb_error)?;
    Ok(code_reply(code))
}

async fn query_presets(State(state): State<AppState>, Query(q): Query<ChannelQuery>) -> ApiResult {
    let resp = state
        .manager
        .query_preset_list(&q.device_id, &q.channel_id)
        .await
        .map_err(map_gb_error)?;
    Ok(Json(json!({ "code": resp.status_code, "body": resp.body })))
}

async fn query_records(State(state): State<AppState>, Query(q): Query<RecordQuery>) -> ApiResult {
    let records = state
        .manager
        .query_record(&q.device_id, &q.channel_id, q.start, q.end)
        .await
        .map_err(map_gb_error)?;
    Ok(Json(json!({ "code": 200, "records": records })))
}
