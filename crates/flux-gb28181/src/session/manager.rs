// 会话管理
// 点播、挂断、回放控制、云台控制和录像查询，以及对设备上行 MESSAGE 的处理

use super::options::InviteOptions;
use super::pull::{pause_body, resume_body, seek_body, speed_body, PullStream, PullStreamInfo, PullStreamRegistry};
use crate::config::{Gb28181Config, InviteMode, MediaNetwork, MediaPortSpec};
use crate::device::{Channel, ChannelInfo, ChannelState, Device, DeviceManager};
use crate::error::status;
use crate::manscdp::{self, CONTENT_TYPE_MANSCDP};
use crate::port::{PortLease, PortManager};
use crate::ptz::{self, PresetOp};
use crate::record::{Record, RecordQueryLink};
use crate::rtp::{MediaBinder, ReceiveOptions};
use crate::sip::message::uri_user;
use crate::sip::{
    ack_request, DialogBuilder, InboundHandler, SdpMedia, SdpSession, SipMethod, SipRequest, SipResponse,
    SipTransport,
};
use crate::stream::{PublishOptions, StreamEngine, StreamEvent};
use crate::{GbError, Result};
use async_trait::async_trait;
use futures::future::BoxFuture;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::Instrument;

/// 点播结果
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InviteOutcome {
    Started { stream_path: String },
    /// 通道正在邀请或已在播放
    Busy,
}

impl InviteOutcome {
    pub fn status_code(&self) -> u16 {
        match self {
            InviteOutcome::Started { .. } => status::OK,
            InviteOutcome::Busy => status::NOT_MODIFIED,
        }
    }
}

/// 默认流路径：`设备/通道`，回放追加 `/开始-结束`
pub fn default_stream_path(device_id: &str, channel_id: &str, opt: &InviteOptions) -> String {
    if channel_id.is_empty() {
        return format!("gb28181/{}", device_id);
    }
    if opt.is_live() {
        format!("{}/{}", device_id, channel_id)
    } else {
        format!("{}/{}/{}-{}", device_id, channel_id, opt.start, opt.end)
    }
}

/// 解析订阅路径 `设备/通道[/开始-结束]`
pub fn parse_stream_path(stream_path: &str) -> Option<(String, String, InviteOptions)> {
    let mut parts = stream_path.split('/');
    let device_id = parts.next().filter(|s| !s.is_empty())?;
    let channel_id = parts.next().filter(|s| !s.is_empty())?;

    let mut opt = InviteOptions::live();
    if let Some(range) = parts.next() {
        let (start, end) = range.split_once('-')?;
        opt.validate(start, end).ok()?;
    }
    if parts.next().is_some() {
        return None;
    }
    opt.stream_path = stream_path.to_string();
    Some((device_id.to_string(), channel_id.to_string(), opt))
}

pub struct SessionManager {
    config: Gb28181Config,
    media: MediaPortSpec,
    /// 单端口配置时为 None
    ports: Option<Arc<PortManager>>,
    dialog: DialogBuilder,
    devices: Arc<DeviceManager>,
    registry: PullStreamRegistry,
    records: Arc<RecordQueryLink>,
    transport: Arc<dyn SipTransport>,
    engine: Arc<dyn StreamEngine>,
    binder: Arc<dyn MediaBinder>,
    this: Weak<SessionManager>,
}

impl SessionManager {
    pub fn new(
        config: Gb28181Config,
        devices: Arc<DeviceManager>,
        transport: Arc<dyn SipTransport>,
        engine: Arc<dyn StreamEngine>,
        binder: Arc<dyn MediaBinder>,
    ) -> Result<Arc<Self>> {
        config.validate()?;
        let media = config.media_port_spec()?;
        let ports = if media.is_single() {
            None
        } else {
            Some(Arc::new(PortManager::new(media.min, media.max)))
        };
        let dialog = DialogBuilder::new(&config);

        tracing::info!(
            target: "gb28181::session",
            serial = %config.serial,
            media = %config.media,
            invite_mode = ?config.invite_mode,
            "session manager created"
        );

        Ok(Arc::new_cyclic(|this| Self {
            config,
            media,
            ports,
            dialog,
            devices,
            registry: PullStreamRegistry::new(),
            records: RecordQueryLink::new(),
            transport,
            engine,
            binder,
            this: this.clone(),
        }))
    }

    pub fn config(&self) -> &Gb28181Config {
        &self.config
    }

    pub fn devices(&self) -> &Arc<DeviceManager> {
        &self.devices
    }

    pub fn registry(&self) -> &PullStreamRegistry {
        &self.registry
    }

    pub fn records(&self) -> &Arc<RecordQueryLink> {
        &self.records
    }

    pub fn ports(&self) -> Option<&Arc<PortManager>> {
        self.ports.as_ref()
    }

    pub fn list_sessions(&self) -> Vec<PullStreamInfo> {
        self.registry.list()
    }

    fn lookup(&self, device_id: &str, channel_id: &str) -> Result<(Arc<Device>, Arc<Channel>)> {
        let device = self
            .devices
            .get_device(device_id)
            .ok_or_else(|| GbError::DeviceNotFound(device_id.to_string()))?;
        let channel = device
            .get_channel(channel_id)
            .ok_or_else(|| GbError::ChannelNotFound(channel_id.to_string()))?;
        Ok((device, channel))
    }

    fn session(&self, stream_path: &str) -> Result<Arc<PullStream>> {
        self.registry
            .get(stream_path)
            .ok_or_else(|| GbError::SessionNotFound(stream_path.to_string()))
    }

    // ---------- 点播 ----------

    /// 向通道发起点播
    pub async fn invite(&self, device_id: &str, channel_id: &str, opt: InviteOptions) -> Result<InviteOutcome> {
        let (device, channel) = self.lookup(device_id, channel_id)?;
        self.invite_channel(device, channel, opt).await
    }

    /// 实时流受通道状态保护：只有 IDLE 的通道才会真正发出 INVITE
    pub async fn invite_channel(
        &self,
        device: Arc<Device>,
        channel: Arc<Channel>,
        opt: InviteOptions,
    ) -> Result<InviteOutcome> {
        let span = tracing::info_span!(
            "gb28181.invite",
            device_id = %device.id,
            channel_id = %channel.id(),
            live = opt.is_live()
        );

        if !opt.is_live() {
            return self.do_invite(&device, &channel, opt).instrument(span).await;
        }

        if !channel.try_begin_invite() {
            tracing::info!(
                target: "gb28181::session",
                device_id = %device.id,
                channel_id = %channel.id(),
                state = ?channel.state(),
                "channel busy, invite skipped"
            );
            return Ok(InviteOutcome::Busy);
        }

        let result = self
            .do_invite(&device, &channel, opt.clone())
            .instrument(span)
            .await;

        match &result {
            Ok(InviteOutcome::Started { .. }) => channel.set_state(ChannelState::Playing),
            Ok(InviteOutcome::Busy) => channel.set_state(ChannelState::Idle),
            Err(e) => {
                channel.set_state(ChannelState::Idle);
                tracing::warn!(
                    target: "gb28181::session",
                    device_id = %device.id,
                    channel_id = %channel.id(),
                    error = %e,
                    "invite failed"
                );
                if self.config.invite_mode == InviteMode::Auto {
                    self.schedule_retry(device.clone(), channel.clone(), opt);
                }
            }
        }
        result
    }

    fn invite_boxed(
        &self,
        device: Arc<Device>,
        channel: Arc<Channel>,
        opt: InviteOptions,
    ) -> BoxFuture<'_, Result<InviteOutcome>> {
        Box::pin(self.invite_channel(device, channel, opt))
    }

    /// 失败后延迟重试一次，重试仍走状态保护
    fn schedule_retry(&self, device: Arc<Device>, channel: Arc<Channel>, opt: InviteOptions) {
        let Some(manager) = self.this.upgrade() else {
            return;
        };
        let delay = self.config.invite_retry_delay();

        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            tracing::info!(
                target: "gb28181::session",
                device_id = %device.id,
                channel_id = %channel.id(),
                "retry invite"
            );
            if let Err(e) = manager.invite_boxed(device, channel, opt).await {
                tracing::debug!(target: "gb28181::session", error = %e, "retry invite failed");
            }
        });
    }

    fn allocate_port(&self) -> Result<(PortLease, bool)> {
        match &self.ports {
            Some(pool) => Ok((pool.lease()?, self.config.fdm)),
            None => Ok((PortLease::fixed(self.media.min), true)),
        }
    }

    fn build_sdp(&self, device: &Device, channel: &Channel, opt: &InviteOptions, port: u16) -> SdpSession {
        let mut sdp = SdpSession::new(channel.id(), device.media_ip.clone());
        sdp.uri = Some(format!("{}:0", channel.id()));
        if opt.is_record() {
            sdp.session_name = "Playback".to_string();
            sdp.start = opt.start;
            sdp.end = opt.end;
        }
        sdp.format = Some(opt.format.clone());
        sdp.media.push(SdpMedia::ps_video(port, self.media.network.is_tcp()));
        sdp.ssrc = Some(opt.ssrc().to_string());
        sdp
    }

    async fn do_invite(&self, device: &Arc<Device>, channel: &Arc<Channel>, mut opt: InviteOptions) -> Result<InviteOutcome> {
        if opt.stream_path.is_empty() {
            opt.stream_path = default_stream_path(&device.id, channel.id(), &opt);
        }
        if self.registry.contains(&opt.stream_path) {
            return Ok(InviteOutcome::Busy);
        }
        opt.create_ssrc(self.dialog.serial());

        let (lease, reuse_port) = self.allocate_port()?;
        let sdp = self.build_sdp(device, channel, &opt, lease.port());

        let mut invite = self
            .dialog
            .channel_request(SipMethod::Invite, device, channel.info());
        invite.add_header("Subject", format!("{}:{},{}:0", channel.id(), opt.ssrc(), self.dialog.serial()));
        invite.set_body("application/sdp", sdp.to_string());

        tracing::info!(
            target: "gb28181::session",
            stream_path = %opt.stream_path,
            ssrc = %opt.ssrc(),
            port = lease.port(),
            "send invite"
        );

        let response = self.transport.request(invite.clone()).await?;
        if response.status_code != status::OK {
            return Err(GbError::Rejected(response.status_code));
        }

        let mut network = self.media.network;
        if let Some(answer) = response.body.as_deref() {
            match SdpSession::from_string(answer) {
                Ok(answer) => {
                    if let Some(ssrc) = answer.ssrc_value() {
                        opt.set_ssrc_value(ssrc);
                    }
                    if let Some(video) = answer.video() {
                        if !video.is_tcp() {
                            network = MediaNetwork::Udp;
                        }
                    }
                }
                Err(e) => {
                    tracing::warn!(target: "gb28181::session", error = %e, "invalid answer sdp");
                }
            }
        }

        let publish = if opt.is_live() {
            PublishOptions::default()
        } else {
            PublishOptions {
                idle_timeout: Some(Duration::from_secs(self.config.playback_idle_timeout_secs)),
                delay_close_timeout: Some(Duration::from_secs(self.config.playback_delay_close_secs)),
            }
        };
        let sink = self.engine.publish(&opt.stream_path, publish)?;

        let dump = if opt.dump.is_empty() { &self.config.dump_path } else { &opt.dump };
        let receive = ReceiveOptions {
            stream_path: opt.stream_path.clone(),
            network,
            port: lease.port(),
            ssrc: opt.ssrc_value(),
            reuse_port,
            dump_path: (!dump.is_empty()).then(|| PathBuf::from(dump)),
        };
        let media = match self.binder.bind(receive, sink).await {
            Ok(media) => media,
            Err(e) => {
                self.engine.close(&opt.stream_path);
                return Err(e);
            }
        };

        let stream_path = opt.stream_path.clone();
        let pull = Arc::new(PullStream::new(opt, device.clone(), channel.clone(), response.clone(), lease, media));
        if !self.registry.insert(pull.clone()) {
            self.engine.close(&stream_path);
            return Ok(InviteOutcome::Busy);
        }

        if let Err(e) = self.transport.send(ack_request(&invite, &response)).await {
            self.registry.remove(&stream_path);
            pull.release();
            self.engine.close(&stream_path);
            return Err(e);
        }

        tracing::info!(target: "gb28181::session", %stream_path, network = network.as_str(), "invite success");
        Ok(InviteOutcome::Started { stream_path })
    }

    /// 自动拉流：回放总是允许，实时流需要通道满足邀请条件
    pub fn try_auto_invite(&self, device: Arc<Device>, channel: Arc<Channel>, opt: InviteOptions) -> bool {
        if opt.is_live() && !channel.can_invite(&self.config.invite_ids) {
            return false;
        }
        let Some(manager) = self.this.upgrade() else {
            return false;
        };

        tokio::spawn(async move {
            if let Err(e) = manager.invite_boxed(device, channel, opt).await {
                tracing::debug!(target: "gb28181::session", error = %e, "auto invite failed");
            }
        });
        true
    }

    /// 预拉流模式下对所有通道发起点播
    pub fn start_auto_invite(&self) -> usize {
        if self.config.invite_mode != InviteMode::Auto {
            return 0;
        }
        let mut started = 0;
        for device in self.devices.list_devices() {
            for channel in device.channels() {
                if self.try_auto_invite(device.clone(), channel, InviteOptions::live()) {
                    started += 1;
                }
            }
        }
        started
    }

    /// 添加通道，预拉流模式下立即尝试点播
    pub fn add_channel(&self, device_id: &str, info: ChannelInfo) -> Result<Arc<Channel>> {
        let device = self
            .devices
            .get_device(device_id)
            .ok_or_else(|| GbError::DeviceNotFound(device_id.to_string()))?;
        let channel = device.add_channel(info);
        if self.config.invite_mode == InviteMode::Auto {
            self.try_auto_invite(device, channel.clone(), InviteOptions::live());
        }
        Ok(channel)
    }

    /// 按需拉流：有订阅者访问未发布的流时触发
    pub fn on_subscribe(&self, stream_path: &str) -> bool {
        if self.config.invite_mode != InviteMode::OnSubscribe {
            return false;
        }
        let Some((device_id, channel_id, opt)) = parse_stream_path(stream_path) else {
            return false;
        };
        match self.lookup(&device_id, &channel_id) {
            Ok((device, channel)) => self.try_auto_invite(device, channel, opt),
            Err(_) => false,
        }
    }

    // ---------- 会话控制 ----------

    /// 挂断，流不存在返回 SessionNotFound
    pub async fn bye(&self, stream_path: &str) -> Result<u16> {
        let pull = self
            .registry
            .remove(stream_path)
            .ok_or_else(|| GbError::SessionNotFound(stream_path.to_string()))?;

        if let Err(e) = pull.bye(&self.dialog, self.transport.as_ref()).await {
            tracing::warn!(target: "gb28181::session", %stream_path, error = %e, "send bye failed");
        }
        self.engine.close(stream_path);
        tracing::info!(target: "gb28181::session", %stream_path, "session closed");
        Ok(status::OK)
    }

    pub async fn pause(&self, stream_path: &str) -> Result<u16> {
        let pull = self.session(stream_path)?;
        let code = pull
            .info_control(&self.dialog, self.transport.as_ref(), pause_body)
            .await?;
        self.engine.pause(stream_path);
        Ok(code)
    }

    pub async fn resume(&self, stream_path: &str) -> Result<u16> {
        let pull = self.session(stream_path)?;
        let code = pull
            .info_control(&self.dialog, self.transport.as_ref(), resume_body)
            .await?;
        self.engine.resume(stream_path);
        Ok(code)
    }

    /// 跳转到回放的第 `second` 秒
    pub async fn play_at(&self, stream_path: &str, second: u32) -> Result<u16> {
        let pull = self.session(stream_path)?;
        let code = pull
            .info_control(&self.dialog, self.transport.as_ref(), |sn| seek_body(sn, second))
            .await?;
        self.engine.resume(stream_path);
        Ok(code)
    }

    /// 倍速播放
    pub async fn play_forward(&self, stream_path: &str, speed: f32) -> Result<u16> {
        if !(speed.is_finite() && speed > 0.0) {
            return Err(GbError::InvalidArgument(format!("invalid speed: {}", speed)));
        }
        let pull = self.session(stream_path)?;
        let code = pull
            .info_control(&self.dialog, self.transport.as_ref(), |sn| speed_body(sn, speed))
            .await?;
        self.engine.resume(stream_path);
        Ok(code)
    }

    /// 引擎侧流关闭时清理会话
    pub async fn on_stream_closed(&self, stream_path: &str) -> bool {
        let Some(pull) = self.registry.remove(stream_path) else {
            return false;
        };
        if let Err(e) = pull.bye(&self.dialog, self.transport.as_ref()).await {
            tracing::warn!(target: "gb28181::session", %stream_path, error = %e, "send bye failed");
        }
        tracing::info!(target: "gb28181::session", %stream_path, "stream closed by engine");
        true
    }

    /// 订阅引擎事件，流关闭时挂断对应会话
    pub fn watch_stream_events(&self, mut events: broadcast::Receiver<StreamEvent>) -> JoinHandle<()> {
        let manager = self.this.clone();
        tokio::spawn(async move {
            loop {
                let event = match events.recv().await {
                    Ok(event) => event,
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        tracing::warn!(target: "gb28181::session", skipped = n, "stream events lagged");
                        continue;
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                };
                if let StreamEvent::StreamClosed { stream_path, .. } = event {
                    let Some(manager) = manager.upgrade() else { break };
                    manager.on_stream_closed(&stream_path).await;
                }
            }
        })
    }

    // ---------- 云台与预置位 ----------

    async fn device_control(&self, device: &Device, channel: &Channel, ptz_cmd: &str) -> Result<u16> {
        let mut req = self.dialog.device_request(SipMethod::Message, device);
        let sn = req.cseq().map(|(sn, _)| sn).unwrap_or_else(|| device.sn());
        req.set_body(CONTENT_TYPE_MANSCDP, manscdp::device_control(sn, channel.id(), ptz_cmd));

        match self.transport.request(req).await {
            Ok(resp) => Ok(resp.status_code),
            Err(e) => {
                tracing::warn!(
                    target: "gb28181::session",
                    device_id = %device.id,
                    channel_id = %channel.id(),
                    error = %e,
                    "device control failed"
                );
                Err(GbError::Timeout)
            }
        }
    }

    /// 云台控制，`cmd` 为指令字节，速度取值 0～255（变倍取高 4 位）
    pub async fn ptz(&self, device_id: &str, channel_id: &str, cmd: u8, horizontal: u8, vertical: u8, zoom: u8) -> Result<u16> {
        let (device, channel) = self.lookup(device_id, channel_id)?;
        let ptz_cmd = ptz::ptz_command(cmd, horizontal, vertical, zoom);
        self.device_control(&device, &channel, &ptz_cmd).await
    }

    /// 按名称的云台控制，如 `left`、`zoomin`、`stop`
    pub async fn ptz_by_name(&self, device_id: &str, channel_id: &str, name: &str, speed: u8) -> Result<u16> {
        let cmd = ptz::ptz_code(name)?;
        self.ptz(device_id, channel_id, cmd, speed, speed, speed).await
    }

    /// 预置位设置/删除/调用
    pub async fn preset_control(&self, device_id: &str, channel_id: &str, op: PresetOp, point: u8) -> Result<u16> {
        let (device, channel) = self.lookup(device_id, channel_id)?;
        let ptz_cmd = ptz::preset_command(op, point);
        self.device_control(&device, &channel, &ptz_cmd).await
    }

    /// 查询预置位列表，返回设备应答
    pub async fn query_preset_list(&self, device_id: &str, channel_id: &str) -> Result<SipResponse> {
        let (device, channel) = self.lookup(device_id, channel_id)?;
        let mut req = self.dialog.device_request(SipMethod::Message, &device);
        let sn = req.cseq().map(|(sn, _)| sn).unwrap_or_else(|| device.sn());
        req.set_body(CONTENT_TYPE_MANSCDP, manscdp::preset_query(sn, channel.id()));
        self.transport.request(req).await
    }

    // ---------- 录像查询 ----------

    /// 查询录像，等待设备分段上报完成或超时
    pub async fn query_record(&self, device_id: &str, channel_id: &str, start: i64, end: i64) -> Result<Vec<Record>> {
        let (device, channel) = self.lookup(device_id, channel_id)?;
        let mut req = self.dialog.device_request(SipMethod::Message, &device);
        let sn = req.cseq().map(|(sn, _)| sn).unwrap_or_else(|| device.sn());
        req.set_body(
            CONTENT_TYPE_MANSCDP,
            manscdp::record_info_query(sn, channel.id(), start, end),
        );

        let rx = self
            .records
            .wait_result(&device.id, channel.id(), sn, self.config.query_record_timeout());

        let sent = match self.transport.request(req).await {
            Ok(resp) if resp.status_code == status::OK => Ok(()),
            Ok(resp) => Err(GbError::Rejected(resp.status_code)),
            Err(e) => Err(e),
        };
        if let Err(e) = sent {
            self.records.cancel(&device.id, channel.id(), sn);
            return Err(e);
        }

        rx.await.map_err(|_| GbError::Timeout)?
    }

    fn handle_message(&self, req: &SipRequest) -> u16 {
        let Some(body) = req.body.as_deref() else {
            return status::OK;
        };
        let msg = match manscdp::parse_message(body) {
            Ok(msg) => msg,
            Err(e) => {
                tracing::debug!(target: "gb28181::session", error = %e, "unparsed message body");
                return status::OK;
            }
        };

        if msg.cmd_type == "RecordInfo" {
            let device_id = req.header("From").and_then(uri_user).unwrap_or_default();
            let items = msg.record_list.map(|list| list.items).unwrap_or_default();
            self.records.put(
                device_id,
                &msg.device_id,
                msg.sn.unwrap_or_default(),
                msg.sum_num.unwrap_or_default(),
                items,
            );
        }
        status::OK
    }

    fn handle_bye(&self, req: &SipRequest) -> u16 {
        let Some(pull) = req.call_id().and_then(|id| self.registry.remove_by_call_id(id)) else {
            return status::CALL_DOES_NOT_EXIST;
        };
        pull.release();
        self.engine.close(pull.stream_path());
        tracing::info!(target: "gb28181::session", stream_path = %pull.stream_path(), "bye from device");
        status::OK
    }
}

#[async_trait]
impl InboundHandler for SessionManager {
    async fn on_request(&self, req: SipRequest, remote: SocketAddr) -> SipResponse {
        tracing::debug!(target: "gb28181::session", method = %req.method, %remote, "inbound request");
        let code = match req.method {
            SipMethod::Message | SipMethod::Notify => self.handle_message(&req),
            SipMethod::Bye => self.handle_bye(&req),
            _ => status::METHOD_NOT_ALLOWED,
        };
        SipResponse::for_request(&req, code)
    }
}
