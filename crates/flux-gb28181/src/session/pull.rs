// 拉流会话及其注册表

use super::options::InviteOptions;
use crate::config::MediaNetwork;
use crate::device::{Channel, ChannelState, Device};
use crate::manscdp::CONTENT_TYPE_MANSRTSP;
use crate::port::PortLease;
use crate::rtp::MediaHandle;
use crate::sip::{into_dialog, DialogBuilder, SipMethod, SipRequest, SipResponse, SipTransport};
use crate::Result;
use dashmap::DashMap;
use serde::Serialize;
use std::sync::{Arc, Mutex};

/// 暂停
pub fn pause_body(sn: u32) -> String {
    format!("PAUSE RTSP/1.0\nCSeq: {}\nPauseTime: now\n", sn)
}

/// 恢复
pub fn resume_body(sn: u32) -> String {
    format!("PLAY RTSP/1.0\nCSeq: {}\nRange: npt=now-\n", sn)
}

/// 跳转到指定秒
pub fn seek_body(sn: u32, second: u32) -> String {
    format!("PLAY RTSP/1.0\nCSeq: {}\nRange: npt={}-\n", sn, second)
}

/// 倍速播放
pub fn speed_body(sn: u32, speed: f32) -> String {
    format!("PLAY RTSP/1.0\nCSeq: {}\nScale: {:.6}\n", sn, speed)
}

/// 会话占用的本地媒体资源
struct MediaResources {
    port: PortLease,
    media: MediaHandle,
}

/// 一个已建立的拉流会话
pub struct PullStream {
    pub opt: InviteOptions,
    pub channel: Arc<Channel>,
    pub device: Arc<Device>,
    invite_response: SipResponse,
    resources: Mutex<Option<MediaResources>>,
}

/// 会话概要
#[derive(Debug, Clone, Serialize)]
pub struct PullStreamInfo {
    pub stream_path: String,
    pub device_id: String,
    pub channel_id: String,
    pub ssrc: u32,
    pub live: bool,
    pub start: i64,
    pub end: i64,
    /// 媒体接收方式，资源已释放时为空
    pub network: Option<&'static str>,
}

impl PullStream {
    pub fn new(
        opt: InviteOptions,
        device: Arc<Device>,
        channel: Arc<Channel>,
        invite_response: SipResponse,
        port: PortLease,
        media: MediaHandle,
    ) -> Self {
        Self {
            opt,
            channel,
            device,
            invite_response,
            resources: Mutex::new(Some(MediaResources { port, media })),
        }
    }

    pub fn stream_path(&self) -> &str {
        &self.opt.stream_path
    }

    pub fn call_id(&self) -> Option<&str> {
        self.invite_response.call_id()
    }

    pub fn info(&self) -> PullStreamInfo {
        PullStreamInfo {
            stream_path: self.opt.stream_path.clone(),
            device_id: self.device.id.clone(),
            channel_id: self.channel.id().to_string(),
            ssrc: self.opt.ssrc_value(),
            live: self.opt.is_live(),
            start: self.opt.start,
            end: self.opt.end,
            network: self.media_network().map(|n| n.as_str()),
        }
    }

    /// 当前占用的媒体端口，资源已释放时为 None
    pub fn media_port(&self) -> Option<u16> {
        self.resources
            .lock()
            .ok()
            .and_then(|guard| guard.as_ref().map(|r| r.port.port()))
    }

    /// 媒体绑定所用的传输方式
    pub fn media_network(&self) -> Option<MediaNetwork> {
        self.resources
            .lock()
            .ok()
            .and_then(|guard| guard.as_ref().map(|r| r.media.network()))
    }

    /// 构造对话内请求
    pub fn create_request(&self, dialog: &DialogBuilder, method: SipMethod) -> SipRequest {
        let req = dialog.channel_request(method, &self.device, self.channel.info());
        into_dialog(req, &self.invite_response)
    }

    /// 发送 INFO 回放控制，返回设备状态码
    pub async fn info_control<F>(
        &self,
        dialog: &DialogBuilder,
        transport: &dyn SipTransport,
        body: F,
    ) -> Result<u16>
    where
        F: FnOnce(u32) -> String,
    {
        let mut req = self.create_request(dialog, SipMethod::Info);
        let sn = req.cseq().map(|(sn, _)| sn).unwrap_or_else(|| self.device.sn());
        req.set_body(CONTENT_TYPE_MANSRTSP, body(sn));

        let resp = transport.request(req).await?;
        Ok(resp.status_code)
    }

    /// 挂断：发送 BYE 并释放本地资源
    pub async fn bye(&self, dialog: &DialogBuilder, transport: &dyn SipTransport) -> Result<u16> {
        let req = self.create_request(dialog, SipMethod::Bye);
        let result = transport.request(req).await.map(|resp| resp.status_code);
        self.release();
        result
    }

    /// 释放端口和媒体绑定，实时流通道回到空闲，可重复调用
    pub fn release(&self) {
        let resources = match self.resources.lock() {
            Ok(mut guard) => guard.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };
        if resources.is_some() && self.opt.is_live() {
            self.channel.set_state(ChannelState::Idle);
        }
        drop(resources);
    }
}

impl std::fmt::Debug for PullStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PullStream")
            .field("stream_path", &self.opt.stream_path)
            .field("device_id", &self.device.id)
            .field("channel_id", &self.channel.id())
            .field("ssrc", &self.opt.ssrc_value())
            .finish()
    }
}

/// 拉流会话注册表，按流路径索引
#[derive(Debug, Default)]
pub struct PullStreamRegistry {
    streams: DashMap<String, Arc<PullStream>>,
}

impl PullStreamRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// 注册会话，同路径已存在时返回 false
    pub fn insert(&self, stream: Arc<PullStream>) -> bool {
        match self.streams.entry(stream.stream_path().to_string()) {
            dashmap::mapref::entry::Entry::Occupied(_) => false,
            dashmap::mapref::entry::Entry::Vacant(entry) => {
                entry.insert(stream);
                true
            }
        }
    }

    pub fn get(&self, stream_path: &str) -> Option<Arc<PullStream>> {
        self.streams.get(stream_path).map(|s| s.value().clone())
    }

    pub fn contains(&self, stream_path: &str) -> bool {
        self.streams.contains_key(stream_path)
    }

    /// 原子地取出并删除
    pub fn remove(&self, stream_path: &str) -> Option<Arc<PullStream>> {
        self.streams.remove(stream_path).map(|(_, s)| s)
    }

    /// 按 Call-ID 查找并删除
    pub fn remove_by_call_id(&self, call_id: &str) -> Option<Arc<PullStream>> {
        let path = self
            .streams
            .iter()
            .find(|s| s.value().call_id() == Some(call_id))
            .map(|s| s.key().clone())?;
        self.remove(&path)
    }

    pub fn len(&self) -> usize {
        self.streams.len()
    }

    pub fn is_empty(&self) -> bool {
        self.streams.is_empty()
    }

    pub fn list(&self) -> Vec<PullStreamInfo> {
        self.streams.iter().map(|s| s.value().info()).collect()
    }
}
