// GB28181 设备与通道
// 通道会话状态使用原子变量，保证同一通道同时只有一个 invite

use crate::config::{ChannelConfig, DeviceConfig};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU32, AtomicU8, Ordering};
use std::sync::Arc;

pub const CHANNEL_ON: &str = "ON";
pub const CHANNEL_OFF: &str = "OFF";

/// 通道会话状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum ChannelState {
    Idle = 0,
    Inviting = 1,
    Playing = 2,
}

impl ChannelState {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => ChannelState::Inviting,
            2 => ChannelState::Playing,
            _ => ChannelState::Idle,
        }
    }
}

/// 通道目录信息
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(rename_all = "PascalCase")]
pub struct ChannelInfo {
    /// 通道 ID（20位国标编码，11～13 位为设备类型）
    #[serde(rename = "DeviceID")]
    pub device_id: String,
    #[serde(rename = "ParentID")]
    pub parent_id: String,
    pub name: String,
    pub manufacturer: String,
    pub address: String,
    pub port: u16,
    pub status: String,
}

impl From<&ChannelConfig> for ChannelInfo {
    fn from(cfg: &ChannelConfig) -> Self {
        Self {
            device_id: cfg.id.clone(),
            parent_id: cfg.parent_id.clone(),
            name: cfg.name.clone(),
            manufacturer: cfg.manufacturer.clone(),
            address: cfg.address.clone(),
            port: cfg.port,
            status: if cfg.status.is_empty() {
                CHANNEL_ON.to_string()
            } else {
                cfg.status.clone()
            },
        }
    }
}

/// 设备通道
#[derive(Debug)]
pub struct Channel {
    /// 所属设备 ID
    device_id: String,
    info: ChannelInfo,
    state: AtomicU8,
}

impl Channel {
    pub fn new(device_id: impl Into<String>, info: ChannelInfo) -> Self {
        Self {
            device_id: device_id.into(),
            info,
            state: AtomicU8::new(ChannelState::Idle as u8),
        }
    }

    pub fn id(&self) -> &str {
        &self.info.device_id
    }

    pub fn device_id(&self) -> &str {
        &self.device_id
    }

    pub fn info(&self) -> &ChannelInfo {
        &self.info
    }

    pub fn state(&self) -> ChannelState {
        ChannelState::from_u8(self.state.load(Ordering::Acquire))
    }

    /// IDLE -> INVITING，失败说明已有 invite 在进行或正在播放
    pub fn try_begin_invite(&self) -> bool {
        self.state
            .compare_exchange(
                ChannelState::Idle as u8,
                ChannelState::Inviting as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
    }

    pub fn set_state(&self, state: ChannelState) {
        self.state.store(state as u8, Ordering::Release);
    }

    /// 是否可以自动邀请
    pub fn can_invite(&self, invite_ids: &str) -> bool {
        let id = self.id();
        if self.state() != ChannelState::Idle || id.len() != 20 || self.info.status == CHANNEL_OFF {
            return false;
        }

        if invite_ids.is_empty() {
            return true;
        }

        let Some(type_id) = id.get(10..13) else {
            return false;
        };

        // 格式：start-end,type1,type2
        invite_ids.split(',').any(|token| match token.split_once('-') {
            Some((first, second)) => type_id >= first && type_id <= second,
            None => type_id == token,
        })
    }

    pub fn snapshot(&self) -> ChannelSnapshot {
        ChannelSnapshot {
            info: self.info.clone(),
            live_status: self.state(),
        }
    }
}

/// 通道对外展示信息
#[derive(Debug, Clone, Serialize)]
pub struct ChannelSnapshot {
    #[serde(flatten)]
    pub info: ChannelInfo,
    #[serde(rename = "LiveStatus")]
    pub live_status: ChannelState,
}

/// GB28181 设备
#[derive(Debug)]
pub struct Device {
    /// 设备 ID（20位国标编码）
    pub id: String,

    /// 设备信令地址 `ip:port`
    pub net_addr: String,

    /// 传输协议（UDP/TCP）
    pub transport: String,

    /// 本端与设备通信使用的 SIP IP
    pub sip_ip: String,

    /// 本端接收媒体使用的 IP
    pub media_ip: String,

    sn: AtomicU32,
    channels: DashMap<String, Arc<Channel>>,
}

impl Device {
    pub fn new(id: impl Into<String>, net_addr: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            net_addr: net_addr.into(),
            transport: "UDP".to_string(),
            sip_ip: String::new(),
            media_ip: String::new(),
            sn: AtomicU32::new(0),
            channels: DashMap::new(),
        }
    }

    pub fn from_config(cfg: &DeviceConfig, sip_ip: &str, media_ip: &str) -> Self {
        let mut device = Self::new(cfg.id.clone(), cfg.addr.clone());
        if !cfg.transport.is_empty() {
            device.transport = cfg.transport.to_ascii_uppercase();
        }
        device.sip_ip = sip_ip.to_string();
        device.media_ip = if cfg.media_ip.is_empty() {
            media_ip.to_string()
        } else {
            cfg.media_ip.clone()
        };
        for channel in &cfg.channels {
            device.add_channel(ChannelInfo::from(channel));
        }
        device
    }

    /// 递增并返回新的请求序号
    pub fn next_sn(&self) -> u32 {
        self.sn.fetch_add(1, Ordering::AcqRel).wrapping_add(1)
    }

    /// 当前请求序号
    pub fn sn(&self) -> u32 {
        self.sn.load(Ordering::Acquire)
    }

    /// 设备 IP（不含端口）
    pub fn ip(&self) -> &str {
        match self.net_addr.rfind(':') {
            Some(idx) => &self.net_addr[..idx],
            None => &self.net_addr,
        }
    }

    /// 添加通道，已存在时返回原通道
    pub fn add_channel(&self, info: ChannelInfo) -> Arc<Channel> {
        self.channels
            .entry(info.device_id.clone())
            .or_insert_with(|| Arc::new(Channel::new(self.id.clone(), info)))
            .value()
            .clone()
    }

    pub fn get_channel(&self, channel_id: &str) -> Option<Arc<Channel>> {
        self.channels.get(channel_id).map(|c| c.value().clone())
    }

    pub fn channels(&self) -> Vec<Arc<Channel>> {
        self.channels.iter().map(|c| c.value().clone()).collect()
    }
}

/// 设备管理器
#[derive(Debug, Default)]
pub struct DeviceManager {
    devices: DashMap<String, Arc<Device>>,
}

impl DeviceManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// 注册设备
    pub fn register_device(&self, device: Device) -> Arc<Device> {
        let device = Arc::new(device);
        self.devices.insert(device.id.clone(), device.clone());
        tracing::info!(target: "gb28181::device", device_id = %device.id, "device registered");
        device
    }

    pub fn get_device(&self, device_id: &str) -> Option<Arc<Device>> {
        self.devices.get(device_id).map(|d| d.value().clone())
    }

    pub fn find_channel(&self, device_id: &str, channel_id: &str) -> Option<Arc<Channel>> {
        self.get_device(device_id)?.get_channel(channel_id)
    }

    /// 列出所有设备
    pub fn list_devices(&self) -> Vec<Arc<Device>> {
        self.devices.iter().map(|d| d.value().clone()).collect()
    }
}
