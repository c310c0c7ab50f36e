// GB28181 服务配置

use crate::{GbError, Result};
use config::{Config, Environment, File, FileFormat};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// 拉流模式
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum InviteMode {
    /// 手动拉流
    Manual,
    /// 预拉流：通道上线即邀请
    #[default]
    Auto,
    /// 按需拉流：有订阅时邀请
    OnSubscribe,
}

/// 媒体传输协议
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaNetwork {
    Tcp,
    Udp,
}

impl MediaNetwork {
    pub fn is_tcp(&self) -> bool {
        matches!(self, MediaNetwork::Tcp)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            MediaNetwork::Tcp => "tcp",
            MediaNetwork::Udp => "udp",
        }
    }
}

/// 媒体端口配置，形如 `tcp:58200-59200` 或 `udp:58200`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MediaPortSpec {
    pub network: MediaNetwork,
    /// 单端口时为 (port, port)
    pub min: u16,
    pub max: u16,
}

impl MediaPortSpec {
    pub fn parse(spec: &str) -> Result<Self> {
        let (network, ports) = spec
            .split_once(':')
            .ok_or_else(|| GbError::InvalidArgument(format!("invalid media port spec: {}", spec)))?;

        let network = match network.trim().to_ascii_lowercase().as_str() {
            "tcp" => MediaNetwork::Tcp,
            "udp" => MediaNetwork::Udp,
            other => {
                return Err(GbError::InvalidArgument(format!(
                    "unsupported media network: {}",
                    other
                )))
            }
        };

        let parse_port = |s: &str| {
            s.trim()
                .parse::<u16>()
                .map_err(|_| GbError::InvalidArgument(format!("invalid port: {}", s)))
        };

        let (min, max) = match ports.split_once('-') {
            Some((min, max)) => (parse_port(min)?, parse_port(max)?),
            None => {
                let port = parse_port(ports)?;
                (port, port)
            }
        };

        if min > max {
            return Err(GbError::InvalidArgument(format!(
                "port range {}-{} is reversed",
                min, max
            )));
        }

        Ok(Self { network, min, max })
    }

    /// 单端口配置，强制多路复用
    pub fn is_single(&self) -> bool {
        self.min == self.max
    }
}

/// 静态通道配置
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct ChannelConfig {
    pub id: String,
    pub parent_id: String,
    pub name: String,
    pub manufacturer: String,
    pub address: String,
    pub status: String,
    /// 通道独立端口，0 表示使用设备地址
    pub port: u16,
}

/// 静态设备配置（不处理设备注册，由配置直接给出）
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct DeviceConfig {
    pub id: String,
    /// 设备信令地址 `ip:port`
    pub addr: String,
    pub transport: String,
    pub media_ip: String,
    pub channels: Vec<ChannelConfig>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Gb28181Config {
    pub invite_mode: InviteMode,
    /// 允许邀请的设备类型（编码 11～13 位），逗号分割，支持 `131-133` 范围
    pub invite_ids: String,
    pub listen_addr: String,

    pub serial: String,
    pub realm: String,
    pub sip_ip: String,
    pub sip_port: u16,
    pub sip_network: String,

    pub media_ip: String,
    pub media: String,
    /// 多路复用
    pub fdm: bool,
    pub dump_path: String,

    pub user_agent: String,
    pub request_timeout_secs: u64,
    pub invite_retry_secs: u64,
    pub query_record_timeout_secs: u64,
    pub playback_idle_timeout_secs: u64,
    pub playback_delay_close_secs: u64,

    pub log_level: String,
    pub devices: Vec<DeviceConfig>,
}

impl Default for Gb28181Config {
    fn default() -> Self {
        Self {
            invite_mode: InviteMode::Auto,
            invite_ids: "131,132".to_string(),
            listen_addr: "0.0.0.0".to_string(),
            serial: "34020000002000000001".to_string(),
            realm: "3402000000".to_string(),
            sip_ip: "127.0.0.1".to_string(),
            sip_port: 5060,
            sip_network: "udp".to_string(),
            media_ip: "127.0.0.1".to_string(),
            media: "tcp:58200-59200".to_string(),
            fdm: false,
            dump_path: String::new(),
            user_agent: "FLUX-GB28181".to_string(),
            request_timeout_secs: 10,
            invite_retry_secs: 5,
            query_record_timeout_secs: 5,
            playback_idle_timeout_secs: 10,
            playback_delay_close_secs: 10,
            log_level: "info".to_string(),
            devices: Vec::new(),
        }
    }
}

impl Gb28181Config {
    pub fn media_port_spec(&self) -> Result<MediaPortSpec> {
        MediaPortSpec::parse(&self.media)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn invite_retry_delay(&self) -> Duration {
        Duration::from_secs(self.invite_retry_secs)
    }

    pub fn query_record_timeout(&self) -> Duration {
        Duration::from_secs(self.query_record_timeout_secs)
    }

    /// 验证配置
    pub fn validate(&self) -> Result<()> {
        if self.serial.len() != 20 {
            return Err(GbError::InvalidArgument(format!(
                "serial must be 20 digits: {}",
                self.serial
            )));
        }
        if self.realm.len() != 10 {
            return Err(GbError::InvalidArgument(format!(
                "realm must be 10 digits: {}",
                self.realm
            )));
        }
        self.media_port_spec()?;
        if self.sip_port == 0 {
            return Err(GbError::InvalidArgument("sip_port must not be 0".into()));
        }
        Ok(())
    }
}

/// 配置加载器
pub struct ConfigLoader;

impl ConfigLoader {
    /// 从 TOML 文件加载，文件不存在时使用默认值；环境变量 `GB28181_*` 覆盖
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Gb28181Config> {
        let path = path.as_ref();
        let mut builder = Config::builder();

        if path.exists() {
            let path = path
                .to_str()
                .ok_or_else(|| GbError::InvalidArgument("Invalid config path".into()))?;
            builder = builder.add_source(File::new(path, FileFormat::Toml));
        }

        let config = builder
            .add_source(Environment::with_prefix("GB28181").try_parsing(true))
            .build()?;

        let config: Gb28181Config = config.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// 从字符串加载
    pub fn load_str(content: &str) -> Result<Gb28181Config> {
        let config = Config::builder()
            .add_source(File::from_str(content, FileFormat::Toml))
            .build()?;

        let config: Gb28181Config = config.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }
}
