use thiserror::Error;

use crate::ps::PsError;

/// 通用结果码（沿用 HTTP 状态码作为不透明的结果分类）
pub mod status {
    pub const OK: u16 = 200;
    pub const NOT_MODIFIED: u16 = 304;
    pub const BAD_REQUEST: u16 = 400;
    pub const NOT_FOUND: u16 = 404;
    pub const METHOD_NOT_ALLOWED: u16 = 405;
    pub const REQUEST_TIMEOUT: u16 = 408;
    pub const CALL_DOES_NOT_EXIST: u16 = 481;
    pub const INTERNAL_SERVER_ERROR: u16 = 500;
}

#[derive(Error, Debug)]
pub enum GbError {
    #[error("Device not found: {0}")]
    DeviceNotFound(String),

    #[error("Channel not found: {0}")]
    ChannelNotFound(String),

    #[error("Session not found: {0}")]
    SessionNotFound(String),

    #[error("Stream already exists: {0}")]
    StreamAlreadyExists(String),

    #[error("No media port available")]
    PortExhausted,

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Timeout")]
    Timeout,

    #[error("Rejected by remote, status={0}")]
    Rejected(u16),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("SIP message error: {0}")]
    Sip(String),

    #[error("SDP error: {0}")]
    Sdp(String),

    #[error("PS demux error: {0}")]
    Demux(#[from] PsError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("XML error: {0}")]
    Xml(#[from] quick_xml::DeError),

    #[error("Config error: {0}")]
    Config(#[from] config::ConfigError),
}

impl GbError {
    /// 映射到调用方可见的结果码
    pub fn status_code(&self) -> u16 {
        match self {
            GbError::DeviceNotFound(_)
            | GbError::ChannelNotFound(_)
            | GbError::SessionNotFound(_) => status::NOT_FOUND,
            GbError::Timeout => status::REQUEST_TIMEOUT,
            GbError::Rejected(code) => *code,
            GbError::InvalidArgument(_) => status::BAD_REQUEST,
            _ => status::INTERNAL_SERVER_ERROR,
        }
    }
}

pub type Result<T> = std::result::Result<T, GbError>;
