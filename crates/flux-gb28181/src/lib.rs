// flux-gb28181: GB28181 拉流核心库
//
// - SIP 信令：INVITE/ACK/BYE/INFO/MESSAGE
// - 媒体接收：RTP over UDP/TCP，PS 解封装为音视频帧
// - 会话管理：通道状态、端口分配、回放控制、云台、录像查询

pub mod config;
pub mod device;
pub mod error;
pub mod manscdp;
pub mod port;
pub mod ps;
pub mod ptz;
pub mod record;
pub mod rtp;
pub mod session;
pub mod sip;
pub mod stream;

// 重新导出常用类型
pub use config::{ConfigLoader, Gb28181Config, InviteMode, MediaNetwork};
pub use device::{Channel, ChannelInfo, ChannelState, Device, DeviceManager};
pub use error::{GbError, Result};
pub use session::{InviteOptions, InviteOutcome, SessionManager};
pub use stream::{FrameSink, MediaHub, StreamEngine, StreamEvent};

/// 初始化
pub fn init() {
    tracing::info!(target: "gb28181", "flux-gb28181 initialized");
}
