// RTP 传输层
// 接收 RTP 承载的 PS 流并交给解封装

pub mod packet;
pub mod receiver;

pub use packet::{RtpHeader, RtpPacket};
pub use receiver::{FrameAssembler, MediaBinder, MediaHandle, MediaRelease, ReceiveOptions, RtpPsBinder};
