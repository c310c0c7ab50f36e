// PS 流解封装层
// Program Stream (MPEG-PS) 解封装

pub mod demuxer;
pub mod packet;

pub use demuxer::PsDemuxer;
pub use packet::{AudioCodec, PsError, PsPacketType, PsReader, VideoCodec};
