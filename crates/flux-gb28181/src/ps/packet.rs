// PS 数据包解析
// MPEG-PS (Program Stream) 格式，大端序，以起始码分隔

use bytes::Bytes;
use thiserror::Error;

pub const START_CODE_PS: u32 = 0x0000_01BA;
pub const START_CODE_SYS: u32 = 0x0000_01BB;
pub const START_CODE_MAP: u32 = 0x0000_01BC;
pub const START_CODE_VIDEO: u32 = 0x0000_01E0;
pub const START_CODE_AUDIO: u32 = 0x0000_01C0;
pub const START_CODE_PRIVATE: u32 = 0x0000_01BD;
pub const START_CODE_END: u32 = 0x0000_01B9;

/// 起始码前缀 00 00 01
pub const START_CODE_PREFIX: u32 = 0x0000_01;

pub const STREAM_TYPE_H264: u8 = 0x1B;
pub const STREAM_TYPE_H265: u8 = 0x24;
pub const STREAM_TYPE_AAC: u8 = 0x0F;
pub const STREAM_TYPE_G711A: u8 = 0x90;
pub const STREAM_TYPE_G711U: u8 = 0x91;
pub const STREAM_TYPE_G7221: u8 = 0x92;
pub const STREAM_TYPE_G7231: u8 = 0x93;
pub const STREAM_TYPE_G729: u8 = 0x99;

/// PS 解封装错误（按段报告，可恢复）
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum PsError {
    #[error("missing start code")]
    MissingStartCode,

    #[error("malformed pack")]
    MalformedPack,

    #[error("parse packet error")]
    ParsePacket,
}

/// PS 包类型
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PsPacketType {
    /// Pack Header (0xBA)
    PackHeader,

    /// System Header (0xBB)
    SystemHeader,

    /// Program Stream Map (0xBC)
    ProgramStreamMap,

    /// Program End (0xB9)
    ProgramEnd,

    /// Video Stream (0xE0-0xEF)
    Video,

    /// Audio Stream (0xC0-0xDF)
    Audio,

    /// 其他带长度字段的包（私有流、填充流等）
    Other,
}

impl PsPacketType {
    pub fn from_stream_id(stream_id: u8) -> Self {
        match stream_id {
            0xBA => Self::PackHeader,
            0xBB => Self::SystemHeader,
            0xBC => Self::ProgramStreamMap,
            0xB9 => Self::ProgramEnd,
            0xE0..=0xEF => Self::Video,
            0xC0..=0xDF => Self::Audio,
            _ => Self::Other,
        }
    }
}

/// 视频编码（由 PSM 中的 stream_type 推断）
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VideoCodec {
    H264,
    H265,
    Unknown(u8),
}

impl VideoCodec {
    pub fn from_stream_type(stream_type: u8) -> Self {
        match stream_type {
            STREAM_TYPE_H264 => Self::H264,
            STREAM_TYPE_H265 => Self::H265,
            other => Self::Unknown(other),
        }
    }
}

/// 音频编码
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AudioCodec {
    Aac,
    G711A,
    G711U,
    G7221,
    G7231,
    G729,
    Unknown(u8),
}

impl AudioCodec {
    pub fn from_stream_type(stream_type: u8) -> Self {
        match stream_type {
            STREAM_TYPE_AAC => Self::Aac,
            STREAM_TYPE_G711A => Self::G711A,
            STREAM_TYPE_G711U => Self::G711U,
            STREAM_TYPE_G7221 => Self::G7221,
            STREAM_TYPE_G7231 => Self::G7231,
            STREAM_TYPE_G729 => Self::G729,
            other => Self::Unknown(other),
        }
    }
}

/// 越界读取一律返回 `PsError::ParsePacket`
#[derive(Debug)]
pub struct PsReader {
    data: Bytes,
    pos: usize,
}

impl PsReader {
    pub fn new(data: Bytes) -> Self {
        Self { data, pos: 0 }
    }

    pub fn remaining(&self) -> usize {
        self.data.len() - self.pos
    }

    pub fn read_u8(&mut self) -> Result<u8, PsError> {
        let b = *self.data.get(self.pos).ok_or(PsError::ParsePacket)?;
        self.pos += 1;
        Ok(b)
    }

    pub fn peek_u8(&self) -> Result<u8, PsError> {
        self.data.get(self.pos).copied().ok_or(PsError::ParsePacket)
    }

    pub fn read_u16(&mut self) -> Result<u16, PsError> {
        let b = self.read_slice(2)?;
        Ok(u16::from_be_bytes([b[0], b[1]]))
    }

    pub fn read_u32(&mut self) -> Result<u32, PsError> {
        let b = self.read_slice(4)?;
        Ok(u32::from_be_bytes([b[0], b[1], b[2], b[3]]))
    }

    pub fn skip(&mut self, n: usize) -> Result<(), PsError> {
        if n > self.remaining() {
            return Err(PsError::ParsePacket);
        }
        self.pos += n;
        Ok(())
    }

    /// 零拷贝切出 n 字节
    pub fn read_bytes(&mut self, n: usize) -> Result<Bytes, PsError> {
        if n > self.remaining() {
            return Err(PsError::ParsePacket);
        }
        let out = self.data.slice(self.pos..self.pos + n);
        self.pos += n;
        Ok(out)
    }

    fn read_slice(&mut self, n: usize) -> Result<&[u8], PsError> {
        if n > self.remaining() {
            return Err(PsError::ParsePacket);
        }
        let start = self.pos;
        self.pos += n;
        Ok(&self.data[start..start + n])
    }
}

/// 解析 5 字节 PTS/DTS（33 位，3+15+15 位片段之间穿插 marker 位）
pub fn parse_timestamp(data: &[u8]) -> Option<u64> {
    if data.len() < 5 {
        return None;
    }

    let b0 = data[0] as u64;
    let b1 = data[1] as u64;
    let b2 = data[2] as u64;
    let b3 = data[3] as u64;
    let b4 = data[4] as u64;

    let ts = ((b0 & 0x0E) << 29)
        | (b1 << 22)
        | ((b2 & 0xFE) << 14)
        | (b3 << 7)
        | (b4 >> 1);

    Some(ts)
}

/// 按 PES 头格式编码 33 位时间戳，`prefix` 为高 4 位（PTS-only 0b0010，PTS 0b0011，DTS 0b0001）
pub fn encode_timestamp(prefix: u8, ts: u64) -> [u8; 5] {
    [
        (prefix << 4) | ((((ts >> 30) & 0x07) as u8) << 1) | 0x01,
        ((ts >> 22) & 0xFF) as u8,
        ((((ts >> 15) & 0x7F) as u8) << 1) | 0x01,
        ((ts >> 7) & 0xFF) as u8,
        (((ts & 0x7F) as u8) << 1) | 0x01,
    ]
}

/// 解析 pack header 中的 SCR（6 字节）：返回 (base, extension)
pub fn parse_scr(data: &[u8]) -> Option<(u64, u16)> {
    if data.len() < 6 {
        return None;
    }

    let b = |i: usize| data[i] as u64;
    let base = ((b(0) & 0x38) << 27)
        | ((b(0) & 0x03) << 28)
        | (b(1) << 20)
        | ((b(2) & 0xF8) << 12)
        | ((b(2) & 0x03) << 13)
        | (b(3) << 5)
        | (b(4) >> 3);
    let ext = (((b(4) & 0x03) << 7) | (b(5) >> 1)) as u16;

    Some((base, ext))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ps_packet_type() {
        assert_eq!(PsPacketType::from_stream_id(0xBA), PsPacketType::PackHeader);
        assert_eq!(PsPacketType::from_stream_id(0xBB), PsPacketType::SystemHeader);
        assert_eq!(PsPacketType::from_stream_id(0xBC), PsPacketType::ProgramStreamMap);
        assert_eq!(PsPacketType::from_stream_id(0xE0), PsPacketType::Video);
        assert_eq!(PsPacketType::from_stream_id(0xEF), PsPacketType::Video);
        assert_eq!(PsPacketType::from_stream_id(0xC0), PsPacketType::Audio);
        assert_eq!(PsPacketType::from_stream_id(0xDF), PsPacketType::Audio);
        assert_eq!(PsPacketType::from_stream_id(0xBD), PsPacketType::Other);
    }

    #[test]
    fn test_parse_timestamp_boundaries() {
        let samples: [u64; 12] = [
            0,
            1,
            0x7F,
            0x80,
            0x7FFF,
            0x8000,
            90_000,
            0x3FFF_FFFF,
            0x4000_0000,
            0xFFFF_FFFF,
            0x1_0000_0000,
            0x1_FFFF_FFFF,
        ];
        for ts in samples {
            for prefix in [0b0010, 0b0011, 0b0001] {
                let encoded = encode_timestamp(prefix, ts);
                assert_eq!(parse_timestamp(&encoded), Some(ts), "ts={:#x}", ts);
            }
        }
    }

    #[test]
    fn test_parse_timestamp_every_bit() {
        for bit in 0..33 {
            let ts = 1u64 << bit;
            assert_eq!(parse_timestamp(&encode_timestamp(0b0010, ts)), Some(ts));
        }
    }

    #[test]
    fn test_parse_timestamp_ignores_marker_bits() {
        let mut encoded = encode_timestamp(0b0010, 0x1_2345_6789);
        encoded[0] &= 0xFE;
        encoded[2] &= 0xFE;
        encoded[4] &= 0xFE;
        assert_eq!(parse_timestamp(&encoded), Some(0x1_2345_6789));
    }

    #[test]
    fn test_parse_timestamp_short_input() {
        assert_eq!(parse_timestamp(&[0x21, 0x00, 0x01, 0x00]), None);
    }

    #[test]
    fn test_reader_bounds() {
        let mut reader = PsReader::new(Bytes::from_static(&[0x00, 0x01, 0x02]));
        assert_eq!(reader.read_u16(), Ok(1));
        assert_eq!(reader.read_u16(), Err(PsError::ParsePacket));
        assert_eq!(reader.remaining(), 1);
        assert_eq!(reader.skip(2), Err(PsError::ParsePacket));
        assert_eq!(reader.read_u8(), Ok(2));
        assert_eq!(reader.read_bytes(1), Err(PsError::ParsePacket));
    }

    #[test]
    fn test_parse_scr() {
        // SCR base = 1, ext = 0
        let data = [0x44, 0x00, 0x04, 0x00, 0x0C, 0x01];
        assert_eq!(parse_scr(&data), Some((1, 0)));
    }
}
