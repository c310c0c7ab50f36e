// RTP 数据包解析
// RFC 3550 - RTP: A Transport Protocol for Real-Time Applications

use bytes::{BufMut, Bytes, BytesMut};

/// RTP 头部
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RtpHeader {
    /// 版本（2 bits）
    pub version: u8,

    /// 填充标志（1 bit）
    pub padding: bool,

    /// 扩展标志（1 bit）
    pub extension: bool,

    /// CSRC 计数（4 bits）
    pub csrc_count: u8,

    /// 标记位（1 bit）
    pub marker: bool,

    /// 负载类型（7 bits）
    pub payload_type: u8,

    /// 序列号（16 bits）
    pub sequence: u16,

    /// 时间戳（32 bits）
    pub timestamp: u32,

    pub ssrc: u32,
}

impl RtpHeader {
    /// 从字节数组解析 RTP 头部
    pub fn from_bytes(data: &[u8]) -> Option<Self> {
        if data.len() < 12 {
            return None;
        }

        let byte0 = data[0];
        let byte1 = data[1];

        Some(Self {
            version: (byte0 >> 6) & 0x03,
            padding: (byte0 & 0x20) != 0,
            extension: (byte0 & 0x10) != 0,
            csrc_count: byte0 & 0x0F,
            marker: (byte1 & 0x80) != 0,
            payload_type: byte1 & 0x7F,
            sequence: u16::from_be_bytes([data[2], data[3]]),
            timestamp: u32::from_be_bytes([data[4], data[5], data[6], data[7]]),
            ssrc: u32::from_be_bytes([data[8], data[9], data[10], data[11]]),
        })
    }

    /// 固定头部 + CSRC 长度（字节）
    pub fn header_len(&self) -> usize {
        12 + (self.csrc_count as usize * 4)
    }
}

/// RTP 数据包
#[derive(Debug, Clone)]
pub struct RtpPacket {
    pub header: RtpHeader,

    /// 负载数据（已去除扩展头和填充）
    pub payload: Bytes,
}

impl RtpPacket {
    /// 从字节数组解析 RTP 数据包
    pub fn from_bytes(data: Bytes) -> Option<Self> {
        let header = RtpHeader::from_bytes(&data)?;
        if header.version != 2 {
            return None;
        }

        let mut start = header.header_len();
        if header.extension {
            let ext = data.get(start..start + 4)?;
            let words = u16::from_be_bytes([ext[2], ext[3]]) as usize;
            start += 4 + words * 4;
        }

        let mut end = data.len();
        if header.padding {
            let pad = *data.last()? as usize;
            end = end.checked_sub(pad)?;
        }

        if start > end {
            return None;
        }

        let payload = data.slice(start..end);
        Some(Self { header, payload })
    }

    pub fn new(ssrc: u32, sequence: u16, timestamp: u32, marker: bool, payload: Bytes) -> Self {
        Self {
            header: RtpHeader {
                version: 2,
                padding: false,
                extension: false,
                csrc_count: 0,
                marker,
                payload_type: 96,
                sequence,
                timestamp,
                ssrc,
            },
            payload,
        }
    }

    /// 序列化（不含扩展与 CSRC）
    pub fn to_bytes(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(12 + self.payload.len());
        buf.put_u8(0x80);
        buf.put_u8(((self.header.marker as u8) << 7) | (self.header.payload_type & 0x7F));
        buf.put_u16(self.header.sequence);
        buf.put_u32(self.header.timestamp);
        buf.put_u32(self.header.ssrc);
        buf.put_slice(&self.payload);
        buf.freeze()
    }

    pub fn sequence(&self) -> u16 {
        self.header.sequence
    }

    pub fn timestamp(&self) -> u32 {
        self.header.timestamp
    }

    pub fn ssrc(&self) -> u32 {
        self.header.ssrc
    }

    /// 是否为标记包（通常表示帧结束）
    pub fn is_marker(&self) -> bool {
        self.header.marker
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rtp_header_parsing() {
        let data = vec![
            0x80, // V=2, P=0, X=0, CC=0
            0x60, // M=0, PT=96
            0x00, 0x01, // Sequence = 1
            0x00, 0x00, 0x00, 0x64, // Timestamp = 100
            0x12, 0x34, 0x56, 0x78, // SSRC
        ];

        let header = RtpHeader::from_bytes(&data).unwrap();

        assert_eq!(header.version, 2);
        assert!(!header.padding);
        assert!(!header.marker);
        assert_eq!(header.payload_type, 96);
        assert_eq!(header.sequence, 1);
        assert_eq!(header.timestamp, 100);
        assert_eq!(header.ssrc, 0x12345678);
    }

    #[test]
    fn test_rtp_packet_with_extension_and_padding() {
        let mut data = vec![
            0xB0, 0xE0, 0x00, 0x02, // V=2 P=1 X=1, M=1
            0x00, 0x00, 0x00, 0x64,
            0x00, 0x00, 0x00, 0x01,
            0xBE, 0xDE, 0x00, 0x01, // 扩展头，1 个字
            0x01, 0x02, 0x03, 0x04,
        ];
        data.extend_from_slice(b"PS");
        data.extend_from_slice(&[0x00, 0x02]); // 2 字节填充

        let packet = RtpPacket::from_bytes(Bytes::from(data)).unwrap();
        assert!(packet.is_marker());
        assert_eq!(&packet.payload[..], b"PS");
    }

    #[test]
    fn test_rtp_packet_rejects_bad_input() {
        assert!(RtpPacket::from_bytes(Bytes::from_static(&[0x80, 0x60])).is_none());
        // 版本错误
        let data = [0x40u8, 0x60, 0, 1, 0, 0, 0, 1, 0, 0, 0, 1];
        assert!(RtpPacket::from_bytes(Bytes::copy_from_slice(&data)).is_none());
        // 填充长度超出
        let data = [0xA0u8, 0x60, 0, 1, 0, 0, 0, 1, 0, 0, 0, 1, 0xFF];
        assert!(RtpPacket::from_bytes(Bytes::copy_from_slice(&data)).is_none());
    }

    #[test]
    fn test_rtp_packet_serialize() {
        let packet = RtpPacket::new(0x0100_0001, 9, 3600, true, Bytes::from_static(b"Hello RTP"));
        let parsed = RtpPacket::from_bytes(packet.to_bytes()).unwrap();
        assert_eq!(parsed.header, packet.header);
        assert_eq!(&parsed.payload[..], b"Hello RTP");
    }
}
