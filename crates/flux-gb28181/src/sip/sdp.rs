// SDP 会话描述
// GB28181 扩展：y= 行携带 SSRC，f= 行携带音视频参数

use crate::{GbError, Result};
use std::fmt;

/// f= 字段视频参数：编码格式/分辨率/帧率/码率类型/码率大小
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct VideoFormat {
    pub codec: String,
    pub resolution: String,
    pub frame_rate: String,
    pub bitrate_type: String,
    pub bitrate: String,
}

/// f= 字段音频参数：编码格式/码率大小/采样率
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AudioFormat {
    pub codec: String,
    pub bitrate: String,
    pub sample_rate: String,
}

/// f= 字段，缺省参数留空但保留分隔符
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MediaFormat {
    pub video: VideoFormat,
    pub audio: AudioFormat,
}

impl fmt::Display for MediaFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let v = &self.video;
        let a = &self.audio;
        write!(
            f,
            "v/{}/{}/{}/{}/{}a/{}/{}/{}",
            v.codec, v.resolution, v.frame_rate, v.bitrate_type, v.bitrate, a.codec, a.bitrate, a.sample_rate
        )
    }
}

impl MediaFormat {
    /// 解析 `v/2/5/25/1/4096a/1/8/1`，缺少的部分按空值处理
    pub fn parse(value: &str) -> Result<Self> {
        let value = value.trim();
        let rest = value
            .strip_prefix("v/")
            .ok_or_else(|| GbError::Sdp(format!("invalid f field: {}", value)))?;

        let (video, audio) = match rest.find('a') {
            Some(pos) => {
                let audio = &rest[pos + 1..];
                (&rest[..pos], audio.strip_prefix('/').unwrap_or(audio))
            }
            None => (rest, ""),
        };

        let mut v = video.split('/').map(str::to_string);
        let mut a = audio.split('/').map(str::to_string);

        Ok(Self {
            video: VideoFormat {
                codec: v.next().unwrap_or_default(),
                resolution: v.next().unwrap_or_default(),
                frame_rate: v.next().unwrap_or_default(),
                bitrate_type: v.next().unwrap_or_default(),
                bitrate: v.next().unwrap_or_default(),
            },
            audio: AudioFormat {
                codec: a.next().unwrap_or_default(),
                bitrate: a.next().unwrap_or_default(),
                sample_rate: a.next().unwrap_or_default(),
            },
        })
    }
}

/// SDP 媒体描述
#[derive(Debug, Clone, PartialEq)]
pub struct SdpMedia {
    /// 媒体类型（video/audio）
    pub media_type: String,

    /// 端口
    pub port: u16,

    /// 传输协议（RTP/AVP、TCP/RTP/AVP）
    pub protocol: String,

    /// 格式列表
    pub formats: Vec<u8>,

    /// 属性（不含 a= 前缀），按出现顺序
    pub attributes: Vec<String>,
}

impl SdpMedia {
    /// GB28181 PS 流媒体行
    pub fn ps_video(port: u16, tcp: bool) -> Self {
        let mut attributes = vec!["recvonly".to_string(), "rtpmap:96 PS/90000".to_string()];
        if tcp {
            attributes.push("setup:passive".to_string());
            attributes.push("connection:new".to_string());
        }
        Self {
            media_type: "video".to_string(),
            port,
            protocol: if tcp { "TCP/RTP/AVP" } else { "RTP/AVP" }.to_string(),
            formats: vec![96],
            attributes,
        }
    }

    pub fn is_tcp(&self) -> bool {
        self.protocol.eq_ignore_ascii_case("TCP/RTP/AVP")
    }
}

/// SDP 会话描述
#[derive(Debug, Clone, PartialEq)]
pub struct SdpSession {
    /// 版本
    pub version: u8,

    /// o= 行用户名（通道 ID）
    pub session_id: String,

    /// Play / Playback / Download
    pub session_name: String,

    /// u= 行
    pub uri: Option<String>,

    /// c= 行地址
    pub address: String,

    /// t= 行起止时间
    pub start: i64,
    pub end: i64,

    /// f= 行
    pub format: Option<MediaFormat>,

    /// 媒体描述
    pub media: Vec<SdpMedia>,

    /// SSRC（y= 行，十位数字字符串）
    pub ssrc: Option<String>,
}

impl SdpSession {
    /// 创建新的 SDP 会话
    pub fn new(session_id: impl Into<String>, address: impl Into<String>) -> Self {
        Self {
            version: 0,
            session_id: session_id.into(),
            session_name: "Play".to_string(),
            uri: None,
            address: address.into(),
            start: 0,
            end: 0,
            format: None,
            media: Vec::new(),
            ssrc: None,
        }
    }

    /// 数值形式的 SSRC
    pub fn ssrc_value(&self) -> Option<u32> {
        self.ssrc.as_deref().and_then(|s| s.trim().parse().ok())
    }

    /// 第一个视频媒体描述
    pub fn video(&self) -> Option<&SdpMedia> {
        self.media.iter().find(|m| m.media_type == "video")
    }

    /// 从字符串解析 SDP
    pub fn from_string(sdp: &str) -> Result<Self> {
        let mut session = SdpSession::new(String::new(), String::new());
        session.session_name.clear();

        for line in sdp.lines() {
            let line = line.trim();
            let Some((key, value)) = line.split_once('=') else {
                continue;
            };

            match key {
                "v" => {
                    session.version = value
                        .parse()
                        .map_err(|_| GbError::Sdp(format!("invalid version: {}", value)))?;
                }
                "o" => {
                    if let Some(user) = value.split_whitespace().next() {
                        session.session_id = user.to_string();
                    }
                }
                "s" => session.session_name = value.to_string(),
                "u" => session.uri = Some(value.to_string()),
                "c" => {
                    if let Some(addr) = value.split_whitespace().nth(2) {
                        session.address = addr.to_string();
                    }
                }
                "t" => {
                    let mut parts = value.split_whitespace().map(|s| s.parse::<i64>().unwrap_or(0));
                    session.start = parts.next().unwrap_or(0);
                    session.end = parts.next().unwrap_or(0);
                }
                "f" if !value.is_empty() => session.format = Some(MediaFormat::parse(value)?),
                "y" if !value.is_empty() => session.ssrc = Some(value.to_string()),
                "m" => {
                    let parts: Vec<&str> = value.split_whitespace().collect();
                    if parts.len() < 3 {
                        return Err(GbError::Sdp(format!("invalid media line: {}", value)));
                    }
                    session.media.push(SdpMedia {
                        media_type: parts[0].to_string(),
                        port: parts[1]
                            .parse()
                            .map_err(|_| GbError::Sdp(format!("invalid media port: {}", parts[1])))?,
                        protocol: parts[2].to_string(),
                        formats: parts[3..].iter().filter_map(|s| s.parse().ok()).collect(),
                        attributes: Vec::new(),
                    });
                }
                "a" => {
                    if let Some(media) = session.media.last_mut() {
                        media.attributes.push(value.to_string());
                    }
                }
                _ => {}
            }
        }

        Ok(session)
    }
}

impl fmt::Display for SdpSession {
    /// 字段顺序：v o s u c t f m a y
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "v={}\r\n", self.version)?;
        write!(f, "o={} 0 0 IN IP4 {}\r\n", self.session_id, self.address)?;
        write!(f, "s={}\r\n", self.session_name)?;
        if let Some(uri) = &self.uri {
            write!(f, "u={}\r\n", uri)?;
        }
        write!(f, "c=IN IP4 {}\r\n", self.address)?;
        write!(f, "t={} {}\r\n", self.start, self.end)?;
        if let Some(format) = &self.format {
            write!(f, "f={}\r\n", format)?;
        }

        for media in &self.media {
            let formats: Vec<String> = media.formats.iter().map(|p| p.to_string()).collect();
            write!(
                f,
                "m={} {} {} {}\r\n",
                media.media_type,
                media.port,
                media.protocol,
                formats.join(" ")
            )?;
            for attr in &media.attributes {
                write!(f, "a={}\r\n", attr)?;
            }
        }

        if let Some(ssrc) = &self.ssrc {
            write!(f, "y={}\r\n", ssrc)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sdp_generation() {
        let mut session = SdpSession::new("34020000001320000002", "192.168.1.100");
        session.uri = Some("34020000001320000002:0".into());
        session.format = Some(MediaFormat::default());
        session.media.push(SdpMedia::ps_video(58200, true));
        session.ssrc = Some("0200001234".into());

        let expected = "v=0\r\n\
            o=34020000001320000002 0 0 IN IP4 192.168.1.100\r\n\
            s=Play\r\n\
            u=34020000001320000002:0\r\n\
            c=IN IP4 192.168.1.100\r\n\
            t=0 0\r\n\
            f=v/////a///\r\n\
            m=video 58200 TCP/RTP/AVP 96\r\n\
            a=recvonly\r\n\
            a=rtpmap:96 PS/90000\r\n\
            a=setup:passive\r\n\
            a=connection:new\r\n\
            y=0200001234\r\n";
        assert_eq!(session.to_string(), expected);
    }

    #[test]
    fn test_udp_media_has_no_tcp_attributes() {
        let media = SdpMedia::ps_video(58200, false);
        assert_eq!(media.protocol, "RTP/AVP");
        assert!(!media.is_tcp());
        assert_eq!(media.attributes.len(), 2);
    }

    #[test]
    fn test_media_format_preserves_delimiters() {
        let mut format = MediaFormat::default();
        format.video.codec = "2".into();
        format.video.resolution = "6".into();
        assert_eq!(format.to_string(), "v/2/6///a///");

        format.audio.codec = "1".into();
        format.audio.sample_rate = "1".into();
        assert_eq!(format.to_string(), "v/2/6///a/1//1");
    }

    #[test]
    fn test_media_format_parse() {
        let format = MediaFormat::parse("v/2/5/25/1/4096a/1/8/1").unwrap();
        assert_eq!(format.video.codec, "2");
        assert_eq!(format.video.bitrate, "4096");
        assert_eq!(format.audio.sample_rate, "1");

        let video_only = MediaFormat::parse("v/2/5/25/1/4096a///").unwrap();
        assert_eq!(video_only.audio, AudioFormat::default());

        let audio_only = MediaFormat::parse("v/a/1/8/1").unwrap();
        assert_eq!(audio_only.video.codec, "");
        assert_eq!(audio_only.audio.codec, "1");

        let no_audio_codec = MediaFormat::parse("v/2////a//8/1").unwrap();
        assert_eq!(no_audio_codec.audio.codec, "");
        assert_eq!(no_audio_codec.audio.bitrate, "8");

        assert!(MediaFormat::parse("x/1").is_err());
    }

    #[test]
    fn test_sdp_answer_parsing() {
        let sdp_str = "v=0\r\n\
                       o=34020000001320000002 0 0 IN IP4 192.168.1.200\r\n\
                       s=Play\r\n\
                       c=IN IP4 192.168.1.200\r\n\
                       t=0 0\r\n\
                       m=video 15060 RTP/AVP 96\r\n\
                       a=sendonly\r\n\
                       a=rtpmap:96 PS/90000\r\n\
                       y=0100001234\r\n";

        let session = SdpSession::from_string(sdp_str).unwrap();
        assert_eq!(session.session_id, "34020000001320000002");
        assert_eq!(session.address, "192.168.1.200");
        assert_eq!(session.ssrc_value(), Some(100001234));

        let video = session.video().unwrap();
        assert_eq!(video.port, 15060);
        assert!(!video.is_tcp());
        assert_eq!(video.attributes, vec!["sendonly", "rtpmap:96 PS/90000"]);
    }

    #[test]
    fn test_sdp_invalid_media_line() {
        assert!(SdpSession::from_string("v=0\r\nm=video\r\n").is_err());
    }
}
