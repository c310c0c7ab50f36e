// PS 流解封装器
// 每次输入一个完整传输段，提取视频/音频负载及时间戳并推送给 FrameSink

use super::packet::{
    parse_scr, parse_timestamp, AudioCodec, PsError, PsPacketType, PsReader, VideoCodec,
    START_CODE_PREFIX, START_CODE_PS,
};
use crate::stream::FrameSink;
use bytes::{Bytes, BytesMut};

/// 段内累积的视频帧（多个视频 PES 拼接为一帧，段结束时只推送一次）
struct PendingVideo {
    ts: u32,
    cts: u32,
    data: BytesMut,
}

/// PS 解封装器
///
/// 除音视频 stream_type 外，每次 `read` 开始时所有字段都会重置。
#[derive(Debug, Default)]
pub struct PsDemuxer {
    scr_base: u64,
    scr_ext: u16,
    mux_rate: u32,

    video_stream_type: u8,
    audio_stream_type: u8,

    payload: Bytes,
    pts: u64,
    dts: u64,
}

impl PsDemuxer {
    pub fn new() -> Self {
        Self::default()
    }

    fn clean(&mut self) {
        self.scr_base = 0;
        self.scr_ext = 0;
        self.mux_rate = 0;
        self.payload = Bytes::new();
        self.pts = 0;
        self.dts = 0;
    }

    pub fn video_stream_type(&self) -> u8 {
        self.video_stream_type
    }

    pub fn audio_stream_type(&self) -> u8 {
        self.audio_stream_type
    }

    pub fn video_codec(&self) -> Option<VideoCodec> {
        (self.video_stream_type != 0).then(|| VideoCodec::from_stream_type(self.video_stream_type))
    }

    pub fn audio_codec(&self) -> Option<AudioCodec> {
        (self.audio_stream_type != 0).then(|| AudioCodec::from_stream_type(self.audio_stream_type))
    }

    /// 最近一个 pack header 的 SCR (base, extension)
    pub fn system_clock_reference(&self) -> (u64, u16) {
        (self.scr_base, self.scr_ext)
    }

    pub fn program_mux_rate(&self) -> u32 {
        self.mux_rate
    }

    /// 解析一个传输段
    ///
    /// `ts` 为外部时间提示（90kHz，通常取 RTP 时间戳），在 PES 未携带 PTS 时使用。
    pub fn read(&mut self, data: Bytes, ts: u32, sink: &dyn FrameSink) -> Result<(), PsError> {
        self.clean();

        let mut reader = PsReader::new(data);
        match reader.read_u32() {
            Ok(START_CODE_PS) => {}
            _ => return Err(PsError::MissingStartCode),
        }

        let mut video: Option<PendingVideo> = None;
        let result = self.read_packets(&mut reader, ts, sink, &mut video);

        if let Some(frame) = video {
            sink.push_video(frame.ts, frame.cts, frame.data.freeze());
        }

        result
    }

    fn read_packets(
        &mut self,
        reader: &mut PsReader,
        ts: u32,
        sink: &dyn FrameSink,
        video: &mut Option<PendingVideo>,
    ) -> Result<(), PsError> {
        self.dec_pack_header(reader)?;

        while reader.remaining() > 0 {
            let start_code = reader.read_u32()?;
            if start_code >> 8 != START_CODE_PREFIX {
                return Err(PsError::ParsePacket);
            }

            match PsPacketType::from_stream_id((start_code & 0xFF) as u8) {
                PsPacketType::PackHeader => self.dec_pack_header(reader)?,
                PsPacketType::SystemHeader => self.dec_system_header(reader)?,
                PsPacketType::ProgramStreamMap => self.dec_program_stream_map(reader)?,
                PsPacketType::ProgramEnd => break,
                PsPacketType::Video => {
                    self.dec_pes_packet(reader)?;
                    if let Some(frame) = video.as_mut() {
                        frame.data.extend_from_slice(&self.payload);
                    } else {
                        if self.pts == 0 {
                            self.pts = ts as u64;
                        }
                        let mut cts = 0;
                        if self.dts != 0 {
                            cts = self.pts.saturating_sub(self.dts);
                        } else {
                            self.dts = self.pts;
                        }

                        let mut data = BytesMut::with_capacity(self.payload.len());
                        data.extend_from_slice(&self.payload);
                        *video = Some(PendingVideo {
                            ts: (self.dts / 90) as u32,
                            cts: (cts / 90) as u32,
                            data,
                        });
                    }
                }
                PsPacketType::Audio => {
                    self.dec_pes_packet(reader)?;
                    let audio_ts = if self.pts != 0 {
                        (self.pts / 8) as u32
                    } else {
                        ts / 8
                    };
                    sink.push_audio(audio_ts, self.payload.clone());
                }
                PsPacketType::Other => {
                    let len = reader.read_u16()?;
                    reader.skip(len as usize)?;
                }
            }
        }

        Ok(())
    }

    fn dec_pack_header(&mut self, reader: &mut PsReader) -> Result<(), PsError> {
        // SCR(6) + program_mux_rate(3)
        let fixed = reader.read_bytes(9)?;
        if let Some((base, ext)) = parse_scr(&fixed) {
            self.scr_base = base;
            self.scr_ext = ext;
        }
        self.mux_rate =
            ((fixed[6] as u32) << 14) | ((fixed[7] as u32) << 6) | ((fixed[8] as u32) >> 2);

        let stuffing = reader.read_u8()? & 0x07;
        reader.skip(stuffing as usize)
    }

    fn dec_system_header(&mut self, reader: &mut PsReader) -> Result<(), PsError> {
        let header_len = reader.read_u16()? as usize;
        // rate_bound / audio_bound / video_bound / 标志位
        let mut remaining = header_len.checked_sub(6).ok_or(PsError::MalformedPack)?;
        reader.skip(6)?;

        // stream_id(8) + '11' + P-STD buffer(14)，stream_id 最高位为 1 时继续
        while remaining >= 3 {
            if reader.peek_u8()? & 0x80 == 0 {
                break;
            }
            reader.skip(3)?;
            remaining -= 3;
        }

        reader.skip(remaining)
    }

    fn dec_program_stream_map(&mut self, reader: &mut PsReader) -> Result<(), PsError> {
        let mut psm_len = reader.read_u16()? as usize;

        // current_next_indicator / version / marker
        reader.skip(2)?;
        psm_len = psm_len.checked_sub(2).ok_or(PsError::MalformedPack)?;

        let info_len = reader.read_u16()? as usize;
        reader.skip(info_len)?;
        psm_len = psm_len
            .checked_sub(info_len + 2)
            .ok_or(PsError::MalformedPack)?;

        let mut es_map_len = reader.read_u16()? as usize;
        psm_len = psm_len
            .checked_sub(es_map_len + 2)
            .ok_or(PsError::MalformedPack)?;

        while es_map_len > 0 {
            let stream_type = reader.read_u8()?;
            let elementary_stream_id = reader.read_u8()?;

            match elementary_stream_id {
                0xE0..=0xEF => self.video_stream_type = stream_type,
                0xC0..=0xDF => self.audio_stream_type = stream_type,
                _ => {}
            }

            let es_info_len = reader.read_u16()? as usize;
            reader.skip(es_info_len)?;
            es_map_len = es_map_len
                .checked_sub(4 + es_info_len)
                .ok_or(PsError::MalformedPack)?;
        }

        // CRC32
        if psm_len != 4 {
            return Err(PsError::MalformedPack);
        }
        reader.skip(4)
    }

    fn dec_pes_packet(&mut self, reader: &mut PsReader) -> Result<(), PsError> {
        let pes_len = reader.read_u16()? as usize;
        let packet = reader.read_bytes(pes_len)?;
        if packet.len() < 3 {
            return Err(PsError::ParsePacket);
        }

        let flags = packet[1];
        let pts_flag = flags & 0x80 != 0;
        let dts_flag = flags & 0x40 != 0;
        let header_data_len = packet[2] as usize;

        let body = packet.slice(3..);
        if header_data_len > body.len() {
            return Err(PsError::ParsePacket);
        }
        let extra = &body[..header_data_len];

        let mut pts = 0;
        let mut dts = 0;
        if pts_flag && extra.len() >= 5 {
            pts = parse_timestamp(&extra[..5]).unwrap_or(0);
            if dts_flag && extra.len() >= 10 {
                dts = parse_timestamp(&extra[5..10]).unwrap_or(0);
            }
        }

        self.pts = pts;
        self.dts = dts;
        self.payload = body.slice(header_data_len..);
        Ok(())
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::ps::packet::encode_timestamp;
    use std::sync::Mutex;

    #[derive(Default)]
    pub(crate) struct CollectSink {
        pub video: Mutex<Vec<(u32, u32, Bytes)>>,
        pub audio: Mutex<Vec<(u32, Bytes)>>,
    }

    impl FrameSink for CollectSink {
        fn push_video(&self, ts: u32, cts: u32, payload: Bytes) {
            self.video.lock().unwrap().push((ts, cts, payload));
        }

        fn push_audio(&self, ts: u32, payload: Bytes) {
            self.audio.lock().unwrap().push((ts, payload));
        }
    }

    pub(crate) fn pack_header(stuffing: u8) -> Vec<u8> {
        let mut out = vec![0x00, 0x00, 0x01, 0xBA];
        out.extend_from_slice(&[0x44, 0x00, 0x04, 0x00, 0x0C, 0x01, 0x01, 0x89, 0xC3]);
        out.push(0xF8 | stuffing);
        out.extend(std::iter::repeat(0xFF).take(stuffing as usize));
        out
    }

    pub(crate) fn system_header() -> Vec<u8> {
        let mut out = vec![0x00, 0x00, 0x01, 0xBB, 0x00, 0x0C];
        out.extend_from_slice(&[0x80, 0x04, 0xE1, 0x04, 0xE1, 0xFF]);
        out.extend_from_slice(&[0xE0, 0xE0, 0x80]);
        out.extend_from_slice(&[0xC0, 0xC0, 0x08]);
        out
    }

    pub(crate) fn program_stream_map(video_type: u8, audio_type: u8) -> Vec<u8> {
        let mut out = vec![0x00, 0x00, 0x01, 0xBC, 0x00, 0x12];
        out.extend_from_slice(&[0xE0, 0xFF]);
        out.extend_from_slice(&[0x00, 0x00]);
        out.extend_from_slice(&[0x00, 0x08]);
        out.extend_from_slice(&[video_type, 0xE0, 0x00, 0x00]);
        out.extend_from_slice(&[audio_type, 0xC0, 0x00, 0x00]);
        out.extend_from_slice(&[0x00, 0x00, 0x00, 0x00]);
        out
    }

    pub(crate) fn pes(stream_id: u8, pts: Option<u64>, dts: Option<u64>, payload: &[u8]) -> Vec<u8> {
        let mut header = Vec::new();
        let mut flags = 0u8;
        match (pts, dts) {
            (Some(p), Some(d)) => {
                flags = 0xC0;
                header.extend_from_slice(&encode_timestamp(0b0011, p));
                header.extend_from_slice(&encode_timestamp(0b0001, d));
            }
            (Some(p), None) => {
                flags = 0x80;
                header.extend_from_slice(&encode_timestamp(0b0010, p));
            }
            _ => {}
        }

        let len = 3 + header.len() + payload.len();
        let mut out = vec![0x00, 0x00, 0x01, stream_id];
        out.extend_from_slice(&(len as u16).to_be_bytes());
        out.extend_from_slice(&[0x80, flags, header.len() as u8]);
        out.extend_from_slice(&header);
        out.extend_from_slice(payload);
        out
    }

    fn segment(parts: &[Vec<u8>]) -> Bytes {
        Bytes::from(parts.concat())
    }

    #[test]
    fn test_video_with_pts_only() {
        let t = 900_000u64;
        let data = segment(&[
            pack_header(0),
            program_stream_map(0x1B, 0x90),
            pes(0xE0, Some(t), None, &[0, 0, 0, 1, 0x65, 0xAA]),
        ]);

        let sink = CollectSink::default();
        let mut demuxer = PsDemuxer::new();
        demuxer.read(data, 0, &sink).unwrap();

        let video = sink.video.lock().unwrap();
        assert_eq!(video.len(), 1);
        assert_eq!(video[0].0, (t / 90) as u32);
        assert_eq!(video[0].1, 0);
        assert_eq!(&video[0].2[..], &[0, 0, 0, 1, 0x65, 0xAA]);
        assert_eq!(demuxer.video_stream_type(), 0x1B);
        assert_eq!(demuxer.audio_stream_type(), 0x90);
        assert_eq!(demuxer.video_codec(), Some(VideoCodec::H264));
        assert_eq!(demuxer.audio_codec(), Some(AudioCodec::G711A));
    }

    #[test]
    fn test_video_with_pts_and_dts() {
        let pts = 183_600u64;
        let dts = 180_000u64;
        let data = segment(&[pack_header(2), pes(0xE0, Some(pts), Some(dts), &[1, 2, 3])]);

        let sink = CollectSink::default();
        PsDemuxer::new().read(data, 0, &sink).unwrap();

        let video = sink.video.lock().unwrap();
        assert_eq!(video.len(), 1);
        assert_eq!(video[0].0, (dts / 90) as u32);
        assert_eq!(video[0].1, ((pts - dts) / 90) as u32);
    }

    #[test]
    fn test_video_without_pts_uses_hint() {
        let data = segment(&[pack_header(0), pes(0xE0, None, None, &[9, 9])]);

        let sink = CollectSink::default();
        PsDemuxer::new().read(data, 45_000, &sink).unwrap();

        let video = sink.video.lock().unwrap();
        assert_eq!(video[0].0, 500);
        assert_eq!(video[0].1, 0);
    }

    #[test]
    fn test_video_continuation_is_concatenated() {
        let data = segment(&[
            pack_header(0),
            system_header(),
            program_stream_map(0x24, 0x90),
            pes(0xE0, Some(9_000), None, &[1, 2, 3]),
            pes(0xE0, None, None, &[4, 5]),
            pes(0xE0, None, None, &[6]),
        ]);

        let sink = CollectSink::default();
        PsDemuxer::new().read(data, 0, &sink).unwrap();

        let video = sink.video.lock().unwrap();
        assert_eq!(video.len(), 1);
        assert_eq!(video[0].0, 100);
        assert_eq!(&video[0].2[..], &[1, 2, 3, 4, 5, 6]);
    }

    #[test]
    fn test_audio_pushed_per_packet() {
        let data = segment(&[
            pack_header(0),
            pes(0xC0, Some(8_000), None, &[0xA1]),
            pes(0xC0, None, None, &[0xA2]),
        ]);

        let sink = CollectSink::default();
        PsDemuxer::new().read(data, 1_600, &sink).unwrap();

        let audio = sink.audio.lock().unwrap();
        assert_eq!(audio.len(), 2);
        assert_eq!(audio[0].0, 1_000);
        assert_eq!(&audio[0].1[..], &[0xA1]);
        assert_eq!(audio[1].0, 200);
        assert!(sink.video.lock().unwrap().is_empty());
    }

    #[test]
    fn test_missing_start_code() {
        let mut raw = pack_header(0);
        raw[3] = 0xBB;
        raw.extend_from_slice(&pes(0xE0, Some(90), None, &[1]));

        let sink = CollectSink::default();
        let err = PsDemuxer::new().read(Bytes::from(raw), 0, &sink).unwrap_err();
        assert_eq!(err, PsError::MissingStartCode);
        assert!(sink.video.lock().unwrap().is_empty());
        assert!(sink.audio.lock().unwrap().is_empty());
    }

    #[test]
    fn test_short_segment_is_missing_start_code() {
        let sink = CollectSink::default();
        let err = PsDemuxer::new()
            .read(Bytes::from_static(&[0x00, 0x00]), 0, &sink)
            .unwrap_err();
        assert_eq!(err, PsError::MissingStartCode);
    }

    #[test]
    fn test_truncated_pes_is_parse_error_and_flushes_video() {
        let mut raw = segment(&[pack_header(0), pes(0xE0, Some(90_000), None, &[7, 7])]).to_vec();
        let mut truncated = pes(0xC0, Some(8), None, &[1, 2, 3, 4]);
        truncated.truncate(truncated.len() - 2);
        raw.extend_from_slice(&truncated);

        let sink = CollectSink::default();
        let err = PsDemuxer::new().read(Bytes::from(raw), 0, &sink).unwrap_err();
        assert_eq!(err, PsError::ParsePacket);

        let video = sink.video.lock().unwrap();
        assert_eq!(video.len(), 1);
        assert_eq!(&video[0].2[..], &[7, 7]);
    }

    #[test]
    fn test_malformed_program_stream_map() {
        let mut psm = program_stream_map(0x1B, 0x90);
        // 总长度多 1，CRC 位置对不上
        psm[5] = 0x13;
        psm.push(0x00);
        let data = segment(&[pack_header(0), psm]);

        let sink = CollectSink::default();
        let err = PsDemuxer::new().read(data, 0, &sink).unwrap_err();
        assert_eq!(err, PsError::MalformedPack);
    }

    #[test]
    fn test_stream_types_persist_across_reads() {
        let mut demuxer = PsDemuxer::new();
        let sink = CollectSink::default();

        demuxer
            .read(segment(&[pack_header(0), program_stream_map(0x24, 0x90)]), 0, &sink)
            .unwrap();
        demuxer
            .read(segment(&[pack_header(0), pes(0xE0, Some(90), None, &[1])]), 0, &sink)
            .unwrap();

        assert_eq!(demuxer.video_codec(), Some(VideoCodec::H265));
        assert_eq!(sink.video.lock().unwrap().len(), 1);
    }

    #[test]
    fn test_error_does_not_leak_into_next_segment() {
        let mut demuxer = PsDemuxer::new();
        let sink = CollectSink::default();

        let mut bad = segment(&[pack_header(0), pes(0xE0, Some(90_000), Some(45_000), &[1])]).to_vec();
        bad.extend_from_slice(&[0x00, 0x00, 0x01]);
        assert!(demuxer.read(Bytes::from(bad), 0, &sink).is_err());

        demuxer
            .read(segment(&[pack_header(0), pes(0xE0, Some(180), None, &[2])]), 0, &sink)
            .unwrap();

        let video = sink.video.lock().unwrap();
        assert_eq!(video.len(), 2);
        assert_eq!(video[1].0, 2);
        assert_eq!(video[1].1, 0);
    }

    #[test]
    fn test_private_stream_and_end_code_skipped() {
        let mut private = vec![0x00, 0x00, 0x01, 0xBD, 0x00, 0x03];
        private.extend_from_slice(&[0xDE, 0xAD, 0xBE]);
        let data = segment(&[
            pack_header(0),
            private,
            pes(0xE0, Some(900), None, &[5]),
            vec![0x00, 0x00, 0x01, 0xB9],
        ]);

        let sink = CollectSink::default();
        PsDemuxer::new().read(data, 0, &sink).unwrap();
        assert_eq!(sink.video.lock().unwrap()[0].0, 10);
    }

    #[test]
    fn test_pack_header_clock_fields() {
        let mut demuxer = PsDemuxer::new();
        let sink = CollectSink::default();
        demuxer.read(segment(&[pack_header(1)]), 0, &sink).unwrap();
        assert_eq!(demuxer.system_clock_reference(), (1, 0));
        assert!(demuxer.program_mux_rate() > 0);
    }
}
