// 点播参数

use crate::sip::MediaFormat;
use crate::{GbError, Result};
use rand::Rng;

/// 单次 invite 的参数，实时流 start/end 为 0
#[derive(Debug, Clone, Default, PartialEq)]
pub struct InviteOptions {
    pub start: i64,
    pub end: i64,

    /// 指定流路径，留空时按设备/通道生成
    pub stream_path: String,

    /// PS 流保存目录，留空时使用全局配置
    pub dump: String,

    /// f= 字段
    pub format: MediaFormat,

    ssrc: String,
    ssrc_value: u32,
}

impl InviteOptions {
    pub fn live() -> Self {
        Self::default()
    }

    pub fn playback(start: i64, end: i64) -> Self {
        Self {
            start,
            end,
            ..Default::default()
        }
    }

    /// 解析起止时间（秒级时间戳字符串），空串保持原值
    pub fn validate(&mut self, start: &str, end: &str) -> Result<()> {
        if !start.is_empty() {
            self.start = start
                .parse()
                .map_err(|_| GbError::InvalidArgument(format!("invalid start time: {}", start)))?;
        }
        if !end.is_empty() {
            self.end = end
                .parse()
                .map_err(|_| GbError::InvalidArgument(format!("invalid end time: {}", end)))?;
        }
        if self.start >= self.end {
            return Err(GbError::InvalidArgument("start must be before end".into()));
        }
        Ok(())
    }

    pub fn is_live(&self) -> bool {
        self.start == 0 || self.end == 0
    }

    pub fn is_record(&self) -> bool {
        !self.is_live()
    }

    /// 生成十位 SSRC：首位 0 实时 / 1 回放，接着是服务编号 4～8 位，最后四位随机
    pub fn create_ssrc(&mut self, serial: &str) {
        let prefix = if self.is_live() { '0' } else { '1' };
        let domain = serial.get(3..8).unwrap_or("00000");
        let rand_num: u32 = rand::thread_rng().gen_range(1000..10000);

        self.ssrc = format!("{}{}{}", prefix, domain, rand_num);
        self.ssrc_value = self.ssrc.parse().unwrap_or(0);
    }

    pub fn ssrc(&self) -> &str {
        &self.ssrc
    }

    pub fn ssrc_value(&self) -> u32 {
        self.ssrc_value
    }

    /// 以设备应答中的 SSRC 为准
    pub fn set_ssrc_value(&mut self, ssrc: u32) {
        self.ssrc_value = ssrc;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate() {
        let mut opt = InviteOptions::default();
        opt.validate("1700000000", "1700003600").unwrap();
        assert!(opt.is_record());
        assert_eq!((opt.start, opt.end), (1700000000, 1700003600));

        let mut opt = InviteOptions::default();
        assert!(opt.validate("100", "100").is_err());
        assert!(opt.validate("abc", "100").is_err());
        assert!(InviteOptions::default().validate("", "").is_err());
    }

    #[test]
    fn test_live_when_either_bound_is_zero() {
        assert!(InviteOptions::live().is_live());
        assert!(InviteOptions::playback(0, 100).is_live());
        assert!(InviteOptions::playback(100, 0).is_live());
        assert!(!InviteOptions::playback(100, 200).is_live());
    }

    #[test]
    fn test_create_ssrc() {
        let mut opt = InviteOptions::live();
        opt.create_ssrc("34020000002000000001");
        let ssrc = opt.ssrc().to_string();
        assert_eq!(ssrc.len(), 10);
        assert!(ssrc.starts_with("020000"));
        let tail: u32 = ssrc[6..].parse().unwrap();
        assert!((1000..=9999).contains(&tail));
        assert_eq!(opt.ssrc_value(), ssrc.parse::<u32>().unwrap());

        let mut opt = InviteOptions::playback(1, 2);
        opt.create_ssrc("34020000002000000001");
        assert!(opt.ssrc().starts_with("120000"));
    }
}
