// PTZ 云台控制指令编码

use crate::{GbError, Result};

/// 指令首字节
pub const PTZ_FIRST_BYTE: u8 = 0xA5;

/// 预置位指令码
pub const PRESET_SET: u8 = 0x81;
pub const PRESET_CALL: u8 = 0x82;
pub const PRESET_DEL: u8 = 0x83;

/// 云台动作名称与指令码
const NAME_TO_CODE: &[(&str, u8)] = &[
    ("stop", 0),
    ("right", 1),
    ("left", 2),
    ("down", 4),
    ("downright", 5),
    ("downleft", 6),
    ("up", 8),
    ("upright", 9),
    ("upleft", 10),
    ("zoomin", 16),
    ("zoomout", 32),
];

/// 预置位操作
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PresetOp {
    Add,
    Delete,
    Call,
}

impl PresetOp {
    /// 对外接口使用的数字编码：0 添加 1 删除 2 调用
    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            0 => Some(PresetOp::Add),
            1 => Some(PresetOp::Delete),
            2 => Some(PresetOp::Call),
            _ => None,
        }
    }

    pub fn command(&self) -> u8 {
        match self {
            PresetOp::Add => PRESET_SET,
            PresetOp::Delete => PRESET_DEL,
            PresetOp::Call => PRESET_CALL,
        }
    }
}

pub fn ptz_code(name: &str) -> Result<u8> {
    NAME_TO_CODE
        .iter()
        .find(|(n, _)| *n == name)
        .map(|(_, code)| *code)
        .ok_or_else(|| GbError::InvalidArgument(format!("invalid ptz cmd {:?}", name)))
}

fn assemble_code() -> u8 {
    ((PTZ_FIRST_BYTE >> 4) + (PTZ_FIRST_BYTE & 0x0F)) % 16
}

/// 8 字节控制帧，末字节为前 7 字节之和
pub fn pack_frame(cmd: u8, point: u8) -> [u8; 8] {
    let mut buf = [PTZ_FIRST_BYTE, assemble_code(), 0, cmd, 0, point, 0, 0];
    buf[7] = buf[..7].iter().fold(0u8, |sum, b| sum.wrapping_add(*b));
    buf
}

/// 预置位等单点指令，十六进制编码
pub fn pack(cmd: u8, point: u8) -> String {
    hex::encode(pack_frame(cmd, point))
}

pub fn preset_command(op: PresetOp, point: u8) -> String {
    pack(op.command(), point)
}

/// 方向/变倍指令，zoom 只取高 4 bit
pub fn ptz_command(cmd: u8, horizontal_speed: u8, vertical_speed: u8, zoom_speed: u8) -> String {
    let check = [0x0F, 0x01, cmd, horizontal_speed, vertical_speed, zoom_speed & 0xF0]
        .iter()
        .fold(PTZ_FIRST_BYTE, |sum, b| sum.wrapping_add(*b));

    format!(
        "A50F01{:02X}{:02X}{:02X}{:01X}0{:02X}",
        cmd,
        horizontal_speed,
        vertical_speed,
        zoom_speed >> 4,
        check
    )
}

pub fn ptz_command_by_name(
    name: &str,
    horizontal_speed: u8,
    vertical_speed: u8,
    zoom_speed: u8,
) -> Result<String> {
    let code = ptz_code(name)?;
    Ok(ptz_command(code, horizontal_speed, vertical_speed, zoom_speed))
}
