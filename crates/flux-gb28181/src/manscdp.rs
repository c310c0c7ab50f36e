// MANSCDP XML 消息
// 查询/控制请求体生成，以及设备响应解析

use crate::record::Record;
use crate::Result;
use chrono::{Local, TimeZone};
use quick_xml::de::from_str;
use serde::Deserialize;

pub const CONTENT_TYPE_MANSCDP: &str = "Application/MANSCDP+xml";
pub const CONTENT_TYPE_MANSRTSP: &str = "Application/MANSRTSP";

/// 设备响应根节点
#[derive(Debug, Deserialize, PartialEq)]
#[serde(rename_all = "PascalCase")]
pub struct ManscdpMessage {
    /// 命令类型
    pub cmd_type: String,

    #[serde(rename = "SN")]
    pub sn: Option<u32>,

    #[serde(rename = "DeviceID", default)]
    pub device_id: String,

    #[serde(default)]
    pub name: String,

    #[serde(default)]
    pub sum_num: Option<u32>,

    /// 录像列表（RecordInfo）
    #[serde(default)]
    pub record_list: Option<RecordList>,

    /// 预置位列表（PresetQuery）
    #[serde(default)]
    pub preset_list: Option<PresetList>,
}

#[derive(Debug, Deserialize, PartialEq, Default)]
pub struct RecordList {
    #[serde(rename = "@Num", default)]
    pub num: Option<u32>,

    #[serde(rename = "Item", default)]
    pub items: Vec<Record>,
}

#[derive(Debug, Deserialize, PartialEq, Default)]
pub struct PresetList {
    #[serde(rename = "@Num", default)]
    pub num: Option<u32>,

    #[serde(rename = "Item", default)]
    pub items: Vec<PresetItem>,
}

#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct PresetItem {
    #[serde(rename = "PresetID", default)]
    pub preset_id: String,

    #[serde(rename = "PresetName", default)]
    pub preset_name: String,
}

/// 解析 MANSCDP XML 消息
pub fn parse_message(xml: &str) -> Result<ManscdpMessage> {
    Ok(from_str(xml.trim())?)
}

fn format_time(epoch: i64) -> String {
    match Local.timestamp_opt(epoch, 0).single() {
        Some(t) => t.format("%Y-%m-%dT%H:%M:%S").to_string(),
        None => String::new(),
    }
}

/// 录像查询
pub fn record_info_query(sn: u32, channel_id: &str, start: i64, end: i64) -> String {
    format!(
        r#"<?xml version="1.0" encoding="GB2312"?>
<Query>
<CmdType>RecordInfo</CmdType>
<SN>{}</SN>
<DeviceID>{}</DeviceID>
<StartTime>{}</StartTime>
<EndTime>{}</EndTime>
<Secrecy>0</Secrecy>
<Type>all</Type>
</Query>
"#,
        sn,
        channel_id,
        format_time(start),
        format_time(end)
    )
}

/// 预置位查询
pub fn preset_query(sn: u32, channel_id: &str) -> String {
    format!(
        r#"<?xml version="1.0" encoding="GB2312"?>
<Query>
<CmdType>PresetQuery</CmdType>
<SN>{}</SN>
<DeviceID>{}</DeviceID>
</Query>
"#,
        sn, channel_id
    )
}

/// 云台控制
pub fn device_control(sn: u32, channel_id: &str, ptz_cmd: &str) -> String {
    format!(
        r#"<?xml version="1.0"?>
<Control>
<CmdType>DeviceControl</CmdType>
<SN>{}</SN>
<DeviceID>{}</DeviceID>
<PTZCmd>{}</PTZCmd>
</Control>
"#,
        sn, channel_id, ptz_cmd
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_record_info_response() {
        let xml = r#"<?xml version="1.0" encoding="GB2312"?>
<Response>
<CmdType>RecordInfo</CmdType>
<SN>17</SN>
<DeviceID>34020000001320000002</DeviceID>
<Name>Camera 1</Name>
<SumNum>2</SumNum>
<RecordList Num="1">
<Item>
<DeviceID>34020000001320000002</DeviceID>
<Name>Camera 1</Name>
<FilePath>/rec/1.mp4</FilePath>
<Address>Address 1</Address>
<StartTime>2024-01-01T00:00:00</StartTime>
<EndTime>2024-01-01T01:00:00</EndTime>
<Secrecy>0</Secrecy>
<Type>time</Type>
</Item>
</RecordList>
</Response>"#;

        let msg = parse_message(xml).unwrap();
        assert_eq!(msg.cmd_type, "RecordInfo");
        assert_eq!(msg.sn, Some(17));
        assert_eq!(msg.sum_num, Some(2));

        let list = msg.record_list.unwrap();
        assert_eq!(list.num, Some(1));
        assert_eq!(list.items[0].file_path, "/rec/1.mp4");
        assert_eq!(list.items[0].start_time, "2024-01-01T00:00:00");
        assert_eq!(list.items[0].record_type, "time");
    }

    #[test]
    fn test_parse_empty_record_list() {
        let xml = r#"<Response><CmdType>RecordInfo</CmdType><SN>1</SN><DeviceID>x</DeviceID><SumNum>0</SumNum></Response>"#;
        let msg = parse_message(xml).unwrap();
        assert_eq!(msg.sum_num, Some(0));
        assert!(msg.record_list.is_none());
    }

    #[test]
    fn test_parse_preset_list() {
        let xml = r#"<Response><CmdType>PresetQuery</CmdType><SN>3</SN><DeviceID>x</DeviceID>
<PresetList Num="2"><Item><PresetID>1</PresetID><PresetName>Gate</PresetName></Item>
<Item><PresetID>2</PresetID><PresetName>Yard</PresetName></Item></PresetList></Response>"#;
        let msg = parse_message(xml).unwrap();
        let presets = msg.preset_list.unwrap();
        assert_eq!(presets.items.len(), 2);
        assert_eq!(presets.items[1].preset_name, "Yard");
    }

    #[test]
    fn test_query_bodies() {
        let body = record_info_query(5, "34020000001320000002", 0, 3600);
        assert!(body.contains("<CmdType>RecordInfo</CmdType>"));
        assert!(body.contains("<SN>5</SN>"));
        assert!(body.contains("<Type>all</Type>"));
        assert!(body.contains(&format!("<StartTime>{}</StartTime>", format_time(0))));

        let body = preset_query(6, "34020000001320000002");
        assert!(body.contains("<CmdType>PresetQuery</CmdType>"));

        let body = device_control(7, "34020000001320000002", "A50F0100000000B5");
        assert!(body.contains("<PTZCmd>A50F0100000000B5</PTZCmd>"));
        assert!(body.contains("<DeviceID>34020000001320000002</DeviceID>"));
    }

    #[test]
    fn test_invalid_xml() {
        assert!(parse_message("<Response>").is_err());
    }
}
