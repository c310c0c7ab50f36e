// SIP 消息解析和生成
// 头部保持插入顺序，名称大小写不敏感

use crate::{GbError, Result};
use std::fmt;

/// SIP 方法
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SipMethod {
    Register,
    Invite,
    Ack,
    Bye,
    Cancel,
    Message,
    Subscribe,
    Notify,
    Info,
}

impl fmt::Display for SipMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl SipMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            SipMethod::Register => "REGISTER",
            SipMethod::Invite => "INVITE",
            SipMethod::Ack => "ACK",
            SipMethod::Bye => "BYE",
            SipMethod::Cancel => "CANCEL",
            SipMethod::Message => "MESSAGE",
            SipMethod::Subscribe => "SUBSCRIBE",
            SipMethod::Notify => "NOTIFY",
            SipMethod::Info => "INFO",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "REGISTER" => Some(SipMethod::Register),
            "INVITE" => Some(SipMethod::Invite),
            "ACK" => Some(SipMethod::Ack),
            "BYE" => Some(SipMethod::Bye),
            "CANCEL" => Some(SipMethod::Cancel),
            "MESSAGE" => Some(SipMethod::Message),
            "SUBSCRIBE" => Some(SipMethod::Subscribe),
            "NOTIFY" => Some(SipMethod::Notify),
            "INFO" => Some(SipMethod::Info),
            _ => None,
        }
    }
}

/// 有序头部列表
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Headers(Vec<(String, String)>);

impl Headers {
    pub fn get(&self, name: &str) -> Option<&str> {
        self.0
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    /// 追加头部（允许重复，如 Via）
    pub fn append(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.0.push((name.into(), value.into()));
    }

    /// 替换同名头部，不存在则追加
    pub fn replace(&mut self, name: &str, value: impl Into<String>) {
        let value = value.into();
        match self.0.iter().position(|(k, _)| k.eq_ignore_ascii_case(name)) {
            Some(idx) => {
                self.0[idx].1 = value;
                let mut i = self.0.len();
                while i > idx + 1 {
                    i -= 1;
                    if self.0[i].0.eq_ignore_ascii_case(name) {
                        self.0.remove(i);
                    }
                }
            }
            None => self.0.push((name.to_string(), value)),
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    fn write_to(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (key, value) in self.iter() {
            if key.eq_ignore_ascii_case("Content-Length") {
                continue;
            }
            write!(f, "{}: {}\r\n", key, value)?;
        }
        Ok(())
    }
}

/// 解析 CSeq 头部 `1 INVITE`
pub fn parse_cseq(value: &str) -> Option<(u32, SipMethod)> {
    let mut parts = value.split_whitespace();
    let seq = parts.next()?.parse().ok()?;
    let method = SipMethod::parse(parts.next()?)?;
    Some((seq, method))
}

/// 从 From/To 头部中取 tag
pub fn header_tag(value: &str) -> Option<&str> {
    value
        .split(';')
        .skip(1)
        .find_map(|param| param.trim().strip_prefix("tag="))
}

/// 从 `<sip:user@host>` 形式中取 user
pub fn uri_user(value: &str) -> Option<&str> {
    let start = value.find("sip:")? + 4;
    let rest = &value[start..];
    let end = rest.find('@')?;
    Some(&rest[..end])
}

/// 拆分头部区与消息体
fn split_message(s: &str) -> (&str, Option<&str>) {
    match s.find("\r\n\r\n") {
        Some(pos) => {
            let body = &s[pos + 4..];
            (&s[..pos], (!body.is_empty()).then_some(body))
        }
        None => (s.trim_end_matches("\r\n"), None),
    }
}

fn parse_headers<'a>(lines: impl Iterator<Item = &'a str>) -> Headers {
    let mut headers = Headers::default();
    for line in lines {
        if let Some((key, value)) = line.split_once(':') {
            headers.append(key.trim(), value.trim());
        }
    }
    headers
}

fn write_body(f: &mut fmt::Formatter<'_>, body: Option<&str>) -> fmt::Result {
    match body {
        Some(body) => write!(f, "Content-Length: {}\r\n\r\n{}", body.len(), body),
        None => f.write_str("Content-Length: 0\r\n\r\n"),
    }
}

/// SIP 请求
#[derive(Debug, Clone, PartialEq)]
pub struct SipRequest {
    pub method: SipMethod,
    pub uri: String,
    pub version: String,
    pub headers: Headers,
    pub body: Option<String>,

    /// 传输协议（udp/tcp），不参与序列化
    pub transport: String,
    /// 目的地址 `ip:port`，不参与序列化
    pub destination: String,
}

impl SipRequest {
    pub fn new(method: SipMethod, uri: impl Into<String>) -> Self {
        Self {
            method,
            uri: uri.into(),
            version: "SIP/2.0".to_string(),
            headers: Headers::default(),
            body: None,
            transport: "udp".to_string(),
            destination: String::new(),
        }
    }

    /// 添加头部
    pub fn add_header(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.headers.append(key, value);
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name)
    }

    /// 设置消息体
    pub fn set_body(&mut self, content_type: &str, body: impl Into<String>) {
        self.headers.replace("Content-Type", content_type);
        self.body = Some(body.into());
    }

    pub fn call_id(&self) -> Option<&str> {
        self.header("Call-ID")
    }

    pub fn cseq(&self) -> Option<(u32, SipMethod)> {
        self.header("CSeq").and_then(parse_cseq)
    }

    /// 从字符串解析 SIP 请求
    pub fn from_string(s: &str) -> Result<Self> {
        let (head, body) = split_message(s);
        let mut lines = head.split("\r\n");

        // 解析请求行
        let request_line: Vec<&str> = lines
            .next()
            .ok_or_else(|| GbError::Sip("Empty SIP message".into()))?
            .split_whitespace()
            .collect();
        if request_line.len() != 3 {
            return Err(GbError::Sip("Invalid request line".into()));
        }

        let method = SipMethod::parse(request_line[0])
            .ok_or_else(|| GbError::Sip(format!("Unknown method: {}", request_line[0])))?;

        Ok(Self {
            method,
            uri: request_line[1].to_string(),
            version: request_line[2].to_string(),
            headers: parse_headers(lines),
            body: body.map(str::to_string),
            transport: "udp".to_string(),
            destination: String::new(),
        })
    }
}

impl fmt::Display for SipRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {} {}\r\n", self.method, self.uri, self.version)?;
        self.headers.write_to(f)?;
        write_body(f, self.body.as_deref())
    }
}

/// SIP 响应
#[derive(Debug, Clone, PartialEq)]
pub struct SipResponse {
    pub version: String,
    pub status_code: u16,
    pub reason_phrase: String,
    pub headers: Headers,
    pub body: Option<String>,
}

impl SipResponse {
    pub fn new(status_code: u16, reason_phrase: impl Into<String>) -> Self {
        Self {
            version: "SIP/2.0".to_string(),
            status_code,
            reason_phrase: reason_phrase.into(),
            headers: Headers::default(),
            body: None,
        }
    }

    /// 针对请求生成响应，复制事务相关头部
    pub fn for_request(request: &SipRequest, status_code: u16) -> Self {
        let mut resp = Self::new(status_code, reason_phrase(status_code));
        for name in ["Via", "From", "To", "Call-ID", "CSeq"] {
            for (key, value) in request.headers.iter() {
                if key.eq_ignore_ascii_case(name) {
                    resp.headers.append(name, value);
                }
            }
        }
        resp
    }

    /// 添加头部
    pub fn add_header(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.headers.append(key, value);
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name)
    }

    /// 设置消息体
    pub fn set_body(&mut self, content_type: &str, body: impl Into<String>) {
        self.headers.replace("Content-Type", content_type);
        self.body = Some(body.into());
    }

    pub fn call_id(&self) -> Option<&str> {
        self.header("Call-ID")
    }

    pub fn cseq(&self) -> Option<(u32, SipMethod)> {
        self.header("CSeq").and_then(parse_cseq)
    }

    pub fn is_provisional(&self) -> bool {
        self.status_code < 200
    }

    /// 从字符串解析 SIP 响应
    pub fn from_string(s: &str) -> Result<Self> {
        let (head, body) = split_message(s);
        let mut lines = head.split("\r\n");

        // 解析状态行
        let status_line: Vec<&str> = lines
            .next()
            .ok_or_else(|| GbError::Sip("Empty SIP message".into()))?
            .splitn(3, ' ')
            .collect();
        if status_line.len() < 2 {
            return Err(GbError::Sip("Invalid status line".into()));
        }

        let status_code = status_line[1]
            .parse::<u16>()
            .map_err(|_| GbError::Sip("Invalid status code".into()))?;

        Ok(Self {
            version: status_line[0].to_string(),
            status_code,
            reason_phrase: status_line.get(2).copied().unwrap_or_default().to_string(),
            headers: parse_headers(lines),
            body: body.map(str::to_string),
        })
    }
}

impl fmt::Display for SipResponse {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {} {}\r\n",
            self.version, self.status_code, self.reason_phrase
        )?;
        self.headers.write_to(f)?;
        write_body(f, self.body.as_deref())
    }
}

pub fn reason_phrase(status_code: u16) -> &'static str {
    match status_code {
        100 => "Trying",
        180 => "Ringing",
        200 => "OK",
        400 => "Bad Request",
        404 => "Not Found",
        405 => "Method Not Allowed",
        408 => "Request Timeout",
        481 => "Call/Transaction Does Not Exist",
        486 => "Busy Here",
        500 => "Server Internal Error",
        _ => "",
    }
}

/// SIP 消息（请求或响应）
#[derive(Debug, Clone, PartialEq)]
pub enum SipMessage {
    Request(SipRequest),
    Response(SipResponse),
}

impl SipMessage {
    /// 从字符串解析 SIP 消息
    pub fn from_string(s: &str) -> Result<Self> {
        if s.starts_with("SIP/") {
            Ok(SipMessage::Response(SipResponse::from_string(s)?))
        } else {
            Ok(SipMessage::Request(SipRequest::from_string(s)?))
        }
    }
}

impl fmt::Display for SipMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SipMessage::Request(req) => req.fmt(f),
            SipMessage::Response(resp) => resp.fmt(f),
        }
    }
}
