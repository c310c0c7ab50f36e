// SIP 请求构造
// 每次构造都会递增设备请求序号，对话内请求复用 invite 响应的 From/To/Call-ID

use super::message::{parse_cseq, SipMethod, SipRequest, SipResponse};
use crate::config::Gb28181Config;
use crate::device::{ChannelInfo, Device};
use rand::Rng;

/// 随机数字字符串
pub fn rand_num_string(len: usize) -> String {
    let mut rng = rand::thread_rng();
    (0..len)
        .map(|_| char::from(b'0' + rng.gen_range(0..10u8)))
        .collect()
}

/// 请求构造器，持有本端身份
#[derive(Debug, Clone)]
pub struct DialogBuilder {
    serial: String,
    realm: String,
    sip_port: u16,
    network: String,
    user_agent: String,
}

impl DialogBuilder {
    pub fn new(config: &Gb28181Config) -> Self {
        Self {
            serial: config.serial.clone(),
            realm: config.realm.clone(),
            sip_port: config.sip_port,
            network: config.sip_network.to_ascii_lowercase(),
            user_agent: config.user_agent.clone(),
        }
    }

    pub fn serial(&self) -> &str {
        &self.serial
    }

    /// 通道目标地址：同域直接用域名，跨域用 `ip:port`
    pub fn channel_host(&self, device: &Device, channel: &ChannelInfo) -> String {
        let same_realm = channel.device_id.get(0..10) == Some(self.realm.as_str());
        if same_realm {
            self.realm.clone()
        } else if channel.port != 0 {
            format!("{}:{}", device.ip(), channel.port)
        } else {
            device.net_addr.clone()
        }
    }

    /// 面向通道的请求
    pub fn channel_request(
        &self,
        method: SipMethod,
        device: &Device,
        channel: &ChannelInfo,
    ) -> SipRequest {
        let host = self.channel_host(device, channel);
        self.build(method, device, &format!("sip:{}@{}", channel.device_id, host))
    }

    /// 面向设备的请求（MESSAGE 查询、控制）
    pub fn device_request(&self, method: SipMethod, device: &Device) -> SipRequest {
        self.build(method, device, &format!("sip:{}@{}", device.id, device.net_addr))
    }

    fn build(&self, method: SipMethod, device: &Device, target: &str) -> SipRequest {
        let sn = device.next_sn();
        let server = format!("sip:{}@{}:{}", self.serial, device.sip_ip, self.sip_port);

        let mut req = SipRequest::new(method, target);
        req.add_header(
            "Via",
            format!(
                "SIP/2.0/{} {}:{};rport;branch=z9hG4bK{}",
                self.network.to_ascii_uppercase(),
                device.sip_ip,
                self.sip_port,
                rand_num_string(9)
            ),
        );
        req.add_header("From", format!("<{}>;tag={}", server, rand_num_string(9)));
        req.add_header("To", format!("<{}>", target));
        req.add_header("Call-ID", rand_num_string(10));
        req.add_header("User-Agent", self.user_agent.clone());
        req.add_header("CSeq", format!("{} {}", sn, method));
        req.add_header("Max-Forwards", "70");
        req.add_header("Contact", format!("<{}>", server));

        req.transport = self.network.clone();
        req.destination = device.net_addr.clone();
        req
    }
}

/// 用 invite 的最终响应替换对话标识
pub fn into_dialog(mut req: SipRequest, invite_response: &SipResponse) -> SipRequest {
    for name in ["From", "To", "Call-ID"] {
        if let Some(value) = invite_response.header(name) {
            req.headers.replace(name, value.to_string());
        }
    }
    req
}

/// 根据 invite 及其 2xx 响应构造 ACK
pub fn ack_request(invite: &SipRequest, response: &SipResponse) -> SipRequest {
    let mut ack = SipRequest::new(SipMethod::Ack, invite.uri.clone());
    let seq = invite
        .header("CSeq")
        .and_then(parse_cseq)
        .map(|(seq, _)| seq)
        .unwrap_or(1);

    if let Some(via) = invite.header("Via") {
        ack.add_header("Via", via.to_string());
    }
    if let Some(from) = invite.header("From") {
        ack.add_header("From", from.to_string());
    }
    if let Some(to) = response.header("To").or_else(|| invite.header("To")) {
        ack.add_header("To", to.to_string());
    }
    if let Some(call_id) = invite.header("Call-ID") {
        ack.add_header("Call-ID", call_id.to_string());
    }
    if let Some(user_agent) = invite.header("User-Agent") {
        ack.add_header("User-Agent", user_agent.to_string());
    }
    ack.add_header("CSeq", format!("{} ACK", seq));
    ack.add_header("Max-Forwards", "70");

    ack.transport = invite.transport.clone();
    ack.destination = invite.destination.clone();
    ack
}
