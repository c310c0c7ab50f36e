// SIP 传输层
// 请求按 Call-ID + CSeq 关联最终响应，临时响应（1xx）忽略

use super::message::{SipMessage, SipMethod, SipRequest, SipResponse};
use crate::{GbError, Result};
use async_trait::async_trait;
use dashmap::DashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::sync::oneshot;
use tracing::Instrument;

/// 请求发送通道
#[async_trait]
pub trait SipTransport: Send + Sync {
    /// 发送请求并等待最终响应
    async fn request(&self, req: SipRequest) -> Result<SipResponse>;

    /// 只发送不等待（ACK）
    async fn send(&self, req: SipRequest) -> Result<()>;
}

/// 设备主动发来的请求
#[async_trait]
pub trait InboundHandler: Send + Sync {
    async fn on_request(&self, req: SipRequest, remote: SocketAddr) -> SipResponse;
}

type TransactionKey = (String, u32, SipMethod);

fn transaction_key(call_id: Option<&str>, cseq: Option<(u32, SipMethod)>) -> Option<TransactionKey> {
    let (seq, method) = cseq?;
    Some((call_id?.to_string(), seq, method))
}

/// 等待中的事务，离开作用域时移除
struct PendingGuard<'a> {
    pending: &'a DashMap<TransactionKey, oneshot::Sender<SipResponse>>,
    key: TransactionKey,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        self.pending.remove(&self.key);
    }
}

/// UDP SIP 传输
pub struct UdpSipTransport {
    socket: Arc<UdpSocket>,
    timeout: Duration,
    pending: DashMap<TransactionKey, oneshot::Sender<SipResponse>>,
}

impl UdpSipTransport {
    pub async fn bind(addr: &str, timeout: Duration) -> Result<Arc<Self>> {
        let socket = UdpSocket::bind(addr)
            .await
            .map_err(|e| GbError::Transport(format!("Failed to bind UDP socket: {}", e)))?;

        tracing::info!(target: "gb28181::sip", %addr, "SIP transport listening");

        Ok(Arc::new(Self {
            socket: Arc::new(socket),
            timeout,
            pending: DashMap::new(),
        }))
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.socket.local_addr()?)
    }

    async fn resolve(destination: &str) -> Result<SocketAddr> {
        tokio::net::lookup_host(destination)
            .await?
            .next()
            .ok_or_else(|| GbError::Transport(format!("Invalid address: {}", destination)))
    }

    async fn send_to(&self, data: &str, destination: &str) -> Result<()> {
        let addr = Self::resolve(destination).await?;
        self.socket
            .send_to(data.as_bytes(), addr)
            .await
            .map_err(|e| GbError::Transport(format!("Failed to send: {}", e)))?;
        Ok(())
    }

    /// 接收循环
    pub async fn run(self: Arc<Self>, handler: Arc<dyn InboundHandler>) -> Result<()> {
        let mut buf = vec![0u8; 65536];

        loop {
            match self.socket.recv_from(&mut buf).await {
                Ok((len, addr)) => {
                    let data = String::from_utf8_lossy(&buf[..len]).into_owned();
                    let transport = self.clone();
                    let handler = handler.clone();

                    let span = tracing::info_span!(
                        "gb28181.sip.handle_message",
                        remote = %addr,
                        bytes = len
                    );

                    tokio::spawn(
                        async move {
                            if let Err(e) = transport.handle_datagram(data, addr, handler).await {
                                tracing::warn!(target: "gb28181::sip", error = %e, "Failed to handle message");
                            }
                        }
                        .instrument(span),
                    );
                }
                Err(e) => {
                    tracing::error!(target: "gb28181::sip", error = %e, "Failed to receive UDP packet");
                }
            }
        }
    }

    async fn handle_datagram(
        &self,
        data: String,
        addr: SocketAddr,
        handler: Arc<dyn InboundHandler>,
    ) -> Result<()> {
        match SipMessage::from_string(&data)? {
            SipMessage::Response(resp) => {
                self.complete(resp);
                Ok(())
            }
            SipMessage::Request(req) => {
                if req.method == SipMethod::Ack {
                    return Ok(());
                }
                let resp = handler.on_request(req, addr).await;
                self.socket
                    .send_to(resp.to_string().as_bytes(), addr)
                    .await
                    .map_err(|e| GbError::Transport(format!("Failed to send response: {}", e)))?;
                Ok(())
            }
        }
    }

    /// 投递响应到等待方
    fn complete(&self, resp: SipResponse) {
        if resp.is_provisional() {
            tracing::debug!(target: "gb28181::sip", status = resp.status_code, "provisional response");
            return;
        }

        let Some(key) = transaction_key(resp.call_id(), resp.cseq()) else {
            tracing::warn!(target: "gb28181::sip", "response without Call-ID/CSeq");
            return;
        };

        match self.pending.remove(&key) {
            Some((_, tx)) => {
                let _ = tx.send(resp);
            }
            None => {
                tracing::debug!(target: "gb28181::sip", call_id = %key.0, cseq = key.1, "unmatched response");
            }
        }
    }
}

#[async_trait]
impl SipTransport for UdpSipTransport {
    async fn request(&self, req: SipRequest) -> Result<SipResponse> {
        let key = transaction_key(req.call_id(), req.cseq())
            .ok_or_else(|| GbError::Sip("request without Call-ID/CSeq".into()))?;

        let (tx, rx) = oneshot::channel();
        self.pending.insert(key.clone(), tx);
        let _guard = PendingGuard {
            pending: &self.pending,
            key,
        };

        self.send_to(&req.to_string(), &req.destination).await?;

        match tokio::time::timeout(self.timeout, rx).await {
            Ok(Ok(resp)) => Ok(resp),
            Ok(Err(_)) => Err(GbError::Transport("transaction dropped".into())),
            Err(_) => Err(GbError::Timeout),
        }
    }

    async fn send(&self, req: SipRequest) -> Result<()> {
        self.send_to(&req.to_string(), &req.destination).await
    }
}
