// RTP/PS 媒体接收
// UDP 或被动 TCP（RFC 4571 两字节长度前缀）接收 RTP，按 SSRC 分发到各会话的解封装任务

use super::packet::RtpPacket;
use crate::config::MediaNetwork;
use crate::ps::PsDemuxer;
use crate::stream::FrameSink;
use crate::{GbError, Result};
use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use dashmap::DashMap;
use std::path::PathBuf;
use std::sync::{Arc, Weak};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tokio::sync::{mpsc, watch};

/// 媒体接收参数
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReceiveOptions {
    pub stream_path: String,
    pub network: MediaNetwork,
    pub port: u16,
    pub ssrc: u32,
    /// 端口多路复用，按 SSRC 区分会话
    pub reuse_port: bool,
    /// 原始 PS 流保存目录
    pub dump_path: Option<PathBuf>,
}

/// 媒体接收绑定
#[async_trait]
pub trait MediaBinder: Send + Sync {
    async fn bind(&self, options: ReceiveOptions, sink: Arc<dyn FrameSink>) -> Result<MediaHandle>;
}

/// 会话结束时调用，解除绑定
pub trait MediaRelease: Send + Sync {
    fn release(&self, network: MediaNetwork, port: u16, ssrc: u32);
}

/// 接收句柄，drop 时解除绑定
pub struct MediaHandle {
    network: MediaNetwork,
    port: u16,
    ssrc: u32,
    owner: Option<Arc<dyn MediaRelease>>,
}

impl MediaHandle {
    pub fn new(network: MediaNetwork, port: u16, ssrc: u32, owner: Arc<dyn MediaRelease>) -> Self {
        Self {
            network,
            port,
            ssrc,
            owner: Some(owner),
        }
    }

    /// 不持有任何资源的句柄
    pub fn detached(network: MediaNetwork, port: u16, ssrc: u32) -> Self {
        Self {
            network,
            port,
            ssrc,
            owner: None,
        }
    }

    pub fn network(&self) -> MediaNetwork {
        self.network
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn ssrc(&self) -> u32 {
        self.ssrc
    }
}

impl std::fmt::Debug for MediaHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MediaHandle")
            .field("network", &self.network)
            .field("port", &self.port)
            .field("ssrc", &self.ssrc)
            .finish()
    }
}

impl Drop for MediaHandle {
    fn drop(&mut self) {
        if let Some(owner) = self.owner.take() {
            owner.release(self.network, self.port, self.ssrc);
        }
    }
}

/// 按 RTP 时间戳拼帧：时间戳变化或 marker 位表示一个 PS 包结束
#[derive(Debug, Default)]
pub struct FrameAssembler {
    timestamp: Option<u32>,
    buf: BytesMut,
}

impl FrameAssembler {
    pub fn push(&mut self, packet: &RtpPacket) -> Vec<(u32, Bytes)> {
        let mut frames = Vec::new();

        if self.timestamp != Some(packet.timestamp()) {
            frames.extend(self.flush());
            self.timestamp = Some(packet.timestamp());
        }
        self.buf.extend_from_slice(&packet.payload);

        if packet.is_marker() {
            frames.extend(self.flush());
        }
        frames
    }

    pub fn flush(&mut self) -> Option<(u32, Bytes)> {
        let ts = self.timestamp.take()?;
        if self.buf.is_empty() {
            return None;
        }
        Some((ts, self.buf.split().freeze()))
    }
}

type Routes = DashMap<u32, mpsc::Sender<RtpPacket>>;

/// 一个端口上的监听
struct MediaListener {
    routes: Arc<Routes>,
    exclusive: bool,
    // drop 时通知监听任务退出
    _shutdown: watch::Sender<bool>,
}

fn dispatch(routes: &Routes, exclusive: bool, packet: RtpPacket) {
    let ssrc = packet.ssrc();
    let target = match routes.get(&ssrc) {
        Some(tx) => Some(tx.value().clone()),
        // 独占端口时不校验 SSRC
        None if exclusive => routes.iter().next().map(|e| e.value().clone()),
        None => None,
    };

    match target {
        Some(tx) => {
            if let Err(e) = tx.try_send(packet) {
                tracing::warn!(target: "gb28181::rtp", ssrc, error = %e, "Failed to route RTP packet");
            }
        }
        None => {
            tracing::debug!(target: "gb28181::rtp", ssrc, "RTP packet from unknown SSRC");
        }
    }
}

async fn run_udp(socket: UdpSocket, routes: Arc<Routes>, exclusive: bool, mut shutdown: watch::Receiver<bool>) {
    let mut buf = vec![0u8; 65536];
    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            received = socket.recv_from(&mut buf) => match received {
                Ok((len, _)) => {
                    if let Some(packet) = RtpPacket::from_bytes(Bytes::copy_from_slice(&buf[..len])) {
                        dispatch(&routes, exclusive, packet);
                    }
                }
                Err(e) => {
                    tracing::error!(target: "gb28181::rtp", error = %e, "Failed to receive UDP packet");
                }
            }
        }
    }
}

async fn run_tcp(listener: TcpListener, routes: Arc<Routes>, exclusive: bool, mut shutdown: watch::Receiver<bool>) {
    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, remote)) => {
                    tracing::info!(target: "gb28181::rtp", %remote, "media connection accepted");
                    tokio::spawn(run_tcp_connection(stream, routes.clone(), exclusive, shutdown.clone()));
                }
                Err(e) => {
                    tracing::error!(target: "gb28181::rtp", error = %e, "Failed to accept media connection");
                }
            }
        }
    }
}

async fn read_frame(stream: &mut TcpStream) -> std::io::Result<Bytes> {
    let len = stream.read_u16().await? as usize;
    let mut buf = vec![0u8; len];
    stream.read_exact(&mut buf).await?;
    Ok(Bytes::from(buf))
}

async fn run_tcp_connection(
    mut stream: TcpStream,
    routes: Arc<Routes>,
    exclusive: bool,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            frame = read_frame(&mut stream) => match frame {
                Ok(data) => {
                    if let Some(packet) = RtpPacket::from_bytes(data) {
                        dispatch(&routes, exclusive, packet);
                    }
                }
                Err(e) => {
                    tracing::debug!(target: "gb28181::rtp", error = %e, "media connection closed");
                    break;
                }
            }
        }
    }
}

fn dump_file_name(stream_path: &str) -> String {
    format!("{}.ps", stream_path.replace('/', "_"))
}

fn demux_frame(
    demuxer: &mut PsDemuxer,
    ts: u32,
    data: Bytes,
    sink: &dyn FrameSink,
    stream_path: &str,
    errors: &mut u64,
) {
    if let Err(e) = demuxer.read(data, ts, sink) {
        *errors += 1;
        tracing::debug!(target: "gb28181::ps", %stream_path, error = %e, "PS demux error");
    }
}

/// 单个会话的解封装任务
async fn run_session(
    stream_path: String,
    mut rx: mpsc::Receiver<RtpPacket>,
    sink: Arc<dyn FrameSink>,
    mut dump: Option<tokio::fs::File>,
) {
    let mut demuxer = PsDemuxer::new();
    let mut assembler = FrameAssembler::default();
    let mut errors = 0u64;

    while let Some(packet) = rx.recv().await {
        if let Some(file) = dump.as_mut() {
            if let Err(e) = file.write_all(&packet.payload).await {
                tracing::warn!(target: "gb28181::rtp", error = %e, "dump write failed, dump disabled");
                dump = None;
            }
        }

        for (ts, data) in assembler.push(&packet) {
            demux_frame(&mut demuxer, ts, data, sink.as_ref(), &stream_path, &mut errors);
        }
    }

    if let Some((ts, data)) = assembler.flush() {
        demux_frame(&mut demuxer, ts, data, sink.as_ref(), &stream_path, &mut errors);
    }

    tracing::info!(target: "gb28181::rtp", %stream_path, errors, "media session finished");
}

/// RTP/PS 接收绑定，管理各端口监听
pub struct RtpPsBinder {
    bind_ip: String,
    listeners: DashMap<(MediaNetwork, u16), MediaListener>,
    this: Weak<RtpPsBinder>,
}

impl RtpPsBinder {
    pub fn new(bind_ip: impl Into<String>) -> Arc<Self> {
        let bind_ip = bind_ip.into();
        Arc::new_cyclic(|this| Self {
            bind_ip,
            listeners: DashMap::new(),
            this: this.clone(),
        })
    }

    /// 活跃监听端口数
    pub fn active_listeners(&self) -> usize {
        self.listeners.len()
    }

    /// 同步绑定，在 DashMap entry 内完成创建，同一端口只会打开一次
    fn open_listener(&self, network: MediaNetwork, port: u16, exclusive: bool) -> Result<MediaListener> {
        let addr = format!("{}:{}", self.bind_ip, port);
        let routes = Arc::new(Routes::new());
        let (tx, rx) = watch::channel(false);

        match network {
            MediaNetwork::Udp => {
                let socket = std::net::UdpSocket::bind(&addr)?;
                socket.set_nonblocking(true)?;
                let socket = UdpSocket::from_std(socket)?;
                tokio::spawn(run_udp(socket, routes.clone(), exclusive, rx));
            }
            MediaNetwork::Tcp => {
                let listener = std::net::TcpListener::bind(&addr)?;
                listener.set_nonblocking(true)?;
                let listener = TcpListener::from_std(listener)?;
                tokio::spawn(run_tcp(listener, routes.clone(), exclusive, rx));
            }
        }

        tracing::info!(target: "gb28181::rtp", %addr, network = network.as_str(), exclusive, "media listener opened");
        Ok(MediaListener {
            routes,
            exclusive,
            _shutdown: tx,
        })
    }
}

impl MediaRelease for RtpPsBinder {
    fn release(&self, network: MediaNetwork, port: u16, ssrc: u32) {
        let key = (network, port);
        let empty = match self.listeners.get(&key) {
            Some(listener) => {
                listener.routes.remove(&ssrc);
                listener.routes.is_empty()
            }
            None => return,
        };

        if empty && self.listeners.remove_if(&key, |_, l| l.routes.is_empty()).is_some() {
            tracing::info!(target: "gb28181::rtp", port, network = network.as_str(), "media listener closed");
        }
    }
}

#[async_trait]
impl MediaBinder for RtpPsBinder {
    async fn bind(&self, options: ReceiveOptions, sink: Arc<dyn FrameSink>) -> Result<MediaHandle> {
        let key = (options.network, options.port);

        let dump = match &options.dump_path {
            Some(dir) => {
                tokio::fs::create_dir_all(dir).await?;
                Some(tokio::fs::File::create(dir.join(dump_file_name(&options.stream_path))).await?)
            }
            None => None,
        };

        let (tx, rx) = mpsc::channel(1024);
        let registered = {
            let listener = self.listeners.entry(key).or_try_insert_with(|| {
                self.open_listener(options.network, options.port, !options.reuse_port)
            })?;

            if listener.exclusive && !listener.routes.is_empty() {
                Err(GbError::Transport(format!("port {} in use", options.port)))
            } else if listener.routes.contains_key(&options.ssrc) {
                Err(GbError::Transport(format!(
                    "ssrc {} already bound on port {}",
                    options.ssrc, options.port
                )))
            } else {
                listener.routes.insert(options.ssrc, tx);
                Ok(())
            }
        };

        if let Err(e) = registered {
            self.listeners.remove_if(&key, |_, l| l.routes.is_empty());
            return Err(e);
        }

        tokio::spawn(run_session(options.stream_path.clone(), rx, sink, dump));

        match self.this.upgrade() {
            Some(owner) => Ok(MediaHandle::new(options.network, options.port, options.ssrc, owner)),
            None => Ok(MediaHandle::detached(options.network, options.port, options.ssrc)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ps::demuxer::tests::{pack_header, pes, CollectSink};
    use std::time::Duration;

    fn options(network: MediaNetwork, port: u16, ssrc: u32, reuse_port: bool) -> ReceiveOptions {
        ReceiveOptions {
            stream_path: format!("dev/chan{}", ssrc),
            network,
            port,
            ssrc,
            reuse_port,
            dump_path: None,
        }
    }

    fn free_udp_port() -> u16 {
        std::net::UdpSocket::bind("127.0.0.1:0")
            .unwrap()
            .local_addr()
            .unwrap()
            .port()
    }

    fn free_tcp_port() -> u16 {
        std::net::TcpListener::bind("127.0.0.1:0")
            .unwrap()
            .local_addr()
            .unwrap()
            .port()
    }

    fn ps_frame(pts: u64) -> Bytes {
        Bytes::from([pack_header(0), pes(0xE0, Some(pts), None, &[9, 9, 9])].concat())
    }

    async fn wait_for<F: Fn() -> bool>(cond: F) {
        for _ in 0..100 {
            if cond() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("condition not met");
    }

    #[test]
    fn test_frame_assembler() {
        let mut assembler = FrameAssembler::default();
        let p = |ts, marker, data: &'static [u8]| RtpPacket::new(1, 0, ts, marker, Bytes::from_static(data));

        assert!(assembler.push(&p(100, false, b"ab")).is_empty());
        assert!(assembler.push(&p(100, false, b"cd")).is_empty());

        let frames = assembler.push(&p(200, false, b"ef"));
        assert_eq!(frames, vec![(100, Bytes::from_static(b"abcd"))]);

        let frames = assembler.push(&p(200, true, b"gh"));
        assert_eq!(frames, vec![(200, Bytes::from_static(b"efgh"))]);
        assert!(assembler.flush().is_none());
    }

    #[tokio::test]
    async fn test_udp_receive_and_demux() {
        let binder = RtpPsBinder::new("127.0.0.1");
        let port = free_udp_port();
        let sink = Arc::new(CollectSink::default());

        let handle = binder
            .bind(options(MediaNetwork::Udp, port, 200001234, false), sink.clone())
            .await
            .unwrap();
        assert_eq!(binder.active_listeners(), 1);

        let sender = std::net::UdpSocket::bind("127.0.0.1:0").unwrap();
        let packet = RtpPacket::new(200001234, 1, 3600, true, ps_frame(3600));
        sender.send_to(&packet.to_bytes(), ("127.0.0.1", port)).unwrap();

        wait_for(|| sink.video.lock().unwrap().len() == 1).await;
        assert_eq!(sink.video.lock().unwrap()[0].0, 40);

        drop(handle);
        assert_eq!(binder.active_listeners(), 0);
    }

    #[tokio::test]
    async fn test_multiplexed_port_routes_by_ssrc() {
        let binder = RtpPsBinder::new("127.0.0.1");
        let port = free_udp_port();
        let a = Arc::new(CollectSink::default());
        let b = Arc::new(CollectSink::default());

        let _ha = binder.bind(options(MediaNetwork::Udp, port, 1, true), a.clone()).await.unwrap();
        let hb = binder.bind(options(MediaNetwork::Udp, port, 2, true), b.clone()).await.unwrap();
        assert_eq!(binder.active_listeners(), 1);

        let sender = std::net::UdpSocket::bind("127.0.0.1:0").unwrap();
        for ssrc in [2u32, 3, 1] {
            let packet = RtpPacket::new(ssrc, 1, 9000, true, ps_frame(9000));
            sender.send_to(&packet.to_bytes(), ("127.0.0.1", port)).unwrap();
        }

        wait_for(|| a.video.lock().unwrap().len() == 1 && b.video.lock().unwrap().len() == 1).await;

        drop(hb);
        assert_eq!(binder.active_listeners(), 1);
        assert!(binder
            .bind(options(MediaNetwork::Udp, port, 1, true), a.clone())
            .await
            .is_err());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_parallel_binds_share_one_listener() {
        let binder = RtpPsBinder::new("127.0.0.1");

        for round in 0..20u32 {
            let port = free_udp_port();
            let mut tasks = Vec::new();
            for i in 0..8u32 {
                let binder = binder.clone();
                tasks.push(tokio::spawn(async move {
                    let sink = Arc::new(CollectSink::default());
                    binder
                        .bind(options(MediaNetwork::Udp, port, round * 100 + i, true), sink)
                        .await
                }));
            }

            let mut handles = Vec::new();
            for task in tasks {
                handles.push(task.await.unwrap().unwrap());
            }
            assert_eq!(binder.active_listeners(), 1);

            drop(handles);
            assert_eq!(binder.active_listeners(), 0);
        }
    }

    #[tokio::test]
    async fn test_failed_bind_leaves_no_listener() {
        let file = tempfile::NamedTempFile::new().unwrap();
        let binder = RtpPsBinder::new("127.0.0.1");
        let port = free_udp_port();

        let mut opts = options(MediaNetwork::Udp, port, 5, false);
        opts.dump_path = Some(file.path().join("dump"));
        let result = binder.bind(opts, Arc::new(CollectSink::default())).await;
        assert!(matches!(result, Err(GbError::Io(_))));
        assert_eq!(binder.active_listeners(), 0);

        // 端口未被占用，可以重新绑定
        let _h = binder
            .bind(options(MediaNetwork::Udp, port, 5, false), Arc::new(CollectSink::default()))
            .await
            .unwrap();
        assert_eq!(binder.active_listeners(), 1);
    }

    #[tokio::test]
    async fn test_exclusive_port_rejects_second_session() {
        let binder = RtpPsBinder::new("127.0.0.1");
        let port = free_udp_port();
        let sink = Arc::new(CollectSink::default());

        let _h = binder.bind(options(MediaNetwork::Udp, port, 1, false), sink.clone()).await.unwrap();
        let result = binder.bind(options(MediaNetwork::Udp, port, 2, false), sink).await;
        assert!(matches!(result, Err(GbError::Transport(_))));
    }

    #[tokio::test]
    async fn test_tcp_passive_receive() {
        let binder = RtpPsBinder::new("127.0.0.1");
        let port = free_tcp_port();
        let sink = Arc::new(CollectSink::default());
        let _handle = binder
            .bind(options(MediaNetwork::Tcp, port, 7, false), sink.clone())
            .await
            .unwrap();

        let mut conn = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
        // SSRC 与协商不一致，独占端口仍然接收
        let packet = RtpPacket::new(8, 1, 1800, true, ps_frame(1800)).to_bytes();
        conn.write_u16(packet.len() as u16).await.unwrap();
        conn.write_all(&packet).await.unwrap();

        wait_for(|| sink.video.lock().unwrap().len() == 1).await;
        assert_eq!(sink.video.lock().unwrap()[0].0, 20);
    }

    #[tokio::test]
    async fn test_dump_writes_payload() {
        let dir = tempfile::tempdir().unwrap();
        let binder = RtpPsBinder::new("127.0.0.1");
        let port = free_udp_port();
        let sink = Arc::new(CollectSink::default());

        let mut opts = options(MediaNetwork::Udp, port, 5, false);
        opts.dump_path = Some(dir.path().to_path_buf());
        let _handle = binder.bind(opts, sink.clone()).await.unwrap();

        let frame = ps_frame(900);
        let sender = std::net::UdpSocket::bind("127.0.0.1:0").unwrap();
        sender
            .send_to(&RtpPacket::new(5, 1, 900, true, frame.clone()).to_bytes(), ("127.0.0.1", port))
            .unwrap();

        wait_for(|| sink.video.lock().unwrap().len() == 1).await;
        let path = dir.path().join("dev_chan5.ps");
        wait_for(|| std::fs::metadata(&path).map(|m| m.len() as usize == frame.len()).unwrap_or(false)).await;
    }
}
