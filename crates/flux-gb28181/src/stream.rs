// 流媒体引擎接口
// 解封装输出的音视频帧交给外部流引擎，由其负责分发给播放端

use crate::{GbError, Result};
use bytes::Bytes;
use dashmap::DashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

/// 解封装结果的接收端
pub trait FrameSink: Send + Sync {
    /// 视频帧：`ts` 为毫秒 DTS，`cts` 为 PTS-DTS（毫秒）
    fn push_video(&self, ts: u32, cts: u32, payload: Bytes);

    fn push_audio(&self, ts: u32, payload: Bytes);
}

/// 发布参数（回放/下载流需要超时关闭）
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PublishOptions {
    /// 有过数据后，持续无数据多久关闭
    pub idle_timeout: Option<Duration>,

    /// 创建后一直无数据多久关闭
    pub delay_close_timeout: Option<Duration>,
}

/// 外部流引擎
pub trait StreamEngine: Send + Sync {
    fn publish(&self, stream_path: &str, options: PublishOptions) -> Result<Arc<dyn FrameSink>>;

    fn close(&self, stream_path: &str) -> bool;

    fn pause(&self, stream_path: &str) -> bool;

    fn resume(&self, stream_path: &str) -> bool;
}

/// 分发给订阅者的媒体帧
#[derive(Debug, Clone)]
pub enum MediaFrame {
    Video { ts: u32, cts: u32, data: Bytes },
    Audio { ts: u32, data: Bytes },
}

/// 关闭原因
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    Requested,
    IdleTimeout,
    NoData,
}

/// 流事件
#[derive(Debug, Clone)]
pub enum StreamEvent {
    StreamPublished {
        stream_path: String,
        timestamp: chrono::DateTime<chrono::Utc>,
    },
    StreamClosed {
        stream_path: String,
        reason: CloseReason,
    },
    StreamPaused {
        stream_path: String,
    },
    StreamResumed {
        stream_path: String,
    },
}

/// 单路流
pub struct HubStream {
    stream_path: String,
    options: PublishOptions,
    created_at: Instant,

    /// 最后一帧相对 created_at 的毫秒数 + 1，0 表示尚无数据
    last_frame_ms: AtomicU64,
    paused: AtomicBool,
    video_frames: AtomicU64,
    audio_frames: AtomicU64,

    frames: broadcast::Sender<MediaFrame>,
}

impl HubStream {
    fn new(stream_path: String, options: PublishOptions) -> Self {
        let (frames, _) = broadcast::channel(256);
        Self {
            stream_path,
            options,
            created_at: Instant::now(),
            last_frame_ms: AtomicU64::new(0),
            paused: AtomicBool::new(false),
            video_frames: AtomicU64::new(0),
            audio_frames: AtomicU64::new(0),
            frames,
        }
    }

    pub fn stream_path(&self) -> &str {
        &self.stream_path
    }

    pub fn options(&self) -> &PublishOptions {
        &self.options
    }

    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::Acquire)
    }

    pub fn video_frames(&self) -> u64 {
        self.video_frames.load(Ordering::Relaxed)
    }

    pub fn audio_frames(&self) -> u64 {
        self.audio_frames.load(Ordering::Relaxed)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<MediaFrame> {
        self.frames.subscribe()
    }

    fn touch(&self) {
        let elapsed = self.created_at.elapsed().as_millis() as u64;
        self.last_frame_ms.store(elapsed + 1, Ordering::Release);
    }

    fn dispatch(&self, frame: MediaFrame) {
        self.touch();
        if self.is_paused() {
            return;
        }
        // 没有订阅者时发送失败，忽略
        let _ = self.frames.send(frame);
    }

    /// 按超时规则判断是否应关闭
    fn expired(&self, now: Instant) -> Option<CloseReason> {
        let since_created = now.saturating_duration_since(self.created_at);
        match self.last_frame_ms.load(Ordering::Acquire) {
            0 => match self.options.delay_close_timeout {
                Some(timeout) if since_created > timeout => Some(CloseReason::NoData),
                _ => None,
            },
            last => {
                let last = Duration::from_millis(last - 1);
                match self.options.idle_timeout {
                    Some(timeout) if since_created.saturating_sub(last) > timeout => {
                        Some(CloseReason::IdleTimeout)
                    }
                    _ => None,
                }
            }
        }
    }
}

impl FrameSink for HubStream {
    fn push_video(&self, ts: u32, cts: u32, payload: Bytes) {
        self.video_frames.fetch_add(1, Ordering::Relaxed);
        self.dispatch(MediaFrame::Video { ts, cts, data: payload });
    }

    fn push_audio(&self, ts: u32, payload: Bytes) {
        self.audio_frames.fetch_add(1, Ordering::Relaxed);
        self.dispatch(MediaFrame::Audio { ts, data: payload });
    }
}

/// 内存流引擎：管理所有活跃流
pub struct MediaHub {
    streams: DashMap<String, Arc<HubStream>>,

    // 全局事件总线
    event_bus: broadcast::Sender<StreamEvent>,
}

impl MediaHub {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(1024);
        Self {
            streams: DashMap::new(),
            event_bus: tx,
        }
    }

    pub fn events(&self) -> broadcast::Receiver<StreamEvent> {
        self.event_bus.subscribe()
    }

    pub fn get(&self, stream_path: &str) -> Option<Arc<HubStream>> {
        self.streams.get(stream_path).map(|s| s.value().clone())
    }

    /// 获取所有活跃流
    pub fn list_streams(&self) -> Vec<String> {
        self.streams.iter().map(|entry| entry.key().clone()).collect()
    }

    fn close_with(&self, stream_path: &str, reason: CloseReason) -> bool {
        if self.streams.remove(stream_path).is_none() {
            return false;
        }

        tracing::info!(target: "gb28181::stream", %stream_path, ?reason, "stream closed");
        let _ = self.event_bus.send(StreamEvent::StreamClosed {
            stream_path: stream_path.to_string(),
            reason,
        });
        true
    }

    /// 扫描一次超时流，返回被关闭的数量
    pub fn sweep(&self) -> usize {
        let now = Instant::now();
        let expired: Vec<(String, CloseReason)> = self
            .streams
            .iter()
            .filter_map(|entry| entry.value().expired(now).map(|r| (entry.key().clone(), r)))
            .collect();

        expired
            .into_iter()
            .filter(|(path, reason)| self.close_with(path, *reason))
            .count()
    }

    /// 启动超时巡检任务
    pub fn spawn_watchdog(self: &Arc<Self>, interval: Duration) -> JoinHandle<()> {
        let hub = Arc::downgrade(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                let Some(hub) = hub.upgrade() else { break };
                let closed = hub.sweep();
                if closed > 0 {
                    tracing::info!(target: "gb28181::stream", closed, "closed idle streams");
                }
            }
        })
    }
}

impl Default for MediaHub {
    fn default() -> Self {
        Self::new()
    }
}

impl StreamEngine for MediaHub {
    fn publish(&self, stream_path: &str, options: PublishOptions) -> Result<Arc<dyn FrameSink>> {
        let stream = match self.streams.entry(stream_path.to_string()) {
            dashmap::mapref::entry::Entry::Occupied(_) => {
                return Err(GbError::StreamAlreadyExists(stream_path.to_string()));
            }
            dashmap::mapref::entry::Entry::Vacant(entry) => {
                let stream = Arc::new(HubStream::new(stream_path.to_string(), options));
                entry.insert(stream.clone());
                stream
            }
        };

        tracing::info!(target: "gb28181::stream", %stream_path, "stream published");
        let _ = self.event_bus.send(StreamEvent::StreamPublished {
            stream_path: stream_path.to_string(),
            timestamp: chrono::Utc::now(),
        });

        Ok(stream as Arc<dyn FrameSink>)
    }

    fn close(&self, stream_path: &str) -> bool {
        self.close_with(stream_path, CloseReason::Requested)
    }

    fn pause(&self, stream_path: &str) -> bool {
        let Some(stream) = self.get(stream_path) else {
            return false;
        };
        stream.paused.store(true, Ordering::Release);
        let _ = self.event_bus.send(StreamEvent::StreamPaused {
            stream_path: stream_path.to_string(),
        });
        true
    }

    fn resume(&self, stream_path: &str) -> bool {
        let Some(stream) = self.get(stream_path) else {
            return false;
        };
        stream.paused.store(false, Ordering::Release);
        let _ = self.event_bus.send(StreamEvent::StreamResumed {
            stream_path: stream_path.to_string(),
        });
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_publish_and_subscribe() {
        let hub = MediaHub::new();
        let mut events = hub.events();

        let sink = hub
            .publish("34020000001320000001/34020000001320000002", PublishOptions::default())
            .unwrap();
        let stream = hub.get("34020000001320000001/34020000001320000002").unwrap();
        let mut frames = stream.subscribe();

        sink.push_video(40, 0, Bytes::from_static(&[1, 2, 3]));

        match frames.recv().await.unwrap() {
            MediaFrame::Video { ts, cts, data } => {
                assert_eq!(ts, 40);
                assert_eq!(cts, 0);
                assert_eq!(&data[..], &[1, 2, 3]);
            }
            other => panic!("unexpected frame {:?}", other),
        }
        assert!(matches!(
            events.recv().await.unwrap(),
            StreamEvent::StreamPublished { .. }
        ));
        assert_eq!(stream.video_frames(), 1);
    }

    #[test]
    fn test_duplicate_publish_rejected() {
        let hub = MediaHub::new();
        hub.publish("a/b", PublishOptions::default()).unwrap();
        assert!(matches!(
            hub.publish("a/b", PublishOptions::default()),
            Err(GbError::StreamAlreadyExists(_))
        ));
    }

    #[tokio::test]
    async fn test_pause_drops_frames_for_subscribers() {
        let hub = MediaHub::new();
        let sink = hub.publish("a/b", PublishOptions::default()).unwrap();
        let stream = hub.get("a/b").unwrap();
        let mut frames = stream.subscribe();

        assert!(hub.pause("a/b"));
        sink.push_audio(1, Bytes::from_static(&[1]));
        assert!(frames.try_recv().is_err());

        assert!(hub.resume("a/b"));
        sink.push_audio(2, Bytes::from_static(&[2]));
        assert!(matches!(frames.try_recv(), Ok(MediaFrame::Audio { ts: 2, .. })));
        assert!(!hub.pause("missing"));
    }

    #[tokio::test]
    async fn test_sweep_closes_stream_without_data() {
        let hub = MediaHub::new();
        let mut events = hub.events();
        hub.publish(
            "a/b/1-2",
            PublishOptions {
                idle_timeout: Some(Duration::from_millis(10)),
                delay_close_timeout: Some(Duration::from_millis(10)),
            },
        )
        .unwrap();
        hub.publish("a/c", PublishOptions::default()).unwrap();

        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(hub.sweep(), 1);
        assert!(hub.get("a/b/1-2").is_none());
        assert!(hub.get("a/c").is_some());

        let _published = events.recv().await.unwrap();
        let _published = events.recv().await.unwrap();
        match events.recv().await.unwrap() {
            StreamEvent::StreamClosed { stream_path, reason } => {
                assert_eq!(stream_path, "a/b/1-2");
                assert_eq!(reason, CloseReason::NoData);
            }
            other => panic!("unexpected event {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_sweep_closes_idle_stream() {
        let hub = MediaHub::new();
        let sink = hub
            .publish(
                "a/b/1-2",
                PublishOptions {
                    idle_timeout: Some(Duration::from_millis(10)),
                    delay_close_timeout: Some(Duration::from_secs(60)),
                },
            )
            .unwrap();
        sink.push_video(0, 0, Bytes::from_static(&[0]));
        assert_eq!(hub.sweep(), 0);

        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(hub.sweep(), 1);
        assert!(!hub.close("a/b/1-2"));
    }
}
