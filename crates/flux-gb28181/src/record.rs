// 录像查询结果关联
// 查询前按 (设备, 通道, SN) 登记等待槽，响应或超时二者只会生效一次

use crate::{GbError, Result};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;

/// 录像条目
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Record {
    #[serde(rename = "DeviceID", default)]
    pub device_id: String,
    #[serde(rename = "Name", default)]
    pub name: String,
    #[serde(rename = "FilePath", default)]
    pub file_path: String,
    #[serde(rename = "Address", default)]
    pub address: String,
    #[serde(rename = "StartTime", default)]
    pub start_time: String,
    #[serde(rename = "EndTime", default)]
    pub end_time: String,
    #[serde(rename = "Secrecy", default)]
    pub secrecy: u8,
    #[serde(rename = "Type", default)]
    pub record_type: String,
}

type QueryKey = (String, String, u32);

struct Pending {
    tx: oneshot::Sender<Result<Vec<Record>>>,
    records: Vec<Record>,
}

/// 录像查询等待表
#[derive(Default)]
pub struct RecordQueryLink {
    pending: DashMap<QueryKey, Pending>,
}

impl RecordQueryLink {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    /// 登记等待槽，超时后自动以 Timeout 结束
    pub fn wait_result(
        self: &Arc<Self>,
        device_id: &str,
        channel_id: &str,
        sn: u32,
        timeout: Duration,
    ) -> oneshot::Receiver<Result<Vec<Record>>> {
        let (tx, rx) = oneshot::channel();
        let key = (device_id.to_string(), channel_id.to_string(), sn);
        self.pending.insert(
            key.clone(),
            Pending {
                tx,
                records: Vec::new(),
            },
        );

        let link = Arc::downgrade(self);
        tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            let Some(link) = link.upgrade() else { return };
            if let Some((_, pending)) = link.pending.remove(&key) {
                tracing::warn!(
                    target: "gb28181::record",
                    device_id = %key.0,
                    channel_id = %key.1,
                    sn = key.2,
                    received = pending.records.len(),
                    "record query timeout"
                );
                let _ = pending.tx.send(Err(GbError::Timeout));
            }
        });

        rx
    }

    /// 投递一段响应；累计数量达到 SumNum 时完成
    pub fn put(&self, device_id: &str, channel_id: &str, sn: u32, sum_num: u32, records: Vec<Record>) {
        let key = (device_id.to_string(), channel_id.to_string(), sn);

        let complete = match self.pending.get_mut(&key) {
            Some(mut pending) => {
                pending.records.extend(records);
                pending.records.len() >= sum_num as usize
            }
            None => {
                tracing::debug!(target: "gb28181::record", %device_id, %channel_id, sn, "no pending record query");
                return;
            }
        };

        if complete {
            if let Some((_, pending)) = self.pending.remove(&key) {
                let _ = pending.tx.send(Ok(pending.records));
            }
        }
    }

    /// 请求发送失败时撤销等待槽
    pub fn cancel(&self, device_id: &str, channel_id: &str, sn: u32) {
        self.pending
            .remove(&(device_id.to_string(), channel_id.to_string(), sn));
    }
}
