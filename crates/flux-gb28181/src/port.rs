// 媒体端口分配

use crate::{GbError, Result};
use crossbeam::queue::ArrayQueue;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

/// 端口池：先复用回收的端口，再顺序分配新端口
#[derive(Debug)]
pub struct PortManager {
    min: u16,
    max: u16,
    cursor: AtomicU32,
    recycled: ArrayQueue<u16>,
}

impl PortManager {
    /// 闭区间 [min, max]
    pub fn new(min: u16, max: u16) -> Self {
        let capacity = (max.saturating_sub(min) as usize) + 1;
        Self {
            min,
            max,
            cursor: AtomicU32::new(min as u32),
            recycled: ArrayQueue::new(capacity),
        }
    }

    pub fn capacity(&self) -> usize {
        self.recycled.capacity()
    }

    pub fn get_port(&self) -> Result<u16> {
        if let Some(port) = self.recycled.pop() {
            return Ok(port);
        }

        let max = self.max as u32;
        self.cursor
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |pos| {
                (pos <= max).then_some(pos + 1)
            })
            .map(|pos| pos as u16)
            .map_err(|_| GbError::PortExhausted)
    }

    pub fn recycle(&self, port: u16) {
        if port < self.min || port > self.max {
            tracing::warn!(target: "gb28181::port", port, "recycle port out of range");
            return;
        }
        if self.recycled.push(port).is_err() {
            tracing::warn!(target: "gb28181::port", port, "recycle queue full");
        }
    }

    /// 分配一个端口，离开作用域时自动归还
    pub fn lease(self: &Arc<Self>) -> Result<PortLease> {
        let port = self.get_port()?;
        Ok(PortLease {
            port,
            pool: Some(self.clone()),
        })
    }
}

/// 端口租约
#[derive(Debug)]
pub struct PortLease {
    port: u16,
    pool: Option<Arc<PortManager>>,
}

impl PortLease {
    /// 固定端口（多路复用），不归还
    pub fn fixed(port: u16) -> Self {
        Self { port, pool: None }
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn is_pooled(&self) -> bool {
        self.pool.is_some()
    }
}

impl Drop for PortLease {
    fn drop(&mut self) {
        if let Some(pool) = self.pool.take() {
            tracing::debug!(target: "gb28181::port", port = self.port, "port recycled");
            pool.recycle(self.port);
        }
    }
}
