//! 心跳任务
//!
//! 进入 Ready 后周期性发送 `ping {recvid}`，断开 / 迁移 / 关闭时停止。

use crate::codec;
use crate::events::{Command, PingData};
use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

pub struct Keepalive {
    interval: Duration,
    handle: Mutex<Option<JoinHandle<()>>>,
    /// 累计启动次数
    starts: AtomicU64,
    last_ping_at: Arc<RwLock<Option<DateTime<Utc>>>>,
}

impl Keepalive {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            handle: Mutex::new(None),
            starts: AtomicU64::new(0),
            last_ping_at: Arc::new(RwLock::new(None)),
        }
    }

    /// 启动心跳任务
    ///
    /// 每个 ping 帧交给 `emit`；`emit` 返回 false（出站队列已关闭）时任务退出。
    pub fn start<F>(&self, mut emit: F, last_received: watch::Receiver<Option<String>>)
    where
        F: FnMut(String) -> bool + Send + 'static,
    {
        // 停止旧的心跳任务
        self.stop();

        let interval = self.interval;
        let last_ping_at = self.last_ping_at.clone();

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                ticker.tick().await;

                let data = PingData {
                    recvid: last_received.borrow().clone(),
                };
                let frame = match serde_json::to_value(&data)
                    .map_err(Into::into)
                    .and_then(|value| codec::encode(&Command::Ping, Some(&value)))
                {
                    Ok(frame) => frame,
                    Err(e) => {
                        warn!("[Keepalive] Failed to encode ping: {}", e);
                        continue;
                    }
                };

                if !emit(frame) {
                    debug!("[Keepalive] Outbound queue closed, stopping");
                    break;
                }
                *last_ping_at.write() = Some(Utc::now());
            }
        });

        *self.handle.lock() = Some(handle);
        self.starts.fetch_add(1, Ordering::SeqCst);
        info!("[Keepalive] Ping loop started ({:?})", interval);
    }

    /// 停止心跳任务，返回之前是否在运行
    pub fn stop(&self) -> bool {
        match self.handle.lock().take() {
            Some(handle) => {
                handle.abort();
                info!("[Keepalive] Ping loop stopped");
                true
            }
            None => false,
        }
    }

    pub fn is_running(&self) -> bool {
        self.handle
            .lock()
            .as_ref()
            .map_or(false, |handle| !handle.is_finished())
    }

    pub fn start_count(&self) -> u64 {
        self.starts.load(Ordering::SeqCst)
    }

    pub fn last_ping_at(&self) -> Option<DateTime<Utc>> {
        *self.last_ping_at.read()
    }
}

impl Drop for Keepalive {
    fn drop(&mut self) {
        if let Some(handle) = self.handle.get_mut().take() {
            handle.abort();
        }
    }
}
