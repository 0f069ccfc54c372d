//! 心跳监视器
//!
//! 协调器在第一个对端注册时启动，最后一个对端离开时停止；注册表暂时为空时
//! 任务继续空转，不会自行退出。每个间隔向所有对端广播 `KEEP_ALIVE`，
//! 广播后剔除超过超时时间没有任何流量的对端。收到 `KEEP_ALIVE` 回复一次
//! `KEEP_ALIVE_ACK`，收到 `KEEP_ALIVE_ACK` 和聊天帧只刷新活跃时间。

use crate::config::KeepAliveConfig;
use crate::registry::{PeerRegistry, RegisteredPeer};
use crate::transport::{DatagramOutbox, PeerHandle};
use crate::wire::WireFrame;
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};

/// 心跳监视器
pub struct KeepAliveMonitor {
    config: KeepAliveConfig,
    registry: Arc<PeerRegistry>,
    outbox: Arc<DatagramOutbox>,
    /// 超时剔除的对端交给协调器处理
    stale_tx: mpsc::UnboundedSender<RegisteredPeer>,
    ticker: Mutex<Option<JoinHandle<()>>>,
}

impl KeepAliveMonitor {
    /// 创建新的心跳监视器（不会立即启动）
    pub fn new(
        config: KeepAliveConfig,
        registry: Arc<PeerRegistry>,
        outbox: Arc<DatagramOutbox>,
        stale_tx: mpsc::UnboundedSender<RegisteredPeer>,
    ) -> Self {
        Self {
            config: config.validate(),
            registry,
            outbox,
            stale_tx,
            ticker: Mutex::new(None),
        }
    }

    /// 启动心跳任务（已在运行时不做任何事）
    pub fn start(&self) {
        let mut ticker = match self.ticker.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };

        if ticker.as_ref().is_some_and(|handle| !handle.is_finished()) {
            return;
        }

        tracing::info!(
            "启动心跳任务: 间隔 {:?}, 超时 {:?}",
            self.config.interval,
            self.config.timeout
        );

        *ticker = Some(tokio::spawn(run_ticker(
            self.config.clone(),
            self.registry.clone(),
            self.outbox.clone(),
            self.stale_tx.clone(),
        )));
    }

    /// 停止心跳任务
    pub fn stop(&self) {
        let mut ticker = match self.ticker.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        if let Some(handle) = ticker.take() {
            handle.abort();
            tracing::debug!("心跳任务已停止");
        }
    }

    /// 心跳任务是否在运行
    pub fn is_running(&self) -> bool {
        match self.ticker.lock() {
            Ok(guard) => guard.as_ref().is_some_and(|handle| !handle.is_finished()),
            Err(poisoned) => poisoned
                .into_inner()
                .as_ref()
                .is_some_and(|handle| !handle.is_finished()),
        }
    }

    /// 收到 KEEP_ALIVE：刷新活跃时间并回复一次 ACK
    pub async fn on_keep_alive(&self, peer: &PeerHandle) {
        if !self.registry.touch(peer.key()).await {
            tracing::debug!("收到未注册对端 {} 的心跳", peer);
        }
        if let Err(e) = self.outbox.send(peer, &WireFrame::KeepAliveAck) {
            tracing::warn!("回复 {} 心跳确认失败: {}", peer, e);
        }
    }

    /// 收到 KEEP_ALIVE_ACK：只刷新活跃时间
    pub async fn on_keep_alive_ack(&self, peer: &PeerHandle) {
        self.registry.touch(peer.key()).await;
    }

    /// 任意其他流量：刷新活跃时间
    pub async fn on_traffic(&self, peer: &PeerHandle) {
        self.registry.touch(peer.key()).await;
    }

    /// 获取配置
    pub fn config(&self) -> &KeepAliveConfig {
        &self.config
    }
}

impl Drop for KeepAliveMonitor {
    fn drop(&mut self) {
        self.stop();
    }
}

async fn run_ticker(
    config: KeepAliveConfig,
    registry: Arc<PeerRegistry>,
    outbox: Arc<DatagramOutbox>,
    stale_tx: mpsc::UnboundedSender<RegisteredPeer>,
) {
    let mut interval = tokio::time::interval_at(Instant::now() + config.interval, config.interval);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        interval.tick().await;

        let handles = registry.handles().await;
        if handles.is_empty() {
            continue;
        }

        let delivered = outbox.broadcast(&handles, &WireFrame::KeepAlive);
        tracing::debug!("发送心跳: {}/{}", delivered, handles.len());

        for peer in registry.evict_stale(config.timeout).await {
            tracing::warn!("💔 对端 {} 超过 {:?} 没有流量，判定为离线", peer.key(), config.timeout);
            if stale_tx.send(peer).is_err() {
                return;
            }
        }
    }
}
