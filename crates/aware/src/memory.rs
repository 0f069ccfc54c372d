//! 进程内模拟网格
//!
//! 多个命名设备共享同一个 [`MemoryMesh`]。相同服务名的发布会话和订阅会话会自动互相发现，
//! 数据报在会话之间直接路由。承载网络请求按设备的 [`BearerPolicy`] 解决。
//!
//! 还提供测试和模拟模式需要的钩子：关闭无线、重复通告、静默分区、强制丢失承载网络、
//! 查询承载请求次数和已发送的数据报。

use crate::transport::{
    AttachError, AttachHandle, BearerError, BearerHandle, BearerRequest, DiscoverySession,
    DiscoveryTransport, PeerHandle, PeerKey, SendError, SessionEvent, SessionId,
};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::mpsc;

/// 承载网络请求的处理策略
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BearerPolicy {
    /// 立即成功
    #[default]
    Accept,
    /// 立即拒绝
    Reject,
    /// 一直挂起直到超时
    Hang,
}

/// 已发送的数据报记录
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SentDatagram {
    pub session: SessionId,
    pub peer: PeerHandle,
    pub sequence: u32,
    pub payload: Vec<u8>,
}

#[derive(Debug, Clone)]
enum SlotKind {
    Publish { service: String, room: String },
    Subscribe { service: String },
}

#[derive(Debug)]
struct SessionSlot {
    device: String,
    handle: PeerHandle,
    kind: SlotKind,
    tx: mpsc::UnboundedSender<SessionEvent>,
}

#[derive(Debug)]
struct DeviceState {
    available: bool,
    attach: Option<AttachHandle>,
    bearer_policy: BearerPolicy,
    partitioned: bool,
    bearer_requests: HashMap<PeerKey, usize>,
    bearers: Vec<(SessionId, PeerHandle)>,
    sent: Vec<SentDatagram>,
}

impl Default for DeviceState {
    fn default() -> Self {
        Self {
            available: true,
            attach: None,
            bearer_policy: BearerPolicy::default(),
            partitioned: false,
            bearer_requests: HashMap::new(),
            bearers: Vec::new(),
            sent: Vec::new(),
        }
    }
}

#[derive(Debug, Default)]
struct MeshState {
    next_id: u64,
    devices: HashMap<String, DeviceState>,
    sessions: HashMap<SessionId, SessionSlot>,
    handles: HashMap<PeerKey, SessionId>,
}

impl MeshState {
    fn next_id(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }

    fn is_partitioned(&self, device: &str) -> bool {
        self.devices.get(device).is_some_and(|d| d.partitioned)
    }

    fn check_attach(&self, device: &str, attach: &AttachHandle) -> Result<(), AttachError> {
        match self.devices.get(device) {
            Some(state) if state.attach.as_ref() == Some(attach) => Ok(()),
            _ => Err(AttachError::Failed(format!("设备 {} 的附着句柄已失效", device))),
        }
    }

    /// 把发布会话通告给订阅会话
    fn announce_pair(&self, publisher: SessionId, subscriber: SessionId) {
        let (Some(pub_slot), Some(sub_slot)) =
            (self.sessions.get(&publisher), self.sessions.get(&subscriber))
        else {
            return;
        };
        if pub_slot.device == sub_slot.device {
            return;
        }
        if let (SlotKind::Publish { service, room }, SlotKind::Subscribe { service: wanted }) =
            (&pub_slot.kind, &sub_slot.kind)
        {
            if service == wanted {
                let _ = sub_slot.tx.send(SessionEvent::ServiceDiscovered {
                    peer: pub_slot.handle.clone(),
                    service_info: room.as_bytes().to_vec(),
                });
            }
        }
    }

    fn remove_session(&mut self, session: SessionId) {
        if let Some(slot) = self.sessions.remove(&session) {
            self.handles.remove(slot.handle.key());
            if let Some(device) = self.devices.get_mut(&slot.device) {
                device.bearers.retain(|(s, _)| *s != session);
            }
            tracing::debug!("模拟网格关闭会话: {} ({})", session, slot.device);
        }
    }
}

/// 进程内模拟网格
#[derive(Debug, Clone, Default)]
pub struct MemoryMesh {
    state: Arc<Mutex<MeshState>>,
}

impl MemoryMesh {
    /// 创建空网格
    pub fn new() -> Self {
        Self::default()
    }

    /// 加入一个设备，返回它的传输层
    pub fn device(&self, name: impl Into<String>) -> MemoryTransport {
        let name = name.into();
        self.lock().devices.entry(name.clone()).or_default();
        MemoryTransport {
            mesh: self.clone(),
            name,
        }
    }

    /// 重新通告所有房间（模拟平台重复回调发现事件）
    pub fn announce(&self) {
        let state = self.lock();
        let publishers: Vec<SessionId> = state
            .sessions
            .iter()
            .filter(|(_, slot)| matches!(slot.kind, SlotKind::Publish { .. }))
            .map(|(id, _)| *id)
            .collect();
        let subscribers: Vec<SessionId> = state
            .sessions
            .iter()
            .filter(|(_, slot)| matches!(slot.kind, SlotKind::Subscribe { .. }))
            .map(|(id, _)| *id)
            .collect();

        for publisher in &publishers {
            for subscriber in &subscribers {
                state.announce_pair(*publisher, *subscriber);
            }
        }
    }

    /// 当前打开的会话数量
    pub fn session_count(&self) -> usize {
        self.lock().sessions.len()
    }

    fn lock(&self) -> MutexGuard<'_, MeshState> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

/// 模拟网格中的单个设备
#[derive(Debug, Clone)]
pub struct MemoryTransport {
    mesh: MemoryMesh,
    name: String,
}

impl MemoryTransport {
    /// 设备名称
    pub fn name(&self) -> &str {
        &self.name
    }

    /// 打开或关闭近场能力
    pub fn set_available(&self, available: bool) {
        self.with_device(|device| device.available = available);
    }

    /// 设置承载网络策略
    pub fn set_bearer_policy(&self, policy: BearerPolicy) {
        self.with_device(|device| device.bearer_policy = policy);
    }

    /// 静默分区：进出此设备的数据报全部丢弃，不产生任何通知
    pub fn set_partitioned(&self, partitioned: bool) {
        self.with_device(|device| device.partitioned = partitioned);
    }

    /// 对某个对端发起承载网络请求的次数
    pub fn bearer_request_count(&self, peer: &str) -> usize {
        let state = self.mesh.lock();
        state
            .devices
            .get(&self.name)
            .and_then(|device| device.bearer_requests.get(peer).copied())
            .unwrap_or(0)
    }

    /// 已发送的所有数据报
    pub fn sent_datagrams(&self) -> Vec<SentDatagram> {
        let state = self.mesh.lock();
        state
            .devices
            .get(&self.name)
            .map(|device| device.sent.clone())
            .unwrap_or_default()
    }

    /// 发往某个对端的负载
    pub fn sent_payloads_to(&self, peer: &str) -> Vec<Vec<u8>> {
        self.sent_datagrams()
            .into_iter()
            .filter(|d| d.peer.key() == peer)
            .map(|d| d.payload)
            .collect()
    }

    /// 当前打开的发现会话对应的对端句柄（即其他设备看到的本设备）
    pub fn session_handles(&self) -> Vec<PeerHandle> {
        let state = self.mesh.lock();
        state
            .sessions
            .values()
            .filter(|slot| slot.device == self.name)
            .map(|slot| slot.handle.clone())
            .collect()
    }

    /// 当前打开的发现会话 ID
    pub fn session_ids(&self) -> Vec<SessionId> {
        let state = self.mesh.lock();
        state
            .sessions
            .iter()
            .filter(|(_, slot)| slot.device == self.name)
            .map(|(id, _)| *id)
            .collect()
    }

    /// 强制丢失与本设备相关的所有承载网络，双方都会收到 BearerLost
    pub fn drop_bearers(&self) {
        let mut state = self.mesh.lock();
        let own_handles: Vec<PeerKey> = state
            .sessions
            .values()
            .filter(|slot| slot.device == self.name)
            .map(|slot| slot.handle.key().to_string())
            .collect();

        let mut lost: Vec<(SessionId, PeerHandle)> = Vec::new();
        for (name, device) in state.devices.iter_mut() {
            if *name == self.name {
                lost.append(&mut device.bearers);
            } else {
                let (gone, kept): (Vec<_>, Vec<_>) = device
                    .bearers
                    .drain(..)
                    .partition(|(_, peer)| own_handles.iter().any(|k| k == peer.key()));
                device.bearers = kept;
                lost.extend(gone);
            }
        }

        for (session, peer) in lost {
            if let Some(slot) = state.sessions.get(&session) {
                tracing::debug!("模拟网格: {} 丢失到 {} 的承载网络", slot.device, peer);
                let _ = slot.tx.send(SessionEvent::BearerLost { peer });
            }
        }
    }

    fn with_device<F: FnOnce(&mut DeviceState)>(&self, f: F) {
        let mut state = self.mesh.lock();
        f(state.devices.entry(self.name.clone()).or_default());
    }

    fn open_session(&self, attach: &AttachHandle, kind: SlotKind) -> Result<DiscoverySession, AttachError> {
        let mut state = self.mesh.lock();
        state.check_attach(&self.name, attach)?;

        let id = SessionId(state.next_id());
        let handle = PeerHandle::new(format!("{}#{}", self.name, id.0));
        let (tx, events) = mpsc::unbounded_channel();

        state.handles.insert(handle.key().to_string(), id);
        state.sessions.insert(
            id,
            SessionSlot {
                device: self.name.clone(),
                handle,
                kind: kind.clone(),
                tx,
            },
        );

        let others: Vec<SessionId> = state
            .sessions
            .keys()
            .copied()
            .filter(|other| *other != id)
            .collect();
        for other in others {
            match kind {
                SlotKind::Publish { .. } => state.announce_pair(id, other),
                SlotKind::Subscribe { .. } => state.announce_pair(other, id),
            }
        }

        Ok(DiscoverySession { id, events })
    }
}

#[async_trait]
impl DiscoveryTransport for MemoryTransport {
    async fn attach(&self) -> Result<AttachHandle, AttachError> {
        let mut state = self.mesh.lock();
        let id = state.next_id();
        let device = state.devices.entry(self.name.clone()).or_default();

        if !device.available {
            return Err(AttachError::Unavailable(format!("设备 {} 的近场能力已关闭", self.name)));
        }
        if let Some(existing) = &device.attach {
            return Ok(existing.clone());
        }

        let handle = AttachHandle { id };
        device.attach = Some(handle.clone());
        tracing::debug!("模拟网格: {} 已附着", self.name);
        Ok(handle)
    }

    async fn publish(
        &self,
        attach: &AttachHandle,
        service_name: &str,
        room_name: &str,
    ) -> Result<DiscoverySession, AttachError> {
        self.open_session(
            attach,
            SlotKind::Publish {
                service: service_name.to_string(),
                room: room_name.to_string(),
            },
        )
    }

    async fn subscribe(
        &self,
        attach: &AttachHandle,
        service_name: &str,
    ) -> Result<DiscoverySession, AttachError> {
        self.open_session(
            attach,
            SlotKind::Subscribe {
                service: service_name.to_string(),
            },
        )
    }

    fn send_datagram(
        &self,
        session: SessionId,
        peer: &PeerHandle,
        sequence: u32,
        payload: &[u8],
    ) -> Result<(), SendError> {
        let mut state = self.mesh.lock();

        let from = match state.sessions.get(&session) {
            Some(slot) if slot.device == self.name => slot.handle.clone(),
            _ => return Err(SendError::SessionClosed),
        };

        if let Some(device) = state.devices.get_mut(&self.name) {
            device.sent.push(SentDatagram {
                session,
                peer: peer.clone(),
                sequence,
                payload: payload.to_vec(),
            });
        }

        let target = state
            .handles
            .get(peer.key())
            .and_then(|id| state.sessions.get(id))
            .ok_or_else(|| SendError::UnknownPeer(peer.key().to_string()))?;

        if state.is_partitioned(&self.name) || state.is_partitioned(&target.device) {
            return Ok(());
        }

        let _ = target.tx.send(SessionEvent::MessageReceived {
            peer: from,
            payload: payload.to_vec(),
        });
        Ok(())
    }

    async fn request_bearer(
        &self,
        session: SessionId,
        peer: &PeerHandle,
        request: BearerRequest,
    ) -> Result<BearerHandle, BearerError> {
        let (policy, id) = {
            let mut state = self.mesh.lock();
            if !state.sessions.contains_key(&session) {
                return Err(BearerError::SessionClosed);
            }
            let id = state.next_id();
            let device = state.devices.entry(self.name.clone()).or_default();
            *device.bearer_requests.entry(peer.key().to_string()).or_insert(0) += 1;
            (device.bearer_policy, id)
        };

        match policy {
            BearerPolicy::Accept => {
                let mut state = self.mesh.lock();
                if !state.sessions.contains_key(&session) {
                    return Err(BearerError::SessionClosed);
                }
                if let Some(device) = state.devices.get_mut(&self.name) {
                    device.bearers.push((session, peer.clone()));
                }
                Ok(BearerHandle {
                    id,
                    peer: peer.clone(),
                })
            }
            BearerPolicy::Reject => Err(BearerError::Rejected(format!(
                "{} 拒绝了到 {} 的承载网络",
                self.name, peer
            ))),
            BearerPolicy::Hang => {
                tokio::time::sleep(request.timeout).await;
                Err(BearerError::Timeout(request.timeout))
            }
        }
    }

    fn close_session(&self, session: SessionId) {
        self.mesh.lock().remove_session(session);
    }

    fn detach(&self, attach: &AttachHandle) {
        let mut state = self.mesh.lock();
        let attached = state
            .devices
            .get(&self.name)
            .is_some_and(|device| device.attach.as_ref() == Some(attach));
        if !attached {
            return;
        }

        let owned: Vec<SessionId> = state
            .sessions
            .iter()
            .filter(|(_, slot)| slot.device == self.name)
            .map(|(id, _)| *id)
            .collect();
        for session in owned {
            state.remove_session(session);
        }
        if let Some(device) = state.devices.get_mut(&self.name) {
            device.attach = None;
        }
        tracing::debug!("模拟网格: {} 已释放附着", self.name);
    }
}
