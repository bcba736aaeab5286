//! 连接协调器
//!
//! 负责每个设备的连接状态机，并保证同一时间只有一个设备处于连接中或已连接：
//!
//! ```text
//! Discovered -> Connecting -> Connected(serial) -> Discovered
//!                    |                                  ^
//!                    +---------- error -----------------+
//! ```
//!
//! `connect` 把候选设备置为 `Connecting` 并把请求交给设备管理服务，之后的
//! 状态变化全部由服务回调驱动，每次连接尝试由一个任务按到达顺序处理。
//! `disconnect` 只发出请求，状态在服务回报断开后才改变。
//!
//! 活动连接槽位以内部的会话簿为准：即使重新扫描清空了注册表，
//! 正在握手的地址和已建立的会话仍然记录在这里。

use chrono::{DateTime, Utc};
use log::{debug, info, warn};
use serde::Serialize;
use std::collections::HashSet;
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock, mpsc, watch};

use crate::ble::{RadioScanner, ScanError};
use crate::clock::ClockSync;
use crate::config::SyncSettings;
use crate::events::CoordinatorEvent;
use crate::mds::{ConnectionEvent, ConnectionEvents, DeviceManagementService, MdsError};
use crate::registry::{CandidateDevice, ConnectionState, ScanRegistry, normalize_address};
use crate::session::{ScanSession, SharedRegistry};

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum CoordinatorError {
    #[error("Cannot connect to {address} while it is {state}")]
    InvalidStateTransition {
        address: String,
        state: ConnectionState,
    },

    #[error("Another device ({active}) is already connecting or connected")]
    Busy { active: String },

    #[error(transparent)]
    Service(#[from] MdsError),
}

/// 以地址指定设备的请求结果
#[must_use]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestOutcome {
    /// 请求已交给设备管理服务
    Issued,
    /// 没有该候选设备，什么也没做
    UnknownDevice,
}

/// 已建立的逻辑连接
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionSession {
    pub mac_address: String,
    pub device_serial: String,
    pub started_at: DateTime<Utc>,
}

#[derive(Debug, Default)]
struct SessionBook {
    /// 已发出连接请求、尚未完成握手的地址
    pending: Option<String>,
    active: Option<ConnectionSession>,
    /// 已打开且尚未关闭设备视图的序列号
    open_views: HashSet<String>,
}

impl SessionBook {
    /// 占用活动连接槽位的地址
    fn occupant(&self) -> Option<&str> {
        self.active
            .as_ref()
            .map(|session| session.mac_address.as_str())
            .or(self.pending.as_deref())
    }

    /// 结束 `address`（或序列号为 `serial`）的会话及其设备视图
    ///
    /// 返回需要关闭视图的序列号。
    fn end(&mut self, address: &str, serial: Option<&str>) -> Option<String> {
        if self.pending.as_deref() == Some(address) {
            self.pending = None;
        }
        let matches = self.active.as_ref().is_some_and(|session| {
            session.mac_address == address || Some(session.device_serial.as_str()) == serial
        });
        let ended = if matches { self.active.take() } else { None };

        let serial = serial
            .map(str::to_string)
            .or_else(|| ended.map(|session| session.device_serial))?;
        self.open_views.remove(&serial).then_some(serial)
    }
}

struct Inner {
    registry: SharedRegistry,
    scan: Mutex<ScanSession>,
    service: Arc<dyn DeviceManagementService>,
    clock: ClockSync,
    sessions: Mutex<SessionBook>,
    events: mpsc::UnboundedSender<CoordinatorEvent>,
}

#[derive(Clone)]
pub struct ConnectionCoordinator {
    inner: Arc<Inner>,
}

impl ConnectionCoordinator {
    pub fn new(
        settings: &SyncSettings,
        scanner: Arc<dyn RadioScanner>,
        service: Arc<dyn DeviceManagementService>,
    ) -> (Self, mpsc::UnboundedReceiver<CoordinatorEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let registry = Arc::new(RwLock::new(ScanRegistry::new(settings.name_prefix.clone())));
        let scan = ScanSession::new(scanner, registry.clone(), settings.scan_filter(), tx.clone());

        let inner = Inner {
            registry,
            scan: Mutex::new(scan),
            clock: ClockSync::new(service.clone(), settings),
            service,
            sessions: Mutex::new(SessionBook::default()),
            events: tx,
        };
        (
            Self {
                inner: Arc::new(inner),
            },
            rx,
        )
    }

    pub fn registry(&self) -> SharedRegistry {
        self.inner.registry.clone()
    }

    pub async fn subscribe_registry(&self) -> watch::Receiver<u64> {
        self.inner.registry.read().await.subscribe()
    }

    /// 按显示顺序返回候选设备
    pub async fn snapshot(&self) -> Vec<CandidateDevice> {
        self.inner.registry.read().await.snapshot()
    }

    pub async fn candidate(&self, address: &str) -> Option<CandidateDevice> {
        self.inner.registry.read().await.find(address).cloned()
    }

    pub async fn start_scan(&self) -> Result<(), ScanError> {
        self.inner.scan.lock().await.start().await
    }

    pub async fn stop_scan(&self) {
        self.inner.scan.lock().await.stop().await;
    }

    pub async fn is_scanning(&self) -> bool {
        self.inner.scan.lock().await.is_active()
    }

    pub async fn active_session(&self) -> Option<ConnectionSession> {
        self.inner.sessions.lock().await.active.clone()
    }

    pub async fn is_view_open(&self, serial: &str) -> bool {
        self.inner.sessions.lock().await.open_views.contains(serial)
    }

    /// 前端关闭了 `serial` 的设备视图
    pub async fn view_closed(&self, serial: &str) {
        if self.inner.sessions.lock().await.open_views.remove(serial) {
            debug!("Device view for {} closed", serial);
        }
    }

    /// 连接一个已发现的候选设备
    ///
    /// 先停止正在进行的扫描。连接结果以
    /// [`CoordinatorEvent::SessionReady`] 或
    /// [`CoordinatorEvent::ConnectionFailed`] 的形式送达。
    pub async fn connect(&self, address: &str) -> Result<RequestOutcome, CoordinatorError> {
        let address = normalize_address(address);
        {
            let mut registry = self.inner.registry.write().await;
            let mut sessions = self.inner.sessions.lock().await;

            let Some(candidate) = registry.find(&address) else {
                debug!("Connect request for unknown device {}", address);
                return Ok(RequestOutcome::UnknownDevice);
            };
            if candidate.connection_state != ConnectionState::Discovered {
                return Err(CoordinatorError::InvalidStateTransition {
                    address,
                    state: candidate.connection_state.clone(),
                });
            }
            let occupant = sessions
                .occupant()
                .or_else(|| registry.active().map(|device| device.address.as_str()));
            if let Some(active) = occupant {
                return Err(CoordinatorError::Busy {
                    active: active.to_string(),
                });
            }
            sessions.pending = Some(address.clone());
            registry.mark_connecting(&address);
        }

        self.stop_scan().await;

        info!("Connecting to {}", address);
        let events = match self.inner.service.connect(&address).await {
            Ok(events) => events,
            Err(e) => {
                warn!("Connect request for {} rejected: {}", address, e);
                self.release(&address).await;
                return Err(e.into());
            }
        };

        tokio::spawn(self.clone().follow_attempt(address, events));
        Ok(RequestOutcome::Issued)
    }

    /// 请求设备管理服务断开 `address`
    ///
    /// 在服务回报断开之前，候选设备保持原状态。
    pub async fn disconnect(&self, address: &str) -> Result<RequestOutcome, CoordinatorError> {
        let address = normalize_address(address);
        if self.inner.registry.read().await.find(&address).is_none() {
            debug!("Disconnect request for unknown device {}", address);
            return Ok(RequestOutcome::UnknownDevice);
        }

        info!("Disconnecting from {}", address);
        self.inner.service.disconnect(&address).await?;
        Ok(RequestOutcome::Issued)
    }

    async fn follow_attempt(self, address: String, mut events: ConnectionEvents) {
        while let Some(event) = events.recv().await {
            self.handle_event(&address, event).await;
        }
        debug!("Connection attempt for {} has no more events", address);
    }

    async fn handle_event(&self, attempt: &str, event: ConnectionEvent) {
        match event {
            ConnectionEvent::Connect { id } => {
                debug!("{}: link up (id {})", attempt, id);
            }
            ConnectionEvent::ConnectionComplete { address, serial } => {
                let address = normalize_address(&address);
                if address == attempt {
                    self.on_connection_complete(&address, serial).await;
                } else {
                    warn!(
                        "Ignoring handshake completion for {} on the attempt for {}",
                        address, attempt
                    );
                }
            }
            ConnectionEvent::Error(error) => self.on_error(attempt, error).await,
            ConnectionEvent::Disconnect { address } => {
                self.on_disconnect(&normalize_address(&address)).await;
            }
        }
    }

    async fn on_connection_complete(&self, address: &str, serial: String) {
        {
            let mut registry = self.inner.registry.write().await;
            let mut sessions = self.inner.sessions.lock().await;

            if sessions
                .active
                .as_ref()
                .is_some_and(|session| session.mac_address == address)
            {
                debug!("Duplicate handshake completion for {}, ignoring", address);
                return;
            }
            if sessions.pending.as_deref() != Some(address) {
                warn!(
                    "Ignoring handshake completion for {}: no attempt in flight",
                    address
                );
                return;
            }

            sessions.pending = None;
            registry.mark_connected(address, &serial);
            sessions.active = Some(ConnectionSession {
                mac_address: address.to_string(),
                device_serial: serial.clone(),
                started_at: Utc::now(),
            });
            sessions.open_views.insert(serial.clone());
        }
        info!("Session established with {} (serial {})", address, serial);

        let _ = self.inner.events.send(CoordinatorEvent::SessionReady {
            address: address.to_string(),
            serial: serial.clone(),
        });

        let clock = self.inner.clock.clone();
        let events = self.inner.events.clone();
        tokio::spawn(async move {
            let result = clock.sync(&serial).await;
            let _ = events.send(CoordinatorEvent::ClockSynced { serial, result });
        });
    }

    async fn on_error(&self, address: &str, error: MdsError) {
        warn!("Connection to {} failed: {}", address, error);
        let closed_view = self.release(address).await;

        if let Some(serial) = closed_view {
            let _ = self.inner.events.send(CoordinatorEvent::SessionEnded { serial });
        }
        let _ = self.inner.events.send(CoordinatorEvent::ConnectionFailed {
            address: address.to_string(),
            error,
        });
    }

    async fn on_disconnect(&self, address: &str) {
        info!("Disconnected from {}", address);
        if let Some(serial) = self.release(address).await {
            info!("Closing device view for {}", serial);
            let _ = self.inner.events.send(CoordinatorEvent::SessionEnded { serial });
        }
    }

    /// 把 `address` 恢复为 `Discovered` 并结束其会话
    ///
    /// 返回需要关闭的设备视图的序列号。
    async fn release(&self, address: &str) -> Option<String> {
        let mut registry = self.inner.registry.write().await;
        let mut sessions = self.inner.sessions.lock().await;

        let previous = registry.mark_disconnected(address);
        let serial = previous.as_ref().and_then(ConnectionState::serial);
        sessions.end(address, serial)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn connected_book(address: &str, serial: &str) -> SessionBook {
        let mut book = SessionBook::default();
        book.active = Some(ConnectionSession {
            mac_address: address.to_string(),
            device_serial: serial.to_string(),
            started_at: Utc::now(),
        });
        book
    }

    #[test]
    fn test_session_book_end_by_address() {
        let mut book = connected_book("AA:00:00:00:00:01", "1234");
        book.open_views.insert("1234".to_string());

        assert_eq!(book.end("AA:00:00:00:00:01", None), Some("1234".to_string()));
        assert!(book.active.is_none());
        assert!(book.open_views.is_empty());
    }

    #[test]
    fn test_session_book_keeps_other_session() {
        let mut book = connected_book("AA:00:00:00:00:01", "1234");

        assert_eq!(book.end("AA:00:00:00:00:02", Some("9999")), None);
        assert!(book.active.is_some());
    }

    #[test]
    fn test_session_book_closed_view_not_reported() {
        let mut book = connected_book("AA:00:00:00:00:01", "1234");

        assert_eq!(book.end("AA:00:00:00:00:01", Some("1234")), None);
        assert!(book.active.is_none());
    }

    #[test]
    fn test_session_book_occupant() {
        let mut book = SessionBook::default();
        assert_eq!(book.occupant(), None);

        book.pending = Some("AA:00:00:00:00:01".to_string());
        assert_eq!(book.occupant(), Some("AA:00:00:00:00:01"));

        // 握手失败后释放槽位
        assert_eq!(book.end("AA:00:00:00:00:01", None), None);
        assert_eq!(book.occupant(), None);

        let book = connected_book("AA:00:00:00:00:02", "1234");
        assert_eq!(book.occupant(), Some("AA:00:00:00:00:02"));
    }
}
