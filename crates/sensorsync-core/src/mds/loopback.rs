//! 进程内的设备管理服务
//!
//! 维护一组已知设备（地址 -> 序列号），并为每个连接中的地址保留一个事件通道。
//! 自动模式下像正常服务一样响应请求；手动模式下所有回调都由调用方通过
//! [`LoopbackService::emit`] 注入。

use log::{debug, info};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};
use tokio::sync::mpsc;

use super::{ConnectionEvent, ConnectionEvents, DeviceManagementService, MdsError};
use crate::registry::normalize_address;

/// 通过 [`DeviceManagementService::put`] 收到的写入
#[derive(Debug, Clone, PartialEq)]
pub struct PutRecord {
    pub path: String,
    pub payload: Value,
}

#[derive(Debug, Default)]
struct LoopbackState {
    devices: HashMap<String, String>,
    links: HashMap<String, mpsc::UnboundedSender<ConnectionEvent>>,
    connects: Vec<String>,
    disconnects: Vec<String>,
    puts: Vec<PutRecord>,
    put_failure: Option<String>,
}

#[derive(Debug, Default)]
pub struct LoopbackService {
    state: Mutex<LoopbackState>,
    automatic: bool,
}

impl LoopbackService {
    /// 回调由调用方注入的服务
    pub fn new() -> Self {
        Self::default()
    }

    /// 自动完成握手和断开的服务
    pub fn automatic() -> Self {
        Self {
            automatic: true,
            ..Self::default()
        }
    }

    fn state(&self) -> MutexGuard<'_, LoopbackState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// 注册一个连接后以 `serial` 应答的设备
    #[must_use]
    pub fn with_device(self, address: &str, serial: &str) -> Self {
        self.add_device(address, serial);
        self
    }

    pub fn add_device(&self, address: &str, serial: &str) {
        self.state()
            .devices
            .insert(normalize_address(address), serial.to_string());
    }

    /// 之后的每次 `put` 都以 `message` 失败
    pub fn fail_puts(&self, message: impl Into<String>) {
        self.state().put_failure = Some(message.into());
    }

    /// 在 `address` 的事件通道上发送 `event`
    ///
    /// 没有打开的通道或无人监听时返回 `false`。
    pub fn emit(&self, address: &str, event: ConnectionEvent) -> bool {
        let state = self.state();
        state
            .links
            .get(&normalize_address(address))
            .is_some_and(|tx| tx.send(event).is_ok())
    }

    /// 丢弃 `address` 的事件通道以结束该次连接
    pub fn close(&self, address: &str) {
        self.state().links.remove(&normalize_address(address));
    }

    pub fn connect_requests(&self) -> Vec<String> {
        self.state().connects.clone()
    }

    pub fn disconnect_requests(&self) -> Vec<String> {
        self.state().disconnects.clone()
    }

    pub fn puts(&self) -> Vec<PutRecord> {
        self.state().puts.clone()
    }
}

#[async_trait::async_trait]
impl DeviceManagementService for LoopbackService {
    async fn connect(&self, address: &str) -> Result<ConnectionEvents, MdsError> {
        let address = normalize_address(address);
        let (tx, rx) = mpsc::unbounded_channel();
        let mut state = self.state();
        state.connects.push(address.clone());

        if self.automatic {
            match state.devices.get(&address) {
                Some(serial) => {
                    info!("Loopback: {} connected as {}", address, serial);
                    let _ = tx.send(ConnectionEvent::Connect {
                        id: address.clone(),
                    });
                    let _ = tx.send(ConnectionEvent::ConnectionComplete {
                        address: address.clone(),
                        serial: serial.clone(),
                    });
                }
                None => {
                    let _ = tx.send(ConnectionEvent::Error(MdsError::Connection(format!(
                        "no device at {address}"
                    ))));
                    return Ok(rx);
                }
            }
        }

        state.links.insert(address, tx);
        Ok(rx)
    }

    async fn disconnect(&self, address: &str) -> Result<(), MdsError> {
        let address = normalize_address(address);
        let mut state = self.state();
        state.disconnects.push(address.clone());

        if !state.links.contains_key(&address) {
            return Err(MdsError::NotConnected(address));
        }
        if self.automatic
            && let Some(tx) = state.links.remove(&address)
        {
            debug!("Loopback: {} disconnected", address);
            let _ = tx.send(ConnectionEvent::Disconnect { address });
        }
        Ok(())
    }

    async fn put(&self, path: &str, payload: Value) -> Result<String, MdsError> {
        let mut state = self.state();
        debug!("Loopback: PUT {} {}", path, payload);
        state.puts.push(PutRecord {
            path: path.to_string(),
            payload,
        });
        match &state.put_failure {
            Some(message) => Err(MdsError::Request {
                path: path.to_string(),
                message: message.clone(),
            }),
            None => Ok("{}".to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_automatic_handshake() {
        let service = LoopbackService::automatic().with_device("aa:bb:cc:dd:ee:ff", "1234");

        let mut events = service.connect("AA:BB:CC:DD:EE:FF").await.unwrap();
        assert_eq!(
            events.recv().await,
            Some(ConnectionEvent::Connect {
                id: "AA:BB:CC:DD:EE:FF".to_string()
            })
        );
        assert_eq!(
            events.recv().await,
            Some(ConnectionEvent::ConnectionComplete {
                address: "AA:BB:CC:DD:EE:FF".to_string(),
                serial: "1234".to_string()
            })
        );

        service.disconnect("AA:BB:CC:DD:EE:FF").await.unwrap();
        assert_eq!(
            events.recv().await,
            Some(ConnectionEvent::Disconnect {
                address: "AA:BB:CC:DD:EE:FF".to_string()
            })
        );
        assert_eq!(events.recv().await, None);
    }

    #[tokio::test]
    async fn test_unknown_device_fails_attempt() {
        let service = LoopbackService::automatic();
        let mut events = service.connect("AA:00:00:00:00:01").await.unwrap();

        assert!(matches!(
            events.recv().await,
            Some(ConnectionEvent::Error(MdsError::Connection(_)))
        ));
        assert_eq!(events.recv().await, None);
    }

    #[tokio::test]
    async fn test_disconnect_without_link() {
        let service = LoopbackService::new();
        assert_eq!(
            service.disconnect("AA:00:00:00:00:01").await,
            Err(MdsError::NotConnected("AA:00:00:00:00:01".to_string()))
        );
    }

    #[tokio::test]
    async fn test_put_failure() {
        let service = LoopbackService::new();
        service.fail_puts("busy");

        let result = service
            .put("suunto://1/Time", serde_json::json!({"value": 1}))
            .await;
        assert!(matches!(result, Err(MdsError::Request { .. })));
        assert_eq!(service.puts().len(), 1);
    }
}
