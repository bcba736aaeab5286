//! 设备管理服务
//!
//! 服务负责与传感器之间的逻辑连接。每次 `connect` 都会为该次连接打开一个新的
//! 事件通道，服务按观察到的顺序在其上投递回调，连接结束后丢弃发送端。
//!
//! 已连接设备上的资源地址为 `{scheme}{serial}/{resource}`，
//! 例如 `suunto://174630000192/Time`。

pub mod loopback;

pub use loopback::LoopbackService;

use serde_json::Value;
use tokio::sync::mpsc;

/// 一次连接尝试的回调
#[derive(Debug, Clone, PartialEq)]
pub enum ConnectionEvent {
    /// 传输层链路已建立，握手仍在进行
    Connect { id: String },
    /// 握手完成，设备序列号为 `serial`
    ConnectionComplete { address: String, serial: String },
    Error(MdsError),
    Disconnect { address: String },
}

pub type ConnectionEvents = mpsc::UnboundedReceiver<ConnectionEvent>;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum MdsError {
    #[error("Connection failed: {0}")]
    Connection(String),

    #[error("Request to {path} failed: {message}")]
    Request { path: String, message: String },

    #[error("Device not connected: {0}")]
    NotConnected(String),
}

#[async_trait::async_trait]
pub trait DeviceManagementService: Send + Sync {
    /// 开始连接 `address`
    ///
    /// 返回错误表示请求未被接受；之后的失败以 [`ConnectionEvent::Error`] 送达。
    async fn connect(&self, address: &str) -> Result<ConnectionEvents, MdsError>;

    /// 请求服务断开 `address`
    ///
    /// 完成后在该次连接的通道上回报 [`ConnectionEvent::Disconnect`]。
    async fn disconnect(&self, address: &str) -> Result<(), MdsError>;

    /// 向 `path` 一次性写入 `payload`，返回响应内容
    async fn put(&self, path: &str, payload: Value) -> Result<String, MdsError>;
}

/// 构造序列号为 `serial` 的设备上的资源路径
pub fn resource_uri(scheme: &str, serial: &str, resource: &str) -> String {
    format!(
        "{}{}/{}",
        scheme,
        serial,
        resource.trim_start_matches('/')
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resource_uri() {
        assert_eq!(
            resource_uri("suunto://", "174630000192", "Time"),
            "suunto://174630000192/Time"
        );
        assert_eq!(
            resource_uri("suunto://", "1234", "/Info"),
            "suunto://1234/Info"
        );
    }
}
