//! 蓝牙扫描服务
//!
//! 核心通过 [`RadioScanner`] 获取扫描结果：启动扫描后得到一个实时结果流，
//! 丢弃该流即取消订阅。
//!
//! - [`BtleplugScanner`]: 通过 btleplug 使用本机蓝牙适配器
//! - [`ReplayScanner`]: 回放录制的扫描结果

pub mod replay;
pub mod scanner;

pub use replay::ReplayScanner;
pub use scanner::BtleplugScanner;

use chrono::{DateTime, Utc};
use futures_util::stream::BoxStream;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// 一次扫描到的设备
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScanObservation {
    pub address: String,
    pub display_name: String,
    pub signal_strength: i16,
    #[serde(default = "Utc::now")]
    pub timestamp: DateTime<Utc>,
}

impl ScanObservation {
    pub fn new(address: impl Into<String>, display_name: impl Into<String>, rssi: i16) -> Self {
        Self {
            address: address.into(),
            display_name: display_name.into(),
            signal_strength: rssi,
            timestamp: Utc::now(),
        }
    }
}

/// 传给 [`RadioScanner::start_scan`] 的扫描过滤条件
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ScanFilterConfig {
    pub services: Vec<Uuid>,
    pub min_rssi: Option<i16>,
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ScanError {
    #[error("A scan session is already active")]
    AlreadyScanning,

    #[error("No Bluetooth adapters found")]
    NoAdapter,

    #[error("Scan transport error: {0}")]
    Transport(String),
}

impl From<btleplug::Error> for ScanError {
    fn from(e: btleplug::Error) -> Self {
        ScanError::Transport(e.to_string())
    }
}

/// 实时扫描订阅，`Err` 项表示扫描流失败
pub type ScanStream = BoxStream<'static, Result<ScanObservation, ScanError>>;

#[async_trait::async_trait]
pub trait RadioScanner: Send + Sync {
    async fn start_scan(&self, filter: &ScanFilterConfig) -> Result<ScanStream, ScanError>;

    /// 释放上一次订阅占用的适配器资源
    ///
    /// 在扫描流被丢弃之后调用。
    async fn cancel(&self) -> Result<(), ScanError> {
        Ok(())
    }
}
