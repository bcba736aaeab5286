//! Sensorsync Core Library
//!
//! 通过 BLE 发现附近的传感器，经设备管理服务连接其中一台并设置其时钟
//!
//! # 模块
//!
//! - **registry**: 由扫描结果填充的去重候选设备列表
//! - **session**: 一次基于实时扫描流的发现过程
//! - **coordinator**: 单连接状态机
//! - **clock**: 会话建立后的时钟写入
//! - **ble**: 蓝牙扫描服务 (btleplug、回放)
//! - **mds**: 设备管理服务接口及本地回环实现
//!
//! # 使用示例
//!
//! ```ignore
//! use sensorsync_core::{BtleplugScanner, ConnectionCoordinator, CoordinatorEvent, SyncSettings};
//!
//! let settings = SyncSettings::load();
//! let (coordinator, mut events) =
//!     ConnectionCoordinator::new(&settings, Arc::new(BtleplugScanner::new()), service);
//!
//! coordinator.start_scan().await?;
//! // ... 用户从 coordinator.snapshot().await 中选择设备
//! coordinator.connect("AA:BB:CC:DD:EE:FF").await?;
//!
//! while let Some(event) = events.recv().await {
//!     if let CoordinatorEvent::SessionReady { serial, .. } = event {
//!         // 为 `serial` 打开设备视图
//!     }
//! }
//! ```

pub mod ble;
pub mod clock;
pub mod config;
pub mod coordinator;
pub mod events;
pub mod logging;
pub mod mds;
pub mod registry;
pub mod session;

pub use ble::{
    BtleplugScanner, RadioScanner, ReplayScanner, ScanError, ScanFilterConfig, ScanObservation,
};
pub use clock::ClockSync;
pub use config::SyncSettings;
pub use coordinator::{ConnectionCoordinator, ConnectionSession, CoordinatorError, RequestOutcome};
pub use events::CoordinatorEvent;
pub use logging::LogLevel;
pub use mds::{ConnectionEvent, DeviceManagementService, LoopbackService, MdsError};
pub use registry::{CandidateDevice, ConnectionState, ScanRegistry, UpsertOutcome};
pub use session::{ScanSession, SharedRegistry};
