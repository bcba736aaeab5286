//! 发给前端的通知
//!
//! 注册表内容另外通过
//! [`ScanRegistry::subscribe`](crate::registry::ScanRegistry::subscribe) 监听。

use crate::ble::ScanError;
use crate::mds::MdsError;

#[derive(Debug, Clone, PartialEq)]
pub enum CoordinatorEvent {
    /// 扫描流失败，扫描会话已自行停止
    ScanFailed(ScanError),
    /// 连接失败，候选设备已恢复为已发现状态
    ConnectionFailed { address: String, error: MdsError },
    /// 会话已建立，为 `serial` 打开设备视图
    SessionReady { address: String, serial: String },
    /// 设备视图对应的会话已结束，需要关闭视图
    SessionEnded { serial: String },
    /// 每个新会话之后时钟写入的结果
    ClockSynced {
        serial: String,
        result: Result<(), MdsError>,
    },
}
