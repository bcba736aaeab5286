//! 应用配置和持久化
//!
//! 提供厂商名称过滤、设备资源地址和扫描过滤等设置，以 TOML 保存在用户配置目录。

use log::{debug, warn};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use uuid::Uuid;

use crate::ble::ScanFilterConfig;
use crate::logging::LogLevel;
use crate::mds;

/// 支持的传感器广播名称前缀
pub const DEFAULT_NAME_PREFIX: &str = "Movesense";
/// 设备管理服务的 URI scheme
pub const DEFAULT_URI_SCHEME: &str = "suunto://";
/// 设置设备时钟的资源
pub const DEFAULT_TIME_RESOURCE: &str = "Time";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncSettings {
    /// 广播名称不以此开头的设备会被忽略
    pub name_prefix: String,
    /// 资源路径的 scheme 前缀，包含 `://`
    pub uri_scheme: String,
    /// 时钟资源，地址为 `{scheme}{serial}/{resource}`
    pub time_resource: String,
    /// 信号弱于此值 (dBm) 的扫描结果会被丢弃
    pub min_rssi: Option<i16>,
    /// 只扫描广播这些服务的设备
    pub service_uuids: Vec<Uuid>,
    pub log_level: LogLevel,
}

impl Default for SyncSettings {
    fn default() -> Self {
        Self {
            name_prefix: DEFAULT_NAME_PREFIX.to_string(),
            uri_scheme: DEFAULT_URI_SCHEME.to_string(),
            time_resource: DEFAULT_TIME_RESOURCE.to_string(),
            min_rssi: None,
            service_uuids: Vec::new(),
            log_level: LogLevel::default(),
        }
    }
}

impl SyncSettings {
    /// 默认的设置文件路径
    pub fn config_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("sensorsync")
            .join("settings.toml")
    }

    /// 从默认路径加载，失败时使用默认值
    pub fn load() -> Self {
        Self::load_from(&Self::config_path())
    }

    /// 从 `path` 加载；文件缺失或损坏时使用默认值
    pub fn load_from(path: &Path) -> Self {
        if !path.exists() {
            return Self::default();
        }
        match fs::read_to_string(path) {
            Ok(content) => match toml::from_str(&content) {
                Ok(settings) => {
                    debug!("Loaded settings from {:?}", path);
                    return settings;
                }
                Err(e) => warn!("Failed to parse settings: {}, using defaults", e),
            },
            Err(e) => warn!("Failed to read settings file: {}, using defaults", e),
        }
        Self::default()
    }

    pub fn save(&self) -> anyhow::Result<()> {
        self.save_to(&Self::config_path())
    }

    pub fn save_to(&self, path: &Path) -> anyhow::Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let content = toml::to_string_pretty(self)?;
        fs::write(path, content)?;
        debug!("Saved settings to {:?}", path);
        Ok(())
    }

    /// 序列号为 `serial` 的设备的时钟资源路径
    pub fn time_uri(&self, serial: &str) -> String {
        mds::resource_uri(&self.uri_scheme, serial, &self.time_resource)
    }

    /// 交给扫描服务的过滤条件
    pub fn scan_filter(&self) -> ScanFilterConfig {
        ScanFilterConfig {
            services: self.service_uuids.clone(),
            min_rssi: self.min_rssi,
        }
    }
}
