//! 日志模块
//!
//! 核心库通过 `log` 门面输出日志；由二进制决定输出位置，并用 [`LogLevel`]
//! 生成默认过滤规则。

use serde::{Deserialize, Serialize};
use std::fmt;

/// 日志级别
///
/// 按 `Error < Warn < ... < Trace` 排序。
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Error,
    Warn,
    #[default]
    Info,
    Debug,
    Trace,
}

impl LogLevel {
    pub fn name(self) -> &'static str {
        match self {
            LogLevel::Error => "error",
            LogLevel::Warn => "warn",
            LogLevel::Info => "info",
            LogLevel::Debug => "debug",
            LogLevel::Trace => "trace",
        }
    }

    /// `EnvFilter` 风格的过滤指令
    ///
    /// 核心库总是比其余部分详细一级，最高为 `trace`。
    pub fn filter_directive(self) -> String {
        let core = match self {
            LogLevel::Error => LogLevel::Warn,
            LogLevel::Warn => LogLevel::Info,
            LogLevel::Info | LogLevel::Debug => LogLevel::Debug,
            LogLevel::Trace => LogLevel::Trace,
        };
        format!("{},sensorsync_core={}", self.name(), core.name())
    }
}

impl std::str::FromStr for LogLevel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "error" => Ok(LogLevel::Error),
            "warn" | "warning" => Ok(LogLevel::Warn),
            "info" => Ok(LogLevel::Info),
            "debug" => Ok(LogLevel::Debug),
            "trace" => Ok(LogLevel::Trace),
            other => Err(format!("unknown log level '{other}'")),
        }
    }
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}
