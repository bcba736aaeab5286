//! 回放录制的扫描结果
//!
//! 按顺序发出全部录制结果，之后像一个没有新设备的实时订阅一样保持打开，
//! 除非指定了失败或结束。

use futures_util::StreamExt;
use futures_util::stream;
use log::info;
use std::path::Path;

use super::{RadioScanner, ScanError, ScanFilterConfig, ScanObservation, ScanStream};

#[derive(Debug, Clone, Default)]
pub struct ReplayScanner {
    observations: Vec<ScanObservation>,
    failure: Option<String>,
    finite: bool,
}

impl ReplayScanner {
    pub fn new(observations: Vec<ScanObservation>) -> Self {
        Self {
            observations,
            failure: None,
            finite: false,
        }
    }

    /// 从 JSON 数组加载录制结果
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let observations: Vec<ScanObservation> = serde_json::from_str(&content)?;
        info!(
            "Loaded {} recorded observation(s) from {:?}",
            observations.len(),
            path
        );
        Ok(Self::new(observations))
    }

    /// 回放结束后以传输错误终止扫描流
    #[must_use]
    pub fn with_failure(mut self, message: impl Into<String>) -> Self {
        self.failure = Some(message.into());
        self
    }

    /// 回放结束后直接关闭扫描流
    #[must_use]
    pub fn finite(mut self) -> Self {
        self.finite = true;
        self
    }
}

#[async_trait::async_trait]
impl RadioScanner for ReplayScanner {
    async fn start_scan(&self, filter: &ScanFilterConfig) -> Result<ScanStream, ScanError> {
        let min_rssi = filter.min_rssi;
        let recorded = self
            .observations
            .clone()
            .into_iter()
            .filter(move |o| min_rssi.is_none_or(|floor| o.signal_strength >= floor))
            .map(Ok);
        let replay = tokio_stream::iter(recorded);

        Ok(match self.failure.clone() {
            Some(message) => replay
                .chain(stream::once(async move { Err(ScanError::Transport(message)) }))
                .boxed(),
            None if self.finite => replay.boxed(),
            None => replay.chain(stream::pending()).boxed(),
        })
    }
}
