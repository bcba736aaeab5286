//! 设备时钟同步
//!
//! 把本机当前时间（Unix 纪元以来的微秒数）一次性 PUT 到设备的时间资源，
//! 不会重试。

use chrono::Utc;
use log::{error, info};
use serde_json::json;
use std::sync::Arc;

use crate::config::SyncSettings;
use crate::mds::{DeviceManagementService, MdsError};

#[derive(Clone)]
pub struct ClockSync {
    service: Arc<dyn DeviceManagementService>,
    scheme: String,
    resource: String,
}

impl ClockSync {
    pub fn new(service: Arc<dyn DeviceManagementService>, settings: &SyncSettings) -> Self {
        Self {
            service,
            scheme: settings.uri_scheme.clone(),
            resource: settings.time_resource.clone(),
        }
    }

    /// 把序列号为 `serial` 的设备时钟设为当前时间
    pub async fn sync(&self, serial: &str) -> Result<(), MdsError> {
        let path = crate::mds::resource_uri(&self.scheme, serial, &self.resource);
        let payload = json!({ "value": Utc::now().timestamp_micros() });

        match self.service.put(&path, payload).await {
            Ok(response) => {
                info!("PUT {} successful: {}", path, response);
                Ok(())
            }
            Err(e) => {
                error!("PUT {} returned error: {}", path, e);
                Err(e)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mds::LoopbackService;

    #[tokio::test]
    async fn test_sync_writes_microseconds() {
        let service = Arc::new(LoopbackService::new());
        let clock = ClockSync::new(service.clone(), &SyncSettings::default());

        let before = Utc::now().timestamp_micros();
        clock.sync("1234").await.unwrap();
        let after = Utc::now().timestamp_micros();

        let puts = service.puts();
        assert_eq!(puts.len(), 1);
        assert_eq!(puts[0].path, "suunto://1234/Time");
        let value = puts[0].payload["value"].as_i64().unwrap();
        assert!(before <= value && value <= after);
    }

    #[tokio::test]
    async fn test_sync_failure_is_reported() {
        let service = Arc::new(LoopbackService::new());
        service.fail_puts("device busy");
        let clock = ClockSync::new(service.clone(), &SyncSettings::default());

        let err = clock.sync("1234").await.unwrap_err();
        assert!(matches!(err, MdsError::Request { .. }));
        assert_eq!(service.puts().len(), 1);
    }
}
