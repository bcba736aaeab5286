//! BLE Scanner - 通过 btleplug 使用本机适配器
//!
//! 第一个适配器在进程内只打开一次，由所有扫描器实例共享，这里不会关闭它。
//! 适配器事件流关闭时，扫描流以传输错误结束。

use btleplug::api::{Central, CentralEvent, Manager as _, Peripheral as _, ScanFilter};
use btleplug::platform::{Adapter, Manager, PeripheralId};
use futures_util::{StreamExt, stream};
use log::{debug, info, trace};
use tokio::sync::OnceCell;

use super::{RadioScanner, ScanError, ScanFilterConfig, ScanObservation, ScanStream};

static SHARED_ADAPTER: OnceCell<Adapter> = OnceCell::const_new();

async fn shared_adapter() -> Result<&'static Adapter, ScanError> {
    SHARED_ADAPTER
        .get_or_try_init(|| async {
            let manager = Manager::new().await?;
            let adapter = manager
                .adapters()
                .await?
                .into_iter()
                .next()
                .ok_or(ScanError::NoAdapter)?;
            info!(
                "Using Bluetooth adapter: {}",
                adapter.adapter_info().await.unwrap_or_default()
            );
            Ok(adapter)
        })
        .await
}

#[derive(Debug, Default, Clone, Copy)]
pub struct BtleplugScanner;

impl BtleplugScanner {
    pub fn new() -> Self {
        Self
    }

    async fn observe(
        adapter: &Adapter,
        id: &PeripheralId,
        min_rssi: Option<i16>,
    ) -> Result<Option<ScanObservation>, btleplug::Error> {
        let peripheral = adapter.peripheral(id).await?;
        let Some(props) = peripheral.properties().await? else {
            return Ok(None);
        };
        let (Some(name), Some(rssi)) = (props.local_name, props.rssi) else {
            trace!("Skipping {}: no name or signal reading", props.address);
            return Ok(None);
        };
        if min_rssi.is_some_and(|floor| rssi < floor) {
            trace!("Skipping {} ({}): rssi {} below floor", props.address, name, rssi);
            return Ok(None);
        }
        Ok(Some(ScanObservation::new(
            props.address.to_string(),
            name,
            rssi,
        )))
    }
}

#[async_trait::async_trait]
impl RadioScanner for BtleplugScanner {
    async fn start_scan(&self, filter: &ScanFilterConfig) -> Result<ScanStream, ScanError> {
        let adapter = shared_adapter().await?;
        let events = adapter.events().await?;
        adapter
            .start_scan(ScanFilter {
                services: filter.services.clone(),
            })
            .await?;
        info!(
            "BLE scan started ({} service filter(s))",
            filter.services.len()
        );

        let min_rssi = filter.min_rssi;
        let observations = events.filter_map(move |event| async move {
            let id = match event {
                CentralEvent::DeviceDiscovered(id) | CentralEvent::DeviceUpdated(id) => id,
                _ => return None,
            };
            match Self::observe(adapter, &id, min_rssi).await {
                Ok(observation) => observation.map(Ok),
                Err(e) => {
                    debug!("Failed to read properties of {:?}: {}", id, e);
                    None
                }
            }
        });
        let closed = stream::once(async {
            Err(ScanError::Transport(
                "adapter event stream closed".to_string(),
            ))
        });
        Ok(observations.chain(closed).boxed())
    }

    async fn cancel(&self) -> Result<(), ScanError> {
        if let Some(adapter) = SHARED_ADAPTER.get() {
            adapter.stop_scan().await?;
            info!("BLE scan stopped");
        }
        Ok(())
    }
}
