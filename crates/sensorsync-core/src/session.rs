//! 扫描会话
//!
//! 一次发现过程的生命周期：先重置注册表，然后把实时扫描流中的每条结果写入
//! 注册表，直到停止。扫描流是无限的，出错或意外结束都会终止会话，并且只以
//! [`CoordinatorEvent::ScanFailed`] 报告一次；失败前发现的设备保留在注册表中。

use futures_util::StreamExt;
use log::{debug, error, info, warn};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::{RwLock, mpsc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::ble::{RadioScanner, ScanError, ScanFilterConfig, ScanStream};
use crate::events::CoordinatorEvent;
use crate::registry::ScanRegistry;

pub type SharedRegistry = Arc<RwLock<ScanRegistry>>;

struct ScanTask {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

pub struct ScanSession {
    scanner: Arc<dyn RadioScanner>,
    registry: SharedRegistry,
    filter: ScanFilterConfig,
    events: mpsc::UnboundedSender<CoordinatorEvent>,
    active: Arc<AtomicBool>,
    task: Option<ScanTask>,
}

impl ScanSession {
    pub fn new(
        scanner: Arc<dyn RadioScanner>,
        registry: SharedRegistry,
        filter: ScanFilterConfig,
        events: mpsc::UnboundedSender<CoordinatorEvent>,
    ) -> Self {
        Self {
            scanner,
            registry,
            filter,
            events,
            active: Arc::new(AtomicBool::new(false)),
            task: None,
        }
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }

    pub async fn start(&mut self) -> Result<(), ScanError> {
        if self.is_active() {
            return Err(ScanError::AlreadyScanning);
        }
        // 上一次扫描可能已自行结束，先回收
        if let Some(task) = self.task.take() {
            let _ = task.handle.await;
        }

        let stream = self.scanner.start_scan(&self.filter).await?;
        self.registry.write().await.reset();

        let cancel = CancellationToken::new();
        self.active.store(true, Ordering::SeqCst);
        let handle = tokio::spawn(run_scan(
            stream,
            self.scanner.clone(),
            self.registry.clone(),
            self.events.clone(),
            self.active.clone(),
            cancel.clone(),
        ));
        self.task = Some(ScanTask { cancel, handle });

        info!("Scan session started");
        Ok(())
    }

    /// 取消订阅；未在扫描时什么也不做
    pub async fn stop(&mut self) {
        let Some(task) = self.task.take() else {
            return;
        };
        task.cancel.cancel();
        if let Err(e) = task.handle.await {
            error!("Scan task finished with an unexpected join error: {:?}", e);
        }
        self.active.store(false, Ordering::SeqCst);
        info!("Scan session stopped");
    }
}

async fn run_scan(
    mut stream: ScanStream,
    scanner: Arc<dyn RadioScanner>,
    registry: SharedRegistry,
    events: mpsc::UnboundedSender<CoordinatorEvent>,
    active: Arc<AtomicBool>,
    cancel: CancellationToken,
) {
    let failure = loop {
        tokio::select! {
            () = cancel.cancelled() => {
                debug!("Scan subscription cancelled");
                break None;
            }
            item = stream.next() => match item {
                Some(Ok(observation)) => {
                    registry.write().await.upsert(observation);
                }
                Some(Err(e)) => {
                    warn!("Scan error: {}", e);
                    break Some(e);
                }
                None => {
                    warn!("Scan stream ended unexpectedly");
                    break Some(ScanError::Transport("scan stream ended".to_string()));
                }
            }
        }
    };

    drop(stream);
    if let Err(e) = scanner.cancel().await {
        warn!("Failed to release scanner: {}", e);
    }
    active.store(false, Ordering::SeqCst);

    if let Some(e) = failure {
        let _ = events.send(CoordinatorEvent::ScanFailed(e));
    }
}
