//! 子命令实现

use anyhow::{Context, Result, bail};
use sensorsync_core::{
    BtleplugScanner, CandidateDevice, ConnectionCoordinator, CoordinatorEvent, LoopbackService,
    RadioScanner, ReplayScanner, ScanRegistry, ScanSession, SyncSettings,
};
use std::collections::HashSet;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{RwLock, mpsc};

/// 演示等待扫描或服务的超时
const DEMO_TIMEOUT: Duration = Duration::from_secs(30);

fn scanner_for(replay: Option<&Path>) -> Result<Arc<dyn RadioScanner>> {
    Ok(match replay {
        Some(path) => Arc::new(
            ReplayScanner::from_file(path)
                .with_context(|| format!("failed to load {}", path.display()))?,
        ),
        None => Arc::new(BtleplugScanner::new()),
    })
}

fn print_device(device: &CandidateDevice) {
    println!(
        "   {} ({})  {} dBm  [{}]",
        device.display_name, device.address, device.signal_strength, device.connection_state
    );
}

/// 从广播名称中取出传感器序列号，例如 "Movesense 174630000192"
fn serial_from_name(name: &str, prefix: &str, address: &str) -> String {
    let serial = name.strip_prefix(prefix).unwrap_or(name).trim();
    if serial.is_empty() {
        address.replace(':', "")
    } else {
        serial.to_string()
    }
}

pub async fn scan(settings: &SyncSettings, duration: u64, replay: Option<&Path>) -> Result<()> {
    let registry = Arc::new(RwLock::new(ScanRegistry::new(settings.name_prefix.clone())));
    let (tx, mut rx) = mpsc::unbounded_channel();
    let mut session = ScanSession::new(
        scanner_for(replay)?,
        registry.clone(),
        settings.scan_filter(),
        tx,
    );
    let mut changes = registry.read().await.subscribe();

    println!("🔍 扫描 {} 设备 ({}s)...", settings.name_prefix, duration);
    session.start().await?;

    let deadline = tokio::time::sleep(Duration::from_secs(duration));
    tokio::pin!(deadline);
    let mut seen = HashSet::new();

    loop {
        tokio::select! {
            () = &mut deadline => break,
            _ = tokio::signal::ctrl_c() => break,
            Some(event) = rx.recv() => {
                if let CoordinatorEvent::ScanFailed(e) = event {
                    eprintln!("❌ 扫描失败: {e}");
                    break;
                }
            }
            changed = changes.changed() => {
                if changed.is_err() {
                    break;
                }
                let registry = registry.read().await;
                for device in registry.iter() {
                    if seen.insert(device.address.clone()) {
                        println!("   + {} ({})", device.display_name, device.address);
                    }
                }
            }
        }
    }
    session.stop().await;

    let registry = registry.read().await;
    if registry.is_empty() {
        println!("   未发现设备");
    } else {
        println!("发现 {} 个设备:", registry.len());
        for device in registry.iter() {
            print_device(device);
        }
    }
    Ok(())
}

async fn next_event(
    events: &mut mpsc::UnboundedReceiver<CoordinatorEvent>,
) -> Result<CoordinatorEvent> {
    tokio::time::timeout(DEMO_TIMEOUT, events.recv())
        .await
        .context("timed out waiting for the device-management service")?
        .context("coordinator stopped")
}

pub async fn demo(
    settings: &SyncSettings,
    replay: Option<&Path>,
    address: Option<String>,
    serial: Option<String>,
) -> Result<()> {
    let service = Arc::new(LoopbackService::automatic());
    let (coordinator, mut events) =
        ConnectionCoordinator::new(settings, scanner_for(replay)?, service.clone());

    println!("🔍 扫描中...");
    let mut changes = coordinator.subscribe_registry().await;
    coordinator.start_scan().await?;

    let target = loop {
        let found = coordinator.snapshot().await.into_iter().find(|device| {
            address
                .as_deref()
                .is_none_or(|wanted| wanted.eq_ignore_ascii_case(&device.address))
        });
        if let Some(device) = found {
            break device;
        }
        tokio::select! {
            changed = tokio::time::timeout(DEMO_TIMEOUT, changes.changed()) => {
                changed.context("no matching device discovered")??;
            }
            Some(event) = events.recv() => {
                if let CoordinatorEvent::ScanFailed(e) = event {
                    bail!("scan failed: {e}");
                }
            }
        }
    };
    print_device(&target);
    tracing::info!("Selected {} for the demo session", target.address);

    let serial = serial.unwrap_or_else(|| {
        serial_from_name(&target.display_name, &settings.name_prefix, &target.address)
    });
    service.add_device(&target.address, &serial);

    println!("🔗 正在连接 {}...", target.address);
    coordinator.connect(&target.address).await?;

    let mut ready = false;
    let mut synced = false;
    while !(ready && synced) {
        match next_event(&mut events).await? {
            CoordinatorEvent::SessionReady { serial, .. } => {
                println!("✅ 会话已建立: {serial}");
                ready = true;
            }
            CoordinatorEvent::ClockSynced { serial, result } => {
                match result {
                    Ok(()) => println!("🕒 已设置 {serial} 的时钟"),
                    Err(e) => println!("⚠️  {serial} 时钟同步失败: {e}"),
                }
                synced = true;
            }
            CoordinatorEvent::ConnectionFailed { error, .. } => {
                bail!("connection failed: {error}");
            }
            _ => {}
        }
    }

    println!("⏏️  正在断开...");
    coordinator.disconnect(&target.address).await?;
    loop {
        if let CoordinatorEvent::SessionEnded { serial } = next_event(&mut events).await? {
            println!("   会话 {serial} 已结束");
            break;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_serial_from_name() {
        assert_eq!(
            serial_from_name("Movesense 174630000192", "Movesense", "AA:BB"),
            "174630000192"
        );
        assert_eq!(
            serial_from_name("Movesense", "Movesense", "AA:BB:CC"),
            "AABBCC"
        );
    }
}
