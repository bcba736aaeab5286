//! 候选设备注册表
//!
//! 按地址去重的有序设备列表。新地址插入到最前面，重复发现只原地更新名称、
//! 信号强度和时间。连接状态只能通过 `mark_*` 修改，扫描结果永远不会覆盖它。
//!
//! 每次变更都会递增一个代数计数器，可通过 [`ScanRegistry::subscribe`] 监听，
//! 便于前端重新渲染。

use chrono::{DateTime, Utc};
use log::{debug, trace};
use serde::Serialize;
use std::collections::{HashMap, VecDeque};
use std::fmt;
use tokio::sync::watch;

use crate::ble::ScanObservation;

/// 注册表的键统一为大写，`aa:bb:..` 与 `AA:BB:..` 视为同一设备
pub fn normalize_address(address: &str) -> String {
    address.trim().to_ascii_uppercase()
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state", content = "serial", rename_all = "camelCase")]
pub enum ConnectionState {
    Discovered,
    Connecting,
    Connected(String),
    /// 保留状态，协调器不会进入
    ///
    /// 断开请求不改变状态，直到服务回报 `Disconnect` 后才回到 `Discovered`。
    Disconnecting,
}

impl ConnectionState {
    /// 是否占用唯一的活动连接槽位
    pub fn is_active(&self) -> bool {
        matches!(self, ConnectionState::Connecting | ConnectionState::Connected(_))
    }

    pub fn serial(&self) -> Option<&str> {
        match self {
            ConnectionState::Connected(serial) => Some(serial),
            _ => None,
        }
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionState::Discovered => f.write_str("discovered"),
            ConnectionState::Connecting => f.write_str("connecting"),
            ConnectionState::Connected(serial) => write!(f, "connected ({serial})"),
            ConnectionState::Disconnecting => f.write_str("disconnecting"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CandidateDevice {
    pub address: String,
    pub display_name: String,
    pub signal_strength: i16,
    pub last_seen: DateTime<Utc>,
    pub connection_state: ConnectionState,
}

impl CandidateDevice {
    fn from_observation(address: String, observation: ScanObservation) -> Self {
        Self {
            address,
            display_name: observation.display_name,
            signal_strength: observation.signal_strength,
            last_seen: observation.timestamp,
            connection_state: ConnectionState::Discovered,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpsertOutcome {
    Inserted,
    Updated,
    /// 名称前缀不匹配
    Rejected,
}

#[derive(Debug)]
pub struct ScanRegistry {
    name_prefix: String,
    devices: HashMap<String, CandidateDevice>,
    /// 地址列表，最新发现的在前
    order: VecDeque<String>,
    changes: watch::Sender<u64>,
}

impl ScanRegistry {
    pub fn new(name_prefix: impl Into<String>) -> Self {
        let (changes, _) = watch::channel(0);
        Self {
            name_prefix: name_prefix.into(),
            devices: HashMap::new(),
            order: VecDeque::new(),
            changes,
        }
    }

    /// 每次变更后都会收到新代数的接收端
    pub fn subscribe(&self) -> watch::Receiver<u64> {
        self.changes.subscribe()
    }

    fn notify(&self) {
        self.changes.send_modify(|generation| *generation += 1);
    }

    /// 清空注册表
    ///
    /// 正在连接或已连接的设备保留，其状态由协调器负责。
    pub fn reset(&mut self) {
        self.devices
            .retain(|_, device| device.connection_state.is_active());
        let devices = &self.devices;
        self.order.retain(|address| devices.contains_key(address));
        debug!("Registry cleared ({} active device(s) kept)", self.devices.len());
        self.notify();
    }

    pub fn upsert(&mut self, observation: ScanObservation) -> UpsertOutcome {
        if !observation.display_name.starts_with(&self.name_prefix) {
            trace!(
                "Ignoring {} ('{}'): not a {} device",
                observation.address, observation.display_name, self.name_prefix
            );
            return UpsertOutcome::Rejected;
        }

        let address = normalize_address(&observation.address);
        let outcome = if let Some(existing) = self.devices.get_mut(&address) {
            existing.display_name = observation.display_name;
            existing.signal_strength = observation.signal_strength;
            existing.last_seen = observation.timestamp;
            UpsertOutcome::Updated
        } else {
            debug!(
                "Discovered {} ('{}', rssi={})",
                address, observation.display_name, observation.signal_strength
            );
            self.order.push_front(address.clone());
            self.devices.insert(
                address.clone(),
                CandidateDevice::from_observation(address, observation),
            );
            UpsertOutcome::Inserted
        };
        self.notify();
        outcome
    }

    /// 设置 `address` 的连接状态
    ///
    /// 返回之前的状态；地址未知时返回 `None`。
    pub fn set_state(&mut self, address: &str, state: ConnectionState) -> Option<ConnectionState> {
        let device = self.devices.get_mut(&normalize_address(address))?;
        let previous = std::mem::replace(&mut device.connection_state, state);
        if previous != device.connection_state {
            debug!(
                "{}: {} -> {}",
                device.address, previous, device.connection_state
            );
            self.notify();
        }
        Some(previous)
    }

    pub fn mark_connecting(&mut self, address: &str) -> Option<ConnectionState> {
        self.set_state(address, ConnectionState::Connecting)
    }

    pub fn mark_connected(&mut self, address: &str, serial: &str) -> Option<ConnectionState> {
        self.set_state(address, ConnectionState::Connected(serial.to_string()))
    }

    pub fn mark_disconnected(&mut self, address: &str) -> Option<ConnectionState> {
        self.set_state(address, ConnectionState::Discovered)
    }

    pub fn find(&self, address: &str) -> Option<&CandidateDevice> {
        self.devices.get(&normalize_address(address))
    }

    /// 占用活动连接槽位的设备
    pub fn active(&self) -> Option<&CandidateDevice> {
        self.devices
            .values()
            .find(|device| device.connection_state.is_active())
    }

    /// 按显示顺序遍历
    pub fn iter(&self) -> impl Iterator<Item = &CandidateDevice> {
        self.order.iter().filter_map(|address| self.devices.get(address))
    }

    pub fn snapshot(&self) -> Vec<CandidateDevice> {
        self.iter().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.devices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sighting(address: &str, name: &str, rssi: i16) -> ScanObservation {
        ScanObservation::new(address, name, rssi)
    }

    fn addresses(registry: &ScanRegistry) -> Vec<String> {
        registry.iter().map(|d| d.address.clone()).collect()
    }

    #[test]
    fn test_new_devices_go_first() {
        let mut registry = ScanRegistry::new("Movesense");
        registry.upsert(sighting("AA:00:00:00:00:01", "Movesense 1", -60));
        registry.upsert(sighting("AA:00:00:00:00:02", "Movesense 2", -60));
        registry.upsert(sighting("AA:00:00:00:00:03", "Movesense 3", -60));

        assert_eq!(
            addresses(&registry),
            ["AA:00:00:00:00:03", "AA:00:00:00:00:02", "AA:00:00:00:00:01"]
        );
    }

    #[test]
    fn test_repeated_sighting_updates_in_place() {
        let mut registry = ScanRegistry::new("Movesense");
        registry.upsert(sighting("AA:00:00:00:00:01", "Movesense 1", -60));
        registry.upsert(sighting("AA:00:00:00:00:02", "Movesense 2", -60));

        let outcome = registry.upsert(sighting("aa:00:00:00:00:01", "Movesense 1b", -42));

        assert_eq!(outcome, UpsertOutcome::Updated);
        assert_eq!(registry.len(), 2);
        assert_eq!(
            addresses(&registry),
            ["AA:00:00:00:00:02", "AA:00:00:00:00:01"]
        );
        let device = registry.find("AA:00:00:00:00:01").unwrap();
        assert_eq!(device.display_name, "Movesense 1b");
        assert_eq!(device.signal_strength, -42);
    }

    #[test]
    fn test_vendor_prefix_filter() {
        let mut registry = ScanRegistry::new("Movesense");
        assert_eq!(
            registry.upsert(sighting("AA:00:00:00:00:01", "OtherSensor", -40)),
            UpsertOutcome::Rejected
        );
        assert_eq!(
            registry.upsert(sighting("AA:00:00:00:00:02", "MovesenseABCD", -40)),
            UpsertOutcome::Inserted
        );
        assert!(registry.find("AA:00:00:00:00:01").is_none());
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_sighting_never_touches_state() {
        let mut registry = ScanRegistry::new("Movesense");
        registry.upsert(sighting("AA:00:00:00:00:01", "Movesense 1", -60));
        registry.mark_connected("AA:00:00:00:00:01", "1234");

        registry.upsert(sighting("AA:00:00:00:00:01", "Movesense 1", -30));

        let device = registry.find("AA:00:00:00:00:01").unwrap();
        assert_eq!(
            device.connection_state,
            ConnectionState::Connected("1234".to_string())
        );
        assert_eq!(device.signal_strength, -30);
    }

    #[test]
    fn test_mark_unknown_address_is_noop() {
        let mut registry = ScanRegistry::new("Movesense");
        let changes = registry.subscribe();

        assert!(registry.mark_connected("AA:00:00:00:00:09", "1").is_none());
        assert!(registry.mark_disconnected("AA:00:00:00:00:09").is_none());
        assert!(!changes.has_changed().unwrap());
    }

    #[test]
    fn test_changes_are_notified() {
        let mut registry = ScanRegistry::new("Movesense");
        let mut changes = registry.subscribe();

        registry.upsert(sighting("AA:00:00:00:00:01", "Movesense 1", -60));
        assert!(changes.has_changed().unwrap());
        changes.mark_unchanged();

        registry.upsert(sighting("AA:00:00:00:00:02", "Other", -60));
        assert!(!changes.has_changed().unwrap());

        registry.reset();
        assert!(changes.has_changed().unwrap());
        assert!(registry.is_empty());
    }

    #[test]
    fn test_reset_keeps_active_device() {
        let mut registry = ScanRegistry::new("Movesense");
        registry.upsert(sighting("AA:00:00:00:00:01", "Movesense 1", -60));
        registry.upsert(sighting("AA:00:00:00:00:02", "Movesense 2", -60));
        registry.mark_connected("AA:00:00:00:00:01", "1111");

        registry.reset();
        assert_eq!(addresses(&registry), ["AA:00:00:00:00:01"]);

        // 再次发现时保留已连接状态
        registry.upsert(sighting("aa:00:00:00:00:01", "Movesense 1", -45));
        registry.upsert(sighting("AA:00:00:00:00:02", "Movesense 2", -60));
        assert_eq!(
            registry.find("AA:00:00:00:00:01").unwrap().connection_state,
            ConnectionState::Connected("1111".to_string())
        );
        assert_eq!(
            addresses(&registry),
            ["AA:00:00:00:00:02", "AA:00:00:00:00:01"]
        );
    }

    #[test]
    fn test_active_slot() {
        let mut registry = ScanRegistry::new("Movesense");
        registry.upsert(sighting("AA:00:00:00:00:01", "Movesense 1", -60));
        registry.upsert(sighting("AA:00:00:00:00:02", "Movesense 2", -60));
        assert!(registry.active().is_none());

        registry.mark_connecting("AA:00:00:00:00:02");
        assert_eq!(registry.active().unwrap().address, "AA:00:00:00:00:02");

        registry.mark_disconnected("AA:00:00:00:00:02");
        assert!(registry.active().is_none());
    }
}
