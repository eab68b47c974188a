//! Device records owned by the persistence layer.
//!
//! The hub never loads or stores devices itself. The upgrade handler asks a
//! [`DeviceDirectory`] who owns a device and what it looks like; the hub tells
//! it when a device goes online or offline. [`MemoryDirectory`] backs both in
//! memory for a standalone server and for tests.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::protocol::DeviceInfo;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceRecord {
    pub id: Uuid,
    pub user_id: Uuid,
    /// Identifier reported by the device itself (hardware or install id).
    pub device_id: String,
    pub device_name: String,
    #[serde(default = "default_device_type")]
    pub device_type: String,
    #[serde(default)]
    pub has_camera: bool,
    #[serde(default)]
    pub has_microphone: bool,
    #[serde(default)]
    pub is_online: bool,
}

fn default_device_type() -> String {
    "desktop".to_string()
}

impl DeviceRecord {
    /// Snapshot sent in presence events for a device that just connected.
    pub fn online_snapshot(&self) -> DeviceInfo {
        DeviceInfo {
            id: self.id,
            device_id: self.device_id.clone(),
            device_name: self.device_name.clone(),
            device_type: self.device_type.clone(),
            has_camera: self.has_camera,
            has_microphone: self.has_microphone,
            is_online: true,
        }
    }
}

#[async_trait]
pub trait DeviceDirectory: Send + Sync {
    async fn find_device(&self, id: Uuid) -> Result<Option<DeviceRecord>>;

    async fn set_online(&self, id: Uuid, online: bool) -> Result<()>;
}

#[derive(Debug, Default)]
pub struct MemoryDirectory {
    devices: Mutex<HashMap<Uuid, DeviceRecord>>,
}

impl MemoryDirectory {
    pub fn new(records: impl IntoIterator<Item = DeviceRecord>) -> Self {
        Self {
            devices: Mutex::new(records.into_iter().map(|r| (r.id, r)).collect()),
        }
    }

    fn devices(&self) -> MutexGuard<'_, HashMap<Uuid, DeviceRecord>> {
        self.devices.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn insert(&self, record: DeviceRecord) {
        self.devices().insert(record.id, record);
    }

    pub fn get(&self, id: Uuid) -> Option<DeviceRecord> {
        self.devices().get(&id).cloned()
    }
}

#[async_trait]
impl DeviceDirectory for MemoryDirectory {
    async fn find_device(&self, id: Uuid) -> Result<Option<DeviceRecord>> {
        Ok(self.get(id))
    }

    async fn set_online(&self, id: Uuid, online: bool) -> Result<()> {
        match self.devices().get_mut(&id) {
            Some(record) => {
                record.is_online = online;
                Ok(())
            }
            None => anyhow::bail!("device {id} not found"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn set_online_updates_known_devices_only() {
        let id = Uuid::new_v4();
        let dir = MemoryDirectory::new([DeviceRecord {
            id,
            user_id: Uuid::new_v4(),
            device_id: "hw-1".into(),
            device_name: "Kitchen tablet".into(),
            device_type: "tablet".into(),
            has_camera: true,
            has_microphone: true,
            is_online: false,
        }]);

        dir.set_online(id, true).await.unwrap();
        assert!(dir.find_device(id).await.unwrap().unwrap().is_online);
        let err = dir.set_online(Uuid::new_v4(), true).await.unwrap_err();
        assert!(err.to_string().contains("not found"));
    }

    #[test]
    fn record_defaults_apply_when_parsing() {
        let raw = format!(
            r#"{{"id":"{}","user_id":"{}","device_id":"abc","device_name":"Desk"}}"#,
            Uuid::new_v4(),
            Uuid::new_v4()
        );
        let rec: DeviceRecord = serde_json::from_str(&raw).unwrap();
        assert_eq!(rec.device_type, "desktop");
        assert!(!rec.has_camera);
        assert!(rec.online_snapshot().is_online);
    }
}
