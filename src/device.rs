//! # Device Directory
//!
//! Maps a device's hardware identity (MAC address or UUID) to the conversation
//! it belongs to, so a device that reconnects continues the same conversation.
//!
//! The directory is a trait so a persistent store can replace the in-memory one
//! without touching the WebSocket layer.

use crate::error::{VoiceError, VoiceResult};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::Serialize;
use tracing::info;
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DeviceRecord {
    pub device_id: String,
    pub conversation_id: String,
    pub created_at: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
}

#[async_trait]
pub trait DeviceDirectory: Send + Sync {
    async fn lookup(&self, device_id: &str) -> VoiceResult<Option<DeviceRecord>>;

    /// Look the device up, creating a record with a fresh conversation if needed.
    async fn bind(&self, device_id: &str) -> VoiceResult<DeviceRecord>;

    async fn update(&self, record: DeviceRecord) -> VoiceResult<()>;
}

#[derive(Default)]
pub struct InMemoryDeviceDirectory {
    records: DashMap<String, DeviceRecord>,
}

impl InMemoryDeviceDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }
}

#[async_trait]
impl DeviceDirectory for InMemoryDeviceDirectory {
    async fn lookup(&self, device_id: &str) -> VoiceResult<Option<DeviceRecord>> {
        Ok(self.records.get(device_id).map(|r| r.clone()))
    }

    async fn bind(&self, device_id: &str) -> VoiceResult<DeviceRecord> {
        if device_id.trim().is_empty() {
            return Err(VoiceError::Device("device id must not be empty".to_string()));
        }
        let now = Utc::now();
        let record = self
            .records
            .entry(device_id.to_string())
            .and_modify(|r| r.last_seen = now)
            .or_insert_with(|| {
                info!(device_id, "Registered new device");
                DeviceRecord {
                    device_id: device_id.to_string(),
                    conversation_id: Uuid::new_v4().to_string(),
                    created_at: now,
                    last_seen: now,
                }
            })
            .clone();
        Ok(record)
    }

    async fn update(&self, record: DeviceRecord) -> VoiceResult<()> {
        if !self.records.contains_key(&record.device_id) {
            return Err(VoiceError::Device(format!("unknown device {}", record.device_id)));
        }
        self.records.insert(record.device_id.clone(), record);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio_test::{assert_err, assert_ok};

    #[tokio::test]
    async fn test_bind_creates_then_reuses_conversation() {
        let directory = InMemoryDeviceDirectory::new();
        assert!(directory.lookup("aa:bb").await.unwrap().is_none());

        let first = directory.bind("aa:bb").await.unwrap();
        let second = directory.bind("aa:bb").await.unwrap();
        assert_eq!(first.conversation_id, second.conversation_id);
        assert!(second.last_seen >= first.last_seen);
        assert_eq!(directory.len(), 1);

        let other = directory.bind("cc:dd").await.unwrap();
        assert_ne!(other.conversation_id, first.conversation_id);
    }

    #[tokio::test]
    async fn test_update_requires_known_device() {
        let directory = InMemoryDeviceDirectory::new();
        assert_err!(directory.bind("  ").await);

        let mut record = directory.bind("aa:bb").await.unwrap();
        record.conversation_id = "restarted".to_string();
        assert_ok!(directory.update(record.clone()).await);
        assert_eq!(
            directory.lookup("aa:bb").await.unwrap().unwrap().conversation_id,
            "restarted"
        );

        record.device_id = "unknown".to_string();
        assert_err!(directory.update(record).await);
    }
}
