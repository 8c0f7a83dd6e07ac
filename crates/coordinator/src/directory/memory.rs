//! Directories that live in-process.

use super::{SfuAnnouncement, SfuDirectory};
use crate::errors::CoordinatorError;
use async_trait::async_trait;
use dashmap::DashMap;
use std::sync::Arc;

/// Fixed instances from configuration, always reported as alive.
#[derive(Debug, Clone, Default)]
pub struct StaticSfuDirectory {
    instances: Vec<(String, u32)>,
}

impl StaticSfuDirectory {
    #[must_use]
    pub fn new(instances: Vec<(String, u32)>) -> Self {
        Self { instances }
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.instances.is_empty()
    }
}

#[async_trait]
impl SfuDirectory for StaticSfuDirectory {
    async fn announcements(&self) -> Result<Vec<SfuAnnouncement>, CoordinatorError> {
        Ok(self
            .instances
            .iter()
            .map(|(server_id, capacity)| SfuAnnouncement::now(server_id, *capacity))
            .collect())
    }
}

/// Shared in-process directory. Clones see the same announcements.
#[derive(Debug, Clone, Default)]
pub struct InMemorySfuDirectory {
    announcements: Arc<DashMap<String, SfuAnnouncement>>,
}

impl InMemorySfuDirectory {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Store an instance's announcement, replacing its previous one.
    pub fn announce(&self, announcement: SfuAnnouncement) {
        self.announcements
            .insert(announcement.server_id.clone(), announcement);
    }

    pub fn withdraw(&self, server_id: &str) {
        self.announcements.remove(server_id);
    }
}

#[async_trait]
impl SfuDirectory for InMemorySfuDirectory {
    async fn announcements(&self) -> Result<Vec<SfuAnnouncement>, CoordinatorError> {
        let mut all: Vec<SfuAnnouncement> = self
            .announcements
            .iter()
            .map(|entry| entry.value().clone())
            .collect();
        all.sort_by(|a, b| a.server_id.cmp(&b.server_id));
        Ok(all)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::indexing_slicing)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_static_directory_stamps_every_poll() {
        let directory = StaticSfuDirectory::new(vec![("sfu-a".to_string(), 10)]);
        let before = chrono::Utc::now().timestamp_millis();

        let announced = directory.announcements().await.unwrap();
        assert_eq!(announced.len(), 1);
        assert_eq!(announced[0].capacity, 10);
        assert!(announced[0].heartbeat_at_ms >= before);
    }

    #[tokio::test]
    async fn test_in_memory_directory_keeps_latest_per_instance() {
        let directory = InMemorySfuDirectory::new();
        let shared = directory.clone();

        directory.announce(SfuAnnouncement::now("sfu-b", 10));
        directory.announce(SfuAnnouncement::now("sfu-a", 10));
        directory.announce(SfuAnnouncement::now("sfu-a", 20));

        let announced = shared.announcements().await.unwrap();
        assert_eq!(announced.len(), 2);
        assert_eq!(announced[0].server_id, "sfu-a");
        assert_eq!(announced[0].capacity, 20);

        shared.withdraw("sfu-b");
        assert_eq!(directory.announcements().await.unwrap().len(), 1);
    }
}
