use serde::{Deserialize, Serialize};
use std::time::Duration;
use vaultsync_proto::BLOCK_SIZE;

/// Tunables for one synchronization domain. Passed explicitly into the folder
/// group, downloader and uploader; nothing reads process-wide settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    pub client_name: String,
    pub user_agent: String,
    /// Concurrent block requests across all peers.
    pub download_slots: usize,
    /// Per-peer in-flight cap; 0 means only `download_slots` applies.
    pub pipeline_max_requests: usize,
    pub block_size: u32,
    pub request_timeout_secs: u64,
    pub maintenance_interval_secs: u64,
}

impl SyncConfig {
    pub fn new() -> Self {
        Self {
            client_name: "vaultsync".to_string(),
            user_agent: format!("vaultsync/{}", env!("CARGO_PKG_VERSION")),
            download_slots: 10,
            pipeline_max_requests: 8,
            block_size: BLOCK_SIZE,
            request_timeout_secs: 10,
            maintenance_interval_secs: 10,
        }
    }

    pub fn with_download_slots(mut self, slots: usize) -> Self {
        self.download_slots = slots;
        self
    }

    pub fn with_pipeline_max_requests(mut self, max: usize) -> Self {
        self.pipeline_max_requests = max;
        self
    }

    pub fn with_block_size(mut self, block_size: u32) -> Self {
        self.block_size = block_size.max(1);
        self
    }

    pub fn with_client_name(mut self, name: impl Into<String>) -> Self {
        self.client_name = name.into();
        self
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn maintenance_interval(&self) -> Duration {
        Duration::from_secs(self.maintenance_interval_secs.max(1))
    }
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self::new()
    }
}
