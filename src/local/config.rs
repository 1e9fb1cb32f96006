use std::time::Duration;

use crate::transport::StreamTransportConfig;

/// Configuration of a `LocalTransport`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalTransportConfig {
    /// Settings applied to every connection
    pub stream: StreamTransportConfig,
    /// Also publish into this user's public run directory
    pub enable_public: bool,
    /// Upper bound between discovery scans
    pub discovery_rescan: Duration,
}

impl Default for LocalTransportConfig {
    fn default() -> Self {
        LocalTransportConfig {
            stream: StreamTransportConfig::default(),
            enable_public: false,
            discovery_rescan: Duration::from_secs(55),
        }
    }
}

impl LocalTransportConfig {
    pub fn new() -> Self {
        LocalTransportConfig::default()
    }

    pub fn stream(mut self, stream: StreamTransportConfig) -> Self {
        self.stream = stream;
        self
    }

    pub fn enable_public(mut self, enable_public: bool) -> Self {
        self.enable_public = enable_public;
        self
    }

    pub fn discovery_rescan(mut self, rescan: Duration) -> Self {
        self.discovery_rescan = rescan;
        self
    }
}
