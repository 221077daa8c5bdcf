use serde::{Deserialize, Serialize};
use sl_channel::ChannelConfig;
use sl_types::SlResult;
use std::net::{IpAddr, Ipv4Addr};
use std::time::Duration;

/// Runtime settings shared by the controller and every node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    /// Name of the placement parameter in applied configurations.
    pub partition_parameter: String,
    /// Interface network output channels listen on.
    pub bind_host: IpAddr,
    pub channel: ChannelConfig,
    /// Deadline for a whole drain cycle. `None` waits indefinitely.
    pub drain_timeout_ms: Option<u64>,
    /// Capacity of each blob input and output buffer.
    pub buffer_capacity: usize,
    /// Sleep of a blob core after a step that made no progress.
    pub idle_backoff_us: u64,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            partition_parameter: "partition".to_string(),
            bind_host: IpAddr::V4(Ipv4Addr::LOCALHOST),
            channel: ChannelConfig::default(),
            drain_timeout_ms: None,
            buffer_capacity: 1024,
            idle_backoff_us: 200,
        }
    }
}

impl RuntimeConfig {
    pub fn with_partition_parameter(mut self, name: &str) -> Self {
        self.partition_parameter = name.to_string();
        self
    }

    pub fn with_bind_host(mut self, host: IpAddr) -> Self {
        self.bind_host = host;
        self
    }

    pub fn with_channel(mut self, channel: ChannelConfig) -> Self {
        self.channel = channel;
        self
    }

    pub fn with_drain_timeout(mut self, timeout: Duration) -> Self {
        self.drain_timeout_ms = Some(timeout.as_millis() as u64);
        self
    }

    pub fn with_buffer_capacity(mut self, capacity: usize) -> Self {
        self.buffer_capacity = capacity.max(1);
        self
    }

    pub fn drain_timeout(&self) -> Option<Duration> {
        self.drain_timeout_ms.map(Duration::from_millis)
    }

    pub fn idle_backoff(&self) -> Duration {
        Duration::from_micros(self.idle_backoff_us)
    }

    pub fn from_json(text: &str) -> SlResult<Self> {
        Ok(serde_json::from_str(text)?)
    }

    pub fn to_json(&self) -> SlResult<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_wait_indefinitely() {
        let config = RuntimeConfig::default();
        assert_eq!(config.drain_timeout(), None);
        assert_eq!(config.partition_parameter, "partition");
        assert_eq!(config.channel.reconnect_wait(), Duration::from_secs(1));
    }

    #[test]
    fn json_round_trip_keeps_overrides() {
        let config = RuntimeConfig::default()
            .with_drain_timeout(Duration::from_secs(30))
            .with_buffer_capacity(64);
        let text = config.to_json().unwrap();
        assert_eq!(RuntimeConfig::from_json(&text).unwrap(), config);

        let partial = RuntimeConfig::from_json(r#"{"buffer_capacity": 8}"#).unwrap();
        assert_eq!(partial.buffer_capacity, 8);
        assert_eq!(partial.bind_host, RuntimeConfig::default().bind_host);
    }
}
