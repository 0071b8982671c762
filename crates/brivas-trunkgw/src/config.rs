//! Trunk gateway configuration

use crate::errors::TrunkGwError;
use crate::types::SpanId;
use serde::{Deserialize, Serialize};
use std::net::{IpAddr, SocketAddr};
use std::time::Duration;

/// Complete configuration for all spans served by this process
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct TrunkGwConfig {
    /// Engine timing shared by every span
    pub engine: EngineConfig,
    /// Spans to drive
    pub spans: Vec<SpanConfig>,
}

/// Engine timing and sizing
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Socket poll timeout per loop iteration (ms)
    pub poll_interval_ms: u64,
    /// Heartbeat silence that triggers a span restart (ms)
    pub heartbeat_timeout_ms: u64,
    /// Upper bound for an outbound call setup to be acknowledged (ms)
    pub request_timeout_ms: u64,
    /// Sleep between request status checks (ms)
    pub request_poll_ms: u64,
    /// Busy channel wait: number of waits
    pub locator_retries: u32,
    /// Busy channel wait: length of each wait (ms)
    pub locator_wait_ms: u64,
    /// Delay before re-opening links after a socket error (ms)
    pub restart_backoff_ms: u64,
    /// Request pool capacity (highest request id)
    pub max_requests: u16,
}

/// One span and the gateway it talks to
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SpanConfig {
    /// Logical span id
    pub span_id: SpanId,
    /// Links to the gateway
    #[serde(default)]
    pub link: LinkConfig,
    /// Runs of physical channels making up the span
    pub trunks: Vec<TrunkConfig>,
}

/// A run of consecutive slots on one physical trunk
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrunkConfig {
    /// One-based physical trunk number
    pub physical_trunk: u32,
    /// One-based first slot of the run
    #[serde(default = "default_first_slot")]
    pub first_slot: u32,
    /// Number of slots in the run
    pub slots: u32,
}

/// Addresses of the control link; the heartbeat link uses port + 1 on both ends
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LinkConfig {
    pub local_ip: String,
    pub local_port: u16,
    pub remote_ip: String,
    pub remote_port: u16,
}

fn default_first_slot() -> u32 {
    1
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: 10,
            heartbeat_timeout_ms: 20_000,
            request_timeout_ms: 5_000,
            request_poll_ms: 10,
            locator_retries: 10,
            locator_wait_ms: 10,
            restart_backoff_ms: 1_000,
            max_requests: 6_000,
        }
    }
}

impl Default for LinkConfig {
    fn default() -> Self {
        Self {
            local_ip: "127.0.0.1".to_string(),
            local_port: crate::DEFAULT_CONTROL_PORT,
            remote_ip: "127.0.0.1".to_string(),
            remote_port: crate::DEFAULT_CONTROL_PORT,
        }
    }
}

impl EngineConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn heartbeat_timeout(&self) -> Duration {
        Duration::from_millis(self.heartbeat_timeout_ms)
    }

    pub fn request_poll(&self) -> Duration {
        Duration::from_millis(self.request_poll_ms)
    }

    /// Number of status checks an outbound request gets before timing out
    pub fn request_poll_budget(&self) -> u64 {
        (self.request_timeout_ms / self.request_poll_ms.max(1)).max(1)
    }

    pub fn locator_wait(&self) -> Duration {
        Duration::from_millis(self.locator_wait_ms)
    }

    pub fn restart_backoff(&self) -> Duration {
        Duration::from_millis(self.restart_backoff_ms)
    }

    pub fn validate(&self) -> Result<(), TrunkGwError> {
        if self.poll_interval_ms == 0 {
            return Err(TrunkGwError::Config("poll_interval_ms must be > 0".to_string()));
        }
        if self.heartbeat_timeout_ms == 0 {
            return Err(TrunkGwError::Config("heartbeat_timeout_ms must be > 0".to_string()));
        }
        if self.request_timeout_ms == 0 || self.request_poll_ms == 0 {
            return Err(TrunkGwError::Config(
                "request_timeout_ms and request_poll_ms must be > 0".to_string(),
            ));
        }
        if self.max_requests == 0 {
            return Err(TrunkGwError::Config("max_requests must be > 0".to_string()));
        }
        Ok(())
    }
}

impl LinkConfig {
    fn addr(ip: &str, port: u16) -> Result<SocketAddr, TrunkGwError> {
        let ip: IpAddr = ip
            .parse()
            .map_err(|e| TrunkGwError::Config(format!("Invalid address {}: {}", ip, e)))?;
        Ok(SocketAddr::new(ip, port))
    }

    /// (local, remote) addresses of the control link
    pub fn control_addrs(&self) -> Result<(SocketAddr, SocketAddr), TrunkGwError> {
        Ok((
            Self::addr(&self.local_ip, self.local_port)?,
            Self::addr(&self.remote_ip, self.remote_port)?,
        ))
    }

    /// (local, remote) addresses of the heartbeat link
    pub fn heartbeat_addrs(&self) -> Result<(SocketAddr, SocketAddr), TrunkGwError> {
        let local_port = self.local_port.checked_add(1).ok_or_else(|| {
            TrunkGwError::Config("local_port leaves no room for the heartbeat link".to_string())
        })?;
        let remote_port = self.remote_port.checked_add(1).ok_or_else(|| {
            TrunkGwError::Config("remote_port leaves no room for the heartbeat link".to_string())
        })?;
        Ok((
            Self::addr(&self.local_ip, local_port)?,
            Self::addr(&self.remote_ip, remote_port)?,
        ))
    }
}

impl SpanConfig {
    /// A single trunk span of `slots` channels
    pub fn single_trunk(span_id: SpanId, physical_trunk: u32, slots: u32) -> Self {
        Self {
            span_id,
            link: LinkConfig::default(),
            trunks: vec![TrunkConfig {
                physical_trunk,
                first_slot: 1,
                slots,
            }],
        }
    }

    /// One-based (trunk, slot) of every channel, in channel order.
    ///
    /// A run is cut short where its slot numbers would overflow.
    pub fn physical_positions(&self) -> Vec<(u32, u32)> {
        self.trunks
            .iter()
            .flat_map(|t| {
                (0..t.slots)
                    .map_while(move |i| Some((t.physical_trunk, t.first_slot.checked_add(i)?)))
            })
            .collect()
    }

    /// Every run must fit the one-based trunk and slot range of the wire
    pub fn validate(&self) -> Result<(), TrunkGwError> {
        if self.trunks.iter().all(|t| t.slots == 0) {
            return Err(TrunkGwError::Config(format!(
                "span {} has no channels",
                self.span_id
            )));
        }
        for trunk in &self.trunks {
            trunk.validate().map_err(|reason| {
                TrunkGwError::Config(format!("span {}: {}", self.span_id, reason))
            })?;
        }
        Ok(())
    }
}

/// Highest one-based trunk or slot number a position can carry
const MAX_PHYSICAL: u32 = 256;

impl TrunkConfig {
    fn validate(&self) -> Result<(), String> {
        if !(1..=MAX_PHYSICAL).contains(&self.physical_trunk) {
            return Err(format!("physical trunk {} out of range", self.physical_trunk));
        }
        if self.slots == 0 {
            return Ok(());
        }
        let last = self
            .first_slot
            .checked_add(self.slots - 1)
            .filter(|last| self.first_slot >= 1 && *last <= MAX_PHYSICAL);
        match last {
            Some(_) => Ok(()),
            None => Err(format!(
                "slots {}+{} on trunk {} out of range",
                self.first_slot, self.slots, self.physical_trunk
            )),
        }
    }
}

impl TrunkGwConfig {
    /// Load configuration from a JSON file
    pub fn from_file(path: &str) -> Result<Self, TrunkGwError> {
        let content =
            std::fs::read_to_string(path).map_err(|e| TrunkGwError::Config(e.to_string()))?;

        serde_json::from_str(&content).map_err(|e| TrunkGwError::Config(e.to_string()))
    }

    /// Load a config file of any supported format, overridden by
    /// `TRUNKGW__<SECTION>__<KEY>` environment variables
    pub fn load(path: &str) -> Result<Self, TrunkGwError> {
        let settings = config::Config::builder()
            .add_source(config::File::with_name(path))
            .add_source(config::Environment::with_prefix("TRUNKGW").separator("__"))
            .build()
            .map_err(|e| TrunkGwError::Config(e.to_string()))?;

        let loaded: Self = settings
            .try_deserialize()
            .map_err(|e| TrunkGwError::Config(e.to_string()))?;
        loaded.validate()?;
        Ok(loaded)
    }

    pub fn validate(&self) -> Result<(), TrunkGwError> {
        self.engine.validate()?;
        for span in &self.spans {
            span.validate()?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = EngineConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.request_poll_budget(), 500);
    }

    #[test]
    fn test_heartbeat_link_uses_next_port() {
        let link = LinkConfig {
            local_ip: "10.0.0.1".to_string(),
            local_port: 53000,
            remote_ip: "10.0.0.2".to_string(),
            remote_port: 53010,
        };
        let (local, remote) = link.heartbeat_addrs().unwrap();
        assert_eq!(local.port(), 53001);
        assert_eq!(remote.port(), 53011);
    }

    #[test]
    fn test_physical_positions() {
        let span = SpanConfig {
            span_id: 1,
            link: LinkConfig::default(),
            trunks: vec![
                TrunkConfig { physical_trunk: 1, first_slot: 1, slots: 2 },
                TrunkConfig { physical_trunk: 3, first_slot: 16, slots: 2 },
            ],
        };
        assert_eq!(span.physical_positions(), vec![(1, 1), (1, 2), (3, 16), (3, 17)]);
    }

    #[test]
    fn test_json_roundtrip_with_defaults() {
        let json = r#"{"spans":[{"span_id":2,"trunks":[{"physical_trunk":1,"slots":31}]}]}"#;
        let config: TrunkGwConfig = serde_json::from_str(json).unwrap();
        assert_eq!(config.engine.heartbeat_timeout_ms, 20_000);
        assert_eq!(config.spans[0].physical_positions().len(), 31);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_load_from_file() {
        let path = std::env::temp_dir().join(format!("trunkgw-{}.json", std::process::id()));
        std::fs::write(
            &path,
            r#"{"engine":{"heartbeat_timeout_ms":5000},"spans":[{"span_id":1,"trunks":[{"physical_trunk":2,"slots":4}]}]}"#,
        )
        .unwrap();

        let loaded = tokio_test::assert_ok!(TrunkGwConfig::load(path.to_str().unwrap()));
        assert_eq!(loaded.engine.heartbeat_timeout_ms, 5000);
        assert_eq!(loaded.engine.max_requests, 6000);
        assert_eq!(loaded.spans[0].physical_positions()[0], (2, 1));

        std::fs::remove_file(&path).unwrap();
        tokio_test::assert_err!(TrunkGwConfig::load(path.to_str().unwrap()));
    }

    #[test]
    fn test_rejects_zero_capacity() {
        let config = EngineConfig {
            max_requests: 0,
            ..Default::default()
        };
        assert!(matches!(config.validate(), Err(TrunkGwError::Config(_))));
    }

    #[test]
    fn test_rejects_slot_run_past_wire_range() {
        let mut span = SpanConfig::single_trunk(4, 1, 2);
        span.trunks[0].first_slot = u32::MAX;
        assert_eq!(span.physical_positions(), vec![(1, u32::MAX)]);
        assert!(matches!(span.validate(), Err(TrunkGwError::Config(_))));

        span.trunks[0].first_slot = 256;
        assert!(span.validate().is_err());
        span.trunks[0].first_slot = 255;
        assert!(span.validate().is_ok());

        let mut span = SpanConfig::single_trunk(4, 257, 1);
        assert!(span.validate().is_err());
        span.trunks[0].physical_trunk = 0;
        assert!(span.validate().is_err());
        assert!(SpanConfig::single_trunk(4, 1, 0).validate().is_err());
    }
}
