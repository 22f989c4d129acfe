//! Engine configuration.

use crate::error::{GatewayError, Result};
use crate::protocol::{DEFAULT_GATEWAY_PORT, DISCOVERY_PORT, MULTICAST_ADDR};
use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::Duration;

/// Packed green at full brightness.
pub const DEFAULT_START_COLOR: u32 = 1_677_786_880;
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(60_000);

const PROP_REFRESH: &str = "refresh";
const PROP_START_COLOR: &str = "startColor";
const PROP_KEY: &str = "key";

/// Settings of an [`Engine`](crate::engine::Engine).
#[derive(Debug, Clone, PartialEq)]
pub struct EngineConfig {
    /// Interval between poll steps
    pub poll_interval: Duration,
    /// Packed colour written when the gateway light is switched on
    pub start_color: u32,
    /// Developer key from the vendor app; writes fail while empty
    pub developer_key: String,
    /// Local address to bind to
    pub bind_addr: IpAddr,
    /// Local port, also the gateway port assumed before discovery
    pub gateway_port: u16,
    pub multicast_addr: Ipv4Addr,
    pub discovery_port: u16,
    /// Whether the engine runs its own poll loop
    pub auto_poll: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            poll_interval: DEFAULT_POLL_INTERVAL,
            start_color: DEFAULT_START_COLOR,
            developer_key: String::new(),
            bind_addr: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            gateway_port: DEFAULT_GATEWAY_PORT,
            multicast_addr: MULTICAST_ADDR
                .parse()
                .unwrap_or(Ipv4Addr::new(224, 0, 0, 50)),
            discovery_port: DISCOVERY_PORT,
            auto_poll: true,
        }
    }
}

impl EngineConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reads the host's flat properties (`refresh`, `startColor`, `key`).
    ///
    /// Missing or blank values keep their defaults.
    pub fn from_properties(props: &HashMap<String, String>) -> Result<Self> {
        let mut config = Self::default();
        config.apply_properties(props)?;
        Ok(config)
    }

    /// Overlays properties onto this configuration.
    pub fn apply_properties(&mut self, props: &HashMap<String, String>) -> Result<()> {
        let prop = |name: &str| {
            props
                .get(name)
                .map(|v| v.trim())
                .filter(|v| !v.is_empty())
        };

        if let Some(refresh) = prop(PROP_REFRESH) {
            let millis: u64 = refresh
                .parse()
                .map_err(|_| GatewayError::Config(PROP_REFRESH.into(), refresh.into()))?;
            self.poll_interval = Duration::from_millis(millis);
        }
        if let Some(color) = prop(PROP_START_COLOR) {
            self.start_color = color
                .trim_end_matches(['L', 'l'])
                .parse()
                .map_err(|_| GatewayError::Config(PROP_START_COLOR.into(), color.into()))?;
        }
        if let Some(key) = prop(PROP_KEY) {
            self.developer_key = key.to_string();
        }
        Ok(())
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn with_start_color(mut self, color: u32) -> Self {
        self.start_color = color;
        self
    }

    pub fn with_developer_key(mut self, key: &str) -> Self {
        self.developer_key = key.to_string();
        self
    }

    pub fn with_bind_addr(mut self, addr: IpAddr) -> Self {
        self.bind_addr = addr;
        self
    }

    pub fn with_gateway_port(mut self, port: u16) -> Self {
        self.gateway_port = port;
        self
    }

    /// Sends `whois` somewhere other than the standard group (useful for tests).
    pub fn with_discovery(mut self, group: Ipv4Addr, port: u16) -> Self {
        self.multicast_addr = group;
        self.discovery_port = port;
        self
    }

    pub fn with_auto_poll(mut self, enabled: bool) -> Self {
        self.auto_poll = enabled;
        self
    }

    /// Where `whois` probes go.
    pub fn discovery_target(&self) -> SocketAddr {
        SocketAddr::new(IpAddr::V4(self.multicast_addr), self.discovery_port)
    }

    /// Local socket address.
    pub fn bind_target(&self) -> SocketAddr {
        SocketAddr::new(self.bind_addr, self.gateway_port)
    }
}
