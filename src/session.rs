//! Gateway session state shared by the receive loop, the poll loop and
//! command callers. All fields live behind one lock so that address and port
//! are always read together.

use crate::protocol::DEFAULT_GATEWAY_PORT;
use parking_lot::RwLock;
use std::net::{IpAddr, SocketAddr};

/// Progress of the `whois`/`iam` handshake.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DiscoveryState {
    #[default]
    Undiscovered,
    AwaitingIam,
    Discovered,
}

/// Snapshot of what the engine knows about the gateway.
#[derive(Debug, Clone, PartialEq)]
pub struct GatewaySession {
    pub state: DiscoveryState,
    pub address: Option<IpAddr>,
    pub port: u16,
    pub sid: Option<String>,
    pub token: Option<String>,
    /// Last packed colour reported by the gateway light
    pub last_rgb: u32,
}

impl Default for GatewaySession {
    fn default() -> Self {
        Self {
            state: DiscoveryState::Undiscovered,
            address: None,
            port: DEFAULT_GATEWAY_PORT,
            sid: None,
            token: None,
            last_rgb: 0,
        }
    }
}

impl GatewaySession {
    /// Unicast address of the gateway, once discovered.
    pub fn endpoint(&self) -> Option<SocketAddr> {
        self.address.map(|ip| SocketAddr::new(ip, self.port))
    }

    /// Whether a fresh `whois` is needed before devices can be polled.
    pub fn needs_discovery(&self) -> bool {
        self.state != DiscoveryState::Discovered || self.sid.is_none() || self.token.is_none()
    }
}

/// Lock around [`GatewaySession`].
#[derive(Debug, Default)]
pub struct SharedSession {
    inner: RwLock<GatewaySession>,
}

impl SharedSession {
    pub fn new() -> Self {
        Self::default()
    }

    /// Consistent copy of the whole session.
    pub fn snapshot(&self) -> GatewaySession {
        self.inner.read().clone()
    }

    pub fn with<R>(&self, f: impl FnOnce(&GatewaySession) -> R) -> R {
        f(&self.inner.read())
    }

    pub fn with_mut<R>(&self, f: impl FnOnce(&mut GatewaySession) -> R) -> R {
        f(&mut self.inner.write())
    }

    /// Moves to `AwaitingIam` unless the gateway is already known.
    pub fn mark_probe_sent(&self) {
        self.with_mut(|s| {
            if s.state == DiscoveryState::Undiscovered {
                s.state = DiscoveryState::AwaitingIam;
            }
        });
    }

    /// Completes the handshake with the data from an `iam` reply.
    pub fn record_gateway(&self, sid: &str, address: IpAddr, port: u16) {
        self.with_mut(|s| {
            s.sid = Some(sid.to_string());
            s.address = Some(address);
            s.port = port;
            s.state = DiscoveryState::Discovered;
        });
    }

    pub fn set_token(&self, token: &str) {
        self.with_mut(|s| s.token = Some(token.to_string()));
    }

    pub fn set_last_rgb(&self, rgb: u32) {
        self.with_mut(|s| s.last_rgb = rgb);
    }

    pub fn last_rgb(&self) -> u32 {
        self.with(|s| s.last_rgb)
    }

    pub fn gateway_sid(&self) -> Option<String> {
        self.with(|s| s.sid.clone())
    }

    /// Clears the gateway identity so the next poll starts over with `whois`.
    ///
    /// The last known address is kept; only sid, token and state are reset.
    pub fn forget_gateway(&self) {
        self.with_mut(|s| {
            s.sid = None;
            s.token = None;
            s.state = DiscoveryState::Undiscovered;
        });
    }

    /// Back to the initial state.
    pub fn reset(&self) {
        self.with_mut(|s| *s = GatewaySession::default());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    #[test]
    fn handshake_states() {
        let session = SharedSession::new();
        assert_eq!(session.snapshot().state, DiscoveryState::Undiscovered);
        assert_eq!(session.snapshot().endpoint(), None);

        session.mark_probe_sent();
        assert_eq!(session.snapshot().state, DiscoveryState::AwaitingIam);

        let ip = IpAddr::V4(Ipv4Addr::new(192, 168, 1, 50));
        session.record_gateway("abc", ip, 9898);
        let snap = session.snapshot();
        assert_eq!(snap.state, DiscoveryState::Discovered);
        assert_eq!(snap.endpoint(), Some(SocketAddr::new(ip, 9898)));

        session.mark_probe_sent();
        assert_eq!(session.snapshot().state, DiscoveryState::Discovered);
    }

    #[test]
    fn discovery_needs_token() {
        let session = SharedSession::new();
        session.record_gateway("abc", IpAddr::V4(Ipv4Addr::LOCALHOST), 9898);
        assert!(session.snapshot().needs_discovery());
        session.set_token("tok");
        assert!(!session.snapshot().needs_discovery());

        session.forget_gateway();
        let snap = session.snapshot();
        assert!(snap.needs_discovery());
        assert_eq!(snap.state, DiscoveryState::Undiscovered);
        assert!(snap.token.is_none());
    }
}
