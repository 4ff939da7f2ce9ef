//! Link spec: immutable connection parameters shared by the connector and both channels.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::NetCoreError;

/// Default time a synced call waits for the remote return value.
pub const DEFAULT_SYNCED_CALL_TIMEOUT: Duration = Duration::from_secs(5);

/// Reliable channel port sits past the unreliable pair so the three never collide.
pub const RELIABLE_PORT_OFFSET: u16 = 2;

/// Which end of the link this process is. Exactly one side is `Server`.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// Listens for the reliable connection.
    Server,
    /// Dials the reliable connection.
    Client,
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Role::Server => f.write_str("server"),
            Role::Client => f.write_str("client"),
        }
    }
}

impl std::str::FromStr for Role {
    type Err = NetCoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "server" => Ok(Role::Server),
            "client" => Ok(Role::Client),
            other => Err(NetCoreError::InvalidSpec(format!("unknown role {other:?}"))),
        }
    }
}

/// Exponential backoff for reconnect (reliable) and rebind (unreliable) attempts.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub struct Backoff {
    pub initial: Duration,
    pub max: Duration,
    /// `None` retries until the channel is stopped.
    pub max_attempts: Option<u32>,
}

impl Default for Backoff {
    fn default() -> Self {
        Self {
            initial: Duration::from_millis(100),
            max: Duration::from_secs(5),
            max_attempts: None,
        }
    }
}

impl Backoff {
    /// Delay before retry number `attempt` (0-based), before jitter.
    pub fn delay(&self, attempt: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt.min(16)).unwrap_or(u32::MAX);
        self.initial.saturating_mul(factor).min(self.max)
    }

    pub fn exhausted(&self, attempts: u32) -> bool {
        self.max_attempts.is_some_and(|max| attempts >= max)
    }
}

/// Connection parameters for one link. Owned by the application, immutable once handed
/// to a connector.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct LinkSpec {
    /// Peer host name or IP.
    pub address: String,
    pub base_port: u16,
    pub role: Role,
    /// Both endpoints on one host: the unreliable port pair is offset by one.
    pub loopback: bool,
    pub synced_call_timeout: Duration,
    pub reconnect: Backoff,
}

impl LinkSpec {
    pub fn new(address: impl Into<String>, base_port: u16, role: Role) -> Self {
        Self {
            address: address.into(),
            base_port,
            role,
            loopback: false,
            synced_call_timeout: DEFAULT_SYNCED_CALL_TIMEOUT,
            reconnect: Backoff::default(),
        }
    }

    /// Both ends on 127.0.0.1.
    pub fn loopback(base_port: u16, role: Role) -> Self {
        Self {
            loopback: true,
            ..Self::new("127.0.0.1", base_port, role)
        }
    }

    pub fn with_synced_call_timeout(mut self, timeout: Duration) -> Self {
        self.synced_call_timeout = timeout;
        self
    }

    pub fn with_reconnect(mut self, reconnect: Backoff) -> Self {
        self.reconnect = reconnect;
        self
    }

    pub fn validate(&self) -> Result<(), NetCoreError> {
        if self.address.trim().is_empty() {
            return Err(NetCoreError::InvalidSpec("empty address".into()));
        }
        if self.base_port.checked_add(RELIABLE_PORT_OFFSET).is_none() {
            return Err(NetCoreError::InvalidSpec(format!(
                "base port {} leaves no room for the reliable port",
                self.base_port
            )));
        }
        if self.synced_call_timeout.is_zero() {
            return Err(NetCoreError::InvalidSpec("synced call timeout is zero".into()));
        }
        if self.reconnect.initial > self.reconnect.max {
            return Err(NetCoreError::InvalidSpec(
                "reconnect initial delay exceeds max delay".into(),
            ));
        }
        Ok(())
    }

    fn loopback_offset(&self) -> u16 {
        u16::from(self.loopback)
    }

    /// Port this endpoint receives notifications on.
    pub fn unreliable_listen_port(&self) -> u16 {
        match self.role {
            Role::Server => self.base_port + self.loopback_offset(),
            Role::Client => self.base_port,
        }
    }

    /// Port the peer receives notifications on.
    pub fn unreliable_send_port(&self) -> u16 {
        match self.role {
            Role::Server => self.base_port,
            Role::Client => self.base_port + self.loopback_offset(),
        }
    }

    /// Server listens here, client dials here.
    pub fn reliable_port(&self) -> u16 {
        self.base_port + RELIABLE_PORT_OFFSET
    }

    /// Local address to bind listening sockets on, matching the family of `peer`.
    pub fn listen_ip(&self, peer: IpAddr) -> IpAddr {
        match (self.loopback, peer) {
            (true, IpAddr::V4(_)) => IpAddr::V4(Ipv4Addr::LOCALHOST),
            (true, IpAddr::V6(_)) => IpAddr::V6(Ipv6Addr::LOCALHOST),
            (false, IpAddr::V4(_)) => IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            (false, IpAddr::V6(_)) => IpAddr::V6(Ipv6Addr::UNSPECIFIED),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn loopback_ports_do_not_collide() {
        let server = LinkSpec::loopback(47000, Role::Server);
        let client = LinkSpec::loopback(47000, Role::Client);
        assert_eq!(server.unreliable_listen_port(), 47001);
        assert_eq!(server.unreliable_send_port(), 47000);
        assert_eq!(client.unreliable_listen_port(), 47000);
        assert_eq!(client.unreliable_send_port(), 47001);
        // Each side sends to where the other listens.
        assert_eq!(server.unreliable_send_port(), client.unreliable_listen_port());
        assert_eq!(client.unreliable_send_port(), server.unreliable_listen_port());
        assert_eq!(server.reliable_port(), 47002);
        assert_eq!(client.reliable_port(), 47002);
    }

    #[test]
    fn remote_ports_share_base() {
        let server = LinkSpec::new("10.0.0.2", 47000, Role::Server);
        let client = LinkSpec::new("10.0.0.1", 47000, Role::Client);
        assert_eq!(server.unreliable_listen_port(), 47000);
        assert_eq!(client.unreliable_send_port(), 47000);
        assert_eq!(
            server.listen_ip("10.0.0.2".parse().unwrap()),
            IpAddr::V4(Ipv4Addr::UNSPECIFIED)
        );
    }

    #[test]
    fn validate_rejects_bad_specs() {
        assert!(LinkSpec::new("", 1000, Role::Client).validate().is_err());
        assert!(LinkSpec::new("host", u16::MAX, Role::Client)
            .validate()
            .is_err());
        assert!(LinkSpec::loopback(1000, Role::Server)
            .with_synced_call_timeout(Duration::ZERO)
            .validate()
            .is_err());
        let inverted = Backoff {
            initial: Duration::from_secs(10),
            max: Duration::from_secs(1),
            max_attempts: None,
        };
        assert!(LinkSpec::loopback(1000, Role::Server)
            .with_reconnect(inverted)
            .validate()
            .is_err());
        assert!(LinkSpec::loopback(1000, Role::Server).validate().is_ok());
    }

    #[test]
    fn backoff_doubles_and_caps() {
        let b = Backoff {
            initial: Duration::from_millis(100),
            max: Duration::from_millis(500),
            max_attempts: Some(3),
        };
        assert_eq!(b.delay(0), Duration::from_millis(100));
        assert_eq!(b.delay(1), Duration::from_millis(200));
        assert_eq!(b.delay(2), Duration::from_millis(400));
        assert_eq!(b.delay(3), Duration::from_millis(500));
        assert_eq!(b.delay(40), Duration::from_millis(500));
        assert!(!b.exhausted(2));
        assert!(b.exhausted(3));
        assert!(!Backoff::default().exhausted(u32::MAX));
    }

    #[test]
    fn role_parses_case_insensitively() {
        assert_eq!("Server".parse::<Role>().unwrap(), Role::Server);
        assert_eq!(" client ".parse::<Role>().unwrap(), Role::Client);
        assert!("router".parse::<Role>().is_err());
    }
}
