//! Loopback port allocation.
//!
//! Probes pseudo-random candidate ports in the IANA dynamic range and
//! returns the first with no existing listener. Allocation is advisory,
//! not reserved: a race window exists between the check and the daemon's
//! bind, so the daemon's own bind failure stays authoritative (the
//! ephemeral backend retries with a fresh port when that happens).

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::Duration;

use rand::Rng;
use tokio::net::TcpStream;
use tracing::{debug, trace};

use crate::error::{ProvisionError, Result};

/// Candidate range, per IANA guidance for dynamic ports.
const PORT_RANGE: (u16, u16) = (49152, 65535);

/// Maximum candidates probed before reporting exhaustion.
const MAX_ATTEMPTS: u32 = 100;

/// Allocates unused loopback TCP ports.
#[derive(Debug, Clone, Copy)]
pub struct PortAllocator {
    /// Per-candidate connect timeout.
    pub connect_timeout: Duration,
}

impl Default for PortAllocator {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_millis(250),
        }
    }
}

impl PortAllocator {
    /// Create an allocator with the given per-candidate timeout.
    #[must_use]
    pub const fn new(connect_timeout: Duration) -> Self {
        Self { connect_timeout }
    }

    /// Find a port with no current loopback listener.
    ///
    /// # Errors
    ///
    /// Returns [`ProvisionError::Exhausted`] after the attempt bound; the
    /// enclosing backend is skipped, the run continues.
    pub async fn find_unused_port(&self) -> Result<u16> {
        for attempt in 0..MAX_ATTEMPTS {
            let port = rand::rng().random_range(PORT_RANGE.0..=PORT_RANGE.1);
            if self.is_listening(port).await {
                trace!(port, attempt, "candidate port already has a listener");
                continue;
            }
            debug!(port, attempt, "allocated unused port");
            return Ok(port);
        }
        Err(ProvisionError::Exhausted {
            attempts: MAX_ATTEMPTS,
        })
    }

    /// Whether something currently accepts connections on loopback `port`.
    ///
    /// Connection refused or timeout both mean "nothing listening".
    pub async fn is_listening(&self, port: u16) -> bool {
        let addr = SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), port);
        matches!(
            tokio::time::timeout(self.connect_timeout, TcpStream::connect(addr)).await,
            Ok(Ok(_))
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::TcpListener;

    #[tokio::test]
    async fn allocated_port_has_no_listener() {
        let allocator = PortAllocator::default();
        let port = allocator.find_unused_port().await.unwrap();
        assert!((PORT_RANGE.0..=PORT_RANGE.1).contains(&port));
        assert!(!allocator.is_listening(port).await);
        // A connect attempt right after allocation must fail.
        assert!(
            std::net::TcpStream::connect_timeout(
                &SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), port),
                Duration::from_millis(250),
            )
            .is_err()
        );
    }

    #[tokio::test]
    async fn bound_port_is_reported_listening() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        let allocator = PortAllocator::default();
        assert!(allocator.is_listening(port).await);
        drop(listener);
    }
}
