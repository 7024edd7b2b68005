//! Resolver configuration.

use std::time::Duration;

use crate::error::{Error, Result};

/// Limits and timers governing the scheduler.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolverConfig {
    /// Number of slots, and so the maximum number of open connections.
    pub max_connections: usize,

    /// Maximum connections to any one server. Also the number of consecutive
    /// failures after which a server is treated as unreachable.
    pub max_connections_per_server: usize,

    /// Maximum concurrent zone transfers from one server.
    pub max_transfers_per_server: usize,

    /// How long an idle connection keeps waiting for work from its own
    /// server before it may be repurposed for another one.
    pub switch_delay: Duration,

    /// How long an idle connection stays open with nothing to do.
    pub disconnect_delay: Duration,

    /// Time allowed to open a connection.
    pub connect_timeout: Duration,

    /// Time allowed between sending a query and each received message.
    pub receive_timeout: Duration,
}

impl Default for ResolverConfig {
    fn default() -> Self {
        Self {
            max_connections: 30,
            max_connections_per_server: 4,
            max_transfers_per_server: 1,
            switch_delay: Duration::from_secs(5),
            disconnect_delay: Duration::from_secs(30),
            connect_timeout: Duration::from_secs(10),
            receive_timeout: Duration::from_secs(10),
        }
    }
}

impl ResolverConfig {
    /// Check that the limits can be scheduled.
    pub fn validate(&self) -> Result<()> {
        if self.max_connections == 0 {
            return Err(Error::Config("max_connections must be at least 1".into()));
        }
        if self.max_connections_per_server == 0 {
            return Err(Error::Config(
                "max_connections_per_server must be at least 1".into(),
            ));
        }
        if self.max_transfers_per_server == 0 {
            return Err(Error::Config(
                "max_transfers_per_server must be at least 1".into(),
            ));
        }
        if self.connect_timeout.is_zero() || self.receive_timeout.is_zero() {
            return Err(Error::Config("timeouts must be non-zero".into()));
        }
        Ok(())
    }
}
