use std::collections::HashSet;
use std::net::{Ipv4Addr, TcpListener};

use rand::Rng;

use crate::error::PortError;

/// Host every forwarded tunnel listens on
pub const LOCAL_HOST: &str = "127.0.0.1";

/// Range scanned when the caller does not pick a local port
pub const DEFAULT_PORT_RANGE: (u16, u16) = (16000, 26000);

/// Find a local TCP port that can currently be bound.
///
/// Scanning starts at a random port inside `low..=high`, walks upwards and
/// wraps around to `low`, so every port in the range is tried exactly once.
/// The probe listener is closed before returning; nothing is reserved.
pub fn find_open_port(low: u16, high: u16) -> Result<u16, PortError> {
    find_open_port_excluding(low, high, &HashSet::new())
}

/// Like [`find_open_port`], but never returns a port in `reserved`.
///
/// `reserved` holds ports already promised to tunnels whose forwarder may not
/// have bound yet, so a bind probe alone would report them free.
pub fn find_open_port_excluding(
    low: u16,
    high: u16,
    reserved: &HashSet<u16>,
) -> Result<u16, PortError> {
    if low == 0 || low > high {
        return Err(PortError::InvalidRange { low, high });
    }

    let span = u32::from(high - low) + 1;
    let offset = rand::thread_rng().gen_range(0..span);

    for step in 0..span {
        let port = (u32::from(low) + (offset + step) % span) as u16;
        if reserved.contains(&port) {
            continue;
        }
        match TcpListener::bind((Ipv4Addr::LOCALHOST, port)) {
            Ok(listener) => {
                drop(listener);
                return Ok(port);
            }
            Err(e) => {
                tracing::trace!("Port {} unavailable: {}", port, e);
            }
        }
    }

    Err(PortError::Exhausted { low, high })
}

/// Source of local ports for tunnels that did not request one
pub trait PortAllocator: Send + Sync {
    /// Pick a port outside `reserved`
    fn allocate(&self, reserved: &HashSet<u16>) -> Result<u16, PortError>;
}

/// Allocates by probing a fixed port range with [`find_open_port`]
#[derive(Debug, Clone, Copy)]
pub struct RangePortAllocator {
    low: u16,
    high: u16,
}

impl RangePortAllocator {
    pub fn new(low: u16, high: u16) -> Self {
        Self { low, high }
    }

    pub fn range(&self) -> (u16, u16) {
        (self.low, self.high)
    }
}

impl Default for RangePortAllocator {
    fn default() -> Self {
        Self::new(DEFAULT_PORT_RANGE.0, DEFAULT_PORT_RANGE.1)
    }
}

impl PortAllocator for RangePortAllocator {
    fn allocate(&self, reserved: &HashSet<u16>) -> Result<u16, PortError> {
        find_open_port_excluding(self.low, self.high, reserved)
    }
}
