mod error;
mod ports;

pub use error::{ErrorKind, LaunchError, PortError, TunnelError};
pub use ports::{
    find_open_port, find_open_port_excluding, PortAllocator, RangePortAllocator,
    DEFAULT_PORT_RANGE, LOCAL_HOST,
};
