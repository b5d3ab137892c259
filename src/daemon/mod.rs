// src/daemon/mod.rs
//
// Client side of the privileged local daemon that owns WireGuard interfaces,
// DNS and the routing table.

pub mod channel;
pub mod protocol;
pub mod session;

pub use channel::{DaemonConfig, DaemonControl, DaemonHandle};
pub use protocol::{ActivateParams, DaemonMessage, DaemonRequest, IpRange, StatusReport};
pub use session::{DaemonEvent, DaemonState};
