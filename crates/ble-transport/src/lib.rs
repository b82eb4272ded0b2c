//! Reliable message transport over BLE-style links
//!
//! This crate splits payloads into framed fragments sized to each link's
//! negotiated transmission unit, serializes every link primitive through a
//! per-link operation scheduler, reassembles fragments per sender, and manages
//! a bounded pool of peers reachable in two independent roles.

pub mod adapter;
pub mod config;
pub mod error;
pub mod fragment;
pub mod logging;
pub mod manager;
pub mod observer;
pub mod peer;
pub mod reassembly;
pub mod role;
pub mod scheduler;

#[cfg(test)]
mod testing;

// Re-export main types
pub use adapter::{LinkAdapter, LinkHandle, LinkId};
pub use config::TransportConfig;
pub use error::{FrameError, TransportError, TransportResult};
pub use fragment::{fragment, FrameHeader, FrameType, Fragmenter, HEADER_SIZE};
pub use manager::{AdmissionDecision, ConnectionManager, IgnoreReason, MaintenanceReport};
pub use observer::{ChannelObserver, ConnectionState, NoopObserver, TransportEvent, TransportObserver};
pub use peer::{PeerId, PeerSnapshot, PeerState};
pub use reassembly::{Reassembler, ReassemblyEvent, ReassemblyStats};
pub use role::{Role, RoleAdapter};
pub use scheduler::{Operation, OperationOutput, OperationScheduler};
