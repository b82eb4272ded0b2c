//! Link adapter abstraction over the platform radio stack

use crate::error::{TransportError, TransportResult};
use crate::peer::PeerId;
use async_trait::async_trait;
use std::fmt;
use uuid::Uuid;

/// Identifier of one physical link
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct LinkId(Uuid);

impl LinkId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for LinkId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for LinkId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Handle to an established link with one peer
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct LinkHandle {
    pub id: LinkId,
    pub peer: PeerId,
}

impl LinkHandle {
    pub fn new(peer: PeerId) -> Self {
        Self {
            id: LinkId::new(),
            peer,
        }
    }
}

/// Trait for platform-specific link primitives
///
/// Implementations may assume at most one primitive is outstanding per
/// [`LinkHandle`]; the operation scheduler guarantees it for every call made
/// on an established link.
#[async_trait]
pub trait LinkAdapter: Send + Sync {
    /// Open a link to a peer in the initiating role
    async fn connect_outgoing(&self, peer: &PeerId) -> TransportResult<LinkHandle>;

    /// Wait for the next link opened by a remote initiator; `None` once the radio stops accepting
    async fn accept_incoming(&self) -> Option<LinkHandle>;

    /// Write one frame to the link
    async fn write_frame(&self, link: &LinkHandle, frame: &[u8]) -> TransportResult<()>;

    /// Request a transmission unit size and return the one the link settled on
    async fn negotiate_unit_size(&self, link: &LinkHandle, requested: u32) -> TransportResult<u32>;

    /// Close the link
    async fn close_link(&self, link: &LinkHandle) -> TransportResult<()>;

    /// Read the current value exposed by the peer
    async fn read(&self, _link: &LinkHandle) -> TransportResult<Vec<u8>> {
        Err(TransportError::OperationFailed(
            "read not supported by this adapter".to_string(),
        ))
    }

    /// Subscribe to frames pushed by the peer
    async fn enable_notifications(&self, _link: &LinkHandle) -> TransportResult<()> {
        Ok(())
    }

    /// Discover the peer's transport service
    async fn discover_capabilities(&self, _link: &LinkHandle) -> TransportResult<()> {
        Ok(())
    }
}
