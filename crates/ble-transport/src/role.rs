//! One side of a peer connection
//!
//! A peer can be reached over two independent links at once: the one we
//! initiated (outgoing) and the one it initiated (incoming). Each link gets a
//! [`RoleAdapter`] that owns the link's operation scheduler and fragmenter
//! while sharing the manager-wide reassembler, keyed by peer.

use crate::adapter::{LinkAdapter, LinkHandle};
use crate::error::{TransportError, TransportResult};
use crate::fragment::Fragmenter;
use crate::observer::TransportObserver;
use crate::peer::PeerId;
use crate::reassembly::Reassembler;
use crate::scheduler::{Operation, OperationOutput, OperationScheduler};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

/// Which side initiated a link
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Outgoing,
    Incoming,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::Outgoing => f.write_str("outgoing"),
            Role::Incoming => f.write_str("incoming"),
        }
    }
}

pub struct RoleAdapter {
    peer: PeerId,
    role: Role,
    scheduler: OperationScheduler,
    /// Held for the whole of a send, so also the send lock
    fragmenter: Mutex<Fragmenter>,
    unit_size: AtomicU32,
    reassembler: Arc<Reassembler>,
    observer: Arc<dyn TransportObserver>,
}

impl RoleAdapter {
    pub fn new(
        link: LinkHandle,
        role: Role,
        link_adapter: Arc<dyn LinkAdapter>,
        reassembler: Arc<Reassembler>,
        observer: Arc<dyn TransportObserver>,
        unit_size: u32,
        op_timeout: Duration,
    ) -> TransportResult<Self> {
        let fragmenter = Fragmenter::new(unit_size)?;
        let peer = link.peer.clone();
        let scheduler = OperationScheduler::new(link, link_adapter, op_timeout);

        debug!("Created {} role adapter for {} (unit size {})", role, peer, unit_size);

        Ok(Self {
            peer,
            role,
            scheduler,
            fragmenter: Mutex::new(fragmenter),
            unit_size: AtomicU32::new(unit_size),
            reassembler,
            observer,
        })
    }

    pub fn peer(&self) -> &PeerId {
        &self.peer
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn link(&self) -> &LinkHandle {
        self.scheduler.link()
    }

    /// Unit size currently used for outbound frames
    pub fn unit_size(&self) -> u32 {
        self.unit_size.load(Ordering::SeqCst)
    }

    pub fn scheduler(&self) -> &OperationScheduler {
        &self.scheduler
    }

    /// Fragment `payload` and write every frame in order
    ///
    /// Succeeds only if every frame was written. The first failing frame
    /// aborts the rest of the payload.
    pub async fn send(&self, payload: &[u8]) -> TransportResult<()> {
        let fragmenter = self.fragmenter.lock().await;
        let frames = fragmenter.fragment(payload)?;
        let total = frames.len();

        debug!(
            "Sending {} bytes to {} over {} role in {} fragment(s) (unit size {})",
            payload.len(),
            self.peer,
            self.role,
            total,
            fragmenter.unit_size()
        );

        for (index, frame) in frames.into_iter().enumerate() {
            if let Err(e) = self.scheduler.enqueue(Operation::Write(frame)).await {
                warn!(
                    "Send to {} aborted at fragment {}/{}: {}",
                    self.peer,
                    index + 1,
                    total,
                    e
                );
                return Err(e);
            }
        }

        drop(fragmenter);
        Ok(())
    }

    pub async fn discover_capabilities(&self) -> TransportResult<()> {
        self.scheduler
            .enqueue(Operation::DiscoverCapabilities)
            .await
            .map(|_| ())
    }

    pub async fn enable_notifications(&self) -> TransportResult<()> {
        self.scheduler
            .enqueue(Operation::EnableNotifications)
            .await
            .map(|_| ())
    }

    /// Negotiate a unit size through the scheduler and apply the result
    pub async fn negotiate_unit_size(&self, requested: u32) -> TransportResult<u32> {
        match self
            .scheduler
            .enqueue(Operation::NegotiateUnitSize(requested))
            .await?
        {
            OperationOutput::UnitSize(negotiated) => {
                self.set_unit_size(negotiated).await?;
                Ok(negotiated)
            }
            other => Err(TransportError::OperationFailed(format!(
                "unexpected negotiation result: {:?}",
                other
            ))),
        }
    }

    /// Record a unit size settled by either side; waits for any send in progress
    pub async fn set_unit_size(&self, unit_size: u32) -> TransportResult<()> {
        let mut fragmenter = self.fragmenter.lock().await;
        fragmenter.update_unit_size(unit_size)?;
        self.unit_size.store(unit_size, Ordering::SeqCst);
        info!(
            "Unit size for {} ({} role) set to {}",
            self.peer, self.role, unit_size
        );
        Ok(())
    }

    /// Feed an inbound frame to the reassembler
    ///
    /// Returns true when the frame completed a payload that was delivered
    /// upward. Malformed frames are logged and dropped.
    pub fn on_frame_received(&self, frame: &[u8]) -> bool {
        match self.reassembler.receive(frame, &self.peer) {
            Ok(Some(payload)) => {
                debug!(
                    "Delivering {} byte payload from {} ({} role)",
                    payload.len(),
                    self.peer,
                    self.role
                );
                self.observer.on_data_received(&self.peer, payload);
                true
            }
            Ok(None) => false,
            Err(e) => {
                debug!(
                    "Frame from {} on {} role dropped: {}",
                    self.peer, self.role, e
                );
                false
            }
        }
    }

    /// Cancel every pending operation on this role's link
    pub fn shutdown(&self) {
        self.scheduler.shutdown();
    }
}
