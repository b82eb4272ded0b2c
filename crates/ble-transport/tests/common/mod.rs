//! In-memory radio connecting several transports for integration tests

#![allow(dead_code)]

use async_trait::async_trait;
use ble_transport::{
    ConnectionManager, LinkAdapter, LinkHandle, LinkId, PeerId, Role, TransportError,
    TransportResult,
};
use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// A frame on its way to the node that owns the other end of a link
#[derive(Debug)]
pub struct Delivery {
    pub from: PeerId,
    pub role: Role,
    pub frame: Vec<u8>,
}

struct NodeEnds {
    incoming: mpsc::UnboundedSender<LinkHandle>,
    frames: mpsc::UnboundedSender<Delivery>,
}

/// Where frames written on a link end up
struct Route {
    to: PeerId,
    from: PeerId,
    role: Role,
}

#[derive(Default)]
struct Air {
    nodes: HashMap<PeerId, NodeEnds>,
    routes: HashMap<LinkId, Route>,
    connect_failures: HashMap<PeerId, u32>,
    connect_attempts: HashMap<PeerId, u32>,
    closed: Vec<LinkHandle>,
}

pub struct Radio {
    air: Mutex<Air>,
    unit_size: u32,
}

impl Radio {
    /// A radio whose links settle on at most `unit_size`
    pub fn new(unit_size: u32) -> Arc<Self> {
        Arc::new(Self {
            air: Mutex::new(Air::default()),
            unit_size,
        })
    }

    /// Register a node and hand back its link adapter plus its inbound frame feed
    pub fn attach(self: &Arc<Self>, local: &str) -> (Arc<RadioAdapter>, mpsc::UnboundedReceiver<Delivery>) {
        let local = PeerId::from(local);
        let (incoming_tx, incoming_rx) = mpsc::unbounded_channel();
        let (frames_tx, frames_rx) = mpsc::unbounded_channel();
        self.air.lock().unwrap().nodes.insert(
            local.clone(),
            NodeEnds {
                incoming: incoming_tx,
                frames: frames_tx,
            },
        );
        let adapter = Arc::new(RadioAdapter {
            radio: Arc::clone(self),
            local,
            incoming: tokio::sync::Mutex::new(incoming_rx),
        });
        (adapter, frames_rx)
    }

    pub fn fail_connects(&self, peer: &str, count: u32) {
        self.air
            .lock()
            .unwrap()
            .connect_failures
            .insert(PeerId::from(peer), count);
    }

    pub fn connect_attempts(&self, peer: &str) -> u32 {
        self.air
            .lock()
            .unwrap()
            .connect_attempts
            .get(&PeerId::from(peer))
            .copied()
            .unwrap_or(0)
    }

    pub fn closed_links(&self) -> Vec<LinkHandle> {
        self.air.lock().unwrap().closed.clone()
    }
}

pub struct RadioAdapter {
    radio: Arc<Radio>,
    local: PeerId,
    incoming: tokio::sync::Mutex<mpsc::UnboundedReceiver<LinkHandle>>,
}

#[async_trait]
impl LinkAdapter for RadioAdapter {
    async fn connect_outgoing(&self, peer: &PeerId) -> TransportResult<LinkHandle> {
        let mut air = self.radio.air.lock().unwrap();
        *air.connect_attempts.entry(peer.clone()).or_insert(0) += 1;
        if let Some(remaining) = air.connect_failures.get_mut(peer) {
            if *remaining > 0 {
                *remaining -= 1;
                return Err(TransportError::ConnectionFailed(format!(
                    "{} out of range",
                    peer
                )));
            }
        }

        let link = LinkHandle::new(peer.clone());
        let remote = LinkHandle::new(self.local.clone());
        air.routes.insert(
            link.id,
            Route {
                to: peer.clone(),
                from: self.local.clone(),
                role: Role::Incoming,
            },
        );
        air.routes.insert(
            remote.id,
            Route {
                to: self.local.clone(),
                from: peer.clone(),
                role: Role::Outgoing,
            },
        );
        // Peers without a node are silent: they accept links and swallow frames
        if let Some(node) = air.nodes.get(peer) {
            let _ = node.incoming.send(remote);
        }
        Ok(link)
    }

    async fn accept_incoming(&self) -> Option<LinkHandle> {
        self.incoming.lock().await.recv().await
    }

    async fn write_frame(&self, link: &LinkHandle, frame: &[u8]) -> TransportResult<()> {
        let air = self.radio.air.lock().unwrap();
        let Some(route) = air.routes.get(&link.id) else {
            return Err(TransportError::OperationFailed(format!(
                "link {} is closed",
                link.id
            )));
        };
        if let Some(node) = air.nodes.get(&route.to) {
            let _ = node.frames.send(Delivery {
                from: route.from.clone(),
                role: route.role,
                frame: frame.to_vec(),
            });
        }
        Ok(())
    }

    async fn negotiate_unit_size(&self, _link: &LinkHandle, requested: u32) -> TransportResult<u32> {
        Ok(requested.min(self.radio.unit_size))
    }

    async fn close_link(&self, link: &LinkHandle) -> TransportResult<()> {
        let mut air = self.radio.air.lock().unwrap();
        air.routes.remove(&link.id);
        air.closed.push(link.clone());
        Ok(())
    }
}

/// Feed a node's inbound frames into its manager
pub fn pump(manager: Arc<ConnectionManager>, mut frames: mpsc::UnboundedReceiver<Delivery>) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(delivery) = frames.recv().await {
            let _ = manager
                .on_frame_received(&delivery.from, delivery.role, &delivery.frame)
                .await;
        }
    })
}

/// Poll `condition` until it holds or two seconds pass
pub async fn wait_until<F, Fut>(mut condition: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    for _ in 0..200 {
        if condition().await {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    false
}
