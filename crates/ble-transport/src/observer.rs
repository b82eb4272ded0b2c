//! Upstream delivery of payloads and connection state changes

use crate::peer::PeerId;
use serde::Serialize;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::debug;

/// Connection state reported to the upper layer
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum ConnectionState {
    Discovered,
    Connecting,
    Connected { outgoing: bool, incoming: bool },
    Blacklisted { remaining: Duration },
    Lost,
}

/// Receiver of everything the transport hands upward
///
/// Callbacks run on transport tasks and must not block.
pub trait TransportObserver: Send + Sync {
    fn on_data_received(&self, peer: &PeerId, data: Vec<u8>);

    fn on_connection_state_changed(&self, peer: &PeerId, state: ConnectionState);
}

/// Event forwarded by [`ChannelObserver`]
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum TransportEvent {
    DataReceived { peer: PeerId, data: Vec<u8> },
    ConnectionStateChanged { peer: PeerId, state: ConnectionState },
}

impl TransportEvent {
    pub fn peer(&self) -> &PeerId {
        match self {
            TransportEvent::DataReceived { peer, .. } => peer,
            TransportEvent::ConnectionStateChanged { peer, .. } => peer,
        }
    }
}

/// Observer that forwards events into an mpsc channel
pub struct ChannelObserver {
    tx: mpsc::UnboundedSender<TransportEvent>,
}

impl ChannelObserver {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<TransportEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    fn forward(&self, event: TransportEvent) {
        if self.tx.send(event).is_err() {
            debug!("Transport event dropped: receiver closed");
        }
    }
}

impl TransportObserver for ChannelObserver {
    fn on_data_received(&self, peer: &PeerId, data: Vec<u8>) {
        self.forward(TransportEvent::DataReceived {
            peer: peer.clone(),
            data,
        });
    }

    fn on_connection_state_changed(&self, peer: &PeerId, state: ConnectionState) {
        self.forward(TransportEvent::ConnectionStateChanged {
            peer: peer.clone(),
            state,
        });
    }
}

/// Observer that discards everything
pub struct NoopObserver;

impl TransportObserver for NoopObserver {
    fn on_data_received(&self, _peer: &PeerId, _data: Vec<u8>) {}

    fn on_connection_state_changed(&self, _peer: &PeerId, _state: ConnectionState) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_channel_observer_forwards_in_order() {
        let (observer, mut rx) = ChannelObserver::new();
        let peer = PeerId::from("AA:BB");

        observer.on_connection_state_changed(&peer, ConnectionState::Connecting);
        observer.on_data_received(&peer, b"hello".to_vec());

        assert_eq!(
            rx.try_recv().unwrap(),
            TransportEvent::ConnectionStateChanged {
                peer: peer.clone(),
                state: ConnectionState::Connecting
            }
        );
        let event = rx.try_recv().unwrap();
        assert_eq!(event.peer(), &peer);
        assert!(matches!(event, TransportEvent::DataReceived { data, .. } if data == b"hello"));
    }

    #[test]
    fn test_closed_receiver_is_harmless() {
        let (observer, rx) = ChannelObserver::new();
        drop(rx);
        observer.on_data_received(&PeerId::from("AA:BB"), vec![1]);
    }

    #[test]
    fn test_event_serialization() {
        let event = TransportEvent::ConnectionStateChanged {
            peer: PeerId::from("AA:BB"),
            state: ConnectionState::Connected {
                outgoing: true,
                incoming: false,
            },
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["event"], "connection_state_changed");
        assert_eq!(json["peer"], "AA:BB");
        assert_eq!(json["state"]["state"], "connected");
        assert_eq!(json["state"]["outgoing"], true);
    }
}
