//! Mock link adapter shared by the unit tests

use crate::adapter::{LinkAdapter, LinkHandle};
use crate::error::{TransportError, TransportResult};
use crate::peer::PeerId;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{mpsc, Notify};

pub(crate) struct MockLinkAdapter {
    write_delay: Duration,
    negotiated_unit_size: Option<u32>,
    fail_write_at: Option<usize>,
    writes: AtomicUsize,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
    written: Mutex<Vec<(PeerId, Vec<u8>)>>,
    closed: Mutex<Vec<LinkHandle>>,
    connect_attempts: Mutex<HashMap<PeerId, u32>>,
    /// Remaining connect failures per peer
    connect_failures: Mutex<HashMap<PeerId, u32>>,
    /// Connects to these peers wait until the gate is opened
    connect_gates: Mutex<HashMap<PeerId, Arc<Notify>>>,
    incoming_tx: mpsc::UnboundedSender<LinkHandle>,
    incoming_rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<LinkHandle>>,
}

impl MockLinkAdapter {
    pub(crate) fn new() -> Self {
        let (incoming_tx, incoming_rx) = mpsc::unbounded_channel();
        Self {
            write_delay: Duration::ZERO,
            negotiated_unit_size: None,
            fail_write_at: None,
            writes: AtomicUsize::new(0),
            in_flight: AtomicUsize::new(0),
            max_in_flight: AtomicUsize::new(0),
            written: Mutex::new(Vec::new()),
            closed: Mutex::new(Vec::new()),
            connect_attempts: Mutex::new(HashMap::new()),
            connect_failures: Mutex::new(HashMap::new()),
            connect_gates: Mutex::new(HashMap::new()),
            incoming_tx,
            incoming_rx: tokio::sync::Mutex::new(incoming_rx),
        }
    }

    pub(crate) fn with_write_delay(mut self, delay: Duration) -> Self {
        self.write_delay = delay;
        self
    }

    /// Fail the write with this zero-based index
    pub(crate) fn with_failing_write(mut self, index: usize) -> Self {
        self.fail_write_at = Some(index);
        self
    }

    /// Settle every negotiation on this size instead of the requested one
    pub(crate) fn with_unit_size(mut self, unit_size: u32) -> Self {
        self.negotiated_unit_size = Some(unit_size);
        self
    }

    pub(crate) fn fail_connects(&self, peer: &PeerId, count: u32) {
        self.connect_failures
            .lock()
            .unwrap()
            .insert(peer.clone(), count);
    }

    /// Hold the next connect to `peer` until the returned gate is notified
    pub(crate) fn gate_connect(&self, peer: &PeerId) -> Arc<Notify> {
        let gate = Arc::new(Notify::new());
        self.connect_gates
            .lock()
            .unwrap()
            .insert(peer.clone(), Arc::clone(&gate));
        gate
    }

    pub(crate) fn connect_attempts(&self, peer: &PeerId) -> u32 {
        self.connect_attempts
            .lock()
            .unwrap()
            .get(peer)
            .copied()
            .unwrap_or(0)
    }

    pub(crate) fn push_incoming(&self, link: LinkHandle) {
        self.incoming_tx.send(link).unwrap();
    }

    pub(crate) fn written_frames(&self) -> Vec<Vec<u8>> {
        self.written
            .lock()
            .unwrap()
            .iter()
            .map(|(_, frame)| frame.clone())
            .collect()
    }

    pub(crate) fn closed_links(&self) -> Vec<LinkHandle> {
        self.closed.lock().unwrap().clone()
    }

    pub(crate) fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl LinkAdapter for MockLinkAdapter {
    async fn connect_outgoing(&self, peer: &PeerId) -> TransportResult<LinkHandle> {
        *self
            .connect_attempts
            .lock()
            .unwrap()
            .entry(peer.clone())
            .or_insert(0) += 1;

        let gate = self.connect_gates.lock().unwrap().remove(peer);
        if let Some(gate) = gate {
            gate.notified().await;
        }

        let should_fail = {
            let mut failures = self.connect_failures.lock().unwrap();
            match failures.get_mut(peer) {
                Some(remaining) if *remaining > 0 => {
                    *remaining -= 1;
                    true
                }
                _ => false,
            }
        };

        if should_fail {
            return Err(TransportError::ConnectionFailed(format!(
                "{} did not answer",
                peer
            )));
        }
        Ok(LinkHandle::new(peer.clone()))
    }

    async fn accept_incoming(&self) -> Option<LinkHandle> {
        self.incoming_rx.lock().await.recv().await
    }

    async fn write_frame(&self, link: &LinkHandle, frame: &[u8]) -> TransportResult<()> {
        let now_in_flight = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now_in_flight, Ordering::SeqCst);

        if !self.write_delay.is_zero() {
            tokio::time::sleep(self.write_delay).await;
        }

        let index = self.writes.fetch_add(1, Ordering::SeqCst);
        self.in_flight.fetch_sub(1, Ordering::SeqCst);

        if self.fail_write_at == Some(index) {
            return Err(TransportError::OperationFailed(format!(
                "write {} rejected by mock",
                index
            )));
        }

        self.written
            .lock()
            .unwrap()
            .push((link.peer.clone(), frame.to_vec()));
        Ok(())
    }

    async fn negotiate_unit_size(&self, _link: &LinkHandle, requested: u32) -> TransportResult<u32> {
        Ok(self
            .negotiated_unit_size
            .map(|size| size.min(requested))
            .unwrap_or(requested))
    }

    async fn close_link(&self, link: &LinkHandle) -> TransportResult<()> {
        self.closed.lock().unwrap().push(link.clone());
        Ok(())
    }
}
