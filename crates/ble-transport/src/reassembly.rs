//! Per-sender reassembly of fragmented payloads
//!
//! Fragments may arrive in any order and on either role of a peer, so
//! buffers are keyed by sender only. A START fragment opens (or replaces) a
//! sender's buffer and arms a timeout; fragments arriving before their START
//! are refused with [`FrameError::MissingStart`] but remembered briefly so
//! the START can adopt them when it shows up.
//!
//! A transfer that ends without completing (timed out, superseded or
//! discarded on a total mismatch) leaves a guard on its total for one timeout
//! window. Stray fragments of that total are refused rather than remembered,
//! so the tail of a dead transfer never ends up inside the next one.

use crate::error::FrameError;
use crate::fragment::{FrameHeader, FrameType, MAX_FRAGMENTS};
use crate::peer::PeerId;
use dashmap::DashMap;
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Default time a partial transfer may wait for its remaining fragments
pub const DEFAULT_REASSEMBLY_TIMEOUT: Duration = Duration::from_secs(30);

/// Early arrivals remembered per sender, at most one transfer's worth
const MAX_EARLY_FRAGMENTS: usize = MAX_FRAGMENTS;

const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Observability events raised by the reassembler
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReassemblyEvent {
    Completed {
        sender: PeerId,
        bytes: usize,
        fragments: u16,
    },
    TimedOut {
        sender: PeerId,
        received: usize,
        total: u16,
    },
    Superseded {
        sender: PeerId,
        received: usize,
        total: u16,
    },
    Duplicate {
        sender: PeerId,
        sequence: u16,
    },
    Rejected {
        sender: PeerId,
        error: FrameError,
    },
}

/// Counters since creation
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ReassemblyStats {
    pub fragments_received: u64,
    pub packets_reassembled: u64,
    pub packets_timed_out: u64,
    pub duplicates: u64,
    pub rejected: u64,
    pub pending_buffers: usize,
}

#[derive(Default)]
struct Counters {
    fragments_received: AtomicU64,
    packets_reassembled: AtomicU64,
    packets_timed_out: AtomicU64,
    duplicates: AtomicU64,
    rejected: AtomicU64,
}

struct ReassemblyBuffer {
    transfer_id: u64,
    total: u16,
    received: BTreeMap<u16, Vec<u8>>,
    first_arrival: Instant,
    timeout: CancellationToken,
}

struct EarlyFragment {
    total: u16,
    data: Vec<u8>,
    arrived: Instant,
}

/// Total of a transfer that ended without completing
struct Retired {
    total: u16,
    until: Instant,
}

#[derive(Default)]
struct SenderState {
    buffer: Option<ReassemblyBuffer>,
    early: BTreeMap<u16, EarlyFragment>,
    retired: Option<Retired>,
}

impl SenderState {
    fn is_empty(&self) -> bool {
        self.buffer.is_none() && self.early.is_empty() && self.retired.is_none()
    }

    /// Forget early arrivals and guards older than the timeout
    fn prune(&mut self, now: Instant, timeout: Duration) {
        self.early
            .retain(|_, f| now.saturating_duration_since(f.arrived) < timeout);
        if self.retired.as_ref().is_some_and(|r| now >= r.until) {
            self.retired = None;
        }
    }

    /// Refuse stray fragments of `total` for one timeout window
    fn retire(&mut self, total: u16, now: Instant, timeout: Duration) {
        // Early arrivals of that total may belong to the dead transfer
        self.early.retain(|_, f| f.total != total);
        self.retired = Some(Retired {
            total,
            until: now + timeout,
        });
    }

    fn is_retired(&self, total: u16, now: Instant) -> bool {
        self.retired
            .as_ref()
            .is_some_and(|r| r.total == total && now < r.until)
    }
}

/// Shared handles the timeout tasks need after `receive` returns
#[derive(Clone)]
struct Shared {
    states: Arc<DashMap<PeerId, SenderState>>,
    counters: Arc<Counters>,
    events: broadcast::Sender<ReassemblyEvent>,
    timeout: Duration,
}

impl Shared {
    fn emit(&self, event: ReassemblyEvent) {
        // No subscribers is fine
        let _ = self.events.send(event);
    }

    /// Drop the sender's buffer if it still belongs to `transfer_id`
    fn expire(&self, sender: &PeerId, transfer_id: u64) -> bool {
        let expired = match self.states.get_mut(sender) {
            Some(mut state) => {
                if state
                    .buffer
                    .as_ref()
                    .is_some_and(|b| b.transfer_id == transfer_id)
                {
                    let buffer = state.buffer.take();
                    if let Some(buffer) = buffer.as_ref() {
                        state.retire(buffer.total, Instant::now(), self.timeout);
                    }
                    buffer
                } else {
                    None
                }
            }
            None => None,
        };

        let Some(buffer) = expired else {
            return false;
        };

        buffer.timeout.cancel();
        self.states.remove_if(sender, |_, s| s.is_empty());
        self.counters.packets_timed_out.fetch_add(1, Ordering::Relaxed);

        warn!(
            "Reassembly timeout from {} ({}/{} fragments received, age: {:?})",
            sender,
            buffer.received.len(),
            buffer.total,
            buffer.first_arrival.elapsed()
        );
        self.emit(ReassemblyEvent::TimedOut {
            sender: sender.clone(),
            received: buffer.received.len(),
            total: buffer.total,
        });
        true
    }
}

/// Reassembles fragments into payloads, one buffer per sender
pub struct Reassembler {
    shared: Shared,
    next_transfer: AtomicU64,
}

impl Reassembler {
    pub fn new(timeout: Duration) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            shared: Shared {
                states: Arc::new(DashMap::new()),
                counters: Arc::new(Counters::default()),
                events,
                timeout,
            },
            next_transfer: AtomicU64::new(1),
        }
    }

    pub fn timeout(&self) -> Duration {
        self.shared.timeout
    }

    /// Subscribe to reassembly events
    pub fn subscribe(&self) -> broadcast::Receiver<ReassemblyEvent> {
        self.shared.events.subscribe()
    }

    /// Ingest one frame from `sender`
    ///
    /// Returns the assembled payload once the final missing fragment arrives,
    /// `None` while the transfer is still in progress or the frame was a
    /// duplicate.
    pub fn receive(&self, frame: &[u8], sender: &PeerId) -> Result<Option<Vec<u8>>, FrameError> {
        self.shared
            .counters
            .fragments_received
            .fetch_add(1, Ordering::Relaxed);

        let (header, data) = match parse_checked(frame) {
            Ok(parsed) => parsed,
            Err(e) => return Err(self.reject(sender, e)),
        };

        debug!(
            "Received {:?} fragment {}/{} from {} ({} bytes)",
            header.frame_type,
            header.sequence + 1,
            header.total,
            sender,
            data.len()
        );

        let outcome = {
            let mut state = self.shared.states.entry(sender.clone()).or_default();
            let now = Instant::now();
            state.prune(now, self.shared.timeout);

            if header.sequence == 0 {
                self.ingest_start(&mut state, sender, header, data, now)
            } else {
                self.ingest_fragment(&mut state, sender, header, data, now)
            }
        };

        self.shared.states.remove_if(sender, |_, s| s.is_empty());

        match outcome {
            Ingest::Complete(payload, fragments) => {
                self.shared
                    .counters
                    .packets_reassembled
                    .fetch_add(1, Ordering::Relaxed);
                debug!(
                    "Reassembled {} byte payload from {} fragments (sender: {})",
                    payload.len(),
                    fragments,
                    sender
                );
                self.shared.emit(ReassemblyEvent::Completed {
                    sender: sender.clone(),
                    bytes: payload.len(),
                    fragments,
                });
                Ok(Some(payload))
            }
            Ingest::Pending => Ok(None),
            Ingest::Duplicate(sequence) => {
                self.shared
                    .counters
                    .duplicates
                    .fetch_add(1, Ordering::Relaxed);
                debug!("Duplicate fragment {} from {} (ignored)", sequence, sender);
                self.shared.emit(ReassemblyEvent::Duplicate {
                    sender: sender.clone(),
                    sequence,
                });
                Ok(None)
            }
            Ingest::Rejected(e) => Err(self.reject(sender, e)),
        }
    }

    fn ingest_start(
        &self,
        state: &mut SenderState,
        sender: &PeerId,
        header: FrameHeader,
        data: &[u8],
        now: Instant,
    ) -> Ingest {
        if let Some(buffer) = state.buffer.as_ref() {
            let repeated = buffer.total == header.total
                && buffer.received.get(&0).is_some_and(|d| d.as_slice() == data);
            if repeated {
                return Ingest::Duplicate(0);
            }
        }

        if let Some(stale) = state.buffer.take() {
            stale.timeout.cancel();
            state.retire(stale.total, now, self.shared.timeout);
            info!(
                "New transfer from {} supersedes partial one ({}/{} fragments)",
                sender,
                stale.received.len(),
                stale.total
            );
            self.shared.emit(ReassemblyEvent::Superseded {
                sender: sender.clone(),
                received: stale.received.len(),
                total: stale.total,
            });
        }

        let transfer_id = self.next_transfer.fetch_add(1, Ordering::Relaxed);
        let mut received = BTreeMap::new();
        received.insert(0, data.to_vec());

        let mut adopted_count = 0usize;
        for (sequence, early) in std::mem::take(&mut state.early) {
            if early.total == header.total {
                received.insert(sequence, early.data);
                adopted_count += 1;
            }
        }
        if adopted_count > 0 {
            debug!(
                "Adopted {} early fragments from {} into new transfer",
                adopted_count, sender
            );
        }

        let buffer = ReassemblyBuffer {
            transfer_id,
            total: header.total,
            received,
            first_arrival: now,
            timeout: self.arm_timeout(sender.clone(), transfer_id),
        };
        state.buffer = Some(buffer);

        Self::check_complete(state)
    }

    fn ingest_fragment(
        &self,
        state: &mut SenderState,
        sender: &PeerId,
        header: FrameHeader,
        data: &[u8],
        now: Instant,
    ) -> Ingest {
        let Some(buffer) = state.buffer.as_mut() else {
            if state.is_retired(header.total, now) {
                debug!(
                    "Fragment {}/{} from {} matches an abandoned transfer, not kept",
                    header.sequence + 1,
                    header.total,
                    sender
                );
            } else if state.early.len() < MAX_EARLY_FRAGMENTS {
                state
                    .early
                    .entry(header.sequence)
                    .or_insert_with(|| EarlyFragment {
                        total: header.total,
                        data: data.to_vec(),
                        arrived: now,
                    });
            }
            return Ingest::Rejected(FrameError::MissingStart {
                sequence: header.sequence,
                total: header.total,
            });
        };

        if buffer.total != header.total {
            let expected = buffer.total;
            if let Some(dropped) = state.buffer.take() {
                dropped.timeout.cancel();
                state.retire(dropped.total, now, self.shared.timeout);
            }
            warn!(
                "Fragment total mismatch for {}: expected {}, got {}. Discarding buffer.",
                sender, expected, header.total
            );
            return Ingest::Rejected(FrameError::TotalMismatch {
                expected,
                got: header.total,
            });
        }

        if buffer.received.contains_key(&header.sequence) {
            return Ingest::Duplicate(header.sequence);
        }
        buffer.received.insert(header.sequence, data.to_vec());

        Self::check_complete(state)
    }

    fn check_complete(state: &mut SenderState) -> Ingest {
        let complete = state
            .buffer
            .as_ref()
            .is_some_and(|b| b.received.len() == b.total as usize);
        if !complete {
            return Ingest::Pending;
        }

        match state.buffer.take() {
            Some(buffer) => {
                buffer.timeout.cancel();
                let fragments = buffer.total;
                let payload = buffer.received.into_values().flatten().collect();
                Ingest::Complete(payload, fragments)
            }
            None => Ingest::Pending,
        }
    }

    fn reject(&self, sender: &PeerId, error: FrameError) -> FrameError {
        self.shared.counters.rejected.fetch_add(1, Ordering::Relaxed);
        warn!("Dropping fragment from {}: {}", sender, error);
        self.shared.emit(ReassemblyEvent::Rejected {
            sender: sender.clone(),
            error: error.clone(),
        });
        error
    }

    /// Start the timeout task for a buffer
    ///
    /// Outside a tokio runtime no task is spawned and expiry is left to
    /// [`Reassembler::cleanup_stale`].
    fn arm_timeout(&self, sender: PeerId, transfer_id: u64) -> CancellationToken {
        let token = CancellationToken::new();
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            return token;
        };

        let cancelled = token.clone();
        let shared = self.shared.clone();
        let timeout = self.shared.timeout;
        handle.spawn(async move {
            tokio::select! {
                _ = cancelled.cancelled() => {}
                _ = tokio::time::sleep(timeout) => {
                    shared.expire(&sender, transfer_id);
                }
            }
        });
        token
    }

    /// Drop buffers and early arrivals older than the timeout
    pub fn cleanup_stale(&self) -> usize {
        let now = Instant::now();
        let mut stale = Vec::new();
        for mut entry in self.shared.states.iter_mut() {
            entry.prune(now, self.shared.timeout);
            if let Some(buffer) = entry.buffer.as_ref() {
                if now.saturating_duration_since(buffer.first_arrival) >= self.shared.timeout {
                    stale.push((entry.key().clone(), buffer.transfer_id));
                }
            }
        }

        let removed = stale
            .iter()
            .filter(|(sender, transfer_id)| self.shared.expire(sender, *transfer_id))
            .count();
        self.shared.states.retain(|_, s| !s.is_empty());

        if removed > 0 {
            info!("Cleaned {} stale reassembly buffer(s)", removed);
        }
        removed
    }

    /// Drop everything buffered for one sender
    pub fn clear_sender(&self, sender: &PeerId) -> bool {
        match self.shared.states.remove(sender) {
            Some((_, state)) => {
                if let Some(buffer) = state.buffer {
                    buffer.timeout.cancel();
                    debug!(
                        "Cleared reassembly buffer for {} ({}/{} fragments)",
                        sender,
                        buffer.received.len(),
                        buffer.total
                    );
                }
                true
            }
            None => false,
        }
    }

    /// Drop every buffer and cancel every timeout
    pub fn clear_all(&self) {
        for entry in self.shared.states.iter() {
            if let Some(buffer) = entry.buffer.as_ref() {
                buffer.timeout.cancel();
            }
        }
        let count = self.shared.states.len();
        self.shared.states.clear();
        if count > 0 {
            info!("Cleared reassembly state for {} sender(s)", count);
        }
    }

    /// Whether a transfer from `sender` is in progress
    pub fn has_pending(&self, sender: &PeerId) -> bool {
        self.shared
            .states
            .get(sender)
            .is_some_and(|s| s.buffer.is_some())
    }

    pub fn pending_buffers(&self) -> usize {
        self.shared
            .states
            .iter()
            .filter(|s| s.buffer.is_some())
            .count()
    }

    pub fn stats(&self) -> ReassemblyStats {
        let c = &self.shared.counters;
        ReassemblyStats {
            fragments_received: c.fragments_received.load(Ordering::Relaxed),
            packets_reassembled: c.packets_reassembled.load(Ordering::Relaxed),
            packets_timed_out: c.packets_timed_out.load(Ordering::Relaxed),
            duplicates: c.duplicates.load(Ordering::Relaxed),
            rejected: c.rejected.load(Ordering::Relaxed),
            pending_buffers: self.pending_buffers(),
        }
    }
}

impl Default for Reassembler {
    fn default() -> Self {
        Self::new(DEFAULT_REASSEMBLY_TIMEOUT)
    }
}

enum Ingest {
    Complete(Vec<u8>, u16),
    Pending,
    Duplicate(u16),
    Rejected(FrameError),
}

/// Parse a frame and check its type against its position
fn parse_checked(frame: &[u8]) -> Result<(FrameHeader, &[u8]), FrameError> {
    let (header, data) = FrameHeader::parse(frame)?;
    let expected = FrameType::for_position(header.sequence, header.total);
    // A lone fragment is both first and last
    let single = header.total == 1 && header.frame_type == FrameType::End;
    if header.frame_type != expected && !single {
        return Err(FrameError::InvalidType(header.frame_type as u8));
    }
    Ok((header, data))
}
