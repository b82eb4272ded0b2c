//! Connection manager
//!
//! Owns the peer pool: decides which discovered peers get an outgoing link,
//! accepts incoming links, routes outbound payloads to a role, applies the
//! retry and blacklist policy, and tears everything down on shutdown.
//!
//! The peer table lock is only held while the map is mutated. Link I/O,
//! scheduler shutdown and observer callbacks all happen after it is released.

use crate::adapter::{LinkAdapter, LinkHandle};
use crate::config::TransportConfig;
use crate::error::{TransportError, TransportResult};
use crate::observer::{ConnectionState, TransportObserver};
use crate::peer::{is_valid_signal, PeerId, PeerRecord, PeerSnapshot, RoleSlots};
use crate::reassembly::Reassembler;
use crate::role::{Role, RoleAdapter};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Why a discovery did not lead to a connection attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum IgnoreReason {
    /// The radio reported a placeholder instead of a measurement
    InvalidSignal,
    WeakSignal,
    Blacklisted,
    /// No free slot and the peer does not outscore anyone in the pool
    PoolFull,
}

/// Outcome of [`ConnectionManager::on_peer_discovered`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AdmissionDecision {
    Connected,
    AlreadyConnected,
    Ignored(IgnoreReason),
}

/// Counts from one maintenance sweep
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct MaintenanceReport {
    pub stale_buffers: usize,
    pub expired_blacklists: usize,
    pub evicted_records: usize,
}

type StateChange = (PeerId, ConnectionState);

enum Admission {
    Proceed {
        evicted: Option<(PeerId, Vec<Arc<RoleAdapter>>)>,
    },
    Decided(AdmissionDecision),
}

pub struct ConnectionManager {
    config: TransportConfig,
    link_adapter: Arc<dyn LinkAdapter>,
    peers: Mutex<HashMap<PeerId, PeerRecord>>,
    reassembler: Arc<Reassembler>,
    observer: Arc<dyn TransportObserver>,
    cancel: CancellationToken,
    shut_down: AtomicBool,
}

impl ConnectionManager {
    pub fn new(
        config: TransportConfig,
        link_adapter: Arc<dyn LinkAdapter>,
        observer: Arc<dyn TransportObserver>,
    ) -> TransportResult<Self> {
        config.validate()?;
        let reassembler = Arc::new(Reassembler::new(config.reassembly_timeout()));

        info!(
            "Connection manager created (max peers: {}, requested unit size: {})",
            config.max_peers, config.requested_unit_size
        );

        Ok(Self {
            config,
            link_adapter,
            peers: Mutex::new(HashMap::new()),
            reassembler,
            observer,
            cancel: CancellationToken::new(),
            shut_down: AtomicBool::new(false),
        })
    }

    pub fn config(&self) -> &TransportConfig {
        &self.config
    }

    /// Reassembler shared by every role of every peer
    pub fn reassembler(&self) -> &Arc<Reassembler> {
        &self.reassembler
    }

    pub fn is_shut_down(&self) -> bool {
        self.shut_down.load(Ordering::SeqCst)
    }

    /// Spawn the incoming-link acceptor and the maintenance sweep
    ///
    /// Both tasks stop on [`ConnectionManager::shutdown`].
    pub fn start(self: &Arc<Self>) -> Vec<JoinHandle<()>> {
        let acceptor = {
            let manager = Arc::clone(self);
            tokio::spawn(async move { manager.accept_loop().await })
        };
        let maintenance = {
            let manager = Arc::clone(self);
            tokio::spawn(async move { manager.maintenance_loop().await })
        };
        info!("Connection manager started");
        vec![acceptor, maintenance]
    }

    async fn accept_loop(&self) {
        loop {
            let link = tokio::select! {
                _ = self.cancel.cancelled() => break,
                link = self.link_adapter.accept_incoming() => link,
            };
            let Some(link) = link else {
                info!("Link adapter stopped accepting incoming links");
                break;
            };
            if let Err(e) = self.on_incoming_link(link).await {
                debug!("Incoming link not admitted: {}", e);
            }
        }
        debug!("Incoming-link acceptor stopped");
    }

    async fn maintenance_loop(&self) {
        let mut ticker = tokio::time::interval(self.config.maintenance_interval());
        // The first tick completes immediately
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                _ = ticker.tick() => {
                    let report = self.run_maintenance().await;
                    debug!("Maintenance sweep: {:?}", report);
                }
            }
        }
        debug!("Maintenance task stopped");
    }

    /// Handle a discovery report and connect the outgoing role if admitted
    ///
    /// Connection failures are retried immediately until the retry budget is
    /// used up; the failure that opens a blacklist window is returned as
    /// [`TransportError::Blacklisted`].
    pub async fn on_peer_discovered(
        &self,
        peer: PeerId,
        signal_strength: i32,
    ) -> TransportResult<AdmissionDecision> {
        if self.is_shut_down() {
            return Err(TransportError::ShutDown);
        }
        if !is_valid_signal(signal_strength) {
            debug!("Ignoring {}: sentinel signal {}", peer, signal_strength);
            return Ok(AdmissionDecision::Ignored(IgnoreReason::InvalidSignal));
        }
        if signal_strength < self.config.min_signal_strength {
            debug!(
                "Ignoring {}: signal {} below {}",
                peer, signal_strength, self.config.min_signal_strength
            );
            return Ok(AdmissionDecision::Ignored(IgnoreReason::WeakSignal));
        }

        let now = Instant::now();
        let mut changes: Vec<StateChange> = Vec::new();
        let admission = {
            let mut peers = self.peers.lock().await;
            self.admit(&mut peers, &peer, signal_strength, now, &mut changes)
        };

        self.emit_all(changes);

        let evicted = match admission {
            Admission::Proceed { evicted } => evicted,
            Admission::Decided(decision) => return Ok(decision),
        };

        if let Some((victim, adapters)) = evicted {
            self.release_adapters(adapters).await;
            self.reassembler.clear_sender(&victim);
            self.observer
                .on_connection_state_changed(&victim, ConnectionState::Lost);
        }

        self.connect_with_retry(&peer).await
    }

    /// Admission decision for a discovery, taken under the peer table lock
    ///
    /// State changes are collected in `changes` so the caller can emit them
    /// once the lock is released, whatever the outcome.
    fn admit(
        &self,
        peers: &mut HashMap<PeerId, PeerRecord>,
        peer: &PeerId,
        signal_strength: i32,
        now: Instant,
        changes: &mut Vec<StateChange>,
    ) -> Admission {
        let is_new = !peers.contains_key(peer);
        if is_new {
            self.make_room(peers, peer);
            changes.push((peer.clone(), ConnectionState::Discovered));
        }
        let record = peers
            .entry(peer.clone())
            .or_insert_with(|| PeerRecord::new(peer.clone(), Some(signal_strength), now));
        record.last_seen = now;
        record.last_signal_strength = Some(signal_strength);

        if record.roles.has(Role::Outgoing) || record.connecting {
            return Admission::Decided(AdmissionDecision::AlreadyConnected);
        }
        if let Some(remaining) = record.blacklist_remaining(now) {
            debug!("Ignoring {}: blacklisted for another {:?}", peer, remaining);
            return Admission::Decided(AdmissionDecision::Ignored(IgnoreReason::Blacklisted));
        }

        let score = record.score(now, &self.config);
        let already_admitted = record.is_admitted();
        let admitted = peers
            .values()
            .filter(|r| &r.peer_id != peer && r.is_admitted())
            .count();

        let mut evicted = None;
        if !already_admitted && admitted >= self.config.max_peers {
            match self.lowest_scoring_connected(peers, peer, now) {
                Some((victim, victim_score)) if score > victim_score => {
                    info!(
                        "Pool full: replacing {} (score {:.3}) with {} (score {:.3})",
                        victim, victim_score, peer, score
                    );
                    if let Some(victim_record) = peers.get_mut(&victim) {
                        evicted = Some((victim, victim_record.roles.drain()));
                    }
                }
                _ => {
                    debug!("Pool full: {} (score {:.3}) not admitted", peer, score);
                    return Admission::Decided(AdmissionDecision::Ignored(IgnoreReason::PoolFull));
                }
            }
        }

        if let Some(record) = peers.get_mut(peer) {
            record.connecting = true;
        }
        changes.push((peer.clone(), ConnectionState::Connecting));
        Admission::Proceed { evicted }
    }

    /// Drop the oldest unadmitted record when the table is at capacity
    fn make_room(&self, peers: &mut HashMap<PeerId, PeerRecord>, incoming: &PeerId) {
        if peers.len() < self.config.max_tracked_peers {
            return;
        }
        let oldest = peers
            .values()
            .filter(|r| &r.peer_id != incoming && !r.is_admitted())
            .min_by_key(|r| r.last_seen)
            .map(|r| r.peer_id.clone());
        if let Some(oldest) = oldest {
            debug!("Peer table full, forgetting {}", oldest);
            peers.remove(&oldest);
        }
    }

    fn lowest_scoring_connected(
        &self,
        peers: &HashMap<PeerId, PeerRecord>,
        exclude: &PeerId,
        now: Instant,
    ) -> Option<(PeerId, f64)> {
        peers
            .values()
            // A peer still connecting its outgoing role is not a candidate
            .filter(|r| &r.peer_id != exclude && r.roles.any() && !r.connecting)
            .map(|r| (r.peer_id.clone(), r.score(now, &self.config)))
            .min_by(|a, b| a.1.total_cmp(&b.1))
    }

    async fn connect_with_retry(&self, peer: &PeerId) -> TransportResult<AdmissionDecision> {
        loop {
            if self.cancel.is_cancelled() {
                self.clear_connecting(peer).await;
                return Err(TransportError::ShutDown);
            }

            match self.establish_outgoing(peer).await {
                Ok(adapter) => return self.install_outgoing(peer, adapter).await,
                Err(e) => {
                    let now = Instant::now();
                    let (consecutive, window) = {
                        let mut peers = self.peers.lock().await;
                        let record = peers
                            .entry(peer.clone())
                            .or_insert_with(|| PeerRecord::new(peer.clone(), None, now));
                        let window = record.record_failure(now, &self.config);
                        if window.is_some() {
                            record.connecting = false;
                        }
                        (record.consecutive_failures, window)
                    };

                    match window {
                        None => {
                            warn!(
                                "Connection to {} failed (attempt {}), retrying: {}",
                                peer, consecutive, e
                            );
                        }
                        Some(remaining) => {
                            warn!(
                                "Connection to {} failed {} times, blacklisted for {:?}: {}",
                                peer, consecutive, remaining, e
                            );
                            self.observer.on_connection_state_changed(
                                peer,
                                ConnectionState::Blacklisted { remaining },
                            );
                            return Err(TransportError::Blacklisted {
                                peer: peer.clone(),
                                remaining,
                            });
                        }
                    }
                }
            }
        }
    }

    async fn establish_outgoing(&self, peer: &PeerId) -> TransportResult<Arc<RoleAdapter>> {
        let connect_timeout = self.config.connect_timeout();
        let link = tokio::time::timeout(connect_timeout, self.link_adapter.connect_outgoing(peer))
            .await
            .map_err(|_| TransportError::OperationTimeout {
                kind: "connect",
                after: connect_timeout,
            })??;

        let adapter = Arc::new(self.role_adapter(link.clone(), Role::Outgoing)?);

        let setup = async {
            adapter.discover_capabilities().await?;
            adapter.enable_notifications().await
        };
        if let Err(e) = setup.await {
            adapter.shutdown();
            self.close_link(&link).await;
            return Err(e);
        }

        match adapter
            .negotiate_unit_size(self.config.requested_unit_size)
            .await
        {
            Ok(size) => debug!("Negotiated unit size {} with {}", size, peer),
            Err(e) => warn!(
                "Unit size negotiation with {} failed, keeping {}: {}",
                peer,
                adapter.unit_size(),
                e
            ),
        }

        Ok(adapter)
    }

    async fn install_outgoing(
        &self,
        peer: &PeerId,
        adapter: Arc<RoleAdapter>,
    ) -> TransportResult<AdmissionDecision> {
        let (replaced, state) = {
            let mut peers = self.peers.lock().await;
            if self.is_shut_down() {
                drop(peers);
                self.release_adapters(vec![adapter]).await;
                return Err(TransportError::ShutDown);
            }
            let now = Instant::now();
            let record = peers
                .entry(peer.clone())
                .or_insert_with(|| PeerRecord::new(peer.clone(), None, now));
            record.connecting = false;
            record.record_success();
            let replaced = record.roles.set(adapter);
            (replaced, connected_state(&record.roles))
        };

        if let Some(stale) = replaced {
            self.release_adapters(vec![stale]).await;
        }
        info!("Outgoing link to {} established", peer);
        self.observer.on_connection_state_changed(peer, state);
        Ok(AdmissionDecision::Connected)
    }

    async fn clear_connecting(&self, peer: &PeerId) {
        if let Some(record) = self.peers.lock().await.get_mut(peer) {
            record.connecting = false;
        }
    }

    fn role_adapter(&self, link: LinkHandle, role: Role) -> TransportResult<RoleAdapter> {
        RoleAdapter::new(
            link,
            role,
            Arc::clone(&self.link_adapter),
            Arc::clone(&self.reassembler),
            Arc::clone(&self.observer),
            self.config.default_unit_size,
            self.config.operation_timeout(),
        )
    }

    /// Admit a link opened by a remote initiator
    ///
    /// Accepted independently of the outgoing role. Clears any blacklist on
    /// the peer. Refused (and closed) when the pool is full and the peer does
    /// not already hold a slot.
    pub async fn on_incoming_link(&self, link: LinkHandle) -> TransportResult<()> {
        if self.is_shut_down() {
            self.close_link(&link).await;
            return Err(TransportError::ShutDown);
        }

        let peer = link.peer.clone();
        let now = Instant::now();
        let (replaced, state, was_blacklisted) = {
            let mut peers = self.peers.lock().await;
            // Shutdown may have drained the table while we waited for the lock
            if self.is_shut_down() {
                drop(peers);
                self.close_link(&link).await;
                return Err(TransportError::ShutDown);
            }
            let holds_slot = peers.get(&peer).is_some_and(|r| r.is_admitted());
            let admitted = peers.values().filter(|r| r.is_admitted()).count();

            if !holds_slot && admitted >= self.config.max_peers {
                drop(peers);
                warn!("Refusing incoming link from {}: pool full", peer);
                self.close_link(&link).await;
                return Err(TransportError::ConnectionFailed(format!(
                    "pool full, incoming link from {} refused",
                    peer
                )));
            }

            let adapter = Arc::new(self.role_adapter(link, Role::Incoming)?);
            if !peers.contains_key(&peer) {
                self.make_room(&mut peers, &peer);
            }
            let record = peers
                .entry(peer.clone())
                .or_insert_with(|| PeerRecord::new(peer.clone(), None, now));
            let was_blacklisted = record.is_blacklisted(now);
            record.last_seen = now;
            record.record_success();
            let replaced = record.roles.set(adapter);
            (replaced, connected_state(&record.roles), was_blacklisted)
        };

        if let Some(stale) = replaced {
            debug!("Replacing stale incoming link from {}", peer);
            self.release_adapters(vec![stale]).await;
        }
        if was_blacklisted {
            info!("Incoming link from {} cleared its blacklist", peer);
        }
        info!("Incoming link from {} accepted", peer);
        self.observer.on_connection_state_changed(&peer, state);
        Ok(())
    }

    /// Route a frame received on `role` to that role's adapter
    pub async fn on_frame_received(
        &self,
        peer: &PeerId,
        role: Role,
        frame: &[u8],
    ) -> TransportResult<()> {
        let adapter = self.adapter_for(peer, role).await?;
        adapter.on_frame_received(frame);
        Ok(())
    }

    /// Record a unit size the remote side negotiated on `role`
    pub async fn on_unit_size_negotiated(
        &self,
        peer: &PeerId,
        role: Role,
        unit_size: u32,
    ) -> TransportResult<()> {
        let adapter = self.adapter_for(peer, role).await?;
        adapter.set_unit_size(unit_size).await
    }

    async fn adapter_for(&self, peer: &PeerId, role: Role) -> TransportResult<Arc<RoleAdapter>> {
        self.peers
            .lock()
            .await
            .get(peer)
            .and_then(|r| r.roles.get(role).cloned())
            .ok_or_else(|| TransportError::NotConnected(peer.clone()))
    }

    /// Tear down one role after its link went away
    ///
    /// The other role is untouched. Reassembly state for the peer is only
    /// dropped once both roles are gone.
    pub async fn on_link_lost(&self, peer: &PeerId, role: Role) {
        let (lost, state) = {
            let mut peers = self.peers.lock().await;
            let Some(record) = peers.get_mut(peer) else {
                debug!("Link loss for unknown peer {}", peer);
                return;
            };
            let lost = record.roles.take(role);
            let state = if record.roles.any() {
                connected_state(&record.roles)
            } else {
                ConnectionState::Lost
            };
            (lost, state)
        };

        let Some(adapter) = lost else {
            debug!("Link loss for {} without a {} role", peer, role);
            return;
        };

        adapter.shutdown();
        info!("{} link to {} lost", role, peer);

        if state == ConnectionState::Lost {
            self.reassembler.clear_sender(peer);
        }
        self.observer.on_connection_state_changed(peer, state);
    }

    /// Send a payload, preferring the outgoing role
    pub async fn send_data(&self, peer: &PeerId, data: &[u8]) -> TransportResult<()> {
        if self.is_shut_down() {
            return Err(TransportError::ShutDown);
        }
        let adapter = self
            .peers
            .lock()
            .await
            .get(peer)
            .and_then(|r| r.roles.preferred().cloned())
            .ok_or_else(|| TransportError::NotConnected(peer.clone()))?;

        debug!(
            "Routing {} bytes to {} over {} role",
            data.len(),
            peer,
            adapter.role()
        );
        adapter.send(data).await
    }

    /// Stop everything: schedulers first, then reassembly, then the links
    ///
    /// Safe to call more than once.
    pub async fn shutdown(&self) {
        if self.shut_down.swap(true, Ordering::SeqCst) {
            return;
        }
        info!("Shutting down connection manager");
        self.cancel.cancel();

        let drained: Vec<(PeerId, Vec<Arc<RoleAdapter>>)> = {
            let mut peers = self.peers.lock().await;
            peers
                .values_mut()
                .map(|r| {
                    r.connecting = false;
                    (r.peer_id.clone(), r.roles.drain())
                })
                .filter(|(_, adapters)| !adapters.is_empty())
                .collect()
        };

        for (_, adapters) in &drained {
            for adapter in adapters {
                adapter.shutdown();
            }
        }

        self.reassembler.clear_all();

        let mut closed = 0usize;
        for (peer, adapters) in drained {
            for adapter in adapters {
                self.close_link(adapter.link()).await;
                closed += 1;
            }
            self.observer
                .on_connection_state_changed(&peer, ConnectionState::Lost);
        }

        info!("Connection manager shut down ({} links closed)", closed);
    }

    /// Stale reassembly cleanup, blacklist bookkeeping and record eviction
    pub async fn run_maintenance(&self) -> MaintenanceReport {
        let stale_buffers = self.reassembler.cleanup_stale();
        let now = Instant::now();
        let stale_after = self.config.peer_stale_after();

        let (expired, evicted_records) = {
            let mut peers = self.peers.lock().await;
            let mut expired = Vec::new();
            for record in peers.values_mut() {
                if record
                    .blacklisted_until
                    .is_some_and(|until| until <= now)
                {
                    record.blacklisted_until = None;
                    expired.push(record.peer_id.clone());
                }
            }

            let before = peers.len();
            peers.retain(|_, r| {
                r.is_admitted()
                    || r.is_blacklisted(now)
                    || now.saturating_duration_since(r.last_seen) < stale_after
            });
            (expired, before - peers.len())
        };

        for peer in &expired {
            debug!("Blacklist for {} expired", peer);
            self.observer
                .on_connection_state_changed(peer, ConnectionState::Discovered);
        }

        MaintenanceReport {
            stale_buffers,
            expired_blacklists: expired.len(),
            evicted_records,
        }
    }

    pub async fn peer_snapshot(&self, peer: &PeerId) -> Option<PeerSnapshot> {
        let now = Instant::now();
        self.peers
            .lock()
            .await
            .get(peer)
            .map(|r| r.snapshot(now, &self.config))
    }

    pub async fn peers(&self) -> Vec<PeerSnapshot> {
        let now = Instant::now();
        let mut snapshots: Vec<PeerSnapshot> = self
            .peers
            .lock()
            .await
            .values()
            .map(|r| r.snapshot(now, &self.config))
            .collect();
        snapshots.sort_by(|a, b| a.peer_id.cmp(&b.peer_id));
        snapshots
    }

    /// Peers with at least one live role
    pub async fn connected_peer_count(&self) -> usize {
        self.peers
            .lock()
            .await
            .values()
            .filter(|r| r.roles.any())
            .count()
    }

    async fn release_adapters(&self, adapters: Vec<Arc<RoleAdapter>>) {
        for adapter in adapters {
            adapter.shutdown();
            self.close_link(adapter.link()).await;
        }
    }

    async fn close_link(&self, link: &LinkHandle) {
        if let Err(e) = self.link_adapter.close_link(link).await {
            error!("Failed to close link {} to {}: {}", link.id, link.peer, e);
        }
    }

    fn emit_all(&self, changes: Vec<StateChange>) {
        for (peer, state) in changes {
            self.observer.on_connection_state_changed(&peer, state);
        }
    }
}

fn connected_state(roles: &RoleSlots) -> ConnectionState {
    ConnectionState::Connected {
        outgoing: roles.has(Role::Outgoing),
        incoming: roles.has(Role::Incoming),
    }
}
