//! Peer records, admission scoring and blacklist backoff

use crate::config::TransportConfig;
use crate::role::{Role, RoleAdapter};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

/// Signal values some radio stacks report when no real measurement exists
pub const SENTINEL_SIGNALS: [i32; 3] = [-127, -128, 0];

const SIGNAL_WEIGHT: f64 = 0.6;
const HISTORY_WEIGHT: f64 = 0.3;
const RECENCY_WEIGHT: f64 = 0.1;

/// Success rate assumed for a peer with no connection history
const UNSEEN_SUCCESS_RATE: f64 = 0.5;

/// Radio address of a peer
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PeerId(String);

impl PeerId {
    pub fn new(address: impl Into<String>) -> Self {
        Self(address.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for PeerId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<String> for PeerId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

/// Whether a signal reading is a real measurement
pub fn is_valid_signal(signal_strength: i32) -> bool {
    !SENTINEL_SIGNALS.contains(&signal_strength)
}

/// Map a signal strength linearly onto `[0, 1]` between `floor` and zero
pub fn normalize_signal(signal_strength: i32, floor: i32) -> f64 {
    if floor >= 0 {
        return if signal_strength >= 0 { 1.0 } else { 0.0 };
    }
    let span = -(floor as f64);
    ((signal_strength - floor) as f64 / span).clamp(0.0, 1.0)
}

/// Linear decay from 1 at `age == 0` to 0 at `age >= window`
pub fn recency_factor(age: Duration, window: Duration) -> f64 {
    if window.is_zero() {
        return 0.0;
    }
    (1.0 - age.as_secs_f64() / window.as_secs_f64()).clamp(0.0, 1.0)
}

/// Weighted admission score: 60% signal, 30% connection history, 10% recency
pub fn priority_score(
    signal_strength: i32,
    success_rate: f64,
    age: Duration,
    config: &TransportConfig,
) -> f64 {
    normalize_signal(signal_strength, config.signal_floor) * SIGNAL_WEIGHT
        + success_rate * HISTORY_WEIGHT
        + recency_factor(age, config.recency_window()) * RECENCY_WEIGHT
}

/// Blacklist duration after `consecutive_failures` failed attempts
///
/// The first `max_immediate_retries` failures retry without a blacklist. After
/// that the window starts at the base duration and doubles per failure up to
/// the cap.
pub fn blacklist_duration(consecutive_failures: u32, config: &TransportConfig) -> Option<Duration> {
    if consecutive_failures <= config.max_immediate_retries {
        return None;
    }
    let exponent = consecutive_failures - config.max_immediate_retries - 1;
    let base = config.blacklist_base();
    let cap = config.blacklist_cap();
    let duration = 2u32
        .checked_pow(exponent)
        .and_then(|factor| base.checked_mul(factor))
        .unwrap_or(cap);
    Some(duration.min(cap))
}

/// Role adapters held for one peer, at most one per role
#[derive(Default, Clone)]
pub struct RoleSlots {
    outgoing: Option<Arc<RoleAdapter>>,
    incoming: Option<Arc<RoleAdapter>>,
}

impl RoleSlots {
    pub fn get(&self, role: Role) -> Option<&Arc<RoleAdapter>> {
        match role {
            Role::Outgoing => self.outgoing.as_ref(),
            Role::Incoming => self.incoming.as_ref(),
        }
    }

    /// Install an adapter, returning the one it replaces
    pub fn set(&mut self, adapter: Arc<RoleAdapter>) -> Option<Arc<RoleAdapter>> {
        match adapter.role() {
            Role::Outgoing => self.outgoing.replace(adapter),
            Role::Incoming => self.incoming.replace(adapter),
        }
    }

    pub fn take(&mut self, role: Role) -> Option<Arc<RoleAdapter>> {
        match role {
            Role::Outgoing => self.outgoing.take(),
            Role::Incoming => self.incoming.take(),
        }
    }

    /// Adapter used for sending: outgoing first, then incoming
    pub fn preferred(&self) -> Option<&Arc<RoleAdapter>> {
        self.outgoing.as_ref().or(self.incoming.as_ref())
    }

    pub fn has(&self, role: Role) -> bool {
        self.get(role).is_some()
    }

    pub fn any(&self) -> bool {
        self.outgoing.is_some() || self.incoming.is_some()
    }

    pub fn drain(&mut self) -> Vec<Arc<RoleAdapter>> {
        self.outgoing
            .take()
            .into_iter()
            .chain(self.incoming.take())
            .collect()
    }
}

/// Lifecycle state of a peer as seen by the connection manager
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PeerState {
    Discovered,
    Connecting,
    Connected,
    Blacklisted,
}

/// Everything the connection manager tracks about one peer
pub struct PeerRecord {
    pub peer_id: PeerId,
    pub roles: RoleSlots,
    pub first_seen: DateTime<Utc>,
    pub last_seen: Instant,
    /// Latest discovery reading; `None` for peers only seen inbound
    pub last_signal_strength: Option<i32>,
    pub consecutive_failures: u32,
    pub successes: u32,
    pub failures: u32,
    pub blacklisted_until: Option<Instant>,
    /// An outgoing connection attempt holds a pool slot
    pub connecting: bool,
}

impl PeerRecord {
    pub fn new(peer_id: PeerId, signal_strength: Option<i32>, now: Instant) -> Self {
        Self {
            peer_id,
            roles: RoleSlots::default(),
            first_seen: Utc::now(),
            last_seen: now,
            last_signal_strength: signal_strength,
            consecutive_failures: 0,
            successes: 0,
            failures: 0,
            blacklisted_until: None,
            connecting: false,
        }
    }

    pub fn success_rate(&self) -> f64 {
        let attempts = self.successes + self.failures;
        if attempts == 0 {
            UNSEEN_SUCCESS_RATE
        } else {
            self.successes as f64 / attempts as f64
        }
    }

    /// Admission score; a peer with no reading scores as if at the signal floor
    pub fn score(&self, now: Instant, config: &TransportConfig) -> f64 {
        priority_score(
            self.last_signal_strength.unwrap_or(config.signal_floor),
            self.success_rate(),
            now.saturating_duration_since(self.last_seen),
            config,
        )
    }

    /// Remaining blacklist time, if the window is still open
    pub fn blacklist_remaining(&self, now: Instant) -> Option<Duration> {
        self.blacklisted_until
            .filter(|until| *until > now)
            .map(|until| until - now)
    }

    pub fn is_blacklisted(&self, now: Instant) -> bool {
        self.blacklist_remaining(now).is_some()
    }

    /// Whether the peer occupies a slot in the pool
    pub fn is_admitted(&self) -> bool {
        self.connecting || self.roles.any()
    }

    pub fn state(&self, now: Instant) -> PeerState {
        if self.roles.any() {
            PeerState::Connected
        } else if self.connecting {
            PeerState::Connecting
        } else if self.is_blacklisted(now) {
            PeerState::Blacklisted
        } else {
            PeerState::Discovered
        }
    }

    pub fn record_success(&mut self) {
        self.successes = self.successes.saturating_add(1);
        self.consecutive_failures = 0;
        self.blacklisted_until = None;
    }

    /// Count a failed attempt and open a blacklist window when the retries are used up
    pub fn record_failure(&mut self, now: Instant, config: &TransportConfig) -> Option<Duration> {
        self.failures = self.failures.saturating_add(1);
        self.consecutive_failures = self.consecutive_failures.saturating_add(1);
        let window = blacklist_duration(self.consecutive_failures, config);
        if let Some(duration) = window {
            self.blacklisted_until = Some(now + duration);
        }
        window
    }

    pub fn snapshot(&self, now: Instant, config: &TransportConfig) -> PeerSnapshot {
        PeerSnapshot {
            peer_id: self.peer_id.clone(),
            state: self.state(now),
            has_outgoing_role: self.roles.has(Role::Outgoing),
            has_incoming_role: self.roles.has(Role::Incoming),
            outgoing_mtu: self.roles.get(Role::Outgoing).map(|a| a.unit_size()),
            incoming_mtu: self.roles.get(Role::Incoming).map(|a| a.unit_size()),
            last_signal_strength: self.last_signal_strength,
            consecutive_failures: self.consecutive_failures,
            success_rate: self.success_rate(),
            priority_score: self.score(now, config),
            blacklist_remaining_secs: self.blacklist_remaining(now).map(|d| d.as_secs_f64()),
            first_seen: self.first_seen,
        }
    }
}

/// Point-in-time view of a peer for diagnostics
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PeerSnapshot {
    pub peer_id: PeerId,
    pub state: PeerState,
    pub has_outgoing_role: bool,
    pub has_incoming_role: bool,
    pub outgoing_mtu: Option<u32>,
    pub incoming_mtu: Option<u32>,
    pub last_signal_strength: Option<i32>,
    pub consecutive_failures: u32,
    pub success_rate: f64,
    pub priority_score: f64,
    pub blacklist_remaining_secs: Option<f64>,
    pub first_seen: DateTime<Utc>,
}
