//! Windowed online/offline determination over two transports.
//!
//! Pure state machine: transport open/close/message events go in with an
//! explicit `now`, the derived online signal comes out. The async runner
//! in `transport.rs` feeds it; tests drive it directly.

use std::time::{Duration, Instant};

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy)]
pub struct LivenessConfig {
    /// Maximum age of the last received message before it stops
    /// counting toward "online".
    pub staleness: Duration,
    /// Delay before a transport close is trusted as real. Absorbs
    /// reconnect blips without flapping the derived signal.
    pub grace: Duration,
}

impl Default for LivenessConfig {
    fn default() -> Self {
        Self {
            staleness: Duration::from_secs(12),
            grace: Duration::from_secs(4),
        }
    }
}

// ---------------------------------------------------------------------------
// Core types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportKind {
    /// MQTT-over-WebSocket straight to the broker (preferred).
    Direct,
    /// The relay's own WebSocket feed (fallback).
    Relay,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Disconnected,
    Connecting,
    Connected,
}

#[derive(Debug)]
struct Slot {
    phase: Phase,
    /// Set when an *established* connection closes; a failed connect
    /// attempt earns no grace.
    closed_at: Option<Instant>,
}

impl Slot {
    fn new() -> Self {
        Self {
            phase: Phase::Disconnected,
            closed_at: None,
        }
    }
}

pub struct Liveness {
    cfg: LivenessConfig,
    direct: Slot,
    relay: Slot,
    last_msg_at: Option<Instant>,
}

impl Liveness {
    pub fn new(cfg: LivenessConfig) -> Self {
        Self {
            cfg,
            direct: Slot::new(),
            relay: Slot::new(),
            last_msg_at: None,
        }
    }

    fn slot(&self, kind: TransportKind) -> &Slot {
        match kind {
            TransportKind::Direct => &self.direct,
            TransportKind::Relay => &self.relay,
        }
    }

    fn slot_mut(&mut self, kind: TransportKind) -> &mut Slot {
        match kind {
            TransportKind::Direct => &mut self.direct,
            TransportKind::Relay => &mut self.relay,
        }
    }

    // -- transitions --------------------------------------------------------

    pub fn on_connecting(&mut self, kind: TransportKind) {
        self.slot_mut(kind).phase = Phase::Connecting;
    }

    pub fn on_open(&mut self, kind: TransportKind) {
        let slot = self.slot_mut(kind);
        slot.phase = Phase::Connected;
        slot.closed_at = None;
    }

    pub fn on_close(&mut self, kind: TransportKind, now: Instant) {
        let slot = self.slot_mut(kind);
        if slot.phase == Phase::Connected {
            slot.closed_at = Some(now);
        }
        slot.phase = Phase::Disconnected;
    }

    pub fn on_message(&mut self, now: Instant) {
        self.last_msg_at = Some(now);
    }

    // -- derived state ------------------------------------------------------

    pub fn phase(&self, kind: TransportKind) -> Phase {
        self.slot(kind).phase
    }

    pub fn last_msg_at(&self) -> Option<Instant> {
        self.last_msg_at
    }

    /// A transport counts as up while connected, or for the grace window
    /// after an established connection closed.
    pub fn transport_up(&self, kind: TransportKind, now: Instant) -> bool {
        let slot = self.slot(kind);
        match slot.phase {
            Phase::Connected => true,
            _ => slot
                .closed_at
                .map(|t| now.duration_since(t) <= self.cfg.grace)
                .unwrap_or(false),
        }
    }

    /// Online iff a message arrived within the staleness window OR any
    /// transport is currently up. The OR is deliberate: a connected but
    /// message-silent transport still counts, and a transport that just
    /// delivered but has since dropped still counts until the message
    /// goes stale.
    pub fn online(&self, now: Instant) -> bool {
        let recent_msg = self
            .last_msg_at
            .map(|t| now.duration_since(t) <= self.cfg.staleness)
            .unwrap_or(false);
        recent_msg
            || self.transport_up(TransportKind::Direct, now)
            || self.transport_up(TransportKind::Relay, now)
    }

    /// Which live transport feeds us, preferring direct.
    pub fn source(&self, now: Instant) -> Option<TransportKind> {
        if self.transport_up(TransportKind::Direct, now) {
            Some(TransportKind::Direct)
        } else if self.transport_up(TransportKind::Relay, now) {
            Some(TransportKind::Relay)
        } else {
            None
        }
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn ms(n: u64) -> Duration {
        Duration::from_millis(n)
    }

    fn tracker() -> Liveness {
        Liveness::new(LivenessConfig::default())
    }

    // -- message staleness window -------------------------------------------

    #[test]
    fn fresh_message_counts_as_online_without_transport() {
        let mut lv = tracker();
        let t0 = Instant::now();
        lv.on_message(t0);
        assert!(lv.online(t0));
        assert!(lv.online(t0 + ms(11_900)));
    }

    #[test]
    fn stale_message_alone_is_offline() {
        let mut lv = tracker();
        let t0 = Instant::now();
        lv.on_message(t0);
        assert!(!lv.online(t0 + ms(12_100)));
    }

    #[test]
    fn stale_message_with_connected_transport_stays_online() {
        let mut lv = tracker();
        let t0 = Instant::now();
        lv.on_message(t0);
        lv.on_open(TransportKind::Relay);
        assert!(lv.online(t0 + ms(60_000)));
    }

    #[test]
    fn no_events_means_offline() {
        let lv = tracker();
        assert!(!lv.online(Instant::now()));
    }

    // -- grace window ---------------------------------------------------------

    #[test]
    fn close_keeps_transport_up_within_grace() {
        let mut lv = tracker();
        let t0 = Instant::now();
        lv.on_open(TransportKind::Direct);
        lv.on_close(TransportKind::Direct, t0);

        assert!(lv.transport_up(TransportKind::Direct, t0 + ms(3_900)));
        assert!(!lv.transport_up(TransportKind::Direct, t0 + ms(4_100)));
    }

    #[test]
    fn reconnect_within_grace_never_flips_offline() {
        let mut lv = tracker();
        let t0 = Instant::now();
        lv.on_open(TransportKind::Direct);
        lv.on_close(TransportKind::Direct, t0);

        // probe continuously up to the reconnect
        for probe_ms in [0u64, 1_000, 2_000, 2_900] {
            assert!(lv.online(t0 + ms(probe_ms)), "offline at +{probe_ms}ms");
        }
        lv.on_connecting(TransportKind::Direct);
        lv.on_open(TransportKind::Direct);
        assert!(lv.online(t0 + ms(3_000)));
        assert!(lv.online(t0 + ms(60_000)));
    }

    #[test]
    fn failed_connect_attempt_earns_no_grace() {
        let mut lv = tracker();
        let t0 = Instant::now();
        lv.on_connecting(TransportKind::Relay);
        lv.on_close(TransportKind::Relay, t0); // connect failed
        assert!(!lv.transport_up(TransportKind::Relay, t0));
        assert!(!lv.online(t0));
    }

    #[test]
    fn reopen_clears_stale_grace_marker() {
        let mut lv = tracker();
        let t0 = Instant::now();
        lv.on_open(TransportKind::Relay);
        lv.on_close(TransportKind::Relay, t0);
        lv.on_open(TransportKind::Relay);
        lv.on_close(TransportKind::Relay, t0 + ms(10_000));
        // grace measured from the second close, not the first
        assert!(lv.transport_up(TransportKind::Relay, t0 + ms(13_000)));
        assert!(!lv.transport_up(TransportKind::Relay, t0 + ms(15_000)));
    }

    // -- combined determination ----------------------------------------------

    #[test]
    fn message_then_disconnect_stays_online_until_stale() {
        let mut lv = tracker();
        let t0 = Instant::now();
        lv.on_open(TransportKind::Direct);
        lv.on_message(t0);
        lv.on_close(TransportKind::Direct, t0);

        // grace expires at +4s but the message carries it to +12s
        assert!(lv.online(t0 + ms(11_900)));
        assert!(!lv.online(t0 + ms(12_100)));
    }

    #[test]
    fn connecting_phase_alone_is_not_up() {
        let mut lv = tracker();
        lv.on_connecting(TransportKind::Direct);
        assert_eq!(lv.phase(TransportKind::Direct), Phase::Connecting);
        assert!(!lv.transport_up(TransportKind::Direct, Instant::now()));
    }

    // -- source preference ----------------------------------------------------

    #[test]
    fn source_prefers_direct_over_relay() {
        let mut lv = tracker();
        let now = Instant::now();
        lv.on_open(TransportKind::Relay);
        assert_eq!(lv.source(now), Some(TransportKind::Relay));

        lv.on_open(TransportKind::Direct);
        assert_eq!(lv.source(now), Some(TransportKind::Direct));
    }

    #[test]
    fn source_none_when_both_down() {
        let lv = tracker();
        assert_eq!(lv.source(Instant::now()), None);
    }

    // -- custom windows --------------------------------------------------------

    #[test]
    fn windows_are_configurable() {
        let mut lv = Liveness::new(LivenessConfig {
            staleness: ms(100),
            grace: ms(50),
        });
        let t0 = Instant::now();
        lv.on_message(t0);
        assert!(lv.online(t0 + ms(90)));
        assert!(!lv.online(t0 + ms(110)));
    }
}
