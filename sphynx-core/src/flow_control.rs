//! Siamese flow control: a per-connection rate gate keyed on packetloss and trip-time samples,
//! TCP-Reno-friendly by design.
//!
//! The epoch length, minimum rate, and the slow-start/steady-state/congestion-reaction transition
//! conditions below follow a concrete prior implementation's behavior rather than an invented
//! one. `send_epoch_bytes` is a lock-free fetch-add on every packet send, the one flow-control
//! field touched off the connection's own worker thread.

use std::sync::atomic::{AtomicU32, Ordering};

pub const EPOCH_INTERVAL: u32 = 500;
pub const MIN_RATE_LIMIT: u32 = 100_000;

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum Phase {
    SlowStart,
    SteadyState,
    CongestionReaction,
}

/// Per-connection Siamese state. `send_epoch_bytes` is the one field touched off the tick/ACK
/// path (from `Connection::write_*`/`flush_write`), so it alone is a bare atomic; everything
/// else is only ever touched from the connection's own worker thread under `recv_lock`/the
/// flow-control field's enclosing `Mutex`, matching the rule that only I/O and the two
/// per-connection mutexes are suspension points.
pub struct FlowControl {
    max_epoch_bytes: u32,
    loss_timeout: u32,
    next_epoch_time: u32,
    send_epoch_bytes: AtomicU32,
    phase: Phase,
    /// Smoothed bandwidth-delay-product estimate (bytes/epoch), maintained once in steady state.
    bdp_estimate: u32,
    /// Estimate retained from the most recent congestion event, used as the recovery floor.
    safe_rate: u32,
}

impl FlowControl {
    pub fn new(now: u32) -> FlowControl {
        FlowControl {
            max_epoch_bytes: MIN_RATE_LIMIT / 2, // one epoch (500ms) at MIN_RATE_LIMIT bytes/s
            loss_timeout: 250,
            next_epoch_time: now + EPOCH_INTERVAL,
            send_epoch_bytes: AtomicU32::new(0),
            phase: Phase::SlowStart,
            bdp_estimate: MIN_RATE_LIMIT / 2,
            safe_rate: MIN_RATE_LIMIT / 2,
        }
    }

    #[inline]
    pub fn max_epoch_bytes(&self) -> u32 {
        self.max_epoch_bytes
    }

    #[inline]
    pub fn loss_timeout(&self) -> u32 {
        self.loss_timeout
    }

    #[inline]
    pub fn phase(&self) -> Phase {
        self.phase
    }

    /// May the transport start a new datagram right now? (`send_epoch_bytes < max_epoch_bytes`).
    #[inline]
    pub fn can_send(&self) -> bool {
        self.send_epoch_bytes.load(Ordering::Relaxed) < self.max_epoch_bytes
    }

    /// Report a packet (including its encryption trailer) as sent this epoch. Lock-free, so it
    /// can be called from any thread without contending with the tick/ACK path.
    #[inline]
    pub fn on_packet_send(&self, bytes_with_overhead: u32) {
        self.send_epoch_bytes.fetch_add(bytes_with_overhead, Ordering::Relaxed);
    }

    #[inline]
    fn sent_bytes(&self) -> u32 {
        self.send_epoch_bytes.load(Ordering::Relaxed)
    }

    /// Called on receipt of an ACK (`avg_one_way_time` in ms, `nack_loss_count` implicit NACKs
    /// processed this ACK). Correlates bandwidth-used to loss and trip time the way the header
    /// comment describes, without attempting the original's full statistical estimator.
    pub fn on_ack(&mut self, now: u32, avg_one_way_time: u32, nack_loss_count: u32) {
        self.loss_timeout = (avg_one_way_time.max(1) * 4).max(100);

        if nack_loss_count > 0 {
            self.enter_congestion_reaction(now);
            return;
        }

        match self.phase {
            Phase::SlowStart => {
                // Ambient loss-free sampling: let the epoch cap grow towards what's actually
                // being used so the first loss-triggered doubling (on_tick) has a real baseline.
                self.bdp_estimate = self.bdp_estimate.max(self.sent_bytes());
            }
            Phase::SteadyState => {
                // Smoothed estimate of the bandwidth-delay product actually sustained.
                self.bdp_estimate = (self.bdp_estimate * 7 + self.sent_bytes()) / 8;
                self.max_epoch_bytes = self.bdp_estimate.max(MIN_RATE_LIMIT / 2);
            }
            Phase::CongestionReaction => {
                // A clean epoch while recovering: ease back toward steady state.
                self.safe_rate = (self.safe_rate * 9 + self.max_epoch_bytes) / 10;
            }
        }
    }

    fn enter_congestion_reaction(&mut self, now: u32) {
        self.safe_rate = (self.max_epoch_bytes / 2).max(MIN_RATE_LIMIT / 2);
        self.max_epoch_bytes = self.safe_rate;
        self.phase = Phase::CongestionReaction;
        self.next_epoch_time = now + EPOCH_INTERVAL;
    }

    /// Called once per transport tick (`timeout_loss_count` is the number of entries this
    /// connection just moved back to `send_queue` for retransmission due to timeout). Closes the
    /// epoch and advances phase when `now >= next_epoch_time`.
    pub fn on_tick(&mut self, now: u32, timeout_loss_count: u32) {
        if timeout_loss_count > 0 {
            self.enter_congestion_reaction(now);
        }

        if now.wrapping_sub(self.next_epoch_time) >= u32::MAX / 2 {
            // next_epoch_time is still in the future (wrapping comparison).
            return;
        }

        self.send_epoch_bytes.store(0, Ordering::Relaxed);
        self.next_epoch_time = now + EPOCH_INTERVAL;

        match self.phase {
            Phase::SlowStart => {
                self.max_epoch_bytes = self.max_epoch_bytes.saturating_mul(2).max(MIN_RATE_LIMIT / 2);
            }
            Phase::SteadyState => {
                self.max_epoch_bytes = self.bdp_estimate.max(MIN_RATE_LIMIT / 2);
            }
            Phase::CongestionReaction => {
                // Slow recovery toward the pre-congestion rate, then settle into steady state.
                self.max_epoch_bytes = (self.max_epoch_bytes + self.safe_rate / 4).max(MIN_RATE_LIMIT / 2);
                if self.max_epoch_bytes >= self.safe_rate {
                    self.phase = Phase::SteadyState;
                    self.bdp_estimate = self.max_epoch_bytes;
                }
            }
        }
    }

    /// Transition out of slow start on the first observed loss (called from `on_ack`/`on_tick`
    /// congestion paths via `enter_congestion_reaction`, which always leaves `phase` as
    /// `CongestionReaction`; once recovery completes `on_tick` promotes to `SteadyState`).
    #[cfg(test)]
    fn force_phase(&mut self, phase: Phase) {
        self.phase = phase;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn slow_start_doubles_each_epoch_without_loss() {
        let mut fc = FlowControl::new(0);
        let first = fc.max_epoch_bytes();
        fc.on_tick(EPOCH_INTERVAL, 0);
        assert_eq!(fc.max_epoch_bytes(), first * 2);
        fc.on_tick(EPOCH_INTERVAL * 2, 0);
        assert_eq!(fc.max_epoch_bytes(), first * 4);
    }

    #[test]
    fn timeout_loss_triggers_congestion_reaction() {
        let mut fc = FlowControl::new(0);
        fc.on_tick(EPOCH_INTERVAL, 0);
        let before = fc.max_epoch_bytes();
        fc.on_tick(EPOCH_INTERVAL * 2, 3);
        assert_eq!(fc.phase(), Phase::CongestionReaction);
        assert!(fc.max_epoch_bytes() <= before);
    }

    #[test]
    fn nack_loss_on_ack_triggers_congestion_reaction() {
        let mut fc = FlowControl::new(0);
        fc.force_phase(Phase::SteadyState);
        fc.on_ack(0, 100, 2);
        assert_eq!(fc.phase(), Phase::CongestionReaction);
    }

    #[test]
    fn min_rate_limit_is_never_violated() {
        let mut fc = FlowControl::new(0);
        for _ in 0..50 {
            fc.on_tick(0, 5);
        }
        assert!(fc.max_epoch_bytes() >= MIN_RATE_LIMIT / 2);
    }

    #[test]
    fn can_send_respects_epoch_budget() {
        let fc = FlowControl::new(0);
        assert!(fc.can_send());
        fc.on_packet_send(fc.max_epoch_bytes());
        assert!(!fc.can_send());
    }
}
