//! Choosing the active pool.
//!
//! Exactly one connection feeds the workers at a time. [`Failover`] picks it
//! from the configured pools by priority; [`DonationSchedule`] overlays a
//! fixed share of every cycle during which the donation pool takes over,
//! provided it is Ready.

use std::time::Duration;

use tokio::time::Instant;

use crate::pool::{ConnectionState, PoolId};

/// Donation cycle length, in units.
pub const DONATION_CYCLE: u64 = 100;

/// Priority-ordered failover among the configured pools.
///
/// Without `prefer_primary` the active pool is sticky: it stays active for
/// as long as it is Ready, even after a higher-priority pool recovers.
#[derive(Debug, Clone)]
pub struct Failover {
    prefer_primary: bool,
    active: Option<PoolId>,
}

impl Failover {
    pub fn new(prefer_primary: bool) -> Self {
        Self {
            prefer_primary,
            active: None,
        }
    }

    pub fn active(&self) -> Option<PoolId> {
        self.active
    }

    /// Pick the active pool given each configured pool's state, indexed by
    /// priority.
    pub fn select(&mut self, states: &[ConnectionState]) -> Option<PoolId> {
        let first_ready = states.iter().position(|s| s.is_ready()).map(PoolId);

        self.active = match self.active {
            Some(current)
                if !self.prefer_primary
                    && states.get(current.0).is_some_and(|s| s.is_ready()) =>
            {
                Some(current)
            }
            _ => first_ready,
        };
        self.active
    }
}

/// Repeating donation window.
///
/// A cycle is [`DONATION_CYCLE`] units long; the last `level` units of each
/// cycle are donation time. Over whole cycles the donated fraction is exactly
/// `level` percent, and at no point in a cycle does it exceed that.
#[derive(Debug, Clone, Copy)]
pub struct DonationSchedule {
    level: u8,
    unit: Duration,
    origin: Instant,
}

impl DonationSchedule {
    pub fn new(level: u8, unit: Duration, origin: Instant) -> Self {
        Self {
            level: level.min(DONATION_CYCLE as u8),
            unit: unit.max(Duration::from_millis(1)),
            origin,
        }
    }

    pub fn level(&self) -> u8 {
        self.level
    }

    /// Whether `now` falls inside a donation window.
    pub fn is_donating(&self, now: Instant) -> bool {
        if self.level == 0 {
            return false;
        }
        let elapsed = now.saturating_duration_since(self.origin);
        let unit = (elapsed.as_nanos() / self.unit.as_nanos()) as u64;
        unit % DONATION_CYCLE >= DONATION_CYCLE - self.level as u64
    }

    /// Next instant at which `is_donating` may change.
    pub fn next_boundary(&self, now: Instant) -> Instant {
        let elapsed = now.saturating_duration_since(self.origin);
        let unit_nanos = self.unit.as_nanos();
        let unit = elapsed.as_nanos() / unit_nanos;
        let cycle_pos = (unit % DONATION_CYCLE as u128) as u64;
        let switch = DONATION_CYCLE - self.level as u64;

        let units_ahead = if cycle_pos < switch {
            switch - cycle_pos
        } else {
            DONATION_CYCLE - cycle_pos
        };
        let boundary = (unit + units_ahead as u128) * unit_nanos;
        self.origin + Duration::from_nanos(boundary.min(u64::MAX as u128) as u64)
    }
}

/// Failover plus the donation overlay.
#[derive(Debug, Clone)]
pub struct Strategy {
    failover: Failover,
    donation: Option<(PoolId, DonationSchedule)>,
}

impl Strategy {
    pub fn new(prefer_primary: bool, donation: Option<(PoolId, DonationSchedule)>) -> Self {
        Self {
            failover: Failover::new(prefer_primary),
            donation,
        }
    }

    pub fn donation(&self) -> Option<&(PoolId, DonationSchedule)> {
        self.donation.as_ref()
    }

    /// Active connection at `now`.
    ///
    /// `states` holds the configured pools in priority order followed by the
    /// donation pool, if any. Donation time with the donation pool not Ready
    /// is silently skipped.
    pub fn choose(&mut self, states: &[ConnectionState], now: Instant) -> Option<PoolId> {
        let user_pools = match self.donation {
            Some((id, _)) => &states[..id.0.min(states.len())],
            None => states,
        };
        let selected = self.failover.select(user_pools);

        if let Some((id, schedule)) = &self.donation {
            let ready = states.get(id.0).is_some_and(|s| s.is_ready());
            if ready && schedule.is_donating(now) {
                return Some(*id);
            }
        }
        selected
    }
}
