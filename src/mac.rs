//! Time-division medium access control.
//!
//! The MAC is an ordered list of slot templates plus a timer: each slot
//! owns the channel for `slot_seconds`, and the whole list repeats as one
//! cycle anchored to a wall-clock reference, so independently booted
//! nodes agree on the schedule without negotiation.
//!
//! Each [`MacManager::do_work`] call fires at most one [`SlotTick`]. The
//! caller (normally the portal) publishes the slot-start notification
//! first and, when `initiate` is set, hands the template to exactly one
//! driver.

use std::time::Duration;

use log::{debug, warn};

use crate::clock::{Clock, TimePoint};
use crate::consts::{BROADCAST_ID, ModemId};
use crate::transmission::{ModemTransmission, TransmissionKind};

/// Medium access scheme.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MacMode {
    /// No medium access control; `startup` leaves the MAC quiescent.
    #[default]
    NoMac,
    /// Centralized polling: this node initiates every slot (except slots
    /// whose `src` is the broadcast id, which are kept quiet).
    Polled,
    /// Decentralized TDMA: initiate only our own slots (or slots marked
    /// `always_initiate`).
    FixedDecentralized,
}

/// Anchor for the cycle schedule.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MacReference {
    /// Midnight UTC of the current day.
    #[default]
    StartOfDay,
    /// A fixed instant shared by all participants.
    Fixed(TimePoint),
}

#[derive(Debug, Clone)]
pub struct MacConfig {
    pub mode: MacMode,
    pub modem_id: ModemId,
    /// Slot templates, in cycle order.
    pub slots: Vec<ModemTransmission>,
    pub reference: MacReference,
    /// Begin with the next slot boundary instead of waiting for the next
    /// whole cycle.
    pub start_cycle_in_middle: bool,
    /// Largest tolerated distance between the scheduled and observed slot
    /// start before the schedule is re-planned.
    pub allowed_skew: Duration,
}

impl Default for MacConfig {
    fn default() -> Self {
        MacConfig {
            mode: MacMode::NoMac,
            modem_id: 1,
            slots: Vec::new(),
            reference: MacReference::StartOfDay,
            start_cycle_in_middle: false,
            allowed_skew: Duration::from_secs(2),
        }
    }
}

/// One fired slot. `initiate` is set when this node should transmit.
#[derive(Debug, Clone)]
pub struct SlotTick {
    pub slot: ModemTransmission,
    pub initiate: bool,
}

/// The TDMA scheduler. Owns the slot list; call
/// [`MacManager::update`] after any mutation through
/// [`MacManager::slots_mut`].
#[derive(Debug)]
pub struct MacManager {
    clock: Clock,
    cfg: MacConfig,
    slots: Vec<ModemTransmission>,
    current: usize,
    next_slot_time: TimePoint,
    started_up: bool,
}

impl MacManager {
    pub fn new(clock: Clock) -> Self {
        MacManager {
            clock,
            cfg: MacConfig::default(),
            slots: Vec::new(),
            current: 0,
            next_slot_time: TimePoint::UNIX_EPOCH,
            started_up: false,
        }
    }

    /// Load `cfg` and begin the schedule. A `NoMac` configuration leaves
    /// the manager quiescent.
    pub fn startup(&mut self, cfg: MacConfig) {
        match cfg.mode {
            MacMode::Polled => debug!("using the centralized polling scheme"),
            MacMode::FixedDecentralized => debug!("using the decentralized fixed TDMA scheme"),
            MacMode::NoMac => {
                self.cfg = cfg;
                return;
            }
        }

        self.slots = cfg
            .slots
            .iter()
            .cloned()
            .enumerate()
            .map(|(i, mut slot)| {
                slot.slot_index = Some(i);
                slot
            })
            .collect();
        self.cfg = cfg;
        self.restart();
    }

    /// Restart a previously shut-down MAC with its current configuration.
    pub fn restart(&mut self) {
        debug!("medium access control starting up");
        if self.started_up {
            debug!("MAC is already started, not restarting");
            return;
        }
        self.started_up = true;
        self.update();
    }

    /// Stop the schedule until `restart` is called.
    pub fn shutdown(&mut self) {
        self.current = 0;
        self.started_up = false;
        debug!("MAC cycle shut down until restarted");
    }

    pub fn running(&self) -> bool {
        self.started_up
    }

    /// Number of slots in one cycle.
    pub fn cycle_count(&self) -> usize {
        self.slots.len()
    }

    pub fn cycle_duration(&self) -> Duration {
        let micros: i64 = self
            .slots
            .iter()
            .map(|s| (s.slot_seconds * 1.0e6) as i64)
            .sum();
        Duration::from_micros(micros.max(0) as u64)
    }

    /// Mutable access to the cycle. Call [`MacManager::update`]
    /// afterwards; the running schedule is stale otherwise.
    pub fn slots_mut(&mut self) -> &mut Vec<ModemTransmission> {
        &mut self.slots
    }

    /// Re-plan after any slot-list mutation or a detected clock jump. An
    /// empty cycle stops the timer.
    pub fn update(&mut self) {
        debug!("updating MAC cycle");
        if self.slots.is_empty() {
            debug!("the MAC TDMA cycle is empty; stopping timer");
            self.started_up = false;
            return;
        }

        for (i, slot) in self.slots.iter_mut().enumerate() {
            slot.slot_index = Some(i);
        }

        self.current = 0;
        self.next_slot_time = self.next_cycle_time();
        debug!(
            "the next MAC TDMA cycle begins at {:?}",
            self.next_slot_time
        );

        if self.cfg.start_cycle_in_middle && self.slots.len() > 1 {
            debug!("starting next available slot (middle of cycle)");
            self.next_slot_time = self.next_slot_time - self.cycle_duration();
            let now = self.clock.now();
            while self.next_slot_time < now {
                self.increment_slot();
            }
            debug!("next slot at {:?}", self.next_slot_time);
        }
    }

    /// Fire the slot whose start time has passed, if any.
    pub fn do_work(&mut self) -> Option<SlotTick> {
        if self.started_up && self.clock.now() > self.next_slot_time {
            self.begin_slot()
        } else {
            None
        }
    }

    fn begin_slot(&mut self) -> Option<SlotTick> {
        let now = self.clock.now();
        let skew = now.micros_since(self.next_slot_time).unsigned_abs();
        if skew > self.cfg.allowed_skew.as_micros() as u64 {
            warn!("clock skew of {skew} us detected, re-planning MAC");
            self.update();
            return None;
        }

        let mut slot = self.slots[self.current].clone();
        slot.time = Some(self.next_slot_time);

        let initiate = match self.cfg.mode {
            // we always transmit (poll), but keep quiet when src is the
            // broadcast id
            MacMode::Polled => slot.src != BROADCAST_ID,
            // we only transmit when the slot source is us
            MacMode::FixedDecentralized => {
                slot.src == self.cfg.modem_id || slot.always_initiate
            }
            MacMode::NoMac => false,
        };

        if log::log_enabled!(log::Level::Debug) {
            let order: Vec<String> = self
                .slots
                .iter()
                .enumerate()
                .map(|(i, s)| {
                    let kind = match s.kind {
                        TransmissionKind::Data => "d",
                        TransmissionKind::DriverSpecific => "s",
                        TransmissionKind::Ack => "a",
                    };
                    let marker = if i == self.current { ">" } else { "" };
                    format!("{marker}{kind}{}/{}@{}", s.src, s.dest, s.rate)
                })
                .collect();
            debug!("cycle order: [ {} ]", order.join(" "));
        }

        self.increment_slot();
        debug!("next slot at {:?}", self.next_slot_time);

        Some(SlotTick { slot, initiate })
    }

    fn increment_slot(&mut self) {
        let seconds = self.slots[self.current].slot_seconds;
        self.next_slot_time += Duration::from_micros((seconds * 1.0e6) as u64);
        self.current = (self.current + 1) % self.slots.len();
    }

    /// Start of the next whole cycle relative to the configured
    /// reference.
    fn next_cycle_time(&self) -> TimePoint {
        let now = self.clock.now();
        let reference = match self.cfg.reference {
            MacReference::StartOfDay => now.start_of_day(),
            MacReference::Fixed(t) => t,
        };

        let cycle_micros = self.cycle_duration().as_micros() as i64;
        debug_assert!(cycle_micros > 0);
        let since_ref = now.micros_since(reference);
        let cycles_since_reference = since_ref.div_euclid(cycle_micros) + 1;
        debug!("{cycles_since_reference} cycles since reference {reference:?}");

        reference + Duration::from_micros((cycles_since_reference * cycle_micros) as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn two_slot_cfg(mode: MacMode) -> MacConfig {
        MacConfig {
            mode,
            modem_id: 1,
            slots: vec![
                ModemTransmission::slot(1, 2, 0, TransmissionKind::Data, 5.0),
                ModemTransmission::slot(2, 1, 0, TransmissionKind::Data, 5.0),
            ],
            reference: MacReference::Fixed(TimePoint::UNIX_EPOCH),
            start_cycle_in_middle: false,
            allowed_skew: Duration::from_secs(2),
        }
    }

    #[test]
    fn empty_cycle_goes_quiescent() {
        let clock = Clock::simulated(TimePoint::from_unix_seconds(11));
        let mut mac = MacManager::new(clock.clone());
        mac.startup(MacConfig {
            mode: MacMode::Polled,
            ..MacConfig::default()
        });
        assert!(!mac.running());
        clock.advance(Duration::from_secs(100));
        assert!(mac.do_work().is_none());
    }

    #[test]
    fn mutation_requires_update() {
        let clock = Clock::simulated(TimePoint::from_unix_seconds(11));
        let mut mac = MacManager::new(clock.clone());
        mac.startup(two_slot_cfg(MacMode::Polled));
        assert!(mac.running());

        mac.slots_mut().clear();
        mac.update();
        assert!(!mac.running());
    }

    #[test]
    fn clock_jump_drops_one_slot_and_replans() {
        let clock = Clock::simulated(TimePoint::from_unix_seconds(11));
        let mut mac = MacManager::new(clock.clone());
        mac.startup(two_slot_cfg(MacMode::Polled));

        // jump far past the scheduled slot
        clock.set(TimePoint::from_unix_seconds(1000));
        assert!(mac.do_work().is_none(), "skewed slot must be dropped");
        assert!(mac.running());

        // schedule recovered: next fire is on a cycle boundary
        clock.set(TimePoint::from_unix_micros(1_010_000_001));
        let tick = mac.do_work().unwrap();
        assert_eq!(tick.slot.src, 1);
    }
}
