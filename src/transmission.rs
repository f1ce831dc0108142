//! The wire-independent unit of traffic.
//!
//! A [`ModemTransmission`] serves three roles, exactly as it moves through
//! the stack:
//!
//! 1. **Slot template** — the MAC cycle is a list of transmissions
//!    carrying `slot_seconds` and the addressing for that slot.
//! 2. **Data request** — a driver fills in `max_frame_bytes` /
//!    `max_num_frames` and hands the message to the queue layer, which
//!    appends `frames`.
//! 3. **Received message / ACK** — inbound traffic decoded by a driver.
//!
//! Once a transmission is handed to a driver, only `frames`,
//! `ack_requested` and the two capacity hints may change; addressing and
//! kind are fixed.

use serde::{Deserialize, Serialize};

use crate::clock::TimePoint;
use crate::consts::{ModemId, QUERY_DESTINATION_ID, QUERY_SOURCE_ID};

/// What a transmission carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum TransmissionKind {
    /// Application payload frames.
    #[default]
    Data,
    /// Acknowledgment of one or more frames (`acked_frames`).
    Ack,
    /// Hardware-specific transaction (ping, ranging, third-party poll).
    DriverSpecific,
}

/// Driver-specific transaction details for [`TransmissionKind::DriverSpecific`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DriverSpecific {
    /// Store-server third-party poll executed on behalf of `src`.
    StorePoll { src: ModemId, dest: ModemId },
    /// Benthos acoustic two-way ranging to `dest`.
    BenthosRange { dest: ModemId },
}

/// One message across a telemetry link. See the module docs for the three
/// lifecycles this struct moves through.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModemTransmission {
    pub src: ModemId,
    pub dest: ModemId,
    /// Clock time of the send or receive event.
    pub time: Option<TimePoint>,
    /// Abstract bitrate code; meaningful only within a driver.
    pub rate: i32,
    pub kind: TransmissionKind,
    /// Maximum number of frames the driver can carry in this transmission.
    pub max_num_frames: u32,
    /// Maximum bytes per frame; `None` until a driver fills the hint.
    pub max_frame_bytes: Option<u32>,
    /// Whether the receiver must ACK each accepted frame index. `None`
    /// means "not yet decided": on a data request it lets the queue layer
    /// choose, and on the wire it reads as false.
    pub ack_requested: Option<bool>,
    /// Absolute index of `frames[0]` in the transmitter's frame counter.
    pub frame_start: Option<u32>,
    /// Opaque payload frames.
    pub frames: Vec<Vec<u8>>,
    /// Frame indices accepted, when `kind == Ack`.
    pub acked_frames: Vec<u32>,
    /// Slot length; populated on MAC slot templates and ticks.
    pub slot_seconds: f64,
    /// Index of the slot within its cycle; populated on a MAC tick.
    pub slot_index: Option<usize>,
    /// MAC slot flag: initiate even when `src` is not this node.
    pub always_initiate: bool,
    pub driver_specific: Option<DriverSpecific>,
}

impl Default for ModemTransmission {
    fn default() -> Self {
        ModemTransmission {
            src: QUERY_SOURCE_ID,
            dest: QUERY_DESTINATION_ID,
            time: None,
            rate: 0,
            kind: TransmissionKind::Data,
            max_num_frames: 1,
            max_frame_bytes: None,
            ack_requested: None,
            frame_start: None,
            frames: Vec::new(),
            acked_frames: Vec::new(),
            slot_seconds: 10.0,
            slot_index: None,
            always_initiate: false,
            driver_specific: None,
        }
    }
}

impl ModemTransmission {
    /// Shorthand for a slot template (`src`, `dest`, `rate`, `seconds`).
    pub fn slot(
        src: ModemId,
        dest: ModemId,
        rate: i32,
        kind: TransmissionKind,
        slot_seconds: f64,
    ) -> Self {
        ModemTransmission {
            src,
            dest,
            rate,
            kind,
            slot_seconds,
            ..Default::default()
        }
    }

    /// An ACK for every frame of `msg`, addressed back to its sender.
    pub fn ack_of(msg: &ModemTransmission) -> Self {
        ModemTransmission {
            src: msg.dest,
            dest: msg.src,
            rate: msg.rate,
            kind: TransmissionKind::Ack,
            acked_frames: (0..msg.frames.len() as u32)
                .map(|i| msg.frame_start.unwrap_or(0) + i)
                .collect(),
            ..Default::default()
        }
    }

    /// The ACK flag as it reads on the wire (`None` → false).
    pub fn wants_ack(&self) -> bool {
        self.ack_requested.unwrap_or(false)
    }

    /// Total bytes across all frames.
    pub fn frame_bytes(&self) -> usize {
        self.frames.iter().map(Vec::len).sum()
    }

    /// True when no frame carries payload.
    pub fn frames_empty(&self) -> bool {
        self.frames.is_empty() || self.frames[0].is_empty()
    }
}

/// A raw line or datagram as it crossed the modem boundary; emitted on the
/// raw-tee events for logging and analysis.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModemRaw {
    pub raw: Vec<u8>,
}

/// Health of a driver, for the reset policy and operator displays.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum DriverStatus {
    #[default]
    Nominal,
    StartupFailed,
    ConnectionToModemFailed,
    ModemNotResponding,
}

/// Modem availability and signal quality, as far as the hardware reports
/// it (`+CIEV` on Iridium).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ModemReport {
    pub status: DriverStatus,
    /// Received signal strength indication, 0-5 on Iridium.
    pub rssi: Option<i32>,
    pub service_available: Option<bool>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ack_covers_every_frame() {
        let msg = ModemTransmission {
            src: 1,
            dest: 2,
            frame_start: Some(7),
            frames: vec![b"a".to_vec(), b"b".to_vec()],
            ..Default::default()
        };
        let ack = ModemTransmission::ack_of(&msg);
        assert_eq!(ack.src, 2);
        assert_eq!(ack.dest, 1);
        assert_eq!(ack.kind, TransmissionKind::Ack);
        assert_eq!(ack.acked_frames, vec![7, 8]);
    }

    #[test]
    fn empty_frame_detection() {
        let mut msg = ModemTransmission::default();
        assert!(msg.frames_empty());
        msg.frames.push(Vec::new());
        assert!(msg.frames_empty());
        msg.frames[0].push(1);
        assert!(!msg.frames_empty());
    }
}
