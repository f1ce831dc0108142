//! The compact wire header prefixed to every Iridium (and store-server)
//! payload.
//!
//! Field widths: `src` and `dest` 22 bits, `kind` 3 bits, then four
//! optional fields each announced by a presence bit: `rate` (4),
//! `ack_requested` (1), `frame_start` (11), `acked_frame` (11). Bits are
//! written LSB-first into little-endian bytes and the header pads to a
//! whole byte, so the frame body that follows stays byte-aligned. Total
//! size: 7 to 10 bytes.

use crate::consts::ModemId;
use crate::transmission::{ModemTransmission, TransmissionKind};

use super::PacketError;

const ADDR_BITS: u32 = 22;
const KIND_BITS: u32 = 3;
const RATE_BITS: u32 = 4;
const FRAME_BITS: u32 = 11;

/// Largest encoded header.
pub const MAX_HEADER_BYTES: usize = 10;

#[derive(Debug, Default)]
struct BitWriter {
    bytes: Vec<u8>,
    bit: u32,
}

impl BitWriter {
    fn put(&mut self, value: u32, bits: u32) {
        debug_assert!(bits == 32 || value < (1u32 << bits));
        for i in 0..bits {
            if self.bit % 8 == 0 {
                self.bytes.push(0);
            }
            if (value >> i) & 1 == 1 {
                let idx = (self.bit / 8) as usize;
                self.bytes[idx] |= 1 << (self.bit % 8);
            }
            self.bit += 1;
        }
    }

    fn finish(self) -> Vec<u8> {
        self.bytes
    }
}

#[derive(Debug)]
struct BitReader<'a> {
    bytes: &'a [u8],
    bit: u32,
}

impl<'a> BitReader<'a> {
    fn new(bytes: &'a [u8]) -> Self {
        BitReader { bytes, bit: 0 }
    }

    fn take(&mut self, bits: u32) -> Result<u32, PacketError> {
        let mut value = 0u32;
        for i in 0..bits {
            let idx = (self.bit / 8) as usize;
            if idx >= self.bytes.len() {
                return Err(PacketError::TooShort {
                    got: self.bytes.len(),
                    need: idx + 1,
                });
            }
            if (self.bytes[idx] >> (self.bit % 8)) & 1 == 1 {
                value |= 1 << i;
            }
            self.bit += 1;
        }
        Ok(value)
    }

    /// Bytes consumed, counting the partially used one.
    fn consumed(&self) -> usize {
        self.bit.div_ceil(8) as usize
    }
}

/// Addressing and control fields carried ahead of a frame body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IridiumHeader {
    pub src: u32,
    pub dest: u32,
    pub kind: TransmissionKind,
    pub rate: Option<u8>,
    pub ack_requested: Option<bool>,
    pub frame_start: Option<u32>,
    pub acked_frame: Option<u32>,
}

impl IridiumHeader {
    pub fn from_transmission(msg: &ModemTransmission) -> Result<Self, PacketError> {
        let addr = |id: ModemId, what: &'static str| -> Result<u32, PacketError> {
            if id < 0 || id >= (1 << ADDR_BITS) {
                return Err(PacketError::OutOfRange(what));
            }
            Ok(id as u32)
        };
        let rate = if msg.rate >= 0 && msg.rate < (1 << RATE_BITS) {
            Some(msg.rate as u8)
        } else {
            return Err(PacketError::OutOfRange("rate"));
        };
        Ok(IridiumHeader {
            src: addr(msg.src, "src")?,
            dest: addr(msg.dest, "dest")?,
            kind: msg.kind,
            rate,
            ack_requested: msg.ack_requested,
            frame_start: msg.frame_start.map(|f| f % (1u32 << FRAME_BITS)),
            acked_frame: msg
                .acked_frames
                .first()
                .map(|f| f % (1u32 << FRAME_BITS)),
        })
    }

    /// Expand back into a transmission (frames still empty).
    pub fn into_transmission(self) -> ModemTransmission {
        ModemTransmission {
            src: self.src as ModemId,
            dest: self.dest as ModemId,
            rate: self.rate.map(i32::from).unwrap_or(0),
            kind: self.kind,
            ack_requested: self.ack_requested,
            frame_start: self.frame_start,
            acked_frames: self.acked_frame.into_iter().collect(),
            ..Default::default()
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut w = BitWriter::default();
        w.put(self.src, ADDR_BITS);
        w.put(self.dest, ADDR_BITS);
        w.put(
            match self.kind {
                TransmissionKind::Data => 0,
                TransmissionKind::Ack => 1,
                TransmissionKind::DriverSpecific => 2,
            },
            KIND_BITS,
        );

        let mut optional = |value: Option<u32>, bits: u32| match value {
            Some(v) => {
                w.put(1, 1);
                w.put(v, bits);
            }
            None => w.put(0, 1),
        };
        optional(self.rate.map(u32::from), RATE_BITS);
        optional(self.ack_requested.map(u32::from), 1);
        optional(self.frame_start, FRAME_BITS);
        optional(self.acked_frame, FRAME_BITS);
        w.finish()
    }

    /// Decode a header from the front of `bytes`; also returns how many
    /// bytes it occupied (the frame body starts there).
    pub fn decode(bytes: &[u8]) -> Result<(Self, usize), PacketError> {
        let mut r = BitReader::new(bytes);
        let src = r.take(ADDR_BITS)?;
        let dest = r.take(ADDR_BITS)?;
        let kind = match r.take(KIND_BITS)? {
            0 => TransmissionKind::Data,
            1 => TransmissionKind::Ack,
            2 => TransmissionKind::DriverSpecific,
            _ => return Err(PacketError::OutOfRange("kind")),
        };

        let mut optional = |bits: u32| -> Result<Option<u32>, PacketError> {
            if r.take(1)? == 1 {
                Ok(Some(r.take(bits)?))
            } else {
                Ok(None)
            }
        };
        let rate = optional(RATE_BITS)?.map(|v| v as u8);
        let ack_requested = optional(1)?.map(|v| v == 1);
        let frame_start = optional(FRAME_BITS)?;
        let acked_frame = optional(FRAME_BITS)?;

        let consumed = r.consumed();
        Ok((
            IridiumHeader {
                src,
                dest,
                kind,
                rate,
                ack_requested,
                frame_start,
                acked_frame,
            },
            consumed,
        ))
    }
}

/// `header ‖ first frame body`, the payload layout of every SBD and
/// RUDICS packet.
pub fn serialize_modem_message(msg: &ModemTransmission) -> Result<Vec<u8>, PacketError> {
    let mut out = IridiumHeader::from_transmission(msg)?.encode();
    if let Some(frame) = msg.frames.first() {
        out.extend_from_slice(frame);
    }
    Ok(out)
}

/// Reverse of [`serialize_modem_message`].
pub fn parse_modem_message(bytes: &[u8]) -> Result<ModemTransmission, PacketError> {
    let (header, consumed) = IridiumHeader::decode(bytes)?;
    let mut msg = header.into_transmission();
    if bytes.len() > consumed {
        msg.frames.push(bytes[consumed..].to_vec());
    }
    Ok(msg)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn minimal_header_is_seven_bytes() {
        let header = IridiumHeader {
            src: 1,
            dest: 2,
            kind: TransmissionKind::Data,
            rate: None,
            ack_requested: None,
            frame_start: None,
            acked_frame: None,
        };
        // 22+22+3 fixed + 4 presence bits = 51 bits
        assert_eq!(header.encode().len(), 7);
        let (decoded, consumed) = IridiumHeader::decode(&header.encode()).unwrap();
        assert_eq!(decoded, header);
        assert_eq!(consumed, 7);
    }

    #[test]
    fn full_header_round_trips() {
        let header = IridiumHeader {
            src: 0x3fffff,
            dest: 0x2aaaaa,
            kind: TransmissionKind::Ack,
            rate: Some(0xf),
            ack_requested: Some(true),
            frame_start: Some(0x7ff),
            acked_frame: Some(0x555),
        };
        let encoded = header.encode();
        assert_eq!(encoded.len(), MAX_HEADER_BYTES);
        let (decoded, consumed) = IridiumHeader::decode(&encoded).unwrap();
        assert_eq!(decoded, header);
        assert_eq!(consumed, MAX_HEADER_BYTES);
    }

    #[test]
    fn message_with_body_round_trips() {
        let msg = ModemTransmission {
            src: 300,
            dest: 2,
            rate: 1,
            kind: TransmissionKind::Data,
            ack_requested: Some(true),
            frame_start: Some(42),
            frames: vec![b"HELLOWORLD".to_vec()],
            ..Default::default()
        };
        let bytes = serialize_modem_message(&msg).unwrap();
        let parsed = parse_modem_message(&bytes).unwrap();
        assert_eq!(parsed.src, 300);
        assert_eq!(parsed.dest, 2);
        assert_eq!(parsed.rate, 1);
        assert_eq!(parsed.frame_start, Some(42));
        assert_eq!(parsed.frames, vec![b"HELLOWORLD".to_vec()]);
    }

    #[test]
    fn frame_counters_wrap_at_eleven_bits() {
        let msg = ModemTransmission {
            src: 1,
            dest: 2,
            frame_start: Some(2048 + 5),
            ..Default::default()
        };
        let header = IridiumHeader::from_transmission(&msg).unwrap();
        assert_eq!(header.frame_start, Some(5));
    }

    #[test]
    fn negative_ids_are_rejected() {
        let msg = ModemTransmission::default(); // src/dest are query ids
        assert!(matches!(
            IridiumHeader::from_transmission(&msg),
            Err(PacketError::OutOfRange(_))
        ));
    }
}
