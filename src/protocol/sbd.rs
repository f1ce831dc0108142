//! Short Burst Data checksums and the `+SBDRB` binary read framing.
//!
//! The SBD checksum is the least-significant 16 bits of the byte sum of
//! the message, big-endian on the wire (ISU AT Command Reference). A
//! `+SBDRB` response is `[len_hi, len_lo] ‖ payload ‖ [ck_hi, ck_lo]`
//! where `len` counts only the payload.

use super::PacketError;

/// Sum of bytes, modulo 2^16.
pub fn checksum(data: &[u8]) -> u16 {
    data.iter().fold(0u16, |sum, b| sum.wrapping_add(*b as u16))
}

/// `data ‖ checksum`, as written to the modem after an `+SBDWB` READY.
pub fn append_checksum(data: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(data.len() + 2);
    out.extend_from_slice(data);
    out.extend_from_slice(&checksum(data).to_be_bytes());
    out
}

/// Split `data ‖ checksum`, verifying the trailer.
pub fn verify_checksum(data: &[u8]) -> Result<&[u8], PacketError> {
    if data.len() < 2 {
        return Err(PacketError::TooShort {
            got: data.len(),
            need: 2,
        });
    }
    let (payload, trailer) = data.split_at(data.len() - 2);
    let carried = u16::from_be_bytes([trailer[0], trailer[1]]);
    let computed = checksum(payload);
    if computed != carried {
        return Err(PacketError::BadChecksum { computed, carried });
    }
    Ok(payload)
}

/// Incremental reassembly of one `+SBDRB` binary response.
///
/// The response arrives in pieces (the line framing splits on `\r`, which
/// may appear inside the binary body), so bytes are accumulated until the
/// length field is satisfied. The trailing checksum is verified and
/// stripped.
#[derive(Debug, Default)]
pub struct SbdReadBuffer {
    buf: Vec<u8>,
}

impl SbdReadBuffer {
    pub fn new() -> Self {
        SbdReadBuffer::default()
    }

    pub fn clear(&mut self) {
        self.buf.clear();
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    /// Feed bytes as they come off the wire. Returns the payload once
    /// complete (or the checksum error), and resets for the next read.
    pub fn push(&mut self, bytes: &[u8]) -> Option<Result<Vec<u8>, PacketError>> {
        // discard a leftover '\n' from the previous response
        if self.buf.is_empty() && bytes.first() == Some(&b'\n') {
            self.buf.extend_from_slice(&bytes[1..]);
        } else {
            self.buf.extend_from_slice(bytes);
        }

        if self.buf.len() < 2 {
            return None;
        }
        let size = u16::from_be_bytes([self.buf[0], self.buf[1]]) as usize;
        if self.buf.len() < 2 + size + 2 {
            return None; // keep building up the message
        }

        let body: Vec<u8> = self.buf.drain(..2 + size + 2).skip(2).collect();
        Some(verify_checksum(&body).map(<[u8]>::to_vec))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn checksum_is_byte_sum() {
        assert_eq!(checksum(b""), 0);
        assert_eq!(checksum(b"\x01\x02\x03"), 6);
        // sums wrap at 16 bits
        assert_eq!(checksum(&[0xff; 1000]), (1000u32 * 0xff % 65536) as u16);
        assert_eq!(checksum(b"HELLOWORLD"), 0x02fc);
    }

    #[test]
    fn verify_round_trip_and_bit_flip() {
        let packet = append_checksum(b"HELLOWORLD");
        assert_eq!(verify_checksum(&packet).unwrap(), b"HELLOWORLD");

        // flipping any payload bit must be caught
        for byte in 0..10 {
            for bit in 0..8 {
                let mut corrupt = packet.clone();
                corrupt[byte] ^= 1 << bit;
                assert!(
                    verify_checksum(&corrupt).is_err(),
                    "flip of byte {byte} bit {bit} not caught"
                );
            }
        }
    }

    #[test]
    fn read_buffer_reassembles_split_response() {
        let payload = b"HELLOWORLD";
        let mut wire = Vec::new();
        wire.extend_from_slice(&(payload.len() as u16).to_be_bytes());
        wire.extend_from_slice(&append_checksum(payload));

        let mut rb = SbdReadBuffer::new();
        // the line framing hands the body over in two pieces
        assert!(rb.push(&wire[..5]).is_none());
        let got = rb.push(&wire[5..]).unwrap().unwrap();
        assert_eq!(got, payload.to_vec());
        assert!(rb.is_empty());
    }

    #[test]
    fn read_buffer_discards_leading_newline() {
        let payload = [0x0d, 0x00, 0x41]; // contains a '\r'
        let mut wire = vec![b'\n'];
        wire.extend_from_slice(&(payload.len() as u16).to_be_bytes());
        wire.extend_from_slice(&append_checksum(&payload));

        let mut rb = SbdReadBuffer::new();
        let got = rb.push(&wire).unwrap().unwrap();
        assert_eq!(got, payload.to_vec());
    }

    #[test]
    fn read_buffer_flags_bad_checksum() {
        let payload = b"DATA";
        let mut wire = Vec::new();
        wire.extend_from_slice(&(payload.len() as u16).to_be_bytes());
        wire.extend_from_slice(payload);
        wire.extend_from_slice(&[0xde, 0xad]);

        let mut rb = SbdReadBuffer::new();
        assert!(rb.push(&wire).unwrap().is_err());
    }
}
