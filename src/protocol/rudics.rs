//! RUDICS byte-stream packet framing.
//!
//! A RUDICS call is a raw `\r`-framed byte stream, so payload bytes must
//! never alias the delimiter (or NUL, which the Iridium gateway sometimes
//! injects). Payloads are therefore bit-packed: the payload (plus a
//! 16-bit additive checksum) is emitted MSB-first in 7-bit groups, each
//! group carried in one byte with the top bit set, then terminated with a
//! single `\r`. Every encoded byte lies in `0x80..=0xFF`.
//!
//! The same packing without the checksum (`pack`/`unpack`) frames the
//! payload bodies inside Benthos CLAM data lines.

use super::{PacketError, sbd};

const DELIMITER: u8 = b'\r';

fn pack_bits(bytes: &[u8]) -> Vec<u8> {
    let nbits = bytes.len() * 8;
    let ngroups = nbits.div_ceil(7);
    let mut out = Vec::with_capacity(ngroups + 1);

    let bit = |i: usize| -> u8 {
        if i < nbits {
            (bytes[i / 8] >> (7 - i % 8)) & 1
        } else {
            0 // zero padding in the final group
        }
    };

    for g in 0..ngroups {
        let mut group = 0u8;
        for k in 0..7 {
            group = (group << 1) | bit(g * 7 + k);
        }
        out.push(0x80 | group);
    }
    out.push(DELIMITER);
    out
}

fn unpack_bits(packet: &[u8]) -> Result<Vec<u8>, PacketError> {
    let body = match packet.split_last() {
        Some((&DELIMITER, body)) => body,
        _ => return Err(PacketError::MissingTerminator),
    };

    let nbits = body.len() * 7;
    let nbytes = nbits / 8;
    let mut out = vec![0u8; nbytes];

    let mut acc: u32 = 0;
    let mut acc_bits = 0;
    let mut idx = 0;
    for &b in body {
        if b < 0x80 {
            return Err(PacketError::InvalidEncoding(b));
        }
        acc = (acc << 7) | (b & 0x7f) as u32;
        acc_bits += 7;
        while acc_bits >= 8 && idx < nbytes {
            acc_bits -= 8;
            out[idx] = ((acc >> acc_bits) & 0xff) as u8;
            idx += 1;
        }
    }
    // whatever is left is padding and must be zero
    if acc_bits > 0 && (acc & ((1u32 << acc_bits) - 1)) != 0 {
        return Err(PacketError::BadPadding);
    }
    Ok(out)
}

/// Frame `bytes` with the inner checksum, bit-packed and `\r`-terminated.
pub fn encode(bytes: &[u8]) -> Vec<u8> {
    pack_bits(&sbd::append_checksum(bytes))
}

/// Reverse of [`encode`]; verifies and strips the inner checksum.
pub fn decode(packet: &[u8]) -> Result<Vec<u8>, PacketError> {
    let body = unpack_bits(packet)?;
    sbd::verify_checksum(&body).map(<[u8]>::to_vec)
}

/// Bit-pack without the inner checksum (Benthos frame bodies, which ride
/// inside an already-checksummed report).
pub fn pack(bytes: &[u8]) -> Vec<u8> {
    pack_bits(bytes)
}

/// Reverse of [`pack`].
pub fn unpack(packet: &[u8]) -> Result<Vec<u8>, PacketError> {
    unpack_bits(packet)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encoded_bytes_avoid_delimiter_and_nul() {
        // every byte value appears in the payload
        let payload: Vec<u8> = (0..=255u8).collect();
        let packet = encode(&payload);
        let (last, body) = packet.split_last().unwrap();
        assert_eq!(*last, b'\r');
        for &b in body {
            assert!(b >= 0x80, "encoded byte {b:#04x} could alias a delimiter");
        }
    }

    #[test]
    fn round_trip() {
        for payload in [
            Vec::new(),
            b"g".to_vec(),
            b"goby\rrudics\0payload".to_vec(),
            (0..=255u8).collect::<Vec<u8>>(),
        ] {
            let packet = encode(&payload);
            assert_eq!(decode(&packet).unwrap(), payload, "payload {payload:?}");
        }
    }

    #[test]
    fn corruption_is_detected() {
        let packet = encode(b"some payload bytes");
        // flip a payload bit inside an encoded group (not the MSB marker)
        let mut corrupt = packet.clone();
        corrupt[3] ^= 0x01;
        assert!(decode(&corrupt).is_err());

        // strip the terminator
        let unterminated = &packet[..packet.len() - 1];
        assert_eq!(decode(unterminated), Err(PacketError::MissingTerminator));

        // a low byte cannot appear in a valid packet
        let mut low = packet.clone();
        low[0] = 0x41;
        assert!(matches!(decode(&low), Err(PacketError::InvalidEncoding(_))));
    }

    #[test]
    fn unchecked_packing_round_trips() {
        let payload = b"\x00\x01\xfe\xff\r\n";
        let packet = pack(payload);
        assert_eq!(unpack(&packet).unwrap(), payload.to_vec());
    }
}
