//! Iridium DirectIP gateway message formats.
//!
//! Every DirectIP message is a 3-byte pre-header (protocol revision 1
//! plus a big-endian overall length) followed by information elements,
//! each `[iei, len_hi, len_lo, body…]`. The shore driver writes MT
//! messages and reads MO deliveries and MT confirmations.

use crate::consts::BITS_IN_BYTE;

use super::PacketError;

pub const PROTOCOL_REVISION: u8 = 1;

pub const IEI_MO_HEADER: u8 = 0x01;
pub const IEI_MO_PAYLOAD: u8 = 0x02;
pub const IEI_MT_HEADER: u8 = 0x41;
pub const IEI_MT_PAYLOAD: u8 = 0x42;
pub const IEI_MT_CONFIRMATION: u8 = 0x44;

const PRE_HEADER_SIZE: usize = 3;
const IE_HEADER_SIZE: usize = 3;
const MT_HEADER_SIZE: usize = 21;
const MO_HEADER_SIZE: usize = 28;
const IMEI_SIZE: usize = 15;

/// Flush any queued MT messages at the gateway when this one arrives.
pub const DISP_FLAG_FLUSH_MT_QUEUE: u16 = 0x01;

fn push_ie(out: &mut Vec<u8>, iei: u8, body: &[u8]) {
    out.push(iei);
    out.push(((body.len() >> BITS_IN_BYTE) & 0xff) as u8);
    out.push((body.len() & 0xff) as u8);
    out.extend_from_slice(body);
}

fn imei_bytes(imei: &str) -> Result<[u8; IMEI_SIZE], PacketError> {
    if imei.len() != IMEI_SIZE || !imei.bytes().all(|b| b.is_ascii_digit()) {
        return Err(PacketError::OutOfRange("imei"));
    }
    let mut out = [0u8; IMEI_SIZE];
    out.copy_from_slice(imei.as_bytes());
    Ok(out)
}

fn finish_message(elements: Vec<u8>) -> Vec<u8> {
    let mut out = Vec::with_capacity(PRE_HEADER_SIZE + elements.len());
    out.push(PROTOCOL_REVISION);
    out.push(((elements.len() >> BITS_IN_BYTE) & 0xff) as u8);
    out.push((elements.len() & 0xff) as u8);
    out.extend_from_slice(&elements);
    out
}

/// Build a mobile-terminated message for `imei`: MT header (with the
/// flush-queue disposition) plus the payload element.
pub fn mt_message(payload: &[u8], imei: &str, client_id: u32) -> Result<Vec<u8>, PacketError> {
    let mut header = Vec::with_capacity(MT_HEADER_SIZE);
    header.extend_from_slice(&client_id.to_be_bytes());
    header.extend_from_slice(&imei_bytes(imei)?);
    header.extend_from_slice(&DISP_FLAG_FLUSH_MT_QUEUE.to_be_bytes());
    debug_assert_eq!(header.len(), MT_HEADER_SIZE);

    let mut elements = Vec::new();
    push_ie(&mut elements, IEI_MT_HEADER, &header);
    push_ie(&mut elements, IEI_MT_PAYLOAD, payload);
    Ok(finish_message(elements))
}

/// Build a mobile-originated delivery, as the gateway would send it to
/// the shore server. Used by the simulators and tests.
pub fn mo_message(
    payload: &[u8],
    imei: &str,
    cdr_reference: u32,
    momsn: u16,
    mtmsn: u16,
    session_time: u32,
) -> Result<Vec<u8>, PacketError> {
    let mut header = Vec::with_capacity(MO_HEADER_SIZE);
    header.extend_from_slice(&cdr_reference.to_be_bytes());
    header.extend_from_slice(&imei_bytes(imei)?);
    header.push(0); // session status: success
    header.extend_from_slice(&momsn.to_be_bytes());
    header.extend_from_slice(&mtmsn.to_be_bytes());
    header.extend_from_slice(&session_time.to_be_bytes());
    debug_assert_eq!(header.len(), MO_HEADER_SIZE);

    let mut elements = Vec::new();
    push_ie(&mut elements, IEI_MO_HEADER, &header);
    push_ie(&mut elements, IEI_MO_PAYLOAD, payload);
    Ok(finish_message(elements))
}

/// Build the confirmation the gateway returns for an MT submission.
pub fn mt_confirmation(
    client_id: u32,
    imei: &str,
    auto_id: u32,
    status: i16,
) -> Result<Vec<u8>, PacketError> {
    let mut body = Vec::new();
    body.extend_from_slice(&client_id.to_be_bytes());
    body.extend_from_slice(&imei_bytes(imei)?);
    body.extend_from_slice(&auto_id.to_be_bytes());
    body.extend_from_slice(&status.to_be_bytes());

    let mut elements = Vec::new();
    push_ie(&mut elements, IEI_MT_CONFIRMATION, &body);
    Ok(finish_message(elements))
}

/// A parsed DirectIP message: the information elements in wire order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirectIpMessage {
    pub elements: Vec<(u8, Vec<u8>)>,
}

impl DirectIpMessage {
    pub fn element(&self, iei: u8) -> Option<&[u8]> {
        self.elements
            .iter()
            .find(|(i, _)| *i == iei)
            .map(|(_, body)| body.as_slice())
    }

    /// The MO header fields, when this is an MO delivery.
    pub fn mo_header(&self) -> Option<MoHeader> {
        let body = self.element(IEI_MO_HEADER)?;
        if body.len() != MO_HEADER_SIZE {
            return None;
        }
        Some(MoHeader {
            cdr_reference: u32::from_be_bytes([body[0], body[1], body[2], body[3]]),
            imei: String::from_utf8_lossy(&body[4..19]).into_owned(),
            session_status: body[19],
            momsn: u16::from_be_bytes([body[20], body[21]]),
            mtmsn: u16::from_be_bytes([body[22], body[23]]),
            session_time: u32::from_be_bytes([body[24], body[25], body[26], body[27]]),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MoHeader {
    pub cdr_reference: u32,
    pub imei: String,
    pub session_status: u8,
    pub momsn: u16,
    pub mtmsn: u16,
    pub session_time: u32,
}

/// Incremental reader for one DirectIP message off a byte stream.
#[derive(Debug, Default)]
pub struct DirectIpReader {
    buf: Vec<u8>,
}

impl DirectIpReader {
    pub fn new() -> Self {
        DirectIpReader::default()
    }

    pub fn push(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    /// Parse and remove one complete message, if buffered.
    pub fn take_message(&mut self) -> Option<Result<DirectIpMessage, PacketError>> {
        if self.buf.len() < PRE_HEADER_SIZE {
            return None;
        }
        if self.buf[0] != PROTOCOL_REVISION {
            return Some(Err(PacketError::OutOfRange("protocol revision")));
        }
        let overall = u16::from_be_bytes([self.buf[1], self.buf[2]]) as usize;
        if self.buf.len() < PRE_HEADER_SIZE + overall {
            return None;
        }

        let body: Vec<u8> = self
            .buf
            .drain(..PRE_HEADER_SIZE + overall)
            .skip(PRE_HEADER_SIZE)
            .collect();
        let mut elements = Vec::new();
        let mut rest = body.as_slice();
        while !rest.is_empty() {
            if rest.len() < IE_HEADER_SIZE {
                return Some(Err(PacketError::TooShort {
                    got: rest.len(),
                    need: IE_HEADER_SIZE,
                }));
            }
            let iei = rest[0];
            let len = u16::from_be_bytes([rest[1], rest[2]]) as usize;
            if rest.len() < IE_HEADER_SIZE + len {
                return Some(Err(PacketError::TooShort {
                    got: rest.len(),
                    need: IE_HEADER_SIZE + len,
                }));
            }
            elements.push((iei, rest[IE_HEADER_SIZE..IE_HEADER_SIZE + len].to_vec()));
            rest = &rest[IE_HEADER_SIZE + len..];
        }
        Some(Ok(DirectIpMessage { elements }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const IMEI: &str = "300234010753370";

    #[test]
    fn mt_message_layout_is_byte_exact() {
        let msg = mt_message(b"PAYLOAD", IMEI, 7).unwrap();

        // pre-header: revision 1, overall length
        assert_eq!(msg[0], 1);
        let overall = u16::from_be_bytes([msg[1], msg[2]]) as usize;
        assert_eq!(overall, msg.len() - 3);

        // MT header element
        assert_eq!(&msg[3..6], &[0x41, 0x00, 0x15]);
        assert_eq!(&msg[6..10], &7u32.to_be_bytes());
        assert_eq!(&msg[10..25], IMEI.as_bytes());
        assert_eq!(&msg[25..27], &[0x00, 0x01]); // flush MT queue

        // payload element
        assert_eq!(&msg[27..30], &[0x42, 0x00, 0x07]);
        assert_eq!(&msg[30..], b"PAYLOAD");
    }

    #[test]
    fn reader_reassembles_split_messages() {
        let msg = mo_message(b"mo bytes", IMEI, 1234, 10, 0, 60).unwrap();

        let mut reader = DirectIpReader::new();
        reader.push(&msg[..5]);
        assert!(reader.take_message().is_none());
        reader.push(&msg[5..]);
        let parsed = reader.take_message().unwrap().unwrap();

        assert_eq!(parsed.element(IEI_MO_PAYLOAD).unwrap(), b"mo bytes");
        let header = parsed.mo_header().unwrap();
        assert_eq!(header.imei, IMEI);
        assert_eq!(header.momsn, 10);
        assert_eq!(header.cdr_reference, 1234);
    }

    #[test]
    fn confirmation_round_trips() {
        let msg = mt_confirmation(7, IMEI, 99, 1).unwrap();
        let mut reader = DirectIpReader::new();
        reader.push(&msg);
        let parsed = reader.take_message().unwrap().unwrap();
        let body = parsed.element(IEI_MT_CONFIRMATION).unwrap();
        assert_eq!(&body[..4], &7u32.to_be_bytes());
        assert_eq!(&body[19..23], &99u32.to_be_bytes());
    }

    #[test]
    fn bad_imei_is_rejected() {
        assert!(mt_message(b"x", "not-an-imei", 0).is_err());
        assert!(mt_message(b"x", "12345", 0).is_err());
    }
}
