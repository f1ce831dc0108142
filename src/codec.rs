//! The seam between the queue layer and the application's serializer.
//!
//! The link stack never inspects application messages; it only needs to
//! turn them into bytes (once, at push time, to learn the encoded size),
//! back again on receive, and to read the occasional addressing field out
//! of a message for the queue role mapping.

use std::fmt;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum CodecError {
    #[error("encode failed: {0}")]
    Encode(String),
    #[error("decode failed: {0}")]
    Decode(String),
}

/// Application message translator.
///
/// `decode_all` must consume a whole frame: encoded messages are packed
/// back-to-back into a frame by the queue manager, so encodings are
/// required to be self-delimiting.
pub trait Codec {
    type Message: Clone + fmt::Debug;

    fn encode(&self, msg: &Self::Message) -> Result<Vec<u8>, CodecError>;

    /// Decode every message packed into `frame`, in order.
    fn decode_all(&self, frame: &[u8]) -> Result<Vec<Self::Message>, CodecError>;

    /// Bytes `msg` will occupy inside a frame.
    fn size_of_encoded(&self, msg: &Self::Message) -> Result<usize, CodecError> {
        Ok(self.encode(msg)?.len())
    }

    /// Stable identity of the message *type*; used to pick the queue an
    /// inbound message belongs to.
    fn message_id(&self, msg: &Self::Message) -> u32;

    /// Look up a named integer field inside the message, for queue roles
    /// resolved from message content. `None` when the codec does not
    /// expose the field.
    fn field(&self, _msg: &Self::Message, _name: &str) -> Option<i64> {
        None
    }
}

/// Length-delimited raw-bytes codec: each message is one `Vec<u8>` framed
/// as a big-endian `u16` length plus the bytes. Used by the simulators
/// and tests; real applications bring their own `Codec`.
#[derive(Debug, Clone, Copy, Default)]
pub struct RawCodec;

impl Codec for RawCodec {
    type Message = Vec<u8>;

    fn encode(&self, msg: &Vec<u8>) -> Result<Vec<u8>, CodecError> {
        if msg.len() > u16::MAX as usize {
            return Err(CodecError::Encode(format!(
                "message of {} bytes exceeds u16 length prefix",
                msg.len()
            )));
        }
        let mut out = Vec::with_capacity(2 + msg.len());
        out.extend_from_slice(&(msg.len() as u16).to_be_bytes());
        out.extend_from_slice(msg);
        Ok(out)
    }

    fn decode_all(&self, frame: &[u8]) -> Result<Vec<Vec<u8>>, CodecError> {
        let mut out = Vec::new();
        let mut rest = frame;
        while !rest.is_empty() {
            if rest.len() < 2 {
                return Err(CodecError::Decode("truncated length prefix".into()));
            }
            let len = u16::from_be_bytes([rest[0], rest[1]]) as usize;
            if rest.len() < 2 + len {
                return Err(CodecError::Decode(format!(
                    "length prefix {} exceeds remaining {} bytes",
                    len,
                    rest.len() - 2
                )));
            }
            out.push(rest[2..2 + len].to_vec());
            rest = &rest[2 + len..];
        }
        Ok(out)
    }

    fn size_of_encoded(&self, msg: &Vec<u8>) -> Result<usize, CodecError> {
        Ok(2 + msg.len())
    }

    fn message_id(&self, _msg: &Vec<u8>) -> u32 {
        0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn raw_codec_packs_back_to_back() {
        let codec = RawCodec;
        let mut frame = codec.encode(&b"abc".to_vec()).unwrap();
        frame.extend(codec.encode(&b"".to_vec()).unwrap());
        frame.extend(codec.encode(&b"hello".to_vec()).unwrap());

        let decoded = codec.decode_all(&frame).unwrap();
        assert_eq!(decoded, vec![b"abc".to_vec(), Vec::new(), b"hello".to_vec()]);
    }

    #[test]
    fn raw_codec_rejects_truncation() {
        let codec = RawCodec;
        let frame = codec.encode(&b"abcdef".to_vec()).unwrap();
        assert!(codec.decode_all(&frame[..4]).is_err());
        assert!(codec.decode_all(&frame[..1]).is_err());
    }
}
