//! Wire codecs shared across drivers.
//!
//! These are pure byte-in/byte-out transforms with no I/O: the additive
//! SBD checksum and `+SBDRB` stream framing, the `\r`-delimited RUDICS
//! packing, the compact Iridium wire header, and the DirectIP gateway
//! message formats.

use thiserror::Error;

pub mod directip;
pub mod header;
pub mod rudics;
pub mod sbd;

/// Malformed or corrupted wire data. Protocol errors are logged and
/// dropped by the owning driver; they never abort anything.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum PacketError {
    #[error("packet too short ({got} bytes, need {need})")]
    TooShort { got: usize, need: usize },
    #[error("checksum mismatch (computed {computed:#06x}, carried {carried:#06x})")]
    BadChecksum { computed: u16, carried: u16 },
    #[error("invalid encoded byte {0:#04x}")]
    InvalidEncoding(u8),
    #[error("nonzero padding bits")]
    BadPadding,
    #[error("missing packet terminator")]
    MissingTerminator,
    #[error("field out of range: {0}")]
    OutOfRange(&'static str),
}
