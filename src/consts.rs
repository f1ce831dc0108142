//! Constants shared across the telemetry link stack.
//!
//! These cover the reserved modem addresses, the default wire ports, and
//! the Iridium Short Burst Data size limits. Values that are meaningful
//! only to a single driver live with that driver instead.

/// Modem address. Wire formats carry 16 bits of address space; the value
/// `-1` is reserved in-process for "unspecified" (see
/// [`QUERY_DESTINATION_ID`]).
pub type ModemId = i32;

/// Special modem id for the broadcast destination - no node is assigned
/// this address. Analogous to 192.168.1.255 on a 192.168.1.0/24 subnet.
pub const BROADCAST_ID: ModemId = 0;

/// Special modem id used internally to indicate that the MAC layer is
/// agnostic to the next destination. The destination is then chosen by the
/// data provider (typically the queue manager or a dynamic buffer).
pub const QUERY_DESTINATION_ID: ModemId = -1;

/// Similar to [`QUERY_DESTINATION_ID`] but for the source modem id.
pub const QUERY_SOURCE_ID: ModemId = -1;

/// Bits per byte, named for the rate computations that divide by it.
pub const BITS_IN_BYTE: u32 = 8;

/// Size of the additive checksum trailing an SBD message body.
pub const SBD_CHECKSUM_BYTES: usize = 2;

/// Size of the big-endian length field leading an `+SBDRB` response.
pub const SBD_LENGTH_BYTES: usize = 2;

/// Largest mobile-originated SBD message for the 9602/9603 modems.
pub const SBD_MO_MAX_BYTES_9602: usize = 340;

/// Largest mobile-terminated SBD message for the 9602/9603 modems in the
/// common one- or two-segment network configuration (RockBLOCK is 270).
pub const SBD_MT_MAX_BYTES_9602: usize = 270;

/// Default TCP port of the store-and-forward server.
pub const STORE_SERVER_DEFAULT_PORT: u16 = 11244;
