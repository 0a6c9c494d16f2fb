#![forbid(unsafe_code)]

//! Transport framing normalization.
//!
//! The socket library used by the original capture pipeline prepends a
//! binary-packet marker byte to raw payloads. Stripping it is an explicit
//! encode/decode boundary so the transport can be swapped without touching
//! the relay.

/// Marker byte prepended to binary payloads by the transport framing.
pub const TRANSPORT_MARKER: u8 = 0x04;

/// Strips exactly one leading marker byte if present.
///
/// Precondition: `bytes` is a complete payload as received from the
/// transport; callers must not invoke this twice on the same buffer, since a
/// payload legitimately starting with two marker bytes loses only the first.
pub fn strip_transport_marker(bytes: Vec<u8>) -> Vec<u8> {
    if bytes.first() == Some(&TRANSPORT_MARKER) {
        bytes[1..].to_vec()
    } else {
        bytes
    }
}
