//! Identifiers shared with the server-client control protocol.

/// Identifies a peer within a VPN
pub type PeerId = u16;

/// Every control message starts with a single type byte
pub const SC_HEADER_LEN: usize = 1;

pub const SCID_KEEPALIVE: u8 = 0;
