//! DataProto: the framing of VPN data between peers.
//!
//! ```ascii
//! 0: flags (u8)
//! 1: from_id (u16 LE)
//! 3: num_dest_ids (u16 LE)
//! 5: dest_id (u16 LE) * num_dest_ids
//! *: payload
//! ```

use bitflags::bitflags;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use thiserror::Error;

use crate::protocol::scproto::PeerId;
use crate::util::safe_converter::{PrecheckedCast, SafeCast};

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct DataProtoFlags: u8 {
        /// The sender has recently received packets from the receiver
        const RECEIVING_KEEPALIVES = 0x01;
    }
}

/// Reasons for rejecting a received DataProto frame
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DataProtoError {
    #[error("frame is shorter than the DataProto header")]
    NoHeader,
    #[error("frame declares {0} destinations")]
    TooManyDestinations(usize),
    #[error("frame is shorter than its destination list")]
    InvalidDestinationLength,
    #[error("frame payload of {len} bytes exceeds MTU {mtu}")]
    FrameTooLarge { len: usize, mtu: usize },
    #[error("peer is not allowed to relay")]
    RelayNotAllowed,
    #[error("unknown destination peer {0}")]
    UnknownDestination(PeerId),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataProtoHeader {
    pub flags: DataProtoFlags,
    pub from_id: PeerId,
    pub dest_ids: Vec<PeerId>,
}

impl DataProtoHeader {
    /// Length of the fixed part, without destination ids
    pub const SERIALIZED_LEN: usize = size_of::<u8>() + 2 * size_of::<u16>();
    pub const PEER_ID_LEN: usize = size_of::<u16>();
    pub const MAX_PEER_IDS: usize = 1;
    pub const MAX_OVERHEAD: usize = Self::SERIALIZED_LEN + Self::MAX_PEER_IDS * Self::PEER_ID_LEN;

    pub const FLAGS_OFFSET: usize = 0;

    pub fn new(flags: DataProtoFlags, from_id: PeerId, dest_ids: Vec<PeerId>) -> DataProtoHeader {
        assert!(dest_ids.len() <= Self::MAX_PEER_IDS);
        DataProtoHeader { flags, from_id, dest_ids }
    }

    /// Header of a keepalive frame: no destinations, no payload
    pub fn keepalive() -> DataProtoHeader {
        DataProtoHeader::new(DataProtoFlags::empty(), 0, Vec::new())
    }

    pub fn serialized_len(&self) -> usize {
        Self::SERIALIZED_LEN + self.dest_ids.len() * Self::PEER_ID_LEN
    }

    pub fn ser(&self, buf: &mut impl BufMut) {
        buf.put_u8(self.flags.bits());
        buf.put_u16_le(self.from_id);
        buf.put_u16_le(self.dest_ids.len().prechecked_cast());
        for &dest_id in &self.dest_ids {
            buf.put_u16_le(dest_id);
        }
    }

    /// Unknown flag bits are ignored.
    pub fn deser(buf: &mut impl Buf) -> Result<DataProtoHeader, DataProtoError> {
        if buf.remaining() < Self::SERIALIZED_LEN {
            return Err(DataProtoError::NoHeader);
        }
        let flags = DataProtoFlags::from_bits_truncate(buf.get_u8());
        let from_id = buf.get_u16_le();
        let num_dest_ids: usize = buf.get_u16_le().safe_cast();

        if num_dest_ids > Self::MAX_PEER_IDS {
            return Err(DataProtoError::TooManyDestinations(num_dest_ids));
        }
        if buf.remaining() < num_dest_ids * Self::PEER_ID_LEN {
            return Err(DataProtoError::InvalidDestinationLength);
        }

        let dest_ids = (0..num_dest_ids)
            .map(|_| buf.get_u16_le())
            .collect();

        Ok(DataProtoHeader { flags, from_id, dest_ids })
    }
}

/// A complete frame: header followed by payload
pub fn encode_frame(header: &DataProtoHeader, payload: &[u8]) -> Bytes {
    let mut buf = BytesMut::with_capacity(header.serialized_len() + payload.len());
    header.ser(&mut buf);
    buf.put_slice(payload);
    buf.freeze()
}

/// Splits a received frame into its header and payload, without copying the payload.
pub fn parse_frame(frame: &Bytes) -> Result<(DataProtoHeader, Bytes), DataProtoError> {
    let mut buf = &frame[..];
    let header = DataProtoHeader::deser(&mut buf)?;
    let payload = frame.slice(frame.len() - buf.len()..);
    Ok((header, payload))
}

/// Overwrites the flags byte of an encoded frame
pub fn set_frame_flags(frame: &mut [u8], flags: DataProtoFlags) {
    debug_assert!(frame.len() >= DataProtoHeader::SERIALIZED_LEN);
    frame[DataProtoHeader::FLAGS_OFFSET] = flags.bits();
}
