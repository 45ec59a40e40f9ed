use bytes::{Buf, BufMut};

use crate::util::safe_converter::{PrecheckedCast, SafeCast};

/// Length prefix of a packet sent over a byte stream: `len:u16_le ‖ payload[len]`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PacketProtoHeader {
    pub len: u16,
}

impl PacketProtoHeader {
    pub const SERIALIZED_LEN: usize = size_of::<u16>();

    /// Largest payload a single packet can carry
    pub const MAX_PAYLOAD: usize = u16::MAX as usize;

    pub fn for_payload(payload_len: usize) -> PacketProtoHeader {
        assert!(payload_len <= Self::MAX_PAYLOAD, "payload of {} bytes exceeds PacketProto maximum", payload_len);
        PacketProtoHeader { len: payload_len.prechecked_cast() }
    }

    pub fn payload_len(&self) -> usize {
        self.len.safe_cast()
    }

    pub fn ser(&self, buf: &mut impl BufMut) {
        buf.put_u16_le(self.len);
    }

    pub fn deser(buf: &mut impl Buf) -> anyhow::Result<PacketProtoHeader> {
        Ok(PacketProtoHeader {
            len: buf.try_get_u16_le()?,
        })
    }

    /// Size of an encoded packet with the given payload MTU
    pub const fn encoded_len(payload_mtu: usize) -> usize {
        Self::SERIALIZED_LEN + payload_mtu
    }
}
