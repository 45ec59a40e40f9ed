use bytes::{Buf, BufMut};

use crate::util::safe_converter::{PrecheckedCast, SafeCast};

const HEADER_LEN: usize = size_of::<u32>();
const WRAP_MARKER: u32 = u32::MAX;

/// A ring buffer of variable-length packets, each stored contiguously behind a length prefix.
///
/// When a packet does not fit between the write position and the end of the storage, the
///  writer leaves a wrap marker (or nothing, if even the marker does not fit) and continues at
///  the start. The storage is sized so that `num_packets` packets of `mtu` bytes fit regardless
///  of where the wrap point falls.
pub struct ChunkBuffer {
    data: Vec<u8>,
    mtu: usize,
    start: usize,
    end: usize,
    wrapped: bool,
    count: usize,
}

impl ChunkBuffer {
    pub fn new(mtu: usize, num_packets: usize) -> ChunkBuffer {
        assert!(num_packets > 0);
        assert!(mtu < WRAP_MARKER.safe_cast());

        ChunkBuffer {
            data: vec![0; (HEADER_LEN + mtu) * (num_packets + 1)],
            mtu,
            start: 0,
            end: 0,
            wrapped: false,
            count: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.count
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    pub fn mtu(&self) -> usize {
        self.mtu
    }

    /// Position at which a packet of `len` bytes would be written
    fn write_position(&self, len: usize) -> Option<usize> {
        let needed = HEADER_LEN + len;
        if self.wrapped {
            return (self.start - self.end >= needed).then_some(self.end);
        }
        if self.data.len() - self.end >= needed {
            return Some(self.end);
        }
        // only wrap if the reader is not at the very start, so that end never catches up with start
        (self.start > needed).then_some(0)
    }

    pub fn can_accept(&self, len: usize) -> bool {
        len <= self.mtu && self.write_position(len).is_some()
    }

    /// Returns `false` if there is no room for the packet.
    pub fn push(&mut self, packet: &[u8]) -> bool {
        if packet.len() > self.mtu {
            return false;
        }
        let Some(pos) = self.write_position(packet.len()) else {
            return false;
        };

        if pos == 0 && !self.wrapped && self.count > 0 {
            if self.data.len() - self.end >= HEADER_LEN {
                (&mut self.data[self.end..]).put_u32_le(WRAP_MARKER);
            }
            self.wrapped = true;
        }

        let mut target = &mut self.data[pos..];
        target.put_u32_le(packet.len().prechecked_cast());
        target.put_slice(packet);

        self.end = pos + HEADER_LEN + packet.len();
        self.count += 1;
        trace_buffer(self);
        true
    }

    /// Location of the first packet's payload
    fn front_location(&self) -> Option<(usize, usize)> {
        if self.count == 0 {
            return None;
        }

        let mut pos = self.start;
        if self.data.len() - pos < HEADER_LEN || (&self.data[pos..]).get_u32_le() == WRAP_MARKER {
            pos = 0;
        }
        let len: usize = (&self.data[pos..]).get_u32_le().safe_cast();
        Some((pos, len))
    }

    pub fn front(&self) -> Option<&[u8]> {
        let (pos, len) = self.front_location()?;
        Some(&self.data[pos + HEADER_LEN..pos + HEADER_LEN + len])
    }

    /// Removes the first packet
    pub fn pop(&mut self) {
        let Some((pos, len)) = self.front_location() else {
            return;
        };

        if pos == 0 && self.start != 0 {
            // the reader followed the writer across the wrap point
            self.wrapped = false;
        }
        self.start = pos + HEADER_LEN + len;
        self.count -= 1;

        if self.count == 0 {
            self.start = 0;
            self.end = 0;
            self.wrapped = false;
        }
    }
}

fn trace_buffer(buffer: &ChunkBuffer) {
    tracing::trace!("chunk buffer: {} packets, start {}, end {}, wrapped {}", buffer.count, buffer.start, buffer.end, buffer.wrapped);
}
