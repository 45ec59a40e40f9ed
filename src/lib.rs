//! Building blocks of a peer-to-peer VPN node: a single-threaded reactor, composable packet
//!  and stream pipelines, the PacketProto and DataProto wire formats, and the DataProto
//!  engine that carries frames between peers with keepalives and relaying.

pub mod dataproto;
pub mod flow;
pub mod protocol;
pub mod reactor;
pub mod structure;
pub mod util;

#[cfg(test)]
pub mod test_util;
