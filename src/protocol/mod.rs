pub mod dataproto;
pub mod packetproto;
pub mod scproto;
