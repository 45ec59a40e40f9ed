//! The DataProto engine: per-peer egress with keepalives, local flows into peers, relaying
//!  between peers and the receive path.

pub mod config;
pub mod dest;
pub mod device;
pub mod local_source;
pub mod receive;
pub mod relay;
