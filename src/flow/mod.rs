//! Packet and stream pipelines.
//!
//! A pipeline is a chain of components connected through the interfaces in [`interface`].
//!  Each component borrows its downstream interface at construction and exposes its own
//!  upstream interface, so pipelines are assembled from the output side towards the input.

pub mod buffer_writer;
pub mod connector;
pub mod error;
pub mod inactivity_monitor;
pub mod interface;
pub mod keepalive_io;
pub mod keepalive_source;
pub mod line_buffer;
pub mod notifier;
pub mod packet_buffer;
pub mod packet_copier;
pub mod packet_proto;
pub mod packet_stream_sender;
pub mod queue;
pub mod recv_blocker;
pub mod route_buffer;
pub mod stream_socket;
