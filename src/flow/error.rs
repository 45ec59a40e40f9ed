use thiserror::Error;
#[cfg(test)] use mockall::automock;

use crate::protocol::dataproto::DataProtoError;

/// Malformed data received from a peer
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("packet length {len} exceeds maximum of {max}")]
    PacketTooLong { len: usize, max: usize },
    #[error("line exceeds maximum length of {max} bytes")]
    LineTooLong { max: usize },
    #[error(transparent)]
    DataProto(#[from] DataProtoError),
}

/// Runtime failure of a pipeline, delivered through its [`ErrorReporter`]. The pipeline is
///  unusable afterwards.
#[derive(Debug, Error)]
pub enum FlowError {
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),
    #[error("transport error: {0}")]
    Transport(#[from] std::io::Error),
    #[error("stream closed by peer")]
    StreamClosed,
}

/// Receives the runtime errors of one pipeline. The owner typically tears the pipeline down
///  from within `report`.
#[cfg_attr(test, automock)]
pub trait ErrorReporter {
    fn report(&self, error: FlowError);
}

impl<F: Fn(FlowError)> ErrorReporter for F {
    fn report(&self, error: FlowError) {
        self(error)
    }
}
