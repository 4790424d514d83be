//! The transport seam between the control-plane client and the wire.
//!
//! The discovery protocol's encoding and the stream it travels over are
//! outside this crate; implementations of these traits supply them. Tests
//! use in-memory fakes, production wires up a gRPC stream.

use std::future::Future;
use std::pin::Pin;

use crate::discovery::EndpointAssignment;
use crate::error::Error;

/// A boxed future tied to the lifetime of the borrow that produced it.
pub type TransportFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Creates streaming sessions to a control-plane endpoint.
///
/// `connect` may be called many times over the life of a client: once per
/// session, including reconnections after stream failures.
pub trait DiscoveryTransport: Send + Sync {
    fn connect(
        &self,
        endpoint: &str,
    ) -> TransportFuture<'_, Result<Box<dyn DiscoveryStream>, Error>>;
}

/// One established streaming session, yielding decoded endpoint
/// assignments in the order they arrive on the wire.
pub trait DiscoveryStream: Send {
    /// Receives the next assignment.
    ///
    /// Returns `Ok(None)` when the stream was closed by the peer, and an
    /// error when it broke. Either way the stream is finished afterwards.
    fn recv(&mut self) -> TransportFuture<'_, Result<Option<EndpointAssignment>, Error>>;
}
