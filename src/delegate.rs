use crate::connection::ConnectionState;
use crate::ship::{Arrival, Departure};
use async_trait::async_trait;
#[cfg(test)] use mockall::automock;
use std::net::SocketAddr;

/// Callbacks through which the application observes the transport core.
///
/// `Gate::send` only enqueues; actual transmission, completion and failure are
///  asynchronous and reported here from the dispatch loop. Implementations should
///  return quickly - they run on the loop task.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait GateDelegate: Send + Sync + 'static {
    /// A connection's lifecycle state changed.
    async fn on_status_changed(
        &self,
        old: ConnectionState,
        new: ConnectionState,
        remote: SocketAddr,
        local: SocketAddr,
    );

    /// A completed (fully reassembled) inbound shipment.
    async fn on_received(&self, arrival: Arrival, source: SocketAddr, destination: SocketAddr);

    /// An outbound shipment was acknowledged by the peer (or, for a disposable
    ///  shipment, fully written to the wire).
    async fn on_sent(&self, departure: Departure, source: SocketAddr, destination: SocketAddr);

    /// A shipment-level or connection-level failure. The dispatch loop itself keeps
    ///  running; the failure is local to the shipment/connection reported here.
    async fn on_error(
        &self,
        error: anyhow::Error,
        departure: Option<Departure>,
        source: SocketAddr,
        destination: SocketAddr,
    );
}
