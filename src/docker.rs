use crate::ship::{Arrival, Departure, Priority};
#[cfg(test)] use mockall::automock;
use std::net::SocketAddr;
use std::sync::Arc;

/// Per-connection protocol codec bridging raw bytes and shipments.
///
/// The transport core is wire-format agnostic: everything it knows about a unit -
///  sequence number, page count, whether it is an acknowledgment - comes from here.
///  Implementations keep whatever internal state they need (stream reassembly buffers,
///  sequence counters) behind interior mutability; the gate calls them concurrently
///  with plain shared references.
#[cfg_attr(test, automock)]
pub trait Docker: Send + Sync + 'static {
    /// Build an outbound shipment, splitting the payload into fragments according to
    ///  the codec's maximum-unit-size policy.
    fn outgo(
        &self,
        payload: &[u8],
        priority: Priority,
        remote: SocketAddr,
        local: SocketAddr,
    ) -> Departure;

    /// Decode raw bytes into zero or more arrivals. An empty vec means "need more
    ///  data" (stream codecs); an error means the input is malformed and should be
    ///  dropped.
    fn income(
        &self,
        data: &[u8],
        remote: SocketAddr,
        local: SocketAddr,
    ) -> anyhow::Result<Vec<Arrival>>;

    /// The acknowledgment to send back for a completed inbound shipment, or None if
    ///  the unit does not want one.
    fn acknowledge(&self, income: &Arrival) -> Option<Departure>;

    /// A disposable keep-alive probe for this connection.
    fn heartbeat(&self, remote: SocketAddr, local: SocketAddr) -> Departure;
}

/// Creates one [Docker] per connection.
#[cfg_attr(test, automock)]
pub trait DockerFactory: Send + Sync + 'static {
    fn create(&self, remote: SocketAddr, local: SocketAddr) -> Arc<dyn Docker>;
}
