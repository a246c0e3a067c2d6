//! A connection-agnostic reliable-shipment transport core: it turns an unreliable,
//!  possibly fragmenting, possibly reordering datagram/stream channel into a queue of
//!  acknowledged "shipments" with priority, retry, timeout and de-duplication semantics,
//!  plus a connection state machine with reconnection and heartbeats layered over the
//!  raw channel.
//!
//! ## Design goals
//!
//! * The abstraction is sending / receiving *shipments* (defined-length chunks of data
//!   with an identity) rather than streams of bytes
//!   * a *Departure* is an outbound shipment: a sequence number, a priority, and a list
//!     of fragments still to be sent
//!   * an *Arrival* is an inbound shipment, possibly arriving as several fragments that
//!     are reassembled before delivery
//! * Shipments carry a signed priority (smaller is more urgent). Within one priority,
//!   new work always goes out before retries, and retries are serviced round-robin.
//!   There is *no* ordering guarantee across different priorities
//! * Delivery is confirmed per shipment: a departure that expects a response is retried
//!   on a clock-driven schedule until acknowledged, and reported as failed once its
//!   retry budget is exhausted. Duplicate and late acknowledgments are absorbed
//!   silently by a finished-cache with a grace window
//! * All timeouts are clock-driven with a caller-supplied "now" - no OS timers, no
//!   interrupt-based cancellation. Abandoned work ages into FAILED/expired state and is
//!   purged
//! * One cooperative dispatch loop per [gate::Gate] drives all I/O and bookkeeping,
//!   backing off for a few milliseconds when an iteration did no useful work.
//!   Application tasks only ever enqueue
//! * The core is wire-format agnostic: a per-connection codec (the [docker::Docker]
//!   trait) bridges raw bytes and shipments, supplying sequence numbers and page
//!   counts. A minimal fixed-header datagram codec is included for tests and simple
//!   deployments
//! * Logical connections are multiplexed over bound local endpoints: a [hub::Hub] maps
//!   (remote, local) address pairs to [connection::Connection]s lazily, and many
//!   connections share one bound channel
//! * Explicitly out of scope: congestion control, encryption, multiplexed streams
//!   within one shipment
//!
//! ## Composition
//!
//! ```ascii
//! application --> Gate::send(payload, priority)
//!                   |
//!                   v
//!        Dock = DepartureHall + ArrivalHall     (one exclusive lock)
//!                   |                ^
//!   next_departure  |                | income fragments
//!                   v                |
//!              Connection  <---  Docker (codec)
//!                   |                ^
//!                   v                |
//!              Hub / Channel  <-- wire bytes
//! ```

pub mod arrival_hall;
pub mod channel;
pub mod codec;
pub mod config;
pub mod connection;
pub mod delegate;
pub mod departure_hall;
pub mod dock;
pub mod docker;
pub mod gate;
pub mod hub;
pub mod ship;

#[cfg(test)]
mod tests {
    use tracing::Level;

    #[ctor::ctor(unsafe)]
    fn init_test_logging() {
        tracing_subscriber::fmt()
            .with_test_writer()
            .with_max_level(Level::TRACE)
            .try_init()
            .ok();
    }
}
