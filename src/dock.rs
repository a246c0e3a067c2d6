use crate::arrival_hall::ArrivalHall;
use crate::config::GateConfig;
use crate::departure_hall::DepartureHall;
use crate::ship::{Arrival, Departure};
use std::time::Instant;
use tokio::sync::RwLock;

struct DockInner {
    departures: DepartureHall,
    arrivals: ArrivalHall,
}

/// Departure Hall and Arrival Hall behind one synchronized facade.
///
/// Every mutating operation takes the write lock - shipment bookkeeping is cheap
///  relative to I/O, so a single exclusive section per dock keeps the reasoning simple.
///  Nothing is awaited while the lock is held.
pub struct Dock {
    inner: RwLock<DockInner>,
}

impl Dock {
    pub fn new(config: &GateConfig) -> Dock {
        Dock {
            inner: RwLock::new(DockInner {
                departures: DepartureHall::new(config.finished_retention),
                arrivals: ArrivalHall::new(config.assembly_expires),
            }),
        }
    }

    /// Enqueue an outgoing shipment. Returns false on a duplicate.
    pub async fn append_departure(&self, outgo: Departure) -> bool {
        self.inner.write().await.departures.append(outgo)
    }

    /// Match an incoming acknowledgment against a pending departure.
    pub async fn check_response(&self, response: &Arrival, now: Instant) -> Option<Departure> {
        self.inner.write().await.departures.check_response(response, now)
    }

    /// Feed an incoming unit through fragment reassembly; returns the completed
    ///  shipment once all pages arrived.
    pub async fn assemble_arrival(&self, income: Arrival, now: Instant) -> Option<Arrival> {
        self.inner.write().await.arrivals.insert(income, now)
    }

    /// Next new or timed-out departure due for (re)sending.
    pub async fn next_departure(&self, now: Instant) -> Option<Departure> {
        self.inner.write().await.departures.next_due(now)
    }

    /// Periodic cleanup of both halls.
    pub async fn purge(&self, now: Instant) {
        let mut inner = self.inner.write().await;
        inner.departures.purge(now);
        inner.arrivals.purge(now);
    }
}
