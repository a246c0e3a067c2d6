use crate::ship::Arrival;
use bytes::{BufMut, Bytes, BytesMut};
use rustc_hash::FxHashMap;
use std::collections::BTreeMap;
use std::time::{Duration, Instant};
use tracing::{debug, trace, warn};

/// One partial multi-fragment shipment being reassembled.
struct Assembly {
    expected_pages: u32,
    received: BTreeMap<u32, Bytes>,
    last_touch: Instant,
}

impl Assembly {
    fn is_complete(&self) -> bool {
        self.received.len() as u32 >= self.expected_pages
    }

    fn assemble(&self) -> Bytes {
        let total = self.received.values().map(|page| page.len()).sum();
        let mut payload = BytesMut::with_capacity(total);
        for page in self.received.values() {
            payload.put_slice(page);
        }
        payload.freeze()
    }
}

/// Reassembles inbound shipments that arrive as multiple fragments, tracking partial
///  completion per sequence number and expiring assemblies that stop making progress.
pub struct ArrivalHall {
    assemblies: FxHashMap<u64, Assembly>,
    assembly_expires: Duration,
}

impl ArrivalHall {
    pub fn new(assembly_expires: Duration) -> ArrivalHall {
        ArrivalHall {
            assemblies: FxHashMap::default(),
            assembly_expires,
        }
    }

    /// Feed one incoming unit into the hall. A non-fragment is complete as-is; a
    ///  fragment is recorded under its sequence number and the completed shipment is
    ///  returned once all expected pages have arrived. An arrival transitions
    ///  partial -> complete exactly once; completion removes the assembly.
    pub fn insert(&mut self, income: Arrival, now: Instant) -> Option<Arrival> {
        if !income.is_fragment() {
            return Some(income);
        }
        let sn = match income.sn() {
            Some(sn) => sn,
            None => {
                // a fragment without identity cannot be matched to siblings;
                //  deliver it as-is rather than losing it
                debug!("fragment without sequence number - passing through");
                return Some(income);
            }
        };

        if income.page_index() >= income.pages() {
            warn!(
                "fragment page {} out of range of {} pages for arrival #{} - dropping",
                income.page_index(),
                income.pages(),
                sn
            );
            return None;
        }
        let assembly = self.assemblies.entry(sn).or_insert_with(|| Assembly {
            expected_pages: income.pages(),
            received: BTreeMap::new(),
            last_touch: now,
        });
        // all siblings must agree on the page count fixed by the first fragment
        if income.pages() != assembly.expected_pages {
            warn!(
                "fragment claims {} pages for arrival #{} expecting {} - dropping",
                income.pages(),
                sn,
                assembly.expected_pages
            );
            return None;
        }
        assembly.received.insert(income.page_index(), income.body().clone());
        assembly.last_touch = now;
        trace!(
            "fragment {}/{} for arrival #{} ({} received)",
            income.page_index(),
            assembly.expected_pages,
            sn,
            assembly.received.len()
        );

        if !assembly.is_complete() {
            return None;
        }
        let assembly = self.assemblies.remove(&sn)?;
        debug!("arrival #{} completed from {} pages", sn, assembly.expected_pages);
        Some(income.into_completed(assembly.assemble()))
    }

    /// Discard assemblies that have not seen a new fragment within the TTL window.
    pub fn purge(&mut self, now: Instant) {
        let expires = self.assembly_expires;
        let before = self.assemblies.len();
        self.assemblies
            .retain(|_, assembly| now.duration_since(assembly.last_touch) < expires);
        let dropped = before - self.assemblies.len();
        if dropped > 0 {
            debug!("discarded {} abandoned partial assemblies", dropped);
        }
    }

    #[cfg(test)]
    fn pending_count(&self) -> usize {
        self.assemblies.len()
    }
}
