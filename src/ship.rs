use bytes::Bytes;
use std::net::SocketAddr;
use std::time::{Duration, Instant};

/// Scheduling priority of an outbound shipment. This is a convenience wrapper for the
///  raw signed value stored in the departure - any `i32` is a valid priority, smaller
///  is more urgent.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Priority {
    Urgent,
    Normal,
    Slower,
}
impl Priority {
    pub fn value(self) -> i32 {
        match self {
            Priority::Urgent => -1,
            Priority::Normal => 0,
            Priority::Slower => 1,
        }
    }
}
impl From<Priority> for i32 {
    fn from(value: Priority) -> i32 {
        value.value()
    }
}

/// Lifecycle of a shipment, evaluated lazily against a caller-supplied clock.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ShipState {
    /// never sent
    New,
    /// sent within the current retry window, response pending
    Waiting,
    /// retry window elapsed, retry budget remaining
    Timeout,
    /// retry budget exhausted without a response - terminal
    Failed,
    /// all fragments acknowledged (or nothing left to send) - terminal
    Done,
}

/// One raw byte block of a departure, identified by its page index within the shipment.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Fragment {
    pub page: u32,
    pub data: Bytes,
}

/// What an acknowledgment covers: the whole shipment, or a single page of it.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum AckScope {
    All,
    Page(u32),
}

/// An outbound shipment: an ordered list of fragments still to be sent, plus the
///  bookkeeping needed to retry it until its response arrives (or to discard it after
///  the first send if it is disposable).
#[derive(Clone, Debug)]
pub struct Departure {
    sn: Option<u64>,
    priority: i32,
    remote: SocketAddr,
    local: SocketAddr,
    fragments: Vec<Fragment>,
    important: bool,
    expires: Duration,
    max_tries: u32,
    tries: u32,
    last_touch: Option<Instant>,
}

impl Departure {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        sn: Option<u64>,
        priority: i32,
        fragments: Vec<Fragment>,
        remote: SocketAddr,
        local: SocketAddr,
        important: bool,
        expires: Duration,
        max_tries: u32,
    ) -> Departure {
        Departure {
            sn,
            priority,
            remote,
            local,
            fragments,
            important,
            expires,
            max_tries,
            tries: 0,
            last_touch: None,
        }
    }

    pub fn sn(&self) -> Option<u64> {
        self.sn
    }

    pub fn priority(&self) -> i32 {
        self.priority
    }

    pub fn remote(&self) -> SocketAddr {
        self.remote
    }

    pub fn local(&self) -> SocketAddr {
        self.local
    }

    /// Whether this shipment expects a response and must be indexed by its sequence
    ///  number for response matching.
    pub fn is_important(&self) -> bool {
        self.important
    }

    /// A disposable shipment needs no response and is discarded right after its first
    ///  send.
    pub fn is_disposable(&self) -> bool {
        !self.important
    }

    /// Remaining (unacknowledged) fragments. For an important shipment these are kept
    ///  until acknowledged so a retry re-sends all of them.
    pub fn fragments(&self) -> &[Fragment] {
        &self.fragments
    }

    pub fn tries(&self) -> u32 {
        self.tries
    }

    pub fn state(&self, now: Instant) -> ShipState {
        if self.fragments.is_empty() {
            return ShipState::Done;
        }
        let touched = match self.last_touch {
            None => return ShipState::New,
            Some(touched) => touched,
        };
        if !self.important {
            // sent once, nothing more will ever happen to it
            return ShipState::Done;
        }
        if now < touched + self.expires {
            return ShipState::Waiting;
        }
        if self.tries < self.max_tries {
            return ShipState::Timeout;
        }
        ShipState::Failed
    }

    /// Stamp a (re)send attempt. Called exactly once per retrieval from the hall.
    pub fn touch(&mut self, now: Instant) {
        self.last_touch = Some(now);
        self.tries += 1;
    }

    /// Apply a response to this shipment, removing the fragments it acknowledges.
    ///  Returns true once no fragments remain, i.e. the task is finished.
    pub fn check_response(&mut self, response: &Arrival) -> bool {
        if self.sn.is_none() || self.sn != response.sn() {
            return false;
        }
        match response.ack_scope() {
            Some(AckScope::All) => self.fragments.clear(),
            Some(AckScope::Page(page)) => self.fragments.retain(|f| f.page != page),
            // a plain response with a matching sn settles the whole shipment
            None => self.fragments.clear(),
        }
        self.fragments.is_empty()
    }
}

/// An inbound shipment: either a complete unit, one fragment of a larger shipment
///  (identified by its page index out of `pages`), or an acknowledgment referring to
///  an earlier departure.
#[derive(Clone, Debug)]
pub struct Arrival {
    sn: Option<u64>,
    pages: u32,
    page_index: u32,
    ack: Option<AckScope>,
    body: Bytes,
    remote: SocketAddr,
    local: SocketAddr,
}

impl Arrival {
    /// A complete single-unit shipment.
    pub fn message(sn: Option<u64>, body: Bytes, remote: SocketAddr, local: SocketAddr) -> Arrival {
        Arrival {
            sn,
            pages: 1,
            page_index: 0,
            ack: None,
            body,
            remote,
            local,
        }
    }

    /// One page of a multi-fragment shipment.
    pub fn fragment(
        sn: u64,
        pages: u32,
        page_index: u32,
        body: Bytes,
        remote: SocketAddr,
        local: SocketAddr,
    ) -> Arrival {
        Arrival {
            sn: Some(sn),
            pages,
            page_index,
            ack: None,
            body,
            remote,
            local,
        }
    }

    /// An acknowledgment for the departure with the given sequence number.
    pub fn ack(sn: u64, scope: AckScope, remote: SocketAddr, local: SocketAddr) -> Arrival {
        Arrival {
            sn: Some(sn),
            pages: 1,
            page_index: 0,
            ack: Some(scope),
            body: Bytes::new(),
            remote,
            local,
        }
    }

    pub fn sn(&self) -> Option<u64> {
        self.sn
    }

    pub fn pages(&self) -> u32 {
        self.pages
    }

    pub fn page_index(&self) -> u32 {
        self.page_index
    }

    pub fn is_fragment(&self) -> bool {
        self.pages > 1
    }

    pub fn is_ack(&self) -> bool {
        self.ack.is_some()
    }

    pub fn ack_scope(&self) -> Option<AckScope> {
        self.ack
    }

    /// The fragment body, or the fully assembled payload for a completed arrival.
    pub fn body(&self) -> &Bytes {
        &self.body
    }

    pub fn remote(&self) -> SocketAddr {
        self.remote
    }

    pub fn local(&self) -> SocketAddr {
        self.local
    }

    /// The completed shipment with the fully assembled payload, keeping identity and
    ///  addressing of this arrival.
    pub fn into_completed(self, payload: Bytes) -> Arrival {
        Arrival {
            pages: 1,
            page_index: 0,
            body: payload,
            ..self
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;
    use std::time::Duration;

    fn addr(port: u16) -> SocketAddr {
        SocketAddr::from(([127, 0, 0, 1], port))
    }

    fn departure(important: bool, max_tries: u32) -> Departure {
        Departure::new(
            Some(7),
            Priority::Normal.value(),
            vec![Fragment {
                page: 0,
                data: Bytes::from_static(b"hello"),
            }],
            addr(9),
            addr(8),
            important,
            Duration::from_secs(10),
            max_tries,
        )
    }

    #[test]
    fn test_state_new_until_touched() {
        let now = Instant::now();
        let mut d = departure(true, 3);
        assert_eq!(ShipState::New, d.state(now));

        d.touch(now);
        assert_eq!(ShipState::Waiting, d.state(now));
        assert_eq!(1, d.tries());
    }

    #[rstest]
    #[case::within_window(5, 1, ShipState::Waiting)]
    #[case::past_window_with_budget(15, 1, ShipState::Timeout)]
    #[case::past_window_budget_exhausted(15, 3, ShipState::Failed)]
    fn test_state_after_touches(
        #[case] elapsed_secs: u64,
        #[case] touches: u32,
        #[case] expected: ShipState,
    ) {
        let start = Instant::now();
        let mut d = departure(true, 3);
        for i in 0..touches {
            d.touch(start + Duration::from_secs(i as u64));
        }
        // the window is measured from the *last* touch
        let last = start + Duration::from_secs(touches as u64 - 1);
        assert_eq!(expected, d.state(last + Duration::from_secs(elapsed_secs)));
    }

    #[test]
    fn test_disposable_done_after_first_send() {
        let now = Instant::now();
        let mut d = departure(false, 1);
        assert_eq!(ShipState::New, d.state(now));

        d.touch(now);
        assert_eq!(ShipState::Done, d.state(now));
        assert_eq!(ShipState::Done, d.state(now + Duration::from_secs(3600)));
    }

    #[test]
    fn test_check_response_whole_shipment() {
        let now = Instant::now();
        let mut d = departure(true, 3);
        d.touch(now);

        let wrong_sn = Arrival::ack(8, AckScope::All, addr(9), addr(8));
        assert!(!d.check_response(&wrong_sn));
        assert_eq!(ShipState::Waiting, d.state(now));

        let matching = Arrival::ack(7, AckScope::All, addr(9), addr(8));
        assert!(d.check_response(&matching));
        assert_eq!(ShipState::Done, d.state(now));
    }

    #[test]
    fn test_check_response_per_page() {
        let mut d = Departure::new(
            Some(3),
            Priority::Normal.value(),
            vec![
                Fragment {
                    page: 0,
                    data: Bytes::from_static(b"aa"),
                },
                Fragment {
                    page: 1,
                    data: Bytes::from_static(b"bb"),
                },
            ],
            addr(9),
            addr(8),
            true,
            Duration::from_secs(10),
            3,
        );

        assert!(!d.check_response(&Arrival::ack(3, AckScope::Page(1), addr(9), addr(8))));
        assert_eq!(1, d.fragments().len());
        assert_eq!(0, d.fragments()[0].page);

        assert!(d.check_response(&Arrival::ack(3, AckScope::Page(0), addr(9), addr(8))));
        assert!(d.fragments().is_empty());
    }

    #[test]
    fn test_response_without_scope_settles_shipment() {
        let mut d = departure(true, 3);
        let plain = Arrival::message(Some(7), Bytes::from_static(b"OK"), addr(9), addr(8));
        assert!(d.check_response(&plain));
    }
}
