use crate::docker::{Docker, DockerFactory};
use crate::ship::{AckScope, Arrival, Departure, Fragment, Priority};
use anyhow::bail;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::trace;

/// Fixed header in front of every unit - all numbers in network byte order (BE):
///
/// ```ascii
/// 0:  kind (u8):
///     * 0 MESSAGE  - complete shipment in one unit, acknowledged per sn
///     * 1 FRAGMENT - one page of a multi-unit shipment
///     * 2 ACK      - acknowledgment: whole sn if pages <= 1, else page `index`
///     * 3 PING     - keep-alive probe, decodes to nothing
/// 1:  sequence number (u64), 0 = fire-and-forget (no response expected)
/// 9:  pages (u32) - total page count, 1 for single-unit shipments
/// 13: index (u32) - page index of this unit
/// 17: body
/// ```
pub const HEADER_LEN: usize = 17;

const KIND_MESSAGE: u8 = 0;
const KIND_FRAGMENT: u8 = 1;
const KIND_ACK: u8 = 2;
const KIND_PING: u8 = 3;

fn encode_unit(kind: u8, sn: u64, pages: u32, index: u32, body: &[u8]) -> Bytes {
    let mut buf = BytesMut::with_capacity(HEADER_LEN + body.len());
    buf.put_u8(kind);
    buf.put_u64(sn);
    buf.put_u32(pages);
    buf.put_u32(index);
    buf.put_slice(body);
    buf.freeze()
}

/// A minimal datagram codec for the transport core: every unit is one datagram with
///  the fixed header above. Big payloads are split into FRAGMENT pages; the receiver
///  side acknowledges completed shipments as a whole.
pub struct PlainDocker {
    next_sn: Arc<AtomicU64>,
    max_fragment_size: usize,
    departure_expires: Duration,
    departure_max_tries: u32,
}

impl PlainDocker {
    fn allocate_sn(&self) -> u64 {
        self.next_sn.fetch_add(1, Ordering::Relaxed)
    }

    fn disposable(
        &self,
        fragments: Vec<Fragment>,
        remote: SocketAddr,
        local: SocketAddr,
    ) -> Departure {
        Departure::new(
            None,
            Priority::Urgent.value(),
            fragments,
            remote,
            local,
            false,
            self.departure_expires,
            1,
        )
    }
}

impl Docker for PlainDocker {
    fn outgo(
        &self,
        payload: &[u8],
        priority: Priority,
        remote: SocketAddr,
        local: SocketAddr,
    ) -> Departure {
        let sn = self.allocate_sn();
        let fragments = if payload.len() <= self.max_fragment_size {
            vec![Fragment {
                page: 0,
                data: encode_unit(KIND_MESSAGE, sn, 1, 0, payload),
            }]
        } else {
            let chunks: Vec<&[u8]> = payload.chunks(self.max_fragment_size).collect();
            let pages = chunks.len() as u32;
            chunks
                .into_iter()
                .enumerate()
                .map(|(page, chunk)| Fragment {
                    page: page as u32,
                    data: encode_unit(KIND_FRAGMENT, sn, pages, page as u32, chunk),
                })
                .collect()
        };
        trace!("packed departure #{} into {} unit(s)", sn, fragments.len());

        Departure::new(
            Some(sn),
            priority.value(),
            fragments,
            remote,
            local,
            true,
            self.departure_expires,
            self.departure_max_tries,
        )
    }

    fn income(
        &self,
        data: &[u8],
        remote: SocketAddr,
        local: SocketAddr,
    ) -> anyhow::Result<Vec<Arrival>> {
        if data.len() < HEADER_LEN {
            bail!("truncated unit: {} bytes", data.len());
        }
        let mut parse = data;
        let kind = parse.get_u8();
        let sn = parse.get_u64();
        let pages = parse.get_u32();
        let index = parse.get_u32();
        let body = Bytes::copy_from_slice(parse);

        let arrival = match kind {
            KIND_MESSAGE => {
                let sn = (sn != 0).then_some(sn);
                Arrival::message(sn, body, remote, local)
            }
            KIND_FRAGMENT => {
                if sn == 0 || pages < 2 || index >= pages {
                    bail!("inconsistent fragment header: sn {} page {}/{}", sn, index, pages);
                }
                Arrival::fragment(sn, pages, index, body, remote, local)
            }
            KIND_ACK => {
                if sn == 0 {
                    bail!("ack without sequence number");
                }
                let scope = if pages <= 1 {
                    AckScope::All
                } else {
                    AckScope::Page(index)
                };
                Arrival::ack(sn, scope, remote, local)
            }
            KIND_PING => {
                // pure liveness: the datagram itself refreshed the connection clock
                trace!("ping from {:?}", remote);
                return Ok(Vec::new());
            }
            _ => bail!("unknown unit kind {}", kind),
        };
        Ok(vec![arrival])
    }

    fn acknowledge(&self, income: &Arrival) -> Option<Departure> {
        if income.is_ack() {
            return None;
        }
        let sn = income.sn()?;
        let unit = encode_unit(KIND_ACK, sn, 1, 0, b"");
        // the ack flows back: income source becomes the remote
        Some(self.disposable(
            vec![Fragment { page: 0, data: unit }],
            income.remote(),
            income.local(),
        ))
    }

    fn heartbeat(&self, remote: SocketAddr, local: SocketAddr) -> Departure {
        let unit = encode_unit(KIND_PING, 0, 1, 0, b"");
        self.disposable(vec![Fragment { page: 0, data: unit }], remote, local)
    }
}

/// Creates [PlainDocker]s sharing one sequence-number allocator, so sequence numbers
///  are unique across all connections of a gate.
pub struct PlainDockerFactory {
    next_sn: Arc<AtomicU64>,
    max_fragment_size: usize,
    departure_expires: Duration,
    departure_max_tries: u32,
}

impl PlainDockerFactory {
    pub fn new(config: &crate::config::GateConfig) -> PlainDockerFactory {
        PlainDockerFactory {
            next_sn: Arc::new(AtomicU64::new(1)),
            max_fragment_size: config.max_fragment_size,
            departure_expires: config.departure_expires,
            departure_max_tries: config.departure_max_tries,
        }
    }
}

impl DockerFactory for PlainDockerFactory {
    fn create(&self, _remote: SocketAddr, _local: SocketAddr) -> Arc<dyn Docker> {
        Arc::new(PlainDocker {
            next_sn: self.next_sn.clone(),
            max_fragment_size: self.max_fragment_size,
            departure_expires: self.departure_expires,
            departure_max_tries: self.departure_max_tries,
        })
    }
}
