use crate::channel::{Channel, Connector};
use anyhow::bail;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, trace, warn};

/// Lifecycle of one logical connection, evaluated lazily against the clock.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ConnectionState {
    /// not started
    Init,
    /// running but no usable channel yet
    Connecting,
    /// traffic seen within the keep-alive window
    Connected,
    /// no traffic within the keep-alive window - heartbeat probing due
    Expired,
    /// heartbeat in flight, waiting for the peer to answer
    Maintaining,
    /// channel broken or peer silent for far too long
    Error,
}

/// Guard state for single-flight reconnection.
#[derive(Debug, Eq, PartialEq)]
enum ReconnectFlight {
    Idle,
    Connecting,
}

/// What one state-machine tick observed.
pub struct TickOutcome {
    /// (old, new) if the state changed with this tick
    pub change: Option<(ConnectionState, ConnectionState)>,
    /// a heartbeat probe should be sent now
    pub heartbeat_due: bool,
}

struct ConnectionInner {
    channel: Option<Arc<dyn Channel>>,
    running: bool,
    opened: Instant,
    last_sent: Option<Instant>,
    last_received: Option<Instant>,
    last_heartbeat: Option<Instant>,
    reconnect_failed: bool,
    state: ConnectionState,
}

/// One logical communication endpoint (remote+local address pair) layered over a raw
///  channel.
///
/// A connection constructed with a [Connector] is "active": whenever a send or receive
///  finds the channel absent or closed, it attempts exactly one reconnection per
///  concurrent wave - the flight mutex ensures a single caller performs the physical
///  connect while the others wait for it and then simply retry their I/O.
pub struct Connection {
    remote: SocketAddr,
    local: SocketAddr,
    expires: Duration,
    connector: Option<Arc<dyn Connector>>,
    /// channel shared with the hub (bound datagram socket) vs. privately owned
    shared_channel: bool,
    inner: RwLock<ConnectionInner>,
    flight: Mutex<ReconnectFlight>,
    /// bumped when a dial completes; lets waiters of a failed dial detect that their
    ///  wave already had its one attempt
    dial_generation: AtomicU64,
}

impl Connection {
    /// A passive connection on top of an already-open (typically hub-bound, shared)
    ///  channel.
    pub fn new(
        remote: SocketAddr,
        local: SocketAddr,
        channel: Arc<dyn Channel>,
        expires: Duration,
    ) -> Connection {
        Connection {
            remote,
            local,
            expires,
            connector: None,
            shared_channel: true,
            inner: RwLock::new(ConnectionInner {
                channel: Some(channel),
                running: false,
                opened: Instant::now(),
                last_sent: None,
                last_received: None,
                last_heartbeat: None,
                reconnect_failed: false,
                state: ConnectionState::Init,
            }),
            flight: Mutex::new(ReconnectFlight::Idle),
            dial_generation: AtomicU64::new(0),
        }
    }

    /// An active connection that (re)establishes its own channel on demand.
    pub fn new_active(
        remote: SocketAddr,
        local: SocketAddr,
        connector: Arc<dyn Connector>,
        expires: Duration,
    ) -> Connection {
        Connection {
            remote,
            local,
            expires,
            connector: Some(connector),
            shared_channel: false,
            inner: RwLock::new(ConnectionInner {
                channel: None,
                running: false,
                opened: Instant::now(),
                last_sent: None,
                last_received: None,
                last_heartbeat: None,
                reconnect_failed: false,
                state: ConnectionState::Init,
            }),
            flight: Mutex::new(ReconnectFlight::Idle),
            dial_generation: AtomicU64::new(0),
        }
    }

    pub fn remote_addr(&self) -> SocketAddr {
        self.remote
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local
    }

    /// Whether this connection reads from its own private channel (active variant)
    ///  rather than having income routed to it from a shared hub channel.
    pub fn has_private_channel(&self) -> bool {
        !self.shared_channel
    }

    pub async fn is_running(&self) -> bool {
        self.inner.read().await.running
    }

    pub async fn state(&self) -> ConnectionState {
        self.inner.read().await.state
    }

    pub async fn start(&self, now: Instant) {
        let mut inner = self.inner.write().await;
        inner.running = true;
        inner.opened = now;
        debug!("starting connection {:?} -> {:?}", self.local, self.remote);
    }

    pub async fn stop(&self) {
        let mut inner = self.inner.write().await;
        inner.running = false;
        if let Some(channel) = inner.channel.take() {
            if !self.shared_channel {
                channel.close();
            }
        }
        debug!("stopped connection {:?} -> {:?}", self.local, self.remote);
    }

    /// Stamp inbound traffic routed to this connection by the hub.
    pub async fn mark_received(&self, now: Instant) {
        self.inner.write().await.last_received = Some(now);
    }

    async fn open_channel(&self) -> Option<Arc<dyn Channel>> {
        self.inner
            .read()
            .await
            .channel
            .as_ref()
            .filter(|channel| channel.is_open())
            .cloned()
    }

    /// Single-flight reconnection: the first caller of a concurrent wave performs the
    ///  physical connect, everyone else blocks on the flight mutex, re-checks, and
    ///  finds the fresh channel - or, if that one dial failed, fails fast without
    ///  dialing again. A call arriving after the wave completed starts a new wave and
    ///  does dial. Returns true if a usable channel exists afterwards.
    async fn reconnect(&self) -> anyhow::Result<bool> {
        let connector = match &self.connector {
            Some(connector) => connector.clone(),
            None => return Ok(false),
        };

        let wave = self.dial_generation.load(Ordering::Acquire);
        let mut flight = self.flight.lock().await;
        // double-check under the flight lock: a previous holder may have reconnected
        {
            let inner = self.inner.read().await;
            if !inner.running {
                return Ok(false);
            }
            if inner.channel.as_ref().is_some_and(|channel| channel.is_open()) {
                return Ok(true);
            }
        }
        if self.dial_generation.load(Ordering::Acquire) != wave {
            // this wave already had its dial and it produced no channel
            return Ok(false);
        }

        *flight = ReconnectFlight::Connecting;
        self.inner.write().await.state = ConnectionState::Connecting;
        debug!("reconnecting {:?} -> {:?}", self.local, self.remote);

        let result = connector.connect(self.remote, self.local).await;
        self.dial_generation.fetch_add(1, Ordering::Release);
        *flight = ReconnectFlight::Idle;

        let mut inner = self.inner.write().await;
        match result {
            Ok(channel) => {
                inner.channel = Some(channel);
                inner.reconnect_failed = false;
                inner.opened = Instant::now();
                inner.state = ConnectionState::Connected;
                Ok(true)
            }
            Err(e) => {
                warn!("reconnect {:?} -> {:?} failed: {}", self.local, self.remote, e);
                inner.reconnect_failed = true;
                inner.state = ConnectionState::Error;
                Err(e)
            }
        }
    }

    /// Send towards the remote address, reconnecting once (active variant) if the
    ///  channel is gone. Fails fast with "no channel" otherwise.
    pub async fn send(&self, data: &[u8], now: Instant) -> anyhow::Result<usize> {
        let mut channel = self.open_channel().await;
        if channel.is_none() && self.reconnect().await? {
            channel = self.open_channel().await;
        }
        let channel = match channel {
            Some(channel) => channel,
            None => bail!("no channel for {:?} -> {:?}", self.local, self.remote),
        };

        let sent = channel.send(data, self.remote)?;
        if sent > 0 {
            self.inner.write().await.last_sent = Some(now);
        }
        trace!("sent {}/{} bytes to {:?}", sent, data.len(), self.remote);
        Ok(sent)
    }

    /// Receive from a private channel (active variant). Hub-shared channels are read
    ///  by the gate directly and routed via [Connection::mark_received].
    pub async fn receive(
        &self,
        buf: &mut [u8],
        now: Instant,
    ) -> anyhow::Result<Option<(usize, SocketAddr)>> {
        let mut channel = self.open_channel().await;
        if channel.is_none() && self.reconnect().await? {
            channel = self.open_channel().await;
        }
        let channel = match channel {
            Some(channel) => channel,
            None => bail!("no channel for {:?} -> {:?}", self.local, self.remote),
        };

        let received = channel.receive(buf)?;
        if received.is_some() {
            self.inner.write().await.last_received = Some(now);
        }
        Ok(received)
    }

    fn evaluate(&self, inner: &ConnectionInner, now: Instant) -> ConnectionState {
        if !inner.running {
            return ConnectionState::Init;
        }
        let channel_open = inner
            .channel
            .as_ref()
            .is_some_and(|channel| channel.is_open());
        if !channel_open {
            return if inner.reconnect_failed {
                ConnectionState::Error
            } else {
                ConnectionState::Connecting
            };
        }

        let silent_for = now.duration_since(inner.last_received.unwrap_or(inner.opened));
        if silent_for < self.expires {
            return ConnectionState::Connected;
        }
        if silent_for >= self.expires * 8 {
            return ConnectionState::Error;
        }
        let sent_recently = inner
            .last_sent
            .is_some_and(|last_sent| now.duration_since(last_sent) < self.expires);
        if sent_recently {
            ConnectionState::Maintaining
        } else {
            ConnectionState::Expired
        }
    }

    /// Advance the lazy state machine. Reports the state transition (if any) and
    ///  whether a heartbeat probe is due - entering or sitting in EXPIRED requests one
    ///  probe per half keep-alive window, and the resulting send moves the state on to
    ///  MAINTAINING.
    pub async fn tick(&self, now: Instant) -> TickOutcome {
        let mut inner = self.inner.write().await;
        let new_state = self.evaluate(&inner, now);
        let old_state = inner.state;
        inner.state = new_state;

        let mut heartbeat_due = false;
        if new_state == ConnectionState::Expired {
            let due = inner
                .last_heartbeat
                .map_or(true, |last| now.duration_since(last) >= self.expires / 2);
            if due {
                inner.last_heartbeat = Some(now);
                heartbeat_due = true;
            }
        }

        TickOutcome {
            change: (old_state != new_state).then_some((old_state, new_state)),
            heartbeat_due,
        }
    }
}
