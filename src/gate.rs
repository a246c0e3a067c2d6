use crate::channel::Connector;
use crate::codec::PlainDockerFactory;
use crate::config::GateConfig;
use crate::delegate::GateDelegate;
use crate::dock::Dock;
use crate::docker::{Docker, DockerFactory};
use crate::hub::Hub;
use crate::ship::{Arrival, Departure, Priority, ShipState};
use anyhow::anyhow;
use rustc_hash::FxHashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, debug_span, error, info, trace, warn, Instrument};
use uuid::Uuid;

/// The front door of the transport core: applications enqueue through [Gate::send] and
///  observe everything else through their [GateDelegate].
///
/// A started gate runs one dispatch loop task that pumps all channels, feeds income
///  through the dockers into the dock, (re)sends due departures, ticks the connection
///  state machines and purges the halls. All I/O is non-blocking; an iteration that did
///  no useful work sleeps for [GateConfig::idle_interval].
pub struct Gate {
    config: GateConfig,
    dock: Arc<Dock>,
    hub: Arc<Hub>,
    docker_factory: Arc<dyn DockerFactory>,
    delegate: Arc<dyn GateDelegate>,
    dockers: Mutex<FxHashMap<(SocketAddr, SocketAddr), Arc<dyn Docker>>>,
    running: AtomicBool,
    dispatch_task: Mutex<Option<JoinHandle<()>>>,
}

impl Gate {
    /// A gate with the default datagram codec ([PlainDockerFactory]).
    pub fn new(config: GateConfig, delegate: Arc<dyn GateDelegate>) -> anyhow::Result<Arc<Gate>> {
        let factory = Arc::new(PlainDockerFactory::new(&config));
        Gate::with_docker_factory(config, factory, delegate)
    }

    /// A gate whose hub can also dial out: address pairs without a bound local
    ///  channel get an active connection using this connector.
    pub fn with_connector(
        config: GateConfig,
        connector: Arc<dyn Connector>,
        delegate: Arc<dyn GateDelegate>,
    ) -> anyhow::Result<Arc<Gate>> {
        config.validate()?;
        let factory = Arc::new(PlainDockerFactory::new(&config));
        let hub = Arc::new(Hub::with_connector(config.connection_expires, connector));
        Ok(Gate::assemble(config, hub, factory, delegate))
    }

    pub fn with_docker_factory(
        config: GateConfig,
        docker_factory: Arc<dyn DockerFactory>,
        delegate: Arc<dyn GateDelegate>,
    ) -> anyhow::Result<Arc<Gate>> {
        config.validate()?;
        let hub = Arc::new(Hub::new(config.connection_expires));
        Ok(Gate::assemble(config, hub, docker_factory, delegate))
    }

    fn assemble(
        config: GateConfig,
        hub: Arc<Hub>,
        docker_factory: Arc<dyn DockerFactory>,
        delegate: Arc<dyn GateDelegate>,
    ) -> Arc<Gate> {
        Arc::new(Gate {
            dock: Arc::new(Dock::new(&config)),
            hub,
            docker_factory,
            delegate,
            dockers: Mutex::new(FxHashMap::default()),
            running: AtomicBool::new(false),
            dispatch_task: Mutex::new(None),
            config,
        })
    }

    pub fn hub(&self) -> &Arc<Hub> {
        &self.hub
    }

    /// Bind a local datagram channel; see [Hub::bind].
    pub async fn bind(&self, local: SocketAddr) -> anyhow::Result<SocketAddr> {
        self.hub.bind(local).await
    }

    async fn docker(&self, remote: SocketAddr, local: SocketAddr) -> Arc<dyn Docker> {
        let mut dockers = self.dockers.lock().await;
        dockers
            .entry((remote, local))
            .or_insert_with(|| self.docker_factory.create(remote, local))
            .clone()
    }

    /// Pack a payload and enqueue it for delivery. Returns false if an identical
    ///  shipment (same sequence number) is already pending.
    ///
    /// This only enqueues - transmission happens on the dispatch loop, and the
    ///  outcome is reported through the delegate as `on_sent` or `on_error`.
    pub async fn send(
        &self,
        payload: &[u8],
        priority: Priority,
        remote: SocketAddr,
        local: SocketAddr,
    ) -> bool {
        let docker = self.docker(remote, local).await;
        let outgo = docker.outgo(payload, priority, remote, local);
        trace!("enqueueing shipment {:?} for {:?}", outgo.sn(), remote);
        self.dock.append_departure(outgo).await
    }

    /// Spawn the dispatch loop. Returns false if it was already running.
    pub async fn start(self: &Arc<Gate>) -> bool {
        if self.running.swap(true, Ordering::SeqCst) {
            return false;
        }
        let gate = self.clone();
        let handle = tokio::spawn(async move { gate.dispatch_loop().await });
        *self.dispatch_task.lock().await = Some(handle);
        true
    }

    /// Stop the dispatch loop and close all channels and connections.
    pub async fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
        let handle = self.dispatch_task.lock().await.take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                error!("dispatch loop task failed: {}", e);
            }
        }
        self.hub.close_all().await;
    }

    async fn dispatch_loop(self: Arc<Gate>) {
        info!("gate dispatch loop starting");
        let mut buf = vec![0u8; self.config.recv_buffer_size];
        let mut last_purge = Instant::now();

        while self.running.load(Ordering::SeqCst) {
            let now = Instant::now();
            let mut busy = self.pump_income(&mut buf, now).await;
            busy |= self.pump_outgo(now).await;
            self.tick_connections(now).await;

            if now.duration_since(last_purge) >= self.config.purge_interval {
                self.dock.purge(now).await;
                last_purge = now;
            }
            if !busy {
                tokio::time::sleep(self.config.idle_interval).await;
            }
        }
        info!("gate dispatch loop terminated");
    }

    /// Drain all readable channels. Returns true if at least one unit came in.
    async fn pump_income(&self, buf: &mut [u8], now: Instant) -> bool {
        let mut busy = false;

        for channel in self.hub.channels().await {
            let local = channel.local_addr();
            loop {
                match channel.receive(buf) {
                    Ok(Some((len, source))) => {
                        busy = true;
                        self.handle_datagram(&buf[..len], source, local, now)
                            .instrument(debug_span!("income", unit_id = %Uuid::new_v4()))
                            .await;
                    }
                    Ok(None) => break,
                    Err(e) => {
                        error!("receive on {:?} failed: {}", local, e);
                        break;
                    }
                }
            }
        }

        for connection in self.hub.connections().await {
            if !connection.has_private_channel() {
                continue;
            }
            loop {
                match connection.receive(buf, now).await {
                    Ok(Some((len, source))) => {
                        busy = true;
                        self.handle_datagram(&buf[..len], source, connection.local_addr(), now)
                            .instrument(debug_span!("income", unit_id = %Uuid::new_v4()))
                            .await;
                    }
                    Ok(None) => break,
                    Err(e) => {
                        // the tick below turns a dead channel into a status change
                        trace!("receive on {:?} failed: {}", connection.remote_addr(), e);
                        break;
                    }
                }
            }
        }
        busy
    }

    async fn handle_datagram(&self, data: &[u8], source: SocketAddr, local: SocketAddr, now: Instant) {
        // any inbound traffic refreshes the pair's connection, creating it on first contact
        match self.hub.get_connection(source, local, now).await {
            Ok(connection) => connection.mark_received(now).await,
            Err(e) => {
                warn!("no connection for income from {:?}: {}", source, e);
                return;
            }
        }

        let docker = self.docker(source, local).await;
        match docker.income(data, source, local) {
            Ok(arrivals) => {
                for arrival in arrivals {
                    self.handle_arrival(arrival, &docker, now).await;
                }
            }
            Err(e) => {
                warn!("malformed unit from {:?}: {}", source, e);
                self.delegate.on_error(e, None, source, local).await;
            }
        }
    }

    async fn handle_arrival(&self, arrival: Arrival, docker: &Arc<dyn Docker>, now: Instant) {
        let source = arrival.remote();
        let local = arrival.local();

        if arrival.is_ack() {
            if let Some(finished) = self.dock.check_response(&arrival, now).await {
                debug!("shipment {:?} acknowledged by {:?}", finished.sn(), source);
                self.delegate.on_sent(finished, local, source).await;
            }
            return;
        }

        if let Some(completed) = self.dock.assemble_arrival(arrival, now).await {
            if let Some(ack) = docker.acknowledge(&completed) {
                self.dock.append_departure(ack).await;
            }
            self.delegate.on_received(completed, source, local).await;
        }
    }

    /// Send every departure that is due. Returns true if anything went out.
    async fn pump_outgo(&self, now: Instant) -> bool {
        let mut busy = false;
        while let Some(departure) = self.dock.next_departure(now).await {
            busy = true;
            if departure.state(now) == ShipState::Failed {
                let remote = departure.remote();
                let local = departure.local();
                warn!(
                    "shipment {:?} to {:?} gave up after {} tries",
                    departure.sn(),
                    remote,
                    departure.tries()
                );
                let error = anyhow!("shipment not acknowledged after {} tries", departure.tries());
                self.delegate.on_error(error, Some(departure), local, remote).await;
                continue;
            }
            self.transmit(departure, now).await;
        }
        busy
    }

    async fn transmit(&self, departure: Departure, now: Instant) {
        let remote = departure.remote();
        let local = departure.local();

        let connection = match self.hub.get_connection(remote, local, now).await {
            Ok(connection) => connection,
            Err(e) => {
                self.delegate.on_error(e, Some(departure), local, remote).await;
                return;
            }
        };

        for fragment in departure.fragments() {
            match connection.send(&fragment.data, now).await {
                Ok(sent) if sent == fragment.data.len() => {}
                // a zero/partial write never reached the wire in one piece; treat it
                //  like any other transient I/O failure and let the retry machinery
                //  pick the shipment up again
                Ok(sent) => {
                    let error = anyhow!(
                        "short write: {}/{} bytes to {:?}",
                        sent,
                        fragment.data.len(),
                        remote
                    );
                    self.delegate.on_error(error, Some(departure), local, remote).await;
                    return;
                }
                Err(e) => {
                    self.delegate.on_error(e, Some(departure), local, remote).await;
                    return;
                }
            }
        }
        trace!(
            "sent shipment {:?} ({} unit(s)) to {:?}",
            departure.sn(),
            departure.fragments().len(),
            remote
        );
        if departure.is_disposable() {
            // nothing to wait for: fully written means sent
            self.delegate.on_sent(departure, local, remote).await;
        }
    }

    async fn tick_connections(&self, now: Instant) {
        for connection in self.hub.connections().await {
            let remote = connection.remote_addr();
            let local = connection.local_addr();
            let outcome = connection.tick(now).await;

            if let Some((old, new)) = outcome.change {
                debug!("connection {:?} -> {:?}: {:?} => {:?}", local, remote, old, new);
                self.delegate.on_status_changed(old, new, remote, local).await;
            }
            if outcome.heartbeat_due {
                let docker = self.docker(remote, local).await;
                self.dock.append_departure(docker.heartbeat(remote, local)).await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::{Channel, MockChannel, MockConnector};
    use crate::connection::ConnectionState;
    use async_trait::async_trait;
    use bytes::Bytes;
    use std::time::Duration;
    use tokio::sync::mpsc;
    use tokio::time::timeout;

    #[derive(Debug)]
    enum Event {
        Status(ConnectionState, ConnectionState),
        Received(Bytes),
        Sent(Option<u64>),
        Error(String),
    }

    struct RecordingDelegate {
        events: mpsc::UnboundedSender<Event>,
    }

    impl RecordingDelegate {
        fn new() -> (Arc<RecordingDelegate>, mpsc::UnboundedReceiver<Event>) {
            let (tx, rx) = mpsc::unbounded_channel();
            (Arc::new(RecordingDelegate { events: tx }), rx)
        }
    }

    #[async_trait]
    impl GateDelegate for RecordingDelegate {
        async fn on_status_changed(
            &self,
            old: ConnectionState,
            new: ConnectionState,
            _remote: SocketAddr,
            _local: SocketAddr,
        ) {
            let _ = self.events.send(Event::Status(old, new));
        }

        async fn on_received(&self, arrival: Arrival, _source: SocketAddr, _destination: SocketAddr) {
            let _ = self.events.send(Event::Received(arrival.body().clone()));
        }

        async fn on_sent(&self, departure: Departure, _source: SocketAddr, _destination: SocketAddr) {
            let _ = self.events.send(Event::Sent(departure.sn()));
        }

        async fn on_error(
            &self,
            error: anyhow::Error,
            _departure: Option<Departure>,
            _source: SocketAddr,
            _destination: SocketAddr,
        ) {
            let _ = self.events.send(Event::Error(error.to_string()));
        }
    }

    fn any_local() -> SocketAddr {
        SocketAddr::from(([127, 0, 0, 1], 0))
    }

    fn addr(port: u16) -> SocketAddr {
        SocketAddr::from(([127, 0, 0, 1], port))
    }

    async fn next_event(rx: &mut mpsc::UnboundedReceiver<Event>) -> Event {
        timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("timeout waiting for a delegate event")
            .expect("delegate channel closed")
    }

    async fn started_gate(config: GateConfig) -> (Arc<Gate>, SocketAddr, mpsc::UnboundedReceiver<Event>) {
        let (delegate, rx) = RecordingDelegate::new();
        let gate = Gate::new(config, delegate).unwrap();
        let local = gate.bind(any_local()).await.unwrap();
        assert!(gate.start().await);
        (gate, local, rx)
    }

    #[tokio::test]
    async fn test_end_to_end_delivery_and_acknowledgment() {
        let (sender, sender_addr, mut sender_events) = started_gate(GateConfig::default()).await;
        let (receiver, receiver_addr, mut receiver_events) =
            started_gate(GateConfig::default()).await;

        assert!(
            sender
                .send(b"hello across the dock", Priority::Normal, receiver_addr, sender_addr)
                .await
        );

        // the receiver sees the payload...
        loop {
            if let Event::Received(body) = next_event(&mut receiver_events).await {
                assert_eq!(Bytes::from_static(b"hello across the dock"), body);
                break;
            }
        }
        // ...and its auto-ack resolves the departure on the sender side
        loop {
            if let Event::Sent(sn) = next_event(&mut sender_events).await {
                assert!(sn.is_some());
                break;
            }
        }

        sender.stop().await;
        receiver.stop().await;
    }

    #[tokio::test]
    async fn test_fragmented_payload_is_reassembled_by_the_peer() {
        let config = || GateConfig {
            max_fragment_size: 16,
            ..GateConfig::default()
        };
        let (sender, sender_addr, _sender_events) = started_gate(config()).await;
        let (receiver, receiver_addr, mut receiver_events) = started_gate(config()).await;

        let payload: Vec<u8> = (0..200u8).collect();
        assert!(
            sender
                .send(&payload, Priority::Urgent, receiver_addr, sender_addr)
                .await
        );

        loop {
            if let Event::Received(body) = next_event(&mut receiver_events).await {
                assert_eq!(payload.as_slice(), body.as_ref());
                break;
            }
        }

        sender.stop().await;
        receiver.stop().await;
    }

    #[tokio::test]
    async fn test_malformed_units_are_reported_not_fatal() {
        let (gate, gate_addr, mut events) = started_gate(GateConfig::default()).await;

        let rogue = tokio::net::UdpSocket::bind(any_local()).await.unwrap();
        rogue.send_to(&[1, 2, 3], gate_addr).await.unwrap();

        loop {
            if let Event::Error(message) = next_event(&mut events).await {
                assert!(message.contains("truncated"), "unexpected error: {}", message);
                break;
            }
        }

        // the loop survived: a valid unit still gets through
        let (sender, sender_addr, _sender_events) = started_gate(GateConfig::default()).await;
        assert!(
            sender
                .send(b"still alive", Priority::Normal, gate_addr, sender_addr)
                .await
        );
        loop {
            if let Event::Received(body) = next_event(&mut events).await {
                assert_eq!(Bytes::from_static(b"still alive"), body);
                break;
            }
        }

        sender.stop().await;
        gate.stop().await;
    }

    #[tokio::test]
    async fn test_expired_connection_sends_heartbeats() {
        let config = || GateConfig {
            connection_expires: Duration::from_millis(50),
            ..GateConfig::default()
        };
        let (sender, sender_addr, mut sender_events) = started_gate(config()).await;
        let (receiver, receiver_addr, _receiver_events) = started_gate(config()).await;

        sender
            .send(b"open the line", Priority::Normal, receiver_addr, sender_addr)
            .await;

        // silence after the exchange: the keep-alive window runs out and probing starts
        let mut saw_expired = false;
        let mut saw_maintaining = false;
        while !(saw_expired && saw_maintaining) {
            if let Event::Status(_, new) = next_event(&mut sender_events).await {
                saw_expired |= new == ConnectionState::Expired;
                saw_maintaining |= new == ConnectionState::Maintaining;
            }
        }

        sender.stop().await;
        receiver.stop().await;
    }

    #[tokio::test]
    async fn test_start_and_stop_are_idempotent() {
        let (delegate, _events) = RecordingDelegate::new();
        let gate = Gate::new(GateConfig::default(), delegate).unwrap();
        gate.bind(any_local()).await.unwrap();

        assert!(gate.start().await);
        assert!(!gate.start().await);
        gate.stop().await;
        gate.stop().await;
    }

    #[tokio::test]
    async fn test_send_before_start_is_queued() {
        let (delegate, mut events) = RecordingDelegate::new();
        let gate = Gate::new(GateConfig::default(), delegate).unwrap();
        let local = gate.bind(any_local()).await.unwrap();

        let (receiver, receiver_addr, mut receiver_events) =
            started_gate(GateConfig::default()).await;

        assert!(gate.send(b"early bird", Priority::Normal, receiver_addr, local).await);
        assert!(gate.start().await);

        loop {
            if let Event::Received(body) = next_event(&mut receiver_events).await {
                assert_eq!(Bytes::from_static(b"early bird"), body);
                break;
            }
        }
        loop {
            if let Event::Sent(_) = next_event(&mut events).await {
                break;
            }
        }

        gate.stop().await;
        receiver.stop().await;
    }

    #[tokio::test]
    async fn test_zero_byte_write_is_an_error_not_sent() {
        let (delegate, mut events) = RecordingDelegate::new();

        // a channel that accepts nothing: the socket is "open" but never writable
        let mut channel = MockChannel::new();
        channel.expect_is_open().return_const(true);
        channel.expect_send().returning(|_, _| Ok(0));
        channel.expect_receive().returning(|_| Ok(None));
        channel.expect_close().return_const(());
        let channel: Arc<dyn Channel> = Arc::new(channel);

        let mut connector = MockConnector::new();
        connector
            .expect_connect()
            .returning(move |_, _| Ok(channel.clone()));

        let gate = Gate::with_connector(GateConfig::default(), Arc::new(connector), delegate)
            .unwrap();
        assert!(gate.start().await);
        assert!(gate.send(b"hello", Priority::Normal, addr(9), addr(8)).await);

        loop {
            match next_event(&mut events).await {
                Event::Error(message) => {
                    assert!(message.contains("short write"), "unexpected error: {}", message);
                    break;
                }
                Event::Sent(_) => panic!("a write that reached nobody must not count as sent"),
                _ => {}
            }
        }
        gate.stop().await;
    }
}
