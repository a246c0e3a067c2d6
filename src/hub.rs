use crate::channel::{Channel, Connector, UdpChannel};
use crate::connection::Connection;
use anyhow::bail;
use rustc_hash::FxHashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tracing::{debug, info};

/// Registry mapping local addresses to bound channels and (remote, local) address
///  pairs to live connections.
///
/// Connections are created lazily on first lookup and are never dropped silently -
///  only an explicit [Hub::close_channel] (or [Hub::close_all]) removes them.
pub struct Hub {
    connection_expires: Duration,
    connector: Option<Arc<dyn Connector>>,
    channels: Mutex<FxHashMap<SocketAddr, Arc<dyn Channel>>>,
    connections: Mutex<FxHashMap<(SocketAddr, SocketAddr), Arc<Connection>>>,
}

impl Hub {
    pub fn new(connection_expires: Duration) -> Hub {
        Hub {
            connection_expires,
            connector: None,
            channels: Mutex::new(FxHashMap::default()),
            connections: Mutex::new(FxHashMap::default()),
        }
    }

    /// A hub that can also dial out: address pairs without a bound local channel get
    ///  an active connection using this connector.
    pub fn with_connector(connection_expires: Duration, connector: Arc<dyn Connector>) -> Hub {
        Hub {
            connection_expires,
            connector: Some(connector),
            channels: Mutex::new(FxHashMap::default()),
            connections: Mutex::new(FxHashMap::default()),
        }
    }

    /// Bind a datagram channel to a local address. Idempotent; returns the actual
    ///  bound address (relevant when binding port 0).
    pub async fn bind(&self, local: SocketAddr) -> anyhow::Result<SocketAddr> {
        let mut channels = self.channels.lock().await;
        if let Some(existing) = channels.get(&local) {
            return Ok(existing.local_addr());
        }
        let channel = Arc::new(UdpChannel::bind(local).await?);
        let bound = channel.local_addr();
        channels.insert(bound, channel);
        info!("hub bound local channel {:?}", bound);
        Ok(bound)
    }

    pub async fn channel(&self, local: SocketAddr) -> Option<Arc<dyn Channel>> {
        self.channels.lock().await.get(&local).cloned()
    }

    pub async fn channels(&self) -> Vec<Arc<dyn Channel>> {
        self.channels.lock().await.values().cloned().collect()
    }

    pub async fn connections(&self) -> Vec<Arc<Connection>> {
        self.connections.lock().await.values().cloned().collect()
    }

    /// Get or lazily create the connection for an address pair. A pair whose local
    ///  address has a bound channel gets a passive connection sharing that channel;
    ///  otherwise an active out-dialing connection is created if a connector is
    ///  installed, and the lookup fails if neither exists.
    pub async fn get_connection(
        &self,
        remote: SocketAddr,
        local: SocketAddr,
        now: Instant,
    ) -> anyhow::Result<Arc<Connection>> {
        let mut connections = self.connections.lock().await;
        if let Some(existing) = connections.get(&(remote, local)) {
            return Ok(existing.clone());
        }

        let connection = if let Some(channel) = self.channel(local).await {
            Arc::new(Connection::new(remote, local, channel, self.connection_expires))
        } else if let Some(connector) = &self.connector {
            Arc::new(Connection::new_active(
                remote,
                local,
                connector.clone(),
                self.connection_expires,
            ))
        } else {
            bail!("no channel bound for local address {:?}", local);
        };

        connection.start(now).await;
        debug!("hub created connection {:?} -> {:?}", local, remote);
        connections.insert((remote, local), connection.clone());
        Ok(connection)
    }

    /// Close the channel bound to `local` and stop every connection that references it.
    pub async fn close_channel(&self, local: SocketAddr) {
        let channel = self.channels.lock().await.remove(&local);
        if let Some(channel) = channel {
            channel.close();
        }

        let dropped: Vec<Arc<Connection>> = {
            let mut connections = self.connections.lock().await;
            let keys: Vec<(SocketAddr, SocketAddr)> = connections
                .keys()
                .filter(|(_, l)| *l == local)
                .cloned()
                .collect();
            keys.iter().filter_map(|key| connections.remove(key)).collect()
        };
        for connection in dropped {
            connection.stop().await;
        }
        debug!("closed channel {:?}", local);
    }

    pub async fn close_all(&self) {
        let locals: Vec<SocketAddr> = self.channels.lock().await.keys().cloned().collect();
        for local in locals {
            self.close_channel(local).await;
        }
        // active connections own their channels and are not reachable via a local bind
        let remaining: Vec<Arc<Connection>> =
            self.connections.lock().await.drain().map(|(_, conn)| conn).collect();
        for connection in remaining {
            connection.stop().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::MockConnector;
    use crate::connection::ConnectionState;

    const EXPIRES: Duration = Duration::from_secs(16);

    fn any_local() -> SocketAddr {
        SocketAddr::from(([127, 0, 0, 1], 0))
    }

    fn addr(port: u16) -> SocketAddr {
        SocketAddr::from(([127, 0, 0, 1], port))
    }

    #[tokio::test]
    async fn test_bind_is_idempotent() {
        let hub = Hub::new(EXPIRES);
        let bound = hub.bind(any_local()).await.unwrap();
        assert_eq!(bound, hub.bind(bound).await.unwrap());
        assert_eq!(1, hub.channels().await.len());
    }

    #[tokio::test]
    async fn test_get_connection_is_idempotent() {
        let now = Instant::now();
        let hub = Hub::new(EXPIRES);
        let local = hub.bind(any_local()).await.unwrap();

        let first = hub.get_connection(addr(9), local, now).await.unwrap();
        let second = hub.get_connection(addr(9), local, now).await.unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        assert!(first.is_running().await);
    }

    #[tokio::test]
    async fn test_get_connection_without_bound_channel_fails() {
        let now = Instant::now();
        let hub = Hub::new(EXPIRES);
        assert!(hub.get_connection(addr(9), addr(8), now).await.is_err());
    }

    #[tokio::test]
    async fn test_unbound_pair_uses_connector_when_installed() {
        let now = Instant::now();
        let connector = MockConnector::new(); // connect is lazy, not called yet
        let hub = Hub::with_connector(EXPIRES, Arc::new(connector));

        let conn = hub.get_connection(addr(9), addr(8), now).await.unwrap();
        assert!(conn.has_private_channel());
        assert_eq!(ConnectionState::Init, conn.state().await);
    }

    #[tokio::test]
    async fn test_close_channel_drops_dependent_connections() {
        let now = Instant::now();
        let hub = Hub::new(EXPIRES);
        let local = hub.bind(any_local()).await.unwrap();

        let conn = hub.get_connection(addr(9), local, now).await.unwrap();
        hub.get_connection(addr(10), local, now).await.unwrap();
        assert_eq!(2, hub.connections().await.len());

        hub.close_channel(local).await;
        assert_eq!(0, hub.connections().await.len());
        assert!(hub.channel(local).await.is_none());
        assert!(!conn.is_running().await);
    }
}
