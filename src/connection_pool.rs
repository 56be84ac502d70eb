//! Relay connection pooling
//!
//! One link per relay, shared by every circuit whose first hop is that
//! relay.
//!
//! - Closed links are dropped from the pool on the next lookup
//! - Idle links past `max_idle_connection_age` are closed by maintenance
//! - Concurrent connects to the same relay share one handshake

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::Mutex as AsyncMutex;

use crate::directory::fingerprint::Fingerprint;
use crate::directory::router::Router;
use crate::error::{Result, TorError};
use crate::network::{ConnectProperties, NetAddress, NetLayer};
use crate::protocol::channel::Channel;

/// Statistics about connection pooling
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConnectionPoolStats {
    /// Links opened
    pub connections_created: u64,
    /// Lookups served by an open link
    pub pool_hits: u64,
    /// Lookups that had to open a link
    pub pool_misses: u64,
    /// Links closed for idleness or found closed
    pub connections_expired: u64,
    /// Links currently open
    pub current_pool_size: usize,
}

/// Pool of links to relays
pub struct ConnectionPool {
    layer: Arc<dyn NetLayer>,
    connect_timeout: Duration,
    channels: Mutex<HashMap<Fingerprint, Arc<Channel>>>,
    /// Per-relay connect locks
    connecting: Mutex<HashMap<Fingerprint, Arc<AsyncMutex<()>>>>,
    stats: Mutex<ConnectionPoolStats>,
}

impl ConnectionPool {
    pub fn new(layer: Arc<dyn NetLayer>, connect_timeout: Duration) -> Self {
        Self {
            layer,
            connect_timeout,
            channels: Mutex::new(HashMap::new()),
            connecting: Mutex::new(HashMap::new()),
            stats: Mutex::new(ConnectionPoolStats::default()),
        }
    }

    fn lock_channels(&self) -> Result<std::sync::MutexGuard<'_, HashMap<Fingerprint, Arc<Channel>>>> {
        self.channels
            .lock()
            .map_err(|_| TorError::Internal("connection pool poisoned".into()))
    }

    fn record(&self, update: impl FnOnce(&mut ConnectionPoolStats)) {
        if let Ok(mut stats) = self.stats.lock() {
            update(&mut stats);
        }
    }

    /// An open link to `router` if the pool has one
    fn pooled(&self, fingerprint: &Fingerprint) -> Result<Option<Arc<Channel>>> {
        let mut channels = self.lock_channels()?;
        match channels.get(fingerprint) {
            Some(channel) if !channel.is_closed() => Ok(Some(channel.clone())),
            Some(_) => {
                channels.remove(fingerprint);
                self.record(|s| s.connections_expired += 1);
                Ok(None)
            }
            None => Ok(None),
        }
    }

    /// Get a link to `router`, from the pool or freshly handshaken
    pub async fn get_channel(&self, router: &Router) -> Result<Arc<Channel>> {
        if let Some(channel) = self.pooled(&router.fingerprint)? {
            self.record(|s| s.pool_hits += 1);
            return Ok(channel);
        }

        let gate = {
            let mut connecting = self
                .connecting
                .lock()
                .map_err(|_| TorError::Internal("connection pool poisoned".into()))?;
            connecting.entry(router.fingerprint).or_default().clone()
        };
        let _guard = gate.lock().await;
        // Another caller may have finished the handshake while we waited
        if let Some(channel) = self.pooled(&router.fingerprint)? {
            self.record(|s| s.pool_hits += 1);
            return Ok(channel);
        }
        self.record(|s| s.pool_misses += 1);

        let address = router.or_address();
        let properties = ConnectProperties {
            connect_timeout: Some(self.connect_timeout),
            ..ConnectProperties::relay_link()
        };
        let open = async {
            let stream = self
                .layer
                .connect(&properties, None, &NetAddress::from(address))
                .await?;
            Channel::open(stream, router.fingerprint, address).await
        };
        let channel = tokio::time::timeout(self.connect_timeout, open)
            .await
            .map_err(|_| TorError::Timeout(format!("link to {} ({})", router.nickname, address)))??;

        self.lock_channels()?.insert(router.fingerprint, channel.clone());
        self.record(|s| s.connections_created += 1);
        log::debug!("pooled new link to {} ({})", router.nickname, address);
        Ok(channel)
    }

    /// Close links without circuits that have been idle longer than `max_idle`
    pub fn expire_idle_connections(&self, max_idle: Duration) -> usize {
        let Ok(mut channels) = self.lock_channels() else {
            return 0;
        };
        let before = channels.len();
        channels.retain(|_, channel| {
            let keep = !channel.is_closed() && (channel.circuit_count() > 0 || channel.idle_time() <= max_idle);
            if !keep {
                channel.close();
            }
            keep
        });
        let expired = before - channels.len();
        drop(channels);

        if expired > 0 {
            log::debug!("expired {} idle relay links", expired);
            self.record(|s| s.connections_expired += expired as u64);
        }
        if let Ok(mut connecting) = self.connecting.lock() {
            connecting.retain(|_, gate| Arc::strong_count(gate) > 1);
        }
        expired
    }

    pub fn get_stats(&self) -> ConnectionPoolStats {
        let mut stats = self.stats.lock().map(|s| s.clone()).unwrap_or_default();
        stats.current_pool_size = self.total_pooled();
        stats
    }

    pub fn total_pooled(&self) -> usize {
        self.lock_channels().map(|c| c.len()).unwrap_or(0)
    }

    /// Close every link
    pub fn clear(&self) {
        let drained: Vec<Arc<Channel>> = match self.lock_channels() {
            Ok(mut channels) => channels.drain().map(|(_, c)| c).collect(),
            Err(_) => return,
        };
        for channel in &drained {
            channel.close();
        }
        log::info!("closed {} pooled relay links", drained.len());
    }
}
