//! The Tor client
//!
//! [`Tor`] ties the directory, the relay link pool and the circuit pool
//! together. A background task refreshes the directory and keeps idle
//! circuits ready; the bootstrap level it reaches is published through a
//! `watch` channel and only ever moves up.

use std::net::IpAddr;
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use ed25519_dalek::SigningKey;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::circuit_pool::{CircuitPool, CircuitsStatus};
use crate::config::TorConfig;
use crate::connection_pool::ConnectionPool;
use crate::directory::{Directory, RefreshStage};
use crate::error::{Result, TorError};
use crate::hidden_service::address::is_onion_host;
use crate::hidden_service::{self, HiddenServiceHost, OnionAddress};
use crate::network::{NetAddress, NetLayer, NetLayerStatus};
use crate::protocol::stream::{resolve, reverse_query, ResolvedAnswer, TorStream};
use crate::storage::StringStorage;

pub struct Tor {
    config: Arc<TorConfig>,
    pool: Arc<CircuitPool>,
    status: watch::Sender<NetLayerStatus>,
    maintenance: Mutex<Option<JoinHandle<()>>>,
}

impl Tor {
    /// Client fetching directory documents through `directory_layer` and
    /// opening relay links through `relay_layer`
    pub fn new(
        config: Arc<TorConfig>,
        storage: Arc<dyn StringStorage>,
        directory_layer: Arc<dyn NetLayer>,
        relay_layer: Arc<dyn NetLayer>,
    ) -> Arc<Self> {
        let directory = Arc::new(Directory::new(config.clone(), storage, directory_layer));
        Self::with_directory(config, directory, relay_layer)
    }

    pub fn with_directory(
        config: Arc<TorConfig>,
        directory: Arc<Directory>,
        relay_layer: Arc<dyn NetLayer>,
    ) -> Arc<Self> {
        let connections = ConnectionPool::new(relay_layer, config.circuit_connect_timeout);
        let pool = Arc::new(CircuitPool::new(config.clone(), directory, connections));
        Arc::new(Self {
            config,
            pool,
            status: watch::channel(NetLayerStatus::New).0,
            maintenance: Mutex::new(None),
        })
    }

    pub fn config(&self) -> &Arc<TorConfig> {
        &self.config
    }

    pub fn directory(&self) -> &Arc<Directory> {
        self.pool.directory()
    }

    pub fn circuit_pool(&self) -> &Arc<CircuitPool> {
        &self.pool
    }

    pub fn status(&self) -> NetLayerStatus {
        *self.status.borrow()
    }

    pub fn subscribe_status(&self) -> watch::Receiver<NetLayerStatus> {
        self.status.subscribe()
    }

    /// Move to `level` unless already there or beyond
    fn raise(&self, level: NetLayerStatus) {
        let raised = self.status.send_if_modified(|current| {
            if level > *current {
                *current = level;
                true
            } else {
                false
            }
        });
        if raised {
            log::info!("bootstrap: {:?} ({:.0}%)", level, level.progress() * 100.0);
        }
    }

    /// Start the maintenance task; calling it again does nothing
    pub fn start(self: &Arc<Self>) {
        if self.status() == NetLayerStatus::Closed {
            return;
        }
        let Ok(mut maintenance) = self.maintenance.lock() else {
            return;
        };
        if maintenance.is_some() {
            return;
        }
        *maintenance = Some(tokio::spawn(maintenance_loop(
            Arc::downgrade(self),
            self.config.maintenance_interval,
        )));
    }

    /// One maintenance pass: refresh the directory, then top up circuits
    pub async fn maintain(&self) {
        self.raise(NetLayerStatus::ConsensusLoading);
        let directory = self.pool.directory();
        let mut stage = directory.subscribe_stage();
        let refresh = directory.refresh();
        tokio::pin!(refresh);
        let refreshed = loop {
            tokio::select! {
                result = &mut refresh => break result,
                Ok(()) = stage.changed() => {
                    if *stage.borrow() == RefreshStage::Descriptors {
                        self.raise(NetLayerStatus::RouterDescriptorsLoading);
                    }
                }
            }
        };
        match refreshed {
            Ok(()) | Err(TorError::AlreadyInProgress(_)) => {}
            Err(e) => log::warn!("directory refresh failed: {}", e),
        }
        if !directory.is_directory_ready() {
            return;
        }

        self.raise(NetLayerStatus::RouterDescriptorsLoading);
        self.raise(NetLayerStatus::InitialCircuitsEstablishing);
        self.pool.maintain().await;
        if self.pool.idle_count() >= self.config.min_idle_circuits {
            self.raise(NetLayerStatus::Ready);
        }
    }

    /// Wait for the client to reach `level`; fails once it is closed
    async fn wait_for(&self, level: NetLayerStatus) -> Result<()> {
        let mut status = self.status.subscribe();
        let reached = status
            .wait_for(|s| *s >= level)
            .await
            .map(|s| *s)
            .map_err(|_| TorError::Internal("client dropped".into()))?;
        if reached == NetLayerStatus::Closed && level != NetLayerStatus::Closed {
            return Err(TorError::InvalidState("client is closed".into()));
        }
        Ok(())
    }

    /// Start if needed and wait for READY
    pub async fn wait_until_ready(self: &Arc<Self>) -> Result<()> {
        self.start();
        self.wait_for(NetLayerStatus::Ready).await
    }

    /// Wait until circuits can be built, bounded by the directory timeout
    async fn wait_for_directory(self: &Arc<Self>) -> Result<()> {
        self.start();
        tokio::time::timeout(
            self.config.directory_overall_timeout,
            self.wait_for(NetLayerStatus::InitialCircuitsEstablishing),
        )
        .await
        .map_err(|_| TorError::Timeout("waiting for the directory".into()))?
    }

    /// Open a stream to `target` through an exit
    ///
    /// `.onion` targets go through the rendezvous protocol instead.
    pub async fn connect(self: &Arc<Self>, target: &NetAddress) -> Result<TorStream> {
        self.wait_for_directory().await?;
        if is_onion_host(&target.hostname()) {
            let address: OnionAddress = target.hostname().parse()?;
            return self.connect_hidden_service(&address, target.port()).await;
        }
        self.pool.open_stream(target).await
    }

    pub async fn connect_hidden_service(
        self: &Arc<Self>,
        address: &OnionAddress,
        port: u16,
    ) -> Result<TorStream> {
        self.wait_for_directory().await?;
        hidden_service::connect_hidden_service(&self.pool, &self.config, address, port).await
    }

    /// Publish a hidden service for `identity` accepting streams to `port`
    pub async fn host_hidden_service(
        self: &Arc<Self>,
        identity: SigningKey,
        port: u16,
    ) -> Result<Arc<HiddenServiceHost>> {
        self.wait_for_directory().await?;
        HiddenServiceHost::start(self.pool.clone(), self.config.clone(), identity, port).await
    }

    /// Every answer the exit gives for `query`
    async fn resolve_answers(self: &Arc<Self>, query: &str) -> Result<Vec<ResolvedAnswer>> {
        self.wait_for_directory().await?;
        let mut attempts = 0;
        let mut last_error = None;
        while attempts < self.config.connect_max_retries {
            attempts += 1;
            let circuit = match self.pool.exit_circuit().await {
                Ok(circuit) => circuit,
                Err(e) => {
                    last_error = Some(e);
                    continue;
                }
            };
            match resolve(circuit.clone(), query, self.config.stream_connect_timeout).await {
                Ok(answers) => return Ok(answers),
                Err(e) => {
                    log::debug!("resolving {} via circuit {:#010x}: {}", query, circuit.id(), e);
                    self.pool.stream_failed(&circuit, &e);
                    last_error = Some(e);
                }
            }
        }
        Err(TorError::ConnectFailed {
            attempts,
            last_error: last_error.map_or_else(|| "no attempt made".to_string(), |e| e.to_string()),
        })
    }

    /// All addresses of `hostname`, IPv4 and IPv6
    pub async fn resolve_all(self: &Arc<Self>, hostname: &str) -> Result<Vec<IpAddr>> {
        let addresses: Vec<IpAddr> = self
            .resolve_answers(hostname)
            .await?
            .into_iter()
            .filter_map(|answer| match answer {
                ResolvedAnswer::Address { address, .. } => Some(address),
                _ => None,
            })
            .collect();
        if addresses.is_empty() {
            return Err(TorError::Network(format!("{} did not resolve", hostname)));
        }
        Ok(addresses)
    }

    /// First address of `hostname`
    pub async fn resolve(self: &Arc<Self>, hostname: &str) -> Result<IpAddr> {
        let addresses = self.resolve_all(hostname).await?;
        addresses
            .first()
            .copied()
            .ok_or_else(|| TorError::Network(format!("{} did not resolve", hostname)))
    }

    /// Reverse lookup of `address`
    pub async fn resolve_address(self: &Arc<Self>, address: IpAddr) -> Result<String> {
        self.resolve_answers(&reverse_query(address))
            .await?
            .into_iter()
            .find_map(|answer| match answer {
                ResolvedAnswer::Hostname { hostname, .. } => Some(hostname),
                _ => None,
            })
            .ok_or_else(|| TorError::Network(format!("no name for {}", address)))
    }

    pub fn circuits_status(&self) -> CircuitsStatus {
        self.pool.status()
    }

    /// Close every circuit and relay link; the client keeps running
    pub fn clear(&self) {
        self.pool.clear();
    }

    /// Stop maintenance, close everything and move to CLOSED
    pub fn shutdown(&self) {
        if let Ok(mut maintenance) = self.maintenance.lock() {
            if let Some(task) = maintenance.take() {
                task.abort();
            }
        }
        self.pool.clear();
        self.raise(NetLayerStatus::Closed);
    }
}

impl Drop for Tor {
    fn drop(&mut self) {
        if let Ok(mut maintenance) = self.maintenance.lock() {
            if let Some(task) = maintenance.take() {
                task.abort();
            }
        }
    }
}

async fn maintenance_loop(tor: Weak<Tor>, interval: Duration) {
    loop {
        let Some(client) = tor.upgrade() else { break };
        client.maintain().await;
        drop(client);
        tokio::time::sleep(interval).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryStringStorage;
    use crate::testing::LoopbackNetwork;
    use std::net::Ipv4Addr;

    fn test_config() -> TorConfig {
        TorConfig {
            verify_consensus_signatures: false,
            min_descriptors: 0,
            min_descriptors_percentage: 0.0,
            min_idle_circuits: 2,
            connect_max_retries: 2,
            maintenance_interval: Duration::from_millis(200),
            ..Default::default()
        }
    }

    async fn client(network: &LoopbackNetwork) -> Arc<Tor> {
        let tor = Tor::new(
            Arc::new(test_config()),
            Arc::new(MemoryStringStorage::new()),
            network.layer(),
            network.layer(),
        );
        tokio::time::timeout(Duration::from_secs(30), tor.wait_until_ready())
            .await
            .expect("bootstrap timed out")
            .unwrap();
        tor
    }

    #[tokio::test]
    async fn test_status_moves_up_to_ready() {
        let network = LoopbackNetwork::new();
        network.add_standard_relays(3, 3).unwrap();
        network.serve_authorities();

        let tor = Tor::new(
            Arc::new(test_config()),
            Arc::new(MemoryStringStorage::new()),
            network.layer(),
            network.layer(),
        );
        assert_eq!(tor.status(), NetLayerStatus::New);
        let mut seen = vec![tor.status()];
        let mut status = tor.subscribe_status();
        tor.start();
        while *status.borrow() != NetLayerStatus::Ready {
            tokio::time::timeout(Duration::from_secs(30), status.changed())
                .await
                .unwrap()
                .unwrap();
            seen.push(*status.borrow());
        }
        assert!(seen.windows(2).all(|w| w[0] <= w[1]));
        assert!(tor.circuits_status().established >= 2);

        tor.shutdown();
        assert_eq!(tor.status(), NetLayerStatus::Closed);
        assert!(tor.wait_until_ready().await.is_err());
    }

    #[tokio::test]
    async fn test_resolve_helpers() {
        let network = LoopbackNetwork::new();
        network.add_standard_relays(3, 3).unwrap();
        network.serve_authorities();
        let tor = client(&network).await;

        let all = tor.resolve_all("example.com").await.unwrap();
        assert!(all.contains(&IpAddr::V4(Ipv4Addr::LOCALHOST)));
        assert_eq!(tor.resolve("example.com").await.unwrap(), all[0]);

        let name = tor
            .resolve_address(IpAddr::V4(Ipv4Addr::new(192, 0, 2, 1)))
            .await
            .unwrap();
        assert_eq!(name, crate::testing::relay::REVERSE_LOOKUP_NAME);
    }

    #[tokio::test]
    async fn test_connect_reaches_exit_target() {
        let network = LoopbackNetwork::new();
        network.add_standard_relays(3, 3).unwrap();
        network.serve_authorities();
        let tor = client(&network).await;

        let mut stream = tor.connect(&NetAddress::new("example.com", 443)).await.unwrap();
        stream.write(b"ping").await.unwrap();
        let echoed = stream.next_data().await.unwrap().unwrap();
        assert_eq!(echoed, b"ping");
        stream.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_uppercase_onion_never_reaches_an_exit() {
        let network = LoopbackNetwork::new();
        network.add_standard_relays(3, 3).unwrap();
        network.serve_authorities();
        let tor = client(&network).await;

        // Unpublished, so only an exit could have answered
        let key = SigningKey::generate(&mut rand::rngs::OsRng);
        let host = OnionAddress::from_public_key(&key.verifying_key()).to_string().to_uppercase();
        let result = tor.connect(&NetAddress::new(&host, 80)).await;
        assert!(result.is_err());
    }
}
