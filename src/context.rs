//! Process-wide state, passed around explicitly
//!
//! A [`TorContext`] owns the configuration, the directory cache storage and
//! the net-layer registry. Layers are created on first use and shared by
//! everything holding the context.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use crate::client::Tor;
use crate::config::TorConfig;
use crate::error::{Result, TorError};
use crate::network::control::ControlLayer;
use crate::network::echo::EchoLayer;
use crate::network::mock::MockLayer;
use crate::network::tcp::TcpLayer;
use crate::network::tls::TlsLayer;
use crate::network::tor::TorLayer;
use crate::network::{NetLayer, NetLayerKind, NetLayerRegistry};
use crate::storage::{FileStringStorage, MemoryStringStorage, StringStorage};

pub struct TorContext {
    config: Arc<TorConfig>,
    storage: Arc<dyn StringStorage>,
    registry: NetLayerRegistry,
    tor: Mutex<Option<Arc<Tor>>>,
    shut_down: AtomicBool,
}

impl TorContext {
    /// Validate `config` and open the storage it names
    pub fn new(config: TorConfig) -> Result<Arc<Self>> {
        config.validate()?;
        let storage: Arc<dyn StringStorage> = match &config.cache_directory {
            Some(dir) => Arc::new(FileStringStorage::new(dir.clone())?),
            None => Arc::new(MemoryStringStorage::new()),
        };
        Self::with_storage(config, storage)
    }

    pub fn with_storage(config: TorConfig, storage: Arc<dyn StringStorage>) -> Result<Arc<Self>> {
        config.validate()?;
        Ok(Arc::new(Self {
            config: Arc::new(config),
            storage,
            registry: NetLayerRegistry::new(),
            tor: Mutex::new(None),
            shut_down: AtomicBool::new(false),
        }))
    }

    pub fn config(&self) -> &Arc<TorConfig> {
        &self.config
    }

    pub fn storage(&self) -> &Arc<dyn StringStorage> {
        &self.storage
    }

    pub fn registry(&self) -> &NetLayerRegistry {
        &self.registry
    }

    fn ensure_open(&self) -> Result<()> {
        if self.shut_down.load(Ordering::SeqCst) {
            return Err(TorError::InvalidState("context is shut down".into()));
        }
        Ok(())
    }

    /// The layer of `kind`, created on first use
    pub fn net_layer(&self, kind: NetLayerKind) -> Result<Arc<dyn NetLayer>> {
        self.ensure_open()?;
        if let Some(layer) = self.registry.get(kind) {
            return Ok(layer);
        }
        let layer: Arc<dyn NetLayer> = match kind {
            NetLayerKind::Tcp => Arc::new(TcpLayer::new()),
            NetLayerKind::Tls => Arc::new(TlsLayer::new(self.net_layer(NetLayerKind::Tcp)?)),
            NetLayerKind::Tor => Arc::new(TorLayer::new(self.tor()?)),
            NetLayerKind::Mock => Arc::new(MockLayer::new()),
            NetLayerKind::Echo => Arc::new(EchoLayer::new()),
            NetLayerKind::Control => Arc::new(ControlLayer::new(
                self.net_layer(NetLayerKind::Tcp)?,
                self.config.control.clone(),
            )),
        };
        log::debug!("created {} layer", kind);
        Ok(self.registry.insert_if_absent(kind, layer))
    }

    /// The Tor client, created on first use over the TCP and TLS layers
    pub fn tor(&self) -> Result<Arc<Tor>> {
        self.ensure_open()?;
        let mut tor = self
            .tor
            .lock()
            .map_err(|_| TorError::Internal("context lock poisoned".into()))?;
        if let Some(client) = tor.as_ref() {
            return Ok(client.clone());
        }
        let client = Tor::new(
            self.config.clone(),
            self.storage.clone(),
            self.net_layer(NetLayerKind::Tcp)?,
            self.net_layer(NetLayerKind::Tls)?,
        );
        *tor = Some(client.clone());
        Ok(client)
    }

    /// Use `client` instead of creating one over the real network
    pub fn set_tor(&self, client: Arc<Tor>) -> Result<()> {
        self.ensure_open()?;
        let mut tor = self
            .tor
            .lock()
            .map_err(|_| TorError::Internal("context lock poisoned".into()))?;
        *tor = Some(client.clone());
        self.registry
            .register(NetLayerKind::Tor, Arc::new(TorLayer::new(client)));
        Ok(())
    }

    /// Stop the Tor client and clear every instantiated layer
    pub async fn shutdown(&self) {
        if self.shut_down.swap(true, Ordering::SeqCst) {
            return;
        }
        let client = self.tor.lock().ok().and_then(|mut tor| tor.take());
        if let Some(client) = client {
            client.shutdown();
        }
        self.registry.clear_all().await;
        log::info!("context shut down");
    }

    pub fn is_shut_down(&self) -> bool {
        self.shut_down.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::{ConnectProperties, NetAddress, NetLayerStatus};
    use futures::io::{AsyncReadExt, AsyncWriteExt};

    #[tokio::test]
    async fn test_layers_are_created_once() {
        let context = TorContext::new(TorConfig::default()).unwrap();
        let first = context.net_layer(NetLayerKind::Echo).unwrap();
        let second = context.net_layer(NetLayerKind::Echo).unwrap();
        assert!(Arc::ptr_eq(&first, &second));

        let tls = context.net_layer(NetLayerKind::Tls).unwrap();
        assert_eq!(tls.kind(), NetLayerKind::Tls);
        assert!(context.registry().get(NetLayerKind::Tcp).is_some());
    }

    #[tokio::test]
    async fn test_echo_layer_from_context() {
        let context = TorContext::new(TorConfig::default()).unwrap();
        let echo = context.net_layer(NetLayerKind::Echo).unwrap();
        let mut stream = echo
            .connect(&ConnectProperties::default(), None, &NetAddress::new("anywhere", 1))
            .await
            .unwrap();
        stream.write_all(b"abc").await.unwrap();
        let mut buf = [0u8; 3];
        stream.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"abc");
    }

    #[tokio::test]
    async fn test_tor_layer_starts_new() {
        let context = TorContext::new(TorConfig::default()).unwrap();
        let tor = context.net_layer(NetLayerKind::Tor).unwrap();
        assert_eq!(tor.status(), NetLayerStatus::New);
        assert!(Arc::ptr_eq(&context.tor().unwrap(), &context.tor().unwrap()));
    }

    #[tokio::test]
    async fn test_shutdown_closes_everything() {
        let context = TorContext::new(TorConfig::default()).unwrap();
        let tor = context.tor().unwrap();
        context.net_layer(NetLayerKind::Echo).unwrap();

        context.shutdown().await;
        assert!(context.is_shut_down());
        assert_eq!(tor.status(), NetLayerStatus::Closed);
        assert!(context.registry().kinds().is_empty());
        assert!(context.net_layer(NetLayerKind::Echo).is_err());
    }

    #[test]
    fn test_invalid_config_is_rejected() {
        let config = TorConfig {
            route_min_length: 0,
            ..Default::default()
        };
        assert!(TorContext::new(config).is_err());
    }

    #[test]
    fn test_file_storage_when_cache_directory_set() {
        let dir = tempfile::tempdir().unwrap();
        let config = TorConfig {
            cache_directory: Some(dir.path().join("cache")),
            ..Default::default()
        };
        assert!(TorContext::new(config).is_ok());
    }
}
