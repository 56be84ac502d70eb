//! The Tor client as a network layer

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use ed25519_dalek::SigningKey;
use rand::rngs::OsRng;

use super::{BoxedStream, ConnectProperties, NetAddress, NetLayer, NetLayerKind, NetLayerStatus, NetListener};
use crate::client::Tor;
use crate::error::{Result, TorError};
use crate::hidden_service::server_socket::ServerSocketListener;
use crate::hidden_service::OnionAddress;

/// Streams through Tor; `.onion` addresses reach hidden services
///
/// Listening needs the service key of the `.onion` address, registered
/// with [`TorLayer::add_service_key`] or created by
/// [`TorLayer::generate_service_key`].
pub struct TorLayer {
    tor: Arc<Tor>,
    service_keys: Mutex<HashMap<OnionAddress, SigningKey>>,
}

impl TorLayer {
    pub fn new(tor: Arc<Tor>) -> Self {
        Self {
            tor,
            service_keys: Mutex::new(HashMap::new()),
        }
    }

    pub fn client(&self) -> &Arc<Tor> {
        &self.tor
    }

    /// Allow listening on the address derived from `key`
    pub fn add_service_key(&self, key: SigningKey) -> OnionAddress {
        let address = OnionAddress::from_public_key(&key.verifying_key());
        if let Ok(mut keys) = self.service_keys.lock() {
            keys.insert(address, key);
        }
        address
    }

    /// Fresh service key; returns the address it can listen on
    pub fn generate_service_key(&self) -> OnionAddress {
        self.add_service_key(SigningKey::generate(&mut OsRng))
    }

    fn service_key(&self, address: &OnionAddress) -> Option<SigningKey> {
        self.service_keys.lock().ok()?.get(address).cloned()
    }
}

#[async_trait]
impl NetLayer for TorLayer {
    fn kind(&self) -> NetLayerKind {
        NetLayerKind::Tor
    }

    async fn connect(
        &self,
        properties: &ConnectProperties,
        _local: Option<&NetAddress>,
        remote: &NetAddress,
    ) -> Result<BoxedStream> {
        let stream = match properties.connect_timeout {
            Some(limit) => tokio::time::timeout(limit, self.tor.connect(remote))
                .await
                .map_err(|_| TorError::Timeout(format!("connect to {} through Tor", remote)))??,
            None => self.tor.connect(remote).await?,
        };
        Ok(stream.into_net_stream())
    }

    async fn listen(&self, _properties: &ConnectProperties, local: &NetAddress) -> Result<Box<dyn NetListener>> {
        let address: OnionAddress = local.hostname().parse()?;
        let key = self
            .service_key(&address)
            .ok_or_else(|| TorError::InvalidConfig(format!("no service key for {}", address)))?;
        let host = self.tor.host_hidden_service(key, local.port()).await?;
        Ok(Box::new(ServerSocketListener {
            socket: host.socket(),
            host: Some(host),
        }))
    }

    fn status(&self) -> NetLayerStatus {
        self.tor.status()
    }

    async fn wait_until_ready(&self) -> Result<()> {
        self.tor.wait_until_ready().await
    }

    async fn clear(&self) {
        self.tor.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TorConfig;
    use crate::storage::MemoryStringStorage;
    use crate::testing::LoopbackNetwork;
    use futures::io::{AsyncReadExt, AsyncWriteExt};
    use std::time::Duration;

    fn layer_on(network: &LoopbackNetwork) -> TorLayer {
        let config = TorConfig {
            verify_consensus_signatures: false,
            min_descriptors: 0,
            min_descriptors_percentage: 0.0,
            min_idle_circuits: 1,
            connect_max_retries: 2,
            ..Default::default()
        };
        TorLayer::new(Tor::new(
            Arc::new(config),
            Arc::new(MemoryStringStorage::new()),
            network.layer(),
            network.layer(),
        ))
    }

    #[tokio::test]
    async fn test_connect_through_layer() {
        let network = LoopbackNetwork::new();
        network.add_standard_relays(3, 3).unwrap();
        network.serve_authorities();
        let layer = layer_on(&network);
        assert_eq!(layer.kind(), NetLayerKind::Tor);

        tokio::time::timeout(Duration::from_secs(30), layer.wait_until_ready())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(layer.status(), NetLayerStatus::Ready);

        let mut stream = layer
            .connect(&ConnectProperties::default(), None, &NetAddress::new("example.com", 80))
            .await
            .unwrap();
        stream.write_all(b"hello").await.unwrap();
        let mut buf = [0u8; 5];
        stream.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"hello");
    }

    #[tokio::test]
    async fn test_listen_needs_service_key() {
        let network = LoopbackNetwork::new();
        let layer = layer_on(&network);
        let unknown = OnionAddress::from_public_key(&SigningKey::generate(&mut OsRng).verifying_key());
        let result = layer
            .listen(&ConnectProperties::default(), &NetAddress::new(&unknown.to_string(), 80))
            .await;
        assert!(matches!(result, Err(TorError::InvalidConfig(_))));

        let generated = layer.generate_service_key();
        assert!(layer.service_key(&generated).is_some());
    }
}
