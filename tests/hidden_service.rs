//! Hosting and reaching a hidden service on a loopback network

use std::sync::Arc;
use std::time::Duration;

use ed25519_dalek::SigningKey;
use futures::io::{AsyncReadExt, AsyncWriteExt};
use rand::rngs::OsRng;

use tor_netlib::network::tor::TorLayer;
use tor_netlib::network::ConnectProperties;
use tor_netlib::testing::LoopbackNetwork;
use tor_netlib::{MemoryStringStorage, NetAddress, NetLayer, OnionAddress, Tor, TorConfig, TorError};

fn config() -> TorConfig {
    TorConfig {
        verify_consensus_signatures: false,
        min_descriptors: 0,
        min_descriptors_percentage: 0.0,
        min_idle_circuits: 1,
        connect_max_retries: 3,
        maintenance_interval: Duration::from_millis(200),
        ..Default::default()
    }
}

async fn ready_client(network: &LoopbackNetwork) -> Arc<Tor> {
    let tor = Tor::new(
        Arc::new(config()),
        Arc::new(MemoryStringStorage::new()),
        network.layer(),
        network.layer(),
    );
    tokio::time::timeout(Duration::from_secs(60), tor.wait_until_ready())
        .await
        .expect("bootstrap timed out")
        .unwrap();
    tor
}

fn network() -> LoopbackNetwork {
    let network = LoopbackNetwork::new();
    network.add_standard_relays(3, 3).unwrap();
    network.serve_authorities();
    network
}

#[tokio::test]
async fn test_host_publishes_descriptors() {
    let network = network();
    let tor = ready_client(&network).await;

    let host = tor
        .host_hidden_service(SigningKey::generate(&mut OsRng), 80)
        .await
        .unwrap();
    assert!(!host.intro_points().is_empty());
    assert!(network.hs_descriptor_count() > 0);
    assert_eq!(host.socket().local_address().port(), 80);
    host.stop();
}

#[tokio::test]
async fn test_client_reaches_hosted_service() {
    let network = network();
    let service_side = TorLayer::new(ready_client(&network).await);
    let address = service_side.generate_service_key();
    let local = NetAddress::new(&address.to_string(), 80);

    let mut listener = service_side
        .listen(&ConnectProperties::default(), &local)
        .await
        .unwrap();
    assert_eq!(listener.local_address(), local);
    let server = tokio::spawn(async move {
        let (mut stream, _remote) = listener.accept().await.unwrap();
        let mut request = [0u8; 5];
        stream.read_exact(&mut request).await.unwrap();
        assert_eq!(&request, b"hello");
        stream.write_all(b"world").await.unwrap();
        stream.flush().await.unwrap();
        listener
    });

    let client_side = TorLayer::new(ready_client(&network).await);
    let mut stream = client_side
        .connect(&ConnectProperties::default(), None, &local)
        .await
        .unwrap();
    stream.write_all(b"hello").await.unwrap();
    stream.flush().await.unwrap();
    let mut reply = [0u8; 5];
    tokio::time::timeout(Duration::from_secs(30), stream.read_exact(&mut reply))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(&reply, b"world");

    let mut listener = server.await.unwrap();
    listener.close().await;
}

#[tokio::test]
async fn test_wrong_port_is_refused() {
    let network = network();
    let service = ready_client(&network).await;
    let host = service
        .host_hidden_service(SigningKey::generate(&mut OsRng), 80)
        .await
        .unwrap();

    let client = ready_client(&network).await;
    let result = client.connect_hidden_service(&host.address(), 8080).await;
    assert!(matches!(result, Err(TorError::StreamRefused { .. })));
    assert_eq!(host.socket().pending(), 0);
}

#[tokio::test]
async fn test_unpublished_service_is_not_found() {
    let network = network();
    let client = ready_client(&network).await;
    let address = OnionAddress::from_public_key(&SigningKey::generate(&mut OsRng).verifying_key());

    let result = client.connect(&NetAddress::new(&address.to_string(), 80)).await;
    assert!(result.is_err());
}
