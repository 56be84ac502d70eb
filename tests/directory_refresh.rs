//! Directory refresh against a loopback network

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tor_netlib::directory::fingerprint::Fingerprint;
use tor_netlib::directory::router::RouterFlags;
use tor_netlib::network::mock::MockLayer;
use tor_netlib::testing::LoopbackNetwork;
use tor_netlib::{Directory, MemoryStringStorage, StringStorage, TorConfig, TorError};

fn config() -> Arc<TorConfig> {
    Arc::new(TorConfig {
        verify_consensus_signatures: false,
        min_descriptors: 0,
        min_descriptors_percentage: 0.0,
        ..Default::default()
    })
}

fn network() -> LoopbackNetwork {
    let network = LoopbackNetwork::new();
    network.add_standard_relays(5, 5).unwrap();
    network.serve_authorities();
    network
}

fn flags_by_fingerprint(directory: &Directory) -> HashMap<Fingerprint, RouterFlags> {
    directory
        .index()
        .routers()
        .map(|r| (r.fingerprint, r.flags))
        .collect()
}

#[tokio::test]
async fn test_refresh_makes_directory_ready() {
    let network = network();
    let directory = Directory::new(config(), Arc::new(MemoryStringStorage::new()), network.layer());
    assert!(!directory.is_directory_ready());

    directory.refresh().await.unwrap();
    assert!(directory.is_directory_ready());
    assert_eq!(directory.index().len(), 10);
    assert_eq!(network.consensus_requests(), 1);
}

#[tokio::test]
async fn test_concurrent_refresh_is_single_flight() {
    let network = network();
    let directory = Directory::new(config(), Arc::new(MemoryStringStorage::new()), network.layer());

    let (first, second) = tokio::join!(directory.refresh(), directory.refresh());
    let outcomes = [first, second];
    assert_eq!(outcomes.iter().filter(|r| r.is_ok()).count(), 1);
    assert!(outcomes
        .iter()
        .any(|r| matches!(r, Err(TorError::AlreadyInProgress(_)))));
    assert_eq!(network.consensus_requests(), 1);
}

#[tokio::test]
async fn test_cached_directory_reloads_without_network() {
    let network = network();
    let storage = Arc::new(MemoryStringStorage::new());
    let directory = Directory::new(config(), storage.clone(), network.layer());
    directory.refresh().await.unwrap();
    let fetched = flags_by_fingerprint(&directory);
    assert!(storage
        .get(tor_netlib::storage::ROUTER_DESCRIPTORS_KEY)
        .await
        .unwrap()
        .is_some());

    let offline = Directory::new(config(), storage, Arc::new(MockLayer::new()));
    offline.refresh().await.unwrap();
    assert!(offline.is_directory_ready());
    assert_eq!(flags_by_fingerprint(&offline), fetched);
}

#[tokio::test]
async fn test_second_refresh_reuses_fresh_consensus() {
    let network = network();
    let directory = Directory::new(config(), Arc::new(MemoryStringStorage::new()), network.layer());
    directory.refresh().await.unwrap();
    let requests = network.directory_requests();

    directory.refresh().await.unwrap();
    assert_eq!(network.consensus_requests(), 1);
    assert_eq!(network.directory_requests(), requests);
}

#[tokio::test]
async fn test_descriptor_outage_keeps_routers_and_cache() {
    let network = network();
    network.set_consensus_age(Duration::from_secs(3700));
    let storage = Arc::new(MemoryStringStorage::new());
    let directory = Directory::new(config(), storage.clone(), network.layer());
    directory.refresh().await.unwrap();
    let fetched = flags_by_fingerprint(&directory);
    assert_eq!(fetched.len(), 10);

    network.start_descriptor_outage();
    directory.refresh().await.unwrap();
    assert_eq!(network.consensus_requests(), 2);
    assert!(directory.is_directory_ready());
    assert_eq!(flags_by_fingerprint(&directory), fetched);

    let offline = Directory::new(config(), storage, Arc::new(MockLayer::new()));
    offline.refresh().await.unwrap();
    assert!(offline.is_directory_ready());
    assert_eq!(flags_by_fingerprint(&offline), fetched);
}
