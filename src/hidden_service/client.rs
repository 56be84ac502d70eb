//! Connecting to hidden services

use std::time::SystemTime;

use rand::seq::SliceRandom;
use rand::RngCore;
use x25519_dalek::PublicKey;

use super::address::{encode_descriptor_id, OnionAddress};
use super::descriptor::HiddenServiceDescriptor;
use super::protocol::{introduce_ack_status, IntroduceBody, RelayRef, COOKIE_LEN, INTRODUCE_ACK_SUCCESS};
use super::{circuit_ending_at, control_exchange, hs_dir_request, HS_DESCRIPTOR_PATH};
use crate::circuit_pool::{CircuitPool, CircuitPurpose};
use crate::config::TorConfig;
use crate::directory::router::unix_seconds;
use crate::error::{Result, TorError};
use crate::network::NetAddress;
use crate::path_selection::TcpStreamProperties;
use crate::protocol::cell::{RelayCell, RelayCommand};
use crate::protocol::ntor::NtorHandshake;
use crate::protocol::stream::TorStream;

/// Download and check the current descriptor of `address`
///
/// Every responsible HSDir of every replica is tried until one answers
/// with a descriptor that verifies.
pub async fn fetch_descriptor(
    pool: &CircuitPool,
    config: &TorConfig,
    address: &OnionAddress,
) -> Result<HiddenServiceDescriptor> {
    let now = unix_seconds(SystemTime::now());
    let ids = address.descriptor_ids(now);
    let index = pool.directory().index();
    let mut last_error = None;

    for id in &ids {
        let path = format!("{}{}", HS_DESCRIPTOR_PATH, encode_descriptor_id(id));
        for hs_dir in index.responsible_hs_dirs(id) {
            let fetched = hs_dir_request(pool, config, hs_dir.fingerprint, "GET", &path, &[])
                .await
                .and_then(|response| response.into_body(&path))
                .and_then(|body| {
                    String::from_utf8(body)
                        .map_err(|_| TorError::ParseError("descriptor is not UTF-8".into()))
                })
                .and_then(|text| HiddenServiceDescriptor::parse(&text))
                .and_then(|descriptor| descriptor.verify_for(address, &ids, now).map(|_| descriptor));
            match fetched {
                Ok(descriptor) => {
                    log::debug!("descriptor for {} from {}", address, hs_dir.nickname);
                    return Ok(descriptor);
                }
                Err(e) => {
                    log::debug!("descriptor for {} from {}: {}", address, hs_dir.nickname, e);
                    last_error = Some(e);
                }
            }
        }
    }
    Err(last_error.unwrap_or_else(|| TorError::HiddenService(format!("no HSDir is responsible for {}", address))))
}

/// Open a stream to `port` on the hidden service at `address`
pub async fn connect_hidden_service(
    pool: &CircuitPool,
    config: &TorConfig,
    address: &OnionAddress,
    port: u16,
) -> Result<TorStream> {
    let descriptor = fetch_descriptor(pool, config, address).await?;

    let rendezvous = pool
        .build_circuit(&TcpStreamProperties::internal(config), CircuitPurpose::Internal)
        .await?;
    let rendezvous_point = rendezvous
        .exit_router()
        .ok_or_else(|| TorError::Internal("rendezvous circuit without relays".into()))?;
    let mut cookie = [0u8; COOKIE_LEN];
    rand::thread_rng().fill_bytes(&mut cookie);
    control_exchange(
        &rendezvous,
        config,
        RelayCell::new(RelayCommand::EstablishRendezvous, 0, cookie.to_vec()),
        RelayCommand::RendezvousEstablished,
    )
    .await?;
    log::debug!("rendezvous point for {} is {}", address, rendezvous_point.nickname);

    let ntor = NtorHandshake::new(&address.service_identity(), &PublicKey::from(descriptor.service_key))?;
    let introduction = IntroduceBody {
        auth_key: *address.public_key(),
        rendezvous_point: RelayRef::from_router(&rendezvous_point)?,
        cookie,
        handshake: ntor.handshake_data(),
    }
    .encode();

    let mut intro_points = descriptor.introduction_points.clone();
    intro_points.shuffle(&mut rand::thread_rng());
    let mut introduced = false;
    for intro in &intro_points {
        match introduce(pool, config, intro, &introduction).await {
            Ok(()) => {
                introduced = true;
                break;
            }
            Err(e) => log::debug!("introduction through {} failed: {}", intro.fingerprint, e),
        }
    }
    if !introduced {
        rendezvous.close();
        return Err(TorError::HiddenService(format!("no introduction point of {} answered", address)));
    }

    let joined = tokio::time::timeout(config.circuit_build_timeout, rendezvous.next_control_cell()).await;
    let (_, cell) = match joined {
        Ok(Ok(joined)) => joined,
        Ok(Err(e)) => return Err(e),
        Err(_) => {
            rendezvous.close();
            return Err(TorError::Timeout(format!("{} never joined the rendezvous", address)));
        }
    };
    if cell.command != RelayCommand::Rendezvous2 {
        rendezvous.close();
        return Err(TorError::UnexpectedCell {
            expected: "RENDEZVOUS2".into(),
            got: format!("{:?}", cell.command),
        });
    }
    let keys = ntor.complete(&cell.data)?;
    rendezvous.add_virtual_hop(&keys)?;
    log::info!("rendezvous with {} complete", address);

    let target = NetAddress::new(&address.to_string(), port);
    TorStream::open(rendezvous, &target, config.stream_connect_timeout, config.stream_send_timeout).await
}

async fn introduce(pool: &CircuitPool, config: &TorConfig, intro: &RelayRef, body: &[u8]) -> Result<()> {
    let circuit = circuit_ending_at(pool, config, intro.fingerprint).await?;
    let ack = control_exchange(
        &circuit,
        config,
        RelayCell::new(RelayCommand::Introduce1, 0, body.to_vec()),
        RelayCommand::IntroduceAck,
    )
    .await;
    circuit.close();
    let ack = ack?;
    match introduce_ack_status(&ack.data) {
        INTRODUCE_ACK_SUCCESS => Ok(()),
        status => Err(TorError::HiddenService(format!("introduction refused with status {}", status))),
    }
}
