//! Hosting a hidden service
//!
//! The host keeps introduction circuits open, publishes a signed
//! descriptor listing them to the HSDir ring, and answers each
//! INTRODUCE2 by building a circuit to the client's rendezvous point.
//! Streams the client opens there land in the service's
//! [`TorNetServerSocket`].

use std::sync::{Arc, Mutex, Weak};
use std::time::{Duration, SystemTime};

use ed25519_dalek::SigningKey;
use rand::rngs::OsRng;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use x25519_dalek::{PublicKey, StaticSecret};

use super::address::OnionAddress;
use super::descriptor::{HiddenServiceDescriptor, HS_DESCRIPTOR_LIFETIME};
use super::protocol::{establish_intro_body, rendezvous1_body, IntroduceBody, RelayRef};
use super::server_socket::TorNetServerSocket;
use super::{circuit_ending_at, control_exchange, hs_dir_request, HS_PUBLISH_PATH};
use crate::circuit_pool::{CircuitPool, CircuitPurpose};
use crate::config::TorConfig;
use crate::directory::router::unix_seconds;
use crate::error::{Result, TorError};
use crate::network::NetAddress;
use crate::path_selection::TcpStreamProperties;
use crate::protocol::cell::{RelayCell, RelayCommand};
use crate::protocol::circuit::{Circuit, IncomingStream};
use crate::protocol::ntor::NtorServer;
use crate::protocol::stream::TorStream;

/// Introduction points a service tries to keep
pub const INTRO_POINTS: usize = 3;

const END_REASON_CONNECT_REFUSED: u8 = 3;

pub struct HiddenServiceHost {
    pool: Arc<CircuitPool>,
    config: Arc<TorConfig>,
    identity: SigningKey,
    service_secret: StaticSecret,
    service_key: [u8; 32],
    address: OnionAddress,
    port: u16,
    socket: Arc<TorNetServerSocket>,
    intro_points: Mutex<Vec<RelayRef>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl HiddenServiceHost {
    /// Establish introduction points, publish the descriptor and start
    /// answering introductions for streams to `port`
    pub async fn start(
        pool: Arc<CircuitPool>,
        config: Arc<TorConfig>,
        identity: SigningKey,
        port: u16,
    ) -> Result<Arc<Self>> {
        let address = OnionAddress::from_public_key(&identity.verifying_key());
        let service_secret = StaticSecret::random_from_rng(OsRng);
        let service_key = PublicKey::from(&service_secret).to_bytes();
        let host = Arc::new(Self {
            socket: Arc::new(TorNetServerSocket::new(NetAddress::new(&address.to_string(), port))),
            pool,
            config,
            identity,
            service_secret,
            service_key,
            address,
            port,
            intro_points: Mutex::new(Vec::new()),
            tasks: Mutex::new(Vec::new()),
        });

        host.establish_intro_points().await?;
        if let Err(e) = host.publish().await {
            host.stop();
            return Err(e);
        }

        let period = HS_DESCRIPTOR_LIFETIME / 2;
        let weak = Arc::downgrade(&host);
        host.spawn(async move {
            let mut ticks = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
            loop {
                ticks.tick().await;
                let Some(host) = weak.upgrade() else { break };
                if let Err(e) = host.publish().await {
                    log::warn!("republishing {}: {}", host.address, e);
                }
            }
        });
        log::info!("hidden service {} is up", host.address);
        Ok(host)
    }

    pub fn address(&self) -> OnionAddress {
        self.address
    }

    /// Where inbound streams are queued
    pub fn socket(&self) -> Arc<TorNetServerSocket> {
        self.socket.clone()
    }

    pub fn intro_points(&self) -> Vec<RelayRef> {
        self.intro_points.lock().map(|p| p.clone()).unwrap_or_default()
    }

    fn spawn(&self, task: impl std::future::Future<Output = ()> + Send + 'static) {
        let handle = tokio::spawn(task);
        if let Ok(mut tasks) = self.tasks.lock() {
            tasks.push(handle);
        }
    }

    async fn establish_intro_points(self: &Arc<Self>) -> Result<()> {
        let mut properties = TcpStreamProperties::internal(&self.config);
        let mut last_error = None;
        for _ in 0..INTRO_POINTS * 2 {
            if self.intro_points().len() >= INTRO_POINTS {
                break;
            }
            match self.establish_intro_point(&properties).await {
                Ok(intro) => {
                    properties.excluded.insert(intro.fingerprint);
                    if let Ok(mut points) = self.intro_points.lock() {
                        points.push(intro);
                    }
                }
                Err(e) => {
                    log::debug!("introduction point for {}: {}", self.address, e);
                    last_error = Some(e);
                }
            }
        }
        if self.intro_points().is_empty() {
            return Err(last_error.unwrap_or_else(|| {
                TorError::HiddenService(format!("no introduction point for {}", self.address))
            }));
        }
        Ok(())
    }

    async fn establish_intro_point(self: &Arc<Self>, properties: &TcpStreamProperties) -> Result<RelayRef> {
        let circuit = self.pool.build_circuit(properties, CircuitPurpose::Internal).await?;
        let intro_router = circuit
            .exit_router()
            .ok_or_else(|| TorError::Internal("introduction circuit without relays".into()))?;
        control_exchange(
            &circuit,
            &self.config,
            RelayCell::new(RelayCommand::EstablishIntro, 0, establish_intro_body(&self.identity)),
            RelayCommand::IntroEstablished,
        )
        .await?;
        log::debug!("{} introduced through {}", self.address, intro_router.nickname);
        self.spawn(serve_introductions(Arc::downgrade(self), circuit));
        RelayRef::from_router(&intro_router)
    }

    /// Sign a descriptor for each replica and upload it to the responsible
    /// HSDirs; returns how many uploads were accepted
    pub async fn publish(&self) -> Result<usize> {
        let now = unix_seconds(SystemTime::now());
        let intro_points = self.intro_points();
        let index = self.pool.directory().index();
        let mut stored = 0;
        for id in self.address.descriptor_ids(now) {
            let descriptor =
                HiddenServiceDescriptor::sign(&self.identity, self.service_key, id, now, intro_points.clone());
            for hs_dir in index.responsible_hs_dirs(&id) {
                let uploaded = hs_dir_request(
                    &self.pool,
                    &self.config,
                    hs_dir.fingerprint,
                    "POST",
                    HS_PUBLISH_PATH,
                    descriptor.text().as_bytes(),
                )
                .await
                .and_then(|response| response.into_body(HS_PUBLISH_PATH));
                match uploaded {
                    Ok(_) => stored += 1,
                    Err(e) => log::debug!("publishing to {}: {}", hs_dir.nickname, e),
                }
            }
        }
        if stored == 0 {
            return Err(TorError::HiddenService(format!(
                "no HSDir accepted the descriptor of {}",
                self.address
            )));
        }
        log::info!("published descriptor of {} to {} HSDirs", self.address, stored);
        Ok(stored)
    }

    /// Join the rendezvous point named in an INTRODUCE2 body
    async fn answer_introduction(&self, body: &[u8]) -> Result<()> {
        let introduction = IntroduceBody::parse(body)?;
        if &introduction.auth_key != self.address.public_key() {
            return Err(TorError::HiddenService("introduction for another service".into()));
        }
        let server = NtorServer::new(self.address.service_identity(), self.service_secret.clone());
        let (reply, keys) = server.respond(&introduction.handshake)?;

        let circuit = circuit_ending_at(
            &self.pool,
            &self.config,
            introduction.rendezvous_point.fingerprint,
        )
        .await?;
        let rendezvous_hop = circuit.last_hop();
        circuit.add_virtual_hop(&keys.swapped())?;
        let (acceptor, incoming) = mpsc::unbounded_channel();
        circuit.accept_streams(acceptor);
        circuit.send_relay_cell(
            &RelayCell::new(
                RelayCommand::Rendezvous1,
                0,
                rendezvous1_body(&introduction.cookie, &reply),
            ),
            rendezvous_hop,
            false,
        )?;
        log::debug!("{} joined rendezvous circuit {:#010x}", self.address, circuit.id());

        self.spawn(accept_streams(
            circuit,
            incoming,
            self.socket.clone(),
            self.port,
            self.config.stream_send_timeout,
        ));
        Ok(())
    }

    /// Stop answering introductions and close the socket
    pub fn stop(&self) {
        if let Ok(mut tasks) = self.tasks.lock() {
            for task in tasks.drain(..) {
                task.abort();
            }
        }
        log::info!("hidden service {} stopped", self.address);
    }
}

impl Drop for HiddenServiceHost {
    fn drop(&mut self) {
        if let Ok(mut tasks) = self.tasks.lock() {
            for task in tasks.drain(..) {
                task.abort();
            }
        }
    }
}

async fn serve_introductions(host: Weak<HiddenServiceHost>, circuit: Arc<Circuit>) {
    loop {
        let cell = match circuit.next_control_cell().await {
            Ok((_, cell)) => cell,
            Err(e) => {
                log::debug!("introduction circuit {:#010x} ended: {}", circuit.id(), e);
                break;
            }
        };
        if cell.command != RelayCommand::Introduce2 {
            log::debug!("ignoring {:?} on introduction circuit", cell.command);
            continue;
        }
        let Some(host) = host.upgrade() else { break };
        tokio::spawn(async move {
            if let Err(e) = host.answer_introduction(&cell.data).await {
                log::warn!("answering introduction for {}: {}", host.address, e);
            }
        });
    }
}

async fn accept_streams(
    circuit: Arc<Circuit>,
    mut incoming: mpsc::UnboundedReceiver<IncomingStream>,
    socket: Arc<TorNetServerSocket>,
    port: u16,
    send_timeout: Duration,
) {
    let remote = NetAddress::new(&format!("rendezvous-{:08x}", circuit.id()), 0);
    loop {
        let next = tokio::select! {
            next = incoming.recv() => next,
            _ = circuit.closed() => None,
        };
        let Some(stream) = next else { break };
        if stream.port() != Some(port) {
            log::debug!("refusing stream to {} on rendezvous circuit", stream.target);
            let _ = stream.refuse(END_REASON_CONNECT_REFUSED);
            continue;
        }
        let accepted = TorStream::accept(stream, send_timeout).map(TorStream::into_net_stream);
        let queued = match accepted {
            Ok(stream) => socket.create_stream(stream, remote.clone()).await,
            Err(e) => Err(e),
        };
        if let Err(e) = queued {
            log::debug!("inbound stream dropped: {}", e);
        }
    }
}
