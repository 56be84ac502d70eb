//! Loopback Tor network
//!
//! Simulated relays answer the link, ntor and relay protocols over a
//! [`MockLayer`]. A circuit lives entirely inside the link server of its
//! first relay, which holds the relay-side crypto of every hop; later hops
//! are never dialled. Introductions and rendezvous joins between circuits
//! on different links travel through per-link injection queues.

use std::collections::{HashMap, HashSet, VecDeque};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime};

use flate2::write::ZlibEncoder;
use flate2::Compression;
use futures::future::FutureExt;
use futures::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::mpsc;

use super::documents::{consensus, signed_descriptor, ConsensusEntry, RelayKeys, RelaySpec};
use crate::directory::authority::DIRECTORY_AUTHORITIES;
use crate::directory::descriptor::parse_descriptor;
use crate::directory::fetcher::{ALL_DESCRIPTORS_PATH, CONSENSUS_PATH, DESCRIPTORS_BY_DIGEST_PATH};
use crate::directory::fingerprint::Fingerprint;
use crate::directory::http::{self, HttpRequest};
use crate::directory::router::{unix_seconds, Router, RouterFlags};
use crate::error::{Result, TorError};
use crate::hidden_service::address::decode_descriptor_id;
use crate::hidden_service::descriptor::HiddenServiceDescriptor;
use crate::hidden_service::protocol::{
    parse_rendezvous1, verify_establish_intro, IntroduceBody, COOKIE_LEN, INTRODUCE_ACK_SUCCESS,
    INTRODUCE_ACK_UNKNOWN_SERVICE,
};
use crate::hidden_service::{HS_DESCRIPTOR_PATH, HS_PUBLISH_PATH};
use crate::network::mock::{MockHandler, MockLayer};
use crate::network::{BoxedStream, NetAddress};
use crate::protocol::cell::{Cell, CellCommand, RelayCell, RelayCommand, VarCell};
use crate::protocol::channel::{
    negotiate_version, netinfo_payload, read_cell, read_versions, versions_payload, WireCell,
    LINK_PROTOCOLS,
};
use crate::protocol::circuit::{Extend2Request, DESTROY_REASON_PROTOCOL};
use crate::protocol::crypto::RelayCrypto;
use crate::protocol::flow_control::{CIRCUIT_INCREMENT, CIRCUIT_WINDOW, STREAM_INCREMENT, STREAM_WINDOW};
use crate::protocol::ntor::NtorServer;
use crate::protocol::stream::{encode_resolved, ResolvedAnswer, END_REASON_DONE};

const DESTROY_REASON_CONNECT_FAILED: u8 = 6;

const END_REASON_MISC: u8 = 1;
const END_REASON_RESOLVE_FAILED: u8 = 2;
const END_REASON_EXIT_POLICY: u8 = 4;

/// Name every reverse lookup resolves to
pub const REVERSE_LOOKUP_NAME: &str = "loopback.tor-netlib.test";

struct SimRelay {
    spec: RelaySpec,
    router: Router,
    descriptor: String,
    digest: [u8; 20],
    ntor: NtorServer,
}

/// Where to reach one simulated circuit
#[derive(Clone)]
struct CircuitHandle {
    circuit_id: u32,
    inject: mpsc::UnboundedSender<Inject>,
}

impl CircuitHandle {
    fn send(&self, inject: Inject) {
        if self.inject.send(inject).is_err() {
            log::debug!("simulated circuit {:#010x} is gone", self.circuit_id);
        }
    }

    /// Send `cell` to the client as if the last hop originated it
    fn originate(&self, cell: RelayCell) {
        self.send(Inject::Originate {
            circuit_id: self.circuit_id,
            cell,
        });
    }

    /// Pass a payload from a joined circuit on toward this circuit's client
    fn relay(&self, payload: Vec<u8>) {
        self.send(Inject::Relay {
            circuit_id: self.circuit_id,
            payload,
        });
    }

    fn join(&self, peer: CircuitHandle) {
        self.send(Inject::Join {
            circuit_id: self.circuit_id,
            peer,
        });
    }
}

enum Inject {
    Originate { circuit_id: u32, cell: RelayCell },
    Relay { circuit_id: u32, payload: Vec<u8> },
    Join { circuit_id: u32, peer: CircuitHandle },
}

#[derive(Default)]
struct Registry {
    relays: Vec<Arc<SimRelay>>,
    intro_points: HashMap<[u8; 32], CircuitHandle>,
    rendezvous_points: HashMap<[u8; COOKIE_LEN], CircuitHandle>,
    hs_descriptors: HashMap<(Fingerprint, [u8; 20]), String>,
}

struct SimState {
    published: u64,
    valid_after: AtomicU64,
    /// Consensus lists descriptors nobody serves
    descriptor_outage: AtomicBool,
    registry: Mutex<Registry>,
    circuits_created: AtomicUsize,
    directory_requests: AtomicUsize,
    consensus_requests: AtomicUsize,
    stream_sendmes: AtomicUsize,
}

fn zlib(data: &[u8]) -> Option<Vec<u8>> {
    use std::io::Write;
    let mut encoder = ZlibEncoder::new(Vec::new(), Compression::fast());
    encoder.write_all(data).ok()?;
    encoder.finish().ok()
}

impl SimState {
    fn registry(&self) -> Result<std::sync::MutexGuard<'_, Registry>> {
        self.registry
            .lock()
            .map_err(|_| TorError::Internal("simulated network poisoned".into()))
    }

    fn relays(&self) -> Vec<Arc<SimRelay>> {
        self.registry().map(|r| r.relays.clone()).unwrap_or_default()
    }

    fn relay_by_id(&self, id: &[u8; 20]) -> Option<Arc<SimRelay>> {
        self.relays()
            .into_iter()
            .find(|r| r.router.fingerprint.as_bytes() == id)
    }

    fn consensus_text(&self) -> String {
        let relays = self.relays();
        let outage = self.descriptor_outage.load(Ordering::SeqCst);
        let entries: Vec<ConsensusEntry<'_>> = relays
            .iter()
            .map(|r| ConsensusEntry {
                spec: &r.spec,
                fingerprint: r.router.fingerprint,
                descriptor_digest: if outage { r.digest.map(|b| !b) } else { r.digest },
                published: self.published,
            })
            .collect();
        consensus(&entries, self.valid_after.load(Ordering::SeqCst))
    }

    /// Body of a DirPort document, `None` for 404
    fn directory_document(&self, path: &str) -> Option<Vec<u8>> {
        self.directory_requests.fetch_add(1, Ordering::SeqCst);
        let (path, compressed) = match path.strip_suffix(".z") {
            Some(plain) => (plain, true),
            None => (path, false),
        };
        let outage = self.descriptor_outage.load(Ordering::SeqCst);
        let text = if path == CONSENSUS_PATH {
            self.consensus_requests.fetch_add(1, Ordering::SeqCst);
            self.consensus_text()
        } else if outage {
            return None;
        } else if path == ALL_DESCRIPTORS_PATH {
            self.relays().iter().map(|r| r.descriptor.as_str()).collect()
        } else if let Some(list) = path.strip_prefix(DESCRIPTORS_BY_DIGEST_PATH) {
            let wanted: HashSet<Vec<u8>> = list.split('+').filter_map(|d| hex::decode(d).ok()).collect();
            self.relays()
                .iter()
                .filter(|r| wanted.contains(r.digest.as_slice()))
                .map(|r| r.descriptor.as_str())
                .collect()
        } else {
            return None;
        };
        if compressed {
            zlib(text.as_bytes())
        } else {
            Some(text.into_bytes())
        }
    }

    /// Answer an HTTP request that arrived over BEGIN_DIR at `relay`
    fn tunneled_request(&self, relay: &Fingerprint, request: &HttpRequest) -> (u16, Vec<u8>) {
        if request.method == "POST" && request.path == HS_PUBLISH_PATH {
            let parsed = std::str::from_utf8(&request.body)
                .map_err(|_| TorError::ParseError("descriptor is not UTF-8".into()))
                .and_then(HiddenServiceDescriptor::parse);
            return match (parsed, self.registry()) {
                (Ok(descriptor), Ok(mut registry)) => {
                    registry.hs_descriptors.insert(
                        (*relay, descriptor.descriptor_id),
                        descriptor.text().to_string(),
                    );
                    (200, Vec::new())
                }
                (Err(e), _) | (_, Err(e)) => (400, e.to_string().into_bytes()),
            };
        }
        if request.method != "GET" {
            return (400, Vec::new());
        }
        if let Some(id) = request.path.strip_prefix(HS_DESCRIPTOR_PATH) {
            let stored = decode_descriptor_id(id).ok().and_then(|id| {
                self.registry()
                    .ok()
                    .and_then(|r| r.hs_descriptors.get(&(*relay, id)).cloned())
            });
            return match stored {
                Some(text) => (200, text.into_bytes()),
                None => (404, Vec::new()),
            };
        }
        match self.directory_document(&request.path) {
            Some(body) => (200, body),
            None => (404, Vec::new()),
        }
    }
}

enum SimStreamKind {
    Echo,
    Directory(Vec<u8>),
}

struct SimStream {
    kind: SimStreamKind,
    hop: usize,
    received: u32,
    /// DATA cells the client still accepts
    window: u32,
    /// Cells waiting for window, END last
    pending: VecDeque<RelayCell>,
}

impl SimStream {
    fn new(kind: SimStreamKind, hop: usize) -> Self {
        Self {
            kind,
            hop,
            received: 0,
            window: u32::from(STREAM_WINDOW),
            pending: VecDeque::new(),
        }
    }
}

struct SimCircuit {
    hops: Vec<RelayCrypto>,
    relays: Vec<Arc<SimRelay>>,
    streams: HashMap<u16, SimStream>,
    received: u32,
    window: u32,
    joined: Option<CircuitHandle>,
}

/// What the last hop sends back for one DATA cell
enum DataReply {
    Nothing,
    Echo(Vec<u8>),
    Http(HttpRequest),
}

/// Server side of one OR connection
struct SimLink {
    state: Arc<SimState>,
    relay: Arc<SimRelay>,
    out: mpsc::UnboundedSender<Vec<u8>>,
    inject: mpsc::UnboundedSender<Inject>,
    circuits: HashMap<u32, SimCircuit>,
}

fn handshake_body(reply: &[u8]) -> Vec<u8> {
    let mut body = (reply.len() as u16).to_be_bytes().to_vec();
    body.extend_from_slice(reply);
    body
}

/// Text up to the first NUL of a BEGIN or RESOLVE body
fn nul_terminated(data: &[u8]) -> String {
    let end = data.iter().position(|&b| b == 0).unwrap_or(data.len());
    String::from_utf8_lossy(&data[..end]).into_owned()
}

impl SimLink {
    fn handle(&self, circuit_id: u32) -> CircuitHandle {
        CircuitHandle {
            circuit_id,
            inject: self.inject.clone(),
        }
    }

    fn send(&self, cell: &Cell) -> Result<()> {
        let bytes = cell.to_bytes()?;
        self.out
            .send(bytes)
            .map_err(|_| TorError::ConnectionFailed("simulated link closed".into()))
    }

    fn circuit(&mut self, circuit_id: u32) -> Result<&mut SimCircuit> {
        self.circuits
            .get_mut(&circuit_id)
            .ok_or_else(|| TorError::CircuitClosed(format!("no simulated circuit {:#010x}", circuit_id)))
    }

    fn destroy(&mut self, circuit_id: u32, reason: u8) {
        if self.circuits.remove(&circuit_id).is_some() {
            let _ = self.send(&Cell::destroy(circuit_id, reason));
        }
    }

    fn on_cell(&mut self, cell: Cell) {
        let circuit_id = cell.circuit_id;
        let result = match cell.command {
            CellCommand::Create2 => self.on_create2(circuit_id, &cell.payload),
            CellCommand::Relay | CellCommand::RelayEarly => self.on_relay_payload(circuit_id, cell.payload),
            CellCommand::Destroy => {
                self.circuits.remove(&circuit_id);
                Ok(())
            }
            _ => Ok(()),
        };
        if let Err(e) = result {
            log::debug!("simulated {}: circuit {:#010x}: {}", self.relay.spec.nickname, circuit_id, e);
            self.destroy(circuit_id, DESTROY_REASON_PROTOCOL);
        }
    }

    fn on_inject(&mut self, inject: Inject) {
        let (circuit_id, result) = match inject {
            Inject::Originate { circuit_id, cell } => {
                let last = self
                    .circuits
                    .get(&circuit_id)
                    .map(|c| c.hops.len().saturating_sub(1));
                match last {
                    Some(last) => (circuit_id, self.originate(circuit_id, last, cell)),
                    None => return,
                }
            }
            Inject::Relay { circuit_id, payload } => (circuit_id, self.relay_back(circuit_id, payload)),
            Inject::Join { circuit_id, peer } => {
                if let Some(circuit) = self.circuits.get_mut(&circuit_id) {
                    circuit.joined = Some(peer);
                }
                return;
            }
        };
        if let Err(e) = result {
            log::debug!("simulated circuit {:#010x}: {}", circuit_id, e);
            self.destroy(circuit_id, DESTROY_REASON_PROTOCOL);
        }
    }

    fn on_create2(&mut self, circuit_id: u32, payload: &[u8]) -> Result<()> {
        let hlen = payload
            .get(2..4)
            .map(|b| u16::from_be_bytes([b[0], b[1]]) as usize)
            .ok_or_else(|| TorError::ProtocolError("CREATE2 truncated".into()))?;
        let handshake = payload
            .get(4..4 + hlen)
            .ok_or_else(|| TorError::ProtocolError("CREATE2 truncated".into()))?;
        let (reply, keys) = self.relay.ntor.respond(handshake)?;
        self.circuits.insert(
            circuit_id,
            SimCircuit {
                hops: vec![RelayCrypto::new(&keys)],
                relays: vec![self.relay.clone()],
                streams: HashMap::new(),
                received: 0,
                window: u32::from(CIRCUIT_WINDOW),
                joined: None,
            },
        );
        self.state.circuits_created.fetch_add(1, Ordering::SeqCst);
        self.send(&Cell::new(circuit_id, CellCommand::Created2, handshake_body(&reply)))
    }

    fn on_relay_payload(&mut self, circuit_id: u32, mut payload: Vec<u8>) -> Result<()> {
        let circuit = self.circuit(circuit_id)?;
        let mut recognized = None;
        for (hop, crypto) in circuit.hops.iter_mut().enumerate() {
            if let Some(cell) = crypto.process_outbound(&mut payload)? {
                recognized = Some((hop, cell));
                break;
            }
        }
        let joined = circuit.joined.clone();
        match (recognized, joined) {
            (Some((hop, cell)), _) => self.on_relay_cell(circuit_id, hop, cell),
            (None, Some(peer)) => {
                peer.relay(payload);
                Ok(())
            }
            (None, None) => Err(TorError::DigestMismatch),
        }
    }

    /// Encrypt `cell` as coming from `hop` and send it to the client
    fn originate(&mut self, circuit_id: u32, hop: usize, cell: RelayCell) -> Result<()> {
        let circuit = self.circuit(circuit_id)?;
        let mut payload = circuit
            .hops
            .get_mut(hop)
            .ok_or_else(|| TorError::Internal(format!("no hop {}", hop)))?
            .originate_inbound(&cell)?;
        for crypto in circuit.hops[..hop].iter_mut().rev() {
            crypto.relay_inbound(&mut payload)?;
        }
        self.send(&Cell::new(circuit_id, CellCommand::Relay, payload))
    }

    /// Add every backward layer to a payload a joined circuit handed over
    fn relay_back(&mut self, circuit_id: u32, mut payload: Vec<u8>) -> Result<()> {
        let circuit = self.circuit(circuit_id)?;
        for crypto in circuit.hops.iter_mut().rev() {
            crypto.relay_inbound(&mut payload)?;
        }
        self.send(&Cell::new(circuit_id, CellCommand::Relay, payload))
    }

    fn on_relay_cell(&mut self, circuit_id: u32, hop: usize, cell: RelayCell) -> Result<()> {
        match cell.command {
            RelayCommand::Extend2 => self.on_extend2(circuit_id, hop, &cell.data),
            RelayCommand::Begin => self.on_begin(circuit_id, hop, cell),
            RelayCommand::BeginDir => {
                self.circuit(circuit_id)?
                    .streams
                    .insert(cell.stream_id, SimStream::new(SimStreamKind::Directory(Vec::new()), hop));
                self.originate(circuit_id, hop, RelayCell::new(RelayCommand::Connected, cell.stream_id, Vec::new()))
            }
            RelayCommand::Data => self.on_data(circuit_id, hop, cell),
            RelayCommand::End => {
                self.circuit(circuit_id)?.streams.remove(&cell.stream_id);
                Ok(())
            }
            RelayCommand::Resolve => self.on_resolve(circuit_id, hop, cell),
            RelayCommand::EstablishIntro => {
                let auth_key = verify_establish_intro(&cell.data)?;
                let handle = self.handle(circuit_id);
                self.state.registry()?.intro_points.insert(auth_key, handle);
                self.originate(circuit_id, hop, RelayCell::new(RelayCommand::IntroEstablished, 0, Vec::new()))
            }
            RelayCommand::Introduce1 => {
                let body = IntroduceBody::parse(&cell.data)?;
                let service = self.state.registry()?.intro_points.get(&body.auth_key).cloned();
                let status = match service {
                    Some(service) => {
                        service.originate(RelayCell::new(RelayCommand::Introduce2, 0, cell.data));
                        INTRODUCE_ACK_SUCCESS
                    }
                    None => INTRODUCE_ACK_UNKNOWN_SERVICE,
                };
                let ack = RelayCell::new(RelayCommand::IntroduceAck, 0, status.to_be_bytes().to_vec());
                self.originate(circuit_id, hop, ack)
            }
            RelayCommand::EstablishRendezvous => {
                let cookie: [u8; COOKIE_LEN] = cell
                    .data
                    .get(..COOKIE_LEN)
                    .and_then(|c| c.try_into().ok())
                    .ok_or_else(|| TorError::ProtocolError("ESTABLISH_RENDEZVOUS truncated".into()))?;
                let handle = self.handle(circuit_id);
                self.state.registry()?.rendezvous_points.insert(cookie, handle);
                self.originate(
                    circuit_id,
                    hop,
                    RelayCell::new(RelayCommand::RendezvousEstablished, 0, Vec::new()),
                )
            }
            RelayCommand::Rendezvous1 => {
                let (cookie, handshake_info) = parse_rendezvous1(&cell.data)?;
                let client = self
                    .state
                    .registry()?
                    .rendezvous_points
                    .remove(&cookie)
                    .ok_or_else(|| TorError::HiddenService("unknown rendezvous cookie".into()))?;
                client.join(self.handle(circuit_id));
                client.originate(RelayCell::new(RelayCommand::Rendezvous2, 0, handshake_info));
                self.circuit(circuit_id)?.joined = Some(client);
                Ok(())
            }
            RelayCommand::Sendme => self.on_sendme(circuit_id, cell.stream_id),
            RelayCommand::Drop => Ok(()),
            other => {
                log::debug!("simulated relay ignoring {:?}", other);
                Ok(())
            }
        }
    }

    fn on_extend2(&mut self, circuit_id: u32, hop: usize, data: &[u8]) -> Result<()> {
        let request = Extend2Request::parse(data)?;
        let target = request.legacy_id.and_then(|id| self.state.relay_by_id(&id));
        let Some(target) = target else {
            let truncated = RelayCell::new(RelayCommand::Truncated, 0, vec![DESTROY_REASON_CONNECT_FAILED]);
            return self.originate(circuit_id, hop, truncated);
        };
        let (reply, keys) = target.ntor.respond(&request.handshake)?;
        self.originate(
            circuit_id,
            hop,
            RelayCell::new(RelayCommand::Extended2, 0, handshake_body(&reply)),
        )?;
        let circuit = self.circuit(circuit_id)?;
        circuit.hops.push(RelayCrypto::new(&keys));
        circuit.relays.push(target);
        Ok(())
    }

    fn on_begin(&mut self, circuit_id: u32, hop: usize, cell: RelayCell) -> Result<()> {
        let target = nul_terminated(&cell.data);
        let exit = self
            .circuit(circuit_id)?
            .relays
            .get(hop)
            .cloned()
            .ok_or_else(|| TorError::Internal(format!("no relay at hop {}", hop)))?;
        let parsed = target
            .rsplit_once(':')
            .and_then(|(host, port)| Some((host.trim_matches(|c| c == '[' || c == ']'), port.parse::<u16>().ok()?)));
        let refusal = match parsed {
            None => Some(END_REASON_MISC),
            Some((host, _)) if host.ends_with(".invalid") => Some(END_REASON_RESOLVE_FAILED),
            Some((host, port)) if !exit.router.exit_policy_accepts(host.parse().ok(), port) => {
                Some(END_REASON_EXIT_POLICY)
            }
            Some(_) => None,
        };
        if let Some(reason) = refusal {
            return self.originate(circuit_id, hop, RelayCell::new(RelayCommand::End, cell.stream_id, vec![reason]));
        }
        self.circuit(circuit_id)?
            .streams
            .insert(cell.stream_id, SimStream::new(SimStreamKind::Echo, hop));
        self.originate(circuit_id, hop, RelayCell::new(RelayCommand::Connected, cell.stream_id, Vec::new()))
    }

    fn on_data(&mut self, circuit_id: u32, hop: usize, cell: RelayCell) -> Result<()> {
        let stream_id = cell.stream_id;
        let circuit = self.circuit(circuit_id)?;
        circuit.received += 1;
        let circuit_sendme = circuit.received % u32::from(CIRCUIT_INCREMENT) == 0;
        let relay = circuit.relays.get(hop).map(|r| r.router.fingerprint);
        let (stream_sendme, reply) = match circuit.streams.get_mut(&stream_id) {
            None => (false, DataReply::Nothing),
            Some(stream) => {
                stream.received += 1;
                let due = stream.received % u32::from(STREAM_INCREMENT) == 0;
                match &mut stream.kind {
                    SimStreamKind::Echo => (due, DataReply::Echo(cell.data)),
                    SimStreamKind::Directory(buffer) => {
                        buffer.extend_from_slice(&cell.data);
                        match http::parse_request(buffer)? {
                            Some(request) => (due, DataReply::Http(request)),
                            None => (due, DataReply::Nothing),
                        }
                    }
                }
            }
        };

        if circuit_sendme {
            self.originate(circuit_id, hop, RelayCell::new(RelayCommand::Sendme, 0, Vec::new()))?;
        }
        if stream_sendme {
            self.originate(circuit_id, hop, RelayCell::new(RelayCommand::Sendme, stream_id, Vec::new()))?;
        }
        let queued: Vec<RelayCell> = match reply {
            DataReply::Nothing => return Ok(()),
            DataReply::Echo(data) => vec![RelayCell::new(RelayCommand::Data, stream_id, data)],
            DataReply::Http(request) => {
                let relay = relay.ok_or_else(|| TorError::Internal("no relay for hop".into()))?;
                let (status, body) = self.state.tunneled_request(&relay, &request);
                let response = http::encode_response(status, &body);
                let mut cells: Vec<RelayCell> = response
                    .chunks(RelayCell::MAX_DATA_SIZE)
                    .map(|chunk| RelayCell::new(RelayCommand::Data, stream_id, chunk.to_vec()))
                    .collect();
                cells.push(RelayCell::new(RelayCommand::End, stream_id, vec![END_REASON_DONE]));
                cells
            }
        };
        if let Some(stream) = self.circuit(circuit_id)?.streams.get_mut(&stream_id) {
            stream.pending.extend(queued);
        }
        self.flush(circuit_id)
    }

    fn on_sendme(&mut self, circuit_id: u32, stream_id: u16) -> Result<()> {
        if stream_id != 0 {
            self.state.stream_sendmes.fetch_add(1, Ordering::SeqCst);
        }
        let circuit = self.circuit(circuit_id)?;
        if stream_id == 0 {
            circuit.window += u32::from(CIRCUIT_INCREMENT);
        } else {
            match circuit.streams.get_mut(&stream_id) {
                Some(stream) => stream.window += u32::from(STREAM_INCREMENT),
                None => return Ok(()),
            }
        }
        self.flush(circuit_id)
    }

    /// Send the queued stream cells the client has window for
    fn flush(&mut self, circuit_id: u32) -> Result<()> {
        let circuit = self.circuit(circuit_id)?;
        let mut ready = Vec::new();
        let mut finished = Vec::new();
        for (&stream_id, stream) in circuit.streams.iter_mut() {
            while let Some(cell) = stream.pending.front() {
                if cell.command == RelayCommand::Data {
                    if stream.window == 0 || circuit.window == 0 {
                        break;
                    }
                    stream.window -= 1;
                    circuit.window -= 1;
                }
                let Some(cell) = stream.pending.pop_front() else { break };
                if cell.command == RelayCommand::End {
                    finished.push(stream_id);
                }
                ready.push((stream.hop, cell));
            }
        }
        for stream_id in finished {
            circuit.streams.remove(&stream_id);
        }
        for (hop, cell) in ready {
            self.originate(circuit_id, hop, cell)?;
        }
        Ok(())
    }

    fn on_resolve(&mut self, circuit_id: u32, hop: usize, cell: RelayCell) -> Result<()> {
        let query = nul_terminated(&cell.data);
        let answers = if query.ends_with(".invalid") {
            vec![ResolvedAnswer::Error]
        } else if query.ends_with(".arpa") {
            vec![ResolvedAnswer::Hostname {
                hostname: REVERSE_LOOKUP_NAME.into(),
                ttl: 60,
            }]
        } else {
            vec![
                ResolvedAnswer::Address {
                    address: IpAddr::V4(Ipv4Addr::LOCALHOST),
                    ttl: 60,
                },
                ResolvedAnswer::Address {
                    address: IpAddr::V6(Ipv6Addr::LOCALHOST),
                    ttl: 60,
                },
            ]
        };
        let resolved = RelayCell::new(RelayCommand::Resolved, cell.stream_id, encode_resolved(&answers));
        self.originate(circuit_id, hop, resolved)
    }
}

async fn serve_link(state: Arc<SimState>, relay: Arc<SimRelay>, stream: BoxedStream) -> Result<()> {
    let (mut reader, mut writer) = stream.split();
    let offered = read_versions(&mut reader).await?;
    negotiate_version(&LINK_PROTOCOLS, &offered)?;

    let now = unix_seconds(SystemTime::now()) as u32;
    let mut greeting = VarCell::new(0, CellCommand::Versions, versions_payload(&LINK_PROTOCOLS)).to_bytes(true)?;
    greeting.extend(VarCell::new(0, CellCommand::Certs, vec![0]).to_bytes(false)?);
    greeting.extend(
        Cell::new(
            0,
            CellCommand::Netinfo,
            netinfo_payload(now, IpAddr::V4(Ipv4Addr::LOCALHOST), &[relay.router.address]),
        )
        .to_bytes()?,
    );
    writer.write_all(&greeting).await?;
    writer.flush().await?;

    let (out, mut outbound) = mpsc::unbounded_channel::<Vec<u8>>();
    let writer_task = tokio::spawn(async move {
        while let Some(bytes) = outbound.recv().await {
            if writer.write_all(&bytes).await.is_err() || writer.flush().await.is_err() {
                break;
            }
        }
        let _ = writer.close().await;
    });
    let (cells_tx, mut cells) = mpsc::unbounded_channel();
    let reader_task = tokio::spawn(async move {
        while let Ok(Some(cell)) = read_cell(&mut reader).await {
            if cells_tx.send(cell).is_err() {
                break;
            }
        }
    });

    let (inject, mut injected) = mpsc::unbounded_channel();
    let mut link = SimLink {
        state,
        relay,
        out,
        inject,
        circuits: HashMap::new(),
    };
    loop {
        tokio::select! {
            cell = cells.recv() => match cell {
                Some(WireCell::Fixed(cell)) => link.on_cell(cell),
                Some(_) => {}
                None => break,
            },
            Some(message) = injected.recv() => link.on_inject(message),
        }
    }
    reader_task.abort();
    drop(link);
    let _ = writer_task.await;
    Ok(())
}

/// A Tor network made of simulated relays on a [`MockLayer`]
pub struct LoopbackNetwork {
    mock: Arc<MockLayer>,
    state: Arc<SimState>,
}

impl Default for LoopbackNetwork {
    fn default() -> Self {
        Self::new()
    }
}

impl LoopbackNetwork {
    pub fn new() -> Self {
        let now = unix_seconds(SystemTime::now());
        Self {
            mock: Arc::new(MockLayer::new()),
            state: Arc::new(SimState {
                published: now - 3600,
                valid_after: AtomicU64::new(now - 600),
                descriptor_outage: AtomicBool::new(false),
                registry: Mutex::new(Registry::default()),
                circuits_created: AtomicUsize::new(0),
                directory_requests: AtomicUsize::new(0),
                consensus_requests: AtomicUsize::new(0),
                stream_sendmes: AtomicUsize::new(0),
            }),
        }
    }

    /// The layer clients should connect through
    pub fn layer(&self) -> Arc<MockLayer> {
        self.mock.clone()
    }

    /// Start a relay; returns it as a directory would describe it
    pub fn add_relay(&self, spec: RelaySpec) -> Result<Router> {
        let keys = RelayKeys::generate()?;
        let (descriptor, digest) = signed_descriptor(&spec, &keys, self.state.published)?;
        let mut router = parse_descriptor(&descriptor)?;
        router.flags = RouterFlags::from_string(&spec.flags);

        let relay = Arc::new(SimRelay {
            ntor: NtorServer::new(*keys.fingerprint.as_bytes(), keys.ntor_secret.clone()),
            spec,
            router: router.clone(),
            descriptor,
            digest,
        });

        let state = self.state.clone();
        let link_relay = relay.clone();
        let handler: MockHandler = Arc::new(move |stream| {
            let state = state.clone();
            let relay = link_relay.clone();
            async move {
                let nickname = relay.spec.nickname.clone();
                if let Err(e) = serve_link(state, relay, stream).await {
                    log::debug!("simulated relay {}: {}", nickname, e);
                }
            }
            .boxed()
        });
        self.mock.serve(router.or_address().into(), handler);
        if let Some(dir_address) = router.dir_address() {
            self.serve_directory(dir_address);
        }
        self.state.registry()?.relays.push(relay);
        Ok(router)
    }

    /// `guards` entry relays and `exits` exits accepting ports 80 and 443,
    /// each in its own /24 and all of them directory caches and HSDirs
    pub fn add_standard_relays(&self, guards: usize, exits: usize) -> Result<Vec<Router>> {
        let mut routers = Vec::with_capacity(guards + exits);
        for i in 0..guards {
            let spec = RelaySpec::new(&format!("guard{}", i), IpAddr::V4(Ipv4Addr::new(10, 1, i as u8, 1)))
                .flags("Fast Guard HSDir Running Stable V2Dir Valid")
                .dir_port(9030);
            routers.push(self.add_relay(spec)?);
        }
        for i in 0..exits {
            let spec = RelaySpec::new(&format!("exit{}", i), IpAddr::V4(Ipv4Addr::new(10, 2, i as u8, 1)))
                .flags("Exit Fast HSDir Running Stable V2Dir Valid")
                .policy(&["accept *:80", "accept *:443", "reject *:*"])
                .dir_port(9030);
            routers.push(self.add_relay(spec)?);
        }
        Ok(routers)
    }

    fn serve_directory(&self, address: SocketAddr) {
        let state = self.state.clone();
        self.mock.serve_http(
            NetAddress::from(address),
            Arc::new(move |path: &str| state.directory_document(path).map(|body| (200, body))),
        );
    }

    /// Answer directory requests at every built-in authority address
    pub fn serve_authorities(&self) {
        for authority in DIRECTORY_AUTHORITIES {
            self.serve_directory(authority.dir_address());
        }
    }

    /// Make `router` unreachable
    pub fn take_down(&self, router: &Router) {
        self.mock.remove(&router.or_address().into());
        if let Some(dir_address) = router.dir_address() {
            self.mock.remove(&dir_address.into());
        }
    }

    pub fn consensus_text(&self) -> String {
        self.state.consensus_text()
    }

    /// Start the consensus `age` ago; past one hour it is no longer fresh
    pub fn set_consensus_age(&self, age: Duration) {
        let now = unix_seconds(SystemTime::now());
        self.state
            .valid_after
            .store(now.saturating_sub(age.as_secs()), Ordering::SeqCst);
    }

    /// List new descriptor digests in the consensus and answer every
    /// descriptor request with 404
    pub fn start_descriptor_outage(&self) {
        self.state.descriptor_outage.store(true, Ordering::SeqCst);
    }

    /// CREATE2 cells answered
    pub fn circuits_created(&self) -> usize {
        self.state.circuits_created.load(Ordering::SeqCst)
    }

    pub fn directory_requests(&self) -> usize {
        self.state.directory_requests.load(Ordering::SeqCst)
    }

    pub fn consensus_requests(&self) -> usize {
        self.state.consensus_requests.load(Ordering::SeqCst)
    }

    /// Stream-level SENDMEs clients sent to exits
    pub fn stream_sendmes(&self) -> usize {
        self.state.stream_sendmes.load(Ordering::SeqCst)
    }

    /// Hidden-service descriptors stored across all HSDirs
    pub fn hs_descriptor_count(&self) -> usize {
        self.state
            .registry()
            .map(|r| r.hs_descriptors.len())
            .unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::directory::consensus::DirectoryConsensus;
    use crate::protocol::channel::Channel;
    use crate::protocol::circuit::Circuit;
    use crate::network::{ConnectProperties, NetLayer};

    async fn channel_to(network: &LoopbackNetwork, router: &Router) -> Arc<Channel> {
        let stream = network
            .layer()
            .connect(&ConnectProperties::relay_link(), None, &router.or_address().into())
            .await
            .unwrap();
        Channel::open(stream, router.fingerprint, router.or_address()).await.unwrap()
    }

    #[tokio::test]
    async fn test_directory_documents() {
        let network = LoopbackNetwork::new();
        let routers = network.add_standard_relays(2, 1).unwrap();
        let consensus = DirectoryConsensus::parse(&network.consensus_text()).unwrap();
        assert_eq!(consensus.routers.len(), 3);
        assert!(consensus.routers[&routers[2].fingerprint].flags.exit);

        let digest = consensus.routers[&routers[0].fingerprint].descriptor_digest;
        let path = format!("{}{}", DESCRIPTORS_BY_DIGEST_PATH, hex::encode_upper(digest));
        let body = network.state.directory_document(&path).unwrap();
        let router = parse_descriptor(std::str::from_utf8(&body).unwrap()).unwrap();
        assert_eq!(router.fingerprint, routers[0].fingerprint);
        assert!(network.state.directory_document("/tor/keys/all").is_none());
        assert_eq!(network.consensus_requests(), 0);
    }

    #[tokio::test]
    async fn test_three_hop_circuit_and_echo_stream() {
        let network = LoopbackNetwork::new();
        let routers = network.add_standard_relays(2, 1).unwrap();
        let channel = channel_to(&network, &routers[0]).await;

        let circuit = Circuit::create(channel, &routers[0]).await.unwrap();
        circuit.extend(&routers[1]).await.unwrap();
        circuit.extend(&routers[2]).await.unwrap();
        circuit.mark_established();
        assert_eq!(circuit.hop_count(), 3);
        assert_eq!(network.circuits_created(), 1);

        let timeout = std::time::Duration::from_secs(5);
        let target = NetAddress::new("10.9.9.9", 443);
        let mut stream = crate::protocol::stream::TorStream::open(circuit.clone(), &target, timeout, timeout)
            .await
            .unwrap();
        stream.write(b"ping").await.unwrap();
        assert_eq!(stream.next_data().await.unwrap(), Some(b"ping".to_vec()));

        let refused = NetAddress::new("10.9.9.9", 22);
        let err = crate::protocol::stream::TorStream::open(circuit.clone(), &refused, timeout, timeout)
            .await
            .unwrap_err();
        assert!(matches!(err, TorError::StreamRefused { reason: 4, .. }));
    }

    #[tokio::test]
    async fn test_extend_to_unknown_relay_is_truncated() {
        let network = LoopbackNetwork::new();
        let routers = network.add_standard_relays(1, 0).unwrap();
        let channel = channel_to(&network, &routers[0]).await;
        let circuit = Circuit::create(channel, &routers[0]).await.unwrap();

        let mut stranger = routers[0].clone();
        stranger.fingerprint = Fingerprint::new([0xee; 20]);
        let err = circuit.extend(&stranger).await.unwrap_err();
        assert!(matches!(err, TorError::CircuitDestroyed { .. }));
    }

    #[tokio::test]
    async fn test_unread_stream_stops_earning_sendmes() {
        let network = LoopbackNetwork::new();
        let routers = network.add_standard_relays(1, 1).unwrap();
        let channel = channel_to(&network, &routers[0]).await;
        let circuit = Circuit::create(channel, &routers[0]).await.unwrap();
        circuit.extend(&routers[1]).await.unwrap();
        circuit.mark_established();

        let timeout = Duration::from_secs(5);
        let target = NetAddress::new("10.9.9.9", 80);
        let mut stream = crate::protocol::stream::TorStream::open(circuit.clone(), &target, timeout, timeout)
            .await
            .unwrap();

        // Echoed back while nobody reads; the exit stops at the window
        let cells = 600;
        let payload: Vec<u8> = (0..cells * RelayCell::MAX_DATA_SIZE).map(|i| (i % 251) as u8).collect();
        stream.write(&payload).await.unwrap();
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(network.stream_sendmes(), 0);

        let mut echoed = Vec::with_capacity(payload.len());
        while echoed.len() < payload.len() {
            let data = tokio::time::timeout(timeout, stream.next_data())
                .await
                .unwrap()
                .unwrap()
                .expect("stream ended early");
            echoed.extend_from_slice(&data);
        }
        assert_eq!(echoed, payload);
        tokio::time::timeout(timeout, async {
            while network.stream_sendmes() < cells / usize::from(STREAM_INCREMENT) {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();
    }
}
