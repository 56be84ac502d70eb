//! Circuits
//!
//! A circuit is created with CREATE2 to its first hop and grown one hop at
//! a time with EXTEND2 sent in RELAY_EARLY cells. From the moment its id
//! is allocated, a reactor task owns the inbound side: it removes the
//! onion layers, applies SENDMEs and hands each relay cell to the stream
//! it belongs to. Receive-side SENDMEs go out as streams consume DATA. Cells for stream 0 (handshake replies, rendezvous
//! messages) go to a control queue that one conversation at a time reads.
//!
//! Dropping the last handle to a circuit sends DESTROY.

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::{Duration, Instant};

use tokio::sync::{mpsc, watch, Mutex as AsyncMutex};
use tokio::task::JoinHandle;
use x25519_dalek::PublicKey;

use super::cell::{Cell, CellCommand, RelayCell, RelayCommand};
use super::channel::{Channel, DESTROY_REASON_FINISHED};
use super::crypto::{CircuitKeys, OnionCrypto};
use super::flow_control::{RecvWindow, SendWindow};
use super::ntor::{NtorHandshake, HANDSHAKE_TYPE_NTOR};
use crate::directory::router::Router;
use crate::error::{Result, TorError};

/// Clients may send at most this many RELAY_EARLY cells per circuit
const MAX_RELAY_EARLY: u32 = 8;

/// DESTROY reason sent when the relay violated the protocol
pub const DESTROY_REASON_PROTOCOL: u8 = 1;

/// RELAY_END reason for a BEGIN this circuit does not accept
const END_REASON_EXIT_POLICY: u8 = 4;
/// RELAY_END reason for a BEGIN that could not be queued
const END_REASON_RESOURCE_LIMIT: u8 = 5;

/// Link specifier types used in EXTEND2
const LSPEC_IPV4: u8 = 0;
const LSPEC_IPV6: u8 = 1;
const LSPEC_LEGACY_ID: u8 = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    /// Id allocated, CREATE2 not yet sent
    New,
    /// Handshakes in progress
    Building,
    /// Every hop answered; streams may be attached
    Established,
    Closed,
}

/// What the reactor forwards to the control queue
enum Control {
    Created(Vec<u8>),
    Relay(usize, RelayCell),
}

struct StreamEntry {
    inbound: mpsc::UnboundedSender<RelayCell>,
    send_window: Arc<SendWindow>,
    recv_window: RecvWindow,
}

#[derive(Default)]
struct StreamTable {
    entries: HashMap<u16, StreamEntry>,
    next_id: u16,
}

impl StreamTable {
    fn allocate(&mut self) -> Option<u16> {
        for _ in 0..u16::MAX {
            self.next_id = self.next_id.wrapping_add(1);
            if self.next_id == 0 {
                self.next_id = 1;
            }
            if !self.entries.contains_key(&self.next_id) {
                return Some(self.next_id);
            }
        }
        None
    }
}

/// A freshly registered stream slot on a circuit
pub(crate) struct StreamSlot {
    pub stream_id: u16,
    pub inbound: mpsc::UnboundedReceiver<RelayCell>,
    pub send_window: Arc<SendWindow>,
}

/// A BEGIN received on a circuit that accepts inbound streams
///
/// Turned into a stream by [`TorStream::accept`](super::stream::TorStream::accept).
pub struct IncomingStream {
    pub circuit: Arc<Circuit>,
    pub hop: usize,
    /// `host:port` the peer asked for
    pub target: String,
    pub(crate) slot: StreamSlot,
}

impl IncomingStream {
    pub fn stream_id(&self) -> u16 {
        self.slot.stream_id
    }

    /// Port part of the requested target
    pub fn port(&self) -> Option<u16> {
        self.target.rsplit_once(':').and_then(|(_, p)| p.parse().ok())
    }

    /// Answer the BEGIN with END `reason`
    pub fn refuse(self, reason: u8) -> Result<()> {
        let stream_id = self.slot.stream_id;
        self.circuit.remove_stream(stream_id);
        self.circuit.send_relay_cell(
            &RelayCell::new(RelayCommand::End, stream_id, vec![reason]),
            self.hop,
            false,
        )
    }
}

pub struct Circuit {
    id: u32,
    channel: Arc<Channel>,
    crypto: Mutex<OnionCrypto>,
    route: Mutex<Vec<Router>>,
    state: watch::Sender<CircuitState>,
    destroy_reason: Mutex<Option<u8>>,
    control: AsyncMutex<mpsc::UnboundedReceiver<Control>>,
    streams: Mutex<StreamTable>,
    send_window: SendWindow,
    recv_window: Mutex<RecvWindow>,
    acceptor: Mutex<Option<mpsc::UnboundedSender<IncomingStream>>>,
    relay_early_sent: AtomicU32,
    streams_opened: AtomicU32,
    failures: AtomicU32,
    created: Instant,
    last_used: Mutex<Instant>,
    reactor: Mutex<Option<JoinHandle<()>>>,
}

impl std::fmt::Debug for Circuit {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Circuit")
            .field("id", &format_args!("{:#010x}", self.id))
            .field("state", &self.state())
            .field("hops", &self.hop_count())
            .finish()
    }
}

impl Circuit {
    /// Create a one-hop circuit to `first_hop` over `channel`
    ///
    /// The caller bounds this with its own timeout; dropping the future
    /// tears the half-built circuit down.
    pub async fn create(channel: Arc<Channel>, first_hop: &Router) -> Result<Arc<Circuit>> {
        let ntor = NtorHandshake::new(first_hop.fingerprint.as_bytes(), &ntor_key(first_hop)?)?;
        let (id, inbound) = channel.allocate_circuit()?;
        let (control_tx, control_rx) = mpsc::unbounded_channel();
        let now = Instant::now();

        let circuit = Arc::new(Circuit {
            id,
            channel: channel.clone(),
            crypto: Mutex::new(OnionCrypto::new()),
            route: Mutex::new(Vec::new()),
            state: watch::channel(CircuitState::New).0,
            destroy_reason: Mutex::new(None),
            control: AsyncMutex::new(control_rx),
            streams: Mutex::new(StreamTable::default()),
            send_window: SendWindow::circuit(),
            recv_window: Mutex::new(RecvWindow::circuit()),
            acceptor: Mutex::new(None),
            relay_early_sent: AtomicU32::new(0),
            streams_opened: AtomicU32::new(0),
            failures: AtomicU32::new(0),
            created: now,
            last_used: Mutex::new(now),
            reactor: Mutex::new(None),
        });
        let reactor = tokio::spawn(reactor(Arc::downgrade(&circuit), inbound, control_tx));
        if let Ok(mut slot) = circuit.reactor.lock() {
            *slot = Some(reactor);
        }

        let handshake = ntor.handshake_data();
        let mut payload = Vec::with_capacity(4 + handshake.len());
        payload.extend_from_slice(&HANDSHAKE_TYPE_NTOR.to_be_bytes());
        payload.extend_from_slice(&(handshake.len() as u16).to_be_bytes());
        payload.extend_from_slice(&handshake);

        circuit.state.send_replace(CircuitState::Building);
        channel.send_cell(&Cell::new(id, CellCommand::Create2, payload))?;

        let reply = {
            let mut control = circuit.control.lock().await;
            control.recv().await.ok_or_else(|| circuit.closed_error())?
        };
        let keys = match reply {
            Control::Created(payload) => ntor.complete(handshake_reply(&payload)?)?,
            Control::Relay(_, cell) => {
                return Err(TorError::UnexpectedCell {
                    expected: "CREATED2".into(),
                    got: format!("{:?}", cell.command),
                })
            }
        };
        circuit.lock_crypto()?.add_hop(&keys);
        circuit.lock_route()?.push(first_hop.clone());

        log::debug!(
            "circuit {:#010x}: created to {} ({})",
            id,
            first_hop.nickname,
            first_hop.fingerprint
        );
        Ok(circuit)
    }

    /// Extend the circuit by one hop
    pub async fn extend(&self, router: &Router) -> Result<()> {
        let ntor = NtorHandshake::new(router.fingerprint.as_bytes(), &ntor_key(router)?)?;
        let payload = extend2_payload(router, &ntor.handshake_data());

        let mut control = self.control.lock().await;
        let last = self.hop_count().checked_sub(1).ok_or_else(|| {
            TorError::InvalidState("cannot extend a circuit without hops".into())
        })?;
        self.send_relay_cell(&RelayCell::new(RelayCommand::Extend2, 0, payload), last, true)?;

        let (hop, reply) = match control.recv().await {
            Some(Control::Relay(hop, cell)) => (hop, cell),
            Some(Control::Created(_)) => {
                return Err(TorError::UnexpectedCell {
                    expected: "EXTENDED2".into(),
                    got: "CREATED2".into(),
                })
            }
            None => return Err(self.closed_error()),
        };
        match reply.command {
            RelayCommand::Extended2 if hop == last => {
                let keys = ntor.complete(handshake_reply(&reply.data)?)?;
                self.lock_crypto()?.add_hop(&keys);
                self.lock_route()?.push(router.clone());
                log::debug!(
                    "circuit {:#010x}: extended to {} ({} hops)",
                    self.id,
                    router.nickname,
                    last + 2
                );
                Ok(())
            }
            RelayCommand::Truncated => Err(TorError::circuit_destroyed(
                reply.data.first().copied().unwrap_or(0),
            )),
            other => Err(TorError::UnexpectedCell {
                expected: "EXTENDED2".into(),
                got: format!("{:?} from hop {}", other, hop),
            }),
        }
    }

    /// Append a hop that is not a relay
    ///
    /// Used for the hidden-service end of a rendezvous circuit: the
    /// rendezvous point joins two circuits and the service becomes one
    /// more layer beyond it.
    pub fn add_virtual_hop(&self, keys: &CircuitKeys) -> Result<()> {
        self.lock_crypto()?.add_hop(keys);
        Ok(())
    }

    pub fn mark_established(&self) {
        self.state.send_if_modified(|state| {
            if *state == CircuitState::Building {
                *state = CircuitState::Established;
                true
            } else {
                false
            }
        });
    }

    /// Encrypt `cell` for `hop` and queue it on the link
    ///
    /// Never waits: encryption and queueing happen under the crypto lock
    /// so cells leave in the order their digests were computed.
    pub fn send_relay_cell(&self, cell: &RelayCell, hop: usize, early: bool) -> Result<()> {
        if self.is_closed() {
            return Err(self.closed_error());
        }
        let command = if early && self.relay_early_sent.fetch_add(1, Ordering::SeqCst) < MAX_RELAY_EARLY
        {
            CellCommand::RelayEarly
        } else {
            CellCommand::Relay
        };
        let mut crypto = self.lock_crypto()?;
        let payload = crypto.encrypt_outbound(cell, hop)?;
        self.channel.send_cell(&Cell::new(self.id, command, payload))
    }

    /// Send a stream-0 cell to `hop` and wait for the next stream-0 reply
    pub async fn control_request(&self, cell: RelayCell, hop: usize) -> Result<RelayCell> {
        let mut control = self.control.lock().await;
        self.send_relay_cell(&cell, hop, false)?;
        match control.recv().await {
            Some(Control::Relay(_, reply)) => Ok(reply),
            Some(Control::Created(_)) => Err(TorError::UnexpectedCell {
                expected: "relay cell".into(),
                got: "CREATED2".into(),
            }),
            None => Err(self.closed_error()),
        }
    }

    /// Wait for the next stream-0 cell and the hop it came from
    pub async fn next_control_cell(&self) -> Result<(usize, RelayCell)> {
        let mut control = self.control.lock().await;
        loop {
            match control.recv().await {
                Some(Control::Relay(hop, cell)) => return Ok((hop, cell)),
                Some(Control::Created(_)) => continue,
                None => return Err(self.closed_error()),
            }
        }
    }

    /// Route inbound BEGIN cells to `acceptor` instead of refusing them
    pub fn accept_streams(&self, acceptor: mpsc::UnboundedSender<IncomingStream>) {
        if let Ok(mut slot) = self.acceptor.lock() {
            *slot = Some(acceptor);
        }
    }

    pub(crate) fn register_stream(&self) -> Result<StreamSlot> {
        if self.is_closed() {
            return Err(self.closed_error());
        }
        let mut streams = self.lock_streams()?;
        let stream_id = streams.allocate().ok_or_else(|| {
            TorError::ResourceExhausted(format!("no free stream id on circuit {:#010x}", self.id))
        })?;
        let slot = Self::insert_stream(&mut streams, stream_id);
        drop(streams);
        self.streams_opened.fetch_add(1, Ordering::Relaxed);
        self.touch();
        Ok(slot)
    }

    fn insert_stream(streams: &mut StreamTable, stream_id: u16) -> StreamSlot {
        let (tx, inbound) = mpsc::unbounded_channel();
        let send_window = Arc::new(SendWindow::stream());
        streams.entries.insert(
            stream_id,
            StreamEntry {
                inbound: tx,
                send_window: send_window.clone(),
                recv_window: RecvWindow::stream(),
            },
        );
        StreamSlot {
            stream_id,
            inbound,
            send_window,
        }
    }

    pub(crate) fn remove_stream(&self, stream_id: u16) {
        if let Ok(mut streams) = self.streams.lock() {
            if let Some(entry) = streams.entries.remove(&stream_id) {
                entry.send_window.close();
            }
        }
        self.touch();
    }

    /// Credit for outgoing DATA cells on the whole circuit
    pub fn send_window(&self) -> &SendWindow {
        &self.send_window
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn channel(&self) -> &Arc<Channel> {
        &self.channel
    }

    pub fn state(&self) -> CircuitState {
        *self.state.borrow()
    }

    pub fn is_established(&self) -> bool {
        self.state() == CircuitState::Established
    }

    pub fn is_closed(&self) -> bool {
        self.state() == CircuitState::Closed
    }

    /// Wait until the circuit is closed
    pub async fn closed(&self) {
        let mut state = self.state.subscribe();
        let _ = state.wait_for(|s| *s == CircuitState::Closed).await;
    }

    /// Number of layers, virtual hops included
    pub fn hop_count(&self) -> usize {
        self.crypto.lock().map(|c| c.hop_count()).unwrap_or(0)
    }

    /// Index of the outermost hop
    pub fn last_hop(&self) -> usize {
        self.hop_count().saturating_sub(1)
    }

    /// Relays of the circuit, first hop first
    pub fn route(&self) -> Vec<Router> {
        self.route.lock().map(|r| r.clone()).unwrap_or_default()
    }

    /// Last relay of the circuit
    pub fn exit_router(&self) -> Option<Router> {
        self.route.lock().ok().and_then(|r| r.last().cloned())
    }

    pub fn stream_count(&self) -> usize {
        self.streams.lock().map(|s| s.entries.len()).unwrap_or(0)
    }

    /// Streams ever attached, finished ones included
    pub fn streams_opened(&self) -> u32 {
        self.streams_opened.load(Ordering::Relaxed)
    }

    /// Established with no open stream
    pub fn is_idle(&self) -> bool {
        self.is_established() && self.stream_count() == 0
    }

    pub fn age(&self) -> Duration {
        self.created.elapsed()
    }

    pub fn idle_time(&self) -> Duration {
        self.last_used
            .lock()
            .map(|t| t.elapsed())
            .unwrap_or_default()
    }

    /// Count a failed stream attempt against this circuit
    pub fn record_failure(&self) -> u32 {
        self.failures.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub fn failures(&self) -> u32 {
        self.failures.load(Ordering::Relaxed)
    }

    /// Send DESTROY with `reason` and release everything
    pub fn destroy(&self, reason: u8) {
        if !self.is_closed() {
            let _ = self.channel.send_cell(&Cell::destroy(self.id, reason));
        }
        self.mark_closed(None);
    }

    pub fn close(&self) {
        self.destroy(DESTROY_REASON_FINISHED);
    }

    fn touch(&self) {
        if let Ok(mut last) = self.last_used.lock() {
            *last = Instant::now();
        }
    }

    fn mark_closed(&self, reason: Option<u8>) {
        let changed = self.state.send_if_modified(|state| {
            if *state == CircuitState::Closed {
                false
            } else {
                *state = CircuitState::Closed;
                true
            }
        });
        if !changed {
            return;
        }
        if let (Some(reason), Ok(mut slot)) = (reason, self.destroy_reason.lock()) {
            *slot = Some(reason);
        }

        self.send_window.close();
        if let Ok(mut streams) = self.streams.lock() {
            for (_, entry) in streams.entries.drain() {
                entry.send_window.close();
            }
        }
        if let Ok(mut acceptor) = self.acceptor.lock() {
            acceptor.take();
        }
        self.channel.release_circuit(self.id);
        match reason {
            Some(reason) => log::debug!(
                "circuit {:#010x}: destroyed by relay ({})",
                self.id,
                TorError::circuit_destroyed(reason)
            ),
            None => log::debug!("circuit {:#010x}: closed", self.id),
        }
    }

    fn closed_error(&self) -> TorError {
        match self.destroy_reason.lock().ok().and_then(|r| *r) {
            Some(reason) => TorError::circuit_destroyed(reason),
            None => TorError::CircuitClosed(format!("circuit {:#010x} is closed", self.id)),
        }
    }

    fn lock_crypto(&self) -> Result<std::sync::MutexGuard<'_, OnionCrypto>> {
        self.crypto
            .lock()
            .map_err(|_| TorError::Internal("circuit crypto poisoned".into()))
    }

    fn lock_route(&self) -> Result<std::sync::MutexGuard<'_, Vec<Router>>> {
        self.route
            .lock()
            .map_err(|_| TorError::Internal("circuit route poisoned".into()))
    }

    fn lock_recv_window(&self) -> Result<std::sync::MutexGuard<'_, RecvWindow>> {
        self.recv_window
            .lock()
            .map_err(|_| TorError::Internal("receive window poisoned".into()))
    }

    fn lock_streams(&self) -> Result<std::sync::MutexGuard<'_, StreamTable>> {
        self.streams
            .lock()
            .map_err(|_| TorError::Internal("stream table poisoned".into()))
    }

    /// Handle one inbound RELAY or RELAY_EARLY payload
    fn handle_relay(self: &Arc<Self>, mut payload: Vec<u8>, control: &mpsc::UnboundedSender<Control>) -> Result<()> {
        let (hop, cell) = self.lock_crypto()?.decrypt_inbound(&mut payload)?;
        log::trace!(
            "circuit {:#010x}: {:?} on stream {} from hop {}",
            self.id,
            cell.command,
            cell.stream_id,
            hop
        );

        if cell.stream_id == 0 {
            return match cell.command {
                RelayCommand::Sendme => self.send_window.replenish(),
                RelayCommand::Data => Err(TorError::ProtocolError("DATA on stream 0".into())),
                RelayCommand::Drop => Ok(()),
                _ => {
                    let _ = control.send(Control::Relay(hop, cell));
                    Ok(())
                }
            };
        }

        match cell.command {
            RelayCommand::Data => {
                self.lock_recv_window()?.on_receive()?;
                self.deliver_data(hop, cell)
            }
            RelayCommand::Sendme => {
                let streams = self.lock_streams()?;
                match streams.entries.get(&cell.stream_id) {
                    Some(entry) => entry.send_window.replenish(),
                    None => Ok(()),
                }
            }
            RelayCommand::Begin | RelayCommand::BeginDir => self.accept_begin(hop, cell),
            RelayCommand::End => {
                let entry = self.lock_streams()?.entries.remove(&cell.stream_id);
                if let Some(entry) = entry {
                    entry.send_window.close();
                    let _ = entry.inbound.send(cell);
                }
                Ok(())
            }
            _ => {
                let streams = self.lock_streams()?;
                match streams.entries.get(&cell.stream_id) {
                    Some(entry) => {
                        let _ = entry.inbound.send(cell);
                    }
                    None => log::debug!(
                        "circuit {:#010x}: {:?} for unknown stream {}",
                        self.id,
                        cell.command,
                        cell.stream_id
                    ),
                }
                Ok(())
            }
        }
    }

    fn deliver_data(&self, hop: usize, cell: RelayCell) -> Result<()> {
        let stream_id = cell.stream_id;
        let queued = {
            let mut streams = self.lock_streams()?;
            match streams.entries.get_mut(&stream_id) {
                Some(entry) => {
                    entry.recv_window.on_receive()?;
                    entry.inbound.send(cell).is_ok()
                }
                None => {
                    log::debug!("circuit {:#010x}: DATA for unknown stream {}", self.id, stream_id);
                    false
                }
            }
        };
        // Nobody will read it, so it counts as consumed right away
        if !queued {
            self.discard_data(1, hop)?;
        }
        Ok(())
    }

    /// Account for one DATA cell a stream has read, sending the stream
    /// and circuit SENDMEs that fall due
    pub(crate) fn data_consumed(&self, stream_id: u16, hop: usize) -> Result<()> {
        self.discard_data(1, hop)?;
        let stream_due = self
            .lock_streams()?
            .entries
            .get_mut(&stream_id)
            .map_or(false, |entry| entry.recv_window.on_consume());
        if stream_due {
            self.send_relay_cell(&RelayCell::new(RelayCommand::Sendme, stream_id, Vec::new()), hop, false)?;
        }
        Ok(())
    }

    /// Count `cells` DATA cells as consumed on the circuit window
    pub(crate) fn discard_data(&self, cells: usize, hop: usize) -> Result<()> {
        let due = {
            let mut window = self.lock_recv_window()?;
            (0..cells).filter(|_| window.on_consume()).count()
        };
        for _ in 0..due {
            self.send_relay_cell(&RelayCell::new(RelayCommand::Sendme, 0, Vec::new()), hop, false)?;
        }
        Ok(())
    }

    fn accept_begin(self: &Arc<Self>, hop: usize, cell: RelayCell) -> Result<()> {
        let stream_id = cell.stream_id;
        let acceptor = self.acceptor.lock().ok().and_then(|a| a.clone());
        let Some(acceptor) = acceptor else {
            log::debug!("circuit {:#010x}: refusing inbound stream {}", self.id, stream_id);
            let end = RelayCell::new(RelayCommand::End, stream_id, vec![END_REASON_EXIT_POLICY]);
            return self.send_relay_cell(&end, hop, false);
        };

        let target_end = cell.data.iter().position(|&b| b == 0).unwrap_or(cell.data.len());
        let target = String::from_utf8_lossy(&cell.data[..target_end]).into_owned();
        let slot = {
            let mut streams = self.lock_streams()?;
            if streams.entries.contains_key(&stream_id) {
                return Err(TorError::ProtocolError(format!(
                    "BEGIN for stream {} already in use",
                    stream_id
                )));
            }
            Self::insert_stream(&mut streams, stream_id)
        };
        self.streams_opened.fetch_add(1, Ordering::Relaxed);

        let incoming = IncomingStream {
            circuit: self.clone(),
            hop,
            target,
            slot,
        };
        if acceptor.send(incoming).is_err() {
            self.remove_stream(stream_id);
            let end = RelayCell::new(RelayCommand::End, stream_id, vec![END_REASON_RESOURCE_LIMIT]);
            self.send_relay_cell(&end, hop, false)?;
        }
        Ok(())
    }
}

impl Drop for Circuit {
    fn drop(&mut self) {
        self.close();
        if let Ok(mut reactor) = self.reactor.lock() {
            if let Some(task) = reactor.take() {
                task.abort();
            }
        }
    }
}

/// Per-circuit inbound task
///
/// Holds only a weak handle so that dropping the circuit ends it.
async fn reactor(
    circuit: Weak<Circuit>,
    mut inbound: mpsc::UnboundedReceiver<Cell>,
    control: mpsc::UnboundedSender<Control>,
) {
    while let Some(cell) = inbound.recv().await {
        let Some(circuit) = circuit.upgrade() else {
            return;
        };
        let outcome = match cell.command {
            CellCommand::Created2 => {
                let _ = control.send(Control::Created(cell.payload));
                Ok(())
            }
            CellCommand::Relay | CellCommand::RelayEarly => {
                circuit.handle_relay(cell.payload, &control)
            }
            CellCommand::Destroy => {
                let reason = cell.payload.first().copied().unwrap_or(0);
                circuit.mark_closed(Some(reason));
                return;
            }
            CellCommand::Padding => Ok(()),
            other => {
                log::debug!("circuit {:#010x}: ignoring {:?}", circuit.id, other);
                Ok(())
            }
        };
        if let Err(e) = outcome {
            log::warn!("circuit {:#010x}: {}; tearing it down", circuit.id, e);
            circuit.destroy(DESTROY_REASON_PROTOCOL);
            return;
        }
    }
    if let Some(circuit) = circuit.upgrade() {
        circuit.mark_closed(None);
    }
}

fn ntor_key(router: &Router) -> Result<PublicKey> {
    router.ntor_onion_key.map(PublicKey::from).ok_or_else(|| {
        TorError::CircuitBuildFailed(format!("{} has no ntor onion key", router.nickname))
    })
}

/// Body of CREATED2 / EXTENDED2: HLEN (2) | HDATA
fn handshake_reply(payload: &[u8]) -> Result<&[u8]> {
    if payload.len() < 2 {
        return Err(TorError::ProtocolError("handshake reply too short".into()));
    }
    let len = u16::from_be_bytes([payload[0], payload[1]]) as usize;
    payload
        .get(2..2 + len)
        .ok_or_else(|| TorError::ProtocolError("handshake reply truncated".into()))
}

/// EXTEND2 body: NSPEC | link specifiers | HTYPE | HLEN | HDATA
pub fn extend2_payload(router: &Router, handshake: &[u8]) -> Vec<u8> {
    let mut specs: Vec<(u8, Vec<u8>)> = Vec::with_capacity(2);
    match router.address {
        IpAddr::V4(v4) => {
            let mut spec = v4.octets().to_vec();
            spec.extend_from_slice(&router.or_port.to_be_bytes());
            specs.push((LSPEC_IPV4, spec));
        }
        IpAddr::V6(v6) => {
            let mut spec = v6.octets().to_vec();
            spec.extend_from_slice(&router.or_port.to_be_bytes());
            specs.push((LSPEC_IPV6, spec));
        }
    }
    specs.push((LSPEC_LEGACY_ID, router.fingerprint.as_bytes().to_vec()));

    let mut payload = Vec::with_capacity(64 + handshake.len());
    payload.push(specs.len() as u8);
    for (kind, body) in specs {
        payload.push(kind);
        payload.push(body.len() as u8);
        payload.extend_from_slice(&body);
    }
    payload.extend_from_slice(&HANDSHAKE_TYPE_NTOR.to_be_bytes());
    payload.extend_from_slice(&(handshake.len() as u16).to_be_bytes());
    payload.extend_from_slice(handshake);
    payload
}

/// Link specifiers and handshake of an EXTEND2 body
pub struct Extend2Request {
    pub address: Option<std::net::SocketAddr>,
    pub legacy_id: Option<[u8; 20]>,
    pub handshake_type: u16,
    pub handshake: Vec<u8>,
}

impl Extend2Request {
    pub fn parse(payload: &[u8]) -> Result<Self> {
        let truncated = || TorError::ProtocolError("EXTEND2 truncated".into());
        let nspec = *payload.first().ok_or_else(truncated)? as usize;
        let mut pos = 1;
        let mut address = None;
        let mut legacy_id = None;
        for _ in 0..nspec {
            let kind = *payload.get(pos).ok_or_else(truncated)?;
            let len = *payload.get(pos + 1).ok_or_else(truncated)? as usize;
            let body = payload.get(pos + 2..pos + 2 + len).ok_or_else(truncated)?;
            match (kind, len) {
                (LSPEC_IPV4, 6) => {
                    let ip = std::net::Ipv4Addr::new(body[0], body[1], body[2], body[3]);
                    address = Some((IpAddr::V4(ip), u16::from_be_bytes([body[4], body[5]])).into());
                }
                (LSPEC_IPV6, 18) => {
                    let mut octets = [0u8; 16];
                    octets.copy_from_slice(&body[..16]);
                    let ip = std::net::Ipv6Addr::from(octets);
                    address = Some((IpAddr::V6(ip), u16::from_be_bytes([body[16], body[17]])).into());
                }
                (LSPEC_LEGACY_ID, 20) => {
                    let mut id = [0u8; 20];
                    id.copy_from_slice(body);
                    legacy_id = Some(id);
                }
                _ => {}
            }
            pos += 2 + len;
        }
        let header = payload.get(pos..pos + 4).ok_or_else(truncated)?;
        let handshake_type = u16::from_be_bytes([header[0], header[1]]);
        let hlen = u16::from_be_bytes([header[2], header[3]]) as usize;
        let handshake = payload
            .get(pos + 4..pos + 4 + hlen)
            .ok_or_else(truncated)?
            .to_vec();
        Ok(Self {
            address,
            legacy_id,
            handshake_type,
            handshake,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::directory::fingerprint::Fingerprint;
    use std::net::Ipv4Addr;

    #[test]
    fn test_extend2_payload_layout() {
        let mut router = Router::new(
            "middle",
            IpAddr::V4(Ipv4Addr::new(10, 0, 0, 7)),
            9001,
            Fingerprint::new([7; 20]),
        );
        router.ntor_onion_key = Some([9; 32]);
        let handshake = vec![0xab; 84];
        let payload = extend2_payload(&router, &handshake);

        assert_eq!(payload[0], 2);
        assert_eq!(&payload[1..3], &[LSPEC_IPV4, 6]);
        assert_eq!(&payload[3..7], &[10, 0, 0, 7]);
        assert_eq!(&payload[7..9], &9001u16.to_be_bytes());
        assert_eq!(&payload[9..11], &[LSPEC_LEGACY_ID, 20]);

        let parsed = Extend2Request::parse(&payload).unwrap();
        assert_eq!(parsed.address, Some(router.or_address()));
        assert_eq!(parsed.legacy_id, Some([7; 20]));
        assert_eq!(parsed.handshake_type, HANDSHAKE_TYPE_NTOR);
        assert_eq!(parsed.handshake, handshake);
    }

    #[test]
    fn test_extend2_ipv6() {
        let router = Router::new("v6", "2001:db8::1".parse().unwrap(), 443, Fingerprint::new([1; 20]));
        let parsed = Extend2Request::parse(&extend2_payload(&router, &[1, 2, 3])).unwrap();
        assert_eq!(parsed.address, Some(router.or_address()));
        assert_eq!(parsed.handshake, vec![1, 2, 3]);
    }

    #[test]
    fn test_truncated_extend2() {
        assert!(Extend2Request::parse(&[]).is_err());
        assert!(Extend2Request::parse(&[1, 2, 20, 0]).is_err());
    }

    #[test]
    fn test_handshake_reply() {
        assert_eq!(handshake_reply(&[0, 2, 5, 6, 7]).unwrap(), &[5, 6]);
        assert!(handshake_reply(&[0, 9, 1]).is_err());
        assert!(handshake_reply(&[0]).is_err());
    }

    #[test]
    fn test_stream_ids_skip_zero_and_used() {
        let mut table = StreamTable::default();
        assert_eq!(table.allocate(), Some(1));
        table.next_id = u16::MAX - 1;
        let (tx, _rx) = mpsc::unbounded_channel();
        table.entries.insert(
            u16::MAX,
            StreamEntry {
                inbound: tx,
                send_window: Arc::new(SendWindow::stream()),
                recv_window: RecvWindow::stream(),
            },
        );
        assert_eq!(table.allocate(), Some(1));
    }
}
