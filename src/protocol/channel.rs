//! Link connection to a single relay
//!
//! A channel runs the link handshake (VERSIONS, CERTS, AUTH_CHALLENGE,
//! NETINFO) and then multiplexes every circuit whose first hop is the
//! relay. One reader task demultiplexes inbound cells by circuit id; one
//! writer task drains the outbound queue.

use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::{Duration, Instant, SystemTime};

use futures::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use rand::Rng;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use super::cell::{Cell, CellCommand, VarCell};
use super::certs::CertsCell;
use crate::directory::fingerprint::Fingerprint;
use crate::directory::router::unix_seconds;
use crate::error::{Result, TorError};
use crate::network::BoxedStream;

/// Link protocol versions we speak
pub const LINK_PROTOCOLS: [u16; 2] = [4, 5];

/// Versions below 4 use 2-byte circuit ids and RSA-only certificates
const MINIMUM_SECURE_VERSION: u16 = 4;

/// Circuit ids we allocate have the high bit set (we initiated the link)
const CIRC_ID_INITIATOR_BIT: u32 = 0x8000_0000;

/// DESTROY reason: no reason given
pub const DESTROY_REASON_NONE: u8 = 0;
/// DESTROY reason: requested by the client
pub const DESTROY_REASON_FINISHED: u8 = 9;

/// A cell read off the wire
#[derive(Debug)]
pub enum WireCell {
    Fixed(Cell),
    Variable(VarCell),
    /// Fixed-length cell with a command we do not know
    Unknown { circuit_id: u32, command: u8 },
}

/// Read one cell (link version 4+ framing); `None` on clean EOF
pub async fn read_cell<R: AsyncRead + Unpin + ?Sized>(reader: &mut R) -> Result<Option<WireCell>> {
    let mut header = [0u8; 5];
    match reader.read_exact(&mut header[..1]).await {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    }
    reader.read_exact(&mut header[1..]).await?;

    let circuit_id = u32::from_be_bytes([header[0], header[1], header[2], header[3]]);
    let command = header[4];

    if CellCommand::is_variable_length(command) {
        let mut len = [0u8; 2];
        reader.read_exact(&mut len).await?;
        let mut payload = vec![0u8; u16::from_be_bytes(len) as usize];
        reader.read_exact(&mut payload).await?;
        return Ok(Some(WireCell::Variable(VarCell {
            circuit_id,
            command,
            payload,
        })));
    }

    let mut payload = vec![0u8; Cell::PAYLOAD_SIZE];
    reader.read_exact(&mut payload).await?;
    Ok(Some(match CellCommand::from_u8(command) {
        Some(command) => WireCell::Fixed(Cell::new(circuit_id, command, payload)),
        None => WireCell::Unknown {
            circuit_id,
            command,
        },
    }))
}

/// Read a VERSIONS cell in the 2-byte circuit id framing
pub async fn read_versions<R: AsyncRead + Unpin + ?Sized>(reader: &mut R) -> Result<Vec<u16>> {
    let mut header = [0u8; 5];
    reader.read_exact(&mut header).await?;
    if header[2] != CellCommand::Versions as u8 {
        return Err(TorError::UnexpectedCell {
            expected: "VERSIONS".into(),
            got: header[2].to_string(),
        });
    }
    let mut payload = vec![0u8; u16::from_be_bytes([header[3], header[4]]) as usize];
    reader.read_exact(&mut payload).await?;
    parse_versions(&payload)
}

/// Parse VERSIONS cell payload into list of supported versions
pub fn parse_versions(payload: &[u8]) -> Result<Vec<u16>> {
    if payload.len() % 2 != 0 {
        return Err(TorError::ProtocolError(
            "VERSIONS payload length must be even".into(),
        ));
    }
    Ok(payload
        .chunks(2)
        .map(|chunk| u16::from_be_bytes([chunk[0], chunk[1]]))
        .collect())
}

/// Negotiate the highest common version with downgrade protection
pub fn negotiate_version(ours: &[u16], theirs: &[u16]) -> Result<u16> {
    match ours.iter().filter(|v| theirs.contains(v)).max() {
        Some(&v) if v >= MINIMUM_SECURE_VERSION => Ok(v),
        Some(&v) => Err(TorError::ProtocolError(format!(
            "relay only offers link version {} (minimum {})",
            v, MINIMUM_SECURE_VERSION
        ))),
        None => Err(TorError::ProtocolError(
            "No common link protocol version with relay".into(),
        )),
    }
}

pub fn versions_payload(versions: &[u16]) -> Vec<u8> {
    versions.iter().flat_map(|v| v.to_be_bytes()).collect()
}

/// NETINFO payload: timestamp, the peer's address, and our addresses
pub fn netinfo_payload(timestamp: u32, other: IpAddr, mine: &[IpAddr]) -> Vec<u8> {
    fn push_addr(buf: &mut Vec<u8>, addr: &IpAddr) {
        match addr {
            IpAddr::V4(v4) => {
                buf.push(0x04);
                buf.push(4);
                buf.extend_from_slice(&v4.octets());
            }
            IpAddr::V6(v6) => {
                buf.push(0x06);
                buf.push(16);
                buf.extend_from_slice(&v6.octets());
            }
        }
    }

    let mut payload = Vec::with_capacity(32);
    payload.extend_from_slice(&timestamp.to_be_bytes());
    push_addr(&mut payload, &other);
    payload.push(mine.len() as u8);
    for addr in mine {
        push_addr(&mut payload, addr);
    }
    payload
}

/// Open link to one relay
pub struct Channel {
    peer: Fingerprint,
    address: SocketAddr,
    link_version: u16,
    outbound: mpsc::UnboundedSender<Vec<u8>>,
    circuits: Mutex<HashMap<u32, mpsc::UnboundedSender<Cell>>>,
    closed: AtomicBool,
    created: Instant,
    last_active: Mutex<Instant>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl std::fmt::Debug for Channel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Channel")
            .field("peer", &self.peer)
            .field("address", &self.address)
            .field("link_version", &self.link_version)
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl Channel {
    /// Run the link handshake over `stream` and start the reader and writer
    pub async fn open(
        mut stream: BoxedStream,
        peer: Fingerprint,
        address: SocketAddr,
    ) -> Result<Arc<Channel>> {
        let link_version = Self::handshake(&mut stream, address.ip()).await?;
        log::debug!(
            "link to {} ({}) established, version {}",
            peer,
            address,
            link_version
        );

        let (reader, writer) = stream.split();
        let (outbound, queue) = mpsc::unbounded_channel();
        let now = Instant::now();
        let channel = Arc::new(Channel {
            peer,
            address,
            link_version,
            outbound,
            circuits: Mutex::new(HashMap::new()),
            closed: AtomicBool::new(false),
            created: now,
            last_active: Mutex::new(now),
            tasks: Mutex::new(Vec::new()),
        });

        let reader_task = tokio::spawn(reader_loop(Arc::downgrade(&channel), reader));
        let writer_task = tokio::spawn(writer_loop(peer, writer, queue));
        if let Ok(mut tasks) = channel.tasks.lock() {
            tasks.push(reader_task);
            tasks.push(writer_task);
        }
        Ok(channel)
    }

    async fn handshake(stream: &mut BoxedStream, peer_ip: IpAddr) -> Result<u16> {
        let versions = VarCell::new(0, CellCommand::Versions, versions_payload(&LINK_PROTOCOLS));
        stream.write_all(&versions.to_bytes(true)?).await?;
        stream.flush().await?;

        let relay_versions = read_versions(stream).await?;
        let version = negotiate_version(&LINK_PROTOCOLS, &relay_versions)?;

        // Relay sends CERTS, AUTH_CHALLENGE and NETINFO; we only answer NETINFO
        loop {
            let cell = read_cell(stream)
                .await?
                .ok_or_else(|| TorError::ConnectionFailed("relay closed during handshake".into()))?;
            match cell {
                WireCell::Variable(var) if var.command == CellCommand::Certs as u8 => {
                    match CertsCell::parse(&var.payload)
                        .and_then(|certs| certs.verify_ed25519_chain(SystemTime::now()))
                    {
                        Ok((identity, _)) => {
                            log::trace!("relay Ed25519 identity {}", hex::encode(identity))
                        }
                        Err(e) => log::debug!("relay certificate chain not verified: {}", e),
                    }
                }
                WireCell::Variable(var)
                    if var.command == CellCommand::AuthChallenge as u8
                        || var.command == CellCommand::Vpadding as u8 => {}
                WireCell::Fixed(cell) if cell.command == CellCommand::Netinfo => break,
                WireCell::Fixed(cell) if cell.command == CellCommand::Padding => {}
                other => {
                    return Err(TorError::UnexpectedCell {
                        expected: "CERTS/AUTH_CHALLENGE/NETINFO".into(),
                        got: format!("{:?}", other),
                    })
                }
            }
        }

        let timestamp = unix_seconds(SystemTime::now()) as u32;
        let netinfo = Cell::new(0, CellCommand::Netinfo, netinfo_payload(timestamp, peer_ip, &[]));
        stream.write_all(&netinfo.to_bytes()?).await?;
        stream.flush().await?;
        Ok(version)
    }

    pub fn peer(&self) -> &Fingerprint {
        &self.peer
    }

    pub fn address(&self) -> SocketAddr {
        self.address
    }

    pub fn link_version(&self) -> u16 {
        self.link_version
    }

    pub fn age(&self) -> Duration {
        self.created.elapsed()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst) || self.outbound.is_closed()
    }

    pub fn circuit_count(&self) -> usize {
        self.circuits.lock().map(|c| c.len()).unwrap_or(0)
    }

    /// Time since the last circuit was attached or released
    pub fn idle_time(&self) -> Duration {
        self.last_active
            .lock()
            .map(|t| t.elapsed())
            .unwrap_or_default()
    }

    fn touch(&self) {
        if let Ok(mut last) = self.last_active.lock() {
            *last = Instant::now();
        }
    }

    /// Reserve a fresh circuit id and the queue its inbound cells go to
    pub fn allocate_circuit(&self) -> Result<(u32, mpsc::UnboundedReceiver<Cell>)> {
        if self.is_closed() {
            return Err(TorError::CircuitClosed(format!("link to {} is closed", self.peer)));
        }
        let mut circuits = self
            .circuits
            .lock()
            .map_err(|_| TorError::Internal("circuit table poisoned".into()))?;
        let mut rng = rand::thread_rng();
        for _ in 0..64 {
            let id = rng.gen::<u32>() | CIRC_ID_INITIATOR_BIT;
            if !circuits.contains_key(&id) {
                let (tx, rx) = mpsc::unbounded_channel();
                circuits.insert(id, tx);
                drop(circuits);
                self.touch();
                return Ok((id, rx));
            }
        }
        Err(TorError::ResourceExhausted(format!(
            "no free circuit id on link to {}",
            self.peer
        )))
    }

    pub fn release_circuit(&self, circuit_id: u32) {
        if let Ok(mut circuits) = self.circuits.lock() {
            circuits.remove(&circuit_id);
        }
        self.touch();
    }

    /// Queue a cell for sending; never blocks
    pub fn send_cell(&self, cell: &Cell) -> Result<()> {
        let bytes = cell.to_bytes()?;
        self.outbound
            .send(bytes)
            .map_err(|_| TorError::CircuitClosed(format!("link to {} is closed", self.peer)))
    }

    /// Stop both tasks; circuits see their queues close
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        log::debug!("closing link to {}", self.peer);
        if let Ok(mut circuits) = self.circuits.lock() {
            circuits.clear();
        }
        if let Ok(mut tasks) = self.tasks.lock() {
            for task in tasks.drain(..) {
                task.abort();
            }
        }
    }

    fn dispatch(&self, cell: Cell) {
        let target = self
            .circuits
            .lock()
            .ok()
            .and_then(|circuits| circuits.get(&cell.circuit_id).cloned());
        match target {
            Some(tx) => {
                if tx.send(cell).is_err() {
                    log::trace!("circuit gone, dropping cell");
                }
            }
            None => log::trace!(
                "cell {:?} for unknown circuit {:#x} on link to {}",
                cell.command,
                cell.circuit_id,
                self.peer
            ),
        }
    }
}

impl Drop for Channel {
    fn drop(&mut self) {
        if let Ok(mut tasks) = self.tasks.lock() {
            for task in tasks.drain(..) {
                task.abort();
            }
        }
    }
}

async fn reader_loop<R: AsyncRead + Unpin>(channel: Weak<Channel>, mut reader: R) {
    loop {
        let cell = match read_cell(&mut reader).await {
            Ok(Some(cell)) => cell,
            Ok(None) => break,
            Err(e) => {
                log::debug!("link read failed: {}", e);
                break;
            }
        };
        let Some(channel) = channel.upgrade() else {
            return;
        };
        match cell {
            WireCell::Fixed(cell) => match cell.command {
                CellCommand::Padding => {}
                _ if cell.circuit_id == 0 => {
                    log::trace!("ignoring {:?} on circuit 0", cell.command);
                }
                _ => channel.dispatch(cell),
            },
            WireCell::Variable(var) => log::trace!("ignoring variable cell {}", var.command),
            WireCell::Unknown { command, .. } => log::trace!("ignoring unknown cell {}", command),
        }
    }
    if let Some(channel) = channel.upgrade() {
        channel.close();
    }
}

async fn writer_loop<W: AsyncWrite + Unpin>(
    peer: Fingerprint,
    mut writer: W,
    mut queue: mpsc::UnboundedReceiver<Vec<u8>>,
) {
    while let Some(bytes) = queue.recv().await {
        let mut result = writer.write_all(&bytes).await;
        // Coalesce whatever else is already queued before flushing
        while result.is_ok() {
            match queue.try_recv() {
                Ok(more) => result = writer.write_all(&more).await,
                Err(_) => break,
            }
        }
        let result = match result {
            Ok(()) => writer.flush().await,
            Err(e) => Err(e),
        };
        if let Err(e) = result {
            log::debug!("link write to {} failed: {}", peer, e);
            return;
        }
    }
    let _ = writer.close().await;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_negotiate_version() {
        assert_eq!(negotiate_version(&[4, 5], &[3, 4, 5]).unwrap(), 5);
        assert_eq!(negotiate_version(&[4, 5], &[4]).unwrap(), 4);
        assert!(negotiate_version(&[3, 4, 5], &[1, 2, 3]).is_err());
        assert!(negotiate_version(&[4, 5], &[6]).is_err());
    }

    #[test]
    fn test_parse_versions() {
        assert_eq!(parse_versions(&[0, 3, 0, 4, 0, 5]).unwrap(), vec![3, 4, 5]);
        assert!(parse_versions(&[0, 3, 0]).is_err());
    }

    #[test]
    fn test_netinfo_layout() {
        let payload = netinfo_payload(0x01020304, "10.0.0.1".parse().unwrap(), &[]);
        assert_eq!(payload, vec![1, 2, 3, 4, 0x04, 4, 10, 0, 0, 1, 0]);
    }

    #[tokio::test]
    async fn test_read_cell_framing() {
        let mut bytes = VarCell::new(0x8000_0001, CellCommand::Certs, vec![0])
            .to_bytes(false)
            .unwrap();
        bytes.extend(Cell::destroy(0x8000_0001, 3).to_bytes().unwrap());
        let mut reader = futures::io::Cursor::new(bytes);

        match read_cell(&mut reader).await.unwrap() {
            Some(WireCell::Variable(var)) => assert_eq!(var.command, 129),
            other => panic!("unexpected {:?}", other),
        }
        match read_cell(&mut reader).await.unwrap() {
            Some(WireCell::Fixed(cell)) => {
                assert_eq!(cell.command, CellCommand::Destroy);
                assert_eq!(cell.payload[0], 3);
            }
            other => panic!("unexpected {:?}", other),
        }
        assert!(read_cell(&mut reader).await.unwrap().is_none());
    }
}
