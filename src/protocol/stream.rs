//! Tor streams
//!
//! Opens streams through established circuits. Each DATA cell sent takes
//! one credit from the stream window (500 cells, +50 per SENDME) and one
//! from the circuit window (1000, +100). Receive-side SENDMEs are sent as
//! the reader consumes DATA, so a stalled reader stalls the sender.

use std::collections::VecDeque;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncReadExt as _, AsyncWriteExt as _};
use tokio::sync::mpsc;
use tokio_util::compat::TokioAsyncReadCompatExt;

use super::cell::{RelayCell, RelayCommand};
use super::circuit::{Circuit, IncomingStream, StreamSlot};
use super::flow_control::SendWindow;
use crate::error::{Result, TorError};
use crate::network::{BoxedStream, NetAddress};

/// RELAY_END reason for an orderly close
pub const END_REASON_DONE: u8 = 6;

/// Buffer between a stream pump and its socket-like half
const PUMP_BUFFER: usize = 64 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamState {
    Opening,
    Established,
    Closed,
}

/// A byte stream on a circuit
pub struct TorStream {
    circuit: Arc<Circuit>,
    stream_id: u16,
    hop: usize,
    inbound: mpsc::UnboundedReceiver<RelayCell>,
    send_window: Arc<SendWindow>,
    send_timeout: Duration,
    buffer: VecDeque<u8>,
    state: StreamState,
}

impl std::fmt::Debug for TorStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TorStream")
            .field("circuit", &format_args!("{:#010x}", self.circuit.id()))
            .field("stream_id", &self.stream_id)
            .field("state", &self.state)
            .finish()
    }
}

impl TorStream {
    fn new(circuit: Arc<Circuit>, hop: usize, slot: StreamSlot, send_timeout: Duration) -> Self {
        Self {
            circuit,
            stream_id: slot.stream_id,
            hop,
            inbound: slot.inbound,
            send_window: slot.send_window,
            send_timeout,
            buffer: VecDeque::new(),
            state: StreamState::Opening,
        }
    }

    /// Open a stream to `target` from the circuit's last hop
    ///
    /// Waits up to `connect_timeout` for CONNECTED; END becomes
    /// [`TorError::StreamRefused`].
    pub async fn open(
        circuit: Arc<Circuit>,
        target: &NetAddress,
        connect_timeout: Duration,
        send_timeout: Duration,
    ) -> Result<TorStream> {
        let mut data = target.to_begin_target().into_bytes();
        data.push(0);
        Self::begin(circuit, RelayCommand::Begin, data, connect_timeout, send_timeout).await
    }

    /// Open a tunneled directory connection to the circuit's last hop
    pub async fn open_dir(
        circuit: Arc<Circuit>,
        connect_timeout: Duration,
        send_timeout: Duration,
    ) -> Result<TorStream> {
        Self::begin(circuit, RelayCommand::BeginDir, Vec::new(), connect_timeout, send_timeout).await
    }

    async fn begin(
        circuit: Arc<Circuit>,
        command: RelayCommand,
        data: Vec<u8>,
        connect_timeout: Duration,
        send_timeout: Duration,
    ) -> Result<TorStream> {
        let slot = circuit.register_stream()?;
        let hop = circuit.last_hop();
        let mut stream = TorStream::new(circuit, hop, slot, send_timeout);
        stream
            .circuit
            .send_relay_cell(&RelayCell::new(command, stream.stream_id, data), hop, false)?;
        log::debug!(
            "circuit {:#010x}: {:?} on stream {}",
            stream.circuit.id(),
            command,
            stream.stream_id
        );

        let reply = tokio::time::timeout(connect_timeout, stream.inbound.recv())
            .await
            .map_err(|_| {
                TorError::Timeout(format!(
                    "no answer to {:?} within {:?}",
                    command, connect_timeout
                ))
            })?;
        match reply {
            Some(cell) if cell.command == RelayCommand::Connected => {
                stream.state = StreamState::Established;
                Ok(stream)
            }
            Some(cell) if cell.command == RelayCommand::End => {
                stream.state = StreamState::Closed;
                Err(TorError::stream_refused(cell.data.first().copied().unwrap_or(0)))
            }
            Some(cell) => Err(TorError::UnexpectedCell {
                expected: "CONNECTED".into(),
                got: format!("{:?}", cell.command),
            }),
            None => {
                stream.state = StreamState::Closed;
                Err(TorError::CircuitClosed(format!(
                    "circuit {:#010x} closed while opening stream",
                    stream.circuit.id()
                )))
            }
        }
    }

    /// Answer an inbound BEGIN with CONNECTED
    pub fn accept(incoming: IncomingStream, send_timeout: Duration) -> Result<TorStream> {
        let IncomingStream {
            circuit, hop, slot, ..
        } = incoming;
        let mut stream = TorStream::new(circuit, hop, slot, send_timeout);
        stream.circuit.send_relay_cell(
            &RelayCell::new(RelayCommand::Connected, stream.stream_id, Vec::new()),
            hop,
            false,
        )?;
        stream.state = StreamState::Established;
        Ok(stream)
    }

    pub fn stream_id(&self) -> u16 {
        self.stream_id
    }

    pub fn circuit(&self) -> &Arc<Circuit> {
        &self.circuit
    }

    pub fn state(&self) -> StreamState {
        self.state
    }

    pub fn is_closed(&self) -> bool {
        self.state == StreamState::Closed
    }

    /// Send `data` as DATA cells, waiting for window credit as needed
    pub async fn write(&mut self, data: &[u8]) -> Result<()> {
        if self.state != StreamState::Established {
            return Err(TorError::Stream(format!("stream {} is not open", self.stream_id)));
        }
        for chunk in data.chunks(RelayCell::MAX_DATA_SIZE) {
            self.acquire_credit().await?;
            let cell = RelayCell::new(RelayCommand::Data, self.stream_id, chunk.to_vec());
            self.circuit.send_relay_cell(&cell, self.hop, false)?;
        }
        Ok(())
    }

    async fn acquire_credit(&self) -> Result<()> {
        let credit = self.send_window.acquire_with(self.circuit.send_window());
        tokio::time::timeout(self.send_timeout, credit)
            .await
            .map_err(|_| {
                TorError::ResourceExhausted(format!(
                    "stream {}: no SENDME within {:?}",
                    self.stream_id, self.send_timeout
                ))
            })?
    }

    /// Next chunk of received data; `None` once the peer ended the stream
    pub async fn next_data(&mut self) -> Result<Option<Vec<u8>>> {
        if !self.buffer.is_empty() {
            return Ok(Some(self.buffer.drain(..).collect()));
        }
        loop {
            match self.inbound.recv().await {
                Some(cell) => match cell.command {
                    RelayCommand::Data => {
                        if let Err(e) = self.circuit.data_consumed(self.stream_id, self.hop) {
                            log::debug!("stream {}: SENDME not sent: {}", self.stream_id, e);
                        }
                        return Ok(Some(cell.data));
                    }
                    RelayCommand::End => {
                        log::debug!(
                            "stream {} ended by peer (reason {})",
                            self.stream_id,
                            cell.data.first().copied().unwrap_or(0)
                        );
                        self.state = StreamState::Closed;
                        return Ok(None);
                    }
                    other => log::debug!("stream {}: ignoring {:?}", self.stream_id, other),
                },
                None if self.state == StreamState::Closed => return Ok(None),
                None => {
                    self.state = StreamState::Closed;
                    return Err(TorError::CircuitClosed(format!(
                        "circuit {:#010x} closed under stream {}",
                        self.circuit.id(),
                        self.stream_id
                    )));
                }
            }
        }
    }

    /// Read into `buf`; `Ok(0)` at end of stream
    pub async fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        if self.buffer.is_empty() {
            match self.next_data().await? {
                Some(data) => self.buffer.extend(data),
                None => return Ok(0),
            }
        }
        let n = buf.len().min(self.buffer.len());
        for (dst, src) in buf.iter_mut().zip(self.buffer.drain(..n)) {
            *dst = src;
        }
        Ok(n)
    }

    /// Read until the peer ends the stream
    pub async fn read_to_end(&mut self) -> Result<Vec<u8>> {
        let mut out = Vec::new();
        while let Some(data) = self.next_data().await? {
            out.extend_from_slice(&data);
        }
        Ok(out)
    }

    /// Send END and detach from the circuit
    pub async fn close(&mut self) -> Result<()> {
        self.finish()
    }

    fn finish(&mut self) -> Result<()> {
        let result = if self.state != StreamState::Closed && !self.circuit.is_closed() {
            let end = RelayCell::new(RelayCommand::End, self.stream_id, vec![END_REASON_DONE]);
            self.circuit.send_relay_cell(&end, self.hop, false)
        } else {
            Ok(())
        };
        self.state = StreamState::Closed;
        self.circuit.remove_stream(self.stream_id);

        // Unread DATA still holds circuit window
        let mut unread = 0;
        while let Ok(cell) = self.inbound.try_recv() {
            if cell.command == RelayCommand::Data {
                unread += 1;
            }
        }
        if unread > 0 {
            if let Err(e) = self.circuit.discard_data(unread, self.hop) {
                log::debug!("stream {}: {}", self.stream_id, e);
            }
        }
        result
    }

    /// Hand the stream to a pump task and return a socket-like handle
    pub fn into_net_stream(self) -> BoxedStream {
        let (local, remote) = tokio::io::duplex(PUMP_BUFFER);
        tokio::spawn(pump(self, remote));
        Box::new(local.compat())
    }
}

impl Drop for TorStream {
    fn drop(&mut self) {
        let _ = self.finish();
    }
}

async fn pump(mut stream: TorStream, io: tokio::io::DuplexStream) {
    let (mut reader, mut writer) = tokio::io::split(io);
    let mut buf = vec![0u8; RelayCell::MAX_DATA_SIZE * 8];
    let mut remote_open = true;
    loop {
        tokio::select! {
            data = stream.next_data(), if remote_open => match data {
                Ok(Some(data)) => {
                    if writer.write_all(&data).await.is_err() {
                        break;
                    }
                }
                Ok(None) => {
                    remote_open = false;
                    let _ = writer.shutdown().await;
                }
                Err(e) => {
                    log::debug!("stream {}: {}", stream.stream_id, e);
                    remote_open = false;
                    let _ = writer.shutdown().await;
                }
            },
            n = reader.read(&mut buf) => match n {
                Ok(0) | Err(_) => break,
                Ok(n) => {
                    if let Err(e) = stream.write(&buf[..n]).await {
                        log::debug!("stream {}: {}", stream.stream_id, e);
                        break;
                    }
                }
            },
        }
    }
    let _ = stream.close().await;
}

/// One answer of a RELAY_RESOLVED cell
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResolvedAnswer {
    Address { address: IpAddr, ttl: u32 },
    Hostname { hostname: String, ttl: u32 },
    TransientError,
    Error,
}

const ANSWER_HOSTNAME: u8 = 0x00;
const ANSWER_IPV4: u8 = 0x04;
const ANSWER_IPV6: u8 = 0x06;
const ANSWER_TRANSIENT_ERROR: u8 = 0xF0;
const ANSWER_ERROR: u8 = 0xF1;

/// Parse the body of RELAY_RESOLVED: repeated TYPE | LEN | VALUE | TTL
pub fn parse_resolved(data: &[u8]) -> Result<Vec<ResolvedAnswer>> {
    let mut answers = Vec::new();
    let mut pos = 0;
    while pos + 2 <= data.len() {
        let kind = data[pos];
        let len = data[pos + 1] as usize;
        let value = data
            .get(pos + 2..pos + 2 + len)
            .ok_or_else(|| TorError::ProtocolError("RESOLVED answer truncated".into()))?;
        let ttl = data
            .get(pos + 2 + len..pos + 6 + len)
            .map(|t| u32::from_be_bytes([t[0], t[1], t[2], t[3]]))
            .unwrap_or(0);
        pos += 6 + len;

        let answer = match (kind, len) {
            (ANSWER_IPV4, 4) => ResolvedAnswer::Address {
                address: IpAddr::from([value[0], value[1], value[2], value[3]]),
                ttl,
            },
            (ANSWER_IPV6, 16) => {
                let mut octets = [0u8; 16];
                octets.copy_from_slice(value);
                ResolvedAnswer::Address {
                    address: IpAddr::from(octets),
                    ttl,
                }
            }
            (ANSWER_HOSTNAME, _) => ResolvedAnswer::Hostname {
                hostname: String::from_utf8_lossy(value).into_owned(),
                ttl,
            },
            (ANSWER_TRANSIENT_ERROR, _) => ResolvedAnswer::TransientError,
            (ANSWER_ERROR, _) => ResolvedAnswer::Error,
            (other, _) => {
                log::debug!("skipping RESOLVED answer of type {:#04x}", other);
                continue;
            }
        };
        answers.push(answer);
    }
    Ok(answers)
}

/// Encode answers the way an exit does; used by relay simulations
pub fn encode_resolved(answers: &[ResolvedAnswer]) -> Vec<u8> {
    let mut out = Vec::new();
    for answer in answers {
        let (kind, value, ttl) = match answer {
            ResolvedAnswer::Address {
                address: IpAddr::V4(v4),
                ttl,
            } => (ANSWER_IPV4, v4.octets().to_vec(), *ttl),
            ResolvedAnswer::Address {
                address: IpAddr::V6(v6),
                ttl,
            } => (ANSWER_IPV6, v6.octets().to_vec(), *ttl),
            ResolvedAnswer::Hostname { hostname, ttl } => {
                (ANSWER_HOSTNAME, hostname.as_bytes().to_vec(), *ttl)
            }
            ResolvedAnswer::TransientError => (ANSWER_TRANSIENT_ERROR, Vec::new(), 0),
            ResolvedAnswer::Error => (ANSWER_ERROR, Vec::new(), 0),
        };
        out.push(kind);
        out.push(value.len() as u8);
        out.extend_from_slice(&value);
        out.extend_from_slice(&ttl.to_be_bytes());
    }
    out
}

/// Name to ask for in a reverse lookup of `address`
pub fn reverse_query(address: IpAddr) -> String {
    match address {
        IpAddr::V4(v4) => {
            let o = v4.octets();
            format!("{}.{}.{}.{}.in-addr.arpa", o[3], o[2], o[1], o[0])
        }
        IpAddr::V6(v6) => {
            let mut name = String::with_capacity(72);
            for byte in v6.octets().iter().rev() {
                name.push_str(&format!("{:x}.{:x}.", byte & 0x0f, byte >> 4));
            }
            name.push_str("ip6.arpa");
            name
        }
    }
}

/// Ask the circuit's exit to resolve `query`
///
/// Uses a transient stream that never carries data: RESOLVE out,
/// one RESOLVED (or END) back.
pub async fn resolve(
    circuit: Arc<Circuit>,
    query: &str,
    timeout: Duration,
) -> Result<Vec<ResolvedAnswer>> {
    let slot = circuit.register_stream()?;
    let hop = circuit.last_hop();
    let mut stream = TorStream::new(circuit, hop, slot, timeout);
    let mut data = query.as_bytes().to_vec();
    data.push(0);
    stream.circuit.send_relay_cell(
        &RelayCell::new(RelayCommand::Resolve, stream.stream_id, data),
        hop,
        false,
    )?;

    let reply = tokio::time::timeout(timeout, stream.inbound.recv())
        .await
        .map_err(|_| TorError::Timeout(format!("resolving {} took longer than {:?}", query, timeout)))?;
    // Resolve streams end without END
    stream.state = StreamState::Closed;
    match reply {
        Some(cell) if cell.command == RelayCommand::Resolved => parse_resolved(&cell.data),
        Some(cell) if cell.command == RelayCommand::End => Err(TorError::stream_refused(
            cell.data.first().copied().unwrap_or(0),
        )),
        Some(cell) => Err(TorError::UnexpectedCell {
            expected: "RESOLVED".into(),
            got: format!("{:?}", cell.command),
        }),
        None => Err(TorError::CircuitClosed("circuit closed while resolving".into())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{Ipv4Addr, Ipv6Addr};

    #[test]
    fn test_reverse_query_v4() {
        let query = reverse_query(IpAddr::V4(Ipv4Addr::new(192, 0, 2, 10)));
        assert_eq!(query, "10.2.0.192.in-addr.arpa");
    }

    #[test]
    fn test_reverse_query_v6() {
        let query = reverse_query(IpAddr::V6(Ipv6Addr::LOCALHOST));
        assert!(query.starts_with("1.0.0.0."));
        assert!(query.ends_with(".ip6.arpa"));
        assert_eq!(query.matches('.').count(), 33);
    }

    #[test]
    fn test_parse_resolved_answers() {
        let answers = vec![
            ResolvedAnswer::Address {
                address: IpAddr::V4(Ipv4Addr::new(93, 184, 216, 34)),
                ttl: 300,
            },
            ResolvedAnswer::Address {
                address: "2001:db8::1".parse().unwrap(),
                ttl: 60,
            },
            ResolvedAnswer::Hostname {
                hostname: "example.com".into(),
                ttl: 10,
            },
            ResolvedAnswer::TransientError,
        ];
        assert_eq!(parse_resolved(&encode_resolved(&answers)).unwrap(), answers);
    }

    #[test]
    fn test_parse_resolved_skips_unknown_types() {
        let mut data = vec![0x42, 2, 0xaa, 0xbb, 0, 0, 0, 1];
        data.extend(encode_resolved(&[ResolvedAnswer::Error]));
        assert_eq!(parse_resolved(&data).unwrap(), vec![ResolvedAnswer::Error]);
    }

    #[test]
    fn test_parse_resolved_truncated() {
        assert!(parse_resolved(&[ANSWER_IPV4, 4, 1, 2]).is_err());
    }
}
