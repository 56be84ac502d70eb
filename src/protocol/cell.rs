//! Tor cell protocol
//!
//! Fixed-length cells are 514 bytes: circuit id (4), command (1) and a
//! 509-byte payload. VERSIONS and every command >= 128 are variable
//! length and carry a 2-byte payload length instead.

use crate::error::{Result, TorError};

/// Cell command types
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum CellCommand {
    Padding = 0,
    Create = 1,
    Created = 2,
    Relay = 3,
    Destroy = 4,
    CreateFast = 5,
    CreatedFast = 6,
    Versions = 7,
    Netinfo = 8,
    RelayEarly = 9,
    Create2 = 10,
    Created2 = 11,
    PaddingNegotiate = 12,
    Vpadding = 128,
    Certs = 129,
    AuthChallenge = 130,
    Authenticate = 131,
    Authorize = 132,
}

impl CellCommand {
    /// Parse command from byte
    pub fn from_u8(cmd: u8) -> Option<Self> {
        match cmd {
            0 => Some(CellCommand::Padding),
            1 => Some(CellCommand::Create),
            2 => Some(CellCommand::Created),
            3 => Some(CellCommand::Relay),
            4 => Some(CellCommand::Destroy),
            5 => Some(CellCommand::CreateFast),
            6 => Some(CellCommand::CreatedFast),
            7 => Some(CellCommand::Versions),
            8 => Some(CellCommand::Netinfo),
            9 => Some(CellCommand::RelayEarly),
            10 => Some(CellCommand::Create2),
            11 => Some(CellCommand::Created2),
            12 => Some(CellCommand::PaddingNegotiate),
            128 => Some(CellCommand::Vpadding),
            129 => Some(CellCommand::Certs),
            130 => Some(CellCommand::AuthChallenge),
            131 => Some(CellCommand::Authenticate),
            132 => Some(CellCommand::Authorize),
            _ => None,
        }
    }

    /// Whether cells with this command byte use the variable-length format
    pub fn is_variable_length(cmd: u8) -> bool {
        cmd == CellCommand::Versions as u8 || cmd >= 128
    }
}

/// Fixed-length cell
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Cell {
    /// Circuit ID (4 bytes for v4+ protocol)
    pub circuit_id: u32,
    pub command: CellCommand,
    /// Up to 509 bytes, zero-padded on the wire
    pub payload: Vec<u8>,
}

impl Cell {
    /// Cell size (514 bytes total: 4 circuit_id + 1 command + 509 payload)
    pub const SIZE: usize = 514;

    /// Payload size for fixed-length cells
    pub const PAYLOAD_SIZE: usize = 509;

    pub fn new(circuit_id: u32, command: CellCommand, payload: Vec<u8>) -> Self {
        Self {
            circuit_id,
            command,
            payload,
        }
    }

    pub fn relay(circuit_id: u32, relay_payload: Vec<u8>) -> Self {
        Self::new(circuit_id, CellCommand::Relay, relay_payload)
    }

    pub fn destroy(circuit_id: u32, reason: u8) -> Self {
        Self::new(circuit_id, CellCommand::Destroy, vec![reason])
    }

    /// Serialize cell to bytes
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        if self.payload.len() > Self::PAYLOAD_SIZE {
            return Err(TorError::Internal(format!(
                "cell payload of {} bytes exceeds {}",
                self.payload.len(),
                Self::PAYLOAD_SIZE
            )));
        }
        if CellCommand::is_variable_length(self.command as u8) {
            return Err(TorError::Internal(format!(
                "{:?} is a variable-length command",
                self.command
            )));
        }

        let mut buf = Vec::with_capacity(Self::SIZE);
        buf.extend_from_slice(&self.circuit_id.to_be_bytes());
        buf.push(self.command as u8);
        buf.extend_from_slice(&self.payload);
        buf.resize(Self::SIZE, 0);
        Ok(buf)
    }

    /// Parse cell from bytes
    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        if data.len() < Self::SIZE {
            return Err(TorError::ProtocolError("Cell too short".into()));
        }

        let circuit_id = u32::from_be_bytes([data[0], data[1], data[2], data[3]]);
        let command = CellCommand::from_u8(data[4])
            .ok_or_else(|| TorError::ProtocolError(format!("Unknown command: {}", data[4])))?;
        let payload = data[5..Self::SIZE].to_vec();

        Ok(Self {
            circuit_id,
            command,
            payload,
        })
    }
}

/// Variable-length cell (VERSIONS, CERTS, AUTH_CHALLENGE, VPADDING, ...)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VarCell {
    pub circuit_id: u32,
    pub command: u8,
    pub payload: Vec<u8>,
}

impl VarCell {
    pub fn new(circuit_id: u32, command: CellCommand, payload: Vec<u8>) -> Self {
        Self {
            circuit_id,
            command: command as u8,
            payload,
        }
    }

    /// Serialize with a 4-byte circuit id, or 2 bytes when `short_circ_id`
    /// (only before link version 4 is negotiated)
    pub fn to_bytes(&self, short_circ_id: bool) -> Result<Vec<u8>> {
        let len = u16::try_from(self.payload.len())
            .map_err(|_| TorError::Internal("variable cell payload too long".into()))?;
        let mut buf = Vec::with_capacity(self.payload.len() + 7);
        if short_circ_id {
            buf.extend_from_slice(&(self.circuit_id as u16).to_be_bytes());
        } else {
            buf.extend_from_slice(&self.circuit_id.to_be_bytes());
        }
        buf.push(self.command);
        buf.extend_from_slice(&len.to_be_bytes());
        buf.extend_from_slice(&self.payload);
        Ok(buf)
    }
}

/// Relay command types
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum RelayCommand {
    Begin = 1,
    Data = 2,
    End = 3,
    Connected = 4,
    Sendme = 5,
    Extend = 6,
    Extended = 7,
    Truncate = 8,
    Truncated = 9,
    Drop = 10,
    Resolve = 11,
    Resolved = 12,
    BeginDir = 13,
    Extend2 = 14,
    Extended2 = 15,
    EstablishIntro = 32,
    EstablishRendezvous = 33,
    Introduce1 = 34,
    Introduce2 = 35,
    Rendezvous1 = 36,
    Rendezvous2 = 37,
    IntroEstablished = 38,
    RendezvousEstablished = 39,
    IntroduceAck = 40,
}

impl RelayCommand {
    /// Parse relay command from byte
    pub fn from_u8(cmd: u8) -> Option<Self> {
        match cmd {
            1 => Some(RelayCommand::Begin),
            2 => Some(RelayCommand::Data),
            3 => Some(RelayCommand::End),
            4 => Some(RelayCommand::Connected),
            5 => Some(RelayCommand::Sendme),
            6 => Some(RelayCommand::Extend),
            7 => Some(RelayCommand::Extended),
            8 => Some(RelayCommand::Truncate),
            9 => Some(RelayCommand::Truncated),
            10 => Some(RelayCommand::Drop),
            11 => Some(RelayCommand::Resolve),
            12 => Some(RelayCommand::Resolved),
            13 => Some(RelayCommand::BeginDir),
            14 => Some(RelayCommand::Extend2),
            15 => Some(RelayCommand::Extended2),
            32 => Some(RelayCommand::EstablishIntro),
            33 => Some(RelayCommand::EstablishRendezvous),
            34 => Some(RelayCommand::Introduce1),
            35 => Some(RelayCommand::Introduce2),
            36 => Some(RelayCommand::Rendezvous1),
            37 => Some(RelayCommand::Rendezvous2),
            38 => Some(RelayCommand::IntroEstablished),
            39 => Some(RelayCommand::RendezvousEstablished),
            40 => Some(RelayCommand::IntroduceAck),
            _ => None,
        }
    }

    /// Commands addressed to a stream rather than the circuit
    pub fn is_stream_command(&self) -> bool {
        matches!(
            self,
            RelayCommand::Begin
                | RelayCommand::Data
                | RelayCommand::End
                | RelayCommand::Connected
                | RelayCommand::Resolve
                | RelayCommand::Resolved
                | RelayCommand::BeginDir
        )
    }
}

/// Relay cell (payload within a RELAY or RELAY_EARLY cell)
///
/// Layout: command (1), recognized (2), stream id (2), digest (4),
/// length (2), data (up to 498), zero padding to 509.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelayCell {
    pub command: RelayCommand,
    /// Zero in every cell addressed to us
    pub recognized: u16,
    pub stream_id: u16,
    pub digest: [u8; 4],
    pub data: Vec<u8>,
}

impl RelayCell {
    /// Maximum data size in relay cell
    pub const MAX_DATA_SIZE: usize = 498;

    /// Offset of the 4-byte digest within the relay payload
    pub const DIGEST_OFFSET: usize = 5;

    pub const HEADER_SIZE: usize = 11;

    pub fn new(command: RelayCommand, stream_id: u16, data: Vec<u8>) -> Self {
        Self {
            command,
            recognized: 0,
            stream_id,
            digest: [0; 4],
            data,
        }
    }

    /// Serialize relay cell to bytes (for inclusion in Cell payload)
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        if self.data.len() > Self::MAX_DATA_SIZE {
            return Err(TorError::Internal(format!(
                "relay data of {} bytes exceeds {}",
                self.data.len(),
                Self::MAX_DATA_SIZE
            )));
        }

        let mut buf = Vec::with_capacity(Cell::PAYLOAD_SIZE);
        buf.push(self.command as u8);
        buf.extend_from_slice(&self.recognized.to_be_bytes());
        buf.extend_from_slice(&self.stream_id.to_be_bytes());
        buf.extend_from_slice(&self.digest);
        buf.extend_from_slice(&(self.data.len() as u16).to_be_bytes());
        buf.extend_from_slice(&self.data);
        buf.resize(Cell::PAYLOAD_SIZE, 0);
        Ok(buf)
    }

    /// Parse relay cell from bytes
    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        if data.len() < Self::HEADER_SIZE {
            return Err(TorError::ProtocolError("Relay cell too short".into()));
        }

        let command = RelayCommand::from_u8(data[0]).ok_or_else(|| {
            TorError::ProtocolError(format!("Unknown relay command: {}", data[0]))
        })?;

        let recognized = u16::from_be_bytes([data[1], data[2]]);
        let stream_id = u16::from_be_bytes([data[3], data[4]]);
        let digest = [data[5], data[6], data[7], data[8]];
        let length = u16::from_be_bytes([data[9], data[10]]) as usize;

        if length > Self::MAX_DATA_SIZE || Self::HEADER_SIZE + length > data.len() {
            return Err(TorError::ProtocolError("Relay cell data truncated".into()));
        }

        Ok(Self {
            command,
            recognized,
            stream_id,
            digest,
            data: data[Self::HEADER_SIZE..Self::HEADER_SIZE + length].to_vec(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cell_serialization() {
        let cell = Cell::new(0x8000_3039, CellCommand::Create2, vec![1, 2, 3, 4]);
        let bytes = cell.to_bytes().unwrap();
        assert_eq!(bytes.len(), Cell::SIZE);

        let parsed = Cell::from_bytes(&bytes).unwrap();
        assert_eq!(parsed.circuit_id, 0x8000_3039);
        assert_eq!(parsed.command, CellCommand::Create2);
        assert_eq!(&parsed.payload[..4], &[1, 2, 3, 4]);
        assert!(parsed.payload[4..].iter().all(|b| *b == 0));
    }

    #[test]
    fn test_oversized_payload_rejected() {
        let cell = Cell::new(1, CellCommand::Relay, vec![0; Cell::PAYLOAD_SIZE + 1]);
        assert!(cell.to_bytes().is_err());
        let relay = RelayCell::new(RelayCommand::Data, 1, vec![0; RelayCell::MAX_DATA_SIZE + 1]);
        assert!(relay.to_bytes().is_err());
    }

    #[test]
    fn test_unknown_command_rejected() {
        let mut bytes = Cell::destroy(7, 1).to_bytes().unwrap();
        bytes[4] = 77;
        assert!(Cell::from_bytes(&bytes).is_err());
        assert!(Cell::from_bytes(&bytes[..100]).is_err());
    }

    #[test]
    fn test_var_cell_layout() {
        let versions = VarCell::new(0, CellCommand::Versions, vec![0, 4, 0, 5]);
        assert_eq!(versions.to_bytes(true).unwrap(), vec![0, 0, 7, 0, 4, 0, 4, 0, 5]);
        assert_eq!(versions.to_bytes(false).unwrap().len(), 4 + 1 + 2 + 4);
        assert!(CellCommand::is_variable_length(7));
        assert!(CellCommand::is_variable_length(129));
        assert!(!CellCommand::is_variable_length(3));
    }

    #[test]
    fn test_relay_cell_serialization() {
        for command in [RelayCommand::Begin, RelayCommand::Introduce1, RelayCommand::Sendme] {
            let relay = RelayCell::new(command, 100, vec![5, 6, 7]);
            let bytes = relay.to_bytes().unwrap();
            assert_eq!(bytes.len(), Cell::PAYLOAD_SIZE);

            let parsed = RelayCell::from_bytes(&bytes).unwrap();
            assert_eq!(parsed, relay);
        }
    }

    #[test]
    fn test_relay_cell_full_data() {
        let relay = RelayCell::new(RelayCommand::Data, 9, vec![0xAB; RelayCell::MAX_DATA_SIZE]);
        let bytes = relay.to_bytes().unwrap();
        assert_eq!(bytes.len(), Cell::PAYLOAD_SIZE);
        assert_eq!(RelayCell::from_bytes(&bytes).unwrap().data.len(), RelayCell::MAX_DATA_SIZE);
    }

    #[test]
    fn test_relay_length_bounds() {
        let mut bytes = RelayCell::new(RelayCommand::Data, 1, vec![1]).to_bytes().unwrap();
        bytes[9] = 0x02;
        bytes[10] = 0x00; // 512 > 498
        assert!(RelayCell::from_bytes(&bytes).is_err());
    }
}
