//! Pluggable network layers
//!
//! Everything above the wire talks to a [`NetLayer`]: TCP, TLS, the Tor
//! client itself, and a few test and control wrappers. Layers are looked up
//! in a [`NetLayerRegistry`] keyed by [`NetLayerKind`].

mod address;
pub mod control;
pub mod echo;
pub mod mock;
mod registry;
pub mod tcp;
pub mod tls;
pub mod tor;

pub use address::NetAddress;
pub use registry::NetLayerRegistry;

use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use futures::io::{AsyncRead, AsyncWrite};
use serde::{Deserialize, Serialize};

use crate::error::{Result, TorError};

/// Byte stream returned by every layer
pub trait NetStream: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> NetStream for T {}

pub type BoxedStream = Box<dyn NetStream>;

/// The closed set of layer implementations
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum NetLayerKind {
    Tcp,
    Tls,
    Tor,
    Mock,
    Echo,
    Control,
}

impl fmt::Display for NetLayerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            NetLayerKind::Tcp => "tcp",
            NetLayerKind::Tls => "tls",
            NetLayerKind::Tor => "tor",
            NetLayerKind::Mock => "mock",
            NetLayerKind::Echo => "echo",
            NetLayerKind::Control => "control",
        };
        f.write_str(name)
    }
}

/// Readiness of a layer
///
/// Simple layers are always `Ready`. The Tor layer walks through the
/// bootstrap levels in order and never goes back.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum NetLayerStatus {
    New,
    ConsensusLoading,
    RouterDescriptorsLoading,
    InitialCircuitsEstablishing,
    Ready,
    Closed,
}

impl NetLayerStatus {
    /// Rough bootstrap progress in [0, 1]
    pub fn progress(&self) -> f32 {
        match self {
            NetLayerStatus::New => 0.0,
            NetLayerStatus::ConsensusLoading => 0.1,
            NetLayerStatus::RouterDescriptorsLoading => 0.3,
            NetLayerStatus::InitialCircuitsEstablishing => 0.7,
            NetLayerStatus::Ready | NetLayerStatus::Closed => 1.0,
        }
    }
}

/// Per-connection options
#[derive(Debug, Clone, Default)]
pub struct ConnectProperties {
    /// SNI / certificate name for TLS; defaults to the remote hostname
    pub server_name: Option<String>,
    /// Accept any certificate. Tor relay links authenticate in-band.
    pub relay_link: bool,
    /// Overrides the layer's connect timeout
    pub connect_timeout: Option<Duration>,
}

impl ConnectProperties {
    pub fn relay_link() -> Self {
        Self {
            relay_link: true,
            ..Default::default()
        }
    }
}

/// Accepts inbound streams
#[async_trait]
pub trait NetListener: Send {
    async fn accept(&mut self) -> Result<(BoxedStream, NetAddress)>;

    fn local_address(&self) -> NetAddress;

    async fn close(&mut self) {}
}

/// A transport the rest of the crate can open connections through
#[async_trait]
pub trait NetLayer: Send + Sync {
    fn kind(&self) -> NetLayerKind;

    async fn connect(
        &self,
        properties: &ConnectProperties,
        local: Option<&NetAddress>,
        remote: &NetAddress,
    ) -> Result<BoxedStream>;

    async fn listen(
        &self,
        _properties: &ConnectProperties,
        local: &NetAddress,
    ) -> Result<Box<dyn NetListener>> {
        Err(TorError::Unsupported(format!(
            "{} layer cannot listen on {}",
            self.kind(),
            local
        )))
    }

    fn status(&self) -> NetLayerStatus {
        NetLayerStatus::Ready
    }

    async fn wait_until_ready(&self) -> Result<()> {
        Ok(())
    }

    /// Drop cached state (connections, circuits)
    async fn clear(&self) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_is_ordered() {
        assert!(NetLayerStatus::New < NetLayerStatus::ConsensusLoading);
        assert!(NetLayerStatus::InitialCircuitsEstablishing < NetLayerStatus::Ready);
        assert_eq!(NetLayerStatus::Ready.progress(), 1.0);
    }

    #[test]
    fn test_kind_display() {
        assert_eq!(NetLayerKind::Control.to_string(), "control");
    }
}
