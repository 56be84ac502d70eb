//! # tor-netlib
//!
//! A Tor client library: directory, circuits, streams and hidden services,
//! reachable through a pluggable [`NetLayer`](network::NetLayer).
//!
//! ## Architecture
//!
//! ```text
//! TorContext (config, storage, layer registry)
//!   ↓
//! Tor client / Tor net layer
//!   ↓
//! Circuit pool ── Path selection ── Directory
//!   ↓
//! Connection pool (one TLS link per relay)
//!   ↓
//! TLS / TCP net layers
//! ```
//!
//! ## Example
//!
//! ```no_run
//! use tor_netlib::{NetAddress, TorConfig, TorContext};
//!
//! # async fn run() -> tor_netlib::Result<()> {
//! let context = TorContext::new(TorConfig::default())?;
//! let tor = context.tor()?;
//! tor.wait_until_ready().await?;
//! let mut stream = tor.connect(&NetAddress::new("example.com", 80)).await?;
//! stream.write(b"GET / HTTP/1.0\r\n\r\n").await?;
//! let page = stream.read_to_end().await?;
//! # let _ = page;
//! context.shutdown().await;
//! # Ok(())
//! # }
//! ```

pub mod circuit_pool;
pub mod client;
pub mod config;
pub mod connection_pool;
pub mod context;
pub mod directory;
pub mod error;
pub mod hidden_service;
pub mod network;
pub mod path_selection;
pub mod protocol;
pub mod storage;

#[doc(hidden)]
pub mod testing;

pub use circuit_pool::{CircuitPool, CircuitsStatus};
pub use client::Tor;
pub use config::TorConfig;
pub use connection_pool::{ConnectionPool, ConnectionPoolStats};
pub use context::TorContext;
pub use directory::{Directory, DirectoryIndex};
pub use error::{ErrorCode, ErrorKind, Result, TorError};
pub use hidden_service::{HiddenServiceDescriptor, HiddenServiceHost, OnionAddress, TorNetServerSocket};
pub use network::{
    NetAddress, NetLayer, NetLayerKind, NetLayerRegistry, NetLayerStatus, NetListener, NetStream,
};
pub use path_selection::{PathSelector, TcpStreamProperties};
pub use protocol::TorStream;
pub use storage::{FileStringStorage, MemoryStringStorage, StringStorage};
