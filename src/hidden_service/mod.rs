//! Hidden services
//!
//! Reaching a service:
//! 1. Fetch its descriptor from the HSDirs responsible for the current
//!    descriptor ids, over a BEGIN_DIR stream
//! 2. Set up a rendezvous point (ESTABLISH_RENDEZVOUS)
//! 3. Ask an introduction point to pass the rendezvous details on (INTRODUCE1)
//! 4. Finish the ntor handshake carried back in RENDEZVOUS2 and treat the
//!    service as one more hop beyond the rendezvous point
//!
//! Hosting runs the other side of the same exchange, see [`host`].

pub mod address;
pub mod client;
pub mod descriptor;
pub mod host;
pub mod protocol;
pub mod server_socket;

pub use address::OnionAddress;
pub use client::connect_hidden_service;
pub use descriptor::HiddenServiceDescriptor;
pub use host::HiddenServiceHost;
pub use server_socket::TorNetServerSocket;

use crate::circuit_pool::{CircuitPool, CircuitPurpose};
use crate::config::TorConfig;
use crate::directory::fingerprint::Fingerprint;
use crate::directory::http::{self, HttpResponse};
use crate::error::{Result, TorError};
use crate::path_selection::TcpStreamProperties;
use crate::protocol::cell::{RelayCell, RelayCommand};
use crate::protocol::circuit::Circuit;
use crate::protocol::stream::TorStream;
use std::sync::Arc;

/// Descriptor download path; the base32 descriptor id follows
pub const HS_DESCRIPTOR_PATH: &str = "/tor/rendezvous2/";

/// Descriptor upload path
pub const HS_PUBLISH_PATH: &str = "/tor/rendezvous2/publish";

/// Internal circuit whose last hop is `last`
pub(crate) async fn circuit_ending_at(pool: &CircuitPool, config: &TorConfig, last: Fingerprint) -> Result<Arc<Circuit>> {
    let properties = TcpStreamProperties::internal(config);
    let position = properties.max_route_length.max(1) - 1;
    let properties = properties
        .with_route_length(position + 1, position + 1)
        .pin(position, last);
    pool.build_circuit(&properties, CircuitPurpose::Internal).await
}

/// One HTTP exchange with `hs_dir` through a tunneled directory stream
pub(crate) async fn hs_dir_request(
    pool: &CircuitPool,
    config: &TorConfig,
    hs_dir: Fingerprint,
    method: &str,
    path: &str,
    body: &[u8],
) -> Result<HttpResponse> {
    let circuit = circuit_ending_at(pool, config, hs_dir).await?;
    let exchange = async {
        let mut stream = TorStream::open_dir(
            circuit.clone(),
            config.stream_connect_timeout,
            config.stream_send_timeout,
        )
        .await?;
        let request = http::build_request(method, path, &hs_dir.to_hex(), body);
        stream.write(&request).await?;
        let raw = stream.read_to_end().await?;
        http::parse_response(&raw)
    };
    let result = tokio::time::timeout(config.directory_overall_timeout, exchange)
        .await
        .map_err(|_| TorError::Timeout(format!("{} {} via {}", method, path, hs_dir)))
        .and_then(|r| r);
    circuit.close();
    result
}

/// Send `request` to the last hop and wait for `expected`
///
/// Bounded by the circuit build timeout. The circuit is closed on any
/// other outcome.
pub(crate) async fn control_exchange(
    circuit: &Circuit,
    config: &TorConfig,
    request: RelayCell,
    expected: RelayCommand,
) -> Result<RelayCell> {
    let reply = tokio::time::timeout(
        config.circuit_build_timeout,
        circuit.control_request(request, circuit.last_hop()),
    )
    .await
    .map_err(|_| TorError::Timeout(format!("waiting for {:?}", expected)))
    .and_then(|r| r);
    match reply {
        Ok(reply) if reply.command == expected => Ok(reply),
        Ok(reply) => {
            circuit.close();
            Err(TorError::UnexpectedCell {
                expected: format!("{:?}", expected),
                got: format!("{:?}", reply.command),
            })
        }
        Err(e) => {
            circuit.close();
            Err(e)
        }
    }
}
