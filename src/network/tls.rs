//! TLS layer using rustls
//!
//! Real TLS implementation using rustls with the ring crypto provider.
//! Ordinary hosts are verified against the webpki root store. Tor relay
//! links use a permissive certificate verifier because relays present
//! self-signed certificates; their identity is proven by the CERTS cell and
//! the ntor handshake instead.

use futures::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::{ClientConfig, ClientConnection, DigitallySignedStruct, RootCertStore, SignatureScheme};
use rustls_pki_types::{CertificateDer, ServerName, UnixTime};
use std::io::{self, Read, Write};
use std::io::Result as IoResult;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Instant;

use async_trait::async_trait;

use super::{BoxedStream, ConnectProperties, NetAddress, NetLayer, NetLayerKind};
use crate::error::{Result, TorError};

/// Buffer size for TLS records (max TLS record = 16KB)
const TLS_BUFFER_SIZE: usize = 16384;

/// SNI sent to relays whose address is not a DNS name
const RELAY_FALLBACK_SNI: &str = "www.example.com";

// ---------------------------------------------------------------------------
// Permissive certificate verifier (Tor relays use self-signed certs)
// ---------------------------------------------------------------------------

/// Certificate verifier that accepts all certificates.
#[derive(Debug)]
struct TorRelayVerifier;

impl ServerCertVerifier for TorRelayVerifier {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> std::result::Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        rustls::crypto::ring::default_provider()
            .signature_verification_algorithms
            .supported_schemes()
    }
}

fn tls_error(context: &str, e: impl std::fmt::Display) -> io::Error {
    io::Error::new(io::ErrorKind::Other, format!("{}: {}", context, e))
}

// ---------------------------------------------------------------------------
// TlsStream: TLS over any layer's stream
// ---------------------------------------------------------------------------

/// TLS-wrapped stream
///
/// The handshake is done in `wrap()` before returning the stream.
pub struct TlsStream {
    inner: BoxedStream,

    /// Rustls client connection state machine
    tls: ClientConnection,

    /// Decrypted plaintext waiting to be read by the caller
    plaintext_buf: Vec<u8>,

    /// Encrypted data from the network, waiting for rustls to process
    incoming_tls: Vec<u8>,

    /// Encrypted data from rustls, waiting to be written to the network
    outgoing_tls: Vec<u8>,

    bytes_read: u64,
    bytes_written: u64,
    connected_at: Instant,
}

impl TlsStream {
    /// Run the TLS handshake over `stream`
    pub async fn wrap(
        mut stream: BoxedStream,
        config: Arc<ClientConfig>,
        server_name: ServerName<'static>,
    ) -> IoResult<Self> {
        let mut tls = ClientConnection::new(config, server_name)
            .map_err(|e| tls_error("TLS init failed", e))?;

        // Drive the TLS handshake to completion
        loop {
            // 1. Flush any pending outgoing TLS records (ClientHello, etc.)
            let mut tls_output = Vec::new();
            tls.write_tls(&mut tls_output)
                .map_err(|e| tls_error("TLS write_tls", e))?;

            if !tls_output.is_empty() {
                log::trace!("TLS handshake: sending {} bytes", tls_output.len());
                stream.write_all(&tls_output).await?;
                stream.flush().await?;
            }

            // 2. Check if handshake is done
            if !tls.is_handshaking() {
                break;
            }

            // 3. Read response from peer (ServerHello, etc.)
            if tls.wants_read() {
                let mut buf = [0u8; 4096];
                let n = stream.read(&mut buf).await?;
                if n == 0 {
                    return Err(io::Error::new(
                        io::ErrorKind::ConnectionReset,
                        "Connection closed during TLS handshake",
                    ));
                }

                tls.read_tls(&mut &buf[..n])
                    .map_err(|e| tls_error("TLS read_tls", e))?;

                tls.process_new_packets()
                    .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, format!("TLS process: {}", e)))?;
            }
        }

        log::debug!("TLS handshake complete (protocol: {:?})", tls.protocol_version());

        Ok(Self {
            inner: stream,
            tls,
            plaintext_buf: Vec::with_capacity(TLS_BUFFER_SIZE),
            incoming_tls: Vec::with_capacity(TLS_BUFFER_SIZE),
            outgoing_tls: Vec::new(),
            bytes_read: 0,
            bytes_written: 0,
            connected_at: Instant::now(),
        })
    }

    pub fn bytes_read(&self) -> u64 {
        self.bytes_read
    }

    pub fn bytes_written(&self) -> u64 {
        self.bytes_written
    }

    pub fn connection_age(&self) -> std::time::Duration {
        self.connected_at.elapsed()
    }

    /// Try to process any buffered incoming TLS data and extract plaintext
    fn process_incoming(&mut self) -> IoResult<()> {
        if self.incoming_tls.is_empty() {
            return Ok(());
        }

        let consumed = self
            .tls
            .read_tls(&mut &self.incoming_tls[..])
            .map_err(|e| tls_error("TLS read_tls", e))?;

        if consumed > 0 {
            self.incoming_tls.drain(..consumed);
        }

        let state = self
            .tls
            .process_new_packets()
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, format!("TLS process: {}", e)))?;

        if state.plaintext_bytes_to_read() > 0 {
            let mut plaintext = vec![0u8; state.plaintext_bytes_to_read()];
            self.tls
                .reader()
                .read_exact(&mut plaintext)
                .map_err(|e| tls_error("TLS reader", e))?;
            self.plaintext_buf.extend_from_slice(&plaintext);
        }

        Ok(())
    }

    /// Extract encrypted TLS data from rustls into outgoing_tls buffer
    fn extract_outgoing(&mut self) -> IoResult<()> {
        if self.tls.wants_write() {
            self.tls
                .write_tls(&mut self.outgoing_tls)
                .map_err(|e| tls_error("TLS write_tls", e))?;
        }
        Ok(())
    }

    fn take_plaintext(&mut self, buf: &mut [u8]) -> usize {
        let n = std::cmp::min(buf.len(), self.plaintext_buf.len());
        buf[..n].copy_from_slice(&self.plaintext_buf[..n]);
        self.plaintext_buf.drain(..n);
        self.bytes_read += n as u64;
        n
    }

    fn poll_drain_outgoing(&mut self, cx: &mut Context<'_>) -> Poll<IoResult<()>> {
        while !self.outgoing_tls.is_empty() {
            match Pin::new(&mut self.inner).poll_write(cx, &self.outgoing_tls) {
                Poll::Ready(Ok(0)) => {
                    return Poll::Ready(Err(io::ErrorKind::WriteZero.into()));
                }
                Poll::Ready(Ok(n)) => {
                    self.outgoing_tls.drain(..n);
                }
                Poll::Ready(Err(e)) => return Poll::Ready(Err(e)),
                Poll::Pending => return Poll::Pending,
            }
        }
        Poll::Ready(Ok(()))
    }
}

impl AsyncRead for TlsStream {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut [u8],
    ) -> Poll<IoResult<usize>> {
        let this = &mut *self;

        if !this.plaintext_buf.is_empty() {
            return Poll::Ready(Ok(this.take_plaintext(buf)));
        }

        loop {
            if !this.incoming_tls.is_empty() {
                this.process_incoming()?;
                if !this.plaintext_buf.is_empty() {
                    return Poll::Ready(Ok(this.take_plaintext(buf)));
                }
            }

            let mut tmp = [0u8; 4096];
            match Pin::new(&mut this.inner).poll_read(cx, &mut tmp) {
                Poll::Ready(Ok(0)) => return Poll::Ready(Ok(0)),
                Poll::Ready(Ok(n)) => {
                    this.incoming_tls.extend_from_slice(&tmp[..n]);
                }
                Poll::Ready(Err(e)) => return Poll::Ready(Err(e)),
                Poll::Pending => return Poll::Pending,
            }
        }
    }
}

impl AsyncWrite for TlsStream {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<IoResult<usize>> {
        let this = &mut *self;

        // Earlier records go out before new plaintext is accepted
        if this.poll_drain_outgoing(cx)?.is_pending() {
            return Poll::Pending;
        }

        let written = this
            .tls
            .writer()
            .write(buf)
            .map_err(|e| tls_error("TLS writer", e))?;
        this.bytes_written += written as u64;

        this.extract_outgoing()?;
        // Pending here is fine; the records go out on the next write or flush
        let _ = this.poll_drain_outgoing(cx)?;

        Poll::Ready(Ok(written))
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<IoResult<()>> {
        let this = &mut *self;
        this.extract_outgoing()?;
        if this.poll_drain_outgoing(cx)?.is_pending() {
            return Poll::Pending;
        }
        Pin::new(&mut this.inner).poll_flush(cx)
    }

    fn poll_close(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<IoResult<()>> {
        let this = &mut *self;
        this.tls.send_close_notify();
        this.extract_outgoing()?;
        if this.poll_drain_outgoing(cx)?.is_pending() {
            return Poll::Pending;
        }
        Pin::new(&mut this.inner).poll_close(cx)
    }
}

// ---------------------------------------------------------------------------
// TlsLayer
// ---------------------------------------------------------------------------

/// TLS on top of another layer (TCP by default)
pub struct TlsLayer {
    lower: Arc<dyn NetLayer>,
    verified: Arc<ClientConfig>,
    relay: Arc<ClientConfig>,
}

impl TlsLayer {
    pub fn new(lower: Arc<dyn NetLayer>) -> Self {
        let mut roots = RootCertStore::empty();
        roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
        let verified = ClientConfig::builder()
            .with_root_certificates(roots)
            .with_no_client_auth();

        let relay = ClientConfig::builder()
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(TorRelayVerifier))
            .with_no_client_auth();

        Self {
            lower,
            verified: Arc::new(verified),
            relay: Arc::new(relay),
        }
    }

    fn server_name(
        properties: &ConnectProperties,
        remote: &NetAddress,
    ) -> Result<ServerName<'static>> {
        let name = properties
            .server_name
            .clone()
            .unwrap_or_else(|| remote.hostname());
        match ServerName::try_from(name.clone()) {
            Ok(parsed) => Ok(parsed),
            Err(_) if properties.relay_link => {
                log::trace!("SNI '{}' is not a valid DNS name, using fallback", name);
                ServerName::try_from(RELAY_FALLBACK_SNI)
                    .map_err(|e| TorError::Internal(format!("fallback SNI: {}", e)))
            }
            Err(e) => Err(TorError::InvalidConfig(format!("server name {}: {}", name, e))),
        }
    }
}

#[async_trait]
impl NetLayer for TlsLayer {
    fn kind(&self) -> NetLayerKind {
        NetLayerKind::Tls
    }

    async fn connect(
        &self,
        properties: &ConnectProperties,
        local: Option<&NetAddress>,
        remote: &NetAddress,
    ) -> Result<BoxedStream> {
        let server_name = Self::server_name(properties, remote)?;
        let config = if properties.relay_link {
            self.relay.clone()
        } else {
            self.verified.clone()
        };

        let stream = self.lower.connect(properties, local, remote).await?;
        let tls = TlsStream::wrap(stream, config, server_name)
            .await
            .map_err(|e| TorError::HandshakeFailed(format!("TLS with {}: {}", remote, e)))?;
        Ok(Box::new(tls))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::echo::EchoLayer;

    #[test]
    fn test_verifier_schemes() {
        let verifier = TorRelayVerifier;
        let schemes = verifier.supported_verify_schemes();
        assert!(!schemes.is_empty());
    }

    #[test]
    fn test_server_name_fallback_for_relays() {
        let remote = NetAddress::new("10.1.2.3", 9001);
        let relay = ConnectProperties::relay_link();
        assert!(TlsLayer::server_name(&relay, &remote).is_ok());

        let named = ConnectProperties {
            server_name: Some("example.org".into()),
            ..Default::default()
        };
        assert!(TlsLayer::server_name(&named, &remote).is_ok());
    }

    #[tokio::test]
    async fn test_handshake_against_non_tls_peer_fails() {
        // The echo peer reflects our ClientHello, which is not a ServerHello
        let layer = TlsLayer::new(Arc::new(EchoLayer::new()));
        let result = layer
            .connect(
                &ConnectProperties::relay_link(),
                None,
                &NetAddress::new("10.0.0.1", 443),
            )
            .await;
        assert!(matches!(result, Err(TorError::HandshakeFailed(_))));
    }
}
