//! Plain TCP layer on top of tokio sockets

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::net::{lookup_host, TcpListener, TcpSocket, TcpStream};
use tokio_util::compat::TokioAsyncReadCompatExt;

use super::{BoxedStream, ConnectProperties, NetAddress, NetLayer, NetLayerKind, NetListener};
use crate::error::{Result, TorError};

const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

/// Connection statistics
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct NetworkStats {
    pub connections_attempted: u64,
    pub connections_successful: u64,
    pub connections_failed: u64,
}

impl NetworkStats {
    pub fn success_rate(&self) -> f64 {
        if self.connections_attempted == 0 {
            return 0.0;
        }
        self.connections_successful as f64 / self.connections_attempted as f64
    }
}

#[derive(Debug, Default)]
pub struct TcpLayer {
    attempted: AtomicU64,
    successful: AtomicU64,
    failed: AtomicU64,
}

impl TcpLayer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn stats(&self) -> NetworkStats {
        NetworkStats {
            connections_attempted: self.attempted.load(Ordering::Relaxed),
            connections_successful: self.successful.load(Ordering::Relaxed),
            connections_failed: self.failed.load(Ordering::Relaxed),
        }
    }

    async fn resolve(remote: &NetAddress) -> Result<SocketAddr> {
        if let Some(addr) = remote.socket_addr() {
            return Ok(addr);
        }
        lookup_host((remote.hostname().as_str(), remote.port()))
            .await?
            .next()
            .ok_or_else(|| TorError::ConnectionFailed(format!("no address for {}", remote)))
    }

    async fn connect_once(local: Option<&NetAddress>, remote: &NetAddress) -> Result<TcpStream> {
        let addr = Self::resolve(remote).await?;
        match local.and_then(NetAddress::socket_addr) {
            Some(local) => {
                let socket = if addr.is_ipv4() {
                    TcpSocket::new_v4()?
                } else {
                    TcpSocket::new_v6()?
                };
                socket.bind(local)?;
                Ok(socket.connect(addr).await?)
            }
            None => Ok(TcpStream::connect(addr).await?),
        }
    }
}

#[async_trait]
impl NetLayer for TcpLayer {
    fn kind(&self) -> NetLayerKind {
        NetLayerKind::Tcp
    }

    async fn connect(
        &self,
        properties: &ConnectProperties,
        local: Option<&NetAddress>,
        remote: &NetAddress,
    ) -> Result<BoxedStream> {
        let limit = properties.connect_timeout.unwrap_or(DEFAULT_CONNECT_TIMEOUT);
        self.attempted.fetch_add(1, Ordering::Relaxed);
        let start = Instant::now();

        let result = tokio::time::timeout(limit, Self::connect_once(local, remote))
            .await
            .map_err(|_| TorError::Timeout(format!("TCP connect to {}", remote)))
            .and_then(|r| r);

        match result {
            Ok(stream) => {
                self.successful.fetch_add(1, Ordering::Relaxed);
                stream.set_nodelay(true)?;
                log::debug!("TCP connected to {} in {:?}", remote, start.elapsed());
                Ok(Box::new(stream.compat()))
            }
            Err(e) => {
                self.failed.fetch_add(1, Ordering::Relaxed);
                log::debug!("TCP connect to {} failed after {:?}: {}", remote, start.elapsed(), e);
                Err(e)
            }
        }
    }

    async fn listen(
        &self,
        _properties: &ConnectProperties,
        local: &NetAddress,
    ) -> Result<Box<dyn NetListener>> {
        let addr = Self::resolve(local).await?;
        let listener = TcpListener::bind(addr).await?;
        Ok(Box::new(TcpNetListener { listener }))
    }
}

struct TcpNetListener {
    listener: TcpListener,
}

#[async_trait]
impl NetListener for TcpNetListener {
    async fn accept(&mut self) -> Result<(BoxedStream, NetAddress)> {
        let (stream, peer) = self.listener.accept().await?;
        Ok((Box::new(stream.compat()), NetAddress::Socket(peer)))
    }

    fn local_address(&self) -> NetAddress {
        match self.listener.local_addr() {
            Ok(addr) => NetAddress::Socket(addr),
            Err(_) => NetAddress::new("0.0.0.0", 0),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::io::{AsyncReadExt, AsyncWriteExt};

    #[tokio::test]
    async fn test_connect_and_listen_loopback() {
        let layer = TcpLayer::new();
        let props = ConnectProperties::default();
        let mut listener = layer
            .listen(&props, &"127.0.0.1:0".parse().unwrap())
            .await
            .unwrap();
        let addr = listener.local_address();

        let server = tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 4];
            stream.read_exact(&mut buf).await.unwrap();
            stream.write_all(&buf).await.unwrap();
            stream.flush().await.unwrap();
        });

        let mut client = layer.connect(&props, None, &addr).await.unwrap();
        client.write_all(b"ping").await.unwrap();
        client.flush().await.unwrap();
        let mut buf = [0u8; 4];
        client.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping");
        server.await.unwrap();

        let stats = layer.stats();
        assert_eq!(stats.connections_attempted, 1);
        assert_eq!(stats.connections_successful, 1);
        assert_eq!(stats.success_rate(), 1.0);
    }

    #[tokio::test]
    async fn test_refused_connection_counts_failure() {
        let layer = TcpLayer::new();
        // Bind then drop to get a port nobody listens on
        let port = {
            let l = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
            l.local_addr().unwrap().port()
        };
        let result = layer
            .connect(
                &ConnectProperties::default(),
                None,
                &NetAddress::new("127.0.0.1", port),
            )
            .await;
        assert!(result.is_err());
        assert_eq!(layer.stats().connections_failed, 1);
    }
}
