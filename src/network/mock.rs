//! Scripted in-memory layer for tests
//!
//! Each remote address can be bound to a handler that receives the server
//! end of an in-memory pipe. Connections to unscripted addresses fail.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use futures::future::{BoxFuture, FutureExt};
use futures::io::{AsyncReadExt, AsyncWriteExt};
use tokio_util::compat::TokioAsyncReadCompatExt;

use super::{BoxedStream, ConnectProperties, NetAddress, NetLayer, NetLayerKind};
use crate::error::{Result, TorError};

const PIPE_BUFFER: usize = 256 * 1024;

/// Serves one accepted connection
pub type MockHandler = Arc<dyn Fn(BoxedStream) -> BoxFuture<'static, ()> + Send + Sync>;

/// Answers one HTTP GET path with `(status, body)`, or `None` for 404
pub type HttpResponder = Arc<dyn Fn(&str) -> Option<(u16, Vec<u8>)> + Send + Sync>;

#[derive(Default)]
pub struct MockLayer {
    handlers: Mutex<HashMap<NetAddress, MockHandler>>,
    connections: AtomicUsize,
    per_address: Mutex<HashMap<NetAddress, usize>>,
}

impl MockLayer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Route connections for `address` to `handler`
    pub fn serve(&self, address: NetAddress, handler: MockHandler) {
        if let Ok(mut handlers) = self.handlers.lock() {
            handlers.insert(address, handler);
        }
    }

    /// Serve a minimal HTTP/1.0 server at `address`
    pub fn serve_http(&self, address: NetAddress, responder: HttpResponder) {
        let handler: MockHandler = Arc::new(move |stream| {
            let responder = responder.clone();
            async move {
                if let Err(e) = answer_http(stream, responder).await {
                    log::trace!("mock HTTP handler: {}", e);
                }
            }
            .boxed()
        });
        self.serve(address, handler);
    }

    pub fn remove(&self, address: &NetAddress) {
        if let Ok(mut handlers) = self.handlers.lock() {
            handlers.remove(address);
        }
    }

    /// Connections attempted through this layer, scripted or not
    pub fn connection_count(&self) -> usize {
        self.connections.load(Ordering::SeqCst)
    }

    pub fn connection_count_to(&self, address: &NetAddress) -> usize {
        self.per_address
            .lock()
            .map(|m| m.get(address).copied().unwrap_or(0))
            .unwrap_or(0)
    }
}

async fn answer_http(mut stream: BoxedStream, responder: HttpResponder) -> Result<()> {
    let mut request = Vec::new();
    let mut buf = [0u8; 1024];
    while !request.windows(4).any(|w| w == b"\r\n\r\n") {
        let n = stream.read(&mut buf).await?;
        if n == 0 {
            return Ok(());
        }
        request.extend_from_slice(&buf[..n]);
    }
    let text = String::from_utf8_lossy(&request);
    let path = text
        .lines()
        .next()
        .and_then(|line| line.split_whitespace().nth(1))
        .unwrap_or("/")
        .to_string();

    let (status, body) = responder(&path).unwrap_or((404, b"not found".to_vec()));
    let reason = if status == 200 { "OK" } else { "Error" };
    let head = format!(
        "HTTP/1.0 {} {}\r\nContent-Length: {}\r\n\r\n",
        status,
        reason,
        body.len()
    );
    stream.write_all(head.as_bytes()).await?;
    stream.write_all(&body).await?;
    stream.flush().await?;
    stream.close().await?;
    Ok(())
}

#[async_trait]
impl NetLayer for MockLayer {
    fn kind(&self) -> NetLayerKind {
        NetLayerKind::Mock
    }

    async fn connect(
        &self,
        _properties: &ConnectProperties,
        _local: Option<&NetAddress>,
        remote: &NetAddress,
    ) -> Result<BoxedStream> {
        self.connections.fetch_add(1, Ordering::SeqCst);
        if let Ok(mut counts) = self.per_address.lock() {
            *counts.entry(remote.clone()).or_insert(0) += 1;
        }

        let handler = self
            .handlers
            .lock()
            .map_err(|_| TorError::Internal("mock handler table poisoned".into()))?
            .get(remote)
            .cloned()
            .ok_or_else(|| TorError::ConnectionRefused(format!("no mock peer at {}", remote)))?;

        let (client, server) = tokio::io::duplex(PIPE_BUFFER);
        tokio::spawn(handler(Box::new(server.compat())));
        Ok(Box::new(client.compat()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_unscripted_address_fails() {
        let mock = MockLayer::new();
        let result = mock
            .connect(&ConnectProperties::default(), None, &NetAddress::new("10.0.0.9", 80))
            .await;
        assert!(matches!(result, Err(TorError::ConnectionRefused(_))));
        assert_eq!(mock.connection_count(), 1);
    }

    #[tokio::test]
    async fn test_http_responder() {
        let mock = MockLayer::new();
        let addr = NetAddress::new("10.0.0.1", 80);
        mock.serve_http(
            addr.clone(),
            Arc::new(|path: &str| (path == "/hello").then(|| (200, b"world".to_vec()))),
        );

        let mut stream = mock
            .connect(&ConnectProperties::default(), None, &addr)
            .await
            .unwrap();
        stream
            .write_all(b"GET /hello HTTP/1.0\r\nHost: x\r\n\r\n")
            .await
            .unwrap();
        stream.flush().await.unwrap();
        let mut response = Vec::new();
        stream.read_to_end(&mut response).await.unwrap();
        let text = String::from_utf8(response).unwrap();
        assert!(text.starts_with("HTTP/1.0 200"));
        assert!(text.ends_with("world"));
        assert_eq!(mock.connection_count_to(&addr), 1);
    }
}
