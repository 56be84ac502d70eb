//! Listening side of a hosted hidden service
//!
//! Inbound streams wait in a bounded queue until the application accepts
//! them. A producer facing a full queue waits for room.

use async_trait::async_trait;
use tokio::sync::{mpsc, Mutex as AsyncMutex};

use crate::error::{Result, TorError};
use crate::network::{BoxedStream, NetAddress, NetListener};

/// Streams queued before producers have to wait
pub const SERVER_SOCKET_QUEUE: usize = 10;

pub struct TorNetServerSocket {
    local: NetAddress,
    producer: mpsc::Sender<(BoxedStream, NetAddress)>,
    queue: AsyncMutex<mpsc::Receiver<(BoxedStream, NetAddress)>>,
}

impl TorNetServerSocket {
    /// Socket for the service reachable at `local`
    pub fn new(local: NetAddress) -> Self {
        let (producer, queue) = mpsc::channel(SERVER_SOCKET_QUEUE);
        Self {
            local,
            producer,
            queue: AsyncMutex::new(queue),
        }
    }

    /// Queue an inbound stream, waiting while the queue is full
    pub async fn create_stream(&self, stream: BoxedStream, remote: NetAddress) -> Result<()> {
        self.producer
            .send((stream, remote))
            .await
            .map_err(|_| TorError::HiddenService(format!("server socket {} is closed", self.local)))
    }

    /// Next queued stream, waiting while there is none
    pub async fn accept(&self) -> Result<(BoxedStream, NetAddress)> {
        self.queue
            .lock()
            .await
            .recv()
            .await
            .ok_or_else(|| TorError::HiddenService(format!("server socket {} is closed", self.local)))
    }

    /// Streams waiting to be accepted
    pub fn pending(&self) -> usize {
        SERVER_SOCKET_QUEUE - self.producer.capacity()
    }

    pub fn local_address(&self) -> &NetAddress {
        &self.local
    }

    /// Refuse further streams; queued ones can still be accepted
    pub async fn close(&self) {
        self.queue.lock().await.close();
    }
}

/// Listener handed out by the Tor layer's `listen`
pub struct ServerSocketListener {
    pub(crate) socket: std::sync::Arc<TorNetServerSocket>,
    pub(crate) host: Option<std::sync::Arc<super::host::HiddenServiceHost>>,
}

#[async_trait]
impl NetListener for ServerSocketListener {
    async fn accept(&mut self) -> Result<(BoxedStream, NetAddress)> {
        self.socket.accept().await
    }

    fn local_address(&self) -> NetAddress {
        self.socket.local_address().clone()
    }

    async fn close(&mut self) {
        self.socket.close().await;
        if let Some(host) = self.host.take() {
            host.stop();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::io::{AsyncReadExt, AsyncWriteExt};
    use std::time::Duration;
    use tokio_util::compat::TokioAsyncReadCompatExt;

    fn pipe() -> (BoxedStream, BoxedStream) {
        let (a, b) = tokio::io::duplex(1024);
        (Box::new(a.compat()), Box::new(b.compat()))
    }

    fn local() -> NetAddress {
        NetAddress::new("example.onion", 80)
    }

    #[tokio::test]
    async fn test_accept_returns_queued_stream() {
        let socket = TorNetServerSocket::new(local());
        let (server, mut client) = pipe();
        socket.create_stream(server, NetAddress::new("peer", 0)).await.unwrap();
        assert_eq!(socket.pending(), 1);

        let (mut accepted, remote) = socket.accept().await.unwrap();
        assert_eq!(remote, NetAddress::new("peer", 0));
        client.write_all(b"hi").await.unwrap();
        let mut buf = [0u8; 2];
        accepted.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"hi");
        assert_eq!(socket.pending(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_accept_waits_for_a_stream() {
        let socket = TorNetServerSocket::new(local());
        let waited = tokio::time::timeout(Duration::from_secs(5), socket.accept()).await;
        assert!(waited.is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_producer_waits_on_full_queue() {
        let socket = std::sync::Arc::new(TorNetServerSocket::new(local()));
        let mut clients = Vec::new();
        for _ in 0..SERVER_SOCKET_QUEUE {
            let (server, client) = pipe();
            clients.push(client);
            socket.create_stream(server, local()).await.unwrap();
        }
        assert_eq!(socket.pending(), SERVER_SOCKET_QUEUE);

        let (server, _client) = pipe();
        let producer = socket.clone();
        let blocked = tokio::spawn(async move { producer.create_stream(server, NetAddress::new("late", 1)).await });
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert!(!blocked.is_finished());

        socket.accept().await.unwrap();
        blocked.await.unwrap().unwrap();
        assert_eq!(socket.pending(), SERVER_SOCKET_QUEUE);
    }

    #[tokio::test]
    async fn test_closed_socket_refuses_streams() {
        let socket = TorNetServerSocket::new(local());
        socket.close().await;
        let (server, _client) = pipe();
        assert!(socket.create_stream(server, local()).await.is_err());
        assert!(socket.accept().await.is_err());
    }
}
