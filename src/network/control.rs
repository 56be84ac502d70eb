//! Layer that polices connections of a lower layer
//!
//! A controlled connection fails when it takes too long to open, lives past
//! its overall deadline, reads more than its byte budget, or transfers less
//! than a minimum amount within each throughput window.

use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use async_trait::async_trait;
use futures::io::{AsyncRead, AsyncWrite};
use futures::FutureExt;
use serde::{Deserialize, Serialize};
use tokio::time::{Instant, Sleep};

use super::{BoxedStream, ConnectProperties, NetAddress, NetLayer, NetLayerKind, NetLayerStatus};
use crate::error::{Result, TorError};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ControlSettings {
    #[serde(with = "humantime_serde")]
    pub connect_timeout: Duration,
    #[serde(with = "humantime_serde")]
    pub overall_timeout: Duration,
    pub max_input_bytes: u64,
    #[serde(with = "humantime_serde")]
    pub throughput_window: Duration,
    /// Bytes that must be read within each window; 0 disables the check
    pub min_bytes_per_window: u64,
}

impl Default for ControlSettings {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(30),
            overall_timeout: Duration::from_secs(120),
            max_input_bytes: 64 * 1024 * 1024,
            throughput_window: Duration::from_secs(30),
            min_bytes_per_window: 0,
        }
    }
}

pub struct ControlLayer {
    lower: Arc<dyn NetLayer>,
    settings: ControlSettings,
}

impl ControlLayer {
    pub fn new(lower: Arc<dyn NetLayer>, settings: ControlSettings) -> Self {
        Self { lower, settings }
    }

    pub fn settings(&self) -> &ControlSettings {
        &self.settings
    }
}

#[async_trait]
impl NetLayer for ControlLayer {
    fn kind(&self) -> NetLayerKind {
        NetLayerKind::Control
    }

    async fn connect(
        &self,
        properties: &ConnectProperties,
        local: Option<&NetAddress>,
        remote: &NetAddress,
    ) -> Result<BoxedStream> {
        let limit = properties
            .connect_timeout
            .unwrap_or(self.settings.connect_timeout);
        let stream = tokio::time::timeout(limit, self.lower.connect(properties, local, remote))
            .await
            .map_err(|_| TorError::Timeout(format!("connect to {} within {:?}", remote, limit)))??;
        Ok(Box::new(ControlledStream::new(stream, self.settings.clone())))
    }

    fn status(&self) -> NetLayerStatus {
        self.lower.status()
    }

    async fn wait_until_ready(&self) -> Result<()> {
        self.lower.wait_until_ready().await
    }

    async fn clear(&self) {
        self.lower.clear().await
    }
}

pub struct ControlledStream {
    inner: BoxedStream,
    settings: ControlSettings,
    overall: Pin<Box<Sleep>>,
    window_start: Instant,
    window_bytes: u64,
    total_read: u64,
}

impl ControlledStream {
    fn new(inner: BoxedStream, settings: ControlSettings) -> Self {
        let overall = Box::pin(tokio::time::sleep(settings.overall_timeout));
        Self {
            inner,
            settings,
            overall,
            window_start: Instant::now(),
            window_bytes: 0,
            total_read: 0,
        }
    }

    pub fn total_read(&self) -> u64 {
        self.total_read
    }

    fn check_limits(&mut self, cx: &mut Context<'_>) -> io::Result<()> {
        if self.overall.poll_unpin(cx).is_ready() {
            return Err(io::Error::new(
                io::ErrorKind::TimedOut,
                "connection exceeded its overall timeout",
            ));
        }
        if self.settings.min_bytes_per_window > 0
            && self.window_start.elapsed() >= self.settings.throughput_window
        {
            if self.window_bytes < self.settings.min_bytes_per_window {
                return Err(io::Error::new(
                    io::ErrorKind::TimedOut,
                    format!(
                        "throughput below {} bytes per {:?}",
                        self.settings.min_bytes_per_window, self.settings.throughput_window
                    ),
                ));
            }
            self.window_start = Instant::now();
            self.window_bytes = 0;
        }
        Ok(())
    }
}

impl AsyncRead for ControlledStream {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut [u8],
    ) -> Poll<io::Result<usize>> {
        let this = &mut *self;
        this.check_limits(cx)?;

        let n = match Pin::new(&mut this.inner).poll_read(cx, buf) {
            Poll::Ready(Ok(n)) => n,
            other => return other,
        };
        this.total_read += n as u64;
        this.window_bytes += n as u64;
        if this.total_read > this.settings.max_input_bytes {
            return Poll::Ready(Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("input exceeds {} bytes", this.settings.max_input_bytes),
            )));
        }
        Poll::Ready(Ok(n))
    }
}

impl AsyncWrite for ControlledStream {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = &mut *self;
        this.check_limits(cx)?;
        Pin::new(&mut this.inner).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_flush(cx)
    }

    fn poll_close(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_close(cx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::echo::EchoLayer;
    use crate::network::mock::{MockHandler, MockLayer};
    use futures::io::{AsyncReadExt, AsyncWriteExt};

    fn echo_control(settings: ControlSettings) -> ControlLayer {
        ControlLayer::new(Arc::new(EchoLayer::new()), settings)
    }

    #[tokio::test]
    async fn test_input_budget_enforced() {
        let layer = echo_control(ControlSettings {
            max_input_bytes: 8,
            ..Default::default()
        });
        let mut stream = layer
            .connect(&ConnectProperties::default(), None, &NetAddress::new("echo", 7))
            .await
            .unwrap();
        stream.write_all(&[0u8; 16]).await.unwrap();
        stream.flush().await.unwrap();

        let mut buf = [0u8; 16];
        let result = stream.read_exact(&mut buf).await;
        assert!(result.is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_overall_timeout() {
        let layer = echo_control(ControlSettings {
            overall_timeout: Duration::from_secs(5),
            ..Default::default()
        });
        let mut stream = layer
            .connect(&ConnectProperties::default(), None, &NetAddress::new("echo", 7))
            .await
            .unwrap();
        let mut buf = [0u8; 1];
        let err = stream.read(&mut buf).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::TimedOut);
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_timeout() {
        let mock = Arc::new(MockLayer::new());
        let addr = NetAddress::new("10.0.0.1", 80);
        let handler: MockHandler = Arc::new(|_stream| async {}.boxed());
        mock.serve(addr.clone(), handler);

        let slow: Arc<dyn NetLayer> = Arc::new(SlowLayer(mock));
        let layer = ControlLayer::new(
            slow,
            ControlSettings {
                connect_timeout: Duration::from_secs(1),
                ..Default::default()
            },
        );
        let result = layer
            .connect(&ConnectProperties::default(), None, &addr)
            .await;
        assert!(matches!(result, Err(TorError::Timeout(_))));
    }

    struct SlowLayer(Arc<MockLayer>);

    #[async_trait]
    impl NetLayer for SlowLayer {
        fn kind(&self) -> NetLayerKind {
            NetLayerKind::Mock
        }

        async fn connect(
            &self,
            properties: &ConnectProperties,
            local: Option<&NetAddress>,
            remote: &NetAddress,
        ) -> Result<BoxedStream> {
            tokio::time::sleep(Duration::from_secs(10)).await;
            self.0.connect(properties, local, remote).await
        }
    }
}
