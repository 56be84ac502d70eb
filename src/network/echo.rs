//! Layer whose every connection echoes what is written to it

use async_trait::async_trait;
use tokio_util::compat::TokioAsyncReadCompatExt;

use super::{BoxedStream, ConnectProperties, NetAddress, NetLayer, NetLayerKind};
use crate::error::Result;

const ECHO_BUFFER: usize = 64 * 1024;

#[derive(Debug, Default, Clone, Copy)]
pub struct EchoLayer;

impl EchoLayer {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl NetLayer for EchoLayer {
    fn kind(&self) -> NetLayerKind {
        NetLayerKind::Echo
    }

    async fn connect(
        &self,
        _properties: &ConnectProperties,
        _local: Option<&NetAddress>,
        remote: &NetAddress,
    ) -> Result<BoxedStream> {
        let (client, server) = tokio::io::duplex(ECHO_BUFFER);
        let remote = remote.clone();
        tokio::spawn(async move {
            let (mut reader, mut writer) = tokio::io::split(server);
            match tokio::io::copy(&mut reader, &mut writer).await {
                Ok(n) => log::trace!("echo {} done after {} bytes", remote, n),
                Err(e) => log::trace!("echo {} ended: {}", remote, e),
            }
        });
        Ok(Box::new(client.compat()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::io::{AsyncReadExt, AsyncWriteExt};

    #[tokio::test]
    async fn test_echoes_bytes() {
        let mut stream = EchoLayer::new()
            .connect(
                &ConnectProperties::default(),
                None,
                &NetAddress::new("echo.invalid", 7),
            )
            .await
            .unwrap();
        stream.write_all(b"hello tor").await.unwrap();
        stream.flush().await.unwrap();
        let mut buf = [0u8; 9];
        stream.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"hello tor");
    }
}
