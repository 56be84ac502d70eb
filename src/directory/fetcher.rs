//! Directory document downloads
//!
//! Documents come straight from a directory server's DirPort. The
//! compressed `.z` resource is asked for first; when its body cannot be
//! inflated the plain resource is requested instead.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use super::http::{self, HttpResponse};
use crate::config::TorConfig;
use crate::error::{Result, TorError};
use crate::network::{ConnectProperties, NetAddress, NetLayer};

pub const CONSENSUS_PATH: &str = "/tor/status-vote/current/consensus";
pub const ALL_DESCRIPTORS_PATH: &str = "/tor/server/all";
pub const DESCRIPTORS_BY_DIGEST_PATH: &str = "/tor/server/d/";
pub const AUTHORITY_KEYS_PATH: &str = "/tor/keys/all";

/// Most descriptor digests asked for in one request
pub const MAX_DIGESTS_PER_REQUEST: usize = 96;

pub struct DirectoryFetcher {
    layer: Arc<dyn NetLayer>,
    connect_timeout: Duration,
    overall_timeout: Duration,
    max_bytes: usize,
}

impl DirectoryFetcher {
    pub fn new(layer: Arc<dyn NetLayer>, config: &TorConfig) -> Self {
        Self {
            layer,
            connect_timeout: config.directory_connect_timeout,
            overall_timeout: config.directory_overall_timeout,
            max_bytes: usize::try_from(config.directory_max_bytes).unwrap_or(usize::MAX),
        }
    }

    /// One HTTP GET, bounded by the connect and overall timeouts
    pub async fn get(&self, server: SocketAddr, path: &str) -> Result<HttpResponse> {
        let remote = NetAddress::from(server);
        let properties = ConnectProperties {
            connect_timeout: Some(self.connect_timeout),
            ..Default::default()
        };
        let exchange = async {
            let mut stream = tokio::time::timeout(
                self.connect_timeout,
                self.layer.connect(&properties, None, &remote),
            )
            .await
            .map_err(|_| TorError::Timeout(format!("connecting to directory {}", server)))??;
            let request = http::build_request("GET", path, &server.ip().to_string(), &[]);
            http::exchange(&mut stream, &request, self.max_bytes).await
        };
        tokio::time::timeout(self.overall_timeout, exchange)
            .await
            .map_err(|_| TorError::Timeout(format!("GET {} from {}", path, server)))?
    }

    /// Fetch a document, preferring its compressed form
    pub async fn fetch(&self, server: SocketAddr, path: &str) -> Result<Vec<u8>> {
        let compressed = self
            .get(server, &format!("{}.z", path))
            .await?
            .into_body(path)?;
        match http::decompress(&compressed, self.max_bytes) {
            Ok(body) => Ok(body),
            Err(TorError::Directory(e)) => {
                log::debug!("{}.z from {}: {}; asking for the plain document", path, server, e);
                self.get(server, path).await?.into_body(path)
            }
            Err(e) => Err(e),
        }
    }

    pub async fn fetch_text(&self, server: SocketAddr, path: &str) -> Result<String> {
        let body = self.fetch(server, path).await?;
        String::from_utf8(body)
            .map_err(|_| TorError::ParseError(format!("{} from {} is not UTF-8", path, server)))
    }
}

/// `/tor/server/d/<d1>+<d2>...` paths for `digests`, at most
/// [`MAX_DIGESTS_PER_REQUEST`] per path
pub fn descriptor_paths(digests: &[[u8; 20]]) -> Vec<String> {
    digests
        .chunks(MAX_DIGESTS_PER_REQUEST)
        .map(|batch| {
            let hex: Vec<String> = batch.iter().map(hex::encode_upper).collect();
            format!("{}{}", DESCRIPTORS_BY_DIGEST_PATH, hex.join("+"))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::mock::MockLayer;
    use flate2::write::ZlibEncoder;
    use flate2::Compression;
    use std::io::Write;

    fn fetcher(mock: Arc<MockLayer>) -> DirectoryFetcher {
        DirectoryFetcher::new(mock, &TorConfig::default())
    }

    fn zlib(data: &[u8]) -> Vec<u8> {
        let mut encoder = ZlibEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(data).unwrap();
        encoder.finish().unwrap()
    }

    #[test]
    fn test_descriptor_paths_batches() {
        let digests: Vec<[u8; 20]> = (0..200u8).map(|i| [i; 20]).collect();
        let paths = descriptor_paths(&digests);
        assert_eq!(paths.len(), 3);
        assert_eq!(paths[0].matches('+').count(), MAX_DIGESTS_PER_REQUEST - 1);
        assert_eq!(paths[2].matches('+').count(), 200 - 2 * MAX_DIGESTS_PER_REQUEST - 1);
        assert!(paths[0].starts_with("/tor/server/d/0000"));
    }

    #[tokio::test]
    async fn test_compressed_fetch() {
        let mock = Arc::new(MockLayer::new());
        let server: SocketAddr = "10.0.0.1:80".parse().unwrap();
        mock.serve_http(
            server.into(),
            Arc::new(|path: &str| (path == "/tor/keys/all.z").then(|| (200, zlib(b"keys")))),
        );
        let body = fetcher(mock.clone()).fetch(server, AUTHORITY_KEYS_PATH).await.unwrap();
        assert_eq!(body, b"keys");
        assert_eq!(mock.connection_count(), 1);
    }

    #[tokio::test]
    async fn test_falls_back_to_plain_document() {
        let mock = Arc::new(MockLayer::new());
        let server: SocketAddr = "10.0.0.1:80".parse().unwrap();
        mock.serve_http(
            server.into(),
            Arc::new(|path: &str| match path {
                "/tor/keys/all.z" => Some((200, b"not compressed".to_vec())),
                "/tor/keys/all" => Some((200, b"plain".to_vec())),
                _ => None,
            }),
        );
        let body = fetcher(mock.clone()).fetch(server, AUTHORITY_KEYS_PATH).await.unwrap();
        assert_eq!(body, b"plain");
        assert_eq!(mock.connection_count(), 2);
    }

    #[tokio::test]
    async fn test_http_error_is_reported() {
        let mock = Arc::new(MockLayer::new());
        let server: SocketAddr = "10.0.0.1:80".parse().unwrap();
        mock.serve_http(server.into(), Arc::new(|_: &str| None));
        let err = fetcher(mock).fetch(server, CONSENSUS_PATH).await.unwrap_err();
        assert!(matches!(err, TorError::Directory(_)));
        assert!(err.is_retryable());
    }
}
