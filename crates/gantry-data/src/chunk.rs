use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use futures::{StreamExt, TryStreamExt};
use gantry_common::types::{ByteRange, ByteStream, HealthStatus, KeyContext};
use rand::{RngCore, rngs::OsRng};
use reqwest::header::{CONTENT_LENGTH, RANGE};
use reqwest::{Body, Client, StatusCode};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};
use url::Url;

use crate::error::{DriverError, DriverResult};
use crate::traits::{DataDriver, ExactSizeStream};

pub const CHUNK_STORE_BACKEND_NAME: &str = "chunkstore";
pub const DEFAULT_CHUNK_STORE_PATH: &str = "/proxy/arc/";
pub const DEFAULT_CHUNK_STORE_TIMEOUT_SECS: u64 = 30;

const KEY_BYTES: usize = 20;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkStoreConfig {
    /// `host:port` or full base URLs.
    pub bootstrap: Vec<String>,
    #[serde(default = "default_path")]
    pub path: String,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

fn default_path() -> String {
    DEFAULT_CHUNK_STORE_PATH.to_string()
}

fn default_timeout_secs() -> u64 {
    DEFAULT_CHUNK_STORE_TIMEOUT_SECS
}

impl ChunkStoreConfig {
    pub fn new(bootstrap: Vec<String>) -> Self {
        Self {
            bootstrap,
            path: default_path(),
            timeout_secs: default_timeout_secs(),
        }
    }
}

#[derive(Debug)]
pub struct ChunkStoreBackend {
    client: Client,
    endpoints: Vec<Url>,
    next_endpoint: AtomicUsize,
}

impl ChunkStoreBackend {
    pub fn new(config: &ChunkStoreConfig) -> DriverResult<Self> {
        if config.bootstrap.is_empty() {
            return Err(DriverError::UnknownLocation(
                "chunk store has no bootstrap endpoints".to_string(),
            ));
        }

        let mut path = config.path.trim_start_matches('/').to_string();
        if !path.is_empty() && !path.ends_with('/') {
            path.push('/');
        }

        let endpoints = config
            .bootstrap
            .iter()
            .map(|endpoint| {
                let base = if endpoint.contains("://") {
                    endpoint.trim_end_matches('/').to_string()
                } else {
                    format!("http://{}", endpoint.trim_end_matches('/'))
                };
                Url::parse(&format!("{base}/{path}")).map_err(|err| {
                    DriverError::UnknownLocation(format!("invalid chunk store endpoint {endpoint}: {err}"))
                })
            })
            .collect::<DriverResult<Vec<_>>>()?;

        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;

        Ok(Self {
            client,
            endpoints,
            next_endpoint: AtomicUsize::new(0),
        })
    }

    fn endpoint(&self) -> &Url {
        let index = self.next_endpoint.fetch_add(1, Ordering::Relaxed) % self.endpoints.len();
        &self.endpoints[index]
    }

    fn key_url(&self, key: &str) -> DriverResult<Url> {
        if key.len() != KEY_BYTES * 2 || !key.chars().all(|c| c.is_ascii_hexdigit()) {
            return Err(DriverError::InvalidKey(key.to_string()));
        }
        self.endpoint()
            .join(key)
            .map_err(|_| DriverError::InvalidKey(key.to_string()))
    }
}

fn generate_key() -> String {
    let mut raw = [0_u8; KEY_BYTES];
    OsRng.fill_bytes(&mut raw);
    hex::encode(raw)
}

fn unexpected_status(status: StatusCode, url: &Url) -> DriverError {
    DriverError::Status {
        status: status.as_u16(),
        url: url.to_string(),
    }
}

#[async_trait]
impl DataDriver for ChunkStoreBackend {
    fn name(&self) -> &str {
        CHUNK_STORE_BACKEND_NAME
    }

    async fn put(
        &self,
        stream: ByteStream,
        size: u64,
        _ctx: &KeyContext,
        request_id: &str,
    ) -> DriverResult<String> {
        let key = generate_key();
        let url = self.key_url(&key)?;
        let body = Body::wrap_stream(ExactSizeStream::new(stream, size));

        let response = self
            .client
            .put(url.clone())
            .header(CONTENT_LENGTH, size)
            .body(body)
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(unexpected_status(response.status(), &url));
        }

        debug!(request_id, key = %key, size, "stored object in chunk store");
        Ok(key)
    }

    async fn get(
        &self,
        key: &str,
        range: Option<ByteRange>,
        _request_id: &str,
    ) -> DriverResult<ByteStream> {
        let url = self.key_url(key)?;
        let mut request = self.client.get(url.clone());
        if let Some(range) = range {
            request = request.header(RANGE, range.header_value());
        }

        let response = request.send().await?;
        match response.status() {
            StatusCode::NOT_FOUND => Err(DriverError::NotFound(key.to_string())),
            status if status.is_success() => Ok(response
                .bytes_stream()
                .map_err(std::io::Error::other)
                .boxed()),
            status => Err(unexpected_status(status, &url)),
        }
    }

    async fn delete(&self, key: &str, _request_id: &str) -> DriverResult<()> {
        let url = self.key_url(key)?;
        let response = self.client.delete(url.clone()).send().await?;
        match response.status() {
            StatusCode::NOT_FOUND => Err(DriverError::NotFound(key.to_string())),
            status if status.is_success() => Ok(()),
            status => Err(unexpected_status(status, &url)),
        }
    }

    async fn healthcheck(&self, request_id: &str) -> HealthStatus {
        let url = match self.endpoint().join(".conf") {
            Ok(url) => url,
            Err(err) => return HealthStatus::error(err.to_string()),
        };
        match self.client.get(url.clone()).send().await {
            Ok(response) if response.status().is_success() => HealthStatus::ok(),
            Ok(response) => {
                let err = unexpected_status(response.status(), &url);
                warn!(request_id, error = %err, "chunk store healthcheck failed");
                HealthStatus::error(err.to_string())
            }
            Err(err) => {
                warn!(request_id, error = %err, "chunk store unreachable");
                HealthStatus::error(err.to_string())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{ChunkStoreBackend, ChunkStoreConfig, generate_key};

    #[test]
    fn keys_are_forty_hex_characters() {
        let key = generate_key();
        assert_eq!(key.len(), 40);
        assert!(key.chars().all(|c| c.is_ascii_hexdigit()));
        assert_ne!(key, generate_key());
    }

    #[test]
    fn endpoints_rotate_and_join_keys() {
        let config = ChunkStoreConfig::new(vec![
            "127.0.0.1:8181".to_string(),
            "http://127.0.0.2:8181/".to_string(),
        ]);
        let backend = ChunkStoreBackend::new(&config).unwrap();
        let key = "0".repeat(40);

        let first = backend.key_url(&key).unwrap();
        let second = backend.key_url(&key).unwrap();
        assert_eq!(first.as_str(), format!("http://127.0.0.1:8181/proxy/arc/{key}"));
        assert_eq!(second.as_str(), format!("http://127.0.0.2:8181/proxy/arc/{key}"));
        assert!(backend.key_url("not-a-key").is_err());
    }

    #[test]
    fn empty_bootstrap_is_rejected() {
        assert!(ChunkStoreBackend::new(&ChunkStoreConfig::new(Vec::new())).is_err());
    }
}
