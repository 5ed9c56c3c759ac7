//! Artifact fetching
//!
//! An [`ArtifactFetcher`] opens a content session for a source URI (HTTP(S),
//! `file://` or a plain path), optionally verifies the declared SHA-1 of the
//! content, and only then writes it to its target path.

pub mod archive;

pub use archive::{extract, ArchiveKind};

use crate::errors::{FetchError, Result};
use crate::retry::{retry_async, RetryConfig, RetryDecision};
use bytes::Bytes;
use sha1::{Digest, Sha1};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info, instrument};

/// Where artifact content comes from
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ArtifactSource {
    Http(String),
    File(PathBuf),
}

impl ArtifactSource {
    pub fn parse(uri: &str) -> Self {
        if uri.starts_with("http://") || uri.starts_with("https://") {
            ArtifactSource::Http(uri.to_string())
        } else if let Some(path) = uri.strip_prefix("file://") {
            ArtifactSource::File(PathBuf::from(path))
        } else {
            ArtifactSource::File(PathBuf::from(uri))
        }
    }
}

/// Lowercase hex SHA-1 of `data`
pub fn sha1_hex(data: &[u8]) -> String {
    let digest = Sha1::digest(data);
    digest.iter().map(|b| format!("{:02x}", b)).collect()
}

/// Content of one artifact, held in memory until written out
#[derive(Debug, Clone)]
pub struct ArtifactSession {
    uri: String,
    kind: ArchiveKind,
    content: Bytes,
}

impl ArtifactSession {
    pub fn uri(&self) -> &str {
        &self.uri
    }

    pub fn kind(&self) -> ArchiveKind {
        self.kind
    }

    pub fn sha1(&self) -> String {
        sha1_hex(&self.content)
    }

    /// Compare against a declared hash (case-insensitive)
    pub fn verify(&self, expected: &str) -> std::result::Result<(), FetchError> {
        let actual = self.sha1();
        if actual.eq_ignore_ascii_case(expected.trim()) {
            Ok(())
        } else {
            Err(FetchError::HashMismatch {
                expected: expected.to_string(),
                actual,
            })
        }
    }

    /// Write the content to `target`, creating parent directories
    pub async fn write_to(&self, target: &Path) -> std::result::Result<(), FetchError> {
        let io_err = |path: &Path, source| FetchError::Io {
            path: path.display().to_string(),
            source,
        };
        if let Some(parent) = target.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| io_err(parent, e))?;
        }
        tokio::fs::write(target, &self.content)
            .await
            .map_err(|e| io_err(target, e))
    }
}

/// Downloads artifacts with retry on transient HTTP failures
#[derive(Debug, Clone)]
pub struct ArtifactFetcher {
    client: reqwest::Client,
    retry: RetryConfig,
}

impl ArtifactFetcher {
    pub fn new() -> Result<Self> {
        Self::with_retry(RetryConfig::default())
    }

    pub fn with_retry(retry: RetryConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(30))
            .user_agent(concat!("cloud-sidecars/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| FetchError::Download {
                uri: String::new(),
                message: format!("Failed to build HTTP client: {}", e),
            })?;
        Ok(Self { client, retry })
    }

    /// Open a content session for `uri`
    #[instrument(skip(self))]
    pub async fn open(
        &self,
        uri: &str,
        kind_hint: Option<&str>,
    ) -> std::result::Result<ArtifactSession, FetchError> {
        let kind = ArchiveKind::resolve(uri, kind_hint)?;
        let content = match ArtifactSource::parse(uri) {
            ArtifactSource::Http(url) => self.download(&url).await?,
            ArtifactSource::File(path) => {
                let data = tokio::fs::read(&path)
                    .await
                    .map_err(|e| FetchError::Download {
                        uri: uri.to_string(),
                        message: format!("Failed to read {}: {}", path.display(), e),
                    })?;
                Bytes::from(data)
            }
        };
        debug!(bytes = content.len(), "Artifact content retrieved");
        Ok(ArtifactSession {
            uri: uri.to_string(),
            kind,
            content,
        })
    }

    async fn download(&self, url: &str) -> std::result::Result<Bytes, FetchError> {
        retry_async(
            &self.retry,
            || async move {
                let response = self
                    .client
                    .get(url)
                    .send()
                    .await
                    .map_err(|e| HttpFailure::Transport(e.to_string()))?;
                let status = response.status();
                if !status.is_success() {
                    return Err(HttpFailure::Status(status.as_u16()));
                }
                response
                    .bytes()
                    .await
                    .map_err(|e| HttpFailure::Transport(e.to_string()))
            },
            HttpFailure::classify,
        )
        .await
        .map_err(|failure| FetchError::Download {
            uri: url.to_string(),
            message: failure.to_string(),
        })
    }

    /// Fetch `uri` into `target`, rejecting content whose hash differs from `expected_sha1`
    #[instrument(skip(self), fields(target = %target.display()))]
    pub async fn fetch(
        &self,
        target: &Path,
        uri: &str,
        kind_hint: Option<&str>,
        expected_sha1: Option<&str>,
    ) -> Result<ArtifactSession> {
        info!("Downloading from {} ...", uri);
        let session = self.open(uri, kind_hint).await?;
        if let Some(expected) = expected_sha1.filter(|s| !s.is_empty()) {
            session.verify(expected)?;
        }
        session.write_to(target).await?;
        info!("Finished downloading from {}", uri);
        Ok(session)
    }

    /// SHA-1 of the content behind `uri`
    pub async fn sha1(&self, uri: &str, kind_hint: Option<&str>) -> Result<String> {
        Ok(self.open(uri, kind_hint).await?.sha1())
    }
}

#[derive(Debug)]
enum HttpFailure {
    Transport(String),
    Status(u16),
}

impl HttpFailure {
    fn classify(&self) -> RetryDecision {
        match self {
            HttpFailure::Transport(_) => RetryDecision::Retry,
            HttpFailure::Status(code) if *code >= 500 || *code == 429 => RetryDecision::Retry,
            HttpFailure::Status(_) => RetryDecision::Stop,
        }
    }
}

impl std::fmt::Display for HttpFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            HttpFailure::Transport(message) => write!(f, "{}", message),
            HttpFailure::Status(code) => write!(f, "unexpected HTTP status {}", code),
        }
    }
}
