//! HTTP transport: presigned-URL PUTs, multipart part uploads, and the
//! retry/rate-limit wrapper shared by the object-store and coordinating
//! server clients.

pub mod rate_limit;
pub mod retry;

use anyhow::{anyhow, Context, Result};
use bytes::Bytes;
use futures::Stream;
use memmap2::Mmap;
use rate_limit::{RateLimiter, RateLimiterConfig};
use reqwest::Client;
use retry::{with_retry, BodyFactory, RetryConfig};
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context as TaskContext, Poll};
use tracing::debug;

/// Bundles the retry-safe HTTP client plumbing shared by the server API and
/// object-store PUT paths. Each gets its own adaptive rate limiter, as
/// spec §4.4 calls for two independent limiters (server-facing vs
/// object-store-facing).
#[derive(Clone)]
pub struct Transport {
    pub client: Client,
    pub retry_config: RetryConfig,
    pub server_limiter: Arc<RateLimiter>,
    pub storage_limiter: Arc<RateLimiter>,
}

impl Transport {
    pub fn new() -> Result<Self> {
        Self::with_rate_ceilings(RateLimiterConfig::default().ceiling_rate, RateLimiterConfig::default().ceiling_rate)
    }

    /// Build a transport with caller-supplied rate-limit ceilings for the
    /// server-facing and object-store-facing limiters respectively (spec
    /// A.3 `--server-rate-limit`/`--storage-rate-limit`).
    pub fn with_rate_ceilings(server_ceiling: f64, storage_ceiling: f64) -> Result<Self> {
        let client = Client::builder()
            .timeout(std::time::Duration::from_secs(300))
            .build()
            .context("Failed to build HTTP client")?;

        let server_config = RateLimiterConfig { ceiling_rate: server_ceiling, ..RateLimiterConfig::default() };
        let storage_config = RateLimiterConfig { ceiling_rate: storage_ceiling, ..RateLimiterConfig::default() };

        Ok(Self {
            client,
            retry_config: RetryConfig::default(),
            server_limiter: Arc::new(RateLimiter::new(server_config)),
            storage_limiter: Arc::new(RateLimiter::new(storage_config)),
        })
    }

    /// PUT `body` (already in memory) to a presigned object-store URL.
    pub async fn put_bytes(
        &self,
        url: &str,
        body: Vec<u8>,
        content_type: Option<&str>,
        content_encoding: Option<&str>,
    ) -> Result<()> {
        let len = body.len();
        let factory = Arc::new(body);

        let response = with_retry(
            &self.storage_limiter,
            &self.retry_config,
            true,
            Some(&VecFactory(factory.clone())),
            |reqwest_body| {
                let mut req = self
                    .client
                    .put(url)
                    .header("Content-Length", len);
                if let Some(ct) = content_type {
                    req = req.header("Content-Type", ct);
                }
                if let Some(ce) = content_encoding {
                    req = req.header("Content-Encoding", ce);
                }
                req = req.body(reqwest_body.expect("body factory always supplies a body"));
                req.send()
            },
        )
        .await?;

        accept_status(&response)
    }

    /// PUT a large pre-compressed file via a memory-mapped reader, avoiding
    /// buffering it fully into the process heap. The map is released once
    /// the request returns.
    pub async fn put_mmap_file(
        &self,
        url: &str,
        path: &std::path::Path,
        content_type: Option<&str>,
        content_encoding: Option<&str>,
    ) -> Result<()> {
        let file = std::fs::File::open(path)
            .with_context(|| format!("opening {} for mmap upload", path.display()))?;
        let mmap = Arc::new(unsafe { Mmap::map(&file)? });
        let len = mmap.len();

        let factory = MmapFactory(mmap);
        let response = with_retry(
            &self.storage_limiter,
            &self.retry_config,
            true,
            Some(&factory),
            |reqwest_body| {
                let mut req = self
                    .client
                    .put(url)
                    .header("Content-Length", len);
                if let Some(ct) = content_type {
                    req = req.header("Content-Type", ct);
                }
                if let Some(ce) = content_encoding {
                    req = req.header("Content-Encoding", ce);
                }
                req = req.body(reqwest_body.expect("body factory always supplies a body"));
                req.send()
            },
        )
        .await?;

        accept_status(&response)
    }

    /// Upload one multipart part, returning its unquoted `ETag`.
    pub async fn put_part(&self, url: &str, part: Bytes) -> Result<String> {
        let factory = Arc::new(part.to_vec());
        let len = factory.len();

        let response = with_retry(
            &self.storage_limiter,
            &self.retry_config,
            true,
            Some(&VecFactory(factory)),
            |reqwest_body| {
                self.client
                    .put(url)
                    .header("Content-Length", len)
                    .body(reqwest_body.expect("body factory always supplies a body"))
                    .send()
            },
        )
        .await?;

        accept_status(&response)?;

        let etag = response
            .headers()
            .get(reqwest::header::ETAG)
            .ok_or_else(|| anyhow!("protocol-unexpected: no-etag"))?
            .to_str()
            .context("protocol-unexpected: ETag header is not valid UTF-8")?
            .trim_matches('"')
            .to_string();

        debug!(%etag, "uploaded multipart part");
        Ok(etag)
    }
}

fn accept_status(response: &reqwest::Response) -> Result<()> {
    let status = response.status();
    if status == reqwest::StatusCode::OK || status == reqwest::StatusCode::NO_CONTENT {
        Ok(())
    } else {
        Err(anyhow!("transport-failed: unexpected status {status}"))
    }
}

struct VecFactory(Arc<Vec<u8>>);

impl BodyFactory for VecFactory {
    fn make_body(&self) -> reqwest::Body {
        reqwest::Body::from(self.0.as_ref().clone())
    }
}

struct MmapFactory(Arc<Mmap>);

impl BodyFactory for MmapFactory {
    fn make_body(&self) -> reqwest::Body {
        reqwest::Body::wrap_stream(MmapStream { mmap: self.0.clone(), offset: 0 })
    }
}

/// Streams a memory-mapped file in fixed-size chunks without copying the
/// whole file onto the heap up front.
struct MmapStream {
    mmap: Arc<Mmap>,
    offset: usize,
}

const MMAP_CHUNK_SIZE: usize = 1024 * 1024;

impl Stream for MmapStream {
    type Item = std::result::Result<Bytes, std::io::Error>;

    fn poll_next(mut self: Pin<&mut Self>, _cx: &mut TaskContext<'_>) -> Poll<Option<Self::Item>> {
        if self.offset >= self.mmap.len() {
            return Poll::Ready(None);
        }
        let end = (self.offset + MMAP_CHUNK_SIZE).min(self.mmap.len());
        // Safe: we only ever read through the shared mmap, never mutate it.
        let chunk = Bytes::copy_from_slice(&self.mmap[self.offset..end]);
        self.offset = end;
        Poll::Ready(Some(Ok(chunk)))
    }
}
