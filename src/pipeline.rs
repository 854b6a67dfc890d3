//! Streaming compression + multipart upload pipeline for one archive
//! (spec §4.8).
//!
//! A serializer task writes nar-archive-1 bytes into a zstd encoder whose
//! compressed output feeds a `tokio::io::duplex` pipe; the orchestrator
//! drains the read half and drives the multipart state machine,
//! requesting additional part URLs on demand and hashing the compressed
//! stream online. The orchestrator always awaits the serializer task
//! before returning, on both success and failure, so a failed upload
//! can't leave the serializer writing into a pipe nobody is reading from.
//!
//! This path builds its own encoder (below) rather than drawing one from
//! `compress::CompressorPool`: the pool hands out buffer-to-buffer
//! `zstd::bulk::Compressor`s sized for info/listing/log bodies that fit in
//! memory, whereas an archive is compressed directly onto the duplex pipe
//! as it streams off disk and never exists as one contiguous buffer.

use crate::nar::{self, listing::Listing};
use crate::server_api::{CompletedPart, ServerClient};
use crate::transport::Transport;
use anyhow::{Context, Result};
use async_compression::tokio::write::ZstdEncoder;
use bytes::Bytes;
use sha2::{Digest as _, Sha256};
use std::path::Path;
use std::sync::Mutex;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tracing::debug;

/// Size of each multipart part, matching spec §4.8's example (10 MiB).
const PART_SIZE: usize = 10 * 1024 * 1024;
/// Duplex pipe capacity between the serializer and the multipart reader.
const PIPE_CAPACITY: usize = 4 * 1024 * 1024;

/// Per-archive-hash record shared across the push, guarded by a mutex since
/// contention is rare (one write per archive task, reads only after the
/// worker join barrier).
#[derive(Debug, Clone)]
pub struct CompressedObjectRecord {
    pub compressed_size: u64,
    /// `sha256:<nix32>` of the compressed stream.
    pub compressed_hash: String,
    pub listing: Option<Listing>,
}

/// A process-wide free-list of part-sized buffers, reused across archive
/// uploads to avoid repeated large allocations.
#[derive(Default)]
pub struct PartBufferPool {
    free: Mutex<Vec<Vec<u8>>>,
}

impl PartBufferPool {
    pub fn new() -> Self {
        Self::default()
    }

    fn acquire(&self) -> Vec<u8> {
        let mut free = self.free.lock().unwrap();
        free.pop().unwrap_or_else(|| Vec::with_capacity(PART_SIZE))
    }

    fn release(&self, mut buf: Vec<u8>) {
        buf.clear();
        let mut free = self.free.lock().unwrap();
        // Keep the free-list from growing unbounded under bursty workloads.
        if free.len() < 64 {
            free.push(buf);
        }
    }
}

/// Result of one streaming compress+multipart upload.
pub struct ArchiveUploadResult {
    pub record: CompressedObjectRecord,
}

/// Stream-serialize `path`, compress it, and multipart-upload it to the
/// object described by `presigned_url`/`upload_id`/`initial_part_urls`.
///
/// `initial_part_urls` is the preallocated list the server returned with
/// the pending closure; additional URLs are requested from `server` in
/// batches as the stream exceeds that list (spec §4.8 state machine).
pub async fn upload_archive(
    transport: &Transport,
    server: &ServerClient,
    part_pool: &PartBufferPool,
    object_key: &str,
    upload_id: &str,
    initial_part_urls: Vec<String>,
    path: &Path,
) -> Result<ArchiveUploadResult> {
    let (pipe_writer, mut pipe_reader) = tokio::io::duplex(PIPE_CAPACITY);

    let path_owned = path.to_path_buf();
    let serializer: tokio::task::JoinHandle<Result<Listing>> = tokio::task::spawn(async move {
        // Not drawn from `CompressorPool`: see the module doc comment.
        let mut encoder = ZstdEncoder::new(pipe_writer);
        let listing = nar::dump_path_with_listing(&mut encoder, &path_owned)
            .await
            .context("serializing archive")?;
        encoder.shutdown().await.context("flushing compressor")?;
        Ok(listing)
    });

    let upload_result = run_multipart_state_machine(
        transport,
        server,
        part_pool,
        object_key,
        upload_id,
        initial_part_urls,
        &mut pipe_reader,
    )
    .await;

    // Always join the serializer, success or failure, to avoid leaking the
    // task or leaving it blocked writing into a pipe nobody reads anymore.
    let listing_result = serializer.await.context("joining serializer task")?;

    let (compressed_size, compressed_hash) = upload_result?;
    let listing = listing_result?;

    Ok(ArchiveUploadResult {
        record: CompressedObjectRecord { compressed_size, compressed_hash, listing: Some(listing) },
    })
}

async fn run_multipart_state_machine(
    transport: &Transport,
    server: &ServerClient,
    part_pool: &PartBufferPool,
    object_key: &str,
    upload_id: &str,
    mut part_urls: Vec<String>,
    reader: &mut (impl tokio::io::AsyncRead + Unpin),
) -> Result<(u64, String)> {
    let mut hasher = Sha256::new();
    let mut total_compressed: u64 = 0;
    let mut completed_parts = Vec::new();
    let mut part_number: u32 = 1;

    loop {
        if (part_number as usize) > part_urls.len() {
            let response = server
                .request_more_parts(object_key, upload_id, part_urls.len() as u32 + 1)
                .await
                .context("requesting additional multipart part URLs")?;
            if response.part_urls.is_empty() {
                anyhow::bail!(
                    "protocol-unexpected: server returned no additional part URLs for {object_key}"
                );
            }
            part_urls.extend(response.part_urls);
        }

        let mut buf = part_pool.acquire();
        buf.resize(PART_SIZE, 0);
        let mut filled = 0usize;
        let mut eof = false;

        while filled < PART_SIZE {
            let n = reader.read(&mut buf[filled..]).await.context("reading compressed stream")?;
            if n == 0 {
                eof = true;
                break;
            }
            filled += n;
        }
        buf.truncate(filled);

        if filled == 0 {
            part_pool.release(buf);
            break;
        }

        hasher.update(&buf);
        total_compressed += filled as u64;

        let url = part_urls
            .get(part_number as usize - 1)
            .ok_or_else(|| {
                anyhow::anyhow!(
                    "protocol-unexpected: insufficient part URLs after exhaustion without EOF"
                )
            })?
            .clone();

        let bytes = Bytes::copy_from_slice(&buf);
        part_pool.release(buf);

        let etag = transport.put_part(&url, bytes).await?;
        debug!(object_key, part_number, filled, "uploaded multipart part");
        completed_parts.push(CompletedPart { part_number, etag });

        if eof {
            break;
        }
        part_number += 1;
    }

    server
        .complete_multipart(object_key, upload_id, &completed_parts)
        .await
        .context("completing multipart upload")?;

    let hash = hasher.finalize();
    let compressed_hash = format!("sha256:{}", crate::nix_base32::encode(&hash));
    Ok((total_compressed, compressed_hash))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn part_buffer_pool_reuses_buffers() {
        let pool = PartBufferPool::new();
        let buf = pool.acquire();
        assert!(buf.capacity() >= PART_SIZE);
        pool.release(buf);
        let buf2 = pool.acquire();
        assert!(buf2.is_empty());
    }
}
