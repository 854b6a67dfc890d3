//! Pool of reusable zstd compression contexts for the small, in-memory
//! payloads this crate compresses (info/listing/realisation/log bodies).
//!
//! Allocating a fresh zstd context costs a sizeable history buffer. A
//! `zstd::bulk::Compressor` keeps that cost paid once per pooled entry and
//! reused across calls instead of re-allocated on every `compress_buffered`
//! call: the free list below hands out an existing compressor when one is
//! available and only builds a new one when the pool is empty, returning it
//! afterward for the next caller to reuse.
//!
//! The large-archive streaming path (`pipeline.rs`) compresses directly onto
//! a duplex pipe rather than into a single in-memory buffer, so it isn't
//! served by this buffer-to-buffer pool; it builds its own encoder, which
//! `pipeline.rs` documents at its call site.

use std::sync::{Arc, Mutex};
use zstd::bulk::Compressor;

/// Label stamped into info-file metadata for archive/info/log/realisation
/// bodies, all compressed with the same codec.
pub const ARCHIVE_COMPRESSION_LABEL: &str = "zstd";

const COMPRESSION_LEVEL: i32 = 3;
const MAX_POOLED: usize = 64;

/// A process-wide pool of zstd compression contexts, shared by clone (the
/// free list lives behind an `Arc<Mutex<_>>`).
#[derive(Clone)]
pub struct CompressorPool {
    free: Arc<Mutex<Vec<Compressor<'static>>>>,
}

impl CompressorPool {
    pub fn new() -> Self {
        Self { free: Arc::new(Mutex::new(Vec::new())) }
    }

    fn acquire(&self) -> std::io::Result<Compressor<'static>> {
        if let Some(compressor) = self.free.lock().unwrap().pop() {
            return Ok(compressor);
        }
        Compressor::new(COMPRESSION_LEVEL)
    }

    fn release(&self, compressor: Compressor<'static>) {
        let mut free = self.free.lock().unwrap();
        if free.len() < MAX_POOLED {
            free.push(compressor);
        }
    }

    /// Compress `data` fully into memory, reusing a pooled zstd context
    /// rather than paying its setup cost on every call. Used for
    /// info/realisation/listing/log payloads, all small enough to buffer.
    pub async fn compress_buffered(&self, data: &[u8]) -> std::io::Result<Vec<u8>> {
        let pool = self.clone();
        let data = data.to_vec();
        tokio::task::spawn_blocking(move || {
            let mut compressor = pool.acquire()?;
            let result = compressor.compress(&data);
            pool.release(compressor);
            result
        })
        .await
        .expect("compression task panicked")
    }
}

impl Default for CompressorPool {
    fn default() -> Self {
        Self::new()
    }
}
