//! Datagram ingest: a long-running listener that reads store paths off a
//! unix datagram socket, batches them, and pushes each batch once a flush
//! trigger fires (size, batch timeout, idle timeout, or cancellation).

use anyhow::{Context, Result};
use async_trait::async_trait;
use std::collections::HashSet;
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Maximum datagram size accepted; paths are assumed shorter than this.
const MAX_DATAGRAM_SIZE: usize = 4096;

/// A fresh, short deadline given to the residual flush on shutdown, since
/// the ambient cancellation context may already be gone.
const SHUTDOWN_FLUSH_TIMEOUT: Duration = Duration::from_secs(5);

#[async_trait]
pub trait PathPusher: Send + Sync {
    async fn push(&self, paths: Vec<String>) -> Result<()>;
}

#[derive(Debug, Clone)]
pub struct BatchConfig {
    pub batch_size: usize,
    pub batch_timeout: Duration,
    pub idle_timeout: Duration,
    pub max_errors: u32,
}

/// The set of paths accumulated since the last flush. Deduplicated within
/// the batch; no deduplication is attempted across batches.
struct Batch {
    paths: Vec<String>,
    seen: HashSet<String>,
    started_at: Option<Instant>,
}

impl Batch {
    fn new() -> Self {
        Self { paths: Vec::new(), seen: HashSet::new(), started_at: None }
    }

    fn insert(&mut self, path: String) {
        if self.started_at.is_none() {
            self.started_at = Some(Instant::now());
        }
        if self.seen.insert(path.clone()) {
            self.paths.push(path);
        }
    }

    fn len(&self) -> usize {
        self.paths.len()
    }

    fn is_empty(&self) -> bool {
        self.paths.is_empty()
    }

    fn take(&mut self) -> Vec<String> {
        self.started_at = None;
        self.seen.clear();
        std::mem::take(&mut self.paths)
    }
}

/// Drain datagrams from `socket` until `shutdown` is notified, pushing
/// batches to `pusher` as flush triggers fire. Returns an error (treated
/// as fatal by the caller) once `max_errors` consecutive pushes fail.
pub async fn run(
    socket: &tokio::net::UnixDatagram,
    config: BatchConfig,
    pusher: &dyn PathPusher,
    shutdown: &Notify,
) -> Result<()> {
    let mut batch = Batch::new();
    let mut consecutive_errors = 0u32;
    let mut buf = vec![0u8; MAX_DATAGRAM_SIZE];
    let mut idle_deadline = Instant::now() + config.idle_timeout;

    loop {
        let batch_deadline = batch.started_at.map(|t| t + config.batch_timeout);

        tokio::select! {
            biased;

            _ = shutdown.notified() => {
                info!("shutdown signalled, flushing residual batch");
                flush_on_shutdown(&mut batch, pusher).await;
                return Ok(());
            }

            result = socket.recv(&mut buf) => {
                let n = result.context("io-failed: reading datagram")?;
                idle_deadline = Instant::now() + config.idle_timeout;
                if n == 0 {
                    continue;
                }
                let Ok(text) = std::str::from_utf8(&buf[..n]) else { continue };
                let path = text.trim();
                if path.is_empty() {
                    continue;
                }
                batch.insert(path.to_string());
                if batch.len() >= config.batch_size {
                    flush(&mut batch, pusher, &mut consecutive_errors, config.max_errors).await?;
                }
            }

            _ = tokio::time::sleep_until(batch_deadline.unwrap_or_else(Instant::now)),
                if batch_deadline.is_some() => {
                debug!("batch timeout elapsed, flushing");
                flush(&mut batch, pusher, &mut consecutive_errors, config.max_errors).await?;
            }

            _ = tokio::time::sleep_until(idle_deadline) => {
                if !batch.is_empty() {
                    debug!("idle timeout elapsed, flushing");
                    flush(&mut batch, pusher, &mut consecutive_errors, config.max_errors).await?;
                }
                idle_deadline = Instant::now() + config.idle_timeout;
            }
        }
    }
}

async fn flush(
    batch: &mut Batch,
    pusher: &dyn PathPusher,
    consecutive_errors: &mut u32,
    max_errors: u32,
) -> Result<()> {
    if batch.is_empty() {
        return Ok(());
    }
    let paths = batch.take();
    let n = paths.len();
    match pusher.push(paths).await {
        Ok(()) => {
            *consecutive_errors = 0;
            info!(n, "pushed batch");
            Ok(())
        }
        Err(err) => {
            *consecutive_errors += 1;
            warn!(%err, consecutive_errors = *consecutive_errors, "batch push failed");
            if *consecutive_errors >= max_errors {
                anyhow::bail!(
                    "cancelled: {max_errors} consecutive push failures, exiting listener"
                );
            }
            Ok(())
        }
    }
}

async fn flush_on_shutdown(batch: &mut Batch, pusher: &dyn PathPusher) {
    if batch.is_empty() {
        return;
    }
    let paths = batch.take();
    let n = paths.len();
    match tokio::time::timeout(SHUTDOWN_FLUSH_TIMEOUT, pusher.push(paths)).await {
        Ok(Ok(())) => info!(n, "flushed residual batch on shutdown"),
        Ok(Err(err)) => warn!(%err, n, "residual batch push failed on shutdown"),
        Err(_) => warn!(n, "residual batch flush timed out on shutdown"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use tokio::net::UnixDatagram;

    struct RecordingPusher {
        batches: Mutex<Vec<Vec<String>>>,
        fail_next: Mutex<u32>,
    }

    impl RecordingPusher {
        fn new() -> Self {
            Self { batches: Mutex::new(Vec::new()), fail_next: Mutex::new(0) }
        }
    }

    #[async_trait]
    impl PathPusher for RecordingPusher {
        async fn push(&self, paths: Vec<String>) -> Result<()> {
            let mut fail_next = self.fail_next.lock().unwrap();
            if *fail_next > 0 {
                *fail_next -= 1;
                anyhow::bail!("simulated push failure");
            }
            drop(fail_next);
            self.batches.lock().unwrap().push(paths);
            Ok(())
        }
    }

    #[tokio::test]
    async fn batch_flushes_on_size_trigger_with_intra_batch_dedup() {
        let dir = tempfile::tempdir().unwrap();
        let sock_path = dir.path().join("in.sock");
        let client_path = dir.path().join("client.sock");
        let socket = UnixDatagram::bind(&sock_path).unwrap();
        let client = UnixDatagram::bind(&client_path).unwrap();
        client.connect(&sock_path).unwrap();

        let pusher = RecordingPusher::new();
        let shutdown = Notify::new();

        client.send(b"aaa").unwrap();
        client.send(b"aaa").unwrap();
        client.send(b"bbb").unwrap();

        let config = BatchConfig {
            batch_size: 3,
            batch_timeout: Duration::from_secs(10),
            idle_timeout: Duration::from_secs(10),
            max_errors: 3,
        };

        let run_fut = run(&socket, config, &pusher, &shutdown);
        tokio::select! {
            _ = run_fut => {},
            _ = tokio::time::sleep(Duration::from_millis(200)) => {
                shutdown.notify_one();
            }
        }

        let batches = pusher.batches.lock().unwrap();
        assert_eq!(batches.len(), 1);
        assert_eq!(batches[0], vec!["aaa".to_string(), "bbb".to_string()]);
    }

    #[tokio::test]
    async fn batch_flushes_on_timeout_before_size_reached() {
        let dir = tempfile::tempdir().unwrap();
        let sock_path = dir.path().join("in.sock");
        let client_path = dir.path().join("client.sock");
        let socket = UnixDatagram::bind(&sock_path).unwrap();
        let client = UnixDatagram::bind(&client_path).unwrap();
        client.connect(&sock_path).unwrap();

        let pusher = RecordingPusher::new();
        let shutdown = Notify::new();
        client.send(b"ccc").unwrap();

        let config = BatchConfig {
            batch_size: 100,
            batch_timeout: Duration::from_millis(50),
            idle_timeout: Duration::from_secs(10),
            max_errors: 3,
        };

        let run_fut = run(&socket, config, &pusher, &shutdown);
        tokio::select! {
            _ = run_fut => {},
            _ = tokio::time::sleep(Duration::from_millis(300)) => {
                shutdown.notify_one();
            }
        }

        let batches = pusher.batches.lock().unwrap();
        assert_eq!(batches.len(), 1);
        assert_eq!(batches[0], vec!["ccc".to_string()]);
    }

    #[tokio::test]
    async fn consecutive_failures_exceeding_max_errors_terminates_loop() {
        let dir = tempfile::tempdir().unwrap();
        let sock_path = dir.path().join("in.sock");
        let client_path = dir.path().join("client.sock");
        let socket = UnixDatagram::bind(&sock_path).unwrap();
        let client = UnixDatagram::bind(&client_path).unwrap();
        client.connect(&sock_path).unwrap();

        let pusher = RecordingPusher::new();
        *pusher.fail_next.lock().unwrap() = 10;
        let shutdown = Notify::new();

        client.send(b"a").unwrap();
        client.send(b"b").unwrap();

        let config = BatchConfig {
            batch_size: 1,
            batch_timeout: Duration::from_secs(10),
            idle_timeout: Duration::from_secs(10),
            max_errors: 2,
        };

        let result = run(&socket, config, &pusher, &shutdown).await;
        assert!(result.is_err());
    }
}
