//! Build-log location and transcoding: locate a derivation's build log on
//! disk, decompress it if stored in the legacy form, and recompress to
//! the archive codec before upload.

use crate::compress::CompressorPool;
use anyhow::{Context, Result};
use async_compression::tokio::bufread::BzDecoder;
use std::path::{Path, PathBuf};
use tokio::io::{AsyncReadExt, BufReader};
use tracing::warn;

/// Decompressed logs larger than this are rejected rather than buffered,
/// to resist decompression bombs (spec-mandated 1 GiB bound).
const MAX_DECOMPRESSED_LOG_SIZE: u64 = 1024 * 1024 * 1024;

/// Where Nix stores build logs, keyed by the first two characters of the
/// derivation's hash (mirroring `/nix/var/log/nix/drvs/<xx>/<rest>`).
pub struct LogLocator {
    pub log_dir: PathBuf,
}

impl Default for LogLocator {
    fn default() -> Self {
        Self { log_dir: PathBuf::from("/nix/var/log/nix/drvs") }
    }
}

enum LogForm {
    Bzip2,
    Zstd,
    Plain,
}

impl LogLocator {
    pub fn new(log_dir: PathBuf) -> Self {
        Self { log_dir }
    }

    /// Locate the on-disk log file for a derivation basename (e.g.
    /// `abc123-hello-2.12.2.drv`), trying each known storage form. Returns
    /// `None` if no candidate exists; callers treat a missing log as
    /// non-fatal.
    pub fn locate(&self, derivation_basename: &str) -> Option<PathBuf> {
        let hash_prefix = derivation_basename.get(0..2)?;
        let bucket = self.log_dir.join(hash_prefix);

        for suffix in [".bz2", ".zst", ""] {
            let candidate = bucket.join(format!("{derivation_basename}{suffix}"));
            if candidate.exists() {
                return Some(candidate);
            }
        }
        None
    }
}

fn classify(path: &Path) -> LogForm {
    match path.extension().and_then(|e| e.to_str()) {
        Some("bz2") => LogForm::Bzip2,
        Some("zst") => LogForm::Zstd,
        _ => LogForm::Plain,
    }
}

/// Read the log at `path`, decompressing it if stored in the legacy
/// bzip2 form, and return it recompressed with the archive codec via the
/// shared compressor pool. If the log is already zstd-compressed it is
/// read through unchanged; if plain text it is compressed fresh.
pub async fn transcode_log(path: &Path, pool: &CompressorPool) -> Result<Vec<u8>> {
    let file = tokio::fs::File::open(path)
        .await
        .with_context(|| format!("opening log {}", path.display()))?;
    let mut reader = BufReader::new(file);

    match classify(path) {
        LogForm::Zstd => {
            let mut buf = Vec::new();
            reader.read_to_end(&mut buf).await.context("reading already-zstd log")?;
            Ok(buf)
        }
        LogForm::Bzip2 => {
            let decoder = BzDecoder::new(reader);
            let decompressed = read_bounded(decoder).await.context("decompressing legacy log")?;
            pool.compress_buffered(&decompressed).await.context("compressing log")
        }
        LogForm::Plain => {
            let decompressed =
                read_bounded(reader).await.context("reading plain-text log")?;
            pool.compress_buffered(&decompressed).await.context("compressing log")
        }
    }
}

async fn read_bounded<R: tokio::io::AsyncRead + Unpin>(mut reader: R) -> Result<Vec<u8>> {
    let mut out = Vec::new();
    let mut limited = (&mut reader).take(MAX_DECOMPRESSED_LOG_SIZE + 1);
    limited.read_to_end(&mut out).await.context("reading decompressed log stream")?;
    if out.len() as u64 > MAX_DECOMPRESSED_LOG_SIZE {
        anyhow::bail!("io-failed: decompressed log exceeds {MAX_DECOMPRESSED_LOG_SIZE} bytes");
    }
    Ok(out)
}

/// Locate and transcode a derivation's log; returns `None` (logged, not
/// an error) if no log file exists anywhere the locator checks.
pub async fn locate_and_transcode(
    locator: &LogLocator,
    derivation_basename: &str,
    pool: &CompressorPool,
) -> Result<Option<Vec<u8>>> {
    let Some(path) = locator.locate(derivation_basename) else {
        warn!(derivation_basename, "no build log found, skipping");
        return Ok(None);
    };
    Ok(Some(transcode_log(&path, pool).await?))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[tokio::test]
    async fn locate_returns_none_for_missing_log() {
        let dir = tempdir().unwrap();
        let locator = LogLocator::new(dir.path().to_path_buf());
        assert!(locator.locate("abc123-hello.drv").is_none());
    }

    #[tokio::test]
    async fn locate_finds_plain_log_in_bucket() {
        let dir = tempdir().unwrap();
        let bucket = dir.path().join("ab");
        tokio::fs::create_dir_all(&bucket).await.unwrap();
        let log_path = bucket.join("abc123-hello.drv");
        tokio::fs::write(&log_path, b"build output").await.unwrap();

        let locator = LogLocator::new(dir.path().to_path_buf());
        let found = locator.locate("abc123-hello.drv").unwrap();
        assert_eq!(found, log_path);
    }

    #[tokio::test]
    async fn transcodes_plain_text_log_to_zstd() {
        let dir = tempdir().unwrap();
        let log_path = dir.path().join("build.log");
        tokio::fs::write(&log_path, b"hello from the build").await.unwrap();

        let compressed = transcode_log(&log_path, &CompressorPool::new()).await.unwrap();
        let decoded = zstd::stream::decode_all(&compressed[..]).unwrap();
        assert_eq!(decoded, b"hello from the build");
    }

    #[tokio::test]
    async fn transcodes_legacy_bzip2_log_to_zstd() {
        use async_compression::tokio::bufread::BzEncoder;

        let dir = tempdir().unwrap();
        let log_path = dir.path().join("build.log.bz2");

        let mut bz_encoder = BzEncoder::new(BufReader::new(&b"legacy build output"[..]));
        let mut compressed_input = Vec::new();
        tokio::io::AsyncReadExt::read_to_end(&mut bz_encoder, &mut compressed_input)
            .await
            .unwrap();
        tokio::fs::write(&log_path, &compressed_input).await.unwrap();

        let recompressed = transcode_log(&log_path, &CompressorPool::new()).await.unwrap();
        let decoded = zstd::stream::decode_all(&recompressed[..]).unwrap();
        assert_eq!(decoded, b"legacy build output");
    }
}
