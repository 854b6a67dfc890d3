//! Unified upload scheduler: drains a mixed task queue with bounded
//! concurrency, using the same `stream::iter().buffer_unordered()`
//! pattern the push command already used for plain NAR uploads, now
//! generalized across all four task kinds. Fail-fast: the first task
//! error is captured, but every task still runs to completion so the
//! worker pool never deadlocks waiting on an unbuffered channel.

use crate::closure::PlannedPath;
use crate::compress::CompressorPool;
use crate::log_transcode::{self, LogLocator};
use crate::narinfo::InfoMetadata;
use crate::nar::listing::ListingCompression;
use crate::nix_base32;
use crate::pipeline::{self, CompressedObjectRecord, PartBufferPool};
use crate::realisation::Realisation;
use crate::server_api::{MultipartInfo, PendingObject, ServerClient};
use crate::transport::Transport;
use anyhow::{Context, Result};
use futures::stream::{self, StreamExt};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Mutex;
use tracing::{info, warn};

/// Where to put the bytes for one non-multipart object.
enum UploadTarget {
    Single(String),
    Multipart { object_key: String, upload_id: String, part_urls: Vec<String> },
}

impl UploadTarget {
    fn from_pending(object_key: &str, pending: &PendingObject) -> Result<Self> {
        if let Some(info) = &pending.multipart_info {
            return Ok(UploadTarget::Multipart {
                object_key: object_key.to_string(),
                upload_id: info.upload_id.clone(),
                part_urls: info.part_urls.clone(),
            });
        }
        if let Some(url) = &pending.presigned_url {
            return Ok(UploadTarget::Single(url.clone()));
        }
        anyhow::bail!("protocol-unexpected: pending object for {object_key} has neither url nor multipart info")
    }
}

pub enum UploadTask {
    /// Stream serialize+compress+multipart-upload the archive, then
    /// (same worker) upload its coupled listing.
    Archive {
        planned: PlannedPath,
        archive_object_key: String,
        archive_pending: PendingObject,
        /// `None` when the listing was already uploaded (or never
        /// pending), so only the archive itself needs writing.
        listing_presigned_url: Option<String>,
        local_path: PathBuf,
    },
    /// Archive was deduplicated server-side: walk the filesystem for a
    /// listing and upload just that.
    MetadataOnly {
        archive_hash: String,
        listing_presigned_url: String,
        local_path: PathBuf,
    },
    Log {
        derivation_basename: String,
        presigned_url: String,
    },
    Realisation {
        realisation: Realisation,
        presigned_url: String,
    },
}

type RecordMap = Mutex<HashMap<String, CompressedObjectRecord>>;

/// Run every task with bounded concurrency, returning compressed-object
/// records keyed by archive hash. The first error encountered (if any)
/// is returned after all tasks finish.
pub async fn run(
    transport: &Transport,
    server: &ServerClient,
    part_pool: &PartBufferPool,
    log_locator: &LogLocator,
    tasks: Vec<UploadTask>,
    max_concurrent: usize,
) -> Result<HashMap<String, CompressedObjectRecord>> {
    let records: RecordMap = Mutex::new(HashMap::new());
    let compressor_pool = CompressorPool::new();

    let results: Vec<Result<()>> = stream::iter(tasks)
        .map(|task| run_one(transport, server, part_pool, log_locator, &compressor_pool, &records, task))
        .buffer_unordered(max_concurrent.max(1))
        .collect()
        .await;

    let mut first_error = None;
    for result in results {
        if let Err(err) = result {
            warn!(%err, "task failed");
            if first_error.is_none() {
                first_error = Some(err);
            }
        }
    }

    if let Some(err) = first_error {
        return Err(err);
    }

    Ok(records.into_inner().unwrap())
}

async fn run_one(
    transport: &Transport,
    server: &ServerClient,
    part_pool: &PartBufferPool,
    log_locator: &LogLocator,
    compressor_pool: &CompressorPool,
    records: &RecordMap,
    task: UploadTask,
) -> Result<()> {
    match task {
        UploadTask::Archive {
            planned,
            archive_object_key,
            archive_pending,
            listing_presigned_url,
            local_path,
        } => {
            let target = UploadTarget::from_pending(&archive_object_key, &archive_pending)?;
            let result = match target {
                UploadTarget::Single(url) => {
                    let bytes = serialize_and_compress(compressor_pool, &local_path).await?;
                    let hash = content_hash(&bytes.compressed);
                    transport
                        .put_bytes(&url, bytes.compressed.clone(), Some("application/x-nix-archive"), None)
                        .await?;
                    CompressedObjectRecord {
                        compressed_size: bytes.compressed.len() as u64,
                        compressed_hash: hash,
                        listing: Some(bytes.listing),
                    }
                }
                UploadTarget::Multipart { object_key, upload_id, part_urls } => {
                    let outcome = pipeline::upload_archive(
                        transport,
                        server,
                        part_pool,
                        &object_key,
                        &upload_id,
                        part_urls,
                        &local_path,
                    )
                    .await?;
                    outcome.record
                }
            };

            records.lock().unwrap().insert(planned.archive_hash.clone(), result);

            if let Some(listing_presigned_url) = listing_presigned_url {
                let listing =
                    records.lock().unwrap().get(&planned.archive_hash).and_then(|r| r.listing.clone());
                if let Some(listing) = listing {
                    upload_listing(transport, compressor_pool, &listing_presigned_url, &listing).await?;
                }
            }
            Ok(())
        }

        UploadTask::MetadataOnly { archive_hash, listing_presigned_url, local_path } => {
            let listing = crate::nar::walk_listing(&local_path).await?;
            upload_listing(transport, compressor_pool, &listing_presigned_url, &listing).await?;

            let mut map = records.lock().unwrap();
            map.entry(archive_hash).or_insert_with(|| CompressedObjectRecord {
                compressed_size: 0,
                compressed_hash: String::new(),
                listing: Some(listing),
            });
            Ok(())
        }

        UploadTask::Log { derivation_basename, presigned_url } => {
            match log_transcode::locate_and_transcode(log_locator, &derivation_basename, compressor_pool).await? {
                Some(bytes) => {
                    transport
                        .put_bytes(&presigned_url, bytes, Some("text/plain"), Some("zstd"))
                        .await?;
                    info!(derivation_basename, "uploaded build log");
                }
                None => {
                    // Non-fatal: absence of a log is documented, not an error.
                }
            }
            Ok(())
        }

        UploadTask::Realisation { realisation, presigned_url } => {
            let bytes = realisation.to_json_bytes().context("marshalling realisation")?;
            let compressed =
                compressor_pool.compress_buffered(&bytes).await.context("compressing realisation")?;
            transport
                .put_bytes(&presigned_url, compressed, Some("application/json"), Some("zstd"))
                .await?;
            Ok(())
        }
    }
}

struct SerializedArchive {
    compressed: Vec<u8>,
    listing: crate::nar::listing::Listing,
}

/// Non-multipart path: small archives go through a plain buffered
/// compress rather than the streaming pipeline.
async fn serialize_and_compress(
    pool: &CompressorPool,
    path: &std::path::Path,
) -> Result<SerializedArchive> {
    let mut nar_bytes = Vec::new();
    let listing = crate::nar::dump_path_with_listing(&mut nar_bytes, path).await?;
    let compressed = pool.compress_buffered(&nar_bytes).await.context("compressing archive")?;
    Ok(SerializedArchive { compressed, listing })
}

fn content_hash(bytes: &[u8]) -> String {
    use sha2::{Digest, Sha256};
    let hash = Sha256::digest(bytes);
    format!("sha256:{}", nix_base32::encode(&hash))
}

async fn upload_listing(
    transport: &Transport,
    pool: &CompressorPool,
    url: &str,
    listing: &crate::nar::listing::Listing,
) -> Result<()> {
    let json = serde_json::to_vec(listing).context("serializing listing")?;
    let compressed = pool.compress_buffered(&json).await.context("compressing listing")?;
    transport
        .put_bytes(url, compressed, Some("application/json"), Some(ListingCompression::Zstd.label()))
        .await
}

/// Assemble the per-info-key metadata map once all uploads have joined,
/// ready to be sent to the server's sign endpoint.
pub fn assemble_info_metadata(
    planned_paths: &[PlannedPath],
    records: &HashMap<String, CompressedObjectRecord>,
    store_dir: &str,
) -> HashMap<String, InfoMetadata> {
    let mut out = HashMap::new();

    for planned in planned_paths {
        let Some(record) = records.get(&planned.archive_hash) else { continue };

        let references: Vec<String> = {
            let mut refs: Vec<String> = planned
                .reference_info_keys
                .iter()
                .map(|p| p.strip_prefix(store_dir).unwrap_or(p).trim_start_matches('/').to_string())
                .map(|p| p.split('/').next_back().unwrap_or(&p).to_string())
                .collect();
            refs.sort();
            refs.dedup();
            refs
        };

        let metadata = InfoMetadata {
            store_path: planned.store_path.clone(),
            url: format!("archive/{}.nar.zst", planned.archive_hash),
            compression: crate::compress::ARCHIVE_COMPRESSION_LABEL.to_string(),
            nar_hash: planned.nar_hash.clone(),
            nar_size: planned.nar_size,
            file_hash: record.compressed_hash.clone(),
            file_size: record.compressed_size,
            references,
            deriver: planned.deriver.clone(),
            ca: planned.ca.clone(),
        };

        out.insert(planned.info_key.clone(), metadata);
    }

    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn upload_target_prefers_multipart_when_present() {
        let pending = PendingObject {
            object_type: "archive".to_string(),
            presigned_url: None,
            multipart_info: Some(MultipartInfo {
                upload_id: "u1".to_string(),
                part_urls: vec!["http://x/1".to_string()],
            }),
        };
        let target = UploadTarget::from_pending("archive/abc.nar.zst", &pending).unwrap();
        assert!(matches!(target, UploadTarget::Multipart { .. }));
    }

    #[test]
    fn upload_target_falls_back_to_single() {
        let pending = PendingObject {
            object_type: "listing".to_string(),
            presigned_url: Some("http://x".to_string()),
            multipart_info: None,
        };
        let target = UploadTarget::from_pending("abc.ls", &pending).unwrap();
        assert!(matches!(target, UploadTarget::Single(_)));
    }

    #[test]
    fn upload_target_rejects_pending_object_without_either() {
        let pending =
            PendingObject { object_type: "info".to_string(), presigned_url: None, multipart_info: None };
        assert!(UploadTarget::from_pending("abc.info", &pending).is_err());
    }
}
