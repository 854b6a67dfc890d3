mod cli;

use anyhow::{Context, Result};
use async_trait::async_trait;
use cache_push::closure::{self, PlannedPath};
use cache_push::config::{PushSettings, ServerSettings};
use cache_push::datagram::{self, PathPusher};
use cache_push::log_transcode::LogLocator;
use cache_push::narinfo::NarInfo;
use cache_push::nix_store::get_path_info_recursive;
use cache_push::object_key::ObjectKey;
use cache_push::pipeline::PartBufferPool;
use cache_push::scheduler::{self, UploadTask};
use cache_push::server_api::{PendingObject, ServerClient};
use cache_push::socket_activation::ActivatedSocket;
use cache_push::transport::Transport;
use clap::Parser;
use cli::{Cli, Commands, PinAction};
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::Notify;
use tracing::info;
use tracing_subscriber::EnvFilter;
use url::Url;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();

    match cli.command {
        cmd @ Commands::Push { .. } => {
            let invocation = cmd.into_push_invocation()?;
            push(&invocation.settings, &invocation.paths).await
        }
        cmd @ Commands::Listen { .. } => {
            let (push_settings, listen_settings) = cmd.into_listen_invocation()?;
            listen(push_settings, listen_settings).await
        }
        cmd @ Commands::Pin { .. } => {
            let (settings, action) = cmd.into_pin_invocation()?;
            pin(&settings, action).await
        }
    }
}

/// Push one or more store path closures: resolve the closure, negotiate
/// which objects the server still needs, upload them with bounded
/// concurrency, sign, and commit (spec §4.5-§4.7).
async fn push(settings: &PushSettings, paths: &[PathBuf]) -> Result<()> {
    let base_url = Url::parse(&settings.server_url).context("invalid server URL")?;
    let transport =
        Transport::with_rate_ceilings(settings.server_rate_limit, settings.storage_rate_limit)?;
    let server = ServerClient::with_transport(
        transport.clone(),
        base_url,
        settings.auth_token.as_str().to_string(),
    );

    let path_infos = get_path_info_recursive(paths)?;
    info!(n = path_infos.len(), "resolved closure");

    let top_level_paths: Vec<String> =
        paths.iter().map(|p| p.to_string_lossy().into_owned()).collect();
    let (all_objects, planned_paths, top_level_info_keys) =
        closure::plan_objects(&settings.store_dir, &top_level_paths, &path_infos)?;

    let all_objects_map: HashMap<String, closure::PlannedObject> =
        all_objects.into_iter().map(|o| (o.key.to_string(), o)).collect();

    let mut pending_objects: HashMap<String, PendingObject> = HashMap::new();
    let mut closure_ids = Vec::new();
    for info_key in &top_level_info_keys {
        let response =
            closure::negotiate_pending_closure(&server, info_key, &all_objects_map).await?;
        closure_ids.push(response.id);
        for (key, pending) in response.pending_objects {
            pending_objects.entry(key).or_insert(pending);
        }
    }
    info!(
        n_pending = pending_objects.len(),
        n_total = all_objects_map.len(),
        "negotiated pending objects"
    );

    let tasks = build_upload_tasks(&planned_paths, &pending_objects);
    info!(n_tasks = tasks.len(), "uploading");

    let part_pool = PartBufferPool::new();
    let log_locator = LogLocator::default();
    let records = scheduler::run(
        &transport,
        &server,
        &part_pool,
        &log_locator,
        tasks,
        settings.max_concurrent_uploads,
    )
    .await?;

    let metadata_map = scheduler::assemble_info_metadata(&planned_paths, &records, &settings.store_dir);
    let metadata_json: HashMap<String, serde_json::Value> = metadata_map
        .iter()
        .map(|(k, v)| Ok((k.clone(), serde_json::to_value(v)?)))
        .collect::<serde_json::Result<_>>()
        .context("serializing info metadata for signing")?;

    let mut signatures: HashMap<String, Vec<String>> = HashMap::new();
    for closure_id in &closure_ids {
        let response = server.sign_pending_closure(closure_id, &metadata_json).await?;
        signatures.extend(response.sigs);
    }

    for planned in &planned_paths {
        let Some(pending) = pending_objects.get(&planned.info_key) else { continue };
        let Some(url) = &pending.presigned_url else { continue };
        let Some(metadata) = metadata_map.get(&planned.info_key) else { continue };
        let sigs = signatures.get(&planned.info_key).cloned().unwrap_or_default();
        let rendered = NarInfo::new(metadata.clone(), sigs).render()?;
        transport.put_bytes(url, rendered.into_bytes(), Some("text/x-nix-info"), None).await?;
    }

    for closure_id in &closure_ids {
        server.complete_pending_closure(closure_id, &metadata_json).await?;
    }

    info!(n_closures = closure_ids.len(), "push completed");
    Ok(())
}

/// Walk every planned path and, for each object class with a pending
/// entry, build the scheduler task that satisfies it. The archive and its
/// coupled listing are scheduled together when both are pending; a
/// listing pending without its archive means the archive was already
/// deduplicated server-side and only a filesystem walk is needed.
fn build_upload_tasks(
    planned_paths: &[PlannedPath],
    pending_objects: &HashMap<String, PendingObject>,
) -> Vec<UploadTask> {
    let mut scheduled = HashSet::new();
    let mut tasks = Vec::new();

    for planned in planned_paths {
        let archive_key =
            ObjectKey::Archive { archive_hash: planned.archive_hash.clone(), ext: "nar.zst".to_string() }
                .to_string();
        let listing_key = planned
            .info_key
            .strip_suffix(".info")
            .map(|hash| format!("{hash}.ls"))
            .expect("info_key always ends in .info");

        let archive_pending = pending_objects.get(&archive_key).cloned();
        let listing_pending = pending_objects.get(&listing_key).cloned();

        match (archive_pending, listing_pending) {
            (Some(archive_pending), listing_pending) if scheduled.insert(archive_key.clone()) => {
                let listing_presigned_url = listing_pending.and_then(|pending| {
                    scheduled.insert(listing_key.clone());
                    pending.presigned_url
                });
                tasks.push(UploadTask::Archive {
                    planned: planned.clone(),
                    archive_object_key: archive_key,
                    archive_pending,
                    listing_presigned_url,
                    local_path: PathBuf::from(&planned.store_path),
                });
            }
            (None, Some(listing_pending)) if scheduled.insert(listing_key.clone()) => {
                if let Some(url) = listing_pending.presigned_url {
                    tasks.push(UploadTask::MetadataOnly {
                        archive_hash: planned.archive_hash.clone(),
                        listing_presigned_url: url,
                        local_path: PathBuf::from(&planned.store_path),
                    });
                }
            }
            _ => {}
        }

        if let Some(basename) = planned
            .deriver
            .as_deref()
            .and_then(|d| Path::new(d).file_name())
            .map(|n| n.to_string_lossy().into_owned())
        {
            let log_key = format!("log/{basename}");
            if let Some(pending) = pending_objects.get(&log_key) {
                if scheduled.insert(log_key) {
                    if let Some(url) = &pending.presigned_url {
                        tasks.push(UploadTask::Log {
                            derivation_basename: basename,
                            presigned_url: url.clone(),
                        });
                    }
                }
            }
        }

        if let Some(realisation) = &planned.realisation {
            let realisation_key =
                ObjectKey::Realisation { realisation_id: realisation.id.to_string() }.to_string();
            if let Some(pending) = pending_objects.get(&realisation_key) {
                if scheduled.insert(realisation_key) {
                    if let Some(url) = &pending.presigned_url {
                        tasks.push(UploadTask::Realisation {
                            realisation: cache_push::realisation::Realisation {
                                id: realisation.id.clone(),
                                out_path: realisation.out_path.clone(),
                                signatures: Vec::new(),
                                dependent_realisations: Vec::new(),
                            },
                            presigned_url: url.clone(),
                        });
                    }
                }
            }
        }
    }

    tasks
}

/// Drive the datagram ingest listener (spec §4.9): acquire the socket
/// (adopted via socket activation or freshly bound), then drain batches
/// until ctrl-c, pushing each batch through the same `push` path as the
/// one-shot command.
async fn listen(
    settings: PushSettings,
    listen_settings: cache_push::config::ListenSettings,
) -> Result<()> {
    let activated = ActivatedSocket::acquire(&listen_settings.socket_path)?;
    let config: datagram::BatchConfig = (&listen_settings).into();
    let shutdown = Arc::new(Notify::new());

    let shutdown_signal = {
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            let _ = tokio::signal::ctrl_c().await;
            shutdown.notify_one();
        })
    };

    let pusher = ScheduledPusher { settings };
    let result = datagram::run(&activated.socket, config, &pusher, &shutdown).await;
    shutdown_signal.abort();
    result
}

/// Dispatch a `pin` subcommand action against the coordinating server
/// (spec §6: `GET|POST|DELETE /api/pins[/{name}]`).
async fn pin(settings: &ServerSettings, action: PinAction) -> Result<()> {
    let base_url = Url::parse(&settings.server_url).context("invalid server URL")?;
    let server = ServerClient::new(base_url, settings.auth_token.as_str().to_string())?;

    match action {
        PinAction::List => {
            let pins = server.list_pins().await?;
            for p in &pins {
                println!("{}\t{}\t{}", p.name, p.closure, p.keep_until.as_deref().unwrap_or("-"));
            }
            info!(n = pins.len(), "listed pins");
        }
        PinAction::Set { name, closure, keep_until } => {
            let pin = server.set_pin(&name, &closure, keep_until.as_deref()).await?;
            info!(name = %pin.name, closure = %pin.closure, "pin set");
        }
        PinAction::Remove { name } => {
            server.delete_pin(&name).await?;
        }
    }

    Ok(())
}

struct ScheduledPusher {
    settings: PushSettings,
}

#[async_trait]
impl PathPusher for ScheduledPusher {
    async fn push(&self, paths: Vec<String>) -> Result<()> {
        let paths: Vec<PathBuf> = paths.into_iter().map(PathBuf::from).collect();
        push(&self.settings, &paths).await
    }
}
