//! Closure planning: turns a set of top-level store paths plus their
//! recursive path-info map into per-top-level pending-closure requests,
//! and exposes the task list the scheduler drains.

use crate::nix_store::NixPathInfo;
use crate::object_key::ObjectKey;
use crate::server_api::{PendingClosureObject, ServerClient};
use crate::store_path;
use anyhow::{Context, Result};
use std::collections::{HashMap, HashSet};
use std::path::Path;
use tracing::debug;

/// One object discovered while planning a closure, before the server has
/// told us whether it already exists.
#[derive(Debug, Clone)]
pub struct PlannedObject {
    pub key: ObjectKey,
    pub object_type: &'static str,
    pub refs: Vec<String>,
    pub nar_size: Option<u64>,
}

/// Everything the planner derived for one store path: its own info key,
/// the keys it needs uploaded, and path-specific facts the scheduler's
/// tasks will need later (deriver, ca, references).
#[derive(Debug, Clone)]
pub struct PlannedPath {
    pub store_path: String,
    pub info_key: String,
    pub archive_hash: String,
    pub nar_hash: String,
    pub nar_size: u64,
    pub deriver: Option<String>,
    pub ca: Option<String>,
    pub reference_info_keys: Vec<String>,
    /// Set when `info.deriver` carries a content-address record, i.e. this
    /// path has a realisation to plan and upload alongside it.
    pub realisation: Option<PlannedRealisation>,
}

/// A realisation derived while planning one path, ready for the scheduler
/// to marshal and upload once the output store path is known to be final.
#[derive(Debug, Clone)]
pub struct PlannedRealisation {
    pub id: crate::realisation::RealisationId,
    pub out_path: String,
}

/// Classify every path in the recursive closure info into objects, and
/// resolve `top_level_paths` to the info keys `negotiate_pending_closure`
/// should be called against.
///
/// `path_infos` must already contain the full recursive closure info for
/// every top-level path (spec §4.5 step 1 assumes an external
/// store-query collaborator already ran) — every entry in it is planned,
/// not just the literal top-level inputs, since references need their own
/// archive/listing/info objects too.
pub fn plan_objects(
    store_dir: &str,
    top_level_paths: &[String],
    path_infos: &HashMap<String, NixPathInfo>,
) -> Result<(Vec<PlannedObject>, Vec<PlannedPath>, Vec<String>)> {
    let mut objects: HashMap<String, PlannedObject> = HashMap::new();
    let mut planned_paths = Vec::new();

    for (resolved_str, info) in path_infos {
        let (path_objects, planned) = plan_single_path(store_dir, resolved_str, info, path_infos)?;
        for obj in path_objects {
            objects.entry(obj.key.to_string()).or_insert(obj);
        }
        planned_paths.push(planned);
    }

    let mut top_level_info_keys = Vec::with_capacity(top_level_paths.len());
    for raw_path in top_level_paths {
        let resolved = std::fs::canonicalize(raw_path)
            .with_context(|| format!("path-missing: {raw_path}"))?;
        let resolved_str = resolved.to_string_lossy().into_owned();
        if !path_infos.contains_key(&resolved_str) {
            anyhow::bail!("path-missing: no path-info for {resolved_str}");
        }
        let parsed = store_path::parse(store_dir, Path::new(&resolved_str)).context("input-invalid")?;
        top_level_info_keys.push(ObjectKey::Info { hash: parsed.hash }.to_string());
    }

    Ok((objects.into_values().collect(), planned_paths, top_level_info_keys))
}

fn plan_single_path(
    store_dir: &str,
    path: &str,
    info: &NixPathInfo,
    path_infos: &HashMap<String, NixPathInfo>,
) -> Result<(Vec<PlannedObject>, PlannedPath)> {
    let parsed_path =
        store_path::parse(store_dir, Path::new(path)).context("input-invalid")?;
    let archive_hash = info.nar_hash.to_nix32_string()?;

    let info_key = ObjectKey::Info { hash: parsed_path.hash.clone() }.to_string();
    let listing_key = ObjectKey::Listing { hash: parsed_path.hash.clone() };
    let archive_ext = "nar.zst";
    let archive_key =
        ObjectKey::Archive { archive_hash: archive_hash.clone(), ext: archive_ext.to_string() };

    let mut refs: Vec<String> = info
        .references
        .iter()
        .filter(|r| r.as_str() != path)
        .map(|r| {
            let ref_path = store_path::parse(store_dir, Path::new(r))?;
            Ok(ObjectKey::Info { hash: ref_path.hash }.to_string())
        })
        .collect::<Result<Vec<_>>>()?;
    refs.push(archive_key.to_string());
    refs.push(listing_key.to_string());
    refs.sort();
    refs.dedup();

    let mut objects = vec![
        PlannedObject {
            key: ObjectKey::Info { hash: parsed_path.hash.clone() },
            object_type: "info",
            refs: refs.clone(),
            nar_size: None,
        },
        PlannedObject {
            key: archive_key,
            object_type: "archive",
            refs: Vec::new(),
            nar_size: Some(info.nar_size),
        },
        PlannedObject { key: listing_key, object_type: "listing", refs: Vec::new(), nar_size: None },
    ];

    let mut deriver_basename = None;
    if let Some(deriver) = &info.deriver {
        let basename = Path::new(deriver).file_name().map(|n| n.to_string_lossy().into_owned());
        if let Some(basename) = basename {
            objects.push(PlannedObject {
                key: ObjectKey::Log { derivation_basename: basename.clone() },
                object_type: "log",
                refs: Vec::new(),
                nar_size: None,
            });
            deriver_basename = Some(basename);
        }
    }

    // A content-address record means this output is realised from a
    // content-addressed derivation; plan a realisation record alongside it.
    // The derivation JSON itself isn't fetched here (out of scope, spec §1),
    // so the output name defaults to "out" rather than being read from it.
    let realisation = match (&info.ca, &deriver_basename) {
        (Some(_), Some(basename)) => {
            let drv_hash = basename.trim_end_matches(".drv").to_string();
            let id = crate::realisation::RealisationId::new(&drv_hash, "out");
            let realisation_key = ObjectKey::Realisation { realisation_id: id.to_string() }.to_string();
            objects.push(PlannedObject {
                key: ObjectKey::Realisation { realisation_id: id.to_string() },
                object_type: "realisation",
                refs: Vec::new(),
                nar_size: None,
            });
            if let Some(info_obj) = objects.iter_mut().find(|o| o.object_type == "info") {
                info_obj.refs.push(realisation_key);
                info_obj.refs.sort();
                info_obj.refs.dedup();
            }
            Some(PlannedRealisation { id, out_path: path.to_string() })
        }
        _ => None,
    };

    debug!(path, n_objects = objects.len(), "planned path");

    let reference_info_keys: Vec<String> = info
        .references
        .iter()
        .filter(|r| r.as_str() != path)
        .filter_map(|r| path_infos.get(r).map(|_| r.clone()))
        .collect();

    let planned = PlannedPath {
        store_path: path.to_string(),
        info_key,
        nar_hash: archive_hash.clone(),
        nar_size: info.nar_size,
        archive_hash,
        deriver: info.deriver.clone(),
        ca: info.ca.clone(),
        reference_info_keys,
        realisation,
    };

    Ok((objects, planned))
}

/// Compute the reachable object set for one top-level path via DFS over
/// the reference edges of `all_objects` (keyed by object key string),
/// and submit a pending-closure request for exactly that set.
pub async fn negotiate_pending_closure(
    server: &ServerClient,
    top_level_info_key: &str,
    all_objects: &HashMap<String, PlannedObject>,
) -> Result<crate::server_api::CreatePendingClosureResponse> {
    let reachable = reachable_keys(top_level_info_key, all_objects);

    let objects: Vec<PendingClosureObject> = reachable
        .into_iter()
        .filter_map(|key| all_objects.get(&key))
        .map(|obj| PendingClosureObject {
            key: obj.key.to_string(),
            object_type: obj.object_type.to_string(),
            refs: obj.refs.clone(),
            nar_size: obj.nar_size,
        })
        .collect();

    server.create_pending_closure(top_level_info_key.to_string(), objects).await
}

fn reachable_keys(root: &str, all_objects: &HashMap<String, PlannedObject>) -> HashSet<String> {
    let mut seen = HashSet::new();
    let mut stack = vec![root.to_string()];

    while let Some(key) = stack.pop() {
        if !seen.insert(key.clone()) {
            continue;
        }
        if let Some(obj) = all_objects.get(&key) {
            for r in &obj.refs {
                if !seen.contains(r) {
                    stack.push(r.clone());
                }
            }
        }
    }

    seen
}

#[cfg(test)]
mod tests {
    use super::*;

    fn obj(key: &str, refs: &[&str]) -> (String, PlannedObject) {
        (
            key.to_string(),
            PlannedObject {
                key: ObjectKey::Info { hash: key.trim_end_matches(".info").to_string() },
                object_type: "info",
                refs: refs.iter().map(|s| s.to_string()).collect(),
                nar_size: None,
            },
        )
    }

    #[test]
    fn reachable_keys_follows_references_transitively() {
        let all: HashMap<String, PlannedObject> = [
            obj("a.info", &["b.info", "a.archive"]),
            obj("b.info", &["c.info"]),
            obj("c.info", &[]),
            obj("a.archive", &[]),
        ]
        .into_iter()
        .collect();

        let reachable = reachable_keys("a.info", &all);
        assert!(reachable.contains("a.info"));
        assert!(reachable.contains("b.info"));
        assert!(reachable.contains("c.info"));
        assert!(reachable.contains("a.archive"));
    }

    #[test]
    fn reachable_keys_handles_self_reference_without_looping() {
        let all: HashMap<String, PlannedObject> =
            [obj("a.info", &["a.info", "a.archive"]), obj("a.archive", &[])].into_iter().collect();

        let reachable = reachable_keys("a.info", &all);
        assert_eq!(reachable.len(), 2);
    }
}
