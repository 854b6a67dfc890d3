//! Object keys: the five classes of cacheable artifact named in the data
//! model (info, listing, archive, log, realisation).

use std::fmt;

/// One cacheable artifact, keyed the way the server expects.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ObjectKey {
    /// `<hash>.info` — metadata file for a store path.
    Info { hash: String },
    /// `<hash>.ls` — compressed structural listing of the archive.
    Listing { hash: String },
    /// `archive/<archive-hash>.<ext>` — compressed archive bytes, keyed by
    /// archive digest (content-addressed, shared across duplicate paths).
    Archive { archive_hash: String, ext: String },
    /// `log/<derivation-basename>` — compressed build log.
    Log { derivation_basename: String },
    /// `realisations/<realisation-id>.doi` — realisation record.
    Realisation { realisation_id: String },
}

impl fmt::Display for ObjectKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ObjectKey::Info { hash } => write!(f, "{hash}.info"),
            ObjectKey::Listing { hash } => write!(f, "{hash}.ls"),
            ObjectKey::Archive { archive_hash, ext } => write!(f, "archive/{archive_hash}.{ext}"),
            ObjectKey::Log { derivation_basename } => write!(f, "log/{derivation_basename}"),
            ObjectKey::Realisation { realisation_id } => {
                write!(f, "realisations/{realisation_id}.doi")
            }
        }
    }
}

impl ObjectKey {
    /// Parse a key string back into its typed form. Unknown shapes map to
    /// `None` rather than erroring — callers treat those as opaque/ignored.
    pub fn parse(key: &str) -> Option<ObjectKey> {
        if let Some(hash) = key.strip_suffix(".info") {
            return Some(ObjectKey::Info { hash: hash.to_string() });
        }
        if let Some(hash) = key.strip_suffix(".ls") {
            return Some(ObjectKey::Listing { hash: hash.to_string() });
        }
        if let Some(rest) = key.strip_prefix("archive/") {
            let (archive_hash, ext) = rest.split_once('.')?;
            return Some(ObjectKey::Archive {
                archive_hash: archive_hash.to_string(),
                ext: ext.to_string(),
            });
        }
        if let Some(derivation_basename) = key.strip_prefix("log/") {
            return Some(ObjectKey::Log {
                derivation_basename: derivation_basename.to_string(),
            });
        }
        if let Some(rest) = key.strip_prefix("realisations/") {
            let realisation_id = rest.strip_suffix(".doi")?;
            return Some(ObjectKey::Realisation {
                realisation_id: realisation_id.to_string(),
            });
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_all_classes() {
        let keys = vec![
            ObjectKey::Info { hash: "abc".into() },
            ObjectKey::Listing { hash: "abc".into() },
            ObjectKey::Archive { archive_hash: "def".into(), ext: "nar.zst".into() },
            ObjectKey::Log { derivation_basename: "foo.drv".into() },
            ObjectKey::Realisation { realisation_id: "sha256:abc!out".into() },
        ];

        for key in keys {
            let s = key.to_string();
            let parsed = ObjectKey::parse(&s).expect("should parse back");
            assert_eq!(parsed, key);
        }
    }
}
