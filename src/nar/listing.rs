//! The structural listing tree produced alongside (or independently of) an
//! archive serialization.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Compression label a listing may be stored under. Only `Zstd` is ever
/// *produced* by this implementation; `Brotli` is accepted on decode since
/// other producers in the ecosystem use it (documented open question).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ListingCompression {
    Zstd,
    Br,
}

impl ListingCompression {
    pub fn label(self) -> &'static str {
        match self {
            ListingCompression::Zstd => "zstd",
            ListingCompression::Br => "br",
        }
    }
}

/// A tagged tree mirroring the archive's structure, enabling targeted reads
/// without decoding the whole archive.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ListingNode {
    Regular {
        size: u64,
        #[serde(default, skip_serializing_if = "is_false")]
        executable: bool,
        #[serde(rename = "narOffset")]
        nar_offset: u64,
    },
    Directory {
        entries: BTreeMap<String, ListingNode>,
    },
    Symlink {
        target: String,
    },
}

fn is_false(b: &bool) -> bool {
    !*b
}

/// Top-level listing document: version tag plus root node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Listing {
    pub version: u32,
    pub root: ListingNode,
}

impl Listing {
    pub fn new(root: ListingNode) -> Self {
        Self { version: 1, root }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn serializes_with_version_tag() {
        let listing = Listing::new(ListingNode::Symlink { target: "foo".into() });
        let json = serde_json::to_value(&listing).unwrap();
        assert_eq!(json["version"], 1);
        assert_eq!(json["root"]["type"], "symlink");
    }

    #[test]
    fn regular_entry_omits_executable_when_false() {
        let node = ListingNode::Regular { size: 10, executable: false, nar_offset: 128 };
        let json = serde_json::to_value(&node).unwrap();
        assert!(json.get("executable").is_none());
    }
}
