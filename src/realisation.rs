//! Realisation records: the mapping from a content-addressed derivation
//! output identifier to the store path that realises it.

use serde::{Deserialize, Serialize};

/// `<derivation-hash>!<output-name>`, e.g. `sha256:abc...!out`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RealisationId(pub String);

impl RealisationId {
    pub fn new(drv_hash: &str, output_name: &str) -> Self {
        Self(format!("{drv_hash}!{output_name}"))
    }
}

impl std::fmt::Display for RealisationId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Structured realisation record, marshalled as JSON before compression
/// and upload under `realisations/<id>.doi`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Realisation {
    pub id: RealisationId,
    pub out_path: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub signatures: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub dependent_realisations: Vec<RealisationId>,
}

impl Realisation {
    pub fn to_json_bytes(&self) -> serde_json::Result<Vec<u8>> {
        serde_json::to_vec(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn id_formats_as_drv_hash_bang_output() {
        let id = RealisationId::new("sha256:abc", "out");
        assert_eq!(id.to_string(), "sha256:abc!out");
    }

    #[test]
    fn marshals_without_empty_optional_fields() {
        let r = Realisation {
            id: RealisationId::new("sha256:abc", "out"),
            out_path: "/nix/store/def-pkg".to_string(),
            signatures: Vec::new(),
            dependent_realisations: Vec::new(),
        };
        let bytes = r.to_json_bytes().unwrap();
        let value: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert!(value.get("signatures").is_none());
        assert!(value.get("dependentRealisations").is_none());
        assert_eq!(value["outPath"], "/nix/store/def-pkg");
    }

    #[test]
    fn round_trips_through_json() {
        let r = Realisation {
            id: RealisationId::new("sha256:abc", "out"),
            out_path: "/nix/store/def-pkg".to_string(),
            signatures: vec!["cache:sig".to_string()],
            dependent_realisations: vec![RealisationId::new("sha256:xyz", "out")],
        };
        let bytes = r.to_json_bytes().unwrap();
        let parsed: Realisation = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(parsed.id, r.id);
        assert_eq!(parsed.signatures, r.signatures);
    }
}
