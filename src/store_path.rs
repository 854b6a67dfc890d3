//! Parsing and validation of Nix store paths.
//!
//! A store path's basename is `<hash>-<name>` where `<hash>` is a
//! 32-character digest over the restricted nix32 alphabet.

use crate::error::PushError;
use std::path::Path;

pub const NIX_BASE32_ALPHABET: &[u8] = b"0123456789abcdfghijklmnpqrsvwxyz";
const HASH_LEN: usize = 32;

/// A parsed store path: the store directory it lives under, its hash, and
/// its human-readable name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StorePath {
    pub store_dir: String,
    pub hash: String,
    pub name: String,
}

impl StorePath {
    pub fn full_path(&self) -> String {
        format!("{}/{}-{}", self.store_dir, self.hash, self.name)
    }
}

fn is_valid_hash(hash: &str) -> bool {
    hash.len() == HASH_LEN && hash.bytes().all(|b| NIX_BASE32_ALPHABET.contains(&b))
}

/// Parse an absolute store path under `store_dir` into its hash/name parts.
///
/// Fails with `input-invalid` if the basename does not match
/// `<32-char-hash>-<name>` drawn from the restricted alphabet.
pub fn parse(store_dir: &str, path: &Path) -> Result<StorePath, PushError> {
    let basename = path
        .file_name()
        .and_then(|n| n.to_str())
        .ok_or_else(|| PushError::InputInvalid(format!("not a valid path: {}", path.display())))?;

    let (hash, name) = basename
        .split_once('-')
        .ok_or_else(|| PushError::InputInvalid(format!("malformed store path basename: {basename}")))?;

    if !is_valid_hash(hash) {
        return Err(PushError::InputInvalid(format!(
            "invalid-path: hash '{hash}' is not 32 nix32 characters"
        )));
    }

    if name.is_empty() {
        return Err(PushError::InputInvalid(format!(
            "invalid-path: empty name in '{basename}'"
        )));
    }

    Ok(StorePath {
        store_dir: store_dir.to_string(),
        hash: hash.to_string(),
        name: name.to_string(),
    })
}

/// Extract just the hash portion of a store path string, e.g.
/// `/nix/store/abc...-foo` -> `abc...`.
pub fn hash_from_path(store_path: &str) -> Result<String, PushError> {
    let path = Path::new(store_path);
    let basename = path
        .file_name()
        .and_then(|n| n.to_str())
        .ok_or_else(|| PushError::InputInvalid(format!("invalid-path: {store_path}")))?;

    let hash = basename
        .split_once('-')
        .map(|(h, _)| h)
        .ok_or_else(|| PushError::InputInvalid(format!("invalid-path: {store_path}")))?;

    if !is_valid_hash(hash) {
        return Err(PushError::InputInvalid(format!(
            "invalid-path: hash '{hash}' is not 32 nix32 characters"
        )));
    }

    Ok(hash.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_valid_store_path() {
        let p = parse(
            "/nix/store",
            Path::new("/nix/store/8ha1dhmx807czjczmwy078s4r9s254il-hello-2.12.2"),
        )
        .unwrap();
        assert_eq!(p.hash, "8ha1dhmx807czjczmwy078s4r9s254il");
        assert_eq!(p.name, "hello-2.12.2");
        assert_eq!(p.full_path(), "/nix/store/8ha1dhmx807czjczmwy078s4r9s254il-hello-2.12.2");
    }

    #[test]
    fn rejects_wrong_length_hash() {
        let err = parse("/nix/store", Path::new("/nix/store/short-hash-name")).unwrap_err();
        assert!(matches!(err, PushError::InputInvalid(_)));
    }

    #[test]
    fn rejects_excluded_letters() {
        // 'e', 'o', 't', 'u' are excluded from the nix32 alphabet.
        let bogus = "e".repeat(32);
        let err = parse("/nix/store", Path::new(&format!("/nix/store/{bogus}-name"))).unwrap_err();
        assert!(matches!(err, PushError::InputInvalid(_)));
    }

    #[test]
    fn hash_from_path_extracts_hash() {
        let hash = hash_from_path("/nix/store/3n58xw4373jp0ljirf06d8077j15pc4j-glibc-2.37-8").unwrap();
        assert_eq!(hash, "3n58xw4373jp0ljirf06d8077j15pc4j");
    }
}
