//! Assembly of the textual info-file format: a bit-exact header block per
//! store path, synthesised from collected metadata plus signatures
//! obtained from the coordinating server.

use anyhow::Result;
use serde::Serialize;
use std::fmt::Write as FmtWrite;

/// Per-path metadata collected by the scheduler after uploads complete,
/// ahead of signing. Sent to the server's sign endpoint as JSON; the
/// server returns signatures keyed the same way.
#[derive(Debug, Clone, Serialize)]
pub struct InfoMetadata {
    pub store_path: String,
    pub url: String,
    pub compression: String,
    pub nar_hash: String,
    pub nar_size: u64,
    pub file_hash: String,
    pub file_size: u64,
    /// Sorted, store-directory-prefix-stripped reference basenames.
    pub references: Vec<String>,
    pub deriver: Option<String>,
    pub ca: Option<String>,
}

/// `InfoMetadata` plus the signatures the server returned for it. Renders
/// to the exact header-line order and formatting consumers expect.
#[derive(Debug, Clone)]
pub struct NarInfo {
    pub metadata: InfoMetadata,
    pub sig: Vec<String>,
}

impl NarInfo {
    pub fn new(metadata: InfoMetadata, mut sig: Vec<String>) -> Self {
        sig.sort();
        Self { metadata, sig }
    }

    /// Render the header block: `StorePath`, `URL`, `Compression`,
    /// `NarHash`, `NarSize`, `FileHash`, `FileSize`, `References:`
    /// (space-separated, sorted, trailing space even when empty),
    /// optional `Deriver`, sorted `Sig:` lines, optional `CA`.
    pub fn render(&self) -> Result<String> {
        let m = &self.metadata;
        let mut out = String::new();

        writeln!(&mut out, "StorePath: {}", m.store_path)?;
        writeln!(&mut out, "URL: {}", m.url)?;
        writeln!(&mut out, "Compression: {}", m.compression)?;
        writeln!(&mut out, "NarHash: {}", m.nar_hash)?;
        writeln!(&mut out, "NarSize: {}", m.nar_size)?;
        writeln!(&mut out, "FileHash: {}", m.file_hash)?;
        writeln!(&mut out, "FileSize: {}", m.file_size)?;

        write!(&mut out, "References: ")?;
        write!(&mut out, "{}", m.references.join(" "))?;
        writeln!(&mut out)?;

        if let Some(ref deriver) = m.deriver {
            writeln!(&mut out, "Deriver: {deriver}")?;
        }

        for sig in &self.sig {
            writeln!(&mut out, "Sig: {sig}")?;
        }

        if let Some(ref ca) = m.ca {
            writeln!(&mut out, "CA: {ca}")?;
        }

        Ok(out)
    }
}
