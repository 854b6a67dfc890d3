//! The deterministic "nix-archive-1" archive codec.
//!
//! Produces byte-for-byte identical output to the reference implementation:
//! an opening magic token, a parenthesized node, a closing token, with every
//! token a length-prefixed, zero-padded-to-8-bytes byte string. Directory
//! entries are emitted in byte-wise ascending name order.

pub mod listing;

use anyhow::{Context, Result};
use listing::{Listing, ListingNode};
use std::collections::BTreeMap;
use std::ffi::{OsStr, OsString};
use std::os::unix::ffi::{OsStrExt, OsStringExt};
use std::os::unix::fs::MetadataExt;
use std::path::Path;
use tokio::fs;
use tokio::io::{self, AsyncWrite, AsyncWriteExt, BufReader};

const NAR_VERSION_MAGIC_1: &str = "nix-archive-1";

#[cfg(target_os = "macos")]
const USE_CASE_HACK: bool = true;
#[cfg(not(target_os = "macos"))]
const USE_CASE_HACK: bool = false;

const CASE_HACK_SUFFIX: &[u8] = b"~nix~case~hack~";

fn strip_case_hack_suffix(name: &OsStr) -> OsString {
    if !USE_CASE_HACK {
        return name.to_owned();
    }

    let bytes = name.as_bytes();
    if let Some(pos) = bytes
        .windows(CASE_HACK_SUFFIX.len())
        .position(|window| window == CASE_HACK_SUFFIX)
    {
        OsString::from_vec(bytes[0..pos].to_vec())
    } else {
        name.to_owned()
    }
}

/// Wraps an [`AsyncWrite`] and counts the total number of bytes written
/// through it, so the serializer can record each regular file's
/// archive-relative content offset.
struct CountingWriter<W> {
    inner: W,
    count: u64,
}

impl<W: AsyncWrite + Unpin> CountingWriter<W> {
    fn new(inner: W) -> Self {
        Self { inner, count: 0 }
    }
}

impl<W: AsyncWrite + Unpin> AsyncWrite for CountingWriter<W> {
    fn poll_write(
        mut self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
        buf: &[u8],
    ) -> std::task::Poll<io::Result<usize>> {
        let inner = std::pin::Pin::new(&mut self.inner);
        match inner.poll_write(cx, buf) {
            std::task::Poll::Ready(Ok(n)) => {
                self.count += n as u64;
                std::task::Poll::Ready(Ok(n))
            }
            other => other,
        }
    }

    fn poll_flush(
        mut self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<io::Result<()>> {
        std::pin::Pin::new(&mut self.inner).poll_flush(cx)
    }

    fn poll_shutdown(
        mut self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<io::Result<()>> {
        std::pin::Pin::new(&mut self.inner).poll_shutdown(cx)
    }
}

async fn write_string<W: AsyncWrite + Unpin>(writer: &mut W, s: &[u8]) -> io::Result<()> {
    let len = s.len() as u64;
    writer.write_all(&len.to_le_bytes()).await?;
    writer.write_all(s).await?;

    let padding = (8 - (s.len() % 8)) % 8;
    if padding > 0 {
        writer.write_all(&vec![0; padding]).await?;
    }

    Ok(())
}

async fn write_str<W: AsyncWrite + Unpin>(writer: &mut W, s: &str) -> io::Result<()> {
    write_string(writer, s.as_bytes()).await
}

/// Serialize `path` in nix-archive-1 form to `writer`, discarding the
/// listing tree. Kept for callers that only need the archive bytes.
pub async fn dump_path<W: AsyncWrite + Unpin>(writer: &mut W, path: &Path) -> Result<()> {
    let mut counting = CountingWriter::new(writer);
    write_str(&mut counting, NAR_VERSION_MAGIC_1).await?;
    write_str(&mut counting, "(").await?;
    dump_node(&mut counting, path).await?;
    write_str(&mut counting, ")").await?;
    Ok(())
}

/// Serialize `path` in nix-archive-1 form to `writer`, returning the
/// structural [`Listing`] whose regular-file entries carry the
/// archive-relative offset of their content payload.
pub async fn dump_path_with_listing<W: AsyncWrite + Unpin>(
    writer: &mut W,
    path: &Path,
) -> Result<Listing> {
    let mut counting = CountingWriter::new(writer);
    write_str(&mut counting, NAR_VERSION_MAGIC_1).await?;
    write_str(&mut counting, "(").await?;
    let root = dump_node(&mut counting, path).await?;
    write_str(&mut counting, ")").await?;
    Ok(Listing::new(root))
}

async fn dump_node<W: AsyncWrite + Unpin>(
    writer: &mut CountingWriter<W>,
    path: &Path,
) -> Result<ListingNode> {
    let metadata = fs::symlink_metadata(path)
        .await
        .with_context(|| format!("Failed to get metadata for {}", path.display()))?;

    write_str(writer, "type").await?;

    if metadata.is_file() {
        write_str(writer, "regular").await?;

        let executable = metadata.mode() & 0o111 != 0;
        if executable {
            write_str(writer, "executable").await?;
            write_str(writer, "").await?;
        }

        write_str(writer, "contents").await?;

        let file_size = metadata.len();
        writer.write_all(&file_size.to_le_bytes()).await?;

        // Content payload starts right here.
        let nar_offset = writer.count;

        let file = tokio::fs::File::open(path)
            .await
            .with_context(|| format!("Failed to open file {}", path.display()))?;
        let mut reader = BufReader::new(file);

        let bytes_copied = tokio::io::copy(&mut reader, writer)
            .await
            .with_context(|| format!("Failed to stream file {}", path.display()))?;

        if bytes_copied != file_size {
            anyhow::bail!(
                "File size mismatch for {}: expected {}, copied {}",
                path.display(),
                file_size,
                bytes_copied
            );
        }

        let padding = (8 - (file_size % 8)) % 8;
        if padding > 0 {
            writer.write_all(&vec![0; padding as usize]).await?;
        }

        Ok(ListingNode::Regular { size: file_size, executable, nar_offset })
    } else if metadata.is_dir() {
        write_str(writer, "directory").await?;

        let mut dir = fs::read_dir(path)
            .await
            .with_context(|| format!("Failed to read directory {}", path.display()))?;
        let mut names = Vec::new();
        while let Some(entry) = dir.next_entry().await? {
            names.push(entry.file_name());
        }
        names.sort();

        let mut entries = BTreeMap::new();
        for name in names {
            let nar_name = strip_case_hack_suffix(&name);
            let nar_name_str = nar_name.to_str().with_context(|| {
                format!("non-UTF-8 entry name under {}", path.display())
            })?;

            write_str(writer, "entry").await?;
            write_str(writer, "(").await?;

            write_str(writer, "name").await?;
            write_string(writer, nar_name.as_bytes()).await?;

            write_str(writer, "node").await?;
            write_str(writer, "(").await?;
            let child = Box::pin(dump_node(writer, &path.join(&name))).await?;
            write_str(writer, ")").await?;

            write_str(writer, ")").await?;

            entries.insert(nar_name_str.to_string(), child);
        }

        Ok(ListingNode::Directory { entries })
    } else if metadata.is_symlink() {
        write_str(writer, "symlink").await?;
        write_str(writer, "target").await?;

        let target = fs::read_link(path)
            .await
            .with_context(|| format!("Failed to read symlink {}", path.display()))?;
        write_string(writer, target.as_os_str().as_bytes()).await?;

        Ok(ListingNode::Symlink {
            target: target.to_string_lossy().into_owned(),
        })
    } else {
        anyhow::bail!("unsupported-file-type: {}", path.display());
    }
}

/// Generate the listing for `path` without emitting archive bytes, by
/// walking the filesystem directly. Used to upload listings for
/// deduplicated archives without re-serializing the NAR.
pub async fn walk_listing(path: &Path) -> Result<Listing> {
    let root = Box::pin(walk_node(path)).await?;
    Ok(Listing::new(root))
}

async fn walk_node(path: &Path) -> Result<ListingNode> {
    let metadata = fs::symlink_metadata(path)
        .await
        .with_context(|| format!("Failed to get metadata for {}", path.display()))?;

    if metadata.is_file() {
        let executable = metadata.mode() & 0o111 != 0;
        Ok(ListingNode::Regular {
            size: metadata.len(),
            executable,
            // There is no archive being produced, so there is no offset;
            // callers that need offsets must use `dump_path_with_listing`.
            nar_offset: 0,
        })
    } else if metadata.is_dir() {
        let mut dir = fs::read_dir(path)
            .await
            .with_context(|| format!("Failed to read directory {}", path.display()))?;
        let mut names = Vec::new();
        while let Some(entry) = dir.next_entry().await? {
            names.push(entry.file_name());
        }
        names.sort();

        let mut entries = BTreeMap::new();
        for name in names {
            let nar_name = strip_case_hack_suffix(&name);
            let nar_name_str = nar_name.to_string_lossy().into_owned();
            let child = Box::pin(walk_node(&path.join(&name))).await?;
            entries.insert(nar_name_str, child);
        }
        Ok(ListingNode::Directory { entries })
    } else if metadata.is_symlink() {
        let target = fs::read_link(path)
            .await
            .with_context(|| format!("Failed to read symlink {}", path.display()))?;
        Ok(ListingNode::Symlink { target: target.to_string_lossy().into_owned() })
    } else {
        anyhow::bail!("unsupported-file-type: {}", path.display());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::process::Command;
    use tempfile::tempdir;

    #[tokio::test]
    async fn test_nar_simple_file() {
        let dir = tempdir().unwrap();
        let file_path = dir.path().join("test.txt");
        fs::write(&file_path, b"hello world").await.unwrap();

        let mut buf = Vec::new();
        dump_path(&mut buf, &file_path).await.unwrap();

        assert!(buf.len() > 30);
        assert_eq!(&buf[0..8], &13u64.to_le_bytes());
        assert_eq!(&buf[8..21], b"nix-archive-1");

        let nar_str = String::from_utf8_lossy(&buf);
        assert!(nar_str.contains("type"));
        assert!(nar_str.contains("regular"));
        assert!(nar_str.contains("contents"));
        assert!(nar_str.contains("hello world"));
    }

    #[tokio::test]
    async fn test_nar_executable_file() {
        let dir = tempdir().unwrap();
        let file_path = dir.path().join("test.sh");
        fs::write(&file_path, b"#!/bin/sh\necho hello").await.unwrap();

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mut perms = fs::metadata(&file_path).await.unwrap().permissions();
            perms.set_mode(0o755);
            fs::set_permissions(&file_path, perms).await.unwrap();
        }

        let mut buf = Vec::new();
        dump_path(&mut buf, &file_path).await.unwrap();

        let nar_str = String::from_utf8_lossy(&buf);
        assert!(nar_str.contains("executable"));
    }

    #[tokio::test]
    async fn test_nar_directory_sorted() {
        let dir = tempdir().unwrap();
        let subdir = dir.path().join("subdir");
        fs::create_dir(&subdir).await.unwrap();
        fs::write(subdir.join("b.txt"), b"b").await.unwrap();
        fs::write(subdir.join("a.txt"), b"a").await.unwrap();

        let mut buf = Vec::new();
        dump_path(&mut buf, &subdir).await.unwrap();

        let nar_str = String::from_utf8_lossy(&buf);
        let pos_a = nar_str.find("a.txt").unwrap();
        let pos_b = nar_str.find("b.txt").unwrap();
        assert!(pos_a < pos_b, "entries must be byte-wise sorted");
    }

    #[tokio::test]
    async fn test_nar_symlink() {
        let dir = tempdir().unwrap();
        let target = dir.path().join("target.txt");
        let link = dir.path().join("link");

        fs::write(&target, b"target content").await.unwrap();
        tokio::fs::symlink("target.txt", &link).await.unwrap();

        let mut buf = Vec::new();
        dump_path(&mut buf, &link).await.unwrap();

        let nar_str = String::from_utf8_lossy(&buf);
        assert!(nar_str.contains("symlink"));
        assert!(nar_str.contains("target.txt"));
    }

    #[tokio::test]
    async fn listing_offset_points_at_content() {
        let dir = tempdir().unwrap();
        let file_path = dir.path().join("test.txt");
        fs::write(&file_path, b"hello world").await.unwrap();

        let mut buf = Vec::new();
        let listing = dump_path_with_listing(&mut buf, &file_path).await.unwrap();

        match listing.root {
            ListingNode::Regular { nar_offset, size, .. } => {
                assert_eq!(size, 11);
                assert_eq!(&buf[nar_offset as usize..nar_offset as usize + 11], b"hello world");
            }
            _ => panic!("expected regular file listing"),
        }
    }

    #[tokio::test]
    async fn listing_and_archive_agree_on_directory_structure() {
        let dir = tempdir().unwrap();
        let root = dir.path().join("root");
        fs::create_dir(&root).await.unwrap();
        fs::write(root.join("a.txt"), b"aaa").await.unwrap();
        let subdir = root.join("sub");
        fs::create_dir(&subdir).await.unwrap();
        fs::write(subdir.join("b.txt"), b"bb").await.unwrap();

        let mut buf = Vec::new();
        let listing = dump_path_with_listing(&mut buf, &root).await.unwrap();
        let walked = walk_listing(&root).await.unwrap();

        // Structural shape must match (names, types, sizes); the walk-only
        // variant cannot know archive offsets, so those are excluded from
        // the comparison.
        fn strip_offsets(node: &ListingNode) -> ListingNode {
            match node {
                ListingNode::Regular { size, executable, .. } => ListingNode::Regular {
                    size: *size,
                    executable: *executable,
                    nar_offset: 0,
                },
                ListingNode::Directory { entries } => ListingNode::Directory {
                    entries: entries.iter().map(|(k, v)| (k.clone(), strip_offsets(v))).collect(),
                },
                ListingNode::Symlink { target } => ListingNode::Symlink { target: target.clone() },
            }
        }

        assert_eq!(strip_offsets(&listing.root), strip_offsets(&walked.root));
    }

    #[test]
    fn test_strip_case_hack_suffix() {
        let name = OsStr::new("FOO~nix~case~hack~1");
        let stripped = strip_case_hack_suffix(name);
        if USE_CASE_HACK {
            assert_eq!(stripped, OsStr::new("FOO"));
        } else {
            assert_eq!(stripped, name);
        }

        let name = OsStr::new("normal_file.txt");
        assert_eq!(strip_case_hack_suffix(name), name);
    }

    #[tokio::test]
    async fn test_nar_compare_with_nix_comprehensive() {
        let nix_check = Command::new("nix-store").arg("--version").output();
        if nix_check.is_err() {
            eprintln!("Skipping test: nix-store not found");
            return;
        }

        let dir = tempdir().unwrap();
        let test_dir = dir.path().join("test");
        fs::create_dir(&test_dir).await.unwrap();

        fs::write(test_dir.join("regular.txt"), b"Hello, NAR!").await.unwrap();

        let exec_path = test_dir.join("script.sh");
        fs::write(&exec_path, b"#!/bin/sh\necho 'Hello from NAR'").await.unwrap();
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mut perms = fs::metadata(&exec_path).await.unwrap().permissions();
            perms.set_mode(0o755);
            fs::set_permissions(&exec_path, perms).await.unwrap();
        }

        fs::write(test_dir.join("empty"), b"").await.unwrap();

        let subdir = test_dir.join("subdir");
        fs::create_dir(&subdir).await.unwrap();
        fs::write(subdir.join("nested.txt"), b"Nested content").await.unwrap();

        fs::symlink("regular.txt", test_dir.join("link-to-file")).await.unwrap();

        let large_content = vec![b'X'; 1000];
        fs::write(test_dir.join("large.bin"), &large_content).await.unwrap();

        let mut our_nar = Vec::new();
        dump_path(&mut our_nar, &test_dir).await.unwrap();

        let output = Command::new("nix-store")
            .arg("--dump")
            .arg(test_dir.canonicalize().unwrap())
            .output()
            .unwrap();

        if !output.status.success() {
            eprintln!("nix-store stderr: {}", String::from_utf8_lossy(&output.stderr));
            return;
        }

        assert_eq!(our_nar, output.stdout);
    }
}
