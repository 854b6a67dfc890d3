//! Socket activation for the datagram listener: adopt a systemd-style
//! preopened socket on fd 3 when the environment says to, else bind a
//! fresh one at a configured path.

use anyhow::{Context, Result};
use std::os::unix::io::FromRawFd;
use std::path::{Path, PathBuf};
use tokio::net::UnixDatagram;
use tracing::info;

const LISTEN_FD_START: std::os::unix::io::RawFd = 3;

/// An acquired datagram socket, tracking whether this process created the
/// backing file (and is therefore responsible for unlinking it on exit).
pub struct ActivatedSocket {
    pub socket: UnixDatagram,
    self_created: Option<PathBuf>,
}

impl ActivatedSocket {
    /// Adopt fd 3 if `LISTEN_PID`/`LISTEN_FDS` name this process, clearing
    /// both variables so children don't re-adopt it; otherwise remove any
    /// stale socket file at `path` and bind a fresh one.
    pub fn acquire(path: &Path) -> Result<Self> {
        if let Some(socket) = try_adopt_from_environment()? {
            return Ok(Self { socket, self_created: None });
        }

        if path.exists() {
            std::fs::remove_file(path)
                .with_context(|| format!("removing stale socket {}", path.display()))?;
        }
        let socket = UnixDatagram::bind(path)
            .with_context(|| format!("binding datagram socket {}", path.display()))?;
        info!(path = %path.display(), "created datagram socket");
        Ok(Self { socket, self_created: Some(path.to_path_buf()) })
    }
}

impl Drop for ActivatedSocket {
    fn drop(&mut self) {
        if let Some(path) = &self.self_created {
            let _ = std::fs::remove_file(path);
        }
    }
}

fn try_adopt_from_environment() -> Result<Option<UnixDatagram>> {
    let Ok(listen_pid) = std::env::var("LISTEN_PID") else { return Ok(None) };
    let Ok(listen_fds) = std::env::var("LISTEN_FDS") else { return Ok(None) };

    let pid_matches = listen_pid.parse::<u32>().ok() == Some(std::process::id());
    let fds: u32 = listen_fds.parse().unwrap_or(0);
    if !pid_matches || fds < 1 {
        return Ok(None);
    }

    // SAFETY: the socket-activation protocol guarantees fd 3 is an
    // already-open, already-bound datagram socket handed down by the
    // supervisor across exec; we only take ownership here.
    let std_socket = unsafe { std::os::unix::net::UnixDatagram::from_raw_fd(LISTEN_FD_START) };
    std_socket.set_nonblocking(true).context("setting adopted socket non-blocking")?;
    let socket = UnixDatagram::from_std(std_socket).context("wrapping adopted socket for tokio")?;

    // SAFETY: single-threaded at this point in startup, before any other
    // code could be racing these same two variables.
    unsafe {
        std::env::remove_var("LISTEN_PID");
        std::env::remove_var("LISTEN_FDS");
    }

    info!("adopted preopened datagram socket via socket activation");
    Ok(Some(socket))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[tokio::test]
    async fn acquire_creates_and_unlinks_own_socket() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("push.sock");
        let activated = ActivatedSocket::acquire(&path).unwrap();
        assert!(path.exists());
        drop(activated);
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn acquire_removes_stale_socket_file_before_binding() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("push.sock");
        std::fs::write(&path, b"stale").unwrap();
        let activated = ActivatedSocket::acquire(&path).unwrap();
        assert!(path.exists());
    }

    #[test]
    fn try_adopt_returns_none_without_listen_pid() {
        // SAFETY: test-only, no concurrent access to these vars expected.
        unsafe {
            std::env::remove_var("LISTEN_PID");
            std::env::remove_var("LISTEN_FDS");
        }
        assert!(try_adopt_from_environment().unwrap().is_none());
    }

    #[test]
    fn try_adopt_returns_none_when_pid_does_not_match() {
        // SAFETY: test-only.
        unsafe {
            std::env::set_var("LISTEN_PID", "1");
            std::env::set_var("LISTEN_FDS", "1");
        }
        let result = try_adopt_from_environment().unwrap();
        assert!(result.is_none());
        // SAFETY: test-only.
        unsafe {
            std::env::remove_var("LISTEN_PID");
            std::env::remove_var("LISTEN_FDS");
        }
    }
}
