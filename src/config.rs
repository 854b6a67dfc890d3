//! Resolved runtime configuration shared by both subcommands, assembled
//! from CLI flags/env vars by [`crate::cli`].

use anyhow::{Context, Result};
use std::path::PathBuf;
use std::time::Duration;

/// Authentication token, resolved from either an inline value or a file
/// read once at startup (spec A.3: `--auth-token`/`NIKS3_AUTH_TOKEN` or
/// `--auth-token-file`).
#[derive(Debug, Clone)]
pub struct AuthToken(String);

impl AuthToken {
    pub fn from_inline(token: String) -> Self {
        Self(token)
    }

    pub fn from_file(path: &std::path::Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("reading auth token file {}", path.display()))?;
        Ok(Self(contents.trim().to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

/// Tunables shared by the push and listen commands.
#[derive(Debug, Clone)]
pub struct PushSettings {
    pub server_url: String,
    pub auth_token: AuthToken,
    pub max_concurrent_uploads: usize,
    pub store_dir: String,
    pub server_rate_limit: f64,
    pub storage_rate_limit: f64,
}

/// `pin` subcommand settings: the coordinating server connection alone,
/// without the upload tunables `push`/`listen` need.
#[derive(Debug, Clone)]
pub struct ServerSettings {
    pub server_url: String,
    pub auth_token: AuthToken,
}

/// `listen` subcommand settings (spec §4.9).
#[derive(Debug, Clone)]
pub struct ListenSettings {
    pub socket_path: PathBuf,
    pub batch_size: usize,
    pub batch_timeout: Duration,
    pub idle_timeout: Duration,
    pub max_errors: u32,
}

impl From<&ListenSettings> for crate::datagram::BatchConfig {
    fn from(settings: &ListenSettings) -> Self {
        crate::datagram::BatchConfig {
            batch_size: settings.batch_size,
            batch_timeout: settings.batch_timeout,
            idle_timeout: settings.idle_timeout,
            max_errors: settings.max_errors,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::NamedTempFile;

    #[test]
    fn auth_token_from_file_trims_trailing_newline() {
        let file = NamedTempFile::new().unwrap();
        std::fs::write(file.path(), "sekret\n").unwrap();
        let token = AuthToken::from_file(file.path()).unwrap();
        assert_eq!(token.as_str(), "sekret");
    }

    #[test]
    fn listen_settings_convert_into_batch_config() {
        let settings = ListenSettings {
            socket_path: PathBuf::from("/tmp/push.sock"),
            batch_size: 10,
            batch_timeout: Duration::from_secs(5),
            idle_timeout: Duration::from_secs(30),
            max_errors: 5,
        };
        let config: crate::datagram::BatchConfig = (&settings).into();
        assert_eq!(config.batch_size, 10);
        assert_eq!(config.max_errors, 5);
    }
}
