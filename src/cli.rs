//! Command-line surface: flag/env parsing via `clap` derive, resolved into
//! the plain [`crate::config`] structs the rest of the crate consumes.

use anyhow::{Context, Result};
use cache_push::config::{AuthToken, ListenSettings, PushSettings, ServerSettings};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::time::Duration;

#[derive(Parser)]
#[command(name = "cache-push")]
#[command(about = "Client-side upload engine for an S3-compatible Nix binary cache", long_about = None)]
#[command(version)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Upload one or more store path closures to the binary cache.
    #[command(arg_required_else_help = true)]
    Push {
        /// Coordinating server URL.
        #[arg(long, env = "NIKS3_SERVER_URL")]
        server_url: String,

        /// Store paths to push.
        #[arg(required = true)]
        paths: Vec<PathBuf>,

        /// Authentication token for the server.
        #[arg(long, env = "NIKS3_AUTH_TOKEN", conflicts_with = "auth_token_file")]
        auth_token: Option<String>,

        /// Path to a file containing the authentication token.
        #[arg(long, env = "NIKS3_AUTH_TOKEN_FILE")]
        auth_token_file: Option<PathBuf>,

        /// Maximum number of concurrent uploads.
        #[arg(long, default_value = "30")]
        max_concurrent_uploads: usize,

        /// Nix store directory, used client-side for path parsing only.
        #[arg(long, default_value = "/nix/store")]
        store_dir: String,

        /// Server-facing adaptive rate limit ceiling (req/s).
        #[arg(long, default_value = "200.0")]
        server_rate_limit: f64,

        /// Object-store-facing adaptive rate limit ceiling (req/s).
        #[arg(long, default_value = "200.0")]
        storage_rate_limit: f64,
    },

    /// Run the datagram ingest listener (spec §4.9).
    Listen {
        #[arg(long, env = "NIKS3_SERVER_URL")]
        server_url: String,

        #[arg(long, env = "NIKS3_AUTH_TOKEN", conflicts_with = "auth_token_file")]
        auth_token: Option<String>,

        #[arg(long, env = "NIKS3_AUTH_TOKEN_FILE")]
        auth_token_file: Option<PathBuf>,

        #[arg(long, default_value = "30")]
        max_concurrent_uploads: usize,

        #[arg(long, default_value = "/nix/store")]
        store_dir: String,

        #[arg(long, default_value = "200.0")]
        server_rate_limit: f64,

        #[arg(long, default_value = "200.0")]
        storage_rate_limit: f64,

        /// Unix datagram socket path, used when socket activation doesn't
        /// supply a preopened fd.
        #[arg(long, env = "NIKS3_SOCKET_PATH", default_value = "/run/niks3-push/push.sock")]
        socket_path: PathBuf,

        /// Number of paths collected before a batch is flushed.
        #[arg(long, default_value = "100")]
        batch_size: usize,

        /// Maximum time to wait since a batch's first path before flushing.
        #[arg(long, default_value = "10")]
        batch_timeout_secs: u64,

        /// Flush a non-empty batch after this long without a new path.
        #[arg(long, default_value = "60")]
        idle_timeout_secs: u64,

        /// Consecutive push failures before the listener exits with error.
        #[arg(long, default_value = "5")]
        max_errors: u32,
    },

    /// Manage named pins keeping closures alive past garbage collection
    /// (spec §6: `GET|POST|DELETE /api/pins[/{name}]`).
    Pin {
        #[arg(long, env = "NIKS3_SERVER_URL")]
        server_url: String,

        #[arg(long, env = "NIKS3_AUTH_TOKEN", conflicts_with = "auth_token_file")]
        auth_token: Option<String>,

        #[arg(long, env = "NIKS3_AUTH_TOKEN_FILE")]
        auth_token_file: Option<PathBuf>,

        #[command(subcommand)]
        action: PinAction,
    },
}

#[derive(Subcommand)]
pub enum PinAction {
    /// List all pins.
    List,
    /// Create or update a pin.
    Set {
        name: String,
        /// Closure (store path or info key) the pin keeps alive.
        closure: String,
        /// RFC 3339 timestamp after which the pin itself may be GC'd.
        #[arg(long)]
        keep_until: Option<String>,
    },
    /// Remove a pin.
    Remove { name: String },
}

fn resolve_auth_token(inline: Option<String>, file: Option<PathBuf>) -> Result<AuthToken> {
    match (inline, file) {
        (Some(token), None) => Ok(AuthToken::from_inline(token)),
        (None, Some(path)) => AuthToken::from_file(&path),
        (None, None) => anyhow::bail!("input-invalid: one of --auth-token or --auth-token-file is required"),
        (Some(_), Some(_)) => unreachable!("clap enforces auth_token/auth_token_file are mutually exclusive"),
    }
}

pub struct PushInvocation {
    pub settings: PushSettings,
    pub paths: Vec<PathBuf>,
}

impl Commands {
    pub fn into_push_invocation(self) -> Result<PushInvocation> {
        let Commands::Push {
            server_url,
            paths,
            auth_token,
            auth_token_file,
            max_concurrent_uploads,
            store_dir,
            server_rate_limit,
            storage_rate_limit,
        } = self
        else {
            anyhow::bail!("not a push invocation");
        };

        let auth_token = resolve_auth_token(auth_token, auth_token_file)
            .context("resolving authentication token")?;

        Ok(PushInvocation {
            settings: PushSettings {
                server_url,
                auth_token,
                max_concurrent_uploads,
                store_dir,
                server_rate_limit,
                storage_rate_limit,
            },
            paths,
        })
    }

    pub fn into_listen_invocation(self) -> Result<(PushSettings, ListenSettings)> {
        let Commands::Listen {
            server_url,
            auth_token,
            auth_token_file,
            max_concurrent_uploads,
            store_dir,
            server_rate_limit,
            storage_rate_limit,
            socket_path,
            batch_size,
            batch_timeout_secs,
            idle_timeout_secs,
            max_errors,
        } = self
        else {
            anyhow::bail!("not a listen invocation");
        };

        let auth_token = resolve_auth_token(auth_token, auth_token_file)
            .context("resolving authentication token")?;

        let push_settings = PushSettings {
            server_url,
            auth_token,
            max_concurrent_uploads,
            store_dir,
            server_rate_limit,
            storage_rate_limit,
        };
        let listen_settings = ListenSettings {
            socket_path,
            batch_size,
            batch_timeout: Duration::from_secs(batch_timeout_secs),
            idle_timeout: Duration::from_secs(idle_timeout_secs),
            max_errors,
        };

        Ok((push_settings, listen_settings))
    }

    pub fn into_pin_invocation(self) -> Result<(ServerSettings, PinAction)> {
        let Commands::Pin { server_url, auth_token, auth_token_file, action } = self else {
            anyhow::bail!("not a pin invocation");
        };

        let auth_token = resolve_auth_token(auth_token, auth_token_file)
            .context("resolving authentication token")?;

        Ok((ServerSettings { server_url, auth_token }, action))
    }
}
