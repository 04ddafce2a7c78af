//! Service configuration: command-line flags, environment, and the
//! constants describing the core package being built.
//!
//! Everything is resolved once at startup into an immutable [`Settings`]
//! shared behind an `Arc`; there is no config file.

use crate::error::{SmithError, SmithResult};
use clap::Parser;
use std::path::PathBuf;

/// Constants describing the Vessel core: where its sources live, which
/// file receives plugin imports, and how artifacts are named.
pub mod core {
    /// Import path of the core package (the top-level path, not
    /// necessarily the `main` package).
    pub const PACKAGE: &str = "github.com/vesselhq/vessel";

    /// File into which plugin imports are injected, relative to the
    /// core's source tree.
    pub const ENTRYPOINT: &str = "vessel/vesselmain/run.go";

    /// Directory of the core's `main` package, relative to the core's
    /// source tree.
    pub const MAIN_DIR: &str = "vessel";

    /// Package whose string variables receive the version stamp via
    /// `-ldflags -X`.
    pub const VERSION_PACKAGE: &str = "github.com/vesselhq/vessel/vessel/vesselmain";

    /// Leading component of artifact file names.
    pub const PREFIX: &str = "vessel";

    /// Directory of distribution assets bundled into every archive,
    /// relative to the core's source tree.
    pub const DIST_DIR: &str = "dist";
}

/// Environment variable names read at startup
pub mod env {
    pub const CLIENT_ID: &str = "BUILDSMITH_CLIENT_ID";
    pub const CLIENT_KEY: &str = "BUILDSMITH_CLIENT_KEY";
    pub const SIGNING_KEY_FILE: &str = "SIGNING_KEY_FILE";
    pub const KEY_PASSWORD_FILE: &str = "KEY_PASSWORD_FILE";
}

/// Default signing key material paths (overridable via environment)
pub const DEFAULT_SIGNING_KEY_FILE: &str = "signing_key.asc";
pub const DEFAULT_KEY_PASSWORD_FILE: &str = "signing_key_password.txt";

/// Maximum query string length allowed by requests
pub const MAX_QUERY_STRING_LENGTH: usize = 100 * 1024;

/// Maximum size allowed for request bodies
pub const MAX_BODY_BYTES: usize = 10 * 1024 * 1024;

/// buildsmith - build service for the Vessel core and its plugins
///
/// Provisions per-request workspaces from a shared master GOPATH,
/// verifies plugin compatibility, cross-compiles, signs, and streams
/// release archives.
#[derive(Parser, Debug)]
#[command(name = "buildsmith")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// The address (host:port) to listen on
    #[arg(long, default_value = "127.0.0.1:2017")]
    pub addr: String,

    /// Log file (or stdout/stderr; empty for none)
    #[arg(long, default_value = "buildsmith.log")]
    pub log: String,

    /// The uid and gid to run commands as (-1 for no change) (use with --chroot)
    #[arg(long, default_value_t = -1, allow_negative_numbers = true)]
    pub uid: i64,

    /// The directory to chroot commands in (use with --uid)
    #[arg(long, default_value = "")]
    pub chroot: String,

    /// How many build operations to perform in parallel (`go build -p` value)
    #[arg(long, default_value_t = 4)]
    pub parallel_build_ops: u32,
}

/// Privilege policy applied to every child process
#[derive(Debug, Clone, Default)]
pub struct Sandbox {
    /// uid and gid for child processes and file ownership; `None` leaves
    /// both unchanged
    pub uid_gid: Option<u32>,

    /// Jail directory for child processes; `None` disables jailing
    pub chroot: Option<PathBuf>,
}

impl Sandbox {
    /// Whether any restriction is configured at all
    pub fn is_enabled(&self) -> bool {
        self.uid_gid.is_some() || self.chroot.is_some()
    }
}

/// Basic-auth credentials, with the secret pre-hashed
#[derive(Debug, Clone)]
pub struct Credentials {
    pub client_id: String,
    /// SHA-1 digest of the configured client key
    pub key_digest: [u8; 20],
}

/// Immutable, validated service settings
#[derive(Debug, Clone)]
pub struct Settings {
    pub addr: String,
    pub log_sink: String,
    pub sandbox: Sandbox,
    pub parallel_build_ops: u32,
    /// Root of the master package cache (the master GOPATH)
    pub master_gopath: PathBuf,
    pub credentials: Option<Credentials>,
}

impl Settings {
    /// Validate flags and environment into settings.
    ///
    /// Fails on a uid outside `[-1, u32::MAX]`. Credential and jail
    /// warnings are the caller's concern (they are advisory, not fatal).
    pub fn from_cli(cli: &Cli) -> SmithResult<Self> {
        let uid_gid = match cli.uid {
            -1 => None,
            v if v < -1 || v > u32::MAX as i64 => return Err(SmithError::UidOutOfRange(v)),
            v => Some(v as u32),
        };

        let chroot = if cli.chroot.is_empty() {
            None
        } else {
            Some(PathBuf::from(&cli.chroot))
        };

        Ok(Settings {
            addr: cli.addr.clone(),
            log_sink: cli.log.clone(),
            sandbox: Sandbox { uid_gid, chroot },
            parallel_build_ops: cli.parallel_build_ops,
            master_gopath: master_gopath_from_env(),
            credentials: credentials_from_env(),
        })
    }
}

/// Resolve the master GOPATH: the `GOPATH` environment variable, or the
/// toolchain default `~/go`.
pub fn master_gopath_from_env() -> PathBuf {
    match std::env::var_os("GOPATH") {
        Some(p) if !p.is_empty() => PathBuf::from(p),
        _ => dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("go"),
    }
}

/// Read API credentials from the environment, hashing the key.
/// Returns `None` when both variables are unset or empty.
pub fn credentials_from_env() -> Option<Credentials> {
    use sha1::{Digest, Sha1};

    let client_id = std::env::var(env::CLIENT_ID).unwrap_or_default();
    let client_key = std::env::var(env::CLIENT_KEY).unwrap_or_default();
    if client_id.is_empty() && client_key.is_empty() {
        return None;
    }

    let mut digest = [0u8; 20];
    digest.copy_from_slice(&Sha1::digest(client_key.as_bytes()));
    Some(Credentials {
        client_id,
        key_digest: digest,
    })
}

/// Signing key material paths: environment overrides, else defaults.
pub fn signing_key_paths() -> (PathBuf, PathBuf) {
    let key = std::env::var(env::SIGNING_KEY_FILE)
        .ok()
        .filter(|v| !v.is_empty())
        .unwrap_or_else(|| DEFAULT_SIGNING_KEY_FILE.to_string());
    let password = std::env::var(env::KEY_PASSWORD_FILE)
        .ok()
        .filter(|v| !v.is_empty())
        .unwrap_or_else(|| DEFAULT_KEY_PASSWORD_FILE.to_string());
    (PathBuf::from(key), PathBuf::from(password))
}
