//! Privileged subprocess executor
//!
//! Every toolchain and VCS command a build environment runs goes through
//! here. The child's environment is whitelisted, not inherited: exactly
//! `GOPATH` (workspace first, master second, so lookups prefer pinned
//! sources), `PATH`, and `TMPDIR` pass through. Callers may override
//! GOPATH to a single path for master-only operations and append extra
//! variables (GOOS/GOARCH/GOARM/CGO_ENABLED).
//!
//! When a jail or an unprivileged uid/gid is configured, the child is
//! confined before exec: new session, chroot with the working directory
//! forced to `/` (guaranteed to exist inside any jail), then the gid and
//! uid drop, in that order.

use crate::config::Sandbox;
use crate::error::{SmithError, SmithResult};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::{Arc, Mutex};
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::Command;
use tracing::debug;

/// Shared, append-only log of everything a build environment does:
/// command lines, merged child stdout/stderr, and orchestrator notes.
/// Included verbatim in error responses; never persisted.
#[derive(Debug, Clone, Default)]
pub struct LogBuffer {
    inner: Arc<Mutex<Vec<u8>>>,
}

impl LogBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append raw child output
    pub fn append(&self, bytes: &[u8]) {
        self.inner.lock().unwrap().extend_from_slice(bytes);
    }

    /// Append an orchestrator annotation as its own line
    pub fn line(&self, msg: impl AsRef<str>) {
        let mut buf = self.inner.lock().unwrap();
        buf.extend_from_slice(msg.as_ref().as_bytes());
        buf.push(b'\n');
    }

    /// Snapshot the buffer as lossy UTF-8
    pub fn contents(&self) -> String {
        String::from_utf8_lossy(&self.inner.lock().unwrap()).into_owned()
    }
}

/// A single whitelisted-environment command invocation
#[derive(Debug)]
pub struct Invocation {
    program: String,
    args: Vec<String>,
    dir: Option<PathBuf>,
    /// `Some` pins GOPATH to one path (master-only operations);
    /// `None` uses the workspace:master pair
    gopath: Option<PathBuf>,
    extra_env: Vec<(String, String)>,
}

impl Invocation {
    /// Run the command from `dir` instead of the default.
    ///
    /// Ignored when a chroot is configured: jailed children always start
    /// in `/`.
    pub fn dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.dir = Some(dir.into());
        self
    }

    /// Use only `path` as GOPATH instead of the workspace:master pair
    pub fn gopath(mut self, path: impl Into<PathBuf>) -> Self {
        self.gopath = Some(path.into());
        self
    }

    /// Append an environment variable to the whitelist
    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.extra_env.push((key.into(), value.into()));
        self
    }

    fn command_line(&self) -> String {
        let mut line = self.program.clone();
        for arg in &self.args {
            line.push(' ');
            line.push_str(arg);
        }
        line
    }
}

/// Executor bound to one build environment's GOPATH pair and log
#[derive(Debug, Clone)]
pub struct Executor {
    workspace: PathBuf,
    master: PathBuf,
    sandbox: Sandbox,
    log: LogBuffer,
}

impl Executor {
    pub fn new(workspace: PathBuf, master: PathBuf, sandbox: Sandbox, log: LogBuffer) -> Self {
        Self {
            workspace,
            master,
            sandbox,
            log,
        }
    }

    /// Begin building a command invocation
    pub fn invocation<I, S>(&self, program: &str, args: I) -> Invocation
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Invocation {
            program: program.to_string(),
            args: args.into_iter().map(Into::into).collect(),
            dir: None,
            gopath: None,
            extra_env: Vec::new(),
        }
    }

    /// Run `inv` to completion, streaming merged stdout/stderr into the
    /// log buffer. Non-zero exit is a typed error carrying the command
    /// line and working directory.
    pub async fn run(&self, inv: Invocation) -> SmithResult<()> {
        let command_line = inv.command_line();
        let workdir = self.effective_dir(&inv);
        self.log.line(format!(
            "exec [{}] {}",
            workdir.as_deref().unwrap_or_else(|| Path::new("")).display(),
            command_line
        ));
        debug!(command = %command_line, "running sandboxed command");

        let gopath = match &inv.gopath {
            Some(single) => single.display().to_string(),
            None => format!("{}:{}", self.workspace.display(), self.master.display()),
        };

        let mut cmd = Command::new(&inv.program);
        cmd.args(&inv.args)
            .env_clear()
            .env("GOPATH", gopath)
            .env("PATH", std::env::var_os("PATH").unwrap_or_default())
            .env("TMPDIR", std::env::var_os("TMPDIR").unwrap_or_default())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        for (key, value) in &inv.extra_env {
            cmd.env(key, value);
        }
        if let Some(dir) = &workdir {
            // chrooted children chdir inside the confinement hook instead
            if self.sandbox.chroot.is_none() {
                cmd.current_dir(dir);
            }
        }
        confine(&mut cmd, &self.sandbox);

        let mut child = cmd.spawn().map_err(|e| SmithError::CommandSpawn {
            command: command_line.clone(),
            source: e,
        })?;

        // both pipes drain into the same buffer, approximating the
        // interleaving a shared pipe would produce
        let stdout = child.stdout.take();
        let stderr = child.stderr.take();
        let out_task = tokio::spawn(drain(stdout, self.log.clone()));
        let err_task = tokio::spawn(drain(stderr, self.log.clone()));

        let status = child.wait().await.map_err(|e| SmithError::CommandSpawn {
            command: command_line.clone(),
            source: e,
        })?;
        let _ = out_task.await;
        let _ = err_task.await;

        if status.success() {
            Ok(())
        } else {
            Err(SmithError::CommandFailed {
                command: command_line,
                workdir: workdir
                    .map(|d| d.display().to_string())
                    .unwrap_or_default(),
                status: status.code().unwrap_or(-1),
            })
        }
    }

    /// The log buffer this executor writes to
    pub fn log(&self) -> &LogBuffer {
        &self.log
    }

    fn effective_dir(&self, inv: &Invocation) -> Option<PathBuf> {
        if self.sandbox.chroot.is_some() {
            // "/" always exists inside the jail
            Some(PathBuf::from("/"))
        } else {
            inv.dir.clone()
        }
    }
}

/// Apply the sandbox policy to a command via a pre-exec hook.
///
/// Runs in the forked child before exec: setsid, then chroot + chdir("/"),
/// then setgid and setuid. The order matters — the jail must be entered
/// while still privileged, and the session detach must precede both.
fn confine(cmd: &mut Command, sandbox: &Sandbox) {
    if !sandbox.is_enabled() {
        return;
    }
    let uid_gid = sandbox.uid_gid;
    let chroot = sandbox.chroot.clone();
    unsafe {
        cmd.pre_exec(move || {
            use nix::unistd;

            if uid_gid.is_some() {
                unistd::setsid().map_err(std::io::Error::from)?;
            }
            if let Some(jail) = &chroot {
                unistd::chroot(jail.as_path()).map_err(std::io::Error::from)?;
                unistd::chdir("/").map_err(std::io::Error::from)?;
            }
            if let Some(id) = uid_gid {
                unistd::setgid(unistd::Gid::from_raw(id)).map_err(std::io::Error::from)?;
                unistd::setuid(unistd::Uid::from_raw(id)).map_err(std::io::Error::from)?;
            }
            Ok(())
        });
    }
}

async fn drain<R>(pipe: Option<R>, log: LogBuffer)
where
    R: AsyncRead + Unpin,
{
    let Some(mut pipe) = pipe else { return };
    let mut chunk = [0u8; 8192];
    loop {
        match pipe.read(&mut chunk).await {
            Ok(0) | Err(_) => break,
            Ok(n) => log.append(&chunk[..n]),
        }
    }
}
