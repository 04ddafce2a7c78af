//! Master-cache coordination and ephemeral workspaces
//!
//! The master GOPATH is a long-lived warm cache shared by every request.
//! It may be deleted between requests (the service rebuilds it on
//! demand), but while any build environment is reading it, nothing may
//! mutate it: a process-wide reader-writer lock per cache root enforces
//! that. Workspaces are per-request roots branched from the master and
//! removed on close.

use crate::config::Sandbox;
use crate::error::{SmithError, SmithResult};
use chrono::Local;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, OnceLock};
use tempfile::TempDir;
use tracing::debug;

static LOCKS: OnceLock<Mutex<HashMap<PathBuf, std::sync::Arc<tokio::sync::RwLock<()>>>>> =
    OnceLock::new();

/// The reader-writer lock governing a cache root, created lazily on
/// first use. Every read of the master cache must hold the read half for
/// its duration; fetch-all, update, backup, and restore hold the write
/// half. Acquisition is not fair; writer starvation under heavy read
/// traffic is accepted for this workload.
pub fn cache_lock(root: &Path) -> std::sync::Arc<tokio::sync::RwLock<()>> {
    let table = LOCKS.get_or_init(|| Mutex::new(HashMap::new()));
    let mut table = table.lock().unwrap();
    table
        .entry(root.to_path_buf())
        .or_insert_with(|| std::sync::Arc::new(tokio::sync::RwLock::new(())))
        .clone()
}

/// Path of package `pkg`'s source folder under `gopath`
pub fn src_path(gopath: &Path, pkg: &str) -> PathBuf {
    gopath.join("src").join(pkg)
}

/// Top-level folder of the repository containing `src`: walks upward
/// until a `.git` directory is found or the filesystem root is reached.
/// Needed because a package is not necessarily at the top of its repo,
/// and VCS commands must run from the repo root.
pub fn repo_root(src: &Path) -> PathBuf {
    let mut current = src.to_path_buf();
    loop {
        if current.join(".git").is_dir() {
            return current;
        }
        match current.parent() {
            Some(parent) => current = parent.to_path_buf(),
            None => return current,
        }
    }
}

/// Map a repository root under the master cache to its location under
/// the workspace.
pub fn workspace_repo_path(master: &Path, workspace: &Path, master_repo: &Path) -> PathBuf {
    let relative = master_repo
        .strip_prefix(master.join("src"))
        .unwrap_or(master_repo);
    workspace.join("src").join(relative)
}

/// A per-request ephemeral GOPATH, removed when closed (or dropped)
#[derive(Debug)]
pub struct Workspace {
    dir: TempDir,
}

impl Workspace {
    /// Create a unique workspace root under the system temp area with a
    /// timestamped prefix, owned by the build uid when one is set.
    pub fn create(sandbox: &Sandbox) -> SmithResult<Self> {
        let stamp = Local::now().format("%m-%d-%H%M");
        let dir = tempfile::Builder::new()
            .prefix(&format!("gopath_{stamp}."))
            .tempdir()
            .map_err(|e| SmithError::io("creating workspace root", e))?;
        chown_to_build_uid(dir.path(), sandbox)?;
        debug!(path = %dir.path().display(), "created workspace");
        Ok(Self { dir })
    }

    /// The workspace root directory
    pub fn path(&self) -> &Path {
        self.dir.path()
    }

    /// Path of `pkg`'s source folder in this workspace
    pub fn src_path(&self, pkg: &str) -> PathBuf {
        src_path(self.path(), pkg)
    }

    /// Remove the workspace tree, reporting the first error encountered.
    /// Dropping a workspace without closing removes it best-effort.
    pub fn close(self) -> SmithResult<()> {
        let path = self.dir.path().to_path_buf();
        self.dir
            .close()
            .map_err(|e| SmithError::io(format!("removing workspace {}", path.display()), e))
    }
}

/// chown `path` to the configured build uid/gid, if any
pub fn chown_to_build_uid(path: &Path, sandbox: &Sandbox) -> SmithResult<()> {
    if let Some(id) = sandbox.uid_gid {
        nix::unistd::chown(
            path,
            Some(nix::unistd::Uid::from_raw(id)),
            Some(nix::unistd::Gid::from_raw(id)),
        )
        .map_err(|e| {
            SmithError::io(
                format!("chown {} to build uid", path.display()),
                std::io::Error::from(e),
            )
        })?;
    }
    Ok(())
}

/// True when `dir` exists and is a directory
pub fn dir_exists(dir: &Path) -> bool {
    dir.is_dir()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    #[test]
    fn same_root_shares_a_lock() {
        let a = cache_lock(Path::new("/srv/cache-shared-test"));
        let b = cache_lock(Path::new("/srv/cache-shared-test"));
        assert!(std::sync::Arc::ptr_eq(&a, &b));

        let other = cache_lock(Path::new("/srv/cache-other-test"));
        assert!(!std::sync::Arc::ptr_eq(&a, &other));
    }

    #[tokio::test]
    async fn writer_excludes_readers() {
        let lock = cache_lock(Path::new("/srv/cache-excl-test"));
        let write = lock.clone().write_owned().await;
        assert!(lock.clone().try_read_owned().is_err());
        drop(write);
        assert!(lock.clone().try_read_owned().is_ok());
    }

    #[test]
    fn src_path_layout() {
        assert_eq!(
            src_path(Path::new("/srv/master"), "example.com/user/pkg"),
            PathBuf::from("/srv/master/src/example.com/user/pkg")
        );
    }

    #[test]
    fn repo_root_walks_up_to_git_dir() {
        let temp = TempDir::new().unwrap();
        let repo = temp.path().join("src/example.com/user/repo");
        fs::create_dir_all(repo.join(".git")).unwrap();
        let nested = repo.join("sub/package");
        fs::create_dir_all(&nested).unwrap();

        assert_eq!(repo_root(&nested), repo);
        assert_eq!(repo_root(&repo), repo);
    }

    #[test]
    fn repo_root_without_marker_reaches_fs_root() {
        let temp = TempDir::new().unwrap();
        let orphan = temp.path().join("src/example.com/no-vcs");
        fs::create_dir_all(&orphan).unwrap();
        assert_eq!(repo_root(&orphan), PathBuf::from("/"));
    }

    #[test]
    fn workspace_repo_path_mirrors_master_layout() {
        let master = Path::new("/srv/master");
        let workspace = Path::new("/tmp/gopath_01-02-0304.abc");
        let repo = workspace_repo_path(
            master,
            workspace,
            Path::new("/srv/master/src/example.com/user/repo"),
        );
        assert_eq!(
            repo,
            PathBuf::from("/tmp/gopath_01-02-0304.abc/src/example.com/user/repo")
        );
    }

    #[test]
    fn workspace_created_and_removed() {
        let ws = Workspace::create(&Sandbox::default()).unwrap();
        let path = ws.path().to_path_buf();
        assert!(path.is_dir());
        assert!(path
            .file_name()
            .unwrap()
            .to_string_lossy()
            .starts_with("gopath_"));
        ws.close().unwrap();
        assert!(!path.exists());
    }

    #[test]
    fn workspaces_are_disjoint() {
        let a = Workspace::create(&Sandbox::default()).unwrap();
        let b = Workspace::create(&Sandbox::default()).unwrap();
        assert_ne!(a.path(), b.path());
    }
}
