//! Source fetching: `go get` and `git` wrappers
//!
//! Thin, idempotent wrappers over the toolchain's package fetcher and the
//! VCS client, all routed through the privileged executor. Packages are
//! obtained non-destructively (`ensure_present` never upgrades existing
//! sources); the destructive `update_with_dependencies` exists only for
//! deploys, which snapshot the master cache first.

use crate::config::core;
use crate::error::SmithResult;
use crate::exec::Executor;
use std::path::Path;

/// Fetch operations bound to one build environment's executor
#[derive(Debug, Clone)]
pub struct SourceFetcher<'a> {
    exec: &'a Executor,
}

impl<'a> SourceFetcher<'a> {
    pub fn new(exec: &'a Executor) -> Self {
        Self { exec }
    }

    /// Obtain `pkg` and its transitive dependencies without upgrading
    /// anything already present (`go get -d -t -x`). The core package
    /// expands to all of its sub-packages, since it is the package being
    /// linked into a command.
    ///
    /// With `gopath` set, operates on that GOPATH alone (master fills);
    /// otherwise the combined workspace:master pair is used so new
    /// dependencies introduced by a checkout land in the workspace.
    pub async fn ensure_present(&self, pkg: &str, gopath: Option<&Path>) -> SmithResult<()> {
        let spec = qualify(pkg);
        let mut inv = self
            .exec
            .invocation("go", ["get", "-d", "-t", "-x", spec.as_str()]);
        if let Some(path) = gopath {
            inv = inv.gopath(path);
        }
        self.exec.run(inv).await
    }

    /// Obtain upstream updates for `pkg` and its dependencies
    /// (`go get -u`). Dangerous: untracked dependencies may move to
    /// incompatible revisions, which is why deploys snapshot the master
    /// cache before calling this.
    pub async fn update_with_dependencies(&self, pkg: &str, gopath: &Path) -> SmithResult<()> {
        let spec = qualify(pkg);
        self.exec
            .run(
                self.exec
                    .invocation("go", ["get", "-u", "-d", "-t", "-x", spec.as_str()])
                    .gopath(gopath),
            )
            .await
    }

    /// Fetch upstream refs into the checkout at `repo_root` without
    /// touching the working tree, so any revision can be checked out.
    pub async fn refresh_refs(&self, repo_root: &Path) -> SmithResult<()> {
        self.exec
            .run(self.exec.invocation("git", ["fetch"]).dir(repo_root))
            .await
    }

    /// Switch the working tree at `repo_root` to `version` (a tag,
    /// branch, or commit).
    ///
    /// When multiple plugins share a repository root at different
    /// versions, the last checkout wins; the canonical use case deploys
    /// one plugin at a time, so this is accepted and documented rather
    /// than rejected.
    pub async fn checkout(&self, repo_root: &Path, version: &str) -> SmithResult<()> {
        self.exec
            .run(
                self.exec
                    .invocation("git", ["checkout", version])
                    .dir(repo_root),
            )
            .await
    }
}

/// The core package is fetched with all sub-packages; plugins as named
fn qualify(pkg: &str) -> String {
    if pkg == core::PACKAGE {
        format!("{pkg}/...")
    } else {
        pkg.to_string()
    }
}
