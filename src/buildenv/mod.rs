//! Build environments
//!
//! A build environment is comprised of the master GOPATH (the shared
//! warm package cache), an ephemeral workspace branched from it with the
//! requested versions checked out, and the package/version map to build.
//! Open environments must be closed to release the workspace.
//!
//! Builds inject the configured plugins into the core's entry point,
//! cross-compile with a version stamp, and package the result. Deploys
//! promote a core or plugin version into the master cache, gated on
//! verification, with snapshot-and-rollback protection for the one
//! failure class the update itself can cause.

mod stamp;

use crate::archive::{self, Format};
use crate::cache::{self, Workspace};
use crate::config::{core, Settings};
use crate::copy::{deep_copy, CopyOptions};
use crate::error::{SmithError, SmithResult};
use crate::exec::{Executor, LogBuffer};
use crate::fetch::SourceFetcher;
use crate::inject;
use crate::platform::{self, Platform};
use crate::request::Plugin;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tempfile::TempDir;
use tracing::{debug, info};

/// A finished, archived build ready to stream back
#[derive(Debug)]
pub struct BuiltArtifact {
    /// Path of the archive on disk (inside the caller's output folder)
    pub path: PathBuf,
    /// The archive's file name, e.g. `vessel_abc12345_linux_arm7_custom.tar.gz`
    pub name: String,
}

/// A provisioned build environment. See the module docs.
pub struct BuildEnv {
    settings: Arc<Settings>,
    master: PathBuf,
    workspace: Workspace,
    /// package import path → version to check out; always contains the core
    pkgs: BTreeMap<String, String>,
    exec: Executor,
    log: LogBuffer,
}

impl BuildEnv {
    /// Create and provision a build environment for `core_version` plus
    /// `plugins`, writing activity to `log`. On success the caller must
    /// [`close`](Self::close) the environment; on failure the partial
    /// workspace is removed before returning.
    pub async fn open(
        settings: Arc<Settings>,
        core_version: &str,
        plugins: &[Plugin],
        log: LogBuffer,
    ) -> SmithResult<Self> {
        let workspace = Workspace::create(&settings.sandbox)?;

        let mut pkgs = BTreeMap::new();
        for plugin in plugins {
            pkgs.insert(plugin.package.clone(), plugin.version.clone());
        }
        let core_version = if core_version.is_empty() {
            "master"
        } else {
            core_version
        };
        pkgs.insert(core::PACKAGE.to_string(), core_version.to_string());

        let exec = Executor::new(
            workspace.path().to_path_buf(),
            settings.master_gopath.clone(),
            settings.sandbox.clone(),
            log.clone(),
        );

        let env = Self {
            master: settings.master_gopath.clone(),
            settings,
            workspace,
            pkgs,
            exec,
            log,
        };
        // a failed provision drops `env`, which removes the workspace
        env.provision().await?;
        Ok(env)
    }

    /// Fill the master cache as needed (non-destructively), then branch
    /// each repository into the workspace and pin it to the requested
    /// version.
    ///
    /// Idempotent: a second provision skips existing copies and
    /// re-checks-out the same versions. When plugins share a repository
    /// root at different versions, the last checkout wins (the canonical
    /// use deploys one plugin at a time).
    async fn provision(&self) -> SmithResult<()> {
        let fetcher = SourceFetcher::new(&self.exec);

        // ensure no packages are missing from the master cache before
        // branching; this is the only provisioning step that writes it
        {
            let _write = cache::cache_lock(&self.master).write_owned().await;
            for pkg in self.pkgs.keys() {
                fetcher
                    .ensure_present(pkg, Some(&self.master))
                    .await
                    .map_err(|e| SmithError::check(format!("go get {pkg}"), e))?;
            }
        }

        let _read = cache::cache_lock(&self.master).read_owned().await;
        for (pkg, version) in &self.pkgs {
            // copy the entire repository, not just the package folder,
            // so VCS commands work even for packages below the repo root
            let master_repo = cache::repo_root(&cache::src_path(&self.master, pkg));
            let workspace_repo =
                cache::workspace_repo_path(&self.master, self.workspace.path(), &master_repo);

            // plugins can share a repository; copy it once
            if !cache::dir_exists(&workspace_repo) {
                copy_blocking(
                    master_repo.clone(),
                    workspace_repo.clone(),
                    CopyOptions::provisioning(self.settings.sandbox.uid_gid),
                )
                .await?;
            }

            let checkout_dir = self.workspace.src_path(pkg);
            fetcher
                .refresh_refs(&checkout_dir)
                .await
                .map_err(|e| SmithError::check(format!("git fetch {pkg}"), e))?;
            fetcher
                .checkout(&checkout_dir, version)
                .await
                .map_err(|e| SmithError::check(format!("git checkout {pkg} @ {version}"), e))?;

            // the revision just checked out may have previously-unseen
            // dependencies
            fetcher
                .ensure_present(pkg, None)
                .await
                .map_err(|e| SmithError::check(format!("go get {pkg}"), e))?;
        }

        Ok(())
    }

    /// Build for `platform`, placing the finished archive in `out_dir`.
    /// The archive bundles the binary with the distribution manifest;
    /// the intermediate binary is removed. The workspace stays open
    /// until the caller closes it.
    pub async fn build(&self, platform: &Platform, out_dir: &Path) -> SmithResult<BuiltArtifact> {
        if !platform.is_complete() {
            return Err(SmithError::IncompletePlatform);
        }

        let plugins: Vec<&str> = self.plugin_packages().collect();
        inject::inject_imports(&self.entrypoint(), &plugins)?;

        let artifact_name = artifact_name(self.core_version(), platform, !plugins.is_empty());

        let binary_name = if platform.os == "windows" {
            format!("{}.exe", core::PREFIX)
        } else {
            core::PREFIX.to_string()
        };
        let binary_path = out_dir.join(&binary_name);
        self.compile(platform, &binary_path)
            .await
            .map_err(|e| SmithError::Build {
                source: Box::new(e),
            })?;

        let format = Format::for_os(&platform.os);
        let name = format!("{artifact_name}{}", format.extension());
        let archive_path = out_dir.join(&name);

        let dist = self.workspace.src_path(core::PACKAGE).join(core::DIST_DIR);
        let entries = vec![
            dist.join("README.txt"),
            dist.join("LICENSES.txt"),
            dist.join("CHANGES.txt"),
            dist.join("init"),
            binary_path.clone(),
        ];
        let result = {
            let archive_path = archive_path.clone();
            tokio::task::spawn_blocking(move || archive::create(&archive_path, format, &entries))
                .await
                .map_err(|e| SmithError::Internal(format!("archive task failed: {e}")))?
        };
        // the binary is bundled now; keep the output folder tidy either way
        let _ = std::fs::remove_file(&binary_path);
        result?;

        info!(artifact = %name, "build complete");
        Ok(BuiltArtifact {
            path: archive_path,
            name,
        })
    }

    /// Compile the core entry point for `platform` into `output`
    async fn compile(&self, platform: &Platform, output: &Path) -> SmithResult<()> {
        let core_src = self.workspace.src_path(core::PACKAGE);
        let ldflags = stamp::make_ldflags(&core_src).await?;
        let parallel = self.settings.parallel_build_ops.to_string();
        let output_arg = output.display().to_string();

        let inv = self
            .exec
            .invocation(
                "go",
                [
                    "build",
                    "-p",
                    parallel.as_str(),
                    "-ldflags",
                    ldflags.as_str(),
                    "-o",
                    output_arg.as_str(),
                ],
            )
            .dir(core_src.join(core::MAIN_DIR))
            .env("CGO_ENABLED", cgo_enabled(&platform.os))
            .env("GOOS", &platform.os)
            .env("GOARCH", &platform.arch)
            .env("GOARM", &platform.arm);
        self.exec.run(inv).await
    }

    /// Promote the environment's deploy target into the master cache.
    ///
    /// The environment must hold exactly the core (core deploy) or the
    /// core plus one plugin (plugin deploy). The master cache is
    /// snapshotted first; if the post-injection core test fails — the
    /// one failure the dependency update itself can plausibly cause —
    /// the snapshot is rolled back. Every other failure leaves the
    /// updated master in place.
    pub async fn deploy(&self, required_platforms: &[Platform]) -> SmithResult<()> {
        validate_deploy_cardinality(&self.pkgs)?;

        let snapshot = self.snapshot_master().await?;

        self.update_master().await?;

        let outcome = if self.deploy_target() == core::PACKAGE {
            self.run_core_checks().await.map_err(|e| (false, e))
        } else {
            self.run_plugin_checks(required_platforms).await
        };

        match outcome {
            Ok(()) => Ok(()),
            Err((revert, error)) => {
                if revert {
                    // the core tests failed; it could have been the
                    // plugin's code, but a separate run of the plugin's
                    // own tests catches most of that — the likely cause
                    // is the dependency update, so restore the cache
                    if let Err(restore) = self.restore_master(snapshot.path()).await {
                        return Err(SmithError::RestoreFailed {
                            context: error.to_string(),
                            restore: restore.to_string(),
                        });
                    }
                }
                Err(error)
            }
        }
        // `snapshot` drops here, removing the backup on every path
    }

    /// Verification for a plugin deploy: vet and test the plugin, plug
    /// it into the core, test the core with it, then cross-compile for
    /// every required platform. The boolean in the error marks failures
    /// that warrant a master-cache rollback.
    async fn run_plugin_checks(
        &self,
        required_platforms: &[Platform],
    ) -> Result<(), (bool, SmithError)> {
        let _read = cache::cache_lock(&self.master).read_owned().await;

        for pkg in self.plugin_packages() {
            self.go_vet(pkg)
                .await
                .map_err(|e| (false, SmithError::check(format!("go vet plugin {pkg}"), e)))?;

            self.go_test(pkg)
                .await
                .map_err(|e| (false, SmithError::check(format!("go test plugin {pkg}"), e)))?;

            self.log.line(format!("plugging in {pkg}"));
            inject::inject_imports(&self.entrypoint(), &[pkg])
                .map_err(|e| (false, SmithError::check(format!("plugging in {pkg}"), e)))?;

            self.go_test(core::PACKAGE)
                .await
                .map_err(|e| (true, SmithError::check("go test core with plugin", e)))?;

            self.cross_build_checks(pkg, required_platforms)
                .await
                .map_err(|e| (false, e))?;
        }

        Ok(())
    }

    /// Verification for a core deploy: vet, test, and cross-compile the
    /// core for every supported platform.
    async fn run_core_checks(&self) -> SmithResult<()> {
        let _read = cache::cache_lock(&self.master).read_owned().await;

        self.go_vet(core::PACKAGE)
            .await
            .map_err(|e| SmithError::check("go vet", e))?;
        self.go_test(core::PACKAGE)
            .await
            .map_err(|e| SmithError::check("go test", e))?;

        let platforms = platform::supported_platforms(&platform::unsupported_platforms()).await?;
        self.cross_build_checks(core::PACKAGE, &platforms).await
    }

    /// Run `go get -u` on the deploy target in the master cache only.
    /// Workspace checkouts pinned during provisioning are unaffected.
    async fn update_master(&self) -> SmithResult<()> {
        let _write = cache::cache_lock(&self.master).write_owned().await;
        self.log
            .line(format!("updating master cache: {}", self.master.display()));
        SourceFetcher::new(&self.exec)
            .update_with_dependencies(self.deploy_target(), &self.master)
            .await
    }

    /// Copy the master cache to a temporary location, so a bad update
    /// can be undone. The returned guard removes the snapshot on drop.
    async fn snapshot_master(&self) -> SmithResult<TempDir> {
        let _read = cache::cache_lock(&self.master).read_owned().await;
        let dir = tempfile::Builder::new()
            .prefix("gopath_backup_")
            .tempdir()
            .map_err(|e| SmithError::Snapshot(e.to_string()))?;
        cache::chown_to_build_uid(dir.path(), &self.settings.sandbox)
            .map_err(|e| SmithError::Snapshot(e.to_string()))?;

        copy_blocking(
            self.master.clone(),
            dir.path().to_path_buf(),
            CopyOptions {
                build_uid: self.settings.sandbox.uid_gid,
                ..CopyOptions::default()
            },
        )
        .await
        .map_err(|e| SmithError::Snapshot(e.to_string()))?;
        debug!(snapshot = %dir.path().display(), "master cache snapshotted");
        Ok(dir)
    }

    /// Replace the master cache's contents with the snapshot: rename the
    /// damaged cache aside (safer than deleting before the restore has
    /// succeeded), copy the snapshot back, then remove the displaced
    /// original.
    async fn restore_master(&self, snapshot: &Path) -> SmithResult<()> {
        let _write = cache::cache_lock(&self.master).write_owned().await;

        let displaced = PathBuf::from(format!(
            "{}_tmp_{}",
            self.master.display(),
            uuid::Uuid::new_v4().simple()
        ));
        std::fs::rename(&self.master, &displaced)
            .map_err(|e| SmithError::io("renaming master cache aside", e))?;

        copy_blocking(
            snapshot.to_path_buf(),
            self.master.clone(),
            CopyOptions {
                build_uid: self.settings.sandbox.uid_gid,
                ..CopyOptions::default()
            },
        )
        .await?;

        std::fs::remove_dir_all(&displaced)
            .map_err(|e| SmithError::io("removing displaced master cache", e))?;
        self.log.line("master cache restored from snapshot");
        Ok(())
    }

    async fn go_vet(&self, pkg: &str) -> SmithResult<()> {
        // run on ./... from inside the workspace copy: naming the package
        // instead would let the toolchain resolve it from either GOPATH,
        // not necessarily the workspace first
        let inv = self
            .exec
            .invocation("go", ["vet", "./..."])
            .dir(self.workspace.src_path(pkg));
        self.exec.run(inv).await
    }

    async fn go_test(&self, pkg: &str) -> SmithResult<()> {
        let inv = self
            .exec
            .invocation("go", ["test", "-race", "./..."])
            .dir(self.workspace.src_path(pkg));
        self.exec.run(inv).await
    }

    /// Cross-compile `pkg` for each platform, serially; compiler
    /// parallelism is bounded by the configured `-p` hint instead
    async fn cross_build_checks(&self, pkg: &str, platforms: &[Platform]) -> SmithResult<()> {
        for platform in platforms {
            self.log.line(format!(
                "GOOS={} GOARCH={} GOARM={} go build",
                platform.os, platform.arch, platform.arm
            ));
            let parallel = self.settings.parallel_build_ops.to_string();
            let spec = format!("{pkg}/...");
            let inv = self
                .exec
                .invocation("go", ["build", "-p", parallel.as_str(), spec.as_str()])
                .env("CGO_ENABLED", cgo_enabled(&platform.os))
                .env("GOOS", &platform.os)
                .env("GOARCH", &platform.arch)
                .env("GOARM", &platform.arm);
            self.exec
                .run(inv)
                .await
                .map_err(|e| SmithError::check(format!("build failed: {platform}"), e))?;
        }
        Ok(())
    }

    /// The package a deploy promotes: the core when it is alone,
    /// otherwise the one plugin beside it
    fn deploy_target(&self) -> &str {
        if self.pkgs.len() == 2 {
            self.pkgs
                .keys()
                .map(String::as_str)
                .find(|p| *p != core::PACKAGE)
                .unwrap_or(core::PACKAGE)
        } else {
            core::PACKAGE
        }
    }

    fn plugin_packages(&self) -> impl Iterator<Item = &str> {
        self.pkgs
            .keys()
            .map(String::as_str)
            .filter(|p| *p != core::PACKAGE)
    }

    fn core_version(&self) -> &str {
        self.pkgs
            .get(core::PACKAGE)
            .map(String::as_str)
            .unwrap_or("master")
    }

    fn entrypoint(&self) -> PathBuf {
        self.workspace
            .src_path(core::PACKAGE)
            .join(core::ENTRYPOINT)
    }

    /// The environment's activity log
    pub fn log(&self) -> &LogBuffer {
        &self.log
    }

    /// Remove the workspace from disk
    pub fn close(self) -> SmithResult<()> {
        self.workspace.close()
    }
}

/// CGO is disabled for reproducibility, except on darwin where the
/// toolchain has needed it for native builds
fn cgo_enabled(os: &str) -> &'static str {
    if os == "darwin" {
        "1"
    } else {
        "0"
    }
}

/// `{prefix}_{version}_{os}_{arch}{arm}[_custom]`; long non-tag versions
/// (commit hashes) are truncated to 8 characters
pub fn artifact_name(core_version: &str, platform: &Platform, custom: bool) -> String {
    let version = if !core_version.starts_with('v') && core_version.len() > 8 {
        core_version.get(..8).unwrap_or(core_version)
    } else {
        core_version
    };
    let mut name = format!(
        "{}_{}_{}_{}",
        core::PREFIX,
        version,
        platform.os,
        platform.arch
    );
    if platform.arch == "arm" {
        name.push_str(&platform.arm);
    }
    if custom {
        name.push_str("_custom");
    }
    name
}

/// Deploys handle exactly the core, or the core plus one plugin
fn validate_deploy_cardinality(pkgs: &BTreeMap<String, String>) -> SmithResult<()> {
    match pkgs.len() {
        0 => Err(SmithError::NothingToDeploy),
        1 | 2 => {
            if pkgs.contains_key(core::PACKAGE) {
                Ok(())
            } else {
                Err(SmithError::NoCorePackage)
            }
        }
        _ => Err(SmithError::TooManyPackages),
    }
}

async fn copy_blocking(src: PathBuf, dest: PathBuf, opts: CopyOptions) -> SmithResult<()> {
    tokio::task::spawn_blocking(move || deep_copy(&src, &dest, &opts))
        .await
        .map_err(|e| SmithError::Internal(format!("copy task failed: {e}")))?
}
