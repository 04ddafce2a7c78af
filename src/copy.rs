//! Deep directory copies
//!
//! Mirrors a source tree into a destination with optional filters for
//! hidden entries, symlinks, and test files, preserving permission bits
//! and (optionally) ownership. Used to branch ephemeral workspaces from
//! the master cache and to snapshot the master cache before deploys.
//!
//! Copies are synchronous; async callers run them on the blocking pool.

use crate::error::{SmithError, SmithResult};
use std::fs::{self, File, OpenOptions};
use std::io;
use std::os::unix::fs::{MetadataExt, PermissionsExt};
use std::path::{Component, Path, PathBuf};
use walkdir::WalkDir;

/// Name of directories holding test fixtures, skipped by
/// [`CopyOptions::skip_test_files`]
const TESTDATA_DIR: &str = "testdata";

/// Filters and ownership policy for a deep copy
#[derive(Debug, Clone)]
pub struct CopyOptions {
    /// Skip files and directories whose name starts with "."
    pub skip_hidden: bool,
    /// Skip symbolic links (neither the link nor its target is copied)
    pub skip_symlinks: bool,
    /// Skip `testdata` directories and files ending in the test suffix
    pub skip_test_files: bool,
    /// Give each destination the source's uid/gid instead of the build uid
    pub preserve_owner: bool,
    /// Suffix identifying test files (a property of the core's language
    /// toolchain, not of this copier)
    pub test_suffix: String,
    /// uid/gid to chown destinations to when not preserving ownership;
    /// `None` leaves them owned by the current user
    pub build_uid: Option<u32>,
}

impl Default for CopyOptions {
    fn default() -> Self {
        Self {
            skip_hidden: false,
            skip_symlinks: false,
            skip_test_files: false,
            preserve_owner: false,
            test_suffix: "_test.go".to_string(),
            build_uid: None,
        }
    }
}

impl CopyOptions {
    /// The flag set used when branching a workspace from the master cache
    /// and when snapshotting the master cache: keep hidden entries (the
    /// VCS metadata must survive) and symlinks, drop test fixtures.
    pub fn provisioning(build_uid: Option<u32>) -> Self {
        Self {
            skip_test_files: true,
            build_uid,
            ..Self::default()
        }
    }

    fn skips(&self, entry: &walkdir::DirEntry) -> bool {
        let name = entry.file_name().to_string_lossy();
        if self.skip_hidden && name.starts_with('.') {
            return true;
        }
        if self.skip_test_files {
            if entry.file_type().is_dir() && name == TESTDATA_DIR {
                return true;
            }
            if !entry.file_type().is_dir() && name.ends_with(&self.test_suffix) {
                return true;
            }
        }
        false
    }
}

/// Mirror `src` into `dest`, overwriting any existing files.
///
/// Every missing component of `dest` is created individually (ownership
/// must apply to each newly created ancestor, which a single recursive
/// create cannot do); existing ancestors are left untouched. File copies
/// fsync before close. On error, partial output may exist at `dest`.
pub fn deep_copy(src: &Path, dest: &Path, opts: &CopyOptions) -> SmithResult<()> {
    copy_inner(src, dest, opts).map_err(|e| SmithError::Copy {
        src: src.to_path_buf(),
        dest: dest.to_path_buf(),
        source: e,
    })
}

fn copy_inner(src: &Path, dest: &Path, opts: &CopyOptions) -> io::Result<()> {
    let src_meta = fs::metadata(src)?;

    // pre-walk: materialize each missing ancestor of dest individually
    let mut so_far = PathBuf::new();
    for component in dest.components() {
        so_far.push(component.as_os_str());
        if matches!(component, Component::RootDir | Component::Prefix(_)) {
            continue;
        }
        match fs::symlink_metadata(&so_far) {
            Ok(_) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                fs::create_dir(&so_far)?;
                fs::set_permissions(
                    &so_far,
                    fs::Permissions::from_mode(src_meta.permissions().mode() & 0o777),
                )?;
                set_owner(&src_meta, &so_far, opts)?;
            }
            Err(e) => return Err(e),
        }
    }

    let mut walker = WalkDir::new(src).into_iter();
    while let Some(entry) = walker.next() {
        let entry = entry.map_err(io::Error::other)?;
        if entry.depth() == 0 {
            continue; // the root was handled by the pre-walk
        }

        if opts.skips(&entry) {
            if entry.file_type().is_dir() {
                walker.skip_current_dir();
            }
            continue;
        }

        let target = dest.join(entry.path().strip_prefix(src).map_err(io::Error::other)?);
        let meta = entry.metadata().map_err(io::Error::other)?;

        if entry.path_is_symlink() {
            if opts.skip_symlinks {
                continue;
            }
            let link = fs::read_link(entry.path())?;
            if fs::symlink_metadata(&target).is_ok() {
                fs::remove_file(&target)?;
            }
            std::os::unix::fs::symlink(link, &target)?;
            continue;
        }

        if entry.file_type().is_dir() {
            match fs::symlink_metadata(&target) {
                Ok(_) => {}
                Err(e) if e.kind() == io::ErrorKind::NotFound => {
                    fs::create_dir(&target)?;
                    fs::set_permissions(
                        &target,
                        fs::Permissions::from_mode(meta.permissions().mode() & 0o777),
                    )?;
                }
                Err(e) => return Err(e),
            }
            set_owner(&meta, &target, opts)?;
            continue;
        }

        copy_file(entry.path(), &target, &meta, opts)?;
    }

    Ok(())
}

fn copy_file(src: &Path, dest: &Path, meta: &fs::Metadata, opts: &CopyOptions) -> io::Result<()> {
    let mut reader = File::open(src)?;
    let mut writer = OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .open(dest)?;
    writer.set_permissions(fs::Permissions::from_mode(meta.permissions().mode() & 0o777))?;
    set_owner(meta, dest, opts)?;
    io::copy(&mut reader, &mut writer)?;
    writer.sync_all()?;
    Ok(())
}

fn set_owner(src_meta: &fs::Metadata, dest: &Path, opts: &CopyOptions) -> io::Result<()> {
    let (uid, gid) = if opts.preserve_owner {
        (src_meta.uid(), src_meta.gid())
    } else {
        match opts.build_uid {
            Some(id) => (id, id),
            None => return Ok(()),
        }
    };
    nix::unistd::chown(
        dest,
        Some(nix::unistd::Uid::from_raw(uid)),
        Some(nix::unistd::Gid::from_raw(gid)),
    )
    .map_err(io::Error::from)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn tree() -> (TempDir, PathBuf) {
        let temp = TempDir::new().unwrap();
        let src = temp.path().join("src");
        fs::create_dir_all(src.join("pkg/testdata")).unwrap();
        fs::create_dir_all(src.join(".git/refs")).unwrap();
        fs::write(src.join("pkg/lib.go"), "package pkg\n").unwrap();
        fs::write(src.join("pkg/lib_test.go"), "package pkg\n").unwrap();
        fs::write(src.join("pkg/testdata/fixture.txt"), "x").unwrap();
        fs::write(src.join(".git/refs/HEAD"), "ref").unwrap();
        fs::write(src.join(".hidden"), "h").unwrap();
        std::os::unix::fs::symlink("pkg/lib.go", src.join("link.go")).unwrap();
        (temp, src)
    }

    #[test]
    fn copies_everything_by_default() {
        let (temp, src) = tree();
        let dest = temp.path().join("dest");
        deep_copy(&src, &dest, &CopyOptions::default()).unwrap();

        assert!(dest.join("pkg/lib.go").is_file());
        assert!(dest.join("pkg/lib_test.go").is_file());
        assert!(dest.join("pkg/testdata/fixture.txt").is_file());
        assert!(dest.join(".git/refs/HEAD").is_file());
        assert!(dest.join(".hidden").is_file());
        assert!(dest.join("link.go").symlink_metadata().unwrap().is_symlink());
    }

    #[test]
    fn provisioning_flags_drop_test_files_but_keep_vcs() {
        let (temp, src) = tree();
        let dest = temp.path().join("dest");
        deep_copy(&src, &dest, &CopyOptions::provisioning(None)).unwrap();

        assert!(dest.join("pkg/lib.go").is_file());
        assert!(!dest.join("pkg/lib_test.go").exists());
        assert!(!dest.join("pkg/testdata").exists());
        assert!(dest.join(".git/refs/HEAD").is_file());
    }

    #[test]
    fn skip_hidden_suppresses_descent() {
        let (temp, src) = tree();
        let dest = temp.path().join("dest");
        let opts = CopyOptions {
            skip_hidden: true,
            ..CopyOptions::default()
        };
        deep_copy(&src, &dest, &opts).unwrap();

        assert!(!dest.join(".hidden").exists());
        assert!(!dest.join(".git").exists());
        assert!(dest.join("pkg/lib.go").is_file());
    }

    #[test]
    fn skip_symlinks_omits_the_link() {
        let (temp, src) = tree();
        let dest = temp.path().join("dest");
        let opts = CopyOptions {
            skip_symlinks: true,
            ..CopyOptions::default()
        };
        deep_copy(&src, &dest, &opts).unwrap();

        assert!(!dest.join("link.go").exists());
        assert!(dest.join("pkg/lib.go").is_file());
    }

    #[test]
    fn custom_test_suffix() {
        let temp = TempDir::new().unwrap();
        let src = temp.path().join("src");
        fs::create_dir_all(&src).unwrap();
        fs::write(src.join("spec.rb"), "x").unwrap();
        fs::write(src.join("code_test.rb"), "x").unwrap();

        let dest = temp.path().join("dest");
        let opts = CopyOptions {
            skip_test_files: true,
            test_suffix: "_test.rb".to_string(),
            ..CopyOptions::default()
        };
        deep_copy(&src, &dest, &opts).unwrap();

        assert!(dest.join("spec.rb").is_file());
        assert!(!dest.join("code_test.rb").exists());
    }

    #[test]
    fn preserves_permission_bits() {
        let (temp, src) = tree();
        fs::set_permissions(src.join("pkg/lib.go"), fs::Permissions::from_mode(0o751)).unwrap();
        let dest = temp.path().join("dest");
        deep_copy(&src, &dest, &CopyOptions::default()).unwrap();

        let mode = fs::metadata(dest.join("pkg/lib.go"))
            .unwrap()
            .permissions()
            .mode();
        assert_eq!(mode & 0o777, 0o751);
    }

    #[test]
    fn second_copy_overwrites_with_identical_bytes() {
        let (temp, src) = tree();
        let dest = temp.path().join("dest");
        deep_copy(&src, &dest, &CopyOptions::default()).unwrap();

        // mutate the destination, then copy again
        fs::write(dest.join("pkg/lib.go"), "tampered").unwrap();
        deep_copy(&src, &dest, &CopyOptions::default()).unwrap();

        assert_eq!(
            fs::read(src.join("pkg/lib.go")).unwrap(),
            fs::read(dest.join("pkg/lib.go")).unwrap()
        );
    }

    #[test]
    fn creates_missing_destination_ancestors() {
        let (temp, src) = tree();
        let dest = temp.path().join("a/b/c/dest");
        deep_copy(&src, &dest, &CopyOptions::default()).unwrap();
        assert!(dest.join("pkg/lib.go").is_file());
    }
}
