//! Release archive packaging
//!
//! Bundles the built binary and the distribution manifest into a `.zip`
//! (windows, darwin) or `.tar.gz` (everything else). Every listed entry
//! lands at the top of the archive under its base name; directories are
//! recursed. Packing is synchronous; async callers use the blocking pool.

use crate::error::{SmithError, SmithResult};
use flate2::write::GzEncoder;
use flate2::Compression;
use std::fs::File;
use std::io::{self, Read, Write};
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use walkdir::WalkDir;
use zip::write::SimpleFileOptions;
use zip::ZipWriter;

/// Archive container formats
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Format {
    TarGz,
    Zip,
}

impl Format {
    /// windows and darwin users expect zip; everyone else tarballs
    pub fn for_os(os: &str) -> Self {
        if os == "windows" || os == "darwin" {
            Format::Zip
        } else {
            Format::TarGz
        }
    }

    pub fn extension(&self) -> &'static str {
        match self {
            Format::TarGz => ".tar.gz",
            Format::Zip => ".zip",
        }
    }
}

/// Create an archive at `dest` containing each of `entries` under its
/// base name. Entries must exist; directories are added recursively.
pub fn create(dest: &Path, format: Format, entries: &[PathBuf]) -> SmithResult<()> {
    match format {
        Format::TarGz => create_tar_gz(dest, entries),
        Format::Zip => create_zip(dest, entries),
    }
    .map_err(|e| SmithError::Archive(format!("{}: {e}", dest.display())))
}

fn base_name(path: &Path) -> io::Result<String> {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .ok_or_else(|| io::Error::other(format!("entry {} has no name", path.display())))
}

fn create_tar_gz(dest: &Path, entries: &[PathBuf]) -> io::Result<()> {
    let gz = GzEncoder::new(File::create(dest)?, Compression::default());
    let mut builder = tar::Builder::new(gz);
    builder.follow_symlinks(false);

    for entry in entries {
        let name = base_name(entry)?;
        let meta = std::fs::metadata(entry)?;
        if meta.is_dir() {
            builder.append_dir_all(&name, entry)?;
        } else {
            builder.append_path_with_name(entry, &name)?;
        }
    }

    builder.into_inner()?.finish()?.sync_all()?;
    Ok(())
}

fn create_zip(dest: &Path, entries: &[PathBuf]) -> io::Result<()> {
    let mut writer = ZipWriter::new(File::create(dest)?);

    for entry in entries {
        let name = base_name(entry)?;
        let meta = std::fs::metadata(entry)?;
        if meta.is_dir() {
            for item in WalkDir::new(entry) {
                let item = item.map_err(io::Error::other)?;
                let relative = item
                    .path()
                    .strip_prefix(entry)
                    .map_err(io::Error::other)?;
                let stored = if relative.as_os_str().is_empty() {
                    name.clone()
                } else {
                    format!("{name}/{}", relative.to_string_lossy())
                };
                if item.file_type().is_dir() {
                    zip_add_dir(&mut writer, &stored, &item.metadata().map_err(io::Error::other)?)?;
                } else if item.file_type().is_file() {
                    zip_add_file(
                        &mut writer,
                        &stored,
                        item.path(),
                        &item.metadata().map_err(io::Error::other)?,
                    )?;
                }
            }
        } else {
            zip_add_file(&mut writer, &name, entry, &meta)?;
        }
    }

    writer.finish().map_err(io::Error::other)?.sync_all()?;
    Ok(())
}

fn zip_options(meta: &std::fs::Metadata) -> SimpleFileOptions {
    SimpleFileOptions::default()
        .compression_method(zip::CompressionMethod::Deflated)
        .unix_permissions(meta.permissions().mode() & 0o777)
}

fn zip_add_dir(writer: &mut ZipWriter<File>, name: &str, meta: &std::fs::Metadata) -> io::Result<()> {
    writer
        .add_directory(name, zip_options(meta))
        .map_err(io::Error::other)
}

fn zip_add_file(
    writer: &mut ZipWriter<File>,
    name: &str,
    path: &Path,
    meta: &std::fs::Metadata,
) -> io::Result<()> {
    writer
        .start_file(name, zip_options(meta))
        .map_err(io::Error::other)?;
    let mut file = File::open(path)?;
    let mut buf = [0u8; 64 * 1024];
    loop {
        let n = file.read(&mut buf)?;
        if n == 0 {
            break;
        }
        writer.write_all(&buf[..n])?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    fn fixture() -> (TempDir, Vec<PathBuf>) {
        let temp = TempDir::new().unwrap();
        let binary = temp.path().join("vessel");
        fs::write(&binary, b"\x7fELFfake").unwrap();
        fs::set_permissions(&binary, fs::Permissions::from_mode(0o755)).unwrap();

        let dist = temp.path().join("dist");
        fs::create_dir_all(dist.join("init")).unwrap();
        fs::write(dist.join("README.txt"), "readme").unwrap();
        fs::write(dist.join("init/service.conf"), "svc").unwrap();

        let entries = vec![
            dist.join("README.txt"),
            dist.join("init"),
            binary,
        ];
        (temp, entries)
    }

    #[test]
    fn format_by_os() {
        assert_eq!(Format::for_os("windows"), Format::Zip);
        assert_eq!(Format::for_os("darwin"), Format::Zip);
        assert_eq!(Format::for_os("linux"), Format::TarGz);
        assert_eq!(Format::for_os("freebsd"), Format::TarGz);
    }

    #[test]
    fn tar_gz_has_gzip_magic_and_all_entries() {
        let (temp, entries) = fixture();
        let dest = temp.path().join("out.tar.gz");
        create(&dest, Format::TarGz, &entries).unwrap();

        let bytes = fs::read(&dest).unwrap();
        assert_eq!(&bytes[..2], &[0x1F, 0x8B]);

        let decoder = flate2::read::GzDecoder::new(&bytes[..]);
        let mut archive = tar::Archive::new(decoder);
        let names: Vec<String> = archive
            .entries()
            .unwrap()
            .map(|e| e.unwrap().path().unwrap().to_string_lossy().into_owned())
            .collect();
        assert!(names.contains(&"README.txt".to_string()));
        assert!(names.contains(&"vessel".to_string()));
        assert!(names.iter().any(|n| n.starts_with("init/")));
    }

    #[test]
    fn zip_has_all_entries_with_modes() {
        let (temp, entries) = fixture();
        let dest = temp.path().join("out.zip");
        create(&dest, Format::Zip, &entries).unwrap();

        let mut archive = zip::ZipArchive::new(File::open(&dest).unwrap()).unwrap();
        let names: Vec<String> = (0..archive.len())
            .map(|i| archive.by_index(i).unwrap().name().to_string())
            .collect();
        assert!(names.contains(&"README.txt".to_string()));
        assert!(names.contains(&"vessel".to_string()));
        assert!(names.iter().any(|n| n.starts_with("init/")));

        let binary = archive.by_name("vessel").unwrap();
        assert_eq!(binary.unix_mode().unwrap() & 0o777, 0o755);
    }

    #[test]
    fn missing_entry_is_an_error() {
        let temp = TempDir::new().unwrap();
        let dest = temp.path().join("out.tar.gz");
        let err = create(
            &dest,
            Format::TarGz,
            &[temp.path().join("nope.txt")],
        )
        .unwrap_err();
        assert!(matches!(err, SmithError::Archive(_)));
    }
}
