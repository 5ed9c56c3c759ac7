//! Archive formats and extraction
//!
//! Entries are written one by one after their path has been checked, so a
//! malicious archive can neither escape the destination directory nor plant
//! links or device files.

use crate::errors::FetchError;
use flate2::read::GzDecoder;
use std::fs::{self, File};
use std::io::{self, Read};
use std::path::{Component, Path, PathBuf};
use tracing::{debug, instrument};

const S_IFMT: u32 = 0o170000;
const S_IFREG: u32 = 0o100000;
const S_IFDIR: u32 = 0o040000;

/// Supported archive formats
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArchiveKind {
    Zip,
    Tar,
    TarGz,
}

impl ArchiveKind {
    /// Pick the format from an explicit type, or from the URI extension
    pub fn resolve(uri: &str, hint: Option<&str>) -> Result<Self, FetchError> {
        let unsupported = |kind: &str| FetchError::UnsupportedFormat {
            uri: uri.to_string(),
            kind: kind.to_string(),
        };

        if let Some(hint) = hint.map(str::trim).filter(|h| !h.is_empty()) {
            return match hint.to_ascii_lowercase().as_str() {
                "zip" | "jar" => Ok(ArchiveKind::Zip),
                "tar" => Ok(ArchiveKind::Tar),
                "tgz" | "tar.gz" | "gz" | "gzip" => Ok(ArchiveKind::TarGz),
                _ => Err(unsupported(hint)),
            };
        }

        let path = uri
            .split(['?', '#'])
            .next()
            .unwrap_or(uri)
            .to_ascii_lowercase();
        if path.ends_with(".zip") || path.ends_with(".jar") {
            Ok(ArchiveKind::Zip)
        } else if path.ends_with(".tar.gz") || path.ends_with(".tgz") {
            Ok(ArchiveKind::TarGz)
        } else if path.ends_with(".tar") {
            Ok(ArchiveKind::Tar)
        } else {
            let ext = path.rsplit_once('.').map(|(_, ext)| ext).unwrap_or("");
            Err(unsupported(ext))
        }
    }

    /// File extension used for cached archives
    pub fn extension(&self) -> &'static str {
        match self {
            ArchiveKind::Zip => "zip",
            ArchiveKind::Tar => "tar",
            ArchiveKind::TarGz => "tgz",
        }
    }
}

/// Unpack `archive` of type `kind` into `dest`
#[instrument(skip_all, fields(archive = %archive.display(), dest = %dest.display()))]
pub fn extract(archive: &Path, kind: ArchiveKind, dest: &Path) -> Result<(), FetchError> {
    fs::create_dir_all(dest).map_err(|source| io_error(dest, source))?;
    let file = File::open(archive).map_err(|source| io_error(archive, source))?;

    match kind {
        ArchiveKind::Zip => extract_zip(file, dest)?,
        ArchiveKind::Tar => extract_tar(file, dest)?,
        ArchiveKind::TarGz => extract_tar(GzDecoder::new(file), dest)?,
    }
    debug!("Extraction finished");
    Ok(())
}

fn extract_zip(file: File, dest: &Path) -> Result<(), FetchError> {
    let mut zip = zip::ZipArchive::new(file).map_err(|e| FetchError::Extraction {
        message: format!("Failed to open zip archive: {}", e),
    })?;

    for i in 0..zip.len() {
        let mut entry = zip.by_index(i).map_err(|e| FetchError::Extraction {
            message: format!("Failed to read zip entry {}: {}", i, e),
        })?;
        let name = entry.name().to_string();
        let relative = safe_relative_path(&name)?;
        if relative.as_os_str().is_empty() {
            if entry.is_dir() {
                continue;
            }
            return Err(FetchError::PathTraversal { entry: name });
        }
        let mode = entry.unix_mode();

        if let Some(mode) = mode {
            let kind = mode & S_IFMT;
            if kind != 0 && kind != S_IFREG && kind != S_IFDIR {
                return Err(FetchError::UnsupportedEntry {
                    entry: name,
                    kind: format!("mode {:o}", kind),
                });
            }
        }

        let target = dest.join(&relative);
        if entry.is_dir() {
            fs::create_dir_all(&target).map_err(|source| io_error(&target, source))?;
            continue;
        }
        write_entry(&mut entry, &target, mode)?;
    }
    Ok(())
}

fn extract_tar<R: Read>(reader: R, dest: &Path) -> Result<(), FetchError> {
    let mut archive = tar::Archive::new(reader);
    let entries = archive.entries().map_err(|e| FetchError::Extraction {
        message: format!("Failed to read tar archive: {}", e),
    })?;

    for entry in entries {
        let mut entry = entry.map_err(|e| FetchError::Extraction {
            message: format!("Failed to read tar entry: {}", e),
        })?;
        let entry_type = entry.header().entry_type();
        if entry_type.is_pax_global_extensions()
            || entry_type.is_pax_local_extensions()
            || entry_type.is_gnu_longname()
            || entry_type.is_gnu_longlink()
        {
            continue;
        }

        let name = entry
            .path()
            .map_err(|e| FetchError::Extraction {
                message: format!("Invalid tar entry path: {}", e),
            })?
            .to_string_lossy()
            .into_owned();
        let relative = safe_relative_path(&name)?;
        if relative.as_os_str().is_empty() {
            if entry_type.is_dir() {
                continue;
            }
            return Err(FetchError::PathTraversal { entry: name });
        }
        let target = dest.join(&relative);

        if entry_type.is_dir() {
            fs::create_dir_all(&target).map_err(|source| io_error(&target, source))?;
        } else if entry_type.is_file() || entry_type == tar::EntryType::Continuous {
            let mode = entry.header().mode().ok();
            write_entry(&mut entry, &target, mode)?;
        } else {
            return Err(FetchError::UnsupportedEntry {
                entry: name,
                kind: format!("{:?}", entry_type),
            });
        }
    }
    Ok(())
}

/// Normalize an entry name, rejecting anything that could leave the destination
///
/// The archive root itself (`./`) normalizes to an empty path.
fn safe_relative_path(name: &str) -> Result<PathBuf, FetchError> {
    let traversal = || FetchError::PathTraversal {
        entry: name.to_string(),
    };
    let mut relative = PathBuf::new();
    for component in Path::new(name).components() {
        match component {
            Component::Normal(part) => relative.push(part),
            Component::CurDir => {}
            Component::ParentDir | Component::RootDir | Component::Prefix(_) => {
                return Err(traversal())
            }
        }
    }
    Ok(relative)
}

fn write_entry<R: Read>(reader: &mut R, target: &Path, mode: Option<u32>) -> Result<(), FetchError> {
    if let Some(parent) = target.parent() {
        fs::create_dir_all(parent).map_err(|source| io_error(parent, source))?;
    }
    let mut out = File::create(target).map_err(|source| io_error(target, source))?;
    io::copy(reader, &mut out).map_err(|source| io_error(target, source))?;
    set_mode(target, mode)
}

#[cfg(unix)]
fn set_mode(target: &Path, mode: Option<u32>) -> Result<(), FetchError> {
    use std::os::unix::fs::PermissionsExt;
    if let Some(mode) = mode {
        let perms = fs::Permissions::from_mode(mode & 0o7777);
        fs::set_permissions(target, perms).map_err(|source| io_error(target, source))?;
    }
    Ok(())
}

#[cfg(not(unix))]
fn set_mode(_target: &Path, _mode: Option<u32>) -> Result<(), FetchError> {
    Ok(())
}

fn io_error(path: &Path, source: io::Error) -> FetchError {
    FetchError::Io {
        path: path.display().to_string(),
        source,
    }
}
