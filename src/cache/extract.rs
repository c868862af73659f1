//! Safe archive extraction.
//!
//! Unpacks a verified archive into a staging directory, vetting every entry
//! path before it touches disk. tar.gz and zip are sniffed by magic bytes.
//! A single wrapping top-level directory is flattened so `index.js` lands at
//! the entry root.

use std::fs::File;
use std::io::{BufReader, Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};

use flate2::read::GzDecoder;
use tracing::debug;

use crate::error::{Error, Result};
use crate::pathsafe::{archive_entry_is_safe, resolve_under};

/// Guest entry file every package must carry at its top level.
pub const ENTRY_FILE: &str = "index.js";

/// Supported archive container formats.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArchiveFormat {
    TarGz,
    Zip,
}

/// Sniff the container format from magic bytes.
pub fn sniff_format(archive: &Path) -> Result<ArchiveFormat> {
    let mut file = File::open(archive)?;
    let mut magic = [0u8; 4];
    let read = file.read(&mut magic)?;
    if read >= 2 && magic[0] == 0x1f && magic[1] == 0x8b {
        return Ok(ArchiveFormat::TarGz);
    }
    if read >= 4 && &magic[..4] == b"PK\x03\x04" {
        return Ok(ArchiveFormat::Zip);
    }
    Err(Error::Internal(
        "archive is neither gzip-compressed tar nor zip".into(),
    ))
}

/// Extract `archive` into `staging`, returning the total extracted bytes.
///
/// Fails with `UnsafeArchive` if any entry path or symlink target would land
/// outside `staging`, and with `BadPackage` if the extracted tree has no
/// `index.js` at its top level.
pub fn extract_archive(function_id: &str, archive: &Path, staging: &Path) -> Result<u64> {
    std::fs::create_dir_all(staging)?;
    let total = match sniff_format(archive)? {
        ArchiveFormat::TarGz => extract_tar_gz(function_id, archive, staging)?,
        ArchiveFormat::Zip => extract_zip(function_id, archive, staging)?,
    };

    flatten_single_top_dir(staging)?;

    if !staging.join(ENTRY_FILE).is_file() {
        return Err(Error::bad_package(
            function_id,
            format!("extracted package has no top-level {}", ENTRY_FILE),
        ));
    }
    debug!(function_id, bytes = total, "archive extracted");
    Ok(total)
}

fn extract_tar_gz(function_id: &str, archive: &Path, staging: &Path) -> Result<u64> {
    let file = File::open(archive)?;
    let decoder = GzDecoder::new(BufReader::new(file));
    let mut tar = tar::Archive::new(decoder);
    let mut total = 0u64;

    for entry in tar.entries()? {
        let mut entry = entry?;
        let raw_path = entry.path()?.into_owned();
        if !archive_entry_is_safe(&raw_path) {
            return Err(Error::unsafe_archive(
                function_id,
                raw_path.to_string_lossy(),
            ));
        }
        let dest = resolve_under(staging, &raw_path).ok_or_else(|| {
            Error::unsafe_archive(function_id, raw_path.to_string_lossy())
        })?;

        match entry.header().entry_type() {
            tar::EntryType::Directory => {
                std::fs::create_dir_all(&dest)?;
            }
            tar::EntryType::Regular | tar::EntryType::Continuous => {
                if let Some(parent) = dest.parent() {
                    std::fs::create_dir_all(parent)?;
                }
                let size = entry.header().size()?;
                entry.unpack(&dest)?;
                total += size;
            }
            tar::EntryType::Symlink => {
                let target = entry
                    .link_name()?
                    .ok_or_else(|| Error::unsafe_archive(function_id, "symlink without target"))?
                    .into_owned();
                // The target resolves relative to the link's directory; both
                // ends must stay inside the staging root.
                let link_dir = raw_path.parent().unwrap_or_else(|| Path::new(""));
                let resolved = link_dir.join(&target);
                if resolve_under(staging, &resolved).is_none() {
                    return Err(Error::unsafe_archive(
                        function_id,
                        format!("{} -> {}", raw_path.display(), target.display()),
                    ));
                }
                if let Some(parent) = dest.parent() {
                    std::fs::create_dir_all(parent)?;
                }
                #[cfg(unix)]
                std::os::unix::fs::symlink(&target, &dest)?;
                #[cfg(not(unix))]
                return Err(Error::unsafe_archive(function_id, "symlink entries unsupported"));
            }
            other => {
                return Err(Error::unsafe_archive(
                    function_id,
                    format!("{}: unsupported entry type {:?}", raw_path.display(), other),
                ));
            }
        }
    }
    Ok(total)
}

fn extract_zip(function_id: &str, archive: &Path, staging: &Path) -> Result<u64> {
    let mut file = File::open(archive)?;
    file.seek(SeekFrom::Start(0))?;
    let mut zip = zip::ZipArchive::new(file)
        .map_err(|e| Error::bad_package(function_id, format!("unreadable zip: {}", e)))?;
    let mut total = 0u64;

    for index in 0..zip.len() {
        let mut entry = zip
            .by_index(index)
            .map_err(|e| Error::bad_package(function_id, format!("zip entry {}: {}", index, e)))?;

        // enclosed_name already refuses absolute paths and parent hops.
        let relative: PathBuf = match entry.enclosed_name() {
            Some(name) => name.to_path_buf(),
            None => {
                return Err(Error::unsafe_archive(function_id, entry.name()));
            }
        };
        let dest = resolve_under(staging, &relative)
            .ok_or_else(|| Error::unsafe_archive(function_id, entry.name()))?;

        if entry.is_dir() {
            std::fs::create_dir_all(&dest)?;
            continue;
        }
        if let Some(parent) = dest.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let mut out = File::create(&dest)?;
        let written = std::io::copy(&mut entry, &mut out)?;
        total += written;
    }
    Ok(total)
}

/// If the staging tree is exactly one directory (the common
/// `package-1.2.3/` wrapper) and has no top-level entry file, hoist the
/// wrapper's children up one level.
fn flatten_single_top_dir(staging: &Path) -> Result<()> {
    if staging.join(ENTRY_FILE).is_file() {
        return Ok(());
    }
    let entries: Vec<_> = std::fs::read_dir(staging)?
        .collect::<std::io::Result<Vec<_>>>()?;
    if entries.len() != 1 || !entries[0].path().is_dir() {
        return Ok(());
    }

    let wrapper = entries[0].path();
    for child in std::fs::read_dir(&wrapper)? {
        let child = child?;
        let target = staging.join(child.file_name());
        std::fs::rename(child.path(), target)?;
    }
    std::fs::remove_dir(&wrapper)?;
    Ok(())
}

/// Recursively measure a directory in bytes.
pub fn dir_size(path: &Path) -> u64 {
    let mut total = 0u64;
    let Ok(entries) = std::fs::read_dir(path) else {
        return 0;
    };
    for entry in entries.flatten() {
        let entry_path = entry.path();
        if entry_path.is_dir() {
            total += dir_size(&entry_path);
        } else if let Ok(meta) = entry.metadata() {
            total += meta.len();
        }
    }
    total
}
