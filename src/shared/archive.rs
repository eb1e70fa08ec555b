//! Unpacking packed packages (npm tarballs, sdists, wheels and zips) into a
//! scratch directory so they can be scanned like a source tree.
//!
//! Bad entries are skipped and the rest of the archive is kept. Only an
//! archive that cannot be opened at all is an error.

use crate::shared::config::LimitsConfig;
use crate::shared::error::{Error, Result};
use flate2::read::GzDecoder;
use std::fs::{self, File};
use std::io::{self, Read};
use std::path::{Path, PathBuf};
use tar::EntryType;
use tempfile::TempDir;
use tracing::debug;

const MAX_ENTRIES: usize = 20_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArchiveFormat {
    TarGz,
    Zip,
}

impl ArchiveFormat {
    /// Format implied by the file name: `.tgz`/`.tar.gz`, or `.zip`/`.whl`.
    pub fn detect(path: &Path) -> Option<Self> {
        let name = path.file_name()?.to_str()?.to_lowercase();
        if name.ends_with(".tgz") || name.ends_with(".tar.gz") {
            Some(Self::TarGz)
        } else if name.ends_with(".zip") || name.ends_with(".whl") {
            Some(Self::Zip)
        } else {
            None
        }
    }
}

/// File name with the archive suffix removed, e.g. `left-pad-1.3.0`.
pub fn stem(path: &Path) -> String {
    let name = path
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or("package");
    let lower = name.to_lowercase();
    let cut = [".tar.gz", ".tgz", ".zip", ".whl"]
        .iter()
        .find(|suffix| lower.ends_with(*suffix))
        .map_or(name.len(), |suffix| name.len() - suffix.len());
    name[..cut].to_string()
}

/// An unpacked archive. The scratch directory is removed on drop.
#[derive(Debug)]
pub struct Unpacked {
    _dir: TempDir,
    root: PathBuf,
    pub entries: usize,
    pub skipped: usize,
}

impl Unpacked {
    /// Directory to scan: the single top-level folder if the archive has one
    /// (npm's `package/`, sdist `name-1.0/`), otherwise the scratch root.
    pub fn root(&self) -> &Path {
        &self.root
    }
}

/// Unpack `path` into a fresh temporary directory.
///
/// Total unpacked bytes are bounded by `max_files * max_file_bytes`.
pub fn unpack(path: &Path, format: ArchiveFormat, limits: &LimitsConfig) -> Result<Unpacked> {
    let file = File::open(path)?;
    let dir = tempfile::Builder::new().prefix("pkgsentry-").tempdir()?;
    let mut budget = Budget {
        bytes_left: limits.max_file_bytes.saturating_mul(limits.max_files as u64),
        entries: 0,
        skipped: 0,
    };

    match format {
        ArchiveFormat::TarGz => unpack_tar(file, dir.path(), &mut budget),
        ArchiveFormat::Zip => unpack_zip(file, dir.path(), &mut budget)
            .map_err(|e| Error::Archive(format!("{}: {e}", path.display())))?,
    }

    if budget.entries == 0 && budget.skipped > 0 {
        return Err(Error::Archive(format!(
            "{}: no readable entries",
            path.display()
        )));
    }
    debug!(
        archive = %path.display(),
        entries = budget.entries,
        skipped = budget.skipped,
        "unpacked archive"
    );

    let root = single_top_dir(dir.path()).unwrap_or_else(|| dir.path().to_path_buf());
    Ok(Unpacked {
        _dir: dir,
        root,
        entries: budget.entries,
        skipped: budget.skipped,
    })
}

struct Budget {
    bytes_left: u64,
    entries: usize,
    skipped: usize,
}

impl Budget {
    fn exhausted(&self) -> bool {
        self.entries + self.skipped >= MAX_ENTRIES || self.bytes_left == 0
    }
}

fn unpack_tar(file: File, dest: &Path, budget: &mut Budget) {
    let mut archive = tar::Archive::new(GzDecoder::new(file));
    let entries = match archive.entries() {
        Ok(entries) => entries,
        Err(e) => {
            debug!("unreadable tar stream: {e}");
            budget.skipped += 1;
            return;
        }
    };

    for entry in entries {
        if budget.exhausted() {
            break;
        }
        let mut entry = match entry {
            Ok(entry) => entry,
            Err(e) => {
                // The stream is unusable past a corrupt header.
                debug!("corrupt tar entry: {e}");
                budget.skipped += 1;
                break;
            }
        };
        if !matches!(
            entry.header().entry_type(),
            EntryType::Regular | EntryType::Directory
        ) {
            budget.skipped += 1;
            continue;
        }
        let size = entry.header().size().unwrap_or(0);
        if size > budget.bytes_left {
            budget.skipped += 1;
            continue;
        }
        match entry.unpack_in(dest) {
            Ok(true) => {
                budget.bytes_left -= size;
                budget.entries += 1;
            }
            Ok(false) => {
                debug!("tar entry escapes the archive root");
                budget.skipped += 1;
            }
            Err(e) => {
                debug!("skipping tar entry: {e}");
                budget.skipped += 1;
            }
        }
    }
}

fn unpack_zip(file: File, dest: &Path, budget: &mut Budget) -> zip::result::ZipResult<()> {
    let mut archive = zip::ZipArchive::new(file)?;

    for i in 0..archive.len() {
        if budget.exhausted() {
            break;
        }
        let mut entry = match archive.by_index(i) {
            Ok(entry) => entry,
            Err(e) => {
                debug!("skipping zip entry {i}: {e}");
                budget.skipped += 1;
                continue;
            }
        };
        let Some(relative) = entry.enclosed_name().map(Path::to_path_buf) else {
            debug!(name = entry.name(), "zip entry escapes the archive root");
            budget.skipped += 1;
            continue;
        };
        let out_path = dest.join(relative);

        let written = if entry.is_dir() {
            fs::create_dir_all(&out_path).map(|_| 0)
        } else {
            write_bounded(&mut entry, &out_path, budget.bytes_left)
        };
        match written {
            Ok(bytes) => {
                budget.bytes_left -= bytes;
                budget.entries += 1;
            }
            Err(e) => {
                debug!(path = %out_path.display(), "skipping zip entry: {e}");
                budget.skipped += 1;
            }
        }
    }
    Ok(())
}

fn write_bounded(reader: &mut impl Read, out_path: &Path, max_bytes: u64) -> io::Result<u64> {
    if let Some(parent) = out_path.parent() {
        fs::create_dir_all(parent)?;
    }
    let mut out = File::create(out_path)?;
    io::copy(&mut reader.take(max_bytes), &mut out)
}

fn single_top_dir(dir: &Path) -> Option<PathBuf> {
    let mut entries = fs::read_dir(dir).ok()?.filter_map(|e| e.ok());
    let first = entries.next()?;
    if entries.next().is_some() || !first.file_type().ok()?.is_dir() {
        return None;
    }
    Some(first.path())
}
