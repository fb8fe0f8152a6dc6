//! Zipping of directory-style artifacts (app bundles, dSYMs) into temporary archives.

use std::fs;
use std::io;
use std::path::{
    Path,
    PathBuf,
};

use tempfile::NamedTempFile;
use walkdir::WalkDir;
use zip::write::FileOptions;
use zip::{
    CompressionMethod,
    ZipWriter,
};

#[allow(unused_imports)]
use tracing::{
    debug,
    info,
    trace,
};

use crate::error::UploadError;

/// A zip on disk, deleted when dropped.
#[derive(Debug)]
pub struct TempArchive {
    file: NamedTempFile,
}

impl TempArchive {
    pub fn path(&self) -> &Path {
        self.file.path()
    }
}

fn entry_name(relative: &Path) -> String {
    relative
        .components()
        .map(|c| c.as_os_str().to_string_lossy())
        .collect::<Vec<_>>()
        .join("/")
}

#[cfg(unix)]
fn mode_of(meta: &fs::Metadata) -> u32 {
    use std::os::unix::fs::PermissionsExt;
    meta.permissions().mode()
}

#[cfg(not(unix))]
fn mode_of(meta: &fs::Metadata) -> u32 {
    if meta.is_dir() {
        0o755
    } else {
        0o644
    }
}

fn add_tree<W: io::Write + io::Seek>(zip: &mut ZipWriter<W>, dir: &Path) -> io::Result<usize> {
    // entries are named relative to the parent so the archive holds `Name.app/...`
    let base = dir.parent().unwrap_or_else(|| Path::new(""));
    let mut count = 0;
    for entry in WalkDir::new(dir).follow_links(false) {
        let entry = entry.map_err(io::Error::from)?;
        let relative = entry
            .path()
            .strip_prefix(base)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;
        let name = entry_name(relative);
        let meta = entry.path().symlink_metadata()?;
        let options = FileOptions::default()
            .compression_method(CompressionMethod::Deflated)
            .unix_permissions(mode_of(&meta) & 0o7777);
        let file_type = entry.file_type();
        if file_type.is_symlink() {
            let target = fs::read_link(entry.path())?;
            zip.add_symlink(name, target.to_string_lossy(), options)?;
        } else if file_type.is_dir() {
            zip.add_directory(name, options)?;
        } else {
            zip.start_file(name, options)?;
            io::copy(&mut fs::File::open(entry.path())?, zip)?;
        }
        count += 1;
    }
    Ok(count)
}

/// Zips each directory into one temporary archive.
pub fn zip_directories(dirs: &[PathBuf]) -> Result<TempArchive, UploadError> {
    let label = dirs.first().cloned().unwrap_or_default();
    let fail = |reason: String| UploadError::Archive {
        path: label.clone(),
        reason,
    };
    let file = tempfile::Builder::new()
        .prefix("waldo-")
        .suffix(".zip")
        .tempfile()
        .map_err(|e| fail(e.to_string()))?;
    let mut zip = ZipWriter::new(file);
    for dir in dirs {
        if !dir.is_dir() {
            return Err(UploadError::Archive {
                path: dir.clone(),
                reason: "not a directory".to_owned(),
            });
        }
        let count = add_tree(&mut zip, dir).map_err(|e| UploadError::Archive {
            path: dir.clone(),
            reason: e.to_string(),
        })?;
        debug!("archived {} entries from {}", count, dir.display());
    }
    let file = zip.finish().map_err(|e| fail(e.to_string()))?;
    info!("created archive {}", file.path().display());
    Ok(TempArchive { file })
}

/// `*.dSYM` directories that Xcode left next to the app bundle.
pub fn dsyms_next_to(app: &Path) -> Vec<PathBuf> {
    let Some(dir) = app.parent() else {
        return Vec::new();
    };
    let mut found: Vec<PathBuf> = WalkDir::new(dir)
        .min_depth(1)
        .max_depth(1)
        .into_iter()
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.file_type().is_dir())
        .map(|entry| entry.into_path())
        .filter(|path| {
            path.extension()
                .map(|e| e.eq_ignore_ascii_case("dSYM"))
                .unwrap_or(false)
        })
        .collect();
    found.sort();
    found
}
