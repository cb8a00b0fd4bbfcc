//! Secure zip extraction and deterministic packing.
//!
//! Extraction treats the archive as hostile: entries may not escape the
//! destination, symlinks are rejected outright, and the caller supplies hard
//! limits on entry count and byte volume.

use std::fs;
use std::io::{self, Read, Seek, Write};
use std::path::{Path, PathBuf};

use thiserror::Error;
use zip::write::SimpleFileOptions;
use zip::{CompressionMethod, ZipArchive, ZipWriter};

#[derive(Debug, Clone, Copy)]
pub struct ExtractLimits {
    pub max_files: usize,
    pub max_total_bytes: u64,
    pub max_file_bytes: u64,
}

#[derive(Error, Debug)]
pub enum ArchiveError {
    #[error("invalid extraction limits")]
    InvalidLimits,

    #[error("zip entry name cannot be empty")]
    EmptyEntryName,

    #[error("absolute zip entry path not allowed: {0}")]
    AbsoluteEntry(String),

    #[error("path traversal zip entry not allowed: {0}")]
    TraversalEntry(String),

    #[error("symlink entry not allowed: {0}")]
    SymlinkEntry(String),

    #[error("zip has too many entries: {count} > {max}")]
    TooManyEntries { count: usize, max: usize },

    #[error("zip entry too large: {0}")]
    EntryTooLarge(String),

    #[error("zip total size exceeds limit")]
    TotalTooLarge,

    #[error("zip error: {0}")]
    Zip(#[from] zip::result::ZipError),

    #[error("io error: {0}")]
    Io(#[from] io::Error),
}

/// Extract `zip_path` into `dest`, enforcing `limits`. Returns the relative
/// paths of the files written.
pub fn extract_zip(
    zip_path: &Path,
    dest: &Path,
    limits: ExtractLimits,
) -> Result<Vec<String>, ArchiveError> {
    if limits.max_files == 0 || limits.max_total_bytes == 0 || limits.max_file_bytes == 0 {
        return Err(ArchiveError::InvalidLimits);
    }
    fs::create_dir_all(dest)?;

    let file = fs::File::open(zip_path)?;
    let mut archive = ZipArchive::new(file)?;

    let mut total: u64 = 0;
    let mut count: usize = 0;
    let mut created = Vec::new();

    for index in 0..archive.len() {
        let mut entry = archive.by_index(index)?;
        let entry_name = sanitize_entry_name(entry.name())?;

        count += 1;
        if count > limits.max_files {
            return Err(ArchiveError::TooManyEntries {
                count,
                max: limits.max_files,
            });
        }

        if is_symlink(entry.unix_mode()) {
            return Err(ArchiveError::SymlinkEntry(entry.name().to_string()));
        }

        let target: PathBuf = dest.join(&entry_name);

        if entry.is_dir() {
            fs::create_dir_all(&target)?;
            continue;
        }

        if entry.size() > limits.max_file_bytes {
            return Err(ArchiveError::EntryTooLarge(entry.name().to_string()));
        }
        total += entry.size();
        if total > limits.max_total_bytes {
            return Err(ArchiveError::TotalTooLarge);
        }

        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent)?;
        }

        // Copy one byte past the cap so "exactly at limit" and "would
        // exceed" are distinguishable even when the header size lies.
        let mut out = fs::File::create(&target)?;
        let written = io::copy(&mut entry.by_ref().take(limits.max_file_bytes + 1), &mut out)?;
        if written > limits.max_file_bytes {
            return Err(ArchiveError::EntryTooLarge(entry.name().to_string()));
        }

        created.push(entry_name);
    }

    Ok(created)
}

/// Pack every file under `src_dir` into a zip written to `writer`.
/// The walk is sorted so the output is deterministic for a given tree.
pub fn write_zip_from_dir<W: Write + Seek>(src_dir: &Path, writer: W) -> Result<(), ArchiveError> {
    let mut files = Vec::new();
    collect_files(src_dir, src_dir, &mut files)?;
    files.sort_by(|a, b| a.1.cmp(&b.1));

    let options = SimpleFileOptions::default().compression_method(CompressionMethod::Deflated);
    let mut zw = ZipWriter::new(writer);
    for (path, name) in files {
        zw.start_file(name, options)?;
        let mut reader = fs::File::open(&path)?;
        io::copy(&mut reader, &mut zw)?;
    }
    zw.finish()?;
    Ok(())
}

fn collect_files(
    root: &Path,
    dir: &Path,
    out: &mut Vec<(PathBuf, String)>,
) -> Result<(), ArchiveError> {
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let path = entry.path();
        if entry.file_type()?.is_dir() {
            collect_files(root, &path, out)?;
            continue;
        }
        let rel = path
            .strip_prefix(root)
            .map_err(|_| ArchiveError::TraversalEntry(path.display().to_string()))?;
        let name = rel
            .components()
            .map(|c| c.as_os_str().to_string_lossy())
            .collect::<Vec<_>>()
            .join("/");
        out.push((path, name));
    }
    Ok(())
}

/// Normalize a zip entry name into a safe slash-separated relative path.
/// Rejects absolute paths, drive-lettered paths and anything that would
/// resolve outside the destination.
fn sanitize_entry_name(name: &str) -> Result<String, ArchiveError> {
    let raw = name.replace('\\', "/");
    let raw = raw.trim();
    if raw.is_empty() {
        return Err(ArchiveError::EmptyEntryName);
    }
    if raw.starts_with('/') {
        return Err(ArchiveError::AbsoluteEntry(name.to_string()));
    }
    if has_windows_drive(raw) {
        return Err(ArchiveError::AbsoluteEntry(name.to_string()));
    }

    let mut parts: Vec<&str> = Vec::new();
    for part in raw.split('/') {
        match part {
            "" | "." => continue,
            ".." => return Err(ArchiveError::TraversalEntry(name.to_string())),
            _ => parts.push(part),
        }
    }
    if parts.is_empty() {
        return Err(ArchiveError::TraversalEntry(name.to_string()));
    }
    Ok(parts.join("/"))
}

fn has_windows_drive(p: &str) -> bool {
    p.len() >= 2 && p.as_bytes()[1] == b':'
}

fn is_symlink(unix_mode: Option<u32>) -> bool {
    matches!(unix_mode, Some(mode) if mode & 0o170000 == 0o120000)
}
