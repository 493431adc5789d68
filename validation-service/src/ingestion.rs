//! Archive ingestion (spec §4.1 "Ingestion contract"). Synchronous,
//! performed before a Job is ever created. Every failure here is
//! returned straight to the caller — no Job record is produced.

use std::fs;
use std::io::Read;
use std::path::{Component, Path, PathBuf};

use validation_common::config::IngestionConfig;

#[derive(Debug, thiserror::Error)]
pub enum IngestError {
    #[error("archive path escapes the configured archive root")]
    OutsideArchiveRoot,
    #[error("archive path is not a regular file reachable by the service")]
    NotARegularFile,
    #[error("archive path must end in .zip")]
    WrongExtension,
    #[error("failed to open archive: {0}")]
    Open(String),
    #[error("entry {0:?} escapes the destination workspace")]
    PathTraversal(String),
    #[error("entry {0:?} is a symbolic link, rejected")]
    SymlinkEntry(String),
    #[error("archive exceeds the total uncompressed size limit")]
    TotalSizeExceeded,
    #[error("archive exceeds the entry count limit")]
    EntryCountExceeded,
    #[error("entry {0:?} exceeds the per-file size limit")]
    FileSizeExceeded(String),
    #[error("entry {0:?} exceeds the maximum path depth")]
    PathTooDeep(String),
    #[error("io error during ingestion: {0}")]
    Io(#[from] std::io::Error),
}

/// Resolves `archive_path` against the configured archive root, if any.
/// Rejects anything that escapes it, matching §4.1 step 1.
pub fn resolve_archive_path(
    archive_path: &Path,
    config: &IngestionConfig,
) -> Result<PathBuf, IngestError> {
    let canonical = archive_path
        .canonicalize()
        .map_err(|_| IngestError::NotARegularFile)?;

    if !canonical.is_file() {
        return Err(IngestError::NotARegularFile);
    }

    if canonical.extension().and_then(|e| e.to_str()) != Some("zip") {
        return Err(IngestError::WrongExtension);
    }

    if let Some(root) = &config.archive_root {
        let canonical_root = root
            .canonicalize()
            .map_err(|_| IngestError::OutsideArchiveRoot)?;
        if !canonical.starts_with(&canonical_root) {
            return Err(IngestError::OutsideArchiveRoot);
        }
    }

    Ok(canonical)
}

/// Validates that a zip entry name, once joined to `dest_root`, cannot
/// escape it: no absolute paths, no `..` components.
fn safe_join(dest_root: &Path, entry_name: &str) -> Result<PathBuf, IngestError> {
    let mut joined = dest_root.to_path_buf();
    for component in Path::new(entry_name).components() {
        match component {
            Component::Normal(part) => joined.push(part),
            Component::CurDir => {}
            Component::ParentDir | Component::RootDir | Component::Prefix(_) => {
                return Err(IngestError::PathTraversal(entry_name.to_string()))
            }
        }
    }
    if !joined.starts_with(dest_root) {
        return Err(IngestError::PathTraversal(entry_name.to_string()));
    }
    Ok(joined)
}

fn path_depth(entry_name: &str) -> u32 {
    Path::new(entry_name)
        .components()
        .filter(|c| matches!(c, Component::Normal(_)))
        .count() as u32
}

/// Iterates every entry of the archive without materializing any of
/// them, validating bounds and rejecting traversal/symlink entries.
/// Returns the validated `(name, dest_path, uncompressed_size)` list on
/// success; on any violation, nothing is written to disk (§4.1 step 2,
/// and the testable property "ingestion fails before any file is
/// materialized").
pub fn validate_archive(
    archive_path: &Path,
    dest_root: &Path,
    config: &IngestionConfig,
) -> Result<Vec<(String, PathBuf, u64)>, IngestError> {
    let file = fs::File::open(archive_path).map_err(|e| IngestError::Open(e.to_string()))?;
    let mut archive =
        zip::ZipArchive::new(file).map_err(|e| IngestError::Open(e.to_string()))?;

    if archive.len() as u32 > config.max_entry_count {
        return Err(IngestError::EntryCountExceeded);
    }

    let mut total_bytes: u64 = 0;
    let mut plan = Vec::with_capacity(archive.len());

    for i in 0..archive.len() {
        let entry = archive
            .by_index(i)
            .map_err(|e| IngestError::Open(e.to_string()))?;
        let name = entry.name().to_string();

        if entry.is_symlink() {
            return Err(IngestError::SymlinkEntry(name));
        }

        if path_depth(&name) > config.max_path_depth {
            return Err(IngestError::PathTooDeep(name));
        }

        let dest = safe_join(dest_root, &name)?;

        let size = entry.size();
        if size > config.max_file_bytes {
            return Err(IngestError::FileSizeExceeded(name));
        }

        total_bytes = total_bytes.saturating_add(size);
        if total_bytes > config.max_total_bytes {
            return Err(IngestError::TotalSizeExceeded);
        }

        if !entry.is_dir() {
            plan.push((name, dest, size));
        }
    }

    Ok(plan)
}

/// Materializes a validated archive into `dest_root`, then removes any
/// entry the sanitizer denies (cache dirs, lock files, disallowed
/// extensions) — §4.1 step 3.
pub fn materialize_and_sanitize(
    archive_path: &Path,
    dest_root: &Path,
    config: &IngestionConfig,
) -> Result<(), IngestError> {
    let plan = validate_archive(archive_path, dest_root, config)?;

    fs::create_dir_all(dest_root)?;
    let file = fs::File::open(archive_path).map_err(|e| IngestError::Open(e.to_string()))?;
    let mut archive =
        zip::ZipArchive::new(file).map_err(|e| IngestError::Open(e.to_string()))?;

    for (name, dest, expected_size) in &plan {
        let mut entry = archive
            .by_name(name)
            .map_err(|e| IngestError::Open(e.to_string()))?;
        if let Some(parent) = dest.parent() {
            fs::create_dir_all(parent)?;
        }
        let mut out = fs::File::create(dest)?;
        let mut buf = [0u8; 64 * 1024];
        let mut written: u64 = 0;
        loop {
            let n = entry.read(&mut buf)?;
            if n == 0 {
                break;
            }
            written += n as u64;
            if written > *expected_size {
                return Err(IngestError::FileSizeExceeded(name.clone()));
            }
            std::io::Write::write_all(&mut out, &buf[..n])?;
        }
    }

    sanitize(dest_root, config)?;
    Ok(())
}

/// Removes pre-initialized tool caches, lock files, and any entry
/// outside the permitted extension set, so a miner cannot pin an
/// alternative provider version or smuggle an executable (§3).
fn sanitize(dest_root: &Path, config: &IngestionConfig) -> Result<(), IngestError> {
    for entry in walkdir::WalkDir::new(dest_root)
        .contents_first(true)
        .into_iter()
        .filter_map(|e| e.ok())
    {
        let path = entry.path();
        if path == dest_root {
            continue;
        }
        let file_name = entry.file_name().to_string_lossy().to_string();

        if config.denied_names.iter().any(|d| d == &file_name) {
            remove_any(path)?;
            continue;
        }

        if entry.file_type().is_file() {
            let ext = path.extension().and_then(|e| e.to_str());
            let allowed = ext
                .map(|e| config.allowed_extensions.iter().any(|a| a == e))
                .unwrap_or(false);
            if !allowed {
                fs::remove_file(path)?;
            }
        }
    }
    Ok(())
}

fn remove_any(path: &Path) -> std::io::Result<()> {
    if path.is_dir() {
        fs::remove_dir_all(path)
    } else {
        fs::remove_file(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use zip::write::SimpleFileOptions;

    fn write_zip(entries: &[(&str, &[u8])]) -> tempfile::NamedTempFile {
        let file = tempfile::Builder::new().suffix(".zip").tempfile().unwrap();
        {
            let mut writer = zip::ZipWriter::new(file.reopen().unwrap());
            let options = SimpleFileOptions::default();
            for (name, contents) in entries {
                writer.start_file(*name, options).unwrap();
                writer.write_all(contents).unwrap();
            }
            writer.finish().unwrap();
        }
        file
    }

    #[test]
    fn happy_path_archive_materializes_allowed_files() {
        let zip = write_zip(&[("main.tf", b"resource \"random_id\" \"example\" {}")]);
        let dest = tempfile::tempdir().unwrap();
        let config = IngestionConfig::default();
        materialize_and_sanitize(zip.path(), dest.path(), &config).unwrap();
        assert!(dest.path().join("main.tf").exists());
    }

    #[test]
    fn traversal_entry_is_rejected_before_materialization() {
        let zip = write_zip(&[("../evil.tf", b"malicious")]);
        let dest = tempfile::tempdir().unwrap();
        let config = IngestionConfig::default();
        let err = materialize_and_sanitize(zip.path(), dest.path(), &config).unwrap_err();
        assert!(matches!(err, IngestError::PathTraversal(_)));
        assert!(!dest.path().join("evil.tf").exists());
        let mut entries = fs::read_dir(dest.path()).unwrap();
        assert!(entries.next().is_none());
    }

    #[test]
    fn sanitizer_strips_cached_lock_files() {
        let zip = write_zip(&[
            ("main.tf", b"resource {}"),
            (".terraform.lock.hcl", b"locked"),
        ]);
        let dest = tempfile::tempdir().unwrap();
        let config = IngestionConfig::default();
        materialize_and_sanitize(zip.path(), dest.path(), &config).unwrap();
        assert!(dest.path().join("main.tf").exists());
        assert!(!dest.path().join(".terraform.lock.hcl").exists());
    }

    #[test]
    fn disallowed_extension_is_stripped() {
        let zip = write_zip(&[("main.tf", b"x"), ("payload.sh", b"#!/bin/sh\n")]);
        let dest = tempfile::tempdir().unwrap();
        let config = IngestionConfig::default();
        materialize_and_sanitize(zip.path(), dest.path(), &config).unwrap();
        assert!(!dest.path().join("payload.sh").exists());
    }

    #[test]
    fn exactly_at_the_size_cap_succeeds_one_byte_over_fails() {
        let dest = tempfile::tempdir().unwrap();
        let mut config = IngestionConfig::default();
        config.max_file_bytes = 8;

        let at_cap = write_zip(&[("main.tf", &[b'a'; 8])]);
        materialize_and_sanitize(at_cap.path(), dest.path(), &config).unwrap();

        let over_cap_dest = tempfile::tempdir().unwrap();
        let over_cap = write_zip(&[("main.tf", &[b'a'; 9])]);
        let err =
            materialize_and_sanitize(over_cap.path(), over_cap_dest.path(), &config).unwrap_err();
        assert!(matches!(err, IngestError::FileSizeExceeded(_)));
    }
}
