//! Random IO utilities

use std::path::{Path, PathBuf};

/// Remove all files and directories in the given directory, but not the directory itself.
///
/// Entries named in `keep` are left in place.
pub async fn remove_dir_contents(path: &Path, keep: &[&str]) -> std::io::Result<()> {
    let mut entries = tokio::fs::read_dir(path).await?;
    while let Some(entry) = entries.next_entry().await? {
        if keep.iter().any(|k| entry.file_name() == *k) {
            continue;
        }
        let path = entry.path();
        if tokio::fs::metadata(&path).await?.is_dir() {
            tokio::fs::remove_dir_all(path).await?;
        } else {
            tokio::fs::remove_file(path).await?;
        }
    }
    Ok(())
}

/// Remove a file, treating a missing file as success.
///
/// Returns `true` if a file was actually removed.
pub async fn remove_file_if_exists(path: &Path) -> std::io::Result<bool> {
    match tokio::fs::remove_file(path).await {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
        Err(e) => Err(e),
    }
}

/// Length of the file at `path`, or `None` if it does not exist or is not a regular file.
pub async fn file_len(path: &Path) -> Option<u64> {
    let meta = tokio::fs::metadata(path).await.ok()?;
    meta.is_file().then(|| meta.len())
}

/// Every file and directory below `path`, directories listed before their contents.
///
/// A missing `path` has no entries.
async fn walk(path: &Path) -> std::io::Result<(Vec<PathBuf>, Vec<PathBuf>)> {
    let mut files = Vec::new();
    let mut dirs = Vec::new();
    let mut pending = vec![path.to_path_buf()];
    while let Some(dir) = pending.pop() {
        let mut entries = match tokio::fs::read_dir(&dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
            Err(e) => return Err(e),
        };
        while let Some(entry) = entries.next_entry().await? {
            if entry.file_type().await?.is_dir() {
                dirs.push(entry.path());
                pending.push(entry.path());
            } else {
                files.push(entry.path());
            }
        }
    }
    Ok((files, dirs))
}

/// Every non-directory entry below `path`, recursively.
pub async fn files_under(path: &Path) -> std::io::Result<Vec<PathBuf>> {
    Ok(walk(path).await?.0)
}

/// Remove the empty directories below `path`, including ones that only held empty directories.
pub async fn remove_empty_dirs(path: &Path) -> std::io::Result<()> {
    let (_, mut dirs) = walk(path).await?;
    // Deepest first, so parents are emptied before they are looked at.
    dirs.sort_by_key(|dir| std::cmp::Reverse(dir.components().count()));
    for dir in dirs {
        let mut entries = tokio::fs::read_dir(&dir).await?;
        if entries.next_entry().await?.is_none() {
            tokio::fs::remove_dir(&dir).await?;
        }
    }
    Ok(())
}
