//! File writes used by the caches and the build output.

use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

static TEMP_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Sibling of `target` that no other writer in this or another process uses.
fn temp_sibling(target: &Path) -> PathBuf {
    let name = target
        .file_name()
        .map_or_else(|| "out".into(), |n| n.to_string_lossy());
    let seq = TEMP_COUNTER.fetch_add(1, Ordering::Relaxed);
    target.with_file_name(format!(".{name}.{}.{seq}.tmp", std::process::id()))
}

/// Replace `path` with `bytes` through a temp file and a rename.
///
/// Parent directories are created. Readers observe the old or the new
/// contents, never a mix. Writers are not serialized; the last rename wins.
///
/// # Errors
/// Returns an error if the directory, temp file or rename fails.
pub fn atomic_write(path: &Path, bytes: &[u8]) -> io::Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent)?;
    }

    let temp = temp_sibling(path);
    let written = OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(&temp)
        .and_then(|mut file| {
            file.write_all(bytes)?;
            file.sync_all()
        });
    if let Err(e) = written {
        let _ = fs::remove_file(&temp);
        return Err(e);
    }

    if let Err(e) = fs::rename(&temp, path) {
        // Windows refuses to rename over an open target.
        let fallback = if cfg!(windows) {
            fs::copy(&temp, path).map(|_| ())
        } else {
            Err(e)
        };
        let _ = fs::remove_file(&temp);
        return fallback;
    }
    Ok(())
}

/// Write `bytes` to `path`, creating missing parent directories first.
///
/// # Errors
/// Returns an error if a directory cannot be created or the write fails.
pub fn write_creating_dirs(path: &Path, bytes: &[u8]) -> io::Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    fs::write(path, bytes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn names(dir: &Path) -> Vec<String> {
        let mut names: Vec<String> = fs::read_dir(dir)
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        names.sort();
        names
    }

    #[test]
    fn test_atomic_write_replaces_contents() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("_metadata.json");

        atomic_write(&path, br#"{"hash":"a"}"#).unwrap();
        atomic_write(&path, br#"{"hash":"b"}"#).unwrap();

        assert_eq!(fs::read_to_string(&path).unwrap(), r#"{"hash":"b"}"#);
        assert_eq!(names(dir.path()), ["_metadata.json"]);
    }

    #[test]
    fn test_atomic_write_creates_parents() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("node_modules/.urja/index.json");

        atomic_write(&path, b"{}").unwrap();
        assert_eq!(fs::read(&path).unwrap(), b"{}");
    }

    #[test]
    fn test_temp_names_are_unique() {
        let target = Path::new("/cache/index.json");
        let a = temp_sibling(target);
        let b = temp_sibling(target);
        assert_ne!(a, b);
        assert_eq!(a.parent(), Some(Path::new("/cache")));
        assert!(a.file_name().unwrap().to_string_lossy().starts_with(".index.json."));
    }

    #[test]
    fn test_write_creating_dirs() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("dist/assets/main.js");

        write_creating_dirs(&path, b"export {};").unwrap();
        assert_eq!(fs::read_to_string(&path).unwrap(), "export {};");
    }
}
