//! Crash-safe file replacement
//!
//! Store compaction rewrites a whole write log. The new content goes to a
//! sibling `.tmp` file which is synced and then renamed over the original,
//! so after a crash the log is either the old version or the new one.

use std::fs::{self, File};
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};

/// Temp path used while rewriting `path`
pub fn temp_path_for(path: &Path) -> PathBuf {
    path.with_extension("tmp")
}

/// Replace `path` with the content produced by `write_fn`
pub fn replace_file_with<P, F>(path: P, write_fn: F) -> io::Result<()>
where
    P: AsRef<Path>,
    F: FnOnce(&mut BufWriter<File>) -> io::Result<()>,
{
    let path = path.as_ref();
    let temp_path = temp_path_for(path);

    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }

    let mut writer = BufWriter::new(File::create(&temp_path)?);
    write_fn(&mut writer)?;
    writer.flush()?;

    let file = writer.into_inner().map_err(|e| e.into_error())?;
    file.sync_all()?;
    drop(file);

    fs::rename(&temp_path, path)?;
    Ok(())
}

/// Remove a leftover temp file from an interrupted rewrite of `path`
///
/// Returns true when a stale file was found.
pub fn discard_stale_temp<P: AsRef<Path>>(path: P) -> io::Result<bool> {
    let temp_path = temp_path_for(path.as_ref());
    if temp_path.exists() {
        fs::remove_file(&temp_path)?;
        return Ok(true);
    }
    Ok(false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_replace_file_with() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("store.jsonl");
        fs::write(&path, "old\n").unwrap();

        replace_file_with(&path, |w| {
            writeln!(w, "line 1")?;
            writeln!(w, "line 2")
        })
        .unwrap();

        assert_eq!(fs::read_to_string(&path).unwrap(), "line 1\nline 2\n");
        assert!(!temp_path_for(&path).exists());
    }

    #[test]
    fn test_replace_creates_parent_dirs() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("a").join("b").join("store.jsonl");

        replace_file_with(&path, |w| write!(w, "x")).unwrap();

        assert_eq!(fs::read_to_string(&path).unwrap(), "x");
    }

    #[test]
    fn test_discard_stale_temp() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("store.jsonl");
        fs::write(temp_path_for(&path), "partial").unwrap();

        assert!(discard_stale_temp(&path).unwrap());
        assert!(!discard_stale_temp(&path).unwrap());
    }
}
