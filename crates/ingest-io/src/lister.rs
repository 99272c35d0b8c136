//! Directory walk producing the initial row set.

use std::fs;
use std::path::Path;

use ingest_core::manifest::ManifestRow;

use crate::error::{Error, Result};

/// Recursively list regular files under `root` as rows with paths relative to
/// `root`, sorted for a stable manifest order. Hidden files are skipped.
pub fn list_directory(root: &Path, study_id: &str, consent_group: &str) -> Result<Vec<ManifestRow>> {
    if !root.is_dir() {
        return Err(Error::Config(format!("{} is not a directory", root.display())));
    }

    fn visit_dirs(dir: &Path, results: &mut Vec<std::path::PathBuf>) -> std::io::Result<()> {
        for entry in fs::read_dir(dir)? {
            let entry = entry?;
            if entry.file_name().to_string_lossy().starts_with('.') {
                continue;
            }
            let path = entry.path();
            if path.is_dir() {
                visit_dirs(&path, results)?;
            } else if path.is_file() {
                results.push(path);
            }
        }
        Ok(())
    }

    let mut files = Vec::new();
    visit_dirs(root, &mut files)?;
    files.sort();

    let mut rows = Vec::with_capacity(files.len());
    for file in files {
        let rel = file
            .strip_prefix(root)
            .map_err(|e| Error::Storage(format!("{}: {e}", file.display())))?;
        let rel = rel
            .to_str()
            .ok_or_else(|| Error::Config(format!("{} is not valid UTF-8", rel.display())))?;
        let mut row = ManifestRow::new(study_id, rel);
        row.consent_group = consent_group.to_string();
        rows.push(row);
    }
    Ok(rows)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lists_nested_files_relative_to_root() {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir_all(dir.path().join("a/b")).unwrap();
        fs::write(dir.path().join("top.txt"), b"1").unwrap();
        fs::write(dir.path().join("a/b/deep.dcm"), b"2").unwrap();
        fs::write(dir.path().join(".hidden"), b"3").unwrap();

        let rows = list_directory(dir.path(), "phs1", "c1").unwrap();
        let paths: Vec<&str> = rows.iter().map(|r| r.input_file_path.as_str()).collect();
        assert_eq!(paths, vec!["a/b/deep.dcm", "top.txt"]);
        assert_eq!(rows[0].file_name, "deep.dcm");
        assert_eq!(rows[0].consent_group, "c1");
    }

    #[test]
    fn rejects_non_directories() {
        assert!(list_directory(Path::new("/no/such/dir"), "s", "c").is_err());
    }
}
