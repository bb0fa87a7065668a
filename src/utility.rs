use crate::error::Result;
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

/// Every file under `dir` (recursively) with extension `ext`, sorted so shard order is stable.
pub fn find_files_with_extension<P: AsRef<Path>>(dir: P, ext: &str) -> Result<Vec<PathBuf>> {
    let mut files = Vec::new();
    for entry in WalkDir::new(dir) {
        let entry = entry?;
        let path = entry.path();
        if path.is_file() && path.extension().and_then(|e| e.to_str()) == Some(ext) {
            files.push(path.to_path_buf());
        }
    }
    files.sort();
    Ok(files)
}
