//! 重复章节归档清理。

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use super::series_paths::is_archive;

/// 同一章节在重新编号/改名后会留下旧文件：删除目录中除 `keep` 外所有
/// 文件名包含 ` {chapter_id} ` 的 cbz，返回被删除的路径。
pub fn remove_duplicate_archives(
    dir: &Path,
    chapter_id: &str,
    keep: &Path,
) -> io::Result<Vec<PathBuf>> {
    let needle = format!(" {chapter_id} ");
    let mut removed = Vec::new();
    for entry in fs::read_dir(dir)? {
        let Ok(entry) = entry else {
            continue;
        };
        let path = entry.path();
        if path == keep || !is_archive(&path) {
            continue;
        }
        let matches = path
            .file_name()
            .and_then(|s| s.to_str())
            .map(|name| name.contains(&needle))
            .unwrap_or(false);
        if !matches {
            continue;
        }
        match fs::remove_file(&path) {
            Ok(()) => removed.push(path),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(e),
        }
    }
    Ok(removed)
}
