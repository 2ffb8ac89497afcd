//! 把暂存目录打包为 cbz，并原子替换到目标路径。

use std::cmp::Ordering;
use std::fs::{self, File};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

use regex::Regex;
use tempfile::NamedTempFile;
use thiserror::Error;
use tracing::{debug, warn};
use zip::write::FileOptions;
use zip::{CompressionMethod, DateTime, ZipWriter};

use super::manifest::ArchiveManifest;
use crate::base_system::series_paths::{ARCHIVE_EXT, PART_SUFFIX};

pub const MANIFEST_NAME: &str = "ComicInfo.xml";

#[derive(Debug, Error)]
pub enum ArchiveError {
    #[error("archive io: {0}")]
    Io(#[from] io::Error),
    #[error("zip error: {0}")]
    Zip(#[from] zip::result::ZipError),
    #[error("staged file has no usable name: {0}")]
    BadEntryName(PathBuf),
}

/// 写入 `ComicInfo.xml` 与暂存目录中的全部文件（自然排序、不压缩）。
///
/// 先写到目标目录下的临时文件再 rename，目标路径上要么没有文件，要么是完整归档。
/// 跨设备无法 rename 时退化为复制后删除，此时不再保证原子性。
/// 返回写入的页面数。
pub fn commit(
    staging_dir: &Path,
    manifest: &ArchiveManifest,
    destination: &Path,
) -> Result<usize, ArchiveError> {
    let pages = staged_files(staging_dir)?;
    let parent = match destination.parent() {
        Some(p) if !p.as_os_str().is_empty() => p,
        _ => Path::new("."),
    };

    let mut tmp = tempfile::Builder::new()
        .prefix(".chapter-sync-")
        .suffix(&format!(".{ARCHIVE_EXT}.tmp"))
        .tempfile_in(parent)?;
    write_zip(tmp.as_file_mut(), manifest, &pages)?;
    tmp.as_file().sync_all()?;

    persist(tmp, destination)?;
    debug!(target: "archive", path = %destination.display(), pages = pages.len(), "归档写入完成");
    Ok(pages.len())
}

fn staged_files(dir: &Path) -> Result<Vec<(String, PathBuf)>, ArchiveError> {
    let mut files = Vec::new();
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        if !entry.file_type()?.is_file() {
            continue;
        }
        let path = entry.path();
        let name = entry
            .file_name()
            .into_string()
            .map_err(|_| ArchiveError::BadEntryName(path.clone()))?;
        // 未写完的 `.part` 不进归档
        if name == MANIFEST_NAME || name.ends_with(PART_SUFFIX) {
            continue;
        }
        files.push((name, path));
    }
    files.sort_by(|a, b| natural_cmp(&a.0, &b.0));
    Ok(files)
}

fn write_zip(
    file: &mut File,
    manifest: &ArchiveManifest,
    pages: &[(String, PathBuf)],
) -> Result<(), ArchiveError> {
    let options = FileOptions::default()
        .compression_method(CompressionMethod::Stored)
        .last_modified_time(DateTime::default());

    let mut zip = ZipWriter::new(file);
    zip.start_file(MANIFEST_NAME, options)?;
    zip.write_all(manifest.to_xml().as_bytes())?;
    for (name, path) in pages {
        zip.start_file(name.as_str(), options)?;
        let mut page = File::open(path)?;
        io::copy(&mut page, &mut zip)?;
    }
    zip.finish()?;
    Ok(())
}

fn persist(tmp: NamedTempFile, destination: &Path) -> Result<(), ArchiveError> {
    match tmp.persist(destination) {
        Ok(_) => Ok(()),
        Err(e) if e.error.kind() == io::ErrorKind::CrossesDevices => {
            warn!(target: "archive", path = %destination.display(), "无法跨设备重命名，改为复制");
            let tmp = e.file;
            let copied = fs::copy(tmp.path(), destination);
            if copied.is_err() {
                let _ = fs::remove_file(destination);
            }
            copied?;
            tmp.close()?;
            Ok(())
        }
        // PersistError 持有的临时文件随 drop 删除
        Err(e) => Err(ArchiveError::Io(e.error)),
    }
}

static RE_TOKEN: OnceLock<Regex> = OnceLock::new();

fn re_token() -> &'static Regex {
    RE_TOKEN.get_or_init(|| Regex::new(r"\d+|\D+").expect("compile RE_TOKEN"))
}

/// 数字片段按数值比较：`page9` < `page10`。
pub fn natural_cmp(a: &str, b: &str) -> Ordering {
    let re = re_token();
    let mut left = re.find_iter(a).map(|m| m.as_str());
    let mut right = re.find_iter(b).map(|m| m.as_str());
    loop {
        match (left.next(), right.next()) {
            (None, None) => return a.cmp(b),
            (None, Some(_)) => return Ordering::Less,
            (Some(_), None) => return Ordering::Greater,
            (Some(x), Some(y)) => {
                let ord = match (is_digits(x), is_digits(y)) {
                    (true, true) => cmp_digits(x, y),
                    _ => x.to_lowercase().cmp(&y.to_lowercase()),
                };
                if ord != Ordering::Equal {
                    return ord;
                }
            }
        }
    }
}

fn is_digits(s: &str) -> bool {
    s.bytes().all(|b| b.is_ascii_digit())
}

fn cmp_digits(x: &str, y: &str) -> Ordering {
    let x = x.trim_start_matches('0');
    let y = y.trim_start_matches('0');
    x.len().cmp(&y.len()).then_with(|| x.cmp(y))
}
