//! 作品目录、章节文件命名与本地归档时间戳。

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use time::OffsetDateTime;
use time::macros::format_description;

pub const ARCHIVE_EXT: &str = "cbz";
/// 下载中的页面先写到 `<name>.part`。
pub const PART_SUFFIX: &str = ".part";

/// 把任意字符串变成可用于 Windows/Unix 的单个路径组件。
pub fn sanitize_path(name: &str) -> String {
    let mut cleaned = String::with_capacity(name.len());
    for ch in name.trim_start_matches(['.', ' ']).chars() {
        match ch {
            '/' | '\\' => cleaned.push('-'),
            ':' | '?' | '*' | '|' => {}
            '<' | '>' => cleaned.push('_'),
            '"' => cleaned.push('\''),
            c if (c as u32) < 32 => {}
            c => cleaned.push(c),
        }
    }
    let trimmed = cleaned.trim();
    if trimmed.is_empty() {
        "unnamed".to_string()
    } else {
        trimmed.to_string()
    }
}

/// 整数部分补齐到三位，使文件名按字典序即为章节顺序：`7.5` → `007.5`。
/// 非数字编号原样返回。
pub fn format_chapter_number(number: &str) -> String {
    let number = number.trim();
    let (int_part, frac_part) = match number.split_once('.') {
        Some((i, f)) => (i, Some(f)),
        None => (number, None),
    };
    if int_part.is_empty() || !int_part.chars().all(|c| c.is_ascii_digit()) {
        return number.to_string();
    }
    let int_part = int_part.trim_start_matches('0');
    let padded = format!("{:0>3}", int_part);
    match frac_part {
        Some(f) if !f.is_empty() => format!("{padded}.{f}"),
        _ => padded,
    }
}

pub fn series_dir(download_dir: &Path, title: &str) -> PathBuf {
    download_dir.join(sanitize_path(title))
}

/// `"{编号} - {翻译组} {章节ID} {创建时间}.cbz"`；章节 ID 两侧的空格用于查找重复文件。
pub fn chapter_file_name(
    number: &str,
    translator: &str,
    chapter_id: &str,
    created: OffsetDateTime,
) -> String {
    let created = created
        .format(format_description!(
            "[year]-[month]-[day] [hour]-[minute]-[second]"
        ))
        .unwrap_or_else(|_| created.unix_timestamp().to_string());
    sanitize_path(&format!(
        "{} - {} {} {}.{}",
        format_chapter_number(number),
        translator,
        chapter_id,
        created,
        ARCHIVE_EXT
    ))
}

pub fn is_archive(path: &Path) -> bool {
    path.extension()
        .and_then(|s| s.to_str())
        .map(|s| s.eq_ignore_ascii_case(ARCHIVE_EXT))
        .unwrap_or(false)
}

pub fn modified_time(path: &Path) -> Option<SystemTime> {
    fs::metadata(path).and_then(|m| m.modified()).ok()
}

/// 目录中最新 cbz 的修改时间；目录不存在或没有归档时为 `None`。
pub fn most_recent_modified(dir: &Path) -> Option<OffsetDateTime> {
    let rd = fs::read_dir(dir).ok()?;
    rd.filter_map(|e| e.ok())
        .map(|e| e.path())
        .filter(|p| p.is_file() && is_archive(p))
        .filter_map(|p| modified_time(&p))
        .max()
        .map(OffsetDateTime::from)
}

/// 将文件修改时间设置为章节更新时间，重复运行时据此判断是否需要重新下载。
pub fn set_modified(path: &Path, when: OffsetDateTime) -> io::Result<()> {
    let file = fs::File::options().write(true).open(path)?;
    file.set_modified(SystemTime::from(when))
}

/// 更新目录修改时间，提示媒体库重新扫描。
pub fn touch_dir(dir: &Path) -> io::Result<()> {
    let handle = fs::File::open(dir)?;
    handle.set_modified(SystemTime::now())
}
