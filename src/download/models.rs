//! 下载相关的数据模型定义。
//!
//! 包含章节描述、作品元数据、镜像地址、单页结果与同步统计。

use std::time::Duration;

use time::OffsetDateTime;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttributionKind {
    Group,
    User,
}

/// 章节的署名（汉化组或上传者），用于排除规则。
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Attribution {
    pub kind: AttributionKind,
    pub id: String,
    pub name: String,
}

/// 来源提供的章节描述，一次同步中只读。
#[derive(Debug, Clone)]
pub struct ChapterRef {
    pub id: String,
    pub title: String,
    /// 来源给出的章节号，可能为空或非数字（如 "Extra"）。
    pub number: Option<String>,
    pub translator: String,
    pub language: Option<String>,
    pub created_at: OffsetDateTime,
    pub updated_at: OffsetDateTime,
    pub external_url: Option<String>,
    pub attributions: Vec<Attribution>,
}

impl ChapterRef {
    #[cfg(test)]
    pub fn new(id: &str, number: Option<&str>, updated_at: OffsetDateTime) -> Self {
        Self {
            id: id.to_string(),
            title: String::new(),
            number: number.map(str::to_string),
            translator: String::new(),
            language: None,
            created_at: updated_at,
            updated_at,
            external_url: None,
            attributions: Vec::new(),
        }
    }
}

/// 作品级元数据，写入每章的 ComicInfo。
#[derive(Debug, Clone, Default)]
pub struct SeriesMeta {
    pub title: String,
    pub cover_url: Option<String>,
    pub last_chapter: Option<String>,
    pub author: Option<String>,
    pub artist: Option<String>,
}

/// 解析得到的镜像地址与页面列表；有页面失败时整体重新解析，不与旧值合并。
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeliveryTarget {
    pub base_url: String,
    pub pages: Vec<String>,
}

impl DeliveryTarget {
    /// 页面 ID 直接拼接在镜像地址后；已是完整 URL 的页面原样使用。
    pub fn address(&self, page: &str) -> String {
        if page.starts_with("http://") || page.starts_with("https://") {
            page.to_string()
        } else {
            format!("{}{}", self.base_url, page)
        }
    }
}

/// 单页下载结果，仅用于统计上报。
#[derive(Debug, Clone, PartialEq)]
pub struct PageResult {
    pub page: String,
    pub success: bool,
    pub bytes: u64,
    pub elapsed: Duration,
    pub cached: Option<bool>,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SyncReport {
    pub downloaded: u32,
    pub skipped: u32,
    pub failed: u32,
    pub aborted: bool,
}
