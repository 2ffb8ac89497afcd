//! 漫画来源接口。
//!
//! 来源负责：作品元数据、按语言拉取章节列表、把章节解析为当前可用的镜像地址。
//! 下载核心只依赖这里的 trait，不关心具体站点的响应格式。

use std::time::Duration;

use reqwest::blocking::Client;
use reqwest::header::{ACCEPT, HeaderMap, HeaderValue, USER_AGENT};
use thiserror::Error;

use crate::download::models::{ChapterRef, DeliveryTarget, SeriesMeta};

pub mod mangadex;

const USER_AGENT_VALUE: &str = concat!("chapter-sync/", env!("CARGO_PKG_VERSION"));

#[derive(Debug, Error)]
pub enum SourceError {
    #[error("request failed: {0}")]
    Http(#[from] reqwest::Error),
    /// 响应里找不到必需字段；只影响当前章节，不重试。
    #[error("malformed {what}: {detail}")]
    Parse { what: &'static str, detail: String },
}

impl SourceError {
    pub fn parse(what: &'static str, detail: impl ToString) -> Self {
        Self::Parse {
            what,
            detail: detail.to_string(),
        }
    }

    pub fn is_parse(&self) -> bool {
        matches!(self, Self::Parse { .. })
    }
}

/// 把章节 ID 解析为镜像地址；每次调用都应返回新解析的结果。
pub trait DeliveryResolver: Sync {
    fn resolve(&self, chapter_id: &str) -> Result<DeliveryTarget, SourceError>;

    fn list_pages(&self, target: &DeliveryTarget) -> Vec<String> {
        target.pages.clone()
    }
}

pub trait ChapterSource: DeliveryResolver {
    fn name(&self) -> &'static str;

    fn series(&self, series_id: &str) -> Result<SeriesMeta, SourceError>;

    /// 按创建时间从旧到新排列的章节列表。
    fn chapters(&self, series_id: &str, languages: &[String])
    -> Result<Vec<ChapterRef>, SourceError>;
}

pub fn http_client(timeout: Duration) -> reqwest::Result<Client> {
    let mut headers = HeaderMap::new();
    headers.insert(ACCEPT, HeaderValue::from_static("*/*"));
    headers.insert(USER_AGENT, HeaderValue::from_static(USER_AGENT_VALUE));

    Client::builder()
        .default_headers(headers)
        .timeout(timeout)
        .connect_timeout(timeout.min(Duration::from_secs(10)))
        .build()
}
