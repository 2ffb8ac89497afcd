//! MangaDex API 来源：作品详情、章节 feed、MangaDex@Home 镜像解析与统计上报。

use std::collections::HashMap;
use std::sync::Arc;

use reqwest::blocking::Client;
use serde::Deserialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use time::OffsetDateTime;
use time::format_description::well_known::Rfc3339;
use tracing::{debug, warn};

use super::{ChapterSource, DeliveryResolver, SourceError};
use crate::download::models::{
    Attribution, AttributionKind, ChapterRef, DeliveryTarget, SeriesMeta,
};
use crate::download::page_fetcher::{TelemetryReport, TelemetrySink};
use crate::download::rate_limit::RateLimiter;

pub const API_BASE: &str = "https://api.mangadex.org";
pub const AT_HOME_ROUTE: &str = "/at-home/server/";
pub const REPORT_URL: &str = "https://api.mangadex.network/report";
const COVER_BASE: &str = "https://uploads.mangadex.org/covers";
const FEED_LIMIT: u32 = 500;
const CONTENT_RATINGS: [&str; 4] = ["safe", "suggestive", "erotica", "pornographic"];

#[derive(Debug, Deserialize)]
struct Envelope<T> {
    data: T,
}

#[derive(Debug, Deserialize)]
struct MangaData {
    attributes: MangaAttributes,
    #[serde(default)]
    relationships: Vec<Relationship>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct MangaAttributes {
    #[serde(default)]
    title: HashMap<String, String>,
    #[serde(default)]
    last_chapter: Option<String>,
}

#[derive(Debug, Deserialize)]
struct Relationship {
    id: String,
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    attributes: Option<RelationshipAttributes>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RelationshipAttributes {
    file_name: Option<String>,
    name: Option<String>,
    username: Option<String>,
}

#[derive(Debug, Deserialize)]
struct FeedPage {
    #[serde(default)]
    data: Vec<Value>,
    limit: u32,
    offset: u32,
    total: u32,
}

#[derive(Debug, Deserialize)]
struct FeedChapter {
    id: String,
    attributes: ChapterAttributes,
    #[serde(default)]
    relationships: Vec<Relationship>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ChapterAttributes {
    #[serde(default)]
    title: Option<String>,
    #[serde(default)]
    chapter: Option<String>,
    #[serde(default)]
    translated_language: Option<String>,
    #[serde(default)]
    external_url: Option<String>,
    created_at: String,
    updated_at: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct AtHome {
    base_url: String,
    chapter: AtHomeChapter,
}

#[derive(Debug, Deserialize)]
struct AtHomeChapter {
    hash: String,
    data: Vec<String>,
}

pub struct MangaDex {
    client: Client,
    limiter: Arc<RateLimiter>,
    api_base: String,
}

impl MangaDex {
    pub fn new(client: Client, limiter: Arc<RateLimiter>) -> Self {
        Self::with_base(client, limiter, API_BASE)
    }

    pub fn with_base(client: Client, limiter: Arc<RateLimiter>, api_base: &str) -> Self {
        Self {
            client,
            limiter,
            api_base: api_base.trim_end_matches('/').to_string(),
        }
    }

    fn request_json<T: DeserializeOwned>(
        &self,
        path: &str,
        query: &[(&str, String)],
        what: &'static str,
    ) -> Result<T, SourceError> {
        let url = format!("{}{}", self.api_base, path);
        self.limiter.wait_for_url(&url);
        debug!(target: "mangadex", %url, "请求 API");
        let mut req = self.client.get(&url);
        if !query.is_empty() {
            req = req.query(query);
        }
        let body = req.send()?.error_for_status()?.text()?;
        serde_json::from_str(&body).map_err(|e| SourceError::parse(what, e))
    }
}

impl DeliveryResolver for MangaDex {
    fn resolve(&self, chapter_id: &str) -> Result<DeliveryTarget, SourceError> {
        let at_home: AtHome = self.request_json(
            &format!("{AT_HOME_ROUTE}{chapter_id}"),
            &[],
            "at-home response",
        )?;
        Ok(delivery_target(at_home))
    }
}

impl ChapterSource for MangaDex {
    fn name(&self) -> &'static str {
        "MangaDex"
    }

    fn series(&self, series_id: &str) -> Result<SeriesMeta, SourceError> {
        let query = ["cover_art", "author", "artist"].map(|i| ("includes[]", i.to_string()));
        let manga: Envelope<MangaData> =
            self.request_json(&format!("/manga/{series_id}"), &query, "manga details")?;
        Ok(series_meta(series_id, manga.data))
    }

    fn chapters(
        &self,
        series_id: &str,
        languages: &[String],
    ) -> Result<Vec<ChapterRef>, SourceError> {
        let mut base_query: Vec<(&str, String)> = languages
            .iter()
            .map(|l| ("translatedLanguage[]", l.clone()))
            .collect();
        base_query.extend(CONTENT_RATINGS.map(|r| ("contentRating[]", r.to_string())));
        base_query.push(("includes[]", "scanlation_group".into()));
        base_query.push(("includes[]", "user".into()));
        base_query.push(("order[createdAt]", "asc".into()));

        let path = format!("/manga/{series_id}/feed");
        let mut chapters = Vec::new();
        let mut offset = 0u32;
        loop {
            let mut query = base_query.clone();
            query.push(("limit", FEED_LIMIT.to_string()));
            query.push(("offset", offset.to_string()));
            let page: FeedPage = self.request_json(&path, &query, "chapter feed")?;

            let received = page.data.len();
            chapters.extend(page.data.into_iter().filter_map(|raw| {
                match chapter_ref(raw) {
                    Ok(c) => Some(c),
                    Err(e) => {
                        warn!(target: "mangadex", series = series_id, error = %e, "忽略无法解析的章节");
                        None
                    }
                }
            }));

            offset = page.offset.saturating_add(page.limit.max(1));
            if received == 0 || offset >= page.total {
                break;
            }
        }
        debug!(target: "mangadex", series = series_id, count = chapters.len(), "章节列表获取完成");
        Ok(chapters)
    }
}

fn delivery_target(at_home: AtHome) -> DeliveryTarget {
    DeliveryTarget {
        base_url: format!(
            "{}/data/{}/",
            at_home.base_url.trim_end_matches('/'),
            at_home.chapter.hash
        ),
        pages: at_home.chapter.data,
    }
}

fn series_meta(series_id: &str, manga: MangaData) -> SeriesMeta {
    let mut titles = manga.attributes.title;
    let title = ["en", "ja-ro", "ja"]
        .iter()
        .find_map(|lang| titles.remove(*lang).filter(|t| !t.is_empty()))
        .or_else(|| titles.into_values().find(|t| !t.is_empty()))
        .unwrap_or_else(|| series_id.to_string());

    let cover_url = manga
        .relationships
        .iter()
        .filter(|r| r.kind == "cover_art")
        .find_map(|r| r.attributes.as_ref()?.file_name.as_deref())
        .map(|file| format!("{COVER_BASE}/{series_id}/{file}"));

    let names = |kind: &str| {
        let joined = manga
            .relationships
            .iter()
            .filter(|r| r.kind == kind)
            .filter_map(|r| r.attributes.as_ref()?.name.as_deref())
            .collect::<Vec<_>>()
            .join(",");
        Some(joined).filter(|s| !s.is_empty())
    };

    SeriesMeta {
        title,
        cover_url,
        last_chapter: manga.attributes.last_chapter.filter(|s| !s.is_empty()),
        author: names("author"),
        artist: names("artist"),
    }
}

fn parse_time(field: &'static str, value: &str) -> Result<OffsetDateTime, SourceError> {
    OffsetDateTime::parse(value, &Rfc3339).map_err(|e| SourceError::parse(field, e))
}

fn chapter_ref(raw: Value) -> Result<ChapterRef, SourceError> {
    let feed: FeedChapter =
        serde_json::from_value(raw).map_err(|e| SourceError::parse("chapter entry", e))?;
    let attrs = feed.attributes;

    let mut group = None;
    let mut user = None;
    let mut attributions = Vec::new();
    for rel in feed.relationships {
        let rel_attrs = rel.attributes.unwrap_or_default();
        let (kind, name) = match rel.kind.as_str() {
            "scanlation_group" => (AttributionKind::Group, rel_attrs.name),
            "user" => (AttributionKind::User, rel_attrs.username),
            _ => continue,
        };
        let name = name.unwrap_or_default();
        match kind {
            AttributionKind::Group if group.is_none() && !name.is_empty() => {
                group = Some(name.clone())
            }
            AttributionKind::User if user.is_none() && !name.is_empty() => {
                user = Some(name.clone())
            }
            _ => {}
        }
        attributions.push(Attribution {
            kind,
            id: rel.id,
            name,
        });
    }

    Ok(ChapterRef {
        id: feed.id,
        title: attrs.title.unwrap_or_default(),
        number: attrs.chapter.filter(|n| !n.trim().is_empty()),
        translator: group.or(user).unwrap_or_default(),
        language: attrs.translated_language,
        created_at: parse_time("chapter createdAt", &attrs.created_at)?,
        updated_at: parse_time("chapter updatedAt", &attrs.updated_at)?,
        external_url: attrs.external_url.filter(|u| !u.is_empty()),
        attributions,
    })
}

/// MangaDex@Home 节点统计上报；官方域名下的地址不上报。
pub struct MangaDexReporter {
    client: Client,
    endpoint: String,
}

impl MangaDexReporter {
    pub fn new(client: Client) -> Self {
        Self {
            client,
            endpoint: REPORT_URL.to_string(),
        }
    }

    #[cfg(test)]
    pub fn with_endpoint(client: Client, endpoint: &str) -> Self {
        Self {
            client,
            endpoint: endpoint.to_string(),
        }
    }
}

impl TelemetrySink for MangaDexReporter {
    fn report(&self, report: &TelemetryReport) -> anyhow::Result<()> {
        if report.url.contains("mangadex.org") {
            return Ok(());
        }
        debug!(
            target: "mangadex",
            url = %report.url,
            success = report.success,
            cached = report.cached,
            bytes = report.bytes,
            duration = report.duration,
            "上报 MangaDex@Home"
        );
        self.client
            .post(&self.endpoint)
            .json(report)
            .send()?
            .error_for_status()?;
        Ok(())
    }
}
