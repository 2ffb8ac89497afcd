//! 作品同步主流程：元数据 → 目录/封面 → 章节计划 → 逐章下载并提交归档。

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use thiserror::Error;
use tracing::{debug, info, warn};

use super::coordinator::{ChapterDownloadCoordinator, DEFAULT_WORKERS, DownloadError};
use super::models::{SeriesMeta, SyncReport};
use super::page_fetcher::PageFetch;
use super::plan::{Cutoff, InvalidCutoff, PlanEntry, PlannedChapter, SyncPolicy};
use super::progress::ProgressSink;
use crate::archive::{self, ArchiveError, ArchiveManifest};
use crate::base_system::context::{Config, SeriesEntry};
use crate::base_system::file_cleaner::remove_duplicate_archives;
use crate::base_system::series_paths::{series_dir, set_modified, touch_dir};
use crate::sources::ChapterSource;

#[derive(Debug, Clone)]
pub struct SyncOptions {
    pub download_dir: PathBuf,
    pub workers: usize,
    /// 章节失败后是否继续同步同一作品的后续章节。
    pub continue_on_chapter_failure: bool,
}

impl SyncOptions {
    pub fn from_config(config: &Config) -> Self {
        Self {
            download_dir: config.download_dir(),
            workers: config.workers(),
            continue_on_chapter_failure: config.continue_on_chapter_failure,
        }
    }
}

impl Default for SyncOptions {
    fn default() -> Self {
        Self {
            download_dir: PathBuf::from("."),
            workers: DEFAULT_WORKERS,
            continue_on_chapter_failure: true,
        }
    }
}

/// 一部作品的同步参数（配置中的一条 `manga` 记录与全局默认值合并后的结果）。
#[derive(Debug, Clone)]
pub struct SeriesRequest {
    pub id: String,
    pub title: Option<String>,
    pub languages: Vec<String>,
    pub exclusions: Vec<String>,
    pub cutoff: Cutoff,
    pub floor: Option<f64>,
}

impl SeriesRequest {
    pub fn from_entry(config: &Config, entry: &SeriesEntry) -> Result<Self, InvalidCutoff> {
        Ok(Self {
            id: entry.id.clone(),
            title: entry.title.clone().filter(|t| !t.trim().is_empty()),
            languages: config.languages_for(entry),
            exclusions: config.exclusions_for(entry),
            cutoff: Cutoff::parse(entry.since.as_deref())?,
            floor: entry.from_chapter,
        })
    }
}

#[derive(Debug, Error)]
pub enum ChapterError {
    #[error(transparent)]
    Download(#[from] DownloadError),
    #[error(transparent)]
    Archive(#[from] ArchiveError),
    #[error("setting archive timestamp: {0}")]
    Timestamp(#[source] io::Error),
}

impl ChapterError {
    /// 来源返回的数据无法解析：只跳过本章，不受 `continue_on_chapter_failure` 影响。
    pub fn is_parse(&self) -> bool {
        matches!(self, Self::Download(DownloadError::Resolve(e)) if e.is_parse())
    }
}

pub struct SeriesDownloader<'a, S: ChapterSource> {
    source: &'a S,
    fetcher: &'a dyn PageFetch,
    options: SyncOptions,
}

impl<'a, S: ChapterSource> SeriesDownloader<'a, S> {
    pub fn new(source: &'a S, fetcher: &'a dyn PageFetch, options: SyncOptions) -> Self {
        Self {
            source,
            fetcher,
            options,
        }
    }

    pub fn sync_series(
        &self,
        request: &SeriesRequest,
        progress: &mut dyn ProgressSink,
    ) -> Result<SyncReport> {
        let mut meta = self
            .source
            .series(&request.id)
            .with_context(|| format!("fetch {} series {}", self.source.name(), request.id))?;
        if let Some(title) = request.title.as_ref() {
            meta.title = title.clone();
        }
        info!(target: "sync", series = %request.id, title = %meta.title, "开始同步作品");

        let dir = series_dir(&self.options.download_dir, &meta.title);
        fs::create_dir_all(&dir)
            .with_context(|| format!("create series directory {}", dir.display()))?;
        self.ensure_cover(&meta, &dir);

        let chapters = self
            .source
            .chapters(&request.id, &request.languages)
            .with_context(|| format!("fetch chapter list for {}", request.id))?;
        let policy = SyncPolicy::new(&dir, &request.cutoff, &request.exclusions, request.floor);
        if let Some(cutoff) = policy.cutoff() {
            debug!(target: "sync", series = %request.id, %cutoff, "跳过该时间之前更新的章节");
        }
        let entries = policy.plan(&chapters);

        let report = self.sync_chapters(&meta, &dir, entries, progress);
        info!(
            target: "sync",
            series = %request.id,
            downloaded = report.downloaded,
            skipped = report.skipped,
            failed = report.failed,
            aborted = report.aborted,
            "作品同步结束"
        );
        Ok(report)
    }

    /// 按计划顺序逐章处理；每处理完一章（包括跳过）进度前进一步。
    pub fn sync_chapters(
        &self,
        meta: &SeriesMeta,
        dir: &Path,
        entries: Vec<PlanEntry>,
        progress: &mut dyn ProgressSink,
    ) -> SyncReport {
        let mut report = SyncReport::default();
        progress.on_length(entries.len() as u64);

        for entry in entries {
            match entry {
                PlanEntry::Skip {
                    chapter,
                    label,
                    reason,
                } => {
                    debug!(target: "sync", chapter = %chapter.id, %label, %reason, "跳过章节");
                    report.skipped += 1;
                    progress.on_progress(1, Some(&label));
                }
                PlanEntry::Download(planned) => {
                    let result = self.sync_chapter(meta, dir, &planned);
                    progress.on_progress(1, Some(&planned.label));
                    match result {
                        Ok(()) => report.downloaded += 1,
                        Err(e) => {
                            let chapter = &planned.chapter;
                            warn!(
                                target: "sync",
                                title = %chapter.title,
                                translator = %chapter.translator,
                                chapter = %chapter.id,
                                error = %e,
                                "章节下载失败"
                            );
                            report.failed += 1;
                            if !e.is_parse() && !self.options.continue_on_chapter_failure {
                                report.aborted = true;
                                break;
                            }
                        }
                    }
                }
            }
        }

        progress.finish();
        report
    }

    fn sync_chapter(
        &self,
        meta: &SeriesMeta,
        dir: &Path,
        planned: &PlannedChapter,
    ) -> Result<(), ChapterError> {
        let chapter = &planned.chapter;
        let staging = ChapterDownloadCoordinator::new(self.source, self.fetcher)
            .with_workers(self.options.workers)
            .download(chapter)?;

        let manifest = ArchiveManifest::for_chapter(meta, chapter, &planned.number);
        let committed = archive::commit(staging.path(), &manifest, &planned.path);
        if let Err(e) = staging.release() {
            warn!(target: "sync", error = %e, "删除暂存目录失败");
        }
        let pages = committed?;

        set_modified(&planned.path, chapter.updated_at).map_err(ChapterError::Timestamp)?;
        if let Err(e) = touch_dir(dir) {
            debug!(target: "sync", dir = %dir.display(), error = %e, "更新目录时间失败");
        }
        info!(target: "sync", chapter = %chapter.id, label = %planned.label, pages, "章节已保存");

        match remove_duplicate_archives(dir, &chapter.id, &planned.path) {
            Ok(removed) => {
                for path in removed {
                    info!(target: "sync", path = %path.display(), "删除同一章节的旧归档");
                }
            }
            Err(e) => warn!(target: "sync", chapter = %chapter.id, error = %e, "清理旧归档失败"),
        }
        Ok(())
    }

    /// 目录中没有 `cover.*` 时下载一次封面；失败只记录日志。
    fn ensure_cover(&self, meta: &SeriesMeta, dir: &Path) {
        let Some(url) = meta.cover_url.as_deref() else {
            return;
        };
        if has_cover(dir) {
            return;
        }
        let dest = dir.join(format!("cover.{}", cover_extension(url)));
        let result = self.fetcher.fetch(url, &dest);
        if result.success {
            debug!(target: "sync", path = %dest.display(), "封面已下载");
        } else {
            warn!(target: "sync", url, "封面下载失败");
        }
    }
}

fn has_cover(dir: &Path) -> bool {
    let Ok(rd) = fs::read_dir(dir) else {
        return false;
    };
    rd.filter_map(|e| e.ok()).any(|e| {
        let path = e.path();
        path.is_file() && path.file_stem().and_then(|s| s.to_str()) == Some("cover")
    })
}

fn cover_extension(url: &str) -> &str {
    let path = url.split(['?', '#']).next().unwrap_or(url);
    let name = path.rsplit('/').next().unwrap_or(path);
    match name.rsplit_once('.') {
        Some((_, ext))
            if !ext.is_empty() && ext.len() <= 5 && ext.chars().all(|c| c.is_ascii_alphanumeric()) =>
        {
            ext
        }
        _ => "jpg",
    }
}
