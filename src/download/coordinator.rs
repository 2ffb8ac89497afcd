//! 单章下载协调：解析镜像 → 并发拉取页面 → 失败页换镜像重试。
//!
//! 状态机：`Resolving → Fetching → 完成`，或
//! `Fetching → Resolving → Fetching → … → Exhausted`，最多 3 轮。

use std::fs;
use std::io;
use std::panic::{self, AssertUnwindSafe};
use std::path::{Path, PathBuf};
use std::thread;

use crossbeam_channel as channel;
use tempfile::TempDir;
use thiserror::Error;
use tracing::{debug, warn};

use super::models::{ChapterRef, DeliveryTarget};
use super::page_fetcher::{PageFetch, part_path};
use crate::sources::{DeliveryResolver, SourceError};

pub const MAX_ATTEMPTS: u32 = 3;
pub const DEFAULT_WORKERS: usize = 4;

#[derive(Debug, Error)]
pub enum DownloadError {
    #[error("{failed} page(s) still failing after {attempts} attempts")]
    RetryExhausted { attempts: u32, failed: usize },
    #[error("resolving delivery target failed: {0}")]
    Resolve(#[from] SourceError),
    #[error("staging directory: {0}")]
    Staging(#[from] io::Error),
}

/// 一章页面的临时目录，独占所有权；`release` 或 Drop 时删除全部内容。
#[derive(Debug)]
pub struct StagingArea {
    dir: TempDir,
}

impl StagingArea {
    fn create(root: Option<&Path>) -> io::Result<Self> {
        let mut builder = tempfile::Builder::new();
        builder.prefix("chapter-sync-");
        let dir = match root {
            Some(root) => builder.tempdir_in(root)?,
            None => builder.tempdir()?,
        };
        Ok(Self { dir })
    }

    pub fn path(&self) -> &Path {
        self.dir.path()
    }

    /// 暂存目录中的文件（不递归）。
    #[cfg(test)]
    pub fn files(&self) -> io::Result<Vec<PathBuf>> {
        let mut files = Vec::new();
        for entry in fs::read_dir(self.path())? {
            let entry = entry?;
            if entry.file_type()?.is_file() {
                files.push(entry.path());
            }
        }
        Ok(files)
    }

    pub fn release(self) -> io::Result<()> {
        self.dir.close()
    }
}

/// 待下载的页面；`index` 是页面在章节中的原始位置（从 1 开始），重试时保持不变。
#[derive(Debug, Clone, PartialEq, Eq)]
struct PendingPage {
    index: usize,
    id: String,
}

impl PendingPage {
    fn file_name(&self) -> String {
        let base = self.id.split(['?', '#']).next().unwrap_or(&self.id);
        let base = base.rsplit('/').next().unwrap_or(base);
        format!("{:03}-{}", self.index, base)
    }
}

enum Phase {
    Resolving,
    Fetching(DeliveryTarget),
    Exhausted { failed: usize },
}

pub struct ChapterDownloadCoordinator<'a> {
    resolver: &'a dyn DeliveryResolver,
    fetcher: &'a dyn PageFetch,
    workers: usize,
    staging_root: Option<PathBuf>,
}

impl<'a> ChapterDownloadCoordinator<'a> {
    pub fn new(resolver: &'a dyn DeliveryResolver, fetcher: &'a dyn PageFetch) -> Self {
        Self {
            resolver,
            fetcher,
            workers: DEFAULT_WORKERS,
            staging_root: None,
        }
    }

    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers.max(1);
        self
    }

    /// 暂存目录建在 `root` 下，默认使用系统临时目录。
    #[cfg(test)]
    pub fn with_staging_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.staging_root = Some(root.into());
        self
    }

    /// 下载整章到新的暂存目录。失败时暂存目录已被删除。
    pub fn download(&self, chapter: &ChapterRef) -> Result<StagingArea, DownloadError> {
        let staging = StagingArea::create(self.staging_root.as_deref())?;
        let mut pending: Option<Vec<PendingPage>> = None;
        let mut attempt = 0u32;
        let mut phase = Phase::Resolving;

        loop {
            phase = match phase {
                Phase::Resolving => {
                    let target = self.resolver.resolve(&chapter.id)?;
                    debug!(target: "download", chapter = %chapter.id, base = %target.base_url, "镜像解析完成");
                    Phase::Fetching(target)
                }
                Phase::Fetching(target) => {
                    attempt += 1;
                    let pages = pending.take().unwrap_or_else(|| {
                        self.resolver
                            .list_pages(&target)
                            .into_iter()
                            .enumerate()
                            .map(|(i, id)| PendingPage { index: i + 1, id })
                            .collect()
                    });
                    let total = pages.len();
                    let failed = self.fetch_pages(&target, pages, staging.path());
                    if failed.is_empty() {
                        debug!(target: "download", chapter = %chapter.id, attempt, pages = total, "章节页面下载完成");
                        return Ok(staging);
                    }
                    if attempt >= MAX_ATTEMPTS {
                        Phase::Exhausted {
                            failed: failed.len(),
                        }
                    } else {
                        let ids: Vec<&str> = failed.iter().map(|p| p.id.as_str()).collect();
                        debug!(target: "download", chapter = %chapter.id, attempt, "换镜像重试失败页面: {}", ids.join(", "));
                        pending = Some(failed);
                        Phase::Resolving
                    }
                }
                Phase::Exhausted { failed } => {
                    debug!(target: "download", chapter = %chapter.id, attempts = attempt, "重试次数耗尽，放弃本章");
                    if let Err(e) = staging.release() {
                        warn!(target: "download", error = %e, "删除暂存目录失败");
                    }
                    return Err(DownloadError::RetryExhausted {
                        attempts: attempt,
                        failed,
                    });
                }
            };
        }
    }

    /// 有界并发下载一批页面，返回失败的页面（按原始顺序）。
    /// 所有工作线程都结束后才返回，不会留下仍在写暂存目录的后台任务。
    fn fetch_pages(
        &self,
        target: &DeliveryTarget,
        pages: Vec<PendingPage>,
        dir: &Path,
    ) -> Vec<PendingPage> {
        if pages.is_empty() {
            return Vec::new();
        }

        let workers = self.workers.clamp(1, pages.len());
        let (job_tx, job_rx) = channel::unbounded::<PendingPage>();
        let (fail_tx, fail_rx) = channel::unbounded::<PendingPage>();
        for page in pages {
            let _ = job_tx.send(page);
        }
        drop(job_tx);

        let fetcher = self.fetcher;
        thread::scope(|scope| {
            for n in 0..workers {
                let job_rx = job_rx.clone();
                let fail_tx = fail_tx.clone();
                let spawned = thread::Builder::new()
                    .name(format!("page-{n}"))
                    .spawn_scoped(scope, move || {
                        for page in job_rx.iter() {
                            let address = target.address(&page.id);
                            let dest = dir.join(page.file_name());
                            let ok = match panic::catch_unwind(AssertUnwindSafe(|| {
                                fetcher.fetch(&address, &dest)
                            })) {
                                Ok(result) => result.success,
                                Err(_) => {
                                    warn!(target: "download", url = %address, "页面下载出现异常，按失败处理");
                                    let _ = fs::remove_file(&dest);
                                    let _ = fs::remove_file(part_path(&dest));
                                    false
                                }
                            };
                            if !ok {
                                let _ = fail_tx.send(page);
                            }
                        }
                    });
                if let Err(e) = spawned {
                    warn!(target: "download", error = %e, "无法创建下载线程");
                }
            }
        });
        drop(fail_tx);

        // 线程创建失败时未被领取的任务也算失败
        let mut failed: Vec<PendingPage> = fail_rx.try_iter().chain(job_rx.try_iter()).collect();
        failed.sort_by_key(|p| p.index);
        failed
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::download::models::PageResult;
    use std::collections::{HashMap, HashSet};
    use std::sync::Mutex;
    use std::time::Duration;
    use time::macros::datetime;

    /// 每次解析返回新的镜像地址 `https://node{n}.test/`。
    /// 设置 `fail_after` 后，超过该次数的解析一律失败。
    pub(crate) struct FakeResolver {
        pub pages: HashMap<String, Vec<String>>,
        pub calls: Mutex<Vec<String>>,
        pub fail_after: Option<usize>,
    }

    impl FakeResolver {
        pub(crate) fn new(chapters: &[(&str, &[&str])]) -> Self {
            Self {
                pages: chapters
                    .iter()
                    .map(|(id, pages)| {
                        (id.to_string(), pages.iter().map(|p| p.to_string()).collect())
                    })
                    .collect(),
                calls: Mutex::new(Vec::new()),
                fail_after: None,
            }
        }

        pub(crate) fn resolve_count(&self, chapter_id: &str) -> usize {
            self.calls
                .lock()
                .unwrap()
                .iter()
                .filter(|c| *c == chapter_id)
                .count()
        }
    }

    impl DeliveryResolver for FakeResolver {
        fn resolve(&self, chapter_id: &str) -> Result<DeliveryTarget, SourceError> {
            let mut calls = self.calls.lock().unwrap();
            calls.push(chapter_id.to_string());
            if self.fail_after.is_some_and(|n| calls.len() > n) {
                return Err(SourceError::parse("at-home response", "mirror list unavailable"));
            }
            let pages = self
                .pages
                .get(chapter_id)
                .cloned()
                .ok_or_else(|| SourceError::parse("at-home response", "unknown chapter"))?;
            Ok(DeliveryTarget {
                base_url: format!("https://node{}.test/", calls.len()),
                pages,
            })
        }
    }

    /// 按 URL 决定成败：`fail_once` 中的地址第一次失败，`always_fail` 中的页面永远失败。
    /// `panic_on` 中的页面每次、`panic_once` 中的页面第一次在写出半个 `.part` 后 panic。
    #[derive(Default)]
    pub(crate) struct FakeFetcher {
        pub fail_once: Mutex<HashSet<String>>,
        pub always_fail: HashSet<String>,
        pub panic_on: HashSet<String>,
        pub panic_once: Mutex<HashSet<String>>,
        pub requests: Mutex<Vec<String>>,
    }

    impl FakeFetcher {
        pub(crate) fn requests(&self) -> Vec<String> {
            self.requests.lock().unwrap().clone()
        }
    }

    impl PageFetch for FakeFetcher {
        fn fetch(&self, address: &str, destination: &Path) -> PageResult {
            self.requests.lock().unwrap().push(address.to_string());
            let page = address.rsplit('/').next().unwrap_or(address).to_string();
            if self.panic_on.contains(&page) || self.panic_once.lock().unwrap().remove(&page) {
                fs::write(part_path(destination), b"half").unwrap();
                panic!("decoder blew up on {page}");
            }
            let failed =
                self.always_fail.contains(&page) || self.fail_once.lock().unwrap().remove(&page);
            if !failed {
                fs::write(destination, address.as_bytes()).unwrap();
            }
            PageResult {
                page: address.to_string(),
                success: !failed,
                bytes: if failed { 0 } else { address.len() as u64 },
                elapsed: Duration::from_millis(1),
                cached: None,
            }
        }
    }

    fn chapter(id: &str) -> ChapterRef {
        ChapterRef::new(id, Some("1"), datetime!(2024-01-01 00:00:00 UTC))
    }

    fn staged_names(staging: &StagingArea) -> Vec<String> {
        let mut names: Vec<String> = staging
            .files()
            .unwrap()
            .iter()
            .map(|p| p.file_name().unwrap().to_string_lossy().to_string())
            .collect();
        names.sort();
        names
    }

    #[test]
    fn all_pages_succeed_on_first_attempt() {
        let resolver = FakeResolver::new(&[("c1", &["a.png", "b.png", "c.png"])]);
        let fetcher = FakeFetcher::default();
        let coordinator = ChapterDownloadCoordinator::new(&resolver, &fetcher).with_workers(2);

        let staging = coordinator.download(&chapter("c1")).unwrap();
        assert_eq!(
            staged_names(&staging),
            vec!["001-a.png", "002-b.png", "003-c.png"]
        );
        assert_eq!(resolver.resolve_count("c1"), 1);
        assert_eq!(fetcher.requests().len(), 3);

        let path = staging.path().to_path_buf();
        staging.release().unwrap();
        assert!(!path.exists());
    }

    #[test]
    fn failed_page_is_retried_alone_on_fresh_mirror() {
        let resolver = FakeResolver::new(&[("c1", &["a.png", "b.png", "c.png"])]);
        let fetcher = FakeFetcher {
            fail_once: Mutex::new(HashSet::from(["c.png".to_string()])),
            ..FakeFetcher::default()
        };
        let coordinator = ChapterDownloadCoordinator::new(&resolver, &fetcher);

        let staging = coordinator.download(&chapter("c1")).unwrap();
        assert_eq!(resolver.resolve_count("c1"), 2);

        let requests = fetcher.requests();
        assert_eq!(requests.len(), 4);
        // 第二轮只请求失败页，且来自新镜像
        assert_eq!(requests[3], "https://node2.test/c.png");
        assert_eq!(
            staged_names(&staging),
            vec!["001-a.png", "002-b.png", "003-c.png"]
        );
    }

    fn is_empty_dir(dir: &Path) -> bool {
        fs::read_dir(dir).unwrap().next().is_none()
    }

    #[test]
    fn gives_up_after_three_attempts_and_cleans_staging() {
        let root = tempfile::tempdir().unwrap();
        let resolver = FakeResolver::new(&[("c1", &["a.png", "b.png"])]);
        let fetcher = FakeFetcher {
            always_fail: HashSet::from(["b.png".to_string()]),
            ..FakeFetcher::default()
        };
        let coordinator =
            ChapterDownloadCoordinator::new(&resolver, &fetcher).with_staging_root(root.path());

        let err = coordinator.download(&chapter("c1")).unwrap_err();
        assert!(matches!(
            err,
            DownloadError::RetryExhausted {
                attempts: 3,
                failed: 1
            }
        ));
        // 首次解析 + 两次重新解析；最后一轮失败后不再解析
        assert_eq!(resolver.resolve_count("c1"), 3);
        let b_requests = fetcher
            .requests()
            .iter()
            .filter(|r| r.ends_with("b.png"))
            .count();
        assert_eq!(b_requests, 3);
        // 已下载的 a.png 连同暂存目录一起删除
        assert!(is_empty_dir(root.path()));
    }

    #[test]
    fn resolve_failure_during_retry_cleans_staging() {
        let root = tempfile::tempdir().unwrap();
        let mut resolver = FakeResolver::new(&[("c1", &["a.png", "b.png"])]);
        resolver.fail_after = Some(1);
        let fetcher = FakeFetcher {
            fail_once: Mutex::new(HashSet::from(["b.png".to_string()])),
            ..FakeFetcher::default()
        };
        let coordinator =
            ChapterDownloadCoordinator::new(&resolver, &fetcher).with_staging_root(root.path());

        let err = coordinator.download(&chapter("c1")).unwrap_err();
        assert!(matches!(err, DownloadError::Resolve(e) if e.is_parse()));
        assert_eq!(resolver.resolve_count("c1"), 2);
        assert_eq!(fetcher.requests().len(), 2);
        assert!(is_empty_dir(root.path()));
    }

    #[test]
    fn page_that_panicked_once_leaves_no_partial_file() {
        let resolver = FakeResolver::new(&[("c1", &["a.png", "b.png", "c.png"])]);
        let fetcher = FakeFetcher {
            panic_once: Mutex::new(HashSet::from(["b.png".to_string()])),
            ..FakeFetcher::default()
        };
        let coordinator = ChapterDownloadCoordinator::new(&resolver, &fetcher);

        let staging = coordinator.download(&chapter("c1")).unwrap();
        assert_eq!(resolver.resolve_count("c1"), 2);
        assert_eq!(
            staged_names(&staging),
            vec!["001-a.png", "002-b.png", "003-c.png"]
        );
    }

    #[test]
    fn empty_chapter_succeeds_trivially() {
        let resolver = FakeResolver::new(&[("c1", &[])]);
        let fetcher = FakeFetcher::default();
        let coordinator = ChapterDownloadCoordinator::new(&resolver, &fetcher);

        let staging = coordinator.download(&chapter("c1")).unwrap();
        assert!(staging.files().unwrap().is_empty());
        assert!(fetcher.requests().is_empty());
    }

    #[test]
    fn panicking_page_does_not_abort_siblings() {
        let resolver = FakeResolver::new(&[("c1", &["a.png", "b.png", "c.png", "d.png"])]);
        let fetcher = FakeFetcher {
            panic_on: HashSet::from(["b.png".to_string()]),
            ..FakeFetcher::default()
        };
        let coordinator = ChapterDownloadCoordinator::new(&resolver, &fetcher).with_workers(4);

        let err = coordinator.download(&chapter("c1")).unwrap_err();
        assert!(matches!(err, DownloadError::RetryExhausted { failed: 1, .. }));
        // 其他页面在每一轮都完成了请求
        let a_requests = fetcher
            .requests()
            .iter()
            .filter(|r| r.ends_with("a.png"))
            .count();
        assert_eq!(a_requests, 1);
        assert_eq!(fetcher.requests().len(), 6);
    }

    #[test]
    fn resolve_failure_is_reported() {
        let root = tempfile::tempdir().unwrap();
        let resolver = FakeResolver::new(&[]);
        let fetcher = FakeFetcher::default();
        let coordinator =
            ChapterDownloadCoordinator::new(&resolver, &fetcher).with_staging_root(root.path());

        let err = coordinator.download(&chapter("missing")).unwrap_err();
        assert!(matches!(err, DownloadError::Resolve(e) if e.is_parse()));
        assert!(is_empty_dir(root.path()));
    }

    #[test]
    fn staged_names_strip_paths_and_queries() {
        let page = PendingPage {
            index: 7,
            id: "https://cdn.test/img/0007.jpg?token=abc".into(),
        };
        assert_eq!(page.file_name(), "007-0007.jpg");
    }
}
