//! chapter-sync：把漫画来源上的章节增量同步为本地 cbz 归档。
//!
//! 代码结构（读代码入口）：
//! - `base_system`：配置/日志/路径/旧文件清理等基础设施
//! - `sources`：来源接口与 MangaDex 实现
//! - `download`：节流、单页下载、单章重试、章节计划与同步编排
//! - `archive`：ComicInfo 生成与 cbz 原子提交

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, anyhow, bail};
use clap::Parser;
use tracing::{error, info, warn};

mod archive;
mod base_system;
mod download;
mod sources;

use base_system::config::{load_or_create_with_base, resolve_path};
use base_system::context::Config;
use base_system::logging::{LogOptions, LogSystem};
use download::downloader::{SeriesDownloader, SeriesRequest, SyncOptions};
use download::models::SyncReport;
use download::page_fetcher::PageFetcher;
use download::progress::CliProgress;
use download::rate_limit::RateLimiter;
use sources::http_client;
use sources::mangadex::{AT_HOME_ROUTE, MangaDex, MangaDexReporter};

const VERSION: &str = env!("CARGO_PKG_VERSION");

#[derive(Debug, Parser)]
#[command(name = "chapter-sync")]
#[command(about = "Incrementally sync manga chapters into CBZ archives")]
struct Cli {
    /// 配置文件路径（默认 `<data-dir>/config.yml`）
    #[arg(long)]
    config: Option<PathBuf>,

    /// 数据目录路径（用于存放 config.yml 和 logs）
    #[arg(long)]
    data_dir: Option<PathBuf>,

    /// 启用调试日志输出
    #[arg(long, default_value_t = false)]
    debug: bool,

    /// 显示版本信息后退出
    #[arg(long, default_value_t = false)]
    version: bool,

    /// 打印配置文件路径后退出
    #[arg(long, default_value_t = false)]
    print_config_path: bool,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    if cli.version {
        println!("chapter-sync v{VERSION}");
        return Ok(());
    }

    let data_dir = cli.data_dir.as_deref();
    let config_path = cli.config.as_deref();
    if cli.print_config_path {
        println!("{}", resolve_path::<Config>(config_path, data_dir).display());
        return Ok(());
    }

    let _log = init_logging(cli.debug, data_dir)?;
    info!(target: "startup", "当前版本: v{}", VERSION);

    let config =
        load_or_create_with_base::<Config>(config_path, data_dir).context("load config")?;
    run(&config)
}

fn run(config: &Config) -> Result<()> {
    let download_dir = config.download_dir();
    if !download_dir.is_dir() {
        bail!("下载目录不存在: {}", download_dir.display());
    }
    if config.manga.is_empty() {
        warn!(target: "startup", "配置中没有任何作品，请在 manga 列表中添加");
        return Ok(());
    }

    let client = http_client(config.timeout()).context("build http client")?;
    let limiter = RateLimiter::new(Duration::from_millis(config.global_interval_ms))
        .with_route(AT_HOME_ROUTE, Duration::from_millis(config.at_home_interval_ms));
    let source = MangaDex::new(client.clone(), Arc::new(limiter));
    let fetcher = PageFetcher::new(client.clone(), config.report_failure_threshold)
        .with_telemetry(Arc::new(MangaDexReporter::new(client)));
    let downloader = SeriesDownloader::new(&source, &fetcher, SyncOptions::from_config(config));

    let mut total = SyncReport::default();
    let mut failed_series = 0usize;
    for entry in &config.manga {
        let label = entry.title.as_deref().unwrap_or(&entry.id);
        let result = SeriesRequest::from_entry(config, entry)
            .map_err(anyhow::Error::from)
            .and_then(|request| {
                let mut progress = CliProgress::new(label);
                downloader.sync_series(&request, &mut progress)
            });
        match result {
            Ok(report) => {
                total.downloaded += report.downloaded;
                total.skipped += report.skipped;
                total.failed += report.failed;
                if report.aborted {
                    warn!(target: "sync", series = %entry.id, "章节失败，已中止该作品的同步");
                }
            }
            Err(e) => {
                failed_series += 1;
                error!(target: "sync", series = %entry.id, "作品同步失败: {e:#}");
            }
        }
    }

    info!(
        target: "sync",
        downloaded = total.downloaded,
        skipped = total.skipped,
        failed = total.failed,
        "全部作品处理完毕"
    );
    if failed_series > 0 {
        bail!("{failed_series} 部作品同步失败");
    }
    Ok(())
}

fn init_logging(debug: bool, base_dir: Option<&Path>) -> Result<LogSystem> {
    let opts = LogOptions {
        debug,
        use_color: true,
        archive_on_exit: true,
        console: true,
    };
    LogSystem::init_with_base(opts, base_dir).map_err(|e| anyhow!(e))
}
