//! 单页下载与镜像统计上报。

use std::fs::{self, File};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Instant;

use reqwest::blocking::Client;
use serde::Serialize;
use tracing::debug;

use super::models::PageResult;
use crate::base_system::series_paths::PART_SUFFIX;

pub trait PageFetch: Sync {
    /// 下载 `address` 到 `destination`；失败时 `destination` 不存在。
    fn fetch(&self, address: &str, destination: &Path) -> PageResult;
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct TelemetryReport {
    pub url: String,
    pub success: bool,
    pub cached: bool,
    pub bytes: u64,
    /// 毫秒
    pub duration: u64,
}

/// 镜像节点统计上报端点（例如 MangaDex@Home 的 report 接口）。
pub trait TelemetrySink: Send + Sync {
    fn report(&self, report: &TelemetryReport) -> anyhow::Result<()>;
}

/// 上报失败计数：失败 +1，成功 -1（不低于 0），计数超过阈值时跳过上报。
#[derive(Debug)]
pub struct TelemetryGate {
    failures: AtomicU32,
    threshold: u32,
}

impl TelemetryGate {
    pub fn new(threshold: u32) -> Self {
        Self {
            failures: AtomicU32::new(0),
            threshold,
        }
    }

    pub fn allows(&self) -> bool {
        self.failures.load(Ordering::Relaxed) <= self.threshold
    }

    pub fn record(&self, ok: bool) {
        if ok {
            let _ = self
                .failures
                .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |n| {
                    Some(n.saturating_sub(1))
                });
        } else {
            self.failures.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn failures(&self) -> u32 {
        self.failures.load(Ordering::Relaxed)
    }
}

#[derive(Debug, thiserror::Error)]
enum FetchError {
    #[error("transport: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("io: {0}")]
    Io(#[from] io::Error),
}

pub struct PageFetcher {
    client: Client,
    telemetry: Option<Arc<dyn TelemetrySink>>,
    gate: TelemetryGate,
}

impl PageFetcher {
    pub fn new(client: Client, report_failure_threshold: u32) -> Self {
        Self {
            client,
            telemetry: None,
            gate: TelemetryGate::new(report_failure_threshold),
        }
    }

    pub fn with_telemetry(mut self, sink: Arc<dyn TelemetrySink>) -> Self {
        self.telemetry = Some(sink);
        self
    }

    fn download(
        &self,
        address: &str,
        destination: &Path,
        cached: &mut Option<bool>,
    ) -> Result<u64, FetchError> {
        let mut resp = self.client.get(address).send()?;
        *cached = Some(
            resp.headers()
                .get("X-Cache")
                .and_then(|v| v.to_str().ok())
                .map(|v| v.starts_with("HIT"))
                .unwrap_or(false),
        );
        if let Err(e) = resp.error_for_status_ref() {
            return Err(e.into());
        }

        let part = part_path(destination);
        let written = (|| -> Result<u64, FetchError> {
            let mut file = File::create(&part)?;
            let n = resp.copy_to(&mut file)?;
            file.flush()?;
            drop(file);
            fs::rename(&part, destination)?;
            Ok(n)
        })();
        if written.is_err() {
            let _ = fs::remove_file(&part);
        }
        written
    }

    fn report(&self, address: &str, result: &PageResult) {
        let Some(sink) = self.telemetry.as_ref() else {
            return;
        };
        if !self.gate.allows() {
            return;
        }
        let report = TelemetryReport {
            url: address.to_string(),
            success: result.success,
            cached: result.cached.unwrap_or(false),
            bytes: result.bytes,
            duration: result.elapsed.as_millis() as u64,
        };
        match sink.report(&report) {
            Ok(()) => self.gate.record(true),
            Err(e) => {
                self.gate.record(false);
                debug!(target: "fetch", url = address, error = %e, failures = self.gate.failures(), "统计上报失败");
            }
        }
    }
}

impl PageFetch for PageFetcher {
    fn fetch(&self, address: &str, destination: &Path) -> PageResult {
        debug!(target: "fetch", url = address, "下载页面");
        let started = Instant::now();
        let mut cached = None;
        let (success, bytes) = match self.download(address, destination, &mut cached) {
            Ok(n) => (true, n),
            Err(e) => {
                debug!(target: "fetch", url = address, error = %e, "页面下载失败");
                (false, 0)
            }
        };
        let result = PageResult {
            page: address.to_string(),
            success,
            bytes,
            elapsed: started.elapsed(),
            cached,
        };
        self.report(address, &result);
        result
    }
}

pub(crate) fn part_path(destination: &Path) -> PathBuf {
    let mut name = destination
        .file_name()
        .map(|s| s.to_os_string())
        .unwrap_or_default();
    name.push(PART_SUFFIX);
    destination.with_file_name(name)
}
