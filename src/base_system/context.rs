//! 全局配置结构（Config）与默认值。
//!
//! 该模块同时提供生成 `config.yml` 的字段元信息。

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::config::{ConfigSpec, FieldMeta};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    // 保存配置
    #[serde(default = "default_download_directory")]
    pub download_directory: String,
    #[serde(default = "default_lang")]
    pub lang: Vec<String>,
    #[serde(default)]
    pub exclude: Vec<String>,

    // 网络配置
    #[serde(default = "default_max_workers")]
    pub max_workers: usize,
    #[serde(default = "default_request_timeout")]
    pub request_timeout: u64,
    #[serde(default = "default_global_interval_ms")]
    pub global_interval_ms: u64,
    #[serde(default = "default_at_home_interval_ms")]
    pub at_home_interval_ms: u64,
    #[serde(default = "default_report_failure_threshold")]
    pub report_failure_threshold: u32,

    // 失败策略
    #[serde(default = "default_true")]
    pub continue_on_chapter_failure: bool,

    // 订阅列表
    #[serde(default)]
    pub manga: Vec<SeriesEntry>,
}

/// `manga` 列表中的一项订阅。
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SeriesEntry {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lang: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub exclude: Vec<String>,
    /// `auto`、RFC 3339 时间或 `YYYY-MM-DD`。
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub since: Option<String>,
    #[serde(default, rename = "from", skip_serializing_if = "Option::is_none")]
    pub from_chapter: Option<f64>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            download_directory: default_download_directory(),
            lang: default_lang(),
            exclude: Vec::new(),
            max_workers: default_max_workers(),
            request_timeout: default_request_timeout(),
            global_interval_ms: default_global_interval_ms(),
            at_home_interval_ms: default_at_home_interval_ms(),
            report_failure_threshold: default_report_failure_threshold(),
            continue_on_chapter_failure: default_true(),
            manga: Vec::new(),
        }
    }
}

impl ConfigSpec for Config {
    const FILE_NAME: &'static str = "config.yml";

    fn fields() -> &'static [FieldMeta] {
        static FIELDS: [FieldMeta; 10] = [
            FieldMeta {
                name: "download_directory",
                description: "漫画保存目录（必须已存在），每部作品会在其中创建子目录",
            },
            FieldMeta {
                name: "lang",
                description: "默认下载的翻译语言列表，例如 [en]",
            },
            FieldMeta {
                name: "exclude",
                description: "全局排除的汉化组/上传者（名称或 ID，不区分大小写）",
            },
            FieldMeta {
                name: "max_workers",
                description: "单章页面并发下载线程数",
            },
            FieldMeta {
                name: "request_timeout",
                description: "请求超时时间（秒）",
            },
            FieldMeta {
                name: "global_interval_ms",
                description: "全局请求最小间隔, 单位ms",
            },
            FieldMeta {
                name: "at_home_interval_ms",
                description: "at-home 镜像解析接口最小间隔, 单位ms",
            },
            FieldMeta {
                name: "report_failure_threshold",
                description: "镜像统计上报累计失败超过该值后暂停上报",
            },
            FieldMeta {
                name: "continue_on_chapter_failure",
                description: "单章下载失败后是否继续下载后续章节（false 则中止该作品）",
            },
            FieldMeta {
                name: "manga",
                description: "订阅列表，每项: id, title?, lang?, exclude?, since? (auto/日期), from?",
            },
        ];
        &FIELDS
    }
}

impl Config {
    pub fn download_dir(&self) -> PathBuf {
        if self.download_directory.trim().is_empty() {
            PathBuf::from(".")
        } else {
            PathBuf::from(&self.download_directory)
        }
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout.max(1))
    }

    pub fn workers(&self) -> usize {
        self.max_workers.clamp(1, 32)
    }

    /// 作品自身语言优先，否则使用全局默认。
    pub fn languages_for(&self, entry: &SeriesEntry) -> Vec<String> {
        match &entry.lang {
            Some(list) if !list.is_empty() => list.clone(),
            _ => self.lang.clone(),
        }
    }

    /// 全局排除列表与作品排除列表合并。
    pub fn exclusions_for(&self, entry: &SeriesEntry) -> Vec<String> {
        self.exclude
            .iter()
            .chain(entry.exclude.iter())
            .cloned()
            .collect()
    }
}

fn default_true() -> bool {
    true
}

fn default_download_directory() -> String {
    ".".to_string()
}

fn default_lang() -> Vec<String> {
    vec!["en".to_string()]
}

fn default_max_workers() -> usize {
    4
}

fn default_request_timeout() -> u64 {
    30
}

fn default_global_interval_ms() -> u64 {
    200
}

fn default_at_home_interval_ms() -> u64 {
    1500
}

fn default_report_failure_threshold() -> u32 {
    5
}
