//! 下载流程模块入口。
//!
//! 子模块：
//! - `models`       ：数据模型（ChapterRef / DeliveryTarget / PageResult / SyncReport）
//! - `rate_limit`   ：全局与按路由的请求节流
//! - `page_fetcher` ：单页下载与镜像统计上报
//! - `coordinator`  ：单章并发下载、换镜像重试
//! - `plan`         ：章节筛选与编号推断
//! - `progress`     ：进度上报与 CLI 进度条
//! - `downloader`   ：作品同步主流程编排

pub mod coordinator;
pub mod downloader;
pub mod models;
pub mod page_fetcher;
pub mod plan;
pub mod progress;
pub mod rate_limit;
