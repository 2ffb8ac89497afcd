//! 进度上报与 CLI 进度条。

use indicatif::{ProgressBar, ProgressDrawTarget, ProgressStyle};

/// 同步调用的进度监听器；实现方不得阻塞下载流程。
pub trait ProgressSink {
    fn on_length(&mut self, total: u64);

    /// 前进 `advanced` 步；`label` 为当前处理的章节描述。
    fn on_progress(&mut self, advanced: u64, label: Option<&str>);

    fn finish(&mut self) {}
}

pub struct CliProgress {
    bar: ProgressBar,
}

impl CliProgress {
    pub fn new(prefix: &str) -> Self {
        let style = ProgressStyle::with_template(
            "{prefix} [{elapsed_precise}] {wide_bar} {pos}/{len} {msg}",
        )
        .unwrap_or_else(|_| ProgressStyle::default_bar())
        .progress_chars("##-");

        let bar = ProgressBar::with_draw_target(Some(0), ProgressDrawTarget::stderr());
        bar.set_style(style);
        bar.set_prefix(prefix.to_string());
        Self { bar }
    }
}

impl ProgressSink for CliProgress {
    fn on_length(&mut self, total: u64) {
        self.bar.set_length(total);
        self.bar.set_position(0);
    }

    fn on_progress(&mut self, advanced: u64, label: Option<&str>) {
        if let Some(label) = label {
            self.bar.set_message(label.to_string());
        }
        self.bar.inc(advanced);
    }

    fn finish(&mut self) {
        self.bar.finish_and_clear();
    }
}
