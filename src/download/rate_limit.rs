//! 请求节流：全局最小间隔 + 按路由前缀的独立间隔。
//!
//! 每个路由键一把锁，只在检查/记录时间戳时持有；睡眠在锁外进行，醒来后重新检查，
//! 因此并发调用者争抢同一个键时依然保证间隔。不同路由键互不阻塞。

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use tracing::trace;

pub const GLOBAL_ROUTE: &str = "global";

pub trait Clock: Send + Sync {
    fn now(&self) -> Instant;
    fn sleep(&self, dur: Duration);
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }

    fn sleep(&self, dur: Duration) {
        std::thread::sleep(dur);
    }
}

type Slot = Arc<Mutex<Option<Instant>>>;

pub struct RateLimiter {
    clock: Arc<dyn Clock>,
    global_interval: Duration,
    routes: Vec<(String, Duration)>,
    budget: Mutex<HashMap<String, Slot>>,
}

impl RateLimiter {
    pub fn new(global_interval: Duration) -> Self {
        Self {
            clock: Arc::new(SystemClock),
            global_interval,
            routes: Vec::new(),
            budget: Mutex::new(HashMap::new()),
        }
    }

    #[cfg(test)]
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// 为包含 `prefix` 的请求追加一个更严格的间隔。
    pub fn with_route(mut self, prefix: &str, interval: Duration) -> Self {
        self.routes.push((prefix.to_string(), interval));
        self
    }

    /// URL 命中的路由前缀；未命中时只受全局间隔约束。
    pub fn route_for(&self, url: &str) -> Option<&str> {
        self.routes
            .iter()
            .find(|(prefix, _)| url.contains(prefix.as_str()))
            .map(|(prefix, _)| prefix.as_str())
    }

    pub fn wait_for_url(&self, url: &str) -> Instant {
        self.wait(self.route_for(url).unwrap_or(GLOBAL_ROUTE))
    }

    /// 阻塞到 `route_key` 对应的预算允许发出请求，返回记录下的发出时刻。
    pub fn wait(&self, route_key: &str) -> Instant {
        if route_key != GLOBAL_ROUTE {
            if let Some(interval) = self.route_interval(route_key) {
                self.acquire(route_key, interval);
            }
        }
        self.acquire(GLOBAL_ROUTE, self.global_interval)
    }

    fn route_interval(&self, route_key: &str) -> Option<Duration> {
        self.routes
            .iter()
            .find(|(prefix, _)| prefix == route_key)
            .map(|(_, interval)| *interval)
    }

    fn slot(&self, key: &str) -> Slot {
        let mut budget = self.budget.lock().unwrap_or_else(PoisonError::into_inner);
        budget.entry(key.to_string()).or_default().clone()
    }

    fn acquire(&self, key: &str, interval: Duration) -> Instant {
        let slot = self.slot(key);
        loop {
            let delay = {
                let mut last = slot.lock().unwrap_or_else(PoisonError::into_inner);
                let now = self.clock.now();
                match *last {
                    Some(prev) if now < prev + interval => prev + interval - now,
                    _ => {
                        *last = Some(now);
                        return now;
                    }
                }
            };
            trace!(target: "rate_limit", route = key, delay_ms = delay.as_millis() as u64, "节流等待");
            self.clock.sleep(delay);
        }
    }
}
