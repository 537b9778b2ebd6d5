use metrics::{Counter, Gauge, Histogram};
use std::time::Duration;

pub struct RenderMetrics {
    pub renders_ok: Counter,
    pub renders_failed: Counter,
    pub render_duration: Histogram,
    pub captcha_hits: Counter,
    pub block_hits: Counter,
    pub rate_limited: Counter,
    pub queue_depth: Gauge,
    pub active_leases: Gauge,
}

impl RenderMetrics {
    pub fn new() -> Self {
        Self {
            renders_ok: Counter::noop(),
            renders_failed: Counter::noop(),
            render_duration: Histogram::noop(),
            captcha_hits: Counter::noop(),
            block_hits: Counter::noop(),
            rate_limited: Counter::noop(),
            queue_depth: Gauge::noop(),
            active_leases: Gauge::noop(),
        }
    }

    pub fn record_render(&self, duration: Duration, success: bool) {
        if success {
            self.renders_ok.increment(1);
        } else {
            self.renders_failed.increment(1);
        }
        self.render_duration.record(duration.as_secs_f64());
    }

    pub fn record_captcha(&self) {
        self.captcha_hits.increment(1);
    }

    pub fn record_block(&self) {
        self.block_hits.increment(1);
    }

    pub fn record_rate_limited(&self) {
        self.rate_limited.increment(1);
    }

    pub fn record_pool(&self, queue_length: usize, active_leases: usize) {
        self.queue_depth.set(queue_length as f64);
        self.active_leases.set(active_leases as f64);
    }
}

impl Default for RenderMetrics {
    fn default() -> Self {
        Self::new()
    }
}
