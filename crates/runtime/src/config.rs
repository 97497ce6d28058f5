use std::str::FromStr;
use std::time::Duration;

use rekon_queue::{controller_limiter, is_valid_qps, ExponentialBackoff, MaxOfLimiter};
use serde::{Deserialize, Serialize};
use tracing::warn;

/// What happens to a key once it has failed `max_retries` times in a row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GiveUpPolicy {
    /// Forget the key and report the last error to the sink.
    #[default]
    Report,
    /// As `Report`, then call `Reconciler::on_give_up` so the failure can be
    /// recorded on the object itself.
    ReportAndNotify,
}

impl FromStr for GiveUpPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().replace('-', "_").as_str() {
            "report" => Ok(GiveUpPolicy::Report),
            "report_and_notify" | "notify" => Ok(GiveUpPolicy::ReportAndNotify),
            other => Err(format!("unknown give-up policy: {other}")),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ControllerConfig {
    /// Used in logs, metric labels and the work queue name.
    pub name: String,
    pub workers: usize,
    pub max_retries: u32,
    /// Periodic re-enqueue of every cached key; 0 disables.
    pub resync_secs: u64,
    /// Capacity of the reflector -> translator channel.
    pub event_buffer: usize,
    pub watch_backoff_base_ms: u64,
    pub watch_backoff_max_secs: u64,
    pub queue_base_delay_ms: u64,
    pub queue_max_delay_secs: u64,
    pub queue_qps: f64,
    pub queue_burst: u32,
    pub give_up: GiveUpPolicy,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            name: "controller".into(),
            workers: 1,
            max_retries: 5,
            resync_secs: 0,
            event_buffer: 1024,
            watch_backoff_base_ms: 800,
            watch_backoff_max_secs: 30,
            queue_base_delay_ms: 5,
            queue_max_delay_secs: 1000,
            queue_qps: 10.0,
            queue_burst: 100,
            give_up: GiveUpPolicy::Report,
        }
    }
}

fn parsed<T, F>(lookup: &F, var: &str) -> Option<T>
where
    T: FromStr,
    T::Err: std::fmt::Display,
    F: Fn(&str) -> Option<String>,
{
    let raw = lookup(var)?;
    match raw.parse() {
        Ok(v) => Some(v),
        Err(e) => {
            warn!(var, value = %raw, error = %e, "ignoring invalid setting");
            None
        }
    }
}

impl ControllerConfig {
    pub fn new(name: impl Into<String>) -> Self { Self { name: name.into(), ..Self::default() } }

    /// Defaults overlaid with `REKON_*` environment variables.
    pub fn from_env(name: impl Into<String>) -> Self {
        Self::new(name).overlay(|var| std::env::var(var).ok())
    }

    /// Overlay settings from `lookup` (keyed by `REKON_*` names); unset or
    /// unparsable values keep the current setting.
    pub fn overlay<F>(mut self, lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(v) = parsed(&lookup, "REKON_WORKERS") { self.workers = v; }
        if let Some(v) = parsed(&lookup, "REKON_MAX_RETRIES") { self.max_retries = v; }
        if let Some(v) = parsed(&lookup, "REKON_RESYNC_SECS") { self.resync_secs = v; }
        if let Some(v) = parsed(&lookup, "REKON_EVENT_BUFFER") { self.event_buffer = v; }
        if let Some(v) = parsed(&lookup, "REKON_WATCH_BACKOFF_BASE_MS") { self.watch_backoff_base_ms = v; }
        if let Some(v) = parsed(&lookup, "REKON_WATCH_BACKOFF_MAX_SECS") { self.watch_backoff_max_secs = v; }
        if let Some(v) = parsed(&lookup, "REKON_QUEUE_BASE_DELAY_MS") { self.queue_base_delay_ms = v; }
        if let Some(v) = parsed(&lookup, "REKON_QUEUE_MAX_DELAY_SECS") { self.queue_max_delay_secs = v; }
        match parsed::<f64, _>(&lookup, "REKON_QUEUE_QPS") {
            Some(v) if is_valid_qps(v) => self.queue_qps = v,
            Some(v) => warn!(var = "REKON_QUEUE_QPS", value = v, "ignoring non-positive queue rate"),
            None => {}
        }
        if let Some(v) = parsed(&lookup, "REKON_QUEUE_BURST") { self.queue_burst = v; }
        if let Some(v) = parsed(&lookup, "REKON_GIVE_UP") { self.give_up = v; }
        self
    }

    pub fn resync_period(&self) -> Option<Duration> {
        (self.resync_secs > 0).then(|| Duration::from_secs(self.resync_secs))
    }

    /// Retry schedule for failed lists and watches.
    pub fn watch_backoff(&self) -> ExponentialBackoff {
        ExponentialBackoff::new(
            Duration::from_millis(self.watch_backoff_base_ms),
            Duration::from_secs(self.watch_backoff_max_secs),
        )
    }

    /// Per-key exponential backoff combined with the overall token bucket.
    pub fn rate_limiter<T>(&self) -> MaxOfLimiter<T>
    where
        T: Eq + std::hash::Hash + Clone + Send + 'static,
    {
        let qps = if is_valid_qps(self.queue_qps) {
            self.queue_qps
        } else {
            let fallback = Self::default().queue_qps;
            warn!(controller = %self.name, qps = self.queue_qps, fallback, "invalid queue_qps, using default");
            fallback
        };
        controller_limiter(
            Duration::from_millis(self.queue_base_delay_ms),
            Duration::from_secs(self.queue_max_delay_secs),
            qps,
            self.queue_burst,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rekon_queue::RateLimiter;
    use std::collections::HashMap;

    #[test]
    fn overlay_applies_known_vars_and_skips_garbage() {
        let env: HashMap<&str, &str> = [
            ("REKON_WORKERS", "4"),
            ("REKON_MAX_RETRIES", "nope"),
            ("REKON_RESYNC_SECS", "30"),
            ("REKON_GIVE_UP", "report-and-notify"),
        ]
        .into_iter()
        .collect();
        let cfg = ControllerConfig::new("pods").overlay(|k| env.get(k).map(|v| v.to_string()));
        assert_eq!(cfg.name, "pods");
        assert_eq!(cfg.workers, 4);
        assert_eq!(cfg.max_retries, 5);
        assert_eq!(cfg.resync_period(), Some(Duration::from_secs(30)));
        assert_eq!(cfg.give_up, GiveUpPolicy::ReportAndNotify);
    }

    #[test]
    fn unusable_queue_rate_is_rejected() {
        for raw in ["0", "-3", "NaN", "inf"] {
            let cfg = ControllerConfig::new("pods").overlay(|k| (k == "REKON_QUEUE_QPS").then(|| raw.to_string()));
            assert_eq!(cfg.queue_qps, 10.0, "{raw}");
        }

        // a zero rate that slipped in through serde still yields a working limiter
        let cfg: ControllerConfig = serde_json::from_str(r#"{"queue_qps":0.0,"queue_burst":1}"#).unwrap();
        let limiter = cfg.rate_limiter::<&str>();
        for _ in 0..5 {
            assert!(limiter.when(&"k") <= Duration::from_secs(cfg.queue_max_delay_secs));
        }
    }

    #[test]
    fn partial_json_fills_defaults() {
        let cfg: ControllerConfig = serde_json::from_str(r#"{"name":"x","workers":3,"give_up":"report_and_notify"}"#).unwrap();
        assert_eq!(cfg.workers, 3);
        assert_eq!(cfg.event_buffer, 1024);
        assert_eq!(cfg.give_up, GiveUpPolicy::ReportAndNotify);
        assert_eq!(cfg.resync_period(), None);
    }
}
