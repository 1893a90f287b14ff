use std::str::FromStr;
use std::time::Duration;

use chrono_tz::Tz;

/// Runtime knobs, all overridable through `COURIER_*` environment
/// variables. Built once at startup by the composition root and shared
/// behind an `Arc`.
#[derive(Debug, Clone)]
pub struct Config {
    /// Zone applied to schedule times supplied without an explicit offset.
    pub timezone: Tz,
    /// Hard floor: a schedule must be at least this far in the future.
    pub min_lead_secs: i64,
    /// Where already-due same-day times are snapped to.
    pub snap_lead_secs: i64,
    /// Local hour used for date-only schedules on a future date.
    pub morning_hour: u32,
    /// Upper bound on a single send, independent of transport timeouts.
    pub send_timeout: Duration,
    /// Durable-queue retry budget per schedule.
    pub job_attempts: i32,
    pub backoff_base_secs: i64,
    /// Extra wait added to every fallback timer.
    pub fallback_grace: Duration,
    /// Modulus for the per-schedule deterministic timer jitter.
    pub fallback_jitter_mod_ms: u64,
    pub sweep_interval: Duration,
    /// Schedules due longer ago than this are not resurrected.
    pub sweep_window_hours: i64,
    pub worker_poll: Duration,
    pub worker_batch: i64,
    /// Addresses ending with this suffix are treated as structural group
    /// ids; anything else triggers a lookup by group subject.
    pub group_suffix: String,
    pub durable_queue: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            timezone: chrono_tz::America::Sao_Paulo,
            min_lead_secs: 60,
            snap_lead_secs: 120,
            morning_hour: 8,
            send_timeout: Duration::from_secs(30),
            job_attempts: 3,
            backoff_base_secs: 2,
            fallback_grace: Duration::from_millis(500),
            fallback_jitter_mod_ms: 500,
            sweep_interval: Duration::from_secs(60),
            sweep_window_hours: 24,
            worker_poll: Duration::from_millis(500),
            worker_batch: 20,
            group_suffix: "@g.us".to_string(),
            durable_queue: true,
        }
    }
}

impl Config {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        let timezone = match std::env::var("COURIER_TIMEZONE") {
            Ok(raw) => raw.parse().unwrap_or_else(|_| {
                tracing::warn!(timezone = %raw, "config: invalid timezone, using default");
                defaults.timezone
            }),
            Err(_) => defaults.timezone,
        };

        Self {
            timezone,
            min_lead_secs: env_parse("COURIER_MIN_LEAD_SECS", defaults.min_lead_secs),
            snap_lead_secs: env_parse("COURIER_SNAP_LEAD_SECS", defaults.snap_lead_secs),
            morning_hour: env_parse("COURIER_MORNING_HOUR", defaults.morning_hour),
            send_timeout: Duration::from_secs(env_parse("COURIER_SEND_TIMEOUT_SECS", 30)),
            job_attempts: env_parse("COURIER_JOB_ATTEMPTS", defaults.job_attempts),
            backoff_base_secs: env_parse("COURIER_BACKOFF_BASE_SECS", defaults.backoff_base_secs),
            fallback_grace: Duration::from_millis(env_parse("COURIER_FALLBACK_GRACE_MS", 500)),
            fallback_jitter_mod_ms: env_parse(
                "COURIER_FALLBACK_JITTER_MS",
                defaults.fallback_jitter_mod_ms,
            ),
            sweep_interval: Duration::from_secs(env_parse("COURIER_SWEEP_INTERVAL_SECS", 60)),
            sweep_window_hours: env_parse("COURIER_SWEEP_WINDOW_HOURS", defaults.sweep_window_hours),
            worker_poll: Duration::from_millis(env_parse("COURIER_WORKER_POLL_MS", 500)),
            worker_batch: env_parse("COURIER_WORKER_BATCH", defaults.worker_batch),
            group_suffix: std::env::var("COURIER_GROUP_SUFFIX")
                .unwrap_or(defaults.group_suffix),
            durable_queue: env_parse("COURIER_DURABLE_QUEUE", defaults.durable_queue),
        }
    }

    pub fn min_lead(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.min_lead_secs)
    }

    pub fn snap_lead(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.snap_lead_secs)
    }

    pub fn sweep_window(&self) -> chrono::Duration {
        chrono::Duration::hours(self.sweep_window_hours)
    }

    pub fn is_group_address(&self, address: &str) -> bool {
        address.ends_with(&self.group_suffix)
    }
}

fn env_parse<T: FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|raw| raw.parse().ok())
        .unwrap_or(default)
}
