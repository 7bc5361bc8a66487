use std::time::Duration;

use tracing::warn;

/// Timing knobs shared by every session a factory opens.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncConfig {
    /// How long a channel may stay unacknowledged before the session falls back to polling.
    pub guard_timeout: Duration,
    pub poll_interval: Duration,
    /// A poll tick only refreshes when the last completed fetch is older than this.
    pub poll_threshold: Duration,
    /// Delay before the reconciliation fetch that follows a write in polling mode.
    pub reconcile_delay: Duration,
    /// Client signatures, in addition to the built-in list, that disable the push channel.
    pub extra_bad_signatures: Vec<String>,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            guard_timeout: Duration::from_secs(15),
            poll_interval: Duration::from_secs(10),
            poll_threshold: Duration::from_secs(8),
            reconcile_delay: Duration::from_secs(1),
            extra_bad_signatures: Vec::new(),
        }
    }
}

impl SyncConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        let guard_timeout = env_millis("LEDGER_SYNC_GUARD_TIMEOUT_MS").unwrap_or(defaults.guard_timeout);
        let poll_interval = env_millis("LEDGER_SYNC_POLL_INTERVAL_MS").unwrap_or(defaults.poll_interval);
        let poll_threshold =
            env_millis("LEDGER_SYNC_POLL_THRESHOLD_MS").unwrap_or(defaults.poll_threshold);
        let reconcile_delay =
            env_millis("LEDGER_SYNC_RECONCILE_DELAY_MS").unwrap_or(defaults.reconcile_delay);
        let extra_bad_signatures = std::env::var("LEDGER_SYNC_BAD_CLIENTS")
            .map(|v| {
                v.split(',')
                    .map(str::trim)
                    .filter(|s| !s.is_empty())
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default();
        Self {
            guard_timeout,
            poll_interval,
            poll_threshold,
            reconcile_delay,
            extra_bad_signatures,
        }
        .normalized()
    }

    /// Keeps the poll threshold strictly below the interval and replaces zero durations.
    pub fn normalized(mut self) -> Self {
        let defaults = Self::default();
        if self.guard_timeout.is_zero() {
            self.guard_timeout = defaults.guard_timeout;
        }
        if self.poll_interval.is_zero() {
            self.poll_interval = defaults.poll_interval;
        }
        if self.poll_threshold >= self.poll_interval {
            let clamped = self.poll_interval.mul_f64(0.8);
            warn!(
                target = "ledger_sync",
                threshold_ms = self.poll_threshold.as_millis() as u64,
                interval_ms = self.poll_interval.as_millis() as u64,
                clamped_ms = clamped.as_millis() as u64,
                "poll threshold must stay below the poll interval"
            );
            self.poll_threshold = clamped;
        }
        self
    }
}

fn env_millis(var: &str) -> Option<Duration> {
    std::env::var(var)
        .ok()
        .and_then(|v| v.trim().parse::<u64>().ok())
        .map(Duration::from_millis)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    const VARS: &[&str] = &[
        "LEDGER_SYNC_GUARD_TIMEOUT_MS",
        "LEDGER_SYNC_POLL_INTERVAL_MS",
        "LEDGER_SYNC_POLL_THRESHOLD_MS",
        "LEDGER_SYNC_RECONCILE_DELAY_MS",
        "LEDGER_SYNC_BAD_CLIENTS",
    ];

    fn clear_env() {
        for var in VARS {
            std::env::remove_var(var);
        }
    }

    #[test]
    #[serial]
    fn defaults_when_env_is_empty() {
        clear_env();
        assert_eq!(SyncConfig::from_env(), SyncConfig::default());
    }

    #[test]
    #[serial]
    fn reads_overrides_from_env() {
        clear_env();
        std::env::set_var("LEDGER_SYNC_GUARD_TIMEOUT_MS", "5000");
        std::env::set_var("LEDGER_SYNC_POLL_INTERVAL_MS", "20000");
        std::env::set_var("LEDGER_SYNC_POLL_THRESHOLD_MS", "12000");
        std::env::set_var("LEDGER_SYNC_RECONCILE_DELAY_MS", "250");
        std::env::set_var("LEDGER_SYNC_BAD_CLIENTS", " SomeWebView , ,Kiosk/1.0");
        let config = SyncConfig::from_env();
        clear_env();

        assert_eq!(config.guard_timeout, Duration::from_secs(5));
        assert_eq!(config.poll_interval, Duration::from_secs(20));
        assert_eq!(config.poll_threshold, Duration::from_secs(12));
        assert_eq!(config.reconcile_delay, Duration::from_millis(250));
        assert_eq!(config.extra_bad_signatures, ["SomeWebView", "Kiosk/1.0"]);
    }

    #[test]
    #[serial]
    fn unparsable_values_fall_back_to_defaults() {
        clear_env();
        std::env::set_var("LEDGER_SYNC_POLL_INTERVAL_MS", "soon");
        let config = SyncConfig::from_env();
        clear_env();
        assert_eq!(config.poll_interval, Duration::from_secs(10));
    }

    #[test]
    fn threshold_is_clamped_below_interval() {
        let config = SyncConfig {
            poll_interval: Duration::from_secs(10),
            poll_threshold: Duration::from_secs(30),
            ..SyncConfig::default()
        }
        .normalized();
        assert_eq!(config.poll_threshold, Duration::from_secs(8));
    }
}
