//! Configuration for the replication engine.

use rand::Rng;
use std::time::Duration;

/// Foreign-key handling while applying incoming transactions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FkChecks {
    /// Keep the database's own FK enforcement; the engine repairs incoming
    /// FK-violating deletes itself when compensations are enabled.
    #[default]
    Inherit,
    /// Disable FK enforcement for the apply transaction. Used on engines
    /// without deferred FK checks; compensations become a no-op.
    Disabled,
}

/// Configuration for the Satellite engine.
#[derive(Debug, Clone)]
pub struct SatelliteConfig {
    /// Logical database name used in connectivity notifications.
    pub db_name: String,
    /// Snapshot cadence.
    pub polling_interval: Duration,
    /// Coalescing window for throttled snapshot requests.
    pub min_snapshot_window: Duration,
    /// Foreign-key handling during apply.
    pub fk_checks: FkChecks,
    /// Whether FK-violating incoming deletes are repaired with synthetic
    /// parent inserts.
    pub compensations: bool,
    /// Reconnect backoff.
    pub backoff: BackoffConfig,
}

impl SatelliteConfig {
    /// Creates a configuration with defaults for the given database name.
    pub fn new(db_name: impl Into<String>) -> Self {
        Self {
            db_name: db_name.into(),
            polling_interval: Duration::from_millis(2_000),
            min_snapshot_window: Duration::from_millis(40),
            fk_checks: FkChecks::default(),
            compensations: false,
            backoff: BackoffConfig::default(),
        }
    }

    /// Sets the snapshot polling interval.
    pub fn with_polling_interval(mut self, interval: Duration) -> Self {
        self.polling_interval = interval;
        self
    }

    /// Sets the throttle coalescing window.
    pub fn with_min_snapshot_window(mut self, window: Duration) -> Self {
        self.min_snapshot_window = window;
        self
    }

    /// Sets the foreign-key handling mode.
    pub fn with_fk_checks(mut self, fk_checks: FkChecks) -> Self {
        self.fk_checks = fk_checks;
        self
    }

    /// Enables or disables compensations.
    pub fn with_compensations(mut self, enabled: bool) -> Self {
        self.compensations = enabled;
        self
    }

    /// Sets the reconnect backoff.
    pub fn with_backoff(mut self, backoff: BackoffConfig) -> Self {
        self.backoff = backoff;
        self
    }
}

impl Default for SatelliteConfig {
    fn default() -> Self {
        Self::new("electric")
    }
}

/// Exponential backoff for reconnect attempts.
#[derive(Debug, Clone)]
pub struct BackoffConfig {
    /// Delay before the first retry.
    pub initial: Duration,
    /// Upper bound on the delay.
    pub max: Duration,
    /// Multiplier applied per attempt.
    pub factor: f64,
    /// Whether to add up to 25% jitter.
    pub jitter: bool,
}

impl BackoffConfig {
    /// Creates a backoff configuration.
    pub fn new(initial: Duration, max: Duration, factor: f64) -> Self {
        Self {
            initial,
            max,
            factor,
            jitter: true,
        }
    }

    /// Disables jitter.
    pub fn without_jitter(mut self) -> Self {
        self.jitter = false;
        self
    }

    /// Calculates the delay before the given attempt (0-indexed).
    ///
    /// Attempt 0 connects immediately.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }

        let base = self.initial.as_secs_f64() * self.factor.powi(attempt.saturating_sub(1) as i32);
        let capped = base.min(self.max.as_secs_f64());

        if self.jitter {
            let jitter = capped * 0.25 * rand::thread_rng().gen::<f64>();
            Duration::from_secs_f64(capped + jitter)
        } else {
            Duration::from_secs_f64(capped)
        }
    }
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self::new(Duration::from_millis(100), Duration::from_secs(10), 2.0)
    }
}
