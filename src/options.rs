//! Apply configuration.
//!
//! [`ApplyOptions`] can be built in code or read from the environment:
//!
//! | Variable | Meaning | Default |
//! |---|---|---|
//! | `HEMMER_CONCURRENCY` | steps in flight at once | 4 |
//! | `HEMMER_MAX_ATTEMPTS` | driver calls per step, including the first | 3 |
//! | `HEMMER_RETRY_DELAY_MS` | first backoff delay | 1000 |
//! | `HEMMER_OPERATION_TIMEOUT_SECS` | per-call timeout, 0 for none | none |
//! | `HEMMER_REFRESH` | read before update (`true`/`false`) | false |

use std::time::Duration;

use crate::retry::RetryConfig;

/// Default number of steps in flight.
pub const DEFAULT_CONCURRENCY: usize = 4;

/// Options for one apply.
#[derive(Debug, Clone, PartialEq)]
pub struct ApplyOptions {
    /// Maximum number of steps whose driver calls run at once. At least 1.
    pub concurrency: usize,
    /// Retry policy for transient driver errors.
    pub retry: RetryConfig,
    /// Bound on each driver call. Default: none.
    pub operation_timeout: Option<Duration>,
    /// Read the live resource before an update.
    pub refresh: bool,
}

impl Default for ApplyOptions {
    fn default() -> Self {
        Self {
            concurrency: DEFAULT_CONCURRENCY,
            retry: RetryConfig::default(),
            operation_timeout: None,
            refresh: false,
        }
    }
}

impl ApplyOptions {
    /// Create apply options with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the concurrency limit. Values below 1 are raised to 1.
    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency.max(1);
        self
    }

    /// Set the retry policy.
    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    /// Set the per-call timeout.
    pub fn with_operation_timeout(mut self, timeout: Duration) -> Self {
        self.operation_timeout = Some(timeout);
        self
    }

    /// Enable or disable refresh before update.
    pub fn with_refresh(mut self, refresh: bool) -> Self {
        self.refresh = refresh;
        self
    }

    /// Read options from `HEMMER_*` environment variables. Unset or
    /// unparsable values keep their defaults.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        fn parse<T: std::str::FromStr>(
            lookup: &impl Fn(&str) -> Option<String>,
            key: &str,
        ) -> Option<T> {
            let raw = lookup(key)?;
            match raw.trim().parse() {
                Ok(value) => Some(value),
                Err(_) => {
                    tracing::warn!(key, value = %raw, "Ignoring unparsable setting");
                    None
                },
            }
        }

        let mut options = Self::default();
        if let Some(concurrency) = parse::<usize>(&lookup, "HEMMER_CONCURRENCY") {
            options = options.with_concurrency(concurrency);
        }
        if let Some(max_attempts) = parse::<u32>(&lookup, "HEMMER_MAX_ATTEMPTS") {
            options.retry.max_attempts = max_attempts.max(1);
        }
        if let Some(delay_ms) = parse::<u64>(&lookup, "HEMMER_RETRY_DELAY_MS") {
            options.retry.initial_delay = Duration::from_millis(delay_ms);
        }
        match parse::<u64>(&lookup, "HEMMER_OPERATION_TIMEOUT_SECS") {
            Some(0) | None => {},
            Some(secs) => options.operation_timeout = Some(Duration::from_secs(secs)),
        }
        if let Some(refresh) = parse::<bool>(&lookup, "HEMMER_REFRESH") {
            options.refresh = refresh;
        }
        options
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use std::collections::HashMap;

    #[test]
    fn test_defaults_and_builders() {
        let options = ApplyOptions::new();
        assert_eq!(options.concurrency, DEFAULT_CONCURRENCY);
        assert_eq!(options.retry.max_attempts, 3);
        assert!(options.operation_timeout.is_none());
        assert!(!options.refresh);

        let options = ApplyOptions::new()
            .with_concurrency(0)
            .with_retry(RetryConfig::no_retry())
            .with_operation_timeout(Duration::from_secs(10))
            .with_refresh(true);
        assert_eq!(options.concurrency, 1);
        assert_eq!(options.retry.max_attempts, 1);
        assert_eq!(options.operation_timeout, Some(Duration::from_secs(10)));
        assert!(options.refresh);
    }

    const KEYS: [&str; 5] = [
        "HEMMER_CONCURRENCY",
        "HEMMER_MAX_ATTEMPTS",
        "HEMMER_RETRY_DELAY_MS",
        "HEMMER_OPERATION_TIMEOUT_SECS",
        "HEMMER_REFRESH",
    ];

    fn clear_env() {
        for key in KEYS {
            std::env::remove_var(key);
        }
    }

    #[test]
    #[serial]
    fn test_from_env() {
        clear_env();
        std::env::set_var("HEMMER_CONCURRENCY", "8");
        std::env::set_var("HEMMER_MAX_ATTEMPTS", "5");
        std::env::set_var("HEMMER_RETRY_DELAY_MS", "250");
        std::env::set_var("HEMMER_OPERATION_TIMEOUT_SECS", "60");
        std::env::set_var("HEMMER_REFRESH", "true");

        let options = ApplyOptions::from_env();
        clear_env();

        assert_eq!(options.concurrency, 8);
        assert_eq!(options.retry.max_attempts, 5);
        assert_eq!(options.retry.initial_delay, Duration::from_millis(250));
        assert_eq!(options.operation_timeout, Some(Duration::from_secs(60)));
        assert!(options.refresh);
    }

    #[test]
    #[serial]
    fn test_from_env_unset_is_default() {
        clear_env();
        assert_eq!(ApplyOptions::from_env(), ApplyOptions::default());
    }

    #[test]
    fn test_bad_values_keep_defaults() {
        let vars: HashMap<&str, &str> = [
            ("HEMMER_CONCURRENCY", "lots"),
            ("HEMMER_OPERATION_TIMEOUT_SECS", "0"),
            ("HEMMER_REFRESH", "yes please"),
        ]
        .into_iter()
        .collect();

        let options = ApplyOptions::from_lookup(|key| vars.get(key).map(|v| v.to_string()));
        assert_eq!(options, ApplyOptions::default());
    }
}
