//! Manager configuration.

use std::time::Duration;

/// Environment variable overriding [`PermitConfig::stall_warning`], in milliseconds.
pub const STALL_WARNING_ENV: &str = "PERMITGATE_STALL_WARNING_MS";

#[derive(Debug, Clone)]
pub struct PermitConfig {
    /// Unbounded waits log a warning each time they have been blocked this long.
    pub stall_warning: Duration,
}

impl PermitConfig {
    pub const DEFAULT_STALL_WARNING: Duration = Duration::from_secs(5);

    /// Defaults, overridden by `PERMITGATE_STALL_WARNING_MS` when set.
    ///
    /// Unparseable or zero values fall back to the default.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Ok(raw) = std::env::var(STALL_WARNING_ENV) {
            match parse_millis(&raw) {
                Some(stall_warning) => config.stall_warning = stall_warning,
                None => {
                    tracing::warn!(
                        var = STALL_WARNING_ENV,
                        value = %raw,
                        "Ignoring invalid stall warning threshold"
                    );
                }
            }
        }
        config
    }

    /// Zero falls back to the default.
    pub fn with_stall_warning(mut self, stall_warning: Duration) -> Self {
        self.stall_warning = if stall_warning.is_zero() {
            Self::DEFAULT_STALL_WARNING
        } else {
            stall_warning
        };
        self
    }
}

impl Default for PermitConfig {
    fn default() -> Self {
        Self {
            stall_warning: Self::DEFAULT_STALL_WARNING,
        }
    }
}

fn parse_millis(raw: &str) -> Option<Duration> {
    match raw.trim().parse::<u64>() {
        Ok(0) | Err(_) => None,
        Ok(ms) => Some(Duration::from_millis(ms)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_stall_warning() {
        assert_eq!(
            PermitConfig::default().stall_warning,
            PermitConfig::DEFAULT_STALL_WARNING
        );
    }

    #[test]
    fn parse_millis_accepts_positive_integers() {
        assert_eq!(parse_millis("250"), Some(Duration::from_millis(250)));
        assert_eq!(parse_millis(" 10 "), Some(Duration::from_millis(10)));
    }

    #[test]
    fn parse_millis_rejects_zero_and_garbage() {
        assert_eq!(parse_millis("0"), None);
        assert_eq!(parse_millis("-5"), None);
        assert_eq!(parse_millis("soon"), None);
    }

    #[test]
    fn builder_overrides_stall_warning() {
        let config = PermitConfig::default().with_stall_warning(Duration::from_millis(20));
        assert_eq!(config.stall_warning, Duration::from_millis(20));
    }

    #[test]
    fn zero_stall_warning_falls_back_to_default() {
        let config = PermitConfig::default().with_stall_warning(Duration::ZERO);
        assert_eq!(config.stall_warning, PermitConfig::DEFAULT_STALL_WARNING);
    }
}
