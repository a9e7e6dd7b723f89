use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::scans::coordinator::ScanSettings;

/// Server configuration loaded from environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    pub port: u16,
    pub sentry_dsn: Option<String>,
    pub environment: String,
    /// Root for checkpoints, crawled pages and expert results.
    pub data_dir: PathBuf,
    pub roster_path: PathBuf,
    pub scan: ScanSettings,
}

impl Config {
    pub fn from_env() -> Self {
        Self::from_raw_values(|key| std::env::var(key).ok())
    }

    /// Build a Config from raw string values (as they would come from env vars).
    /// Used directly in tests to avoid mutating process-global environment.
    pub fn from_raw_values(get: impl Fn(&str) -> Option<String>) -> Self {
        let value = |key: &str| get(key).filter(|s| !s.trim().is_empty());
        let defaults = ScanSettings::default();

        let port = parse_or(value("PORT"), 8081);
        let sentry_dsn = value("SENTRY_DSN");
        let environment = value("ENVIRONMENT").unwrap_or_else(|| "local".to_string());

        let data_dir = value("DEEPSCAN_DATA_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(default_data_dir);
        let roster_path = value("DEEPSCAN_ROSTER")
            .map(PathBuf::from)
            .unwrap_or_else(|| data_dir.join("roster.yaml"));

        let scan = ScanSettings {
            task_timeout: secs_or(value("DEEPSCAN_TASK_TIMEOUT_SECS"), defaults.task_timeout),
            crawl_timeout: secs_or(value("DEEPSCAN_CRAWL_TIMEOUT_SECS"), defaults.crawl_timeout),
            run_deadline: secs_or(value("DEEPSCAN_RUN_DEADLINE_SECS"), defaults.run_deadline),
            max_pages: parse_or(value("DEEPSCAN_MAX_PAGES"), defaults.max_pages).max(1),
            success_percent: parse_or(value("DEEPSCAN_SUCCESS_PERCENT"), defaults.success_percent)
                .clamp(1, 100),
            cancel_grace: value("DEEPSCAN_CANCEL_GRACE_SECS")
                .and_then(|v| v.trim().parse::<u64>().ok())
                .map(Duration::from_secs)
                .unwrap_or(defaults.cancel_grace),
            ..defaults
        };

        Config {
            port,
            sentry_dsn,
            environment,
            data_dir,
            roster_path,
            scan,
        }
    }
}

fn default_data_dir() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".deepscan")
}

fn parse_or<T: FromStr>(raw: Option<String>, default: T) -> T {
    raw.and_then(|v| v.trim().parse().ok()).unwrap_or(default)
}

/// Whole seconds, zero rejected.
fn secs_or(raw: Option<String>, default: Duration) -> Duration {
    raw.and_then(|v| v.trim().parse::<u64>().ok())
        .filter(|&s| s > 0)
        .map(Duration::from_secs)
        .unwrap_or(default)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn config(pairs: &[(&str, &str)]) -> Config {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Config::from_raw_values(|key| map.get(key).cloned())
    }

    #[test]
    fn test_config_invalid_port_uses_default() {
        assert_eq!(config(&[("PORT", "not-a-number")]).port, 8081);
    }

    #[test]
    fn test_config_valid_port() {
        assert_eq!(config(&[("PORT", "3000")]).port, 3000);
    }

    #[test]
    fn test_config_empty_sentry_dsn_is_none() {
        assert!(config(&[("SENTRY_DSN", "")]).sentry_dsn.is_none());
    }

    #[test]
    fn test_config_default_environment() {
        assert_eq!(config(&[]).environment, "local");
    }

    #[test]
    fn test_config_defaults() {
        let c = config(&[]);
        assert!(c.data_dir.ends_with(".deepscan"));
        assert_eq!(c.roster_path, c.data_dir.join("roster.yaml"));
        assert_eq!(c.scan.task_timeout, Duration::from_secs(120));
        assert_eq!(c.scan.crawl_timeout, Duration::from_secs(300));
        assert_eq!(c.scan.run_deadline, Duration::from_secs(1800));
        assert_eq!(c.scan.max_pages, 50);
        assert_eq!(c.scan.success_percent, 70);
        assert_eq!(c.scan.cancel_grace, Duration::from_secs(5));
    }

    #[test]
    fn test_config_scan_overrides() {
        let c = config(&[
            ("DEEPSCAN_DATA_DIR", "/tmp/ds"),
            ("DEEPSCAN_TASK_TIMEOUT_SECS", "30"),
            ("DEEPSCAN_RUN_DEADLINE_SECS", "600"),
            ("DEEPSCAN_MAX_PAGES", "10"),
            ("DEEPSCAN_SUCCESS_PERCENT", "80"),
            ("DEEPSCAN_CANCEL_GRACE_SECS", "0"),
        ]);
        assert_eq!(c.data_dir, PathBuf::from("/tmp/ds"));
        assert_eq!(c.roster_path, PathBuf::from("/tmp/ds/roster.yaml"));
        assert_eq!(c.scan.task_timeout, Duration::from_secs(30));
        assert_eq!(c.scan.run_deadline, Duration::from_secs(600));
        assert_eq!(c.scan.max_pages, 10);
        assert_eq!(c.scan.success_percent, 80);
        assert_eq!(c.scan.cancel_grace, Duration::ZERO);
    }

    #[test]
    fn test_config_invalid_scan_values_fall_back() {
        let c = config(&[
            ("DEEPSCAN_TASK_TIMEOUT_SECS", "0"),
            ("DEEPSCAN_CRAWL_TIMEOUT_SECS", "soon"),
            ("DEEPSCAN_SUCCESS_PERCENT", "250"),
            ("DEEPSCAN_MAX_PAGES", "0"),
        ]);
        assert_eq!(c.scan.task_timeout, Duration::from_secs(120));
        assert_eq!(c.scan.crawl_timeout, Duration::from_secs(300));
        assert_eq!(c.scan.success_percent, 100);
        assert_eq!(c.scan.max_pages, 1);
    }

    #[test]
    fn test_config_success_percent_out_of_range_clamped() {
        // Doesn't fit in a u8, falls back to the default.
        assert_eq!(config(&[("DEEPSCAN_SUCCESS_PERCENT", "900")]).scan.success_percent, 70);
        assert_eq!(config(&[("DEEPSCAN_SUCCESS_PERCENT", "0")]).scan.success_percent, 1);
    }
}
