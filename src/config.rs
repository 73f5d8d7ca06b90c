//! Scan configuration: defaults, then a JSON file, then `HOSTHAWK_*`
//! environment variables. CLI flags are applied last by the binary.

use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::dispatch::validate_limits;
use crate::error::ValidationError;
use crate::probe::BannerConfig;
use crate::trace::validate_max_hops;

pub const ENV_TIMEOUT_MS: &str = "HOSTHAWK_TIMEOUT_MS";
pub const ENV_THREADS: &str = "HOSTHAWK_THREADS";
pub const ENV_LOG_LEVEL: &str = "HOSTHAWK_LOG_LEVEL";
pub const ENV_MAX_SCAN_SECS: &str = "HOSTHAWK_MAX_SCAN_SECS";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScanConfig {
    /// Per-probe timeout in milliseconds.
    pub timeout_ms: u64,
    /// Worker count per scan phase.
    pub concurrency: usize,
    /// Wall-clock ceiling for a whole session.
    pub max_scan_duration_secs: u64,
    pub banner_timeout_ms: u64,
    pub banner_max_bytes: usize,
    pub max_hops: usize,
    pub log_level: String,
    pub enable_os_detection: bool,
    pub enable_service_detection: bool,
}

impl Default for ScanConfig {
    fn default() -> Self {
        Self {
            timeout_ms: 2000,
            concurrency: 50,
            max_scan_duration_secs: 3600,
            banner_timeout_ms: 500,
            banner_max_bytes: 1024,
            max_hops: 30,
            log_level: "info".to_string(),
            enable_os_detection: true,
            enable_service_detection: true,
        }
    }
}

impl ScanConfig {
    /// `~/.hosthawk/config.json`, if a home directory is known.
    pub fn default_path() -> Option<PathBuf> {
        env::var_os("HOME").map(|home| PathBuf::from(home).join(".hosthawk").join("config.json"))
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("failed to read config file: {}", path.display()))?;
        serde_json::from_str(&content).with_context(|| format!("invalid config file: {}", path.display()))
    }

    /// Defaults, overlaid with `path` (or the default path when it exists),
    /// overlaid with the process environment.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = match path {
            Some(p) => Self::from_file(p)?,
            None => match Self::default_path().filter(|p| p.is_file()) {
                Some(p) => {
                    debug!(path = %p.display(), "using default config file");
                    Self::from_file(&p)?
                }
                None => Self::default(),
            },
        };
        config.apply_env(|key| env::var(key).ok())?;
        Ok(config)
    }

    /// Apply `HOSTHAWK_*` overrides using `lookup` to read variables.
    pub fn apply_env<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(v) = lookup(ENV_TIMEOUT_MS) {
            self.timeout_ms = v.trim().parse().with_context(|| format!("{ENV_TIMEOUT_MS}={v}"))?;
        }
        if let Some(v) = lookup(ENV_THREADS) {
            self.concurrency = v.trim().parse().with_context(|| format!("{ENV_THREADS}={v}"))?;
        }
        if let Some(v) = lookup(ENV_MAX_SCAN_SECS) {
            self.max_scan_duration_secs = v.trim().parse().with_context(|| format!("{ENV_MAX_SCAN_SECS}={v}"))?;
        }
        if let Some(v) = lookup(ENV_LOG_LEVEL) {
            self.log_level = v.trim().to_string();
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<(), ValidationError> {
        validate_limits(self.concurrency, self.probe_timeout())?;
        validate_limits(1, self.banner_timeout())?;
        validate_max_hops(self.max_hops)?;
        Ok(())
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn banner_timeout(&self) -> Duration {
        Duration::from_millis(self.banner_timeout_ms)
    }

    pub fn max_scan_duration(&self) -> Duration {
        Duration::from_secs(self.max_scan_duration_secs)
    }

    pub fn banner(&self) -> BannerConfig {
        BannerConfig {
            timeout: self.banner_timeout(),
            max_bytes: self.banner_max_bytes.max(1),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ValidationKind;
    use std::collections::HashMap;
    use std::io::Write;

    #[test]
    fn defaults_are_valid() {
        let cfg = ScanConfig::default();
        assert!(cfg.validate().is_ok());
        assert_eq!(cfg.probe_timeout(), Duration::from_secs(2));
        assert_eq!(cfg.concurrency, 50);
    }

    #[test]
    fn partial_file_keeps_other_defaults() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, r#"{{ "concurrency": 8, "enable_os_detection": false }}"#).unwrap();
        let cfg = ScanConfig::from_file(file.path()).unwrap();
        assert_eq!(cfg.concurrency, 8);
        assert!(!cfg.enable_os_detection);
        assert_eq!(cfg.timeout_ms, 2000);
    }

    #[test]
    fn malformed_file_is_an_error() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, "{{ not json").unwrap();
        assert!(ScanConfig::from_file(file.path()).is_err());
    }

    #[test]
    fn environment_overrides_file_values() {
        let vars: HashMap<&str, &str> = [(ENV_THREADS, "12"), (ENV_TIMEOUT_MS, " 750 "), (ENV_LOG_LEVEL, "debug")]
            .into_iter()
            .collect();
        let mut cfg = ScanConfig {
            concurrency: 8,
            ..ScanConfig::default()
        };
        cfg.apply_env(|k| vars.get(k).map(|v| v.to_string())).unwrap();
        assert_eq!(cfg.concurrency, 12);
        assert_eq!(cfg.timeout_ms, 750);
        assert_eq!(cfg.log_level, "debug");
        assert_eq!(cfg.max_scan_duration_secs, 3600);
    }

    #[test]
    fn unparsable_environment_value_is_reported() {
        let mut cfg = ScanConfig::default();
        let err = cfg
            .apply_env(|k| (k == ENV_THREADS).then(|| "many".to_string()))
            .unwrap_err();
        assert!(err.to_string().contains(ENV_THREADS));
    }

    #[test]
    fn zero_values_fail_validation() {
        let cfg = ScanConfig {
            concurrency: 0,
            ..ScanConfig::default()
        };
        assert_eq!(cfg.validate().unwrap_err().kind, ValidationKind::Concurrency);
        let cfg = ScanConfig {
            timeout_ms: 0,
            ..ScanConfig::default()
        };
        assert_eq!(cfg.validate().unwrap_err().kind, ValidationKind::Timeout);
        let cfg = ScanConfig {
            max_hops: 300,
            ..ScanConfig::default()
        };
        assert_eq!(cfg.validate().unwrap_err().kind, ValidationKind::MaxHops);
    }
}
