//! Connection settings for the scanner controller.
//!
//! Settings are layered: built-in defaults, then an optional JSON file, then
//! `HDSCANNER_*` environment variables. The CLI applies its flags last.
//!
//! ```json
//! { "host": "127.0.0.1", "port": 58207, "timeout_secs": 10, "fail_pending_on_device_error": false }
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use serde::Deserialize;

/// The controller only listens on loopback.
pub const DEFAULT_HOST: &str = "127.0.0.1";
pub const DEFAULT_PORT: u16 = 58207;
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);

const ENV_CONFIG: &str = "HDSCANNER_CONFIG";
const ENV_HOST: &str = "HDSCANNER_HOST";
const ENV_PORT: &str = "HDSCANNER_PORT";
const ENV_TIMEOUT: &str = "HDSCANNER_TIMEOUT_SECS";
const ENV_FAIL_ON_DEVICE_ERROR: &str = "HDSCANNER_FAIL_ON_DEVICE_ERROR";

#[derive(Debug, Clone, PartialEq)]
pub struct ScannerConfig {
    pub host: String,
    pub port: u16,
    /// Default bound for calls that await a response.
    pub timeout: Duration,
    /// Fail every pending call when the controller sends `ErrorInfo`,
    /// instead of only logging it.
    pub fail_pending_on_device_error: bool,
}

impl Default for ScannerConfig {
    fn default() -> Self {
        Self {
            host: DEFAULT_HOST.to_string(),
            port: DEFAULT_PORT,
            timeout: DEFAULT_TIMEOUT,
            fail_pending_on_device_error: false,
        }
    }
}

/// On-disk form; every field is optional and overrides the default.
#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct ConfigFile {
    host: Option<String>,
    port: Option<u16>,
    timeout_secs: Option<f64>,
    fail_pending_on_device_error: Option<bool>,
}

/// Resolve the config file location.
///
/// Resolution order:
/// 1. `$HDSCANNER_CONFIG`
/// 2. `<config dir>/hdscanner/config.json` (`~/.config` on Linux,
///    `~/Library/Application Support` on macOS)
pub fn default_config_path() -> Option<PathBuf> {
    if let Ok(path) = std::env::var(ENV_CONFIG) {
        return Some(PathBuf::from(path));
    }
    dirs::config_dir().map(|dir| dir.join("hdscanner").join("config.json"))
}

impl ScannerConfig {
    /// Defaults, overlaid with the config file (if it exists) and the
    /// environment.
    ///
    /// # Errors
    ///
    /// Returns an error if the file exists but cannot be parsed, or if an
    /// environment variable holds an invalid value.
    pub fn load() -> Result<Self> {
        let mut config = Self::default();
        if let Some(path) = default_config_path() {
            if path.exists() {
                config.merge_file(&path)?;
                tracing::debug!(path = %path.display(), "loaded scanner config");
            }
        }
        config.merge_env(|key| std::env::var(key).ok())?;
        Ok(config)
    }

    pub fn with_host(mut self, host: impl Into<String>) -> Self {
        self.host = host.into();
        self
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_fail_pending_on_device_error(mut self, enabled: bool) -> Self {
        self.fail_pending_on_device_error = enabled;
        self
    }

    /// `host:port`, for log and error messages.
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Overlay settings from a JSON config file.
    pub fn merge_file(&mut self, path: &Path) -> Result<()> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        let file: ConfigFile = serde_json::from_str(&text)
            .with_context(|| format!("Invalid config file {}", path.display()))?;

        if let Some(host) = file.host {
            self.host = host;
        }
        if let Some(port) = file.port {
            self.port = port;
        }
        if let Some(secs) = file.timeout_secs {
            self.timeout =
                parse_timeout(secs).with_context(|| format!("Invalid timeout_secs in {}", path.display()))?;
        }
        if let Some(enabled) = file.fail_pending_on_device_error {
            self.fail_pending_on_device_error = enabled;
        }
        Ok(())
    }

    /// Overlay settings from `HDSCANNER_*` variables, read through `lookup`.
    pub fn merge_env(&mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<()> {
        if let Some(host) = lookup(ENV_HOST) {
            self.host = host;
        }
        if let Some(port) = lookup(ENV_PORT) {
            self.port = port
                .trim()
                .parse()
                .with_context(|| format!("Invalid {}: {}", ENV_PORT, port))?;
        }
        if let Some(secs) = lookup(ENV_TIMEOUT) {
            let value: f64 = secs
                .trim()
                .parse()
                .with_context(|| format!("Invalid {}: {}", ENV_TIMEOUT, secs))?;
            self.timeout = parse_timeout(value).with_context(|| format!("Invalid {}", ENV_TIMEOUT))?;
        }
        if let Some(flag) = lookup(ENV_FAIL_ON_DEVICE_ERROR) {
            self.fail_pending_on_device_error = parse_flag(&flag)
                .ok_or_else(|| anyhow!("Invalid {}: {}", ENV_FAIL_ON_DEVICE_ERROR, flag))?;
        }
        Ok(())
    }
}

/// Seconds to a positive, finite `Duration`.
pub fn parse_timeout(secs: f64) -> Result<Duration> {
    if !secs.is_finite() || secs <= 0.0 {
        bail!("timeout must be a positive number of seconds, got {}", secs);
    }
    Duration::try_from_secs_f64(secs).map_err(|e| anyhow!("timeout out of range: {}", e))
}

fn parse_flag(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::collections::HashMap;

    fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key: &str| map.get(key).cloned()
    }

    /// Write a config file with a unique name and return its path.
    fn write_config(test_name: &str, contents: &str) -> PathBuf {
        let path = std::env::temp_dir().join(format!(
            "hdscanner-config-{}-{}.json",
            test_name,
            std::process::id()
        ));
        std::fs::write(&path, contents).expect("Failed to write config");
        path
    }

    #[test]
    fn test_defaults() {
        let config = ScannerConfig::default();
        assert_eq!(config.host, "127.0.0.1");
        assert_eq!(config.port, 58207);
        assert_eq!(config.timeout, Duration::from_secs(10));
        assert!(!config.fail_pending_on_device_error);
        assert_eq!(config.address(), "127.0.0.1:58207");
    }

    #[test]
    fn test_merge_env_overrides() {
        let mut config = ScannerConfig::default();
        config
            .merge_env(env(&[
                ("HDSCANNER_HOST", "10.0.0.5"),
                ("HDSCANNER_PORT", " 6000 "),
                ("HDSCANNER_TIMEOUT_SECS", "2.5"),
                ("HDSCANNER_FAIL_ON_DEVICE_ERROR", "yes"),
            ]))
            .unwrap();

        assert_eq!(
            config,
            ScannerConfig {
                host: "10.0.0.5".to_string(),
                port: 6000,
                timeout: Duration::from_millis(2500),
                fail_pending_on_device_error: true,
            }
        );
    }

    #[test]
    fn test_merge_env_rejects_invalid_values() {
        let mut config = ScannerConfig::default();
        let err = config
            .merge_env(env(&[("HDSCANNER_PORT", "70000")]))
            .unwrap_err();
        assert!(err.to_string().contains("HDSCANNER_PORT"));

        assert!(config
            .merge_env(env(&[("HDSCANNER_TIMEOUT_SECS", "-1")]))
            .is_err());
        assert!(config
            .merge_env(env(&[("HDSCANNER_FAIL_ON_DEVICE_ERROR", "maybe")]))
            .is_err());
    }

    #[test]
    fn test_merge_file() {
        let path = write_config("merge", r#"{"port": 6001, "timeout_secs": 0.25}"#);
        let mut config = ScannerConfig::default();
        config.merge_file(&path).unwrap();
        let _ = std::fs::remove_file(&path);

        assert_eq!(config.host, DEFAULT_HOST);
        assert_eq!(config.port, 6001);
        assert_eq!(config.timeout, Duration::from_millis(250));
    }

    #[test]
    fn test_merge_file_rejects_unknown_fields() {
        let path = write_config("unknown", r#"{"prot": 6001}"#);
        let mut config = ScannerConfig::default();
        let err = config.merge_file(&path).unwrap_err();
        let _ = std::fs::remove_file(&path);

        assert!(err.to_string().contains("Invalid config file"));
        assert_eq!(config, ScannerConfig::default());
    }

    #[test]
    fn test_parse_timeout() {
        assert_eq!(parse_timeout(10.0).unwrap(), Duration::from_secs(10));
        assert!(parse_timeout(0.0).is_err());
        assert!(parse_timeout(f64::NAN).is_err());
        assert!(parse_timeout(f64::INFINITY).is_err());
    }

    #[test]
    fn test_builders() {
        let config = ScannerConfig::default()
            .with_host("localhost")
            .with_port(1234)
            .with_timeout(Duration::from_millis(50))
            .with_fail_pending_on_device_error(true);
        assert_eq!(config.address(), "localhost:1234");
        assert_eq!(config.timeout, Duration::from_millis(50));
        assert!(config.fail_pending_on_device_error);
    }
}
