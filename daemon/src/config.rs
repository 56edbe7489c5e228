//! Runner configuration.
//!
//! Loaded from a JSON file (`--config`), or from the `SWIFT_RUNNER_CONFIG`
//! environment variable holding the same JSON document. Every field has a
//! default, so an empty object (or no configuration at all) is valid.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;
use tracing::debug;

/// Environment variable holding the JSON configuration.
pub const CONFIG_ENV: &str = "SWIFT_RUNNER_CONFIG";

/// Fastest sentinel poll cadence; smaller configured values are raised to it.
pub const MIN_POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Top-level configuration for the runner.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Sandbox template copied into every workspace (`sandbox.sh`, `run.sh`).
    pub sandbox_dir: PathBuf,

    /// Directory under which per-job workspaces are created.
    pub workspace_root: PathBuf,

    /// Path the workspace is mounted at inside the container.
    pub mount_point: String,

    /// Docker CLI used by the health probe and, through `DOCKER`, by
    /// `sandbox.sh`.
    pub docker: String,

    /// Sentinel poll cadence, shared by the completion poller and observers.
    pub poll_interval_ms: u64,

    /// Slack on top of the job timeout before the poller gives up on the
    /// container ever writing a terminal sentinel.
    pub timeout_grace_seconds: u64,

    /// How long a log observer waits for its nonce to show up.
    pub observer_attach_seconds: u64,

    /// Container image namespaces.
    pub images: ImageConfig,

    /// Precompiled package library linked into newer toolchains.
    pub packages: PackageConfig,
}

/// Image namespaces keyed by release channel.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ImageConfig {
    /// Repository for tagged releases (`5.10`, `6.0.1`, ...).
    pub release: String,
    /// Repository for `nightly*` versions.
    pub nightly: String,
}

/// Default compiler options for toolchains that ship the package library.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PackageConfig {
    /// Oldest toolchain version (numeric comparison) that gets `options`.
    pub min_version: String,
    /// Options used when the request does not provide any.
    pub options: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            sandbox_dir: default_sandbox_dir(),
            workspace_root: std::env::temp_dir(),
            mount_point: "/TEMP".into(),
            docker: "docker".into(),
            poll_interval_ms: 200,
            timeout_grace_seconds: 2,
            observer_attach_seconds: 5,
            images: ImageConfig::default(),
            packages: PackageConfig::default(),
        }
    }
}

impl Default for ImageConfig {
    fn default() -> Self {
        Self {
            release: "swiftfiddle/swift".into(),
            nightly: "swiftlang/swift".into(),
        }
    }
}

impl Default for PackageConfig {
    fn default() -> Self {
        Self {
            min_version: "5.3".into(),
            options: "-I ./swiftfiddle.com/_Packages/.build/release/ \
                      -L ./swiftfiddle.com/_Packages/.build/release/ \
                      -l_Packages"
                .into(),
        }
    }
}

fn default_sandbox_dir() -> PathBuf {
    "sandbox".into()
}

impl Config {
    /// Load configuration.
    ///
    /// Priority: explicit file > `SWIFT_RUNNER_CONFIG` > defaults.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        if let Some(path) = path {
            let json = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read config file {}", path.display()))?;
            return Self::from_json(&json)
                .with_context(|| format!("Failed to parse config file {}", path.display()));
        }

        match std::env::var(CONFIG_ENV) {
            Ok(json) => Self::from_json(&json).context("Failed to parse SWIFT_RUNNER_CONFIG"),
            Err(_) => {
                debug!("No configuration supplied, using defaults");
                Ok(Self::default())
            }
        }
    }

    /// Parse configuration from a JSON string.
    pub fn from_json(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json).context("Failed to parse JSON")?;
        Ok(config)
    }

    /// Sentinel poll cadence, never below [`MIN_POLL_INTERVAL`].
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms).max(MIN_POLL_INTERVAL)
    }

    pub const fn timeout_grace(&self) -> Duration {
        Duration::from_secs(self.timeout_grace_seconds)
    }

    pub const fn observer_attach_window(&self) -> Duration {
        Duration::from_secs(self.observer_attach_seconds)
    }

    /// Container image for a toolchain version.
    ///
    /// `nightly*` versions come from the nightly namespace, everything else
    /// from the release namespace; the version is used verbatim as the tag.
    pub fn image_for(&self, version: &str) -> String {
        let repository = if version.starts_with("nightly") {
            &self.images.nightly
        } else {
            &self.images.release
        };
        format!("{repository}:{version}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_object_uses_defaults() {
        let config = Config::from_json("{}").unwrap();
        assert_eq!(config.sandbox_dir, PathBuf::from("sandbox"));
        assert_eq!(config.mount_point, "/TEMP");
        assert_eq!(config.docker, "docker");
        assert_eq!(config.poll_interval(), Duration::from_millis(200));
        assert_eq!(config.timeout_grace(), Duration::from_secs(2));
        assert_eq!(config.observer_attach_window(), Duration::from_secs(5));
        assert_eq!(config.packages.min_version, "5.3");
        assert!(config.packages.options.contains("-l_Packages"));
    }

    #[test]
    fn partial_override() {
        let json = r#"{
            "sandbox_dir": "/opt/runner/sandbox",
            "workspace_root": "/var/tmp/runner",
            "poll_interval_ms": 50,
            "images": { "release": "example/swift" }
        }"#;

        let config = Config::from_json(json).unwrap();
        assert_eq!(config.sandbox_dir, PathBuf::from("/opt/runner/sandbox"));
        assert_eq!(config.workspace_root, PathBuf::from("/var/tmp/runner"));
        assert_eq!(config.poll_interval(), Duration::from_millis(50));
        assert_eq!(config.images.release, "example/swift");
        // Untouched nested field keeps its default
        assert_eq!(config.images.nightly, "swiftlang/swift");
    }

    #[test]
    fn zero_poll_interval_is_floored() {
        let config = Config::from_json(r#"{"poll_interval_ms": 0}"#).unwrap();
        assert_eq!(config.poll_interval(), MIN_POLL_INTERVAL);

        let config = Config::from_json(r#"{"poll_interval_ms": 3}"#).unwrap();
        assert_eq!(config.poll_interval(), MIN_POLL_INTERVAL);
    }

    #[test]
    fn invalid_json_is_an_error() {
        assert!(Config::from_json("{ not json").is_err());
        assert!(Config::from_json(r#"{"poll_interval_ms": "fast"}"#).is_err());
    }

    #[test]
    fn load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("runner.json");
        std::fs::write(&path, r#"{"mount_point": "/work"}"#).unwrap();

        let config = Config::load(Some(&path)).unwrap();
        assert_eq!(config.mount_point, "/work");
    }

    #[test]
    fn load_missing_file_fails() {
        let result = Config::load(Some(Path::new("/nonexistent/runner.json")));
        assert!(result.is_err());
    }

    #[test]
    fn image_for_release_and_nightly() {
        let config = Config::default();
        assert_eq!(config.image_for("5.10"), "swiftfiddle/swift:5.10");
        assert_eq!(config.image_for("6.0.1"), "swiftfiddle/swift:6.0.1");
        assert_eq!(config.image_for("nightly-main"), "swiftlang/swift:nightly-main");
        assert_eq!(config.image_for("nightly-5.9"), "swiftlang/swift:nightly-5.9");
    }
}
