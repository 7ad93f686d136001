//! Engine configuration and binary resolution.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Restart policy applied after unexpected engine exits.
///
/// The supervisor keeps a bounded record of crash timestamps; once
/// `max_crashes` of them fall inside `window`, the client stops restarting
/// the engine. See [`crate::crash::CrashHistory`] for the exact rule.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct CrashPolicy {
	/// How many crash timestamps are retained.
	#[serde(default = "default_max_crashes")]
	pub max_crashes: usize,
	/// Sliding window, in seconds, in which `max_crashes` crashes count as a
	/// crash loop.
	#[serde(default = "default_crash_window_secs")]
	pub window_secs: u64,
}

fn default_max_crashes() -> usize {
	5
}

fn default_crash_window_secs() -> u64 {
	180
}

impl Default for CrashPolicy {
	fn default() -> Self {
		Self {
			max_crashes: default_max_crashes(),
			window_secs: default_crash_window_secs(),
		}
	}
}

impl CrashPolicy {
	/// The sliding window as a [`Duration`].
	pub fn window(&self) -> Duration {
		Duration::from_secs(self.window_secs)
	}
}

/// Configuration for one engine client.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
	/// Directory the extension is installed in; the engine binary is resolved
	/// relative to it.
	pub install_dir: PathBuf,
	/// Extra arguments to pass to the engine.
	#[serde(default)]
	pub args: Vec<String>,
	/// Environment variables to set for the engine process.
	#[serde(default)]
	pub env: HashMap<String, String>,
	/// Per-request timeout in seconds.
	#[serde(default = "default_timeout_secs")]
	pub timeout_secs: u64,
	/// Deadline, in milliseconds, for editor-provider callouts such as
	/// default-configuration queries. On expiry the client falls back to
	/// cached data instead of blocking the editor.
	#[serde(default = "default_provider_timeout_ms")]
	pub provider_timeout_ms: u64,
	/// Minimum spacing, in milliseconds, between forwarded references
	/// progress reports.
	#[serde(default = "default_progress_interval_ms")]
	pub progress_interval_ms: u64,
	/// Initial settings snapshot sent with the handshake.
	#[serde(default)]
	pub settings: Option<Value>,
	/// Restart policy.
	#[serde(default)]
	pub crash: CrashPolicy,
}

fn default_timeout_secs() -> u64 {
	30
}

fn default_provider_timeout_ms() -> u64 {
	2000
}

fn default_progress_interval_ms() -> u64 {
	1000
}

impl EngineConfig {
	/// Create a configuration with default timeouts and policy.
	pub fn new(install_dir: impl Into<PathBuf>) -> Self {
		Self {
			install_dir: install_dir.into(),
			args: Vec::new(),
			env: HashMap::new(),
			timeout_secs: default_timeout_secs(),
			provider_timeout_ms: default_provider_timeout_ms(),
			progress_interval_ms: default_progress_interval_ms(),
			settings: None,
			crash: CrashPolicy::default(),
		}
	}

	/// Add command line arguments.
	pub fn args(mut self, args: impl IntoIterator<Item = impl Into<String>>) -> Self {
		self.args = args.into_iter().map(Into::into).collect();
		self
	}

	/// Set the per-request timeout.
	pub fn timeout(mut self, secs: u64) -> Self {
		self.timeout_secs = secs;
		self
	}

	/// Set the initial settings snapshot.
	pub fn settings(mut self, settings: Value) -> Self {
		self.settings = Some(settings);
		self
	}

	/// Per-request timeout as a [`Duration`].
	pub fn request_timeout(&self) -> Duration {
		Duration::from_secs(self.timeout_secs)
	}

	/// Provider-callout deadline as a [`Duration`].
	pub fn provider_timeout(&self) -> Duration {
		Duration::from_millis(self.provider_timeout_ms)
	}

	/// Progress throttle interval as a [`Duration`].
	pub fn progress_interval(&self) -> Duration {
		Duration::from_millis(self.progress_interval_ms)
	}
}

/// Path of the engine binary inside an installation directory.
///
/// The binary name is platform-specific; the layout under the install dir is
/// not.
pub fn engine_binary(install_dir: &Path) -> PathBuf {
	let name = if cfg!(windows) {
		"tandem-engine.exe"
	} else {
		"tandem-engine"
	};
	install_dir.join("bin").join(name)
}

/// Resolve and validate the engine binary for an installation directory.
///
/// A missing or non-executable binary makes the whole client unsupported;
/// there is nothing to retry.
pub fn locate_engine(install_dir: &Path) -> crate::Result<PathBuf> {
	let path = engine_binary(install_dir);
	let Ok(metadata) = std::fs::metadata(&path) else {
		tracing::error!(path = %path.display(), "Engine binary not found");
		return Err(crate::Error::Unsupported);
	};
	if !metadata.is_file() {
		tracing::error!(path = %path.display(), "Engine binary path is not a file");
		return Err(crate::Error::Unsupported);
	}
	#[cfg(unix)]
	{
		use std::os::unix::fs::PermissionsExt;
		if metadata.permissions().mode() & 0o111 == 0 {
			tracing::error!(path = %path.display(), "Engine binary is not executable");
			return Err(crate::Error::Unsupported);
		}
	}
	Ok(path)
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn config_builder() {
		let config = EngineConfig::new("/opt/tandem")
			.args(["--intelli-sense"])
			.timeout(60)
			.settings(serde_json::json!({"errorSquiggles": true}));

		assert_eq!(config.install_dir, PathBuf::from("/opt/tandem"));
		assert_eq!(config.args, vec!["--intelli-sense"]);
		assert_eq!(config.request_timeout(), Duration::from_secs(60));
		assert!(config.settings.is_some());
	}

	#[test]
	fn defaults_deserialize_from_empty_policy() {
		let policy: CrashPolicy = serde_json::from_str("{}").unwrap();
		assert_eq!(policy.max_crashes, 5);
		assert_eq!(policy.window(), Duration::from_secs(180));
	}

	#[cfg(unix)]
	#[test]
	fn locate_engine_rejects_missing_binary() {
		let dir = tempfile::tempdir().unwrap();
		let err = locate_engine(dir.path()).unwrap_err();
		assert!(matches!(err, crate::Error::Unsupported));
	}

	#[cfg(unix)]
	#[test]
	fn locate_engine_accepts_executable_binary() {
		use std::os::unix::fs::PermissionsExt;

		let dir = tempfile::tempdir().unwrap();
		let bin_dir = dir.path().join("bin");
		std::fs::create_dir(&bin_dir).unwrap();
		let path = bin_dir.join("tandem-engine");
		std::fs::write(&path, b"#!/bin/sh\n").unwrap();
		std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();

		assert_eq!(locate_engine(dir.path()).unwrap(), path);
	}
}
