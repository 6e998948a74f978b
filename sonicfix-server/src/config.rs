//! Server configuration
//!
//! Layered resolution: compiled defaults, then the TOML config file, then
//! environment variables. The root folder itself resolves separately via
//! `sonicfix_common::config::resolve_root_folder` (CLI wins there).

use std::time::Duration;

use sonicfix_common::config::TomlConfig;

use crate::dispatch::DispatcherConfig;

/// Resolved server configuration
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    /// Upload size ceiling (default 50 MiB)
    pub max_upload_bytes: u64,
    /// Worker pool size; small because inference is accelerator-bound
    pub max_concurrent_jobs: usize,
    pub queue_capacity: usize,
    pub invoke_timeout_secs: u64,
    pub max_transient_retries: u32,
    pub retry_backoff_ms: u64,
    pub synthetic_progress_interval_ms: u64,
    /// Denominator of synthesized progress
    pub estimated_duration_secs: u64,
    /// Orphan detection threshold; tied to the maximum expected inference
    /// duration
    pub orphan_staleness_secs: u64,
    pub max_generate_duration_secs: f64,
    pub free_tier_max_duration_secs: f64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8000,
            max_upload_bytes: 50 * 1024 * 1024,
            max_concurrent_jobs: 2,
            queue_capacity: 64,
            invoke_timeout_secs: 600,
            max_transient_retries: 2,
            retry_backoff_ms: 500,
            synthetic_progress_interval_ms: 1500,
            estimated_duration_secs: 120,
            orphan_staleness_secs: 900,
            max_generate_duration_secs: 300.0,
            free_tier_max_duration_secs: 100.0,
        }
    }
}

impl ServerConfig {
    /// Resolve configuration: defaults, then TOML file, then environment
    pub fn load() -> Self {
        let mut config = Self::default();

        if let Ok(toml_config) = sonicfix_common::config::load_toml_config() {
            config.apply_toml(&toml_config);
        }
        config.apply_env();

        config
    }

    fn apply_toml(&mut self, toml: &TomlConfig) {
        if let Some(host) = &toml.host {
            self.host = host.clone();
        }
        if let Some(port) = toml.port {
            self.port = port;
        }
        if let Some(max_upload) = toml.max_upload_bytes {
            self.max_upload_bytes = max_upload;
        }
        if let Some(max_concurrent) = toml.max_concurrent_jobs {
            self.max_concurrent_jobs = max_concurrent;
        }
        if let Some(timeout) = toml.invoke_timeout_secs {
            self.invoke_timeout_secs = timeout;
        }
        if let Some(max_duration) = toml.max_generate_duration_secs {
            self.max_generate_duration_secs = max_duration;
        }
        if let Some(free_tier) = toml.free_tier_max_duration_secs {
            self.free_tier_max_duration_secs = free_tier;
        }
    }

    fn apply_env(&mut self) {
        if let Some(host) = env_string("SONICFIX_HOST") {
            self.host = host;
        }
        if let Some(port) = env_parse::<u16>("SONICFIX_PORT") {
            self.port = port;
        }
        if let Some(max_upload) = env_parse::<u64>("SONICFIX_MAX_UPLOAD_BYTES") {
            self.max_upload_bytes = max_upload;
        }
        if let Some(max_concurrent) = env_parse::<usize>("SONICFIX_MAX_CONCURRENT_JOBS") {
            self.max_concurrent_jobs = max_concurrent;
        }
        if let Some(timeout) = env_parse::<u64>("SONICFIX_INVOKE_TIMEOUT_SECS") {
            self.invoke_timeout_secs = timeout;
        }
        if let Some(staleness) = env_parse::<u64>("SONICFIX_ORPHAN_STALENESS_SECS") {
            self.orphan_staleness_secs = staleness;
        }
    }

    /// Dispatcher knobs derived from this configuration
    pub fn dispatcher_config(&self) -> DispatcherConfig {
        DispatcherConfig {
            max_concurrent: self.max_concurrent_jobs,
            queue_capacity: self.queue_capacity,
            invoke_timeout: Duration::from_secs(self.invoke_timeout_secs),
            max_transient_retries: self.max_transient_retries,
            retry_backoff: Duration::from_millis(self.retry_backoff_ms),
            synthetic_progress_interval: Duration::from_millis(
                self.synthetic_progress_interval_ms,
            ),
            estimated_duration: Duration::from_secs(self.estimated_duration_secs),
        }
    }

    pub fn orphan_staleness(&self) -> Duration {
        Duration::from_secs(self.orphan_staleness_secs)
    }

    /// Duration ceiling for generation requests
    ///
    /// Anonymous callers get the lower free-tier cap.
    pub fn generate_duration_cap(&self, authenticated: bool) -> f64 {
        if authenticated {
            self.max_generate_duration_secs
        } else {
            self.free_tier_max_duration_secs
        }
    }
}

fn env_string(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.trim().is_empty())
}

fn env_parse<T: std::str::FromStr>(name: &str) -> Option<T> {
    match std::env::var(name) {
        Ok(value) if !value.trim().is_empty() => match value.trim().parse() {
            Ok(parsed) => Some(parsed),
            Err(_) => {
                tracing::warn!("Ignoring unparseable {}={}", name, value);
                None
            }
        },
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let config = ServerConfig::default();
        assert_eq!(config.max_upload_bytes, 50 * 1024 * 1024);
        assert!(config.max_concurrent_jobs >= 1);
        assert!(config.free_tier_max_duration_secs < config.max_generate_duration_secs);
    }

    #[test]
    fn duration_cap_depends_on_identity() {
        let config = ServerConfig::default();
        assert_eq!(config.generate_duration_cap(true), 300.0);
        assert_eq!(config.generate_duration_cap(false), 100.0);
    }
}
