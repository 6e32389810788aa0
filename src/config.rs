//! Runtime configuration for star forests.
//!
//! [`SfConfig`] is a plain serde struct with sensible defaults. It can be
//! built in code, deserialized, or read from `SF_*` environment variables
//! with [`SfConfig::from_env`].

use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::sf_error::SfError;

/// Transport used for the non-distinguished partitions.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SfBackend {
    /// Two-sided non-blocking point-to-point messages.
    #[default]
    Basic,
    /// One-sided put+signal into pre-registered remote buffers.
    /// Falls back to [`SfBackend::Basic`] when the communicator lacks
    /// one-sided support.
    Window,
}

impl FromStr for SfBackend {
    type Err = SfError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "basic" => Ok(SfBackend::Basic),
            "window" => Ok(SfBackend::Window),
            other => Err(SfError::Config(format!("unknown SF backend `{other}`"))),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SfConfig {
    pub backend: SfBackend,
    /// Order each root's gathered contributions by (rank, leaf index).
    pub rank_order: bool,
    /// Allow several leaves to share one leaf-buffer slot.
    pub allow_multi_leaves: bool,
    /// Log every Begin/End at info level.
    pub monitor: bool,
    /// Hand device buffers to the transport directly instead of staging on host.
    pub use_gpu_aware: bool,
    /// Minimum scalars in a partition before unpacking goes parallel (`rayon` feature).
    pub parallel_unpack_threshold: usize,
    /// First tag handed out by the context.
    pub base_tag: u16,
}

impl Default for SfConfig {
    fn default() -> Self {
        Self {
            backend: SfBackend::Basic,
            rank_order: false,
            allow_multi_leaves: false,
            monitor: false,
            use_gpu_aware: false,
            parallel_unpack_threshold: 4096,
            base_tag: 0x5F00,
        }
    }
}

fn parse_env<T: FromStr>(key: &str) -> Result<Option<T>, SfError> {
    match std::env::var(key) {
        Ok(raw) => raw
            .trim()
            .parse::<T>()
            .map(Some)
            .map_err(|_| SfError::Config(format!("invalid value `{raw}` for {key}"))),
        Err(std::env::VarError::NotPresent) => Ok(None),
        Err(e) => Err(SfError::Config(format!("{key}: {e}"))),
    }
}

fn parse_flag(key: &str) -> Result<Option<bool>, SfError> {
    match std::env::var(key) {
        Ok(raw) => match raw.trim().to_ascii_lowercase().as_str() {
            "1" | "true" | "yes" | "on" => Ok(Some(true)),
            "0" | "false" | "no" | "off" => Ok(Some(false)),
            _ => Err(SfError::Config(format!("invalid flag `{raw}` for {key}"))),
        },
        Err(std::env::VarError::NotPresent) => Ok(None),
        Err(e) => Err(SfError::Config(format!("{key}: {e}"))),
    }
}

impl SfConfig {
    /// Defaults overridden by any `SF_*` variables present in the environment.
    pub fn from_env() -> Result<Self, SfError> {
        let mut cfg = Self::default();
        if let Some(b) = parse_env::<SfBackend>("SF_BACKEND")? {
            cfg.backend = b;
        }
        if let Some(v) = parse_flag("SF_RANK_ORDER")? {
            cfg.rank_order = v;
        }
        if let Some(v) = parse_flag("SF_ALLOW_MULTI_LEAVES")? {
            cfg.allow_multi_leaves = v;
        }
        if let Some(v) = parse_flag("SF_MONITOR")? {
            cfg.monitor = v;
        }
        if let Some(v) = parse_flag("SF_GPU_AWARE")? {
            cfg.use_gpu_aware = v;
        }
        if let Some(v) = parse_env::<usize>("SF_PARALLEL_UNPACK_THRESHOLD")? {
            cfg.parallel_unpack_threshold = v;
        }
        if let Some(v) = parse_env::<u16>("SF_BASE_TAG")? {
            cfg.base_tag = v;
        }
        Ok(cfg)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backend_parses_case_insensitively() {
        assert_eq!("Window".parse::<SfBackend>().unwrap(), SfBackend::Window);
        assert_eq!(" basic ".parse::<SfBackend>().unwrap(), SfBackend::Basic);
        assert!(matches!("nvshmem".parse::<SfBackend>(), Err(SfError::Config(_))));
    }

    #[test]
    fn partial_json_uses_defaults() {
        let cfg: SfConfig = serde_json::from_str(r#"{"backend":"window","monitor":true}"#).unwrap();
        assert_eq!(cfg.backend, SfBackend::Window);
        assert!(cfg.monitor);
        assert_eq!(cfg.base_tag, SfConfig::default().base_tag);
    }
}
