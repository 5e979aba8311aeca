use anyhow::Context;
use serde::Deserialize;
use std::path::Path;

#[derive(Debug, Clone, Deserialize)]
pub struct ExecConfig {
    /// Orchestrator-wide concurrency ceiling; `0` means unbounded.
    #[serde(default = "default_max_parallel")]
    pub max_parallel: usize,
    /// Cap on simultaneous SSH sessions across all callers; `0` means
    /// unbounded at the executor layer.
    #[serde(default)]
    pub max_sessions: usize,
    #[serde(default = "default_timeout_secs")]
    pub default_timeout_secs: u64,
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,
    #[serde(default)]
    pub audit: AuditConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AuditConfig {
    #[serde(default = "default_flush_interval_ms")]
    pub flush_interval_ms: u64,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
}

impl Default for ExecConfig {
    fn default() -> Self {
        Self {
            max_parallel: default_max_parallel(),
            max_sessions: 0,
            default_timeout_secs: default_timeout_secs(),
            connect_timeout_secs: default_connect_timeout_secs(),
            audit: AuditConfig::default(),
        }
    }
}

impl Default for AuditConfig {
    fn default() -> Self {
        Self {
            flush_interval_ms: default_flush_interval_ms(),
            batch_size: default_batch_size(),
        }
    }
}

fn default_max_parallel() -> usize {
    8
}

fn default_timeout_secs() -> u64 {
    30
}

fn default_connect_timeout_secs() -> u64 {
    10
}

fn default_flush_interval_ms() -> u64 {
    2000
}

fn default_batch_size() -> usize {
    20
}

pub fn load_config(path: &Path) -> anyhow::Result<ExecConfig> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read config {}", path.display()))?;
    let config: ExecConfig = toml::from_str(&raw)
        .with_context(|| format!("failed to parse config {}", path.display()))?;
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_config_gets_defaults() {
        let config: ExecConfig = toml::from_str("").unwrap();
        assert_eq!(config.max_parallel, 8);
        assert_eq!(config.max_sessions, 0);
        assert_eq!(config.default_timeout_secs, 30);
        assert_eq!(config.connect_timeout_secs, 10);
        assert_eq!(config.audit.flush_interval_ms, 2000);
        assert_eq!(config.audit.batch_size, 20);
    }

    #[test]
    fn config_overrides_apply() {
        let input = r#"
max_parallel = 32
max_sessions = 64

[audit]
batch_size = 5
"#;
        let config: ExecConfig = toml::from_str(input).unwrap();
        assert_eq!(config.max_parallel, 32);
        assert_eq!(config.max_sessions, 64);
        assert_eq!(config.audit.batch_size, 5);
        assert_eq!(config.audit.flush_interval_ms, 2000);
    }
}
