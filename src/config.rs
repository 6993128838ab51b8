use anyhow::Context;
use std::time::Duration;

pub const ENV_WORKERS: &str = "GRADEIMPORTD_WORKERS";
pub const ENV_POLL_MS: &str = "GRADEIMPORTD_POLL_MS";
pub const ENV_STAGING_TTL_SECS: &str = "GRADEIMPORTD_STAGING_TTL_SECS";
pub const ENV_STRICT_MAPPING: &str = "GRADEIMPORTD_STRICT_MAPPING";
pub const ENV_LOG: &str = "GRADEIMPORTD_LOG";

#[derive(Debug, Clone)]
pub struct DaemonConfig {
    /// Background worker threads. Zero leaves draining to `import.runPending`.
    pub workers: usize,
    pub poll_interval: Duration,
    pub staging_ttl: Duration,
    /// Reject CSV headers that map to nothing instead of ignoring them.
    pub strict_mapping: bool,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            workers: 1,
            poll_interval: Duration::from_millis(500),
            staging_ttl: Duration::from_secs(24 * 60 * 60),
            strict_mapping: false,
        }
    }
}

impl DaemonConfig {
    pub fn from_env() -> anyhow::Result<Self> {
        Self::from_lookup(|k| std::env::var(k).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> anyhow::Result<Self> {
        let mut cfg = DaemonConfig::default();
        if let Some(v) = non_empty(lookup(ENV_WORKERS)) {
            cfg.workers = v
                .parse::<usize>()
                .with_context(|| format!("{ENV_WORKERS} must be a non-negative integer, got {v:?}"))?;
        }
        if let Some(v) = non_empty(lookup(ENV_POLL_MS)) {
            let ms = v
                .parse::<u64>()
                .with_context(|| format!("{ENV_POLL_MS} must be milliseconds, got {v:?}"))?;
            if ms == 0 {
                anyhow::bail!("{ENV_POLL_MS} must be > 0");
            }
            cfg.poll_interval = Duration::from_millis(ms);
        }
        if let Some(v) = non_empty(lookup(ENV_STAGING_TTL_SECS)) {
            let secs = v
                .parse::<u64>()
                .with_context(|| format!("{ENV_STAGING_TTL_SECS} must be seconds, got {v:?}"))?;
            cfg.staging_ttl = Duration::from_secs(secs);
        }
        if let Some(v) = non_empty(lookup(ENV_STRICT_MAPPING)) {
            cfg.strict_mapping = parse_flag(&v)
                .with_context(|| format!("{ENV_STRICT_MAPPING} must be a boolean, got {v:?}"))?;
        }
        Ok(cfg)
    }
}

fn non_empty(v: Option<String>) -> Option<String> {
    v.map(|s| s.trim().to_string()).filter(|s| !s.is_empty())
}

fn parse_flag(v: &str) -> anyhow::Result<bool> {
    match v.to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => anyhow::bail!("unrecognized flag value"),
    }
}
