use std::path::PathBuf;
use std::time::Duration;

/// Daemon settings, read from `SLOTGUARD_*` environment variables.
/// Unset or unparsable values fall back to the defaults.
#[derive(Debug, Clone, PartialEq)]
pub struct Config {
    pub data_dir: PathBuf,
    /// JSON policy book; a missing file means built-in defaults everywhere.
    pub policy_file: PathBuf,
    pub metrics_port: Option<u16>,
    pub compact_threshold: u64,
    pub sweep_interval: Duration,
    pub unblock_batch: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("./data"),
            policy_file: PathBuf::from("./policy.json"),
            metrics_port: None,
            compact_threshold: 1000,
            sweep_interval: Duration::from_secs(5),
            unblock_batch: 500,
        }
    }
}

impl Config {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = Self::default();
        let parsed = |key: &str| lookup(key).and_then(|s| s.trim().parse::<u64>().ok());
        Self {
            data_dir: lookup("SLOTGUARD_DATA_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.data_dir),
            policy_file: lookup("SLOTGUARD_POLICY_FILE")
                .map(PathBuf::from)
                .unwrap_or(defaults.policy_file),
            metrics_port: lookup("SLOTGUARD_METRICS_PORT").and_then(|s| s.trim().parse().ok()),
            compact_threshold: parsed("SLOTGUARD_COMPACT_THRESHOLD")
                .unwrap_or(defaults.compact_threshold),
            sweep_interval: parsed("SLOTGUARD_SWEEP_INTERVAL_SECS")
                .filter(|s| *s > 0)
                .map(Duration::from_secs)
                .unwrap_or(defaults.sweep_interval),
            unblock_batch: parsed("SLOTGUARD_UNBLOCK_BATCH")
                .filter(|n| *n > 0)
                .map(|n| n as usize)
                .unwrap_or(defaults.unblock_batch),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn empty_environment_gives_defaults() {
        assert_eq!(Config::from_lookup(lookup(&[])), Config::default());
    }

    #[test]
    fn reads_every_variable() {
        let cfg = Config::from_lookup(lookup(&[
            ("SLOTGUARD_DATA_DIR", "/var/lib/slotguard"),
            ("SLOTGUARD_POLICY_FILE", "/etc/slotguard/policy.json"),
            ("SLOTGUARD_METRICS_PORT", "9100"),
            ("SLOTGUARD_COMPACT_THRESHOLD", "250"),
            ("SLOTGUARD_SWEEP_INTERVAL_SECS", "30"),
            ("SLOTGUARD_UNBLOCK_BATCH", "50"),
        ]));
        assert_eq!(cfg.data_dir, PathBuf::from("/var/lib/slotguard"));
        assert_eq!(cfg.policy_file, PathBuf::from("/etc/slotguard/policy.json"));
        assert_eq!(cfg.metrics_port, Some(9100));
        assert_eq!(cfg.compact_threshold, 250);
        assert_eq!(cfg.sweep_interval, Duration::from_secs(30));
        assert_eq!(cfg.unblock_batch, 50);
    }

    #[test]
    fn garbage_and_zero_fall_back() {
        let cfg = Config::from_lookup(lookup(&[
            ("SLOTGUARD_METRICS_PORT", "not-a-port"),
            ("SLOTGUARD_SWEEP_INTERVAL_SECS", "0"),
            ("SLOTGUARD_UNBLOCK_BATCH", "-3"),
        ]));
        assert_eq!(cfg.metrics_port, None);
        assert_eq!(cfg.sweep_interval, Duration::from_secs(5));
        assert_eq!(cfg.unblock_batch, 500);
    }
}
