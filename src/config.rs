//! Configuration file support for the jury node.
//!
//! Loads optional `jury.toml` from the data directory. If no config file
//! exists, or it fails to parse, defaults are used.

use serde::Deserialize;
use std::path::Path;
use std::time::Duration;

/// Top-level configuration.
#[derive(Clone, Debug, Default, Deserialize)]
#[serde(default)]
pub struct JuryConfig {
    pub jury: JurySection,
    pub timing: TimingSection,
}

/// Protocol parameters.
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct JurySection {
    /// Signatures needed before a user-contract result is committable
    pub contract_sig_num: usize,
    /// Members an election must gather before EXEC is dispatched
    pub election_num: usize,
    /// Expected committee size for sortition; 0 uses the weight table
    pub committee_size: u64,
    /// Key files (relative to the data directory) of local accounts
    pub accounts: Vec<String>,
}

impl Default for JurySection {
    fn default() -> Self {
        JurySection {
            contract_sig_num: crate::constants::CONTRACT_SIG_NUM,
            election_num: crate::constants::CONTRACT_ELECTION_NUM,
            committee_size: 0,
            accounts: vec!["jury.key".into()],
        }
    }
}

/// Timers, in seconds or milliseconds as named.
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct TimingSection {
    pub reaper_interval_secs: u64,
    pub invalid_ttl_secs: u64,
    pub valid_ttl_secs: u64,
    pub adapter_timeout_ms: u64,
    pub election_timeout_ms: u64,
}

impl Default for TimingSection {
    fn default() -> Self {
        TimingSection {
            reaper_interval_secs: crate::constants::REAPER_INTERVAL_SECS,
            invalid_ttl_secs: crate::constants::INVALID_RECORD_TTL_SECS,
            valid_ttl_secs: crate::constants::VALID_RECORD_TTL_SECS,
            adapter_timeout_ms: crate::constants::ADAPTER_TIMEOUT_MS,
            election_timeout_ms: crate::constants::ELECTION_TIMEOUT_MS,
        }
    }
}

/// Resolved parameters handed to the request processor.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ProcessorConfig {
    pub contract_sig_num: usize,
    pub election_num: usize,
    pub committee_size: u64,
    pub reaper_interval: Duration,
    pub invalid_ttl: Duration,
    pub valid_ttl: Duration,
    pub adapter_timeout: Duration,
    pub election_timeout: Duration,
}

impl Default for ProcessorConfig {
    fn default() -> Self {
        JuryConfig::default().processor_config()
    }
}

impl JuryConfig {
    /// Load configuration from `jury.toml` in the given directory.
    /// Returns `Default` if the file doesn't exist.
    pub fn load(data_dir: &Path) -> Self {
        let config_path = data_dir.join("jury.toml");
        match std::fs::read_to_string(&config_path) {
            Ok(contents) => match toml::from_str(&contents) {
                Ok(config) => {
                    tracing::info!("Loaded config from {}", config_path.display());
                    config
                }
                Err(e) => {
                    tracing::warn!(
                        "Failed to parse {}: {}, using defaults",
                        config_path.display(),
                        e
                    );
                    Self::default()
                }
            },
            Err(_) => Self::default(),
        }
    }

    /// Processor parameters. A zero signature or election threshold is
    /// raised to 1 so a misconfigured node never commits unsigned results.
    pub fn processor_config(&self) -> ProcessorConfig {
        let t = &self.timing;
        ProcessorConfig {
            contract_sig_num: self.jury.contract_sig_num.max(1),
            election_num: self.jury.election_num.max(1),
            committee_size: self.jury.committee_size,
            reaper_interval: Duration::from_secs(t.reaper_interval_secs.max(1)),
            invalid_ttl: Duration::from_secs(t.invalid_ttl_secs),
            valid_ttl: Duration::from_secs(t.valid_ttl_secs),
            adapter_timeout: Duration::from_millis(t.adapter_timeout_ms),
            election_timeout: Duration::from_millis(t.election_timeout_ms),
        }
    }
}
