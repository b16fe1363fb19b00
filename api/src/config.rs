// ./api/src/config.rs
use chrono::{FixedOffset, Offset, Utc};
use std::env;
use std::fmt::Display;
use std::net::{IpAddr, Ipv4Addr};
use std::path::PathBuf;
use std::str::FromStr;
use tracing::{info, warn};

pub const DEFAULT_PORT: u16 = 3000;
pub const DEFAULT_DATA_DIR: &str = "./data";

/// Where the record collections live.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorageBackend {
    /// Process memory only, lost on exit.
    Memory,
    /// One JSON file per slot under the data directory.
    File,
}

impl FromStr for StorageBackend {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_lowercase().as_str() {
            "memory" => Ok(StorageBackend::Memory),
            "file" => Ok(StorageBackend::File),
            other => Err(format!("unknown storage backend '{other}'")),
        }
    }
}

/// Runtime settings, read once at start-up.
#[derive(Debug, Clone)]
pub struct Config {
    pub bind_addr: IpAddr,
    pub port: u16,
    pub data_dir: PathBuf,
    pub storage: StorageBackend,
    /// Offset that decides which calendar day an appointment falls on.
    pub utc_offset: FixedOffset,
}

impl Config {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Builds the config from any key lookup. Invalid values fall back to the default with a warning.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let port = parse_or_default(&lookup, "PORT", DEFAULT_PORT);
        let bind_addr = parse_or_default(&lookup, "BIND_ADDR", IpAddr::V4(Ipv4Addr::LOCALHOST));
        let storage = parse_or_default(&lookup, "DENTAL_STORAGE", StorageBackend::File);
        let data_dir = lookup("DENTAL_DATA_DIR")
            .filter(|dir| !dir.trim().is_empty())
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from(DEFAULT_DATA_DIR));

        let offset_minutes: i32 = parse_or_default(&lookup, "DENTAL_UTC_OFFSET_MINUTES", 0);
        let utc_offset = offset_minutes
            .checked_mul(60)
            .and_then(FixedOffset::east_opt)
            .unwrap_or_else(|| {
                warn!(
                    "UTC offset of {} minutes is out of range. Using UTC.",
                    offset_minutes
                );
                Utc.fix()
            });

        Self {
            bind_addr,
            port,
            data_dir,
            storage,
            utc_offset,
        }
    }
}

fn parse_or_default<T>(lookup: &impl Fn(&str) -> Option<String>, key: &str, default: T) -> T
where
    T: FromStr + Display,
    T::Err: Display,
{
    match lookup(key) {
        Some(raw) => match raw.trim().parse::<T>() {
            Ok(value) => {
                info!("Using {} from environment variable {}.", value, key);
                value
            }
            Err(e) => {
                warn!(
                    "Invalid {} value '{}' in environment variable ({}). Using default {}.",
                    key, raw, e, default
                );
                default
            }
        },
        None => {
            info!("{} environment variable not set. Using default {}.", key, default);
            default
        }
    }
}

impl std::fmt::Display for StorageBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StorageBackend::Memory => f.write_str("memory"),
            StorageBackend::File => f.write_str("file"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn config_from(pairs: &[(&str, &str)]) -> Config {
        let vars: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Config::from_lookup(|key| vars.get(key).cloned())
    }

    #[test]
    fn defaults_when_nothing_is_set() {
        let config = config_from(&[]);
        assert_eq!(config.port, DEFAULT_PORT);
        assert_eq!(config.bind_addr, IpAddr::V4(Ipv4Addr::LOCALHOST));
        assert_eq!(config.storage, StorageBackend::File);
        assert_eq!(config.data_dir, PathBuf::from(DEFAULT_DATA_DIR));
        assert_eq!(config.utc_offset.local_minus_utc(), 0);
    }

    #[test]
    fn reads_every_setting() {
        let config = config_from(&[
            ("PORT", "8080"),
            ("BIND_ADDR", "0.0.0.0"),
            ("DENTAL_STORAGE", "Memory"),
            ("DENTAL_DATA_DIR", "/var/lib/dental"),
            ("DENTAL_UTC_OFFSET_MINUTES", "-300"),
        ]);
        assert_eq!(config.port, 8080);
        assert_eq!(config.bind_addr, IpAddr::V4(Ipv4Addr::UNSPECIFIED));
        assert_eq!(config.storage, StorageBackend::Memory);
        assert_eq!(config.data_dir, PathBuf::from("/var/lib/dental"));
        assert_eq!(config.utc_offset.local_minus_utc(), -5 * 3600);
    }

    #[test]
    fn invalid_values_fall_back_to_defaults() {
        let config = config_from(&[
            ("PORT", "not-a-port"),
            ("DENTAL_STORAGE", "sqlite"),
            ("DENTAL_UTC_OFFSET_MINUTES", "100000"),
            ("DENTAL_DATA_DIR", "  "),
        ]);
        assert_eq!(config.port, DEFAULT_PORT);
        assert_eq!(config.storage, StorageBackend::File);
        assert_eq!(config.utc_offset.local_minus_utc(), 0);
        assert_eq!(config.data_dir, PathBuf::from(DEFAULT_DATA_DIR));
    }
}
