//! Client configuration
//!
//! All options have defaults; a JSON document only needs to name the
//! options it changes. Durations use humantime notation ("10s", "5m").

use std::collections::HashSet;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::directory::fingerprint::Fingerprint;
use crate::error::{Result, TorError};
use crate::network::control::ControlSettings;

/// Longest route the circuit engine will build
pub const MAX_ROUTE_LENGTH: usize = 8;

/// Configuration for the Tor client
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TorConfig {
    /// Established idle circuits kept ready by the maintenance task
    pub min_idle_circuits: usize,

    /// Absolute floor of valid descriptors before the directory is ready
    pub min_descriptors: usize,
    /// Fraction of running routers that must have valid descriptors
    pub min_descriptors_percentage: f64,

    pub route_min_length: usize,
    pub route_max_length: usize,

    #[serde(with = "humantime_serde")]
    pub circuit_connect_timeout: Duration,
    #[serde(with = "humantime_serde")]
    pub circuit_build_timeout: Duration,
    #[serde(with = "humantime_serde")]
    pub stream_connect_timeout: Duration,
    /// How long a writer waits for SENDME credit
    #[serde(with = "humantime_serde")]
    pub stream_send_timeout: Duration,
    #[serde(with = "humantime_serde")]
    pub directory_connect_timeout: Duration,
    #[serde(with = "humantime_serde")]
    pub directory_overall_timeout: Duration,
    /// Upper bound on a single directory response
    pub directory_max_bytes: u64,

    /// Race BEGIN on several circuits and keep the first to connect
    pub aggressive_stream_building: bool,
    pub aggressive_stream_fanout: usize,

    /// Never put two routers from the same /24 on one route
    pub route_unique_class_c: bool,
    /// Never put two routers from the same country on one route
    pub route_unique_country: bool,
    /// Pick the first hop from Guard-flagged routers
    pub use_entry_guards: bool,

    /// Fingerprints (hex, optional `$`) never used in routes
    pub excluded_nodes: Vec<String>,
    /// Two-letter country codes never used in routes
    pub avoided_countries: Vec<String>,

    /// Weight of the bandwidth ranking in path selection, in [0, 1]
    pub ranking_influence_index: f32,

    pub connect_max_retries: u32,
    pub max_streams_per_circuit: usize,

    #[serde(with = "humantime_serde")]
    pub maintenance_interval: Duration,
    /// Directory servers tried per document before giving up
    pub directory_fetch_attempts: usize,
    pub descriptor_parse_workers: usize,
    pub verify_consensus_signatures: bool,

    /// Where cached directory documents live; kept in memory when unset
    pub cache_directory: Option<PathBuf>,

    /// Relay connections without circuits are closed after this long
    #[serde(with = "humantime_serde")]
    pub max_idle_connection_age: Duration,

    /// Limits applied by the control layer
    pub control: ControlSettings,
}

impl Default for TorConfig {
    fn default() -> Self {
        Self {
            min_idle_circuits: 3,
            min_descriptors: 150,
            min_descriptors_percentage: 0.1,
            route_min_length: 3,
            route_max_length: 3,
            circuit_connect_timeout: Duration::from_secs(10),
            circuit_build_timeout: Duration::from_secs(60),
            stream_connect_timeout: Duration::from_secs(20),
            stream_send_timeout: Duration::from_secs(60),
            directory_connect_timeout: Duration::from_secs(30),
            directory_overall_timeout: Duration::from_secs(120),
            directory_max_bytes: 64 * 1024 * 1024,
            aggressive_stream_building: false,
            aggressive_stream_fanout: 3,
            route_unique_class_c: true,
            route_unique_country: true,
            use_entry_guards: true,
            excluded_nodes: Vec::new(),
            avoided_countries: Vec::new(),
            ranking_influence_index: 0.9,
            connect_max_retries: 10,
            max_streams_per_circuit: 50,
            maintenance_interval: Duration::from_secs(5),
            directory_fetch_attempts: 10,
            descriptor_parse_workers: 5,
            verify_consensus_signatures: true,
            cache_directory: None,
            max_idle_connection_age: Duration::from_secs(300),
            control: ControlSettings::default(),
        }
    }
}

impl TorConfig {
    /// Parse a JSON document and validate it
    pub fn from_json(json: &str) -> Result<Self> {
        let config: TorConfig = serde_json::from_str(json)
            .map_err(|e| TorError::InvalidConfig(format!("JSON: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.route_min_length == 0 {
            return Err(TorError::InvalidConfig(
                "route_min_length must be at least 1".into(),
            ));
        }
        if self.route_min_length > self.route_max_length {
            return Err(TorError::InvalidConfig(format!(
                "route_min_length {} exceeds route_max_length {}",
                self.route_min_length, self.route_max_length
            )));
        }
        if self.route_max_length > MAX_ROUTE_LENGTH {
            return Err(TorError::InvalidConfig(format!(
                "route_max_length {} exceeds {}",
                self.route_max_length, MAX_ROUTE_LENGTH
            )));
        }
        if !(0.0..=1.0).contains(&self.min_descriptors_percentage) {
            return Err(TorError::InvalidConfig(
                "min_descriptors_percentage must be within [0, 1]".into(),
            ));
        }
        if !(0.0..=1.0).contains(&self.ranking_influence_index) {
            return Err(TorError::InvalidConfig(
                "ranking_influence_index must be within [0, 1]".into(),
            ));
        }
        if self.descriptor_parse_workers == 0 {
            return Err(TorError::InvalidConfig(
                "descriptor_parse_workers must be at least 1".into(),
            ));
        }
        if self.connect_max_retries == 0 {
            return Err(TorError::InvalidConfig(
                "connect_max_retries must be at least 1".into(),
            ));
        }
        self.excluded_fingerprints()?;
        Ok(())
    }

    /// `excluded_nodes` parsed into fingerprints
    pub fn excluded_fingerprints(&self) -> Result<HashSet<Fingerprint>> {
        self.excluded_nodes
            .iter()
            .map(|s| s.parse::<Fingerprint>())
            .collect()
    }

    /// Upper-cased `avoided_countries`
    pub fn avoided_country_codes(&self) -> HashSet<String> {
        self.avoided_countries
            .iter()
            .map(|c| c.to_ascii_uppercase())
            .collect()
    }

    /// Whether a router in `country` may be used at all
    pub fn is_country_allowed(&self, country: &str) -> bool {
        !self
            .avoided_countries
            .iter()
            .any(|c| c.eq_ignore_ascii_case(country))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = TorConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.min_idle_circuits, 3);
        assert_eq!(config.connect_max_retries, 10);
        assert!(!config.aggressive_stream_building);
    }

    #[test]
    fn test_from_json_partial() {
        let config = TorConfig::from_json(
            r#"{ "route_min_length": 2, "stream_connect_timeout": "5s",
                 "excluded_nodes": ["$0123456789ABCDEF0123456789ABCDEF01234567"] }"#,
        )
        .unwrap();
        assert_eq!(config.route_min_length, 2);
        assert_eq!(config.route_max_length, 3);
        assert_eq!(config.stream_connect_timeout, Duration::from_secs(5));
        assert_eq!(config.excluded_fingerprints().unwrap().len(), 1);
    }

    #[test]
    fn test_invalid_route_bounds() {
        let mut config = TorConfig::default();
        config.route_min_length = 4;
        config.route_max_length = 3;
        assert!(matches!(config.validate(), Err(TorError::InvalidConfig(_))));
    }

    #[test]
    fn test_invalid_excluded_node() {
        let result = TorConfig::from_json(r#"{ "excluded_nodes": ["nothex"] }"#);
        assert!(result.is_err());
    }

    #[test]
    fn test_country_filter_is_case_insensitive() {
        let mut config = TorConfig::default();
        config.avoided_countries = vec!["de".into()];
        assert!(!config.is_country_allowed("DE"));
        assert!(config.is_country_allowed("NL"));
        assert!(config.avoided_country_codes().contains("DE"));
    }
}
