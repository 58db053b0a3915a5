//! Configuration for ocean-sync.
//!
//! Configuration sources (highest priority first):
//! 1. Environment variables (OCEAN_SYNC_HOME, <PROVIDER>_USERNAME / _PASSWORD)
//! 2. Config file (`--config`, or .ocean-sync/config.yaml in the current
//!    directory or any parent)
//! 3. Defaults (~/.ocean-sync)
//!
//! The resolved configuration is built once in the CLI and handed to every
//! component explicitly.

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::core::dedup::{DedupSettings, MergePolicy};
use crate::core::retry::RetryPolicy;
use crate::core::state_store::StateBackendKind;

/// Providers this build knows how to talk to
pub const KNOWN_SOURCES: [&str; 4] = ["noaa", "copernicus", "argo", "ncei"];

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("no sources enabled")]
    NoSources,

    #[error("unknown source '{0}' (known: noaa, copernicus, argo, ncei)")]
    UnknownSource(String),

    #[error("source '{0}' listed twice")]
    DuplicateSource(String),

    #[error("invalid {field}: {reason}")]
    Invalid { field: &'static str, reason: String },
}

fn invalid(field: &'static str, reason: impl Into<String>) -> ConfigError {
    ConfigError::Invalid {
        field,
        reason: reason.into(),
    }
}

/// Top-level settings (matches the YAML structure)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncConfig {
    /// Enabled providers, in the order they are spawned
    #[serde(default = "default_sources")]
    pub sources: Vec<String>,

    /// Keys kept in the in-memory dedup window
    #[serde(default = "default_dedup_window_size")]
    pub dedup_window_size: usize,

    /// Items committed per cursor update
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    /// Whole-run deadline shared by all sources
    #[serde(default = "default_run_timeout")]
    pub run_timeout_seconds: u64,

    #[serde(default)]
    pub merge_policy: MergePolicy,

    /// Keep provenance of absorbed records on merged observations
    #[serde(default = "default_true")]
    pub record_lineage: bool,

    #[serde(default)]
    pub retry: RetryPolicy,

    #[serde(default)]
    pub dedup: DedupSettings,

    #[serde(default)]
    pub state: StateConfig,

    #[serde(default)]
    pub region: Region,

    #[serde(default)]
    pub noaa: NoaaConfig,

    #[serde(default)]
    pub copernicus: CopernicusConfig,

    #[serde(default)]
    pub argo: ArgoConfig,

    #[serde(default)]
    pub ncei: NceiConfig,
}

fn default_sources() -> Vec<String> {
    KNOWN_SOURCES.iter().map(|s| s.to_string()).collect()
}
fn default_dedup_window_size() -> usize {
    50_000
}
fn default_batch_size() -> usize {
    8
}
fn default_run_timeout() -> u64 {
    1800
}
fn default_true() -> bool {
    true
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            sources: default_sources(),
            dedup_window_size: default_dedup_window_size(),
            batch_size: default_batch_size(),
            run_timeout_seconds: default_run_timeout(),
            merge_policy: MergePolicy::default(),
            record_lineage: true,
            retry: RetryPolicy::default(),
            dedup: DedupSettings::default(),
            state: StateConfig::default(),
            region: Region::default(),
            noaa: NoaaConfig::default(),
            copernicus: CopernicusConfig::default(),
            argo: ArgoConfig::default(),
            ncei: NceiConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StateConfig {
    #[serde(default)]
    pub backend: StateBackendKind,
}

/// Bounding box every adapter subsets to
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Region {
    pub lat_min: f64,
    pub lat_max: f64,
    pub lon_min: f64,
    pub lon_max: f64,
}

impl Default for Region {
    fn default() -> Self {
        // Southern California Bight
        Self {
            lat_min: 32.0,
            lat_max: 35.0,
            lon_min: -120.0,
            lon_max: -115.0,
        }
    }
}

/// Settings shared by every provider block
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProviderSettings {
    /// Days fetched on the first run
    #[serde(default = "default_days_back")]
    pub days_back: u32,

    /// Days between a measurement and its availability upstream
    #[serde(default = "default_lag_days")]
    pub lag_days: u32,

    #[serde(default = "default_requests_per_second")]
    pub requests_per_second: u32,

    /// Quality assigned when the payload has no QC column
    #[serde(default)]
    pub default_quality: Option<f64>,

    #[serde(default = "default_request_timeout")]
    pub request_timeout_seconds: u64,

    /// An empty answer for a day younger than this means "not published yet"
    #[serde(default = "default_settle_days")]
    pub settle_days: u32,
}

fn default_days_back() -> u32 {
    2
}
fn default_lag_days() -> u32 {
    3
}
fn default_requests_per_second() -> u32 {
    2
}
fn default_request_timeout() -> u64 {
    30
}
fn default_settle_days() -> u32 {
    7
}

impl Default for ProviderSettings {
    fn default() -> Self {
        Self {
            days_back: default_days_back(),
            lag_days: default_lag_days(),
            requests_per_second: default_requests_per_second(),
            default_quality: None,
            request_timeout_seconds: default_request_timeout(),
            settle_days: default_settle_days(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NoaaConfig {
    #[serde(default = "default_noaa_base")]
    pub base_url: String,
    #[serde(default = "default_noaa_dataset")]
    pub dataset: String,
    #[serde(default = "default_sst_variable")]
    pub variable: String,
    /// Grid stride; MUR is 0.01 degree so 10 keeps one point per 0.1 degree
    #[serde(default = "default_stride")]
    pub stride: u32,
    #[serde(flatten)]
    pub settings: ProviderSettings,
}

fn default_noaa_base() -> String {
    "https://coastwatch.pfeg.noaa.gov/erddap".to_string()
}
fn default_noaa_dataset() -> String {
    "jplMURSST41".to_string()
}
fn default_sst_variable() -> String {
    "analysed_sst".to_string()
}
fn default_stride() -> u32 {
    10
}

impl Default for NoaaConfig {
    fn default() -> Self {
        Self {
            base_url: default_noaa_base(),
            dataset: default_noaa_dataset(),
            variable: default_sst_variable(),
            stride: default_stride(),
            settings: ProviderSettings::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CopernicusConfig {
    #[serde(default = "default_copernicus_base")]
    pub base_url: String,
    #[serde(default = "default_copernicus_dataset")]
    pub dataset: String,
    #[serde(default = "default_sst_variable")]
    pub variable: String,
    #[serde(flatten)]
    pub settings: ProviderSettings,
}

fn default_copernicus_base() -> String {
    "https://nrt.cmems-du.eu/subset".to_string()
}
fn default_copernicus_dataset() -> String {
    "METOFFICE-GLO-SST-L4-NRT-OBS-SST-V2".to_string()
}

impl Default for CopernicusConfig {
    fn default() -> Self {
        Self {
            base_url: default_copernicus_base(),
            dataset: default_copernicus_dataset(),
            variable: default_sst_variable(),
            settings: ProviderSettings {
                days_back: 1,
                lag_days: 1,
                ..ProviderSettings::default()
            },
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArgoConfig {
    #[serde(default = "default_argo_base")]
    pub base_url: String,
    #[serde(default = "default_argo_dataset")]
    pub dataset: String,
    #[serde(flatten)]
    pub settings: ProviderSettings,
}

fn default_argo_base() -> String {
    "https://erddap.ifremer.fr/erddap".to_string()
}
fn default_argo_dataset() -> String {
    "ArgoFloats".to_string()
}

impl Default for ArgoConfig {
    fn default() -> Self {
        Self {
            base_url: default_argo_base(),
            dataset: default_argo_dataset(),
            settings: ProviderSettings::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NceiConfig {
    #[serde(default = "default_ncei_base")]
    pub base_url: String,
    #[serde(default = "default_ncei_dataset")]
    pub dataset: String,
    /// GHCN-Daily station ids
    #[serde(default = "default_ncei_stations")]
    pub stations: Vec<String>,
    #[serde(default = "default_ncei_data_types")]
    pub data_types: Vec<String>,
    #[serde(flatten)]
    pub settings: ProviderSettings,
}

fn default_ncei_base() -> String {
    "https://www.ncei.noaa.gov/access/services/data/v1".to_string()
}
fn default_ncei_dataset() -> String {
    "daily-summaries".to_string()
}
fn default_ncei_stations() -> Vec<String> {
    // San Diego Lindbergh Field, Los Angeles International
    vec!["USW00023188".to_string(), "USW00023174".to_string()]
}
fn default_ncei_data_types() -> Vec<String> {
    vec!["TMAX".to_string(), "TMIN".to_string(), "PRCP".to_string()]
}

impl Default for NceiConfig {
    fn default() -> Self {
        Self {
            base_url: default_ncei_base(),
            dataset: default_ncei_dataset(),
            stations: default_ncei_stations(),
            data_types: default_ncei_data_types(),
            settings: ProviderSettings::default(),
        }
    }
}

impl SyncConfig {
    /// Parse settings from YAML text
    pub fn from_yaml(text: &str) -> Result<Self> {
        let config: Self = serde_yaml::from_str(text).context("Failed to parse configuration")?;
        config.validate()?;
        Ok(config)
    }

    /// Reject settings the orchestrator cannot run with
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.sources.is_empty() {
            return Err(ConfigError::NoSources);
        }
        let mut seen = HashSet::new();
        for source in &self.sources {
            if !KNOWN_SOURCES.contains(&source.as_str()) {
                return Err(ConfigError::UnknownSource(source.clone()));
            }
            if !seen.insert(source.as_str()) {
                return Err(ConfigError::DuplicateSource(source.clone()));
            }
        }

        if self.dedup_window_size == 0 {
            return Err(invalid("dedup_window_size", "must be at least 1"));
        }
        if self.batch_size == 0 {
            return Err(invalid("batch_size", "must be at least 1"));
        }
        if self.run_timeout_seconds == 0 {
            return Err(invalid("run_timeout_seconds", "must be at least 1"));
        }
        if self.retry.max_attempts == 0 {
            return Err(invalid("retry.max_attempts", "must be at least 1"));
        }
        if !(self.retry.backoff_multiplier >= 1.0) {
            return Err(invalid("retry.backoff_multiplier", "must be >= 1.0"));
        }
        if self.dedup.time_granularity_seconds <= 0 {
            return Err(invalid("dedup.time_granularity_seconds", "must be positive"));
        }
        if !(self.dedup.position_bucket_degrees > 0.0) {
            return Err(invalid("dedup.position_bucket_degrees", "must be positive"));
        }
        if !(self.dedup.depth_bucket_meters > 0.0) {
            return Err(invalid("dedup.depth_bucket_meters", "must be positive"));
        }

        let r = &self.region;
        if !(-90.0..=90.0).contains(&r.lat_min)
            || !(-90.0..=90.0).contains(&r.lat_max)
            || r.lat_min >= r.lat_max
        {
            return Err(invalid("region", "latitude bounds must satisfy -90 <= min < max <= 90"));
        }
        if !(-180.0..=180.0).contains(&r.lon_min)
            || !(-180.0..=180.0).contains(&r.lon_max)
            || r.lon_min >= r.lon_max
        {
            return Err(invalid("region", "longitude bounds must satisfy -180 <= min < max <= 180"));
        }

        for (name, settings) in [
            ("noaa", &self.noaa.settings),
            ("copernicus", &self.copernicus.settings),
            ("argo", &self.argo.settings),
            ("ncei", &self.ncei.settings),
        ] {
            if settings.requests_per_second == 0 {
                return Err(invalid("requests_per_second", format!("{}: must be at least 1", name)));
            }
            if settings.days_back == 0 {
                return Err(invalid("days_back", format!("{}: must be at least 1", name)));
            }
            if let Some(q) = settings.default_quality {
                if !(0.0..=1.0).contains(&q) {
                    return Err(invalid("default_quality", format!("{}: {} outside [0, 1]", name, q)));
                }
            }
        }

        if self.sources.iter().any(|s| s == "ncei") && self.ncei.stations.is_empty() {
            return Err(invalid("ncei.stations", "at least one station is required"));
        }

        Ok(())
    }

    /// Copy restricted to `only` (CLI `--sources`)
    pub fn restrict_sources(&self, only: &[String]) -> Result<Self, ConfigError> {
        let mut restricted = self.clone();
        restricted.sources = only.to_vec();
        restricted.validate()?;
        Ok(restricted)
    }
}

/// Username/password pair for providers that need it
#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

/// Resolved configuration with absolute paths
#[derive(Debug, Clone)]
pub struct ResolvedConfig {
    pub settings: SyncConfig,
    /// State, reports and database live here
    pub home: PathBuf,
    /// Path to config file (if found)
    pub config_file: Option<PathBuf>,
}

impl ResolvedConfig {
    /// Resolve from defaults only, rooted at `home`
    pub fn with_home(settings: SyncConfig, home: impl Into<PathBuf>) -> Self {
        Self {
            settings,
            home: home.into(),
            config_file: None,
        }
    }

    /// Directory of per-source cursor files
    pub fn state_dir(&self) -> PathBuf {
        self.home.join("state")
    }

    /// SQLite database holding observations (and cursors for the sqlite backend)
    pub fn database_path(&self) -> PathBuf {
        self.home.join("ocean-sync.db")
    }

    /// Directory of run reports
    pub fn runs_dir(&self) -> PathBuf {
        self.home.join("runs")
    }

    pub fn lock_path(&self) -> PathBuf {
        self.home.join("sync.lock")
    }

    /// Credentials for `source` from the environment, falling back to `<home>/.env`
    pub fn credentials(&self, source: &str) -> Option<Credentials> {
        let user_key = format!("{}_USERNAME", source.to_ascii_uppercase());
        let pass_key = format!("{}_PASSWORD", source.to_ascii_uppercase());

        let mut username = std::env::var(&user_key).ok();
        let mut password = std::env::var(&pass_key).ok();

        if username.is_none() || password.is_none() {
            if let Ok(content) = std::fs::read_to_string(self.home.join(".env")) {
                for (key, value) in parse_env_file(&content) {
                    if key == user_key && username.is_none() {
                        username = Some(value);
                    } else if key == pass_key && password.is_none() {
                        password = Some(value);
                    }
                }
            }
        }

        match (username, password) {
            (Some(username), Some(password)) if !username.is_empty() => Some(Credentials {
                username,
                password,
            }),
            _ => None,
        }
    }
}

/// KEY=VALUE lines; `#` comments and blank lines skipped
fn parse_env_file(content: &str) -> Vec<(String, String)> {
    content
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty() && !l.starts_with('#'))
        .filter_map(|l| l.split_once('='))
        .map(|(k, v)| {
            (
                k.trim().to_string(),
                v.trim().trim_matches('"').to_string(),
            )
        })
        .collect()
}

/// Find config file by searching current directory and parents
fn find_config_file() -> Option<PathBuf> {
    let mut current = std::env::current_dir().ok()?;

    loop {
        let config_path = current.join(".ocean-sync").join("config.yaml");
        if config_path.exists() {
            return Some(config_path);
        }

        if !current.pop() {
            break;
        }
    }

    None
}

/// Load and parse config file
fn load_config_file(path: &Path) -> Result<SyncConfig> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    SyncConfig::from_yaml(&content)
        .with_context(|| format!("Invalid config file: {}", path.display()))
}

/// Load configuration from all sources
pub fn load_config(explicit: Option<&Path>) -> Result<ResolvedConfig> {
    let config_file = match explicit {
        Some(path) => Some(path.to_path_buf()),
        None => find_config_file(),
    };

    let settings = match &config_file {
        Some(path) => load_config_file(path)?,
        None => {
            let settings = SyncConfig::default();
            settings.validate()?;
            settings
        }
    };

    let home = match std::env::var("OCEAN_SYNC_HOME") {
        Ok(home) => PathBuf::from(home),
        Err(_) => dirs::home_dir()
            .context("Failed to determine home directory")?
            .join(".ocean-sync"),
    };

    Ok(ResolvedConfig {
        settings,
        home,
        config_file,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::TempDir;

    #[test]
    fn test_defaults_are_valid() {
        let config = SyncConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.sources.len(), 4);
        assert_eq!(config.merge_policy, MergePolicy::QualityFirst);
        assert_eq!(config.noaa.settings.lag_days, 3);
        assert_eq!(config.copernicus.settings.days_back, 1);
    }

    #[test]
    fn test_config_file_parsing() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("config.yaml");
        let mut file = std::fs::File::create(&path).unwrap();
        writeln!(
            file,
            r#"
sources: [noaa, argo]
dedup_window_size: 100
merge_policy: recency_first
retry:
  max_attempts: 5
dedup:
  time_granularity_seconds: 86400
state:
  backend: sqlite
noaa:
  days_back: 4
  stride: 20
ncei:
  stations: [USW00093107]
"#
        )
        .unwrap();

        let config = load_config_file(&path).unwrap();
        assert_eq!(config.sources, vec!["noaa", "argo"]);
        assert_eq!(config.dedup_window_size, 100);
        assert_eq!(config.merge_policy, MergePolicy::RecencyFirst);
        assert_eq!(config.retry.max_attempts, 5);
        assert_eq!(config.retry.backoff_base_ms, 1000);
        assert_eq!(config.dedup.time_granularity_seconds, 86400);
        assert_eq!(config.state.backend, StateBackendKind::Sqlite);
        assert_eq!(config.noaa.settings.days_back, 4);
        assert_eq!(config.noaa.settings.lag_days, 3);
        assert_eq!(config.noaa.stride, 20);
        assert_eq!(config.ncei.stations, vec!["USW00093107"]);
    }

    #[test]
    fn test_validation_rejects_bad_values() {
        let unknown = SyncConfig {
            sources: vec!["noaa".into(), "nasa".into()],
            ..Default::default()
        };
        assert_eq!(
            unknown.validate(),
            Err(ConfigError::UnknownSource("nasa".into()))
        );

        let dup = SyncConfig {
            sources: vec!["argo".into(), "argo".into()],
            ..Default::default()
        };
        assert_eq!(dup.validate(), Err(ConfigError::DuplicateSource("argo".into())));

        let empty = SyncConfig {
            sources: vec![],
            ..Default::default()
        };
        assert_eq!(empty.validate(), Err(ConfigError::NoSources));

        let mut inverted = SyncConfig::default();
        inverted.region.lat_min = 40.0;
        assert!(inverted.validate().is_err());

        let zero_batch = SyncConfig {
            batch_size: 0,
            ..Default::default()
        };
        assert!(zero_batch.validate().is_err());
    }

    #[test]
    fn test_restrict_sources() {
        let config = SyncConfig::default();
        let only = config.restrict_sources(&["argo".to_string()]).unwrap();
        assert_eq!(only.sources, vec!["argo"]);
        assert!(config.restrict_sources(&["foo".to_string()]).is_err());
    }

    #[test]
    fn test_credentials_from_env_file() {
        let temp = TempDir::new().unwrap();
        std::fs::write(
            temp.path().join(".env"),
            "# provider logins\nOCEANTEST_USERNAME=diver\nOCEANTEST_PASSWORD=\"s3cret\"\n",
        )
        .unwrap();

        let resolved = ResolvedConfig::with_home(SyncConfig::default(), temp.path());
        let creds = resolved.credentials("oceantest").unwrap();
        assert_eq!(creds.username, "diver");
        assert_eq!(creds.password, "s3cret");
        assert!(!format!("{:?}", creds).contains("s3cret"));

        assert!(resolved.credentials("nobody").is_none());
    }

    #[test]
    fn test_resolved_paths() {
        let resolved = ResolvedConfig::with_home(SyncConfig::default(), "/data/ocean");
        assert_eq!(resolved.state_dir(), PathBuf::from("/data/ocean/state"));
        assert_eq!(resolved.runs_dir(), PathBuf::from("/data/ocean/runs"));
        assert_eq!(resolved.database_path(), PathBuf::from("/data/ocean/ocean-sync.db"));
    }
}
