// src/config.rs

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::{fs, path::Path, time::Duration};

/// Columns of the survey table, in sheet order.
pub const DEFAULT_COLUMNS: &[&str] = &[
    "id",
    "event_name",
    "event_url",
    "location",
    "event_date",
    "reasons",
    "comment",
    "submission_date",
    "event_prefecture",
    "event_municipality",
    "user_prefecture",
    "user_municipality",
    "generated_post",
    "reason_details",
];

pub const ENV_SPREADSHEET_ID: &str = "SURVEYSTORE_SPREADSHEET_ID";
pub const ENV_WORKSHEET: &str = "SURVEYSTORE_WORKSHEET";

/// Everything the record store needs from its environment.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct StoreConfig {
    pub spreadsheet_id: String,
    pub worksheet: String,
    #[serde(with = "serde_yaml::with::singleton_map")]
    pub credentials: CredentialSource,
    pub schema: Vec<String>,
    pub retry: RetryConfig,
    pub cache: CacheConfig,
    pub on_schema_mismatch: MismatchPolicy,
    pub api_base: String,
    pub request_timeout_secs: u64,
    /// Grid size used when the worksheet has to be created.
    pub new_sheet_rows: u32,
    pub new_sheet_cols: u32,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            spreadsheet_id: String::new(),
            worksheet: "ikitakatta_data".to_string(),
            credentials: CredentialSource::default(),
            schema: DEFAULT_COLUMNS.iter().map(|c| c.to_string()).collect(),
            retry: RetryConfig::default(),
            cache: CacheConfig::default(),
            on_schema_mismatch: MismatchPolicy::default(),
            api_base: "https://sheets.googleapis.com/v4".to_string(),
            request_timeout_secs: 30,
            new_sheet_rows: 1000,
            new_sheet_cols: 20,
        }
    }
}

/// Where the OAuth bearer token for the Sheets API comes from.
///
/// In YAML this is a single-key map, e.g. `credentials: {env: VAR}` or
/// `credentials: {service_account: /path/key.json}`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum CredentialSource {
    /// Read from the named environment variable at connect time.
    Env(String),
    /// Read from a file at connect time; surrounding whitespace is trimmed.
    File(std::path::PathBuf),
    Token(String),
    /// Google service-account JSON key; access tokens are minted from it
    /// and refreshed before they expire.
    ServiceAccount(std::path::PathBuf),
}

impl Default for CredentialSource {
    fn default() -> Self {
        CredentialSource::Env("GOOGLE_OAUTH_ACCESS_TOKEN".to_string())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct RetryConfig {
    pub base_delay_ms: u64,
    pub multiplier: f64,
    pub max_attempts: u32,
    pub max_delay_ms: Option<u64>,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            base_delay_ms: 2_000,
            multiplier: 2.0,
            max_attempts: 3,
            max_delay_ms: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct CacheConfig {
    /// How long an acquired (and schema-checked) table handle is reused.
    pub handle_ttl_secs: u64,
    /// Age limit for the record snapshot, so writes from other processes
    /// show up. `None` keeps it until one of our own mutations invalidates it.
    pub snapshot_ttl_secs: Option<u64>,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            handle_ttl_secs: 300,
            snapshot_ttl_secs: Some(300),
        }
    }
}

impl CacheConfig {
    pub fn handle_ttl(&self) -> Duration {
        Duration::from_secs(self.handle_ttl_secs)
    }

    pub fn snapshot_ttl(&self) -> Option<Duration> {
        self.snapshot_ttl_secs.map(Duration::from_secs)
    }
}

/// What to do when the header row exists but differs from the schema.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum MismatchPolicy {
    /// Clear the table and write the expected header. Data rows are lost.
    #[default]
    Wipe,
    /// Rewrite every data row under the new header, matching columns by name.
    Migrate,
    /// Leave the table alone and fail with `SchemaMismatch`.
    Reject,
}

impl StoreConfig {
    pub fn from_yaml_str(text: &str) -> Result<Self> {
        let cfg: StoreConfig = serde_yaml::from_str(text).context("parsing store config")?;
        Ok(cfg)
    }

    /// Load from a YAML file, apply env overrides, then validate.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = fs::read_to_string(path)
            .with_context(|| format!("reading config {}", path.display()))?;
        let mut cfg = Self::from_yaml_str(&text)
            .with_context(|| format!("in config file {}", path.display()))?;
        cfg.apply_env_overrides();
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn apply_env_overrides(&mut self) {
        if let Ok(id) = std::env::var(ENV_SPREADSHEET_ID) {
            if !id.trim().is_empty() {
                self.spreadsheet_id = id.trim().to_string();
            }
        }
        if let Ok(ws) = std::env::var(ENV_WORKSHEET) {
            if !ws.trim().is_empty() {
                self.worksheet = ws.trim().to_string();
            }
        }
    }

    /// Checks that don't need the network.
    pub fn validate(&self) -> Result<()> {
        if self.schema.is_empty() {
            bail!("schema must list at least one column");
        }
        if !self.schema.iter().any(|c| c == "id") {
            bail!("schema must contain an `id` column");
        }
        let mut seen = std::collections::HashSet::new();
        for col in &self.schema {
            if col.trim().is_empty() {
                bail!("schema contains an empty column name");
            }
            if !seen.insert(col.as_str()) {
                bail!("duplicate schema column `{}`", col);
            }
        }
        if self.retry.multiplier.is_nan() || self.retry.multiplier < 1.0 {
            bail!(
                "retry.multiplier must be >= 1.0, got {}",
                self.retry.multiplier
            );
        }
        if self.spreadsheet_id.trim().is_empty() {
            bail!(
                "spreadsheet_id is empty (set it in the config or via {})",
                ENV_SPREADSHEET_ID
            );
        }
        if self.worksheet.trim().is_empty() {
            bail!("worksheet title is empty");
        }
        Ok(())
    }
}
