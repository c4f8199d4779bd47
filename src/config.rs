use color_eyre::{eyre::eyre, Result};
use serde::Deserialize;
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::time::Duration;
use url::Url;

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
  #[serde(default)]
  pub sync: SyncConfig,
  pub sources: Vec<SourceDescriptor>,
}

/// Tunables for the refresh scheduler and retry policy.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
  /// Seconds between periodic refresh ticks
  pub refresh_interval_secs: u64,
  /// Upper bound on simultaneous fetches; defaults to the number of configured keys
  pub max_concurrency: Option<usize>,
  /// Maximum number of errors kept in the status
  pub max_errors: usize,
  /// Ceiling for a single backoff delay
  pub backoff_ceiling_ms: u64,
  /// Overrides `max_retries` of every source when set
  pub max_retries_override: Option<u32>,
  /// Directory local snapshot paths are resolved against
  pub snapshot_root: PathBuf,
  /// Base URL relative remote endpoints are resolved against
  pub base_url: Option<String>,
  /// SQLite file used to persist the cache between runs
  pub cache_path: Option<PathBuf>,
  /// Disable cache persistence entirely
  pub persist: bool,
}

impl Default for SyncConfig {
  fn default() -> Self {
    Self {
      refresh_interval_secs: 300,
      max_concurrency: None,
      max_errors: 20,
      backoff_ceiling_ms: 30_000,
      max_retries_override: None,
      snapshot_root: PathBuf::from("data"),
      base_url: None,
      cache_path: None,
      persist: true,
    }
  }
}

impl SyncConfig {
  pub fn refresh_interval(&self) -> Duration {
    Duration::from_secs(self.refresh_interval_secs.max(1))
  }

  pub fn backoff_ceiling(&self) -> Duration {
    Duration::from_millis(self.backoff_ceiling_ms)
  }

  /// Retry limit for a source, honoring the runtime override.
  pub fn max_retries_for(&self, descriptor: &SourceDescriptor) -> u32 {
    self
      .max_retries_override
      .unwrap_or(descriptor.max_retries)
  }

  /// Apply a partial runtime update.
  pub fn apply(&mut self, update: &ConfigUpdate) {
    if let Some(secs) = update.refresh_interval_secs {
      self.refresh_interval_secs = secs;
    }
    if let Some(max_errors) = update.max_errors {
      self.max_errors = max_errors;
    }
    if let Some(ceiling) = update.backoff_ceiling_ms {
      self.backoff_ceiling_ms = ceiling;
    }
    if let Some(retries) = update.max_retries_override {
      self.max_retries_override = retries;
    }
  }
}

/// Partial configuration change applied while the service is running.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ConfigUpdate {
  pub refresh_interval_secs: Option<u64>,
  pub max_errors: Option<usize>,
  pub backoff_ceiling_ms: Option<u64>,
  /// `Some(None)` removes a previous override
  pub max_retries_override: Option<Option<u32>>,
}

/// Static description of one external data provider.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct SourceDescriptor {
  pub id: String,
  /// Dataset keys served by this source; defaults to the source id
  #[serde(default)]
  pub keys: Vec<String>,
  /// Path template of the pre-built snapshot, e.g. `casualties/{key}.json`
  pub local_snapshot: String,
  /// Remote endpoint template, absolute or relative to `sync.base_url`
  pub remote_endpoint: Option<String>,
  #[serde(default = "default_ttl_secs")]
  pub ttl_secs: u64,
  #[serde(default = "default_max_retries")]
  pub max_retries: u32,
  #[serde(default = "default_backoff_base_ms")]
  pub backoff_base_ms: u64,
}

/// One year
pub const MAX_TTL_SECS: u64 = 365 * 24 * 60 * 60;

fn default_ttl_secs() -> u64 {
  3600
}

fn default_max_retries() -> u32 {
  3
}

fn default_backoff_base_ms() -> u64 {
  1000
}

impl SourceDescriptor {
  /// Dataset keys, falling back to the id when none are listed.
  pub fn keys(&self) -> Vec<String> {
    if self.keys.is_empty() {
      vec![self.id.clone()]
    } else {
      self.keys.clone()
    }
  }

  /// Time-to-live as a chrono duration, saturating instead of overflowing.
  pub fn ttl(&self) -> chrono::Duration {
    i64::try_from(self.ttl_secs)
      .ok()
      .and_then(chrono::Duration::try_seconds)
      .unwrap_or(chrono::Duration::MAX)
  }
}

impl Config {
  /// Load configuration from file.
  ///
  /// Search order:
  /// 1. Explicit path if provided
  /// 2. ./datasync.yaml (current directory)
  /// 3. $XDG_CONFIG_HOME/datasync/config.yaml
  pub fn load(explicit_path: Option<&Path>) -> Result<Self> {
    let path = if let Some(p) = explicit_path {
      if p.exists() {
        Some(p.to_path_buf())
      } else {
        return Err(eyre!("Config file not found: {}", p.display()));
      }
    } else {
      Self::find_config_file()
    };

    match path {
      Some(p) => Self::load_from_path(&p),
      None => Err(eyre!(
        "No configuration file found. Create one at ~/.config/datasync/config.yaml"
      )),
    }
  }

  fn find_config_file() -> Option<PathBuf> {
    let local = PathBuf::from("datasync.yaml");
    if local.exists() {
      return Some(local);
    }

    if let Some(config_dir) = dirs::config_dir() {
      let xdg_path = config_dir.join("datasync").join("config.yaml");
      if xdg_path.exists() {
        return Some(xdg_path);
      }
    }

    None
  }

  fn load_from_path(path: &Path) -> Result<Self> {
    let contents = std::fs::read_to_string(path)
      .map_err(|e| eyre!("Failed to read config file {}: {}", path.display(), e))?;

    let config = Self::from_yaml(&contents)
      .map_err(|e| eyre!("Invalid config file {}: {}", path.display(), e))?;

    Ok(config)
  }

  pub fn from_yaml(contents: &str) -> Result<Self> {
    let config: Config =
      serde_yaml::from_str(contents).map_err(|e| eyre!("Failed to parse config: {}", e))?;
    config.validate()?;
    Ok(config)
  }

  /// Reject configurations the service cannot run with.
  pub fn validate(&self) -> Result<()> {
    if self.sources.is_empty() {
      return Err(eyre!("At least one source must be configured"));
    }

    let mut ids = BTreeSet::new();
    let mut keys = BTreeSet::new();
    for source in &self.sources {
      if source.id.trim().is_empty() {
        return Err(eyre!("Source id must not be empty"));
      }
      if !ids.insert(source.id.as_str()) {
        return Err(eyre!("Duplicate source id: {}", source.id));
      }
      if source.local_snapshot.trim().is_empty() {
        return Err(eyre!("Source {} has an empty local_snapshot", source.id));
      }
      if source.ttl_secs > MAX_TTL_SECS {
        return Err(eyre!(
          "Source {} has ttl_secs {} above the maximum of {}",
          source.id,
          source.ttl_secs,
          MAX_TTL_SECS
        ));
      }
      if matches!(&source.remote_endpoint, Some(e) if e.trim().is_empty()) {
        return Err(eyre!("Source {} has an empty remote_endpoint", source.id));
      }
      for key in source.keys() {
        if !keys.insert(key.clone()) {
          return Err(eyre!("Dataset key {} is served by more than one source", key));
        }
      }
    }

    if let Some(base) = &self.sync.base_url {
      Url::parse(base).map_err(|e| eyre!("Invalid base_url {}: {}", base, e))?;
    }

    Ok(())
  }

  /// Where the persisted cache lives unless configured explicitly.
  pub fn cache_path(&self) -> Result<PathBuf> {
    if let Some(path) = &self.sync.cache_path {
      return Ok(path.clone());
    }

    let data_dir = dirs::data_dir()
      .or_else(|| dirs::home_dir().map(|p| p.join(".local/share")))
      .ok_or_else(|| eyre!("Could not determine data directory"))?;

    Ok(data_dir.join("datasync").join("cache.db"))
  }
}
