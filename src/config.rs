//! Configuration for waypoint.
//!
//! Configuration sources (highest priority first):
//! 1. Environment variables (WAYPOINT_HOME, WAYPOINT_DB, WAYPOINT_PIPELINES)
//! 2. Config file (.waypoint/config.yaml)
//! 3. Defaults (~/.waypoint, ~/.waypoint/checkpoints.db, ./pipelines)
//!
//! Config file discovery:
//! - Searches current directory and parents for .waypoint/config.yaml
//! - `home` is relative to the .waypoint/ directory; other paths are
//!   relative to the project root (the directory holding .waypoint/)

use std::path::{Path, PathBuf};
use std::sync::OnceLock;

use anyhow::{Context, Result};
use serde::Deserialize;

use crate::core::{Pipeline, RetryPolicy, DEFAULT_NOTIFY_AFTER_HOURS};

/// Global cached configuration (stores Result to handle init errors)
static CONFIG: OnceLock<Result<ResolvedConfig, String>> = OnceLock::new();

/// Raw config file schema (matches YAML structure)
#[derive(Debug, Clone, Deserialize)]
pub struct ConfigFile {
    #[serde(default = "default_version")]
    pub version: String,
    #[serde(default)]
    pub paths: PathsConfig,
    #[serde(default)]
    pub retry: Option<RetryPolicy>,
    #[serde(default)]
    pub gates: Option<GatesConfig>,
}

fn default_version() -> String {
    "1.0".to_string()
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct PathsConfig {
    /// Engine state directory (relative to .waypoint/)
    pub home: Option<String>,
    /// Checkpoint database file
    pub database: Option<String>,
    /// Directory of pipeline definitions
    pub pipelines: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct GatesConfig {
    /// Hours a gate may wait before it counts as overdue
    pub notify_after_hours: Option<u64>,
}

/// Resolved configuration with absolute paths
#[derive(Debug, Clone)]
pub struct ResolvedConfig {
    /// Absolute path to waypoint home (engine state)
    pub home: PathBuf,
    /// Checkpoint database file
    pub database: PathBuf,
    /// Directory of `<name>.yaml` pipeline definitions
    pub pipelines: PathBuf,
    /// Path to config file (if found)
    pub config_file: Option<PathBuf>,
    /// Default retry policy for stages without their own
    pub retry: RetryPolicy,
    /// Gate settings
    pub gates: GateSettings,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GateSettings {
    pub notify_after_hours: u64,
}

impl Default for GateSettings {
    fn default() -> Self {
        Self {
            notify_after_hours: DEFAULT_NOTIFY_AFTER_HOURS,
        }
    }
}

impl ResolvedConfig {
    /// Path of a named pipeline definition
    pub fn pipeline_path(&self, name: &str) -> PathBuf {
        self.pipelines.join(format!("{}.yaml", name))
    }
}

/// Environment overrides, read once per load
#[derive(Debug, Clone, Default)]
struct EnvOverrides {
    home: Option<PathBuf>,
    database: Option<PathBuf>,
    pipelines: Option<PathBuf>,
}

impl EnvOverrides {
    fn from_env() -> Self {
        Self {
            home: std::env::var("WAYPOINT_HOME").ok().map(PathBuf::from),
            database: std::env::var("WAYPOINT_DB").ok().map(PathBuf::from),
            pipelines: std::env::var("WAYPOINT_PIPELINES").ok().map(PathBuf::from),
        }
    }
}

/// Find config file by searching current directory and parents
fn find_config_file() -> Option<PathBuf> {
    let mut current = std::env::current_dir().ok()?;

    loop {
        let config_path = current.join(".waypoint").join("config.yaml");
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
fn load_config_file(path: &Path) -> Result<ConfigFile> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    serde_yaml::from_str(&content)
        .with_context(|| format!("Failed to parse config file: {}", path.display()))
}

/// Resolve a path that may be relative to the config file's parent
fn resolve_path(base: &Path, path_str: &str) -> PathBuf {
    let path = PathBuf::from(path_str);
    if path.is_absolute() {
        path
    } else {
        base.join(path)
            .canonicalize()
            .unwrap_or_else(|_| base.join(path_str))
    }
}

/// Merge env, file, and defaults
fn resolve(
    file: Option<(PathBuf, ConfigFile)>,
    env: EnvOverrides,
    default_home: PathBuf,
) -> ResolvedConfig {
    let Some((config_path, config)) = file else {
        let home = env.home.unwrap_or(default_home);
        let database = env.database.unwrap_or_else(|| home.join("checkpoints.db"));
        let pipelines = env.pipelines.unwrap_or_else(|| PathBuf::from("pipelines"));

        return ResolvedConfig {
            home,
            database,
            pipelines,
            config_file: None,
            retry: RetryPolicy::default(),
            gates: GateSettings::default(),
        };
    };

    // .waypoint/ and the project root above it
    let waypoint_dir = config_path
        .parent()
        .map(Path::to_path_buf)
        .unwrap_or_else(|| PathBuf::from("."));
    let base_dir = waypoint_dir
        .parent()
        .map(Path::to_path_buf)
        .unwrap_or_else(|| PathBuf::from("."));

    let home = match (env.home, config.paths.home.as_deref()) {
        (Some(env_home), _) => env_home,
        (None, Some(home_path)) => resolve_path(&waypoint_dir, home_path),
        (None, None) => default_home,
    };

    let database = match (env.database, config.paths.database.as_deref()) {
        (Some(env_db), _) => env_db,
        (None, Some(db_path)) => resolve_path(&base_dir, db_path),
        (None, None) => home.join("checkpoints.db"),
    };

    let pipelines = match (env.pipelines, config.paths.pipelines.as_deref()) {
        (Some(env_pipelines), _) => env_pipelines,
        (None, Some(dir)) => resolve_path(&base_dir, dir),
        (None, None) => base_dir.join("pipelines"),
    };

    let gates = GateSettings {
        notify_after_hours: config
            .gates
            .as_ref()
            .and_then(|g| g.notify_after_hours)
            .unwrap_or(DEFAULT_NOTIFY_AFTER_HOURS),
    };

    ResolvedConfig {
        home,
        database,
        pipelines,
        config_file: Some(config_path),
        retry: config.retry.unwrap_or_default(),
        gates,
    }
}

/// Load configuration from all sources
fn load_config() -> Result<ResolvedConfig> {
    let default_home = dirs::home_dir()
        .context("Failed to determine home directory")?
        .join(".waypoint");

    let file = match find_config_file() {
        Some(path) => {
            let config = load_config_file(&path)?;
            Some((path, config))
        }
        None => None,
    };

    Ok(resolve(file, EnvOverrides::from_env(), default_home))
}

/// Get the global configuration (loads once, then cached)
pub fn config() -> Result<&'static ResolvedConfig> {
    let result = CONFIG.get_or_init(|| load_config().map_err(|e| e.to_string()));

    match result {
        Ok(config) => Ok(config),
        Err(e) => anyhow::bail!("{}", e),
    }
}

/// Force reload configuration (useful for testing)
pub fn reload_config() -> Result<ResolvedConfig> {
    load_config()
}

/// Get the waypoint home directory (engine state).
pub fn waypoint_home() -> Result<PathBuf> {
    Ok(config()?.home.clone())
}

/// Get the checkpoint database path
pub fn database_path() -> Result<PathBuf> {
    Ok(config()?.database.clone())
}

/// Load and validate a pipeline by name, or by path when `name` is a file
pub fn load_pipeline(name: &str) -> Result<Pipeline> {
    let direct = PathBuf::from(name);
    let path = if direct.extension().is_some() && direct.exists() {
        direct
    } else {
        config()?.pipeline_path(name)
    };

    let pipeline = Pipeline::from_file(&path)?;
    pipeline
        .validate()
        .with_context(|| format!("Invalid pipeline definition: {}", path.display()))?;
    Ok(pipeline)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::TempDir;

    fn write_config(temp: &TempDir, content: &str) -> PathBuf {
        let waypoint_dir = temp.path().join(".waypoint");
        std::fs::create_dir_all(&waypoint_dir).unwrap();

        let config_path = waypoint_dir.join("config.yaml");
        let mut file = std::fs::File::create(&config_path).unwrap();
        writeln!(file, "{}", content).unwrap();
        config_path
    }

    #[test]
    fn test_defaults_without_file() {
        let home = PathBuf::from("/home/user/.waypoint");
        let config = resolve(None, EnvOverrides::default(), home.clone());

        assert_eq!(config.home, home);
        assert_eq!(config.database, home.join("checkpoints.db"));
        assert_eq!(config.pipelines, PathBuf::from("pipelines"));
        assert_eq!(config.retry, RetryPolicy::default());
        assert_eq!(config.gates.notify_after_hours, DEFAULT_NOTIFY_AFTER_HOURS);
        assert!(config.config_file.is_none());
    }

    #[test]
    fn test_config_file_parsing() {
        let temp = TempDir::new().unwrap();
        let config_path = write_config(
            &temp,
            r#"
version: "1.0"
paths:
  home: ./
  database: data/checkpoints.db
  pipelines: pipelines
retry:
  max_retries: 5
  base_delay_ms: 500
gates:
  notify_after_hours: 12
"#,
        );

        let config = load_config_file(&config_path).unwrap();
        assert_eq!(config.version, "1.0");
        assert_eq!(config.paths.home, Some("./".to_string()));
        assert_eq!(config.paths.database, Some("data/checkpoints.db".to_string()));

        let retry = config.retry.clone().unwrap();
        assert_eq!(retry.max_retries, 5);
        assert_eq!(retry.base_delay_ms, 500);
        assert_eq!(retry.max_delay_ms, 30000);

        let resolved = resolve(
            Some((config_path, config)),
            EnvOverrides::default(),
            PathBuf::from("/unused"),
        );
        assert_eq!(resolved.gates.notify_after_hours, 12);
        assert_eq!(resolved.database, temp.path().join("data/checkpoints.db"));
        assert_eq!(resolved.pipelines, temp.path().join("pipelines"));
    }

    #[test]
    fn test_env_overrides_file() {
        let temp = TempDir::new().unwrap();
        let config_path = write_config(&temp, "paths:\n  database: data/checkpoints.db\n");
        let config = load_config_file(&config_path).unwrap();

        let env = EnvOverrides {
            database: Some(PathBuf::from("/tmp/override.db")),
            ..Default::default()
        };
        let resolved = resolve(Some((config_path, config)), env, PathBuf::from("/unused"));

        assert_eq!(resolved.database, PathBuf::from("/tmp/override.db"));
        assert_eq!(resolved.pipelines, temp.path().join("pipelines"));
    }

    #[test]
    fn test_pipeline_path() {
        let config = resolve(
            None,
            EnvOverrides {
                pipelines: Some(PathBuf::from("/srv/pipelines")),
                ..Default::default()
            },
            PathBuf::from("/home/user/.waypoint"),
        );
        assert_eq!(
            config.pipeline_path("review"),
            PathBuf::from("/srv/pipelines/review.yaml")
        );
    }

    #[test]
    fn test_resolve_relative_path() {
        let base = PathBuf::from("/home/user/project");

        assert_eq!(
            resolve_path(&base, "./subdir"),
            PathBuf::from("/home/user/project/subdir")
        );
        assert_eq!(
            resolve_path(&base, "/absolute/path"),
            PathBuf::from("/absolute/path")
        );
    }
}
