use std::fmt;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

/// Default config file template with comments, used by `config init`.
const DEFAULT_CONFIG_TEMPLATE: &str = r#"# devbridge configuration file
# See: https://github.com/Nunley-Media-Group/devbridge

# Relay bind address and protocol endpoints
# [relay]
# host = "127.0.0.1"
# port = 9333
# bridge_path = "/extension"
# client_path = "/client"
# command_timeout_ms = 30000
# target_wait_timeout_ms = 5000
# grace_period_ms = 500

# Per-session page limits
# [limits]
# tab_limit = 5
# warn_threshold = 3

# Durable page-mapping persistence
# [persistence]
# path = "/path/to/pages.json"
# max_age_days = 7
# debounce_ms = 500

# Structured logging
# [logging]
# level = "info"
# format = "pretty"         # pretty, json
"#;

// ---------------------------------------------------------------------------
// Config structs (parsed from TOML)
// ---------------------------------------------------------------------------

/// Represents the parsed TOML config file. All fields optional.
#[derive(Debug, Default, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ConfigFile {
    pub relay: RelayConfig,
    pub limits: LimitsConfig,
    pub persistence: PersistenceConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Default, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct RelayConfig {
    pub host: Option<String>,
    pub port: Option<u16>,
    pub bridge_path: Option<String>,
    pub client_path: Option<String>,
    pub command_timeout_ms: Option<u64>,
    pub target_wait_timeout_ms: Option<u64>,
    pub grace_period_ms: Option<u64>,
}

#[derive(Debug, Default, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct LimitsConfig {
    pub tab_limit: Option<u32>,
    pub warn_threshold: Option<u32>,
}

#[derive(Debug, Default, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct PersistenceConfig {
    pub path: Option<String>,
    pub max_age_days: Option<u64>,
    pub debounce_ms: Option<u64>,
}

#[derive(Debug, Default, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: Option<String>,
    pub format: Option<String>,
}

// ---------------------------------------------------------------------------
// Resolved config (all defaults filled in)
// ---------------------------------------------------------------------------

/// Fully resolved configuration with all defaults filled in.
#[derive(Debug, Serialize)]
pub struct ResolvedConfig {
    pub config_path: Option<PathBuf>,
    pub relay: ResolvedRelay,
    pub limits: ResolvedLimits,
    pub persistence: ResolvedPersistence,
    pub logging: ResolvedLogging,
}

#[derive(Debug, Serialize)]
pub struct ResolvedRelay {
    pub host: String,
    pub port: u16,
    pub bridge_path: String,
    pub client_path: String,
    pub command_timeout_ms: u64,
    pub target_wait_timeout_ms: u64,
    pub grace_period_ms: u64,
}

#[derive(Debug, Serialize)]
pub struct ResolvedLimits {
    pub tab_limit: u32,
    pub warn_threshold: u32,
}

#[derive(Debug, Serialize)]
pub struct ResolvedPersistence {
    pub path: Option<PathBuf>,
    pub max_age_days: u64,
    pub debounce_ms: u64,
}

#[derive(Debug, Serialize)]
pub struct ResolvedLogging {
    pub level: String,
    pub format: String,
}

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

#[derive(Debug)]
pub enum ConfigError {
    /// I/O error reading/writing config file.
    Io(std::io::Error),
    /// Config file already exists (for `config init`).
    AlreadyExists(PathBuf),
    /// Could not determine config directory.
    NoConfigDir,
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Io(e) => write!(f, "config file error: {e}"),
            Self::AlreadyExists(p) => {
                write!(f, "config file already exists: {}", p.display())
            }
            Self::NoConfigDir => write!(f, "could not determine config directory"),
        }
    }
}

impl std::error::Error for ConfigError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<std::io::Error> for ConfigError {
    fn from(e: std::io::Error) -> Self {
        Self::Io(e)
    }
}

impl From<ConfigError> for crate::error::AppError {
    fn from(e: ConfigError) -> Self {
        use crate::error::ExitCode;
        Self::new(e.to_string(), ExitCode::ConfigError)
    }
}

// ---------------------------------------------------------------------------
// Config file search
// ---------------------------------------------------------------------------

/// Find the first config file that exists, checking locations in priority order.
///
/// Search order:
/// 1. `explicit_path` (from `--config` flag)
/// 2. `$DEVBRIDGE_CONFIG` environment variable
/// 3. `./.devbridge.toml` (project-local)
/// 4. `<config_dir>/devbridge/config.toml` (XDG / platform config dir)
/// 5. `~/.devbridge.toml` (home directory fallback)
#[must_use]
pub fn find_config_file(explicit_path: Option<&Path>) -> Option<PathBuf> {
    find_config_file_with(explicit_path, std::env::var("DEVBRIDGE_CONFIG").ok())
}

/// Testable variant of [`find_config_file`] that accepts an explicit env value.
#[must_use]
pub fn find_config_file_with(
    explicit_path: Option<&Path>,
    env_config: Option<String>,
) -> Option<PathBuf> {
    if let Some(p) = explicit_path {
        if p.exists() {
            return Some(p.to_path_buf());
        }
    }

    if let Some(env_path) = env_config {
        let p = PathBuf::from(env_path);
        if p.exists() {
            return Some(p);
        }
    }

    let local = PathBuf::from(".devbridge.toml");
    if local.exists() {
        return Some(local);
    }

    if let Some(config_dir) = dirs::config_dir() {
        let xdg = config_dir.join("devbridge").join("config.toml");
        if xdg.exists() {
            return Some(xdg);
        }
    }

    if let Some(home) = dirs::home_dir() {
        let home_config = home.join(".devbridge.toml");
        if home_config.exists() {
            return Some(home_config);
        }
    }

    None
}

// ---------------------------------------------------------------------------
// Config loading
// ---------------------------------------------------------------------------

/// Load and parse a config file. Returns the file path (if found) and the parsed config.
///
/// On parse errors, prints a warning to stderr and returns `ConfigFile::default()`.
#[must_use]
pub fn load_config(explicit_path: Option<&Path>) -> (Option<PathBuf>, ConfigFile) {
    let path = find_config_file(explicit_path);
    match &path {
        Some(p) => {
            let config = load_config_from(p);
            (path, config)
        }
        None => (None, ConfigFile::default()),
    }
}

/// Load and parse a config file from a specific path.
///
/// On parse errors, prints a warning to stderr and returns `ConfigFile::default()`.
#[must_use]
pub fn load_config_from(path: &Path) -> ConfigFile {
    let contents = match std::fs::read_to_string(path) {
        Ok(c) => c,
        Err(e) => {
            eprintln!(
                "warning: could not read config file {}: {e}",
                path.display()
            );
            return ConfigFile::default();
        }
    };

    parse_config(&contents, path)
}

/// Parse TOML content into a `ConfigFile`.
///
/// Uses a two-pass strategy: first tries strict parsing (to detect unknown keys),
/// then falls back to lenient parsing if strict fails due to unknown fields.
#[must_use]
pub fn parse_config(contents: &str, path: &Path) -> ConfigFile {
    match toml::from_str::<StrictConfigFile>(contents) {
        Ok(strict) => strict.into(),
        Err(strict_err) => match toml::from_str::<ConfigFile>(contents) {
            Ok(config) => {
                eprintln!(
                    "warning: unknown keys in config file {}: {strict_err}",
                    path.display()
                );
                config
            }
            Err(parse_err) => {
                eprintln!(
                    "warning: could not parse config file {}: {parse_err}",
                    path.display()
                );
                ConfigFile::default()
            }
        },
    }
}

/// Strict variant used for the first-pass parse to detect unknown keys.
#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct StrictConfigFile {
    #[serde(default)]
    relay: StrictRelayConfig,
    #[serde(default)]
    limits: StrictLimitsConfig,
    #[serde(default)]
    persistence: StrictPersistenceConfig,
    #[serde(default)]
    logging: StrictLoggingConfig,
}

#[derive(Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct StrictRelayConfig {
    host: Option<String>,
    port: Option<u16>,
    bridge_path: Option<String>,
    client_path: Option<String>,
    command_timeout_ms: Option<u64>,
    target_wait_timeout_ms: Option<u64>,
    grace_period_ms: Option<u64>,
}

#[derive(Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct StrictLimitsConfig {
    tab_limit: Option<u32>,
    warn_threshold: Option<u32>,
}

#[derive(Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct StrictPersistenceConfig {
    path: Option<String>,
    max_age_days: Option<u64>,
    debounce_ms: Option<u64>,
}

#[derive(Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct StrictLoggingConfig {
    level: Option<String>,
    format: Option<String>,
}

impl From<StrictConfigFile> for ConfigFile {
    fn from(s: StrictConfigFile) -> Self {
        Self {
            relay: RelayConfig {
                host: s.relay.host,
                port: s.relay.port,
                bridge_path: s.relay.bridge_path,
                client_path: s.relay.client_path,
                command_timeout_ms: s.relay.command_timeout_ms,
                target_wait_timeout_ms: s.relay.target_wait_timeout_ms,
                grace_period_ms: s.relay.grace_period_ms,
            },
            limits: LimitsConfig {
                tab_limit: s.limits.tab_limit,
                warn_threshold: s.limits.warn_threshold,
            },
            persistence: PersistenceConfig {
                path: s.persistence.path,
                max_age_days: s.persistence.max_age_days,
                debounce_ms: s.persistence.debounce_ms,
            },
            logging: LoggingConfig {
                level: s.logging.level,
                format: s.logging.format,
            },
        }
    }
}

// ---------------------------------------------------------------------------
// Config resolution
// ---------------------------------------------------------------------------

const DEFAULT_PORT: u16 = 9333;
const DEFAULT_COMMAND_TIMEOUT_MS: u64 = 30_000;
const DEFAULT_TARGET_WAIT_TIMEOUT_MS: u64 = 5_000;
const DEFAULT_GRACE_PERIOD_MS: u64 = 500;
const DEFAULT_TAB_LIMIT: u32 = 5;
const DEFAULT_WARN_THRESHOLD: u32 = 3;
const DEFAULT_MAX_AGE_DAYS: u64 = 7;
const DEFAULT_DEBOUNCE_MS: u64 = 500;

/// Resolve a config file into a fully-populated `ResolvedConfig` with all defaults.
#[must_use]
pub fn resolve_config(file: &ConfigFile, config_path: Option<PathBuf>) -> ResolvedConfig {
    let port = file.relay.port.unwrap_or(DEFAULT_PORT);
    let port = if port == 0 { DEFAULT_PORT } else { port };

    ResolvedConfig {
        config_path,
        relay: ResolvedRelay {
            host: file
                .relay
                .host
                .clone()
                .unwrap_or_else(|| "127.0.0.1".to_string()),
            port,
            bridge_path: file
                .relay
                .bridge_path
                .clone()
                .unwrap_or_else(|| "/extension".to_string()),
            client_path: file
                .relay
                .client_path
                .clone()
                .unwrap_or_else(|| "/client".to_string()),
            command_timeout_ms: file
                .relay
                .command_timeout_ms
                .unwrap_or(DEFAULT_COMMAND_TIMEOUT_MS),
            target_wait_timeout_ms: file
                .relay
                .target_wait_timeout_ms
                .unwrap_or(DEFAULT_TARGET_WAIT_TIMEOUT_MS),
            grace_period_ms: file.relay.grace_period_ms.unwrap_or(DEFAULT_GRACE_PERIOD_MS),
        },
        limits: ResolvedLimits {
            tab_limit: file.limits.tab_limit.unwrap_or(DEFAULT_TAB_LIMIT),
            warn_threshold: file
                .limits
                .warn_threshold
                .unwrap_or(DEFAULT_WARN_THRESHOLD),
        },
        persistence: ResolvedPersistence {
            path: file.persistence.path.clone().map(PathBuf::from),
            max_age_days: file
                .persistence
                .max_age_days
                .unwrap_or(DEFAULT_MAX_AGE_DAYS),
            debounce_ms: file.persistence.debounce_ms.unwrap_or(DEFAULT_DEBOUNCE_MS),
        },
        logging: ResolvedLogging {
            level: file
                .logging
                .level
                .clone()
                .unwrap_or_else(|| "info".to_string()),
            format: file
                .logging
                .format
                .clone()
                .unwrap_or_else(|| "pretty".to_string()),
        },
    }
}

impl ResolvedPersistence {
    /// Where the persisted page-mapping file lives: the configured override,
    /// or `<config_dir>/devbridge/pages.json`.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::NoConfigDir` if no override is set and the
    /// platform config directory cannot be determined.
    pub fn resolved_path(&self) -> Result<PathBuf, ConfigError> {
        if let Some(p) = &self.path {
            return Ok(p.clone());
        }
        dirs::config_dir()
            .map(|d| d.join("devbridge").join("pages.json"))
            .ok_or(ConfigError::NoConfigDir)
    }
}

// ---------------------------------------------------------------------------
// Config init
// ---------------------------------------------------------------------------

/// Default path for `config init`: `<config_dir>/devbridge/config.toml`.
///
/// # Errors
///
/// Returns `ConfigError::NoConfigDir` if the platform config directory cannot be determined.
pub fn default_init_path() -> Result<PathBuf, ConfigError> {
    dirs::config_dir()
        .map(|d| d.join("devbridge").join("config.toml"))
        .ok_or(ConfigError::NoConfigDir)
}

/// Create a default config file at the given path (or the default XDG path).
///
/// # Errors
///
/// - `ConfigError::AlreadyExists` if the file already exists
/// - `ConfigError::Io` on I/O failure
/// - `ConfigError::NoConfigDir` if no target path and platform config dir unknown
pub fn init_config(target_path: Option<&Path>) -> Result<PathBuf, ConfigError> {
    let path = match target_path {
        Some(p) => p.to_path_buf(),
        None => default_init_path()?,
    };

    init_config_to(&path)
}

/// Testable variant of [`init_config`] that writes to an explicit path.
///
/// # Errors
///
/// - `ConfigError::AlreadyExists` if the file already exists
/// - `ConfigError::Io` on I/O failure
pub fn init_config_to(path: &Path) -> Result<PathBuf, ConfigError> {
    if path.exists() {
        return Err(ConfigError::AlreadyExists(path.to_path_buf()));
    }

    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }

    std::fs::write(path, DEFAULT_CONFIG_TEMPLATE)?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))?;
    }

    Ok(path.to_path_buf())
}

// ---------------------------------------------------------------------------
// Unit tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_valid_full_config() {
        let toml = r#"
[relay]
host = "10.0.0.1"
port = 9444
bridge_path = "/bridge"
client_path = "/driver"
command_timeout_ms = 60000
target_wait_timeout_ms = 10000
grace_period_ms = 1000

[limits]
tab_limit = 10
warn_threshold = 8

[persistence]
path = "/tmp/pages.json"
max_age_days = 14
debounce_ms = 250

[logging]
level = "debug"
format = "json"
"#;
        let config = parse_config(toml, Path::new("test.toml"));
        assert_eq!(config.relay.host.as_deref(), Some("10.0.0.1"));
        assert_eq!(config.relay.port, Some(9444));
        assert_eq!(config.relay.bridge_path.as_deref(), Some("/bridge"));
        assert_eq!(config.limits.tab_limit, Some(10));
        assert_eq!(config.persistence.max_age_days, Some(14));
        assert_eq!(config.logging.format.as_deref(), Some("json"));
    }

    #[test]
    fn parse_empty_config() {
        let config = parse_config("", Path::new("test.toml"));
        assert!(config.relay.host.is_none());
        assert!(config.relay.port.is_none());
        assert!(config.limits.tab_limit.is_none());
    }

    #[test]
    fn parse_partial_config() {
        let toml = "[relay]\nport = 9444\n";
        let config = parse_config(toml, Path::new("test.toml"));
        assert_eq!(config.relay.port, Some(9444));
        assert!(config.relay.host.is_none());
    }

    #[test]
    fn parse_invalid_toml_returns_default() {
        let config = parse_config("this is not valid toml [[[", Path::new("test.toml"));
        assert!(config.relay.host.is_none());
        assert!(config.relay.port.is_none());
    }

    #[test]
    fn parse_unknown_keys_warns_but_keeps_known() {
        let toml = r#"
[relay]
port = 9444
unknown_key = "hello"
"#;
        let config = parse_config(toml, Path::new("test.toml"));
        assert_eq!(config.relay.port, Some(9444));
    }

    #[test]
    fn resolve_defaults() {
        let config = ConfigFile::default();
        let resolved = resolve_config(&config, None);
        assert_eq!(resolved.relay.host, "127.0.0.1");
        assert_eq!(resolved.relay.port, DEFAULT_PORT);
        assert_eq!(resolved.relay.command_timeout_ms, DEFAULT_COMMAND_TIMEOUT_MS);
        assert_eq!(
            resolved.relay.target_wait_timeout_ms,
            DEFAULT_TARGET_WAIT_TIMEOUT_MS
        );
        assert_eq!(resolved.relay.grace_period_ms, DEFAULT_GRACE_PERIOD_MS);
        assert_eq!(resolved.limits.tab_limit, DEFAULT_TAB_LIMIT);
        assert_eq!(resolved.limits.warn_threshold, DEFAULT_WARN_THRESHOLD);
        assert_eq!(resolved.persistence.max_age_days, DEFAULT_MAX_AGE_DAYS);
        assert_eq!(resolved.persistence.debounce_ms, DEFAULT_DEBOUNCE_MS);
        assert_eq!(resolved.logging.level, "info");
        assert_eq!(resolved.logging.format, "pretty");
        assert!(resolved.config_path.is_none());
    }

    #[test]
    fn resolve_overrides() {
        let config = ConfigFile {
            relay: RelayConfig {
                host: Some("10.0.0.1".into()),
                port: Some(9555),
                bridge_path: Some("/bridge".into()),
                client_path: Some("/driver".into()),
                command_timeout_ms: Some(1000),
                target_wait_timeout_ms: Some(2000),
                grace_period_ms: Some(100),
            },
            limits: LimitsConfig {
                tab_limit: Some(20),
                warn_threshold: Some(15),
            },
            persistence: PersistenceConfig {
                path: Some("/tmp/custom.json".into()),
                max_age_days: Some(1),
                debounce_ms: Some(50),
            },
            logging: LoggingConfig {
                level: Some("trace".into()),
                format: Some("json".into()),
            },
        };
        let path = PathBuf::from("/tmp/test.toml");
        let resolved = resolve_config(&config, Some(path.clone()));
        assert_eq!(resolved.relay.host, "10.0.0.1");
        assert_eq!(resolved.relay.port, 9555);
        assert_eq!(resolved.limits.tab_limit, 20);
        assert_eq!(resolved.persistence.max_age_days, 1);
        assert_eq!(resolved.logging.format, "json");
        assert_eq!(resolved.config_path, Some(path));
    }

    #[test]
    fn resolve_port_zero_uses_default() {
        let config = ConfigFile {
            relay: RelayConfig {
                port: Some(0),
                ..RelayConfig::default()
            },
            ..ConfigFile::default()
        };
        let resolved = resolve_config(&config, None);
        assert_eq!(resolved.relay.port, DEFAULT_PORT);
    }

    #[test]
    fn persistence_path_override_wins() {
        let resolved = ResolvedPersistence {
            path: Some(PathBuf::from("/tmp/explicit.json")),
            max_age_days: 7,
            debounce_ms: 500,
        };
        assert_eq!(
            resolved.resolved_path().unwrap(),
            PathBuf::from("/tmp/explicit.json")
        );
    }

    #[test]
    fn init_config_creates_file() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("config.toml");

        let result = init_config_to(&path);
        assert!(result.is_ok());
        assert!(path.exists());

        let contents = std::fs::read_to_string(&path).unwrap();
        assert!(contents.contains("[relay]"));
    }

    #[test]
    fn init_config_refuses_overwrite() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "existing").unwrap();

        let result = init_config_to(&path);
        assert!(matches!(result, Err(ConfigError::AlreadyExists(_))));

        let contents = std::fs::read_to_string(&path).unwrap();
        assert_eq!(contents, "existing");
    }

    #[test]
    fn find_config_with_explicit_path() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("my-config.toml");
        std::fs::write(&path, "").unwrap();

        let found = find_config_file_with(Some(&path), None);
        assert_eq!(found, Some(path.clone()));
    }

    #[test]
    fn find_config_with_env_var() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("env-config.toml");
        std::fs::write(&path, "").unwrap();

        let found = find_config_file_with(None, Some(path.to_string_lossy().into_owned()));
        assert_eq!(found, Some(path.clone()));
    }

    #[test]
    fn find_config_explicit_takes_priority_over_env() {
        let dir = tempfile::TempDir::new().unwrap();
        let explicit = dir.path().join("explicit.toml");
        let env = dir.path().join("env.toml");
        std::fs::write(&explicit, "").unwrap();
        std::fs::write(&env, "").unwrap();

        let found =
            find_config_file_with(Some(&explicit), Some(env.to_string_lossy().into_owned()));
        assert_eq!(found, Some(explicit.clone()));
    }

    #[test]
    fn load_config_from_nonexistent_returns_default() {
        let config = load_config_from(Path::new("/nonexistent/config.toml"));
        assert!(config.relay.host.is_none());
    }

    #[test]
    fn config_error_display() {
        assert!(
            ConfigError::NoConfigDir
                .to_string()
                .contains("config directory")
        );

        let io_err = std::io::Error::new(std::io::ErrorKind::PermissionDenied, "denied");
        assert!(ConfigError::Io(io_err).to_string().contains("denied"));

        let path = PathBuf::from("/tmp/test.toml");
        let msg = ConfigError::AlreadyExists(path).to_string();
        assert!(msg.contains("already exists"));
        assert!(msg.contains("/tmp/test.toml"));
    }

    #[test]
    fn config_serializes_to_json() {
        let config = ConfigFile::default();
        let resolved = resolve_config(&config, None);
        let json = serde_json::to_string(&resolved).unwrap();
        let parsed: serde_json::Value = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed["relay"]["port"], 9333);
        assert_eq!(parsed["limits"]["tab_limit"], 5);
        assert_eq!(parsed["logging"]["format"], "pretty");
    }
}
