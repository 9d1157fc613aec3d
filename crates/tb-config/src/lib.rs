// SPDX-License-Identifier: MIT OR Apache-2.0
//! Configuration loading, validation, and env overrides for the control
//! plane daemon.
//!
//! [`ServerConfig`] is the top-level settings struct, loaded from a TOML
//! file with `TB_*` environment overrides applied on top. Validation
//! separates hard errors (refuse to start) from advisory
//! [`ConfigWarning`]s (log and continue).
#![deny(unsafe_code)]
#![warn(missing_docs)]

use serde::{Deserialize, Serialize};
use std::path::Path;

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Errors that can occur during configuration loading or validation.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// The requested configuration file was not found or unreadable.
    #[error("config file not found: {path}")]
    FileNotFound {
        /// Path that was requested.
        path: String,
    },

    /// The file could not be parsed as valid TOML.
    #[error("failed to parse config: {reason}")]
    ParseError {
        /// Human-readable parse error detail.
        reason: String,
    },

    /// Semantic validation failed (one or more problems).
    #[error("config validation failed: {reasons:?}")]
    ValidationError {
        /// Individual validation failure messages.
        reasons: Vec<String>,
    },
}

// ---------------------------------------------------------------------------
// Warnings
// ---------------------------------------------------------------------------

/// Advisory-level issues that do not prevent startup but deserve attention.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigWarning {
    /// The server will accept unauthenticated requests.
    OpenModeEnabled,
    /// The legacy plaintext allow-list is active.
    LegacyAllowlistActive {
        /// Number of plaintext keys in the list.
        count: usize,
    },
    /// `?api_key=` query-string authentication is enabled.
    QueryParamAuthEnabled,
    /// No admin credential; admin endpoints will reject every request.
    NoAdminCredential,
}

impl std::fmt::Display for ConfigWarning {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::OpenModeEnabled => {
                write!(f, "open mode enabled: unauthenticated requests are accepted")
            }
            Self::LegacyAllowlistActive { count } => {
                write!(f, "legacy plaintext allow-list active ({count} keys)")
            }
            Self::QueryParamAuthEnabled => {
                write!(f, "query-string api_key auth enabled (debug only)")
            }
            Self::NoAdminCredential => {
                write!(f, "no admin credential configured; admin API is disabled")
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Config sections
// ---------------------------------------------------------------------------

/// Top-level daemon configuration.
#[derive(Debug, Clone, Default, Deserialize, Serialize, PartialEq)]
pub struct ServerConfig {
    /// HTTP listener settings.
    #[serde(default)]
    pub http: HttpConfig,
    /// Authentication sources.
    #[serde(default)]
    pub auth: AuthConfig,
    /// Engine adapter settings.
    #[serde(default)]
    pub engine: EngineConfig,
    /// Storage locations.
    #[serde(default)]
    pub storage: StorageConfig,
    /// Per-IP rate limits.
    #[serde(default)]
    pub rate_limit: RateLimitConfig,
    /// Token pricing.
    #[serde(default)]
    pub pricing: PricingConfig,
    /// Session cache tunables.
    #[serde(default)]
    pub cache: CacheConfig,
    /// Execute-endpoint tunables.
    #[serde(default)]
    pub execute: ExecuteConfig,
}

/// HTTP listener settings.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
pub struct HttpConfig {
    /// Listener port.
    #[serde(default = "default_port")]
    pub port: u16,
    /// Allowed CORS origin (`*` for any).
    #[serde(default = "default_cors_origin")]
    pub cors_origin: String,
}

/// Authentication sources, checked in order: DB key hash, allow-list,
/// open mode.
#[derive(Debug, Clone, Default, Deserialize, Serialize, PartialEq, Eq)]
pub struct AuthConfig {
    /// Credential required by `/admin/*` and `/billing/admin/*`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub admin_credential: Option<String>,
    /// Legacy plaintext keys matched verbatim after the hash lookup misses.
    #[serde(default)]
    pub legacy_key_allowlist: Vec<String>,
    /// Accept unauthenticated requests. Never implied; must be set by the
    /// operator.
    #[serde(default)]
    pub open_mode: bool,
    /// Accept `?api_key=` query-string credentials (debugging only).
    #[serde(default)]
    pub allow_query_param: bool,
}

/// Engine adapter settings.
#[derive(Debug, Clone, Default, Deserialize, Serialize, PartialEq, Eq)]
pub struct EngineConfig {
    /// Command used to spawn the engine, one process per thread.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command: Option<String>,
    /// Extra CLI arguments for the engine command.
    #[serde(default)]
    pub args: Vec<String>,
    /// Credential handed to the engine via its environment. Required to
    /// serve `/execute`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub credential: Option<String>,
}

/// Storage locations.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
pub struct StorageConfig {
    /// SQLite database path.
    #[serde(default = "default_database_path")]
    pub database_path: String,
    /// Root of the shared object mount holding workspaces and sidecars.
    #[serde(default = "default_object_mount")]
    pub object_mount_path: String,
}

/// Per-IP rate limits over a shared window.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
pub struct RateLimitConfig {
    /// Window length in seconds.
    #[serde(default = "default_rate_window_secs")]
    pub window_secs: u64,
    /// Requests per window per IP across all endpoints.
    #[serde(default = "default_global_max")]
    pub global_max: u32,
    /// Additional per-window cap on `/execute`.
    #[serde(default = "default_execute_max")]
    pub execute_max: u32,
}

/// Token pricing per 1k tokens, USD.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct PricingConfig {
    /// Price per 1 000 input tokens.
    #[serde(default = "default_input_per_1k")]
    pub input_per_1k: f64,
    /// Price per 1 000 output tokens.
    #[serde(default = "default_output_per_1k")]
    pub output_per_1k: f64,
}

/// Session cache tunables.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
pub struct CacheConfig {
    /// Upper bound on live sessions held in memory.
    #[serde(default = "default_max_sessions")]
    pub max_sessions: usize,
    /// Idle time before a session expires, in hours.
    #[serde(default = "default_ttl_hours")]
    pub ttl_hours: u64,
}

/// Execute-endpoint tunables.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
pub struct ExecuteConfig {
    /// Wall-clock deadline for one task, in seconds.
    #[serde(default = "default_execute_timeout_secs")]
    pub timeout_secs: u64,
}

// Serde defaults.
fn default_port() -> u16 {
    8080
}
fn default_cors_origin() -> String {
    "*".into()
}
fn default_database_path() -> String {
    "testbase.db".into()
}
fn default_object_mount() -> String {
    ".testbase/workspaces".into()
}
fn default_rate_window_secs() -> u64 {
    900
}
fn default_global_max() -> u32 {
    100
}
fn default_execute_max() -> u32 {
    30
}
fn default_input_per_1k() -> f64 {
    0.015
}
fn default_output_per_1k() -> f64 {
    0.045
}
fn default_max_sessions() -> usize {
    100
}
fn default_ttl_hours() -> u64 {
    24
}
fn default_execute_timeout_secs() -> u64 {
    600
}

/// Hard upper bound on the execute deadline.
pub const MAX_EXECUTE_TIMEOUT_SECS: u64 = 900;

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            port: default_port(),
            cors_origin: default_cors_origin(),
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            database_path: default_database_path(),
            object_mount_path: default_object_mount(),
        }
    }
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            window_secs: default_rate_window_secs(),
            global_max: default_global_max(),
            execute_max: default_execute_max(),
        }
    }
}

impl Default for PricingConfig {
    fn default() -> Self {
        Self {
            input_per_1k: default_input_per_1k(),
            output_per_1k: default_output_per_1k(),
        }
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            max_sessions: default_max_sessions(),
            ttl_hours: default_ttl_hours(),
        }
    }
}

impl Default for ExecuteConfig {
    fn default() -> Self {
        Self {
            timeout_secs: default_execute_timeout_secs(),
        }
    }
}

// ---------------------------------------------------------------------------
// Loading
// ---------------------------------------------------------------------------

/// Load a [`ServerConfig`] from an optional TOML file path.
///
/// * If `path` is `Some`, reads and parses the file.
/// * If `path` is `None`, starts from [`ServerConfig::default()`].
///
/// Environment overrides are applied on top in both cases.
///
/// # Errors
///
/// Returns [`ConfigError::FileNotFound`] or [`ConfigError::ParseError`].
pub fn load_config(path: Option<&Path>) -> Result<ServerConfig, ConfigError> {
    let mut config = match path {
        Some(p) => {
            let content = std::fs::read_to_string(p).map_err(|_| ConfigError::FileNotFound {
                path: p.display().to_string(),
            })?;
            parse_toml(&content)?
        }
        None => ServerConfig::default(),
    };
    apply_env_overrides(&mut config);
    Ok(config)
}

/// Parse a TOML string into a [`ServerConfig`].
///
/// # Errors
///
/// Returns [`ConfigError::ParseError`] on malformed TOML or wrong types.
pub fn parse_toml(content: &str) -> Result<ServerConfig, ConfigError> {
    toml::from_str::<ServerConfig>(content).map_err(|e| ConfigError::ParseError {
        reason: e.to_string(),
    })
}

// ---------------------------------------------------------------------------
// Env overrides
// ---------------------------------------------------------------------------

/// Apply environment variable overrides.
///
/// Recognised variables:
/// - `TB_PORT`
/// - `TB_DATABASE_PATH`
/// - `TB_OBJECT_MOUNT`
/// - `TB_ADMIN_CREDENTIAL`
/// - `TB_ENGINE_CREDENTIAL`
/// - `TB_KEY_ALLOWLIST` (comma-separated plaintext keys)
/// - `TB_OPEN_MODE` (`1` / `true`)
pub fn apply_env_overrides(config: &mut ServerConfig) {
    if let Ok(val) = std::env::var("TB_PORT")
        && let Ok(port) = val.parse()
    {
        config.http.port = port;
    }
    if let Ok(val) = std::env::var("TB_DATABASE_PATH") {
        config.storage.database_path = val;
    }
    if let Ok(val) = std::env::var("TB_OBJECT_MOUNT") {
        config.storage.object_mount_path = val;
    }
    if let Ok(val) = std::env::var("TB_ADMIN_CREDENTIAL") {
        config.auth.admin_credential = Some(val);
    }
    if let Ok(val) = std::env::var("TB_ENGINE_CREDENTIAL") {
        config.engine.credential = Some(val);
    }
    if let Ok(val) = std::env::var("TB_KEY_ALLOWLIST") {
        config.auth.legacy_key_allowlist = val
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(String::from)
            .collect();
    }
    if let Ok(val) = std::env::var("TB_OPEN_MODE") {
        config.auth.open_mode = val == "1" || val.eq_ignore_ascii_case("true");
    }
}

// ---------------------------------------------------------------------------
// Validation
// ---------------------------------------------------------------------------

/// Validate a parsed configuration, returning advisory warnings.
///
/// # Errors
///
/// Returns [`ConfigError::ValidationError`] listing every hard problem found.
pub fn validate_config(config: &ServerConfig) -> Result<Vec<ConfigWarning>, ConfigError> {
    let mut errors: Vec<String> = Vec::new();
    let mut warnings: Vec<ConfigWarning> = Vec::new();

    if config.execute.timeout_secs == 0 || config.execute.timeout_secs > MAX_EXECUTE_TIMEOUT_SECS {
        errors.push(format!(
            "execute.timeout_secs {} out of range (1..{MAX_EXECUTE_TIMEOUT_SECS})",
            config.execute.timeout_secs
        ));
    }
    if config.cache.max_sessions == 0 {
        errors.push("cache.max_sessions must be at least 1".into());
    }
    if config.cache.ttl_hours == 0 {
        errors.push("cache.ttl_hours must be at least 1".into());
    }
    if config.rate_limit.window_secs == 0 {
        errors.push("rate_limit.window_secs must be at least 1".into());
    }
    if config.pricing.input_per_1k < 0.0 || config.pricing.output_per_1k < 0.0 {
        errors.push("pricing must not be negative".into());
    }
    if let Some(cmd) = &config.engine.command
        && cmd.trim().is_empty()
    {
        errors.push("engine.command must not be empty when set".into());
    }

    if config.auth.open_mode {
        warnings.push(ConfigWarning::OpenModeEnabled);
    }
    if !config.auth.legacy_key_allowlist.is_empty() {
        warnings.push(ConfigWarning::LegacyAllowlistActive {
            count: config.auth.legacy_key_allowlist.len(),
        });
    }
    if config.auth.allow_query_param {
        warnings.push(ConfigWarning::QueryParamAuthEnabled);
    }
    if config.auth.admin_credential.is_none() {
        warnings.push(ConfigWarning::NoAdminCredential);
    }

    if errors.is_empty() {
        Ok(warnings)
    } else {
        Err(ConfigError::ValidationError { reasons: errors })
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn default_config_is_valid() {
        let cfg = ServerConfig::default();
        let warnings = validate_config(&cfg).expect("default config should be valid");
        // No admin credential by default, so at least that warning fires.
        assert!(warnings.contains(&ConfigWarning::NoAdminCredential));
    }

    #[test]
    fn defaults_match_documented_values() {
        let cfg = ServerConfig::default();
        assert_eq!(cfg.http.port, 8080);
        assert_eq!(cfg.rate_limit.global_max, 100);
        assert_eq!(cfg.rate_limit.execute_max, 30);
        assert_eq!(cfg.rate_limit.window_secs, 900);
        assert_eq!(cfg.cache.max_sessions, 100);
        assert_eq!(cfg.cache.ttl_hours, 24);
        assert_eq!(cfg.execute.timeout_secs, 600);
        assert_eq!(cfg.pricing.input_per_1k, 0.015);
        assert_eq!(cfg.pricing.output_per_1k, 0.045);
        assert!(!cfg.auth.open_mode);
    }

    #[test]
    fn parse_valid_toml() {
        let toml = r#"
            [http]
            port = 9090

            [auth]
            admin_credential = "s3cret"
            legacy_key_allowlist = ["tb_old1", "tb_old2"]

            [execute]
            timeout_secs = 300
        "#;
        let cfg = parse_toml(toml).unwrap();
        assert_eq!(cfg.http.port, 9090);
        assert_eq!(cfg.auth.admin_credential.as_deref(), Some("s3cret"));
        assert_eq!(cfg.auth.legacy_key_allowlist.len(), 2);
        assert_eq!(cfg.execute.timeout_secs, 300);
    }

    #[test]
    fn parse_invalid_toml_gives_parse_error() {
        let err = parse_toml("this is [not valid toml =").unwrap_err();
        assert!(matches!(err, ConfigError::ParseError { .. }));
    }

    #[test]
    fn parse_wrong_types_gives_parse_error() {
        let err = parse_toml("[http]\nport = \"eighty\"").unwrap_err();
        assert!(matches!(err, ConfigError::ParseError { .. }));
    }

    #[test]
    fn validation_rejects_zero_timeout() {
        let mut cfg = ServerConfig::default();
        cfg.execute.timeout_secs = 0;
        assert!(matches!(
            validate_config(&cfg).unwrap_err(),
            ConfigError::ValidationError { .. }
        ));
    }

    #[test]
    fn validation_rejects_timeout_above_cap() {
        let mut cfg = ServerConfig::default();
        cfg.execute.timeout_secs = MAX_EXECUTE_TIMEOUT_SECS + 1;
        assert!(validate_config(&cfg).is_err());
    }

    #[test]
    fn validation_rejects_zero_cache_capacity() {
        let mut cfg = ServerConfig::default();
        cfg.cache.max_sessions = 0;
        assert!(validate_config(&cfg).is_err());
    }

    #[test]
    fn validation_rejects_negative_pricing() {
        let mut cfg = ServerConfig::default();
        cfg.pricing.input_per_1k = -0.01;
        assert!(validate_config(&cfg).is_err());
    }

    #[test]
    fn open_mode_produces_warning() {
        let mut cfg = ServerConfig::default();
        cfg.auth.open_mode = true;
        let warnings = validate_config(&cfg).unwrap();
        assert!(warnings.contains(&ConfigWarning::OpenModeEnabled));
    }

    #[test]
    fn allowlist_produces_warning_with_count() {
        let mut cfg = ServerConfig::default();
        cfg.auth.legacy_key_allowlist = vec!["tb_a".into(), "tb_b".into()];
        let warnings = validate_config(&cfg).unwrap();
        assert!(
            warnings
                .iter()
                .any(|w| matches!(w, ConfigWarning::LegacyAllowlistActive { count: 2 }))
        );
    }

    #[test]
    fn load_config_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("testbase.toml");
        let mut f = std::fs::File::create(&path).unwrap();
        writeln!(f, "[storage]\ndatabase_path = \"/tmp/x.db\"").unwrap();
        let cfg = load_config(Some(&path)).unwrap();
        assert_eq!(cfg.storage.database_path, "/tmp/x.db");
    }

    #[test]
    fn load_missing_file_gives_file_not_found() {
        let err = load_config(Some(Path::new("/nonexistent/testbase.toml"))).unwrap_err();
        assert!(matches!(err, ConfigError::FileNotFound { .. }));
    }

    #[test]
    fn toml_roundtrip() {
        let mut cfg = ServerConfig::default();
        cfg.auth.admin_credential = Some("adm".into());
        cfg.engine.command = Some("testbase-engine".into());
        let serialized = toml::to_string(&cfg).unwrap();
        let back: ServerConfig = toml::from_str(&serialized).unwrap();
        assert_eq!(cfg, back);
    }

    #[test]
    fn warning_display_is_informative() {
        assert!(
            ConfigWarning::LegacyAllowlistActive { count: 3 }
                .to_string()
                .contains('3')
        );
        assert!(
            ConfigWarning::OpenModeEnabled
                .to_string()
                .contains("unauthenticated")
        );
    }
}
