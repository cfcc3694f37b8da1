//! TOML configuration types for sipguard.
//!
//! The top-level [`AppConfig`] is deserialized from `sipguard.toml` and contains
//! one section per deployment mode plus the redaction rule set shared by the
//! MITM proxy. Every section has defaults, so an empty file is a valid config.
//!
//! A local override file (by default `sipguard.local.toml` next to the main
//! file) is deep-merged over the main file before parsing, so secrets and
//! per-host settings can live outside version control.
//!
//! # Example `sipguard.toml`
//!
//! ```toml
//! [mitm]
//! listen = "0.0.0.0:8000"
//! upstream = "https://api.vendor.example"
//! log_requests = true
//!
//! [[redaction.routes]]
//! path = "/parse/classes/Day/*"
//! rules = [{ field = "location", action = "remove" }]
//!
//! [server.auth]
//! application_id = "${SIPGUARD_APP_ID}"
//! ```

use std::path::{Path, PathBuf};

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::{Result, SipGuardError};

/// What a redaction rule does to a matching field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ActionKind {
    /// Delete the field from the payload.
    Remove,
    /// Replace the field's value with a placeholder.
    Mask,
}

/// A single field rule as written in the config file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RuleConfig {
    /// Dotted path to the field (e.g., `"location.latitude"`).
    pub field: String,
    pub action: ActionKind,
    /// Placeholder for `mask`; defaults to `"[REDACTED]"` when omitted.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<serde_json::Value>,
}

impl RuleConfig {
    pub fn remove(field: &str) -> Self {
        Self {
            field: field.to_string(),
            action: ActionKind::Remove,
            value: None,
        }
    }

    pub fn mask(field: &str, value: serde_json::Value) -> Self {
        Self {
            field: field.to_string(),
            action: ActionKind::Mask,
            value: Some(value),
        }
    }
}

/// Rules that only apply to requests whose path matches `path`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RouteConfig {
    /// Slash-separated pattern; a `*` segment matches any single segment.
    pub path: String,
    #[serde(default)]
    pub rules: Vec<RuleConfig>,
}

/// Redaction rule set configuration (`[redaction]` section).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RedactionConfig {
    /// Rules applied to every forwarded body.
    pub rules: Vec<RuleConfig>,
    /// Rules scoped to specific request paths.
    pub routes: Vec<RouteConfig>,
    /// Request headers forwarded upstream; every other header is dropped.
    pub forward_headers: Vec<String>,
}

impl Default for RedactionConfig {
    fn default() -> Self {
        use serde_json::json;

        Self {
            rules: vec![
                RuleConfig::remove("lat"),
                RuleConfig::remove("lon"),
                RuleConfig::remove("device_id"),
            ],
            routes: vec![
                RouteConfig {
                    path: "/parse/classes/Bottle/*".to_string(),
                    rules: vec![
                        RuleConfig::mask("location.latitude", json!(0)),
                        RuleConfig::mask("location.longitude", json!(0)),
                    ],
                },
                RouteConfig {
                    path: "/parse/classes/Day/*".to_string(),
                    rules: vec![
                        RuleConfig::mask("altitude", json!(0)),
                        RuleConfig::mask("isLocationUsed", json!(false)),
                        RuleConfig::mask("humidity", json!(0)),
                        RuleConfig::mask("rank", json!(0)),
                        RuleConfig::remove("location"),
                    ],
                },
                RouteConfig {
                    path: "/parse/classes/_Installation".to_string(),
                    rules: vec![
                        RuleConfig::mask("deviceType", json!("a")),
                        RuleConfig::mask("appVersion", json!("a")),
                        RuleConfig::mask("deviceToken", json!("a")),
                    ],
                },
                RouteConfig {
                    path: "/parse/classes/_Installation/*".to_string(),
                    rules: vec![
                        RuleConfig::mask("deviceType", json!("a")),
                        RuleConfig::mask("deviceName", json!("a")),
                        RuleConfig::mask("deviceToken", json!("a")),
                    ],
                },
                RouteConfig {
                    path: "/parse/classes/Location".to_string(),
                    rules: vec![
                        RuleConfig::mask("altitude", json!(0)),
                        RuleConfig::mask("point.latitude", json!(0)),
                        RuleConfig::mask("point.longitude", json!(0)),
                    ],
                },
            ],
            forward_headers: [
                "X-Parse-Application-Id",
                "X-Parse-Rest-Api-Key",
                "X-Parse-App-Build-Version",
                "X-Parse-App-Display-Version",
                "X-Parse-Os-Version",
                "X-Parse-Installation-Id",
                "X-Parse-Client-Key",
                "X-Parse-Session-Token",
                "Content-Type",
                "User-Agent",
            ]
            .iter()
            .map(|s| s.to_string())
            .collect(),
        }
    }
}

/// MITM proxy configuration (`[mitm]` section).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MitmConfig {
    /// Address to listen on (e.g., `"127.0.0.1:8000"`).
    pub listen: String,
    /// Upstream base URL; request paths are appended verbatim.
    pub upstream: String,
    /// Outbound request timeout in seconds.
    pub timeout_secs: u64,
    /// Persist every raw (pre-redaction) request.
    pub log_requests: bool,
    /// SQLite file holding the request log.
    pub log_db: PathBuf,
    /// Paths answered locally with an empty result and never forwarded.
    /// Entries without a leading `/` are relative to `/parse/`.
    pub blocked_paths: Vec<String>,
    /// Keys written into the `params` of every `/parse/config` response.
    /// An empty table leaves the response untouched.
    pub config_overrides: serde_json::Map<String, serde_json::Value>,
}

impl Default for MitmConfig {
    fn default() -> Self {
        Self {
            listen: "127.0.0.1:8000".to_string(),
            upstream: String::new(),
            timeout_secs: 30,
            log_requests: false,
            log_db: PathBuf::from("sipguard-requests.db"),
            blocked_paths: [
                "functions/trophyanalytics",
                "events/AppOpened",
                "events/setManualGoal",
                "events/viewPreviousDay",
                "events/previousDay",
                "events/logout",
                "events/unpairBottle",
                "events/addBottle",
                "functions/getusergroups",
                "functions/getmychallenges",
                "functions/getmyawards",
                "functions/getmyfriends",
                "functions/getuserads",
                "functions/getjoinablechallenges",
                "functions/getclosedchallenges",
                "functions/getchallengedetail",
            ]
            .iter()
            .map(|p| format!("/parse/{}", p))
            .collect(),
            config_overrides: [
                "downloadAppUrl",
                "androidPregnancySettings",
                "trophyShareUrl",
                "trophySign",
                "hidePro",
            ]
            .iter()
            .map(|key| (key.to_string(), serde_json::Value::Bool(false)))
            .collect(),
        }
    }
}

/// Device authentication headers for the full server (`[server.auth]` section).
///
/// A request is authorized when the application ID matches and either the
/// REST API key or the client key matches. Empty expected values never match.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AuthConfig {
    pub application_id_header: String,
    pub application_id: String,
    pub rest_api_key_header: String,
    pub rest_api_key: String,
    pub client_key_header: String,
    pub client_key: String,
    /// Header carrying the session token issued at login/signup.
    pub session_header: String,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            application_id_header: "X-Parse-Application-Id".to_string(),
            application_id: String::new(),
            rest_api_key_header: "X-Parse-REST-API-Key".to_string(),
            rest_api_key: String::new(),
            client_key_header: "X-Parse-Client-Key".to_string(),
            client_key: String::new(),
            session_header: "X-Parse-Session-Token".to_string(),
        }
    }
}

/// Full replacement server configuration (`[server]` section).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub listen: String,
    /// SQLite database file.
    pub database: PathBuf,
    /// Key used to hash session tokens at rest.
    pub secret_key: String,
    /// Accepted `Host` header values. `"*"` accepts any host and
    /// `".example.com"` accepts the domain and all of its subdomains.
    pub allowed_hosts: Vec<String>,
    /// Verbose (`debug`) logging.
    pub debug: bool,
    pub session_age_secs: u64,
    pub max_body_bytes: usize,
    pub auth: AuthConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: "127.0.0.1:8001".to_string(),
            database: PathBuf::from("sipguard.db"),
            secret_key: String::new(),
            allowed_hosts: vec!["localhost".to_string(), "127.0.0.1".to_string()],
            debug: false,
            session_age_secs: 365 * 24 * 60 * 60,
            max_body_bytes: 10_000_000,
            auth: AuthConfig::default(),
        }
    }
}

/// Top-level application configuration deserialized from `sipguard.toml`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub mitm: MitmConfig,
    #[serde(default)]
    pub redaction: RedactionConfig,
    #[serde(default)]
    pub server: ServerConfig,
}

impl AppConfig {
    /// Load and parse the configuration from a TOML file at the given path.
    ///
    /// Before parsing, `${VAR}` and `$VAR` placeholders in the TOML text are
    /// replaced with the corresponding environment variable values. An error is
    /// returned if a referenced variable is not set.
    pub fn load_from_path(path: &Path) -> Result<Self> {
        Self::load_with_override(path, None)
    }

    /// Load the main file and deep-merge an optional override file over it.
    ///
    /// A missing override file is not an error.
    pub fn load_with_override(path: &Path, override_path: Option<&Path>) -> Result<Self> {
        let mut merged = read_toml(path)?;
        if let Some(override_path) = override_path {
            if override_path.exists() {
                let local = read_toml(override_path)?;
                merge_tables(&mut merged, local);
            }
        }
        let config: AppConfig = merged.try_into()?;
        Ok(config)
    }

    /// Default override path for a config file: `name.toml` -> `name.local.toml`.
    pub fn default_override_path(path: &Path) -> PathBuf {
        let stem = path
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| "sipguard".to_string());
        path.with_file_name(format!("{}.local.toml", stem))
    }

    /// Check the settings the MITM proxy cannot start without.
    pub fn validate_mitm(&self) -> Result<()> {
        let upstream = self.mitm.upstream.trim();
        if upstream.is_empty() {
            return Err(SipGuardError::ConfigInvalid(
                "mitm.upstream must be set".to_string(),
            ));
        }
        if !upstream.starts_with("http://") && !upstream.starts_with("https://") {
            return Err(SipGuardError::ConfigInvalid(format!(
                "mitm.upstream must be an http(s) URL, got {}",
                upstream
            )));
        }
        Ok(())
    }

    /// Check the settings the full server cannot start without.
    pub fn validate_server(&self) -> Result<()> {
        if self.server.secret_key.is_empty() {
            return Err(SipGuardError::ConfigInvalid(
                "server.secret_key must be set".to_string(),
            ));
        }
        if self.server.auth.application_id.is_empty() {
            return Err(SipGuardError::ConfigInvalid(
                "server.auth.application_id must be set".to_string(),
            ));
        }
        if self.server.auth.rest_api_key.is_empty() && self.server.auth.client_key.is_empty() {
            return Err(SipGuardError::ConfigInvalid(
                "one of server.auth.rest_api_key or server.auth.client_key must be set"
                    .to_string(),
            ));
        }
        Ok(())
    }
}

fn read_toml(path: &Path) -> Result<toml::Value> {
    let content = std::fs::read_to_string(path)?;
    let content = substitute_env_vars(&content)?;
    let value: toml::Value = toml::from_str(&content)?;
    Ok(value)
}

/// Merge `overlay` into `base`. Tables merge key by key; any other value
/// (arrays included) replaces the base value wholesale.
fn merge_tables(base: &mut toml::Value, overlay: toml::Value) {
    match (base, overlay) {
        (toml::Value::Table(base_table), toml::Value::Table(overlay_table)) => {
            for (key, value) in overlay_table {
                match base_table.get_mut(&key) {
                    Some(existing) => merge_tables(existing, value),
                    None => {
                        base_table.insert(key, value);
                    }
                }
            }
        }
        (base, overlay) => *base = overlay,
    }
}

/// Replace `${VAR_NAME}` and `$VAR_NAME` placeholders with environment variable values.
///
/// Returns an error containing the variable name if the variable is not set.
fn substitute_env_vars(input: &str) -> Result<String> {
    let re_braces = Regex::new(r"\$\{([A-Za-z_][A-Za-z0-9_]*)\}").unwrap();
    // Bare form is uppercase-only to avoid false positives
    let re_bare = Regex::new(r"\$([A-Z_][A-Z0-9_]*)").unwrap();

    let mut result = input.to_string();

    for cap in re_braces.captures_iter(input) {
        let var_name = &cap[1];
        let value = std::env::var(var_name)
            .map_err(|_| SipGuardError::ConfigEnvVar(var_name.to_string()))?;
        result = result.replace(&cap[0], &value);
    }

    let intermediate = result.clone();
    for cap in re_bare.captures_iter(&intermediate) {
        let var_name = &cap[1];
        let value = std::env::var(var_name)
            .map_err(|_| SipGuardError::ConfigEnvVar(var_name.to_string()))?;
        result = result.replace(&cap[0], &value);
    }

    Ok(result)
}
