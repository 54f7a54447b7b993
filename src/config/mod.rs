//! Configuration module
//!
//! Loads a JSON5 file, substitutes `${VAR}` references, then walks the
//! resulting `serde_json::Value` into typed settings. Environment variables
//! take precedence over the file; a missing file means defaults.
//!
//! ```json5
//! {
//!   server:    { bind: "127.0.0.1", port: 8787 },
//!   proxy:     { maxBytes: 10485760, timeoutMs: 30000, userAgent: "imgshield/0.1.0" },
//!   policy:    { allowedOrigins: [], verboseErrors: false, hostBinding: "pinned" },
//!   rateLimit: { enabled: true, maxRequests: 10, windowSecs: 60, trustProxyHeaders: false },
//! }
//! ```

use regex::Regex;
use serde_json::{Map, Value};
use std::env;
use std::fs;
use std::net::{IpAddr, Ipv4Addr};
use std::path::{Path, PathBuf};
use std::sync::LazyLock;
use std::time::Duration;
use thiserror::Error;
use tracing::debug;

use crate::logging::targets;
use crate::media::{FetchConfig, HostBinding, DEFAULT_USER_AGENT, MAX_FETCH_TIMEOUT_MS, SNIFF_LEN};
use crate::server::RateLimitConfig;

/// Config file location override
pub const CONFIG_PATH_ENV: &str = "IMGSHIELD_CONFIG_PATH";
pub const BIND_ENV: &str = "IMGSHIELD_BIND";
pub const PORT_ENV: &str = "IMGSHIELD_PORT";
/// Comma-separated origins
pub const ALLOWED_ORIGINS_ENV: &str = "IMGSHIELD_ALLOWED_ORIGINS";
pub const VERBOSE_ERRORS_ENV: &str = "IMGSHIELD_VERBOSE_ERRORS";
/// Development logging, and verbose errors unless explicitly disabled
pub const DEV_ENV: &str = "IMGSHIELD_DEV";

pub const DEFAULT_BIND: IpAddr = IpAddr::V4(Ipv4Addr::LOCALHOST);
pub const DEFAULT_PORT: u16 = 8787;

/// Configuration errors
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to parse JSON5 at {path}: {message}")]
    ParseError { path: String, message: String },

    #[error("Failed to read config file {path}: {message}")]
    ReadError { path: String, message: String },

    #[error("Missing environment variable: {var}")]
    MissingEnvVar { var: String },

    #[error("Validation error at {path}: {message}")]
    ValidationError { path: String, message: String },
}

fn invalid(path: impl Into<String>, message: impl Into<String>) -> ConfigError {
    ConfigError::ValidationError {
        path: path.into(),
        message: message.into(),
    }
}

/// Origin, error, and connection policy shared by every request
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProxyPolicy {
    pub allowed_origins: Vec<String>,
    pub verbose_errors: bool,
    pub host_binding: HostBinding,
}

/// Typed settings
#[derive(Debug, Clone)]
pub struct ImgshieldConfig {
    pub bind: IpAddr,
    pub port: u16,
    pub fetch: FetchConfig,
    pub user_agent: String,
    pub policy: ProxyPolicy,
    pub rate_limit: RateLimitConfig,
    pub dev_mode: bool,
}

impl Default for ImgshieldConfig {
    fn default() -> Self {
        ImgshieldConfig {
            bind: DEFAULT_BIND,
            port: DEFAULT_PORT,
            fetch: FetchConfig::default(),
            user_agent: DEFAULT_USER_AGENT.to_string(),
            policy: ProxyPolicy::default(),
            rate_limit: RateLimitConfig::default(),
            dev_mode: false,
        }
    }
}

/// Get the config file path.
/// Priority: IMGSHIELD_CONFIG_PATH > ~/.imgshield/imgshield.json5
pub fn get_config_path() -> PathBuf {
    if let Ok(path) = env::var(CONFIG_PATH_ENV) {
        return PathBuf::from(path);
    }

    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".imgshield")
        .join("imgshield.json5")
}

/// Load, substitute, and build from the default path and process env.
pub fn load_config() -> Result<ImgshieldConfig, ConfigError> {
    let path = get_config_path();
    let raw = load_config_uncached(&path)?;
    build_config(&raw)
}

/// Read the raw config value. A missing file yields an empty object.
pub fn load_config_uncached(path: &Path) -> Result<Value, ConfigError> {
    if !path.exists() {
        debug!(target: targets::CONFIG, path = %path.display(), "no config file, using defaults");
        return Ok(Value::Object(Map::new()));
    }

    let content = fs::read_to_string(path).map_err(|e| ConfigError::ReadError {
        path: path.display().to_string(),
        message: e.to_string(),
    })?;

    let mut value = parse_json5(&content, path)?;
    substitute_env_vars(&mut value, &process_env)?;
    debug!(target: targets::CONFIG, path = %path.display(), "config loaded");
    Ok(value)
}

fn parse_json5(content: &str, path: &Path) -> Result<Value, ConfigError> {
    json5::from_str(content).map_err(|e| ConfigError::ParseError {
        path: path.display().to_string(),
        message: e.to_string(),
    })
}

fn process_env(name: &str) -> Option<String> {
    env::var(name).ok()
}

/// Replace `${VAR}` in every string value. `$${VAR}` escapes to a literal `${VAR}`.
fn substitute_env_vars(
    value: &mut Value,
    lookup: &dyn Fn(&str) -> Option<String>,
) -> Result<(), ConfigError> {
    match value {
        Value::String(s) => *s = substitute_in_string(s, lookup)?,
        Value::Object(obj) => {
            for v in obj.values_mut() {
                substitute_env_vars(v, lookup)?;
            }
        }
        Value::Array(items) => {
            for item in items.iter_mut() {
                substitute_env_vars(item, lookup)?;
            }
        }
        _ => {}
    }
    Ok(())
}

fn substitute_in_string(
    s: &str,
    lookup: &dyn Fn(&str) -> Option<String>,
) -> Result<String, ConfigError> {
    static ENV_REF: LazyLock<Regex> =
        LazyLock::new(|| Regex::new(r"\$\$?\{([A-Z_][A-Z0-9_]*)\}").unwrap());

    let mut out = String::with_capacity(s.len());
    let mut tail = 0;
    for caps in ENV_REF.captures_iter(s) {
        let (Some(whole), Some(name)) = (caps.get(0), caps.get(1)) else {
            continue;
        };
        out.push_str(&s[tail..whole.start()]);
        if whole.as_str().starts_with("$$") {
            out.push_str(&whole.as_str()[1..]);
        } else {
            let var = name.as_str();
            let resolved = lookup(var).ok_or_else(|| ConfigError::MissingEnvVar {
                var: var.to_string(),
            })?;
            out.push_str(&resolved);
        }
        tail = whole.end();
    }
    out.push_str(&s[tail..]);
    Ok(out)
}

/// Build typed settings from a raw value and the process environment.
pub fn build_config(raw: &Value) -> Result<ImgshieldConfig, ConfigError> {
    build_config_with_env(raw, &process_env)
}

/// Build typed settings; `lookup` stands in for the environment.
pub fn build_config_with_env(
    raw: &Value,
    lookup: &dyn Fn(&str) -> Option<String>,
) -> Result<ImgshieldConfig, ConfigError> {
    let mut config = ImgshieldConfig::default();

    let server = Section::of(raw, "server")?;
    if let Some(bind) = server.str("bind")? {
        config.bind = parse_bind(&server.path("bind"), bind)?;
    }
    if let Some(port) = server.u64("port")? {
        config.port = parse_port(&server.path("port"), port)?;
    }

    let proxy = Section::of(raw, "proxy")?;
    if let Some(max_bytes) = proxy.u64("maxBytes")? {
        if max_bytes < SNIFF_LEN as u64 {
            return Err(invalid(
                proxy.path("maxBytes"),
                format!("must be at least {SNIFF_LEN}"),
            ));
        }
        config.fetch = config.fetch.with_max_bytes(max_bytes);
    }
    if let Some(timeout_ms) = proxy.u64("timeoutMs")? {
        if !(1..=MAX_FETCH_TIMEOUT_MS).contains(&timeout_ms) {
            return Err(invalid(
                proxy.path("timeoutMs"),
                format!("must be between 1 and {MAX_FETCH_TIMEOUT_MS}"),
            ));
        }
        config.fetch = config.fetch.with_timeout_ms(timeout_ms);
    }
    if let Some(user_agent) = proxy.str("userAgent")? {
        if user_agent.trim().is_empty() {
            return Err(invalid(proxy.path("userAgent"), "must not be empty"));
        }
        config.user_agent = user_agent.to_string();
    }

    let policy = Section::of(raw, "policy")?;
    if let Some(origins) = policy.str_list("allowedOrigins")? {
        config.policy.allowed_origins = origins;
    }
    let file_verbose = policy.bool("verboseErrors")?;
    if let Some(binding) = policy.str("hostBinding")? {
        config.policy.host_binding = binding
            .parse()
            .map_err(|e: String| invalid(policy.path("hostBinding"), e))?;
    }

    let rate = Section::of(raw, "rateLimit")?;
    if let Some(enabled) = rate.bool("enabled")? {
        config.rate_limit.enabled = enabled;
    }
    if let Some(max) = rate.u64("maxRequests")? {
        config.rate_limit.max_requests = u32::try_from(max)
            .ok()
            .filter(|m| *m >= 1)
            .ok_or_else(|| invalid(rate.path("maxRequests"), "must be between 1 and 4294967295"))?;
    }
    if let Some(secs) = rate.u64("windowSecs")? {
        if secs == 0 {
            return Err(invalid(rate.path("windowSecs"), "must be at least 1"));
        }
        config.rate_limit.window = Duration::from_secs(secs);
    }
    if let Some(trust) = rate.bool("trustProxyHeaders")? {
        config.rate_limit.trust_proxy_headers = trust;
    }

    // Environment wins over the file
    if let Some(bind) = lookup(BIND_ENV) {
        config.bind = parse_bind(BIND_ENV, &bind)?;
    }
    if let Some(port) = lookup(PORT_ENV) {
        let port = port
            .trim()
            .parse::<u64>()
            .map_err(|_| invalid(PORT_ENV, "must be a number"))?;
        config.port = parse_port(PORT_ENV, port)?;
    }
    if let Some(origins) = lookup(ALLOWED_ORIGINS_ENV) {
        config.policy.allowed_origins = origins
            .split(',')
            .map(str::trim)
            .filter(|o| !o.is_empty())
            .map(str::to_string)
            .collect();
    }
    if let Some(dev) = lookup(DEV_ENV) {
        config.dev_mode = parse_flag(DEV_ENV, &dev)?;
    }
    let env_verbose = lookup(VERBOSE_ERRORS_ENV)
        .map(|v| parse_flag(VERBOSE_ERRORS_ENV, &v))
        .transpose()?;

    config.policy.verbose_errors = env_verbose.or(file_verbose).unwrap_or(config.dev_mode);

    Ok(config)
}

fn parse_bind(path: &str, value: &str) -> Result<IpAddr, ConfigError> {
    value
        .trim()
        .parse()
        .map_err(|_| invalid(path, format!("'{value}' is not an IP address")))
}

fn parse_port(path: &str, value: u64) -> Result<u16, ConfigError> {
    u16::try_from(value).map_err(|_| invalid(path, "must be between 0 and 65535"))
}

fn parse_flag(path: &str, value: &str) -> Result<bool, ConfigError> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" | "" => Ok(false),
        other => Err(invalid(path, format!("'{other}' is not a boolean"))),
    }
}

/// One top-level object of the raw config
struct Section<'a> {
    name: &'static str,
    obj: Option<&'a Map<String, Value>>,
}

impl<'a> Section<'a> {
    fn of(raw: &'a Value, name: &'static str) -> Result<Self, ConfigError> {
        let obj = match raw.get(name) {
            None | Some(Value::Null) => None,
            Some(Value::Object(obj)) => Some(obj),
            Some(_) => return Err(invalid(name, "must be an object")),
        };
        Ok(Section { name, obj })
    }

    fn path(&self, key: &str) -> String {
        format!("{}.{}", self.name, key)
    }

    fn get(&self, key: &str) -> Option<&'a Value> {
        self.obj.and_then(|o| o.get(key)).filter(|v| !v.is_null())
    }

    fn bool(&self, key: &str) -> Result<Option<bool>, ConfigError> {
        self.get(key)
            .map(|v| v.as_bool().ok_or_else(|| invalid(self.path(key), "must be a boolean")))
            .transpose()
    }

    fn u64(&self, key: &str) -> Result<Option<u64>, ConfigError> {
        self.get(key)
            .map(|v| {
                v.as_u64()
                    .ok_or_else(|| invalid(self.path(key), "must be a non-negative integer"))
            })
            .transpose()
    }

    fn str(&self, key: &str) -> Result<Option<&'a str>, ConfigError> {
        self.get(key)
            .map(|v| v.as_str().ok_or_else(|| invalid(self.path(key), "must be a string")))
            .transpose()
    }

    fn str_list(&self, key: &str) -> Result<Option<Vec<String>>, ConfigError> {
        let Some(value) = self.get(key) else {
            return Ok(None);
        };
        let items = value
            .as_array()
            .ok_or_else(|| invalid(self.path(key), "must be an array of strings"))?;
        items
            .iter()
            .map(|item| {
                item.as_str()
                    .map(str::to_string)
                    .ok_or_else(|| invalid(self.path(key), "must be an array of strings"))
            })
            .collect::<Result<Vec<_>, _>>()
            .map(Some)
    }
}
