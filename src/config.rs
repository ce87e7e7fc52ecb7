//! Configuration management for window-throttle.
//!
//! Settings are read in layers (base file, production overrides, optional
//! development overrides, then environment variables) and the rate limiting
//! section is validated into an immutable [`LimiterConfig`] at startup.

use chrono::TimeDelta;
use http::StatusCode;
use serde::de::{self, Visitor};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::path::Path;
use std::time::Duration;
use tracing::info;

use crate::error::{Result, ThrottleError};
use crate::ratelimit::{FieldName, MatchMethod};

/// Prefix for environment variable overrides, e.g.
/// `THROTTLE_SERVICE__RATE_LIMIT__LIMIT=5`.
pub const ENV_PREFIX: &str = "THROTTLE";

/// Environment variable that enables the development config layer.
pub const DEVMODE_ENV: &str = "THROTTLE_DEVMODE";

/// Config file stems, lowest precedence first.
const BASE_LAYERS: [&str; 2] = ["config", "prod.config"];
const DEV_LAYER: &str = "dev.config";

/// Extensions tried for each layer, in lookup order.
const LAYER_EXTENSIONS: [&str; 3] = ["yaml", "yml", "json"];

/// Environment variable that overrides the deny message.
const MESSAGE_ENV: &str = "THROTTLE_SERVICE__RATE_LIMIT__MESSAGE";

/// Main configuration for the service.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ThrottleConfig {
    /// Logging configuration
    #[serde(default)]
    pub log: LogConfig,

    /// Request-path services
    #[serde(default)]
    pub service: ServiceConfig,
}

/// Services applied to inbound requests.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ServiceConfig {
    /// Sliding-window rate limiting
    #[serde(default)]
    pub rate_limit: RateLimitSettings,
}

/// Logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogConfig {
    /// Default filter directive, overridden by `RUST_LOG`
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Output format for log lines
    #[serde(default)]
    pub format: LogFormat,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: LogFormat::default(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Log line format.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Pretty,
    Json,
}

/// Raw rate limiting settings as written in configuration files.
///
/// Nothing here is defaulted when limiting is enabled; see
/// [`RateLimitSettings::validate`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitSettings {
    /// Whether rate limiting is enabled
    #[serde(default)]
    pub enable: bool,

    /// Length of the sliding window
    #[serde(default)]
    pub window_time: Option<WindowTime>,

    /// Number of correlated prior requests tolerated inside the window
    #[serde(default)]
    pub limit: Option<u64>,

    /// Field(s) used to decide whether two requests come from the same client
    #[serde(default)]
    pub match_fields: Option<OneOrMany>,

    /// `and` or `or`
    #[serde(default)]
    pub match_method: Option<String>,

    /// Status code returned when a request is denied
    #[serde(default = "default_status_code")]
    pub status_code: u16,

    /// Message returned when a request is denied (string, list or map)
    #[serde(default)]
    pub message: Option<serde_json::Value>,
}

impl Default for RateLimitSettings {
    fn default() -> Self {
        Self {
            enable: false,
            window_time: None,
            limit: None,
            match_fields: None,
            match_method: None,
            status_code: default_status_code(),
            message: None,
        }
    }
}

fn default_status_code() -> u16 {
    StatusCode::TOO_MANY_REQUESTS.as_u16()
}

impl RateLimitSettings {
    /// Validate the settings into a [`LimiterConfig`].
    ///
    /// Returns `Ok(None)` when limiting is disabled. When enabled, a missing
    /// window, limit, field list or match method is an error.
    pub fn validate(&self) -> Result<Option<LimiterConfig>> {
        if !self.enable {
            return Ok(None);
        }

        let window = self
            .window_time
            .ok_or(ThrottleError::MissingSetting("window_time"))?;
        let limit = self.limit.ok_or(ThrottleError::MissingSetting("limit"))?;
        let fields = self
            .match_fields
            .as_ref()
            .ok_or(ThrottleError::MissingSetting("match_fields"))?;
        let method: MatchMethod = self
            .match_method
            .as_deref()
            .ok_or(ThrottleError::MissingSetting("match_method"))?
            .parse()?;

        let fields = fields
            .iter()
            .map(|f| f.parse::<FieldName>())
            .collect::<Result<Vec<_>>>()?;

        let mut config = LimiterConfig::new(window.into(), limit, fields, method)?
            .with_status_code(self.status_code)?;
        if let Some(message) = &self.message {
            config = config.with_message(message.clone());
        }
        Ok(Some(config))
    }
}

/// A single value or a list of values.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum OneOrMany {
    One(String),
    Many(Vec<String>),
}

impl OneOrMany {
    pub fn iter(&self) -> impl Iterator<Item = &str> {
        let items: &[String] = match self {
            OneOrMany::One(item) => std::slice::from_ref(item),
            OneOrMany::Many(items) => items,
        };
        items.iter().map(String::as_str)
    }
}

/// Validated, immutable rate limiter configuration.
#[derive(Debug, Clone, PartialEq)]
pub struct LimiterConfig {
    window: TimeDelta,
    limit: u64,
    match_fields: Vec<FieldName>,
    match_method: MatchMethod,
    status_code: StatusCode,
    message: Option<serde_json::Value>,
}

impl LimiterConfig {
    /// Create a configuration denying with `429 Too Many Requests`.
    ///
    /// Duplicate field names are collapsed, keeping the first occurrence.
    pub fn new(
        window: Duration,
        limit: u64,
        match_fields: Vec<FieldName>,
        match_method: MatchMethod,
    ) -> Result<Self> {
        let window = TimeDelta::from_std(window)
            .map_err(|e| ThrottleError::InvalidDuration(format!("{:?}: {}", window, e)))?;

        let mut fields: Vec<FieldName> = Vec::with_capacity(match_fields.len());
        for field in match_fields {
            if !fields.contains(&field) {
                fields.push(field);
            }
        }
        if fields.is_empty() {
            return Err(ThrottleError::Config(
                "`match_fields` must name at least one field".to_string(),
            ));
        }

        Ok(Self {
            window,
            limit,
            match_fields: fields,
            match_method,
            status_code: StatusCode::TOO_MANY_REQUESTS,
            message: None,
        })
    }

    /// Use a different deny status code.
    pub fn with_status_code(mut self, code: u16) -> Result<Self> {
        self.status_code =
            StatusCode::from_u16(code).map_err(|_| ThrottleError::InvalidStatusCode(code))?;
        Ok(self)
    }

    /// Use a custom deny message.
    pub fn with_message(mut self, message: impl Into<serde_json::Value>) -> Self {
        self.message = Some(message.into());
        self
    }

    pub fn window(&self) -> TimeDelta {
        self.window
    }

    /// Inclusive capacity: the number of correlated prior requests tolerated.
    pub fn limit(&self) -> u64 {
        self.limit
    }

    pub fn match_fields(&self) -> &[FieldName] {
        &self.match_fields
    }

    pub fn match_method(&self) -> MatchMethod {
        self.match_method
    }

    pub fn status_code(&self) -> StatusCode {
        self.status_code
    }

    /// The deny message, defaulting to the status code's reason phrase.
    pub fn message(&self) -> serde_json::Value {
        match &self.message {
            Some(message) => message.clone(),
            None => serde_json::Value::String(
                self.status_code
                    .canonical_reason()
                    .unwrap_or("Rate limit exceeded")
                    .to_string(),
            ),
        }
    }
}

/// A window length accepted in several notations.
///
/// Numbers are seconds; strings may be ISO-8601 durations (`PT10S`,
/// `P1DT2H`) or short forms (`10s`, `500ms`, `5m`, `1h`, `1d`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowTime(pub Duration);

impl From<WindowTime> for Duration {
    fn from(value: WindowTime) -> Self {
        value.0
    }
}

impl std::str::FromStr for WindowTime {
    type Err = ThrottleError;

    fn from_str(s: &str) -> Result<Self> {
        parse_duration(s).map(WindowTime)
    }
}

impl Serialize for WindowTime {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        if self.0.subsec_nanos() == 0 {
            serializer.serialize_u64(self.0.as_secs())
        } else {
            serializer.serialize_f64(self.0.as_secs_f64())
        }
    }
}

impl<'de> Deserialize<'de> for WindowTime {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        struct WindowTimeVisitor;

        impl<'de> Visitor<'de> for WindowTimeVisitor {
            type Value = WindowTime;

            fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
                f.write_str("a number of seconds or a duration string such as `PT10S` or `10s`")
            }

            fn visit_u64<E: de::Error>(self, v: u64) -> std::result::Result<WindowTime, E> {
                Ok(WindowTime(Duration::from_secs(v)))
            }

            fn visit_i64<E: de::Error>(self, v: i64) -> std::result::Result<WindowTime, E> {
                u64::try_from(v)
                    .map(|secs| WindowTime(Duration::from_secs(secs)))
                    .map_err(|_| E::custom(format!("window_time must not be negative: {}", v)))
            }

            fn visit_f64<E: de::Error>(self, v: f64) -> std::result::Result<WindowTime, E> {
                Duration::try_from_secs_f64(v)
                    .map(WindowTime)
                    .map_err(|e| E::custom(format!("invalid window_time {}: {}", v, e)))
            }

            fn visit_str<E: de::Error>(self, v: &str) -> std::result::Result<WindowTime, E> {
                parse_duration(v).map(WindowTime).map_err(E::custom)
            }
        }

        deserializer.deserialize_any(WindowTimeVisitor)
    }
}

/// Parse a duration written as seconds, ISO-8601 or a short form.
pub fn parse_duration(input: &str) -> Result<Duration> {
    let s = input.trim();
    let invalid = || ThrottleError::InvalidDuration(input.to_string());

    let secs = if let Some(rest) = s.strip_prefix('P') {
        parse_iso8601(rest).ok_or_else(invalid)?
    } else {
        parse_short(s).ok_or_else(invalid)?
    };

    Duration::try_from_secs_f64(secs).map_err(|_| invalid())
}

/// `[nW][nD][T[nH][nM][nS]]`; years and months have no fixed length.
fn parse_iso8601(rest: &str) -> Option<f64> {
    let (date, time) = match rest.split_once('T') {
        Some((date, time)) => (date, Some(time)),
        None => (rest, None),
    };

    let mut total = sum_designators(date, &[('W', 604_800.0), ('D', 86_400.0)])?;
    if let Some(time) = time {
        if time.is_empty() {
            return None;
        }
        total += sum_designators(time, &[('H', 3_600.0), ('M', 60.0), ('S', 1.0)])?;
    } else if date.is_empty() {
        return None;
    }
    Some(total)
}

fn sum_designators(part: &str, units: &[(char, f64)]) -> Option<f64> {
    let mut total = 0.0;
    let mut number = String::new();
    for c in part.chars() {
        if c.is_ascii_digit() || c == '.' || c == ',' {
            number.push(if c == ',' { '.' } else { c });
            continue;
        }
        let (_, factor) = units.iter().find(|(unit, _)| *unit == c)?;
        let value: f64 = number.parse().ok()?;
        total += value * factor;
        number.clear();
    }
    number.is_empty().then_some(total)
}

fn parse_short(s: &str) -> Option<f64> {
    let split = s
        .find(|c: char| !(c.is_ascii_digit() || c == '.'))
        .unwrap_or(s.len());
    let (number, unit) = s.split_at(split);
    let value: f64 = number.parse().ok()?;
    match unit.trim() {
        "" | "s" | "sec" | "secs" => Some(value),
        "ms" => Some(value / 1_000.0),
        "m" | "min" | "mins" => Some(value * 60.0),
        "h" | "hr" | "hrs" => Some(value * 3_600.0),
        "d" | "day" | "days" => Some(value * 86_400.0),
        _ => None,
    }
}

impl ThrottleConfig {
    /// Load configuration from a YAML file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        info!(path = %path.display(), "Loading configuration");

        let contents = std::fs::read_to_string(path)?;
        Self::from_yaml(&contents)
    }

    /// Load configuration from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        serde_yaml::from_str(yaml)
            .map_err(|e| ThrottleError::Config(format!("Failed to parse configuration: {}", e)))
    }

    /// Load the layered configuration from `dir`.
    ///
    /// Reads `config.*`, then `prod.config.*`, then `dev.config.*` when
    /// `dev_mode` is set (YAML or JSON, missing files skipped), and finally
    /// `THROTTLE_`-prefixed environment variables. Later layers win.
    pub fn load<P: AsRef<Path>>(dir: P, dev_mode: bool) -> Result<Self> {
        let dir = dir.as_ref();
        let mut builder = config::Config::builder();

        let layers: Vec<&str> = BASE_LAYERS
            .iter()
            .copied()
            .chain(dev_mode.then_some(DEV_LAYER))
            .collect();
        for layer in &layers {
            let stem = dir.join(layer);
            builder = builder
                .add_source(config::File::with_name(&stem.to_string_lossy()).required(false));
        }

        builder = builder.add_source(
            config::Environment::with_prefix(ENV_PREFIX)
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true)
                .list_separator(",")
                .with_list_parse_key("service.rate_limit.match_fields"),
        );

        let mut config: ThrottleConfig = builder.build()?.try_deserialize()?;

        // The layered loader lowercases every key, including those of a
        // map-valued message; the message is taken verbatim from the files.
        if std::env::var_os(MESSAGE_ENV).is_none() {
            if let Some(message) = raw_message(dir, &layers)? {
                config.service.rate_limit.message = Some(message);
            }
        }
        Ok(config)
    }

    /// Validated rate limiter configuration, `None` when limiting is disabled.
    pub fn limiter_config(&self) -> Result<Option<LimiterConfig>> {
        self.service.rate_limit.validate()
    }

    /// Render the effective configuration as YAML.
    pub fn to_yaml(&self) -> Result<String> {
        serde_yaml::to_string(self)
            .map_err(|e| ThrottleError::Config(format!("Failed to render configuration: {}", e)))
    }

    /// Write the effective configuration, for use as a template.
    pub fn write_merged<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let path = path.as_ref();
        std::fs::write(path, self.to_yaml()?)?;
        info!(path = %path.display(), "Wrote merged configuration");
        Ok(())
    }
}

/// The deny message from the highest-precedence layer file defining one.
fn raw_message(dir: &Path, layers: &[&str]) -> Result<Option<serde_json::Value>> {
    let mut message = None;
    for layer in layers {
        let Some(path) = LAYER_EXTENSIONS
            .iter()
            .map(|ext| dir.join(format!("{}.{}", layer, ext)))
            .find(|path| path.is_file())
        else {
            continue;
        };

        let contents = std::fs::read_to_string(&path)?;
        let document: serde_yaml::Value = serde_yaml::from_str(&contents).map_err(|e| {
            ThrottleError::Config(format!("Failed to parse {}: {}", path.display(), e))
        })?;

        let found = child(&document, "service")
            .and_then(|service| child(service, "rate_limit"))
            .and_then(|rate_limit| child(rate_limit, "message"));
        if let Some(value) = found {
            message = match value {
                serde_yaml::Value::Null => None,
                value => Some(serde_json::to_value(value)?),
            };
        }
    }
    Ok(message)
}

/// Look up a structural key the way the layered loader does, ignoring case.
fn child<'a>(value: &'a serde_yaml::Value, key: &str) -> Option<&'a serde_yaml::Value> {
    value.as_mapping()?.iter().find_map(|(k, v)| {
        k.as_str()
            .filter(|k| k.eq_ignore_ascii_case(key))
            .map(|_| v)
    })
}

/// Whether the development layer was requested through the environment.
pub fn dev_mode_from_env() -> bool {
    std::env::var(DEVMODE_ENV)
        .map(|v| v.trim() == "1")
        .unwrap_or(false)
}
