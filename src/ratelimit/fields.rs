//! Field extraction: turning a request context into the attribute snapshot
//! used for client correlation.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use crate::error::ThrottleError;

/// An attribute of an inbound request that can take part in correlation.
///
/// The set is closed: every variant has exactly one extraction rule in
/// [`FieldName::extract`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "&'static str")]
pub enum FieldName {
    /// Client (peer) address
    Ip,
    /// `User-Agent` header
    UserAgent,
    /// Cookie jar, compared as a whole mapping
    Cookies,
    /// `Authorization` header
    Auth,
}

impl FieldName {
    /// Configuration name of this field.
    pub fn as_str(&self) -> &'static str {
        match self {
            FieldName::Ip => "ip",
            FieldName::UserAgent => "useragent",
            FieldName::Cookies => "cookies",
            FieldName::Auth => "auth",
        }
    }

    /// Apply this field's extraction rule to a request context.
    ///
    /// Returns `None` when the request does not carry the attribute.
    pub fn extract(&self, ctx: &RequestContext) -> Option<FieldValue> {
        match self {
            FieldName::Ip => ctx.client_addr.clone().map(FieldValue::Text),
            FieldName::UserAgent => ctx.user_agent.clone().map(FieldValue::Text),
            FieldName::Cookies => Some(FieldValue::Map(ctx.cookies.clone())),
            FieldName::Auth => ctx.authorization.clone().map(FieldValue::Text),
        }
    }
}

impl FromStr for FieldName {
    type Err = ThrottleError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "ip" => Ok(FieldName::Ip),
            "useragent" | "user_agent" | "user-agent" => Ok(FieldName::UserAgent),
            "cookies" | "cookie" => Ok(FieldName::Cookies),
            "auth" | "authorization" => Ok(FieldName::Auth),
            _ => Err(ThrottleError::UnknownField(s.to_string())),
        }
    }
}

impl TryFrom<String> for FieldName {
    type Error = ThrottleError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<FieldName> for &'static str {
    fn from(name: FieldName) -> Self {
        name.as_str()
    }
}

impl fmt::Display for FieldName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The value of an extracted attribute.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FieldValue {
    /// Single-valued attribute (address, header)
    Text(String),
    /// Multi-valued attribute (cookies), compared element-wise
    Map(BTreeMap<String, String>),
}

impl FieldValue {
    /// Whether the value carries no information.
    pub fn is_empty(&self) -> bool {
        match self {
            FieldValue::Text(s) => s.is_empty(),
            FieldValue::Map(m) => m.is_empty(),
        }
    }
}

/// Normalized view of an inbound request, supplied by the adapter.
///
/// Values are opaque and already decoded; nothing here is validated.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestContext {
    /// Client address as seen by the host server
    #[serde(default)]
    pub client_addr: Option<String>,
    /// `User-Agent` header value
    #[serde(default)]
    pub user_agent: Option<String>,
    /// Decoded cookies
    #[serde(default)]
    pub cookies: BTreeMap<String, String>,
    /// `Authorization` header value
    #[serde(default)]
    pub authorization: Option<String>,
}

impl RequestContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_client_addr(mut self, addr: impl Into<String>) -> Self {
        self.client_addr = Some(addr.into());
        self
    }

    pub fn with_user_agent(mut self, user_agent: impl Into<String>) -> Self {
        self.user_agent = Some(user_agent.into());
        self
    }

    pub fn with_cookie(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.cookies.insert(name.into(), value.into());
        self
    }

    pub fn with_authorization(mut self, token: impl Into<String>) -> Self {
        self.authorization = Some(token.into());
        self
    }
}

/// The attributes extracted from one request, in configured order.
///
/// Only fields that were present on the request are kept.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FieldSnapshot {
    entries: Vec<(FieldName, FieldValue)>,
}

impl FieldSnapshot {
    /// Extract the configured fields from a request context.
    ///
    /// `fields` is expected to be free of duplicates (configuration
    /// validation guarantees it); a repeated name is still only stored once.
    pub fn extract(ctx: &RequestContext, fields: &[FieldName]) -> Self {
        let mut entries: Vec<(FieldName, FieldValue)> = Vec::with_capacity(fields.len());
        for name in fields {
            if entries.iter().any(|(n, _)| n == name) {
                continue;
            }
            if let Some(value) = name.extract(ctx) {
                entries.push((*name, value));
            }
        }
        Self { entries }
    }

    /// Look up the value of a field.
    pub fn get(&self, name: FieldName) -> Option<&FieldValue> {
        self.entries
            .iter()
            .find(|(n, _)| *n == name)
            .map(|(_, v)| v)
    }

    /// Iterate over the extracted fields in configured order.
    pub fn iter(&self) -> impl Iterator<Item = (FieldName, &FieldValue)> {
        self.entries.iter().map(|(n, v)| (*n, v))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl fmt::Display for FieldSnapshot {
    /// Log-friendly rendering; credentials are not printed.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut first = true;
        for (name, value) in self.iter() {
            if !first {
                f.write_str(",")?;
            }
            first = false;
            match (name, value) {
                (FieldName::Auth, _) => write!(f, "{}=<redacted>", name)?,
                (_, FieldValue::Map(m)) => write!(f, "{}=<{} entries>", name, m.len())?,
                (_, FieldValue::Text(s)) => write!(f, "{}={}", name, s)?,
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn full_context() -> RequestContext {
        RequestContext::new()
            .with_client_addr("10.0.0.1")
            .with_user_agent("curl/8.0")
            .with_cookie("session", "abc")
            .with_authorization("Bearer t0k3n")
    }

    #[test]
    fn test_field_name_parsing() {
        assert_eq!("ip".parse::<FieldName>().unwrap(), FieldName::Ip);
        assert_eq!("UserAgent".parse::<FieldName>().unwrap(), FieldName::UserAgent);
        assert_eq!("cookies".parse::<FieldName>().unwrap(), FieldName::Cookies);
        assert_eq!("auth".parse::<FieldName>().unwrap(), FieldName::Auth);

        let err = "referer".parse::<FieldName>().unwrap_err();
        assert!(matches!(err, ThrottleError::UnknownField(ref f) if f == "referer"));
    }

    #[test]
    fn test_field_name_serde() {
        let names: Vec<FieldName> = serde_yaml::from_str("[ip, auth]").unwrap();
        assert_eq!(names, vec![FieldName::Ip, FieldName::Auth]);
        assert!(serde_yaml::from_str::<Vec<FieldName>>("[ip, host]").is_err());

        assert_eq!(serde_json::to_string(&FieldName::UserAgent).unwrap(), "\"useragent\"");
    }

    #[test]
    fn test_extract_keeps_configured_order() {
        let snapshot = FieldSnapshot::extract(&full_context(), &[FieldName::Auth, FieldName::Ip]);

        let names: Vec<FieldName> = snapshot.iter().map(|(n, _)| n).collect();
        assert_eq!(names, vec![FieldName::Auth, FieldName::Ip]);
        assert_eq!(
            snapshot.get(FieldName::Ip),
            Some(&FieldValue::Text("10.0.0.1".to_string()))
        );
        assert_eq!(snapshot.get(FieldName::UserAgent), None);
    }

    #[test]
    fn test_extract_drops_absent_fields() {
        let ctx = RequestContext::new().with_client_addr("10.0.0.1");
        let snapshot = FieldSnapshot::extract(&ctx, &[FieldName::Ip, FieldName::UserAgent, FieldName::Auth]);

        assert_eq!(snapshot.len(), 1);
        assert!(snapshot.get(FieldName::UserAgent).is_none());
        assert!(snapshot.get(FieldName::Auth).is_none());
    }

    #[test]
    fn test_cookies_always_extracted() {
        let snapshot = FieldSnapshot::extract(&RequestContext::new(), &[FieldName::Cookies]);

        let cookies = snapshot.get(FieldName::Cookies).unwrap();
        assert!(cookies.is_empty());
    }

    #[test]
    fn test_duplicate_fields_stored_once() {
        let snapshot = FieldSnapshot::extract(&full_context(), &[FieldName::Ip, FieldName::Ip]);
        assert_eq!(snapshot.len(), 1);
    }

    #[test]
    fn test_display_redacts_credentials() {
        let snapshot = FieldSnapshot::extract(
            &full_context(),
            &[FieldName::Ip, FieldName::UserAgent, FieldName::Cookies, FieldName::Auth],
        );
        let rendered = snapshot.to_string();

        assert!(rendered.contains("ip=10.0.0.1"));
        assert!(rendered.contains("auth=<redacted>"));
        assert!(rendered.contains("cookies=<1 entries>"));
        assert!(!rendered.contains("t0k3n"));
    }
}
