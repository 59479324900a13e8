//! Canonical requester identities.
//!
//! Upstream callers do not always hand over a clean string: numeric ids,
//! structured sender objects and even serialized JSON show up. Everything is
//! normalized to a lowercase `user@domain` form before it touches a store.

// lazy_regex! uses once_cell internally
#![allow(clippy::non_std_lazy_statics)]

use lazy_regex::lazy_regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

static RE_USER: lazy_regex::Lazy<regex::Regex> = lazy_regex!(r"^[a-z0-9._+\-]+$");
static RE_DOMAIN: lazy_regex::Lazy<regex::Regex> = lazy_regex!(r"^[a-z0-9.\-]+$");

/// Canonical `user@domain` identity
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Identity(String);

impl Identity {
    /// The canonical string
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The part before `@`
    #[must_use]
    pub fn user(&self) -> &str {
        self.0.split_once('@').map_or(self.0.as_str(), |(user, _)| user)
    }
}

impl fmt::Display for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for Identity {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Identity input as received from a caller
#[derive(Debug, Clone, PartialEq)]
pub enum RawIdentity {
    /// Plain text, possibly already `user@domain`
    Text(String),
    /// Numeric user id
    Numeric(i64),
    /// Structured sender object
    Structured(Value),
}

impl From<&str> for RawIdentity {
    fn from(value: &str) -> Self {
        Self::Text(value.to_string())
    }
}

impl From<String> for RawIdentity {
    fn from(value: String) -> Self {
        Self::Text(value)
    }
}

impl From<&String> for RawIdentity {
    fn from(value: &String) -> Self {
        Self::Text(value.clone())
    }
}

impl From<i64> for RawIdentity {
    fn from(value: i64) -> Self {
        Self::Numeric(value)
    }
}

impl From<Value> for RawIdentity {
    fn from(value: Value) -> Self {
        Self::Structured(value)
    }
}

impl From<&Identity> for RawIdentity {
    fn from(value: &Identity) -> Self {
        Self::Text(value.0.clone())
    }
}

impl From<Identity> for RawIdentity {
    fn from(value: Identity) -> Self {
        Self::Text(value.0)
    }
}

/// Maps raw identity inputs onto canonical identities
#[derive(Debug, Clone)]
pub struct IdentityNormalizer {
    default_domain: String,
}

impl IdentityNormalizer {
    /// Bare user ids get `default_domain` appended
    #[must_use]
    pub fn new(default_domain: &str) -> Self {
        Self {
            default_domain: default_domain.trim().to_lowercase(),
        }
    }

    /// Normalize any accepted input, `None` when nothing usable is found
    pub fn normalize(&self, raw: impl Into<RawIdentity>) -> Option<Identity> {
        match raw.into() {
            RawIdentity::Text(text) => self.from_text(&text),
            RawIdentity::Numeric(id) => self.compose(&id.to_string(), None),
            RawIdentity::Structured(value) => self.from_value(&value),
        }
    }

    fn from_text(&self, text: &str) -> Option<Identity> {
        let text = text.trim();
        // Serialized sender objects end up here as strings
        if text.starts_with('{') {
            let value: Value = serde_json::from_str(text).ok()?;
            return self.from_value(&value);
        }
        match text.split_once('@') {
            Some((user, domain)) => self.compose(user, Some(domain)),
            None => self.compose(text, None),
        }
    }

    fn from_value(&self, value: &Value) -> Option<Identity> {
        match value {
            Value::String(text) => self.from_text(text),
            Value::Number(number) => number
                .as_i64()
                .and_then(|id| self.compose(&id.to_string(), None)),
            Value::Object(map) => {
                if let Some(serialized) = map.get("_serialized").and_then(Value::as_str) {
                    return self.from_text(serialized);
                }
                let user = map.get("user").or_else(|| map.get("id"))?;
                let user = match user {
                    Value::String(s) => s.clone(),
                    Value::Number(n) => n.to_string(),
                    Value::Object(_) => return self.from_value(user),
                    _ => return None,
                };
                let domain = map
                    .get("server")
                    .or_else(|| map.get("domain"))
                    .and_then(Value::as_str);
                match domain {
                    Some(domain) => self.compose(&user, Some(domain)),
                    None => self.from_text(&user),
                }
            }
            _ => None,
        }
    }

    fn compose(&self, user: &str, domain: Option<&str>) -> Option<Identity> {
        let user = user.trim().trim_start_matches('+').to_lowercase();
        let domain = domain.map_or_else(|| self.default_domain.clone(), |d| d.trim().to_lowercase());
        if user.is_empty() || domain.is_empty() {
            return None;
        }
        if !RE_USER.is_match(&user) || !RE_DOMAIN.is_match(&domain) {
            return None;
        }
        Some(Identity(format!("{user}@{domain}")))
    }
}
