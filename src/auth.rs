use std::collections::HashMap;
use std::fmt;
use thiserror::Error;

use crate::config::ConfigError;

const BEARER_SCHEME: &str = "Bearer";

// Caller resolved from an API key, also the rate limiting unit
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ClientIdentity(String);

impl ClientIdentity {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ClientIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

// Display strings are the exact messages sent back in the 401 body
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum AuthError {
    #[error("Missing Authorization header")]
    MissingCredential,

    #[error("Invalid Authorization format. Expected: Bearer <key>")]
    MalformedCredential,

    #[error("Invalid API key")]
    UnknownCredential,
}

impl AuthError {
    // Stable label for logs and metrics
    pub fn reason(&self) -> &'static str {
        match self {
            AuthError::MissingCredential => "missing",
            AuthError::MalformedCredential => "malformed",
            AuthError::UnknownCredential => "unknown",
        }
    }
}

// API key -> client identity, loaded once at startup and never mutated
#[derive(Debug, Clone)]
pub struct ApiKeyRegistry {
    keys: HashMap<String, ClientIdentity>,
}

impl ApiKeyRegistry {
    #[cfg(test)]
    pub fn new<K, I>(entries: impl IntoIterator<Item = (K, I)>) -> Self
    where
        K: Into<String>,
        I: Into<String>,
    {
        let keys = entries
            .into_iter()
            .map(|(key, id)| (key.into(), ClientIdentity::new(id)))
            .collect();
        Self { keys }
    }

    // Parse from "key=identity,key=identity"
    pub fn parse(raw: &str) -> Result<Self, ConfigError> {
        let mut keys = HashMap::new();

        for entry in raw.split(',').map(|s| s.trim()).filter(|s| !s.is_empty()) {
            let (key, id) = entry
                .split_once('=')
                .ok_or_else(|| ConfigError::MissingSeparator(redact(entry)))?;
            let (key, id) = (key.trim(), id.trim());

            if key.is_empty() {
                return Err(ConfigError::EmptyKey(redact(entry)));
            }
            if id.is_empty() {
                return Err(ConfigError::EmptyIdentity(redact(entry)));
            }
            if keys.insert(key.to_string(), ClientIdentity::new(id)).is_some() {
                return Err(ConfigError::DuplicateKey(id.to_string()));
            }
        }

        if keys.is_empty() {
            return Err(ConfigError::EmptyRegistry);
        }
        Ok(Self { keys })
    }

    pub fn lookup(&self, key: &str) -> Option<&ClientIdentity> {
        self.keys.get(key)
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }
}

// Keep key material out of startup errors
fn redact(entry: &str) -> String {
    match entry.split_once('=') {
        Some((_, id)) => format!("<redacted>={}", id.trim()),
        None => "<redacted>".to_string(),
    }
}

// Ok(None) is the health-check bypass, admitted without an identity
pub fn authenticate(
    registry: &ApiKeyRegistry,
    health_path: &str,
    path: &str,
    authorization: Option<&str>,
) -> Result<Option<ClientIdentity>, AuthError> {
    if path == health_path {
        return Ok(None);
    }

    let header = match authorization {
        Some(value) if !value.is_empty() => value,
        _ => return Err(AuthError::MissingCredential),
    };

    let mut parts = header.split(' ');
    let (scheme, key) = match (parts.next(), parts.next(), parts.next()) {
        (Some(scheme), Some(key), None) => (scheme, key),
        _ => return Err(AuthError::MalformedCredential),
    };
    if scheme != BEARER_SCHEME || key.is_empty() {
        return Err(AuthError::MalformedCredential);
    }

    registry
        .lookup(key)
        .cloned()
        .map(Some)
        .ok_or(AuthError::UnknownCredential)
}
