//! Credential handling for provisioning.
//!
//! Credentials end up in places that get logged (clone URLs, container
//! environment). [`Secret`] keeps a value out of `Debug`/`Display` output and
//! [`Redactor`] scrubs known values from free-form text.

use std::fmt;

/// A value that must never be printed verbatim.
#[derive(Clone, PartialEq, Eq)]
pub struct Secret(String);

impl Secret {
    /// Wraps `value`.
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    /// Returns the raw value. Only pass this to the process that needs it.
    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Secret([REDACTED])")
    }
}

impl fmt::Display for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("[REDACTED]")
    }
}

/// Builds an HTTPS clone URL with `token` embedded as basic-auth credentials.
///
/// Non-HTTPS URLs and URLs without a token are returned unchanged.
pub fn authenticated_clone_url(repo_url: &str, token: Option<&str>) -> Secret {
    let token = match token {
        Some(t) if !t.is_empty() => t,
        _ => return Secret::new(repo_url),
    };

    match repo_url.strip_prefix("https://") {
        Some(rest) => {
            // Drop any credentials already present in the URL.
            let host_and_path = rest.split_once('@').map(|(_, r)| r).unwrap_or(rest);
            Secret::new(format!("https://x-access-token:{}@{}", token, host_and_path))
        }
        None => Secret::new(repo_url),
    }
}

/// Replaces known secret values in text with `[REDACTED:<name>]`.
#[derive(Debug, Clone, Default)]
pub struct Redactor {
    /// (name, value), longest value first so overlapping secrets redact fully.
    secrets: Vec<(String, Secret)>,
}

impl Redactor {
    /// Creates an empty redactor.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a secret value under `name`. Empty values are ignored.
    pub fn add(&mut self, name: impl Into<String>, value: &Secret) {
        if value.expose().is_empty() || self.secrets.iter().any(|(_, v)| v == value) {
            return;
        }
        self.secrets.push((name.into(), value.clone()));
        self.secrets
            .sort_by(|a, b| b.1.expose().len().cmp(&a.1.expose().len()));
    }

    /// Builder form of [`Redactor::add`].
    pub fn with(mut self, name: impl Into<String>, value: &Secret) -> Self {
        self.add(name, value);
        self
    }

    /// Redacts all known secret values from `text`.
    pub fn redact(&self, text: &str) -> String {
        let mut result = text.to_string();
        for (name, value) in &self.secrets {
            result = result.replace(value.expose(), &format!("[REDACTED:{}]", name));
        }
        result
    }

    /// Returns the number of registered secrets.
    pub fn len(&self) -> usize {
        self.secrets.len()
    }

    /// Returns true if no secrets are registered.
    pub fn is_empty(&self) -> bool {
        self.secrets.is_empty()
    }
}
