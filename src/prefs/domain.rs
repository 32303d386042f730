//! Domain normalization and subdomain coverage.
//!
//! Preferences are grouped by **host**. Callers may pass either a bare hostname
//! (`"a.com"`) or a full URI (`"http://a.com/huh"`); both reduce to the same
//! [`Host`], so they address the same preferences.
use std::fmt::Display;

use serde::{Deserialize, Serialize};
use url::Url;

use crate::errors::PrefsError;

/// A canonical lowercase hostname without scheme, path, port or trailing dot.
///
/// Serialized as a plain string; deserialization goes through [`normalize`].
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Host(String);

impl TryFrom<String> for Host {
    type Error = PrefsError;

    fn try_from(raw: String) -> Result<Self, Self::Error> {
        normalize(&raw)
    }
}

impl From<Host> for String {
    fn from(host: Host) -> Self {
        host.0
    }
}

impl Host {
    /// Parses `input` into a host. See [`normalize`].
    pub fn parse(input: &str) -> Result<Self, PrefsError> {
        normalize(input)
    }

    /// Wraps a string that is already in canonical form (as read back from a store).
    pub(crate) fn from_canonical(host: String) -> Self {
        Host(host)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Returns true when `candidate` is this host or one of its subdomains.
    pub fn covers(&self, candidate: &Host) -> bool {
        covers(self, candidate)
    }
}

impl Display for Host {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for Host {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Reduces a bare hostname or a URI to its canonical [`Host`].
///
/// Inputs without a scheme are parsed as if they were `http://` URLs, which
/// lets `"a.com:8080/path"` and `"http://A.com/"` both end up as `a.com`.
/// Fails with [`PrefsError::InvalidDomain`] for empty input, input that is not
/// a URL, and URLs without a host (`file:///tmp`, `about:blank`).
pub fn normalize(input: &str) -> Result<Host, PrefsError> {
    let trimmed = input.trim();
    if trimmed.is_empty() {
        return Err(PrefsError::InvalidDomain(input.to_string()));
    }

    let parsed = if trimmed.contains("://") {
        Url::parse(trimmed)
    } else {
        Url::parse(&format!("http://{}", trimmed))
    };
    let url = parsed.map_err(|_| PrefsError::InvalidDomain(input.to_string()))?;

    let host = url
        .host_str()
        .map(|h| h.trim_end_matches('.').to_ascii_lowercase())
        .unwrap_or_default();
    if host.is_empty() {
        return Err(PrefsError::InvalidDomain(input.to_string()));
    }

    Ok(Host(host))
}

/// Hierarchical suffix match: `candidate` equals `ancestor` or ends with
/// `"." + ancestor`. `b.a.com` is covered by `a.com`, `ba.com` is not.
pub fn covers(ancestor: &Host, candidate: &Host) -> bool {
    let (a, c) = (ancestor.as_str(), candidate.as_str());
    c == a || c.ends_with(&format!(".{}", a))
}
