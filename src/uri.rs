//! Canonical entity identities.
//!
//! Every entity in the registry is addressed by a URI of the form
//! `{namespace}/{version}/{name}`:
//!
//! - `namespace` starts with `http://` or `https://` and may itself contain `/`
//! - `version` is one to three dot-separated numeric groups (`1`, `0.1`, `1.2.3`)
//! - `name` is a single segment without `/`, `#` or `?`
//!
//! Equality, ordering and hashing are those of the canonical string. No
//! normalisation happens beyond stripping trailing `/` from a namespace when an
//! identity is composed from its parts.
//!
//! # Greedy namespace
//!
//! The namespace capture is greedy: it takes as much as possible before the
//! version segment. A namespace whose last path segment looks like a version is
//! therefore read as part of the namespace (`http://x.org/1/0.2/Name` has the
//! namespace `http://x.org/1`). This is the documented behavior of the grammar
//! and is not second-guessed here.

use std::fmt;
use std::str::FromStr;
use std::sync::OnceLock;

use regex::Regex;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Anchored grammar for entity identities.
pub const URI_PATTERN: &str =
    r"^(?P<namespace>https?://.+)/(?P<version>\d(?:\.\d+){0,2})/(?P<name>[^/#?]+)$";

/// The version segment of [`URI_PATTERN`] on its own.
pub const VERSION_PATTERN: &str = r"^\d(?:\.\d+){0,2}$";

static URI_REGEX: OnceLock<Regex> = OnceLock::new();
static VERSION_REGEX: OnceLock<Regex> = OnceLock::new();

fn uri_regex() -> &'static Regex {
    URI_REGEX.get_or_init(|| {
        Regex::new(URI_PATTERN).expect("URI_PATTERN is a valid regular expression")
    })
}

fn version_regex() -> &'static Regex {
    VERSION_REGEX.get_or_init(|| {
        Regex::new(VERSION_PATTERN).expect("VERSION_PATTERN is a valid regular expression")
    })
}

/// Error returned when a candidate string does not match the identity grammar.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("Invalid entity URI: {candidate}")]
pub struct UriError {
    /// The rejected input.
    pub candidate: String,
}

/// Canonical identity of an entity.
///
/// # Examples
///
/// ```
/// use entities_registry::EntityUri;
///
/// let uri: EntityUri = "http://onto-ns.com/meta/0.1/Person".parse().unwrap();
/// assert_eq!(uri.namespace(), "http://onto-ns.com/meta");
/// assert_eq!(uri.version(), "0.1");
/// assert_eq!(uri.name(), "Person");
/// assert_eq!(uri.to_string(), "http://onto-ns.com/meta/0.1/Person");
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct EntityUri {
    // Field order matters: the derived orderings compare the canonical string first,
    // and the offsets are fully determined by it.
    canonical: String,
    namespace_end: usize,
    version_end: usize,
}

impl EntityUri {
    /// Parses a candidate identity against the canonical grammar.
    ///
    /// # Errors
    /// Returns [`UriError`] when the whole string does not match.
    pub fn parse(candidate: &str) -> Result<Self, UriError> {
        let reject = || UriError {
            candidate: candidate.to_string(),
        };

        let caps = uri_regex().captures(candidate).ok_or_else(reject)?;
        let namespace = caps.name("namespace").ok_or_else(reject)?;
        let version = caps.name("version").ok_or_else(reject)?;

        Ok(Self {
            canonical: candidate.to_string(),
            namespace_end: namespace.end(),
            version_end: version.end(),
        })
    }

    /// Composes an identity from its parts.
    ///
    /// Trailing `/` characters are stripped from the namespace before
    /// composition, and the result is validated against the grammar.
    ///
    /// # Errors
    /// Returns [`UriError`] when the composed string is not a valid identity.
    pub fn new(namespace: &str, version: &str, name: &str) -> Result<Self, UriError> {
        Self::parse(&compose(namespace, version, name))
    }

    /// The namespace, e.g. `http://onto-ns.com/meta`.
    #[must_use]
    pub fn namespace(&self) -> &str {
        &self.canonical[..self.namespace_end]
    }

    /// The version string, e.g. `0.1`.
    #[must_use]
    pub fn version(&self) -> &str {
        &self.canonical[self.namespace_end + 1..self.version_end]
    }

    /// The entity name, e.g. `Person`.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.canonical[self.version_end + 1..]
    }

    /// The canonical `{namespace}/{version}/{name}` string.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.canonical
    }

    /// Consumes the identity and returns its canonical string.
    #[must_use]
    pub fn into_string(self) -> String {
        self.canonical
    }
}

/// Composes the canonical string from parts without validating it.
pub(crate) fn compose(namespace: &str, version: &str, name: &str) -> String {
    format!("{}/{version}/{name}", namespace.trim_end_matches('/'))
}

/// Returns true if `candidate` matches the identity grammar.
#[must_use]
pub fn is_valid_uri(candidate: &str) -> bool {
    uri_regex().is_match(candidate)
}

/// Returns true if `candidate` is a well-formed version segment.
#[must_use]
pub fn is_valid_version(candidate: &str) -> bool {
    version_regex().is_match(candidate)
}

/// Parses every candidate, failing on the first malformed one.
///
/// # Errors
/// Returns the [`UriError`] of the first candidate that does not parse.
pub fn parse_all<I, S>(candidates: I) -> Result<Vec<EntityUri>, UriError>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    candidates
        .into_iter()
        .map(|c| EntityUri::parse(c.as_ref()))
        .collect()
}

impl fmt::Display for EntityUri {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.canonical)
    }
}

impl FromStr for EntityUri {
    type Err = UriError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl TryFrom<String> for EntityUri {
    type Error = UriError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<EntityUri> for String {
    fn from(uri: EntityUri) -> Self {
        uri.canonical
    }
}

impl AsRef<str> for EntityUri {
    fn as_ref(&self) -> &str {
        &self.canonical
    }
}
