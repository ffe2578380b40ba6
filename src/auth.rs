//! Write-access verification.
//!
//! Token issuance and validation belong to an external collaborator; the
//! registry only consumes a single `verify` capability and calls it before
//! every mutating operation.

use std::fmt;

use thiserror::Error;

/// Errors returned by an [`AccessVerifier`].
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AuthError {
    #[error("missing credentials")]
    MissingCredentials,

    #[error("invalid credentials")]
    InvalidCredentials,
}

/// Credentials presented with a write request.
#[derive(Clone, Default, PartialEq, Eq)]
pub struct Credentials {
    bearer: Option<String>,
}

impl Credentials {
    /// No credentials at all.
    #[must_use]
    pub const fn anonymous() -> Self {
        Self { bearer: None }
    }

    /// A bearer token.
    #[must_use]
    pub fn bearer(token: impl Into<String>) -> Self {
        Self {
            bearer: Some(token.into()),
        }
    }

    /// The bearer token, if any.
    #[must_use]
    pub fn token(&self) -> Option<&str> {
        self.bearer.as_deref()
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("bearer", &self.bearer.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

/// The `verify` capability gating the write path.
pub trait AccessVerifier: Send + Sync {
    /// Checks that `credentials` grant write access.
    ///
    /// # Errors
    /// Returns [`AuthError`] when access is denied.
    fn verify(&self, credentials: &Credentials) -> Result<(), AuthError>;
}

/// Grants write access to everyone.
#[derive(Debug, Clone, Copy, Default)]
pub struct AllowAll;

impl AccessVerifier for AllowAll {
    fn verify(&self, _credentials: &Credentials) -> Result<(), AuthError> {
        Ok(())
    }
}

/// Grants write access to holders of one shared bearer token.
#[derive(Clone)]
pub struct StaticTokenVerifier {
    token: String,
}

impl StaticTokenVerifier {
    /// Creates a verifier accepting `token`.
    #[must_use]
    pub fn new(token: impl Into<String>) -> Self {
        Self {
            token: token.into(),
        }
    }
}

impl fmt::Debug for StaticTokenVerifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StaticTokenVerifier").finish_non_exhaustive()
    }
}

impl AccessVerifier for StaticTokenVerifier {
    fn verify(&self, credentials: &Credentials) -> Result<(), AuthError> {
        let presented = credentials.token().ok_or(AuthError::MissingCredentials)?;
        if constant_time_eq(presented.as_bytes(), self.token.as_bytes()) {
            Ok(())
        } else {
            Err(AuthError::InvalidCredentials)
        }
    }
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}
