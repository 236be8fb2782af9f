//! Peer identity at upgrade time.
//!
//! The gateway does not verify credentials itself. An upstream proxy
//! authenticates the peer and forwards its id in a header; the id is opaque
//! to everything past this module.

use crate::config::AuthConfig;
use axum::http::{HeaderMap, HeaderName};
use huddle_protocol::UserId;
use thiserror::Error;

/// Identity extraction failures.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum AuthError {
    /// No user id was presented and one is required.
    #[error("Missing user identity")]
    Missing,

    /// The header was present but unusable.
    #[error("Invalid user identity header: {0}")]
    Invalid(String),

    /// The configured header name is not a valid HTTP header name.
    #[error("Invalid identity header name: {0}")]
    BadHeaderName(String),
}

/// Resolves the user behind an upgrade request.
pub trait Authenticator: Send + Sync {
    /// Returns the user id, `None` for an anonymous peer.
    ///
    /// # Errors
    ///
    /// Returns an error if the request must be rejected.
    fn authenticate(&self, headers: &HeaderMap) -> Result<Option<UserId>, AuthError>;
}

/// Trusts a header set by an authenticating reverse proxy.
#[derive(Debug, Clone)]
pub struct TrustedHeader {
    header: HeaderName,
    require_user: bool,
}

impl TrustedHeader {
    /// # Errors
    ///
    /// Returns an error if `header` is not a valid header name.
    pub fn new(header: &str, require_user: bool) -> Result<Self, AuthError> {
        let header = HeaderName::from_bytes(header.trim().as_bytes())
            .map_err(|_| AuthError::BadHeaderName(header.to_string()))?;
        Ok(Self {
            header,
            require_user,
        })
    }

    /// # Errors
    ///
    /// Returns an error if the configured header name is invalid.
    pub fn from_config(config: &AuthConfig) -> Result<Self, AuthError> {
        Self::new(&config.user_header, config.require_user)
    }
}

impl Authenticator for TrustedHeader {
    fn authenticate(&self, headers: &HeaderMap) -> Result<Option<UserId>, AuthError> {
        let user = match headers.get(&self.header) {
            Some(value) => {
                let value = value
                    .to_str()
                    .map_err(|e| AuthError::Invalid(e.to_string()))?
                    .trim();
                (!value.is_empty()).then(|| value.to_string())
            }
            None => None,
        };

        match user {
            None if self.require_user => Err(AuthError::Missing),
            user => Ok(user),
        }
    }
}
