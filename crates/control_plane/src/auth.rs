//! JWT bearer-token acquisition and caching: the agent authenticates once
//! with a PEM-encoded public key and refreshes the resulting token a few
//! minutes ahead of its expiry.

use std::borrow::Cow;
use std::sync::RwLock;

use serde::{Deserialize, Serialize};

use crate::Error;

/// How far ahead of the reported expiry the cached token is treated as
/// stale, so a request never races an in-flight expiry.
const EXPIRY_SKEW_SECS: i64 = 300;

/// A secret value that is never printed by its [`std::fmt::Debug`] impl and
/// is compared in constant time.
#[derive(Clone, Eq)]
pub struct Secret(Cow<'static, str>);

impl Secret {
    /// Wraps `value` as a secret.
    pub fn new<T>(value: T) -> Self
    where
        T: Into<Cow<'static, str>>,
    {
        Self(value.into())
    }

    /// Returns the wrapped value.
    #[must_use]
    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl PartialEq for Secret {
    fn eq(&self, other: &Self) -> bool {
        let (a, b) = (self.expose(), other.expose());
        if a.len() != b.len() {
            return false;
        }
        a.bytes().zip(b.bytes()).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
    }
}

impl std::fmt::Debug for Secret {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("Secret(..)")
    }
}

impl From<String> for Secret {
    fn from(value: String) -> Self {
        Self::new(value)
    }
}

/// A cached bearer token.
#[derive(Debug, Clone)]
pub struct AuthToken {
    /// The token value, as sent in the `Authorization: Bearer` header.
    pub token: Secret,
    /// Expiry as a UNIX timestamp in seconds.
    pub expires_at_unix: i64,
}

impl AuthToken {
    fn is_fresh(&self, now_unix: i64) -> bool {
        now_unix < self.expires_at_unix - EXPIRY_SKEW_SECS
    }
}

#[derive(Debug, Serialize)]
struct TokenRequest<'a> {
    public_key: &'a str,
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    success: bool,
    message: Option<String>,
    data: Option<TokenData>,
}

#[derive(Debug, Deserialize)]
struct TokenData {
    token: String,
    expired_at: i64,
}

/// Fetches and caches a bearer token from the control plane's
/// `/api/v1/auth/token` endpoint.
pub struct AuthClient {
    http: reqwest::Client,
    base_url: String,
    public_key_pem: String,
    cached: RwLock<Option<AuthToken>>,
}

impl AuthClient {
    /// Creates a client that will authenticate against `base_url` using
    /// `public_key_pem`.
    #[must_use]
    pub fn new(http: reqwest::Client, base_url: impl Into<String>, public_key_pem: impl Into<String>) -> Self {
        Self {
            http,
            base_url: base_url.into(),
            public_key_pem: public_key_pem.into(),
            cached: RwLock::new(None),
        }
    }

    /// Returns a cached token if still fresh, otherwise authenticates with
    /// the control plane and caches the result.
    pub async fn token(&self, now_unix: i64) -> Result<Secret, Error> {
        if let Some(cached) = self.cached.read().expect("auth cache lock poisoned").as_ref() {
            if cached.is_fresh(now_unix) {
                return Ok(cached.token.clone());
            }
        }

        let url = format!("{}/api/v1/auth/token", self.base_url);
        let response = self
            .http
            .post(&url)
            .json(&TokenRequest {
                public_key: &self.public_key_pem,
            })
            .send()
            .await
            .map_err(|source| Error::Http { url: url.clone(), source })?;

        let body: TokenResponse = response
            .error_for_status()
            .map_err(|source| Error::Http { url: url.clone(), source })?
            .json()
            .await
            .map_err(|source| Error::Http { url, source })?;

        if !body.success {
            return Err(Error::AuthRejected {
                message: body.message.unwrap_or_else(|| "no message".to_string()),
            });
        }

        let data = body.data.ok_or(Error::AuthRejected {
            message: "auth response missing data".to_string(),
        })?;

        let token = AuthToken {
            token: Secret::new(data.token),
            expires_at_unix: data.expired_at,
        };
        let secret = token.token.clone();
        *self.cached.write().expect("auth cache lock poisoned") = Some(token);
        Ok(secret)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn secret_debug_never_prints_the_value() {
        let secret = Secret::new("super-secret-token".to_string());
        assert!(!format!("{secret:?}").contains("super-secret-token"));
    }

    #[test]
    fn token_is_fresh_only_outside_the_skew_window() {
        let token = AuthToken {
            token: Secret::new("t".to_string()),
            expires_at_unix: 1000,
        };
        assert!(token.is_fresh(600));
        assert!(!token.is_fresh(750));
    }
}
