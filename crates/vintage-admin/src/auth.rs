use std::{fmt, sync::Arc};

use axum::{
    extract::{Request, State},
    http::{header, HeaderMap},
    middleware::Next,
    response::{IntoResponse, Response},
};
use base64::{engine::general_purpose::STANDARD, Engine as _};
use sha2::{Digest, Sha256};
use thiserror::Error;
use tracing::warn;

use crate::server::ApiError;

/// Paths below this prefix require the admin password.
pub const PROTECTED_PREFIX: &str = "/api/";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum AuthError {
    #[error("missing Authorization header")]
    MissingCredentials,
    #[error("Authorization header must use the Basic scheme")]
    UnsupportedScheme,
    #[error("malformed Basic credentials")]
    Malformed,
    #[error("invalid admin password")]
    InvalidPassword,
}

/// Shared-secret gate for the admin API. The username half of the Basic
/// credentials is ignored; only the password is compared.
#[derive(Clone)]
pub struct AdminAuth {
    secret_hash: [u8; 32],
}

impl fmt::Debug for AdminAuth {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AdminAuth").finish_non_exhaustive()
    }
}

impl AdminAuth {
    pub fn new(password: &str) -> Self {
        Self {
            secret_hash: hash_secret(password),
        }
    }

    pub fn verify(&self, headers: &HeaderMap) -> Result<(), AuthError> {
        let raw = headers
            .get(header::AUTHORIZATION)
            .ok_or(AuthError::MissingCredentials)?
            .to_str()
            .map_err(|_| AuthError::Malformed)?;
        let password = basic_password(raw)?;

        if constant_time_eq(&hash_secret(&password), &self.secret_hash) {
            Ok(())
        } else {
            Err(AuthError::InvalidPassword)
        }
    }
}

/// Rejects unauthenticated requests to [`PROTECTED_PREFIX`] with a 401 before
/// any handler runs.
pub async fn require_admin(
    State(auth): State<Arc<AdminAuth>>,
    request: Request,
    next: Next,
) -> Response {
    if !request.uri().path().starts_with(PROTECTED_PREFIX) {
        return next.run(request).await;
    }

    match auth.verify(request.headers()) {
        Ok(()) => next.run(request).await,
        Err(err) => {
            warn!(path = %request.uri().path(), reason = %err, "admin authentication failed");
            ApiError::unauthorized("Unauthorized").into_response()
        }
    }
}

fn basic_password(raw: &str) -> Result<String, AuthError> {
    let (scheme, encoded) = raw
        .trim()
        .split_once(' ')
        .ok_or(AuthError::UnsupportedScheme)?;
    if !scheme.eq_ignore_ascii_case("basic") {
        return Err(AuthError::UnsupportedScheme);
    }

    let decoded = STANDARD
        .decode(encoded.trim())
        .map_err(|_| AuthError::Malformed)?;
    let credentials = String::from_utf8(decoded).map_err(|_| AuthError::Malformed)?;
    let (_, password) = credentials.split_once(':').ok_or(AuthError::Malformed)?;
    Ok(password.to_string())
}

fn hash_secret(secret: &str) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(secret.as_bytes());
    hasher.finalize().into()
}

fn constant_time_eq(left: &[u8], right: &[u8]) -> bool {
    left.len() == right.len()
        && left
            .iter()
            .zip(right)
            .fold(0u8, |acc, (a, b)| acc | (a ^ b))
            == 0
}

#[cfg(test)]
mod tests {
    use axum::http::HeaderValue;

    use super::*;

    fn headers_with(value: &str) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(header::AUTHORIZATION, HeaderValue::from_str(value).unwrap());
        headers
    }

    fn basic(user: &str, password: &str) -> String {
        format!("Basic {}", STANDARD.encode(format!("{user}:{password}")))
    }

    #[test]
    fn accepts_matching_password_with_any_username() {
        let auth = AdminAuth::new("segreto");
        assert_eq!(auth.verify(&headers_with(&basic("admin", "segreto"))), Ok(()));
        assert_eq!(auth.verify(&headers_with(&basic("", "segreto"))), Ok(()));
        assert_eq!(auth.verify(&headers_with(&basic("chiunque", "segreto"))), Ok(()));
    }

    #[test]
    fn password_may_contain_colons() {
        let auth = AdminAuth::new("a:b:c");
        assert_eq!(auth.verify(&headers_with(&basic("admin", "a:b:c"))), Ok(()));
    }

    #[test]
    fn rejects_wrong_or_missing_credentials() {
        let auth = AdminAuth::new("segreto");
        assert_eq!(auth.verify(&HeaderMap::new()), Err(AuthError::MissingCredentials));
        assert_eq!(
            auth.verify(&headers_with(&basic("admin", "sbagliato"))),
            Err(AuthError::InvalidPassword)
        );
        assert_eq!(
            auth.verify(&headers_with("Bearer segreto")),
            Err(AuthError::UnsupportedScheme)
        );
        assert_eq!(
            auth.verify(&headers_with("Basic !!not-base64!!")),
            Err(AuthError::Malformed)
        );
        let no_colon = format!("Basic {}", STANDARD.encode("segreto"));
        assert_eq!(auth.verify(&headers_with(&no_colon)), Err(AuthError::Malformed));
    }

    #[test]
    fn debug_output_hides_secret() {
        let rendered = format!("{:?}", AdminAuth::new("segreto"));
        assert!(!rendered.contains("segreto"));
        assert!(rendered.starts_with("AdminAuth"));
    }
}
