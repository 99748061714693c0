//! Bearer-token authentication.
//!
//! Token issuance (login, refresh, the Redis refresh store) lives in the
//! account collaborator; this module only validates HS256 tokens and
//! exposes the caller's identity to handlers. Claims carry the user id,
//! name, and role.

use axum::extract::FromRequestParts;
use axum::http::request::Parts;
use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};

use crate::http::error::ApiError;
use crate::http::AppState;
use crate::store::users::ROLE_ADMIN;

/// Claims embedded in access tokens.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    /// User id, stringified.
    pub sub: String,
    /// Display user name.
    #[serde(rename = "userName")]
    pub user_name: String,
    /// `User` or `Admin`.
    pub role: String,
    /// Expiry, seconds since epoch.
    pub exp: i64,
    /// Issuer, when configured.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub iss: Option<String>,
    /// Audience, when configured.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub aud: Option<String>,
}

/// Token validation settings.
#[derive(Clone)]
pub struct AuthKeys {
    decoding: DecodingKey,
    encoding: EncodingKey,
    issuer: Option<String>,
    audience: Option<String>,
}

impl AuthKeys {
    /// Build keys from the shared HS256 secret.
    #[must_use]
    pub fn new(secret: &str, issuer: Option<String>, audience: Option<String>) -> Self {
        Self {
            decoding: DecodingKey::from_secret(secret.as_bytes()),
            encoding: EncodingKey::from_secret(secret.as_bytes()),
            issuer,
            audience,
        }
    }

    /// Validate a bearer token and return its claims.
    pub fn verify(&self, token: &str) -> Result<Claims, ApiError> {
        let mut validation = Validation::new(Algorithm::HS256);
        match &self.issuer {
            Some(issuer) => validation.set_issuer(&[issuer]),
            None => {}
        }
        match &self.audience {
            Some(audience) => validation.set_audience(&[audience]),
            None => validation.validate_aud = false,
        }

        let data = decode::<Claims>(token, &self.decoding, &validation)
            .map_err(|e| ApiError::unauthorized(format!("invalid token: {e}")))?;
        Ok(data.claims)
    }

    /// Issue a token for `claims`. Exposed for tests and seeding scripts;
    /// production issuance belongs to the account collaborator.
    pub fn issue(&self, claims: &Claims) -> Result<String, ApiError> {
        encode(&Header::new(Algorithm::HS256), claims, &self.encoding)
            .map_err(|e| ApiError::internal(anyhow::anyhow!("token encode failed: {e}")))
    }
}

/// The authenticated caller, extracted from the `Authorization` header.
#[derive(Debug, Clone)]
pub struct AuthUser {
    /// User row id.
    pub user_id: i64,
    /// Display name.
    pub user_name: String,
    /// Role string.
    pub role: String,
}

impl AuthUser {
    /// Whether the caller bypasses visibility checks.
    #[must_use]
    pub fn is_admin(&self) -> bool {
        self.role == ROLE_ADMIN
    }

    /// Reject non-admin callers.
    pub fn require_admin(&self) -> Result<(), ApiError> {
        if self.is_admin() {
            Ok(())
        } else {
            Err(ApiError::forbidden("admin role required"))
        }
    }

    /// Build from verified claims.
    pub fn from_claims(claims: Claims) -> Result<Self, ApiError> {
        let user_id = claims
            .sub
            .parse()
            .map_err(|_| ApiError::unauthorized("token subject is not a user id"))?;
        Ok(Self {
            user_id,
            user_name: claims.user_name,
            role: claims.role,
        })
    }
}

/// Pull the bearer token out of an `Authorization` header value.
fn bearer_token(header: &str) -> Option<&str> {
    header
        .strip_prefix("Bearer ")
        .or_else(|| header.strip_prefix("bearer "))
        .map(str::trim)
}

impl FromRequestParts<AppState> for AuthUser {
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, state: &AppState) -> Result<Self, Self::Rejection> {
        let header = parts
            .headers
            .get(axum::http::header::AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .ok_or_else(|| ApiError::unauthorized("missing Authorization header"))?;
        let token =
            bearer_token(header).ok_or_else(|| ApiError::unauthorized("malformed Authorization header"))?;
        let claims = state.auth.verify(token)?;
        AuthUser::from_claims(claims)
    }
}
