//! Request authentication.
//!
//! `/metrics` uses its own Basic credentials. API routes take an HS256 bearer token whose `sub`
//! is the user id; issuing tokens belongs to the user service.

use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum_extra::headers::authorization::{Basic, Bearer};
use axum_extra::headers::Authorization;
use axum_extra::extract::TypedHeader;
use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};

use printfleet_shared::AuthBackend;

use super::api::json_error;
use super::ApiError;

#[derive(Debug, Serialize, Deserialize)]
pub struct Claims {
    pub sub: String,
    pub exp: usize,
}

/// Sign a token for `user_id` valid for `ttl_secs`.
pub fn issue_token(secret: &[u8], user_id: &str, ttl_secs: usize) -> Result<String, ApiError> {
    let exp = chrono::Utc::now().timestamp() as usize + ttl_secs;
    let claims = Claims {
        sub: user_id.to_string(),
        exp,
    };
    encode(&Header::default(), &claims, &EncodingKey::from_secret(secret))
        .map_err(|e| ApiError::Internal(format!("token encoding failed: {}", e)))
}

/// User id carried by a valid bearer token.
pub fn bearer_user(secret: &[u8], auth: Option<TypedHeader<Authorization<Bearer>>>) -> Result<String, ApiError> {
    let TypedHeader(auth) = auth.ok_or(ApiError::Unauthorized)?;
    let validation = Validation::new(Algorithm::HS256);
    let data = decode::<Claims>(auth.token(), &DecodingKey::from_secret(secret), &validation)
        .map_err(|_| ApiError::Unauthorized)?;
    if data.claims.sub.is_empty() {
        return Err(ApiError::Unauthorized);
    }
    Ok(data.claims.sub)
}

/// Gate for `/metrics`: 404 while no scrape account is configured, 401 with a Basic challenge
/// when credentials are missing or wrong.
pub async fn check_metrics_auth(
    backend: Option<&dyn AuthBackend>,
    auth: Option<TypedHeader<Authorization<Basic>>>,
) -> Result<(), Response> {
    let Some(backend) = backend else {
        return Err(json_error("Not found", StatusCode::NOT_FOUND));
    };
    let authorized = match &auth {
        Some(TypedHeader(basic)) => backend.validate(basic.username(), basic.password()).await,
        None => false,
    };
    if authorized {
        Ok(())
    } else {
        Err((
            StatusCode::UNAUTHORIZED,
            [(header::WWW_AUTHENTICATE, "Basic realm=\"metrics\"")],
            "Unauthorized",
        )
            .into_response())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn issued_tokens_round_trip_to_the_user() {
        let token = issue_token(b"k", "user-7", 60).unwrap();
        let header = TypedHeader(Authorization::bearer(&token).unwrap());
        assert_eq!(bearer_user(b"k", Some(header)).unwrap(), "user-7");
    }

    #[test]
    fn wrong_secret_or_missing_header_is_unauthorized() {
        let token = issue_token(b"k", "user-7", 60).unwrap();
        let header = TypedHeader(Authorization::bearer(&token).unwrap());
        assert!(matches!(bearer_user(b"other", Some(header)), Err(ApiError::Unauthorized)));
        assert!(matches!(bearer_user(b"k", None), Err(ApiError::Unauthorized)));
    }
}
