use std::sync::Arc;

use axum::{
    extract::{Request, State},
    http::{header, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
    Json,
};
use chrono::{Duration, Utc};
use jsonwebtoken::{decode, encode, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Claims {
    /// Identity (user) id.
    pub sub: String,
    pub exp: i64,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub r#type: String,
}

/// Identity attached to a request by [`require_auth`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AuthenticatedUser {
    pub user_id: Uuid,
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum AuthError {
    #[error("missing authorization header")]
    MissingToken,
    #[error("invalid authorization header format")]
    MalformedHeader,
    #[error("invalid or expired token")]
    InvalidToken,
    #[error("invalid user id in token")]
    InvalidSubject,
}

#[derive(Serialize)]
struct ErrorBody {
    code: &'static str,
    message: String,
}

impl IntoResponse for AuthError {
    fn into_response(self) -> Response {
        let body = ErrorBody {
            code: "UNAUTHORIZED",
            message: self.to_string(),
        };
        (StatusCode::UNAUTHORIZED, Json(body)).into_response()
    }
}

/// HS256 verifier for access tokens whose subject is the identity id.
pub struct JwtVerifier {
    decoding: DecodingKey,
    encoding: EncodingKey,
    validation: Validation,
}

impl std::fmt::Debug for JwtVerifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JwtVerifier")
            .field("secret", &"[redacted]")
            .finish()
    }
}

impl JwtVerifier {
    pub fn new(secret: &str) -> Self {
        let mut validation = Validation::default();
        validation.leeway = 0;
        Self {
            decoding: DecodingKey::from_secret(secret.as_bytes()),
            encoding: EncodingKey::from_secret(secret.as_bytes()),
            validation,
        }
    }

    pub fn verify(&self, token: &str) -> Result<AuthenticatedUser, AuthError> {
        let data = decode::<Claims>(token, &self.decoding, &self.validation)
            .map_err(|_| AuthError::InvalidToken)?;
        let user_id = Uuid::parse_str(&data.claims.sub).map_err(|_| AuthError::InvalidSubject)?;
        Ok(AuthenticatedUser { user_id })
    }

    /// Mints an access token. Used by the `token` subcommand and tests.
    pub fn issue(&self, user_id: Uuid, ttl: Duration) -> anyhow::Result<String> {
        let claims = Claims {
            sub: user_id.to_string(),
            exp: (Utc::now() + ttl).timestamp(),
            r#type: "access".to_string(),
        };
        Ok(encode(&Header::default(), &claims, &self.encoding)?)
    }
}

/// Pulls the bearer token from the `Authorization` header, falling back to a
/// `token` query parameter for WebSocket clients that cannot set headers.
pub fn extract_token(req: &Request) -> Result<String, AuthError> {
    if let Some(value) = req.headers().get(header::AUTHORIZATION) {
        let value = value.to_str().map_err(|_| AuthError::MalformedHeader)?;
        let mut parts = value.splitn(2, ' ');
        let scheme = parts.next().unwrap_or_default();
        let token = parts.next().map(str::trim).unwrap_or_default();
        if !scheme.eq_ignore_ascii_case("bearer") || token.is_empty() {
            return Err(AuthError::MalformedHeader);
        }
        return Ok(token.to_string());
    }
    req.uri()
        .query()
        .and_then(|q| {
            url::form_urlencoded::parse(q.as_bytes())
                .find(|(k, _)| k == "token")
                .map(|(_, v)| v.into_owned())
        })
        .filter(|t| !t.is_empty())
        .ok_or(AuthError::MissingToken)
}

pub async fn require_auth(
    State(verifier): State<Arc<JwtVerifier>>,
    mut req: Request,
    next: Next,
) -> Response {
    let user = match extract_token(&req).and_then(|token| verifier.verify(&token)) {
        Ok(user) => user,
        Err(err) => {
            tracing::debug!(error = %err, path = %req.uri().path(), "rejected request");
            return err.into_response();
        }
    };
    req.extensions_mut().insert(user);
    next.run(req).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;

    const SECRET: &str = "test-secret";

    fn request(uri: &str, auth: Option<&str>) -> Request {
        let mut builder = axum::http::Request::builder().uri(uri);
        if let Some(v) = auth {
            builder = builder.header(header::AUTHORIZATION, v);
        }
        builder.body(Body::empty()).unwrap()
    }

    #[test]
    fn issued_tokens_verify_to_subject() {
        let verifier = JwtVerifier::new(SECRET);
        let user = Uuid::new_v4();
        let token = verifier.issue(user, Duration::minutes(5)).unwrap();
        assert_eq!(verifier.verify(&token).unwrap().user_id, user);

        let other = JwtVerifier::new("other-secret");
        assert_eq!(other.verify(&token).unwrap_err(), AuthError::InvalidToken);
    }

    #[test]
    fn expired_and_non_uuid_subjects_are_rejected() {
        let verifier = JwtVerifier::new(SECRET);
        let expired = verifier.issue(Uuid::new_v4(), Duration::minutes(-5)).unwrap();
        assert_eq!(verifier.verify(&expired).unwrap_err(), AuthError::InvalidToken);

        let claims = Claims {
            sub: "alice@example.com".into(),
            exp: (Utc::now() + Duration::minutes(5)).timestamp(),
            r#type: String::new(),
        };
        let token = encode(
            &Header::default(),
            &claims,
            &EncodingKey::from_secret(SECRET.as_bytes()),
        )
        .unwrap();
        assert_eq!(verifier.verify(&token).unwrap_err(), AuthError::InvalidSubject);
    }

    #[test]
    fn token_comes_from_header_or_query() {
        assert_eq!(
            extract_token(&request("/ws", Some("Bearer abc"))).unwrap(),
            "abc"
        );
        assert_eq!(
            extract_token(&request("/ws", Some("bearer  abc "))).unwrap(),
            "abc"
        );
        assert_eq!(
            extract_token(&request("/ws?device_id=x&token=q%2Eq", None)).unwrap(),
            "q.q"
        );
        assert_eq!(
            extract_token(&request("/ws", Some("Basic abc"))).unwrap_err(),
            AuthError::MalformedHeader
        );
        assert_eq!(
            extract_token(&request("/ws?token=", None)).unwrap_err(),
            AuthError::MissingToken
        );
    }
}
