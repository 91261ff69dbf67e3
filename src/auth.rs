use axum::{
    extract::{Request, State},
    http::{
        header::{AUTHORIZATION, COOKIE},
        HeaderMap,
    },
    middleware::Next,
    response::Response,
};
use diesel::prelude::*;
use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};

use crate::{
    error::{AppError, AppResult},
    model::User,
    types::Role,
    AppState,
};

const SESSION_COOKIE: &str = "jwt";

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct Claims {
    pub sub: String,
    pub iat: usize,
    pub exp: usize,
}

/// The authenticated caller, resolved from the session token on every request.
#[derive(Debug, Clone)]
pub struct CurrentUser {
    pub id: String,
    pub name: String,
    pub email: String,
    pub role: Role,
}

impl CurrentUser {
    pub fn is_admin(&self) -> bool {
        self.role == Role::Admin
    }
}

impl From<User> for CurrentUser {
    fn from(user: User) -> Self {
        Self {
            id: user.id,
            name: user.name,
            email: user.email,
            role: user.role,
        }
    }
}

pub fn issue_session_token(
    user_id: &str,
    secret: &str,
    ttl: chrono::Duration,
) -> Result<String, jsonwebtoken::errors::Error> {
    let now = chrono::Utc::now();
    let claims = Claims {
        sub: user_id.to_string(),
        iat: now.timestamp() as usize,
        exp: (now + ttl).timestamp() as usize,
    };
    encode(
        &Header::new(Algorithm::HS256),
        &claims,
        &EncodingKey::from_secret(secret.as_bytes()),
    )
}

pub fn decode_session_token(
    token: &str,
    secret: &str,
) -> Result<Claims, jsonwebtoken::errors::Error> {
    let validation = Validation::new(Algorithm::HS256);
    let token_data = decode::<Claims>(
        token,
        &DecodingKey::from_secret(secret.as_bytes()),
        &validation,
    )?;
    Ok(token_data.claims)
}

/// Bearer header first, then the session cookie set by the storefront.
fn extract_token(headers: &HeaderMap) -> Option<&str> {
    if let Some(token) = headers
        .get(AUTHORIZATION)
        .and_then(|h| h.to_str().ok())
        .and_then(|h| h.strip_prefix("Bearer "))
    {
        return Some(token.trim());
    }

    headers
        .get_all(COOKIE)
        .iter()
        .filter_map(|h| h.to_str().ok())
        .flat_map(|cookies| cookies.split(';'))
        .find_map(|cookie| {
            cookie
                .trim()
                .strip_prefix(SESSION_COOKIE)
                .and_then(|rest| rest.strip_prefix('='))
        })
        .filter(|token| !token.is_empty())
}

/// Session middleware for user routes.
/// Rejects with 401 unless the token is valid and its user still exists.
pub async fn require_user(
    State(state): State<AppState>,
    mut req: Request,
    next: Next,
) -> Result<Response, AppError> {
    let token = extract_token(req.headers())
        .ok_or_else(|| AppError::Unauthorized("You are not logged in".to_string()))?;

    let claims = decode_session_token(token, &state.config.jwt_secret).map_err(|e| {
        tracing::debug!(error = %e, "rejected session token");
        AppError::Unauthorized("Invalid or expired session".to_string())
    })?;

    let user: Option<User> = {
        use crate::schema::users::dsl::*;

        let mut conn = state.get_db_connection()?;
        users
            .find(&claims.sub)
            .select(User::as_select())
            .first(&mut conn)
            .optional()?
    };
    let user = user.ok_or_else(|| {
        AppError::Unauthorized("The user for this session no longer exists".to_string())
    })?;

    req.extensions_mut().insert(CurrentUser::from(user));
    Ok(next.run(req).await)
}

/// The one capability check: the caller owns the resource or is an admin.
pub fn authorize_owner_or_admin(
    user: &CurrentUser,
    owner_id: &str,
    resource: &str,
) -> AppResult<()> {
    if user.id == owner_id || user.is_admin() {
        Ok(())
    } else {
        Err(AppError::Forbidden(format!(
            "You are not allowed to access this {resource}"
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    fn user(id: &str, role: Role) -> CurrentUser {
        CurrentUser {
            id: id.to_string(),
            name: "Reader".to_string(),
            email: "reader@example.com".to_string(),
            role,
        }
    }

    #[test]
    fn owner_and_admin_are_authorized() {
        assert!(authorize_owner_or_admin(&user("u1", Role::User), "u1", "order").is_ok());
        assert!(authorize_owner_or_admin(&user("admin", Role::Admin), "u1", "order").is_ok());
        assert!(matches!(
            authorize_owner_or_admin(&user("u2", Role::User), "u1", "order"),
            Err(AppError::Forbidden(_))
        ));
    }

    #[test]
    fn session_token_round_trips_subject() {
        let token = issue_session_token("user-1", "secret", chrono::Duration::hours(1)).unwrap();
        let claims = decode_session_token(&token, "secret").unwrap();
        assert_eq!(claims.sub, "user-1");
        assert!(decode_session_token(&token, "other-secret").is_err());
    }

    #[test]
    fn token_is_read_from_bearer_or_cookie() {
        let mut headers = HeaderMap::new();
        headers.insert(AUTHORIZATION, HeaderValue::from_static("Bearer abc"));
        assert_eq!(extract_token(&headers), Some("abc"));

        let mut headers = HeaderMap::new();
        headers.insert(COOKIE, HeaderValue::from_static("theme=dark; jwt=xyz"));
        assert_eq!(extract_token(&headers), Some("xyz"));

        let mut headers = HeaderMap::new();
        headers.insert(COOKIE, HeaderValue::from_static("jwtx=nope"));
        assert_eq!(extract_token(&headers), None);
    }
}
