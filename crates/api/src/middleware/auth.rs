//! Auth middleware for JWT verification.

use std::sync::Arc;

use axum::extract::FromRequestParts;
use axum::http::request::Parts;
use axum::http::{HeaderMap, StatusCode};
use jsonwebtoken::{DecodingKey, Validation, decode};

use registrar_domain::{Actor, Claims, DomainError, UserType};

use crate::AppState;

/// Extract and verify the actor from the Authorization header.
pub fn auth_middleware(headers: &HeaderMap, jwt_secret: &str) -> Result<Actor, StatusCode> {
    let auth_header = headers
        .get("Authorization")
        .and_then(|v| v.to_str().ok())
        .ok_or(StatusCode::UNAUTHORIZED)?;

    let token = auth_header
        .strip_prefix("Bearer ")
        .ok_or(StatusCode::UNAUTHORIZED)?;

    let token_data = decode::<Claims>(
        token,
        &DecodingKey::from_secret(jwt_secret.as_bytes()),
        &Validation::default(),
    )
    .map_err(|e| {
        tracing::warn!("JWT verification failed: {}", e);
        StatusCode::UNAUTHORIZED
    })?;

    let actor_id = token_data
        .claims
        .sub
        .parse()
        .map_err(|_| StatusCode::UNAUTHORIZED)?;

    Ok(Actor {
        actor_id,
        user_type: token_data.claims.user_type,
    })
}

/// Axum extractor that validates the JWT and provides the authenticated
/// actor. Handlers that declare `AuthActor` as a parameter are automatically
/// protected.
pub struct AuthActor(pub Actor);

impl FromRequestParts<Arc<AppState>> for AuthActor {
    type Rejection = DomainError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &Arc<AppState>,
    ) -> Result<Self, Self::Rejection> {
        let actor = auth_middleware(&parts.headers, &state.config.jwt_secret)
            .map_err(|_| DomainError::Unauthorized("Invalid or missing token".to_string()))?;
        Ok(AuthActor(actor))
    }
}

/// Extractor that additionally requires the admin role.
pub struct AdminActor(pub Actor);

impl FromRequestParts<Arc<AppState>> for AdminActor {
    type Rejection = DomainError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &Arc<AppState>,
    ) -> Result<Self, Self::Rejection> {
        let AuthActor(actor) = AuthActor::from_request_parts(parts, state).await?;
        if actor.user_type != UserType::Admin {
            return Err(DomainError::Forbidden(
                "Administrator role required".to_string(),
            ));
        }
        Ok(AdminActor(actor))
    }
}
