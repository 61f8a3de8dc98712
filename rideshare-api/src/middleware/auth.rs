use axum::{
    extract::{Request, State},
    middleware::Next,
    response::Response,
};
use jsonwebtoken::{decode, DecodingKey, Validation};
use serde::{Deserialize, Serialize};

use crate::error::AppError;
use crate::state::AppState;

pub const ADMIN_ROLE: &str = "admin";

// ============================================================================
// JWT Claims
// ============================================================================

/// Tokens are minted by the identity provider; `sub` is the stable user id.
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct Claims {
    pub sub: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub role: String,
    pub exp: usize,
}

/// The authenticated caller, as seen by handlers.
#[derive(Debug, Clone)]
pub struct Identity {
    pub user_id: String,
    pub name: Option<String>,
    pub role: String,
}

impl Identity {
    pub fn is_admin(&self) -> bool {
        self.role == ADMIN_ROLE
    }
}

impl From<Claims> for Identity {
    fn from(claims: Claims) -> Self {
        Self {
            user_id: claims.sub,
            name: claims.name,
            role: claims.role,
        }
    }
}

fn authenticate(state: &AppState, req: &Request) -> Result<Identity, AppError> {
    let auth_header = req
        .headers()
        .get(axum::http::header::AUTHORIZATION)
        .and_then(|h| h.to_str().ok())
        .ok_or_else(|| AppError::AuthenticationError("Missing bearer token".to_string()))?;

    let token = auth_header
        .strip_prefix("Bearer ")
        .ok_or_else(|| AppError::AuthenticationError("Malformed authorization header".to_string()))?;

    let token_data = decode::<Claims>(
        token,
        &DecodingKey::from_secret(state.auth.secret.as_bytes()),
        &Validation::default(),
    )
    .map_err(|e| {
        tracing::debug!("Rejected token: {}", e);
        AppError::AuthenticationError("Invalid or expired token".to_string())
    })?;

    if token_data.claims.sub.trim().is_empty() {
        return Err(AppError::AuthenticationError("Token carries no subject".to_string()));
    }

    Ok(Identity::from(token_data.claims))
}

// ============================================================================
// Authentication Middleware
// ============================================================================

pub async fn auth_middleware(
    State(state): State<AppState>,
    mut req: Request,
    next: Next,
) -> Result<Response, AppError> {
    let identity = authenticate(&state, &req)?;
    req.extensions_mut().insert(identity);
    Ok(next.run(req).await)
}
