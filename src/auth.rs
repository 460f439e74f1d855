use axum::{
    extract::Query,
    http::{header, Request, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
    Extension, Json,
};
use serde::{Deserialize, Serialize};
use subtle::ConstantTimeEq;

use crate::config::AuthConfig;

pub const ROLE_ADMIN: &str = "admin";
pub const ROLE_READER: &str = "reader";
pub const ROLE_TRIAL: &str = "trial";

/// Authenticated caller identity, available to handlers via request extensions.
#[derive(Debug, Clone)]
pub struct CallerIdentity {
    pub name: String,
    pub role: String,
}

impl CallerIdentity {
    pub fn can_write(&self) -> bool {
        !self.role.eq_ignore_ascii_case(ROLE_READER)
    }

    pub fn is_trial(&self) -> bool {
        self.role.eq_ignore_ascii_case(ROLE_TRIAL)
    }
}

/// Browsers cannot set headers on a WebSocket upgrade, so the key may also
/// come as `?token=`.
#[derive(Debug, Default, Deserialize)]
pub struct AuthQuery {
    pub token: Option<String>,
    pub user: Option<String>,
}

#[derive(Serialize)]
struct AuthError {
    success: bool,
    error: String,
}

pub async fn auth_middleware<B>(
    Extension(config): Extension<std::sync::Arc<AuthConfig>>,
    Query(query): Query<AuthQuery>,
    mut req: Request<B>,
    next: Next<B>,
) -> Response {
    if !config.enabled {
        req.extensions_mut().insert(CallerIdentity {
            name: query
                .user
                .filter(|u| !u.trim().is_empty())
                .unwrap_or_else(|| "anonymous".to_string()),
            role: ROLE_ADMIN.to_string(),
        });
        return next.run(req).await;
    }

    let api_key = req
        .headers()
        .get("X-API-Key")
        .or_else(|| req.headers().get(header::AUTHORIZATION))
        .and_then(|v| v.to_str().ok())
        .map(|s| s.strip_prefix("Bearer ").unwrap_or(s).to_string())
        .or(query.token);

    match api_key {
        Some(key) => {
            match config
                .api_keys
                .iter()
                .find(|entry| entry.key.as_bytes().ct_eq(key.as_bytes()).into())
            {
                Some(entry) => {
                    tracing::debug!(caller = %entry.name, role = %entry.role, "Authenticated request");
                    req.extensions_mut().insert(CallerIdentity {
                        name: entry.name.clone(),
                        role: entry.role.clone(),
                    });
                    next.run(req).await
                }
                None => {
                    tracing::warn!("Invalid API key presented");
                    (
                        StatusCode::UNAUTHORIZED,
                        Json(AuthError {
                            success: false,
                            error: "Invalid API key".to_string(),
                        }),
                    )
                        .into_response()
                }
            }
        }
        None => (
            StatusCode::UNAUTHORIZED,
            Json(AuthError {
                success: false,
                error: "Missing API key. Provide X-API-Key header, Authorization: Bearer <key> or ?token=<key>"
                    .to_string(),
            }),
        )
            .into_response(),
    }
}
