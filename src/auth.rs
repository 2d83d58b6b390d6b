//! Identity check: opaque bearer credential → user id.
//!
//! Credential issuance (signup, login, password hashing) lives outside this
//! server; it writes rows into the sessions table and hands the token to the
//! client. This module only resolves.

use anyhow::Result;
use axum::http::HeaderMap;
use sqlx::{Pool, Sqlite};

use crate::database;
use crate::error::{CoordError, CoordResult};
use crate::events::UserId;

/// Resolve a bearer credential to a user id. Unknown tokens resolve to None.
pub async fn resolve_token(pool: &Pool<Sqlite>, token: &str) -> Result<Option<UserId>> {
    if token.is_empty() {
        return Ok(None);
    }
    database::resolve_session(pool, token).await
}

/// Authenticate an HTTP request from its Authorization header.
pub async fn bearer_user(pool: &Pool<Sqlite>, headers: &HeaderMap) -> CoordResult<UserId> {
    let token = headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .ok_or_else(|| CoordError::Unauthenticated("missing bearer token".into()))?;

    resolve_token(pool, token)
        .await?
        .ok_or_else(|| CoordError::Unauthenticated("invalid or expired token".into()))
}
