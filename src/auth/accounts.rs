//! Account registration, login, and token refresh.
//!
//! The first registered account becomes the platform admin — platform admins
//! are the elevated support role counted by the online-admin tracker and the
//! only users allowed to approve room deletions and manage tickets.

use argon2::password_hash::{rand_core::OsRng, PasswordHash, PasswordHasher, SaltString};
use argon2::{Argon2, PasswordVerifier};
use axum::{extract::State, Json};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::api::{blocking, ApiError, ApiResponse};
use crate::auth::{jwt, totp};
use crate::state::AppState;

const MAX_USERNAME_LENGTH: usize = 32;
const MIN_PASSWORD_LENGTH: usize = 8;

#[derive(Debug, Deserialize)]
pub struct RegisterRequest {
    pub username: String,
    pub password: String,
}

#[derive(Debug, Deserialize)]
pub struct LoginRequest {
    pub username: String,
    pub password: String,
    /// TOTP code, required once the account has TOTP enrolled.
    #[serde(default)]
    pub totp_code: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct RefreshRequest {
    pub refresh_token: String,
}

#[derive(Debug, Serialize)]
pub struct TokenResponse {
    pub user_id: String,
    pub username: String,
    pub is_admin: bool,
    pub access_token: String,
    pub refresh_token: String,
}

fn validate_username(username: &str) -> Result<(), ApiError> {
    if username.is_empty() || username.len() > MAX_USERNAME_LENGTH {
        return Err(ApiError::Validation(format!(
            "username must be 1-{} characters",
            MAX_USERNAME_LENGTH
        )));
    }
    if !username
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
    {
        return Err(ApiError::Validation(
            "username may contain only letters, digits, '_' and '-'".to_string(),
        ));
    }
    Ok(())
}

/// POST /api/auth/register
/// Create an account. The first account on the server becomes the platform
/// admin; everyone after that is a regular user.
pub async fn register(
    State(state): State<AppState>,
    Json(req): Json<RegisterRequest>,
) -> Result<Json<ApiResponse<TokenResponse>>, ApiError> {
    validate_username(&req.username)?;
    if req.password.len() < MIN_PASSWORD_LENGTH {
        return Err(ApiError::Validation(format!(
            "password must be at least {} characters",
            MIN_PASSWORD_LENGTH
        )));
    }

    let salt = SaltString::generate(&mut OsRng);
    let password_hash = Argon2::default()
        .hash_password(req.password.as_bytes(), &salt)
        .map_err(|_| ApiError::Internal)?
        .to_string();

    let db = state.db.clone();
    let username = req.username.clone();
    let (user_id, is_admin) = blocking(move || {
        let conn = db.lock().map_err(|_| ApiError::Internal)?;

        let taken: bool = conn
            .query_row(
                "SELECT COUNT(*) FROM users WHERE username = ?1",
                [&username],
                |row| row.get::<_, i64>(0).map(|c| c > 0),
            )
            .map_err(|_| ApiError::Internal)?;
        if taken {
            return Err(ApiError::Conflict("username already taken".to_string()));
        }

        // First account becomes the platform admin.
        let user_count: i64 = conn
            .query_row("SELECT COUNT(*) FROM users", [], |row| row.get(0))
            .map_err(|_| ApiError::Internal)?;
        let is_admin = user_count == 0;

        let user_id = Uuid::now_v7().to_string();
        let now = Utc::now().to_rfc3339();
        conn.execute(
            "INSERT INTO users (id, username, password_hash, is_admin, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?5)",
            rusqlite::params![user_id, username, password_hash, is_admin, now],
        )
        .map_err(|_| ApiError::Internal)?;

        Ok((user_id, is_admin))
    })
    .await?;

    if is_admin {
        tracing::info!(user_id = %user_id, username = %req.username, "first account registered as platform admin");
    }

    issue_tokens(&state, &user_id, &req.username, is_admin).await
}

/// POST /api/auth/login
/// Password login. Accounts with TOTP enrolled must also supply a valid code.
pub async fn login(
    State(state): State<AppState>,
    Json(req): Json<LoginRequest>,
) -> Result<Json<ApiResponse<TokenResponse>>, ApiError> {
    let db = state.db.clone();
    let username = req.username.clone();

    let row = blocking(move || {
        let conn = db.lock().map_err(|_| ApiError::Internal)?;
        let row: Option<(String, String, bool, bool)> = conn
            .query_row(
                "SELECT id, password_hash, is_admin, totp_enrolled FROM users WHERE username = ?1",
                [&username],
                |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?, r.get(3)?)),
            )
            .ok();
        Ok(row)
    })
    .await?;

    // Same error for unknown user and wrong password.
    let denied = || ApiError::Validation("invalid username or password".to_string());
    let (user_id, password_hash, is_admin, totp_enrolled) = row.ok_or_else(denied)?;

    let parsed = PasswordHash::new(&password_hash).map_err(|_| ApiError::Internal)?;
    Argon2::default()
        .verify_password(req.password.as_bytes(), &parsed)
        .map_err(|_| denied())?;

    if totp_enrolled {
        let code = req
            .totp_code
            .as_deref()
            .ok_or_else(|| ApiError::Validation("totp code required".to_string()))?;
        let valid = totp::verify_code(&state, &user_id, code).await?;
        if !valid {
            return Err(ApiError::Validation("invalid totp code".to_string()));
        }
    }

    issue_tokens(&state, &user_id, &req.username, is_admin).await
}

/// POST /api/auth/refresh
/// Rotate a refresh token: the presented token is consumed and a fresh
/// access/refresh pair is issued.
pub async fn refresh(
    State(state): State<AppState>,
    Json(req): Json<RefreshRequest>,
) -> Result<Json<ApiResponse<TokenResponse>>, ApiError> {
    let db = state.db.clone();
    let token = req.refresh_token.clone();

    let (user_id, username, is_admin) = blocking(move || {
        let user_id = jwt::validate_and_consume_refresh_token(&db, &token)
            .map_err(|_| ApiError::Validation("invalid or expired refresh token".to_string()))?;
        let conn = db.lock().map_err(|_| ApiError::Internal)?;
        let (username, is_admin): (String, bool) = conn
            .query_row(
                "SELECT username, is_admin FROM users WHERE id = ?1",
                [&user_id],
                |r| Ok((r.get(0)?, r.get(1)?)),
            )
            .map_err(|_| ApiError::NotFound("user".to_string()))?;
        Ok((user_id, username, is_admin))
    })
    .await?;

    issue_tokens(&state, &user_id, &username, is_admin).await
}

async fn issue_tokens(
    state: &AppState,
    user_id: &str,
    username: &str,
    is_admin: bool,
) -> Result<Json<ApiResponse<TokenResponse>>, ApiError> {
    let access_token = jwt::issue_access_token(&state.jwt_secret, user_id, username, is_admin)
        .map_err(|_| ApiError::Internal)?;
    let (refresh_token, refresh_hash) = jwt::issue_refresh_token();

    let db = state.db.clone();
    let uid = user_id.to_string();
    blocking(move || {
        jwt::store_refresh_token(&db, &uid, &refresh_hash).map_err(|_| ApiError::Internal)
    })
    .await?;

    Ok(ApiResponse::ok(TokenResponse {
        user_id: user_id.to_string(),
        username: username.to_string(),
        is_admin,
        access_token,
        refresh_token,
    }))
}
