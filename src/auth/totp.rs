//! TOTP enrollment and verification.
//!
//! Secrets are encrypted at rest with the server's AES-256-GCM key, stored
//! as (nonce || ciphertext). Enrollment is two-step: /enroll generates and
//! stores the secret, /confirm flips `totp_enrolled` once the user proves
//! they hold it. Login calls `verify_code` when the flag is set.

use aes_gcm::aead::Aead;
use aes_gcm::{Aes256Gcm, KeyInit, Nonce};
use axum::{extract::State, Json};
use rand::Rng;
use serde::{Deserialize, Serialize};
use totp_rs::{Algorithm, Secret, TOTP};

use crate::api::{blocking, ApiError, ApiResponse};
use crate::auth::middleware::Claims;
use crate::state::AppState;

#[derive(Debug, Serialize)]
pub struct TotpEnrollResponse {
    /// Base32-encoded TOTP secret for manual entry
    pub secret: String,
    /// otpauth:// URI for authenticator apps
    pub otpauth_uri: String,
}

#[derive(Debug, Deserialize)]
pub struct TotpConfirmRequest {
    /// 6-digit TOTP code from authenticator app
    pub code: String,
}

#[derive(Debug, Serialize)]
pub struct TotpConfirmResponse {
    pub valid: bool,
}

// --- Encryption helpers ---

/// Encrypt a TOTP secret with the server's AES-256-GCM encryption key.
/// Returns (nonce || ciphertext) concatenated.
fn encrypt_totp_secret(encryption_key: &[u8], secret_bytes: &[u8]) -> Result<Vec<u8>, ApiError> {
    let cipher = Aes256Gcm::new_from_slice(encryption_key).map_err(|_| ApiError::Internal)?;
    let nonce_bytes: [u8; 12] = rand::rng().random();
    let nonce = Nonce::from_slice(&nonce_bytes);
    let ciphertext = cipher
        .encrypt(nonce, secret_bytes)
        .map_err(|_| ApiError::Internal)?;

    // Concatenate nonce || ciphertext for storage
    let mut result = Vec::with_capacity(12 + ciphertext.len());
    result.extend_from_slice(&nonce_bytes);
    result.extend_from_slice(&ciphertext);
    Ok(result)
}

/// Decrypt a TOTP secret from (nonce || ciphertext) format.
fn decrypt_totp_secret(encryption_key: &[u8], encrypted: &[u8]) -> Result<Vec<u8>, ApiError> {
    if encrypted.len() < 12 {
        return Err(ApiError::Internal);
    }
    let cipher = Aes256Gcm::new_from_slice(encryption_key).map_err(|_| ApiError::Internal)?;
    let nonce = Nonce::from_slice(&encrypted[..12]);
    cipher
        .decrypt(nonce, &encrypted[12..])
        .map_err(|_| ApiError::Internal)
}

/// Build a TOTP instance from a raw secret (bytes).
/// Uses standard RFC 6238 params: SHA1, 6 digits, 30-second period.
fn build_totp(secret_bytes: &[u8], account_name: &str) -> Result<TOTP, ApiError> {
    TOTP::new(
        Algorithm::SHA1,
        6,
        1, // 1 step skew (allows codes from prev/next period)
        30,
        secret_bytes.to_vec(),
        Some("Agora".to_string()),
        account_name.to_string(),
    )
    .map_err(|_| ApiError::Internal)
}

// --- Handlers ---

/// POST /api/auth/totp/enroll
/// Generate a TOTP secret for the authenticated user and return it with an
/// otpauth URI. Enrollment is not active until /confirm succeeds.
pub async fn totp_enroll(
    State(state): State<AppState>,
    claims: Claims,
) -> Result<Json<ApiResponse<TotpEnrollResponse>>, ApiError> {
    // Random 20-byte (160-bit) secret — standard for TOTP
    let secret_bytes: [u8; 20] = rand::rng().random();

    let totp = build_totp(&secret_bytes, &claims.username)?;
    let secret_base32 = Secret::Raw(secret_bytes.to_vec()).to_encoded().to_string();
    let otpauth_uri = totp.get_url();

    let encrypted = encrypt_totp_secret(&state.encryption_key, &secret_bytes)?;

    let db = state.db.clone();
    let user_id = claims.sub.clone();
    blocking(move || {
        let conn = db.lock().map_err(|_| ApiError::Internal)?;
        conn.execute(
            "UPDATE users SET totp_secret_encrypted = ?1, totp_enrolled = 0, updated_at = ?2 WHERE id = ?3",
            rusqlite::params![encrypted, chrono::Utc::now().to_rfc3339(), user_id],
        )
        .map_err(|_| ApiError::Internal)?;
        Ok(())
    })
    .await?;

    Ok(ApiResponse::ok(TotpEnrollResponse {
        secret: secret_base32,
        otpauth_uri,
    }))
}

/// POST /api/auth/totp/confirm
/// Verify a code against the pending secret; success marks the account as
/// TOTP-enrolled and makes the code mandatory at login.
pub async fn totp_confirm(
    State(state): State<AppState>,
    claims: Claims,
    Json(req): Json<TotpConfirmRequest>,
) -> Result<Json<ApiResponse<TotpConfirmResponse>>, ApiError> {
    let valid = verify_code(&state, &claims.sub, &req.code).await?;

    if valid {
        let db = state.db.clone();
        let user_id = claims.sub.clone();
        blocking(move || {
            let conn = db.lock().map_err(|_| ApiError::Internal)?;
            conn.execute(
                "UPDATE users SET totp_enrolled = 1, updated_at = ?1 WHERE id = ?2",
                rusqlite::params![chrono::Utc::now().to_rfc3339(), user_id],
            )
            .map_err(|_| ApiError::Internal)?;
            Ok(())
        })
        .await?;
    }

    Ok(ApiResponse::ok(TotpConfirmResponse { valid }))
}

/// Check a TOTP code against a user's stored secret. Errors if the user has
/// no secret on file.
pub async fn verify_code(state: &AppState, user_id: &str, code: &str) -> Result<bool, ApiError> {
    let db = state.db.clone();
    let uid = user_id.to_string();
    let (encrypted, username) = blocking(move || {
        let conn = db.lock().map_err(|_| ApiError::Internal)?;
        let row: (Option<Vec<u8>>, String) = conn
            .query_row(
                "SELECT totp_secret_encrypted, username FROM users WHERE id = ?1",
                [&uid],
                |r| Ok((r.get(0)?, r.get(1)?)),
            )
            .map_err(|_| ApiError::NotFound("user".to_string()))?;
        Ok(row)
    })
    .await?;

    let encrypted = encrypted.ok_or_else(|| {
        ApiError::Validation("no TOTP secret on file; enroll first".to_string())
    })?;

    let secret_bytes = decrypt_totp_secret(&state.encryption_key, &encrypted)?;
    let totp = build_totp(&secret_bytes, &username)?;
    Ok(totp.check_current(code).unwrap_or(false))
}
