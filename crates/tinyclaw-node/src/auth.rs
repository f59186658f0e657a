// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Owner authentication: bootstrap secret, TOTP, session cookie, backup
//! codes, and the recovery token.
//!
//! Only SHA-256 hashes of credentials are persisted; verification uses
//! [`subtle::ConstantTimeEq`] everywhere so the comparison time never leaks
//! how close a guess was. The bootstrap secret and in-progress enrollment
//! state are process-local: a restart regenerates the bootstrap secret and
//! silently drops unfinished setups.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use hmac::{Hmac, Mac};
use rand::Rng;
use sha1::Sha1;
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;
use thiserror::Error;
use uuid::Uuid;

use tinyclaw_store::SecurityStore;

/// Human-friendly alphabet: no 0/O/1/I/L.
const ALPHABET: &[u8] = b"ABCDEFGHJKLMNPQRSTUVWXYZ23456789";

const BOOTSTRAP_LEN: usize = 30;
const BOOTSTRAP_TTL: Duration = Duration::from_secs(3600);
const BACKUP_CODE_LEN: usize = 30;
const BACKUP_CODE_COUNT: usize = 10;
const RECOVERY_TOKEN_LEN: usize = 200;
const SESSION_TOKEN_LEN: usize = 48;
const SETUP_SESSION_TTL: Duration = Duration::from_secs(900);

const KEY_OWNER_ID: &str = "owner_id";
const KEY_SESSION_HASH: &str = "session_hash";
const KEY_TOTP_SECRET: &str = "totp_secret";
const KEY_BACKUP_HASHES: &str = "backup_code_hashes";
const KEY_RECOVERY_HASH: &str = "recovery_token_hash";
const KEY_API_KEY: &str = "provider_api_key";

#[derive(Debug, Error)]
pub enum AuthError {
    #[error("invalid credentials")]
    InvalidCredentials,
    #[error("setup already completed")]
    AlreadyClaimed,
    #[error("no setup in progress")]
    NoSetupSession,
    #[error("bootstrap secret expired")]
    BootstrapExpired,
    #[error(transparent)]
    Store(#[from] anyhow::Error),
}

struct Bootstrap {
    secret: String,
    issued_at: Instant,
    consumed: bool,
}

struct PendingEnrollment {
    totp_secret: String,
    created_at: Instant,
}

pub struct AuthService {
    security: Arc<SecurityStore>,
    bootstrap: Mutex<Bootstrap>,
    /// setup token → pending TOTP enrollment (initial setup).
    setup_sessions: Mutex<HashMap<String, PendingEnrollment>>,
    /// session-authenticated TOTP re-enrollment in progress.
    reenroll: Mutex<Option<PendingEnrollment>>,
    /// recovery session id → issue time.
    recovery_sessions: Mutex<HashMap<String, Instant>>,
}

/// Everything handed to the owner exactly once at setup completion.
pub struct SetupArtifacts {
    pub backup_codes: Vec<String>,
    pub recovery_token: String,
    pub session_token: String,
}

impl AuthService {
    pub fn new(security: Arc<SecurityStore>) -> Self {
        let secret = generate(BOOTSTRAP_LEN);
        tracing::info!("bootstrap secret generated (valid 1h): {secret}");
        Self {
            security,
            bootstrap: Mutex::new(Bootstrap { secret, issued_at: Instant::now(), consumed: false }),
            setup_sessions: Mutex::new(HashMap::new()),
            reenroll: Mutex::new(None),
            recovery_sessions: Mutex::new(HashMap::new()),
        }
    }

    pub fn bootstrap_secret_for_display(&self) -> String {
        self.bootstrap.lock().expect("auth mutex").secret.clone()
    }

    // ── Status ───────────────────────────────────────────────────────────────

    pub fn owner_id(&self) -> Option<String> {
        self.security.get(KEY_OWNER_ID).ok().flatten()
    }

    pub fn is_claimed(&self) -> bool {
        self.owner_id().is_some()
    }

    pub fn mfa_configured(&self) -> bool {
        matches!(self.security.get(KEY_TOTP_SECRET), Ok(Some(_)))
    }

    // ── Setup ────────────────────────────────────────────────────────────────

    /// Verify the one-time bootstrap secret; issue a short-lived setup token
    /// and a fresh TOTP secret.
    pub fn begin_setup(&self, secret: &str) -> Result<(String, String, String), AuthError> {
        if self.is_claimed() {
            return Err(AuthError::AlreadyClaimed);
        }
        {
            let bootstrap = self.bootstrap.lock().expect("auth mutex");
            if bootstrap.consumed || bootstrap.issued_at.elapsed() > BOOTSTRAP_TTL {
                return Err(AuthError::BootstrapExpired);
            }
            if !ct_eq(secret.as_bytes(), bootstrap.secret.as_bytes()) {
                return Err(AuthError::InvalidCredentials);
            }
        }

        let setup_token = generate(BOOTSTRAP_LEN);
        let totp_secret = generate_totp_secret();
        let uri = totp_uri(&totp_secret);
        self.setup_sessions.lock().expect("auth mutex").insert(
            setup_token.clone(),
            PendingEnrollment { totp_secret: totp_secret.clone(), created_at: Instant::now() },
        );
        Ok((setup_token, totp_secret, uri))
    }

    /// Confirm TOTP, persist owner identity and the API key, and mint the
    /// one-time recovery artifacts.
    pub fn complete_setup(
        &self,
        setup_token: &str,
        owner_id: &str,
        api_key: Option<&str>,
        totp_code: &str,
    ) -> Result<SetupArtifacts, AuthError> {
        if self.is_claimed() {
            return Err(AuthError::AlreadyClaimed);
        }
        let enrollment = {
            let mut sessions = self.setup_sessions.lock().expect("auth mutex");
            sessions.retain(|_, s| s.created_at.elapsed() < SETUP_SESSION_TTL);
            sessions.remove(setup_token).ok_or(AuthError::NoSetupSession)?
        };
        if !verify_totp(&enrollment.totp_secret, totp_code) {
            // Put the session back so a typo does not force a restart.
            self.setup_sessions
                .lock()
                .expect("auth mutex")
                .insert(setup_token.to_string(), enrollment);
            return Err(AuthError::InvalidCredentials);
        }

        self.security.put(KEY_OWNER_ID, owner_id)?;
        self.security.put(KEY_TOTP_SECRET, &enrollment.totp_secret)?;
        if let Some(key) = api_key {
            self.security.put(KEY_API_KEY, key)?;
        }
        self.bootstrap.lock().expect("auth mutex").consumed = true;

        let artifacts = self.rotate_recovery_artifacts()?;
        Ok(artifacts)
    }

    /// Mint new backup codes and recovery token, replacing any existing
    /// ones, and start a fresh session.
    fn rotate_recovery_artifacts(&self) -> Result<SetupArtifacts, AuthError> {
        let backup_codes: Vec<String> =
            (0..BACKUP_CODE_COUNT).map(|_| generate(BACKUP_CODE_LEN)).collect();
        let hashes: Vec<String> = backup_codes.iter().map(|c| sha256_hex(c)).collect();
        self.security
            .put(KEY_BACKUP_HASHES, &serde_json::to_string(&hashes).unwrap_or_default())?;

        let recovery_token = generate(RECOVERY_TOKEN_LEN);
        self.security.put(KEY_RECOVERY_HASH, &sha256_hex(&recovery_token))?;

        let session_token = self.start_session()?;
        Ok(SetupArtifacts { backup_codes, recovery_token, session_token })
    }

    // ── Login / session ──────────────────────────────────────────────────────

    pub fn login_with_totp(&self, code: &str) -> Result<String, AuthError> {
        let secret = self
            .security
            .get(KEY_TOTP_SECRET)?
            .ok_or(AuthError::InvalidCredentials)?;
        if !verify_totp(&secret, code) {
            return Err(AuthError::InvalidCredentials);
        }
        self.start_session()
    }

    /// Mint a session token; only its SHA-256 hash is stored.
    fn start_session(&self) -> Result<String, AuthError> {
        let token = generate(SESSION_TOKEN_LEN);
        self.security.put(KEY_SESSION_HASH, &sha256_hex(&token))?;
        Ok(token)
    }

    pub fn verify_session(&self, token: &str) -> bool {
        match self.security.get(KEY_SESSION_HASH) {
            Ok(Some(stored)) => ct_eq(sha256_hex(token).as_bytes(), stored.as_bytes()),
            _ => false,
        }
    }

    // ── Recovery ─────────────────────────────────────────────────────────────

    /// Consume the recovery token, opening a short-lived recovery session.
    pub fn validate_recovery_token(&self, token: &str) -> Result<String, AuthError> {
        let stored = self
            .security
            .get(KEY_RECOVERY_HASH)?
            .ok_or(AuthError::InvalidCredentials)?;
        if !ct_eq(sha256_hex(token).as_bytes(), stored.as_bytes()) {
            return Err(AuthError::InvalidCredentials);
        }
        // One-shot: the token cannot be replayed.
        self.security.delete(KEY_RECOVERY_HASH)?;

        let session_id = Uuid::new_v4().to_string();
        self.recovery_sessions
            .lock()
            .expect("auth mutex")
            .insert(session_id.clone(), Instant::now());
        Ok(session_id)
    }

    /// Consume one backup code inside a recovery session; on success the
    /// owner gets a normal session cookie.
    pub fn use_backup_code(
        &self,
        recovery_session: &str,
        code: &str,
    ) -> Result<String, AuthError> {
        {
            let mut sessions = self.recovery_sessions.lock().expect("auth mutex");
            sessions.retain(|_, t| t.elapsed() < SETUP_SESSION_TTL);
            if !sessions.contains_key(recovery_session) {
                return Err(AuthError::InvalidCredentials);
            }
        }

        let raw = self
            .security
            .get(KEY_BACKUP_HASHES)?
            .ok_or(AuthError::InvalidCredentials)?;
        let mut hashes: Vec<String> = serde_json::from_str(&raw).unwrap_or_default();
        let code_hash = sha256_hex(code);
        let matched = hashes
            .iter()
            .position(|h| ct_eq(code_hash.as_bytes(), h.as_bytes()));
        let Some(index) = matched else {
            return Err(AuthError::InvalidCredentials);
        };

        hashes.remove(index);
        self.security
            .put(KEY_BACKUP_HASHES, &serde_json::to_string(&hashes).unwrap_or_default())?;
        self.recovery_sessions
            .lock()
            .expect("auth mutex")
            .remove(recovery_session);
        self.start_session()
    }

    // ── TOTP re-enrollment ───────────────────────────────────────────────────

    pub fn begin_totp_reenroll(&self) -> (String, String) {
        let secret = generate_totp_secret();
        let uri = totp_uri(&secret);
        *self.reenroll.lock().expect("auth mutex") = Some(PendingEnrollment {
            totp_secret: secret.clone(),
            created_at: Instant::now(),
        });
        (secret, uri)
    }

    /// Confirm the new TOTP secret; backup codes and the recovery token
    /// rotate with it.
    pub fn confirm_totp_reenroll(&self, code: &str) -> Result<SetupArtifacts, AuthError> {
        let pending = {
            let mut slot = self.reenroll.lock().expect("auth mutex");
            match slot.take() {
                Some(p) if p.created_at.elapsed() < SETUP_SESSION_TTL => p,
                _ => return Err(AuthError::NoSetupSession),
            }
        };
        if !verify_totp(&pending.totp_secret, code) {
            *self.reenroll.lock().expect("auth mutex") = Some(pending);
            return Err(AuthError::InvalidCredentials);
        }
        self.security.put(KEY_TOTP_SECRET, &pending.totp_secret)?;
        self.rotate_recovery_artifacts().map_err(Into::into)
    }

    pub fn stored_api_key(&self) -> Option<String> {
        self.security.get(KEY_API_KEY).ok().flatten()
    }

    /// Test hook: produce a currently valid TOTP code for the stored secret.
    pub fn current_totp_code(&self) -> Option<String> {
        let secret = self.security.get(KEY_TOTP_SECRET).ok().flatten()?;
        Some(totp_at(&secret, chrono::Utc::now().timestamp() as u64 / 30))
    }

    /// Test hook: a currently valid TOTP code for an in-progress setup
    /// session (real clients scan the QR into an authenticator app instead).
    pub fn totp_code_for_pending_setup(&self, setup_token: &str) -> Option<String> {
        let sessions = self.setup_sessions.lock().expect("auth mutex");
        let pending = sessions.get(setup_token)?;
        Some(totp_at(
            &pending.totp_secret,
            chrono::Utc::now().timestamp() as u64 / 30,
        ))
    }
}

// ── Primitives ────────────────────────────────────────────────────────────────

fn generate(len: usize) -> String {
    let mut rng = rand::thread_rng();
    (0..len)
        .map(|_| ALPHABET[rng.gen_range(0..ALPHABET.len())] as char)
        .collect()
}

pub(crate) fn sha256_hex(input: &str) -> String {
    hex::encode(Sha256::digest(input.as_bytes()))
}

fn ct_eq(a: &[u8], b: &[u8]) -> bool {
    a.len() == b.len() && a.ct_eq(b).into()
}

fn generate_totp_secret() -> String {
    let mut bytes = [0u8; 20];
    rand::thread_rng().fill(&mut bytes);
    base32::encode(base32::Alphabet::Rfc4648 { padding: false }, &bytes)
}

fn totp_uri(secret: &str) -> String {
    format!("otpauth://totp/tinyclaw:owner?secret={secret}&issuer=tinyclaw&digits=6&period=30")
}

/// RFC 6238 with SHA-1, 6 digits, 30-second steps, ±1 step skew.
fn verify_totp(secret: &str, code: &str) -> bool {
    let step = chrono::Utc::now().timestamp() as u64 / 30;
    [step.wrapping_sub(1), step, step + 1]
        .iter()
        .any(|s| ct_eq(totp_at(secret, *s).as_bytes(), code.as_bytes()))
}

fn totp_at(secret: &str, step: u64) -> String {
    let Some(key) = base32::decode(base32::Alphabet::Rfc4648 { padding: false }, secret) else {
        return String::new();
    };
    let mut mac = match Hmac::<Sha1>::new_from_slice(&key) {
        Ok(m) => m,
        Err(_) => return String::new(),
    };
    mac.update(&step.to_be_bytes());
    let digest = mac.finalize().into_bytes();

    let offset = (digest[19] & 0x0f) as usize;
    let binary = ((digest[offset] as u32 & 0x7f) << 24)
        | ((digest[offset + 1] as u32) << 16)
        | ((digest[offset + 2] as u32) << 8)
        | (digest[offset + 3] as u32);
    format!("{:06}", binary % 1_000_000)
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn service() -> AuthService {
        AuthService::new(Arc::new(SecurityStore::open_in_memory().unwrap()))
    }

    fn complete_setup(auth: &AuthService) -> SetupArtifacts {
        let bootstrap = auth.bootstrap_secret_for_display();
        let (token, secret, uri) = auth.begin_setup(&bootstrap).unwrap();
        assert!(uri.starts_with("otpauth://totp/tinyclaw"));
        let code = totp_at(&secret, chrono::Utc::now().timestamp() as u64 / 30);
        auth.complete_setup(&token, "owner-1", Some("sk-test"), &code)
            .unwrap()
    }

    #[test]
    fn bootstrap_secret_uses_human_alphabet() {
        let auth = service();
        let secret = auth.bootstrap_secret_for_display();
        assert_eq!(secret.len(), 30);
        assert!(secret.bytes().all(|b| ALPHABET.contains(&b)));
        for forbidden in ['0', 'O', '1', 'I', 'L'] {
            assert!(!secret.contains(forbidden));
        }
    }

    #[test]
    fn full_setup_flow_claims_instance() {
        let auth = service();
        assert!(!auth.is_claimed());
        let artifacts = complete_setup(&auth);

        assert!(auth.is_claimed());
        assert!(auth.mfa_configured());
        assert_eq!(auth.owner_id().as_deref(), Some("owner-1"));
        assert_eq!(artifacts.backup_codes.len(), 10);
        assert_eq!(artifacts.recovery_token.len(), 200);
        assert!(auth.verify_session(&artifacts.session_token));
        assert_eq!(auth.stored_api_key().as_deref(), Some("sk-test"));
    }

    #[test]
    fn wrong_bootstrap_secret_is_rejected() {
        let auth = service();
        assert!(matches!(
            auth.begin_setup("WRONGSECRETWRONGSECRETWRONGSEC"),
            Err(AuthError::InvalidCredentials)
        ));
    }

    #[test]
    fn second_claim_is_rejected() {
        let auth = service();
        complete_setup(&auth);
        assert!(matches!(
            auth.begin_setup(&auth.bootstrap_secret_for_display()),
            Err(AuthError::AlreadyClaimed)
        ));
    }

    #[test]
    fn totp_login_rotates_session() {
        let auth = service();
        let artifacts = complete_setup(&auth);
        let code = auth.current_totp_code().unwrap();
        let new_session = auth.login_with_totp(&code).unwrap();

        assert!(auth.verify_session(&new_session));
        // The old session hash was replaced.
        assert!(!auth.verify_session(&artifacts.session_token));
        assert!(auth.login_with_totp("000000").is_err() || code == "000000");
    }

    #[test]
    fn recovery_token_is_single_use_and_backup_codes_burn() {
        let auth = service();
        let artifacts = complete_setup(&auth);

        let session_id = auth.validate_recovery_token(&artifacts.recovery_token).unwrap();
        // Replay fails.
        assert!(auth.validate_recovery_token(&artifacts.recovery_token).is_err());

        let code = artifacts.backup_codes[0].clone();
        let session = auth.use_backup_code(&session_id, &code).unwrap();
        assert!(auth.verify_session(&session));

        // The used code is gone; a second recovery session is needed anyway.
        let session_id2 = {
            let artifacts2 = auth.rotate_recovery_artifacts().unwrap();
            auth.validate_recovery_token(&artifacts2.recovery_token).unwrap()
        };
        assert!(auth.use_backup_code(&session_id2, &code).is_err());
    }

    #[test]
    fn reenroll_rotates_backup_codes() {
        let auth = service();
        let before = complete_setup(&auth);
        let (secret, _) = auth.begin_totp_reenroll();
        let code = totp_at(&secret, chrono::Utc::now().timestamp() as u64 / 30);
        let after = auth.confirm_totp_reenroll(&code).unwrap();

        assert_ne!(before.recovery_token, after.recovery_token);
        // Old recovery token no longer validates.
        assert!(auth.validate_recovery_token(&before.recovery_token).is_err());
    }

    #[test]
    fn totp_rejects_garbage_codes() {
        let auth = service();
        complete_setup(&auth);
        assert!(auth.login_with_totp("not-a-code").is_err());
    }
}
