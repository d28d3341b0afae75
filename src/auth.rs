use aes_gcm::aead::{Aead, KeyInit, generic_array::GenericArray};
use aes_gcm::{Aes256Gcm, Nonce};
use anyhow::{Context, Result, bail};
use hmac::{Hmac, Mac};
use jsonwebtoken::{DecodingKey, EncodingKey, Header, Validation, decode, encode};
use pbkdf2::pbkdf2_hmac;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

const PBKDF2_ITERATIONS: u32 = 600_000;
const KEY_LENGTH: usize = 32;
const IV_LENGTH: usize = 12;

// ── Password hashing (bcrypt, cost 12) ──────────────────────────────────

pub fn hash_password(password: &str) -> Result<String> {
    bcrypt::hash(password, 12).context("hashing password")
}

pub fn verify_password(password: &str, hash: &str) -> bool {
    bcrypt::verify(password, hash).unwrap_or(false)
}

// ── Credential-at-rest encryption (AES-256-GCM, key from PBKDF2) ────────
// Format: base64(iv[12] || ciphertext || auth_tag[16]). The process-wide
// encryption key comes from Config::encryption_key; salt is fixed per
// process (derived once, not per credential) since InstitutionLink
// credentials are encrypted at rest with a single process-wide key per §3.

pub fn derive_process_key(encryption_key: &str) -> [u8; KEY_LENGTH] {
    let mut key = [0u8; KEY_LENGTH];
    pbkdf2_hmac::<Sha256>(
        encryption_key.as_bytes(),
        b"ledgerline-institution-credentials",
        PBKDF2_ITERATIONS,
        &mut key,
    );
    key
}

pub fn encrypt_credential(plaintext: &str, key: &[u8; KEY_LENGTH]) -> Result<String> {
    let cipher = Aes256Gcm::new(GenericArray::from_slice(key));

    use rand::Rng;
    let iv_bytes: [u8; IV_LENGTH] = rand::rng().random();
    let nonce = Nonce::from_slice(&iv_bytes);

    let ciphertext = cipher
        .encrypt(nonce, plaintext.as_bytes())
        .map_err(|e| anyhow::anyhow!("encryption failed: {e}"))?;

    let mut result = Vec::with_capacity(IV_LENGTH + ciphertext.len());
    result.extend_from_slice(&iv_bytes);
    result.extend_from_slice(&ciphertext);

    Ok(base64_encode(&result))
}

pub fn decrypt_credential(encrypted_b64: &str, key: &[u8; KEY_LENGTH]) -> Result<String> {
    let data = base64_decode(encrypted_b64).context("decoding encrypted credential")?;
    if data.len() < IV_LENGTH + 16 {
        bail!("encrypted credential too short");
    }

    let cipher = Aes256Gcm::new(GenericArray::from_slice(key));
    let nonce = Nonce::from_slice(&data[..IV_LENGTH]);
    let ciphertext_with_tag = &data[IV_LENGTH..];

    let plaintext = cipher
        .decrypt(nonce, ciphertext_with_tag)
        .map_err(|e| anyhow::anyhow!("decryption failed: {e}"))?;

    String::from_utf8(plaintext).context("decrypted credential is not valid utf8")
}

// ── JWT: short-lived access + long-lived refresh, distinct secrets ──────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    pub sub: String,
    pub email: String,
    pub plan: String,
    #[serde(rename = "type")]
    pub token_type: String,
    pub exp: usize,
}

pub fn create_access_token(
    user_id: &str,
    email: &str,
    plan: &str,
    secret: &str,
    minutes: i64,
) -> Result<String> {
    create_token(user_id, email, plan, "access", secret, minutes * 60)
}

pub fn create_refresh_token(
    user_id: &str,
    email: &str,
    plan: &str,
    secret: &str,
    days: i64,
) -> Result<String> {
    create_token(user_id, email, plan, "refresh", secret, days * 86400)
}

fn create_token(
    user_id: &str,
    email: &str,
    plan: &str,
    token_type: &str,
    secret: &str,
    ttl_seconds: i64,
) -> Result<String> {
    let exp = (chrono::Utc::now() + chrono::Duration::seconds(ttl_seconds)).timestamp() as usize;
    let claims = Claims {
        sub: user_id.to_string(),
        email: email.to_string(),
        plan: plan.to_string(),
        token_type: token_type.to_string(),
        exp,
    };
    encode(
        &Header::default(),
        &claims,
        &EncodingKey::from_secret(secret.as_bytes()),
    )
    .context("creating jwt")
}

/// Verify a token and assert its `type` claim. Rejects a refresh token
/// presented where an access token is required and vice versa.
pub fn verify_token(token: &str, secret: &str, expected_type: &str) -> Result<Claims> {
    let data = decode::<Claims>(
        token,
        &DecodingKey::from_secret(secret.as_bytes()),
        &Validation::default(),
    )
    .context("invalid token")?;

    if data.claims.token_type != expected_type {
        bail!("wrong token type: expected {expected_type}, got {}", data.claims.token_type);
    }

    Ok(data.claims)
}

// ── Refresh-token storage: only a hash is ever persisted ────────────────

pub fn hash_refresh_token(token: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(token.as_bytes());
    hex_encode(&hasher.finalize())
}

/// Opaque random salt generator, reused for any place that wants a random
/// base64 string.
pub fn generate_salt() -> String {
    use rand::Rng;
    let bytes: [u8; 32] = rand::rng().random();
    base64_encode(&bytes)
}

type HmacSha256 = Hmac<Sha256>;

/// Constant-effort HMAC, available for any future webhook-signature
/// verification (aggregator webhooks are bearer-token gated in this design,
/// but the primitive is kept here alongside the other auth primitives).
pub fn hmac_sha256_hex(key: &[u8], message: &[u8]) -> String {
    let mut mac = <HmacSha256 as Mac>::new_from_slice(key).expect("hmac accepts any key length");
    mac.update(message);
    hex_encode(&mac.finalize().into_bytes())
}

fn hex_encode(data: &[u8]) -> String {
    use std::fmt::Write;
    let mut s = String::with_capacity(data.len() * 2);
    for b in data {
        let _ = write!(s, "{b:02x}");
    }
    s
}

// ── Base64 helpers (standard alphabet, no external crate) ───────────────

fn base64_encode(data: &[u8]) -> String {
    use std::fmt::Write;
    let alphabet = b"ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789+/";
    let mut s = String::new();
    for chunk in data.chunks(3) {
        let b0 = chunk[0] as u32;
        let b1 = chunk.get(1).copied().unwrap_or(0) as u32;
        let b2 = chunk.get(2).copied().unwrap_or(0) as u32;
        let n = (b0 << 16) | (b1 << 8) | b2;
        let _ = write!(s, "{}", alphabet[((n >> 18) & 63) as usize] as char);
        let _ = write!(s, "{}", alphabet[((n >> 12) & 63) as usize] as char);
        if chunk.len() > 1 {
            let _ = write!(s, "{}", alphabet[((n >> 6) & 63) as usize] as char);
        } else {
            s.push('=');
        }
        if chunk.len() > 2 {
            let _ = write!(s, "{}", alphabet[(n & 63) as usize] as char);
        } else {
            s.push('=');
        }
    }
    s
}

fn base64_decode(input: &str) -> Result<Vec<u8>> {
    let input = input.trim_end_matches('=');
    let alphabet = b"ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789+/";
    let mut lookup = [255u8; 256];
    for (i, &c) in alphabet.iter().enumerate() {
        lookup[c as usize] = i as u8;
    }

    let bytes: Vec<u8> = input
        .bytes()
        .filter(|b| lookup[*b as usize] != 255)
        .collect();

    let mut result = Vec::new();
    for chunk in bytes.chunks(4) {
        let mut n = 0u32;
        for (i, &b) in chunk.iter().enumerate() {
            n |= (lookup[b as usize] as u32) << (18 - 6 * i);
        }
        result.push((n >> 16) as u8);
        if chunk.len() > 2 {
            result.push((n >> 8) as u8);
        }
        if chunk.len() > 3 {
            result.push(n as u8);
        }
    }

    Ok(result)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn password_round_trips() {
        let hash = hash_password("correcthorsebatterystaple").unwrap();
        assert!(verify_password("correcthorsebatterystaple", &hash));
        assert!(!verify_password("wrong", &hash));
    }

    #[test]
    fn credential_round_trips() {
        let key = derive_process_key("a-long-enough-encryption-key-value");
        let enc = encrypt_credential("super-secret-oauth-token", &key).unwrap();
        assert_ne!(enc, "super-secret-oauth-token");
        let dec = decrypt_credential(&enc, &key).unwrap();
        assert_eq!(dec, "super-secret-oauth-token");
    }

    #[test]
    fn access_token_rejected_as_refresh() {
        let t = create_access_token("u1", "a@b.com", "free", "secret", 15).unwrap();
        assert!(verify_token(&t, "secret", "refresh").is_err());
        assert!(verify_token(&t, "secret", "access").is_ok());
    }

    #[test]
    fn refresh_token_hash_is_deterministic() {
        let a = hash_refresh_token("same-token");
        let b = hash_refresh_token("same-token");
        assert_eq!(a, b);
        assert_ne!(a, hash_refresh_token("different-token"));
    }
}
