use std::{
    net::IpAddr,
    time::{Duration, SystemTime, UNIX_EPOCH},
};

use anyhow::anyhow;
use argon2::{
    password_hash::rand_core::{OsRng, RngCore},
    password_hash::{PasswordHash, PasswordHasher, PasswordVerifier, SaltString},
    Argon2,
};
use axum::http::{header::AUTHORIZATION, HeaderMap};
use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine as _};
use hearth_core::UserId;
use pasetors::{
    claims::{Claims, ClaimsValidationRules},
    local,
    token::UntrustedToken,
    version4::V4,
    Local,
};
use sha2::{Digest, Sha256};

use super::{
    core::{AppState, AuthContext, ACCESS_TOKEN_TTL_SECS, MAX_MESSAGE_CONTENT_BYTES},
    errors::ApiFailure,
};

const MAX_X_FORWARDED_FOR_HEADER_CHARS: usize = 512;
const MAX_X_FORWARDED_FOR_ENTRY_CHARS: usize = 64;
const UNKNOWN_CLIENT_IP: &str = "unknown";

pub(crate) fn validate_password(value: &str) -> Result<(), ApiFailure> {
    let len = value.len();
    if (12..=128).contains(&len) {
        Ok(())
    } else {
        Err(ApiFailure::BadRequest)
    }
}

pub(crate) fn validate_message_content(content: &str) -> Result<(), ApiFailure> {
    let len = content.len();
    if (1..=MAX_MESSAGE_CONTENT_BYTES).contains(&len) {
        Ok(())
    } else {
        Err(ApiFailure::BadRequest)
    }
}

pub(crate) fn hash_password(password: &str) -> anyhow::Result<String> {
    let salt = SaltString::generate(&mut OsRng);
    let argon2 = Argon2::default();
    let hash = argon2
        .hash_password(password.as_bytes(), &salt)
        .map_err(|e| anyhow!("password hash failed: {e}"))?
        .to_string();
    Ok(hash)
}

pub(crate) fn verify_password(stored_hash: &str, supplied_password: &str) -> bool {
    let Ok(parsed) = PasswordHash::new(stored_hash) else {
        return false;
    };
    Argon2::default()
        .verify_password(supplied_password.as_bytes(), &parsed)
        .is_ok()
}

pub(crate) fn issue_tokens(
    state: &AppState,
    user_id: UserId,
    username: &str,
    session_id: &str,
) -> anyhow::Result<(String, String, [u8; 32])> {
    let mut claims = Claims::new_expires_in(&Duration::from_secs(ACCESS_TOKEN_TTL_SECS as u64))
        .map_err(|e| anyhow!("claims init failed: {e}"))?;
    claims
        .subject(&user_id.to_string())
        .map_err(|e| anyhow!("claim sub failed: {e}"))?;
    claims
        .add_additional("username", username)
        .map_err(|e| anyhow!("claim username failed: {e}"))?;

    let access_token = local::encrypt(&state.token_key, &claims, None, None)
        .map_err(|e| anyhow!("access token mint failed: {e}"))?;

    let mut refresh_secret = [0_u8; 32];
    OsRng.fill_bytes(&mut refresh_secret);
    let refresh_secret = URL_SAFE_NO_PAD.encode(refresh_secret);
    let refresh_token = format!("{session_id}.{refresh_secret}");
    let refresh_hash = hash_refresh_token(&refresh_token);

    Ok((access_token, refresh_token, refresh_hash))
}

pub(crate) fn verify_access_token(state: &AppState, token: &str) -> anyhow::Result<Claims> {
    let untrusted = UntrustedToken::<Local, V4>::try_from(token).map_err(|e| anyhow!("{e}"))?;
    let validation_rules = ClaimsValidationRules::new();
    let trusted = local::decrypt(&state.token_key, &untrusted, &validation_rules, None, None)
        .map_err(|e| anyhow!("token decrypt failed: {e}"))?;
    trusted
        .payload_claims()
        .cloned()
        .ok_or_else(|| anyhow!("token claims missing"))
}

/// Pipeline stage one: extract a bearer credential, verify it, and resolve
/// the subject to a live user. A credential that verifies but whose subject
/// no longer exists is also `Unauthorized`, so account existence is not
/// distinguishable across the two axes.
pub(crate) async fn authenticate(
    state: &AppState,
    headers: &HeaderMap,
) -> Result<AuthContext, ApiFailure> {
    let access_token = bearer_token(headers).ok_or(ApiFailure::Unauthorized)?;
    authenticate_with_token(state, access_token).await
}

pub(crate) async fn authenticate_with_token(
    state: &AppState,
    access_token: &str,
) -> Result<AuthContext, ApiFailure> {
    let claims = verify_access_token(state, access_token).map_err(|_| ApiFailure::Unauthorized)?;
    let user_id = claims
        .get_claim("sub")
        .and_then(serde_json::Value::as_str)
        .ok_or(ApiFailure::Unauthorized)?;
    let username = find_username_by_subject(state, user_id)
        .await
        .ok_or(ApiFailure::Unauthorized)?;
    let user_id = UserId::try_from(user_id.to_owned()).map_err(|_| ApiFailure::Unauthorized)?;
    Ok(AuthContext { user_id, username })
}

pub(crate) async fn find_username_by_subject(state: &AppState, user_id: &str) -> Option<String> {
    state.user_ids.read().await.get(user_id).cloned()
}

pub(crate) fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    let header = headers.get(AUTHORIZATION)?;
    let header = header.to_str().ok()?;
    header.strip_prefix("Bearer ")
}

pub(crate) fn hash_refresh_token(value: &str) -> [u8; 32] {
    Sha256::digest(value.as_bytes()).into()
}

pub(crate) fn now_unix() -> i64 {
    let now = SystemTime::now();
    let seconds = now
        .duration_since(UNIX_EPOCH)
        .unwrap_or_else(|_| Duration::from_secs(0))
        .as_secs();
    i64::try_from(seconds).unwrap_or(i64::MAX)
}

/// Client address for rate-limit keying. Precedence: first `x-forwarded-for`
/// entry, then `x-real-ip`, then the peer address. The forwarded headers are
/// only meaningful behind a trusted reverse proxy that strips them from
/// client traffic.
#[must_use]
pub(crate) fn extract_client_ip(headers: &HeaderMap, peer_ip: Option<IpAddr>) -> String {
    if let Some(forwarded) = parse_forwarded_ip(headers) {
        return forwarded.to_string();
    }
    if let Some(real_ip) = headers
        .get("x-real-ip")
        .and_then(|value| value.to_str().ok())
        .map(str::trim)
        .and_then(|value| value.parse::<IpAddr>().ok())
    {
        return real_ip.to_string();
    }
    peer_ip.map_or_else(|| String::from(UNKNOWN_CLIENT_IP), |ip| ip.to_string())
}

fn parse_forwarded_ip(headers: &HeaderMap) -> Option<IpAddr> {
    headers
        .get("x-forwarded-for")
        .and_then(|value| value.to_str().ok())
        .filter(|value| value.len() <= MAX_X_FORWARDED_FOR_HEADER_CHARS)
        .and_then(|value| value.split(',').next())
        .map(str::trim)
        .filter(|value| !value.is_empty() && value.len() <= MAX_X_FORWARDED_FOR_ENTRY_CHARS)
        .and_then(|value| value.parse::<IpAddr>().ok())
}

#[cfg(test)]
mod tests {
    use axum::http::HeaderMap;

    use super::{bearer_token, extract_client_ip, validate_password};

    #[test]
    fn client_ip_prefers_first_forwarded_entry() {
        let mut headers = HeaderMap::new();
        headers.insert(
            "x-forwarded-for",
            "198.51.100.44, 203.0.113.10".parse().expect("valid header"),
        );
        headers.insert("x-real-ip", "203.0.113.99".parse().expect("valid header"));
        let resolved = extract_client_ip(&headers, Some("10.2.0.8".parse().expect("valid ip")));
        assert_eq!(resolved, "198.51.100.44");
    }

    #[test]
    fn client_ip_falls_back_to_real_ip_then_peer() {
        let mut headers = HeaderMap::new();
        headers.insert("x-real-ip", "203.0.113.99".parse().expect("valid header"));
        let resolved = extract_client_ip(&headers, Some("10.2.0.8".parse().expect("valid ip")));
        assert_eq!(resolved, "203.0.113.99");

        let resolved = extract_client_ip(
            &HeaderMap::new(),
            Some("10.2.0.8".parse().expect("valid ip")),
        );
        assert_eq!(resolved, "10.2.0.8");

        let resolved = extract_client_ip(&HeaderMap::new(), None);
        assert_eq!(resolved, "unknown");
    }

    #[test]
    fn client_ip_skips_malformed_forwarded_value() {
        let mut headers = HeaderMap::new();
        headers.insert(
            "x-forwarded-for",
            "198.51.100.44:80".parse().expect("valid header"),
        );
        let resolved = extract_client_ip(&headers, Some("10.2.0.8".parse().expect("valid ip")));
        assert_eq!(resolved, "10.2.0.8");
    }

    #[test]
    fn client_ip_skips_oversized_forwarded_header() {
        let mut headers = HeaderMap::new();
        let oversized = format!("{},{}", "198.51.100.1", "9".repeat(600));
        headers.insert("x-forwarded-for", oversized.parse().expect("valid header"));
        let resolved = extract_client_ip(&headers, Some("10.2.0.8".parse().expect("valid ip")));
        assert_eq!(resolved, "10.2.0.8");
    }

    #[test]
    fn bearer_token_requires_scheme_prefix() {
        let mut headers = HeaderMap::new();
        headers.insert("authorization", "Bearer abc.def".parse().expect("valid"));
        assert_eq!(bearer_token(&headers), Some("abc.def"));

        let mut headers = HeaderMap::new();
        headers.insert("authorization", "Token abc".parse().expect("valid"));
        assert_eq!(bearer_token(&headers), None);
    }

    #[test]
    fn password_length_bounds_enforced() {
        assert!(validate_password("a-long-enough-password").is_ok());
        assert!(validate_password("short").is_err());
        assert!(validate_password(&"x".repeat(129)).is_err());
    }
}
