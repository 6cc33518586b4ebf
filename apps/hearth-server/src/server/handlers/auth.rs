use std::net::SocketAddr;

use axum::{
    extract::{ConnectInfo, Extension, Json, State},
    http::{HeaderMap, StatusCode},
};
use hearth_core::{UserId, Username};
use ulid::Ulid;

use crate::server::{
    auth::{
        authenticate, extract_client_ip, hash_password, hash_refresh_token, issue_tokens,
        now_unix, validate_password, verify_password,
    },
    core::{
        AppState, SessionRecord, UserRecord, ACCESS_TOKEN_TTL_SECS, LOGIN_LOCK_SECS,
        LOGIN_LOCK_THRESHOLD, REFRESH_TOKEN_TTL_SECS,
    },
    errors::ApiFailure,
    metrics::record_rate_limit_hit,
    realtime::user_status,
    types::{
        ok, ApiResponse, AuthResponse, LoginRequest, MeResponse, RefreshRequest, RegisterRequest,
        RegisterResponse,
    },
};

const DEFAULT_LOCALE: &str = "en";
const MAX_LOCALE_CHARS: usize = 16;

pub(crate) async fn register(
    State(state): State<AppState>,
    Json(payload): Json<RegisterRequest>,
) -> Result<Json<ApiResponse<RegisterResponse>>, ApiFailure> {
    let username = Username::try_from(payload.username).map_err(|_| ApiFailure::BadRequest)?;
    validate_password(&payload.password)?;
    let locale = payload.locale.unwrap_or_else(|| DEFAULT_LOCALE.to_owned());
    if locale.is_empty() || locale.len() > MAX_LOCALE_CHARS {
        return Err(ApiFailure::BadRequest);
    }

    let mut users = state.users.write().await;
    if users.contains_key(username.as_str()) {
        // Same acceptance response either way to avoid registration-time
        // account enumeration.
        return Ok(ok(RegisterResponse { accepted: true }));
    }

    let password_hash = hash_password(&payload.password).map_err(|_| ApiFailure::Internal)?;
    let user_id = UserId::new();
    users.insert(
        username.as_str().to_owned(),
        UserRecord {
            id: user_id,
            username: username.clone(),
            password_hash,
            locale,
            manual_status: None,
            failed_logins: 0,
            locked_until_unix: None,
        },
    );
    drop(users);
    state
        .user_ids
        .write()
        .await
        .insert(user_id.to_string(), username.as_str().to_owned());

    Ok(ok(RegisterResponse { accepted: true }))
}

#[allow(clippy::too_many_lines)]
pub(crate) async fn login(
    State(state): State<AppState>,
    headers: HeaderMap,
    connect_info: Option<Extension<ConnectInfo<SocketAddr>>>,
    Json(payload): Json<LoginRequest>,
) -> Result<Json<ApiResponse<AuthResponse>>, ApiFailure> {
    let client_ip = extract_client_ip(
        &headers,
        connect_info.as_ref().map(|value| value.0 .0.ip()),
    );
    if !state.login_limiter.allow(&client_ip) {
        let retry_after_secs = state.login_limiter.remaining_cooldown_secs(&client_ip).max(1);
        record_rate_limit_hit("login", "window_exceeded");
        tracing::warn!(
            event = "auth.login.rate_limited",
            client_ip = %client_ip,
            retry_after_secs
        );
        return Err(ApiFailure::RateLimited { retry_after_secs });
    }

    let username = Username::try_from(payload.username).map_err(|_| ApiFailure::Unauthorized)?;
    validate_password(&payload.password).map_err(|_| ApiFailure::Unauthorized)?;

    let mut users = state.users.write().await;
    let now = now_unix();
    let mut user_id = None;
    let mut username_text = None;
    let mut verified = false;

    if let Some(user) = users.get_mut(username.as_str()) {
        if user
            .locked_until_unix
            .is_some_and(|lock_until| lock_until > now)
        {
            return Err(ApiFailure::Unauthorized);
        }

        verified = verify_password(&user.password_hash, &payload.password);
        if verified {
            user.failed_logins = 0;
            user.locked_until_unix = None;
            user_id = Some(user.id);
            username_text = Some(user.username.as_str().to_owned());
        } else {
            user.failed_logins = user.failed_logins.saturating_add(1);
            if user.failed_logins >= LOGIN_LOCK_THRESHOLD {
                user.locked_until_unix = Some(now + LOGIN_LOCK_SECS);
                user.failed_logins = 0;
            }
        }
    } else {
        // Keep timing behavior closer to existing users and prevent
        // enumeration.
        let _ = verify_password(&state.dummy_password_hash, &payload.password);
    }
    drop(users);

    if !verified {
        return Err(ApiFailure::Unauthorized);
    }

    // A successful login clears prior failed attempts for this address.
    state.login_limiter.reset(&client_ip);

    let user_id = user_id.ok_or(ApiFailure::Internal)?;
    let username_text = username_text.ok_or(ApiFailure::Internal)?;
    let session_id = Ulid::new().to_string();
    let (access_token, refresh_token, refresh_hash) =
        issue_tokens(&state, user_id, &username_text, &session_id)
            .map_err(|_| ApiFailure::Internal)?;
    state.sessions.write().await.insert(
        session_id,
        SessionRecord {
            user_id,
            refresh_token_hash: refresh_hash,
            expires_at_unix: now + REFRESH_TOKEN_TTL_SECS,
            revoked: false,
        },
    );

    Ok(ok(AuthResponse {
        access_token,
        refresh_token,
        expires_in_secs: ACCESS_TOKEN_TTL_SECS,
    }))
}

pub(crate) async fn refresh(
    State(state): State<AppState>,
    Json(payload): Json<RefreshRequest>,
) -> Result<Json<ApiResponse<AuthResponse>>, ApiFailure> {
    if payload.refresh_token.is_empty() || payload.refresh_token.len() > 512 {
        return Err(ApiFailure::Unauthorized);
    }

    let token_hash = hash_refresh_token(&payload.refresh_token);
    if let Some(session_id) = state
        .used_refresh_tokens
        .read()
        .await
        .get(&token_hash)
        .cloned()
    {
        // Replay of a rotated token burns the whole session.
        if let Some(session) = state.sessions.write().await.get_mut(&session_id) {
            session.revoked = true;
        }
        return Err(ApiFailure::Unauthorized);
    }

    let session_id = payload
        .refresh_token
        .split('.')
        .next()
        .ok_or(ApiFailure::Unauthorized)?
        .to_owned();

    let mut sessions = state.sessions.write().await;
    let session = sessions
        .get_mut(&session_id)
        .ok_or(ApiFailure::Unauthorized)?;
    if session.revoked
        || session.expires_at_unix < now_unix()
        || session.refresh_token_hash != token_hash
    {
        return Err(ApiFailure::Unauthorized);
    }

    let user_id = session.user_id;
    let username = {
        let user_ids = state.user_ids.read().await;
        user_ids
            .get(&user_id.to_string())
            .cloned()
            .ok_or(ApiFailure::Unauthorized)?
    };

    let old_hash = session.refresh_token_hash;
    let (access_token, refresh_token, refresh_hash) =
        issue_tokens(&state, user_id, &username, &session_id).map_err(|_| ApiFailure::Internal)?;
    session.refresh_token_hash = refresh_hash;
    session.expires_at_unix = now_unix() + REFRESH_TOKEN_TTL_SECS;
    drop(sessions);

    state
        .used_refresh_tokens
        .write()
        .await
        .insert(old_hash, session_id);

    Ok(ok(AuthResponse {
        access_token,
        refresh_token,
        expires_in_secs: ACCESS_TOKEN_TTL_SECS,
    }))
}

pub(crate) async fn logout(
    State(state): State<AppState>,
    Json(payload): Json<RefreshRequest>,
) -> Result<StatusCode, ApiFailure> {
    if payload.refresh_token.is_empty() || payload.refresh_token.len() > 512 {
        return Err(ApiFailure::Unauthorized);
    }

    let session_id = payload
        .refresh_token
        .split('.')
        .next()
        .ok_or(ApiFailure::Unauthorized)?
        .to_owned();
    let token_hash = hash_refresh_token(&payload.refresh_token);
    let mut sessions = state.sessions.write().await;
    let session = sessions
        .get_mut(&session_id)
        .ok_or(ApiFailure::Unauthorized)?;
    if session.refresh_token_hash != token_hash {
        return Err(ApiFailure::Unauthorized);
    }
    session.revoked = true;
    Ok(StatusCode::NO_CONTENT)
}

pub(crate) async fn me(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<ApiResponse<MeResponse>>, ApiFailure> {
    let auth = authenticate(&state, &headers).await?;
    let locale = {
        let users = state.users.read().await;
        users
            .get(&auth.username)
            .map(|user| user.locale.clone())
            .ok_or(ApiFailure::Unauthorized)?
    };
    let status = user_status(&state, auth.user_id).await;

    Ok(ok(MeResponse {
        user_id: auth.user_id.to_string(),
        username: auth.username,
        locale,
        status: status.as_str().to_owned(),
    }))
}
