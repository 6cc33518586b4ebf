use anyhow::anyhow;
use axum::{
    extract::{Json, Path, State},
    http::HeaderMap,
};
use hearth_core::{has_permission, ChannelKind, Permission, UserId};
use pasetors::{claims::Claims, local};

use crate::server::{
    auth::{authenticate, now_unix},
    core::AppState,
    errors::ApiFailure,
    gateway_events,
    pipeline::require_channel_permission,
    realtime::broadcast_tenant_event,
    types::{ok, ApiResponse, ChannelPath, VoiceGrantResponse},
};

/// Mint a short-lived grant the external media transport verifies. The
/// core never touches media; this token is the entire handoff.
fn issue_voice_grant(
    state: &AppState,
    user_id: UserId,
    tenant_id: &str,
    channel_id: &str,
    can_speak: bool,
    can_stream: bool,
) -> anyhow::Result<(String, i64)> {
    let ttl = state.runtime.voice_grant_ttl;
    let mut claims =
        Claims::new_expires_in(&ttl).map_err(|e| anyhow!("grant claims init failed: {e}"))?;
    claims
        .subject(&user_id.to_string())
        .map_err(|e| anyhow!("grant sub failed: {e}"))?;
    claims
        .add_additional("tenant_id", tenant_id)
        .map_err(|e| anyhow!("grant tenant claim failed: {e}"))?;
    claims
        .add_additional("channel_id", channel_id)
        .map_err(|e| anyhow!("grant channel claim failed: {e}"))?;
    claims
        .add_additional("can_speak", can_speak)
        .map_err(|e| anyhow!("grant speak claim failed: {e}"))?;
    claims
        .add_additional("can_stream", can_stream)
        .map_err(|e| anyhow!("grant stream claim failed: {e}"))?;

    let token = local::encrypt(&state.token_key, &claims, None, None)
        .map_err(|e| anyhow!("grant mint failed: {e}"))?;
    let expires_at_unix = now_unix() + i64::try_from(ttl.as_secs()).unwrap_or(i64::MAX);
    Ok((token, expires_at_unix))
}

pub(crate) async fn join_voice(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(path): Path<ChannelPath>,
) -> Result<Json<ApiResponse<VoiceGrantResponse>>, ApiFailure> {
    let auth = authenticate(&state, &headers).await?;
    let context = require_channel_permission(
        &state,
        &auth,
        &path.tenant_id,
        &path.channel_id,
        Permission::ConnectVoice,
    )
    .await?;

    {
        let tenants = state.tenants.read().await;
        let tenant = tenants
            .get(&context.tenant_id)
            .ok_or(ApiFailure::Forbidden)?;
        let channel = tenant
            .channels
            .get(&path.channel_id)
            .ok_or(ApiFailure::NotFound)?;
        if channel.kind != ChannelKind::Voice {
            return Err(ApiFailure::BadRequest);
        }
    }

    let can_speak = has_permission(context.permissions, Permission::Speak);
    let can_stream = has_permission(context.permissions, Permission::Stream);
    let (grant_token, expires_at_unix) = issue_voice_grant(
        &state,
        auth.user_id,
        &context.tenant_id,
        &path.channel_id,
        can_speak,
        can_stream,
    )
    .map_err(|_| ApiFailure::Internal)?;

    let event =
        gateway_events::voice_join(&state, &context.tenant_id, &path.channel_id, auth.user_id);
    broadcast_tenant_event(&state, &context.tenant_id, &event).await;

    Ok(ok(VoiceGrantResponse {
        tenant_id: context.tenant_id,
        channel_id: path.channel_id,
        user_id: auth.user_id.to_string(),
        can_speak,
        can_stream,
        grant_token,
        expires_at_unix,
    }))
}

pub(crate) async fn leave_voice(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(path): Path<ChannelPath>,
) -> Result<Json<ApiResponse<()>>, ApiFailure> {
    let auth = authenticate(&state, &headers).await?;
    let context = require_channel_permission(
        &state,
        &auth,
        &path.tenant_id,
        &path.channel_id,
        Permission::ConnectVoice,
    )
    .await?;

    let event =
        gateway_events::voice_leave(&state, &context.tenant_id, &path.channel_id, auth.user_id);
    broadcast_tenant_event(&state, &context.tenant_id, &event).await;

    Ok(ok(()))
}
