use axum::{
    extract::{Json, Path, Query, State},
    http::HeaderMap,
};
use hearth_core::{has_permission, Permission};
use ulid::Ulid;

use crate::server::{
    auth::{authenticate, now_unix, validate_message_content},
    core::{AppState, MessageRecord, MAX_HISTORY_LIMIT},
    errors::ApiFailure,
    gateway_events,
    metrics::record_rate_limit_hit,
    pipeline::{load_channel_permissions, require_channel_permission},
    realtime::broadcast_tenant_event,
    types::{
        ok, ApiResponse, ChannelPath, CreateMessageRequest, EditMessageRequest,
        MessageHistoryQuery, MessagePath, MessageResponse,
    },
};

fn message_response(
    tenant_id: &str,
    channel_id: &str,
    record: &MessageRecord,
) -> MessageResponse {
    MessageResponse {
        message_id: record.id.clone(),
        tenant_id: tenant_id.to_owned(),
        channel_id: channel_id.to_owned(),
        author_id: record.author_id.to_string(),
        content: record.content.clone(),
        created_at_unix: record.created_at_unix,
        edited_at_unix: record.edited_at_unix,
    }
}

pub(crate) async fn create_message(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(path): Path<ChannelPath>,
    Json(payload): Json<CreateMessageRequest>,
) -> Result<Json<ApiResponse<MessageResponse>>, ApiFailure> {
    let auth = authenticate(&state, &headers).await?;
    validate_message_content(&payload.content)?;
    let context = require_channel_permission(
        &state,
        &auth,
        &path.tenant_id,
        &path.channel_id,
        Permission::SendMessages,
    )
    .await?;

    // Spam control sits behind the permission gate so a throttled reply
    // never reveals access the caller does not have.
    let limiter_key = auth.user_id.to_string();
    if !state.message_limiter.allow(&limiter_key) {
        let retry_after_secs = state
            .message_limiter
            .remaining_cooldown_secs(&limiter_key)
            .max(1);
        record_rate_limit_hit("message", "window_exceeded");
        tracing::warn!(
            event = "message.rate_limited",
            user_id = %auth.user_id,
            tenant_id = %context.tenant_id,
            retry_after_secs
        );
        return Err(ApiFailure::RateLimited { retry_after_secs });
    }

    let response = {
        let mut tenants = state.tenants.write().await;
        let tenant = tenants
            .get_mut(&context.tenant_id)
            .ok_or(ApiFailure::Forbidden)?;
        let channel = tenant
            .channels
            .get_mut(&path.channel_id)
            .ok_or(ApiFailure::NotFound)?;

        let record = MessageRecord {
            id: Ulid::new().to_string(),
            author_id: auth.user_id,
            content: payload.content,
            created_at_unix: now_unix(),
            edited_at_unix: None,
        };
        let response = message_response(&context.tenant_id, &path.channel_id, &record);
        channel.messages.push(record);
        response
    };

    let event = gateway_events::message_create(&state, &response);
    broadcast_tenant_event(&state, &context.tenant_id, &event).await;

    Ok(ok(response))
}

pub(crate) async fn get_messages(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(path): Path<ChannelPath>,
    Query(query): Query<MessageHistoryQuery>,
) -> Result<Json<ApiResponse<Vec<MessageResponse>>>, ApiFailure> {
    let auth = authenticate(&state, &headers).await?;
    let context = require_channel_permission(
        &state,
        &auth,
        &path.tenant_id,
        &path.channel_id,
        Permission::ReadMessages,
    )
    .await?;

    let limit = query.limit.unwrap_or(MAX_HISTORY_LIMIT);
    if limit == 0 || limit > MAX_HISTORY_LIMIT {
        return Err(ApiFailure::BadRequest);
    }

    let tenants = state.tenants.read().await;
    let tenant = tenants
        .get(&context.tenant_id)
        .ok_or(ApiFailure::Forbidden)?;
    let channel = tenant
        .channels
        .get(&path.channel_id)
        .ok_or(ApiFailure::NotFound)?;
    let start = channel.messages.len().saturating_sub(limit);
    let messages: Vec<MessageResponse> = channel.messages[start..]
        .iter()
        .map(|record| message_response(&context.tenant_id, &path.channel_id, record))
        .collect();

    Ok(ok(messages))
}

/// Authors edit their own messages; nobody else does, message management
/// included.
pub(crate) async fn edit_message(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(path): Path<MessagePath>,
    Json(payload): Json<EditMessageRequest>,
) -> Result<Json<ApiResponse<MessageResponse>>, ApiFailure> {
    let auth = authenticate(&state, &headers).await?;
    validate_message_content(&payload.content)?;
    let context =
        load_channel_permissions(&state, &auth, &path.tenant_id, &path.channel_id).await?;

    let response = {
        let mut tenants = state.tenants.write().await;
        let tenant = tenants
            .get_mut(&context.tenant_id)
            .ok_or(ApiFailure::Forbidden)?;
        let channel = tenant
            .channels
            .get_mut(&path.channel_id)
            .ok_or(ApiFailure::NotFound)?;
        let record = channel
            .messages
            .iter_mut()
            .find(|record| record.id == path.message_id)
            .ok_or(ApiFailure::NotFound)?;
        if record.author_id != auth.user_id {
            return Err(ApiFailure::Forbidden);
        }

        record.content = payload.content;
        record.edited_at_unix = Some(now_unix());
        message_response(&context.tenant_id, &path.channel_id, record)
    };

    let event = gateway_events::message_update(&state, &response);
    broadcast_tenant_event(&state, &context.tenant_id, &event).await;

    Ok(ok(response))
}

/// Mixed gate: the author may delete their own message, a moderator with
/// the channel-scoped manage-messages bit may delete anyone's. Permissions
/// are loaded without rejecting so the handler can decide.
pub(crate) async fn delete_message(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(path): Path<MessagePath>,
) -> Result<Json<ApiResponse<()>>, ApiFailure> {
    let auth = authenticate(&state, &headers).await?;
    let context =
        load_channel_permissions(&state, &auth, &path.tenant_id, &path.channel_id).await?;

    {
        let mut tenants = state.tenants.write().await;
        let tenant = tenants
            .get_mut(&context.tenant_id)
            .ok_or(ApiFailure::Forbidden)?;
        let channel = tenant
            .channels
            .get_mut(&path.channel_id)
            .ok_or(ApiFailure::NotFound)?;
        let index = channel
            .messages
            .iter()
            .position(|record| record.id == path.message_id)
            .ok_or(ApiFailure::NotFound)?;

        let is_author = channel.messages[index].author_id == auth.user_id;
        if !is_author && !has_permission(context.permissions, Permission::ManageMessages) {
            return Err(ApiFailure::Forbidden);
        }
        channel.messages.remove(index);
    }

    let event = gateway_events::message_delete(
        &state,
        &context.tenant_id,
        &path.channel_id,
        &path.message_id,
    );
    broadcast_tenant_event(&state, &context.tenant_id, &event).await;

    Ok(ok(()))
}
