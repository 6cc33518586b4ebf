use std::collections::HashMap;

use axum::{
    extract::{Json, Path, State},
    http::HeaderMap,
};
use hearth_core::{validate_override, ChannelKind, ChannelName, Permission, PermissionSet};
use ulid::Ulid;

use crate::server::{
    auth::authenticate,
    core::{AppState, ChannelRecord, OverrideRecord, MAX_TENANT_CHANNELS},
    errors::ApiFailure,
    gateway_events,
    permissions::invalidate_tenant_permissions,
    pipeline::{load_channel_permissions, load_permissions, require_permission},
    realtime::broadcast_tenant_event,
    types::{
        ok, ApiResponse, ChannelPath, ChannelPermissionsResponse, ChannelResponse,
        CreateChannelRequest, OverridePath, OverrideResponse, SetOverrideRequest, TenantPath,
        UpdateChannelRequest,
    },
};

fn channel_response(tenant_id: &str, channel_id: &str, channel: &ChannelRecord) -> ChannelResponse {
    ChannelResponse {
        channel_id: channel_id.to_owned(),
        tenant_id: tenant_id.to_owned(),
        name: channel.name.clone(),
        kind: channel.kind.as_str().to_owned(),
        category: channel.category.clone(),
        position: channel.position,
    }
}

pub(crate) async fn list_channels(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(path): Path<TenantPath>,
) -> Result<Json<ApiResponse<Vec<ChannelResponse>>>, ApiFailure> {
    let auth = authenticate(&state, &headers).await?;
    let context = load_permissions(&state, &auth, &path.tenant_id).await?;

    let tenants = state.tenants.read().await;
    let tenant = tenants
        .get(&context.tenant_id)
        .ok_or(ApiFailure::Forbidden)?;
    let mut channels: Vec<ChannelResponse> = tenant
        .channels
        .iter()
        .map(|(channel_id, channel)| channel_response(&context.tenant_id, channel_id, channel))
        .collect();
    channels.sort_by(|a, b| a.position.cmp(&b.position).then(a.name.cmp(&b.name)));

    Ok(ok(channels))
}

pub(crate) async fn create_channel(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(path): Path<TenantPath>,
    Json(payload): Json<CreateChannelRequest>,
) -> Result<Json<ApiResponse<ChannelResponse>>, ApiFailure> {
    let auth = authenticate(&state, &headers).await?;
    let context =
        require_permission(&state, &auth, &path.tenant_id, Permission::ManageChannels).await?;

    let name = ChannelName::try_from(payload.name).map_err(|_| ApiFailure::BadRequest)?;
    let kind = ChannelKind::try_from(payload.kind).map_err(|_| ApiFailure::BadRequest)?;

    let response = {
        let mut tenants = state.tenants.write().await;
        let tenant = tenants
            .get_mut(&context.tenant_id)
            .ok_or(ApiFailure::Forbidden)?;
        if tenant.channels.len() >= MAX_TENANT_CHANNELS {
            return Err(ApiFailure::BadRequest);
        }

        let position = tenant
            .channels
            .values()
            .map(|channel| channel.position)
            .max()
            .map_or(0, |max| max + 1);
        let channel_id = Ulid::new().to_string();
        let channel = ChannelRecord {
            name: name.as_str().to_owned(),
            kind,
            category: payload.category,
            position,
            overrides: HashMap::new(),
            messages: Vec::new(),
        };
        let response = channel_response(&context.tenant_id, &channel_id, &channel);
        tenant.channels.insert(channel_id, channel);
        response
    };

    let event = gateway_events::channel_create(&state, &response);
    broadcast_tenant_event(&state, &context.tenant_id, &event).await;

    Ok(ok(response))
}

pub(crate) async fn update_channel(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(path): Path<ChannelPath>,
    Json(payload): Json<UpdateChannelRequest>,
) -> Result<Json<ApiResponse<ChannelResponse>>, ApiFailure> {
    let auth = authenticate(&state, &headers).await?;
    let context =
        require_permission(&state, &auth, &path.tenant_id, Permission::ManageChannels).await?;

    let response = {
        let mut tenants = state.tenants.write().await;
        let tenant = tenants
            .get_mut(&context.tenant_id)
            .ok_or(ApiFailure::Forbidden)?;
        let channel = tenant
            .channels
            .get_mut(&path.channel_id)
            .ok_or(ApiFailure::NotFound)?;

        if let Some(name) = payload.name {
            let name = ChannelName::try_from(name).map_err(|_| ApiFailure::BadRequest)?;
            channel.name = name.as_str().to_owned();
        }
        if let Some(category) = payload.category {
            channel.category = if category.is_empty() {
                None
            } else {
                Some(category)
            };
        }
        if let Some(position) = payload.position {
            if position < 0 {
                return Err(ApiFailure::BadRequest);
            }
            channel.position = position;
        }
        channel_response(&context.tenant_id, &path.channel_id, channel)
    };

    let event = gateway_events::channel_update(&state, &response);
    broadcast_tenant_event(&state, &context.tenant_id, &event).await;

    Ok(ok(response))
}

pub(crate) async fn delete_channel(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(path): Path<ChannelPath>,
) -> Result<Json<ApiResponse<()>>, ApiFailure> {
    let auth = authenticate(&state, &headers).await?;
    let context =
        require_permission(&state, &auth, &path.tenant_id, Permission::ManageChannels).await?;

    {
        let mut tenants = state.tenants.write().await;
        let tenant = tenants
            .get_mut(&context.tenant_id)
            .ok_or(ApiFailure::Forbidden)?;
        tenant
            .channels
            .remove(&path.channel_id)
            .ok_or(ApiFailure::NotFound)?;
    }

    invalidate_tenant_permissions(&state, &context.tenant_id);
    let event = gateway_events::channel_delete(&state, &context.tenant_id, &path.channel_id);
    broadcast_tenant_event(&state, &context.tenant_id, &event).await;

    Ok(ok(()))
}

/// Create or replace one (channel, role) override. Setting both masks to
/// zero removes the row, which is the same as inheriting the tenant base.
pub(crate) async fn set_channel_override(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(path): Path<OverridePath>,
    Json(payload): Json<SetOverrideRequest>,
) -> Result<Json<ApiResponse<OverrideResponse>>, ApiFailure> {
    let auth = authenticate(&state, &headers).await?;
    let context =
        require_permission(&state, &auth, &path.tenant_id, Permission::ManageChannels).await?;

    let allow = PermissionSet::from_bits(payload.allow);
    let deny = PermissionSet::from_bits(payload.deny);
    validate_override(allow, deny).map_err(|_| ApiFailure::BadRequest)?;

    let removed = {
        let mut tenants = state.tenants.write().await;
        let tenant = tenants
            .get_mut(&context.tenant_id)
            .ok_or(ApiFailure::Forbidden)?;
        if !tenant.roles.contains_key(&path.role_id) {
            return Err(ApiFailure::NotFound);
        }
        let channel = tenant
            .channels
            .get_mut(&path.channel_id)
            .ok_or(ApiFailure::NotFound)?;

        if allow.is_empty() && deny.is_empty() {
            channel.overrides.remove(&path.role_id);
            true
        } else {
            channel
                .overrides
                .insert(path.role_id.clone(), OverrideRecord { allow, deny });
            false
        }
    };

    invalidate_tenant_permissions(&state, &context.tenant_id);
    let response = OverrideResponse {
        channel_id: path.channel_id.clone(),
        role_id: path.role_id.clone(),
        allow: allow.bits(),
        deny: deny.bits(),
    };
    let event = if removed {
        gateway_events::channel_override_delete(&state, &path.channel_id, &path.role_id)
    } else {
        gateway_events::channel_override_update(&state, &response)
    };
    broadcast_tenant_event(&state, &context.tenant_id, &event).await;

    Ok(ok(response))
}

pub(crate) async fn delete_channel_override(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(path): Path<OverridePath>,
) -> Result<Json<ApiResponse<()>>, ApiFailure> {
    let auth = authenticate(&state, &headers).await?;
    let context =
        require_permission(&state, &auth, &path.tenant_id, Permission::ManageChannels).await?;

    {
        let mut tenants = state.tenants.write().await;
        let tenant = tenants
            .get_mut(&context.tenant_id)
            .ok_or(ApiFailure::Forbidden)?;
        let channel = tenant
            .channels
            .get_mut(&path.channel_id)
            .ok_or(ApiFailure::NotFound)?;
        channel
            .overrides
            .remove(&path.role_id)
            .ok_or(ApiFailure::NotFound)?;
    }

    invalidate_tenant_permissions(&state, &context.tenant_id);
    let event = gateway_events::channel_override_delete(&state, &path.channel_id, &path.role_id);
    broadcast_tenant_event(&state, &context.tenant_id, &event).await;

    Ok(ok(()))
}

/// Self-inspection: the caller's effective permission narrowed to one
/// channel.
pub(crate) async fn get_channel_permissions(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(path): Path<ChannelPath>,
) -> Result<Json<ApiResponse<ChannelPermissionsResponse>>, ApiFailure> {
    let auth = authenticate(&state, &headers).await?;
    let context =
        load_channel_permissions(&state, &auth, &path.tenant_id, &path.channel_id).await?;

    Ok(ok(ChannelPermissionsResponse {
        tenant_id: context.tenant_id,
        channel_id: path.channel_id,
        permissions: context.permissions.bits(),
    }))
}
