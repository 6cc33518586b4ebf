use std::{sync::Arc, time::Duration};

use anyhow::anyhow;
use axum::{
    extract::DefaultBodyLimit,
    http::{HeaderName, StatusCode},
    routing::{delete, get, patch, post, put},
    Router,
};
use tower::ServiceBuilder;
use tower_governor::{
    governor::GovernorConfigBuilder, key_extractor::SmartIpKeyExtractor, GovernorLayer,
};
use tower_http::{
    request_id::{MakeRequestUuid, PropagateRequestIdLayer, SetRequestIdLayer},
    timeout::TimeoutLayer,
    trace::TraceLayer,
};

use super::{
    core::{AppConfig, AppState},
    handlers::{
        auth::{login, logout, me, refresh, register},
        channels::{
            create_channel, delete_channel, delete_channel_override, get_channel_permissions,
            list_channels, set_channel_override, update_channel,
        },
        members::{ban_member, kick_member, list_members},
        messages::{create_message, delete_message, edit_message, get_messages},
        roles::{
            assign_role, create_role, delete_role, list_roles, reorder_roles, unassign_role,
            update_role,
        },
        tenants::{create_tenant, join_tenant, leave_tenant, list_tenants},
        voice::{join_voice, leave_voice},
    },
    realtime::gateway_ws,
    types::{health, metrics},
};

/// Build the axum router with global security middleware.
///
/// # Errors
/// Returns an error if configured security limits are invalid.
pub fn build_router(config: &AppConfig) -> anyhow::Result<Router> {
    if config.max_gateway_event_bytes > hearth_protocol::MAX_EVENT_BYTES {
        return Err(anyhow!(
            "gateway event limit cannot exceed protocol max of {} bytes",
            hearth_protocol::MAX_EVENT_BYTES
        ));
    }
    if config.gateway_outbound_queue == 0 {
        return Err(anyhow!("gateway outbound queue must hold at least 1 event"));
    }
    if config.heartbeat_interval.is_zero() || config.heartbeat_missed_limit == 0 {
        return Err(anyhow!("heartbeat interval and missed limit must be non-zero"));
    }
    if config.login_max_attempts == 0 || config.message_max_per_window == 0 {
        return Err(anyhow!("rate limiter windows must allow at least 1 event"));
    }
    if config.permission_cache_sweep_interval < config.permission_cache_ttl {
        return Err(anyhow!(
            "permission cache sweep interval must not undercut the ttl"
        ));
    }

    let governor_config = Arc::new(
        GovernorConfigBuilder::default()
            .period(Duration::from_secs(60))
            .burst_size(config.rate_limit_requests_per_minute)
            .key_extractor(SmartIpKeyExtractor)
            .finish()
            .ok_or_else(|| anyhow!("invalid governor configuration"))?,
    );
    let app_state = AppState::new(config)?;
    let request_id_header = HeaderName::from_static("x-request-id");
    let governor_layer = GovernorLayer::new(governor_config);

    Ok(Router::new()
        .route("/health", get(health))
        .route("/metrics", get(metrics))
        .route("/auth/register", post(register))
        .route("/auth/login", post(login))
        .route("/auth/refresh", post(refresh))
        .route("/auth/logout", post(logout))
        .route("/auth/me", get(me))
        .route("/tenants", post(create_tenant).get(list_tenants))
        .route("/tenants/{tenant_id}/join", post(join_tenant))
        .route("/tenants/{tenant_id}/leave", post(leave_tenant))
        .route(
            "/tenants/{tenant_id}/roles",
            get(list_roles).post(create_role),
        )
        .route("/tenants/{tenant_id}/roles/reorder", post(reorder_roles))
        .route(
            "/tenants/{tenant_id}/roles/{role_id}",
            patch(update_role).delete(delete_role),
        )
        .route(
            "/tenants/{tenant_id}/roles/{role_id}/members/{user_id}",
            post(assign_role).delete(unassign_role),
        )
        .route("/tenants/{tenant_id}/members", get(list_members))
        .route("/tenants/{tenant_id}/members/{user_id}", delete(kick_member))
        .route(
            "/tenants/{tenant_id}/members/{user_id}/ban",
            post(ban_member),
        )
        .route(
            "/tenants/{tenant_id}/channels",
            get(list_channels).post(create_channel),
        )
        .route(
            "/tenants/{tenant_id}/channels/{channel_id}",
            patch(update_channel).delete(delete_channel),
        )
        .route(
            "/tenants/{tenant_id}/channels/{channel_id}/permissions",
            get(get_channel_permissions),
        )
        .route(
            "/tenants/{tenant_id}/channels/{channel_id}/overrides/{role_id}",
            put(set_channel_override).delete(delete_channel_override),
        )
        .route(
            "/tenants/{tenant_id}/channels/{channel_id}/messages",
            get(get_messages).post(create_message),
        )
        .route(
            "/tenants/{tenant_id}/channels/{channel_id}/messages/{message_id}",
            patch(edit_message).delete(delete_message),
        )
        .route(
            "/tenants/{tenant_id}/channels/{channel_id}/voice/join",
            post(join_voice),
        )
        .route(
            "/tenants/{tenant_id}/channels/{channel_id}/voice/leave",
            post(leave_voice),
        )
        .route("/gateway/ws", get(gateway_ws))
        .with_state(app_state)
        .layer(DefaultBodyLimit::max(config.max_body_bytes))
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(PropagateRequestIdLayer::new(request_id_header.clone()))
                .layer(SetRequestIdLayer::new(request_id_header, MakeRequestUuid))
                .layer(TimeoutLayer::with_status_code(
                    StatusCode::REQUEST_TIMEOUT,
                    config.request_timeout,
                ))
                .layer(governor_layer),
        ))
}
