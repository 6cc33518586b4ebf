use std::collections::{HashMap, HashSet};

use axum::{
    extract::{Json, Path, State},
    http::HeaderMap,
};
use hearth_core::{ChannelKind, TenantName, UserId, OWNER_ROLE_ID};
use ulid::Ulid;

use crate::server::{
    auth::{authenticate, now_unix},
    core::{
        AppState, ChannelRecord, MemberRecord, TenantRecord, DEFAULT_ROLE_ID,
    },
    errors::ApiFailure,
    gateway_events,
    permissions::{default_role, invalidate_member_permissions, owner_role},
    pipeline::load_permissions,
    realtime::{add_tenant_scope_for_user, broadcast_tenant_event, remove_tenant_scope_for_user},
    types::{ok, ApiResponse, CreateTenantRequest, TenantPath, TenantResponse},
};

pub(crate) fn seed_tenant_record(
    name: String,
    owner_user_id: UserId,
    invite_required: bool,
    created_at_unix: i64,
) -> TenantRecord {
    let mut roles = HashMap::new();
    roles.insert(OWNER_ROLE_ID.to_owned(), owner_role());
    roles.insert(DEFAULT_ROLE_ID.to_owned(), default_role());

    let mut members = HashMap::new();
    members.insert(
        owner_user_id,
        MemberRecord {
            joined_at_unix: created_at_unix,
            position: 0,
        },
    );

    let mut role_assignments = HashMap::new();
    role_assignments.insert(
        owner_user_id,
        HashSet::from([OWNER_ROLE_ID.to_owned(), DEFAULT_ROLE_ID.to_owned()]),
    );

    let mut channels = HashMap::new();
    channels.insert(
        Ulid::new().to_string(),
        ChannelRecord {
            name: String::from("general"),
            kind: ChannelKind::Text,
            category: None,
            position: 0,
            overrides: HashMap::new(),
            messages: Vec::new(),
        },
    );

    TenantRecord {
        name,
        owner_user_id,
        invite_required,
        created_at_unix,
        members,
        banned_members: HashSet::new(),
        roles,
        role_assignments,
        channels,
        next_member_position: 1,
    }
}

fn tenant_response(tenant_id: &str, tenant: &TenantRecord) -> TenantResponse {
    TenantResponse {
        tenant_id: tenant_id.to_owned(),
        name: tenant.name.clone(),
        owner_id: tenant.owner_user_id.to_string(),
        invite_required: tenant.invite_required,
        created_at_unix: tenant.created_at_unix,
    }
}

pub(crate) async fn create_tenant(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(payload): Json<CreateTenantRequest>,
) -> Result<Json<ApiResponse<TenantResponse>>, ApiFailure> {
    let auth = authenticate(&state, &headers).await?;
    let name = TenantName::try_from(payload.name).map_err(|_| ApiFailure::BadRequest)?;

    let tenant_id = Ulid::new().to_string();
    let tenant = seed_tenant_record(
        name.as_str().to_owned(),
        auth.user_id,
        payload.invite_required,
        now_unix(),
    );
    let response = tenant_response(&tenant_id, &tenant);
    state
        .tenants
        .write()
        .await
        .insert(tenant_id.clone(), tenant);

    add_tenant_scope_for_user(&state, auth.user_id, &tenant_id).await;
    tracing::info!(
        event = "tenant.create",
        tenant_id = %tenant_id,
        owner_id = %auth.user_id
    );

    Ok(ok(response))
}

pub(crate) async fn list_tenants(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<ApiResponse<Vec<TenantResponse>>>, ApiFailure> {
    let auth = authenticate(&state, &headers).await?;

    let tenants = state.tenants.read().await;
    let mut mine: Vec<TenantResponse> = tenants
        .iter()
        .filter(|(_, tenant)| tenant.members.contains_key(&auth.user_id))
        .map(|(tenant_id, tenant)| tenant_response(tenant_id, tenant))
        .collect();
    mine.sort_by(|a, b| a.created_at_unix.cmp(&b.created_at_unix));

    Ok(ok(mine))
}

pub(crate) async fn join_tenant(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(path): Path<TenantPath>,
) -> Result<Json<ApiResponse<TenantResponse>>, ApiFailure> {
    let auth = authenticate(&state, &headers).await?;

    let response = {
        let mut tenants = state.tenants.write().await;
        let tenant = tenants
            .get_mut(&path.tenant_id)
            .ok_or(ApiFailure::NotFound)?;
        if tenant.banned_members.contains(&auth.user_id) {
            return Err(ApiFailure::Forbidden);
        }
        if tenant.invite_required {
            return Err(ApiFailure::Forbidden);
        }
        if tenant.members.contains_key(&auth.user_id) {
            return Err(ApiFailure::AlreadyExists);
        }

        let position = tenant.next_member_position;
        tenant.next_member_position += 1;
        tenant.members.insert(
            auth.user_id,
            MemberRecord {
                joined_at_unix: now_unix(),
                position,
            },
        );
        tenant
            .role_assignments
            .insert(auth.user_id, HashSet::from([DEFAULT_ROLE_ID.to_owned()]));
        tenant_response(&path.tenant_id, tenant)
    };

    add_tenant_scope_for_user(&state, auth.user_id, &path.tenant_id).await;
    let event = gateway_events::member_join(&state, &path.tenant_id, auth.user_id, &auth.username);
    broadcast_tenant_event(&state, &path.tenant_id, &event).await;

    Ok(ok(response))
}

pub(crate) async fn leave_tenant(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(path): Path<TenantPath>,
) -> Result<Json<ApiResponse<()>>, ApiFailure> {
    let auth = authenticate(&state, &headers).await?;
    let context = load_permissions(&state, &auth, &path.tenant_id).await?;

    {
        let mut tenants = state.tenants.write().await;
        let tenant = tenants
            .get_mut(&context.tenant_id)
            .ok_or(ApiFailure::Forbidden)?;
        if tenant.owner_user_id == auth.user_id {
            // Ownership is never reassigned automatically; the owner cannot
            // abandon the tenant.
            return Err(ApiFailure::BadRequest);
        }
        tenant.members.remove(&auth.user_id);
        tenant.role_assignments.remove(&auth.user_id);
    }

    invalidate_member_permissions(&state, auth.user_id, &context.tenant_id);
    remove_tenant_scope_for_user(&state, auth.user_id, &context.tenant_id).await;
    let event =
        gateway_events::member_leave(&state, &context.tenant_id, auth.user_id, &auth.username);
    broadcast_tenant_event(&state, &context.tenant_id, &event).await;

    Ok(ok(()))
}
