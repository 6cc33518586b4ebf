use axum::{
    extract::{Json, Path, State},
    http::HeaderMap,
};
use hearth_core::{
    actor_max_position, can_edit_role, editable_roles, mask_permissions, Permission, Role,
    RoleColor, RoleName, UserId,
};
use ulid::Ulid;

use crate::server::{
    auth::authenticate,
    core::{AppState, TenantRecord, MAX_MEMBER_ROLE_ASSIGNMENTS, MAX_TENANT_ROLES},
    errors::ApiFailure,
    gateway_events,
    permissions::{assigned_roles, invalidate_member_permissions, invalidate_tenant_permissions},
    pipeline::{load_permissions, require_permission},
    realtime::broadcast_tenant_event,
    types::{
        ok, ApiResponse, CreateRoleRequest, ReorderRolesRequest, RoleListResponse, RoleMemberPath,
        RolePath, TenantPath, UpdateRoleRequest,
    },
};

const DEFAULT_ROLE_COLOR: &str = "#99aab5";

fn actor_max(tenant: &TenantRecord, user_id: UserId) -> i32 {
    actor_max_position(&assigned_roles(tenant, user_id))
}

/// Pick a position strictly below the actor, stepping past collisions so
/// positions stay unique within the tenant.
fn next_role_position(tenant: &TenantRecord, actor_max: i32) -> i32 {
    let mut position = actor_max.saturating_sub(1).max(1);
    while position > 1 && tenant.roles.values().any(|role| role.position == position) {
        position -= 1;
    }
    position
}

pub(crate) async fn list_roles(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(path): Path<TenantPath>,
) -> Result<Json<ApiResponse<RoleListResponse>>, ApiFailure> {
    let auth = authenticate(&state, &headers).await?;
    let context = load_permissions(&state, &auth, &path.tenant_id).await?;

    let tenants = state.tenants.read().await;
    let tenant = tenants
        .get(&context.tenant_id)
        .ok_or(ApiFailure::Forbidden)?;
    let mut roles: Vec<Role> = tenant.roles.values().cloned().collect();
    roles.sort_by(|a, b| b.position.cmp(&a.position));

    let editable_role_ids = editable_roles(&roles, actor_max(tenant, auth.user_id))
        .into_iter()
        .map(|role| role.id)
        .collect();

    Ok(ok(RoleListResponse {
        roles,
        editable_role_ids,
    }))
}

pub(crate) async fn create_role(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(path): Path<TenantPath>,
    Json(payload): Json<CreateRoleRequest>,
) -> Result<Json<ApiResponse<Role>>, ApiFailure> {
    let auth = authenticate(&state, &headers).await?;
    let context =
        require_permission(&state, &auth, &path.tenant_id, Permission::ManageRoles).await?;

    let name = RoleName::try_from(payload.name).map_err(|_| ApiFailure::BadRequest)?;
    let color = RoleColor::try_from(
        payload
            .color
            .unwrap_or_else(|| DEFAULT_ROLE_COLOR.to_owned()),
    )
    .map_err(|_| ApiFailure::BadRequest)?;
    let (permissions, unknown_bits) = mask_permissions(payload.permissions);
    if unknown_bits != 0 {
        tracing::warn!(
            event = "role.create.unknown_bits",
            tenant_id = %context.tenant_id,
            unknown_bits
        );
    }

    let role = {
        let mut tenants = state.tenants.write().await;
        let tenant = tenants
            .get_mut(&context.tenant_id)
            .ok_or(ApiFailure::Forbidden)?;
        if tenant.roles.len() >= MAX_TENANT_ROLES {
            return Err(ApiFailure::BadRequest);
        }

        let role = Role {
            id: Ulid::new().to_string(),
            name: name.as_str().to_owned(),
            color: color.as_str().to_owned(),
            position: next_role_position(tenant, actor_max(tenant, auth.user_id)),
            permissions,
            is_default: false,
        };
        tenant.roles.insert(role.id.clone(), role.clone());
        role
    };

    let event = gateway_events::role_create(&state, &context.tenant_id, &role);
    broadcast_tenant_event(&state, &context.tenant_id, &event).await;

    Ok(ok(role))
}

pub(crate) async fn update_role(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(path): Path<RolePath>,
    Json(payload): Json<UpdateRoleRequest>,
) -> Result<Json<ApiResponse<Role>>, ApiFailure> {
    let auth = authenticate(&state, &headers).await?;
    let context =
        require_permission(&state, &auth, &path.tenant_id, Permission::ManageRoles).await?;

    let role = {
        let mut tenants = state.tenants.write().await;
        let tenant = tenants
            .get_mut(&context.tenant_id)
            .ok_or(ApiFailure::Forbidden)?;
        let max = actor_max(tenant, auth.user_id);
        let role = tenant
            .roles
            .get(&path.role_id)
            .ok_or(ApiFailure::NotFound)?;
        if !can_edit_role(max, role) {
            return Err(ApiFailure::Forbidden);
        }

        let mut updated = role.clone();
        if let Some(name) = payload.name {
            let name = RoleName::try_from(name).map_err(|_| ApiFailure::BadRequest)?;
            updated.name = name.as_str().to_owned();
        }
        if let Some(color) = payload.color {
            let color = RoleColor::try_from(color).map_err(|_| ApiFailure::BadRequest)?;
            updated.color = color.as_str().to_owned();
        }
        if let Some(raw_bits) = payload.permissions {
            let (permissions, unknown_bits) = mask_permissions(raw_bits);
            if unknown_bits != 0 {
                tracing::warn!(
                    event = "role.update.unknown_bits",
                    tenant_id = %context.tenant_id,
                    role_id = %path.role_id,
                    unknown_bits
                );
            }
            updated.permissions = permissions;
        }
        tenant.roles.insert(updated.id.clone(), updated.clone());
        updated
    };

    invalidate_tenant_permissions(&state, &context.tenant_id);
    let event = gateway_events::role_update(&state, &context.tenant_id, &role);
    broadcast_tenant_event(&state, &context.tenant_id, &event).await;

    Ok(ok(role))
}

pub(crate) async fn delete_role(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(path): Path<RolePath>,
) -> Result<Json<ApiResponse<()>>, ApiFailure> {
    let auth = authenticate(&state, &headers).await?;
    let context =
        require_permission(&state, &auth, &path.tenant_id, Permission::ManageRoles).await?;

    {
        let mut tenants = state.tenants.write().await;
        let tenant = tenants
            .get_mut(&context.tenant_id)
            .ok_or(ApiFailure::Forbidden)?;
        let max = actor_max(tenant, auth.user_id);
        let role = tenant
            .roles
            .get(&path.role_id)
            .ok_or(ApiFailure::NotFound)?;
        if !can_edit_role(max, role) {
            return Err(ApiFailure::Forbidden);
        }

        tenant.roles.remove(&path.role_id);
        for assignments in tenant.role_assignments.values_mut() {
            assignments.remove(&path.role_id);
        }
        for channel in tenant.channels.values_mut() {
            channel.overrides.remove(&path.role_id);
        }
    }

    invalidate_tenant_permissions(&state, &context.tenant_id);
    let event = gateway_events::role_delete(&state, &context.tenant_id, &path.role_id);
    broadcast_tenant_event(&state, &context.tenant_id, &event).await;

    Ok(ok(()))
}

pub(crate) async fn reorder_roles(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(path): Path<TenantPath>,
    Json(payload): Json<ReorderRolesRequest>,
) -> Result<Json<ApiResponse<Vec<Role>>>, ApiFailure> {
    let auth = authenticate(&state, &headers).await?;
    let context =
        require_permission(&state, &auth, &path.tenant_id, Permission::ManageRoles).await?;
    if payload.items.is_empty() {
        return Err(ApiFailure::BadRequest);
    }

    let updated_roles = {
        let mut tenants = state.tenants.write().await;
        let tenant = tenants
            .get_mut(&context.tenant_id)
            .ok_or(ApiFailure::Forbidden)?;
        let max = actor_max(tenant, auth.user_id);

        // Validate the whole batch before applying anything.
        for item in &payload.items {
            let role = tenant
                .roles
                .get(&item.role_id)
                .ok_or(ApiFailure::NotFound)?;
            if !can_edit_role(max, role) {
                return Err(ApiFailure::Forbidden);
            }
            if item.position < 1 || item.position >= max {
                return Err(ApiFailure::Forbidden);
            }
        }

        let mut updated = Vec::with_capacity(payload.items.len());
        for item in &payload.items {
            if let Some(role) = tenant.roles.get_mut(&item.role_id) {
                role.position = item.position;
                updated.push(role.clone());
            }
        }
        updated
    };

    invalidate_tenant_permissions(&state, &context.tenant_id);
    for role in &updated_roles {
        let event = gateway_events::role_update(&state, &context.tenant_id, role);
        broadcast_tenant_event(&state, &context.tenant_id, &event).await;
    }

    Ok(ok(updated_roles))
}

pub(crate) async fn assign_role(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(path): Path<RoleMemberPath>,
) -> Result<Json<ApiResponse<()>>, ApiFailure> {
    let auth = authenticate(&state, &headers).await?;
    let context =
        require_permission(&state, &auth, &path.tenant_id, Permission::ManageRoles).await?;
    let target_user = UserId::try_from(path.user_id.clone()).map_err(|_| ApiFailure::BadRequest)?;

    {
        let mut tenants = state.tenants.write().await;
        let tenant = tenants
            .get_mut(&context.tenant_id)
            .ok_or(ApiFailure::Forbidden)?;
        let max = actor_max(tenant, auth.user_id);
        let role = tenant
            .roles
            .get(&path.role_id)
            .ok_or(ApiFailure::NotFound)?;
        if !can_edit_role(max, role) {
            return Err(ApiFailure::Forbidden);
        }
        if !tenant.members.contains_key(&target_user) {
            return Err(ApiFailure::NotFound);
        }

        let assignments = tenant.role_assignments.entry(target_user).or_default();
        if assignments.len() >= MAX_MEMBER_ROLE_ASSIGNMENTS {
            return Err(ApiFailure::BadRequest);
        }
        if !assignments.insert(path.role_id.clone()) {
            return Err(ApiFailure::AlreadyExists);
        }
    }

    invalidate_member_permissions(&state, target_user, &context.tenant_id);
    let event = gateway_events::role_assign(&state, &context.tenant_id, &path.role_id, target_user);
    broadcast_tenant_event(&state, &context.tenant_id, &event).await;

    Ok(ok(()))
}

pub(crate) async fn unassign_role(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(path): Path<RoleMemberPath>,
) -> Result<Json<ApiResponse<()>>, ApiFailure> {
    let auth = authenticate(&state, &headers).await?;
    let context =
        require_permission(&state, &auth, &path.tenant_id, Permission::ManageRoles).await?;
    let target_user = UserId::try_from(path.user_id.clone()).map_err(|_| ApiFailure::BadRequest)?;

    {
        let mut tenants = state.tenants.write().await;
        let tenant = tenants
            .get_mut(&context.tenant_id)
            .ok_or(ApiFailure::Forbidden)?;
        let max = actor_max(tenant, auth.user_id);
        let role = tenant
            .roles
            .get(&path.role_id)
            .ok_or(ApiFailure::NotFound)?;
        if role.is_default {
            // Every member always holds the default role.
            return Err(ApiFailure::BadRequest);
        }
        if !can_edit_role(max, role) {
            return Err(ApiFailure::Forbidden);
        }

        let removed = tenant
            .role_assignments
            .get_mut(&target_user)
            .is_some_and(|assignments| assignments.remove(&path.role_id));
        if !removed {
            return Err(ApiFailure::NotFound);
        }
    }

    invalidate_member_permissions(&state, target_user, &context.tenant_id);
    let event =
        gateway_events::role_unassign(&state, &context.tenant_id, &path.role_id, target_user);
    broadcast_tenant_event(&state, &context.tenant_id, &event).await;

    Ok(ok(()))
}
