use axum::{
    extract::{Json, Path, State},
    http::HeaderMap,
};
use hearth_core::{actor_max_position, has_owner_role, Permission, UserId};

use crate::server::{
    auth::authenticate,
    core::{AppState, TenantRecord},
    errors::ApiFailure,
    gateway_events,
    permissions::{assigned_roles, invalidate_member_permissions},
    pipeline::{load_permissions, require_permission},
    realtime::{
        broadcast_tenant_event, broadcast_user_event, remove_tenant_scope_for_user, user_status,
    },
    types::{ok, ApiResponse, MemberPath, MemberResponse, TenantPath},
};

/// Hierarchy gate for moderation: the owner is immune, and the actor's
/// highest role must sit strictly above the target's.
fn can_moderate_target(tenant: &TenantRecord, actor: UserId, target: UserId) -> bool {
    if tenant.owner_user_id == target {
        return false;
    }
    let actor_roles = assigned_roles(tenant, actor);
    let target_roles = assigned_roles(tenant, target);
    if has_owner_role(&target_roles) {
        return false;
    }
    actor_max_position(&actor_roles) > actor_max_position(&target_roles)
}

fn remove_membership(tenant: &mut TenantRecord, target: UserId) {
    tenant.members.remove(&target);
    tenant.role_assignments.remove(&target);
}

pub(crate) async fn list_members(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(path): Path<TenantPath>,
) -> Result<Json<ApiResponse<Vec<MemberResponse>>>, ApiFailure> {
    let auth = authenticate(&state, &headers).await?;
    let context = load_permissions(&state, &auth, &path.tenant_id).await?;

    let entries: Vec<(UserId, i64, i64, Vec<String>)> = {
        let tenants = state.tenants.read().await;
        let tenant = tenants
            .get(&context.tenant_id)
            .ok_or(ApiFailure::Forbidden)?;
        tenant
            .members
            .iter()
            .map(|(user_id, member)| {
                let mut role_ids: Vec<String> = tenant
                    .role_assignments
                    .get(user_id)
                    .map(|ids| ids.iter().cloned().collect())
                    .unwrap_or_default();
                role_ids.sort_unstable();
                (
                    *user_id,
                    member.joined_at_unix,
                    member.position,
                    role_ids,
                )
            })
            .collect()
    };

    let usernames: Vec<String> = {
        let user_ids = state.user_ids.read().await;
        entries
            .iter()
            .map(|(user_id, ..)| {
                user_ids
                    .get(&user_id.to_string())
                    .cloned()
                    .unwrap_or_default()
            })
            .collect()
    };

    let mut members = Vec::with_capacity(entries.len());
    for ((user_id, joined_at_unix, position, role_ids), username) in
        entries.into_iter().zip(usernames)
    {
        let status = user_status(&state, user_id).await;
        members.push(MemberResponse {
            user_id: user_id.to_string(),
            username,
            joined_at_unix,
            position,
            role_ids,
            status: status.as_str().to_owned(),
        });
    }
    members.sort_by(|a, b| a.position.cmp(&b.position));

    Ok(ok(members))
}

pub(crate) async fn kick_member(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(path): Path<MemberPath>,
) -> Result<Json<ApiResponse<()>>, ApiFailure> {
    let auth = authenticate(&state, &headers).await?;
    let context =
        require_permission(&state, &auth, &path.tenant_id, Permission::KickMembers).await?;
    let target_user = UserId::try_from(path.user_id.clone()).map_err(|_| ApiFailure::BadRequest)?;

    {
        let mut tenants = state.tenants.write().await;
        let tenant = tenants
            .get_mut(&context.tenant_id)
            .ok_or(ApiFailure::Forbidden)?;
        if !tenant.members.contains_key(&target_user) {
            return Err(ApiFailure::NotFound);
        }
        if !can_moderate_target(tenant, auth.user_id, target_user) {
            return Err(ApiFailure::Forbidden);
        }
        remove_membership(tenant, target_user);
    }

    invalidate_member_permissions(&state, target_user, &context.tenant_id);
    remove_tenant_scope_for_user(&state, target_user, &context.tenant_id).await;

    let username = state
        .user_ids
        .read()
        .await
        .get(&target_user.to_string())
        .cloned()
        .unwrap_or_default();
    let event =
        gateway_events::member_leave(&state, &context.tenant_id, target_user, &username);
    broadcast_tenant_event(&state, &context.tenant_id, &event).await;
    let notice = gateway_events::member_removed(&state, &context.tenant_id, "kicked");
    broadcast_user_event(&state, target_user, &notice).await;
    tracing::info!(
        event = "member.kick",
        tenant_id = %context.tenant_id,
        actor_id = %auth.user_id,
        target_id = %target_user
    );

    Ok(ok(()))
}

pub(crate) async fn ban_member(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(path): Path<MemberPath>,
) -> Result<Json<ApiResponse<()>>, ApiFailure> {
    let auth = authenticate(&state, &headers).await?;
    let context =
        require_permission(&state, &auth, &path.tenant_id, Permission::BanMembers).await?;
    let target_user = UserId::try_from(path.user_id.clone()).map_err(|_| ApiFailure::BadRequest)?;

    {
        let mut tenants = state.tenants.write().await;
        let tenant = tenants
            .get_mut(&context.tenant_id)
            .ok_or(ApiFailure::Forbidden)?;
        if tenant.banned_members.contains(&target_user) {
            return Err(ApiFailure::AlreadyExists);
        }
        if !tenant.members.contains_key(&target_user) {
            return Err(ApiFailure::NotFound);
        }
        if !can_moderate_target(tenant, auth.user_id, target_user) {
            return Err(ApiFailure::Forbidden);
        }
        remove_membership(tenant, target_user);
        tenant.banned_members.insert(target_user);
    }

    invalidate_member_permissions(&state, target_user, &context.tenant_id);
    remove_tenant_scope_for_user(&state, target_user, &context.tenant_id).await;

    let username = state
        .user_ids
        .read()
        .await
        .get(&target_user.to_string())
        .cloned()
        .unwrap_or_default();
    let event = gateway_events::member_ban(&state, &context.tenant_id, target_user, &username);
    broadcast_tenant_event(&state, &context.tenant_id, &event).await;
    let notice = gateway_events::member_removed(&state, &context.tenant_id, "banned");
    broadcast_user_event(&state, target_user, &notice).await;
    tracing::info!(
        event = "member.ban",
        tenant_id = %context.tenant_id,
        actor_id = %auth.user_id,
        target_id = %target_user
    );

    Ok(ok(()))
}
