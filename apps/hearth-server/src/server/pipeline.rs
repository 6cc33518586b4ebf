use hearth_core::{has_permission, Permission};

use super::{
    core::{AppState, AuthContext, TenantContext},
    errors::ApiFailure,
    permissions::{channel_permissions, tenant_permissions},
};

/// Pipeline stage two: confirm the verified user belongs to the tenant
/// named by the request path. A missing identifier is a malformed request;
/// anything else that fails resolves to `Forbidden`, including an unknown
/// tenant, so outsiders cannot probe for tenant existence.
pub(crate) async fn require_membership(
    state: &AppState,
    auth: &AuthContext,
    tenant_id: &str,
) -> Result<(), ApiFailure> {
    if tenant_id.is_empty() {
        return Err(ApiFailure::BadRequest);
    }
    let tenants = state.tenants.read().await;
    let tenant = tenants.get(tenant_id).ok_or(ApiFailure::Forbidden)?;
    if tenant.members.contains_key(&auth.user_id) {
        Ok(())
    } else {
        Err(ApiFailure::Forbidden)
    }
}

/// Load-only variant of stage three: compute and attach the effective
/// tenant permission without rejecting. Handlers with mixed
/// owner-of-resource / privileged-role logic decide for themselves.
pub(crate) async fn load_permissions(
    state: &AppState,
    auth: &AuthContext,
    tenant_id: &str,
) -> Result<TenantContext, ApiFailure> {
    require_membership(state, auth, tenant_id).await?;
    let permissions = tenant_permissions(state, auth.user_id, tenant_id).await?;
    Ok(TenantContext {
        auth: auth.clone(),
        tenant_id: tenant_id.to_owned(),
        permissions,
    })
}

/// Pipeline stage three: enforce one required permission at tenant scope.
pub(crate) async fn require_permission(
    state: &AppState,
    auth: &AuthContext,
    tenant_id: &str,
    permission: Permission,
) -> Result<TenantContext, ApiFailure> {
    let context = load_permissions(state, auth, tenant_id).await?;
    if has_permission(context.permissions, permission) {
        Ok(context)
    } else {
        Err(ApiFailure::Forbidden)
    }
}

/// Load-only stage three narrowed to a channel.
pub(crate) async fn load_channel_permissions(
    state: &AppState,
    auth: &AuthContext,
    tenant_id: &str,
    channel_id: &str,
) -> Result<TenantContext, ApiFailure> {
    require_membership(state, auth, tenant_id).await?;
    let permissions = channel_permissions(state, auth.user_id, tenant_id, channel_id).await?;
    Ok(TenantContext {
        auth: auth.clone(),
        tenant_id: tenant_id.to_owned(),
        permissions,
    })
}

/// Stage three with channel-scoped semantics: the required bit is checked
/// against the override-narrowed permission.
pub(crate) async fn require_channel_permission(
    state: &AppState,
    auth: &AuthContext,
    tenant_id: &str,
    channel_id: &str,
    permission: Permission,
) -> Result<TenantContext, ApiFailure> {
    let context = load_channel_permissions(state, auth, tenant_id, channel_id).await?;
    if has_permission(context.permissions, permission) {
        Ok(context)
    } else {
        Err(ApiFailure::Forbidden)
    }
}
