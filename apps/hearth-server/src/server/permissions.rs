use hearth_core::{
    compute_base_permissions, resolve_channel_permissions, ChannelOverride, Permission,
    PermissionSet, Role, UserId, OWNER_ROLE_ID,
};

use super::{
    core::{AppState, TenantRecord, DEFAULT_ROLE_ID, OWNER_ROLE_POSITION},
    errors::ApiFailure,
};

pub(crate) fn default_everyone_permissions() -> PermissionSet {
    let mut permissions = PermissionSet::empty();
    permissions.insert(Permission::SendMessages);
    permissions.insert(Permission::ReadMessages);
    permissions.insert(Permission::ConnectVoice);
    permissions.insert(Permission::Speak);
    permissions
}

pub(crate) fn owner_role() -> Role {
    Role {
        id: OWNER_ROLE_ID.to_owned(),
        name: String::from("Owner"),
        color: String::from("#e8a33d"),
        position: OWNER_ROLE_POSITION,
        permissions: PermissionSet::ALL,
        is_default: false,
    }
}

pub(crate) fn default_role() -> Role {
    Role {
        id: DEFAULT_ROLE_ID.to_owned(),
        name: String::from("Everyone"),
        color: String::from("#99aab5"),
        position: 0,
        permissions: default_everyone_permissions(),
        is_default: true,
    }
}

pub(crate) fn member_cache_key(user_id: UserId, tenant_id: &str) -> String {
    format!("{user_id}:{tenant_id}")
}

pub(crate) fn channel_cache_key(user_id: UserId, tenant_id: &str, channel_id: &str) -> String {
    format!("{user_id}:{tenant_id}:{channel_id}")
}

/// Roles a member currently holds, the always-present default role
/// included.
pub(crate) fn assigned_roles(tenant: &TenantRecord, user_id: UserId) -> Vec<Role> {
    let Some(role_ids) = tenant.role_assignments.get(&user_id) else {
        return Vec::new();
    };
    role_ids
        .iter()
        .filter_map(|role_id| tenant.roles.get(role_id).cloned())
        .collect()
}

pub(crate) fn member_base_permissions(tenant: &TenantRecord, user_id: UserId) -> PermissionSet {
    let masks: Vec<PermissionSet> = assigned_roles(tenant, user_id)
        .iter()
        .map(|role| role.permissions)
        .collect();
    compute_base_permissions(&masks)
}

/// Effective tenant-level permission for a member, memoized.
pub(crate) async fn tenant_permissions(
    state: &AppState,
    user_id: UserId,
    tenant_id: &str,
) -> Result<PermissionSet, ApiFailure> {
    let cache_key = member_cache_key(user_id, tenant_id);
    if let Some(cached) = state.permission_cache.get(&cache_key) {
        return Ok(cached);
    }

    let tenants = state.tenants.read().await;
    let tenant = tenants.get(tenant_id).ok_or(ApiFailure::Forbidden)?;
    if !tenant.members.contains_key(&user_id) {
        return Err(ApiFailure::Forbidden);
    }
    let base = member_base_permissions(tenant, user_id);
    drop(tenants);

    state.permission_cache.set(cache_key, base);
    Ok(base)
}

/// Effective permission for a member narrowed to one channel, memoized.
pub(crate) async fn channel_permissions(
    state: &AppState,
    user_id: UserId,
    tenant_id: &str,
    channel_id: &str,
) -> Result<PermissionSet, ApiFailure> {
    let cache_key = channel_cache_key(user_id, tenant_id, channel_id);
    if let Some(cached) = state.permission_cache.get(&cache_key) {
        return Ok(cached);
    }

    let tenants = state.tenants.read().await;
    let tenant = tenants.get(tenant_id).ok_or(ApiFailure::Forbidden)?;
    if !tenant.members.contains_key(&user_id) {
        return Err(ApiFailure::Forbidden);
    }
    let channel = tenant.channels.get(channel_id).ok_or(ApiFailure::NotFound)?;

    let base = member_base_permissions(tenant, user_id);
    let role_ids: Vec<String> = tenant
        .role_assignments
        .get(&user_id)
        .map(|ids| ids.iter().cloned().collect())
        .unwrap_or_default();
    let overrides: Vec<ChannelOverride> = channel
        .overrides
        .iter()
        .map(|(role_id, record)| ChannelOverride {
            role_id: role_id.clone(),
            allow: record.allow,
            deny: record.deny,
        })
        .collect();
    drop(tenants);

    let resolved = resolve_channel_permissions(base, &role_ids, &overrides);
    state.permission_cache.set(cache_key, resolved);
    Ok(resolved)
}

/// Drop every memoized result for one member in one tenant, channel-scoped
/// entries included. Called immediately after any role assignment change
/// or membership removal, before the corresponding event is published.
pub(crate) fn invalidate_member_permissions(state: &AppState, user_id: UserId, tenant_id: &str) {
    let exact = member_cache_key(user_id, tenant_id);
    let prefix = format!("{exact}:");
    state
        .permission_cache
        .delete_func(|key| *key == exact || key.starts_with(&prefix));
}

/// Drop every memoized result touching one tenant. Called after role or
/// override writes whose blast radius is not a single member.
pub(crate) fn invalidate_tenant_permissions(state: &AppState, tenant_id: &str) {
    state
        .permission_cache
        .delete_func(|key| key.split(':').nth(1) == Some(tenant_id));
}

#[cfg(test)]
mod tests {
    use std::collections::{HashMap, HashSet};

    use hearth_core::{Permission, PermissionSet, UserId, OWNER_ROLE_ID};

    use super::{
        channel_cache_key, channel_permissions, default_role, invalidate_member_permissions,
        invalidate_tenant_permissions, member_cache_key, owner_role, tenant_permissions,
    };
    use crate::server::core::{
        AppConfig, AppState, ChannelRecord, MemberRecord, OverrideRecord, TenantRecord,
        DEFAULT_ROLE_ID,
    };

    fn tenant_with_member(user_id: UserId) -> TenantRecord {
        let mut roles = HashMap::new();
        roles.insert(OWNER_ROLE_ID.to_owned(), owner_role());
        roles.insert(DEFAULT_ROLE_ID.to_owned(), default_role());
        let mut role_assignments = HashMap::new();
        role_assignments.insert(
            user_id,
            HashSet::from([DEFAULT_ROLE_ID.to_owned()]),
        );
        let mut members = HashMap::new();
        members.insert(
            user_id,
            MemberRecord {
                joined_at_unix: 0,
                position: 1,
            },
        );
        TenantRecord {
            name: String::from("commons"),
            owner_user_id: UserId::new(),
            invite_required: false,
            created_at_unix: 0,
            members,
            banned_members: HashSet::new(),
            roles,
            role_assignments,
            channels: HashMap::new(),
            next_member_position: 2,
        }
    }

    fn text_channel() -> ChannelRecord {
        ChannelRecord {
            name: String::from("general"),
            kind: hearth_core::ChannelKind::Text,
            category: None,
            position: 0,
            overrides: HashMap::new(),
            messages: Vec::new(),
        }
    }

    #[tokio::test]
    async fn tenant_permissions_are_memoized_until_invalidated() {
        let state = AppState::new(&AppConfig::default()).expect("state should initialize");
        let user_id = UserId::new();
        let tenant = tenant_with_member(user_id);
        state
            .tenants
            .write()
            .await
            .insert(String::from("t1"), tenant);

        let first = tenant_permissions(&state, user_id, "t1")
            .await
            .expect("member should resolve");
        assert!(first.contains(Permission::SendMessages));

        // Mutate the stored role without invalidating; the cached value wins.
        {
            let mut tenants = state.tenants.write().await;
            let tenant = tenants.get_mut("t1").expect("tenant exists");
            let role = tenant
                .roles
                .get_mut(DEFAULT_ROLE_ID)
                .expect("default role exists");
            role.permissions = PermissionSet::empty();
        }
        let cached = tenant_permissions(&state, user_id, "t1")
            .await
            .expect("member should resolve");
        assert_eq!(cached, first);

        invalidate_tenant_permissions(&state, "t1");
        let recomputed = tenant_permissions(&state, user_id, "t1")
            .await
            .expect("member should resolve");
        assert!(recomputed.is_empty());
    }

    #[tokio::test]
    async fn channel_permissions_apply_override_rows() {
        let state = AppState::new(&AppConfig::default()).expect("state should initialize");
        let user_id = UserId::new();
        let mut tenant = tenant_with_member(user_id);
        let mut channel = text_channel();
        let mut deny = PermissionSet::empty();
        deny.insert(Permission::SendMessages);
        channel.overrides.insert(
            DEFAULT_ROLE_ID.to_owned(),
            OverrideRecord {
                allow: PermissionSet::empty(),
                deny,
            },
        );
        tenant.channels.insert(String::from("c1"), channel);
        state
            .tenants
            .write()
            .await
            .insert(String::from("t1"), tenant);

        let resolved = channel_permissions(&state, user_id, "t1", "c1")
            .await
            .expect("channel should resolve");
        assert!(!resolved.contains(Permission::SendMessages));
        assert!(resolved.contains(Permission::ReadMessages));
    }

    #[tokio::test]
    async fn member_invalidation_is_scoped_to_that_member() {
        let state = AppState::new(&AppConfig::default()).expect("state should initialize");
        let member = UserId::new();
        let other = UserId::new();

        state
            .permission_cache
            .set(member_cache_key(member, "t1"), PermissionSet::ALL);
        state.permission_cache.set(
            channel_cache_key(member, "t1", "c1"),
            PermissionSet::ALL,
        );
        state
            .permission_cache
            .set(member_cache_key(other, "t1"), PermissionSet::ALL);

        invalidate_member_permissions(&state, member, "t1");
        assert!(state
            .permission_cache
            .get(&member_cache_key(member, "t1"))
            .is_none());
        assert!(state
            .permission_cache
            .get(&channel_cache_key(member, "t1", "c1"))
            .is_none());
        assert!(state
            .permission_cache
            .get(&member_cache_key(other, "t1"))
            .is_some());
    }

    #[tokio::test]
    async fn non_member_resolution_is_forbidden() {
        let state = AppState::new(&AppConfig::default()).expect("state should initialize");
        let member = UserId::new();
        let outsider = UserId::new();
        state
            .tenants
            .write()
            .await
            .insert(String::from("t1"), tenant_with_member(member));

        let failure = tenant_permissions(&state, outsider, "t1")
            .await
            .expect_err("outsider should be rejected");
        assert_eq!(failure, crate::server::errors::ApiFailure::Forbidden);
    }
}
