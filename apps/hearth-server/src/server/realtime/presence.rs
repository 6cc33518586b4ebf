use std::collections::HashMap;

use hearth_core::{PresenceStatus, UserId};
use uuid::Uuid;

use crate::server::{
    core::{AppState, ConnectionPresence},
    gateway_events::{self, PresenceEntry},
};

use super::fanout::broadcast_tenant_event;

/// Effective presence: offline with no live connection, otherwise the
/// stored manual override or plain online.
pub(crate) fn effective_status(
    has_connection: bool,
    manual: Option<PresenceStatus>,
) -> PresenceStatus {
    if !has_connection {
        return PresenceStatus::Offline;
    }
    manual.unwrap_or(PresenceStatus::Online)
}

pub(crate) async fn user_status(state: &AppState, user_id: UserId) -> PresenceStatus {
    let has_connection = {
        let presence = state.connection_presence.read().await;
        presence.values().any(|entry| entry.user_id == user_id)
    };
    let manual = {
        let user_ids = state.user_ids.read().await;
        let Some(username) = user_ids.get(&user_id.to_string()) else {
            return PresenceStatus::Offline;
        };
        let users = state.users.read().await;
        users.get(username).and_then(|user| user.manual_status)
    };
    effective_status(has_connection, manual)
}

pub(crate) async fn user_status_label(state: &AppState, user_id: UserId) -> &'static str {
    user_status(state, user_id).await.as_str()
}

/// Tenants in which the removed connection's user no longer has any live
/// connection; these transition toward offline.
pub(crate) fn compute_offline_tenants(
    remaining: &HashMap<Uuid, ConnectionPresence>,
    removed: &ConnectionPresence,
) -> Vec<String> {
    let mut offline = Vec::new();
    for tenant_id in &removed.tenant_ids {
        let still_connected = remaining.values().any(|entry| {
            entry.user_id == removed.user_id && entry.tenant_ids.contains(tenant_id)
        });
        if !still_connected {
            offline.push(tenant_id.clone());
        }
    }
    offline
}

/// Snapshot of every member with a live connection in the tenant, for the
/// presence_sync sent to a freshly registered connection.
pub(crate) async fn tenant_presence_entries(
    state: &AppState,
    tenant_id: &str,
) -> Vec<PresenceEntry> {
    let connected_users: Vec<UserId> = {
        let presence = state.connection_presence.read().await;
        let mut users: Vec<UserId> = presence
            .values()
            .filter(|entry| entry.tenant_ids.contains(tenant_id))
            .map(|entry| entry.user_id)
            .collect();
        users.sort_unstable_by_key(UserId::to_string);
        users.dedup();
        users
    };

    let mut entries = Vec::with_capacity(connected_users.len());
    for user_id in connected_users {
        entries.push(PresenceEntry {
            user_id: user_id.to_string(),
            status: user_status_label(state, user_id).await,
        });
    }
    entries
}

/// Whether this user had no other live connection before the given one;
/// the first connection is what flips presence away from offline.
pub(crate) async fn is_only_connection(
    state: &AppState,
    connection_id: Uuid,
    user_id: UserId,
) -> bool {
    let presence = state.connection_presence.read().await;
    !presence
        .iter()
        .any(|(id, entry)| *id != connection_id && entry.user_id == user_id)
}

/// Broadcast the user's current effective status into every tenant they
/// are scoped to.
pub(crate) async fn broadcast_status(state: &AppState, user_id: UserId, tenant_ids: &[String]) {
    let status = user_status_label(state, user_id).await;
    for tenant_id in tenant_ids {
        let update = gateway_events::presence_update(state, tenant_id, user_id, status);
        broadcast_tenant_event(state, tenant_id, &update).await;
    }
}

/// Persist a manual status change and broadcast it. `online` clears the
/// override.
pub(crate) async fn apply_manual_status(
    state: &AppState,
    user_id: UserId,
    username: &str,
    status: PresenceStatus,
) {
    {
        let mut users = state.users.write().await;
        if let Some(user) = users.get_mut(username) {
            user.manual_status = match status {
                PresenceStatus::Online => None,
                other => Some(other),
            };
        }
    }

    let tenant_ids: Vec<String> = {
        let presence = state.connection_presence.read().await;
        let mut ids: Vec<String> = presence
            .values()
            .filter(|entry| entry.user_id == user_id)
            .flat_map(|entry| entry.tenant_ids.iter().cloned())
            .collect();
        ids.sort_unstable();
        ids.dedup();
        ids
    };
    broadcast_status(state, user_id, &tenant_ids).await;
}

#[cfg(test)]
mod tests {
    use std::collections::{HashMap, HashSet};

    use hearth_core::{PresenceStatus, UserId};
    use uuid::Uuid;

    use super::{compute_offline_tenants, effective_status};
    use crate::server::core::ConnectionPresence;

    #[test]
    fn effective_status_prefers_manual_override_while_connected() {
        assert_eq!(
            effective_status(true, Some(PresenceStatus::Dnd)),
            PresenceStatus::Dnd
        );
        assert_eq!(effective_status(true, None), PresenceStatus::Online);
        assert_eq!(
            effective_status(false, Some(PresenceStatus::Idle)),
            PresenceStatus::Offline
        );
        assert_eq!(effective_status(false, None), PresenceStatus::Offline);
    }

    #[test]
    fn offline_tenants_exclude_scopes_still_held_by_other_connections() {
        let user_id = UserId::new();
        let removed = ConnectionPresence {
            user_id,
            tenant_ids: HashSet::from([String::from("t1"), String::from("t2")]),
        };
        let mut remaining = HashMap::new();
        remaining.insert(
            Uuid::new_v4(),
            ConnectionPresence {
                user_id,
                tenant_ids: HashSet::from([String::from("t1")]),
            },
        );
        remaining.insert(
            Uuid::new_v4(),
            ConnectionPresence {
                user_id: UserId::new(),
                tenant_ids: HashSet::from([String::from("t2")]),
            },
        );

        let offline = compute_offline_tenants(&remaining, &removed);
        assert_eq!(offline, vec![String::from("t2")]);
    }
}
