use std::collections::{HashMap, HashSet};

use hearth_core::UserId;
use tokio::sync::{mpsc, watch};
use uuid::Uuid;

use crate::server::{
    core::{AppState, ConnectionControl, ConnectionPresence, ScopeSubscriptions},
    gateway_events,
};

use super::{
    fanout::broadcast_tenant_event,
    presence::{compute_offline_tenants, user_status_label},
};

pub(crate) fn insert_scope_subscription(
    subscriptions: &mut ScopeSubscriptions,
    connection_id: Uuid,
    scope_key: String,
    outbound_tx: mpsc::Sender<String>,
) {
    subscriptions
        .entry(scope_key)
        .or_default()
        .insert(connection_id, outbound_tx);
}

pub(crate) fn remove_connection_state(
    presence: &mut HashMap<Uuid, ConnectionPresence>,
    controls: &mut HashMap<Uuid, watch::Sender<ConnectionControl>>,
    senders: &mut HashMap<Uuid, mpsc::Sender<String>>,
    connection_id: Uuid,
) -> Option<ConnectionPresence> {
    let removed_presence = presence.remove(&connection_id);
    controls.remove(&connection_id);
    senders.remove(&connection_id);
    removed_presence
}

pub(crate) fn remove_connection_from_scopes(
    subscriptions: &mut ScopeSubscriptions,
    connection_id: Uuid,
) {
    subscriptions.retain(|_, listeners| {
        listeners.remove(&connection_id);
        !listeners.is_empty()
    });
}

/// Register a new connection under every tenant scope its user belongs to
/// and record its presence, control, and sender entries. Returns the scoped
/// tenant ids.
pub(crate) async fn register_connection(
    state: &AppState,
    connection_id: Uuid,
    user_id: UserId,
    outbound_tx: &mpsc::Sender<String>,
    control_tx: watch::Sender<ConnectionControl>,
) -> Vec<String> {
    let tenant_ids: Vec<String> = {
        let tenants = state.tenants.read().await;
        tenants
            .iter()
            .filter(|(_, tenant)| tenant.members.contains_key(&user_id))
            .map(|(tenant_id, _)| tenant_id.clone())
            .collect()
    };

    state
        .connection_senders
        .write()
        .await
        .insert(connection_id, outbound_tx.clone());
    state
        .connection_controls
        .write()
        .await
        .insert(connection_id, control_tx);
    state.connection_presence.write().await.insert(
        connection_id,
        ConnectionPresence {
            user_id,
            tenant_ids: tenant_ids.iter().cloned().collect::<HashSet<_>>(),
        },
    );

    let mut subscriptions = state.subscriptions.write().await;
    for tenant_id in &tenant_ids {
        insert_scope_subscription(
            &mut subscriptions,
            connection_id,
            tenant_id.clone(),
            outbound_tx.clone(),
        );
    }
    drop(subscriptions);

    tenant_ids
}

/// Register an additional tenant scope for every live connection of a user.
/// Called when a membership is created while the user is connected.
pub(crate) async fn add_tenant_scope_for_user(state: &AppState, user_id: UserId, tenant_id: &str) {
    let mut presence = state.connection_presence.write().await;
    let senders = state.connection_senders.read().await;
    let mut subscriptions = state.subscriptions.write().await;
    for (connection_id, entry) in presence.iter_mut() {
        if entry.user_id != user_id {
            continue;
        }
        entry.tenant_ids.insert(tenant_id.to_owned());
        if let Some(sender) = senders.get(connection_id) {
            insert_scope_subscription(
                &mut subscriptions,
                *connection_id,
                tenant_id.to_owned(),
                sender.clone(),
            );
        }
    }
}

/// Drop one tenant scope from every live connection of a user. Called on
/// leave, kick, and ban; the connection itself stays open.
pub(crate) async fn remove_tenant_scope_for_user(
    state: &AppState,
    user_id: UserId,
    tenant_id: &str,
) {
    let mut presence = state.connection_presence.write().await;
    let mut subscriptions = state.subscriptions.write().await;
    let mut affected = Vec::new();
    for (connection_id, entry) in presence.iter_mut() {
        if entry.user_id != user_id {
            continue;
        }
        entry.tenant_ids.remove(tenant_id);
        affected.push(*connection_id);
    }
    if let Some(listeners) = subscriptions.get_mut(tenant_id) {
        for connection_id in affected {
            listeners.remove(&connection_id);
        }
        if listeners.is_empty() {
            subscriptions.remove(tenant_id);
        }
    }
}

/// Full teardown for a closed connection: release every registry entry,
/// then push an offline presence update into each tenant the user no longer
/// has any live connection in.
pub(crate) async fn remove_connection(state: &AppState, connection_id: Uuid) {
    let removed_presence = {
        let mut presence = state.connection_presence.write().await;
        let mut controls = state.connection_controls.write().await;
        let mut senders = state.connection_senders.write().await;
        remove_connection_state(&mut presence, &mut controls, &mut senders, connection_id)
    };

    let mut subscriptions = state.subscriptions.write().await;
    remove_connection_from_scopes(&mut subscriptions, connection_id);
    drop(subscriptions);

    let Some(removed_presence) = removed_presence else {
        return;
    };
    let offline_tenants = {
        let remaining = state.connection_presence.read().await;
        compute_offline_tenants(&remaining, &removed_presence)
    };
    if offline_tenants.is_empty() {
        return;
    }

    let status = user_status_label(state, removed_presence.user_id).await;
    for tenant_id in offline_tenants {
        let update =
            gateway_events::presence_update(state, &tenant_id, removed_presence.user_id, status);
        broadcast_tenant_event(state, &tenant_id, &update).await;
    }
}
