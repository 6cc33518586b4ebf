use std::collections::HashSet;

use hearth_core::UserId;
use tokio::sync::mpsc;
use tracing::warn;
use uuid::Uuid;

use crate::server::{
    core::{AppState, ConnectionControl, ScopeListeners},
    gateway_events::GatewayEvent,
    metrics::{record_gateway_event_dropped, record_gateway_event_emitted},
};

/// Push one serialized payload to every listener of a scope, skipping the
/// excluded connections. Closed queues are pruned; full queues are pruned
/// and reported as slow so the caller can signal a disconnect. Delivery
/// never blocks the publisher.
pub(crate) fn dispatch_scope_payload(
    listeners: &mut ScopeListeners,
    payload: &str,
    op: &'static str,
    scope: &'static str,
    excluded: &HashSet<Uuid>,
    slow_connections: &mut Vec<Uuid>,
) -> usize {
    let mut delivered = 0usize;
    listeners.retain(|connection_id, sender| {
        if excluded.contains(connection_id) {
            return true;
        }
        match sender.try_send(payload.to_owned()) {
            Ok(()) => {
                delivered += 1;
                true
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                record_gateway_event_dropped(scope, op, "closed");
                false
            }
            Err(mpsc::error::TrySendError::Full(_)) => {
                record_gateway_event_dropped(scope, op, "full_queue");
                warn!(
                    event = "gateway.fanout.full_queue",
                    scope,
                    op,
                    connection_id = %connection_id,
                    "dropped outbound payload for full websocket queue"
                );
                slow_connections.push(*connection_id);
                false
            }
        }
    });
    delivered
}

pub(crate) async fn close_slow_connections(state: &AppState, slow_connections: Vec<Uuid>) {
    if slow_connections.is_empty() {
        return;
    }

    let controls = state.connection_controls.read().await;
    for connection_id in slow_connections {
        if let Some(control) = controls.get(&connection_id) {
            let _ = control.send(ConnectionControl::Close);
        }
    }
}

fn oversized_outbound(state: &AppState, scope: &'static str, event: &GatewayEvent) -> bool {
    if event.payload.len() <= state.runtime.max_gateway_event_bytes {
        return false;
    }
    record_gateway_event_dropped(scope, event.op, "oversized_outbound");
    warn!(
        event = "gateway.fanout.oversized_outbound",
        scope,
        op = event.op,
        payload_bytes = event.payload.len(),
        max_payload_bytes = state.runtime.max_gateway_event_bytes,
        "dropped outbound payload exceeding configured max size"
    );
    true
}

pub(crate) async fn broadcast_tenant_event(state: &AppState, tenant_id: &str, event: &GatewayEvent) {
    broadcast_tenant_event_except(state, tenant_id, None, event).await;
}

/// Fan one event out to a tenant scope, optionally excluding every
/// connection of one user (typing indicators skip their sender).
pub(crate) async fn broadcast_tenant_event_except(
    state: &AppState,
    tenant_id: &str,
    exclude_user: Option<UserId>,
    event: &GatewayEvent,
) {
    if oversized_outbound(state, "tenant", event) {
        return;
    }

    let excluded: HashSet<Uuid> = match exclude_user {
        Some(user_id) => {
            let presence = state.connection_presence.read().await;
            presence
                .iter()
                .filter_map(|(connection_id, entry)| {
                    (entry.user_id == user_id).then_some(*connection_id)
                })
                .collect()
        }
        None => HashSet::new(),
    };

    let mut slow_connections = Vec::new();
    let mut delivered = 0usize;
    let mut subscriptions = state.subscriptions.write().await;
    if let Some(listeners) = subscriptions.get_mut(tenant_id) {
        delivered = dispatch_scope_payload(
            listeners,
            &event.payload,
            event.op,
            "tenant",
            &excluded,
            &mut slow_connections,
        );
        if listeners.is_empty() {
            subscriptions.remove(tenant_id);
        }
    }
    drop(subscriptions);

    close_slow_connections(state, slow_connections).await;
    if delivered > 0 {
        tracing::debug!(
            event = "gateway.event.emit",
            scope = "tenant",
            op = event.op,
            delivered
        );
        for _ in 0..delivered {
            record_gateway_event_emitted("tenant", event.op);
        }
    }
}

pub(crate) async fn broadcast_user_event(state: &AppState, user_id: UserId, event: &GatewayEvent) {
    if oversized_outbound(state, "user", event) {
        return;
    }

    let connection_ids: Vec<Uuid> = {
        let presence = state.connection_presence.read().await;
        presence
            .iter()
            .filter_map(|(connection_id, entry)| {
                (entry.user_id == user_id).then_some(*connection_id)
            })
            .collect()
    };
    if connection_ids.is_empty() {
        return;
    }

    let mut slow_connections = Vec::new();
    let mut delivered = 0usize;
    let mut senders = state.connection_senders.write().await;
    for connection_id in connection_ids {
        let Some(sender) = senders.get(&connection_id) else {
            continue;
        };
        match sender.try_send(event.payload.clone()) {
            Ok(()) => delivered += 1,
            Err(mpsc::error::TrySendError::Closed(_)) => {
                record_gateway_event_dropped("user", event.op, "closed");
                senders.remove(&connection_id);
            }
            Err(mpsc::error::TrySendError::Full(_)) => {
                record_gateway_event_dropped("user", event.op, "full_queue");
                slow_connections.push(connection_id);
                senders.remove(&connection_id);
            }
        }
    }
    drop(senders);

    close_slow_connections(state, slow_connections).await;
    for _ in 0..delivered {
        record_gateway_event_emitted("user", event.op);
    }
}

#[cfg(test)]
mod tests {
    use std::collections::{HashMap, HashSet};

    use tokio::sync::{mpsc, watch};
    use uuid::Uuid;

    use super::{close_slow_connections, dispatch_scope_payload};
    use crate::server::core::{AppConfig, AppState, ConnectionControl};

    #[tokio::test]
    async fn delivers_to_every_listener_once() {
        let first = Uuid::new_v4();
        let second = Uuid::new_v4();
        let (first_sender, mut first_receiver) = mpsc::channel::<String>(2);
        let (second_sender, mut second_receiver) = mpsc::channel::<String>(2);
        let mut listeners = HashMap::from([(first, first_sender), (second, second_sender)]);

        let mut slow = Vec::new();
        let delivered = dispatch_scope_payload(
            &mut listeners,
            "payload",
            "message_create",
            "tenant",
            &HashSet::new(),
            &mut slow,
        );

        assert_eq!(delivered, 2);
        assert!(slow.is_empty());
        assert_eq!(first_receiver.recv().await.as_deref(), Some("payload"));
        assert_eq!(second_receiver.recv().await.as_deref(), Some("payload"));
    }

    #[tokio::test]
    async fn prunes_closed_and_marks_full_connections() {
        let keep_id = Uuid::new_v4();
        let full_id = Uuid::new_v4();
        let closed_id = Uuid::new_v4();

        let (keep_sender, _keep_receiver) = mpsc::channel::<String>(2);
        let (full_sender, mut full_receiver) = mpsc::channel::<String>(1);
        full_sender
            .try_send(String::from("occupied"))
            .expect("queue should fill");
        let (closed_sender, closed_receiver) = mpsc::channel::<String>(1);
        drop(closed_receiver);

        let mut listeners = HashMap::from([
            (keep_id, keep_sender),
            (full_id, full_sender),
            (closed_id, closed_sender),
        ]);

        let mut slow = Vec::new();
        let delivered = dispatch_scope_payload(
            &mut listeners,
            "payload",
            "message_create",
            "tenant",
            &HashSet::new(),
            &mut slow,
        );

        assert_eq!(delivered, 1);
        assert_eq!(slow, vec![full_id]);
        assert!(listeners.contains_key(&keep_id));
        assert!(!listeners.contains_key(&full_id));
        assert!(!listeners.contains_key(&closed_id));
        assert_eq!(full_receiver.recv().await.as_deref(), Some("occupied"));
    }

    #[tokio::test]
    async fn excluded_connections_are_skipped_but_kept() {
        let excluded_id = Uuid::new_v4();
        let (excluded_sender, mut excluded_receiver) = mpsc::channel::<String>(1);
        let mut listeners = HashMap::from([(excluded_id, excluded_sender)]);

        let mut slow = Vec::new();
        let delivered = dispatch_scope_payload(
            &mut listeners,
            "payload",
            "typing_start",
            "tenant",
            &HashSet::from([excluded_id]),
            &mut slow,
        );

        assert_eq!(delivered, 0);
        assert!(listeners.contains_key(&excluded_id));
        assert!(excluded_receiver.try_recv().is_err());
    }

    #[tokio::test]
    async fn slow_connections_receive_a_close_signal() {
        let state = AppState::new(&AppConfig::default()).expect("state should initialize");
        let connection_id = Uuid::new_v4();
        let (control_tx, mut control_rx) = watch::channel(ConnectionControl::Open);
        state
            .connection_controls
            .write()
            .await
            .insert(connection_id, control_tx);

        close_slow_connections(&state, vec![connection_id]).await;

        control_rx
            .changed()
            .await
            .expect("control channel should signal");
        assert_eq!(*control_rx.borrow(), ConnectionControl::Close);
    }
}
