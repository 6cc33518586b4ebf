use std::{
    collections::VecDeque,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::{Duration, Instant},
};

use axum::{
    extract::{
        ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade},
        Query, State,
    },
    http::HeaderMap,
    response::IntoResponse,
};
use futures_util::{SinkExt, StreamExt};
use hearth_core::PresenceStatus;
use hearth_protocol::parse_envelope;
use tokio::sync::{mpsc, watch};
use uuid::Uuid;

use super::{
    auth::{authenticate_with_token, bearer_token},
    core::{AppState, AuthContext, ConnectionControl},
    errors::ApiFailure,
    gateway_events,
    metrics::{record_gateway_event_dropped, record_gateway_event_emitted, record_ws_disconnect},
    types::{GatewayAuthQuery, GatewaySetPresence, GatewayTyping},
};

pub(crate) mod fanout;
pub(crate) mod presence;
pub(crate) mod registry;

pub(crate) use fanout::*;
pub(crate) use presence::*;
pub(crate) use registry::*;

pub(crate) async fn gateway_ws(
    State(state): State<AppState>,
    ws: WebSocketUpgrade,
    Query(query): Query<GatewayAuthQuery>,
    headers: HeaderMap,
) -> Result<impl IntoResponse, ApiFailure> {
    let token = query
        .access_token
        .or_else(|| bearer_token(&headers).map(ToOwned::to_owned))
        .ok_or(ApiFailure::Unauthorized)?;
    let auth = authenticate_with_token(&state, &token).await?;

    Ok(ws.on_upgrade(move |socket| async move {
        handle_gateway_connection(state, socket, auth).await;
    }))
}

#[allow(clippy::too_many_lines)]
pub(crate) async fn handle_gateway_connection(state: AppState, socket: WebSocket, auth: AuthContext) {
    let connection_id = Uuid::new_v4();
    let (mut sink, mut stream) = socket.split();
    let slow_consumer_disconnect = Arc::new(AtomicBool::new(false));

    let (outbound_tx, mut outbound_rx) =
        mpsc::channel::<String>(state.runtime.gateway_outbound_queue);
    let (control_tx, mut control_rx) = watch::channel(ConnectionControl::Open);

    let first_connection = is_only_connection(&state, connection_id, auth.user_id).await;
    let tenant_ids = register_connection(
        &state,
        connection_id,
        auth.user_id,
        &outbound_tx,
        control_tx,
    )
    .await;

    let ready_event = gateway_events::ready(&state, auth.user_id);
    let _ = outbound_tx.send(ready_event.payload).await;
    record_gateway_event_emitted("connection", ready_event.op);

    for tenant_id in &tenant_ids {
        let entries = tenant_presence_entries(&state, tenant_id).await;
        let sync_event = gateway_events::presence_sync(&state, tenant_id, entries);
        if outbound_tx.send(sync_event.payload).await.is_ok() {
            record_gateway_event_emitted("connection", sync_event.op);
        }
    }
    if first_connection {
        broadcast_status(&state, auth.user_id, &tenant_ids).await;
    }

    let slow_consumer_disconnect_send = Arc::clone(&slow_consumer_disconnect);
    let send_task = tokio::spawn(async move {
        loop {
            tokio::select! {
                control_change = control_rx.changed() => {
                    if control_change.is_err() {
                        break;
                    }
                    if *control_rx.borrow() == ConnectionControl::Close {
                        slow_consumer_disconnect_send.store(true, Ordering::Relaxed);
                        record_ws_disconnect("slow_consumer");
                        let _ = sink
                            .send(Message::Close(Some(CloseFrame {
                                code: 1008,
                                reason: "slow_consumer".into(),
                            })))
                            .await;
                        break;
                    }
                }
                maybe_payload = outbound_rx.recv() => {
                    match maybe_payload {
                        Some(payload) => {
                            if sink.send(Message::Text(payload.into())).await.is_err() {
                                break;
                            }
                        }
                        None => break,
                    }
                }
            }
        }
    });

    let heartbeat_grace = state.runtime.heartbeat_interval
        * state.runtime.heartbeat_missed_limit.max(1);
    let mut heartbeat_deadline = Instant::now() + heartbeat_grace;
    let mut ingress = VecDeque::new();
    let mut disconnect_reason = "connection_closed";

    loop {
        let remaining = heartbeat_deadline.saturating_duration_since(Instant::now());
        let incoming = match tokio::time::timeout(remaining, stream.next()).await {
            Err(_) => {
                disconnect_reason = "heartbeat_timeout";
                break;
            }
            Ok(None) => break,
            Ok(Some(Err(_))) => {
                disconnect_reason = "socket_error";
                break;
            }
            Ok(Some(Ok(message))) => message,
        };

        let payload: Vec<u8> = match incoming {
            Message::Text(text) => {
                if text.len() > state.runtime.max_gateway_event_bytes {
                    disconnect_reason = "event_too_large";
                    break;
                }
                text.as_bytes().to_vec()
            }
            Message::Binary(bytes) => {
                if bytes.len() > state.runtime.max_gateway_event_bytes {
                    disconnect_reason = "event_too_large";
                    break;
                }
                bytes.to_vec()
            }
            Message::Close(_) => {
                disconnect_reason = "client_close";
                break;
            }
            Message::Ping(_) | Message::Pong(_) => continue,
        };

        if !allow_gateway_ingress(
            &mut ingress,
            state.runtime.gateway_ingress_events_per_window,
            state.runtime.gateway_ingress_window,
        ) {
            disconnect_reason = "ingress_rate_limited";
            break;
        }

        let Ok(envelope) = parse_envelope(&payload) else {
            disconnect_reason = "invalid_envelope";
            break;
        };

        match envelope.op.as_str() {
            "heartbeat" => {
                heartbeat_deadline = Instant::now() + heartbeat_grace;
                let ack = gateway_events::heartbeat_ack();
                match outbound_tx.try_send(ack.payload) {
                    Ok(()) => record_gateway_event_emitted("connection", ack.op),
                    Err(mpsc::error::TrySendError::Full(_)) => {
                        record_gateway_event_dropped("connection", ack.op, "full_queue");
                        disconnect_reason = "outbound_queue_full";
                        break;
                    }
                    Err(mpsc::error::TrySendError::Closed(_)) => break,
                }
            }
            "set_presence" => {
                let Ok(request) = serde_json::from_value::<GatewaySetPresence>(envelope.d) else {
                    disconnect_reason = "invalid_presence_payload";
                    break;
                };
                let Ok(status) = PresenceStatus::try_from(request.status) else {
                    disconnect_reason = "invalid_presence_payload";
                    break;
                };
                if status == PresenceStatus::Offline {
                    disconnect_reason = "invalid_presence_payload";
                    break;
                }
                apply_manual_status(&state, auth.user_id, &auth.username, status).await;
            }
            "typing" => {
                let Ok(request) = serde_json::from_value::<GatewayTyping>(envelope.d) else {
                    disconnect_reason = "invalid_typing_payload";
                    break;
                };
                if !connection_holds_scope(&state, connection_id, &request.tenant_id).await {
                    disconnect_reason = "forbidden_scope";
                    break;
                }
                let event = gateway_events::typing_start(
                    &state,
                    &request.tenant_id,
                    &request.channel_id,
                    auth.user_id,
                    &auth.username,
                );
                broadcast_tenant_event_except(
                    &state,
                    &request.tenant_id,
                    Some(auth.user_id),
                    &event,
                )
                .await;
            }
            _ => {
                disconnect_reason = "unknown_op";
                break;
            }
        }
    }

    if !slow_consumer_disconnect.load(Ordering::Relaxed) {
        record_ws_disconnect(disconnect_reason);
    }
    remove_connection(&state, connection_id).await;
    send_task.abort();
}

async fn connection_holds_scope(state: &AppState, connection_id: Uuid, tenant_id: &str) -> bool {
    let presence = state.connection_presence.read().await;
    presence
        .get(&connection_id)
        .is_some_and(|entry| entry.tenant_ids.contains(tenant_id))
}

/// Per-connection ingress flood guard over a rolling window.
pub(crate) fn allow_gateway_ingress(
    ingress: &mut VecDeque<Instant>,
    limit: u32,
    window: Duration,
) -> bool {
    let now = Instant::now();
    while ingress
        .front()
        .is_some_and(|oldest| now.duration_since(*oldest) > window)
    {
        let _ = ingress.pop_front();
    }

    if ingress.len() >= limit as usize {
        return false;
    }

    ingress.push_back(now);
    true
}

#[cfg(test)]
mod tests {
    use std::{collections::VecDeque, time::Duration};

    use super::allow_gateway_ingress;

    #[test]
    fn ingress_guard_limits_events_per_window() {
        let mut ingress = VecDeque::new();
        for _ in 0..20 {
            assert!(allow_gateway_ingress(
                &mut ingress,
                20,
                Duration::from_secs(10)
            ));
        }
        assert!(!allow_gateway_ingress(
            &mut ingress,
            20,
            Duration::from_secs(10)
        ));
    }

    #[test]
    fn ingress_guard_forgets_events_outside_window() {
        let mut ingress = VecDeque::new();
        assert!(allow_gateway_ingress(
            &mut ingress,
            1,
            Duration::from_millis(1)
        ));
        std::thread::sleep(Duration::from_millis(5));
        assert!(allow_gateway_ingress(
            &mut ingress,
            1,
            Duration::from_millis(1)
        ));
    }
}
