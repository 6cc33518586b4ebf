use hearth_core::UserId;
use hearth_protocol::{Envelope, OpCode};
use serde::Serialize;

use super::{
    core::AppState,
    types::{ChannelResponse, MessageResponse, OverrideResponse},
};

pub(crate) struct GatewayEvent {
    pub(crate) op: &'static str,
    pub(crate) payload: String,
}

fn outbound_event<T: Serialize>(op: &'static str, data: T, seq: Option<i64>) -> String {
    let envelope = Envelope {
        op: OpCode::try_from(op.to_owned()).unwrap_or_else(|_| {
            OpCode::try_from(String::from("ready")).expect("valid op code")
        }),
        d: serde_json::to_value(data).unwrap_or(serde_json::Value::Null),
        seq,
    };

    serde_json::to_string(&envelope).unwrap_or_else(|_| String::from(r#"{"op":"ready","d":{}}"#))
}

fn build_event<T: Serialize>(state: &AppState, op: &'static str, payload: T) -> GatewayEvent {
    GatewayEvent {
        op,
        payload: outbound_event(op, payload, Some(state.next_event_seq())),
    }
}

#[derive(Serialize)]
struct ReadyPayload<'a> {
    user_id: &'a str,
    heartbeat_interval_secs: u64,
    heartbeat_missed_limit: u32,
}

pub(crate) fn ready(state: &AppState, user_id: UserId) -> GatewayEvent {
    build_event(
        state,
        "ready",
        ReadyPayload {
            user_id: &user_id.to_string(),
            heartbeat_interval_secs: state.runtime.heartbeat_interval.as_secs(),
            heartbeat_missed_limit: state.runtime.heartbeat_missed_limit,
        },
    )
}

/// Heartbeat acks answer one connection's liveness probe; they carry no
/// sequence number.
pub(crate) fn heartbeat_ack() -> GatewayEvent {
    GatewayEvent {
        op: "heartbeat_ack",
        payload: outbound_event("heartbeat_ack", serde_json::json!({}), None),
    }
}

#[derive(Serialize)]
pub(crate) struct PresenceEntry {
    pub(crate) user_id: String,
    pub(crate) status: &'static str,
}

#[derive(Serialize)]
struct PresenceSyncPayload<'a> {
    tenant_id: &'a str,
    members: Vec<PresenceEntry>,
}

pub(crate) fn presence_sync(
    state: &AppState,
    tenant_id: &str,
    members: Vec<PresenceEntry>,
) -> GatewayEvent {
    build_event(
        state,
        "presence_sync",
        PresenceSyncPayload { tenant_id, members },
    )
}

#[derive(Serialize)]
struct PresenceUpdatePayload<'a> {
    tenant_id: &'a str,
    user_id: String,
    status: &'a str,
}

pub(crate) fn presence_update(
    state: &AppState,
    tenant_id: &str,
    user_id: UserId,
    status: &str,
) -> GatewayEvent {
    build_event(
        state,
        "presence_update",
        PresenceUpdatePayload {
            tenant_id,
            user_id: user_id.to_string(),
            status,
        },
    )
}

#[derive(Serialize)]
struct TypingStartPayload<'a> {
    tenant_id: &'a str,
    channel_id: &'a str,
    user_id: String,
    username: &'a str,
}

pub(crate) fn typing_start(
    state: &AppState,
    tenant_id: &str,
    channel_id: &str,
    user_id: UserId,
    username: &str,
) -> GatewayEvent {
    build_event(
        state,
        "typing_start",
        TypingStartPayload {
            tenant_id,
            channel_id,
            user_id: user_id.to_string(),
            username,
        },
    )
}

pub(crate) fn message_create(state: &AppState, message: &MessageResponse) -> GatewayEvent {
    build_event(state, "message_create", message)
}

pub(crate) fn message_update(state: &AppState, message: &MessageResponse) -> GatewayEvent {
    build_event(state, "message_update", message)
}

#[derive(Serialize)]
struct MessageDeletePayload<'a> {
    tenant_id: &'a str,
    channel_id: &'a str,
    message_id: &'a str,
}

pub(crate) fn message_delete(
    state: &AppState,
    tenant_id: &str,
    channel_id: &str,
    message_id: &str,
) -> GatewayEvent {
    build_event(
        state,
        "message_delete",
        MessageDeletePayload {
            tenant_id,
            channel_id,
            message_id,
        },
    )
}

#[derive(Serialize)]
struct MemberPayload<'a> {
    tenant_id: &'a str,
    user_id: String,
    username: &'a str,
}

pub(crate) fn member_join(
    state: &AppState,
    tenant_id: &str,
    user_id: UserId,
    username: &str,
) -> GatewayEvent {
    build_event(
        state,
        "member_join",
        MemberPayload {
            tenant_id,
            user_id: user_id.to_string(),
            username,
        },
    )
}

pub(crate) fn member_leave(
    state: &AppState,
    tenant_id: &str,
    user_id: UserId,
    username: &str,
) -> GatewayEvent {
    build_event(
        state,
        "member_leave",
        MemberPayload {
            tenant_id,
            user_id: user_id.to_string(),
            username,
        },
    )
}

pub(crate) fn member_ban(
    state: &AppState,
    tenant_id: &str,
    user_id: UserId,
    username: &str,
) -> GatewayEvent {
    build_event(
        state,
        "member_ban",
        MemberPayload {
            tenant_id,
            user_id: user_id.to_string(),
            username,
        },
    )
}

#[derive(Serialize)]
struct MemberRemovedPayload<'a> {
    tenant_id: &'a str,
    reason: &'static str,
}

/// User-scoped notice to the removed member; they are already outside the
/// tenant scope when this is published.
pub(crate) fn member_removed(
    state: &AppState,
    tenant_id: &str,
    reason: &'static str,
) -> GatewayEvent {
    build_event(
        state,
        "member_removed",
        MemberRemovedPayload { tenant_id, reason },
    )
}

#[derive(Serialize)]
struct RolePayload<'a> {
    tenant_id: &'a str,
    role: &'a hearth_core::Role,
}

pub(crate) fn role_create(
    state: &AppState,
    tenant_id: &str,
    role: &hearth_core::Role,
) -> GatewayEvent {
    build_event(state, "role_create", RolePayload { tenant_id, role })
}

pub(crate) fn role_update(
    state: &AppState,
    tenant_id: &str,
    role: &hearth_core::Role,
) -> GatewayEvent {
    build_event(state, "role_update", RolePayload { tenant_id, role })
}

#[derive(Serialize)]
struct RoleDeletePayload<'a> {
    tenant_id: &'a str,
    role_id: &'a str,
}

pub(crate) fn role_delete(state: &AppState, tenant_id: &str, role_id: &str) -> GatewayEvent {
    build_event(
        state,
        "role_delete",
        RoleDeletePayload { tenant_id, role_id },
    )
}

#[derive(Serialize)]
struct RoleMemberPayload<'a> {
    tenant_id: &'a str,
    role_id: &'a str,
    user_id: String,
}

pub(crate) fn role_assign(
    state: &AppState,
    tenant_id: &str,
    role_id: &str,
    user_id: UserId,
) -> GatewayEvent {
    build_event(
        state,
        "role_assign",
        RoleMemberPayload {
            tenant_id,
            role_id,
            user_id: user_id.to_string(),
        },
    )
}

pub(crate) fn role_unassign(
    state: &AppState,
    tenant_id: &str,
    role_id: &str,
    user_id: UserId,
) -> GatewayEvent {
    build_event(
        state,
        "role_unassign",
        RoleMemberPayload {
            tenant_id,
            role_id,
            user_id: user_id.to_string(),
        },
    )
}

pub(crate) fn channel_create(state: &AppState, channel: &ChannelResponse) -> GatewayEvent {
    build_event(state, "channel_create", channel)
}

pub(crate) fn channel_update(state: &AppState, channel: &ChannelResponse) -> GatewayEvent {
    build_event(state, "channel_update", channel)
}

#[derive(Serialize)]
struct ChannelDeletePayload<'a> {
    tenant_id: &'a str,
    channel_id: &'a str,
}

pub(crate) fn channel_delete(state: &AppState, tenant_id: &str, channel_id: &str) -> GatewayEvent {
    build_event(
        state,
        "channel_delete",
        ChannelDeletePayload {
            tenant_id,
            channel_id,
        },
    )
}

pub(crate) fn channel_override_update(
    state: &AppState,
    override_row: &OverrideResponse,
) -> GatewayEvent {
    build_event(state, "channel_override_update", override_row)
}

#[derive(Serialize)]
struct OverrideDeletePayload<'a> {
    channel_id: &'a str,
    role_id: &'a str,
}

pub(crate) fn channel_override_delete(
    state: &AppState,
    channel_id: &str,
    role_id: &str,
) -> GatewayEvent {
    build_event(
        state,
        "channel_override_delete",
        OverrideDeletePayload {
            channel_id,
            role_id,
        },
    )
}

#[derive(Serialize)]
struct VoicePayload<'a> {
    tenant_id: &'a str,
    channel_id: &'a str,
    user_id: String,
}

pub(crate) fn voice_join(
    state: &AppState,
    tenant_id: &str,
    channel_id: &str,
    user_id: UserId,
) -> GatewayEvent {
    build_event(
        state,
        "voice_join",
        VoicePayload {
            tenant_id,
            channel_id,
            user_id: user_id.to_string(),
        },
    )
}

pub(crate) fn voice_leave(
    state: &AppState,
    tenant_id: &str,
    channel_id: &str,
    user_id: UserId,
) -> GatewayEvent {
    build_event(
        state,
        "voice_leave",
        VoicePayload {
            tenant_id,
            channel_id,
            user_id: user_id.to_string(),
        },
    )
}
