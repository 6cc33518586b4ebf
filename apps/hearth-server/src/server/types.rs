use axum::{http::header::CONTENT_TYPE, response::IntoResponse, Json};
use serde::{Deserialize, Serialize};

use super::metrics::render_metrics;

const METRICS_TEXT_CONTENT_TYPE: &str = "text/plain; version=0.0.4; charset=utf-8";

/// REST response envelope. Every API response uses this shape.
#[derive(Debug, Serialize, Deserialize)]
pub(crate) struct ApiResponse<T> {
    pub(crate) success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub(crate) data: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub(crate) error: Option<String>,
}

impl<T> ApiResponse<T> {
    pub(crate) fn success(data: T) -> Self {
        Self {
            success: true,
            data: Some(data),
            error: None,
        }
    }

    pub(crate) fn failure(error: &str) -> Self {
        Self {
            success: false,
            data: None,
            error: Some(error.to_owned()),
        }
    }
}

pub(crate) fn ok<T>(data: T) -> Json<ApiResponse<T>> {
    Json(ApiResponse::success(data))
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub(crate) struct RegisterRequest {
    pub(crate) username: String,
    pub(crate) password: String,
    #[serde(default)]
    pub(crate) locale: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub(crate) struct LoginRequest {
    pub(crate) username: String,
    pub(crate) password: String,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub(crate) struct RefreshRequest {
    pub(crate) refresh_token: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub(crate) struct AuthResponse {
    pub(crate) access_token: String,
    pub(crate) refresh_token: String,
    pub(crate) expires_in_secs: i64,
}

#[derive(Debug, Serialize)]
pub(crate) struct RegisterResponse {
    pub(crate) accepted: bool,
}

#[derive(Debug, Serialize, Deserialize)]
pub(crate) struct MeResponse {
    pub(crate) user_id: String,
    pub(crate) username: String,
    pub(crate) locale: String,
    pub(crate) status: String,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub(crate) struct CreateTenantRequest {
    pub(crate) name: String,
    #[serde(default)]
    pub(crate) invite_required: bool,
}

#[derive(Debug, Serialize, Deserialize)]
pub(crate) struct TenantResponse {
    pub(crate) tenant_id: String,
    pub(crate) name: String,
    pub(crate) owner_id: String,
    pub(crate) invite_required: bool,
    pub(crate) created_at_unix: i64,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub(crate) struct CreateRoleRequest {
    pub(crate) name: String,
    #[serde(default)]
    pub(crate) color: Option<String>,
    #[serde(default)]
    pub(crate) permissions: u64,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub(crate) struct UpdateRoleRequest {
    #[serde(default)]
    pub(crate) name: Option<String>,
    #[serde(default)]
    pub(crate) color: Option<String>,
    #[serde(default)]
    pub(crate) permissions: Option<u64>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub(crate) struct ReorderRolesRequest {
    pub(crate) items: Vec<RolePositionUpdate>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub(crate) struct RolePositionUpdate {
    pub(crate) role_id: String,
    pub(crate) position: i32,
}

#[derive(Debug, Serialize)]
pub(crate) struct RoleListResponse {
    pub(crate) roles: Vec<hearth_core::Role>,
    pub(crate) editable_role_ids: Vec<String>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub(crate) struct CreateChannelRequest {
    pub(crate) name: String,
    pub(crate) kind: String,
    #[serde(default)]
    pub(crate) category: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub(crate) struct UpdateChannelRequest {
    #[serde(default)]
    pub(crate) name: Option<String>,
    #[serde(default)]
    pub(crate) category: Option<String>,
    #[serde(default)]
    pub(crate) position: Option<i32>,
}

#[derive(Debug, Serialize, Deserialize)]
pub(crate) struct ChannelResponse {
    pub(crate) channel_id: String,
    pub(crate) tenant_id: String,
    pub(crate) name: String,
    pub(crate) kind: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub(crate) category: Option<String>,
    pub(crate) position: i32,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub(crate) struct SetOverrideRequest {
    pub(crate) allow: u64,
    pub(crate) deny: u64,
}

#[derive(Debug, Serialize, Deserialize)]
pub(crate) struct OverrideResponse {
    pub(crate) channel_id: String,
    pub(crate) role_id: String,
    pub(crate) allow: u64,
    pub(crate) deny: u64,
}

#[derive(Debug, Serialize, Deserialize)]
pub(crate) struct ChannelPermissionsResponse {
    pub(crate) tenant_id: String,
    pub(crate) channel_id: String,
    pub(crate) permissions: u64,
}

#[derive(Debug, Serialize, Deserialize)]
pub(crate) struct MemberResponse {
    pub(crate) user_id: String,
    pub(crate) username: String,
    pub(crate) joined_at_unix: i64,
    pub(crate) position: i64,
    pub(crate) role_ids: Vec<String>,
    pub(crate) status: String,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub(crate) struct CreateMessageRequest {
    pub(crate) content: String,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub(crate) struct EditMessageRequest {
    pub(crate) content: String,
}

#[derive(Debug, Deserialize)]
pub(crate) struct MessageHistoryQuery {
    #[serde(default)]
    pub(crate) limit: Option<usize>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct MessageResponse {
    pub(crate) message_id: String,
    pub(crate) tenant_id: String,
    pub(crate) channel_id: String,
    pub(crate) author_id: String,
    pub(crate) content: String,
    pub(crate) created_at_unix: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub(crate) edited_at_unix: Option<i64>,
}

#[derive(Debug, Serialize, Deserialize)]
pub(crate) struct VoiceGrantResponse {
    pub(crate) tenant_id: String,
    pub(crate) channel_id: String,
    pub(crate) user_id: String,
    pub(crate) can_speak: bool,
    pub(crate) can_stream: bool,
    pub(crate) grant_token: String,
    pub(crate) expires_at_unix: i64,
}

#[derive(Debug, Deserialize)]
pub(crate) struct TenantPath {
    pub(crate) tenant_id: String,
}

#[derive(Debug, Deserialize)]
pub(crate) struct ChannelPath {
    pub(crate) tenant_id: String,
    pub(crate) channel_id: String,
}

#[derive(Debug, Deserialize)]
pub(crate) struct RolePath {
    pub(crate) tenant_id: String,
    pub(crate) role_id: String,
}

#[derive(Debug, Deserialize)]
pub(crate) struct RoleMemberPath {
    pub(crate) tenant_id: String,
    pub(crate) role_id: String,
    pub(crate) user_id: String,
}

#[derive(Debug, Deserialize)]
pub(crate) struct MemberPath {
    pub(crate) tenant_id: String,
    pub(crate) user_id: String,
}

#[derive(Debug, Deserialize)]
pub(crate) struct MessagePath {
    pub(crate) tenant_id: String,
    pub(crate) channel_id: String,
    pub(crate) message_id: String,
}

#[derive(Debug, Deserialize)]
pub(crate) struct OverridePath {
    pub(crate) tenant_id: String,
    pub(crate) channel_id: String,
    pub(crate) role_id: String,
}

#[derive(Debug, Deserialize)]
pub(crate) struct GatewayAuthQuery {
    #[serde(default)]
    pub(crate) access_token: Option<String>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct GatewayTyping {
    pub(crate) tenant_id: String,
    pub(crate) channel_id: String,
}

#[derive(Debug, Deserialize)]
pub(crate) struct GatewaySetPresence {
    pub(crate) status: String,
}

#[derive(Debug, Serialize)]
struct HealthResponse {
    status: &'static str,
}

pub(crate) async fn health() -> Json<HealthResponse> {
    Json(HealthResponse { status: "ok" })
}

pub(crate) async fn metrics() -> impl IntoResponse {
    ([(CONTENT_TYPE, METRICS_TEXT_CONTENT_TYPE)], render_metrics())
}

#[cfg(test)]
mod tests {
    use super::ApiResponse;

    #[test]
    fn success_envelope_omits_error_field() {
        let envelope = ApiResponse::success(42_u32);
        let text = serde_json::to_string(&envelope).unwrap();
        assert_eq!(text, r#"{"success":true,"data":42}"#);
    }

    #[test]
    fn failure_envelope_omits_data_field() {
        let envelope = ApiResponse::<()>::failure("forbidden");
        let text = serde_json::to_string(&envelope).unwrap();
        assert_eq!(text, r#"{"success":false,"error":"forbidden"}"#);
    }
}
