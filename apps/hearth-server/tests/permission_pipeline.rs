use std::time::Duration;

use axum::{body::Body, http::Request, http::StatusCode};
use hearth_server::{build_router, AppConfig};
use serde_json::{json, Value};
use tower::ServiceExt;

const IP: &str = "203.0.113.20";

// SendMessages | ReadMessages
const SEND_BIT: u64 = 32;
const MANAGE_MESSAGES_BIT: u64 = 16;
const MANAGE_CHANNELS_BIT: u64 = 1;
const MANAGE_ROLES_BIT: u64 = 2;
const KICK_BIT: u64 = 4;
const CONNECT_VOICE_BIT: u64 = 64;

fn test_app() -> axum::Router {
    build_router(&AppConfig {
        max_body_bytes: 1024 * 32,
        request_timeout: Duration::from_secs(2),
        rate_limit_requests_per_minute: 500,
        message_max_per_window: 100,
        ..AppConfig::default()
    })
    .expect("router should build")
}

async fn parse_json_body(response: axum::response::Response) -> Value {
    let body = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .expect("response body should be readable");
    serde_json::from_slice(&body).expect("response body should be valid json")
}

fn request(method: &str, uri: &str, token: Option<&str>, body: Option<Value>) -> Request<Body> {
    let mut builder = Request::builder()
        .method(method)
        .uri(uri)
        .header("x-forwarded-for", IP);
    if let Some(token) = token {
        builder = builder.header("authorization", format!("Bearer {token}"));
    }
    let body = match body {
        Some(value) => {
            builder = builder.header("content-type", "application/json");
            Body::from(value.to_string())
        }
        None => Body::empty(),
    };
    builder.body(body).expect("request should build")
}

async fn send(app: &axum::Router, req: Request<Body>) -> (StatusCode, Value) {
    let response = app
        .clone()
        .oneshot(req)
        .await
        .expect("request should execute");
    let status = response.status();
    let body = parse_json_body(response).await;
    (status, body)
}

async fn register_and_login(app: &axum::Router, username: &str) -> String {
    let (status, _) = send(
        app,
        request(
            "POST",
            "/auth/register",
            None,
            Some(json!({"username": username, "password": "super-secure-password"})),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::OK);

    let (status, body) = send(
        app,
        request(
            "POST",
            "/auth/login",
            None,
            Some(json!({"username": username, "password": "super-secure-password"})),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    body["data"]["access_token"]
        .as_str()
        .expect("access token should exist")
        .to_owned()
}

async fn create_tenant(app: &axum::Router, token: &str, name: &str) -> String {
    let (status, body) = send(
        app,
        request(
            "POST",
            "/tenants",
            Some(token),
            Some(json!({"name": name})),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    body["data"]["tenant_id"]
        .as_str()
        .expect("tenant id should exist")
        .to_owned()
}

async fn default_channel(app: &axum::Router, token: &str, tenant_id: &str) -> String {
    let (status, body) = send(
        app,
        request(
            "GET",
            &format!("/tenants/{tenant_id}/channels"),
            Some(token),
            None,
        ),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    body["data"][0]["channel_id"]
        .as_str()
        .expect("seeded channel should exist")
        .to_owned()
}

async fn join(app: &axum::Router, token: &str, tenant_id: &str) {
    let (status, _) = send(
        app,
        request(
            "POST",
            &format!("/tenants/{tenant_id}/join"),
            Some(token),
            None,
        ),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
}

async fn user_id_of(app: &axum::Router, token: &str) -> String {
    let (status, body) = send(app, request("GET", "/auth/me", Some(token), None)).await;
    assert_eq!(status, StatusCode::OK);
    body["data"]["user_id"]
        .as_str()
        .expect("user id should exist")
        .to_owned()
}

async fn create_role(
    app: &axum::Router,
    token: &str,
    tenant_id: &str,
    name: &str,
    permissions: u64,
) -> String {
    let (status, body) = send(
        app,
        request(
            "POST",
            &format!("/tenants/{tenant_id}/roles"),
            Some(token),
            Some(json!({"name": name, "permissions": permissions})),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    body["data"]["id"]
        .as_str()
        .expect("role id should exist")
        .to_owned()
}

async fn assign_role(
    app: &axum::Router,
    token: &str,
    tenant_id: &str,
    role_id: &str,
    user_id: &str,
) {
    let (status, _) = send(
        app,
        request(
            "POST",
            &format!("/tenants/{tenant_id}/roles/{role_id}/members/{user_id}"),
            Some(token),
            None,
        ),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
}

#[tokio::test]
async fn pipeline_stages_reject_in_order_and_role_grants_open_access() {
    let app = test_app();
    let alice = register_and_login(&app, "pipeline_alice").await;
    let bob = register_and_login(&app, "pipeline_bob").await;
    let tenant_id = create_tenant(&app, &alice, "Pipeline Commons").await;

    // Stage one: no credential, then a garbage credential.
    let (status, _) = send(
        &app,
        request("GET", &format!("/tenants/{tenant_id}/channels"), None, None),
    )
    .await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    let (status, _) = send(
        &app,
        request(
            "GET",
            &format!("/tenants/{tenant_id}/channels"),
            Some("not-a-token"),
            None,
        ),
    )
    .await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);

    // Stage two: authenticated but not a member.
    let (status, _) = send(
        &app,
        request(
            "GET",
            &format!("/tenants/{tenant_id}/channels"),
            Some(&bob),
            None,
        ),
    )
    .await;
    assert_eq!(status, StatusCode::FORBIDDEN);

    // Stage three: member without the manage-channels bit.
    join(&app, &bob, &tenant_id).await;
    let (status, _) = send(
        &app,
        request(
            "POST",
            &format!("/tenants/{tenant_id}/channels"),
            Some(&bob),
            Some(json!({"name": "bobs-channel", "kind": "text"})),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::FORBIDDEN);

    // Granting a role flips the outcome immediately; stale cached
    // permissions would keep rejecting here.
    let bob_id = user_id_of(&app, &bob).await;
    let role_id = create_role(
        &app,
        &alice,
        &tenant_id,
        "Builders",
        MANAGE_CHANNELS_BIT | SEND_BIT,
    )
    .await;
    assign_role(&app, &alice, &tenant_id, &role_id, &bob_id).await;

    let (status, body) = send(
        &app,
        request(
            "POST",
            &format!("/tenants/{tenant_id}/channels"),
            Some(&bob),
            Some(json!({"name": "bobs-channel", "kind": "text"})),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["name"], "bobs-channel");
}

#[tokio::test]
async fn channel_overrides_narrow_members_but_never_the_admin_owner() {
    let app = test_app();
    let alice = register_and_login(&app, "override_alice").await;
    let bob = register_and_login(&app, "override_bob").await;
    let tenant_id = create_tenant(&app, &alice, "Override Commons").await;
    let channel_id = default_channel(&app, &alice, &tenant_id).await;
    join(&app, &bob, &tenant_id).await;

    // Bob can post before the override lands.
    let messages_uri = format!("/tenants/{tenant_id}/channels/{channel_id}/messages");
    let (status, _) = send(
        &app,
        request(
            "POST",
            &messages_uri,
            Some(&bob),
            Some(json!({"content": "hello"})),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::OK);

    // Deny send-messages for the default role on this channel.
    let override_uri =
        format!("/tenants/{tenant_id}/channels/{channel_id}/overrides/everyone");
    let (status, _) = send(
        &app,
        request(
            "PUT",
            &override_uri,
            Some(&alice),
            Some(json!({"allow": 0, "deny": SEND_BIT})),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::OK);

    let (status, _) = send(
        &app,
        request(
            "POST",
            &messages_uri,
            Some(&bob),
            Some(json!({"content": "still there?"})),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::FORBIDDEN);

    // The owner holds the admin bit; overrides are bypassed entirely.
    let (status, _) = send(
        &app,
        request(
            "POST",
            &messages_uri,
            Some(&alice),
            Some(json!({"content": "admin says hi"})),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::OK);

    // Bob's channel permission snapshot reflects the narrowing.
    let (status, body) = send(
        &app,
        request(
            "GET",
            &format!("/tenants/{tenant_id}/channels/{channel_id}/permissions"),
            Some(&bob),
            None,
        ),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    let bits = body["data"]["permissions"]
        .as_u64()
        .expect("permission bits should exist");
    assert_eq!(bits & SEND_BIT, 0);

    // Clearing the override restores the tenant base.
    let (status, _) = send(
        &app,
        request(
            "PUT",
            &override_uri,
            Some(&alice),
            Some(json!({"allow": 0, "deny": 0})),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    let (status, _) = send(
        &app,
        request(
            "POST",
            &messages_uri,
            Some(&bob),
            Some(json!({"content": "back again"})),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
}

#[tokio::test]
async fn override_validation_rejects_overlap_and_global_bits() {
    let app = test_app();
    let alice = register_and_login(&app, "validation_alice").await;
    let tenant_id = create_tenant(&app, &alice, "Validation Commons").await;
    let channel_id = default_channel(&app, &alice, &tenant_id).await;
    let override_uri =
        format!("/tenants/{tenant_id}/channels/{channel_id}/overrides/everyone");

    let (status, _) = send(
        &app,
        request(
            "PUT",
            &override_uri,
            Some(&alice),
            Some(json!({"allow": SEND_BIT, "deny": SEND_BIT})),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, _) = send(
        &app,
        request(
            "PUT",
            &override_uri,
            Some(&alice),
            Some(json!({"allow": KICK_BIT, "deny": 0})),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    // A voice-activity bit is fair game.
    let (status, _) = send(
        &app,
        request(
            "PUT",
            &override_uri,
            Some(&alice),
            Some(json!({"allow": CONNECT_VOICE_BIT, "deny": 0})),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
}

#[tokio::test]
async fn message_deletion_allows_author_or_channel_moderator_only() {
    let app = test_app();
    let alice = register_and_login(&app, "delete_alice").await;
    let bob = register_and_login(&app, "delete_bob").await;
    let tenant_id = create_tenant(&app, &alice, "Delete Commons").await;
    let channel_id = default_channel(&app, &alice, &tenant_id).await;
    join(&app, &bob, &tenant_id).await;

    let messages_uri = format!("/tenants/{tenant_id}/channels/{channel_id}/messages");
    let (status, body) = send(
        &app,
        request(
            "POST",
            &messages_uri,
            Some(&alice),
            Some(json!({"content": "owner message"})),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    let message_id = body["data"]["message_id"]
        .as_str()
        .expect("message id should exist")
        .to_owned();
    let message_uri = format!("{messages_uri}/{message_id}");

    // Bob is neither the author nor a moderator.
    let (status, _) = send(&app, request("DELETE", &message_uri, Some(&bob), None)).await;
    assert_eq!(status, StatusCode::FORBIDDEN);

    // Editing stays author-only even for moderators.
    let bob_id = user_id_of(&app, &bob).await;
    let role_id = create_role(&app, &alice, &tenant_id, "Janitors", MANAGE_MESSAGES_BIT).await;
    assign_role(&app, &alice, &tenant_id, &role_id, &bob_id).await;
    let (status, _) = send(
        &app,
        request(
            "PATCH",
            &message_uri,
            Some(&bob),
            Some(json!({"content": "rewritten"})),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::FORBIDDEN);

    // With manage-messages the moderator may delete someone else's message.
    let (status, _) = send(&app, request("DELETE", &message_uri, Some(&bob), None)).await;
    assert_eq!(status, StatusCode::OK);

    // Authors delete their own without any special bit.
    let (status, body) = send(
        &app,
        request(
            "POST",
            &messages_uri,
            Some(&bob),
            Some(json!({"content": "bob message"})),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    let own_message = body["data"]["message_id"].as_str().unwrap().to_owned();
    let (status, _) = send(
        &app,
        request(
            "DELETE",
            &format!("{messages_uri}/{own_message}"),
            Some(&bob),
            None,
        ),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
}

#[tokio::test]
async fn role_hierarchy_limits_edits_to_strictly_lower_positions() {
    let app = test_app();
    let alice = register_and_login(&app, "hierarchy_alice").await;
    let bob = register_and_login(&app, "hierarchy_bob").await;
    let tenant_id = create_tenant(&app, &alice, "Hierarchy Commons").await;
    join(&app, &bob, &tenant_id).await;
    let bob_id = user_id_of(&app, &bob).await;

    // "Stewards" lands just below the owner; "Helpers" below that.
    let stewards = create_role(&app, &alice, &tenant_id, "Stewards", MANAGE_ROLES_BIT).await;
    let helpers = create_role(&app, &alice, &tenant_id, "Helpers", SEND_BIT).await;
    assign_role(&app, &alice, &tenant_id, &stewards, &bob_id).await;

    // Bob may edit the role below his highest position.
    let (status, _) = send(
        &app,
        request(
            "PATCH",
            &format!("/tenants/{tenant_id}/roles/{helpers}"),
            Some(&bob),
            Some(json!({"name": "Renamed Helpers"})),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::OK);

    // His own highest role is not strictly below him.
    let (status, _) = send(
        &app,
        request(
            "PATCH",
            &format!("/tenants/{tenant_id}/roles/{stewards}"),
            Some(&bob),
            Some(json!({"name": "Self Promotion"})),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::FORBIDDEN);

    // Default and owner roles are outside the editable set for everyone.
    let (status, _) = send(
        &app,
        request(
            "PATCH",
            &format!("/tenants/{tenant_id}/roles/everyone"),
            Some(&bob),
            Some(json!({"name": "Nobody"})),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::FORBIDDEN);
    let (status, _) = send(
        &app,
        request(
            "PATCH",
            &format!("/tenants/{tenant_id}/roles/owner"),
            Some(&bob),
            Some(json!({"name": "Usurper"})),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::FORBIDDEN);

    // The default role can never be unassigned.
    let (status, _) = send(
        &app,
        request(
            "DELETE",
            &format!("/tenants/{tenant_id}/roles/everyone/members/{bob_id}"),
            Some(&alice),
            None,
        ),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    // The editable-set listing reflects what Bob saw.
    let (status, body) = send(
        &app,
        request(
            "GET",
            &format!("/tenants/{tenant_id}/roles"),
            Some(&bob),
            None,
        ),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    let editable: Vec<&str> = body["data"]["editable_role_ids"]
        .as_array()
        .expect("editable role ids should exist")
        .iter()
        .filter_map(Value::as_str)
        .collect();
    assert!(editable.contains(&helpers.as_str()));
    assert!(!editable.contains(&stewards.as_str()));
    assert!(!editable.contains(&"everyone"));
    assert!(!editable.contains(&"owner"));
}

#[tokio::test]
async fn moderation_respects_hierarchy_and_bans_block_rejoin() {
    let app = test_app();
    let alice = register_and_login(&app, "mod_alice").await;
    let bob = register_and_login(&app, "mod_bob").await;
    let carol = register_and_login(&app, "mod_carol").await;
    let tenant_id = create_tenant(&app, &alice, "Moderation Commons").await;
    join(&app, &bob, &tenant_id).await;
    join(&app, &carol, &tenant_id).await;
    let alice_id = user_id_of(&app, &alice).await;
    let bob_id = user_id_of(&app, &bob).await;
    let carol_id = user_id_of(&app, &carol).await;

    // No kick bit, no kick.
    let (status, _) = send(
        &app,
        request(
            "DELETE",
            &format!("/tenants/{tenant_id}/members/{carol_id}"),
            Some(&bob),
            None,
        ),
    )
    .await;
    assert_eq!(status, StatusCode::FORBIDDEN);

    // A kick bit alone is not enough against a peer at the same height.
    let moderators = create_role(&app, &alice, &tenant_id, "Moderators", KICK_BIT).await;
    assign_role(&app, &alice, &tenant_id, &moderators, &bob_id).await;
    assign_role(&app, &alice, &tenant_id, &moderators, &carol_id).await;
    let (status, _) = send(
        &app,
        request(
            "DELETE",
            &format!("/tenants/{tenant_id}/members/{carol_id}"),
            Some(&bob),
            None,
        ),
    )
    .await;
    assert_eq!(status, StatusCode::FORBIDDEN);

    // The owner is immune regardless of the actor's bits.
    let (status, _) = send(
        &app,
        request(
            "DELETE",
            &format!("/tenants/{tenant_id}/members/{alice_id}"),
            Some(&bob),
            None,
        ),
    )
    .await;
    assert_eq!(status, StatusCode::FORBIDDEN);

    // The owner bans Bob; Bob loses access and cannot rejoin.
    let (status, _) = send(
        &app,
        request(
            "POST",
            &format!("/tenants/{tenant_id}/members/{bob_id}/ban"),
            Some(&alice),
            None,
        ),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    let (status, _) = send(
        &app,
        request(
            "GET",
            &format!("/tenants/{tenant_id}/channels"),
            Some(&bob),
            None,
        ),
    )
    .await;
    assert_eq!(status, StatusCode::FORBIDDEN);
    let (status, _) = send(
        &app,
        request(
            "POST",
            &format!("/tenants/{tenant_id}/join"),
            Some(&bob),
            None,
        ),
    )
    .await;
    assert_eq!(status, StatusCode::FORBIDDEN);

    // The owner cannot abandon the tenant; members can leave freely.
    let (status, _) = send(
        &app,
        request(
            "POST",
            &format!("/tenants/{tenant_id}/leave"),
            Some(&alice),
            None,
        ),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    let (status, _) = send(
        &app,
        request(
            "POST",
            &format!("/tenants/{tenant_id}/leave"),
            Some(&carol),
            None,
        ),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
}

#[tokio::test]
async fn voice_gate_requires_voice_channel_and_connect_bit() {
    let app = test_app();
    let alice = register_and_login(&app, "voice_alice").await;
    let bob = register_and_login(&app, "voice_bob").await;
    let tenant_id = create_tenant(&app, &alice, "Voice Commons").await;
    let text_channel = default_channel(&app, &alice, &tenant_id).await;
    join(&app, &bob, &tenant_id).await;

    // Text channels never issue voice grants.
    let (status, _) = send(
        &app,
        request(
            "POST",
            &format!("/tenants/{tenant_id}/channels/{text_channel}/voice/join"),
            Some(&bob),
            None,
        ),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, body) = send(
        &app,
        request(
            "POST",
            &format!("/tenants/{tenant_id}/channels"),
            Some(&alice),
            Some(json!({"name": "voice-lounge", "kind": "voice"})),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    let voice_channel = body["data"]["channel_id"].as_str().unwrap().to_owned();
    let voice_uri = format!("/tenants/{tenant_id}/channels/{voice_channel}/voice/join");

    // Default role carries connect-voice and speak but not stream.
    let (status, body) = send(&app, request("POST", &voice_uri, Some(&bob), None)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["can_speak"], true);
    assert_eq!(body["data"]["can_stream"], false);
    assert!(body["data"]["grant_token"].as_str().is_some());

    // Deny connect-voice on the channel and the gate closes.
    let (status, _) = send(
        &app,
        request(
            "PUT",
            &format!("/tenants/{tenant_id}/channels/{voice_channel}/overrides/everyone"),
            Some(&alice),
            Some(json!({"allow": 0, "deny": CONNECT_VOICE_BIT})),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    let (status, _) = send(&app, request("POST", &voice_uri, Some(&bob), None)).await;
    assert_eq!(status, StatusCode::FORBIDDEN);
}
