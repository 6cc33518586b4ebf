use std::{
    collections::{HashMap, HashSet},
    sync::{
        atomic::{AtomicI64, Ordering},
        Arc,
    },
    time::Duration,
};

use anyhow::anyhow;
use hearth_core::{ChannelKind, PermissionSet, PresenceStatus, UserId, Username};
use pasetors::{keys::SymmetricKey, version4::V4};
use rand::{rngs::OsRng, RngCore};
use tokio::sync::{mpsc, watch, RwLock};
use uuid::Uuid;

use super::{
    auth::hash_password,
    cache::TtlCache,
    ratelimit::SlidingWindowLimiter,
};

pub(crate) type ScopeListeners = HashMap<Uuid, mpsc::Sender<String>>;
pub(crate) type ScopeSubscriptions = HashMap<String, ScopeListeners>;

pub const DEFAULT_JSON_BODY_LIMIT_BYTES: usize = 1_048_576;
pub const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 10;
pub const DEFAULT_RATE_LIMIT_REQUESTS_PER_MINUTE: u32 = 60;
pub const ACCESS_TOKEN_TTL_SECS: i64 = 15 * 60;
pub const REFRESH_TOKEN_TTL_SECS: i64 = 30 * 24 * 60 * 60;
pub const DEFAULT_LOGIN_MAX_ATTEMPTS: u32 = 5;
pub const DEFAULT_LOGIN_WINDOW_SECS: u64 = 120;
pub const DEFAULT_LOGIN_COOLDOWN_SECS: u64 = 300;
pub const DEFAULT_LOGIN_SWEEP_INTERVAL_SECS: u64 = 60;
pub const DEFAULT_MESSAGE_MAX_PER_WINDOW: u32 = 5;
pub const DEFAULT_MESSAGE_WINDOW_SECS: u64 = 5;
pub const DEFAULT_MESSAGE_COOLDOWN_SECS: u64 = 15;
pub const DEFAULT_MESSAGE_SWEEP_INTERVAL_SECS: u64 = 30;
pub const DEFAULT_PERMISSION_CACHE_TTL_SECS: u64 = 30;
pub const DEFAULT_PERMISSION_CACHE_SWEEP_INTERVAL_SECS: u64 = 300;
pub const DEFAULT_GATEWAY_OUTBOUND_QUEUE: usize = 256;
pub const DEFAULT_GATEWAY_INGRESS_EVENTS_PER_WINDOW: u32 = 20;
pub const DEFAULT_GATEWAY_INGRESS_WINDOW_SECS: u64 = 10;
pub const DEFAULT_HEARTBEAT_INTERVAL_SECS: u64 = 30;
pub const DEFAULT_HEARTBEAT_MISSED_LIMIT: u32 = 3;
pub const DEFAULT_MAX_GATEWAY_EVENT_BYTES: usize = hearth_protocol::MAX_EVENT_BYTES;
pub const DEFAULT_VOICE_GRANT_TTL_SECS: u64 = 5 * 60;

pub(crate) const LOGIN_LOCK_THRESHOLD: u8 = 5;
pub(crate) const LOGIN_LOCK_SECS: i64 = 30;
pub(crate) const MAX_MESSAGE_CONTENT_BYTES: usize = 2000;
pub(crate) const MAX_HISTORY_LIMIT: usize = 100;
pub(crate) const MAX_TENANT_ROLES: usize = 64;
pub(crate) const MAX_MEMBER_ROLE_ASSIGNMENTS: usize = 16;
pub(crate) const MAX_TENANT_CHANNELS: usize = 128;

/// Fixed id of the always-assigned default role seeded per tenant.
pub(crate) const DEFAULT_ROLE_ID: &str = "everyone";
pub(crate) const OWNER_ROLE_POSITION: i32 = i32::MAX;

#[derive(Clone, Debug)]
pub struct AppConfig {
    pub max_body_bytes: usize,
    pub request_timeout: Duration,
    pub rate_limit_requests_per_minute: u32,
    pub login_max_attempts: u32,
    pub login_window: Duration,
    pub login_cooldown: Duration,
    pub login_sweep_interval: Duration,
    pub message_max_per_window: u32,
    pub message_window: Duration,
    pub message_cooldown: Duration,
    pub message_sweep_interval: Duration,
    pub permission_cache_ttl: Duration,
    pub permission_cache_sweep_interval: Duration,
    pub gateway_outbound_queue: usize,
    pub gateway_ingress_events_per_window: u32,
    pub gateway_ingress_window: Duration,
    pub max_gateway_event_bytes: usize,
    pub heartbeat_interval: Duration,
    pub heartbeat_missed_limit: u32,
    pub voice_grant_ttl: Duration,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            max_body_bytes: DEFAULT_JSON_BODY_LIMIT_BYTES,
            request_timeout: Duration::from_secs(DEFAULT_REQUEST_TIMEOUT_SECS),
            rate_limit_requests_per_minute: DEFAULT_RATE_LIMIT_REQUESTS_PER_MINUTE,
            login_max_attempts: DEFAULT_LOGIN_MAX_ATTEMPTS,
            login_window: Duration::from_secs(DEFAULT_LOGIN_WINDOW_SECS),
            login_cooldown: Duration::from_secs(DEFAULT_LOGIN_COOLDOWN_SECS),
            login_sweep_interval: Duration::from_secs(DEFAULT_LOGIN_SWEEP_INTERVAL_SECS),
            message_max_per_window: DEFAULT_MESSAGE_MAX_PER_WINDOW,
            message_window: Duration::from_secs(DEFAULT_MESSAGE_WINDOW_SECS),
            message_cooldown: Duration::from_secs(DEFAULT_MESSAGE_COOLDOWN_SECS),
            message_sweep_interval: Duration::from_secs(DEFAULT_MESSAGE_SWEEP_INTERVAL_SECS),
            permission_cache_ttl: Duration::from_secs(DEFAULT_PERMISSION_CACHE_TTL_SECS),
            permission_cache_sweep_interval: Duration::from_secs(
                DEFAULT_PERMISSION_CACHE_SWEEP_INTERVAL_SECS,
            ),
            gateway_outbound_queue: DEFAULT_GATEWAY_OUTBOUND_QUEUE,
            gateway_ingress_events_per_window: DEFAULT_GATEWAY_INGRESS_EVENTS_PER_WINDOW,
            gateway_ingress_window: Duration::from_secs(DEFAULT_GATEWAY_INGRESS_WINDOW_SECS),
            max_gateway_event_bytes: DEFAULT_MAX_GATEWAY_EVENT_BYTES,
            heartbeat_interval: Duration::from_secs(DEFAULT_HEARTBEAT_INTERVAL_SECS),
            heartbeat_missed_limit: DEFAULT_HEARTBEAT_MISSED_LIMIT,
            voice_grant_ttl: Duration::from_secs(DEFAULT_VOICE_GRANT_TTL_SECS),
        }
    }
}

#[derive(Clone)]
pub(crate) struct RuntimeConfig {
    pub(crate) gateway_outbound_queue: usize,
    pub(crate) gateway_ingress_events_per_window: u32,
    pub(crate) gateway_ingress_window: Duration,
    pub(crate) max_gateway_event_bytes: usize,
    pub(crate) heartbeat_interval: Duration,
    pub(crate) heartbeat_missed_limit: u32,
    pub(crate) voice_grant_ttl: Duration,
}

#[derive(Clone)]
pub struct AppState {
    pub(crate) users: Arc<RwLock<HashMap<String, UserRecord>>>,
    pub(crate) user_ids: Arc<RwLock<HashMap<String, String>>>,
    pub(crate) sessions: Arc<RwLock<HashMap<String, SessionRecord>>>,
    pub(crate) used_refresh_tokens: Arc<RwLock<HashMap<[u8; 32], String>>>,
    pub(crate) token_key: Arc<SymmetricKey<V4>>,
    pub(crate) dummy_password_hash: Arc<String>,
    pub(crate) tenants: Arc<RwLock<HashMap<String, TenantRecord>>>,
    pub(crate) login_limiter: Arc<SlidingWindowLimiter>,
    pub(crate) message_limiter: Arc<SlidingWindowLimiter>,
    pub(crate) permission_cache: Arc<TtlCache<String, PermissionSet>>,
    pub(crate) subscriptions: Arc<RwLock<ScopeSubscriptions>>,
    pub(crate) connection_senders: Arc<RwLock<HashMap<Uuid, mpsc::Sender<String>>>>,
    pub(crate) connection_controls: Arc<RwLock<HashMap<Uuid, watch::Sender<ConnectionControl>>>>,
    pub(crate) connection_presence: Arc<RwLock<HashMap<Uuid, ConnectionPresence>>>,
    pub(crate) event_seq: Arc<AtomicI64>,
    pub(crate) runtime: Arc<RuntimeConfig>,
}

impl AppState {
    pub(crate) fn new(config: &AppConfig) -> anyhow::Result<Self> {
        let mut key_bytes = [0_u8; 32];
        OsRng.fill_bytes(&mut key_bytes);
        let token_key = SymmetricKey::<V4>::from(&key_bytes)
            .map_err(|e| anyhow!("token key init failed: {e}"))?;
        let dummy_password_hash = hash_password("hearth-dummy-password")?;

        Ok(Self {
            users: Arc::new(RwLock::new(HashMap::new())),
            user_ids: Arc::new(RwLock::new(HashMap::new())),
            sessions: Arc::new(RwLock::new(HashMap::new())),
            used_refresh_tokens: Arc::new(RwLock::new(HashMap::new())),
            token_key: Arc::new(token_key),
            dummy_password_hash: Arc::new(dummy_password_hash),
            tenants: Arc::new(RwLock::new(HashMap::new())),
            login_limiter: SlidingWindowLimiter::start(
                config.login_max_attempts,
                config.login_window,
                config.login_cooldown,
                config.login_sweep_interval,
            ),
            message_limiter: SlidingWindowLimiter::start(
                config.message_max_per_window,
                config.message_window,
                config.message_cooldown,
                config.message_sweep_interval,
            ),
            permission_cache: TtlCache::start(
                config.permission_cache_ttl,
                config.permission_cache_sweep_interval,
            ),
            subscriptions: Arc::new(RwLock::new(HashMap::new())),
            connection_senders: Arc::new(RwLock::new(HashMap::new())),
            connection_controls: Arc::new(RwLock::new(HashMap::new())),
            connection_presence: Arc::new(RwLock::new(HashMap::new())),
            event_seq: Arc::new(AtomicI64::new(0)),
            runtime: Arc::new(RuntimeConfig {
                gateway_outbound_queue: config.gateway_outbound_queue,
                gateway_ingress_events_per_window: config.gateway_ingress_events_per_window,
                gateway_ingress_window: config.gateway_ingress_window,
                max_gateway_event_bytes: config.max_gateway_event_bytes,
                heartbeat_interval: config.heartbeat_interval,
                heartbeat_missed_limit: config.heartbeat_missed_limit,
                voice_grant_ttl: config.voice_grant_ttl,
            }),
        })
    }

    pub(crate) fn next_event_seq(&self) -> i64 {
        self.event_seq.fetch_add(1, Ordering::Relaxed) + 1
    }
}

#[derive(Debug, Clone)]
pub(crate) struct UserRecord {
    pub(crate) id: UserId,
    pub(crate) username: Username,
    pub(crate) password_hash: String,
    pub(crate) locale: String,
    pub(crate) manual_status: Option<PresenceStatus>,
    pub(crate) failed_logins: u8,
    pub(crate) locked_until_unix: Option<i64>,
}

#[derive(Debug, Clone)]
pub(crate) struct SessionRecord {
    pub(crate) user_id: UserId,
    pub(crate) refresh_token_hash: [u8; 32],
    pub(crate) expires_at_unix: i64,
    pub(crate) revoked: bool,
}

#[derive(Debug, Clone)]
pub(crate) struct TenantRecord {
    pub(crate) name: String,
    pub(crate) owner_user_id: UserId,
    pub(crate) invite_required: bool,
    pub(crate) created_at_unix: i64,
    pub(crate) members: HashMap<UserId, MemberRecord>,
    pub(crate) banned_members: HashSet<UserId>,
    pub(crate) roles: HashMap<String, hearth_core::Role>,
    pub(crate) role_assignments: HashMap<UserId, HashSet<String>>,
    pub(crate) channels: HashMap<String, ChannelRecord>,
    pub(crate) next_member_position: i64,
}

#[derive(Debug, Clone)]
pub(crate) struct MemberRecord {
    pub(crate) joined_at_unix: i64,
    pub(crate) position: i64,
}

#[derive(Debug, Clone)]
pub(crate) struct ChannelRecord {
    pub(crate) name: String,
    pub(crate) kind: ChannelKind,
    pub(crate) category: Option<String>,
    pub(crate) position: i32,
    pub(crate) overrides: HashMap<String, OverrideRecord>,
    pub(crate) messages: Vec<MessageRecord>,
}

#[derive(Debug, Clone, Copy, Default)]
pub(crate) struct OverrideRecord {
    pub(crate) allow: PermissionSet,
    pub(crate) deny: PermissionSet,
}

#[derive(Debug, Clone)]
pub(crate) struct MessageRecord {
    pub(crate) id: String,
    pub(crate) author_id: UserId,
    pub(crate) content: String,
    pub(crate) created_at_unix: i64,
    pub(crate) edited_at_unix: Option<i64>,
}

/// Verified identity, produced by pipeline stage one.
#[derive(Debug, Clone)]
pub(crate) struct AuthContext {
    pub(crate) user_id: UserId,
    pub(crate) username: String,
}

/// Identity plus tenant scoping and the effective permission computed for
/// it, produced by pipeline stages two and three and threaded by value into
/// handlers.
#[derive(Debug, Clone)]
pub(crate) struct TenantContext {
    pub(crate) auth: AuthContext,
    pub(crate) tenant_id: String,
    pub(crate) permissions: PermissionSet,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ConnectionControl {
    Open,
    Close,
}

#[derive(Debug, Clone)]
pub(crate) struct ConnectionPresence {
    pub(crate) user_id: UserId,
    pub(crate) tenant_ids: HashSet<String>,
}
