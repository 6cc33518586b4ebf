#![forbid(unsafe_code)]

use serde::{Deserialize, Serialize};
use ulid::Ulid;

/// Returns the project code name.
#[must_use]
pub const fn project_name() -> &'static str {
    "hearth"
}

/// Fixed id of the tenant owner role. Seeded at tenant creation and
/// identity-protected: never deletable, editable, or reorderable, and
/// excluded from the hierarchy-editable set.
pub const OWNER_ROLE_ID: &str = "owner";

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum DomainError {
    #[error("name is invalid")]
    InvalidName,
    #[error("channel kind is invalid")]
    InvalidChannelKind,
    #[error("username is invalid")]
    InvalidUsername,
    #[error("user id is invalid")]
    InvalidUserId,
    #[error("presence status is invalid")]
    InvalidPresenceStatus,
    #[error("role color is invalid")]
    InvalidRoleColor,
    #[error("allow and deny masks overlap")]
    OverrideMasksOverlap,
    #[error("override contains non-overridable permission bits")]
    OverrideNotChannelScoped,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct UserId(Ulid);

impl UserId {
    #[must_use]
    pub fn new() -> Self {
        Self(Ulid::new())
    }
}

impl Default for UserId {
    fn default() -> Self {
        Self::new()
    }
}

impl TryFrom<String> for UserId {
    type Error = DomainError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        let parsed = Ulid::from_string(&value).map_err(|_| DomainError::InvalidUserId)?;
        Ok(Self(parsed))
    }
}

impl core::fmt::Display for UserId {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Username(String);

impl Username {
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for Username {
    type Error = DomainError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        validate_username(&value)?;
        Ok(Self(value))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TenantName(String);

impl TenantName {
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for TenantName {
    type Error = DomainError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        validate_name(&value, 1, 64)?;
        Ok(Self(value))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ChannelName(String);

impl ChannelName {
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for ChannelName {
    type Error = DomainError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        validate_name(&value, 1, 64)?;
        Ok(Self(value))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RoleName(String);

impl RoleName {
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for RoleName {
    type Error = DomainError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        validate_name(&value, 1, 32)?;
        Ok(Self(value))
    }
}

/// Role display color as `#rrggbb`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RoleColor(String);

impl RoleColor {
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for RoleColor {
    type Error = DomainError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        let Some(hex) = value.strip_prefix('#') else {
            return Err(DomainError::InvalidRoleColor);
        };
        if hex.len() != 6 || !hex.chars().all(|c| c.is_ascii_hexdigit()) {
            return Err(DomainError::InvalidRoleColor);
        }
        Ok(Self(value.to_ascii_lowercase()))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChannelKind {
    Text,
    Voice,
}

impl ChannelKind {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Text => "text",
            Self::Voice => "voice",
        }
    }
}

impl TryFrom<String> for ChannelKind {
    type Error = DomainError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        match value.as_str() {
            "text" => Ok(Self::Text),
            "voice" => Ok(Self::Voice),
            _ => Err(DomainError::InvalidChannelKind),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PresenceStatus {
    Online,
    Idle,
    Dnd,
    Offline,
}

impl PresenceStatus {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Online => "online",
            Self::Idle => "idle",
            Self::Dnd => "dnd",
            Self::Offline => "offline",
        }
    }
}

impl TryFrom<String> for PresenceStatus {
    type Error = DomainError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        match value.as_str() {
            "online" => Ok(Self::Online),
            "idle" => Ok(Self::Idle),
            "dnd" => Ok(Self::Dnd),
            "offline" => Ok(Self::Offline),
            _ => Err(DomainError::InvalidPresenceStatus),
        }
    }
}

/// Permission bit vocabulary. The numeric values are wire contract and must
/// be mirrored exactly by clients.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Permission {
    ManageChannels,
    ManageRoles,
    KickMembers,
    BanMembers,
    ManageMessages,
    SendMessages,
    ConnectVoice,
    Speak,
    Stream,
    Admin,
    ManageInvites,
    ReadMessages,
}

const KNOWN_PERMISSIONS: [Permission; 12] = [
    Permission::ManageChannels,
    Permission::ManageRoles,
    Permission::KickMembers,
    Permission::BanMembers,
    Permission::ManageMessages,
    Permission::SendMessages,
    Permission::ConnectVoice,
    Permission::Speak,
    Permission::Stream,
    Permission::Admin,
    Permission::ManageInvites,
    Permission::ReadMessages,
];

const fn permission_mask(permission: Permission) -> u64 {
    match permission {
        Permission::ManageChannels => 1 << 0,
        Permission::ManageRoles => 1 << 1,
        Permission::KickMembers => 1 << 2,
        Permission::BanMembers => 1 << 3,
        Permission::ManageMessages => 1 << 4,
        Permission::SendMessages => 1 << 5,
        Permission::ConnectVoice => 1 << 6,
        Permission::Speak => 1 << 7,
        Permission::Stream => 1 << 8,
        Permission::Admin => 1 << 9,
        Permission::ManageInvites => 1 << 10,
        Permission::ReadMessages => 1 << 11,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PermissionSet(u64);

impl PermissionSet {
    /// Every known permission bit set.
    pub const ALL: Self = Self((1 << 12) - 1);

    #[must_use]
    pub const fn empty() -> Self {
        Self(0)
    }

    #[must_use]
    pub const fn from_bits(bits: u64) -> Self {
        Self(bits)
    }

    #[must_use]
    pub const fn bits(self) -> u64 {
        self.0
    }

    #[must_use]
    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }

    /// Raw bit test, without the admin bypass. Use [`has_permission`] for
    /// authorization decisions.
    #[must_use]
    pub const fn contains(self, permission: Permission) -> bool {
        self.0 & permission_mask(permission) != 0
    }

    pub fn insert(&mut self, permission: Permission) {
        self.0 |= permission_mask(permission);
    }

    pub fn remove(&mut self, permission: Permission) {
        self.0 &= !permission_mask(permission);
    }

    #[must_use]
    pub const fn union(self, other: Self) -> Self {
        Self(self.0 | other.0)
    }
}

#[must_use]
pub fn known_permission_mask() -> u64 {
    KNOWN_PERMISSIONS
        .into_iter()
        .fold(0_u64, |bits, permission| bits | permission_mask(permission))
}

/// Mask raw client-supplied bits down to known permissions, returning the
/// unknown remainder so callers can reject or log it.
#[must_use]
pub fn mask_permissions(raw_bits: u64) -> (PermissionSet, u64) {
    let mask = known_permission_mask();
    (PermissionSet::from_bits(raw_bits & mask), raw_bits & !mask)
}

/// Permissions that may be adjusted per channel. Tenant-management bits
/// (manage-roles, manage-channels, kick, ban, admin, manage-invites) stay
/// global and are never overridable.
#[must_use]
pub const fn channel_overridable_permissions() -> PermissionSet {
    PermissionSet::from_bits(
        permission_mask(Permission::SendMessages)
            | permission_mask(Permission::ReadMessages)
            | permission_mask(Permission::ManageMessages)
            | permission_mask(Permission::ConnectVoice)
            | permission_mask(Permission::Speak)
            | permission_mask(Permission::Stream),
    )
}

/// True iff `effective` carries `permission`. The admin bit grants every
/// permission unconditionally.
#[must_use]
pub const fn has_permission(effective: PermissionSet, permission: Permission) -> bool {
    if effective.contains(Permission::Admin) {
        return true;
    }
    effective.contains(permission)
}

/// A tenant role. `position` is the hierarchy rank: strictly ordered,
/// higher means more senior. Exactly one role per tenant has `is_default`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Role {
    pub id: String,
    pub name: String,
    pub color: String,
    pub position: i32,
    pub permissions: PermissionSet,
    pub is_default: bool,
}

/// A channel-scoped allow/deny adjustment attached to one role.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelOverride {
    pub role_id: String,
    pub allow: PermissionSet,
    pub deny: PermissionSet,
}

/// Validate an override pair: allow and deny may not claim the same bit,
/// and neither side may reach outside the channel-overridable subset.
///
/// # Errors
/// Returns [`DomainError`] naming the violated rule.
pub fn validate_override(allow: PermissionSet, deny: PermissionSet) -> Result<(), DomainError> {
    if allow.bits() & deny.bits() != 0 {
        return Err(DomainError::OverrideMasksOverlap);
    }
    let overridable = channel_overridable_permissions().bits();
    if allow.bits() & !overridable != 0 || deny.bits() & !overridable != 0 {
        return Err(DomainError::OverrideNotChannelScoped);
    }
    Ok(())
}

/// Base permission for a member: bitwise OR over all assigned role masks.
#[must_use]
pub fn compute_base_permissions(role_permissions: &[PermissionSet]) -> PermissionSet {
    let mut bits = 0;
    for set in role_permissions {
        bits |= set.bits();
    }
    PermissionSet::from_bits(bits)
}

/// Narrow a tenant base permission to one channel.
///
/// Admin bypasses override evaluation entirely and yields the full set.
/// Otherwise every override row whose role the member holds contributes to
/// aggregated allow/deny masks; when both aggregates are zero the base is
/// returned unchanged, else the result is `(base & !deny) | allow`.
#[must_use]
pub fn resolve_channel_permissions(
    base: PermissionSet,
    role_ids: &[String],
    overrides: &[ChannelOverride],
) -> PermissionSet {
    if base.contains(Permission::Admin) {
        return PermissionSet::ALL;
    }

    let mut channel_allow = 0;
    let mut channel_deny = 0;
    for row in overrides {
        if role_ids.iter().any(|role_id| *role_id == row.role_id) {
            channel_allow |= row.allow.bits();
            channel_deny |= row.deny.bits();
        }
    }
    if channel_allow == 0 && channel_deny == 0 {
        return base;
    }

    PermissionSet::from_bits((base.bits() & !channel_deny) | channel_allow)
}

#[must_use]
pub fn has_owner_role(roles: &[Role]) -> bool {
    roles.iter().any(|role| role.id == OWNER_ROLE_ID)
}

/// Highest position among the actor's assigned roles, or zero with none.
#[must_use]
pub fn actor_max_position(roles: &[Role]) -> i32 {
    roles.iter().map(|role| role.position).max().unwrap_or(0)
}

/// True iff the actor may mutate `role` through the role-editing path: the
/// default and owner roles are never editable, and the target must sit
/// strictly below the actor's own maximum position.
#[must_use]
pub fn can_edit_role(actor_max: i32, role: &Role) -> bool {
    if role.is_default || role.id == OWNER_ROLE_ID {
        return false;
    }
    role.position < actor_max
}

/// The set of roles the actor may edit, sorted descending by position for
/// presentation.
#[must_use]
pub fn editable_roles(roles: &[Role], actor_max: i32) -> Vec<Role> {
    let mut editable: Vec<Role> = roles
        .iter()
        .filter(|role| can_edit_role(actor_max, role))
        .cloned()
        .collect();
    editable.sort_by(|a, b| b.position.cmp(&a.position));
    editable
}

fn validate_username(value: &str) -> Result<(), DomainError> {
    if !(3..=32).contains(&value.len()) {
        return Err(DomainError::InvalidUsername);
    }

    if value
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '.')
    {
        return Ok(());
    }

    Err(DomainError::InvalidUsername)
}

fn validate_name(value: &str, min: usize, max: usize) -> Result<(), DomainError> {
    if !(min..=max).contains(&value.len()) {
        return Err(DomainError::InvalidName);
    }

    if value.chars().all(|c| c.is_ascii_graphic() || c == ' ') {
        return Ok(());
    }

    Err(DomainError::InvalidName)
}
