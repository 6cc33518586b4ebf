use std::{collections::BTreeSet, sync::OnceLock};

use serde::{Deserialize, Serialize};

use crate::validate_op_code;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GatewayOpScope {
    /// Delivered to a single connection (ready, acks, snapshots).
    Connection,
    /// Fanned out to every connection registered under a tenant.
    Tenant,
    /// Delivered to every connection of one user.
    User,
    /// Client-to-server only.
    Ingress,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GatewayOpEntry {
    pub op: &'static str,
    pub scope: GatewayOpScope,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GatewayOpManifest {
    pub ops: Vec<GatewayOpEntry>,
}

const GATEWAY_OPS: &[(&str, GatewayOpScope)] = &[
    ("ready", GatewayOpScope::Connection),
    ("heartbeat_ack", GatewayOpScope::Connection),
    ("presence_sync", GatewayOpScope::Connection),
    ("message_create", GatewayOpScope::Tenant),
    ("message_update", GatewayOpScope::Tenant),
    ("message_delete", GatewayOpScope::Tenant),
    ("member_join", GatewayOpScope::Tenant),
    ("member_leave", GatewayOpScope::Tenant),
    ("member_ban", GatewayOpScope::Tenant),
    ("role_create", GatewayOpScope::Tenant),
    ("role_update", GatewayOpScope::Tenant),
    ("role_delete", GatewayOpScope::Tenant),
    ("role_assign", GatewayOpScope::Tenant),
    ("role_unassign", GatewayOpScope::Tenant),
    ("channel_create", GatewayOpScope::Tenant),
    ("channel_update", GatewayOpScope::Tenant),
    ("channel_delete", GatewayOpScope::Tenant),
    ("channel_override_update", GatewayOpScope::Tenant),
    ("channel_override_delete", GatewayOpScope::Tenant),
    ("presence_update", GatewayOpScope::Tenant),
    ("typing_start", GatewayOpScope::Tenant),
    ("voice_join", GatewayOpScope::Tenant),
    ("voice_leave", GatewayOpScope::Tenant),
    ("member_removed", GatewayOpScope::User),
    ("heartbeat", GatewayOpScope::Ingress),
    ("set_presence", GatewayOpScope::Ingress),
    ("typing", GatewayOpScope::Ingress),
];

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum GatewayOpManifestError {
    #[error("gateway op `{0}` failed identifier validation")]
    InvalidOp(String),
    #[error("duplicate gateway op `{0}` in manifest")]
    DuplicateOp(String),
}

/// Return the gateway op manifest: every op the server emits or accepts,
/// with its delivery scope.
///
/// # Panics
/// Panics if the embedded table is invalid. This is a startup-time
/// invariant and should be prevented by tests.
#[must_use]
pub fn gateway_op_manifest() -> &'static GatewayOpManifest {
    static MANIFEST: OnceLock<GatewayOpManifest> = OnceLock::new();
    MANIFEST.get_or_init(|| {
        let manifest = GatewayOpManifest {
            ops: GATEWAY_OPS
                .iter()
                .map(|(op, scope)| GatewayOpEntry { op, scope: *scope })
                .collect(),
        };
        validate_gateway_op_manifest(&manifest).expect("gateway op manifest must validate");
        manifest
    })
}

fn validate_gateway_op_manifest(
    manifest: &GatewayOpManifest,
) -> Result<(), GatewayOpManifestError> {
    let mut seen = BTreeSet::new();

    for entry in &manifest.ops {
        validate_op_code(entry.op)
            .map_err(|_| GatewayOpManifestError::InvalidOp(entry.op.to_owned()))?;
        if !seen.insert(entry.op) {
            return Err(GatewayOpManifestError::DuplicateOp(entry.op.to_owned()));
        }
    }

    Ok(())
}
