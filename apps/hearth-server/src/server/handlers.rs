pub(crate) mod auth;
pub(crate) mod channels;
pub(crate) mod members;
pub(crate) mod messages;
pub(crate) mod roles;
pub(crate) mod tenants;
pub(crate) mod voice;
