pub(crate) mod auth;
pub(crate) mod cache;
pub(crate) mod core;
pub(crate) mod errors;
pub(crate) mod gateway_events;
pub(crate) mod handlers;
pub(crate) mod metrics;
pub(crate) mod permissions;
pub(crate) mod pipeline;
pub(crate) mod ratelimit;
pub(crate) mod realtime;
pub(crate) mod router;
pub(crate) mod types;

pub(crate) use auth::*;
pub(crate) use core::*;
pub use core::AppConfig;
pub use errors::init_tracing;
pub(crate) use errors::*;
pub(crate) use metrics::*;
pub(crate) use permissions::*;
pub(crate) use pipeline::*;
pub(crate) use realtime::*;
pub use router::build_router;
pub(crate) use types::*;
