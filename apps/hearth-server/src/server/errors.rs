use axum::{
    http::{header::RETRY_AFTER, StatusCode},
    response::IntoResponse,
    Json,
};

use super::{metrics::record_auth_failure, types::ApiResponse};

/// Domain error taxonomy. Typed at the point of detection and translated
/// exactly once, here, into the wire envelope; anything beyond the generic
/// message goes to server-side logging only.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ApiFailure {
    BadRequest,
    Unauthorized,
    Forbidden,
    NotFound,
    AlreadyExists,
    RateLimited { retry_after_secs: u64 },
    Internal,
}

impl std::fmt::Display for ApiFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{self:?}")
    }
}

impl ApiFailure {
    pub(crate) const fn status(self) -> StatusCode {
        match self {
            Self::BadRequest => StatusCode::BAD_REQUEST,
            Self::Unauthorized => StatusCode::UNAUTHORIZED,
            Self::Forbidden => StatusCode::FORBIDDEN,
            Self::NotFound => StatusCode::NOT_FOUND,
            Self::AlreadyExists => StatusCode::CONFLICT,
            Self::RateLimited { .. } => StatusCode::TOO_MANY_REQUESTS,
            Self::Internal => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    const fn error_code(self) -> &'static str {
        match self {
            Self::BadRequest => "bad_request",
            Self::Unauthorized => "unauthorized",
            Self::Forbidden => "forbidden",
            Self::NotFound => "not_found",
            Self::AlreadyExists => "already_exists",
            Self::RateLimited { .. } => "rate_limited",
            Self::Internal => "internal_error",
        }
    }
}

impl IntoResponse for ApiFailure {
    fn into_response(self) -> axum::response::Response {
        match self {
            Self::Unauthorized => record_auth_failure("unauthorized"),
            Self::Forbidden => record_auth_failure("forbidden"),
            Self::BadRequest
            | Self::NotFound
            | Self::AlreadyExists
            | Self::RateLimited { .. }
            | Self::Internal => {}
        }

        let body = Json(ApiResponse::<()>::failure(self.error_code()));
        if let Self::RateLimited { retry_after_secs } = self {
            return (
                self.status(),
                [(RETRY_AFTER, retry_after_secs.to_string())],
                body,
            )
                .into_response();
        }
        (self.status(), body).into_response()
    }
}

pub fn init_tracing() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));

    tracing_subscriber::fmt()
        .json()
        .with_env_filter(filter)
        .with_current_span(true)
        .with_span_list(true)
        .init();
}
