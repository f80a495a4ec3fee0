use axum::{
    Json,
    http::{StatusCode, header},
    response::{IntoResponse, Response},
};
use chrono::Utc;
use serde_json::json;

use crate::constants::AUTH_REALM;

#[derive(Debug, thiserror::Error)]
pub enum ProxyError {
    #[error("missing credentials")]
    MissingAuth,

    #[error("invalid API key")]
    InvalidKey,

    #[error("tenant disabled")]
    TenantDisabled,

    #[error("model {0} not permitted")]
    ModelNotAllowed(String),

    #[error("{0}")]
    LimitExceeded(String),

    #[error("no healthy upstream")]
    NoUpstream,

    #[error("upstream error: {0}")]
    UpstreamError(String),

    #[error("{0}")]
    InvalidRequest(String),

    #[error("{0}")]
    ServiceUnavailable(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl ProxyError {
    /// Stable identifier appearing in response bodies and logs
    pub fn kind(&self) -> &'static str {
        match self {
            ProxyError::MissingAuth => "missing_auth",
            ProxyError::InvalidKey => "invalid_key",
            ProxyError::TenantDisabled => "tenant_disabled",
            ProxyError::ModelNotAllowed(_) => "model_not_allowed",
            ProxyError::LimitExceeded(_) => "limit_exceeded",
            ProxyError::NoUpstream => "no_upstream",
            ProxyError::UpstreamError(_) => "upstream_error",
            ProxyError::InvalidRequest(_) => "invalid_request_error",
            ProxyError::ServiceUnavailable(_) => "service_unavailable",
            ProxyError::Internal(_) => "internal_error",
        }
    }

    pub fn status(&self) -> StatusCode {
        match self {
            ProxyError::MissingAuth | ProxyError::InvalidKey => StatusCode::UNAUTHORIZED,
            ProxyError::TenantDisabled | ProxyError::ModelNotAllowed(_) => StatusCode::FORBIDDEN,
            ProxyError::LimitExceeded(_) => StatusCode::TOO_MANY_REQUESTS,
            ProxyError::NoUpstream | ProxyError::ServiceUnavailable(_) => {
                StatusCode::SERVICE_UNAVAILABLE
            }
            ProxyError::UpstreamError(_) => StatusCode::BAD_GATEWAY,
            ProxyError::InvalidRequest(_) => StatusCode::BAD_REQUEST,
            ProxyError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Render as the proxy's native JSON error body.
    ///
    /// 401 responses carry a WWW-Authenticate challenge.
    pub fn to_proxy_response(&self, request_id: &str) -> Response {
        let status = self.status();
        let body = Json(json!({
            "error": {
                "type": self.kind(),
                "message": self.to_string(),
                "timestamp": Utc::now().to_rfc3339(),
            },
            "requestId": request_id,
        }));

        if status == StatusCode::UNAUTHORIZED {
            (
                status,
                [(
                    header::WWW_AUTHENTICATE,
                    format!("Bearer realm=\"{AUTH_REALM}\", charset=\"UTF-8\""),
                )],
                body,
            )
                .into_response()
        } else {
            (status, body).into_response()
        }
    }

    /// Render as an OpenAI-compatible error body
    pub fn to_openai_response(&self) -> Response {
        (
            self.status(),
            Json(json!({
                "error": {
                    "message": self.to_string(),
                    "type": self.kind(),
                    "code": self.status().as_u16(),
                }
            })),
        )
            .into_response()
    }
}

impl IntoResponse for ProxyError {
    fn into_response(self) -> Response {
        self.to_proxy_response("")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kinds_are_stable() {
        assert_eq!(ProxyError::MissingAuth.kind(), "missing_auth");
        assert_eq!(ProxyError::InvalidKey.kind(), "invalid_key");
        assert_eq!(ProxyError::TenantDisabled.kind(), "tenant_disabled");
        assert_eq!(
            ProxyError::ModelNotAllowed("m".into()).kind(),
            "model_not_allowed"
        );
        assert_eq!(ProxyError::NoUpstream.kind(), "no_upstream");
    }

    #[test]
    fn statuses_match_kinds() {
        assert_eq!(ProxyError::MissingAuth.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(
            ProxyError::ModelNotAllowed("m".into()).status(),
            StatusCode::FORBIDDEN
        );
        assert_eq!(
            ProxyError::LimitExceeded("over".into()).status(),
            StatusCode::TOO_MANY_REQUESTS
        );
        assert_eq!(
            ProxyError::NoUpstream.status(),
            StatusCode::SERVICE_UNAVAILABLE
        );
        assert_eq!(
            ProxyError::UpstreamError("io".into()).status(),
            StatusCode::BAD_GATEWAY
        );
    }
}
