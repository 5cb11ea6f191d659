//! HTTP mapping for synchronous failures.

use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};

use crate::error::GenRelayError;
use crate::model::ErrorBody;

impl GenRelayError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::Authentication(_) => StatusCode::UNAUTHORIZED,
            Self::Validation(_) => StatusCode::BAD_REQUEST,
            Self::RateLimited { .. } => StatusCode::TOO_MANY_REQUESTS,
            Self::ProviderConnection { .. }
            | Self::ProviderProtocol { .. }
            | Self::LineTooLong { .. } => StatusCode::BAD_GATEWAY,
            Self::StreamTimeout(_) => StatusCode::GATEWAY_TIMEOUT,
            // shutdown mid-request, or the identity service is down
            Self::Cancelled | Self::Network(_) => StatusCode::SERVICE_UNAVAILABLE,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for GenRelayError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        if status.is_server_error() {
            let code = status.as_u16();
            match &self {
                Self::Cancelled => tracing::debug!(status = code, "request cancelled"),
                Self::StreamTimeout(_) => {
                    tracing::info!(error = %self, status = code, "request timed out")
                }
                _ => tracing::warn!(error = %self, kind = self.kind(), status = code, "request failed"),
            }
        }
        let body = Json(ErrorBody {
            error: self.user_message(),
            kind: self.kind().to_string(),
        });
        (status, body).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn statuses_per_variant() {
        let cases = [
            (GenRelayError::Authentication("x".into()), 401),
            (GenRelayError::Validation("x".into()), 400),
            (
                GenRelayError::RateLimited {
                    provider: "gemini".into(),
                    retry_after: None,
                },
                429,
            ),
            (
                GenRelayError::ProviderConnection {
                    endpoint: "http://h:1".into(),
                },
                502,
            ),
            (GenRelayError::LineTooLong { limit: 1024 }, 502),
            (GenRelayError::StreamTimeout(Duration::from_secs(300)), 504),
            (GenRelayError::Cancelled, 503),
            (GenRelayError::FrameParse("x".into()), 500),
        ];
        for (err, status) in cases {
            assert_eq!(err.status_code().as_u16(), status, "{err:?}");
        }
    }
}
