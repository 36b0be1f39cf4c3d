use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use thiserror::Error;

use pn_proto::api::ErrorResponse;

#[derive(Debug, Error)]
pub enum RelayError {
    #[error("schema_error")]
    Schema(String),

    #[error("user_not_registered")]
    UserNotRegistered,

    #[error("bundle_not_found")]
    BundleNotFound,

    #[error("recipient_not_registered")]
    RecipientNotRegistered,

    #[error("internal_error")]
    Database(#[from] sqlx::Error),
}

impl RelayError {
    fn status(&self) -> StatusCode {
        match self {
            Self::Schema(_) => StatusCode::BAD_REQUEST,
            Self::UserNotRegistered | Self::BundleNotFound | Self::RecipientNotRegistered => {
                StatusCode::NOT_FOUND
            }
            Self::Database(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn details(&self) -> Option<serde_json::Value> {
        match self {
            Self::Schema(msg) => Some(serde_json::Value::String(msg.clone())),
            _ => None,
        }
    }
}

/// An individual bad request never crashes the relay; it is logged and
/// answered with its error kind.
impl IntoResponse for RelayError {
    fn into_response(self) -> Response {
        if matches!(self, Self::Database(_)) {
            tracing::error!(error = %self, "relay request failed");
        } else {
            tracing::debug!(error = %self, "relay request rejected");
        }
        let body = ErrorResponse { error: self.to_string(), details: self.details() };
        (self.status(), Json(body)).into_response()
    }
}
