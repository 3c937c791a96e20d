use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;
use thiserror::Error;
use uuid::Uuid;

use crate::models::order::OrderStatus;
use crate::store::StoreError;

#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("validation failed: {0}")]
    Validation(String),

    #[error("order {0} not found")]
    OrderNotFound(Uuid),

    #[error("driver {0} not found")]
    DriverNotFound(Uuid),

    #[error("no order with tracking code {0}")]
    UnknownTrackingCode(String),

    #[error("order {0} has already been assigned to another driver")]
    OrderAlreadyAssigned(Uuid),

    #[error("cannot move order from {from} to {to}")]
    InvalidTransition { from: OrderStatus, to: OrderStatus },

    #[error("order {order_id} is {status} and can no longer change")]
    TerminalState { order_id: Uuid, status: OrderStatus },

    #[error("party {actor_id} is not the assigned driver of order {order_id}")]
    NotAssignedDriver { order_id: Uuid, actor_id: Uuid },

    #[error("order {0} needs a verified confirmation code before delivery")]
    ConfirmationRequired(Uuid),

    #[error("confirmation code does not match for order {0}")]
    CodeMismatch(Uuid),

    #[error("driver {driver_id} is not assigned to order {order_id}")]
    DriverNotAssigned { order_id: Uuid, driver_id: Uuid },

    #[error("order {0} is cancelled")]
    OrderCancelled(Uuid),

    #[error("message cannot be empty")]
    EmptyMessage,

    #[error("driver {0} is not available")]
    DriverUnavailable(Uuid),

    #[error("order {order_id} is already paid under reference {reference}")]
    PaymentAlreadyRecorded { order_id: Uuid, reference: String },

    #[error("order {0} kept changing underneath the update")]
    ConcurrentUpdate(Uuid),

    #[error("store unavailable: {0}")]
    StoreUnavailable(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl DispatchError {
    /// Stable machine-readable code for clients.
    pub fn code(&self) -> &'static str {
        match self {
            DispatchError::Validation(_) => "validation_error",
            DispatchError::OrderNotFound(_) => "order_not_found",
            DispatchError::DriverNotFound(_) => "driver_not_found",
            DispatchError::UnknownTrackingCode(_) => "unknown_tracking_code",
            DispatchError::OrderAlreadyAssigned(_) => "order_already_assigned",
            DispatchError::InvalidTransition { .. } => "invalid_transition",
            DispatchError::TerminalState { .. } => "terminal_state",
            DispatchError::NotAssignedDriver { .. } => "not_assigned_driver",
            DispatchError::ConfirmationRequired(_) => "confirmation_required",
            DispatchError::CodeMismatch(_) => "code_mismatch",
            DispatchError::DriverNotAssigned { .. } => "driver_not_assigned",
            DispatchError::OrderCancelled(_) => "order_cancelled",
            DispatchError::EmptyMessage => "empty_message",
            DispatchError::DriverUnavailable(_) => "driver_unavailable",
            DispatchError::PaymentAlreadyRecorded { .. } => "payment_already_recorded",
            DispatchError::ConcurrentUpdate(_) => "concurrent_update",
            DispatchError::StoreUnavailable(_) => "store_unavailable",
            DispatchError::Internal(_) => "internal_error",
        }
    }

    /// Whether the caller may reasonably try the same request again.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            DispatchError::ConfirmationRequired(_)
                | DispatchError::CodeMismatch(_)
                | DispatchError::DriverNotAssigned { .. }
                | DispatchError::EmptyMessage
                | DispatchError::ConcurrentUpdate(_)
                | DispatchError::StoreUnavailable(_)
        )
    }

    fn status_code(&self) -> StatusCode {
        match self {
            DispatchError::Validation(_) | DispatchError::EmptyMessage => StatusCode::BAD_REQUEST,
            DispatchError::OrderNotFound(_)
            | DispatchError::DriverNotFound(_)
            | DispatchError::UnknownTrackingCode(_) => StatusCode::NOT_FOUND,
            DispatchError::NotAssignedDriver { .. } | DispatchError::DriverNotAssigned { .. } => {
                StatusCode::FORBIDDEN
            }
            DispatchError::OrderAlreadyAssigned(_)
            | DispatchError::InvalidTransition { .. }
            | DispatchError::TerminalState { .. }
            | DispatchError::OrderCancelled(_)
            | DispatchError::DriverUnavailable(_)
            | DispatchError::PaymentAlreadyRecorded { .. }
            | DispatchError::ConcurrentUpdate(_) => StatusCode::CONFLICT,
            DispatchError::ConfirmationRequired(_) => StatusCode::PRECONDITION_FAILED,
            DispatchError::CodeMismatch(_) => StatusCode::UNPROCESSABLE_ENTITY,
            DispatchError::StoreUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            DispatchError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl From<StoreError> for DispatchError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::Unavailable(msg) => DispatchError::StoreUnavailable(msg),
            StoreError::OrderNotFound(id) => DispatchError::OrderNotFound(id),
            StoreError::DriverNotFound(id) => DispatchError::DriverNotFound(id),
            other => DispatchError::Internal(other.to_string()),
        }
    }
}

impl IntoResponse for DispatchError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let body = Json(json!({
            "error": self.to_string(),
            "code": self.code(),
        }));

        (status, body).into_response()
    }
}

#[cfg(test)]
mod tests {
    use axum::http::StatusCode;
    use axum::response::IntoResponse;
    use uuid::Uuid;

    use super::DispatchError;
    use crate::store::StoreError;

    #[test]
    fn lost_race_maps_to_conflict() {
        let response = DispatchError::OrderAlreadyAssigned(Uuid::nil()).into_response();
        assert_eq!(response.status(), StatusCode::CONFLICT);
    }

    #[test]
    fn transient_store_failure_is_retryable() {
        let err: DispatchError = StoreError::Unavailable("timeout".to_string()).into();
        assert_eq!(err.code(), "store_unavailable");
        assert!(err.is_retryable());
    }

    #[test]
    fn authorization_misuse_is_not_retryable() {
        let err = DispatchError::NotAssignedDriver {
            order_id: Uuid::nil(),
            actor_id: Uuid::nil(),
        };
        assert!(!err.is_retryable());
        assert_eq!(err.into_response().status(), StatusCode::FORBIDDEN);
    }
}
