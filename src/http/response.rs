use axum::{
    Json,
    response::{IntoResponse, Response},
};
use serde::Serialize;

use crate::error::EntitlementError;

/// Success envelope: `{"success": true, "data": ..., "message"?: ...}`
///
/// Failures never use this type; they are rendered by
/// [`EntitlementError`]'s own `IntoResponse`.
#[derive(Debug, Serialize)]
pub struct ApiResponse<T: Serialize> {
    pub success: bool,
    pub data: T,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl<T: Serialize> ApiResponse<T> {
    pub fn success(data: T) -> Self {
        Self {
            success: true,
            data,
            message: None,
        }
    }

    /// Success carrying a note for the caller, e.g. a follow-up that failed.
    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }
}

impl<T: Serialize> IntoResponse for ApiResponse<T> {
    fn into_response(self) -> Response {
        Json(self).into_response()
    }
}

/// Handler result: an [`ApiResponse`] or an error status
pub type JsonResponse<T> = Result<ApiResponse<T>, EntitlementError>;
