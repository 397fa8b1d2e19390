//! Response envelope and error-to-status mapping.

use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};

use fleet_autoscale::AutoscaleError;
use fleet_pipeline::PipelineError;
use fleet_registry::{ClusterError, StateError};

/// Response wrapper for consistent API format.
#[derive(serde::Serialize)]
pub(crate) struct ApiResponse<T: serde::Serialize> {
    success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    data: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

impl<T: serde::Serialize> ApiResponse<T> {
    pub(crate) fn ok(data: T) -> Json<Self> {
        Json(Self {
            success: true,
            data: Some(data),
            error: None,
        })
    }
}

pub(crate) fn error_response(msg: &str, status: StatusCode) -> Response {
    (
        status,
        Json(ApiResponse::<()> {
            success: false,
            data: None,
            error: Some(msg.to_string()),
        }),
    )
        .into_response()
}

/// HTTP status for an error raised by a lower crate.
pub(crate) trait HttpStatus: std::fmt::Display {
    fn status(&self) -> StatusCode;

    fn into_error_response(self) -> Response
    where
        Self: Sized,
    {
        error_response(&self.to_string(), self.status())
    }
}

impl HttpStatus for StateError {
    fn status(&self) -> StatusCode {
        match self {
            StateError::NotFound(_) => StatusCode::NOT_FOUND,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl HttpStatus for ClusterError {
    fn status(&self) -> StatusCode {
        if self.is_not_found() {
            return StatusCode::NOT_FOUND;
        }
        match self {
            ClusterError::NodeAlreadyRegistered(_) | ClusterError::InvalidNode(_) => {
                StatusCode::BAD_REQUEST
            }
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl HttpStatus for PipelineError {
    fn status(&self) -> StatusCode {
        if self.is_not_found() {
            StatusCode::NOT_FOUND
        } else if self.is_invalid() {
            StatusCode::BAD_REQUEST
        } else if matches!(self, PipelineError::AppLocked(_)) {
            StatusCode::CONFLICT
        } else {
            StatusCode::INTERNAL_SERVER_ERROR
        }
    }
}

impl HttpStatus for AutoscaleError {
    fn status(&self) -> StatusCode {
        match self {
            e if e.is_invalid() => StatusCode::BAD_REQUEST,
            AutoscaleError::AppNotLocked(_) => StatusCode::CONFLICT,
            AutoscaleError::Pipeline(e) => e.status(),
            AutoscaleError::Cluster(e) => e.status(),
            AutoscaleError::State(e) => e.status(),
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pipeline_errors_map_to_statuses() {
        let not_found = PipelineError::Cluster(ClusterError::ContainerNotFound("c1".to_string()));
        assert_eq!(not_found.status(), StatusCode::NOT_FOUND);
        assert_eq!(
            PipelineError::InvalidRequest("bad".to_string()).status(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            PipelineError::AppLocked("myapp".to_string()).status(),
            StatusCode::CONFLICT
        );
        assert_eq!(PipelineError::NoActions.status(), StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[test]
    fn autoscale_errors_unwrap_to_the_inner_status() {
        assert_eq!(
            AutoscaleError::InvalidRule("ratio".to_string()).status(),
            StatusCode::BAD_REQUEST
        );
        let locked = AutoscaleError::Pipeline(PipelineError::AppLocked("a".to_string()));
        assert_eq!(locked.status(), StatusCode::CONFLICT);
        assert_eq!(AutoscaleError::MissingPlan.status(), StatusCode::INTERNAL_SERVER_ERROR);
    }
}
