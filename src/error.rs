use axum::{
    extract::rejection::JsonRejection,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use thiserror::Error;

use crate::utils::{error_codes, error_to_api_response};

#[derive(Error, Debug)]
pub enum DiscoveryError {
    #[error("Invalid coordinate: {0}")]
    InvalidCoordinate(String),

    #[error("Invalid radius: {0}")]
    InvalidRadius(f64),

    #[error("Invalid beacon id: {0}")]
    InvalidBeacon(String),

    #[error("Invalid request body: {0}")]
    InvalidRequest(String),

    #[error("Discover mode is not enabled")]
    NotParticipating,

    #[error("User not found: {0}")]
    NotFound(String),

    #[error("Storage unavailable: {0}")]
    StorageUnavailable(String),
}

impl From<sqlx::Error> for DiscoveryError {
    fn from(e: sqlx::Error) -> Self {
        DiscoveryError::StorageUnavailable(e.to_string())
    }
}

// 请求体解析失败也走统一的错误格式
impl From<JsonRejection> for DiscoveryError {
    fn from(rejection: JsonRejection) -> Self {
        DiscoveryError::InvalidRequest(rejection.body_text())
    }
}

impl DiscoveryError {
    /// 客户端可自行修正的错误
    pub fn is_client_error(&self) -> bool {
        !matches!(self, DiscoveryError::StorageUnavailable(_))
    }

    fn status_and_code(&self) -> (StatusCode, i32) {
        match self {
            DiscoveryError::InvalidCoordinate(_)
            | DiscoveryError::InvalidRadius(_)
            | DiscoveryError::InvalidBeacon(_)
            | DiscoveryError::InvalidRequest(_) => {
                (StatusCode::BAD_REQUEST, error_codes::VALIDATION_ERROR)
            }
            DiscoveryError::NotParticipating => {
                (StatusCode::CONFLICT, error_codes::NOT_PARTICIPATING)
            }
            DiscoveryError::NotFound(_) => (StatusCode::NOT_FOUND, error_codes::NOT_FOUND),
            DiscoveryError::StorageUnavailable(_) => (
                StatusCode::SERVICE_UNAVAILABLE,
                error_codes::STORAGE_UNAVAILABLE,
            ),
        }
    }
}

impl IntoResponse for DiscoveryError {
    fn into_response(self) -> Response {
        let (status, code) = self.status_and_code();
        if !self.is_client_error() {
            tracing::error!("Discovery request failed: {}", self);
        }
        let msg = match &self {
            DiscoveryError::NotParticipating => "请先开启发现模式".to_string(),
            DiscoveryError::NotFound(_) => "用户不存在".to_string(),
            // 不把底层存储错误细节暴露给客户端
            DiscoveryError::StorageUnavailable(_) => "服务暂时不可用，请稍后重试".to_string(),
            other => other.to_string(),
        };

        (status, error_to_api_response::<()>(code, msg)).into_response()
    }
}
