//! 统一错误模型
//! 定义所有错误类型和错误响应格式

use axum::{
    http::StatusCode,
    response::{IntoResponse, Json, Response},
};
use serde::Serialize;
use thiserror::Error;

/// 结果类型别名
pub type Result<T> = std::result::Result<T, AppError>;

/// 应用错误类型
#[derive(Debug, Error)]
pub enum AppError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Already exists: {0}")]
    AlreadyExists(String),

    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Operation cancelled")]
    Cancelled,

    #[error("Timeout: {0}")]
    Timeout(String),

    #[error("Token refresh in progress: {0}")]
    RefreshInProgress(String),

    #[error("Ciphertext authentication failed")]
    Tampered,

    #[error("Invalid key: {0}")]
    InvalidKey(String),

    #[error("Invalid state transition: {0}")]
    InvalidState(String),

    #[error("Service unavailable: {0}")]
    Unavailable(String),

    #[error("Token signature invalid")]
    SignatureInvalid,

    #[error("Token expired")]
    Expired,

    #[error("Token not yet valid")]
    NotYetValid,

    #[error("Unknown key id: {0}")]
    UnknownKid(String),

    #[error("Malformed token claims: {0}")]
    MalformedClaims(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl AppError {
    /// 获取 HTTP 状态码
    pub fn status_code(&self) -> StatusCode {
        match self {
            AppError::InvalidArgument(_) => StatusCode::BAD_REQUEST,
            AppError::NotFound(_) => StatusCode::NOT_FOUND,
            AppError::AlreadyExists(_) | AppError::Conflict(_) => StatusCode::CONFLICT,
            AppError::PermissionDenied(_) => StatusCode::FORBIDDEN,
            AppError::InvalidState(_) => StatusCode::UNPROCESSABLE_ENTITY,
            AppError::Timeout(_) => StatusCode::REQUEST_TIMEOUT,
            AppError::RefreshInProgress(_) | AppError::Unavailable(_) => {
                StatusCode::SERVICE_UNAVAILABLE
            }
            AppError::SignatureInvalid
            | AppError::Expired
            | AppError::NotYetValid
            | AppError::UnknownKid(_)
            | AppError::MalformedClaims(_) => StatusCode::UNAUTHORIZED,
            // 499 Client Closed Request
            AppError::Cancelled => {
                StatusCode::from_u16(499).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR)
            }
            AppError::Tampered
            | AppError::InvalidKey(_)
            | AppError::Database(_)
            | AppError::Config(_)
            | AppError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// 机器可读的错误类别
    pub fn kind(&self) -> &'static str {
        match self {
            AppError::Database(_) | AppError::Config(_) | AppError::Internal(_) => "internal",
            AppError::InvalidArgument(_) => "invalid_argument",
            AppError::NotFound(_) => "not_found",
            AppError::AlreadyExists(_) => "already_exists",
            AppError::PermissionDenied(_) => "permission_denied",
            AppError::Conflict(_) => "conflict",
            AppError::Cancelled => "cancelled",
            AppError::Timeout(_) => "timeout",
            AppError::RefreshInProgress(_) => "refresh_in_progress",
            AppError::Tampered => "tampered",
            AppError::InvalidKey(_) => "invalid_key",
            AppError::InvalidState(_) => "invalid_state",
            AppError::Unavailable(_) => "unavailable",
            AppError::SignatureInvalid => "signature_invalid",
            AppError::Expired => "expired",
            AppError::NotYetValid => "not_yet_valid",
            AppError::UnknownKid(_) => "unknown_kid",
            AppError::MalformedClaims(_) => "malformed_claims",
        }
    }

    /// 获取用户友好的错误消息（不包含敏感信息）
    pub fn user_message(&self) -> String {
        match self {
            AppError::InvalidArgument(msg) => msg.clone(),
            AppError::NotFound(msg) => format!("Resource not found: {}", msg),
            AppError::AlreadyExists(msg) => format!("Already exists: {}", msg),
            AppError::PermissionDenied(msg) => format!("Permission denied: {}", msg),
            AppError::Conflict(msg) => format!("Conflict: {}", msg),
            AppError::Cancelled => "Request cancelled".to_string(),
            AppError::Timeout(msg) => format!("Request timeout: {}", msg),
            AppError::RefreshInProgress(_) => "Token refresh in progress, retry later".to_string(),
            AppError::InvalidState(msg) => msg.clone(),
            AppError::Unavailable(_) => "Upstream service unavailable".to_string(),
            AppError::SignatureInvalid
            | AppError::Expired
            | AppError::NotYetValid
            | AppError::UnknownKid(_)
            | AppError::MalformedClaims(_) => "Invalid token".to_string(),
            AppError::Database(_) => "Database error occurred".to_string(),
            AppError::Config(_) => "Configuration error".to_string(),
            AppError::Tampered | AppError::InvalidKey(_) | AppError::Internal(_) => {
                "Internal server error".to_string()
            }
        }
    }

    /// 获取错误码
    pub fn code(&self) -> u16 {
        self.status_code().as_u16()
    }

    // 便捷方法
    pub fn invalid_argument(msg: impl Into<String>) -> Self {
        AppError::InvalidArgument(msg.into())
    }

    pub fn not_found(msg: impl Into<String>) -> Self {
        AppError::NotFound(msg.into())
    }

    pub fn internal(msg: impl Into<String>) -> Self {
        AppError::Internal(msg.into())
    }

    /// 补偿失败：正向操作与补偿操作均失败
    pub fn compensation_failed(forward: &AppError, compensation: &AppError) -> Self {
        AppError::Internal(format!(
            "compensation failed: forward error: {}; compensation error: {}",
            forward, compensation
        ))
    }

    /// 将驱动错误翻译为领域错误
    ///
    /// 唯一约束冲突 → `AlreadyExists`，序列化失败 → `Conflict`。
    pub fn from_db(err: sqlx::Error, what: &str) -> Self {
        if let sqlx::Error::Database(db_err) = &err {
            match db_err.code().as_deref() {
                Some("23505") => return AppError::AlreadyExists(what.to_string()),
                Some("40001") | Some("40P01") => {
                    return AppError::Conflict(format!("{}: concurrent update", what))
                }
                _ => {}
            }
        }
        AppError::Database(err)
    }
}

/// 错误响应 DTO
#[derive(Serialize)]
pub struct ErrorResponse {
    pub error: ErrorDetail,
}

#[derive(Serialize)]
pub struct ErrorDetail {
    pub code: u16,
    pub kind: &'static str,
    pub message: String,
    pub request_id: String,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let request_id = uuid::Uuid::new_v4().to_string();

        let error_response = ErrorResponse {
            error: ErrorDetail {
                code: self.code(),
                kind: self.kind(),
                message: self.user_message(),
                request_id,
            },
        };

        // 记录错误日志
        tracing::error!(
            code = self.code(),
            kind = self.kind(),
            message = %self,
            request_id = %error_response.error.request_id,
            "Application error"
        );

        (status, Json(error_response)).into_response()
    }
}

/// 从 config::ConfigError 转换
impl From<config::ConfigError> for AppError {
    fn from(e: config::ConfigError) -> Self {
        AppError::Config(e.to_string())
    }
}

/// 从 validator::ValidationErrors 转换
impl From<validator::ValidationErrors> for AppError {
    fn from(e: validator::ValidationErrors) -> Self {
        AppError::InvalidArgument(e.to_string())
    }
}
