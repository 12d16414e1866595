use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use thiserror::Error;

use crate::core::gate::Rejection;

/// 单个请求范围内的可恢复错误，只中止当前请求，不影响进程
#[derive(Error, Debug, Clone, PartialEq)]
pub enum GateError {
    #[error("table '{0}' is not in the allow-list")]
    TableNotAllowed(String),

    #[error("schema for '{table}' is unavailable: {reason}")]
    SchemaUnavailable { table: String, reason: String },

    #[error("unknown column '{token}' for table {table}")]
    UnresolvedColumn { table: String, token: String },

    #[error("unsupported operator '{0}'")]
    InvalidOperator(String),

    #[error("invalid value for {op} filter on '{column}': {reason}")]
    InvalidFilterValueShape {
        column: String,
        op: String,
        reason: String,
    },

    #[error("limit {0} out of bounds")]
    InvalidLimit(i64),

    #[error("invalid order_by: {0}")]
    MalformedOrderBy(String),

    #[error("invalid aggregation alias '{0}'")]
    InvalidAlias(String),

    #[error("unsafe SQL: {0}")]
    UnsafeSql(Rejection),

    #[error("malformed payload: {0}")]
    MalformedExternalPayload(String),

    #[error("unknown template '{0}'")]
    TemplateNotFound(String),

    #[error("missing field: {0}")]
    MissingField(String),

    #[error("payload producer failed: {0}")]
    Producer(String),

    #[error("query execution failed: {0}")]
    Execution(String),
}

impl GateError {
    /// 稳定的机器可读错误码，调用方据此区分拒绝原因
    pub fn code(&self) -> &'static str {
        match self {
            GateError::TableNotAllowed(_) => "table_not_allowed",
            GateError::SchemaUnavailable { .. } => "schema_unavailable",
            GateError::UnresolvedColumn { .. } => "unresolved_column",
            GateError::InvalidOperator(_) => "invalid_operator",
            GateError::InvalidFilterValueShape { .. } => "invalid_filter_value",
            GateError::InvalidLimit(_) => "invalid_limit",
            GateError::MalformedOrderBy(_) => "malformed_order_by",
            GateError::InvalidAlias(_) => "invalid_alias",
            GateError::UnsafeSql(_) => "unsafe_sql",
            GateError::MalformedExternalPayload(_) => "malformed_payload",
            GateError::TemplateNotFound(_) => "template_not_found",
            GateError::MissingField(_) => "missing_field",
            GateError::Producer(_) => "producer_failed",
            GateError::Execution(_) => "execution_failed",
        }
    }

    pub fn status(&self) -> StatusCode {
        match self {
            GateError::TableNotAllowed(_) | GateError::UnsafeSql(_) => StatusCode::FORBIDDEN,
            GateError::SchemaUnavailable { .. } => StatusCode::SERVICE_UNAVAILABLE,
            GateError::TemplateNotFound(_) => StatusCode::NOT_FOUND,
            GateError::Producer(_) | GateError::Execution(_) => StatusCode::BAD_GATEWAY,
            _ => StatusCode::BAD_REQUEST,
        }
    }
}

impl IntoResponse for GateError {
    fn into_response(self) -> Response {
        let body = json!({ "error": self.code(), "reason": self.to_string() });
        (self.status(), Json(body)).into_response()
    }
}

pub type Result<T> = std::result::Result<T, GateError>;
