use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::models::query::Filter;

#[derive(Debug, Deserialize)]
pub struct NlqRequest {
    pub nl: String, // 用户提问内容
    #[serde(default)]
    pub default_table: Option<String>,
    #[serde(default)]
    pub use_llm: bool,
}

#[derive(Debug, Deserialize)]
pub struct RawSqlRequest {
    pub sql: String,
}

/// 报表模板参数：过滤条件与行数，表由模板本身决定
#[derive(Debug, Default, Deserialize)]
pub struct TemplateRequest {
    #[serde(default)]
    pub filters: Vec<Filter>,
    #[serde(default)]
    pub limit: Option<i64>,
}

/// 数仓返回的结果集
#[derive(Debug, Clone, Serialize)]
pub struct QueryResult {
    pub columns: Vec<String>,
    pub rows: Vec<Value>,
}
