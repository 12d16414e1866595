use axum::{
    extract::{Path, State},
    Json,
};
use serde_json::{json, Value};
use std::sync::Arc;
use tracing::info;

use crate::ax_state::AppState;
use crate::error::{GateError, Result};
use crate::models::context::{QueryResult, RawSqlRequest, TemplateRequest};
use crate::models::query::{CompiledQuery, QueryIntent};

async fn run(state: &AppState, kind: &str, sql: CompiledQuery) -> Result<Json<Value>> {
    let result: QueryResult = state.warehouse.execute(&sql).await?;
    info!(target: "audit", kind = kind, sql = %sql, rows = result.rows.len(), "query");
    Ok(Json(json!({ "sql": sql, "result": result })))
}

/// 结构化载荷直接编译执行
pub async fn structured_query(
    State(state): State<Arc<AppState>>,
    Json(payload): Json<QueryIntent>,
) -> Result<Json<Value>> {
    let sql = state.engine.compile_from_payload(payload).await?;
    run(&state, "structured", sql).await
}

/// 自由 SQL：只经过安全闸门
pub async fn raw_query(
    State(state): State<Arc<AppState>>,
    Json(req): Json<RawSqlRequest>,
) -> Result<Json<Value>> {
    if req.sql.trim().is_empty() {
        return Err(GateError::MissingField("sql".into()));
    }
    let sql = state.engine.prepare_raw_sql(&req.sql)?;
    run(&state, "raw", sql).await
}

pub async fn template_query(
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
    body: Option<Json<TemplateRequest>>,
) -> Result<Json<Value>> {
    let req = body.map(|Json(r)| r).unwrap_or_default();
    let sql = state.engine.render_template(&name, &req).await?;
    run(&state, "template", sql).await
}

/// 表的当前列 (经过白名单与缓存)
pub async fn table_schema(
    State(state): State<Arc<AppState>>,
    Path(table): Path<String>,
) -> Result<Json<Value>> {
    let columns = state.engine.columns(&table).await?;
    Ok(Json(json!({ "table": table, "columns": columns.as_slice() })))
}

pub async fn reset_schema(State(state): State<Arc<AppState>>) -> Json<Value> {
    state.engine.reset_schema_cache();
    Json(json!({ "status": "cleared" }))
}
