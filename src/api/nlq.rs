use axum::{extract::State, Json};
use serde_json::{json, Value};
use std::sync::Arc;
use tracing::info;
use uuid::Uuid;

use crate::ax_state::AppState;
use crate::error::{GateError, Result};
use crate::models::context::NlqRequest;

/// 自然语言查询：启发式或 LLM 生成载荷 -> 编译 -> 执行 -> 审计
pub async fn nlq_query(
    State(state): State<Arc<AppState>>,
    Json(req): Json<NlqRequest>,
) -> Result<Json<Value>> {
    let nl = req.nl.trim();
    if nl.is_empty() {
        return Err(GateError::MissingField("nl".into()));
    }
    let request_id = Uuid::new_v4();
    let default_table = req.default_table.as_deref();

    let (intent, score, payload, trace, sql) = if req.use_llm {
        let out = state.engine.compile_with_llm(nl, default_table).await?;
        (json!(out.intent), json!(out.score), out.payload, Value::Null, out.sql)
    } else {
        let out = state.engine.compile_from_text(nl, default_table).await?;
        (
            json!(out.trace.intent),
            json!(out.trace.score),
            out.payload,
            json!(out.trace),
            out.sql,
        )
    };

    let result = state.warehouse.execute(&sql).await?;
    let payload = json!(payload);

    info!(
        target: "audit",
        request_id = %request_id,
        nl = %nl,
        llm = req.use_llm,
        payload = %payload,
        sql = %sql,
        rows = result.rows.len(),
        "nlq"
    );

    Ok(Json(json!({
        "request_id": request_id,
        "nl": nl,
        "intent": intent,
        "score": score,
        "payload": payload,
        "trace": trace,
        "sql": sql,
        "result": result,
    })))
}
