use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value;
use tracing::debug;

use crate::error::{GateError, Result};
use crate::models::query::QueryIntent;

/// 外部载荷生产方 (LLM)。返回助手的原始文本，解析与校验都在这一侧完成
#[async_trait]
pub trait PayloadProducer: Send + Sync {
    async fn produce(&self, text: &str, table: &str, columns: &[String]) -> anyhow::Result<String>;
}

/// 生产方约定的外层信封 `{payload, intent, score, error}`
#[derive(Debug, Default, Deserialize)]
struct Envelope {
    #[serde(default)]
    payload: Option<Value>,
    #[serde(default)]
    intent: Option<String>,
    #[serde(default)]
    score: Option<f64>,
    #[serde(default)]
    error: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ProducedPayload {
    pub payload: QueryIntent,
    pub intent: Option<String>,
    pub score: Option<f64>,
}

/// 去掉 markdown 代码围栏，再截取第一个 `{` 到最后一个 `}`
fn extract_json(raw: &str) -> Option<&str> {
    let mut body = raw.trim();
    if let Some(rest) = body.strip_prefix("```") {
        body = rest.strip_prefix("json").unwrap_or(rest);
        body = body.trim_end().strip_suffix("```").unwrap_or(body);
    }
    let start = body.find('{')?;
    let end = body.rfind('}')?;
    (start < end).then(|| &body[start..=end])
}

/// 解析生产方回复。缺失的表名由调用方给出的 `fallback_table` 补上
pub fn parse_reply(raw: &str, fallback_table: &str) -> Result<ProducedPayload> {
    let json = extract_json(raw)
        .ok_or_else(|| GateError::MalformedExternalPayload("no JSON object in producer reply".into()))?;
    let envelope: Envelope = serde_json::from_str(json)
        .map_err(|e| GateError::MalformedExternalPayload(format!("invalid JSON: {}", e)))?;

    let payload = match envelope.payload {
        Some(Value::Object(map)) => Value::Object(map),
        Some(Value::Null) | None => {
            let reason = envelope
                .error
                .unwrap_or_else(|| "producer returned no payload".to_string());
            return Err(GateError::MalformedExternalPayload(reason));
        }
        Some(other) => {
            return Err(GateError::MalformedExternalPayload(format!(
                "payload must be an object, got {}",
                other
            )))
        }
    };

    let mut payload: QueryIntent = serde_json::from_value(payload)
        .map_err(|e| GateError::MalformedExternalPayload(format!("payload shape: {}", e)))?;
    if payload.table.trim().is_empty() {
        debug!("载荷缺少表名，使用 {}", fallback_table);
        payload.table = fallback_table.to_string();
    }

    Ok(ProducedPayload {
        payload,
        intent: envelope.intent,
        score: envelope.score,
    })
}
