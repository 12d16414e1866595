//! OpenAI 兼容的 chat completions 客户端，作为外部载荷生产方。
//! 只负责拼提示词和取回助手文本，解析与校验在 core::external 与 core::assembler。

use anyhow::Context;
use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{debug, instrument};

use crate::config::LlmConfig;
use crate::core::external::PayloadProducer;

const AGGREGATABLE_HINTS: [&str; 7] = ["revenue", "amount", "mrr", "total", "avg", "count", "users"];

const JSON_RULES: &str = "You must respond ONLY with a single valid JSON object (no surrounding text, no code fences).
The JSON object must have keys:
 - payload: object with keys {table, columns, filters, group_by, agg, order_by, limit}
 - intent: short string (e.g. \"trend\", \"topk\", \"select\", \"count\", \"cohort\")
 - score: numeric between 0 and 1 (confidence score)

Rules:
 - Use only the column names provided in the prompt. Do not invent columns.
 - agg maps a result alias to a source column and means SUM(source) AS alias.
 - order_by may reference a column or an alias declared in agg.
 - If you cannot produce a valid payload, return payload=null, intent=\"fail\", score=0.0 and an \"error\" string.";

pub struct OpenAiProducer {
    client: Client,
    config: LlmConfig,
}

#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    temperature: f32,
    messages: Vec<ChatMessage<'a>>,
}

#[derive(Serialize)]
struct ChatMessage<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Deserialize)]
struct ChatChoice {
    message: ChatReply,
}

#[derive(Deserialize)]
struct ChatReply {
    #[serde(default)]
    content: Option<String>,
}

impl OpenAiProducer {
    pub fn new(config: LlmConfig) -> Self {
        Self {
            client: Client::new(),
            config,
        }
    }
}

/// 两个固定示例，保持输出格式稳定
fn few_shot() -> [(&'static str, serde_json::Value); 2] {
    [
        (
            "Show MRR by region for 2025",
            json!({
                "payload": {
                    "table": "gold.mrr",
                    "columns": null,
                    "filters": [{"col": "year", "op": "=", "val": 2025}],
                    "group_by": ["region"],
                    "agg": {"total_revenue_sum": "total_revenue"},
                    "order_by": [{"col": "total_revenue_sum", "dir": "desc"}],
                    "limit": 50
                },
                "intent": "select",
                "score": 0.85
            }),
        ),
        (
            "Top 10 features by unique users",
            json!({
                "payload": {
                    "table": "gold.feature_adoption",
                    "columns": null,
                    "filters": [],
                    "group_by": ["feature_name"],
                    "agg": {"feature_users_sum": "feature_users"},
                    "order_by": [{"col": "feature_users_sum", "dir": "desc"}],
                    "limit": 10
                },
                "intent": "topk",
                "score": 0.9
            }),
        ),
    ]
}

pub fn system_prompt(table: &str, columns: &[String]) -> String {
    let mut parts = vec![
        "You are a strict JSON-outputting assistant that maps natural-language analytics requests to a structured payload."
            .to_string(),
        JSON_RULES.to_string(),
        format!("Table: {}", table),
        format!("Columns: {}", columns.join(", ")),
    ];
    let aggregatable: Vec<&str> = columns
        .iter()
        .filter(|c| {
            let lower = c.to_lowercase();
            AGGREGATABLE_HINTS.iter().any(|h| lower.contains(h))
        })
        .map(String::as_str)
        .collect();
    if !aggregatable.is_empty() {
        parts.push(format!("Typical aggregatable columns: {}", aggregatable.join(", ")));
    }
    parts.push("Examples (NL -> JSON):".to_string());
    for (nl, out) in few_shot() {
        parts.push(format!("NL: {}\nJSON: {}", nl, out));
    }
    parts.join("\n\n")
}

#[async_trait]
impl PayloadProducer for OpenAiProducer {
    #[instrument(skip(self, columns), fields(model = %self.config.model))]
    async fn produce(&self, text: &str, table: &str, columns: &[String]) -> anyhow::Result<String> {
        let system = system_prompt(table, columns);
        let body = ChatRequest {
            model: &self.config.model,
            temperature: self.config.temperature,
            messages: vec![
                ChatMessage {
                    role: "system",
                    content: &system,
                },
                ChatMessage {
                    role: "user",
                    content: text,
                },
            ],
        };

        let url = format!("{}/chat/completions", self.config.base_url.trim_end_matches('/'));
        let response = self
            .client
            .post(&url)
            .bearer_auth(&self.config.api_key)
            .json(&body)
            .send()
            .await
            .context("LLM 请求发送失败")?
            .error_for_status()
            .context("LLM 接口返回错误状态")?;

        let reply: ChatResponse = response.json().await.context("LLM 响应解析失败")?;
        let content = reply
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .context("LLM 响应中没有内容")?;
        debug!("LLM 回复长度 {}", content.len());
        Ok(content)
    }
}
