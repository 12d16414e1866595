use chrono::{Local, NaiveDate};
use regex::Regex;
use serde::Serialize;
use std::sync::{Arc, LazyLock};
use tracing::{debug, info, instrument, warn};

use crate::config::Limits;
use crate::core::alias::TableContext;
use crate::core::assembler::{self, AssemblyTrace};
use crate::core::builder::QueryBuilder;
use crate::core::external::{self, PayloadProducer};
use crate::core::gate::{SafetyGate, Verdict};
use crate::core::profiles::Vocabulary;
use crate::core::schema_cache::{ColumnSet, SchemaCache};
use crate::core::templates;
use crate::error::{GateError, Result};
use crate::models::context::TemplateRequest;
use crate::models::query::{CompiledQuery, QueryIntent};

static LIMIT_TOKEN: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"(?i)\blimit\b").unwrap());

/// 文本路径的编译结果
#[derive(Debug, Clone, Serialize)]
pub struct TextCompilation {
    pub payload: QueryIntent,
    pub trace: AssemblyTrace,
    pub sql: CompiledQuery,
}

/// LLM 路径的编译结果，intent/score 由生产方自报
#[derive(Debug, Clone, Serialize)]
pub struct LlmCompilation {
    pub payload: QueryIntent,
    pub intent: Option<String>,
    pub score: Option<f64>,
    pub sql: CompiledQuery,
}

/// 请求到 SQL 的整条流水线。除 schema 缓存外全部是无状态计算，可被任意多个请求并发调用
pub struct QueryEngine {
    vocab: Vocabulary,
    cache: SchemaCache,
    builder: QueryBuilder,
    gate: SafetyGate,
    limits: Limits,
    default_table: String,
    producer: Option<Arc<dyn PayloadProducer>>,
}

impl QueryEngine {
    pub fn new(
        vocab: Vocabulary,
        cache: SchemaCache,
        limits: Limits,
        default_table: impl Into<String>,
        producer: Option<Arc<dyn PayloadProducer>>,
    ) -> Self {
        let gate = SafetyGate::new(cache.allow_list().clone());
        Self {
            vocab,
            cache,
            builder: QueryBuilder::new(limits),
            gate,
            limits,
            default_table: default_table.into(),
            producer,
        }
    }

    /// 白名单校验后的列集合
    pub async fn columns(&self, table: &str) -> Result<ColumnSet> {
        self.cache.get_columns(table).await
    }

    /// 丢弃全部缓存列，下次访问重新拉取
    pub fn reset_schema_cache(&self) {
        self.cache.clear();
        info!("Schema 缓存已清空");
    }

    async fn context(&self, table: &str) -> Result<TableContext<'_>> {
        let columns = self.cache.get_columns(table).await?;
        // 启动时已保证白名单内每张表都有策略记录
        let profile = self
            .vocab
            .profile(table)
            .ok_or_else(|| GateError::TableNotAllowed(table.to_string()))?;
        Ok(TableContext::new(profile, columns))
    }

    pub async fn compile_from_text(&self, text: &str, default_table: Option<&str>) -> Result<TextCompilation> {
        self.compile_from_text_on(text, default_table, Local::now().date_naive())
            .await
    }

    #[instrument(skip(self), fields(text = %text))]
    pub async fn compile_from_text_on(
        &self,
        text: &str,
        default_table: Option<&str>,
        today: NaiveDate,
    ) -> Result<TextCompilation> {
        let fallback = default_table.unwrap_or(&self.default_table);
        let choice = assembler::choose_table(&self.vocab, text, fallback);
        info!(
            "意图 {:?} ({:.2})，选表 {} ({:?})",
            choice.kind, choice.score, choice.table, choice.source
        );

        let ctx = self.context(&choice.table).await?;
        let assembly = assembler::assemble(&ctx, &self.vocab, &self.limits, text, &choice, today);
        debug!("组装结果: {:?}", assembly.trace);

        let sql = self.finish(&assembly.intent, &ctx.columns)?;
        Ok(TextCompilation {
            payload: assembly.intent,
            trace: assembly.trace,
            sql,
        })
    }

    /// 外部结构化载荷：先定表并过白名单，再逐字段解析改写，最后编译
    #[instrument(skip(self, payload), fields(table = %payload.table))]
    pub async fn compile_from_payload(&self, payload: QueryIntent) -> Result<CompiledQuery> {
        let (_, sql) = self.validate_and_build(payload).await?;
        Ok(sql)
    }

    async fn validate_and_build(&self, payload: QueryIntent) -> Result<(QueryIntent, CompiledQuery)> {
        let table = payload.table.trim().to_string();
        if table.is_empty() {
            return Err(GateError::MalformedExternalPayload("payload must name a table".into()));
        }
        if !self.cache.allow_list().contains(&table) {
            warn!("载荷引用了白名单外的表: {}", table);
            return Err(GateError::TableNotAllowed(table));
        }
        let ctx = self.context(&table).await?;
        let payload = QueryIntent { table, ..payload };
        let validated = assembler::validate_external(&ctx, &self.vocab, payload)?;
        let sql = self.finish(&validated, &ctx.columns)?;
        Ok((validated, sql))
    }

    /// LLM 只是另一个载荷生产方：回复经信封解析后走与结构化载荷完全相同的校验
    #[instrument(skip(self), fields(text = %text))]
    pub async fn compile_with_llm(&self, text: &str, default_table: Option<&str>) -> Result<LlmCompilation> {
        let producer = self
            .producer
            .as_ref()
            .ok_or_else(|| GateError::Producer("LLM producer is not configured".into()))?;

        let fallback = default_table.unwrap_or(&self.default_table);
        let choice = assembler::choose_table(&self.vocab, text, fallback);
        let columns = self.cache.get_columns(&choice.table).await?;

        let raw = producer
            .produce(text, &choice.table, &columns)
            .await
            .map_err(|e| GateError::Producer(e.to_string()))?;
        debug!("LLM 原始回复: {}", raw);

        let produced = external::parse_reply(&raw, &choice.table)?;
        let (payload, sql) = self.validate_and_build(produced.payload).await?;
        Ok(LlmCompilation {
            payload,
            intent: produced.intent,
            score: produced.score,
            sql,
        })
    }

    pub fn validate_sql(&self, raw_sql: &str) -> Verdict {
        self.gate.check(raw_sql)
    }

    /// 用户直接提交的 SQL：只过安全闸门，没有 LIMIT 时追加默认行数上限
    pub fn prepare_raw_sql(&self, raw_sql: &str) -> Result<CompiledQuery> {
        if let Verdict::Rejected(rejection) = self.validate_sql(raw_sql) {
            warn!("自由 SQL 被拦截: {}", rejection);
            return Err(GateError::UnsafeSql(rejection));
        }
        let sql = raw_sql.trim();
        if LIMIT_TOKEN.is_match(sql) {
            return Ok(CompiledQuery::new(sql.to_string()));
        }
        Ok(CompiledQuery::new(format!("{} LIMIT {}", sql, self.limits.max_rows_return)))
    }

    #[instrument(skip(self, req))]
    pub async fn render_template(&self, name: &str, req: &TemplateRequest) -> Result<CompiledQuery> {
        let template = templates::find(name)?;
        let columns = self.cache.get_columns(template.table).await?;
        template.render(&self.builder, &self.gate, &columns, &req.filters, req.limit)
    }

    // 构建器之后无条件再过一次安全闸门
    fn finish(&self, intent: &QueryIntent, columns: &[String]) -> Result<CompiledQuery> {
        let sql = self.builder.build(intent, columns)?;
        self.gate.ensure(sql.as_str())?;
        info!("SQL 编译完成: {}", sql);
        Ok(sql)
    }
}
